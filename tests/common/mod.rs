//! Test helpers for end-to-end tests.
//!
//! Builds plugin packages on disk and an extension service over an
//! in-memory store.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;

use dicebridge::config::Config;
use dicebridge::{ChatIdentity, ExtensionService, MemoryStore, Store};

/// Descriptor, command definitions, rulebook and template of the test plugin.
const MAID_DESCRIPTOR: &str = r#"{
    "name": "maid",
    "title": "Maid TRPG",
    "ver": "1.0.0",
    "author": "tester",
    "brief": "Maid RPG rule system"
}"#;

const MAID_REPLY: &str = r#"
[reply.team]
type = "game"
rule = "Maid"
keyword.prefix = ".team"
echo.lua = "team"
limit = { game = true }

[reply.favor]
rule = "Maid"
keyword.prefix = ".favor"
echo.lua = "maid.favor"

[reply.note]
keyword.prefix = ".note"
echo.lua = "note"

[reply.rule]
keyword.prefix = ".maidrule"
echo.lua = "rule"

[reply.party]
keyword.prefix = ".party"
echo.lua = "party"

[reply.echo]
keyword.prefix = ".echo"
echo.lua = "util.echo"

[reply.broken]
keyword.prefix = ".broken"
echo.lua = "broken"
"#;

const MAID_RULEBOOK: &str = "rule: Maid\nmanual:\n  favor: Favor measures the master's affection.\n";

const MAID_TEMPLATE: &str = r#"<model name="Maid"><property>
    <any name="宠爱" alias="Favor" default="5"/>
    <any name="压力" alias="Stress" text="javascript">this.Favor * 2</any>
</property></model>"#;

/// Test host holding the plugin directory and the service.
pub struct TestHost {
    pub dir: TempDir,
    pub service: ExtensionService,
    pub store: Arc<dyn Store>,
}

impl TestHost {
    /// A host with the maid plugin loaded.
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        write_maid_plugin(&dir.path().join("maid"));

        let config = Config::parse(&format!(
            "[extensions]\nplugin_dir = {:?}\n[database]\nbackend = \"memory\"\n",
            dir.path().display().to_string()
        ))
        .unwrap();
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let mut service = ExtensionService::new(&config, Arc::clone(&store)).unwrap();
        assert_eq!(service.initialize(), 1);

        Self {
            dir,
            service,
            store,
        }
    }

    pub fn plugin_root(&self) -> PathBuf {
        self.dir.path().join("maid")
    }

    /// Dispatch a line and return the reply, panicking when nothing matched.
    pub async fn send(&self, identity: &ChatIdentity, line: &str) -> String {
        self.service
            .dispatch(identity, line)
            .await
            .unwrap_or_else(|| panic!("no command for {line:?}"))
    }
}

/// Sender in group `g1`.
pub fn member(user_id: &str) -> ChatIdentity {
    ChatIdentity::new(user_id, "qq", "g1").with_group("g1")
}

pub fn write_file(root: &Path, relative: &str, content: &str) {
    let path = root.join(relative);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

pub fn write_maid_plugin(root: &Path) {
    write_file(root, "descriptor.json", MAID_DESCRIPTOR);
    write_file(root, "reply/maid.toml", MAID_REPLY);
    write_file(root, "rulebook/maid.yaml", MAID_RULEBOOK);
    write_file(root, "template/maid.xml", MAID_TEMPLATE);

    write_file(root, "script/team.lua", "return 'team:' .. msg.suffix");
    write_file(
        root,
        "script/favor.lua",
        r#"local card = msg.char
if not card then
  return "{nick} has no card"
end
return card.name .. " favor " .. tostring(card.Favor)"#,
    );
    write_file(
        root,
        "script/note.lua",
        r#"local count = tonumber(getUserData(msg.uid, "notes") or "0") + 1
setUserData(msg.uid, "notes", count)
setGroupData(msg.gid, "card#" .. msg.uid, msg.suffix)
return "{nick} note " .. count .. ": {card}""#,
    );
    write_file(
        root,
        "script/rule.lua",
        r#"return queryRule(msg.suffix) or "unknown rule""#,
    );
    write_file(
        root,
        "script/party.lua",
        r#"local parts = {}
for _, uid in ipairs(msg.game.pls or {}) do
  local card = getPlayerCard(uid)
  parts[#parts + 1] = uid .. "=" .. (card and card.name or "nil")
end
return table.concat(parts, ",")"#,
    );
    write_file(
        root,
        "script/broken.lua",
        r#"setUserData(msg.uid, "notes", "99")
error("the dice fell off the table")"#,
    );
    write_file(
        root,
        "script/util/echo.lua",
        r#"local team = loadLua("maid.team")
return "echo " .. team(msg)"#,
    );
}
