//! End-to-end tests for the extension host.
//!
//! Loads plugin packages from disk and drives them through chat lines.

mod common;

use common::{member, write_file, TestHost};
use dicebridge::{Attributes, Role, GENERIC_SUBCOMMANDS};
use serde_json::json;

fn attrs(value: serde_json::Value) -> Attributes {
    match value {
        serde_json::Value::Object(map) => map,
        _ => Attributes::new(),
    }
}

#[test]
fn test_plugin_loaded_with_generic_subcommands() {
    let host = TestHost::new();

    let summaries = host.service.list_plugins();
    assert_eq!(summaries.len(), 1);
    assert_eq!(summaries[0].name, "maid");
    assert_eq!(summaries[0].title, "Maid TRPG");
    assert_eq!(summaries[0].command_count, 7);

    let names = host.service.command_names();
    for sub in GENERIC_SUBCOMMANDS {
        assert!(names.contains(&format!("team.{sub}")), "missing team.{sub}");
    }
    assert!(host.service.has_script("maid.util.echo"));
    assert!(host.service.has_script("util.echo"));
}

#[tokio::test]
async fn test_subcommand_name_reinjected() {
    let host = TestHost::new();
    let user = member("u1");

    assert_eq!(host.send(&user, ".team show Alice").await, "team:show Alice");
    assert_eq!(host.send(&user, ".team del").await, "team:del");
    assert_eq!(host.send(&user, ".team roll Alice").await, "team:roll Alice");
    assert_eq!(host.send(&user, ".team").await, "team:");
}

#[tokio::test]
async fn test_script_loads_another_script() {
    let host = TestHost::new();
    assert_eq!(host.send(&member("u1"), ".echo hi").await, "echo team:hi");
}

#[tokio::test]
async fn test_alias_resolves_to_display_name() {
    let host = TestHost::new();
    host.service
        .create_character("u1", "qq", "Alice", "Maid")
        .await
        .unwrap();

    assert_eq!(host.send(&member("u1"), ".favor").await, "Alice favor 5");

    host.service
        .characters()
        .create_card("u2", "qq", "Bea", "Maid", attrs(json!({"宠爱": 5, "Favor": 1})))
        .await
        .unwrap();
    assert_eq!(host.send(&member("u2"), ".favor").await, "Bea favor 1");
}

#[tokio::test]
async fn test_missing_card_falls_back_to_nick() {
    let host = TestHost::new();
    let user = member("u3").with_username("Kai");
    assert_eq!(host.send(&user, ".favor").await, "Kai has no card");
}

#[tokio::test]
async fn test_storage_writes_flushed_before_placeholders() {
    let host = TestHost::new();
    let user = member("u1").with_username("Kai");

    assert_eq!(host.send(&user, ".note HP 10").await, "Kai note 1: HP 10");
    assert_eq!(host.send(&user, ".note HP 8").await, "Kai note 2: HP 8");

    assert_eq!(
        host.store.get_user_data("u1", "notes").await.unwrap(),
        Some(json!("2"))
    );
    assert_eq!(
        host.store.get_group_data("g1", "card#u1").await.unwrap(),
        Some(json!("HP 8"))
    );
}

#[tokio::test]
async fn test_script_error_becomes_reply() {
    let host = TestHost::new();
    let reply = host.send(&member("u1"), ".broken").await;

    assert!(reply.starts_with("[error] "), "{reply}");
    assert!(reply.contains("the dice fell off the table"));
    assert!(!reply.contains('\n'));
    assert_eq!(host.store.get_user_data("u1", "notes").await.unwrap(), None);
}

#[tokio::test]
async fn test_rule_lookup_from_script() {
    let host = TestHost::new();
    let user = member("u1");
    assert_eq!(
        host.send(&user, ".maidrule favor").await,
        "Favor measures the master's affection."
    );
    assert_eq!(host.send(&user, ".maidrule nothing").await, "unknown rule");
}

#[tokio::test]
async fn test_teammates_prefetched_for_players_with_cards() {
    let host = TestHost::new();
    host.service
        .create_character("A", "qq", "Alice", "Maid")
        .await
        .unwrap();

    let sessions = host.service.sessions();
    let mut game = sessions.create_session("qq", "g1", Some("campaign")).await.unwrap();
    sessions.add_participant(&mut game, Role::Gm, "gm").await.unwrap();
    sessions.add_participant(&mut game, Role::Player, "A").await.unwrap();
    sessions.add_participant(&mut game, Role::Player, "B").await.unwrap();

    assert_eq!(host.send(&member("gm"), ".party").await, "A=Alice,B=nil");
}

#[tokio::test]
async fn test_corrupted_card_blob_is_a_miss() {
    let host = TestHost::new();
    let characters = host.service.characters();
    characters
        .create_card("A", "qq", "Alice", "Maid", Attributes::new())
        .await
        .unwrap();
    characters.bind_card("A", "qq", "g1", None).await.unwrap();
    host.store
        .set_group_data("g1", "player_card#X", &json!("{ [[ not a table"))
        .await
        .unwrap();

    let sessions = host.service.sessions();
    let mut game = sessions.create_session("qq", "g1", None).await.unwrap();
    sessions.add_participant(&mut game, Role::Player, "X").await.unwrap();
    sessions.add_participant(&mut game, Role::Player, "A").await.unwrap();

    assert_eq!(host.send(&member("gm"), ".party").await, "X=nil,A=Alice");
}

#[tokio::test]
async fn test_deleted_card_not_served_from_cache() {
    let host = TestHost::new();
    let characters = host.service.characters();
    characters
        .create_card("A", "qq", "Alice", "Maid", Attributes::new())
        .await
        .unwrap();
    characters.bind_card("A", "qq", "g1", None).await.unwrap();

    let sessions = host.service.sessions();
    let mut game = sessions.create_session("qq", "g1", None).await.unwrap();
    sessions.add_participant(&mut game, Role::Player, "A").await.unwrap();
    assert_eq!(host.send(&member("gm"), ".party").await, "A=Alice");

    assert!(characters.delete_card("A", "qq", "Alice").await.unwrap());
    assert_eq!(host.send(&member("gm"), ".party").await, "A=nil");
}

#[tokio::test]
async fn test_reload_picks_up_changed_script() {
    let mut host = TestHost::new();
    let commands = host.service.command_names();
    let user = member("u1");

    write_file(&host.plugin_root(), "script/team.lua", "return 'squad:' .. msg.suffix");
    host.service.reload_plugin("maid").unwrap();

    assert_eq!(host.service.command_names(), commands);
    assert_eq!(host.send(&user, ".team list").await, "squad:list");
}

#[tokio::test]
async fn test_unload_removes_commands() {
    let mut host = TestHost::new();
    assert!(host.service.unload_plugin("maid"));
    assert_eq!(host.service.dispatch(&member("u1"), ".team").await, None);
    assert!(host.service.query_rule_any("favor").is_none());
}

#[tokio::test]
async fn test_second_plugin_isolated_from_broken_one() {
    let host = TestHost::new();
    let mut service = host.service;

    write_file(&host.dir.path().join("bad"), "descriptor.json", r#"{"title": "no name"}"#);
    write_file(
        &host.dir.path().join("coc"),
        "descriptor.toml",
        "name = \"coc\"\nversion = \"0.1\"\n",
    );
    write_file(
        &host.dir.path().join("coc"),
        "reply/coc.toml",
        "[reply.sc]\necho.lua = \"sc\"\n",
    );
    write_file(&host.dir.path().join("coc"), "script/sc.lua", "return 'sanity check'");

    assert_eq!(service.initialize(), 2);
    assert_eq!(
        service.dispatch(&member("u1"), ".sc").await.as_deref(),
        Some("sanity check")
    );
    assert_eq!(service.list_plugins().len(), 2);
}
