use std::io::Write;

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};

use dicebridge::{ChatIdentity, Config, ExtensionService};

const DEFAULT_CONFIG: &str = "config.toml";

fn main() {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG.to_string());

    // Load configuration
    let config = match Config::load_with_env(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load {config_path}: {e}");
            eprintln!("Using default configuration.");
            let mut config = Config::default();
            config.apply_env_overrides();
            config
        }
    };

    // Initialize logging
    if let Err(e) = dicebridge::logging::init(&config.logging) {
        eprintln!("Failed to initialize logging: {e}");
        dicebridge::logging::init_console_only(&config.logging.level);
    }

    if let Err(e) = config.validate() {
        error!("{}", e);
        std::process::exit(1);
    }

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            error!("Failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };

    let local = tokio::task::LocalSet::new();
    if let Err(e) = local.block_on(&runtime, run(config)) {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run(config: Config) -> dicebridge::Result<()> {
    let store = dicebridge::store::open(&config.database).await?;
    let mut service = ExtensionService::new(&config, store)?;

    info!("dicebridge - rule-system plugin host");
    let loaded = service.initialize();
    info!(
        plugins = loaded,
        commands = service.command_names().len(),
        "Ready; type chat lines, or :help"
    );

    let identity = ChatIdentity::new("console", "console", "console").with_username("console");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    prompt();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line == ":quit" {
            break;
        }
        if let Some(admin) = line.strip_prefix(':') {
            println!("{}", admin_command(&mut service, admin));
        } else if !line.is_empty() {
            match service.dispatch(&identity, line).await {
                Some(reply) => println!("{reply}"),
                None => println!("(no command)"),
            }
        }
        prompt();
    }
    Ok(())
}

/// Operator commands: `:plugins`, `:plugin <name>`, `:reload <name>`, `:rule <keyword>`.
fn admin_command(service: &mut ExtensionService, input: &str) -> String {
    let (command, arg) = match input.split_once(char::is_whitespace) {
        Some((command, arg)) => (command, arg.trim()),
        None => (input, ""),
    };

    match command {
        "plugins" => {
            let plugins = service.list_plugins();
            if plugins.is_empty() {
                return "no plugins loaded".to_string();
            }
            plugins
                .iter()
                .map(|summary| format!("{}: {}", summary.name, summary))
                .collect::<Vec<_>>()
                .join("\n")
        }
        "plugin" => match service.get_plugin(arg) {
            Some(plugin) => format!(
                "{}\n  path: {}\n  rules: {}\n  commands: {}",
                plugin.summary(),
                plugin.path.display(),
                plugin.rule_systems.join(", "),
                plugin.registered_commands.join(", ")
            ),
            None => format!("plugin '{arg}' not found"),
        },
        "reload" => match service.reload_plugin(arg) {
            Ok(summary) => format!("reloaded {summary}"),
            Err(e) => format!("reload failed: {e}"),
        },
        "rule" => match service.query_rule_any(arg) {
            Some((system, text)) => format!("[{system}] {text}"),
            None => format!("no rule for '{arg}'"),
        },
        _ => ":plugins | :plugin <name> | :reload <name> | :rule <keyword> | :quit".to_string(),
    }
}

fn prompt() {
    print!("> ");
    let _ = std::io::stdout().flush();
}
