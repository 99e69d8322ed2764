mod chat;
mod devices;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::fmt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use chuzzi_core::config::{Config, HistoryConfig, LiveConfig, TransformConfig};
use chuzzi_core::conversation_store::{ConversationStore, JsonConversationStore};
use chuzzi_core::types::{ChatMessage, Role};

#[derive(Parser)]
#[command(
    name = "chuzzi",
    about = "Real-time voice conversation with Gemini Live, from the terminal",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a voice conversation (push-to-talk with Enter)
    Chat {
        /// Keep user transcripts as recognized
        #[arg(long)]
        no_transform: bool,

        /// Voice to use for replies
        #[arg(long)]
        voice: Option<String>,
    },

    /// Conversation history
    History {
        #[command(subcommand)]
        action: HistoryAction,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show resolved settings
    Status,
}

#[derive(Subcommand)]
enum HistoryAction {
    /// Print stored messages
    Show {
        /// Only the last N messages
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Delete stored messages
    Clear,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Get a specific config value
    Get { key: String },
    /// Check the configuration for problems
    Validate,
    /// Write a starter config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .map(PathBuf::from)
        .unwrap_or_else(Config::config_path);
    let mut config = Config::load(&config_path)?;

    init_logging(&config, cli.verbose);

    match cli.command {
        Commands::Chat {
            no_transform,
            voice,
        } => {
            if let Some(voice) = voice {
                config.live.get_or_insert_with(Default::default).voice = Some(voice);
            }
            chat::run(&config, chat::ChatOptions { no_transform }).await?;
        }
        Commands::History { action } => {
            let store = JsonConversationStore::new(config.history_path());
            match action {
                HistoryAction::Show { limit } => {
                    let entries = store.load_log().await?;
                    let skip = limit.map_or(0, |n| entries.len().saturating_sub(n));
                    if entries.is_empty() {
                        println!("No conversation history ({})", store.path().display());
                    }
                    for message in entries.iter().skip(skip) {
                        println!("{}", format_message(message));
                    }
                }
                HistoryAction::Clear => {
                    store.clear().await?;
                    println!("Conversation history cleared");
                }
            }
        }
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&config)?;
                println!("{json}");
            }
            ConfigAction::Get { key } => match config.get_path(&key) {
                Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                None => anyhow::bail!("No config value at '{key}'"),
            },
            ConfigAction::Validate => {
                let (warnings, errors) = config.validate();
                for warning in &warnings {
                    println!("warning: {warning}");
                }
                for error in &errors {
                    println!("error: {error}");
                }
                if !errors.is_empty() {
                    anyhow::bail!("{} config error(s) in {}", errors.len(), config_path.display());
                }
                println!("Config OK ({})", config_path.display());
            }
            ConfigAction::Init { force } => {
                if config_path.exists() && !force {
                    anyhow::bail!(
                        "{} already exists (use --force to overwrite)",
                        config_path.display()
                    );
                }
                starter_config().save(&config_path)?;
                println!("Wrote {}", config_path.display());
            }
        },
        Commands::Status => {
            println!("Chuzzi v{}", env!("CARGO_PKG_VERSION"));
            println!("Config: {}", config_path.display());
            println!("Model: {}", config.live_model());
            println!("Voice: {}", config.voice());
            println!(
                "API key: {}",
                if config.api_key().is_some() { "set" } else { "missing" }
            );
            let retry = config.retry();
            println!("Reconnect: {} attempts, {:?} ms", retry.max_attempts, retry.delays_ms);
            println!("Connect timeout: {} ms", config.connect_timeout().as_millis());
            println!(
                "History: {} ({})",
                if config.history_enabled() { "on" } else { "off" },
                config.history_path().display()
            );
            println!(
                "Audio devices: {}",
                if devices::AVAILABLE { "enabled" } else { "not built in" }
            );
        }
    }

    Ok(())
}

/// Every section spelled out with its defaults, key read from the environment.
fn starter_config() -> Config {
    let defaults = Config::default();
    Config {
        live: Some(LiveConfig {
            api_key_env: Some("GEMINI_API_KEY".into()),
            model: Some(defaults.live_model()),
            voice: Some(defaults.voice()),
            connect_timeout_ms: Some(defaults.connect_timeout().as_millis() as u64),
            ..Default::default()
        }),
        retry: Some(defaults.retry()),
        audio: Some(defaults.audio()),
        transform: Some(TransformConfig {
            enabled: true,
            model: Some(defaults.transform_model()),
            timeout_ms: defaults.transform_timeout().as_millis() as u64,
        }),
        history: Some(HistoryConfig {
            enabled: true,
            path: None,
        }),
        logging: None,
    }
}

/// `RUST_LOG` wins, then `logging.level`, then the `--verbose` default.
fn init_logging(config: &Config, verbose: bool) {
    let logging = config.logging.clone().unwrap_or_default();
    let level = logging
        .level
        .clone()
        .unwrap_or_else(|| if verbose { "debug" } else { "info" }.to_string());

    let mut filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));
    for directive in &logging.filters {
        match directive.parse::<tracing_subscriber::filter::Directive>() {
            Ok(directive) => filter = filter.add_directive(directive),
            Err(e) => eprintln!("Ignoring invalid log filter '{directive}': {e}"),
        }
    }

    let registry = tracing_subscriber::registry().with(filter);
    let to_stdout = logging.output == "stdout";
    let result = match (logging.format.as_str(), to_stdout) {
        ("json", true) => registry
            .with(fmt::layer().json().with_writer(std::io::stdout))
            .try_init(),
        ("json", false) => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init(),
        (_, true) => registry
            .with(fmt::layer().with_writer(std::io::stdout))
            .try_init(),
        (_, false) => registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init(),
    };
    if let Err(e) = result {
        eprintln!("Logging already initialized: {e}");
    }
}

pub(crate) fn format_message(message: &ChatMessage) -> String {
    let who = match message.role() {
        Role::User => "You",
        Role::Model => "Gemini",
    };
    format!(
        "[{}] {who}: {}",
        message.timestamp().format("%Y-%m-%d %H:%M"),
        message.text()
    )
}
