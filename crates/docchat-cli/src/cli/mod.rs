//! CLI entry and dispatch.

use anyhow::{Context, Result};
use clap::Parser;
use docchat_core::config::{self, paths};
use docchat_core::core::interrupt;
use docchat_core::logging;

mod commands;

#[derive(Parser)]
#[command(name = "docchat")]
#[command(version = "0.1")]
#[command(about = "Chat with a local model and render its markdown and diagram blocks")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Override the system prompt from config
    #[arg(long)]
    system_prompt: Option<String>,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Sends one prompt and streams the reconciled answer
    Exec {
        /// The prompt to send
        #[arg(short, long)]
        prompt: String,

        /// Override the model from config
        #[arg(short, long)]
        model: Option<String>,

        /// Print turn events as JSON lines instead of rendered blocks
        #[arg(long)]
        json: bool,
    },

    /// Interactive chat on stdin (`:q` quits, `:reset` clears history)
    Chat {
        /// Override the model from config
        #[arg(short, long)]
        model: Option<String>,
    },

    /// List built-in models or set the default
    Models {
        /// Model to save as the default
        #[arg(long, value_name = "MODEL")]
        set: Option<String>,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Follow the file-generation timeline of a backend
    Timeline {
        /// Backend URL (overrides `[timeline] url`)
        #[arg(long)]
        url: Option<String>,
    },
}

#[derive(clap::Subcommand)]
enum ConfigCommands {
    /// Show the path to the config file
    Path,
    /// Initialize a default config file (if not present)
    Init,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();

    let _log_guard = match logging::init(&paths::logs_dir()) {
        Ok(guard) => Some(guard),
        Err(e) => {
            eprintln!("Warning: logging disabled: {e:#}");
            None
        }
    };

    interrupt::init()?;

    // one tokio runtime for everything
    let rt = tokio::runtime::Runtime::new().context("create tokio runtime")?;

    rt.block_on(async move { dispatch(cli).await })
}

async fn dispatch(cli: Cli) -> Result<()> {
    let Cli {
        command,
        system_prompt,
    } = cli;

    // Config commands never load the config file.
    let command = match command {
        Some(Commands::Config { command }) => {
            return match command {
                ConfigCommands::Path => {
                    commands::config::path();
                    Ok(())
                }
                ConfigCommands::Init => commands::config::init(),
            };
        }
        other => other,
    };

    let mut config = config::Config::load().context("load config")?;

    if let Some(sp) = system_prompt.as_deref() {
        let trimmed = sp.trim();
        config.system_prompt = (!trimmed.is_empty()).then(|| trimmed.to_string());
        config.system_prompt_file = None;
    }

    // default to chat mode
    let Some(command) = command else {
        return commands::chat::run(&config, None).await;
    };

    match command {
        Commands::Exec {
            prompt,
            model,
            json,
        } => {
            commands::exec::run(commands::exec::ExecRunOptions {
                prompt: &prompt,
                config: &config,
                model_override: model.as_deref(),
                json,
            })
            .await
        }
        Commands::Chat { model } => commands::chat::run(&config, model.as_deref()).await,
        Commands::Models { set } => match set {
            Some(model) => commands::models::set(&model),
            None => {
                commands::models::list(&config);
                Ok(())
            }
        },
        Commands::Timeline { url } => commands::timeline::run(&config, url.as_deref()).await,
        Commands::Config { .. } => Ok(()),
    }
}
