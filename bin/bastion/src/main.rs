mod commands;

use bastion_core::Paths;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "bastion")]
#[command(about = "An autonomous agent runtime with policy-gated tools", long_about = None)]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Base directory for config, sessions and audit logs (default ~/.bastion)
    #[arg(long, global = true)]
    home: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a starter configuration and create the workspace
    Init {
        /// Overwrite an existing configuration
        #[arg(long)]
        force: bool,
    },

    /// Show which capabilities load and the state of provider circuits
    Status,

    /// Talk to the agent (interactive mode if no message is given)
    Agent {
        /// Message to send
        #[arg(short, long)]
        message: Option<String>,

        /// User id the messages are attributed to
        #[arg(short, long, default_value = "user")]
        user: String,

        /// Conversation id; the session key is `cli:<chat>`
        #[arg(short, long, default_value = "default")]
        chat: String,
    },

    /// Run every enabled channel until interrupted
    Gateway,

    /// Inspect configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Inspect and call tools through the sandbox
    Tools {
        #[command(subcommand)]
        command: ToolsCommands,
    },

    /// Inspect the access policy
    Policy {
        #[command(subcommand)]
        command: PolicyCommands,
    },

    /// Show audit events
    Audit {
        /// Day to read, YYYY-MM-DD (default today)
        #[arg(long)]
        date: Option<String>,

        /// Only events of this kind (policy_decision, tool_execution, circuit_transition, policy_reload)
        #[arg(long)]
        kind: Option<String>,

        /// Print raw JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts
    Completions {
        /// Shell type (bash, zsh, fish, powershell, elvish)
        shell: String,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Print the effective configuration
    Show,
    /// Load and validate the configuration file
    Validate {
        /// File to check instead of the default config
        path: Option<PathBuf>,
    },
    /// Print the config file location
    Path,
}

#[derive(Subcommand)]
enum ToolsCommands {
    /// List registered tools and their actions
    List,
    /// Invoke a tool the way the agent would
    Call {
        /// Tool name
        name: String,
        /// Parameters as a JSON object
        #[arg(default_value = "{}")]
        params: String,
        /// User id to evaluate policy for, as `cli:<user>`
        #[arg(short, long, default_value = "user")]
        user: String,
    },
}

#[derive(Subcommand)]
enum PolicyCommands {
    /// Evaluate one subject/action pair and explain the verdict
    Check {
        /// Subject as `channel:user`
        subject: String,
        /// Action, e.g. `fs.read`
        action: String,
    },
    /// List rules in evaluation order
    Rules,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    // Logs go to stderr so replies on stdout stay clean.
    let registry = tracing_subscriber::registry().with(filter);
    if cli.log_json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .init();
    }

    let paths = match cli.home {
        Some(base) if base.is_relative() => Paths::with_base(std::env::current_dir()?.join(base)),
        Some(base) => Paths::with_base(base),
        None => Paths::new(),
    };

    match cli.command {
        Commands::Init { force } => {
            commands::init::run(&paths, force).await?;
        }
        Commands::Status => {
            commands::status::run(&paths).await?;
        }
        Commands::Agent {
            message,
            user,
            chat,
        } => {
            commands::agent::run(&paths, message, &user, &chat).await?;
        }
        Commands::Gateway => {
            commands::gateway::run(&paths).await?;
        }
        Commands::Config { command } => match command {
            ConfigCommands::Show => commands::config_cmd::show(&paths).await?,
            ConfigCommands::Validate { path } => {
                commands::config_cmd::validate(&paths, path).await?
            }
            ConfigCommands::Path => commands::config_cmd::path(&paths),
        },
        Commands::Tools { command } => match command {
            ToolsCommands::List => commands::tools_cmd::list(&paths).await?,
            ToolsCommands::Call { name, params, user } => {
                commands::tools_cmd::call(&paths, &name, &params, &user).await?
            }
        },
        Commands::Policy { command } => match command {
            PolicyCommands::Check { subject, action } => {
                commands::policy_cmd::check(&paths, &subject, &action).await?
            }
            PolicyCommands::Rules => commands::policy_cmd::rules(&paths).await?,
        },
        Commands::Audit { date, kind, json } => {
            commands::audit_cmd::run(&paths, date, kind, json).await?;
        }
        Commands::Completions { shell } => {
            commands::completions_cmd::run(&shell)?;
        }
    }

    Ok(())
}
