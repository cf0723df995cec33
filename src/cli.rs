//! Command-line interface

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use clap_complete::Shell;

/// Secured adapter dispatch - token auth, RBAC, response cache, audit
#[derive(Parser, Debug)]
#[command(name = "toolgate")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "TOOLGATE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "TOOLGATE_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "TOOLGATE_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand
    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Configuration commands
    #[command(subcommand)]
    Config(ConfigCommand),

    /// Token management commands
    #[command(subcommand)]
    Token(TokenCommand),

    /// Dispatch one adapter call through the full pipeline
    Call(CallArgs),

    /// Audit trail commands
    #[command(subcommand)]
    Audit(AuditCommand),

    /// Generate shell completions
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Configuration subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Load the configuration and check it for errors
    Validate,

    /// Print the effective configuration as YAML
    Show,
}

/// Token subcommands
#[derive(Subcommand, Debug)]
pub enum TokenCommand {
    /// Issue a signed token (valid only against this process's store)
    Issue {
        /// Subject to issue for
        #[arg(short, long)]
        subject: String,

        /// Role to grant (repeatable); defaults to the subject's configured roles
        #[arg(short, long = "role")]
        roles: Vec<String>,

        /// Token lifetime (e.g. "30m", "2h"); defaults to auth.`token_ttl`
        #[arg(long)]
        ttl: Option<String>,
    },

    /// Verify a token's signature and print its claims
    Inspect {
        /// The bearer value (`tg_...`)
        #[arg(required = true)]
        token: String,
    },

    /// Generate a random signing secret for auth.`token_secret`
    Secret,
}

/// Arguments for the `call` command
#[derive(Args, Debug)]
pub struct CallArgs {
    /// Instance id or configured adapter name
    #[arg(short, long)]
    pub instance: String,

    /// Adapter operation (e.g. "GET /status", "query")
    #[arg(short, long)]
    pub operation: String,

    /// JSON parameters for the operation
    #[arg(short, long, default_value = "{}")]
    pub params: String,

    /// Subject to log in as
    #[arg(short, long)]
    pub subject: String,

    /// Login secret (supports "`env:VAR_NAME`")
    #[arg(long, default_value = "env:TOOLGATE_CALL_SECRET")]
    pub secret: String,

    /// Print the last N audit events after the call
    #[arg(long, default_value_t = 0)]
    pub tail: usize,
}

/// Audit subcommands
#[derive(Subcommand, Debug)]
pub enum AuditCommand {
    /// Print the last N events from the audit file
    Tail {
        /// Number of events to print
        #[arg(short = 'n', long, default_value_t = 20)]
        count: usize,
    },
}
