//! Toolgate - secured adapter dispatch
//!
//! Authenticates, authorizes, caches, invokes, and audits every adapter call
//! through one fixed pipeline.

use std::io;
use std::path::Path;
use std::process::ExitCode;

use clap::{CommandFactory, Parser};
use clap_complete::generate;
use serde_json::Value;
use tracing::info;

use toolgate::{
    auth::TokenStore,
    cli::{AuditCommand, CallArgs, Cli, Command, ConfigCommand, TokenCommand},
    config::{Config, humantime_serde, resolve_env_ref},
    dispatch::{CacheStatus, Dispatcher, ToolCall},
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Command::Config(cmd) => run_config_command(cmd, cli.config.as_deref()),
        Command::Token(cmd) => run_token_command(cmd, cli.config.as_deref()),
        Command::Call(args) => run_call(cli.config.as_deref(), args).await,
        Command::Audit(cmd) => run_audit_command(cmd, cli.config.as_deref()),
        Command::Completions { shell } => {
            generate(shell, &mut Cli::command(), "toolgate", &mut io::stdout());
            ExitCode::SUCCESS
        }
    }
}

/// Load and validate configuration, reporting failures to stderr
fn load_config(path: Option<&Path>) -> Option<Config> {
    let config = match Config::load(path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ Failed to load configuration: {e}");
            return None;
        }
    };
    if let Err(e) = config.validate() {
        eprintln!("❌ Invalid configuration: {e}");
        return None;
    }
    Some(config)
}

/// Build a token store from the configured signing secret
fn open_store(config: &Config) -> Option<TokenStore> {
    match TokenStore::new(
        config.auth.resolve_secret().as_bytes(),
        config.auth.token_ttl,
    ) {
        Ok(store) => Some(store),
        Err(e) => {
            eprintln!("❌ {e}");
            None
        }
    }
}

/// Run configuration commands
fn run_config_command(cmd: ConfigCommand, path: Option<&Path>) -> ExitCode {
    match cmd {
        ConfigCommand::Validate => {
            let Some(config) = load_config(path) else {
                return ExitCode::FAILURE;
            };
            println!("✅ Configuration valid");
            println!("   Subjects: {}", config.auth.subjects.len());
            println!("   Roles: {}", config.authz.roles.len());
            println!("   Adapters: {}", config.adapters.len());
            ExitCode::SUCCESS
        }

        ConfigCommand::Show => match Config::load(path) {
            Ok(config) => match serde_yaml::to_string(&config) {
                Ok(yaml) => {
                    println!("{yaml}");
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("❌ Failed to serialize: {e}");
                    ExitCode::FAILURE
                }
            },
            Err(e) => {
                eprintln!("❌ Failed to load configuration: {e}");
                ExitCode::FAILURE
            }
        },
    }
}

/// Run token management commands
fn run_token_command(cmd: TokenCommand, config_path: Option<&Path>) -> ExitCode {
    match cmd {
        TokenCommand::Secret => {
            // No configuration needed; print a fresh secret for auth.token_secret
            use rand::RngExt;
            let random_bytes: [u8; 32] = rand::rng().random();
            println!(
                "{}",
                base64::Engine::encode(
                    &base64::engine::general_purpose::URL_SAFE_NO_PAD,
                    random_bytes
                )
            );
            ExitCode::SUCCESS
        }

        TokenCommand::Issue {
            subject,
            roles,
            ttl,
        } => {
            let Some(config) = load_config(config_path) else {
                return ExitCode::FAILURE;
            };
            let Some(store) = open_store(&config) else {
                return ExitCode::FAILURE;
            };

            let roles = if roles.is_empty() {
                config
                    .auth
                    .subjects
                    .iter()
                    .find(|s| s.name == subject)
                    .map(|s| s.roles.clone())
                    .unwrap_or_default()
            } else {
                roles
            };

            let ttl = match ttl {
                Some(raw) => match humantime_serde::parse_duration(&raw) {
                    Some(d) => d,
                    None => {
                        eprintln!("❌ Invalid ttl: {raw}");
                        return ExitCode::FAILURE;
                    }
                },
                None => config.auth.token_ttl,
            };

            match store.issue(&subject, &roles, ttl) {
                Ok(issued) => {
                    println!(
                        "✅ Issued {} (subject {}, roles [{}])",
                        issued.id,
                        issued.subject,
                        issued.roles.join(", ")
                    );
                    println!("{}", issued.token);
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("❌ Failed to issue: {e}");
                    ExitCode::FAILURE
                }
            }
        }

        TokenCommand::Inspect { token } => {
            let Some(config) = load_config(config_path) else {
                return ExitCode::FAILURE;
            };
            let Some(store) = open_store(&config) else {
                return ExitCode::FAILURE;
            };
            match store.inspect(&token) {
                Ok(claims) => {
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&claims).unwrap_or_default()
                    );
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("❌ Invalid token: {e}");
                    ExitCode::FAILURE
                }
            }
        }
    }
}

/// Dispatch one adapter call through the full pipeline
async fn run_call(config_path: Option<&Path>, args: CallArgs) -> ExitCode {
    let params: Value = match serde_json::from_str(&args.params) {
        Ok(v) => v,
        Err(e) => {
            eprintln!("❌ Invalid JSON parameters: {e}");
            return ExitCode::FAILURE;
        }
    };

    let Some(config) = load_config(config_path) else {
        return ExitCode::FAILURE;
    };

    let dispatcher = match Dispatcher::from_config(&config).await {
        Ok(d) => d,
        Err(e) => {
            eprintln!("❌ Failed to build pipeline: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        instance = %args.instance,
        operation = %args.operation,
        "Dispatching call"
    );

    let login = dispatcher
        .dispatch(
            None,
            ToolCall::Login {
                subject: args.subject.clone(),
                secret: resolve_env_ref(&args.secret),
            },
        )
        .await;
    let token = match login {
        Ok(outcome) => outcome.body["token"]
            .as_str()
            .unwrap_or_default()
            .to_string(),
        Err(e) => {
            eprintln!("❌ Login failed: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = dispatcher
        .dispatch(
            Some(&token),
            ToolCall::ExecuteAdapter {
                instance: args.instance,
                operation: args.operation,
                params,
            },
        )
        .await;

    let code = match result {
        Ok(outcome) => {
            let cache = match outcome.cache {
                CacheStatus::Hit => "hit",
                CacheStatus::Miss => "miss",
                CacheStatus::Bypass => "bypass",
            };
            println!("✅ Status {} (cache {})", outcome.status, cache);
            println!(
                "{}",
                serde_json::to_string_pretty(&outcome.body).unwrap_or_default()
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("❌ Call failed: {e}");
            ExitCode::FAILURE
        }
    };

    if args.tail > 0 {
        println!("\nRecent audit events:");
        for event in dispatcher.audit().recent(args.tail) {
            println!("  {}", serde_json::to_string(&event).unwrap_or_default());
        }
    }

    dispatcher.shutdown().await;
    code
}

/// Run audit trail commands
fn run_audit_command(cmd: AuditCommand, config_path: Option<&Path>) -> ExitCode {
    match cmd {
        AuditCommand::Tail { count } => {
            let Some(config) = load_config(config_path) else {
                return ExitCode::FAILURE;
            };
            let Some(path) = config.audit.path else {
                eprintln!("❌ audit tail needs the file sink (set audit.sink: file and audit.path)");
                return ExitCode::FAILURE;
            };
            match std::fs::read_to_string(&path) {
                Ok(contents) => {
                    let lines: Vec<&str> = contents.lines().collect();
                    let start = lines.len().saturating_sub(count);
                    for line in &lines[start..] {
                        println!("{line}");
                    }
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("❌ Failed to read {path}: {e}");
                    ExitCode::FAILURE
                }
            }
        }
    }
}
