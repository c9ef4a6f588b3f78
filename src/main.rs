use anyhow::Context;
use cdc_relay::control::{ControlClient, ControlRequest, ControlResponse};
use cdc_relay::postgres::audit::audit_trigger_ddl;
use cdc_relay::subscription::StatusStore;
use cdc_relay::{Config, Engine, Error, ErrorKind, TableRef};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "cdc-relay", version)]
#[command(about = "Change-data-capture replication between datastores", long_about = None)]
struct Cli {
    #[arg(short, long, value_name = "FILE", default_value = "config.toml", global = true)]
    config: PathBuf,

    #[arg(short, long, help = "Enable JSON output for logs", global = true)]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging", global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the engine and its control endpoint until Ctrl-C or SIGTERM
    Serve,
    /// Control a subscription of the running daemon
    Subscription {
        #[command(subcommand)]
        action: SubscriptionAction,
    },
    /// Connect to every datastore and validate every channel's mappings
    Validate,
    /// List the dead-letter records of a subscription
    DeadLetters {
        subscription: String,
        /// Re-apply the records in capture order instead of listing them
        #[arg(long)]
        replay: bool,
    },
    /// Print the audit table and trigger DDL used by polling capture
    AuditDdl {
        #[arg(value_parser = parse_table)]
        table: TableRef,
        #[arg(long, value_parser = parse_table, default_value = "public.cdc_audit")]
        audit_table: TableRef,
    },
}

#[derive(Subcommand, Debug)]
enum SubscriptionAction {
    Start { name: String },
    Stop { name: String },
    Pause { name: String },
    Resume { name: String },
    Status { name: String },
}

impl SubscriptionAction {
    fn request(&self) -> ControlRequest {
        match self {
            SubscriptionAction::Start { name } => ControlRequest::Start {
                subscription: name.clone(),
            },
            SubscriptionAction::Stop { name } => ControlRequest::Stop {
                subscription: name.clone(),
            },
            SubscriptionAction::Pause { name } => ControlRequest::Pause {
                subscription: name.clone(),
            },
            SubscriptionAction::Resume { name } => ControlRequest::Resume {
                subscription: name.clone(),
            },
            SubscriptionAction::Status { name } => ControlRequest::Status {
                subscription: name.clone(),
            },
        }
    }
}

/// A request the daemon refused.
#[derive(thiserror::Error, Debug)]
#[error("{kind}: {message}")]
struct RemoteError {
    kind: ErrorKind,
    message: String,
}

fn parse_table(s: &str) -> Result<TableRef, String> {
    s.parse().map_err(|e: Error| e.to_string())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::from(1)
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    init_logging(cli.json_logs, cli.verbose);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("error: {:#}", e);
            ExitCode::from(exit_code(&e))
        }
    }
}

/// 1 for requests that can never succeed as given, 2 for everything else.
fn exit_code(error: &anyhow::Error) -> u8 {
    let kind = error
        .downcast_ref::<Error>()
        .map(Error::kind)
        .or_else(|| error.downcast_ref::<RemoteError>().map(|e| e.kind));
    match kind {
        Some(ErrorKind::NotFound | ErrorKind::InvalidTransition | ErrorKind::Unsupported) => 1,
        _ => 2,
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Serve => {
            let config = load_config(&cli.config)?;
            info!(
                datastores = config.datastores.len(),
                subscriptions = config.subscriptions.len(),
                control_addr = %config.engine.control_addr,
                "Starting cdc-relay"
            );
            let engine = Arc::new(Engine::from_config(config).await?);
            engine.run().await?;
        }
        Command::Subscription { action } => {
            subscription_command(&load_config(&cli.config)?, action).await?
        }
        Command::Validate => {
            let engine = Engine::from_config(load_config(&cli.config)?).await?;
            let result = engine.validate_channels().await;
            engine.shutdown().await;
            for (channel, tables) in result? {
                println!("{}: {} table(s) valid", channel, tables);
            }
        }
        Command::DeadLetters {
            subscription,
            replay,
        } => dead_letters_command(load_config(&cli.config)?, subscription, replay).await?,
        Command::AuditDdl { table, audit_table } => {
            println!("{}", audit_trigger_ddl(&table, &audit_table));
        }
    }
    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<Config> {
    info!("Loading configuration from {:?}", path);
    let config =
        Config::from_file(path).with_context(|| format!("loading {}", path.display()))?;
    Ok(config)
}

async fn subscription_command(config: &Config, action: SubscriptionAction) -> anyhow::Result<()> {
    let client = ControlClient::new(&config.engine.control_addr);
    let request = action.request();

    match client.send(&request).await {
        Ok(response) => {
            let response = accepted(response)?;
            if let Some(status) = response.status {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else if let Some(state) = response.state {
                println!("{}: {}", request.subscription(), state);
            }
            Ok(())
        }
        Err(Error::Connection(message)) if matches!(action, SubscriptionAction::Status { .. }) => {
            warn!("Daemon unreachable ({}), reading the persisted status", message);
            let store = StatusStore::for_subscription(&config.engine.state_dir, request.subscription());
            match store.load().await? {
                Some(status) => {
                    println!("{}", serde_json::to_string_pretty(&status)?);
                    Ok(())
                }
                None => Err(Error::NotFound {
                    what: "subscription status",
                    name: request.subscription().to_string(),
                }
                .into()),
            }
        }
        Err(e) => Err(e.into()),
    }
}

/// Asks the daemon first; without one, a local engine reads the target.
async fn dead_letters_command(
    config: Config,
    subscription: String,
    replay: bool,
) -> anyhow::Result<()> {
    let client = ControlClient::new(&config.engine.control_addr);
    let request = if replay {
        ControlRequest::ReplayDeadLetters {
            subscription: subscription.clone(),
        }
    } else {
        ControlRequest::DeadLetters {
            subscription: subscription.clone(),
        }
    };

    let response = match client.send(&request).await {
        Ok(response) => accepted(response)?,
        Err(Error::Connection(message)) => {
            warn!("Daemon unreachable ({}), using a local engine", message);
            let engine = Engine::from_config(config).await?;
            let result = if replay {
                engine
                    .replay_dead_letters(&subscription)
                    .await
                    .map(|report| ControlResponse {
                        ok: true,
                        replay: Some(report),
                        ..Default::default()
                    })
            } else {
                engine
                    .dead_letters(&subscription)
                    .await
                    .map(|records| ControlResponse {
                        ok: true,
                        dead_letters: Some(records),
                        ..Default::default()
                    })
            };
            engine.shutdown().await;
            result?
        }
        Err(e) => return Err(e.into()),
    };

    if let Some(report) = response.replay {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }
    for record in response.dead_letters.unwrap_or_default() {
        println!("{}", serde_json::to_string(&record)?);
    }
    Ok(())
}

fn accepted(response: ControlResponse) -> anyhow::Result<ControlResponse> {
    if response.ok {
        return Ok(response);
    }
    match response.error {
        Some(error) => Err(RemoteError {
            kind: error.kind,
            message: error.message,
        }
        .into()),
        None => anyhow::bail!("daemon refused the request"),
    }
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("cdc_relay=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("cdc_relay=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_writer(std::io::stderr)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
