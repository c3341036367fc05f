//! devfleetd: supervises local dev servers and AI agent sessions, and
//! delegates queued tasks to agents.

#[cfg(unix)]
mod control;
#[cfg(unix)]
mod daemon;
#[cfg(unix)]
mod protocol;

#[cfg(unix)]
fn main() -> anyhow::Result<()> {
    cli::main()
}

#[cfg(not(unix))]
fn main() {
    eprintln!("devfleetd needs unix domain sockets and signals; this platform is not supported");
    std::process::exit(2);
}

#[cfg(unix)]
mod cli {
    use std::io;
    use std::path::PathBuf;

    use anyhow::{bail, Context, Result};
    use clap::{Parser, Subcommand};
    use devfleet_common::{load_config, resolve_config_path};
    use devfleet_orchestration::{AgentProviderKind, JournalVerifier, TaskStatus, TaskType};
    use serde::Serialize;
    use tracing::info;
    use tracing_subscriber::EnvFilter;

    use crate::control::{self, ControlEnv};
    use crate::daemon::{JOURNAL_FILE, JOURNAL_KEY_FILE};
    use crate::protocol::ControlRequest;

    #[derive(Parser, Debug)]
    #[command(name = "devfleetd", version)]
    #[command(about = "Supervise dev servers and agent sessions; delegate tasks to agents")]
    struct Cli {
        /// Configuration file (default: $DEVFLEET_CONFIG or ./devfleet.toml)
        #[arg(long, global = true)]
        config: Option<PathBuf>,

        /// Runtime directory for markers, logs and sockets
        #[arg(long, global = true)]
        runtime_dir: Option<PathBuf>,

        /// Enable debug logging
        #[arg(long, global = true)]
        debug: bool,

        #[command(subcommand)]
        command: Command,
    }

    #[derive(Subcommand, Debug)]
    enum Command {
        /// Start the daemon in the background
        Start { profile: Option<String> },
        /// Stop the daemon and any supervised process it left behind
        Stop,
        /// Stop, then start again
        Restart { profile: Option<String> },
        /// Daemon liveness and the supervised fleet
        Status,
        /// Run the daemon in the foreground
        Run { profile: Option<String> },
        /// Manage queued tasks
        Task {
            #[command(subcommand)]
            action: TaskAction,
        },
        /// List orchestrator insights, or resolve one
        Insights {
            #[arg(long)]
            resolve: Option<String>,
        },
        /// Audit journal tools
        Journal {
            #[command(subcommand)]
            action: JournalAction,
        },
    }

    #[derive(Subcommand, Debug)]
    enum TaskAction {
        Add {
            description: String,
            #[arg(long = "type")]
            task_type: Option<TaskType>,
            #[arg(long)]
            folder: Option<String>,
            #[arg(long)]
            priority: Option<u8>,
            #[arg(long)]
            confidence: Option<f64>,
            #[arg(long)]
            provider: Option<AgentProviderKind>,
        },
        List {
            #[arg(long, value_parser = parse_status)]
            status: Option<TaskStatus>,
        },
        Cancel {
            id: String,
            #[arg(long)]
            reason: Option<String>,
        },
    }

    #[derive(Subcommand, Debug)]
    enum JournalAction {
        /// Check the HMAC chain of the audit journal
        Verify,
    }

    fn parse_status(raw: &str) -> Result<TaskStatus, String> {
        serde_json::from_value(serde_json::Value::String(raw.trim().to_ascii_lowercase()))
            .map_err(|_| format!("unknown task status '{}'", raw))
    }

    fn print_json<T: Serialize>(value: &T) -> Result<()> {
        println!("{}", serde_json::to_string_pretty(value)?);
        Ok(())
    }

    pub fn main() -> Result<()> {
        let cli = Cli::parse();

        let filter = if cli.debug {
            EnvFilter::new("debug")
        } else {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
        };
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(io::stderr)
            .init();

        let config_path = resolve_config_path(cli.config.as_deref());
        let config = load_config(config_path.as_deref());
        let runtime = control::resolve_runtime_dir(cli.runtime_dir.as_deref(), &config)?;
        let env = ControlEnv {
            runtime,
            config,
            config_path,
        };

        let rt = tokio::runtime::Runtime::new().context("start tokio runtime")?;
        rt.block_on(dispatch(env, cli.command))
    }

    async fn dispatch(env: ControlEnv, command: Command) -> Result<()> {
        match command {
            Command::Start { profile } => {
                let profile = env.profile_or_default(profile);
                print_json(&control::start(&env, &profile).await?)
            }
            Command::Stop => print_json(&control::stop(&env).await?),
            Command::Restart { profile } => {
                let profile = env.profile_or_default(profile);
                print_json(&control::restart(&env, &profile).await?)
            }
            Command::Status => print_json(&control::status(&env).await?),
            Command::Run { profile } => {
                let profile = env.profile_or_default(profile);
                info!(
                    "{}",
                    devfleet_build_info::formatted_banner(
                        env!("CARGO_PKG_NAME"),
                        env!("CARGO_PKG_VERSION")
                    )
                );
                control::run_foreground(env, &profile).await
            }
            Command::Task { action } => {
                let request = match action {
                    TaskAction::Add {
                        description,
                        task_type,
                        folder,
                        priority,
                        confidence,
                        provider,
                    } => ControlRequest::TaskAdd {
                        description,
                        task_type,
                        folder,
                        priority,
                        confidence,
                        provider,
                    },
                    TaskAction::List { status } => ControlRequest::TaskList { status },
                    TaskAction::Cancel { id, reason } => ControlRequest::TaskCancel { id, reason },
                };
                print_json(&env.request(&request).await?)
            }
            Command::Insights { resolve } => {
                let request = match resolve {
                    Some(id) => ControlRequest::ResolveInsight { id },
                    None => ControlRequest::Insights,
                };
                print_json(&env.request(&request).await?)
            }
            Command::Journal {
                action: JournalAction::Verify,
            } => {
                let Some(key) = env.runtime.read_string(JOURNAL_KEY_FILE)? else {
                    bail!("no journal key in {}", env.runtime.path().display());
                };
                let path = env.runtime.file(JOURNAL_FILE);
                let intact = JournalVerifier::new(key.trim().as_bytes())
                    .verify_file(&path)
                    .map_err(|err| anyhow::anyhow!("verify {}: {}", path.display(), err))?;
                print_json(&serde_json::json!({
                    "journal": path,
                    "intact": intact,
                }))?;
                if !intact {
                    bail!("audit journal chain is broken");
                }
                Ok(())
            }
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn task_add_flags_parse() {
            let cli = Cli::try_parse_from([
                "devfleetd",
                "--runtime-dir",
                "/tmp/fleet",
                "task",
                "add",
                "fix the login redirect",
                "--type",
                "bug",
                "--provider",
                "codex",
                "--priority",
                "8",
            ])
            .unwrap();
            assert_eq!(cli.runtime_dir, Some(PathBuf::from("/tmp/fleet")));
            match cli.command {
                Command::Task {
                    action:
                        TaskAction::Add {
                            task_type,
                            provider,
                            priority,
                            ..
                        },
                } => {
                    assert_eq!(task_type, Some(TaskType::Bug));
                    assert_eq!(provider, Some(AgentProviderKind::Codex));
                    assert_eq!(priority, Some(8));
                }
                other => panic!("unexpected command {:?}", other),
            }
        }

        #[test]
        fn status_filter_accepts_snake_case() {
            assert_eq!(parse_status("Executing"), Ok(TaskStatus::Executing));
            assert!(parse_status("sleeping").is_err());
        }
    }
}
