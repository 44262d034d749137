#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::items_after_statements,
    clippy::missing_errors_doc,
    clippy::module_name_repetitions,
    clippy::needless_pass_by_value,
    clippy::too_many_lines,
    clippy::uninlined_format_args
)]

use std::collections::HashSet;
use std::fmt::Write as _;
use std::io::Write;

use anyhow::{bail, Result};
use chrono::Utc;
use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use tokio::sync::mpsc;
use tracing_subscriber::{fmt, EnvFilter};

use streamkeep::engine::{create_engine, engine_options, SessionSeed};
use streamkeep::persistence::{self, create_snapshot_store};
use streamkeep::sessions::{Session, SessionKind, SessionState};
use streamkeep::{Config, ConfigCommands, Engine};

fn parse_kind(s: &str) -> std::result::Result<SessionKind, String> {
    s.parse::<SessionKind>().map_err(|e| format!("{e}"))
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum CompletionShell {
    #[value(name = "bash")]
    Bash,
    #[value(name = "fish")]
    Fish,
    #[value(name = "zsh")]
    Zsh,
    #[value(name = "powershell")]
    PowerShell,
    #[value(name = "elvish")]
    Elvish,
}

/// `streamkeep` - follow, resume and cancel server-pushed work streams.
#[derive(Parser, Debug)]
#[command(name = "streamkeep")]
#[command(version)]
#[command(about = "Resumable client sessions for server-pushed event streams.", long_about = None)]
struct Cli {
    #[arg(long, global = true)]
    config_dir: Option<String>,

    /// Snapshot tab to read and write; defaults to config persistence.tab
    #[arg(long, global = true)]
    tab: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start a session and follow its stream
    #[command(long_about = "\
Start a session and follow its stream.

Opens the stream identified by --stream-ref on the configured server and \
prints every state change until the session finishes. Ctrl-C cancels the \
session. Sessions persisted by an earlier run of the same tab are resumed \
alongside it.

Examples:
  streamkeep watch --kind task --stream-ref job-42
  streamkeep watch --kind exchange --stream-ref msg-7 --id chat-1
  streamkeep watch --kind task --stream-ref job-42 --metrics")]
    Watch {
        /// Session kind (task, exchange)
        #[arg(short, long, value_parser = parse_kind)]
        kind: SessionKind,

        /// Server-issued stream reference
        #[arg(short = 'r', long)]
        stream_ref: String,

        /// Caller-assigned session id; reusing one supersedes that session
        #[arg(long)]
        id: Option<String>,

        /// Print engine metrics on exit
        #[arg(long)]
        metrics: bool,
    },

    /// Resume the sessions persisted for this tab
    Resume {
        /// Print engine metrics on exit
        #[arg(long)]
        metrics: bool,
    },

    /// List the persisted in-flight sessions for this tab
    Sessions,

    /// Clear the persisted snapshot for this tab
    Clear,

    /// Manage configuration
    #[command(long_about = "\
Manage streamkeep configuration.

Use 'schema' to dump the full JSON Schema for the config file, which \
documents every available key, type, and default value.

Examples:
  streamkeep config schema              # print JSON Schema to stdout
  streamkeep config show                # print the effective config")]
    Config {
        #[command(subcommand)]
        config_command: ConfigCommands,
    },

    /// Generate shell completion script to stdout
    #[command(long_about = "\
Generate shell completion scripts for `streamkeep`.

The script is printed to stdout so it can be sourced directly:

Examples:
  source <(streamkeep completions bash)
  streamkeep completions zsh > ~/.zfunc/_streamkeep
  streamkeep completions fish > ~/.config/fish/completions/streamkeep.fish")]
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(config_dir) = &cli.config_dir {
        if config_dir.trim().is_empty() {
            bail!("--config-dir cannot be empty");
        }
        std::env::set_var("STREAMKEEP_CONFIG_DIR", config_dir);
    }
    if let Some(tab) = &cli.tab {
        if tab.trim().is_empty() {
            bail!("--tab cannot be empty");
        }
        std::env::set_var("STREAMKEEP_TAB", tab);
    }

    // Completions must remain stdout-only and should not load config or initialize logging.
    if let Commands::Completions { shell } = &cli.command {
        let mut stdout = std::io::stdout().lock();
        write_shell_completion(*shell, &mut stdout)?;
        return Ok(());
    }

    // Initialize logging - respects RUST_LOG env var, defaults to INFO
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = Config::load_or_init().await?;

    match cli.command {
        Commands::Completions { .. } => unreachable!(),

        Commands::Watch {
            kind,
            stream_ref,
            id,
            metrics,
        } => {
            let engine = create_engine(&config)?;
            let (tx, mut rx) = mpsc::unbounded_channel();
            let listener = engine.on_change(move |session: &Session| {
                let _ = tx.send(session.clone());
            });

            let mut pending: HashSet<String> = engine.restore()?.into_iter().collect();
            let seed = id.map(SessionSeed::with_id).unwrap_or_default();
            let id = engine.start(kind, &stream_ref, seed)?;
            println!("Started {kind} session {id} ({stream_ref})");
            pending.insert(id);

            follow(&engine, pending, &mut rx).await;
            listener.unsubscribe();
            finish(&engine, metrics)
        }

        Commands::Resume { metrics } => {
            let engine = create_engine(&config)?;
            let (tx, mut rx) = mpsc::unbounded_channel();
            let listener = engine.on_change(move |session: &Session| {
                let _ = tx.send(session.clone());
            });

            let restored = engine.restore()?;
            if restored.is_empty() {
                println!("No sessions to resume for tab '{}'.", config.persistence.tab);
            } else {
                println!("Resumed {} session(s).", restored.len());
                follow(&engine, restored.into_iter().collect(), &mut rx).await;
            }
            listener.unsubscribe();
            finish(&engine, metrics)
        }

        Commands::Sessions => {
            let store = create_snapshot_store(&config.persistence, &config.state_dir())?;
            let sessions = match store.load()? {
                Some(payload) => persistence::decode(
                    &payload,
                    Utc::now(),
                    engine_options(&config).max_snapshot_age,
                ),
                None => Vec::new(),
            };
            if sessions.is_empty() {
                println!("No persisted sessions for '{}'.", store.key());
                return Ok(());
            }
            println!("Persisted sessions for '{}' ({}):", store.key(), sessions.len());
            for session in &sessions {
                println!(
                    "  {}  updated {}",
                    describe(session),
                    session.updated_at.to_rfc3339()
                );
            }
            Ok(())
        }

        Commands::Clear => {
            let store = create_snapshot_store(&config.persistence, &config.state_dir())?;
            store.clear()?;
            println!("Cleared persisted sessions for '{}'.", store.key());
            Ok(())
        }

        Commands::Config { config_command } => match config_command {
            ConfigCommands::Schema => {
                let schema = schemars::schema_for!(Config);
                println!("{}", serde_json::to_string_pretty(&schema)?);
                Ok(())
            }
            ConfigCommands::Show => {
                let mut shown = config.clone();
                if shown.server.api_key.is_some() {
                    shown.server.api_key = Some("***".into());
                }
                println!("# {}", config.config_path.display());
                print!("{}", toml::to_string_pretty(&shown)?);
                Ok(())
            }
        },
    }
}

/// Print changes until every session in `pending` is terminal. The first
/// Ctrl-C cancels the pending sessions; a second one stops waiting.
async fn follow(engine: &Engine, mut pending: HashSet<String>, rx: &mut mpsc::UnboundedReceiver<Session>) {
    let mut cancelling = false;
    while !pending.is_empty() {
        tokio::select! {
            change = rx.recv() => {
                let Some(session) = change else { return };
                println!("{}", describe(&session));
                if session.is_terminal() && pending.remove(&session.id) {
                    if let SessionState::Exchange(exchange) = &session.state {
                        if !exchange.text.is_empty() {
                            println!("\n{}\n", exchange.text);
                        }
                    }
                }
            }
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    tracing::warn!("failed to listen for Ctrl-C: {e}");
                    return;
                }
                if cancelling {
                    return;
                }
                cancelling = true;
                for id in &pending {
                    if let Err(e) = engine.cancel(id) {
                        tracing::warn!(session_id = %id, "cancel failed: {e}");
                    }
                }
            }
        }
    }
}

fn finish(engine: &Engine, metrics: bool) -> Result<()> {
    engine.shutdown();
    if metrics {
        print!("{}", engine.metrics().render()?);
    }
    Ok(())
}

/// One-line summary of a session.
fn describe(session: &Session) -> String {
    let mut line = format!("{} [{}] {}", session.id, session.kind, session.status);
    match &session.state {
        SessionState::Task(task) => {
            let _ = write!(line, " {}% {}", task.progress, task.current_step);
            if !task.step_message.is_empty() {
                let _ = write!(line, ": {}", task.step_message);
            }
            if let Some(result) = &task.result_id {
                let _ = write!(line, " result={result}");
            }
        }
        SessionState::Exchange(exchange) => {
            let _ = write!(
                line,
                " {} chars, {} sources, {} tool calls",
                exchange.text.chars().count(),
                exchange.sources.len(),
                exchange.tool_calls.len()
            );
        }
    }
    if let Some(error) = session.state.error() {
        let _ = write!(line, " error: {error}");
    }
    line
}

fn write_shell_completion<W: Write>(shell: CompletionShell, writer: &mut W) -> Result<()> {
    use clap_complete::generate;
    use clap_complete::shells;

    let mut cmd = Cli::command();
    let bin_name = cmd.get_name().to_string();

    match shell {
        CompletionShell::Bash => generate(shells::Bash, &mut cmd, bin_name.clone(), writer),
        CompletionShell::Fish => generate(shells::Fish, &mut cmd, bin_name.clone(), writer),
        CompletionShell::Zsh => generate(shells::Zsh, &mut cmd, bin_name.clone(), writer),
        CompletionShell::PowerShell => {
            generate(shells::PowerShell, &mut cmd, bin_name.clone(), writer);
        }
        CompletionShell::Elvish => generate(shells::Elvish, &mut cmd, bin_name, writer),
    }

    writer.flush()?;
    Ok(())
}
