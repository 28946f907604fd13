use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tokio::sync::{mpsc, watch};
use tracing::{info_span, warn, Instrument};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use calendar_assistant::config::watcher::ConfigWatcher;
use calendar_assistant::{App, Config};

/// How often the config file is checked for changes.
const CONFIG_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "calendar-assistant")]
#[command(author, version, about = "Conversational calendar assistant", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the interactive REPL (default)
    Repl,

    /// Send a single message and print the answer
    Ask {
        /// The request, e.g. "what do I have tomorrow?"
        message: Vec<String>,
    },

    /// List events for a phrase such as "tomorrow afternoon" without the backend
    Events {
        phrase: Vec<String>,
    },

    /// Add an event without the backend, e.g. `add Dentist friday at 15`
    Add {
        /// Event title
        title: String,
        /// When, e.g. "tomorrow at 10" or "friday from 9 to 11:30"
        when: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::path);
    let config = Config::load_from_path(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;
    init_logging(
        cli.verbose,
        config.telemetry.enabled,
        cli.json_logs || config.telemetry.json_logs,
    );

    match cli.command.unwrap_or(Commands::Repl) {
        Commands::Repl => {
            let app = start(config).await?;
            run_repl(&app, config_path).await?;
        }
        Commands::Ask { message } => {
            let app = start(config).await?;
            let outcome = app.run_turn(&message.join(" ")).await?;
            println!("{}", outcome.text);
            print_summary(&app, &outcome.summary);
        }
        Commands::Events { phrase } => {
            let app = App::without_backend(config)
                .await
                .context("opening the event store")?;
            println!("{}", app.list_phrase(&phrase.join(" ")).await?);
        }
        Commands::Add { title, when } => {
            let app = App::without_backend(config)
                .await
                .context("opening the event store")?;
            println!("{}", app.add_phrase(&title, &when.join(" ")).await?);
        }
    }

    Ok(())
}

async fn start(config: Config) -> Result<App> {
    App::from_config(config)
        .await
        .context("starting the calendar assistant")
}

async fn run_repl(app: &App, config_path: PathBuf) -> Result<()> {
    let (reload_tx, mut reload_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let watcher = ConfigWatcher::new(config_path, CONFIG_POLL_INTERVAL);
    let watcher_handle = tokio::spawn(watcher.watch(reload_tx, shutdown_rx));

    let history_file = Config::dir().join("history.txt");
    let mut editor = DefaultEditor::new()?;
    let _ = editor.load_history(&history_file);

    let session_id = Uuid::new_v4();
    let max_turns = app.config().agent.max_turns;
    println!("--- Calendar Assistant REPL ---");
    println!("Type your request, '/stats' for cache counters or '/exit' to quit.");

    let mut turns = 0;
    loop {
        if turns >= max_turns {
            println!("\nMax conversation turns ({max_turns}) reached. Ending session.");
            break;
        }

        let line = match editor.readline("\nUser: ") {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("Error: {err}");
                break;
            }
        };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        let _ = editor.add_history_entry(input);

        while let Ok(next) = reload_rx.try_recv() {
            app.apply_reload(&next);
        }

        match input.to_lowercase().as_str() {
            "/exit" => {
                println!("Goodbye!");
                break;
            }
            "/stats" => {
                println!("{}", app.stats().render());
                continue;
            }
            "/reset" => {
                app.agent()?.reset().await;
                println!("Conversation cleared.");
                continue;
            }
            _ => {}
        }

        let span = info_span!("turn", %session_id, turn = turns);
        match app.run_turn(input).instrument(span).await {
            Ok(outcome) => {
                println!("\nAssistant: {}", outcome.text);
                print_summary(app, &outcome.summary);
            }
            Err(e) => println!("\nError: {e}"),
        }
        turns += 1;
    }

    if let Err(e) = editor.save_history(&history_file) {
        warn!(error = %e, "Could not save REPL history");
    }
    let _ = shutdown_tx.send(true);
    let _ = watcher_handle.await;
    Ok(())
}

fn print_summary(app: &App, summary: &calendar_assistant::telemetry::TurnSummary) {
    if !app.telemetry().is_enabled() {
        return;
    }
    if let Some(rendered) = summary.render() {
        println!("\n{rendered}");
    }
}

/// Cache-hit and turn-summary records are `info` events, so telemetry
/// raises the default level.
fn init_logging(verbose: bool, telemetry: bool, json: bool) {
    let filter = if verbose {
        "calendar_assistant=debug"
    } else if telemetry {
        "calendar_assistant=info"
    } else {
        "calendar_assistant=warn"
    };
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}
