use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use crossterm::event::{self, Event, KeyEventKind};
use tokio::sync::{mpsc, Notify};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod actions;
mod agent;
mod app;
mod backend;
mod config;
mod deck;
mod error;
mod tmux;

use actions::Action;
use app::App;
use config::Config;
use deck::Deck;

const INPUT_POLL: Duration = Duration::from_millis(100);

/// Supervise AI coding agents running in tmux
#[derive(Parser, Debug)]
#[command(name = "agent-deck", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Open the dashboard (default)
    Start,
    /// Spawn an agent in a directory
    Add {
        dir: PathBuf,
        /// First prompt handed to the agent
        #[arg(long)]
        prompt: Option<String>,
        /// Display name (defaults to the git repository or directory name)
        #[arg(long)]
        name: Option<String>,
        /// Backend id: claude, codex or gemini
        #[arg(long)]
        backend: Option<String>,
    },
    /// List tracked agents with fresh statuses
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Kill an agent's session and stop tracking it
    Kill { target: String },
    /// Change an agent's display name
    Rename { target: String, name: String },
    /// Restart a finished agent, continuing its conversation
    Resume { target: String },
    /// Type text into an agent's session
    Send { target: String, text: String },
    /// Scan for agents running outside agent-deck and adopt them
    Discover,
    /// Forget every finished agent
    Clear,
    /// Install status hooks for every backend
    Hooks,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load().context("failed to load configuration")?;
    let command = cli.command.unwrap_or(Commands::Start);

    init_tracing(&config, matches!(command, Commands::Start))?;

    match command {
        Commands::Start => start(config).await,
        Commands::Add {
            dir,
            prompt,
            name,
            backend,
        } => {
            let deck = Deck::open(config)?;
            if deck.config().install_hooks {
                install_hooks(&deck);
            }
            let dir = deck.config().expand_tilde(&dir.to_string_lossy());
            let result = deck
                .spawn_agent(&dir, name.as_deref(), backend.as_deref(), prompt.as_deref())
                .await;
            deck.close();
            let agent = result?;
            println!(
                "spawned {} (id {}, {}) in session {}",
                agent.name, agent.id, agent.backend, agent.session_name
            );
            Ok(())
        }
        Commands::List { json } => {
            let deck = Deck::open(config)?;
            deck.refresh_statuses().await;
            deck.close();
            print_agents(&deck, json)
        }
        Commands::Kill { target } => {
            let deck = Deck::open(config)?;
            let agent = deck.kill_agent(&target).await?;
            println!("killed {} (id {})", agent.name, agent.id);
            Ok(())
        }
        Commands::Rename { target, name } => {
            let deck = Deck::open(config)?;
            let agent = deck.rename(&target, &name)?;
            println!("renamed {} to {}", agent.id, agent.name);
            Ok(())
        }
        Commands::Resume { target } => {
            let deck = Deck::open(config)?;
            let result = deck.resume_agent(&target).await;
            deck.close();
            let agent = result?;
            println!("resumed {} in session {}", agent.name, agent.session_name);
            Ok(())
        }
        Commands::Send { target, text } => {
            let deck = Deck::open(config)?;
            let result = deck.send_keys(&target, &text).await;
            deck.close();
            result
        }
        Commands::Discover => {
            let deck = Deck::open(config)?;
            let outcome = deck.discover().await;
            for found in &outcome.candidates {
                let location = if found.session_name.is_empty() {
                    found
                        .pid
                        .map(|pid| format!("pid {}", pid))
                        .unwrap_or_default()
                } else {
                    format!("session {}", found.session_name)
                };
                println!(
                    "{:<8} {:<20} {:<24} {}",
                    found.backend,
                    found.name,
                    location,
                    deck.config().collapse_tilde(&found.dir)
                );
            }
            println!(
                "{} found, {} adopted, {} revived, {} ended",
                outcome.candidates.len(),
                outcome.merged.added.len(),
                outcome.merged.revived.len(),
                outcome.ended.len()
            );
            Ok(())
        }
        Commands::Clear => {
            let deck = Deck::open(config)?;
            println!("cleared {} finished agents", deck.clear_done());
            Ok(())
        }
        Commands::Hooks => {
            let deck = Deck::open(config)?;
            let mut failed = false;
            for (id, result) in deck.install_hooks() {
                match result {
                    Ok(true) => println!("{}: installed", id),
                    Ok(false) => println!("{}: already installed", id),
                    Err(e) => {
                        failed = true;
                        println!("{}: {}", id, e);
                    }
                }
            }
            if failed {
                bail!("some hooks could not be installed");
            }
            Ok(())
        }
    }
}

/// The dashboard logs to a file because it owns the terminal
fn init_tracing(config: &Config, to_file: bool) -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());
    if to_file {
        config.ensure_dirs()?;
        let path = config.log_path();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open log file {}", path.display()))?;
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(Mutex::new(file))
            .with_ansi(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
    Ok(())
}

fn install_hooks(deck: &Deck) {
    for (id, result) in deck.install_hooks() {
        match result {
            Ok(true) => info!(backend = id, "hooks installed"),
            Ok(false) => {}
            Err(e) => warn!(backend = id, error = %e, "hook installation failed"),
        }
    }
}

fn print_agents(deck: &Deck, json: bool) -> Result<()> {
    let agents = deck.store().list();
    if json {
        println!("{}", serde_json::to_string_pretty(&agents)?);
        return Ok(());
    }
    if agents.is_empty() {
        println!("no agents");
        return Ok(());
    }
    println!(
        "{:<4} {:<8} {:<8} {:<20} {:<16} DIR",
        "ID", "STATUS", "BACKEND", "NAME", "SESSION"
    );
    for agent in agents {
        let name = if agent.discovered {
            format!("{}*", agent.name)
        } else {
            agent.name.clone()
        };
        println!(
            "{:<4} {:<8} {:<8} {:<20} {:<16} {}",
            agent.id.0,
            agent.status,
            agent.backend,
            name,
            agent.session_name,
            deck.config().collapse_tilde(&agent.dir)
        );
    }
    Ok(())
}

async fn start(config: Config) -> Result<()> {
    if which::which(&config.tmux_path).is_err() {
        bail!("tmux not found ({}); agent-deck needs tmux to run agents", config.tmux_path);
    }

    let deck = Arc::new(Deck::open(config)?);
    let mut app = App::new();
    app.spawn_root = format!("{}/", deck.config().collapse_tilde(&deck.config().spawn_root()));

    let missing: Vec<String> = deck
        .registry()
        .all()
        .iter()
        .filter(|b| b.check_deps().is_none())
        .map(|b| format!("{} ({})", b.name(), b.binary()))
        .collect();
    if !missing.is_empty() {
        warn!(missing = ?missing, "agent CLIs not found on PATH");
        app.error(format!("not on PATH: {}", missing.join(", ")));
    }
    if deck.config().install_hooks {
        install_hooks(&deck);
    }

    // Create event channel
    let (tx, mut rx) = mpsc::unbounded_channel::<Action>();
    let refresh = Arc::new(Notify::new());
    let input_paused = Arc::new(AtomicBool::new(false));
    let mut terminal = ratatui::init();

    // Input handler; paused while a tmux client owns the terminal
    let input_tx = tx.clone();
    let paused = input_paused.clone();
    tokio::task::spawn_blocking(move || loop {
        if input_tx.is_closed() {
            break;
        }
        if paused.load(Ordering::Acquire) {
            std::thread::sleep(INPUT_POLL);
            continue;
        }
        if !event::poll(INPUT_POLL).unwrap_or(false) || paused.load(Ordering::Acquire) {
            continue;
        }
        if let Ok(Event::Key(key)) = event::read() {
            if key.kind == KeyEventKind::Press && input_tx.send(Action::KeyPress(key)).is_err() {
                break;
            }
        }
    });

    // Status and discovery ticks
    let poll_tx = tx.clone();
    let poll_deck = deck.clone();
    let poll_refresh = refresh.clone();
    tokio::spawn(async move {
        let every = poll_deck.config().discover_every_ticks.max(1);
        let preview = poll_deck.config().preview_lines;
        let mut tick: u32 = 0;
        loop {
            if tick % every == 0 {
                poll_deck.discover().await;
            }
            poll_deck.refresh_statuses().await;
            let views = poll_deck.views(preview).await;
            if poll_tx.send(Action::AgentsUpdated(views)).is_err() {
                break;
            }
            tick = tick.wrapping_add(1);
            tokio::select! {
                _ = tokio::time::sleep(poll_deck.config().tick_interval()) => {}
                _ = poll_refresh.notified() => {}
            }
        }
    });

    // Main event loop
    let result = loop {
        terminal.draw(|f| app.render(f))?;

        for pending in app.take_pending_actions() {
            match pending {
                Action::AttachAgent(id) => {
                    input_paused.store(true, Ordering::Release);
                    tokio::time::sleep(INPUT_POLL).await;
                    ratatui::restore();

                    let status = attach(&deck, id).await;

                    terminal = ratatui::init();
                    input_paused.store(false, Ordering::Release);
                    if let Err(e) = status {
                        app.error(format!("{:#}", e));
                    }
                    refresh.notify_one();
                }
                other => {
                    tokio::spawn(dispatch(deck.clone(), other, tx.clone(), refresh.clone()));
                }
            }
        }

        if let Some(action) = rx.recv().await {
            match app.handle_action(action) {
                Ok(true) => break Ok(()),
                Ok(false) => {}
                Err(e) => break Err(e),
            }
        }
    };

    ratatui::restore();
    deck.close();
    result
}

/// Hand the terminal to `tmux attach` until the operator detaches
async fn attach(deck: &Deck, id: agent::AgentId) -> Result<()> {
    let target = id.to_string();
    // Spawned sessions use a manual window size, so match the operator's terminal first
    if let Ok((cols, rows)) = crossterm::terminal::size() {
        if let Err(e) = deck.resize_agent(&target, cols, rows).await {
            warn!(agent_id = %id, error = %e, "resize before attach failed");
        }
    }
    let cmd = deck.attach_command(&target)?;
    let status = std::process::Command::new(&cmd[0])
        .args(&cmd[1..])
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .context("failed to run tmux attach")?;
    if !status.success() {
        bail!("tmux attach exited with {}", status);
    }
    Ok(())
}

/// Run one operator action off the UI loop, reporting back through the channel
async fn dispatch(deck: Arc<Deck>, action: Action, tx: mpsc::UnboundedSender<Action>, refresh: Arc<Notify>) {
    let result = match action {
        Action::SpawnAgent(dir) => {
            let dir = deck.config().expand_tilde(dir.trim());
            deck.spawn_agent(&dir, None, None, None)
                .await
                .map(|a| format!("spawned {} in {}", a.name, a.session_name))
        }
        Action::SendKeys(id, text) => deck
            .send_keys(&id.to_string(), &text)
            .await
            .map(|_| "sent".to_string()),
        Action::KillAgent(id) => deck
            .kill_agent(&id.to_string())
            .await
            .map(|a| format!("killed {}", a.name)),
        Action::ResumeAgent(id) => deck
            .resume_agent(&id.to_string())
            .await
            .map(|a| format!("resumed {}", a.name)),
        Action::Discover => {
            let outcome = deck.discover().await;
            Ok(format!(
                "discovery: {} found, {} adopted, {} revived",
                outcome.candidates.len(),
                outcome.merged.added.len(),
                outcome.merged.revived.len()
            ))
        }
        Action::ClearDone => Ok(format!("cleared {} finished agents", deck.clear_done())),
        _ => return,
    };

    let message = match result {
        Ok(msg) => Action::Status(msg),
        Err(e) => Action::Error(format!("{:#}", e)),
    };
    let _ = tx.send(message);
    refresh.notify_one();
}
