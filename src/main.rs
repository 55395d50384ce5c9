//! # loom
//!
//! Server and command-line client for shared agent sessions.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use loom_client::{
    ClientConfig, ClientEvent, HistoryCursor, PendingLedger, PendingSendReconciler, RestClient, SessionClient,
};
use loom_core::backend::AgentBackend;
use loom_core::{EventBody, SessionId};
use loom_engine::{CommandBackend, ScriptedBackend};
use loom_settings::LoomSettings;
use loom_store::Database;
use loom_telemetry::TelemetryConfig;

#[derive(Parser, Debug)]
#[command(name = "loom", about = "Shared, resumable agent sessions")]
struct Cli {
    /// Settings file (defaults to ~/.loom/settings.json).
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Server URL for client commands (defaults to the configured host and port).
    #[arg(long, global = true)]
    server: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the server.
    Serve {
        #[arg(long)]
        host: Option<String>,
        /// Port to bind (0 for auto-assign).
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        data_dir: Option<String>,
    },
    /// Manage sessions.
    Sessions {
        #[command(subcommand)]
        action: SessionsAction,
    },
    /// Print a session's history, then follow it live.
    Follow {
        session: String,
        /// History events to print before going live.
        #[arg(long, default_value = "50")]
        history: u32,
    },
    /// Submit one prompt and wait until the server confirms it.
    Send { session: String, text: String },
}

#[derive(Subcommand, Debug)]
enum SessionsAction {
    List {
        #[arg(long)]
        all: bool,
    },
    Create {
        workspace: String,
        #[arg(long)]
        title: Option<String>,
    },
    Archive {
        id: String,
    },
    Delete {
        id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.settings {
        Some(path) => loom_settings::load_settings_from_path(path),
        None => loom_settings::load_settings(),
    }
    .context("Failed to load settings")?;

    let _telemetry = loom_telemetry::init_telemetry(&TelemetryConfig {
        log_level: settings.logging.level.clone(),
        json: settings.logging.json,
        ..TelemetryConfig::default()
    });

    let server_url = cli
        .server
        .clone()
        .unwrap_or_else(|| format!("http://{}:{}", settings.server.host, settings.server.port));

    match cli.command {
        Command::Serve { host, port, data_dir } => {
            let mut settings = settings;
            if let Some(host) = host {
                settings.server.host = host;
            }
            if let Some(port) = port {
                settings.server.port = port;
            }
            if let Some(dir) = data_dir {
                settings.server.data_dir = dir;
            }
            serve(settings).await
        }
        Command::Sessions { action } => sessions(&RestClient::new(&server_url), action).await,
        Command::Follow { session, history } => follow(&settings, &server_url, SessionId::from_raw(session), history).await,
        Command::Send { session, text } => send(&settings, &server_url, SessionId::from_raw(session), text).await,
    }
}

fn backend_from_settings(settings: &LoomSettings) -> Arc<dyn AgentBackend> {
    match &settings.agent.command {
        Some(program) => {
            info!(program = %program, "using command agent backend");
            Arc::new(CommandBackend::new(program.clone(), settings.agent.args.clone()))
        }
        None => {
            info!("no agent command configured, using echo backend");
            Arc::new(ScriptedBackend::echo())
        }
    }
}

async fn serve(settings: LoomSettings) -> Result<()> {
    let db_path = settings.server.database_path();
    let db = Database::open(&db_path)
        .with_context(|| format!("Failed to open database: {}", db_path.display()))?;

    let config = loom_server::ServerConfig::from_settings(&settings);
    let handle = loom_server::start(config, db, backend_from_settings(&settings))
        .await
        .context("Failed to start server")?;
    info!(port = handle.port(), "loom server ready");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl+c")?;
    info!("shutting down");
    handle.shutdown().await;
    Ok(())
}

async fn sessions(rest: &RestClient, action: SessionsAction) -> Result<()> {
    match action {
        SessionsAction::List { all } => {
            for s in rest.list_sessions(all).await.context("Failed to list sessions")? {
                println!(
                    "{}\t{}\t{}\tseq={}\t{}",
                    s.id,
                    s.status,
                    s.workspace_ref,
                    s.last_seq,
                    s.title.unwrap_or_default()
                );
            }
        }
        SessionsAction::Create { workspace, title } => {
            let s = rest
                .create_session(&workspace, title.as_deref())
                .await
                .context("Failed to create session")?;
            println!("{}", s.id);
        }
        SessionsAction::Archive { id } => {
            rest.archive_session(&SessionId::from_raw(id))
                .await
                .context("Failed to archive session")?;
        }
        SessionsAction::Delete { id } => {
            rest.delete_session(&SessionId::from_raw(id))
                .await
                .context("Failed to delete session")?;
        }
    }
    Ok(())
}

fn reconciler(settings: &LoomSettings) -> Arc<PendingSendReconciler> {
    let ledger = PendingLedger::open(&settings.server.data_dir().join("pending.json"));
    let timeout = std::time::Duration::from_secs(settings.client.pending_timeout_secs);
    Arc::new(PendingSendReconciler::new(ledger, timeout))
}

fn print_event(event: &loom_core::Event) {
    let who = event.prompt_id.as_ref().map(|p| p.as_str()).unwrap_or("-");
    match &event.body {
        EventBody::AgentChunk(c) => println!("{:>6} {}", event.seq, c.text),
        EventBody::AgentComplete(c) => println!("{:>6} [complete {:?}, {} chunks] {who}", event.seq, c.reason, c.chunk_count),
        EventBody::System(n) | EventBody::Error(n) => {
            println!("{:>6} [{} {}] {} {who}", event.seq, event.kind(), n.code, n.message)
        }
        other => println!("{:>6} [{}] {} {who}", event.seq, event.kind(), other.text()),
    }
}

async fn follow(settings: &LoomSettings, server_url: &str, session: SessionId, history: u32) -> Result<()> {
    let rest = RestClient::new(server_url);
    let mut page = rest
        .events(&session, HistoryCursor::Before(u64::MAX), history)
        .await
        .context("Failed to read history")?;
    page.sort_by_key(|e| e.seq);
    for event in &page {
        print_event(event);
    }

    let config = ClientConfig::from_settings(server_url, session, &settings.client);
    let (handle, mut events) = SessionClient::spawn(config, reconciler(settings));
    let mut shown = page.last().map(|e| e.seq).unwrap_or(0);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(ClientEvent::Event(e)) => {
                    if e.seq > shown {
                        shown = e.seq;
                        print_event(&e);
                    }
                }
                Some(ClientEvent::Disconnected { reason }) => eprintln!("-- disconnected: {reason}"),
                Some(ClientEvent::Live { last_seq }) => eprintln!("-- live at seq {last_seq}"),
                Some(ClientEvent::SessionClosed { reason }) => {
                    eprintln!("-- session closed: {reason}");
                    break;
                }
                Some(ClientEvent::Error { code, message }) => eprintln!("-- error {code}: {message}"),
                Some(_) => {}
                None => break,
            }
        }
    }
    handle.shutdown().await;
    Ok(())
}

async fn send(settings: &LoomSettings, server_url: &str, session: SessionId, text: String) -> Result<()> {
    let config = ClientConfig::from_settings(server_url, session, &settings.client);
    let (handle, mut events) = SessionClient::spawn(config, reconciler(settings));
    let prompt_id = handle.submit(text).await.context("Failed to submit prompt")?;

    let outcome = loop {
        match events.recv().await {
            Some(ClientEvent::PromptConfirmed { prompt_id: id, .. }) if id == prompt_id => break Ok(()),
            Some(ClientEvent::PromptFailed { prompt_id: id, text, reason }) if id == prompt_id => {
                break Err(anyhow::anyhow!("prompt failed ({reason}); text was: {text}"));
            }
            Some(ClientEvent::Accepted { prompt_id: id, disposition }) if id == prompt_id => {
                eprintln!("-- {disposition:?}");
            }
            Some(ClientEvent::SessionClosed { reason }) => break Err(anyhow::anyhow!("session closed: {reason}")),
            Some(ClientEvent::Error { code, message }) if code == "not_found" => {
                break Err(anyhow::anyhow!("{message}"));
            }
            Some(_) => {}
            None => bail!("client stopped before the prompt was confirmed"),
        }
    };
    handle.shutdown().await;
    outcome?;
    println!("{prompt_id}");
    Ok(())
}
