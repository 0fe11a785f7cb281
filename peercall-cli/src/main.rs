//! peercall CLI Application

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use peercall_core::prelude::*;
use peercall_core::{CallSnapshot, SessionState};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Log filter (e.g., "peercall_core=debug")
    #[arg(long, env = "PEERCALL_LOG", default_value = "peercall_core=info")]
    log: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Place a call between two local users over an in-process relay
    Loopback {
        /// Calling user
        #[arg(long, env = "PEERCALL_CALLER", default_value = "alice")]
        caller: String,

        /// Called user
        #[arg(long, env = "PEERCALL_CALLEE", default_value = "bob")]
        callee: String,

        /// Video call instead of audio
        #[arg(long)]
        video: bool,

        /// Seconds to stay connected before hanging up
        #[arg(long, default_value_t = 5)]
        duration: u64,

        /// Seconds to wait for the connection
        #[arg(long, default_value_t = 15)]
        connect_timeout: u64,
    },

    /// Show the default configuration and available commands
    Status,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LoopbackReport {
    call_id: CallId,
    caller: Option<CallSnapshot>,
    callee: Option<CallSnapshot>,
    connected: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&cli.log))
        .init();

    match cli.command {
        Commands::Loopback {
            caller,
            callee,
            video,
            duration,
            connect_timeout,
        } => {
            let kind = if video { MediaKind::Video } else { MediaKind::Audio };
            handle_loopback(
                &caller,
                &callee,
                kind,
                Duration::from_secs(duration),
                Duration::from_secs(connect_timeout),
            )
            .await?;
        }
        Commands::Status => {
            handle_status()?;
        }
    }

    Ok(())
}

async fn build_service(relay: &MemoryRelay, user: &str) -> Result<CallService> {
    // Host candidates are enough inside one process
    let config = CallConfig {
        local_peer: PeerId::new(user),
        ice_servers: Vec::new(),
        ..CallConfig::default()
    };
    let service = CallService::builder(Arc::new(relay.transport(user)))
        .with_config(config)
        .build()
        .await
        .with_context(|| format!("building service for {user}"))?;
    service.connect().await?;
    Ok(service)
}

async fn handle_loopback(
    caller: &str,
    callee: &str,
    kind: MediaKind,
    duration: Duration,
    connect_timeout: Duration,
) -> Result<()> {
    if caller == callee {
        bail!("caller and callee must differ");
    }
    println!("📞 Loopback {kind} call: {caller} → {callee}");

    let relay = MemoryRelay::new();
    let caller_service = Arc::new(build_service(&relay, caller).await?);
    let callee_service = Arc::new(build_service(&relay, callee).await?);

    let answerer = {
        let service = Arc::clone(&callee_service);
        let mut events = service.subscribe_events();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(CallEvent::IncomingCall { call_id, from, .. }) => {
                        println!("🔔 {} ← incoming call {call_id} from {from}", service.local_peer());
                        if let Err(e) = service.answer_call().await {
                            tracing::error!(error = %e, "Auto-answer failed");
                        }
                    }
                    Ok(event) => print_event("callee", &event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "Callee event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    };

    let mut events = caller_service.subscribe_events();
    let call_id = caller_service
        .start_call(PeerId::new(callee), kind)
        .await
        .context("starting call")?;
    println!("✅ Call initiated with ID: {call_id}");

    let connected = tokio::time::timeout(connect_timeout, async {
        loop {
            match events.recv().await {
                Ok(CallEvent::SessionStateChanged {
                    new_state: SessionState::Connected,
                    ..
                }) => return true,
                Ok(CallEvent::CallEnded { .. }) => return false,
                Ok(event) => print_event("caller", &event),
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return false,
            }
        }
    })
    .await
    .unwrap_or(false);

    if connected {
        println!("🎉 Connected, holding for {}s", duration.as_secs());
        tokio::time::sleep(duration).await;
    } else {
        println!("⚠️  Call did not connect");
    }

    let report = LoopbackReport {
        call_id,
        caller: caller_service.current_call(),
        callee: callee_service.current_call(),
        connected,
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    if caller_service.current_call().is_some() {
        caller_service.end_call().await?;
    }
    // Let the callee observe call:ended
    tokio::time::sleep(Duration::from_millis(200)).await;

    caller_service.shutdown().await;
    callee_service.shutdown().await;
    answerer.abort();
    println!("📞 Call ended");
    Ok(())
}

fn print_event(side: &str, event: &CallEvent) {
    match event {
        CallEvent::SessionStateChanged {
            old_state, new_state, ..
        } => println!("   [{side}] {old_state:?} → {new_state:?}"),
        CallEvent::ConnectionStateChanged { state, .. } => {
            println!("   [{side}] peer connection {state:?}");
        }
        CallEvent::RemoteStream { stream, .. } => {
            println!("   [{side}] remote stream {} ({} tracks)", stream.id, stream.tracks.len());
        }
        CallEvent::EndedByRemote { reason, .. } => println!("   [{side}] ended by remote: {reason:?}"),
        CallEvent::CallFailed { error, .. } => println!("   [{side}] ❌ {error}"),
        other => tracing::debug!(side, event = ?other, "Call event"),
    }
}

fn handle_status() -> Result<()> {
    println!("📊 peercall CLI Status");
    println!("======================");
    println!("Default configuration:");
    println!("{}", serde_json::to_string_pretty(&CallConfig::default())?);
    println!();
    println!("Available commands:");
    println!("  peercall loopback [options]  - Call between two local users");
    println!("  peercall status              - Show this status");
    println!();
    println!("Use 'peercall --help' for detailed options");

    Ok(())
}
