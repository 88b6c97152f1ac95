use anyhow::Result;
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use tokio::time::{timeout, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error};

use amida_core::{resolve_path, ClientMessage, Layout, PathStep, Phase, Rung, ServerMessage};

#[derive(Parser, Debug)]
#[command(name = "amida-hub")]
#[command(about = "Amida ladder sync hub and debug client")]
pub struct Cli {
    /// Runs the server when absent.
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Fetch and print the current ladder state from a running hub
    State {
        /// Hub URL (e.g., ws://localhost:8080)
        #[arg(short, long, default_value = "ws://localhost:8080")]
        url: String,
    },
    /// Fetch the ladder and resolve the exit rail for a start rail
    Resolve {
        /// Hub URL (e.g., ws://localhost:8080)
        #[arg(short, long, default_value = "ws://localhost:8080")]
        url: String,

        /// Starting rail index
        #[arg(short, long)]
        start: usize,
    },
}

/// Connects like a regular client, asks for the authoritative state the way a
/// reconnecting client would, prints the ladder, and optionally resolves one
/// start rail.
pub async fn run_state_client(url: String, start: Option<usize>) -> Result<()> {
    let ws_url = format!("{}/ws", url.trim_end_matches('/'));
    debug!("connecting to {ws_url}");

    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(&ws_url)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            error!("failed to connect to {ws_url}: {e}");
            return Err(anyhow::anyhow!("connection failed: {e}"));
        }
        Err(_) => {
            return Err(anyhow::anyhow!(
                "connection timeout - is the hub running?"
            ));
        }
    };
    let (mut write, mut read) = ws_stream.split();

    // The hub greets a fresh connection with the full snapshot; the init
    // also carries the layout we need for resolution.
    let layout = timeout(Duration::from_secs(5), async {
        while let Some(msg) = read.next().await {
            if let Message::Text(text) = msg? {
                if let ServerMessage::Init { layout, .. } = serde_json::from_str(&text)? {
                    return Ok::<_, anyhow::Error>(layout);
                }
            }
        }
        Err(anyhow::anyhow!("connection closed before init"))
    })
    .await
    .map_err(|_| anyhow::anyhow!("timeout waiting for init"))??;

    // Ask explicitly, exercising the same path a reconnecting client takes.
    let request = serde_json::to_string(&ClientMessage::RequestState)?;
    write.send(Message::Text(request.into())).await?;

    let (rungs, phase) = timeout(Duration::from_secs(5), async {
        while let Some(msg) = read.next().await {
            if let Message::Text(text) = msg? {
                if let ServerMessage::StateUpdate { rungs, phase } = serde_json::from_str(&text)? {
                    return Ok::<_, anyhow::Error>((rungs, phase));
                }
            }
        }
        Err(anyhow::anyhow!("connection closed before state update"))
    })
    .await
    .map_err(|_| anyhow::anyhow!("timeout waiting for state update"))??;

    print_ladder(&layout, &rungs, phase);

    if let Some(start_rail) = start {
        let resolution = resolve_path(start_rail, &rungs, &layout)?;
        for step in &resolution.steps {
            match step {
                PathStep::Down { rail, from_y, to_y } => {
                    println!("  down rail {rail}: y {from_y:.1} -> {to_y:.1}");
                }
                PathStep::Cross { y, from_rail, to_rail } => {
                    println!("  cross at y {y:.1}: rail {from_rail} -> {to_rail}");
                }
            }
        }
        println!("start rail {start_rail} exits at rail {}", resolution.end_rail);
    }

    write.send(Message::Close(None)).await?;
    Ok(())
}

fn print_ladder(layout: &Layout, rungs: &[Rung], phase: Phase) {
    let phase_label = match phase {
        Phase::Drawing => "drawing",
        Phase::ShowingResults => "showing results",
    };
    println!(
        "ladder: {} rails ({}x{}), {} rung(s), phase: {phase_label}",
        layout.rails,
        layout.width,
        layout.height,
        rungs.len()
    );
    for rung in rungs {
        println!(
            "  rung {}: rail {} <-> {} at y {:.1}",
            rung.id, rung.rail_left, rung.rail_right, rung.y
        );
    }
}
