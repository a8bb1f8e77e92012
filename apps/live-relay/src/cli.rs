use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::time::{timeout, Duration, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error};

use crate::signaling::{ClientMessage, ServerMessage};

#[derive(Parser, Debug)]
#[command(name = "live-relay")]
#[command(about = "Live session signaling relay and probe client")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the relay server (default when no command is given)
    Serve {
        /// Listen port; overrides LIVE_RELAY_PORT
        #[arg(short, long, env = "LIVE_RELAY_PORT")]
        port: Option<u16>,
    },
    /// Join a room and print every frame the relay sends
    Probe {
        /// Relay websocket endpoint
        #[arg(short, long, default_value = "ws://localhost:8080/ws")]
        url: String,

        /// Room to join
        #[arg(short, long)]
        room: String,

        /// User id to join as
        #[arg(long, default_value = "probe")]
        user: String,

        /// Display name
        #[arg(long, default_value = "Probe")]
        name: String,

        /// Chat message to send once joined
        #[arg(long)]
        say: Option<String>,

        /// Leave after this many seconds; runs until Ctrl-C otherwise
        #[arg(long)]
        seconds: Option<u64>,
    },
}

fn frame(message: &ClientMessage) -> Result<Message> {
    let text = serde_json::to_string(message)?;
    Ok(Message::Text(text.into()))
}

pub async fn run_probe(
    url: String,
    room: String,
    user: String,
    name: String,
    say: Option<String>,
    seconds: Option<u64>,
) -> Result<()> {
    debug!("connecting to {} for room {}", url, room);

    let (ws_stream, _) = match timeout(Duration::from_secs(5), connect_async(&url)).await {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => {
            error!("failed to connect to {}: {}", url, e);
            return Err(anyhow!("connection failed: {}", e));
        }
        Err(_) => {
            return Err(anyhow!(
                "connection timeout after 5 seconds - is the relay running?"
            ));
        }
    };
    let (mut write, mut read) = ws_stream.split();

    write
        .send(frame(&ClientMessage::JoinRoom {
            room_id: room.clone(),
            user_id: user.clone(),
            user_name: name.clone(),
        })?)
        .await
        .context("sending join-room")?;

    if let Some(text) = say {
        write
            .send(frame(&ClientMessage::ChatMessage {
                room_id: room.clone(),
                user_id: user.clone(),
                user_name: name,
                message: Value::String(text),
            })?)
            .await
            .context("sending chat-message")?;
    }

    let deadline = seconds.map(|secs| Instant::now() + Duration::from_secs(secs));
    loop {
        let next = async {
            match deadline {
                Some(at) => tokio::time::timeout_at(at, read.next()).await.ok(),
                None => Some(read.next().await),
            }
        };
        let received = tokio::select! {
            received = next => received,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(Some(received)) = received else {
            break;
        };
        match received? {
            Message::Text(text) => match serde_json::from_str::<ServerMessage>(text.as_str()) {
                Ok(message) => println!("{}", serde_json::to_string_pretty(&message)?),
                Err(_) => println!("{}", text.as_str()),
            },
            Message::Close(close) => {
                if let Some(close) = close {
                    println!(
                        "closed by relay: {} {}",
                        u16::from(close.code),
                        close.reason.as_str()
                    );
                }
                return Ok(());
            }
            _ => {}
        }
    }

    write
        .send(frame(&ClientMessage::LeaveRoom {
            room_id: room,
            user_id: user,
        })?)
        .await
        .context("sending leave-room")?;
    let _ = write.close().await;
    Ok(())
}
