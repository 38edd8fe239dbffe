use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use freespeak_client::{ClientConfig, ClientError, ClientHandle, Event};
use freespeak_crypto::{Identity, PeerId};

#[derive(Parser, Debug)]
#[command(name = "freespeak", about = "End-to-end encrypted chat over a blind relay")]
struct Args {
    /// Relay WebSocket endpoint
    #[arg(long, env = "FREESPEAK_URL", default_value = "ws://127.0.0.1:3000/ws")]
    url: String,

    /// Id of the peer to talk to
    #[arg(long, env = "FREESPEAK_PEER")]
    peer: Option<String>,

    /// Do not send cover traffic
    #[arg(long, default_value_t = false)]
    no_decoys: bool,

    #[arg(long, env = "FREESPEAK_LOG_LEVEL", default_value = "warn")]
    log_level: String,
}

async fn connect_until_up(handle: &ClientHandle, url: &str, backoff: Duration) -> Result<()> {
    loop {
        match handle.connect(url).await {
            Ok(()) => return Ok(()),
            Err(ClientError::Closed) => return Err(ClientError::Closed.into()),
            Err(e) => {
                eprintln!("could not reach relay: {e}; retrying in {}s", backoff.as_secs());
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

fn render(event: &Event) {
    match event {
        Event::Connect { id, motd } => {
            println!("* connected; your id is {id}");
            if !motd.is_empty() {
                println!("* {motd}");
            }
        }
        Event::GetKeyFailed { id } => println!("* {id} is not online"),
        Event::Established { id, fingerprint } => {
            println!("* secure session with {id} (key fingerprint {fingerprint})")
        }
        Event::Msg { id, msg, retransmit } if !msg.is_decoy() => {
            let prefix = if *retransmit { "[RETRY] " } else { "" };
            match msg.body_text() {
                Some(text) => println!("{prefix}<{id}> {text}"),
                None => warn!("unreadable message body from {}", id),
            }
        }
        Event::Disconnect { id } => println!("* {id} disconnected"),
        Event::CryptoFail { id, reconnecting, .. } if *reconnecting => {
            println!("* {id} could not read our message, re-establishing session")
        }
        Event::Close { reconnectable: true } => println!("* lost connection to relay"),
        Event::Error { message } => println!("* relay: {message}"),
        other => debug!("event {}", other.qualified_name()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    freespeak_common::init_tracing_with_default(&args.log_level);

    let mut config = ClientConfig::default();
    if args.no_decoys {
        config.decoy = None;
    }
    let backoff = config.reconnect_delay;

    let mut current = args.peer.as_deref().map(PeerId::parse).transpose()?;

    let handle = ClientHandle::spawn(Identity::generate(), config);
    let mut events = handle.subscribe();
    connect_until_up(&handle, &args.url, backoff).await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            event = events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("dropped {} events", skipped);
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                render(&event);

                match event {
                    Event::Connect { .. } => {
                        if let Some(peer) = &current {
                            if let Err(e) = handle.get_key(peer.clone()).await {
                                println!("* lookup of {peer} failed: {e}");
                            }
                        }
                    }
                    Event::Established { id, .. } if current.is_none() => current = Some(id),
                    Event::Close { reconnectable: true } => {
                        println!("* reconnecting in {}s", backoff.as_secs());
                        tokio::time::sleep(backoff).await;
                        connect_until_up(&handle, &args.url, backoff).await?;
                    }
                    _ => {}
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match &current {
                    Some(peer) => {
                        if let Err(e) = handle.send_text(peer.clone(), line).await {
                            println!("* not sent: {e}");
                        }
                    }
                    None => println!("* no peer yet; share your id or restart with --peer"),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    handle.shutdown().await;
    Ok(())
}
