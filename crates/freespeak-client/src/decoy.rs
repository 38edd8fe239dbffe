//! Cover traffic.
//!
//! The generator watches client events and schedules decoy messages after
//! random delays. Each peer has one live token; scheduling a new decoy or
//! seeing the peer drop replaces it, and a decoy whose token is stale when its
//! delay runs out is discarded.

use std::collections::HashMap;

use rand::Rng;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, warn};

use freespeak_crypto::PeerId;

use crate::client::Command;
use crate::config::DecoyConfig;
use crate::events::{EnvelopeKind, Event};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Cause {
    Spontaneous,
    Continuation,
    Reply,
}

struct Scheduled {
    at: Instant,
    peer: PeerId,
    token: u64,
    length: usize,
}

pub(crate) struct DecoyGenerator {
    config: DecoyConfig,
    commands: mpsc::WeakSender<Command>,
    events: broadcast::Receiver<Event>,
    tokens: HashMap<PeerId, u64>,
    next_token: u64,
    scheduled: Vec<Scheduled>,
}

impl DecoyGenerator {
    pub(crate) fn spawn(
        config: DecoyConfig,
        commands: mpsc::WeakSender<Command>,
        events: broadcast::Receiver<Event>,
    ) -> JoinHandle<()> {
        let generator = Self {
            config,
            commands,
            events,
            tokens: HashMap::new(),
            next_token: 0,
            scheduled: Vec::new(),
        };
        tokio::spawn(generator.run())
    }

    async fn run(mut self) {
        loop {
            let next = self.scheduled.iter().map(|decoy| decoy.at).min();
            tokio::select! {
                event = self.events.recv() => match event {
                    Ok(event) => self.observe(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("decoy generator missed {} events", skipped);
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = sleep_until_next(next) => {
                    if !self.fire_due().await {
                        break;
                    }
                }
            }
        }
        debug!("decoy generator stopped");
    }

    fn observe(&mut self, event: &Event) {
        match event {
            Event::Established { id, .. } => self.schedule(id, Cause::Spontaneous),
            Event::SendMsg { id, msg, .. } if msg.kind == EnvelopeKind::Text => {
                self.schedule(id, Cause::Continuation)
            }
            Event::Msg { id, msg, .. } if msg.kind == EnvelopeKind::Text => {
                self.schedule(id, Cause::Reply)
            }
            Event::Disconnect { id } | Event::CryptoFail { id, .. } => {
                self.tokens.remove(id);
            }
            Event::Close { .. } => {
                self.tokens.clear();
                self.scheduled.clear();
            }
            _ => {}
        }
    }

    fn schedule(&mut self, peer: &PeerId, cause: Cause) {
        let mut rng = rand::thread_rng();
        let cause = match cause {
            Cause::Reply if rng.gen::<f64>() >= self.config.reply_probability => Cause::Spontaneous,
            Cause::Continuation if rng.gen::<f64>() >= self.config.continuation_probability => {
                Cause::Spontaneous
            }
            cause => cause,
        };
        let (delay, length) = match cause {
            Cause::Spontaneous => (
                self.config.spontaneous_delay.sample(),
                self.config.spontaneous_length.sample(),
            ),
            Cause::Continuation => (
                self.config.continuation_delay.sample(),
                self.config.continuation_length.sample(),
            ),
            Cause::Reply => (
                self.config.reply_delay.sample(),
                self.config.reply_length.sample(),
            ),
        };

        self.next_token += 1;
        let token = self.next_token;
        self.tokens.insert(peer.clone(), token);
        self.scheduled.push(Scheduled {
            at: Instant::now() + delay,
            peer: peer.clone(),
            token,
            length,
        });
        debug!("{:?} decoy for {} in {:?}", cause, peer, delay);
    }

    /// Send every decoy whose time has come. Returns false once the client
    /// is gone.
    async fn fire_due(&mut self) -> bool {
        let now = Instant::now();
        let (due, pending): (Vec<_>, Vec<_>) = self
            .scheduled
            .drain(..)
            .partition(|decoy| decoy.at <= now);
        self.scheduled = pending;

        for decoy in due {
            if self.tokens.get(&decoy.peer) != Some(&decoy.token) {
                continue;
            }
            self.tokens.remove(&decoy.peer);

            let Some(commands) = self.commands.upgrade() else {
                return false;
            };
            let command = Command::SendDecoy {
                id: decoy.peer,
                length: decoy.length,
                reply: None,
            };
            if commands.send(command).await.is_err() {
                return false;
            }
        }
        true
    }
}

async fn sleep_until_next(at: Option<Instant>) {
    match at {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Uniform;
    use crate::events::Envelope;
    use std::time::Duration;
    use tokio::time::timeout;

    const HOUR: Duration = Duration::from_secs(3600);

    fn fixed(secs: u64) -> Uniform<Duration> {
        Uniform::new(Duration::from_secs(secs), Duration::from_secs(secs))
    }

    fn fixed_config() -> DecoyConfig {
        DecoyConfig {
            reply_probability: 1.0,
            reply_delay: fixed(2),
            reply_length: Uniform::new(16, 16),
            continuation_probability: 1.0,
            continuation_delay: fixed(10),
            continuation_length: Uniform::new(8, 8),
            spontaneous_delay: fixed(60),
            spontaneous_length: Uniform::new(32, 32),
        }
    }

    struct Harness {
        events: broadcast::Sender<Event>,
        commands: mpsc::Receiver<Command>,
        _keepalive: mpsc::Sender<Command>,
        generator: JoinHandle<()>,
    }

    impl Harness {
        fn start(config: DecoyConfig) -> Self {
            let (tx, rx) = mpsc::channel(16);
            let (events, _) = broadcast::channel(16);
            let generator = DecoyGenerator::spawn(config, tx.downgrade(), events.subscribe());
            Self {
                events,
                commands: rx,
                _keepalive: tx,
                generator,
            }
        }

        async fn emit(&self, event: Event) {
            self.events.send(event).unwrap();
            for _ in 0..8 {
                tokio::task::yield_now().await;
            }
        }

        async fn next_decoy(&mut self) -> Option<(PeerId, usize)> {
            match timeout(HOUR, self.commands.recv()).await {
                Ok(Some(Command::SendDecoy { id, length, .. })) => Some((id, length)),
                Ok(_) => panic!("unexpected command"),
                Err(_) => None,
            }
        }
    }

    fn assert_elapsed(start: Instant, secs: u64) {
        let elapsed = start.elapsed();
        assert!(
            elapsed >= Duration::from_secs(secs) && elapsed < Duration::from_secs(secs + 1),
            "fired after {elapsed:?}, expected {secs}s"
        );
    }

    fn peer() -> PeerId {
        PeerId::parse("a1b2c3d4").unwrap()
    }

    fn sent_text() -> Event {
        Event::SendMsg {
            id: peer(),
            msg: Envelope::text("hi"),
            retransmit: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_spontaneous_decoy_after_establish() {
        let mut harness = Harness::start(fixed_config());
        let start = Instant::now();
        harness
            .emit(Event::Established {
                id: peer(),
                fingerprint: "00000000".into(),
            })
            .await;

        assert_eq!(harness.next_decoy().await, Some((peer(), 32)));
        assert_elapsed(start, 60);
        assert_eq!(harness.next_decoy().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_ranges() {
        let mut harness = Harness::start(DecoyConfig::default());
        let start = Instant::now();
        harness
            .emit(Event::Established {
                id: peer(),
                fingerprint: "00000000".into(),
            })
            .await;

        let (_, length) = harness.next_decoy().await.unwrap();
        assert!((30..128).contains(&length));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(60) && elapsed < Duration::from_secs(600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_message_supersedes_pending_decoy() {
        let mut harness = Harness::start(fixed_config());
        let start = Instant::now();

        harness.emit(sent_text()).await;
        tokio::time::advance(Duration::from_secs(5)).await;
        harness.emit(sent_text()).await;

        assert_eq!(harness.next_decoy().await, Some((peer(), 8)));
        assert_elapsed(start, 15);
        assert_eq!(harness.next_decoy().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reply_to_incoming_text_only() {
        let mut harness = Harness::start(fixed_config());

        harness
            .emit(Event::Msg {
                id: peer(),
                msg: Envelope::decoy(10),
                retransmit: false,
            })
            .await;
        assert_eq!(harness.next_decoy().await, None);

        harness
            .emit(Event::Msg {
                id: peer(),
                msg: Envelope::text("hello"),
                retransmit: false,
            })
            .await;
        assert_eq!(harness.next_decoy().await, Some((peer(), 16)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlikely_cause_falls_back_to_spontaneous() {
        let config = DecoyConfig {
            continuation_probability: 0.0,
            ..fixed_config()
        };
        let mut harness = Harness::start(config);
        let start = Instant::now();

        harness.emit(sent_text()).await;
        assert_eq!(harness.next_decoy().await, Some((peer(), 32)));
        assert_elapsed(start, 60);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_and_close_cancel_decoys() {
        let mut harness = Harness::start(fixed_config());

        harness.emit(sent_text()).await;
        harness.emit(Event::Disconnect { id: peer() }).await;
        assert_eq!(harness.next_decoy().await, None);

        harness.emit(sent_text()).await;
        harness.emit(Event::Close { reconnectable: true }).await;
        assert_eq!(harness.next_decoy().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_when_client_is_gone() {
        let Harness {
            events,
            commands,
            _keepalive,
            generator,
        } = Harness::start(fixed_config());
        drop(commands);
        drop(_keepalive);

        events.send(sent_text()).unwrap();
        timeout(HOUR, generator).await.unwrap().unwrap();
    }
}
