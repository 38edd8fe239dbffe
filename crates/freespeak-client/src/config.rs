use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);
const DEFAULT_EVENT_CAPACITY: usize = 256;
const DEFAULT_COMMAND_CAPACITY: usize = 64;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Delay between a heartbeat acknowledgement and the next heartbeat.
    pub heartbeat_interval: Duration,
    /// Backoff the front-end waits before reconnecting after a lost relay.
    pub reconnect_delay: Duration,
    /// Offer as soon as a `getkey` succeeds and accept every verified offer.
    pub auto_handshake: bool,
    /// Cover traffic settings. `None` disables decoys.
    pub decoy: Option<DecoyConfig>,
    pub event_capacity: usize,
    pub command_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            auto_handshake: true,
            decoy: Some(DecoyConfig::default()),
            event_capacity: DEFAULT_EVENT_CAPACITY,
            command_capacity: DEFAULT_COMMAND_CAPACITY,
        }
    }
}

/// Half-open uniform range `[min, max)`. A degenerate range always yields `min`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Uniform<T> {
    pub min: T,
    pub max: T,
}

impl<T> Uniform<T> {
    pub const fn new(min: T, max: T) -> Self {
        Self { min, max }
    }
}

impl Uniform<usize> {
    pub fn sample(&self) -> usize {
        if self.max <= self.min {
            return self.min;
        }
        rand::thread_rng().gen_range(self.min..self.max)
    }
}

impl Uniform<Duration> {
    pub fn sample(&self) -> Duration {
        if self.max <= self.min {
            return self.min;
        }
        rand::thread_rng().gen_range(self.min..self.max)
    }
}

/// Decoy timing and sizing.
///
/// A decoy is caused by one of three things: a fresh session (spontaneous),
/// our own real message (continuation) or the peer's real message (reply).
/// Continuation and reply decoys only keep their cause with the configured
/// probability and fall back to spontaneous timing otherwise.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecoyConfig {
    pub reply_probability: f64,
    pub reply_delay: Uniform<Duration>,
    pub reply_length: Uniform<usize>,

    pub continuation_probability: f64,
    pub continuation_delay: Uniform<Duration>,
    pub continuation_length: Uniform<usize>,

    pub spontaneous_delay: Uniform<Duration>,
    pub spontaneous_length: Uniform<usize>,
}

impl Default for DecoyConfig {
    fn default() -> Self {
        Self {
            reply_probability: 0.9,
            reply_delay: Uniform::new(Duration::from_secs(1), Duration::from_secs(120)),
            reply_length: Uniform::new(1, 128),

            continuation_probability: 0.1,
            continuation_delay: Uniform::new(Duration::from_secs(60), Duration::from_secs(600)),
            continuation_length: Uniform::new(1, 128),

            spontaneous_delay: Uniform::new(Duration::from_secs(60), Duration::from_secs(600)),
            spontaneous_length: Uniform::new(30, 128),
        }
    }
}
