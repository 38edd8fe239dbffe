//! Client actor.
//!
//! A single task owns the relay transport, the per-connection handshake nonce
//! and every peer's [`ConnectionInfo`]. Front-ends talk to it through a
//! cloneable [`ClientHandle`] and observe it through a broadcast of [`Event`]s.
//! Frames are handled one at a time in arrival order.

use std::collections::HashMap;
use std::sync::Arc;

use freespeak_common::protocol::check_frame_len;
use freespeak_common::{ClientFrame, ServerFrame, MAX_FRAME_BYTES};
use freespeak_crypto::handshake::{create_offer, receive_offer, seal_response};
use freespeak_crypto::{
    codec, primitives, CryptoError, HandshakeNonce, Identity, PeerId, PublicKey,
};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::connection::{ClientStatus, ConnectionInfo, PeerSnapshot};
use crate::decoy::DecoyGenerator;
use crate::events::{Envelope, Event};
use crate::transport::{Connector, Transport, WsConnector};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("not connected to a relay")]
    NotConnected,

    #[error("no session with {0}")]
    NoSession(PeerId),

    #[error("client has shut down")]
    Closed,

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Common(#[from] freespeak_common::Error),
}

type Reply<T> = oneshot::Sender<Result<T, ClientError>>;

pub(crate) enum Command {
    Connect {
        url: String,
        reply: Reply<()>,
    },
    Disconnect {
        reply: Reply<()>,
    },
    GetKey {
        id: PeerId,
        reply: Reply<()>,
    },
    Offer {
        id: PeerId,
        pubkey: PublicKey,
        nonce: HandshakeNonce,
        reply: Reply<()>,
    },
    Accept {
        id: PeerId,
        reply: Reply<()>,
    },
    SendText {
        id: PeerId,
        text: String,
        reply: Reply<()>,
    },
    SendDecoy {
        id: PeerId,
        length: usize,
        reply: Option<Reply<()>>,
    },
    Forget {
        id: PeerId,
        reply: Reply<bool>,
    },
    Peer {
        id: PeerId,
        reply: Reply<Option<PeerSnapshot>>,
    },
    Status {
        reply: Reply<ClientStatus>,
    },
    Shutdown,
}

enum Timer {
    Heartbeat { epoch: u64 },
}

/// Handle to a running client. Cloning is cheap; the client stops once every
/// handle is dropped or [`ClientHandle::shutdown`] is called.
#[derive(Clone)]
pub struct ClientHandle {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<Event>,
    id: PeerId,
}

impl ClientHandle {
    /// Start a client that reaches the relay over WebSocket.
    pub fn spawn(identity: Identity, config: ClientConfig) -> Self {
        Self::spawn_with_connector(identity, config, WsConnector)
    }

    pub fn spawn_with_connector<C: Connector>(
        identity: Identity,
        config: ClientConfig,
        connector: C,
    ) -> Self {
        let (commands, command_rx) = mpsc::channel(config.command_capacity.max(1));
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let id = identity.id().clone();

        let decoy = config
            .decoy
            .clone()
            .map(|decoy| DecoyGenerator::spawn(decoy, commands.downgrade(), events.subscribe()));

        let actor = Actor {
            identity,
            config,
            connector: Arc::new(connector),
            events: events.clone(),
            commands: command_rx,
            timer_tx,
            timers: timer_rx,
            transport: None,
            status: ClientStatus::Disconnected,
            nonce: HandshakeNonce::generate(),
            epoch: 0,
            peers: HashMap::new(),
            heartbeat: None,
            decoy,
        };
        tokio::spawn(actor.run());

        Self { commands, events, id }
    }

    /// Our routing id, fixed for the lifetime of the identity.
    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Open the relay connection and register. Resolves once `key` is sent;
    /// the `connect` event follows when the relay acknowledges.
    pub async fn connect(&self, url: impl Into<String>) -> Result<(), ClientError> {
        let url = url.into();
        self.request(|reply| Command::Connect { url, reply }).await
    }

    pub async fn disconnect(&self) -> Result<(), ClientError> {
        self.request(|reply| Command::Disconnect { reply }).await
    }

    /// Look up a peer. With auto-handshake on, a successful lookup leads
    /// straight into an offer.
    pub async fn get_key(&self, id: PeerId) -> Result<(), ClientError> {
        self.request(|reply| Command::GetKey { id, reply }).await
    }

    pub async fn offer(
        &self,
        id: PeerId,
        pubkey: PublicKey,
        nonce: HandshakeNonce,
    ) -> Result<(), ClientError> {
        self.request(|reply| Command::Offer {
            id,
            pubkey,
            nonce,
            reply,
        })
        .await
    }

    /// Accept a verified offer. Only needed with auto-handshake off.
    pub async fn accept(&self, id: PeerId) -> Result<(), ClientError> {
        self.request(|reply| Command::Accept { id, reply }).await
    }

    pub async fn send_text(&self, id: PeerId, text: impl Into<String>) -> Result<(), ClientError> {
        let text = text.into();
        self.request(|reply| Command::SendText { id, text, reply }).await
    }

    pub async fn send_decoy(&self, id: PeerId, length: usize) -> Result<(), ClientError> {
        self.request(|reply| Command::SendDecoy {
            id,
            length,
            reply: Some(reply),
        })
        .await
    }

    /// Drop everything known about a peer. Returns whether it was known.
    pub async fn forget(&self, id: PeerId) -> Result<bool, ClientError> {
        self.request(|reply| Command::Forget { id, reply }).await
    }

    pub async fn peer(&self, id: PeerId) -> Result<Option<PeerSnapshot>, ClientError> {
        self.request(|reply| Command::Peer { id, reply }).await
    }

    pub async fn status(&self) -> Result<ClientStatus, ClientError> {
        self.request(|reply| Command::Status { reply }).await
    }

    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .await
            .map_err(|_| ClientError::Closed)?;
        rx.await.map_err(|_| ClientError::Closed)?
    }
}

enum Wake {
    Command(Option<Command>),
    Frame(Option<String>),
    Timer(Timer),
}

struct Actor {
    identity: Identity,
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    events: broadcast::Sender<Event>,
    commands: mpsc::Receiver<Command>,
    timer_tx: mpsc::UnboundedSender<Timer>,
    timers: mpsc::UnboundedReceiver<Timer>,
    transport: Option<Transport>,
    status: ClientStatus,
    /// Regenerated on every connect.
    nonce: HandshakeNonce,
    /// Bumped whenever the relay connection closes; timers from an older
    /// epoch are ignored.
    epoch: u64,
    peers: HashMap<PeerId, ConnectionInfo>,
    heartbeat: Option<JoinHandle<()>>,
    decoy: Option<JoinHandle<()>>,
}

async fn recv_frame(transport: &mut Option<Transport>) -> Option<String> {
    match transport {
        Some(transport) => transport.incoming.recv().await,
        None => std::future::pending().await,
    }
}

impl Actor {
    async fn run(mut self) {
        loop {
            let wake = tokio::select! {
                cmd = self.commands.recv() => Wake::Command(cmd),
                frame = recv_frame(&mut self.transport) => Wake::Frame(frame),
                Some(timer) = self.timers.recv() => Wake::Timer(timer),
            };

            match wake {
                Wake::Command(None) | Wake::Command(Some(Command::Shutdown)) => break,
                Wake::Command(Some(cmd)) => self.handle_command(cmd).await,
                Wake::Frame(Some(text)) => self.handle_frame(&text).await,
                Wake::Frame(None) => {
                    info!("relay connection lost");
                    self.close(true);
                }
                Wake::Timer(timer) => self.handle_timer(timer).await,
            }
        }

        if self.transport.is_some() {
            self.close(false);
        }
        if let Some(decoy) = self.decoy.take() {
            decoy.abort();
        }
        debug!("client {} stopped", self.identity.id());
    }

    fn emit(&self, event: Event) {
        let _ = self.events.send(event);
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect { url, reply } => {
                let _ = reply.send(self.connect(url).await);
            }
            Command::Disconnect { reply } => {
                if self.transport.is_some() {
                    self.close(false);
                }
                let _ = reply.send(Ok(()));
            }
            Command::GetKey { id, reply } => {
                let _ = reply.send(self.request_key(&id).await);
            }
            Command::Offer {
                id,
                pubkey,
                nonce,
                reply,
            } => {
                let _ = reply.send(self.send_offer(&id, &pubkey, &nonce).await);
            }
            Command::Accept { id, reply } => {
                let _ = reply.send(self.send_accept(&id).await);
            }
            Command::SendText { id, text, reply } => {
                let result = self
                    .send_message(&id, Envelope::text(&text), Some(&text), false)
                    .await;
                let _ = reply.send(result);
            }
            Command::SendDecoy { id, length, reply } => {
                let result = self
                    .send_message(&id, Envelope::decoy(length), None, false)
                    .await;
                match reply {
                    Some(reply) => {
                        let _ = reply.send(result);
                    }
                    None => {
                        if let Err(e) = result {
                            debug!("decoy to {} not sent: {}", id, e);
                        }
                    }
                }
            }
            Command::Forget { id, reply } => {
                let _ = reply.send(Ok(self.peers.remove(&id).is_some()));
            }
            Command::Peer { id, reply } => {
                let _ = reply.send(Ok(self.peers.get(&id).map(ConnectionInfo::snapshot)));
            }
            Command::Status { reply } => {
                let _ = reply.send(Ok(self.status));
            }
            Command::Shutdown => {}
        }
    }

    async fn connect(&mut self, url: String) -> Result<(), ClientError> {
        if self.transport.is_some() {
            self.close(false);
        }

        self.status = ClientStatus::Connecting;
        self.emit(Event::Connecting { url: url.clone() });

        let transport = match self.connector.connect(&url).await {
            Ok(transport) => transport,
            Err(e) => {
                warn!("failed to connect to {}: {}", url, e);
                self.status = ClientStatus::Disconnected;
                self.emit(Event::Error {
                    message: e.to_string(),
                });
                return Err(freespeak_common::Error::transport(e).into());
            }
        };
        info!("connected to relay at {}", url);

        self.transport = Some(transport);
        self.status = ClientStatus::Connected;
        self.nonce = HandshakeNonce::generate();

        self.send(ClientFrame::Key {
            pubkey: self.identity.serialized_public_key().to_string(),
            nonce: self.nonce.to_base64(),
        })
        .await?;
        self.emit(Event::KeySent);

        self.send_heartbeat().await
    }

    /// Tear down the relay connection. Key material stays so sessions can
    /// resume after reconnecting.
    fn close(&mut self, reconnectable: bool) {
        self.transport = None;
        self.status = ClientStatus::Disconnected;
        self.epoch += 1;
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
        for info in self.peers.values_mut() {
            info.mark_disconnected();
        }
        self.emit(Event::Close { reconnectable });
    }

    async fn send(&self, frame: ClientFrame) -> Result<(), ClientError> {
        let transport = self.transport.as_ref().ok_or(ClientError::NotConnected)?;
        debug!("-> {}", frame.opcode().as_str());
        transport
            .outgoing
            .send(frame.to_json())
            .await
            .map_err(|_| ClientError::NotConnected)
    }

    async fn send_heartbeat(&mut self) -> Result<(), ClientError> {
        self.send(ClientFrame::Heartbeat).await?;
        self.emit(Event::HeartbeatSent);
        Ok(())
    }

    fn schedule_heartbeat(&mut self) {
        if let Some(previous) = self.heartbeat.take() {
            previous.abort();
        }
        let timers = self.timer_tx.clone();
        let epoch = self.epoch;
        let delay = self.config.heartbeat_interval;
        self.heartbeat = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = timers.send(Timer::Heartbeat { epoch });
        }));
    }

    async fn handle_timer(&mut self, timer: Timer) {
        match timer {
            Timer::Heartbeat { epoch } => {
                if epoch != self.epoch || self.transport.is_none() {
                    return;
                }
                self.heartbeat = None;
                if let Err(e) = self.send_heartbeat().await {
                    debug!("heartbeat not sent: {}", e);
                }
            }
        }
    }

    async fn request_key(&mut self, id: &PeerId) -> Result<(), ClientError> {
        self.send(ClientFrame::GetKey { id: id.to_string() }).await?;
        self.emit(Event::GetKeySent { id: id.clone() });
        Ok(())
    }

    async fn send_offer(
        &mut self,
        id: &PeerId,
        pubkey: &PublicKey,
        nonce: &HandshakeNonce,
    ) -> Result<(), ClientError> {
        if self.transport.is_none() {
            return Err(ClientError::NotConnected);
        }
        let (sealed, state) = create_offer(&self.identity, &self.nonce, pubkey, nonce).await?;
        self.peers
            .entry(id.clone())
            .or_insert_with(|| ConnectionInfo::new(id.clone()))
            .offer_sent(state);

        self.send(ClientFrame::Offer {
            peer_id: id.to_string(),
            encrypted_nonce: sealed.encrypted_nonce,
            nonce_hash: sealed.nonce_hash,
        })
        .await?;
        self.emit(Event::OfferSent { id: id.clone() });
        Ok(())
    }

    async fn send_accept(&mut self, id: &PeerId) -> Result<(), ClientError> {
        if self.transport.is_none() {
            return Err(ClientError::NotConnected);
        }
        let info = self
            .peers
            .get_mut(id)
            .ok_or_else(|| ClientError::NoSession(id.clone()))?;
        let accept = info
            .take_accept()
            .ok_or_else(|| ClientError::NoSession(id.clone()))?;
        let retransmit = info.take_retransmit();

        self.send(ClientFrame::Accept {
            peer_id: id.to_string(),
            encrypted_response_hash: seal_response(&accept)?,
        })
        .await?;
        self.emit(Event::AcceptSent { id: id.clone() });

        if let Some(text) = retransmit {
            self.retransmit(id, &text).await;
        }
        Ok(())
    }

    async fn retransmit(&mut self, id: &PeerId, text: &str) {
        info!("retransmitting last message to {}", id);
        if let Err(e) = self.send_message(id, Envelope::text(text), Some(text), true).await {
            warn!("retransmission to {} failed: {}", id, e);
        }
    }

    async fn send_message(
        &mut self,
        id: &PeerId,
        envelope: Envelope,
        plaintext: Option<&str>,
        retransmit: bool,
    ) -> Result<(), ClientError> {
        if self.transport.is_none() {
            return Err(ClientError::NotConnected);
        }
        let frame = {
            let info = self
                .peers
                .get_mut(id)
                .ok_or_else(|| ClientError::NoSession(id.clone()))?;
            let key = info
                .session_key()
                .ok_or_else(|| ClientError::NoSession(id.clone()))?;
            let payload = envelope
                .to_bytes()
                .map_err(freespeak_common::Error::serialization)?;
            let ciphertext = codec::encode(key, &payload)?;
            let frame = ClientFrame::Msg {
                peer_id: id.to_string(),
                ciphertext: ciphertext.clone(),
                retransmit,
            };

            // The relay rejects oversized frames, so they never become
            // retransmission candidates.
            check_frame_len(&frame.to_json(), MAX_FRAME_BYTES)
                .map_err(freespeak_common::Error::from)?;
            if let Some(text) = plaintext {
                info.record_text(text, &ciphertext);
            }
            frame
        };

        self.send(frame).await?;
        self.emit(Event::SendMsg {
            id: id.clone(),
            msg: envelope,
            retransmit,
        });
        Ok(())
    }

    async fn send_crypto_fail(&mut self, id: &PeerId, ciphertext: &str) {
        let hash = primitives::truncated_hash(ciphertext.as_bytes());
        let frame = ClientFrame::CryptoFail {
            peer_id: id.to_string(),
            hash: Some(hash.clone()),
        };
        match self.send(frame).await {
            Ok(()) => self.emit(Event::SendCryptoFail {
                id: id.clone(),
                hash,
            }),
            Err(e) => debug!("cryptofail to {} not sent: {}", id, e),
        }
    }

    async fn handle_frame(&mut self, text: &str) {
        let frame = match ServerFrame::parse(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("ignoring unreadable frame from relay: {}", e);
                return;
            }
        };
        debug!("<- {}", frame.opcode().as_str());

        match frame {
            ServerFrame::Key { id, motd } => self.on_registered(&id, motd),
            ServerFrame::GetKey { id, pubkey, nonce } => self.on_get_key(&id, pubkey, nonce).await,
            ServerFrame::Offer {
                peer_id,
                pubkey,
                nonce,
                encrypted_nonce,
                nonce_hash,
            } => {
                self.on_offer(&peer_id, &pubkey, &nonce, &encrypted_nonce, &nonce_hash)
                    .await
            }
            ServerFrame::Accept {
                peer_id,
                encrypted_response_hash,
            } => self.on_accept(&peer_id, &encrypted_response_hash).await,
            ServerFrame::Msg {
                peer_id,
                ciphertext,
                retransmit,
            } => self.on_msg(&peer_id, &ciphertext, retransmit).await,
            ServerFrame::CryptoFail { peer_id, hash } => self.on_crypto_fail(&peer_id, hash).await,
            ServerFrame::Disconnect { peer_id } => {
                let Some(id) = parse_peer(&peer_id) else { return };
                if let Some(info) = self.peers.get_mut(&id) {
                    info.mark_disconnected();
                    self.emit(Event::Disconnect { id });
                }
            }
            ServerFrame::Heartbeat => {
                self.emit(Event::Heartbeat);
                self.schedule_heartbeat();
            }
            ServerFrame::Error { message } => {
                warn!("relay error: {}", message);
                self.emit(Event::Error { message });
            }
        }
    }

    fn on_registered(&mut self, id: &str, motd: String) {
        let Some(id) = parse_peer(id) else { return };
        if &id != self.identity.id() {
            warn!("relay registered us as {} but our id is {}", id, self.identity.id());
        }
        info!("registered as {}", id);
        self.status = ClientStatus::Registered;
        self.emit(Event::Connect { id, motd });
    }

    async fn on_get_key(&mut self, id: &str, pubkey: Option<String>, nonce: Option<String>) {
        let Some(id) = parse_peer(id) else { return };
        let (Some(pubkey), Some(nonce)) = (pubkey, nonce) else {
            self.emit(Event::GetKeyFailed { id });
            return;
        };
        let (pubkey, nonce) = match verified_peer_key(&id, &pubkey, &nonce) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("rejecting key for {}: {}", id, e);
                self.emit(Event::GetKeyFailed { id });
                return;
            }
        };

        self.emit(Event::GetKey {
            id: id.clone(),
            pubkey,
            nonce: nonce.clone(),
        });

        if self.config.auto_handshake {
            if let Err(e) = self.send_offer(&id, &pubkey, &nonce).await {
                warn!("offer to {} failed: {}", id, e);
            }
        }
    }

    async fn on_offer(
        &mut self,
        sender: &str,
        pubkey: &str,
        nonce: &str,
        encrypted_nonce: &str,
        nonce_hash: &str,
    ) {
        let Some(id) = parse_peer(sender) else { return };
        let (sender_key, sender_nonce) = match verified_peer_key(&id, pubkey, nonce) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!("ignoring offer from {}: {}", id, e);
                return;
            }
        };

        let accept = match receive_offer(
            &self.identity,
            &self.nonce,
            &id,
            &sender_key,
            &sender_nonce,
            encrypted_nonce,
            nonce_hash,
        )
        .await
        {
            Ok(accept) => accept,
            Err(e) => {
                warn!("ignoring offer from {}: {}", id, e);
                return;
            }
        };

        let fingerprint = self
            .peers
            .entry(id.clone())
            .or_insert_with(|| ConnectionInfo::new(id.clone()))
            .offer_received(accept)
            .fingerprint();

        self.emit(Event::Offer { id: id.clone() });
        self.emit(Event::Established {
            id: id.clone(),
            fingerprint,
        });

        if self.config.auto_handshake {
            if let Err(e) = self.send_accept(&id).await {
                warn!("accept to {} failed: {}", id, e);
            }
        }
    }

    async fn on_accept(&mut self, sender: &str, encrypted_response_hash: &str) {
        let Some(id) = parse_peer(sender) else { return };
        let Some(info) = self.peers.get_mut(&id) else {
            debug!("ignoring accept from unknown peer {}", id);
            return;
        };

        let fingerprint = match info.accept_received(encrypted_response_hash) {
            Ok(key) => key.fingerprint(),
            Err(e) => {
                warn!("ignoring accept from {}: {}", id, e);
                return;
            }
        };
        let retransmit = info.take_retransmit();

        self.emit(Event::Accept { id: id.clone() });
        self.emit(Event::Established {
            id: id.clone(),
            fingerprint,
        });

        if let Some(text) = retransmit {
            self.retransmit(&id, &text).await;
        }
    }

    async fn on_msg(&mut self, sender: &str, ciphertext: &str, retransmit: bool) {
        let Some(id) = parse_peer(sender) else { return };

        let decoded = self
            .peers
            .get(&id)
            .and_then(ConnectionInfo::session_key)
            .ok_or_else(|| CryptoError::Malformed("no session key".into()))
            .and_then(|key| codec::decode(key, ciphertext))
            .and_then(|plaintext| {
                Envelope::from_bytes(&plaintext).map_err(|e| CryptoError::Malformed(e.to_string()))
            });

        match decoded {
            Ok(msg) => self.emit(Event::Msg { id, msg, retransmit }),
            Err(e) => {
                warn!("could not decipher message from {}: {}", id, e);
                self.send_crypto_fail(&id, ciphertext).await;
            }
        }
    }

    async fn on_crypto_fail(&mut self, sender: &str, hash: Option<String>) {
        let Some(id) = parse_peer(sender) else { return };

        let reconnecting = match self.peers.get_mut(&id) {
            Some(info) => {
                if info.crypto_failed(hash.as_deref()) {
                    info!("{} could not read our last message, queued for retransmission", id);
                }
                true
            }
            None => false,
        };
        if reconnecting {
            if let Err(e) = self.request_key(&id).await {
                warn!("could not re-request key for {}: {}", id, e);
            }
        }

        self.emit(Event::CryptoFail {
            id,
            hash,
            reconnecting,
        });
    }
}

fn parse_peer(value: &str) -> Option<PeerId> {
    match PeerId::parse(value) {
        Ok(id) => Some(id),
        Err(e) => {
            warn!("relay sent an invalid peer id {:?}: {}", value, e);
            None
        }
    }
}

/// Parse a key and nonce relayed for `id`, refusing a key that does not hash
/// to that id.
fn verified_peer_key(
    id: &PeerId,
    pubkey: &str,
    nonce: &str,
) -> Result<(PublicKey, HandshakeNonce), CryptoError> {
    let pubkey = PublicKey::from_base64(pubkey)?;
    if &PeerId::from_public_key(&pubkey) != id {
        return Err(CryptoError::HandshakeMismatch("public key does not match peer id"));
    }
    let nonce = HandshakeNonce::from_base64(nonce)?;
    Ok((pubkey, nonce))
}
