//! Session: owns discovery, pairing, the transport channels and the transfer
//! engine, and routes every inbound message to the right one.
//!
//! Inbound traffic from all channels funnels into one mpsc queue. A dispatcher
//! task pulls from it and handles each message on its own task, so a slow
//! file write never holds up acknowledgments for the next chunk.

use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use nearfile_core::message::{DeviceState, LinkState, PairCancel, PairRequest, PairResponse, Prepare};
use nearfile_core::{
    now_millis, CancelOrigin, DeviceId, Error, Identity, LinkKind, Message, PairCode,
    PairingController, PairingError, Peer, PeerChange, PeerTable, RequestDisposition,
    TransferError, TransferId, TransferStatus, TransportError,
};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::discovery::DiscoveryService;
use crate::engine::{EngineSettings, TransferEngine};
use crate::events::{SessionEvent, EVENT_CAPACITY};
use crate::storage::FileStore;
use crate::transport::datagram::DatagramSettings;
use crate::transport::{
    DatagramChannel, Inbound, InboundSender, Origin, RadioChannel, RadioLink, TransportChannel,
};

/// Reconnect attempts after the link drops mid-transfer.
pub const RECONNECT_ATTEMPTS: u32 = 3;

struct State {
    peers: PeerTable,
    pairing: PairingController,
    pairing_timer: Option<JoinHandle<()>>,
    /// Where the pending inbound pair_request came from; the response goes back there.
    request_origin: Option<Origin>,
    datagram: Option<Arc<DatagramChannel>>,
    discovery: Option<DiscoveryService>,
    radio: Option<Arc<RadioChannel>>,
    reconnect: Option<JoinHandle<()>>,
    pruner: Option<JoinHandle<()>>,
}

impl State {
    fn channel(&self, link: LinkKind) -> Result<Arc<dyn TransportChannel>, TransportError> {
        let channel: Option<Arc<dyn TransportChannel>> = match link {
            LinkKind::Datagram => self.datagram.clone().map(|c| c as Arc<dyn TransportChannel>),
            LinkKind::Radio => self.radio.clone().map(|c| c as Arc<dyn TransportChannel>),
        };
        channel.ok_or(TransportError::LinkUnavailable)
    }

    /// The paired peer, if `origin` is one of its links. Still found while the
    /// link is being re-established.
    fn paired_peer(&self, origin: &Origin) -> Option<&Peer> {
        let id = self.pairing.connected_peer()?;
        self.peers.get(id).filter(|p| origin.is_from(p))
    }

    fn stop_pairing_timer(&mut self) {
        if let Some(timer) = self.pairing_timer.take() {
            timer.abort();
        }
    }

    fn stop_tasks(&mut self) {
        self.stop_pairing_timer();
        for task in [self.reconnect.take(), self.pruner.take()].into_iter().flatten() {
            task.abort();
        }
    }
}

struct Inner {
    identity: Arc<Identity>,
    config: Config,
    events: broadcast::Sender<SessionEvent>,
    engine: TransferEngine,
    inbound: InboundSender,
    dispatcher: JoinHandle<()>,
    state: Mutex<State>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.dispatcher.abort();
        self.state.get_mut().stop_tasks();
    }
}

/// Handle to a running session. Cheap to clone; all clones share one session.
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<Inner>,
}

impl SessionController {
    /// Create a session. Nothing is bound until [`start_discovery`](Self::start_discovery)
    /// or [`attach_radio`](Self::attach_radio).
    pub fn new(config: Config, store: Arc<dyn FileStore>) -> Self {
        let identity = Arc::new(Identity::new(config.device_name.clone()));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (inbound, inbound_rx) = mpsc::unbounded_channel();
        let engine = TransferEngine::new(EngineSettings::from_config(&config), store, events.clone());
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| Inner {
            state: Mutex::new(State {
                peers: PeerTable::new(),
                pairing: PairingController::new(identity.device_id.clone()),
                pairing_timer: None,
                request_origin: None,
                datagram: None,
                discovery: None,
                radio: None,
                reconnect: None,
                pruner: None,
            }),
            dispatcher: tokio::spawn(dispatch(weak.clone(), inbound_rx)),
            identity,
            config,
            events,
            engine,
            inbound,
        });
        tracing::info!(
            device = %inner.identity.device_id,
            name = %inner.identity.display_name,
            "session created"
        );
        Self { inner }
    }

    pub fn identity(&self) -> &Identity {
        &self.inner.identity
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Sorted snapshot of the peer table.
    pub async fn peers(&self) -> Vec<Peer> {
        self.inner.state.lock().await.peers.snapshot()
    }

    /// Links this session can currently send on.
    pub async fn usable_links(&self) -> Vec<LinkKind> {
        let state = self.inner.state.lock().await;
        let mut links = Vec::new();
        if state.datagram.is_some() {
            links.push(LinkKind::Datagram);
        }
        if state.radio.as_ref().is_some_and(|r| r.is_connected()) {
            links.push(LinkKind::Radio);
        }
        links
    }

    /// Control and data ports, once the datagram link is bound.
    pub async fn datagram_ports(&self) -> Option<(u16, u16)> {
        let state = self.inner.state.lock().await;
        state
            .datagram
            .as_ref()
            .map(|c| (c.control_port(), c.data_port()))
    }

    /// Bind the datagram link (first call only) and start the discovery beacon.
    pub async fn start_discovery(&self) -> Result<(), Error> {
        self.inner.start_discovery().await
    }

    /// Stop the beacon. Sockets stay bound so pairing and transfers keep working.
    pub async fn stop_discovery(&self) {
        if let Some(discovery) = self.inner.state.lock().await.discovery.as_mut() {
            discovery.stop();
        }
    }

    /// Use `link` as the radio channel, replacing any previous one.
    pub async fn attach_radio(&self, link: Arc<dyn RadioLink>) {
        let channel = Arc::new(RadioChannel::new(
            link,
            self.inner.config.timing.radio_write_backoff(),
        ));
        channel.on_receive(self.inner.inbound.clone());
        let old = self.inner.state.lock().await.radio.replace(channel);
        if let Some(old) = old {
            old.close().await;
        }
        tracing::info!("radio link attached");
    }

    /// The platform radio scan reported a device.
    pub async fn radio_peer_found(&self, id: DeviceId, name: &str) {
        let mut state = self.inner.state.lock().await;
        let change = state.peers.observe_radio(&id, name, Instant::now());
        if change == PeerChange::Added {
            tracing::info!(peer = %id, name, "radio peer found");
        }
        self.inner.emit(SessionEvent::PeersChanged(state.peers.snapshot()));
    }

    /// Initiate pairing with `peer_id`. The returned code is shown locally and
    /// also travels in the request for the other operator to confirm.
    pub async fn connect(&self, peer_id: &DeviceId) -> Result<PairCode, Error> {
        self.inner.connect(peer_id).await
    }

    /// Responder: confirm the pending request with the code shown on the other device.
    pub async fn submit_pair_code(&self, code: &str) -> Result<DeviceId, Error> {
        self.inner.submit_pair_code(code).await
    }

    /// Responder: decline the pending request.
    pub async fn reject_pairing(&self) -> Result<(), Error> {
        self.inner.reject_pairing().await
    }

    /// Abandon the pending attempt, whichever side started it.
    pub async fn cancel_connect(&self) -> Result<(), Error> {
        self.inner.cancel_connect().await
    }

    /// Leave the connected peer. No-op when nothing is connected.
    pub async fn disconnect(&self) -> Result<(), Error> {
        self.inner.disconnect().await
    }

    /// Send one file to a connected peer over that peer's link.
    pub async fn send_file(&self, path: &Path, peer_id: &DeviceId) -> Result<TransferId, Error> {
        let (peer, channel) = {
            let state = self.inner.state.lock().await;
            let peer = state
                .peers
                .get(peer_id)
                .filter(|p| p.connected)
                .cloned()
                .ok_or_else(|| TransferError::NotConnected(peer_id.clone()))?;
            let channel = state.channel(peer.link)?;
            (peer, channel)
        };
        self.inner.engine.send_file(path, &peer, channel).await
    }

    /// Lifecycle status of a running or recently ended transfer.
    pub async fn transfer_status(&self, id: &TransferId) -> Option<TransferStatus> {
        self.inner.engine.status(id).await
    }

    /// Tear everything down: beacon, timers, channels, transfers, peer table.
    pub async fn shutdown(&self) {
        self.inner.engine.abort("session closed").await;
        let (datagram, radio) = {
            let mut state = self.inner.state.lock().await;
            state.stop_tasks();
            if let Some(mut discovery) = state.discovery.take() {
                discovery.stop();
            }
            state.pairing.reset();
            state.peers.clear();
            state.request_origin = None;
            (state.datagram.take(), state.radio.take())
        };
        if let Some(channel) = datagram {
            channel.close().await;
        }
        if let Some(channel) = radio {
            channel.close().await;
        }
        tracing::info!("session shut down");
    }
}

async fn dispatch(weak: Weak<Inner>, mut inbound: mpsc::UnboundedReceiver<Inbound>) {
    while let Some(item) = inbound.recv().await {
        let Some(inner) = weak.upgrade() else {
            break;
        };
        tokio::spawn(async move {
            inner.handle(item).await;
        });
    }
}

impl Inner {
    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn self_id(&self) -> &DeviceId {
        &self.identity.device_id
    }

    async fn start_discovery(self: &Arc<Self>) -> Result<(), Error> {
        let mut state = self.state.lock().await;
        let channel = match &state.datagram {
            Some(channel) => channel.clone(),
            None => {
                let channel =
                    Arc::new(DatagramChannel::bind(DatagramSettings::from_config(&self.config)).await?);
                channel.on_receive(self.inbound.clone());
                state.datagram = Some(channel.clone());
                channel
            }
        };
        let identity = self.identity.clone();
        let interval = self.config.timing.discovery_interval();
        state
            .discovery
            .get_or_insert_with(|| DiscoveryService::new(identity, channel, interval))
            .start();
        if state.pruner.is_none() {
            if let Some(ttl) = self.config.peer_ttl() {
                state.pruner = Some(tokio::spawn(prune_loop(Arc::downgrade(self), ttl)));
            }
        }
        Ok(())
    }

    /// Arm the expiry timer for attempt `seq`, replacing any earlier one.
    fn arm_pairing_timer(self: &Arc<Self>, state: &mut State, seq: u64) {
        let weak = Arc::downgrade(self);
        let timeout = self.config.timing.pairing_timeout();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                inner.expire_pairing(seq).await;
            }
        });
        if let Some(old) = state.pairing_timer.replace(timer) {
            old.abort();
        }
    }

    async fn expire_pairing(&self, seq: u64) {
        let mut state = self.state.lock().await;
        if let Some(attempt) = state.pairing.expire(seq) {
            // This task is the timer; dropping its handle detaches it.
            state.pairing_timer = None;
            state.request_origin = None;
            tracing::info!(peer = %attempt.peer_id, "pairing timed out");
            self.emit(SessionEvent::PairingFailed(PairingError::Timeout));
        }
    }

    async fn connect(self: &Arc<Self>, peer_id: &DeviceId) -> Result<PairCode, Error> {
        let (peer, attempt, channel) = {
            let mut state = self.state.lock().await;
            let peer = state
                .peers
                .get(peer_id)
                .cloned()
                .ok_or_else(|| PairingError::UnknownPeer(peer_id.clone()))?;
            let channel = state.channel(peer.link)?;
            let attempt = state.pairing.initiate(peer.id.clone(), Instant::now())?;
            (peer, attempt, channel)
        };
        let request = Message::PairRequest(PairRequest {
            device_id: Some(self.self_id().clone()),
            timestamp: now_millis(),
            device_name: self.identity.display_name.clone(),
            pair_code: attempt.code.clone(),
        });
        let sent = channel.send(&peer, &request).await;
        let mut state = self.state.lock().await;
        if let Err(e) = sent {
            let _ = state.pairing.cancel_local();
            return Err(e.into());
        }
        if state.pairing.attempt().is_some_and(|a| a.seq == attempt.seq) {
            self.arm_pairing_timer(&mut state, attempt.seq);
        }
        tracing::info!(peer = %peer.id, link = ?peer.link, "pair_request sent");
        self.emit(SessionEvent::PairingCodeGenerated {
            peer: peer.id.clone(),
            code: attempt.code.clone(),
        });
        Ok(attempt.code)
    }

    /// Deliver a pair_response to the requester: back to where the request came
    /// from, plus a broadcast fallback on the datagram link.
    async fn answer_request(
        &self,
        origin: Option<Origin>,
        peer: Option<Peer>,
        response: &Message,
    ) -> Result<(), TransportError> {
        let (channel, datagram) = {
            let state = self.state.lock().await;
            let link = origin
                .map(|o| o.link())
                .or(peer.as_ref().map(|p| p.link))
                .unwrap_or(LinkKind::Datagram);
            (state.channel(link), state.datagram.clone())
        };
        let direct = match (channel, origin, &peer) {
            (Ok(channel), Some(origin), _) => channel.reply(&origin, response).await,
            (Ok(channel), None, Some(peer)) => channel.send(peer, response).await,
            (Ok(_), None, None) => Err(TransportError::LinkUnavailable),
            (Err(e), _, _) => Err(e),
        };
        let on_datagram = origin.map_or(true, |o| o.link() == LinkKind::Datagram);
        let fallback = match datagram {
            Some(channel) if on_datagram => channel.broadcast(response).await,
            _ => Err(TransportError::LinkUnavailable),
        };
        match (direct, fallback) {
            (Ok(()), _) | (_, Ok(())) => Ok(()),
            (Err(e), _) => Err(e),
        }
    }

    async fn submit_pair_code(&self, code: &str) -> Result<DeviceId, Error> {
        let (attempt, origin, peer) = {
            let mut state = self.state.lock().await;
            let attempt = state.pairing.submit_code(code)?;
            let peer = state.peers.get(&attempt.peer_id).cloned();
            (attempt, state.request_origin, peer)
        };
        let response = Message::PairResponse(PairResponse {
            success: true,
            from_device_id: self.self_id().clone(),
            device_id: attempt.peer_id.clone(),
            device_name: self.identity.display_name.clone(),
            pair_code: Some(attempt.code.clone()),
            reason: None,
            timestamp: now_millis(),
        });
        if let Err(e) = self.answer_request(origin, peer, &response).await {
            tracing::warn!(peer = %attempt.peer_id, error = %e, "pair_response not delivered");
            let mut state = self.state.lock().await;
            let _ = state.pairing.cancel_local();
            state.stop_pairing_timer();
            state.request_origin = None;
            return Err(e.into());
        }
        let (peer_id, name, peers) = {
            let mut state = self.state.lock().await;
            let peer_id = state.pairing.mark_connected()?;
            state.peers.set_connected(&peer_id, true);
            state.stop_pairing_timer();
            state.request_origin = None;
            let name = state
                .peers
                .get(&peer_id)
                .map(|p| p.display_name.clone())
                .unwrap_or_default();
            (peer_id, name, state.peers.snapshot())
        };
        self.announce_state(LinkState::Connected, None).await;
        tracing::info!(peer = %peer_id, "paired");
        self.emit(SessionEvent::PairingConnected {
            peer: peer_id.clone(),
            name,
        });
        self.emit(SessionEvent::PeersChanged(peers));
        Ok(peer_id)
    }

    async fn reject_pairing(&self) -> Result<(), Error> {
        let (attempt, origin, peer) = {
            let mut state = self.state.lock().await;
            let attempt = state.pairing.reject()?;
            state.stop_pairing_timer();
            let peer = state.peers.get(&attempt.peer_id).cloned();
            (attempt, state.request_origin.take(), peer)
        };
        let response = Message::PairResponse(PairResponse {
            success: false,
            from_device_id: self.self_id().clone(),
            device_id: attempt.peer_id.clone(),
            device_name: self.identity.display_name.clone(),
            pair_code: None,
            reason: Some("declined".to_string()),
            timestamp: now_millis(),
        });
        if let Err(e) = self.answer_request(origin, peer, &response).await {
            tracing::debug!(peer = %attempt.peer_id, error = %e, "rejection not delivered");
        }
        tracing::info!(peer = %attempt.peer_id, "pairing request declined");
        Ok(())
    }

    async fn cancel_connect(&self) -> Result<(), Error> {
        let (attempt, datagram) = {
            let mut state = self.state.lock().await;
            let attempt = state.pairing.cancel_local()?;
            state.stop_pairing_timer();
            state.request_origin = None;
            (attempt, state.datagram.clone())
        };
        let cancel = Message::PairCancel(PairCancel {
            device_id: self.self_id().clone(),
            timestamp: now_millis(),
        });
        match datagram {
            Some(channel) => {
                if let Err(e) = channel.broadcast(&cancel).await {
                    tracing::debug!(error = %e, "pair_cancel broadcast failed");
                }
            }
            None => tracing::debug!("no datagram link; pair_cancel stays local"),
        }
        tracing::info!(peer = %attempt.peer_id, "pairing cancelled");
        self.emit(SessionEvent::PairingFailed(PairingError::Cancelled {
            origin: CancelOrigin::Local,
        }));
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), Error> {
        let peer = {
            let mut state = self.state.lock().await;
            let id = state
                .pairing
                .disconnect()
                .or_else(|| state.peers.connected().map(|p| p.id.clone()));
            let Some(id) = id else {
                return Ok(());
            };
            state.peers.set_connected(&id, false);
            if let Some(task) = state.reconnect.take() {
                task.abort();
            }
            state.peers.get(&id).cloned()
        };
        let Some(peer) = peer else {
            return Ok(());
        };
        self.announce_state(LinkState::Disconnected, Some(&peer)).await;
        self.engine.abort("disconnected").await;
        tracing::info!(peer = %peer.id, "disconnected");
        self.emit(SessionEvent::Disconnected {
            peer: peer.id.clone(),
        });
        let peers = self.state.lock().await.peers.snapshot();
        self.emit(SessionEvent::PeersChanged(peers));
        Ok(())
    }

    /// Tell the LAN about our link state; unicast to `peer` as well when known.
    async fn announce_state(&self, link_state: LinkState, peer: Option<&Peer>) {
        let Some(channel) = self.state.lock().await.datagram.clone() else {
            return;
        };
        let message = Message::DeviceState(DeviceState {
            device_id: self.self_id().clone(),
            device_name: self.identity.display_name.clone(),
            state: link_state,
            timestamp: now_millis(),
        });
        if let Some(addr) = peer.and_then(|p| p.control_addr()) {
            if let Err(e) = channel.send_to(addr, &message).await {
                tracing::debug!(%addr, error = %e, "device_state unicast failed");
            }
        }
        if let Err(e) = channel.broadcast(&message).await {
            tracing::debug!(error = %e, "device_state broadcast failed");
        }
    }

    async fn handle(self: &Arc<Self>, inbound: Inbound) {
        match inbound {
            Inbound::LinkDropped(link) => {
                let peer = self
                    .state
                    .lock()
                    .await
                    .peers
                    .connected()
                    .filter(|p| p.link == link)
                    .cloned();
                match peer {
                    Some(peer) => self.link_lost(peer).await,
                    None => tracing::debug!(?link, "link dropped with no connected peer"),
                }
            }
            Inbound::Message { origin, message } => self.on_message(origin, message).await,
        }
    }

    async fn on_message(self: &Arc<Self>, origin: Origin, message: Message) {
        match message {
            Message::Discover(_) | Message::DiscoverReply(_) => {
                let Origin::Datagram(from) = origin else {
                    return;
                };
                let (reply, channel) = {
                    let mut state = self.state.lock().await;
                    let State {
                        discovery, peers, datagram, ..
                    } = &mut *state;
                    let Some(discovery) = discovery.as_ref() else {
                        return;
                    };
                    let Some(seen) = discovery.handle(from, &message, peers, Instant::now()) else {
                        return;
                    };
                    self.emit(SessionEvent::PeersChanged(peers.snapshot()));
                    (seen.reply, datagram.clone())
                };
                if let (Some(reply), Some(channel)) = (reply, channel) {
                    if let Err(e) = channel.send_to(from, &reply).await {
                        tracing::debug!(%from, error = %e, "DISCOVER_REPLY failed");
                    }
                }
            }
            Message::DeviceState(s) => self.on_device_state(s).await,
            Message::PairRequest(r) => self.on_pair_request(origin, r).await,
            Message::PairResponse(r) => self.on_pair_response(r).await,
            Message::PairCancel(c) => self.on_pair_cancel(c).await,
            Message::PrepareTransfer(p) => self.on_prepare(origin, p).await,
            Message::PrepareTransferAck(p) => {
                let (Origin::Datagram(from), Some(port)) = (origin, p.transfer_port) else {
                    return;
                };
                let mut state = self.state.lock().await;
                let peer = state.peers.find_by_control_addr(from).map(|p| p.id.clone());
                if let Some(id) = peer {
                    state.peers.set_data_port(&id, port);
                    tracing::debug!(peer = %id, port, "data port confirmed");
                }
            }
            transfer => {
                let (peer, channel) = {
                    let mut state = self.state.lock().await;
                    let peer = state.paired_peer(&origin).cloned();
                    if let Some(p) = &peer {
                        state.peers.touch(&p.id, Instant::now());
                    }
                    (peer, state.channel(origin.link()))
                };
                let Some(peer) = peer else {
                    tracing::warn!(kind = transfer.kind(), ?origin, "transfer traffic from an unpaired device ignored");
                    return;
                };
                match channel {
                    Ok(channel) => {
                        self.engine
                            .handle(origin, Some(&peer), transfer, channel.as_ref())
                            .await
                    }
                    Err(e) => tracing::debug!(error = %e, "no channel for inbound transfer message"),
                }
            }
        }
    }

    async fn on_device_state(self: &Arc<Self>, s: DeviceState) {
        if s.device_id == *self.self_id() {
            return;
        }
        let connected = {
            let mut state = self.state.lock().await;
            state.peers.touch(&s.device_id, Instant::now());
            state
                .peers
                .connected()
                .filter(|p| p.id == s.device_id)
                .cloned()
        };
        match (s.state, connected) {
            (LinkState::Disconnected, Some(peer)) => {
                tracing::info!(peer = %peer.id, "peer announced disconnect");
                self.link_lost(peer).await;
            }
            (state, _) => tracing::debug!(peer = %s.device_id, ?state, "device_state"),
        }
    }

    async fn on_pair_request(self: &Arc<Self>, origin: Origin, request: PairRequest) {
        let now = Instant::now();
        let mut state = self.state.lock().await;
        let from = match (request.device_id.clone(), origin) {
            (Some(id), _) => id,
            (None, Origin::Datagram(addr)) => match state.peers.find_by_ip(addr.ip()) {
                Some(p) => p.id.clone(),
                None => {
                    tracing::warn!(%addr, "pair_request from an unknown address ignored");
                    return;
                }
            },
            (None, Origin::Radio) => {
                tracing::warn!("pair_request without device id on radio ignored");
                return;
            }
        };
        if from == *self.self_id() {
            return;
        }
        if state.peers.get(&from).is_none() {
            match origin {
                Origin::Datagram(addr) => {
                    state
                        .peers
                        .observe_datagram(&from, &request.device_name, addr, None, now);
                }
                Origin::Radio => {
                    state.peers.observe_radio(&from, &request.device_name, now);
                }
            }
        }
        match state.pairing.on_request(from.clone(), request.pair_code, now) {
            RequestDisposition::Prompt { seq, yielded } => {
                if yielded {
                    tracing::info!(peer = %from, "both sides initiated; answering the peer's request");
                }
                state.request_origin = Some(origin);
                self.arm_pairing_timer(&mut state, seq);
                tracing::info!(peer = %from, name = %request.device_name, "pair_request received");
                self.emit(SessionEvent::PairingRequested {
                    peer: from,
                    name: request.device_name,
                });
            }
            RequestDisposition::KeepInitiator => {
                tracing::debug!(peer = %from, "both sides initiated; keeping initiator role");
            }
            RequestDisposition::Busy => {
                let channel = state.channel(origin.link());
                drop(state);
                let busy = Message::PairResponse(PairResponse {
                    success: false,
                    from_device_id: self.self_id().clone(),
                    device_id: from.clone(),
                    device_name: self.identity.display_name.clone(),
                    pair_code: None,
                    reason: Some("busy".to_string()),
                    timestamp: now_millis(),
                });
                let sent = match channel {
                    Ok(channel) => channel.reply(&origin, &busy).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = sent {
                    tracing::debug!(peer = %from, error = %e, "busy reply failed");
                }
            }
        }
    }

    async fn on_pair_response(&self, response: PairResponse) {
        if response.from_device_id == *self.self_id() {
            // Our own broadcast fallback.
            return;
        }
        let mut state = self.state.lock().await;
        match state.pairing.on_response(&response) {
            Ok(peer_id) => {
                state.peers.set_connected(&peer_id, true);
                state.stop_pairing_timer();
                let name = state
                    .peers
                    .get(&peer_id)
                    .map(|p| p.display_name.clone())
                    .unwrap_or_else(|| response.device_name.clone());
                let peers = state.peers.snapshot();
                drop(state);
                self.announce_state(LinkState::Connected, None).await;
                tracing::info!(peer = %peer_id, "paired");
                self.emit(SessionEvent::PairingConnected {
                    peer: peer_id,
                    name,
                });
                self.emit(SessionEvent::PeersChanged(peers));
            }
            Err(e @ PairingError::Rejected { .. }) => {
                state.stop_pairing_timer();
                tracing::info!(peer = %response.from_device_id, error = %e, "pairing rejected");
                self.emit(SessionEvent::PairingFailed(e));
            }
            Err(e) => tracing::debug!(peer = %response.from_device_id, error = %e, "pair_response ignored"),
        }
    }

    async fn on_pair_cancel(&self, cancel: PairCancel) {
        let mut state = self.state.lock().await;
        match state.pairing.on_cancel(&cancel.device_id) {
            Some(CancelOrigin::Peer) => {
                state.stop_pairing_timer();
                state.request_origin = None;
                tracing::info!(peer = %cancel.device_id, "peer cancelled pairing");
                self.emit(SessionEvent::PairingFailed(PairingError::Cancelled {
                    origin: CancelOrigin::Peer,
                }));
            }
            Some(CancelOrigin::Local) => tracing::trace!("own pair_cancel looped back"),
            None => {}
        }
    }

    async fn on_prepare(&self, origin: Origin, prepare: Prepare) {
        let Origin::Datagram(from) = origin else {
            return;
        };
        let Some(channel) = self.state.lock().await.datagram.clone() else {
            return;
        };
        let ack = Message::PrepareTransferAck(Prepare {
            transfer_id: prepare.transfer_id.clone(),
            transfer_port: Some(channel.data_port()),
            ready: Some(true),
            timestamp: now_millis(),
        });
        if let Err(e) = channel.send_to(from, &ack).await {
            tracing::debug!(transfer = %prepare.transfer_id, error = %e, "PREPARE_TRANSFER_ACK failed");
        }
    }

    /// The connected peer's link went away. Without a transfer in flight that
    /// ends the connection; otherwise the transfer is held while we try to get
    /// the link back.
    async fn link_lost(self: &Arc<Self>, peer: Peer) {
        let busy = self.engine.is_sending() || self.engine.is_receiving().await;
        if !busy {
            self.mark_disconnected(&peer.id).await;
            return;
        }
        self.engine.interrupt().await;
        tracing::warn!(peer = %peer.id, link = ?peer.link, "link lost mid-transfer");
        self.emit(SessionEvent::LinkInterrupted {
            peer: peer.id.clone(),
        });
        let mut state = self.state.lock().await;
        state.peers.set_connected(&peer.id, false);
        let task = tokio::spawn(reconnect_loop(Arc::downgrade(self), peer));
        if let Some(old) = state.reconnect.replace(task) {
            old.abort();
        }
    }

    async fn try_reconnect(&self, peer: &Peer) -> bool {
        match peer.link {
            LinkKind::Radio => {
                let Some(radio) = self.state.lock().await.radio.clone() else {
                    return false;
                };
                match radio.reconnect().await {
                    Ok(()) => {
                        self.state.lock().await.peers.set_connected(&peer.id, true);
                        true
                    }
                    Err(e) => {
                        tracing::debug!(peer = %peer.id, error = %e, "radio reconnect failed");
                        false
                    }
                }
            }
            // The peer left on purpose; it is back only once it pairs with us again.
            LinkKind::Datagram => {
                let state = self.state.lock().await;
                state.peers.get(&peer.id).is_some_and(|p| p.connected)
            }
        }
    }

    async fn mark_disconnected(&self, peer_id: &DeviceId) {
        let peers = {
            let mut state = self.state.lock().await;
            state.peers.set_connected(peer_id, false);
            if state.pairing.connected_peer() == Some(peer_id) {
                state.pairing.disconnect();
            }
            state.peers.snapshot()
        };
        tracing::info!(peer = %peer_id, "peer disconnected");
        self.emit(SessionEvent::Disconnected {
            peer: peer_id.clone(),
        });
        self.emit(SessionEvent::PeersChanged(peers));
    }
}

async fn reconnect_loop(weak: Weak<Inner>, peer: Peer) {
    let interval = match weak.upgrade() {
        Some(inner) => inner.config.timing.reconnect_interval(),
        None => return,
    };
    for attempt in 1..=RECONNECT_ATTEMPTS {
        tokio::time::sleep(interval).await;
        let Some(inner) = weak.upgrade() else {
            return;
        };
        if inner.try_reconnect(&peer).await {
            inner.engine.resume().await;
            tracing::info!(peer = %peer.id, attempt, "link restored");
            inner.emit(SessionEvent::LinkRestored {
                peer: peer.id.clone(),
            });
            inner.state.lock().await.reconnect = None;
            return;
        }
        tracing::info!(peer = %peer.id, attempt, "reconnect attempt failed");
    }
    let Some(inner) = weak.upgrade() else {
        return;
    };
    inner.engine.abort("connection lost").await;
    inner.state.lock().await.reconnect = None;
    inner.mark_disconnected(&peer.id).await;
}

async fn prune_loop(weak: Weak<Inner>, ttl: Duration) {
    let period = (ttl / 2).max(Duration::from_secs(1));
    loop {
        tokio::time::sleep(period).await;
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let mut state = inner.state.lock().await;
        let removed = state.peers.prune(ttl, Instant::now());
        if !removed.is_empty() {
            tracing::info!(count = removed.len(), "stale peers removed");
            inner.emit(SessionEvent::PeersChanged(state.peers.snapshot()));
        }
    }
}
