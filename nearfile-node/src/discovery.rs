//! LAN discovery: periodic DISCOVER broadcast, unicast DISCOVER_REPLY, peer table upkeep.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use nearfile_core::message::Announce;
use nearfile_core::{now_millis, Identity, Message, PeerChange, PeerTable};
use tokio::task::JoinHandle;

use crate::transport::DatagramChannel;

pub struct DiscoveryService {
    identity: Arc<Identity>,
    channel: Arc<DatagramChannel>,
    interval: Duration,
    beacon: Option<JoinHandle<()>>,
}

impl DiscoveryService {
    pub fn new(identity: Arc<Identity>, channel: Arc<DatagramChannel>, interval: Duration) -> Self {
        Self {
            identity,
            channel,
            interval,
            beacon: None,
        }
    }

    /// Begin broadcasting DISCOVER every interval. No-op if already running.
    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }
        let identity = self.identity.clone();
        let channel = self.channel.clone();
        let interval = self.interval;
        self.beacon = Some(tokio::spawn(beacon_loop(identity, channel, interval)));
        tracing::info!(interval_ms = interval.as_millis() as u64, "discovery started");
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.beacon.take() {
            task.abort();
            tracing::info!("discovery stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.beacon.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Handle DISCOVER / DISCOVER_REPLY against the peer table. Only DISCOVER
    /// gets a reply, so replies never trigger more replies. Sending it is left
    /// to the caller.
    pub fn handle(
        &self,
        from: SocketAddr,
        message: &Message,
        peers: &mut PeerTable,
        now: Instant,
    ) -> Option<Observed> {
        let (announce, answer) = match message {
            Message::Discover(a) => (a, true),
            Message::DiscoverReply(a) => (a, false),
            _ => return None,
        };
        if announce.device_id == self.identity.device_id {
            return None;
        }
        let change = peers.observe_datagram(
            &announce.device_id,
            &announce.device_name,
            from,
            announce.transfer_port,
            now,
        );
        if change == PeerChange::Added {
            tracing::info!(peer = %announce.device_id, name = %announce.device_name, %from, "peer found");
        }
        Some(Observed {
            change,
            reply: answer.then(|| Message::DiscoverReply(announcement(&self.identity, &self.channel))),
        })
    }
}

/// What one DISCOVER / DISCOVER_REPLY did.
#[derive(Debug, Clone, PartialEq)]
pub struct Observed {
    pub change: PeerChange,
    /// DISCOVER_REPLY to unicast back to the sender.
    pub reply: Option<Message>,
}

impl Drop for DiscoveryService {
    fn drop(&mut self) {
        self.stop();
    }
}

fn announcement(identity: &Identity, channel: &DatagramChannel) -> Announce {
    Announce {
        device_id: identity.device_id.clone(),
        device_name: identity.display_name.clone(),
        device_type: identity.device_type.clone(),
        transfer_port: Some(channel.data_port()),
        timestamp: now_millis(),
    }
}

async fn beacon_loop(identity: Arc<Identity>, channel: Arc<DatagramChannel>, interval: Duration) {
    loop {
        let beacon = Message::Discover(announcement(&identity, &channel));
        if let Err(e) = channel.broadcast(&beacon).await {
            tracing::warn!(error = %e, "discovery broadcast failed");
        }
        tokio::time::sleep(interval).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::datagram::DatagramSettings;
    use crate::transport::{Inbound, Origin, TransportChannel};
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn settings(base: u16) -> DatagramSettings {
        DatagramSettings {
            base_port: base,
            port_attempts: 2,
            data_port_offset: 100,
            broadcast_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ack_spacing: Duration::from_millis(5),
        }
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<Inbound>) -> (SocketAddr, Message) {
        match timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Some(Inbound::Message {
                origin: Origin::Datagram(from),
                message,
            })) => (from, message),
            other => panic!("expected datagram, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn discover_is_answered_and_replies_are_not() {
        let a_chan = Arc::new(DatagramChannel::bind(settings(47510)).await.unwrap());
        let b_chan = Arc::new(DatagramChannel::bind(settings(47510)).await.unwrap());
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        a_chan.on_receive(a_tx);
        b_chan.on_receive(b_tx);

        let a_id = Arc::new(Identity::new("alpha"));
        let b_id = Arc::new(Identity::new("beta"));
        let mut a = DiscoveryService::new(a_id.clone(), a_chan.clone(), Duration::from_secs(60));
        let b = DiscoveryService::new(b_id.clone(), b_chan.clone(), Duration::from_secs(60));
        let mut a_peers = PeerTable::new();
        let mut b_peers = PeerTable::new();

        a.start();
        // a hears its own beacon on its own port, b hears it on the other.
        let (from, msg) = recv(&mut a_rx).await;
        assert_eq!(a.handle(from, &msg, &mut a_peers, Instant::now()), None);
        let (from, msg) = recv(&mut b_rx).await;
        let seen = b.handle(from, &msg, &mut b_peers, Instant::now()).unwrap();
        assert_eq!(seen.change, PeerChange::Added);
        b_chan.send_to(from, &seen.reply.unwrap()).await.unwrap();
        let peer = b_peers.get(&a_id.device_id).unwrap();
        assert_eq!(peer.data_port, Some(a_chan.data_port()));
        assert_eq!(peer.control_port, Some(a_chan.control_port()));

        let (from, reply) = recv(&mut a_rx).await;
        assert!(matches!(reply, Message::DiscoverReply(_)));
        assert_eq!(
            a.handle(from, &reply, &mut a_peers, Instant::now()),
            Some(Observed {
                change: PeerChange::Added,
                reply: None,
            })
        );
        assert!(a_peers.get(&b_id.device_id).is_some());
        a.stop();
        assert!(!a.is_running());

        // Nothing answers a reply.
        assert!(timeout(Duration::from_millis(200), b_rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn rediscovery_updates_instead_of_duplicating() {
        let chan = Arc::new(DatagramChannel::bind(settings(47530)).await.unwrap());
        let svc = DiscoveryService::new(Arc::new(Identity::new("me")), chan, Duration::from_secs(60));
        let mut peers = PeerTable::new();
        let other = Message::DiscoverReply(Announce {
            device_id: "device_x".into(),
            device_name: "x".into(),
            device_type: "linux".into(),
            transfer_port: None,
            timestamp: 0,
        });
        let from = SocketAddr::from(([127, 0, 0, 1], 9));
        let first = svc.handle(from, &other, &mut peers, Instant::now()).unwrap();
        assert_eq!(first.change, PeerChange::Added);
        let second = svc.handle(from, &other, &mut peers, Instant::now()).unwrap();
        assert_eq!(second.change, PeerChange::Updated);
        assert_eq!(second.reply, None);
        assert_eq!(peers.len(), 1);
    }
}
