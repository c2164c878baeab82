//! Datagram link: two UDP sockets, one for control traffic and one for chunk
//! traffic, so bulk data cannot starve discovery and pairing.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use nearfile_core::message::MAX_DATAGRAM_LEN;
use nearfile_core::{BindError, LinkKind, Message, Peer, Plane, TransportError};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use super::{Inbound, InboundSender, Origin, TransportChannel};
use crate::config::Config;

/// Back-off after a receive error so a broken socket does not spin.
const RECV_ERROR_PAUSE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct DatagramSettings {
    pub base_port: u16,
    pub port_attempts: u16,
    pub data_port_offset: u16,
    pub broadcast_addr: IpAddr,
    /// Gap between redundant copies of an acknowledgment.
    pub ack_spacing: Duration,
}

impl DatagramSettings {
    pub fn from_config(c: &Config) -> Self {
        Self {
            base_port: c.base_port,
            port_attempts: c.port_attempts,
            data_port_offset: c.data_port_offset,
            broadcast_addr: c.broadcast_addr,
            ack_spacing: c.timing.ack_spacing(),
        }
    }
}

pub struct DatagramChannel {
    control: Arc<UdpSocket>,
    data: Arc<UdpSocket>,
    control_port: u16,
    data_port: u16,
    settings: DatagramSettings,
    readers: Mutex<Vec<JoinHandle<()>>>,
}

/// Bind the first free port in `[base, base + attempts)`.
async fn bind_in_window(base: u16, attempts: u16) -> Result<(UdpSocket, u16), BindError> {
    for i in 0..attempts {
        let Some(port) = base.checked_add(i) else {
            break;
        };
        match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).await {
            Ok(socket) => {
                if let Err(e) = socket.set_broadcast(true) {
                    tracing::warn!(port, error = %e, "cannot enable broadcast");
                }
                return Ok((socket, port));
            }
            Err(e) => tracing::debug!(port, error = %e, "port busy"),
        }
    }
    Err(BindError { base, attempts })
}

impl DatagramChannel {
    /// Bind the control socket, then the data socket `data_port_offset` above it.
    pub async fn bind(settings: DatagramSettings) -> Result<Self, BindError> {
        let (control, control_port) =
            bind_in_window(settings.base_port, settings.port_attempts).await?;
        let data_base = control_port.saturating_add(settings.data_port_offset);
        let (data, data_port) = bind_in_window(data_base, settings.port_attempts).await?;
        tracing::info!(control_port, data_port, "datagram link bound");
        Ok(Self {
            control: Arc::new(control),
            data: Arc::new(data),
            control_port,
            data_port,
            settings,
            readers: Mutex::new(Vec::new()),
        })
    }

    pub fn control_port(&self) -> u16 {
        self.control_port
    }

    pub fn data_port(&self) -> u16 {
        self.data_port
    }

    fn socket(&self, plane: Plane) -> &UdpSocket {
        match plane {
            Plane::Control => &self.control,
            Plane::Data => &self.data,
        }
    }

    /// Send `message` from the socket for `plane` to `addr`.
    pub async fn send_via(
        &self,
        plane: Plane,
        addr: SocketAddr,
        message: &Message,
    ) -> Result<(), TransportError> {
        let bytes = message
            .encode()
            .map_err(|e| TransportError::Encode(e.to_string()))?;
        if bytes.len() > MAX_DATAGRAM_LEN {
            return Err(TransportError::Encode(format!(
                "{} message of {} bytes exceeds one datagram",
                message.kind(),
                bytes.len()
            )));
        }
        self.socket(plane)
            .send_to(&bytes, addr)
            .await
            .map_err(|e| TransportError::SendFailed {
                attempts: 1,
                reason: e.to_string(),
            })?;
        tracing::trace!(kind = message.kind(), %addr, "sent");
        Ok(())
    }

    /// Send to `addr` on the socket the message belongs on.
    pub async fn send_to(&self, addr: SocketAddr, message: &Message) -> Result<(), TransportError> {
        self.send_via(message.plane(), addr, message).await
    }

    /// Broadcast from the control socket to every port of the control window,
    /// since peers may have bound any of them.
    pub async fn broadcast(&self, message: &Message) -> Result<(), TransportError> {
        let mut last_err = None;
        let mut sent = false;
        for i in 0..self.settings.port_attempts {
            let Some(port) = self.settings.base_port.checked_add(i) else {
                break;
            };
            let addr = SocketAddr::new(self.settings.broadcast_addr, port);
            match self.send_via(Plane::Control, addr, message).await {
                Ok(()) => sent = true,
                Err(e) => last_err = Some(e),
            }
        }
        match (sent, last_err) {
            (true, _) => Ok(()),
            (false, Some(e)) => Err(e),
            (false, None) => Err(TransportError::LinkUnavailable),
        }
    }

    fn lock_readers(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.readers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

async fn read_loop(socket: Arc<UdpSocket>, plane: Plane, handler: InboundSender) {
    let mut buf = vec![0u8; u16::MAX as usize];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, from)) => match Message::decode(&buf[..n]) {
                Ok(message) => {
                    let inbound = Inbound::Message {
                        origin: Origin::Datagram(from),
                        message,
                    };
                    if handler.send(inbound).is_err() {
                        break;
                    }
                }
                Err(e) => tracing::debug!(%from, ?plane, error = %e, "dropping datagram"),
            },
            Err(e) => {
                tracing::warn!(?plane, error = %e, "receive failed");
                tokio::time::sleep(RECV_ERROR_PAUSE).await;
            }
        }
    }
}

#[async_trait]
impl TransportChannel for DatagramChannel {
    fn link(&self) -> LinkKind {
        LinkKind::Datagram
    }

    async fn send(&self, peer: &Peer, message: &Message) -> Result<(), TransportError> {
        let addr = match message.plane() {
            Plane::Control => peer.control_addr(),
            Plane::Data => peer.data_addr(),
        }
        .ok_or_else(|| TransportError::NoRoute(peer.id.clone()))?;
        self.send_to(addr, message).await
    }

    async fn reply(&self, origin: &Origin, message: &Message) -> Result<(), TransportError> {
        match origin {
            Origin::Datagram(addr) => self.send_to(*addr, message).await,
            Origin::Radio => Err(TransportError::LinkUnavailable),
        }
    }

    /// Two copies to the origin, spaced apart, plus one from the control
    /// socket to the peer's control port.
    async fn reply_redundant(
        &self,
        origin: &Origin,
        peer: Option<&Peer>,
        message: &Message,
    ) -> Result<(), TransportError> {
        let first = self.reply(origin, message).await;
        let mut any_ok = first.is_ok();
        if let Some(addr) = peer.and_then(Peer::control_addr) {
            if Origin::Datagram(addr) != *origin {
                any_ok |= self.send_via(Plane::Control, addr, message).await.is_ok();
            }
        }
        tokio::time::sleep(self.settings.ack_spacing).await;
        let second = self.reply(origin, message).await;
        any_ok |= second.is_ok();
        if any_ok {
            Ok(())
        } else {
            second
        }
    }

    fn on_receive(&self, handler: InboundSender) {
        let mut readers = self.lock_readers();
        for r in readers.drain(..) {
            r.abort();
        }
        readers.push(tokio::spawn(read_loop(
            self.control.clone(),
            Plane::Control,
            handler.clone(),
        )));
        readers.push(tokio::spawn(read_loop(self.data.clone(), Plane::Data, handler)));
    }

    async fn close(&self) {
        for r in self.lock_readers().drain(..) {
            r.abort();
        }
        tracing::info!(
            control_port = self.control_port,
            data_port = self.data_port,
            "datagram link closed"
        );
    }
}

impl Drop for DatagramChannel {
    fn drop(&mut self) {
        for r in self.lock_readers().drain(..) {
            r.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nearfile_core::message::{AckStatus, Announce, FileAck};
    use nearfile_core::{DeviceId, TransferId};
    use std::time::Instant;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn settings(base: u16) -> DatagramSettings {
        DatagramSettings {
            base_port: base,
            port_attempts: 3,
            data_port_offset: 100,
            broadcast_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ack_spacing: Duration::from_millis(5),
        }
    }

    fn announce(id: &str) -> Message {
        Message::Discover(Announce {
            device_id: DeviceId::from(id),
            device_name: id.into(),
            device_type: "linux".into(),
            transfer_port: None,
            timestamp: 1,
        })
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<Inbound>) -> (Origin, Message) {
        match timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Some(Inbound::Message { origin, message })) => (origin, message),
            other => panic!("expected a message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn second_channel_takes_next_port() {
        let a = DatagramChannel::bind(settings(47310)).await.unwrap();
        let b = DatagramChannel::bind(settings(47310)).await.unwrap();
        assert_eq!(a.control_port(), 47310);
        assert_eq!(b.control_port(), 47311);
        assert_eq!(a.data_port(), 47410);
        assert_eq!(b.data_port(), 47411);
    }

    #[tokio::test]
    async fn exhausted_window_is_a_bind_error() {
        let mut s = settings(47330);
        s.port_attempts = 1;
        let _held = DatagramChannel::bind(s.clone()).await.unwrap();
        let err = DatagramChannel::bind(s).await.err().unwrap();
        assert_eq!(err.base, 47330);
        assert_eq!(err.attempts, 1);
    }

    #[tokio::test]
    async fn broadcast_reaches_every_port_in_window() {
        let a = DatagramChannel::bind(settings(47350)).await.unwrap();
        let b = DatagramChannel::bind(settings(47350)).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        b.on_receive(tx);
        a.broadcast(&announce("device_a")).await.unwrap();
        let (origin, message) = next(&mut rx).await;
        assert_eq!(origin, Origin::Datagram(SocketAddr::from(([127, 0, 0, 1], 47350))));
        assert_eq!(message, announce("device_a"));
    }

    #[tokio::test]
    async fn data_messages_use_the_data_socket() {
        let a = DatagramChannel::bind(settings(47370)).await.unwrap();
        let b = DatagramChannel::bind(settings(47370)).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        b.on_receive(tx);
        let peer_b = Peer {
            id: DeviceId::from("device_b"),
            display_name: "b".into(),
            address: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            control_port: Some(b.control_port()),
            data_port: Some(b.data_port()),
            link: LinkKind::Datagram,
            last_seen: Instant::now(),
            connected: true,
        };
        let ack = Message::FileAck(FileAck {
            transfer_id: TransferId::from("1"),
            chunk_index: 4,
            status: AckStatus::Success,
            error: None,
            timestamp: 0,
        });
        a.send(&peer_b, &ack).await.unwrap();
        let (origin, message) = next(&mut rx).await;
        assert_eq!(origin, Origin::Datagram(SocketAddr::from(([127, 0, 0, 1], a.data_port()))));
        assert_eq!(message, ack);
    }

    #[tokio::test]
    async fn redundant_reply_reaches_origin_twice_and_peer_control_once() {
        let a = DatagramChannel::bind(settings(47650)).await.unwrap();
        let origin_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let control_socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let origin_addr = origin_socket.local_addr().unwrap();
        let peer = Peer {
            id: DeviceId::from("device_b"),
            display_name: "b".into(),
            address: Some(IpAddr::V4(Ipv4Addr::LOCALHOST)),
            control_port: Some(control_socket.local_addr().unwrap().port()),
            data_port: Some(origin_addr.port()),
            link: LinkKind::Datagram,
            last_seen: Instant::now(),
            connected: true,
        };
        let ack = Message::FileAck(FileAck {
            transfer_id: TransferId::from("7"),
            chunk_index: 2,
            status: AckStatus::Success,
            error: None,
            timestamp: 0,
        });
        a.reply_redundant(&Origin::Datagram(origin_addr), Some(&peer), &ack)
            .await
            .unwrap();

        let mut buf = vec![0u8; u16::MAX as usize];
        for _ in 0..2 {
            let (n, _) = timeout(Duration::from_secs(1), origin_socket.recv_from(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(Message::decode(&buf[..n]).unwrap(), ack);
        }
        let (n, _) = timeout(Duration::from_secs(1), control_socket.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(Message::decode(&buf[..n]).unwrap(), ack);
        assert!(timeout(Duration::from_millis(100), origin_socket.recv_from(&mut buf))
            .await
            .is_err());
        assert!(timeout(Duration::from_millis(100), control_socket.recv_from(&mut buf))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn peer_without_address_has_no_route() {
        let a = DatagramChannel::bind(settings(47390)).await.unwrap();
        let radio_peer = Peer {
            id: DeviceId::from("device_r"),
            display_name: "r".into(),
            address: None,
            control_port: None,
            data_port: None,
            link: LinkKind::Radio,
            last_seen: Instant::now(),
            connected: false,
        };
        assert!(matches!(
            a.send(&radio_peer, &announce("device_a")).await,
            Err(TransportError::NoRoute(_))
        ));
    }
}
