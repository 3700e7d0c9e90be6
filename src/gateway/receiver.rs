use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::MulticastConfig;
use crate::stats::BridgeStats;

use super::OutboundMessage;
use super::decode::decode_datagram;

/// Gateways keep each report well below this.
const DATAGRAM_BUFFER_SIZE: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum ReceiverError {
    #[error("failed to bind to {address}: {source}")]
    Bind {
        address: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Listens for gateway multicast reports and enqueues their decoded messages.
pub struct MulticastReceiver {
    config: MulticastConfig,
    topic_prefix: String,
    stats: Arc<BridgeStats>,
}

impl MulticastReceiver {
    pub fn new(config: MulticastConfig, topic_prefix: String, stats: Arc<BridgeStats>) -> Self {
        Self {
            config,
            topic_prefix,
            stats,
        }
    }

    /// Bind the listening socket and join the multicast group.
    ///
    /// Only the bind is fatal. An unknown interface or a failed join is logged
    /// and the socket is returned anyway.
    pub fn open(&self) -> Result<UdpSocket, ReceiverError> {
        let interface = self.resolve_interface();
        let address = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, self.config.port));
        let socket = bind_udp(address).map_err(|source| ReceiverError::Bind { address, source })?;

        info!("Starting multicast listener on {}", address);

        match socket.join_multicast_v4(self.config.group, interface) {
            Ok(()) => info!(
                "Joined multicast group {} on {}",
                self.config.group, interface
            ),
            Err(e) => error!(
                "Failed to join multicast group {} on {}: {}",
                self.config.group, interface, e
            ),
        }

        Ok(socket)
    }

    /// IPv4 address of the configured interface, or the unspecified address
    /// when none is configured or it cannot be found.
    fn resolve_interface(&self) -> Ipv4Addr {
        let Some(name) = self.config.interface.as_deref() else {
            return Ipv4Addr::UNSPECIFIED;
        };

        match interface_ipv4(name) {
            Some(addr) => addr,
            None => {
                warn!("Invalid interface name {}, trying default interface", name);
                Ipv4Addr::UNSPECIFIED
            }
        }
    }

    /// Receive loop. Runs until `cancel` fires; read errors are logged and the
    /// loop keeps going.
    pub async fn run(
        self,
        socket: UdpSocket,
        tx: mpsc::Sender<OutboundMessage>,
        cancel: CancellationToken,
    ) {
        let mut buf = vec![0u8; DATAGRAM_BUFFER_SIZE];

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Multicast listener stopping");
                    break;
                }
                received = socket.recv_from(&mut buf) => {
                    match received {
                        Ok((len, from)) => {
                            debug!("Datagram from {} ({} bytes)", from, len);
                            self.dispatch(&buf[..len], &tx);
                        }
                        Err(e) => {
                            self.stats.receive_error();
                            warn!("Error reading datagram: {}", e);
                        }
                    }
                }
            }
        }
    }

    /// Decode one datagram and enqueue everything it fans out to, before the
    /// next datagram is read.
    fn dispatch(&self, datagram: &[u8], tx: &mpsc::Sender<OutboundMessage>) {
        self.stats.datagram_received();

        let text = String::from_utf8_lossy(datagram);
        let messages = match decode_datagram(&text, &self.topic_prefix) {
            Ok(messages) => messages,
            Err(e) => {
                self.stats.datagram_malformed();
                warn!("Dropping datagram: {}", e);
                return;
            }
        };

        for message in messages {
            match tx.try_send(message) {
                Ok(()) => self.stats.message_enqueued(),
                Err(TrySendError::Full(message)) => {
                    let dropped = self.stats.message_dropped();
                    warn!(
                        "Outbound queue full, dropping {} ({} dropped so far)",
                        message.topic, dropped
                    );
                }
                Err(TrySendError::Closed(message)) => {
                    self.stats.message_dropped();
                    warn!("Outbound queue closed, dropping {}", message.topic);
                }
            }
        }
    }
}

fn bind_udp(address: SocketAddr) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&address.into())?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

fn interface_ipv4(name: &str) -> Option<Ipv4Addr> {
    let interfaces = match get_if_addrs::get_if_addrs() {
        Ok(interfaces) => interfaces,
        Err(e) => {
            warn!("Failed to list network interfaces: {}", e);
            return None;
        }
    };

    interfaces
        .into_iter()
        .filter(|iface| iface.name == name)
        .find_map(|iface| match iface.addr {
            get_if_addrs::IfAddr::V4(v4) => Some(v4.ip),
            _ => None,
        })
}
