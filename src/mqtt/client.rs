use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, LastWill, MqttOptions, Outgoing, QoS};
use tracing::{debug, error, info, warn};

use crate::config::MqttConfig;
use crate::gateway::OutboundMessage;

use super::{PublishError, Publisher};

const INITIAL_BACKOFF: Duration = Duration::from_secs(5);
const MAX_BACKOFF: Duration = Duration::from_secs(60);
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);
/// How long a graceful disconnect may take to reach the broker.
const DISCONNECT_LINGER: Duration = Duration::from_millis(250);

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("failed to connect to {host}:{port}: {source}")]
    Connection {
        host: String,
        port: u16,
        #[source]
        source: rumqttc::ConnectionError,
    },

    #[error("no CONNACK from {host}:{port} within {timeout:?}")]
    Timeout {
        host: String,
        port: u16,
        timeout: Duration,
    },
}

/// `Publisher` backed by a single rumqttc connection.
pub struct MqttPublisher {
    client: AsyncClient,
    eventloop: EventLoop,
    status_topic: String,
    connected: bool,
    backoff: Duration,
}

impl MqttPublisher {
    /// Connect to the broker and wait for its CONNACK.
    pub async fn connect(config: &MqttConfig) -> Result<Self, ConnectError> {
        let (client, mut eventloop) = AsyncClient::new(options(config), 10);

        info!(
            "Connecting to MQTT broker {}:{} as {}",
            config.broker_host, config.broker_port, config.client_id
        );

        let timeout = config.connect_timeout();
        let handshake = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => return Ok(()),
                    Ok(_) => {}
                    Err(e) => return Err(e),
                }
            }
        };

        match tokio::time::timeout(timeout, handshake).await {
            Ok(Ok(())) => {}
            Ok(Err(source)) => {
                return Err(ConnectError::Connection {
                    host: config.broker_host.clone(),
                    port: config.broker_port,
                    source,
                });
            }
            Err(_) => {
                return Err(ConnectError::Timeout {
                    host: config.broker_host.clone(),
                    port: config.broker_port,
                    timeout,
                });
            }
        }

        let mut publisher = Self {
            client,
            eventloop,
            status_topic: config.bridge_status_topic(),
            connected: false,
            backoff: INITIAL_BACKOFF,
        };
        publisher.on_connack();
        Ok(publisher)
    }

    fn on_connack(&mut self) {
        info!("Connected to MQTT broker");
        self.connected = true;
        self.backoff = INITIAL_BACKOFF;

        if let Err(e) = self
            .client
            .try_publish(&self.status_topic, QoS::AtLeastOnce, true, "online")
        {
            error!("Failed to publish online status: {}", e);
        }
    }

    fn observe(&mut self, event: Event) {
        if let Event::Incoming(Incoming::ConnAck(_)) = event {
            self.on_connack();
        }
    }

    fn on_connection_error(&mut self, e: &rumqttc::ConnectionError) {
        if self.connected {
            error!("MQTT connection error: {}. Reconnecting...", e);
        }
        self.connected = false;
    }

    /// Poll the event loop until the queued publish has been written out.
    ///
    /// Bridge messages are the only QoS 0 publishes, so they go out with
    /// packet id 0. Status publishes (QoS 1) queued on CONNACK may be written
    /// first and are skipped here.
    async fn flush_publish(&mut self) -> Result<(), PublishError> {
        loop {
            match self.eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Publish(0))) => return Ok(()),
                Ok(event) => self.observe(event),
                Err(e) => {
                    self.on_connection_error(&e);
                    return Err(e.into());
                }
            }
        }
    }
}

fn options(config: &MqttConfig) -> MqttOptions {
    let mut mqttopts = MqttOptions::new(
        &config.client_id,
        &config.broker_host,
        config.broker_port,
    );
    mqttopts.set_keep_alive(Duration::from_secs(config.keep_alive_secs));

    if let (Some(user), Some(pass)) = (&config.username, &config.password) {
        mqttopts.set_credentials(user, pass);
    }

    mqttopts.set_last_will(LastWill::new(
        config.bridge_status_topic(),
        "offline".as_bytes().to_vec(),
        QoS::AtLeastOnce,
        true,
    ));
    mqttopts
}

#[async_trait]
impl Publisher for MqttPublisher {
    fn is_ready(&self) -> bool {
        self.connected
    }

    async fn maintain(&mut self) {
        match self.eventloop.poll().await {
            Ok(event) => self.observe(event),
            Err(e) => {
                self.on_connection_error(&e);
                warn!("MQTT broker unreachable: {}. Retrying in {:?}", e, self.backoff);
                tokio::time::sleep(self.backoff).await;
                self.backoff = (self.backoff * 2).min(MAX_BACKOFF);
            }
        }
    }

    async fn publish(&mut self, message: &OutboundMessage) -> Result<(), PublishError> {
        self.client
            .publish(
                &message.topic,
                QoS::AtMostOnce,
                false,
                message.payload.as_bytes(),
            )
            .await?;

        match tokio::time::timeout(PUBLISH_TIMEOUT, self.flush_publish()).await {
            Ok(result) => result,
            Err(_) => Err(PublishError::Timeout(PUBLISH_TIMEOUT)),
        }
    }

    async fn close(&mut self) {
        if !self.connected {
            debug!("MQTT connection already down, skipping offline status");
            return;
        }

        if let Err(e) = self
            .client
            .try_publish(&self.status_topic, QoS::AtLeastOnce, true, "offline")
        {
            warn!("Failed to publish offline status: {}", e);
        }
        if let Err(e) = self.client.try_disconnect() {
            warn!("Failed to request MQTT disconnect: {}", e);
            return;
        }

        let eventloop = &mut self.eventloop;
        let linger = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        };
        if tokio::time::timeout(DISCONNECT_LINGER, linger).await.is_err() {
            warn!("MQTT disconnect did not complete within {:?}", DISCONNECT_LINGER);
        }
        self.connected = false;
        info!("Disconnected from MQTT broker");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;

    const PUBLISH: u8 = 0x30;
    const DISCONNECT: u8 = 0xE0;

    /// One MQTT control packet as seen by the test broker.
    #[derive(Debug)]
    struct WirePacket {
        header: u8,
        body: Vec<u8>,
    }

    impl WirePacket {
        fn kind(&self) -> u8 {
            self.header & 0xF0
        }

        fn topic_len(&self) -> usize {
            u16::from_be_bytes([self.body[0], self.body[1]]) as usize
        }

        fn topic(&self) -> &str {
            std::str::from_utf8(&self.body[2..2 + self.topic_len()]).unwrap()
        }

        fn payload(&self) -> &[u8] {
            let mut start = 2 + self.topic_len();
            if (self.header >> 1) & 0x03 > 0 {
                start += 2;
            }
            &self.body[start..]
        }
    }

    async fn read_packet(stream: &mut TcpStream) -> Option<WirePacket> {
        let header = stream.read_u8().await.ok()?;
        let mut len = 0usize;
        let mut shift = 0;
        loop {
            let byte = stream.read_u8().await.ok()?;
            len |= ((byte & 0x7F) as usize) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await.ok()?;
        Some(WirePacket { header, body })
    }

    /// Minimal broker: accepts every CONNECT and reports what clients write.
    /// With `drop_first`, the first connection is closed right after CONNACK.
    async fn start_broker(drop_first: bool) -> (u16, mpsc::UnboundedReceiver<WirePacket>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            let mut first = true;
            while let Ok((mut stream, _)) = listener.accept().await {
                let tx = tx.clone();
                let drop_now = drop_first && first;
                first = false;
                tokio::spawn(async move {
                    if read_packet(&mut stream).await.is_none() {
                        return;
                    }
                    if stream.write_all(&[0x20, 2, 0, 0]).await.is_err() || drop_now {
                        return;
                    }
                    while let Some(packet) = read_packet(&mut stream).await {
                        if tx.send(packet).is_err() {
                            return;
                        }
                    }
                });
            }
        });

        (port, rx)
    }

    fn broker_config(port: u16) -> MqttConfig {
        MqttConfig {
            broker_port: port,
            username: None,
            password: None,
            ..mqtt_config()
        }
    }

    /// Wait for the next packet the broker received.
    async fn next_packet(packets: &mut mpsc::UnboundedReceiver<WirePacket>) -> WirePacket {
        tokio::time::timeout(Duration::from_secs(2), packets.recv())
            .await
            .expect("no packet reached the broker")
            .expect("broker stopped")
    }

    async fn next_publish_to(
        packets: &mut mpsc::UnboundedReceiver<WirePacket>,
        topic: &str,
    ) -> WirePacket {
        loop {
            let packet = next_packet(packets).await;
            if packet.kind() == PUBLISH && packet.topic() == topic {
                return packet;
            }
        }
    }

    fn mqtt_config() -> MqttConfig {
        MqttConfig {
            broker_host: "127.0.0.1".to_string(),
            broker_port: 1,
            username: Some("bridge".to_string()),
            password: Some("secret".to_string()),
            client_id: "mibridge".to_string(),
            topic_prefix: "/mibridge".to_string(),
            keep_alive_secs: 30,
            connect_timeout_secs: 2,
        }
    }

    #[test]
    fn test_options() {
        let opts = options(&mqtt_config());

        assert_eq!(opts.client_id(), "mibridge");
        assert_eq!(opts.broker_address(), ("127.0.0.1".to_string(), 1));
        assert_eq!(opts.keep_alive(), Duration::from_secs(30));
        assert_eq!(
            opts.credentials(),
            Some(("bridge".to_string(), "secret".to_string()))
        );

        let will = opts.last_will().unwrap();
        assert_eq!(will.topic, "/mibridge/bridge_status");
        assert_eq!(&will.message[..], b"offline");
        assert!(will.retain);
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        // Nothing listens on port 1.
        let err = MqttPublisher::connect(&mqtt_config()).await.err().unwrap();
        assert!(matches!(
            err,
            ConnectError::Connection { .. } | ConnectError::Timeout { .. }
        ));
    }

    #[tokio::test]
    async fn test_publish_is_on_the_wire_when_it_returns() {
        let (port, mut packets) = start_broker(false).await;
        let mut publisher = MqttPublisher::connect(&broker_config(port)).await.unwrap();

        for (topic, payload) in [("/mibridge/m/s/a", "1"), ("/mibridge/m/s/b", "x")] {
            publisher
                .publish(&OutboundMessage {
                    topic: topic.to_string(),
                    payload: payload.to_string(),
                })
                .await
                .unwrap();

            // Nothing polls the event loop from here on
            let written = next_publish_to(&mut packets, topic).await;
            assert_eq!(written.payload(), payload.as_bytes());
        }
    }

    #[tokio::test]
    async fn test_online_status_does_not_satisfy_a_publish() {
        let (port, mut packets) = start_broker(false).await;
        let mut publisher = MqttPublisher::connect(&broker_config(port)).await.unwrap();

        publisher
            .publish(&OutboundMessage {
                topic: "/mibridge/m/s/a".to_string(),
                payload: "1".to_string(),
            })
            .await
            .unwrap();

        let status = next_packet(&mut packets).await;
        assert_eq!(status.topic(), "/mibridge/bridge_status");
        assert_eq!(status.payload(), b"online");

        let message = next_packet(&mut packets).await;
        assert_eq!(message.topic(), "/mibridge/m/s/a");
    }

    #[tokio::test]
    async fn test_reconnects_after_connection_drop() {
        let (port, _packets) = start_broker(true).await;
        let mut publisher = MqttPublisher::connect(&broker_config(port)).await.unwrap();
        assert!(publisher.is_ready());
        publisher.backoff = Duration::from_millis(50);

        tokio::time::timeout(Duration::from_secs(5), async {
            while publisher.is_ready() {
                publisher.maintain().await;
            }
        })
        .await
        .expect("connection drop was not noticed");
        assert!(!publisher.is_ready());

        tokio::time::timeout(Duration::from_secs(5), async {
            while !publisher.is_ready() {
                publisher.maintain().await;
            }
        })
        .await
        .expect("did not reconnect");
        assert!(publisher.is_ready());
    }

    #[tokio::test]
    async fn test_close_sends_offline_then_disconnect() {
        let (port, mut packets) = start_broker(false).await;
        let mut publisher = MqttPublisher::connect(&broker_config(port)).await.unwrap();

        publisher.close().await;
        assert!(!publisher.is_ready());

        let mut seen = Vec::new();
        loop {
            let packet = next_packet(&mut packets).await;
            let kind = packet.kind();
            seen.push(packet);
            if kind == DISCONNECT {
                break;
            }
        }

        let offline = seen
            .iter()
            .position(|p| {
                p.kind() == PUBLISH
                    && p.topic() == "/mibridge/bridge_status"
                    && p.payload() == b"offline"
            })
            .expect("offline status was not published");
        assert!(offline < seen.len() - 1);
        assert!(seen[offline].header & 0x01 != 0, "offline status must be retained");
    }
}
