mod config;
mod gateway;
mod mqtt;
mod stats;

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::gateway::OutboundMessage;
use crate::gateway::receiver::MulticastReceiver;
use crate::mqtt::client::MqttPublisher;
use crate::mqtt::forwarder::Forwarder;
use crate::stats::BridgeStats;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = match config::Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    info!(
        "Starting mibridge (mqtt={}:{}, multicast={}:{} on {}, topics under {})",
        config.mqtt.broker_host,
        config.mqtt.broker_port,
        config.multicast.group,
        config.multicast.port,
        config.multicast.interface.as_deref().unwrap_or("default interface"),
        config.mqtt.topic_prefix,
    );

    let stats = Arc::new(BridgeStats::default());
    let cancel = CancellationToken::new();

    // The broker connection must be up before anything is read off the network
    let publisher = match MqttPublisher::connect(&config.mqtt).await {
        Ok(p) => p,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    let (tx, rx) = mpsc::channel::<OutboundMessage>(config.bridge.queue_capacity);

    let forwarder = Forwarder::new(publisher, stats.clone(), config.bridge.drain_timeout());
    let forwarder_handle = tokio::spawn(forwarder.run(rx, cancel.clone()));

    let receiver = MulticastReceiver::new(
        config.multicast.clone(),
        config.mqtt.topic_prefix.clone(),
        stats.clone(),
    );
    let socket = match receiver.open() {
        Ok(s) => s,
        Err(e) => {
            error!("{}", e);
            cancel.cancel();
            if let Err(e) = forwarder_handle.await {
                warn!("Forwarder task failed: {}", e);
            }
            std::process::exit(1);
        }
    };
    let receiver_handle = tokio::spawn(receiver.run(socket, tx, cancel.clone()));

    shutdown_signal().await;
    cancel.cancel();

    if let Err(e) = receiver_handle.await {
        warn!("Receiver task failed: {}", e);
    }
    if let Err(e) = forwarder_handle.await {
        warn!("Forwarder task failed: {}", e);
    }

    let s = stats.snapshot();
    info!(
        "mibridge stopped (datagrams={}, malformed={}, read_errors={}, enqueued={}, dropped={}, published={}, publish_failures={})",
        s.datagrams_received,
        s.datagrams_malformed,
        s.receive_errors,
        s.messages_enqueued,
        s.messages_dropped,
        s.messages_published,
        s.publish_failures,
    );
}

async fn shutdown_signal() {
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to register SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT, shutting down"),
        _ = sigterm => info!("Received SIGTERM, shutting down"),
    }
}
