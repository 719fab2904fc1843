// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! InfoShare node

use anyhow::{Context, Result};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use infoshare::bluetooth::{
    radio::event_channel, BluetoothManager, BluezRadio, NodeEvent, PayloadSource,
};
use infoshare::Config;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("infoshare=info".parse()?),
        )
        .init();

    info!("Starting InfoShare v{}...", env!("CARGO_PKG_VERSION"));

    // Payload to hand out, if any
    let payload = match std::env::args().nth(1) {
        Some(path) => {
            let data = std::fs::read(&path).with_context(|| format!("reading {}", path))?;
            info!("Will send {} ({} bytes) to subscribers", path, data.len());
            Some(data)
        }
        None => None,
    };

    // Load configuration
    let config = Config::load()?;
    info!("Configuration loaded");

    // Open the adapter and start the manager
    let (radio_tx, radio_rx) = event_channel();
    let radio = BluezRadio::new(radio_tx).await?;
    let handle = BluetoothManager::spawn(Box::new(radio), radio_rx, config.bluetooth.clone());
    let mut events = handle.subscribe_events();

    if config.bluetooth.advertise_on_start {
        let identity = config.identity.to_record();
        let outcome = handle.start_advertising(identity.clone()).await?;
        info!("Advertising {:?}: {:?}", identity.encode(), outcome);
    }
    if config.bluetooth.scan_on_start {
        handle.start_scan().await?;
    }

    info!("Ready. Press Ctrl-C to quit.");

    loop {
        tokio::select! {
            event = events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Missed {} events", n);
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                        error!("Bluetooth manager stopped");
                        break;
                    }
                };
                match event {
                    NodeEvent::RadioStateChanged(radio_state) => {
                        info!(
                            "Radio {:?}: {}",
                            radio_state,
                            handle.state().get_scan_status().as_str()
                        );
                    }
                    NodeEvent::PeerDiscovered(peer) => {
                        info!(
                            "Found {} [{} {} {}] as {}",
                            peer.identity.display_name,
                            peer.identity.short_tag,
                            peer.identity.object_ref,
                            peer.identity.owner_ref,
                            peer.id
                        );
                    }
                    NodeEvent::PayloadReceived { source, data } => {
                        let from = match source {
                            PayloadSource::Central => "central".to_string(),
                            PayloadSource::Peer { handle, .. } => handle.to_string(),
                        };
                        info!(
                            "Received {} bytes from {}: {}",
                            data.len(),
                            from,
                            String::from_utf8_lossy(&data)
                        );
                    }
                    NodeEvent::SubscriptionChanged { subscriber, subscribed: true } => {
                        info!("{} subscribed", subscriber);
                        if let Some(payload) = &payload {
                            if let Err(e) = handle.send(payload.clone()).await {
                                error!("Send failed: {}", e);
                            }
                        }
                    }
                    NodeEvent::LinkLost { peer, cause } => {
                        warn!("Lost {}: {}", peer.id, cause.as_deref().unwrap_or("unknown"));
                    }
                    NodeEvent::ConnectFailed { peer, cause } => {
                        warn!("Connect to {} failed: {}", peer.id, cause);
                    }
                    other => debug!("{:?}", other),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Quit requested");
                break;
            }
        }
    }

    if let Err(e) = handle.stop_scan().await {
        debug!("Stop scan: {}", e);
    }
    if let Err(e) = handle.stop_advertising().await {
        debug!("Stop advertising: {}", e);
    }

    info!("Shutting down...");
    Ok(())
}
