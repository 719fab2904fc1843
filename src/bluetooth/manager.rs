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

//! Link manager task.
//!
//! One task owns the radio, the peer registry, the connection coordinator
//! and the transfer engine. Radio events and caller commands are both
//! handled on that task, one at a time, so none of that state is locked.
//! [`BluetoothHandle`] is the cloneable front door used from anywhere else.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::ble_constants::SERVICE_UUID;
use super::coordinator::ConnectionCoordinator;
use super::error::LinkError;
use super::identity::IdentityRecord;
use super::radio::{RadioEvent, RadioEventReceiver, RadioHandle, RadioStack, RadioState, ScanFilter};
use super::registry::{Peer, PeerId, PeerRegistry};
use super::transfer::{AdvertiseOutcome, ChunkedTransferEngine, PumpState};
use crate::config::BluetoothConfig;
use crate::state::{NodeState, ScanStatus};

/// Who a received payload came from.
#[derive(Debug, Clone, PartialEq)]
pub enum PayloadSource {
    /// A central wrote it to our characteristic.
    Central,
    /// A peripheral we subscribed to notified it.
    Peer {
        handle: RadioHandle,
        peer_id: Option<PeerId>,
    },
}

/// Events broadcast to observers of the link layer.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    RadioStateChanged(RadioState),
    ScanningChanged(bool),
    AdvertisingChanged(bool),
    /// First announcement from a new owner.
    PeerDiscovered(Peer),
    /// Handle or connection state of a known peer changed.
    PeerUpdated(Peer),
    ConnectFailed { peer: Peer, cause: String },
    /// A link went down without a disconnect request.
    LinkLost { peer: Peer, cause: Option<String> },
    SubscriptionChanged { subscriber: String, subscribed: bool },
    /// A complete payload was reassembled.
    PayloadReceived { source: PayloadSource, data: Vec<u8> },
    /// An outbound payload and its EOM marker were accepted.
    TransferCompleted { bytes: usize },
}

/// Requests marshalled onto the manager task.
enum Command {
    StartScan {
        respond_to: oneshot::Sender<()>,
    },
    StopScan {
        respond_to: oneshot::Sender<()>,
    },
    Reset {
        respond_to: oneshot::Sender<()>,
    },
    Connect {
        peer_id: PeerId,
        respond_to: oneshot::Sender<Result<Peer, LinkError>>,
    },
    Disconnect {
        peer_id: PeerId,
        respond_to: oneshot::Sender<Result<Peer, LinkError>>,
    },
    Subscribe {
        peer_id: PeerId,
        respond_to: oneshot::Sender<Result<(), LinkError>>,
    },
    StartAdvertising {
        identity: IdentityRecord,
        respond_to: oneshot::Sender<AdvertiseOutcome>,
    },
    StopAdvertising {
        respond_to: oneshot::Sender<()>,
    },
    Send {
        payload: Vec<u8>,
        respond_to: oneshot::Sender<Result<PumpState, LinkError>>,
    },
    SendToPeer {
        peer_id: PeerId,
        payload: Vec<u8>,
        respond_to: oneshot::Sender<Result<PumpState, LinkError>>,
    },
}

/// Owner of all link-layer state.
pub struct BluetoothManager {
    radio: Box<dyn RadioStack>,
    registry: PeerRegistry,
    coordinator: ConnectionCoordinator,
    transfer: ChunkedTransferEngine,
    config: BluetoothConfig,
    scan_requested: bool,
    scanning: bool,
    state: Arc<NodeState>,
    event_tx: broadcast::Sender<NodeEvent>,
}

impl BluetoothManager {
    /// Start the manager task and return a handle to it.
    ///
    /// `radio_events` must be the receiver paired with the sender `radio`
    /// reports through. Must be called within a tokio runtime.
    pub fn spawn(
        radio: Box<dyn RadioStack>,
        radio_events: RadioEventReceiver,
        config: BluetoothConfig,
    ) -> BluetoothHandle {
        let (command_tx, command_rx) = mpsc::channel(32);
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));
        let state = NodeState::new();
        state.set_radio_state(radio.state());

        let manager = Self {
            radio,
            registry: PeerRegistry::new(),
            coordinator: ConnectionCoordinator::new(),
            transfer: ChunkedTransferEngine::new(config.chunk_size),
            config,
            scan_requested: false,
            scanning: false,
            state: state.clone(),
            event_tx: event_tx.clone(),
        };

        tokio::spawn(manager.run(radio_events, command_rx));

        BluetoothHandle {
            sender: command_tx,
            state,
            event_tx,
        }
    }

    async fn run(mut self, mut radio_events: RadioEventReceiver, mut commands: mpsc::Receiver<Command>) {
        info!("Bluetooth manager started");
        loop {
            tokio::select! {
                event = radio_events.recv() => match event {
                    Some(event) => self.handle_radio_event(event),
                    None => {
                        info!("Radio event channel closed");
                        break;
                    }
                },
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => {
                        info!("All handles dropped");
                        break;
                    }
                },
            }
        }
        info!("Bluetooth manager stopped");
    }

    fn emit(&self, event: NodeEvent) {
        let _ = self.event_tx.send(event);
    }

    fn publish_peers(&self) {
        self.state.set_peers(self.registry.snapshot());
    }

    fn scan_filter(&self) -> ScanFilter {
        ScanFilter {
            service_uuids: vec![SERVICE_UUID],
            allow_duplicates: self.config.allow_duplicates,
        }
    }

    fn begin_scan(&mut self) {
        if self.scanning {
            return;
        }
        if !self.radio.state().is_ready() {
            debug!("Scan requested while radio is {:?}", self.radio.state());
            self.state
                .set_scan_status(ScanStatus::for_radio_state(self.radio.state(), true));
            return;
        }
        let filter = self.scan_filter();
        self.radio.start_scan(&filter);
        self.scanning = true;
        self.state.set_scan_status(if self.registry.is_empty() {
            ScanStatus::Scanning
        } else {
            ScanStatus::Loaded
        });
        info!("Scanning for peers");
    }

    fn end_scan(&mut self) {
        if self.scanning {
            self.radio.stop_scan();
            self.scanning = false;
            info!("Scanning stopped");
        }
    }

    fn report_pump(&self, state: &PumpState) {
        match state {
            PumpState::Completed { bytes } => {
                info!("Transfer complete: {} bytes", bytes);
                self.emit(NodeEvent::TransferCompleted { bytes: *bytes });
            }
            PumpState::Blocked { cursor } => debug!("Transfer paused at {}", cursor),
            PumpState::Idle => {}
        }
    }

    fn handle_radio_event(&mut self, event: RadioEvent) {
        match event {
            RadioEvent::StateChanged(radio_state) => self.on_state_changed(radio_state),
            RadioEvent::ScanningChanged(scanning) => {
                self.scanning = scanning;
                self.emit(NodeEvent::ScanningChanged(scanning));
            }
            RadioEvent::Discovered {
                handle,
                announcement,
                connected,
            } => {
                let Some(announcement) = announcement else {
                    debug!("Ignoring unnamed device {}", handle);
                    return;
                };
                let known = self.registry.len();
                let Some(peer) = self.registry.upsert(handle, &announcement, connected) else {
                    return;
                };
                self.state.set_scan_status(ScanStatus::Loaded);
                self.publish_peers();
                if self.registry.len() > known {
                    info!(
                        "Discovered {} ({}) as {}",
                        peer.identity.display_name, peer.identity.owner_ref, peer.id
                    );
                    self.emit(NodeEvent::PeerDiscovered(peer));
                } else {
                    self.emit(NodeEvent::PeerUpdated(peer));
                }
            }
            RadioEvent::Connected(handle) => {
                let Some(peer) = self.coordinator.on_connected(&mut self.registry, &handle) else {
                    warn!("Connected event for unknown device {}", handle);
                    return;
                };
                if self.config.auto_subscribe {
                    self.transfer.subscribe(self.radio.as_mut(), &handle);
                }
                self.publish_peers();
                self.emit(NodeEvent::PeerUpdated(peer));
            }
            RadioEvent::ConnectFailed { handle, cause } => {
                let Some(peer) =
                    self.coordinator
                        .on_connect_failed(&mut self.registry, &handle, &cause)
                else {
                    return;
                };
                self.publish_peers();
                self.emit(NodeEvent::ConnectFailed { peer, cause });
            }
            RadioEvent::Disconnected { handle, cause } => {
                self.transfer.abandon_peer(&handle);
                let Some(outcome) =
                    self.coordinator
                        .on_disconnected(&mut self.registry, &handle, cause.as_deref())
                else {
                    debug!("Disconnected event for unknown device {}", handle);
                    return;
                };
                self.publish_peers();
                self.emit(NodeEvent::PeerUpdated(outcome.peer.clone()));
                if outcome.unsolicited {
                    self.emit(NodeEvent::LinkLost {
                        peer: outcome.peer,
                        cause,
                    });
                }
            }
            RadioEvent::AdvertisingChanged(advertising) => {
                self.state.set_advertising(advertising);
                self.emit(NodeEvent::AdvertisingChanged(advertising));
            }
            RadioEvent::ReadyToSend => {
                let pump = self.transfer.on_ready_to_send(self.radio.as_mut());
                self.report_pump(&pump);
            }
            RadioEvent::WriteReceived {
                characteristic,
                data,
            } => {
                if let Some(data) = self.transfer.on_write_received(characteristic, &data) {
                    info!("Payload received from central: {} bytes", data.len());
                    self.emit(NodeEvent::PayloadReceived {
                        source: PayloadSource::Central,
                        data,
                    });
                }
            }
            RadioEvent::NotificationReceived {
                handle,
                characteristic,
                data,
            } => {
                if let Some(data) =
                    self.transfer
                        .on_notification(&handle, characteristic, &data)
                {
                    let peer_id = self.registry.find_by_handle(&handle).map(|p| p.id);
                    info!("Payload received from {}: {} bytes", handle, data.len());
                    self.emit(NodeEvent::PayloadReceived {
                        source: PayloadSource::Peer { handle, peer_id },
                        data,
                    });
                }
            }
            RadioEvent::SubscriptionChanged {
                subscriber,
                subscribed,
            } => {
                self.transfer.on_subscription_changed(&subscriber, subscribed);
                self.emit(NodeEvent::SubscriptionChanged {
                    subscriber,
                    subscribed,
                });
            }
        }
    }

    fn on_state_changed(&mut self, radio_state: RadioState) {
        info!("Radio state: {:?}", radio_state);
        self.state.set_radio_state(radio_state);
        self.emit(NodeEvent::RadioStateChanged(radio_state));

        match radio_state {
            RadioState::PoweredOn => {
                if self.scan_requested {
                    self.begin_scan();
                } else {
                    self.state
                        .set_scan_status(ScanStatus::for_radio_state(radio_state, false));
                }
                if let Some(outcome) = self.transfer.on_radio_ready(self.radio.as_mut()) {
                    debug!("Deferred advertising: {:?}", outcome);
                }
            }
            RadioState::Unknown => {
                self.state
                    .set_scan_status(ScanStatus::for_radio_state(radio_state, self.scan_requested));
            }
            RadioState::PoweredOff
            | RadioState::Unauthorized
            | RadioState::Unsupported
            | RadioState::Resetting => {
                self.scanning = false;
                self.state
                    .set_scan_status(ScanStatus::for_radio_state(radio_state, self.scan_requested));
                self.transfer.on_radio_lost();
                self.state.set_advertising(false);
                for peer in self.coordinator.on_radio_lost(&mut self.registry) {
                    self.emit(NodeEvent::PeerUpdated(peer));
                }
                self.publish_peers();
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::StartScan { respond_to } => {
                self.scan_requested = true;
                self.begin_scan();
                let _ = respond_to.send(());
            }
            Command::StopScan { respond_to } => {
                self.scan_requested = false;
                self.end_scan();
                let _ = respond_to.send(());
            }
            Command::Reset { respond_to } => {
                self.scan_requested = false;
                self.end_scan();
                self.registry.reset();
                self.publish_peers();
                self.state.set_scan_status(ScanStatus::Loading);
                info!("Peer registry reset");
                let _ = respond_to.send(());
            }
            Command::Connect {
                peer_id,
                respond_to,
            } => {
                self.coordinator.connect(
                    &mut self.registry,
                    self.radio.as_mut(),
                    peer_id,
                    respond_to,
                );
                self.publish_peers();
            }
            Command::Disconnect {
                peer_id,
                respond_to,
            } => {
                self.coordinator.disconnect(
                    &mut self.registry,
                    self.radio.as_mut(),
                    peer_id,
                    respond_to,
                );
                self.publish_peers();
            }
            Command::Subscribe {
                peer_id,
                respond_to,
            } => {
                let result = self.connected_handle(peer_id).map(|handle| {
                    self.transfer.subscribe(self.radio.as_mut(), &handle);
                });
                let _ = respond_to.send(result);
            }
            Command::StartAdvertising {
                identity,
                respond_to,
            } => {
                let outcome = self
                    .transfer
                    .start_advertising(self.radio.as_mut(), &identity);
                let _ = respond_to.send(outcome);
            }
            Command::StopAdvertising { respond_to } => {
                self.transfer.stop_advertising(self.radio.as_mut());
                let _ = respond_to.send(());
            }
            Command::Send {
                payload,
                respond_to,
            } => {
                let result = self.transfer.send(self.radio.as_mut(), payload);
                match &result {
                    Ok(pump) => self.report_pump(pump),
                    Err(e) => warn!("Send refused: {}", e),
                }
                let _ = respond_to.send(result);
            }
            Command::SendToPeer {
                peer_id,
                payload,
                respond_to,
            } => {
                let result = self.connected_handle(peer_id).map(|handle| {
                    self.transfer
                        .send_to_peer(self.radio.as_mut(), handle, payload)
                });
                match &result {
                    Ok(pump) => self.report_pump(pump),
                    Err(e) => warn!("Send to {} refused: {}", peer_id, e),
                }
                let _ = respond_to.send(result);
            }
        }
    }

    fn connected_handle(&self, peer_id: PeerId) -> Result<RadioHandle, LinkError> {
        let peer = self
            .registry
            .get(peer_id)
            .ok_or(LinkError::UnknownPeer(peer_id))?;
        if !peer.is_connected() {
            return Err(LinkError::NotConnected(peer_id));
        }
        Ok(peer.radio_handle.clone())
    }
}

/// Handle to the manager task.
#[derive(Clone)]
pub struct BluetoothHandle {
    sender: mpsc::Sender<Command>,
    state: Arc<NodeState>,
    event_tx: broadcast::Sender<NodeEvent>,
}

impl BluetoothHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, LinkError> {
        let (tx, rx) = oneshot::channel();
        self.sender.send(build(tx)).await.map_err(|_| {
            error!("Bluetooth manager is not running");
            LinkError::Closed
        })?;
        rx.await.map_err(|_| LinkError::Closed)
    }

    /// Scan for advertising peers. Starts once the radio is powered on.
    pub async fn start_scan(&self) -> Result<(), LinkError> {
        self.request(|respond_to| Command::StartScan { respond_to })
            .await
    }

    pub async fn stop_scan(&self) -> Result<(), LinkError> {
        self.request(|respond_to| Command::StopScan { respond_to })
            .await
    }

    /// Stop scanning and forget every peer.
    pub async fn reset(&self) -> Result<(), LinkError> {
        self.request(|respond_to| Command::Reset { respond_to }).await
    }

    /// Connect to a peer and wait for the radio's answer.
    pub async fn connect(&self, peer_id: PeerId) -> Result<Peer, LinkError> {
        self.request(|respond_to| Command::Connect {
            peer_id,
            respond_to,
        })
        .await?
    }

    /// Like [`connect`](Self::connect) with a deadline.
    ///
    /// On expiry the request stays pending on the radio; its eventual answer
    /// updates the peer but reaches no caller.
    pub async fn connect_with_timeout(
        &self,
        peer_id: PeerId,
        timeout: Duration,
    ) -> Result<Peer, LinkError> {
        match tokio::time::timeout(timeout, self.connect(peer_id)).await {
            Ok(result) => result,
            Err(_) => {
                warn!("Connect to {} timed out after {:?}", peer_id, timeout);
                Err(LinkError::ConnectTimeout)
            }
        }
    }

    /// Advertise ourselves, then connect, so both sides can stream.
    pub async fn connect_bidirectional(
        &self,
        peer_id: PeerId,
        identity: IdentityRecord,
    ) -> Result<Peer, LinkError> {
        self.start_advertising(identity).await?;
        self.connect(peer_id).await
    }

    pub async fn disconnect(&self, peer_id: PeerId) -> Result<Peer, LinkError> {
        self.request(|respond_to| Command::Disconnect {
            peer_id,
            respond_to,
        })
        .await?
    }

    /// Ask a connected peer for notifications on the transfer characteristic.
    pub async fn subscribe(&self, peer_id: PeerId) -> Result<(), LinkError> {
        self.request(|respond_to| Command::Subscribe {
            peer_id,
            respond_to,
        })
        .await?
    }

    pub async fn start_advertising(
        &self,
        identity: IdentityRecord,
    ) -> Result<AdvertiseOutcome, LinkError> {
        self.request(|respond_to| Command::StartAdvertising {
            identity,
            respond_to,
        })
        .await
    }

    pub async fn stop_advertising(&self) -> Result<(), LinkError> {
        self.request(|respond_to| Command::StopAdvertising { respond_to })
            .await
    }

    /// Stream a payload to subscribed centrals.
    ///
    /// Returns once the first burst is pushed; completion is reported as
    /// [`NodeEvent::TransferCompleted`].
    pub async fn send(&self, payload: Vec<u8>) -> Result<PumpState, LinkError> {
        self.request(|respond_to| Command::Send {
            payload,
            respond_to,
        })
        .await?
    }

    /// Stream a payload to a connected peripheral.
    pub async fn send_to_peer(
        &self,
        peer_id: PeerId,
        payload: Vec<u8>,
    ) -> Result<PumpState, LinkError> {
        self.request(|respond_to| Command::SendToPeer {
            peer_id,
            payload,
            respond_to,
        })
        .await?
    }

    /// Snapshot of known peers.
    pub fn peers(&self) -> Vec<Peer> {
        self.state.get_peers()
    }

    pub fn state(&self) -> &Arc<NodeState> {
        &self.state
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<NodeEvent> {
        self.event_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::ble_constants::{EOM_MARKER, TRANSFER_CHAR_UUID};
    use crate::bluetooth::memory::{ConnectBehavior, MemoryRadio, MemoryRadioController};
    use crate::bluetooth::radio::event_channel;
    use crate::bluetooth::registry::ConnectionState;

    fn spawn_manager() -> (BluetoothHandle, MemoryRadioController) {
        let (tx, rx) = event_channel();
        let (radio, controller) = MemoryRadio::new(tx);
        let config = BluetoothConfig {
            chunk_size: 4,
            ..Default::default()
        };
        (BluetoothManager::spawn(Box::new(radio), rx, config), controller)
    }

    async fn next_matching(
        events: &mut broadcast::Receiver<NodeEvent>,
        pred: impl Fn(&NodeEvent) -> bool,
    ) -> NodeEvent {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let event = events.recv().await.unwrap();
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .unwrap()
    }

    async fn discover(
        handle: &BluetoothHandle,
        controller: &MemoryRadioController,
        radio: &str,
        announcement: &str,
    ) -> Peer {
        let mut events = handle.subscribe_events();
        controller.emit(RadioEvent::Discovered {
            handle: RadioHandle::new(radio),
            announcement: Some(announcement.to_string()),
            connected: false,
        });
        match next_matching(&mut events, |e| {
            matches!(e, NodeEvent::PeerDiscovered(_) | NodeEvent::PeerUpdated(_))
        })
        .await
        {
            NodeEvent::PeerDiscovered(peer) | NodeEvent::PeerUpdated(peer) => peer,
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_discovery_dedups_by_owner() {
        let (handle, controller) = spawn_manager();
        handle.start_scan().await.unwrap();
        assert!(controller.is_scanning());

        let first = discover(&handle, &controller, "h1", "1234dscd34hskad7Alice").await;
        let second = discover(&handle, &controller, "h2", "1234dscd34hskad7Alice").await;

        assert_eq!(first.id, second.id);
        assert_eq!(handle.peers().len(), 1);
        assert_eq!(handle.peers()[0].radio_handle, RadioHandle::new("h2"));
        assert_eq!(handle.state().get_scan_status(), ScanStatus::Loaded);
    }

    #[tokio::test]
    async fn test_malformed_and_unnamed_announcements_dropped() {
        let (handle, controller) = spawn_manager();
        controller.emit(RadioEvent::Discovered {
            handle: RadioHandle::new("h1"),
            announcement: Some("short".to_string()),
            connected: false,
        });
        controller.emit(RadioEvent::Discovered {
            handle: RadioHandle::new("h2"),
            announcement: None,
            connected: false,
        });
        let peer = discover(&handle, &controller, "h3", "1234dscd34hskad7Alice").await;
        assert_eq!(handle.peers(), vec![peer]);
    }

    #[tokio::test]
    async fn test_connect_and_disconnect() {
        let (handle, controller) = spawn_manager();
        let peer = discover(&handle, &controller, "h1", "1234dscd34hskad7Alice").await;

        let connected = handle.connect(peer.id).await.unwrap();
        assert_eq!(connected.connection_state, ConnectionState::Connected);
        assert_eq!(
            controller.notify_calls(),
            vec![(RadioHandle::new("h1"), true)]
        );

        // Already connected: no second radio call.
        handle.connect(peer.id).await.unwrap();
        assert_eq!(controller.connect_calls().len(), 1);

        let disconnected = handle.disconnect(peer.id).await.unwrap();
        assert_eq!(disconnected.connection_state, ConnectionState::Disconnected);
        assert_eq!(handle.peers()[0].connection_state, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_concurrent_connect_rejected() {
        let (handle, controller) = spawn_manager();
        controller.set_connect_behavior(ConnectBehavior::Hold);
        let peer = discover(&handle, &controller, "h1", "1234dscd34hskad7Alice").await;

        let first = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.connect(peer.id).await })
        };
        tokio::time::timeout(Duration::from_secs(2), async {
            while controller.connect_calls().is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        assert_eq!(
            handle.connect(peer.id).await,
            Err(LinkError::AlreadyConnecting)
        );

        controller.emit(RadioEvent::Connected(RadioHandle::new("h1")));
        assert!(first.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_connect_rejected_by_radio() {
        let (handle, controller) = spawn_manager();
        controller.set_connect_behavior(ConnectBehavior::Fail("out of range".into()));
        let peer = discover(&handle, &controller, "h1", "1234dscd34hskad7Alice").await;

        assert_eq!(
            handle.connect(peer.id).await,
            Err(LinkError::ConnectRejected {
                cause: "out of range".into()
            })
        );
        assert_eq!(handle.peers()[0].connection_state, ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_connect_timeout_leaves_operation_pending() {
        let (handle, controller) = spawn_manager();
        controller.set_connect_behavior(ConnectBehavior::Hold);
        let peer = discover(&handle, &controller, "h1", "1234dscd34hskad7Alice").await;

        assert_eq!(
            handle
                .connect_with_timeout(peer.id, Duration::from_millis(20))
                .await,
            Err(LinkError::ConnectTimeout)
        );
        // Still pending on the radio side.
        assert_eq!(
            handle.connect(peer.id).await,
            Err(LinkError::AlreadyConnecting)
        );

        let mut events = handle.subscribe_events();
        controller.emit(RadioEvent::Connected(RadioHandle::new("h1")));
        next_matching(&mut events, |e| {
            matches!(e, NodeEvent::PeerUpdated(p) if p.is_connected())
        })
        .await;
        assert!(handle.peers()[0].is_connected());
    }

    #[tokio::test]
    async fn test_unsolicited_disconnect_reports_link_lost() {
        let (handle, controller) = spawn_manager();
        let peer = discover(&handle, &controller, "h1", "1234dscd34hskad7Alice").await;
        handle.connect(peer.id).await.unwrap();

        let mut events = handle.subscribe_events();
        controller.emit(RadioEvent::Disconnected {
            handle: RadioHandle::new("h1"),
            cause: Some("supervision timeout".into()),
        });
        let event = next_matching(&mut events, |e| matches!(e, NodeEvent::LinkLost { .. })).await;
        assert_eq!(
            event,
            NodeEvent::LinkLost {
                peer: Peer {
                    connection_state: ConnectionState::Disconnected,
                    ..peer.clone()
                },
                cause: Some("supervision timeout".into()),
            }
        );
        assert_eq!(handle.peers().len(), 1);
    }

    #[tokio::test]
    async fn test_scan_waits_for_power_on() {
        let (handle, controller) = spawn_manager();
        let mut events = handle.subscribe_events();
        controller.set_state(RadioState::PoweredOff);
        next_matching(&mut events, |e| {
            matches!(e, NodeEvent::RadioStateChanged(RadioState::PoweredOff))
        })
        .await;

        handle.start_scan().await.unwrap();
        assert!(!controller.is_scanning());
        assert_eq!(
            handle.state().get_scan_status(),
            ScanStatus::Unavailable(RadioState::PoweredOff)
        );

        controller.set_state(RadioState::PoweredOn);
        next_matching(&mut events, |e| {
            matches!(e, NodeEvent::RadioStateChanged(RadioState::PoweredOn))
        })
        .await;
        assert!(controller.is_scanning());
        assert_eq!(handle.state().get_scan_status(), ScanStatus::Scanning);
    }

    #[tokio::test]
    async fn test_power_off_fails_pending_connect() {
        let (handle, controller) = spawn_manager();
        controller.set_connect_behavior(ConnectBehavior::Hold);
        let peer = discover(&handle, &controller, "h1", "1234dscd34hskad7Alice").await;

        let pending = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.connect(peer.id).await })
        };
        tokio::time::timeout(Duration::from_secs(2), async {
            while controller.connect_calls().is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        controller.set_state(RadioState::PoweredOff);
        assert!(matches!(
            pending.await.unwrap(),
            Err(LinkError::ConnectRejected { .. })
        ));
    }

    #[tokio::test]
    async fn test_reset_clears_peers() {
        let (handle, controller) = spawn_manager();
        handle.start_scan().await.unwrap();
        discover(&handle, &controller, "h1", "1234dscd34hskad7Alice").await;

        handle.reset().await.unwrap();
        assert!(handle.peers().is_empty());
        assert!(!controller.is_scanning());
        assert!(handle.state().get_scan_status().is_loading());
    }

    #[tokio::test]
    async fn test_send_with_flow_control() {
        let (handle, controller) = spawn_manager();
        let identity = IdentityRecord::new("1234", "dscd34", "hskad7", "Alice");
        assert_eq!(
            handle.start_advertising(identity.clone()).await.unwrap(),
            AdvertiseOutcome::Started
        );
        assert_eq!(
            handle.start_advertising(identity).await.unwrap(),
            AdvertiseOutcome::AlreadyAdvertising
        );

        let mut events = handle.subscribe_events();
        controller.limit_pushes(Some(1));
        let state = handle.send(b"abcdefghij".to_vec()).await.unwrap();
        assert_eq!(state, PumpState::Blocked { cursor: 4 });

        controller.grant(10);
        let event =
            next_matching(&mut events, |e| matches!(e, NodeEvent::TransferCompleted { .. })).await;
        assert_eq!(event, NodeEvent::TransferCompleted { bytes: 10 });

        let pushed = controller.pushed();
        assert_eq!(
            pushed,
            vec![
                b"abcd".to_vec(),
                b"efgh".to_vec(),
                b"ij".to_vec(),
                EOM_MARKER.to_vec()
            ]
        );
    }

    #[tokio::test]
    async fn test_send_without_advertising_fails() {
        let (handle, _controller) = spawn_manager();
        assert_eq!(
            handle.send(b"x".to_vec()).await,
            Err(LinkError::NotAdvertising)
        );
    }

    #[tokio::test]
    async fn test_send_to_peer_requires_connection() {
        let (handle, controller) = spawn_manager();
        let peer = discover(&handle, &controller, "h1", "1234dscd34hskad7Alice").await;
        assert_eq!(
            handle.send_to_peer(peer.id, b"x".to_vec()).await,
            Err(LinkError::NotConnected(peer.id))
        );
        assert_eq!(
            handle.send_to_peer(PeerId(99), b"x".to_vec()).await,
            Err(LinkError::UnknownPeer(PeerId(99)))
        );

        handle.connect(peer.id).await.unwrap();
        assert_eq!(
            handle.send_to_peer(peer.id, b"hello".to_vec()).await,
            Ok(PumpState::Completed { bytes: 5 })
        );
        assert_eq!(controller.writes().len(), 3);
    }

    #[tokio::test]
    async fn test_inbound_payloads_are_broadcast() {
        let (handle, controller) = spawn_manager();
        let mut events = handle.subscribe_events();

        for chunk in [&b"AB"[..], b"CD", b"EOM", b"EOM"] {
            controller.emit(RadioEvent::WriteReceived {
                characteristic: TRANSFER_CHAR_UUID,
                data: chunk.to_vec(),
            });
        }
        let event =
            next_matching(&mut events, |e| matches!(e, NodeEvent::PayloadReceived { .. })).await;
        assert_eq!(
            event,
            NodeEvent::PayloadReceived {
                source: PayloadSource::Central,
                data: b"ABCD".to_vec()
            }
        );
    }

    #[tokio::test]
    async fn test_peer_drop_keeps_other_peers_partial_payload() {
        let (handle, controller) = spawn_manager();
        let alice = discover(&handle, &controller, "h1", "1234dscd34hskad7Alice").await;
        let bob = discover(&handle, &controller, "h2", "1234dscd34bob999Bob").await;
        handle.connect(alice.id).await.unwrap();
        handle.connect(bob.id).await.unwrap();

        let mut events = handle.subscribe_events();
        let notify = |radio: &str, data: &[u8]| RadioEvent::NotificationReceived {
            handle: RadioHandle::new(radio),
            characteristic: TRANSFER_CHAR_UUID,
            data: data.to_vec(),
        };
        controller.emit(notify("h1", b"AB"));
        controller.emit(RadioEvent::Disconnected {
            handle: RadioHandle::new("h2"),
            cause: Some("out of range".into()),
        });
        controller.emit(notify("h1", b"CD"));
        controller.emit(notify("h1", b"EOM"));

        let event =
            next_matching(&mut events, |e| matches!(e, NodeEvent::PayloadReceived { .. })).await;
        assert_eq!(
            event,
            NodeEvent::PayloadReceived {
                source: PayloadSource::Peer {
                    handle: RadioHandle::new("h1"),
                    peer_id: Some(alice.id),
                },
                data: b"ABCD".to_vec(),
            }
        );
    }

    #[tokio::test]
    async fn test_manager_outlives_controller() {
        let (handle, controller) = spawn_manager();
        drop(controller);
        // The radio still holds an event sender.
        handle.stop_scan().await.unwrap();
    }
}
