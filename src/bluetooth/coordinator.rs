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

//! Turns radio connect/disconnect callbacks into awaitable operations.
//!
//! Each request installs a single-use responder keyed by `(peer, kind)`.
//! The matching radio event removes and fires it; later duplicates find
//! nothing to resolve. At most one operation of each kind per peer.

use std::collections::HashMap;

use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::error::LinkError;
use super::radio::{RadioHandle, RadioStack};
use super::registry::{ConnectionState, Peer, PeerId, PeerRegistry};

/// Responder for a connect request.
pub type ConnectResponder = oneshot::Sender<Result<Peer, LinkError>>;

/// Responder for a disconnect request.
pub type DisconnectResponder = oneshot::Sender<Result<Peer, LinkError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Connect,
    Disconnect,
}

/// An outstanding connect or disconnect.
struct PendingOperation {
    /// Peer as it was when the request was made, used if the registry forgot it.
    peer: Peer,
    handle: RadioHandle,
    responder: oneshot::Sender<Result<Peer, LinkError>>,
}

/// What a radio `Disconnected` event meant.
#[derive(Debug, Clone, PartialEq)]
pub struct DisconnectOutcome {
    pub peer: Peer,
    /// The link dropped without anyone asking for it.
    pub unsolicited: bool,
}

/// Pending-operation table for every peer.
#[derive(Default)]
pub struct ConnectionCoordinator {
    pending: HashMap<(PeerId, OperationKind), PendingOperation>,
}

impl ConnectionCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_pending(&self, peer_id: PeerId, kind: OperationKind) -> bool {
        self.pending.contains_key(&(peer_id, kind))
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Start connecting to a peer. `respond_to` fires when the radio answers,
    /// or immediately for a short-circuit or rejection.
    pub fn connect(
        &mut self,
        registry: &mut PeerRegistry,
        radio: &mut dyn RadioStack,
        peer_id: PeerId,
        respond_to: ConnectResponder,
    ) {
        let Some(peer) = registry.get(peer_id).cloned() else {
            let _ = respond_to.send(Err(LinkError::UnknownPeer(peer_id)));
            return;
        };
        if peer.connection_state == ConnectionState::Connected {
            debug!("{} already connected", peer_id);
            let _ = respond_to.send(Ok(peer));
            return;
        }
        if self.is_pending(peer_id, OperationKind::Connect) {
            debug!("{} connect already pending", peer_id);
            let _ = respond_to.send(Err(LinkError::AlreadyConnecting));
            return;
        }

        info!("Connecting to {} via {}", peer_id, peer.radio_handle);
        let peer = registry
            .set_connection_state(peer_id, ConnectionState::Connecting)
            .unwrap_or(peer);
        let handle = peer.radio_handle.clone();
        self.pending.insert(
            (peer_id, OperationKind::Connect),
            PendingOperation {
                peer,
                handle: handle.clone(),
                responder: respond_to,
            },
        );
        radio.connect(&handle);
    }

    /// Start disconnecting from a peer. Never fails on the radio's account.
    pub fn disconnect(
        &mut self,
        registry: &mut PeerRegistry,
        radio: &mut dyn RadioStack,
        peer_id: PeerId,
        respond_to: DisconnectResponder,
    ) {
        let Some(peer) = registry.get(peer_id).cloned() else {
            let _ = respond_to.send(Err(LinkError::UnknownPeer(peer_id)));
            return;
        };
        if peer.connection_state == ConnectionState::Disconnected {
            debug!("{} already disconnected", peer_id);
            let _ = respond_to.send(Ok(peer));
            return;
        }
        if self.is_pending(peer_id, OperationKind::Disconnect) {
            debug!("{} disconnect already pending", peer_id);
            let _ = respond_to.send(Err(LinkError::AlreadyDisconnecting));
            return;
        }

        info!("Disconnecting from {}", peer_id);
        let peer = registry
            .set_connection_state(peer_id, ConnectionState::Disconnecting)
            .unwrap_or(peer);
        let handle = peer.radio_handle.clone();
        self.pending.insert(
            (peer_id, OperationKind::Disconnect),
            PendingOperation {
                peer,
                handle: handle.clone(),
                responder: respond_to,
            },
        );
        radio.disconnect(&handle);
    }

    /// Radio reports a connection completed.
    pub fn on_connected(&mut self, registry: &mut PeerRegistry, handle: &RadioHandle) -> Option<Peer> {
        let peer_id = self.resolve_peer(registry, handle, OperationKind::Connect)?;
        let peer = self.update(registry, peer_id, ConnectionState::Connected)?;
        info!("Connected to {}", peer_id);

        match self.pending.remove(&(peer_id, OperationKind::Connect)) {
            Some(op) => {
                if op.responder.send(Ok(peer.clone())).is_err() {
                    debug!("Connect caller for {} went away", peer_id);
                }
            }
            None => debug!("Connected event for {} with no pending connect", peer_id),
        }
        Some(peer)
    }

    /// Radio reports a connection attempt failed.
    pub fn on_connect_failed(
        &mut self,
        registry: &mut PeerRegistry,
        handle: &RadioHandle,
        cause: &str,
    ) -> Option<Peer> {
        let peer_id = self.resolve_peer(registry, handle, OperationKind::Connect)?;
        if !self.is_pending(peer_id, OperationKind::Connect) {
            debug!("Connect failure for {} with no pending connect, ignoring", peer_id);
            return None;
        }
        let peer = self.update(registry, peer_id, ConnectionState::Disconnected)?;
        warn!("Connect to {} failed: {}", peer_id, cause);

        if let Some(op) = self.pending.remove(&(peer_id, OperationKind::Connect)) {
            let _ = op.responder.send(Err(LinkError::ConnectRejected {
                cause: cause.to_string(),
            }));
        }
        Some(peer)
    }

    /// Radio reports a link went down, requested or not.
    ///
    /// The registry is updated either way. A pending disconnect is resolved;
    /// a pending connect fails since the link never came up.
    pub fn on_disconnected(
        &mut self,
        registry: &mut PeerRegistry,
        handle: &RadioHandle,
        cause: Option<&str>,
    ) -> Option<DisconnectOutcome> {
        let peer_id = self
            .resolve_peer(registry, handle, OperationKind::Disconnect)
            .or_else(|| self.resolve_peer(registry, handle, OperationKind::Connect))?;
        let previous = registry.get(peer_id).map(|p| p.connection_state);
        let peer = self.update(registry, peer_id, ConnectionState::Disconnected)?;

        let requested = self.pending.remove(&(peer_id, OperationKind::Disconnect));
        let interrupted = self.pending.remove(&(peer_id, OperationKind::Connect));

        if let Some(op) = interrupted {
            let _ = op.responder.send(Err(LinkError::ConnectRejected {
                cause: cause
                    .unwrap_or("link closed before connection completed")
                    .to_string(),
            }));
        }

        let unsolicited = match requested {
            Some(op) => {
                info!("Disconnected from {}", peer_id);
                let _ = op.responder.send(Ok(peer.clone()));
                false
            }
            None => {
                let was_up = matches!(
                    previous,
                    Some(ConnectionState::Connected) | Some(ConnectionState::Disconnecting)
                );
                if was_up {
                    info!("Link to {} dropped: {}", peer_id, cause.unwrap_or("no cause"));
                }
                was_up
            }
        };

        Some(DisconnectOutcome { peer, unsolicited })
    }

    /// The radio went away: nothing is connected and nothing will answer.
    pub fn on_radio_lost(&mut self, registry: &mut PeerRegistry) -> Vec<Peer> {
        for ((peer_id, kind), op) in self.pending.drain() {
            let mut peer = registry.get(peer_id).cloned().unwrap_or(op.peer);
            peer.connection_state = ConnectionState::Disconnected;
            let result = match kind {
                OperationKind::Connect => Err(LinkError::ConnectRejected {
                    cause: "radio unavailable".to_string(),
                }),
                OperationKind::Disconnect => Ok(peer),
            };
            let _ = op.responder.send(result);
        }

        let affected: Vec<PeerId> = registry
            .iter()
            .filter(|p| p.connection_state != ConnectionState::Disconnected)
            .map(|p| p.id)
            .collect();
        affected
            .into_iter()
            .filter_map(|id| registry.set_connection_state(id, ConnectionState::Disconnected))
            .collect()
    }

    /// Find the peer a radio event refers to. A pending operation's handle
    /// wins over the registry so a handle refreshed mid-connect still matches.
    fn resolve_peer(
        &self,
        registry: &PeerRegistry,
        handle: &RadioHandle,
        kind: OperationKind,
    ) -> Option<PeerId> {
        self.pending
            .iter()
            .find(|((_, k), op)| *k == kind && &op.handle == handle)
            .map(|((id, _), _)| *id)
            .or_else(|| registry.find_by_handle(handle).map(|p| p.id))
    }

    /// Write the new state, falling back to the pending snapshot for a peer
    /// the registry no longer knows.
    fn update(
        &self,
        registry: &mut PeerRegistry,
        peer_id: PeerId,
        state: ConnectionState,
    ) -> Option<Peer> {
        if let Some(peer) = registry.set_connection_state(peer_id, state) {
            return Some(peer);
        }
        let op = self
            .pending
            .get(&(peer_id, OperationKind::Connect))
            .or_else(|| self.pending.get(&(peer_id, OperationKind::Disconnect)))?;
        let mut peer = op.peer.clone();
        peer.connection_state = state;
        Some(peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bluetooth::memory::{ConnectBehavior, MemoryRadio, MemoryRadioController};
    use crate::bluetooth::radio::event_channel;
    use tokio::sync::oneshot::error::TryRecvError;

    struct Fixture {
        registry: PeerRegistry,
        coordinator: ConnectionCoordinator,
        radio: MemoryRadio,
        controller: MemoryRadioController,
        peer: Peer,
    }

    fn fixture() -> Fixture {
        let (tx, _rx) = event_channel();
        let (radio, controller) = MemoryRadio::new(tx);
        controller.set_connect_behavior(ConnectBehavior::Hold);
        controller.set_auto_disconnect(false);
        let mut registry = PeerRegistry::new();
        let peer = registry
            .upsert(RadioHandle::new("h1"), "1234dscd34hskad7Alice", false)
            .unwrap();
        Fixture {
            registry,
            coordinator: ConnectionCoordinator::new(),
            radio,
            controller,
            peer,
        }
    }

    impl Fixture {
        fn connect(&mut self) -> oneshot::Receiver<Result<Peer, LinkError>> {
            let (tx, rx) = oneshot::channel();
            self.coordinator
                .connect(&mut self.registry, &mut self.radio, self.peer.id, tx);
            rx
        }

        fn disconnect(&mut self) -> oneshot::Receiver<Result<Peer, LinkError>> {
            let (tx, rx) = oneshot::channel();
            self.coordinator
                .disconnect(&mut self.registry, &mut self.radio, self.peer.id, tx);
            rx
        }

        fn state(&self) -> ConnectionState {
            self.registry.get(self.peer.id).unwrap().connection_state
        }
    }

    #[test]
    fn test_connect_resolves_on_radio_event() {
        let mut f = fixture();
        let mut rx = f.connect();

        assert_eq!(f.state(), ConnectionState::Connecting);
        assert_eq!(f.controller.connect_calls(), vec![RadioHandle::new("h1")]);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        f.coordinator
            .on_connected(&mut f.registry, &RadioHandle::new("h1"));
        let peer = rx.try_recv().unwrap().unwrap();
        assert_eq!(peer.connection_state, ConnectionState::Connected);
        assert_eq!(f.state(), ConnectionState::Connected);
        assert_eq!(f.coordinator.pending_count(), 0);
    }

    #[test]
    fn test_second_connect_rejected_while_pending() {
        let mut f = fixture();
        let mut first = f.connect();
        let mut second = f.connect();

        assert_eq!(second.try_recv().unwrap(), Err(LinkError::AlreadyConnecting));
        assert_eq!(f.controller.connect_calls().len(), 1);

        f.coordinator
            .on_connected(&mut f.registry, &RadioHandle::new("h1"));
        assert!(first.try_recv().unwrap().is_ok());
    }

    #[test]
    fn test_connect_short_circuits_when_connected() {
        let mut f = fixture();
        f.registry
            .set_connection_state(f.peer.id, ConnectionState::Connected);
        let mut rx = f.connect();

        assert!(rx.try_recv().unwrap().is_ok());
        assert!(f.controller.connect_calls().is_empty());
    }

    #[test]
    fn test_connect_unknown_peer() {
        let mut f = fixture();
        let (tx, mut rx) = oneshot::channel();
        f.coordinator
            .connect(&mut f.registry, &mut f.radio, PeerId(42), tx);
        assert_eq!(rx.try_recv().unwrap(), Err(LinkError::UnknownPeer(PeerId(42))));
    }

    #[test]
    fn test_connect_failure_wraps_cause() {
        let mut f = fixture();
        let mut rx = f.connect();
        f.coordinator
            .on_connect_failed(&mut f.registry, &RadioHandle::new("h1"), "peer refused");

        assert_eq!(
            rx.try_recv().unwrap(),
            Err(LinkError::ConnectRejected {
                cause: "peer refused".to_string()
            })
        );
        assert_eq!(f.state(), ConnectionState::Disconnected);
        // Not retried.
        assert_eq!(f.controller.connect_calls().len(), 1);
    }

    #[test]
    fn test_duplicate_callback_is_noop() {
        let mut f = fixture();
        let mut rx = f.connect();
        let handle = RadioHandle::new("h1");

        f.coordinator.on_connected(&mut f.registry, &handle);
        f.coordinator.on_connected(&mut f.registry, &handle);
        f.coordinator
            .on_connect_failed(&mut f.registry, &handle, "late");

        assert!(rx.try_recv().unwrap().is_ok());
        assert_eq!(f.coordinator.pending_count(), 0);
        assert_eq!(f.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_stale_resolution_after_caller_gave_up() {
        let mut f = fixture();
        let rx = f.connect();
        drop(rx);
        assert!(f.coordinator.is_pending(f.peer.id, OperationKind::Connect));

        let peer = f
            .coordinator
            .on_connected(&mut f.registry, &RadioHandle::new("h1"))
            .unwrap();
        assert!(peer.is_connected());
        assert!(!f.coordinator.is_pending(f.peer.id, OperationKind::Connect));
    }

    #[test]
    fn test_disconnect_roundtrip() {
        let mut f = fixture();
        f.registry
            .set_connection_state(f.peer.id, ConnectionState::Connected);

        let mut rx = f.disconnect();
        assert_eq!(f.state(), ConnectionState::Disconnecting);
        let mut again = f.disconnect();
        assert_eq!(again.try_recv().unwrap(), Err(LinkError::AlreadyDisconnecting));

        let outcome = f
            .coordinator
            .on_disconnected(&mut f.registry, &RadioHandle::new("h1"), None)
            .unwrap();
        assert!(!outcome.unsolicited);
        let peer = rx.try_recv().unwrap().unwrap();
        assert_eq!(peer.connection_state, ConnectionState::Disconnected);
        assert_eq!(f.controller.disconnect_calls().len(), 1);
    }

    #[test]
    fn test_disconnect_short_circuits_when_disconnected() {
        let mut f = fixture();
        let mut rx = f.disconnect();
        assert!(rx.try_recv().unwrap().is_ok());
        assert!(f.controller.disconnect_calls().is_empty());
    }

    #[test]
    fn test_unsolicited_disconnect_updates_registry() {
        let mut f = fixture();
        let mut rx = f.connect();
        f.coordinator
            .on_connected(&mut f.registry, &RadioHandle::new("h1"));
        rx.try_recv().unwrap().unwrap();

        let outcome = f
            .coordinator
            .on_disconnected(&mut f.registry, &RadioHandle::new("h1"), Some("timeout"))
            .unwrap();
        assert!(outcome.unsolicited);
        assert_eq!(f.state(), ConnectionState::Disconnected);

        // A repeated event for a peer already down is not a new link loss.
        let outcome = f
            .coordinator
            .on_disconnected(&mut f.registry, &RadioHandle::new("h1"), None)
            .unwrap();
        assert!(!outcome.unsolicited);
    }

    #[test]
    fn test_disconnect_during_connect_fails_connect() {
        let mut f = fixture();
        let mut rx = f.connect();
        f.coordinator
            .on_disconnected(&mut f.registry, &RadioHandle::new("h1"), None);

        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(LinkError::ConnectRejected { .. })
        ));
        assert_eq!(f.coordinator.pending_count(), 0);
    }

    #[test]
    fn test_pending_handle_survives_handle_refresh() {
        let mut f = fixture();
        let mut rx = f.connect();

        // Same owner re-discovered under a new radio handle mid-connect.
        f.registry
            .upsert(RadioHandle::new("h2"), "1234dscd34hskad7Alice", false);
        f.coordinator
            .on_connected(&mut f.registry, &RadioHandle::new("h1"));

        assert!(rx.try_recv().unwrap().is_ok());
        assert_eq!(f.state(), ConnectionState::Connected);
    }

    #[test]
    fn test_resolution_after_registry_reset() {
        let mut f = fixture();
        let mut rx = f.connect();
        f.registry.reset();

        let peer = f
            .coordinator
            .on_connected(&mut f.registry, &RadioHandle::new("h1"))
            .unwrap();
        assert_eq!(peer.id, f.peer.id);
        assert!(rx.try_recv().unwrap().is_ok());
    }

    #[test]
    fn test_radio_lost_fails_pending_and_drops_links() {
        let mut f = fixture();
        let other = f
            .registry
            .upsert(RadioHandle::new("h2"), "1234dscd34owner2Bob", true)
            .unwrap();
        let mut rx = f.connect();

        let changed = f.coordinator.on_radio_lost(&mut f.registry);
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(LinkError::ConnectRejected { .. })
        ));
        assert_eq!(f.coordinator.pending_count(), 0);
        assert_eq!(changed.len(), 2);
        assert!(changed.iter().any(|p| p.id == other.id));
        assert!(f
            .registry
            .iter()
            .all(|p| p.connection_state == ConnectionState::Disconnected));
    }

    #[test]
    fn test_operations_for_different_peers_are_independent() {
        let mut f = fixture();
        let other = f
            .registry
            .upsert(RadioHandle::new("h2"), "1234dscd34owner2Bob", false)
            .unwrap();

        let mut first = f.connect();
        let (tx, mut second) = oneshot::channel();
        f.coordinator
            .connect(&mut f.registry, &mut f.radio, other.id, tx);
        assert_eq!(f.coordinator.pending_count(), 2);

        f.coordinator
            .on_connected(&mut f.registry, &RadioHandle::new("h2"));
        assert!(second.try_recv().unwrap().is_ok());
        assert!(matches!(first.try_recv(), Err(TryRecvError::Empty)));
    }
}
