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

//! Registry of discovered peers, deduplicated by announced owner.

use std::collections::HashMap;
use std::fmt;

use tracing::{debug, warn};

use super::identity::{self, IdentityRecord};
use super::radio::RadioHandle;

/// Stable local handle for a peer. Never reused within a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// Link state of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// A discovered peer.
#[derive(Debug, Clone, PartialEq)]
pub struct Peer {
    pub id: PeerId,
    pub identity: IdentityRecord,
    pub connection_state: ConnectionState,
    pub radio_handle: RadioHandle,
}

impl Peer {
    pub fn is_connected(&self) -> bool {
        self.connection_state == ConnectionState::Connected
    }
}

/// Known peers in first-seen order.
#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: Vec<Peer>,
    by_owner: HashMap<String, usize>,
    next_id: u64,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a discovery event.
    ///
    /// Returns `None` when the announcement does not decode. A peer whose
    /// `owner_ref` is already known keeps its first-seen identity; only the
    /// radio handle and the connected flag are refreshed.
    pub fn upsert(
        &mut self,
        radio_handle: RadioHandle,
        announcement: &str,
        is_currently_connected: bool,
    ) -> Option<Peer> {
        let Some(record) = identity::decode(announcement) else {
            debug!("Dropping undecodable announcement from {}", radio_handle);
            return None;
        };

        if let Some(&index) = self.by_owner.get(&record.owner_ref) {
            let peer = &mut self.peers[index];
            if peer.radio_handle != radio_handle {
                debug!(
                    "{} ({}) now seen via {} (was {})",
                    peer.id, record.owner_ref, radio_handle, peer.radio_handle
                );
                peer.radio_handle = radio_handle;
            }
            if is_currently_connected {
                peer.connection_state = ConnectionState::Connected;
            } else if peer.connection_state == ConnectionState::Connected {
                peer.connection_state = ConnectionState::Disconnected;
            }
            return Some(peer.clone());
        }

        self.next_id += 1;
        let peer = Peer {
            id: PeerId(self.next_id),
            identity: record,
            connection_state: if is_currently_connected {
                ConnectionState::Connected
            } else {
                ConnectionState::Disconnected
            },
            radio_handle,
        };
        debug!(
            "New peer {}: {} ({})",
            peer.id, peer.identity.display_name, peer.identity.owner_ref
        );
        self.by_owner
            .insert(peer.identity.owner_ref.clone(), self.peers.len());
        self.peers.push(peer.clone());
        Some(peer)
    }

    /// Write a peer's connection state. Returns the updated peer.
    pub fn set_connection_state(&mut self, peer_id: PeerId, state: ConnectionState) -> Option<Peer> {
        let peer = self.peers.iter_mut().find(|p| p.id == peer_id)?;
        if state == ConnectionState::Connected
            && peer.connection_state == ConnectionState::Disconnecting
        {
            warn!("{} marked connected while disconnecting", peer_id);
        }
        peer.connection_state = state;
        Some(peer.clone())
    }

    /// Forget every peer.
    pub fn reset(&mut self) {
        self.peers.clear();
        self.by_owner.clear();
    }

    /// Copy of all peers in insertion order.
    pub fn snapshot(&self) -> Vec<Peer> {
        self.peers.clone()
    }

    pub fn get(&self, peer_id: PeerId) -> Option<&Peer> {
        self.peers.iter().find(|p| p.id == peer_id)
    }

    pub fn find_by_handle(&self, handle: &RadioHandle) -> Option<&Peer> {
        self.peers.iter().find(|p| &p.radio_handle == handle)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.iter()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
