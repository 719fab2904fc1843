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

//! Read-side view of the link layer, written only by the manager task.

use parking_lot::RwLock;
use std::sync::Arc;

use crate::bluetooth::{Peer, RadioState};

/// Discovery status shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStatus {
    /// Waiting for the radio.
    Loading,
    /// Scanning, nothing found yet.
    Scanning,
    /// At least one peer found.
    Loaded,
    /// Radio cannot scan in this state.
    Unavailable(RadioState),
}

impl ScanStatus {
    /// Status implied by a radio state change.
    pub fn for_radio_state(state: RadioState, scan_requested: bool) -> Self {
        match state {
            RadioState::PoweredOn if scan_requested => ScanStatus::Scanning,
            RadioState::PoweredOn => ScanStatus::Loading,
            RadioState::PoweredOff | RadioState::Unauthorized | RadioState::Unsupported => {
                ScanStatus::Unavailable(state)
            }
            RadioState::Resetting | RadioState::Unknown => ScanStatus::Loading,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ScanStatus::Loading => "Loading...",
            ScanStatus::Scanning => "Scanning...",
            ScanStatus::Loaded => "Loaded",
            ScanStatus::Unavailable(RadioState::PoweredOff) => "Bluetooth is turned off",
            ScanStatus::Unavailable(RadioState::Unauthorized) => "Bluetooth permission denied",
            ScanStatus::Unavailable(RadioState::Unsupported) => {
                "Bluetooth not supported on this device"
            }
            ScanStatus::Unavailable(_) => "Bluetooth unavailable",
        }
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, ScanStatus::Loading)
    }
}

#[derive(Debug)]
pub struct NodeState {
    /// Last reported radio state.
    pub radio_state: RwLock<RadioState>,

    /// Discovery status.
    pub scan_status: RwLock<ScanStatus>,

    /// Whether our service is advertised.
    pub advertising: RwLock<bool>,

    /// Known peers in discovery order.
    pub peers: RwLock<Vec<Peer>>,
}

impl Default for NodeState {
    fn default() -> Self {
        Self {
            radio_state: RwLock::new(RadioState::Unknown),
            scan_status: RwLock::new(ScanStatus::Loading),
            advertising: RwLock::new(false),
            peers: RwLock::new(Vec::new()),
        }
    }
}

impl NodeState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_radio_state(&self, state: RadioState) {
        *self.radio_state.write() = state;
    }

    pub fn get_radio_state(&self) -> RadioState {
        *self.radio_state.read()
    }

    pub fn set_scan_status(&self, status: ScanStatus) {
        *self.scan_status.write() = status;
    }

    pub fn get_scan_status(&self) -> ScanStatus {
        *self.scan_status.read()
    }

    pub fn set_advertising(&self, advertising: bool) {
        *self.advertising.write() = advertising;
    }

    pub fn is_advertising(&self) -> bool {
        *self.advertising.read()
    }

    pub fn set_peers(&self, peers: Vec<Peer>) {
        *self.peers.write() = peers;
    }

    /// Copy of the known peers.
    pub fn get_peers(&self) -> Vec<Peer> {
        self.peers.read().clone()
    }
}
