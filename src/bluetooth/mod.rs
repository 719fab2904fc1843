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

//! Bluetooth LE link layer.
//!
//! Peers find each other through an advertised identity, connect, and
//! stream payloads over a single GATT characteristic in EOM-terminated
//! chunks. Everything above the radio is driven by [`BluetoothManager`].

pub mod ble_constants;
mod coordinator;
mod error;
pub mod identity;
mod manager;
pub mod memory;
pub mod radio;
mod reassembler;
mod registry;
mod transfer;

#[cfg(feature = "bluez")]
mod bluez;

#[cfg(feature = "bluez")]
pub use bluez::BluezRadio;
pub use coordinator::{ConnectionCoordinator, DisconnectOutcome, OperationKind};
pub use error::LinkError;
pub use identity::IdentityRecord;
pub use manager::{BluetoothHandle, BluetoothManager, NodeEvent, PayloadSource};
pub use radio::{RadioEvent, RadioHandle, RadioStack, RadioState, ScanFilter};
pub use reassembler::MessageReassembler;
pub use registry::{ConnectionState, Peer, PeerId, PeerRegistry};
pub use transfer::{AdvertiseOutcome, ChunkedTransferEngine, OutboundTarget, PumpState};
