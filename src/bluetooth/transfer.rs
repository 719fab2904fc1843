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

//! Chunked payload transfer over the transfer characteristic.
//!
//! The sender slices a payload into fixed-size chunks, pushes them one by one
//! and finishes with the EOM marker. When the radio refuses a push the loop
//! stops where it is and resumes from the same offset on the next
//! [`RadioEvent::ReadyToSend`](super::radio::RadioEvent::ReadyToSend).
//!
//! Peripheral role pushes notifications to subscribed centrals and receives
//! writes. Central role writes to a connected peripheral and receives
//! notifications. Only one outbound session exists at a time.

use std::collections::{HashMap, HashSet};

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::ble_constants::{EOM_MARKER, SERVICE_UUID, TRANSFER_CHAR_UUID};
use super::error::LinkError;
use super::identity::IdentityRecord;
use super::radio::{RadioHandle, RadioStack};
use super::reassembler::MessageReassembler;

/// Where outbound chunks go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundTarget {
    /// Notifications to every subscribed central.
    Subscribers,
    /// Writes to one connected peripheral.
    Peer(RadioHandle),
}

/// Result of driving the chunk loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PumpState {
    /// No outbound session.
    Idle,
    /// The radio refused a push at `cursor`; waiting for ready-to-send.
    Blocked { cursor: usize },
    /// Every chunk and the EOM marker were accepted.
    Completed { bytes: usize },
}

/// Outbound buffer and cursor plus the peripheral-role inbound accumulator.
pub struct TransferSession {
    outbound: Option<Vec<u8>>,
    target: OutboundTarget,
    cursor: usize,
    chunk_size: usize,
    inbound: MessageReassembler,
}

impl TransferSession {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            outbound: None,
            target: OutboundTarget::Subscribers,
            cursor: 0,
            chunk_size: chunk_size.max(1),
            inbound: MessageReassembler::new(),
        }
    }

    /// Replace any in-flight payload and rewind the cursor.
    fn begin(&mut self, payload: Vec<u8>, target: OutboundTarget) {
        if let Some(previous) = &self.outbound {
            warn!(
                "Superseding transfer at {}/{} bytes",
                self.cursor,
                previous.len()
            );
        }
        self.outbound = Some(payload);
        self.target = target;
        self.cursor = 0;
    }

    fn finish(&mut self) {
        self.outbound = None;
        self.cursor = 0;
    }

    pub fn is_active(&self) -> bool {
        self.outbound.is_some()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn target(&self) -> Option<&OutboundTarget> {
        self.outbound.as_ref().map(|_| &self.target)
    }

    /// Push chunks until the radio refuses one or the payload and EOM are out.
    fn pump(&mut self, radio: &mut dyn RadioStack, characteristic: Uuid) -> PumpState {
        let Some(buffer) = self.outbound.as_ref() else {
            return PumpState::Idle;
        };
        let total = buffer.len();

        loop {
            if self.cursor >= total {
                if !push(radio, &self.target, characteristic, EOM_MARKER) {
                    debug!("EOM push refused, waiting for ready-to-send");
                    return PumpState::Blocked {
                        cursor: self.cursor,
                    };
                }
                self.finish();
                return PumpState::Completed { bytes: total };
            }

            let end = (self.cursor + self.chunk_size).min(total);
            if !push(radio, &self.target, characteristic, &buffer[self.cursor..end]) {
                debug!("Link busy at {}/{} bytes", self.cursor, total);
                return PumpState::Blocked {
                    cursor: self.cursor,
                };
            }
            self.cursor = end;
        }
    }
}

fn push(radio: &mut dyn RadioStack, target: &OutboundTarget, characteristic: Uuid, data: &[u8]) -> bool {
    match target {
        OutboundTarget::Subscribers => radio.push_notification(characteristic, data),
        OutboundTarget::Peer(handle) => radio.write(handle, characteristic, data),
    }
}

/// Service we are advertising.
#[derive(Debug, Clone)]
struct AdvertisedService {
    announcement: String,
}

/// Outcome of an advertise request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvertiseOutcome {
    Started,
    AlreadyAdvertising,
    /// Radio not ready; the request is kept and retried on power-on.
    Deferred,
}

/// Send/receive engine for both roles.
pub struct ChunkedTransferEngine {
    session: TransferSession,
    service: Option<AdvertisedService>,
    pending_identity: Option<IdentityRecord>,
    subscribers: HashSet<String>,
    /// Central role: one accumulator per notifying peripheral.
    central_inbound: HashMap<RadioHandle, MessageReassembler>,
}

impl ChunkedTransferEngine {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            session: TransferSession::new(chunk_size),
            service: None,
            pending_identity: None,
            subscribers: HashSet::new(),
            central_inbound: HashMap::new(),
        }
    }

    pub fn session(&self) -> &TransferSession {
        &self.session
    }

    pub fn is_advertising(&self) -> bool {
        self.service.is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Publish the transfer service and advertise `identity`.
    ///
    /// A no-op while already advertising. On a radio that is not powered on
    /// the request is remembered and replayed by [`on_radio_ready`](Self::on_radio_ready).
    pub fn start_advertising(
        &mut self,
        radio: &mut dyn RadioStack,
        identity: &IdentityRecord,
    ) -> AdvertiseOutcome {
        if self.service.is_some() {
            debug!("Already advertising");
            return AdvertiseOutcome::AlreadyAdvertising;
        }
        if !radio.state().is_ready() {
            debug!("Radio not ready ({:?}), deferring advertising", radio.state());
            self.pending_identity = Some(identity.clone());
            return AdvertiseOutcome::Deferred;
        }

        let announcement = identity.encode();
        radio.advertise(SERVICE_UUID, TRANSFER_CHAR_UUID, &announcement);
        info!("Advertising as {:?}", announcement);
        self.service = Some(AdvertisedService { announcement });
        self.pending_identity = None;
        AdvertiseOutcome::Started
    }

    /// Replay a deferred advertise request.
    pub fn on_radio_ready(&mut self, radio: &mut dyn RadioStack) -> Option<AdvertiseOutcome> {
        let identity = self.pending_identity.take()?;
        Some(self.start_advertising(radio, &identity))
    }

    /// The radio lost power: published handles are gone.
    ///
    /// The identity is kept so advertising resumes on power-on.
    pub fn on_radio_lost(&mut self) {
        if let Some(service) = self.service.take() {
            if let Some(identity) = super::identity::decode(&service.announcement) {
                self.pending_identity = Some(identity);
            }
        }
        self.subscribers.clear();
        if self.session.is_active() {
            warn!("Radio lost, dropping outbound transfer");
            self.session.finish();
        }
        self.session.inbound.reset();
        self.central_inbound.clear();
    }

    pub fn stop_advertising(&mut self, radio: &mut dyn RadioStack) {
        self.pending_identity = None;
        if self.service.take().is_none() {
            return;
        }
        radio.stop_advertising();
        self.subscribers.clear();
        if self.session.is_active() && self.session.target == OutboundTarget::Subscribers {
            warn!("Advertising stopped, dropping outbound transfer");
            self.session.finish();
        }
        info!("Advertising stopped");
    }

    /// Peripheral role: stream `payload` to subscribed centrals.
    pub fn send(&mut self, radio: &mut dyn RadioStack, payload: Vec<u8>) -> Result<PumpState, LinkError> {
        if self.service.is_none() {
            return Err(LinkError::NotAdvertising);
        }
        if self.subscribers.is_empty() {
            debug!("Sending with no known subscribers");
        }
        info!("Sending {} bytes to subscribers", payload.len());
        self.session.begin(payload, OutboundTarget::Subscribers);
        Ok(self.session.pump(radio, TRANSFER_CHAR_UUID))
    }

    /// Central role: stream `payload` to a connected peripheral.
    pub fn send_to_peer(
        &mut self,
        radio: &mut dyn RadioStack,
        handle: RadioHandle,
        payload: Vec<u8>,
    ) -> PumpState {
        info!("Sending {} bytes to {}", payload.len(), handle);
        self.session.begin(payload, OutboundTarget::Peer(handle));
        self.session.pump(radio, TRANSFER_CHAR_UUID)
    }

    /// Resume a blocked session from its cursor.
    pub fn on_ready_to_send(&mut self, radio: &mut dyn RadioStack) -> PumpState {
        self.session.pump(radio, TRANSFER_CHAR_UUID)
    }

    /// Drop an outbound session aimed at `handle` (its link went down).
    pub fn abandon_peer(&mut self, handle: &RadioHandle) {
        if self.session.target() == Some(&OutboundTarget::Peer(handle.clone())) {
            warn!("Link to {} lost, dropping outbound transfer", handle);
            self.session.finish();
        }
        if self.central_inbound.remove(handle).is_some_and(|r| r.is_in_progress()) {
            warn!("Link to {} lost mid-payload, dropping partial data", handle);
        }
    }

    /// Central role: ask a connected peripheral for notifications.
    pub fn subscribe(&mut self, radio: &mut dyn RadioStack, handle: &RadioHandle) {
        debug!("Subscribing to {}", handle);
        radio.set_notify(handle, TRANSFER_CHAR_UUID, true);
    }

    /// Peripheral role: a central wrote to us.
    pub fn on_write_received(&mut self, characteristic: Uuid, data: &[u8]) -> Option<Vec<u8>> {
        if characteristic != TRANSFER_CHAR_UUID {
            debug!("Ignoring write to {}", characteristic);
            return None;
        }
        self.session.inbound.process_packet(data)
    }

    /// Central role: the peripheral behind `handle` notified us.
    pub fn on_notification(
        &mut self,
        handle: &RadioHandle,
        characteristic: Uuid,
        data: &[u8],
    ) -> Option<Vec<u8>> {
        if characteristic != TRANSFER_CHAR_UUID {
            debug!("Ignoring notification from {}", characteristic);
            return None;
        }
        self.central_inbound
            .entry(handle.clone())
            .or_default()
            .process_packet(data)
    }

    pub fn on_subscription_changed(&mut self, subscriber: &str, subscribed: bool) {
        if subscribed {
            info!("Central subscribed: {}", subscriber);
            self.subscribers.insert(subscriber.to_string());
        } else {
            info!("Central unsubscribed: {}", subscriber);
            self.subscribers.remove(subscriber);
            if self.subscribers.is_empty() && self.session.inbound.is_in_progress() {
                warn!("Last central left mid-payload, dropping partial write");
                self.session.inbound.reset();
            }
        }
    }
}
