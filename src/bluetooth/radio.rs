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

//! Local radio stack capability consumed by the link layer.
//!
//! A radio is driven through [`RadioStack`] calls and reports back through a
//! single stream of [`RadioEvent`]s. Calls never block on the air: completion
//! of connect, disconnect and advertise arrives later as an event.

use std::fmt;

use tokio::sync::mpsc;
use uuid::Uuid;

/// Opaque radio-assigned reference to a remote device.
///
/// May change across scan sessions for the same logical peer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RadioHandle(pub String);

impl RadioHandle {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RadioHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Power/authorization state of the local radio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioState {
    Unknown,
    Resetting,
    Unsupported,
    Unauthorized,
    PoweredOff,
    PoweredOn,
}

impl RadioState {
    pub fn is_ready(&self) -> bool {
        matches!(self, RadioState::PoweredOn)
    }
}

/// Which announcements a scan reports.
#[derive(Debug, Clone, Default)]
pub struct ScanFilter {
    /// Only report devices advertising one of these services (empty = all).
    pub service_uuids: Vec<Uuid>,
    /// Report every advertisement instead of one per device.
    pub allow_duplicates: bool,
}

/// Events delivered by the radio, serialized on one channel.
#[derive(Debug, Clone, PartialEq)]
pub enum RadioEvent {
    /// Radio power/authorization state changed.
    StateChanged(RadioState),
    /// Scanning started or stopped.
    ScanningChanged(bool),
    /// A device announcement was seen.
    Discovered {
        handle: RadioHandle,
        announcement: Option<String>,
        connected: bool,
    },
    /// A requested connection completed.
    Connected(RadioHandle),
    /// A requested connection failed.
    ConnectFailed { handle: RadioHandle, cause: String },
    /// A link went down, requested or not.
    Disconnected {
        handle: RadioHandle,
        cause: Option<String>,
    },
    /// Advertising started or stopped.
    AdvertisingChanged(bool),
    /// The notify queue drained after a rejected push.
    ReadyToSend,
    /// A central wrote to our characteristic.
    WriteReceived { characteristic: Uuid, data: Vec<u8> },
    /// A peripheral we subscribed to sent a notification.
    NotificationReceived {
        handle: RadioHandle,
        characteristic: Uuid,
        data: Vec<u8>,
    },
    /// A central subscribed to or unsubscribed from our characteristic.
    SubscriptionChanged { subscriber: String, subscribed: bool },
}

/// Sender half given to radio implementations.
pub type RadioEventSender = mpsc::UnboundedSender<RadioEvent>;

/// Receiver half consumed by the link manager.
pub type RadioEventReceiver = mpsc::UnboundedReceiver<RadioEvent>;

/// Create the event channel shared by a radio and its manager.
pub fn event_channel() -> (RadioEventSender, RadioEventReceiver) {
    mpsc::unbounded_channel()
}

/// Local radio capability.
///
/// All calls are made from the manager's execution context and must return
/// promptly. Results are reported through [`RadioEvent`]s except for
/// [`push_notification`](RadioStack::push_notification) and
/// [`write`](RadioStack::write), which report acceptance synchronously.
pub trait RadioStack: Send {
    /// Current power/authorization state.
    fn state(&self) -> RadioState;

    fn start_scan(&mut self, filter: &ScanFilter);

    fn stop_scan(&mut self);

    fn connect(&mut self, handle: &RadioHandle);

    fn disconnect(&mut self, handle: &RadioHandle);

    /// Publish one service with one notify + write characteristic and
    /// advertise `announcement` as the local name.
    fn advertise(&mut self, service: Uuid, characteristic: Uuid, announcement: &str);

    fn stop_advertising(&mut self);

    /// Push a notification to subscribed centrals.
    ///
    /// Returns `false` when the outbound queue is full; a
    /// [`RadioEvent::ReadyToSend`] follows once it drains.
    fn push_notification(&mut self, characteristic: Uuid, data: &[u8]) -> bool;

    /// Write to a connected peripheral's characteristic, same acceptance
    /// contract as [`push_notification`](RadioStack::push_notification).
    fn write(&mut self, handle: &RadioHandle, characteristic: Uuid, data: &[u8]) -> bool;

    /// Enable or disable notifications from a connected peripheral.
    fn set_notify(&mut self, handle: &RadioHandle, characteristic: Uuid, enabled: bool);
}
