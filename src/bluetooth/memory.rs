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

//! In-process radio used by tests and demos.
//!
//! [`MemoryRadio`] records every call and answers through the same event
//! channel a hardware radio would use. A [`MemoryRadioController`] drives it
//! from the outside: inject events, throttle pushes, inspect what was sent.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::radio::{RadioEvent, RadioEventSender, RadioHandle, RadioStack, RadioState, ScanFilter};

/// How the radio answers a connect request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectBehavior {
    /// Emit `Connected` right away.
    Succeed,
    /// Emit `ConnectFailed` with this cause.
    Fail(String),
    /// Emit nothing; the test resolves it.
    Hold,
}

/// Service published by `advertise`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertised {
    pub service: Uuid,
    pub characteristic: Uuid,
    pub announcement: String,
}

struct Inner {
    state: RadioState,
    scanning: bool,
    advertised: Option<Advertised>,
    connect_behavior: ConnectBehavior,
    auto_disconnect: bool,
    /// Remaining pushes/writes before the queue reports full. `None` = unlimited.
    credit: Option<usize>,
    blocked: bool,
    pushed: Vec<Vec<u8>>,
    writes: Vec<(RadioHandle, Vec<u8>)>,
    connect_calls: Vec<RadioHandle>,
    disconnect_calls: Vec<RadioHandle>,
    notify_calls: Vec<(RadioHandle, bool)>,
    rejected: usize,
}

impl Inner {
    fn take_credit(&mut self) -> bool {
        match self.credit {
            Some(0) => {
                self.blocked = true;
                self.rejected += 1;
                false
            }
            Some(ref mut n) => {
                *n -= 1;
                true
            }
            None => true,
        }
    }
}

/// Radio stack backed by memory.
pub struct MemoryRadio {
    inner: Arc<Mutex<Inner>>,
    events: RadioEventSender,
}

/// Test-side control of a [`MemoryRadio`].
#[derive(Clone)]
pub struct MemoryRadioController {
    inner: Arc<Mutex<Inner>>,
    events: RadioEventSender,
}

impl MemoryRadio {
    /// Create a powered-on radio that reports through `events`.
    pub fn new(events: RadioEventSender) -> (Self, MemoryRadioController) {
        let inner = Arc::new(Mutex::new(Inner {
            state: RadioState::PoweredOn,
            scanning: false,
            advertised: None,
            connect_behavior: ConnectBehavior::Succeed,
            auto_disconnect: true,
            credit: None,
            blocked: false,
            pushed: Vec::new(),
            writes: Vec::new(),
            connect_calls: Vec::new(),
            disconnect_calls: Vec::new(),
            notify_calls: Vec::new(),
            rejected: 0,
        }));
        let controller = MemoryRadioController {
            inner: inner.clone(),
            events: events.clone(),
        };
        (Self { inner, events }, controller)
    }

    fn emit(&self, event: RadioEvent) {
        let _ = self.events.send(event);
    }
}

impl RadioStack for MemoryRadio {
    fn state(&self) -> RadioState {
        self.inner.lock().state
    }

    fn start_scan(&mut self, _filter: &ScanFilter) {
        let mut inner = self.inner.lock();
        if !inner.state.is_ready() || inner.scanning {
            return;
        }
        inner.scanning = true;
        drop(inner);
        self.emit(RadioEvent::ScanningChanged(true));
    }

    fn stop_scan(&mut self) {
        let was_scanning = std::mem::replace(&mut self.inner.lock().scanning, false);
        if was_scanning {
            self.emit(RadioEvent::ScanningChanged(false));
        }
    }

    fn connect(&mut self, handle: &RadioHandle) {
        let behavior = {
            let mut inner = self.inner.lock();
            inner.connect_calls.push(handle.clone());
            inner.connect_behavior.clone()
        };
        debug!("Memory radio connect {} -> {:?}", handle, behavior);
        match behavior {
            ConnectBehavior::Succeed => self.emit(RadioEvent::Connected(handle.clone())),
            ConnectBehavior::Fail(cause) => self.emit(RadioEvent::ConnectFailed {
                handle: handle.clone(),
                cause,
            }),
            ConnectBehavior::Hold => {}
        }
    }

    fn disconnect(&mut self, handle: &RadioHandle) {
        let auto = {
            let mut inner = self.inner.lock();
            inner.disconnect_calls.push(handle.clone());
            inner.auto_disconnect
        };
        if auto {
            self.emit(RadioEvent::Disconnected {
                handle: handle.clone(),
                cause: None,
            });
        }
    }

    fn advertise(&mut self, service: Uuid, characteristic: Uuid, announcement: &str) {
        self.inner.lock().advertised = Some(Advertised {
            service,
            characteristic,
            announcement: announcement.to_string(),
        });
        self.emit(RadioEvent::AdvertisingChanged(true));
    }

    fn stop_advertising(&mut self) {
        if self.inner.lock().advertised.take().is_some() {
            self.emit(RadioEvent::AdvertisingChanged(false));
        }
    }

    fn push_notification(&mut self, _characteristic: Uuid, data: &[u8]) -> bool {
        let mut inner = self.inner.lock();
        if !inner.take_credit() {
            return false;
        }
        inner.pushed.push(data.to_vec());
        true
    }

    fn write(&mut self, handle: &RadioHandle, _characteristic: Uuid, data: &[u8]) -> bool {
        let mut inner = self.inner.lock();
        if !inner.take_credit() {
            return false;
        }
        inner.writes.push((handle.clone(), data.to_vec()));
        true
    }

    fn set_notify(&mut self, handle: &RadioHandle, _characteristic: Uuid, enabled: bool) {
        self.inner
            .lock()
            .notify_calls
            .push((handle.clone(), enabled));
    }
}

impl MemoryRadioController {
    /// Deliver an event as if the radio raised it.
    pub fn emit(&self, event: RadioEvent) {
        let _ = self.events.send(event);
    }

    /// Change the power state and report it.
    pub fn set_state(&self, state: RadioState) {
        {
            let mut inner = self.inner.lock();
            inner.state = state;
            if !state.is_ready() {
                inner.scanning = false;
            }
        }
        self.emit(RadioEvent::StateChanged(state));
    }

    pub fn set_connect_behavior(&self, behavior: ConnectBehavior) {
        self.inner.lock().connect_behavior = behavior;
    }

    /// When false, disconnect requests wait for an injected `Disconnected`.
    pub fn set_auto_disconnect(&self, auto: bool) {
        self.inner.lock().auto_disconnect = auto;
    }

    /// Accept only `credit` more pushes/writes; `None` lifts the limit.
    pub fn limit_pushes(&self, credit: Option<usize>) {
        self.inner.lock().credit = credit;
    }

    /// Allow `n` more pushes and signal readiness if a push was rejected.
    pub fn grant(&self, n: usize) {
        let was_blocked = {
            let mut inner = self.inner.lock();
            inner.credit = Some(inner.credit.unwrap_or(0) + n);
            std::mem::replace(&mut inner.blocked, false)
        };
        if was_blocked {
            self.emit(RadioEvent::ReadyToSend);
        }
    }

    pub fn pushed(&self) -> Vec<Vec<u8>> {
        self.inner.lock().pushed.clone()
    }

    pub fn take_pushed(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.inner.lock().pushed)
    }

    pub fn writes(&self) -> Vec<(RadioHandle, Vec<u8>)> {
        self.inner.lock().writes.clone()
    }

    pub fn take_writes(&self) -> Vec<(RadioHandle, Vec<u8>)> {
        std::mem::take(&mut self.inner.lock().writes)
    }

    /// Number of pushes/writes refused so far.
    pub fn rejected(&self) -> usize {
        self.inner.lock().rejected
    }

    pub fn connect_calls(&self) -> Vec<RadioHandle> {
        self.inner.lock().connect_calls.clone()
    }

    pub fn disconnect_calls(&self) -> Vec<RadioHandle> {
        self.inner.lock().disconnect_calls.clone()
    }

    pub fn notify_calls(&self) -> Vec<(RadioHandle, bool)> {
        self.inner.lock().notify_calls.clone()
    }

    pub fn is_scanning(&self) -> bool {
        self.inner.lock().scanning
    }

    pub fn advertised(&self) -> Option<Advertised> {
        self.inner.lock().advertised.clone()
    }
}
