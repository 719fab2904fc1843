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

//! BlueZ radio backend.
//!
//! D-Bus calls are async while [`RadioStack`] is not, so every call here
//! spawns or feeds a task and the outcome comes back as a [`RadioEvent`].
//! Outbound chunks go through bounded queues: a full queue is a refused
//! push, and the draining task raises `ReadyToSend` once it makes room.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bluer::adv::Advertisement;
use bluer::gatt::local::{
    Application, Characteristic, CharacteristicNotify, CharacteristicNotifyMethod,
    CharacteristicWrite, CharacteristicWriteMethod, CharacteristicWriteRequest, Service,
};
use bluer::gatt::remote::Characteristic as RemoteCharacteristic;
use bluer::{
    Adapter, AdapterEvent, AdapterProperty, Address, Device, DeviceEvent, DeviceProperty,
    DiscoveryFilter, DiscoveryTransport,
};
use futures::{Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::ble_constants::config::NOTIFY_QUEUE_DEPTH;
use super::ble_constants::{SERVICE_UUID, TRANSFER_CHAR_UUID};
use super::radio::{RadioEvent, RadioEventSender, RadioHandle, RadioStack, RadioState, ScanFilter};

type NotificationStream = Pin<Box<dyn Stream<Item = Vec<u8>> + Send>>;

/// Published GATT service. Dropping `stop` unregisters it.
struct Peripheral {
    _stop: oneshot::Sender<()>,
    notify_tx: mpsc::Sender<Vec<u8>>,
}

enum LinkControl {
    SetNotify(bool),
    Disconnect,
}

/// Central-role link to one peripheral.
struct CentralLink {
    task: JoinHandle<()>,
    data_tx: mpsc::Sender<Vec<u8>>,
    control_tx: mpsc::UnboundedSender<LinkControl>,
}

impl CentralLink {
    fn is_alive(&self) -> bool {
        !self.task.is_finished()
    }
}

/// Radio stack on the default BlueZ adapter.
pub struct BluezRadio {
    _session: bluer::Session,
    adapter: Adapter,
    events: RadioEventSender,
    state: Arc<Mutex<RadioState>>,
    scan_task: Option<JoinHandle<()>>,
    peripheral: Option<Peripheral>,
    links: HashMap<RadioHandle, CentralLink>,
    blocked: Arc<AtomicBool>,
    _power_task: JoinHandle<()>,
}

impl BluezRadio {
    /// Open the default adapter, powering it on if needed.
    pub async fn new(events: RadioEventSender) -> Result<Self> {
        let session = bluer::Session::new().await?;
        info!("BlueZ session created");

        let adapter = session.default_adapter().await?;
        info!("Using Bluetooth adapter: {}", adapter.name());

        if !adapter.is_powered().await? {
            info!("Powering on Bluetooth adapter...");
            if let Err(e) = adapter.set_powered(true).await {
                warn!("Could not power on adapter: {}", e);
            }
        }

        let initial = if adapter.is_powered().await? {
            RadioState::PoweredOn
        } else {
            RadioState::PoweredOff
        };
        let state = Arc::new(Mutex::new(initial));
        let power_task = tokio::spawn(watch_power(adapter.clone(), state.clone(), events.clone()));

        Ok(Self {
            _session: session,
            adapter,
            events,
            state,
            scan_task: None,
            peripheral: None,
            links: HashMap::new(),
            blocked: Arc::new(AtomicBool::new(false)),
            _power_task: power_task,
        })
    }

    fn emit(&self, event: RadioEvent) {
        let _ = self.events.send(event);
    }

    fn live_link(&self, handle: &RadioHandle) -> Option<&CentralLink> {
        self.links.get(handle).filter(|link| link.is_alive())
    }

    /// Map a queue send to the accept/refuse answer the engine expects.
    fn accept<T>(&self, result: Result<(), mpsc::error::TrySendError<T>>) -> bool {
        match result {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.blocked.store(true, Ordering::SeqCst);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Outbound queue closed");
                false
            }
        }
    }
}

impl RadioStack for BluezRadio {
    fn state(&self) -> RadioState {
        *self.state.lock()
    }

    fn start_scan(&mut self, filter: &ScanFilter) {
        if self.scan_task.as_ref().is_some_and(|t| !t.is_finished()) {
            return;
        }
        let filter = DiscoveryFilter {
            uuids: filter.service_uuids.iter().copied().collect(),
            duplicate_data: filter.allow_duplicates,
            transport: DiscoveryTransport::Le,
            ..Default::default()
        };
        self.scan_task = Some(tokio::spawn(run_scan(
            self.adapter.clone(),
            filter,
            self.events.clone(),
        )));
    }

    fn stop_scan(&mut self) {
        if let Some(task) = self.scan_task.take() {
            task.abort();
            self.emit(RadioEvent::ScanningChanged(false));
        }
    }

    fn connect(&mut self, handle: &RadioHandle) {
        if self.live_link(handle).is_some() {
            self.emit(RadioEvent::Connected(handle.clone()));
            return;
        }

        let address = match handle.as_str().parse::<Address>() {
            Ok(address) => address,
            Err(e) => {
                self.emit(RadioEvent::ConnectFailed {
                    handle: handle.clone(),
                    cause: format!("invalid address: {}", e),
                });
                return;
            }
        };

        let (data_tx, data_rx) = mpsc::channel(NOTIFY_QUEUE_DEPTH);
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_link(
            self.adapter.clone(),
            address,
            handle.clone(),
            self.events.clone(),
            data_rx,
            control_rx,
            self.blocked.clone(),
        ));
        self.links.insert(
            handle.clone(),
            CentralLink {
                task,
                data_tx,
                control_tx,
            },
        );
    }

    fn disconnect(&mut self, handle: &RadioHandle) {
        match self.links.remove(handle) {
            Some(link) if link.is_alive() => {
                let _ = link.control_tx.send(LinkControl::Disconnect);
            }
            _ => self.emit(RadioEvent::Disconnected {
                handle: handle.clone(),
                cause: None,
            }),
        }
    }

    fn advertise(&mut self, service: Uuid, characteristic: Uuid, announcement: &str) {
        let (stop_tx, stop_rx) = oneshot::channel();
        let (notify_tx, notify_rx) = mpsc::channel(NOTIFY_QUEUE_DEPTH);
        tokio::spawn(run_peripheral(
            self.adapter.clone(),
            service,
            characteristic,
            announcement.to_string(),
            self.events.clone(),
            notify_rx,
            self.blocked.clone(),
            stop_rx,
        ));
        self.peripheral = Some(Peripheral {
            _stop: stop_tx,
            notify_tx,
        });
    }

    fn stop_advertising(&mut self) {
        self.peripheral = None;
    }

    fn push_notification(&mut self, _characteristic: Uuid, data: &[u8]) -> bool {
        let Some(peripheral) = &self.peripheral else {
            return false;
        };
        self.accept(peripheral.notify_tx.try_send(data.to_vec()))
    }

    fn write(&mut self, handle: &RadioHandle, _characteristic: Uuid, data: &[u8]) -> bool {
        let Some(link) = self.live_link(handle) else {
            return false;
        };
        self.accept(link.data_tx.try_send(data.to_vec()))
    }

    fn set_notify(&mut self, handle: &RadioHandle, _characteristic: Uuid, enabled: bool) {
        if let Some(link) = self.live_link(handle) {
            let _ = link.control_tx.send(LinkControl::SetNotify(enabled));
        }
    }
}

async fn watch_power(adapter: Adapter, state: Arc<Mutex<RadioState>>, events: RadioEventSender) {
    let stream = match adapter.events().await {
        Ok(stream) => stream,
        Err(e) => {
            error!("Cannot watch adapter power: {}", e);
            return;
        }
    };
    futures::pin_mut!(stream);
    while let Some(event) = stream.next().await {
        if let AdapterEvent::PropertyChanged(AdapterProperty::Powered(powered)) = event {
            let new_state = if powered {
                RadioState::PoweredOn
            } else {
                RadioState::PoweredOff
            };
            *state.lock() = new_state;
            let _ = events.send(RadioEvent::StateChanged(new_state));
        }
    }
}

async fn run_scan(adapter: Adapter, filter: DiscoveryFilter, events: RadioEventSender) {
    if let Err(e) = adapter.set_discovery_filter(filter).await {
        warn!("Discovery filter rejected: {}", e);
    }
    let stream = match adapter.discover_devices().await {
        Ok(stream) => stream,
        Err(e) => {
            error!("Failed to start discovery: {}", e);
            let _ = events.send(RadioEvent::ScanningChanged(false));
            return;
        }
    };
    let _ = events.send(RadioEvent::ScanningChanged(true));
    futures::pin_mut!(stream);

    while let Some(event) = stream.next().await {
        let AdapterEvent::DeviceAdded(address) = event else {
            continue;
        };
        let Ok(device) = adapter.device(address) else {
            continue;
        };
        let announcement = device.name().await.ok().flatten();
        let connected = device.is_connected().await.unwrap_or(false);
        let _ = events.send(RadioEvent::Discovered {
            handle: RadioHandle::new(address.to_string()),
            announcement,
            connected,
        });
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_peripheral(
    adapter: Adapter,
    service: Uuid,
    characteristic: Uuid,
    announcement: String,
    events: RadioEventSender,
    notify_rx: mpsc::Receiver<Vec<u8>>,
    blocked: Arc<AtomicBool>,
    stop_rx: oneshot::Receiver<()>,
) {
    let notify_rx = Arc::new(tokio::sync::Mutex::new(notify_rx));
    let subscriber_ids = Arc::new(AtomicUsize::new(0));

    let write_events = events.clone();
    let notify_events = events.clone();

    let transfer_char = Characteristic {
        uuid: characteristic,
        write: Some(CharacteristicWrite {
            write: true,
            write_without_response: true,
            method: CharacteristicWriteMethod::Fun(Box::new(
                move |data: Vec<u8>, _req: CharacteristicWriteRequest| {
                    let events = write_events.clone();
                    Box::pin(async move {
                        let _ = events.send(RadioEvent::WriteReceived {
                            characteristic,
                            data,
                        });
                        Ok(())
                    })
                },
            )),
            ..Default::default()
        }),
        notify: Some(CharacteristicNotify {
            notify: true,
            method: CharacteristicNotifyMethod::Fun(Box::new(move |mut notifier| {
                let notify_rx = notify_rx.clone();
                let events = notify_events.clone();
                let blocked = blocked.clone();
                let subscriber = format!(
                    "central-{}",
                    subscriber_ids.fetch_add(1, Ordering::SeqCst) + 1
                );
                Box::pin(async move {
                    let _ = events.send(RadioEvent::SubscriptionChanged {
                        subscriber: subscriber.clone(),
                        subscribed: true,
                    });
                    loop {
                        let data = {
                            let mut rx = notify_rx.lock().await;
                            rx.recv().await
                        };
                        let Some(data) = data else {
                            break;
                        };
                        if let Err(e) = notifier.notify(data).await {
                            warn!("Notification to {} failed: {}", subscriber, e);
                            break;
                        }
                        if blocked.swap(false, Ordering::SeqCst) {
                            let _ = events.send(RadioEvent::ReadyToSend);
                        }
                    }
                    let _ = events.send(RadioEvent::SubscriptionChanged {
                        subscriber,
                        subscribed: false,
                    });
                })
            })),
            ..Default::default()
        }),
        ..Default::default()
    };

    let app = Application {
        services: vec![Service {
            uuid: service,
            primary: true,
            characteristics: vec![transfer_char],
            ..Default::default()
        }],
        ..Default::default()
    };

    let _app_handle = match adapter.serve_gatt_application(app).await {
        Ok(handle) => handle,
        Err(e) => {
            error!("Failed to register GATT service: {}", e);
            let _ = events.send(RadioEvent::AdvertisingChanged(false));
            return;
        }
    };

    let adv = Advertisement {
        service_uuids: vec![service].into_iter().collect(),
        discoverable: Some(true),
        local_name: Some(announcement),
        ..Default::default()
    };
    let _adv_handle = match adapter.advertise(adv).await {
        Ok(handle) => handle,
        Err(e) => {
            error!("Failed to start advertising: {}", e);
            let _ = events.send(RadioEvent::AdvertisingChanged(false));
            return;
        }
    };

    info!("BLE advertising started");
    let _ = events.send(RadioEvent::AdvertisingChanged(true));

    // Resolves when the sender is dropped.
    let _ = stop_rx.await;

    info!("BLE advertising stopped");
    let _ = events.send(RadioEvent::AdvertisingChanged(false));
}

async fn find_transfer_characteristic(device: &Device) -> bluer::Result<Option<RemoteCharacteristic>> {
    for _ in 0..25 {
        if device.is_services_resolved().await? {
            break;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
    for service in device.services().await? {
        if service.uuid().await? != SERVICE_UUID {
            continue;
        }
        for characteristic in service.characteristics().await? {
            if characteristic.uuid().await? == TRANSFER_CHAR_UUID {
                return Ok(Some(characteristic));
            }
        }
    }
    Ok(None)
}

async fn next_notification(stream: &mut Option<NotificationStream>) -> Option<Vec<u8>> {
    match stream.as_mut() {
        Some(stream) => stream.next().await,
        None => futures::future::pending().await,
    }
}

enum LinkStep {
    Write(Vec<u8>),
    Control(LinkControl),
    Notification(Vec<u8>),
    NotificationsEnded,
    Lost,
    Ignore,
}

async fn run_link(
    adapter: Adapter,
    address: Address,
    handle: RadioHandle,
    events: RadioEventSender,
    mut data_rx: mpsc::Receiver<Vec<u8>>,
    mut control_rx: mpsc::UnboundedReceiver<LinkControl>,
    blocked: Arc<AtomicBool>,
) {
    let device = match adapter.device(address) {
        Ok(device) => device,
        Err(e) => {
            let _ = events.send(RadioEvent::ConnectFailed {
                handle,
                cause: e.to_string(),
            });
            return;
        }
    };
    if let Err(e) = device.connect().await {
        let _ = events.send(RadioEvent::ConnectFailed {
            handle,
            cause: e.to_string(),
        });
        return;
    }
    info!("Connected to {}", handle);
    let _ = events.send(RadioEvent::Connected(handle.clone()));

    let device_events = match device.events().await {
        Ok(stream) => Some(stream),
        Err(e) => {
            warn!("Cannot watch {} for link loss: {}", handle, e);
            None
        }
    };
    let mut device_events = device_events.map(|s| Box::pin(s) as Pin<Box<dyn Stream<Item = DeviceEvent> + Send>>);

    let mut characteristic: Option<RemoteCharacteristic> = None;
    let mut notifications: Option<NotificationStream> = None;

    let cause = loop {
        let step = tokio::select! {
            data = data_rx.recv() => match data {
                Some(data) => LinkStep::Write(data),
                None => LinkStep::Control(LinkControl::Disconnect),
            },
            control = control_rx.recv() => match control {
                Some(control) => LinkStep::Control(control),
                None => LinkStep::Control(LinkControl::Disconnect),
            },
            value = next_notification(&mut notifications) => match value {
                Some(value) => LinkStep::Notification(value),
                None => LinkStep::NotificationsEnded,
            },
            event = async {
                match device_events.as_mut() {
                    Some(stream) => stream.next().await,
                    None => futures::future::pending().await,
                }
            } => match event {
                Some(DeviceEvent::PropertyChanged(DeviceProperty::Connected(false))) => LinkStep::Lost,
                _ => LinkStep::Ignore,
            },
        };

        match step {
            LinkStep::Write(data) => {
                if characteristic.is_none() {
                    characteristic = find_transfer_characteristic(&device).await.ok().flatten();
                }
                match &characteristic {
                    Some(ch) => {
                        if let Err(e) = ch.write(&data).await {
                            warn!("Write to {} failed: {}", handle, e);
                        }
                    }
                    None => warn!("{} has no transfer characteristic", handle),
                }
                if blocked.swap(false, Ordering::SeqCst) {
                    let _ = events.send(RadioEvent::ReadyToSend);
                }
            }
            LinkStep::Control(LinkControl::SetNotify(true)) => {
                if characteristic.is_none() {
                    characteristic = find_transfer_characteristic(&device).await.ok().flatten();
                }
                let Some(ch) = &characteristic else {
                    warn!("{} has no transfer characteristic to subscribe to", handle);
                    continue;
                };
                match ch.notify().await {
                    Ok(stream) => {
                        debug!("Subscribed to {}", handle);
                        notifications = Some(Box::pin(stream));
                    }
                    Err(e) => warn!("Subscribe to {} failed: {}", handle, e),
                }
            }
            LinkStep::Control(LinkControl::SetNotify(false)) => notifications = None,
            LinkStep::Control(LinkControl::Disconnect) => {
                if let Err(e) = device.disconnect().await {
                    warn!("Disconnect from {} failed: {}", handle, e);
                }
                break None;
            }
            LinkStep::Notification(data) => {
                let _ = events.send(RadioEvent::NotificationReceived {
                    handle: handle.clone(),
                    characteristic: TRANSFER_CHAR_UUID,
                    data,
                });
            }
            LinkStep::NotificationsEnded => {
                debug!("Notifications from {} ended", handle);
                notifications = None;
            }
            LinkStep::Lost => break Some("link lost".to_string()),
            LinkStep::Ignore => {}
        }
    };

    info!("Disconnected from {}", handle);
    let _ = events.send(RadioEvent::Disconnected { handle, cause });
}
