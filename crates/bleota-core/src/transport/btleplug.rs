//! btleplug-based BLE transport.
//!
//! btleplug is async; the transport owns a private tokio runtime and runs
//! every request as a task that reports back through the session's sink.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use tokio::runtime::Runtime;
use tracing::{debug, info, trace, warn};

use super::traits::{BleTransport, Channel, EventSink, GattStatus, TransportError, TransportEvent};
use crate::protocol::constants::{MIN_MTU, SERVICE_UUID};

const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(250);

fn backend(e: btleplug::Error) -> TransportError {
    TransportError::Backend(e.to_string())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// BLE transport backed by the platform stack through btleplug.
pub struct BtleplugTransport {
    runtime: Runtime,
    adapter: Adapter,
    peripheral: Peripheral,
    peer: String,
    /// MTU to report as granted; btleplug cannot negotiate one itself.
    assumed_mtu: Option<u16>,
    characteristics: Arc<Mutex<HashMap<Channel, Characteristic>>>,
    sink: Mutex<Option<EventSink>>,
}

impl BtleplugTransport {
    /// Scan for a peripheral whose local name or address matches `target`.
    pub fn find(target: &str, scan_timeout: Duration) -> Result<Self, TransportError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("ota-ble")
            .enable_all()
            .build()?;

        let (adapter, peripheral, peer) = runtime.block_on(async {
            let manager = Manager::new().await.map_err(backend)?;
            let adapter = manager
                .adapters()
                .await
                .map_err(backend)?
                .into_iter()
                .next()
                .ok_or(TransportError::AdapterNotFound)?;

            info!(device = target, "Scanning for device");
            adapter
                .start_scan(ScanFilter::default())
                .await
                .map_err(backend)?;
            let deadline = Instant::now() + scan_timeout;
            let found = loop {
                if let Some(found) = Self::match_peripheral(&adapter, target).await? {
                    break Some(found);
                }
                if Instant::now() >= deadline {
                    break None;
                }
                tokio::time::sleep(SCAN_POLL_INTERVAL).await;
            };
            let _ = adapter.stop_scan().await;

            let (peripheral, peer) =
                found.ok_or_else(|| TransportError::DeviceNotFound(target.to_string()))?;
            Ok::<_, TransportError>((adapter, peripheral, peer))
        })?;

        info!(peer = %peer, "Device found");
        Ok(Self {
            runtime,
            adapter,
            peripheral,
            peer,
            assumed_mtu: None,
            characteristics: Arc::new(Mutex::new(HashMap::new())),
            sink: Mutex::new(None),
        })
    }

    /// Report `mtu` as granted on MTU requests.
    ///
    /// Most platform stacks negotiate the MTU on their own during connect;
    /// set this when the peer is known to accept it.
    pub fn with_assumed_mtu(mut self, mtu: u16) -> Self {
        self.assumed_mtu = Some(mtu.max(MIN_MTU));
        self
    }

    async fn match_peripheral(
        adapter: &Adapter,
        target: &str,
    ) -> Result<Option<(Peripheral, String)>, TransportError> {
        for peripheral in adapter.peripherals().await.map_err(backend)? {
            let Some(props) = peripheral.properties().await.map_err(backend)? else {
                continue;
            };
            let address = props.address.to_string();
            let name_matches = props.local_name.as_deref() == Some(target);
            if name_matches || address.eq_ignore_ascii_case(target) {
                let peer = match props.local_name {
                    Some(name) => format!("{} ({})", name, address),
                    None => address,
                };
                return Ok(Some((peripheral, peer)));
            }
        }
        Ok(None)
    }

    fn sink(&self) -> Result<EventSink, TransportError> {
        lock(&self.sink).clone().ok_or(TransportError::NotConnected)
    }

    fn characteristic(&self, channel: Channel) -> Result<Characteristic, TransportError> {
        lock(&self.characteristics)
            .get(&channel)
            .cloned()
            .ok_or(TransportError::ChannelUnavailable(channel))
    }

    /// Forward link loss for our peripheral.
    fn watch_disconnect(&self, sink: EventSink) {
        let adapter = self.adapter.clone();
        let id = self.peripheral.id();
        self.runtime.spawn(async move {
            let mut events = match adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    warn!(error = %e, "Cannot watch adapter events");
                    return;
                }
            };
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(gone) = event
                    && gone == id
                {
                    sink.emit(TransportEvent::Disconnected);
                    break;
                }
            }
        });
    }
}

fn gatt_status<E>(result: &Result<(), E>) -> GattStatus {
    match result {
        Ok(()) => GattStatus::SUCCESS,
        Err(_) => GattStatus::FAILURE,
    }
}

/// Forward notifications of the OTA characteristics.
async fn forward_notifications(peripheral: Peripheral, sink: EventSink) {
    let mut stream = match peripheral.notifications().await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, "Cannot open notification stream");
            return;
        }
    };
    while let Some(notification) = stream.next().await {
        let Some(channel) = Channel::from_uuid(notification.uuid) else {
            trace!(uuid = %notification.uuid, "Ignoring foreign notification");
            continue;
        };
        if !sink.emit(TransportEvent::Notification {
            channel,
            data: notification.value,
        }) {
            break;
        }
    }
}

impl BleTransport for BtleplugTransport {
    fn connect(&self, sink: EventSink) -> Result<(), TransportError> {
        *lock(&self.sink) = Some(sink.clone());
        let peripheral = self.peripheral.clone();
        let watcher = sink.clone();
        self.runtime.spawn(async move {
            match peripheral.connect().await {
                Ok(()) => sink.emit(TransportEvent::Connected),
                Err(e) => {
                    warn!(error = %e, "Connect failed");
                    sink.emit(TransportEvent::ConnectionError {
                        status: GattStatus::FAILURE,
                    })
                }
            };
        });
        self.watch_disconnect(watcher);
        Ok(())
    }

    fn request_mtu(&self, mtu: u16) -> Result<(), TransportError> {
        let sink = self.sink()?;
        let event = match self.assumed_mtu {
            Some(assumed) => TransportEvent::MtuChanged {
                mtu: assumed.min(mtu),
                status: GattStatus::SUCCESS,
            },
            None => TransportEvent::MtuChanged {
                mtu: MIN_MTU,
                status: GattStatus::FAILURE,
            },
        };
        sink.emit(event);
        Ok(())
    }

    fn discover_services(&self) -> Result<(), TransportError> {
        let sink = self.sink()?;
        let peripheral = self.peripheral.clone();
        let characteristics = Arc::clone(&self.characteristics);
        self.runtime.spawn(async move {
            if let Err(e) = peripheral.discover_services().await {
                warn!(error = %e, "Service discovery failed");
                sink.emit(TransportEvent::ServicesDiscovered {
                    status: GattStatus::FAILURE,
                    channels: Vec::new(),
                });
                return;
            }

            let mut found = HashMap::new();
            for characteristic in peripheral.characteristics() {
                if characteristic.service_uuid != SERVICE_UUID {
                    continue;
                }
                if let Some(channel) = Channel::from_uuid(characteristic.uuid) {
                    debug!(channel = %channel, uuid = %characteristic.uuid, "Found characteristic");
                    found.insert(channel, characteristic);
                }
            }
            let mut channels: Vec<Channel> = found.keys().copied().collect();
            channels.sort();
            *lock(&characteristics) = found;

            tokio::spawn(forward_notifications(peripheral, sink.clone()));
            sink.emit(TransportEvent::ServicesDiscovered {
                status: GattStatus::SUCCESS,
                channels,
            });
        });
        Ok(())
    }

    fn enable_notification(&self, channel: Channel) -> Result<(), TransportError> {
        let sink = self.sink()?;
        let characteristic = self.characteristic(channel)?;
        let peripheral = self.peripheral.clone();
        self.runtime.spawn(async move {
            let result = peripheral.subscribe(&characteristic).await;
            if let Err(e) = &result {
                warn!(channel = %channel, error = %e, "Subscribe failed");
            }
            sink.emit(TransportEvent::NotificationEnabled {
                channel,
                status: gatt_status(&result),
            });
        });
        Ok(())
    }

    fn write(&self, channel: Channel, data: &[u8]) -> Result<(), TransportError> {
        let sink = self.sink()?;
        let characteristic = self.characteristic(channel)?;
        let peripheral = self.peripheral.clone();
        let data = data.to_vec();
        self.runtime.spawn(async move {
            let result = peripheral
                .write(&characteristic, &data, WriteType::WithResponse)
                .await;
            if let Err(e) = &result {
                warn!(channel = %channel, error = %e, "Write failed");
            }
            sink.emit(TransportEvent::WriteComplete {
                channel,
                status: gatt_status(&result),
            });
        });
        Ok(())
    }

    fn disconnect(&self) {
        *lock(&self.sink) = None;
        lock(&self.characteristics).clear();
        if let Err(e) = self.runtime.block_on(self.peripheral.disconnect()) {
            debug!(error = %e, "Disconnect failed");
        }
    }

    fn peer(&self) -> String {
        self.peer.clone()
    }
}
