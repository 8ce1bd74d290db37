//! Event system for UI decoupling.
//!
//! Allows CLI/GUI front ends to follow an OTA session without coupling to
//! the state machine.

use std::fmt;
use std::sync::Mutex;

use crate::protocol::CommandAckStatus;
use crate::state::OtaState;
use crate::transport::Channel;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Events emitted by the OTA session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtaEvent {
    /// Link established.
    Connected { peer: String },
    /// Link lost.
    Disconnected,
    /// State changed.
    StateChanged { from: OtaState, to: OtaState },
    /// MTU exchange finished; `mtu` is `None` when it failed.
    MtuNegotiated { mtu: Option<u16>, packet_size: usize },
    ServicesDiscovered { channels: Vec<Channel> },
    NotificationEnabled { channel: Channel, success: bool },
    StartAck { status: CommandAckStatus },
    EndAck { status: CommandAckStatus },
    /// Device accepted a sector.
    SectorAcked { index: u16 },
    /// Transfer progress, updated once per accepted sector.
    Progress {
        acked_sectors: usize,
        total_sectors: usize,
        bytes_sent: usize,
        total_bytes: usize,
    },
    /// Notification on the progress or customer channel.
    Notification { channel: Channel, data: Vec<u8> },
    /// BLE write issued or notification received.
    Packet {
        direction: PacketDirection,
        channel: Channel,
        length: usize,
    },
    /// Log message.
    Log { level: LogLevel, message: String },
    /// Fatal error; see `OtaError::code`.
    Error { code: i32, message: String },
    /// Device accepted the image.
    Complete,
}

/// BLE packet direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Tx, // Central -> peripheral
    Rx, // Peripheral -> central
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketDirection::Tx => write!(f, "TX"),
            PacketDirection::Rx => write!(f, "RX"),
        }
    }
}

/// Observer trait for receiving OTA events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait OtaObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &OtaEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl OtaObserver for NullObserver {
    fn on_event(&self, _event: &OtaEvent) {
        // Do nothing
    }
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl OtaObserver for TracingObserver {
    fn on_event(&self, event: &OtaEvent) {
        match event {
            OtaEvent::Connected { peer } => {
                tracing::info!(peer = %peer, "Device connected");
            }
            OtaEvent::Disconnected => {
                tracing::warn!("Device disconnected");
            }
            OtaEvent::StateChanged { from, to } => {
                tracing::info!(from = %from, to = %to, "State changed");
            }
            OtaEvent::MtuNegotiated { mtu, packet_size } => match mtu {
                Some(mtu) => tracing::info!(mtu, packet_size, "MTU negotiated"),
                None => tracing::warn!(packet_size, "MTU negotiation failed, using fallback"),
            },
            OtaEvent::ServicesDiscovered { channels } => {
                tracing::debug!(?channels, "Services discovered");
            }
            OtaEvent::NotificationEnabled { channel, success } => {
                if *success {
                    tracing::debug!(channel = %channel, "Notifications enabled");
                } else {
                    tracing::warn!(channel = %channel, "Failed to enable notifications");
                }
            }
            OtaEvent::StartAck { status } => {
                tracing::info!(status = %status, "START acknowledged");
            }
            OtaEvent::EndAck { status } => {
                tracing::info!(status = %status, "END acknowledged");
            }
            OtaEvent::SectorAcked { index } => {
                tracing::trace!(index, "Sector acknowledged");
            }
            OtaEvent::Progress {
                acked_sectors,
                total_sectors,
                bytes_sent,
                total_bytes,
            } => {
                let pct = if *total_bytes > 0 {
                    (*bytes_sent * 100) / *total_bytes
                } else {
                    100
                };
                tracing::debug!(
                    sectors = %format!("{}/{}", acked_sectors, total_sectors),
                    progress = %format!("{}%", pct),
                    "Progress"
                );
            }
            OtaEvent::Notification { channel, data } => {
                tracing::debug!(channel = %channel, len = data.len(), "Notification");
            }
            OtaEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            OtaEvent::Error { code, message } => {
                tracing::error!(code = code, "Error: {}", message);
            }
            OtaEvent::Packet {
                direction,
                channel,
                length,
            } => {
                tracing::trace!(dir = %direction, channel = %channel, len = length, "BLE Packet");
            }
            OtaEvent::Complete => {
                tracing::info!("Firmware update complete");
            }
        }
    }
}

/// Observer that keeps every event, for tests and post-mortem dumps.
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<OtaEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<OtaEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    /// Recorded events, without per-packet and log noise.
    pub fn milestones(&self) -> Vec<OtaEvent> {
        self.events()
            .into_iter()
            .filter(|e| !matches!(e, OtaEvent::Packet { .. } | OtaEvent::Log { .. }))
            .collect()
    }

    /// States entered, in order.
    pub fn states(&self) -> Vec<OtaState> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                OtaEvent::StateChanged { to, .. } => Some(to),
                _ => None,
            })
            .collect()
    }

    /// Code of the first reported error.
    pub fn error_code(&self) -> Option<i32> {
        self.events().into_iter().find_map(|e| match e {
            OtaEvent::Error { code, .. } => Some(code),
            _ => None,
        })
    }
}

impl OtaObserver for RecordingObserver {
    fn on_event(&self, event: &OtaEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_observer() {
        let observer = RecordingObserver::new();
        observer.on_event(&OtaEvent::StateChanged {
            from: OtaState::Idle,
            to: OtaState::Negotiating,
        });
        observer.on_event(&OtaEvent::Packet {
            direction: PacketDirection::Tx,
            channel: Channel::Command,
            length: 20,
        });
        observer.on_event(&OtaEvent::Error {
            code: 20,
            message: "Device refused start".into(),
        });

        assert_eq!(observer.events().len(), 3);
        assert_eq!(observer.milestones().len(), 2);
        assert_eq!(observer.states(), vec![OtaState::Negotiating]);
        assert_eq!(observer.error_code(), Some(20));
    }

    #[test]
    fn test_direction_display() {
        assert_eq!(PacketDirection::Tx.to_string(), "TX");
        assert_eq!(PacketDirection::Rx.to_string(), "RX");
    }
}
