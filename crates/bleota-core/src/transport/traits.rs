//! BLE transport abstraction.
//!
//! Defines the `BleTransport` trait the session drives. Requests return as
//! soon as they are queued; their completion comes back later as a
//! [`TransportEvent`] through the [`EventSink`] handed over on `connect`.

use std::fmt;
use std::sync::mpsc::{self, Receiver, Sender};

use thiserror::Error;
use uuid::Uuid;

use crate::protocol::constants::*;
use crate::session::SessionEvent;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("No Bluetooth adapter available")]
    AdapterNotFound,

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Device disconnected")]
    Disconnected,

    #[error("Channel {0} not available")]
    ChannelUnavailable(Channel),

    #[error("Request rejected: {0}")]
    RequestRejected(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The four GATT characteristics of the OTA service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    /// Firmware packets out, sector ACKs in.
    RecvFirmware,
    Progress,
    /// START/END out, command ACKs in.
    Command,
    /// Vendor extension channel.
    Customer,
}

impl Channel {
    /// Notification enable order.
    pub const ALL: [Channel; 4] = [
        Channel::RecvFirmware,
        Channel::Progress,
        Channel::Command,
        Channel::Customer,
    ];

    pub fn uuid(self) -> Uuid {
        match self {
            Channel::RecvFirmware => CHAR_RECV_FW_UUID,
            Channel::Progress => CHAR_PROGRESS_UUID,
            Channel::Command => CHAR_COMMAND_UUID,
            Channel::Customer => CHAR_CUSTOMER_UUID,
        }
    }

    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.uuid() == uuid)
    }

    /// Channel after this one in notification enable order.
    pub fn next(self) -> Option<Self> {
        match self {
            Channel::RecvFirmware => Some(Channel::Progress),
            Channel::Progress => Some(Channel::Command),
            Channel::Command => Some(Channel::Customer),
            Channel::Customer => None,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::RecvFirmware => write!(f, "recv-fw"),
            Channel::Progress => write!(f, "progress"),
            Channel::Command => write!(f, "command"),
            Channel::Customer => write!(f, "customer"),
        }
    }
}

/// GATT operation status, 0 is success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GattStatus(pub u16);

impl GattStatus {
    pub const SUCCESS: GattStatus = GattStatus(0);
    /// Generic failure (GATT_FAILURE).
    pub const FAILURE: GattStatus = GattStatus(0x0101);

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }
}

impl fmt::Display for GattStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

/// Completions and notifications reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    ConnectionError { status: GattStatus },
    MtuChanged { mtu: u16, status: GattStatus },
    ServicesDiscovered {
        status: GattStatus,
        channels: Vec<Channel>,
    },
    NotificationEnabled { channel: Channel, status: GattStatus },
    WriteComplete { channel: Channel, status: GattStatus },
    Notification { channel: Channel, data: Vec<u8> },
}

/// Where a transport delivers its events.
///
/// All events funnel into the session's single event queue.
#[derive(Debug, Clone)]
pub struct EventSink {
    sender: Sender<SessionEvent>,
}

impl EventSink {
    pub(crate) fn new(sender: Sender<SessionEvent>) -> Self {
        Self { sender }
    }

    /// Detached sink and the receiving end, for driving a transport by hand.
    pub fn channel() -> (Self, Receiver<SessionEvent>) {
        let (sender, receiver) = mpsc::channel();
        (Self { sender }, receiver)
    }

    /// Queue an event. Returns `false` once the session is gone.
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.sender.send(SessionEvent::Transport(event)).is_ok()
    }
}

/// Abstract BLE transport interface.
///
/// Implementations must deliver every completion through the sink, in
/// order, and must not call back into the session.
pub trait BleTransport: Send + Sync {
    /// Start connecting; answers with `Connected` or `ConnectionError`.
    fn connect(&self, sink: EventSink) -> Result<(), TransportError>;

    /// Ask for a larger MTU; answers with `MtuChanged`.
    fn request_mtu(&self, mtu: u16) -> Result<(), TransportError>;

    /// Answers with `ServicesDiscovered`.
    fn discover_services(&self) -> Result<(), TransportError>;

    /// Answers with `NotificationEnabled`.
    fn enable_notification(&self, channel: Channel) -> Result<(), TransportError>;

    /// Answers with `WriteComplete`.
    fn write(&self, channel: Channel, data: &[u8]) -> Result<(), TransportError>;

    /// Drop the link. No event is expected.
    fn disconnect(&self);

    /// Peer name or address for display.
    fn peer(&self) -> String;
}
