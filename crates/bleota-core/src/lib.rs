//! BLEOTA-Core: BLE over-the-air firmware update client in Rust.
//!
//! This crate implements the central side of a sector-based OTA protocol:
//! the image is split into 4096-byte sectors, each sector into MTU-sized
//! blocks, and the device acknowledges every sector before the next one is
//! sent. START/END commands frame the transfer on a separate channel.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Constants, CRC16, command and sector ACK frames
//! - **Payload**: Firmware image and packetizer
//! - **Transport**: BLE abstraction (btleplug, simulated device, mock)
//! - **State**: State machine and event handlers
//! - **Events**: Observer pattern for UI decoupling
//! - **Session**: High-level orchestrator
//!
//! # Example
//!
//! ```no_run
//! use bleota_core::{FirmwareImage, OtaConfig, OtaSession, SimulatedDevice};
//!
//! let image = FirmwareImage::from_file("firmware.bin").expect("read image");
//! let device = SimulatedDevice::new("sim");
//!
//! let mut session = OtaSession::new(OtaConfig::default(), device, image);
//! session.run().expect("OTA failed");
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod payload;
pub mod protocol;
pub mod session;
pub mod state;
pub mod transport;

// Re-exports for convenience
pub use config::{ConfigError, OtaConfig};
pub use error::OtaError;
pub use events::{
    LogLevel, NullObserver, OtaEvent, OtaObserver, PacketDirection, RecordingObserver,
    TracingObserver,
};
pub use payload::{FirmwareImage, PacketQueue, Packetizer, packetize};
pub use protocol::{CommandPacket, SectorAck, crc16};
pub use session::{OtaSession, SessionOutcome, SessionResult, StopHandle};
pub use state::OtaState;
#[cfg(feature = "ble")]
pub use transport::BtleplugTransport;
pub use transport::{
    BleTransport, Channel, MockTransport, SimFault, SimulatedDevice, TransportError,
    TransportEvent,
};
