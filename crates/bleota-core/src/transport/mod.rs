//! Transport layer module.

#[cfg(feature = "ble")]
pub mod btleplug;
pub mod mock;
pub mod sim;
pub mod traits;

#[cfg(feature = "ble")]
pub use self::btleplug::BtleplugTransport;
pub use mock::{MockTransport, TransportRequest};
pub use sim::{SimFault, SimulatedDevice};
pub use traits::{BleTransport, Channel, EventSink, GattStatus, TransportError, TransportEvent};
