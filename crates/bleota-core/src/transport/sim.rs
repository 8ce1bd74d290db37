//! In-process simulated OTA device.
//!
//! Plays the device side of the protocol over the [`BleTransport`] trait:
//! answers link setup, acknowledges writes, reassembles sectors, checks
//! their CRC and replies with sector and command ACKs. Faults can be
//! injected to exercise every failure path of the session without radio
//! hardware.

use std::str::FromStr;
use std::sync::{Arc, Mutex};

use byteorder::{ByteOrder, LittleEndian};
use tracing::{debug, trace, warn};

use super::traits::{BleTransport, Channel, EventSink, GattStatus, TransportError, TransportEvent};
use crate::payload::FirmwarePacket;
use crate::protocol::constants::*;
use crate::protocol::crc::crc16;
use crate::protocol::{CommandPacket, SectorAck, SectorAckStatus};

/// Misbehaviour to inject into the simulated device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimFault {
    ConnectError,
    RejectMtu,
    DiscoveryFailure,
    MissingChannel(Channel),
    NotificationFailure(Channel),
    RefuseStart,
    /// Never answer START.
    IgnoreStart,
    RefuseEnd,
    ChecksumError { sector: u16 },
    SectorIndexError { sector: u16 },
    PayloadLengthError { sector: u16 },
    UnknownStatus { sector: u16 },
    /// ACK the sector with the wrong index.
    WrongAckIndex { sector: u16 },
    /// Drop the link after this many sectors were acknowledged.
    DisconnectAfter { sectors: u16 },
}

impl FromStr for SimFault {
    type Err = String;

    /// Parse `name` or `name:arg`, e.g. `refuse-start`, `checksum:1`,
    /// `missing-channel:command`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, arg) = match s.split_once(':') {
            Some((name, arg)) => (name, Some(arg)),
            None => (s, None),
        };
        let number = || -> Result<u16, String> {
            arg.ok_or_else(|| format!("fault '{name}' needs a number, e.g. {name}:1"))?
                .parse::<u16>()
                .map_err(|e| format!("fault '{name}': {e}"))
        };
        let channel = || -> Result<Channel, String> {
            match arg {
                Some("recv-fw") => Ok(Channel::RecvFirmware),
                Some("progress") => Ok(Channel::Progress),
                Some("command") => Ok(Channel::Command),
                Some("customer") => Ok(Channel::Customer),
                _ => Err(format!(
                    "fault '{name}' needs a channel: recv-fw, progress, command or customer"
                )),
            }
        };

        match name {
            "connect-error" => Ok(SimFault::ConnectError),
            "reject-mtu" => Ok(SimFault::RejectMtu),
            "discovery-failure" => Ok(SimFault::DiscoveryFailure),
            "missing-channel" => Ok(SimFault::MissingChannel(channel()?)),
            "notify-failure" => Ok(SimFault::NotificationFailure(channel()?)),
            "refuse-start" => Ok(SimFault::RefuseStart),
            "ignore-start" => Ok(SimFault::IgnoreStart),
            "refuse-end" => Ok(SimFault::RefuseEnd),
            "checksum" => Ok(SimFault::ChecksumError { sector: number()? }),
            "sector-index" => Ok(SimFault::SectorIndexError { sector: number()? }),
            "payload-length" => Ok(SimFault::PayloadLengthError { sector: number()? }),
            "unknown-status" => Ok(SimFault::UnknownStatus { sector: number()? }),
            "wrong-index" => Ok(SimFault::WrongAckIndex { sector: number()? }),
            "disconnect-after" => Ok(SimFault::DisconnectAfter { sectors: number()? }),
            other => Err(format!("unknown fault '{other}'")),
        }
    }
}

#[derive(Debug, Default)]
struct SimState {
    sink: Option<EventSink>,
    connected: bool,
    mtu: u16,
    notifying: Vec<Channel>,
    expected_len: Option<u32>,
    next_sector: u16,
    sector_buf: Vec<u8>,
    received: Vec<u8>,
    acked_sectors: u16,
    finished: bool,
}

impl SimState {
    fn emit(&self, event: TransportEvent) {
        if let Some(sink) = &self.sink {
            sink.emit(event);
        }
    }

    /// Notifications only reach the host once enabled for the channel.
    fn notify(&self, channel: Channel, data: Vec<u8>) {
        if self.notifying.contains(&channel) {
            self.emit(TransportEvent::Notification { channel, data });
        } else {
            warn!(%channel, "Simulated device: notification dropped, not enabled");
        }
    }
}

/// Simulated OTA device. Clones share state.
#[derive(Debug, Clone)]
pub struct SimulatedDevice {
    name: String,
    max_mtu: u16,
    sector_size: usize,
    faults: Vec<SimFault>,
    state: Arc<Mutex<SimState>>,
}

impl SimulatedDevice {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            max_mtu: MTU_REQUEST,
            sector_size: SECTOR_SIZE,
            faults: Vec::new(),
            state: Arc::new(Mutex::new(SimState::default())),
        }
    }

    pub fn with_fault(mut self, fault: SimFault) -> Self {
        self.faults.push(fault);
        self
    }

    pub fn with_faults(mut self, faults: impl IntoIterator<Item = SimFault>) -> Self {
        self.faults.extend(faults);
        self
    }

    /// Largest MTU the device grants.
    pub fn with_max_mtu(mut self, mtu: u16) -> Self {
        self.max_mtu = mtu;
        self
    }

    pub fn with_sector_size(mut self, sector_size: usize) -> Self {
        self.sector_size = sector_size;
        self
    }

    /// Firmware accepted so far (successfully acknowledged sectors).
    pub fn received_image(&self) -> Vec<u8> {
        self.state.lock().unwrap().received.clone()
    }

    pub fn acked_sectors(&self) -> u16 {
        self.state.lock().unwrap().acked_sectors
    }

    /// END was accepted.
    pub fn is_finished(&self) -> bool {
        self.state.lock().unwrap().finished
    }

    pub fn negotiated_mtu(&self) -> u16 {
        self.state.lock().unwrap().mtu
    }

    pub fn notifying(&self) -> Vec<Channel> {
        self.state.lock().unwrap().notifying.clone()
    }

    fn has(&self, fault: SimFault) -> bool {
        self.faults.contains(&fault)
    }

    fn on_command(&self, state: &mut SimState, data: &[u8]) {
        let packet = match CommandPacket::decode(data, true) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "Simulated device: bad command frame");
                return;
            }
        };

        match packet.id {
            COMMAND_ID_START => {
                let len = LittleEndian::read_u32(&packet.payload[..4]);
                debug!(len, "Simulated device: START");
                state.expected_len = Some(len);
                state.next_sector = 0;
                state.sector_buf.clear();
                state.received.clear();
                state.acked_sectors = 0;
                state.finished = false;
                if self.has(SimFault::IgnoreStart) {
                    return;
                }
                let status = if self.has(SimFault::RefuseStart) {
                    COMMAND_ACK_REFUSE
                } else {
                    COMMAND_ACK_ACCEPT
                };
                let ack = CommandPacket::ack(COMMAND_ID_START, status).encode();
                state.notify(Channel::Command, ack.to_vec());
            }
            COMMAND_ID_END => {
                let complete = state.expected_len == Some(state.received.len() as u32);
                debug!(complete, received = state.received.len(), "Simulated device: END");
                let status = if complete && !self.has(SimFault::RefuseEnd) {
                    state.finished = true;
                    COMMAND_ACK_ACCEPT
                } else {
                    COMMAND_ACK_REFUSE
                };
                let ack = CommandPacket::ack(COMMAND_ID_END, status).encode();
                state.notify(Channel::Command, ack.to_vec());
            }
            other => warn!(id = other, "Simulated device: unexpected command"),
        }
    }

    fn on_firmware(&self, state: &mut SimState, data: &[u8]) {
        let Some(expected_len) = state.expected_len else {
            warn!("Simulated device: firmware before START");
            return;
        };
        let packet = match FirmwarePacket::from_bytes(data) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "Simulated device: bad firmware packet");
                return;
            }
        };
        trace!(?packet, "Simulated device: firmware packet");
        state.sector_buf.extend_from_slice(packet.payload());
        if !packet.is_last_block() {
            return;
        }

        let sector = packet.sector_index();
        let offset = usize::from(state.next_sector) * self.sector_size;
        let expected_size = (expected_len as usize)
            .saturating_sub(offset)
            .min(self.sector_size);

        let status = if self.has(SimFault::ChecksumError { sector }) {
            SectorAckStatus::CrcError
        } else if self.has(SimFault::SectorIndexError { sector }) || sector != state.next_sector {
            SectorAckStatus::SectorIndexError {
                expected: state.next_sector,
            }
        } else if self.has(SimFault::PayloadLengthError { sector })
            || state.sector_buf.len() != expected_size
        {
            SectorAckStatus::PayloadLengthError
        } else if self.has(SimFault::UnknownStatus { sector }) {
            SectorAckStatus::Unknown(0x00AA)
        } else if packet.sector_crc() != Some(crc16(&state.sector_buf)) {
            SectorAckStatus::CrcError
        } else {
            SectorAckStatus::Success
        };

        if status == SectorAckStatus::Success {
            let buf = std::mem::take(&mut state.sector_buf);
            state.received.extend_from_slice(&buf);
            state.next_sector = state.next_sector.wrapping_add(1);
            state.acked_sectors += 1;
        } else {
            state.sector_buf.clear();
        }

        let index = if self.has(SimFault::WrongAckIndex { sector }) {
            sector.wrapping_add(1)
        } else {
            sector
        };
        debug!(sector, %status, "Simulated device: sector complete");
        state.notify(Channel::RecvFirmware, SectorAck::new(index, status).to_bytes());
    }
}

impl BleTransport for SimulatedDevice {
    fn connect(&self, sink: EventSink) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        *state = SimState {
            sink: Some(sink),
            ..SimState::default()
        };
        if self.has(SimFault::ConnectError) {
            state.emit(TransportEvent::ConnectionError {
                status: GattStatus(133),
            });
        } else {
            state.connected = true;
            state.mtu = MIN_MTU;
            state.emit(TransportEvent::Connected);
        }
        Ok(())
    }

    fn request_mtu(&self, mtu: u16) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        if self.has(SimFault::RejectMtu) {
            state.emit(TransportEvent::MtuChanged {
                mtu: state.mtu,
                status: GattStatus::FAILURE,
            });
        } else {
            state.mtu = mtu.min(self.max_mtu).max(MIN_MTU);
            state.emit(TransportEvent::MtuChanged {
                mtu: state.mtu,
                status: GattStatus::SUCCESS,
            });
        }
        Ok(())
    }

    fn discover_services(&self) -> Result<(), TransportError> {
        let state = self.state.lock().unwrap();
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        if self.has(SimFault::DiscoveryFailure) {
            state.emit(TransportEvent::ServicesDiscovered {
                status: GattStatus::FAILURE,
                channels: Vec::new(),
            });
        } else {
            let channels = Channel::ALL
                .into_iter()
                .filter(|c| !self.has(SimFault::MissingChannel(*c)))
                .collect();
            state.emit(TransportEvent::ServicesDiscovered {
                status: GattStatus::SUCCESS,
                channels,
            });
        }
        Ok(())
    }

    fn enable_notification(&self, channel: Channel) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        let status = if self.has(SimFault::NotificationFailure(channel)) {
            GattStatus::FAILURE
        } else {
            if !state.notifying.contains(&channel) {
                state.notifying.push(channel);
            }
            GattStatus::SUCCESS
        };
        state.emit(TransportEvent::NotificationEnabled { channel, status });
        Ok(())
    }

    fn write(&self, channel: Channel, data: &[u8]) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap();
        if !state.connected {
            return Err(TransportError::NotConnected);
        }
        let payload_limit = usize::from(state.mtu) - ATT_HEADER_SIZE;
        if data.len() > payload_limit {
            state.emit(TransportEvent::WriteComplete {
                channel,
                status: GattStatus::FAILURE,
            });
            return Ok(());
        }

        state.emit(TransportEvent::WriteComplete {
            channel,
            status: GattStatus::SUCCESS,
        });
        match channel {
            Channel::Command => self.on_command(&mut state, data),
            Channel::RecvFirmware => {
                let acked = state.acked_sectors;
                self.on_firmware(&mut state, data);
                if state.acked_sectors != acked
                    && self.has(SimFault::DisconnectAfter {
                        sectors: state.acked_sectors,
                    })
                {
                    state.connected = false;
                    state.emit(TransportEvent::Disconnected);
                }
            }
            Channel::Progress | Channel::Customer => {}
        }
        Ok(())
    }

    fn disconnect(&self) {
        let mut state = self.state.lock().unwrap();
        state.connected = false;
        state.sink = None;
    }

    fn peer(&self) -> String {
        self.name.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionEvent;
    use std::sync::mpsc::Receiver;

    fn drain(rx: &Receiver<SessionEvent>) -> Vec<TransportEvent> {
        rx.try_iter()
            .filter_map(|e| match e {
                SessionEvent::Transport(t) => Some(t),
                _ => None,
            })
            .collect()
    }

    fn connected(device: &SimulatedDevice) -> Receiver<SessionEvent> {
        let (sink, rx) = EventSink::channel();
        device.connect(sink).unwrap();
        device.request_mtu(MTU_REQUEST).unwrap();
        for channel in Channel::ALL {
            device.enable_notification(channel).unwrap();
        }
        drain(&rx);
        rx
    }

    #[test]
    fn test_fault_parsing() {
        assert_eq!("refuse-start".parse(), Ok(SimFault::RefuseStart));
        assert_eq!(
            "checksum:3".parse(),
            Ok(SimFault::ChecksumError { sector: 3 })
        );
        assert_eq!(
            "missing-channel:customer".parse(),
            Ok(SimFault::MissingChannel(Channel::Customer))
        );
        assert!("checksum".parse::<SimFault>().is_err());
        assert!("missing-channel:foo".parse::<SimFault>().is_err());
        assert!("melt".parse::<SimFault>().is_err());
    }

    #[test]
    fn test_link_setup_replies() {
        let device =
            SimulatedDevice::new("sim").with_fault(SimFault::MissingChannel(Channel::Progress));
        let (sink, rx) = EventSink::channel();
        device.connect(sink).unwrap();
        device.request_mtu(517).unwrap();
        device.discover_services().unwrap();

        let events = drain(&rx);
        assert_eq!(events[0], TransportEvent::Connected);
        assert_eq!(
            events[1],
            TransportEvent::MtuChanged {
                mtu: 517,
                status: GattStatus::SUCCESS
            }
        );
        assert_eq!(
            events[2],
            TransportEvent::ServicesDiscovered {
                status: GattStatus::SUCCESS,
                channels: vec![Channel::RecvFirmware, Channel::Command, Channel::Customer],
            }
        );
    }

    #[test]
    fn test_sector_roundtrip() {
        let device = SimulatedDevice::new("sim");
        let rx = connected(&device);
        let image = vec![0x5Au8; 100];

        device
            .write(Channel::Command, &CommandPacket::start(100).encode())
            .unwrap();
        let events = drain(&rx);
        assert_eq!(events.len(), 2);
        let TransportEvent::Notification { data, .. } = &events[1] else {
            panic!("expected start ack, got {:?}", events[1]);
        };
        let ack = CommandPacket::decode(data, true).unwrap().as_ack().unwrap();
        assert_eq!(ack.command_id, COMMAND_ID_START);

        let queue = crate::payload::packetize(&image, 60).unwrap();
        for packet in queue.packets() {
            device.write(Channel::RecvFirmware, packet.as_bytes()).unwrap();
        }
        let events = drain(&rx);
        let TransportEvent::Notification { channel, data } = events.last().unwrap() else {
            panic!("expected sector ack");
        };
        assert_eq!(*channel, Channel::RecvFirmware);
        assert_eq!(
            SectorAck::from_bytes(data).unwrap(),
            SectorAck::new(0, SectorAckStatus::Success)
        );
        assert_eq!(device.received_image(), image);
    }

    #[test]
    fn test_corrupted_crc_detected() {
        let device = SimulatedDevice::new("sim");
        let rx = connected(&device);
        device
            .write(Channel::Command, &CommandPacket::start(10).encode())
            .unwrap();
        drain(&rx);

        // terminal block with a bad trailer
        let mut frame = vec![0x00, 0x00, LAST_BLOCK_SEQUENCE];
        frame.extend_from_slice(&[1; 10]);
        frame.extend_from_slice(&[0xDE, 0xAD]);
        device.write(Channel::RecvFirmware, &frame).unwrap();

        let events = drain(&rx);
        let TransportEvent::Notification { data, .. } = events.last().unwrap() else {
            panic!("expected sector ack");
        };
        assert_eq!(SectorAck::from_bytes(data).unwrap().status, SectorAckStatus::CrcError);
        assert!(device.received_image().is_empty());
    }

    #[test]
    fn test_oversized_write_fails() {
        let device = SimulatedDevice::new("sim").with_fault(SimFault::RejectMtu);
        let rx = connected(&device);
        device.write(Channel::RecvFirmware, &[0u8; 100]).unwrap();
        assert_eq!(
            drain(&rx),
            vec![TransportEvent::WriteComplete {
                channel: Channel::RecvFirmware,
                status: GattStatus::FAILURE
            }]
        );
    }
}
