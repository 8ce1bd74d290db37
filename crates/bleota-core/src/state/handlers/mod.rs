//! Transport event handlers - dispatch logic for each event kind.
//!
//! This module is split into submodules by protocol phase:
//! - `connection`: link, MTU and service discovery
//! - `notify`: notification setup
//! - `command`: START/END and their ACKs
//! - `transfer`: firmware packets and sector ACKs

mod command;
mod connection;
mod notify;
mod transfer;

use crate::config::OtaConfig;
use crate::error::OtaError;
use crate::events::{LogLevel, OtaEvent, OtaObserver, PacketDirection};
use crate::payload::{PacketQueue, PacketizeError};
use crate::state::machine::{OtaState, TransferContext};
use crate::transport::{BleTransport, Channel, TransportEvent};
use tracing::{trace, warn};

use command::handle_command_frame;
use connection::{handle_connected, handle_mtu_changed, handle_services_discovered};
use notify::handle_notification_enabled;
use transfer::{handle_firmware_write_complete, handle_sector_ack};

/// Result of handling an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleResult {
    /// Continue processing.
    Continue,
    /// START accepted; build the packet queue off-thread.
    BuildPackets { generation: u64, packet_size: usize },
    /// Device accepted the image.
    Complete,
}

/// Handler context containing all resources.
pub struct HandlerContext<'a, T: BleTransport, O: OtaObserver> {
    pub transport: &'a T,
    pub observer: &'a O,
    pub state: &'a mut TransferContext,
    pub config: &'a OtaConfig,
}

impl<'a, T: BleTransport, O: OtaObserver> HandlerContext<'a, T, O> {
    pub(crate) fn emit(&self, event: OtaEvent) {
        self.observer.on_event(&event);
    }

    pub(crate) fn log(&self, level: LogLevel, message: impl Into<String>) {
        self.emit(OtaEvent::Log {
            level,
            message: message.into(),
        });
    }

    /// Change state and tell the observer.
    pub(crate) fn goto(&mut self, to: OtaState) {
        let from = self.state.state;
        if from == to {
            return;
        }
        self.state.goto_state(to);
        self.emit(OtaEvent::StateChanged { from, to });
    }

    /// Whether the session is in `expected`; logs the drop otherwise.
    pub(crate) fn expect_state(&self, expected: OtaState, what: &str) -> bool {
        if self.state.state == expected {
            return true;
        }
        warn!(state = %self.state.state, event = what, "Ignoring event in unexpected state");
        false
    }
}

/// Handle one transport event and perform the appropriate action.
pub fn handle_event<T: BleTransport, O: OtaObserver>(
    event: TransportEvent,
    ctx: &mut HandlerContext<'_, T, O>,
) -> Result<HandleResult, OtaError> {
    if ctx.state.state.is_terminal() {
        trace!(state = %ctx.state.state, ?event, "Session finished, dropping event");
        return Ok(HandleResult::Continue);
    }

    match event {
        TransportEvent::Connected => handle_connected(ctx),
        TransportEvent::Disconnected => {
            ctx.emit(OtaEvent::Disconnected);
            Err(OtaError::Disconnected)
        }
        TransportEvent::ConnectionError { status } => Err(OtaError::ConnectionFailed { status }),
        TransportEvent::MtuChanged { mtu, status } => handle_mtu_changed(mtu, status, ctx),
        TransportEvent::ServicesDiscovered { status, channels } => {
            handle_services_discovered(status, channels, ctx)
        }
        TransportEvent::NotificationEnabled { channel, status } => {
            handle_notification_enabled(channel, status, ctx)
        }
        TransportEvent::WriteComplete { channel, status } => {
            if !status.is_success() {
                return Err(OtaError::WriteFailed { channel, status });
            }
            match channel {
                Channel::RecvFirmware => handle_firmware_write_complete(ctx),
                // Command ACKs drive the flow, not write completions.
                _ => Ok(HandleResult::Continue),
            }
        }
        TransportEvent::Notification { channel, data } => {
            ctx.emit(OtaEvent::Packet {
                direction: PacketDirection::Rx,
                channel,
                length: data.len(),
            });
            match channel {
                Channel::RecvFirmware => handle_sector_ack(&data, ctx),
                Channel::Command => handle_command_frame(&data, ctx),
                Channel::Progress | Channel::Customer => {
                    ctx.emit(OtaEvent::Notification { channel, data });
                    Ok(HandleResult::Continue)
                }
            }
        }
    }
}

/// Handle the packetizer worker's result.
pub fn handle_packets_ready<T: BleTransport, O: OtaObserver>(
    generation: u64,
    result: Result<PacketQueue, PacketizeError>,
    ctx: &mut HandlerContext<'_, T, O>,
) -> Result<HandleResult, OtaError> {
    if generation != ctx.state.generation {
        warn!(generation, current = ctx.state.generation, "Dropping stale packet queue");
        return Ok(HandleResult::Continue);
    }
    if !ctx.expect_state(OtaState::Packetizing, "packets ready") {
        return Ok(HandleResult::Continue);
    }
    transfer::begin(result?, ctx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingObserver;
    use crate::protocol::constants::*;
    use crate::protocol::{CommandPacket, SectorAck, SectorAckStatus};
    use crate::transport::{GattStatus, MockTransport, TransportRequest};

    struct Harness {
        transport: MockTransport,
        observer: RecordingObserver,
        state: TransferContext,
        config: OtaConfig,
    }

    impl Harness {
        fn new(image_len: usize) -> Self {
            Self {
                transport: MockTransport::new(),
                observer: RecordingObserver::new(),
                state: TransferContext::new(image_len, SECTOR_SIZE, DEFAULT_PACKET_SIZE),
                config: OtaConfig::default(),
            }
        }

        fn handle(&mut self, event: TransportEvent) -> Result<HandleResult, OtaError> {
            let mut ctx = HandlerContext {
                transport: &self.transport,
                observer: &self.observer,
                state: &mut self.state,
                config: &self.config,
            };
            handle_event(event, &mut ctx)
        }

        fn packets_ready(&mut self, queue: PacketQueue) -> Result<HandleResult, OtaError> {
            let generation = self.state.generation;
            let mut ctx = HandlerContext {
                transport: &self.transport,
                observer: &self.observer,
                state: &mut self.state,
                config: &self.config,
            };
            handle_packets_ready(generation, Ok(queue), &mut ctx)
        }

        /// Drive the link up to `AwaitingStartAck`.
        fn open(&mut self) {
            self.handle(TransportEvent::Connected).unwrap();
            self.handle(TransportEvent::MtuChanged {
                mtu: 23,
                status: GattStatus::SUCCESS,
            })
            .unwrap();
            self.handle(TransportEvent::ServicesDiscovered {
                status: GattStatus::SUCCESS,
                channels: Channel::ALL.to_vec(),
            })
            .unwrap();
            for channel in Channel::ALL {
                self.handle(TransportEvent::NotificationEnabled {
                    channel,
                    status: GattStatus::SUCCESS,
                })
                .unwrap();
            }
        }

        /// Send the first sector of an 8000-byte image and stop at its marker.
        fn first_sector_sent(&mut self) {
            self.open();
            self.command_ack(COMMAND_ID_START, COMMAND_ACK_ACCEPT).unwrap();
            let queue = crate::payload::packetize(&[0x5A; 8000], 17).unwrap();
            self.packets_ready(queue).unwrap();
            while self.state.state == OtaState::Transferring {
                self.handle(TransportEvent::WriteComplete {
                    channel: Channel::RecvFirmware,
                    status: GattStatus::SUCCESS,
                })
                .unwrap();
            }
            assert_eq!(self.state.state, OtaState::AwaitingSectorAck);
        }

        fn sector_ack(&mut self, data: Vec<u8>) -> Result<HandleResult, OtaError> {
            self.handle(TransportEvent::Notification {
                channel: Channel::RecvFirmware,
                data,
            })
        }

        fn command_ack(&mut self, id: u16, status: u16) -> Result<HandleResult, OtaError> {
            self.handle(TransportEvent::Notification {
                channel: Channel::Command,
                data: CommandPacket::ack(id, status).encode().to_vec(),
            })
        }
    }

    #[test]
    fn test_link_setup_sequence() {
        let mut h = Harness::new(8000);
        h.open();

        assert_eq!(h.state.state, OtaState::AwaitingStartAck);
        assert_eq!(h.state.packet_size, 20);
        let requests = h.transport.requests();
        assert_eq!(requests[0], TransportRequest::RequestMtu(517));
        assert_eq!(requests[1], TransportRequest::DiscoverServices);
        let enabled: Vec<_> = requests
            .iter()
            .filter_map(|r| match r {
                TransportRequest::EnableNotification(c) => Some(*c),
                _ => None,
            })
            .collect();
        assert_eq!(enabled, Channel::ALL.to_vec());

        let start = h.transport.writes_to(Channel::Command);
        assert_eq!(start.len(), 1);
        assert_eq!(&start[0][0..6], &[0x01, 0x00, 0x40, 0x1F, 0x00, 0x00]);
    }

    #[test]
    fn test_mtu_rejected_falls_back() {
        let mut h = Harness::new(100);
        h.transport.reject_mtu_requests();
        h.handle(TransportEvent::Connected).unwrap();
        assert_eq!(h.state.state, OtaState::DiscoveringCapabilities);
        assert_eq!(h.state.packet_size, DEFAULT_PACKET_SIZE);
        assert_eq!(h.state.mtu, None);
        assert_eq!(h.transport.last_request(), Some(TransportRequest::DiscoverServices));
    }

    #[test]
    fn test_mtu_capped_by_expected_size() {
        let mut h = Harness::new(100);
        h.handle(TransportEvent::Connected).unwrap();
        h.handle(TransportEvent::MtuChanged {
            mtu: 517,
            status: GattStatus::SUCCESS,
        })
        .unwrap();
        assert_eq!(h.state.packet_size, EXPECT_PACKET_SIZE);

        let mut h = Harness::new(100);
        h.handle(TransportEvent::Connected).unwrap();
        h.handle(TransportEvent::MtuChanged {
            mtu: 185,
            status: GattStatus::FAILURE,
        })
        .unwrap();
        assert_eq!(h.state.packet_size, DEFAULT_PACKET_SIZE);
    }

    #[test]
    fn test_missing_channel() {
        let mut h = Harness::new(100);
        h.handle(TransportEvent::Connected).unwrap();
        h.handle(TransportEvent::MtuChanged {
            mtu: 23,
            status: GattStatus::SUCCESS,
        })
        .unwrap();
        let err = h
            .handle(TransportEvent::ServicesDiscovered {
                status: GattStatus::SUCCESS,
                channels: vec![Channel::RecvFirmware, Channel::Progress, Channel::Customer],
            })
            .unwrap_err();
        assert_eq!(err, OtaError::MissingChannel(Channel::Command));
        assert_eq!(err.code(), 11);
    }

    #[test]
    fn test_notification_failure_is_not_fatal_by_default() {
        let mut h = Harness::new(100);
        h.handle(TransportEvent::Connected).unwrap();
        h.handle(TransportEvent::MtuChanged {
            mtu: 23,
            status: GattStatus::SUCCESS,
        })
        .unwrap();
        h.handle(TransportEvent::ServicesDiscovered {
            status: GattStatus::SUCCESS,
            channels: Channel::ALL.to_vec(),
        })
        .unwrap();
        h.handle(TransportEvent::NotificationEnabled {
            channel: Channel::RecvFirmware,
            status: GattStatus::FAILURE,
        })
        .unwrap();
        assert_eq!(
            h.transport.last_request(),
            Some(TransportRequest::EnableNotification(Channel::Progress))
        );

        h.config.strict_notifications = true;
        let err = h
            .handle(TransportEvent::NotificationEnabled {
                channel: Channel::Progress,
                status: GattStatus::FAILURE,
            })
            .unwrap_err();
        assert_eq!(err.code(), 33);
    }

    #[test]
    fn test_start_accept_requests_packets() {
        let mut h = Harness::new(8000);
        h.open();
        let result = h.command_ack(COMMAND_ID_START, COMMAND_ACK_ACCEPT).unwrap();
        assert_eq!(
            result,
            HandleResult::BuildPackets {
                generation: 1,
                packet_size: 20
            }
        );
        assert_eq!(h.state.state, OtaState::Packetizing);
    }

    #[test]
    fn test_start_refused() {
        let mut h = Harness::new(8000);
        h.open();
        let err = h
            .command_ack(COMMAND_ID_START, COMMAND_ACK_REFUSE)
            .unwrap_err();
        assert_eq!(err, OtaError::StartRefused);
    }

    #[test]
    fn test_stray_end_ack_ignored() {
        let mut h = Harness::new(8000);
        h.open();
        let result = h.command_ack(COMMAND_ID_END, COMMAND_ACK_ACCEPT).unwrap();
        assert_eq!(result, HandleResult::Continue);
        assert_eq!(h.state.state, OtaState::AwaitingStartAck);
    }

    #[test]
    fn test_short_command_frame_is_decode_error() {
        let mut h = Harness::new(8000);
        h.open();
        let err = h
            .handle(TransportEvent::Notification {
                channel: Channel::Command,
                data: vec![0x03, 0x00, 0x01],
            })
            .unwrap_err();
        assert_eq!(err.code(), -1);
    }

    #[test]
    fn test_bad_command_checksum_dropped_when_verifying() {
        let mut h = Harness::new(8000);
        h.config.verify_command_checksum = true;
        h.open();
        let mut frame = CommandPacket::ack(COMMAND_ID_START, COMMAND_ACK_ACCEPT).encode();
        frame[19] ^= 0xFF;
        let result = h
            .handle(TransportEvent::Notification {
                channel: Channel::Command,
                data: frame.to_vec(),
            })
            .unwrap();
        assert_eq!(result, HandleResult::Continue);
        assert_eq!(h.state.state, OtaState::AwaitingStartAck);
    }

    #[test]
    fn test_early_sector_ack_consumed_at_marker() {
        let mut h = Harness::new(10);
        h.open();
        h.command_ack(COMMAND_ID_START, COMMAND_ACK_ACCEPT).unwrap();
        let queue = crate::payload::packetize(&[0xAB; 10], 17).unwrap();
        h.packets_ready(queue).unwrap();
        assert_eq!(h.state.state, OtaState::Transferring);
        assert_eq!(h.transport.writes_to(Channel::RecvFirmware).len(), 1);

        // ACK overtakes the write completion.
        h.handle(TransportEvent::Notification {
            channel: Channel::RecvFirmware,
            data: SectorAck::new(0, SectorAckStatus::Success).to_bytes(),
        })
        .unwrap();
        assert_eq!(h.state.early_acks, 1);

        h.handle(TransportEvent::WriteComplete {
            channel: Channel::RecvFirmware,
            status: GattStatus::SUCCESS,
        })
        .unwrap();
        assert_eq!(h.state.early_acks, 0);
        assert_eq!(h.state.state, OtaState::AwaitingEndAck);
        let end = h.transport.writes_to(Channel::Command);
        assert_eq!(&end.last().unwrap()[0..2], &[0x02, 0x00]);

        let result = h.command_ack(COMMAND_ID_END, COMMAND_ACK_ACCEPT).unwrap();
        assert_eq!(result, HandleResult::Complete);
        assert_eq!(h.state.state, OtaState::Completed);
    }

    #[test]
    fn test_sector_ack_resumes_next_sector() {
        let mut h = Harness::new(8000);
        h.first_sector_sent();
        let sent = h.transport.writes_to(Channel::RecvFirmware).len();
        assert_eq!(sent, 241);

        h.sector_ack(SectorAck::new(0, SectorAckStatus::Success).to_bytes())
            .unwrap();
        assert_eq!(h.state.sector_acks.peek(), 1);
        assert_eq!(h.state.state, OtaState::Transferring);
        assert_eq!(h.transport.writes_to(Channel::RecvFirmware).len(), sent + 1);
    }

    #[test]
    fn test_wrong_index_reported_before_status_is_decoded() {
        let mut h = Harness::new(8000);
        h.first_sector_sent();
        let sent = h.transport.writes_to(Channel::RecvFirmware).len();

        // Index error without the trailing expected index.
        let err = h.sector_ack(vec![0x05, 0x00, 0x02, 0x00]).unwrap_err();
        assert_eq!(
            err,
            OtaError::UnexpectedSectorIndex {
                expected: 0,
                actual: 5
            }
        );
        assert_eq!(err.code(), 1);
        assert_eq!(h.state.sector_acks.peek(), 1);
        assert_eq!(h.transport.writes_to(Channel::RecvFirmware).len(), sent);
    }

    #[test]
    fn test_truncated_sector_ack_is_decode_error() {
        let mut h = Harness::new(8000);
        h.first_sector_sent();
        let sent = h.transport.writes_to(Channel::RecvFirmware).len();

        let err = h.sector_ack(vec![0x00, 0x00]).unwrap_err();
        assert!(matches!(err, OtaError::Decode(_)));
        assert_eq!(err.code(), -1);
        assert_eq!(h.state.sector_acks.peek(), 1);
        assert_eq!(h.transport.writes_to(Channel::RecvFirmware).len(), sent);
    }

    #[test]
    fn test_sector_crc_error_ack() {
        let mut h = Harness::new(8000);
        h.first_sector_sent();
        let sent = h.transport.writes_to(Channel::RecvFirmware).len();

        let err = h
            .sector_ack(SectorAck::new(0, SectorAckStatus::CrcError).to_bytes())
            .unwrap_err();
        assert_eq!(err, OtaError::SectorChecksum { index: 0 });
        assert_eq!(err.code(), 2);
        assert_eq!(h.state.sector_acks.peek(), 1);
        assert_eq!(h.transport.writes_to(Channel::RecvFirmware).len(), sent);
        assert_eq!(h.state.acked_sectors, 0);
    }

    #[test]
    fn test_index_error_ack_with_expected_tail() {
        let mut h = Harness::new(8000);
        h.first_sector_sent();
        let err = h
            .sector_ack(vec![0x00, 0x00, 0x02, 0x00, 0x03, 0x00])
            .unwrap_err();
        assert_eq!(
            err,
            OtaError::SectorIndex {
                index: 0,
                device_expected: 3
            }
        );
        assert_eq!(err.code(), 3);
    }

    #[test]
    fn test_stale_packets_dropped() {
        let mut h = Harness::new(10);
        h.open();
        h.command_ack(COMMAND_ID_START, COMMAND_ACK_ACCEPT).unwrap();
        let queue = crate::payload::packetize(&[0xAB; 10], 17).unwrap();
        let mut ctx = HandlerContext {
            transport: &h.transport,
            observer: &h.observer,
            state: &mut h.state,
            config: &h.config,
        };
        let result = handle_packets_ready(0, Ok(queue), &mut ctx).unwrap();
        assert_eq!(result, HandleResult::Continue);
        assert_eq!(h.state.state, OtaState::Packetizing);
    }

    #[test]
    fn test_events_after_failure_ignored() {
        let mut h = Harness::new(10);
        h.state.state = OtaState::Failed;
        let result = h.handle(TransportEvent::Connected).unwrap();
        assert_eq!(result, HandleResult::Continue);
        assert!(h.transport.requests().is_empty());
    }

    #[test]
    fn test_write_failure() {
        let mut h = Harness::new(10);
        h.open();
        let err = h
            .handle(TransportEvent::WriteComplete {
                channel: Channel::Command,
                status: GattStatus::FAILURE,
            })
            .unwrap_err();
        assert_eq!(err.code(), 32);
    }

    #[test]
    fn test_customer_notification_forwarded() {
        let mut h = Harness::new(10);
        h.open();
        h.handle(TransportEvent::Notification {
            channel: Channel::Customer,
            data: vec![1, 2, 3],
        })
        .unwrap();
        assert!(h.observer.events().contains(&OtaEvent::Notification {
            channel: Channel::Customer,
            data: vec![1, 2, 3],
        }));
    }
}
