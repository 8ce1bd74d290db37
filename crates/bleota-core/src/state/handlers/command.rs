//! Command channel handlers (START, END and their ACKs).

use crate::error::OtaError;
use crate::events::{OtaEvent, OtaObserver};
use crate::protocol::command::command_name;
use crate::protocol::constants::*;
use crate::protocol::{CodecError, CommandAckStatus, CommandPacket};
use crate::state::machine::OtaState;
use crate::transport::{BleTransport, Channel};
use tracing::{debug, info, warn};

use super::{HandleResult, HandlerContext};

/// START carries the image length.
pub(super) fn send_start<T: BleTransport, O: OtaObserver>(
    ctx: &mut HandlerContext<'_, T, O>,
) -> Result<HandleResult, OtaError> {
    // FirmwareImage caps the length at u32::MAX
    let image_len = ctx.state.image_len as u32;
    ctx.goto(OtaState::AwaitingStartAck);
    ctx.transport
        .write(Channel::Command, &CommandPacket::start(image_len).encode())?;
    info!(image_len, "Sent START");
    Ok(HandleResult::Continue)
}

pub(super) fn send_end<T: BleTransport, O: OtaObserver>(
    ctx: &mut HandlerContext<'_, T, O>,
) -> Result<HandleResult, OtaError> {
    ctx.goto(OtaState::AwaitingEndAck);
    ctx.transport
        .write(Channel::Command, &CommandPacket::end().encode())?;
    info!(sectors = ctx.state.acked_sectors, "Sent END");
    Ok(HandleResult::Continue)
}

/// Frame received on the command channel.
pub fn handle_command_frame<T: BleTransport, O: OtaObserver>(
    data: &[u8],
    ctx: &mut HandlerContext<'_, T, O>,
) -> Result<HandleResult, OtaError> {
    let packet = match CommandPacket::decode(data, ctx.config.verify_command_checksum) {
        Ok(packet) => packet,
        Err(CodecError::ChecksumMismatch { expected, actual }) => {
            debug!(
                expected = %format!("{:04X}", expected),
                actual = %format!("{:04X}", actual),
                "Dropping command frame with bad checksum"
            );
            return Ok(HandleResult::Continue);
        }
        Err(e) => return Err(e.into()),
    };
    if !packet.is_ack() {
        warn!(id = packet.id, "Ignoring non-ACK command frame");
        return Ok(HandleResult::Continue);
    }

    let ack = packet.as_ack()?;
    debug!(command = command_name(ack.command_id), status = %ack.status, "Command ACK");
    match (ctx.state.state, ack.command_id) {
        (OtaState::AwaitingStartAck, COMMAND_ID_START) => {
            ctx.emit(OtaEvent::StartAck { status: ack.status });
            match ack.status {
                CommandAckStatus::Accept => {
                    ctx.goto(OtaState::Packetizing);
                    ctx.state.generation += 1;
                    Ok(HandleResult::BuildPackets {
                        generation: ctx.state.generation,
                        packet_size: ctx.state.packet_size,
                    })
                }
                CommandAckStatus::Refuse => Err(OtaError::StartRefused),
                CommandAckStatus::Unknown(status) => Err(OtaError::UnknownAckStatus { status }),
            }
        }
        (OtaState::AwaitingEndAck, COMMAND_ID_END) => {
            ctx.emit(OtaEvent::EndAck { status: ack.status });
            match ack.status {
                CommandAckStatus::Accept => {
                    ctx.goto(OtaState::Completed);
                    ctx.emit(OtaEvent::Complete);
                    Ok(HandleResult::Complete)
                }
                CommandAckStatus::Refuse => Err(OtaError::EndRefused),
                CommandAckStatus::Unknown(status) => Err(OtaError::UnknownAckStatus { status }),
            }
        }
        (state, id) => {
            warn!(state = %state, command = command_name(id), "Ignoring unexpected command ACK");
            Ok(HandleResult::Continue)
        }
    }
}
