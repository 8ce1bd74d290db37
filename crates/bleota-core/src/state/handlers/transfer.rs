//! Firmware transfer handlers.

use crate::error::OtaError;
use crate::events::{OtaEvent, OtaObserver};
use crate::payload::{OutgoingItem, PacketQueue};
use crate::protocol::{SectorAck, SectorAckStatus};
use crate::state::machine::OtaState;
use crate::transport::{BleTransport, Channel};
use tracing::{debug, info, trace, warn};

use super::command::send_end;
use super::{HandleResult, HandlerContext};

/// Queue is ready: start writing.
pub(super) fn begin<T: BleTransport, O: OtaObserver>(
    queue: PacketQueue,
    ctx: &mut HandlerContext<'_, T, O>,
) -> Result<HandleResult, OtaError> {
    info!(
        sectors = queue.sector_count(),
        packets = queue.packet_count(),
        packet_size = ctx.state.packet_size,
        "Starting firmware transfer"
    );
    ctx.state.total_sectors = queue.sector_count();
    ctx.state.queue = queue;
    ctx.goto(OtaState::Transferring);
    pump(ctx)
}

/// Write the next packet, stop at a sector marker, or send END when drained.
fn pump<T: BleTransport, O: OtaObserver>(
    ctx: &mut HandlerContext<'_, T, O>,
) -> Result<HandleResult, OtaError> {
    loop {
        match ctx.state.queue.pop_front() {
            Some(OutgoingItem::Packet(packet)) => {
                trace!(
                    sector = packet.sector_index(),
                    seq = packet.sequence(),
                    len = packet.len(),
                    "Writing firmware packet"
                );
                ctx.state.write_in_flight = true;
                ctx.transport.write(Channel::RecvFirmware, packet.as_bytes())?;
                return Ok(HandleResult::Continue);
            }
            Some(OutgoingItem::SectorAckMarker { sector_index }) => {
                if ctx.state.early_acks > 0 {
                    ctx.state.early_acks -= 1;
                    trace!(sector = sector_index, "Sector already acknowledged");
                    continue;
                }
                ctx.goto(OtaState::AwaitingSectorAck);
                return Ok(HandleResult::Continue);
            }
            None => return send_end(ctx),
        }
    }
}

/// Write on the firmware channel completed.
pub fn handle_firmware_write_complete<T: BleTransport, O: OtaObserver>(
    ctx: &mut HandlerContext<'_, T, O>,
) -> Result<HandleResult, OtaError> {
    if ctx.state.state != OtaState::Transferring || !ctx.state.write_in_flight {
        warn!(state = %ctx.state.state, "Ignoring unexpected firmware write completion");
        return Ok(HandleResult::Continue);
    }
    ctx.state.write_in_flight = false;
    pump(ctx)
}

/// Sector ACK frame on the firmware channel.
pub fn handle_sector_ack<T: BleTransport, O: OtaObserver>(
    data: &[u8],
    ctx: &mut HandlerContext<'_, T, O>,
) -> Result<HandleResult, OtaError> {
    if !ctx.state.state.is_transferring() {
        warn!(state = %ctx.state.state, "Ignoring sector ACK outside transfer");
        return Ok(HandleResult::Continue);
    }

    // The counter advances on every ACK, and the index is checked before
    // the rest of the frame is decoded.
    let expected = ctx.state.sector_acks.take();
    let actual = SectorAck::index_of(data)?;
    if u32::from(actual) != expected {
        return Err(OtaError::UnexpectedSectorIndex { expected, actual });
    }
    let ack = SectorAck::from_bytes(data)?;

    let index = ack.index;
    match ack.status {
        SectorAckStatus::Success => {}
        SectorAckStatus::CrcError => return Err(OtaError::SectorChecksum { index }),
        SectorAckStatus::SectorIndexError { expected } => {
            return Err(OtaError::SectorIndex {
                index,
                device_expected: expected,
            });
        }
        SectorAckStatus::PayloadLengthError => return Err(OtaError::PayloadLength { index }),
        SectorAckStatus::Unknown(status) => return Err(OtaError::UnknownAckStatus { status }),
    }

    ctx.state.sector_accepted(index);
    debug!(
        sector = index,
        acked = ctx.state.acked_sectors,
        total = ctx.state.total_sectors,
        "Sector accepted"
    );
    ctx.emit(OtaEvent::SectorAcked { index });
    ctx.emit(OtaEvent::Progress {
        acked_sectors: ctx.state.acked_sectors,
        total_sectors: ctx.state.total_sectors,
        bytes_sent: ctx.state.bytes_acked,
        total_bytes: ctx.state.image_len,
    });

    if ctx.state.state == OtaState::AwaitingSectorAck {
        ctx.goto(OtaState::Transferring);
        pump(ctx)
    } else {
        ctx.state.early_acks += 1;
        Ok(HandleResult::Continue)
    }
}
