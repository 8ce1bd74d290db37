//! State machine implementation for the OTA transfer.

use std::fmt;

use crate::payload::PacketQueue;
use crate::transport::Channel;

/// Protocol state of an OTA session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum OtaState {
    /// Created, waiting for the link.
    #[default]
    Idle,
    /// MTU exchange in flight.
    Negotiating,
    /// GATT service discovery in flight.
    DiscoveringCapabilities,
    /// Enabling notifications, one channel at a time.
    EnablingNotifications,
    /// START sent.
    AwaitingStartAck,
    /// START accepted, packet queue being built off-thread.
    Packetizing,
    /// Writing firmware packets.
    Transferring,
    /// Last block of a sector written, waiting for the device verdict.
    AwaitingSectorAck,
    /// END sent.
    AwaitingEndAck,
    Completed,
    Failed,
}

impl fmt::Display for OtaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OtaState::Idle => write!(f, "IDLE"),
            OtaState::Negotiating => write!(f, "NEGOTIATING"),
            OtaState::DiscoveringCapabilities => write!(f, "DISCOVERING"),
            OtaState::EnablingNotifications => write!(f, "ENABLING_NOTIFICATIONS"),
            OtaState::AwaitingStartAck => write!(f, "AWAITING_START_ACK"),
            OtaState::Packetizing => write!(f, "PACKETIZING"),
            OtaState::Transferring => write!(f, "TRANSFERRING"),
            OtaState::AwaitingSectorAck => write!(f, "AWAITING_SECTOR_ACK"),
            OtaState::AwaitingEndAck => write!(f, "AWAITING_END_ACK"),
            OtaState::Completed => write!(f, "COMPLETED"),
            OtaState::Failed => write!(f, "FAILED"),
        }
    }
}

impl OtaState {
    /// `Completed` and `Failed` absorb every later event.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OtaState::Completed | OtaState::Failed)
    }

    /// States in which firmware packets are moving.
    pub fn is_transferring(&self) -> bool {
        matches!(self, OtaState::Transferring | OtaState::AwaitingSectorAck)
    }
}

/// Running index of the next expected sector ACK.
///
/// Advances by one on every sector ACK frame, whatever its outcome.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SectorAckCounter {
    next: u32,
}

impl SectorAckCounter {
    /// Current value; the counter then moves on.
    pub fn take(&mut self) -> u32 {
        let current = self.next;
        self.next += 1;
        current
    }

    pub fn peek(&self) -> u32 {
        self.next
    }
}

/// Runtime state of one transfer, owned by the session loop.
#[derive(Debug)]
pub struct TransferContext {
    /// Current protocol state.
    pub state: OtaState,
    /// Bumped on every packetizer request; stale results carry an older value.
    pub generation: u64,
    /// Negotiated packet size.
    pub packet_size: usize,
    /// Granted MTU, `None` if negotiation failed.
    pub mtu: Option<u16>,
    /// Channels reported by discovery.
    pub channels: Vec<Channel>,
    /// Channel whose notification enable is in flight.
    pub pending_notify: Option<Channel>,
    /// Remaining packets and markers.
    pub queue: PacketQueue,
    pub sector_acks: SectorAckCounter,
    /// A firmware write awaits its completion.
    pub write_in_flight: bool,
    /// Sector ACKs that arrived before their marker was dequeued.
    pub early_acks: usize,
    pub image_len: usize,
    pub sector_size: usize,
    pub total_sectors: usize,
    pub acked_sectors: usize,
    /// Payload bytes of all accepted sectors.
    pub bytes_acked: usize,
}

impl TransferContext {
    pub fn new(image_len: usize, sector_size: usize, packet_size: usize) -> Self {
        Self {
            state: OtaState::Idle,
            generation: 0,
            packet_size,
            mtu: None,
            channels: Vec::new(),
            pending_notify: None,
            queue: PacketQueue::default(),
            sector_acks: SectorAckCounter::default(),
            write_in_flight: false,
            early_acks: 0,
            image_len,
            sector_size,
            total_sectors: image_len.div_ceil(sector_size),
            acked_sectors: 0,
            bytes_acked: 0,
        }
    }

    /// Transition to a new state.
    pub fn goto_state(&mut self, new_state: OtaState) {
        tracing::info!(from = %self.state, to = %new_state, "State transition");
        self.state = new_state;
    }

    /// Payload size of sector `index`.
    pub fn sector_len(&self, index: usize) -> usize {
        self.image_len
            .saturating_sub(index * self.sector_size)
            .min(self.sector_size)
    }

    /// Record an accepted sector.
    pub fn sector_accepted(&mut self, index: u16) {
        self.acked_sectors += 1;
        self.bytes_acked += self.sector_len(usize::from(index));
    }

    /// Drop the queue and channel references.
    pub fn release(&mut self) {
        self.queue = PacketQueue::default();
        self.channels.clear();
        self.pending_notify = None;
        self.write_in_flight = false;
        self.early_acks = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sector_ack_counter() {
        let mut counter = SectorAckCounter::default();
        assert_eq!(counter.take(), 0);
        assert_eq!(counter.take(), 1);
        assert_eq!(counter.peek(), 2);
    }

    #[test]
    fn test_terminal_states() {
        assert!(OtaState::Completed.is_terminal());
        assert!(OtaState::Failed.is_terminal());
        assert!(!OtaState::AwaitingEndAck.is_terminal());
        assert!(OtaState::AwaitingSectorAck.is_transferring());
        assert!(!OtaState::Packetizing.is_transferring());
    }

    #[test]
    fn test_sector_accounting() {
        let mut ctx = TransferContext::new(8000, 4096, 20);
        assert_eq!(ctx.total_sectors, 2);
        assert_eq!(ctx.sector_len(0), 4096);
        assert_eq!(ctx.sector_len(1), 3904);
        assert_eq!(ctx.sector_len(2), 0);

        ctx.sector_accepted(0);
        ctx.sector_accepted(1);
        assert_eq!(ctx.acked_sectors, 2);
        assert_eq!(ctx.bytes_acked, 8000);
    }

    #[test]
    fn test_release() {
        let mut ctx = TransferContext::new(10, 4096, 20);
        ctx.channels = Channel::ALL.to_vec();
        ctx.pending_notify = Some(Channel::Command);
        ctx.write_in_flight = true;
        ctx.release();
        assert!(ctx.channels.is_empty());
        assert!(ctx.queue.is_empty());
        assert_eq!(ctx.pending_notify, None);
        assert!(!ctx.write_in_flight);
    }
}
