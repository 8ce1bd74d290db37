//! Notification setup handlers.

use crate::error::OtaError;
use crate::events::{LogLevel, OtaEvent, OtaObserver};
use crate::state::machine::OtaState;
use crate::transport::{BleTransport, Channel, GattStatus};
use tracing::{debug, warn};

use super::command::send_start;
use super::{HandleResult, HandlerContext};

pub(super) fn enable_notification<T: BleTransport, O: OtaObserver>(
    channel: Channel,
    ctx: &mut HandlerContext<'_, T, O>,
) -> Result<HandleResult, OtaError> {
    debug!(channel = %channel, "Enabling notifications");
    ctx.state.pending_notify = Some(channel);
    ctx.transport.enable_notification(channel)?;
    Ok(HandleResult::Continue)
}

/// One channel done; move to the next, or send START after the last.
pub fn handle_notification_enabled<T: BleTransport, O: OtaObserver>(
    channel: Channel,
    status: GattStatus,
    ctx: &mut HandlerContext<'_, T, O>,
) -> Result<HandleResult, OtaError> {
    if !ctx.expect_state(OtaState::EnablingNotifications, "notification enabled") {
        return Ok(HandleResult::Continue);
    }
    if ctx.state.pending_notify != Some(channel) {
        warn!(
            channel = %channel,
            pending = ?ctx.state.pending_notify,
            "Unexpected notification completion"
        );
        return Ok(HandleResult::Continue);
    }

    let success = status.is_success();
    ctx.emit(OtaEvent::NotificationEnabled { channel, success });
    if !success {
        if ctx.config.strict_notifications {
            return Err(OtaError::NotificationFailed { channel, status });
        }
        ctx.log(
            LogLevel::Warn,
            format!("Notifications on {} not enabled (status {}), continuing", channel, status),
        );
    }

    match channel.next() {
        Some(next) => enable_notification(next, ctx),
        None => {
            ctx.state.pending_notify = None;
            send_start(ctx)
        }
    }
}
