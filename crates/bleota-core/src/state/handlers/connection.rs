//! Link handlers (connect, MTU exchange, service discovery).

use crate::error::OtaError;
use crate::events::{LogLevel, OtaEvent, OtaObserver};
use crate::state::machine::OtaState;
use crate::transport::{BleTransport, Channel, GattStatus};
use tracing::{info, warn};

use super::notify::enable_notification;
use super::{HandleResult, HandlerContext};

/// Link up: ask for the large MTU.
pub fn handle_connected<T: BleTransport, O: OtaObserver>(
    ctx: &mut HandlerContext<'_, T, O>,
) -> Result<HandleResult, OtaError> {
    if !ctx.expect_state(OtaState::Idle, "connected") {
        return Ok(HandleResult::Continue);
    }
    ctx.emit(OtaEvent::Connected {
        peer: ctx.transport.peer(),
    });
    ctx.goto(OtaState::Negotiating);

    let mtu = ctx.config.mtu_request;
    match ctx.transport.request_mtu(mtu) {
        Ok(()) => {
            info!(mtu, "Requested MTU");
            Ok(HandleResult::Continue)
        }
        Err(e) => {
            // Some stacks refuse outright; carry on with small packets.
            warn!(error = %e, "MTU request rejected");
            ctx.log(LogLevel::Warn, format!("MTU request rejected: {}", e));
            apply_mtu(None, ctx);
            start_discovery(ctx)
        }
    }
}

/// MTU exchange finished.
pub fn handle_mtu_changed<T: BleTransport, O: OtaObserver>(
    mtu: u16,
    status: GattStatus,
    ctx: &mut HandlerContext<'_, T, O>,
) -> Result<HandleResult, OtaError> {
    if !ctx.expect_state(OtaState::Negotiating, "mtu changed") {
        return Ok(HandleResult::Continue);
    }
    apply_mtu(status.is_success().then_some(mtu), ctx);
    start_discovery(ctx)
}

fn apply_mtu<T: BleTransport, O: OtaObserver>(
    mtu: Option<u16>,
    ctx: &mut HandlerContext<'_, T, O>,
) {
    let packet_size = ctx.config.packet_size_for_mtu(mtu);
    ctx.state.mtu = mtu;
    ctx.state.packet_size = packet_size;
    ctx.emit(OtaEvent::MtuNegotiated { mtu, packet_size });
}

fn start_discovery<T: BleTransport, O: OtaObserver>(
    ctx: &mut HandlerContext<'_, T, O>,
) -> Result<HandleResult, OtaError> {
    ctx.goto(OtaState::DiscoveringCapabilities);
    ctx.transport.discover_services()?;
    Ok(HandleResult::Continue)
}

/// Discovery finished: every OTA channel must be present.
pub fn handle_services_discovered<T: BleTransport, O: OtaObserver>(
    status: GattStatus,
    channels: Vec<Channel>,
    ctx: &mut HandlerContext<'_, T, O>,
) -> Result<HandleResult, OtaError> {
    if !ctx.expect_state(OtaState::DiscoveringCapabilities, "services discovered") {
        return Ok(HandleResult::Continue);
    }
    if !status.is_success() {
        return Err(OtaError::DiscoveryFailed { status });
    }
    ctx.emit(OtaEvent::ServicesDiscovered {
        channels: channels.clone(),
    });
    if let Some(missing) = Channel::ALL.into_iter().find(|c| !channels.contains(c)) {
        return Err(OtaError::MissingChannel(missing));
    }
    ctx.state.channels = channels;

    ctx.goto(OtaState::EnablingNotifications);
    enable_notification(Channel::ALL[0], ctx)
}
