//! Idle-ping task keeping the front-end connection alive while a handler
//! blocks inside a long SERVICE stage on the same socket.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::network::processor::{Action, Stage, TxnShared};
use crate::utils::{schedule_periodic, CancelHandle};

/// Spawns the per-connection prober. Each tick checks that the processor
/// is inside SERVICE and that the socket has been write-idle for longer
/// than `max_idle` before issuing a ping through the action dispatch.
pub fn spawn_keep_alive(
    shared: Arc<TxnShared>,
    tick: Duration,
    max_idle: Duration,
) -> CancelHandle {
    schedule_periodic(tick, move || {
        let shared = shared.clone();
        async move {
            if shared.stage() != Stage::Service {
                return;
            }
            if shared.channel().write_idle() < max_idle {
                return;
            }
            if let Err(err) = shared.dispatch(Action::ClientPing).await {
                warn!(error = %err, "keep-alive ping failed");
            }
        }
    })
}
