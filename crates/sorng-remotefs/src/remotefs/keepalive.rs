//! Control-connection keep-alive while a data transfer is in flight.

use crate::remotefs::channel::{Channel, RemoteSession};
use log::{debug, trace};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant, MissedTickBehavior};

/// Background task sending the session's no-op every `period`.
/// Aborted when dropped.
pub struct KeepAlive {
    handle: JoinHandle<()>,
}

impl KeepAlive {
    pub fn spawn(session: Arc<dyn RemoteSession>, label: String, period: Duration) -> Self {
        let handle = tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if !session.is_connected() {
                    debug!("RemoteFS keepalive {}: session gone, stopping", label);
                    break;
                }
                match session.keep_alive().await {
                    Ok(()) => trace!("RemoteFS keepalive {}: NOOP sent", label),
                    Err(e) => debug!("RemoteFS keepalive {}: NOOP failed: {}", label, e),
                }
            }
        });
        Self { handle }
    }

    /// Start a timer for `channel` if its endpoint asks for one.
    pub fn for_channel(channel: &Channel) -> Option<Self> {
        channel.endpoint().keepalive().map(|period| {
            Self::spawn(channel.session(), channel.endpoint().to_string(), period)
        })
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
