//! Periodic bookkeeping independent of socket activity.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;

use crate::application::server::BrlapiServer;

/// Expires unauthenticated connections every `period` until `running` is
/// cleared.
pub async fn run_maintenance(server: Arc<BrlapiServer>, period: Duration, running: Arc<AtomicBool>) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    while running.load(Ordering::Relaxed) {
        ticker.tick().await;
        let expired = server.expire_unauthenticated(Instant::now());
        if expired > 0 {
            debug!(expired, "expired unauthenticated connections");
        }
    }
}
