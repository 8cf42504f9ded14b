//! Periodic expiry sweep for pairings and sessions.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::pairing::PairingManager;

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// One sweep: drop expired pairings, revoke expired sessions.
pub async fn sweep_tick(manager: &PairingManager) {
    manager.cleanup_expired().await;
}

/// Run [`sweep_tick`] forever on `interval`. Abort the handle to stop.
pub fn spawn(manager: Arc<PairingManager>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            sweep_tick(&manager).await;
        }
    })
}
