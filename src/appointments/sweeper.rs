use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use tokio::time::{self, Duration as TokioDuration};
use tracing::{debug, info, warn};

use super::store::AppointmentStore;
use crate::error::AppResult;

/// Background reaper for expired unpaid holds.
pub fn spawn(pool: PgPool, hold_ttl_minutes: i64, interval_secs: u64) {
    let interval = TokioDuration::from_secs(interval_secs);
    tokio::spawn(async move {
        let store = AppointmentStore::new(pool);
        let mut ticker = time::interval(interval);
        loop {
            ticker.tick().await;
            match process_tick(&store, Utc::now(), hold_ttl_minutes).await {
                Ok(0) => debug!("no expired holds to reap"),
                Ok(reaped) => info!(reaped, "expired pending holds removed"),
                Err(err) => warn!(?err, "hold cleanup tick failed"),
            }
        }
    });
}

/// One sweep: drop unpaid holds older than the TTL. Safe to call repeatedly;
/// a tick with nothing eligible is a no-op.
pub async fn process_tick(
    store: &AppointmentStore,
    now: DateTime<Utc>,
    hold_ttl_minutes: i64,
) -> AppResult<u64> {
    store
        .delete_expired_pending(now - Duration::minutes(hold_ttl_minutes))
        .await
}
