use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::Engine;

/// How often the compactor looks at the WAL append counter.
const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Background task that persists elapsed appointments as completed.
pub async fn run_reconciler(engine: Arc<Engine>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        reconcile_once(&engine).await;
    }
}

async fn reconcile_once(engine: &Engine) -> usize {
    match engine.reconcile_completed().await {
        Ok(0) => {
            debug!("reconciler: nothing to complete");
            0
        }
        Ok(n) => {
            info!("reconciler: {n} bookings completed");
            n
        }
        Err(e) => {
            warn!("reconciler pass failed: {e}");
            0
        }
    }
}

/// Background task that compacts the WAL once `threshold` appends pile up.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_needed(&engine, threshold).await;
    }
}

async fn compact_if_needed(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.wal_appends_since_compact().await;
    if appends < threshold {
        debug!("compactor skip: {appends} appends < {threshold}");
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => true,
        Err(e) => {
            warn!("WAL compaction failed: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    use chrono::{Duration as ChronoDuration, NaiveDate, NaiveTime, TimeZone, Utc};

    use crate::clock::FixedClock;
    use crate::config::ScheduleConfig;
    use crate::model::*;

    fn test_wal_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("counterbook_test_reconciler");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    fn engine(name: &str) -> (Engine, Arc<FixedClock>) {
        let config = ScheduleConfig::default();
        let start = config
            .tz()
            .unwrap()
            .with_ymd_and_hms(2030, 3, 1, 12, 0, 0)
            .unwrap()
            .with_timezone(&Utc);
        let clock = Arc::new(FixedClock::new(start));
        let engine = Engine::new(test_wal_path(name), config, clock.clone()).unwrap();
        (engine, clock)
    }

    fn request(tax_id: &str, time: (u32, u32)) -> BookingRequest {
        BookingRequest {
            service: ServiceKind::Enlistment,
            description: None,
            date: NaiveDate::from_ymd_opt(2030, 3, 4).unwrap(),
            slot: NaiveTime::from_hms_opt(time.0, time.1, 0).unwrap(),
            name: "Joao Pereira".into(),
            phone: "88999990000".into(),
            tax_id: Some(tax_id.into()),
            has_tax_id: true,
            postal_code: Some("62955000".into()),
            email: None,
        }
    }

    #[tokio::test]
    async fn reconcile_once_persists_elapsed_bookings() {
        let (engine, clock) = engine("reconcile_once.wal");
        let early = engine.create_booking(request("52998224725", (8, 0))).await.unwrap();
        let late = engine.create_booking(request("11144477735", (15, 10))).await.unwrap();

        assert_eq!(reconcile_once(&engine).await, 0);

        // Monday 12:00: the morning slot has passed, the afternoon one has not.
        clock.advance(ChronoDuration::days(3));
        assert_eq!(reconcile_once(&engine).await, 1);
        assert_eq!(reconcile_once(&engine).await, 0);

        let early = engine.get_booking(early.id).await.unwrap();
        let late = engine.get_booking(late.id).await.unwrap();
        assert_eq!(early.status, Status::Completed);
        assert_eq!(late.status, Status::Scheduled);
    }

    #[tokio::test]
    async fn compactor_respects_threshold() {
        let (engine, _clock) = engine("compactor_threshold.wal");
        let date = NaiveDate::from_ymd_opt(2030, 3, 4).unwrap();
        for _ in 0..4 {
            engine.toggle_day_block(date).await.unwrap();
        }
        assert!(!compact_if_needed(&engine, 10).await);
        assert_eq!(engine.wal_appends_since_compact().await, 4);

        assert!(compact_if_needed(&engine, 4).await);
        assert_eq!(engine.wal_appends_since_compact().await, 0);
        assert!(!engine.is_day_blocked(date).await);
    }
}
