mod admission;
mod availability;
mod error;
mod lifecycle;
mod mutations;
mod queries;
mod store;

pub use error::EngineError;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};
use chrono_tz::Tz;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use ulid::Ulid;

use crate::clock::Clock;
use crate::config::ScheduleConfig;
use crate::model::*;
use crate::wal::Wal;

use store::{DayState, Store};

type DayGuard = OwnedRwLockWriteGuard<DayState>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Owns the WAL file. Appends that are already queued when the first one is
/// picked up go out in the same flush; every sender gets that flush's result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_non_append(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }

        metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
        let flush_start = std::time::Instant::now();
        let result = flush_batch(&mut wal, &batch);
        metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
            .record(flush_start.elapsed().as_secs_f64());
        if let Err(e) = &result {
            tracing::error!("WAL flush failed for {} events: {e}", batch.len());
        }
        respond_batch(batch, &result);

        if let Some(other) = deferred {
            handle_non_append(&mut wal, other);
        }
    }
}

/// All or nothing: a failed batch is cut back off the log, since every
/// caller in it is told its event was not written.
fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mark = wal.mark()?;
    let result = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event))
        .and_then(|()| wal.flush_sync());
    if result.is_err()
        && let Err(e) = wal.rollback(mark)
    {
        tracing::error!("WAL rollback after failed batch failed: {e}");
    }
    result
}

fn respond_batch(batch: Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { response, .. } => {
            let _ = response.send(Err(io::Error::other("append routed outside a batch")));
        }
    }
}

/// The booking engine: one calendar, one WAL.
pub struct Engine {
    pub(super) store: Store,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) config: Arc<ScheduleConfig>,
    pub(super) tz: Tz,
    pub(super) clock: Arc<dyn Clock>,
    /// Mutations hold this shared; compaction holds it exclusively so its
    /// snapshot and the file swap see no interleaved append.
    pub(super) compaction_gate: RwLock<()>,
}

impl Engine {
    /// Rebuild state from the WAL at `wal_path` and start the writer task.
    /// Must be called inside a tokio runtime.
    pub fn new(
        wal_path: PathBuf,
        config: ScheduleConfig,
        clock: Arc<dyn Clock>,
    ) -> io::Result<Self> {
        let tz = config
            .tz()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            store: Store::new(),
            wal_tx,
            config: Arc::new(config),
            tz,
            clock,
            compaction_gate: RwLock::new(()),
        };

        // Nobody else holds these locks yet, so try_write cannot fail.
        for event in &events {
            for date in event.dates() {
                let day = engine.store.day_or_insert(date);
                let Ok(mut guard) = day.try_write() else {
                    return Err(io::Error::other("replay: day partition contended"));
                };
                engine.store.apply_to_day(&mut guard, event);
            }
        }
        tracing::info!(
            "replayed {} WAL events, {} bookings",
            events.len(),
            engine.store.booking_count()
        );

        Ok(engine)
    }

    pub fn config(&self) -> &ScheduleConfig {
        &self.config
    }

    /// Current wall-clock time at the counter.
    pub fn local_now(&self) -> NaiveDateTime {
        self.clock.now().with_timezone(&self.tz).naive_local()
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append, then apply to every locked day the event touches.
    /// Memory is untouched when the append fails.
    pub(super) async fn persist_and_apply(
        &self,
        days: &mut [&mut DayState],
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        for day in days.iter_mut() {
            self.store.apply_to_day(day, event);
        }
        Ok(())
    }

    pub(super) async fn lock_day(&self, date: NaiveDate) -> DayGuard {
        self.store.day_or_insert(date).write_owned().await
    }

    /// Write-lock the day that holds booking `id`. The index is re-read after
    /// locking in case a concurrent reschedule moved the booking.
    pub(super) async fn lock_booking_day(&self, id: Ulid) -> Result<DayGuard, EngineError> {
        loop {
            let date = self
                .store
                .date_of(&id)
                .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
            let guard = self.lock_day(date).await;
            if guard.booking(&id).is_some() {
                return Ok(guard);
            }
            if self.store.date_of(&id) == Some(date) {
                return Err(EngineError::NotFound(id.to_string()));
            }
        }
    }

    /// Lock two distinct days in ascending date order.
    pub(super) async fn lock_pair(&self, a: NaiveDate, b: NaiveDate) -> (DayGuard, DayGuard) {
        if a < b {
            let ga = self.lock_day(a).await;
            let gb = self.lock_day(b).await;
            (ga, gb)
        } else {
            let gb = self.lock_day(b).await;
            let ga = self.lock_day(a).await;
            (ga, gb)
        }
    }
}
