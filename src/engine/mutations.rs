use chrono::{NaiveDate, NaiveTime};
use tokio::sync::oneshot;
use tracing::{debug, info};
use ulid::Ulid;

use crate::calendar;
use crate::config::ScheduleConfig;
use crate::limits::*;
use crate::model::*;
use crate::observability;
use crate::protocol;

use super::lifecycle::{check_cancel, check_rating, effective_status, evaluate};
use super::{admission, DayGuard, DayState, Engine, EngineError, WalCommand};

impl Engine {
    /// Admit and commit a new booking. Validation and the WAL append run
    /// under the date's write lock.
    pub async fn create_booking(&self, req: BookingRequest) -> Result<Booking, EngineError> {
        let result = self.admit(req).await;
        match &result {
            Ok(b) => {
                metrics::counter!(observability::BOOKINGS_ADMITTED_TOTAL).increment(1);
                info!(
                    "booking {} admitted for {} {} ({})",
                    b.id,
                    format_date(b.date),
                    format_time(b.slot),
                    b.protocol
                );
            }
            Err(e) => {
                metrics::counter!(observability::BOOKINGS_REJECTED_TOTAL, "reason" => e.code())
                    .increment(1);
                debug!("booking rejected: {e}");
            }
        }
        result
    }

    async fn admit(&self, req: BookingRequest) -> Result<Booking, EngineError> {
        let normalized = admission::validate_request(&req)?;
        self.check_calendar(req.date, req.slot)?;

        let _gate = self.compaction_gate.read().await;
        let mut day = self.lock_day(req.date).await;
        let now = self.local_now();
        admission::check_not_past(req.date, req.slot, now)?;
        let slots = calendar::slots_for_date(&self.config, req.date);
        admission::check_day(
            &self.config,
            &day,
            &slots,
            &normalized.citizen,
            req.slot,
            now,
            None,
        )?;
        if day.is_slot_occupied(req.slot, None) {
            return Err(EngineError::SlotTaken(req.date, req.slot));
        }

        let booking = Booking {
            id: Ulid::new(),
            protocol: protocol::generate(req.date, req.slot),
            service: req.service,
            description: normalized.description,
            date: req.date,
            slot: req.slot,
            citizen: normalized.citizen,
            status: Status::Scheduled,
            rating: None,
            feedback: None,
            notes: None,
            created_at: self.clock.now(),
        };
        let event = Event::BookingCreated {
            booking: booking.clone(),
        };
        self.persist_and_apply(&mut [&mut *day], &event).await?;
        Ok(booking)
    }

    /// Rejections that need no day state, checked before `lock_day` so a
    /// refused request does not leave a partition behind for its date.
    ///
    /// The off-calendar check only short-circuits when the date has no
    /// partition yet: an empty day cannot fail the quota or duplicate checks
    /// that would otherwise come first.
    fn check_calendar(&self, date: NaiveDate, slot: NaiveTime) -> Result<(), EngineError> {
        admission::check_not_past(date, slot, self.local_now())?;
        if self.store.get_day(&date).is_none()
            && !calendar::slots_for_date(&self.config, date).contains(&slot)
        {
            return Err(EngineError::SlotNotOffered(date, slot));
        }
        Ok(())
    }

    /// Edit a booking. Moving it to another date or slot re-runs the
    /// past-time, quota, duplicate and open-slot checks without counting the
    /// booking itself, and only works while it is still scheduled. An edit
    /// in place that changes the tax id or the postal code's locality
    /// re-runs the quota and duplicate checks.
    pub async fn update_booking(
        &self,
        id: Ulid,
        patch: BookingPatch,
    ) -> Result<Booking, EngineError> {
        if patch.notes.as_ref().is_some_and(|n| n.len() > MAX_NOTES_LEN) {
            return Err(EngineError::LimitExceeded("notes too long"));
        }
        if let Some(target) = patch.date
            && self.store.get_day(&target).is_none()
        {
            self.precheck_move(id, target, &patch).await?;
        }

        let _gate = self.compaction_gate.read().await;
        let (mut source, mut dest) = match patch.date {
            Some(target) => self.lock_for_move(id, target).await?,
            None => (self.lock_booking_day(id).await?, None),
        };
        let current = source
            .booking(&id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;

        let req = merged_request(&current, &patch);
        let normalized = admission::validate_request(&req)?;
        let now = self.local_now();

        let status = effective_status(&current, now);
        if req.date != current.date || req.slot != current.slot {
            if status != Status::Scheduled {
                return Err(EngineError::InvalidTransition {
                    from: status,
                    to: Status::Scheduled,
                });
            }
            admission::check_not_past(req.date, req.slot, now)?;
            let slots = calendar::slots_for_date(&self.config, req.date);
            let target_day: &DayState = dest.as_deref().unwrap_or(&*source);
            admission::check_day(
                &self.config,
                target_day,
                &slots,
                &normalized.citizen,
                req.slot,
                now,
                Some(id),
            )?;
            if target_day.is_slot_occupied(req.slot, Some(id)) {
                return Err(EngineError::SlotTaken(req.date, req.slot));
            }
        } else if status == Status::Scheduled
            && changes_identity(&self.config, &current.citizen, &normalized.citizen)
        {
            admission::check_citizen(&self.config, &source, &normalized.citizen, now, Some(id))?;
        }

        let notes = match &patch.notes {
            Some(n) => Some(n.trim().to_string()).filter(|n| !n.is_empty()),
            None => current.notes.clone(),
        };
        let updated = Booking {
            service: req.service,
            description: normalized.description,
            date: req.date,
            slot: req.slot,
            citizen: normalized.citizen,
            notes,
            ..current.clone()
        };
        let event = Event::BookingUpdated {
            previous_date: current.date,
            booking: updated.clone(),
        };
        match dest.as_mut() {
            Some(dest) => {
                self.persist_and_apply(&mut [&mut *source, &mut **dest], &event)
                    .await?
            }
            None => self.persist_and_apply(&mut [&mut *source], &event).await?,
        }
        info!(
            "booking {id} updated ({} {})",
            format_date(updated.date),
            format_time(updated.slot)
        );
        Ok(evaluate(updated, now))
    }

    /// The stateless part of a move onto a date with no partition yet, run
    /// against an unlocked snapshot of the booking. Same rejection order as
    /// the locked path; the locked path re-checks everything.
    async fn precheck_move(
        &self,
        id: Ulid,
        target: NaiveDate,
        patch: &BookingPatch,
    ) -> Result<(), EngineError> {
        let current = self
            .get_booking(id)
            .await
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        if current.date == target {
            return Ok(());
        }
        let req = merged_request(&current, patch);
        admission::validate_request(&req)?;
        let status = effective_status(&current, self.local_now());
        if status != Status::Scheduled {
            return Err(EngineError::InvalidTransition {
                from: status,
                to: Status::Scheduled,
            });
        }
        self.check_calendar(target, req.slot)
    }

    /// Lock the booking's current day and, when it differs, `target`, in date
    /// order. The second guard is `None` for same-day edits.
    async fn lock_for_move(
        &self,
        id: Ulid,
        target: NaiveDate,
    ) -> Result<(DayGuard, Option<DayGuard>), EngineError> {
        loop {
            let source = self.lock_booking_day(id).await?;
            let from = source.date;
            if from == target {
                return Ok((source, None));
            }
            if from < target {
                let dest = self.lock_day(target).await;
                return Ok((source, Some(dest)));
            }
            drop(source);
            let (source, dest) = self.lock_pair(from, target).await;
            if source.booking(&id).is_some() {
                return Ok((source, Some(dest)));
            }
        }
    }

    pub async fn cancel_booking(&self, id: Ulid, actor: Actor) -> Result<Booking, EngineError> {
        let _gate = self.compaction_gate.read().await;
        let mut day = self.lock_booking_day(id).await?;
        let booking = day
            .booking(&id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        let now = self.local_now();
        check_cancel(&booking, actor, now, self.config.cancellation_lead())?;

        let event = Event::BookingStatusChanged {
            id,
            date: booking.date,
            status: Status::Cancelled,
        };
        self.persist_and_apply(&mut [&mut *day], &event).await?;
        info!("booking {id} cancelled by {actor:?}");
        Ok(Booking {
            status: Status::Cancelled,
            ..booking
        })
    }

    /// Attach a 1-5 rating once. A still-scheduled booking becomes completed.
    pub async fn rate_booking(
        &self,
        id: Ulid,
        rating: i64,
        feedback: Option<String>,
    ) -> Result<Booking, EngineError> {
        let feedback = feedback
            .map(|f| f.trim().to_string())
            .filter(|f| !f.is_empty());
        if feedback.as_ref().is_some_and(|f| f.len() > MAX_FEEDBACK_LEN) {
            return Err(EngineError::LimitExceeded("feedback too long"));
        }

        let _gate = self.compaction_gate.read().await;
        let mut day = self.lock_booking_day(id).await?;
        let booking = day
            .booking(&id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        let status = check_rating(&booking, rating, self.local_now())?;
        // check_rating bounds the value to 1..=5.
        let rating = rating as u8;

        let event = Event::BookingRated {
            id,
            date: booking.date,
            rating,
            feedback: feedback.clone(),
            status,
        };
        self.persist_and_apply(&mut [&mut *day], &event).await?;
        info!("booking {id} rated {rating}");
        Ok(Booking {
            rating: Some(rating),
            feedback,
            status,
            ..booking
        })
    }

    // ── Blocks ───────────────────────────────────────────────

    pub async fn toggle_day_block(&self, date: NaiveDate) -> Result<BlockAction, EngineError> {
        let _gate = self.compaction_gate.read().await;
        let mut day = self.lock_day(date).await;
        let blocked = !day.day_blocked;
        let event = Event::DayBlockSet { date, blocked };
        self.persist_and_apply(&mut [&mut *day], &event).await?;
        let action = BlockAction::from_blocked(blocked);
        info!("day {} {}", format_date(date), action.as_str());
        Ok(action)
    }

    pub async fn toggle_slot_block(
        &self,
        date: NaiveDate,
        time: NaiveTime,
    ) -> Result<BlockAction, EngineError> {
        let _gate = self.compaction_gate.read().await;
        let mut day = self.lock_day(date).await;
        let blocked = !day.blocked_slots.contains(&time);
        let event = Event::SlotBlockSet {
            date,
            time,
            blocked,
        };
        self.persist_and_apply(&mut [&mut *day], &event).await?;
        let action = BlockAction::from_blocked(blocked);
        info!(
            "slot {} {} {}",
            format_date(date),
            format_time(time),
            action.as_str()
        );
        Ok(action)
    }

    /// Block every weekday of `month` that is not blocked yet, or unblock all
    /// of them if every one already is. Written as one WAL record while every
    /// affected day is locked.
    pub async fn toggle_month_block(&self, month: NaiveDate) -> Result<BlockAction, EngineError> {
        let dates = calendar::business_days_in_month(month);
        let _gate = self.compaction_gate.read().await;
        // `dates` is ascending.
        let mut guards = Vec::with_capacity(dates.len());
        for date in &dates {
            guards.push(self.lock_day(*date).await);
        }

        let blocked = !guards.iter().all(|g| g.day_blocked);
        let targets: Vec<NaiveDate> = if blocked {
            guards
                .iter()
                .filter(|g| !g.day_blocked)
                .map(|g| g.date)
                .collect()
        } else {
            dates
        };
        let changed = targets.len();
        let event = Event::MonthBlockSet {
            dates: targets,
            blocked,
        };
        let mut days: Vec<&mut DayState> = guards.iter_mut().map(|g| &mut **g).collect();
        self.persist_and_apply(&mut days, &event).await?;

        let action = BlockAction::from_blocked(blocked);
        info!(
            "month {} {} ({changed} days changed)",
            month.format("%Y-%m"),
            action.as_str()
        );
        Ok(action)
    }

    // ── Background maintenance ───────────────────────────────

    /// Persist `scheduled → completed` for every booking whose slot has
    /// passed. Reads already see these as completed; this makes it durable.
    pub async fn reconcile_completed(&self) -> Result<usize, EngineError> {
        let _gate = self.compaction_gate.read().await;
        let today = self.local_now().date();
        let mut count = 0usize;

        for day in self.store.days() {
            let mut guard = day.write_owned().await;
            if guard.date > today {
                break;
            }
            let now = self.local_now();
            let elapsed: Vec<Ulid> = guard
                .bookings
                .iter()
                .filter(|b| {
                    b.status == Status::Scheduled && effective_status(b, now) == Status::Completed
                })
                .map(|b| b.id)
                .collect();
            for id in elapsed {
                let event = Event::BookingStatusChanged {
                    id,
                    date: guard.date,
                    status: Status::Completed,
                };
                self.persist_and_apply(&mut [&mut *guard], &event).await?;
                count += 1;
            }
        }

        metrics::counter!(observability::RECONCILED_TOTAL).increment(count as u64);
        Ok(count)
    }

    /// Rewrite the WAL as the minimal event set that rebuilds current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.compaction_gate.write().await;
        let mut events = Vec::new();
        for day in self.store.days() {
            let guard = day.read().await;
            if guard.day_blocked {
                events.push(Event::DayBlockSet {
                    date: guard.date,
                    blocked: true,
                });
            }
            for time in &guard.blocked_slots {
                events.push(Event::SlotBlockSet {
                    date: guard.date,
                    time: *time,
                    blocked: true,
                });
            }
            for booking in &guard.bookings {
                events.push(Event::BookingCreated {
                    booking: booking.clone(),
                });
            }
        }
        let count = events.len();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        info!("WAL compacted to {count} events");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// Whether an edit changes what the per-citizen checks look at: the tax id,
/// or which side of the neighbor quota the postal code falls on.
fn changes_identity(config: &ScheduleConfig, before: &Citizen, after: &Citizen) -> bool {
    before.tax_id != after.tax_id
        || config.is_local_postal_code(&before.postal_code)
            != config.is_local_postal_code(&after.postal_code)
}

/// The request the booking would have been created with if the patch had
/// been part of it. `has_tax_id = false` without a new tax id clears it.
fn merged_request(current: &Booking, patch: &BookingPatch) -> BookingRequest {
    let c = &current.citizen;
    let tax_id = match (&patch.tax_id, patch.has_tax_id) {
        (Some(t), _) => Some(t.clone()),
        (None, Some(false)) => None,
        (None, _) => c.tax_id.clone(),
    };
    BookingRequest {
        service: patch.service.unwrap_or(current.service),
        description: patch
            .description
            .clone()
            .or_else(|| current.description.clone()),
        date: patch.date.unwrap_or(current.date),
        slot: patch.slot.unwrap_or(current.slot),
        name: patch.name.clone().unwrap_or_else(|| c.name.clone()),
        phone: patch.phone.clone().unwrap_or_else(|| c.phone.clone()),
        has_tax_id: patch.has_tax_id.unwrap_or(c.has_tax_id),
        tax_id,
        postal_code: Some(
            patch
                .postal_code
                .clone()
                .unwrap_or_else(|| c.postal_code.clone()),
        ),
        email: patch.email.clone().or_else(|| c.email.clone()),
    }
}
