//! Booking state machine.
//!
//! `scheduled` becomes `completed` on its own once the slot start has passed;
//! the transition is derived on every read and only later persisted by the
//! reconciler. `cancelled` is reached by an explicit request.

use chrono::{Duration, NaiveDateTime};

use crate::model::{Actor, Booking, Status};

use super::EngineError;

pub fn effective_status(booking: &Booking, now: NaiveDateTime) -> Status {
    match booking.status {
        Status::Scheduled if now > booking.starts_at() => Status::Completed,
        status => status,
    }
}

/// The booking as a reader should see it.
pub fn evaluate(mut booking: Booking, now: NaiveDateTime) -> Booking {
    booking.status = effective_status(&booking, now);
    booking
}

/// Citizens must cancel at least `lead` before the slot; admins any time.
/// The window is checked before the status.
pub fn check_cancel(
    booking: &Booking,
    actor: Actor,
    now: NaiveDateTime,
    lead: Duration,
) -> Result<(), EngineError> {
    if actor == Actor::Citizen && booking.starts_at() - now < lead {
        return Err(EngineError::CancellationWindowExpired {
            hours: lead.num_hours(),
        });
    }
    match effective_status(booking, now) {
        Status::Scheduled => Ok(()),
        from => Err(EngineError::InvalidTransition {
            from,
            to: Status::Cancelled,
        }),
    }
}

/// Returns the status the booking has after the rating is attached.
pub fn check_rating(
    booking: &Booking,
    rating: i64,
    now: NaiveDateTime,
) -> Result<Status, EngineError> {
    if !(1..=5).contains(&rating) {
        return Err(EngineError::InvalidRating(rating));
    }
    if booking.rating.is_some() {
        return Err(EngineError::AlreadyRated(booking.id));
    }
    match effective_status(booking, now) {
        Status::Cancelled => Err(EngineError::InvalidTransition {
            from: Status::Cancelled,
            to: Status::Completed,
        }),
        Status::Scheduled | Status::Completed => Ok(Status::Completed),
    }
}
