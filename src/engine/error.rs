use chrono::{NaiveDate, NaiveTime};
use ulid::Ulid;

use crate::model::{format_date, format_time, Status};

#[derive(Debug)]
pub enum EngineError {
    InvalidPostalCode(String),
    InvalidName,
    InvalidPhone(String),
    InvalidTaxId(String),
    MissingDescription,
    PastDateTime(NaiveDate, NaiveTime),
    NeighborQuotaExceeded { date: NaiveDate, quota: usize },
    DuplicateBooking(NaiveDate),
    SlotTaken(NaiveDate, NaiveTime),
    SlotNotOffered(NaiveDate, NaiveTime),
    NotFound(String),
    CancellationWindowExpired { hours: i64 },
    AlreadyRated(Ulid),
    InvalidRating(i64),
    InvalidTransition { from: Status, to: Status },
    LimitExceeded(&'static str),
    WalError(String),
}

impl EngineError {
    /// Stable reason code, surfaced verbatim to clients.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidPostalCode(_) => "INVALID_POSTAL_CODE",
            EngineError::InvalidName => "INVALID_NAME",
            EngineError::InvalidPhone(_) => "INVALID_PHONE",
            EngineError::InvalidTaxId(_) => "INVALID_TAX_ID",
            EngineError::MissingDescription => "MISSING_DESCRIPTION",
            EngineError::PastDateTime(..) => "PAST_DATETIME",
            EngineError::NeighborQuotaExceeded { .. } => "NEIGHBOR_QUOTA_EXCEEDED",
            EngineError::DuplicateBooking(_) => "DUPLICATE_BOOKING",
            EngineError::SlotTaken(..) => "SLOT_TAKEN",
            EngineError::SlotNotOffered(..) => "SLOT_NOT_OFFERED",
            EngineError::NotFound(_) => "NOT_FOUND",
            EngineError::CancellationWindowExpired { .. } => "CANCELLATION_WINDOW_EXPIRED",
            EngineError::AlreadyRated(_) => "ALREADY_RATED",
            EngineError::InvalidRating(_) => "INVALID_RATING",
            EngineError::InvalidTransition { .. } => "INVALID_STATUS_TRANSITION",
            EngineError::LimitExceeded(_) => "LIMIT_EXCEEDED",
            EngineError::WalError(_) => "INTERNAL",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: ", self.code())?;
        match self {
            EngineError::InvalidPostalCode(raw) => {
                write!(f, "postal code must have 8 digits, got {raw:?}")
            }
            EngineError::InvalidName => write!(f, "name must not be blank"),
            EngineError::InvalidPhone(raw) => {
                write!(f, "phone must have 10 or 11 digits, got {raw:?}")
            }
            EngineError::InvalidTaxId(raw) => write!(f, "tax id {raw:?} is not a valid CPF"),
            EngineError::MissingDescription => {
                write!(f, "service 'other' requires a description")
            }
            EngineError::PastDateTime(date, slot) => write!(
                f,
                "{} {} is in the past",
                format_date(*date),
                format_time(*slot)
            ),
            EngineError::NeighborQuotaExceeded { date, quota } => write!(
                f,
                "{} already has {quota} bookings from outside the municipality",
                format_date(*date)
            ),
            EngineError::DuplicateBooking(date) => write!(
                f,
                "citizen already has a scheduled booking on {}",
                format_date(*date)
            ),
            EngineError::SlotTaken(date, slot) => write!(
                f,
                "{} {} is no longer available",
                format_date(*date),
                format_time(*slot)
            ),
            EngineError::SlotNotOffered(date, slot) => write!(
                f,
                "{} {} is not a bookable slot",
                format_date(*date),
                format_time(*slot)
            ),
            EngineError::NotFound(what) => write!(f, "not found: {what}"),
            EngineError::CancellationWindowExpired { hours } => write!(
                f,
                "bookings can only be cancelled at least {hours}h in advance"
            ),
            EngineError::AlreadyRated(id) => write!(f, "booking {id} was already rated"),
            EngineError::InvalidRating(r) => write!(f, "rating must be 1-5, got {r}"),
            EngineError::InvalidTransition { from, to } => {
                write!(f, "cannot go from {from} to {to}")
            }
            EngineError::LimitExceeded(msg) => write!(f, "{msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_starts_with_code() {
        let date = NaiveDate::from_ymd_opt(2030, 3, 4).unwrap();
        let err = EngineError::NeighborQuotaExceeded { date, quota: 2 };
        let msg = err.to_string();
        assert!(msg.starts_with("NEIGHBOR_QUOTA_EXCEEDED: "), "{msg}");
        assert!(msg.contains("2030-03-04"));

        let err = EngineError::InvalidTransition {
            from: Status::Cancelled,
            to: Status::Completed,
        };
        assert_eq!(
            err.to_string(),
            "INVALID_STATUS_TRANSITION: cannot go from cancelled to completed"
        );
        assert_eq!(EngineError::WalError("disk".into()).code(), "INTERNAL");
    }
}
