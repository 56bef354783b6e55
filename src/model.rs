use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Persisted and wire format for calendar days.
pub const DATE_FORMAT: &str = "%Y-%m-%d";
/// Persisted and wire format for slot start times (24h).
pub const TIME_FORMAT: &str = "%H:%M";

pub fn parse_date(s: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(s.trim(), DATE_FORMAT).ok()
}

pub fn parse_time(s: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), TIME_FORMAT).ok()
}

pub fn format_date(d: NaiveDate) -> String {
    d.format(DATE_FORMAT).to_string()
}

pub fn format_time(t: NaiveTime) -> String {
    t.format(TIME_FORMAT).to_string()
}

/// Strip every non-digit character. Phone, tax id and postal code are stored this way.
pub fn digits_only(s: &str) -> String {
    s.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Serde adapter storing a `NaiveTime` as `HH:MM`.
pub mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(t: &NaiveTime, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&super::format_time(*t))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveTime, D::Error> {
        let s = String::deserialize(d)?;
        NaiveTime::parse_from_str(&s, super::TIME_FORMAT).map_err(serde::de::Error::custom)
    }
}

// ── Catalog ──────────────────────────────────────────────────────

/// The services offered at the counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ServiceKind {
    /// Military enlistment.
    Enlistment,
    /// First or second copy of the certificate of dispensation from service.
    DispensationCertificate,
    /// First or second copy of the national identity card.
    IdentityCard,
    /// Anything else; the citizen must describe it.
    Other,
}

impl ServiceKind {
    pub const ALL: [ServiceKind; 4] = [
        ServiceKind::Enlistment,
        ServiceKind::DispensationCertificate,
        ServiceKind::IdentityCard,
        ServiceKind::Other,
    ];

    /// Catalog code shown on forms and receipts.
    pub fn code(self) -> &'static str {
        match self {
            ServiceKind::Enlistment => "1",
            ServiceKind::DispensationCertificate => "2",
            ServiceKind::IdentityCard => "4",
            ServiceKind::Other => "6",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ServiceKind::Enlistment => "enlistment",
            ServiceKind::DispensationCertificate => "dispensation_certificate",
            ServiceKind::IdentityCard => "identity_card",
            ServiceKind::Other => "other",
        }
    }

    pub fn requires_description(self) -> bool {
        matches!(self, ServiceKind::Other)
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ServiceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_lowercase();
        ServiceKind::ALL
            .into_iter()
            .find(|k| k.code() == s || k.name() == s)
            .ok_or_else(|| format!("unknown service: {s}"))
    }
}

// ── Booking ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Scheduled,
    Completed,
    Cancelled,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Status::Scheduled => "scheduled",
            Status::Completed => "completed",
            Status::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who is asking for a cancellation. Only citizens are bound by the lead time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    Citizen,
    Admin,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citizen {
    pub name: String,
    /// Digits only.
    pub phone: String,
    /// Digits only. `None` when the citizen has no tax id.
    pub tax_id: Option<String>,
    pub has_tax_id: bool,
    /// Digits only, always 8 of them.
    pub postal_code: String,
    pub email: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub protocol: String,
    pub service: ServiceKind,
    pub description: Option<String>,
    pub date: NaiveDate,
    #[serde(with = "hhmm")]
    pub slot: NaiveTime,
    pub citizen: Citizen,
    pub status: Status,
    pub rating: Option<u8>,
    pub feedback: Option<String>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Booking {
    /// Local wall-clock start of the appointment.
    pub fn starts_at(&self) -> NaiveDateTime {
        self.date.and_time(self.slot)
    }

    pub fn tax_id(&self) -> Option<&str> {
        self.citizen.tax_id.as_deref().filter(|t| !t.is_empty())
    }
}

/// A citizen's request to book one slot. Free-form fields are normalized during admission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingRequest {
    pub service: ServiceKind,
    pub description: Option<String>,
    pub date: NaiveDate,
    pub slot: NaiveTime,
    pub name: String,
    pub phone: String,
    pub tax_id: Option<String>,
    pub has_tax_id: bool,
    pub postal_code: Option<String>,
    pub email: Option<String>,
}

/// Partial edit of an existing booking. `None` leaves the field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BookingPatch {
    pub service: Option<ServiceKind>,
    pub description: Option<String>,
    pub date: Option<NaiveDate>,
    pub slot: Option<NaiveTime>,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub tax_id: Option<String>,
    pub has_tax_id: Option<bool>,
    pub postal_code: Option<String>,
    pub email: Option<String>,
    pub notes: Option<String>,
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotAvailability {
    pub time: NaiveTime,
    pub available: bool,
}

/// Resulting state after a block toggle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockAction {
    Blocked,
    Unblocked,
}

impl BlockAction {
    pub fn from_blocked(blocked: bool) -> Self {
        if blocked {
            BlockAction::Blocked
        } else {
            BlockAction::Unblocked
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BlockAction::Blocked => "blocked",
            BlockAction::Unblocked => "unblocked",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookingFilter {
    All,
    /// Any formatting is accepted; only the digits are compared.
    TaxId(String),
}

/// Admin dashboard figures.
#[derive(Debug, Clone, PartialEq)]
pub struct Summary {
    pub total: usize,
    /// Effective status `scheduled`.
    pub active: usize,
    /// Effective status `scheduled` on today's local date.
    pub today: usize,
    pub by_service: Vec<(ServiceKind, usize)>,
    pub average_rating: Option<f64>,
}

// ── WAL records ──────────────────────────────────────────────────

/// WAL record format. Flat, no nesting.
/// Block events carry the resulting state, so replaying them is idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BookingCreated {
        booking: Booking,
    },
    /// Full replacement of an edited booking. `previous_date` differs from
    /// `booking.date` when the edit was a reschedule across days.
    BookingUpdated {
        previous_date: NaiveDate,
        booking: Booking,
    },
    BookingStatusChanged {
        id: Ulid,
        date: NaiveDate,
        status: Status,
    },
    BookingRated {
        id: Ulid,
        date: NaiveDate,
        rating: u8,
        feedback: Option<String>,
        status: Status,
    },
    DayBlockSet {
        date: NaiveDate,
        blocked: bool,
    },
    SlotBlockSet {
        date: NaiveDate,
        #[serde(with = "hhmm")]
        time: NaiveTime,
        blocked: bool,
    },
    /// One record for a whole month so a partial month block is never replayed.
    MonthBlockSet {
        dates: Vec<NaiveDate>,
        blocked: bool,
    },
}

impl Event {
    /// Every day partition this event touches.
    pub fn dates(&self) -> Vec<NaiveDate> {
        match self {
            Event::BookingCreated { booking } => vec![booking.date],
            Event::BookingUpdated {
                previous_date,
                booking,
            } => {
                if *previous_date == booking.date {
                    vec![booking.date]
                } else {
                    vec![*previous_date, booking.date]
                }
            }
            Event::BookingStatusChanged { date, .. }
            | Event::BookingRated { date, .. }
            | Event::DayBlockSet { date, .. }
            | Event::SlotBlockSet { date, .. } => vec![*date],
            Event::MonthBlockSet { dates, .. } => dates.clone(),
        }
    }
}
