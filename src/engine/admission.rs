//! Booking admission rules, checked in a fixed order; the first failure wins.
//!
//! Everything here is pure. The engine calls `check_day` while holding the
//! day's write lock, so the counts it sees are the counts it commits against.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use ulid::Ulid;

use crate::config::ScheduleConfig;
use crate::limits::*;
use crate::model::*;

use super::availability::is_open;
use super::lifecycle::effective_status;
use super::store::DayState;
use super::EngineError;

/// Request fields after digits-only normalization and trimming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Normalized {
    pub citizen: Citizen,
    pub description: Option<String>,
}

/// Well-formedness. Postal code first, then the remaining citizen fields,
/// then service-specific requirements and length limits.
pub fn validate_request(req: &BookingRequest) -> Result<Normalized, EngineError> {
    let raw_postal = req.postal_code.as_deref().unwrap_or_default();
    let postal_code = digits_only(raw_postal);
    if postal_code.len() != 8 {
        return Err(EngineError::InvalidPostalCode(raw_postal.to_string()));
    }

    let name = req.name.trim();
    if name.is_empty() {
        return Err(EngineError::InvalidName);
    }

    let phone = digits_only(&req.phone);
    if !(10..=11).contains(&phone.len()) {
        return Err(EngineError::InvalidPhone(req.phone.clone()));
    }

    let tax_id = req
        .tax_id
        .as_deref()
        .map(digits_only)
        .filter(|t| !t.is_empty());
    if req.has_tax_id || tax_id.is_some() {
        match &tax_id {
            Some(t) if is_valid_cpf(t) => {}
            _ => {
                return Err(EngineError::InvalidTaxId(
                    req.tax_id.clone().unwrap_or_default(),
                ))
            }
        }
    }

    let description = non_blank(req.description.as_deref());
    if req.service.requires_description() && description.is_none() {
        return Err(EngineError::MissingDescription);
    }

    let email = non_blank(req.email.as_deref());
    if name.len() > MAX_NAME_LEN {
        return Err(EngineError::LimitExceeded("name too long"));
    }
    if description.as_ref().is_some_and(|d| d.len() > MAX_DESCRIPTION_LEN) {
        return Err(EngineError::LimitExceeded("description too long"));
    }
    if email.as_ref().is_some_and(|e| e.len() > MAX_EMAIL_LEN) {
        return Err(EngineError::LimitExceeded("email too long"));
    }

    Ok(Normalized {
        citizen: Citizen {
            name: name.to_string(),
            phone,
            has_tax_id: tax_id.is_some(),
            tax_id,
            postal_code,
            email,
        },
        description,
    })
}

fn non_blank(s: Option<&str>) -> Option<String> {
    s.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}

/// Brazilian CPF: 11 digits, not all equal, two mod-11 check digits.
pub fn is_valid_cpf(digits: &str) -> bool {
    let d: Vec<u32> = digits.chars().filter_map(|c| c.to_digit(10)).collect();
    if d.len() != 11 || digits.len() != 11 || d.iter().all(|&x| x == d[0]) {
        return false;
    }
    let check = |len: usize| {
        let sum: u32 = d[..len]
            .iter()
            .enumerate()
            .map(|(i, &x)| x * (len as u32 + 1 - i as u32))
            .sum();
        (sum * 10 % 11) % 10
    };
    check(9) == d[9] && check(10) == d[10]
}

pub fn check_not_past(
    date: NaiveDate,
    slot: NaiveTime,
    now: NaiveDateTime,
) -> Result<(), EngineError> {
    if date.and_time(slot) < now {
        return Err(EngineError::PastDateTime(date, slot));
    }
    Ok(())
}

/// Locality quota, duplicate booking and open slot, against the locked day.
/// `exclude` is the booking being rescheduled, if any.
pub fn check_day(
    config: &ScheduleConfig,
    day: &DayState,
    slots: &[NaiveTime],
    citizen: &Citizen,
    slot: NaiveTime,
    now: NaiveDateTime,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    check_citizen(config, day, citizen, now, exclude)?;

    if !slots.contains(&slot) {
        return Err(EngineError::SlotNotOffered(day.date, slot));
    }
    if !is_open(day, slot, exclude) {
        return Err(EngineError::SlotTaken(day.date, slot));
    }
    Ok(())
}

/// The per-citizen half of `check_day`: neighbor quota, then one scheduled
/// booking per tax id and day. Also run on in-place edits that change who
/// the booking is for.
pub fn check_citizen(
    config: &ScheduleConfig,
    day: &DayState,
    citizen: &Citizen,
    now: NaiveDateTime,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    let scheduled = day
        .bookings
        .iter()
        .filter(|b| Some(b.id) != exclude && effective_status(b, now) == Status::Scheduled);

    if !config.is_local_postal_code(&citizen.postal_code) {
        let neighbors = scheduled
            .clone()
            .filter(|b| !config.is_local_postal_code(&b.citizen.postal_code))
            .count();
        if neighbors >= config.neighbor_quota {
            return Err(EngineError::NeighborQuotaExceeded {
                date: day.date,
                quota: config.neighbor_quota,
            });
        }
    }

    if let Some(tax_id) = citizen.tax_id.as_deref()
        && scheduled.clone().any(|b| b.tax_id() == Some(tax_id))
    {
        return Err(EngineError::DuplicateBooking(day.date));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn monday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2030, 3, 4).unwrap()
    }

    fn request() -> BookingRequest {
        BookingRequest {
            service: ServiceKind::IdentityCard,
            description: None,
            date: monday(),
            slot: hm(8, 0),
            name: "  Maria Silva ".into(),
            phone: "(88) 99999-0000".into(),
            tax_id: Some("529.982.247-25".into()),
            has_tax_id: true,
            postal_code: Some("62955-000".into()),
            email: Some("".into()),
        }
    }

    fn booking(slot: NaiveTime, postal: &str, tax_id: Option<&str>, status: Status) -> Booking {
        Booking {
            id: Ulid::new(),
            protocol: String::new(),
            service: ServiceKind::Enlistment,
            description: None,
            date: monday(),
            slot,
            citizen: Citizen {
                name: "x".into(),
                phone: "8899999000".into(),
                tax_id: tax_id.map(str::to_string),
                has_tax_id: tax_id.is_some(),
                postal_code: postal.into(),
                email: None,
            },
            status,
            rating: None,
            feedback: None,
            notes: None,
            created_at: Utc::now(),
        }
    }

    fn early_now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2030, 3, 1)
            .unwrap()
            .and_time(hm(12, 0))
    }

    fn slots() -> Vec<NaiveTime> {
        vec![hm(8, 0), hm(8, 20), hm(8, 40), hm(9, 0)]
    }

    #[test]
    fn normalizes_fields() {
        let n = validate_request(&request()).unwrap();
        assert_eq!(n.citizen.name, "Maria Silva");
        assert_eq!(n.citizen.phone, "88999990000");
        assert_eq!(n.citizen.tax_id.as_deref(), Some("52998224725"));
        assert_eq!(n.citizen.postal_code, "62955000");
        assert_eq!(n.citizen.email, None);
        assert!(n.citizen.has_tax_id);
    }

    #[test]
    fn postal_code_is_checked_first() {
        let req = BookingRequest {
            postal_code: Some("1234".into()),
            name: " ".into(),
            phone: "1".into(),
            ..request()
        };
        let err = validate_request(&req).unwrap_err();
        assert_eq!(err.code(), "INVALID_POSTAL_CODE");

        let missing = BookingRequest {
            postal_code: None,
            ..request()
        };
        assert_eq!(validate_request(&missing).unwrap_err().code(), "INVALID_POSTAL_CODE");
    }

    #[test]
    fn field_errors_in_order() {
        let blank = BookingRequest {
            name: "   ".into(),
            ..request()
        };
        assert_eq!(validate_request(&blank).unwrap_err().code(), "INVALID_NAME");

        let phone = BookingRequest {
            phone: "99999-000".into(),
            ..request()
        };
        assert_eq!(validate_request(&phone).unwrap_err().code(), "INVALID_PHONE");

        let cpf = BookingRequest {
            tax_id: Some("123.456.789-00".into()),
            ..request()
        };
        assert_eq!(validate_request(&cpf).unwrap_err().code(), "INVALID_TAX_ID");

        let other = BookingRequest {
            service: ServiceKind::Other,
            description: Some("  ".into()),
            ..request()
        };
        assert_eq!(validate_request(&other).unwrap_err().code(), "MISSING_DESCRIPTION");

        let long = BookingRequest {
            name: "x".repeat(MAX_NAME_LEN + 1),
            ..request()
        };
        assert_eq!(validate_request(&long).unwrap_err().code(), "LIMIT_EXCEEDED");
    }

    #[test]
    fn citizen_without_tax_id() {
        let req = BookingRequest {
            tax_id: None,
            has_tax_id: false,
            ..request()
        };
        let n = validate_request(&req).unwrap();
        assert_eq!(n.citizen.tax_id, None);
        assert!(!n.citizen.has_tax_id);

        let claims_one = BookingRequest {
            tax_id: None,
            has_tax_id: true,
            ..request()
        };
        assert_eq!(validate_request(&claims_one).unwrap_err().code(), "INVALID_TAX_ID");
    }

    #[test]
    fn cpf_check_digits() {
        for ok in ["52998224725", "11144477735", "12345678909", "39053344705", "98765432100"] {
            assert!(is_valid_cpf(ok), "{ok}");
        }
        for bad in ["12345678900", "11111111111", "5299822472", "529982247250", "5299822472a"] {
            assert!(!is_valid_cpf(bad), "{bad}");
        }
    }

    #[test]
    fn past_is_strict() {
        let now = monday().and_time(hm(8, 0));
        assert!(check_not_past(monday(), hm(8, 0), now).is_ok());
        let err = check_not_past(monday(), hm(7, 40), now).unwrap_err();
        assert_eq!(err.code(), "PAST_DATETIME");
    }

    #[test]
    fn neighbor_quota_counts_only_scheduled_non_local() {
        let config = ScheduleConfig::default();
        let neighbor = validate_request(&BookingRequest {
            postal_code: Some("62900000".into()),
            tax_id: None,
            has_tax_id: false,
            ..request()
        })
        .unwrap()
        .citizen;

        let mut day = DayState::new(monday());
        day.bookings.push(booking(hm(8, 0), "62900000", None, Status::Scheduled));
        day.bookings.push(booking(hm(8, 20), "62900001", None, Status::Cancelled));
        day.bookings.push(booking(hm(8, 40), "62955000", None, Status::Scheduled));
        assert!(check_day(&config, &day, &slots(), &neighbor, hm(9, 0), early_now(), None).is_ok());

        day.bookings.push(booking(hm(8, 20), "62900002", None, Status::Scheduled));
        let err = check_day(&config, &day, &slots(), &neighbor, hm(9, 0), early_now(), None)
            .unwrap_err();
        assert_eq!(err.code(), "NEIGHBOR_QUOTA_EXCEEDED");

        let local = validate_request(&request()).unwrap().citizen;
        assert!(check_day(&config, &day, &slots(), &local, hm(9, 0), early_now(), None).is_ok());
    }

    #[test]
    fn elapsed_bookings_do_not_count() {
        let config = ScheduleConfig::default();
        let neighbor = validate_request(&BookingRequest {
            postal_code: Some("62900000".into()),
            ..request()
        })
        .unwrap()
        .citizen;
        let mut day = DayState::new(monday());
        day.bookings.push(booking(hm(8, 0), "62900000", Some("52998224725"), Status::Scheduled));
        day.bookings.push(booking(hm(8, 20), "62900000", None, Status::Scheduled));

        // 08:30: both are effectively completed.
        let now = monday().and_time(hm(8, 30));
        assert!(check_day(&config, &day, &slots(), &neighbor, hm(9, 0), now, None).is_ok());
    }

    #[test]
    fn duplicate_and_slot_checks() {
        let config = ScheduleConfig::default();
        let citizen = validate_request(&request()).unwrap().citizen;
        let mut day = DayState::new(monday());
        let mine = booking(hm(8, 0), "62955000", Some("52998224725"), Status::Scheduled);
        let mine_id = mine.id;
        day.bookings.push(mine);

        let err = check_day(&config, &day, &slots(), &citizen, hm(8, 40), early_now(), None)
            .unwrap_err();
        assert_eq!(err.code(), "DUPLICATE_BOOKING");

        // Rescheduling the same booking onto its own slot is fine.
        assert!(
            check_day(&config, &day, &slots(), &citizen, hm(8, 0), early_now(), Some(mine_id))
                .is_ok()
        );

        let other = validate_request(&BookingRequest {
            tax_id: Some("11144477735".into()),
            ..request()
        })
        .unwrap()
        .citizen;
        let err = check_day(&config, &day, &slots(), &other, hm(8, 0), early_now(), None)
            .unwrap_err();
        assert_eq!(err.code(), "SLOT_TAKEN");

        let err = check_day(&config, &day, &slots(), &other, hm(8, 10), early_now(), None)
            .unwrap_err();
        assert_eq!(err.code(), "SLOT_NOT_OFFERED");

        day.blocked_slots.insert(hm(8, 20));
        let err = check_day(&config, &day, &slots(), &other, hm(8, 20), early_now(), None)
            .unwrap_err();
        assert_eq!(err.code(), "SLOT_TAKEN");
    }

    #[test]
    fn citizen_checks_ignore_the_slot() {
        let config = ScheduleConfig::default();
        let mut day = DayState::new(monday());
        let mine = booking(hm(8, 0), "62955000", Some("11144477735"), Status::Scheduled);
        let mine_id = mine.id;
        day.bookings.push(mine);
        day.bookings.push(booking(hm(8, 20), "62955000", Some("52998224725"), Status::Scheduled));

        // Taking over another booking's tax id on the same day.
        let citizen = validate_request(&request()).unwrap().citizen;
        let err = check_citizen(&config, &day, &citizen, early_now(), Some(mine_id)).unwrap_err();
        assert_eq!(err.code(), "DUPLICATE_BOOKING");

        day.bookings.push(booking(hm(8, 40), "62900000", None, Status::Scheduled));
        day.bookings.push(booking(hm(9, 0), "62900001", None, Status::Scheduled));
        let neighbor = validate_request(&BookingRequest {
            postal_code: Some("62900-000".into()),
            tax_id: None,
            has_tax_id: false,
            ..request()
        })
        .unwrap()
        .citizen;
        let err = check_citizen(&config, &day, &neighbor, early_now(), Some(mine_id)).unwrap_err();
        assert_eq!(err.code(), "NEIGHBOR_QUOTA_EXCEEDED");
    }
}
