use chrono::{NaiveDate, NaiveTime};

/// Human-facing booking reference: `YYYYMMDDHHMM-NNNN`.
///
/// The suffix is random in 1000..=9999. Collisions are possible and harmless;
/// bookings are identified by their ULID.
pub fn generate(date: NaiveDate, slot: NaiveTime) -> String {
    let suffix = 1000 + rand::random::<u32>() % 9000;
    format!("{}{}-{suffix}", date.format("%Y%m%d"), slot.format("%H%M"))
}

/// Shape check used by lookups; says nothing about whether the booking exists.
pub fn is_well_formed(protocol: &str) -> bool {
    let Some((stamp, suffix)) = protocol.split_once('-') else {
        return false;
    };
    stamp.len() == 12
        && stamp.bytes().all(|b| b.is_ascii_digit())
        && suffix.len() == 4
        && suffix.parse::<u32>().is_ok_and(|n| (1000..=9999).contains(&n))
}
