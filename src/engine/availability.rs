use chrono::NaiveTime;
use ulid::Ulid;

use crate::model::SlotAvailability;

use super::store::DayState;

/// Whether `slot` can take a booking on `day`, ignoring `exclude`'s own
/// occupancy. The caller has already checked that `slot` is on the calendar.
pub fn is_open(day: &DayState, slot: NaiveTime, exclude: Option<Ulid>) -> bool {
    !day.day_blocked
        && !day.is_slot_occupied(slot, exclude)
        && !day.blocked_slots.contains(&slot)
}

/// Merge the day's calendar with its bookings and blocks.
///
/// A day block closes every slot. Otherwise a slot is available when no
/// non-cancelled booking holds it and it is not individually blocked.
/// `None` means nothing was ever recorded for the day.
pub fn resolve(slots: &[NaiveTime], day: Option<&DayState>) -> Vec<SlotAvailability> {
    let Some(day) = day else {
        return slots
            .iter()
            .map(|&time| SlotAvailability {
                time,
                available: true,
            })
            .collect();
    };
    if day.day_blocked {
        return slots
            .iter()
            .map(|&time| SlotAvailability {
                time,
                available: false,
            })
            .collect();
    }
    slots
        .iter()
        .map(|&time| SlotAvailability {
            time,
            available: is_open(day, time, None),
        })
        .collect()
}
