use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{NaiveDate, NaiveTime};
use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::model::*;

pub type SharedDayState = Arc<RwLock<DayState>>;

/// Everything that lives on one calendar day. One lock per day.
#[derive(Debug, Clone)]
pub struct DayState {
    pub date: NaiveDate,
    pub day_blocked: bool,
    pub blocked_slots: BTreeSet<NaiveTime>,
    /// Sorted by slot. Cancelled bookings stay here.
    pub bookings: Vec<Booking>,
}

impl DayState {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            day_blocked: false,
            blocked_slots: BTreeSet::new(),
            bookings: Vec::new(),
        }
    }

    pub fn booking(&self, id: &Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == *id)
    }

    fn booking_mut(&mut self, id: &Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == *id)
    }

    fn insert_booking(&mut self, booking: Booking) {
        let pos = self.bookings.partition_point(|b| b.slot <= booking.slot);
        self.bookings.insert(pos, booking);
    }

    fn remove_booking(&mut self, id: &Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == *id)?;
        Some(self.bookings.remove(pos))
    }

    /// True if a non-cancelled booking other than `exclude` holds `slot`.
    pub fn is_slot_occupied(&self, slot: NaiveTime, exclude: Option<Ulid>) -> bool {
        self.bookings.iter().any(|b| {
            b.slot == slot && b.status != Status::Cancelled && Some(b.id) != exclude
        })
    }
}

/// Day partitions plus the booking id → date index.
pub struct Store {
    days: DashMap<NaiveDate, SharedDayState>,
    booking_dates: DashMap<Ulid, NaiveDate>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Self {
            days: DashMap::new(),
            booking_dates: DashMap::new(),
        }
    }

    pub fn get_day(&self, date: &NaiveDate) -> Option<SharedDayState> {
        self.days.get(date).map(|e| e.value().clone())
    }

    pub fn day_or_insert(&self, date: NaiveDate) -> SharedDayState {
        self.days
            .entry(date)
            .or_insert_with(|| Arc::new(RwLock::new(DayState::new(date))))
            .value()
            .clone()
    }

    /// All partitions in ascending date order.
    pub fn days(&self) -> Vec<SharedDayState> {
        let mut days: Vec<(NaiveDate, SharedDayState)> = self
            .days
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        days.sort_by_key(|(d, _)| *d);
        days.into_iter().map(|(_, s)| s).collect()
    }

    pub fn date_of(&self, id: &Ulid) -> Option<NaiveDate> {
        self.booking_dates.get(id).map(|e| *e.value())
    }

    pub fn booking_count(&self) -> usize {
        self.booking_dates.len()
    }

    // ── Event application ────────────────────────────────────

    /// Apply the part of `event` that concerns `day`. The caller holds the
    /// day's write lock; events spanning several days are applied once per day.
    pub fn apply_to_day(&self, day: &mut DayState, event: &Event) {
        match event {
            Event::BookingCreated { booking } => {
                if booking.date == day.date {
                    self.booking_dates.insert(booking.id, booking.date);
                    day.insert_booking(booking.clone());
                }
            }
            Event::BookingUpdated {
                previous_date,
                booking,
            } => {
                if *previous_date == day.date || booking.date == day.date {
                    day.remove_booking(&booking.id);
                }
                if booking.date == day.date {
                    self.booking_dates.insert(booking.id, booking.date);
                    day.insert_booking(booking.clone());
                }
            }
            Event::BookingStatusChanged { id, status, .. } => {
                if let Some(b) = day.booking_mut(id) {
                    b.status = *status;
                }
            }
            Event::BookingRated {
                id,
                rating,
                feedback,
                status,
                ..
            } => {
                if let Some(b) = day.booking_mut(id) {
                    b.rating = Some(*rating);
                    b.feedback = feedback.clone();
                    b.status = *status;
                }
            }
            Event::DayBlockSet { date, blocked } => {
                if *date == day.date {
                    day.day_blocked = *blocked;
                }
            }
            Event::SlotBlockSet {
                date,
                time,
                blocked,
            } => {
                if *date == day.date {
                    if *blocked {
                        day.blocked_slots.insert(*time);
                    } else {
                        day.blocked_slots.remove(time);
                    }
                }
            }
            Event::MonthBlockSet { dates, blocked } => {
                if dates.contains(&day.date) {
                    day.day_blocked = *blocked;
                }
            }
        }
    }
}
