use std::cmp::Reverse;

use chrono::{NaiveDate, NaiveTime};
use ulid::Ulid;

use crate::calendar;
use crate::model::*;

use super::availability::resolve;
use super::lifecycle::{effective_status, evaluate};
use super::Engine;

impl Engine {
    /// Every calendar slot of `date`, in order, with its availability.
    pub async fn availability(&self, date: NaiveDate) -> Vec<SlotAvailability> {
        let slots = calendar::slots_for_date(&self.config, date);
        if slots.is_empty() {
            return Vec::new();
        }
        match self.store.get_day(&date) {
            Some(day) => {
                let guard = day.read().await;
                resolve(&slots, Some(&*guard))
            }
            None => resolve(&slots, None),
        }
    }

    pub async fn is_day_blocked(&self, date: NaiveDate) -> bool {
        match self.store.get_day(&date) {
            Some(day) => day.read().await.day_blocked,
            None => false,
        }
    }

    pub async fn is_slot_blocked(&self, date: NaiveDate, time: NaiveTime) -> bool {
        match self.store.get_day(&date) {
            Some(day) => day.read().await.blocked_slots.contains(&time),
            None => false,
        }
    }

    /// Bookings matching `filter`, latest appointment first, with the
    /// lifecycle applied.
    pub async fn list_bookings(&self, filter: &BookingFilter) -> Vec<Booking> {
        let tax_id = match filter {
            BookingFilter::All => None,
            BookingFilter::TaxId(raw) => {
                let digits = digits_only(raw);
                if digits.is_empty() {
                    return Vec::new();
                }
                Some(digits)
            }
        };
        let now = self.local_now();
        let mut out = Vec::new();
        for day in self.store.days() {
            let guard = day.read().await;
            out.extend(
                guard
                    .bookings
                    .iter()
                    .filter(|b| tax_id.is_none() || b.tax_id() == tax_id.as_deref())
                    .map(|b| evaluate(b.clone(), now)),
            );
        }
        out.sort_by_key(|b| Reverse((b.date, b.slot, b.created_at)));
        out
    }

    pub async fn get_booking(&self, id: Ulid) -> Option<Booking> {
        let date = self.store.date_of(&id)?;
        let day = self.store.get_day(&date)?;
        let guard = day.read().await;
        guard
            .booking(&id)
            .map(|b| evaluate(b.clone(), self.local_now()))
    }

    /// Protocols are not unique, so this can return more than one booking.
    pub async fn find_by_protocol(&self, protocol: &str) -> Vec<Booking> {
        let protocol = protocol.trim();
        if !crate::protocol::is_well_formed(protocol) {
            return Vec::new();
        }
        // The protocol starts with the booking date, so only that day can match.
        let Some(date) = NaiveDate::parse_from_str(&protocol[..8], "%Y%m%d").ok() else {
            return Vec::new();
        };
        let Some(day) = self.store.get_day(&date) else {
            return Vec::new();
        };
        let now = self.local_now();
        let guard = day.read().await;
        guard
            .bookings
            .iter()
            .filter(|b| b.protocol == protocol)
            .map(|b| evaluate(b.clone(), now))
            .collect()
    }

    pub async fn blocked_dates(&self) -> Vec<NaiveDate> {
        let mut out = Vec::new();
        for day in self.store.days() {
            let guard = day.read().await;
            if guard.day_blocked {
                out.push(guard.date);
            }
        }
        out
    }

    pub async fn blocked_slots(&self) -> Vec<(NaiveDate, NaiveTime)> {
        let mut out = Vec::new();
        for day in self.store.days() {
            let guard = day.read().await;
            out.extend(guard.blocked_slots.iter().map(|t| (guard.date, *t)));
        }
        out
    }

    /// Dashboard figures over every booking ever made.
    pub async fn summary(&self) -> Summary {
        let now = self.local_now();
        let today = now.date();
        let mut total = 0;
        let mut active = 0;
        let mut today_count = 0;
        let mut by_service: Vec<(ServiceKind, usize)> =
            ServiceKind::ALL.iter().map(|k| (*k, 0)).collect();
        let mut rating_sum = 0u64;
        let mut rated = 0u64;

        for day in self.store.days() {
            let guard = day.read().await;
            for b in &guard.bookings {
                total += 1;
                if effective_status(b, now) == Status::Scheduled {
                    active += 1;
                    if b.date == today {
                        today_count += 1;
                    }
                }
                if let Some(entry) = by_service.iter_mut().find(|(k, _)| *k == b.service) {
                    entry.1 += 1;
                }
                if let Some(r) = b.rating {
                    rating_sum += u64::from(r);
                    rated += 1;
                }
            }
        }

        Summary {
            total,
            active,
            today: today_count,
            by_service,
            average_rating: (rated > 0).then(|| rating_sum as f64 / rated as f64),
        }
    }
}
