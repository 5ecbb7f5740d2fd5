use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::policy::day_slot_grid;
use super::Engine;

impl Engine {
    pub async fn get_booking(&self, id: Ulid) -> Option<Booking> {
        let key = self.get_identity_for_booking(&id)?;
        let ident = self.get_identity(&key)?;
        let guard = ident.read().await;
        guard.get(id).cloned()
    }

    /// All bookings for an identity, sorted by date then time.
    pub async fn list_bookings(&self, email: &str) -> Vec<Booking> {
        let key = identity_key(email);
        let Some(ident) = self.get_identity(&key) else {
            return Vec::new();
        };
        let guard = ident.read().await;
        guard.bookings.clone()
    }

    /// The store lookup the decision rule is built on: the identity's future
    /// booking relative to `today`, or None when only past/same-day bookings
    /// (or none at all) exist.
    pub async fn find_future_by_email(&self, email: &str, today: NaiveDate) -> Option<Booking> {
        let key = identity_key(email);
        let ident = self.get_identity(&key)?;
        let guard = ident.read().await;
        guard.future_booking(today).cloned()
    }

    /// The day's slot grid split into free and taken times.
    pub async fn day_slots(&self, date: NaiveDate) -> SlotBoard {
        let mut booked = Vec::new();

        let keys: Vec<String> = self.identities.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            let Some(ident) = self.get_identity(&key) else {
                continue;
            };
            let guard = ident.read().await;
            for b in &guard.bookings {
                if b.booking_date == date {
                    booked.push(b.booking_time);
                }
            }
        }
        booked.sort();
        booked.dedup();

        let available = day_slot_grid()
            .into_iter()
            .filter(|slot| !booked.contains(slot))
            .collect();

        SlotBoard {
            date,
            available_slots: available,
            booked_slots: booked,
        }
    }

    pub fn get_survey(&self, booking_id: Ulid) -> Option<Survey> {
        self.surveys.get(&booking_id).map(|e| e.value().clone())
    }

    pub fn identity_count(&self) -> usize {
        self.identities.len()
    }
}
