use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds — the only timestamp type.
pub type Ms = i64;

/// Which branch of the decision rule executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Created,
    Updated,
}

/// A booking record. `id` and `created_at` are immutable for the record's
/// lifetime; everything else may change on update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub email: String,
    pub name: String,
    pub booking_date: NaiveDate,
    pub booking_time: NaiveTime,
    pub description: Option<String>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Booking {
    /// A booking is future iff its date is strictly after `today`.
    /// Same-day bookings are NOT future.
    pub fn is_future(&self, today: NaiveDate) -> bool {
        self.booking_date > today
    }
}

/// Identity key: emails compare case-insensitively.
pub fn identity_key(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

/// What a submit request carries. Dates and times are already parsed;
/// the wire layer owns the string formats.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitRequest {
    pub email: String,
    pub name: String,
    pub booking_date: NaiveDate,
    pub booking_time: NaiveTime,
    pub description: Option<String>,
}

/// All bookings sharing one identity key, sorted by
/// `(booking_date, booking_time, id)`.
#[derive(Debug, Clone)]
pub struct IdentityState {
    pub key: String,
    pub bookings: Vec<Booking>,
}

impl IdentityState {
    pub fn new(key: String) -> Self {
        Self {
            key,
            bookings: Vec::new(),
        }
    }

    fn sort_key(b: &Booking) -> (NaiveDate, NaiveTime, Ulid) {
        (b.booking_date, b.booking_time, b.id)
    }

    /// Insert a booking maintaining sort order.
    pub fn insert_booking(&mut self, booking: Booking) {
        let key = Self::sort_key(&booking);
        let pos = self
            .bookings
            .binary_search_by_key(&key, Self::sort_key)
            .unwrap_or_else(|e| e);
        self.bookings.insert(pos, booking);
    }

    /// Remove a booking by id.
    pub fn remove_booking(&mut self, id: Ulid) -> Option<Booking> {
        if let Some(pos) = self.bookings.iter().position(|b| b.id == id) {
            Some(self.bookings.remove(pos))
        } else {
            None
        }
    }

    pub fn get(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    /// The identity's future booking relative to `today`, if any.
    ///
    /// Tie-break when several exist: the sort order makes this the booking
    /// with the earliest date, then earliest time, then lowest id.
    pub fn future_booking(&self, today: NaiveDate) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.is_future(today))
    }
}

/// Post-booking questionnaire answers. At most one per booking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Survey {
    pub id: Ulid,
    pub booking_id: Ulid,
    pub role: Vec<String>,
    pub cloud_usage: Vec<String>,
    pub development_approach: Vec<String>,
    pub team_size: Vec<String>,
    pub primary_goals: Vec<String>,
    pub other_goal: Option<String>,
    pub created_at: Ms,
}

/// What a survey submission carries. All answer lists may be empty.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SurveyRequest {
    pub booking_id: Ulid,
    pub role: Vec<String>,
    pub cloud_usage: Vec<String>,
    pub development_approach: Vec<String>,
    pub team_size: Vec<String>,
    pub primary_goals: Vec<String>,
    pub other_goal: Option<String>,
}

/// The event types. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BookingCreated {
        id: Ulid,
        email: String,
        name: String,
        booking_date: NaiveDate,
        booking_time: NaiveTime,
        description: Option<String>,
        created_at: Ms,
    },
    BookingUpdated {
        id: Ulid,
        email: String,
        name: String,
        booking_date: NaiveDate,
        booking_time: NaiveTime,
        description: Option<String>,
        updated_at: Ms,
    },
    SurveyRecorded {
        survey: Survey,
    },
}

impl Event {
    /// Identity key the event belongs to. Survey events are keyed by
    /// booking id, not identity.
    pub fn identity(&self) -> Option<String> {
        match self {
            Event::BookingCreated { email, .. } | Event::BookingUpdated { email, .. } => {
                Some(identity_key(email))
            }
            Event::SurveyRecorded { .. } => None,
        }
    }

    pub fn booking_id(&self) -> Ulid {
        match self {
            Event::BookingCreated { id, .. } | Event::BookingUpdated { id, .. } => *id,
            Event::SurveyRecorded { survey } => survey.booking_id,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

/// Availability grid for one calendar day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotBoard {
    pub date: NaiveDate,
    pub available_slots: Vec<NaiveTime>,
    pub booked_slots: Vec<NaiveTime>,
}
