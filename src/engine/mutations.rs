use chrono::{DateTime, Utc};
use tokio::sync::oneshot;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::policy::validate_submission;
use super::{Engine, EngineError, WalCommand};

impl Engine {
    /// The booking decision rule.
    ///
    /// Under the identity's write lock: if the requester already has a future
    /// booking (date strictly after `now`'s date), overwrite it in place and
    /// return `Action::Updated`; otherwise insert a fresh record and return
    /// `Action::Created`. Exactly one store mutation either way.
    ///
    /// `now` is the reference instant for the future/past comparison. It is
    /// always passed in — the rule never reads the system clock itself.
    pub async fn submit_booking(
        &self,
        req: SubmitRequest,
        now: DateTime<Utc>,
    ) -> Result<(Booking, Action), EngineError> {
        let today = now.date_naive();
        validate_submission(&req, today)?;

        let key = identity_key(&req.email);
        let ident = self.identity_entry(&key)?;

        // Lock held across lookup and write: two concurrent submits for the
        // same email serialize here, so the loser observes the winner's insert.
        let mut guard = ident.write().await;

        let now_ms = now.timestamp_millis();

        if let Some(existing) = guard.future_booking(today) {
            let updated = Booking {
                id: existing.id,
                email: existing.email.clone(),
                name: req.name,
                booking_date: req.booking_date,
                booking_time: req.booking_time,
                description: req.description,
                created_at: existing.created_at,
                updated_at: now_ms,
            };
            let event = Event::BookingUpdated {
                id: updated.id,
                email: updated.email.clone(),
                name: updated.name.clone(),
                booking_date: updated.booking_date,
                booking_time: updated.booking_time,
                description: updated.description.clone(),
                updated_at: now_ms,
            };
            self.persist_and_apply(&mut guard, &event).await?;
            Ok((updated, Action::Updated))
        } else {
            if guard.bookings.len() >= MAX_BOOKINGS_PER_IDENTITY {
                return Err(EngineError::LimitExceeded("too many bookings for identity"));
            }
            let booking = Booking {
                id: Ulid::new(),
                email: req.email.trim().to_string(),
                name: req.name,
                booking_date: req.booking_date,
                booking_time: req.booking_time,
                description: req.description,
                created_at: now_ms,
                updated_at: now_ms,
            };
            let event = Event::BookingCreated {
                id: booking.id,
                email: booking.email.clone(),
                name: booking.name.clone(),
                booking_date: booking.booking_date,
                booking_time: booking.booking_time,
                description: booking.description.clone(),
                created_at: now_ms,
            };
            self.persist_and_apply(&mut guard, &event).await?;
            Ok((booking, Action::Created))
        }
    }

    /// Insert a fully-formed record, bypassing the decision rule. This is the
    /// store's raw insert — what an operator poking the database directly
    /// would do. `updated_at` starts equal to `created_at`.
    pub async fn insert_booking(&self, booking: Booking) -> Result<(), EngineError> {
        super::policy::validate_email(&booking.email)?;
        if self.booking_to_identity.contains_key(&booking.id) {
            return Err(EngineError::AlreadyExists(booking.id));
        }

        let key = identity_key(&booking.email);
        let ident = self.identity_entry(&key)?;
        let mut guard = ident.write().await;
        if guard.bookings.len() >= MAX_BOOKINGS_PER_IDENTITY {
            return Err(EngineError::LimitExceeded("too many bookings for identity"));
        }

        let event = Event::BookingCreated {
            id: booking.id,
            email: booking.email.trim().to_string(),
            name: booking.name,
            booking_date: booking.booking_date,
            booking_time: booking.booking_time,
            description: booking.description,
            created_at: booking.created_at,
        };
        self.persist_and_apply(&mut guard, &event).await
    }

    /// Record survey answers for an existing booking. At most one survey per
    /// booking; a second submission is rejected as a conflict.
    pub async fn record_survey(
        &self,
        req: SurveyRequest,
        now: DateTime<Utc>,
    ) -> Result<Survey, EngineError> {
        super::policy::validate_survey(&req)?;

        let key = self
            .get_identity_for_booking(&req.booking_id)
            .ok_or(EngineError::NotFound(req.booking_id))?;
        let ident = self
            .get_identity(&key)
            .ok_or(EngineError::NotFound(req.booking_id))?;

        // The identity lock serializes concurrent surveys for one booking.
        let _guard = ident.write().await;

        if self.surveys.contains_key(&req.booking_id) {
            return Err(EngineError::AlreadyExists(req.booking_id));
        }

        let survey = Survey {
            id: Ulid::new(),
            booking_id: req.booking_id,
            role: req.role,
            cloud_usage: req.cloud_usage,
            development_approach: req.development_approach,
            team_size: req.team_size,
            primary_goals: req.primary_goals,
            other_goal: req.other_goal,
            created_at: now.timestamp_millis(),
        };
        let event = Event::SurveyRecorded {
            survey: survey.clone(),
        };
        self.wal_append(&event).await?;
        self.surveys.insert(survey.booking_id, survey.clone());
        Ok(survey)
    }

    /// Compact the WAL: rewrite it with only the events needed to recreate
    /// the current state — one creation per live booking, plus an update when
    /// the record has been mutated since creation, plus one event per survey.
    ///
    /// Runs in three phases so nothing appended while the snapshot is being
    /// collected can be lost: the writer opens a compaction window first and
    /// replays everything it logged during the window on top of the snapshot.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        self.compact_begin().await?;
        let events = self.snapshot_events().await;
        self.compact_finish(events).await
    }

    pub(super) async fn compact_begin(&self) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::CompactBegin { response: tx })
            .await
            .map_err(|_| EngineError::Unavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Unavailable("WAL writer dropped response".into()))
    }

    pub(super) async fn snapshot_events(&self) -> Vec<Event> {
        let mut events = Vec::new();

        let keys: Vec<String> = self.identities.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            let Some(ident) = self.get_identity(&key) else {
                continue;
            };
            let guard = ident.read().await;
            for b in &guard.bookings {
                events.push(Event::BookingCreated {
                    id: b.id,
                    email: b.email.clone(),
                    name: b.name.clone(),
                    booking_date: b.booking_date,
                    booking_time: b.booking_time,
                    description: b.description.clone(),
                    created_at: b.created_at,
                });
                if b.updated_at != b.created_at {
                    events.push(Event::BookingUpdated {
                        id: b.id,
                        email: b.email.clone(),
                        name: b.name.clone(),
                        booking_date: b.booking_date,
                        booking_time: b.booking_time,
                        description: b.description.clone(),
                        updated_at: b.updated_at,
                    });
                }
            }
        }

        for entry in self.surveys.iter() {
            events.push(Event::SurveyRecorded {
                survey: entry.value().clone(),
            });
        }

        events
    }

    pub(super) async fn compact_finish(&self, events: Vec<Event>) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::CompactFinish { events, response: tx })
            .await
            .map_err(|_| EngineError::Unavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Unavailable("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Unavailable(e.to_string()))
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
