mod error;
mod mutations;
mod policy;
mod queries;

pub use error::EngineError;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::Wal;

pub type SharedIdentityState = Arc<RwLock<IdentityState>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    /// Start a compaction window: the writer records every event appended
    /// from now on so the eventual swap cannot erase it.
    CompactBegin {
        response: oneshot::Sender<()>,
    },
    /// Rewrite the WAL from the snapshot plus everything appended since
    /// `CompactBegin`, then atomically swap.
    CompactFinish {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
    #[cfg(test)]
    Shutdown,
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    // Events appended while a compaction snapshot is in flight. They are
    // re-appended to the compacted file on swap, so an acked write can never
    // be erased by a stale snapshot.
    let mut compact_tail: Option<Vec<Event>> = None;

    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];

                // Drain all immediately available appends
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut wal, &mut batch, &mut compact_tail);
                            if !handle_non_append(&mut wal, other, &mut compact_tail) {
                                return;
                            }
                            break;
                        }
                        Err(_) => break, // channel empty — flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch, &mut compact_tail);
                }
            }
            other => {
                if !handle_non_append(&mut wal, other, &mut compact_tail) {
                    return;
                }
            }
        }
    }
}

fn flush_and_respond(
    wal: &mut Wal,
    batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>,
    compact_tail: &mut Option<Vec<Event>>,
) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if result.is_ok()
        && let Some(tail) = compact_tail
    {
        tail.extend(batch.iter().map(|(event, _)| event.clone()));
    }
    respond_batch(batch, &result);
}

fn flush_batch(
    wal: &mut Wal,
    batch: &mut [(Event, oneshot::Sender<io::Result<()>>)],
) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush — even on append error — so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

/// Returns false when the writer should stop.
fn handle_non_append(
    wal: &mut Wal,
    cmd: WalCommand,
    compact_tail: &mut Option<Vec<Event>>,
) -> bool {
    match cmd {
        WalCommand::CompactBegin { response } => {
            *compact_tail = Some(Vec::new());
            let _ = response.send(());
        }
        WalCommand::CompactFinish { mut events, response } => {
            if let Some(tail) = compact_tail.take() {
                events.extend(tail);
            }
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
        #[cfg(test)]
        WalCommand::Shutdown => return false,
    }
    true
}

pub struct Engine {
    /// Booking store, sharded by identity key (lowercased email).
    pub identities: DashMap<String, SharedIdentityState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: booking id → identity key.
    pub(super) booking_to_identity: DashMap<Ulid, String>,
    /// Survey answers, at most one per booking.
    pub(super) surveys: DashMap<Ulid, Survey>,
}

/// Apply an event directly to an IdentityState (no locking — caller holds the lock).
fn apply_to_identity(ident: &mut IdentityState, event: &Event, index: &DashMap<Ulid, String>) {
    match event {
        Event::BookingCreated {
            id,
            email,
            name,
            booking_date,
            booking_time,
            description,
            created_at,
        } => {
            // A compacted log can repeat a creation already replayed from
            // the snapshot section; the first one wins.
            if ident.get(*id).is_some() {
                return;
            }
            ident.insert_booking(Booking {
                id: *id,
                email: email.clone(),
                name: name.clone(),
                booking_date: *booking_date,
                booking_time: *booking_time,
                description: description.clone(),
                created_at: *created_at,
                updated_at: *created_at,
            });
            index.insert(*id, ident.key.clone());
        }
        Event::BookingUpdated {
            id,
            name,
            booking_date,
            booking_time,
            description,
            updated_at,
            ..
        } => {
            // Remove and reinsert so the date-sorted order stays correct.
            // `id`, `email` and `created_at` carry over untouched.
            if let Some(existing) = ident.remove_booking(*id) {
                ident.insert_booking(Booking {
                    id: existing.id,
                    email: existing.email,
                    name: name.clone(),
                    booking_date: *booking_date,
                    booking_time: *booking_time,
                    description: description.clone(),
                    created_at: existing.created_at,
                    updated_at: *updated_at,
                });
            }
        }
        // Surveys live on the engine, not the identity.
        Event::SurveyRecorded { .. } => {}
    }
}

impl Engine {
    pub fn new(wal_path: PathBuf, notify: Arc<NotifyHub>) -> std::io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            identities: DashMap::new(),
            wal_tx,
            notify,
            booking_to_identity: DashMap::new(),
            surveys: DashMap::new(),
        };

        // Replay events — we're the sole owner of these Arcs, so try_write
        // always succeeds instantly (no contention). Never use blocking_write
        // here because this may run inside an async context.
        for event in &events {
            if let Event::SurveyRecorded { survey } = event {
                engine.surveys.insert(survey.booking_id, survey.clone());
                continue;
            }
            let Some(key) = event.identity() else { continue };
            let entry = engine
                .identities
                .entry(key.clone())
                .or_insert_with(|| Arc::new(RwLock::new(IdentityState::new(key))))
                .clone();
            let mut guard = entry.try_write().expect("replay: uncontended write");
            apply_to_identity(&mut guard, event, &engine.booking_to_identity);
        }

        Ok(engine)
    }

    /// Stop the WAL writer task. Appends sent afterwards fail as unavailable.
    #[cfg(test)]
    pub(super) async fn shutdown_wal_writer(&self) {
        let _ = self.wal_tx.send(WalCommand::Shutdown).await;
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Unavailable("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Unavailable("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Unavailable(e.to_string()))
    }

    pub fn get_identity(&self, key: &str) -> Option<SharedIdentityState> {
        self.identities.get(key).map(|e| e.value().clone())
    }

    pub fn get_identity_for_booking(&self, booking_id: &Ulid) -> Option<String> {
        self.booking_to_identity
            .get(booking_id)
            .map(|e| e.value().clone())
    }

    /// Get or create the identity entry for a key, enforcing the identity cap.
    pub(super) fn identity_entry(&self, key: &str) -> Result<SharedIdentityState, EngineError> {
        if let Some(existing) = self.identities.get(key) {
            return Ok(existing.value().clone());
        }
        if self.identities.len() >= crate::limits::MAX_IDENTITIES {
            return Err(EngineError::LimitExceeded("too many identities"));
        }
        let entry = self
            .identities
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(IdentityState::new(key.to_string()))))
            .clone();
        metrics::gauge!(crate::observability::IDENTITIES_ACTIVE).set(self.identities.len() as f64);
        Ok(entry)
    }

    /// WAL-append + apply + notify in one call. Eliminates the repeated 3-line pattern.
    pub(super) async fn persist_and_apply(
        &self,
        ident: &mut IdentityState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_identity(ident, event, &self.booking_to_identity);
        self.notify.send(&ident.key, event);
        Ok(())
    }
}
