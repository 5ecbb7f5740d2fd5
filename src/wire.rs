use std::sync::Arc;

use chrono::{NaiveDate, NaiveTime, Utc};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_util::codec::{Framed, LinesCodec};
use ulid::Ulid;

use crate::engine::{Engine, EngineError};
use crate::model::{identity_key, Action, Event, SubmitRequest, SurveyRequest};
use crate::observability;

/// Requests longer than this are dropped with a codec error.
const MAX_LINE_LEN: usize = 64 * 1024;

/// One request per line, one JSON object per request. Unknown `op` values
/// are rejected; unknown payload fields are tolerated.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Submit {
        email: String,
        name: String,
        booking_date: String,
        booking_time: String,
        #[serde(default)]
        description: Option<String>,
    },
    Survey {
        booking_id: String,
        #[serde(default)]
        role: Vec<String>,
        #[serde(default)]
        cloud_usage: Vec<String>,
        #[serde(default)]
        development_approach: Vec<String>,
        #[serde(default)]
        team_size: Vec<String>,
        #[serde(default)]
        primary_goals: Vec<String>,
        #[serde(default)]
        other_goal: Option<String>,
    },
    Get {
        id: String,
    },
    List {
        email: String,
    },
    Slots {
        date: String,
    },
    Watch {
        email: String,
    },
    Unwatch,
    Ping,
}

fn parse_date(s: &str) -> Result<NaiveDate, EngineError> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|_| EngineError::Validation("invalid date, expected YYYY-MM-DD"))
}

fn parse_time(s: &str) -> Result<NaiveTime, EngineError> {
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .map_err(|_| EngineError::Validation("invalid time, expected HH:MM or HH:MM:SS"))
}

fn error_kind(e: &EngineError) -> &'static str {
    match e {
        EngineError::Validation(_) | EngineError::LimitExceeded(_) => "validation",
        EngineError::NotFound(_) => "not_found",
        EngineError::AlreadyExists(_) => "conflict",
        EngineError::Unavailable(_) => "unavailable",
    }
}

fn error_response(e: &EngineError) -> Value {
    json!({
        "status": "error",
        "kind": error_kind(e),
        "message": e.to_string(),
    })
}

/// Render a store event as a watch-stream line.
fn event_line(event: &Event) -> Value {
    match event {
        Event::BookingCreated {
            id,
            email,
            name,
            booking_date,
            booking_time,
            ..
        } => json!({
            "status": "event",
            "action": Action::Created,
            "id": id,
            "email": email,
            "name": name,
            "booking_date": booking_date,
            "booking_time": booking_time,
        }),
        Event::BookingUpdated {
            id,
            email,
            name,
            booking_date,
            booking_time,
            ..
        } => json!({
            "status": "event",
            "action": Action::Updated,
            "id": id,
            "email": email,
            "name": name,
            "booking_date": booking_date,
            "booking_time": booking_time,
        }),
        // Surveys are never broadcast, but keep the stream total.
        Event::SurveyRecorded { survey } => json!({
            "status": "event",
            "action": "survey",
            "booking_id": survey.booking_id,
        }),
    }
}

enum Outcome {
    Reply(Value),
    /// Reply, plus switch this connection's watch subscription.
    SetWatch(Value, Option<broadcast::Receiver<Event>>),
}

async fn handle_request(engine: &Engine, req: Request) -> Result<Outcome, EngineError> {
    match req {
        Request::Submit {
            email,
            name,
            booking_date,
            booking_time,
            description,
        } => {
            let submit = SubmitRequest {
                email,
                name,
                booking_date: parse_date(&booking_date)?,
                booking_time: parse_time(&booking_time)?,
                description,
            };
            // The reference instant enters the rule here, once, at the edge.
            let (booking, action) = engine.submit_booking(submit, Utc::now()).await?;
            metrics::counter!(
                observability::SUBMIT_ACTIONS_TOTAL,
                "action" => match action {
                    Action::Created => "created",
                    Action::Updated => "updated",
                }
            )
            .increment(1);
            let message = match action {
                Action::Created => "Booking created successfully",
                Action::Updated => "Booking updated successfully",
            };
            Ok(Outcome::Reply(json!({
                "status": "ok",
                "action": action,
                "booking": booking,
                "message": message,
            })))
        }
        Request::Survey {
            booking_id,
            role,
            cloud_usage,
            development_approach,
            team_size,
            primary_goals,
            other_goal,
        } => {
            let booking_id = Ulid::from_string(&booking_id)
                .map_err(|_| EngineError::Validation("invalid booking id"))?;
            let survey = engine
                .record_survey(
                    SurveyRequest {
                        booking_id,
                        role,
                        cloud_usage,
                        development_approach,
                        team_size,
                        primary_goals,
                        other_goal,
                    },
                    Utc::now(),
                )
                .await?;
            Ok(Outcome::Reply(json!({
                "status": "ok",
                "survey": survey,
                "message": "Survey submitted successfully",
            })))
        }
        Request::Get { id } => {
            let id = Ulid::from_string(&id)
                .map_err(|_| EngineError::Validation("invalid booking id"))?;
            let booking = engine
                .get_booking(id)
                .await
                .ok_or(EngineError::NotFound(id))?;
            Ok(Outcome::Reply(json!({ "status": "ok", "booking": booking })))
        }
        Request::List { email } => {
            let bookings = engine.list_bookings(&email).await;
            Ok(Outcome::Reply(json!({ "status": "ok", "bookings": bookings })))
        }
        Request::Slots { date } => {
            let board = engine.day_slots(parse_date(&date)?).await;
            Ok(Outcome::Reply(json!({
                "status": "ok",
                "date": board.date,
                "available_slots": board.available_slots,
                "booked_slots": board.booked_slots,
            })))
        }
        Request::Watch { email } => {
            let key = identity_key(&email);
            let rx = engine.notify.subscribe(&key);
            Ok(Outcome::SetWatch(
                json!({ "status": "ok", "watching": key }),
                Some(rx),
            ))
        }
        Request::Unwatch => Ok(Outcome::SetWatch(json!({ "status": "ok" }), None)),
        Request::Ping => Ok(Outcome::Reply(json!({ "status": "ok" }))),
    }
}

async fn next_watch_event(
    watch: &mut Option<broadcast::Receiver<Event>>,
) -> Result<Event, broadcast::error::RecvError> {
    match watch {
        Some(rx) => rx.recv().await,
        // Guarded out by the select!, but never busy-loop if polled anyway.
        None => futures::future::pending().await,
    }
}

/// Serve one client connection until it closes.
pub async fn process_connection(
    socket: TcpStream,
    engine: Arc<Engine>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut framed = Framed::new(socket, LinesCodec::new_with_max_length(MAX_LINE_LEN));
    let mut watch: Option<broadcast::Receiver<Event>> = None;

    loop {
        tokio::select! {
            line = framed.next() => {
                let Some(line) = line else { break };
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }

                let req = match serde_json::from_str::<Request>(&line) {
                    Ok(req) => req,
                    Err(e) => {
                        let reply = json!({
                            "status": "error",
                            "kind": "validation",
                            "message": format!("bad request: {e}"),
                        });
                        framed.send(reply.to_string()).await?;
                        continue;
                    }
                };

                let op = observability::op_label(&req);
                let start = std::time::Instant::now();
                let (reply, status) = match handle_request(&engine, req).await {
                    Ok(Outcome::Reply(v)) => (v, "ok"),
                    Ok(Outcome::SetWatch(v, rx)) => {
                        watch = rx;
                        (v, "ok")
                    }
                    Err(e) => (error_response(&e), "error"),
                };
                metrics::counter!(observability::REQUESTS_TOTAL, "op" => op, "status" => status)
                    .increment(1);
                metrics::histogram!(observability::REQUEST_DURATION_SECONDS, "op" => op)
                    .record(start.elapsed().as_secs_f64());

                framed.send(reply.to_string()).await?;
            }
            event = next_watch_event(&mut watch), if watch.is_some() => {
                match event {
                    Ok(ev) => framed.send(event_line(&ev).to_string()).await?,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => watch = None,
                }
            }
        }
    }

    Ok(())
}
