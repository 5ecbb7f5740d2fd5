use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Days, NaiveDate, NaiveTime, Utc};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use ulid::Ulid;

use bookd::engine::Engine;
use bookd::model::Booking;
use bookd::notify::NotifyHub;
use bookd::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<Engine>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join("bookd_int_test");
    std::fs::create_dir_all(&dir).unwrap();
    let wal_path = dir.join(format!("{}.wal", Ulid::new()));

    let notify = Arc::new(NotifyHub::new());
    let engine = Arc::new(Engine::new(wal_path, notify).unwrap());

    let srv_engine = engine.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = srv_engine.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine).await;
            });
        }
    });

    (addr, engine)
}

struct Client {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (read, writer) = stream.into_split();
        Self {
            reader: BufReader::new(read),
            writer,
        }
    }

    async fn send(&mut self, body: &Value) {
        let mut line = body.to_string();
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await.unwrap();
    }

    async fn recv(&mut self) -> Value {
        let mut line = String::new();
        let timeout = Duration::from_secs(5);
        tokio::time::timeout(timeout, self.reader.read_line(&mut line))
            .await
            .expect("timed out waiting for response")
            .unwrap();
        serde_json::from_str(&line).unwrap()
    }

    async fn request(&mut self, body: Value) -> Value {
        self.send(&body).await;
        self.recv().await
    }
}

fn today() -> NaiveDate {
    Utc::now().date_naive()
}

fn day_offset(days: i64) -> String {
    let d = if days >= 0 {
        today() + Days::new(days as u64)
    } else {
        today() - Days::new((-days) as u64)
    };
    d.format("%Y-%m-%d").to_string()
}

fn seed_booking(email: &str, days: i64) -> Booking {
    let date = if days >= 0 {
        today() + Days::new(days as u64)
    } else {
        today() - Days::new((-days) as u64)
    };
    let now_ms = Utc::now().timestamp_millis();
    Booking {
        id: Ulid::new(),
        email: email.into(),
        name: "Seeded User".into(),
        booking_date: date,
        booking_time: NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
        description: Some("inserted directly".into()),
        created_at: now_ms,
        updated_at: now_ms,
    }
}

fn submit(email: &str, days: i64) -> Value {
    json!({
        "op": "submit",
        "email": email,
        "name": "Wire User",
        "booking_date": day_offset(days),
        "booking_time": "14:00",
        "description": "via wire",
    })
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn ping_answers_ok() {
    let (addr, _engine) = start_test_server().await;
    let mut client = Client::connect(addr).await;

    let reply = client.request(json!({"op": "ping"})).await;
    assert_eq!(reply["status"], "ok");
}

#[tokio::test]
async fn past_booking_is_not_updated() {
    // The observed scenario: a stale row in the store must not swallow
    // a fresh submission for the same email.
    let (addr, engine) = start_test_server().await;

    let seeded = seed_booking("past-booking-test@example.com", -5);
    let seeded_id = seeded.id.to_string();
    engine.insert_booking(seeded).await.unwrap();

    let mut client = Client::connect(addr).await;
    let reply = client
        .request(submit("past-booking-test@example.com", 10))
        .await;

    assert_eq!(reply["status"], "ok");
    assert_eq!(reply["action"], "created");
    assert_ne!(reply["booking"]["id"].as_str().unwrap(), seeded_id);
    assert_eq!(reply["message"], "Booking created successfully");
}

#[tokio::test]
async fn future_booking_is_updated_in_place() {
    let (addr, engine) = start_test_server().await;

    let seeded = seed_booking("a@b.com", 3);
    let seeded_id = seeded.id.to_string();
    engine.insert_booking(seeded).await.unwrap();

    let mut client = Client::connect(addr).await;
    let reply = client.request(submit("a@b.com", 7)).await;

    assert_eq!(reply["status"], "ok");
    assert_eq!(reply["action"], "updated");
    assert_eq!(reply["booking"]["id"].as_str().unwrap(), seeded_id);
    assert_eq!(reply["booking"]["booking_date"], day_offset(7));
    assert_eq!(reply["message"], "Booking updated successfully");

    let listed = client.request(json!({"op": "list", "email": "a@b.com"})).await;
    assert_eq!(listed["bookings"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn malformed_requests_get_validation_errors() {
    let (addr, _engine) = start_test_server().await;
    let mut client = Client::connect(addr).await;

    // Bad email
    let reply = client.request(submit("not-an-email", 3)).await;
    assert_eq!(reply["status"], "error");
    assert_eq!(reply["kind"], "validation");

    // Bad date format
    let mut bad_date = submit("a@b.com", 3);
    bad_date["booking_date"] = json!("09/15/2026");
    let reply = client.request(bad_date).await;
    assert_eq!(reply["status"], "error");
    assert_eq!(reply["kind"], "validation");

    // Bad time format
    let mut bad_time = submit("a@b.com", 3);
    bad_time["booking_time"] = json!("2pm");
    let reply = client.request(bad_time).await;
    assert_eq!(reply["kind"], "validation");

    // Unknown op
    let reply = client.request(json!({"op": "drop_everything"})).await;
    assert_eq!(reply["status"], "error");
    assert_eq!(reply["kind"], "validation");

    // Connection still usable afterwards
    let reply = client.request(json!({"op": "ping"})).await;
    assert_eq!(reply["status"], "ok");
}

#[tokio::test]
async fn get_and_list_round_trip() {
    let (addr, _engine) = start_test_server().await;
    let mut client = Client::connect(addr).await;

    let reply = client.request(submit("fetch@me.com", 4)).await;
    let id = reply["booking"]["id"].as_str().unwrap().to_string();

    let got = client.request(json!({"op": "get", "id": id})).await;
    assert_eq!(got["status"], "ok");
    assert_eq!(got["booking"]["email"], "fetch@me.com");

    let missing = client
        .request(json!({"op": "get", "id": Ulid::new().to_string()}))
        .await;
    assert_eq!(missing["status"], "error");
    assert_eq!(missing["kind"], "not_found");

    let listed = client
        .request(json!({"op": "list", "email": "fetch@me.com"}))
        .await;
    assert_eq!(listed["bookings"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn slots_reflect_bookings() {
    let (addr, _engine) = start_test_server().await;
    let mut client = Client::connect(addr).await;

    let reply = client.request(json!({
        "op": "submit",
        "email": "slots@x.com",
        "name": "Slot Taker",
        "booking_date": day_offset(5),
        "booking_time": "10:00",
    }))
    .await;
    assert_eq!(reply["action"], "created");

    let board = client
        .request(json!({"op": "slots", "date": day_offset(5)}))
        .await;
    assert_eq!(board["status"], "ok");
    let booked: Vec<&str> = board["booked_slots"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap())
        .collect();
    assert_eq!(booked, vec!["10:00:00"]);
    let available: Vec<&str> = board["available_slots"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap())
        .collect();
    assert!(!available.contains(&"10:00:00"));
    assert!(available.contains(&"09:00:00"));
}

#[tokio::test]
async fn watch_streams_booking_events() {
    let (addr, _engine) = start_test_server().await;

    // Connection 1: watcher
    let mut watcher = Client::connect(addr).await;
    let reply = watcher
        .request(json!({"op": "watch", "email": "Watched@X.com"}))
        .await;
    assert_eq!(reply["status"], "ok");
    assert_eq!(reply["watching"], "watched@x.com");

    // Connection 2: submitter
    let mut submitter = Client::connect(addr).await;
    let reply = submitter.request(submit("watched@x.com", 6)).await;
    assert_eq!(reply["action"], "created");

    let event = watcher.recv().await;
    assert_eq!(event["status"], "event");
    assert_eq!(event["action"], "created");
    assert_eq!(event["email"], "watched@x.com");

    // An update on the same identity streams too
    let reply = submitter.request(submit("watched@x.com", 8)).await;
    assert_eq!(reply["action"], "updated");
    let event = watcher.recv().await;
    assert_eq!(event["action"], "updated");
}

#[tokio::test]
async fn survey_round_trip_and_conflict() {
    let (addr, _engine) = start_test_server().await;
    let mut client = Client::connect(addr).await;

    let reply = client.request(submit("survey@me.com", 4)).await;
    let booking_id = reply["booking"]["id"].as_str().unwrap().to_string();

    let survey = json!({
        "op": "survey",
        "booking_id": booking_id,
        "role": ["developer"],
        "primary_goals": ["ship faster"],
        "other_goal": "learn the platform",
    });
    let reply = client.request(survey.clone()).await;
    assert_eq!(reply["status"], "ok");
    assert_eq!(reply["message"], "Survey submitted successfully");
    assert_eq!(reply["survey"]["booking_id"], booking_id);
    assert_eq!(reply["survey"]["role"][0], "developer");

    // One survey per booking
    let reply = client.request(survey).await;
    assert_eq!(reply["status"], "error");
    assert_eq!(reply["kind"], "conflict");

    // Unknown booking
    let reply = client
        .request(json!({
            "op": "survey",
            "booking_id": Ulid::new().to_string(),
        }))
        .await;
    assert_eq!(reply["status"], "error");
    assert_eq!(reply["kind"], "not_found");
}

#[tokio::test]
async fn concurrent_submits_settle_to_one_record() {
    let (addr, engine) = start_test_server().await;

    let mut c1 = Client::connect(addr).await;
    let mut c2 = Client::connect(addr).await;

    let (r1, r2) = tokio::join!(
        c1.request(submit("race@wire.com", 5)),
        c2.request(submit("race@wire.com", 6)),
    );

    let mut actions = vec![
        r1["action"].as_str().unwrap().to_string(),
        r2["action"].as_str().unwrap().to_string(),
    ];
    actions.sort();
    assert_eq!(actions, vec!["created", "updated"]);
    assert_eq!(engine.list_bookings("race@wire.com").await.len(), 1);
}
