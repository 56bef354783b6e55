use std::net::SocketAddr;
use std::sync::Arc;

use chrono::{Duration, NaiveDate, TimeZone, Utc};
use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use counterbook::auth::CounterbookAuthSource;
use counterbook::clock::FixedClock;
use counterbook::config::ScheduleConfig;
use counterbook::engine::Engine;
use counterbook::wire;

const PASSWORD: &str = "counterbook";

// ── Test infrastructure ──────────────────────────────────────

/// Server whose clock reads Friday 2030-03-01 12:00 at the counter.
async fn start_test_server() -> (SocketAddr, Arc<Engine>, Arc<FixedClock>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("counterbook_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let start = chrono_tz::America::Fortaleza
        .with_ymd_and_hms(2030, 3, 1, 12, 0, 0)
        .unwrap()
        .with_timezone(&Utc);
    let clock = Arc::new(FixedClock::new(start));
    let engine = Arc::new(
        Engine::new(
            dir.join("counterbook.wal"),
            ScheduleConfig::default(),
            clock.clone(),
        )
        .unwrap(),
    );
    let auth = CounterbookAuthSource::new(PASSWORD.into(), "admin".into(), None);

    let server_engine = engine.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let engine = server_engine.clone();
            let auth = auth.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, engine, auth, None).await;
            });
        }
    });

    (addr, engine, clock)
}

async fn connect_as(addr: SocketAddr, user: &str) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("counterbook")
        .user(user)
        .password(PASSWORD);

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

async fn connect(addr: SocketAddr) -> Client {
    connect_as(addr, "kiosk").await
}

fn rows(messages: Vec<SimpleQueryMessage>) -> Vec<SimpleQueryRow> {
    messages
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

async fn query_rows(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    rows(client.simple_query(sql).await.unwrap())
}

/// SQLSTATE and message of a failed statement.
async fn query_err(client: &Client, sql: &str) -> (String, String) {
    let err = client.simple_query(sql).await.unwrap_err();
    let db = err.as_db_error().expect("database error");
    (db.code().code().to_string(), db.message().to_string())
}

fn insert_booking(time: &str, tax_id: &str, postal_code: &str) -> String {
    format!(
        "INSERT INTO bookings (service, date, time, name, phone, postal_code, tax_id) \
         VALUES ('identity_card', '2030-03-04', '{time}', 'Maria Silva', '(88) 99999-0000', '{postal_code}', '{tax_id}')"
    )
}

fn slot_row<'a>(slots: &'a [SimpleQueryRow], time: &str) -> &'a SimpleQueryRow {
    slots
        .iter()
        .find(|r| r.get("time") == Some(time))
        .expect("slot listed")
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn availability_lists_monday_slots() {
    let (addr, _engine, _clock) = start_test_server().await;
    let client = connect(addr).await;

    let slots = query_rows(&client, "SELECT * FROM availability WHERE date = '2030-03-04'").await;
    assert_eq!(slots.len(), 13);
    assert_eq!(slots[0].get("time"), Some("08:00"));
    assert_eq!(slots[0].get("available"), Some("t"));
    assert_eq!(slots[12].get("time"), Some("15:10"));

    // Saturday has no calendar.
    let weekend = query_rows(&client, "SELECT * FROM availability WHERE date = '2030-03-02'").await;
    assert!(weekend.is_empty());
}

#[tokio::test]
async fn booking_round_trip() {
    let (addr, _engine, _clock) = start_test_server().await;
    let client = connect(addr).await;

    let created = query_rows(&client, &insert_booking("08:20", "529.982.247-25", "62955-000")).await;
    assert_eq!(created.len(), 1);
    let booking = &created[0];
    assert_eq!(booking.get("status"), Some("scheduled"));
    assert_eq!(booking.get("tax_id"), Some("52998224725"));
    assert_eq!(booking.get("phone"), Some("88999990000"));
    assert!(booking.get("protocol").unwrap().starts_with("203003040820-"));
    let id = booking.get("id").unwrap().to_string();

    let slots = query_rows(&client, "SELECT * FROM availability WHERE date = '2030-03-04'").await;
    assert_eq!(slot_row(&slots, "08:20").get("available"), Some("f"));
    assert_eq!(slot_row(&slots, "08:40").get("available"), Some("t"));

    let by_id = query_rows(&client, &format!("SELECT * FROM bookings WHERE id = '{id}'")).await;
    assert_eq!(by_id.len(), 1);
    assert_eq!(by_id[0].get("time"), Some("08:20"));

    let (code, message) = query_err(&client, &insert_booking("08:20", "111.444.777-35", "62955-000")).await;
    assert_eq!(code, "P0001");
    assert!(message.starts_with("SLOT_TAKEN"), "{message}");
}

#[tokio::test]
async fn admission_errors_carry_reason_codes() {
    let (addr, _engine, _clock) = start_test_server().await;
    let client = connect(addr).await;

    let (code, message) = query_err(&client, &insert_booking("09:00", "123.456.789-00", "62955-000")).await;
    assert_eq!(code, "P0001");
    assert!(message.starts_with("INVALID_TAX_ID"), "{message}");

    query_rows(&client, &insert_booking("08:00", "52998224725", "62900-000")).await;
    query_rows(&client, &insert_booking("08:20", "11144477735", "62900-000")).await;
    let (_, message) = query_err(&client, &insert_booking("08:40", "12345678909", "62900-000")).await;
    assert!(message.starts_with("NEIGHBOR_QUOTA_EXCEEDED"), "{message}");

    // A local citizen is not bound by the neighbor quota.
    query_rows(&client, &insert_booking("08:40", "12345678909", "62955-000")).await;

    let (_, message) = query_err(&client, &insert_booking("09:00", "12345678909", "62955-000")).await;
    assert!(message.starts_with("DUPLICATE_BOOKING"), "{message}");
}

#[tokio::test]
async fn parse_errors_use_syntax_sqlstate() {
    let (addr, _engine, _clock) = start_test_server().await;
    let client = connect(addr).await;

    let (code, _) = query_err(&client, "SELECT * FROM resources").await;
    assert_eq!(code, "42601");
    let (code, _) = query_err(&client, "SELECT * FROM availability WHERE date = 'monday'").await;
    assert_eq!(code, "42601");
}

#[tokio::test]
async fn admin_cancels_inside_window() {
    let (addr, _engine, clock) = start_test_server().await;
    let citizen = connect(addr).await;
    let admin = connect_as(addr, "admin").await;

    let early = query_rows(&citizen, &insert_booking("08:00", "52998224725", "62955-000")).await;
    let early_id = early[0].get("id").unwrap().to_string();
    let late = query_rows(&citizen, &insert_booking("08:20", "11144477735", "62955-000")).await;
    let late_id = late[0].get("id").unwrap().to_string();

    // Monday 08:00 is 68h away.
    citizen
        .simple_query(&format!("DELETE FROM bookings WHERE id = '{late_id}'"))
        .await
        .unwrap();

    // Monday 07:00: inside the 24h window.
    clock.advance(Duration::hours(67));
    let (code, message) =
        query_err(&citizen, &format!("DELETE FROM bookings WHERE id = '{early_id}'")).await;
    assert_eq!(code, "P0001");
    assert!(message.starts_with("CANCELLATION_WINDOW_EXPIRED"), "{message}");

    admin
        .simple_query(&format!("DELETE FROM bookings WHERE id = '{early_id}'"))
        .await
        .unwrap();
    let after = query_rows(&admin, &format!("SELECT * FROM bookings WHERE id = '{early_id}'")).await;
    assert_eq!(after[0].get("status"), Some("cancelled"));

    let (_, message) = query_err(&admin, &format!("DELETE FROM bookings WHERE id = '{early_id}'")).await;
    assert!(message.starts_with("INVALID_STATUS_TRANSITION"), "{message}");
}

#[tokio::test]
async fn block_toggles_and_listings() {
    let (addr, engine, _clock) = start_test_server().await;
    let client = connect_as(addr, "admin").await;
    let monday = NaiveDate::from_ymd_opt(2030, 3, 4).unwrap();

    let action = query_rows(&client, "SELECT toggle_slot_block('2030-03-04', '14:50')").await;
    assert_eq!(action[0].get("action"), Some("blocked"));
    let slots = query_rows(&client, "SELECT * FROM availability WHERE date = '2030-03-04'").await;
    assert_eq!(slot_row(&slots, "14:50").get("available"), Some("f"));

    let blocked = query_rows(&client, "SELECT * FROM blocked_slots").await;
    assert_eq!(blocked.len(), 1);
    assert_eq!(blocked[0].get("date"), Some("2030-03-04"));
    assert_eq!(blocked[0].get("time"), Some("14:50"));

    let action = query_rows(&client, "SELECT toggle_slot_block('2030-03-04', '14:50')").await;
    assert_eq!(action[0].get("action"), Some("unblocked"));
    assert!(query_rows(&client, "SELECT * FROM blocked_slots").await.is_empty());

    query_rows(&client, "SELECT toggle_day_block('2030-03-04')").await;
    assert!(engine.is_day_blocked(monday).await);
    let slots = query_rows(&client, "SELECT * FROM availability WHERE date = '2030-03-04'").await;
    assert!(slots.iter().all(|r| r.get("available") == Some("f")));

    let action = query_rows(&client, "SELECT toggle_month_block('2030-03')").await;
    assert_eq!(action[0].get("action"), Some("blocked"));
    let dates = query_rows(&client, "SELECT * FROM blocked_dates").await;
    assert_eq!(dates.len(), 21);

    let action = query_rows(&client, "SELECT toggle_month_block('2030-03')").await;
    assert_eq!(action[0].get("action"), Some("unblocked"));
    assert!(query_rows(&client, "SELECT * FROM blocked_dates").await.is_empty());
}

#[tokio::test]
async fn rating_and_summary() {
    let (addr, _engine, _clock) = start_test_server().await;
    let client = connect(addr).await;

    let created = query_rows(&client, &insert_booking("08:00", "52998224725", "62955-000")).await;
    let id = created[0].get("id").unwrap().to_string();

    // Rating a scheduled booking completes it.
    let (_, message) = query_err(
        &client,
        &format!("INSERT INTO ratings (booking_id, rating) VALUES ('{id}', 6)"),
    )
    .await;
    assert!(message.starts_with("INVALID_RATING"), "{message}");

    let rated = query_rows(
        &client,
        &format!("INSERT INTO ratings (booking_id, rating, feedback) VALUES ('{id}', 4, 'quick')"),
    )
    .await;
    assert_eq!(rated[0].get("rating"), Some("4"));
    assert_eq!(rated[0].get("status"), Some("completed"));

    let (_, message) = query_err(
        &client,
        &format!("INSERT INTO ratings (booking_id, rating) VALUES ('{id}', 5)"),
    )
    .await;
    assert!(message.starts_with("ALREADY_RATED"), "{message}");

    let summary = query_rows(&client, "SELECT * FROM summary").await;
    assert_eq!(summary.len(), 1);
    assert_eq!(summary[0].get("total"), Some("1"));
    assert_eq!(summary[0].get("active"), Some("0"));
    assert_eq!(summary[0].get("identity_card"), Some("1"));
    let average: f64 = summary[0].get("average_rating").unwrap().parse().unwrap();
    assert_eq!(average, 4.0);
}

#[tokio::test]
async fn update_moves_booking() {
    let (addr, _engine, _clock) = start_test_server().await;
    let client = connect(addr).await;

    let created = query_rows(&client, &insert_booking("08:00", "52998224725", "62955-000")).await;
    let id = created[0].get("id").unwrap().to_string();

    let updated = query_rows(
        &client,
        &format!(
            "INSERT INTO booking_updates (id, date, time, notes) VALUES ('{id}', '2030-03-05', '09:20', 'asked by phone')"
        ),
    )
    .await;
    assert_eq!(updated[0].get("date"), Some("2030-03-05"));
    assert_eq!(updated[0].get("time"), Some("09:20"));
    assert_eq!(updated[0].get("notes"), Some("asked by phone"));

    let monday = query_rows(&client, "SELECT * FROM availability WHERE date = '2030-03-04'").await;
    assert_eq!(slot_row(&monday, "08:00").get("available"), Some("t"));
    let tuesday = query_rows(&client, "SELECT * FROM availability WHERE date = '2030-03-05'").await;
    assert_eq!(slot_row(&tuesday, "09:20").get("available"), Some("f"));
}

#[tokio::test]
async fn extended_protocol_lookup_by_tax_id() {
    let (addr, _engine, _clock) = start_test_server().await;
    let client = connect(addr).await;

    query_rows(&client, &insert_booking("08:00", "52998224725", "62955-000")).await;
    query_rows(&client, &insert_booking("08:20", "11144477735", "62955-000")).await;

    let found = client
        .query("SELECT * FROM bookings WHERE tax_id = $1", &[&"529.982.247-25"])
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    let time: String = found[0].get("time");
    let status: String = found[0].get("status");
    assert_eq!(time, "08:00");
    assert_eq!(status, "scheduled");
}
