use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_postgres::{Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use bandroom::config::Config as StudioConfig;
use bandroom::engine::OnDelete;
use bandroom::studio::Studio;
use bandroom::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> (SocketAddr, Arc<Studio>) {
    start_test_server_with(OnDelete::Cascade).await
}

async fn start_test_server_with(on_band_delete: OnDelete) -> (SocketAddr, Arc<Studio>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let config = StudioConfig {
        data_dir: std::env::temp_dir().join(format!("bandroom_int_test_{}", Ulid::new())),
        cache_ttl: Duration::from_secs(5),
        on_band_delete,
        ..StudioConfig::default()
    };
    let studio = Arc::new(Studio::open(&config).unwrap());

    let studio2 = studio.clone();
    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let studio = studio2.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, studio, "bandroom".to_string()).await;
            });
        }
    });

    (addr, studio)
}

async fn connect(addr: SocketAddr) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("studio")
        .user("frontdesk")
        .password("bandroom");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
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

async fn query(client: &tokio_postgres::Client, sql: &str) -> Vec<SimpleQueryRow> {
    rows(client.simple_query(sql).await.unwrap())
}

async fn sqlstate(client: &tokio_postgres::Client, sql: &str) -> String {
    let err = client.simple_query(sql).await.unwrap_err();
    err.as_db_error()
        .map(|db| db.code().code().to_string())
        .unwrap_or_else(|| panic!("expected a server error, got {err}"))
}

async fn create_band(client: &tokio_postgres::Client, name: &str) -> Ulid {
    let id = Ulid::new();
    client
        .batch_execute(&format!("INSERT INTO bands (id, name) VALUES ('{id}', '{name}')"))
        .await
        .unwrap();
    id
}

fn propose(band: Ulid, room: &str, start: &str, minutes: i64) -> String {
    format!(
        "INSERT INTO bookings (band_id, room, start, duration_minutes) \
         VALUES ('{band}', '{room}', '{start}', {minutes})"
    )
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn propose_returns_the_booking() {
    let (addr, _studio) = start_test_server().await;
    let client = connect(addr).await;
    let band = create_band(&client, "Night Shift").await;

    let created = query(&client, &propose(band, "studio_a", "2026-10-17 19:00", 90)).await;
    assert_eq!(created.len(), 1);
    let row = &created[0];
    assert_eq!(row.get("band_id"), Some(band.to_string().as_str()));
    assert_eq!(row.get("band_name"), Some("Night Shift"));
    assert_eq!(row.get("room"), Some("studio_a"));
    assert_eq!(row.get("start"), Some("2026-10-17 19:00:00"));
    assert_eq!(row.get("end"), Some("2026-10-17 20:30:00"));
    assert_eq!(row.get("duration_minutes"), Some("90"));
}

#[tokio::test]
async fn overlap_is_refused_with_exclusion_violation() {
    let (addr, _studio) = start_test_server().await;
    let client = connect(addr).await;
    let first = create_band(&client, "First").await;
    let second = create_band(&client, "Second").await;

    query(&client, &propose(first, "small_hall", "2026-10-17 18:00", 120)).await;

    let code = sqlstate(&client, &propose(second, "small_hall", "2026-10-17 19:00", 60)).await;
    assert_eq!(code, "23P01");

    // back-to-back and other rooms are fine
    query(&client, &propose(second, "small_hall", "2026-10-17 20:00", 60)).await;
    query(&client, &propose(second, "great_hall", "2026-10-17 19:00", 60)).await;
}

#[tokio::test]
async fn validation_errors_map_to_invalid_parameter() {
    let (addr, _studio) = start_test_server().await;
    let client = connect(addr).await;
    let band = create_band(&client, "Checks").await;

    for sql in [
        propose(band, "studio_a", "2026-10-17 19:00", 0),
        propose(band, "studio_a", "2026-10-17 19:00", -30),
        propose(band, "attic", "2026-10-17 19:00", 60),
        propose(band, "studio_a", "tomorrow evening", 60),
        propose(band, "studio_a", "+262142-12-31 23:30", 60),
        propose(band, "studio_a", "-262143-01-01 00:30", 60),
        propose(Ulid::new(), "studio_a", "2026-10-17 19:00", 60),
    ] {
        assert_eq!(sqlstate(&client, &sql).await, "22023", "{sql}");
    }
    assert_eq!(sqlstate(&client, "SELECT * FROM concerts").await, "42601");
}

#[tokio::test]
async fn concurrent_proposals_admit_exactly_one() {
    let (addr, studio) = start_test_server().await;
    let setup = connect(addr).await;
    let band = create_band(&setup, "Racers").await;

    let mut tasks = Vec::new();
    for _ in 0..8 {
        tasks.push(tokio::spawn(async move {
            let client = connect(addr).await;
            client
                .simple_query(&propose(band, "studio_b", "2026-10-18 12:00", 60))
                .await
                .map(|_| ())
                .map_err(|e| e.as_db_error().map(|db| db.code().code().to_string()))
        }));
    }

    let mut won = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(()) => won += 1,
            Err(code) => assert_eq!(code.as_deref(), Some("23P01")),
        }
    }
    assert_eq!(won, 1);
    assert_eq!(studio.engine.stats().bookings, 1);
}

#[tokio::test]
async fn occupancy_lists_the_day_in_order() {
    let (addr, _studio) = start_test_server().await;
    let client = connect(addr).await;
    let band = create_band(&client, "Early Birds").await;

    query(&client, &propose(band, "studio_b", "2026-10-17 10:00", 60)).await;
    query(&client, &propose(band, "great_hall", "2026-10-17 10:00", 60)).await;
    query(&client, &propose(band, "studio_a", "2026-10-17 08:00", 60)).await;
    query(&client, &propose(band, "studio_a", "2026-10-18 08:00", 60)).await;

    let day = query(&client, "SELECT * FROM occupancy WHERE date = '2026-10-17'").await;
    let order: Vec<(&str, &str)> = day
        .iter()
        .map(|r| (r.get("start").unwrap(), r.get("room").unwrap()))
        .collect();
    assert_eq!(
        order,
        vec![
            ("2026-10-17 08:00:00", "studio_a"),
            ("2026-10-17 10:00:00", "great_hall"),
            ("2026-10-17 10:00:00", "studio_b"),
        ]
    );

    let one_room =
        query(&client, "SELECT * FROM occupancy WHERE date = '2026-10-17' AND room = 'studio_a'")
            .await;
    assert_eq!(one_room.len(), 1);
}

#[tokio::test]
async fn cancellation_frees_the_slot_immediately() {
    let (addr, _studio) = start_test_server().await;
    let client = connect(addr).await;
    let band = create_band(&client, "Cancellers").await;

    let created = query(&client, &propose(band, "studio_a", "2026-10-17 19:00", 60)).await;
    let id = created[0].get("id").unwrap().to_string();

    // warm the read cache
    let day = query(&client, "SELECT * FROM occupancy WHERE date = '2026-10-17'").await;
    assert_eq!(day.len(), 1);

    client
        .batch_execute(&format!("DELETE FROM bookings WHERE id = '{id}'"))
        .await
        .unwrap();
    let day = query(&client, "SELECT * FROM occupancy WHERE date = '2026-10-17'").await;
    assert!(day.is_empty());

    query(&client, &propose(band, "studio_a", "2026-10-17 19:00", 60)).await;

    let code = sqlstate(&client, &format!("DELETE FROM bookings WHERE id = '{id}'")).await;
    assert_eq!(code, "02000");
}

#[tokio::test]
async fn reschedule_through_change_table() {
    let (addr, _studio) = start_test_server().await;
    let client = connect(addr).await;
    let band = create_band(&client, "Movers").await;
    let other = create_band(&client, "Stayers").await;

    let created = query(&client, &propose(band, "studio_a", "2026-10-17 19:00", 60)).await;
    let id = created[0].get("id").unwrap().to_string();
    query(&client, &propose(other, "studio_b", "2026-10-17 19:00", 60)).await;

    let moved = query(
        &client,
        &format!("INSERT INTO reschedules VALUES ('{id}', NULL, '2026-10-17 19:30', NULL)"),
    )
    .await;
    assert_eq!(moved[0].get("start"), Some("2026-10-17 19:30:00"));
    assert_eq!(moved[0].get("room"), Some("studio_a"));

    let code = sqlstate(
        &client,
        &format!("INSERT INTO reschedules VALUES ('{id}', 'studio_b', NULL, NULL)"),
    )
    .await;
    assert_eq!(code, "23P01");
}

#[tokio::test]
async fn extended_protocol_binds_parameters() {
    let (addr, _studio) = start_test_server().await;
    let client = connect(addr).await;
    let band = create_band(&client, "Prepared").await;

    let band_text = band.to_string();
    let created = client
        .query(
            "INSERT INTO bookings (band_id, room, start, duration_minutes) VALUES ($1, $2, $3, $4)",
            &[&band_text, &"great_hall", &"2026-10-17 17:00", &"45"],
        )
        .await
        .unwrap();
    assert_eq!(created.len(), 1);
    let end: String = created[0].get("end");
    assert_eq!(end, "2026-10-17 17:45:00");

    let day = client
        .query("SELECT * FROM occupancy WHERE date = $1", &[&"2026-10-17"])
        .await
        .unwrap();
    assert_eq!(day.len(), 1);
    let minutes: i64 = day[0].get("duration_minutes");
    assert_eq!(minutes, 45);
}

#[tokio::test]
async fn deleting_a_band_cascades_to_bookings_and_members() {
    let (addr, studio) = start_test_server().await;
    let client = connect(addr).await;
    let band = create_band(&client, "Leaving").await;
    let musician = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO musicians VALUES ('{musician}', 'Olga', 'Ivanova', 'bass', '+375291112233', NULL); \
             INSERT INTO band_members VALUES ('{band}', '{musician}')"
        ))
        .await
        .unwrap();
    query(&client, &propose(band, "studio_a", "2026-10-17 19:00", 60)).await;

    client
        .batch_execute(&format!("DELETE FROM bands WHERE id = '{band}'"))
        .await
        .unwrap();

    assert!(query(&client, "SELECT * FROM occupancy WHERE date = '2026-10-17'").await.is_empty());
    let free = query(&client, "SELECT * FROM free_musicians").await;
    assert_eq!(free.len(), 1);
    assert_eq!(free[0].get("last_name"), Some("Ivanova"));
    assert_eq!(studio.engine.stats().bookings, 0);
}

#[tokio::test]
async fn restrict_refuses_band_with_bookings() {
    let (addr, _studio) = start_test_server_with(OnDelete::Restrict).await;
    let client = connect(addr).await;
    let band = create_band(&client, "Anchored").await;
    query(&client, &propose(band, "studio_a", "2026-10-17 19:00", 60)).await;

    let code = sqlstate(&client, &format!("DELETE FROM bands WHERE id = '{band}'")).await;
    assert_eq!(code, "P0001");
    assert_eq!(query(&client, "SELECT * FROM bands").await.len(), 1);
}

#[tokio::test]
async fn reports_over_the_wire() {
    let (addr, _studio) = start_test_server().await;
    let client = connect(addr).await;
    let busy = create_band(&client, "Busy").await;
    let idle = create_band(&client, "Idle").await;

    query(&client, &propose(busy, "studio_a", "2026-10-17 10:00", 120)).await;
    query(&client, &propose(busy, "studio_a", "2026-10-18 10:00", 60)).await;
    query(&client, &propose(idle, "studio_b", "2026-10-17 10:00", 30)).await;

    let hours = query(&client, "SELECT * FROM rehearsal_hours WHERE max_rows = 1").await;
    assert_eq!(hours.len(), 1);
    assert_eq!(hours[0].get("band_name"), Some("Busy"));
    assert_eq!(hours[0].get("minutes"), Some("180"));

    let schedule = query(
        &client,
        &format!("SELECT * FROM schedule WHERE start >= '2026-10-17 00:00' AND band_id = '{busy}'"),
    )
    .await;
    assert_eq!(schedule.len(), 2);

    let stats = query(&client, "SELECT * FROM stats").await;
    assert_eq!(stats[0].get("bands"), Some("2"));
    assert_eq!(stats[0].get("bookings"), Some("3"));
}

#[tokio::test]
async fn genre_distribution_over_the_wire() {
    let (addr, _studio) = start_test_server().await;
    let client = connect(addr).await;
    for (name, genre) in [("One", "punk"), ("Two", "punk"), ("Three", "jazz")] {
        client
            .batch_execute(&format!(
                "INSERT INTO bands (id, name, genre) VALUES ('{}', '{name}', '{genre}')",
                Ulid::new()
            ))
            .await
            .unwrap();
    }
    create_band(&client, "Undecided").await;

    let genres = query(&client, "SELECT * FROM genres").await;
    let got: Vec<_> = genres
        .iter()
        .map(|r| (r.get("genre"), r.get("bands")))
        .collect();
    assert_eq!(
        got,
        vec![
            (Some("punk"), Some("2")),
            (Some("jazz"), Some("1")),
            (None, Some("1")),
        ]
    );

    let code = sqlstate(&client, "SELECT * FROM genres WHERE genre = 'punk'").await;
    assert_eq!(code, "42601");
}
