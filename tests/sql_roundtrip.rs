use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use resalloc::engine::{DashboardOptions, Engine};
use resalloc::wire::{self, ResallocFactory};

const H: i64 = 3_600_000;
/// 2024-01-01T00:00:00Z
const JAN_1_2024: i64 = 1_704_067_200_000;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("resalloc_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let engine = Arc::new(Engine::new(dir.join("resalloc.wal"), DashboardOptions::default()).unwrap());
    let factory = Arc::new(ResallocFactory::new(engine));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let factory = factory.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, factory).await;
            });
        }
    });

    addr
}

async fn connect(addr: SocketAddr) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("resalloc")
        .user("resalloc");
    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

async fn rows(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

fn hour(h: i64) -> i64 {
    JAN_1_2024 + h * H
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn allocate_detect_and_report() {
    let addr = start_test_server().await;
    let client = connect(addr).await;

    let room = Ulid::new();
    let (standup, review) = (Ulid::new(), Ulid::new());
    client
        .simple_query(&format!(
            "INSERT INTO resources (id, name, kind) VALUES ('{room}', 'Room A', 'room')"
        ))
        .await
        .unwrap();
    client
        .simple_query(&format!(
            r#"INSERT INTO events (id, title, start, "end") VALUES ('{standup}', 'Standup', {}, {})"#,
            hour(9),
            hour(10)
        ))
        .await
        .unwrap();
    client
        .simple_query(&format!(
            r#"INSERT INTO events (id, title, start, "end") VALUES ('{review}', 'Review', {}, {})"#,
            hour(10),
            hour(12)
        ))
        .await
        .unwrap();

    // Back-to-back allocations on one room are fine.
    for event in [standup, review] {
        client
            .simple_query(&format!(
                "INSERT INTO allocations (id, event_id, resource_id) VALUES ('{}', '{event}', '{room}')",
                Ulid::new()
            ))
            .await
            .unwrap();
    }
    assert_eq!(rows(&client, &format!("SELECT * FROM allocations WHERE resource_id = '{room}'")).await.len(), 2);
    assert!(rows(&client, "SELECT * FROM conflicts").await.is_empty());

    // An overlapping one is refused with the engine's SQLSTATE.
    let clash = Ulid::new();
    client
        .simple_query(&format!(
            r#"INSERT INTO events (id, title, start, "end") VALUES ('{clash}', 'Clash', {}, {})"#,
            hour(9),
            hour(11)
        ))
        .await
        .unwrap();
    let err = client
        .simple_query(&format!(
            "INSERT INTO allocations (id, event_id, resource_id) VALUES ('{}', '{clash}', '{room}')",
            Ulid::new()
        ))
        .await
        .unwrap_err();
    assert_eq!(err.code().map(|c| c.code()), Some("P0001"));

    let usage = rows(
        &client,
        &format!(
            r#"SELECT * FROM usage WHERE resource_id = '{room}' AND start >= {} AND "end" <= {} AND now = {}"#,
            hour(0),
            hour(24),
            hour(0)
        ),
    )
    .await;
    assert_eq!(usage.len(), 1);
    let hours: f64 = usage[0].get("total_hours").unwrap().parse().unwrap();
    assert!((hours - 3.0).abs() < 1e-9);
    assert_eq!(usage[0].get("allocation_count"), Some("2"));
    assert_eq!(usage[0].get("upcoming_count"), Some("2"));
}

#[tokio::test]
async fn dry_run_reports_blocking_allocation() {
    let addr = start_test_server().await;
    let client = connect(addr).await;

    let room = Ulid::new();
    let (first, second) = (Ulid::new(), Ulid::new());
    let held = Ulid::new();
    for stmt in [
        format!("INSERT INTO resources (id, name) VALUES ('{room}', 'Room A')"),
        format!("INSERT INTO events VALUES ('{first}', 'First', {}, {})", hour(9), hour(11)),
        format!("INSERT INTO events VALUES ('{second}', 'Second', {}, {})", hour(10), hour(12)),
        format!("INSERT INTO allocations (id, event_id, resource_id) VALUES ('{held}', '{first}', '{room}')"),
    ] {
        client.simple_query(&stmt).await.unwrap();
    }
    assert_eq!(rows(&client, "SELECT * FROM allocations").await.len(), 1);

    let verdict = rows(
        &client,
        &format!("SELECT * FROM validate WHERE resource_id = '{room}' AND event_id = '{second}'"),
    )
    .await;
    assert_eq!(verdict.len(), 1);
    assert!(matches!(verdict[0].get("accepted"), Some("f") | Some("false")));
    assert_eq!(verdict[0].get("reason"), Some("conflict"));
    let expected = held.to_string();
    assert_eq!(verdict[0].get("blocking_id"), Some(expected.as_str()));

    // Nothing was written by the dry run.
    assert_eq!(rows(&client, "SELECT * FROM allocations").await.len(), 1);
}

#[tokio::test]
async fn reschedule_and_cascade_over_sql() {
    let addr = start_test_server().await;
    let client = connect(addr).await;

    let room = Ulid::new();
    let event = Ulid::new();
    let alloc = Ulid::new();
    client
        .simple_query(&format!("INSERT INTO resources (id, name) VALUES ('{room}', 'Room A')"))
        .await
        .unwrap();
    client
        .simple_query(&format!(
            "INSERT INTO events VALUES ('{event}', 'Review', {}, {})",
            hour(9),
            hour(10)
        ))
        .await
        .unwrap();
    client
        .simple_query(&format!(
            "INSERT INTO allocations (id, event_id, resource_id) VALUES ('{alloc}', '{event}', '{room}')"
        ))
        .await
        .unwrap();

    client
        .simple_query(&format!(
            r#"UPDATE events SET start = {}, "end" = {} WHERE id = '{event}'"#,
            hour(14),
            hour(15)
        ))
        .await
        .unwrap();
    let moved = rows(&client, "SELECT * FROM allocations").await;
    let expected_start = hour(14).to_string();
    assert_eq!(moved[0].get("start"), Some(expected_start.as_str()));

    client
        .simple_query(&format!("DELETE FROM events WHERE id = '{event}'"))
        .await
        .unwrap();
    assert!(rows(&client, "SELECT * FROM allocations").await.is_empty());
    assert_eq!(rows(&client, "SELECT * FROM resources").await.len(), 1);
}

#[tokio::test]
async fn extended_protocol_writes() {
    let addr = start_test_server().await;
    let client = connect(addr).await;

    let room = Ulid::new().to_string();
    let inserted = client
        .execute(
            "INSERT INTO resources (id, name, kind) VALUES ($1, $2, $3)",
            &[&room, &"Projector".to_string(), &"equipment".to_string()],
        )
        .await
        .unwrap();
    assert_eq!(inserted, 1);

    let listed = rows(&client, "SELECT * FROM resources").await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].get("name"), Some("Projector"));
    assert_eq!(listed[0].get("kind"), Some("equipment"));
}

#[tokio::test]
async fn dashboard_counts() {
    let addr = start_test_server().await;
    let client = connect(addr).await;

    for name in ["Room A", "Room B"] {
        client
            .simple_query(&format!(
                "INSERT INTO resources (id, name) VALUES ('{}', '{name}')",
                Ulid::new()
            ))
            .await
            .unwrap();
    }
    client
        .simple_query(&format!(
            "INSERT INTO events VALUES ('{}', 'Now', {}, {})",
            Ulid::new(),
            hour(9),
            hour(11)
        ))
        .await
        .unwrap();

    let dash = rows(&client, &format!("SELECT * FROM dashboard WHERE now = {}", hour(10))).await;
    assert_eq!(dash.len(), 1);
    assert_eq!(dash[0].get("active_event_count"), Some("1"));
    assert_eq!(dash[0].get("resource_count"), Some("2"));
    assert_eq!(dash[0].get("conflict_count"), Some("0"));
    assert!(rows(&client, "SELECT * FROM recent_allocations").await.is_empty());
}

#[tokio::test]
async fn bound_values_are_stored_verbatim() {
    let addr = start_test_server().await;
    let client = connect(addr).await;

    let room = Ulid::new().to_string();
    client
        .execute(
            "INSERT INTO resources (id, name, kind) VALUES ($1, $2, $3)",
            &[&room, &"Room $1".to_string(), &"it's a room".to_string()],
        )
        .await
        .unwrap();

    let listed = rows(&client, "SELECT * FROM resources").await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].get("id"), Some(room.as_str()));
    assert_eq!(listed[0].get("name"), Some("Room $1"));
    assert_eq!(listed[0].get("kind"), Some("it's a room"));
}
