//! Tests against a live server.
//!
//! These run only when DATABASE_URL is set; without it each test returns
//! early so the suite stays green in environments with no server.

use std::env;
use std::sync::mpsc;
use std::time::Duration;

use dyn_postgres::{Connection, Error, IsolationLevel, Listener, QueryError, Value};

fn live_conn() -> Option<Connection> {
    let url = match env::var("DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("DATABASE_URL not set, skipping live test");
            return None;
        }
    };
    Some(Connection::connect(url.as_str()).expect("failed to connect to DATABASE_URL"))
}

#[test]
fn select_round_trip() {
    let Some(mut conn) = live_conn() else { return };

    let result = conn
        .execute(
            "SELECT $1::int8 AS a, $2::text AS b, $3::bool AS c, NULL::int4 AS d",
            &[
                Value::Int(41),
                Value::Text("hello".into()),
                Value::Bool(true),
            ],
        )
        .unwrap();

    let row = result.first().unwrap();
    assert_eq!(row["a"], Value::Int(41));
    assert_eq!(row["b"], Value::Text("hello".into()));
    assert_eq!(row["c"], Value::Bool(true));
    assert_eq!(row["d"], Value::Null);
}

#[test]
fn invalid_sql_carries_server_text() {
    let Some(mut conn) = live_conn() else { return };

    let err = conn.execute("SELEC 1", &[]).unwrap_err();
    match err {
        Error::Query(QueryError::InvalidSql(server)) => {
            assert!(server.message.is_some_and(|m| !m.is_empty()));
        }
        other => panic!("expected InvalidSql, got {:?}", other),
    }

    // the session survives a statement-level error
    let result = conn.execute("SELECT 1 AS one", &[]).unwrap();
    assert_eq!(result.first().unwrap()["one"], Value::Int(1));
}

#[test]
fn streaming_matches_materialized() {
    let Some(mut conn) = live_conn() else { return };

    let sql = "SELECT generate_series(1, 100) AS n";
    let materialized = conn.execute(sql, &[]).unwrap();

    let streamed: Vec<_> = conn
        .execute_streaming(sql, &[])
        .unwrap()
        .map(|row| row.unwrap())
        .collect();

    assert_eq!(materialized.rows, streamed);
}

#[test]
fn abandoned_stream_leaves_connection_usable() {
    let Some(mut conn) = live_conn() else { return };

    {
        let mut stream = conn
            .execute_streaming("SELECT generate_series(1, 10000) AS n", &[])
            .unwrap();
        let first = stream.next().unwrap().unwrap();
        assert_eq!(first["n"], Value::Int(1));
    }

    let result = conn.execute("SELECT 2 AS two", &[]).unwrap();
    assert_eq!(result.first().unwrap()["two"], Value::Int(2));
}

#[test]
fn transaction_rollback_hides_the_write() {
    let Some(mut conn) = live_conn() else { return };

    conn.execute(
        "CREATE TABLE IF NOT EXISTS dyn_postgres_txn_test (id int8)",
        &[],
    )
    .unwrap();
    conn.execute("TRUNCATE dyn_postgres_txn_test", &[]).unwrap();

    let err = conn
        .run_transaction(IsolationLevel::ReadCommitted, |conn| {
            conn.execute(
                "INSERT INTO dyn_postgres_txn_test VALUES ($1)",
                &[Value::Int(1)],
            )?;
            Err::<(), Error>(QueryError::NoResults.into())
        })
        .unwrap_err();
    assert!(matches!(err, Error::Query(QueryError::NoResults)));

    // a fresh connection must not see the rolled-back write
    let Some(mut fresh) = live_conn() else { return };
    let result = fresh
        .execute("SELECT count(*) AS c FROM dyn_postgres_txn_test", &[])
        .unwrap();
    assert_eq!(result.first().unwrap()["c"], Value::Int(0));

    conn.execute("DROP TABLE dyn_postgres_txn_test", &[]).unwrap();
}

#[test]
fn listen_notify_end_to_end() {
    let Some(listen_conn) = live_conn() else { return };
    let Some(mut notify_conn) = live_conn() else { return };

    let (tx, rx) = mpsc::channel();
    let mut listener = Listener::spawn(listen_conn, "dyn_postgres_live", move |event| {
        tx.send(event).ok();
    })
    .unwrap();

    notify_conn
        .notify("dyn_postgres_live", Some("payload"))
        .unwrap();

    let event = rx.recv_timeout(Duration::from_secs(10)).unwrap().unwrap();
    assert_eq!(event.channel, "dyn_postgres_live");
    assert_eq!(event.payload, "payload");

    // a channel nobody notified stays silent
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());

    listener.close();
}
