//! Connection and dispatch tests against the in-memory bus
//!
//! Run with: `cargo test --test connection`

use ctlab::mock_stream::{self, MockBusHarness};
use ctlab::{Connection, ConnectionOptions, ConnectionState, CtlabError, Module};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing_test::traced_test;

async fn connected(options: ConnectionOptions) -> (Arc<Connection>, MockBusHarness) {
    let (connector, harness) = mock_stream::connector();
    let connection = Connection::new(connector, options);
    connection.connect().await.unwrap();
    (connection, harness)
}

// =============================================================================
// Request / response
// =============================================================================

#[tokio::test]
async fn test_response_marks_channel_fresh() {
    let (connection, mut harness) = connected(ConnectionOptions::default()).await;
    let module = Module::new(3, &connection).unwrap();

    module.req(42).await.unwrap();
    harness.expect_write(b"3:42?\r\n").await;
    assert!(!module.is_fresh(42));

    harness.send_response(b"#3:42=17.5\r\n").unwrap();
    connection.receive().await.unwrap();
    assert!(module.is_fresh(42));
    assert_eq!(module.float(42).unwrap(), 17.5);
}

#[tokio::test]
async fn test_query_returns_answer() {
    let (connection, mut harness) = connected(ConnectionOptions::default()).await;
    let module = Module::new(1, &connection).unwrap();

    // The answer can already be queued; wait_updated picks it up on its first read
    harness.send_response(b"#1:5=-2.5\r\n").unwrap();
    assert_eq!(module.query_float(5).await.unwrap(), -2.5);
    harness.expect_write(b"1:5?\r\n").await;
}

#[tokio::test]
async fn test_one_read_satisfies_several_modules() {
    let (connection, harness) = connected(ConnectionOptions::default()).await;
    let first = Module::new(1, &connection).unwrap();
    let second = Module::new(2, &connection).unwrap();

    harness
        .send_response(b"#1:0=1.0\r\n#2:0=2.0\r\n")
        .unwrap();
    connection.receive().await.unwrap();

    assert_eq!(first.float(0).unwrap(), 1.0);
    assert_eq!(second.float(0).unwrap(), 2.0);
}

#[tokio::test]
async fn test_cache_keeps_latest_value() {
    let (connection, harness) = connected(ConnectionOptions::default()).await;
    let module = Module::new(1, &connection).unwrap();

    harness
        .send_response(b"#1:0=1.0\r\n#1:0=2.0\r\n")
        .unwrap();
    connection.receive().await.unwrap();
    assert_eq!(module.float(0).unwrap(), 2.0);
}

#[tokio::test]
async fn test_value_before_any_response() {
    let (connection, _harness) = connected(ConnectionOptions::default()).await;
    let module = Module::new(1, &connection).unwrap();

    assert!(matches!(
        module.value(0),
        Err(CtlabError::NoValue { module: 1, channel: 0 })
    ));
}

// =============================================================================
// Framing and routing
// =============================================================================

#[tokio::test]
async fn test_line_split_across_reads() {
    let (connection, harness) = connected(ConnectionOptions::default()).await;
    let module = Module::new(4, &connection).unwrap();

    harness.send_response(b"#4:1").unwrap();
    connection.receive().await.unwrap();
    assert!(module.value(10).is_err());
    assert!(module.value(1).is_err());

    harness.send_response(b"0=3.75\r\n").unwrap();
    connection.receive().await.unwrap();
    assert_eq!(module.float(10).unwrap(), 3.75);
}

#[tokio::test]
async fn test_unregistered_module_is_ignored() {
    let (connection, harness) = connected(ConnectionOptions::default()).await;
    let module = Module::new(1, &connection).unwrap();

    harness.send_response(b"#9:0=1.0\r\n").unwrap();
    assert!(connection.receive().await.is_ok());
    assert!(module.value(0).is_err());
    assert_eq!(connection.registry().ids(), vec![1]);
}

#[tokio::test]
async fn test_duplicate_module_id_rejected() {
    let (connection, _harness) = connected(ConnectionOptions::default()).await;
    let _first = Module::new(6, &connection).unwrap();
    assert!(matches!(
        Module::new(6, &connection),
        Err(CtlabError::DuplicateModule(6))
    ));
}

// =============================================================================
// Connection state
// =============================================================================

#[tokio::test]
async fn test_module_on_unconnected_connection() {
    let (connector, _harness) = mock_stream::connector();
    let connection = Connection::new(connector, ConnectionOptions::default());
    let module = Module::new(1, &connection).unwrap();

    assert!(matches!(module.req(0).await, Err(CtlabError::NoConnection)));
    assert!(matches!(
        module.set(0, 1.0, false).await,
        Err(CtlabError::NoConnection)
    ));
}

#[tokio::test]
async fn test_reconnect_after_close() {
    let (connection, _harness) = connected(ConnectionOptions::default()).await;
    connection.close().await;
    assert!(!connection.is_connected());

    // The mock connector hands out its stream only once
    assert!(connection.connect().await.is_err());
    assert!(!connection.is_connected());
}

#[tokio::test]
async fn test_close_while_receive_pending() {
    let (connection, _harness) = connected(ConnectionOptions::default()).await;

    // Nothing is ever answered, so the read waits until the connection closes
    let pending = {
        let connection = connection.clone();
        tokio::spawn(async move { connection.receive().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!pending.is_finished());

    timeout(Duration::from_secs(2), connection.close())
        .await
        .expect("close waited on the pending read");
    assert_eq!(connection.state(), ConnectionState::Unconnected);
    assert!(matches!(
        timeout(Duration::from_secs(2), pending).await.unwrap().unwrap(),
        Err(CtlabError::NotConnected)
    ));
}

#[tokio::test]
async fn test_query_pending_on_silent_bus_fails_on_close() {
    let (connection, mut harness) = connected(ConnectionOptions::default()).await;
    let module = Module::new(1, &connection).unwrap();

    let query = {
        let module = module.clone();
        tokio::spawn(async move { module.query(0).await })
    };
    harness.expect_write(b"1:0?\r\n").await;

    timeout(Duration::from_secs(2), connection.close())
        .await
        .expect("close waited on the pending query");
    assert!(timeout(Duration::from_secs(2), query)
        .await
        .unwrap()
        .unwrap()
        .is_err());
    assert!(!connection.is_connected());
}

#[tokio::test]
async fn test_non_finite_values_never_sent() {
    let (connection, mut harness) = connected(ConnectionOptions::default()).await;
    let module = Module::new(1, &connection).unwrap();

    assert!(matches!(
        module.set(0, f64::NAN, false).await,
        Err(CtlabError::InvalidParameter(_))
    ));
    assert!(harness.take_written().is_empty());
}

#[tokio::test]
#[traced_test]
async fn test_flush_logs_discarded_bytes() {
    let options = ConnectionOptions {
        nonblocking: true,
        ..ConnectionOptions::default()
    };
    let (connection, harness) = connected(options).await;

    harness.send_response(b"#1:0=1.0\r\n").unwrap();
    assert_eq!(connection.flush().await.unwrap(), 10);
    assert!(logs_contain("Flushed stale input"));
}
