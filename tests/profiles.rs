//! Device profile tests: DCG, ADA-IO and EDL against the in-memory bus
//!
//! Run with: `cargo test --test profiles`

use ctlab::mock_stream::{self, MockBusHarness};
use ctlab::profiles::{AnalogGroup, AnalogIo, DcgDisplay, ElectronicLoad, LoadDisplay, LoadRange, RegulatedSource};
use ctlab::{Connection, ConnectionOptions, CtlabError};
use std::sync::Arc;

async fn connected() -> (Arc<Connection>, MockBusHarness) {
    let (connector, harness) = mock_stream::connector();
    let connection = Connection::new(connector, ConnectionOptions::default());
    connection.connect().await.unwrap();
    (connection, harness)
}

// =============================================================================
// DCG
// =============================================================================

#[tokio::test]
async fn test_dcg_set_and_query_voltage() {
    let (connection, mut harness) = connected().await;
    let dcg = RegulatedSource::new(1, &connection).unwrap();

    dcg.set_voltage(10.0).await.unwrap();
    harness.expect_write(b"1:0=10.0000000000\r\n").await;

    harness.send_response(b"#1:0=9.9999999999\r\n").unwrap();
    let volts = dcg.query_voltage().await.unwrap();
    assert_eq!(volts, 9.9999999999);
    harness.expect_write(b"1:0?\r\n").await;
}

#[tokio::test]
async fn test_dcg_setpoint_channels() {
    let (connection, mut harness) = connected().await;
    let dcg = RegulatedSource::new(2, &connection).unwrap();

    dcg.set_current(0.5).await.unwrap();
    dcg.set_ramp_voltage(12.0).await.unwrap();
    dcg.set_ramp_current(1.0).await.unwrap();
    dcg.reset_charge().await.unwrap();
    dcg.set_display(DcgDisplay::Energy).await.unwrap();

    harness.expect_write(b"2:1=0.5000000000\r\n").await;
    harness.expect_write(b"2:20=12.0000000000\r\n").await;
    harness.expect_write(b"2:21=1.0000000000\r\n").await;
    harness.expect_write(b"2:7=0\r\n").await;
    harness.expect_write(b"2:80=6\r\n").await;
}

#[tokio::test]
async fn test_dcg_constant_current_status() {
    let (connection, mut harness) = connected().await;
    let dcg = RegulatedSource::new(1, &connection).unwrap();

    harness.send_response(b"#1:255=4 [ICONST]\r\n").unwrap();
    let status = dcg.query_status_flags().await.unwrap();
    harness.expect_write(b"1:255?\r\n").await;

    assert!(status.constant_current);
    assert!(dcg.is_constant_current().unwrap());

    harness.send_response(b"#1:255=0\r\n").unwrap();
    assert!(!dcg.query_status_flags().await.unwrap().constant_current);
}

#[tokio::test]
async fn test_dcg_measurements() {
    let (connection, harness) = connected().await;
    let dcg = RegulatedSource::new(1, &connection).unwrap();

    harness
        .send_response(b"#1:10=4.98\r\n#1:11=0.201\r\n#1:233=31.5\r\n")
        .unwrap();
    connection.receive().await.unwrap();

    assert_eq!(dcg.measured_voltage().unwrap(), 4.98);
    assert_eq!(dcg.measured_current().unwrap(), 0.201);
    assert_eq!(dcg.temperature().unwrap(), 31.5);
    assert!(dcg.charge().is_err());
}

// =============================================================================
// ADA-IO
// =============================================================================

#[tokio::test]
async fn test_adaio_rejects_bad_parameters_without_io() {
    let (connection, mut harness) = connected().await;
    let io = AnalogIo::new(4, &connection).unwrap();

    for (index, volts) in [(0, 10.5), (3, -10.01), (8, 1.0), (0, f64::NAN)] {
        assert!(matches!(
            io.set_output(index, volts).await,
            Err(CtlabError::InvalidParameter(_))
        ));
    }
    assert!(matches!(
        io.req_voltage(AnalogGroup::FineInput, 8).await,
        Err(CtlabError::InvalidParameter(_))
    ));
    assert!(matches!(
        io.set_display(AnalogGroup::CoarseInput, 9).await,
        Err(CtlabError::InvalidParameter(_))
    ));

    assert!(harness.take_written().is_empty());
}

#[tokio::test]
async fn test_adaio_channel_groups() {
    let (connection, mut harness) = connected().await;
    let io = AnalogIo::new(4, &connection).unwrap();

    io.set_output(7, -10.0).await.unwrap();
    harness.expect_write(b"4:27=-10.0000000000\r\n").await;

    io.set_display(AnalogGroup::FineInput, 2).await.unwrap();
    harness.expect_write(b"4:80=12\r\n").await;

    harness.send_response(b"#4:13=1.2345\r\n").unwrap();
    assert_eq!(io.query_fine_input(3).await.unwrap(), 1.2345);
    harness.expect_write(b"4:13?\r\n").await;

    harness.send_response(b"#4:3=0.5\r\n").unwrap();
    assert_eq!(io.query_coarse_input(3).await.unwrap(), 0.5);
    assert_eq!(io.voltage(AnalogGroup::FineInput, 3).unwrap(), 1.2345);
}

// =============================================================================
// EDL
// =============================================================================

#[tokio::test]
async fn test_edl_rejects_bad_codes_without_io() {
    let (connection, mut harness) = connected().await;
    let edl = ElectronicLoad::new(2, &connection).unwrap();

    assert!(matches!(
        edl.set_range_code(7).await,
        Err(CtlabError::InvalidParameter(_))
    ));
    assert!(matches!(
        edl.set_display_code(-1).await,
        Err(CtlabError::InvalidParameter(_))
    ));
    assert!(harness.take_written().is_empty());

    edl.set_range_code(5).await.unwrap();
    harness.expect_write(b"2:19=5\r\n").await;
}

#[tokio::test]
async fn test_edl_device_enumeration_violation() {
    let (connection, harness) = connected().await;
    let edl = ElectronicLoad::new(2, &connection).unwrap();

    harness.send_response(b"#2:19=9\r\n").unwrap();
    match edl.query_range().await {
        Err(CtlabError::Communication(msg)) => assert_eq!(msg, "rng = 9"),
        other => panic!("expected communication error, got {:?}", other),
    }
    assert!(edl.range().is_err());

    harness.send_response(b"#2:80=2\r\n").unwrap();
    assert_eq!(edl.query_display().await.unwrap(), LoadDisplay::Mode);

    harness.send_response(b"#2:19=2\r\n").unwrap();
    assert_eq!(edl.query_range().await.unwrap(), LoadRange::CurrentLow);
}

#[tokio::test]
async fn test_edl_trigger_mode_writes_only_on_change() {
    let (connection, mut harness) = connected().await;
    let edl = ElectronicLoad::new(2, &connection).unwrap();
    assert_eq!(edl.trigger_mode(), 0);

    assert!(!edl.set_trigger_input_enabled(false).await.unwrap());
    assert!(edl.set_trigger_input_enabled(true).await.unwrap());
    harness.expect_write(b"2:240=1\r\n").await;

    assert!(!edl.set_trigger_input_enabled(true).await.unwrap());
    assert!(edl.set_auto_trigger_enabled(true).await.unwrap());
    harness.expect_write(b"2:240=3\r\n").await;

    assert!(edl.set_trigger_input_enabled(false).await.unwrap());
    harness.expect_write(b"2:240=2\r\n").await;
    assert_eq!(edl.trigger_mode(), 2);
    assert!(harness.take_written().is_empty());
}

#[tokio::test]
async fn test_edl_trigger_mirror_follows_device() {
    let (connection, mut harness) = connected().await;
    let edl = ElectronicLoad::new(2, &connection).unwrap();

    harness.send_response(b"#2:240=3\r\n").unwrap();
    assert_eq!(edl.query_trigger_mode().await.unwrap(), 3);
    harness.expect_write(b"2:240?\r\n").await;

    // Already set on the device: no write
    assert!(!edl.set_auto_trigger_enabled(true).await.unwrap());
    assert!(harness.take_written().is_empty());
}

#[tokio::test]
async fn test_edl_counter_resets_use_reset_channels() {
    let (connection, mut harness) = connected().await;
    let edl = ElectronicLoad::new(2, &connection).unwrap();

    edl.reset_charge().await.unwrap();
    edl.reset_energy().await.unwrap();
    harness.expect_write(b"2:8=0\r\n").await;
    harness.expect_write(b"2:9=0\r\n").await;
    assert!(harness.take_written().is_empty());

    // Counters are still read from 7 and 8
    harness.send_response(b"#2:7=120.5\r\n#2:8=1500\r\n").unwrap();
    connection.receive().await.unwrap();
    assert_eq!(edl.charge().unwrap(), 120.5);
    assert_eq!(edl.energy().unwrap(), 1500.0);
}

#[tokio::test]
async fn test_edl_setpoints_and_readback() {
    let (connection, mut harness) = connected().await;
    let edl = ElectronicLoad::new(2, &connection).unwrap();

    edl.set_enabled(true).await.unwrap();
    edl.set_current(1.5).await.unwrap();
    edl.set_ripple_on(20).await.unwrap();
    edl.req_all().await.unwrap();
    harness.expect_write(b"2:0=1\r\n").await;
    harness.expect_write(b"2:1=1.5000000000\r\n").await;
    harness.expect_write(b"2:27=20\r\n").await;
    harness.expect_write(b"2:99?\r\n").await;

    harness
        .send_response(b"#2:0=1\r\n#2:10=11.9\r\n#2:16=0.002\r\n#2:29=5\r\n")
        .unwrap();
    connection.receive().await.unwrap();
    assert!(edl.enabled().unwrap());
    assert_eq!(edl.voltage_on().unwrap(), 11.9);
    assert_eq!(edl.current_off().unwrap(), 0.002);
    assert_eq!(edl.ripple_amplitude().unwrap(), 5);
}
