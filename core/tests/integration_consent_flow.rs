//! End-to-end consent flows through `ConsentCentral` and a simulated central:
//! scan, connect and read, accept, revoke, and the failure paths in between.

use adpc_core::testing::{FakeCentral, FakeOperation, ReadySignal, SimulatedPeripheral};
use adpc_core::{
    event_channel, AdpcError, CentralConfig, ConsentCentral, ConsentId, ConsentRecord,
    MemoryStorage, PeripheralId, ProtocolError, RemoveOutcome, RetryPolicy, TransportError,
    UpsertOutcome,
};
use std::sync::Arc;
use std::time::Duration;

fn test_config() -> CentralConfig {
    CentralConfig {
        settle_delay_ms: 0,
        retry: RetryPolicy::none(),
        scan_on_radio_on: false,
        ..Default::default()
    }
}

fn consent(id: &str, summary: &str) -> ConsentRecord {
    ConsentRecord {
        id: ConsentId::new(id),
        device_name: "Router".to_string(),
        summary: summary.to_string(),
        purposes: "Network diagnostics".to_string(),
        data_category: "Device identifiers".to_string(),
        legal_bases: "Consent".to_string(),
        storage: "On device".to_string(),
        duration: "30 days".to_string(),
        location: "Living room".to_string(),
        ..Default::default()
    }
}

fn serve(fake: &FakeCentral, id: &str, name: &str, record: &ConsentRecord) {
    let peripheral = SimulatedPeripheral::new(id, name, -55)
        .with_record(record)
        .expect("encodable record");
    fake.add_peripheral(peripheral);
}

fn start(fake: &Arc<FakeCentral>, config: CentralConfig) -> ConsentCentral {
    let (tx, rx) = event_channel();
    fake.attach_events(tx);
    ConsentCentral::start(fake.clone(), Arc::new(MemoryStorage::new()), config, rx)
        .expect("central starts")
}

async fn discover(central: &ConsentCentral, count: usize) {
    central.scan().await.expect("scan");
    let mut discovered = central.registry().subscribe_discovered();
    tokio::time::timeout(
        Duration::from_secs(2),
        discovered.wait_for(|peripherals| peripherals.len() >= count),
    )
    .await
    .expect("discovery timed out")
    .expect("registry alive");
}

#[tokio::test]
async fn test_connect_stores_consent_once() {
    let fake = Arc::new(FakeCentral::new());
    serve(&fake, "P1", "Router", &consent("q1", "Logs traffic volume"));
    let central = start(&fake, test_config());
    discover(&central, 1).await;

    let p1 = PeripheralId::new("P1");
    let outcome = central.connect(&p1).await.expect("connect");
    assert_eq!(outcome.stored, UpsertOutcome::CreatedEntry);

    // Ledger [] -> [{P1, Router, [q1]}]
    let ledger = central.consents();
    assert_eq!(ledger.len(), 1);
    assert_eq!(ledger[0].peripheral_id, "P1");
    assert_eq!(ledger[0].device_name, "Router");
    assert_eq!(ledger[0].consents, vec![consent("q1", "Logs traffic volume")]);
    assert_eq!(central.connected().len(), 1);

    // Reading the same consent again leaves the ledger unchanged
    central.disconnect(&p1).await.expect("disconnect");
    let outcome = central.connect(&p1).await.expect("reconnect");
    assert_eq!(outcome.stored, UpsertOutcome::Duplicate);
    assert_eq!(central.consents(), ledger);
}

#[tokio::test]
async fn test_revoke_non_last_then_last_consent() {
    let fake = Arc::new(FakeCentral::new());
    serve(&fake, "P1", "Router", &consent("q1", "first"));
    let central = start(&fake, test_config());
    discover(&central, 1).await;
    let p1 = PeripheralId::new("P1");

    central.connect(&p1).await.expect("connect q1");
    central.disconnect(&p1).await.expect("disconnect");
    serve(&fake, "P1", "Router", &consent("q2", "second"));
    central.connect(&p1).await.expect("connect q2");

    // [q1, q2] -> [q2]
    let outcome = central
        .revoke_consent(&p1, &ConsentId::new("q1"))
        .await
        .expect("revoke q1");
    assert!(outcome.is_complete());
    assert_eq!(outcome.removed, Ok(RemoveOutcome::Removed));
    let entry = central.ledger().entry("P1").expect("entry kept");
    assert_eq!(entry.device_name, "Router");
    assert_eq!(entry.consents, vec![consent("q2", "second")]);

    // [q2] -> ledger []
    let outcome = central
        .revoke_consent(&p1, &ConsentId::new("q2"))
        .await
        .expect("revoke q2");
    assert_eq!(outcome.removed, Ok(RemoveOutcome::EntryRemoved));
    assert!(central.consents().is_empty());

    let sent: Vec<Vec<u8>> = fake.writes().into_iter().map(|w| w.data).collect();
    assert_eq!(sent, vec![b"delete:q1".to_vec(), b"delete:q2".to_vec()]);
}

#[tokio::test]
async fn test_accept_sends_flat_frame() {
    let fake = Arc::new(FakeCentral::new());
    serve(&fake, "P1", "Router", &consent("q1", "first"));
    let central = start(&fake, test_config());
    discover(&central, 1).await;
    let p1 = PeripheralId::new("P1");
    central.connect(&p1).await.expect("connect");

    central
        .give_consents(&p1, &[ConsentId::new("q1"), ConsentId::new("q2")])
        .await
        .expect("accept");
    central
        .give_consent(&p1, &ConsentId::new("q7"))
        .await
        .expect("accept single");

    let writes = fake.writes();
    assert_eq!(writes[0].data, b"q1;q2".to_vec());
    assert_eq!(writes[1].data, b"q7".to_vec());
}

#[tokio::test]
async fn test_revoke_without_short_code_touches_nothing() {
    let fake = Arc::new(FakeCentral::new());
    serve(&fake, "P1", "Router", &consent("camera", "no short code"));
    let central = start(&fake, test_config());
    discover(&central, 1).await;
    let p1 = PeripheralId::new("P1");
    central.connect(&p1).await.expect("connect");

    let result = central.revoke_consent(&p1, &ConsentId::new("camera")).await;
    assert!(matches!(
        result,
        Err(AdpcError::Protocol(ProtocolError::MissingShortCode(_)))
    ));
    let direct = central.delete_consent(&p1, &ConsentId::new("camera")).await;
    assert!(direct.is_err());

    assert!(fake.writes().is_empty());
    assert!(central.query_consent("P1", "camera").is_some());
}

#[tokio::test]
async fn test_revoke_reports_partial_failure() {
    let fake = Arc::new(FakeCentral::new());
    serve(&fake, "P1", "Router", &consent("q3", "third"));
    let central = start(&fake, test_config());
    discover(&central, 1).await;
    let p1 = PeripheralId::new("P1");
    central.connect(&p1).await.expect("connect");

    fake.fail(FakeOperation::Write, TransportError::WriteFailed("out of range".into()));
    let outcome = central
        .revoke_consent(&p1, &ConsentId::new("q3"))
        .await
        .expect("revoke attempted");

    assert!(outcome.is_partial());
    assert_eq!(
        outcome.transmitted,
        Err(AdpcError::Transport(TransportError::WriteFailed(
            "out of range".into()
        )))
    );
    assert_eq!(outcome.removed, Ok(RemoveOutcome::EntryRemoved));
}

#[tokio::test]
async fn test_failed_connect_leaves_ledger_alone() {
    let fake = Arc::new(FakeCentral::new());
    serve(&fake, "P1", "Router", &consent("q1", "first"));
    let central = start(&fake, test_config());
    discover(&central, 1).await;
    fake.fail(
        FakeOperation::DiscoverServices,
        TransportError::ServiceDiscoveryFailed("no consent service".into()),
    );

    let p1 = PeripheralId::new("P1");
    let result = central.connect(&p1).await;
    assert!(matches!(
        result,
        Err(AdpcError::Transport(TransportError::ServiceDiscoveryFailed(_)))
    ));
    assert!(central.consents().is_empty());
    assert!(central.connected().is_empty());
    assert!(!fake.is_connected(&p1));
}

#[tokio::test]
async fn test_truncated_frame_still_stores_leading_fields() {
    let fake = Arc::new(FakeCentral::new());
    let full = adpc_core::ConsentCodec::encode_record(&consent("q5", "cut short"))
        .expect("encodable");
    // Keep the id and device name, cut inside the summary
    let cut = 1 + 2 + 1 + 6 + 4;
    fake.add_peripheral(
        SimulatedPeripheral::new("P5", "Sensor", -60).with_frame(full[..cut].to_vec()),
    );
    let central = start(&fake, test_config());
    discover(&central, 1).await;

    let outcome = central
        .connect(&PeripheralId::new("P5"))
        .await
        .expect("connect");
    assert_eq!(outcome.record.id, "q5");
    assert_eq!(outcome.record.device_name, "Router");
    assert_eq!(outcome.record.summary, "");
    assert_eq!(outcome.record.location, "");
}

#[tokio::test]
async fn test_connect_waits_for_ready_event() {
    let fake = Arc::new(FakeCentral::new());
    fake.set_ready_signal(ReadySignal::Emit);
    serve(&fake, "P1", "Router", &consent("q1", "first"));
    let central = start(
        &fake,
        CentralConfig {
            // A settle delay this long would fail the timeout below
            settle_delay_ms: 60_000,
            ..test_config()
        },
    );
    discover(&central, 1).await;

    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        central.connect(&PeripheralId::new("P1")),
    )
    .await
    .expect("ready event should release the read")
    .expect("connect");
    assert_eq!(outcome.record.id, "q1");
}

#[tokio::test]
async fn test_reconnect_after_disconnect_with_ready_events() {
    let fake = Arc::new(FakeCentral::new());
    fake.set_ready_signal(ReadySignal::Emit);
    serve(&fake, "P1", "Router", &consent("q1", "first"));
    let central = start(&fake, test_config());
    discover(&central, 1).await;
    let id = PeripheralId::new("P1");

    central.connect(&id).await.expect("first connect");
    central.disconnect(&id).await.expect("disconnect");
    assert!(central.connected().is_empty());

    let outcome = tokio::time::timeout(Duration::from_secs(5), central.connect(&id))
        .await
        .expect("reconnect timed out")
        .expect("reconnect");
    assert_eq!(outcome.stored, UpsertOutcome::Duplicate);
    assert_eq!(central.connected().len(), 1);
    assert_eq!(central.connected()[0].id, id);
    assert_eq!(fake.connect_calls().len(), 2);
}

#[tokio::test]
async fn test_search_and_registrations() {
    let fake = Arc::new(FakeCentral::new());
    serve(&fake, "P1", "Router", &consent("q1", "Logs traffic volume"));
    serve(&fake, "P2", "Doorbell", &consent("q2", "Records video at the door"));
    let central = start(&fake, test_config());
    discover(&central, 2).await;
    central.connect(&PeripheralId::new("P1")).await.expect("connect P1");
    central.connect(&PeripheralId::new("P2")).await.expect("connect P2");

    let hits = central.search_consents("VIDEO");
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].peripheral_id, "P2");
    assert_eq!(central.search_consents("doorbell").len(), 1);
    assert_eq!(central.search_consents("").len(), 2);

    central
        .register_device(adpc_core::RegisteredDevice::new(
            "AA:BB:CC:DD:EE:FF",
            "Router",
            "network",
            "SN-42",
        ))
        .expect("register");
    assert_eq!(central.registered_devices().len(), 1);
}
