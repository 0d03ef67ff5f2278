//! End-to-end scenarios: pairing over the control plane, network transfers
//! with conflict handling, resumable local copies, and watcher-driven
//! auto-sync.

use hyperdesk_control::ControlClient;
use hyperdesk_core::models::{ConflictRule, SyncMode, TransferStatus};
use hyperdesk_integration_tests::{start_daemon, wait_for};
use hyperdesk_proto::{Envelope, MessageType};
use hyperdesk_transfer::channel::receive_file;
use hyperdesk_transfer::engine::{CopyOptions, compute_sha256, copy_with_checksum};
use rand::RngCore;
use serde_json::{Map, Value, json};
use std::fs;
use std::path::Path;
use std::time::Duration;

const MIB: usize = 1024 * 1024;

fn pairing_request_payload(code: &str) -> Map<String, Value> {
    let mut payload = Map::new();
    payload.insert("device_id".into(), json!("p1"));
    payload.insert("pair_code".into(), json!(code));
    payload.insert("device_name".into(), json!("Peer"));
    payload.insert("device_ip".into(), json!("10.0.0.2"));
    payload.insert("capabilities".into(), json!(["hyperbox"]));
    payload
}

async fn recv_until(
    client: &mut ControlClient,
    wanted: MessageType,
) -> Option<Envelope> {
    for _ in 0..32 {
        let envelope = tokio::time::timeout(Duration::from_secs(5), client.recv())
            .await
            .ok()?
            .ok()?;
        if envelope.message_type == wanted {
            return Some(envelope);
        }
    }
    None
}

async fn pair(client: &mut ControlClient, code: &str) -> Envelope {
    client
        .send(MessageType::PairingRequest, pairing_request_payload(code), None)
        .await
        .unwrap();
    recv_until(client, MessageType::PairingAccept)
        .await
        .expect("pairing accept")
}

fn random_file(path: &Path, size: usize) {
    let mut payload = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut payload);
    fs::write(path, &payload).unwrap();
}

#[tokio::test]
async fn test_pair_by_code_happy_path() {
    let dir = tempfile::tempdir().unwrap();
    let (state, controller) = start_daemon(dir.path()).await;

    controller.start_pairing();
    let code = state.pairing_code();
    assert_eq!(code.len(), 6);

    let mut client = ControlClient::new();
    client
        .connect(&format!("ws://127.0.0.1:{}/", controller.control_port()))
        .await
        .unwrap();
    let accept = pair(&mut client, &code).await;

    let token = accept.payload_str("session_token").unwrap();
    assert!(token.len() >= 16);
    assert_eq!(
        accept.payload_str("device_id"),
        Some(controller.local_device().id.as_str())
    );

    let update = recv_until(&mut client, MessageType::SessionUpdate)
        .await
        .expect("session update");
    assert_eq!(update.payload_str("status"), Some("connected"));
    assert_eq!(update.payload_str("mode"), Some("approval"));
    assert_eq!(update.payload.get("approval_required"), Some(&json!(true)));
    assert_eq!(update.payload_str("conflict_rule"), Some("keep_both"));

    let session = controller.session().expect("session established");
    assert_eq!(session.peer_device.id, "p1");
    assert_eq!(session.host_device.name, controller.local_device().name);
    assert_eq!(session.token, token);

    // Written through: the session row resolves its peer by name.
    let index = controller.session_index();
    assert!(index.iter().any(|(id, name)| *id == session.id && name == "Peer"));

    client.disconnect().await.unwrap();
    controller.shutdown().await;
}

#[tokio::test]
async fn test_wrong_pair_code_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let (state, controller) = start_daemon(dir.path()).await;

    controller.start_pairing();
    let code = state.pairing_code();
    let wrong = if code == "000000" { "000001" } else { "000000" };

    let mut client = ControlClient::new();
    client
        .connect(&format!("ws://127.0.0.1:{}/", controller.control_port()))
        .await
        .unwrap();
    client
        .send(MessageType::PairingRequest, pairing_request_payload(wrong), None)
        .await
        .unwrap();

    // No accept, no session update; the daemon stays silent.
    let answer = tokio::time::timeout(Duration::from_millis(800), client.recv()).await;
    assert!(answer.is_err(), "expected silence, got {answer:?}");
    assert!(controller.session().is_none());
    assert_eq!(state.pairing_code(), code);

    // The pairing survives for a retry with the right code.
    pair(&mut client, &code).await;
    assert!(controller.session().is_some());

    client.disconnect().await.unwrap();
    controller.shutdown().await;
}

#[tokio::test]
async fn test_local_copy_resume_scenario() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("source.bin");
    random_file(&source, 5 * MIB);
    let dest = dir.path().join("dest.bin");
    fs::write(&dest, &fs::read(&source).unwrap()[..3 * MIB]).unwrap();

    let options = CopyOptions {
        chunk_size: MIB,
        resume: true,
        ..CopyOptions::default()
    };
    let result = copy_with_checksum(&source, &dest, &options, None).unwrap();

    assert_eq!(result.bytes_copied, 5 * MIB as u64);
    assert_eq!(fs::read(&source).unwrap(), fs::read(&dest).unwrap());
    assert_eq!(result.checksum, compute_sha256(&source, MIB).unwrap());
}

#[tokio::test]
async fn test_request_approval_over_network_channel() {
    let dir = tempfile::tempdir().unwrap();
    let (state, controller) = start_daemon(dir.path()).await;

    controller.start_pairing();
    let code = state.pairing_code();
    let mut client = ControlClient::new();
    client
        .connect(&format!("ws://127.0.0.1:{}/", controller.control_port()))
        .await
        .unwrap();
    pair(&mut client, &code).await;
    let session_id = controller.session().unwrap().id;

    // Peer asks for a file that does not exist; the daemon falls back to the
    // demo payload.
    let mut request = Map::new();
    request.insert("session_id".into(), json!(session_id));
    request.insert("path".into(), json!("wanted.bin"));
    request.insert("direction".into(), json!("download"));
    request.insert("size".into(), json!(0));
    client
        .send(MessageType::TransferRequest, request, None)
        .await
        .unwrap();

    assert!(wait_for(Duration::from_secs(5), || !state.requests().is_empty()).await);
    let request_id = state.requests()[0].id.clone();

    let approver = {
        let controller = controller.clone();
        tokio::spawn(async move { controller.approve_request(&request_id).await })
    };

    let offer = recv_until(&mut client, MessageType::TransferOffer)
        .await
        .expect("transfer offer");
    assert!(
        controller
            .request_source(&state.requests()[0].id)
            .is_some_and(|source| source.ends_with("demo_payload.bin"))
    );
    let host = offer.payload_str("host").unwrap().to_string();
    let port = offer.payload.get("port").and_then(Value::as_u64).unwrap() as u16;
    assert_eq!(offer.payload_str("filename"), Some("demo_payload.bin"));
    assert_eq!(offer.payload_str("conflict_rule"), Some("keep_both"));

    let inbox = dir.path().join("peer_inbox");
    let received = tokio::task::spawn_blocking(move || {
        receive_file(&host, port, &inbox, None, ConflictRule::KeepBoth)
    })
    .await
    .unwrap()
    .unwrap();
    approver.await.unwrap();

    assert_eq!(received.bytes_received, 2 * MIB as u64);
    let demo = controller.hyperbox().root().join("demo_payload.bin");
    assert_eq!(received.checksum, compute_sha256(&demo, MIB).unwrap());

    // The daemon reports completion and finalizes the request.
    assert!(
        wait_for(Duration::from_secs(10), || {
            state
                .transfers()
                .iter()
                .any(|job| job.status == TransferStatus::Complete)
        })
        .await
    );
    assert!(
        wait_for(Duration::from_secs(5), || {
            state
                .requests()
                .iter()
                .all(|r| r.status == hyperdesk_core::models::RequestStatus::Completed)
        })
        .await
    );

    client.disconnect().await.unwrap();
    controller.shutdown().await;
}

#[tokio::test]
async fn test_outbox_auto_sync_in_mirror_mode() {
    let dir = tempfile::tempdir().unwrap();
    let (state, controller) = start_daemon(dir.path()).await;

    controller.start_pairing();
    let code = state.pairing_code();
    let mut client = ControlClient::new();
    client
        .connect(&format!("ws://127.0.0.1:{}/", controller.control_port()))
        .await
        .unwrap();
    pair(&mut client, &code).await;

    controller
        .update_sync_rules(SyncMode::Mirror, ConflictRule::KeepBoth)
        .await;

    let outbox_file = controller.hyperbox().outbox().join("x.txt");
    fs::write(&outbox_file, b"mirrored payload").unwrap();
    // A quick second write lands inside the debounce window.
    fs::write(&outbox_file, b"mirrored payload again").unwrap();

    let inbox_file = controller.hyperbox().inbox().join("x.txt");
    assert!(
        wait_for(Duration::from_secs(10), || {
            state
                .transfers()
                .iter()
                .any(|job| job.status == TransferStatus::Complete)
        })
        .await
    );
    assert!(inbox_file.exists());
    assert_eq!(
        fs::read(&outbox_file).unwrap(),
        fs::read(&inbox_file).unwrap()
    );

    // Debounce collapsed the burst into a single transfer.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(state.transfers().len(), 1);

    client.disconnect().await.unwrap();
    controller.shutdown().await;
}

#[tokio::test]
async fn test_outbox_sync_skips_on_prefer_peer_conflict() {
    let dir = tempfile::tempdir().unwrap();
    let (state, controller) = start_daemon(dir.path()).await;

    controller.start_pairing();
    let code = state.pairing_code();
    let mut client = ControlClient::new();
    client
        .connect(&format!("ws://127.0.0.1:{}/", controller.control_port()))
        .await
        .unwrap();
    pair(&mut client, &code).await;

    controller
        .update_sync_rules(SyncMode::Mirror, ConflictRule::PreferPeer)
        .await;

    let inbox_file = controller.hyperbox().inbox().join("y.txt");
    fs::write(&inbox_file, b"already here").unwrap();
    fs::write(controller.hyperbox().outbox().join("y.txt"), b"incoming").unwrap();

    assert!(
        wait_for(Duration::from_secs(10), || {
            state
                .transfers()
                .iter()
                .any(|job| job.status == TransferStatus::Skipped)
        })
        .await
    );
    // The existing inbox copy is untouched.
    assert_eq!(fs::read(&inbox_file).unwrap(), b"already here");

    client.disconnect().await.unwrap();
    controller.shutdown().await;
}
