//! Reference peer client.
//!
//! Connects to a daemon's control plane, redeems a pairing code, optionally
//! requests a remote path, and fetches offered files over the framed TCP
//! channel while reporting `TRANSFER_STATUS` back on the bus.

use anyhow::Context;
use hyperdesk_control::ControlClient;
use hyperdesk_core::models::ConflictRule;
use hyperdesk_discovery::local_identity;
use hyperdesk_proto::{Envelope, MessageType};
use hyperdesk_transfer::channel::{ReceiveResult, receive_file};
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::{Map, Value, json};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::sync::mpsc;

/// Run the peer flow until the connection drops.
pub async fn run_peer(
    host: &str,
    port: u16,
    pair_code: &str,
    request_path: Option<&str>,
    inbox_dir: &Path,
) -> anyhow::Result<()> {
    let mut client = ControlClient::new();
    client
        .connect(&format!("ws://{host}:{port}/"))
        .await
        .context("could not reach the daemon's control plane")?;

    let device_id = uuid::Uuid::new_v4().to_string();
    let (device_name, device_ip) = local_identity();
    let mut payload = Map::new();
    payload.insert("device_id".into(), json!(device_id));
    payload.insert("pair_code".into(), json!(pair_code));
    payload.insert("device_name".into(), json!(device_name.clone()));
    payload.insert("device_ip".into(), json!(device_ip));
    payload.insert("capabilities".into(), json!(["hyperbox", "requests"]));
    client
        .send(MessageType::PairingRequest, payload, None)
        .await?;
    println!("[peer] Pairing request sent from {device_name}.");

    let mut session_id: Option<String> = None;
    loop {
        let envelope = match client.recv().await {
            Ok(envelope) => envelope,
            Err(error) => {
                println!("[peer] Connection closed: {error}");
                return Ok(());
            }
        };
        println!("[peer] Received: {}", envelope.message_type);

        match envelope.message_type {
            MessageType::PairingAccept => {
                let id = envelope.payload_str("session_id").unwrap_or_default();
                let token = envelope.payload_str("session_token").unwrap_or_default();
                session_id = Some(id.to_string());
                println!(
                    "[peer] Session active: {id} token={}...",
                    &token[..8.min(token.len())]
                );
                if let (Some(path), Some(session)) = (request_path, session_id.as_deref()) {
                    let mut request = Map::new();
                    request.insert("session_id".into(), json!(session));
                    request.insert("path".into(), json!(path));
                    request.insert("direction".into(), json!("download"));
                    request.insert("size".into(), json!(0));
                    request.insert("requester".into(), json!(device_name.clone()));
                    client
                        .send(MessageType::TransferRequest, request, None)
                        .await?;
                    println!("[peer] Requested file: {path}");
                }
            }
            MessageType::SessionUpdate => {
                let status = envelope.payload_str("status").unwrap_or_default();
                println!("[peer] Session status: {status}");
            }
            MessageType::TransferOffer => {
                fetch_offer(&mut client, &envelope, host, inbox_dir).await?;
            }
            MessageType::TransferStatus => {
                let progress = envelope
                    .payload
                    .get("progress")
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0);
                println!("[peer] Transfer progress: {:.0}%", progress * 100.0);
            }
            _ => {}
        }
    }
}

/// Fetch one offered file over the framed TCP channel, streaming
/// `TRANSFER_STATUS` updates back on the control connection.
async fn fetch_offer(
    client: &mut ControlClient,
    envelope: &Envelope,
    control_host: &str,
    inbox_dir: &Path,
) -> anyhow::Result<()> {
    let offer_host = envelope
        .payload_str("host")
        .unwrap_or(control_host)
        .to_string();
    let offer_port = envelope
        .payload
        .get("port")
        .and_then(Value::as_u64)
        .unwrap_or(0) as u16;
    let filename = envelope
        .payload_str("filename")
        .unwrap_or("file.bin")
        .to_string();
    let size = envelope
        .payload
        .get("size")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let job_id = envelope.payload_str("job_id").map(str::to_owned);
    let conflict_rule = envelope
        .payload_str("conflict_rule")
        .map(ConflictRule::parse)
        .unwrap_or(ConflictRule::KeepBoth);
    println!("[peer] Receiving file: {filename} from {offer_host}:{offer_port}");

    let bar = ProgressBar::new(size);
    bar.set_style(
        ProgressStyle::with_template(
            "{bar:40.cyan/blue} {bytes}/{total_bytes} ({bytes_per_sec}, ETA {eta})",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );

    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<(u64, u64)>();
    let inbox: PathBuf = inbox_dir.to_path_buf();
    let receive_host = offer_host.clone();
    let mut receiver = tokio::task::spawn_blocking(move || {
        let callback = move |bytes: u64, total: u64| {
            let _ = progress_tx.send((bytes, total));
        };
        receive_file(
            &receive_host,
            offer_port,
            &inbox,
            Some(&callback),
            conflict_rule,
        )
    });

    let mut last_report = (0u64, Instant::now());
    let result: ReceiveResult = loop {
        tokio::select! {
            progress = progress_rx.recv() => {
                if let Some((bytes, total)) = progress {
                    bar.set_position(bytes);
                    if let Some(job_id) = &job_id {
                        let now = Instant::now();
                        let delta_bytes = bytes.saturating_sub(last_report.0) as f64;
                        let delta_time = now.duration_since(last_report.1).as_secs_f64().max(0.0001);
                        last_report = (bytes, now);
                        let rate_mbps = (delta_bytes / delta_time) / (1024.0 * 1024.0);
                        let status = transfer_status_payload(
                            job_id, &filename, "receiving",
                            if total > 0 { bytes as f64 / total as f64 } else { 1.0 },
                            "", bytes, total, rate_mbps,
                        );
                        let _ = client.send(MessageType::TransferStatus, status, None).await;
                    }
                }
            }
            joined = &mut receiver => {
                break joined.context("receive worker died")??;
            }
        }
    };

    let (status, checksum) = if result.skipped {
        bar.finish_with_message("skipped");
        ("skipped", String::new())
    } else {
        bar.finish();
        ("complete", result.checksum.clone())
    };
    if let Some(job_id) = &job_id {
        let payload = transfer_status_payload(
            job_id,
            &filename,
            status,
            1.0,
            &checksum,
            result.bytes_received,
            result.bytes_received,
            0.0,
        );
        client.send(MessageType::TransferStatus, payload, None).await?;
    }
    println!("[peer] File saved to: {}", result.path.display());
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn transfer_status_payload(
    job_id: &str,
    path: &str,
    status: &str,
    progress: f64,
    checksum: &str,
    bytes_copied: u64,
    size: u64,
    rate_mbps: f64,
) -> Map<String, Value> {
    let mut payload = Map::new();
    payload.insert("job_id".into(), json!(job_id));
    payload.insert("path".into(), json!(path));
    payload.insert("status".into(), json!(status));
    payload.insert("progress".into(), json!(progress));
    payload.insert("checksum".into(), json!(checksum));
    payload.insert("bytes_copied".into(), json!(bytes_copied));
    payload.insert("size".into(), json!(size));
    payload.insert("direction".into(), json!("download"));
    payload.insert("rate_mbps".into(), json!(rate_mbps));
    payload
}
