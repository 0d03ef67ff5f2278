//! The controller binds every component and runs the daemon's brain.
//!
//! All controller-owned state (active session, pending pairing) is mutated
//! only through short critical sections on the controller's locks; transfer
//! workers run on blocking threads and report back through the app-state bus
//! and the store, never by touching controller fields directly.

use crate::requests::RequestQueue;
use crate::settings::TransferSettings;
use dashmap::DashMap;
use hyperdesk_control::{ControlError, ControlServer, MessageHandler};
use hyperdesk_core::hyperbox::HyperboxManager;
use hyperdesk_core::models::{
    ConflictRule, Device, EditMode, FileRequest, PairingSession, PermissionPolicy,
    PresenceStatus, RequestStatus, Requester, Session, SessionStatus, SyncMode,
    TransferDirection, TransferJob, TransferStatus,
};
use hyperdesk_core::pairing::{PairingError, PairingManager};
use hyperdesk_core::state::AppState;
use hyperdesk_core::watcher::{EventCallback, HyperboxWatcher, WatchEventKind};
use hyperdesk_discovery::{NetworkDiscovery, ServiceAnnouncer, build_local_device};
use hyperdesk_proto::{Envelope, MessageType};
use hyperdesk_store::{Store, StoreError};
use hyperdesk_transfer::channel::FileSender;
use hyperdesk_transfer::engine::{CopyOptions, copy_with_checksum};
use hyperdesk_transfer::{TransferError, TransferResult};
use serde_json::{Map, Value, json};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::mpsc;

/// Debounce window for filesystem events on a recently transferred path.
const WATCH_DEBOUNCE: Duration = Duration::from_secs(1);

/// Controller errors.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Persistence failure during startup
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Hyperbox or database directory failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Control server failure
    #[error("control error: {0}")]
    Control(#[from] ControlError),

    /// Watcher failure
    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),

    /// Pairing failure
    #[error("pairing error: {0}")]
    Pairing(#[from] PairingError),

    /// Bulk-payload encryption is advertised but not implemented
    #[error("encrypted bulk transfer is not supported; refusing encryption=true")]
    EncryptionUnsupported,
}

/// Startup configuration.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Control-plane bind host
    pub control_host: String,
    /// Control-plane bind port (0 for ephemeral)
    pub control_port: u16,
    /// Hyperbox root, `<cwd>/hyperbox` when `None`
    pub hyperbox_root: Option<PathBuf>,
    /// Database path, `<cwd>/data/hyperdesk.db` when `None`
    pub db_path: Option<PathBuf>,
    /// Device cap for a discovery scan
    pub scan_limit: usize,
    /// Browse window for a discovery scan
    pub scan_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            control_host: "127.0.0.1".to_string(),
            control_port: hyperdesk_core::CONTROL_PORT,
            hyperbox_root: None,
            db_path: None,
            scan_limit: 6,
            scan_timeout: Duration::from_millis(1500),
        }
    }
}

/// The daemon orchestrator.
pub struct Controller {
    state: Arc<AppState>,
    store: Arc<Store>,
    discovery: NetworkDiscovery,
    pairing: PairingManager,
    hyperbox: HyperboxManager,
    requests: RequestQueue,
    local_device: Device,
    announcer: Option<ServiceAnnouncer>,
    watcher: HyperboxWatcher,
    control: OnceLock<Arc<ControlServer>>,
    control_port: u16,
    bound_port: OnceLock<u16>,
    self_ref: OnceLock<Weak<Controller>>,
    session: Mutex<Option<Session>>,
    pending_pairing: Mutex<Option<PairingSession>>,
    last_transfer_by_path: DashMap<PathBuf, Instant>,
    transfer_metrics: DashMap<String, (u64, Instant)>,
    request_transfer_map: DashMap<String, PathBuf>,
    closing: AtomicBool,
    scan_limit: usize,
    scan_timeout: Duration,
}

impl Controller {
    /// Build and start the daemon: open the store and hyperbox, record the
    /// local device, start the announcer (errors suppressed), the watcher,
    /// and the control server.
    ///
    /// # Errors
    ///
    /// Returns an error when the store, hyperbox, watcher, or control server
    /// cannot start. mDNS announcement failure is not fatal.
    pub async fn start(
        config: ControllerConfig,
        state: Arc<AppState>,
    ) -> Result<Arc<Self>, ControllerError> {
        let store = Arc::new(match &config.db_path {
            Some(path) => Store::open(path)?,
            None => Store::open_default()?,
        });
        let hyperbox = match &config.hyperbox_root {
            Some(root) => HyperboxManager::new(root.clone())?,
            None => HyperboxManager::default_location()?,
        };
        let discovery = NetworkDiscovery::new();
        let local_device = build_local_device();
        store.record_device(&local_device)?;

        let announcer = if discovery.use_mdns() {
            let announcer = ServiceAnnouncer::new(local_device.clone(), config.control_port);
            match announcer.start() {
                Ok(()) => Some(announcer),
                Err(error) => {
                    tracing::warn!("mDNS announcement unavailable: {error}");
                    None
                }
            }
        } else {
            None
        };

        let (watch_tx, watch_rx) = mpsc::unbounded_channel();
        let callback: EventCallback = Arc::new(move |kind, path| {
            let _ = watch_tx.send((kind, path));
        });
        let watcher = HyperboxWatcher::new(hyperbox.root(), callback);

        let controller = Arc::new(Self {
            state,
            store: Arc::clone(&store),
            discovery,
            pairing: PairingManager::new(),
            hyperbox,
            requests: RequestQueue::new(store),
            local_device,
            announcer,
            watcher,
            control: OnceLock::new(),
            control_port: config.control_port,
            bound_port: OnceLock::new(),
            self_ref: OnceLock::new(),
            session: Mutex::new(None),
            pending_pairing: Mutex::new(None),
            last_transfer_by_path: DashMap::new(),
            transfer_metrics: DashMap::new(),
            request_transfer_map: DashMap::new(),
            closing: AtomicBool::new(false),
            scan_limit: config.scan_limit,
            scan_timeout: config.scan_timeout,
        });

        let _ = controller.self_ref.set(Arc::downgrade(&controller));
        controller.watcher.start()?;
        controller.spawn_watch_pump(watch_rx);
        controller.start_control_server(&config.control_host).await?;
        Ok(controller)
    }

    fn spawn_watch_pump(
        &self,
        mut watch_rx: mpsc::UnboundedReceiver<(WatchEventKind, PathBuf)>,
    ) {
        let weak = self.weak();
        tokio::spawn(async move {
            while let Some((kind, path)) = watch_rx.recv().await {
                let Some(controller) = weak.upgrade() else {
                    break;
                };
                controller.handle_hyperbox_event(kind, path).await;
            }
        });
    }

    async fn start_control_server(&self, host: &str) -> Result<(), ControllerError> {
        self.state
            .add_log(format!("Starting control server on {host}:{}...", self.control_port));
        let weak = self.weak();
        let handler: MessageHandler = Arc::new(move |envelope: Envelope| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(controller) = weak.upgrade() {
                    controller.handle_control_message(envelope).await;
                }
            })
        });
        let server = Arc::new(ControlServer::new(host, self.control_port, handler));
        let bound = server.start().await?;
        let _ = self.bound_port.set(bound);
        self.state
            .add_log(format!("Control server listening on {host}:{bound}."));
        let _ = self.control.set(server);
        Ok(())
    }

    /// The control port actually bound (differs from the configured port
    /// when that was 0).
    #[must_use]
    pub fn control_port(&self) -> u16 {
        *self.bound_port.get().unwrap_or(&self.control_port)
    }

    /// The local device record.
    #[must_use]
    pub fn local_device(&self) -> &Device {
        &self.local_device
    }

    /// The hyperbox layout.
    #[must_use]
    pub fn hyperbox(&self) -> &HyperboxManager {
        &self.hyperbox
    }

    /// The active session, if any.
    #[must_use]
    pub fn session(&self) -> Option<Session> {
        self.lock_session().clone()
    }

    /// Scan for devices, publish and persist the result.
    pub async fn scan(&self) {
        let discovery = self.discovery.clone();
        let (limit, timeout) = (self.scan_limit, self.scan_timeout);
        let found = tokio::task::spawn_blocking(move || discovery.scan(limit, timeout))
            .await
            .unwrap_or_default();
        let devices = dedupe_local(&self.local_device, found);
        self.state.set_devices(devices.clone());
        for device in &devices {
            self.persist(self.store.record_device(device));
        }
        self.state
            .add_log(format!("Scan complete: {} device(s) found.", devices.len()));
    }

    /// Create a pairing and publish its code. Requires no active session and
    /// no outstanding pairing.
    pub fn start_pairing(&self) {
        if self.lock_session().is_some() {
            self.state
                .add_log("Disconnect before starting a new pairing session.");
            return;
        }
        let mut pending = self.lock_pending();
        if pending.is_some() {
            self.state.add_log("Pairing session already active.");
            return;
        }
        let pairing = self.pairing.create_pairing(self.local_device.clone());
        self.state.set_pairing_code(pairing.code.clone());
        *pending = Some(pairing);
        drop(pending);
        self.state
            .add_log("Pairing session created. Awaiting peer request.");
    }

    /// Pair directly with a known device using its per-device sync preset,
    /// skipping the code exchange.
    pub async fn link_to_device(&self, device: Device) {
        let (mode, conflict_rule) = self.device_sync_preset(&device.id);
        let pairing = self.pairing.create_pairing(self.local_device.clone());
        *self.lock_pending() = None;
        self.state.set_pairing_code(pairing.code.clone());

        let code = pairing.code.clone();
        let session = match self.pairing.confirm_pairing(
            &pairing,
            &code,
            device.clone(),
            mode,
            conflict_rule,
        ) {
            Ok(session) => session,
            Err(error) => {
                // Unreachable with the pairing's own code; keep the log honest.
                self.state.add_log(format!("Pairing failed: {error}"));
                return;
            }
        };

        *self.lock_session() = Some(session.clone());
        self.state.set_session(Some(session.clone()));
        self.state.set_transfers(Vec::new());
        self.persist(self.store.record_device(&device));
        self.persist(self.store.record_session(&session));
        self.persist(self.store.record_audit_event(
            &session.id,
            "session_linked",
            &format!("Linked to {}.", device.name),
        ));
        self.publish_requests(&session.id);
        self.state
            .add_log(format!("Linked to {} with code {}.", device.name, code));
        self.state
            .add_log(format!("Session token issued: {}...", &session.token[..8.min(session.token.len())]));
        self.broadcast_session_update(&session).await;
    }

    /// Tear down the active session. The row stays in the store as
    /// `disconnected` for audit.
    pub async fn disconnect(&self) {
        let Some(session) = self.lock_session().take() else {
            return;
        };
        let peer_name = session.peer_device.name.clone();
        self.state.set_session(None);
        self.state.set_pairing_code("");
        self.state.set_transfers(Vec::new());
        self.state.set_requests(Vec::new());
        *self.lock_pending() = None;
        self.persist(
            self.store
                .update_session_status(&session.id, SessionStatus::Disconnected),
        );
        self.persist(self.store.record_audit_event(
            &session.id,
            "session_disconnected",
            &format!("Disconnected from {peer_name}."),
        ));
        self.state.add_log(format!("Disconnected from {peer_name}."));
        self.broadcast_raw_session_update(
            &session.id,
            SessionStatus::Disconnected.as_str(),
            "",
            false,
            ConflictRule::KeepBoth.as_str(),
        )
        .await;
    }

    /// Start a local (non-network) transfer of the demo payload into the
    /// inbox.
    pub async fn simulate_transfer(&self) {
        if self.lock_session().is_none() {
            self.state.add_log("Link a device before starting a transfer.");
            return;
        }
        let source = match self.hyperbox.ensure_demo_file() {
            Ok(path) => path,
            Err(error) => {
                self.state.add_log(format!("Demo payload unavailable: {error}"));
                return;
            }
        };
        let dest = self.hyperbox.inbox().join(
            source.file_name().unwrap_or_default(),
        );
        self.start_transfer(source, dest, TransferDirection::Upload, None, false)
            .await;
    }

    /// Queue a sample peer-originated request, for exercising the approval
    /// flow without a peer.
    pub fn simulate_request(&self) {
        let Some(session) = self.session() else {
            self.state.add_log("Link a device before creating a request.");
            return;
        };
        let sample = format!(
            "requests/sample_{}.txt",
            &uuid::Uuid::new_v4().simple().to_string()[..6]
        );
        match self
            .requests
            .create_request(&session.id, &sample, Requester::Peer)
        {
            Ok(request) => {
                self.publish_requests(&session.id);
                self.state.add_log(format!("Request queued: {}", request.path));
            }
            Err(error) => tracing::warn!("request not persisted: {error}"),
        }
    }

    /// Approve a request and start the transfer, resolving the source from
    /// the requested path (absolute, hyperbox-relative, or the demo payload
    /// as a last resort).
    pub async fn approve_request(&self, request_id: &str) {
        let Some(request) = self.find_request(request_id) else {
            return;
        };
        let Some(updated) = self.advance_request(&request, RequestStatus::Approved) else {
            return;
        };
        self.state.add_log(format!("Approved request: {}", updated.path));

        let Some(source) = self.resolve_request_source(&updated) else {
            self.state.add_log("Unable to locate requested file for transfer.");
            return;
        };
        let dest = self
            .hyperbox
            .inbox()
            .join(source.file_name().unwrap_or_default());
        self.request_transfer_map
            .insert(updated.id.clone(), source.clone());
        let network = updated.requester != Requester::Local;
        self.start_transfer(
            source,
            dest,
            TransferDirection::Upload,
            Some(updated.id.clone()),
            network,
        )
        .await;
    }

    /// Approve a request with an explicitly chosen source file.
    pub async fn approve_request_with_source(&self, request_id: &str, source: &Path) {
        let Some(request) = self.find_request(request_id) else {
            return;
        };
        if !source.exists() {
            self.state.add_log("Selected source file does not exist.");
            return;
        }
        let Some(updated) = self.advance_request(&request, RequestStatus::Approved) else {
            return;
        };
        self.state.add_log(format!("Approved request: {}", updated.path));

        let dest = self
            .hyperbox
            .inbox()
            .join(source.file_name().unwrap_or_default());
        self.request_transfer_map
            .insert(updated.id.clone(), source.to_path_buf());
        let network = updated.requester != Requester::Local;
        self.start_transfer(
            source.to_path_buf(),
            dest,
            TransferDirection::Upload,
            Some(updated.id.clone()),
            network,
        )
        .await;
    }

    /// Decline a pending request.
    pub fn decline_request(&self, request_id: &str) {
        let Some(request) = self.find_request(request_id) else {
            return;
        };
        if let Some(updated) = self.advance_request(&request, RequestStatus::Declined) {
            self.state.add_log(format!("Declined request: {}", updated.path));
        }
    }

    /// The source path that was resolved when a request was approved.
    #[must_use]
    pub fn request_source(&self, request_id: &str) -> Option<PathBuf> {
        self.request_transfer_map
            .get(request_id)
            .map(|entry| entry.clone())
    }

    /// Request history for the given session, or across all sessions.
    #[must_use]
    pub fn request_history(&self, session_id: Option<&str>) -> Vec<FileRequest> {
        self.requests
            .list_requests_history(session_id)
            .unwrap_or_else(|error| {
                tracing::warn!("request history unavailable: {error}");
                Vec::new()
            })
    }

    /// Map of session id to peer name from the store, newest first.
    #[must_use]
    pub fn session_index(&self) -> Vec<(String, String)> {
        self.store
            .list_sessions_with_peers()
            .map(|sessions| {
                sessions
                    .into_iter()
                    .map(|s| (s.session_id, s.peer_name))
                    .collect()
            })
            .unwrap_or_else(|error| {
                tracing::warn!("session index unavailable: {error}");
                Vec::new()
            })
    }

    /// Rewrite the live session's policy and persist the per-device preset.
    pub async fn update_sync_rules(&self, mode: SyncMode, conflict_rule: ConflictRule) {
        let Some(session) = self.session() else {
            self.state.add_log("No active session to update sync rules.");
            return;
        };
        let policy = PermissionPolicy {
            mode,
            approval_required: mode == SyncMode::Approval,
            conflict_rule,
            ..session.policy
        };
        let updated = self.pairing.update_session(&session, session.status, policy);
        *self.lock_session() = Some(updated.clone());
        self.state.set_session(Some(updated.clone()));
        self.persist(self.store.record_session(&updated));
        self.save_device_sync_preset(&updated.peer_device.id, mode, conflict_rule);
        self.state.add_log(format!(
            "Sync rules updated: mode={mode}, conflict={conflict_rule}."
        ));
        self.broadcast_session_update(&updated).await;
    }

    /// Current transfer settings (preferences plus defaults).
    #[must_use]
    pub fn transfer_settings(&self) -> TransferSettings {
        TransferSettings::load(&self.store).unwrap_or_else(|error| {
            tracing::warn!("transfer settings unavailable: {error}");
            TransferSettings::default()
        })
    }

    /// Persist transfer settings.
    ///
    /// # Errors
    ///
    /// Returns [`ControllerError::EncryptionUnsupported`] for
    /// `encryption=true`; encrypted bulk transfer is a reserved flag, not an
    /// implemented feature.
    pub fn save_transfer_settings(
        &self,
        settings: &TransferSettings,
    ) -> Result<(), ControllerError> {
        if settings.encryption {
            return Err(ControllerError::EncryptionUnsupported);
        }
        settings.save(&self.store)?;
        self.state.add_log("Transfer settings updated.");
        Ok(())
    }

    /// Parsed bandwidth ceiling in MB/s for display.
    #[must_use]
    pub fn transfer_limit_mbps(&self) -> Option<f64> {
        self.transfer_settings().limit_mbps()
    }

    /// Cooperative shutdown: suppress worker persistence, stop the watcher
    /// and announcer, stop the control server, close the store.
    pub async fn shutdown(&self) {
        self.closing.store(true, Ordering::SeqCst);
        self.watcher.stop();
        if let Some(announcer) = &self.announcer {
            announcer.stop();
        }
        if let Some(server) = self.control.get() {
            server.stop().await;
        }
        self.store.close();
    }

    // ---- inbound control messages ------------------------------------------

    async fn handle_control_message(&self, envelope: Envelope) {
        self.state
            .add_log(format!("Control message received: {}", envelope.message_type));
        match envelope.message_type {
            MessageType::PairingRequest => self.handle_pairing_request(&envelope).await,
            MessageType::SessionUpdate => self.handle_session_update(&envelope),
            MessageType::TransferStatus => self.handle_transfer_status(&envelope),
            MessageType::TransferRequest => self.handle_transfer_request(&envelope),
            other => tracing::debug!("no inbound handling for {other}"),
        }
    }

    async fn handle_pairing_request(&self, envelope: &Envelope) {
        let (Some(code), Some(_device_id)) = (
            envelope.payload_str("pair_code").map(str::to_owned),
            envelope.payload_str("device_id"),
        ) else {
            self.state.add_log("Pairing request missing code or device id.");
            return;
        };
        let pairing = {
            let pending = self.lock_pending();
            pending.clone().or_else(|| self.pairing.find_by_code(&code))
        };
        let Some(pairing) = pairing else {
            self.state.add_log("No active pairing session found for code.");
            return;
        };

        let peer_device = build_peer_device(&envelope.payload);
        let (mode, conflict_rule) = self.device_sync_preset(&peer_device.id);
        let session = match self.pairing.confirm_pairing(
            &pairing,
            &code,
            peer_device.clone(),
            mode,
            conflict_rule,
        ) {
            Ok(session) => session,
            Err(PairingError::CodeMismatch) => {
                // No reply; the peer retries. The pairing stays outstanding.
                self.persist(self.store.record_audit_event(
                    &pairing.id,
                    "pairing_mismatch",
                    &format!("Rejected pairing code from {}.", peer_device.name),
                ));
                return;
            }
        };

        *self.lock_pending() = None;
        *self.lock_session() = Some(session.clone());
        self.state.set_session(Some(session.clone()));
        self.state.set_pairing_code("");
        self.state.set_transfers(Vec::new());
        self.persist(self.store.record_device(&peer_device));
        self.persist(self.store.record_session(&session));
        self.persist(self.store.record_audit_event(
            &session.id,
            "session_linked",
            &format!("Linked to {}.", peer_device.name),
        ));
        self.publish_requests(&session.id);
        self.state.add_log(format!("Peer linked: {}.", peer_device.name));
        self.broadcast_pairing_accept(&session).await;
        self.broadcast_session_update(&session).await;
    }

    fn handle_session_update(&self, envelope: &Envelope) {
        let Some(session) = self.session() else {
            return;
        };
        let payload = &envelope.payload;
        let status = envelope
            .payload_str("status")
            .map(SessionStatus::parse)
            .unwrap_or(session.status);
        let policy = PermissionPolicy {
            mode: envelope
                .payload_str("mode")
                .map(SyncMode::parse)
                .unwrap_or(session.policy.mode),
            approval_required: payload_bool(
                payload,
                "approval_required",
                session.policy.approval_required,
            ),
            conflict_rule: envelope
                .payload_str("conflict_rule")
                .map(ConflictRule::parse)
                .unwrap_or(session.policy.conflict_rule),
            allow_browse: payload_bool(payload, "allow_browse", session.policy.allow_browse),
            allow_requests: payload_bool(payload, "allow_requests", session.policy.allow_requests),
            allow_edits: payload_bool(payload, "allow_edits", session.policy.allow_edits),
            edit_mode: envelope
                .payload_str("edit_mode")
                .map(EditMode::parse)
                .unwrap_or(session.policy.edit_mode),
            allow_client_share: payload_bool(
                payload,
                "allow_client_share",
                session.policy.allow_client_share,
            ),
        };
        let updated = self.pairing.update_session(&session, status, policy);
        *self.lock_session() = Some(updated.clone());
        self.state.set_session(Some(updated.clone()));
        self.persist(self.store.record_session(&updated));
    }

    fn handle_transfer_status(&self, envelope: &Envelope) {
        let Some(job_id) = envelope.payload_str("job_id") else {
            return;
        };
        let payload = &envelope.payload;
        let job = TransferJob {
            id: job_id.to_string(),
            path: envelope.payload_str("path").unwrap_or_default().to_string(),
            direction: envelope
                .payload_str("direction")
                .map(TransferDirection::parse)
                .unwrap_or(TransferDirection::Download),
            status: envelope
                .payload_str("status")
                .map(TransferStatus::parse)
                .unwrap_or(TransferStatus::Unknown),
            size: payload_u64(payload, "size", 0),
            bytes_copied: payload_u64(payload, "bytes_copied", 0),
            progress: payload_f64(payload, "progress", 0.0),
            checksum: envelope
                .payload_str("checksum")
                .filter(|c| !c.is_empty())
                .map(str::to_owned),
            rate_mbps: payload_f64(payload, "rate_mbps", 0.0),
        };
        self.state.update_transfer(job.clone());
        if let Some(session) = self.session() {
            if !self.closing.load(Ordering::SeqCst) {
                self.persist(self.store.record_transfer(&session.id, &job));
            }
        }
    }

    fn handle_transfer_request(&self, envelope: &Envelope) {
        let Some(session) = self.session() else {
            return;
        };
        let path = envelope.payload_str("path").unwrap_or_default().to_string();
        let requester = envelope
            .payload_str("requester")
            .map(Requester::parse)
            .unwrap_or(Requester::Peer);
        match self.requests.create_request(&session.id, &path, requester) {
            Ok(request) => {
                self.publish_requests(&session.id);
                self.state
                    .add_log(format!("Transfer requested: {}", request.path));
            }
            Err(error) => tracing::warn!("request not persisted: {error}"),
        }
    }

    // ---- filesystem events -------------------------------------------------

    async fn handle_hyperbox_event(&self, kind: WatchEventKind, path: PathBuf) {
        let Some(session) = self.session() else {
            return;
        };
        let Ok(relative) = path.strip_prefix(self.hyperbox.root()) else {
            return;
        };
        let relative = relative.to_path_buf();
        let mode = session.policy.mode;

        if let Some(last) = self.last_transfer_by_path.get(&path) {
            if last.elapsed() < WATCH_DEBOUNCE {
                return;
            }
        }

        if path.starts_with(self.hyperbox.requests()) {
            if mode == SyncMode::Approval {
                match self.requests.create_request(
                    &session.id,
                    &relative.to_string_lossy(),
                    Requester::Local,
                ) {
                    Ok(request) => {
                        self.publish_requests(&session.id);
                        self.state
                            .add_log(format!("Request file detected: {}", request.path));
                    }
                    Err(error) => tracing::warn!("request not persisted: {error}"),
                }
            } else {
                self.state.add_log(format!(
                    "Request ignored (mode={mode}): {}",
                    relative.display()
                ));
            }
            return;
        }

        if path.starts_with(self.hyperbox.outbox()) {
            let syncable = matches!(
                kind,
                WatchEventKind::Created | WatchEventKind::Modified
            );
            if matches!(mode, SyncMode::Mirror | SyncMode::Copy) && syncable {
                self.last_transfer_by_path.insert(path.clone(), Instant::now());
                self.state
                    .add_log(format!("Auto-sync outbox file: {}", relative.display()));
                let dest = self
                    .hyperbox
                    .inbox()
                    .join(path.file_name().unwrap_or_default());
                self.start_transfer(path, dest, TransferDirection::Upload, None, false)
                    .await;
            } else {
                self.state
                    .add_log(format!("Outbox file detected: {}", relative.display()));
            }
            return;
        }

        if path.starts_with(self.hyperbox.inbox()) {
            if mode == SyncMode::Mirror {
                self.state
                    .add_log(format!("Inbox updated (mirror sync): {}", relative.display()));
            } else {
                self.state
                    .add_log(format!("Inbox file received: {}", relative.display()));
            }
        }
    }

    // ---- transfers ---------------------------------------------------------

    async fn start_transfer(
        &self,
        source: PathBuf,
        mut dest: PathBuf,
        direction: TransferDirection,
        request_id: Option<String>,
        network: bool,
    ) {
        let Some(session) = self.session() else {
            return;
        };
        if let Some(id) = &request_id {
            self.set_request_status(id, RequestStatus::InProgress);
        }

        let size = std::fs::metadata(&source).map(|m| m.len()).unwrap_or(0);
        let job = TransferJob::started(
            uuid::Uuid::new_v4().to_string(),
            source.display().to_string(),
            direction,
            size,
        );

        if !network {
            match self.apply_conflict_rule(&dest, &session) {
                Some(resolved) => dest = resolved,
                None => {
                    self.state.add_log("Transfer skipped due to conflict policy.");
                    let skipped = TransferJob {
                        status: TransferStatus::Skipped,
                        ..job
                    };
                    self.state.update_transfer(skipped.clone());
                    self.persist_unless_closing(&session.id, &skipped);
                    self.broadcast_transfer_status(&skipped).await;
                    if let Some(id) = &request_id {
                        self.set_request_status(id, RequestStatus::Skipped);
                    }
                    return;
                }
            }
        }

        let settings = self.transfer_settings();
        self.state.update_transfer(job.clone());
        self.persist_unless_closing(&session.id, &job);

        let Some(controller) = self.upgrade() else {
            return;
        };
        let session_id = session.id.clone();
        tokio::spawn(async move {
            controller
                .run_transfer_job(session_id, job, source, dest, settings, request_id, network)
                .await;
        });
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_transfer_job(
        self: Arc<Self>,
        session_id: String,
        job: TransferJob,
        source: PathBuf,
        dest: PathBuf,
        settings: TransferSettings,
        request_id: Option<String>,
        network: bool,
    ) {
        let progress_controller = Arc::clone(&self);
        let progress_job = job.clone();
        let progress_session = session_id.clone();
        let on_progress = move |bytes_copied: u64, total_size: u64| {
            progress_controller.report_progress(
                &progress_session,
                &progress_job,
                bytes_copied,
                total_size,
            );
        };

        let result = if network {
            self.send_over_network(&job, &source, &settings, on_progress)
                .await
        } else {
            let options = CopyOptions {
                chunk_size: settings.chunk_size_bytes(),
                resume: true,
                max_bandwidth: settings.max_bandwidth_bytes(),
                retry_policy: settings.retry_policy,
                max_retries: settings.max_retries,
            };
            let source = source.clone();
            let dest = dest.clone();
            tokio::task::spawn_blocking(move || {
                copy_with_checksum(&source, &dest, &options, Some(&on_progress))
            })
            .await
            .unwrap_or_else(|join_error| {
                Err(TransferError::Io(std::io::Error::other(join_error)))
            })
        };

        self.transfer_metrics.remove(&job.id);
        match result {
            Ok(result) => {
                let finished = TransferJob {
                    status: TransferStatus::Complete,
                    bytes_copied: result.bytes_copied,
                    progress: 1.0,
                    checksum: Some(result.checksum),
                    rate_mbps: 0.0,
                    ..job
                };
                self.state.update_transfer(finished.clone());
                self.persist_unless_closing(&session_id, &finished);
                self.broadcast_transfer_status(&finished).await;
                if let Some(id) = &request_id {
                    self.set_request_status(id, RequestStatus::Completed);
                }
            }
            Err(error) => {
                let failed = TransferJob {
                    status: TransferStatus::Failed,
                    rate_mbps: 0.0,
                    ..job
                };
                self.state.update_transfer(failed.clone());
                self.persist_unless_closing(&session_id, &failed);
                self.state.add_log(format!("Transfer failed: {error}"));
                self.broadcast_transfer_status(&failed).await;
                if let Some(id) = &request_id {
                    self.set_request_status(id, RequestStatus::Failed);
                }
            }
        }
    }

    async fn send_over_network(
        &self,
        job: &TransferJob,
        source: &Path,
        settings: &TransferSettings,
        on_progress: impl Fn(u64, u64) + Send + Sync + 'static,
    ) -> Result<TransferResult, TransferError> {
        let mut sender = FileSender::new("0.0.0.0", settings.chunk_size_bytes());
        let port = sender.open()?;
        let host_ip = if self.local_device.ip.is_empty() {
            "127.0.0.1".to_string()
        } else {
            self.local_device.ip.clone()
        };
        let size = std::fs::metadata(source).map(|m| m.len()).unwrap_or(0);
        let filename = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        self.broadcast_transfer_offer(&job.id, &filename, size, &host_ip, port)
            .await;

        let max_bandwidth = settings.max_bandwidth_bytes();
        let source = source.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let result = sender.send_file(&source, Some(&on_progress), max_bandwidth);
            sender.close();
            result
        })
        .await
        .unwrap_or_else(|join_error| Err(TransferError::Io(std::io::Error::other(join_error))))
    }

    fn report_progress(
        &self,
        session_id: &str,
        job: &TransferJob,
        bytes_copied: u64,
        total_size: u64,
    ) {
        let progress = if total_size > 0 {
            bytes_copied as f64 / total_size as f64
        } else {
            1.0
        };
        let now = Instant::now();
        let rate_mbps = match self.transfer_metrics.insert(job.id.clone(), (bytes_copied, now)) {
            Some((last_bytes, last_time)) => {
                let delta_bytes = bytes_copied.saturating_sub(last_bytes) as f64;
                let delta_time = now.duration_since(last_time).as_secs_f64().max(0.0001);
                (delta_bytes / delta_time) / (1024.0 * 1024.0)
            }
            None => 0.0,
        };
        let updated = TransferJob {
            status: TransferStatus::Transferring,
            size: total_size,
            bytes_copied,
            progress,
            rate_mbps,
            ..job.clone()
        };
        self.state.update_transfer(updated.clone());
        self.persist_unless_closing(session_id, &updated);
    }

    /// Resolve where a local copy should land given the live conflict rule.
    /// Applies only in mirror mode and only when the destination exists.
    fn apply_conflict_rule(&self, dest: &Path, session: &Session) -> Option<PathBuf> {
        if session.policy.mode != SyncMode::Mirror || !dest.exists() {
            return Some(dest.to_path_buf());
        }
        match session.policy.conflict_rule {
            ConflictRule::PreferHost => Some(dest.to_path_buf()),
            ConflictRule::PreferPeer => None,
            ConflictRule::KeepBoth => {
                Some(hyperdesk_transfer::channel::conflict_sibling(dest))
            }
        }
    }

    // ---- outbound broadcasts -----------------------------------------------

    async fn broadcast(&self, message_type: MessageType, payload: Map<String, Value>) {
        let Some(server) = self.control.get() else {
            return;
        };
        if let Err(error) = server.broadcast_message(message_type, payload).await {
            tracing::warn!("broadcast failed: {error}");
        }
    }

    async fn broadcast_session_update(&self, session: &Session) {
        self.broadcast(
            MessageType::SessionUpdate,
            session_update_payload(
                &session.id,
                session.status.as_str(),
                session.policy.mode.as_str(),
                session.policy.approval_required,
                session.policy.conflict_rule.as_str(),
                &session.policy,
            ),
        )
        .await;
    }

    async fn broadcast_raw_session_update(
        &self,
        session_id: &str,
        status: &str,
        mode: &str,
        approval_required: bool,
        conflict_rule: &str,
    ) {
        let defaults = PermissionPolicy::for_mode(SyncMode::Approval, ConflictRule::KeepBoth);
        self.broadcast(
            MessageType::SessionUpdate,
            session_update_payload(
                session_id,
                status,
                mode,
                approval_required,
                conflict_rule,
                &defaults,
            ),
        )
        .await;
    }

    async fn broadcast_pairing_accept(&self, session: &Session) {
        let mut payload = Map::new();
        payload.insert("session_id".into(), json!(session.id));
        payload.insert("device_id".into(), json!(self.local_device.id));
        payload.insert("session_token".into(), json!(session.token));
        self.broadcast(MessageType::PairingAccept, payload).await;
    }

    async fn broadcast_transfer_status(&self, job: &TransferJob) {
        if self.lock_session().is_none() {
            return;
        }
        let mut payload = Map::new();
        payload.insert("job_id".into(), json!(job.id));
        payload.insert("status".into(), json!(job.status.as_str()));
        payload.insert("progress".into(), json!(job.progress));
        payload.insert(
            "checksum".into(),
            json!(job.checksum.clone().unwrap_or_default()),
        );
        payload.insert("path".into(), json!(job.path));
        payload.insert("direction".into(), json!(job.direction.as_str()));
        payload.insert("size".into(), json!(job.size));
        payload.insert("bytes_copied".into(), json!(job.bytes_copied));
        payload.insert("rate_mbps".into(), json!(job.rate_mbps));
        self.broadcast(MessageType::TransferStatus, payload).await;
    }

    async fn broadcast_transfer_offer(
        &self,
        job_id: &str,
        filename: &str,
        size: u64,
        host: &str,
        port: u16,
    ) {
        let Some(session) = self.session() else {
            return;
        };
        let mut payload = Map::new();
        payload.insert("session_id".into(), json!(session.id));
        payload.insert("job_id".into(), json!(job_id));
        payload.insert("filename".into(), json!(filename));
        payload.insert("size".into(), json!(size));
        payload.insert("host".into(), json!(host));
        payload.insert("port".into(), json!(port));
        payload.insert(
            "conflict_rule".into(),
            json!(session.policy.conflict_rule.as_str()),
        );
        self.broadcast(MessageType::TransferOffer, payload).await;
    }

    // ---- small helpers -----------------------------------------------------

    fn weak(&self) -> Weak<Self> {
        self.self_ref.get().cloned().unwrap_or_else(Weak::new)
    }

    fn upgrade(&self) -> Option<Arc<Self>> {
        self.self_ref.get().and_then(Weak::upgrade)
    }

    fn lock_session(&self) -> std::sync::MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, Option<PairingSession>> {
        self.pending_pairing.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn persist<T>(&self, result: Result<T, StoreError>) {
        if let Err(error) = result {
            if !self.closing.load(Ordering::SeqCst) {
                tracing::warn!("persistence error (state stays authoritative): {error}");
            }
        }
    }

    fn persist_unless_closing(&self, session_id: &str, job: &TransferJob) {
        if !self.closing.load(Ordering::SeqCst) {
            self.persist(self.store.record_transfer(session_id, job));
        }
    }

    fn publish_requests(&self, session_id: &str) {
        match self.requests.list_requests(session_id) {
            Ok(requests) => self.state.set_requests(requests),
            Err(error) => tracing::warn!("request list unavailable: {error}"),
        }
    }

    fn find_request(&self, request_id: &str) -> Option<FileRequest> {
        self.state
            .requests()
            .into_iter()
            .find(|request| request.id == request_id)
    }

    fn advance_request(
        &self,
        request: &FileRequest,
        status: RequestStatus,
    ) -> Option<FileRequest> {
        match self.requests.update_status(request, status) {
            Ok(updated) => {
                self.publish_requests(&updated.session_id);
                Some(updated)
            }
            Err(error) => {
                tracing::warn!("request update failed: {error}");
                None
            }
        }
    }

    fn set_request_status(&self, request_id: &str, status: RequestStatus) {
        if let Some(request) = self.find_request(request_id) {
            self.advance_request(&request, status);
        }
    }

    fn resolve_request_source(&self, request: &FileRequest) -> Option<PathBuf> {
        let requested = PathBuf::from(&request.path);
        if requested.is_absolute() && requested.exists() {
            return Some(requested);
        }
        let candidate = self.hyperbox.root().join(&requested);
        if candidate.exists() {
            return Some(candidate);
        }
        match self.hyperbox.ensure_demo_file() {
            Ok(demo) => {
                self.state
                    .add_log(format!("Using demo file for request: {}", request.path));
                Some(demo)
            }
            Err(error) => {
                tracing::warn!("demo payload unavailable: {error}");
                None
            }
        }
    }

    fn device_sync_preset(&self, device_id: &str) -> (SyncMode, ConflictRule) {
        let mode = self
            .store
            .get_preference(&format!("device.{device_id}.sync_mode"), "approval")
            .map(|v| SyncMode::parse(&v))
            .unwrap_or(SyncMode::Approval);
        let conflict_rule = self
            .store
            .get_preference(&format!("device.{device_id}.conflict_rule"), "keep_both")
            .map(|v| ConflictRule::parse(&v))
            .unwrap_or(ConflictRule::KeepBoth);
        (mode, conflict_rule)
    }

    fn save_device_sync_preset(&self, device_id: &str, mode: SyncMode, rule: ConflictRule) {
        self.persist(
            self.store
                .set_preference(&format!("device.{device_id}.sync_mode"), mode.as_str()),
        );
        self.persist(
            self.store
                .set_preference(&format!("device.{device_id}.conflict_rule"), rule.as_str()),
        );
    }
}

/// Local device first, then every scanned device that is not the local one
/// (matched by name and ip).
#[must_use]
pub fn dedupe_local(local: &Device, devices: Vec<Device>) -> Vec<Device> {
    let mut deduped = vec![local.clone()];
    for device in devices {
        if device.name == local.name && device.ip == local.ip {
            continue;
        }
        deduped.push(device);
    }
    deduped
}

/// Build the peer's device record from a `PAIRING_REQUEST` payload.
/// Capabilities arrive as either a JSON array or a comma-joined string.
fn build_peer_device(payload: &Map<String, Value>) -> Device {
    let id = payload
        .get("device_id")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let name = payload
        .get("device_name")
        .and_then(Value::as_str)
        .unwrap_or("Peer")
        .to_string();
    let ip = payload
        .get("device_ip")
        .and_then(Value::as_str)
        .unwrap_or("0.0.0.0")
        .to_string();
    let capabilities = match payload.get("capabilities") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_owned)
            .collect(),
        Some(Value::String(joined)) => joined
            .split(',')
            .filter(|c| !c.is_empty())
            .map(str::to_owned)
            .collect(),
        _ => Vec::new(),
    };
    Device {
        id,
        name,
        ip,
        status: PresenceStatus::Online,
        capabilities,
    }
}

fn session_update_payload(
    session_id: &str,
    status: &str,
    mode: &str,
    approval_required: bool,
    conflict_rule: &str,
    policy: &PermissionPolicy,
) -> Map<String, Value> {
    let mut payload = Map::new();
    payload.insert("session_id".into(), json!(session_id));
    payload.insert("status".into(), json!(status));
    payload.insert("mode".into(), json!(mode));
    payload.insert("approval_required".into(), json!(approval_required));
    payload.insert("conflict_rule".into(), json!(conflict_rule));
    payload.insert("allow_browse".into(), json!(policy.allow_browse));
    payload.insert("allow_requests".into(), json!(policy.allow_requests));
    payload.insert("allow_edits".into(), json!(policy.allow_edits));
    payload.insert("edit_mode".into(), json!(policy.edit_mode.as_str()));
    payload.insert("allow_client_share".into(), json!(policy.allow_client_share));
    payload
}

fn payload_bool(payload: &Map<String, Value>, key: &str, default: bool) -> bool {
    payload.get(key).and_then(Value::as_bool).unwrap_or(default)
}

fn payload_u64(payload: &Map<String, Value>, key: &str, default: u64) -> u64 {
    payload.get(key).and_then(Value::as_u64).unwrap_or(default)
}

fn payload_f64(payload: &Map<String, Value>, key: &str, default: f64) -> f64 {
    payload.get(key).and_then(Value::as_f64).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyperdesk_proto::{decode_message, encode_message};

    fn local() -> Device {
        Device {
            id: "local-1".to_string(),
            name: "HOSTBOX".to_string(),
            ip: "192.168.1.10".to_string(),
            status: PresenceStatus::Local,
            capabilities: vec!["hyperbox".to_string(), "requests".to_string()],
        }
    }

    async fn start_test_controller(
        dir: &tempfile::TempDir,
    ) -> (Arc<AppState>, Arc<Controller>) {
        let state = Arc::new(AppState::new());
        let config = ControllerConfig {
            control_host: "127.0.0.1".to_string(),
            control_port: 0,
            hyperbox_root: Some(dir.path().join("hyperbox")),
            db_path: Some(dir.path().join("data").join("hyperdesk.db")),
            ..ControllerConfig::default()
        };
        let controller = Controller::start(config, Arc::clone(&state)).await.unwrap();
        (state, controller)
    }

    fn envelope(message_type: MessageType, payload: Map<String, Value>) -> Envelope {
        let frame = encode_message(message_type, payload, None).unwrap();
        decode_message(&frame).unwrap()
    }

    fn pairing_request_payload(code: &str) -> Map<String, Value> {
        let mut payload = Map::new();
        payload.insert("device_id".into(), json!("p1"));
        payload.insert("pair_code".into(), json!(code));
        payload.insert("device_name".into(), json!("Peer"));
        payload.insert("device_ip".into(), json!("10.0.0.2"));
        payload.insert("capabilities".into(), json!(["hyperbox"]));
        payload
    }

    #[test]
    fn test_dedupe_local_removes_scanned_self() {
        let local = local();
        let scanned = vec![
            local.clone(),
            Device {
                id: "other".to_string(),
                name: "MYLAPTOP2".to_string(),
                ip: "192.168.1.100".to_string(),
                status: PresenceStatus::Online,
                capabilities: vec![],
            },
        ];
        let deduped = dedupe_local(&local, scanned);
        assert_eq!(deduped.len(), 2);
        assert_eq!(deduped[0].id, "local-1");
        assert_eq!(deduped[1].name, "MYLAPTOP2");
    }

    #[test]
    fn test_build_peer_device_accepts_both_capability_forms() {
        let mut payload = Map::new();
        payload.insert("device_id".into(), json!("p1"));
        payload.insert("capabilities".into(), json!(["hyperbox", "requests"]));
        let device = build_peer_device(&payload);
        assert_eq!(device.capabilities, vec!["hyperbox", "requests"]);
        assert_eq!(device.name, "Peer");
        assert_eq!(device.ip, "0.0.0.0");

        payload.insert("capabilities".into(), json!("hyperbox,requests"));
        let device = build_peer_device(&payload);
        assert_eq!(device.capabilities, vec!["hyperbox", "requests"]);
    }

    #[tokio::test]
    async fn test_pairing_request_promotes_pending_pairing() {
        let dir = tempfile::tempdir().unwrap();
        let (state, controller) = start_test_controller(&dir).await;

        controller.start_pairing();
        let code = state.pairing_code();
        assert_eq!(code.len(), 6);

        controller
            .handle_control_message(envelope(
                MessageType::PairingRequest,
                pairing_request_payload(&code),
            ))
            .await;

        let session = controller.session().expect("session established");
        assert_eq!(session.peer_device.id, "p1");
        assert_eq!(session.policy.mode, SyncMode::Approval);
        assert!(session.policy.approval_required);
        assert_eq!(session.policy.conflict_rule, ConflictRule::KeepBoth);
        assert!(session.token.len() >= 16);
        assert!(state.pairing_code().is_empty());

        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_wrong_code_leaves_pending_pairing() {
        let dir = tempfile::tempdir().unwrap();
        let (state, controller) = start_test_controller(&dir).await;

        controller.start_pairing();
        let code = state.pairing_code();

        controller
            .handle_control_message(envelope(
                MessageType::PairingRequest,
                pairing_request_payload(if code == "000000" { "000001" } else { "000000" }),
            ))
            .await;

        assert!(controller.session().is_none());
        assert_eq!(state.pairing_code(), code);
        assert!(controller.lock_pending().is_some());

        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_update_sync_rules_rewrites_policy() {
        let dir = tempfile::tempdir().unwrap();
        let (state, controller) = start_test_controller(&dir).await;

        controller.start_pairing();
        let code = state.pairing_code();
        controller
            .handle_control_message(envelope(
                MessageType::PairingRequest,
                pairing_request_payload(&code),
            ))
            .await;

        controller
            .update_sync_rules(SyncMode::Mirror, ConflictRule::PreferPeer)
            .await;
        let session = controller.session().unwrap();
        assert_eq!(session.policy.mode, SyncMode::Mirror);
        assert!(!session.policy.approval_required);
        assert_eq!(session.policy.conflict_rule, ConflictRule::PreferPeer);

        // The preset is saved for the peer device.
        let (mode, rule) = controller.device_sync_preset("p1");
        assert_eq!(mode, SyncMode::Mirror);
        assert_eq!(rule, ConflictRule::PreferPeer);

        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_disconnect_is_sticky_in_store() {
        let dir = tempfile::tempdir().unwrap();
        let (state, controller) = start_test_controller(&dir).await;

        controller.start_pairing();
        let code = state.pairing_code();
        controller
            .handle_control_message(envelope(
                MessageType::PairingRequest,
                pairing_request_payload(&code),
            ))
            .await;
        let session_id = controller.session().unwrap().id;

        controller.disconnect().await;
        assert!(controller.session().is_none());

        let index = controller.session_index();
        assert!(index.iter().any(|(id, _)| *id == session_id));

        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_save_transfer_settings_rejects_encryption() {
        let dir = tempfile::tempdir().unwrap();
        let (_state, controller) = start_test_controller(&dir).await;

        let mut settings = TransferSettings::default();
        settings.encryption = true;
        let err = controller.save_transfer_settings(&settings).unwrap_err();
        assert!(matches!(err, ControllerError::EncryptionUnsupported));

        settings.encryption = false;
        settings.max_bandwidth = "4 MB/s".to_string();
        controller.save_transfer_settings(&settings).unwrap();
        assert_eq!(controller.transfer_limit_mbps(), Some(4.0));

        controller.shutdown().await;
    }

    #[tokio::test]
    async fn test_transfer_status_hydrates_job() {
        let dir = tempfile::tempdir().unwrap();
        let (state, controller) = start_test_controller(&dir).await;

        let mut payload = Map::new();
        payload.insert("job_id".into(), json!("j9"));
        payload.insert("status".into(), json!("receiving"));
        payload.insert("progress".into(), json!(0.5));
        payload.insert("checksum".into(), json!(""));
        payload.insert("bytes_copied".into(), json!(512));
        payload.insert("size".into(), json!(1024));
        controller
            .handle_control_message(envelope(MessageType::TransferStatus, payload))
            .await;

        let transfers = state.transfers();
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].id, "j9");
        assert_eq!(transfers[0].status, TransferStatus::Receiving);
        assert_eq!(transfers[0].bytes_copied, 512);
        assert!(transfers[0].checksum.is_none());

        controller.shutdown().await;
    }
}
