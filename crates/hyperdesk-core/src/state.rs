//! App-state signal bus.
//!
//! The observer surface front-ends subscribe to: a snapshot of the published
//! state plus a broadcast channel of typed change events. Setters are safe to
//! call from any thread; subscribers that fall behind lose the oldest events
//! (state is always re-readable from the snapshot).

use crate::models::{Device, FileRequest, Session, TransferJob};
use std::sync::RwLock;
use tokio::sync::broadcast;

/// Broadcast capacity before slow subscribers start lagging.
const EVENT_CAPACITY: usize = 256;

/// Typed change notifications.
#[derive(Debug, Clone)]
pub enum StateEvent {
    /// Device list replaced
    DevicesChanged(Vec<Device>),
    /// Session established, replaced, or cleared
    SessionChanged(Option<Session>),
    /// Pairing code published or cleared
    PairingChanged(String),
    /// Log line appended
    LogAdded(String),
    /// Transfer list changed
    TransfersChanged(Vec<TransferJob>),
    /// Request list changed
    RequestsChanged(Vec<FileRequest>),
}

#[derive(Default)]
struct Snapshot {
    devices: Vec<Device>,
    session: Option<Session>,
    pairing_code: String,
    logs: Vec<String>,
    transfers: Vec<TransferJob>,
    requests: Vec<FileRequest>,
}

/// Shared, observable application state.
pub struct AppState {
    snapshot: RwLock<Snapshot>,
    events: broadcast::Sender<StateEvent>,
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

impl AppState {
    /// Create an empty state bus.
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            snapshot: RwLock::new(Snapshot::default()),
            events,
        }
    }

    /// Subscribe to change events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: StateEvent) {
        // No receivers is fine; the snapshot still carries the state.
        let _ = self.events.send(event);
    }

    /// Replace the device list.
    pub fn set_devices(&self, devices: Vec<Device>) {
        self.write().devices = devices.clone();
        self.emit(StateEvent::DevicesChanged(devices));
    }

    /// Current device list.
    #[must_use]
    pub fn devices(&self) -> Vec<Device> {
        self.read().devices.clone()
    }

    /// Replace (or clear) the session.
    pub fn set_session(&self, session: Option<Session>) {
        self.write().session = session.clone();
        self.emit(StateEvent::SessionChanged(session));
    }

    /// Current session, if any.
    #[must_use]
    pub fn session(&self) -> Option<Session> {
        self.read().session.clone()
    }

    /// Publish (or clear with `""`) the pairing code.
    pub fn set_pairing_code(&self, code: impl Into<String>) {
        let code = code.into();
        self.write().pairing_code = code.clone();
        self.emit(StateEvent::PairingChanged(code));
    }

    /// Currently published pairing code, empty when none.
    #[must_use]
    pub fn pairing_code(&self) -> String {
        self.read().pairing_code.clone()
    }

    /// Append a log line.
    pub fn add_log(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::info!("{message}");
        self.write().logs.push(message.clone());
        self.emit(StateEvent::LogAdded(message));
    }

    /// All log lines so far.
    #[must_use]
    pub fn logs(&self) -> Vec<String> {
        self.read().logs.clone()
    }

    /// Replace the transfer list.
    pub fn set_transfers(&self, transfers: Vec<TransferJob>) {
        self.write().transfers = transfers.clone();
        self.emit(StateEvent::TransfersChanged(transfers));
    }

    /// Upsert a transfer by job id.
    pub fn update_transfer(&self, job: TransferJob) {
        let transfers = {
            let mut snapshot = self.write();
            match snapshot.transfers.iter_mut().find(|t| t.id == job.id) {
                Some(existing) => *existing = job,
                None => snapshot.transfers.push(job),
            }
            snapshot.transfers.clone()
        };
        self.emit(StateEvent::TransfersChanged(transfers));
    }

    /// Current transfer list.
    #[must_use]
    pub fn transfers(&self) -> Vec<TransferJob> {
        self.read().transfers.clone()
    }

    /// Replace the request list.
    pub fn set_requests(&self, requests: Vec<FileRequest>) {
        self.write().requests = requests.clone();
        self.emit(StateEvent::RequestsChanged(requests));
    }

    /// Current request list.
    #[must_use]
    pub fn requests(&self) -> Vec<FileRequest> {
        self.read().requests.clone()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Snapshot> {
        self.snapshot.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Snapshot> {
        self.snapshot.write().unwrap_or_else(|e| e.into_inner())
    }
}
