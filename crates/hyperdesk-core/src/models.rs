//! Value objects shared across the daemon.
//!
//! Sessions and policies are immutable: "mutation" builds a replacement value
//! which is then written through to the store. This keeps worker threads from
//! ever observing a half-updated session.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Presence of a device on the LAN.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    /// This process's own device
    Local,
    /// Reachable on the LAN
    Online,
    /// Known but not currently reachable
    Offline,
}

impl PresenceStatus {
    /// Canonical lowercase name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Online => "online",
            Self::Offline => "offline",
        }
    }

    /// Parse a stored name; unknown values are treated as offline.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "local" => Self::Local,
            "online" => Self::Online,
            _ => Self::Offline,
        }
    }
}

impl std::fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A device observed on the LAN (or the local one).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Stable opaque identifier
    pub id: String,
    /// Human-readable name, usually the hostname
    pub name: String,
    /// IPv4 address as text
    pub ip: String,
    /// Presence status
    pub status: PresenceStatus,
    /// Capability tags (`hyperbox`, `requests`)
    pub capabilities: Vec<String>,
}

/// Per-session synchronization mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Bidirectional auto-sync of outbox changes
    Mirror,
    /// One-shot auto-sync
    Copy,
    /// Transfers gated by explicit approval
    Approval,
}

impl SyncMode {
    /// Canonical lowercase name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mirror => "mirror",
            Self::Copy => "copy",
            Self::Approval => "approval",
        }
    }

    /// Parse a stored name; unknown values fall back to approval, the most
    /// restrictive mode.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "mirror" => Self::Mirror,
            "copy" => Self::Copy,
            _ => Self::Approval,
        }
    }
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Policy governing destination-exists collisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictRule {
    /// Keep both files, renaming the incoming one
    KeepBoth,
    /// The host's copy wins
    PreferHost,
    /// The peer's copy wins (incoming bytes are discarded)
    PreferPeer,
}

impl ConflictRule {
    /// Canonical snake_case name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::KeepBoth => "keep_both",
            Self::PreferHost => "prefer_host",
            Self::PreferPeer => "prefer_peer",
        }
    }

    /// Parse a stored name; unknown values fall back to `keep_both`.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "prefer_host" => Self::PreferHost,
            "prefer_peer" => Self::PreferPeer,
            _ => Self::KeepBoth,
        }
    }
}

impl std::fmt::Display for ConflictRule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How peer edits of shared files are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EditMode {
    /// Edits land in a copy
    CopyOnEdit,
    /// Edits rewrite the original
    InPlace,
}

impl EditMode {
    /// Canonical snake_case name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CopyOnEdit => "copy_on_edit",
            Self::InPlace => "in_place",
        }
    }

    /// Parse a stored name; unknown values fall back to `copy_on_edit`.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "in_place" => Self::InPlace,
            _ => Self::CopyOnEdit,
        }
    }
}

impl std::fmt::Display for EditMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The mutable policy attached to a session.
///
/// Invariant: `approval_required` is true iff `mode` is [`SyncMode::Approval`]
/// whenever the policy was produced by the pairing manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionPolicy {
    /// Synchronization mode
    pub mode: SyncMode,
    /// Whether transfers require explicit approval
    pub approval_required: bool,
    /// Collision handling
    pub conflict_rule: ConflictRule,
    /// Peer may browse the shared surface
    pub allow_browse: bool,
    /// Peer may queue file requests
    pub allow_requests: bool,
    /// Peer may edit shared files
    pub allow_edits: bool,
    /// How edits are applied
    pub edit_mode: EditMode,
    /// Peer may re-share received files
    pub allow_client_share: bool,
}

impl PermissionPolicy {
    /// Build a policy for a mode with default extended flags, deriving
    /// `approval_required` from the mode.
    #[must_use]
    pub fn for_mode(mode: SyncMode, conflict_rule: ConflictRule) -> Self {
        Self {
            mode,
            approval_required: mode == SyncMode::Approval,
            conflict_rule,
            allow_browse: true,
            allow_requests: true,
            allow_edits: false,
            edit_mode: EditMode::CopyOnEdit,
            allow_client_share: true,
        }
    }
}

/// Session lifecycle status. `Disconnected` is terminal and sticky for audit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Handshake complete, session live
    Connected,
    /// Torn down; a new handshake creates a new session id
    Disconnected,
}

impl SessionStatus {
    /// Canonical lowercase name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
        }
    }

    /// Parse a stored name.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "connected" => Self::Connected,
            _ => Self::Disconnected,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An authenticated pairing between two devices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Session identifier
    pub id: String,
    /// Device that created the pairing code
    pub host_device: Device,
    /// Device that redeemed it
    pub peer_device: Device,
    /// Lifecycle status
    pub status: SessionStatus,
    /// Active policy
    pub policy: PermissionPolicy,
    /// Opaque URL-safe token minted at confirmation
    pub token: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// A transient, in-memory pairing awaiting confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairingSession {
    /// Pairing identifier
    pub id: String,
    /// Six-digit zero-padded numeric code
    pub code: String,
    /// Device that created the pairing
    pub host_device: Device,
    /// Creation time
    pub created_at: DateTime<Utc>,
}

/// Direction of a transfer relative to the local device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    /// Local file going out
    Upload,
    /// Remote file coming in
    Download,
}

impl TransferDirection {
    /// Canonical lowercase name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Upload => "upload",
            Self::Download => "download",
        }
    }

    /// Parse a stored name; unknown values fall back to download.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "upload" => Self::Upload,
            _ => Self::Download,
        }
    }
}

impl std::fmt::Display for TransferDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transfer job status.
///
/// `Receiving` and `Sending` are peer-reported synonyms of `Transferring`
/// used for display; persistence writes whichever arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    /// Local worker copying bytes
    Transferring,
    /// Peer reports it is receiving
    Receiving,
    /// Peer reports it is sending
    Sending,
    /// All bytes landed, checksum recorded
    Complete,
    /// Terminal failure
    Failed,
    /// Skipped by conflict policy
    Skipped,
    /// Status string not recognized
    Unknown,
}

impl TransferStatus {
    /// Canonical lowercase name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Transferring => "transferring",
            Self::Receiving => "receiving",
            Self::Sending => "sending",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Unknown => "unknown",
        }
    }

    /// Parse a reported status.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "transferring" => Self::Transferring,
            "receiving" => Self::Receiving,
            "sending" => Self::Sending,
            "complete" => Self::Complete,
            "failed" => Self::Failed,
            "skipped" => Self::Skipped,
            _ => Self::Unknown,
        }
    }

    /// Whether this status ends the job (no back-transitions).
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Skipped)
    }
}

impl std::fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single file transfer, owned by its worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferJob {
    /// Job identifier
    pub id: String,
    /// Source path (absolute, or relative to the hyperbox root)
    pub path: String,
    /// Direction relative to this device
    pub direction: TransferDirection,
    /// Current status
    pub status: TransferStatus,
    /// Total size in bytes
    pub size: u64,
    /// Bytes copied so far
    pub bytes_copied: u64,
    /// Fractional progress in [0.0, 1.0]
    pub progress: f64,
    /// Lowercase hex SHA-256, set at completion
    pub checksum: Option<String>,
    /// Instantaneous rate in MB/s
    pub rate_mbps: f64,
}

impl TransferJob {
    /// Start a job in the `transferring` state.
    #[must_use]
    pub fn started(id: String, path: String, direction: TransferDirection, size: u64) -> Self {
        Self {
            id,
            path,
            direction,
            status: TransferStatus::Transferring,
            size,
            bytes_copied: 0,
            progress: 0.0,
            checksum: None,
            rate_mbps: 0.0,
        }
    }
}

/// Who originated a file request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Requester {
    /// A file dropped into the local `requests/` tree
    Local,
    /// The session peer
    Peer,
}

impl Requester {
    /// Canonical lowercase name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Peer => "peer",
        }
    }

    /// Parse a reported requester; anything but `local` is the peer.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        if value == "local" { Self::Local } else { Self::Peer }
    }
}

impl std::fmt::Display for Requester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// File request lifecycle.
///
/// `pending -> approved -> in_progress -> {completed | failed | skipped}`,
/// or `pending -> declined`. Terminal statuses are immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// Awaiting a decision
    Pending,
    /// Approved, transfer not yet started
    Approved,
    /// Declined by the host
    Declined,
    /// Transfer running
    InProgress,
    /// Transfer finished
    Completed,
    /// Transfer failed
    Failed,
    /// Skipped by conflict policy
    Skipped,
}

impl RequestStatus {
    /// Canonical snake_case name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Declined => "declined",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    /// Parse a stored name; unknown values are treated as pending.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        match value {
            "approved" => Self::Approved,
            "declined" => Self::Declined,
            "in_progress" => Self::InProgress,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "skipped" => Self::Skipped,
            _ => Self::Pending,
        }
    }

    /// Whether this status is terminal.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Declined | Self::Completed | Self::Failed | Self::Skipped
        )
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A queued request for a file, tied to a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRequest {
    /// Request identifier
    pub id: String,
    /// Owning session
    pub session_id: String,
    /// Requested path
    pub path: String,
    /// Originator
    pub requester: Requester,
    /// Lifecycle status
    pub status: RequestStatus,
    /// Creation time
    pub created_at: DateTime<Utc>,
}
