//! Pairing manager: one-time numeric codes promoted to authenticated
//! sessions.
//!
//! Pairings live in memory only. A pairing is consumed on successful
//! confirmation or abandoned; both indexes (by id and by code) are dropped
//! atomically with confirmation.

use crate::models::{
    ConflictRule, Device, PairingSession, PermissionPolicy, Session, SessionStatus, SyncMode,
};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

/// Length of the session token in random bytes before encoding.
const TOKEN_BYTES: usize = 16;

/// Pairing errors.
#[derive(Debug, Error)]
pub enum PairingError {
    /// The supplied code does not match the pairing
    #[error("invalid pairing code")]
    CodeMismatch,
}

/// In-memory registry of outstanding pairings.
///
/// Thread-safe; the controller owns one instance for the process lifetime.
#[derive(Default)]
pub struct PairingManager {
    inner: Mutex<Indexes>,
}

#[derive(Default)]
struct Indexes {
    by_id: HashMap<String, PairingSession>,
    by_code: HashMap<String, PairingSession>,
}

impl PairingManager {
    /// Create an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a pairing with a uniformly random six-digit code.
    pub fn create_pairing(&self, host_device: Device) -> PairingSession {
        let code = format!("{:06}", rand::thread_rng().gen_range(0..1_000_000u32));
        let pairing = PairingSession {
            id: uuid::Uuid::new_v4().to_string(),
            code,
            host_device,
            created_at: chrono::Utc::now(),
        };
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.by_id.insert(pairing.id.clone(), pairing.clone());
        inner.by_code.insert(pairing.code.clone(), pairing.clone());
        pairing
    }

    /// Look up an outstanding pairing by its code.
    #[must_use]
    pub fn find_by_code(&self, code: &str) -> Option<PairingSession> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.by_code.get(code).cloned()
    }

    /// Confirm a pairing with the host's own code, e.g. when the host links
    /// out to a device it already trusts.
    ///
    /// # Errors
    ///
    /// Propagates [`PairingError::CodeMismatch`] from [`Self::confirm_pairing`]
    /// (unreachable for a pairing the manager handed out).
    pub fn accept_pairing(
        &self,
        pairing: &PairingSession,
        peer_device: Device,
        mode: SyncMode,
    ) -> Result<Session, PairingError> {
        let code = pairing.code.clone();
        self.confirm_pairing(pairing, &code, peer_device, mode, ConflictRule::KeepBoth)
    }

    /// Confirm a pairing: check the code, mint a session, drop the pairing
    /// from both indexes.
    ///
    /// The minted session is `connected`, carries a fresh URL-safe token of
    /// [`TOKEN_BYTES`] random bytes, and a policy whose `approval_required`
    /// flag is derived from the mode.
    ///
    /// # Errors
    ///
    /// Returns [`PairingError::CodeMismatch`] when `code` differs from the
    /// pairing's code; the pairing then remains outstanding.
    pub fn confirm_pairing(
        &self,
        pairing: &PairingSession,
        code: &str,
        peer_device: Device,
        mode: SyncMode,
        conflict_rule: ConflictRule,
    ) -> Result<Session, PairingError> {
        if pairing.code != code {
            return Err(PairingError::CodeMismatch);
        }
        let session = Session {
            id: uuid::Uuid::new_v4().to_string(),
            host_device: pairing.host_device.clone(),
            peer_device,
            status: SessionStatus::Connected,
            policy: PermissionPolicy::for_mode(mode, conflict_rule),
            token: mint_token(),
            created_at: chrono::Utc::now(),
        };
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.by_id.remove(&pairing.id);
        inner.by_code.remove(&pairing.code);
        Ok(session)
    }

    /// Discard an outstanding pairing without confirming it.
    pub fn discard(&self, pairing: &PairingSession) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.by_id.remove(&pairing.id);
        inner.by_code.remove(&pairing.code);
    }

    /// Build a replacement session value with the supplied status and policy.
    ///
    /// Sessions are immutable; this is the only way policy changes happen.
    /// The id, devices, token, and creation time are carried over.
    #[must_use]
    pub fn update_session(
        &self,
        session: &Session,
        status: SessionStatus,
        policy: PermissionPolicy,
    ) -> Session {
        Session {
            id: session.id.clone(),
            host_device: session.host_device.clone(),
            peer_device: session.peer_device.clone(),
            status,
            policy,
            token: session.token.clone(),
            created_at: session.created_at,
        }
    }
}

/// Mint an opaque URL-safe session token.
fn mint_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PresenceStatus;

    fn device(id: &str, name: &str) -> Device {
        Device {
            id: id.to_string(),
            name: name.to_string(),
            ip: "192.168.1.10".to_string(),
            status: PresenceStatus::Online,
            capabilities: vec!["hyperbox".to_string()],
        }
    }

    #[test]
    fn test_create_pairing_code_shape() {
        let manager = PairingManager::new();
        for _ in 0..32 {
            let pairing = manager.create_pairing(device("h", "HOST"));
            assert_eq!(pairing.code.len(), 6);
            assert!(pairing.code.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn test_confirm_pairing_mints_session() {
        let manager = PairingManager::new();
        let pairing = manager.create_pairing(device("h", "HOST"));
        let code = pairing.code.clone();
        let session = manager
            .confirm_pairing(
                &pairing,
                &code,
                device("p", "PEER"),
                SyncMode::Approval,
                ConflictRule::KeepBoth,
            )
            .unwrap();

        assert_eq!(session.status, SessionStatus::Connected);
        assert!(session.policy.approval_required);
        assert!(session.token.len() >= 16);
        assert!(
            session
                .token
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        );
        // Consumed: the code no longer resolves.
        assert!(manager.find_by_code(&code).is_none());
    }

    #[test]
    fn test_confirm_pairing_rejects_wrong_code() {
        let manager = PairingManager::new();
        let pairing = manager.create_pairing(device("h", "HOST"));
        let err = manager.confirm_pairing(
            &pairing,
            "000000",
            device("p", "PEER"),
            SyncMode::Approval,
            ConflictRule::KeepBoth,
        );
        assert!(matches!(err, Err(PairingError::CodeMismatch)));
        // Pairing stays outstanding for a retry.
        assert!(manager.find_by_code(&pairing.code).is_some());
    }

    #[test]
    fn test_accept_pairing_uses_own_code() {
        let manager = PairingManager::new();
        let pairing = manager.create_pairing(device("h", "HOST"));
        let session = manager
            .accept_pairing(&pairing, device("p", "PEER"), SyncMode::Copy)
            .unwrap();
        assert_eq!(session.policy.mode, SyncMode::Copy);
        assert_eq!(session.policy.conflict_rule, ConflictRule::KeepBoth);
        assert!(manager.find_by_code(&pairing.code).is_none());
    }

    #[test]
    fn test_non_approval_mode_clears_approval_flag() {
        let manager = PairingManager::new();
        let pairing = manager.create_pairing(device("h", "HOST"));
        let code = pairing.code.clone();
        let session = manager
            .confirm_pairing(
                &pairing,
                &code,
                device("p", "PEER"),
                SyncMode::Mirror,
                ConflictRule::PreferPeer,
            )
            .unwrap();
        assert!(!session.policy.approval_required);
        assert_eq!(session.policy.conflict_rule, ConflictRule::PreferPeer);
    }

    #[test]
    fn test_update_session_replaces_policy_only() {
        let manager = PairingManager::new();
        let pairing = manager.create_pairing(device("h", "HOST"));
        let code = pairing.code.clone();
        let session = manager
            .confirm_pairing(
                &pairing,
                &code,
                device("p", "PEER"),
                SyncMode::Approval,
                ConflictRule::KeepBoth,
            )
            .unwrap();

        let policy = PermissionPolicy::for_mode(SyncMode::Copy, ConflictRule::PreferHost);
        let updated = manager.update_session(&session, SessionStatus::Connected, policy);
        assert_eq!(updated.id, session.id);
        assert_eq!(updated.token, session.token);
        assert_eq!(updated.policy.mode, SyncMode::Copy);
        assert!(!updated.policy.approval_required);
    }
}
