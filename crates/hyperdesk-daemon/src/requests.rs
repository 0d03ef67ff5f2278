//! File request queue, written through to the store.

use hyperdesk_core::models::{FileRequest, RequestStatus, Requester};
use hyperdesk_store::{Store, StoreError};
use std::sync::Arc;

/// Queue of file requests for the active session (and history across past
/// ones).
pub struct RequestQueue {
    store: Arc<Store>,
}

impl RequestQueue {
    /// Create a queue over the shared store.
    #[must_use]
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Create a pending request and persist it.
    ///
    /// # Errors
    ///
    /// Returns an error when the row cannot be written.
    pub fn create_request(
        &self,
        session_id: &str,
        path: &str,
        requester: Requester,
    ) -> Result<FileRequest, StoreError> {
        let request = FileRequest {
            id: uuid::Uuid::new_v4().to_string(),
            session_id: session_id.to_string(),
            path: path.to_string(),
            requester,
            status: RequestStatus::Pending,
            created_at: chrono::Utc::now(),
        };
        self.store.record_request(&request)?;
        Ok(request)
    }

    /// Advance a request's status, returning the replacement value.
    ///
    /// Requests are immutable values; terminal statuses are never advanced
    /// further (the stale update is dropped and the input returned).
    ///
    /// # Errors
    ///
    /// Returns an error when the row cannot be written.
    pub fn update_status(
        &self,
        request: &FileRequest,
        status: RequestStatus,
    ) -> Result<FileRequest, StoreError> {
        if request.status.is_terminal() {
            tracing::debug!(
                "ignoring status change {} -> {status} for terminal request {}",
                request.status,
                request.id
            );
            return Ok(request.clone());
        }
        let updated = FileRequest {
            status,
            ..request.clone()
        };
        self.store.record_request(&updated)?;
        Ok(updated)
    }

    /// Requests for one session, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error when the rows cannot be read.
    pub fn list_requests(&self, session_id: &str) -> Result<Vec<FileRequest>, StoreError> {
        self.store.list_requests(session_id)
    }

    /// Request history for one session, or across all sessions.
    ///
    /// # Errors
    ///
    /// Returns an error when the rows cannot be read.
    pub fn list_requests_history(
        &self,
        session_id: Option<&str>,
    ) -> Result<Vec<FileRequest>, StoreError> {
        self.store.list_requests_history(session_id)
    }
}
