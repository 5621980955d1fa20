//! Clients for the external services the engine depends on.
//!
//! The engine consumes three collaborators behind traits: workspace access
//! validation, note existence lookup, and the fire-and-forget audit sink.
//! The `Http*` implementations talk to the main API; the `Static*`/`Memory*`
//! implementations back embedded setups and tests.
//!
//! Denial is the default: a non-2xx response, `valid: false`, a transport
//! error or a timeout all read as "no access". Audit failures never block
//! the edit path — they are logged and swallowed.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Collaborator errors.
#[derive(Debug, Clone)]
pub enum CollaboratorError {
    /// Transport-level failure reaching the service.
    Unreachable(String),
    /// The service answered with something we could not interpret.
    InvalidResponse(String),
}

impl std::fmt::Display for CollaboratorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unreachable(e) => write!(f, "Collaborator unreachable: {e}"),
            Self::InvalidResponse(e) => write!(f, "Invalid collaborator response: {e}"),
        }
    }
}

impl std::error::Error for CollaboratorError {}

/// Workspace/note access checks against the main API.
#[async_trait]
pub trait AccessValidator: Send + Sync {
    /// May `user_id` collaborate in `workspace_id`?
    async fn validate_access(
        &self,
        workspace_id: Uuid,
        user_id: Uuid,
        credential: &str,
    ) -> Result<bool, CollaboratorError>;

    /// May `user_id` write `note_id` through the non-realtime save path?
    async fn validate_update(
        &self,
        note_id: Uuid,
        user_id: Uuid,
        credential: &str,
    ) -> Result<bool, CollaboratorError>;
}

/// Note metadata as seen by the engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NoteInfo {
    pub note_id: Uuid,
    pub workspace_id: Uuid,
}

/// Note existence lookup: note id + workspace binding, or not-found.
#[async_trait]
pub trait NoteDirectory: Send + Sync {
    async fn find_note(
        &self,
        note_id: Uuid,
        workspace_id: Uuid,
        credential: &str,
    ) -> Result<Option<NoteInfo>, CollaboratorError>;
}

/// One audit trail entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEvent {
    pub action: String,
    pub user_id: Uuid,
    pub workspace_id: Uuid,
    pub resource_id: Uuid,
    pub resource_type: String,
    pub details: serde_json::Value,
}

/// Fire-and-forget audit sink.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn log_event(&self, event: AuditEvent) -> Result<(), CollaboratorError>;
}

// ─── HTTP implementations ────────────────────────────────────────────

#[derive(Serialize)]
struct ValidateRequest {
    #[serde(rename = "userId")]
    user_id: Uuid,
}

#[derive(Deserialize)]
struct ValidateResponse {
    valid: bool,
}

fn http_client(timeout: Duration) -> Result<reqwest::Client, CollaboratorError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| CollaboratorError::Unreachable(e.to_string()))
}

/// Access validation against the main API.
pub struct HttpAccessValidator {
    client: reqwest::Client,
    base_url: String,
}

impl HttpAccessValidator {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, CollaboratorError> {
        Ok(Self {
            client: http_client(timeout)?,
            base_url: base_url.into(),
        })
    }

    async fn post_validate(
        &self,
        url: String,
        user_id: Uuid,
        credential: &str,
    ) -> Result<bool, CollaboratorError> {
        let response = self
            .client
            .post(&url)
            .bearer_auth(credential)
            .json(&ValidateRequest { user_id })
            .send()
            .await
            .map_err(|e| CollaboratorError::Unreachable(e.to_string()))?;

        if !response.status().is_success() {
            return Ok(false);
        }
        let body: ValidateResponse = response
            .json()
            .await
            .map_err(|e| CollaboratorError::InvalidResponse(e.to_string()))?;
        Ok(body.valid)
    }
}

#[async_trait]
impl AccessValidator for HttpAccessValidator {
    async fn validate_access(
        &self,
        workspace_id: Uuid,
        user_id: Uuid,
        credential: &str,
    ) -> Result<bool, CollaboratorError> {
        let url = format!(
            "{}/api/workspaces/{workspace_id}/validate-access",
            self.base_url
        );
        self.post_validate(url, user_id, credential).await
    }

    async fn validate_update(
        &self,
        note_id: Uuid,
        user_id: Uuid,
        credential: &str,
    ) -> Result<bool, CollaboratorError> {
        let url = format!("{}/api/notes/{note_id}/validate-update", self.base_url);
        self.post_validate(url, user_id, credential).await
    }
}

#[derive(Deserialize)]
struct NoteResponse {
    #[serde(rename = "noteId")]
    note_id: Uuid,
    #[serde(rename = "workspaceId")]
    workspace_id: Uuid,
}

/// Note lookup against the main API.
pub struct HttpNoteDirectory {
    client: reqwest::Client,
    base_url: String,
}

impl HttpNoteDirectory {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, CollaboratorError> {
        Ok(Self {
            client: http_client(timeout)?,
            base_url: base_url.into(),
        })
    }
}

#[async_trait]
impl NoteDirectory for HttpNoteDirectory {
    async fn find_note(
        &self,
        note_id: Uuid,
        workspace_id: Uuid,
        credential: &str,
    ) -> Result<Option<NoteInfo>, CollaboratorError> {
        let url = format!("{}/api/notes/{note_id}", self.base_url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(credential)
            .send()
            .await
            .map_err(|e| CollaboratorError::Unreachable(e.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(CollaboratorError::InvalidResponse(format!(
                "status {}",
                response.status()
            )));
        }

        let body: NoteResponse = response
            .json()
            .await
            .map_err(|e| CollaboratorError::InvalidResponse(e.to_string()))?;

        // A note bound to a different workspace reads as not-found.
        if body.workspace_id != workspace_id {
            return Ok(None);
        }
        Ok(Some(NoteInfo {
            note_id: body.note_id,
            workspace_id: body.workspace_id,
        }))
    }
}

/// Audit sink posting to the main API.
pub struct HttpAuditSink {
    client: reqwest::Client,
    base_url: String,
    credential: String,
}

impl HttpAuditSink {
    pub fn new(
        base_url: impl Into<String>,
        credential: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, CollaboratorError> {
        Ok(Self {
            client: http_client(timeout)?,
            base_url: base_url.into(),
            credential: credential.into(),
        })
    }
}

#[async_trait]
impl AuditSink for HttpAuditSink {
    async fn log_event(&self, event: AuditEvent) -> Result<(), CollaboratorError> {
        let url = format!("{}/api/audit/log", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.credential)
            .json(&event)
            .send()
            .await
            .map_err(|e| CollaboratorError::Unreachable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(CollaboratorError::InvalidResponse(format!(
                "status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

// ─── In-process implementations ──────────────────────────────────────

/// Validator with fixed answers. Backs embedded setups and tests.
pub struct StaticAccessValidator {
    pub allow_access: bool,
    pub allow_update: bool,
}

impl StaticAccessValidator {
    pub fn allow_all() -> Self {
        Self {
            allow_access: true,
            allow_update: true,
        }
    }

    pub fn deny_all() -> Self {
        Self {
            allow_access: false,
            allow_update: false,
        }
    }
}

#[async_trait]
impl AccessValidator for StaticAccessValidator {
    async fn validate_access(
        &self,
        _workspace_id: Uuid,
        _user_id: Uuid,
        _credential: &str,
    ) -> Result<bool, CollaboratorError> {
        Ok(self.allow_access)
    }

    async fn validate_update(
        &self,
        _note_id: Uuid,
        _user_id: Uuid,
        _credential: &str,
    ) -> Result<bool, CollaboratorError> {
        Ok(self.allow_update)
    }
}

/// In-memory note directory.
pub struct MemoryNoteDirectory {
    notes: RwLock<HashMap<Uuid, NoteInfo>>,
}

impl MemoryNoteDirectory {
    pub fn new() -> Self {
        Self {
            notes: RwLock::new(HashMap::new()),
        }
    }

    pub async fn insert(&self, note_id: Uuid, workspace_id: Uuid) {
        self.notes.write().await.insert(
            note_id,
            NoteInfo {
                note_id,
                workspace_id,
            },
        );
    }
}

impl Default for MemoryNoteDirectory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NoteDirectory for MemoryNoteDirectory {
    async fn find_note(
        &self,
        note_id: Uuid,
        workspace_id: Uuid,
        _credential: &str,
    ) -> Result<Option<NoteInfo>, CollaboratorError> {
        let notes = self.notes.read().await;
        Ok(notes
            .get(&note_id)
            .filter(|info| info.workspace_id == workspace_id)
            .cloned())
    }
}

/// In-memory audit sink recording events for inspection.
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn recorded(&self) -> Vec<AuditEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl Default for MemoryAuditSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn log_event(&self, event: AuditEvent) -> Result<(), CollaboratorError> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_validator() {
        let allow = StaticAccessValidator::allow_all();
        assert!(allow
            .validate_access(Uuid::new_v4(), Uuid::new_v4(), "t")
            .await
            .unwrap());
        assert!(allow
            .validate_update(Uuid::new_v4(), Uuid::new_v4(), "t")
            .await
            .unwrap());

        let deny = StaticAccessValidator::deny_all();
        assert!(!deny
            .validate_access(Uuid::new_v4(), Uuid::new_v4(), "t")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_memory_directory_workspace_binding() {
        let directory = MemoryNoteDirectory::new();
        let note = Uuid::new_v4();
        let workspace = Uuid::new_v4();
        directory.insert(note, workspace).await;

        let found = directory.find_note(note, workspace, "t").await.unwrap();
        assert_eq!(found.unwrap().note_id, note);

        // Same note under a different workspace is not-found.
        let other = directory
            .find_note(note, Uuid::new_v4(), "t")
            .await
            .unwrap();
        assert!(other.is_none());

        let missing = directory
            .find_note(Uuid::new_v4(), workspace, "t")
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_memory_audit_records() {
        let sink = MemoryAuditSink::new();
        let event = AuditEvent {
            action: "note_updated".into(),
            user_id: Uuid::new_v4(),
            workspace_id: Uuid::new_v4(),
            resource_id: Uuid::new_v4(),
            resource_type: "note".into(),
            details: serde_json::json!({ "version": 1 }),
        };
        sink.log_event(event.clone()).await.unwrap();
        assert_eq!(sink.recorded(), vec![event]);
    }

    #[tokio::test]
    async fn test_http_validator_unreachable_is_error() {
        // Nothing listens on this port; transport failure must surface as an
        // error, which the engine reads as denial.
        let validator =
            HttpAccessValidator::new("http://127.0.0.1:1", Duration::from_millis(200)).unwrap();
        let result = validator
            .validate_access(Uuid::new_v4(), Uuid::new_v4(), "t")
            .await;
        assert!(matches!(result, Err(CollaboratorError::Unreachable(_))));
    }
}
