//! Credential loading interface.
//!
//! The engine never stores secrets. Nodes map plugin credential
//! requirements to stored-credential ids, and the injected
//! [`CredentialLoader`] turns an id into a usable record at dispatch time.
//! For OAuth2-backed credentials the loader is responsible for refresh with
//! at least a five-minute safety window; the engine treats whatever it
//! returns as an immutable snapshot valid for a single plugin call.

use async_trait::async_trait;
use miette::Diagnostic;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

/// A loaded credential, ready for plugin use.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CredentialRecord {
    pub id: String,
    /// Provider-specific payload: tokens, keys, endpoints.
    pub data: Value,
}

impl CredentialRecord {
    #[must_use]
    pub fn new(id: impl Into<String>, data: Value) -> Self {
        Self {
            id: id.into(),
            data,
        }
    }
}

/// Errors surfaced by credential loading.
#[derive(Debug, Error, Diagnostic)]
pub enum CredentialError {
    #[error("credential not found: {credential_id}")]
    #[diagnostic(
        code(kianax::credentials::not_found),
        help("Check the node's credentialMappings against the credential store.")
    )]
    NotFound { credential_id: String },

    #[error("credential load failed for {credential_id}: {message}")]
    #[diagnostic(code(kianax::credentials::load))]
    Load {
        credential_id: String,
        message: String,
    },
}

/// Loads stored credentials by id.
#[async_trait]
pub trait CredentialLoader: Send + Sync {
    async fn load(&self, credential_id: &str) -> Result<CredentialRecord, CredentialError>;
}

/// Loader that knows no credentials. Every lookup fails, which is the
/// correct behavior for routines that map no credentials at all.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoCredentials;

#[async_trait]
impl CredentialLoader for NoCredentials {
    async fn load(&self, credential_id: &str) -> Result<CredentialRecord, CredentialError> {
        Err(CredentialError::NotFound {
            credential_id: credential_id.to_string(),
        })
    }
}

/// In-memory loader backed by a fixed map. Used by tests and embedders that
/// resolve credentials ahead of execution.
#[derive(Clone, Debug, Default)]
pub struct StaticCredentialLoader {
    records: Arc<Mutex<FxHashMap<String, CredentialRecord>>>,
}

impl StaticCredentialLoader {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: CredentialRecord) {
        self.records.lock().insert(record.id.clone(), record);
    }

    #[must_use]
    pub fn with_record(self, record: CredentialRecord) -> Self {
        self.insert(record);
        self
    }
}

#[async_trait]
impl CredentialLoader for StaticCredentialLoader {
    async fn load(&self, credential_id: &str) -> Result<CredentialRecord, CredentialError> {
        self.records
            .lock()
            .get(credential_id)
            .cloned()
            .ok_or_else(|| CredentialError::NotFound {
                credential_id: credential_id.to_string(),
            })
    }
}
