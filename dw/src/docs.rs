//! Document appender
//!
//! The worker only needs one capability from the target document service:
//! append a piece of text at the end of a document, and say whether a failure
//! is worth retrying. The wire protocol of any real service stays behind this
//! trait.

use std::collections::{HashMap, VecDeque};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Append failures, classified for the worker
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AppendError {
    /// Timeout, rate limit, server error: retry later
    #[error("Transient append failure: {0}")]
    Transient(String),

    /// Missing document, forbidden, malformed request: retrying cannot help
    #[error("Permanent append failure: {0}")]
    Permanent(String),
}

impl AppendError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppendError::Transient(_))
    }
}

/// Appends text to the end of an external document
#[async_trait]
pub trait DocumentAppender: Send + Sync {
    /// Append `text` to `target_document_id` on behalf of the holder of `access_token`
    async fn append(&self, access_token: &str, target_document_id: &str, text: &str) -> Result<(), AppendError>;
}

/// Appends to plain files: `<dir>/<document id>.txt`
#[derive(Debug, Clone)]
pub struct FileAppender {
    dir: PathBuf,
}

impl FileAppender {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path for a document id, rejecting anything that could escape `dir`
    pub fn path_for(&self, target_document_id: &str) -> Result<PathBuf, AppendError> {
        let valid = !target_document_id.is_empty()
            && !target_document_id.starts_with('.')
            && target_document_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(AppendError::Permanent(format!(
                "Invalid document id: {:?}",
                target_document_id
            )));
        }
        Ok(self.dir.join(format!("{}.txt", target_document_id)))
    }
}

fn classify_io(err: std::io::Error) -> AppendError {
    match err.kind() {
        ErrorKind::PermissionDenied | ErrorKind::InvalidInput | ErrorKind::ReadOnlyFilesystem => {
            AppendError::Permanent(err.to_string())
        }
        _ => AppendError::Transient(err.to_string()),
    }
}

#[async_trait]
impl DocumentAppender for FileAppender {
    async fn append(&self, _access_token: &str, target_document_id: &str, text: &str) -> Result<(), AppendError> {
        debug!(%target_document_id, len = text.len(), "FileAppender::append: called");
        let path = self.path_for(target_document_id)?;

        tokio::fs::create_dir_all(&self.dir).await.map_err(classify_io)?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(classify_io)?;
        file.write_all(text.as_bytes()).await.map_err(classify_io)?;
        file.flush().await.map_err(classify_io)?;
        Ok(())
    }
}

/// In-memory documents with scripted failures (tests and dry runs)
#[derive(Debug, Default)]
pub struct MemoryAppender {
    documents: Mutex<HashMap<String, String>>,
    failures: Mutex<VecDeque<AppendError>>,
    calls: Mutex<usize>,
}

impl MemoryAppender {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next append call fail with `err` (queued, first in first out)
    pub fn fail_next(&self, err: AppendError) {
        debug!(?err, "MemoryAppender::fail_next: called");
        if let Ok(mut failures) = self.failures.lock() {
            failures.push_back(err);
        }
    }

    /// Current content of a document
    pub fn document(&self, target_document_id: &str) -> String {
        self.documents
            .lock()
            .ok()
            .and_then(|docs| docs.get(target_document_id).cloned())
            .unwrap_or_default()
    }

    /// Number of append attempts, failed ones included
    pub fn calls(&self) -> usize {
        self.calls.lock().map(|c| *c).unwrap_or_default()
    }
}

#[async_trait]
impl DocumentAppender for MemoryAppender {
    async fn append(&self, _access_token: &str, target_document_id: &str, text: &str) -> Result<(), AppendError> {
        debug!(%target_document_id, len = text.len(), "MemoryAppender::append: called");
        if let Ok(mut calls) = self.calls.lock() {
            *calls += 1;
        }

        let scripted = self.failures.lock().ok().and_then(|mut f| f.pop_front());
        if let Some(err) = scripted {
            warn!(%target_document_id, %err, "MemoryAppender::append: scripted failure");
            return Err(err);
        }

        let mut documents = self
            .documents
            .lock()
            .map_err(|_| AppendError::Transient("document map poisoned".to_string()))?;
        documents.entry(target_document_id.to_string()).or_default().push_str(text);
        Ok(())
    }
}
