//! Error type shared by the folder, deriver, and executor.
//!
//! Collaborator errors (`FsError`, `RemoteError`, `PayloadError`) convert into
//! `SyncError`, which carries a coarse `ErrorKind` plus the path and remote id
//! the failure was about.

use std::fmt::{self, Display, Formatter};
use thiserror::Error;

use crate::fs::FsError;
use crate::payload::PayloadError;
use crate::remote::RemoteError;

/// Coarse classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    InvalidArgument,
    /// Two live records resolved to the same path.
    AlreadyExists,
    Internal,
    Unknown,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::NotFound => "not-found",
            ErrorKind::InvalidArgument => "invalid-argument",
            ErrorKind::AlreadyExists => "already-exists",
            ErrorKind::Internal => "internal",
            ErrorKind::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Failure surfaced by the convergence engine.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}{}", context_suffix(.path, .remote_id))]
pub struct SyncError {
    pub kind: ErrorKind,
    pub message: String,
    pub path: Option<String>,
    pub remote_id: Option<String>,
}

fn context_suffix(path: &Option<String>, remote_id: &Option<String>) -> String {
    match (path, remote_id) {
        (Some(path), Some(id)) => format!(" (path: {path}, remote: {id})"),
        (Some(path), None) => format!(" (path: {path})"),
        (None, Some(id)) => format!(" (remote: {id})"),
        (None, None) => String::new(),
    }
}

impl SyncError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            path: None,
            remote_id: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }

    /// Attach the path this failure concerns, unless one is already set.
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        if self.path.is_none() {
            self.path = Some(path.into());
        }
        self
    }

    pub fn with_remote_id(mut self, remote_id: impl Into<String>) -> Self {
        if self.remote_id.is_none() {
            self.remote_id = Some(remote_id.into());
        }
        self
    }
}

impl From<FsError> for SyncError {
    fn from(err: FsError) -> Self {
        let kind = match &err {
            FsError::NotFound(_) => ErrorKind::NotFound,
            FsError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            FsError::IsDirectory(_) | FsError::NotDirectory(_) | FsError::OutsideVault(_) => {
                ErrorKind::InvalidArgument
            }
            FsError::Io(_) => ErrorKind::Unknown,
        };
        let path = match &err {
            FsError::NotFound(p)
            | FsError::AlreadyExists(p)
            | FsError::IsDirectory(p)
            | FsError::NotDirectory(p)
            | FsError::OutsideVault(p) => Some(p.clone()),
            FsError::Io(_) => None,
        };
        Self {
            kind,
            message: err.to_string(),
            path,
            remote_id: None,
        }
    }
}

impl From<RemoteError> for SyncError {
    fn from(err: RemoteError) -> Self {
        let kind = match &err {
            RemoteError::NotFound(_) => ErrorKind::NotFound,
            RemoteError::PathTaken { .. } => ErrorKind::AlreadyExists,
            RemoteError::Invalid(_) => ErrorKind::InvalidArgument,
            RemoteError::Unavailable(_) => ErrorKind::Unknown,
        };
        let remote_id = match &err {
            RemoteError::NotFound(id) => Some(id.clone()),
            RemoteError::PathTaken { remote_id, .. } => Some(remote_id.clone()),
            _ => None,
        };
        let path = match &err {
            RemoteError::PathTaken { path, .. } => Some(path.clone()),
            _ => None,
        };
        Self {
            kind,
            message: err.to_string(),
            path,
            remote_id,
        }
    }
}

impl From<PayloadError> for SyncError {
    fn from(err: PayloadError) -> Self {
        let kind = match &err {
            PayloadError::HashMismatch { .. } | PayloadError::Corrupt(_) => ErrorKind::Internal,
            PayloadError::Io(_) => ErrorKind::Unknown,
            PayloadError::Blob(inner) => SyncError::from(inner.clone()).kind,
        };
        Self::new(kind, err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
