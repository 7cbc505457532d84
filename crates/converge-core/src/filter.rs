//! Exclusion policy: which vault paths take part in sync at all.

use crate::error::{ErrorKind, Result, SyncError};

/// Longest path accepted from a remote record.
pub const MAX_PATH_LEN: usize = 1024;

/// Directory holding engine state inside a vault; never synced.
pub const SYNC_DIR: &str = ".sync";

/// Decides whether a relative vault path is excluded from sync.
///
/// Hidden files and directories (any segment starting with `.`) are always
/// excluded, which also covers [`SYNC_DIR`].
#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    excluded_prefixes: Vec<String>,
    extensions: Option<Vec<String>>,
}

impl PathFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exclude everything at or below `prefix`.
    pub fn exclude_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.excluded_prefixes
            .push(prefix.into().trim_matches('/').to_string());
        self
    }

    /// Only sync files with one of these extensions (without the dot).
    pub fn only_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extensions = Some(
            extensions
                .into_iter()
                .map(|e| e.into().trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        );
        self
    }

    pub fn is_excluded(&self, path: &str) -> bool {
        let path = path.trim_matches('/');
        if path.is_empty() {
            return true;
        }

        if path
            .split('/')
            .any(|segment| segment.is_empty() || segment.starts_with('.') || segment == "..")
        {
            return true;
        }

        if self.excluded_prefixes.iter().any(|prefix| {
            path == prefix || path.strip_prefix(prefix.as_str()).is_some_and(|rest| rest.starts_with('/'))
        }) {
            return true;
        }

        match &self.extensions {
            Some(allowed) => {
                let ext = path
                    .rsplit('/')
                    .next()
                    .and_then(|name| name.rsplit_once('.'))
                    .map(|(_, ext)| ext.to_ascii_lowercase());
                !ext.is_some_and(|ext| allowed.contains(&ext))
            }
            None => false,
        }
    }
}

/// Check that a path from a remote record is a plain vault-relative path.
///
/// A path that passes stays inside the vault when joined to its root.
pub fn validate_sync_path(path: &str) -> Result<()> {
    let reason = if path.is_empty() {
        Some("empty path")
    } else if path.len() > MAX_PATH_LEN {
        Some("path too long")
    } else if path.starts_with('/') {
        Some("absolute path")
    } else if path.len() >= 2 && path.chars().nth(1) == Some(':') {
        Some("drive letter in path")
    } else if path.contains('\\') {
        Some("backslash in path")
    } else if path.chars().any(|c| c.is_control()) {
        Some("control character in path")
    } else if path.split('/').any(|segment| segment.is_empty()) {
        Some("empty path segment")
    } else if path.split('/').any(|segment| segment == "." || segment == "..") {
        Some("path traversal")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(SyncError::new(
            ErrorKind::InvalidArgument,
            format!("rejected sync path: {reason}"),
        )
        .with_path(path)),
        None => Ok(()),
    }
}
