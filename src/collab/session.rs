//! Session identifier validation.
//!
//! A session id is opaque to the hub but must be a plain token
//! (`[A-Za-z0-9_-]+`) and, for registration, must match a record written by
//! the session launcher. That record is the only authentication the hub does.

use std::path::{Path, PathBuf};

/// Checks whether a session id has a local session record.
pub trait SessionValidator: Send + Sync {
    /// Returns true if a record for `session_id` exists.
    fn exists(&self, session_id: &str) -> bool;
}

/// Returns true if `id` is a non-empty `[A-Za-z0-9_-]+` token.
pub fn is_valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// Session records stored as `<dir>/<session_id>.json`.
#[derive(Debug, Clone)]
pub struct SessionDir {
    dir: PathBuf,
}

impl SessionDir {
    /// Validator over the given directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory being checked.
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl SessionValidator for SessionDir {
    fn exists(&self, session_id: &str) -> bool {
        // Never build a path from an unvalidated id.
        is_valid_session_id(session_id) && self.dir.join(format!("{session_id}.json")).is_file()
    }
}
