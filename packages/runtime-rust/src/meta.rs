//! Per-invocation metadata and scratch state.

use std::io;
use std::path::PathBuf;

use corebus_core::{Metadata, Res};
use parking_lot::{Mutex, RwLock};
use tempfile::{NamedTempFile, TempDir};

/// Scratch resource owned by a call. Removed from disk when dropped.
#[derive(Debug)]
enum Scratch {
    File(NamedTempFile),
    Dir(TempDir),
}

/// State carried through one invocation, locally or across the bus.
///
/// Holds the propagated [`Metadata`] (trace/span/parent ids, language,
/// timezone offset, token), a pending result slot that nested calls write
/// to, and temp files/dirs created during the call. Shared as `Arc<Meta>`
/// between caller and handler; scratch resources are deleted on
/// [`Meta::close`] or when the last reference is dropped.
#[derive(Debug, Default)]
pub struct Meta {
    metadata: RwLock<Metadata>,
    result: Mutex<Option<Res>>,
    scratch: Mutex<Vec<Scratch>>,
}

impl Meta {
    /// Creates empty metadata.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates metadata with freshly generated trace and span ids.
    #[must_use]
    pub fn traced() -> Self {
        Self::from_metadata(Metadata {
            trace_id: uuid::Uuid::new_v4().simple().to_string(),
            span_id: uuid::Uuid::new_v4().simple().to_string(),
            ..Metadata::default()
        })
    }

    /// Rebuilds call state from metadata received over the wire.
    #[must_use]
    pub fn from_metadata(metadata: Metadata) -> Self {
        Self {
            metadata: RwLock::new(metadata),
            ..Self::default()
        }
    }

    /// Derives metadata for a nested call: same trace, language, timezone
    /// and token; a new span whose parent is this call's span.
    #[must_use]
    pub fn child(&self) -> Self {
        let current = self.metadata.read();
        Self::from_metadata(Metadata {
            trace_id: current.trace_id.clone(),
            span_id: uuid::Uuid::new_v4().simple().to_string(),
            parent_id: current.span_id.clone(),
            language: current.language.clone(),
            timezone_offset: current.timezone_offset,
            token: current.token.clone(),
        })
    }

    /// Snapshot of the wire metadata.
    #[must_use]
    pub fn metadata(&self) -> Metadata {
        self.metadata.read().clone()
    }

    /// Replaces the wire metadata wholesale.
    pub fn set_metadata(&self, metadata: Metadata) {
        *self.metadata.write() = metadata;
    }

    #[must_use]
    pub fn trace_id(&self) -> String {
        self.metadata.read().trace_id.clone()
    }

    pub fn set_trace_id(&self, id: impl Into<String>) {
        self.metadata.write().trace_id = id.into();
    }

    #[must_use]
    pub fn span_id(&self) -> String {
        self.metadata.read().span_id.clone()
    }

    pub fn set_span_id(&self, id: impl Into<String>) {
        self.metadata.write().span_id = id.into();
    }

    #[must_use]
    pub fn parent_id(&self) -> String {
        self.metadata.read().parent_id.clone()
    }

    pub fn set_parent_id(&self, id: impl Into<String>) {
        self.metadata.write().parent_id = id.into();
    }

    #[must_use]
    pub fn language(&self) -> String {
        self.metadata.read().language.clone()
    }

    pub fn set_language(&self, language: impl Into<String>) {
        self.metadata.write().language = language.into();
    }

    /// Offset from UTC in seconds.
    #[must_use]
    pub fn timezone_offset(&self) -> i32 {
        self.metadata.read().timezone_offset
    }

    pub fn set_timezone_offset(&self, seconds: i32) {
        self.metadata.write().timezone_offset = seconds;
    }

    #[must_use]
    pub fn token(&self) -> String {
        self.metadata.read().token.clone()
    }

    pub fn set_token(&self, token: impl Into<String>) {
        self.metadata.write().token = token.into();
    }

    /// Whether the call carries a token.
    #[must_use]
    pub fn signed(&self) -> bool {
        !self.metadata.read().token.is_empty()
    }

    /// Stores the pending result of the last nested call.
    pub fn set_result(&self, res: Res) {
        *self.result.lock() = Some(res);
    }

    /// Takes the pending result, leaving the slot empty. OK if nothing was set.
    pub fn take_result(&self) -> Res {
        self.result.lock().take().unwrap_or_default()
    }

    /// Creates a temp file owned by this call and returns its path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created.
    pub fn temp_file(&self, prefix: &str) -> io::Result<PathBuf> {
        let file = tempfile::Builder::new().prefix(prefix).tempfile()?;
        let path = file.path().to_path_buf();
        self.scratch.lock().push(Scratch::File(file));
        Ok(path)
    }

    /// Creates a temp directory owned by this call and returns its path.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn temp_dir(&self, prefix: &str) -> io::Result<PathBuf> {
        let dir = tempfile::Builder::new().prefix(prefix).tempdir()?;
        let path = dir.path().to_path_buf();
        self.scratch.lock().push(Scratch::Dir(dir));
        Ok(path)
    }

    /// Number of scratch resources currently held.
    #[must_use]
    pub fn scratch_len(&self) -> usize {
        self.scratch.lock().len()
    }

    /// Removes all scratch resources now instead of waiting for drop.
    pub fn close(&self) {
        let drained: Vec<Scratch> = std::mem::take(&mut *self.scratch.lock());
        for item in drained {
            let outcome = match item {
                Scratch::File(file) => file.close(),
                Scratch::Dir(dir) => dir.close(),
            };
            if let Err(e) = outcome {
                tracing::debug!(error = %e, "failed to remove scratch resource");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_meta_is_empty() {
        let meta = Meta::new();
        assert_eq!(meta.metadata(), Metadata::default());
        assert!(!meta.signed());
        assert!(meta.take_result().is_ok());
    }

    #[test]
    fn traced_generates_ids() {
        let meta = Meta::traced();
        assert_eq!(meta.trace_id().len(), 32);
        assert_eq!(meta.span_id().len(), 32);
        assert_ne!(meta.trace_id(), meta.span_id());
        assert!(meta.parent_id().is_empty());
    }

    #[test]
    fn child_keeps_trace_and_links_parent() {
        let meta = Meta::traced();
        meta.set_language("de");
        meta.set_timezone_offset(3600);
        meta.set_token("abc");

        let child = meta.child();
        assert_eq!(child.trace_id(), meta.trace_id());
        assert_eq!(child.parent_id(), meta.span_id());
        assert_ne!(child.span_id(), meta.span_id());
        assert_eq!(child.language(), "de");
        assert_eq!(child.timezone_offset(), 3600);
        assert!(child.signed());
    }

    #[test]
    fn result_slot_is_taken_once() {
        let meta = Meta::new();
        meta.set_result(Res::fail("x", "boom"));
        assert_eq!(meta.take_result().state, "x");
        assert!(meta.take_result().is_ok());
    }

    #[test]
    fn close_removes_scratch_resources() {
        let meta = Meta::new();
        let file = meta.temp_file("corebus-test").unwrap();
        let dir = meta.temp_dir("corebus-test").unwrap();
        assert!(file.exists());
        assert!(dir.is_dir());
        assert_eq!(meta.scratch_len(), 2);

        meta.close();
        assert!(!file.exists());
        assert!(!dir.exists());
        assert_eq!(meta.scratch_len(), 0);
    }

    #[test]
    fn drop_removes_scratch_resources() {
        let path = {
            let meta = Meta::new();
            meta.temp_file("corebus-drop").unwrap()
        };
        assert!(!path.exists());
    }
}
