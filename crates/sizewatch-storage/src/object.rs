//! Object store abstraction and an in-memory implementation.
//!
//! The pipeline only needs list/stat/delete from the store; `put` exists so a
//! driver (or a test) can mutate it. Every successful mutation of
//! [`MemoryObjectStore`] is reported to its [`ChangeNotifier`], mirroring how a
//! real store emits create/remove notifications.
use async_trait::async_trait;
use bytes::Bytes;
use sizewatch_common::{ChangeEvent, ChangeKind, Clock, ObjectInfo, SystemClock};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::{Result, StorageError};

/// Page size used by [`ObjectStore::list_all`].
pub const DEFAULT_PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    pub objects: Vec<ObjectInfo>,
    // Pass back as `start_after` to fetch the next page; None on the last page.
    pub next_start_after: Option<String>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// List objects with keys strictly after `start_after`, in key order.
    async fn list_page(
        &self,
        subject: &str,
        start_after: Option<&str>,
        max_keys: usize,
    ) -> Result<ListPage>;

    async fn stat(&self, subject: &str, key: &str) -> Result<ObjectInfo>;

    async fn put(&self, subject: &str, key: &str, body: Bytes) -> Result<ObjectInfo>;

    /// Delete an object, returning what was removed. Missing keys are `NotFound`.
    async fn delete(&self, subject: &str, key: &str) -> Result<ObjectInfo>;

    /// Enumerate every object of a subject, following pagination.
    async fn list_all(&self, subject: &str) -> Result<Vec<ObjectInfo>> {
        let mut objects = Vec::new();
        let mut start_after: Option<String> = None;
        loop {
            let page = self
                .list_page(subject, start_after.as_deref(), DEFAULT_PAGE_SIZE)
                .await?;
            objects.extend(page.objects);
            match page.next_start_after {
                Some(next) => start_after = Some(next),
                None => return Ok(objects),
            }
        }
    }
}

/// Receives change events for store mutations.
#[async_trait]
pub trait ChangeNotifier: Send + Sync {
    async fn notify(&self, events: &[ChangeEvent]) -> Result<()>;
}

/// In-memory object store keyed by subject then object key.
pub struct MemoryObjectStore {
    subjects: RwLock<HashMap<String, BTreeMap<String, Bytes>>>,
    notifier: Option<Arc<dyn ChangeNotifier>>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for MemoryObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryObjectStore")
            .field("notifier", &self.notifier.is_some())
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self {
            subjects: RwLock::new(HashMap::new()),
            notifier: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn ChangeNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub async fn total_size(&self, subject: &str) -> u64 {
        self.subjects
            .read()
            .await
            .get(subject)
            .map(|objects| objects.values().map(|body| body.len() as u64).sum())
            .unwrap_or(0)
    }

    async fn emit(&self, event: ChangeEvent) {
        let Some(notifier) = &self.notifier else {
            return;
        };
        // The mutation already happened; a lost notification only delays convergence.
        if let Err(err) = notifier.notify(std::slice::from_ref(&event)).await {
            tracing::warn!(
                subject = %event.subject,
                key = %event.key,
                error = %err,
                "failed to emit change notification"
            );
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn list_page(
        &self,
        subject: &str,
        start_after: Option<&str>,
        max_keys: usize,
    ) -> Result<ListPage> {
        let max_keys = max_keys.max(1);
        let subjects = self.subjects.read().await;
        let Some(objects) = subjects.get(subject) else {
            return Ok(ListPage::default());
        };
        let mut iter = objects
            .iter()
            .filter(|(key, _)| start_after.is_none_or(|after| key.as_str() > after));
        let page: Vec<ObjectInfo> = iter
            .by_ref()
            .take(max_keys)
            .map(|(key, body)| ObjectInfo {
                key: key.clone(),
                size_bytes: body.len() as u64,
            })
            .collect();
        let next_start_after = if iter.next().is_some() {
            page.last().map(|info| info.key.clone())
        } else {
            None
        };
        Ok(ListPage {
            objects: page,
            next_start_after,
        })
    }

    async fn stat(&self, subject: &str, key: &str) -> Result<ObjectInfo> {
        self.subjects
            .read()
            .await
            .get(subject)
            .and_then(|objects| objects.get(key))
            .map(|body| ObjectInfo {
                key: key.to_string(),
                size_bytes: body.len() as u64,
            })
            .ok_or_else(|| StorageError::NotFound(format!("{subject}/{key}")))
    }

    async fn put(&self, subject: &str, key: &str, body: Bytes) -> Result<ObjectInfo> {
        let info = ObjectInfo {
            key: key.to_string(),
            size_bytes: body.len() as u64,
        };
        self.subjects
            .write()
            .await
            .entry(subject.to_string())
            .or_default()
            .insert(key.to_string(), body);
        tracing::debug!(%subject, %key, size = info.size_bytes, "object stored");
        self.emit(ChangeEvent::new(
            subject,
            key,
            ChangeKind::Created,
            info.size_bytes,
            self.clock.now_ms(),
        ))
        .await;
        Ok(info)
    }

    async fn delete(&self, subject: &str, key: &str) -> Result<ObjectInfo> {
        let removed = self
            .subjects
            .write()
            .await
            .get_mut(subject)
            .and_then(|objects| objects.remove(key));
        let Some(body) = removed else {
            return Err(StorageError::NotFound(format!("{subject}/{key}")));
        };
        let info = ObjectInfo {
            key: key.to_string(),
            size_bytes: body.len() as u64,
        };
        tracing::debug!(%subject, %key, size = info.size_bytes, "object deleted");
        self.emit(ChangeEvent::new(
            subject,
            key,
            ChangeKind::Removed,
            info.size_bytes,
            self.clock.now_ms(),
        ))
        .await;
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use sizewatch_common::ManualClock;

    #[derive(Default)]
    struct RecordingNotifier {
        events: Mutex<Vec<ChangeEvent>>,
    }

    #[async_trait]
    impl ChangeNotifier for RecordingNotifier {
        async fn notify(&self, events: &[ChangeEvent]) -> Result<()> {
            self.events.lock().extend_from_slice(events);
            Ok(())
        }
    }

    struct FailingNotifier;

    #[async_trait]
    impl ChangeNotifier for FailingNotifier {
        async fn notify(&self, _events: &[ChangeEvent]) -> Result<()> {
            Err(StorageError::Notify("topic gone".into()))
        }
    }

    #[tokio::test]
    async fn put_and_delete_emit_change_events() {
        let notifier = Arc::new(RecordingNotifier::default());
        let store = MemoryObjectStore::new()
            .with_notifier(notifier.clone())
            .with_clock(Arc::new(ManualClock::new(500)));

        store
            .put("b", "assignment1.txt", Bytes::from_static(b"Empty Assignment 1\n"))
            .await
            .expect("put");
        let removed = store.delete("b", "assignment1.txt").await.expect("delete");
        assert_eq!(removed.size_bytes, 19);

        let events = notifier.events.lock().clone();
        assert_eq!(
            events,
            vec![
                ChangeEvent::new("b", "assignment1.txt", ChangeKind::Created, 19, 500),
                ChangeEvent::new("b", "assignment1.txt", ChangeKind::Removed, 19, 500),
            ]
        );
    }

    #[tokio::test]
    async fn delete_missing_is_not_found_and_silent() {
        let notifier = Arc::new(RecordingNotifier::default());
        let store = MemoryObjectStore::new().with_notifier(notifier.clone());
        let err = store.delete("b", "nope").await.expect_err("missing");
        assert!(err.is_not_found());
        assert!(notifier.events.lock().is_empty());
    }

    #[tokio::test]
    async fn notifier_failure_does_not_fail_mutation() {
        let store = MemoryObjectStore::new().with_notifier(Arc::new(FailingNotifier));
        store
            .put("b", "k", Bytes::from_static(b"abc"))
            .await
            .expect("put");
        assert_eq!(store.stat("b", "k").await.expect("stat").size_bytes, 3);
    }

    #[tokio::test]
    async fn list_all_follows_pages_in_key_order() {
        let store = MemoryObjectStore::new();
        for i in (0..2500).rev() {
            store
                .put("b", &format!("key-{i:05}"), Bytes::from(vec![0u8; i % 7]))
                .await
                .expect("put");
        }
        let first = store.list_page("b", None, 1000).await.expect("page");
        assert_eq!(first.objects.len(), 1000);
        assert_eq!(first.next_start_after.as_deref(), Some("key-00999"));

        let all = store.list_all("b").await.expect("list");
        assert_eq!(all.len(), 2500);
        assert!(all.windows(2).all(|pair| pair[0].key < pair[1].key));
        let total: u64 = all.iter().map(|info| info.size_bytes).sum();
        assert_eq!(total, store.total_size("b").await);
    }

    #[tokio::test]
    async fn exact_page_boundary_has_no_next_token() {
        let store = MemoryObjectStore::new();
        store.put("b", "a", Bytes::from_static(b"1")).await.expect("put");
        store.put("b", "b", Bytes::from_static(b"2")).await.expect("put");
        let page = store.list_page("b", None, 2).await.expect("page");
        assert_eq!(page.objects.len(), 2);
        assert!(page.next_start_after.is_none());
        let after = store.list_page("b", Some("a"), 10).await.expect("page");
        assert_eq!(after.objects.len(), 1);
        assert_eq!(after.objects[0].key, "b");
    }

    #[tokio::test]
    async fn unknown_subject_lists_empty() {
        let store = MemoryObjectStore::new();
        assert!(store.list_all("nobody").await.expect("list").is_empty());
        assert!(store.stat("nobody", "k").await.expect_err("stat").is_not_found());
    }

    #[tokio::test]
    async fn overwrite_reports_new_size() {
        let notifier = Arc::new(RecordingNotifier::default());
        let store = MemoryObjectStore::new().with_notifier(notifier.clone());
        store
            .put("b", "a.txt", Bytes::from_static(b"Empty Assignment 1\n"))
            .await
            .expect("put");
        store
            .put("b", "a.txt", Bytes::from_static(b"Empty Assignment 2222222222\n"))
            .await
            .expect("put");
        assert_eq!(store.total_size("b").await, 28);
        let sizes: Vec<u64> = notifier
            .events
            .lock()
            .iter()
            .map(|event| event.size_bytes)
            .collect();
        assert_eq!(sizes, vec![19, 28]);
    }
}
