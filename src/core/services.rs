//! Content services
//!
//! Orchestration above the bridge: fetch content and chapters from a runner
//! and persist them, record reading progress, and reconcile progress between
//! the local store, the runner's own markers and linked trackers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::core::error::{BridgeError, Result};
use crate::plugin::capability::Capability;
use crate::plugin::runner::RunnerHandle;
use crate::plugin::types::{Chapter, Content, TrackItem, TrackProgressUpdate};

/// Persisted copy of a runner's content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredContent {
    pub runner_id: String,
    pub content_id: String,
    pub content: Content,
    pub chapters: Vec<Chapter>,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn store_content(&self, runner_id: &str, content_id: &str, content: &Content) -> Result<()>;
    async fn store_chapters(&self, runner_id: &str, content_id: &str, chapters: &[Chapter]) -> Result<()>;
    async fn get_stored_content(&self, runner_id: &str, content_id: &str) -> Result<Option<StoredContent>>;
}

#[async_trait]
pub trait ProgressStore: Send + Sync {
    /// Highest chapter number marked read, 0 when nothing is
    async fn highest_marked_chapter(&self, runner_id: &str, content_id: &str) -> Result<f64>;
    async fn mark_chapters(&self, runner_id: &str, content_id: &str, numbers: &[f64]) -> Result<()>;
}

#[async_trait]
pub trait TrackerClient: Send + Sync {
    fn id(&self) -> &str;
    async fn get_track_item(&self, id: &str) -> Result<TrackItem>;
    async fn did_update_last_read_chapter(&self, id: &str, progress: &TrackProgressUpdate) -> Result<()>;
}

/// A tracker entry linked to a piece of content
#[derive(Clone)]
pub struct TrackerLink {
    pub tracker: Arc<dyn TrackerClient>,
    pub entry_id: String,
}

/// Exposes a runner advertising `advancedTracker` as a tracker
pub struct RunnerTracker {
    handle: Arc<RunnerHandle>,
}

impl RunnerTracker {
    pub fn new(handle: Arc<RunnerHandle>) -> Result<Self> {
        if !handle.supports(Capability::Tracking) {
            return Err(BridgeError::CapabilityDisabled {
                runner: handle.id().to_string(),
                capability: Capability::Tracking.to_string(),
            });
        }
        Ok(Self { handle })
    }
}

#[async_trait]
impl TrackerClient for RunnerTracker {
    fn id(&self) -> &str {
        self.handle.id()
    }

    async fn get_track_item(&self, id: &str) -> Result<TrackItem> {
        self.handle.get_track_item(id).await
    }

    async fn did_update_last_read_chapter(&self, id: &str, progress: &TrackProgressUpdate) -> Result<()> {
        self.handle.did_update_last_read_chapter(id, progress).await
    }
}

/// Result of one progress reconciliation
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncOutcome {
    pub max_read_chapter: f64,
    /// Trackers that were behind and accepted the update
    pub updated_trackers: Vec<String>,
    pub marked_locally: Vec<f64>,
}

pub struct ContentService {
    content_store: Arc<dyn ContentStore>,
    progress_store: Arc<dyn ProgressStore>,
}

impl ContentService {
    pub fn new(content_store: Arc<dyn ContentStore>, progress_store: Arc<dyn ProgressStore>) -> Self {
        Self {
            content_store,
            progress_store,
        }
    }

    /// Fetch content and persist it, falling back to the stored copy
    pub async fn load_content(&self, runner: &RunnerHandle, content_id: &str) -> Result<Content> {
        match runner.get_content(content_id).await {
            Ok(content) => {
                self.content_store.store_content(runner.id(), content_id, &content).await?;
                if let Some(chapters) = &content.chapters {
                    self.content_store.store_chapters(runner.id(), content_id, chapters).await?;
                }
                debug!(runner = %runner.id(), content_id = %content_id, "Content stored");
                Ok(content)
            }
            Err(e) => match self.content_store.get_stored_content(runner.id(), content_id).await? {
                Some(stored) => {
                    warn!(runner = %runner.id(), content_id = %content_id, "Using stored content: {}", e);
                    Ok(stored.content)
                }
                None => Err(e),
            },
        }
    }

    /// Fetch the chapter list and persist it, falling back to stored chapters
    pub async fn load_chapters(&self, runner: &RunnerHandle, content_id: &str) -> Result<Vec<Chapter>> {
        match runner.get_chapters(content_id).await {
            Ok(chapters) => {
                self.content_store.store_chapters(runner.id(), content_id, &chapters).await?;
                Ok(chapters)
            }
            Err(e) => match self.content_store.get_stored_content(runner.id(), content_id).await? {
                Some(stored) if !stored.chapters.is_empty() => {
                    warn!(runner = %runner.id(), content_id = %content_id, "Using stored chapters: {}", e);
                    Ok(stored.chapters)
                }
                _ => Err(e),
            },
        }
    }

    /// Record a chapter as read and notify the runner if it listens
    pub async fn mark_chapter_read(&self, runner: &RunnerHandle, content_id: &str, chapter: &Chapter) -> Result<()> {
        self.progress_store
            .mark_chapters(runner.id(), content_id, &[chapter.number])
            .await?;

        if runner.supports(Capability::ChapterEvents) {
            if let Err(e) = runner.on_chapter_read(content_id, &chapter.chapter_id).await {
                warn!(runner = %runner.id(), chapter = %chapter.chapter_id, "onChapterRead failed: {}", e);
            }
        }
        Ok(())
    }

    /// Reconcile read progress for one piece of content
    ///
    /// The highest chapter read anywhere wins. Trackers that are behind are
    /// updated and local markers are filled in up to it. Tracker and runner
    /// failures count as no progress.
    pub async fn sync_progress(
        &self,
        runner: &RunnerHandle,
        content_id: &str,
        chapters: &[Chapter],
        trackers: &[TrackerLink],
    ) -> Result<SyncOutcome> {
        let tracked = join_all(trackers.iter().map(|link| async move {
            let read = match link.tracker.get_track_item(&link.entry_id).await {
                Ok(item) => item.last_read_chapter(),
                Err(e) => {
                    warn!(tracker = %link.tracker.id(), "Failed to read track item: {}", e);
                    0.0
                }
            };
            (link, read)
        }))
        .await;

        let mut runner_read = 0.0;
        if runner.supports(Capability::ChapterSync) {
            match runner.get_read_chapter_markers(content_id).await {
                Ok(ids) => {
                    runner_read = chapters
                        .iter()
                        .filter(|c| ids.contains(&c.chapter_id))
                        .map(|c| c.number)
                        .fold(0.0, f64::max);
                }
                Err(e) => warn!(runner = %runner.id(), "Failed to read chapter markers: {}", e),
            }
        }

        let local_read = self.progress_store.highest_marked_chapter(runner.id(), content_id).await?;
        let tracker_read = tracked.iter().map(|(_, read)| *read).fold(0.0, f64::max);
        let max_read = local_read.max(tracker_read).max(runner_read);

        let mut outcome = SyncOutcome {
            max_read_chapter: max_read,
            ..Default::default()
        };
        if max_read == 0.0 {
            return Ok(outcome);
        }

        let progress = TrackProgressUpdate {
            chapter: max_read,
            volume: None,
        };
        let behind = tracked.into_iter().filter(|(_, read)| *read < max_read);
        let updates = join_all(behind.map(|(link, _)| {
            let progress = &progress;
            async move {
                match link.tracker.did_update_last_read_chapter(&link.entry_id, progress).await {
                    Ok(()) => Some(link.tracker.id().to_string()),
                    Err(e) => {
                        warn!(tracker = %link.tracker.id(), "Failed to update tracker: {}", e);
                        None
                    }
                }
            }
        }))
        .await;
        outcome.updated_trackers = updates.into_iter().flatten().collect();

        if max_read != local_read {
            let numbers: Vec<f64> = chapters
                .iter()
                .map(|c| c.number)
                .filter(|n| *n <= max_read)
                .collect();
            self.progress_store.mark_chapters(runner.id(), content_id, &numbers).await?;
            outcome.marked_locally = numbers;
        }

        info!(
            runner = %runner.id(),
            content_id = %content_id,
            max_read = max_read,
            trackers = outcome.updated_trackers.len(),
            "Progress synced"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::runner::tests::{profile, ScriptedFactory};
    use crate::plugin::testing::{Scripted, ScriptedContext};
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct MemoryContentStore {
        entries: Mutex<HashMap<(String, String), StoredContent>>,
    }

    #[async_trait]
    impl ContentStore for MemoryContentStore {
        async fn store_content(&self, runner_id: &str, content_id: &str, content: &Content) -> Result<()> {
            let mut entries = self.entries.lock().await;
            let key = (runner_id.to_string(), content_id.to_string());
            let chapters = entries.get(&key).map(|s| s.chapters.clone()).unwrap_or_default();
            entries.insert(
                key,
                StoredContent {
                    runner_id: runner_id.to_string(),
                    content_id: content_id.to_string(),
                    content: content.clone(),
                    chapters,
                    updated_at: Utc::now(),
                },
            );
            Ok(())
        }

        async fn store_chapters(&self, runner_id: &str, content_id: &str, chapters: &[Chapter]) -> Result<()> {
            let mut entries = self.entries.lock().await;
            match entries.get_mut(&(runner_id.to_string(), content_id.to_string())) {
                Some(stored) => {
                    stored.chapters = chapters.to_vec();
                    stored.updated_at = Utc::now();
                    Ok(())
                }
                None => Err(BridgeError::Store(format!("{} is not stored", content_id))),
            }
        }

        async fn get_stored_content(&self, runner_id: &str, content_id: &str) -> Result<Option<StoredContent>> {
            Ok(self
                .entries
                .lock()
                .await
                .get(&(runner_id.to_string(), content_id.to_string()))
                .cloned())
        }
    }

    #[derive(Default)]
    struct MemoryProgressStore {
        marked: Mutex<Vec<f64>>,
    }

    #[async_trait]
    impl ProgressStore for MemoryProgressStore {
        async fn highest_marked_chapter(&self, _runner_id: &str, _content_id: &str) -> Result<f64> {
            Ok(self.marked.lock().await.iter().copied().fold(0.0, f64::max))
        }

        async fn mark_chapters(&self, _runner_id: &str, _content_id: &str, numbers: &[f64]) -> Result<()> {
            let mut marked = self.marked.lock().await;
            for n in numbers {
                if !marked.contains(n) {
                    marked.push(*n);
                }
            }
            Ok(())
        }
    }

    struct FixedTracker {
        id: String,
        read: Option<f64>,
        updates: Mutex<Vec<(String, f64)>>,
    }

    impl FixedTracker {
        fn new(id: &str, read: Option<f64>) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                read,
                updates: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl TrackerClient for FixedTracker {
        fn id(&self) -> &str {
            &self.id
        }

        async fn get_track_item(&self, id: &str) -> Result<TrackItem> {
            let read = self.read.ok_or_else(|| BridgeError::Network("tracker offline".into()))?;
            Ok(serde_json::from_value(json!({
                "id": id,
                "title": "Tracked",
                "entry": { "progress": { "lastReadChapter": read } }
            }))
            .unwrap())
        }

        async fn did_update_last_read_chapter(&self, id: &str, progress: &TrackProgressUpdate) -> Result<()> {
            self.updates.lock().await.push((id.to_string(), progress.chapter));
            Ok(())
        }
    }

    fn chapters() -> Vec<Chapter> {
        (1..=5)
            .map(|n| {
                serde_json::from_value(json!({
                    "chapterId": format!("ch-{n}"),
                    "number": n as f64,
                    "language": "en",
                    "index": 5 - n,
                }))
                .unwrap()
            })
            .collect()
    }

    async fn runner(intents: Value, build: impl Fn() -> ScriptedContext + Send + Sync + 'static) -> RunnerHandle {
        let factory = Arc::new(ScriptedFactory::new(move || profile(intents.clone()), build));
        RunnerHandle::open(Box::new(factory), None).await.unwrap()
    }

    fn service() -> (ContentService, Arc<MemoryContentStore>, Arc<MemoryProgressStore>) {
        let content = Arc::new(MemoryContentStore::default());
        let progress = Arc::new(MemoryProgressStore::default());
        (ContentService::new(content.clone(), progress.clone()), content, progress)
    }

    #[tokio::test]
    async fn test_load_content_stores_and_falls_back() {
        let (service, store, _) = service();
        let online = runner(json!({}), || {
            ScriptedContext::direct().method(
                "getContent",
                Scripted::Returns(json!({
                    "title": "Title",
                    "cover": "https://covers/1.png",
                    "chapters": [{ "chapterId": "ch-1", "number": 1, "language": "en", "index": 0 }]
                })),
            )
        })
        .await;

        let content = service.load_content(&online, "c-1").await.unwrap();
        assert_eq!(content.title, "Title");
        let stored = store.get_stored_content("runner.scripted", "c-1").await.unwrap().unwrap();
        assert_eq!(stored.chapters.len(), 1);

        let offline = runner(json!({}), || {
            ScriptedContext::direct()
                .method("getContent", Scripted::throws("NetworkError", "offline"))
                .method("getChapters", Scripted::throws("NetworkError", "offline"))
        })
        .await;
        assert_eq!(service.load_content(&offline, "c-1").await.unwrap().title, "Title");
        assert_eq!(service.load_chapters(&offline, "c-1").await.unwrap()[0].chapter_id, "ch-1");

        let err = service.load_content(&offline, "c-2").await.unwrap_err();
        assert!(matches!(err, BridgeError::PluginThrown { .. }));
    }

    #[tokio::test]
    async fn test_mark_chapter_read_notifies_listening_runner() {
        let (service, _, progress) = service();
        let handle = Arc::new(
            runner(json!({ "chapterEventHandler": true }), || {
                ScriptedContext::direct().method("onChapterRead", Scripted::ReturnsNull)
            })
            .await,
        );

        service.mark_chapter_read(&handle, "c-1", &chapters()[2]).await.unwrap();
        assert_eq!(*progress.marked.lock().await, vec![3.0]);
    }

    #[tokio::test]
    async fn test_sync_takes_highest_progress() {
        let (service, _, progress) = service();
        progress.mark_chapters("runner.scripted", "c-1", &[1.0]).await.unwrap();

        let handle = runner(json!({ "chapterSyncHandler": true }), || {
            ScriptedContext::direct().method("getReadChapterMarkers", Scripted::Returns(json!(["ch-1", "ch-2"])))
        })
        .await;

        let ahead = FixedTracker::new("tracker.ahead", Some(4.0));
        let behind = FixedTracker::new("tracker.behind", Some(2.0));
        let offline = FixedTracker::new("tracker.offline", None);
        let links = vec![
            TrackerLink { tracker: ahead.clone(), entry_id: "a-1".into() },
            TrackerLink { tracker: behind.clone(), entry_id: "b-1".into() },
            TrackerLink { tracker: offline.clone(), entry_id: "o-1".into() },
        ];

        let outcome = service.sync_progress(&handle, "c-1", &chapters(), &links).await.unwrap();
        assert_eq!(outcome.max_read_chapter, 4.0);
        let mut updated = outcome.updated_trackers.clone();
        updated.sort();
        assert_eq!(updated, vec!["tracker.behind", "tracker.offline"]);
        assert_eq!(outcome.marked_locally, vec![1.0, 2.0, 3.0, 4.0]);

        assert!(ahead.updates.lock().await.is_empty());
        assert_eq!(*behind.updates.lock().await, vec![("b-1".to_string(), 4.0)]);
        assert_eq!(progress.highest_marked_chapter("runner.scripted", "c-1").await.unwrap(), 4.0);
    }

    #[tokio::test]
    async fn test_sync_without_progress_does_nothing() {
        let (service, _, progress) = service();
        let handle = runner(json!({}), ScriptedContext::direct).await;
        let tracker = FixedTracker::new("tracker.empty", Some(0.0));
        let links = vec![TrackerLink { tracker: tracker.clone(), entry_id: "e-1".into() }];

        let outcome = service.sync_progress(&handle, "c-1", &chapters(), &links).await.unwrap();
        assert_eq!(outcome, SyncOutcome::default());
        assert!(tracker.updates.lock().await.is_empty());
        assert!(progress.marked.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_runner_tracker_requires_intent() {
        let plain = Arc::new(runner(json!({}), ScriptedContext::direct).await);
        assert!(matches!(RunnerTracker::new(plain), Err(BridgeError::CapabilityDisabled { .. })));

        let tracking = Arc::new(
            runner(json!({ "advancedTracker": true }), || {
                ScriptedContext::direct()
                    .method("getTrackItem", Scripted::Returns(json!({ "id": "t-1", "title": "T" })))
                    .method("didUpdateLastReadChapter", Scripted::ReturnsNull)
            })
            .await,
        );
        let tracker = RunnerTracker::new(tracking).unwrap();
        assert_eq!(tracker.id(), "runner.scripted");
        assert_eq!(tracker.get_track_item("t-1").await.unwrap().last_read_chapter(), 0.0);
        tracker
            .did_update_last_read_chapter("t-1", &TrackProgressUpdate { chapter: 2.0, volume: None })
            .await
            .unwrap();
    }
}
