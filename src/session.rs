//! Recording session pipeline
//!
//! A session covers one hold of the hotkey: audio chunks arrive while
//! the user speaks, each is transcribed in arrival order by a single
//! drain task, and on release the accumulated chunk texts are joined
//! and delivered to the focused application.
//!
//! Concurrency model: one FIFO chunk queue guarded by a std mutex, one
//! drain task at a time (single-flight flag), and a generation counter
//! bumped on abort so results from a killed backend never surface in a
//! later session. Waiters are woken through a Notify rather than
//! polling.

use crate::engine::{EngineAdapter, TranscriptionResult};
use crate::error::TaptypeError;
use crate::history::{HistoryEntry, HistoryStore};
use crate::output::OutputSink;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

/// How long end_session waits for in-flight chunks before giving up
const DRAIN_TIMEOUT: Duration = Duration::from_secs(60);

/// Events emitted as a session progresses
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// One chunk finished transcribing
    Partial(TranscriptionResult),
    /// The session ended; carries the joined text with chunk_index -1
    Final(TranscriptionResult),
    /// Something went wrong; the session keeps going where possible
    Error(String),
}

/// Builds the engine adapter for each new session, so backend config
/// changes take effect at the next recording
pub type EngineFactory = Box<dyn Fn() -> Arc<dyn EngineAdapter> + Send + Sync>;

/// Summary of a finished session
#[derive(Debug, Clone)]
pub struct CompletedSession {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// Joined chunk texts (may be empty)
    pub text: String,
    pub chunk_count: usize,
    pub duration_ms: u64,
}

struct ActiveSession {
    id: Uuid,
    started_at: DateTime<Utc>,
    engine: Arc<dyn EngineAdapter>,
    /// Per-session chunk directory under the temp root
    dir: PathBuf,
    /// Transcribed chunk texts in arrival order (empty chunks skipped)
    chunk_texts: Vec<String>,
    next_chunk: u32,
    finalizing: bool,
}

#[derive(Default)]
struct Inner {
    session: Option<ActiveSession>,
    queue: VecDeque<PathBuf>,
    /// Single-flight flag for the drain task
    draining: bool,
    /// Bumped on abort; drain results from older generations are dropped
    generation: u64,
}

struct Shared {
    inner: Mutex<Inner>,
    /// Signalled each time the drain task empties the queue
    drained: Notify,
    engine_factory: EngineFactory,
    output: Arc<dyn OutputSink>,
    history: Option<Arc<dyn HistoryStore>>,
    events: mpsc::Sender<SessionEvent>,
    temp_root: PathBuf,
}

/// Owns the lifecycle of recording sessions
pub struct SessionManager {
    shared: Arc<Shared>,
}

impl SessionManager {
    pub fn new(
        engine_factory: EngineFactory,
        output: Arc<dyn OutputSink>,
        history: Option<Arc<dyn HistoryStore>>,
        events: mpsc::Sender<SessionEvent>,
        temp_root: PathBuf,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner::default()),
                drained: Notify::new(),
                engine_factory,
                output,
                history,
                events,
                temp_root,
            }),
        }
    }

    pub fn is_active(&self) -> bool {
        self.shared.lock().session.is_some()
    }

    /// Begin a new session. A start while one is active is ignored and
    /// returns the running session's id.
    pub fn start_session(&self) -> Result<Uuid, TaptypeError> {
        let mut inner = self.shared.lock();

        if let Some(ref session) = inner.session {
            tracing::warn!("Session {} already active, ignoring start", session.id);
            return Ok(session.id);
        }

        let id = Uuid::new_v4();
        let dir = self.shared.temp_root.join(id.to_string());
        std::fs::create_dir_all(&dir)?;

        inner.queue.clear();

        let engine = (self.shared.engine_factory)();
        engine.reset_session();

        tracing::info!("Session {} started ({})", id, engine.label());

        inner.session = Some(ActiveSession {
            id,
            started_at: Utc::now(),
            engine,
            dir,
            chunk_texts: Vec::new(),
            next_chunk: 0,
            finalizing: false,
        });

        Ok(id)
    }

    /// Enqueue one WAV-encoded chunk for transcription. Chunks that
    /// arrive with no active session are dropped.
    pub fn process_audio_chunk(&self, wav: &[u8]) -> Result<(), TaptypeError> {
        let spawn_drain = {
            let mut inner = self.shared.lock();

            let Some(ref mut session) = inner.session else {
                tracing::debug!("Dropping audio chunk, no active session");
                return Ok(());
            };

            let path = session.dir.join(format!("chunk_{:04}.wav", session.next_chunk));
            session.next_chunk += 1;
            // Chunk file writes are transient I/O; drop the chunk and
            // keep the session going
            if let Err(e) = std::fs::write(&path, wav) {
                tracing::warn!("Failed to write chunk file {:?}, dropping chunk: {}", path, e);
                return Ok(());
            }

            inner.queue.push_back(path);
            if inner.draining {
                false
            } else {
                inner.draining = true;
                true
            }
        };

        if spawn_drain {
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                drain_queue(shared).await;
            });
        }

        Ok(())
    }

    /// End the session: wait for queued chunks, join their texts, emit
    /// the final result, and deliver it. Returns the completed session,
    /// or None when no session was active.
    pub async fn end_session(&self) -> Result<Option<CompletedSession>, TaptypeError> {
        {
            let mut inner = self.shared.lock();
            let Some(ref mut session) = inner.session else {
                tracing::debug!("No active session to end");
                return Ok(None);
            };
            if session.finalizing {
                tracing::warn!("Session {} already finalizing", session.id);
                return Ok(None);
            }
            session.finalizing = true;
        }

        if !self.wait_for_drain().await {
            tracing::error!("Transcription queue stuck, finalizing with partial text");
            self.emit(SessionEvent::Error(
                "transcription timed out, result may be incomplete".to_string(),
            ))
            .await;
        }

        let session = {
            let mut inner = self.shared.lock();
            // Suppress any straggling drain results
            inner.generation += 1;
            inner.queue.clear();
            inner.session.take()
        };

        let Some(session) = session else {
            return Ok(None);
        };

        let text = join_chunk_texts(&session.chunk_texts);
        let ended_at = Utc::now();
        let duration_ms = (ended_at - session.started_at).num_milliseconds().max(0) as u64;

        tracing::info!(
            "Session {} finished: {} chunk(s), {} chars, {:.1}s",
            session.id,
            session.chunk_texts.len(),
            text.len(),
            duration_ms as f64 / 1000.0
        );

        self.emit(SessionEvent::Final(TranscriptionResult {
            text: text.clone(),
            partial: false,
            timestamp: Utc::now(),
            chunk_index: -1,
        }))
        .await;

        if let Err(e) = self.shared.output.auto_type(&text).await {
            tracing::error!("Failed to deliver text: {}", e);
            self.emit(SessionEvent::Error(format!("output failed: {}", e)))
                .await;
        }

        if !text.is_empty() {
            if let Some(ref history) = self.shared.history {
                let entry = HistoryEntry::new(
                    session.id,
                    session.started_at,
                    text.clone(),
                    duration_ms,
                    session.engine.label(),
                );
                if let Err(e) = history.add(&entry) {
                    tracing::warn!("Failed to save history entry: {}", e);
                }
            }
        }

        if let Err(e) = std::fs::remove_dir_all(&session.dir) {
            tracing::debug!("Failed to clean session dir {:?}: {}", session.dir, e);
        }

        Ok(Some(CompletedSession {
            id: session.id,
            started_at: session.started_at,
            ended_at,
            text,
            chunk_count: session.chunk_texts.len(),
            duration_ms,
        }))
    }

    /// Abandon the session: kill the in-flight backend, drop queued
    /// chunks, and emit nothing further. Safe to call when idle.
    pub fn abort_session(&self) {
        let session = {
            let mut inner = self.shared.lock();
            inner.generation += 1;
            inner.queue.clear();
            inner.session.take()
        };

        let Some(session) = session else { return };

        tracing::info!("Session {} aborted", session.id);
        session.engine.abort();

        if let Err(e) = std::fs::remove_dir_all(&session.dir) {
            tracing::debug!("Failed to clean session dir {:?}: {}", session.dir, e);
        }
    }

    /// Wait until the queue is drained. Returns false on timeout.
    async fn wait_for_drain(&self) -> bool {
        let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;

        loop {
            let notified = self.shared.drained.notified();
            {
                let inner = self.shared.lock();
                if !inner.draining && inner.queue.is_empty() {
                    return true;
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return false;
            }
        }
    }

    async fn emit(&self, event: SessionEvent) {
        let _ = self.shared.events.send(event).await;
    }
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Drain the chunk queue in FIFO order. Runs until the queue is empty,
/// then clears the single-flight flag and wakes waiters.
async fn drain_queue(shared: Arc<Shared>) {
    loop {
        let (path, engine, generation) = {
            let mut inner = shared.lock();
            match inner.queue.pop_front() {
                Some(path) => {
                    let Some(ref session) = inner.session else {
                        // Session gone, discard the chunk
                        drop(inner);
                        let _ = std::fs::remove_file(&path);
                        continue;
                    };
                    (path, Arc::clone(&session.engine), inner.generation)
                }
                None => {
                    inner.draining = false;
                    drop(inner);
                    shared.drained.notify_waiters();
                    return;
                }
            }
        };

        let result = engine.transcribe(&path).await;
        let _ = std::fs::remove_file(&path);

        let event = {
            let mut inner = shared.lock();
            if inner.generation != generation {
                // Aborted while transcribing; drop the result
                continue;
            }
            match result {
                Ok(partial) => {
                    if let Some(ref mut session) = inner.session {
                        if !partial.text.is_empty() {
                            session.chunk_texts.push(partial.text.clone());
                        }
                    }
                    SessionEvent::Partial(partial)
                }
                Err(e) => {
                    tracing::error!("Chunk transcription failed: {}", e);
                    SessionEvent::Error(e.to_string())
                }
            }
        };

        let _ = shared.events.send(event).await;
    }
}

/// Join chunk texts with single spaces, skipping blanks and collapsing
/// whitespace runs inside each chunk
pub fn join_chunk_texts(chunks: &[String]) -> String {
    chunks
        .iter()
        .flat_map(|s| s.split_whitespace())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{EngineError, HistoryError, OutputError};
    use std::path::Path;
    use std::sync::atomic::{AtomicI64, Ordering};

    /// Engine that echoes each chunk file's content as its text,
    /// optionally sleeping first
    struct EchoEngine {
        delay: Duration,
        chunk_index: AtomicI64,
    }

    impl EchoEngine {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                chunk_index: AtomicI64::new(0),
            }
        }
    }

    #[async_trait::async_trait]
    impl EngineAdapter for EchoEngine {
        async fn transcribe(
            &self,
            audio_path: &Path,
        ) -> Result<TranscriptionResult, EngineError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let text = std::fs::read_to_string(audio_path)
                .map_err(|e| EngineError::Launch(e.to_string()))?;
            Ok(TranscriptionResult {
                text: text.trim().to_string(),
                partial: true,
                timestamp: Utc::now(),
                chunk_index: self.chunk_index.fetch_add(1, Ordering::SeqCst),
            })
        }

        fn abort(&self) {}

        fn reset_session(&self) {
            self.chunk_index.store(0, Ordering::SeqCst);
        }

        fn is_available(&self) -> bool {
            true
        }

        fn is_model_installed(&self) -> bool {
            true
        }

        fn label(&self) -> String {
            "echo".to_string()
        }
    }

    /// Output sink that records what was delivered
    struct RecordingSink {
        delivered: Mutex<Vec<String>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                delivered: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait::async_trait]
    impl OutputSink for RecordingSink {
        async fn auto_type(&self, text: &str) -> Result<(), OutputError> {
            self.delivered.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    /// History store that records entries in memory
    struct RecordingHistory {
        entries: Mutex<Vec<HistoryEntry>>,
    }

    impl HistoryStore for RecordingHistory {
        fn add(&self, entry: &HistoryEntry) -> Result<(), HistoryError> {
            self.entries.lock().unwrap().push(entry.clone());
            Ok(())
        }

        fn recent(&self, _limit: u32) -> Result<Vec<HistoryEntry>, HistoryError> {
            Ok(self.entries.lock().unwrap().clone())
        }
    }

    fn manager_with(
        delay: Duration,
        temp_root: PathBuf,
    ) -> (SessionManager, Arc<RecordingSink>, mpsc::Receiver<SessionEvent>) {
        let sink = RecordingSink::new();
        let (tx, rx) = mpsc::channel(64);
        let manager = SessionManager::new(
            Box::new(move || Arc::new(EchoEngine::new(delay))),
            Arc::clone(&sink) as Arc<dyn OutputSink>,
            None,
            tx,
            temp_root,
        );
        (manager, sink, rx)
    }

    #[tokio::test]
    async fn test_end_to_end_joins_chunks_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, sink, mut rx) =
            manager_with(Duration::from_millis(10), dir.path().to_path_buf());

        manager.start_session().unwrap();
        manager.process_audio_chunk(b"hello").unwrap();
        manager.process_audio_chunk(b"").unwrap();
        manager.process_audio_chunk(b"world").unwrap();

        let done = manager.end_session().await.unwrap().unwrap();
        assert_eq!(done.text, "hello world");
        // Empty chunk contributed nothing to the joined text
        assert_eq!(done.chunk_count, 2);
        assert_eq!(sink.delivered.lock().unwrap().as_slice(), ["hello world"]);

        // Three partials then the final, in arrival order
        let mut partials = Vec::new();
        let mut finals = Vec::new();
        while let Ok(event) = rx.try_recv() {
            match event {
                SessionEvent::Partial(r) => partials.push(r),
                SessionEvent::Final(r) => finals.push(r),
                SessionEvent::Error(e) => panic!("unexpected error event: {}", e),
            }
        }
        assert_eq!(partials.len(), 3);
        assert_eq!(partials[0].text, "hello");
        assert_eq!(partials[1].text, "");
        assert_eq!(partials[2].text, "world");
        assert_eq!(finals.len(), 1);
        assert_eq!(finals[0].text, "hello world");
        assert_eq!(finals[0].chunk_index, -1);
        assert!(!finals[0].partial);
    }

    #[tokio::test]
    async fn test_empty_session_emits_empty_final() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, sink, mut rx) = manager_with(Duration::ZERO, dir.path().to_path_buf());

        manager.start_session().unwrap();
        let done = manager.end_session().await.unwrap().unwrap();
        assert_eq!(done.text, "");
        assert_eq!(done.chunk_count, 0);

        match rx.recv().await.unwrap() {
            SessionEvent::Final(r) => {
                assert_eq!(r.text, "");
                assert_eq!(r.chunk_index, -1);
            }
            other => panic!("expected final event, got {:?}", other),
        }

        // Blank text still goes through the sink, which no-ops on it
        assert_eq!(sink.delivered.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_start_while_active_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _sink, _rx) = manager_with(Duration::ZERO, dir.path().to_path_buf());

        let first = manager.start_session().unwrap();
        let second = manager.start_session().unwrap();
        assert_eq!(first, second);

        manager.process_audio_chunk(b"still works").unwrap();
        let done = manager.end_session().await.unwrap().unwrap();
        assert_eq!(done.text, "still works");
    }

    #[tokio::test]
    async fn test_abort_suppresses_pending_results() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, sink, mut rx) =
            manager_with(Duration::from_millis(100), dir.path().to_path_buf());

        manager.start_session().unwrap();
        manager.process_audio_chunk(b"never seen").unwrap();

        // Abort while the chunk is still transcribing
        tokio::time::sleep(Duration::from_millis(20)).await;
        manager.abort_session();
        assert!(!manager.is_active());

        // Give the drain task time to finish the in-flight transcription
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(rx.try_recv().is_err(), "no events after abort");
        assert!(sink.delivered.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_abort_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _sink, _rx) = manager_with(Duration::ZERO, dir.path().to_path_buf());

        manager.abort_session();
        manager.start_session().unwrap();
        manager.abort_session();
        manager.abort_session();
        assert!(!manager.is_active());
    }

    #[tokio::test]
    async fn test_end_without_session_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _sink, _rx) = manager_with(Duration::ZERO, dir.path().to_path_buf());
        assert!(manager.end_session().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_session_after_abort_starts_clean() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _sink, _rx) =
            manager_with(Duration::from_millis(50), dir.path().to_path_buf());

        manager.start_session().unwrap();
        manager.process_audio_chunk(b"stale").unwrap();
        manager.abort_session();

        manager.start_session().unwrap();
        manager.process_audio_chunk(b"fresh").unwrap();
        let done = manager.end_session().await.unwrap().unwrap();
        assert_eq!(done.text, "fresh");
    }

    #[tokio::test]
    async fn test_history_entry_reuses_session_identity() {
        let dir = tempfile::tempdir().unwrap();
        let sink = RecordingSink::new();
        let history = Arc::new(RecordingHistory {
            entries: Mutex::new(Vec::new()),
        });
        let (tx, _rx) = mpsc::channel(64);
        let manager = SessionManager::new(
            Box::new(|| Arc::new(EchoEngine::new(Duration::ZERO))),
            Arc::clone(&sink) as Arc<dyn OutputSink>,
            Some(Arc::clone(&history) as Arc<dyn HistoryStore>),
            tx,
            dir.path().to_path_buf(),
        );

        let id = manager.start_session().unwrap();
        manager.process_audio_chunk(b"logged").unwrap();
        let done = manager.end_session().await.unwrap().unwrap();

        let entries = history.entries.lock().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, id, "history id must reuse the session id");
        assert_eq!(
            entries[0].timestamp, done.started_at,
            "history timestamp must be the session start"
        );
        assert_eq!(entries[0].text, "logged");
    }

    #[tokio::test]
    async fn test_unwritable_chunk_is_dropped_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _sink, _rx) = manager_with(Duration::ZERO, dir.path().to_path_buf());

        let id = manager.start_session().unwrap();
        // Remove the session directory so the chunk write fails
        std::fs::remove_dir_all(dir.path().join(id.to_string())).unwrap();
        manager.process_audio_chunk(b"lost").unwrap();

        // The session still ends cleanly, without the dropped chunk
        let done = manager.end_session().await.unwrap().unwrap();
        assert_eq!(done.text, "");
        assert_eq!(done.chunk_count, 0);
    }

    #[test]
    fn test_join_chunk_texts() {
        let chunks = vec![
            "hello".to_string(),
            "".to_string(),
            "  world  ".to_string(),
            "   ".to_string(),
        ];
        assert_eq!(join_chunk_texts(&chunks), "hello world");
        assert_eq!(join_chunk_texts(&[]), "");
    }

    #[test]
    fn test_join_chunk_texts_collapses_internal_whitespace() {
        let chunks = vec!["foo  bar".to_string(), "baz\t qux\n".to_string()];
        assert_eq!(join_chunk_texts(&chunks), "foo bar baz qux");
    }
}
