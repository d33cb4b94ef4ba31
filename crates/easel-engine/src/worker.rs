use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use anyhow::{bail, Context, Result};
use serde_json::{json, Map, Value};

use easel_contracts::credentials::{credential_fingerprint, CredentialStore};
use easel_contracts::events::EventLog;
use easel_contracts::items::{ItemStatus, QueueState};
use easel_contracts::session::SessionStore;

use crate::{AdapterRegistry, ImageBytes};

/// Why a start request was refused. Start preconditions never mutate queue
/// state; the caller turns these into a user-facing hint, not an error
/// trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartBlocked {
    NotLoggedIn,
    UnknownProvider(String),
    NoPrompts,
    MissingCredential(String),
}

impl fmt::Display for StartBlocked {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartBlocked::NotLoggedIn => write!(f, "not logged in"),
            StartBlocked::UnknownProvider(name) => write!(f, "unsupported provider '{name}'"),
            StartBlocked::NoPrompts => write!(f, "no prompts queued"),
            StartBlocked::MissingCredential(provider) => {
                write!(f, "no credential stored for '{provider}'")
            }
        }
    }
}

impl std::error::Error for StartBlocked {}

#[derive(Debug)]
struct WorkerState {
    queue: QueueState,
    // Bumped on every clear/rebuild so a completion captured against an
    // older batch is dropped instead of written into the new one.
    epoch: u64,
    // Indices with a dispatch in flight; a retry of a busy index is
    // rejected so two dispatches never write the same record.
    busy: HashSet<usize>,
}

struct WorkerShared {
    state: Mutex<WorkerState>,
    resumed: Condvar,
    registry: AdapterRegistry,
    credentials: Mutex<CredentialStore>,
    session: Mutex<SessionStore>,
    events: EventLog,
    size: String,
}

#[derive(Debug, Clone)]
struct CapturedDispatch {
    epoch: u64,
    index: usize,
    prompt: String,
    name: String,
    provider: String,
    retry: bool,
}

/// Sequential generation queue: walks the prompt list in order, one request
/// in flight at a time, recording per-item outcomes. Cloneable handle; the
/// CLI runs `run_loop` on a worker thread and drives pause/resume/stop from
/// the control thread.
#[derive(Clone)]
pub struct QueueWorker {
    shared: Arc<WorkerShared>,
}

impl QueueWorker {
    pub fn new(
        registry: AdapterRegistry,
        credentials: CredentialStore,
        session: SessionStore,
        events: EventLog,
        provider: &str,
        size: &str,
    ) -> Self {
        Self {
            shared: Arc::new(WorkerShared {
                state: Mutex::new(WorkerState {
                    queue: QueueState::new(provider),
                    epoch: 0,
                    busy: HashSet::new(),
                }),
                resumed: Condvar::new(),
                registry,
                credentials: Mutex::new(credentials),
                session: Mutex::new(session),
                events,
                size: size.to_string(),
            }),
        }
    }

    pub fn events(&self) -> EventLog {
        self.shared.events.clone()
    }

    pub fn snapshot(&self) -> Result<QueueState> {
        Ok(self.lock_state()?.queue.clone())
    }

    /// Rebuilds the batch from prompt text. Returns false (and leaves the
    /// batch untouched) while a run is in progress.
    pub fn set_prompts(&self, text: &str) -> Result<bool> {
        let count = {
            let mut state = self.lock_state()?;
            if !state.queue.rebuild(text) {
                return Ok(false);
            }
            state.epoch += 1;
            state.queue.items.len()
        };
        self.shared
            .events
            .emit("batch_built", payload(json!({ "items": count })))?;
        Ok(true)
    }

    pub fn set_provider(&self, provider: &str) -> Result<bool> {
        let mut state = self.lock_state()?;
        if state.queue.running {
            return Ok(false);
        }
        state.queue.active_provider = provider.to_string();
        Ok(true)
    }

    /// Idle -> Running. Every precondition is checked before any state
    /// changes; a violation reports why and mutates nothing.
    pub fn start(&self) -> Result<Result<(), StartBlocked>> {
        let logged_in = self
            .shared
            .session
            .lock()
            .map_err(|_| anyhow::anyhow!("session lock poisoned"))?
            .is_logged_in();
        if !logged_in {
            return Ok(Err(StartBlocked::NotLoggedIn));
        }

        let provider = self.lock_state()?.queue.active_provider.clone();
        let Some(adapter) = self.shared.registry.get(&provider) else {
            return Ok(Err(StartBlocked::UnknownProvider(provider)));
        };

        if self.lock_state()?.queue.items.is_empty() {
            return Ok(Err(StartBlocked::NoPrompts));
        }

        let credential = if adapter.requires_credential() {
            let found = self
                .shared
                .credentials
                .lock()
                .map_err(|_| anyhow::anyhow!("credential store lock poisoned"))?
                .get(&provider);
            match found {
                Some(value) => Some(value),
                None => return Ok(Err(StartBlocked::MissingCredential(provider))),
            }
        } else {
            None
        };

        let items = {
            let mut state = self.lock_state()?;
            if state.queue.items.is_empty() {
                return Ok(Err(StartBlocked::NoPrompts));
            }
            if state.queue.running {
                return Ok(Ok(()));
            }
            state.queue.running = true;
            state.queue.paused = false;
            state.queue.items.len()
        };

        let mut started = Map::new();
        started.insert("provider".to_string(), Value::String(provider));
        started.insert("items".to_string(), json!(items));
        if let Some(credential) = credential {
            started.insert(
                "credential_fingerprint".to_string(),
                Value::String(credential_fingerprint(&credential)),
            );
        }
        self.shared.events.emit("run_started", started)?;
        self.shared.resumed.notify_all();
        Ok(Ok(()))
    }

    pub fn pause(&self) -> Result<()> {
        let paused = {
            let mut state = self.lock_state()?;
            if state.queue.running && !state.queue.paused {
                state.queue.paused = true;
                true
            } else {
                false
            }
        };
        if paused {
            self.shared.events.emit("run_paused", Map::new())?;
        }
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        let resumed = {
            let mut state = self.lock_state()?;
            if state.queue.running && state.queue.paused {
                state.queue.paused = false;
                true
            } else {
                false
            }
        };
        if resumed {
            self.shared.events.emit("run_resumed", Map::new())?;
            self.shared.resumed.notify_all();
        }
        Ok(())
    }

    /// Running|Paused -> Idle. Items and cursor survive so partial results
    /// stay visible; the in-flight dispatch (if any) still lands.
    pub fn stop(&self) -> Result<()> {
        let cursor = {
            let mut state = self.lock_state()?;
            if !state.queue.running {
                return Ok(());
            }
            state.queue.stop();
            state.queue.cursor
        };
        self.shared
            .events
            .emit("run_stopped", payload(json!({ "cursor": cursor })))?;
        self.shared.resumed.notify_all();
        Ok(())
    }

    /// The only full reset: empties the batch and invalidates any in-flight
    /// completion.
    pub fn clear(&self) -> Result<()> {
        {
            let mut state = self.lock_state()?;
            state.epoch += 1;
            state.queue.clear();
        }
        self.shared.events.emit("batch_cleared", Map::new())?;
        self.shared.resumed.notify_all();
        Ok(())
    }

    /// Drives dispatches sequentially until the batch completes or the run
    /// is stopped. Parks while paused. Call `start` first; without it the
    /// loop returns immediately.
    pub fn run_loop(&self) -> Result<()> {
        loop {
            let captured = {
                let mut state = self.lock_state()?;
                while state.queue.running && state.queue.paused {
                    state = self
                        .shared
                        .resumed
                        .wait(state)
                        .map_err(|_| anyhow::anyhow!("queue state lock poisoned"))?;
                }
                if !state.queue.running {
                    return Ok(());
                }
                if state.queue.is_exhausted() {
                    state.queue.running = false;
                    let summary = json!({
                        "items": state.queue.items.len(),
                        "ok": state.queue.completed_count(),
                        "failed": state.queue.failed_count(),
                    });
                    drop(state);
                    self.shared.events.emit("run_completed", payload(summary))?;
                    return Ok(());
                }

                let index = state.queue.cursor;
                state.busy.insert(index);
                CapturedDispatch {
                    epoch: state.epoch,
                    index,
                    prompt: state.queue.items[index].prompt.clone(),
                    name: state.queue.items[index].name.clone(),
                    provider: state.queue.active_provider.clone(),
                    retry: false,
                }
            };
            self.dispatch(captured)?;
        }
    }

    /// Re-attempts one failed item with the currently active provider,
    /// independent of the main cursor. Valid only for a `fail` record that
    /// is not currently being dispatched.
    pub fn retry(&self, index: usize) -> Result<()> {
        let captured = {
            let mut state = self.lock_state()?;
            let Some(item) = state.queue.items.get(index) else {
                bail!("no item at index {index}");
            };
            if item.status != ItemStatus::Fail {
                bail!("item {index} is not in a failed state");
            }
            if state.busy.contains(&index) {
                bail!("item {index} already has a dispatch in flight");
            }
            state.busy.insert(index);
            state.queue.items[index].reset_pending();
            CapturedDispatch {
                epoch: state.epoch,
                index,
                prompt: state.queue.items[index].prompt.clone(),
                name: state.queue.items[index].name.clone(),
                provider: state.queue.active_provider.clone(),
                retry: true,
            }
        };
        self.shared
            .events
            .emit("item_retry", payload(json!({ "index": index })))?;
        self.dispatch(captured)
    }

    /// One unit of work: invoke the adapter without holding the state lock,
    /// then apply the outcome to the captured index. The outcome still
    /// lands after a pause or stop; it is dropped only when the batch it
    /// belongs to was cleared or rebuilt in the meantime.
    fn dispatch(&self, captured: CapturedDispatch) -> Result<()> {
        self.shared.events.emit(
            "item_started",
            payload(json!({
                "index": captured.index,
                "prompt": captured.prompt,
                "name": captured.name,
            })),
        )?;

        let outcome = self.invoke_adapter(&captured);
        self.apply_outcome(&captured, outcome)
    }

    fn invoke_adapter(&self, captured: &CapturedDispatch) -> Result<ImageBytes> {
        let Some(adapter) = self.shared.registry.get(&captured.provider) else {
            bail!("unsupported provider '{}'", captured.provider);
        };
        let credential = if adapter.requires_credential() {
            self.shared
                .credentials
                .lock()
                .map_err(|_| anyhow::anyhow!("credential store lock poisoned"))?
                .get(&captured.provider)
                .unwrap_or_default()
        } else {
            String::new()
        };
        adapter
            .generate(&captured.prompt, &credential, &self.shared.size)
            .with_context(|| format!("provider '{}'", captured.provider))
    }

    fn apply_outcome(&self, captured: &CapturedDispatch, outcome: Result<ImageBytes>) -> Result<()> {
        let event = {
            let mut state = self.lock_state()?;
            state.busy.remove(&captured.index);
            if state.epoch != captured.epoch {
                // The batch this dispatch belonged to is gone.
                drop(state);
                self.shared.events.emit(
                    "item_dropped",
                    payload(json!({ "index": captured.index, "name": captured.name })),
                )?;
                return Ok(());
            }

            let Some(item) = state.queue.items.get_mut(captured.index) else {
                return Ok(());
            };
            let event = match outcome {
                Ok(image) => {
                    let size = image.bytes.len();
                    item.mark_ok(image.bytes);
                    ("item_completed", json!({
                        "index": captured.index,
                        "name": captured.name,
                        "bytes": size,
                        "retry": captured.retry,
                    }))
                }
                Err(err) => {
                    let message = format!("{err:#}");
                    item.mark_fail(message.clone());
                    ("item_failed", json!({
                        "index": captured.index,
                        "name": captured.name,
                        "error": message,
                        "retry": captured.retry,
                    }))
                }
            };
            if !captured.retry {
                state.queue.cursor = captured.index + 1;
            }
            event
        };
        self.shared.events.emit(event.0, payload(event.1))?;
        Ok(())
    }

    fn lock_state(&self) -> Result<MutexGuard<'_, WorkerState>> {
        self.shared
            .state
            .lock()
            .map_err(|_| anyhow::anyhow!("queue state lock poisoned"))
    }
}

fn payload(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::mpsc::{channel, Receiver, Sender};
    use std::sync::Mutex;
    use std::thread;
    use std::time::{Duration, Instant};

    use serde_json::Value;

    use super::*;
    use crate::{DryrunAdapter, ImageAdapter};

    struct Fixture {
        _temp: tempfile::TempDir,
        worker: QueueWorker,
        events_path: std::path::PathBuf,
    }

    fn fixture(registry: AdapterRegistry, provider: &str) -> Fixture {
        let temp = tempfile::tempdir().expect("tempdir");
        let events_path = temp.path().join("events.jsonl");
        let mut session = SessionStore::load(temp.path().join("session.json"));
        session.login("user@example.com").expect("login");
        let credentials = CredentialStore::new(temp.path().join("credentials.json"));
        let events = EventLog::new(&events_path, "batch-test");
        let worker = QueueWorker::new(registry, credentials, session, events, provider, "64x64");
        Fixture {
            _temp: temp,
            worker,
            events_path,
        }
    }

    fn dryrun_registry() -> AdapterRegistry {
        let mut registry = AdapterRegistry::new();
        registry.register(DryrunAdapter);
        registry
    }

    fn event_types(path: &std::path::Path) -> Vec<String> {
        std::fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter_map(|row| row.get("type").and_then(Value::as_str).map(str::to_string))
            .collect()
    }

    /// Fails every prompt containing "bad" until its second attempt.
    struct FlakyAdapter {
        attempts: Mutex<HashMap<String, u32>>,
    }

    impl FlakyAdapter {
        fn new() -> Self {
            Self {
                attempts: Mutex::new(HashMap::new()),
            }
        }
    }

    impl ImageAdapter for FlakyAdapter {
        fn name(&self) -> &str {
            "flaky"
        }

        fn requires_credential(&self) -> bool {
            false
        }

        fn generate(&self, prompt: &str, _credential: &str, _size: &str) -> Result<ImageBytes> {
            let mut attempts = self.attempts.lock().expect("attempts lock");
            let count = attempts.entry(prompt.to_string()).or_insert(0);
            *count += 1;
            if prompt.contains("bad") && *count < 2 {
                bail!("simulated provider outage");
            }
            Ok(ImageBytes {
                bytes: prompt.as_bytes().to_vec(),
                mime_type: Some("image/png".to_string()),
            })
        }
    }

    /// Blocks inside generate until the test releases it, reporting each
    /// dispatched prompt on a channel.
    struct GatedAdapter {
        started: Sender<String>,
        release: Mutex<Receiver<()>>,
    }

    impl ImageAdapter for GatedAdapter {
        fn name(&self) -> &str {
            "gated"
        }

        fn requires_credential(&self) -> bool {
            false
        }

        fn generate(&self, prompt: &str, _credential: &str, _size: &str) -> Result<ImageBytes> {
            self.started.send(prompt.to_string()).ok();
            self.release
                .lock()
                .expect("release lock")
                .recv()
                .map_err(|_| anyhow::anyhow!("gate closed"))?;
            Ok(ImageBytes {
                bytes: prompt.as_bytes().to_vec(),
                mime_type: None,
            })
        }
    }

    fn wait_until(worker: &QueueWorker, predicate: impl Fn(&QueueState) -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let snapshot = worker.snapshot().expect("snapshot");
            if predicate(&snapshot) {
                return;
            }
            assert!(Instant::now() < deadline, "timed out waiting on queue state");
            thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn full_run_visits_every_item_in_order() -> Result<()> {
        let mut registry = AdapterRegistry::new();
        registry.register(FlakyAdapter::new());
        let fx = fixture(registry, "flaky");

        assert!(fx.worker.set_prompts("good fox\nbad whale\ngood bird\n")?);
        fx.worker.start()?.expect("start");
        fx.worker.run_loop()?;

        let state = fx.worker.snapshot()?;
        assert_eq!(state.cursor, 3);
        assert!(!state.running);
        assert_eq!(state.items[0].status, ItemStatus::Ok);
        assert_eq!(state.items[1].status, ItemStatus::Fail);
        assert_eq!(state.items[2].status, ItemStatus::Ok);
        assert!(state.items[1]
            .error
            .as_deref()
            .unwrap_or_default()
            .contains("simulated provider outage"));
        assert_eq!(state.pending_count(), 0);
        Ok(())
    }

    #[test]
    fn run_emits_events_in_dispatch_order() -> Result<()> {
        let fx = fixture(dryrun_registry(), "dryrun");
        fx.worker.set_prompts("fox\nwhale\n")?;
        fx.worker.start()?.expect("start");
        fx.worker.run_loop()?;

        let types = event_types(&fx.events_path);
        let expected = [
            "batch_built",
            "run_started",
            "item_started",
            "item_completed",
            "item_started",
            "item_completed",
            "run_completed",
        ];
        assert_eq!(types, expected);

        // The shared log handle points at the same file the run wrote.
        assert_eq!(fx.worker.events().path(), fx.events_path.as_path());
        assert_eq!(fx.worker.events().batch_id(), "batch-test");
        Ok(())
    }

    #[test]
    fn provider_changes_apply_between_runs_only() -> Result<()> {
        let (started_tx, started_rx) = channel();
        let (release_tx, release_rx) = channel();
        let mut registry = AdapterRegistry::new();
        registry.register(DryrunAdapter);
        registry.register(GatedAdapter {
            started: started_tx,
            release: Mutex::new(release_rx),
        });
        let fx = fixture(registry, "dryrun");

        assert!(fx.worker.set_provider("gated")?);
        assert_eq!(fx.worker.snapshot()?.active_provider, "gated");

        fx.worker.set_prompts("fox\n")?;
        fx.worker.start()?.expect("start");
        let runner = fx.worker.clone();
        let handle = thread::spawn(move || runner.run_loop());

        started_rx.recv_timeout(Duration::from_secs(5))?;
        assert!(!fx.worker.set_provider("dryrun")?, "changed provider mid-run");
        release_tx.send(()).expect("release");
        handle.join().expect("runner thread")?;

        let state = fx.worker.snapshot()?;
        assert_eq!(state.active_provider, "gated");
        assert_eq!(state.items[0].status, ItemStatus::Ok);
        Ok(())
    }

    #[test]
    fn retry_recovers_single_item_without_touching_others() -> Result<()> {
        let mut registry = AdapterRegistry::new();
        registry.register(FlakyAdapter::new());
        let fx = fixture(registry, "flaky");

        fx.worker.set_prompts("good fox\nbad whale\ngood bird\n")?;
        fx.worker.start()?.expect("start");
        fx.worker.run_loop()?;

        let before = fx.worker.snapshot()?;
        assert_eq!(before.items[1].status, ItemStatus::Fail);

        fx.worker.retry(1)?;

        let after = fx.worker.snapshot()?;
        assert_eq!(after.items[1].status, ItemStatus::Ok);
        assert_eq!(after.items[1].name, before.items[1].name);
        assert_eq!(after.items[0], before.items[0]);
        assert_eq!(after.items[2], before.items[2]);
        assert_eq!(after.cursor, before.cursor);
        Ok(())
    }

    #[test]
    fn retry_rejects_non_failed_items() -> Result<()> {
        let fx = fixture(dryrun_registry(), "dryrun");
        fx.worker.set_prompts("fox\n")?;
        assert!(fx.worker.retry(0).is_err());
        assert!(fx.worker.retry(7).is_err());

        fx.worker.start()?.expect("start");
        fx.worker.run_loop()?;
        assert!(fx.worker.retry(0).is_err());
        Ok(())
    }

    #[test]
    fn start_preconditions_block_without_mutation() -> Result<()> {
        // Unknown provider
        let fx = fixture(dryrun_registry(), "midjourney");
        fx.worker.set_prompts("fox\n")?;
        assert_eq!(
            fx.worker.start()?,
            Err(StartBlocked::UnknownProvider("midjourney".to_string()))
        );
        let state = fx.worker.snapshot()?;
        assert!(!state.running);
        assert_eq!(state.cursor, 0);
        assert!(state.items.iter().all(|item| item.status == ItemStatus::Pending));

        // Empty batch
        let fx = fixture(dryrun_registry(), "dryrun");
        assert_eq!(fx.worker.start()?, Err(StartBlocked::NoPrompts));

        // Credential required but absent
        let mut registry = AdapterRegistry::new();
        registry.register(crate::OpenAiAdapter::new());
        let fx = fixture(registry, "openai");
        fx.worker.set_prompts("fox\n")?;
        assert_eq!(
            fx.worker.start()?,
            Err(StartBlocked::MissingCredential("openai".to_string()))
        );
        Ok(())
    }

    #[test]
    fn empty_batch_reports_no_prompts_before_missing_credential() -> Result<()> {
        let mut registry = AdapterRegistry::new();
        registry.register(crate::OpenAiAdapter::new());
        let fx = fixture(registry, "openai");
        assert_eq!(fx.worker.start()?, Err(StartBlocked::NoPrompts));
        Ok(())
    }

    #[test]
    fn start_requires_login() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let session = SessionStore::load(temp.path().join("session.json"));
        let credentials = CredentialStore::new(temp.path().join("credentials.json"));
        let events = EventLog::new(temp.path().join("events.jsonl"), "batch-test");
        let worker = QueueWorker::new(
            dryrun_registry(),
            credentials,
            session,
            events,
            "dryrun",
            "64x64",
        );
        worker.set_prompts("fox\n")?;
        assert_eq!(worker.start()?, Err(StartBlocked::NotLoggedIn));
        Ok(())
    }

    #[test]
    fn pause_applies_in_flight_response_then_parks() -> Result<()> {
        let (started_tx, started_rx) = channel();
        let (release_tx, release_rx) = channel();
        let mut registry = AdapterRegistry::new();
        registry.register(GatedAdapter {
            started: started_tx,
            release: Mutex::new(release_rx),
        });
        let fx = fixture(registry, "gated");
        fx.worker.set_prompts("fox\nwhale\n")?;
        fx.worker.start()?.expect("start");

        let runner = fx.worker.clone();
        let handle = thread::spawn(move || runner.run_loop());

        // First dispatch is in flight; pause before releasing it.
        let first = started_rx.recv_timeout(Duration::from_secs(5))?;
        assert_eq!(first, "fox");
        fx.worker.pause()?;
        release_tx.send(()).expect("release first");

        // The captured response lands on item 0 exactly once, and item 1 is
        // not dispatched while paused.
        wait_until(&fx.worker, |state| state.cursor == 1);
        let state = fx.worker.snapshot()?;
        assert_eq!(state.items[0].status, ItemStatus::Ok);
        assert_eq!(state.items[1].status, ItemStatus::Pending);
        assert!(state.paused);
        thread::sleep(Duration::from_millis(100));
        assert!(started_rx.try_recv().is_err(), "dispatched while paused");

        fx.worker.resume()?;
        let second = started_rx.recv_timeout(Duration::from_secs(5))?;
        assert_eq!(second, "whale");
        release_tx.send(()).expect("release second");

        handle.join().expect("runner thread")?;
        let state = fx.worker.snapshot()?;
        assert_eq!(state.cursor, 2);
        assert_eq!(state.completed_count(), 2);
        Ok(())
    }

    #[test]
    fn stop_preserves_results_and_clear_resets() -> Result<()> {
        let (started_tx, started_rx) = channel();
        let (release_tx, release_rx) = channel();
        let mut registry = AdapterRegistry::new();
        registry.register(GatedAdapter {
            started: started_tx,
            release: Mutex::new(release_rx),
        });
        let fx = fixture(registry, "gated");
        fx.worker.set_prompts("fox\nwhale\nbird\n")?;
        fx.worker.start()?.expect("start");

        let runner = fx.worker.clone();
        let handle = thread::spawn(move || runner.run_loop());

        started_rx.recv_timeout(Duration::from_secs(5))?;
        fx.worker.stop()?;
        release_tx.send(()).expect("release");
        handle.join().expect("runner thread")?;

        // Stop keeps the applied result and the cursor.
        let state = fx.worker.snapshot()?;
        assert!(!state.running);
        assert_eq!(state.cursor, 1);
        assert_eq!(state.items.len(), 3);
        assert_eq!(state.items[0].status, ItemStatus::Ok);

        fx.worker.clear()?;
        let state = fx.worker.snapshot()?;
        assert!(state.items.is_empty());
        assert_eq!(state.cursor, 0);
        Ok(())
    }

    #[test]
    fn late_completion_after_clear_is_dropped() -> Result<()> {
        let (started_tx, started_rx) = channel();
        let (release_tx, release_rx) = channel();
        let mut registry = AdapterRegistry::new();
        registry.register(GatedAdapter {
            started: started_tx,
            release: Mutex::new(release_rx),
        });
        let fx = fixture(registry, "gated");
        fx.worker.set_prompts("fox\n")?;
        fx.worker.start()?.expect("start");

        let runner = fx.worker.clone();
        let handle = thread::spawn(move || runner.run_loop());

        started_rx.recv_timeout(Duration::from_secs(5))?;
        fx.worker.stop()?;
        fx.worker.clear()?;

        // New batch built while the old dispatch is still in flight.
        assert!(fx.worker.set_prompts("whale\n")?);
        release_tx.send(()).expect("release");
        handle.join().expect("runner thread")?;

        let state = fx.worker.snapshot()?;
        assert_eq!(state.items.len(), 1);
        assert_eq!(state.items[0].prompt, "whale");
        assert_eq!(state.items[0].status, ItemStatus::Pending);
        assert_eq!(state.cursor, 0);
        assert!(event_types(&fx.events_path).contains(&"item_dropped".to_string()));
        Ok(())
    }

    #[test]
    fn prompt_edits_are_ignored_while_running() -> Result<()> {
        let (started_tx, started_rx) = channel();
        let (release_tx, release_rx) = channel();
        let mut registry = AdapterRegistry::new();
        registry.register(GatedAdapter {
            started: started_tx,
            release: Mutex::new(release_rx),
        });
        let fx = fixture(registry, "gated");
        fx.worker.set_prompts("fox\n")?;
        fx.worker.start()?.expect("start");

        let runner = fx.worker.clone();
        let handle = thread::spawn(move || runner.run_loop());

        started_rx.recv_timeout(Duration::from_secs(5))?;
        assert!(!fx.worker.set_prompts("whale\n")?);
        release_tx.send(()).expect("release");
        handle.join().expect("runner thread")?;

        let state = fx.worker.snapshot()?;
        assert_eq!(state.items[0].prompt, "fox");
        assert_eq!(state.items[0].status, ItemStatus::Ok);
        Ok(())
    }
}
