//! Stream controller: the lifecycle of one live-stream connection per run.
//!
//! Each time the host bumps its [`RunTrigger`] the controller tears down
//! whatever the previous run left behind, resets the view, waits for the
//! settle delay, opens the stream and folds every message into the
//! snapshot. A terminal event closes the stream, fires the completion
//! callback once and starts the auto-hide timer.
//!
//! All of that runs inside a single spawned task per run. The task is owned
//! by an [`ActiveRun`] guard, so superseding a run or dropping the
//! controller aborts the settle timer, the connection and the auto-hide
//! timer together. Writes to the shared view are tagged with the run's
//! trigger, so a task that is being torn down can never touch a newer run's
//! snapshot. The completion callback fires under the controller's run lock,
//! so once `set_trigger` or drop returns, a superseded run can no longer
//! fire it.
//!
//! ```rust,no_run
//! use std::sync::{Arc, Mutex, PoisonError};
//! use qa_live_monitor::{HttpConnector, RunTrigger, StreamController};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let connector = Arc::new(HttpConnector::new("http://localhost:8000")?);
//! let mut controller = StreamController::builder("test-42", connector)
//!     .on_complete(|| println!("run finished"))
//!     .build();
//!
//! controller.set_trigger(RunTrigger::new(1));
//! let mut view = controller.subscribe();
//! while view.changed().await.is_ok() {
//!     println!("phase: {}", view.borrow().snapshot.phase);
//! }
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::diagnostics::Diagnostic;
use crate::reducer::RunSnapshot;
use crate::transport::{MessageStream, StreamConnector};
use crate::view::MonitorView;

/// Wait before opening the stream, so the backend has created the run.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(1);
/// Wait after a terminal event before the monitor hides itself.
pub const DEFAULT_AUTO_HIDE: Duration = Duration::from_secs(8);

const DIAGNOSTIC_CAPACITY: usize = 64;

/// Caller-owned run counter. Only a change in value starts a new run;
/// zero means no run was ever requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize)]
pub struct RunTrigger(u64);

impl RunTrigger {
    pub const NONE: Self = Self(0);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u64 {
        self.0
    }

    /// Whether any run has been requested.
    pub const fn is_set(self) -> bool {
        self.0 != 0
    }

    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Display for RunTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Timer settings for a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorTiming {
    pub settle_delay: Duration,
    pub auto_hide: Duration,
}

impl Default for MonitorTiming {
    fn default() -> Self {
        Self {
            settle_delay: DEFAULT_SETTLE_DELAY,
            auto_hide: DEFAULT_AUTO_HIDE,
        }
    }
}

type CompletionCallback = Arc<dyn Fn() + Send + Sync>;

/// Owns the live stream of one test's runs.
pub struct StreamController {
    test_id: Arc<str>,
    connector: Arc<dyn StreamConnector>,
    timing: MonitorTiming,
    on_complete: Option<CompletionCallback>,
    view: Arc<watch::Sender<MonitorView>>,
    diagnostics: broadcast::Sender<Diagnostic>,
    /// Trigger of the run allowed to complete. `NONE` once torn down.
    live: Arc<Mutex<RunTrigger>>,
    last_trigger: RunTrigger,
    active: Option<ActiveRun>,
}

impl fmt::Debug for StreamController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamController")
            .field("test_id", &self.test_id)
            .field("timing", &self.timing)
            .field("last_trigger", &self.last_trigger)
            .field("active", &self.active.is_some())
            .finish()
    }
}

impl StreamController {
    /// Start building a controller for `test_id`.
    pub fn builder(
        test_id: impl Into<String>,
        connector: Arc<dyn StreamConnector>,
    ) -> StreamControllerBuilder {
        StreamControllerBuilder {
            test_id: test_id.into(),
            connector,
            timing: MonitorTiming::default(),
            initial_trigger: RunTrigger::NONE,
            on_complete: None,
        }
    }

    pub fn test_id(&self) -> &str {
        &self.test_id
    }

    /// Observe a trigger value from the host.
    ///
    /// Does nothing unless `trigger` is set and differs from the last value
    /// observed. Otherwise the previous run is torn down and a new one is
    /// scheduled. Must be called from within a Tokio runtime.
    pub fn set_trigger(&mut self, trigger: RunTrigger) {
        if !trigger.is_set() || trigger == self.last_trigger {
            return;
        }
        self.last_trigger = trigger;
        *lock_live(&self.live) = trigger;

        if self.active.take().is_some() {
            tracing::debug!(test_id = %self.test_id, %trigger, "Superseded previous run");
        }
        self.view.send_replace(MonitorView {
            trigger,
            snapshot: RunSnapshot::default(),
            visible: true,
        });

        let auto_hide = CancellationToken::new();
        let run = RunTask {
            test_id: Arc::clone(&self.test_id),
            trigger,
            connector: Arc::clone(&self.connector),
            timing: self.timing,
            on_complete: self.on_complete.clone(),
            view: Arc::clone(&self.view),
            diagnostics: self.diagnostics.clone(),
            live: Arc::clone(&self.live),
        };
        let task = tokio::spawn(run.drive(auto_hide.clone()));
        self.active = Some(ActiveRun { task, auto_hide });
    }

    /// Hide the monitor now and cancel any auto-hide for the current run.
    /// The snapshot is left as it is and the stream keeps being folded.
    pub fn dismiss(&self) {
        if let Some(active) = &self.active {
            active.auto_hide.cancel();
        }
        self.view
            .send_if_modified(|view| std::mem::replace(&mut view.visible, false));
    }

    /// Current view.
    pub fn view(&self) -> MonitorView {
        self.view.borrow().clone()
    }

    /// Watch the view for changes.
    pub fn subscribe(&self) -> watch::Receiver<MonitorView> {
        self.view.subscribe()
    }

    /// Diagnostics for every failure the controller absorbed.
    pub fn diagnostics(&self) -> broadcast::Receiver<Diagnostic> {
        self.diagnostics.subscribe()
    }
}

impl Drop for StreamController {
    fn drop(&mut self) {
        *lock_live(&self.live) = RunTrigger::NONE;
        if self.active.take().is_some() {
            tracing::debug!(test_id = %self.test_id, "Monitor torn down");
        }
    }
}

/// Builder for a [`StreamController`].
pub struct StreamControllerBuilder {
    test_id: String,
    connector: Arc<dyn StreamConnector>,
    timing: MonitorTiming,
    initial_trigger: RunTrigger,
    on_complete: Option<CompletionCallback>,
}

impl fmt::Debug for StreamControllerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamControllerBuilder")
            .field("test_id", &self.test_id)
            .field("timing", &self.timing)
            .field("initial_trigger", &self.initial_trigger)
            .finish()
    }
}

impl StreamControllerBuilder {
    #[must_use]
    pub fn timing(mut self, timing: MonitorTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Trigger value the host holds when the monitor is created. It is
    /// treated as already seen, so it does not start a run by itself.
    #[must_use]
    pub fn initial_trigger(mut self, trigger: RunTrigger) -> Self {
        self.initial_trigger = trigger;
        self
    }

    /// Called once per run when it reaches a terminal phase.
    ///
    /// The callback runs while the controller's run lock is held, so it
    /// must not block on a call to `set_trigger` or on dropping the
    /// controller.
    #[must_use]
    pub fn on_complete(mut self, callback: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_complete = Some(Arc::new(callback));
        self
    }

    pub fn build(self) -> StreamController {
        let (view, _) = watch::channel(MonitorView::default());
        let (diagnostics, _) = broadcast::channel(DIAGNOSTIC_CAPACITY);
        StreamController {
            test_id: self.test_id.into(),
            connector: self.connector,
            timing: self.timing,
            on_complete: self.on_complete,
            view: Arc::new(view),
            diagnostics,
            live: Arc::new(Mutex::new(RunTrigger::NONE)),
            last_trigger: self.initial_trigger,
            active: None,
        }
    }
}

/// The spawned task of the current run. Dropping it cancels everything
/// the run scheduled.
#[derive(Debug)]
struct ActiveRun {
    task: JoinHandle<()>,
    auto_hide: CancellationToken,
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        self.auto_hide.cancel();
        self.task.abort();
    }
}

enum Fold {
    Continue,
    Terminal,
    Superseded,
}

struct RunTask {
    test_id: Arc<str>,
    trigger: RunTrigger,
    connector: Arc<dyn StreamConnector>,
    timing: MonitorTiming,
    on_complete: Option<CompletionCallback>,
    view: Arc<watch::Sender<MonitorView>>,
    diagnostics: broadcast::Sender<Diagnostic>,
    live: Arc<Mutex<RunTrigger>>,
}

impl RunTask {
    #[tracing::instrument(
        name = "monitor.run",
        skip(self, auto_hide),
        fields(test_id = %self.test_id, trigger = %self.trigger)
    )]
    async fn drive(self, auto_hide: CancellationToken) {
        tokio::time::sleep(self.timing.settle_delay).await;

        let stream = match self.connector.connect(&self.test_id).await {
            Ok(stream) => stream,
            Err(e) => {
                self.report(Diagnostic::TransportClosed {
                    reason: e.to_string(),
                });
                return;
            }
        };
        tracing::info!("Live stream connected");

        if !self.consume(stream).await {
            return;
        }

        self.complete();

        tokio::select! {
            () = tokio::time::sleep(self.timing.auto_hide) => {
                self.update(|view| view.visible = false);
            }
            () = auto_hide.cancelled() => {}
        }
    }

    /// Fold messages until a terminal event. Returns whether one arrived.
    /// The stream is closed when this returns.
    async fn consume(&self, mut stream: MessageStream) -> bool {
        while let Some(item) = stream.next().await {
            match item {
                Ok(raw) => match self.fold(&raw) {
                    Fold::Continue => {}
                    Fold::Terminal => return true,
                    Fold::Superseded => return false,
                },
                Err(e) => {
                    self.report(Diagnostic::TransportClosed {
                        reason: e.to_string(),
                    });
                    return false;
                }
            }
        }
        self.report(Diagnostic::StreamEnded);
        false
    }

    fn fold(&self, raw: &str) -> Fold {
        let mut outcome = None;
        self.view.send_if_modified(|view| {
            if view.trigger != self.trigger {
                return false;
            }
            let folded = view.snapshot.ingest(raw);
            let modified = folded.is_ok();
            outcome = Some(folded);
            modified
        });

        match outcome {
            None => Fold::Superseded,
            Some(Err(diagnostic)) => {
                self.report(diagnostic);
                Fold::Continue
            }
            Some(Ok(folded)) => {
                if let Some(diagnostic) = folded.diagnostic {
                    self.report(diagnostic);
                }
                if folded.kind.is_terminal() {
                    Fold::Terminal
                } else {
                    Fold::Continue
                }
            }
        }
    }

    fn update(&self, apply: impl FnOnce(&mut MonitorView)) -> bool {
        self.view.send_if_modified(|view| {
            if view.trigger != self.trigger {
                return false;
            }
            apply(view);
            true
        })
    }

    /// Fire the completion callback if this run is still the live one.
    fn complete(&self) {
        let live = lock_live(&self.live);
        if *live != self.trigger {
            return;
        }
        tracing::info!(phase = %self.view.borrow().snapshot.phase, "Run reached a terminal phase");
        if let Some(callback) = &self.on_complete {
            callback();
        }
    }

    fn report(&self, diagnostic: Diagnostic) {
        diagnostic.trace(&self.test_id);
        let _ = self.diagnostics.send(diagnostic);
    }
}

fn lock_live(live: &Mutex<RunTrigger>) -> std::sync::MutexGuard<'_, RunTrigger> {
    live.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::error::{Error, Result};

    #[derive(Debug)]
    struct Offline;

    #[async_trait::async_trait]
    impl StreamConnector for Offline {
        async fn connect(&self, _test_id: &str) -> Result<MessageStream> {
            Err(Error::Config("offline".to_string()))
        }
    }

    fn run_task(
        trigger: RunTrigger,
        live: &Arc<Mutex<RunTrigger>>,
        callback: &CompletionCallback,
    ) -> RunTask {
        let (view, _) = watch::channel(MonitorView::default());
        let (diagnostics, _) = broadcast::channel(1);
        RunTask {
            test_id: "test-1".into(),
            trigger,
            connector: Arc::new(Offline),
            timing: MonitorTiming::default(),
            on_complete: Some(Arc::clone(callback)),
            view: Arc::new(view),
            diagnostics,
            live: Arc::clone(live),
        }
    }

    #[test]
    fn test_only_the_live_run_completes() {
        let fired = Arc::new(AtomicUsize::new(0));
        let callback: CompletionCallback = {
            let fired = Arc::clone(&fired);
            Arc::new(move || {
                fired.fetch_add(1, Ordering::SeqCst);
            })
        };
        let live = Arc::new(Mutex::new(RunTrigger::new(2)));

        run_task(RunTrigger::new(1), &live, &callback).complete();
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        run_task(RunTrigger::new(2), &live, &callback).complete();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        *lock_live(&live) = RunTrigger::NONE;
        run_task(RunTrigger::new(2), &live, &callback).complete();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_run_trigger_next() {
        assert!(!RunTrigger::NONE.is_set());
        assert_eq!(RunTrigger::NONE.next(), RunTrigger::new(1));
        assert_eq!(RunTrigger::new(7).next().value(), 8);
    }
}
