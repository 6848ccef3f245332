//! The single owner of UI-facing state.
//!
//! One task holds every run's [`OutputSink`] and the [`MountRegistry`].
//! Everything else talks to it through a [`CoordinatorHandle`]: process
//! output readers send it lines, the service asks it to reserve and release
//! mounts, and a renderer subscribes to the [`StateEvent`] broadcast.

use crate::mount::{MountPoint, MountRegistry};
use crate::output::{LineKind, OutputLine, OutputSink};
use crate::progress::parse_progress;
use crate::runner::OutputListener;
use crate::{DeckError, Result};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

pub type RunId = Uuid;

const EVENT_CAPACITY: usize = 1024;

/// Finished runs whose output is kept for late readers.
pub const DEFAULT_KEEP_FINISHED: usize = 32;

/// Published after every state change.
#[derive(Debug, Clone, Serialize)]
pub enum StateEvent {
    RunStarted {
        run: RunId,
        label: String,
        display: String,
    },
    Output {
        run: RunId,
        line: OutputLine,
    },
    Progress {
        run: RunId,
        fraction: f64,
    },
    RunFinished {
        run: RunId,
        error: Option<String>,
    },
    Mounted(MountPoint),
    Unmounted(MountPoint),
    MountsRefreshed(Vec<MountPoint>),
}

enum Message {
    Start {
        run: RunId,
        label: String,
        display: String,
        cancel: CancellationToken,
    },
    Cancel {
        run: RunId,
        reply: oneshot::Sender<bool>,
    },
    Line {
        run: RunId,
        text: String,
        kind: LineKind,
    },
    Progress {
        run: RunId,
        fraction: f64,
    },
    Complete {
        run: RunId,
        error: Option<String>,
    },
    Forget {
        run: RunId,
    },
    Sink {
        run: RunId,
        reply: oneshot::Sender<Option<OutputSink>>,
    },
    Mount {
        mount: MountPoint,
        reply: oneshot::Sender<Result<()>>,
    },
    Unmount {
        path: PathBuf,
        reply: oneshot::Sender<Result<MountPoint>>,
    },
    RunExited {
        run: RunId,
    },
    Mounts {
        reply: oneshot::Sender<Vec<MountPoint>>,
    },
    Refresh,
}

pub struct Coordinator {
    sinks: HashMap<RunId, OutputSink>,
    running: HashMap<RunId, CancellationToken>,
    /// Oldest first.
    finished: VecDeque<RunId>,
    keep_finished: usize,
    registry: MountRegistry,
    max_lines: usize,
    events: broadcast::Sender<StateEvent>,
}

impl Coordinator {
    /// Start the coordinator task. It stops once every handle is dropped.
    pub fn spawn(max_lines: usize) -> CoordinatorHandle {
        Self::spawn_with_retention(max_lines, DEFAULT_KEEP_FINISHED)
    }

    /// Like [`Coordinator::spawn`], keeping at most `keep_finished` finished
    /// sinks. Older ones are dropped as new runs finish.
    pub fn spawn_with_retention(max_lines: usize, keep_finished: usize) -> CoordinatorHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let coordinator = Coordinator {
            sinks: HashMap::new(),
            running: HashMap::new(),
            finished: VecDeque::new(),
            keep_finished,
            registry: MountRegistry::new(),
            max_lines,
            events: events.clone(),
        };
        tokio::spawn(coordinator.run(rx));

        CoordinatorHandle { tx, events }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Message>) {
        while let Some(message) = rx.recv().await {
            self.handle(message);
        }
        debug!("Coordinator stopped");
    }

    fn publish(&self, event: StateEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn retire(&mut self, run: RunId) {
        self.finished.push_back(run);
        while self.finished.len() > self.keep_finished {
            if let Some(oldest) = self.finished.pop_front() {
                debug!("Releasing output of run {}", oldest);
                self.sinks.remove(&oldest);
            }
        }
    }

    fn handle(&mut self, message: Message) {
        match message {
            Message::Start {
                run,
                label,
                display,
                cancel,
            } => {
                self.sinks.insert(run, OutputSink::new(self.max_lines));
                self.running.insert(run, cancel);
                self.publish(StateEvent::RunStarted { run, label, display });
            }
            Message::Cancel { run, reply } => {
                let found = match self.running.get(&run) {
                    Some(token) => {
                        token.cancel();
                        true
                    }
                    None => false,
                };
                let _ = reply.send(found);
            }
            Message::Line { run, text, kind } => {
                if let Some(sink) = self.sinks.get_mut(&run) {
                    sink.on_chunk(&text, kind);
                    self.publish(StateEvent::Output {
                        run,
                        line: OutputLine { text, kind },
                    });
                }
            }
            Message::Progress { run, fraction } => {
                if let Some(sink) = self.sinks.get_mut(&run) {
                    sink.on_progress(fraction);
                    if let Some(fraction) = sink.progress() {
                        self.publish(StateEvent::Progress { run, fraction });
                    }
                }
            }
            Message::Complete { run, error } => {
                self.running.remove(&run);
                if let Some(sink) = self.sinks.get_mut(&run) {
                    let first = !sink.is_finished();
                    sink.on_complete(error.clone());
                    self.publish(StateEvent::RunFinished { run, error });
                    if first {
                        self.retire(run);
                    }
                }
            }
            Message::Forget { run } => {
                self.sinks.remove(&run);
                self.finished.retain(|r| *r != run);
            }
            Message::Sink { run, reply } => {
                let _ = reply.send(self.sinks.get(&run).cloned());
            }
            Message::Mount { mount, reply } => {
                let result = self.registry.mount(mount.clone());
                if result.is_ok() {
                    self.publish(StateEvent::Mounted(mount));
                }
                let _ = reply.send(result);
            }
            Message::Unmount { path, reply } => {
                let result = self.registry.unmount(&path);
                if let Ok(ref mount) = result {
                    self.publish(StateEvent::Unmounted(mount.clone()));
                }
                let _ = reply.send(result);
            }
            Message::RunExited { run } => {
                if let Some(mount) = self.registry.remove_run(run) {
                    debug!("Mount at {} ended with its process", mount.path.display());
                    self.publish(StateEvent::Unmounted(mount));
                }
            }
            Message::Mounts { reply } => {
                let _ = reply.send(self.registry.list());
            }
            Message::Refresh => {
                self.publish(StateEvent::MountsRefreshed(self.registry.list()));
            }
        }
    }
}

#[derive(Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::UnboundedSender<Message>,
    events: broadcast::Sender<StateEvent>,
}

impl CoordinatorHandle {
    fn send(&self, message: Message) -> Result<()> {
        self.tx.send(message).map_err(|_| DeckError::CoordinatorStopped)
    }

    async fn request<T>(&self, message: Message, reply: oneshot::Receiver<T>) -> Result<T> {
        self.send(message)?;
        reply.await.map_err(|_| DeckError::CoordinatorStopped)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.events.subscribe()
    }

    /// Create the sink for a new run. The returned token cancels it.
    pub fn start_run(&self, run: RunId, label: &str, display: &str) -> Result<CancellationToken> {
        let cancel = CancellationToken::new();
        self.send(Message::Start {
            run,
            label: label.to_string(),
            display: display.to_string(),
            cancel: cancel.clone(),
        })?;
        Ok(cancel)
    }

    /// Cancel a running command. Returns false if it is not running.
    pub async fn cancel_run(&self, run: RunId) -> Result<bool> {
        let (reply, rx) = oneshot::channel();
        self.request(Message::Cancel { run, reply }, rx).await
    }

    pub fn complete_run(&self, run: RunId, error: Option<String>) -> Result<()> {
        self.send(Message::Complete { run, error })
    }

    /// Drop a run's sink once nobody needs its output any more.
    pub fn forget_run(&self, run: RunId) -> Result<()> {
        self.send(Message::Forget { run })
    }

    /// A copy of the run's current output and progress.
    pub async fn sink(&self, run: RunId) -> Result<Option<OutputSink>> {
        let (reply, rx) = oneshot::channel();
        self.request(Message::Sink { run, reply }, rx).await
    }

    /// Listener that feeds a run's output into its sink.
    pub fn reporter(&self, run: RunId) -> RunReporter {
        RunReporter {
            run,
            tx: self.tx.clone(),
        }
    }

    pub async fn mount(&self, mount: MountPoint) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.request(Message::Mount { mount, reply }, rx).await?
    }

    pub async fn unmount(&self, path: PathBuf) -> Result<MountPoint> {
        let (reply, rx) = oneshot::channel();
        self.request(Message::Unmount { path, reply }, rx).await?
    }

    /// Release whatever mount the run was serving.
    pub fn run_exited(&self, run: RunId) -> Result<()> {
        self.send(Message::RunExited { run })
    }

    pub async fn mounts(&self) -> Result<Vec<MountPoint>> {
        let (reply, rx) = oneshot::channel();
        self.request(Message::Mounts { reply }, rx).await
    }

    /// Publish the mount list every `interval` until the coordinator stops.
    pub fn spawn_mount_refresh(&self, interval: Duration) -> JoinHandle<()> {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if tx.send(Message::Refresh).is_err() {
                    break;
                }
            }
        })
    }
}

/// Forwards one run's output lines to the coordinator, along with any
/// progress they report.
pub struct RunReporter {
    run: RunId,
    tx: mpsc::UnboundedSender<Message>,
}

impl OutputListener for RunReporter {
    fn on_line(&self, line: &str, kind: LineKind) {
        let sent = self.tx.send(Message::Line {
            run: self.run,
            text: line.to_string(),
            kind,
        });
        if sent.is_err() {
            warn!("Dropping output for run {}: coordinator stopped", self.run);
            return;
        }

        if let Some(fraction) = parse_progress(line) {
            let _ = self.tx.send(Message::Progress {
                run: self.run,
                fraction,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[tokio::test]
    async fn test_runs_have_independent_sinks() {
        let handle = Coordinator::spawn(2);
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();
        handle.start_run(first, "backup", "restic backup").unwrap();
        handle.start_run(second, "mount", "restic mount").unwrap();

        let one = handle.reporter(first);
        let two = handle.reporter(second);
        one.on_line("a", LineKind::Normal);
        two.on_line("x", LineKind::Error);
        one.on_line("b", LineKind::Normal);
        one.on_line("c", LineKind::Normal);

        let sink = handle.sink(first).await.unwrap().unwrap();
        let texts: Vec<&str> = sink.lines().map(|l| l.text.as_str()).collect();
        assert_eq!(texts, vec!["b", "c"]);

        let sink = handle.sink(second).await.unwrap().unwrap();
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.lines().next().unwrap().kind, LineKind::Error);
    }

    #[tokio::test]
    async fn test_progress_lines_update_sink() {
        let handle = Coordinator::spawn(100);
        let run = Uuid::new_v4();
        handle.start_run(run, "backup", "restic backup").unwrap();

        let reporter = handle.reporter(run);
        reporter.on_line(r#"{"message_type":"status","percent_done":0.4}"#, LineKind::Normal);
        let sink = handle.sink(run).await.unwrap().unwrap();
        assert_eq!(sink.progress(), Some(0.4));

        handle.complete_run(run, Some("boom".to_string())).unwrap();
        let sink = handle.sink(run).await.unwrap().unwrap();
        assert!(sink.is_finished());
        assert_eq!(sink.progress(), Some(0.4));
        assert_eq!(sink.error(), Some("boom"));

        handle.forget_run(run).unwrap();
        assert!(handle.sink(run).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_finished_sinks_are_released() {
        let handle = Coordinator::spawn_with_retention(100, 2);
        let runs: Vec<RunId> = (0..3).map(|_| Uuid::new_v4()).collect();
        let running = Uuid::new_v4();
        handle.start_run(running, "mount", "restic mount").unwrap();

        for run in &runs {
            handle.start_run(*run, "check", "restic check").unwrap();
            handle.complete_run(*run, None).unwrap();
        }

        assert!(handle.sink(runs[0]).await.unwrap().is_none());
        assert!(handle.sink(runs[1]).await.unwrap().is_some());
        assert!(handle.sink(runs[2]).await.unwrap().is_some());
        // unfinished runs are never released
        assert!(handle.sink(running).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cancel_run() {
        let handle = Coordinator::spawn(100);
        let run = Uuid::new_v4();
        let token = handle.start_run(run, "mount", "restic mount").unwrap();

        assert!(handle.cancel_run(run).await.unwrap());
        assert!(token.is_cancelled());

        handle.complete_run(run, Some("Cancelled".to_string())).unwrap();
        assert!(!handle.cancel_run(run).await.unwrap());
        assert!(!handle.cancel_run(Uuid::new_v4()).await.unwrap());
    }

    #[tokio::test]
    async fn test_events_are_published() {
        let handle = Coordinator::spawn(100);
        let mut events = handle.subscribe();
        let run = Uuid::new_v4();

        handle.start_run(run, "version", "restic version").unwrap();
        handle.reporter(run).on_line("restic 0.16.4", LineKind::Normal);
        handle.complete_run(run, None).unwrap();

        assert!(matches!(events.recv().await.unwrap(), StateEvent::RunStarted { .. }));
        match events.recv().await.unwrap() {
            StateEvent::Output { line, .. } => assert_eq!(line.text, "restic 0.16.4"),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(matches!(
            events.recv().await.unwrap(),
            StateEvent::RunFinished { error: None, .. }
        ));
    }

    #[tokio::test]
    async fn test_mount_lifecycle() {
        let handle = Coordinator::spawn(100);
        let run = Uuid::new_v4();
        let mount = MountPoint::new("/mnt/a", "/repo", None, run);

        handle.mount(mount.clone()).await.unwrap();
        let conflict = handle
            .mount(MountPoint::new("/mnt/a", "/other", None, Uuid::new_v4()))
            .await;
        assert!(matches!(conflict, Err(DeckError::MountConflict(_))));

        let mounts = handle.mounts().await.unwrap();
        assert_eq!(mounts, vec![mount.clone()]);

        handle.run_exited(run).unwrap();
        assert!(handle.mounts().await.unwrap().is_empty());
        assert!(matches!(
            handle.unmount(Path::new("/mnt/a").to_path_buf()).await,
            Err(DeckError::NotMounted(_))
        ));
    }

    #[tokio::test]
    async fn test_refresh_publishes_mount_list() {
        let handle = Coordinator::spawn(100);
        let mut events = handle.subscribe();
        handle
            .mount(MountPoint::new("/mnt/a", "/repo", None, Uuid::new_v4()))
            .await
            .unwrap();

        let refresher = handle.spawn_mount_refresh(Duration::from_millis(20));

        assert!(matches!(events.recv().await.unwrap(), StateEvent::Mounted(_)));
        match events.recv().await.unwrap() {
            StateEvent::MountsRefreshed(mounts) => assert_eq!(mounts.len(), 1),
            other => panic!("unexpected event {:?}", other),
        }
        refresher.abort();
    }
}
