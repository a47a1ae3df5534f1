//! The synchronizer owns the client's view of the server and is its only writer.
//!
//! Snapshots replace state wholesale; push events patch it in arrival order.
//! Slow work (uploads, deletes) runs on spawned tasks whose effects come back
//! as server events, so applying an event never waits on the network.

use std::{path::PathBuf, sync::Arc};

use lanshare_core::{Change, ClientViewState, ConnectionState, MessageKey, SyncEvent};
use tokio::{
    sync::mpsc,
    task::{AbortHandle, JoinSet},
    time::{Instant, MissedTickBehavior, interval_at},
};
use tracing::{debug, info, warn};

use crate::{
    api::FileService,
    config::ClientConfig,
    notify::{Confirm, Notice, Notifier},
    transport::TransportHandle,
    upload::upload_batch,
};

/// User intents fed into [`Synchronizer::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Refresh,
    Upload(Vec<PathBuf>),
    Delete(String),
    ClearAllFiles,
    SendMessage(String),
    ClearMessages,
    ShowFiles,
}

pub struct Synchronizer<S, N> {
    service: Arc<S>,
    notifier: Arc<N>,
    confirm: Arc<dyn Confirm>,
    transport: TransportHandle,
    config: ClientConfig,
    state: ClientViewState,
    tasks: JoinSet<()>,
    clear_all: Option<AbortHandle>,
}

impl<S, N> Synchronizer<S, N>
where
    S: FileService,
    N: Notifier,
{
    pub fn new(
        service: Arc<S>,
        notifier: Arc<N>,
        confirm: Arc<dyn Confirm>,
        transport: TransportHandle,
        config: ClientConfig,
    ) -> Self {
        Self {
            service,
            notifier,
            confirm,
            transport,
            config,
            state: ClientViewState::new(),
            tasks: JoinSet::new(),
            clear_all: None,
        }
    }

    pub fn state(&self) -> &ClientViewState {
        &self.state
    }

    /// Fetches files and messages concurrently and replaces whatever loaded.
    pub async fn load_snapshot(&mut self) {
        let (files, messages) = tokio::join!(
            self.service.fetch_files(),
            self.service.fetch_messages()
        );

        match files {
            Ok(files) => {
                debug!(count = files.len(), "file snapshot applied");
                self.state.load_files(files);
            }
            Err(err) => {
                warn!("file snapshot failed: {err}");
                self.notifier.notify(Notice::LoadFilesFailed {
                    reason: err.to_string(),
                });
            }
        }

        match messages {
            Ok(messages) => {
                debug!(count = messages.len(), "message snapshot applied");
                self.state.load_messages(messages);
            }
            Err(err) => {
                warn!("message snapshot failed: {err}");
                self.notifier.notify(Notice::LoadMessagesFailed {
                    reason: err.to_string(),
                });
            }
        }
    }

    /// Periodic self-heal. A failure waits for the next tick.
    pub async fn refresh_files(&mut self) {
        match self.service.fetch_files().await {
            Ok(files) => {
                self.state.load_files(files);
                self.publish_stats();
            }
            Err(err) => {
                warn!("periodic file refresh failed: {err}");
                self.notifier.notify(Notice::LoadFilesFailed {
                    reason: err.to_string(),
                });
            }
        }
    }

    pub fn publish_stats(&self) {
        self.notifier.notify(Notice::Stats(self.state.stats()));
    }

    pub async fn handle_event(&mut self, event: SyncEvent) -> Change {
        let change = self.state.apply(event);
        match &change {
            Change::FileAdded(record) => self.notifier.notify(Notice::NewFile {
                original_name: record.original_name.clone(),
            }),
            Change::FileRemoved(record) => self.notifier.notify(Notice::FileDeleted {
                filename: record.filename.clone(),
            }),
            Change::MessageAppended(message) => {
                self.notifier.notify(Notice::NewMessage(message.clone()))
            }
            Change::MessagesCleared => self.notifier.notify(Notice::MessagesCleared),
            Change::Connection(ConnectionState::Connected) => {
                self.notifier.notify(Notice::Connected);
                // Events missed while offline are not replayed; the snapshot covers them.
                self.load_snapshot().await;
            }
            Change::Connection(ConnectionState::Disconnected) => {
                self.notifier.notify(Notice::Disconnected);
            }
            Change::Connection(ConnectionState::Connecting) | Change::Unchanged => {}
        }
        change
    }

    pub async fn handle_action(&mut self, action: Action) {
        match action {
            Action::Refresh => {
                self.load_snapshot().await;
                self.publish_stats();
            }
            Action::Upload(paths) => self.spawn_uploads(paths),
            Action::Delete(filename) => {
                self.delete_with_confirmation(filename);
            }
            Action::ClearAllFiles => {
                self.clear_all_with_confirmation();
            }
            Action::SendMessage(text) => {
                if let Err(err) = self.transport.send_message(&text) {
                    warn!("send message failed: {err}");
                    self.notifier.notify(Notice::Error(err.to_string()));
                }
            }
            Action::ClearMessages => {
                if let Err(err) = self.transport.clear_messages() {
                    warn!("clear messages failed: {err}");
                    self.notifier.notify(Notice::Error(err.to_string()));
                }
            }
            Action::ShowFiles => self.notifier.notify(Notice::Listing {
                files: self.state.files().cloned().collect(),
                stats: self.state.stats(),
            }),
        }
    }

    fn spawn_uploads(&mut self, paths: Vec<PathBuf>) {
        if paths.is_empty() {
            return;
        }
        let service = Arc::clone(&self.service);
        let notifier = Arc::clone(&self.notifier);
        let delay = self.config.upload_delay;
        self.tasks.spawn(async move {
            upload_batch(service.as_ref(), &paths, delay, &notifier).await;
        });
    }

    /// Returns whether the delete was issued.
    pub fn delete_with_confirmation(&mut self, filename: String) -> bool {
        let original_name = self
            .state
            .file(&filename)
            .map(|record| record.original_name.clone());
        if !self.confirm.confirm(MessageKey::ConfirmDeleteFile) {
            debug!(%filename, ?original_name, "delete declined");
            return false;
        }
        debug!(%filename, ?original_name, "deleting file");
        let service = Arc::clone(&self.service);
        let notifier = Arc::clone(&self.notifier);
        self.tasks.spawn(async move {
            delete_one(service.as_ref(), &filename, notifier.as_ref()).await;
        });
        true
    }

    /// Confirms once, then deletes every known file one at a time.
    /// Ignored while a previous clear-all is still running.
    pub fn clear_all_with_confirmation(&mut self) -> bool {
        if self
            .clear_all
            .as_ref()
            .is_some_and(|running| !running.is_finished())
        {
            debug!("clear all already in progress");
            return false;
        }
        let filenames = self.state.filenames();
        if filenames.is_empty() {
            self.notifier.notify(Notice::Listing {
                files: Vec::new(),
                stats: self.state.stats(),
            });
            return false;
        }
        if !self.confirm.confirm(MessageKey::ConfirmDeleteAll) {
            debug!(count = filenames.len(), "clear all declined");
            return false;
        }
        let service = Arc::clone(&self.service);
        let notifier = Arc::clone(&self.notifier);
        let handle = self.tasks.spawn(async move {
            delete_all_sequential(service.as_ref(), filenames, notifier.as_ref()).await;
        });
        self.clear_all = Some(handle);
        true
    }

    /// Waits for every spawned upload and delete to finish.
    pub async fn wait_idle(&mut self) {
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(err) = joined {
                warn!("background task failed: {err}");
            }
        }
    }

    /// Drives the synchronizer until `actions` closes, then drains background work.
    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<SyncEvent>,
        mut actions: mpsc::UnboundedReceiver<Action>,
    ) -> ClientViewState {
        self.load_snapshot().await;
        self.publish_stats();

        let refresh_every = self.config.refresh_interval;
        let stats_every = self.config.stats_interval;
        let mut refresh_tick = interval_at(Instant::now() + refresh_every, refresh_every);
        refresh_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut stats_tick = interval_at(Instant::now() + stats_every, stats_every);
        stats_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut events_open = true;
        loop {
            tokio::select! {
                event = events.recv(), if events_open => match event {
                    Some(event) => {
                        self.handle_event(event).await;
                    }
                    None => {
                        debug!("event stream closed");
                        events_open = false;
                    }
                },
                action = actions.recv() => match action {
                    Some(action) => self.handle_action(action).await,
                    None => break,
                },
                _ = refresh_tick.tick() => self.refresh_files().await,
                _ = stats_tick.tick() => self.publish_stats(),
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => {
                    if let Err(err) = joined {
                        warn!("background task failed: {err}");
                    }
                }
            }
        }

        self.wait_idle().await;
        info!("synchronizer stopped");
        self.state
    }
}

async fn delete_one<S, N>(service: &S, filename: &str, notifier: &N) -> bool
where
    S: FileService,
    N: Notifier,
{
    match service.delete_file(filename).await {
        Ok(()) => {
            info!(filename, "file deleted");
            notifier.notify(Notice::FileDeletedSuccess {
                filename: filename.to_owned(),
            });
            true
        }
        Err(err) => {
            warn!(filename, "delete failed: {err}");
            notifier.notify(Notice::DeleteFailed {
                filename: filename.to_owned(),
                reason: err.to_string(),
            });
            false
        }
    }
}

/// Each delete completes before the next is issued; failures are reported per file.
/// Returns how many files were removed.
pub async fn delete_all_sequential<S, N>(service: &S, filenames: Vec<String>, notifier: &N) -> usize
where
    S: FileService,
    N: Notifier,
{
    let mut deleted = 0;
    for filename in &filenames {
        if delete_one(service, filename, notifier).await {
            deleted += 1;
        }
    }
    info!(deleted, requested = filenames.len(), "clear all finished");
    deleted
}

#[cfg(test)]
mod tests {
    use std::{
        path::Path,
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
        time::Duration,
    };

    use chrono::{TimeZone, Utc};
    use lanshare_core::{ClientCommand, FileRecord, Message};

    use super::*;
    use crate::{
        error::{ClientError, UploadError},
        notify::{AssumeAnswer, RecordingNotifier},
        upload::ProgressFn,
    };

    fn record(filename: &str, size: u64) -> FileRecord {
        FileRecord {
            filename: filename.to_owned(),
            original_name: filename.to_uppercase(),
            size,
            uploaded_at: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            url: None,
        }
    }

    fn message(text: &str) -> Message {
        Message {
            id: None,
            text: text.to_owned(),
            timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            sender: None,
        }
    }

    #[derive(Default)]
    struct FakeService {
        files: Mutex<Vec<FileRecord>>,
        messages: Mutex<Vec<Message>>,
        file_fetches: AtomicUsize,
        deleted: Mutex<Vec<String>>,
        uploads: Mutex<Vec<PathBuf>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl FakeService {
        fn with_files(files: Vec<FileRecord>) -> Self {
            Self {
                files: Mutex::new(files),
                ..Self::default()
            }
        }
    }

    impl FileService for FakeService {
        async fn fetch_files(&self) -> Result<Vec<FileRecord>, ClientError> {
            self.file_fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self.files.lock().unwrap().clone())
        }

        async fn fetch_messages(&self) -> Result<Vec<Message>, ClientError> {
            Ok(self.messages.lock().unwrap().clone())
        }

        async fn delete_file(&self, filename: &str) -> Result<(), ClientError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::task::yield_now().await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if filename.starts_with("missing") {
                return Err(ClientError::delete(filename, "File not found"));
            }
            self.deleted.lock().unwrap().push(filename.to_owned());
            Ok(())
        }

        async fn upload_file(
            &self,
            path: &Path,
            progress: ProgressFn,
        ) -> Result<FileRecord, ClientError> {
            self.uploads.lock().unwrap().push(path.to_path_buf());
            let name = path.file_name().unwrap().to_string_lossy().into_owned();
            if name.starts_with("bad") {
                return Err(UploadError::Status {
                    status: 500,
                    message: "disk full".to_owned(),
                }
                .into());
            }
            progress(50);
            progress(100);
            Ok(record(&name, 10))
        }
    }

    struct Harness {
        sync: Synchronizer<FakeService, RecordingNotifier>,
        service: Arc<FakeService>,
        notifier: Arc<RecordingNotifier>,
        commands: mpsc::UnboundedReceiver<ClientCommand>,
    }

    fn harness(service: FakeService, answer: bool) -> Harness {
        let service = Arc::new(service);
        let notifier = Arc::new(RecordingNotifier::default());
        let (transport, commands) = TransportHandle::detached();
        let config = ClientConfig::new("http://127.0.0.1:5000").unwrap();
        let sync = Synchronizer::new(
            Arc::clone(&service),
            Arc::clone(&notifier),
            Arc::new(AssumeAnswer(answer)),
            transport,
            config,
        );
        Harness {
            sync,
            service,
            notifier,
            commands,
        }
    }

    #[tokio::test]
    async fn snapshot_then_delete_event_empties_the_view() {
        let mut h = harness(FakeService::with_files(vec![record("a.txt", 1024)]), true);
        h.sync.load_snapshot().await;
        assert_eq!(h.sync.state().stats().total_bytes, 1024);

        let change = h
            .sync
            .handle_event(SyncEvent::FileDeleted {
                filename: "a.txt".to_owned(),
            })
            .await;
        assert!(matches!(change, Change::FileRemoved(_)));
        assert_eq!(h.sync.state().stats().count, 0);
        assert_eq!(h.sync.state().stats().total_bytes, 0);
    }

    #[tokio::test]
    async fn uploaded_events_update_stats_and_notify() {
        let mut h = harness(FakeService::default(), true);
        h.sync
            .handle_event(SyncEvent::FileUploaded(record("x.png", 2048)))
            .await;
        h.sync
            .handle_event(SyncEvent::FileUploaded(record("y.png", 4096)))
            .await;
        let duplicate = h
            .sync
            .handle_event(SyncEvent::FileUploaded(record("y.png", 4096)))
            .await;

        assert_eq!(duplicate, Change::Unchanged);
        let stats = h.sync.state().stats();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.total_bytes, 6144);
        assert_eq!(stats.formatted_total(), "6 KB");

        let new_files = h
            .notifier
            .notices()
            .into_iter()
            .filter(|n| matches!(n, Notice::NewFile { .. }))
            .count();
        assert_eq!(new_files, 2);
    }

    #[tokio::test]
    async fn reconnect_refetches_and_disconnect_keeps_state() {
        let mut h = harness(FakeService::with_files(vec![record("a.txt", 1)]), true);
        h.service.messages.lock().unwrap().push(message("hello"));

        h.sync
            .handle_event(SyncEvent::ConnectionStateChanged(ConnectionState::Connecting))
            .await;
        h.sync
            .handle_event(SyncEvent::ConnectionStateChanged(ConnectionState::Connected))
            .await;
        assert_eq!(h.service.file_fetches.load(Ordering::SeqCst), 1);
        assert_eq!(h.sync.state().filenames(), vec!["a.txt".to_owned()]);
        assert_eq!(h.sync.state().messages().len(), 1);

        h.sync
            .handle_event(SyncEvent::ConnectionStateChanged(
                ConnectionState::Disconnected,
            ))
            .await;
        assert_eq!(h.sync.state().connection(), ConnectionState::Disconnected);
        assert_eq!(h.sync.state().filenames(), vec!["a.txt".to_owned()]);
        assert_eq!(h.sync.state().messages().len(), 1);

        assert_eq!(
            h.notifier.notices(),
            vec![Notice::Connected, Notice::Disconnected]
        );
    }

    #[tokio::test]
    async fn messages_cleared_empties_log() {
        let mut h = harness(FakeService::default(), true);
        for text in ["one", "two", "three"] {
            h.sync.handle_event(SyncEvent::NewMessage(message(text))).await;
        }
        h.sync.handle_event(SyncEvent::MessagesCleared).await;
        assert!(h.sync.state().messages().is_empty());
    }

    #[tokio::test]
    async fn declined_delete_issues_nothing() {
        let mut h = harness(FakeService::with_files(vec![record("a.txt", 1)]), false);
        h.sync.load_snapshot().await;
        h.sync.handle_action(Action::Delete("a.txt".to_owned())).await;
        h.sync.handle_action(Action::ClearAllFiles).await;
        h.sync.wait_idle().await;

        assert!(h.service.deleted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn clear_all_deletes_one_at_a_time_and_reports_each() {
        let files = vec![
            record("a.txt", 1),
            record("missing.txt", 1),
            record("b.txt", 1),
        ];
        let mut h = harness(FakeService::with_files(files), true);
        h.sync.load_snapshot().await;
        h.sync.handle_action(Action::ClearAllFiles).await;
        h.sync.wait_idle().await;

        assert_eq!(h.service.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(h.service.deleted.lock().unwrap().len(), 2);
        let notices = h.notifier.notices();
        assert_eq!(
            notices
                .iter()
                .filter(|n| matches!(n, Notice::FileDeletedSuccess { .. }))
                .count(),
            2
        );
        assert!(notices.iter().any(
            |n| matches!(n, Notice::DeleteFailed { filename, .. } if filename == "missing.txt")
        ));
    }

    #[tokio::test]
    async fn clear_all_is_ignored_while_one_is_running() {
        let files = vec![record("a.txt", 1), record("b.txt", 1), record("c.txt", 1)];
        let mut h = harness(FakeService::with_files(files), true);
        h.sync.load_snapshot().await;

        assert!(h.sync.clear_all_with_confirmation());
        assert!(!h.sync.clear_all_with_confirmation());
        h.sync.handle_action(Action::ClearAllFiles).await;
        h.sync.wait_idle().await;

        let mut deleted = h.service.deleted.lock().unwrap().clone();
        deleted.sort();
        assert_eq!(deleted, ["a.txt", "b.txt", "c.txt"]);
        assert_eq!(h.service.max_in_flight.load(Ordering::SeqCst), 1);
        assert!(
            !h.notifier
                .notices()
                .iter()
                .any(|n| matches!(n, Notice::DeleteFailed { .. }))
        );

        // finished runs no longer block a new one
        assert!(h.sync.clear_all_with_confirmation());
        h.sync.wait_idle().await;
    }

    #[tokio::test]
    async fn whitespace_message_sends_no_command() {
        let mut h = harness(FakeService::default(), true);
        h.sync.handle_action(Action::SendMessage("  ".to_owned())).await;
        assert!(h.commands.try_recv().is_err());

        h.sync.handle_action(Action::ClearMessages).await;
        assert_eq!(h.commands.try_recv().unwrap(), ClientCommand::ClearMessages);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_upload_does_not_stop_the_batch() {
        let mut h = harness(FakeService::default(), true);
        let paths = vec![
            PathBuf::from("/tmp/one.txt"),
            PathBuf::from("/tmp/bad.txt"),
            PathBuf::from("/tmp/three.txt"),
        ];
        let started = Instant::now();
        h.sync.handle_action(Action::Upload(paths.clone())).await;
        h.sync.wait_idle().await;

        assert_eq!(*h.service.uploads.lock().unwrap(), paths);
        assert!(started.elapsed() >= Duration::from_millis(1000));

        let notices = h.notifier.notices();
        let completed: Vec<_> = notices
            .iter()
            .filter_map(|n| match n {
                Notice::UploadComplete { name } => Some(name.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(completed, vec!["one.txt", "three.txt"]);
        assert!(notices.iter().any(
            |n| matches!(n, Notice::UploadFailed { name, reason } if name == "bad.txt" && reason.contains("disk full"))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_refresh_heals_missed_events() {
        let h = harness(FakeService::default(), true);
        let service = Arc::clone(&h.service);
        let notifier = Arc::clone(&h.notifier);
        let (_events_tx, events_rx) = mpsc::unbounded_channel();
        let (actions_tx, actions_rx) = mpsc::unbounded_channel();
        let runner = tokio::spawn(h.sync.run(events_rx, actions_rx));

        tokio::time::sleep(Duration::from_secs(1)).await;
        service.files.lock().unwrap().push(record("late.txt", 7));
        tokio::time::sleep(Duration::from_secs(60)).await;

        drop(actions_tx);
        let state = runner.await.unwrap();
        assert_eq!(state.filenames(), vec!["late.txt".to_owned()]);
        assert_eq!(service.file_fetches.load(Ordering::SeqCst), 2);

        let stats_notices = notifier
            .notices()
            .into_iter()
            .filter(|n| matches!(n, Notice::Stats(_)))
            .count();
        assert!(stats_notices >= 3, "got {stats_notices} stats notices");
    }
}
