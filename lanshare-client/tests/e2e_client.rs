use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::Bytes;
use lanshare_client::{
    Action, ApiClient, AssumeAnswer, ClientConfig, ClientError, FileService, Notice,
    RecordingNotifier, Synchronizer, UploadError, no_progress, spawn_transport, upload_batch,
};
use lanshare_core::{ConnectionState, SyncEvent};
use lanshare_server::{AppState, ServerConfig, serve_with_shutdown};
use tempfile::TempDir;
use tokio::{net::TcpListener, sync::mpsc, sync::oneshot, time::timeout};

struct TestServer {
    base_url: String,
    state: AppState,
    shutdown_tx: Option<oneshot::Sender<()>>,
    _dir: TempDir,
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn start_server() -> TestServer {
    let dir = tempfile::tempdir().expect("create tempdir");
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral socket");
    let address = listener.local_addr().expect("local addr");

    let mut config = ServerConfig::new(dir.path().join("uploads"));
    config.port = address.port();
    let state = AppState::new(config).await.expect("app state");

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let server_state = state.clone();
    tokio::spawn(async move {
        let _ = serve_with_shutdown(listener, server_state, async {
            let _ = shutdown_rx.await;
        })
        .await;
    });

    TestServer {
        base_url: format!("http://{address}"),
        state,
        shutdown_tx: Some(shutdown_tx),
        _dir: dir,
    }
}

fn api_for(server: &TestServer) -> ApiClient {
    ApiClient::new(ClientConfig::new(&server.base_url).expect("config")).expect("api client")
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<SyncEvent>) -> SyncEvent {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("event before timeout")
        .expect("transport alive")
}

async fn wait_connected(rx: &mut mpsc::UnboundedReceiver<SyncEvent>) {
    loop {
        if next_event(rx).await == SyncEvent::ConnectionStateChanged(ConnectionState::Connected) {
            return;
        }
    }
}

async fn wait_for_notice<F>(notifier: &RecordingNotifier, what: &str, predicate: F)
where
    F: Fn(&Notice) -> bool,
{
    for _ in 0..500 {
        if notifier.notices().iter().any(&predicate) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("no {what} notice, got {:?}", notifier.notices());
}

#[tokio::test]
async fn api_uploads_lists_downloads_and_deletes() {
    let server = start_server().await;
    let api = api_for(&server);

    let seen = Arc::new(Mutex::new(Vec::<u8>::new()));
    let sink = Arc::clone(&seen);
    let payload = Bytes::from(vec![7u8; 300 * 1024]);
    let record = api
        .upload_bytes(
            payload.clone(),
            "photo.png",
            Arc::new(move |percent: u8| sink.lock().unwrap().push(percent)),
        )
        .await
        .expect("upload");
    assert_eq!(record.original_name, "photo.png");
    assert_eq!(record.size, payload.len() as u64);

    let progress = seen.lock().unwrap().clone();
    assert!(progress.windows(2).all(|pair| pair[0] < pair[1]), "{progress:?}");
    assert_eq!(progress.last(), Some(&100));

    let info = api.fetch_info().await.expect("info");
    let port = server.base_url.rsplit(':').next().expect("port").to_owned();
    assert_eq!(info.port.to_string(), port);
    assert_eq!(info.url, format!("http://{}:{}", info.local_ip, port));

    let files = api.fetch_files().await.expect("files");
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].filename, record.filename);

    let out = tempfile::tempdir().expect("out dir");
    let dest = out.path().join("copy.png");
    let written = api
        .download_file(&record.filename, &dest)
        .await
        .expect("download");
    assert_eq!(written, payload.len() as u64);
    assert_eq!(std::fs::read(&dest).expect("read copy"), payload.to_vec());

    api.delete_file(&record.filename).await.expect("delete");
    assert!(api.fetch_files().await.expect("files").is_empty());

    let err = api
        .delete_file(&record.filename)
        .await
        .expect_err("second delete fails");
    match err {
        ClientError::Delete { reason, .. } => assert_eq!(reason, "File not found"),
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn upload_times_out_when_server_never_answers() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let address = listener.local_addr().expect("local addr");
    let router = axum::Router::new().route(
        "/upload",
        axum::routing::post(|| async { std::future::pending::<&'static str>().await }),
    );
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });

    let mut config = ClientConfig::new(&format!("http://{address}")).expect("config");
    config.upload_timeout = Duration::from_millis(300);
    let api = ApiClient::new(config).expect("api client");

    let result = timeout(
        Duration::from_secs(10),
        api.upload_bytes(Bytes::from(vec![0u8; 10 * 1024 * 1024]), "big.bin", no_progress()),
    )
    .await
    .expect("upload call must not hang");

    match result {
        Err(ClientError::Upload(UploadError::Timeout(budget))) => {
            assert_eq!(budget, Duration::from_millis(300));
        }
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[tokio::test]
async fn upload_surfaces_rejections_garbage_and_http_errors() {
    use axum::{http::StatusCode, routing::post};

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let address = listener.local_addr().expect("local addr");
    let router = axum::Router::new()
        .route(
            "/refused/upload",
            post(|| async { r#"{"success":false,"error":"nope"}"# }),
        )
        .route("/garbled/upload", post(|| async { "<html>not json</html>" }))
        .route(
            "/broken/upload",
            post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, r#"{"error":"boom"}"#) }),
        );
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });

    let upload_to = |prefix: &str| {
        let api = ApiClient::new(
            ClientConfig::new(&format!("http://{address}/{prefix}/")).expect("config"),
        )
        .expect("api client");
        async move {
            api.upload_bytes(Bytes::from_static(b"hi"), "note.txt", no_progress())
                .await
        }
    };

    match upload_to("refused").await {
        Err(ClientError::Upload(UploadError::Server(message))) => assert_eq!(message, "nope"),
        other => panic!("expected server rejection, got {other:?}"),
    }
    match upload_to("garbled").await {
        Err(ClientError::Upload(UploadError::Parse(_))) => {}
        other => panic!("expected parse failure, got {other:?}"),
    }
    match upload_to("broken").await {
        Err(ClientError::Upload(UploadError::Status { status, message })) => {
            assert_eq!(status, 500);
            assert_eq!(message, "boom");
        }
        other => panic!("expected http status error, got {other:?}"),
    }
}

#[tokio::test]
async fn batch_keeps_going_after_a_failed_file() {
    let server = start_server().await;
    let api = api_for(&server);
    let scratch = tempfile::tempdir().expect("scratch");
    let first = scratch.path().join("first.txt");
    let missing = scratch.path().join("missing.txt");
    let last = scratch.path().join("last.txt");
    std::fs::write(&first, b"one").expect("write first");
    std::fs::write(&last, b"three!").expect("write last");

    let notifier = Arc::new(RecordingNotifier::default());
    let paths = vec![first, missing, last];
    let outcomes = upload_batch(&api, &paths, Duration::from_millis(500), &notifier).await;

    let successes: Vec<bool> = outcomes.iter().map(|o| o.is_success()).collect();
    assert_eq!(successes, vec![true, false, true]);
    assert_eq!(server.state.registry().list().await.len(), 2);

    let failed: Vec<Notice> = notifier
        .notices()
        .into_iter()
        .filter(|n| matches!(n, Notice::UploadFailed { .. }))
        .collect();
    assert_eq!(failed.len(), 1);
}

#[tokio::test]
async fn transport_delivers_events_and_commands() {
    let server = start_server().await;
    let config = ClientConfig::new(&server.base_url).expect("config");
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let (transport, task) = spawn_transport(config.ws_url().expect("ws url"), events_tx);
    wait_connected(&mut events_rx).await;

    assert!(!transport.send_message("   ").expect("blank send"));
    assert!(transport.send_message("  hello lan  ").expect("send"));
    match next_event(&mut events_rx).await {
        SyncEvent::NewMessage(message) => assert_eq!(message.text, "hello lan"),
        other => panic!("unexpected event {other:?}"),
    }
    assert_eq!(server.state.messages().list().await.len(), 1);

    transport.clear_messages().expect("clear");
    assert_eq!(next_event(&mut events_rx).await, SyncEvent::MessagesCleared);
    assert!(server.state.messages().list().await.is_empty());

    task.abort();
}

#[tokio::test]
async fn synchronizer_follows_server_changes() {
    let server = start_server().await;
    let api = api_for(&server);
    api.upload_bytes(Bytes::from_static(b"existing"), "old.txt", no_progress())
        .await
        .expect("seed upload");

    let config = ClientConfig::new(&server.base_url).expect("config");
    let notifier = Arc::new(RecordingNotifier::default());
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (transport, transport_task) =
        spawn_transport(config.ws_url().expect("ws url"), events_tx);
    let (actions_tx, actions_rx) = mpsc::unbounded_channel();
    let synchronizer = Synchronizer::new(
        Arc::new(api_for(&server)),
        Arc::clone(&notifier),
        Arc::new(AssumeAnswer(true)),
        transport,
        config,
    );
    let runner = tokio::spawn(synchronizer.run(events_rx, actions_rx));

    wait_for_notice(&notifier, "connected", |n| *n == Notice::Connected).await;
    for _ in 0..100 {
        if server.state.connected_clients().await >= 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    api.upload_bytes(Bytes::from_static(b"fresh"), "new.txt", no_progress())
        .await
        .expect("upload");
    wait_for_notice(&notifier, "new file", |n| {
        matches!(n, Notice::NewFile { original_name } if original_name == "new.txt")
    })
    .await;

    actions_tx
        .send(Action::SendMessage("ping".to_owned()))
        .expect("queue message");
    wait_for_notice(&notifier, "message", |n| {
        matches!(n, Notice::NewMessage(message) if message.text == "ping")
    })
    .await;

    actions_tx.send(Action::ClearAllFiles).expect("queue clear");
    wait_for_notice(&notifier, "second delete", |_| {
        notifier_count(&notifier, |n| matches!(n, Notice::FileDeleted { .. })) >= 2
    })
    .await;

    drop(actions_tx);
    let state = timeout(Duration::from_secs(5), runner)
        .await
        .expect("synchronizer stops")
        .expect("join");
    transport_task.abort();

    assert_eq!(state.stats().count, 0);
    assert_eq!(state.messages().len(), 1);
    assert!(server.state.registry().list().await.is_empty());
}

fn notifier_count<F>(notifier: &RecordingNotifier, predicate: F) -> usize
where
    F: Fn(&Notice) -> bool,
{
    notifier.notices().iter().filter(|n| predicate(n)).count()
}
