#![allow(dead_code)]

use std::net::TcpListener;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use conch::config::{AuthSource, RelaySettings, RemoteCredentials};
use conch::{
    Error, GatewayBuilder, Pty, RemoteConnector, RemoteSession, RemoteTarget, Result,
    ServerFrame, Session, SessionId, SessionState, ShellStream, Window,
};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
pub const TEST_HOST: &str = "stub.invalid";
pub const TEST_USER: &str = "tester";
/// Frames a harness session may queue before it has to wait for the test.
pub const FRAME_BUFFER: usize = 32;

// -----------------------------------------------------------------------------
// Resource audit
// -----------------------------------------------------------------------------

/// Counters shared between a test and the stub handles it hands out.
#[derive(Clone, Default)]
pub struct Audit {
    connects: Arc<AtomicUsize>,
    open_remotes: Arc<AtomicUsize>,
    open_shells: Arc<AtomicUsize>,
    written: Arc<Mutex<Vec<u8>>>,
    resizes: Arc<Mutex<Vec<Window>>>,
    targets: Arc<Mutex<Vec<RemoteTarget>>>,
}

impl Audit {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn open_remotes(&self) -> usize {
        self.open_remotes.load(Ordering::SeqCst)
    }

    pub fn open_shells(&self) -> usize {
        self.open_shells.load(Ordering::SeqCst)
    }

    pub fn written(&self) -> Vec<u8> {
        self.written.lock().clone()
    }

    pub fn written_text(&self) -> String {
        String::from_utf8_lossy(&self.written()).into_owned()
    }

    pub fn resizes(&self) -> Vec<Window> {
        self.resizes.lock().clone()
    }

    pub fn targets(&self) -> Vec<RemoteTarget> {
        self.targets.lock().clone()
    }

    /// Waits until every remote session and shell handed out is dropped.
    pub async fn wait_released(&self) -> bool {
        for _ in 0..100 {
            if self.open_remotes() == 0 && self.open_shells() == 0 {
                return true;
            }
            sleep(Duration::from_millis(20)).await;
        }
        false
    }

    /// Waits until a shell has been written `len` bytes.
    pub async fn wait_written(&self, len: usize) -> bool {
        for _ in 0..100 {
            if self.written.lock().len() >= len {
                return true;
            }
            sleep(Duration::from_millis(20)).await;
        }
        false
    }
}

// -----------------------------------------------------------------------------
// Stub remote provider
// -----------------------------------------------------------------------------

/// How the stub remote host behaves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Behavior {
    /// Shell echoes every write back; writing `exit\n` ends the shell.
    Echo,
    /// Like `Echo`, but every echoed byte arrives as its own chunk.
    EchoBytewise,
    /// Authentication fails with "auth failed".
    FailAuth,
    /// The connection attempt never completes.
    HangConnect,
    /// Connects, but the shell request never completes.
    HangShell,
    /// Connects, but the shell request is refused.
    RefuseShell,
    /// Shell opens, but every write fails.
    BrokenShell,
}

#[derive(Clone)]
pub struct StubConnector {
    behavior: Behavior,
    audit: Audit,
}

impl StubConnector {
    pub fn new(behavior: Behavior) -> Self {
        Self {
            behavior,
            audit: Audit::default(),
        }
    }

    pub fn audit(&self) -> Audit {
        self.audit.clone()
    }
}

#[async_trait]
impl RemoteConnector for StubConnector {
    async fn connect(&self, target: &RemoteTarget) -> Result<Box<dyn RemoteSession>> {
        self.audit.connects.fetch_add(1, Ordering::SeqCst);
        self.audit.targets.lock().push(target.clone());

        match self.behavior {
            Behavior::FailAuth => Err(Error::RemoteConnect("auth failed".to_string())),
            Behavior::HangConnect => std::future::pending().await,
            _ => Ok(Box::new(StubRemote::new(self.behavior, self.audit.clone()))),
        }
    }
}

struct StubRemote {
    behavior: Behavior,
    audit: Audit,
}

impl StubRemote {
    fn new(behavior: Behavior, audit: Audit) -> Self {
        audit.open_remotes.fetch_add(1, Ordering::SeqCst);
        Self { behavior, audit }
    }
}

impl Drop for StubRemote {
    fn drop(&mut self) {
        self.audit.open_remotes.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl RemoteSession for StubRemote {
    async fn open_shell(&mut self, _pty: &Pty) -> Result<Box<dyn ShellStream>> {
        match self.behavior {
            Behavior::HangShell => std::future::pending().await,
            Behavior::RefuseShell => Err(Error::ShellStart("shell request refused".to_string())),
            _ => Ok(Box::new(StubShell::new(self.behavior, self.audit.clone()))),
        }
    }

    async fn close(&mut self) {}
}

struct StubShell {
    behavior: Behavior,
    audit: Audit,
    output_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    output_rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl StubShell {
    fn new(behavior: Behavior, audit: Audit) -> Self {
        audit.open_shells.fetch_add(1, Ordering::SeqCst);
        let (output_tx, output_rx) = mpsc::unbounded_channel();
        Self {
            behavior,
            audit,
            output_tx: Some(output_tx),
            output_rx,
        }
    }
}

impl Drop for StubShell {
    fn drop(&mut self) {
        self.audit.open_shells.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ShellStream for StubShell {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.behavior == Behavior::BrokenShell {
            return Err(Error::Session("broken pipe".to_string()));
        }
        self.audit.written.lock().extend_from_slice(data);

        if let Some(tx) = &self.output_tx {
            if self.behavior == Behavior::EchoBytewise {
                for byte in data {
                    let _ = tx.send(vec![*byte]);
                }
            } else {
                let _ = tx.send(data.to_vec());
            }
        }
        if data.ends_with(b"exit\n") {
            self.output_tx = None;
        }
        Ok(())
    }

    async fn resize(&mut self, window: Window) -> Result<()> {
        self.audit.resizes.lock().push(window);
        Ok(())
    }

    async fn recv(&mut self) -> Option<Vec<u8>> {
        self.output_rx.recv().await
    }

    async fn close(&mut self) {
        self.output_tx = None;
    }
}

// -----------------------------------------------------------------------------
// Settings
// -----------------------------------------------------------------------------

pub fn password_settings() -> RelaySettings {
    RelaySettings {
        credentials: RemoteCredentials {
            host: Some(TEST_HOST.to_string()),
            port: 22,
            username: Some(TEST_USER.to_string()),
            auth: Some(AuthSource::Password("secret".to_string())),
            env_directive: None,
        },
        handshake_timeout: Some(Duration::from_secs(2)),
        ..RelaySettings::default()
    }
}

pub fn unauthenticated_settings() -> RelaySettings {
    let mut settings = password_settings();
    settings.credentials.auth = None;
    settings
}

// -----------------------------------------------------------------------------
// Session harness
// -----------------------------------------------------------------------------

/// A session running on its own task, driven through channels.
pub struct SessionHarness {
    inbound: Option<mpsc::Sender<String>>,
    frames: mpsc::Receiver<ServerFrame>,
    state: watch::Receiver<SessionState>,
    task: JoinHandle<Session>,
}

impl SessionHarness {
    pub fn spawn(settings: RelaySettings, connector: StubConnector) -> Self {
        let (outbound_tx, frames) = mpsc::channel(FRAME_BUFFER);
        let (inbound_tx, inbound_rx) = mpsc::channel(16);

        let mut session = Session::new(
            SessionId(1),
            Arc::new(settings),
            Arc::new(connector),
            outbound_tx,
        );
        let state = session.subscribe();
        let task = tokio::spawn(async move {
            session.run(inbound_rx).await;
            session
        });

        Self {
            inbound: Some(inbound_tx),
            frames,
            state,
            task,
        }
    }

    pub async fn send(&self, text: &str) {
        self.inbound
            .as_ref()
            .expect("channel already closed")
            .send(text.to_string())
            .await
            .expect("session stopped reading");
    }

    pub async fn connect(&self) {
        self.send(r#"{"type":"connect"}"#).await;
    }

    pub async fn input(&self, data: &str) {
        let frame = serde_json::json!({ "type": "input", "data": data });
        self.send(&frame.to_string()).await;
    }

    pub async fn next_frame(&mut self) -> ServerFrame {
        timeout(DEFAULT_TIMEOUT, self.frames.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("outbound channel closed")
    }

    /// Returns a frame only if one is already queued.
    pub fn try_frame(&mut self) -> Option<ServerFrame> {
        self.frames.try_recv().ok()
    }

    /// Number of frames queued and not yet read.
    pub fn queued_frames(&self) -> usize {
        self.frames.len()
    }

    /// Collects data frames until their text contains `needle`.
    pub async fn read_until(&mut self, needle: &str) -> String {
        let mut text = String::new();
        while !text.contains(needle) {
            match self.next_frame().await {
                ServerFrame::Data { data } => text.push_str(&data),
                other => panic!("expected data frame, got {other:?}"),
            }
        }
        text
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub async fn wait_for_state(&mut self, wanted: SessionState) {
        let reached = matches!(
            timeout(DEFAULT_TIMEOUT, self.state.wait_for(|s| *s == wanted)).await,
            Ok(Ok(_))
        );
        assert!(
            reached,
            "session never reached {wanted}, stuck in {}",
            self.state()
        );
    }

    /// Closes the client side of the channel.
    pub fn close_channel(&mut self) {
        self.inbound = None;
    }

    /// Waits for the session task and returns it with every remaining frame.
    pub async fn finish(mut self) -> (Session, Vec<ServerFrame>) {
        self.inbound = None;
        let session = timeout(DEFAULT_TIMEOUT, self.task)
            .await
            .expect("session did not finish")
            .expect("session task panicked");

        let mut rest = Vec::new();
        while let Ok(frame) = self.frames.try_recv() {
            rest.push(frame);
        }
        (session, rest)
    }
}

// -----------------------------------------------------------------------------
// Gateway harness
// -----------------------------------------------------------------------------

pub struct TestGateway {
    port: u16,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl TestGateway {
    pub async fn start(builder: GatewayBuilder) -> Self {
        let port = pick_unused_port();
        let gateway = builder
            .address(format!("127.0.0.1:{port}"))
            .drain_timeout(Duration::from_millis(500))
            .build()
            .expect("build gateway");

        let (shutdown, signal) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let signal = async move {
                let _ = signal.await;
            };
            if let Err(err) = gateway.listen_with_shutdown(signal).await {
                eprintln!("gateway error: {err}");
            }
        });

        wait_for_port(port).await;

        Self {
            port,
            shutdown: Some(shutdown),
            handle,
        }
    }

    pub const fn port(&self) -> u16 {
        self.port
    }

    pub fn ws_url(&self) -> String {
        format!("ws://127.0.0.1:{}/ws", self.port)
    }

    /// Sends the shutdown signal and waits for the gateway to stop.
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = timeout(DEFAULT_TIMEOUT, &mut self.handle).await;
        self.handle.abort();
    }
}

fn pick_unused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind temp port");
    let port = listener.local_addr().expect("local addr").port();
    drop(listener);
    port
}

async fn wait_for_port(port: u16) {
    let addr = format!("127.0.0.1:{port}");
    for _ in 0..100 {
        if TcpStream::connect(&addr).await.is_ok() {
            return;
        }
        sleep(Duration::from_millis(50)).await;
    }
    panic!("gateway did not start in time");
}
