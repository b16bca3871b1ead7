//! The per-channel session state machine.
//!
//! A [`Session`] owns at most one remote session and at most one shell
//! stream. Which of them it holds is encoded in its [`Phase`], so the
//! resource invariants are structural:
//!
//! | Phase | Remote session | Shell stream |
//! |-------|----------------|--------------|
//! | idle | - | - |
//! | connecting | inside the handshake future | inside the handshake future |
//! | active | held | held |
//! | closing | held | - |
//! | closed | - | - |
//!
//! Every event (client frame, handshake completion, shell output, channel
//! close) goes through a single dispatch function, and every state change goes
//! through [`Session::set_phase`].

mod state;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

pub use state::{SessionId, SessionState};

use crate::config::RelaySettings;
use crate::frame::{ClientFrame, OutputDecoder, ServerFrame};
use crate::remote::{Pty, RemoteConnector, RemoteSession, RemoteTarget, ShellStream, Window};
use crate::{Error, Result};

/// Error text sent when a second `connect` arrives.
const ALREADY_CONNECTED: &str = "session already has a connection in progress or open";

type Handshake = Pin<Box<dyn Future<Output = Result<Link>> + Send>>;

/// An open shell and the remote session it runs on.
struct Link {
    remote: Box<dyn RemoteSession>,
    shell: Box<dyn ShellStream>,
    decoder: OutputDecoder,
}

/// Lifecycle phase together with the resources it owns.
enum Phase {
    Idle,
    Connecting(Handshake),
    Active(Link),
    Closing(Box<dyn RemoteSession>),
    Closed,
}

impl Phase {
    fn state(&self) -> SessionState {
        match self {
            Phase::Idle => SessionState::Idle,
            Phase::Connecting(_) => SessionState::Connecting,
            Phase::Active(_) => SessionState::Active,
            Phase::Closing(_) => SessionState::Closing,
            Phase::Closed => SessionState::Closed,
        }
    }
}

/// Everything that can happen to a session.
enum Event {
    /// A text message from the client, or `None` once the channel closed.
    Frame(Option<String>),
    /// The handshake finished.
    Handshake(Result<Link>),
    /// Shell output, or `None` once the shell stream ended.
    Output(Option<Vec<u8>>),
}

/// One relay session, bound to one duplex channel.
///
/// Frames for the client are pushed to `outbound` in the order they are
/// produced. `outbound` is bounded: while it is full the session does not
/// read shell output. The caller feeds client text messages through
/// [`Session::run`].
pub struct Session {
    id: SessionId,
    settings: Arc<RelaySettings>,
    connector: Arc<dyn RemoteConnector>,
    outbound: mpsc::Sender<ServerFrame>,
    phase: Phase,
    state: SessionState,
    state_tx: watch::Sender<SessionState>,
}

impl Session {
    /// Creates an idle session.
    pub fn new(
        id: SessionId,
        settings: Arc<RelaySettings>,
        connector: Arc<dyn RemoteConnector>,
        outbound: mpsc::Sender<ServerFrame>,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Idle);
        Self {
            id,
            settings,
            connector,
            outbound,
            phase: Phase::Idle,
            state: SessionState::Idle,
            state_tx,
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Watches state changes from outside the session task.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Drives the session until it is closed.
    ///
    /// `inbound` carries the client's text messages. Closing it is the
    /// cancellation signal: whatever the session holds at that moment is
    /// released, including a handshake still in flight.
    pub async fn run(&mut self, mut inbound: mpsc::Receiver<String>) {
        while !self.state.is_terminal() {
            let event = self.next_event(&mut inbound).await;
            self.dispatch(event).await;
        }
        debug!(session_id = self.id.0, "Session finished");
    }

    /// Releases every held handle and moves to `closed`.
    ///
    /// Safe to call in any state and more than once. Never emits a `close`
    /// frame: the client is the one that went away.
    pub async fn shutdown(&mut self) {
        match self.take_phase() {
            Phase::Closed => return,
            Phase::Idle => {}
            Phase::Connecting(handshake) => {
                drop(handshake);
                debug!(session_id = self.id.0, "Cancelled in-flight handshake");
            }
            Phase::Active(link) => {
                self.release(link).await;
                return;
            }
            Phase::Closing(mut remote) => remote.close().await,
        }
        self.set_phase(Phase::Closed);
    }

    async fn next_event(&mut self, inbound: &mut mpsc::Receiver<String>) -> Event {
        match &mut self.phase {
            Phase::Idle => Event::Frame(inbound.recv().await),
            Phase::Connecting(handshake) => tokio::select! {
                result = handshake => Event::Handshake(result),
                frame = inbound.recv() => Event::Frame(frame),
            },
            Phase::Active(link) => tokio::select! {
                chunk = link.shell.recv() => Event::Output(chunk),
                frame = inbound.recv() => Event::Frame(frame),
            },
            // Only seen mid-teardown; treat like a closed channel.
            Phase::Closing(_) | Phase::Closed => Event::Frame(None),
        }
    }

    async fn dispatch(&mut self, event: Event) {
        match event {
            Event::Frame(None) => {
                debug!(session_id = self.id.0, state = %self.state, "Channel closed by client");
                self.shutdown().await;
            }
            Event::Frame(Some(text)) => match ClientFrame::parse(&text) {
                Ok(frame) => self.on_frame(frame).await,
                Err(e) => warn!(session_id = self.id.0, error = %e, "Dropping client frame"),
            },
            Event::Handshake(Ok(link)) => {
                self.set_phase(Phase::Active(link));
                info!(session_id = self.id.0, "Remote shell ready");
                self.emit(ServerFrame::Ready).await;
            }
            Event::Handshake(Err(e)) => {
                warn!(session_id = self.id.0, error = %e, "Remote connection failed");
                self.emit(ServerFrame::from(&e)).await;
                self.set_phase(Phase::Closed);
            }
            Event::Output(Some(chunk)) => {
                let text = match &mut self.phase {
                    Phase::Active(link) => link.decoder.push(&chunk),
                    _ => None,
                };
                if let Some(text) = text {
                    self.emit(ServerFrame::data(text)).await;
                }
            }
            Event::Output(None) => {
                info!(session_id = self.id.0, "Remote shell ended");
                self.finish_remote().await;
            }
        }
    }

    async fn on_frame(&mut self, frame: ClientFrame) {
        match frame {
            ClientFrame::Connect => {
                if self.state == SessionState::Idle {
                    self.begin_connect().await;
                } else {
                    debug!(session_id = self.id.0, state = %self.state, "Rejecting repeated connect");
                    self.emit(ServerFrame::error(ALREADY_CONNECTED)).await;
                }
            }
            ClientFrame::Input { data } => {
                let Phase::Active(link) = &mut self.phase else {
                    trace!(session_id = self.id.0, state = %self.state, "Ignoring input");
                    return;
                };
                if let Err(e) = link.shell.write(data.as_bytes()).await {
                    warn!(session_id = self.id.0, error = %e, "Shell write failed");
                    self.finish_remote().await;
                }
            }
            ClientFrame::Resize { cols, rows } => {
                let Phase::Active(link) = &mut self.phase else {
                    return;
                };
                if cols == 0 || rows == 0 {
                    return;
                }
                let window = Window {
                    width: cols,
                    height: rows,
                };
                if let Err(e) = link.shell.resize(window).await {
                    debug!(session_id = self.id.0, error = %e, "Resize not forwarded");
                }
            }
        }
    }

    async fn begin_connect(&mut self) {
        let target = match self.settings.credentials.resolve().await {
            Ok(target) => target,
            Err(e) => {
                warn!(session_id = self.id.0, error = %e, "Cannot connect");
                self.emit(ServerFrame::from(&e)).await;
                self.set_phase(Phase::Closed);
                return;
            }
        };

        info!(
            session_id = self.id.0,
            target = %target,
            method = target.auth.method(),
            "Connecting to remote host"
        );
        let handshake = handshake(
            Arc::clone(&self.connector),
            target,
            self.settings.pty.clone(),
            self.settings.credentials.env_directive.clone(),
            self.settings.handshake_timeout,
        );
        self.set_phase(Phase::Connecting(handshake));
    }

    /// The shell ended on its own: flush, tell the client, tear down.
    async fn finish_remote(&mut self) {
        let mut link = match self.take_phase() {
            Phase::Active(link) => link,
            other => {
                self.phase = other;
                return;
            }
        };
        if let Some(rest) = link.decoder.finish() {
            self.emit(ServerFrame::data(rest)).await;
        }
        self.emit(ServerFrame::Close).await;
        self.release(link).await;
    }

    /// Active teardown: shell first, then the remote session.
    async fn release(&mut self, link: Link) {
        let Link {
            remote, mut shell, ..
        } = link;
        shell.close().await;
        drop(shell);

        self.set_phase(Phase::Closing(remote));
        if let Phase::Closing(remote) = &mut self.phase {
            remote.close().await;
        }
        self.set_phase(Phase::Closed);
    }

    /// Moves the resources out, leaving the published state untouched.
    fn take_phase(&mut self) -> Phase {
        std::mem::replace(&mut self.phase, Phase::Closed)
    }

    fn set_phase(&mut self, phase: Phase) {
        let next = phase.state();
        debug_assert!(
            self.state.can_transition_to(next),
            "illegal session transition {} -> {}",
            self.state,
            next
        );
        debug!(session_id = self.id.0, from = %self.state, to = %next, "Session state changed");

        self.phase = phase;
        self.state = next;
        self.state_tx.send_replace(next);
    }

    /// Waits for room in the outbound queue.
    async fn emit(&mut self, frame: ServerFrame) {
        if self.outbound.send(frame).await.is_err() {
            trace!(session_id = self.id.0, "Outbound channel gone, frame dropped");
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.state.is_terminal() {
            debug!(session_id = self.id.0, state = %self.state, "Session dropped before close");
        }
    }
}

/// Connect, open the shell and write the environment directive.
///
/// Anything acquired is closed on failure and dropped on cancellation.
fn handshake(
    connector: Arc<dyn RemoteConnector>,
    target: RemoteTarget,
    pty: Pty,
    env_directive: Option<String>,
    deadline: Option<Duration>,
) -> Handshake {
    Box::pin(async move {
        let attempt = async {
            let mut remote = connector.connect(&target).await?;

            let mut shell = match remote.open_shell(&pty).await {
                Ok(shell) => shell,
                Err(e) => {
                    remote.close().await;
                    return Err(match e {
                        Error::ShellStart(_) => e,
                        other => Error::ShellStart(other.to_string()),
                    });
                }
            };

            if let Some(line) = env_directive {
                if let Err(e) = shell.write(format!("{line}\n").as_bytes()).await {
                    shell.close().await;
                    remote.close().await;
                    return Err(Error::ShellStart(format!(
                        "could not write environment directive: {e}"
                    )));
                }
            }

            Ok::<_, Error>(Link {
                remote,
                shell,
                decoder: OutputDecoder::new(),
            })
        };

        match deadline {
            Some(limit) => match tokio::time::timeout(limit, attempt).await {
                Ok(result) => result,
                Err(_) => Err(Error::RemoteConnect(format!(
                    "handshake timed out after {limit:?}"
                ))),
            },
            None => attempt.await,
        }
    })
}
