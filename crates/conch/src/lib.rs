#![forbid(unsafe_code)]
// Allow pedantic lints for early-stage API ergonomics.
#![allow(clippy::doc_markdown)]
#![allow(clippy::nursery)]
#![allow(clippy::pedantic)]

//! # Conch
//!
//! A relay that puts an interactive SSH shell behind a WebSocket.
//!
//! A browser terminal opens a WebSocket, sends `{"type":"connect"}`, and the
//! gateway opens one SSH session with the server-side credentials. From then
//! on keystrokes travel as `input` frames and shell output comes back as
//! `data` frames until either side hangs up.
//!
//! ## Features
//!
//! - **One session per channel**: every WebSocket owns exactly one remote
//!   shell, released on every exit path
//! - **Explicit state machine**: `idle → connecting → active → closing → closed`
//! - **Byte-exact relay**: output order is preserved and UTF-8 sequences split
//!   across chunks are reassembled
//! - **Handshake deadline**: a hung remote host cannot stall a session forever
//! - **Health endpoint**: `GET /api/health` for dashboards and probes
//!
//! ## Example
//!
//! ```rust,ignore
//! use conch::{GatewayBuilder, RelaySettings, SshConnector};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), conch::Error> {
//!     let settings = RelaySettings::default();
//!     let gateway = GatewayBuilder::new()
//!         .address("127.0.0.1:3001")
//!         .settings(settings)
//!         .connector(SshConnector::new())
//!         .build()?;
//!
//!     gateway.listen().await
//! }
//! ```

use std::io;

use thiserror::Error;

pub mod config;
pub mod frame;
mod gateway;
pub mod registry;
pub mod remote;
pub mod session;

pub use config::{AuthSource, Cli, RelaySettings, RemoteCredentials};
pub use frame::{ClientFrame, OutputDecoder, ServerFrame};
pub use gateway::{
    Gateway, GatewayBuilder, GatewayState, HealthReport, HealthServices, HealthSessions,
};
pub use registry::{SessionInfo, SessionRegistry};
pub use remote::ssh::SshConnector;
pub use remote::{
    AuthMaterial, Pty, RemoteConnector, RemoteSession, RemoteTarget, ShellStream, Window,
};
pub use session::{Session, SessionId, SessionState};

// -----------------------------------------------------------------------------
// Error Types
// -----------------------------------------------------------------------------

/// Errors that can occur while relaying a remote shell.
///
/// The first five variants are scoped to one session: the session driver
/// catches them and turns them into `error` frames, so they never reach the
/// gateway's accept loop. The remaining variants are process-level.
///
/// # Recovery Strategies
///
/// | Error Variant | Recovery Strategy |
/// |--------------|-------------------|
/// | [`Configuration`](Error::Configuration) | Fix the server's SSH settings |
/// | [`Credential`](Error::Credential) | Check the key file path and permissions |
/// | [`RemoteConnect`](Error::RemoteConnect) | Client may retry on a fresh channel |
/// | [`ShellStart`](Error::ShellStart) | Check the remote account's shell |
/// | [`Framing`](Error::Framing) | Logged and dropped |
/// | [`Io`](Error::Io) | Check permissions, port availability |
/// | [`AddrParse`](Error::AddrParse) | Validate address format |
/// | [`Session`](Error::Session) | Close the channel |
#[derive(Error, Debug)]
pub enum Error {
    /// No usable authentication method (or host/user) is configured.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The configured private key could not be read or parsed.
    #[error("credential error: {0}")]
    Credential(String),

    /// Handshake, authentication or network failure talking to the remote host.
    ///
    /// Also raised when the handshake deadline expires.
    #[error("ssh connection failed: {0}")]
    RemoteConnect(String),

    /// The remote session was established but no shell could be started.
    #[error("failed to start shell: {0}")]
    ShellStart(String),

    /// A client frame could not be decoded.
    ///
    /// Never terminates the session.
    #[error("malformed frame: {0}")]
    Framing(String),

    /// I/O error during gateway operations.
    ///
    /// Commonly occurs when:
    /// - The bind address is already in use
    /// - Permission denied on privileged ports
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Address parse error.
    #[error("address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),

    /// The duplex channel to the client failed.
    #[error("session error: {0}")]
    Session(String),
}

/// A specialized [`Result`] type for conch operations.
pub type Result<T> = std::result::Result<T, Error>;
