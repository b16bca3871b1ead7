//! Remote-session provider interface.
//!
//! A session never talks to an SSH library directly. It goes through three
//! small traits:
//!
//! - [`RemoteConnector`] opens an authenticated [`RemoteSession`]
//! - [`RemoteSession`] opens one interactive [`ShellStream`]
//! - [`ShellStream`] is the byte pipe to the remote shell
//!
//! [`ssh::SshConnector`] is the production implementation on top of russh.
//! Tests plug in stub connectors that count open handles.
//!
//! Dropping a handle must release it: sessions call `close` on every
//! orderly path, but a cancelled handshake simply drops whatever it acquired.

use std::fmt;

use async_trait::async_trait;

use crate::Result;

pub mod ssh;

// -----------------------------------------------------------------------------
// PTY Types
// -----------------------------------------------------------------------------

/// Window size information.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    /// Terminal width in columns.
    pub width: u32,
    /// Terminal height in rows.
    pub height: u32,
}

impl Default for Window {
    fn default() -> Self {
        Self {
            width: 80,
            height: 24,
        }
    }
}

/// Pseudo-terminal requested for the remote shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pty {
    /// Terminal type (e.g., "xterm-256color").
    pub term: String,
    /// Window dimensions.
    pub window: Window,
}

impl Default for Pty {
    fn default() -> Self {
        Self {
            term: "xterm-256color".to_string(),
            window: Window::default(),
        }
    }
}

// -----------------------------------------------------------------------------
// Connect target
// -----------------------------------------------------------------------------

/// Resolved authentication material.
#[derive(Clone, PartialEq, Eq)]
pub enum AuthMaterial {
    /// Password authentication.
    Password(String),
    /// Private key contents (OpenSSH or PEM) and optional passphrase.
    PrivateKey {
        /// Encoded key.
        key: String,
        /// Passphrase for an encrypted key.
        passphrase: Option<String>,
    },
}

impl AuthMaterial {
    /// Short method name for logs.
    pub fn method(&self) -> &'static str {
        match self {
            AuthMaterial::Password(_) => "password",
            AuthMaterial::PrivateKey { .. } => "publickey",
        }
    }
}

impl fmt::Debug for AuthMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuthMaterial({})", self.method())
    }
}

/// Everything a connector needs to open one remote session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    /// Remote host name or address.
    pub host: String,
    /// Remote SSH port.
    pub port: u16,
    /// Remote user name.
    pub user: String,
    /// How to authenticate.
    pub auth: AuthMaterial,
}

impl fmt::Display for RemoteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

// -----------------------------------------------------------------------------
// Traits
// -----------------------------------------------------------------------------

/// Opens authenticated remote sessions.
///
/// Implementations return [`crate::Error::RemoteConnect`] for network and
/// authentication failures and [`crate::Error::Credential`] for key material
/// that cannot be decoded.
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    /// Connects and authenticates to `target`.
    async fn connect(&self, target: &RemoteTarget) -> Result<Box<dyn RemoteSession>>;
}

/// An authenticated connection to a remote host.
#[async_trait]
pub trait RemoteSession: Send {
    /// Requests an interactive shell with the given PTY.
    ///
    /// Failures are reported as [`crate::Error::ShellStart`].
    async fn open_shell(&mut self, pty: &Pty) -> Result<Box<dyn ShellStream>>;

    /// Ends the session. Calling it more than once is harmless.
    async fn close(&mut self);
}

/// The byte stream of an interactive remote shell.
#[async_trait]
pub trait ShellStream: Send {
    /// Writes bytes to the shell's stdin.
    async fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Forwards a terminal size change.
    async fn resize(&mut self, window: Window) -> Result<()>;

    /// Waits for the next output chunk. `None` means the stream has ended.
    ///
    /// Must be cancel-safe: a chunk is never lost if the returned future is
    /// dropped before completion.
    async fn recv(&mut self) -> Option<Vec<u8>>;

    /// Ends the stream. Calling it more than once is harmless.
    async fn close(&mut self);
}
