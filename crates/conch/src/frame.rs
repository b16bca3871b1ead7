//! JSON frames exchanged over the duplex channel.
//!
//! Every WebSocket message carries one JSON object tagged by `type`:
//!
//! | Direction | Frame |
//! |-----------|-------|
//! | client → gateway | `{"type":"connect"}` |
//! | client → gateway | `{"type":"input","data":"ls\r"}` |
//! | client → gateway | `{"type":"resize","cols":120,"rows":40}` |
//! | gateway → client | `{"type":"ready"}` |
//! | gateway → client | `{"type":"data","data":"..."}` |
//! | gateway → client | `{"type":"error","data":"..."}` |
//! | gateway → client | `{"type":"close"}` |

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A frame sent by the relay client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientFrame {
    /// Open the remote session using the server-side credentials.
    Connect,
    /// Raw keystroke or paste bytes for the shell.
    Input {
        /// Text forwarded verbatim to the shell.
        data: String,
    },
    /// The client's terminal changed size.
    Resize {
        /// Width in columns.
        cols: u32,
        /// Height in rows.
        rows: u32,
    },
}

impl ClientFrame {
    /// Decodes a frame from the text of one channel message.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Framing`] for anything that is not a known frame.
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::Framing(e.to_string()))
    }
}

/// A frame sent by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerFrame {
    /// The shell is open and accepting input.
    Ready,
    /// A chunk of shell output.
    Data {
        /// Output text.
        data: String,
    },
    /// Human-readable failure description.
    Error {
        /// Failure message.
        data: String,
    },
    /// The remote shell ended; the session is over.
    Close,
}

impl ServerFrame {
    /// Creates a data frame.
    pub fn data(data: impl Into<String>) -> Self {
        ServerFrame::Data { data: data.into() }
    }

    /// Creates an error frame.
    pub fn error(data: impl Into<String>) -> Self {
        ServerFrame::Error { data: data.into() }
    }

    /// Encodes the frame as JSON text.
    pub fn to_json(&self) -> String {
        // Serializing these variants cannot fail: no maps with non-string keys.
        serde_json::to_string(self).unwrap_or_else(|_| String::from(r#"{"type":"close"}"#))
    }
}

impl From<&Error> for ServerFrame {
    fn from(err: &Error) -> Self {
        ServerFrame::error(err.to_string())
    }
}

// -----------------------------------------------------------------------------
// Output decoding
// -----------------------------------------------------------------------------

/// Turns shell output chunks into text without splitting UTF-8 sequences.
///
/// Remote output arrives in arbitrary chunks; a multibyte character may start
/// at the end of one chunk and finish in the next. The decoder holds back an
/// incomplete trailing sequence until the rest arrives. Bytes that can never
/// form valid UTF-8 are replaced with U+FFFD.
#[derive(Debug, Default)]
pub struct OutputDecoder {
    pending: Vec<u8>,
}

impl OutputDecoder {
    /// Creates an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one chunk and returns the text that is complete so far.
    ///
    /// Returns `None` when the chunk only extended a pending sequence.
    pub fn push(&mut self, chunk: &[u8]) -> Option<String> {
        self.pending.extend_from_slice(chunk);

        let mut out = String::new();
        let mut rest: &[u8] = &self.pending;
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(err) => {
                    let (valid, after) = rest.split_at(err.valid_up_to());
                    // valid_up_to guarantees this prefix is UTF-8.
                    out.push_str(&String::from_utf8_lossy(valid));
                    match err.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[bad..];
                        }
                        None => {
                            // Incomplete sequence at the end: wait for more bytes.
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }

        let carried = rest.to_vec();
        self.pending = carried;

        if out.is_empty() { None } else { Some(out) }
    }

    /// Flushes whatever is still pending, lossily.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let text = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(text)
    }
}
