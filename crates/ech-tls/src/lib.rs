//! # ech-tls: Encrypted Client Hello split-mode engine
//!
//! This crate implements the client-facing server role of the TLS Encrypted
//! Client Hello "Split Mode" topology (draft-ietf-tls-esni), plus the wire
//! codecs and HPKE machinery it depends on:
//!
//! - [`ClientHello`] / [`ServerHello`]: strict, length-prefixed TLS handshake
//!   codecs that re-serialize parsed messages byte-identically
//! - [`EchConfig`] parsing, serialization, and key generation
//! - An RFC 9180 HPKE receiver and sender for the baseline
//!   DHKEM(X25519, HKDF-SHA256) suite with ChaCha20-Poly1305, AES-128-GCM,
//!   and AES-256-GCM AEADs
//! - [`EchServerConn`]: a transparent shim between a raw byte stream and a
//!   TLS endpoint that decrypts outer ClientHellos and forwards the
//!   reconstructed inner ClientHello, handling HelloRetryRequest retries
//!
//! The TLS stack that terminates the handshake is out of scope; the
//! interceptor hands it a plain byte stream.
//!
//! ```no_run
//! # async fn serve(stream: tokio::net::TcpStream) -> Result<(), ech_tls::EchError> {
//! use ech_tls::{new_config, EchError, EchKey, EchServerConn};
//!
//! let (private_key, config) = new_config(1, "public.example.com")?;
//! let keys = vec![EchKey { config, private_key, send_as_retry: true }];
//!
//! let conn = tokio::time::timeout(
//!     std::time::Duration::from_secs(5),
//!     EchServerConn::accept(stream, keys),
//! )
//! .await
//! .map_err(|_| EchError::Io(std::io::ErrorKind::TimedOut.into()))??;
//!
//! // Route by conn.server_name(), then hand `conn` to the TLS stack.
//! # Ok(())
//! # }
//! ```

use thiserror::Error;

pub mod client_hello;
pub mod config;
pub mod conn;
pub mod hpke;
pub mod record;
pub mod server_hello;

pub use client_hello::{ClientHello, EchExtension, EchOuterExt, Extension};
pub use config::{config_list, new_config, parse_config_list, CipherSuite, EchConfig, EchKey};
pub use conn::EchServerConn;
pub use server_hello::ServerHello;

/// Errors produced while intercepting a TLS connection or decoding its
/// handshake messages. Each decode-path variant maps to the TLS alert the
/// interceptor sends before closing (see [`EchError::alert_description`]).
#[derive(Debug, Error)]
pub enum EchError {
    /// A message could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// The peer sent a message that is not allowed at this point.
    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),

    /// A field value violates the protocol.
    #[error("illegal parameter: {0}")]
    IllegalParameter(String),

    /// A required extension is absent.
    #[error("missing extension: {0}")]
    MissingExtension(String),

    /// The ECH payload failed authenticated decryption.
    #[error("decrypt error: {0}")]
    Decrypt(String),

    /// No configured key matched the ECH extension. Internal sentinel: the
    /// interceptor falls back to outer-only passthrough; never surfaced.
    #[error("no matching ech key")]
    NoMatch,

    /// An HPKE operation failed.
    #[error("hpke: {0}")]
    Hpke(String),

    /// Underlying stream I/O failed.
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

pub type EchResult<T> = Result<T, EchError>;

impl From<ech_wire::WireError> for EchError {
    fn from(e: ech_wire::WireError) -> Self {
        EchError::Decode(e.to_string())
    }
}

impl EchError {
    /// The TLS alert description this error converts to (RFC 8446 §6).
    pub fn alert_description(&self) -> u8 {
        match self {
            EchError::UnexpectedMessage(_) => 0x0a,
            EchError::IllegalParameter(_) => 0x2f,
            EchError::Decode(_) => 0x32,
            EchError::Decrypt(_) => 0x33,
            EchError::MissingExtension(_) => 0x6e,
            _ => 0x28, // handshake_failure
        }
    }

    pub(crate) fn into_io(self) -> std::io::Error {
        match self {
            EchError::Io(e) => e,
            other => std::io::Error::new(std::io::ErrorKind::InvalidData, other),
        }
    }
}
