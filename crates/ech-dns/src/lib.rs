//! # ech-dns: secure name resolution for ECH-aware clients
//!
//! DNS machinery for discovering ECH config lists and connection targets:
//!
//! - [`message`]: an RFC 1035 message codec with RFC 9460 SVCB/HTTPS record
//!   support and compression-pointer safety
//! - [`transport`]: the [`DnsTransport`] seam and the RFC 8484 DNS-over-HTTPS
//!   implementation on reqwest
//! - [`resolver`]: [`Resolver`], which chases HTTPS-RR aliases, resolves
//!   additional target addresses, caches by TTL, and iterates dial
//!   [`Target`]s in preference order
//!
//! ```no_run
//! # async fn example() -> Result<(), ech_dns::DnsError> {
//! let resolver = ech_dns::default_resolver();
//! let result = resolver.resolve("www.example.com").await?;
//! for target in result.targets("tcp") {
//!     println!("{} ech={}", target.address, target.ech.is_some());
//! }
//! # Ok(())
//! # }
//! ```

use thiserror::Error;

pub mod cache;
pub mod message;
pub mod resolver;
pub mod testutil;
pub mod transport;

pub use message::{HttpsRecord, Message, Question, RData, Rr};
pub use resolver::{default_resolver, HostPort, ResolveResult, Resolver, Target};
pub use transport::{DnsTransport, DohTransport};

/// Errors produced while encoding, transporting, or interpreting DNS
/// messages. The five response-code variants mirror RFC 1035 RCODEs.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DnsError {
    #[error("decode error: {0}")]
    Decode(String),

    /// The input to [`resolver::Resolver::resolve`] is not a usable host,
    /// host:port, or URI.
    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("format error")]
    FormatError,

    #[error("server failure")]
    ServerFailure,

    #[error("non-existent domain")]
    NonExistentDomain,

    #[error("not implemented")]
    NotImplemented,

    #[error("query refused")]
    QueryRefused,

    /// A response code outside the named set.
    #[error("response code {0}")]
    ResponseCode(u8),

    /// The DoH server answered with a non-200 HTTP status.
    #[error("doh status code {0}")]
    Status(u16),

    /// The DoH request itself failed.
    #[error("transport: {0}")]
    Transport(String),
}

impl DnsError {
    /// Maps a non-zero RCODE to its error.
    pub fn from_rcode(rcode: u8) -> Self {
        match rcode {
            1 => DnsError::FormatError,
            2 => DnsError::ServerFailure,
            3 => DnsError::NonExistentDomain,
            4 => DnsError::NotImplemented,
            5 => DnsError::QueryRefused,
            other => DnsError::ResponseCode(other),
        }
    }
}

impl From<ech_wire::WireError> for DnsError {
    fn from(e: ech_wire::WireError) -> Self {
        DnsError::Decode(e.to_string())
    }
}

pub type DnsResult<T> = Result<T, DnsError>;
