//! # ech-transport: ECH-aware dialing
//!
//! [`Dialer`] resolves a destination through [`ech_dns`], iterates its
//! connection targets in preference order, and races a bounded number of
//! staggered connection attempts. Each attempt carries the target's ECH
//! config list; a server that rejects ECH but offers a retry config list
//! gets one retry with that list. The first successful connection wins and
//! the rest are cancelled.
//!
//! The connection type is pluggable through the [`EchDialer`] trait so the
//! same machinery drives TLS-over-TCP and QUIC alike; the TLS stack itself
//! lives behind the trait.

pub mod dialer;

pub use dialer::{ClientTlsConfig, DialError, Dialer, EchDialer};
