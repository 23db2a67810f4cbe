//! TLS record framing: bounded record reads, alert emission, and the debug
//! name tables used in trace output.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{EchError, EchResult};

pub(crate) const CONTENT_TYPE_ALERT: u8 = 21;
pub(crate) const CONTENT_TYPE_HANDSHAKE: u8 = 22;
pub(crate) const CONTENT_TYPE_APPLICATION_DATA: u8 = 23;

pub(crate) const HANDSHAKE_CLIENT_HELLO: u8 = 1;
pub(crate) const HANDSHAKE_SERVER_HELLO: u8 = 2;

/// Maximum TLSPlaintext fragment length (RFC 8446 §5.1).
pub const MAX_RECORD_LEN: usize = 16384;

/// The fixed ServerHello.random value that identifies a HelloRetryRequest
/// (SHA-256 of "HelloRetryRequest", RFC 8446 §4.1.3).
pub const HELLO_RETRY_REQUEST_RANDOM: [u8; 32] = [
    0xcf, 0x21, 0xad, 0x74, 0xe5, 0x9a, 0x61, 0x11, 0xbe, 0x1d, 0x8c, 0x02, 0x1e, 0x65, 0xb8,
    0x91, 0xc2, 0xa2, 0x11, 0x16, 0x7a, 0xbb, 0x8c, 0x5e, 0x07, 0x9e, 0x09, 0xe2, 0xc8, 0xa8,
    0x33, 0x9c,
];

/// Reads one full TLS record (header + fragment) from `stream`.
pub(crate) async fn read_record<S>(stream: &mut S) -> EchResult<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 5];
    stream.read_exact(&mut header).await?;
    let length = u16::from_be_bytes([header[3], header[4]]) as usize;
    if length > MAX_RECORD_LEN {
        return Err(EchError::Decode(format!(
            "record length {length} > {MAX_RECORD_LEN}"
        )));
    }
    let mut record = vec![0u8; 5 + length];
    record[..5].copy_from_slice(&header);
    stream.read_exact(&mut record[5..]).await?;
    Ok(record)
}

/// A fatal alert record for the given description.
pub(crate) fn alert_record(description: u8) -> [u8; 7] {
    [
        CONTENT_TYPE_ALERT,
        0x03,
        0x03, // legacy version TLS 1.2
        0x00,
        0x02, // length
        0x02, // level: fatal
        description,
    ]
}

/// Sends the fatal alert mapped from `err` and shuts the stream down.
/// Best effort: write failures are ignored, the connection is going away.
pub(crate) async fn send_alert<S>(stream: &mut S, err: &EchError)
where
    S: AsyncWrite + Unpin,
{
    let record = alert_record(err.alert_description());
    let _ = stream.write_all(&record).await;
    let _ = stream.shutdown().await;
}

pub(crate) fn content_type_name(t: u8) -> &'static str {
    match t {
        0 => "invalid",
        20 => "change_cipher_spec",
        21 => "alert",
        22 => "handshake",
        23 => "application_data",
        _ => "unknown",
    }
}

pub(crate) fn handshake_type_name(t: u8) -> &'static str {
    match t {
        1 => "ClientHello",
        2 => "ServerHello",
        4 => "NewSessionTicket",
        5 => "EndOfEarlyData",
        8 => "EncryptedExtensions",
        11 => "Certificate",
        13 => "CertificateRequest",
        15 => "CertificateVerify",
        20 => "Finished",
        24 => "KeyUpdate",
        254 => "message_hash",
        _ => "unknown",
    }
}

pub(crate) fn extension_name(t: u16) -> &'static str {
    match t {
        0 => "server_name",
        1 => "max_fragment_length",
        5 => "status_request",
        10 => "supported_groups",
        13 => "signature_algorithms",
        14 => "use_srtp",
        15 => "heartbeat",
        16 => "application_layer_protocol_negotiation",
        18 => "signed_certificate_timestamp",
        19 => "client_certificate_type",
        20 => "server_certificate_type",
        21 => "padding",
        41 => "pre_shared_key",
        42 => "early_data",
        43 => "supported_versions",
        44 => "cookie",
        45 => "psk_key_exchange_modes",
        47 => "certificate_authorities",
        48 => "oid_filters",
        49 => "post_handshake_auth",
        50 => "signature_algorithms_cert",
        51 => "key_share",
        0xfd00 => "ech_outer_extensions",
        0xfe0d => "encrypted_client_hello",
        _ => "unknown",
    }
}
