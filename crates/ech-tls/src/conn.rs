//! The ECH connection interceptor.
//!
//! [`EchServerConn`] sits between a raw byte stream and a TLS endpoint. It
//! parses TLS records on both directions, decrypts the outer ClientHello's
//! `encrypted_client_hello` extension when one of the configured keys
//! matches, and forwards the reconstructed ClientHelloInner in its place.
//! Everything else passes through unchanged, record boundaries preserved.
//!
//! The write side sniffs ServerHello records for HelloRetryRequest so that a
//! retried ClientHello on the read side is decrypted with the same HPKE
//! context (the sequence number having advanced past the first open).
//!
//! Concurrency contract: one reader and one writer, the same as the
//! underlying socket. `retry_count` is atomic because HRR detection happens
//! on the write side while the retried ClientHello is handled on the read
//! side.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicI32, Ordering};
use std::task::{Context, Poll};

use ech_wire::{Builder, Reader};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::client_hello::{
    ClientHello, EchExtension, Extension, EXT_ECH_OUTER_EXTENSIONS, EXT_ENCRYPTED_CLIENT_HELLO,
};
use crate::config::EchKey;
use crate::hpke::{self, HpkeContext};
use crate::record::{
    self, alert_record, content_type_name, handshake_type_name, CONTENT_TYPE_APPLICATION_DATA,
    CONTENT_TYPE_HANDSHAKE, HANDSHAKE_CLIENT_HELLO, HANDSHAKE_SERVER_HELLO, MAX_RECORD_LEN,
};
use crate::server_hello::ServerHello;
use crate::{EchError, EchResult};

/// The HPKE receiver established by the first ClientHello, kept together
/// with the public name of the config that matched so a retried hello is
/// validated against the same config.
struct EchReceiver {
    ctx: HpkeContext,
    public_name: String,
}

/// A server-side connection that transparently handles Encrypted Client
/// Hello, as defined in draft-ietf-tls-esni.
///
/// [`EchServerConn::accept`] processes the first ClientHello before it
/// returns. The connection keeps inspecting handshake records afterwards: if
/// the server issues a HelloRetryRequest, the retried ClientHello is
/// processed like the first one, with extra restrictions.
pub struct EchServerConn<S> {
    inner: S,
    keys: Vec<EchKey>,

    outer: Option<ClientHello>,
    inner_hello: Option<ClientHello>,
    hpke_ctx: Option<EchReceiver>,

    read_buf: Vec<u8>,
    read_pos: usize,
    read_err: Option<(io::ErrorKind, String)>,
    partial: Vec<u8>,

    write_in: Vec<u8>,
    write_out: Vec<u8>,
    write_out_pos: usize,

    retry_count: AtomicI32,
    read_passthrough: bool,
    write_passthrough: bool,
}

impl<S> EchServerConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Reads and processes the first ClientHello, then returns the wrapped
    /// connection. The initial record must be a Handshake record; anything
    /// else fails with `UnexpectedMessage`.
    ///
    /// On error a fatal TLS alert is written to `stream` before returning.
    /// Callers bound the initial read with `tokio::time::timeout`; once
    /// `accept` returns, no timeout applies.
    pub async fn accept(mut stream: S, keys: Vec<EchKey>) -> EchResult<Self> {
        match Self::accept_inner(&mut stream, &keys).await {
            Ok((outer, inner_hello, hpke_ctx, read_buf)) => {
                let passthrough = inner_hello.is_none();
                Ok(EchServerConn {
                    inner: stream,
                    keys,
                    outer: Some(outer),
                    inner_hello,
                    hpke_ctx,
                    read_buf,
                    read_pos: 0,
                    read_err: None,
                    partial: Vec::new(),
                    write_in: Vec::new(),
                    write_out: Vec::new(),
                    write_out_pos: 0,
                    retry_count: AtomicI32::new(0),
                    read_passthrough: passthrough,
                    write_passthrough: passthrough,
                })
            }
            Err(err) => {
                if !matches!(err, EchError::Io(_)) {
                    record::send_alert(&mut stream, &err).await;
                }
                Err(err)
            }
        }
    }

    async fn accept_inner(
        stream: &mut S,
        keys: &[EchKey],
    ) -> EchResult<(ClientHello, Option<ClientHello>, Option<EchReceiver>, Vec<u8>)> {
        let record = record::read_record(stream).await?;
        if record[0] != CONTENT_TYPE_HANDSHAKE {
            return Err(EchError::UnexpectedMessage(format!(
                "content type {} != 22",
                record[0]
            )));
        }
        let outer = ClientHello::parse(&record[5..])?;
        let mut hpke_ctx = None;
        let inner = match process_ech(keys, &mut hpke_ctx, None, &outer, false) {
            Ok(inner) => Some(inner),
            Err(EchError::NoMatch) => None,
            Err(e) => return Err(e),
        };
        tracing::debug!(
            target: "ech_tls::conn",
            accepted = inner.is_some(),
            server_name = %inner.as_ref().unwrap_or(&outer).server_name,
            "first ClientHello"
        );
        let read_buf = match &inner {
            Some(hello) => hello.marshal()?,
            None => outer.marshal()?,
        };
        Ok((outer, inner, hpke_ctx, read_buf))
    }

    /// Whether the client presented an Encrypted Client Hello.
    pub fn ech_presented(&self) -> bool {
        matches!(
            self.outer.as_ref().and_then(|o| o.ech_extension()),
            Some(EchExtension::Outer(_))
        )
    }

    /// Whether the Encrypted Client Hello was decrypted and validated.
    pub fn ech_accepted(&self) -> bool {
        self.inner_hello.is_some()
    }

    /// The SNI value: the inner ClientHello's when ECH was accepted, the
    /// outer's otherwise.
    pub fn server_name(&self) -> &str {
        if let Some(inner) = &self.inner_hello {
            return &inner.server_name;
        }
        self.outer
            .as_ref()
            .map(|o| o.server_name.as_str())
            .unwrap_or("")
    }

    /// The ALPN protocols, from the same hello as [`Self::server_name`].
    pub fn alpn_protos(&self) -> &[String] {
        if let Some(inner) = &self.inner_hello {
            return &inner.alpn_protos;
        }
        self.outer
            .as_ref()
            .map(|o| o.alpn_protos.as_slice())
            .unwrap_or(&[])
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Consumes the wrapper, returning the underlying stream. Buffered data
    /// is dropped.
    pub fn into_inner(self) -> S {
        self.inner
    }

    /// Accumulates one inbound TLS record, `None` on clean EOF at a record
    /// boundary.
    fn poll_fill_record(&mut self, cx: &mut Context<'_>) -> Poll<EchResult<Option<Vec<u8>>>> {
        loop {
            if self.partial.len() >= 5 {
                let length = u16::from_be_bytes([self.partial[3], self.partial[4]]) as usize;
                if length > MAX_RECORD_LEN {
                    return Poll::Ready(Err(EchError::Decode(format!(
                        "record length {length} > {MAX_RECORD_LEN}"
                    ))));
                }
                if self.partial.len() == 5 + length {
                    return Poll::Ready(Ok(Some(std::mem::take(&mut self.partial))));
                }
            }
            let target = if self.partial.len() < 5 {
                5
            } else {
                5 + u16::from_be_bytes([self.partial[3], self.partial[4]]) as usize
            };
            let need = target - self.partial.len();
            let mut tmp = [0u8; 4096];
            let mut rb = ReadBuf::new(&mut tmp[..need.min(4096)]);
            match Pin::new(&mut self.inner).poll_read(cx, &mut rb) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(EchError::Io(e))),
                Poll::Ready(Ok(())) => {
                    if rb.filled().is_empty() {
                        if self.partial.is_empty() {
                            return Poll::Ready(Ok(None));
                        }
                        return Poll::Ready(Err(EchError::Io(
                            io::ErrorKind::UnexpectedEof.into(),
                        )));
                    }
                    self.partial.extend_from_slice(rb.filled());
                }
            }
        }
    }

    /// Handles one inbound record, leaving the bytes to surface in
    /// `read_buf`.
    fn process_inbound(&mut self, record: Vec<u8>) -> EchResult<()> {
        let content_type = record[0];
        if content_type == CONTENT_TYPE_HANDSHAKE && record.len() > 5 {
            tracing::debug!(
                target: "ech_tls::conn",
                "read {}({}) {}",
                content_type_name(content_type),
                content_type,
                handshake_type_name(record[5])
            );
        } else {
            tracing::debug!(
                target: "ech_tls::conn",
                "read {}({})",
                content_type_name(content_type),
                content_type
            );
        }

        if content_type == CONTENT_TYPE_APPLICATION_DATA {
            self.read_passthrough = true;
            self.read_buf = record;
            self.read_pos = 0;
            return Ok(());
        }
        if content_type == CONTENT_TYPE_HANDSHAKE
            && record.len() > 5
            && record[5] == HANDSHAKE_CLIENT_HELLO
            && self.retry_count.load(Ordering::SeqCst) == 1
        {
            tracing::debug!(target: "ech_tls::conn", "retried ClientHello");
            let retried_outer = ClientHello::parse(&record[5..])?;
            let inner = match process_ech(
                &self.keys,
                &mut self.hpke_ctx,
                self.outer.as_ref(),
                &retried_outer,
                true,
            ) {
                Ok(inner) => Some(inner),
                Err(EchError::NoMatch) => None,
                Err(e) => return Err(e),
            };
            // 7.1.1: the retried inner must carry the same name and ALPN.
            match (inner, self.inner_hello.as_ref()) {
                (Some(new), Some(first))
                    if new.server_name == first.server_name
                        && new.alpn_protos == first.alpn_protos =>
                {
                    self.read_buf = new.marshal()?;
                    self.read_pos = 0;
                    return Ok(());
                }
                _ => {
                    return Err(EchError::IllegalParameter(
                        "retried ClientHello changed server_name or ALPN".into(),
                    ));
                }
            }
        }
        self.read_buf = record;
        self.read_pos = 0;
        Ok(())
    }

    /// Frames complete records out of `write_in`, inspecting each one.
    fn frame_outbound(&mut self) -> EchResult<()> {
        while self.write_in.len() >= 5 {
            let length = u16::from_be_bytes([self.write_in[3], self.write_in[4]]) as usize;
            if length > MAX_RECORD_LEN {
                return Err(EchError::Decode(format!(
                    "record length {length} > {MAX_RECORD_LEN}"
                )));
            }
            let sz = length + 5;
            if self.write_in.len() < sz {
                break;
            }
            let record: Vec<u8> = self.write_in.drain(..sz).collect();
            self.inspect_write(&record)?;
            self.write_out.extend_from_slice(&record);
        }
        Ok(())
    }

    fn inspect_write(&mut self, record: &[u8]) -> EchResult<()> {
        let content_type = record[0];
        if content_type == CONTENT_TYPE_HANDSHAKE && record.len() > 5 {
            tracing::debug!(
                target: "ech_tls::conn",
                "write {}({}) {}",
                content_type_name(content_type),
                content_type,
                handshake_type_name(record[5])
            );
        } else {
            tracing::debug!(
                target: "ech_tls::conn",
                "write {}({})",
                content_type_name(content_type),
                content_type
            );
        }
        if content_type == CONTENT_TYPE_APPLICATION_DATA {
            self.write_passthrough = true;
        } else if content_type == CONTENT_TYPE_HANDSHAKE
            && record.len() > 5
            && record[5] == HANDSHAKE_SERVER_HELLO
        {
            let hello = ServerHello::parse(&record[5..])
                .map_err(|e| EchError::Decode(format!("parse ServerHello: {e}")))?;
            if hello.is_hello_retry_request() {
                tracing::debug!(target: "ech_tls::conn", "HelloRetryRequest");
                self.retry_count.fetch_add(1, Ordering::SeqCst);
                // Handshake continues encrypted after the HRR; the write
                // side has nothing further to inspect.
                self.write_passthrough = true;
            }
        }
        Ok(())
    }

    /// Flushes framed records to the underlying stream.
    fn poll_flush_out(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        while self.write_out_pos < self.write_out.len() {
            match Pin::new(&mut self.inner)
                .poll_write(cx, &self.write_out[self.write_out_pos..])
            {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Ready(Ok(0)) => {
                    return Poll::Ready(Err(io::ErrorKind::WriteZero.into()))
                }
                Poll::Ready(Ok(n)) => self.write_out_pos += n,
            }
        }
        self.write_out.clear();
        self.write_out_pos = 0;
        Poll::Ready(Ok(()))
    }

    /// Queues a fatal alert for the peer; it goes out with the next flush.
    fn queue_alert(&mut self, err: &EchError) {
        self.write_out
            .extend_from_slice(&alert_record(err.alert_description()));
    }

    fn fail_read(&mut self, cx: &mut Context<'_>, err: EchError) -> io::Error {
        if !matches!(err, EchError::Io(_)) {
            self.queue_alert(&err);
            let _ = self.poll_flush_out(cx);
        }
        let io_err = err.into_io();
        self.read_err = Some((io_err.kind(), io_err.to_string()));
        io_err
    }
}

impl<S> AsyncRead for EchServerConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.read_pos < this.read_buf.len() {
                let n = buf.remaining().min(this.read_buf.len() - this.read_pos);
                buf.put_slice(&this.read_buf[this.read_pos..this.read_pos + n]);
                this.read_pos += n;
                if this.read_pos == this.read_buf.len() {
                    this.read_buf.clear();
                    this.read_pos = 0;
                }
                return Poll::Ready(Ok(()));
            }
            if let Some((kind, msg)) = &this.read_err {
                return Poll::Ready(Err(io::Error::new(*kind, msg.clone())));
            }
            if this.read_passthrough {
                return Pin::new(&mut this.inner).poll_read(cx, buf);
            }
            let record = match this.poll_fill_record(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Ok(Some(record))) => record,
                Poll::Ready(Ok(None)) => return Poll::Ready(Ok(())), // EOF
                Poll::Ready(Err(err)) => {
                    return Poll::Ready(Err(this.fail_read(cx, err)));
                }
            };
            if let Err(err) = this.process_inbound(record) {
                return Poll::Ready(Err(this.fail_read(cx, err)));
            }
        }
    }
}

impl<S> AsyncWrite for EchServerConn<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        // Drain previously framed records first; Pending here is
        // backpressure and nothing of `buf` is consumed yet.
        match this.poll_flush_out(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Ready(Ok(())) => {}
        }
        if this.write_passthrough && this.write_in.is_empty() {
            return Pin::new(&mut this.inner).poll_write(cx, buf);
        }
        this.write_in.extend_from_slice(buf);
        if let Err(err) = this.frame_outbound() {
            return Poll::Ready(Err(err.into_io()));
        }
        // Opportunistic flush; buffered bytes are already accounted for.
        match this.poll_flush_out(cx) {
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Ready(Ok(())) | Poll::Pending => {}
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.poll_flush_out(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Ready(Ok(())) => {}
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match this.poll_flush_out(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
            Poll::Ready(Ok(())) => {}
        }
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

/// Runs the Encrypted Client Hello processing for one outer ClientHello.
///
/// Returns the reconstructed inner hello, `Err(NoMatch)` when the connection
/// should fall through to outer-only passthrough, or a protocol error that
/// converts to a TLS alert.
fn process_ech(
    keys: &[EchKey],
    hpke_ctx: &mut Option<EchReceiver>,
    first_outer: Option<&ClientHello>,
    outer: &ClientHello,
    is_retry: bool,
) -> EchResult<ClientHello> {
    // ech_outer_extensions is only legal inside the encoded inner hello.
    if outer.has_ech_outer_extensions {
        return Err(EchError::IllegalParameter(
            "ClientHelloOuter has ech_outer_extensions".into(),
        ));
    }
    if !keys.is_empty() && matches!(outer.ech_ext, Some(EchExtension::Inner)) {
        return Err(EchError::IllegalParameter(
            "ClientHelloOuter has ECH type inner".into(),
        ));
    }
    if is_retry && outer.ech_ext.is_none() {
        return Err(EchError::MissingExtension(
            "retried ClientHello has no encrypted_client_hello".into(),
        ));
    }
    let ext = match &outer.ech_ext {
        Some(EchExtension::Outer(ext)) if outer.tls13 && !keys.is_empty() => ext,
        _ => return Err(EchError::NoMatch),
    };

    if is_retry {
        let first_ext = match first_outer.and_then(|o| o.ech_extension()) {
            Some(EchExtension::Outer(e)) => e,
            _ => return Err(EchError::NoMatch),
        };
        // 7.1.1: the retried outer must reference the same config and reuse
        // the established HPKE context (empty enc).
        if ext.config_id != first_ext.config_id
            || ext.kdf != first_ext.kdf
            || ext.aead != first_ext.aead
        {
            return Err(EchError::IllegalParameter(
                "retried ClientHello changed ECH config or cipher suite".into(),
            ));
        }
        if !ext.enc.is_empty() {
            return Err(EchError::IllegalParameter(
                "retried ClientHello has non-empty enc".into(),
            ));
        }
        let receiver = hpke_ctx
            .as_mut()
            .ok_or_else(|| EchError::Decrypt("no HPKE context for retry".into()))?;
        let aad = outer.marshal_aad()?;
        let inner_bytes = receiver
            .ctx
            .open(&aad, &ext.payload)
            .map_err(|_| EchError::Decrypt("retried ClientHello payload".into()))?;
        // The retried outer must still present the matched config's public
        // name as its SNI.
        if outer.server_name != receiver.public_name {
            return Err(EchError::IllegalParameter(
                "outer SNI does not match config public name".into(),
            ));
        }
        return decode_inner(outer, &inner_bytes);
    }

    for key in keys {
        let spec = key.spec()?;
        if spec.id != ext.config_id || !spec.supports_suite(ext.kdf, ext.aead) {
            continue;
        }
        if ext.enc.is_empty() {
            return Err(EchError::IllegalParameter("ECH enc is empty".into()));
        }
        let mut info = b"tls ech\x00".to_vec();
        info.extend_from_slice(&key.config);
        let mut ctx = match hpke::setup_receiver(
            spec.kem_id,
            ext.kdf,
            ext.aead,
            &key.private_key,
            &info,
            &ext.enc,
        ) {
            Ok(ctx) => ctx,
            Err(_) => continue,
        };
        let aad = outer.marshal_aad()?;
        let inner_bytes = match ctx.open(&aad, &ext.payload) {
            Ok(bytes) => bytes,
            // An AEAD failure is indistinguishable from a key mismatch.
            Err(_) => continue,
        };
        if outer.server_name != spec.public_name {
            return Err(EchError::IllegalParameter(
                "outer SNI does not match config public name".into(),
            ));
        }
        *hpke_ctx = Some(EchReceiver {
            ctx,
            public_name: spec.public_name,
        });
        return decode_inner(outer, &inner_bytes);
    }
    Err(EchError::NoMatch)
}

/// Wraps the decrypted EncodedClientHelloInner as a handshake message,
/// parses it, and reconstructs the real inner hello.
fn decode_inner(outer: &ClientHello, inner_bytes: &[u8]) -> EchResult<ClientHello> {
    let mut b = Builder::new();
    b.push_u8(0x01);
    b.u24_prefixed(|b| {
        b.push_bytes(inner_bytes);
        Ok(())
    })?;
    let msg = b.into_bytes();
    let mut inner = ClientHello::parse(&msg)?;
    if !matches!(inner.ech_ext, Some(EchExtension::Inner)) {
        return Err(EchError::IllegalParameter(
            "encrypted_client_hello missing in inner".into(),
        ));
    }
    // The encoded inner carries an empty session id; the real one echoes the
    // outer's.
    inner.legacy_session_id = outer.legacy_session_id.clone();
    expand_outer_extensions(&mut inner, outer)?;

    // Re-serialize and re-parse so the derived fields (SNI, ALPN, tls13)
    // reflect any substituted extensions.
    let m = inner.marshal()?;
    let inner = ClientHello::parse(&m[5..])?;
    if !inner.tls13 {
        return Err(EchError::IllegalParameter(
            "inner ClientHello does not offer TLS 1.3".into(),
        ));
    }
    Ok(inner)
}

/// Replaces `ech_outer_extensions` with the referenced extensions from the
/// outer hello, using the linear-time cursor of draft-ietf-tls-esni
/// Appendix B: the cursor over the outer list only advances, each referenced
/// extension is consumed once, and references that cannot be satisfied in
/// order are rejected.
fn expand_outer_extensions(inner: &mut ClientHello, outer: &ClientHello) -> EchResult<()> {
    let mut seen = false;
    let mut new_ext: Vec<Extension> = Vec::with_capacity(inner.extensions.len());
    let mut cursor = 0usize;
    for ext in &inner.extensions {
        if ext.typ != EXT_ECH_OUTER_EXTENSIONS {
            new_ext.push(ext.clone());
            continue;
        }
        if seen {
            return Err(EchError::IllegalParameter(
                "ech_outer_extensions appears more than once".into(),
            ));
        }
        seen = true;
        let mut s = Reader::new(&ext.data);
        let mut want = Reader::new(s.read_u8_prefixed()?);
        while !want.is_empty() {
            let typ = want.read_u16()?;
            if typ == EXT_ENCRYPTED_CLIENT_HELLO || typ == EXT_ECH_OUTER_EXTENSIONS {
                return Err(EchError::IllegalParameter(format!(
                    "ech_outer_extensions contains 0x{typ:04x}"
                )));
            }
            let mut found = false;
            while cursor < outer.extensions.len() {
                let p = cursor;
                cursor += 1;
                if outer.extensions[p].typ != typ {
                    continue;
                }
                new_ext.push(outer.extensions[p].clone());
                found = true;
                break;
            }
            if !found {
                return Err(EchError::IllegalParameter(format!(
                    "ech_outer_extensions 0x{typ:04x} not found"
                )));
            }
        }
    }
    inner.extensions = new_ext;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client_hello::Extension;

    fn hello_with_extensions(exts: Vec<Extension>) -> ClientHello {
        ClientHello {
            legacy_version: 0x0303,
            random: [1u8; 32],
            legacy_session_id: vec![],
            cipher_suites: vec![0x13, 0x01],
            legacy_compression_methods: vec![0],
            extensions: exts,
            server_name: String::new(),
            alpn_protos: vec![],
            tls13: false,
            has_ech_outer_extensions: false,
            ech_ext: None,
        }
    }

    fn eoe_ext(types: &[u16]) -> Extension {
        let mut b = Builder::new();
        b.u8_prefixed(|b| {
            for t in types {
                b.push_u16(*t);
            }
            Ok(())
        })
        .unwrap();
        Extension {
            typ: EXT_ECH_OUTER_EXTENSIONS,
            data: b.into_bytes(),
        }
    }

    fn ext(typ: u16, byte: u8) -> Extension {
        Extension {
            typ,
            data: vec![byte],
        }
    }

    #[test]
    fn expansion_substitutes_in_order() {
        let outer = hello_with_extensions(vec![ext(10, 1), ext(13, 2), ext(51, 3)]);
        let mut inner = hello_with_extensions(vec![ext(43, 9), eoe_ext(&[10, 51]), ext(45, 8)]);
        expand_outer_extensions(&mut inner, &outer).unwrap();
        assert_eq!(
            inner.extensions,
            vec![ext(43, 9), ext(10, 1), ext(51, 3), ext(45, 8)]
        );
    }

    #[test]
    fn expansion_rejects_out_of_order_references() {
        // The cursor only moves forward: referencing 51 then 10 cannot be
        // satisfied when the outer order is 10, 51.
        let outer = hello_with_extensions(vec![ext(10, 1), ext(51, 3)]);
        let mut inner = hello_with_extensions(vec![eoe_ext(&[51, 10])]);
        assert!(matches!(
            expand_outer_extensions(&mut inner, &outer),
            Err(EchError::IllegalParameter(_))
        ));
    }

    #[test]
    fn expansion_rejects_missing_reference() {
        let outer = hello_with_extensions(vec![ext(10, 1)]);
        let mut inner = hello_with_extensions(vec![eoe_ext(&[13])]);
        assert!(matches!(
            expand_outer_extensions(&mut inner, &outer),
            Err(EchError::IllegalParameter(_))
        ));
    }

    #[test]
    fn expansion_rejects_reserved_types() {
        let outer = hello_with_extensions(vec![ext(10, 1)]);
        for t in [EXT_ENCRYPTED_CLIENT_HELLO, EXT_ECH_OUTER_EXTENSIONS] {
            let mut inner = hello_with_extensions(vec![eoe_ext(&[t])]);
            assert!(matches!(
                expand_outer_extensions(&mut inner, &outer),
                Err(EchError::IllegalParameter(_))
            ));
        }
    }

    #[test]
    fn expansion_rejects_duplicate_eoe() {
        let outer = hello_with_extensions(vec![ext(10, 1), ext(13, 2)]);
        let mut inner = hello_with_extensions(vec![eoe_ext(&[10]), eoe_ext(&[13])]);
        assert!(matches!(
            expand_outer_extensions(&mut inner, &outer),
            Err(EchError::IllegalParameter(_))
        ));
    }

    #[test]
    fn expansion_matches_naive_scan_on_well_formed_input() {
        // On inputs whose references follow the outer order, the cursor walk
        // must agree with a naive per-reference scan.
        let outer = hello_with_extensions(vec![
            ext(10, 1),
            ext(13, 2),
            ext(16, 3),
            ext(51, 4),
        ]);
        let mut inner = hello_with_extensions(vec![eoe_ext(&[10, 16, 51])]);
        let mut naive: Vec<Extension> = Vec::new();
        for t in [10u16, 16, 51] {
            naive.push(
                outer
                    .extensions
                    .iter()
                    .find(|e| e.typ == t)
                    .cloned()
                    .unwrap(),
            );
        }
        expand_outer_extensions(&mut inner, &outer).unwrap();
        assert_eq!(inner.extensions, naive);
    }

    #[test]
    fn duplicate_outer_types_consumed_once() {
        // Two references to the same type consume two outer occurrences.
        let outer = hello_with_extensions(vec![ext(21, 1), ext(21, 2)]);
        let mut inner = hello_with_extensions(vec![eoe_ext(&[21, 21])]);
        expand_outer_extensions(&mut inner, &outer).unwrap();
        assert_eq!(inner.extensions, vec![ext(21, 1), ext(21, 2)]);

        // A third reference has nothing left to consume.
        let mut inner = hello_with_extensions(vec![eoe_ext(&[21, 21, 21])]);
        assert!(expand_outer_extensions(&mut inner, &outer).is_err());
    }
}
