//! ClientHello codec.
//!
//! Parses and re-serializes TLS ClientHello messages (RFC 8446 §4.1.2),
//! preserving the original extension bytes so that an unmodified message
//! round-trips byte-identically. A second pass over the extensions derives
//! the fields the interceptor routes on: SNI, ALPN, supported_versions, and
//! the two ECH extensions:
//!
//! ```text
//! struct {
//!     ECHClientHelloType type;              // outer(0), inner(1)
//!     select (ECHClientHello.type) {
//!         case outer:
//!             HpkeSymmetricCipherSuite cipher_suite;
//!             uint8 config_id;
//!             opaque enc<0..2^16-1>;
//!             opaque payload<1..2^16-1>;
//!         case inner:
//!             Empty;
//!     };
//! } ECHClientHello;                          // extension type 0xfe0d
//! ```

use ech_wire::{Builder, Reader};

use crate::record::extension_name;
use crate::{EchError, EchResult};

/// The `encrypted_client_hello` extension type.
pub const EXT_ENCRYPTED_CLIENT_HELLO: u16 = 0xfe0d;
/// The `ech_outer_extensions` extension type, legal only inside the encoded
/// ClientHelloInner.
pub const EXT_ECH_OUTER_EXTENSIONS: u16 = 0xfd00;

const EXT_SERVER_NAME: u16 = 0;
const EXT_ALPN: u16 = 16;
const EXT_SUPPORTED_VERSIONS: u16 = 43;

/// A raw TLS extension, bytes preserved verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extension {
    pub typ: u16,
    pub data: Vec<u8>,
}

/// The parsed `encrypted_client_hello` extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EchExtension {
    /// `ECHClientHelloType.inner`: carried by the ClientHelloInner, no body.
    Inner,
    /// `ECHClientHelloType.outer`: carries the encrypted inner hello.
    Outer(EchOuterExt),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchOuterExt {
    pub kdf: u16,
    pub aead: u16,
    pub config_id: u8,
    pub enc: Vec<u8>,
    pub payload: Vec<u8>,
}

/// A parsed ClientHello (RFC 8446 §4.1.2).
#[derive(Debug, Clone)]
pub struct ClientHello {
    pub legacy_version: u16,
    pub random: [u8; 32],
    pub legacy_session_id: Vec<u8>,
    pub cipher_suites: Vec<u8>,
    pub legacy_compression_methods: Vec<u8>,
    /// Extensions in original order, bytes untouched.
    pub extensions: Vec<Extension>,

    /// SNI host name, empty if absent.
    pub server_name: String,
    pub alpn_protos: Vec<String>,

    pub(crate) tls13: bool,
    pub(crate) has_ech_outer_extensions: bool,
    pub(crate) ech_ext: Option<EchExtension>,
}

impl ClientHello {
    /// Parses a Handshake message (starting at `msg_type`). The caller strips
    /// the 5-byte record header first.
    pub fn parse(msg: &[u8]) -> EchResult<Self> {
        let mut s = Reader::new(msg);
        let msg_type = s.read_u8()?;
        if msg_type != 0x01 {
            return Err(EchError::UnexpectedMessage(format!(
                "msg_type 0x{msg_type:02x} != 0x01"
            )));
        }
        let body = s.read_u24_prefixed()?;
        // Bytes after the handshake body. A ClientHelloInner is zero-padded
        // to hide its length; anything else there is not allowed.
        let trailing = s.read_exact(s.remaining())?;

        let mut s = Reader::new(body);
        let legacy_version = s.read_u16()?;
        let mut random = [0u8; 32];
        random.copy_from_slice(s.read_exact(32)?);
        let legacy_session_id = s.read_u8_prefixed()?.to_vec();
        let cipher_suites = s.read_u16_prefixed()?.to_vec();
        let legacy_compression_methods = s.read_u8_prefixed()?.to_vec();

        let mut extensions = Vec::new();
        let mut exts = Reader::new(s.read_u16_prefixed()?);
        while !exts.is_empty() {
            let typ = exts.read_u16()?;
            let data = exts.read_u16_prefixed()?.to_vec();
            extensions.push(Extension { typ, data });
        }

        let mut hello = ClientHello {
            legacy_version,
            random,
            legacy_session_id,
            cipher_suites,
            legacy_compression_methods,
            extensions,
            server_name: String::new(),
            alpn_protos: Vec::new(),
            tls13: false,
            has_ech_outer_extensions: false,
            ech_ext: None,
        };
        hello.parse_extensions()?;

        if matches!(hello.ech_ext, Some(EchExtension::Inner)) && trailing.iter().any(|&b| b != 0)
        {
            return Err(EchError::IllegalParameter(
                "ClientHelloInner padding is not all zero".into(),
            ));
        }
        Ok(hello)
    }

    /// Serializes the hello as a full TLS record. A parsed, unmodified hello
    /// reproduces its input bytes exactly.
    pub fn marshal(&self) -> EchResult<Vec<u8>> {
        let mut b = Builder::new();
        b.push_u8(0x16);
        b.push_u16(self.legacy_version);
        b.u16_prefixed(|b| {
            b.push_u8(0x01);
            b.u24_prefixed(|b| self.build_body(b, false))
        })?;
        Ok(b.into_bytes())
    }

    /// The additional authenticated data for ECH decryption: the ClientHello
    /// structure (no record or handshake headers) with the bytes of the ECH
    /// payload replaced by zeros.
    pub fn marshal_aad(&self) -> EchResult<Vec<u8>> {
        let mut b = Builder::new();
        self.build_body(&mut b, true)?;
        Ok(b.into_bytes())
    }

    fn build_body(&self, b: &mut Builder, aad: bool) -> Result<(), ech_wire::WireError> {
        b.push_u16(self.legacy_version);
        b.push_bytes(&self.random);
        b.u8_prefixed(|b| {
            b.push_bytes(&self.legacy_session_id);
            Ok(())
        })?;
        b.u16_prefixed(|b| {
            b.push_bytes(&self.cipher_suites);
            Ok(())
        })?;
        b.u8_prefixed(|b| {
            b.push_bytes(&self.legacy_compression_methods);
            Ok(())
        })?;
        b.u16_prefixed(|b| {
            for ext in &self.extensions {
                b.push_u16(ext.typ);
                b.u16_prefixed(|b| {
                    if aad && ext.typ == EXT_ENCRYPTED_CLIENT_HELLO {
                        if let Some(EchExtension::Outer(outer)) = &self.ech_ext {
                            let n = ext.data.len() - outer.payload.len();
                            b.push_bytes(&ext.data[..n]);
                            b.push_bytes(&vec![0u8; outer.payload.len()]);
                            return Ok(());
                        }
                    }
                    b.push_bytes(&ext.data);
                    Ok(())
                })?;
            }
            Ok(())
        })
    }

    /// Second pass: derive SNI, ALPN, supported_versions, and the ECH
    /// extensions from the raw extension list.
    pub(crate) fn parse_extensions(&mut self) -> EchResult<()> {
        self.server_name.clear();
        self.alpn_protos.clear();
        self.tls13 = false;
        self.has_ech_outer_extensions = false;
        self.ech_ext = None;

        for ext in &self.extensions {
            let mut data = Reader::new(&ext.data);
            match ext.typ {
                EXT_SERVER_NAME => {
                    // RFC 6066 §3: ServerNameList of (name_type, host_name).
                    let mut list = Reader::new(data.read_u16_prefixed()?);
                    while !list.is_empty() {
                        let name_type = list.read_u8()?;
                        if name_type != 0 {
                            return Err(EchError::IllegalParameter(format!(
                                "invalid nametype 0x{name_type:02x}"
                            )));
                        }
                        let host_name = list.read_u16_prefixed()?;
                        if !self.server_name.is_empty() {
                            return Err(EchError::Decode("multiple host names".into()));
                        }
                        self.server_name = String::from_utf8_lossy(host_name).into_owned();
                    }
                }
                EXT_ALPN => {
                    // RFC 7301 §3: ProtocolNameList of u8-prefixed names.
                    let mut list = Reader::new(data.read_u16_prefixed()?);
                    while !list.is_empty() {
                        let proto = list.read_u8_prefixed()?;
                        self.alpn_protos
                            .push(String::from_utf8_lossy(proto).into_owned());
                    }
                }
                EXT_SUPPORTED_VERSIONS => {
                    let mut versions = Reader::new(data.read_u8_prefixed()?);
                    while !versions.is_empty() {
                        if versions.read_u16()? >= 0x0304 {
                            self.tls13 = true;
                        }
                    }
                }
                EXT_ECH_OUTER_EXTENSIONS => {
                    self.has_ech_outer_extensions = true;
                }
                EXT_ENCRYPTED_CLIENT_HELLO => {
                    let ech_type = data.read_u8()?;
                    // Section 7: an invalid ECHClientHelloType aborts the
                    // handshake with illegal_parameter.
                    match ech_type {
                        0 => {
                            let kdf = data.read_u16()?;
                            let aead = data.read_u16()?;
                            let config_id = data.read_u8()?;
                            let enc = data.read_u16_prefixed()?.to_vec();
                            let payload = data.read_u16_prefixed()?.to_vec();
                            self.ech_ext = Some(EchExtension::Outer(EchOuterExt {
                                kdf,
                                aead,
                                config_id,
                                enc,
                                payload,
                            }));
                        }
                        1 => self.ech_ext = Some(EchExtension::Inner),
                        t => {
                            return Err(EchError::IllegalParameter(format!("ech type {t}")));
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Whether the hello offers TLS 1.3 in supported_versions.
    pub fn is_tls13(&self) -> bool {
        self.tls13
    }

    pub fn ech_extension(&self) -> Option<&EchExtension> {
        self.ech_ext.as_ref()
    }
}

impl std::fmt::Display for ClientHello {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "LegacyVersion: 0x{:04x}", self.legacy_version)?;
        writeln!(f, "ServerName: {}", self.server_name)?;
        writeln!(f, "ALPNProtos: {:?}", self.alpn_protos)?;
        writeln!(f, "Extensions:")?;
        for ext in &self.extensions {
            writeln!(
                f,
                "  {}({}): {} bytes",
                extension_name(ext.typ),
                ext.typ,
                ext.data.len()
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ech_wire::Builder;

    fn sample_hello(extensions: &[(u16, Vec<u8>)]) -> Vec<u8> {
        let mut b = Builder::new();
        b.push_u8(0x16);
        b.push_u16(0x0303);
        b.u16_prefixed(|b| {
            b.push_u8(0x01);
            b.u24_prefixed(|b| {
                b.push_u16(0x0303);
                b.push_bytes(&[7u8; 32]);
                b.u8_prefixed(|b| {
                    b.push_bytes(&[1, 2, 3, 4]);
                    Ok(())
                })?;
                b.u16_prefixed(|b| {
                    b.push_bytes(&[0x13, 0x01, 0x13, 0x03]);
                    Ok(())
                })?;
                b.u8_prefixed(|b| {
                    b.push_u8(0);
                    Ok(())
                })?;
                b.u16_prefixed(|b| {
                    for (typ, data) in extensions {
                        b.push_u16(*typ);
                        b.u16_prefixed(|b| {
                            b.push_bytes(data);
                            Ok(())
                        })?;
                    }
                    Ok(())
                })
            })
        })
        .unwrap();
        b.into_bytes()
    }

    fn sni_ext(name: &str) -> Vec<u8> {
        let mut b = Builder::new();
        b.u16_prefixed(|b| {
            b.push_u8(0);
            b.u16_prefixed(|b| {
                b.push_bytes(name.as_bytes());
                Ok(())
            })
        })
        .unwrap();
        b.into_bytes()
    }

    #[test]
    fn parse_marshal_fixed_point() {
        let record = sample_hello(&[
            (0, sni_ext("www.example.com")),
            (43, vec![0x02, 0x03, 0x04]),
            (16, {
                let mut b = Builder::new();
                b.u16_prefixed(|b| {
                    b.u8_prefixed(|b| {
                        b.push_bytes(b"h2");
                        Ok(())
                    })
                })
                .unwrap();
                b.into_bytes()
            }),
        ]);
        let hello = ClientHello::parse(&record[5..]).unwrap();
        assert_eq!(hello.server_name, "www.example.com");
        assert_eq!(hello.alpn_protos, vec!["h2".to_string()]);
        assert!(hello.is_tls13());
        let out = hello.marshal().unwrap();
        assert_eq!(out, record);
        // parse(serialize(x)) is a fixed point
        let again = ClientHello::parse(&out[5..]).unwrap();
        assert_eq!(again.marshal().unwrap(), record);
    }

    #[test]
    fn rejects_wrong_msg_type() {
        let record = sample_hello(&[]);
        let mut msg = record[5..].to_vec();
        msg[0] = 0x02;
        assert!(matches!(
            ClientHello::parse(&msg),
            Err(EchError::UnexpectedMessage(_))
        ));
    }

    #[test]
    fn rejects_truncated() {
        let record = sample_hello(&[(0, sni_ext("example.com"))]);
        let msg = &record[5..record.len() - 3];
        assert!(matches!(ClientHello::parse(msg), Err(EchError::Decode(_))));
    }

    #[test]
    fn rejects_bad_sni_name_type() {
        let mut b = Builder::new();
        b.u16_prefixed(|b| {
            b.push_u8(1); // not host_name
            b.u16_prefixed(|b| {
                b.push_bytes(b"x");
                Ok(())
            })
        })
        .unwrap();
        let record = sample_hello(&[(0, b.into_bytes())]);
        assert!(matches!(
            ClientHello::parse(&record[5..]),
            Err(EchError::IllegalParameter(_))
        ));
    }

    #[test]
    fn parses_ech_outer_extension() {
        let mut b = Builder::new();
        b.push_u8(0x00); // outer
        b.push_u16(0x0001);
        b.push_u16(0x0003);
        b.push_u8(9);
        b.u16_prefixed(|b| {
            b.push_bytes(&[0xaa; 32]);
            Ok(())
        })
        .unwrap();
        b.u16_prefixed(|b| {
            b.push_bytes(&[0xbb; 40]);
            Ok(())
        })
        .unwrap();
        let record = sample_hello(&[(EXT_ENCRYPTED_CLIENT_HELLO, b.into_bytes())]);
        let hello = ClientHello::parse(&record[5..]).unwrap();
        match hello.ech_extension() {
            Some(EchExtension::Outer(outer)) => {
                assert_eq!(outer.kdf, 0x0001);
                assert_eq!(outer.aead, 0x0003);
                assert_eq!(outer.config_id, 9);
                assert_eq!(outer.enc.len(), 32);
                assert_eq!(outer.payload.len(), 40);
            }
            other => panic!("ech_ext = {other:?}"),
        }
    }

    #[test]
    fn rejects_invalid_ech_type() {
        let record = sample_hello(&[(EXT_ENCRYPTED_CLIENT_HELLO, vec![0x02])]);
        assert!(matches!(
            ClientHello::parse(&record[5..]),
            Err(EchError::IllegalParameter(_))
        ));
    }

    #[test]
    fn inner_padding_must_be_zero() {
        // Build an inner hello, then append a non-zero byte after the body.
        let record = sample_hello(&[(EXT_ENCRYPTED_CLIENT_HELLO, vec![0x01])]);
        let mut msg = record[5..].to_vec();
        msg.push(0x00);
        assert!(ClientHello::parse(&msg).is_ok());
        msg.push(0x01);
        assert!(matches!(
            ClientHello::parse(&msg),
            Err(EchError::IllegalParameter(_))
        ));
    }

    #[test]
    fn aad_zeroes_payload_only() {
        let mut b = Builder::new();
        b.push_u8(0x00);
        b.push_u16(0x0001);
        b.push_u16(0x0003);
        b.push_u8(1);
        b.u16_prefixed(|b| {
            b.push_bytes(&[0xaa; 4]);
            Ok(())
        })
        .unwrap();
        b.u16_prefixed(|b| {
            b.push_bytes(&[0xbb; 8]);
            Ok(())
        })
        .unwrap();
        let ech_data = b.into_bytes();
        let record = sample_hello(&[(EXT_ENCRYPTED_CLIENT_HELLO, ech_data.clone())]);
        let hello = ClientHello::parse(&record[5..]).unwrap();

        let aad = hello.marshal_aad().unwrap();
        // AAD is the body only: record (5) + handshake (4) headers stripped.
        assert_eq!(aad.len(), record.len() - 9);
        let marshaled = hello.marshal().unwrap();
        assert_eq!(&marshaled[9..marshaled.len() - 8], &aad[..aad.len() - 8]);
        assert_eq!(&aad[aad.len() - 8..], &[0u8; 8]);
    }
}
