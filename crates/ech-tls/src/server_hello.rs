//! ServerHello codec, just enough to sniff HelloRetryRequest on the write
//! path of the interceptor.

use ech_wire::{Builder, Reader};

use crate::client_hello::Extension;
use crate::record::HELLO_RETRY_REQUEST_RANDOM;
use crate::{EchError, EchResult};

/// A parsed ServerHello (RFC 8446 §4.1.3).
#[derive(Debug, Clone)]
pub struct ServerHello {
    pub legacy_version: u16,
    pub random: [u8; 32],
    pub legacy_session_id: Vec<u8>,
    pub cipher_suite: u16,
    pub legacy_compression_method: u8,
    pub extensions: Vec<Extension>,
}

impl ServerHello {
    /// Parses a Handshake message (starting at `msg_type`).
    pub fn parse(msg: &[u8]) -> EchResult<Self> {
        let mut s = Reader::new(msg);
        let msg_type = s.read_u8()?;
        if msg_type != 0x02 {
            return Err(EchError::UnexpectedMessage(format!(
                "msg_type 0x{msg_type:02x} != 0x02"
            )));
        }
        let body = s.read_u24_prefixed()?;

        let mut s = Reader::new(body);
        let legacy_version = s.read_u16()?;
        let mut random = [0u8; 32];
        random.copy_from_slice(s.read_exact(32)?);
        let legacy_session_id = s.read_u8_prefixed()?.to_vec();
        let cipher_suite = s.read_u16()?;
        let legacy_compression_method = s.read_u8()?;

        let mut extensions = Vec::new();
        let mut exts = Reader::new(s.read_u16_prefixed()?);
        while !exts.is_empty() {
            let typ = exts.read_u16()?;
            let data = exts.read_u16_prefixed()?.to_vec();
            extensions.push(Extension { typ, data });
        }

        Ok(ServerHello {
            legacy_version,
            random,
            legacy_session_id,
            cipher_suite,
            legacy_compression_method,
            extensions,
        })
    }

    /// Serializes the hello as a full TLS record.
    pub fn marshal(&self) -> EchResult<Vec<u8>> {
        let mut b = Builder::new();
        b.push_u8(0x16);
        b.push_u16(self.legacy_version);
        b.u16_prefixed(|b| {
            b.push_u8(0x02);
            b.u24_prefixed(|b| {
                b.push_u16(self.legacy_version);
                b.push_bytes(&self.random);
                b.u8_prefixed(|b| {
                    b.push_bytes(&self.legacy_session_id);
                    Ok(())
                })?;
                b.push_u16(self.cipher_suite);
                b.push_u8(self.legacy_compression_method);
                b.u16_prefixed(|b| {
                    for ext in &self.extensions {
                        b.push_u16(ext.typ);
                        b.u16_prefixed(|b| {
                            b.push_bytes(&ext.data);
                            Ok(())
                        })?;
                    }
                    Ok(())
                })
            })
        })?;
        Ok(b.into_bytes())
    }

    /// True iff `random` is the fixed HelloRetryRequest value.
    pub fn is_hello_retry_request(&self) -> bool {
        self.random == HELLO_RETRY_REQUEST_RANDOM
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(random: [u8; 32]) -> ServerHello {
        ServerHello {
            legacy_version: 0x0303,
            random,
            legacy_session_id: vec![1, 2, 3],
            cipher_suite: 0x1301,
            legacy_compression_method: 0,
            extensions: vec![Extension {
                typ: 43,
                data: vec![0x03, 0x04],
            }],
        }
    }

    #[test]
    fn roundtrip() {
        let hello = sample([9u8; 32]);
        let record = hello.marshal().unwrap();
        assert_eq!(record[0], 0x16);
        let parsed = ServerHello::parse(&record[5..]).unwrap();
        assert_eq!(parsed.random, hello.random);
        assert_eq!(parsed.cipher_suite, 0x1301);
        assert_eq!(parsed.extensions, hello.extensions);
        assert_eq!(parsed.marshal().unwrap(), record);
    }

    #[test]
    fn detects_hello_retry_request() {
        assert!(!sample([9u8; 32]).is_hello_retry_request());
        assert!(sample(HELLO_RETRY_REQUEST_RANDOM).is_hello_retry_request());
    }

    #[test]
    fn rejects_client_hello_msg_type() {
        let record = sample([0u8; 32]).marshal().unwrap();
        let mut msg = record[5..].to_vec();
        msg[0] = 0x01;
        assert!(matches!(
            ServerHello::parse(&msg),
            Err(EchError::UnexpectedMessage(_))
        ));
    }
}
