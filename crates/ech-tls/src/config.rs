//! ECH Config and ConfigList codec, plus key generation.
//!
//! ```text
//! struct {
//!     uint16 version;                         // 0xfe0d
//!     uint16 length;
//!     opaque public_key<1..2^16-1>;           // (contents, draft-ietf-tls-esni)
//!     HpkeSymmetricCipherSuite cipher_suites<4..2^16-4>;
//!     uint8 maximum_name_length;
//!     opaque public_name<1..2^8-1>;
//!     Extension extensions<0..2^16-1>;
//! } ECHConfig;
//!
//! ECHConfigList = uint16-prefixed concatenation of ECHConfigs
//! ```

use ech_wire::{Builder, Reader};
use x25519_dalek::{PublicKey, StaticSecret};

use crate::hpke::{
    AEAD_CHACHA20_POLY1305, DHKEM_X25519_HKDF_SHA256, KDF_HKDF_SHA256,
};
use crate::{EchError, EchResult};

/// The ECH config version this crate speaks (draft-13 and later).
pub const ECH_VERSION: u16 = 0xfe0d;

/// A server ECH key: the serialized config the client sees plus the matching
/// private key. Passed by value into the interceptor.
#[derive(Debug, Clone)]
pub struct EchKey {
    /// Serialized ECHConfig, as published in DNS.
    pub config: Vec<u8>,
    /// X25519 private key matching the config's public key.
    pub private_key: Vec<u8>,
    /// Whether this config should be offered in retry_configs.
    pub send_as_retry: bool,
}

impl EchKey {
    /// Parses the serialized config into its structured form.
    pub fn spec(&self) -> EchResult<EchConfig> {
        EchConfig::parse(&self.config)
    }
}

/// An HPKE symmetric cipher suite advertised in an ECH config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CipherSuite {
    pub kdf: u16,
    pub aead: u16,
}

/// The parsed form of one ECHConfig.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchConfig {
    pub version: u16,
    pub id: u8,
    pub kem_id: u16,
    pub public_key: Vec<u8>,
    pub cipher_suites: Vec<CipherSuite>,
    pub maximum_name_length: u8,
    pub public_name: String,
    pub extensions: Vec<u8>,
}

impl EchConfig {
    /// Parses a single serialized ECHConfig.
    pub fn parse(bytes: &[u8]) -> EchResult<Self> {
        let mut s = Reader::new(bytes);
        let version = s.read_u16()?;
        if version != ECH_VERSION {
            return Err(EchError::Decode(format!(
                "unsupported ECH version 0x{version:04x}"
            )));
        }
        let mut c = Reader::new(s.read_u16_prefixed()?);
        if !s.is_empty() {
            return Err(EchError::Decode("trailing bytes after ECHConfig".into()));
        }

        let id = c.read_u8()?;
        let kem_id = c.read_u16()?;
        let public_key = c.read_u16_prefixed()?.to_vec();

        let suites_bytes = c.read_u16_prefixed()?;
        if suites_bytes.is_empty() || suites_bytes.len() % 4 != 0 {
            return Err(EchError::Decode(format!(
                "invalid cipher_suites length {}",
                suites_bytes.len()
            )));
        }
        let mut suites = Reader::new(suites_bytes);
        let mut cipher_suites = Vec::with_capacity(suites_bytes.len() / 4);
        while !suites.is_empty() {
            cipher_suites.push(CipherSuite {
                kdf: suites.read_u16()?,
                aead: suites.read_u16()?,
            });
        }

        let maximum_name_length = c.read_u8()?;
        let public_name_bytes = c.read_u8_prefixed()?;
        if public_name_bytes.is_empty() {
            return Err(EchError::Decode("empty public_name".into()));
        }
        let public_name = String::from_utf8(public_name_bytes.to_vec())
            .map_err(|e| EchError::Decode(format!("public_name not UTF-8: {e}")))?;
        let extensions = c.read_u16_prefixed()?.to_vec();

        Ok(EchConfig {
            version,
            id,
            kem_id,
            public_key,
            cipher_suites,
            maximum_name_length,
            public_name,
            extensions,
        })
    }

    /// Serializes the config; `parse(serialize(c)) == c` and a parsed config
    /// re-serializes to its original bytes.
    pub fn serialize(&self) -> EchResult<Vec<u8>> {
        let mut b = Builder::new();
        b.push_u16(self.version);
        b.u16_prefixed(|b| {
            b.push_u8(self.id);
            b.push_u16(self.kem_id);
            b.u16_prefixed(|b| {
                b.push_bytes(&self.public_key);
                Ok(())
            })?;
            b.u16_prefixed(|b| {
                for suite in &self.cipher_suites {
                    b.push_u16(suite.kdf);
                    b.push_u16(suite.aead);
                }
                Ok(())
            })?;
            b.push_u8(self.maximum_name_length);
            b.u8_prefixed(|b| {
                b.push_bytes(self.public_name.as_bytes());
                Ok(())
            })?;
            b.u16_prefixed(|b| {
                b.push_bytes(&self.extensions);
                Ok(())
            })
        })?;
        Ok(b.into_bytes())
    }

    /// Whether this config offers the given symmetric suite.
    pub fn supports_suite(&self, kdf: u16, aead: u16) -> bool {
        self.cipher_suites.contains(&CipherSuite { kdf, aead })
    }
}

/// Generates a fresh X25519 keypair and a serialized ECHConfig for it with
/// the baseline suite (HKDF-SHA256 + ChaCha20-Poly1305). Returns
/// `(private_key, config)`.
pub fn new_config(id: u8, public_name: &str) -> EchResult<(Vec<u8>, Vec<u8>)> {
    let name_len = public_name.len();
    if name_len == 0 || name_len > 255 {
        return Err(EchError::IllegalParameter(format!(
            "invalid public name length {name_len}"
        )));
    }
    let private = StaticSecret::random_from_rng(rand::rngs::OsRng);
    let public = PublicKey::from(&private);

    let config = EchConfig {
        version: ECH_VERSION,
        id,
        kem_id: DHKEM_X25519_HKDF_SHA256,
        public_key: public.as_bytes().to_vec(),
        cipher_suites: vec![CipherSuite {
            kdf: KDF_HKDF_SHA256,
            aead: AEAD_CHACHA20_POLY1305,
        }],
        maximum_name_length: 0,
        public_name: public_name.to_string(),
        extensions: Vec::new(),
    };
    Ok((private.to_bytes().to_vec(), config.serialize()?))
}

/// Serializes an ECHConfigList from serialized configs.
pub fn config_list<C: AsRef<[u8]>>(configs: &[C]) -> EchResult<Vec<u8>> {
    let mut b = Builder::new();
    b.u16_prefixed(|b| {
        for config in configs {
            b.push_bytes(config.as_ref());
        }
        Ok(())
    })?;
    Ok(b.into_bytes())
}

/// Parses an ECHConfigList into structured configs.
pub fn parse_config_list(bytes: &[u8]) -> EchResult<Vec<EchConfig>> {
    let mut s = Reader::new(bytes);
    let list = s.read_u16_prefixed()?;
    if !s.is_empty() {
        return Err(EchError::Decode("trailing bytes after ECHConfigList".into()));
    }
    let mut configs = Vec::new();
    let mut s = Reader::new(list);
    while !s.is_empty() {
        // Each entry is version(2) + u16-prefixed contents.
        let start = s.position();
        s.skip(2)?;
        let len = s.read_u16()? as usize;
        s.skip(len)?;
        configs.push(EchConfig::parse(&list[start..start + 4 + len])?);
    }
    Ok(configs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_config_roundtrip() {
        let (private_key, config) = new_config(7, "public.example.com").unwrap();
        assert_eq!(private_key.len(), 32);

        let spec = EchConfig::parse(&config).unwrap();
        assert_eq!(spec.version, ECH_VERSION);
        assert_eq!(spec.id, 7);
        assert_eq!(spec.kem_id, DHKEM_X25519_HKDF_SHA256);
        assert_eq!(spec.public_key.len(), 32);
        assert_eq!(
            spec.cipher_suites,
            vec![CipherSuite {
                kdf: KDF_HKDF_SHA256,
                aead: AEAD_CHACHA20_POLY1305
            }]
        );
        assert_eq!(spec.public_name, "public.example.com");
        assert!(spec.extensions.is_empty());

        // serialize(parse(bytes)) is byte-identical
        assert_eq!(spec.serialize().unwrap(), config);
        assert_eq!(EchConfig::parse(&spec.serialize().unwrap()).unwrap(), spec);
    }

    #[test]
    fn new_config_validates_public_name() {
        assert!(new_config(1, "").is_err());
        assert!(new_config(1, &"a".repeat(256)).is_err());
        assert!(new_config(1, &"a".repeat(255)).is_ok());
    }

    #[test]
    fn config_list_roundtrip() {
        let (_, c1) = new_config(1, "a.example.com").unwrap();
        let (_, c2) = new_config(2, "b.example.com").unwrap();
        let list = config_list(&[&c1, &c2]).unwrap();
        assert_eq!(
            u16::from_be_bytes([list[0], list[1]]) as usize,
            list.len() - 2
        );
        let parsed = parse_config_list(&list).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0].id, 1);
        assert_eq!(parsed[1].id, 2);
        assert_eq!(parsed[1].public_name, "b.example.com");
    }

    #[test]
    fn rejects_unknown_version() {
        let (_, config) = new_config(1, "example.com").unwrap();
        let mut bad = config.clone();
        bad[0] = 0x00;
        bad[1] = 0x01;
        assert!(matches!(EchConfig::parse(&bad), Err(EchError::Decode(_))));
    }

    #[test]
    fn rejects_truncated_config() {
        let (_, config) = new_config(1, "example.com").unwrap();
        assert!(EchConfig::parse(&config[..config.len() - 1]).is_err());
        assert!(EchConfig::parse(&config[..6]).is_err());
    }

    #[test]
    fn rejects_empty_cipher_suites() {
        let (_, config) = new_config(1, "x").unwrap();
        let mut spec = EchConfig::parse(&config).unwrap();
        spec.cipher_suites.clear();
        let bytes = spec.serialize().unwrap();
        assert!(EchConfig::parse(&bytes).is_err());
    }

    #[test]
    fn key_spec_matches_config() {
        let (private_key, config) = new_config(3, "example.net").unwrap();
        let key = EchKey {
            config: config.clone(),
            private_key,
            send_as_retry: true,
        };
        let spec = key.spec().unwrap();
        assert_eq!(spec.id, 3);
        assert!(spec.supports_suite(KDF_HKDF_SHA256, AEAD_CHACHA20_POLY1305));
        assert!(!spec.supports_suite(KDF_HKDF_SHA256, 0x0001));
    }
}
