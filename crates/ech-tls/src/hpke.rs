//! HPKE (RFC 9180) for ECH: DHKEM(X25519, HKDF-SHA256) key encapsulation,
//! the labeled HKDF-SHA256 key schedule, and sequence-numbered AEAD
//! contexts.
//!
//! The receiver side is what the split-mode server needs to open ECH
//! payloads; the sender side exists for clients that synthesize a config
//! list (grease / public-name probing) and for tests that build outer
//! ClientHellos. A context is stateful: its sequence number advances on
//! every successful seal/open, which is what lets the same receiver open
//! both the first and the retried ClientHello on one connection.

use aes_gcm::{Aes128Gcm, Aes256Gcm};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::ChaCha20Poly1305;
use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::{EchError, EchResult};

/// DHKEM(X25519, HKDF-SHA256)
pub const DHKEM_X25519_HKDF_SHA256: u16 = 0x0020;
/// HKDF-SHA256
pub const KDF_HKDF_SHA256: u16 = 0x0001;
/// AES-128-GCM
pub const AEAD_AES_128_GCM: u16 = 0x0001;
/// AES-256-GCM
pub const AEAD_AES_256_GCM: u16 = 0x0002;
/// ChaCha20-Poly1305
pub const AEAD_CHACHA20_POLY1305: u16 = 0x0003;

const NONCE_LEN: usize = 12;
const KEM_SHARED_SECRET_LEN: usize = 32;

/// An established HPKE encryption context (RFC 9180 §5.2).
pub struct HpkeContext {
    key: Vec<u8>,
    base_nonce: [u8; NONCE_LEN],
    seq: u64,
    aead: u16,
}

impl std::fmt::Debug for HpkeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of debug output.
        f.debug_struct("HpkeContext")
            .field("aead", &self.aead)
            .field("seq", &self.seq)
            .finish()
    }
}

/// Sets up a receiver context from the recipient private key and the
/// sender's encapsulated key (RFC 9180 §5.1, mode_base).
pub fn setup_receiver(
    kem: u16,
    kdf: u16,
    aead: u16,
    private_key: &[u8],
    info: &[u8],
    enc: &[u8],
) -> EchResult<HpkeContext> {
    check_suite(kem, kdf, aead)?;
    let sk = x25519_secret(private_key)?;
    let pk_r = PublicKey::from(&sk);
    let enc_pk = x25519_public(enc)?;

    let dh = sk.diffie_hellman(&enc_pk);
    if !dh.was_contributory() {
        return Err(EchError::Hpke("non-contributory X25519 share".into()));
    }
    let mut kem_context = Vec::with_capacity(64);
    kem_context.extend_from_slice(enc);
    kem_context.extend_from_slice(pk_r.as_bytes());
    let shared_secret = extract_and_expand(kem, dh.as_bytes(), &kem_context);

    key_schedule(kem, kdf, aead, &shared_secret, info)
}

/// Sets up a sender context for the recipient public key, returning the
/// encapsulated key and the context.
pub fn setup_sender(
    kem: u16,
    kdf: u16,
    aead: u16,
    public_key: &[u8],
    info: &[u8],
) -> EchResult<(Vec<u8>, HpkeContext)> {
    check_suite(kem, kdf, aead)?;
    let pk_r = x25519_public(public_key)?;

    let eph = StaticSecret::random_from_rng(rand::rngs::OsRng);
    let enc = PublicKey::from(&eph);

    let dh = eph.diffie_hellman(&pk_r);
    if !dh.was_contributory() {
        return Err(EchError::Hpke("non-contributory X25519 share".into()));
    }
    let mut kem_context = Vec::with_capacity(64);
    kem_context.extend_from_slice(enc.as_bytes());
    kem_context.extend_from_slice(public_key);
    let shared_secret = extract_and_expand(kem, dh.as_bytes(), &kem_context);

    let ctx = key_schedule(kem, kdf, aead, &shared_secret, info)?;
    Ok((enc.as_bytes().to_vec(), ctx))
}

impl HpkeContext {
    /// Authenticated decryption. Advances the sequence number on success.
    pub fn open(&mut self, aad: &[u8], ciphertext: &[u8]) -> EchResult<Vec<u8>> {
        let nonce = self.compute_nonce();
        let payload = Payload {
            msg: ciphertext,
            aad,
        };
        let plaintext = match self.aead {
            AEAD_AES_128_GCM => Aes128Gcm::new_from_slice(&self.key)
                .map_err(|e| EchError::Hpke(format!("bad key length: {e}")))?
                .decrypt(aes_gcm::Nonce::from_slice(&nonce), payload),
            AEAD_AES_256_GCM => Aes256Gcm::new_from_slice(&self.key)
                .map_err(|e| EchError::Hpke(format!("bad key length: {e}")))?
                .decrypt(aes_gcm::Nonce::from_slice(&nonce), payload),
            AEAD_CHACHA20_POLY1305 => ChaCha20Poly1305::new_from_slice(&self.key)
                .map_err(|e| EchError::Hpke(format!("bad key length: {e}")))?
                .decrypt(chacha20poly1305::Nonce::from_slice(&nonce), payload),
            id => return Err(EchError::Hpke(format!("unsupported AEAD 0x{id:04x}"))),
        }
        .map_err(|_| EchError::Decrypt("aead open failed".into()))?;
        self.seq += 1;
        Ok(plaintext)
    }

    /// Authenticated encryption. Advances the sequence number on success.
    pub fn seal(&mut self, aad: &[u8], plaintext: &[u8]) -> EchResult<Vec<u8>> {
        let nonce = self.compute_nonce();
        let payload = Payload {
            msg: plaintext,
            aad,
        };
        let ciphertext = match self.aead {
            AEAD_AES_128_GCM => Aes128Gcm::new_from_slice(&self.key)
                .map_err(|e| EchError::Hpke(format!("bad key length: {e}")))?
                .encrypt(aes_gcm::Nonce::from_slice(&nonce), payload),
            AEAD_AES_256_GCM => Aes256Gcm::new_from_slice(&self.key)
                .map_err(|e| EchError::Hpke(format!("bad key length: {e}")))?
                .encrypt(aes_gcm::Nonce::from_slice(&nonce), payload),
            AEAD_CHACHA20_POLY1305 => ChaCha20Poly1305::new_from_slice(&self.key)
                .map_err(|e| EchError::Hpke(format!("bad key length: {e}")))?
                .encrypt(chacha20poly1305::Nonce::from_slice(&nonce), payload),
            id => return Err(EchError::Hpke(format!("unsupported AEAD 0x{id:04x}"))),
        }
        .map_err(|_| EchError::Hpke("aead seal failed".into()))?;
        self.seq += 1;
        Ok(ciphertext)
    }

    /// base_nonce XOR I2OSP(seq, Nn)  (RFC 9180 §5.2)
    fn compute_nonce(&self) -> [u8; NONCE_LEN] {
        let mut nonce = self.base_nonce;
        let seq = self.seq.to_be_bytes();
        for i in 0..seq.len() {
            nonce[NONCE_LEN - seq.len() + i] ^= seq[i];
        }
        nonce
    }
}

fn check_suite(kem: u16, kdf: u16, aead: u16) -> EchResult<()> {
    if kem != DHKEM_X25519_HKDF_SHA256 {
        return Err(EchError::Hpke(format!("unsupported KEM 0x{kem:04x}")));
    }
    if kdf != KDF_HKDF_SHA256 {
        return Err(EchError::Hpke(format!("unsupported KDF 0x{kdf:04x}")));
    }
    key_len(aead).map(|_| ())
}

fn key_len(aead: u16) -> EchResult<usize> {
    match aead {
        AEAD_AES_128_GCM => Ok(16),
        AEAD_AES_256_GCM => Ok(32),
        AEAD_CHACHA20_POLY1305 => Ok(32),
        id => Err(EchError::Hpke(format!("unsupported AEAD 0x{id:04x}"))),
    }
}

fn x25519_secret(bytes: &[u8]) -> EchResult<StaticSecret> {
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| EchError::Hpke(format!("invalid private key length: {}", bytes.len())))?;
    Ok(StaticSecret::from(arr))
}

fn x25519_public(bytes: &[u8]) -> EchResult<PublicKey> {
    let arr: [u8; 32] = bytes
        .try_into()
        .map_err(|_| EchError::Hpke(format!("invalid public key length: {}", bytes.len())))?;
    Ok(PublicKey::from(arr))
}

/// `ExtractAndExpand` for the KEM shared secret (RFC 9180 §4.1).
fn extract_and_expand(kem: u16, dh: &[u8], kem_context: &[u8]) -> Vec<u8> {
    let suite_id = kem_suite_id(kem);
    let eae_prk = labeled_extract(&suite_id, b"", b"eae_prk", dh);
    labeled_expand(
        &suite_id,
        &eae_prk,
        b"shared_secret",
        kem_context,
        KEM_SHARED_SECRET_LEN,
    )
}

/// `KeySchedule` for mode_base (RFC 9180 §5.1). No PSK.
fn key_schedule(
    kem: u16,
    kdf: u16,
    aead: u16,
    shared_secret: &[u8],
    info: &[u8],
) -> EchResult<HpkeContext> {
    const MODE_BASE: u8 = 0x00;
    let suite_id = hpke_suite_id(kem, kdf, aead);

    let psk_id_hash = labeled_extract(&suite_id, b"", b"psk_id_hash", b"");
    let info_hash = labeled_extract(&suite_id, b"", b"info_hash", info);
    let mut ks_context = Vec::with_capacity(1 + psk_id_hash.len() + info_hash.len());
    ks_context.push(MODE_BASE);
    ks_context.extend_from_slice(&psk_id_hash);
    ks_context.extend_from_slice(&info_hash);

    let secret = labeled_extract(&suite_id, shared_secret, b"secret", b"");
    let key = labeled_expand(&suite_id, &secret, b"key", &ks_context, key_len(aead)?);
    let base_nonce_vec = labeled_expand(&suite_id, &secret, b"base_nonce", &ks_context, NONCE_LEN);
    let mut base_nonce = [0u8; NONCE_LEN];
    base_nonce.copy_from_slice(&base_nonce_vec);

    Ok(HpkeContext {
        key,
        base_nonce,
        seq: 0,
        aead,
    })
}

fn kem_suite_id(kem: u16) -> Vec<u8> {
    let mut id = b"KEM".to_vec();
    id.extend_from_slice(&kem.to_be_bytes());
    id
}

fn hpke_suite_id(kem: u16, kdf: u16, aead: u16) -> Vec<u8> {
    let mut id = b"HPKE".to_vec();
    id.extend_from_slice(&kem.to_be_bytes());
    id.extend_from_slice(&kdf.to_be_bytes());
    id.extend_from_slice(&aead.to_be_bytes());
    id
}

fn labeled_extract(suite_id: &[u8], salt: &[u8], label: &[u8], ikm: &[u8]) -> [u8; 32] {
    let mut labeled_ikm = b"HPKE-v1".to_vec();
    labeled_ikm.extend_from_slice(suite_id);
    labeled_ikm.extend_from_slice(label);
    labeled_ikm.extend_from_slice(ikm);
    let (prk, _) = Hkdf::<Sha256>::extract(Some(salt), &labeled_ikm);
    prk.into()
}

fn labeled_expand(suite_id: &[u8], prk: &[u8], label: &[u8], info: &[u8], len: usize) -> Vec<u8> {
    let mut labeled_info = (len as u16).to_be_bytes().to_vec();
    labeled_info.extend_from_slice(b"HPKE-v1");
    labeled_info.extend_from_slice(suite_id);
    labeled_info.extend_from_slice(label);
    labeled_info.extend_from_slice(info);
    let hk = Hkdf::<Sha256>::from_prk(prk).expect("prk is hash-sized");
    let mut okm = vec![0u8; len];
    hk.expand(&labeled_info, &mut okm)
        .expect("okm length within HKDF bounds");
    okm
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unhex(s: &str) -> Vec<u8> {
        (0..s.len())
            .step_by(2)
            .map(|i| u8::from_str_radix(&s[i..i + 2], 16).unwrap())
            .collect()
    }

    // RFC 9180 A.1: DHKEM(X25519, HKDF-SHA256), HKDF-SHA256, AES-128-GCM,
    // base mode.
    #[test]
    fn rfc9180_a1_receiver_vector() {
        let info = unhex("4f6465206f6e2061204772656369616e2055726e");
        let sk_r = unhex("4612c550263fc8ad58375df3f557aac531d26850903e55a9f23f21d8534e8ac8");
        let enc = unhex("37fda3567bdbd628e88668c3c8d7e97d1d1253b6d4ea6d44c150f741f1bf4431");

        let mut ctx = setup_receiver(
            DHKEM_X25519_HKDF_SHA256,
            KDF_HKDF_SHA256,
            AEAD_AES_128_GCM,
            &sk_r,
            &info,
            &enc,
        )
        .unwrap();
        assert_eq!(ctx.key, unhex("4531685d41d65f03dc48f6b8302c05b0"));
        assert_eq!(ctx.base_nonce.to_vec(), unhex("56d890e5accaaf011cff4b7d"));

        let aad = unhex("436f756e742d30"); // "Count-0"
        let ct = unhex(
            "f938558b5d72f1a23810b4be2ab4f84331acc02fc97babc53a52ae8218a355a9\
             6d8770ac83d07bea87e13c512a",
        );
        let pt = ctx.open(&aad, &ct).unwrap();
        assert_eq!(
            pt,
            unhex("4265617574792069732074727574682c20747275746820626561757479")
        );
        assert_eq!(ctx.seq, 1);
    }

    #[test]
    fn seal_open_roundtrip_all_aeads() {
        for aead in [
            AEAD_AES_128_GCM,
            AEAD_AES_256_GCM,
            AEAD_CHACHA20_POLY1305,
        ] {
            let sk = StaticSecret::random_from_rng(rand::rngs::OsRng);
            let pk = PublicKey::from(&sk);

            let (enc, mut sender) = setup_sender(
                DHKEM_X25519_HKDF_SHA256,
                KDF_HKDF_SHA256,
                aead,
                pk.as_bytes(),
                b"test info",
            )
            .unwrap();
            assert_eq!(enc.len(), 32);

            let mut receiver = setup_receiver(
                DHKEM_X25519_HKDF_SHA256,
                KDF_HKDF_SHA256,
                aead,
                sk.to_bytes().as_slice(),
                b"test info",
                &enc,
            )
            .unwrap();

            // Sequence numbers advance in lockstep across multiple messages.
            for i in 0..3u8 {
                let pt = vec![i; 20 + i as usize];
                let ct = sender.seal(b"aad", &pt).unwrap();
                assert_eq!(receiver.open(b"aad", &ct).unwrap(), pt);
            }
        }
    }

    #[test]
    fn open_fails_on_wrong_aad() {
        let sk = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let pk = PublicKey::from(&sk);
        let (enc, mut sender) = setup_sender(
            DHKEM_X25519_HKDF_SHA256,
            KDF_HKDF_SHA256,
            AEAD_CHACHA20_POLY1305,
            pk.as_bytes(),
            b"info",
        )
        .unwrap();
        let mut receiver = setup_receiver(
            DHKEM_X25519_HKDF_SHA256,
            KDF_HKDF_SHA256,
            AEAD_CHACHA20_POLY1305,
            sk.to_bytes().as_slice(),
            b"info",
            &enc,
        )
        .unwrap();
        let ct = sender.seal(b"aad", b"secret").unwrap();
        let err = receiver.open(b"other aad", &ct).unwrap_err();
        assert!(matches!(err, EchError::Decrypt(_)));
        // A failed open does not advance the sequence number.
        assert_eq!(receiver.seq, 0);
        assert_eq!(receiver.open(b"aad", &ct).unwrap(), b"secret");
    }

    #[test]
    fn rejects_unsupported_suite() {
        let sk = [1u8; 32];
        assert!(setup_receiver(0x0010, KDF_HKDF_SHA256, AEAD_AES_128_GCM, &sk, b"", &[0; 32])
            .is_err());
        assert!(setup_receiver(
            DHKEM_X25519_HKDF_SHA256,
            0x0002,
            AEAD_AES_128_GCM,
            &sk,
            b"",
            &[0; 32]
        )
        .is_err());
        assert!(setup_receiver(
            DHKEM_X25519_HKDF_SHA256,
            KDF_HKDF_SHA256,
            0x0004,
            &sk,
            b"",
            &[0; 32]
        )
        .is_err());
    }

    #[test]
    fn rejects_bad_key_lengths() {
        assert!(setup_receiver(
            DHKEM_X25519_HKDF_SHA256,
            KDF_HKDF_SHA256,
            AEAD_AES_128_GCM,
            &[0u8; 16],
            b"",
            &[0u8; 32],
        )
        .is_err());
        assert!(setup_receiver(
            DHKEM_X25519_HKDF_SHA256,
            KDF_HKDF_SHA256,
            AEAD_AES_128_GCM,
            &[1u8; 32],
            b"",
            &[0u8; 16],
        )
        .is_err());
    }
}
