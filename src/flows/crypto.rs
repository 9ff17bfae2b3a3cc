//! Hybrid envelope codec for the structured-form transport: RSA-OAEP(SHA-256)
//! wraps a per-request AES-128 key, payloads are AES-128-GCM with a 16-byte IV
//! and the 16-byte tag appended to the ciphertext. Responses reuse the key with
//! every IV byte inverted.

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes128;
use aes_gcm::{AesGcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::DecodePrivateKey;
use rsa::{Oaep, RsaPrivateKey};
use serde::Deserialize;
use sha2::Sha256;
use thiserror::Error;

pub const KEY_LEN: usize = 16;
pub const IV_LEN: usize = 16;
pub const TAG_LEN: usize = 16;

type Aes128Gcm16 = AesGcm<Aes128, U16>;

/// Decryption errors are deliberately coarse; callers answer all of them the
/// same way.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FlowCryptoError {
    #[error("invalid private key")]
    InvalidPrivateKey,
    #[error("malformed envelope")]
    Malformed,
    #[error("envelope could not be decrypted")]
    Decrypt,
    #[error("response could not be encrypted")]
    Encrypt,
}

/// Wire shape of an inbound request.
#[derive(Debug, Clone, Deserialize)]
pub struct EncryptedEnvelope {
    pub encrypted_flow_data: String,
    pub encrypted_aes_key: String,
    pub initial_vector: String,
}

/// Key material for one request, needed again to seal the response.
#[derive(Clone)]
pub struct SessionKey {
    key: [u8; KEY_LEN],
    iv: [u8; IV_LEN],
}

impl SessionKey {
    pub fn new(key: [u8; KEY_LEN], iv: [u8; IV_LEN]) -> Self {
        Self { key, iv }
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

#[derive(Clone)]
pub struct FlowCipher {
    private_key: RsaPrivateKey,
}

impl FlowCipher {
    /// Accepts PKCS#8 (`BEGIN PRIVATE KEY`) or PKCS#1 (`BEGIN RSA PRIVATE KEY`).
    pub fn from_pem(pem: &str) -> Result<Self, FlowCryptoError> {
        let private_key = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|_| FlowCryptoError::InvalidPrivateKey)?;
        Ok(Self { private_key })
    }

    pub fn new(private_key: RsaPrivateKey) -> Self {
        Self { private_key }
    }

    pub fn unwrap_key(&self, wrapped: &[u8]) -> Result<[u8; KEY_LEN], FlowCryptoError> {
        let raw = self
            .private_key
            .decrypt(Oaep::new::<Sha256>(), wrapped)
            .map_err(|_| FlowCryptoError::Decrypt)?;
        raw.try_into().map_err(|_| FlowCryptoError::Decrypt)
    }

    /// Decodes and decrypts a request. Returns the plaintext JSON bytes and the
    /// key material for the response.
    pub fn decrypt_request(
        &self,
        envelope: &EncryptedEnvelope,
    ) -> Result<(Vec<u8>, SessionKey), FlowCryptoError> {
        let wrapped = decode(&envelope.encrypted_aes_key)?;
        let blob = decode(&envelope.encrypted_flow_data)?;
        let iv: [u8; IV_LEN] = decode(&envelope.initial_vector)?
            .try_into()
            .map_err(|_| FlowCryptoError::Malformed)?;
        let key = self.unwrap_key(&wrapped)?;
        let plaintext = open(&key, &iv, &blob)?;
        Ok((plaintext, SessionKey::new(key, iv)))
    }
}

/// Encrypts a response body and returns it base64-encoded.
pub fn encrypt_response(session: &SessionKey, plaintext: &[u8]) -> Result<String, FlowCryptoError> {
    let sealed = seal(&session.key, &flip_iv(&session.iv), plaintext)?;
    Ok(STANDARD.encode(sealed))
}

/// Verifies and strips the trailing tag. Any mismatch fails the whole call.
pub fn open(
    key: &[u8; KEY_LEN],
    iv: &[u8; IV_LEN],
    blob: &[u8],
) -> Result<Vec<u8>, FlowCryptoError> {
    if blob.len() < TAG_LEN {
        return Err(FlowCryptoError::Decrypt);
    }
    let cipher = Aes128Gcm16::new_from_slice(key).map_err(|_| FlowCryptoError::Decrypt)?;
    cipher
        .decrypt(Nonce::<U16>::from_slice(iv), blob)
        .map_err(|_| FlowCryptoError::Decrypt)
}

/// Ciphertext with the tag appended.
pub fn seal(
    key: &[u8; KEY_LEN],
    iv: &[u8; IV_LEN],
    plaintext: &[u8],
) -> Result<Vec<u8>, FlowCryptoError> {
    let cipher = Aes128Gcm16::new_from_slice(key).map_err(|_| FlowCryptoError::Encrypt)?;
    cipher
        .encrypt(Nonce::<U16>::from_slice(iv), plaintext)
        .map_err(|_| FlowCryptoError::Encrypt)
}

pub fn flip_iv(iv: &[u8; IV_LEN]) -> [u8; IV_LEN] {
    iv.map(|byte| byte ^ 0xFF)
}

fn decode(value: &str) -> Result<Vec<u8>, FlowCryptoError> {
    STANDARD
        .decode(value.trim())
        .map_err(|_| FlowCryptoError::Malformed)
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use proptest::prelude::*;
    use rsa::RsaPublicKey;
    use rsa::pkcs8::{EncodePrivateKey, LineEnding};

    const KEY: [u8; KEY_LEN] = *b"0123456789abcdef";

    #[test]
    fn flip_inverts_every_byte() {
        let iv = [0x00u8, 0xFF, 0x0F, 0xA5, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12];
        let flipped = flip_iv(&iv);
        assert_eq!(flipped[0], 0xFF);
        assert_eq!(flipped[1], 0x00);
        assert_eq!(flipped[2], 0xF0);
        assert_eq!(flipped[3], 0x5A);
        assert_eq!(flip_iv(&flipped), iv);
    }

    #[test]
    fn tag_is_the_last_sixteen_bytes() {
        let iv = [7u8; IV_LEN];
        let sealed = seal(&KEY, &iv, b"hello").unwrap();
        assert_eq!(sealed.len(), 5 + TAG_LEN);
        assert_eq!(open(&KEY, &iv, &sealed).unwrap(), b"hello");
        assert_eq!(open(&KEY, &iv, &sealed[..TAG_LEN - 1]), Err(FlowCryptoError::Decrypt));
    }

    #[test]
    fn full_request_response_cycle() {
        let public_key = RsaPublicKey::from(&*TEST_KEY);
        let pem = TEST_KEY.to_pkcs8_pem(LineEnding::LF).unwrap();
        let cipher = FlowCipher::from_pem(&pem).unwrap();
        let iv = [3u8; IV_LEN];
        let envelope = client_envelope(&public_key, KEY, iv, br#"{"action":"ping"}"#);

        let (plaintext, session) = cipher.decrypt_request(&envelope).unwrap();
        assert_eq!(plaintext, br#"{"action":"ping"}"#);

        let body = encrypt_response(&session, br#"{"data":{"status":"active"}}"#).unwrap();
        assert_eq!(
            client_open_response(KEY, iv, &body),
            br#"{"data":{"status":"active"}}"#
        );
        // The response is not readable with the request IV.
        let blob = STANDARD.decode(&body).unwrap();
        assert!(open(&KEY, &iv, &blob).is_err());
    }

    #[test]
    fn wrong_key_or_bad_base64_fails_closed() {
        let other = RsaPrivateKey::new(&mut rsa::rand_core::OsRng, 1024).unwrap();
        let envelope = client_envelope(&RsaPublicKey::from(&other), KEY, [1; IV_LEN], b"{}");
        let cipher = FlowCipher::new(TEST_KEY.clone());
        assert_eq!(cipher.decrypt_request(&envelope).err(), Some(FlowCryptoError::Decrypt));

        let garbage = EncryptedEnvelope {
            encrypted_flow_data: "!!".into(),
            encrypted_aes_key: "!!".into(),
            initial_vector: "!!".into(),
        };
        assert_eq!(cipher.decrypt_request(&garbage).err(), Some(FlowCryptoError::Malformed));
    }

    #[test]
    fn rejects_unparseable_pem() {
        assert_eq!(
            FlowCipher::from_pem("not a key").err(),
            Some(FlowCryptoError::InvalidPrivateKey)
        );
    }

    proptest! {
        #[test]
        fn response_round_trips_for_any_iv(iv in any::<[u8; IV_LEN]>(), body in proptest::collection::vec(any::<u8>(), 0..256)) {
            let session = SessionKey::new(KEY, iv);
            let encoded = encrypt_response(&session, &body).unwrap();
            let blob = STANDARD.decode(encoded).unwrap();
            let recovered = open(&KEY, &flip_iv(&iv), &blob).unwrap();
            prop_assert_eq!(recovered, body);
        }

        #[test]
        fn any_single_bit_flip_is_rejected(iv in any::<[u8; IV_LEN]>(), bit in 0usize..(40 * 8)) {
            let plaintext = b"{\"action\":\"INIT\",\"screen\":\"DETAILS\"}";
            let mut blob = seal(&KEY, &iv, plaintext).unwrap();
            let bit = bit % (blob.len() * 8);
            blob[bit / 8] ^= 1 << (bit % 8);
            prop_assert_eq!(open(&KEY, &iv, &blob), Err(FlowCryptoError::Decrypt));
        }
    }
}
