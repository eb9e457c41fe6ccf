//! Cryptographic primitives
//!
//! secp256k1 key handling, ECDH shared-secret derivation, the AES-256-CBC
//! direct-message payload (`<base64 ciphertext>?iv=<base64 iv>`), and schnorr
//! signatures over 32-byte event digests.
//!
//! The CBC payload format is kept for wire compatibility with existing relays
//! and clients. A replacement AEAD scheme belongs under its own event kind.

use core::fmt;

use aes::cipher::block_padding::{NoPadding, Pkcs7};
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use base64::{engine::general_purpose, Engine as _};
use rand::{rngs::OsRng, RngCore};
use secp256k1::{
    ecdh, schnorr, Keypair, Message, Parity, PublicKey, SecretKey, XOnlyPublicKey, SECP256K1,
};
use sha2::{Digest, Sha256};

use crate::errors::CryptoError;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

// ----------------------------------------------------------------------------
// Constants
// ----------------------------------------------------------------------------

/// Literal separating ciphertext and IV in a direct-message payload
pub const IV_SEPARATOR: &str = "?iv=";

/// AES-CBC initialization vector length
pub const IV_LENGTH: usize = 16;

/// AES block size, also the maximum PKCS7 pad value
pub const BLOCK_SIZE: usize = 16;

/// Length of a derived shared secret
pub const SHARED_SECRET_LENGTH: usize = 32;

// ----------------------------------------------------------------------------
// Keys
// ----------------------------------------------------------------------------

/// A secp256k1 identity: secret key plus its x-only public key
#[derive(Clone)]
pub struct Keys {
    keypair: Keypair,
    public_key: XOnlyPublicKey,
}

impl Keys {
    pub fn new(secret_key: SecretKey) -> Self {
        let keypair = Keypair::from_secret_key(SECP256K1, &secret_key);
        let (public_key, _parity) = keypair.x_only_public_key();
        Self {
            keypair,
            public_key,
        }
    }

    /// Generate a fresh random identity
    pub fn generate() -> Self {
        let (secret_key, _) = SECP256K1.generate_keypair(&mut secp256k1::rand::thread_rng());
        Self::new(secret_key)
    }

    /// Parse a 32-byte hex-encoded secret key
    pub fn parse(secret_key_hex: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(secret_key_hex.trim()).map_err(|_| CryptoError::InvalidSecretKey)?;
        let secret_key =
            SecretKey::from_slice(&bytes).map_err(|_| CryptoError::InvalidSecretKey)?;
        Ok(Self::new(secret_key))
    }

    pub fn secret_key(&self) -> SecretKey {
        self.keypair.secret_key()
    }

    pub fn secret_key_hex(&self) -> String {
        hex::encode(self.keypair.secret_bytes())
    }

    pub fn public_key(&self) -> XOnlyPublicKey {
        self.public_key
    }

    /// Lowercase hex of the x-only public key
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.public_key.serialize())
    }

    /// Schnorr-sign a 32-byte digest
    pub fn sign_digest(&self, digest: &[u8; 32]) -> schnorr::Signature {
        let message = Message::from_digest(*digest);
        SECP256K1.sign_schnorr(&message, &self.keypair)
    }
}

impl fmt::Debug for Keys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keys")
            .field("public_key", &self.public_key_hex())
            .finish_non_exhaustive()
    }
}

/// Parse a hex-encoded x-only public key
pub fn parse_public_key(public_key_hex: &str) -> Result<XOnlyPublicKey, CryptoError> {
    let bytes = hex::decode(public_key_hex.trim())
        .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
    XOnlyPublicKey::from_slice(&bytes).map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))
}

// ----------------------------------------------------------------------------
// Shared Secret
// ----------------------------------------------------------------------------

/// Derive the symmetric key shared between `secret_key` and `their_public_key_hex`.
///
/// ECDH over secp256k1, keeping the x-coordinate of the shared point, hashed
/// with SHA-256. The peer key is x-only so it is lifted with even parity; the
/// x-coordinate of the product does not depend on that choice, which keeps the
/// derivation symmetric.
pub fn derive_shared_secret(
    secret_key: &SecretKey,
    their_public_key_hex: &str,
) -> Result<[u8; SHARED_SECRET_LENGTH], CryptoError> {
    let x_only = parse_public_key(their_public_key_hex)?;
    let public_key = PublicKey::from_x_only_public_key(x_only, Parity::Even);
    let point = ecdh::shared_secret_point(&public_key, secret_key);
    Ok(Sha256::digest(&point[..32]).into())
}

// ----------------------------------------------------------------------------
// Direct-Message Payload
// ----------------------------------------------------------------------------

/// Encrypt `plaintext` under `key` with a random IV
pub fn encrypt(plaintext: &str, key: &[u8; SHARED_SECRET_LENGTH]) -> String {
    let mut iv = [0u8; IV_LENGTH];
    OsRng.fill_bytes(&mut iv);
    encrypt_with_iv(plaintext, key, &iv)
}

/// Encrypt `plaintext` under `key` with a caller-chosen IV
pub fn encrypt_with_iv(
    plaintext: &str,
    key: &[u8; SHARED_SECRET_LENGTH],
    iv: &[u8; IV_LENGTH],
) -> String {
    let ciphertext = Aes256CbcEnc::new(&(*key).into(), &(*iv).into())
        .encrypt_padded_vec_mut::<Pkcs7>(plaintext.as_bytes());

    format!(
        "{}{}{}",
        general_purpose::STANDARD.encode(ciphertext),
        IV_SEPARATOR,
        general_purpose::STANDARD.encode(iv)
    )
}

/// Decrypt a `<base64 ciphertext>?iv=<base64 iv>` payload.
///
/// Never returns plaintext unless the padding validates.
pub fn decrypt(payload: &str, key: &[u8; SHARED_SECRET_LENGTH]) -> Result<String, CryptoError> {
    let parts: Vec<&str> = payload.split(IV_SEPARATOR).collect();
    if parts.len() != 2 {
        return Err(CryptoError::MalformedPayload(format!(
            "expected ciphertext and iv, found {} part(s)",
            parts.len()
        )));
    }

    let ciphertext = general_purpose::STANDARD
        .decode(parts[0])
        .map_err(|_| CryptoError::InvalidBase64)?;
    let iv_bytes = general_purpose::STANDARD
        .decode(parts[1])
        .map_err(|_| CryptoError::InvalidBase64)?;

    let iv: [u8; IV_LENGTH] = iv_bytes
        .as_slice()
        .try_into()
        .map_err(|_| CryptoError::InvalidIvLength {
            actual: iv_bytes.len(),
        })?;

    if ciphertext.is_empty() || ciphertext.len() % BLOCK_SIZE != 0 {
        return Err(CryptoError::InvalidCiphertextLength {
            actual: ciphertext.len(),
        });
    }

    let mut padded = Aes256CbcDec::new(&(*key).into(), &iv.into())
        .decrypt_padded_vec_mut::<NoPadding>(&ciphertext)
        .map_err(|_| CryptoError::InvalidCiphertextLength {
            actual: ciphertext.len(),
        })?;

    let unpadded_len = pkcs7_unpadded_len(&padded)?;
    padded.truncate(unpadded_len);

    String::from_utf8(padded).map_err(|_| CryptoError::InvalidUtf8)
}

/// Length of `data` once its PKCS7 padding is removed.
///
/// The final byte must be in `1..=16` and every pad byte must equal it.
pub fn pkcs7_unpadded_len(data: &[u8]) -> Result<usize, CryptoError> {
    let pad = *data.last().ok_or(CryptoError::InvalidPadding)? as usize;
    if pad == 0 || pad > BLOCK_SIZE || pad > data.len() {
        return Err(CryptoError::InvalidPadding);
    }

    let unpadded_len = data.len() - pad;
    if data[unpadded_len..].iter().any(|&b| b as usize != pad) {
        return Err(CryptoError::InvalidPadding);
    }
    Ok(unpadded_len)
}

// ----------------------------------------------------------------------------
// Signatures
// ----------------------------------------------------------------------------

/// Verify a hex schnorr signature over `digest` under a hex x-only public key
pub fn verify_digest(
    public_key_hex: &str,
    digest: &[u8; 32],
    signature_hex: &str,
) -> Result<(), CryptoError> {
    let public_key = parse_public_key(public_key_hex)?;
    let signature_bytes = hex::decode(signature_hex).map_err(|_| CryptoError::InvalidSignature)?;
    let signature =
        schnorr::Signature::from_slice(&signature_bytes).map_err(|_| CryptoError::InvalidSignature)?;
    let message = Message::from_digest(*digest);

    SECP256K1
        .verify_schnorr(&signature, &message, &public_key)
        .map_err(|_| CryptoError::InvalidSignature)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use aes::cipher::block_padding::NoPadding;

    fn shared_pair() -> ([u8; 32], [u8; 32]) {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let ab = derive_shared_secret(&alice.secret_key(), &bob.public_key_hex()).unwrap();
        let ba = derive_shared_secret(&bob.secret_key(), &alice.public_key_hex()).unwrap();
        (ab, ba)
    }

    /// Encrypt raw blocks without padding so tests control the final byte
    fn encrypt_raw_blocks(blocks: &[u8], key: &[u8; 32], iv: &[u8; 16]) -> String {
        let ciphertext = Aes256CbcEnc::new(&(*key).into(), &(*iv).into())
            .encrypt_padded_vec_mut::<NoPadding>(blocks);
        format!(
            "{}?iv={}",
            general_purpose::STANDARD.encode(ciphertext),
            general_purpose::STANDARD.encode(iv)
        )
    }

    #[test]
    fn test_shared_secret_is_symmetric() {
        let (ab, ba) = shared_pair();
        assert_eq!(ab, ba);
    }

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let (ab, ba) = shared_pair();
        let payload = encrypt("hello over relays", &ab);

        assert!(payload.contains(IV_SEPARATOR));
        assert_eq!(decrypt(&payload, &ba).unwrap(), "hello over relays");
    }

    #[test]
    fn test_encrypt_uses_fresh_iv() {
        let key = [7u8; 32];
        assert_ne!(encrypt("same", &key), encrypt("same", &key));
    }

    #[test]
    fn test_decrypt_rejects_missing_or_repeated_separator() {
        let key = [1u8; 32];
        let payload = encrypt("x", &key);

        assert!(matches!(
            decrypt("bm9pdg==", &key),
            Err(CryptoError::MalformedPayload(_))
        ));
        let doubled = format!("{payload}?iv=AAAA");
        assert!(matches!(
            decrypt(&doubled, &key),
            Err(CryptoError::MalformedPayload(_))
        ));
    }

    #[test]
    fn test_decrypt_rejects_short_iv() {
        let key = [1u8; 32];
        let payload = encrypt("x", &key);
        let ciphertext = payload.split(IV_SEPARATOR).next().unwrap();
        let short_iv = general_purpose::STANDARD.encode([0u8; 12]);

        assert_eq!(
            decrypt(&format!("{ciphertext}?iv={short_iv}"), &key),
            Err(CryptoError::InvalidIvLength { actual: 12 })
        );
    }

    #[test]
    fn test_decrypt_rejects_bad_base64() {
        let key = [1u8; 32];
        assert_eq!(decrypt("!!!?iv=AAAA", &key), Err(CryptoError::InvalidBase64));
    }

    #[test]
    fn test_decrypt_rejects_pad_byte_out_of_range() {
        let key = [3u8; 32];
        let iv = [9u8; 16];
        let mut block = [b'a'; 16];
        block[15] = 17;

        let payload = encrypt_raw_blocks(&block, &key, &iv);
        assert_eq!(decrypt(&payload, &key), Err(CryptoError::InvalidPadding));

        block[15] = 0;
        let payload = encrypt_raw_blocks(&block, &key, &iv);
        assert_eq!(decrypt(&payload, &key), Err(CryptoError::InvalidPadding));
    }

    #[test]
    fn test_decrypt_rejects_inconsistent_pad_bytes() {
        let key = [3u8; 32];
        let iv = [9u8; 16];
        let mut block = [b'a'; 16];
        block[12] = 4;
        block[13] = 4;
        block[14] = 3;
        block[15] = 4;

        let payload = encrypt_raw_blocks(&block, &key, &iv);
        assert_eq!(decrypt(&payload, &key), Err(CryptoError::InvalidPadding));
    }

    #[test]
    fn test_decrypt_with_wrong_key_never_yields_plaintext() {
        let (ab, _) = shared_pair();
        let payload = encrypt("secret", &ab);
        let wrong = [0x42u8; 32];

        if let Ok(text) = decrypt(&payload, &wrong) {
            assert_ne!(text, "secret");
        }
    }

    #[test]
    fn test_pkcs7_unpadded_len() {
        assert_eq!(pkcs7_unpadded_len(&[1, 2, 3, 1]), Ok(3));
        assert_eq!(pkcs7_unpadded_len(&[4, 4, 4, 4]), Ok(0));
        assert_eq!(pkcs7_unpadded_len(&[]), Err(CryptoError::InvalidPadding));
        assert_eq!(pkcs7_unpadded_len(&[1, 5]), Err(CryptoError::InvalidPadding));
    }

    #[test]
    fn test_keys_parse_round_trip() {
        let keys = Keys::generate();
        let parsed = Keys::parse(&keys.secret_key_hex()).unwrap();
        assert_eq!(parsed.public_key_hex(), keys.public_key_hex());
        assert_eq!(keys.public_key_hex().len(), 64);

        assert_eq!(Keys::parse("zz").unwrap_err(), CryptoError::InvalidSecretKey);
        assert_eq!(
            Keys::parse(&"00".repeat(32)).unwrap_err(),
            CryptoError::InvalidSecretKey
        );
    }

    #[test]
    fn test_keys_debug_hides_secret() {
        let keys = Keys::generate();
        let rendered = format!("{keys:?}");
        assert!(!rendered.contains(&keys.secret_key_hex()));
    }

    #[test]
    fn test_sign_and_verify_digest() {
        let keys = Keys::generate();
        let digest: [u8; 32] = Sha256::digest(b"event").into();
        let signature = keys.sign_digest(&digest);
        let signature_hex = hex::encode(&signature[..]);

        assert!(verify_digest(&keys.public_key_hex(), &digest, &signature_hex).is_ok());

        let other: [u8; 32] = Sha256::digest(b"other").into();
        assert_eq!(
            verify_digest(&keys.public_key_hex(), &other, &signature_hex),
            Err(CryptoError::InvalidSignature)
        );
    }

    #[test]
    fn test_shared_secret_rejects_invalid_public_key() {
        let keys = Keys::generate();
        assert!(matches!(
            derive_shared_secret(&keys.secret_key(), "not-hex"),
            Err(CryptoError::InvalidPublicKey(_))
        ));
    }
}
