//! Property-based tests for the direct-message payload and event ids
//!
//! These check symmetry of the shared secret, that decryption only ever
//! returns the original plaintext, and that any change to signed content
//! invalidates the event.

use proptest::prelude::*;
use relaydm_core::crypto::{self, Keys};
use relaydm_core::{CryptoError, EventBuilder, Kind, Tag, Timestamp};

/// Generate arbitrary message content, including multi-byte characters
fn arb_content() -> impl Strategy<Value = String> {
    prop::string::string_regex(r"[a-zA-Z0-9 .,!?éü日本]{0,300}").unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Property: both parties derive the key that opens the other's payload
    #[test]
    fn dm_payload_opens_for_recipient(content in arb_content()) {
        let alice = Keys::generate();
        let bob = Keys::generate();

        let send_key = crypto::derive_shared_secret(&alice.secret_key(), &bob.public_key_hex()).unwrap();
        let recv_key = crypto::derive_shared_secret(&bob.secret_key(), &alice.public_key_hex()).unwrap();
        prop_assert_eq!(send_key, recv_key);

        let payload = crypto::encrypt(&content, &send_key);
        prop_assert_eq!(crypto::decrypt(&payload, &recv_key).unwrap(), content);
    }

    /// Property: ciphertext length is the padded plaintext length
    #[test]
    fn ciphertext_is_block_aligned(content in arb_content(), iv in any::<[u8; 16]>()) {
        let key = [5u8; 32];
        let payload = crypto::encrypt_with_iv(&content, &key, &iv);
        let (ciphertext, _) = payload.split_once(crypto::IV_SEPARATOR).unwrap();

        use base64::Engine as _;
        let bytes = base64::engine::general_purpose::STANDARD.decode(ciphertext).unwrap();
        prop_assert_eq!(bytes.len(), (content.len() / 16 + 1) * 16);
    }

    /// Property: a third party's key never recovers the plaintext
    #[test]
    fn outsider_cannot_read(content in "[a-z]{1,64}") {
        let alice = Keys::generate();
        let bob = Keys::generate();
        let eve = Keys::generate();

        let key = crypto::derive_shared_secret(&alice.secret_key(), &bob.public_key_hex()).unwrap();
        let eve_key = crypto::derive_shared_secret(&eve.secret_key(), &alice.public_key_hex()).unwrap();
        let payload = crypto::encrypt(&content, &key);

        match crypto::decrypt(&payload, &eve_key) {
            Ok(text) => prop_assert_ne!(text, content),
            Err(err) => prop_assert!(matches!(
                err,
                CryptoError::InvalidPadding | CryptoError::InvalidUtf8
            )),
        }
    }

    /// Property: changing content or timestamp changes the event id
    #[test]
    fn event_id_commits_to_fields(
        content in arb_content(),
        other in arb_content(),
        created_at in 0u64..4_000_000_000u64,
    ) {
        prop_assume!(content != other);
        let keys = Keys::generate();

        let first = EventBuilder::new(Kind::ENCRYPTED_DIRECT_MESSAGE, content.clone())
            .tag(Tag::public_key(&keys.public_key_hex()))
            .custom_created_at(Timestamp::from_secs(created_at))
            .to_event(&keys)
            .unwrap();
        let second = EventBuilder::new(Kind::ENCRYPTED_DIRECT_MESSAGE, other)
            .tag(Tag::public_key(&keys.public_key_hex()))
            .custom_created_at(Timestamp::from_secs(created_at))
            .to_event(&keys)
            .unwrap();
        let later = EventBuilder::new(Kind::ENCRYPTED_DIRECT_MESSAGE, content)
            .tag(Tag::public_key(&keys.public_key_hex()))
            .custom_created_at(Timestamp::from_secs(created_at + 1))
            .to_event(&keys)
            .unwrap();

        prop_assert!(first.is_valid() && second.is_valid() && later.is_valid());
        prop_assert_ne!(first.id(), second.id());
        prop_assert_ne!(first.id(), later.id());
    }
}
