// SPDX-License-Identifier: Apache-2.0 OR MIT

//! AEAD encryption for the `E` flag, used when a caller opts into
//! [`crate::config::AkariConfig`] encryption.
//!
//! The PSK is never used directly as an AES key: a per-codec subkey is
//! derived via HKDF-SHA256, and the nonce is derived deterministically from
//! `message_id ‖ seq ‖ type_tag` mixed with a random 4-byte session prefix
//! generated once when the codec is constructed.
//!
//! This is documented in [`crate::AKARI_NONCE_SAFETY`] as unsafe across
//! process restarts: the session prefix reduces in-session nonce reuse but
//! does not persist, so a PSK reused across restarts can still repeat a
//! nonce if the (message_id, seq, type) triple repeats. Anti-replay across
//! restarts is out of scope for this crate.

use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::hkdf;

/// Derives the per-session AEAD key from a PSK via HKDF-SHA256.
///
/// `info` binds the derived key to this crate so the same PSK used
/// elsewhere (e.g. for HMAC) does not yield the same bytes.
fn derive_key(psk: &[u8]) -> LessSafeKey {
    let salt = hkdf::Salt::new(hkdf::HKDF_SHA256, b"akari-udp-aead-v1");
    let prk = salt.extract(psk);
    let mut okm = [0u8; 32];
    prk.expand(&[b"akari-udp-subkey"], hkdf::HKDF_SHA256)
        .expect("hkdf expand length is valid for sha256")
        .fill(&mut okm)
        .expect("hkdf fill into fixed-size buffer");
    let unbound =
        UnboundKey::new(&AES_256_GCM, &okm).expect("AES_256_GCM key length matches derived okm");
    LessSafeKey::new(unbound)
}

fn derive_nonce(session_prefix: [u8; 4], message_id: u32, seq: u16, type_tag: u8) -> Nonce {
    let mut bytes = [0u8; NONCE_LEN];
    bytes[0..4].copy_from_slice(&session_prefix);
    bytes[4..8].copy_from_slice(&message_id.to_be_bytes());
    bytes[8..10].copy_from_slice(&seq.to_be_bytes());
    bytes[10] = type_tag;
    // bytes[11] left as padding/reserved.
    Nonce::assume_unique_for_key(bytes)
}

/// Encrypts `plaintext` in place, appending the AEAD tag, and returns the
/// ciphertext‖tag bytes.
pub fn seal(
    psk: &[u8],
    session_prefix: [u8; 4],
    message_id: u32,
    seq: u16,
    type_tag: u8,
    plaintext: &[u8],
) -> Vec<u8> {
    let key = derive_key(psk);
    let nonce = derive_nonce(session_prefix, message_id, seq, type_tag);
    let mut in_out = plaintext.to_vec();
    key.seal_in_place_append_tag(nonce, Aad::empty(), &mut in_out)
        .expect("AES-GCM seal does not fail for well-formed input");
    in_out
}

/// Decrypts a ciphertext‖tag buffer produced by [`seal`]. Returns `None`
/// if authentication fails.
#[must_use]
pub fn open(
    psk: &[u8],
    session_prefix: [u8; 4],
    message_id: u32,
    seq: u16,
    type_tag: u8,
    ciphertext_and_tag: &[u8],
) -> Option<Vec<u8>> {
    let key = derive_key(psk);
    let nonce = derive_nonce(session_prefix, message_id, seq, type_tag);
    let mut buf = ciphertext_and_tag.to_vec();
    let plaintext = key.open_in_place(nonce, Aad::empty(), &mut buf).ok()?;
    Some(plaintext.to_vec())
}
