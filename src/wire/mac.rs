// SPDX-License-Identifier: Apache-2.0 OR MIT

//! HMAC-SHA256 authentication, truncated to 16 bytes, for both per-packet
//! framing tags and the v3 aggregate body tag.

use ring::hmac;

/// Compute HMAC-SHA256(psk, data) truncated to the leading 16 bytes.
#[must_use]
pub fn tag(psk: &[u8], data: &[u8]) -> [u8; 16] {
    let key = hmac::Key::new(hmac::HMAC_SHA256, psk);
    let full = hmac::sign(&key, data);
    let mut out = [0u8; 16];
    out.copy_from_slice(&full.as_ref()[..16]);
    out
}

/// Constant-time verification of a 16-byte truncated HMAC tag.
#[must_use]
pub fn verify(psk: &[u8], data: &[u8], expected: &[u8; 16]) -> bool {
    let computed = tag(psk, data);
    ring::constant_time::verify_slices_are_equal(&computed, expected).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_is_deterministic() {
        let psk = b"test-psk";
        let data = b"hello world";
        assert_eq!(tag(psk, data), tag(psk, data));
    }

    #[test]
    fn verify_detects_tamper() {
        let psk = b"test-psk";
        let data = b"hello world";
        let t = tag(psk, data);
        assert!(verify(psk, data, &t));
        assert!(!verify(psk, b"hello worlD", &t));
    }

    #[test]
    fn psk_isolation() {
        let data = b"payload";
        let t = tag(b"key-one", data);
        assert!(!verify(b"key-two", data, &t));
    }
}
