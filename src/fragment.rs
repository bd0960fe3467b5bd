// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Splits a response body (and, for v2/v3, a header block) into MTU-safe
//! chunks.
//!
//! # Algorithm
//!
//! 1. Clamp the effective datagram size to `min(buffer_size, payload_max,
//!    1200)`.
//! 2. Subtract per-datagram overhead (IP/UDP framing, the AKARI header +
//!    MAC, a safety margin) to get the payload budget every chunk must fit
//!    in.
//! 3. The first chunk additionally carries response metadata (status,
//!    header length, body length) and the header block itself, so its body
//!    capacity is smaller than later chunks.
//!
//! Grounded on `reliability::writer::GapTx`'s range-chunking loop for the
//! "slice until budget exhausted, emit one datagram per slice" shape.

use std::collections::BTreeMap;

use crate::wire::header_block;

/// UDP + IP framing not visible to the application payload.
pub const UDP_IP_OVERHEAD: usize = 48;
/// AKARI header prefix + trailing MAC, worst case across versions.
pub const PROTO_OVERHEAD: usize = 40;
/// Headroom against MTU estimation error.
pub const SAFETY_MARGIN: usize = 32;
/// `status_code(2) + header_len(2) + body_len(4)` carried only on chunk 0.
pub const RESPONSE_FIRST_OVERHEAD: usize = 8;
/// No datagram this crate emits may exceed this many bytes.
pub const MAX_DATAGRAM_SIZE: usize = 1200;
/// Minimum first-chunk slack reserved for the body after the header block.
pub const HEADER_BLOCK_SLACK: usize = 64;

/// Resolve the effective datagram size ceiling from configuration.
#[must_use]
pub fn max_datagram_size(buffer_size: usize, payload_max: usize) -> usize {
    buffer_size.min(payload_max).min(MAX_DATAGRAM_SIZE)
}

/// Per-chunk payload budget after fixed per-datagram overhead.
#[must_use]
pub fn payload_budget(max_datagram: usize) -> usize {
    max_datagram
        .saturating_sub(UDP_IP_OVERHEAD)
        .saturating_sub(PROTO_OVERHEAD)
        .saturating_sub(SAFETY_MARGIN)
        .max(1)
}

/// One fragmented chunk ready to hand to [`crate::wire::codec::Codec`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BodyChunk {
    pub seq: u16,
    pub seq_total: u16,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderChunk {
    pub idx: u16,
    pub chunks_total: u16,
    pub bytes: Vec<u8>,
}

/// Output of fragmenting one response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragmented {
    pub header_chunks: Vec<HeaderChunk>,
    pub body_chunks: Vec<BodyChunk>,
    /// `true` if the priority-order header block had to drop entries to
    /// fit the first chunk's capacity.
    pub header_truncated: bool,
}

/// Split `body` into `payload_budget`-sized pieces.
fn split_body(body: &[u8], budget: usize) -> Vec<Vec<u8>> {
    if body.is_empty() {
        return vec![Vec::new()];
    }
    body.chunks(budget.max(1)).map(<[u8]>::to_vec).collect()
}

/// Fragment a response for the v1/v2 single-stream wire shape: the header
/// block (if any) and the first body slice share chunk 0's budget.
#[must_use]
pub fn fragment_v1_v2(
    headers: &BTreeMap<String, String>,
    body: &[u8],
    buffer_size: usize,
    payload_max: usize,
    include_header_block: bool,
) -> Fragmented {
    let max_datagram = max_datagram_size(buffer_size, payload_max);
    let budget = payload_budget(max_datagram);

    let (header_block, header_truncated) = if include_header_block {
        let shrunk = header_block::shrink_headers(headers, 256);
        let cap = budget.saturating_sub(RESPONSE_FIRST_OVERHEAD).saturating_sub(HEADER_BLOCK_SLACK);
        header_block::encode_header_block_limited(&shrunk, cap)
    } else {
        (Vec::new(), false)
    };

    let first_capacity = budget
        .saturating_sub(RESPONSE_FIRST_OVERHEAD)
        .saturating_sub(header_block.len())
        .max(1);

    let mut body_chunks_raw: Vec<Vec<u8>> = Vec::new();
    if body.len() <= first_capacity {
        body_chunks_raw.push(body.to_vec());
    } else {
        body_chunks_raw.push(body[..first_capacity].to_vec());
        for rest in split_body(&body[first_capacity..], budget) {
            body_chunks_raw.push(rest);
        }
    }

    let seq_total = body_chunks_raw.len() as u16;
    let body_chunks = body_chunks_raw
        .into_iter()
        .enumerate()
        .map(|(i, bytes)| BodyChunk {
            seq: i as u16,
            seq_total,
            bytes,
        })
        .collect();

    Fragmented {
        header_chunks: if header_block.is_empty() {
            Vec::new()
        } else {
            vec![HeaderChunk {
                idx: 0,
                chunks_total: 1,
                bytes: header_block,
            }]
        },
        body_chunks,
        header_truncated,
    }
}

/// Fragment a response for v3's independent header-chunk / body-chunk
/// streams: both are sliced against the same `payload_budget`, with no
/// first-chunk body-capacity penalty since metadata lives in `resp-head`
/// alone.
#[must_use]
pub fn fragment_v3(
    headers: &BTreeMap<String, String>,
    body: &[u8],
    buffer_size: usize,
    payload_max: usize,
) -> Fragmented {
    let max_datagram = max_datagram_size(buffer_size, payload_max);
    let budget = payload_budget(max_datagram);

    let shrunk = header_block::shrink_headers(headers, 256);
    let full_block = header_block::encode_header_block(&shrunk);
    let header_chunks_raw = if full_block.is_empty() {
        Vec::new()
    } else {
        full_block
            .chunks(budget.max(1))
            .map(<[u8]>::to_vec)
            .collect::<Vec<_>>()
    };
    let hdr_total = header_chunks_raw.len() as u16;
    let header_chunks = header_chunks_raw
        .into_iter()
        .enumerate()
        .map(|(i, bytes)| HeaderChunk {
            idx: i as u16,
            chunks_total: hdr_total,
            bytes,
        })
        .collect();

    let body_chunks_raw = split_body(body, budget.saturating_sub(RESPONSE_FIRST_OVERHEAD).max(1));
    let seq_total = body_chunks_raw.len() as u16;
    let body_chunks = body_chunks_raw
        .into_iter()
        .enumerate()
        .map(|(i, bytes)| BodyChunk {
            seq: i as u16,
            seq_total,
            bytes,
        })
        .collect();

    Fragmented {
        header_chunks,
        body_chunks,
        header_truncated: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers() -> BTreeMap<String, String> {
        let mut m = BTreeMap::new();
        m.insert("content-type".to_string(), "text/plain".to_string());
        m
    }

    #[test]
    fn small_body_fits_in_one_chunk() {
        let frag = fragment_v1_v2(&headers(), b"hello", 1200, 1200, true);
        assert_eq!(frag.body_chunks.len(), 1);
        assert_eq!(frag.body_chunks[0].bytes, b"hello");
    }

    #[test]
    fn chunking_is_exact_for_various_sizes() {
        let body = vec![b'A'; 4096];
        for payload_max in [256usize, 1200, 65535] {
            let frag = fragment_v1_v2(&headers(), &body, 65535, payload_max, true);
            let reassembled: Vec<u8> = frag
                .body_chunks
                .iter()
                .flat_map(|c| c.bytes.clone())
                .collect();
            assert_eq!(reassembled, body);
            let max_datagram = max_datagram_size(65535, payload_max);
            for chunk in &frag.body_chunks {
                assert!(chunk.bytes.len() + PROTO_OVERHEAD <= max_datagram + SAFETY_MARGIN);
            }
        }
    }

    #[test]
    fn v3_streams_are_independent() {
        let body = vec![b'B'; 3000];
        let frag = fragment_v3(&headers(), &body, 1200, 1200);
        assert!(frag.body_chunks.len() > 1);
        assert_eq!(frag.header_chunks.len(), 1);
        let reassembled: Vec<u8> = frag.body_chunks.iter().flat_map(|c| c.bytes.clone()).collect();
        assert_eq!(reassembled, body);
    }

    #[test]
    fn oversized_header_block_is_truncated_and_flagged() {
        let mut many = BTreeMap::new();
        many.insert("etag".to_string(), "x".repeat(2000));
        many.insert("content-type".to_string(), "text/plain".to_string());
        let frag = fragment_v1_v2(&many, b"body", 300, 300, true);
        assert!(frag.header_truncated);
    }
}
