// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Per-message sparse chunk store and completeness/authenticity checks.
//!
//! Generalizes `reliability::gap_tracker::GapTracker`'s sparse-range
//! tracking from a single linear stream to AKARI-UDP's two independent
//! streams (header chunks, body chunks) used by v3.

use std::collections::BTreeMap;

use crate::wire::header_block;
use crate::wire::mac;

/// Body assembly succeeded but the v3 aggregate tag did not match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateTagMismatch;

impl std::fmt::Display for AggregateTagMismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "aggregate tag mismatch")
    }
}

impl std::error::Error for AggregateTagMismatch {}

/// Per-`message_id` reassembly state.
#[derive(Debug, Default)]
pub struct Reassembler {
    message_id: u32,
    body_seq_total: Option<u16>,
    header_seq_total: Option<u16>,
    body_chunks: BTreeMap<u16, Vec<u8>>,
    header_chunks: BTreeMap<u16, Vec<u8>>,
    pub status_code: Option<u16>,
    pub body_len: Option<u32>,
    agg_tag: Option<[u8; 16]>,
}

impl Reassembler {
    #[must_use]
    pub fn new(message_id: u32) -> Self {
        Self {
            message_id,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn message_id(&self) -> u32 {
        self.message_id
    }

    /// Ingest a v1/v2-style first chunk carrying response metadata.
    pub fn ingest_resp_first(
        &mut self,
        message_id: u32,
        status_code: u16,
        body_len: u32,
        header_block: Option<Vec<u8>>,
        chunk: Vec<u8>,
        seq_total: u16,
    ) {
        if message_id != self.message_id {
            return;
        }
        self.status_code = Some(status_code);
        self.body_len = Some(body_len);
        if let Some(hb) = header_block {
            self.header_chunks.insert(0, hb);
            self.header_seq_total = Some(1);
        }
        self.body_seq_total = Some(seq_total);
        self.body_chunks.insert(0, chunk);
    }

    /// Ingest a v1/v2-style tail chunk.
    pub fn ingest_resp_tail(&mut self, message_id: u32, seq: u16, seq_total: u16, chunk: Vec<u8>) {
        if message_id != self.message_id || seq >= seq_total {
            return;
        }
        self.body_seq_total = Some(seq_total);
        self.body_chunks.insert(seq, chunk);
    }

    /// Ingest a v3 `resp-head` packet (first header chunk plus metadata).
    pub fn ingest_resp_head(
        &mut self,
        message_id: u32,
        status_code: u16,
        body_len: u32,
        hdr_idx: u16,
        hdr_chunks_total: u16,
        body_seq_total: u16,
        header_chunk: Vec<u8>,
    ) {
        if message_id != self.message_id || hdr_idx >= hdr_chunks_total.max(1) {
            return;
        }
        self.status_code = Some(status_code);
        self.body_len = Some(body_len);
        self.header_seq_total = Some(hdr_chunks_total);
        self.body_seq_total = Some(body_seq_total);
        self.header_chunks.insert(hdr_idx, header_chunk);
    }

    /// Ingest a v3 `resp-head-cont` packet.
    pub fn ingest_resp_head_cont(
        &mut self,
        message_id: u32,
        hdr_idx: u16,
        hdr_chunks_total: u16,
        header_chunk: Vec<u8>,
    ) {
        if message_id != self.message_id || hdr_idx >= hdr_chunks_total {
            return;
        }
        self.header_seq_total = Some(hdr_chunks_total);
        self.header_chunks.insert(hdr_idx, header_chunk);
    }

    /// Ingest a v3 `resp-body` packet, capturing the aggregate tag if this
    /// is the terminal chunk in AGG mode.
    pub fn ingest_resp_body(
        &mut self,
        message_id: u32,
        seq: u16,
        seq_total: u16,
        chunk: Vec<u8>,
        agg_tag: Option<[u8; 16]>,
    ) {
        if message_id != self.message_id || seq >= seq_total {
            return;
        }
        self.body_seq_total = Some(seq_total);
        self.body_chunks.insert(seq, chunk);
        if let Some(tag) = agg_tag {
            self.agg_tag = Some(tag);
        }
    }

    #[must_use]
    pub fn header_complete(&self) -> bool {
        match self.header_seq_total {
            None => true, // no header stream advertised: vacuously complete
            Some(total) => (0..total).all(|i| self.header_chunks.contains_key(&i)),
        }
    }

    #[must_use]
    pub fn body_total_known(&self) -> bool {
        self.body_seq_total.is_some()
    }

    /// Whether body chunk `seq` has already been stored.
    #[must_use]
    pub fn has_body_chunk(&self, seq: u16) -> bool {
        self.body_chunks.contains_key(&seq)
    }

    /// Whether header chunk `idx` has already been stored.
    #[must_use]
    pub fn has_header_chunk(&self, idx: u16) -> bool {
        self.header_chunks.contains_key(&idx)
    }

    #[must_use]
    pub fn complete(&self) -> bool {
        match self.body_seq_total {
            None => false,
            Some(total) => (0..total).all(|i| self.body_chunks.contains_key(&i)),
        }
    }

    /// Indices of body chunks not yet stored, `[]` if the total is unknown.
    #[must_use]
    pub fn missing(&self) -> Vec<u16> {
        match self.body_seq_total {
            None => Vec::new(),
            Some(total) => (0..total).filter(|i| !self.body_chunks.contains_key(i)).collect(),
        }
    }

    /// Indices of header chunks not yet stored.
    #[must_use]
    pub fn missing_header(&self) -> Vec<u16> {
        match self.header_seq_total {
            None => Vec::new(),
            Some(total) => (0..total)
                .filter(|i| !self.header_chunks.contains_key(i))
                .collect(),
        }
    }

    /// Concatenate body chunks in ascending seq order. Caller must check
    /// [`Self::complete`] first; gaps are silently skipped otherwise.
    #[must_use]
    pub fn assemble_body(&self) -> Vec<u8> {
        self.body_chunks.values().flat_map(|c| c.clone()).collect()
    }

    /// Concatenate and decode the header-block chunks in ascending index
    /// order.
    pub fn assemble_headers(&self) -> Result<BTreeMap<String, String>, &'static str> {
        let block: Vec<u8> = self.header_chunks.values().flat_map(|c| c.clone()).collect();
        if block.is_empty() {
            return Ok(BTreeMap::new());
        }
        header_block::decode_header_block(&block)
    }

    /// Verify the v3 aggregate tag against the assembled body plaintext.
    /// Only meaningful once [`Self::complete`] is `true`.
    pub fn verify_aggregate_tag(&self, psk: &[u8]) -> Result<(), AggregateTagMismatch> {
        let Some(expected) = self.agg_tag else {
            return Ok(());
        };
        let body = self.assemble_body();
        let computed = mac::tag(psk, &body);
        if computed == expected {
            Ok(())
        } else {
            Err(AggregateTagMismatch)
        }
    }
}
