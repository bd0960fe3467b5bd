// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Dispatches incoming packets by type, drives the pluggable [`Fetcher`],
//! and owns the response-replay and HTTP caches.
//!
//! Grounded on `rpc::server::ServiceServer` / `RequestHandler` for the
//! trait-object dispatch shape, and on `handle_request`'s per-type dispatch
//! table, cache-then-fetch ordering, and exception-to-domain-code mapping.

use std::collections::BTreeMap;
use std::time::Duration;

use dashmap::DashMap;

use crate::config::AkariConfig;
use crate::contracts::{Clock, Fetcher, FetchError, SystemClock};
use crate::error::DomainErrorCode;
use crate::fragment;
use crate::wire::header::ProtocolVersion;
use crate::wire::mac;
use crate::wire::packet::{Packet, PacketKind, Payload};
use crate::wire::Codec;

const RESP_CACHE_TTL: Duration = Duration::from_secs(5);
const HTTP_CACHE_DEFAULT_TTL: Duration = Duration::from_secs(30);

struct ResponseCacheEntry {
    created_at: Duration,
    datagrams: Vec<Vec<u8>>,
}

struct HttpCacheEntry {
    expires_at: Duration,
    response: crate::contracts::HttpResponse,
}

/// Server-side request handler: pure in packet-in/datagram-out, with side
/// effects confined to the fetcher call and the two caches below.
///
/// Cache state is owned per-instance rather than held behind a process-wide
/// global lock, so tests don't share state across handlers, using
/// [`DashMap`] the way `rpc::client::ServiceClient` uses it for its
/// pending-request map.
pub struct ServerHandler {
    config: AkariConfig,
    fetcher: Box<dyn Fetcher>,
    clock: Box<dyn Clock>,
    response_cache: DashMap<u32, ResponseCacheEntry>,
    http_cache: DashMap<String, HttpCacheEntry>,
}

impl ServerHandler {
    #[must_use]
    pub fn new(config: AkariConfig, fetcher: Box<dyn Fetcher>) -> Self {
        Self {
            config,
            fetcher,
            clock: Box::new(SystemClock),
            response_cache: DashMap::new(),
            http_cache: DashMap::new(),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Box<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn now(&self) -> Duration {
        Duration::from_secs(self.clock.unix_seconds())
    }

    /// Handle one decoded incoming packet, returning the datagrams to send
    /// back (zero or more; the `ack`/`nack`/`req` paths produce one or
    /// more, everything else produces none).
    pub fn handle(&self, incoming: &Packet) -> Vec<Vec<u8>> {
        match incoming.kind {
            PacketKind::Req => self.handle_req(incoming),
            PacketKind::Nack | PacketKind::NackHead | PacketKind::NackBody => self.handle_nack(incoming),
            PacketKind::Ack => self.handle_ack(incoming),
            PacketKind::Resp
            | PacketKind::RespHead
            | PacketKind::RespHeadCont
            | PacketKind::RespBody
            | PacketKind::Error => {
                log::debug!(
                    "ServerHandler::handle: dropping unexpected {:?} from a client",
                    incoming.kind
                );
                Vec::new()
            }
        }
    }

    fn handle_req(&self, incoming: &Packet) -> Vec<Vec<u8>> {
        let message_id = incoming.message_id();
        let version = incoming.version();
        let codec = Codec::new(self.config.psk.clone());

        if self.config.require_encryption && !incoming.header.flags.encrypted() {
            log::info!("req {message_id}: rejected, encryption required");
            return vec![self.encode_error(
                &codec,
                version,
                message_id,
                DomainErrorCode::UnsupportedPacketType,
                "encryption required (set E flag)",
            )];
        }

        let Payload::Req { url, .. } = &incoming.payload else {
            return Vec::new();
        };
        if url.trim().is_empty() {
            log::info!("req {message_id}: missing URL");
            return vec![self.encode_error(
                &codec,
                version,
                message_id,
                DomainErrorCode::InvalidUrl,
                "payload.url is missing",
            )];
        }

        if let Some(cached) = self.response_cache_lookup(message_id) {
            log::info!("req {message_id}: replaying cached response");
            return cached;
        }

        let normalized = url.trim().to_string();
        let response = match self.http_cache_lookup(&normalized) {
            Some(resp) => {
                log::debug!("req {message_id}: HTTP cache hit for {normalized}");
                resp
            }
            None => match self.fetcher.fetch(&normalized, self.config.buffer_size as u64, fetch_timeout(&self.config)) {
                Ok(resp) => {
                    self.http_cache_store(&normalized, &resp);
                    resp
                }
                Err(err) => {
                    log::info!("req {message_id}: fetch failed: {err}");
                    let code = map_fetch_error(&err);
                    return vec![self.encode_error(&codec, version, message_id, code, &err.to_string())];
                }
            },
        };

        let datagrams = self.encode_response(&codec, version, message_id, &response);
        self.response_cache_store(message_id, datagrams.clone());
        log::info!("req {message_id}: responded with {} datagram(s)", datagrams.len());
        datagrams
    }

    fn handle_nack(&self, incoming: &Packet) -> Vec<Vec<u8>> {
        let message_id = incoming.message_id();
        let Payload::NackBitmap { bitmap } = &incoming.payload else {
            return Vec::new();
        };
        let Some(entry) = self.response_cache.get(&message_id) else {
            log::debug!("nack {message_id}: no cached response (expired or unknown)");
            return Vec::new();
        };
        let indices = crate::recovery::decode_bitmap(bitmap);
        // v3 nack-body indexes body chunks starting after the response
        // head datagram, so it carries an offset of 1 into the cached list.
        let offset = usize::from(incoming.kind == PacketKind::NackBody);
        let mut out = Vec::new();
        for idx in indices {
            let pos = idx as usize + offset;
            if let Some(dgram) = entry.datagrams.get(pos) {
                out.push(dgram.clone());
            } else {
                log::debug!("nack {message_id}: index {idx} out of range, skipping");
            }
        }
        log::info!("nack {message_id}: replaying {} datagram(s)", out.len());
        out
    }

    fn handle_ack(&self, incoming: &Packet) -> Vec<Vec<u8>> {
        let message_id = incoming.message_id();
        let Payload::Ack { first_lost_seq } = &incoming.payload else {
            return Vec::new();
        };
        let Some(entry) = self.response_cache.get(&message_id) else {
            return Vec::new();
        };
        entry
            .datagrams
            .iter()
            .skip(*first_lost_seq as usize)
            .cloned()
            .collect()
    }

    fn encode_error(
        &self,
        codec: &Codec,
        version: ProtocolVersion,
        message_id: u32,
        code: DomainErrorCode,
        message: &str,
    ) -> Vec<u8> {
        codec.encode_error(version, code.code(), code.http_status(), message, message_id, self.now().as_secs() as u32)
    }

    fn encode_response(
        &self,
        codec: &Codec,
        version: ProtocolVersion,
        message_id: u32,
        response: &crate::contracts::HttpResponse,
    ) -> Vec<Vec<u8>> {
        match version {
            ProtocolVersion::V1 => self.encode_response_v1(codec, message_id, response),
            ProtocolVersion::V2 => self.encode_response_v2(codec, message_id, response),
            ProtocolVersion::V3 => self.encode_response_v3(codec, message_id, response),
        }
    }

    fn encode_response_v1(&self, codec: &Codec, message_id: u32, response: &crate::contracts::HttpResponse) -> Vec<Vec<u8>> {
        let frag = fragment::fragment_v1_v2(&response.headers, &response.body, self.config.buffer_size, self.config.payload_max, false);
        let seq_total = frag.body_chunks.len() as u16;
        let now = self.now().as_secs() as u32;
        let mut out = Vec::with_capacity(frag.body_chunks.len());
        for (i, chunk) in frag.body_chunks.iter().enumerate() {
            if i == 0 {
                out.push(codec.encode_resp_first_v1(response.status_code, response.body.len() as u32, &chunk.bytes, message_id, seq_total, now));
            } else {
                out.push(codec.encode_resp_tail_v1(&chunk.bytes, message_id, chunk.seq, seq_total, now));
            }
        }
        self.warn_if_oversize(&out);
        out
    }

    fn encode_response_v2(&self, codec: &Codec, message_id: u32, response: &crate::contracts::HttpResponse) -> Vec<Vec<u8>> {
        let frag = fragment::fragment_v1_v2(&response.headers, &response.body, self.config.buffer_size, self.config.payload_max, true);
        if frag.header_truncated {
            log::warn!("req {message_id}: header block truncated to fit first chunk");
        }
        let header_block = frag.header_chunks.first().map(|c| c.bytes.clone()).unwrap_or_default();
        let seq_total = frag.body_chunks.len() as u16;
        let now = self.now().as_secs() as u32;
        let mut out = Vec::with_capacity(frag.body_chunks.len());
        for (i, chunk) in frag.body_chunks.iter().enumerate() {
            if i == 0 {
                out.push(codec.encode_resp_first_v2(response.status_code, response.body.len() as u32, &header_block, &chunk.bytes, message_id, seq_total, 0, now));
            } else {
                out.push(codec.encode_resp_tail_v2(&chunk.bytes, message_id, chunk.seq, seq_total, 0, now));
            }
        }
        self.warn_if_oversize(&out);
        out
    }

    fn encode_response_v3(&self, codec: &Codec, message_id: u32, response: &crate::contracts::HttpResponse) -> Vec<Vec<u8>> {
        let frag = fragment::fragment_v3(&response.headers, &response.body, self.config.buffer_size, self.config.payload_max);
        let body_total = frag.body_chunks.len() as u16;
        let hdr_total = frag.header_chunks.len().max(1) as u16;
        let agg = self.config.agg_tag;
        let flags = if agg { crate::wire::header::flags::AGGREGATE_TAG } else { 0 };

        let mut out = Vec::new();
        if let Some(first_hdr) = frag.header_chunks.first() {
            out.push(codec.encode_resp_head_v3(response.status_code, &first_hdr.bytes, response.body.len() as u32, hdr_total, 0, body_total, flags, message_id));
            for cont in frag.header_chunks.iter().skip(1) {
                out.push(codec.encode_resp_head_cont_v3(&cont.bytes, cont.idx, hdr_total, flags, message_id));
            }
        } else {
            out.push(codec.encode_resp_head_v3(response.status_code, &[], response.body.len() as u32, hdr_total, 0, body_total, flags, message_id));
        }

        let agg_tag = agg.then(|| mac::tag(&self.config.psk, &response.body));
        for chunk in &frag.body_chunks {
            let is_last = chunk.seq + 1 == chunk.seq_total;
            let tag = if is_last { agg_tag } else { None };
            out.push(codec.encode_resp_body_v3_agg(&chunk.bytes, chunk.seq, chunk.seq_total, flags, message_id, tag));
        }
        self.warn_if_oversize(&out);
        out
    }

    fn warn_if_oversize(&self, datagrams: &[Vec<u8>]) {
        let max = fragment::max_datagram_size(self.config.buffer_size, self.config.payload_max);
        for d in datagrams {
            if d.len() > max {
                log::warn!("MTU-sizing anomaly: datagram of {} bytes exceeds computed max {max}", d.len());
            }
        }
    }

    fn response_cache_lookup(&self, message_id: u32) -> Option<Vec<Vec<u8>>> {
        let now = self.now();
        if let Some(entry) = self.response_cache.get(&message_id) {
            if now.saturating_sub(entry.created_at) <= RESP_CACHE_TTL {
                return Some(entry.datagrams.clone());
            }
        }
        None
    }

    fn response_cache_store(&self, message_id: u32, datagrams: Vec<Vec<u8>>) {
        self.response_cache.retain(|_, v| self.now().saturating_sub(v.created_at) <= RESP_CACHE_TTL);
        self.response_cache.insert(
            message_id,
            ResponseCacheEntry {
                created_at: self.now(),
                datagrams,
            },
        );
    }

    fn http_cache_lookup(&self, url: &str) -> Option<crate::contracts::HttpResponse> {
        let now = self.now();
        if let Some(entry) = self.http_cache.get(url) {
            if now < entry.expires_at {
                return Some(entry.response.clone());
            }
        }
        None
    }

    fn http_cache_store(&self, url: &str, response: &crate::contracts::HttpResponse) {
        if !is_cacheable(response) {
            return;
        }
        let ttl = cache_control_ttl(&response.headers).unwrap_or(HTTP_CACHE_DEFAULT_TTL);
        self.http_cache.retain(|_, v| self.now() < v.expires_at);
        self.http_cache.insert(
            url.to_string(),
            HttpCacheEntry {
                expires_at: self.now() + ttl,
                response: response.clone(),
            },
        );
    }
}

fn fetch_timeout(config: &AkariConfig) -> Duration {
    config
        .timeout_secs
        .filter(|t| *t > 0.0)
        .map(Duration::from_secs_f64)
        .unwrap_or(Duration::from_secs(30))
}

fn map_fetch_error(err: &FetchError) -> DomainErrorCode {
    match err {
        FetchError::InvalidUrl => DomainErrorCode::InvalidUrl,
        FetchError::BodyTooLarge { .. } => DomainErrorCode::ResponseTooLarge,
        FetchError::Timeout { .. } => DomainErrorCode::Timeout,
        FetchError::Fetch(_) => DomainErrorCode::UpstreamFailure,
    }
}

fn is_cacheable(response: &crate::contracts::HttpResponse) -> bool {
    if response.status_code >= 500 {
        return false;
    }
    if response.headers.contains_key("set-cookie") {
        return false;
    }
    if let Some(cc) = response.headers.get("cache-control") {
        let lower = cc.to_ascii_lowercase();
        if lower.contains("no-store") || lower.contains("no-cache") || lower.contains("private") {
            return false;
        }
    }
    true
}

fn cache_control_ttl(headers: &BTreeMap<String, String>) -> Option<Duration> {
    let cc = headers.get("cache-control")?;
    for directive in cc.split(',') {
        let directive = directive.trim();
        if let Some(rest) = directive.strip_prefix("max-age=") {
            if let Ok(secs) = rest.trim().parse::<u64>() {
                return Some(Duration::from_secs(secs));
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::HttpResponse;
    use std::sync::Mutex;

    fn handler_with_fetch(
        body: &'static [u8],
        status: u16,
    ) -> ServerHandler {
        let config = AkariConfig {
            psk: b"test-psk-0000-test".to_vec(),
            ..AkariConfig::default()
        };
        let calls = Mutex::new(0u32);
        let fetcher = move |_url: &str, _max: u64, _t: Duration| {
            *calls.lock().unwrap() += 1;
            Ok(HttpResponse {
                status_code: status,
                headers: BTreeMap::new(),
                body: body.to_vec(),
            })
        };
        ServerHandler::new(config, Box::new(fetcher))
    }

    fn decode_req(codec: &Codec, url: &str, message_id: u32) -> Packet {
        let datagram = codec.encode_req_v3("get", url, b"", message_id, 0);
        crate::wire::decode(&datagram, codec.psk()).unwrap()
    }

    #[test]
    fn small_get_returns_one_datagram() {
        let handler = handler_with_fetch(b"hello", 200);
        let codec = Codec::new(handler.config.psk.clone());
        let req = decode_req(&codec, "https://example.test/ok", 1);
        let out = handler.handle(&req);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn invalid_url_yields_error_10() {
        let handler = handler_with_fetch(b"", 200);
        let codec = Codec::new(handler.config.psk.clone());
        let req = decode_req(&codec, "", 1);
        let out = handler.handle(&req);
        let packet = crate::wire::decode(&out[0], &handler.config.psk).unwrap();
        match packet.payload {
            Payload::Error { error_code, .. } => assert_eq!(error_code, 10),
            _ => panic!("expected error payload"),
        }
    }

    #[test]
    fn encryption_required_rejects_plaintext_req() {
        let mut config = AkariConfig {
            psk: b"test-psk-0000-test".to_vec(),
            require_encryption: true,
            ..AkariConfig::default()
        };
        config.require_encryption = true;
        let fetcher = |_: &str, _: u64, _: Duration| Ok(HttpResponse { status_code: 200, headers: BTreeMap::new(), body: vec![] });
        let handler = ServerHandler::new(config, Box::new(fetcher));
        let codec = Codec::new(handler.config.psk.clone());
        let req = decode_req(&codec, "https://example.test", 1);
        let out = handler.handle(&req);
        let packet = crate::wire::decode(&out[0], &handler.config.psk).unwrap();
        match packet.payload {
            Payload::Error { error_code, .. } => assert_eq!(error_code, 254),
            _ => panic!("expected error payload"),
        }
    }

    #[test]
    fn response_cache_replay_is_byte_identical() {
        let handler = handler_with_fetch(b"hello", 200);
        let codec = Codec::new(handler.config.psk.clone());
        let req = decode_req(&codec, "https://example.test/ok", 42);
        let first = handler.handle(&req);
        // Body fits in one chunk (cached list = [resp-head, resp-body#0]);
        // nack-body applies a +1 offset since index 0 is the head datagram.
        let nack = codec.encode_nack(PacketKind::NackBody, ProtocolVersion::V3, &[0b0000_0001], 42, 0);
        let nack_packet = crate::wire::decode(&nack, &handler.config.psk).unwrap();
        let replay = handler.handle(&nack_packet);
        assert_eq!(replay.len(), 1);
        assert_eq!(first[1], replay[0]);
    }

    #[test]
    fn http_cache_no_store_refetches() {
        let config = AkariConfig {
            psk: b"test-psk-0000-test".to_vec(),
            ..AkariConfig::default()
        };
        let calls = std::sync::Arc::new(Mutex::new(0u32));
        let calls2 = calls.clone();
        let fetcher = move |_: &str, _: u64, _: Duration| {
            *calls2.lock().unwrap() += 1;
            let mut headers = BTreeMap::new();
            headers.insert("cache-control".to_string(), "no-store".to_string());
            Ok(HttpResponse { status_code: 200, headers, body: b"x".to_vec() })
        };
        let handler = ServerHandler::new(config, Box::new(fetcher));
        let codec = Codec::new(handler.config.psk.clone());
        handler.handle(&decode_req(&codec, "https://example.test/a", 1));
        handler.handle(&decode_req(&codec, "https://example.test/a", 2));
        assert_eq!(*calls.lock().unwrap(), 2);
    }

    #[test]
    fn http_cache_max_age_avoids_refetch() {
        let config = AkariConfig {
            psk: b"test-psk-0000-test".to_vec(),
            ..AkariConfig::default()
        };
        let calls = std::sync::Arc::new(Mutex::new(0u32));
        let calls2 = calls.clone();
        let fetcher = move |_: &str, _: u64, _: Duration| {
            *calls2.lock().unwrap() += 1;
            let mut headers = BTreeMap::new();
            headers.insert("cache-control".to_string(), "max-age=60".to_string());
            Ok(HttpResponse { status_code: 200, headers, body: b"x".to_vec() })
        };
        let handler = ServerHandler::new(config, Box::new(fetcher));
        let codec = Codec::new(handler.config.psk.clone());
        handler.handle(&decode_req(&codec, "https://example.test/b", 1));
        handler.handle(&decode_req(&codec, "https://example.test/b", 2));
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[test]
    fn status_500_is_never_cached() {
        let config = AkariConfig {
            psk: b"test-psk-0000-test".to_vec(),
            ..AkariConfig::default()
        };
        let calls = std::sync::Arc::new(Mutex::new(0u32));
        let calls2 = calls.clone();
        let fetcher = move |_: &str, _: u64, _: Duration| {
            *calls2.lock().unwrap() += 1;
            Ok(HttpResponse { status_code: 500, headers: BTreeMap::new(), body: b"err".to_vec() })
        };
        let handler = ServerHandler::new(config, Box::new(fetcher));
        let codec = Codec::new(handler.config.psk.clone());
        handler.handle(&decode_req(&codec, "https://example.test/c", 1));
        handler.handle(&decode_req(&codec, "https://example.test/c", 2));
        assert_eq!(*calls.lock().unwrap(), 2);
    }
}
