// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Encoding of a response header map into the compact static-table block
//! format, and the whitelist/priority truncation rule applied before
//! fragmentation.
//!
//! Only a whitelist of response-relevant headers is ever emitted, cookies
//! are dropped outright, and values are capped before the block is packed
//! priority-first into the caller's byte budget.

use std::collections::BTreeMap;

/// Static table of common response header names to their wire IDs (1..=11).
/// ID 0 is reserved for unknown names, which carry their name inline.
const STATIC_TABLE: &[(&str, u8)] = &[
    ("content-type", 1),
    ("content-length", 2),
    ("cache-control", 3),
    ("etag", 4),
    ("last-modified", 5),
    ("date", 6),
    ("server", 7),
    ("content-encoding", 8),
    ("accept-ranges", 9),
    ("location", 10),
    ("set-cookie", 11),
];

/// Priority order in which whitelisted headers are packed into the first
/// chunk's capacity, most valuable first.
const PRIORITY_ORDER: &[&str] = &[
    "content-type",
    "content-length",
    "cache-control",
    "etag",
    "last-modified",
    "date",
    "server",
    "content-encoding",
    "accept-ranges",
    "location",
];

/// Headers that are ever allowed onto the wire. `set-cookie`, `cookie`,
/// `content-security-policy` and `x-frame-options` are never emitted.
const WHITELIST: &[&str] = PRIORITY_ORDER;

fn static_id(name: &str) -> Option<u8> {
    STATIC_TABLE
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, id)| *id)
}

fn name_for_id(id: u8) -> Option<&'static str> {
    STATIC_TABLE.iter().find(|(_, i)| *i == id).map(|(n, _)| *n)
}

/// Strip a response header map down to the whitelist, lower-casing names
/// and capping values at `value_max` bytes.
#[must_use]
pub fn shrink_headers(
    headers: &BTreeMap<String, String>,
    value_max: usize,
) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for (name, value) in headers {
        let lname = name.to_ascii_lowercase();
        if !WHITELIST.contains(&lname.as_str()) {
            continue;
        }
        let mut bytes = value.as_bytes().to_vec();
        if bytes.len() > value_max {
            bytes.truncate(value_max);
        }
        let value = String::from_utf8_lossy(&bytes).into_owned();
        out.insert(lname, value);
    }
    out
}

/// Encode a single header entry: `id(1) [+name_len(1)+name] + value_len(2,BE) + value`.
/// Returns `None` if the name/value exceed the wire length limits; the
/// caller drops the entry silently rather than failing the whole block.
fn encode_entry(name: &str, value: &str) -> Option<Vec<u8>> {
    let value_bytes = value.as_bytes();
    if value_bytes.len() > 0xFFFF {
        return None;
    }
    let mut out = Vec::new();
    if let Some(id) = static_id(name) {
        out.push(id);
    } else {
        let name_bytes = name.as_bytes();
        if name_bytes.len() > 0xFF {
            return None;
        }
        out.push(0);
        out.push(name_bytes.len() as u8);
        out.extend_from_slice(name_bytes);
    }
    out.extend_from_slice(&(value_bytes.len() as u16).to_be_bytes());
    out.extend_from_slice(value_bytes);
    Some(out)
}

/// Encode a header map into the wire block format with no size limit.
#[must_use]
pub fn encode_header_block(headers: &BTreeMap<String, String>) -> Vec<u8> {
    let mut out = Vec::new();
    for (name, value) in headers {
        if let Some(entry) = encode_entry(name, value) {
            out.extend(entry);
        }
    }
    out
}

/// Encode a header map into at most `cap` bytes, preferring headers in
/// [`PRIORITY_ORDER`] and dropping whatever doesn't fit. Returns the block
/// and whether any entries were dropped (truncation occurred).
#[must_use]
pub fn encode_header_block_limited(
    headers: &BTreeMap<String, String>,
    cap: usize,
) -> (Vec<u8>, bool) {
    let mut remaining: BTreeMap<String, String> = headers.clone();
    let mut ordered: Vec<(String, String)> = Vec::new();
    for key in PRIORITY_ORDER {
        if let Some(value) = remaining.remove(*key) {
            ordered.push(((*key).to_string(), value));
        }
    }
    // Anything left over in the whitelist but not in PRIORITY_ORDER (there
    // currently is none, but this keeps the function correct if the table
    // grows) is appended after the prioritized entries.
    for (name, value) in remaining {
        ordered.push((name, value));
    }

    let mut encoded = Vec::new();
    let mut truncated = false;
    for (name, value) in ordered {
        let Some(entry) = encode_entry(&name, &value) else {
            continue;
        };
        if encoded.len() + entry.len() > cap {
            truncated = true;
            break;
        }
        encoded.extend(entry);
    }
    (encoded, truncated)
}

/// Decode a header block back into a map. Unknown-name entries (id 0) are
/// recovered using their inline name bytes.
pub fn decode_header_block(mut data: &[u8]) -> Result<BTreeMap<String, String>, &'static str> {
    let mut out = BTreeMap::new();
    while !data.is_empty() {
        let id = data[0];
        data = &data[1..];
        let name = if id == 0 {
            if data.is_empty() {
                return Err("truncated header name length");
            }
            let name_len = data[0] as usize;
            data = &data[1..];
            if data.len() < name_len {
                return Err("truncated header name");
            }
            let name = String::from_utf8_lossy(&data[..name_len]).into_owned();
            data = &data[name_len..];
            name
        } else {
            name_for_id(id).ok_or("unknown static header id")?.to_string()
        };
        if data.len() < 2 {
            return Err("truncated header value length");
        }
        let value_len = u16::from_be_bytes([data[0], data[1]]) as usize;
        data = &data[2..];
        if data.len() < value_len {
            return Err("truncated header value");
        }
        let value = String::from_utf8_lossy(&data[..value_len]).into_owned();
        data = &data[value_len..];
        out.insert(name, value);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn round_trip_known_headers() {
        let headers = map(&[("content-type", "text/plain"), ("etag", "abc123")]);
        let block = encode_header_block(&headers);
        let decoded = decode_header_block(&block).unwrap();
        assert_eq!(decoded, headers);
    }

    #[test]
    fn round_trip_unknown_header() {
        let headers = map(&[("x-custom", "value")]);
        // x-custom is not in the whitelist, so shrink_headers drops it, but
        // the raw encoder (used internally before whitelisting for
        // non-response contexts) still round-trips unknown names.
        let block = encode_header_block(&headers);
        let decoded = decode_header_block(&block).unwrap();
        assert_eq!(decoded, headers);
    }

    #[test]
    fn shrink_drops_cookies_and_unknown() {
        let headers = map(&[
            ("content-type", "text/plain"),
            ("set-cookie", "session=1"),
            ("x-frame-options", "DENY"),
        ]);
        let shrunk = shrink_headers(&headers, 256);
        assert_eq!(shrunk.len(), 1);
        assert!(shrunk.contains_key("content-type"));
    }

    #[test]
    fn limited_truncates_and_reports() {
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), "text/plain".to_string());
        headers.insert("etag".to_string(), "x".repeat(1000));
        let (block, truncated) = encode_header_block_limited(&headers, 20);
        assert!(truncated);
        assert!(block.len() <= 20);
    }
}
