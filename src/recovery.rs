// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Loss-recovery policy: the parameters and small pieces of arithmetic
//! that decide when the client emits a NACK, an ACK-of-first-gap, a
//! request retry, or gives up.
//!
//! The heartbeat re-probe schedule is grounded on
//! `reliability::writer::HeartbeatTx`'s period × jitter-percent backoff;
//! bitmap construction is grounded on
//! `reliability::messages::SequenceNumberSet`'s little-endian bit packing.

use std::time::Duration;

/// Tunables governing one client request's loss-recovery behavior. See
/// [`crate::config::AkariConfig`] for where these are sourced from at
/// runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryPolicy {
    pub sock_timeout: Duration,
    pub first_seq_timeout: Duration,
    pub overall_timeout: Option<Duration>,
    pub max_nack_rounds: Option<u32>,
    pub max_ack_rounds: u32,
    pub initial_request_retries: u32,
    pub heartbeat_interval: Duration,
    pub heartbeat_backoff: f64,
    pub heartbeat_max_retries: u32,
    pub retry_jitter: Duration,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            sock_timeout: Duration::from_millis(1000),
            first_seq_timeout: Duration::from_millis(1000),
            overall_timeout: None,
            max_nack_rounds: Some(3),
            max_ack_rounds: 0,
            initial_request_retries: 1,
            heartbeat_interval: Duration::ZERO,
            heartbeat_backoff: 1.0,
            heartbeat_max_retries: 0,
            retry_jitter: Duration::ZERO,
        }
    }
}

impl RecoveryPolicy {
    /// The recv-loop poll interval: never longer than `sock_timeout`, and
    /// capped at 0.5 s so the caller's cancellation is noticed promptly.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        self.sock_timeout.min(Duration::from_millis(500))
    }
}

/// Tracks how many NACK/ACK rounds and request retries have been spent for
/// one in-flight request, against the budgets in [`RecoveryPolicy`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryBudget {
    pub nack_rounds_used: u32,
    pub ack_rounds_used: u32,
    pub request_retries_used: u32,
    pub heartbeat_retries_used: u32,
}

impl RecoveryBudget {
    #[must_use]
    pub fn nack_available(&self, policy: &RecoveryPolicy) -> bool {
        match policy.max_nack_rounds {
            None => true,
            Some(max) => self.nack_rounds_used < max,
        }
    }

    #[must_use]
    pub fn ack_available(&self, policy: &RecoveryPolicy) -> bool {
        self.ack_rounds_used < policy.max_ack_rounds
    }

    #[must_use]
    pub fn request_retry_available(&self, policy: &RecoveryPolicy) -> bool {
        self.request_retries_used < policy.initial_request_retries
    }

    #[must_use]
    pub fn heartbeat_available(&self, policy: &RecoveryPolicy) -> bool {
        self.heartbeat_retries_used < policy.heartbeat_max_retries
    }
}

/// Compute the next heartbeat re-probe delay: `interval * backoff^attempt`
/// plus uniform jitter in `[0, retry_jitter)`.
#[must_use]
pub fn next_heartbeat_delay(policy: &RecoveryPolicy, attempt: u32) -> Duration {
    let base_secs = policy.heartbeat_interval.as_secs_f64() * policy.heartbeat_backoff.powi(attempt as i32);
    let jitter_secs = if policy.retry_jitter.is_zero() {
        0.0
    } else {
        fastrand::f64() * policy.retry_jitter.as_secs_f64()
    };
    Duration::from_secs_f64((base_secs + jitter_secs).max(0.0))
}

/// Build a little-endian missing-sequence bitmap: bit `b` of byte `i` set
/// means sequence `8*i + b` is missing. `missing` must already be
/// sanitized against currently-present sequences (see
/// [`sanitize_missing`]).
#[must_use]
pub fn build_bitmap(missing: &[u16]) -> Vec<u8> {
    let Some(&max) = missing.iter().max() else {
        return Vec::new();
    };
    let bitmap_len = (max as usize / 8) + 1;
    let mut bitmap = vec![0u8; bitmap_len];
    for &i in missing {
        let i = i as usize;
        bitmap[i / 8] |= 1 << (i % 8);
    }
    bitmap
}

/// Decode a little-endian missing-sequence bitmap back into indices.
#[must_use]
pub fn decode_bitmap(bitmap: &[u8]) -> Vec<u16> {
    let mut out = Vec::new();
    for (i, byte) in bitmap.iter().enumerate() {
        for bit in 0..8 {
            if byte & (1 << bit) != 0 {
                out.push((i * 8 + bit) as u16);
            }
        }
    }
    out
}

/// Filter a candidate missing list against sequences already present,
/// logging (at the call site) if any slip was found. Per invariant I5 this
/// should never happen in practice; defensive filtering just keeps a bug
/// here from corrupting the wire bitmap.
#[must_use]
pub fn sanitize_missing(candidate: &[u16], present: impl Fn(u16) -> bool) -> Vec<u16> {
    candidate.iter().copied().filter(|&i| !present(i)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitmap_round_trips() {
        let missing = vec![2u16, 9, 17];
        let bitmap = build_bitmap(&missing);
        let mut decoded = decode_bitmap(&bitmap);
        decoded.sort_unstable();
        assert_eq!(decoded, missing);
    }

    #[test]
    fn bitmap_length_matches_max_missing() {
        let bitmap = build_bitmap(&[20]);
        assert_eq!(bitmap.len(), 3);
    }

    #[test]
    fn sanitize_drops_present_sequences() {
        let present = [1u16, 2];
        let filtered = sanitize_missing(&[1, 2, 3], |i| present.contains(&i));
        assert_eq!(filtered, vec![3]);
    }

    #[test]
    fn budgets_respect_none_as_unbounded() {
        let policy = RecoveryPolicy {
            max_nack_rounds: None,
            ..RecoveryPolicy::default()
        };
        let mut budget = RecoveryBudget::default();
        budget.nack_rounds_used = 1000;
        assert!(budget.nack_available(&policy));
    }

    #[test]
    fn heartbeat_delay_grows_with_backoff() {
        let policy = RecoveryPolicy {
            heartbeat_interval: Duration::from_millis(100),
            heartbeat_backoff: 2.0,
            retry_jitter: Duration::ZERO,
            ..RecoveryPolicy::default()
        };
        let d0 = next_heartbeat_delay(&policy, 0);
        let d1 = next_heartbeat_delay(&policy, 1);
        assert_eq!(d0, Duration::from_millis(100));
        assert_eq!(d1, Duration::from_millis(200));
    }
}
