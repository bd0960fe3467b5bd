// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Runtime configuration: every recognized option plus a TOML-backed loader.
//!
//! Same defaults, `psk` / `psk_file` / `psk_env` mutual-exclusivity rule,
//! and optional hex decoding via `psk_hex` as the reverse-proxy's loader.

use std::path::{Path, PathBuf};

use crate::error::{AkariError, AkariResult};

/// Full set of options a client or server may be configured with. Not
/// every field is meaningful to both roles (e.g. `payload_max` is
/// server-only, `timeout` is client-only).
#[derive(Debug, Clone, PartialEq)]
pub struct AkariConfig {
    pub psk: Vec<u8>,
    pub protocol_version: u8,
    pub require_encryption: bool,
    pub timeout_secs: Option<f64>,
    pub sock_timeout_secs: f64,
    pub first_seq_timeout_secs: f64,
    pub buffer_size: usize,
    pub payload_max: usize,
    pub max_nack_rounds: Option<u32>,
    pub max_ack_rounds: u32,
    pub initial_request_retries: u32,
    pub heartbeat_interval_secs: f64,
    pub heartbeat_backoff: f64,
    pub heartbeat_max_retries: u32,
    pub retry_jitter_secs: f64,
    pub agg_tag: bool,
    pub df: bool,
    pub plpmtud: bool,
}

impl Default for AkariConfig {
    fn default() -> Self {
        Self {
            psk: Vec::new(),
            protocol_version: 3,
            require_encryption: false,
            timeout_secs: None,
            sock_timeout_secs: 1.0,
            first_seq_timeout_secs: 0.5,
            buffer_size: 65535,
            payload_max: 1200,
            max_nack_rounds: Some(3),
            max_ack_rounds: 0,
            initial_request_retries: 1,
            heartbeat_interval_secs: 0.0,
            heartbeat_backoff: 1.0,
            heartbeat_max_retries: 0,
            retry_jitter_secs: 0.0,
            agg_tag: true,
            df: true,
            plpmtud: false,
        }
    }
}

impl AkariConfig {
    #[must_use]
    pub fn recovery_policy(&self) -> crate::recovery::RecoveryPolicy {
        use std::time::Duration;
        crate::recovery::RecoveryPolicy {
            sock_timeout: Duration::from_secs_f64(self.sock_timeout_secs),
            first_seq_timeout: Duration::from_secs_f64(self.first_seq_timeout_secs),
            overall_timeout: self
                .timeout_secs
                .filter(|t| *t > 0.0)
                .map(Duration::from_secs_f64),
            max_nack_rounds: self.max_nack_rounds,
            max_ack_rounds: self.max_ack_rounds,
            initial_request_retries: self.initial_request_retries,
            heartbeat_interval: Duration::from_secs_f64(self.heartbeat_interval_secs),
            heartbeat_backoff: self.heartbeat_backoff,
            heartbeat_max_retries: self.heartbeat_max_retries,
            retry_jitter: Duration::from_secs_f64(self.retry_jitter_secs),
        }
    }
}

#[cfg(feature = "config-toml")]
mod toml_loader {
    use super::{AkariConfig, AkariError, AkariResult, Path, PathBuf};

    #[derive(serde::Deserialize, Default)]
    struct RawFile {
        #[serde(default)]
        server: RawServer,
    }

    #[derive(serde::Deserialize, Default)]
    struct RawServer {
        psk: Option<String>,
        psk_file: Option<String>,
        psk_env: Option<String>,
        #[serde(default)]
        psk_hex: bool,
        protocol_version: Option<u8>,
        require_encryption: Option<bool>,
        timeout: Option<f64>,
        sock_timeout: Option<f64>,
        first_seq_timeout: Option<f64>,
        buffer_size: Option<usize>,
        payload_max: Option<usize>,
        max_nack_rounds: Option<i64>,
        max_ack_rounds: Option<u32>,
        initial_request_retries: Option<u32>,
        heartbeat_interval: Option<f64>,
        heartbeat_backoff: Option<f64>,
        heartbeat_max_retries: Option<u32>,
        retry_jitter: Option<f64>,
        agg_tag: Option<bool>,
        df: Option<bool>,
        plpmtud: Option<bool>,
    }

    impl AkariConfig {
        /// Load configuration from a TOML file under a `[server]` table.
        ///
        /// `psk`, `psk_file`, and `psk_env` are mutually exclusive; exactly
        /// one must be present. `psk_hex = true` decodes the resolved
        /// string as hex instead of taking its UTF-8 bytes directly.
        pub fn load_from_path(path: impl AsRef<Path>) -> AkariResult<Self> {
            let path = path.as_ref();
            let text = std::fs::read_to_string(path)
                .map_err(|e| AkariError::Config(format!("cannot read {}: {e}", path.display())))?;
            let raw: RawFile = toml::from_str(&text)
                .map_err(|e| AkariError::Config(format!("invalid TOML in {}: {e}", path.display())))?;
            let base_dir = path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            Self::from_raw(raw.server, &base_dir)
        }

        fn from_raw(raw: RawServer, base_dir: &Path) -> AkariResult<Self> {
            let psk = resolve_psk(&raw, base_dir)?;
            let mut cfg = AkariConfig {
                psk,
                ..AkariConfig::default()
            };
            if let Some(v) = raw.protocol_version {
                cfg.protocol_version = v;
            }
            if let Some(v) = raw.require_encryption {
                cfg.require_encryption = v;
            }
            cfg.timeout_secs = raw.timeout.filter(|t| *t > 0.0);
            if let Some(v) = raw.sock_timeout {
                cfg.sock_timeout_secs = v;
            }
            if let Some(v) = raw.first_seq_timeout {
                cfg.first_seq_timeout_secs = v;
            }
            if let Some(v) = raw.buffer_size {
                cfg.buffer_size = v;
            }
            if let Some(v) = raw.payload_max {
                cfg.payload_max = v;
            }
            if let Some(v) = raw.max_nack_rounds {
                cfg.max_nack_rounds = if v < 0 { None } else { Some(v as u32) };
            }
            if let Some(v) = raw.max_ack_rounds {
                cfg.max_ack_rounds = v;
            }
            if let Some(v) = raw.initial_request_retries {
                cfg.initial_request_retries = v;
            }
            if let Some(v) = raw.heartbeat_interval {
                cfg.heartbeat_interval_secs = v;
            }
            if let Some(v) = raw.heartbeat_backoff {
                cfg.heartbeat_backoff = v;
            }
            if let Some(v) = raw.heartbeat_max_retries {
                cfg.heartbeat_max_retries = v;
            }
            if let Some(v) = raw.retry_jitter {
                cfg.retry_jitter_secs = v;
            }
            if let Some(v) = raw.agg_tag {
                cfg.agg_tag = v;
            }
            if let Some(v) = raw.df {
                cfg.df = v;
            }
            if let Some(v) = raw.plpmtud {
                cfg.plpmtud = v;
            }
            Ok(cfg)
        }
    }

    fn resolve_psk(raw: &RawServer, base_dir: &Path) -> AkariResult<Vec<u8>> {
        let sources = [
            raw.psk.is_some(),
            raw.psk_file.is_some(),
            raw.psk_env.is_some(),
        ];
        let count = sources.iter().filter(|s| **s).count();
        if count == 0 {
            return Err(AkariError::Config(
                "server.psk, server.psk_file or server.psk_env is required".to_string(),
            ));
        }
        if count > 1 {
            return Err(AkariError::Config(
                "psk, psk_file and psk_env are mutually exclusive".to_string(),
            ));
        }

        let raw_value = if let Some(psk) = &raw.psk {
            psk.clone()
        } else if let Some(rel) = &raw.psk_file {
            let mut path = PathBuf::from(rel);
            if !path.is_absolute() {
                path = base_dir.join(&path);
            }
            std::fs::read_to_string(&path)
                .map_err(|_| AkariError::Config(format!("psk_file not found: {}", path.display())))?
                .trim()
                .to_string()
        } else {
            let env_key = raw.psk_env.as_ref().expect("psk_env checked present above");
            let value = std::env::var(env_key)
                .map_err(|_| AkariError::Config(format!("environment variable {env_key} is not set")))?;
            value.trim().to_string()
        };

        if raw_value.is_empty() {
            return Err(AkariError::Config("resolved psk value is empty".to_string()));
        }

        if raw.psk_hex {
            hex::decode(&raw_value)
                .map_err(|_| AkariError::Config("psk_hex true but value is not valid hex".to_string()))
        } else {
            Ok(raw_value.into_bytes())
        }
    }
}

#[cfg(all(test, feature = "config-toml"))]
mod tests {
    use super::*;

    #[test]
    fn loads_minimal_config_with_inline_psk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("akari.toml");
        std::fs::write(&path, "[server]\npsk = \"hunter2\"\n").unwrap();
        let cfg = AkariConfig::load_from_path(&path).unwrap();
        assert_eq!(cfg.psk, b"hunter2");
        assert_eq!(cfg.payload_max, 1200);
    }

    #[test]
    fn psk_hex_decodes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("akari.toml");
        std::fs::write(&path, "[server]\npsk = \"68656c6c6f\"\npsk_hex = true\n").unwrap();
        let cfg = AkariConfig::load_from_path(&path).unwrap();
        assert_eq!(cfg.psk, b"hello");
    }

    #[test]
    fn mutually_exclusive_psk_sources_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("akari.toml");
        std::fs::write(&path, "[server]\npsk = \"a\"\npsk_env = \"X\"\n").unwrap();
        assert!(AkariConfig::load_from_path(&path).is_err());
    }

    #[test]
    fn missing_psk_source_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("akari.toml");
        std::fs::write(&path, "[server]\nhost = \"0.0.0.0\"\n").unwrap();
        assert!(AkariConfig::load_from_path(&path).is_err());
    }

    #[test]
    fn psk_env_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("akari.toml");
        std::fs::write(&path, "[server]\npsk_env = \"AKARI_TEST_PSK\"\n").unwrap();
        std::env::set_var("AKARI_TEST_PSK", "from-env");
        let cfg = AkariConfig::load_from_path(&path).unwrap();
        assert_eq!(cfg.psk, b"from-env");
        std::env::remove_var("AKARI_TEST_PSK");
    }
}
