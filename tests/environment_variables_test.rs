// Tests for CONNECTME_* environment overrides.
//
// Environment variables are process-global, so every test holds ENV_LOCK for
// its whole duration.

use std::env;
use std::io::Write;
use std::sync::{Mutex, MutexGuard};

use connectme::constants::{
    ENV_ADDRESS, ENV_AUTO_RECONNECT, ENV_PROTOCOLS, ENV_QUERY_TIMEOUT, ENV_RECONNECT_DELAY_MS,
};
use connectme::{ClientConfig, ReconnectPolicy};

static ENV_LOCK: Mutex<()> = Mutex::new(());

const ALL_VARS: [&str; 5] = [
    ENV_ADDRESS,
    ENV_PROTOCOLS,
    ENV_AUTO_RECONNECT,
    ENV_QUERY_TIMEOUT,
    ENV_RECONNECT_DELAY_MS,
];

/// Clears every override on creation and on drop.
struct EnvGuard {
    _lock: MutexGuard<'static, ()>,
}

impl EnvGuard {
    fn new() -> Self {
        let lock = ENV_LOCK.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        for key in ALL_VARS {
            env::remove_var(key);
        }
        Self { _lock: lock }
    }

    fn set(&self, key: &str, value: &str) {
        env::set_var(key, value);
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for key in ALL_VARS {
            env::remove_var(key);
        }
    }
}

#[test]
fn test_no_env_vars_keeps_config() {
    let _guard = EnvGuard::new();
    let mut config = ClientConfig::new("ws://localhost:9000");
    config.apply_env_overrides();
    assert_eq!(config, ClientConfig::new("ws://localhost:9000"));
}

#[test]
fn test_env_overrides_every_field() {
    let guard = EnvGuard::new();
    guard.set(ENV_ADDRESS, "wss://override.example/socket");
    guard.set(ENV_PROTOCOLS, "v3, v2 ,,v1");
    guard.set(ENV_AUTO_RECONNECT, "false");
    guard.set(ENV_QUERY_TIMEOUT, "5");
    guard.set(ENV_RECONNECT_DELAY_MS, "750");

    let mut config = ClientConfig::new("ws://localhost:9000");
    config.apply_env_overrides();

    assert_eq!(config.address, "wss://override.example/socket");
    assert_eq!(
        config.protocols,
        vec!["v3".to_string(), "v2".to_string(), "v1".to_string()]
    );
    assert!(!config.auto_reconnect);
    assert_eq!(config.query_timeout_secs, 5);
    assert_eq!(config.reconnect, ReconnectPolicy::Fixed { delay_ms: 750 });
}

#[test]
fn test_unparseable_values_are_ignored() {
    let guard = EnvGuard::new();
    guard.set(ENV_AUTO_RECONNECT, "sometimes");
    guard.set(ENV_QUERY_TIMEOUT, "soon");
    guard.set(ENV_RECONNECT_DELAY_MS, "-1");

    let mut config = ClientConfig::new("ws://localhost:9000");
    config.apply_env_overrides();

    assert!(config.auto_reconnect);
    assert_eq!(config.query_timeout_secs, 30);
    assert_eq!(config.reconnect, ReconnectPolicy::default());
}

#[test]
fn test_env_address_fills_file_without_one() {
    let guard = EnvGuard::new();
    guard.set(ENV_ADDRESS, "ws://from-env:1234");

    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, r#"{{"query_timeout_secs": 12}}"#).unwrap();

    let config = ClientConfig::load_from_file(file.path()).unwrap();
    assert_eq!(config.address, "ws://from-env:1234");
    assert_eq!(config.query_timeout_secs, 12);
}
