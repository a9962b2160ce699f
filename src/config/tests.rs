//! Config module tests

use std::time::Duration;

use super::*;
use crate::protocol::{ProtocolVersion, QoS};

#[test]
fn test_substitute_env_vars_simple() {
    std::env::set_var("HTTPMQ_TEST_VAR_SIMPLE", "hello");
    let result = substitute_env_vars("value = \"${HTTPMQ_TEST_VAR_SIMPLE}\"");
    assert_eq!(result, "value = \"hello\"");
    std::env::remove_var("HTTPMQ_TEST_VAR_SIMPLE");
}

#[test]
fn test_substitute_env_vars_with_default() {
    std::env::remove_var("HTTPMQ_TEST_VAR_UNSET");
    let result = substitute_env_vars("value = \"${HTTPMQ_TEST_VAR_UNSET:-default_value}\"");
    assert_eq!(result, "value = \"default_value\"");

    std::env::set_var("HTTPMQ_TEST_VAR_SET", "env_value");
    let result = substitute_env_vars("value = \"${HTTPMQ_TEST_VAR_SET:-default_value}\"");
    assert_eq!(result, "value = \"env_value\"");
    std::env::remove_var("HTTPMQ_TEST_VAR_SET");
}

#[test]
fn test_substitute_env_vars_missing_no_default() {
    std::env::remove_var("HTTPMQ_TEST_VAR_MISSING");
    let result = substitute_env_vars("value = \"${HTTPMQ_TEST_VAR_MISSING}\"");
    assert_eq!(result, "value = \"\"");
}

#[test]
fn test_expand_env_forms() {
    std::env::set_var("HTTPMQ_TEST_SECRETS", "/run/secrets");
    assert_eq!(
        expand_env("$HTTPMQ_TEST_SECRETS/broker"),
        "/run/secrets/broker"
    );
    assert_eq!(
        expand_env("${HTTPMQ_TEST_SECRETS}/broker"),
        "/run/secrets/broker"
    );
    std::env::remove_var("HTTPMQ_TEST_SECRETS");

    std::env::remove_var("HTTPMQ_TEST_NOPE");
    assert_eq!(expand_env("/etc/$HTTPMQ_TEST_NOPE/pw"), "/etc//pw");
    assert_eq!(expand_env("/plain/path"), "/plain/path");
}

#[test]
fn test_default_config() {
    let config = Config::default();
    assert_eq!(config.http.bind.to_string(), "[::1]:8080");
    assert_eq!(config.http.prefix, "/");
    assert_eq!(config.http.max_body_size, 0);
    assert_eq!(config.broker.uri, "tcp://[::1]:1883");
    assert_eq!(config.broker.qos(), QoS::AtMostOnce);
    assert_eq!(config.broker.protocol_version(), ProtocolVersion::V311);
    assert!(config.broker.connect_retry);
    assert!(config.broker.auto_reconnect);
    assert_eq!(config.broker.disconnect_grace, Duration::from_millis(250));
    assert_eq!(
        config.broker.publish_timeout(),
        Some(Duration::from_secs(30))
    );
    assert!(!config.metrics.enabled);
    assert_eq!(config.metrics.bind.to_string(), "127.0.0.1:9090");
    assert!(config.validate().is_ok());
}

#[test]
fn test_parse_full_config() {
    let config = Config::parse(
        r#"
[log]
level = "debug"

[http]
bind = "0.0.0.0:8081"
prefix = "/devices/"
max_body_size = 65536

[broker]
uri = "mqtts://broker.example.com"
client_id = "bridge-1"
username = "bridge"
password_file = "/run/secrets/mqtt"
protocol_version = 5
qos = 2
keep_alive = 15
clean_start = false
reconnect_interval = "500ms"
max_reconnect_interval = "30s"
publish_timeout = "0s"
max_inflight = 16

[broker.tls]
ca_file = "/etc/ssl/private-ca.pem"

[metrics]
enabled = true
bind = "127.0.0.1:9191"
"#,
    )
    .unwrap();

    assert_eq!(config.log.level, "debug");
    assert_eq!(config.http.bind.port(), 8081);
    assert_eq!(config.http.prefix, "/devices/");
    assert_eq!(config.http.max_body_size, 65536);
    assert_eq!(config.broker.client_id, "bridge-1");
    assert_eq!(config.broker.username.as_deref(), Some("bridge"));
    assert_eq!(config.broker.protocol_version(), ProtocolVersion::V5);
    assert_eq!(config.broker.qos(), QoS::ExactlyOnce);
    assert!(!config.broker.clean_start);
    assert_eq!(
        config.broker.reconnect_interval,
        Duration::from_millis(500)
    );
    assert_eq!(config.broker.publish_timeout(), None);
    assert_eq!(config.broker.max_inflight, 16);
    assert!(config.broker.tls.ca_file.is_some());
    assert!(config.metrics.enabled);
    // Unspecified fields keep their defaults
    assert_eq!(config.broker.disconnect_grace, Duration::from_millis(250));
}

#[test]
fn test_validation_rejects_bad_qos() {
    let result = Config::parse("[broker]\nqos = 3\n");
    assert!(matches!(result, Err(ConfigError::Validation(_))));
}

#[test]
fn test_validation_rejects_bad_protocol_version() {
    let result = Config::parse("[broker]\nprotocol_version = 3\n");
    assert!(matches!(result, Err(ConfigError::Validation(_))));
}

#[test]
fn test_validation_rejects_bad_uri() {
    for uri in ["ws://broker:80", "tcp://", "broker:1883", "tcp://host:notaport"] {
        let toml = format!("[broker]\nuri = \"{}\"\n", uri);
        assert!(
            matches!(Config::parse(&toml), Err(ConfigError::Validation(_))),
            "uri {} should be rejected",
            uri
        );
    }
}

#[test]
fn test_validation_rejects_half_client_identity() {
    let result = Config::parse("[broker.tls]\nclient_cert = \"/tmp/cert.pem\"\n");
    assert!(matches!(result, Err(ConfigError::Validation(_))));
}

#[test]
fn test_validation_rejects_zero_max_packet_size() {
    let result = Config::parse("[broker]\nmax_packet_size = 0\n");
    assert!(matches!(result, Err(ConfigError::Validation(_))));
}

#[test]
fn test_validation_rejects_inverted_backoff() {
    let result = Config::parse(
        "[broker]\nreconnect_interval = \"10s\"\nmax_reconnect_interval = \"1s\"\n",
    );
    assert!(matches!(result, Err(ConfigError::Validation(_))));
}

#[test]
fn test_parse_invalid_toml() {
    let result = Config::parse("[broker\nqos = 1");
    assert!(matches!(result, Err(ConfigError::Parse(_))));
}

#[test]
fn test_load_config_with_env_substitution() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("httpmq.toml");

    std::env::set_var("HTTPMQ_TEST_BIND_PORT", "8099");
    std::fs::write(
        &config_path,
        r#"
[http]
bind = "127.0.0.1:${HTTPMQ_TEST_BIND_PORT}"
prefix = "${HTTPMQ_TEST_PREFIX:-/fallback/}"
"#,
    )
    .unwrap();

    let config = Config::load(&config_path).unwrap();
    assert_eq!(config.http.bind.to_string(), "127.0.0.1:8099");
    assert_eq!(config.http.prefix, "/fallback/");
    std::env::remove_var("HTTPMQ_TEST_BIND_PORT");
}

#[test]
fn test_load_missing_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::load(dir.path().join("absent.toml")).unwrap();
    assert_eq!(config.http.prefix, "/");
    assert_eq!(config.broker.max_inflight, 1000);
}

#[test]
fn test_env_overrides_file() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("httpmq.toml");
    std::fs::write(&config_path, "[broker]\nclient_id = \"from-file\"\n").unwrap();

    std::env::set_var("HTTPMQ__BROKER__CLIENT_ID", "from-env");
    std::env::set_var("HTTPMQ__BROKER__CONNECT_TIMEOUT", "5s");
    let config = Config::load(&config_path);
    std::env::remove_var("HTTPMQ__BROKER__CLIENT_ID");
    std::env::remove_var("HTTPMQ__BROKER__CONNECT_TIMEOUT");

    let config = config.unwrap();
    assert_eq!(config.broker.client_id, "from-env");
    assert_eq!(config.broker.connect_timeout, Duration::from_secs(5));
}

#[test]
fn test_load_password_byte_for_byte() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("password");
    std::fs::write(&path, b"s3cret \n").unwrap();

    let broker = BrokerConfig {
        password_file: Some(path.to_string_lossy().into_owned()),
        ..Default::default()
    };
    let password = broker.load_password().unwrap().unwrap();
    assert_eq!(&password[..], b"s3cret \n");
}

#[test]
fn test_load_password_expands_env() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("pw"), b"abc").unwrap();
    std::env::set_var("HTTPMQ_TEST_PW_DIR", dir.path());

    let broker = BrokerConfig {
        password_file: Some("${HTTPMQ_TEST_PW_DIR}/pw".to_string()),
        ..Default::default()
    };
    let password = broker.load_password();
    std::env::remove_var("HTTPMQ_TEST_PW_DIR");
    assert_eq!(&password.unwrap().unwrap()[..], b"abc");
}

#[test]
fn test_load_password_missing_file() {
    let broker = BrokerConfig {
        password_file: Some("/nonexistent/httpmq/password".to_string()),
        ..Default::default()
    };
    assert!(matches!(broker.load_password(), Err(ConfigError::Io(_))));
}

#[test]
fn test_load_password_not_configured() {
    assert!(BrokerConfig::default().load_password().unwrap().is_none());
}
