// SPDX-License-Identifier: MIT OR Apache-2.0
//! Deep validation tests for `rmi-config`.

use rmi_config::{
    Config, ConfigError, ConfigWarning, MessagingConfig, PluginConfig, PoolConfig, merge_configs,
    parse_toml, validate_config, MAX_POOL_CAPACITY,
};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Fully-specified config with no validation warnings.
fn fully_valid_config() -> Config {
    let mut config = Config::default();
    config.messaging = MessagingConfig { url: "amqp://localhost:5672".into(), authenticator: Some("hmac".into()) };
    config.plugins.insert(
        "echo".into(),
        PluginConfig {
            queue: "Q-echo".into(),
            exchange: "agent.direct".into(),
            routing_key: "echo".into(),
            pool: PoolConfig { capacity: 4, backlog: 16 },
        },
    );
    config.pending.dir = "/tmp/rmi-pending".into();
    config.instance_lock.path = "/tmp/rmi.lock".into();
    config.control.bind_addr = "127.0.0.1:9000".into();
    config
}

/// Extract error reasons from a `ConfigError::ValidationError`.
fn validation_reasons(err: ConfigError) -> Vec<String> {
    match err {
        ConfigError::ValidationError { reasons } => reasons,
        other => panic!("expected ValidationError, got {other:?}"),
    }
}

// ---------------------------------------------------------------------------
// Happy path
// ---------------------------------------------------------------------------

#[test]
fn fully_valid_config_produces_no_warnings() {
    let warnings = validate_config(&fully_valid_config()).unwrap();
    assert!(warnings.is_empty(), "unexpected warnings: {warnings:?}");
}

#[test]
fn default_config_is_valid_but_warns_about_no_plugins() {
    let warnings = validate_config(&Config::default()).unwrap();
    assert_eq!(warnings.len(), 1);
    assert!(matches!(&warnings[0], ConfigWarning::MissingOptionalField { field, .. } if field == "plugins"));
}

// ---------------------------------------------------------------------------
// messaging.url
// ---------------------------------------------------------------------------

#[test]
fn blank_messaging_url_is_rejected() {
    let mut config = fully_valid_config();
    config.messaging.url = "   ".into();
    let reasons = validation_reasons(validate_config(&config).unwrap_err());
    assert!(reasons.iter().any(|r| r.contains("messaging.url")));
}

// ---------------------------------------------------------------------------
// plugins
// ---------------------------------------------------------------------------

#[test]
fn plugin_with_empty_queue_is_rejected() {
    let mut config = fully_valid_config();
    config.plugins.get_mut("echo").unwrap().queue = String::new();
    let reasons = validation_reasons(validate_config(&config).unwrap_err());
    assert!(reasons.iter().any(|r| r.contains("queue")));
}

#[test]
fn plugin_with_empty_exchange_is_rejected() {
    let mut config = fully_valid_config();
    config.plugins.get_mut("echo").unwrap().exchange = String::new();
    let reasons = validation_reasons(validate_config(&config).unwrap_err());
    assert!(reasons.iter().any(|r| r.contains("exchange")));
}

#[test]
fn plugin_with_empty_routing_key_is_rejected() {
    let mut config = fully_valid_config();
    config.plugins.get_mut("echo").unwrap().routing_key = String::new();
    let reasons = validation_reasons(validate_config(&config).unwrap_err());
    assert!(reasons.iter().any(|r| r.contains("routing_key")));
}

#[test]
fn multiple_invalid_plugin_fields_all_surface_as_reasons() {
    let mut config = fully_valid_config();
    {
        let echo = config.plugins.get_mut("echo").unwrap();
        echo.queue = String::new();
        echo.exchange = String::new();
    }
    let reasons = validation_reasons(validate_config(&config).unwrap_err());
    assert!(reasons.iter().any(|r| r.contains("queue")));
    assert!(reasons.iter().any(|r| r.contains("exchange")));
}

// ---------------------------------------------------------------------------
// pool.capacity / pool.backlog
// ---------------------------------------------------------------------------

#[test]
fn zero_capacity_is_rejected() {
    let mut config = fully_valid_config();
    config.plugins.get_mut("echo").unwrap().pool.capacity = 0;
    let reasons = validation_reasons(validate_config(&config).unwrap_err());
    assert!(reasons.iter().any(|r| r.contains("capacity")));
}

#[test]
fn zero_backlog_is_rejected() {
    let mut config = fully_valid_config();
    config.plugins.get_mut("echo").unwrap().pool.backlog = 0;
    let reasons = validation_reasons(validate_config(&config).unwrap_err());
    assert!(reasons.iter().any(|r| r.contains("backlog")));
}

#[test]
fn capacity_exactly_at_maximum_is_accepted_with_a_warning() {
    let mut config = fully_valid_config();
    config.plugins.get_mut("echo").unwrap().pool.capacity = MAX_POOL_CAPACITY;
    let warnings = validate_config(&config).unwrap();
    assert!(warnings.iter().any(|w| matches!(w, ConfigWarning::LargePoolCapacity { .. })));
}

#[test]
fn capacity_one_above_maximum_is_rejected() {
    let mut config = fully_valid_config();
    config.plugins.get_mut("echo").unwrap().pool.capacity = MAX_POOL_CAPACITY + 1;
    let reasons = validation_reasons(validate_config(&config).unwrap_err());
    assert!(reasons.iter().any(|r| r.contains("exceeds the maximum")));
}

// ---------------------------------------------------------------------------
// pending / instance_lock / control
// ---------------------------------------------------------------------------

#[test]
fn blank_pending_dir_is_rejected() {
    let mut config = fully_valid_config();
    config.pending.dir = String::new();
    let reasons = validation_reasons(validate_config(&config).unwrap_err());
    assert!(reasons.iter().any(|r| r.contains("pending.dir")));
}

#[test]
fn blank_instance_lock_path_is_rejected() {
    let mut config = fully_valid_config();
    config.instance_lock.path = String::new();
    let reasons = validation_reasons(validate_config(&config).unwrap_err());
    assert!(reasons.iter().any(|r| r.contains("instance_lock.path")));
}

#[test]
fn malformed_bind_addr_is_rejected() {
    let mut config = fully_valid_config();
    config.control.bind_addr = "localhost".into();
    let reasons = validation_reasons(validate_config(&config).unwrap_err());
    assert!(reasons.iter().any(|r| r.contains("bind_addr")));
}

#[test]
fn bind_addr_without_port_is_rejected() {
    let mut config = fully_valid_config();
    config.control.bind_addr = "127.0.0.1".into();
    assert!(validate_config(&config).is_err());
}

// ---------------------------------------------------------------------------
// parsing
// ---------------------------------------------------------------------------

#[test]
fn parse_toml_rejects_unknown_top_level_shape() {
    let err = parse_toml("messaging = \"not a table\"").unwrap_err();
    assert!(matches!(err, ConfigError::ParseError { .. }));
}

#[test]
fn parse_toml_round_trips_every_section() {
    let toml = r#"
    [messaging]
    url = "amqp://bus:5672"

    [plugins.a]
    queue = "Q-a"
    exchange = "ex"
    routing_key = "a"

    [plugins.b]
    queue = "Q-b"
    exchange = "ex"
    routing_key = "b"

    [plugins.b.pool]
    capacity = 2
    backlog = 8
    "#;
    let config = parse_toml(toml).unwrap();
    assert_eq!(config.plugins.len(), 2);
    assert_eq!(config.plugins["b"].pool.capacity, 2);
    // plugin "a" didn't specify a pool table, so it gets the default.
    assert_eq!(config.plugins["a"].pool.backlog, 16);
}

// ---------------------------------------------------------------------------
// merge_configs
// ---------------------------------------------------------------------------

#[test]
fn merge_keeps_base_authenticator_when_overlay_omits_one() {
    let mut base = fully_valid_config();
    base.messaging.authenticator = Some("hmac".into());
    let mut overlay = Config::default();
    overlay.messaging.authenticator = None;
    let merged = merge_configs(base, overlay);
    assert_eq!(merged.messaging.authenticator.as_deref(), Some("hmac"));
}

#[test]
fn merge_overlay_authenticator_wins_when_both_set() {
    let mut base = fully_valid_config();
    base.messaging.authenticator = Some("hmac".into());
    let mut overlay = Config::default();
    overlay.messaging.authenticator = Some("none".into());
    let merged = merge_configs(base, overlay);
    assert_eq!(merged.messaging.authenticator.as_deref(), Some("none"));
}

#[test]
fn merged_config_still_passes_validation() {
    let base = fully_valid_config();
    let overlay = Config::default();
    let merged = merge_configs(base, overlay);
    assert!(validate_config(&merged).is_ok());
}
