use shared_utils::config::{Config, ConfigError, ProbeKind};
use std::io::Write;
use tempfile::NamedTempFile;

#[test]
fn test_load_full_config() {
    let mut file = NamedTempFile::new().unwrap();

    let config_str = r#"
        [pool]
        overlay_cidr = "10.100.0.0/16"
        server_address = "10.100.0.1"
        routed_range = "10.100.1.1-10.100.1.253"

        [[pool.classes]]
        class = "control-plane"
        range = "10.100.0.2-10.100.0.254"

        [[pool.classes]]
        class = "worker"
        range = "10.100.1.1-10.100.1.253"

        [tunnel]
        interface = "wg0"
        definition_path = "/tmp/wg0.conf"
        exec_prefix = ["docker", "exec", "wireguard-server"]

        [peer]
        server_endpoint = "vpn.example.net"
        endpoint_port = 51821
        dns = ["1.1.1.1"]

        [supervisor]
        max_attempts = 4
        base_delay_ms = 100
        backoff_multiplier = 2.0
        probe = "handshake"

        [monitor]
        class = "worker"
        sweep_interval_secs = 15
        auto_reconnect = true

        [store]
        path = "/tmp/peerwarden.json"

        [logging]
        level = "warn"
        json = true
    "#;

    file.write_all(config_str.as_bytes()).unwrap();

    let config = Config::load(file.path()).unwrap();

    assert_eq!(config.pool.classes.len(), 2);
    assert_eq!(config.pool.classes[1].class, "worker");
    assert_eq!(config.tunnel.definition_path, "/tmp/wg0.conf");
    assert_eq!(
        config.tunnel.exec_prefix,
        vec!["docker", "exec", "wireguard-server"]
    );
    assert_eq!(config.peer.server_endpoint, "vpn.example.net");
    assert_eq!(config.peer.endpoint_port, 51821);
    assert_eq!(config.peer.dns, vec!["1.1.1.1".to_string()]);
    assert_eq!(config.peer.mtu, 1420);
    assert_eq!(config.supervisor.max_attempts, 4);
    assert_eq!(config.supervisor.backoff_multiplier, 2.0);
    assert_eq!(config.supervisor.probe, ProbeKind::Handshake);
    assert_eq!(config.monitor.sweep_interval_secs, 15);
    assert_eq!(config.monitor.reap_interval_secs, 60);
    assert!(config.monitor.auto_reconnect);
    assert_eq!(config.store.path.as_deref(), Some("/tmp/peerwarden.json"));
    assert!(config.logging.json);
}

#[test]
fn test_empty_file_uses_defaults() {
    let file = NamedTempFile::new().unwrap();

    let config = Config::load(file.path()).unwrap();

    assert_eq!(config.pool.server_address, "10.100.0.1");
    assert_eq!(config.peer.persistent_keepalive, 25);
    assert_eq!(config.supervisor.probe, ProbeKind::Ping);
    assert_eq!(config.monitor.connecting_timeout_secs, 120);
}

#[test]
fn test_missing_file() {
    let result = Config::load("/definitely/not/here/peerwarden.toml");
    assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
}

#[test]
fn test_invalid_toml() {
    let result = Config::from_toml("[pool\noverlay_cidr = ");
    assert!(matches!(result, Err(ConfigError::TomlError(_))));
}

#[test]
fn test_rejects_bad_range() {
    let config_str = r#"
        [[pool.classes]]
        class = "worker"
        range = "10.100.1.9-10.100.1.1"
    "#;

    let result = Config::from_toml(config_str);
    assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
}

#[test]
fn test_rejects_zero_attempts() {
    let config_str = r#"
        [supervisor]
        max_attempts = 0
    "#;

    match Config::from_toml(config_str) {
        Err(ConfigError::InvalidValue { key, .. }) => {
            assert_eq!(key, "supervisor.max_attempts");
        }
        other => panic!("expected invalid value error, got {other:?}"),
    }
}

#[test]
fn test_rejects_runaway_backoff() {
    for (config_str, expected_key) in [
        ("[supervisor]\nbackoff_multiplier = 1e300\n", "supervisor.backoff_multiplier"),
        ("[supervisor]\nmax_attempts = 500\n", "supervisor.max_attempts"),
        ("[supervisor]\nbase_delay_ms = 5000\nmax_delay_ms = 10\n", "supervisor.max_delay_ms"),
    ] {
        match Config::from_toml(config_str) {
            Err(ConfigError::InvalidValue { key, .. }) => assert_eq!(key, expected_key),
            other => panic!("expected invalid value error for {config_str:?}, got {other:?}"),
        }
    }

    let config = Config::from_toml("[supervisor]\nmax_attempts = 20\nbackoff_multiplier = 10.0\n")
        .unwrap();
    assert_eq!(config.supervisor.max_delay_ms, 60_000);
}

#[test]
fn test_rejects_unknown_probe() {
    let config_str = r#"
        [supervisor]
        probe = "telepathy"
    "#;

    assert!(Config::from_toml(config_str).is_err());
}
