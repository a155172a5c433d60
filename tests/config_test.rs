use std::time::Duration;

use playbook_runner::config::{Config, DEFAULT_PLATFORM_BASE_URL};

const RUNNER_VARS: &[&str] = &[
    "RUNNER_CLUSTER_BASE_URL",
    "RUNNER_HTTPS_PORT",
    "RUNNER_API_TOKEN",
    "RUNNER_PLAYBOOK_LIMIT",
    "RUNNER_DEBUG",
    "RUNNER_PLATFORM_BASE_URL",
    "RUNNER_VERIFY_TLS",
    "RUNNER_REQUEST_TIMEOUT_SECS",
];

fn clear_runner_vars() {
    for name in RUNNER_VARS {
        unsafe { std::env::remove_var(name) };
    }
}

// Environment variables are process-wide, so every env scenario runs in
// this one test to keep them from interleaving.
#[test]
fn config_from_env_scenarios() {
    clear_runner_vars();

    let config = Config::from_env().unwrap();
    assert_eq!(config.playbook_limit, 4);
    assert_eq!(config.https_port, 443);
    assert!(config.api_token.is_none());
    assert!(!config.verify_tls);
    assert_eq!(config.base_url(), DEFAULT_PLATFORM_BASE_URL);

    unsafe {
        std::env::set_var("RUNNER_CLUSTER_BASE_URL", "https://soar.example.com/");
        std::env::set_var("RUNNER_HTTPS_PORT", "8443");
        std::env::set_var("RUNNER_API_TOKEN", "tok-123");
        std::env::set_var("RUNNER_PLAYBOOK_LIMIT", "7");
        std::env::set_var("RUNNER_DEBUG", "true");
        std::env::set_var("RUNNER_REQUEST_TIMEOUT_SECS", "30");
    }
    let config = Config::from_env().unwrap();
    assert_eq!(config.base_url(), "https://soar.example.com:8443");
    assert!(config.api_token.is_some());
    assert_eq!(config.playbook_limit, 7);
    assert!(config.debug);
    assert_eq!(config.log_directive(), "debug");
    assert_eq!(config.request_timeout, Some(Duration::from_secs(30)));

    // Unparsable limit falls back to the default.
    unsafe { std::env::set_var("RUNNER_PLAYBOOK_LIMIT", "lots") };
    assert_eq!(Config::from_env().unwrap().playbook_limit, 4);

    // A zero limit would never dispatch anything.
    unsafe { std::env::set_var("RUNNER_PLAYBOOK_LIMIT", "0") };
    assert!(Config::from_env().is_err());

    unsafe {
        std::env::set_var("RUNNER_PLAYBOOK_LIMIT", "2");
        std::env::set_var("RUNNER_HTTPS_PORT", "not-a-port");
    }
    assert!(Config::from_env().is_err());

    unsafe {
        std::env::set_var("RUNNER_HTTPS_PORT", "443");
        std::env::set_var("RUNNER_VERIFY_TLS", "maybe");
    }
    assert!(Config::from_env().is_err());

    clear_runner_vars();
}

#[test]
fn config_from_toml_reads_every_key() {
    let config = Config::from_toml_str(
        r#"
        cluster_base_url = "https://soar.internal"
        https_port = 9443
        cluster_api_token = "secret"
        playbook_limit = 10
        verify_tls = true
        request_timeout_secs = 5
        log_level = "warn"
        "#,
    )
    .unwrap();

    assert_eq!(config.base_url(), "https://soar.internal:9443");
    assert_eq!(config.playbook_limit, 10);
    assert!(config.verify_tls);
    assert!(config.api_token.is_some());
    assert_eq!(config.request_timeout, Some(Duration::from_secs(5)));
    assert_eq!(config.log_directive(), "warn");
}

#[test]
fn config_from_toml_defaults_missing_keys() {
    let config = Config::from_toml_str("").unwrap();
    assert_eq!(config.playbook_limit, 4);
    assert_eq!(config.base_url(), DEFAULT_PLATFORM_BASE_URL);
}

#[test]
fn config_from_toml_rejects_unknown_keys_and_zero_limit() {
    assert!(Config::from_toml_str("playbook_limt = 3").is_err());
    assert!(Config::from_toml_str("playbook_limit = 0").is_err());
}

#[test]
fn empty_cluster_host_uses_platform_default() {
    let config = Config::from_toml_str(
        r#"
        cluster_base_url = "  "
        platform_base_url = "https://10.0.0.5/"
        "#,
    )
    .unwrap();
    assert_eq!(config.base_url(), "https://10.0.0.5");
}

#[test]
fn config_debug_never_prints_token() {
    let config = Config::from_toml_str(r#"cluster_api_token = "very-secret-token""#).unwrap();
    assert!(!format!("{config:?}").contains("very-secret-token"));
}
