//! Loading configuration from files and environment overrides.

use std::collections::HashMap;
use std::io::Write;

use api_cluster::config::{AppConfig, ConfigError, ConfigLoader};
use tempfile::NamedTempFile;

fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
    let map: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect();
    move |key| map.get(key).cloned()
}

fn config_file(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn test_empty_file_uses_defaults() {
    let file = config_file("");
    let loader = ConfigLoader::with_path(file.path().to_path_buf());
    let config = loader.load_with_env(env(&[])).unwrap();

    assert!(!config.clustering);
    assert_eq!(config.server.port, 3000);
    assert_eq!(config.cluster.alert_threshold, 5);
    assert!(config.cluster.workers.is_none());
}

#[test]
fn test_file_values_are_loaded() {
    let file = config_file(
        r#"
clustering = true
environment = "production"
swagger_url = "api.example.com"

[server]
port = 8080

[cluster]
workers = 4
alert_threshold = 3
alert_policy = "every_multiple"

[alert]
webhook_url = "http://alerts.example.com/hook"
recipient = "oncall@example.com"
"#,
    );

    let config = ConfigLoader::with_path(file.path().to_path_buf())
        .load_with_env(env(&[]))
        .unwrap();

    assert!(config.clustering);
    assert!(config.is_production());
    assert_eq!(config.swagger_url.as_deref(), Some("api.example.com"));
    assert_eq!(config.server.port, 8080);
    assert_eq!(config.cluster.resolve_worker_count().unwrap(), 4);
    assert_eq!(config.cluster.alert_threshold, 3);
    assert_eq!(
        config.cluster.alert_policy,
        api_cluster::supervisor::AlertPolicy::EveryMultiple
    );
    assert_eq!(config.alert.recipient, "oncall@example.com");
}

#[test]
fn test_env_overrides_file() {
    let file = config_file("[server]\nport = 8080\n\n[cluster]\nworkers = 4\n");

    let config = ConfigLoader::with_path(file.path().to_path_buf())
        .load_with_env(env(&[
            ("PORT", "9090"),
            ("WORKERS", "2"),
            ("CLUSTERING", "true"),
            ("NODE_ENV", "staging"),
            ("ALERT_THRESHOLD", "7"),
        ]))
        .unwrap();

    assert_eq!(config.server.port, 9090);
    assert_eq!(config.cluster.workers, Some(2));
    assert!(config.clustering);
    assert_eq!(config.environment, "staging");
    assert_eq!(config.cluster.alert_threshold, 7);
}

#[test]
fn test_explicit_missing_file_is_read_error() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("typo.toml");

    let result = ConfigLoader::with_path(missing.clone()).load_with_env(env(&[]));
    match result {
        Err(ConfigError::ReadError { path, .. }) => assert_eq!(path, missing),
        other => panic!("expected a read error, got {other:?}"),
    }
}

#[test]
fn test_invalid_toml_is_parse_error() {
    let file = config_file("clustering = [not toml");
    let result = ConfigLoader::with_path(file.path().to_path_buf()).load_with_env(env(&[]));
    assert!(matches!(result, Err(ConfigError::ParseError { .. })));
}

#[test]
fn test_zero_workers_rejected() {
    let file = config_file("");
    let loader = ConfigLoader::with_path(file.path().to_path_buf());
    let result = loader.load_with_env(env(&[("WORKERS", "0")]));
    assert!(matches!(result, Err(ConfigError::InvalidWorkerCount(0))));
}

#[test]
fn test_unparseable_env_reports_key() {
    let file = config_file("");
    let loader = ConfigLoader::with_path(file.path().to_path_buf());
    let err = loader
        .load_with_env(env(&[("PORT", "eighty")]))
        .unwrap_err();
    match err {
        ConfigError::InvalidEnv { key, value } => {
            assert_eq!(key, "PORT");
            assert_eq!(value, "eighty");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_invalid_webhook_url_rejected() {
    let file = config_file("");
    let loader = ConfigLoader::with_path(file.path().to_path_buf());
    let result = loader.load_with_env(env(&[("ALERT_WEBHOOK_URL", "not a url")]));
    assert!(matches!(result, Err(ConfigError::InvalidUrl { .. })));
}

#[test]
fn test_default_search_paths() {
    let loader = ConfigLoader::new();
    let paths = loader.search_paths();
    assert_eq!(paths[0].to_str(), Some(".api-cluster.toml"));
    assert!(paths
        .iter()
        .skip(1)
        .all(|p| p.ends_with("api-cluster/config.toml")));
}

#[test]
fn test_config_serializes_back_to_toml() {
    let config = AppConfig::default();
    let text = toml::to_string(&config).unwrap();
    let parsed: AppConfig = toml::from_str(&text).unwrap();
    assert_eq!(parsed.server.port, config.server.port);
    assert_eq!(parsed.cluster.alert_policy, config.cluster.alert_policy);
}
