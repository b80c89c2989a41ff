//! Loads the shipped configuration files

use artpost_core::config::ConfigManager;
use artpost_core::constants::EntityStatus;
use std::path::PathBuf;

fn config_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("config")
}

#[test]
fn test_shipped_base_config_is_valid() {
    let manager =
        ConfigManager::load_from_directory_with_env(Some(config_dir()), "development").unwrap();
    let config = manager.config();

    assert_eq!(manager.environment(), "development");
    assert_eq!(config.queue.concurrency, 2);
    assert_eq!(config.queue.max_attempts, 3);
    assert_eq!(
        config.lock_cleanup.statuses,
        vec![EntityStatus::Scheduled, EntityStatus::Draft]
    );
    assert_eq!(
        config
            .circuit_breakers
            .config_for_component("publish-api")
            .failure_threshold,
        3
    );
    assert_eq!(
        config
            .circuit_breakers
            .config_for_component("unknown-api")
            .failure_threshold,
        5
    );
}

#[test]
fn test_environment_overlays_apply() {
    let test = ConfigManager::load_from_directory_with_env(Some(config_dir()), "test").unwrap();
    assert_eq!(test.config().queue.poll_interval_ms, 10);
    assert_eq!(test.config().queue.concurrency, 2);

    let production =
        ConfigManager::load_from_directory_with_env(Some(config_dir()), "production").unwrap();
    assert_eq!(production.config().queue.concurrency, 4);
    assert_eq!(production.config().queue.publish_jitter_seconds, 120);
    assert_eq!(production.config().database.max_connections, 20);
}
