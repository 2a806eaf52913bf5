//! seqsub_config
//!
//! Configuration loading for the broker. Sources are layered: built-in
//! defaults, then an optional `config/default` file, then environment
//! variables (`SEQSUB_CLUSTER_ID=...` style with `_` as separator). Loaded
//! values are deserialized into partial structs and merged over
//! [`Settings::default`] so a missing file or field never fails startup.

pub mod settings;

use config::{Config, ConfigError, Environment, File};

use crate::settings::PartialSettings;

pub use settings::{
    ClientSettings, ClusterSettings, HeartbeatSettings, LimitSettings, Settings, StoreSettings,
};

/// Load settings from `config/default.*` (optional) and the environment.
pub fn load_config() -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name("config/default").required(false))
        .add_source(Environment::with_prefix("SEQSUB").separator("_"));

    build(builder)
}

/// Load settings from an explicit file path, still honoring environment
/// overrides. Used by the CLI `--config` flag and by tests.
pub fn load_config_file(path: &str) -> Result<Settings, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name(path))
        .add_source(Environment::with_prefix("SEQSUB").separator("_"));

    build(builder)
}

fn build(
    builder: config::builder::ConfigBuilder<config::builder::DefaultState>,
) -> Result<Settings, ConfigError> {
    let config = builder.build()?;
    let partial: PartialSettings = config.try_deserialize()?;
    Ok(partial.merge_over(Settings::default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn defaults_are_sane() {
        let s = Settings::default();
        assert_eq!(s.cluster.id, "test-cluster");
        assert_eq!(s.cluster.discover_prefix, "_SEQSUB.discover");
        assert_eq!(s.store.backend, "memory");
        assert!(s.store.dir.is_empty());
        assert_eq!(s.limits.max_channels, 100);
        assert_eq!(s.heartbeat.max_failed, 10);
        assert_eq!(s.clients.dup_cid_max_checks, 100);
    }

    #[test]
    fn partial_merge_keeps_defaults_for_missing_fields() {
        let partial = PartialSettings {
            cluster: Some(settings::PartialClusterSettings {
                id: Some("prod".to_string()),
                discover_prefix: None,
            }),
            limits: Some(settings::PartialLimitSettings {
                max_channels: Some(5),
                ..Default::default()
            }),
            ..Default::default()
        };

        let s = partial.merge_over(Settings::default());
        assert_eq!(s.cluster.id, "prod");
        assert_eq!(s.cluster.discover_prefix, "_SEQSUB.discover");
        assert_eq!(s.limits.max_channels, 5);
        assert_eq!(s.limits.max_subs, 1000);
    }

    #[test]
    fn load_config_file_overrides_defaults() {
        let tmp = tempfile::tempdir().expect("create tempdir");
        let path = tmp.path().join("broker.toml");
        let toml = r#"
            [cluster]
            id = "file-cluster"

            [store]
            backend = "file"
            dir = "/tmp/seqsub-data"

            [heartbeat]
            interval_ms = 200
        "#;
        fs::write(&path, toml).expect("write config file");

        let cfg = load_config_file(path.to_str().unwrap()).expect("load_config_file failed");
        assert_eq!(cfg.cluster.id, "file-cluster");
        assert_eq!(cfg.store.backend, "file");
        assert_eq!(cfg.store.dir, "/tmp/seqsub-data");
        assert_eq!(cfg.heartbeat.interval_ms, 200);
        // untouched sections keep their defaults
        assert_eq!(cfg.heartbeat.timeout_ms, 10_000);
        assert_eq!(cfg.limits.max_msgs, 1_000_000);
    }
}
