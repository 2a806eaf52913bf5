use serde::Deserialize;

/// Top-level configuration for a seqsub broker.
///
/// Aggregates the cluster identity, the persistence backend selection, the
/// per-channel limits and the liveness tuning knobs. Every field has a
/// default so a broker can run with no configuration file at all.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    /// Cluster identity and the discovery subject prefix clients use to
    /// find this broker on the bus.
    pub cluster: ClusterSettings,
    /// Persistence backend selection.
    pub store: StoreSettings,
    /// Per-channel admission and retention limits.
    pub limits: LimitSettings,
    /// Heartbeat-driven client liveness.
    pub heartbeat: HeartbeatSettings,
    /// Duplicate client-id arbitration.
    pub clients: ClientSettings,
}

/// Identity of the broker on the bus.
#[derive(Debug, Deserialize, Clone)]
pub struct ClusterSettings {
    /// Cluster id; part of the discovery subject and pinned by the file
    /// store across restarts.
    pub id: String,
    /// Prefix of the connect subject: clients send connect requests to
    /// `<discover_prefix>.<id>`.
    pub discover_prefix: String,
}

/// Which store backend to open.
#[derive(Debug, Deserialize, Clone)]
pub struct StoreSettings {
    /// `"memory"` or `"file"`. Anything else is a fatal startup error.
    pub backend: String,
    /// Directory for the file backend; must be non-empty when
    /// `backend = "file"`.
    pub dir: String,
}

/// Channel limits, enforced before admission.
#[derive(Debug, Deserialize, Clone)]
pub struct LimitSettings {
    pub max_channels: usize,
    pub max_subs: usize,
    pub max_msgs: usize,
    pub max_payload_bytes: usize,
    /// Message age limit in seconds; 0 disables age-based eviction.
    pub max_age_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HeartbeatSettings {
    pub interval_ms: u64,
    pub timeout_ms: u64,
    /// Consecutive missed heartbeats before the client is purged.
    pub max_failed: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClientSettings {
    /// How long the broker pings an existing client before declaring a
    /// connect with the same id a takeover.
    pub dup_cid_timeout_ms: u64,
    /// Maximum number of duplicate-id arbitrations running in parallel.
    pub dup_cid_max_checks: usize,
}

/// Partial mirror of [`Settings`] for merging file/environment sources over
/// the defaults. Missing sections or fields fall back to
/// `Settings::default()`.
#[derive(Debug, Default, Deserialize)]
pub struct PartialSettings {
    pub cluster: Option<PartialClusterSettings>,
    pub store: Option<PartialStoreSettings>,
    pub limits: Option<PartialLimitSettings>,
    pub heartbeat: Option<PartialHeartbeatSettings>,
    pub clients: Option<PartialClientSettings>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialClusterSettings {
    pub id: Option<String>,
    pub discover_prefix: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialStoreSettings {
    pub backend: Option<String>,
    pub dir: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialLimitSettings {
    pub max_channels: Option<usize>,
    pub max_subs: Option<usize>,
    pub max_msgs: Option<usize>,
    pub max_payload_bytes: Option<usize>,
    pub max_age_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialHeartbeatSettings {
    pub interval_ms: Option<u64>,
    pub timeout_ms: Option<u64>,
    pub max_failed: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PartialClientSettings {
    pub dup_cid_timeout_ms: Option<u64>,
    pub dup_cid_max_checks: Option<usize>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cluster: ClusterSettings {
                id: "test-cluster".to_string(),
                discover_prefix: "_SEQSUB.discover".to_string(),
            },
            store: StoreSettings {
                backend: "memory".to_string(),
                dir: String::new(),
            },
            limits: LimitSettings {
                max_channels: 100,
                max_subs: 1000,
                max_msgs: 1_000_000,
                max_payload_bytes: 1024 * 1024,
                max_age_secs: 0,
            },
            heartbeat: HeartbeatSettings {
                interval_ms: 30_000,
                timeout_ms: 10_000,
                max_failed: 10,
            },
            clients: ClientSettings {
                dup_cid_timeout_ms: 1_000,
                dup_cid_max_checks: 100,
            },
        }
    }
}

impl PartialSettings {
    /// Layer this partial over `base`, taking every field that was present
    /// in the loaded sources.
    pub fn merge_over(self, base: Settings) -> Settings {
        let cluster = self.cluster.unwrap_or_default();
        let store = self.store.unwrap_or_default();
        let limits = self.limits.unwrap_or_default();
        let heartbeat = self.heartbeat.unwrap_or_default();
        let clients = self.clients.unwrap_or_default();

        Settings {
            cluster: ClusterSettings {
                id: cluster.id.unwrap_or(base.cluster.id),
                discover_prefix: cluster
                    .discover_prefix
                    .unwrap_or(base.cluster.discover_prefix),
            },
            store: StoreSettings {
                backend: store.backend.unwrap_or(base.store.backend),
                dir: store.dir.unwrap_or(base.store.dir),
            },
            limits: LimitSettings {
                max_channels: limits.max_channels.unwrap_or(base.limits.max_channels),
                max_subs: limits.max_subs.unwrap_or(base.limits.max_subs),
                max_msgs: limits.max_msgs.unwrap_or(base.limits.max_msgs),
                max_payload_bytes: limits
                    .max_payload_bytes
                    .unwrap_or(base.limits.max_payload_bytes),
                max_age_secs: limits.max_age_secs.unwrap_or(base.limits.max_age_secs),
            },
            heartbeat: HeartbeatSettings {
                interval_ms: heartbeat.interval_ms.unwrap_or(base.heartbeat.interval_ms),
                timeout_ms: heartbeat.timeout_ms.unwrap_or(base.heartbeat.timeout_ms),
                max_failed: heartbeat.max_failed.unwrap_or(base.heartbeat.max_failed),
            },
            clients: ClientSettings {
                dup_cid_timeout_ms: clients
                    .dup_cid_timeout_ms
                    .unwrap_or(base.clients.dup_cid_timeout_ms),
                dup_cid_max_checks: clients
                    .dup_cid_max_checks
                    .unwrap_or(base.clients.dup_cid_max_checks),
            },
        }
    }
}
