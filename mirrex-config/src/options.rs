use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("replica count must be at least 1")]
    NoChildren,

    #[error("fixed quorum {quorum} exceeds replica count {children}")]
    QuorumTooLarge { quorum: usize, children: usize },

    #[error("arbiter and thin-arbiter are mutually exclusive")]
    ConflictingArbiters,

    #[error("arbiter requires at least 3 replicas, got {0}")]
    ArbiterNeedsThree(usize),

    #[error("thin-arbiter requires exactly 2 replicas, got {0}")]
    ThinArbiterNeedsTwo(usize),

    #[error("halo min_replicas {min} exceeds max_replicas {max}")]
    HaloBounds { min: usize, max: usize },

    #[error("pinned read child {read_child} out of range for {children} replicas")]
    ReadChildOutOfRange { read_child: usize, children: usize },
}

/// Quorum requirement for mutating operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QuorumCount {
    /// No quorum enforcement; a single surviving replica accepts writes.
    #[default]
    Disabled,
    /// Majority: floor(N/2) + 1.
    Auto,
    /// A fixed count, validated against the replica count.
    Fixed(usize),
}

impl QuorumCount {
    /// The concrete threshold for a set of `children` replicas; 0 means
    /// quorum is disabled.
    pub fn effective(self, children: usize) -> usize {
        match self {
            QuorumCount::Disabled => 0,
            QuorumCount::Auto => children / 2 + 1,
            QuorumCount::Fixed(count) => count,
        }
    }
}

/// Which replica services a read when several are eligible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReadHashMode {
    /// Lowest-index readable replica.
    #[default]
    FirstUp,
    /// Stable per-file spread: hash of the gfid.
    GfidHash,
    /// Per-file per-client spread: hash of gfid xor pid (directories fall
    /// back to plain gfid hashing).
    GfidPidHash,
    /// Fewest outstanding reads.
    LessLoad,
    /// Lowest ping latency.
    LeastLatency,
    /// Minimize (pending_reads + 1) * latency.
    LoadLatencyHybrid,
}

/// Automatic split-brain resolution policy applied when no explicit
/// split-brain choice is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FavoriteChildPolicy {
    #[default]
    None,
    /// Largest file wins.
    Size,
    /// Most recent modification wins.
    LatestMtime,
    /// Oldest creation wins.
    OldestCtime,
    /// The replica agreeing with the most peers on size wins.
    Majority,
}

/// Latency-aware replica selection bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HaloOptions {
    /// Pings above this demote a replica (ms).
    pub max_latency_ms: i64,
    /// Never demote below this many up replicas.
    pub min_replicas: usize,
    /// Never keep more than this many up replicas.
    pub max_replicas: usize,
}

impl Default for HaloOptions {
    fn default() -> Self {
        HaloOptions {
            max_latency_ms: 5,
            min_replicas: 2,
            max_replicas: 99999,
        }
    }
}

/// Witness replica used to break ties when N = 2.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ThinArbiterOptions {
    /// Address of the witness brick, opaque to the core.
    pub address: String,
    /// Name of the id file on the witness.
    pub id_file: String,
}

/// The full option set of one replica set. Immutable after validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReplicationOptions {
    pub quorum: QuorumCount,
    pub read_hash_mode: ReadHashMode,
    /// Operator-pinned read replica, overriding the hash mode when readable.
    pub read_child: Option<usize>,
    /// 0 or 1; when 1, replica 0 holds metadata only and never serves data.
    pub arbiter_count: usize,
    pub thin_arbiter: Option<ThinArbiterOptions>,
    /// Fail non-lock FOPs that started on a stale topology snapshot.
    pub consistent_io: bool,
    pub data_self_heal: bool,
    pub metadata_self_heal: bool,
    pub entry_self_heal: bool,
    pub favorite_child_policy: FavoriteChildPolicy,
    pub halo: Option<HaloOptions>,
    /// Lifetime of a manual split-brain choice before it auto-clears.
    pub spb_choice_timeout_secs: u64,
    /// How long a completed transaction may defer its post-op changelog.
    /// 0 flushes the changelog inline before the transaction unwinds.
    pub post_op_delay_ms: u64,
    /// Grace period for silent children before the initial aggregate event
    /// is propagated upward.
    pub stagger_timeout_secs: u64,
}

impl Default for ReplicationOptions {
    fn default() -> Self {
        ReplicationOptions {
            quorum: QuorumCount::Disabled,
            read_hash_mode: ReadHashMode::FirstUp,
            read_child: None,
            arbiter_count: 0,
            thin_arbiter: None,
            consistent_io: false,
            data_self_heal: true,
            metadata_self_heal: true,
            entry_self_heal: true,
            favorite_child_policy: FavoriteChildPolicy::None,
            halo: None,
            spb_choice_timeout_secs: 300,
            post_op_delay_ms: 0,
            stagger_timeout_secs: 10,
        }
    }
}

impl ReplicationOptions {
    /// Load from a TOML file plus `MIRREX_`-prefixed environment overrides
    /// (`MIRREX_CONSISTENT_IO=true`, …).
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(config::Environment::with_prefix("MIRREX"))
            .build()?;
        let options: ReplicationOptions = settings.try_deserialize()?;
        tracing::debug!(path = %path.display(), "loaded replication options");
        Ok(options)
    }

    /// Check the option set against the replica count it will govern.
    pub fn validate(&self, children: usize) -> Result<(), ConfigError> {
        if children == 0 {
            return Err(ConfigError::NoChildren);
        }
        if let QuorumCount::Fixed(count) = self.quorum
            && count > children
        {
            return Err(ConfigError::QuorumTooLarge {
                quorum: count,
                children,
            });
        }
        if self.arbiter_count > 0 && self.thin_arbiter.is_some() {
            return Err(ConfigError::ConflictingArbiters);
        }
        if self.arbiter_count > 0 && children < 3 {
            return Err(ConfigError::ArbiterNeedsThree(children));
        }
        if self.thin_arbiter.is_some() && children != 2 {
            return Err(ConfigError::ThinArbiterNeedsTwo(children));
        }
        if let Some(halo) = self.halo
            && halo.min_replicas > halo.max_replicas
        {
            return Err(ConfigError::HaloBounds {
                min: halo.min_replicas,
                max: halo.max_replicas,
            });
        }
        if let Some(read_child) = self.read_child
            && read_child >= children
        {
            return Err(ConfigError::ReadChildOutOfRange {
                read_child,
                children,
            });
        }
        Ok(())
    }

    pub fn spb_choice_timeout(&self) -> Duration {
        Duration::from_secs(self.spb_choice_timeout_secs)
    }

    pub fn post_op_delay(&self) -> Duration {
        Duration::from_millis(self.post_op_delay_ms)
    }

    pub fn stagger_timeout(&self) -> Duration {
        Duration::from_secs(self.stagger_timeout_secs)
    }

    pub fn halo_enabled(&self) -> bool {
        self.halo.is_some()
    }

    /// Whether any self-heal dimension is enabled at all.
    pub fn selfheal_enabled(&self) -> bool {
        self.data_self_heal || self.metadata_self_heal || self.entry_self_heal
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn quorum_thresholds() {
        assert_eq!(QuorumCount::Disabled.effective(3), 0);
        assert_eq!(QuorumCount::Auto.effective(2), 2);
        assert_eq!(QuorumCount::Auto.effective(3), 2);
        assert_eq!(QuorumCount::Auto.effective(5), 3);
        assert_eq!(QuorumCount::Fixed(2).effective(3), 2);
    }

    #[test]
    fn validation_rejects_bad_combinations() {
        let mut options = ReplicationOptions::default();
        assert!(options.validate(3).is_ok());

        options.quorum = QuorumCount::Fixed(4);
        assert!(matches!(
            options.validate(3),
            Err(ConfigError::QuorumTooLarge { .. })
        ));

        options.quorum = QuorumCount::Auto;
        options.arbiter_count = 1;
        options.thin_arbiter = Some(ThinArbiterOptions::default());
        assert!(matches!(
            options.validate(3),
            Err(ConfigError::ConflictingArbiters)
        ));

        options.arbiter_count = 0;
        assert!(matches!(
            options.validate(3),
            Err(ConfigError::ThinArbiterNeedsTwo(3))
        ));

        options.thin_arbiter = None;
        options.read_child = Some(5);
        assert!(matches!(
            options.validate(3),
            Err(ConfigError::ReadChildOutOfRange { .. })
        ));
    }

    #[test]
    fn loads_from_toml() {
        let mut file = tempfile::NamedTempFile::with_suffix(".toml").expect("tempfile");
        writeln!(
            file,
            "consistent_io = true\nread_hash_mode = \"gfid-hash\"\nquorum = \"auto\""
        )
        .expect("write config");
        let options = ReplicationOptions::load(file.path()).expect("load");
        assert!(options.consistent_io);
        assert_eq!(options.read_hash_mode, ReadHashMode::GfidHash);
        assert_eq!(options.quorum, QuorumCount::Auto);
    }
}
