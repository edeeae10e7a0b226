//! Replica-set configuration: the immutable knobs a mirrex volume is built
//! with. Loading goes through the `config` crate (TOML file plus `MIRREX_`
//! environment overrides); everything is validated against the child count
//! before the replica set will accept it.

mod options;

pub use options::{
    ConfigError, FavoriteChildPolicy, HaloOptions, QuorumCount, ReadHashMode,
    ReplicationOptions, ThinArbiterOptions,
};
