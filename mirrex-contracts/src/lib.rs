//! Trait surfaces that describe the replication core's external collaborators.
//!
//! The core never talks to a brick, a self-heal crawler, or its parent layer
//! directly; it goes through these contracts. Transports, daemons, and test
//! fakes implement them.

pub mod heal;
pub mod id;
pub mod notify;
pub mod subvolume;

/// Frequently used contract types for core and test crates.
pub mod prelude {
    pub use super::heal::{HealRequest, HealSink};
    pub use super::id::FdId;
    pub use super::notify::UpstreamNotifier;
    pub use super::subvolume::Subvolume;
}

pub use heal::{HealRequest, HealSink};
pub use id::FdId;
pub use notify::UpstreamNotifier;
pub use subvolume::Subvolume;
