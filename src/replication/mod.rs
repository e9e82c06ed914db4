// Replication roles, one per node flavour, plus the two inter-tier
// triggers. Roles receive their store and peer handles at construction and
// hold no reference back to the owning node.
pub mod eager;
pub mod origin_sync;
pub mod passive;
pub mod tier_sync;

pub use eager::EagerReplication;
pub use origin_sync::OriginSync;
pub use passive::PassiveReplication;
pub use tier_sync::TierSync;
