//! Client side of the metadata tier
//!
//! Partition map handling, routing and the typed meta client used by
//! filesystem frontends.

mod master;
mod meta;
mod partition;
mod router;

pub use master::{MasterClient, VolStat, VolStatus, VolumeInfo, VolumeView};
pub use meta::MetaClient;
pub use partition::{Partition, PartitionStatus, PartitionView};
pub use router::PartitionRouter;
