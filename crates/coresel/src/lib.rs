//! Consumable-resource node-selection engine.
//!
//! The engine answers two questions for a cluster controller: whether a
//! pending job can be placed (and on which exact cores and memory), and how
//! per-partition core occupancy must change as jobs start, end, suspend,
//! resume, expand or lose nodes. It owns the core map, the node usage table
//! and the partition row tables; jobs stay owned by the controller and are
//! passed in by table.

#[macro_use]
pub mod common;

pub mod coremap;
pub mod devices;
pub mod engine;
pub mod job;
pub mod node;
pub mod nodeinfo;
pub(crate) mod packer;
pub mod partition;
pub mod placement;
pub mod policy;
pub mod reservation;

#[cfg(test)]
mod tests;

define_id_type!(NodeId);
define_id_type!(JobId);
define_id_type!(PartitionId);
define_id_type!(SwitchId);

pub use common::error::SelectError;
pub use common::{Bitmap, Map, Set};
pub use devices::{DeviceSubsystem, NullDevices};
pub use engine::{AllocAction, PartitionConfig, SelectEngine, SwitchRecord};
pub use job::{Job, JobMap, JobResources};
pub use node::{NodeConfig, NodeReq};
pub use nodeinfo::RollupOutcome;
pub use placement::{JobRequest, Placement, SelectMode};
pub use policy::{CoreSelector, NodeSelector, SelectorPolicy};
pub use reservation::ResvRequest;

pub type Error = SelectError;
pub type Result<T> = std::result::Result<T, Error>;
