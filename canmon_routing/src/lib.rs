//! Mesh routing layer.
//!
//! A routing table and a neighbour table, recomputed on mesh topology
//! events, plus message dispatch with a bounded recompute-and-retry
//! fallback on route misses.
//!
//! - [`table`] - Routing/neighbour tables with capacity and duplicate rules
//! - [`event`] - Mesh events in, routing notices out
//! - [`error`] - Error kinds at the routing boundary
//! - [`layer`] - `RoutingLayer`: workers, dispatch, config persistence

pub mod error;
pub mod event;
pub mod layer;
pub mod table;

pub use error::RoutingError;
pub use event::{MeshEvent, RoutingNotice, RoutingObserver};
pub use layer::{DispatchMode, MeshRadio, RoutingLayer, SimMeshRadio};
pub use table::{NeighbourEntry, NeighbourTable, NodeId, RouteEntry, RoutingTable};
