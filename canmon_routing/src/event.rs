//! Mesh events in, routing notices out.

use crate::table::NeighbourEntry;

/// Topology event delivered by the mesh radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshEvent {
    /// The neighbour set changed; carries the new neighbour list.
    NeighbourChange(Vec<NeighbourEntry>),
    /// This node connected to a mesh parent.
    ParentConnected,
    /// The mesh elected a different root.
    RootSwitched,
    /// Any other radio event; ignored with a warning.
    Other(u32),
}

/// Notice delivered to routing subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingNotice {
    /// The routing table was recomputed.
    TableUpdated {
        /// Entries now in the table.
        routes: usize,
    },
    /// The neighbour table was replaced.
    NeighbourTableUpdated {
        /// Neighbours now in the table.
        neighbours: usize,
    },
    /// Dispatch failed after the recompute/retry fallback.
    RouteFailure {
        /// The unroutable destination or group.
        dest: String,
    },
    /// A message arrived for this node.
    MessageReceived {
        /// Originating node.
        src: String,
        /// Message payload.
        data: Vec<u8>,
    },
}

/// Subscriber to routing notices.
///
/// Dispatch is a plain loop over the bounded subscriber list; the notice
/// is borrowed for the duration of the call and owned by the dispatching
/// worker.
pub trait RoutingObserver: Send + Sync {
    /// Called once per notice.
    fn on_event(&self, notice: &RoutingNotice);
}
