//! Routing and neighbour tables.
//!
//! Both tables are fixed-capacity and mutated in place under the layer's
//! table mutex. The routing table keeps its entries ordered by destination
//! and rejects duplicate destinations on insert.

use crate::error::RoutingError;
use canmon_common::consts::{MAX_ID_LEN, NEIGHBOUR_TABLE_CAP, ROUTING_TABLE_CAP};
use canmon_common::text::bounded_string;

/// A mesh node identifier.
pub type NodeId = heapless::String<MAX_ID_LEN>;

/// Build a [`NodeId`] from a string, truncating to the fixed capacity.
pub fn node_id(id: &str) -> NodeId {
    bounded_string(id)
}

/// One routing table entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteEntry {
    /// Destination node.
    pub dest_id: NodeId,
    /// Next hop towards the destination.
    pub next_hop: NodeId,
    /// Route cost.
    pub cost: u8,
    /// Tick timestamp of the last update.
    pub last_update_tick: u64,
}

/// One neighbour table entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NeighbourEntry {
    /// Neighbour node.
    pub id: NodeId,
    /// Received signal strength [dBm].
    pub rssi: i8,
    /// Link quality, 0..=255.
    pub link_quality: u8,
}

impl NeighbourEntry {
    /// Convenience constructor for a neighbour with nominal link stats.
    pub fn named(id: &str) -> Self {
        Self {
            id: node_id(id),
            rssi: -60,
            link_quality: 200,
        }
    }
}

/// Ordered routing table, up to 16 entries, unique destinations.
#[derive(Debug, Default)]
pub struct RoutingTable {
    entries: heapless::Vec<RouteEntry, ROUTING_TABLE_CAP>,
}

impl RoutingTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry, keeping destination order.
    ///
    /// # Errors
    ///
    /// `DuplicateRoute` when the destination already has an entry;
    /// `TableFull` at capacity.
    pub fn insert(&mut self, entry: RouteEntry) -> Result<(), RoutingError> {
        let position = match self
            .entries
            .binary_search_by(|e| e.dest_id.as_str().cmp(entry.dest_id.as_str()))
        {
            Ok(_) => return Err(RoutingError::DuplicateRoute(entry.dest_id.to_string())),
            Err(position) => position,
        };
        self.entries
            .insert(position, entry)
            .map_err(|_| RoutingError::TableFull(ROUTING_TABLE_CAP))
    }

    /// Replace the next hop, cost and tick of an existing entry.
    ///
    /// # Errors
    ///
    /// `NoRoute` when the destination has no entry.
    pub fn update(&mut self, entry: &RouteEntry) -> Result<(), RoutingError> {
        let existing = self
            .entries
            .iter_mut()
            .find(|e| e.dest_id == entry.dest_id)
            .ok_or_else(|| RoutingError::NoRoute(entry.dest_id.to_string()))?;
        existing.next_hop = entry.next_hop.clone();
        existing.cost = entry.cost;
        existing.last_update_tick = entry.last_update_tick;
        Ok(())
    }

    /// Remove and return the entry for a destination.
    ///
    /// # Errors
    ///
    /// `NoRoute` when the destination has no entry.
    pub fn remove(&mut self, dest: &str) -> Result<RouteEntry, RoutingError> {
        let position = self
            .entries
            .iter()
            .position(|e| e.dest_id.as_str() == dest)
            .ok_or_else(|| RoutingError::NoRoute(dest.to_string()))?;
        Ok(self.entries.remove(position))
    }

    /// Look up the entry for a destination.
    pub fn lookup(&self, dest: &str) -> Option<&RouteEntry> {
        self.entries
            .binary_search_by(|e| e.dest_id.as_str().cmp(dest))
            .ok()
            .map(|position| &self.entries[position])
    }

    /// Entries whose destination contains `group` as a substring.
    pub fn multicast_members(&self, group: &str) -> Vec<&RouteEntry> {
        self.entries
            .iter()
            .filter(|e| e.dest_id.contains(group))
            .collect()
    }

    /// All entries, in destination order.
    pub fn entries(&self) -> &[RouteEntry] {
        &self.entries
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// Neighbour table, up to 8 entries, replaced wholesale on topology events.
#[derive(Debug, Default)]
pub struct NeighbourTable {
    entries: heapless::Vec<NeighbourEntry, NEIGHBOUR_TABLE_CAP>,
}

impl NeighbourTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole table, truncating at capacity.
    ///
    /// Returns the number of neighbours retained.
    pub fn replace_all(&mut self, neighbours: &[NeighbourEntry]) -> usize {
        self.entries.clear();
        for neighbour in neighbours.iter().take(NEIGHBOUR_TABLE_CAP) {
            // Capacity checked by the take() above.
            let _ = self.entries.push(neighbour.clone());
        }
        self.entries.len()
    }

    /// All neighbours.
    pub fn entries(&self) -> &[NeighbourEntry] {
        &self.entries
    }

    /// Number of neighbours.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no neighbours are known.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(dest: &str, hop: &str) -> RouteEntry {
        RouteEntry {
            dest_id: node_id(dest),
            next_hop: node_id(hop),
            cost: 1,
            last_update_tick: 10,
        }
    }

    #[test]
    fn insert_keeps_destination_order() {
        let mut table = RoutingTable::new();
        table.insert(route("charlie", "charlie")).unwrap();
        table.insert(route("alpha", "alpha")).unwrap();
        table.insert(route("bravo", "bravo")).unwrap();

        let order: Vec<_> = table.entries().iter().map(|e| e.dest_id.as_str()).collect();
        assert_eq!(order, vec!["alpha", "bravo", "charlie"]);
    }

    #[test]
    fn duplicate_destination_is_rejected() {
        let mut table = RoutingTable::new();
        table.insert(route("alpha", "alpha")).unwrap();
        assert!(matches!(
            table.insert(route("alpha", "bravo")),
            Err(RoutingError::DuplicateRoute(_))
        ));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn insert_then_remove_restores_state() {
        let mut table = RoutingTable::new();
        table.insert(route("alpha", "alpha")).unwrap();
        let before: Vec<_> = table.entries().to_vec();

        table.insert(route("bravo", "bravo")).unwrap();
        table.remove("bravo").unwrap();

        assert_eq!(table.entries(), &before[..]);
    }

    #[test]
    fn table_capacity_is_enforced() {
        let mut table = RoutingTable::new();
        for i in 0..ROUTING_TABLE_CAP {
            table.insert(route(&format!("node{i:02}"), "hop")).unwrap();
        }
        assert!(matches!(
            table.insert(route("overflow", "hop")),
            Err(RoutingError::TableFull(_))
        ));
    }

    #[test]
    fn update_requires_existing_destination() {
        let mut table = RoutingTable::new();
        assert!(matches!(
            table.update(&route("ghost", "hop")),
            Err(RoutingError::NoRoute(_))
        ));

        table.insert(route("alpha", "alpha")).unwrap();
        let mut changed = route("alpha", "relay");
        changed.cost = 7;
        table.update(&changed).unwrap();
        let entry = table.lookup("alpha").unwrap();
        assert_eq!(entry.next_hop.as_str(), "relay");
        assert_eq!(entry.cost, 7);
    }

    #[test]
    fn multicast_matches_substring_groups() {
        let mut table = RoutingTable::new();
        table.insert(route("motor_control_ecu", "a")).unwrap();
        table.insert(route("brake_control_ecu", "b")).unwrap();
        table.insert(route("monitor_ecu", "c")).unwrap();

        assert_eq!(table.multicast_members("control").len(), 2);
        assert_eq!(table.multicast_members("ecu").len(), 3);
        assert!(table.multicast_members("gearbox").is_empty());
    }

    #[test]
    fn neighbour_table_truncates_at_capacity() {
        let mut table = NeighbourTable::new();
        let many: Vec<_> = (0..12).map(|i| NeighbourEntry::named(&format!("n{i}"))).collect();
        assert_eq!(table.replace_all(&many), NEIGHBOUR_TABLE_CAP);
        assert_eq!(table.len(), NEIGHBOUR_TABLE_CAP);
    }
}
