//! Durable cluster topology, stored as a JSON document.

use rusqlite::Connection;

use crate::error::Result;
use crate::topology::ClusterTopology;

use super::term::{get_value, put_value, TOPOLOGY};

pub fn get_topology(conn: &Connection) -> Result<ClusterTopology> {
    match get_value(conn, TOPOLOGY)? {
        Some(raw) => Ok(serde_json::from_slice(&raw)?),
        None => Ok(ClusterTopology::new_passive()),
    }
}

pub(crate) fn set_topology(conn: &Connection, topology: &ClusterTopology) -> Result<()> {
    let raw = serde_json::to_vec(topology)?;
    put_value(conn, TOPOLOGY, &raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::RaftStorage;
    use crate::topology::TopologyModification;

    #[test]
    fn missing_topology_is_passive() {
        let storage = RaftStorage::open_in_memory().unwrap();
        let topology = storage.with_read(|conn| get_topology(conn)).unwrap();
        assert!(topology.is_passive());
    }

    #[test]
    fn topology_is_replaced_atomically() {
        let storage = RaftStorage::open_in_memory().unwrap();
        let first = ClusterTopology::bootstrap("A", "local://a");
        let second = first.with_modification("B", "local://b", TopologyModification::Voter);

        storage.with_write(|conn| set_topology(conn, &first)).unwrap();
        storage.with_write(|conn| set_topology(conn, &second)).unwrap();

        let stored = storage.with_read(|conn| get_topology(conn)).unwrap();
        assert_eq!(stored, second);
        assert_eq!(stored.topology_id, first.topology_id);
    }
}
