//! Mapping from node identifiers to PartyIDs.
//!
//! The epoch's participant list is ordered (it comes from the magic block),
//! and a participant's PartyID is its position in that list plus one.
//! Identifiers that cannot be used are excluded from the epoch before
//! positions are assigned, so the mapping stays dense and collision-free.

use std::collections::HashMap;

use tracing::warn;

use beacon_types::PartyId;

use crate::engine::DkgError;

const MAX_NODE_ID_LEN: usize = 128;

/// Ordered set of the epoch's active participants.
#[derive(Debug, Clone, Default)]
pub struct PartyRoster {
    members: Vec<String>,
    lookup: HashMap<String, PartyId>,
    excluded: Vec<String>,
}

impl PartyRoster {
    /// Build a roster, excluding malformed or repeated identifiers.
    pub fn from_node_ids<I, S>(node_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut roster = Self::default();
        for node_id in node_ids {
            let node_id = node_id.as_ref();
            if let Err(e) = roster.admit(node_id) {
                warn!(node_id, error = %e, "Excluding participant from epoch");
                roster.excluded.push(node_id.to_string());
            }
        }
        roster
    }

    fn admit(&mut self, node_id: &str) -> Result<(), DkgError> {
        validate_node_id(node_id)?;
        if self.lookup.contains_key(node_id) {
            return Err(DkgError::InvalidIdentity(format!(
                "duplicate node id {node_id}"
            )));
        }
        let party = PartyId::from_index(self.members.len())
            .ok_or_else(|| DkgError::InvalidIdentity("roster is full".to_string()))?;
        self.members.push(node_id.to_string());
        self.lookup.insert(node_id.to_string(), party);
        Ok(())
    }

    /// PartyID of a node identifier.
    pub fn resolve(&self, node_id: &str) -> Result<PartyId, DkgError> {
        self.lookup
            .get(node_id)
            .copied()
            .ok_or_else(|| DkgError::InvalidIdentity(format!("unknown node id {node_id}")))
    }

    pub fn node_id(&self, party: PartyId) -> Option<&str> {
        self.members.get(party.index()).map(String::as_str)
    }

    pub fn contains(&self, party: PartyId) -> bool {
        party.index() < self.members.len()
    }

    pub fn parties(&self) -> impl Iterator<Item = PartyId> + '_ {
        (0..self.members.len()).filter_map(PartyId::from_index)
    }

    pub fn node_ids(&self) -> &[String] {
        &self.members
    }

    /// Identifiers rejected while building the roster.
    pub fn excluded(&self) -> &[String] {
        &self.excluded
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

fn validate_node_id(node_id: &str) -> Result<(), DkgError> {
    if node_id.is_empty() {
        return Err(DkgError::InvalidIdentity("empty node id".to_string()));
    }
    if node_id.len() > MAX_NODE_ID_LEN {
        return Err(DkgError::InvalidIdentity(format!(
            "node id longer than {MAX_NODE_ID_LEN} bytes"
        )));
    }
    if node_id.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(DkgError::InvalidIdentity(format!(
            "node id {node_id:?} contains whitespace or control characters"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_ids() {
        let roster = PartyRoster::from_node_ids(["miner-a", "miner-b", "miner-c"]);
        assert_eq!(roster.len(), 3);
        assert_eq!(roster.resolve("miner-a").unwrap().get(), 1);
        assert_eq!(roster.resolve("miner-c").unwrap().get(), 3);
        assert_eq!(roster.node_id(PartyId::new(2).unwrap()), Some("miner-b"));
        assert_eq!(
            roster.parties().map(PartyId::get).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
    }

    #[test]
    fn test_malformed_ids_are_excluded() {
        let long = "x".repeat(MAX_NODE_ID_LEN + 1);
        let roster = PartyRoster::from_node_ids(vec![
            "miner-a",
            "",
            "bad id",
            "miner-a",
            long.as_str(),
            "miner-b",
        ]);

        assert_eq!(roster.len(), 2);
        assert_eq!(roster.excluded().len(), 4);
        // Positions are assigned after exclusion.
        assert_eq!(roster.resolve("miner-b").unwrap().get(), 2);
        assert!(matches!(
            roster.resolve("bad id"),
            Err(DkgError::InvalidIdentity(_))
        ));
    }

    #[test]
    fn test_contains() {
        let roster = PartyRoster::from_node_ids(["a", "b"]);
        assert!(roster.contains(PartyId::new(2).unwrap()));
        assert!(!roster.contains(PartyId::new(3).unwrap()));
    }
}
