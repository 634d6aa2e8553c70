use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, PoisonError, RwLock};

use devp2p::crypto::node_id_from_hex;
use devp2p::types::{short_id, NodeId};
use serde::Deserialize;
use tracing::{debug, trace};

use crate::QposError;

/// One entry of the node list: a miner identity plus free-form properties
/// such as `ip` and `port`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NodeRecord {
    pub id: String,
    #[serde(flatten)]
    pub properties: BTreeMap<String, serde_json::Value>,
}

impl NodeRecord {
    pub fn node_id(&self) -> Result<NodeId, QposError> {
        node_id_from_hex(&self.id).map_err(|e| QposError::Decode(format!("node id {:?}: {}", self.id, e)))
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(serde_json::Value::as_str)
    }

    /// `ip:port`, when both are advertised.
    pub fn endpoint(&self) -> Option<String> {
        Some(format!("{}:{}", self.property("ip")?, self.property("port")?))
    }
}

/// Parse a JSON node list. Entries without a string `id` are skipped.
pub fn parse_node_list(json: &str) -> Result<Vec<NodeRecord>, QposError> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    let entries: Vec<serde_json::Value> =
        serde_json::from_str(json).map_err(|e| QposError::Decode(format!("node list: {}", e)))?;
    Ok(entries
        .into_iter()
        .filter_map(|entry| match serde_json::from_value::<NodeRecord>(entry) {
            Ok(record) => Some(record),
            Err(e) => {
                debug!(err = %e, "skipping node list entry");
                None
            }
        })
        .collect())
}

/// Source of the authorized miner list.
pub trait NodeListOracle {
    /// Miners in force at block `number`, or the latest list for `None`.
    fn node_list(&self, number: Option<u64>) -> Result<Vec<NodeRecord>, QposError>;
}

/// A node list fixed at startup.
#[derive(Debug, Clone, Default)]
pub struct StaticNodeList {
    records: Vec<NodeRecord>,
}

impl StaticNodeList {
    pub fn new(records: Vec<NodeRecord>) -> Self {
        StaticNodeList { records }
    }

    pub fn from_json(json: &str) -> Result<Self, QposError> {
        Ok(StaticNodeList::new(parse_node_list(json)?))
    }

    pub fn records(&self) -> &[NodeRecord] {
        &self.records
    }
}

impl NodeListOracle for StaticNodeList {
    fn node_list(&self, _number: Option<u64>) -> Result<Vec<NodeRecord>, QposError> {
        Ok(self.records.clone())
    }
}

/// Connected peers the seal engine last resolved its committee with. The
/// certifier reads the same list so both sides index one sorted set.
#[derive(Debug, Clone, Default)]
pub struct SharedPeers(Arc<RwLock<Vec<NodeId>>>);

impl SharedPeers {
    pub fn set(&self, peers: Vec<NodeId>) {
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = peers;
    }

    pub fn snapshot(&self) -> Vec<NodeId> {
        self.0.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// The committee, sorted. A miner's signature index is its position here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MinerSet {
    ids: Vec<NodeId>,
}

impl MinerSet {
    pub fn new(ids: impl IntoIterator<Item = NodeId>) -> Self {
        let sorted: BTreeSet<NodeId> = ids.into_iter().collect();
        MinerSet {
            ids: sorted.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.ids.binary_search(id).is_ok()
    }

    pub fn index_of(&self, id: &NodeId) -> Option<usize> {
        self.ids.binary_search(id).ok()
    }

    pub fn get(&self, index: usize) -> Option<&NodeId> {
        self.ids.get(index)
    }

    pub fn ids(&self) -> &[NodeId] {
        &self.ids
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeId> {
        self.ids.iter()
    }
}

/// Builds the committee from the node list plus the locally configured extras.
#[derive(Debug, Clone)]
pub struct MinerResolver {
    self_id: NodeId,
    ex_nodes: Vec<NodeId>,
    exnodes_me: bool,
    exnodes_anyone: bool,
}

impl MinerResolver {
    pub fn new(self_id: NodeId) -> Self {
        MinerResolver {
            self_id,
            ex_nodes: Vec::new(),
            exnodes_me: false,
            exnodes_anyone: false,
        }
    }

    pub fn with_ex_nodes(mut self, ex_nodes: Vec<NodeId>) -> Self {
        self.ex_nodes = ex_nodes;
        self
    }

    pub fn with_exnodes_me(mut self, enabled: bool) -> Self {
        self.exnodes_me = enabled;
        self
    }

    pub fn with_exnodes_anyone(mut self, enabled: bool) -> Self {
        self.exnodes_anyone = enabled;
        self
    }

    pub fn self_id(&self) -> &NodeId {
        &self.self_id
    }

    /// Statically configured miners other than this node.
    pub fn ex_nodes(&self) -> impl Iterator<Item = &NodeId> {
        self.ex_nodes.iter().filter(move |id| **id != self.self_id)
    }

    /// An empty node list means this node mines alone. `connected` only
    /// matters when every connected peer is admitted.
    pub fn resolve(
        &self,
        oracle: &impl NodeListOracle,
        number: Option<u64>,
        connected: &[NodeId],
    ) -> Result<MinerSet, QposError> {
        let records = oracle.node_list(number)?;
        let mut ids = BTreeSet::new();
        if records.is_empty() {
            ids.insert(self.self_id);
        }
        for record in &records {
            match record.node_id() {
                Ok(id) => {
                    ids.insert(id);
                }
                Err(e) => debug!(err = %e, "skipping node list entry"),
            }
        }
        ids.extend(self.ex_nodes.iter().copied());
        if self.exnodes_me || self.exnodes_anyone {
            ids.insert(self.self_id);
        }
        if self.exnodes_anyone {
            ids.extend(connected.iter().copied());
        }
        trace!(
            number = ?number,
            miners = ids.len(),
            me = %short_id(&self.self_id),
            "resolved miner set"
        );
        Ok(MinerSet::new(ids))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(b: u8) -> NodeId {
        [b; 64]
    }

    fn json_for(ids: &[NodeId]) -> String {
        let entries: Vec<String> = ids
            .iter()
            .map(|id| format!(r#"{{"id":"{}","ip":"10.0.0.1","port":"30303"}}"#, hex::encode(id)))
            .collect();
        format!("[{}]", entries.join(","))
    }

    #[test]
    fn parses_records_and_properties() {
        let list = parse_node_list(&json_for(&[id(3)])).unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].node_id().unwrap(), id(3));
        assert_eq!(list[0].property("ip"), Some("10.0.0.1"));
        assert_eq!(list[0].endpoint().as_deref(), Some("10.0.0.1:30303"));
    }

    #[test]
    fn entries_without_string_id_are_skipped() {
        let json = format!(r#"[{{"id":5}},{{"name":"x"}},{{"id":"{}"}}]"#, hex::encode(id(1)));
        let list = parse_node_list(&json).unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].endpoint(), None);
        assert!(parse_node_list("").unwrap().is_empty());
        assert!(parse_node_list("{").is_err());
    }

    #[test]
    fn miner_set_is_sorted_and_indexed() {
        let set = MinerSet::new([id(9), id(2), id(5), id(2)]);
        assert_eq!(set.len(), 3);
        assert_eq!(set.ids(), &[id(2), id(5), id(9)]);
        assert_eq!(set.index_of(&id(9)), Some(2));
        assert_eq!(set.get(0), Some(&id(2)));
        assert!(!set.contains(&id(1)));
    }

    #[test]
    fn empty_list_means_self_alone() {
        let resolver = MinerResolver::new(id(7));
        let set = resolver.resolve(&StaticNodeList::default(), None, &[id(8)]).unwrap();
        assert_eq!(set.ids(), &[id(7)]);
    }

    #[test]
    fn listed_miners_exclude_self_unless_configured() {
        let oracle = StaticNodeList::from_json(&json_for(&[id(1), id(2)])).unwrap();
        let resolver = MinerResolver::new(id(7)).with_ex_nodes(vec![id(4)]);
        let set = resolver.resolve(&oracle, Some(3), &[]).unwrap();
        assert_eq!(set.ids(), &[id(1), id(2), id(4)]);

        let set = resolver.clone().with_exnodes_me(true).resolve(&oracle, None, &[]).unwrap();
        assert!(set.contains(&id(7)));
    }

    #[test]
    fn anyone_admits_connected_peers() {
        let oracle = StaticNodeList::from_json(&json_for(&[id(1)])).unwrap();
        let resolver = MinerResolver::new(id(7)).with_exnodes_anyone(true);
        let set = resolver.resolve(&oracle, None, &[id(8), id(9)]).unwrap();
        assert_eq!(set.ids(), &[id(1), id(7), id(8), id(9)]);
    }

    #[test]
    fn ex_nodes_skip_self() {
        let resolver = MinerResolver::new(id(7)).with_ex_nodes(vec![id(7), id(3)]);
        assert_eq!(resolver.ex_nodes().copied().collect::<Vec<_>>(), vec![id(3)]);
    }
}
