//! Replicated Growable Array (RGA) for ordered lists.
//!
//! Every element anchors to the element it was inserted after. Siblings that
//! share an anchor are ordered newest first (`counter` descending, then
//! `actor` ascending), and the visible sequence is a pre-order walk from the
//! virtual `root`:
//!
//! ```text
//!            root
//!           /    \
//!        2:b      0:a          visible order:
//!         |        |             2:b, 3:a, 0:a, 1:a
//!        3:a      1:a
//! ```
//!
//! Deleting an element only tombstones its value. The node stays in place so
//! inserts that were anchored to it concurrently still land in the right spot.
//!
//! Reference: Roh et al., "Replicated abstract data types" (2011)

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde_json::Value;

use super::CrdtError;

/// Literal id of the virtual head of every list.
pub const ROOT: &str = "root";

/// Globally unique element id: `"{counter}:{actor}"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeId {
    pub counter: u64,
    pub actor: String,
}

impl NodeId {
    pub fn new(counter: u64, actor: impl Into<String>) -> Self {
        Self {
            counter,
            actor: actor.into(),
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.counter, self.actor)
    }
}

impl FromStr for NodeId {
    type Err = CrdtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Actors may contain ':' themselves, the counter never does.
        let (counter, actor) = s
            .split_once(':')
            .ok_or_else(|| CrdtError::InvalidId(s.to_string()))?;
        let counter = counter
            .parse::<u64>()
            .map_err(|_| CrdtError::InvalidId(s.to_string()))?;
        if actor.is_empty() {
            return Err(CrdtError::InvalidId(s.to_string()));
        }
        Ok(Self::new(counter, actor))
    }
}

/// Order in which two siblings of the same anchor are emitted.
///
/// Newer counters come first; equal counters fall back to the actor string.
pub fn sibling_order(a: &NodeId, b: &NodeId) -> Ordering {
    b.counter
        .cmp(&a.counter)
        .then_with(|| a.actor.cmp(&b.actor))
}

/// Position an element is inserted after.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Anchor {
    Root,
    Node(NodeId),
}

impl Anchor {
    pub fn node(&self) -> Option<&NodeId> {
        match self {
            Anchor::Root => None,
            Anchor::Node(id) => Some(id),
        }
    }
}

impl fmt::Display for Anchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Anchor::Root => f.write_str(ROOT),
            Anchor::Node(id) => id.fmt(f),
        }
    }
}

impl FromStr for Anchor {
    type Err = CrdtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == ROOT {
            Ok(Anchor::Root)
        } else {
            s.parse().map(Anchor::Node)
        }
    }
}

impl From<NodeId> for Anchor {
    fn from(id: NodeId) -> Self {
        Anchor::Node(id)
    }
}

/// Value slot of a list element.
#[derive(Debug, Clone, PartialEq)]
pub enum ListValue {
    Scalar(Value),
    /// Deleted element, still a valid anchor.
    Tombstone,
    /// Reference to another object. Declared by the data model, not supported.
    Ref(String),
}

#[derive(Debug, Clone)]
struct Node {
    after: Anchor,
    value: ListValue,
}

/// The list CRDT.
#[derive(Debug, Clone)]
pub struct Rga {
    /// Actor stamped on locally generated ids.
    actor: String,
    /// Next local counter. Kept above every counter seen so far.
    counter: u64,
    nodes: HashMap<NodeId, Node>,
    /// Puts/deletes that arrived before the element they target.
    deferred: HashMap<NodeId, ListValue>,
}

impl Rga {
    pub fn new(actor: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            counter: 0,
            nodes: HashMap::new(),
            deferred: HashMap::new(),
        }
    }

    pub fn actor(&self) -> &str {
        &self.actor
    }

    /// Switch the actor used for future local ids (session rotation).
    pub fn set_actor(&mut self, actor: impl Into<String>) {
        self.actor = actor.into();
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// Raise the local counter to at least `floor`.
    pub fn observe_counter(&mut self, floor: u64) {
        self.counter = self.counter.max(floor);
    }

    /// Allocate the next local id.
    pub fn next_id(&mut self) -> NodeId {
        let id = NodeId::new(self.counter, self.actor.clone());
        self.counter += 1;
        id
    }

    /// Insert `value` after `after`.
    ///
    /// Without an explicit id a fresh local id is generated; with one (remote
    /// replay) it is taken as-is. Re-inserting an existing id is a no-op.
    pub fn insert(
        &mut self,
        after: Anchor,
        value: Value,
        id: Option<NodeId>,
    ) -> Result<NodeId, CrdtError> {
        let id = match id {
            Some(id) => id,
            None => self.next_id(),
        };
        self.insert_node(id.clone(), after, ListValue::Scalar(value))?;
        Ok(id)
    }

    fn insert_node(&mut self, id: NodeId, after: Anchor, value: ListValue) -> Result<bool, CrdtError> {
        if let ListValue::Ref(target) = &value {
            return Err(CrdtError::NotImplemented(format!(
                "list reference to '{target}'"
            )));
        }
        if self.nodes.contains_key(&id) {
            return Ok(false);
        }
        self.observe_counter(id.counter.saturating_add(1));
        let value = match self.deferred.remove(&id) {
            Some(later) => later,
            None => value,
        };
        self.nodes.insert(id, Node { after, value });
        Ok(true)
    }

    /// Overwrite the value of an element. Tombstones are final.
    pub fn put(&mut self, id: &NodeId, value: Value) {
        match self.nodes.get_mut(id) {
            Some(node) => {
                if node.value != ListValue::Tombstone {
                    node.value = ListValue::Scalar(value);
                }
            }
            None => {
                if !matches!(self.deferred.get(id), Some(ListValue::Tombstone)) {
                    self.deferred.insert(id.clone(), ListValue::Scalar(value));
                }
            }
        }
    }

    /// Tombstone an element, keeping it as an anchor.
    pub fn delete(&mut self, id: &NodeId) {
        match self.nodes.get_mut(id) {
            Some(node) => node.value = ListValue::Tombstone,
            None => {
                self.deferred.insert(id.clone(), ListValue::Tombstone);
            }
        }
    }

    /// Value of a live element.
    pub fn get(&self, id: &NodeId) -> Option<&Value> {
        match self.nodes.get(id).map(|n| &n.value) {
            Some(ListValue::Scalar(value)) => Some(value),
            _ => None,
        }
    }

    /// Whether the element exists, tombstoned or not.
    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn is_tombstone(&self, id: &NodeId) -> bool {
        matches!(self.nodes.get(id).map(|n| &n.value), Some(ListValue::Tombstone))
    }

    /// Total number of elements, tombstones included.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Pre-order walk from root over every reachable element.
    ///
    /// Elements whose anchor has not arrived yet are unreachable and skipped
    /// until it does.
    fn linearize(&self) -> Vec<&NodeId> {
        let mut children: HashMap<Option<&NodeId>, Vec<&NodeId>> = HashMap::new();
        for (id, node) in &self.nodes {
            children.entry(node.after.node()).or_default().push(id);
        }
        for siblings in children.values_mut() {
            siblings.sort_by(|a, b| sibling_order(a, b));
        }

        let mut order = Vec::with_capacity(self.nodes.len());
        // Explicit stack: push-built lists are one long chain.
        let mut stack: Vec<&NodeId> = Vec::new();
        if let Some(top) = children.get(&None) {
            stack.extend(top.iter().rev());
        }
        while let Some(id) = stack.pop() {
            order.push(id);
            if let Some(kids) = children.get(&Some(id)) {
                stack.extend(kids.iter().rev());
            }
        }
        order
    }

    /// Ids of the visible elements, in list order.
    pub fn visible_ids(&self) -> Vec<NodeId> {
        self.linearize()
            .into_iter()
            .filter(|id| !self.is_tombstone(id))
            .cloned()
            .collect()
    }

    /// Visible values, in list order.
    pub fn to_array(&self) -> Vec<Value> {
        self.linearize()
            .into_iter()
            .filter_map(|id| self.get(id).cloned())
            .collect()
    }

    /// Number of visible elements.
    pub fn len(&self) -> usize {
        self.linearize()
            .into_iter()
            .filter(|id| self.get(id).is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Id of the visible element at `index`.
    pub fn id_at(&self, index: usize) -> Result<NodeId, CrdtError> {
        let visible = self.visible_ids();
        let len = visible.len();
        visible
            .into_iter()
            .nth(index)
            .ok_or(CrdtError::IndexOutOfRange { index, len })
    }

    /// Rightmost element (tombstones included), or root when empty.
    ///
    /// Used as the anchor for appends.
    pub fn last_id(&self) -> Anchor {
        match self.linearize().last() {
            Some(id) => Anchor::Node((*id).clone()),
            None => Anchor::Root,
        }
    }

    /// Fill in elements from a snapshot.
    ///
    /// Unknown elements are inserted; known ones are only ever tombstoned,
    /// never otherwise changed. Returns whether anything changed.
    pub fn merge<I>(&mut self, entries: I) -> Result<bool, CrdtError>
    where
        I: IntoIterator<Item = (NodeId, Anchor, ListValue)>,
    {
        let mut changed = false;
        for (id, after, value) in entries {
            if self.nodes.contains_key(&id) {
                if value == ListValue::Tombstone && !self.is_tombstone(&id) {
                    self.delete(&id);
                    changed = true;
                }
                continue;
            }
            changed |= self.insert_node(id, after, value)?;
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn insert_word(rga: &mut Rga, actor: &str, word: &str) {
        let mut after = Anchor::Root;
        for (i, ch) in word.chars().enumerate() {
            let id = rga
                .insert(after, json!(ch.to_string()), Some(NodeId::new(i as u64, actor)))
                .unwrap();
            after = Anchor::Node(id);
        }
    }

    fn joined(rga: &Rga) -> String {
        rga.to_array()
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect()
    }

    fn push(rga: &mut Rga, value: Value) -> NodeId {
        let after = rga.last_id();
        rga.insert(after, value, None).unwrap()
    }

    #[test]
    fn test_node_id_roundtrip() {
        let id: NodeId = "12:alice".parse().unwrap();
        assert_eq!(id, NodeId::new(12, "alice"));
        assert_eq!(id.to_string(), "12:alice");

        // Actor containing a colon
        let id: NodeId = "3:guest:42".parse().unwrap();
        assert_eq!(id.actor, "guest:42");
    }

    #[test]
    fn test_node_id_invalid() {
        assert!("alice".parse::<NodeId>().is_err());
        assert!("x:alice".parse::<NodeId>().is_err());
        assert!("3:".parse::<NodeId>().is_err());
    }

    #[test]
    fn test_anchor_root_literal() {
        assert_eq!("root".parse::<Anchor>().unwrap(), Anchor::Root);
        assert_eq!(Anchor::Root.to_string(), "root");
    }

    #[test]
    fn test_insert_single() {
        let mut rga = Rga::new("me");
        rga.insert(Anchor::Root, json!("dogs"), None).unwrap();
        assert_eq!(rga.to_array(), vec![json!("dogs")]);
    }

    #[test]
    fn test_push_keeps_order() {
        let mut rga = Rga::new("me");
        let mut expected = Vec::new();
        for i in 0..20 {
            expected.push(json!(format!("donut #{i}")));
            push(&mut rga, json!(format!("donut #{i}")));
        }
        assert_eq!(rga.to_array(), expected);
    }

    #[test]
    fn test_last_id_is_rightmost() {
        let mut rga = Rga::new("me");
        for i in 0..20 {
            push(&mut rga, json!(i));
        }
        let last = rga.last_id();
        assert_eq!(last, Anchor::Node(NodeId::new(19, "me")));
        assert_eq!(rga.get(last.node().unwrap()), Some(&json!(19)));
    }

    #[test]
    fn test_concurrent_words_do_not_interleave() {
        let mut rga = Rga::new("me");
        insert_word(&mut rga, "birds", "birds");
        insert_word(&mut rga, "dogs", "dogs");
        insert_word(&mut rga, "cats", "cats");
        insert_word(&mut rga, "ants", "ants");
        insert_word(&mut rga, "somereallylongtext", "somereallylongtext");

        assert_eq!(joined(&rga), "antsbirdscatsdogssomereallylongtext");
    }

    #[test]
    fn test_concurrent_words_any_arrival_order() {
        let mut a = Rga::new("x");
        insert_word(&mut a, "ants", "ants");
        insert_word(&mut a, "birds", "birds");

        let mut b = Rga::new("y");
        insert_word(&mut b, "birds", "birds");
        insert_word(&mut b, "ants", "ants");

        assert_eq!(a.to_array(), b.to_array());
    }

    #[test]
    fn test_delete_keeps_anchor() {
        let mut rga = Rga::new("me");
        let dog = push(&mut rga, json!("dog"));
        push(&mut rga, json!("cat"));
        push(&mut rga, json!("bird"));

        rga.delete(&dog);
        assert_eq!(rga.to_array(), vec![json!("cat"), json!("bird")]);
        assert!(rga.contains(&dog));

        rga.insert(Anchor::Node(dog), json!("fish"), None).unwrap();
        assert_eq!(rga.to_array(), vec![json!("fish"), json!("cat"), json!("bird")]);
    }

    #[test]
    fn test_insert_after_deleted_middle() {
        let mut rga = Rga::new("me");
        push(&mut rga, json!("dog"));
        let cat = push(&mut rga, json!("cat"));
        push(&mut rga, json!("bird"));

        rga.delete(&cat);
        assert_eq!(rga.to_array(), vec![json!("dog"), json!("bird")]);

        rga.insert(Anchor::Node(cat), json!("mouse"), None).unwrap();
        assert_eq!(
            rga.to_array(),
            vec![json!("dog"), json!("mouse"), json!("bird")]
        );
    }

    #[test]
    fn test_remote_counter_advances_local() {
        let mut rga = Rga::new("me");
        rga.insert(Anchor::Root, json!("a"), Some(NodeId::new(41, "other")))
            .unwrap();
        let id = rga.next_id();
        assert_eq!(id, NodeId::new(42, "me"));
    }

    #[test]
    fn test_local_insert_lands_right_after_anchor() {
        // Remote actor already has a child under the anchor with a high counter.
        let mut rga = Rga::new("me");
        let head = NodeId::new(0, "other");
        rga.insert(Anchor::Root, json!("head"), Some(head.clone())).unwrap();
        rga.insert(Anchor::Node(head.clone()), json!("tail"), Some(NodeId::new(9, "other")))
            .unwrap();

        rga.insert(Anchor::Node(head), json!("mine"), None).unwrap();
        assert_eq!(
            rga.to_array(),
            vec![json!("head"), json!("mine"), json!("tail")]
        );
    }

    #[test]
    fn test_duplicate_insert_is_noop() {
        let mut rga = Rga::new("me");
        let id = NodeId::new(0, "a");
        rga.insert(Anchor::Root, json!(1), Some(id.clone())).unwrap();
        rga.insert(Anchor::Root, json!(2), Some(id)).unwrap();
        assert_eq!(rga.to_array(), vec![json!(1)]);
    }

    #[test]
    fn test_put_updates_value() {
        let mut rga = Rga::new("me");
        let id = push(&mut rga, json!("dogs"));
        rga.put(&id, json!("cats"));
        assert_eq!(rga.get(&id), Some(&json!("cats")));
    }

    #[test]
    fn test_put_does_not_resurrect() {
        let mut rga = Rga::new("me");
        let id = push(&mut rga, json!("dogs"));
        rga.delete(&id);
        rga.put(&id, json!("cats"));
        assert!(rga.get(&id).is_none());
        assert!(rga.is_empty());
    }

    #[test]
    fn test_deferred_delete_before_insert() {
        let mut rga = Rga::new("me");
        let id = NodeId::new(0, "remote");
        rga.delete(&id);
        rga.insert(Anchor::Root, json!("late"), Some(id.clone())).unwrap();
        assert!(rga.is_tombstone(&id));
        assert!(rga.to_array().is_empty());
    }

    #[test]
    fn test_deferred_put_before_insert() {
        let mut rga = Rga::new("me");
        let id = NodeId::new(0, "remote");
        rga.put(&id, json!("updated"));
        rga.insert(Anchor::Root, json!("original"), Some(id)).unwrap();
        assert_eq!(rga.to_array(), vec![json!("updated")]);
    }

    #[test]
    fn test_deferred_delete_wins_over_deferred_put() {
        let mut rga = Rga::new("me");
        let id = NodeId::new(0, "remote");
        rga.delete(&id);
        rga.put(&id, json!("updated"));
        rga.insert(Anchor::Root, json!("original"), Some(id)).unwrap();
        assert!(rga.to_array().is_empty());
    }

    #[test]
    fn test_orphan_hidden_until_anchor_arrives() {
        let mut rga = Rga::new("me");
        let a = NodeId::new(0, "x");
        let b = NodeId::new(1, "x");
        rga.insert(Anchor::Node(a.clone()), json!("b"), Some(b)).unwrap();
        assert!(rga.to_array().is_empty());

        rga.insert(Anchor::Root, json!("a"), Some(a)).unwrap();
        assert_eq!(rga.to_array(), vec![json!("a"), json!("b")]);
    }

    #[test]
    fn test_id_at_and_bounds() {
        let mut rga = Rga::new("me");
        let first = push(&mut rga, json!(1));
        let second = push(&mut rga, json!(2));
        rga.delete(&first);

        assert_eq!(rga.id_at(0).unwrap(), second);
        assert!(matches!(
            rga.id_at(1),
            Err(CrdtError::IndexOutOfRange { index: 1, len: 1 })
        ));
    }

    #[test]
    fn test_ref_rejected() {
        let mut rga = Rga::new("me");
        let result = rga.merge(vec![(
            NodeId::new(0, "a"),
            Anchor::Root,
            ListValue::Ref("other-list".into()),
        )]);
        assert!(matches!(result, Err(CrdtError::NotImplemented(_))));
    }

    #[test]
    fn test_merge_fills_in_only() {
        let mut rga = Rga::new("me");
        let local = push(&mut rga, json!("local"));

        let remote = NodeId::new(5, "other");
        let changed = rga
            .merge(vec![
                (local.clone(), Anchor::Root, ListValue::Scalar(json!("stale"))),
                (remote.clone(), Anchor::Root, ListValue::Scalar(json!("remote"))),
            ])
            .unwrap();

        assert!(changed);
        assert_eq!(rga.get(&local), Some(&json!("local")));
        assert_eq!(rga.get(&remote), Some(&json!("remote")));
        assert!(!rga
            .merge(vec![(remote, Anchor::Root, ListValue::Scalar(json!("remote")))])
            .unwrap());
    }

    #[test]
    fn test_merge_applies_tombstones() {
        let mut rga = Rga::new("me");
        let id = push(&mut rga, json!("gone"));
        let changed = rga
            .merge(vec![(id.clone(), Anchor::Root, ListValue::Tombstone)])
            .unwrap();
        assert!(changed);
        assert!(rga.is_tombstone(&id));
    }

    #[test]
    fn test_long_chain_does_not_overflow() {
        let mut rga = Rga::new("me");
        let mut after = Anchor::Root;
        for i in 0..50_000 {
            let id = rga.insert(after, json!(i), None).unwrap();
            after = Anchor::Node(id);
        }
        assert_eq!(rga.len(), 50_000);
        assert_eq!(rga.to_array().last(), Some(&json!(49_999)));
    }

    #[test]
    fn test_set_actor_rotates_new_ids() {
        let mut rga = Rga::new("old");
        push(&mut rga, json!(1));
        rga.set_actor("new");
        let id = rga.next_id();
        assert_eq!(id.actor, "new");
        assert_eq!(id.counter, 1);
    }
}
