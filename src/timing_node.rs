//! Timing tree nodes (Sprint 1 - request timing tree)
//!
//! A [`TimingNode`] is one measured unit of work inside a profiled request.
//! Nodes form a strict tree: every node except the root has exactly one
//! parent, children are kept in completion order, and each node may carry
//! fine-grained [`SubEvent`]s (queries, backend calls).
//!
//! # Accounting
//!
//! ```text
//! duration_without_children = duration - sum(child.duration)
//! depth                     = parent.depth + 1     (root = 0)
//! ```
//!
//! Scopes are strictly nested, so a child always finishes inside its
//! parent's measured window and the subtraction never goes negative.
//!
//! # Ownership
//!
//! A node is mutated only by the instrumentation context that opened it.
//! Once its duration is recorded and it is attached to its parent it is
//! never touched again.

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Identifier of a timing node, unique within one profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A fine-grained timed operation recorded inside a timing node
#[derive(Debug, Clone, PartialEq)]
pub struct SubEvent {
    /// What was executed (e.g. the SQL text)
    pub description: String,
    /// How long it took
    pub duration: Duration,
    /// Offset from profile start
    pub start_offset: Duration,
    /// Node that was current when the event was recorded
    pub parent_id: NodeId,
    /// True if an identical description/duration pair was already seen in this profile
    pub is_duplicate: bool,
}

/// Profile-wide record of sub-events seen so far, used to flag repeated work.
///
/// Two events are duplicates when both description and duration match,
/// regardless of which node they were recorded under.
#[derive(Debug, Default, Clone)]
pub struct SubEventLedger {
    seen: HashSet<(String, Duration)>,
}

impl SubEventLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an event; returns `true` if the same pair was registered before.
    pub fn check(&mut self, description: &str, duration: Duration) -> bool {
        !self.seen.insert((description.to_string(), duration))
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

/// One timed unit of work
#[derive(Debug, Clone, PartialEq)]
pub struct TimingNode {
    id: NodeId,
    name: String,
    start_offset: Duration,
    duration: Option<Duration>,
    duration_without_children: Duration,
    depth: u32,
    parent_id: Option<NodeId>,
    children: Vec<TimingNode>,
    children_duration: Duration,
    sub_events: Vec<SubEvent>,
    sub_event_duration: Duration,
    has_duplicate_sub_events: bool,
}

impl TimingNode {
    /// Open a new node.
    ///
    /// `parent` is the node that is current when the work begins; the new
    /// node's depth is derived from it. The parent link itself is only set
    /// by [`TimingNode::attach_child`] once the node has completed.
    pub fn begin(
        id: NodeId,
        name: impl Into<String>,
        parent: Option<&TimingNode>,
        start_offset: Duration,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            start_offset,
            duration: None,
            duration_without_children: Duration::ZERO,
            depth: parent.map_or(0, |p| p.depth + 1),
            parent_id: None,
            children: Vec::new(),
            children_duration: Duration::ZERO,
            sub_events: Vec::new(),
            sub_event_duration: Duration::ZERO,
            has_duplicate_sub_events: false,
        }
    }

    /// Record the elapsed time of this node.
    ///
    /// All children must already be attached.
    ///
    /// # Panics
    ///
    /// Panics if a duration was already recorded for this node.
    pub fn record_duration(&mut self, elapsed: Duration) {
        assert!(
            self.duration.is_none(),
            "duration recorded twice for timing node {} ({})",
            self.id,
            self.name
        );

        if self.children_duration > elapsed {
            warn!(
                node = %self.id,
                name = %self.name,
                elapsed_us = elapsed.as_micros() as u64,
                children_us = self.children_duration.as_micros() as u64,
                "children outlasted their parent; scopes overlapped"
            );
        }

        self.duration = Some(elapsed);
        self.duration_without_children = elapsed.saturating_sub(self.children_duration);
    }

    /// Attach a completed child.
    ///
    /// Must be called exactly once per child, in the order children complete.
    ///
    /// # Panics
    ///
    /// Panics if this node has already recorded its duration, if the child
    /// already has a parent, was opened under a different depth, or has not
    /// recorded its duration.
    pub fn attach_child(&mut self, mut child: TimingNode) {
        assert!(
            self.duration.is_none(),
            "timing node {} ({}) gained a child after recording its duration",
            self.id,
            self.name
        );
        assert!(
            child.parent_id.is_none(),
            "timing node {} is already attached to {:?}",
            child.id,
            child.parent_id
        );
        let child_duration = child
            .duration
            .unwrap_or_else(|| panic!("timing node {} attached before recording its duration", child.id));
        assert_eq!(
            child.depth,
            self.depth + 1,
            "timing node {} was opened at depth {} but attached under depth {}",
            child.id,
            child.depth,
            self.depth
        );

        child.parent_id = Some(self.id);
        self.children_duration += child_duration;
        self.children.push(child);
    }

    /// Append a sub-event measured while this node was current.
    ///
    /// The duplicate flag is decided by the profile-wide `ledger`.
    pub fn add_sub_event(
        &mut self,
        description: impl Into<String>,
        elapsed: Duration,
        start_offset: Duration,
        ledger: &mut SubEventLedger,
    ) -> &SubEvent {
        let description = description.into();
        let is_duplicate = ledger.check(&description, elapsed);

        self.sub_event_duration += elapsed;
        self.has_duplicate_sub_events |= is_duplicate;
        self.sub_events.push(SubEvent {
            description,
            duration: elapsed,
            start_offset,
            parent_id: self.id,
            is_duplicate,
        });
        // just pushed
        &self.sub_events[self.sub_events.len() - 1]
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn start_offset(&self) -> Duration {
        self.start_offset
    }

    /// Recorded duration, or zero while the node is still open
    pub fn duration(&self) -> Duration {
        self.duration.unwrap_or_default()
    }

    pub fn is_recorded(&self) -> bool {
        self.duration.is_some()
    }

    pub fn duration_without_children(&self) -> Duration {
        self.duration_without_children
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    pub fn parent_id(&self) -> Option<NodeId> {
        self.parent_id
    }

    pub fn is_root(&self) -> bool {
        self.depth == 0 && self.parent_id.is_none()
    }

    pub fn children(&self) -> &[TimingNode] {
        &self.children
    }

    pub fn has_children(&self) -> bool {
        !self.children.is_empty()
    }

    pub fn sub_events(&self) -> &[SubEvent] {
        &self.sub_events
    }

    pub fn has_sub_events(&self) -> bool {
        !self.sub_events.is_empty()
    }

    pub fn has_duplicate_sub_events(&self) -> bool {
        self.has_duplicate_sub_events
    }

    /// Sum of this node's own sub-event durations (children excluded)
    pub fn sub_event_duration(&self) -> Duration {
        self.sub_event_duration
    }

    /// A node is trivial when its total duration does not exceed `threshold`
    pub fn is_trivial(&self, threshold: Duration) -> bool {
        self.duration() <= threshold
    }

    /// Depth-first, pre-order walk over this node and all descendants
    pub fn walk(&self) -> Walk<'_> {
        Walk { stack: vec![self] }
    }
}

/// Pre-order iterator returned by [`TimingNode::walk`]
pub struct Walk<'a> {
    stack: Vec<&'a TimingNode>,
}

impl<'a> Iterator for Walk<'a> {
    type Item = &'a TimingNode;

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        // reversed so the first child is visited first
        self.stack.extend(node.children.iter().rev());
        Some(node)
    }
}
