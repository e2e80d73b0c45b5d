//! Per-request instrumentation context (Sprint 1 - context passing)
//!
//! The context owns the [`Profile`] being measured and a cursor onto the
//! currently open [`TimingNode`]. It is created for exactly one request and
//! threaded explicitly through every call that performs timed work, so
//! concurrent requests can never observe each other's cursor.
//!
//! ```
//! use miniprof::context::InstrumentationContext;
//! use miniprof::profile::Profile;
//! use std::time::Duration;
//!
//! let mut ctx = InstrumentationContext::new(Profile::create("GET http://localhost/"));
//! let rows = ctx.with_child("load users", |ctx| {
//!     ctx.record_sub_event("SELECT * FROM users", Duration::from_millis(3));
//!     vec!["alice", "bob"]
//! });
//! assert_eq!(rows.len(), 2);
//!
//! let profile = ctx.finish();
//! assert_eq!(profile.root().children()[0].name(), "load users");
//! ```

use std::time::{Duration, Instant};

use tracing::trace;

use crate::profile::{Profile, ProfileId};
use crate::timing_node::TimingNode;

/// Mutable per-request cursor over a profile's timing tree
#[derive(Debug)]
pub struct InstrumentationContext {
    profile: Profile,
    /// Open nodes below the root, innermost last
    open: Vec<TimingNode>,
    started: Instant,
    related_ids: Vec<ProfileId>,
    auto_inject: bool,
}

impl InstrumentationContext {
    pub fn new(profile: Profile) -> Self {
        Self {
            profile,
            open: Vec::new(),
            started: Instant::now(),
            related_ids: Vec::new(),
            auto_inject: true,
        }
    }

    /// Run `work` inside a new child node of the current node.
    ///
    /// The child's duration is recorded and the child attached to its
    /// parent whatever `work` returns, so a failed `Result` still keeps
    /// its timing. The return value is passed through unchanged.
    pub fn with_child<F, R>(&mut self, name: impl Into<String>, work: F) -> R
    where
        F: FnOnce(&mut Self) -> R,
    {
        let name = name.into();
        let id = self.profile.allocate_node_id();
        let offset = self.profile.elapsed_since_start();
        let node = TimingNode::begin(id, name, Some(self.current()), offset);
        trace!(node = %id, depth = node.depth(), name = node.name(), "timing node opened");
        self.open.push(node);
        let open_before = self.open.len();

        let started = Instant::now();
        let result = work(self);
        let elapsed = started.elapsed();

        debug_assert_eq!(self.open.len(), open_before, "unbalanced timing scopes");
        if let Some(mut node) = self.open.pop() {
            node.record_duration(elapsed);
            self.current_mut().attach_child(node);
        }
        result
    }

    /// Record a sub-event against whichever node is current.
    ///
    /// Returns `true` if the event duplicates one already seen in this profile.
    pub fn record_sub_event(&mut self, description: impl Into<String>, elapsed: Duration) -> bool {
        let offset = self.profile.elapsed_since_start().saturating_sub(elapsed);
        match self.open.last_mut() {
            Some(node) => {
                node.add_sub_event(description, elapsed, offset, self.profile.ledger_mut())
                    .is_duplicate
            }
            None => {
                let (root, ledger) = self.profile.root_and_ledger_mut();
                root.add_sub_event(description, elapsed, offset, ledger)
                    .is_duplicate
            }
        }
    }

    /// Time `work` and record it as a sub-event of the current node
    pub fn measure_sub_event<F, R>(&mut self, description: impl Into<String>, work: F) -> R
    where
        F: FnOnce() -> R,
    {
        let started = Instant::now();
        let result = work();
        self.record_sub_event(description, started.elapsed());
        result
    }

    /// The node new work would attach to
    pub fn current(&self) -> &TimingNode {
        self.open.last().unwrap_or_else(|| self.profile.root())
    }

    fn current_mut(&mut self) -> &mut TimingNode {
        match self.open.last_mut() {
            Some(node) => node,
            None => self.profile.root_mut(),
        }
    }

    /// Depth of the current node (root = 0)
    pub fn depth(&self) -> u32 {
        self.current().depth()
    }

    pub fn profile_id(&self) -> &ProfileId {
        self.profile.id()
    }

    pub fn profile(&self) -> &Profile {
        &self.profile
    }

    /// Note a profile completed while handling this request (e.g. an
    /// in-process sub-request) so it is announced alongside this one.
    pub fn add_related_id(&mut self, id: ProfileId) {
        if !self.related_ids.contains(&id) {
            self.related_ids.push(id);
        }
    }

    pub fn related_ids(&self) -> &[ProfileId] {
        &self.related_ids
    }

    /// Suppress the client bootstrap tag for this request
    pub fn cancel_auto_inject(&mut self) {
        self.auto_inject = false;
    }

    pub fn auto_inject(&self) -> bool {
        self.auto_inject
    }

    /// Close the root using the wall time since the context was created
    pub fn finish(self) -> Profile {
        let elapsed = self.started.elapsed();
        self.finish_with(elapsed)
    }

    /// Close the root with an explicit elapsed duration
    pub fn finish_with(self, root_elapsed: Duration) -> Profile {
        self.into_parts(root_elapsed).0
    }

    /// Close the root and hand back the related ids gathered on the way
    pub fn into_parts(mut self, root_elapsed: Duration) -> (Profile, Vec<ProfileId>) {
        debug_assert!(self.open.is_empty(), "finishing with open timing nodes");
        self.profile.finalize(root_elapsed);
        (self.profile, self.related_ids)
    }

    /// Wall time since the context was created
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}
