//! Profiles: one request's timing tree plus metadata
//!
//! A [`Profile`] is created when a profiled request starts, finalized when
//! the request completes, and then shared read-only through the
//! [`ProfileStore`](crate::store::ProfileStore). The only mutation after
//! finalization is the one-time "viewed" transition, which records the
//! client-side navigation timings of the first consumer.

use std::fmt;
use std::sync::OnceLock;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rand::distributions::{Distribution, Uniform};
use serde::{Deserialize, Serialize};

use crate::timing_node::{NodeId, SubEventLedger, TimingNode};

/// Length of generated identifiers (base-36 characters, ~103 bits)
pub const PROFILE_ID_LEN: usize = 20;

const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Default threshold under which a timing is considered trivial
pub const DEFAULT_TRIVIAL_THRESHOLD: Duration = Duration::from_millis(2);

/// Globally unique correlation identifier of a profile
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProfileId(String);

impl ProfileId {
    /// Generate a fresh random base-36 identifier
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let digit = Uniform::from(0..BASE36.len());
        let id: String = (0..PROFILE_ID_LEN)
            .map(|_| BASE36[digit.sample(&mut rng)] as char)
            .collect();
        Self(id)
    }

    /// Wrap an identifier received from the wire
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProfileId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Browser navigation timing, as posted by the client on its first result fetch.
///
/// All values are milliseconds since the UNIX epoch; zero means "not reached".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NavigationTiming {
    pub redirect_count: u32,
    pub domain_lookup_start: u64,
    pub domain_lookup_end: u64,
    pub connect_start: u64,
    pub connect_end: u64,
    pub request_start: u64,
    pub response_start: u64,
    pub response_end: u64,
    pub unload_event_start: u64,
    pub unload_event_end: u64,
    pub dom_loading: u64,
    pub dom_content_loaded_event_start: u64,
    pub dom_content_loaded_event_end: u64,
    pub dom_interactive: u64,
    pub load_event_start: u64,
    pub load_event_end: u64,
    pub dom_complete: u64,
}

/// One named client-side timing, relative to the profile start
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientTiming {
    pub name: String,
    /// May be negative: the browser starts navigating before the server sees the request
    pub start_milliseconds: f64,
    /// `None` for point events
    #[serde(with = "crate::serde_millis::option", rename = "duration_milliseconds")]
    pub duration: Option<Duration>,
}

/// Client timings recorded on the first view of a profile
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientTimings {
    pub redirect_count: u32,
    pub timings: Vec<ClientTiming>,
}

impl ClientTimings {
    /// Convert raw navigation timing into named timings relative to `profile_started_ms`
    pub fn from_navigation(nav: &NavigationTiming, profile_started_ms: u64) -> Self {
        let base = profile_started_ms as f64;
        let span = |name: &str, start: u64, end: u64| ClientTiming {
            name: name.to_string(),
            start_milliseconds: start as f64 - base,
            duration: Some(Duration::from_millis(end.saturating_sub(start))),
        };
        let point = |name: &str, at: u64| ClientTiming {
            name: name.to_string(),
            start_milliseconds: at as f64 - base,
            duration: None,
        };

        let timings = vec![
            span("Domain Lookup", nav.domain_lookup_start, nav.domain_lookup_end),
            span("Connect", nav.connect_start, nav.connect_end),
            point("Request Start", nav.request_start),
            span("Response", nav.response_start, nav.response_end),
            span("Unload Event", nav.unload_event_start, nav.unload_event_end),
            point("Dom Loading", nav.dom_loading),
            span(
                "Dom Content Loaded Event",
                nav.dom_content_loaded_event_start,
                nav.dom_content_loaded_event_end,
            ),
            point("Dom Interactive", nav.dom_interactive),
            span("Load Event", nav.load_event_start, nav.load_event_end),
            point("Dom Complete", nav.dom_complete),
        ];

        Self {
            redirect_count: nav.redirect_count,
            timings,
        }
    }
}

/// Root container for one request's timing tree
#[derive(Debug)]
pub struct Profile {
    id: ProfileId,
    name: String,
    started: SystemTime,
    clock_origin: Instant,
    machine_name: Option<String>,
    user: String,
    trivial_threshold: Duration,
    root: TimingNode,
    next_node_id: u32,
    ledger: SubEventLedger,
    viewed: OnceLock<ClientTimings>,
}

impl Profile {
    /// Start a new profile; the root timing node opens immediately
    pub fn create(name: impl Into<String>) -> Self {
        Self::create_at(name, SystemTime::now())
    }

    /// Start a new profile with an explicit wall-clock creation time
    pub fn create_at(name: impl Into<String>, started: SystemTime) -> Self {
        let name = name.into();
        let root = TimingNode::begin(NodeId(0), name.clone(), None, Duration::ZERO);
        Self {
            id: ProfileId::generate(),
            name,
            started,
            clock_origin: Instant::now(),
            machine_name: None,
            user: "unknown user".to_string(),
            trivial_threshold: DEFAULT_TRIVIAL_THRESHOLD,
            root,
            next_node_id: 1,
            ledger: SubEventLedger::new(),
            viewed: OnceLock::new(),
        }
    }

    pub fn with_machine_name(mut self, machine: impl Into<String>) -> Self {
        self.machine_name = Some(machine.into());
        self
    }

    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    pub fn with_trivial_threshold(mut self, threshold: Duration) -> Self {
        self.trivial_threshold = threshold;
        self
    }

    /// Record the root duration. After this the profile is read-only
    /// except for [`Profile::mark_viewed`].
    ///
    /// # Panics
    ///
    /// Panics if the profile was already finalized.
    pub fn finalize(&mut self, root_elapsed: Duration) {
        self.root.record_duration(root_elapsed);
    }

    pub fn is_finalized(&self) -> bool {
        self.root.is_recorded()
    }

    /// One-time viewed transition.
    ///
    /// Returns `true` if this call performed the transition; later calls are
    /// no-ops so only the first consumer's client timings are kept.
    pub fn mark_viewed(&self, client_timings: Option<ClientTimings>) -> bool {
        self.viewed.set(client_timings.unwrap_or_default()).is_ok()
    }

    pub fn has_user_viewed(&self) -> bool {
        self.viewed.get().is_some()
    }

    pub fn client_timings(&self) -> Option<&ClientTimings> {
        self.viewed.get()
    }

    pub fn id(&self) -> &ProfileId {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn started(&self) -> SystemTime {
        self.started
    }

    /// Creation time as milliseconds since the UNIX epoch
    pub fn started_unix_ms(&self) -> u64 {
        self.started
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    pub fn machine_name(&self) -> Option<&str> {
        self.machine_name.as_deref()
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn trivial_threshold(&self) -> Duration {
        self.trivial_threshold
    }

    pub fn root(&self) -> &TimingNode {
        &self.root
    }

    /// Total request duration (root duration)
    pub fn duration(&self) -> Duration {
        self.root.duration()
    }

    /// Aggregate sub-event duration over the whole tree
    pub fn sub_event_duration(&self) -> Duration {
        self.root.walk().map(TimingNode::sub_event_duration).sum()
    }

    pub fn has_sub_events(&self) -> bool {
        self.root.walk().any(TimingNode::has_sub_events)
    }

    pub fn has_duplicate_sub_events(&self) -> bool {
        self.root.walk().any(TimingNode::has_duplicate_sub_events)
    }

    pub fn has_trivial_timings(&self) -> bool {
        self.root.walk().any(|n| n.is_trivial(self.trivial_threshold))
    }

    pub fn has_all_trivial_timings(&self) -> bool {
        self.root.walk().all(|n| n.is_trivial(self.trivial_threshold))
    }

    pub fn node_count(&self) -> usize {
        self.root.walk().count()
    }

    // Measurement-time access, used by the instrumentation context.

    pub(crate) fn elapsed_since_start(&self) -> Duration {
        self.clock_origin.elapsed()
    }

    pub(crate) fn allocate_node_id(&mut self) -> NodeId {
        let id = NodeId(self.next_node_id);
        self.next_node_id += 1;
        id
    }

    pub(crate) fn root_mut(&mut self) -> &mut TimingNode {
        &mut self.root
    }

    pub(crate) fn root_and_ledger_mut(&mut self) -> (&mut TimingNode, &mut SubEventLedger) {
        (&mut self.root, &mut self.ledger)
    }

    pub(crate) fn ledger_mut(&mut self) -> &mut SubEventLedger {
        &mut self.ledger
    }

    /// Profile with a fixed id, for exercising id collisions
    #[cfg(test)]
    pub(crate) fn from_parts(id: ProfileId, name: String, started: SystemTime, root: TimingNode) -> Self {
        Self {
            id,
            name,
            started,
            clock_origin: Instant::now(),
            machine_name: None,
            user: "unknown user".to_string(),
            trivial_threshold: DEFAULT_TRIVIAL_THRESHOLD,
            root,
            next_node_id: 1,
            ledger: SubEventLedger::new(),
            viewed: OnceLock::new(),
        }
    }
}
