//! Correlation client (Sprint 4 - cross-request discovery)
//!
//! Runs wherever the page's own network calls can be observed. Starting
//! from the page's profile id, it watches every completed outbound call for
//! the `X-MiniProfiler-Ids` header and fetches each announced profile
//! exactly once.
//!
//! # Design
//!
//! ```text
//! host network layer ──on_call_complete()──▶ CorrelationClient::observe
//!                                                  │ ids from header
//!                                                  ▼
//!                                  dispatch(id): first time only ──spawn──▶ fetch_by_id
//!                                                  │                             │
//!                                    watch::Receiver (shared) ◀── outcome ───────┘
//!                                                  │
//!                              results (arrival order) + broadcast to subscribers
//! ```
//!
//! Each fetch is spawned on the runtime, so observing a call never waits
//! on a fetch, and a fetch that hangs only ever withholds its own result.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use http::{HeaderMap, Request, Response, StatusCode};
use serde::Serialize;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};
use url::{Origin, Url};

use crate::includes::BootstrapOptions;
use crate::profile::ProfileId;
use crate::protocol::{self, ProfileRecord};
use crate::store::ProfileStore;

/// Capacity of the live result broadcast
pub const UPDATE_CHANNEL_CAPACITY: usize = 256;

/// Errors fetching or decoding a profile
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("Transport error fetching {id}: {message}")]
    Transport { id: ProfileId, message: String },

    #[error("Result fetch for {id} returned status {status}")]
    Status { id: ProfileId, status: u16 },

    #[error("Malformed result for {id}: {message}")]
    Decode { id: ProfileId, message: String },

    #[error("Profile name {0:?} is not \"<METHOD> <URL>\"")]
    InvalidName(String),

    #[error("Fetch for {0} was abandoned before completing")]
    Abandoned(ProfileId),
}

/// A fetched profile as presented to the page
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultSummary {
    pub id: ProfileId,
    pub method: String,
    pub url_path: String,
    #[serde(with = "crate::serde_millis", rename = "duration_milliseconds")]
    pub duration: Duration,
}

impl ResultSummary {
    /// Split the root name on its first space into method and URL
    pub fn from_record(record: &ProfileRecord) -> Result<Self, ClientError> {
        let name = &record.root.name;
        let (method, url) = name
            .split_once(' ')
            .ok_or_else(|| ClientError::InvalidName(name.clone()))?;
        let url = Url::parse(url).map_err(|_| ClientError::InvalidName(name.clone()))?;

        Ok(Self {
            id: record.id.clone(),
            method: method.to_string(),
            url_path: url.path().to_string(),
            duration: record.root.duration,
        })
    }
}

/// Fetch-by-identifier capability the client is built on
pub trait ProfileFetcher: Send + Sync + 'static {
    fn fetch_by_id(
        &self,
        id: &ProfileId,
    ) -> impl Future<Output = Result<ProfileRecord, ClientError>> + Send;
}

/// Minimal HTTP round-trip capability supplied by the host
pub trait HttpTransport: Send + Sync + 'static {
    fn send(
        &self,
        request: Request<()>,
    ) -> impl Future<Output = Result<Response<String>, String>> + Send;
}

/// [`ProfileFetcher`] speaking the result-fetch endpoint over an [`HttpTransport`]
pub struct HttpFetcher<T> {
    transport: T,
    base_path: String,
}

impl<T: HttpTransport> HttpFetcher<T> {
    pub fn new(transport: T, base_path: impl Into<String>) -> Self {
        Self {
            transport,
            base_path: base_path.into(),
        }
    }
}

impl<T: HttpTransport> ProfileFetcher for HttpFetcher<T> {
    fn fetch_by_id(
        &self,
        id: &ProfileId,
    ) -> impl Future<Output = Result<ProfileRecord, ClientError>> + Send {
        let id = id.clone();
        let request = protocol::result_request(&self.base_path, &id);
        async move {
            let request = request.map_err(|e| ClientError::Transport {
                id: id.clone(),
                message: e.to_string(),
            })?;
            let response = self
                .transport
                .send(request)
                .await
                .map_err(|message| ClientError::Transport {
                    id: id.clone(),
                    message,
                })?;

            if response.status() != StatusCode::OK {
                return Err(ClientError::Status {
                    id,
                    status: response.status().as_u16(),
                });
            }
            ProfileRecord::from_json(response.body()).map_err(|e| ClientError::Decode {
                id,
                message: e.to_string(),
            })
        }
    }
}

/// Transport that answers result fetches straight from a local store
pub struct InProcessTransport {
    store: Arc<ProfileStore>,
}

impl InProcessTransport {
    pub fn new(store: Arc<ProfileStore>) -> Self {
        Self { store }
    }
}

impl HttpTransport for InProcessTransport {
    fn send(
        &self,
        request: Request<()>,
    ) -> impl Future<Output = Result<Response<String>, String>> + Send {
        let response = protocol::serve_results(&self.store, &request.map(|()| Vec::<u8>::new()));
        async move { Ok(response) }
    }
}

/// A completed outbound call, as reported by the host
#[derive(Debug, Clone)]
pub struct ObservedCall {
    pub url: Url,
    pub headers: HeaderMap,
}

/// Notification hook the host invokes after every outbound call completes
pub trait CallObserver: Send + Sync {
    fn on_call_complete(&self, call: &ObservedCall);
}

/// Host-side registry of call observers
#[derive(Default)]
pub struct ObserverRegistry {
    observers: RwLock<Vec<Arc<dyn CallObserver>>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, observer: Arc<dyn CallObserver>) {
        self.observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    /// Report a completed call to every registered observer
    pub fn notify(&self, call: &ObservedCall) {
        let observers = self.observers.read().unwrap_or_else(PoisonError::into_inner).clone();
        for observer in observers {
            observer.on_call_complete(call);
        }
    }

    pub fn len(&self) -> usize {
        self.observers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Startup options of the client
#[derive(Debug, Clone, PartialEq)]
pub struct ClientOptions {
    /// Profiler base path; calls to it are never inspected
    pub path: String,
    /// Profile of the page's own top-level request
    pub current_id: ProfileId,
    /// Only calls to this origin are inspected
    pub origin: Origin,
}

impl ClientOptions {
    pub fn new(path: impl Into<String>, current_id: ProfileId, origin: Origin) -> Self {
        Self {
            path: path.into(),
            current_id,
            origin,
        }
    }

    /// Options for a page at `page_url` bootstrapped by the injected tag
    pub fn from_bootstrap(bootstrap: &BootstrapOptions, page_url: &Url) -> Self {
        Self {
            path: bootstrap.path.clone(),
            current_id: bootstrap.current_id.clone(),
            origin: page_url.origin(),
        }
    }
}

type Outcome = Option<Result<ResultSummary, ClientError>>;

struct Inner<F> {
    fetcher: F,
    options: ClientOptions,
    runtime: Handle,
    fetches: Mutex<HashMap<ProfileId, watch::Receiver<Outcome>>>,
    results: Mutex<Vec<ResultSummary>>,
    updates: broadcast::Sender<ResultSummary>,
    fetches_started: AtomicU64,
}

/// Discovers and fetches every profile relevant to a page
pub struct CorrelationClient<F> {
    inner: Arc<Inner<F>>,
}

impl<F> Clone for CorrelationClient<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: ProfileFetcher> CorrelationClient<F> {
    /// Start the client on the current tokio runtime and fetch the page's own profile.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn start(options: ClientOptions, fetcher: F) -> Self {
        Self::start_on(Handle::current(), options, fetcher)
    }

    pub fn start_on(runtime: Handle, options: ClientOptions, fetcher: F) -> Self {
        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        let client = Self {
            inner: Arc::new(Inner {
                fetcher,
                options,
                runtime,
                fetches: Mutex::new(HashMap::new()),
                results: Mutex::new(Vec::new()),
                updates,
                fetches_started: AtomicU64::new(0),
            }),
        };
        let current = client.inner.options.current_id.clone();
        client.dispatch(current);
        client
    }

    /// Fetch `id`, sharing the single underlying fetch with every other caller
    pub fn fetch_once(
        &self,
        id: ProfileId,
    ) -> impl Future<Output = Result<ResultSummary, ClientError>> + Send + 'static {
        let mut rx = self.dispatch(id.clone());
        async move {
            let outcome = rx
                .wait_for(Option::is_some)
                .await
                .map_err(|_| ClientError::Abandoned(id.clone()))?;
            outcome
                .clone()
                .unwrap_or_else(|| Err(ClientError::Abandoned(id)))
        }
    }

    /// Inspect a completed outbound call and dispatch fetches for any new ids.
    ///
    /// Calls to the profiler itself and cross-origin calls are ignored.
    /// Returns the ids announced by the call.
    pub fn observe(&self, call: &ObservedCall) -> Vec<ProfileId> {
        let options = &self.inner.options;
        if call.url.as_str().contains(options.path.as_str()) {
            return Vec::new();
        }
        if call.url.origin() != options.origin {
            return Vec::new();
        }

        let ids = protocol::completed_ids(&call.headers);
        for id in &ids {
            self.dispatch(id.clone());
        }
        ids
    }

    /// Start the fetch for `id` unless one was already started
    fn dispatch(&self, id: ProfileId) -> watch::Receiver<Outcome> {
        let mut fetches = self.inner.fetches.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(rx) = fetches.get(&id) {
            return rx.clone();
        }

        let (tx, rx) = watch::channel(None);
        fetches.insert(id.clone(), rx.clone());
        drop(fetches);

        self.inner.fetches_started.fetch_add(1, Ordering::Relaxed);
        debug!(%id, "fetching profile");
        let inner = Arc::clone(&self.inner);
        self.inner.runtime.spawn(async move {
            let outcome = inner
                .fetcher
                .fetch_by_id(&id)
                .await
                .and_then(|record| ResultSummary::from_record(&record));

            match &outcome {
                Ok(summary) => {
                    inner
                        .results
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .push(summary.clone());
                    // no subscribers is fine
                    let _ = inner.updates.send(summary.clone());
                }
                Err(e) => warn!(%id, "profile fetch failed: {}", e),
            }
            let _ = tx.send(Some(outcome));
        });
        rx
    }

    /// Results received so far, in arrival order
    pub fn results(&self) -> Vec<ResultSummary> {
        self.inner
            .results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Live stream of results as they arrive
    pub fn subscribe(&self) -> broadcast::Receiver<ResultSummary> {
        self.inner.updates.subscribe()
    }

    /// Number of underlying fetches started
    pub fn fetches_started(&self) -> u64 {
        self.inner.fetches_started.load(Ordering::Relaxed)
    }

    /// Every id a fetch was dispatched for
    pub fn known_ids(&self) -> Vec<ProfileId> {
        let mut ids: Vec<_> = self
            .inner
            .fetches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    pub fn options(&self) -> &ClientOptions {
        &self.inner.options
    }
}

impl<F: ProfileFetcher> CallObserver for CorrelationClient<F> {
    fn on_call_complete(&self, call: &ObservedCall) {
        self.observe(call);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::TimingRecord;
    use crate::timing_node::NodeId;

    fn record(id: &str, name: &str, ms: u64) -> ProfileRecord {
        let duration = Duration::from_millis(ms);
        ProfileRecord {
            version: protocol::SCHEMA_VERSION,
            id: ProfileId::new(id),
            name: name.to_string(),
            started: 0,
            machine_name: None,
            user: "unknown user".to_string(),
            has_user_viewed: false,
            duration,
            sub_events_duration: Duration::ZERO,
            has_sub_events: false,
            has_duplicate_sub_events: false,
            has_trivial_timings: false,
            has_all_trivial_timings: false,
            trivial_threshold: Duration::from_millis(2),
            client_timings: None,
            root: TimingRecord {
                id: NodeId(0),
                name: name.to_string(),
                start: Duration::ZERO,
                duration,
                duration_without_children: duration,
                depth: 0,
                parent_timing_id: None,
                is_root: true,
                is_trivial: false,
                has_children: false,
                children: vec![],
                has_sub_events: false,
                has_duplicate_sub_events: false,
                sub_events_duration: Duration::ZERO,
                sub_events: vec![],
            },
        }
    }

    #[test]
    fn test_summary_splits_method_and_path() {
        let summary =
            ResultSummary::from_record(&record("abc", "GET http://localhost:3000/users?page=2", 12))
                .unwrap();
        assert_eq!(summary.method, "GET");
        assert_eq!(summary.url_path, "/users");
        assert_eq!(summary.duration, Duration::from_millis(12));
    }

    #[test]
    fn test_summary_rejects_bad_name() {
        assert!(matches!(
            ResultSummary::from_record(&record("abc", "nospace", 1)),
            Err(ClientError::InvalidName(_))
        ));
        assert!(matches!(
            ResultSummary::from_record(&record("abc", "GET not-a-url", 1)),
            Err(ClientError::InvalidName(_))
        ));
    }

    struct Recorder {
        seen: Mutex<Vec<String>>,
    }

    impl CallObserver for Recorder {
        fn on_call_complete(&self, call: &ObservedCall) {
            self.seen.lock().unwrap().push(call.url.to_string());
        }
    }

    #[test]
    fn test_registry_notifies_every_observer() {
        let registry = ObserverRegistry::new();
        let a = Arc::new(Recorder { seen: Mutex::new(vec![]) });
        let b = Arc::new(Recorder { seen: Mutex::new(vec![]) });
        registry.register(a.clone());
        registry.register(b.clone());
        assert_eq!(registry.len(), 2);

        registry.notify(&ObservedCall {
            url: Url::parse("http://localhost/api").unwrap(),
            headers: HeaderMap::new(),
        });
        assert_eq!(a.seen.lock().unwrap().len(), 1);
        assert_eq!(b.seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_options_from_bootstrap() {
        let bootstrap = BootstrapOptions::from_attributes([
            ("data-path", "/mp/"),
            ("data-current-id", "abc"),
        ])
        .unwrap();
        let page = Url::parse("https://shop.test/cart").unwrap();
        let options = ClientOptions::from_bootstrap(&bootstrap, &page);
        assert_eq!(options.path, "/mp/");
        assert_eq!(options.current_id, ProfileId::new("abc"));
        assert_eq!(options.origin, page.origin());
    }
}
