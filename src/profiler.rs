//! Request lifecycle glue
//!
//! [`Profiler`] is what a transport middleware talks to. It decides whether
//! a request is profiled, opens an [`InstrumentationContext`] for it, and on
//! completion stores the profile and writes the correlation headers:
//!
//! ```text
//! request ──route()──▶ Passthrough | Results | Asset | Profile
//!                                                     │ start()
//!                                     handler runs with &mut InstrumentationContext
//!                                                     │ complete()
//! response ◀── X-MiniProfilerID, X-MiniProfiler-Ids (XHR only), bootstrap tag (HTML only)
//! ```
//!
//! The store and configuration are injected; there is no process-wide
//! profiler instance.

use std::sync::Arc;

use http::header::{HeaderMap, CONTENT_TYPE, HOST};
use http::request::Parts;
use http::{Request, Response};
use tracing::{debug, error};

use crate::config::ProfilerConfig;
use crate::context::InstrumentationContext;
use crate::includes::BootstrapOptions;
use crate::profile::{Profile, ProfileId};
use crate::protocol;
use crate::store::{ProfileStore, StoreError};

/// Caller-supplied gate deciding whether a request is profiled at all
pub type AuthorizePredicate = Arc<dyn Fn(&Parts) -> bool + Send + Sync>;

/// Where a request should go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Not authorized: hand straight to the application, untouched
    Passthrough,
    /// `<base>results`
    Results,
    /// Any other resource under the base path (served by the transport)
    Asset(String),
    /// Application request to be profiled
    Profile,
}

/// Outcome of [`Profiler::complete`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// Profile stored and headers written
    Stored {
        id: ProfileId,
        /// Bootstrap tag the transport should append to the HTML body
        script: Option<String>,
    },
    /// Response was not successful; profile dropped
    Discarded,
}

pub struct Profiler {
    config: ProfilerConfig,
    store: Arc<ProfileStore>,
    authorize: AuthorizePredicate,
    machine_name: Option<String>,
}

impl Profiler {
    /// Profiler that authorizes every request
    pub fn new(config: ProfilerConfig, store: Arc<ProfileStore>) -> Self {
        let mut config = config;
        config.normalize();
        Self {
            config,
            store,
            authorize: Arc::new(|_| true),
            machine_name: None,
        }
    }

    pub fn with_authorization<F>(mut self, authorize: F) -> Self
    where
        F: Fn(&Parts) -> bool + Send + Sync + 'static,
    {
        self.authorize = Arc::new(authorize);
        self
    }

    pub fn with_machine_name(mut self, machine: impl Into<String>) -> Self {
        self.machine_name = Some(machine.into());
        self
    }

    pub fn config(&self) -> &ProfilerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<ProfileStore> {
        &self.store
    }

    pub fn is_authorized(&self, parts: &Parts) -> bool {
        (self.authorize)(parts)
    }

    /// Classify a request
    pub fn route(&self, parts: &Parts) -> Route {
        if !self.is_authorized(parts) {
            return Route::Passthrough;
        }

        match parts.uri.path().strip_prefix(self.config.base_url_path.as_str()) {
            Some(protocol::RESULTS_RESOURCE) => Route::Results,
            Some(resource) => Route::Asset(resource.to_string()),
            None => Route::Profile,
        }
    }

    /// Open a context for a profiled request; `None` for any other route
    pub fn start(&self, parts: &Parts) -> Option<InstrumentationContext> {
        if self.route(parts) != Route::Profile {
            return None;
        }

        let mut profile = Profile::create(request_name(parts))
            .with_trivial_threshold(self.config.trivial_threshold());
        if let Some(machine) = &self.machine_name {
            profile = profile.with_machine_name(machine.clone());
        }
        debug!(id = %profile.id(), name = profile.name(), "profiling request");
        Some(InstrumentationContext::new(profile))
    }

    /// Serve `<base>results`
    pub fn serve_results<B: AsRef<[u8]>>(&self, request: &Request<B>) -> Response<String> {
        protocol::serve_results(&self.store, request)
    }

    /// Finish a profiled request.
    ///
    /// Only successful (2xx) responses are stored. A stored profile's id is
    /// written to `X-MiniProfilerID`; if the request came from a discovery
    /// channel (XHR) every id produced while handling it is listed in
    /// `X-MiniProfiler-Ids`. For HTML page responses with auto-inject on,
    /// the bootstrap tag is returned for the transport to append.
    pub fn complete<B>(
        &self,
        ctx: InstrumentationContext,
        request_headers: &HeaderMap,
        response: &mut Response<B>,
    ) -> Result<Completion, StoreError> {
        let inject = ctx.auto_inject();
        let elapsed = ctx.elapsed();
        let (profile, related) = ctx.into_parts(elapsed);

        if !response.status().is_success() {
            debug!(id = %profile.id(), status = %response.status(), "discarding profile of unsuccessful response");
            return Ok(Completion::Discarded);
        }

        let stored = self.store.put(profile).map_err(|e| {
            error!("failed to store profile: {}", e);
            e
        })?;
        let id = stored.id().clone();

        let mut ids = Vec::with_capacity(related.len() + 1);
        ids.push(id.clone());
        ids.extend(related.into_iter().filter(|r| r != &id));

        let headers = response.headers_mut();
        protocol::set_current_id(headers, &id);

        let xhr = protocol::is_xhr(request_headers);
        if xhr {
            protocol::set_completed_ids(headers, &ids);
        }

        let script = (self.config.auto_inject && inject && !xhr && is_html(headers)).then(|| {
            let mut options = BootstrapOptions::new(&self.config, id.clone());
            options.ids = ids;
            options.to_script_tag()
        });

        Ok(Completion::Stored { id, script })
    }
}

/// `"<METHOD> <scheme>://<host><path>"`, the profile name format the client splits on
pub fn request_name(parts: &Parts) -> String {
    let scheme = parts.uri.scheme_str().unwrap_or("http");
    let host = parts
        .uri
        .authority()
        .map(|a| a.as_str().to_string())
        .or_else(|| {
            parts
                .headers
                .get(HOST)
                .and_then(|h| h.to_str().ok())
                .map(str::to_string)
        })
        .unwrap_or_else(|| "localhost".to_string());
    let path = parts
        .uri
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/");
    format!("{} {}://{}{}", parts.method, scheme, host, path)
}

fn is_html(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.to_ascii_lowercase().contains("text/html"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderValue, StatusCode};

    fn profiler() -> Profiler {
        Profiler::new(ProfilerConfig::default(), Arc::new(ProfileStore::new()))
    }

    fn parts(uri: &str) -> Parts {
        Request::get(uri)
            .header(HOST, "example.com:8080")
            .body(())
            .unwrap()
            .into_parts()
            .0
    }

    fn html_response() -> Response<()> {
        let mut res = Response::new(());
        res.headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/html; charset=utf-8"));
        res
    }

    #[test]
    fn test_request_name_uses_host_header() {
        assert_eq!(
            request_name(&parts("/users?page=2")),
            "GET http://example.com:8080/users?page=2"
        );
    }

    #[test]
    fn test_request_name_absolute_uri() {
        let parts = Request::post("https://api.test/v1/items")
            .body(())
            .unwrap()
            .into_parts()
            .0;
        assert_eq!(request_name(&parts), "POST https://api.test/v1/items");
    }

    #[test]
    fn test_routes() {
        let p = profiler();
        assert_eq!(p.route(&parts("/users")), Route::Profile);
        assert_eq!(p.route(&parts("/mini-profiler-resources/results")), Route::Results);
        assert_eq!(
            p.route(&parts("/mini-profiler-resources/includes.js")),
            Route::Asset("includes.js".to_string())
        );
    }

    #[test]
    fn test_unauthorized_passes_through() {
        let p = profiler().with_authorization(|parts| parts.headers.contains_key("x-dev"));
        assert_eq!(p.route(&parts("/users")), Route::Passthrough);
        assert!(p.start(&parts("/users")).is_none());
    }

    #[test]
    fn test_profiler_endpoints_are_not_profiled() {
        let p = profiler();
        assert!(p.start(&parts("/mini-profiler-resources/results")).is_none());
    }

    #[test]
    fn test_complete_stores_and_sets_current_id() {
        let p = profiler().with_machine_name("web-1");
        let req = parts("/users");
        let ctx = p.start(&req).unwrap();
        let mut res = Response::new(());

        let completion = p.complete(ctx, &req.headers, &mut res).unwrap();
        let Completion::Stored { id, script } = completion else {
            panic!("expected stored profile");
        };
        assert!(script.is_none());
        assert_eq!(protocol::current_id(res.headers()), Some(id.clone()));
        assert!(res.headers().get(&protocol::IDS_HEADER).is_none());
        let stored = p.store().get(&id).unwrap();
        assert_eq!(stored.machine_name(), Some("web-1"));
        assert_eq!(stored.name(), "GET http://example.com:8080/users");
    }

    #[test]
    fn test_complete_discards_failed_response() {
        let p = profiler();
        let req = parts("/boom");
        let ctx = p.start(&req).unwrap();
        let mut res = Response::new(());
        *res.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;

        assert_eq!(p.complete(ctx, &req.headers, &mut res).unwrap(), Completion::Discarded);
        assert!(p.store().is_empty());
        assert!(protocol::current_id(res.headers()).is_none());
    }

    #[test]
    fn test_xhr_response_lists_completed_ids() {
        let p = profiler();
        let mut req = parts("/api/items");
        req.headers
            .insert(protocol::REQUESTED_WITH_HEADER, HeaderValue::from_static("XMLHttpRequest"));
        let mut ctx = p.start(&req).unwrap();
        ctx.add_related_id(ProfileId::new("nested1"));
        let mut res = html_response();

        let Completion::Stored { id, script } = p.complete(ctx, &req.headers, &mut res).unwrap() else {
            panic!("expected stored profile");
        };
        assert!(script.is_none(), "xhr responses never get the bootstrap tag");
        assert_eq!(
            protocol::completed_ids(res.headers()),
            vec![id, ProfileId::new("nested1")]
        );
    }

    #[test]
    fn test_html_page_gets_bootstrap_tag() {
        let p = profiler();
        let req = parts("/");
        let ctx = p.start(&req).unwrap();
        let mut res = html_response();

        let Completion::Stored { id, script } = p.complete(ctx, &req.headers, &mut res).unwrap() else {
            panic!("expected stored profile");
        };
        let script = script.unwrap();
        assert!(script.contains(&format!("data-current-id=\"{}\"", id)));
    }

    #[test]
    fn test_cancel_auto_inject() {
        let p = profiler();
        let req = parts("/");
        let mut ctx = p.start(&req).unwrap();
        ctx.cancel_auto_inject();
        let mut res = html_response();

        let Completion::Stored { script, .. } = p.complete(ctx, &req.headers, &mut res).unwrap() else {
            panic!("expected stored profile");
        };
        assert!(script.is_none());
    }

    #[test]
    fn test_auto_inject_disabled_in_config() {
        let config = ProfilerConfig {
            auto_inject: false,
            ..Default::default()
        };
        let p = Profiler::new(config, Arc::new(ProfileStore::new()));
        let req = parts("/");
        let ctx = p.start(&req).unwrap();
        let mut res = html_response();
        let Completion::Stored { script, .. } = p.complete(ctx, &req.headers, &mut res).unwrap() else {
            panic!("expected stored profile");
        };
        assert!(script.is_none());
    }

    #[test]
    fn test_results_endpoint_through_profiler() {
        let p = profiler();
        let req = parts("/users");
        let ctx = p.start(&req).unwrap();
        let mut res = Response::new(());
        let Completion::Stored { id, .. } = p.complete(ctx, &req.headers, &mut res).unwrap() else {
            panic!("expected stored profile");
        };

        let (fetch_parts, ()) = protocol::result_request(&p.config().base_url_path, &id)
            .unwrap()
            .into_parts();
        assert_eq!(p.route(&fetch_parts), Route::Results);
        let fetch = Request::from_parts(fetch_parts, Vec::<u8>::new());
        let served = p.serve_results(&fetch);
        assert_eq!(served.status(), StatusCode::OK);
        assert!(p.store().get(&id).unwrap().has_user_viewed());
    }
}
