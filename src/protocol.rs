//! Cross-request correlation protocol (Sprint 3)
//!
//! Three wire contracts live here:
//!
//! 1. `X-MiniProfilerID` - the single id of the profile produced by a
//!    response.
//! 2. `X-MiniProfiler-Ids` - JSON array of every id produced while the
//!    response was being handled, sent to discovery channels (XHR callers).
//! 3. `GET <base>results?id=<id>` - the result-fetch endpoint returning a
//!    versioned [`ProfileRecord`].
//!
//! Header names are matched case-insensitively (`http::HeaderMap`).
//! A malformed ids header decodes to an empty list rather than failing the
//! response pipeline.

use std::time::Duration;

use http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use http::{Request, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::profile::{ClientTimings, NavigationTiming, Profile, ProfileId};
use crate::store::{ProfileStore, StoreError};
use crate::timing_node::{NodeId, SubEvent, TimingNode};

/// Header carrying the id of the profile produced by this response
pub const CURRENT_ID_HEADER: HeaderName = HeaderName::from_static("x-miniprofilerid");

/// Header listing every id completed during this response's handling
pub const IDS_HEADER: HeaderName = HeaderName::from_static("x-miniprofiler-ids");

/// Conventional marker identifying script-issued (XHR) requests
pub const REQUESTED_WITH_HEADER: HeaderName = HeaderName::from_static("x-requested-with");

pub const XHR_MARKER: &str = "XMLHttpRequest";

/// Resource name of the result-fetch endpoint under the base path
pub const RESULTS_RESOURCE: &str = "results";

/// Version of the [`ProfileRecord`] schema
pub const SCHEMA_VERSION: u32 = 1;

/// Encode ids as a JSON array of strings
pub fn encode_ids(ids: &[ProfileId]) -> String {
    serde_json::to_string(ids).unwrap_or_else(|_| "[]".to_string())
}

/// Decode a JSON array of id strings; anything malformed yields no ids
pub fn decode_ids(value: &str) -> Vec<ProfileId> {
    match serde_json::from_str::<Vec<String>>(value) {
        Ok(ids) => ids
            .into_iter()
            .filter(|id| !id.is_empty())
            .map(ProfileId::new)
            .collect(),
        Err(e) => {
            warn!(value, "ignoring malformed {} header: {}", IDS_HEADER, e);
            Vec::new()
        }
    }
}

/// Set the current-id header
pub fn set_current_id(headers: &mut HeaderMap, id: &ProfileId) {
    match HeaderValue::from_str(id.as_str()) {
        Ok(value) => {
            headers.insert(CURRENT_ID_HEADER, value);
        }
        Err(e) => warn!(%id, "profile id is not a valid header value: {}", e),
    }
}

/// Read the current-id header
pub fn current_id(headers: &HeaderMap) -> Option<ProfileId> {
    headers
        .get(&CURRENT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(ProfileId::new)
}

/// Set the completed-ids header; an empty list leaves the headers untouched
pub fn set_completed_ids(headers: &mut HeaderMap, ids: &[ProfileId]) {
    if ids.is_empty() {
        return;
    }
    match HeaderValue::from_str(&encode_ids(ids)) {
        Ok(value) => {
            headers.insert(IDS_HEADER, value);
        }
        Err(e) => warn!("completed ids are not a valid header value: {}", e),
    }
}

/// Read the completed-ids header, failing soft to an empty list
pub fn completed_ids(headers: &HeaderMap) -> Vec<ProfileId> {
    match headers.get(&IDS_HEADER).map(HeaderValue::to_str) {
        Some(Ok(value)) => decode_ids(value),
        Some(Err(_)) => {
            warn!("ignoring non-ASCII {} header", IDS_HEADER);
            Vec::new()
        }
        None => Vec::new(),
    }
}

/// True if the request carries the `X-Requested-With: XMLHttpRequest` marker
pub fn is_xhr(headers: &HeaderMap) -> bool {
    headers
        .get(&REQUESTED_WITH_HEADER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case(XHR_MARKER))
}

/// Path (with query) of the result-fetch endpoint for `id`
pub fn results_path(base_path: &str, id: &ProfileId) -> String {
    let id: String = url::form_urlencoded::byte_serialize(id.as_str().as_bytes()).collect();
    format!("{}{}?id={}", base_path, RESULTS_RESOURCE, id)
}

/// Build the result-fetch request, marked as an instrumentation request
pub fn result_request(base_path: &str, id: &ProfileId) -> Result<Request<()>, http::Error> {
    Request::get(results_path(base_path, id))
        .header(REQUESTED_WITH_HEADER, XHR_MARKER)
        .body(())
}

/// Serialized sub-event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubEventRecord {
    pub description: String,
    #[serde(with = "crate::serde_millis", rename = "start_milliseconds")]
    pub start: Duration,
    #[serde(with = "crate::serde_millis", rename = "duration_milliseconds")]
    pub duration: Duration,
    pub parent_timing_id: NodeId,
    pub is_duplicate: bool,
}

impl From<&SubEvent> for SubEventRecord {
    fn from(event: &SubEvent) -> Self {
        Self {
            description: event.description.clone(),
            start: event.start_offset,
            duration: event.duration,
            parent_timing_id: event.parent_id,
            is_duplicate: event.is_duplicate,
        }
    }
}

/// Serialized timing node, children nested in completion order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingRecord {
    pub id: NodeId,
    pub name: String,
    #[serde(with = "crate::serde_millis", rename = "start_milliseconds")]
    pub start: Duration,
    #[serde(with = "crate::serde_millis", rename = "duration_milliseconds")]
    pub duration: Duration,
    #[serde(with = "crate::serde_millis", rename = "duration_without_children_milliseconds")]
    pub duration_without_children: Duration,
    pub depth: u32,
    #[serde(default)]
    pub parent_timing_id: Option<NodeId>,
    pub is_root: bool,
    pub is_trivial: bool,
    pub has_children: bool,
    #[serde(default)]
    pub children: Vec<TimingRecord>,
    pub has_sub_events: bool,
    pub has_duplicate_sub_events: bool,
    #[serde(with = "crate::serde_millis", rename = "sub_events_duration_milliseconds")]
    pub sub_events_duration: Duration,
    #[serde(default)]
    pub sub_events: Vec<SubEventRecord>,
}

impl TimingRecord {
    fn from_node(node: &TimingNode, trivial_threshold: Duration) -> Self {
        Self {
            id: node.id(),
            name: node.name().to_string(),
            start: node.start_offset(),
            duration: node.duration(),
            duration_without_children: node.duration_without_children(),
            depth: node.depth(),
            parent_timing_id: node.parent_id(),
            is_root: node.is_root(),
            is_trivial: node.is_trivial(trivial_threshold),
            has_children: node.has_children(),
            children: node
                .children()
                .iter()
                .map(|c| Self::from_node(c, trivial_threshold))
                .collect(),
            has_sub_events: node.has_sub_events(),
            has_duplicate_sub_events: node.has_duplicate_sub_events(),
            sub_events_duration: node.sub_event_duration(),
            sub_events: node.sub_events().iter().map(SubEventRecord::from).collect(),
        }
    }
}

/// Versioned result-fetch body for one profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileRecord {
    pub version: u32,
    pub id: ProfileId,
    /// `"<METHOD> <full-URL>"`
    pub name: String,
    /// Creation time, milliseconds since the UNIX epoch
    pub started: u64,
    #[serde(default)]
    pub machine_name: Option<String>,
    pub user: String,
    pub has_user_viewed: bool,
    #[serde(with = "crate::serde_millis", rename = "duration_milliseconds")]
    pub duration: Duration,
    #[serde(with = "crate::serde_millis", rename = "duration_milliseconds_in_sub_events")]
    pub sub_events_duration: Duration,
    pub has_sub_events: bool,
    pub has_duplicate_sub_events: bool,
    pub has_trivial_timings: bool,
    pub has_all_trivial_timings: bool,
    #[serde(with = "crate::serde_millis", rename = "trivial_duration_threshold_milliseconds")]
    pub trivial_threshold: Duration,
    #[serde(default)]
    pub client_timings: Option<ClientTimings>,
    pub root: TimingRecord,
}

impl From<&Profile> for ProfileRecord {
    fn from(profile: &Profile) -> Self {
        Self {
            version: SCHEMA_VERSION,
            id: profile.id().clone(),
            name: profile.name().to_string(),
            started: profile.started_unix_ms(),
            machine_name: profile.machine_name().map(str::to_string),
            user: profile.user().to_string(),
            has_user_viewed: profile.has_user_viewed(),
            duration: profile.duration(),
            sub_events_duration: profile.sub_event_duration(),
            has_sub_events: profile.has_sub_events(),
            has_duplicate_sub_events: profile.has_duplicate_sub_events(),
            has_trivial_timings: profile.has_trivial_timings(),
            has_all_trivial_timings: profile.has_all_trivial_timings(),
            trivial_threshold: profile.trivial_threshold(),
            client_timings: profile.client_timings().cloned(),
            root: TimingRecord::from_node(profile.root(), profile.trivial_threshold()),
        }
    }
}

impl ProfileRecord {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Parameters accepted by the result-fetch endpoint
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultQuery {
    pub id: Option<ProfileId>,
    /// `clientPerformance` parameter: JSON-encoded navigation timing
    pub navigation: Option<NavigationTiming>,
}

impl ResultQuery {
    /// Parse from a urlencoded query string and/or form body
    pub fn parse(query: Option<&str>, form: Option<&[u8]>) -> Self {
        let mut result = Self::default();
        let pairs = query
            .map(|q| url::form_urlencoded::parse(q.as_bytes()))
            .into_iter()
            .chain(form.map(url::form_urlencoded::parse))
            .flatten();

        for (key, value) in pairs {
            match key.as_ref() {
                "id" if !value.is_empty() => result.id = Some(ProfileId::new(value.into_owned())),
                "clientPerformance" => match serde_json::from_str(&value) {
                    Ok(nav) => result.navigation = Some(nav),
                    Err(e) => debug!("ignoring malformed clientPerformance: {}", e),
                },
                _ => {}
            }
        }
        result
    }
}

/// Serve a result-fetch request from `store`.
///
/// - 200 with a JSON [`ProfileRecord`]; the first fetch marks the profile viewed
/// - 404 with a plain-text body for unknown ids
/// - 400 when no id is given
pub fn serve_results<B: AsRef<[u8]>>(store: &ProfileStore, request: &Request<B>) -> Response<String> {
    let is_form = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/x-www-form-urlencoded"));
    let form = is_form.then(|| request.body().as_ref());
    let query = ResultQuery::parse(request.uri().query(), form);

    let Some(id) = query.id else {
        return text_response(StatusCode::BAD_REQUEST, "Missing id".to_string());
    };

    match store.fetch_result(&id, query.navigation.as_ref()) {
        Ok(profile) => {
            let body = ProfileRecord::from(profile.as_ref()).to_json();
            let mut response = Response::new(body);
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e @ StoreError::NotFound(_)) => text_response(StatusCode::NOT_FOUND, e.to_string()),
        Err(e) => text_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

fn text_response(status: StatusCode, body: String) -> Response<String> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    response
}
