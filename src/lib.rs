//! miniprof - in-process request profiler with cross-request correlation
//!
//! This library times the handling of each request as a tree of named
//! steps, keeps finished profiles in a bounded-lifetime store, and links
//! profiles produced by follow-up (XHR) requests back to the page that
//! triggered them through response headers and a result-fetch endpoint.

pub mod cli;
pub mod client;
pub mod config;
pub mod context;
pub mod includes;
pub mod profile;
pub mod profiler;
pub mod protocol;
pub mod serde_millis;
pub mod store;
pub mod timing_node;
