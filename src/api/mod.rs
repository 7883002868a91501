//! HTTP API Module
//!
//! Request dispatch, status and role hooks over HTTP.

mod http;

pub use http::{AppState, HttpServer};
