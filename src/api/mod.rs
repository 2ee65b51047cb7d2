//! HTTP API module

mod http;

pub use http::HttpServer;
