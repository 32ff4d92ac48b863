//! Utility functions for the proxy server

pub mod http;
pub mod url;
pub mod time;

pub use http::*;
pub use url::*;
pub use time::*;
