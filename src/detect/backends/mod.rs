//! Built-in detector backends.

pub mod stub;

#[cfg(feature = "backend-http")]
pub mod http;

pub use stub::{StubBackend, StubScript};

#[cfg(feature = "backend-http")]
pub use http::HttpBackend;
