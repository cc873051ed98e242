//! REST API client module for the blog backend.
//!
//! This module provides the `ApiClient` for talking to the blog API, the
//! `RequestPipeline` every authenticated call goes through, and the
//! `Transport` seam underneath it.
//!
//! The API uses JWT bearer token authentication obtained from `/login` and
//! renewed through `/token/refresh`.

pub mod client;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod transport;

pub use client::ApiClient;
pub use error::ApiError;
pub use pipeline::RequestPipeline;
pub use transport::{ApiRequest, ApiResponse, HttpTransport, Transport, TransportError};
