//! Application handler contract.
//!
//! # Responsibilities
//! - Define the single synchronous call a worker makes per request
//! - Classify handler failures into per-request and worker-fatal
//! - Attach request id and listener context before dispatch
//!
//! # Design Decisions
//! - Plain `http` types: no framework assumptions
//! - A per-request error closes that connection only; `Fatal` ends the worker
//!   so the master replaces it

use http::header::HeaderValue;
use http::{Request, Response};
use thiserror::Error;
use uuid::Uuid;

use crate::config::WorkerInfo;
use crate::net::ListenAddress;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("malformed request: {0}")]
    BadRequest(String),

    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),

    #[error("application error: {0}")]
    Application(String),

    /// The worker is no longer in a usable state.
    #[error("fatal worker error: {0}")]
    Fatal(String),
}

impl HandlerError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, HandlerError::Fatal(_))
    }
}

/// Listener and worker the request arrived on. Stored in request extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub listener: ListenAddress,
    pub worker: WorkerInfo,
    pub request_id: Uuid,
}

/// Per-request application entry point.
pub trait Handler {
    fn handle(&mut self, request: Request<Vec<u8>>) -> Result<Response<Vec<u8>>, HandlerError>;
}

impl<F> Handler for F
where
    F: FnMut(Request<Vec<u8>>) -> Result<Response<Vec<u8>>, HandlerError>,
{
    fn handle(&mut self, request: Request<Vec<u8>>) -> Result<Response<Vec<u8>>, HandlerError> {
        self(request)
    }
}

/// Use the client's `x-request-id` if it sent a valid UUID, else `fallback`.
/// Either way the header is present afterwards.
pub fn ensure_request_id<B>(request: &mut Request<B>, fallback: Uuid) -> Uuid {
    let existing = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| Uuid::parse_str(v).ok());

    match existing {
        Some(id) => id,
        None => {
            if let Ok(value) = HeaderValue::from_str(&fallback.to_string()) {
                request.headers_mut().insert(REQUEST_ID_HEADER, value);
            }
            fallback
        }
    }
}
