//! The request-handler collaborator boundary.
//!
//! The connector never contains HTTP business logic; it hands each parsed
//! transaction to an [`AjpHandler`] and serializes whatever that handler
//! put into the response.

use async_trait::async_trait;

use crate::request::{AjpRequest, AjpResponse};

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The handler wants a specific status on an uncommitted response.
    #[error("handler requested status {status}: {message}")]
    Status { status: u16, message: String },

    #[error("handler failure: {0}")]
    Internal(String),

    #[error("handler I/O failure: {0}")]
    Io(#[from] std::io::Error),
}

/// Invoked once per transaction while the processor is in the SERVICE
/// stage. Implementations may read the request body and write response
/// headers and body through the passed objects; the processor owns commit
/// and end-of-response sequencing.
#[async_trait]
pub trait AjpHandler: Send + Sync {
    async fn handle(
        &self,
        request: &mut AjpRequest,
        response: &mut AjpResponse,
    ) -> Result<(), HandlerError>;
}
