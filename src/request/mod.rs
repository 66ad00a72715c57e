//! The transaction surface: request/response objects, the handler
//! collaborator boundary, routing, sessions and admission control.

pub use admission::{Admission, AdmissionControl};
pub use handler::{AjpHandler, HandlerError};
pub use request::{AjpRequest, SESSION_COOKIE_NAME, SESSION_URI_MARKER};
pub use response::{status_text, AjpResponse, Cookie};
pub use router::PathRouter;
pub use session::{MemorySessionRegistry, SessionRegistry};

mod admission;
mod handler;
mod request;
mod response;
mod router;
mod session;
