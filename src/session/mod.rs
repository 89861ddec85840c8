//! Session layer: the supervisor event loop, the request/response
//! multiplexer, and the typed event bus.

pub(crate) mod engine;
pub mod events;
pub mod mux;

pub use engine::{AckPolicy, SessionState};
pub use events::{CloudEvent, ConnectionErrorKind, Event, EventBus};
