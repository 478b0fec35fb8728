//! Decision provider adapters.
//!
//! Each provider implements [`DecisionProvider`](crate::DecisionProvider) for its specific API.

mod gemini;

pub use gemini::{DEFAULT_MODEL, DecisionMode, GeminiBackend, GeminiBackendBuilder};
