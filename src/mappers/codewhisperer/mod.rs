pub mod builder;
pub mod models;
pub mod tools;

pub use builder::{build_codewhisperer_request, stable_conversation_id, TranslateError};
