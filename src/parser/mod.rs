pub mod frame;
pub mod header;

pub use frame::{EventStreamMessage, EventStreamParser, ParseError};
pub use header::HeaderValue;
