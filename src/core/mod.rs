pub mod document;
pub mod error;
pub mod mode;

pub use document::{Document, ID_FIELD, from_document, query_to_string, to_document};
pub use error::{Result, SessionError, StoreError, StoreResult};
pub use mode::ConsistencyMode;
