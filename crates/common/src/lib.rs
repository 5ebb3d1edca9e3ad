//! Common types, protocol definitions, and errors shared across `journal-vault` crates.

pub mod error;
pub mod protocol;

pub use error::ServiceError;
pub use protocol::Record;
