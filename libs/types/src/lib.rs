//! Types library for the market data recorder
//!
//! Value types shared by every crate in the workspace. Nothing in here
//! performs I/O; these are the vocabulary the ingestion pipeline speaks.
//!
//! # Modules
//! - `ids`: Identifiers (Symbol, RecordId)
//! - `numeric`: Fixed-point decimal types (Price, Quantity)
//! - `market`: Stream kinds and book/trade sides
//! - `errors`: Parse error taxonomy

// Public modules
pub mod ids;
pub mod numeric;
pub mod market;
pub mod errors;

// Library version constant
pub const LIB_VERSION: &str = "1.0.0";

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::ids::*;
    pub use crate::numeric::*;
    pub use crate::market::*;
    pub use crate::errors::*;
}
