//! Record store seam and the SQLite-backed implementation

pub mod result;
pub mod sqlite_store;
pub mod store;

pub use result::*;
pub use sqlite_store::*;
pub use store::*;
