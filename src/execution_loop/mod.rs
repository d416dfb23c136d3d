pub mod error_classifier;
pub mod guard;

pub use error_classifier::*;
pub use guard::*;
