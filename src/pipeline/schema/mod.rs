pub mod analyzer;
pub mod types;

pub use analyzer::*;
pub use types::*;
