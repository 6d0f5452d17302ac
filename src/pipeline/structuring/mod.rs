pub mod types;
pub mod parser;
pub mod validation;

pub use types::*;
pub use parser::*;
pub use validation::*;
