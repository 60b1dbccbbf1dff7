pub mod lexer;
pub mod parser;
pub mod exec;

use crate::core::errors::Result;
use serde_json::Value;

pub use exec::{Executor, Plan, QueryStats};

/// Parses `text` and substitutes its bind parameters.
pub fn prepare(text: &str, bind_vars: &Value) -> Result<Plan> {
    let query = parser::parse_query(text)?;
    Plan::bind(query, bind_vars)
}
