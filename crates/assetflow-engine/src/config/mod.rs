//! Pipeline definition model, parsing and validation.

pub mod parser;
pub mod types;
pub mod validator;
