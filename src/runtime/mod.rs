//! Built-in function runtimes

pub mod declarative;
pub mod static_content;
