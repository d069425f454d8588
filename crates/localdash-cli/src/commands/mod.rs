pub mod common;
pub mod completions;
pub mod config;
pub mod repos;
pub mod tokens;
