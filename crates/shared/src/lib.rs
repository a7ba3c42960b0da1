pub mod auth;
pub mod error;
pub mod protocol;

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod protocol_tests;
