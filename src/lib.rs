pub mod config;
pub mod console;
pub mod error;
pub mod log;
pub mod runner;
pub mod session;
