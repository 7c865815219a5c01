pub mod args;
pub mod broker;
pub mod config;
pub mod error;
pub mod shutdown;
pub mod worker;
