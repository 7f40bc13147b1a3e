pub mod config;
pub mod daemon;
pub mod service;
pub mod worker;
