//! Configuration module

pub mod cli;
pub mod client_config;

pub use cli::{CliArgs, Command};
pub use client_config::{ClientConfig, Credentials, LocatorMode, PoolConfig, ServerAddress};
