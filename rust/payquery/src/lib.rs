pub mod config;
pub mod conversation;
pub mod db;
pub mod error;
pub mod pagination;
pub mod plan;
pub mod query;
pub mod registry;
pub mod safety;
pub mod server;
pub mod state;
pub mod telemetry;
pub mod time;
pub mod validator;

use crate::{config::AppConfig, server::Server};

/// Bootstraps the payquery service using environment configuration.
pub async fn run() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    Server::new(config).await?.run().await
}
