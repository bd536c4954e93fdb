//! Server binary entry point: installs tracing, loads config, and runs
//! `WebSocketServer` with a trivial token validator. Real token
//! issuance is the embedder's responsibility (spec §1); this binary
//! only rejects empty tokens so it is runnable out of the box.

use std::sync::Arc;

use collab_core::config::ServerConfig;
use collab_core::server::{AuthValidator, WebSocketServer};

fn trivial_auth_validator() -> AuthValidator {
    Arc::new(|token: String| {
        Box::pin(async move {
            if token.trim().is_empty() {
                None
            } else {
                Some(token)
            }
        })
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = ServerConfig::load()?;
    tracing::info!(port = config.port, "starting collaboration server");

    let server = Arc::new(WebSocketServer::new(config, trivial_auth_validator()));
    server.run().await
}
