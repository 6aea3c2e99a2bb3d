use anyhow::Result;
use oauth_token_proxy::{
    config::Config,
    manager::TokenManager,
    router,
    session::{MemorySessionStore, SessionStore},
    AppState,
};
use std::{sync::Arc, time::Duration};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const PENDING_PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "oauth_token_proxy=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Arc::new(Config::from_env()?);
    info!("Starting OAuth token proxy server");

    let store: Arc<dyn SessionStore> = Arc::new(MemorySessionStore::new());
    let manager = Arc::new(TokenManager::new(config.clone(), store)?);

    // Abandoned login attempts
    {
        let manager = manager.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PENDING_PURGE_INTERVAL);
            loop {
                interval.tick().await;
                if let Err(e) = manager.purge_expired_pending().await {
                    warn!("Failed to purge pending authorizations: {}", e);
                }
            }
        });
    }

    let app = router(AppState::new(manager));

    let addr = config.server_address();
    info!("Listening on {}", addr);

    println!("\nOAuth Token Proxy Server");
    println!("========================");
    println!("Server running at: http://{}", addr);
    println!("\nAuthentication:");
    println!("  Login:   http://{}/auth/start", addr);
    println!("  Status:  http://{}/auth/status", addr);
    println!("\nAPI Endpoints:");
    println!("  Whoami:  http://{}/whoami", addr);
    println!("  Health:  http://{}/health\n", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
