use std::net::SocketAddr;

use tracing::info;

use castline_mock_server::{AppStateInner, mint_token, seed};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "castline_mock_server=debug,tower_http=debug".into()),
        )
        .init();

    // Config
    let jwt_secret =
        std::env::var("CASTLINE_JWT_SECRET").unwrap_or_else(|_| "dev-secret-change-me".into());
    let host = std::env::var("CASTLINE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
    let port: u16 = std::env::var("CASTLINE_PORT")
        .unwrap_or_else(|_| "3000".into())
        .parse()?;

    let state = AppStateInner::new(jwt_secret.clone());
    let conversation = seed(&state).await;

    // Tokens for the two seeded participants
    info!("Seeded conversation {}", conversation);
    info!("Agency token (user 1): {}", mint_token(&jwt_secret, 1, "Agency")?);
    info!("Model token (user 2): {}", mint_token(&jwt_secret, 2, "Giulia")?);

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    castline_mock_server::serve(listener, state).await
}
