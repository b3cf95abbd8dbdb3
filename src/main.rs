use std::{sync::Arc, time::Duration};

use tracing::info;
use tracing_subscriber::EnvFilter;

use inbox_server::realtime::spawn_liveness_probe;
use inbox_server::store::Store;
use inbox_server::types::{db_path_from_env, AppState};
use inbox_server::app;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("inbox_server=info,tower_http=info")),
        )
        .init();

    let port = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(3001);

    let store = Store::open(db_path_from_env());
    let state = Arc::new(AppState::new(store));

    spawn_liveness_probe(state.clone(), Duration::from_secs(30));

    let app = app::router(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind TCP listener");

    info!("inbox server running at http://localhost:{port}");
    axum::serve(listener, app)
        .await
        .expect("server runtime failure");
}
