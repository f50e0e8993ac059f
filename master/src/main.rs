mod handlers;
mod monitor;
mod state;

use anyhow::{Context, Result};
use common::Settings;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("shotq_master=debug,tower_http=info")),
        )
        .init();

    let settings = Settings::from_env();
    // el cliente HTTP bloqueante del uploader se construye fuera del runtime
    let state = {
        let settings = settings.clone();
        tokio::task::spawn_blocking(move || AppState::from_settings(&settings))
            .await?
            .context("no se pudieron abrir los almacenes")?
    };
    info!(
        "cola en {}, metadatos en {}",
        settings.queue_dir.display(),
        settings.task_meta_dir.display()
    );

    // router HTTP
    let app = handlers::build_router(state.clone());

    // mantenimiento periódico en segundo plano
    let every = settings.maintenance_interval;
    tokio::spawn(async move {
        monitor::run_maintenance(state, every).await;
    });

    let listener = TcpListener::bind(&settings.master_bind)
        .await
        .with_context(|| format!("no se pudo escuchar en {}", settings.master_bind))?;
    info!("master escuchando en {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}
