mod worker;

use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use common::{BatchWorker, CommandRenderer, Renderer, Settings, Uploader};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::worker::WorkerContext;

/// Worker de render: atiende la cola en disco o las tareas del almacén de metadatos.
#[derive(Debug, Parser)]
#[command(name = "shotq-worker", version)]
struct Cli {
    /// Identificador para los logs (por defecto, el hostname)
    #[arg(long, env = "WORKER_ID")]
    worker_id: Option<String>,

    /// Pisa QUEUE_DIR
    #[arg(long)]
    queue_dir: Option<PathBuf>,

    /// Pisa TASK_META_DIR
    #[arg(long)]
    meta_dir: Option<PathBuf>,

    /// Pisa RENDER_COMMAND
    #[arg(long)]
    render_command: Option<String>,

    #[command(subcommand)]
    mode: Mode,
}

#[derive(Debug, Subcommand)]
enum Mode {
    /// Toma tareas de la cola hasta recibir Ctrl-C
    Queue {
        /// Procesa a lo sumo una tarea y sale
        #[arg(long)]
        once: bool,
        /// Replica cada tarea en el almacén de metadatos
        #[arg(long)]
        mirror: bool,
    },
    /// Procesa tareas pendientes del almacén de metadatos
    Batch {
        /// Sólo esta tarea
        #[arg(long, conflicts_with = "watch")]
        task_id: Option<String>,
        /// Repite cada pocos segundos
        #[arg(long)]
        watch: bool,
    },
}

fn worker_id(cli: &Cli) -> String {
    cli.worker_id.clone().unwrap_or_else(|| {
        hostname::get()
            .unwrap_or_default()
            .to_string_lossy()
            .to_string()
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("shotq_worker=debug,common=info")),
        )
        .init();

    let cli = Cli::parse();

    let mut settings = Settings::from_env();
    if let Some(dir) = &cli.queue_dir {
        settings.queue_dir = dir.clone();
    }
    if let Some(dir) = &cli.meta_dir {
        settings.task_meta_dir = dir.clone();
    }
    if let Some(cmd) = &cli.render_command {
        settings.render_command = cmd.clone();
    }
    if let Mode::Queue { mirror: true, .. } = cli.mode {
        settings.mirror_metadata = true;
    }

    let renderer: CommandRenderer = settings
        .renderer()
        .context("RENDER_COMMAND vacío: no hay motor de render")?;
    info!("motor de render: {}", renderer.program());
    let renderer: Arc<dyn Renderer> = Arc::new(renderer);
    // el cliente HTTP bloqueante se construye fuera del runtime
    let uploader = {
        let settings = settings.clone();
        tokio::task::spawn_blocking(move || settings.uploader())
            .await?
            .map(|u| Arc::new(u) as Arc<dyn Uploader>)
    };
    if uploader.is_none() {
        info!("sin UPLOAD_BASE_URL: los ítems con uploadToOSS van a fallar");
    }

    let id = worker_id(&cli);
    let ctx = Arc::new(WorkerContext::open(id, &settings, BatchWorker::new(renderer, uploader))?);

    match cli.mode {
        Mode::Queue { once, .. } => worker::run_queue(ctx, once).await,
        Mode::Batch {
            task_id: Some(task_id),
            ..
        } => worker::run_single_task(ctx, task_id).await.map(|_| ()),
        Mode::Batch { watch, .. } => worker::run_batch(ctx, watch).await,
    }
}
