use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use common::{
    config::{BATCH_ERROR_BACKOFF, BATCH_WATCH_INTERVAL, QUEUE_ERROR_BACKOFF, QUEUE_POLL_INTERVAL},
    BatchWorker, QueueStore, Settings, StoreError, TaskMetadataStore, TaskQueue,
};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{error, info, warn};

/// Todo lo que comparte un proceso worker entre iteraciones.
pub struct WorkerContext {
    pub worker_id: String,
    pub queue: Arc<QueueStore>,
    pub meta: Arc<TaskMetadataStore>,
    pub batch: BatchWorker,
    /// Replicar en metadatos las tareas tomadas de la cola
    pub mirror: bool,
}

impl WorkerContext {
    pub fn open(worker_id: String, settings: &Settings, batch: BatchWorker) -> Result<Self> {
        let queue = QueueStore::open(&settings.queue_dir, settings.processing_timeout)
            .with_context(|| format!("no se pudo abrir la cola en {}", settings.queue_dir.display()))?;
        let meta = TaskMetadataStore::open(&settings.task_meta_dir).with_context(|| {
            format!("no se pudo abrir el almacén de metadatos en {}", settings.task_meta_dir.display())
        })?;
        Ok(Self {
            worker_id,
            queue: Arc::new(queue),
            meta: Arc::new(meta),
            batch,
            mirror: settings.mirror_metadata,
        })
    }
}

/// Canal que se pone en `true` con Ctrl-C. La tarea en curso siempre se
/// termina; sólo se corta la espera entre tareas.
pub fn shutdown_signal() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("señal de apagado recibida, terminando tras la tarea en curso");
            let _ = tx.send(true);
        }
    });
    rx
}

/// Duerme `d` salvo que llegue la señal de apagado.
async fn pause(d: Duration, shutdown: &mut watch::Receiver<bool>) {
    tokio::select! {
        _ = sleep(d) => {}
        _ = shutdown.changed() => {}
    }
}

/// Toma una tarea de la cola y la procesa. `Ok(false)` si no había ninguna.
pub async fn queue_tick(ctx: Arc<WorkerContext>) -> Result<bool> {
    let handle = tokio::task::spawn_blocking(move || -> Result<bool, StoreError> {
        let Some(record) = ctx.queue.pop()? else {
            return Ok(false);
        };
        info!("worker {} tomó la tarea {}", ctx.worker_id, record.id);
        let mirror = ctx.mirror.then_some(ctx.meta.as_ref());
        ctx.batch.process_claimed(ctx.queue.as_ref(), record, mirror);
        Ok(true)
    });

    match handle.await {
        Ok(Ok(found)) => Ok(found),
        Ok(Err(e)) => Err(e.into()),
        Err(e) => Err(anyhow::anyhow!("panic o join error procesando la cola: {e}")),
    }
}

/// Loop del worker de cola. Una tarea fallida nunca tumba el proceso.
pub async fn run_queue(ctx: Arc<WorkerContext>, once: bool) -> Result<()> {
    let mut shutdown = shutdown_signal();
    info!("worker {} atendiendo la cola en {}", ctx.worker_id, ctx.queue.base_dir().display());

    while !*shutdown.borrow() {
        match queue_tick(ctx.clone()).await {
            Ok(true) if once => break,
            Ok(true) => {}
            Ok(false) if once => {
                info!("cola vacía");
                break;
            }
            Ok(false) => pause(QUEUE_POLL_INTERVAL, &mut shutdown).await,
            Err(e) => {
                error!("error en el loop de cola: {:#}", e);
                pause(QUEUE_ERROR_BACKOFF, &mut shutdown).await;
            }
        }
    }
    Ok(())
}

/// Procesa una sola tarea del almacén de metadatos. Sale bien aunque la
/// tarea termine fallida: el resultado queda en el registro.
pub async fn run_single_task(ctx: Arc<WorkerContext>, task_id: String) -> Result<bool> {
    let id = task_id.clone();
    let handle = tokio::task::spawn_blocking(move || ctx.batch.process_task(&ctx.meta, &id));

    match handle.await {
        Ok(true) => {
            info!("tarea {} procesada", task_id);
            Ok(true)
        }
        Ok(false) => {
            warn!("tarea {} no se procesó (ver registro)", task_id);
            Ok(false)
        }
        Err(e) => Err(anyhow::anyhow!("panic o join error en la tarea {task_id}: {e}")),
    }
}

async fn drain_pending(ctx: Arc<WorkerContext>) -> Result<usize> {
    let handle = tokio::task::spawn_blocking(move || ctx.batch.process_all_pending(&ctx.meta));
    match handle.await {
        Ok(Ok(n)) => Ok(n),
        Ok(Err(e)) => Err(e.into()),
        Err(e) => Err(anyhow::anyhow!("panic o join error drenando pendientes: {e}")),
    }
}

/// Modo batch: una pasada por las tareas pendientes, o en bucle con `watch`.
pub async fn run_batch(ctx: Arc<WorkerContext>, watch: bool) -> Result<()> {
    if !watch {
        let n = drain_pending(ctx).await?;
        info!("{} tareas procesadas", n);
        return Ok(());
    }

    let mut shutdown = shutdown_signal();
    info!("worker {} vigilando {}", ctx.worker_id, ctx.meta.root().display());
    while !*shutdown.borrow() {
        match drain_pending(ctx.clone()).await {
            Ok(n) => {
                if n > 0 {
                    info!("{} tareas procesadas", n);
                }
                pause(BATCH_WATCH_INTERVAL, &mut shutdown).await;
            }
            Err(e) => {
                error!("error drenando tareas pendientes: {:#}", e);
                pause(BATCH_ERROR_BACKOFF, &mut shutdown).await;
            }
        }
    }
    Ok(())
}
