//! Ejecución de tareas por lotes: expande la petición en ítems, los
//! renderiza de a uno y va publicando el avance.
//!
//! Sirve a los dos caminos de envío: tareas guardadas en el almacén de
//! metadatos ([`BatchWorker::process_task`]) y tareas tomadas de la cola
//! ([`BatchWorker::process_claimed`]).

use std::{ops::ControlFlow, sync::Arc};

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::error::{BatchError, ItemFailure, StoreError};
use crate::job::{RenderJob, RenderRequest};
use crate::meta::{NewTask, TaskMetadataStore, TaskUpdate};
use crate::queue::{TaskQueue, PROCESSING_TIMEOUT_REASON};
use crate::render::{render_one, Renderer, Uploader};
use crate::results::{ItemError, ItemResult, Progress, Summary};
use crate::task::{TaskRecord, TaskStatus};

/// Cada cuántos ítems se publica una foto del avance y cuántos
/// resultados/errores recientes lleva.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressPolicy {
    pub flush_every: usize,
    pub window: usize,
}

impl Default for ProgressPolicy {
    fn default() -> Self {
        Self {
            flush_every: 5,
            window: 5,
        }
    }
}

fn tail<T: Clone>(items: &[T], n: usize) -> Vec<T> {
    items[items.len().saturating_sub(n)..].to_vec()
}

#[derive(Clone)]
pub struct BatchWorker {
    renderer: Arc<dyn Renderer>,
    uploader: Option<Arc<dyn Uploader>>,
    policy: ProgressPolicy,
}

impl BatchWorker {
    pub fn new(renderer: Arc<dyn Renderer>, uploader: Option<Arc<dyn Uploader>>) -> Self {
        Self {
            renderer,
            uploader,
            policy: ProgressPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: ProgressPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> ProgressPolicy {
        self.policy
    }

    /// Valida el payload de la tarea y lo expande en trabajos.
    pub fn prepare(&self, data: &Value) -> Result<Vec<RenderJob>, BatchError> {
        let empty = data.is_null() || data.as_object().is_some_and(|o| o.is_empty());
        if empty {
            return Err(BatchError::EmptyPayload);
        }
        let jobs = RenderRequest::from_value(data)?.expand();
        if jobs.is_empty() {
            return Err(BatchError::EmptyPayload);
        }
        Ok(jobs)
    }

    fn run_job(&self, job: &RenderJob) -> Result<ItemResult, ItemFailure> {
        let (source, options) = job.input.as_ref().map_err(|e| ItemFailure::Validation(e.clone()))?;
        render_one(
            self.renderer.as_ref(),
            self.uploader.as_deref(),
            job.identifier(),
            source,
            options,
        )
    }

    /// Ejecuta los trabajos en orden. Un fallo nunca corta a los demás.
    ///
    /// `on_progress` recibe una foto cada `flush_every` ítems (salvo al
    /// terminar); la foto final, con las listas completas, se devuelve.
    /// Si `on_progress` devuelve `Break` no se renderiza nada más y la foto
    /// devuelta queda con `is_final == false`.
    pub fn run_items(
        &self,
        jobs: &[RenderJob],
        mut on_progress: impl FnMut(&Progress) -> ControlFlow<()>,
    ) -> Progress {
        let total = jobs.len();
        let every = self.policy.flush_every.max(1);
        let mut results: Vec<ItemResult> = Vec::new();
        let mut errors: Vec<ItemError> = Vec::new();

        for (n, job) in jobs.iter().enumerate() {
            match self.run_job(job) {
                Ok(result) => {
                    debug!("ítem {} listo", result.identifier);
                    results.push(result);
                }
                Err(e) => {
                    warn!("ítem {} falló: {}", job.identifier(), e);
                    errors.push(ItemError {
                        index: job.index,
                        kind: job.kind,
                        value: job.value.clone(),
                        error: e.to_string(),
                    });
                }
            }

            let processed = n + 1;
            if processed % every == 0 && processed < total {
                let snapshot = Progress {
                    total_items: total,
                    completed_items: results.len(),
                    failed_items: errors.len(),
                    results: tail(&results, self.policy.window),
                    errors: tail(&errors, self.policy.window),
                    is_final: false,
                };
                if on_progress(&snapshot).is_break() {
                    warn!("lote cortado tras {} de {} ítems", processed, total);
                    return Progress {
                        results,
                        errors,
                        ..snapshot
                    };
                }
            }
        }

        Progress {
            total_items: total,
            completed_items: results.len(),
            failed_items: errors.len(),
            results,
            errors,
            is_final: true,
        }
    }

    // ------------------------------------------------------------------
    // Almacén de metadatos
    // ------------------------------------------------------------------

    /// Procesa una tarea pendiente del almacén de metadatos.
    ///
    /// `false` si la tarea no existe, no está pendiente o termina fallida.
    pub fn process_task(&self, store: &TaskMetadataStore, id: &str) -> bool {
        let record = match store.get_task(id) {
            Ok(Some(r)) => r,
            Ok(None) => {
                warn!("tarea {} no existe o ya venció", id);
                return false;
            }
            Err(e) => {
                error!("no se pudo leer la tarea {}: {}", id, e);
                return false;
            }
        };

        if record.status != TaskStatus::Pending {
            info!("tarea {} en estado {}, se omite", id, record.status);
            return false;
        }

        let claim = TaskUpdate {
            status: Some(TaskStatus::Processing),
            started_at: Some(Utc::now()),
            ..Default::default()
        };
        match store.update_task(id, claim) {
            Ok(true) => {}
            Ok(false) => {
                warn!("tarea {} desapareció antes de arrancar", id);
                return false;
            }
            Err(e) => {
                error!("no se pudo marcar la tarea {} en processing: {}", id, e);
                return false;
            }
        }

        info!("procesando tarea {}", id);
        match self.run_stored(store, id, &record.request_data) {
            Ok(summary) => {
                info!(
                    "tarea {} terminada: {} ok, {} con error",
                    id, summary.success, summary.failed
                );
                true
            }
            Err(e) => {
                error!("tarea {} fallida: {}", id, e);
                let failed = TaskUpdate {
                    status: Some(TaskStatus::Failed),
                    error_message: Some(e.to_string()),
                    failed_at: Some(Utc::now()),
                    ..Default::default()
                };
                if let Err(e) = store.update_task(id, failed) {
                    error!("no se pudo registrar el fallo de {}: {}", id, e);
                }
                false
            }
        }
    }

    fn run_stored(&self, store: &TaskMetadataStore, id: &str, data: &Value) -> Result<Summary, BatchError> {
        let jobs = self.prepare(data)?;

        store.update_task(
            id,
            TaskUpdate {
                total_items: Some(jobs.len()),
                ..Default::default()
            },
        )?;

        let last = self.run_items(&jobs, |p| {
            let snapshot = TaskUpdate {
                completed_items: Some(p.completed_items),
                failed_items: Some(p.failed_items),
                results: Some(p.results.clone()),
                errors: Some(p.errors.clone()),
                ..Default::default()
            };
            match store.update_task(id, snapshot) {
                Ok(true) => ControlFlow::Continue(()),
                // borrada o vencida: no tiene sentido seguir
                Ok(false) => ControlFlow::Break(()),
                Err(e) => {
                    warn!("no se pudo guardar el avance de {}: {}", id, e);
                    ControlFlow::Continue(())
                }
            }
        });
        if !last.is_final {
            return Err(BatchError::Vanished(id.to_string()));
        }

        let summary = last.summary();
        let finished = TaskUpdate {
            status: Some(TaskStatus::Done),
            completed_at: Some(Utc::now()),
            completed_items: Some(last.completed_items),
            failed_items: Some(last.failed_items),
            results: Some(last.results),
            errors: Some(last.errors),
            summary: Some(summary),
            ..Default::default()
        };
        if !store.update_task(id, finished)? {
            return Err(BatchError::Vanished(id.to_string()));
        }
        Ok(summary)
    }

    /// Procesa todas las tareas vigentes del almacén; devuelve cuántas terminaron bien.
    pub fn process_all_pending(&self, store: &TaskMetadataStore) -> Result<usize, StoreError> {
        let ids = store.get_all_task_ids()?;
        let mut processed = 0;
        for id in ids {
            if self.process_task(store, &id) {
                processed += 1;
            }
        }
        Ok(processed)
    }

    // ------------------------------------------------------------------
    // Cola
    // ------------------------------------------------------------------

    /// Procesa una tarea ya tomada con [`TaskQueue::pop`].
    ///
    /// El avance se escribe sobre el archivo en processing; si la tarea fue
    /// reclamada mientras tanto, esas escrituras y el `done` final no tienen
    /// efecto. Con `mirror` la tarea se replica también en el almacén de
    /// metadatos, guardada como processing para que el modo batch no la tome.
    pub fn process_claimed(
        &self,
        queue: &dyn TaskQueue,
        mut record: TaskRecord,
        mirror: Option<&TaskMetadataStore>,
    ) -> bool {
        let id = record.id.clone();

        if let Some(m) = mirror {
            let copy = NewTask {
                status: TaskStatus::Processing,
                request_data: record.data.clone(),
                total_items: None,
                expires_at: None,
            };
            if let Err(e) = m.save_task(&id, copy) {
                warn!("no se pudo replicar la tarea {} en metadatos: {}", id, e);
            }
        }

        let jobs = match self.prepare(&record.data) {
            Ok(jobs) => jobs,
            Err(e) => {
                self.fail_claimed(queue, &id, &e, mirror);
                return false;
            }
        };

        record.total_items = Some(jobs.len());
        match queue.update_progress(&id, &record) {
            Ok(true) => {}
            Ok(false) => {
                self.abandon_claimed(&id, mirror);
                return false;
            }
            Err(e) => warn!("no se pudo guardar el total de {}: {}", id, e),
        }
        mirror_update(
            mirror,
            &id,
            TaskUpdate {
                total_items: Some(jobs.len()),
                started_at: record.started_at,
                ..Default::default()
            },
        );

        let last = self.run_items(&jobs, |p| {
            record.completed_items = p.completed_items;
            record.failed_items = p.failed_items;
            record.results = p.results.clone();
            record.errors = p.errors.clone();
            let keep_going = match queue.update_progress(&id, &record) {
                Ok(true) => true,
                Ok(false) => false,
                Err(e) => {
                    warn!("no se pudo guardar el avance de {}: {}", id, e);
                    true
                }
            };
            if !keep_going {
                return ControlFlow::Break(());
            }
            mirror_update(
                mirror,
                &id,
                TaskUpdate {
                    completed_items: Some(p.completed_items),
                    failed_items: Some(p.failed_items),
                    results: Some(p.results.clone()),
                    errors: Some(p.errors.clone()),
                    ..Default::default()
                },
            );
            ControlFlow::Continue(())
        });
        if !last.is_final {
            self.abandon_claimed(&id, mirror);
            return false;
        }

        let summary = last.summary();
        record.completed_items = last.completed_items;
        record.failed_items = last.failed_items;
        record.results = last.results;
        record.errors = last.errors;
        record.summary = Some(summary);

        mirror_update(
            mirror,
            &id,
            TaskUpdate {
                status: Some(TaskStatus::Done),
                completed_at: Some(Utc::now()),
                completed_items: Some(record.completed_items),
                failed_items: Some(record.failed_items),
                results: Some(record.results.clone()),
                errors: Some(record.errors.clone()),
                summary: Some(summary),
                ..Default::default()
            },
        );

        match queue.done(&id, Some(record)) {
            Ok(true) => {
                info!(
                    "tarea {} terminada: {} ok, {} con error",
                    id, summary.success, summary.failed
                );
                true
            }
            Ok(false) => {
                warn!("tarea {} reclamada por otro proceso, resultado descartado", id);
                false
            }
            Err(e) => {
                error!("no se pudo cerrar la tarea {}: {}", id, e);
                false
            }
        }
    }

    /// La tarea dejó de estar en processing a mitad de camino: otro proceso
    /// la reclamó y el resto del trabajo se descarta.
    fn abandon_claimed(&self, id: &str, mirror: Option<&TaskMetadataStore>) {
        warn!("tarea {} reclamada por otro proceso, se abandona", id);
        mirror_update(
            mirror,
            id,
            TaskUpdate {
                status: Some(TaskStatus::Failed),
                error_message: Some(PROCESSING_TIMEOUT_REASON.to_string()),
                failed_at: Some(Utc::now()),
                ..Default::default()
            },
        );
    }

    fn fail_claimed(&self, queue: &dyn TaskQueue, id: &str, e: &BatchError, mirror: Option<&TaskMetadataStore>) {
        error!("tarea {} fallida: {}", id, e);
        if let Err(err) = queue.fail(id, &e.to_string()) {
            error!("no se pudo mover la tarea {} a failed: {}", id, err);
        }
        mirror_update(
            mirror,
            id,
            TaskUpdate {
                status: Some(TaskStatus::Failed),
                error_message: Some(e.to_string()),
                failed_at: Some(Utc::now()),
                ..Default::default()
            },
        );
    }
}

fn mirror_update(mirror: Option<&TaskMetadataStore>, id: &str, update: TaskUpdate) {
    if let Some(m) = mirror {
        if let Err(e) = m.update_task(id, update) {
            warn!("no se pudo actualizar la réplica de {}: {}", id, e);
        }
    }
}
