use std::time::Duration;

use common::{StoreError, TaskMetadataStore, TaskQueue};
use tracing::{error, info, warn};

use crate::state::AppState;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub removed_records: usize,
    pub expired_metadata: usize,
    pub timed_out: usize,
}

/// Una pasada de mantenimiento: purga done/failed viejos, borra metadatos
/// vencidos y cuenta las tareas trabadas en processing. Las vencidas se
/// reclaman solas en el próximo `pop` de algún worker.
pub fn maintenance_pass(
    queue: &dyn TaskQueue,
    meta: &TaskMetadataStore,
    retention_days: u64,
) -> Result<MaintenanceReport, StoreError> {
    Ok(MaintenanceReport {
        removed_records: queue.cleanup(retention_days)?,
        expired_metadata: meta.cleanup_expired_tasks()?,
        timed_out: queue.timeout_task_count()?,
    })
}

pub async fn run_maintenance(state: AppState, every: Duration) {
    loop {
        tokio::time::sleep(every).await;

        let queue = state.queue.clone();
        let meta = state.meta.clone();
        let retention = state.retention_days;
        let pass = tokio::task::spawn_blocking(move || {
            maintenance_pass(queue.as_ref(), meta.as_ref(), retention)
        })
        .await;

        match pass {
            Ok(Ok(report)) => {
                if report.timed_out > 0 {
                    warn!("{} tareas superaron el timeout en processing", report.timed_out);
                }
                info!(
                    "mantenimiento: {} registros purgados, {} metadatos vencidos",
                    report.removed_records, report.expired_metadata
                );
            }
            Ok(Err(e)) => error!("mantenimiento fallido: {}", e),
            Err(e) => error!("mantenimiento interrumpido: {}", e),
        }
    }
}
