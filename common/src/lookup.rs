//! Búsqueda de una tarea en todos los lugares donde puede vivir.

use serde::Serialize;
use serde_json::Value;

use crate::error::StoreError;
use crate::meta::TaskMetadataStore;
use crate::queue::TaskQueue;
use crate::results::Summary;
use crate::task::{TaskId, TaskStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LookupSource {
    Queue,
    Metadata,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskLookup {
    pub status: TaskStatus,
    pub source: LookupSource,
    pub record: Value,
}

/// Avance resumido, venga de la cola o del almacén de metadatos.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSummary {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub source: LookupSource,
    pub total_items: usize,
    pub completed_items: usize,
    pub failed_items: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<Summary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Orden: done, failed, processing, pending y por último metadatos.
/// Los estados terminales ganan si una carrera deja copias en dos lugares.
pub fn locate_task(
    queue: &dyn TaskQueue,
    meta: Option<&TaskMetadataStore>,
    id: &str,
) -> Result<Option<TaskLookup>, StoreError> {
    if let Some((partition, record)) = queue.get(id)? {
        let mut value = serde_json::to_value(&record).map_err(|e| StoreError::json(id, e))?;
        let status = partition.status();
        value["status"] = Value::from(status.as_str());
        return Ok(Some(TaskLookup {
            status,
            source: LookupSource::Queue,
            record: value,
        }));
    }

    let Some(meta) = meta else {
        return Ok(None);
    };
    match meta.get_task(id)? {
        Some(record) => Ok(Some(TaskLookup {
            status: record.status,
            source: LookupSource::Metadata,
            record: serde_json::to_value(&record).map_err(|e| StoreError::json(id, e))?,
        })),
        None => Ok(None),
    }
}

/// Resumen para polling: primero metadatos, si no la cola.
pub fn summarize_task(
    queue: &dyn TaskQueue,
    meta: Option<&TaskMetadataStore>,
    id: &str,
) -> Result<Option<ProgressSummary>, StoreError> {
    if let Some(s) = meta.map(|m| m.get_task_summary(id)).transpose()?.flatten() {
        return Ok(Some(ProgressSummary {
            task_id: s.task_id,
            status: s.status,
            source: LookupSource::Metadata,
            total_items: s.total_items,
            completed_items: s.completed_items,
            failed_items: s.failed_items,
            summary: s.summary,
            error: None,
        }));
    }

    Ok(queue.get(id)?.map(|(partition, record)| ProgressSummary {
        task_id: record.id,
        status: partition.status(),
        source: LookupSource::Queue,
        total_items: record.total_items.unwrap_or(0),
        completed_items: record.completed_items,
        failed_items: record.failed_items,
        summary: record.summary,
        error: record.error,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::NewTask;
    use crate::queue::QueueStore;
    use serde_json::json;
    use std::{env, fs, path::PathBuf, time::Duration};

    fn temp_dir(sub: &str) -> PathBuf {
        let base = env::temp_dir().join("lookup_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    fn stores(sub: &str) -> (QueueStore, TaskMetadataStore) {
        let base = temp_dir(sub);
        (
            QueueStore::open(base.join("cola"), Duration::from_secs(3600)).unwrap(),
            TaskMetadataStore::open(base.join("meta")).unwrap(),
        )
    }

    #[test]
    fn encuentra_en_la_cola_con_el_estado_de_la_particion() {
        let (q, m) = stores("cola");
        let id = q.push(json!({"urls": ["https://a"]})).unwrap();
        q.pop().unwrap();

        let found = locate_task(&q, Some(&m), &id).unwrap().unwrap();
        assert_eq!(found.status, TaskStatus::Processing);
        assert_eq!(found.source, LookupSource::Queue);
        assert_eq!(found.record["status"], json!("processing"));
        assert_eq!(found.record["id"], json!(id));
    }

    #[test]
    fn la_cola_gana_sobre_los_metadatos() {
        let (q, m) = stores("prioridad");
        let id = q.push(json!({"urls": ["https://a"]})).unwrap();
        q.pop().unwrap();
        q.done(&id, None).unwrap();
        m.save_task(&id, NewTask::pending(json!({}))).unwrap();

        let found = locate_task(&q, Some(&m), &id).unwrap().unwrap();
        assert_eq!(found.status, TaskStatus::Done);
        assert_eq!(found.source, LookupSource::Queue);
    }

    #[test]
    fn cae_a_metadatos_y_luego_a_none() {
        let (q, m) = stores("metadatos");
        m.save_task("task_meta", NewTask::pending(json!({"urls": ["https://a"]})))
            .unwrap();

        let found = locate_task(&q, Some(&m), "task_meta").unwrap().unwrap();
        assert_eq!(found.source, LookupSource::Metadata);
        assert_eq!(found.status, TaskStatus::Pending);
        assert_eq!(found.record["taskId"], json!("task_meta"));

        assert!(locate_task(&q, Some(&m), "task_nada").unwrap().is_none());
        assert!(locate_task(&q, None, "task_meta").unwrap().is_none());
    }

    #[test]
    fn summarize_task_usa_la_cola_si_no_hay_metadatos() {
        let (q, m) = stores("resumen");
        let id = q.push(json!({"urls": ["https://a"]})).unwrap();
        q.pop().unwrap();
        q.fail(&id, "motor caído").unwrap();

        let s = summarize_task(&q, Some(&m), &id).unwrap().unwrap();
        assert_eq!(s.status, TaskStatus::Failed);
        assert_eq!(s.source, LookupSource::Queue);
        assert_eq!(s.error.as_deref(), Some("motor caído"));

        m.save_task("task_m", NewTask::pending(json!({}))).unwrap();
        let s = summarize_task(&q, Some(&m), "task_m").unwrap().unwrap();
        assert_eq!(s.source, LookupSource::Metadata);
        assert_eq!(s.total_items, 0);
    }
}
