use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::results::{ItemError, ItemResult, Summary};

pub type TaskId = String;

/// Genera un id de tarea nuevo. El sufijo es un UUID v4, así que no hace
/// falta comprobar colisiones contra la cola.
pub fn new_task_id() -> TaskId {
    format!("task_{}", uuid::Uuid::new_v4().simple())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    #[serde(alias = "completed")]
    Done,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Done => "done",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Done | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registro de una tarea tal como vive en los directorios de la cola.
///
/// El directorio que contiene el archivo es el estado real; `status` sólo
/// lo replica para quien lea el JSON suelto.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: TaskId,
    pub status: TaskStatus,

    /// Cuerpo original de la petición (urls, htmls, items, opciones)
    #[serde(default)]
    pub data: Value,

    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retried_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    // -------- Progreso por ítem --------
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<ItemResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ItemError>,
    #[serde(rename = "completedItems", default)]
    pub completed_items: usize,
    #[serde(rename = "failedItems", default)]
    pub failed_items: usize,
    #[serde(rename = "totalItems", default, skip_serializing_if = "Option::is_none")]
    pub total_items: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<Summary>,
}

impl TaskRecord {
    pub fn new(id: TaskId, data: Value) -> Self {
        Self {
            id,
            status: TaskStatus::Pending,
            data,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            failed_at: None,
            retried_at: None,
            error: None,
            results: Vec::new(),
            errors: Vec::new(),
            completed_items: 0,
            failed_items: 0,
            total_items: None,
            summary: None,
        }
    }

    /// Registro mínimo para cuando el archivo original ya no existe o no se puede leer.
    pub fn placeholder(id: &str, status: TaskStatus) -> Self {
        let mut record = Self::new(id.to_string(), Value::Null);
        record.status = status;
        record
    }
}
