//! Tipos del API HTTP del master, compartidos con el cliente.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::queue::QueueStats;
use crate::task::{TaskId, TaskStatus};

/// Sobre común de todas las respuestas JSON.
///
/// Éxito: `{success: true, data, message}`.
/// Error: `{success: false, error: {code, message}, data: null}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T, message: impl Into<String>) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: Some(message.into()),
            error: None,
        }
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            message: None,
            error: Some(ApiError {
                code: code.into(),
                message: message.into(),
            }),
        }
    }
}

/// Códigos de error del API.
pub mod codes {
    pub const INVALID_REQUEST: &str = "INVALID_REQUEST";
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const RENDER_FAILED: &str = "RENDER_FAILED";
    pub const INTERNAL: &str = "INTERNAL_ERROR";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub total_items: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatsResponse {
    #[serde(flatten)]
    pub stats: QueueStats,
    /// Tareas en processing que ya superaron el timeout (aún sin reclamar)
    pub timeout_tasks: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryFailedResponse {
    pub retried: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryResponse {
    pub task_id: TaskId,
    pub status: TaskStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Respuesta genérica cuando al cliente no le importa el tipo de `data`.
pub type RawResponse = ApiResponse<Value>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sobre_de_error_lleva_data_nula() {
        let resp: ApiResponse<Value> = ApiResponse::error(codes::NOT_FOUND, "tarea no encontrada");
        let v = serde_json::to_value(&resp).unwrap();
        assert_eq!(
            v,
            json!({
                "success": false,
                "data": null,
                "error": {"code": "NOT_FOUND", "message": "tarea no encontrada"},
            })
        );
    }

    #[test]
    fn stats_se_aplanan_junto_al_contador_de_timeouts() {
        let resp = QueueStatsResponse {
            stats: QueueStats {
                pending: 2,
                processing: 1,
                done: 5,
                failed: 0,
            },
            timeout_tasks: 1,
        };
        let v = serde_json::to_value(&resp).unwrap();
        assert_eq!(v["pending"], json!(2));
        assert_eq!(v["timeoutTasks"], json!(1));

        let back: QueueStatsResponse = serde_json::from_value(v).unwrap();
        assert_eq!(back, resp);
    }
}
