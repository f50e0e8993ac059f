//! Almacén de metadatos de tareas con TTL.
//!
//! Vive aparte de la cola: un JSON por tarea, indexado por id, pensado para
//! clientes que consultan el avance de una tarea directamente. Los registros
//! vencidos se borran al leerlos, no de forma proactiva (salvo
//! [`TaskMetadataStore::cleanup_expired_tasks`]).

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration as StdDuration,
};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::fsutil::{
    list_json, older_than, read_if_exists, remove_if_exists, sweep_stale_temps, write_atomic,
    STALE_TEMP_AGE,
};
use crate::results::{ItemError, ItemResult, Summary};
use crate::task::{TaskId, TaskStatus};

/// Vigencia por defecto de un registro (24h).
pub const DEFAULT_TTL_SECS: i64 = 24 * 60 * 60;
/// Vigencia máxima desde que se guardó (72h).
pub const MAX_TTL_SECS: i64 = 72 * 60 * 60;
/// Avance a partir del cual se extiende la vigencia.
pub const EXTEND_RATIO: f64 = 0.8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMetadataRecord {
    pub task_id: TaskId,
    pub status: TaskStatus,
    #[serde(default)]
    pub request_data: Value,

    #[serde(with = "chrono::serde::ts_seconds")]
    pub created_at: DateTime<Utc>,
    #[serde(default, with = "chrono::serde::ts_seconds_option", skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub expires_at: DateTime<Utc>,
    #[serde(default, with = "chrono::serde::ts_seconds_option", skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_seconds_option", skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_seconds_option", skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_items: Option<usize>,
    #[serde(default)]
    pub completed_items: usize,
    #[serde(default)]
    pub failed_items: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<ItemResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ItemError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<Summary>,
}

/// Datos para crear un registro. `expires_at` se recorta a 72h.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub status: TaskStatus,
    pub request_data: Value,
    pub total_items: Option<usize>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl NewTask {
    pub fn pending(request_data: Value) -> Self {
        Self {
            status: TaskStatus::Pending,
            request_data,
            total_items: None,
            expires_at: None,
        }
    }
}

/// Actualización parcial: cada campo presente pisa al existente.
#[derive(Debug, Clone, Default)]
pub struct TaskUpdate {
    pub status: Option<TaskStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub total_items: Option<usize>,
    pub completed_items: Option<usize>,
    pub failed_items: Option<usize>,
    pub results: Option<Vec<ItemResult>>,
    pub errors: Option<Vec<ItemError>>,
    pub summary: Option<Summary>,
}

impl TaskUpdate {
    fn apply(self, record: &mut TaskMetadataRecord) {
        if let Some(v) = self.status {
            record.status = v;
        }
        if let Some(v) = self.started_at {
            record.started_at = Some(v);
        }
        if let Some(v) = self.completed_at {
            record.completed_at = Some(v);
        }
        if let Some(v) = self.failed_at {
            record.failed_at = Some(v);
        }
        if let Some(v) = self.error_message {
            record.error_message = Some(v);
        }
        if let Some(v) = self.total_items {
            record.total_items = Some(v);
        }
        if let Some(v) = self.completed_items {
            record.completed_items = v;
        }
        if let Some(v) = self.failed_items {
            record.failed_items = v;
        }
        if let Some(v) = self.results {
            record.results = v;
        }
        if let Some(v) = self.errors {
            record.errors = v;
        }
        if let Some(v) = self.summary {
            record.summary = Some(v);
        }
    }
}

/// Proyección liviana para polling: sin resultados ni errores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub total_items: usize,
    pub completed_items: usize,
    pub failed_items: usize,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub created_at: DateTime<Utc>,
    #[serde(default, with = "chrono::serde::ts_seconds_option", skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(with = "chrono::serde::ts_seconds")]
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<Summary>,
    #[serde(default, with = "chrono::serde::ts_seconds_option", skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_seconds_option", skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<DateTime<Utc>>,
}

impl From<&TaskMetadataRecord> for TaskSummary {
    fn from(r: &TaskMetadataRecord) -> Self {
        Self {
            task_id: r.task_id.clone(),
            status: r.status,
            total_items: r.total_items.unwrap_or(0),
            completed_items: r.completed_items,
            failed_items: r.failed_items,
            created_at: r.created_at,
            updated_at: r.updated_at,
            expires_at: r.expires_at,
            summary: r.summary,
            completed_at: r.completed_at,
            failed_at: r.failed_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskMetadataStore {
    root: PathBuf,
}

/// Nombre de archivo seguro: todo lo que no sea `[A-Za-z0-9_-]` pasa a `_`.
pub fn safe_file_stem(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect()
}

/// Lee `expiresAt` (segundos unix) de un registro sin tiparlo entero.
fn raw_expiry(value: &Value) -> Option<DateTime<Utc>> {
    value
        .get("expiresAt")
        .and_then(Value::as_i64)
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
}

impl TaskMetadataStore {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| StoreError::io(&root, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, id: &str) -> PathBuf {
        self.root.join(format!("{}.json", safe_file_stem(id)))
    }

    fn write(&self, path: &Path, record: &TaskMetadataRecord) -> Result<(), StoreError> {
        let bytes = serde_json::to_vec(record).map_err(|e| StoreError::json(path, e))?;
        write_atomic(path, &bytes)
    }

    /// Lectura con las reglas de vencimiento: borra el archivo si el mtime
    /// supera las 72h o si `expiresAt` ya pasó.
    fn read_live(&self, id: &str) -> Result<Option<TaskMetadataRecord>, StoreError> {
        let path = self.path(id);

        let mtime = match fs::metadata(&path).and_then(|m| m.modified()) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(&path, e)),
        };
        if older_than(mtime, StdDuration::from_secs(MAX_TTL_SECS as u64)) {
            remove_if_exists(&path)?;
            debug!("metadatos de {} superaron 72h, borrados", id);
            return Ok(None);
        }

        let Some(bytes) = read_if_exists(&path)? else {
            return Ok(None);
        };
        let record: TaskMetadataRecord = match serde_json::from_slice(&bytes) {
            Ok(r) => r,
            Err(e) => {
                warn!("metadatos ilegibles para {}: {}", id, e);
                return Ok(None);
            }
        };

        if Utc::now() > record.expires_at {
            remove_if_exists(&path)?;
            debug!("metadatos de {} vencidos, borrados", id);
            return Ok(None);
        }

        Ok(Some(record))
    }

    pub fn save_task(&self, id: &str, task: NewTask) -> Result<TaskMetadataRecord, StoreError> {
        let now = Utc::now();
        let ceiling = now + Duration::seconds(MAX_TTL_SECS);
        let expires_at = task
            .expires_at
            .unwrap_or(now + Duration::seconds(DEFAULT_TTL_SECS))
            .min(ceiling);

        let record = TaskMetadataRecord {
            task_id: id.to_string(),
            status: task.status,
            request_data: task.request_data,
            created_at: now,
            updated_at: None,
            expires_at,
            started_at: None,
            completed_at: None,
            failed_at: None,
            error_message: None,
            total_items: task.total_items,
            completed_items: 0,
            failed_items: 0,
            results: Vec::new(),
            errors: Vec::new(),
            summary: None,
        };

        self.write(&self.path(id), &record)?;
        debug!("metadatos de {} guardados (vence {})", id, expires_at);
        Ok(record)
    }

    pub fn get_task(&self, id: &str) -> Result<Option<TaskMetadataRecord>, StoreError> {
        self.read_live(id)
    }

    pub fn get_task_summary(&self, id: &str) -> Result<Option<TaskSummary>, StoreError> {
        Ok(self.read_live(id)?.as_ref().map(TaskSummary::from))
    }

    /// Fusiona `update` sobre el registro vigente. `false` si no existe o venció.
    ///
    /// Si el avance fusionado supera el 80%, la vigencia se estira hasta al
    /// menos 24h desde ahora, sin pasar de 72h desde que se creó.
    pub fn update_task(&self, id: &str, update: TaskUpdate) -> Result<bool, StoreError> {
        let Some(mut record) = self.read_live(id)? else {
            return Ok(false);
        };

        let now = Utc::now();
        update.apply(&mut record);
        record.updated_at = Some(now);

        if let Some(total) = record.total_items.filter(|t| *t > 0) {
            let ratio = record.completed_items as f64 / total as f64;
            if ratio > EXTEND_RATIO {
                let ceiling = record.created_at + Duration::seconds(MAX_TTL_SECS);
                let target = (now + Duration::seconds(DEFAULT_TTL_SECS)).min(ceiling);
                if target > record.expires_at {
                    record.expires_at = target;
                }
            }
        }

        self.write(&self.path(id), &record)?;
        Ok(true)
    }

    /// Siempre `true`: borrar algo que no existe también es éxito.
    pub fn delete_task(&self, id: &str) -> Result<bool, StoreError> {
        remove_if_exists(&self.path(id))?;
        Ok(true)
    }

    /// Borra todo registro sin `expiresAt` válido o ya vencido.
    pub fn cleanup_expired_tasks(&self) -> Result<usize, StoreError> {
        let now = Utc::now();
        let mut cleaned = 0;

        for (stem, _) in list_json(&self.root)? {
            let path = self.root.join(format!("{stem}.json"));
            let Some(bytes) = read_if_exists(&path)? else {
                continue;
            };
            let expiry = serde_json::from_slice::<Value>(&bytes)
                .ok()
                .as_ref()
                .and_then(raw_expiry);

            if expiry.map_or(true, |exp| now > exp) && remove_if_exists(&path)? {
                cleaned += 1;
            }
        }

        let temps = sweep_stale_temps(&self.root, STALE_TEMP_AGE)?;
        if temps > 0 {
            debug!("{} temporales huérfanos borrados", temps);
        }

        info!("limpieza de metadatos: {} registros vencidos", cleaned);
        Ok(cleaned)
    }

    /// Ids de los registros vigentes, del más viejo al más nuevo.
    pub fn get_all_task_ids(&self) -> Result<Vec<TaskId>, StoreError> {
        let now = Utc::now();
        let mut live: Vec<(i64, TaskId)> = Vec::new();

        for (stem, _) in list_json(&self.root)? {
            let path = self.root.join(format!("{stem}.json"));
            let Some(bytes) = read_if_exists(&path)? else {
                continue;
            };
            let Ok(value) = serde_json::from_slice::<Value>(&bytes) else {
                continue;
            };
            let Some(task_id) = value.get("taskId").and_then(Value::as_str) else {
                continue;
            };
            if raw_expiry(&value).is_some_and(|exp| now <= exp) {
                let created = value.get("createdAt").and_then(Value::as_i64).unwrap_or(0);
                live.push((created, task_id.to_string()));
            }
        }

        live.sort();
        Ok(live.into_iter().map(|(_, id)| id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsutil::age_file;
    use crate::job::OutputFormat;
    use serde_json::json;
    use std::env;

    fn temp_dir(sub: &str) -> PathBuf {
        let base = env::temp_dir().join("meta_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    fn store(sub: &str) -> TaskMetadataStore {
        TaskMetadataStore::open(temp_dir(sub)).unwrap()
    }

    fn result(identifier: &str) -> ItemResult {
        ItemResult {
            identifier: identifier.to_string(),
            format: OutputFormat::Png,
            data: Some("aGVsbG8=".into()),
            size: Some(5),
            oss_url: None,
            message: None,
        }
    }

    fn close_to(a: DateTime<Utc>, b: DateTime<Utc>) -> bool {
        (a - b).num_seconds().abs() <= 5
    }

    #[test]
    fn save_task_aplica_ttl_por_defecto_y_tope_de_72h() {
        let s = store("save_ttl");
        let now = Utc::now();

        let rec = s.save_task("task_a", NewTask::pending(json!({"urls": ["https://a"]}))).unwrap();
        assert!(close_to(rec.expires_at, now + Duration::hours(24)));
        assert_eq!(rec.status, TaskStatus::Pending);

        let mut lejos = NewTask::pending(json!({}));
        lejos.expires_at = Some(now + Duration::hours(100));
        let rec = s.save_task("task_b", lejos).unwrap();
        assert!(close_to(rec.expires_at, now + Duration::hours(72)));
    }

    #[test]
    fn get_task_vencido_devuelve_none_y_borra_el_archivo() {
        let s = store("get_vencido");
        let mut task = NewTask::pending(json!({}));
        task.expires_at = Some(Utc::now() - Duration::seconds(10));
        s.save_task("task_v", task).unwrap();
        assert!(s.root().join("task_v.json").exists());

        assert!(s.get_task("task_v").unwrap().is_none());
        assert!(!s.root().join("task_v.json").exists());
        assert!(s.get_task("task_v").unwrap().is_none());
    }

    #[test]
    fn get_task_con_archivo_de_mas_de_72h_se_borra() {
        let s = store("get_mtime");
        s.save_task("task_m", NewTask::pending(json!({}))).unwrap();
        age_file(&s.root().join("task_m.json"), 73 * 3600);

        assert!(s.get_task("task_m").unwrap().is_none());
        assert!(!s.root().join("task_m.json").exists());
    }

    #[test]
    fn ids_inseguros_se_transforman_en_nombres_validos() {
        let s = store("safe_id");
        s.save_task("a/b c.d", NewTask::pending(json!({}))).unwrap();

        assert!(s.root().join("a_b_c_d.json").exists());
        let rec = s.get_task("a/b c.d").unwrap().unwrap();
        assert_eq!(rec.task_id, "a/b c.d");
    }

    #[test]
    fn get_task_summary_omite_resultados_y_errores() {
        let s = store("summary");
        s.save_task("task_s", NewTask::pending(json!({"big": "x"}))).unwrap();
        s.update_task(
            "task_s",
            TaskUpdate {
                total_items: Some(2),
                completed_items: Some(1),
                results: Some(vec![result("url_0")]),
                ..Default::default()
            },
        )
        .unwrap();

        let summary = s.get_task_summary("task_s").unwrap().unwrap();
        assert_eq!(summary.total_items, 2);
        assert_eq!(summary.completed_items, 1);
        let v = serde_json::to_value(&summary).unwrap();
        assert!(v.get("results").is_none());
        assert!(v.get("requestData").is_none());
        assert!(v.get("updatedAt").is_some());
    }

    #[test]
    fn update_task_fusiona_sin_tocar_los_demas_campos() {
        let s = store("update_merge");
        s.save_task("task_u", NewTask::pending(json!({"urls": ["https://a"]}))).unwrap();

        assert!(s
            .update_task(
                "task_u",
                TaskUpdate {
                    status: Some(TaskStatus::Processing),
                    started_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .unwrap());

        let rec = s.get_task("task_u").unwrap().unwrap();
        assert_eq!(rec.status, TaskStatus::Processing);
        assert!(rec.started_at.is_some());
        assert!(rec.updated_at.is_some());
        assert_eq!(rec.request_data["urls"][0], json!("https://a"));
    }

    #[test]
    fn update_task_de_tarea_inexistente_devuelve_false() {
        let s = store("update_none");
        assert!(!s.update_task("task_nada", TaskUpdate::default()).unwrap());
        assert!(!s.root().join("task_nada.json").exists());
    }

    #[test]
    fn update_task_extiende_la_vigencia_cerca_del_final() {
        let s = store("update_extiende");
        let now = Utc::now();
        let mut task = NewTask::pending(json!({}));
        task.expires_at = Some(now + Duration::hours(1));
        task.total_items = Some(10);
        s.save_task("task_e", task).unwrap();

        // 50%: no se extiende
        s.update_task("task_e", TaskUpdate { completed_items: Some(5), ..Default::default() })
            .unwrap();
        let rec = s.get_task("task_e").unwrap().unwrap();
        assert!(close_to(rec.expires_at, now + Duration::hours(1)));

        // 90%: al menos 24h desde ahora
        s.update_task("task_e", TaskUpdate { completed_items: Some(9), ..Default::default() })
            .unwrap();
        let rec = s.get_task("task_e").unwrap().unwrap();
        assert!(close_to(rec.expires_at, now + Duration::hours(24)));
    }

    #[test]
    fn extension_nunca_supera_72h_desde_la_creacion() {
        let s = store("update_tope");
        let now = Utc::now();
        let created = now - Duration::hours(60);
        // registro escrito por otro proceso hace 60h
        let raw = json!({
            "taskId": "task_t",
            "status": "processing",
            "createdAt": created.timestamp(),
            "expiresAt": (now + Duration::hours(1)).timestamp(),
            "totalItems": 10,
        });
        fs::write(s.root().join("task_t.json"), raw.to_string()).unwrap();

        s.update_task("task_t", TaskUpdate { completed_items: Some(9), ..Default::default() })
            .unwrap();
        let rec = s.get_task("task_t").unwrap().unwrap();
        assert!(close_to(rec.expires_at, created + Duration::hours(72)));
    }

    #[test]
    fn delete_task_es_idempotente() {
        let s = store("delete");
        s.save_task("task_d", NewTask::pending(json!({}))).unwrap();
        assert!(s.delete_task("task_d").unwrap());
        assert!(s.delete_task("task_d").unwrap());
        assert!(s.delete_task("nunca_existio").unwrap());
        assert!(s.get_task("task_d").unwrap().is_none());
    }

    #[test]
    fn cleanup_expired_tasks_borra_vencidos_y_sin_expiracion() {
        let s = store("cleanup");
        s.save_task("task_vigente", NewTask::pending(json!({}))).unwrap();
        let mut vieja = NewTask::pending(json!({}));
        vieja.expires_at = Some(Utc::now() - Duration::minutes(1));
        s.save_task("task_vieja", vieja).unwrap();
        fs::write(s.root().join("sin_expiracion.json"), r#"{"taskId":"x"}"#).unwrap();
        fs::write(s.root().join("roto.json"), "{{{").unwrap();

        assert_eq!(s.cleanup_expired_tasks().unwrap(), 3);
        assert!(s.get_task("task_vigente").unwrap().is_some());
    }

    #[test]
    fn cleanup_expired_tasks_borra_temporales_huerfanos() {
        let s = store("cleanup_tmp");
        let viejo = s.root().join(".task_x.json.abc.tmp");
        let nuevo = s.root().join(".task_y.json.def.tmp");
        fs::write(&viejo, "{\"taskId\":").unwrap();
        fs::write(&nuevo, "{\"taskId\":").unwrap();
        age_file(&viejo, 2 * 3600);

        assert_eq!(s.cleanup_expired_tasks().unwrap(), 0);
        assert!(!viejo.exists());
        assert!(nuevo.exists());
    }

    #[test]
    fn get_all_task_ids_lista_solo_vigentes() {
        let s = store("ids");
        s.save_task("task_1", NewTask::pending(json!({}))).unwrap();
        s.save_task("task_2", NewTask::pending(json!({}))).unwrap();
        let mut vieja = NewTask::pending(json!({}));
        vieja.expires_at = Some(Utc::now() - Duration::minutes(1));
        s.save_task("task_3", vieja).unwrap();

        let mut ids = s.get_all_task_ids().unwrap();
        ids.sort();
        assert_eq!(ids, vec!["task_1".to_string(), "task_2".to_string()]);
    }
}
