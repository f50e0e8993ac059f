//! Cola de tareas sobre el sistema de archivos.
//!
//! Un directorio por estado (`pending/`, `processing/`, `done/`, `failed/`)
//! y un JSON por tarea. El directorio donde está el archivo ES el estado de
//! la tarea. El `rename` de pending a processing en [`TaskQueue::pop`] es el
//! único punto de serialización entre workers: sólo uno lo gana.

use std::{
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::StoreError;
use crate::fsutil::{self, list_json, older_than, read_if_exists, remove_if_exists, write_atomic};
use crate::task::{new_task_id, TaskId, TaskRecord, TaskStatus};

/// Motivo fijo con el que se marcan las tareas reclamadas por timeout.
pub const PROCESSING_TIMEOUT_REASON: &str = "processing timeout";

const SECS_PER_DAY: u64 = 24 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Partition {
    Pending,
    Processing,
    Done,
    Failed,
}

impl Partition {
    pub const ALL: [Partition; 4] = [
        Partition::Pending,
        Partition::Processing,
        Partition::Done,
        Partition::Failed,
    ];

    /// Orden de búsqueda por id: primero los estados terminales, para que
    /// una tarea recién movida no se reporte con un estado viejo.
    pub const LOOKUP_ORDER: [Partition; 4] = [
        Partition::Done,
        Partition::Failed,
        Partition::Processing,
        Partition::Pending,
    ];

    pub fn dir_name(&self) -> &'static str {
        self.status().as_str()
    }

    pub fn status(&self) -> TaskStatus {
        match self {
            Partition::Pending => TaskStatus::Pending,
            Partition::Processing => TaskStatus::Processing,
            Partition::Done => TaskStatus::Done,
            Partition::Failed => TaskStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub done: usize,
    pub failed: usize,
}

/// Operaciones de la cola. Quien la use nunca toca rutas directamente.
pub trait TaskQueue: Send + Sync {
    /// Encola un payload nuevo y devuelve su id.
    fn push(&self, data: Value) -> Result<TaskId, StoreError>;

    /// Reclama las tareas vencidas y toma una pendiente. `None` si no hay
    /// pendientes o si otro worker ganó la tarea en este intento.
    fn pop(&self) -> Result<Option<TaskRecord>, StoreError>;

    /// processing -> done. `false` si la tarea ya no estaba en processing.
    fn done(&self, id: &str, record: Option<TaskRecord>) -> Result<bool, StoreError>;

    /// processing -> failed con el motivo dado.
    fn fail(&self, id: &str, reason: &str) -> Result<(), StoreError>;

    /// failed -> pending. `false` si no existe esa tarea fallida.
    fn retry(&self, id: &str) -> Result<bool, StoreError>;

    fn retry_all_failed(&self) -> Result<usize, StoreError>;

    fn stats(&self) -> Result<QueueStats, StoreError>;

    /// Borra tareas done/failed más viejas que `retention_days`.
    fn cleanup(&self, retention_days: u64) -> Result<usize, StoreError>;

    /// Tareas en processing que superaron el timeout, sin reclamarlas.
    fn timeout_task_count(&self) -> Result<usize, StoreError>;

    fn get(&self, id: &str) -> Result<Option<(Partition, TaskRecord)>, StoreError>;

    /// Guarda avance parcial de una tarea en processing. `false` si la tarea
    /// ya fue movida (completada o reclamada) y no se escribió nada.
    fn update_progress(&self, id: &str, record: &TaskRecord) -> Result<bool, StoreError>;
}

#[derive(Debug, Clone)]
pub struct QueueStore {
    base_dir: PathBuf,
    processing_timeout: Duration,
}

/// Los ids son nombres de archivo: nada de separadores ni `..`.
fn is_safe_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
        && !id.starts_with('.')
}

fn encode(record: &TaskRecord, path: &Path) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec_pretty(record).map_err(|e| StoreError::json(path, e))
}

impl QueueStore {
    /// Abre (y crea si hace falta) la estructura de directorios.
    pub fn open(base_dir: impl Into<PathBuf>, processing_timeout: Duration) -> Result<Self, StoreError> {
        let store = Self {
            base_dir: base_dir.into(),
            processing_timeout,
        };
        for p in Partition::ALL {
            let dir = store.partition_dir(p);
            fs::create_dir_all(&dir).map_err(|e| StoreError::io(&dir, e))?;
        }
        Ok(store)
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn processing_timeout(&self) -> Duration {
        self.processing_timeout
    }

    fn partition_dir(&self, p: Partition) -> PathBuf {
        self.base_dir.join(p.dir_name())
    }

    fn path(&self, p: Partition, id: &str) -> PathBuf {
        self.partition_dir(p).join(format!("{id}.json"))
    }

    /// Lee un registro. `Ok(None)` si el archivo no existe.
    fn load(&self, path: &Path) -> Result<Option<TaskRecord>, StoreError> {
        match read_if_exists(path)? {
            None => Ok(None),
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| StoreError::json(path, e)),
        }
    }

    /// Como `load`, pero un JSON corrupto se reemplaza por un registro mínimo.
    fn load_or_placeholder(
        &self,
        path: &Path,
        id: &str,
        status: TaskStatus,
    ) -> Result<Option<TaskRecord>, StoreError> {
        match self.load(path) {
            Err(StoreError::Json { path, source }) => {
                warn!("registro ilegible {}: {}, usando registro mínimo", path, source);
                Ok(Some(TaskRecord::placeholder(id, status)))
            }
            other => other,
        }
    }

    /// Mueve a failed toda tarea en processing cuyo archivo no se tocó
    /// durante más que el timeout.
    fn reclaim_timed_out(&self) -> Result<usize, StoreError> {
        let mut reclaimed = 0;

        for (id, mtime) in list_json(&self.partition_dir(Partition::Processing))? {
            if !older_than(mtime, self.processing_timeout) {
                continue;
            }

            let src = self.path(Partition::Processing, &id);
            let dst = self.path(Partition::Failed, &id);

            let Some(mut record) = self.load_or_placeholder(&src, &id, TaskStatus::Failed)? else {
                continue;
            };

            // el rename decide quién reclama; si falla, otro ya la movió
            if let Err(e) = fs::rename(&src, &dst) {
                debug!("tarea {} ya no está en processing ({})", id, e);
                continue;
            }

            record.status = TaskStatus::Failed;
            record.error = Some(PROCESSING_TIMEOUT_REASON.to_string());
            record.failed_at = Some(Utc::now());
            write_atomic(&dst, &encode(&record, &dst)?)?;

            warn!("tarea {} venció en processing, movida a failed", id);
            reclaimed += 1;
        }

        Ok(reclaimed)
    }

    /// Primer paso de [`TaskQueue::pop`]: mueve `id` de pending a processing.
    ///
    /// El mtime se refresca antes del rename, así en processing la edad se
    /// mide desde la toma y no desde que se encoló. Una tarea que esperó
    /// mucho en pending no aparece vencida antes de que su worker la marque.
    fn claim(&self, id: &str) -> Result<bool, StoreError> {
        let src = self.path(Partition::Pending, id);
        let dst = self.path(Partition::Processing, id);

        if !fsutil::touch(&src)? {
            debug!("tarea {} ya no está en pending", id);
            return Ok(false);
        }
        if let Err(e) = fs::rename(&src, &dst) {
            // otro proceso pudo haber ganado la tarea
            debug!("no se pudo tomar la tarea {}: {}", id, e);
            return Ok(false);
        }
        Ok(true)
    }

    fn count(&self, p: Partition) -> Result<usize, StoreError> {
        Ok(list_json(&self.partition_dir(p))?.len())
    }
}

impl TaskQueue for QueueStore {
    fn push(&self, data: Value) -> Result<TaskId, StoreError> {
        let id = new_task_id();
        let record = TaskRecord::new(id.clone(), data);

        let path = self.path(Partition::Pending, &id);
        write_atomic(&path, &encode(&record, &path)?)?;

        info!("tarea {} encolada", id);
        Ok(id)
    }

    fn pop(&self) -> Result<Option<TaskRecord>, StoreError> {
        self.reclaim_timed_out()?;

        // la más vieja primero; no es un orden estricto entre procesos
        let mut pending = list_json(&self.partition_dir(Partition::Pending))?;
        pending.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));

        let Some((id, _)) = pending.into_iter().next() else {
            return Ok(None);
        };

        if !self.claim(&id)? {
            return Ok(None);
        }
        let dst = self.path(Partition::Processing, &id);

        let mut record = match self.load(&dst) {
            Ok(Some(r)) => r,
            Ok(None) => {
                warn!("tarea {} desapareció justo después de tomarla", id);
                return Ok(None);
            }
            Err(StoreError::Json { source, .. }) => {
                let reason = format!("registro ilegible: {source}");
                warn!("tarea {}: {}", id, reason);
                self.fail(&id, &reason)?;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        record.status = TaskStatus::Processing;
        record.started_at = Some(Utc::now());

        let bytes = encode(&record, &dst)?;
        if !fsutil::overwrite_existing(&dst, &bytes, &self.path(Partition::Failed, &id))? {
            warn!("tarea {} movida por otro proceso antes de arrancar", id);
            return Ok(None);
        }

        info!("tarea {} en processing", id);
        Ok(Some(record))
    }

    fn done(&self, id: &str, record: Option<TaskRecord>) -> Result<bool, StoreError> {
        if !is_safe_id(id) {
            return Ok(false);
        }
        let src = self.path(Partition::Processing, id);
        let dst = self.path(Partition::Done, id);

        let record = match record {
            Some(r) => Some(r),
            None => self.load_or_placeholder(&src, id, TaskStatus::Done)?,
        };
        let Some(mut record) = record else {
            warn!("tarea {} no está en processing, done ignorado", id);
            return Ok(false);
        };

        match fs::rename(&src, &dst) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!("tarea {} no está en processing, done ignorado", id);
                return Ok(false);
            }
            Err(e) => return Err(StoreError::io(&src, e)),
        }

        record.status = TaskStatus::Done;
        record.finished_at = Some(Utc::now());
        write_atomic(&dst, &encode(&record, &dst)?)?;

        info!("tarea {} completada", id);
        Ok(true)
    }

    fn fail(&self, id: &str, reason: &str) -> Result<(), StoreError> {
        if !is_safe_id(id) {
            return Ok(());
        }
        let src = self.path(Partition::Processing, id);
        let dst = self.path(Partition::Failed, id);

        // si ya no está en processing se conserva lo que haya en failed
        let mut record = match self.load_or_placeholder(&src, id, TaskStatus::Failed)? {
            Some(r) => r,
            None => self
                .load_or_placeholder(&dst, id, TaskStatus::Failed)?
                .unwrap_or_else(|| TaskRecord::placeholder(id, TaskStatus::Failed)),
        };

        record.status = TaskStatus::Failed;
        record.error = Some(reason.to_string());
        record.failed_at = Some(Utc::now());

        match fs::rename(&src, &dst) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::io(&src, e)),
        }
        write_atomic(&dst, &encode(&record, &dst)?)?;

        warn!("tarea {} fallida ({})", id, reason);
        Ok(())
    }

    fn retry(&self, id: &str) -> Result<bool, StoreError> {
        if !is_safe_id(id) {
            return Ok(false);
        }
        let src = self.path(Partition::Failed, id);
        let dst = self.path(Partition::Pending, id);

        let Some(mut record) = self.load_or_placeholder(&src, id, TaskStatus::Pending)? else {
            warn!("tarea fallida {} no encontrada", id);
            return Ok(false);
        };

        record.status = TaskStatus::Pending;
        record.retried_at = Some(Utc::now());
        record.error = None;
        record.failed_at = None;

        // se limpia en failed/ antes de moverla, así pending nunca ve el error viejo
        write_atomic(&src, &encode(&record, &src)?)?;

        match fs::rename(&src, &dst) {
            Ok(()) => {
                info!("tarea {} devuelta a pending", id);
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!("tarea {} desapareció de failed antes de reintentarla", id);
                Ok(false)
            }
            Err(e) => Err(StoreError::io(&src, e)),
        }
    }

    fn retry_all_failed(&self) -> Result<usize, StoreError> {
        let mut count = 0;
        for (id, _) in list_json(&self.partition_dir(Partition::Failed))? {
            if self.retry(&id)? {
                count += 1;
            }
        }
        info!("{} tareas fallidas reintentadas", count);
        Ok(count)
    }

    fn stats(&self) -> Result<QueueStats, StoreError> {
        Ok(QueueStats {
            pending: self.count(Partition::Pending)?,
            processing: self.count(Partition::Processing)?,
            done: self.count(Partition::Done)?,
            failed: self.count(Partition::Failed)?,
        })
    }

    fn cleanup(&self, retention_days: u64) -> Result<usize, StoreError> {
        let retention = Duration::from_secs(retention_days.saturating_mul(SECS_PER_DAY));
        let mut removed = 0;

        for p in [Partition::Done, Partition::Failed] {
            for (id, mtime) in list_json(&self.partition_dir(p))? {
                if !older_than(mtime, retention) {
                    continue;
                }
                let path = self.path(p, &id);
                if remove_if_exists(&path)? {
                    debug!("borrado registro viejo {}", path.display());
                    removed += 1;
                }
            }
        }

        let mut temps = 0;
        for p in Partition::ALL {
            temps += fsutil::sweep_stale_temps(&self.partition_dir(p), fsutil::STALE_TEMP_AGE)?;
        }
        if temps > 0 {
            debug!("{} temporales huérfanos borrados", temps);
        }

        if removed > 0 {
            info!("limpieza de cola: {} registros borrados", removed);
        }
        Ok(removed)
    }

    fn timeout_task_count(&self) -> Result<usize, StoreError> {
        Ok(list_json(&self.partition_dir(Partition::Processing))?
            .into_iter()
            .filter(|(_, mtime)| older_than(*mtime, self.processing_timeout))
            .count())
    }

    fn get(&self, id: &str) -> Result<Option<(Partition, TaskRecord)>, StoreError> {
        if !is_safe_id(id) {
            return Ok(None);
        }
        for p in Partition::LOOKUP_ORDER {
            match self.load(&self.path(p, id)) {
                Ok(Some(mut record)) => {
                    record.status = p.status();
                    return Ok(Some((p, record)));
                }
                Ok(None) => continue,
                Err(StoreError::Json { path, source }) => {
                    warn!("registro ilegible {}: {}", path, source);
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    fn update_progress(&self, id: &str, record: &TaskRecord) -> Result<bool, StoreError> {
        if !is_safe_id(id) {
            return Ok(false);
        }
        let path = self.path(Partition::Processing, id);
        let bytes = encode(record, &path)?;
        let written = fsutil::overwrite_existing(&path, &bytes, &self.path(Partition::Failed, id))?;
        if !written {
            warn!("tarea {} ya no está en processing, avance descartado", id);
        }
        Ok(written)
    }
}
