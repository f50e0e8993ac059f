//! Configuración por variables de entorno, compartida por los tres binarios.

use std::{env, path::PathBuf, time::Duration};

use crate::render::{CommandRenderer, HttpUploader};

pub const DEFAULT_QUEUE_DIR: &str = "/app/queue";
pub const DEFAULT_TASK_META_DIR: &str = "/tmp/batch_task_meta";
pub const DEFAULT_PROCESSING_TIMEOUT_SECS: u64 = 3600;
pub const DEFAULT_RETENTION_DAYS: u64 = 3;
pub const DEFAULT_MAINTENANCE_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_RENDER_COMMAND: &str = "shotq-render";
pub const DEFAULT_MASTER_BIND: &str = "0.0.0.0:8080";
pub const DEFAULT_MASTER_URL: &str = "http://localhost:8080";

/// Espera del worker de cola cuando no hay tareas.
pub const QUEUE_POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Espera tras un error inesperado en el loop de cola.
pub const QUEUE_ERROR_BACKOFF: Duration = Duration::from_secs(5);
/// Espera entre pasadas del modo batch `--watch`.
pub const BATCH_WATCH_INTERVAL: Duration = Duration::from_secs(5);
pub const BATCH_ERROR_BACKOFF: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub queue_dir: PathBuf,
    pub task_meta_dir: PathBuf,
    pub processing_timeout: Duration,
    pub retention_days: u64,
    pub maintenance_interval: Duration,
    /// Replicar en el almacén de metadatos las tareas tomadas de la cola
    pub mirror_metadata: bool,
    pub render_command: String,
    pub upload_base_url: Option<String>,
    pub upload_public_url: Option<String>,
    pub upload_token: Option<String>,
    pub master_bind: String,
    pub master_url: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl Settings {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Igual que [`from_env`](Self::from_env) pero con una fuente arbitraria.
    /// Valores vacíos o que no parsean toman el valor por defecto.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let secs = |key: &str, default: u64| {
            get(key)
                .and_then(|s| s.trim().parse::<u64>().ok())
                .unwrap_or(default)
        };

        Self {
            queue_dir: get("QUEUE_DIR")
                .unwrap_or_else(|| DEFAULT_QUEUE_DIR.to_string())
                .into(),
            task_meta_dir: get("TASK_META_DIR")
                .unwrap_or_else(|| DEFAULT_TASK_META_DIR.to_string())
                .into(),
            processing_timeout: Duration::from_secs(secs(
                "PROCESSING_TIMEOUT_SECS",
                DEFAULT_PROCESSING_TIMEOUT_SECS,
            )),
            retention_days: secs("RETENTION_DAYS", DEFAULT_RETENTION_DAYS),
            maintenance_interval: Duration::from_secs(
                secs("MAINTENANCE_INTERVAL_SECS", DEFAULT_MAINTENANCE_INTERVAL_SECS).max(1),
            ),
            mirror_metadata: get("MIRROR_METADATA")
                .and_then(|s| parse_bool(&s))
                .unwrap_or(false),
            render_command: get("RENDER_COMMAND").unwrap_or_else(|| DEFAULT_RENDER_COMMAND.to_string()),
            upload_base_url: get("UPLOAD_BASE_URL"),
            upload_public_url: get("UPLOAD_PUBLIC_URL"),
            upload_token: get("UPLOAD_TOKEN"),
            master_bind: get("MASTER_BIND").unwrap_or_else(|| DEFAULT_MASTER_BIND.to_string()),
            master_url: get("MASTER_URL").unwrap_or_else(|| DEFAULT_MASTER_URL.to_string()),
        }
    }

    pub fn renderer(&self) -> Option<CommandRenderer> {
        CommandRenderer::from_command_line(&self.render_command)
    }

    /// `None` si no hay `UPLOAD_BASE_URL`: los ítems que pidan subida fallan.
    pub fn uploader(&self) -> Option<HttpUploader> {
        let base = self.upload_base_url.as_deref()?;
        Some(HttpUploader::new(
            base,
            self.upload_public_url.as_deref(),
            self.upload_token.clone(),
        ))
    }
}
