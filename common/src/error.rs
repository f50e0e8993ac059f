use std::io;

use thiserror::Error;

/// Errores de los almacenes en disco (cola y metadatos).
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("error de E/S en {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("JSON inválido en {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub(crate) fn io(path: impl AsRef<std::path::Path>, source: io::Error) -> Self {
        StoreError::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }

    pub(crate) fn json(path: impl AsRef<std::path::Path>, source: serde_json::Error) -> Self {
        StoreError::Json {
            path: path.as_ref().display().to_string(),
            source,
        }
    }
}

/// Parámetros de render inválidos; se reportan al llamador y nunca se reintentan.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("se debe indicar url o html")]
    MissingSource,
    #[error("windowSize: width y height deben ser enteros positivos")]
    WindowSize,
    #[error("{0} no puede estar vacío")]
    Empty(&'static str),
    #[error("format sólo admite png/pdf")]
    Format,
    #[error("la petición no trae urls, htmls ni items")]
    NoItems,
    #[error("payload inválido: {0}")]
    Malformed(String),
}

/// Fallo del motor de render externo.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("no se pudo lanzar el motor de render {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("el motor de render terminó con código {code:?}: {stderr}")]
    Engine { code: Option<i32>, stderr: String },
    #[error("{format} generado demasiado pequeño ({size} bytes), probablemente corrupto")]
    TooSmall { format: String, size: usize },
    #[error("render fallido: {0}")]
    Other(String),
}

/// Fallo al subir el resultado al almacenamiento de objetos.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("almacenamiento de objetos no configurado")]
    NotConfigured,
    #[error("error HTTP subiendo {object}: {source}")]
    Http {
        object: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("el almacenamiento respondió {status} para {object}")]
    Status { object: String, status: u16 },
}

/// Fallo de un ítem individual dentro de un lote.
#[derive(Debug, Error)]
pub enum ItemFailure {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error("error al subir al almacenamiento: {0}")]
    Upload(#[from] UploadError),
}

/// Fallo a nivel de tarea: aborta todos los ítems restantes.
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("payload vacío: no hay urls, htmls ni items que renderizar")]
    EmptyPayload,
    #[error(transparent)]
    Payload(#[from] ValidationError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("la tarea {0} desapareció durante el procesamiento")]
    Vanished(String),
}
