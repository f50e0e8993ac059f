//! Motor de render externo y subida de resultados.
//!
//! Ambos contratos son síncronos; los binarios los llaman dentro de
//! `spawn_blocking`.

use std::{
    io::Write,
    process::{Command, Stdio},
    thread,
    time::Duration,
};

use base64::Engine as _;
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{ItemFailure, RenderError, UploadError};
use crate::job::{OutputFormat, RenderOptions, RenderSource};
use crate::results::ItemResult;

/// Por debajo de esto el motor casi seguro devolvió un archivo roto.
pub const MIN_OUTPUT_BYTES: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderOutput {
    pub format: OutputFormat,
    pub bytes: Vec<u8>,
}

pub trait Renderer: Send + Sync {
    fn render(&self, source: &RenderSource, options: &RenderOptions) -> Result<RenderOutput, RenderError>;
}

pub trait Uploader: Send + Sync {
    /// Sube `bytes` como `object_name` y devuelve la URL pública.
    fn upload(&self, bytes: &[u8], content_type: &str, object_name: &str) -> Result<String, UploadError>;
}

/// Lo que recibe el motor por stdin.
#[derive(Serialize)]
struct EngineRequest<'a> {
    kind: &'a str,
    content: &'a str,
    format: OutputFormat,
    options: &'a RenderOptions,
}

/// Renderer que delega en un programa externo (navegador headless envuelto).
///
/// El programa recibe un JSON `{kind, content, format, options}` por stdin
/// y escribe los bytes PNG/PDF en stdout.
#[derive(Debug, Clone)]
pub struct CommandRenderer {
    program: String,
    args: Vec<String>,
}

impl CommandRenderer {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// "node render.js --flag" → programa + argumentos.
    pub fn from_command_line(line: &str) -> Option<Self> {
        let mut parts = line.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self::new(program, parts.collect()))
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

impl Renderer for CommandRenderer {
    fn render(&self, source: &RenderSource, options: &RenderOptions) -> Result<RenderOutput, RenderError> {
        let format = options.output_format();
        let payload = serde_json::to_vec(&EngineRequest {
            kind: source.kind(),
            content: source.content(),
            format,
            options,
        })
        .map_err(|e| RenderError::Other(e.to_string()))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| RenderError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        // stdin se escribe en paralelo: si el motor llena stdout antes de
        // terminar de leer, ninguno de los dos se bloquea
        let stdin = child.stdin.take();
        let output = thread::scope(|s| {
            if let Some(mut stdin) = stdin {
                s.spawn(move || {
                    if let Err(e) = stdin.write_all(&payload) {
                        warn!("no se pudo escribir al motor de render: {}", e);
                    }
                });
            }
            child.wait_with_output()
        })
        .map_err(|e| RenderError::Other(e.to_string()))?;

        if !output.status.success() {
            return Err(RenderError::Engine {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        debug!("{} generado: {} bytes ({})", format.as_str(), output.stdout.len(), source.kind());
        Ok(RenderOutput {
            format,
            bytes: output.stdout,
        })
    }
}

/// Sube por HTTP PUT a un almacenamiento compatible (`{base}/{objeto}`).
#[derive(Debug, Clone)]
pub struct HttpUploader {
    client: reqwest::blocking::Client,
    base_url: String,
    public_url: String,
    token: Option<String>,
}

impl HttpUploader {
    pub fn new(base_url: &str, public_url: Option<&str>, token: Option<String>) -> Self {
        let base_url = base_url.trim_end_matches('/').to_string();
        let public_url = public_url
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| base_url.clone());
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_else(|_| reqwest::blocking::Client::new());
        Self {
            client,
            base_url,
            public_url,
            token,
        }
    }
}

impl Uploader for HttpUploader {
    fn upload(&self, bytes: &[u8], content_type: &str, object_name: &str) -> Result<String, UploadError> {
        let object = object_name.trim_start_matches('/');
        let mut req = self
            .client
            .put(format!("{}/{}", self.base_url, object))
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(bytes.to_vec());
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        let resp = req.send().map_err(|source| UploadError::Http {
            object: object.to_string(),
            source,
        })?;
        if !resp.status().is_success() {
            return Err(UploadError::Status {
                object: object.to_string(),
                status: resp.status().as_u16(),
            });
        }

        Ok(format!("{}/{}", self.public_url, object))
    }
}

/// `screenshots/AAAA/MM/DD/<uuid>.<ext>`
pub fn default_object_name(format: OutputFormat) -> String {
    format!(
        "screenshots/{}/{}.{}",
        Utc::now().format("%Y/%m/%d"),
        uuid::Uuid::new_v4().simple(),
        format.as_str()
    )
}

pub fn check_output_size(output: &RenderOutput) -> Result<(), RenderError> {
    if output.bytes.len() < MIN_OUTPUT_BYTES {
        return Err(RenderError::TooSmall {
            format: output.format.as_str().to_uppercase(),
            size: output.bytes.len(),
        });
    }
    Ok(())
}

/// Render + validación de tamaño, sin subida. Lo usa el render individual.
pub fn render_checked(
    renderer: &dyn Renderer,
    source: &RenderSource,
    options: &RenderOptions,
) -> Result<RenderOutput, ItemFailure> {
    options.validate()?;
    let output = renderer.render(source, options)?;
    check_output_size(&output)?;
    Ok(output)
}

/// Sube el resultado si las opciones lo piden; si no, lo deja en base64.
pub fn finish_output(
    uploader: Option<&dyn Uploader>,
    identifier: String,
    output: RenderOutput,
    options: &RenderOptions,
) -> Result<ItemResult, ItemFailure> {
    let size = output.bytes.len();

    if options.wants_upload() {
        let uploader = uploader.ok_or(UploadError::NotConfigured)?;
        let object = options
            .oss_object_name
            .clone()
            .unwrap_or_else(|| default_object_name(output.format));
        let url = uploader.upload(&output.bytes, output.format.content_type(), &object)?;
        return Ok(ItemResult {
            identifier,
            format: output.format,
            data: None,
            size: Some(size),
            oss_url: Some(url),
            message: Some(format!("{} generado y subido al almacenamiento", output.format.as_str().to_uppercase())),
        });
    }

    Ok(ItemResult {
        identifier,
        format: output.format,
        data: Some(base64::engine::general_purpose::STANDARD.encode(&output.bytes)),
        size: Some(size),
        oss_url: None,
        message: None,
    })
}

/// Pipeline completo de un ítem: validar, renderizar, comprobar y entregar.
pub fn render_one(
    renderer: &dyn Renderer,
    uploader: Option<&dyn Uploader>,
    identifier: String,
    source: &RenderSource,
    options: &RenderOptions,
) -> Result<ItemResult, ItemFailure> {
    let output = render_checked(renderer, source, options)?;
    finish_output(uploader, identifier, output, options)
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Renderer falso: devuelve `size` bytes, o falla si el contenido
    /// contiene "fail".
    pub struct FakeRenderer {
        pub size: usize,
        pub calls: Mutex<Vec<String>>,
    }

    impl FakeRenderer {
        pub fn new() -> Self {
            Self {
                size: 512,
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl Renderer for FakeRenderer {
        fn render(&self, source: &RenderSource, options: &RenderOptions) -> Result<RenderOutput, RenderError> {
            self.calls.lock().unwrap().push(source.content().to_string());
            if source.content().contains("fail") {
                return Err(RenderError::Other("navegador caído".into()));
            }
            Ok(RenderOutput {
                format: options.output_format(),
                bytes: vec![7u8; self.size],
            })
        }
    }

    #[derive(Default)]
    pub struct FakeUploader {
        pub uploads: Mutex<Vec<(String, String, usize)>>,
    }

    impl Uploader for FakeUploader {
        fn upload(&self, bytes: &[u8], content_type: &str, object_name: &str) -> Result<String, UploadError> {
            self.uploads
                .lock()
                .unwrap()
                .push((object_name.to_string(), content_type.to_string(), bytes.len()));
            Ok(format!("https://bucket.local/{object_name}"))
        }
    }
}
