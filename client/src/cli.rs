use std::{path::PathBuf, time::Duration};

use anyhow::{bail, Context, Result};
use base64::Engine as _;
use clap::{Parser, Subcommand};
use common::{
    api::RawResponse, config::DEFAULT_MASTER_URL, QueueStore, Settings, TaskMetadataStore,
    TaskQueue,
};
use reqwest::Client;
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "shotq")]
#[command(about = "CLI para enviar capturas al master y mantener la cola")]
struct Cli {
    /// URL base del master
    #[arg(long, env = "MASTER_URL", default_value = DEFAULT_MASTER_URL)]
    master: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Envía una tarea por lotes
    Submit {
        #[arg(long = "url", value_name = "URL")]
        urls: Vec<String>,
        /// Archivo HTML a renderizar (se puede repetir)
        #[arg(long = "html-file", value_name = "ARCHIVO")]
        html_files: Vec<PathBuf>,
        /// Cuerpo JSON completo; ignora --url y --html-file
        #[arg(long, value_name = "ARCHIVO")]
        json: Option<PathBuf>,
        #[arg(long, default_value = "png")]
        format: String,
        #[arg(long)]
        full_page: bool,
        /// Guardar en el almacén de metadatos en vez de la cola
        #[arg(long)]
        batch: bool,
    },
    /// Consulta una tarea
    Status {
        #[arg(value_name = "TASK_ID")]
        id: String,
        /// Espera a que termine, mostrando el avance
        #[arg(long)]
        wait: bool,
    },
    /// Guarda en disco los resultados en base64 de una tarea terminada
    Results {
        #[arg(value_name = "TASK_ID")]
        id: String,
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
    },
    /// Render individual: guarda el PNG/PDF en --output
    Render {
        #[arg(long, conflicts_with = "html_file")]
        url: Option<String>,
        #[arg(long)]
        html_file: Option<PathBuf>,
        #[arg(long, default_value = "png")]
        format: String,
        #[arg(long)]
        output: PathBuf,
    },
    /// Devuelve a pending una tarea fallida
    Retry {
        #[arg(value_name = "TASK_ID")]
        id: String,
    },
    /// Devuelve a pending todas las tareas fallidas
    RetryFailed,
    /// Estadísticas de la cola
    Stats,
    /// Mantenimiento local sobre el directorio de la cola (sin pasar por el master)
    Maintain {
        /// Además de informar, reintenta todas las fallidas
        #[arg(long)]
        retry_failed: bool,
    },
    /// Purga local de registros viejos y metadatos vencidos
    Cleanup {
        /// Días de retención (por defecto RETENTION_DAYS)
        #[arg(long)]
        days: Option<u64>,
    },
}

/// Lee el sobre del master; un `success: false` se vuelve error.
async fn envelope(resp: reqwest::Response) -> Result<Value> {
    let status = resp.status();
    let body: RawResponse = resp
        .json()
        .await
        .with_context(|| format!("respuesta no JSON del master (HTTP {status})"))?;
    if !body.success {
        let (code, message) = body
            .error
            .map(|e| (e.code, e.message))
            .unwrap_or_else(|| ("UNKNOWN".to_string(), "sin detalle".to_string()));
        bail!("{code}: {message} (HTTP {status})");
    }
    Ok(body.data.unwrap_or(Value::Null))
}

fn build_request(urls: Vec<String>, htmls: Vec<String>, format: &str, full_page: bool) -> Value {
    let mut body = json!({ "format": format });
    if !urls.is_empty() {
        body["urls"] = json!(urls);
    }
    if !htmls.is_empty() {
        body["htmls"] = json!(htmls);
    }
    if full_page {
        body["fullPage"] = json!(true);
    }
    body
}

/// (nombre de archivo, bytes) por cada resultado con datos en línea.
fn decode_results(record: &Value) -> Result<Vec<(String, Vec<u8>)>> {
    let mut out = Vec::new();
    let Some(results) = record.get("results").and_then(Value::as_array) else {
        return Ok(out);
    };
    for r in results {
        let (Some(identifier), Some(data)) = (
            r.get("identifier").and_then(Value::as_str),
            r.get("data").and_then(Value::as_str),
        ) else {
            continue;
        };
        let ext = r.get("type").and_then(Value::as_str).unwrap_or("bin");
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(data)
            .with_context(|| format!("base64 inválido en {identifier}"))?;
        out.push((format!("{identifier}.{ext}"), bytes));
    }
    Ok(out)
}

fn print_progress(data: &Value) {
    println!(
        "  estado: {}  avance: {}/{} ({} con error)",
        data["status"].as_str().unwrap_or("?"),
        data["completedItems"].as_u64().unwrap_or(0) + data["failedItems"].as_u64().unwrap_or(0),
        data["totalItems"].as_u64().unwrap_or(0),
        data["failedItems"].as_u64().unwrap_or(0),
    );
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let client = Client::new();
    let base_url = cli.master.trim_end_matches('/').to_string();

    match cli.command {
        Commands::Submit {
            urls,
            html_files,
            json,
            format,
            full_page,
            batch,
        } => {
            let body = match json {
                Some(path) => {
                    let raw = tokio::fs::read_to_string(&path)
                        .await
                        .with_context(|| format!("no se pudo leer {}", path.display()))?;
                    serde_json::from_str(&raw).context("el archivo no es JSON válido")?
                }
                None => {
                    let mut htmls = Vec::new();
                    for path in &html_files {
                        htmls.push(
                            tokio::fs::read_to_string(path)
                                .await
                                .with_context(|| format!("no se pudo leer {}", path.display()))?,
                        );
                    }
                    build_request(urls, htmls, &format, full_page)
                }
            };

            let endpoint = if batch { "batches" } else { "tasks" };
            let url = format!("{}/api/v1/{}", base_url, endpoint);
            let data = envelope(client.post(&url).json(&body).send().await?).await?;

            println!("Tarea creada:");
            println!("  id: {}", data["taskId"].as_str().unwrap_or("?"));
            println!("  ítems: {}", data["totalItems"]);
        }
        Commands::Status { id, wait } => {
            let url = format!("{}/api/v1/tasks/{id}/summary", base_url);
            loop {
                let data = envelope(client.get(&url).send().await?).await?;
                println!("Tarea {id} ({}):", data["source"].as_str().unwrap_or("?"));
                print_progress(&data);

                let terminal = matches!(data["status"].as_str(), Some("done" | "failed"));
                if terminal {
                    if let Some(err) = data["error"].as_str() {
                        println!("  error: {err}");
                    }
                    break;
                }
                if !wait {
                    break;
                }
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }
        Commands::Results { id, out_dir } => {
            let url = format!("{}/api/v1/tasks/{id}", base_url);
            let data = envelope(client.get(&url).send().await?).await?;
            let files = decode_results(&data["record"])?;
            if files.is_empty() {
                println!("La tarea {id} no tiene resultados en línea");
            }
            tokio::fs::create_dir_all(&out_dir).await?;
            for (name, bytes) in files {
                let path = out_dir.join(&name);
                tokio::fs::write(&path, &bytes).await?;
                println!("  {} ({} bytes)", path.display(), bytes.len());
            }
        }
        Commands::Render {
            url,
            html_file,
            format,
            output,
        } => {
            let mut body = json!({ "format": format });
            match (url, html_file) {
                (Some(u), _) => body["url"] = json!(u),
                (None, Some(path)) => body["html"] = json!(tokio::fs::read_to_string(&path).await?),
                (None, None) => bail!("hace falta --url o --html-file"),
            }

            let resp = client
                .post(format!("{}/api/v1/render", base_url))
                .json(&body)
                .send()
                .await?;
            let is_json = resp
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v.starts_with("application/json"));
            if is_json {
                envelope(resp).await?;
                bail!("el master respondió JSON en lugar del archivo");
            }
            let bytes = resp.bytes().await?;
            tokio::fs::write(&output, &bytes).await?;
            println!("Guardado {} ({} bytes)", output.display(), bytes.len());
        }
        Commands::Retry { id } => {
            let url = format!("{}/api/v1/tasks/{id}/retry", base_url);
            envelope(client.post(&url).send().await?).await?;
            println!("Tarea {id} devuelta a pending");
        }
        Commands::RetryFailed => {
            let url = format!("{}/api/v1/queue/retry-failed", base_url);
            let data = envelope(client.post(&url).send().await?).await?;
            println!("{} tareas devueltas a pending", data["retried"]);
        }
        Commands::Stats => {
            let url = format!("{}/api/v1/queue/stats", base_url);
            let data = envelope(client.get(&url).send().await?).await?;
            println!("Cola:");
            for key in ["pending", "processing", "done", "failed", "timeoutTasks"] {
                println!("  {key}: {}", data[key]);
            }
        }
        Commands::Maintain { retry_failed } => {
            let settings = Settings::from_env();
            let queue = QueueStore::open(&settings.queue_dir, settings.processing_timeout)?;

            println!("Tareas vencidas en processing: {}", queue.timeout_task_count()?);
            if retry_failed {
                println!("Fallidas devueltas a pending: {}", queue.retry_all_failed()?);
            }
            let stats = queue.stats()?;
            println!(
                "pending: {}  processing: {}  done: {}  failed: {}",
                stats.pending, stats.processing, stats.done, stats.failed
            );
        }
        Commands::Cleanup { days } => {
            let settings = Settings::from_env();
            let queue = QueueStore::open(&settings.queue_dir, settings.processing_timeout)?;
            let meta = TaskMetadataStore::open(&settings.task_meta_dir)?;

            let days = days.unwrap_or(settings.retention_days);
            println!("Registros de más de {days} días borrados: {}", queue.cleanup(days)?);
            println!("Metadatos vencidos borrados: {}", meta.cleanup_expired_tasks()?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_request_omite_lo_que_no_se_pidio() {
        let body = build_request(vec!["https://a".into()], vec![], "pdf", false);
        assert_eq!(body, json!({"format": "pdf", "urls": ["https://a"]}));

        let body = build_request(vec![], vec!["<p>x</p>".into()], "png", true);
        assert_eq!(body["htmls"][0], json!("<p>x</p>"));
        assert_eq!(body["fullPage"], json!(true));
    }

    #[test]
    fn decode_results_usa_identificador_y_tipo() {
        let record = json!({
            "results": [
                {"identifier": "url_0", "type": "png", "data": "aG9sYQ==", "size": 4},
                {"identifier": "url_1", "type": "pdf", "ossUrl": "https://bucket/x.pdf"},
            ]
        });
        let files = decode_results(&record).unwrap();
        assert_eq!(files, vec![("url_0.png".to_string(), b"hola".to_vec())]);

        assert!(decode_results(&json!({})).unwrap().is_empty());
        assert!(decode_results(&json!({"results": [{"identifier": "x", "data": "%%%"}]})).is_err());
    }

    #[test]
    fn cli_parsea_subcomandos() {
        let cli = Cli::try_parse_from(["shotq", "--master", "http://m:1", "status", "task_1", "--wait"]).unwrap();
        assert_eq!(cli.master, "http://m:1");
        assert!(matches!(cli.command, Commands::Status { wait: true, .. }));

        let cli = Cli::try_parse_from(["shotq", "submit", "--url", "https://a", "--url", "https://b", "--batch"])
            .unwrap();
        match cli.command {
            Commands::Submit { urls, batch, .. } => {
                assert_eq!(urls.len(), 2);
                assert!(batch);
            }
            _ => panic!("subcomando inesperado"),
        }
    }
}
