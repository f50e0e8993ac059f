use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use common::{
    api::{
        codes, HealthResponse, QueueStatsResponse, RetryFailedResponse, RetryResponse,
        SubmitResponse,
    },
    lookup::ProgressSummary,
    render::{finish_output, render_checked},
    task::new_task_id,
    ApiResponse, ItemFailure, NewTask, RenderItem, RenderOutput, RenderRequest, StoreError,
    TaskLookup, TaskStatus, ValidationError,
};
use serde::Serialize;
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/render", post(render_single))
        .route("/api/v1/tasks", post(submit_task))
        .route("/api/v1/batches", post(submit_batch))
        .route("/api/v1/tasks/:id", get(get_task))
        .route("/api/v1/tasks/:id/summary", get(get_task_summary))
        .route("/api/v1/tasks/:id/retry", post(retry_task))
        .route("/api/v1/queue/stats", get(queue_stats))
        .route("/api/v1/queue/retry-failed", post(retry_failed))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/* ---------------- errores HTTP ---------------- */

/// Error de un handler, ya convertido al sobre `{success: false, error}`.
#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl AppError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            code: codes::NOT_FOUND,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            code: codes::INVALID_REQUEST,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: codes::INTERNAL,
            message: message.into(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body: ApiResponse<Value> = ApiResponse::error(self.code, self.message);
        (self.status, Json(body)).into_response()
    }
}

impl From<ValidationError> for AppError {
    fn from(e: ValidationError) -> Self {
        AppError::bad_request(e.to_string())
    }
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        error!("error de almacenamiento: {}", e);
        AppError::internal(e.to_string())
    }
}

impl From<JsonRejection> for AppError {
    fn from(e: JsonRejection) -> Self {
        AppError::bad_request(format!("cuerpo JSON inválido: {}", e.body_text()))
    }
}

impl From<ItemFailure> for AppError {
    fn from(e: ItemFailure) -> Self {
        match e {
            ItemFailure::Validation(v) => v.into(),
            other => {
                warn!("render individual fallido: {}", other);
                AppError {
                    status: StatusCode::INTERNAL_SERVER_ERROR,
                    code: codes::RENDER_FAILED,
                    message: other.to_string(),
                }
            }
        }
    }
}

type ApiResult<T> = Result<Json<ApiResponse<T>>, AppError>;

fn ok<T: Serialize>(data: T, message: impl Into<String>) -> ApiResult<T> {
    Ok(Json(ApiResponse::ok(data, message)))
}

/* ---------------- handlers HTTP ---------------- */

async fn health() -> ApiResult<HealthResponse> {
    ok(
        HealthResponse {
            status: "ok".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
        "servicio operativo",
    )
}

enum Rendered {
    Inline(RenderOutput),
    Uploaded(common::ItemResult),
}

// Render individual y síncrono: bytes crudos o, si se pidió subida, la URL
async fn render_single(
    State(state): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Response, AppError> {
    let Json(body) = body?;
    let item = RenderItem::from_value(&body)?;
    let source = item.source()?;
    let options = item.options;
    options.validate()?;

    let renderer = state.renderer.clone();
    let uploader = state.uploader.clone();
    let rendered = tokio::task::spawn_blocking(move || -> Result<Rendered, ItemFailure> {
        let output = render_checked(renderer.as_ref(), &source, &options)?;
        if options.wants_upload() {
            let result = finish_output(uploader.as_deref(), "render".to_string(), output, &options)?;
            return Ok(Rendered::Uploaded(result));
        }
        Ok(Rendered::Inline(output))
    })
    .await
    .map_err(|e| AppError::internal(format!("render interrumpido: {e}")))??;

    match rendered {
        Rendered::Inline(output) => {
            info!("render individual: {} bytes {}", output.bytes.len(), output.format.as_str());
            Ok(([(header::CONTENT_TYPE, output.format.content_type())], output.bytes).into_response())
        }
        Rendered::Uploaded(result) => {
            let message = result.message.clone().unwrap_or_default();
            let data = json!({
                "type": result.format,
                "ossUrl": result.oss_url,
                "size": result.size,
            });
            Ok(Json(ApiResponse::ok(data, message)).into_response())
        }
    }
}

fn validated_request(body: Result<Json<Value>, JsonRejection>) -> Result<(Value, usize), AppError> {
    let Json(body) = body?;
    let request = RenderRequest::from_value(&body)?;
    request.validate()?;
    Ok((body, request.item_count()))
}

// Encola una tarea por lotes para los workers de cola
async fn submit_task(
    State(state): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<(StatusCode, Json<ApiResponse<SubmitResponse>>), AppError> {
    let (body, total_items) = validated_request(body)?;
    let task_id = state.queue.push(body)?;

    info!("tarea {} encolada con {} ítems", task_id, total_items);
    Ok((
        StatusCode::ACCEPTED,
        Json(ApiResponse::ok(
            SubmitResponse {
                task_id,
                status: TaskStatus::Pending,
                total_items,
            },
            "tarea encolada",
        )),
    ))
}

// Guarda una tarea pendiente en el almacén de metadatos (modo batch)
async fn submit_batch(
    State(state): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<(StatusCode, Json<ApiResponse<SubmitResponse>>), AppError> {
    let (body, total_items) = validated_request(body)?;
    let task_id = new_task_id();

    let mut task = NewTask::pending(body);
    task.total_items = Some(total_items);
    state.meta.save_task(&task_id, task)?;

    info!("lote {} registrado con {} ítems", task_id, total_items);
    Ok((
        StatusCode::ACCEPTED,
        Json(ApiResponse::ok(
            SubmitResponse {
                task_id,
                status: TaskStatus::Pending,
                total_items,
            },
            "lote registrado",
        )),
    ))
}

async fn get_task(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<TaskLookup> {
    match common::locate_task(state.queue.as_ref(), Some(state.meta.as_ref()), &id)? {
        Some(found) => ok(found, "tarea encontrada"),
        None => Err(AppError::not_found(format!("tarea {id} no encontrada"))),
    }
}

async fn get_task_summary(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<ProgressSummary> {
    match common::summarize_task(state.queue.as_ref(), Some(state.meta.as_ref()), &id)? {
        Some(summary) => ok(summary, "resumen de la tarea"),
        None => Err(AppError::not_found(format!("tarea {id} no encontrada"))),
    }
}

async fn retry_task(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<RetryResponse> {
    if !state.queue.retry(&id)? {
        return Err(AppError::not_found(format!("tarea {id} no está en failed")));
    }
    ok(
        RetryResponse {
            task_id: id,
            status: TaskStatus::Pending,
        },
        "tarea devuelta a pending",
    )
}

async fn queue_stats(State(state): State<AppState>) -> ApiResult<QueueStatsResponse> {
    let stats = state.queue.stats()?;
    let timeout_tasks = state.queue.timeout_task_count()?;
    ok(QueueStatsResponse { stats, timeout_tasks }, "estadísticas de la cola")
}

async fn retry_failed(State(state): State<AppState>) -> ApiResult<RetryFailedResponse> {
    let retried = state.queue.retry_all_failed()?;
    ok(RetryFailedResponse { retried }, format!("{retried} tareas devueltas a pending"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request};
    use common::{
        OutputFormat, QueueStore, RenderError, RenderOptions, RenderSource, Renderer,
        TaskMetadataStore, TaskQueue,
    };
    use std::{env, fs, path::PathBuf, sync::Arc, time::Duration};
    use tower::ServiceExt;

    struct FixedRenderer;

    impl Renderer for FixedRenderer {
        fn render(&self, source: &RenderSource, options: &RenderOptions) -> Result<RenderOutput, RenderError> {
            if source.content().contains("fail") {
                return Err(RenderError::Other("motor caído".into()));
            }
            Ok(RenderOutput {
                format: options.output_format(),
                bytes: vec![1u8; 256],
            })
        }
    }

    fn temp_dir(sub: &str) -> PathBuf {
        let base = env::temp_dir().join("master_tests").join(sub);
        let _ = fs::remove_dir_all(&base);
        fs::create_dir_all(&base).unwrap();
        base
    }

    fn state(sub: &str) -> (AppState, Arc<QueueStore>) {
        let base = temp_dir(sub);
        let queue = Arc::new(QueueStore::open(base.join("cola"), Duration::from_secs(3600)).unwrap());
        let state = AppState {
            queue: queue.clone(),
            meta: Arc::new(TaskMetadataStore::open(base.join("meta")).unwrap()),
            renderer: Arc::new(FixedRenderer),
            uploader: None,
            retention_days: 3,
        };
        (state, queue)
    }

    async fn call(app: Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Vec<u8>) {
        let mut req = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(v) => {
                req = req.header(header::CONTENT_TYPE, "application/json");
                Body::from(v.to_string())
            }
            None => Body::empty(),
        };
        let resp = app.oneshot(req.body(body).unwrap()).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        (status, bytes.to_vec())
    }

    async fn call_json(app: Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let (status, bytes) = call(app, method, uri, body).await;
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn health_responde_con_el_sobre() {
        let (state, _) = state("health");
        let (status, body) = call_json(build_router(state), "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], json!(true));
        assert_eq!(body["data"]["status"], json!("ok"));
    }

    #[tokio::test]
    async fn submit_task_encola_y_se_puede_consultar() {
        let (state, queue) = state("submit");
        let app = build_router(state);

        let (status, body) = call_json(
            app.clone(),
            "POST",
            "/api/v1/tasks",
            Some(json!({"urls": ["https://a", "https://b"], "format": "pdf"})),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["data"]["status"], json!("pending"));
        assert_eq!(body["data"]["totalItems"], json!(2));
        let id = body["data"]["taskId"].as_str().unwrap().to_string();
        assert_eq!(queue.stats().unwrap().pending, 1);

        let (status, body) = call_json(app, "GET", &format!("/api/v1/tasks/{id}"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["source"], json!("queue"));
        assert_eq!(body["data"]["status"], json!("pending"));
        assert_eq!(body["data"]["record"]["data"]["format"], json!("pdf"));
    }

    #[tokio::test]
    async fn submit_sin_items_o_con_opciones_invalidas_es_400() {
        let (state, queue) = state("submit_400");
        let app = build_router(state);

        for payload in [
            json!({"url": "https://solo-top-level"}),
            json!({"urls": ["https://a"], "format": "gif"}),
            json!({"urls": ["https://a"], "windowSize": {"width": 0, "height": 10}}),
        ] {
            let (status, body) = call_json(app.clone(), "POST", "/api/v1/tasks", Some(payload)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(body["success"], json!(false));
            assert_eq!(body["error"]["code"], json!("INVALID_REQUEST"));
        }
        assert_eq!(queue.stats().unwrap().pending, 0);
    }

    #[tokio::test]
    async fn json_mal_formado_es_400_con_sobre() {
        let (state, _) = state("json_roto");
        let req = Request::builder()
            .method("POST")
            .uri("/api/v1/tasks")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{nope"))
            .unwrap();
        let resp = build_router(state).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn submit_batch_guarda_en_metadatos() {
        let (state, queue) = state("batch");
        let meta = state.meta.clone();
        let app = build_router(state);

        let (status, body) = call_json(
            app.clone(),
            "POST",
            "/api/v1/batches",
            Some(json!({"htmls": ["<p>x</p>"]})),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let id = body["data"]["taskId"].as_str().unwrap().to_string();

        let rec = meta.get_task(&id).unwrap().unwrap();
        assert_eq!(rec.status, TaskStatus::Pending);
        assert_eq!(rec.total_items, Some(1));
        assert_eq!(queue.stats().unwrap().pending, 0);

        let (status, body) = call_json(app, "GET", &format!("/api/v1/tasks/{id}/summary"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["source"], json!("metadata"));
        assert_eq!(body["data"]["totalItems"], json!(1));
    }

    #[tokio::test]
    async fn tarea_inexistente_es_404() {
        let (state, _) = state("404");
        let app = build_router(state);

        let (status, body) = call_json(app.clone(), "GET", "/api/v1/tasks/task_nada", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["code"], json!("NOT_FOUND"));
        assert!(body["data"].is_null());

        let (status, _) = call_json(app, "GET", "/api/v1/tasks/..%2Fetc/summary", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn retry_y_retry_failed_devuelven_a_pending() {
        let (state, queue) = state("retry");
        let app = build_router(state);

        let a = queue.push(json!({"urls": ["https://a"]})).unwrap();
        queue.pop().unwrap();
        queue.fail(&a, "motor caído").unwrap();
        let b = queue.push(json!({"urls": ["https://b"]})).unwrap();
        queue.pop().unwrap();
        queue.fail(&b, "motor caído").unwrap();

        let (status, body) = call_json(app.clone(), "POST", &format!("/api/v1/tasks/{a}/retry"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["status"], json!("pending"));

        let (status, _) = call_json(app.clone(), "POST", &format!("/api/v1/tasks/{a}/retry"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (_, body) = call_json(app.clone(), "POST", "/api/v1/queue/retry-failed", None).await;
        assert_eq!(body["data"]["retried"], json!(1));

        let (_, body) = call_json(app, "GET", "/api/v1/queue/stats", None).await;
        assert_eq!(body["data"]["pending"], json!(2));
        assert_eq!(body["data"]["failed"], json!(0));
        assert_eq!(body["data"]["timeoutTasks"], json!(0));
    }

    #[tokio::test]
    async fn render_individual_devuelve_bytes_con_content_type() {
        let (state, _) = state("render");
        let app = build_router(state);

        let req = Request::builder()
            .method("POST")
            .uri("/api/v1/render")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json!({"url": "https://a", "format": "pdf"}).to_string()))
            .unwrap();
        let resp = app.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE],
            OutputFormat::Pdf.content_type()
        );
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(bytes.len(), 256);

        let (status, body) = call_json(app.clone(), "POST", "/api/v1/render", Some(json!({"format": "png"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["message"], json!("se debe indicar url o html"));

        let (status, body) = call_json(app, "POST", "/api/v1/render", Some(json!({"url": "https://fail"}))).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"]["code"], json!("RENDER_FAILED"));
    }

    #[tokio::test]
    async fn render_con_subida_sin_almacenamiento_falla() {
        let (state, _) = state("render_subida");
        let (status, body) = call_json(
            build_router(state),
            "POST",
            "/api/v1/render",
            Some(json!({"html": "<p>x</p>", "uploadToOSS": true})),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"]["code"], json!("RENDER_FAILED"));
    }
}
