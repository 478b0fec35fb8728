//! HTTP binding.
//!
//! `GET /tools` lists descriptors; `POST /tools/{name}` runs a tool with a
//! JSON object body, or a multipart body for binary-input tools.

use std::future::Future;
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, FromRequest, Multipart, Path, Request, State};
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use registry::{Arguments, ErrorKind, Payload, Registry, ToolDescriptor, ToolOutcome};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

/// Maximum request body size (50MB), sized for audio uploads.
pub const MAX_BODY_SIZE: usize = 50 * 1024 * 1024;

type SharedRegistry = Arc<Registry>;

/// Error response: `{detail, kind}` with a matching status.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    kind: ErrorKind,
    detail: String,
}

impl ApiError {
    fn new(status: StatusCode, kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            detail: detail.into(),
        }
    }

    fn bad_request(detail: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, ErrorKind::Validation, detail)
    }
}

impl From<registry::Error> for ApiError {
    fn from(e: registry::Error) -> Self {
        match e {
            registry::Error::UnknownTool(_) => {
                Self::new(StatusCode::NOT_FOUND, ErrorKind::UnknownTool, e.to_string())
            }
            registry::Error::Validation(_) => Self::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                ErrorKind::Validation,
                e.to_string(),
            ),
            other => Self::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorKind::Execution,
                other.to_string(),
            ),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({"detail": self.detail, "kind": self.kind});
        (self.status, Json(body)).into_response()
    }
}

/// Build the router for `registry`.
pub fn router(registry: SharedRegistry) -> Router {
    Router::new()
        .route("/tools", get(list_tools))
        .route("/tools/{name}", post(call_tool))
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .with_state(registry)
}

/// Serve until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    registry: SharedRegistry,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    info!(addr = %listener.local_addr()?, tools = registry.len(), "serving tools over HTTP");
    axum::serve(listener, router(registry))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn list_tools(State(registry): State<SharedRegistry>) -> Json<Vec<ToolDescriptor>> {
    Json(registry.list())
}

async fn call_tool(
    State(registry): State<SharedRegistry>,
    Path(name): Path<String>,
    request: Request,
) -> Result<Json<Payload>, ApiError> {
    let descriptor = registry
        .get(&name)
        .ok_or_else(|| registry::Error::UnknownTool(name.clone()))?;

    let is_multipart = request
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("multipart/form-data"));

    let arguments = if is_multipart {
        let multipart = Multipart::from_request(request, &())
            .await
            .map_err(|e| ApiError::bad_request(e.body_text()))?;
        read_multipart(descriptor, multipart).await?
    } else {
        let Json(arguments) = Json::<Arguments>::from_request(request, &())
            .await
            .map_err(|e| ApiError::bad_request(e.body_text()))?;
        arguments
    };

    debug!(tool = %name, multipart = is_multipart, "tool call");
    match registry.execute(&name, arguments).await? {
        ToolOutcome::Ok { payload } => Ok(Json(payload)),
        ToolOutcome::Error { kind, message } => {
            warn!(tool = %name, %kind, "tool call failed");
            Err(ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, kind, message))
        }
    }
}

/// File parts become base64 strings; text parts are coerced to the declared type.
async fn read_multipart(tool: &ToolDescriptor, mut multipart: Multipart) -> Result<Arguments, ApiError> {
    let mut arguments = Arguments::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("failed to read multipart field: {e}")))?
    {
        let Some(name) = field.name().map(String::from) else {
            continue;
        };

        let value = if field.file_name().is_some() || tool.parameter_schema.is_binary(&name) {
            let bytes = field
                .bytes()
                .await
                .map_err(|e| ApiError::bad_request(format!("failed to read `{name}`: {e}")))?;
            Value::String(STANDARD.encode(&bytes))
        } else {
            let text = field
                .text()
                .await
                .map_err(|e| ApiError::bad_request(format!("failed to read `{name}`: {e}")))?;
            coerce(tool, &name, text)
        };

        arguments.insert(name, value);
    }

    Ok(arguments)
}

fn coerce(tool: &ToolDescriptor, field: &str, text: String) -> Value {
    let Some(kind) = tool
        .parameter_schema
        .properties
        .get(field)
        .and_then(|p| p.kind.as_ref())
    else {
        return Value::String(text);
    };
    match serde_json::from_str::<Value>(&text) {
        Ok(parsed) if !parsed.is_string() && kind.matches(&parsed) => parsed,
        _ => Value::String(text),
    }
}
