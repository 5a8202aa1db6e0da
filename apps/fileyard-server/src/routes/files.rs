//! File routes
//!
//! HTTP adapter over the upload coordinator.
//!
//! Endpoints:
//! - POST /api/v1/files/upload - Single-shot upload, one chunk, or hash probe (multipart)
//! - GET /api/v1/files/:id - Download a stored file
//! - GET /api/v1/files/download - Download by storage-relative path
//! - GET /api/v1/files/folders - List storage folders
//! - GET /api/v1/files/folders/files - List files in one folder

use std::path::PathBuf;

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::{header, StatusCode},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use crate::error::{AppError, Result};
use crate::state::AppState;
use crate::upload::{ByteSource, DownloadRequest, DownloadResult, UploadFolder, UploadRequest, UploadResult};

// ============================================================================
// Router
// ============================================================================

/// Create the files router
pub fn router(max_request_bytes: usize) -> Router<AppState> {
    Router::new()
        .route("/upload", post(upload))
        .route("/download", get(download_by_path))
        .route("/folders", get(list_folders))
        .route("/folders/files", get(list_folder_files))
        .route("/:id", get(download))
        .layer(DefaultBodyLimit::max(max_request_bytes))
}

// ============================================================================
// Upload
// ============================================================================

/// Text fields of an upload form
#[derive(Debug, Default)]
struct UploadForm {
    session_id: Option<String>,
    chunk: Option<u32>,
    chunks: Option<u32>,
    hash: Option<String>,
    file_name: Option<String>,
    relative_path: Option<String>,
    charset: Option<String>,
    /// Original name of the `file` part
    part_name: Option<String>,
}

/// POST /api/v1/files/upload
///
/// The `file` part is streamed to the temp root before the coordinator sees it.
async fn upload(
    State(state): State<AppState>,
    multipart: Multipart,
) -> Result<Json<UploadResult>> {
    let temp_root = state.coordinator().chunk_store().temp_root().to_path_buf();
    let mut received: Option<PathBuf> = None;

    let result = receive_and_submit(&state, multipart, temp_root, &mut received).await;

    // Whatever the coordinator did not move into place is ours to remove
    if let Some(path) = received {
        if let Err(e) = tokio::fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove received upload");
            }
        }
    }

    result.map(Json)
}

async fn receive_and_submit(
    state: &AppState,
    mut multipart: Multipart,
    temp_root: PathBuf,
    received: &mut Option<PathBuf>,
) -> Result<UploadResult> {
    let mut form = UploadForm::default();

    while let Some(mut field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();

        match name.as_str() {
            "file" => {
                if received.is_some() {
                    return Err(AppError::BadRequest("only one file part is accepted".to_string()));
                }
                form.part_name = field.file_name().map(str::to_string);

                tokio::fs::create_dir_all(&temp_root).await?;
                let path = temp_root.join(format!(".recv-{}.part", Uuid::new_v4().simple()));
                *received = Some(path.clone());

                let mut writer = BufWriter::new(tokio::fs::File::create(&path).await?);
                while let Some(bytes) = field.chunk().await? {
                    writer.write_all(&bytes).await?;
                }
                writer.flush().await?;
            }
            "sessionId" => form.session_id = Some(field.text().await?),
            "chunk" => form.chunk = Some(parse_number(&name, &field.text().await?)?),
            "chunks" => form.chunks = Some(parse_number(&name, &field.text().await?)?),
            "hash" => form.hash = Some(field.text().await?),
            "fileName" => form.file_name = Some(field.text().await?),
            "relativePath" => form.relative_path = Some(field.text().await?),
            "charset" => form.charset = Some(field.text().await?),
            _ => {
                tracing::debug!(field = %name, "Ignoring unknown upload field");
            }
        }
    }

    let file_name = form
        .file_name
        .filter(|n| !n.trim().is_empty())
        .or(form.part_name)
        .unwrap_or_default();

    let request = UploadRequest {
        session_id: form.session_id,
        chunk: form.chunk.unwrap_or(0),
        chunks: form.chunks.unwrap_or(1),
        declared_hash: form.hash,
        file_name,
        relative_path: form.relative_path.filter(|p| !p.trim().is_empty()),
        charset: form.charset,
        source: received.clone().map(ByteSource::File),
    };

    Ok(state.coordinator().submit(request).await?)
}

fn parse_number(field: &str, value: &str) -> Result<u32> {
    value
        .trim()
        .parse()
        .map_err(|_| AppError::BadRequest(format!("{} must be a non-negative integer", field)))
}

// ============================================================================
// Download
// ============================================================================

#[derive(Debug, Deserialize)]
struct DownloadQuery {
    filename: Option<String>,
}

/// GET /api/v1/files/:id
async fn download(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<DownloadQuery>,
) -> Result<Response> {
    let result = state
        .coordinator()
        .download(&id, query.filename.as_deref())
        .await?;

    stream_response(result)
}

/// GET /api/v1/files/download?relativePath=&fileName=
async fn download_by_path(
    State(state): State<AppState>,
    Query(request): Query<DownloadRequest>,
) -> Result<Response> {
    let result = state.coordinator().download_by_path(request).await?;
    stream_response(result)
}

fn stream_response(result: DownloadResult) -> Result<Response> {
    let body = Body::from_stream(ReaderStream::new(result.content));

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, result.content_type)
        .header(header::CONTENT_LENGTH, result.length)
        .header(
            header::CONTENT_DISPOSITION,
            format!(
                "attachment; filename*=UTF-8''{}",
                urlencoding::encode(&result.file_name)
            ),
        )
        .body(body)
        .map_err(|e| AppError::Internal(e.to_string()))
}

// ============================================================================
// Listing
// ============================================================================

/// GET /api/v1/files/folders
async fn list_folders(State(state): State<AppState>) -> Result<Json<Vec<UploadFolder>>> {
    Ok(Json(state.coordinator().list_folders().await?))
}

#[derive(Debug, Deserialize)]
struct FolderQuery {
    folder: String,
}

/// GET /api/v1/files/folders/files?folder=
async fn list_folder_files(
    State(state): State<AppState>,
    Query(query): Query<FolderQuery>,
) -> Result<Json<Vec<String>>> {
    Ok(Json(
        state.coordinator().list_folder_files(&query.folder).await?,
    ))
}

// ============================================================================
// Tests
// ============================================================================
