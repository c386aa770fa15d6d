use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use log::{error, info};
use serde::Deserialize;
use serde_json::json;

use crate::mail_reader::attachment_store::AttachmentStore;
use crate::mail_reader::cursor::CursorStore;
use crate::mail_reader::error::SyncError;
use crate::mail_reader::fetch::days_ago;
use crate::mail_reader::imap::{AccessMode, Connector, Credentials, ImapConnector};
use crate::mail_reader::{self, SyncMode, SyncReport, SyncRequest};
use crate::settings::Config;

pub struct AppState<C> {
    pub config: Arc<Config>,
    pub connector: Arc<C>,
    pub store: Arc<AttachmentStore>,
    pub cursors: Arc<CursorStore>,
}

// Derived Clone would demand `C: Clone`.
impl<C> Clone for AppState<C> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            connector: self.connector.clone(),
            store: self.store.clone(),
            cursors: self.cursors.clone(),
        }
    }
}

#[derive(Debug)]
struct AppError(SyncError);

impl From<SyncError> for AppError {
    fn from(e: SyncError) -> Self {
        AppError(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            SyncError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            SyncError::Authentication(_) => StatusCode::UNAUTHORIZED,
            SyncError::NotFound(_) | SyncError::FolderNotFound(_) => StatusCode::NOT_FOUND,
            SyncError::Connection(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

#[derive(Debug, Default, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
enum RequestMode {
    #[default]
    Window,
    Incremental,
}

#[derive(Debug, Deserialize)]
struct GetEmailsRequest {
    email: Option<String>,
    password: Option<String>,
    #[serde(default)]
    mode: RequestMode,
    since_days: Option<i64>,
    folder: Option<String>,
    #[serde(default)]
    access: AccessMode,
    #[serde(default = "default_include_payload")]
    include_payload: bool,
}

fn default_include_payload() -> bool {
    true
}

impl GetEmailsRequest {
    fn into_sync_request(self, config: &Config) -> Result<SyncRequest, SyncError> {
        let (address, secret) = match (self.email, self.password) {
            (Some(address), Some(secret)) if !address.is_empty() && !secret.is_empty() => (address, secret),
            _ => {
                return Err(SyncError::InvalidRequest(
                    "Email and password are required".to_string(),
                ))
            }
        };
        let mode = match self.mode {
            RequestMode::Incremental => SyncMode::Incremental,
            RequestMode::Window => {
                let days = self.since_days.unwrap_or(config.sync.since_days);
                SyncMode::Window { since: days_ago(days)? }
            }
        };
        Ok(SyncRequest {
            credentials: Credentials { address, secret },
            folder: self.folder.unwrap_or_else(|| config.imap.folder.clone()),
            mode,
            access: self.access,
            include_payload: self.include_payload,
        })
    }
}

async fn get_emails<C>(
    State(state): State<AppState<C>>,
    Json(body): Json<GetEmailsRequest>,
) -> Result<Json<SyncReport>, AppError>
where
    C: Connector + Send + Sync + 'static,
{
    let request = body.into_sync_request(&state.config)?;
    info!("sync requested for {} / {} ({:?})", request.credentials.address, request.folder, request.mode);

    let report = mail_reader::sync(state.connector.as_ref(), &state.store, &state.cursors, &request)
        .await
        .inspect_err(|e| {
            let hint = if e.is_transient() { " (transient, may be retried)" } else { "" };
            error!("sync for {} failed{}: {}", request.credentials.address, hint, e)
        })?;
    Ok(Json(report))
}

async fn get_attachment<C>(
    State(state): State<AppState<C>>,
    Path(reference): Path<String>,
) -> Result<Response, AppError>
where
    C: Connector + Send + Sync + 'static,
{
    let (bytes, content_type) = state.store.open(&reference)?;
    Ok(([(header::CONTENT_TYPE, content_type)], bytes).into_response())
}

pub fn create_router<C>(state: AppState<C>) -> Router
where
    C: Connector + Send + Sync + 'static,
{
    Router::new()
        .route("/get_emails", post(get_emails::<C>))
        .route("/attachments/:reference", get(get_attachment::<C>))
        .with_state(state)
}

pub async fn entrypoint(config: Config) -> anyhow::Result<()> {
    let state = AppState {
        connector: Arc::new(ImapConnector::new(config.imap.server.clone(), config.imap.port)),
        store: Arc::new(AttachmentStore::new(
            &config.storage.attachments_dir,
            config.storage.store_mode,
            config.storage.retry_policy,
        )?),
        cursors: Arc::new(CursorStore::new(&config.storage.cursor_file)),
        config: Arc::new(config),
    };
    let address = format!("{}:{}", state.config.server.host, state.config.server.port);
    info!("attachments stored in {}", state.store.root().display());

    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(&address).await?;
    info!("Server running on http://{}", address);
    axum::serve(listener, app).await?;
    Ok(())
}
