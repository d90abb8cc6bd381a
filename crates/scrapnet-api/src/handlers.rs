//! External HTTP API: the front door and the internal replication surface.
//!
//! Every request carrying a string key (URL or username) is routed through
//! the ring first. The owner serves; everyone else answers with a 307 so
//! the client resends the identical request to the owner.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use actix_multipart::form::bytes::Bytes as MultipartBytes;
use actix_multipart::form::text::Text;
use actix_multipart::form::MultipartForm;
use actix_web::http::header;
use actix_web::{web, HttpRequest, HttpResponse};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

use scrapnet_ring::{hash_key, RingNode, RingStatus};

use crate::error::{ApiError, ApiResult};
use crate::jwt::{bearer_token, JwtService};
use crate::scrape::Scraper;
use crate::storage::ArtifactStore;
use crate::users::UserDirectory;

/// Shared state behind every handler.
#[derive(Clone)]
pub struct AppState {
    /// The overlay this node is a member of
    pub ring: Arc<RingNode>,
    /// Artifact store
    pub store: Arc<ArtifactStore>,
    /// User directory
    pub users: Arc<UserDirectory>,
    /// Token service
    pub jwt: JwtService,
    /// Scrape collaborator
    pub scraper: Arc<Scraper>,
    /// At most one scrape runs on a node at any instant
    pub scrape_lock: Arc<tokio::sync::Mutex<()>>,
    /// HTTP port peers serve on; used for redirects and replication pushes
    pub http_port: u16,
    /// Set once shutdown starts; new external work is refused
    pub shutting_down: Arc<AtomicBool>,
}

impl AppState {
    fn refuse_if_stopping(&self) -> ApiResult<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            Err(ApiError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    /// Route a keyed request: `None` means this node owns the key, `Some`
    /// is the redirect to send instead.
    async fn route(&self, key_source: &str, location: String) -> Option<HttpResponse> {
        let owner = self.ring.find_succ(hash_key(key_source)).await;
        if owner.id == self.ring.id() {
            return None;
        }
        info!(key = key_source, owner = %owner, "Redirecting to owner");
        let target = format!("http://{}:{}{}", owner.ip, self.http_port, location);
        Some(
            HttpResponse::TemporaryRedirect()
                .insert_header((header::LOCATION, target))
                .finish(),
        )
    }
}

/// Wire every route onto an actix app.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource("/scrape").route(web::post().to(scrape)))
        .service(web::resource("/authenticate").route(web::post().to(authenticate)))
        .service(web::resource("/login").route(web::post().to(login)))
        .service(web::resource("/urls").route(web::get().to(urls)))
        .service(web::resource("/users").route(web::get().to(list_users)))
        .service(web::resource("/replicate").route(web::post().to(replicate)))
        .service(web::resource("/replicate_users").route(web::post().to(replicate_users)))
        .service(web::resource("/status").route(web::get().to(status)));
}

#[derive(Debug, Deserialize)]
pub struct ScrapeQuery {
    /// Target URL
    pub url: String,
}

/// `POST /scrape?url=<u>`: serve the artifact for a URL, scraping on miss.
pub async fn scrape(
    req: HttpRequest,
    query: web::Query<ScrapeQuery>,
    state: web::Data<AppState>,
) -> ApiResult<HttpResponse> {
    state.refuse_if_stopping()?;
    state.jwt.verify(bearer_token(&req)?)?;

    let url = query.into_inner().url;
    let encoded: String = url::form_urlencoded::byte_serialize(url.as_bytes()).collect();
    if let Some(redirect) = state.route(&url, format!("/scrape?url={encoded}")).await {
        return Ok(redirect);
    }

    if !state.store.contains(&url) {
        let _guard = state.scrape_lock.lock().await;
        // A concurrent request may have finished this scrape while we
        // queued on the lock.
        if !state.store.contains(&url) {
            let artifact = state.scraper.scrape(&url).await?;
            state.store.insert(&url, &artifact)?;
        }
    }

    let Some(bytes) = state.store.read(&url)? else {
        return Err(ApiError::Internal("artifact missing after scrape".into()));
    };

    Ok(HttpResponse::Ok()
        .content_type("application/zip")
        .insert_header((
            header::CONTENT_DISPOSITION,
            format!(
                "attachment; filename=\"{}\"",
                ArtifactStore::archive_name(&url)
            ),
        ))
        .body(bytes))
}

fn credential_pair(body: &[String]) -> ApiResult<(&str, &str)> {
    match body {
        [username, password] => Ok((username, password)),
        _ => Err(ApiError::InvalidRequest(
            "expected a [username, password] pair".into(),
        )),
    }
}

fn token_response(state: &AppState, username: &str) -> ApiResult<HttpResponse> {
    Ok(HttpResponse::Ok().json(json!({
        "access_token": state.jwt.issue(username)?,
        "token_type": "bearer",
    })))
}

/// `POST /authenticate`: register a user, returning a token.
pub async fn authenticate(
    body: web::Json<Vec<String>>,
    state: web::Data<AppState>,
) -> ApiResult<HttpResponse> {
    state.refuse_if_stopping()?;
    let (username, password) = credential_pair(&body)?;

    if let Some(redirect) = state.route(username, "/authenticate".into()).await {
        return Ok(redirect);
    }

    state.users.register(username, password)?;
    token_response(&state, username)
}

/// `POST /login`: verify credentials, returning a token.
pub async fn login(
    body: web::Json<Vec<String>>,
    state: web::Data<AppState>,
) -> ApiResult<HttpResponse> {
    state.refuse_if_stopping()?;
    let (username, password) = credential_pair(&body)?;

    if let Some(redirect) = state.route(username, "/login".into()).await {
        return Ok(redirect);
    }

    state.users.verify(username, password)?;
    token_response(&state, username)
}

/// `GET /urls`: the node's owned and replicated URL set. Internal.
pub async fn urls(state: web::Data<AppState>) -> ApiResult<HttpResponse> {
    Ok(HttpResponse::Ok().json(state.store.urls()))
}

/// `GET /users`: `(name, hashed_password)` pairs. Internal.
pub async fn list_users(state: web::Data<AppState>) -> ApiResult<HttpResponse> {
    Ok(HttpResponse::Ok().json(state.users.export()))
}

/// Multipart payload of a replication push.
#[derive(MultipartForm)]
pub struct ReplicateForm {
    /// URL the blob belongs to
    pub url: Text<String>,
    /// The zip blob
    pub content: MultipartBytes,
}

/// `POST /replicate`: accept one blob pushed by a neighbor. Idempotent.
pub async fn replicate(
    form: MultipartForm<ReplicateForm>,
    state: web::Data<AppState>,
) -> ApiResult<HttpResponse> {
    let ReplicateForm { url, content } = form.into_inner();
    let url = url.0;

    state.store.insert(&url, &content.data)?;
    info!(url, "Artifact received via replication");

    Ok(HttpResponse::Ok().json(json!({ "message": "replication applied" })))
}

/// `POST /replicate_users`: merge user records pushed by a neighbor.
pub async fn replicate_users(
    body: web::Json<Vec<(String, String)>>,
    state: web::Data<AppState>,
) -> ApiResult<HttpResponse> {
    let merged = state.users.merge(body.into_inner());
    info!(merged, "User records received via replication");

    Ok(HttpResponse::Ok().json(json!({ "message": "user replication applied" })))
}

/// Node status snapshot. Internal.
#[derive(Debug, Serialize)]
pub struct NodeStatus {
    /// Ring pointers
    pub ring: RingStatus,
    /// Stored URL count
    pub urls: usize,
    /// Known user count
    pub users: usize,
    /// Whether shutdown has begun
    pub shutting_down: bool,
}

/// `GET /status`: operational snapshot of this node.
pub async fn status(state: web::Data<AppState>) -> ApiResult<HttpResponse> {
    Ok(HttpResponse::Ok().json(NodeStatus {
        ring: state.ring.status().await,
        urls: state.store.len(),
        users: state.users.len(),
        shutting_down: state.shutting_down.load(Ordering::SeqCst),
    }))
}
