//! Axum REST API handlers.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{error, info};

use crate::db;
use crate::engine::Engine;
use crate::errors::{Result, SettlementError};
use crate::ids;
use crate::models::{
    DonationRecord, Project, ProjectPayload, ProjectRef, SettlementCursor, User,
};

const DEFAULT_PAGE: i64 = 20;
const MAX_PAGE: i64 = 100;

#[derive(Clone)]
pub struct ApiState {
    pub pool: SqlitePool,
    pub engine: Arc<Engine>,
}

// ─────────────────────────────────────────────────────────
// Request / response shapes
// ─────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct PageQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Serialize)]
pub struct ProjectsResponse {
    pub count: usize,
    pub projects: Vec<Project>,
}

#[derive(Serialize)]
pub struct DonationsResponse {
    pub pid: String,
    pub count: usize,
    pub donations: Vec<DonationRecord>,
}

#[derive(Serialize)]
pub struct UserDonationsResponse {
    pub identity_number: String,
    pub count: usize,
    pub donations: Vec<DonationRecord>,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub identity: String,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn error_response(e: SettlementError) -> Response {
    let status = match &e {
        SettlementError::InvalidProjectRef(_) => StatusCode::BAD_REQUEST,
        SettlementError::ProjectNotFound(_) | SettlementError::UserNotFound(_) => {
            StatusCode::NOT_FOUND
        }
        SettlementError::LedgerRejected { code: 404, .. } => StatusCode::NOT_FOUND,
        SettlementError::LedgerUnavailable(_) | SettlementError::Http(_) => StatusCode::BAD_GATEWAY,
        _ => {
            error!("API request failed: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
        .into_response()
}

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        identity: state.engine.identity().to_string(),
    })
}

/// `GET /projects?limit&offset`
///
/// Projects ordered by donation count, most donated first.
pub async fn list_projects(
    State(state): State<Arc<ApiState>>,
    Query(page): Query<PageQuery>,
) -> Response {
    let limit = page.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);
    let offset = page.offset.unwrap_or(0).max(0);

    match db::list_projects(&state.pool, limit, offset).await {
        Ok(projects) => {
            let count = projects.len();
            (StatusCode::OK, Json(ProjectsResponse { count, projects })).into_response()
        }
        Err(e) => error_response(e),
    }
}

/// `GET /projects/:item`
///
/// `item` is either a project id or a base64 JSON description of a project;
/// the latter registers the project on first sight.
pub async fn get_project(
    State(state): State<Arc<ApiState>>,
    Path(item): Path<String>,
) -> Response {
    match resolve_project(&state, &item).await {
        Ok(project) => (StatusCode::OK, Json(project)).into_response(),
        Err(e) => error_response(e),
    }
}

/// `GET /projects/:pid/donations`
pub async fn get_project_donations(
    State(state): State<Arc<ApiState>>,
    Path(pid): Path<String>,
) -> Response {
    match db::donations_for_project(&state.pool, &pid).await {
        Ok(donations) => {
            let count = donations.len();
            (
                StatusCode::OK,
                Json(DonationsResponse {
                    pid,
                    count,
                    donations,
                }),
            )
                .into_response()
        }
        Err(e) => error_response(e),
    }
}

/// `GET /users/:identity`
pub async fn get_user(
    State(state): State<Arc<ApiState>>,
    Path(identity): Path<String>,
) -> Response {
    match db::get_user_by_identity(&state.pool, &identity).await {
        Ok(Some(user)) => (StatusCode::OK, Json::<User>(user)).into_response(),
        Ok(None) => error_response(SettlementError::UserNotFound(identity)),
        Err(e) => error_response(e),
    }
}

/// `GET /users/:identity/donations`
pub async fn get_user_donations(
    State(state): State<Arc<ApiState>>,
    Path(identity): Path<String>,
) -> Response {
    match db::donations_by_user(&state.pool, &identity).await {
        Ok(donations) => {
            let count = donations.len();
            (
                StatusCode::OK,
                Json(UserDonationsResponse {
                    identity_number: identity,
                    count,
                    donations,
                }),
            )
                .into_response()
        }
        Err(e) => error_response(e),
    }
}

/// `GET /settlement/cursor`
pub async fn get_cursor(State(state): State<Arc<ApiState>>) -> Response {
    match db::get_cursor(&state.pool).await {
        Ok(cursor) => (StatusCode::OK, Json::<SettlementCursor>(cursor)).into_response(),
        Err(e) => error_response(e),
    }
}

// ─────────────────────────────────────────────────────────
// Project resolution
// ─────────────────────────────────────────────────────────

async fn resolve_project(state: &ApiState, item: &str) -> Result<Project> {
    match ProjectRef::parse(item)? {
        ProjectRef::ById(pid) => {
            let pid = pid.to_string();
            db::get_project(&state.pool, &pid)
                .await?
                .ok_or(SettlementError::ProjectNotFound(pid))
        }
        ProjectRef::ByEncodedPayload(payload) => register_project(state, payload).await,
    }
}

/// Register the described project under its owner's ledger identity. The pid
/// is derived from the description and the owner, so the same link always
/// names the same project.
async fn register_project(state: &ApiState, payload: ProjectPayload) -> Result<Project> {
    let owner = state
        .engine
        .ledger()
        .read_profile(&payload.identity_number)
        .await?;

    let pid = ids::derive_key(&[
        "donate",
        &payload.title,
        &payload.description,
        &payload.img_url,
        &owner.user_id,
    ]);

    if let Some(existing) = db::get_project(&state.pool, &pid).await? {
        return Ok(existing);
    }

    let project = Project {
        pid: pid.clone(),
        title: payload.title,
        description: payload.description,
        img_url: payload.img_url,
        link: payload.link,
        identity_number: owner.identity_number,
        owner_id: owner.user_id,
        donate_cnt: 0,
        created_at: Utc::now().timestamp(),
    };
    db::insert_project(&state.pool, &project).await?;
    info!("Registered project {pid} for owner {}", project.owner_id);

    db::get_project(&state.pool, &pid)
        .await?
        .ok_or(SettlementError::ProjectNotFound(pid))
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::{engine_with, ME};
    use crate::ledger::simulated::SimulatedLedger;
    use crate::models::Profile;
    use base64::{engine::general_purpose::STANDARD, Engine as _};

    async fn state() -> Arc<ApiState> {
        let ledger = Arc::new(SimulatedLedger::new(ME));
        ledger.add_profile(Profile {
            user_id: "owner-uid".into(),
            identity_number: "7000".into(),
            full_name: "Owner".into(),
            avatar_url: String::new(),
            biography: String::new(),
            created_at: Utc::now(),
        });
        Arc::new(ApiState {
            pool: db::memory_pool().await,
            engine: Arc::new(engine_with(ledger)),
        })
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn encoded(json: &str) -> String {
        STANDARD.encode(json)
    }

    #[tokio::test]
    async fn payload_registers_then_resolves_by_id() {
        let state = state().await;
        let item = encoded(r#"{"title":"Wells","description":"d","identityNumber":"7000"}"#);

        let resp = get_project(State(state.clone()), Path(item.clone())).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let project = body_json(resp).await;
        let pid = project["pid"].as_str().unwrap().to_string();
        assert_eq!(project["title"], "Wells");
        assert_eq!(project["owner_id"], "owner-uid");
        assert_eq!(project["identity_number"], "7000");

        // Same link, same project.
        let again = body_json(get_project(State(state.clone()), Path(item)).await).await;
        assert_eq!(again["pid"], pid.as_str());

        let by_id = get_project(State(state.clone()), Path(pid.clone())).await;
        assert_eq!(by_id.status(), StatusCode::OK);
        assert_eq!(body_json(by_id).await["pid"], pid.as_str());
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let state = state().await;
        let resp = get_project(
            State(state),
            Path("3fa1c0de-8d1b-4c55-9a4e-1f0a2b3c4d5e".to_string()),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn malformed_reference_is_bad_request() {
        let state = state().await;
        let resp = get_project(State(state.clone()), Path("%%%".to_string())).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let missing_title = encoded(r#"{"identityNumber":"7000","title":""}"#);
        let resp = get_project(State(state), Path(missing_title)).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_owner_is_not_found() {
        let state = state().await;
        let item = encoded(r#"{"title":"Wells","identityNumber":"9999"}"#);
        let resp = get_project(State(state), Path(item)).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn listing_and_cursor() {
        let state = state().await;
        for title in ["A", "B", "C"] {
            let item = encoded(&format!(r#"{{"title":"{title}","identityNumber":"7000"}}"#));
            get_project(State(state.clone()), Path(item)).await;
        }

        let resp = list_projects(
            State(state.clone()),
            Query(PageQuery {
                limit: Some(2),
                offset: None,
            }),
        )
        .await;
        assert_eq!(body_json(resp).await["count"], 2);

        let resp = get_cursor(State(state.clone())).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(body_json(resp).await["last_snapshot_id"].is_null());

        let resp = get_project_donations(State(state), Path("nope".to_string())).await;
        assert_eq!(body_json(resp).await["count"], 0);
    }

    #[tokio::test]
    async fn users_and_their_donations() {
        let state = state().await;
        let resp = get_user(State(state.clone()), Path("1001".to_string())).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        db::upsert_user(
            &state.pool,
            &User {
                identity_number: "1001".into(),
                user_id: "donor-uid".into(),
                full_name: "Donor".into(),
                avatar_url: String::new(),
                biography: String::new(),
                ledger_created_at: 0,
                created_at: 1,
                updated_at: 1,
            },
        )
        .await
        .unwrap();
        db::insert_donation(
            &state.pool,
            &DonationRecord {
                id: "d1".into(),
                pid: "p1".into(),
                identity_number: "1001".into(),
                asset_id: "asset".into(),
                amount: "3".into(),
                created_at: 5,
            },
        )
        .await
        .unwrap();

        let resp = get_user(State(state.clone()), Path("1001".to_string())).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["user_id"], "donor-uid");

        let resp = get_user_donations(State(state), Path("1001".to_string())).await;
        let body = body_json(resp).await;
        assert_eq!(body["count"], 1);
        assert_eq!(body["donations"][0]["pid"], "p1");
    }
}
