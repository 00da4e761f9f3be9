use crate::models::{AppState, Error, JobCreate};
use axum::{
    extract::{Path, State},
    http::{header, HeaderName, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use problemdetails::Problem;
use std::sync::Arc;
#[allow(unused_imports)]
use tracing::{debug, error, info, warn};

const JOB_ID: HeaderName = HeaderName::from_static("job-id");
const MAX_TYPE_LEN: usize = 100;

pub fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/jobs", post(job_create))
        .route("/jobs/:id", get(get_by_id))
        .route("/run", post(run))
        .with_state(state)
}

async fn job_create(
    State(state): State<Arc<AppState>>,
    Json(job): Json<JobCreate>,
) -> Result<impl IntoResponse, Problem> {
    if job.job_type.is_empty() || job.job_type.len() > MAX_TYPE_LEN {
        return Err(Error::InvalidParams("type").into());
    }
    let id = state
        .queue
        .enqueue_in(&job.job_type, job.payload, job.delay.unwrap_or(0))
        .await?;
    debug!({ instance_id = state.instance_id, job_id = id }, "created");
    let headers = [
        (header::LOCATION, format!("/api/v1/jobs/{}", id)),
        (JOB_ID, id.to_string()),
    ];
    Ok((StatusCode::CREATED, headers))
}

async fn get_by_id(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Response, Problem> {
    let job = state.queue.get(id).await?;
    match job {
        None => Ok(StatusCode::NO_CONTENT.into_response()),
        Some(o) => Ok(Json(o).into_response()),
    }
}

async fn run(State(state): State<Arc<AppState>>) -> Result<StatusCode, Problem> {
    state.queue.trigger().run_now().await?;
    Ok(StatusCode::ACCEPTED)
}

#[cfg(test)]
use crate::models::JobStatus;
#[cfg(test)]
use crate::store::JobStore;
#[cfg(test)]
use axum::body::Body;
#[cfg(test)]
use axum::http::Request;
#[cfg(test)]
use serde_json::json;
#[cfg(test)]
use tower::ServiceExt;

#[cfg(test)]
fn post_json(uri: &str, body: serde_json::Value) -> anyhow::Result<Request<Body>> {
    Ok(Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))?)
}

#[tokio::test]
async fn job_create_enqueues() -> anyhow::Result<()> {
    // arrange
    let (state, store, rx) = crate::handlers::testing::state()?;
    let app = routes(state);
    let body = json!({"type": "send_email", "payload": {"to": "a@b.com"}, "delay": 30});

    // act
    let response = app.oneshot(post_json("/jobs", body)?).await?;

    // assert
    assert_eq!(StatusCode::CREATED, response.status());
    assert_eq!("/api/v1/jobs/1", response.headers()[header::LOCATION]);
    assert_eq!("1", response.headers()["job-id"]);
    let job = store.get(1).await?.ok_or_else(|| anyhow::anyhow!("job missing"))?;
    assert_eq!(JobStatus::Pending, job.status);
    assert_eq!(json!({"to": "a@b.com"}), job.payload);
    let delay_ms = (job.available_at - job.created_at).num_milliseconds();
    assert!((29_000..=30_000).contains(&delay_ms));
    assert_eq!(1, rx.len());
    Ok(())
}

#[tokio::test]
async fn job_create_rejects_empty_type() -> anyhow::Result<()> {
    // arrange
    let (state, store, _rx) = crate::handlers::testing::state()?;
    let app = routes(state);

    // act
    let response = app.oneshot(post_json("/jobs", json!({"type": ""}))?).await?;

    // assert
    assert_eq!(StatusCode::BAD_REQUEST, response.status());
    assert!(store.all().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn job_create_rejects_out_of_range_delay() -> anyhow::Result<()> {
    // arrange
    let (state, store, _rx) = crate::handlers::testing::state()?;
    let app = routes(state);
    let body = json!({"type": "report", "delay": i64::MAX});

    // act
    let response = app.oneshot(post_json("/jobs", body)?).await?;

    // assert
    assert_eq!(StatusCode::BAD_REQUEST, response.status());
    assert!(store.all().await.is_empty());
    Ok(())
}

#[tokio::test]
async fn get_by_id_missing_is_no_content() -> anyhow::Result<()> {
    // arrange
    let (state, _store, _rx) = crate::handlers::testing::state()?;
    let app = routes(state);

    // act
    let response = app
        .oneshot(Request::builder().uri("/jobs/42").body(Body::empty())?)
        .await?;

    // assert
    assert_eq!(StatusCode::NO_CONTENT, response.status());
    Ok(())
}

#[tokio::test]
async fn run_triggers() -> anyhow::Result<()> {
    // arrange
    let (state, _store, rx) = crate::handlers::testing::state()?;
    let app = routes(state);

    // act
    let response = app
        .oneshot(Request::builder().method("POST").uri("/run").body(Body::empty())?)
        .await?;

    // assert
    assert_eq!(StatusCode::ACCEPTED, response.status());
    assert_eq!(1, rx.len());
    Ok(())
}
