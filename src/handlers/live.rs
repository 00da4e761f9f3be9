use crate::{db, models::AppState};
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use problemdetails::Problem;
use std::sync::Arc;

pub fn routes(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/live", get(live))
        .route("/ready", get(ready))
        .with_state(state)
}

async fn root() -> impl IntoResponse {
    (StatusCode::OK, "Use POST /api/v1/jobs to enqueue a job.")
}

async fn live() -> impl IntoResponse {
    StatusCode::OK
}

async fn ready(State(state): State<Arc<AppState>>) -> Result<StatusCode, Problem> {
    db::select_one(&state.pool).await?;
    Ok(StatusCode::OK)
}

#[cfg(test)]
use axum::body::Body;
#[cfg(test)]
use axum::http::Request;
#[cfg(test)]
use tower::ServiceExt;

#[tokio::test]
async fn live_is_ok() -> anyhow::Result<()> {
    // arrange
    let (state, _store, _rx) = crate::handlers::testing::state()?;
    let app = routes(state);

    // act
    let response = app
        .oneshot(Request::builder().uri("/live").body(Body::empty())?)
        .await?;

    // assert
    assert_eq!(StatusCode::OK, response.status());
    Ok(())
}
