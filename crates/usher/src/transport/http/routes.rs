//! HTTP route handlers.

use std::sync::Arc;

use axum::{
    Router,
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post, put},
};
use serde::Deserialize;

use crate::coordinator::{CoordinatorError, LifecycleCoordinator, RequestOutcome};

type Coordinator = Arc<LifecycleCoordinator>;
type ApiResponse = (StatusCode, Json<serde_json::Value>);

fn error_response(error: CoordinatorError) -> ApiResponse {
    let status = match &error {
        CoordinatorError::Cooldown(_) => StatusCode::TOO_MANY_REQUESTS,
        CoordinatorError::NotFound => StatusCode::NOT_FOUND,
        CoordinatorError::OfferNotPending | CoordinatorError::NoSlotAvailable => {
            StatusCode::CONFLICT
        }
        CoordinatorError::Contended => StatusCode::SERVICE_UNAVAILABLE,
        CoordinatorError::Driver(_) => StatusCode::BAD_GATEWAY,
        CoordinatorError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        CoordinatorError::Pool(_) => StatusCode::SERVICE_UNAVAILABLE,
    };

    let mut body = serde_json::json!({
        "error": error.to_string(),
        "kind": error.kind(),
    });
    if let CoordinatorError::Cooldown(remaining) = &error {
        body["retry_after_secs"] = serde_json::json!(remaining.as_secs());
    }
    (status, Json(body))
}

async fn health_check(State(coordinator): State<Coordinator>) -> ApiResponse {
    let stats = coordinator.pool_stats();
    let status = if stats.available + stats.allocated == 0 {
        "unavailable"
    } else if stats.available == 0 {
        "busy"
    } else {
        "ready"
    };

    (
        StatusCode::OK,
        Json(serde_json::json!({
            "status": status,
            "pool": stats,
            "queued": coordinator.list_queue().len(),
        })),
    )
}

async fn request_session(
    State(coordinator): State<Coordinator>,
    Path(room_id): Path<String>,
) -> ApiResponse {
    match coordinator.request_session(&room_id).await {
        Ok(outcome) => {
            let status = match &outcome {
                RequestOutcome::Allocated { .. } => StatusCode::CREATED,
                RequestOutcome::Queued { .. } => StatusCode::ACCEPTED,
                RequestOutcome::AlreadyAllocated { .. } | RequestOutcome::AlreadyQueued { .. } => {
                    StatusCode::OK
                }
            };
            (status, Json(serde_json::json!(outcome)))
        }
        Err(e) => error_response(e),
    }
}

async fn session_status(
    State(coordinator): State<Coordinator>,
    Path(room_id): Path<String>,
) -> ApiResponse {
    match coordinator.session_status(&room_id).await {
        Ok(Some(session)) => (StatusCode::OK, Json(serde_json::json!(session))),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "no active session"})),
        ),
        Err(e) => error_response(e),
    }
}

async fn release_session(
    State(coordinator): State<Coordinator>,
    Path(room_id): Path<String>,
) -> ApiResponse {
    match coordinator.release_session(&room_id).await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({"status": "released"})),
        ),
        Err(e) => error_response(e),
    }
}

#[derive(Debug, Deserialize)]
struct TouchRequest {
    url: Option<String>,
}

async fn touch_session(
    State(coordinator): State<Coordinator>,
    Path(room_id): Path<String>,
    body: Option<Json<TouchRequest>>,
) -> ApiResponse {
    let url = body.and_then(|Json(r)| r.url);
    match coordinator.touch_session(&room_id, url).await {
        Ok(session) => (StatusCode::OK, Json(serde_json::json!(session))),
        Err(e) => error_response(e),
    }
}

async fn restart_session(
    State(coordinator): State<Coordinator>,
    Path(room_id): Path<String>,
) -> ApiResponse {
    match coordinator.restart_session(&room_id).await {
        Ok(session) => (StatusCode::OK, Json(serde_json::json!(session))),
        Err(e) => error_response(e),
    }
}

async fn accept_offer(
    State(coordinator): State<Coordinator>,
    Path(room_id): Path<String>,
) -> ApiResponse {
    match coordinator.accept_offer(&room_id).await {
        Ok(session) => (StatusCode::CREATED, Json(serde_json::json!(session))),
        Err(e) => error_response(e),
    }
}

async fn decline_offer(
    State(coordinator): State<Coordinator>,
    Path(room_id): Path<String>,
) -> ApiResponse {
    match coordinator.decline_offer(&room_id).await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({"status": "declined"})),
        ),
        Err(e) => error_response(e),
    }
}

async fn queue_status(
    State(coordinator): State<Coordinator>,
    Path(room_id): Path<String>,
) -> ApiResponse {
    match coordinator.queue_status(&room_id) {
        Some(status) => (StatusCode::OK, Json(serde_json::json!(status))),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({"error": "not queued"})),
        ),
    }
}

async fn cancel_queue(
    State(coordinator): State<Coordinator>,
    Path(room_id): Path<String>,
) -> ApiResponse {
    match coordinator.cancel_queue(&room_id).await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({"status": "cancelled"})),
        ),
        Err(e) => error_response(e),
    }
}

async fn cooldown_status(
    State(coordinator): State<Coordinator>,
    Path(room_id): Path<String>,
) -> ApiResponse {
    let body = match coordinator.cooldown_status(&room_id) {
        Some(remaining) => serde_json::json!({
            "cooling_down": true,
            "retry_after_secs": remaining.as_secs(),
        }),
        None => serde_json::json!({"cooling_down": false}),
    };
    (StatusCode::OK, Json(body))
}

async fn list_sessions(State(coordinator): State<Coordinator>) -> ApiResponse {
    match coordinator.list_sessions().await {
        Ok(sessions) => (StatusCode::OK, Json(serde_json::json!(sessions))),
        Err(e) => error_response(e),
    }
}

async fn list_queue(State(coordinator): State<Coordinator>) -> ApiResponse {
    (
        StatusCode::OK,
        Json(serde_json::json!(coordinator.list_queue())),
    )
}

async fn shutdown(State(coordinator): State<Coordinator>) -> ApiResponse {
    coordinator.trigger_shutdown();
    (
        StatusCode::OK,
        Json(serde_json::json!({"status": "shutting down"})),
    )
}

pub fn routes(coordinator: Coordinator) -> Router {
    Router::new()
        .route("/health-check", get(health_check))
        .route("/shutdown", post(shutdown))
        .route("/sessions", get(list_sessions))
        .route("/queue", get(list_queue))
        .route(
            "/rooms/{room_id}/session",
            post(request_session)
                .get(session_status)
                .delete(release_session),
        )
        .route("/rooms/{room_id}/session/url", put(touch_session))
        .route("/rooms/{room_id}/session/restart", post(restart_session))
        .route("/rooms/{room_id}/offer/accept", post(accept_offer))
        .route("/rooms/{room_id}/offer/decline", post(decline_offer))
        .route(
            "/rooms/{room_id}/queue",
            get(queue_status).delete(cancel_queue),
        )
        .route("/rooms/{room_id}/cooldown", get(cooldown_status))
        .with_state(coordinator)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::config::PoolConfig;
    use crate::driver::{ConnectionInfo, DriverError, RuntimeDriver, SlotIndex};
    use crate::notify::NullSink;

    struct StubDriver;

    #[async_trait]
    impl RuntimeDriver for StubDriver {
        async fn initialize(&self) -> Result<(), DriverError> {
            Ok(())
        }

        async fn provision_slot(&self, index: SlotIndex) -> Result<ConnectionInfo, DriverError> {
            Ok(ConnectionInfo::new(format!("wss://slot-{index}.internal"))
                .with_auth_token("s3cret"))
        }

        async fn release_slot(&self, _index: SlotIndex) -> Result<(), DriverError> {
            Ok(())
        }

        async fn health_check(&self, _index: SlotIndex) -> bool {
            true
        }

        async fn list_running(&self) -> HashSet<SlotIndex> {
            HashSet::new()
        }

        async fn restart_process(&self, index: SlotIndex) -> Result<ConnectionInfo, DriverError> {
            Ok(ConnectionInfo::new(format!("wss://slot-{index}.restarted")))
        }
    }

    async fn test_app() -> (Router, Coordinator) {
        let config = PoolConfig::default()
            .with_num_slots(1)
            .with_session_ttl(Duration::from_secs(600))
            .with_offer_window(Duration::from_secs(60))
            .with_cooldown(Duration::ZERO)
            .with_release_grace(Duration::ZERO)
            .with_admission_timeout(Duration::from_millis(100));
        let coordinator = Arc::new(LifecycleCoordinator::new(
            config,
            Arc::new(StubDriver),
            Arc::new(NullSink),
        ));
        coordinator.initialize().await.unwrap();
        (routes(Arc::clone(&coordinator)), coordinator)
    }

    async fn response_json(response: axum::response::Response) -> serde_json::Value {
        let body = response.into_body();
        let bytes = body.collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_check_reports_pool_state() {
        let (app, _) = test_app().await;

        let response = app
            .oneshot(Request::get("/health-check").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = response_json(response).await;
        assert_eq!(json["status"], "ready");
        assert_eq!(json["pool"]["available"], 1);
        assert_eq!(json["queued"], 0);
    }

    #[tokio::test]
    async fn request_allocates_and_strips_secrets() {
        let (app, _) = test_app().await;

        let response = app
            .oneshot(
                Request::post("/rooms/room-a/session")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CREATED);
        let json = response_json(response).await;
        assert_eq!(json["status"], "allocated");
        assert_eq!(json["session"]["room_id"], "room-a");
        assert!(json["session"]["connection"].get("auth_token").is_none());
    }

    #[tokio::test]
    async fn second_request_queues_with_202() {
        let (app, coordinator) = test_app().await;
        coordinator.request_session("room-a").await.unwrap();

        let response = app
            .oneshot(
                Request::post("/rooms/room-b/session")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let json = response_json(response).await;
        assert_eq!(json["status"], "queued");
        assert_eq!(json["queue"]["position"], 1);
    }

    #[tokio::test]
    async fn session_status_is_404_without_session() {
        let (app, _) = test_app().await;

        let response = app
            .oneshot(
                Request::get("/rooms/room-a/session")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn release_without_session_maps_to_404() {
        let (app, _) = test_app().await;

        let response = app
            .oneshot(
                Request::delete("/rooms/room-a/session")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let json = response_json(response).await;
        assert_eq!(json["kind"], "validation");
    }

    #[tokio::test]
    async fn accept_without_offer_is_conflict() {
        let (app, _) = test_app().await;

        let response = app
            .oneshot(
                Request::post("/rooms/room-a/offer/accept")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn cooldown_endpoint_reports_remaining_window() {
        let config = PoolConfig::default()
            .with_num_slots(1)
            .with_cooldown(Duration::from_secs(120))
            .with_release_grace(Duration::ZERO)
            .with_admission_timeout(Duration::from_millis(100));
        let coordinator = Arc::new(LifecycleCoordinator::new(
            config,
            Arc::new(StubDriver),
            Arc::new(NullSink),
        ));
        coordinator.initialize().await.unwrap();
        coordinator.request_session("room-a").await.unwrap();
        coordinator.release_session("room-a").await.unwrap();

        let app = routes(Arc::clone(&coordinator));
        let response = app
            .oneshot(
                Request::get("/rooms/room-a/cooldown")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = response_json(response).await;
        assert_eq!(json["cooling_down"], true);
        assert!(json["retry_after_secs"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn queue_listing_shows_fifo_order() {
        let (app, coordinator) = test_app().await;
        coordinator.request_session("room-a").await.unwrap();
        coordinator.request_session("room-b").await.unwrap();
        coordinator.request_session("room-c").await.unwrap();

        let response = app
            .oneshot(Request::get("/queue").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let json = response_json(response).await;
        assert_eq!(json.as_array().unwrap().len(), 2);
        assert_eq!(json[0]["room_id"], "room-b");
        assert_eq!(json[1]["room_id"], "room-c");
        assert_eq!(json[1]["position"], 2);
    }

    #[tokio::test]
    async fn cancel_queue_round_trip() {
        let (app, coordinator) = test_app().await;
        coordinator.request_session("room-a").await.unwrap();
        coordinator.request_session("room-b").await.unwrap();

        let response = app
            .oneshot(
                Request::delete("/rooms/room-b/queue")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(coordinator.queue_status("room-b").is_none());
    }

    #[tokio::test]
    async fn shutdown_endpoint_signals_the_server() {
        let (app, coordinator) = test_app().await;
        let mut rx = coordinator.shutdown_rx();

        let response = app
            .oneshot(Request::post("/shutdown").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }
}
