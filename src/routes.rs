use axum::{
    routing::{delete, get, post},
    Router,
};

use crate::appointments::api;
use crate::availability;

pub fn api_routes() -> Router {
    Router::new()
        .route("/api/availability", get(availability::get_availability))
        .route("/api/appointments/create-order", post(api::create_order))
        .route("/api/appointments/capture-order", post(api::capture_order))
        .route("/api/appointments/cancel-order", post(api::cancel_order))
        .route(
            "/api/appointments/cleanup-pending",
            post(api::cleanup_pending),
        )
        .route("/api/appointments/:id", delete(api::cancel_appointment))
        .route(
            "/api/appointments/:id/status",
            get(api::appointment_status),
        )
        .route(
            "/api/appointments/:id/meeting-link",
            post(api::refresh_meeting_link),
        )
}
