use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::{Extension, Router};
use booking_backend::appointments::{AppointmentStore, NewAppointment};
use booking_backend::calendar::CalendarHandle;
use booking_backend::config::AppConfig;
use booking_backend::payments::PaymentsHandle;
use booking_backend::routes::api_routes;
use chrono::{NaiveDate, NaiveTime, Utc};
use hmac::{Hmac, Mac};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};
use sha2::Sha256;
use sqlx::PgPool;
use tower::ServiceExt; // for `oneshot`

const JWT_SECRET: &str = "test-secret";
const CLEANUP_SECRET: &str = "sweeper-secret";

fn test_app(pool: PgPool) -> Router {
    std::env::set_var("JWT_SECRET", JWT_SECRET);
    std::env::set_var("CLEANUP_SIGNING_SECRET", CLEANUP_SECRET);
    let config = Arc::new(AppConfig::from_env().unwrap());
    Router::new()
        .merge(api_routes())
        .layer(Extension(pool))
        .layer(Extension(config))
        .layer(Extension(PaymentsHandle::new(None)))
        .layer(Extension(CalendarHandle::new(None)))
}

fn bearer_token(user_id: i32) -> String {
    let claims = json!({
        "sub": user_id,
        "email": format!("user{user_id}@example.com"),
        "exp": 9999999999u64,
    });
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn availability_lists_the_grid_and_rejects_bad_dates(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let app = test_app(pool.clone());

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/availability?date=2099-06-10")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["totalSlots"], 18);
    assert_eq!(body["availableCount"], 18);
    assert_eq!(body["slots"][0]["time"], "09:00");

    let malformed = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/availability?date=not-a-date")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(malformed.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(malformed).await["code"], "INVALID_DATE");

    let past = app
        .oneshot(
            Request::builder()
                .uri("/api/availability?date=2000-01-01")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(past.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(past).await["code"], "PAST_DATE");
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn live_holds_shrink_the_availability_count(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let store = AppointmentStore::new(pool.clone());
    store
        .create_pending(
            NewAppointment {
                user_id: 1,
                user_email: "user1@example.com".to_string(),
                user_name: "User 1".to_string(),
                appointment_date: NaiveDate::from_ymd_opt(2099, 6, 10).unwrap(),
                start_time: NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
                duration_minutes: 60,
                timezone: "UTC".to_string(),
                booked_slots: vec![
                    NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
                    NaiveTime::from_hms_opt(10, 30, 0).unwrap(),
                ],
                amount_cents: 5000,
                currency: "USD".to_string(),
            },
            Utc::now(),
            15,
        )
        .await
        .unwrap();

    let app = test_app(pool);
    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/availability?date=2099-06-10")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["availableCount"], 16);
    let ten = body["slots"]
        .as_array()
        .unwrap()
        .iter()
        .find(|slot| slot["time"] == "10:00")
        .unwrap();
    assert_eq!(ten["available"], false);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn cleanup_endpoint_requires_a_valid_signature(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let app = test_app(pool);
    let body = br#"{"requestedBy":"scheduler"}"#;

    let unsigned = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/appointments/cleanup-pending")
                .body(Body::from(body.to_vec()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(unsigned.status(), StatusCode::BAD_REQUEST);

    let forged = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/appointments/cleanup-pending")
                .header("x-cleanup-signature", "sha256=deadbeef")
                .body(Body::from(body.to_vec()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(forged.status(), StatusCode::UNAUTHORIZED);

    let mut mac = Hmac::<Sha256>::new_from_slice(CLEANUP_SECRET.as_bytes()).unwrap();
    mac.update(body);
    let signature = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));
    let signed = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/appointments/cleanup-pending")
                .header("x-cleanup-signature", signature)
                .body(Body::from(body.to_vec()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(signed.status(), StatusCode::OK);
    assert_eq!(body_json(signed).await["deletedCount"], 0);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn status_snapshot_is_owner_only(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let store = AppointmentStore::new(pool.clone());
    let appointment = store
        .create_pending(
            NewAppointment {
                user_id: 7,
                user_email: "user7@example.com".to_string(),
                user_name: "User 7".to_string(),
                appointment_date: NaiveDate::from_ymd_opt(2099, 6, 10).unwrap(),
                start_time: NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
                duration_minutes: 30,
                timezone: "UTC".to_string(),
                booked_slots: vec![NaiveTime::from_hms_opt(10, 0, 0).unwrap()],
                amount_cents: 5000,
                currency: "USD".to_string(),
            },
            Utc::now(),
            15,
        )
        .await
        .unwrap();

    let app = test_app(pool);
    let uri = format!("/api/appointments/{}/status", appointment.id);

    let anonymous = app
        .clone()
        .oneshot(Request::builder().uri(&uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);

    let stranger = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(&uri)
                .header("Authorization", format!("Bearer {}", bearer_token(99)))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(stranger.status(), StatusCode::NOT_FOUND);

    let owner = app
        .oneshot(
            Request::builder()
                .uri(&uri)
                .header("Authorization", format!("Bearer {}", bearer_token(7)))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(owner.status(), StatusCode::OK);
    let body = body_json(owner).await;
    assert_eq!(body["appointment"]["status"], "pending");
    assert_eq!(body["appointment"]["paymentStatus"], "pending");
    assert_eq!(body["appointment"]["time"], "10:00");
    assert_eq!(body["appointment"]["meetingLink"], Value::Null);
}
