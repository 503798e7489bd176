use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Extension, Path};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use chrono::{DateTime, Duration, NaiveTime, Utc};
use chrono_tz::Tz;
use hmac::{Hmac, Mac};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use sqlx::PgPool;
use tracing::warn;
use uuid::Uuid;

use super::models::{Appointment, NewAppointment, ReservationState};
use super::store::AppointmentStore;
use super::{sweeper, workflow};
use crate::availability::{ensure_bookable_date, parse_date};
use crate::calendar::CalendarHandle;
use crate::config::{AppConfig, BookingRules};
use crate::error::{AppError, AppResult};
use crate::extractor::AuthUser;
use crate::payments::PaymentsHandle;

static TIME_FORMAT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([01]\d|2[0-3]):[0-5]\d$").unwrap());

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    pub date: String,
    pub time: String,
    pub user_email: String,
    pub user_name: String,
    pub timezone: String,
    #[serde(default)]
    pub duration: Option<i32>,
    #[serde(default)]
    pub price: Option<i32>,
    #[serde(default)]
    pub slots: Option<Vec<String>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderResponse {
    pub order_id: String,
    pub approval_url: Option<String>,
    pub appointment_id: Uuid,
    pub amount: i32,
    pub currency: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureOrderRequest {
    pub order_id: String,
    pub appointment_id: Uuid,
    #[serde(default)]
    pub category_id: Option<String>,
    #[serde(default)]
    pub category_name: Option<String>,
    #[serde(default)]
    pub form_answers: Option<Value>,
}

#[derive(Debug, Serialize)]
pub struct CaptureOrderResponse {
    pub appointment: AppointmentView,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelOrderRequest {
    pub appointment_id: Uuid,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeetingLinkResponse {
    pub meeting_link: String,
    pub event_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupResponse {
    pub deleted_count: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppointmentView {
    pub id: Uuid,
    pub date: String,
    pub time: String,
    pub status: &'static str,
    pub payment_status: &'static str,
    pub meeting_link: Option<String>,
}

impl From<&Appointment> for AppointmentView {
    fn from(appointment: &Appointment) -> Self {
        AppointmentView {
            id: appointment.id,
            date: appointment.appointment_date.to_string(),
            time: appointment.start_time_label(),
            status: appointment.state.status_label(),
            payment_status: appointment.state.payment_label(),
            meeting_link: appointment.meeting_link.clone(),
        }
    }
}

pub async fn create_order(
    Extension(pool): Extension<PgPool>,
    Extension(config): Extension<Arc<AppConfig>>,
    Extension(payments): Extension<PaymentsHandle>,
    user: AuthUser,
    Json(payload): Json<CreateOrderRequest>,
) -> AppResult<(StatusCode, Json<CreateOrderResponse>)> {
    let payments_client = payments.require()?;
    let processor = config
        .paypal
        .as_ref()
        .ok_or_else(|| AppError::Config("payment processor credentials missing".to_string()))?;

    let now = Utc::now();
    let new = validated_booking(&user, &payload, &config.booking, now)?;
    let amount = new.amount_cents;
    let currency = new.currency.clone();

    let store = AppointmentStore::new(pool);
    let appointment = store
        .create_pending(new, now, config.booking.hold_ttl_minutes)
        .await?;

    let order = match payments_client
        .create_order(
            &appointment.id.to_string(),
            amount,
            &currency,
            &processor.return_url,
            &processor.cancel_url,
        )
        .await
    {
        Ok(order) => order,
        Err(err) => {
            // a hold without an order would block the slot for a full TTL
            warn!(?err, appointment = %appointment.id, "failed to open payment order, releasing hold");
            let _ = store.delete_if_pending(appointment.id, user.user_id).await;
            return Err(AppError::PaymentProvider(err.to_string()));
        }
    };
    store
        .set_external_order(appointment.id, &order.order_id)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateOrderResponse {
            order_id: order.order_id,
            approval_url: order.approval_url,
            appointment_id: appointment.id,
            amount,
            currency,
        }),
    ))
}

pub async fn capture_order(
    Extension(pool): Extension<PgPool>,
    Extension(payments): Extension<PaymentsHandle>,
    Extension(calendar): Extension<CalendarHandle>,
    user: AuthUser,
    Json(payload): Json<CaptureOrderRequest>,
) -> AppResult<Json<CaptureOrderResponse>> {
    let payments_client = payments.require()?;
    let store = AppointmentStore::new(pool);
    let request = workflow::CaptureRequest {
        order_id: payload.order_id,
        appointment_id: payload.appointment_id,
        category_id: payload.category_id,
        category_name: payload.category_name,
        form_answers: payload.form_answers,
    };
    let appointment = workflow::capture_payment(
        &store,
        payments_client.as_ref(),
        calendar.get().map(|client| client.as_ref()),
        user.user_id,
        request,
    )
    .await?;
    Ok(Json(CaptureOrderResponse {
        appointment: AppointmentView::from(&appointment),
    }))
}

pub async fn cancel_order(
    Extension(pool): Extension<PgPool>,
    user: AuthUser,
    Json(payload): Json<CancelOrderRequest>,
) -> AppResult<StatusCode> {
    let store = AppointmentStore::new(pool);
    if store
        .delete_if_pending(payload.appointment_id, user.user_id)
        .await?
    {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::appointment_not_found())
    }
}

/// Post-confirmation cancellation, guarded by the cutoff window. Pending holds
/// cancel the same way they would via cancel-order; failed-payment rows stay
/// for audit.
pub async fn cancel_appointment(
    Extension(pool): Extension<PgPool>,
    Extension(config): Extension<Arc<AppConfig>>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<StatusCode> {
    let store = AppointmentStore::new(pool);
    let appointment = store
        .find_owned(id, user.user_id)
        .await?
        .ok_or_else(AppError::appointment_not_found)?;

    match appointment.state {
        ReservationState::PendingPayment => {
            if store.delete_if_pending(id, user.user_id).await? {
                Ok(StatusCode::NO_CONTENT)
            } else {
                Err(AppError::appointment_not_found())
            }
        }
        ReservationState::Confirmed { .. } => {
            let remaining =
                hours_until_start(&appointment, config.booking.timezone, Utc::now());
            if remaining < config.booking.cancellation_cutoff_hours as f64 {
                return Err(AppError::CancellationTooLate {
                    hours_remaining: (remaining.max(0.0) * 10.0).round() / 10.0,
                });
            }
            if store.delete_confirmed(id, user.user_id).await? {
                Ok(StatusCode::NO_CONTENT)
            } else {
                Err(AppError::appointment_not_found())
            }
        }
        ReservationState::PaymentFailed => Err(AppError::appointment_not_found()),
    }
}

pub async fn appointment_status(
    Extension(pool): Extension<PgPool>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<CaptureOrderResponse>> {
    let store = AppointmentStore::new(pool);
    let appointment = store
        .find_owned(id, user.user_id)
        .await?
        .ok_or_else(AppError::appointment_not_found)?;
    Ok(Json(CaptureOrderResponse {
        appointment: AppointmentView::from(&appointment),
    }))
}

/// Explicit meeting-link re-request. Unlike the capture-time attempt, this
/// path surfaces calendar failures to the caller.
pub async fn refresh_meeting_link(
    Extension(pool): Extension<PgPool>,
    Extension(calendar): Extension<CalendarHandle>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<MeetingLinkResponse>> {
    let calendar_client = calendar.require()?;
    let store = AppointmentStore::new(pool);
    let appointment = store
        .find_owned(id, user.user_id)
        .await?
        .ok_or_else(AppError::appointment_not_found)?;
    if !appointment.state.is_confirmed() {
        return Err(AppError::InvalidTransition(
            "meeting links attach to confirmed appointments".to_string(),
        ));
    }

    let updated = workflow::provision_meeting_link(&store, calendar_client, &appointment).await?;
    match (updated.meeting_link, updated.calendar_event_id) {
        (Some(meeting_link), Some(event_id)) => Ok(Json(MeetingLinkResponse {
            meeting_link,
            event_id,
        })),
        _ => Err(AppError::Calendar(
            "calendar service returned an incomplete event".to_string(),
        )),
    }
}

/// Service-triggered reap of expired unpaid holds.
pub async fn cleanup_pending(
    Extension(pool): Extension<PgPool>,
    Extension(config): Extension<Arc<AppConfig>>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<CleanupResponse>> {
    verify_cleanup_signature(&config.cleanup.signing_secret, &headers, &body)?;
    let store = AppointmentStore::new(pool);
    let deleted_count =
        sweeper::process_tick(&store, Utc::now(), config.booking.hold_ttl_minutes).await?;
    Ok(Json(CleanupResponse { deleted_count }))
}

fn hours_until_start(appointment: &Appointment, fallback: Tz, now: DateTime<Utc>) -> f64 {
    let start = appointment.start_instant(fallback);
    (start - now).num_minutes() as f64 / 60.0
}

fn verify_cleanup_signature(secret: &str, headers: &HeaderMap, body: &[u8]) -> AppResult<()> {
    let signature = headers
        .get("x-cleanup-signature")
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| {
            AppError::validation("MISSING_SIGNATURE", "missing x-cleanup-signature header")
        })?;
    let expected = {
        let mut mac =
            Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC can use any key length");
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    };
    if expected != signature {
        return Err(AppError::Unauthorized);
    }
    Ok(())
}

fn validated_booking(
    user: &AuthUser,
    req: &CreateOrderRequest,
    rules: &BookingRules,
    now: DateTime<Utc>,
) -> AppResult<NewAppointment> {
    let date = parse_date(&req.date)?;
    ensure_bookable_date(date, rules.timezone, now)?;

    let user_email = req.user_email.trim();
    let user_name = req.user_name.trim();
    if user_email.is_empty() || user_name.is_empty() {
        return Err(AppError::validation(
            "MISSING_FIELD",
            "userEmail and userName are required",
        ));
    }

    req.timezone.parse::<Tz>().map_err(|_| {
        AppError::validation(
            "INVALID_TIMEZONE",
            format!("'{}' is not a known timezone", req.timezone),
        )
    })?;

    let start_time = parse_grid_time(&req.time, rules)?;

    let slot_len = rules.slot_minutes as i32;
    let duration = req.duration.unwrap_or(slot_len);
    if duration <= 0 || duration % slot_len != 0 {
        return Err(AppError::validation(
            "INVALID_DURATION",
            format!("duration must be a positive multiple of {slot_len} minutes"),
        ));
    }
    let slot_count = (duration / slot_len) as usize;

    let booked_slots = match &req.slots {
        Some(raw_slots) => {
            let mut slots = Vec::with_capacity(raw_slots.len());
            for raw in raw_slots {
                slots.push(parse_grid_time(raw, rules)?);
            }
            slots.sort();
            slots.dedup();
            if slots.len() != slot_count {
                return Err(AppError::validation(
                    "INVALID_DURATION",
                    "slots must cover exactly the booked duration",
                ));
            }
            if !slots.contains(&start_time) {
                return Err(AppError::validation(
                    "INVALID_TIME",
                    "slots must include the start time",
                ));
            }
            slots
        }
        None => consecutive_slots(start_time, slot_count, rules)?,
    };

    let amount_cents = req.price.unwrap_or(rules.default_price_cents);
    if amount_cents <= 0 {
        return Err(AppError::validation(
            "INVALID_AMOUNT",
            "price must be positive",
        ));
    }

    Ok(NewAppointment {
        user_id: user.user_id,
        user_email: user_email.to_string(),
        user_name: user_name.to_string(),
        appointment_date: date,
        start_time,
        duration_minutes: duration,
        timezone: req.timezone.clone(),
        booked_slots,
        amount_cents,
        currency: rules.currency.clone(),
    })
}

fn parse_grid_time(raw: &str, rules: &BookingRules) -> AppResult<NaiveTime> {
    if !TIME_FORMAT.is_match(raw) {
        return Err(AppError::validation(
            "INVALID_TIME",
            format!("'{raw}' is not a valid HH:MM time"),
        ));
    }
    let time = NaiveTime::parse_from_str(raw, "%H:%M")
        .map_err(|_| AppError::validation("INVALID_TIME", format!("'{raw}' is not a valid time")))?;
    if time < rules.open_time || time >= rules.close_time {
        return Err(AppError::validation(
            "OUTSIDE_BUSINESS_HOURS",
            format!("'{raw}' is outside business hours"),
        ));
    }
    let offset = (time - rules.open_time).num_minutes();
    if offset % rules.slot_minutes as i64 != 0 {
        return Err(AppError::validation(
            "INVALID_TIME",
            format!("'{raw}' is not on the booking grid"),
        ));
    }
    Ok(time)
}

fn consecutive_slots(
    start: NaiveTime,
    count: usize,
    rules: &BookingRules,
) -> AppResult<Vec<NaiveTime>> {
    let step = Duration::minutes(rules.slot_minutes as i64);
    let mut slots = Vec::with_capacity(count);
    let mut cursor = start;
    for index in 0..count {
        if cursor >= rules.close_time {
            return Err(AppError::validation(
                "OUTSIDE_BUSINESS_HOURS",
                "the booked duration runs past closing time",
            ));
        }
        slots.push(cursor);
        if index + 1 < count {
            let (next, wrapped) = cursor.overflowing_add_signed(step);
            if wrapped != 0 {
                return Err(AppError::validation(
                    "OUTSIDE_BUSINESS_HOURS",
                    "the booked duration runs past closing time",
                ));
            }
            cursor = next;
        }
    }
    Ok(slots)
}
