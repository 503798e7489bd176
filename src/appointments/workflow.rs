use chrono::Utc;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use super::models::{Appointment, CaptureMetadata, ReservationState};
use super::store::AppointmentStore;
use crate::calendar::CalendarClient;
use crate::error::{AppError, AppResult};
use crate::payments::{CaptureStatus, PaymentOrders};

#[derive(Debug)]
pub struct CaptureRequest {
    pub order_id: String,
    pub appointment_id: Uuid,
    pub category_id: Option<String>,
    pub category_name: Option<String>,
    pub form_answers: Option<Value>,
}

/// Reconciles a processor order with its appointment.
///
/// Idempotent under client retries and concurrent invocations: an already
/// confirmed appointment short-circuits, the processor's already-captured
/// rejection is replayed from the fetched order state, and losing the confirm
/// UPDATE race converges on the winner's row. Capture is never retried
/// blindly.
pub async fn capture_payment(
    store: &AppointmentStore,
    payments: &dyn PaymentOrders,
    calendar: Option<&CalendarClient>,
    user_id: i32,
    request: CaptureRequest,
) -> AppResult<Appointment> {
    let appointment = store
        .find_owned(request.appointment_id, user_id)
        .await?
        .ok_or_else(AppError::appointment_not_found)?;
    if appointment.external_order_id.as_deref() != Some(request.order_id.as_str()) {
        return Err(AppError::appointment_not_found());
    }

    match appointment.state {
        ReservationState::Confirmed { .. } => return Ok(appointment),
        ReservationState::PaymentFailed => {
            return Err(AppError::InvalidTransition(
                "payment already failed for this appointment".to_string(),
            ))
        }
        ReservationState::PendingPayment => {}
    }

    let outcome = payments.capture_order(&request.order_id).await?;

    if outcome.already_captured {
        // a concurrent call may have finished the transition while the
        // processor was telling us the order was not capturable twice
        let current = store
            .find_owned(request.appointment_id, user_id)
            .await?
            .ok_or_else(AppError::appointment_not_found)?;
        if current.state.is_confirmed() {
            return Ok(current);
        }
    }

    match outcome.status {
        CaptureStatus::Completed => {
            let meta = CaptureMetadata {
                payer_id: outcome.payer_id,
                transaction_id: outcome.transaction_id,
                category_id: request.category_id,
                category_name: request.category_name,
                form_answers: request.form_answers,
            };
            let appointment = match store
                .confirm_completed(appointment.id, &meta, Utc::now())
                .await?
            {
                Some(appointment) => {
                    info!(
                        appointment = %appointment.id,
                        order = %request.order_id,
                        "payment captured, appointment confirmed"
                    );
                    appointment
                }
                None => {
                    // lost the confirm race; converge on the winner's state
                    let current = store
                        .find_owned(request.appointment_id, user_id)
                        .await?
                        .ok_or_else(AppError::appointment_not_found)?;
                    if current.state.is_confirmed() {
                        return Ok(current);
                    }
                    return Err(AppError::InvalidTransition(
                        "appointment is no longer awaiting payment".to_string(),
                    ));
                }
            };

            // single attempt, decoupled from the payment-critical path
            if let Some(calendar) = calendar {
                match provision_meeting_link(store, calendar, &appointment).await {
                    Ok(updated) => return Ok(updated),
                    Err(err) => {
                        warn!(
                            ?err,
                            appointment = %appointment.id,
                            "meeting link provisioning failed after capture"
                        );
                    }
                }
            }
            Ok(appointment)
        }
        CaptureStatus::Other(raw) => {
            if store.mark_payment_failed(appointment.id).await? {
                info!(
                    appointment = %appointment.id,
                    provider_status = %raw,
                    "capture reported a non-completed status"
                );
            }
            Err(AppError::PaymentNotCompleted {
                provider_status: raw,
            })
        }
    }
}

/// Creates (or regenerates) the meeting artifact; link and event id are
/// replaced together in one UPDATE.
pub async fn provision_meeting_link(
    store: &AppointmentStore,
    calendar: &CalendarClient,
    appointment: &Appointment,
) -> AppResult<Appointment> {
    let event = calendar
        .create_event(appointment)
        .await
        .map_err(|err| AppError::Calendar(err.to_string()))?;
    store
        .attach_meeting_artifact(appointment.id, &event.link, &event.event_id)
        .await?
        .ok_or_else(|| {
            AppError::InvalidTransition("meeting links attach to confirmed appointments".to_string())
        })
}
