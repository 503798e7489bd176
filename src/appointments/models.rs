use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{FromRow, Row};
use uuid::Uuid;

/// A booked (or in-flight) appointment for the shared resource.
///
/// The storage layer keeps `status` and `payment_status` as two text columns
/// for audit queries; in Rust the reachable combinations collapse into
/// [`ReservationState`] so illegal pairs cannot be constructed.
#[derive(Debug, Clone)]
pub struct Appointment {
    pub id: Uuid,
    pub user_id: i32,
    pub user_email: String,
    pub user_name: String,
    pub appointment_date: NaiveDate,
    pub start_time: NaiveTime,
    pub duration_minutes: i32,
    pub timezone: String,
    pub booked_slots: Vec<String>,
    pub state: ReservationState,
    pub amount_cents: i32,
    pub currency: String,
    pub external_order_id: Option<String>,
    pub meeting_link: Option<String>,
    pub calendar_event_id: Option<String>,
    pub category_id: Option<String>,
    pub category_name: Option<String>,
    pub form_answers: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The reachable (status, payment_status) pairs of the reservation lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub enum ReservationState {
    /// Unpaid hold; blocks its slots until it ages past the TTL.
    PendingPayment,
    /// Verified capture; confirmation and completion are one transition.
    Confirmed {
        payer_id: Option<String>,
        transaction_id: Option<String>,
        paid_at: DateTime<Utc>,
    },
    /// Negative capture result. Terminal for payment; the row stays for audit
    /// but no longer blocks its slots.
    PaymentFailed,
}

impl ReservationState {
    pub fn from_columns(
        status: &str,
        payment_status: &str,
        payer_id: Option<String>,
        transaction_id: Option<String>,
        paid_at: Option<DateTime<Utc>>,
    ) -> Result<Self, String> {
        match (status, payment_status) {
            ("pending", "pending") => Ok(ReservationState::PendingPayment),
            ("pending", "failed") => Ok(ReservationState::PaymentFailed),
            ("confirmed", "completed") => {
                let paid_at = paid_at
                    .ok_or_else(|| "confirmed appointment without paid_at".to_string())?;
                Ok(ReservationState::Confirmed {
                    payer_id,
                    transaction_id,
                    paid_at,
                })
            }
            (status, payment_status) => Err(format!(
                "unreachable state pair ({status}, {payment_status})"
            )),
        }
    }

    pub fn status_label(&self) -> &'static str {
        match self {
            ReservationState::PendingPayment | ReservationState::PaymentFailed => "pending",
            ReservationState::Confirmed { .. } => "confirmed",
        }
    }

    pub fn payment_label(&self) -> &'static str {
        match self {
            ReservationState::PendingPayment => "pending",
            ReservationState::Confirmed { .. } => "completed",
            ReservationState::PaymentFailed => "failed",
        }
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self, ReservationState::Confirmed { .. })
    }
}

impl Appointment {
    /// Resolves the start instant in the appointment's own zone, falling back
    /// to the business zone when the stored name does not parse.
    pub fn start_instant(&self, fallback: Tz) -> DateTime<Utc> {
        let zone: Tz = self.timezone.parse().unwrap_or(fallback);
        let local = self.appointment_date.and_time(self.start_time);
        zone.from_local_datetime(&local)
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|| Utc.from_utc_datetime(&local))
    }

    pub fn start_time_label(&self) -> String {
        format_slot(self.start_time)
    }
}

impl FromRow<'_, PgRow> for Appointment {
    fn from_row(row: &PgRow) -> Result<Self, sqlx::Error> {
        let status: String = row.try_get("status")?;
        let payment_status: String = row.try_get("payment_status")?;
        let state = ReservationState::from_columns(
            &status,
            &payment_status,
            row.try_get("external_payer_id")?,
            row.try_get("external_transaction_id")?,
            row.try_get("paid_at")?,
        )
        .map_err(|message| sqlx::Error::Decode(message.into()))?;

        Ok(Appointment {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            user_email: row.try_get("user_email")?,
            user_name: row.try_get("user_name")?,
            appointment_date: row.try_get("appointment_date")?,
            start_time: row.try_get("start_time")?,
            duration_minutes: row.try_get("duration_minutes")?,
            timezone: row.try_get("timezone")?,
            booked_slots: row.try_get("booked_slots")?,
            state,
            amount_cents: row.try_get("amount_cents")?,
            currency: row.try_get("currency")?,
            external_order_id: row.try_get("external_order_id")?,
            meeting_link: row.try_get("meeting_link")?,
            calendar_event_id: row.try_get("calendar_event_id")?,
            category_id: row.try_get("category_id")?,
            category_name: row.try_get("category_name")?,
            form_answers: row.try_get("form_answers")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Input for a new unpaid hold; field validation happens at the API layer.
#[derive(Debug, Clone)]
pub struct NewAppointment {
    pub user_id: i32,
    pub user_email: String,
    pub user_name: String,
    pub appointment_date: NaiveDate,
    pub start_time: NaiveTime,
    pub duration_minutes: i32,
    pub timezone: String,
    pub booked_slots: Vec<NaiveTime>,
    pub amount_cents: i32,
    pub currency: String,
}

/// Capture metadata recorded on the confirm transition.
#[derive(Debug, Clone, Default)]
pub struct CaptureMetadata {
    pub payer_id: Option<String>,
    pub transaction_id: Option<String>,
    pub category_id: Option<String>,
    pub category_name: Option<String>,
    pub form_answers: Option<Value>,
}

pub fn format_slot(time: NaiveTime) -> String {
    time.format("%H:%M").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reachable_pairs_decode() {
        assert_eq!(
            ReservationState::from_columns("pending", "pending", None, None, None).unwrap(),
            ReservationState::PendingPayment
        );
        assert_eq!(
            ReservationState::from_columns("pending", "failed", None, None, None).unwrap(),
            ReservationState::PaymentFailed
        );
        let state = ReservationState::from_columns(
            "confirmed",
            "completed",
            Some("PAYER1".into()),
            Some("TXN1".into()),
            Some(Utc::now()),
        )
        .unwrap();
        assert!(state.is_confirmed());
        assert_eq!(state.payment_label(), "completed");
    }

    #[test]
    fn illegal_pairs_are_rejected() {
        assert!(ReservationState::from_columns("confirmed", "pending", None, None, None).is_err());
        assert!(ReservationState::from_columns("pending", "completed", None, None, None).is_err());
        assert!(
            ReservationState::from_columns("confirmed", "completed", None, None, None).is_err(),
            "confirmed requires a paid_at instant"
        );
    }

    #[test]
    fn start_instant_honors_stored_zone() {
        let appt = Appointment {
            id: Uuid::new_v4(),
            user_id: 1,
            user_email: "a@example.com".into(),
            user_name: "A".into(),
            appointment_date: NaiveDate::from_ymd_opt(2024, 6, 10).unwrap(),
            start_time: NaiveTime::from_hms_opt(10, 0, 0).unwrap(),
            duration_minutes: 30,
            timezone: "America/New_York".into(),
            booked_slots: vec!["10:00".into()],
            state: ReservationState::PendingPayment,
            amount_cents: 5000,
            currency: "USD".into(),
            external_order_id: None,
            meeting_link: None,
            calendar_event_id: None,
            category_id: None,
            category_name: None,
            form_answers: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        // 10:00 EDT == 14:00 UTC
        let start = appt.start_instant(chrono_tz::UTC);
        assert_eq!(start.format("%H:%M").to_string(), "14:00");
    }
}
