use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::models::{format_slot, Appointment, CaptureMetadata, NewAppointment};
use crate::error::{AppError, AppResult};

/// Persistence layer for appointments and their slot ledger.
///
/// Read-then-write pre-checks here are advisory; the authoritative tie-break
/// for concurrent bookings is the `appointment_slots` primary key, whose
/// violation is remapped to the same Conflict the pre-check raises.
#[derive(Clone)]
pub struct AppointmentStore {
    pool: PgPool,
}

impl AppointmentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates an unpaid hold for the requested slots.
    ///
    /// Runs in one transaction: expired holds overlapping the target slots are
    /// reaped first, so a ledger-constraint violation always means a live
    /// competitor won the race.
    pub async fn create_pending(
        &self,
        new: NewAppointment,
        now: DateTime<Utc>,
        hold_ttl_minutes: i64,
    ) -> AppResult<Appointment> {
        let cutoff = now - Duration::minutes(hold_ttl_minutes);
        let slot_labels: Vec<String> = new.booked_slots.iter().copied().map(format_slot).collect();

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            DELETE FROM appointments
            WHERE appointment_date = $1
              AND status = 'pending'
              AND payment_status = 'pending'
              AND created_at < $2
              AND booked_slots && $3
            "#,
        )
        .bind(new.appointment_date)
        .bind(cutoff)
        .bind(&slot_labels)
        .execute(&mut tx)
        .await?;

        let duplicate_date: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM appointments
                WHERE user_id = $1 AND appointment_date = $2 AND status = 'confirmed'
            )
            "#,
        )
        .bind(new.user_id)
        .bind(new.appointment_date)
        .fetch_one(&mut tx)
        .await?;
        if duplicate_date {
            return Err(AppError::conflict(
                "DUPLICATE_DATE_BOOKING",
                "a confirmed appointment already exists for this user on this date",
            ));
        }

        let taken: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM appointment_slots s
            JOIN appointments a ON a.id = s.appointment_id
            WHERE s.appointment_date = $1
              AND s.slot_time = ANY($2)
              AND (a.status = 'confirmed'
                   OR (a.status = 'pending' AND a.payment_status = 'pending' AND a.created_at >= $3))
            "#,
        )
        .bind(new.appointment_date)
        .bind(&new.booked_slots)
        .bind(cutoff)
        .fetch_one(&mut tx)
        .await?;
        if taken > 0 {
            return Err(AppError::conflict(
                "SLOT_UNAVAILABLE",
                "one or more requested slots are already reserved",
            ));
        }

        let id = Uuid::new_v4();
        let appointment = sqlx::query_as::<_, Appointment>(
            r#"
            INSERT INTO appointments (
                id, user_id, user_email, user_name, appointment_date, start_time,
                duration_minutes, timezone, booked_slots, status, payment_status,
                amount_cents, currency, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, 'pending', 'pending', $10, $11, $12, $12)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(new.user_id)
        .bind(&new.user_email)
        .bind(&new.user_name)
        .bind(new.appointment_date)
        .bind(new.start_time)
        .bind(new.duration_minutes)
        .bind(&new.timezone)
        .bind(&slot_labels)
        .bind(new.amount_cents)
        .bind(&new.currency)
        .bind(now)
        .fetch_one(&mut tx)
        .await
        .map_err(remap_constraints)?;

        sqlx::query(
            r#"
            INSERT INTO appointment_slots (appointment_id, appointment_date, slot_time)
            SELECT $1, $2, t.slot FROM UNNEST($3::time[]) AS t(slot)
            "#,
        )
        .bind(id)
        .bind(new.appointment_date)
        .bind(&new.booked_slots)
        .execute(&mut tx)
        .await
        .map_err(remap_constraints)?;

        tx.commit().await?;
        Ok(appointment)
    }

    /// The (pending, pending) -> (confirmed, completed) transition as one
    /// guarded UPDATE. Returns None when no pending row matched; the caller
    /// decides between an idempotent re-read and InvalidTransition.
    pub async fn confirm_completed(
        &self,
        id: Uuid,
        meta: &CaptureMetadata,
        paid_at: DateTime<Utc>,
    ) -> AppResult<Option<Appointment>> {
        let row = sqlx::query_as::<_, Appointment>(
            r#"
            UPDATE appointments SET
                status = 'confirmed',
                payment_status = 'completed',
                external_payer_id = $2,
                external_transaction_id = $3,
                paid_at = $4,
                category_id = COALESCE($5, category_id),
                category_name = COALESCE($6, category_name),
                form_answers = COALESCE($7, form_answers),
                updated_at = NOW()
            WHERE id = $1 AND status = 'pending' AND payment_status = 'pending'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(&meta.payer_id)
        .bind(&meta.transaction_id)
        .bind(paid_at)
        .bind(&meta.category_id)
        .bind(&meta.category_name)
        .bind(&meta.form_answers)
        .fetch_optional(&self.pool)
        .await
        .map_err(remap_constraints)?;
        Ok(row)
    }

    /// The (pending, pending) -> (pending, failed) transition. Frees the slot
    /// ledger rows but keeps the appointment for audit/status queries.
    pub async fn mark_payment_failed(&self, id: Uuid) -> AppResult<bool> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            r#"
            UPDATE appointments SET payment_status = 'failed', updated_at = NOW()
            WHERE id = $1 AND status = 'pending' AND payment_status = 'pending'
            "#,
        )
        .bind(id)
        .execute(&mut tx)
        .await?
        .rows_affected();
        if updated == 0 {
            tx.rollback().await?;
            return Ok(false);
        }
        sqlx::query("DELETE FROM appointment_slots WHERE appointment_id = $1")
            .bind(id)
            .execute(&mut tx)
            .await?;
        tx.commit().await?;
        Ok(true)
    }

    pub async fn set_external_order(&self, id: Uuid, order_id: &str) -> AppResult<()> {
        let updated = sqlx::query(
            "UPDATE appointments SET external_order_id = $2, updated_at = NOW() WHERE id = $1",
        )
        .bind(id)
        .bind(order_id)
        .execute(&self.pool)
        .await
        .map_err(remap_constraints)?
        .rows_affected();
        if updated == 0 {
            return Err(AppError::appointment_not_found());
        }
        Ok(())
    }

    /// Replaces both meeting artifact fields together; only a confirmed
    /// appointment can carry one.
    pub async fn attach_meeting_artifact(
        &self,
        id: Uuid,
        link: &str,
        event_id: &str,
    ) -> AppResult<Option<Appointment>> {
        let row = sqlx::query_as::<_, Appointment>(
            r#"
            UPDATE appointments SET meeting_link = $2, calendar_event_id = $3, updated_at = NOW()
            WHERE id = $1 AND status = 'confirmed'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(link)
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Cancels an unpaid hold as one conditional delete; false when the row is
    /// confirmed, missing, or owned by someone else.
    pub async fn delete_if_pending(&self, id: Uuid, user_id: i32) -> AppResult<bool> {
        let deleted = sqlx::query(
            r#"
            DELETE FROM appointments
            WHERE id = $1 AND user_id = $2 AND status = 'pending' AND payment_status = 'pending'
            "#,
        )
        .bind(id)
        .bind(user_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(deleted > 0)
    }

    pub async fn delete_confirmed(&self, id: Uuid, user_id: i32) -> AppResult<bool> {
        let deleted = sqlx::query(
            "DELETE FROM appointments WHERE id = $1 AND user_id = $2 AND status = 'confirmed'",
        )
        .bind(id)
        .bind(user_id)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(deleted > 0)
    }

    /// Bulk reap of expired unpaid holds; idempotent, returns the removed count.
    pub async fn delete_expired_pending(&self, before: DateTime<Utc>) -> AppResult<u64> {
        let deleted = sqlx::query(
            r#"
            DELETE FROM appointments
            WHERE status = 'pending' AND payment_status = 'pending' AND created_at < $1
            "#,
        )
        .bind(before)
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(deleted)
    }

    pub async fn find_by_id(&self, id: Uuid) -> AppResult<Option<Appointment>> {
        let row = sqlx::query_as::<_, Appointment>("SELECT * FROM appointments WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn find_owned(&self, id: Uuid, user_id: i32) -> AppResult<Option<Appointment>> {
        let row = sqlx::query_as::<_, Appointment>(
            "SELECT * FROM appointments WHERE id = $1 AND user_id = $2",
        )
        .bind(id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Slots on a date blocked by a confirmed appointment or a live hold.
    pub async fn occupied_slots(
        &self,
        date: NaiveDate,
        hold_cutoff: DateTime<Utc>,
    ) -> AppResult<Vec<NaiveTime>> {
        let slots = sqlx::query_scalar::<_, NaiveTime>(
            r#"
            SELECT s.slot_time FROM appointment_slots s
            JOIN appointments a ON a.id = s.appointment_id
            WHERE s.appointment_date = $1
              AND (a.status = 'confirmed'
                   OR (a.status = 'pending' AND a.payment_status = 'pending' AND a.created_at >= $2))
            ORDER BY s.slot_time
            "#,
        )
        .bind(date)
        .bind(hold_cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(slots)
    }
}

fn remap_constraints(err: sqlx::Error) -> AppError {
    let mapped = match &err {
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505") => {
            match db.constraint() {
                Some("appointment_slots_pkey") => Some(AppError::conflict(
                    "SLOT_UNAVAILABLE",
                    "one or more requested slots are already reserved",
                )),
                Some("appointments_confirmed_user_date_idx") => Some(AppError::conflict(
                    "DUPLICATE_DATE_BOOKING",
                    "a confirmed appointment already exists for this user on this date",
                )),
                Some("appointments_external_order_idx") => Some(AppError::conflict(
                    "ORDER_ALREADY_LINKED",
                    "this payment order is already linked to an appointment",
                )),
                _ => None,
            }
        }
        _ => None,
    };
    mapped.unwrap_or(AppError::Db(err))
}
