use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::{Extension, Query};
use axum::Json;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::appointments::models::format_slot;
use crate::appointments::store::AppointmentStore;
use crate::config::{AppConfig, BookingRules};
use crate::error::{AppError, AppResult};

#[derive(Debug, Serialize)]
pub struct SlotAvailability {
    pub time: String,
    pub available: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilityResponse {
    pub slots: Vec<SlotAvailability>,
    pub date: String,
    pub total_slots: usize,
    pub available_count: usize,
}

#[derive(Debug, Deserialize)]
pub struct AvailabilityParams {
    pub date: String,
}

/// The bookable grid for one day: open time up to (exclusive) close time in
/// slot-length steps.
pub fn slot_grid(rules: &BookingRules) -> Vec<NaiveTime> {
    let step = Duration::minutes(rules.slot_minutes as i64);
    let mut slots = Vec::new();
    let mut cursor = rules.open_time;
    while cursor < rules.close_time {
        slots.push(cursor);
        let (next, wrapped) = cursor.overflowing_add_signed(step);
        if wrapped != 0 {
            break;
        }
        cursor = next;
    }
    slots
}

/// Overlays an occupied-slot snapshot onto the grid. Pure: the liveness
/// filtering (confirmed or unexpired hold) happens when the snapshot is read.
pub fn availability_overlay(
    grid: &[NaiveTime],
    occupied: &HashSet<NaiveTime>,
) -> Vec<SlotAvailability> {
    grid.iter()
        .map(|slot| SlotAvailability {
            time: format_slot(*slot),
            available: !occupied.contains(slot),
        })
        .collect()
}

pub fn parse_date(raw: &str) -> Result<NaiveDate, AppError> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| AppError::validation("INVALID_DATE", format!("'{raw}' is not a valid date")))
}

pub fn business_today(timezone: Tz, now: DateTime<Utc>) -> NaiveDate {
    now.with_timezone(&timezone).date_naive()
}

/// Dates before local midnight in the business zone are not bookable.
pub fn ensure_bookable_date(
    date: NaiveDate,
    timezone: Tz,
    now: DateTime<Utc>,
) -> Result<(), AppError> {
    if date < business_today(timezone, now) {
        return Err(AppError::validation(
            "PAST_DATE",
            "the requested date is in the past",
        ));
    }
    Ok(())
}

pub async fn get_availability(
    Extension(pool): Extension<PgPool>,
    Extension(config): Extension<Arc<AppConfig>>,
    Query(params): Query<AvailabilityParams>,
) -> AppResult<Json<AvailabilityResponse>> {
    let date = parse_date(&params.date)?;
    let now = Utc::now();
    ensure_bookable_date(date, config.booking.timezone, now)?;

    let cutoff = now - Duration::minutes(config.booking.hold_ttl_minutes);
    let store = AppointmentStore::new(pool);
    let occupied: HashSet<NaiveTime> = store
        .occupied_slots(date, cutoff)
        .await?
        .into_iter()
        .collect();

    let grid = slot_grid(&config.booking);
    let slots = availability_overlay(&grid, &occupied);
    let available_count = slots.iter().filter(|slot| slot.available).count();

    Ok(Json(AvailabilityResponse {
        date: date.to_string(),
        total_slots: slots.len(),
        available_count,
        slots,
    }))
}
