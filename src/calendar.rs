use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::json;

use crate::appointments::models::Appointment;
use crate::config::CalendarConfig;
use crate::error::AppError;

/// Client for the calendar service that mints meeting links.
///
/// Callers decide fatality: the capture workflow swallows failures, the
/// explicit re-request endpoint surfaces them.
pub struct CalendarClient {
    client: reqwest::Client,
    base_url: String,
    service_token: String,
    organizer_email: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeetingEvent {
    pub link: String,
    pub event_id: String,
}

impl CalendarClient {
    pub fn new(config: &CalendarConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build calendar client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            service_token: config.service_token.clone(),
            organizer_email: config.organizer_email.clone(),
        })
    }

    pub async fn create_event(&self, appointment: &Appointment) -> Result<MeetingEvent> {
        let payload = json!({
            "summary": format!("Appointment with {}", appointment.user_name),
            "date": appointment.appointment_date.to_string(),
            "startTime": appointment.start_time_label(),
            "durationMinutes": appointment.duration_minutes,
            "timezone": appointment.timezone,
            "organizer": self.organizer_email,
            "attendee": {
                "email": appointment.user_email,
                "name": appointment.user_name,
            },
        });

        let response = self
            .client
            .post(format!("{}/events", self.base_url))
            .bearer_auth(&self.service_token)
            .json(&payload)
            .send()
            .await
            .context("failed to contact calendar service")?
            .error_for_status()
            .context("calendar service rejected event creation")?;

        let event: MeetingEvent = response
            .json()
            .await
            .context("calendar service returned an unexpected body")?;
        Ok(event)
    }
}

/// Extension-injected handle; absent when no calendar service is configured.
#[derive(Clone)]
pub struct CalendarHandle(Option<Arc<CalendarClient>>);

impl CalendarHandle {
    pub fn new(inner: Option<Arc<CalendarClient>>) -> Self {
        Self(inner)
    }

    pub fn from_config(config: Option<&CalendarConfig>) -> Result<Self> {
        match config {
            Some(config) => Ok(Self(Some(Arc::new(CalendarClient::new(config)?)))),
            None => {
                tracing::warn!("calendar service not configured; meeting links will be skipped");
                Ok(Self(None))
            }
        }
    }

    pub fn get(&self) -> Option<&Arc<CalendarClient>> {
        self.0.as_ref()
    }

    pub fn require(&self) -> Result<&Arc<CalendarClient>, AppError> {
        self.0
            .as_ref()
            .ok_or_else(|| AppError::Config("calendar service is not configured".to_string()))
    }
}
