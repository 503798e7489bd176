use anyhow::{bail, Context, Result};
use chrono::NaiveTime;
use chrono_tz::Tz;
use url::Url;

/// Immutable application configuration, built once at startup and passed by
/// reference into handlers and collaborator clients.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_address: String,
    pub bind_port: u16,
    pub jwt_secret: String,
    pub allow_migration_failure: bool,
    pub booking: BookingRules,
    pub cleanup: CleanupConfig,
    pub paypal: Option<PayPalConfig>,
    pub calendar: Option<CalendarConfig>,
}

/// Business rules for the bookable grid and its lifecycle windows.
#[derive(Debug, Clone)]
pub struct BookingRules {
    /// IANA zone used for "today" comparisons and as the fallback zone for
    /// stored appointments.
    pub timezone: Tz,
    pub open_time: NaiveTime,
    /// Exclusive end of the grid; the last bookable start is one slot before.
    pub close_time: NaiveTime,
    pub slot_minutes: u32,
    pub hold_ttl_minutes: i64,
    pub cancellation_cutoff_hours: i64,
    pub default_price_cents: i32,
    pub currency: String,
}

#[derive(Debug, Clone)]
pub struct CleanupConfig {
    pub interval_secs: u64,
    /// Shared secret for the HMAC signature on the service-triggered cleanup
    /// endpoint.
    pub signing_secret: String,
}

/// Payment processor credentials. Absent entirely when the processor is not
/// configured; handlers surface that as a configuration error.
#[derive(Debug, Clone)]
pub struct PayPalConfig {
    pub client_id: String,
    pub client_secret: String,
    pub base_url: String,
    pub return_url: String,
    pub cancel_url: String,
}

/// Calendar-service identity for the meeting link provisioner.
#[derive(Debug, Clone)]
pub struct CalendarConfig {
    pub base_url: String,
    pub service_token: String,
    pub organizer_email: String,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let jwt_secret = read_required_env("JWT_SECRET")?;

        let bind_address =
            read_optional_env("BIND_ADDRESS").unwrap_or_else(|| "0.0.0.0".to_string());
        let bind_port = read_parsed_env("BIND_PORT").unwrap_or(3000);
        let allow_migration_failure = read_bool_env("ALLOW_MIGRATION_FAILURE");

        let booking = BookingRules::from_env()?;
        let cleanup = CleanupConfig {
            interval_secs: read_parsed_env::<u64>("CLEANUP_INTERVAL_SECS")
                .filter(|value| *value > 0)
                .unwrap_or(300),
            signing_secret: read_required_env("CLEANUP_SIGNING_SECRET")?,
        };

        Ok(Self {
            bind_address,
            bind_port,
            jwt_secret,
            allow_migration_failure,
            booking,
            cleanup,
            paypal: PayPalConfig::from_env()?,
            calendar: CalendarConfig::from_env(),
        })
    }
}

impl BookingRules {
    fn from_env() -> Result<Self> {
        let timezone: Tz = read_optional_env("BOOKING_TIMEZONE")
            .unwrap_or_else(|| "UTC".to_string())
            .parse()
            .map_err(|err| anyhow::anyhow!("BOOKING_TIMEZONE is not a valid zone: {err}"))?;

        let open_time = parse_time_env("BOOKING_OPEN_TIME", "09:00")?;
        let close_time = parse_time_env("BOOKING_CLOSE_TIME", "18:00")?;
        if close_time <= open_time {
            bail!("BOOKING_CLOSE_TIME must be after BOOKING_OPEN_TIME");
        }

        let slot_minutes = read_parsed_env::<u32>("BOOKING_SLOT_MINUTES")
            .filter(|value| *value > 0 && 60 % *value == 0)
            .unwrap_or(30);

        Ok(Self {
            timezone,
            open_time,
            close_time,
            slot_minutes,
            hold_ttl_minutes: read_parsed_env::<i64>("BOOKING_HOLD_TTL_MINUTES")
                .filter(|value| *value > 0)
                .unwrap_or(15),
            cancellation_cutoff_hours: read_parsed_env::<i64>("BOOKING_CANCEL_CUTOFF_HOURS")
                .filter(|value| *value > 0)
                .unwrap_or(1),
            default_price_cents: read_parsed_env::<i32>("BOOKING_DEFAULT_PRICE_CENTS")
                .filter(|value| *value > 0)
                .unwrap_or(5000),
            currency: read_optional_env("BOOKING_CURRENCY").unwrap_or_else(|| "USD".to_string()),
        })
    }
}

impl PayPalConfig {
    /// Present only when both credentials are set, mirroring the optional
    /// collaborator pattern used for the calendar client.
    fn from_env() -> Result<Option<Self>> {
        let client_id = read_optional_env("PAYPAL_CLIENT_ID");
        let client_secret = read_secret_env("PAYPAL_CLIENT_SECRET", "PAYPAL_CLIENT_SECRET_FILE")?;
        let (client_id, client_secret) = match (client_id, client_secret) {
            (Some(id), Some(secret)) => (id, secret),
            (None, None) => return Ok(None),
            _ => bail!("PAYPAL_CLIENT_ID and PAYPAL_CLIENT_SECRET must be set together"),
        };

        let base_url = read_url_env("PAYPAL_BASE_URL", "https://api-m.sandbox.paypal.com")?;
        let return_url = read_url_env("PAYPAL_RETURN_URL", "http://localhost:3000/booking/return")?;
        let cancel_url = read_url_env("PAYPAL_CANCEL_URL", "http://localhost:3000/booking/cancel")?;

        Ok(Some(Self {
            client_id,
            client_secret,
            base_url,
            return_url,
            cancel_url,
        }))
    }
}

impl CalendarConfig {
    fn from_env() -> Option<Self> {
        let base_url = read_optional_env("CALENDAR_BASE_URL")?;
        let service_token = read_optional_env("CALENDAR_SERVICE_TOKEN")?;
        Some(Self {
            base_url,
            service_token,
            organizer_email: read_optional_env("CALENDAR_ORGANIZER_EMAIL")
                .unwrap_or_else(|| "bookings@localhost".to_string()),
        })
    }
}

fn read_optional_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn read_required_env(key: &str) -> Result<String> {
    read_optional_env(key).with_context(|| format!("{key} is not set"))
}

fn read_parsed_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    read_optional_env(key).and_then(|value| value.parse::<T>().ok())
}

fn read_bool_env(key: &str) -> bool {
    read_optional_env(key)
        .map(|value| matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

fn read_secret_env(value_key: &str, file_key: &str) -> Result<Option<String>> {
    if let Some(path) = read_optional_env(file_key) {
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {file_key} from {path}"))?;
        let trimmed = contents.trim().to_string();
        if !trimmed.is_empty() {
            return Ok(Some(trimmed));
        }
    }
    Ok(read_optional_env(value_key))
}

fn parse_time_env(key: &str, default_value: &str) -> Result<NaiveTime> {
    let raw = read_optional_env(key).unwrap_or_else(|| default_value.to_string());
    NaiveTime::parse_from_str(&raw, "%H:%M")
        .with_context(|| format!("{key} must be HH:MM, got '{raw}'"))
}

fn read_url_env(key: &str, default_value: &str) -> Result<String> {
    let raw = read_optional_env(key).unwrap_or_else(|| default_value.to_string());
    let url = Url::parse(&raw).with_context(|| format!("{key} is not a valid URL: '{raw}'"))?;
    Ok(url.to_string().trim_end_matches('/').to_string())
}
