//! Device (sensor) catalog lookups.
//!
//! The scheduler only needs one thing from the catalog: when an endpoint is
//! next expected to check in, so it can start workers for the endpoints
//! that will answer soonest. [`get_device`] fetches a single device record
//! and [`JobTarget`] lets callers that already hold a [`Device`] pass it
//! straight to `submit_job` without a second lookup.
//!
//! Response sensors and Platform devices use different field names for the
//! same data; serde aliases fold both into one [`Device`] shape.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};

use crate::client::CbClient;
use crate::protocol::string_or_number;

/// A sensor or device as returned by the catalog.
#[derive(Debug, Clone, Deserialize)]
pub struct Device {
    /// Endpoint identifier used for live response sessions.
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,

    /// Host name.
    #[serde(default, alias = "computer_name", alias = "name")]
    pub hostname: Option<String>,

    /// Operating system family (e.g. `"WINDOWS"`).
    #[serde(default, alias = "os_environment_display_string")]
    pub os: Option<String>,

    /// Sensor status (e.g. `"Online"`, `"REGISTERED"`).
    #[serde(default)]
    pub status: Option<String>,

    /// When the sensor is next expected to contact the server.
    #[serde(default, deserialize_with = "lenient_timestamp")]
    pub next_checkin_time: Option<DateTime<Utc>>,

    /// When the sensor last contacted the server.
    #[serde(default, alias = "last_contact_time", deserialize_with = "lenient_timestamp")]
    pub last_checkin_time: Option<DateTime<Utc>>,
}

/// Parses RFC 3339 timestamps and the space-separated form used by older
/// servers (`2024-01-01 10:00:00.000000-05:00`). Anything else becomes
/// `None` so one odd record never fails the whole lookup.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.and_then(|s| parse_timestamp(&s)))
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%:z"))
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

/// What a job is aimed at: a bare endpoint ID, or a catalog record whose
/// check-in time is already known.
#[derive(Debug, Clone)]
pub struct JobTarget {
    /// Endpoint identifier.
    pub endpoint_id: String,
    /// Known next check-in, if any.
    pub next_checkin: Option<DateTime<Utc>>,
}

impl From<&str> for JobTarget {
    fn from(id: &str) -> Self {
        JobTarget {
            endpoint_id: id.to_string(),
            next_checkin: None,
        }
    }
}

impl From<String> for JobTarget {
    fn from(id: String) -> Self {
        JobTarget {
            endpoint_id: id,
            next_checkin: None,
        }
    }
}

impl From<u64> for JobTarget {
    fn from(id: u64) -> Self {
        JobTarget::from(id.to_string())
    }
}

impl From<&Device> for JobTarget {
    fn from(device: &Device) -> Self {
        JobTarget {
            endpoint_id: device.id.clone(),
            next_checkin: device.next_checkin_time,
        }
    }
}

impl From<Device> for JobTarget {
    fn from(device: Device) -> Self {
        JobTarget::from(&device)
    }
}

/// Retrieves a single device record from `path`.
///
/// # Errors
///
/// - `CbError::ObjectNotFound`: no such device.
/// - `CbError::Unauthorized` / `CbError::Server`: other non-success status.
/// - `CbError::Network`: transport failure.
pub async fn get_device(client: &CbClient, path: &str) -> crate::error::Result<Device> {
    client.get(path).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn response_sensor_deserializes() {
        let json = r#"{
            "id": 42,
            "computer_name": "WIN-DC01",
            "os_environment_display_string": "Windows Server 2019",
            "status": "Online",
            "next_checkin_time": "2024-03-01 10:00:30.123456-05:00",
            "last_checkin_time": "2024-03-01 10:00:00.000000-05:00"
        }"#;
        let device: Device = serde_json::from_str(json).unwrap();
        assert_eq!(device.id, "42");
        assert_eq!(device.hostname.as_deref(), Some("WIN-DC01"));
        assert_eq!(device.status.as_deref(), Some("Online"));
        let expected = Utc.with_ymd_and_hms(2024, 3, 1, 15, 0, 30).unwrap();
        assert_eq!(
            device.next_checkin_time.map(|t| t.timestamp()),
            Some(expected.timestamp())
        );
    }

    #[test]
    fn platform_device_deserializes() {
        let json = r#"{
            "id": 9876,
            "name": "laptop-7",
            "os": "MAC",
            "status": "REGISTERED",
            "last_contact_time": "2024-03-01T10:00:00.000Z"
        }"#;
        let device: Device = serde_json::from_str(json).unwrap();
        assert_eq!(device.id, "9876");
        assert_eq!(device.hostname.as_deref(), Some("laptop-7"));
        assert!(device.next_checkin_time.is_none());
        assert!(device.last_checkin_time.is_some());
    }

    #[test]
    fn garbage_timestamp_becomes_none() {
        let json = r#"{"id": "1", "next_checkin_time": "soon"}"#;
        let device: Device = serde_json::from_str(json).unwrap();
        assert!(device.next_checkin_time.is_none());
    }

    #[test]
    fn job_target_from_device_keeps_checkin() {
        let device = Device {
            id: "5".to_string(),
            hostname: None,
            os: None,
            status: None,
            next_checkin_time: Some(Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap()),
            last_checkin_time: None,
        };
        let target = JobTarget::from(&device);
        assert_eq!(target.endpoint_id, "5");
        assert!(target.next_checkin.is_some());
        assert!(JobTarget::from(7u64).next_checkin.is_none());
    }
}
