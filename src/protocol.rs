//! Wire types for the live response session and command protocol.
//!
//! The protocol is a submit-then-poll flow:
//! 1. POST `session/{endpoint_id}` creates a session (`pending`).
//! 2. Poll GET `session/{id}` until the session is `active`.
//! 3. POST `session/{id}/command` submits a [`CommandRequest`].
//! 4. Poll GET `session/{id}/command/{command_id}` until `complete` or
//!    `error`; the final [`CommandStatus`] carries command-specific results.
//!
//! Identifiers are numbers on the Response product line and strings on the
//! Platform line, so every ID field goes through [`string_or_number`].

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

/// Accepts a JSON string or number and yields it as a `String`.
pub fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {other}"
        ))),
    }
}

fn opt_string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected string or number id, got {other}"
        ))),
    }
}

// ── Enums ──────────────────────────────────────────────────────────────

/// Operating system reported for the session's endpoint. Determines the
/// path separator and scratch directory used by composite operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum OsType {
    /// Not reported or unrecognized.
    #[default]
    Unknown,
    /// Windows.
    Windows,
    /// Linux.
    Linux,
    /// macOS.
    Mac,
}

impl OsType {
    /// Path separator on the endpoint.
    pub fn separator(self) -> &'static str {
        match self {
            OsType::Windows | OsType::Unknown => "\\",
            OsType::Linux | OsType::Mac => "/",
        }
    }

    /// Writable scratch directory on the endpoint.
    pub fn temp_directory(self) -> &'static str {
        match self {
            OsType::Windows | OsType::Unknown => "c:\\windows\\temp",
            OsType::Linux | OsType::Mac => "/tmp",
        }
    }
}

impl FromStr for OsType {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "windows" | "win" | "1" => OsType::Windows,
            "linux" | "4" => OsType::Linux,
            "mac" | "macos" | "osx" | "2" => OsType::Mac,
            _ => OsType::Unknown,
        })
    }
}

impl<'de> Deserialize<'de> for OsType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = match Value::deserialize(deserializer)? {
            Value::String(s) => s,
            Value::Number(n) => n.to_string(),
            _ => return Ok(OsType::Unknown),
        };
        Ok(raw.parse().unwrap_or_default())
    }
}

/// Lifecycle status of a live response session. Case-insensitive on the
/// wire; unrecognized values map to `Unknown` and keep the poll going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// Created, waiting for the sensor to check in.
    Pending,
    /// Ready to accept commands.
    Active,
    /// Closed by a client.
    Closed,
    /// Expired server-side.
    Timeout,
    /// Failed to start.
    Error,
    /// Anything else.
    Unknown,
}

impl SessionStatus {
    /// A session in this state will never become active.
    pub fn is_dead(self) -> bool {
        matches!(
            self,
            SessionStatus::Closed | SessionStatus::Timeout | SessionStatus::Error
        )
    }
}

impl<'de> Deserialize<'de> for SessionStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(match raw.to_ascii_lowercase().as_str() {
            "pending" => SessionStatus::Pending,
            "active" => SessionStatus::Active,
            "close" | "closed" => SessionStatus::Closed,
            "timeout" => SessionStatus::Timeout,
            "error" => SessionStatus::Error,
            _ => SessionStatus::Unknown,
        })
    }
}

/// Lifecycle status of a submitted command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    /// Queued on the server.
    Pending,
    /// Running on the sensor.
    InProgress,
    /// Finished successfully; results are in the status body.
    Complete,
    /// Finished with an error; see `result_code`.
    Error,
    /// Cancelled before completion.
    Cancelled,
    /// Anything else. Treated as non-terminal.
    Unknown,
}

impl<'de> Deserialize<'de> for CommandState {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(match raw.to_ascii_lowercase().as_str() {
            "pending" | "queued" => CommandState::Pending,
            "in progress" | "in_progress" => CommandState::InProgress,
            "complete" | "completed" => CommandState::Complete,
            "error" => CommandState::Error,
            "cancel" | "cancelled" | "canceled" => CommandState::Cancelled,
            _ => CommandState::Unknown,
        })
    }
}

// ── Sessions ───────────────────────────────────────────────────────────

/// Session metadata returned by session creation and status calls.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionInfo {
    /// Opaque session token issued by the server.
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    /// Current lifecycle status.
    pub status: SessionStatus,
    /// The endpoint (sensor/device) the session is attached to.
    #[serde(
        default,
        alias = "sensor_id",
        alias = "device_id",
        deserialize_with = "opt_string_or_number"
    )]
    pub endpoint_id: Option<String>,
    /// Endpoint operating system.
    #[serde(default, alias = "os_target")]
    pub os_type: OsType,
    /// Command names this session accepts.
    #[serde(default)]
    pub supported_commands: Vec<String>,
    /// Endpoint host name, if reported.
    #[serde(default)]
    pub hostname: Option<String>,
    /// Working directory of the remote shell, if reported.
    #[serde(default)]
    pub current_working_directory: Option<String>,
}

// ── Commands ───────────────────────────────────────────────────────────

/// A command descriptor: `{name, object, ...command-specific fields}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandRequest {
    /// Command name, e.g. `"get file"`.
    pub name: String,
    /// Primary argument (path, pid, registry key, command line).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object: Option<Value>,
    /// Command-specific fields.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl CommandRequest {
    /// A command with the given name and object argument.
    pub fn new(name: &str, object: impl Into<Value>) -> Self {
        CommandRequest {
            name: name.to_string(),
            object: Some(object.into()),
            fields: Map::new(),
        }
    }

    /// A command with no object argument (e.g. `"process list"`).
    pub fn bare(name: &str) -> Self {
        CommandRequest {
            name: name.to_string(),
            object: None,
            fields: Map::new(),
        }
    }

    /// Adds a command-specific field.
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }
}

/// Status of a submitted command. Command-specific results (directory
/// entries, process lists, registry values) land in `extra`.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandStatus {
    /// Server-assigned command ID.
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    /// Echo of the command name.
    #[serde(default)]
    pub name: Option<String>,
    /// Current status.
    pub status: CommandState,
    /// Vendor result code when `status` is `Error`.
    #[serde(default)]
    pub result_code: Option<u64>,
    /// Result code namespace, e.g. `"WinHresult"`.
    #[serde(default)]
    pub result_type: Option<String>,
    /// Server description of the result.
    #[serde(default)]
    pub result_desc: Option<String>,
    /// File produced by the command (`get file`), if any.
    #[serde(default, deserialize_with = "opt_string_or_number")]
    pub file_id: Option<String>,
    /// Everything else.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CommandStatus {
    /// Deserializes a command-specific result field, e.g. `files`.
    pub fn field<T: serde::de::DeserializeOwned>(&self, key: &str) -> serde_json::Result<T> {
        let value = self.extra.get(key).cloned().unwrap_or(Value::Null);
        serde_json::from_value(value)
    }
}

/// Response of a file upload.
#[derive(Debug, Clone, Deserialize)]
pub struct UploadedFile {
    /// ID to reference in a `put file` command.
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
}

// ── Command results ────────────────────────────────────────────────────

/// One entry of a `directory list` result.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct DirectoryEntry {
    /// Entry name, without the directory part.
    pub filename: String,
    /// Attribute flags, e.g. `["DIRECTORY", "HIDDEN"]`.
    #[serde(default)]
    pub attributes: Vec<String>,
    /// Size in bytes.
    #[serde(default)]
    pub size: u64,
    /// Short (8.3) name on Windows.
    #[serde(default)]
    pub alt_name: Option<String>,
    /// Creation time, epoch seconds.
    #[serde(default)]
    pub create_time: Option<i64>,
    /// Last access time, epoch seconds.
    #[serde(default)]
    pub last_access_time: Option<i64>,
    /// Last write time, epoch seconds.
    #[serde(default)]
    pub last_write_time: Option<i64>,
}

impl DirectoryEntry {
    /// Whether the entry is a directory.
    pub fn is_directory(&self) -> bool {
        self.attributes.iter().any(|a| a == "DIRECTORY")
    }
}

/// One entry of a `process list` result.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ProcessEntry {
    /// Process ID.
    pub pid: u64,
    /// Image path.
    #[serde(default)]
    pub path: Option<String>,
    /// Full command line.
    #[serde(default)]
    pub command_line: Option<String>,
    /// Owning user.
    #[serde(default)]
    pub username: Option<String>,
    /// Owning user's SID.
    #[serde(default)]
    pub sid: Option<String>,
    /// Parent process ID.
    #[serde(default)]
    pub parent: Option<u64>,
    /// Creation time, epoch seconds.
    #[serde(default)]
    pub create_time: Option<i64>,
}

/// A registry value as reported by `reg enum key` / `reg query value`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RegistryEntry {
    /// Value name (empty for the default value).
    #[serde(default)]
    pub value_name: String,
    /// Type name, e.g. `"REG_SZ"`.
    pub value_type: String,
    /// Raw value data.
    #[serde(default)]
    pub value_data: Value,
}

/// A registry value to write with `reg set value`.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryValue {
    /// `REG_DWORD`
    Dword(u32),
    /// `REG_QWORD`
    Qword(u64),
    /// `REG_SZ`
    Sz(String),
    /// `REG_EXPAND_SZ`
    ExpandSz(String),
    /// `REG_MULTI_SZ`
    MultiSz(Vec<String>),
}

impl RegistryValue {
    /// Wire type name.
    pub fn type_name(&self) -> &'static str {
        match self {
            RegistryValue::Dword(_) => "REG_DWORD",
            RegistryValue::Qword(_) => "REG_QWORD",
            RegistryValue::Sz(_) => "REG_SZ",
            RegistryValue::ExpandSz(_) => "REG_EXPAND_SZ",
            RegistryValue::MultiSz(_) => "REG_MULTI_SZ",
        }
    }

    /// Wire value data.
    pub fn data(&self) -> Value {
        match self {
            RegistryValue::Dword(v) => Value::from(*v),
            RegistryValue::Qword(v) => Value::from(*v),
            RegistryValue::Sz(s) | RegistryValue::ExpandSz(s) => Value::from(s.as_str()),
            RegistryValue::MultiSz(items) => Value::from(items.clone()),
        }
    }
}

impl From<u32> for RegistryValue {
    fn from(v: u32) -> Self {
        RegistryValue::Dword(v)
    }
}

impl From<u64> for RegistryValue {
    fn from(v: u64) -> Self {
        RegistryValue::Qword(v)
    }
}

impl From<&str> for RegistryValue {
    fn from(v: &str) -> Self {
        RegistryValue::Sz(v.to_string())
    }
}

impl From<Vec<String>> for RegistryValue {
    fn from(v: Vec<String>) -> Self {
        RegistryValue::MultiSz(v)
    }
}

impl fmt::Display for OsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OsType::Unknown => "unknown",
            OsType::Windows => "windows",
            OsType::Linux => "linux",
            OsType::Mac => "mac",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_info_accepts_numeric_ids_and_legacy_aliases() {
        let json = r#"{
            "id": 17,
            "status": "ACTIVE",
            "sensor_id": 42,
            "os_target": "windows",
            "supported_commands": ["get file", "directory list"],
            "hostname": "WIN-01"
        }"#;
        let info: SessionInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.id, "17");
        assert_eq!(info.status, SessionStatus::Active);
        assert_eq!(info.endpoint_id.as_deref(), Some("42"));
        assert_eq!(info.os_type, OsType::Windows);
        assert_eq!(info.supported_commands.len(), 2);
    }

    #[test]
    fn session_info_platform_shape() {
        let json = r#"{
            "id": "1:2468",
            "status": "pending",
            "device_id": 2468,
            "os_type": "LINUX"
        }"#;
        let info: SessionInfo = serde_json::from_str(json).unwrap();
        assert_eq!(info.id, "1:2468");
        assert_eq!(info.status, SessionStatus::Pending);
        assert_eq!(info.os_type, OsType::Linux);
        assert!(info.supported_commands.is_empty());
    }

    #[test]
    fn unknown_statuses_do_not_fail_deserialization() {
        let session: SessionStatus = serde_json::from_str("\"warming up\"").unwrap();
        assert_eq!(session, SessionStatus::Unknown);
        let command: CommandState = serde_json::from_str("\"reticulating\"").unwrap();
        assert_eq!(command, CommandState::Unknown);
    }

    #[test]
    fn command_request_flattens_fields() {
        let req = CommandRequest::new("create process", "cmd.exe /c dir")
            .with("wait", true)
            .with("output_file", "c:\\windows\\temp\\out.tmp");
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json["name"], "create process");
        assert_eq!(json["object"], "cmd.exe /c dir");
        assert_eq!(json["wait"], true);
        assert_eq!(json["output_file"], "c:\\windows\\temp\\out.tmp");
    }

    #[test]
    fn bare_command_omits_object() {
        let json = serde_json::to_value(CommandRequest::bare("process list")).unwrap();
        assert!(json.get("object").is_none());
    }

    #[test]
    fn command_status_exposes_result_fields() {
        let json = r#"{
            "id": 3,
            "name": "directory list",
            "status": "complete",
            "files": [
                {"filename": ".", "attributes": ["DIRECTORY"], "size": 0},
                {"filename": "a.txt", "attributes": ["ARCHIVE"], "size": 12}
            ]
        }"#;
        let status: CommandStatus = serde_json::from_str(json).unwrap();
        assert_eq!(status.status, CommandState::Complete);
        let files: Vec<DirectoryEntry> = status.field("files").unwrap();
        assert!(files[0].is_directory());
        assert!(!files[1].is_directory());
        assert_eq!(files[1].size, 12);
    }

    #[test]
    fn command_status_error_carries_result_code() {
        let json = r#"{
            "id": "c-9",
            "status": "error",
            "result_code": 2147942402,
            "result_type": "WinHresult",
            "result_desc": ""
        }"#;
        let status: CommandStatus = serde_json::from_str(json).unwrap();
        assert_eq!(status.status, CommandState::Error);
        assert_eq!(status.result_code, Some(0x8007_0002));
    }

    #[test]
    fn os_type_conventions() {
        assert_eq!(OsType::Windows.separator(), "\\");
        assert_eq!(OsType::Linux.separator(), "/");
        assert_eq!(OsType::Mac.temp_directory(), "/tmp");
        assert_eq!("MAC".parse::<OsType>().unwrap(), OsType::Mac);
        assert_eq!("beos".parse::<OsType>().unwrap(), OsType::Unknown);
    }

    #[test]
    fn registry_value_wire_types() {
        assert_eq!(RegistryValue::from(7u32).type_name(), "REG_DWORD");
        assert_eq!(RegistryValue::from("x").type_name(), "REG_SZ");
        let multi = RegistryValue::from(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(multi.type_name(), "REG_MULTI_SZ");
        assert_eq!(multi.data(), serde_json::json!(["a", "b"]));
    }
}
