//! One live response session against one endpoint.
//!
//! [`LrSession`] turns high-level operations (files, directories, processes,
//! registry, memory capture) into the uniform submit-then-poll command
//! protocol:
//!
//! 1. **Submit**: the command name must be in the session's
//!    `supported_commands`, otherwise `CbError::UnsupportedCommand` is
//!    returned without touching the network.
//! 2. **Retry on session loss**: a 404 on submission means the session
//!    itself is gone. The session is transparently re-established and the
//!    submission retried, up to `LrConfig::submit_retries` attempts in
//!    total, after which `CbError::SubmitRetriesExhausted` is returned.
//! 3. **Poll**: the command status is fetched every `interval` until it is
//!    `complete` or `error`, or until `timeout` elapses
//!    (`CbError::Timeout`). An `error` status becomes
//!    `CbError::LiveResponse` and is never retried.
//!
//! All methods take `&self`; the current session ID lives behind a lock so
//! a refresh is visible to every holder of the session.

use bytes::Bytes;
use futures::Stream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use crate::backend::LrBackend;
use crate::config::{LrConfig, PollConfig};
use crate::error::{CbError, LiveResponseError, Result};
use crate::memdump::Memdump;
use crate::protocol::{
    CommandRequest, CommandState, CommandStatus, DirectoryEntry, OsType, ProcessEntry,
    RegistryEntry, RegistryValue, SessionInfo, SessionStatus,
};

/// Poll settings used by [`LrSession::kill_process`].
const KILL_POLL: PollConfig = PollConfig {
    interval: Duration::from_millis(100),
    timeout: Duration::from_secs(10),
};

/// Creates a session for `endpoint_id` and waits for it to become active.
///
/// If the session does not become active within `poll.timeout`, or a status
/// poll fails, the pending session is closed on a best-effort basis and
/// `CbError::SessionTimeout` is returned.
pub(crate) async fn start_session(
    backend: &dyn LrBackend,
    endpoint_id: &str,
    poll: &PollConfig,
) -> Result<SessionInfo> {
    let mut current = backend.create_session(endpoint_id).await?;
    tracing::info!(endpoint_id, session_id = %current.id, "live response session requested");
    let started = Instant::now();

    loop {
        match current.status {
            SessionStatus::Active => break,
            status if status.is_dead() => {
                tracing::warn!(endpoint_id, session_id = %current.id, ?status, "session died while starting");
                return Err(abandon_session(backend, endpoint_id, &current.id, started).await);
            }
            _ => {}
        }
        if started.elapsed() > poll.timeout {
            return Err(abandon_session(backend, endpoint_id, &current.id, started).await);
        }
        tokio::time::sleep(poll.interval).await;
        match backend.session_status(&current.id).await {
            Ok(status) => current = status,
            Err(e) => {
                tracing::warn!(endpoint_id, session_id = %current.id, error = %e, "session status poll failed");
                return Err(abandon_session(backend, endpoint_id, &current.id, started).await);
            }
        }
    }

    if current.endpoint_id.is_none() {
        current.endpoint_id = Some(endpoint_id.to_string());
    }
    tracing::info!(
        endpoint_id,
        session_id = %current.id,
        os_type = %current.os_type,
        "live response session active"
    );
    Ok(current)
}

async fn abandon_session(
    backend: &dyn LrBackend,
    endpoint_id: &str,
    session_id: &str,
    started: Instant,
) -> CbError {
    if let Err(e) = backend.close_session(session_id).await {
        tracing::debug!(endpoint_id, session_id, error = %e, "closing abandoned session failed");
    }
    CbError::SessionTimeout {
        endpoint_id: endpoint_id.to_string(),
        elapsed: started.elapsed(),
    }
}

/// Options for [`LrSession::create_process`].
#[derive(Debug, Clone)]
pub struct CreateProcessOptions {
    /// Capture stdout/stderr into a remote file and return its content.
    /// Implies `wait_for_completion`.
    pub wait_for_output: bool,
    /// Block until the process exits.
    pub wait_for_completion: bool,
    /// Working directory of the new process.
    pub working_directory: Option<String>,
    /// Remote file to capture output into. A unique name in the endpoint's
    /// temp directory is used when unset.
    pub remote_output_file_name: Option<String>,
    /// How long to wait for the process to finish.
    pub wait_timeout: Duration,
}

impl Default for CreateProcessOptions {
    fn default() -> Self {
        CreateProcessOptions {
            wait_for_output: true,
            wait_for_completion: true,
            working_directory: None,
            remote_output_file_name: None,
            wait_timeout: Duration::from_secs(30),
        }
    }
}

/// One level of a [`LrSession::walk`].
#[derive(Debug, Clone, PartialEq)]
pub struct WalkEntry {
    /// The directory that was listed.
    pub path: String,
    /// Subdirectory names, excluding `.` and `..`.
    pub dirnames: Vec<String>,
    /// File names.
    pub filenames: Vec<String>,
}

/// Sub-keys and values of a registry key.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RegistryListing {
    /// Names of the child keys.
    pub sub_keys: Vec<String>,
    /// Values stored directly under the key.
    pub values: Vec<RegistryEntry>,
}

/// An active live response session.
pub struct LrSession {
    backend: Arc<dyn LrBackend>,
    config: Arc<LrConfig>,
    endpoint_id: String,
    info: RwLock<SessionInfo>,
    refresh_lock: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

impl std::fmt::Debug for LrSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LrSession")
            .field("endpoint_id", &self.endpoint_id)
            .field("session_id", &self.session_id())
            .finish_non_exhaustive()
    }
}

impl LrSession {
    /// Creates a session for `endpoint_id` and waits until it is active.
    pub async fn establish(
        backend: Arc<dyn LrBackend>,
        endpoint_id: &str,
        config: Arc<LrConfig>,
    ) -> Result<Self> {
        let info = start_session(backend.as_ref(), endpoint_id, &config.session).await?;
        Ok(LrSession {
            backend,
            config,
            endpoint_id: endpoint_id.to_string(),
            info: RwLock::new(info),
            refresh_lock: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        })
    }

    fn snapshot(&self) -> SessionInfo {
        self.info
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Current server-issued session ID. Changes if the session is
    /// re-established.
    pub fn session_id(&self) -> String {
        self.info
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .id
            .clone()
    }

    /// The endpoint this session is attached to.
    pub fn endpoint_id(&self) -> &str {
        &self.endpoint_id
    }

    /// Operating system of the endpoint.
    pub fn os_type(&self) -> OsType {
        self.info
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .os_type
    }

    /// Command names the server advertised for this session.
    pub fn supported_commands(&self) -> Vec<String> {
        self.snapshot().supported_commands
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn command_interval(&self) -> Duration {
        self.config.command.interval
    }

    /// Path separator on the endpoint.
    pub fn path_separator(&self) -> &'static str {
        self.os_type().separator()
    }

    /// Scratch directory on the endpoint.
    pub fn temp_directory(&self) -> &'static str {
        self.os_type().temp_directory()
    }

    /// Joins path components with the endpoint's separator.
    pub fn path_join(&self, base: &str, name: &str) -> String {
        let sep = self.path_separator();
        if base.is_empty() {
            return name.to_string();
        }
        format!("{}{sep}{}", base.trim_end_matches(sep), name.trim_start_matches(sep))
    }

    fn temp_file_name(&self, suffix: &str) -> String {
        let name = format!("cblr.{}.{suffix}", uuid::Uuid::new_v4().simple());
        self.path_join(self.temp_directory(), &name)
    }

    /// Re-establishes the session unless another caller already did since
    /// `stale_id` was observed. Returns the current session ID.
    async fn refresh(&self, stale_id: &str) -> Result<String> {
        let _guard = self.refresh_lock.lock().await;
        let current = self.session_id();
        if current != stale_id {
            return Ok(current);
        }
        tracing::info!(endpoint_id = %self.endpoint_id, session_id = stale_id, "re-establishing lost session");
        let info = start_session(self.backend.as_ref(), &self.endpoint_id, &self.config.session).await?;
        let id = info.id.clone();
        *self
            .info
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = info;
        Ok(id)
    }

    // ── Command protocol ───────────────────────────────────────────────

    /// Submits a command, re-establishing the session if it has been lost.
    pub async fn submit_command(&self, command: &CommandRequest) -> Result<CommandStatus> {
        let info = self.snapshot();
        if !info.supported_commands.iter().any(|c| *c == command.name) {
            return Err(CbError::UnsupportedCommand {
                command: command.name.clone(),
                session_id: info.id,
            });
        }

        let attempts = self.config.submit_retries;
        let mut session_id = info.id;
        for attempt in 1..=attempts {
            tracing::debug!(endpoint_id = %self.endpoint_id, %session_id, command = %command.name, attempt, "submitting command");
            match self.backend.submit_command(&session_id, command).await {
                Ok(status) => return Ok(status),
                Err(e) if e.is_session_lost() => {
                    tracing::warn!(
                        endpoint_id = %self.endpoint_id,
                        %session_id,
                        command = %command.name,
                        attempt,
                        "session lost during command submission"
                    );
                    if attempt < attempts {
                        session_id = self.refresh(&session_id).await?;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(CbError::SubmitRetriesExhausted {
            command: command.name.clone(),
            attempts,
            uri: self.backend.command_uri(&session_id, None),
        })
    }

    /// Polls a submitted command until it completes, fails or times out.
    pub async fn poll_command(
        &self,
        command_name: &str,
        command_id: &str,
        poll: &PollConfig,
    ) -> Result<CommandStatus> {
        let session_id = self.session_id();
        let started = Instant::now();

        loop {
            if started.elapsed() > poll.timeout {
                return Err(CbError::Timeout {
                    uri: self.backend.command_uri(&session_id, Some(command_id)),
                    elapsed: started.elapsed(),
                });
            }

            let status = self
                .backend
                .command_status(&session_id, command_id, self.config.command_wait)
                .await?;
            match status.status {
                CommandState::Complete => return Ok(status),
                CommandState::Error => {
                    return Err(LiveResponseError::new(
                        command_name,
                        status.result_code.unwrap_or(0),
                        status.result_type.as_deref().unwrap_or(""),
                        status.result_desc.as_deref().unwrap_or(""),
                    )
                    .into());
                }
                CommandState::Cancelled => {
                    return Err(LiveResponseError::new(
                        command_name,
                        status.result_code.unwrap_or(0),
                        "",
                        "command was cancelled",
                    )
                    .into());
                }
                CommandState::Pending | CommandState::InProgress | CommandState::Unknown => {
                    tracing::trace!(command = command_name, command_id, "command still running");
                    tokio::time::sleep(poll.interval).await;
                }
            }
        }
    }

    /// Submits a command and polls it to completion with `poll`.
    pub async fn execute_with(
        &self,
        command: &CommandRequest,
        poll: &PollConfig,
    ) -> Result<CommandStatus> {
        let submitted = self.submit_command(command).await?;
        self.poll_command(&command.name, &submitted.id, poll).await
    }

    /// Submits a command and polls it to completion with the configured
    /// command poll settings.
    pub async fn execute(&self, command: &CommandRequest) -> Result<CommandStatus> {
        let poll = self.config.command.clone();
        self.execute_with(command, &poll).await
    }

    // ── Files and directories ──────────────────────────────────────────

    /// Retrieves the content of a remote file.
    pub async fn get_file(&self, path: &str) -> Result<Bytes> {
        let poll = self.config.command.clone();
        self.get_file_with_timeout(path, poll.timeout).await
    }

    /// Retrieves the content of a remote file, waiting at most `timeout`
    /// for the sensor to stage it.
    pub async fn get_file_with_timeout(&self, path: &str, timeout: Duration) -> Result<Bytes> {
        let poll = PollConfig::new(self.config.command.interval, timeout);
        let status = self
            .execute_with(&CommandRequest::new("get file", path), &poll)
            .await?;
        let file_id = status.file_id.ok_or_else(|| {
            CbError::from(LiveResponseError::new(
                "get file",
                0,
                "",
                "server did not return a file id",
            ))
        })?;
        self.backend.download_file(&self.session_id(), &file_id).await
    }

    /// Uploads `content` and writes it to `remote_path` on the endpoint.
    pub async fn put_file(&self, content: Bytes, remote_path: &str) -> Result<()> {
        let file_name = remote_path
            .rsplit(['\\', '/'])
            .next()
            .unwrap_or(remote_path)
            .to_string();
        let file_id = self
            .backend
            .upload_file(&self.session_id(), &file_name, content)
            .await?;
        self.execute(&CommandRequest::new("put file", remote_path).with("file_id", file_id))
            .await?;
        Ok(())
    }

    /// Deletes a remote file.
    pub async fn delete_file(&self, path: &str) -> Result<()> {
        self.execute(&CommandRequest::new("delete file", path))
            .await?;
        Ok(())
    }

    /// Lists a remote directory. Pass a path ending in the separator (or a
    /// wildcard) to list its contents.
    pub async fn list_directory(&self, path: &str) -> Result<Vec<DirectoryEntry>> {
        let status = self
            .execute(&CommandRequest::new("directory list", path))
            .await?;
        Ok(status.field::<Option<Vec<DirectoryEntry>>>("files")?.unwrap_or_default())
    }

    /// Creates a remote directory.
    pub async fn create_directory(&self, path: &str) -> Result<()> {
        self.execute(&CommandRequest::new("create directory", path))
            .await?;
        Ok(())
    }

    /// Walks the directory tree rooted at `top`, top-down and depth-first,
    /// yielding one [`WalkEntry`] per directory. Symbolic links are not
    /// detected, so a link cycle on the endpoint makes the walk unbounded.
    pub fn walk(&self, top: &str) -> impl Stream<Item = Result<WalkEntry>> + '_ {
        let stack = vec![top.to_string()];
        futures::stream::try_unfold(stack, move |stack| self.walk_step(stack))
    }

    async fn walk_step(&self, mut stack: Vec<String>) -> Result<Option<(WalkEntry, Vec<String>)>> {
        let Some(dir) = stack.pop() else {
            return Ok(None);
        };
        let sep = self.path_separator();
        let listing_path = format!("{}{sep}", dir.trim_end_matches(sep));
        let entries = self.list_directory(&listing_path).await?;

        let mut dirnames = Vec::new();
        let mut filenames = Vec::new();
        for entry in entries {
            if entry.is_directory() {
                if entry.filename != "." && entry.filename != ".." {
                    dirnames.push(entry.filename);
                }
            } else {
                filenames.push(entry.filename);
            }
        }

        // Reversed so the first subdirectory is popped next.
        for name in dirnames.iter().rev() {
            stack.push(self.path_join(&dir, name));
        }
        let entry = WalkEntry {
            path: dir,
            dirnames,
            filenames,
        };
        Ok(Some((entry, stack)))
    }

    // ── Processes ──────────────────────────────────────────────────────

    /// Lists running processes.
    pub async fn list_processes(&self) -> Result<Vec<ProcessEntry>> {
        let status = self.execute(&CommandRequest::bare("process list")).await?;
        Ok(status.field::<Option<Vec<ProcessEntry>>>("processes")?.unwrap_or_default())
    }

    /// Kills a process. Returns `false` if the kill did not complete within
    /// ten seconds.
    pub async fn kill_process(&self, pid: u64) -> Result<bool> {
        match self
            .execute_with(&CommandRequest::new("kill", pid), &KILL_POLL)
            .await
        {
            Ok(_) => Ok(true),
            Err(CbError::Timeout { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Starts a process on the endpoint.
    ///
    /// With `wait_for_output` the process output is redirected to a remote
    /// temp file, which is downloaded, returned and then deleted on a
    /// best-effort basis. Otherwise `None` is returned.
    pub async fn create_process(
        &self,
        command_line: &str,
        options: &CreateProcessOptions,
    ) -> Result<Option<Bytes>> {
        let wait_for_completion = options.wait_for_completion || options.wait_for_output;
        let mut request =
            CommandRequest::new("create process", command_line).with("wait", wait_for_completion);
        if let Some(dir) = &options.working_directory {
            request = request.with("working_directory", dir.as_str());
        }

        let output_file = if options.wait_for_output {
            let name = options
                .remote_output_file_name
                .clone()
                .unwrap_or_else(|| self.temp_file_name("tmp"));
            request = request.with("output_file", name.as_str());
            Some(name)
        } else {
            None
        };

        let submitted = self.submit_command(&request).await?;
        if wait_for_completion {
            let poll = PollConfig::new(self.config.command.interval, options.wait_timeout);
            self.poll_command(&request.name, &submitted.id, &poll)
                .await?;
        }

        let Some(output_file) = output_file else {
            return Ok(None);
        };
        let output = self.get_file(&output_file).await?;
        if let Err(e) = self.delete_file(&output_file).await {
            tracing::warn!(endpoint_id = %self.endpoint_id, file = %output_file, error = %e, "failed to remove process output file");
        }
        Ok(Some(output))
    }

    // ── Registry ───────────────────────────────────────────────────────

    /// Lists the sub-keys and values of a registry key.
    pub async fn list_registry_keys_and_values(&self, key: &str) -> Result<RegistryListing> {
        let status = self
            .execute(&CommandRequest::new("reg enum key", key))
            .await?;
        Ok(RegistryListing {
            sub_keys: status.field::<Option<Vec<String>>>("sub_keys")?.unwrap_or_default(),
            values: status
                .field::<Option<Vec<RegistryEntry>>>("values")?
                .unwrap_or_default(),
        })
    }

    /// Lists only the values stored under a registry key.
    pub async fn list_registry_values(&self, key: &str) -> Result<Vec<RegistryEntry>> {
        Ok(self.list_registry_keys_and_values(key).await?.values)
    }

    /// Reads one registry value (`HKLM\...\Key\ValueName`).
    pub async fn get_registry_value(&self, path: &str) -> Result<RegistryEntry> {
        let status = self
            .execute(&CommandRequest::new("reg query value", path))
            .await?;
        Ok(status.field("value")?)
    }

    /// Writes a registry value. The wire type is taken from the
    /// [`RegistryValue`] variant.
    pub async fn set_registry_value(
        &self,
        path: &str,
        value: &RegistryValue,
        overwrite: bool,
    ) -> Result<()> {
        let request = CommandRequest::new("reg set value", path)
            .with("value_data", value.data())
            .with("value_type", value.type_name())
            .with("overwrite", overwrite);
        self.execute(&request).await?;
        Ok(())
    }

    /// Creates a registry key.
    pub async fn create_registry_key(&self, key: &str) -> Result<()> {
        self.execute(&CommandRequest::new("reg create key", key))
            .await?;
        Ok(())
    }

    /// Deletes a registry key.
    pub async fn delete_registry_key(&self, key: &str) -> Result<()> {
        self.execute(&CommandRequest::new("reg delete key", key))
            .await?;
        Ok(())
    }

    /// Deletes a registry value.
    pub async fn delete_registry_value(&self, path: &str) -> Result<()> {
        self.execute(&CommandRequest::new("reg delete value", path))
            .await?;
        Ok(())
    }

    // ── Memory ─────────────────────────────────────────────────────────

    /// Starts a memory capture into `remote_path` (a temp file when `None`)
    /// and returns a handle without waiting for it.
    pub async fn start_memdump(
        &self,
        remote_path: Option<&str>,
        compress: bool,
    ) -> Result<Memdump<'_>> {
        let remote_path = remote_path
            .map(str::to_owned)
            .unwrap_or_else(|| self.temp_file_name("memdump"));
        let request = CommandRequest::new("memdump", remote_path.as_str()).with("compress", compress);
        let submitted = self.submit_command(&request).await?;
        Ok(Memdump::new(self, submitted.id, remote_path, compress))
    }

    /// Captures memory, downloads the dump to `local_path` and removes the
    /// remote artifact.
    pub async fn memdump(
        &self,
        local_path: &std::path::Path,
        remote_path: Option<&str>,
        compress: bool,
    ) -> Result<()> {
        let mut dump = self.start_memdump(remote_path, compress).await?;
        dump.wait().await?;
        dump.get(local_path).await?;
        dump.delete().await
    }

    // ── Lifecycle ──────────────────────────────────────────────────────

    /// Closes the session on the server. Safe to call more than once; only
    /// the first call sends a request, and failures are logged, not
    /// returned.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let session_id = self.session_id();
        match self.backend.close_session(&session_id).await {
            Ok(()) => tracing::info!(endpoint_id = %self.endpoint_id, %session_id, "live response session closed"),
            Err(e) => tracing::warn!(endpoint_id = %self.endpoint_id, %session_id, error = %e, "failed to close session"),
        }
    }

    /// Sends a keepalive for the current session ID.
    pub async fn keepalive(&self) -> Result<()> {
        self.backend.send_keepalive(&self.session_id()).await
    }
}
