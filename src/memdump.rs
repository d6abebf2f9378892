//! Handle for an in-flight memory capture.
//!
//! A `memdump` command can run for many minutes, so it is started without
//! waiting and tracked through a [`Memdump`] handle: `wait` polls it to
//! completion, `get` downloads the dump (waiting first if needed) and
//! `delete` removes the remote artifact.

use std::path::Path;
use std::time::Duration;

use crate::config::PollConfig;
use crate::error::Result;
use crate::session::LrSession;

/// Memory captures get a much longer poll budget than ordinary commands.
const MEMDUMP_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// A memory capture started with [`LrSession::start_memdump`].
#[derive(Debug)]
pub struct Memdump<'a> {
    session: &'a LrSession,
    command_id: String,
    remote_path: String,
    compress: bool,
    complete: bool,
}

impl<'a> Memdump<'a> {
    pub(crate) fn new(
        session: &'a LrSession,
        command_id: String,
        remote_path: String,
        compress: bool,
    ) -> Self {
        Memdump {
            session,
            command_id,
            remote_path,
            compress,
            complete: false,
        }
    }

    /// Where the dump is written on the endpoint (before compression).
    pub fn remote_path(&self) -> &str {
        &self.remote_path
    }

    /// Path of the file `get` downloads: compressed dumps gain `.zip`.
    pub fn artifact_path(&self) -> String {
        if self.compress {
            format!("{}.zip", self.remote_path)
        } else {
            self.remote_path.clone()
        }
    }

    /// Whether the capture is known to have finished.
    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Polls the capture until it completes.
    pub async fn wait(&mut self) -> Result<()> {
        if self.complete {
            return Ok(());
        }
        let poll = PollConfig::new(self.session.command_interval(), MEMDUMP_TIMEOUT);
        self.session
            .poll_command("memdump", &self.command_id, &poll)
            .await?;
        self.complete = true;
        tracing::info!(endpoint_id = %self.session.endpoint_id(), remote_path = %self.remote_path, "memory capture complete");
        Ok(())
    }

    /// Downloads the dump into `local_path`, waiting for completion first if
    /// necessary.
    pub async fn get(&mut self, local_path: &Path) -> Result<()> {
        self.wait().await?;
        let content = self.session.get_file(&self.artifact_path()).await?;
        tokio::fs::write(local_path, &content).await?;
        Ok(())
    }

    /// Deletes the remote dump file.
    pub async fn delete(&self) -> Result<()> {
        self.session.delete_file(&self.artifact_path()).await
    }
}

