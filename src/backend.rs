//! The capability interface between the live response engine and a server.
//!
//! Sessions, workers and the scheduler only ever talk to an
//! `Arc<dyn LrBackend>`, so one implementation of the job machinery serves
//! every product line. [`HttpBackend`] is the REST implementation; the
//! [`Flavor`] picks the route prefixes and the few verbs that differ between
//! the Response and Platform APIs.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};

use crate::client::{CbClient, Credentials};
use crate::devices::get_device;
use crate::error::Result;
use crate::protocol::{CommandRequest, CommandStatus, SessionInfo, UploadedFile};

/// Operations a live response server must provide.
#[async_trait]
pub trait LrBackend: Send + Sync + 'static {
    /// Requests a new session for `endpoint_id`. The returned session is
    /// usually still pending.
    async fn create_session(&self, endpoint_id: &str) -> Result<SessionInfo>;

    /// Fetches the current status of a session.
    async fn session_status(&self, session_id: &str) -> Result<SessionInfo>;

    /// Asks the server to close a session.
    async fn close_session(&self, session_id: &str) -> Result<()>;

    /// Resets the server-side idle timer of a session.
    async fn send_keepalive(&self, session_id: &str) -> Result<()>;

    /// Submits a command. A `CbError::ObjectNotFound` here means the session
    /// is gone.
    async fn submit_command(&self, session_id: &str, command: &CommandRequest)
    -> Result<CommandStatus>;

    /// Fetches the status of a submitted command.
    async fn command_status(
        &self,
        session_id: &str,
        command_id: &str,
        wait: bool,
    ) -> Result<CommandStatus>;

    /// URL (or other locator) of a command status resource, used in timeout
    /// errors.
    fn command_uri(&self, session_id: &str, command_id: Option<&str>) -> String;

    /// Streams the content of a file produced by a command.
    async fn download_file(&self, session_id: &str, file_id: &str) -> Result<Bytes>;

    /// Uploads a file to the session's staging area and returns its ID.
    async fn upload_file(&self, session_id: &str, file_name: &str, content: Bytes)
    -> Result<String>;

    /// When the endpoint is next expected to check in, if known.
    async fn next_checkin(&self, endpoint_id: &str) -> Result<Option<DateTime<Utc>>>;
}

/// Route layout of a product line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Flavor {
    /// Carbon Black Response (`api/v1/cblr`).
    Response,
    /// Carbon Black Cloud / PSC (`appservices/v6/orgs/{org_key}/liveresponse`).
    Platform {
        /// Organization key.
        org_key: String,
    },
}

impl Flavor {
    /// Picks the flavor implied by the credentials: an org key means
    /// Platform.
    pub fn for_credentials(credentials: &Credentials) -> Self {
        match &credentials.org_key {
            Some(org_key) => Flavor::Platform {
                org_key: org_key.clone(),
            },
            None => Flavor::Response,
        }
    }

    fn prefix(&self) -> String {
        match self {
            Flavor::Response => "api/v1/cblr".to_string(),
            Flavor::Platform { org_key } => {
                format!("appservices/v6/orgs/{org_key}/liveresponse")
            }
        }
    }

    fn device_path(&self, endpoint_id: &str) -> String {
        match self {
            Flavor::Response => format!("api/v1/sensor/{endpoint_id}"),
            Flavor::Platform { org_key } => {
                format!("appservices/v6/orgs/{org_key}/devices/{endpoint_id}")
            }
        }
    }
}

/// REST implementation of [`LrBackend`].
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: CbClient,
    flavor: Flavor,
    prefix: String,
}

impl HttpBackend {
    /// Wraps an existing client.
    pub fn new(client: CbClient, flavor: Flavor) -> Self {
        let prefix = flavor.prefix();
        HttpBackend {
            client,
            flavor,
            prefix,
        }
    }

    /// Builds the client and picks the flavor from `credentials`.
    pub fn from_credentials(credentials: &Credentials) -> Result<Self> {
        Ok(Self::new(
            CbClient::new(credentials)?,
            Flavor::for_credentials(credentials),
        ))
    }

    /// The product line this backend talks to.
    pub fn flavor(&self) -> &Flavor {
        &self.flavor
    }

    fn session_path(&self, session_id: &str) -> String {
        format!("{}/session/{session_id}", self.prefix)
    }
}

#[async_trait]
impl LrBackend for HttpBackend {
    async fn create_session(&self, endpoint_id: &str) -> Result<SessionInfo> {
        let path = format!("{}/session/{endpoint_id}", self.prefix);
        self.client.post(&path, &json!({})).await
    }

    async fn session_status(&self, session_id: &str) -> Result<SessionInfo> {
        self.client.get(&self.session_path(session_id)).await
    }

    async fn close_session(&self, session_id: &str) -> Result<()> {
        let path = self.session_path(session_id);
        match self.flavor {
            Flavor::Response => {
                let _: Value = self.client.put(&path, &json!({"status": "close"})).await?;
                Ok(())
            }
            Flavor::Platform { .. } => self.client.delete(&path).await,
        }
    }

    async fn send_keepalive(&self, session_id: &str) -> Result<()> {
        let path = format!("{}/keepalive", self.session_path(session_id));
        let _: Value = self.client.get(&path).await?;
        Ok(())
    }

    async fn submit_command(
        &self,
        session_id: &str,
        command: &CommandRequest,
    ) -> Result<CommandStatus> {
        let path = format!("{}/command", self.session_path(session_id));
        self.client.post(&path, command).await
    }

    async fn command_status(
        &self,
        session_id: &str,
        command_id: &str,
        wait: bool,
    ) -> Result<CommandStatus> {
        let path = format!(
            "{}/command/{command_id}?wait={wait}",
            self.session_path(session_id)
        );
        self.client.get(&path).await
    }

    fn command_uri(&self, session_id: &str, command_id: Option<&str>) -> String {
        let base = format!("{}/command", self.session_path(session_id));
        match command_id {
            Some(id) => self.client.url(&format!("{base}/{id}")),
            None => self.client.url(&base),
        }
    }

    async fn download_file(&self, session_id: &str, file_id: &str) -> Result<Bytes> {
        let path = format!("{}/file/{file_id}/content", self.session_path(session_id));
        self.client.get_bytes(&path).await
    }

    async fn upload_file(
        &self,
        session_id: &str,
        file_name: &str,
        content: Bytes,
    ) -> Result<String> {
        let path = format!("{}/file", self.session_path(session_id));
        let uploaded: UploadedFile = self
            .client
            .post_multipart(&path, file_name, content)
            .await?;
        Ok(uploaded.id)
    }

    async fn next_checkin(&self, endpoint_id: &str) -> Result<Option<DateTime<Utc>>> {
        let device = get_device(&self.client, &self.flavor.device_path(endpoint_id)).await?;
        Ok(device.next_checkin_time)
    }
}
