//! Async Rust client library for Carbon Black Live Response.
//!
//! Opens remote command sessions on managed endpoints, runs file, process,
//! registry and memory operations through them, and schedules many such
//! jobs across many endpoints with a bounded pool of per-endpoint workers.
//!
//! # Modules
//!
//! - [`backend`]: the `LrBackend` capability trait and its REST implementation.
//! - [`client`]: authenticated HTTP wrapper for the Carbon Black REST API.
//! - [`config`]: polling, retry, worker and keepalive settings.
//! - [`devices`]: device lookup and job targets.
//! - [`error`]: typed error hierarchy (`CbError`) for all library operations.
//! - [`job`]: handles for submitted jobs.
//! - [`manager`]: the `LrManager` facade, session cache and keepalive.
//! - [`memdump`]: handle for in-flight memory captures.
//! - [`protocol`]: wire types for sessions, commands and their results.
//! - [`result_code`]: decoding of Windows result codes.
//! - [`scheduler`]: the job scheduler event loop.
//! - [`session`]: one live response session and its operations.
//! - [`worker`]: per-endpoint job workers.
//!
//! # Quick Start
//!
//! ```ignore
//! use cb_lr::client::Credentials;
//! use cb_lr::config::LrConfig;
//! use cb_lr::manager::LrManager;
//!
//! let creds = Credentials::new("https://cb.example.com", "API-TOKEN");
//! let manager = LrManager::http(&creds, LrConfig::default())?;
//!
//! // Direct session use.
//! let session = manager.request_session("42").await?;
//! let listing = session.list_directory("c:\\windows\\temp\\").await?;
//! session.close().await;
//!
//! // Scheduled job: runs on a worker with its own session to endpoint 42.
//! let processes = manager
//!     .submit_job("42", |session| async move { session.list_processes().await })
//!     .await?;
//! manager.shutdown().await;
//! ```

#![warn(missing_docs)]

pub mod backend;
pub mod client;
pub mod config;
pub mod devices;
pub mod error;
pub mod job;
pub mod manager;
pub mod memdump;
pub mod protocol;
pub mod result_code;
pub mod scheduler;
pub mod session;
pub mod worker;
