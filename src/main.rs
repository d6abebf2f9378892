//! CLI entry point for cb-lr, a Carbon Black Live Response client.
//!
//! Submits one job per `--endpoint` through the job scheduler, so several
//! endpoints are worked on concurrently, and prints each result as it
//! arrives.
//!
//! Exit codes:
//! - 0: every job succeeded
//! - 1: at least one job failed (session, command or I/O error)
//! - 2: argument or configuration error (clap handles parse errors itself)

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use tracing_subscriber::EnvFilter;

use cb_lr::client::Credentials;
use cb_lr::config::LrConfig;
use cb_lr::error::Result;
use cb_lr::manager::LrManager;
use cb_lr::session::{CreateProcessOptions, LrSession};

/// Exit code for argument and configuration errors, matching clap's own.
const USAGE_ERROR: u8 = 2;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Carbon Black server URL, e.g. https://cbresponse.example.com.
    #[arg(long)]
    url: String,

    /// API token. Prefer setting via the CBAPI_TOKEN environment variable
    /// to keep it out of process listings and shell history.
    #[arg(long, env = "CBAPI_TOKEN")]
    token: String,

    /// Organization key; selects the Platform (Carbon Black Cloud) API.
    #[arg(long)]
    org_key: Option<String>,

    /// Skip TLS certificate verification.
    #[arg(long)]
    no_ssl_verify: bool,

    /// TOML file overriding polling, retry and worker settings.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Endpoint (sensor / device) ID to target. Repeat for several endpoints.
    #[arg(long = "endpoint", required = true)]
    endpoints: Vec<String>,

    /// Remote path for -g (file) and -l (directory).
    #[arg(long)]
    file: Option<String>,

    /// Local file to write a collected file into (used with -g). With
    /// several endpoints the endpoint ID is appended to the name.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Command line to run on the endpoint (required for -x).
    #[arg(long, allow_hyphen_values = true)]
    command: Option<String>,

    #[command(flatten)]
    actions: ActionFlags,
}

/// Action flags: exactly one must be set per invocation.
#[derive(clap::Args)]
#[group(required = true, multiple = false)]
struct ActionFlags {
    /// List a remote directory. Requires --file.
    #[arg(short = 'l')]
    list: bool,

    /// Collect a file from the endpoint. Requires --file.
    #[arg(short = 'g')]
    get: bool,

    /// Run a process on the endpoint and print its output. Requires
    /// --command.
    #[arg(short = 'x')]
    execute: bool,

    /// List running processes.
    #[arg(short = 'p')]
    processes: bool,
}

/// The validated action to run on every endpoint.
#[derive(Debug, Clone, PartialEq)]
enum Action {
    ListDirectory(String),
    GetFile {
        remote: String,
        output: Option<PathBuf>,
    },
    CreateProcess(String),
    ListProcesses,
}

impl Action {
    /// Checks the per-action argument requirements clap cannot express
    /// because the value flags are shared between actions.
    fn from_cli(cli: &Cli) -> std::result::Result<Action, String> {
        let actions = &cli.actions;
        if actions.list {
            let path = cli.file.clone().ok_or("--file is required when using -l")?;
            Ok(Action::ListDirectory(path))
        } else if actions.get {
            let remote = cli.file.clone().ok_or("--file is required when using -g")?;
            Ok(Action::GetFile {
                remote,
                output: cli.output.clone(),
            })
        } else if actions.execute {
            let command = cli
                .command
                .clone()
                .ok_or("--command is required when using -x")?;
            Ok(Action::CreateProcess(command))
        } else if actions.processes {
            Ok(Action::ListProcesses)
        } else {
            Err("no action flag provided".to_string())
        }
    }
}

/// Where to store a collected file for `endpoint_id`.
fn output_path(base: &Path, endpoint_id: &str, many: bool) -> PathBuf {
    if !many {
        return base.to_path_buf();
    }
    let mut name = base.as_os_str().to_owned();
    name.push(format!(".{endpoint_id}"));
    PathBuf::from(name)
}

/// Runs `action` on one session and renders its result for the terminal.
async fn run_action(session: &LrSession, action: &Action, output: Option<PathBuf>) -> Result<String> {
    match action {
        Action::ListDirectory(path) => {
            let entries = session.list_directory(path).await?;
            let lines: Vec<String> = entries
                .iter()
                .map(|e| {
                    let kind = if e.is_directory() { "<DIR>" } else { "" };
                    format!("{kind:>6} {:>12} {}", e.size, e.filename)
                })
                .collect();
            Ok(lines.join("\n"))
        }
        Action::GetFile { remote, .. } => {
            let content = session.get_file(remote).await?;
            match output {
                Some(local) => {
                    tokio::fs::write(&local, &content).await?;
                    Ok(format!("{} bytes written to {}", content.len(), local.display()))
                }
                None => Ok(format!("{remote}: {} bytes", content.len())),
            }
        }
        Action::CreateProcess(command) => {
            let output = session
                .create_process(command, &CreateProcessOptions::default())
                .await?;
            Ok(output
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                .unwrap_or_default())
        }
        Action::ListProcesses => {
            let processes = session.list_processes().await?;
            let lines: Vec<String> = processes
                .iter()
                .map(|p| {
                    format!(
                        "{:>8} {:<24} {}",
                        p.pid,
                        p.username.as_deref().unwrap_or("-"),
                        p.path.as_deref().unwrap_or("-")
                    )
                })
                .collect();
            Ok(lines.join("\n"))
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Cli::parse();

    let action = match Action::from_cli(&args) {
        Ok(action) => action,
        Err(msg) => {
            eprintln!("Error: {msg}");
            return ExitCode::from(USAGE_ERROR);
        }
    };
    let config = match &args.config {
        Some(path) => match LrConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error: {e}");
                return ExitCode::from(USAGE_ERROR);
            }
        },
        None => LrConfig::default(),
    };

    let mut credentials = Credentials::new(&args.url, &args.token);
    credentials.org_key = args.org_key.clone();
    credentials.ssl_verify = !args.no_ssl_verify;
    let manager = match LrManager::http(&credentials, config) {
        Ok(manager) => manager,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let many = args.endpoints.len() > 1;
    let mut pending: FuturesUnordered<_> = args
        .endpoints
        .iter()
        .map(|endpoint_id| {
            let action = action.clone();
            let output = match &action {
                Action::GetFile {
                    output: Some(base), ..
                } => Some(output_path(base, endpoint_id, many)),
                _ => None,
            };
            let handle = manager.submit_job(endpoint_id.as_str(), move |session| async move {
                run_action(&session, &action, output).await
            });
            let endpoint_id = endpoint_id.clone();
            async move { (endpoint_id, handle.await) }
        })
        .collect();

    let mut failed = false;
    while let Some((endpoint_id, result)) = pending.next().await {
        match result {
            Ok(text) => println!("[{endpoint_id}]\n{text}"),
            Err(e) => {
                eprintln!("[{endpoint_id}] Error: {e}");
                failed = true;
            }
        }
    }
    manager.shutdown().await;

    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Base arguments that satisfy all mandatory fields.
    fn base_args() -> Vec<&'static str> {
        vec![
            "cb-lr",
            "--url",
            "https://cb.local",
            "--token",
            "tok",
            "--endpoint",
            "42",
        ]
    }

    #[test]
    fn missing_action_flag_is_rejected() {
        let result = Cli::try_parse_from(base_args());
        assert!(
            result.is_err(),
            "parsing should fail when no action flag is provided"
        );
    }

    #[test]
    fn conflicting_action_flags_are_rejected() {
        let mut args = base_args();
        args.extend_from_slice(&["-g", "-p"]);
        assert!(
            Cli::try_parse_from(args).is_err(),
            "parsing should fail when multiple action flags are provided"
        );
    }

    #[test]
    fn endpoint_is_required() {
        let args = vec!["cb-lr", "--url", "u", "--token", "t", "-p"];
        assert!(Cli::try_parse_from(args).is_err());
    }

    #[test]
    fn repeated_endpoints_are_collected() {
        let mut args = base_args();
        args.extend_from_slice(&["--endpoint", "43", "-p"]);
        let cli = Cli::try_parse_from(args).expect("should parse two endpoints");
        assert_eq!(cli.endpoints, vec!["42", "43"]);
        assert_eq!(Action::from_cli(&cli), Ok(Action::ListProcesses));
    }

    #[test]
    fn getfile_without_file_flag_fails_validation() {
        // --file is optional at parse time and checked when building the
        // action, like the other shared value flags.
        let mut args = base_args();
        args.push("-g");
        let cli = Cli::try_parse_from(args).expect("should parse with -g but no --file");
        assert!(cli.actions.get);
        assert!(Action::from_cli(&cli).is_err());
    }

    #[test]
    fn getfile_with_output_builds_action() {
        let mut args = base_args();
        args.extend_from_slice(&["-g", "--file", "c:\\evidence.bin", "--output", "/tmp/e.bin"]);
        let cli = Cli::try_parse_from(args).expect("should parse a complete get-file command");
        assert_eq!(
            Action::from_cli(&cli),
            Ok(Action::GetFile {
                remote: "c:\\evidence.bin".to_string(),
                output: Some(PathBuf::from("/tmp/e.bin")),
            })
        );
    }

    #[test]
    fn execute_accepts_hyphenated_command() {
        let mut args = base_args();
        args.extend_from_slice(&["-x", "--command", "-c whoami"]);
        let cli = Cli::try_parse_from(args).expect("should parse -x with --command");
        assert_eq!(
            Action::from_cli(&cli),
            Ok(Action::CreateProcess("-c whoami".to_string()))
        );
    }

    #[test]
    fn org_key_and_ssl_flags_parse() {
        let mut args = base_args();
        args.extend_from_slice(&["--org-key", "ORG1", "--no-ssl-verify", "-l", "--file", "/tmp"]);
        let cli = Cli::try_parse_from(args).expect("should parse platform flags");
        assert_eq!(cli.org_key.as_deref(), Some("ORG1"));
        assert!(cli.no_ssl_verify);
        assert_eq!(
            Action::from_cli(&cli),
            Ok(Action::ListDirectory("/tmp".to_string()))
        );
    }

    #[test]
    fn output_path_is_suffixed_for_many_endpoints() {
        let base = Path::new("/tmp/dump.bin");
        assert_eq!(output_path(base, "42", false), PathBuf::from("/tmp/dump.bin"));
        assert_eq!(output_path(base, "42", true), PathBuf::from("/tmp/dump.bin.42"));
    }
}
