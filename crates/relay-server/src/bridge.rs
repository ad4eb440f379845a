//! Hand-off of client events to the external handler process.
//!
//! Each event is serialized to a payload file under the temp directory and
//! the handler binary is invoked with the payload path. The file is left in
//! place afterwards (the payload-on-disk contract lets operators attach
//! alternative consumers and debug after the fact); an hourly sweep removes
//! files older than 24 hours.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use metrics::counter;
use thiserror::Error;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use relay_core::{HandlerPayload, Message, SenderInfo};

use crate::config::HubConfig;
use crate::metrics::{HANDLER_DISPATCHES_TOTAL, HANDLER_FAILURES_TOTAL};

const PAYLOAD_PREFIX: &str = "payload_";
const PAYLOAD_SUFFIX: &str = ".json";
const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);
const PAYLOAD_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Dispatch failure. Observability-only: callers log and move on; nothing
/// here ever reaches a client or blocks a broadcast.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("payload file error: {0}")]
    Io(#[from] std::io::Error),
    #[error("handler exited with status {code}: {output}")]
    HandlerFailed { code: i32, output: String },
}

/// Invokes the configured handler process with payload files.
pub struct HandlerBridge {
    working_dir: PathBuf,
    binary: String,
    command: String,
    temp_dir: PathBuf,
}

impl HandlerBridge {
    pub fn new(config: &HubConfig) -> Self {
        Self {
            working_dir: config.handler.working_dir.clone(),
            binary: config.handler.binary.clone(),
            command: config.handler.command.clone(),
            temp_dir: config.temp_dir.clone(),
        }
    }

    pub fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    /// Ensure the payload directory exists. Fatal at startup when it cannot
    /// be created.
    pub fn init_temp_dir(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.temp_dir)?;
        info!(dir = %self.temp_dir.display(), "payload directory ready");
        Ok(())
    }

    /// Hand a client-originated message to the handler process.
    pub async fn dispatch_message(
        &self,
        message: &Message,
        sender: &SenderInfo,
    ) -> Result<(), BridgeError> {
        let payload = HandlerPayload::for_message(message, sender);
        let path = self.write_payload(&payload)?;
        self.invoke(&path).await
    }

    /// Report an authentication attempt (`status` is `success` or `failed`).
    pub async fn dispatch_authentication(
        &self,
        sender: &SenderInfo,
        status: &str,
        token_provided: bool,
    ) -> Result<(), BridgeError> {
        let payload = HandlerPayload::for_authentication(sender, status, token_provided);
        let path = self.write_payload(&payload)?;
        self.invoke(&path).await
    }

    /// Write a payload file readable by the handler process.
    fn write_payload(&self, payload: &HandlerPayload) -> Result<PathBuf, BridgeError> {
        let json = serde_json::to_vec(payload)?;

        let unix_ts = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let random = uuid::Uuid::new_v4().simple().to_string();
        let name = format!("{PAYLOAD_PREFIX}{unix_ts}_{}{PAYLOAD_SUFFIX}", &random[..8]);
        let path = self.temp_dir.join(name);

        std::fs::write(&path, json)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644))?;
        }

        debug!(path = %path.display(), action = %payload.action, "payload file written");
        Ok(path)
    }

    /// Invoke the handler with the payload path, capturing combined output.
    async fn invoke(&self, payload_path: &Path) -> Result<(), BridgeError> {
        counter!(HANDLER_DISPATCHES_TOTAL).increment(1);
        debug!(
            binary = %self.binary,
            command = %self.command,
            payload = %payload_path.display(),
            "invoking handler"
        );

        let output = tokio::process::Command::new(&self.binary)
            .arg(&self.command)
            .arg("--payload")
            .arg(payload_path)
            .current_dir(&self.working_dir)
            .output()
            .await?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if output.status.success() {
            if !stderr.trim().is_empty() {
                warn!(stderr = %stderr.trim(), "handler wrote to stderr");
            }
            debug!(stdout = %stdout.trim(), "handler completed");
            Ok(())
        } else {
            let code = output.status.code().unwrap_or(-1);
            counter!(HANDLER_FAILURES_TOTAL).increment(1);
            error!(code, stdout = %stdout.trim(), stderr = %stderr.trim(), "handler failed");
            Err(BridgeError::HandlerFailed {
                code,
                output: format!("{stdout}{stderr}").trim().to_string(),
            })
        }
    }

    /// Periodic cleanup of expired payload files. Runs an initial sweep
    /// immediately, then hourly until cancelled.
    pub async fn run_sweep(&self, cancel: CancellationToken) {
        let mut ticker = time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sweep_older_than(PAYLOAD_MAX_AGE) {
                        Ok(0) => {}
                        Ok(removed) => info!(removed, "swept expired payload files"),
                        Err(err) => error!(error = %err, "payload sweep failed"),
                    }
                }
                () = cancel.cancelled() => {
                    debug!("payload sweep stopped");
                    return;
                }
            }
        }
    }

    /// Remove payload files older than `max_age`. Only files matching the
    /// `payload_*.json` pattern are touched.
    fn sweep_older_than(&self, max_age: Duration) -> std::io::Result<usize> {
        let cutoff = SystemTime::now()
            .checked_sub(max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut removed = 0;

        for entry in std::fs::read_dir(&self.temp_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !name.starts_with(PAYLOAD_PREFIX) || !name.ends_with(PAYLOAD_SUFFIX) {
                continue;
            }
            let metadata = match entry.metadata() {
                Ok(m) if m.is_file() => m,
                _ => continue,
            };
            let Ok(modified) = metadata.modified() else { continue };
            if modified < cutoff {
                match std::fs::remove_file(entry.path()) {
                    Ok(()) => {
                        removed += 1;
                        debug!(path = %entry.path().display(), "removed expired payload file");
                    }
                    Err(err) => {
                        error!(path = %entry.path().display(), error = %err, "failed to remove payload file");
                    }
                }
            }
        }
        Ok(removed)
    }
}
