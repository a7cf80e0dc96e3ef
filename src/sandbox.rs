use crossbeam_channel::{unbounded, Receiver};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::app_versions::AppVersion;
use crate::appspaces::Appspace;
use crate::error::MigratorError;

pub const MIGRATION_SERVICE: &str = "migration";
pub const MIGRATE_COMMAND: &str = "migrate";

const GRACEFUL_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Protocol
// ============================================================================

/// One request sent to a sandbox
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxMessage {
    pub service: String,
    pub command: String,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigratePayload {
    pub from: i64,
    pub to: i64,
}

impl SandboxMessage {
    pub fn migrate(from: i64, to: i64) -> Result<Self, MigratorError> {
        Ok(Self {
            service: MIGRATION_SERVICE.to_string(),
            command: MIGRATE_COMMAND.to_string(),
            payload: serde_json::to_value(MigratePayload { from, to })?,
        })
    }
}

/// Application-level result of a request. Transport failures never show up
/// here; they surface as a disconnected reply channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxReply {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[cfg(test)]
impl SandboxReply {
    pub fn success() -> Self {
        Self { ok: true, error: None }
    }

    pub fn failure(message: &str) -> Self {
        Self {
            ok: false,
            error: Some(message.to_string()),
        }
    }
}

// ============================================================================
// Traits
// ============================================================================

/// Starts sandboxes bound to one app version and one appspace
pub trait SandboxRunner: Send + Sync {
    /// Shut down whatever sandbox is currently serving the appspace, if any
    fn stop_appspace(&self, appspace_id: i64) -> Result<(), MigratorError>;

    /// Start a sandbox dedicated to migrating the appspace's data with the
    /// given version's code
    fn start_for_migration(
        &self,
        app_version: &AppVersion,
        appspace: &Appspace,
    ) -> Result<Box<dyn MigrationSandbox>, MigratorError>;
}

pub trait MigrationSandbox: Send {
    /// Send a request. Replies arrive on the returned channel; the channel
    /// disconnects if the sandbox goes away.
    fn send_message(
        &mut self,
        message: &SandboxMessage,
    ) -> Result<Receiver<SandboxReply>, MigratorError>;

    fn kill(&mut self);

    fn graceful(&mut self);
}

// ============================================================================
// Process-backed implementation
// ============================================================================

type LiveSandboxes = Arc<Mutex<HashMap<i64, Arc<Mutex<Child>>>>>;

/// Runs each sandbox as a child process speaking newline-delimited JSON on
/// stdin/stdout
pub struct ProcessSandboxRunner {
    command: String,
    args: Vec<String>,
    live: LiveSandboxes,
}

impl ProcessSandboxRunner {
    pub fn new(command: &str, args: &[String]) -> Self {
        Self {
            command: command.to_string(),
            args: args.to_vec(),
            live: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

fn kill_and_reap(child: &mut Child) {
    if let Err(e) = child.kill() {
        debug!("Sandbox kill: {}", e);
    }
    let _ = child.wait();
}

impl SandboxRunner for ProcessSandboxRunner {
    fn stop_appspace(&self, appspace_id: i64) -> Result<(), MigratorError> {
        let existing = self.live.lock().unwrap().remove(&appspace_id);
        if let Some(child) = existing {
            warn!("Stopping sandbox still bound to appspace {}", appspace_id);
            kill_and_reap(&mut child.lock().unwrap());
        }
        Ok(())
    }

    fn start_for_migration(
        &self,
        app_version: &AppVersion,
        appspace: &Appspace,
    ) -> Result<Box<dyn MigrationSandbox>, MigratorError> {
        if self.command.is_empty() {
            return Err(MigratorError::Sandbox("no sandbox command configured".into()));
        }

        let appspace_id = appspace.appspace_id;
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .env("APPSPACE_ID", appspace_id.to_string())
            .env("APPSPACE_DATA", &appspace.data_location)
            .env("APP_LOCATION", &app_version.location)
            .env("APP_VERSION", &app_version.version)
            .env("SANDBOX_MODE", "migration")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| MigratorError::Sandbox(format!("failed to start sandbox: {}", e)))?;

        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| MigratorError::Sandbox("sandbox stdout unavailable".into()))?;

        let (reply_tx, reply_rx) = unbounded();
        std::thread::spawn(move || {
            for line in BufReader::new(stdout).lines().map_while(Result::ok) {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<SandboxReply>(&line) {
                    Ok(reply) => {
                        if reply_tx.send(reply).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(
                        "Ignoring malformed output from sandbox for appspace {}: {}",
                        appspace_id, e
                    ),
                }
            }
            // reply_tx drops here: readers see the sandbox as gone
        });

        if let Some(stderr) = child.stderr.take() {
            std::thread::spawn(move || {
                for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                    info!("[sandbox {}] {}", appspace_id, line);
                }
            });
        }

        info!(
            "Started migration sandbox for appspace {} with app version {}",
            appspace_id, app_version.version
        );

        let child = Arc::new(Mutex::new(child));
        self.live
            .lock()
            .unwrap()
            .insert(appspace_id, Arc::clone(&child));

        Ok(Box::new(ProcessSandbox {
            appspace_id,
            child,
            stdin,
            replies: reply_rx,
            live: Arc::clone(&self.live),
            closed: false,
        }))
    }
}

struct ProcessSandbox {
    appspace_id: i64,
    child: Arc<Mutex<Child>>,
    stdin: Option<ChildStdin>,
    replies: Receiver<SandboxReply>,
    live: LiveSandboxes,
    closed: bool,
}

impl ProcessSandbox {
    fn unregister(&mut self) {
        self.closed = true;
        let mut live = self.live.lock().unwrap();
        if live
            .get(&self.appspace_id)
            .is_some_and(|c| Arc::ptr_eq(c, &self.child))
        {
            live.remove(&self.appspace_id);
        }
    }

    fn wait_for_exit(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if let Ok(Some(_)) = self.child.lock().unwrap().try_wait() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }
}

impl MigrationSandbox for ProcessSandbox {
    fn send_message(
        &mut self,
        message: &SandboxMessage,
    ) -> Result<Receiver<SandboxReply>, MigratorError> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| MigratorError::Sandbox("sandbox input is closed".into()))?;

        let mut line = serde_json::to_string(message)?;
        line.push('\n');
        stdin
            .write_all(line.as_bytes())
            .and_then(|_| stdin.flush())
            .map_err(|e| MigratorError::Sandbox(format!("failed to write to sandbox: {}", e)))?;

        Ok(self.replies.clone())
    }

    fn kill(&mut self) {
        if self.closed {
            return;
        }
        warn!("Killing migration sandbox for appspace {}", self.appspace_id);
        self.stdin.take();
        kill_and_reap(&mut self.child.lock().unwrap());
        self.unregister();
    }

    fn graceful(&mut self) {
        if self.closed {
            return;
        }
        // EOF on stdin asks the sandbox to exit
        self.stdin.take();
        if !self.wait_for_exit(GRACEFUL_TIMEOUT) {
            warn!(
                "Sandbox for appspace {} did not exit within {}s",
                self.appspace_id,
                GRACEFUL_TIMEOUT.as_secs()
            );
            kill_and_reap(&mut self.child.lock().unwrap());
        }
        self.unregister();
        debug!("Migration sandbox for appspace {} shut down", self.appspace_id);
    }
}

impl Drop for ProcessSandbox {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_migrate_message_wire_format() {
        let message = SandboxMessage::migrate(1, 2).unwrap();
        let json: serde_json::Value = serde_json::to_value(&message).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "service": "migration",
                "command": "migrate",
                "payload": {"from": 1, "to": 2}
            })
        );
    }

    #[test]
    fn test_reply_parsing() {
        let ok: SandboxReply = serde_json::from_str(r#"{"ok":true}"#).unwrap();
        assert_eq!(ok, SandboxReply::success());

        let failed: SandboxReply =
            serde_json::from_str(r#"{"ok":false,"error":"table missing"}"#).unwrap();
        assert_eq!(failed, SandboxReply::failure("table missing"));
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use pretty_assertions::assert_eq;

        fn shell_runner(script: &str) -> ProcessSandboxRunner {
            ProcessSandboxRunner::new("sh", &["-c".to_string(), script.to_string()])
        }

        fn fixtures() -> (AppVersion, Appspace) {
            let version = AppVersion {
                app_id: 1,
                version: "2.0.0".into(),
                schema: 2,
                location: "/apps/1/2.0.0".into(),
                created: 0,
            };
            let appspace = Appspace {
                appspace_id: 9,
                owner_id: 1,
                app_id: 1,
                app_version: "1.0.0".into(),
                data_location: "/data/9".into(),
                created: 0,
            };
            (version, appspace)
        }

        #[test]
        fn test_round_trip_with_environment() {
            let runner = shell_runner(
                r#"read line; printf '{"ok":false,"error":"%s:%s"}\n' "$SANDBOX_MODE" "$APPSPACE_ID""#,
            );
            let (version, appspace) = fixtures();
            let mut sandbox = runner.start_for_migration(&version, &appspace).unwrap();

            let replies = sandbox
                .send_message(&SandboxMessage::migrate(1, 2).unwrap())
                .unwrap();
            let reply = replies.recv_timeout(Duration::from_secs(10)).unwrap();
            assert_eq!(reply, SandboxReply::failure("migration:9"));
            sandbox.graceful();
        }

        #[test]
        fn test_crash_disconnects_replies() {
            let runner = shell_runner("read line; exit 3");
            let (version, appspace) = fixtures();
            let mut sandbox = runner.start_for_migration(&version, &appspace).unwrap();

            let replies = sandbox
                .send_message(&SandboxMessage::migrate(1, 2).unwrap())
                .unwrap();
            assert!(replies.recv_timeout(Duration::from_secs(10)).is_err());
            sandbox.graceful();
        }

        #[test]
        fn test_stop_appspace_kills_live_sandbox() {
            let runner = shell_runner("sleep 30");
            let (version, appspace) = fixtures();
            let sandbox = runner.start_for_migration(&version, &appspace).unwrap();
            assert!(runner.live.lock().unwrap().contains_key(&9));

            runner.stop_appspace(9).unwrap();
            assert!(!runner.live.lock().unwrap().contains_key(&9));
            drop(sandbox);
        }

        #[test]
        fn test_missing_command() {
            let runner = ProcessSandboxRunner::new("", &[]);
            let (version, appspace) = fixtures();
            assert!(matches!(
                runner.start_for_migration(&version, &appspace),
                Err(MigratorError::Sandbox(_))
            ));
        }
    }
}
