//! Client running as a child process, locally or behind `ssh`.

use std::ffi::OsStr;
use std::io::BufReader;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::Duration;

use crate::error::{BridgeError, Result};
use crate::protocol::{Request, Response};

use super::{FramedChannel, Transport};

const QUICK_CHECK_INTERVAL: Duration = Duration::from_millis(10);
const MAX_QUICK_CHECKS: u32 = 20;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Location {
    Local,
    Ssh { destination: String },
}

/// Transport to a `meshbridge-client` child process.
///
/// The child's stdin/stdout carry the protocol; its stderr is inherited so
/// client logs land next to the host's.
pub struct ProcessTransport {
    child: Child,
    channel: Option<FramedChannel<BufReader<ChildStdout>, ChildStdin>>,
    location: Location,
    reaped: bool,
}

impl ProcessTransport {
    /// Spawn the client binary on this machine.
    pub fn spawn_local(program: impl AsRef<OsStr>, engine: &str) -> Result<Self> {
        let mut command = Command::new(program.as_ref());
        command.arg("--engine").arg(engine);
        tracing::info!("Spawning client {:?} (engine {})", program.as_ref(), engine);
        Self::spawn(command, Location::Local)
    }

    /// Run the client on `destination` through `ssh`.
    ///
    /// `library_dirs` are handed to the far client as `--library-dir` so the
    /// engine library can be located before the handshake starts.
    pub fn spawn_ssh(
        ssh_program: &str,
        destination: &str,
        program: &str,
        library_dirs: &[String],
        engine: &str,
    ) -> Result<Self> {
        let mut command = Command::new(ssh_program);
        command
            .arg(destination)
            .arg(program)
            .arg("--engine")
            .arg(engine);
        for dir in library_dirs {
            command.arg("--library-dir").arg(dir);
        }
        tracing::info!("Spawning client {} on {} via {}", program, destination, ssh_program);
        Self::spawn(
            command,
            Location::Ssh {
                destination: destination.to_string(),
            },
        )
    }

    fn spawn(mut command: Command, location: Location) -> Result<Self> {
        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            let _ = child.wait();
            return Err(BridgeError::Configuration(
                "Failed to obtain client stdin/stdout".to_string(),
            ));
        };

        Ok(Self {
            child,
            channel: Some(FramedChannel::new(BufReader::new(stdout), stdin)),
            location,
            reaped: false,
        })
    }

    /// OS process id of the child.
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    fn channel(&mut self) -> Result<&mut FramedChannel<BufReader<ChildStdout>, ChildStdin>> {
        self.channel.as_mut().ok_or(BridgeError::TransportClosed)
    }
}

impl Transport for ProcessTransport {
    fn send(&mut self, request: &Request) -> Result<()> {
        self.channel()?.send(request)
    }

    fn receive(&mut self) -> Result<Response> {
        self.channel()?.receive()
    }

    /// Fail early if the child died during startup (bad ssh destination,
    /// missing remote program).
    fn bootstrap(&mut self) -> Result<()> {
        if let Some(status) = self.child.try_wait()? {
            tracing::warn!("Client exited during startup with {}", status);
            self.channel = None;
            self.reaped = true;
            return Err(BridgeError::TransportClosed);
        }
        if let Location::Ssh { destination } = &self.location {
            tracing::debug!("ssh session to {} is up", destination);
        }
        Ok(())
    }

    /// A temp file on this machine is only visible to a local client.
    fn supports_log_bridge(&self) -> bool {
        self.location == Location::Local
    }

    /// Close stdin, wait briefly for the child to exit, then kill it.
    fn shutdown(&mut self) -> Result<()> {
        self.channel = None;
        if self.reaped {
            return Ok(());
        }

        for _ in 0..MAX_QUICK_CHECKS {
            if let Some(status) = self.child.try_wait()? {
                tracing::debug!("Client exited with {}", status);
                self.reaped = true;
                return Ok(());
            }
            std::thread::sleep(QUICK_CHECK_INTERVAL);
        }

        tracing::debug!(
            "Client still running after {}ms - killing",
            QUICK_CHECK_INTERVAL.as_millis() * MAX_QUICK_CHECKS as u128
        );
        // The child may exit between the last check and the kill.
        let _ = self.child.kill();
        self.child.wait()?;
        self.reaped = true;
        Ok(())
    }
}

impl Drop for ProcessTransport {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::warn!("Failed to reap client process: {}", e);
        }
    }
}
