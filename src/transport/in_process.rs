//! Client dispatch loop running on a worker thread of the host process.

use std::io::{BufReader, PipeReader, PipeWriter};
use std::thread;
use std::time::Duration;

use crate::client::serve;
use crate::engine::Engine;
use crate::error::{BridgeError, Result};
use crate::protocol::{Request, Response};

use super::{FramedChannel, Transport};

const QUICK_CHECK_INTERVAL: Duration = Duration::from_millis(10);
const MAX_QUICK_CHECKS: u32 = 10;

/// Transport to a dispatch loop on a dedicated thread.
///
/// The two ends talk over a pair of OS pipes with the same framing as the
/// process transports, so everything but process spawning is exercised.
/// The worker owns the engine; engine objects never leave its thread.
pub struct InProcessTransport {
    channel: Option<FramedChannel<BufReader<PipeReader>, PipeWriter>>,
    worker: Option<thread::JoinHandle<Result<()>>>,
}

impl InProcessTransport {
    /// Start serving `engine` on a new worker thread.
    pub fn spawn<E>(engine: E) -> Result<Self>
    where
        E: Engine + Send + 'static,
    {
        let (host_reader, client_writer) = std::io::pipe()?;
        let (client_reader, host_writer) = std::io::pipe()?;

        let worker = thread::Builder::new()
            .name("meshbridge-client".to_string())
            .spawn(move || {
                let mut channel = FramedChannel::new(BufReader::new(client_reader), client_writer);
                let result = serve(engine, &mut channel);
                match &result {
                    Ok(()) => tracing::debug!("In-process client finished"),
                    Err(e) => tracing::error!("In-process client stopped: {}", e),
                }
                result
            })?;

        Ok(Self {
            channel: Some(FramedChannel::new(BufReader::new(host_reader), host_writer)),
            worker: Some(worker),
        })
    }

    /// Whether the worker thread has exited.
    pub fn is_finished(&self) -> bool {
        self.worker.as_ref().is_none_or(|w| w.is_finished())
    }

    fn channel(&mut self) -> Result<&mut FramedChannel<BufReader<PipeReader>, PipeWriter>> {
        self.channel.as_mut().ok_or(BridgeError::TransportClosed)
    }
}

impl Transport for InProcessTransport {
    fn send(&mut self, request: &Request) -> Result<()> {
        self.channel()?.send(request)
    }

    fn receive(&mut self) -> Result<Response> {
        self.channel()?.receive()
    }

    fn supports_log_bridge(&self) -> bool {
        true
    }

    /// Close our pipe ends, then give the worker a brief chance to finish.
    ///
    /// A worker still busy after the quick checks is detached.
    fn shutdown(&mut self) -> Result<()> {
        self.channel = None;

        let Some(handle) = self.worker.take() else {
            return Ok(());
        };

        for _ in 0..MAX_QUICK_CHECKS {
            if handle.is_finished() {
                return match handle.join() {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) if e.is_transport_closed() => Ok(()),
                    Ok(Err(e)) => {
                        tracing::debug!("In-process client exited with error: {}", e);
                        Ok(())
                    }
                    Err(e) => {
                        tracing::warn!("In-process client thread panicked: {:?}", e);
                        Ok(())
                    }
                };
            }
            thread::sleep(QUICK_CHECK_INTERVAL);
        }

        tracing::debug!(
            "In-process client still running after {}ms - detaching",
            QUICK_CHECK_INTERVAL.as_millis() * MAX_QUICK_CHECKS as u128
        );
        Ok(())
    }
}

impl Drop for InProcessTransport {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}
