//! Discovery of the remote control peripheral

use std::sync::Arc;

use futures_util::StreamExt;
use log::{debug, info, warn};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::transport::{GattTransport, PeripheralInfo, ScanEvent, TransportError};

/// Receiver of the scan's outcome
///
/// Called from the scan task; implementations must not block.
pub trait ScanHandler: Send + Sync {
    fn on_peripheral_found(&self, peripheral: PeripheralInfo);
    fn on_scan_failed(&self, error: TransportError);
}

/// Single-shot scan for a peripheral advertising the control service
///
/// The first acceptable match is handed to the handler and the scan stops by
/// itself; [`PeripheralScanner::stop`] cuts it short.
pub struct PeripheralScanner {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl PeripheralScanner {
    pub fn start(
        transport: Arc<dyn GattTransport>,
        bonded_only: bool,
        handler: Arc<dyn ScanHandler>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let mut stream = match transport.scan().await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Could not start scanning: {}", e);
                    handler.on_scan_failed(e);
                    return;
                }
            };
            info!("Scanning for the remote control (bonded only: {})", bonded_only);
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("Scan stopped");
                        break;
                    }
                    event = stream.next() => match event {
                        Some(ScanEvent::Peripheral(peripheral)) => {
                            if bonded_only && !peripheral.bonded {
                                debug!("Skipping unbonded peripheral {}", peripheral.id);
                                continue;
                            }
                            info!("Found {}", peripheral.label());
                            handler.on_peripheral_found(peripheral);
                            break;
                        }
                        Some(ScanEvent::Failed { code }) => {
                            warn!("Scan failed with code {}", code);
                            handler.on_scan_failed(TransportError::ScanFailed(code));
                            break;
                        }
                        None => {
                            warn!("Scan stream ended unexpectedly");
                            break;
                        }
                    }
                }
            }
        });
        Self { cancel, task }
    }

    /// Stops the scan; nothing further reaches the handler.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    #[cfg(test)]
    fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for PeripheralScanner {
    fn drop(&mut self) {
        self.cancel.cancel();
        self.task.abort();
    }
}
