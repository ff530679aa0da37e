/// Discovery window controller
///
/// Drives time-boxed scans: `Idle` → `Scanning` on `start_scan`, back to
/// `Idle` on `stop_scan` or when the transport reports the window elapsed.
/// Starting while a window is open is a no-op, so overlapping requests
/// never stack scans on the radio.

use crate::config::CentralConfig;
use crate::transport::abstraction::{GattCentral, TransportError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Scanner state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScannerState {
    /// Idle, not scanning
    Idle,
    /// A discovery window is open
    Scanning,
}

/// Result of a start request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStart {
    /// A new window was opened
    Started,
    /// A window was already open; nothing was done
    AlreadyScanning,
}

struct ScanWindow {
    state: ScannerState,
    opened_at: Option<Instant>,
}

pub struct ScanController {
    central: Arc<dyn GattCentral>,
    config: CentralConfig,
    window: Mutex<ScanWindow>,
}

impl ScanController {
    pub fn new(central: Arc<dyn GattCentral>, config: CentralConfig) -> Self {
        Self {
            central,
            config,
            window: Mutex::new(ScanWindow {
                state: ScannerState::Idle,
                opened_at: None,
            }),
        }
    }

    /// Get current scanner state
    pub fn state(&self) -> ScannerState {
        self.window.lock().state
    }

    pub fn is_scanning(&self) -> bool {
        self.state() == ScannerState::Scanning
    }

    /// Configured window length
    pub fn window_length(&self) -> Duration {
        self.config.scan_window()
    }

    /// Time left in the open window, if any
    pub fn remaining(&self) -> Option<Duration> {
        let window = self.window.lock();
        match (window.state, window.opened_at) {
            (ScannerState::Scanning, Some(opened)) => {
                Some(self.config.scan_window().saturating_sub(opened.elapsed()))
            }
            _ => None,
        }
    }

    /// Open a discovery window unless one is already open.
    ///
    /// The radio is enabled first; if that fails the controller stays
    /// `Idle` and the error is returned without retry. Starting the scan
    /// itself is retried per the configured policy.
    pub async fn start_scan(&self) -> Result<ScanStart, TransportError> {
        {
            let mut window = self.window.lock();
            if window.state == ScannerState::Scanning {
                debug!("scan already running, ignoring start request");
                return Ok(ScanStart::AlreadyScanning);
            }
            // Claim the window before awaiting so concurrent starts no-op
            window.state = ScannerState::Scanning;
            window.opened_at = Some(Instant::now());
        }

        if let Err(e) = self.open_window().await {
            warn!("scan start failed: {}", e);
            self.reset();
            return Err(e);
        }

        info!(
            window_secs = self.config.scan_window_secs,
            "discovery window opened"
        );
        Ok(ScanStart::Started)
    }

    /// Close the window early
    pub async fn stop_scan(&self) -> Result<(), TransportError> {
        if self.state() == ScannerState::Idle {
            return Ok(());
        }
        let result = self.central.stop_scan().await;
        self.reset();
        info!("discovery window closed");
        result
    }

    /// The transport reported the window elapsed
    pub fn on_scan_stopped(&self) {
        if self.state() == ScannerState::Scanning {
            debug!("discovery window elapsed");
        }
        self.reset();
    }

    /// Force `Idle` without touching the radio (radio went away)
    pub fn reset(&self) {
        let mut window = self.window.lock();
        window.state = ScannerState::Idle;
        window.opened_at = None;
    }

    async fn open_window(&self) -> Result<(), TransportError> {
        self.central.enable_radio().await.map_err(|e| {
            warn!("radio enable failed: {}", e);
            TransportError::RadioUnavailable
        })?;

        let duration = self.config.scan_window();
        let filters = self.config.service_filters.clone();
        let allow_duplicates = self.config.allow_duplicates;
        self.config
            .retry
            .run("scan", || {
                self.central
                    .start_scan(&filters, duration, allow_duplicates)
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeCentral;
    use crate::transport::retry::RetryPolicy;

    fn controller(central: Arc<FakeCentral>) -> ScanController {
        let config = CentralConfig {
            retry: RetryPolicy::none(),
            ..Default::default()
        };
        ScanController::new(central, config)
    }

    #[tokio::test]
    async fn test_start_scan_transitions_to_scanning() {
        let central = Arc::new(FakeCentral::new());
        let scanner = controller(central.clone());

        assert_eq!(scanner.state(), ScannerState::Idle);
        assert_eq!(scanner.start_scan().await, Ok(ScanStart::Started));
        assert_eq!(scanner.state(), ScannerState::Scanning);
        assert!(scanner.remaining().is_some());

        let scans = central.scan_requests();
        assert_eq!(scans.len(), 1);
        assert_eq!(scans[0].duration, Duration::from_secs(5));
        assert!(scans[0].allow_duplicates);
    }

    #[tokio::test]
    async fn test_start_while_scanning_is_noop() {
        let central = Arc::new(FakeCentral::new());
        let scanner = controller(central.clone());

        scanner.start_scan().await.expect("first start");
        assert_eq!(scanner.start_scan().await, Ok(ScanStart::AlreadyScanning));
        assert_eq!(central.scan_requests().len(), 1);
    }

    #[tokio::test]
    async fn test_radio_failure_stays_idle() {
        let central = Arc::new(FakeCentral::new());
        central.set_radio_available(false);
        let scanner = controller(central.clone());

        assert_eq!(
            scanner.start_scan().await,
            Err(TransportError::RadioUnavailable)
        );
        assert_eq!(scanner.state(), ScannerState::Idle);
        assert!(central.scan_requests().is_empty());
    }

    #[tokio::test]
    async fn test_window_expiry_and_stop() {
        let central = Arc::new(FakeCentral::new());
        let scanner = controller(central.clone());

        scanner.start_scan().await.expect("start");
        scanner.on_scan_stopped();
        assert_eq!(scanner.state(), ScannerState::Idle);
        assert!(scanner.remaining().is_none());

        scanner.start_scan().await.expect("restart");
        scanner.stop_scan().await.expect("stop");
        assert_eq!(scanner.state(), ScannerState::Idle);
        assert_eq!(central.stop_scan_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_start_is_retried() {
        let central = Arc::new(FakeCentral::new());
        central.fail_next_scans(2);
        let scanner = ScanController::new(central.clone(), CentralConfig::default());

        assert_eq!(scanner.start_scan().await, Ok(ScanStart::Started));
        assert_eq!(central.scan_requests().len(), 1);
    }
}
