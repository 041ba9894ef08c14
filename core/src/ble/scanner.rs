//! Reference-counted BLE scan multiplexer
//!
//! The scanner is the only component that issues a native scan. Any number of
//! subscribers share one running scan; the native scan and the radio
//! keep-awake resource are held exactly while at least one subscription is
//! live and the scanner is not paused. Connection arbitration pauses the scan
//! without dropping subscribers. A scan that fails to start or dies is
//! reported to every live subscriber, and the next subscribe or resume
//! tries again.

use crate::ble::native::{BleStack, ScanCallback, ScanHandle, ScanRecord};
use crate::ble::replay::ReplaySubject;
use crate::platform::{ApplicationFunctions, KeepAwakeGuard};
use crate::{LinkError, Result};
use futures::Stream;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};
use uuid::Uuid;

/// Scanner state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScannerState {
    /// No native scan running
    Idle,
    /// Native scan running
    Scanning,
    /// Subscribers present but the scan is held off by arbitration
    Paused,
}

struct ScanInner {
    subscribers: usize,
    paused: bool,
    scan: Option<Box<dyn ScanHandle>>,
    keep_awake: Option<KeepAwakeGuard>,
}

pub struct PeripheralScanner {
    stack: Arc<dyn BleStack>,
    app: Arc<dyn ApplicationFunctions>,
    service_filter: Vec<Uuid>,
    results: ReplaySubject<Result<ScanRecord>>,
    inner: Mutex<ScanInner>,
    state_tx: watch::Sender<ScannerState>,
    me: Weak<PeripheralScanner>,
}

impl PeripheralScanner {
    /// Create a scanner filtering on `service_filter`
    pub fn new(
        stack: Arc<dyn BleStack>,
        app: Arc<dyn ApplicationFunctions>,
        service_filter: Vec<Uuid>,
        replay_window: Duration,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ScannerState::Idle);
        Arc::new_cyclic(|me| Self {
            stack,
            app,
            service_filter,
            results: ReplaySubject::new(replay_window),
            inner: Mutex::new(ScanInner {
                subscribers: 0,
                paused: false,
                scan: None,
                keep_awake: None,
            }),
            state_tx,
            me: me.clone(),
        })
    }

    /// Subscribe to scan results. The first live subscription starts the
    /// native scan; results of the replay window are delivered first.
    pub fn subscribe(self: &Arc<Self>) -> ScanSubscription {
        // registered before the scan starts so a start failure reaches it
        let rx = self.results.subscribe();
        {
            let mut inner = self.inner.lock();
            inner.subscribers += 1;
            debug!(
                subscribers = inner.subscribers,
                paused = inner.paused,
                "Scan subscription added"
            );
            if !inner.paused {
                self.start_scan(&mut inner);
            }
        }

        ScanSubscription {
            scanner: self.clone(),
            rx,
        }
    }

    /// Stop the native scan while keeping subscribers. No-op when already
    /// paused or when nobody is subscribed.
    pub fn pause(&self) {
        let mut inner = self.inner.lock();
        if inner.paused || inner.subscribers == 0 {
            return;
        }
        Self::stop_scan(&mut inner);
        inner.paused = true;
        self.state_tx.send_replace(ScannerState::Paused);
        debug!(subscribers = inner.subscribers, "Scan paused");
    }

    /// Restart the native scan after a pause. No-op when not paused.
    pub fn resume(&self) {
        let mut inner = self.inner.lock();
        if !inner.paused {
            return;
        }
        inner.paused = false;
        debug!(subscribers = inner.subscribers, "Resuming scan");
        if inner.subscribers > 0 {
            self.start_scan(&mut inner);
        } else {
            self.state_tx.send_replace(ScannerState::Idle);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers
    }

    pub fn is_paused(&self) -> bool {
        self.inner.lock().paused
    }

    /// True while a native scan is running
    pub fn is_scanning(&self) -> bool {
        self.inner.lock().scan.is_some()
    }

    pub fn state(&self) -> ScannerState {
        *self.state_tx.borrow()
    }

    /// Scan state changes (started, paused, stopped)
    pub fn state_changes(&self) -> watch::Receiver<ScannerState> {
        self.state_tx.subscribe()
    }

    fn remove_subscription(&self) {
        let mut inner = self.inner.lock();
        inner.subscribers = inner.subscribers.saturating_sub(1);
        debug!(subscribers = inner.subscribers, "Scan subscription removed");
        if inner.subscribers == 0 {
            if !inner.paused {
                Self::stop_scan(&mut inner);
                self.state_tx.send_replace(ScannerState::Idle);
                debug!("Scan stopped");
            }
            // a pause with nobody listening has nothing left to resume
            inner.paused = false;
        }
    }

    fn start_scan(&self, inner: &mut ScanInner) {
        if inner.scan.is_some() {
            return;
        }
        let keep_awake = self.app.acquire_radio_keep_awake();
        let scanner = self.me.clone();
        let callback: ScanCallback = Arc::new(move |result| {
            if let Some(scanner) = scanner.upgrade() {
                match result {
                    Ok(record) => scanner.results.publish(Ok(record)),
                    Err(e) => scanner.scan_failed(e),
                }
            }
        });

        match self.stack.start_scan(&self.service_filter, callback) {
            Ok(handle) => {
                inner.scan = Some(handle);
                inner.keep_awake = Some(keep_awake);
                self.state_tx.send_replace(ScannerState::Scanning);
                debug!("Scan started");
            }
            Err(e) => {
                warn!(error = %e, "Native scan failed to start");
                drop(keep_awake);
                self.state_tx.send_replace(ScannerState::Idle);
                self.results.notify(Err(e));
            }
        }
    }

    /// The running native scan ended on its own
    fn scan_failed(&self, error: LinkError) {
        let mut inner = self.inner.lock();
        if inner.scan.is_none() {
            return;
        }
        Self::stop_scan(&mut inner);
        self.state_tx.send_replace(ScannerState::Idle);
        warn!(error = %error, subscribers = inner.subscribers, "Native scan failed");
        self.results.notify(Err(error));
    }

    fn stop_scan(inner: &mut ScanInner) {
        if let Some(handle) = inner.scan.take() {
            handle.stop();
        }
        if let Some(keep_awake) = inner.keep_awake.take() {
            keep_awake.release();
        }
    }
}

/// A live scan subscription; dropping it unsubscribes
pub struct ScanSubscription {
    scanner: Arc<PeripheralScanner>,
    rx: mpsc::UnboundedReceiver<Result<ScanRecord>>,
}

impl ScanSubscription {
    /// Next scan result or scan failure, `None` once the scanner is gone
    pub async fn next_record(&mut self) -> Option<Result<ScanRecord>> {
        self.rx.recv().await
    }
}

impl Stream for ScanSubscription {
    type Item = Result<ScanRecord>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<ScanRecord>>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for ScanSubscription {
    fn drop(&mut self) {
        self.scanner.remove_subscription();
    }
}
