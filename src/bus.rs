//! Non-blocking event bus for system events.
//!
//! `publish()` must NEVER block: it is a single `try_send` and returns
//! whether the event was queued. On overflow the event is dropped, counted
//! and appended to a fallback JSONL log. Only MUST_DELIVER reason codes are
//! additionally routed through the registered emergency callback, so local
//! protection does not depend on the bus at all.

use std::io::Write as _;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, warn};

use crate::config::ResilienceConfig;
use crate::models::SystemEvent;

/// Subscriber seam. Handler errors are logged and isolated; one faulty
/// subscriber never prevents the others from seeing the event.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle_event(&self, event: &SystemEvent) -> Result<()>;
}

/// Invoked synchronously from `publish` when a critical event is dropped.
pub type EmergencyCallback = Arc<dyn Fn(&SystemEvent) + Send + Sync>;

/// Grace period for the dispatcher to drain on stop before hard-cancel.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Poll timeout inside the dispatch loop so the running flag is observed.
const DISPATCH_POLL: Duration = Duration::from_millis(100);

pub struct EventBus {
    tx: mpsc::Sender<SystemEvent>,
    rx_slot: Arc<Mutex<Option<mpsc::Receiver<SystemEvent>>>>,
    subscribers: Arc<RwLock<Vec<Arc<dyn EventHandler>>>>,
    emergency_callback: RwLock<Option<EmergencyCallback>>,
    drop_count: AtomicU64,
    fallback_log_path: Option<PathBuf>,
    running: Arc<AtomicBool>,
    dispatch_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl EventBus {
    pub fn new(config: &ResilienceConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.event_bus_queue_size);
        Self {
            tx,
            rx_slot: Arc::new(Mutex::new(Some(rx))),
            subscribers: Arc::new(RwLock::new(Vec::new())),
            emergency_callback: RwLock::new(None),
            drop_count: AtomicU64::new(0),
            fallback_log_path: config.fallback_log_path.clone(),
            running: Arc::new(AtomicBool::new(false)),
            dispatch_task: Mutex::new(None),
        }
    }

    /// Events dropped due to a full queue.
    pub fn drop_count(&self) -> u64 {
        self.drop_count.load(Ordering::Relaxed)
    }

    /// Events currently waiting in the queue.
    pub fn pending_count(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Non-blocking publish. Returns true if the event was queued.
    ///
    /// A dropped critical event triggers the emergency callback before this
    /// returns, so callers observe the local degrade immediately.
    pub fn publish(&self, event: SystemEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                self.drop_count.fetch_add(1, Ordering::Relaxed);
                self.write_fallback_log("QueueFull", &event);
                if event.is_critical() {
                    self.local_emergency_degrade(&event);
                }
                false
            }
            Err(TrySendError::Closed(event)) => {
                self.drop_count.fetch_add(1, Ordering::Relaxed);
                self.write_fallback_log("BusStopped", &event);
                if event.is_critical() {
                    self.local_emergency_degrade(&event);
                }
                false
            }
        }
    }

    /// Register a handler to receive dispatched events.
    pub fn subscribe(&self, handler: Arc<dyn EventHandler>) {
        self.subscribers.write().push(handler);
    }

    /// Register the callback invoked when a critical event cannot be
    /// queued. It should take immediate local protective action.
    pub fn set_emergency_callback(&self, callback: EmergencyCallback) {
        *self.emergency_callback.write() = Some(callback);
    }

    /// Start the dispatch task. Calling twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let bus = Arc::clone(self);
        let handle = tokio::spawn(async move {
            bus.dispatch_loop().await;
        });
        *self.dispatch_task.lock() = Some(handle);
        info!("EventBus started");
    }

    /// Stop the dispatch task. Calling twice is a no-op. In-flight dispatch
    /// gets a short grace period, then the task is hard-cancelled.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let handle = self.dispatch_task.lock().take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(STOP_GRACE, &mut handle).await.is_err() {
                warn!("EventBus dispatcher did not drain within grace period, aborting");
                handle.abort();
            }
        }
        info!("EventBus stopped");
    }

    async fn dispatch_loop(self: Arc<Self>) {
        let mut rx = match self.rx_slot.lock().take() {
            Some(rx) => rx,
            // A second dispatcher raced us; nothing to do.
            None => return,
        };

        while self.running.load(Ordering::Relaxed) {
            match tokio::time::timeout(DISPATCH_POLL, rx.recv()).await {
                Ok(Some(event)) => self.notify_subscribers(&event).await,
                Ok(None) => break,
                Err(_) => continue,
            }
        }

        // Park the receiver so a later start() resumes the same queue.
        *self.rx_slot.lock() = Some(rx);
    }

    async fn notify_subscribers(&self, event: &SystemEvent) {
        let handlers: Vec<Arc<dyn EventHandler>> = self.subscribers.read().clone();
        for handler in handlers {
            if let Err(e) = handler.handle_event(event).await {
                error!(
                    reason_code = event.reason_code.as_str(),
                    "Error in event handler: {e:#}"
                );
            }
        }
    }

    fn local_emergency_degrade(&self, event: &SystemEvent) {
        error!(
            reason_code = event.reason_code.as_str(),
            "Critical event dropped, triggering emergency degrade"
        );

        let callback = self.emergency_callback.read().clone();
        if let Some(callback) = callback {
            callback(event);
        }
    }

    fn write_fallback_log(&self, reason: &str, event: &SystemEvent) {
        let Some(path) = &self.fallback_log_path else {
            return;
        };

        let mut record = event.to_json();
        if let Some(fields) = record.as_object_mut() {
            fields.insert("reason".to_string(), json!(reason));
            fields.insert("is_critical".to_string(), json!(event.is_critical()));
        }

        // Best effort: a failing fallback log must never take down publish.
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut f| writeln!(f, "{record}"));
        if let Err(e) = result {
            error!("Failed to write fallback log: {e}");
        } else {
            debug!(reason, "Dropped event written to fallback log");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ComponentSource, EventType, ReasonCode, Severity};
    use std::sync::atomic::AtomicUsize;

    fn test_config(queue_size: usize, fallback: Option<PathBuf>) -> ResilienceConfig {
        ResilienceConfig {
            event_bus_queue_size: queue_size,
            fallback_log_path: fallback,
            ..ResilienceConfig::default()
        }
    }

    fn critical_event() -> SystemEvent {
        SystemEvent::new(
            EventType::FailCrit,
            ComponentSource::Broker,
            Severity::Critical,
            ReasonCode::BrokerDisconnect,
            None,
            None,
        )
    }

    fn benign_event() -> SystemEvent {
        SystemEvent::new(
            EventType::Heartbeat,
            ComponentSource::System,
            Severity::Info,
            ReasonCode::AllHealthy,
            None,
            None,
        )
    }

    struct Counter {
        seen: AtomicUsize,
    }

    #[async_trait]
    impl EventHandler for Counter {
        async fn handle_event(&self, _event: &SystemEvent) -> Result<()> {
            self.seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Faulty;

    #[async_trait]
    impl EventHandler for Faulty {
        async fn handle_event(&self, _event: &SystemEvent) -> Result<()> {
            anyhow::bail!("subscriber exploded")
        }
    }

    #[tokio::test]
    async fn publish_never_blocks_and_counts_drops() {
        let bus = Arc::new(EventBus::new(&test_config(2, None)));

        assert!(bus.publish(benign_event()));
        assert!(bus.publish(benign_event()));
        // Queue full, no dispatcher draining: must return immediately.
        assert!(!bus.publish(benign_event()));
        assert_eq!(bus.drop_count(), 1);
        assert_eq!(bus.pending_count(), 2);
    }

    #[tokio::test]
    async fn critical_drop_invokes_emergency_callback() {
        let bus = Arc::new(EventBus::new(&test_config(1, None)));
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_cb = Arc::clone(&fired);
        bus.set_emergency_callback(Arc::new(move |_event| {
            fired_cb.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(bus.publish(benign_event()));
        // Non-critical drop: callback must NOT fire.
        assert!(!bus.publish(benign_event()));
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        // Critical drop: callback fires before publish returns.
        assert!(!bus.publish(critical_event()));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dropped_events_land_in_fallback_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fallback.jsonl");
        let bus = Arc::new(EventBus::new(&test_config(1, Some(path.clone()))));

        assert!(bus.publish(benign_event()));
        assert!(!bus.publish(critical_event()));

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 1);
        let record: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(record["reason"], "QueueFull");
        assert_eq!(record["reason_code"], "broker.disconnect");
        assert_eq!(record["is_critical"], true);
    }

    #[tokio::test]
    async fn dispatcher_delivers_and_isolates_faulty_subscribers() {
        let bus = Arc::new(EventBus::new(&test_config(16, None)));
        let counter = Arc::new(Counter {
            seen: AtomicUsize::new(0),
        });
        // Faulty subscriber first: its failure must not starve the counter.
        bus.subscribe(Arc::new(Faulty));
        bus.subscribe(Arc::clone(&counter) as Arc<dyn EventHandler>);

        bus.start();
        assert!(bus.publish(benign_event()));
        assert!(bus.publish(benign_event()));

        tokio::time::timeout(Duration::from_secs(2), async {
            while counter.seen.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("subscriber never saw both events");

        bus.stop().await;
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let bus = Arc::new(EventBus::new(&test_config(4, None)));
        bus.start();
        bus.start();
        assert!(bus.is_running());
        bus.stop().await;
        bus.stop().await;
        assert!(!bus.is_running());

        // Restart resumes the same queue.
        bus.start();
        assert!(bus.is_running());
        bus.stop().await;
    }
}
