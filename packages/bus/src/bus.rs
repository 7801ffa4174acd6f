//! Bus core.
//!
//! Fan-out broker over one attached transport. Subscriptions are bounded
//! queues (a lagging subscriber drops the newest message and the drop is
//! reported); inbound messages are de-duplicated by id, so the local
//! echo of an own publish and transport redelivery both collapse into
//! one delivery.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;

use mergeflow_types::{Clock, Envelope, SystemClock};

use crate::channels::matches_pattern;
use crate::error::BusError;
use crate::transport::Transport;

/// Bus tuning.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Cap on messages queued while a transition is in flight; beyond it
    /// the oldest queued message is dropped and reported.
    pub max_pending: usize,
    /// Drain retries per message after a transition completes.
    pub retry_attempts: u32,
    pub retry_base_delay: std::time::Duration,
    /// Bound of the per-id de-duplication window.
    pub dedup_capacity: usize,
    /// Depth of each subscription queue.
    pub subscriber_queue: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_pending: 1_000,
            retry_attempts: 3,
            retry_base_delay: std::time::Duration::from_millis(100),
            dedup_capacity: 4_096,
            subscriber_queue: 256,
        }
    }
}

/// Diagnostic events surfaced to the hub.
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    MessageDropped { channel: String, id: String },
    MessageExpired { channel: String, id: String },
    HandlerError { channel: String },
}

struct Subscriber {
    pattern: String,
    tx: mpsc::Sender<(String, Envelope)>,
}

/// Bounded first-seen set over message ids.
struct DedupWindow {
    seen: HashSet<String>,
    order: VecDeque<String>,
    capacity: usize,
}

impl DedupWindow {
    fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// True the first time an id is seen.
    fn first_seen(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        if self.order.len() == self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        self.seen.insert(id.to_string());
        self.order.push_back(id.to_string());
        true
    }
}

struct BusInner {
    config: BusConfig,
    clock: Arc<dyn Clock>,
    transport: RwLock<Option<Arc<dyn Transport>>>,
    transitioning: AtomicBool,
    pending: Mutex<VecDeque<(String, Envelope)>>,
    subscribers: Mutex<Vec<Subscriber>>,
    dedup: Mutex<DedupWindow>,
    handler_errors: Mutex<HashMap<String, u64>>,
    events: broadcast::Sender<BusEvent>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

/// The transport-agnostic message bus.
#[derive(Clone)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl MessageBus {
    pub fn new(config: BusConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: BusConfig, clock: Arc<dyn Clock>) -> Self {
        let (events, _) = broadcast::channel(256);
        let dedup_capacity = config.dedup_capacity;
        Self {
            inner: Arc::new(BusInner {
                config,
                clock,
                transport: RwLock::new(None),
                transitioning: AtomicBool::new(false),
                pending: Mutex::new(VecDeque::new()),
                subscribers: Mutex::new(Vec::new()),
                dedup: Mutex::new(DedupWindow::new(dedup_capacity)),
                handler_errors: Mutex::new(HashMap::new()),
                events,
                pump: Mutex::new(None),
            }),
        }
    }

    /// Diagnostic event stream.
    pub fn events(&self) -> broadcast::Receiver<BusEvent> {
        self.inner.events.subscribe()
    }

    fn emit(&self, event: BusEvent) {
        let _ = self.inner.events.send(event);
    }

    /// Current transport name, if any.
    pub async fn transport_name(&self) -> Option<&'static str> {
        self.inner.transport.read().await.as_ref().map(|t| t.name())
    }

    /// Register a bounded subscription for channels matching `pattern`.
    pub fn subscribe(&self, pattern: &str) -> mpsc::Receiver<(String, Envelope)> {
        let (tx, rx) = mpsc::channel(self.inner.config.subscriber_queue);
        self.inner.subscribers.lock().push(Subscriber {
            pattern: pattern.to_string(),
            tx,
        });
        rx
    }

    /// Attach (or replace) the transport and start pumping its messages
    /// into local subscriptions.
    pub async fn attach_transport(&self, transport: Arc<dyn Transport>) -> Result<(), BusError> {
        let mut inbound = transport.subscribe("*").await?;
        {
            let mut slot = self.inner.transport.write().await;
            *slot = Some(transport);
        }

        let bus = self.clone();
        let pump = tokio::spawn(async move {
            while let Some((channel, envelope)) = inbound.recv().await {
                bus.dispatch(&channel, envelope);
            }
        });

        if let Some(previous) = self.inner.pump.lock().replace(pump) {
            previous.abort();
        }
        Ok(())
    }

    /// Deliver to local subscribers, once per message id.
    fn dispatch(&self, channel: &str, envelope: Envelope) {
        if !self.inner.dedup.lock().first_seen(&envelope.id) {
            return;
        }
        if envelope.is_expired(self.inner.clock.now()) {
            self.emit(BusEvent::MessageExpired {
                channel: channel.to_string(),
                id: envelope.id.clone(),
            });
            return;
        }

        let mut subscribers = self.inner.subscribers.lock();
        subscribers.retain(|s| !s.tx.is_closed());
        for subscriber in subscribers.iter() {
            if !matches_pattern(channel, &subscriber.pattern) {
                continue;
            }
            match subscriber.tx.try_send((channel.to_string(), envelope.clone())) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.emit(BusEvent::MessageDropped {
                        channel: channel.to_string(),
                        id: envelope.id.clone(),
                    });
                    tracing::warn!(
                        channel = %channel,
                        pattern = %subscriber.pattern,
                        "subscriber queue full, message dropped"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
    }

    /// Publish a message. While a mode transition is in flight the
    /// message queues instead of erroring.
    pub async fn publish(&self, channel: &str, envelope: Envelope) -> Result<(), BusError> {
        if self.inner.transitioning.load(Ordering::Acquire) {
            self.enqueue_pending(channel, envelope);
            return Ok(());
        }

        let transport = {
            let slot = self.inner.transport.read().await;
            slot.clone().ok_or(BusError::NoTransport)?
        };
        transport.publish(channel, &envelope).await?;

        // Local echo; the dedup window absorbs the transport copy.
        self.dispatch(channel, envelope);
        Ok(())
    }

    fn enqueue_pending(&self, channel: &str, envelope: Envelope) {
        let mut pending = self.inner.pending.lock();
        if pending.len() == self.inner.config.max_pending {
            if let Some((dropped_channel, dropped)) = pending.pop_front() {
                self.emit(BusEvent::MessageDropped {
                    channel: dropped_channel,
                    id: dropped.id,
                });
            }
        }
        pending.push_back((channel.to_string(), envelope));
    }

    /// Enter the transitioning state: publishes queue from here on.
    pub fn begin_transition(&self) {
        self.inner.transitioning.store(true, Ordering::Release);
    }

    /// Leave the transitioning state without swapping transports. Queued
    /// messages stay queued for the next completed transition.
    pub fn abort_transition(&self) {
        self.inner.transitioning.store(false, Ordering::Release);
    }

    pub fn is_transitioning(&self) -> bool {
        self.inner.transitioning.load(Ordering::Acquire)
    }

    pub fn pending_len(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Attach the post-transition transport and drain the queue in FIFO
    /// order with retry and exponential backoff. Messages whose TTL has
    /// lapsed are discarded.
    pub async fn complete_transition(
        &self,
        transport: Arc<dyn Transport>,
    ) -> Result<(), BusError> {
        self.attach_transport(transport.clone()).await?;
        self.inner.transitioning.store(false, Ordering::Release);

        loop {
            let next = self.inner.pending.lock().pop_front();
            let Some((channel, envelope)) = next else {
                break;
            };

            if envelope.is_expired(self.inner.clock.now()) {
                self.emit(BusEvent::MessageExpired {
                    channel,
                    id: envelope.id,
                });
                continue;
            }

            let mut delivered = false;
            for attempt in 0..self.inner.config.retry_attempts {
                match transport.publish(&channel, &envelope).await {
                    Ok(()) => {
                        self.dispatch(&channel, envelope.clone());
                        delivered = true;
                        break;
                    }
                    Err(err) => {
                        tracing::warn!(
                            channel = %channel,
                            attempt,
                            error = %err,
                            "drain publish failed"
                        );
                        let backoff = self.inner.config.retry_base_delay
                            * 2u32.saturating_pow(attempt);
                        let jitter =
                            rand::thread_rng().gen_range(0..=backoff.as_millis().max(1) as u64 / 2);
                        tokio::time::sleep(backoff + std::time::Duration::from_millis(jitter))
                            .await;
                    }
                }
            }
            if !delivered {
                self.emit(BusEvent::MessageDropped {
                    channel,
                    id: envelope.id,
                });
            }
        }
        Ok(())
    }

    /// Record a failed downstream handler for `channel`.
    pub fn report_handler_error(&self, channel: &str) {
        *self
            .inner
            .handler_errors
            .lock()
            .entry(channel.to_string())
            .or_insert(0) += 1;
        self.emit(BusEvent::HandlerError {
            channel: channel.to_string(),
        });
    }

    pub fn handler_error_count(&self, channel: &str) -> u64 {
        self.inner
            .handler_errors
            .lock()
            .get(channel)
            .copied()
            .unwrap_or(0)
    }
}
