//! Priority message queue in front of the thread manager.
//!
//! Messages are buffered by [`Priority`] (Critical > High > Normal > Low,
//! FIFO within a level) and dispatched to the worker by a background loop
//! with a fixed number of concurrent slots. While the worker is not running
//! the queue only buffers, expiring entries whose timeout elapses.
//!
//! When the buffer is full, the oldest entry of the lowest non-empty priority
//! is evicted if that priority is not above the incoming one; otherwise the
//! incoming message is rejected. Both outcomes surface as `QUEUE_FULL`.

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{Mutex, Notify, RwLock, Semaphore, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use warden_config::MessageQueueConfig;
use warden_core::types::{Component, Priority};
use warden_core::{Result, WardenError};

use crate::events::{EventBus, EventKind};
use crate::protocol::{Envelope, WorkerResponse};
use crate::thread_manager::ThreadManager;

/// Upper bound on how long the dispatch loop sleeps without an event.
const IDLE_TICK: Duration = Duration::from_millis(100);

/// Result of [`PriorityBuffer::push`].
#[derive(Debug)]
pub enum PushOutcome<T> {
    Accepted,
    /// Accepted after evicting an older, not more urgent entry
    Evicted { victim: T, priority: Priority },
    /// Buffer full of more urgent entries
    Rejected(T),
}

/// Bounded multi-level FIFO.
#[derive(Debug)]
pub struct PriorityBuffer<T> {
    levels: [VecDeque<T>; 4],
}

impl<T> Default for PriorityBuffer<T> {
    fn default() -> Self {
        Self {
            levels: Default::default(),
        }
    }
}

impl<T> PriorityBuffer<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.levels.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.levels.iter().all(VecDeque::is_empty)
    }

    pub fn depth(&self, priority: Priority) -> usize {
        self.levels[priority.index()].len()
    }

    pub fn push(&mut self, priority: Priority, item: T, capacity: usize) -> PushOutcome<T> {
        if self.len() < capacity {
            self.levels[priority.index()].push_back(item);
            return PushOutcome::Accepted;
        }

        let lowest = Priority::DESCENDING
            .iter()
            .rev()
            .copied()
            .find(|p| !self.levels[p.index()].is_empty());

        match lowest {
            Some(lowest) if lowest <= priority => match self.levels[lowest.index()].pop_front() {
                Some(victim) => {
                    self.levels[priority.index()].push_back(item);
                    PushOutcome::Evicted {
                        victim,
                        priority: lowest,
                    }
                }
                None => PushOutcome::Rejected(item),
            },
            _ => PushOutcome::Rejected(item),
        }
    }

    /// Most urgent, oldest entry.
    pub fn pop(&mut self) -> Option<(Priority, T)> {
        Priority::DESCENDING
            .iter()
            .find_map(|p| self.levels[p.index()].pop_front().map(|item| (*p, item)))
    }

    /// Remove every entry matching `pred`, preserving the order of the rest.
    pub fn drain_where<F>(&mut self, mut pred: F) -> Vec<(Priority, T)>
    where
        F: FnMut(&T) -> bool,
    {
        let mut removed = Vec::new();
        for priority in Priority::DESCENDING {
            let level = &mut self.levels[priority.index()];
            let mut kept = VecDeque::with_capacity(level.len());
            for item in level.drain(..) {
                if pred(&item) {
                    removed.push((priority, item));
                } else {
                    kept.push_back(item);
                }
            }
            *level = kept;
        }
        removed
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.levels.iter().flat_map(VecDeque::iter)
    }
}

struct QueuedMessage {
    envelope: Envelope,
    correlation_id: String,
    enqueued_at: Instant,
    deadline: Option<Instant>,
    timeout_ms: u64,
    responder: oneshot::Sender<Result<WorkerResponse>>,
}

/// Queue depth and throughput.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub is_running: bool,
    pub depth: usize,
    pub depth_by_priority: BTreeMap<Priority, usize>,
    pub capacity: usize,
    pub max_concurrent: usize,
    pub in_flight: usize,
    pub oldest_age_ms: u64,
    pub average_age_ms: u64,
    pub total_enqueued: u64,
    pub total_dispatched: u64,
    pub total_evicted: u64,
    pub total_rejected: u64,
    pub total_expired: u64,
    pub total_cancelled: u64,
}

#[derive(Default)]
struct QueueCounters {
    enqueued: AtomicU64,
    dispatched: AtomicU64,
    evicted: AtomicU64,
    rejected: AtomicU64,
    expired: AtomicU64,
    cancelled: AtomicU64,
}

struct QueueInner {
    config: RwLock<MessageQueueConfig>,
    threads: ThreadManager,
    bus: EventBus,
    buffer: Mutex<PriorityBuffer<QueuedMessage>>,
    notify: Notify,
    slots: Arc<Semaphore>,
    /// Permits to forget as they are returned, after the slot count shrank
    retire: AtomicUsize,
    in_flight: AtomicUsize,
    running: AtomicBool,
    task: Mutex<Option<(JoinHandle<()>, watch::Sender<bool>)>>,
    counters: QueueCounters,
}

#[derive(Clone)]
pub struct MessageQueue {
    inner: Arc<QueueInner>,
}

impl MessageQueue {
    pub fn new(config: MessageQueueConfig, threads: ThreadManager, bus: EventBus) -> Self {
        let slots = Arc::new(Semaphore::new(config.max_concurrent.max(1)));
        Self {
            inner: Arc::new(QueueInner {
                config: RwLock::new(config),
                threads,
                bus,
                buffer: Mutex::new(PriorityBuffer::new()),
                notify: Notify::new(),
                slots,
                retire: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                running: AtomicBool::new(false),
                task: Mutex::new(None),
                counters: QueueCounters::default(),
            }),
        }
    }

    /// Start dispatching. No-op if already running.
    pub async fn start(&self) {
        let mut task = self.inner.task.lock().await;
        if task.is_some() {
            return;
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.inner.running.store(true, Ordering::SeqCst);
        let handle = tokio::spawn(dispatch_loop(self.inner.clone(), shutdown_rx));
        *task = Some((handle, shutdown_tx));
        info!("Message queue started");
    }

    /// Stop dispatching and cancel everything still buffered.
    ///
    /// Messages already handed to the worker complete normally. Returns the
    /// number of cancelled messages.
    pub async fn stop(&self) -> usize {
        let task = self.inner.task.lock().await.take();
        let drained = {
            let mut buffer = self.inner.buffer.lock().await;
            self.inner.running.store(false, Ordering::SeqCst);
            buffer.drain_where(|_| true)
        };

        if let Some((handle, shutdown)) = task {
            let _ = shutdown.send(true);
            if let Err(e) = handle.await {
                warn!(error = %e, "Dispatch loop ended abnormally");
            }
        }

        let cancelled = drained.len();
        for (_, message) in drained {
            let _ = message
                .responder
                .send(Err(WardenError::cancelled("message queue stopped")));
        }
        self.inner
            .counters
            .cancelled
            .fetch_add(cancelled as u64, Ordering::Relaxed);
        info!(cancelled, "Message queue stopped");
        cancelled
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Buffer `envelope` and wait for its outcome.
    pub async fn enqueue(&self, mut envelope: Envelope) -> Result<WorkerResponse> {
        let correlation_id = envelope.ensure_correlation_id();
        let priority = envelope.priority;
        let capacity = self.inner.config.read().await.capacity;
        let timeout = match envelope.timeout() {
            Some(timeout) => Some(timeout),
            None => self.inner.threads.config().await.default_message_timeout(),
        };

        let enqueued_at = Instant::now();
        let (tx, rx) = oneshot::channel();
        let message = QueuedMessage {
            envelope,
            correlation_id: correlation_id.clone(),
            enqueued_at,
            deadline: timeout.map(|t| enqueued_at + t),
            timeout_ms: timeout.map(|t| t.as_millis() as u64).unwrap_or(0),
            responder: tx,
        };

        let outcome = {
            let mut buffer = self.inner.buffer.lock().await;
            if !self.is_running() {
                return Err(WardenError::cancelled("message queue is not running"));
            }
            buffer.push(priority, message, capacity)
        };

        match outcome {
            PushOutcome::Accepted => {}
            PushOutcome::Evicted { victim, priority } => {
                self.inner.counters.evicted.fetch_add(1, Ordering::Relaxed);
                warn!(correlation_id = %victim.correlation_id, priority = %priority, "Evicted queued message");
                self.inner.bus.publish(
                    Component::MessageQueue,
                    EventKind::MessageEvicted {
                        correlation_id: victim.correlation_id.clone(),
                        priority,
                    },
                );
                let _ = victim.responder.send(Err(WardenError::QueueFull { capacity }));
            }
            PushOutcome::Rejected(_) => {
                self.inner.counters.rejected.fetch_add(1, Ordering::Relaxed);
                debug!(correlation_id = %correlation_id, priority = %priority, "Queue full, rejected");
                return Err(WardenError::QueueFull { capacity });
            }
        }

        self.inner.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        self.inner.notify.notify_one();

        rx.await
            .unwrap_or_else(|_| Err(WardenError::cancelled("message queue dropped the request")))
    }

    pub async fn get_stats(&self) -> QueueStats {
        let config = self.inner.config.read().await.clone();
        let buffer = self.inner.buffer.lock().await;

        let ages: Vec<u64> = buffer
            .iter()
            .map(|m| m.enqueued_at.elapsed().as_millis() as u64)
            .collect();
        let depth_by_priority = Priority::DESCENDING
            .iter()
            .map(|p| (*p, buffer.depth(*p)))
            .collect();

        let c = &self.inner.counters;
        QueueStats {
            is_running: self.is_running(),
            depth: buffer.len(),
            depth_by_priority,
            capacity: config.capacity,
            max_concurrent: config.max_concurrent,
            in_flight: self.inner.in_flight.load(Ordering::SeqCst),
            oldest_age_ms: ages.iter().copied().max().unwrap_or(0),
            average_age_ms: if ages.is_empty() {
                0
            } else {
                ages.iter().sum::<u64>() / ages.len() as u64
            },
            total_enqueued: c.enqueued.load(Ordering::Relaxed),
            total_dispatched: c.dispatched.load(Ordering::Relaxed),
            total_evicted: c.evicted.load(Ordering::Relaxed),
            total_rejected: c.rejected.load(Ordering::Relaxed),
            total_expired: c.expired.load(Ordering::Relaxed),
            total_cancelled: c.cancelled.load(Ordering::Relaxed),
        }
    }

    /// Capacity applies to the next enqueue. A smaller slot count takes
    /// effect as in-flight messages complete; a larger one immediately.
    pub async fn update_config(&self, config: MessageQueueConfig) {
        let mut current = self.inner.config.write().await;
        let (old, new) = (current.max_concurrent.max(1), config.max_concurrent.max(1));
        if new > old {
            let mut grow = new - old;
            while grow > 0 && self.inner.take_retirement() {
                grow -= 1;
            }
            self.inner.slots.add_permits(grow);
        } else if new < old {
            let mut shrink = old - new;
            while shrink > 0 {
                match self.inner.slots.try_acquire() {
                    Ok(permit) => {
                        permit.forget();
                        shrink -= 1;
                    }
                    Err(_) => break,
                }
            }
            self.inner.retire.fetch_add(shrink, Ordering::SeqCst);
        }
        *current = config;
        drop(current);
        self.inner.notify.notify_one();
        debug!("Message queue config updated");
    }
}

impl QueueInner {
    /// Claim one pending retirement, if any.
    fn take_retirement(&self) -> bool {
        self.retire
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Fail every buffered message whose deadline has passed.
    async fn expire_overdue(&self) {
        let now = Instant::now();
        let expired = self
            .buffer
            .lock()
            .await
            .drain_where(|m| m.deadline.is_some_and(|d| d <= now));

        for (_, message) in expired {
            self.counters.expired.fetch_add(1, Ordering::Relaxed);
            debug!(correlation_id = %message.correlation_id, "Queued message expired");
            self.bus.publish(
                Component::MessageQueue,
                EventKind::MessageExpired {
                    correlation_id: message.correlation_id.clone(),
                },
            );
            let _ = message
                .responder
                .send(Err(WardenError::timeout(message.correlation_id, message.timeout_ms)));
        }
    }

    /// Time until the nearest deadline, capped at [`IDLE_TICK`].
    async fn next_wait(&self) -> Duration {
        let now = Instant::now();
        self.buffer
            .lock()
            .await
            .iter()
            .filter_map(|m| m.deadline)
            .map(|d| d.saturating_duration_since(now))
            .min()
            .map_or(IDLE_TICK, |d| d.min(IDLE_TICK))
    }
}

async fn dispatch_loop(inner: Arc<QueueInner>, mut shutdown: watch::Receiver<bool>) {
    let mut events = inner.bus.subscribe();

    loop {
        if *shutdown.borrow() {
            break;
        }

        inner.expire_overdue().await;
        let wait = inner.next_wait().await;

        if !inner.threads.is_worker_running().await {
            tokio::select! {
                _ = shutdown.changed() => {}
                _ = events.recv() => {}
                _ = tokio::time::sleep(wait) => {}
            }
            continue;
        }

        if inner.buffer.lock().await.is_empty() {
            tokio::select! {
                _ = shutdown.changed() => {}
                _ = inner.notify.notified() => {}
                _ = tokio::time::sleep(wait) => {}
            }
            continue;
        }

        let permit = tokio::select! {
            permit = inner.slots.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => continue,
            },
            _ = shutdown.changed() => break,
        };
        if inner.take_retirement() {
            permit.forget();
            continue;
        }

        let next = inner.buffer.lock().await.pop();
        let Some((priority, message)) = next else {
            continue;
        };
        if message.deadline.is_some_and(|d| d <= Instant::now()) {
            inner.counters.expired.fetch_add(1, Ordering::Relaxed);
            let _ = message
                .responder
                .send(Err(WardenError::timeout(message.correlation_id, message.timeout_ms)));
            continue;
        }

        inner.counters.dispatched.fetch_add(1, Ordering::Relaxed);
        debug!(correlation_id = %message.correlation_id, priority = %priority, "Dispatching queued message");
        let QueuedMessage {
            mut envelope,
            deadline,
            timeout_ms,
            responder,
            ..
        } = message;
        // Time spent buffered counts against the message's timeout.
        if let Some(deadline) = deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            envelope.timeout_ms = Some((remaining.as_millis() as u64).max(1));
        }

        let threads = inner.threads.clone();
        let shared = inner.clone();
        inner.in_flight.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            let result = match threads.send_message(envelope).await {
                Err(WardenError::Timeout { request_id, .. }) => Err(WardenError::timeout(request_id, timeout_ms)),
                other => other,
            };
            let _ = responder.send(result);
            shared.in_flight.fetch_sub(1, Ordering::SeqCst);
            if shared.take_retirement() {
                permit.forget();
            }
        });
    }

    debug!("Dispatch loop exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{TestBackend, fast_config, wait_for};
    use serde_json::json;
    use warden_core::ErrorKind;

    #[test]
    fn test_buffer_priority_then_fifo() {
        let mut buffer = PriorityBuffer::new();
        buffer.push(Priority::Low, "low-1", 10);
        buffer.push(Priority::Critical, "crit-1", 10);
        buffer.push(Priority::Normal, "normal-1", 10);
        buffer.push(Priority::Critical, "crit-2", 10);

        let order: Vec<&str> = std::iter::from_fn(|| buffer.pop().map(|(_, item)| item)).collect();
        assert_eq!(order, vec!["crit-1", "crit-2", "normal-1", "low-1"]);
    }

    #[test]
    fn test_buffer_evicts_oldest_lowest() {
        let mut buffer = PriorityBuffer::new();
        buffer.push(Priority::Low, "low-1", 2);
        buffer.push(Priority::Low, "low-2", 2);

        match buffer.push(Priority::High, "high", 2) {
            PushOutcome::Evicted { victim, priority } => {
                assert_eq!(victim, "low-1");
                assert_eq!(priority, Priority::Low);
            }
            other => panic!("expected eviction, got {other:?}"),
        }
        assert_eq!(buffer.depth(Priority::High), 1);
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn test_buffer_never_evicts_more_urgent() {
        let mut buffer = PriorityBuffer::new();
        buffer.push(Priority::Critical, "crit", 1);

        assert!(matches!(buffer.push(Priority::Low, "low", 1), PushOutcome::Rejected("low")));
        assert_eq!(buffer.pop(), Some((Priority::Critical, "crit")));
    }

    #[test]
    fn test_buffer_spares_critical_while_lower_remain() {
        let mut buffer = PriorityBuffer::new();
        buffer.push(Priority::Critical, "crit", 2);
        buffer.push(Priority::Normal, "normal", 2);

        match buffer.push(Priority::Critical, "crit-2", 2) {
            PushOutcome::Evicted { victim, .. } => assert_eq!(victim, "normal"),
            other => panic!("expected eviction, got {other:?}"),
        }
        assert_eq!(buffer.depth(Priority::Critical), 2);
    }

    #[test]
    fn test_drain_where() {
        let mut buffer = PriorityBuffer::new();
        for (p, v) in [(Priority::Low, 1), (Priority::High, 2), (Priority::Low, 3)] {
            buffer.push(p, v, 10);
        }
        let removed = buffer.drain_where(|v| v % 2 == 1);
        assert_eq!(removed.len(), 2);
        assert_eq!(buffer.pop(), Some((Priority::High, 2)));
        assert!(buffer.is_empty());
    }

    fn setup(capacity: usize, max_concurrent: usize) -> (TestBackend, ThreadManager, MessageQueue) {
        let backend = TestBackend::new();
        let bus = EventBus::default();
        let threads = ThreadManager::new(fast_config().thread_manager, bus.clone(), backend.factory());
        let queue = MessageQueue::new(
            MessageQueueConfig {
                enabled: true,
                capacity,
                max_concurrent,
            },
            threads.clone(),
            bus,
        );
        (backend, threads, queue)
    }

    fn tagged(tag: &str, priority: Priority) -> Envelope {
        Envelope::new("echo", json!({ "tag": tag })).with_priority(priority)
    }

    #[tokio::test]
    async fn test_single_slot_dispatches_by_priority() {
        let (backend, threads, queue) = setup(10, 1);
        queue.start().await;

        let mut sends = Vec::new();
        for (tag, priority) in [
            ("low", Priority::Low),
            ("critical", Priority::Critical),
            ("normal", Priority::Normal),
        ] {
            let queue = queue.clone();
            let envelope = tagged(tag, priority);
            sends.push(tokio::spawn(async move { queue.enqueue(envelope).await }));
        }
        assert!(wait_for(Duration::from_secs(1), || async { queue.get_stats().await.depth == 3 }).await);

        threads.start_worker().await.unwrap();
        for send in sends {
            assert!(send.await.unwrap().unwrap().success);
        }

        assert_eq!(backend.log(), vec!["critical", "normal", "low"]);
        let stats = queue.get_stats().await;
        assert_eq!(stats.total_dispatched, 3);
        assert_eq!(stats.depth, 0);

        queue.stop().await;
        threads.stop_worker(true, "test").await.unwrap();
    }

    #[tokio::test]
    async fn test_expires_while_worker_down() {
        let (_backend, _threads, queue) = setup(10, 1);
        queue.start().await;

        let envelope = Envelope::new("echo", json!({})).with_timeout(Duration::from_millis(50));
        let err = queue.enqueue(envelope).await.unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(queue.get_stats().await.total_expired, 1);
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_stop_cancels_buffered() {
        let (_backend, _threads, queue) = setup(10, 1);
        queue.start().await;

        let pending = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.enqueue(Envelope::new("echo", json!({}))).await })
        };
        assert!(wait_for(Duration::from_secs(1), || async { queue.get_stats().await.depth == 1 }).await);

        assert_eq!(queue.stop().await, 1);
        let err = pending.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert!(!queue.is_running());
    }

    #[tokio::test]
    async fn test_enqueue_requires_running_queue() {
        let (_backend, _threads, queue) = setup(10, 1);
        let err = queue.enqueue(Envelope::new("echo", json!({}))).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn test_full_queue_evicts_and_rejects() {
        let (_backend, _threads, queue) = setup(1, 1);
        queue.start().await;

        let first = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.enqueue(tagged("first", Priority::Normal)).await })
        };
        assert!(wait_for(Duration::from_secs(1), || async { queue.get_stats().await.depth == 1 }).await);

        let second = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.enqueue(tagged("second", Priority::Critical)).await })
        };
        let err = first.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QueueFull);

        let err = queue.enqueue(tagged("third", Priority::Low)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QueueFull);

        let stats = queue.get_stats().await;
        assert_eq!(stats.total_evicted, 1);
        assert_eq!(stats.total_rejected, 1);
        assert_eq!(stats.depth_by_priority[&Priority::Critical], 1);

        queue.stop().await;
        assert_eq!(second.await.unwrap().unwrap_err().kind(), ErrorKind::Cancelled);
    }

    fn spawn_enqueue(queue: &MessageQueue, envelope: Envelope) -> tokio::task::JoinHandle<Result<WorkerResponse>> {
        let queue = queue.clone();
        tokio::spawn(async move { queue.enqueue(envelope).await })
    }

    #[tokio::test]
    async fn test_time_buffered_counts_against_timeout() {
        let (_backend, threads, queue) = setup(10, 1);
        threads.start_worker().await.unwrap();
        queue.start().await;

        let blocker = spawn_enqueue(&queue, Envelope::new("sleep", json!({"ms": 100})));
        assert!(wait_for(Duration::from_secs(1), || async { queue.get_stats().await.in_flight == 1 }).await);

        let started = Instant::now();
        let envelope = Envelope::new("sleep", json!({"ms": 2_000})).with_timeout(Duration::from_millis(150));
        let err = queue.enqueue(envelope).await.unwrap_err();
        let elapsed = started.elapsed();

        assert!(matches!(err, WardenError::Timeout { timeout_ms: 150, .. }), "{err}");
        assert!(elapsed < Duration::from_millis(210), "timed out after {elapsed:?}");
        assert!(blocker.await.unwrap().unwrap().success);

        queue.stop().await;
        threads.stop_worker(false, "test").await.unwrap();
    }

    #[tokio::test]
    async fn test_update_config() {
        let (_backend, _threads, queue) = setup(10, 1);
        queue
            .update_config(MessageQueueConfig {
                enabled: true,
                capacity: 3,
                max_concurrent: 4,
            })
            .await;
        let stats = queue.get_stats().await;
        assert_eq!(stats.capacity, 3);
        assert_eq!(stats.max_concurrent, 4);
        assert_eq!(stats.in_flight, 0);
    }

    #[tokio::test]
    async fn test_resize_slots_with_messages_in_flight() {
        let (_backend, threads, queue) = setup(10, 2);
        threads.start_worker().await.unwrap();
        queue.start().await;
        let config = |max_concurrent| MessageQueueConfig {
            enabled: true,
            capacity: 10,
            max_concurrent,
        };

        let blockers: Vec<_> = (0..2)
            .map(|_| spawn_enqueue(&queue, Envelope::new("sleep", json!({"ms": 200}))))
            .collect();
        assert!(wait_for(Duration::from_secs(1), || async { queue.get_stats().await.in_flight == 2 }).await);

        // Shrinking leaves running messages counted.
        queue.update_config(config(1)).await;
        assert_eq!(queue.get_stats().await.in_flight, 2);
        for blocker in blockers {
            assert!(blocker.await.unwrap().unwrap().success);
        }

        let sends: Vec<_> = (0..3)
            .map(|_| spawn_enqueue(&queue, Envelope::new("sleep", json!({"ms": 60}))))
            .collect();
        let mut peak = 0;
        let deadline = Instant::now() + Duration::from_millis(400);
        while Instant::now() < deadline {
            peak = peak.max(queue.get_stats().await.in_flight);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        for send in sends {
            assert!(send.await.unwrap().unwrap().success);
        }
        assert_eq!(peak, 1);
        assert_eq!(queue.get_stats().await.in_flight, 0);

        queue.update_config(config(3)).await;
        let sends: Vec<_> = (0..3)
            .map(|_| spawn_enqueue(&queue, Envelope::new("sleep", json!({"ms": 200}))))
            .collect();
        assert!(wait_for(Duration::from_secs(1), || async { queue.get_stats().await.in_flight == 3 }).await);
        for send in sends {
            assert!(send.await.unwrap().unwrap().success);
        }

        queue.stop().await;
        threads.stop_worker(true, "test").await.unwrap();
    }
}
