//! Inter-stage message bus.
//!
//! Every hosted stage owns an unbounded FIFO queue. `start()` spawns one
//! dispatcher task per queue; each task hands messages to the subscribers
//! registered for (target stage, message type) in registration order.
//! `send_and_wait` layers a request/response exchange with a timeout on top,
//! resolved by `respond`.

pub mod dispatch;

pub use dispatch::TaskDispatcher;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use stratum_core::config::BusConfig;
use stratum_core::error::{Result, StratumError};
use stratum_core::message::{ContractRegistry, Message, MessageType, Payload};
use stratum_core::Stage;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Callback invoked for every message delivered to a subscription.
pub trait MessageHandler: Send + Sync + 'static {
    fn handle(&self, message: Message) -> BoxFuture<'static, Result<()>>;
}

impl<F, Fut> MessageHandler for F
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    fn handle(&self, message: Message) -> BoxFuture<'static, Result<()>> {
        (self)(message).boxed()
    }
}

/// Handle returned by [`CommunicationBus::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// History query. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub source_stage: Option<Stage>,
    pub target_stage: Option<Stage>,
    pub message_type: Option<MessageType>,
    /// Keep only the most recent matches.
    pub limit: Option<usize>,
}

impl HistoryFilter {
    fn matches(&self, message: &Message) -> bool {
        self.source_stage.map_or(true, |s| s == message.source_stage)
            && self.target_stage.map_or(true, |s| s == message.target_stage)
            && self.message_type.map_or(true, |t| t == message.message_type)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub running: bool,
    pub queued: BTreeMap<Stage, usize>,
    pub history_len: usize,
    pub conversations: usize,
    pub pending_waiters: usize,
    pub subscriptions: usize,
    pub dispatched: u64,
    pub handler_failures: u64,
}

type Subscribers = HashMap<(Stage, MessageType), Vec<(SubscriptionId, Arc<dyn MessageHandler>)>>;

/// State shared with the dispatcher tasks.
struct Shared {
    subscribers: RwLock<Subscribers>,
    queued: HashMap<Stage, AtomicUsize>,
    dispatched: AtomicU64,
    handler_failures: AtomicU64,
}

impl Shared {
    async fn deliver(&self, message: Message) {
        let handlers: Vec<(SubscriptionId, Arc<dyn MessageHandler>)> = read(&self.subscribers)
            .get(&(message.target_stage, message.message_type))
            .cloned()
            .unwrap_or_default();

        if handlers.is_empty() {
            debug!(
                message_id = %message.message_id,
                stage = %message.target_stage,
                message_type = %message.message_type,
                "No subscribers for message"
            );
        }

        for (id, handler) in handlers {
            let call = std::panic::catch_unwind(AssertUnwindSafe(|| handler.handle(message.clone())));
            let outcome = match call {
                Ok(fut) => AssertUnwindSafe(fut).catch_unwind().await,
                Err(panic) => Err(panic),
            };
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    self.handler_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(subscription = %id, message_id = %message.message_id, error = %e, "Subscriber failed");
                }
                Err(_) => {
                    self.handler_failures.fetch_add(1, Ordering::Relaxed);
                    error!(subscription = %id, message_id = %message.message_id, "Subscriber panicked");
                }
            }
        }
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    fn dequeued(&self, stage: Stage) {
        if let Some(count) = self.queued.get(&stage) {
            count.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

/// Bounded message log. Entries are keyed by sequence number so a message
/// id recorded twice keeps both entries.
#[derive(Default)]
struct History {
    max: usize,
    next_seq: u64,
    messages: VecDeque<(u64, Message)>,
    by_id: HashMap<String, Vec<u64>>,
    conversations: HashMap<String, VecDeque<u64>>,
}

impl History {
    fn record(&mut self, message: Message) {
        if self.max == 0 {
            return;
        }
        while self.messages.len() >= self.max {
            let Some((seq, old)) = self.messages.pop_front() else { break };
            if let Some(seqs) = self.by_id.get_mut(&old.message_id) {
                seqs.retain(|s| *s != seq);
                if seqs.is_empty() {
                    self.by_id.remove(&old.message_id);
                }
            }
            if let Some(conv) = old.conversation_id.as_ref() {
                if let Some(seqs) = self.conversations.get_mut(conv) {
                    seqs.retain(|s| *s != seq);
                    if seqs.is_empty() {
                        self.conversations.remove(conv);
                    }
                }
            }
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        if let Some(conv) = message.conversation_id.clone() {
            self.conversations.entry(conv).or_default().push_back(seq);
        }
        self.by_id.entry(message.message_id.clone()).or_default().push(seq);
        self.messages.push_back((seq, message));
    }

    fn get(&self, seq: u64) -> Option<&Message> {
        let (front, _) = self.messages.front()?;
        let offset = usize::try_from(seq.checked_sub(*front)?).ok()?;
        self.messages.get(offset).map(|(_, m)| m)
    }

    /// Latest entry for `message_id` recorded before `before`.
    fn latest_before(&self, message_id: &str, before: u64) -> Option<(u64, &Message)> {
        let seq = self.by_id.get(message_id)?.iter().rev().find(|s| **s < before)?;
        self.get(*seq).map(|m| (*seq, m))
    }
}

/// Per-stage queues, subscriptions and response waiters.
pub struct CommunicationBus {
    contracts: ContractRegistry,
    senders: HashMap<Stage, mpsc::UnboundedSender<Message>>,
    receivers: Mutex<Option<HashMap<Stage, mpsc::UnboundedReceiver<Message>>>>,
    shared: Arc<Shared>,
    pending: Mutex<HashMap<String, oneshot::Sender<Payload>>>,
    history: Mutex<History>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    cancel: CancellationToken,
    default_timeout: Duration,
}

impl CommunicationBus {
    pub fn new(config: &BusConfig) -> Self {
        Self::with_contracts(config, ContractRegistry::with_defaults())
    }

    pub fn with_contracts(config: &BusConfig, contracts: ContractRegistry) -> Self {
        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        let mut queued = HashMap::new();
        for stage in config.hosted_stages() {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.insert(stage, tx);
            receivers.insert(stage, rx);
            queued.insert(stage, AtomicUsize::new(0));
        }
        Self {
            contracts,
            senders,
            receivers: Mutex::new(Some(receivers)),
            shared: Arc::new(Shared {
                subscribers: RwLock::new(HashMap::new()),
                queued,
                dispatched: AtomicU64::new(0),
                handler_failures: AtomicU64::new(0),
            }),
            pending: Mutex::new(HashMap::new()),
            history: Mutex::new(History {
                max: config.max_history,
                ..Default::default()
            }),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
            cancel: CancellationToken::new(),
            default_timeout: Duration::from_secs(config.response_timeout_secs),
        }
    }

    /// Tie the dispatcher's lifetime to `parent`.
    pub fn with_parent_cancel(mut self, parent: &CancellationToken) -> Self {
        self.cancel = parent.child_token();
        self
    }

    pub fn contracts(&self) -> &ContractRegistry {
        &self.contracts
    }

    pub fn hosts(&self, stage: Stage) -> bool {
        self.senders.contains_key(&stage)
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.cancel.is_cancelled()
    }

    /// `send_and_wait` with the timeout of the message type's contract,
    /// falling back to the bus default.
    pub async fn request(&self, message: Message) -> Option<Payload> {
        let timeout = self
            .contracts
            .response_timeout(message.message_type)
            .unwrap_or(self.default_timeout);
        self.send_and_wait(message, timeout).await
    }

    /// Spawn the dispatcher tasks. Messages sent before this wait in their queues.
    pub fn start(&self) -> Result<()> {
        let receivers = lock(&self.receivers)
            .take()
            .ok_or(StratumError::BusAlreadyRunning)?;
        self.started.store(true, Ordering::SeqCst);

        let mut tasks = lock(&self.tasks);
        for (stage, rx) in receivers {
            let shared = self.shared.clone();
            let cancel = self.cancel.clone();
            tasks.push(tokio::spawn(run_queue(stage, rx, shared, cancel)));
        }
        info!(stages = tasks.len(), "Communication bus started");
        Ok(())
    }

    /// Cancel the dispatchers, drop queued messages and release waiters.
    pub async fn stop(&self) -> Result<()> {
        if !self.started.load(Ordering::SeqCst) {
            return Err(StratumError::BusNotRunning);
        }
        self.cancel.cancel();
        let tasks: Vec<JoinHandle<()>> = lock(&self.tasks).drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Dispatcher task failed");
            }
        }
        lock(&self.pending).clear();
        info!("Communication bus stopped");
        Ok(())
    }

    /// Validate and enqueue a message. Returns false when it was rejected.
    pub fn send(&self, message: Message) -> bool {
        match self.try_send(message) {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Message rejected");
                false
            }
        }
    }

    pub fn try_send(&self, message: Message) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(StratumError::BusNotRunning);
        }
        let violations = self.contracts.validate(&message);
        if !violations.is_empty() {
            return Err(StratumError::ContractViolation {
                message_id: message.message_id,
                violations,
            });
        }
        let stage = message.target_stage;
        let sender = self
            .senders
            .get(&stage)
            .ok_or(StratumError::StageNotHosted(stage))?;

        let record = message.clone();
        if let Some(count) = self.shared.queued.get(&stage) {
            count.fetch_add(1, Ordering::Relaxed);
        }
        if sender.send(message).is_err() {
            self.shared.dequeued(stage);
            return Err(StratumError::BusNotRunning);
        }
        debug!(
            message_id = %record.message_id,
            source = %record.source_stage,
            target = %stage,
            message_type = %record.message_type,
            "Message enqueued"
        );
        lock(&self.history).record(record);
        Ok(())
    }

    /// Send a message and wait for its response.
    ///
    /// Returns the payload given to [`respond`](Self::respond), or `None`
    /// on timeout, rejection, or when a waiter for the same id exists.
    pub async fn send_and_wait(&self, message: Message, timeout: Duration) -> Option<Payload> {
        let message = message.requiring_response();
        let message_id = message.message_id.clone();

        let rx = match self.register_waiter(&message_id) {
            Ok(rx) => rx,
            Err(e) => {
                warn!(error = %e, "Cannot wait for response");
                return None;
            }
        };
        let _guard = WaiterGuard {
            pending: &self.pending,
            message_id: &message_id,
        };

        if !self.send(message) {
            return None;
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(payload)) => Some(payload),
            Ok(Err(_)) => {
                debug!(message_id = %message_id, "Waiter released without response");
                None
            }
            Err(_) => {
                warn!(message_id = %message_id, timeout_ms = timeout.as_millis() as u64, "Response timed out");
                None
            }
        }
    }

    fn register_waiter(&self, message_id: &str) -> Result<oneshot::Receiver<Payload>> {
        let mut pending = lock(&self.pending);
        if pending.contains_key(message_id) {
            return Err(StratumError::DuplicateWaiter(message_id.to_string()));
        }
        let (tx, rx) = oneshot::channel();
        pending.insert(message_id.to_string(), tx);
        Ok(rx)
    }

    /// Resolve the waiter for `message_id`. False when nobody is waiting.
    pub fn respond(&self, message_id: &str, payload: Payload) -> bool {
        let waiter = lock(&self.pending).remove(message_id);
        match waiter {
            // Receiver may have been dropped on timeout
            Some(tx) => tx.send(payload).is_ok(),
            None => {
                debug!(message_id, "No waiter for response");
                false
            }
        }
    }

    pub fn subscribe(&self, stage: Stage, message_type: MessageType, handler: impl MessageHandler) -> SubscriptionId {
        let id = SubscriptionId::new();
        write(&self.shared.subscribers)
            .entry((stage, message_type))
            .or_default()
            .push((id.clone(), Arc::new(handler)));
        debug!(subscription = %id, %stage, %message_type, "Subscribed");
        id
    }

    pub fn unsubscribe(&self, id: &SubscriptionId) -> bool {
        let mut subscribers = write(&self.shared.subscribers);
        for handlers in subscribers.values_mut() {
            if let Some(pos) = handlers.iter().position(|(sid, _)| sid == id) {
                handlers.remove(pos);
                return true;
            }
        }
        false
    }

    /// Recorded messages matching `filter`, oldest first.
    pub fn history(&self, filter: &HistoryFilter) -> Vec<Message> {
        let history = lock(&self.history);
        let mut matched: Vec<Message> = history
            .messages
            .iter()
            .map(|(_, m)| m)
            .filter(|m| filter.matches(m))
            .cloned()
            .collect();
        if let Some(limit) = filter.limit {
            let skip = matched.len().saturating_sub(limit);
            matched.drain(..skip);
        }
        matched
    }

    pub fn conversation(&self, conversation_id: &str) -> Vec<Message> {
        let history = lock(&self.history);
        history
            .conversations
            .get(conversation_id)
            .map(|seqs| seqs.iter().filter_map(|seq| history.get(*seq)).cloned().collect())
            .unwrap_or_default()
    }

    /// The message and its recorded ancestors, root first.
    ///
    /// Each parent is the latest entry with the parent id recorded before its
    /// child, so a response reusing its request's id still links back to it.
    pub fn message_chain(&self, message_id: &str) -> Vec<Message> {
        let history = lock(&self.history);
        let mut chain = Vec::new();
        let mut next = history.latest_before(message_id, u64::MAX);
        while let Some((seq, message)) = next {
            chain.push(message.clone());
            next = message
                .parent_message_id
                .as_deref()
                .and_then(|parent| history.latest_before(parent, seq));
        }
        chain.reverse();
        chain
    }

    pub fn queue_stats(&self) -> QueueStats {
        let history = lock(&self.history);
        QueueStats {
            running: self.is_running(),
            queued: self
                .shared
                .queued
                .iter()
                .map(|(stage, n)| (*stage, n.load(Ordering::Relaxed)))
                .collect(),
            history_len: history.messages.len(),
            conversations: history.conversations.len(),
            pending_waiters: lock(&self.pending).len(),
            subscriptions: read(&self.shared.subscribers).values().map(Vec::len).sum(),
            dispatched: self.shared.dispatched.load(Ordering::Relaxed),
            handler_failures: self.shared.handler_failures.load(Ordering::Relaxed),
        }
    }
}

/// Removes a response waiter however `send_and_wait` ends.
struct WaiterGuard<'a> {
    pending: &'a Mutex<HashMap<String, oneshot::Sender<Payload>>>,
    message_id: &'a str,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        lock(self.pending).remove(self.message_id);
    }
}

async fn run_queue(
    stage: Stage,
    mut rx: mpsc::UnboundedReceiver<Message>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    debug!(%stage, "Stage dispatcher running");
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(message) => {
                    shared.dequeued(stage);
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            debug!(%stage, "Delivery interrupted by shutdown");
                            break;
                        }
                        _ = shared.deliver(message) => {}
                    }
                }
                None => break,
            },
        }
    }

    rx.close();
    let mut dropped = 0usize;
    while rx.try_recv().is_ok() {
        shared.dequeued(stage);
        dropped += 1;
    }
    debug!(%stage, dropped, "Stage queue drained");
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}
