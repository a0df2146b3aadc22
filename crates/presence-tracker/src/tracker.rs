//! Presence tracker worker.
//!
//! One owner task serializes all mutation: push updates, batched lookups,
//! the disconnect-time poll loop and own-presence throttling. The handle is
//! cheap to clone and communicates through a command channel; reads go
//! through a cache snapshot, so no caller ever waits on the worker.

use crate::cache::PresenceCache;
use crate::config::PresenceConfig;
use crate::source::PresenceSource;
use chrono::Utc;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sync_core::{PresencePayload, PresenceOrigin, PresenceRecord, PresenceStatus, UserId};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{interval, sleep_until, Instant};
use tracing::{debug, warn};

/// Capacity of the command channel.
const COMMAND_CHANNEL_CAPACITY: usize = 100;
/// Capacity of the event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 100;
/// Lookup outcomes considered for poll-interval adaptation.
const ERROR_WINDOW: usize = 10;

/// Where own-presence updates go (the orchestrator queues them as outbox
/// operations).
pub trait OwnPresenceSink: Send + Sync {
    fn publish(&self, status: PresenceStatus);
}

/// Presence change notifications.
#[derive(Debug, Clone)]
pub enum PresenceEvent {
    Changed {
        user_id: UserId,
        record: PresenceRecord,
    },
}

enum Command {
    Track(Vec<UserId>),
    Untrack(Vec<UserId>),
    Push(PresencePayload),
    SetOwn(PresenceStatus),
    Activity,
    SetBackgrounded(bool),
    Shutdown,
}

/// Handle to the presence tracker.
#[derive(Clone)]
pub struct PresenceTracker {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<PresenceEvent>,
    cache: Arc<Mutex<PresenceCache>>,
    connected: watch::Receiver<bool>,
}

impl PresenceTracker {
    /// Spawns the worker and returns its handle.
    pub fn spawn(
        config: PresenceConfig,
        source: Arc<dyn PresenceSource>,
        own_sink: Arc<dyn OwnPresenceSink>,
        connected: watch::Receiver<bool>,
    ) -> Self {
        let (commands, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let cache = Arc::new(Mutex::new(PresenceCache::new(
            config.record_ttl,
            config.max_entries,
        )));

        let worker = Worker {
            config,
            source,
            own_sink,
            cache: cache.clone(),
            events: events.clone(),
            connected: connected.clone(),
            tracked: HashSet::new(),
            pending_lookup: Vec::new(),
            lookup_deadline: None,
            own_pending: None,
            own_deadline: None,
            own_last_sent: None,
            last_activity: None,
            backgrounded: false,
            poll_deadline: None,
            recent_lookups: VecDeque::new(),
        };
        tokio::spawn(worker.run(command_rx));

        Self {
            commands,
            events,
            cache,
            connected,
        }
    }

    /// Subscribes to presence change events.
    pub fn events(&self) -> broadcast::Receiver<PresenceEvent> {
        self.events.subscribe()
    }

    /// Current presence for a user. A cache miss (unknown, expired or,
    /// while disconnected, decayed below the floor) returns the offline
    /// default. Reliability only decays while the session is down; a live
    /// push feed keeps cached values authoritative.
    pub fn presence_of(&self, user_id: UserId) -> PresenceRecord {
        let now = Utc::now();
        let apply_decay = !*self.connected.borrow();
        self.cache
            .lock()
            .expect("lock poisoned")
            .get(user_id, now, apply_decay)
            .unwrap_or_else(|| PresenceRecord::offline(user_id, now))
    }

    pub fn track_users(&self, users: Vec<UserId>) {
        self.send(Command::Track(users));
    }

    pub fn untrack_users(&self, users: Vec<UserId>) {
        self.send(Command::Untrack(users));
    }

    /// Feeds a pushed presence notification into the cache.
    pub fn apply_push(&self, payload: PresencePayload) {
        self.send(Command::Push(payload));
    }

    /// Requests an own-presence send, throttled and coalescing.
    pub fn set_own_presence(&self, status: PresenceStatus) {
        self.send(Command::SetOwn(status));
    }

    /// Marks the local user as recently active (tightens polling).
    pub fn touch_activity(&self) {
        self.send(Command::Activity);
    }

    pub fn set_backgrounded(&self, backgrounded: bool) {
        self.send(Command::SetBackgrounded(backgrounded));
    }

    pub fn shutdown(&self) {
        self.send(Command::Shutdown);
    }

    fn send(&self, command: Command) {
        if self.commands.try_send(command).is_err() {
            warn!("Presence tracker command queue full, dropping command");
        }
    }
}

/// Poll interval for current conditions, before clamping: activity tightens
/// it, backgrounding and high lookup error rates stretch it.
pub fn adaptive_poll_interval(
    config: &PresenceConfig,
    backgrounded: bool,
    recently_active: bool,
    error_rate: f64,
) -> Duration {
    let mut interval = if backgrounded {
        config.poll_backgrounded
    } else if recently_active {
        config.poll_active
    } else {
        config.poll_base
    };
    if error_rate > config.error_rate_threshold {
        interval *= 2;
    }
    interval.clamp(config.poll_min, config.poll_max)
}

struct Worker {
    config: PresenceConfig,
    source: Arc<dyn PresenceSource>,
    own_sink: Arc<dyn OwnPresenceSink>,
    cache: Arc<Mutex<PresenceCache>>,
    events: broadcast::Sender<PresenceEvent>,
    connected: watch::Receiver<bool>,

    tracked: HashSet<UserId>,
    pending_lookup: Vec<UserId>,
    lookup_deadline: Option<Instant>,

    own_pending: Option<PresenceStatus>,
    own_deadline: Option<Instant>,
    own_last_sent: Option<Instant>,

    last_activity: Option<Instant>,
    backgrounded: bool,
    poll_deadline: Option<Instant>,
    recent_lookups: VecDeque<bool>,
}

impl Worker {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut sweep = interval(self.config.sweep_interval);
        sweep.tick().await;

        loop {
            tokio::select! {
                command = commands.recv() => {
                    match command {
                        None | Some(Command::Shutdown) => break,
                        Some(command) => self.handle_command(command).await,
                    }
                }
                _ = sleep_until(deadline_or_far(self.lookup_deadline)), if self.lookup_deadline.is_some() => {
                    self.lookup_deadline = None;
                    self.flush_lookup().await;
                }
                _ = sleep_until(deadline_or_far(self.own_deadline)), if self.own_deadline.is_some() => {
                    self.flush_own_presence();
                }
                _ = sleep_until(deadline_or_far(self.poll_deadline)), if self.poll_deadline.is_some() => {
                    self.poll_once().await;
                    self.poll_deadline = Some(Instant::now() + self.poll_interval());
                }
                changed = self.connected.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    self.update_poll_schedule();
                }
                _ = sweep.tick() => {
                    let removed = self.cache.lock().expect("lock poisoned").sweep(Utc::now());
                    if removed > 0 {
                        debug!(removed, "Swept presence cache");
                    }
                }
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Track(users) => {
                for user in users {
                    if self.tracked.insert(user) && !self.pending_lookup.contains(&user) {
                        self.pending_lookup.push(user);
                    }
                }
                if self.pending_lookup.len() >= self.config.max_lookup_batch {
                    self.lookup_deadline = None;
                    self.flush_lookup().await;
                } else if !self.pending_lookup.is_empty() && self.lookup_deadline.is_none() {
                    self.lookup_deadline = Some(Instant::now() + self.config.lookup_debounce);
                }
                self.update_poll_schedule();
            }
            Command::Untrack(users) => {
                let mut cache = self.cache.lock().expect("lock poisoned");
                for user in users {
                    self.tracked.remove(&user);
                    self.pending_lookup.retain(|u| *u != user);
                    cache.remove(user);
                }
                drop(cache);
                if self.pending_lookup.is_empty() {
                    self.lookup_deadline = None;
                }
                self.update_poll_schedule();
            }
            Command::Push(payload) => {
                if !self.tracked.contains(&payload.user_id) {
                    debug!(user_id = %payload.user_id, "Push for untracked user ignored");
                    return;
                }
                let record = self.cache.lock().expect("lock poisoned").insert(
                    payload.user_id,
                    payload.status,
                    payload.last_seen,
                    PresenceOrigin::Push,
                    Utc::now(),
                );
                let _ = self.events.send(PresenceEvent::Changed {
                    user_id: payload.user_id,
                    record,
                });
            }
            Command::SetOwn(status) => {
                let now = Instant::now();
                let throttled = self
                    .own_last_sent
                    .is_some_and(|sent| now < sent + self.config.own_presence_throttle);
                if throttled {
                    // Latest value wins; one timer covers however many
                    // updates arrive inside the throttle window.
                    self.own_pending = Some(status);
                    if self.own_deadline.is_none() {
                        let sent = self.own_last_sent.expect("throttled implies sent");
                        self.own_deadline = Some(sent + self.config.own_presence_throttle);
                    }
                } else {
                    self.own_sink.publish(status);
                    self.own_last_sent = Some(now);
                    self.own_pending = None;
                    self.own_deadline = None;
                }
            }
            Command::Activity => {
                self.last_activity = Some(Instant::now());
            }
            Command::SetBackgrounded(backgrounded) => {
                self.backgrounded = backgrounded;
            }
            Command::Shutdown => unreachable!("handled by the loop"),
        }
    }

    fn flush_own_presence(&mut self) {
        self.own_deadline = None;
        if let Some(status) = self.own_pending.take() {
            self.own_sink.publish(status);
            self.own_last_sent = Some(Instant::now());
        }
    }

    /// Sends one batch of pending lookups; overflow waits for the next
    /// debounce window.
    async fn flush_lookup(&mut self) {
        if self.pending_lookup.is_empty() {
            return;
        }
        let take = self.pending_lookup.len().min(self.config.max_lookup_batch);
        let batch: Vec<UserId> = self.pending_lookup.drain(..take).collect();
        if !self.pending_lookup.is_empty() {
            self.lookup_deadline = Some(Instant::now() + self.config.lookup_debounce);
        }

        match self.source.fetch(&batch).await {
            Ok(payloads) => {
                self.record_lookup(true);
                self.apply_poll_results(payloads);
            }
            Err(e) => {
                self.record_lookup(false);
                warn!(error = %e, count = batch.len(), "Presence lookup failed, requeueing");
                for user in batch {
                    if self.tracked.contains(&user) && !self.pending_lookup.contains(&user) {
                        self.pending_lookup.push(user);
                    }
                }
                if !self.pending_lookup.is_empty() {
                    self.lookup_deadline =
                        Some(Instant::now() + self.config.lookup_debounce * 2);
                }
            }
        }
    }

    /// One poll pass over every tracked user, in batch-sized chunks.
    async fn poll_once(&mut self) {
        if *self.connected.borrow() || self.tracked.is_empty() {
            return;
        }
        let tracked: Vec<UserId> = self.tracked.iter().copied().collect();
        for chunk in tracked.chunks(self.config.max_lookup_batch) {
            match self.source.fetch(chunk).await {
                Ok(payloads) => {
                    self.record_lookup(true);
                    self.apply_poll_results(payloads);
                }
                Err(e) => {
                    self.record_lookup(false);
                    warn!(error = %e, "Presence poll failed");
                    break;
                }
            }
        }
    }

    fn apply_poll_results(&mut self, payloads: Vec<PresencePayload>) {
        let now = Utc::now();
        let mut cache = self.cache.lock().expect("lock poisoned");
        for payload in payloads {
            if !self.tracked.contains(&payload.user_id) {
                continue;
            }
            let record = cache.insert(
                payload.user_id,
                payload.status,
                payload.last_seen,
                PresenceOrigin::Poll,
                now,
            );
            let _ = self.events.send(PresenceEvent::Changed {
                user_id: payload.user_id,
                record,
            });
        }
    }

    fn update_poll_schedule(&mut self) {
        let should_poll = !*self.connected.borrow() && !self.tracked.is_empty();
        match (should_poll, self.poll_deadline) {
            (true, None) => {
                self.poll_deadline = Some(Instant::now() + self.poll_interval());
            }
            (false, Some(_)) => self.poll_deadline = None,
            _ => {}
        }
    }

    fn poll_interval(&self) -> Duration {
        let recently_active = self
            .last_activity
            .is_some_and(|at| at.elapsed() < self.config.activity_window);
        adaptive_poll_interval(
            &self.config,
            self.backgrounded,
            recently_active,
            self.error_rate(),
        )
    }

    fn record_lookup(&mut self, ok: bool) {
        self.recent_lookups.push_back(ok);
        while self.recent_lookups.len() > ERROR_WINDOW {
            self.recent_lookups.pop_front();
        }
    }

    fn error_rate(&self) -> f64 {
        if self.recent_lookups.len() < 4 {
            return 0.0;
        }
        let failures = self.recent_lookups.iter().filter(|ok| !**ok).count();
        failures as f64 / self.recent_lookups.len() as f64
    }
}

fn deadline_or_far(deadline: Option<Instant>) -> Instant {
    deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(86_400))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PresenceResult;
    use async_trait::async_trait;
    use tokio::time::{sleep, timeout};

    struct ScriptedSource {
        calls: mpsc::UnboundedSender<Vec<UserId>>,
        fail: std::sync::atomic::AtomicBool,
    }

    impl ScriptedSource {
        fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Vec<UserId>>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (
                Arc::new(Self {
                    calls: tx,
                    fail: std::sync::atomic::AtomicBool::new(false),
                }),
                rx,
            )
        }
    }

    #[async_trait]
    impl PresenceSource for ScriptedSource {
        async fn fetch(&self, users: &[UserId]) -> PresenceResult<Vec<PresencePayload>> {
            let _ = self.calls.send(users.to_vec());
            if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(crate::error::PresenceError::Decode("scripted".to_string()));
            }
            Ok(users
                .iter()
                .map(|user_id| PresencePayload {
                    user_id: *user_id,
                    status: PresenceStatus::Online,
                    last_seen: None,
                })
                .collect())
        }
    }

    struct RecordingSink {
        published: Mutex<Vec<PresenceStatus>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                published: Mutex::new(Vec::new()),
            })
        }

        fn published(&self) -> Vec<PresenceStatus> {
            self.published.lock().unwrap().clone()
        }
    }

    impl OwnPresenceSink for RecordingSink {
        fn publish(&self, status: PresenceStatus) {
            self.published.lock().unwrap().push(status);
        }
    }

    async fn next_call(calls: &mut mpsc::UnboundedReceiver<Vec<UserId>>) -> Vec<UserId> {
        timeout(Duration::from_secs(120), calls.recv())
            .await
            .expect("timed out waiting for a lookup")
            .expect("source dropped")
    }

    fn users(range: std::ops::Range<i64>) -> Vec<UserId> {
        range.map(UserId).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn tracked_users_are_looked_up_in_one_debounced_batch() {
        let (source, mut calls) = ScriptedSource::new();
        let (_connected_tx, connected) = watch::channel(true);
        let tracker = PresenceTracker::spawn(
            PresenceConfig::default(),
            source,
            RecordingSink::new(),
            connected,
        );

        let before = Instant::now();
        tracker.track_users(vec![UserId(1)]);
        sleep(Duration::from_millis(500)).await;
        tracker.track_users(vec![UserId(2), UserId(3)]);

        let mut batch = next_call(&mut calls).await;
        batch.sort();
        assert_eq!(batch, users(1..4));
        // One lookup covers all three, fired by the first track's debounce.
        assert!(before.elapsed() >= Duration::from_secs(3));
        assert!(before.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn oversized_batches_flush_immediately_and_split() {
        let (source, mut calls) = ScriptedSource::new();
        let (_connected_tx, connected) = watch::channel(true);
        let tracker = PresenceTracker::spawn(
            PresenceConfig::default(),
            source,
            RecordingSink::new(),
            connected,
        );

        tracker.track_users(users(1..31));

        let first = next_call(&mut calls).await;
        assert_eq!(first.len(), 25);
        let second = next_call(&mut calls).await;
        assert_eq!(second.len(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn untracking_cancels_the_pending_lookup() {
        let (source, mut calls) = ScriptedSource::new();
        let (_connected_tx, connected) = watch::channel(true);
        let tracker = PresenceTracker::spawn(
            PresenceConfig::default(),
            source,
            RecordingSink::new(),
            connected,
        );

        tracker.track_users(vec![UserId(1), UserId(2)]);
        sleep(Duration::from_millis(100)).await;
        tracker.untrack_users(vec![UserId(2)]);

        let batch = next_call(&mut calls).await;
        assert_eq!(batch, vec![UserId(1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn own_presence_is_throttled_with_latest_value_winning() {
        let (source, _calls) = ScriptedSource::new();
        let (_connected_tx, connected) = watch::channel(true);
        let sink = RecordingSink::new();
        let tracker = PresenceTracker::spawn(
            PresenceConfig::default(),
            source,
            sink.clone(),
            connected,
        );

        tracker.set_own_presence(PresenceStatus::Online);
        sleep(Duration::from_secs(1)).await;
        assert_eq!(sink.published(), vec![PresenceStatus::Online]);

        // Two updates inside the window coalesce into one deferred send.
        tracker.set_own_presence(PresenceStatus::Away);
        tracker.set_own_presence(PresenceStatus::Offline);
        sleep(Duration::from_secs(10)).await;
        assert_eq!(sink.published(), vec![PresenceStatus::Online]);

        sleep(Duration::from_secs(25)).await;
        assert_eq!(
            sink.published(),
            vec![PresenceStatus::Online, PresenceStatus::Offline]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn polling_runs_only_while_disconnected() {
        let (source, mut calls) = ScriptedSource::new();
        let (connected_tx, connected) = watch::channel(true);
        let tracker = PresenceTracker::spawn(
            PresenceConfig::default(),
            source,
            RecordingSink::new(),
            connected,
        );

        tracker.track_users(vec![UserId(7)]);
        // The initial debounced lookup fires regardless of connectivity.
        let _ = next_call(&mut calls).await;

        // Connected: no polling.
        sleep(Duration::from_secs(120)).await;
        assert!(calls.try_recv().is_err());

        connected_tx.send(false).unwrap();
        let batch = next_call(&mut calls).await;
        assert_eq!(batch, vec![UserId(7)]);

        connected_tx.send(true).unwrap();
        sleep(Duration::from_secs(120)).await;
        assert!(calls.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn push_updates_refresh_the_cache_at_full_reliability() {
        let (source, mut calls) = ScriptedSource::new();
        let (_connected_tx, connected) = watch::channel(true);
        let tracker = PresenceTracker::spawn(
            PresenceConfig::default(),
            source,
            RecordingSink::new(),
            connected,
        );
        let mut events = tracker.events();

        tracker.track_users(vec![UserId(9)]);
        let _ = next_call(&mut calls).await;

        tracker.apply_push(PresencePayload {
            user_id: UserId(9),
            status: PresenceStatus::Away,
            last_seen: None,
        });

        loop {
            let PresenceEvent::Changed { user_id, record } =
                timeout(Duration::from_secs(30), events.recv())
                    .await
                    .expect("timed out")
                    .expect("events closed");
            if record.origin == PresenceOrigin::Push {
                assert_eq!(user_id, UserId(9));
                assert_eq!(record.status, PresenceStatus::Away);
                assert_eq!(record.reliability, 1.0);
                break;
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_users_read_as_the_offline_default() {
        let (source, _calls) = ScriptedSource::new();
        let (_connected_tx, connected) = watch::channel(true);
        let tracker = PresenceTracker::spawn(
            PresenceConfig::default(),
            source,
            RecordingSink::new(),
            connected,
        );

        let record = tracker.presence_of(UserId(404));
        assert_eq!(record.status, PresenceStatus::Offline);
        assert_eq!(record.reliability, 0.0);
    }

    #[test]
    fn poll_interval_adapts_to_conditions() {
        let config = PresenceConfig::default();
        assert_eq!(
            adaptive_poll_interval(&config, false, false, 0.0),
            Duration::from_secs(30)
        );
        assert_eq!(
            adaptive_poll_interval(&config, false, true, 0.0),
            Duration::from_secs(10)
        );
        assert_eq!(
            adaptive_poll_interval(&config, true, true, 0.0),
            Duration::from_secs(120)
        );
        // Error rates above the threshold double the interval, inside the
        // clamp bounds.
        assert_eq!(
            adaptive_poll_interval(&config, false, false, 0.5),
            Duration::from_secs(60)
        );
        assert_eq!(
            adaptive_poll_interval(&config, true, false, 0.5),
            Duration::from_secs(240)
        );
    }
}
