//! Typing coordinator worker.

use crate::config::TypingConfig;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sync_core::{ChannelId, TaskHandle, TypingPayload, UserId};
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

/// Capacity of the command channel (also carries internal timer firings).
const COMMAND_CHANNEL_CAPACITY: usize = 100;
/// Capacity of the event broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 100;

/// Where own typing signals go (the orchestrator queues them as outbox
/// operations).
pub trait TypingSignalSink: Send + Sync {
    fn send_typing(&self, channel: &ChannelId, is_typing: bool);
}

/// Emitted whenever the set of users typing in a channel changes.
#[derive(Debug, Clone)]
pub enum TypingEvent {
    Changed {
        channel: ChannelId,
        users: Vec<UserId>,
    },
}

enum Command {
    StartTyping(ChannelId),
    StopTyping(ChannelId),
    Observed(ChannelId, TypingPayload),
    ClearChannel(ChannelId),
    ClearAll,
    Shutdown,
    // Internal timer firings.
    FlushStart(ChannelId),
    AutoStop(ChannelId),
    ExpireObserved(ChannelId, UserId),
}

/// Handle to the typing coordinator.
#[derive(Clone)]
pub struct TypingCoordinator {
    commands: mpsc::Sender<Command>,
    events: broadcast::Sender<TypingEvent>,
    snapshot: Arc<Mutex<HashMap<ChannelId, Vec<UserId>>>>,
}

impl TypingCoordinator {
    /// Spawns the worker and returns its handle.
    pub fn spawn(config: TypingConfig, sink: Arc<dyn TypingSignalSink>) -> Self {
        let (commands, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let snapshot = Arc::new(Mutex::new(HashMap::new()));

        let worker = Worker {
            config,
            sink,
            events: events.clone(),
            snapshot: snapshot.clone(),
            commands: commands.clone(),
            own: HashMap::new(),
            observed: HashMap::new(),
        };
        tokio::spawn(worker.run(command_rx));

        Self {
            commands,
            events,
            snapshot,
        }
    }

    pub fn events(&self) -> broadcast::Receiver<TypingEvent> {
        self.events.subscribe()
    }

    /// Users currently typing in a channel, sorted.
    pub fn typing_users(&self, channel: &ChannelId) -> Vec<UserId> {
        self.snapshot
            .lock()
            .expect("lock poisoned")
            .get(channel)
            .cloned()
            .unwrap_or_default()
    }

    /// Reports a local keystroke in a channel.
    pub fn start_typing(&self, channel: ChannelId) {
        self.send(Command::StartTyping(channel));
    }

    /// Reports that the local user stopped typing (sent or discarded the
    /// draft).
    pub fn stop_typing(&self, channel: ChannelId) {
        self.send(Command::StopTyping(channel));
    }

    /// Feeds an observed typing notification.
    pub fn apply_observed(&self, channel: ChannelId, payload: TypingPayload) {
        self.send(Command::Observed(channel, payload));
    }

    /// Drops all typing state for one channel (unsubscribe).
    pub fn clear_channel(&self, channel: ChannelId) {
        self.send(Command::ClearChannel(channel));
    }

    /// Drops all typing state, both halves (disconnect).
    pub fn clear_all(&self) {
        self.send(Command::ClearAll);
    }

    pub fn shutdown(&self) {
        self.send(Command::Shutdown);
    }

    fn send(&self, command: Command) {
        if self.commands.try_send(command).is_err() {
            warn!("Typing coordinator command queue full, dropping command");
        }
    }
}

#[derive(Default)]
struct OwnState {
    pending: Option<TaskHandle>,
    started: bool,
    auto_stop: Option<TaskHandle>,
}

struct Worker {
    config: TypingConfig,
    sink: Arc<dyn TypingSignalSink>,
    events: broadcast::Sender<TypingEvent>,
    snapshot: Arc<Mutex<HashMap<ChannelId, Vec<UserId>>>>,
    commands: mpsc::Sender<Command>,
    own: HashMap<ChannelId, OwnState>,
    /// Expiry handle per observed typing user. Dropping a handle cancels
    /// its timer, so removal and cancellation are the same operation.
    observed: HashMap<ChannelId, HashMap<UserId, TaskHandle>>,
}

impl Worker {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        while let Some(command) = commands.recv().await {
            match command {
                Command::Shutdown => break,
                command => self.handle_command(command),
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::StartTyping(channel) => {
                let sender = self.commands.clone();
                let auto_stop = self.config.auto_stop;
                let debounce = self.config.start_debounce;
                let state = self.own.entry(channel.clone()).or_default();
                if state.started {
                    // Keystroke while typing: push the auto-stop out.
                    state.auto_stop =
                        Some(schedule(sender, auto_stop, Command::AutoStop(channel)));
                } else if state.pending.is_none() {
                    state.pending =
                        Some(schedule(sender, debounce, Command::FlushStart(channel)));
                }
            }
            Command::FlushStart(channel) => {
                let sender = self.commands.clone();
                let auto_stop = self.config.auto_stop;
                if let Some(state) = self.own.get_mut(&channel) {
                    if !state.started {
                        state.pending = None;
                        state.started = true;
                        state.auto_stop = Some(schedule(
                            sender,
                            auto_stop,
                            Command::AutoStop(channel.clone()),
                        ));
                        self.sink.send_typing(&channel, true);
                    }
                }
            }
            Command::StopTyping(channel) => {
                if let Some(state) = self.own.remove(&channel) {
                    // A never-sent start is silently canceled; a sent start
                    // gets its stop immediately.
                    if state.started {
                        self.sink.send_typing(&channel, false);
                    }
                }
            }
            Command::AutoStop(channel) => {
                if self.own.get(&channel).is_some_and(|s| s.started) {
                    self.own.remove(&channel);
                    self.sink.send_typing(&channel, false);
                }
            }
            Command::Observed(channel, payload) => {
                if payload.is_typing {
                    let handle = schedule(
                        self.commands.clone(),
                        self.config.observed_expiry,
                        Command::ExpireObserved(channel.clone(), payload.user_id),
                    );
                    // Replacing the handle cancels the previous expiry.
                    let newcomer = self
                        .observed
                        .entry(channel.clone())
                        .or_default()
                        .insert(payload.user_id, handle)
                        .is_none();
                    if newcomer {
                        self.emit(&channel);
                    }
                } else {
                    let removed = self
                        .observed
                        .get_mut(&channel)
                        .is_some_and(|set| set.remove(&payload.user_id).is_some());
                    if removed {
                        self.emit(&channel);
                    }
                }
            }
            Command::ExpireObserved(channel, user_id) => {
                if let Some(set) = self.observed.get_mut(&channel) {
                    if set.remove(&user_id).is_some() {
                        self.emit(&channel);
                    }
                }
            }
            Command::ClearChannel(channel) => {
                self.own.remove(&channel);
                if self.observed.remove(&channel).is_some_and(|set| !set.is_empty()) {
                    self.emit(&channel);
                }
            }
            Command::ClearAll => {
                self.own.clear();
                let channels: Vec<ChannelId> = self
                    .observed
                    .drain()
                    .filter(|(_, set)| !set.is_empty())
                    .map(|(channel, _)| channel)
                    .collect();
                for channel in channels {
                    self.emit(&channel);
                }
            }
            Command::Shutdown => unreachable!("handled by the loop"),
        }
    }

    fn emit(&mut self, channel: &ChannelId) {
        let mut users: Vec<UserId> = self
            .observed
            .get(channel)
            .map(|set| set.keys().copied().collect())
            .unwrap_or_default();
        users.sort();

        let mut snapshot = self.snapshot.lock().expect("lock poisoned");
        if users.is_empty() {
            snapshot.remove(channel);
        } else {
            snapshot.insert(channel.clone(), users.clone());
        }
        drop(snapshot);

        let _ = self.events.send(TypingEvent::Changed {
            channel: channel.clone(),
            users,
        });
    }
}

/// Fires `command` back into the worker after `delay` unless the returned
/// handle is dropped first.
fn schedule(sender: mpsc::Sender<Command>, delay: Duration, command: Command) -> TaskHandle {
    TaskHandle::spawn_after(delay, async move {
        let _ = sender.send(command).await;
    })
}
