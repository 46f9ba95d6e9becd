//! Single source of truth for session state.
//!
//! Every mutation goes through [`SessionStore`] and produces exactly one new
//! [`SessionSnapshot`], published synchronously to listeners in registration
//! order before the mutating call returns.

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock},
};

use tracing::{debug, trace, warn};

use crate::{
    error::SyncError,
    event_log::EventLog,
    normalization::ClassifiedNotification,
    rotation::NameRotation,
    state_machine::ThreadLifecycle,
    timeline::MessageTimeline,
    types::{
        Message, Participant, ResourceKind, SessionConfig, SessionSnapshot, Thread, ThreadHandle,
        ThreadPhase, ThreadPropertiesPatch,
    },
};

/// Callback invoked with every new snapshot.
///
/// Listeners run while the store is locked for writing: they may call
/// [`SessionStore::snapshot`] but must not mutate the store.
pub type SnapshotListener = Arc<dyn Fn(&Arc<SessionSnapshot>) + Send + Sync + 'static>;

/// Registration handle returned by [`SessionStore::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Identifies one issued reload so that superseded results can be discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadTicket {
    resource: ResourceKind,
    generation: u64,
    thread_id: String,
}

impl ReloadTicket {
    pub fn resource(&self) -> ResourceKind {
        self.resource
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct ReloadGenerations {
    messages: u64,
    participants: u64,
}

impl ReloadGenerations {
    fn slot(&mut self, resource: ResourceKind) -> &mut u64 {
        match resource {
            ResourceKind::Messages => &mut self.messages,
            ResourceKind::Participants => &mut self.participants,
        }
    }

    fn issue(&mut self, resource: ResourceKind) -> u64 {
        let slot = self.slot(resource);
        *slot += 1;
        *slot
    }

    fn latest(&self, resource: ResourceKind) -> u64 {
        match resource {
            ResourceKind::Messages => self.messages,
            ResourceKind::Participants => self.participants,
        }
    }
}

#[derive(Debug)]
struct SessionState {
    version: u64,
    connected: bool,
    lifecycle: ThreadLifecycle,
    thread: Option<Thread>,
    messages: MessageTimeline,
    participants: Vec<Participant>,
    events: EventLog,
    last_added_participant: Option<String>,
    message_id: Option<String>,
    pending_message_id: Option<String>,
    rotation: NameRotation,
    reloads: ReloadGenerations,
}

impl SessionState {
    fn new(config: &SessionConfig) -> Result<Self, SyncError> {
        Ok(Self {
            version: 0,
            connected: false,
            lifecycle: ThreadLifecycle::default(),
            thread: None,
            messages: MessageTimeline::new(config.message_limit),
            participants: Vec::new(),
            events: EventLog::new(config.event_log_capacity),
            last_added_participant: None,
            message_id: None,
            pending_message_id: None,
            rotation: NameRotation::new(config.name_pool.clone())?,
            reloads: ReloadGenerations::default(),
        })
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            version: self.version,
            connected: self.connected,
            thread_phase: self.lifecycle.phase(),
            thread: self.thread.clone(),
            messages: self.messages.items().to_vec(),
            participants: self.participants.clone(),
            events: self.events.to_vec(),
            last_added_participant: self.last_added_participant.clone(),
            message_id: self.message_id.clone(),
            pending_message_id: self.pending_message_id.clone(),
            name_rotation_index: self.rotation.index(),
        }
    }

    fn current_thread_id(&self) -> Option<&str> {
        self.thread.as_ref().map(|thread| thread.id.as_str())
    }

    fn targets_current_thread(&self, handle: &ThreadHandle) -> bool {
        self.current_thread_id() == Some(handle.thread_id())
    }

    fn active_handle(
        &self,
        handle: Option<&ThreadHandle>,
        action: &str,
    ) -> Result<ThreadHandle, SyncError> {
        self.lifecycle.require_active(action)?;
        let current = self
            .current_thread_id()
            .ok_or_else(|| SyncError::no_active_thread(action))?;
        if let Some(handle) = handle
            && handle.thread_id() != current
        {
            return Err(SyncError::no_active_thread(action));
        }
        Ok(ThreadHandle::new(current))
    }

    fn reset_thread_scope(&mut self) {
        self.messages.clear();
        self.participants.clear();
        self.last_added_participant = None;
        self.message_id = None;
        self.pending_message_id = None;
    }

    fn enforce_message_invariant(&mut self) {
        if let Some(pending) = &self.pending_message_id
            && self.messages.contains(pending)
        {
            self.message_id = self.pending_message_id.take();
        }
        if let Some(current) = &self.message_id
            && !self.messages.contains(current)
        {
            debug!(message_id = %current, "current message left the message list");
            self.message_id = None;
        }
    }

    fn enforce_roster_invariant(&mut self) {
        if let Some(last) = &self.last_added_participant
            && !self.participants.iter().any(|p| &p.id == last)
        {
            debug!(participant_id = %last, "last added participant left the roster");
            self.last_added_participant = None;
        }
    }
}

struct StoreInner {
    state: SessionState,
    listeners: Vec<(ListenerId, SnapshotListener)>,
    next_listener_id: u64,
}

/// Shared, internally synchronized session state store.
pub struct SessionStore {
    inner: Mutex<StoreInner>,
    latest: RwLock<Arc<SessionSnapshot>>,
}

impl fmt::Debug for SessionStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("SessionStore")
            .field("version", &inner.state.version)
            .field("listener_count", &inner.listeners.len())
            .finish()
    }
}

impl SessionStore {
    pub fn new(config: &SessionConfig) -> Result<Self, SyncError> {
        let state = SessionState::new(config)?;
        let latest = RwLock::new(Arc::new(state.snapshot()));
        Ok(Self {
            inner: Mutex::new(StoreInner {
                state,
                listeners: Vec::new(),
                next_listener_id: 1,
            }),
            latest,
        })
    }

    /// Latest published snapshot.
    pub fn snapshot(&self) -> Arc<SessionSnapshot> {
        Arc::clone(&self.latest.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Register a listener; it receives every snapshot published after this call.
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&Arc<SessionSnapshot>) + Send + Sync + 'static,
    {
        let mut inner = self.lock();
        let id = ListenerId(inner.next_listener_id);
        inner.next_listener_id += 1;
        inner.listeners.push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns `false` when it was not registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut inner = self.lock();
        let before = inner.listeners.len();
        inner.listeners.retain(|(listener_id, _)| *listener_id != id);
        inner.listeners.len() != before
    }

    pub fn set_connected(&self, connected: bool) {
        self.apply(|state| {
            let changed = state.connected != connected;
            state.connected = connected;
            ((), changed)
        });
    }

    pub fn begin_thread_creation(&self) -> Result<(), SyncError> {
        self.commit(|state| state.lifecycle.begin_create())
    }

    /// Install a newly created thread, replacing any previous thread state wholesale.
    pub fn complete_thread_creation(&self, thread: Thread) -> Result<ThreadHandle, SyncError> {
        self.commit(|state| {
            state.lifecycle.finish_create(true)?;
            let handle = ThreadHandle::new(thread.id.clone());
            debug!(thread_id = %thread.id, topic = %thread.topic, "thread installed");
            state.thread = Some(thread);
            state.reset_thread_scope();
            Ok(handle)
        })
    }

    pub fn abort_thread_creation(&self) -> Result<ThreadPhase, SyncError> {
        self.commit(|state| state.lifecycle.finish_create(false))
    }

    /// Enter the deleting phase and return the thread being deleted.
    pub fn begin_thread_deletion(&self) -> Result<ThreadHandle, SyncError> {
        self.commit(|state| {
            let handle = state
                .current_thread_id()
                .map(ThreadHandle::new)
                .ok_or_else(|| SyncError::no_active_thread("delete_thread"))?;
            state.lifecycle.begin_delete()?;
            Ok(handle)
        })
    }

    /// Tear down thread, messages, roster and message references in one snapshot.
    pub fn complete_thread_deletion(&self) -> Result<(), SyncError> {
        self.commit(|state| {
            state.lifecycle.finish_delete(true)?;
            state.thread = None;
            state.reset_thread_scope();
            Ok(())
        })
    }

    pub fn abort_thread_deletion(&self) -> Result<ThreadPhase, SyncError> {
        self.commit(|state| state.lifecycle.finish_delete(false))
    }

    /// Resolve the thread a command targets. A stale `handle` is rejected.
    pub fn require_thread(
        &self,
        handle: Option<&ThreadHandle>,
        action: &str,
    ) -> Result<ThreadHandle, SyncError> {
        self.lock().state.active_handle(handle, action)
    }

    /// Resolve the active thread together with the current message ID.
    pub fn require_message(&self, action: &str) -> Result<(ThreadHandle, String), SyncError> {
        let inner = self.lock();
        let handle = inner.state.active_handle(None, action)?;
        let message_id = inner.state.message_id.clone().ok_or_else(|| {
            SyncError::precondition(
                "no_current_message",
                format!("cannot run '{action}' without a current message"),
            )
        })?;
        Ok((handle, message_id))
    }

    /// Apply an acknowledged property patch to the local thread.
    pub fn apply_thread_patch(&self, handle: &ThreadHandle, patch: &ThreadPropertiesPatch) -> bool {
        self.apply(|state| {
            if !state.targets_current_thread(handle) {
                return (false, false);
            }
            if let Some(thread) = state.thread.as_mut() {
                patch.apply_to(thread);
            }
            (true, true)
        })
    }

    /// Replace local thread properties with a fresh copy fetched from the service.
    pub fn replace_thread_properties(&self, thread: Thread) -> bool {
        self.apply(|state| {
            if state.current_thread_id() != Some(thread.id.as_str()) {
                return (false, false);
            }
            state.thread = Some(thread);
            (true, true)
        })
    }

    /// Remember a sent message until a reload shows it in the message list.
    pub fn record_sent_message(&self, handle: &ThreadHandle, message_id: String) -> bool {
        self.apply(|state| {
            if !state.targets_current_thread(handle) {
                return (false, false);
            }
            state.pending_message_id = Some(message_id);
            (true, true)
        })
    }

    /// Drop `message_id` as the current or pending message.
    pub fn clear_message(&self, message_id: &str) -> bool {
        self.apply(|state| {
            let mut changed = false;
            if state.message_id.as_deref() == Some(message_id) {
                state.message_id = None;
                changed = true;
            }
            if state.pending_message_id.as_deref() == Some(message_id) {
                state.pending_message_id = None;
                changed = true;
            }
            (changed, changed)
        })
    }

    /// Record an acknowledged participant addition (insert or replace by ID).
    pub fn participant_added(&self, handle: &ThreadHandle, participant: Participant) -> bool {
        self.apply(|state| {
            if !state.targets_current_thread(handle) {
                return (false, false);
            }
            let id = participant.id.clone();
            match state.participants.iter_mut().find(|p| p.id == id) {
                Some(existing) => *existing = participant,
                None => state.participants.push(participant),
            }
            state.last_added_participant = Some(id);
            (true, true)
        })
    }

    /// Record an acknowledged removal. Returns `false` (and publishes nothing)
    /// when the participant was already absent.
    pub fn participant_removed(&self, handle: &ThreadHandle, participant_id: &str) -> bool {
        self.apply(|state| {
            if !state.targets_current_thread(handle) {
                return (false, false);
            }
            let before = state.participants.len();
            state.participants.retain(|p| p.id != participant_id);
            let removed = state.participants.len() != before;
            if state.last_added_participant.as_deref() == Some(participant_id) {
                state.last_added_participant = None;
                return (removed, true);
            }
            (removed, removed)
        })
    }

    /// Draw the next synthetic participant name from the rotation.
    pub fn next_participant_name(&self) -> String {
        self.mutate(|state| state.rotation.next_name())
    }

    /// Append a classified notification to the event log and fold its
    /// connection effect. Returns the assigned event record ID.
    pub fn record_notification(
        &self,
        notification: &ClassifiedNotification,
        received_at_ms: u64,
    ) -> u64 {
        self.mutate(|state| {
            if let Some(connected) = notification.kind.connection_state() {
                state.connected = connected;
            }
            state.events.push(
                notification.kind,
                notification.display_name(),
                notification.payload.clone(),
                received_at_ms,
            )
        })
    }

    /// Issue a new reload generation for `resource` on the active thread.
    ///
    /// Returns `None` when there is no thread to reload.
    pub fn begin_reload(&self, resource: ResourceKind) -> Option<ReloadTicket> {
        let mut inner = self.lock();
        let thread_id = inner.state.current_thread_id()?.to_owned();
        let generation = inner.state.reloads.issue(resource);
        trace!(?resource, generation, %thread_id, "reload issued");
        Some(ReloadTicket {
            resource,
            generation,
            thread_id,
        })
    }

    /// Apply a message reload unless a newer reload was issued or the thread changed.
    pub fn apply_message_reload(&self, ticket: &ReloadTicket, messages: Vec<Message>) -> bool {
        self.apply(|state| {
            if !is_latest(state, ticket, ResourceKind::Messages) {
                return (false, false);
            }
            state.messages.replace_all(messages);
            state.enforce_message_invariant();
            debug!(
                generation = ticket.generation,
                message_count = state.messages.len(),
                "message list reloaded"
            );
            (true, true)
        })
    }

    /// Apply a roster reload unless a newer reload was issued or the thread changed.
    pub fn apply_participant_reload(
        &self,
        ticket: &ReloadTicket,
        participants: Vec<Participant>,
    ) -> bool {
        self.apply(|state| {
            if !is_latest(state, ticket, ResourceKind::Participants) {
                return (false, false);
            }
            let mut roster: Vec<Participant> = Vec::with_capacity(participants.len());
            for participant in participants {
                if roster.iter().any(|p| p.id == participant.id) {
                    warn!(participant_id = %participant.id, "dropping duplicate roster entry");
                    continue;
                }
                roster.push(participant);
            }
            state.participants = roster;
            state.enforce_roster_invariant();
            debug!(
                generation = ticket.generation,
                participant_count = state.participants.len(),
                "participant roster reloaded"
            );
            (true, true)
        })
    }

    fn lock(&self) -> MutexGuard<'_, StoreInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut SessionState) -> R) -> R {
        self.apply(|state| (f(state), true))
    }

    /// Run a fallible mutation; nothing is published when it fails.
    fn commit<T>(
        &self,
        f: impl FnOnce(&mut SessionState) -> Result<T, SyncError>,
    ) -> Result<T, SyncError> {
        self.apply(|state| {
            let result = f(state);
            let changed = result.is_ok();
            (result, changed)
        })
    }

    fn apply<R>(&self, f: impl FnOnce(&mut SessionState) -> (R, bool)) -> R {
        let mut guard = self.lock();
        let inner = &mut *guard;
        let (result, changed) = f(&mut inner.state);
        if !changed {
            return result;
        }

        inner.state.version += 1;
        let snapshot = Arc::new(inner.state.snapshot());
        *self.latest.write().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&snapshot);
        trace!(
            version = snapshot.version,
            listener_count = inner.listeners.len(),
            "publishing session snapshot"
        );
        for (_, listener) in &inner.listeners {
            listener(&snapshot);
        }
        result
    }
}

fn is_latest(state: &SessionState, ticket: &ReloadTicket, resource: ResourceKind) -> bool {
    if ticket.resource != resource {
        return false;
    }
    let latest = state.reloads.latest(resource);
    if ticket.generation != latest {
        debug!(
            ?resource,
            generation = ticket.generation,
            latest,
            "discarding superseded reload"
        );
        return false;
    }
    if state.current_thread_id() != Some(ticket.thread_id.as_str()) {
        debug!(?resource, thread_id = %ticket.thread_id, "discarding reload for inactive thread");
        return false;
    }
    true
}
