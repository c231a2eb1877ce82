//! Per-peer session coordinator.
//!
//! ```text
//!               join_session()
//!  NoSession ──────────────────► Joining ──┬── no open session ──► Scribe
//!      ▲                                   └── open session    ──► Folk
//!      │                                          (SyncReq → scribe)
//!      └──────── leave_session() / scribe left ────────────────────┘
//! ```
//!
//! A [`SessionManager`] owns everything the local peer knows about its
//! session behind one `tokio::sync::Mutex`: role, replicas, presence table
//! and uncommitted contributions. Inbound signals, local edits, presence
//! ticks and commits all take that lock, so there is a single writer.
//!
//! Observers subscribe to [`SessionEvent`]s.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Weak};

use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use scriptorium_core::{CommitHash, PeerId, SessionId, WorkspaceHash};

use crate::engine::{CrdtEngine, EngineError, Replica};
use crate::ledger::{Ledger, LedgerError, SessionInfo};
use crate::presence::{PresenceConfig, PresenceTable, PresenceTimers, Sighting};
use crate::protocol::{
    self, DispatchContext, Effect, MessagePayload, ProtocolError, Role, SynMessage, SynSignal,
};
use crate::store::{StoreError, WorkspaceStore};
use crate::transport::{Transport, TransportError};

/// Session coordinator configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub presence: PresenceConfig,
    /// Capacity of the event channel handed to observers.
    pub event_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            presence: PresenceConfig::default(),
            event_buffer: 64,
        }
    }
}

/// Notifications for observers of a [`SessionManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Joined { session_id: SessionId, role: Role },
    /// A folk joined, or came back after being declared gone.
    FolkJoined(PeerId),
    FolkLeft(PeerId),
    FolksGone(Vec<PeerId>),
    ChangesApplied { from: PeerId },
    Committed(CommitHash),
    /// The session ended without us asking.
    Ended { reason: &'static str },
    Left,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Not in a session")]
    NoSession,
    #[error("Already in a session on workspace {0}")]
    AlreadyJoined(WorkspaceHash),
    #[error("A join is already in progress")]
    JoinInProgress,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// State of the session this peer is part of.
pub(crate) struct ActiveSession {
    pub(crate) info: SessionInfo,
    /// Scribe only: who is in the session and when we last heard of them.
    pub(crate) folks: PresenceTable,
    /// Folk only: peers we know to be in the session.
    pub(crate) participants: BTreeSet<PeerId>,
    pub(crate) state: Box<dyn Replica>,
    pub(crate) ephemeral: Box<dyn Replica>,
    /// Sequence number of the last applied document change.
    pub(crate) change_seq: u64,
    /// `(seq, author)` of every change not yet committed.
    pub(crate) contributions: Vec<(u64, PeerId)>,
    /// Commits made during this session, oldest first.
    pub(crate) commits: Vec<CommitHash>,
    pub(crate) commit_in_flight: bool,
}

impl ActiveSession {
    fn new(info: SessionInfo, state: Box<dyn Replica>, ephemeral: Box<dyn Replica>) -> Self {
        Self {
            info,
            folks: PresenceTable::new(),
            participants: BTreeSet::from([info.scribe]),
            state,
            ephemeral,
            change_seq: 0,
            contributions: Vec::new(),
            commits: Vec::new(),
            commit_in_flight: false,
        }
    }

    fn workspace_hash(&self) -> WorkspaceHash {
        self.info.workspace_hash
    }

    fn record_contribution(&mut self, author: PeerId) {
        self.change_seq += 1;
        self.contributions.push((self.change_seq, author));
    }

    /// Parent of the next commit.
    pub(crate) fn parent(&self) -> CommitHash {
        self.commits.last().copied().unwrap_or(self.info.initial_tip)
    }

    /// Distinct authors of uncommitted changes, sorted.
    pub(crate) fn authors(&self) -> Vec<PeerId> {
        let authors: BTreeSet<PeerId> = self.contributions.iter().map(|(_, a)| *a).collect();
        authors.into_iter().collect()
    }

    /// Who should hear about a change made by this peer.
    fn change_targets(&self, role: Role) -> Vec<PeerId> {
        match role {
            Role::Scribe => self.folks.in_session(),
            _ => vec![self.info.scribe],
        }
    }

    fn heartbeat(&self) -> SynMessage {
        SynMessage::new(
            vec![self.info.scribe],
            self.workspace_hash(),
            MessagePayload::Heartbeat {
                known_participants: self.participants.iter().copied().collect(),
            },
        )
    }
}

pub(crate) struct PeerState {
    pub(crate) role: Role,
    known_sessions: HashMap<WorkspaceHash, Vec<SessionInfo>>,
    pub(crate) active: Option<ActiveSession>,
    timers: Option<PresenceTimers>,
    /// Bumped whenever a session starts or ends; stale ticks compare it.
    pub(crate) generation: u64,
}

impl PeerState {
    fn dispatch_context(&self, me: PeerId) -> DispatchContext {
        DispatchContext {
            role: self.role,
            me,
            scribe: self.active.as_ref().map(|a| a.info.scribe),
            workspace_hash: self.active.as_ref().map(|a| a.workspace_hash()),
        }
    }
}

pub(crate) struct SessionInner {
    pub(crate) me: PeerId,
    pub(crate) store: Arc<WorkspaceStore>,
    ledger: Arc<dyn Ledger>,
    transport: Arc<dyn Transport>,
    engine: Arc<dyn CrdtEngine>,
    config: SessionConfig,
    pub(crate) state: Mutex<PeerState>,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionInner {
    pub(crate) fn emit(&self, event: SessionEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

/// Handle to one peer's session coordinator. Cheap to clone.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<SessionInner>,
}

impl SessionManager {
    pub fn new(
        me: PeerId,
        store: Arc<WorkspaceStore>,
        ledger: Arc<dyn Ledger>,
        transport: Arc<dyn Transport>,
        engine: Arc<dyn CrdtEngine>,
        config: SessionConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_buffer.max(1));
        Self {
            inner: Arc::new(SessionInner {
                me,
                store,
                ledger,
                transport,
                engine,
                config,
                state: Mutex::new(PeerState {
                    role: Role::NoSession,
                    known_sessions: HashMap::new(),
                    active: None,
                    timers: None,
                    generation: 0,
                }),
                events,
            }),
        }
    }

    pub(crate) fn inner(&self) -> &SessionInner {
        &self.inner
    }

    pub fn me(&self) -> PeerId {
        self.inner.me
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    // ─── Lifecycle ────────────────────────────────────────────────────

    /// Join the workspace's first open session, or open one as scribe.
    ///
    /// The peer is `Joining` while the ledger is consulted; signals arriving
    /// meanwhile are ignored. A folk sends its sync request only once the
    /// session is installed, so the scribe's answer is never dropped.
    pub async fn join_session(&self, workspace_hash: WorkspaceHash) -> Result<Role, SessionError> {
        {
            let mut state = self.inner.state.lock().await;
            if let Some(active) = &state.active {
                return Err(SessionError::AlreadyJoined(active.workspace_hash()));
            }
            if state.role == Role::Joining {
                return Err(SessionError::JoinInProgress);
            }
            state.role = Role::Joining;
        }

        let established = self.establish(workspace_hash).await;
        let mut state = self.inner.state.lock().await;
        let (active, role, sessions) = match established {
            Ok(joined) => joined,
            Err(e) => {
                state.role = Role::NoSession;
                log::warn!("Failed to join a session on {}: {e}", workspace_hash.short());
                return Err(e);
            }
        };
        state.known_sessions.insert(workspace_hash, sessions);

        let session_id = active.info.session_id;
        let request = (role == Role::Folk).then(|| {
            SynMessage::new(
                vec![active.info.scribe],
                workspace_hash,
                MessagePayload::SyncReq {
                    sync_message: Some(active.state.sync_message()),
                    ephemeral_sync_message: Some(active.ephemeral.sync_message()),
                },
            )
        });
        state.generation += 1;
        state.role = role;
        state.active = Some(active);

        if let Some(request) = request {
            if let Err(e) = self.inner.transport.send_signal(request).await {
                state.active = None;
                state.role = Role::NoSession;
                state.generation += 1;
                log::warn!("Failed to reach the scribe of {session_id}: {e}");
                return Err(e.into());
            }
        }
        state.timers = Some(self.start_timers(state.generation));
        drop(state);

        log::info!(
            "Peer {} joined session {session_id} on {} as {role:?}",
            self.inner.me.short(),
            workspace_hash.short()
        );
        self.inner.emit(SessionEvent::Joined { session_id, role });
        Ok(role)
    }

    /// Find or open the session and load its starting state. Runs without
    /// the state lock.
    async fn establish(
        &self,
        workspace_hash: WorkspaceHash,
    ) -> Result<(ActiveSession, Role, Vec<SessionInfo>), SessionError> {
        let inner = &self.inner;
        let sessions = inner.ledger.get_sessions(workspace_hash).await?;
        inner.store.join_workspace(workspace_hash).await?;

        let (info, role, sessions) = match sessions.first() {
            None => {
                let info = inner.ledger.new_session(workspace_hash, inner.me).await?;
                (info, Role::Scribe, vec![info])
            }
            Some(first) => {
                let info = inner.ledger.get_session(first.session_id).await?;
                let role = if info.scribe == inner.me { Role::Scribe } else { Role::Folk };
                (info, role, sessions)
            }
        };

        let replica = self.load_state(info.initial_tip).await?;
        Ok((ActiveSession::new(info, replica, inner.engine.init_state()), role, sessions))
    }

    /// Replica holding the state of commit `tip`.
    async fn load_state(&self, tip: CommitHash) -> Result<Box<dyn Replica>, SessionError> {
        let store = &self.inner.store;
        let commit = match store.commit(&tip).await {
            Some(commit) => commit,
            None => store
                .fetch_all_commits()
                .await?
                .remove(&tip)
                .ok_or(StoreError::InvalidTip(tip))?,
        };
        Ok(self.inner.engine.load(&commit.state)?)
    }

    fn start_timers(&self, generation: u64) -> PresenceTimers {
        let scan_ref = Arc::downgrade(&self.inner);
        let beat_ref = scan_ref.clone();
        PresenceTimers::start(
            &self.inner.config.presence,
            move || tick(scan_ref.clone(), generation, TickKind::Scan),
            move || tick(beat_ref.clone(), generation, TickKind::Heartbeat),
        )
    }

    /// Leave the current session. Presence tasks are stopped before anything
    /// is sent.
    pub async fn leave_session(&self) -> Result<(), SessionError> {
        let timers = {
            let mut state = self.inner.state.lock().await;
            if state.active.is_none() {
                return Err(SessionError::NoSession);
            }
            state.timers.take()
        };
        if let Some(timers) = timers {
            timers.stop().await;
        }

        let mut state = self.inner.state.lock().await;
        let role = state.role;
        let active = state.active.take().ok_or(SessionError::NoSession)?;
        state.role = Role::NoSession;
        state.generation += 1;

        let workspace_hash = active.workspace_hash();
        let session_id = active.info.session_id;
        if role == Role::Scribe {
            if let Some(known) = state.known_sessions.get_mut(&workspace_hash) {
                known.retain(|s| s.session_id != session_id);
            }
        }

        let mut first_error: Option<SessionError> = None;
        let recipients = active.change_targets(role);
        if !recipients.is_empty() {
            let notice = SynMessage::new(recipients, workspace_hash, MessagePayload::LeaveWorkspace);
            if let Err(e) = self.inner.transport.send_signal(notice).await {
                log::warn!("Failed to announce departure from {session_id}: {e}");
                first_error.get_or_insert(e.into());
            }
        }
        if role == Role::Scribe {
            if let Err(e) = self.inner.ledger.close_session(session_id).await {
                log::warn!("Failed to close session {session_id}: {e}");
                first_error.get_or_insert(e.into());
            }
        }
        if let Err(e) = self.inner.ledger.leave_workspace(workspace_hash, self.inner.me).await {
            log::warn!("Failed to leave workspace {}: {e}", workspace_hash.short());
            first_error.get_or_insert(e.into());
        }
        drop(state);

        log::info!("Peer {} left session {session_id}", self.inner.me.short());
        self.inner.emit(SessionEvent::Left);
        first_error.map_or(Ok(()), Err)
    }

    /// Tear the session down without network I/O.
    fn end_locally(&self, state: &mut PeerState, reason: &'static str) {
        if let Some(timers) = state.timers.take() {
            timers.cancel();
        }
        state.active = None;
        state.role = Role::NoSession;
        state.generation += 1;
        log::info!("Peer {} session ended: {reason}", self.inner.me.short());
        self.inner.emit(SessionEvent::Ended { reason });
    }

    // ─── Inbound ──────────────────────────────────────────────────────

    /// Dispatch one inbound signal and perform the resulting effects.
    pub async fn handle_signal(&self, signal: SynSignal) -> Result<(), SessionError> {
        let mut state = self.inner.state.lock().await;
        let ctx = state.dispatch_context(self.inner.me);
        let effects = protocol::dispatch(&ctx, &signal)?;

        let mut outbox = Vec::new();
        for effect in effects {
            self.apply_effect(&mut state, effect, &mut outbox)?;
        }
        for message in outbox {
            self.inner.transport.send_signal(message).await?;
        }
        Ok(())
    }

    /// Spawn a task feeding `signals` into [`Self::handle_signal`] until the
    /// channel closes. Rejected signals are logged and skipped.
    pub fn spawn_inbound(&self, mut signals: mpsc::Receiver<SynSignal>) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            while let Some(signal) = signals.recv().await {
                let from = signal.provenance;
                if let Err(e) = manager.handle_signal(signal).await {
                    log::warn!("Signal from {} rejected: {e}", from.short());
                }
            }
            log::debug!("Inbound signal stream of {} closed", manager.inner.me.short());
        })
    }

    fn apply_effect(
        &self,
        state: &mut PeerState,
        effect: Effect,
        outbox: &mut Vec<SynMessage>,
    ) -> Result<(), SessionError> {
        if let Effect::EndSession { reason } = effect {
            self.end_locally(state, reason);
            return Ok(());
        }
        let Some(active) = state.active.as_mut() else {
            return Ok(());
        };
        let workspace_hash = active.workspace_hash();

        match effect {
            Effect::Ignore { reason } => log::debug!("Ignoring signal: {reason}"),
            Effect::EndSession { .. } => {}
            Effect::SeeFolk(peer) => match active.folks.see(peer, Instant::now()) {
                Sighting::New | Sighting::Returned => {
                    log::info!("Folk {} is in session {}", peer.short(), active.info.session_id);
                    self.inner.emit(SessionEvent::FolkJoined(peer));
                }
                Sighting::Refreshed => {}
            },
            Effect::RemoveFolk(peer) => {
                if active.folks.remove(&peer).is_some() {
                    log::info!("Folk {} left session {}", peer.short(), active.info.session_id);
                    self.inner.emit(SessionEvent::FolkLeft(peer));
                }
            }
            Effect::ApplyStateChanges { from, changes } => {
                active.state.apply_changes(&changes)?;
                active.record_contribution(from);
                self.inner.emit(SessionEvent::ChangesApplied { from });
            }
            Effect::ApplyEphemeralChanges { changes, .. } => {
                active.ephemeral.apply_changes(&changes)?;
            }
            Effect::RelayChanges { from, state_changes, ephemeral_changes } => {
                let recipients: Vec<PeerId> =
                    active.folks.in_session().into_iter().filter(|p| *p != from).collect();
                if !recipients.is_empty() {
                    outbox.push(SynMessage::new(
                        recipients,
                        workspace_hash,
                        MessagePayload::ChangeNotice { state_changes, ephemeral_changes },
                    ));
                }
            }
            Effect::AnswerSync { to, sync_message, ephemeral_sync_message, request_back } => {
                let state_changes: Vec<Vec<u8>> =
                    active.state.changes_for(sync_message.as_deref())?.into_iter().collect();
                let ephemeral_changes: Vec<Vec<u8>> = active
                    .ephemeral
                    .changes_for(ephemeral_sync_message.as_deref())?
                    .into_iter()
                    .collect();
                if !state_changes.is_empty() || !ephemeral_changes.is_empty() {
                    outbox.push(SynMessage::new(
                        vec![to],
                        workspace_hash,
                        MessagePayload::ChangeNotice { state_changes, ephemeral_changes },
                    ));
                }
                if request_back {
                    outbox.push(SynMessage::new(
                        vec![to],
                        workspace_hash,
                        MessagePayload::SyncReq {
                            sync_message: Some(active.state.sync_message()),
                            ephemeral_sync_message: Some(active.ephemeral.sync_message()),
                        },
                    ));
                }
            }
            Effect::NoteParticipant(peer) => {
                active.participants.insert(peer);
            }
            Effect::ForgetParticipants(gone) => {
                for peer in &gone {
                    active.participants.remove(peer);
                }
            }
            Effect::AnnouncePresence => {
                log::info!("Scribe declared {} gone; announcing presence", self.inner.me.short());
                outbox.push(active.heartbeat());
            }
        }
        Ok(())
    }

    // ─── Local edits ──────────────────────────────────────────────────

    /// Apply a change made on this peer and send it to the session.
    pub async fn apply_local_change(&self, change: Vec<u8>) -> Result<(), SessionError> {
        let mut state = self.inner.state.lock().await;
        let role = state.role;
        let active = state.active.as_mut().ok_or(SessionError::NoSession)?;
        active.state.apply_changes(std::slice::from_ref(&change))?;
        active.record_contribution(self.inner.me);

        let recipients = active.change_targets(role);
        if recipients.is_empty() {
            return Ok(());
        }
        let notice = SynMessage::new(
            recipients,
            active.workspace_hash(),
            MessagePayload::ChangeNotice { state_changes: vec![change], ephemeral_changes: vec![] },
        );
        self.inner.transport.send_signal(notice).await?;
        Ok(())
    }

    /// Apply an ephemeral change (cursors, selections) and send it on.
    /// Ephemeral changes are never committed.
    pub async fn apply_ephemeral_change(&self, change: Vec<u8>) -> Result<(), SessionError> {
        let mut state = self.inner.state.lock().await;
        let role = state.role;
        let active = state.active.as_mut().ok_or(SessionError::NoSession)?;
        active.ephemeral.apply_changes(std::slice::from_ref(&change))?;

        let recipients = active.change_targets(role);
        if recipients.is_empty() {
            return Ok(());
        }
        let notice = SynMessage::new(
            recipients,
            active.workspace_hash(),
            MessagePayload::ChangeNotice { state_changes: vec![], ephemeral_changes: vec![change] },
        );
        self.inner.transport.send_signal(notice).await?;
        Ok(())
    }

    // ─── Presence ticks ───────────────────────────────────────────────

    async fn scan_tick(&self, generation: u64) {
        let mut state = self.inner.state.lock().await;
        if state.generation != generation || state.role != Role::Scribe {
            return;
        }
        let Some(active) = state.active.as_mut() else {
            return;
        };
        let gone = active
            .folks
            .scan(Instant::now(), self.inner.config.presence.outstanding_timeout);
        if gone.is_empty() {
            return;
        }

        log::info!(
            "{} folk(s) timed out of session {}",
            gone.len(),
            active.info.session_id
        );
        let lore = SynMessage::new(
            active.folks.known(),
            active.workspace_hash(),
            MessagePayload::FolkLore { gone: gone.clone() },
        );
        if let Err(e) = self.inner.transport.send_signal(lore).await {
            log::warn!("Failed to send folk lore: {e}");
        }
        self.inner.emit(SessionEvent::FolksGone(gone));
    }

    async fn heartbeat_tick(&self, generation: u64) {
        let state = self.inner.state.lock().await;
        if state.generation != generation || state.role != Role::Folk {
            return;
        }
        let Some(beat) = state.active.as_ref().map(ActiveSession::heartbeat) else {
            return;
        };
        if let Err(e) = self.inner.transport.send_signal(beat).await {
            log::warn!("Failed to send heartbeat: {e}");
        }
    }

    // ─── Queries ──────────────────────────────────────────────────────

    pub async fn role(&self) -> Role {
        self.inner.state.lock().await.role
    }

    pub async fn session_info(&self) -> Option<SessionInfo> {
        self.inner.state.lock().await.active.as_ref().map(|a| a.info)
    }

    /// Sessions last seen on the ledger for `workspace_hash`.
    pub async fn known_sessions(&self, workspace_hash: &WorkspaceHash) -> Vec<SessionInfo> {
        self.inner
            .state
            .lock()
            .await
            .known_sessions
            .get(workspace_hash)
            .cloned()
            .unwrap_or_default()
    }

    /// Folks the scribe currently considers in session.
    pub async fn folks(&self) -> Vec<PeerId> {
        self.inner
            .state
            .lock()
            .await
            .active
            .as_ref()
            .map(|a| a.folks.in_session())
            .unwrap_or_default()
    }

    /// Participants known to a folk, the scribe included.
    pub async fn participants(&self) -> Vec<PeerId> {
        self.inner
            .state
            .lock()
            .await
            .active
            .as_ref()
            .map(|a| a.participants.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Snapshot of the live document state.
    pub async fn snapshot(&self) -> Option<Vec<u8>> {
        self.inner.state.lock().await.active.as_ref().map(|a| a.state.save_snapshot())
    }

    /// Commits made in the current session, oldest first.
    pub async fn session_commits(&self) -> Vec<CommitHash> {
        self.inner
            .state
            .lock()
            .await
            .active
            .as_ref()
            .map(|a| a.commits.clone())
            .unwrap_or_default()
    }

    /// Number of document changes not yet committed.
    pub async fn uncommitted_changes(&self) -> usize {
        self.inner
            .state
            .lock()
            .await
            .active
            .as_ref()
            .map_or(0, |a| a.contributions.len())
    }
}

#[derive(Clone, Copy)]
enum TickKind {
    Scan,
    Heartbeat,
}

async fn tick(inner: Weak<SessionInner>, generation: u64, kind: TickKind) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let manager = SessionManager { inner };
    match kind {
        TickKind::Scan => manager.scan_tick(generation).await,
        TickKind::Heartbeat => manager.heartbeat_tick(generation).await,
    }
}
