//! One editing session of one project.
//!
//! ```text
//!  initialize ─► replay local log ─► build relay transport ─► remote load
//!                                       (not connected)       (empty doc only)
//!      │ offline                          │ online
//!      ▼                                  ▼
//!  bootstrap ─► undo + listeners      connect() ─► wait_for_sync()
//!                                                    │ presence window
//!                                                    │ full sync (peers seen)
//!                                                    │ bootstrap election
//!                                                    ▼
//!                                                  bootstrap ─► undo + listeners
//! ```
//!
//! Once connected three tasks run next to the caller:
//!
//! - **outbound** forwards Local/System commits to the relay
//! - **inbound** applies deltas, answers sync requests, tracks presence
//! - **heartbeat** re-broadcasts presence and prunes silent sessions
//!
//! Every suspension point is bounded. Local storage faults, a failed remote
//! load or an unreachable relay degrade the session and are recorded in
//! [`SessionStatus`]; they never fail [`SyncController::initialize`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use quire_core::{DocumentStore, TxnOrigin};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;
use yrs::Subscription;

use crate::config::SyncConfig;
use crate::locks::{LockError, LockEvent, LockState, LockTable};
use crate::presence::{PresenceChange, PresenceMessage, PresenceRoom, PresenceState};
use crate::protocol::{PeerInfo, ProtocolError};
use crate::reconcile::{ChangeReconciler, ViewRenderer};
use crate::save::{SaveController, SaveError, SaveIndicator, SaveStatus};
use crate::storage::{
    LocalPersistence, PersistenceHandle, RemoteError, RemoteStore, ReplayOutcome,
};
use crate::transport::{RelayEvent, RelayTransport};
use crate::undo::UndoScope;

const LOCK_EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InitOptions {
    /// The project was just created; there is nothing to load remotely.
    pub is_new_project: bool,
}

/// Result of the one remote load attempted for an empty document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteLoad {
    /// Not attempted: new project, or local replay already had content
    Skipped,
    Loaded { bytes: usize },
    /// The project was never saved
    NotFound,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStatus {
    pub memory_only: bool,
    pub local_replay: ReplayOutcome,
    pub remote_load: RemoteLoad,
    pub sync_skipped: bool,
    pub peers_seen: bool,
    /// Id of the root page this session created, if it bootstrapped
    pub bootstrapped: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    #[error("invalid session config: {0}")]
    InvalidConfig(String),
    #[error("no relay configured")]
    Offline,
    #[error(transparent)]
    Relay(#[from] ProtocolError),
}

// ───────────────────────────────────────────────────────────────────
// Shared state
// ───────────────────────────────────────────────────────────────────

/// State the background tasks see.
struct Shared {
    config: SyncConfig,
    session_id: Uuid,
    store: DocumentStore,
    transport: Option<Arc<RelayTransport>>,
    presence: RwLock<PresenceRoom>,
    /// A peer answered our state vector
    synced: AtomicBool,
    sync_notify: Notify,
    /// A remote update was merged
    remote_applied: Notify,
    lock_events: broadcast::Sender<LockEvent>,
}

impl Shared {
    async fn send_presence(&self, message: &PresenceMessage) {
        if let Some(transport) = &self.transport {
            if let Err(e) = transport.send_presence(message).await {
                log::debug!("Presence not sent: {e}");
            }
        }
    }

    fn apply_remote(&self, peer_id: Uuid, update: &[u8]) {
        match self.store.apply_update(TxnOrigin::Remote, update) {
            Ok(()) => self.remote_applied.notify_waiters(),
            Err(e) => log::warn!("Rejected update from {peer_id}: {e}"),
        }
    }

    /// Offer our state to the room again after a merge peers cannot have seen.
    async fn resync(&self) {
        let Some(transport) = &self.transport else { return };
        if transport.is_connected().await {
            if let Err(e) = transport.send_sync_step1(self.store.state_vector()).await {
                log::debug!("Sync request not sent: {e}");
            }
        }
    }

    async fn handle_event(&self, event: RelayEvent) {
        match event {
            RelayEvent::Connected => {
                let (update, query) = {
                    let room = self.presence.read().await;
                    (room.update_message(), room.query_message())
                };
                self.send_presence(&update).await;
                self.send_presence(&query).await;
            }
            RelayEvent::Disconnected => {
                log::info!("Session {} is offline; edits stay local", self.session_id);
            }
            RelayEvent::RemoteDelta { peer_id, update, .. } => self.apply_remote(peer_id, &update),
            RelayEvent::SyncRequest { peer_id, state_vector, addressed } => {
                let Some(transport) = &self.transport else { return };
                match self.store.encode_diff(&state_vector) {
                    Ok(diff) => {
                        if let Err(e) = transport.send_sync_step2(peer_id, diff).await {
                            log::debug!("Sync answer to {peer_id} not sent: {e}");
                        }
                    }
                    Err(e) => log::warn!("Bad state vector from {peer_id}: {e}"),
                }
                // The requester may hold edits we never saw; ask it back once.
                if !addressed {
                    if let Err(e) = transport.send_sync_step1_to(peer_id, self.store.state_vector()).await {
                        log::debug!("Sync request to {peer_id} not sent: {e}");
                    }
                }
            }
            RelayEvent::SyncResponse { peer_id, update } => {
                self.apply_remote(peer_id, &update);
                self.synced.store(true, Ordering::SeqCst);
                self.sync_notify.notify_waiters();
                log::debug!("Full sync with {peer_id} done");
            }
            RelayEvent::Presence { message, .. } => self.handle_presence(&message).await,
            RelayEvent::PeerJoined(info) => {
                log::debug!("{} ({}) joined", info.name, info.peer_id);
                let update = self.presence.read().await.update_message();
                self.send_presence(&update).await;
            }
            RelayEvent::PeerLeft(peer_id) => {
                self.presence.write().await.remove_peer(&peer_id);
            }
        }
    }

    async fn handle_presence(&self, message: &PresenceMessage) {
        let (reply, lost) = {
            let mut room = self.presence.write().await;
            match room.handle_message(message) {
                PresenceChange::QueryReceived(_) => (Some(room.update_message()), None),
                PresenceChange::Joined(_) | PresenceChange::Updated(_) => {
                    (None, room.resolve_lock_contention())
                }
                PresenceChange::Left(_) | PresenceChange::Ignored => (None, None),
            }
        };
        if let Some(reply) = reply {
            self.send_presence(&reply).await;
        }
        if let Some((event, update)) = lost {
            self.send_presence(&update).await;
            let _ = self.lock_events.send(event);
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Controller
// ───────────────────────────────────────────────────────────────────

pub struct SyncController {
    shared: Arc<Shared>,
    persistence: LocalPersistence,
    persistence_handle: tokio::sync::Mutex<Option<PersistenceHandle>>,
    save: Arc<SaveController>,
    undo: OnceLock<UndoScope>,
    reconciler: tokio::sync::Mutex<Option<ChangeReconciler>>,
    pending_renderer: Mutex<Option<Box<dyn ViewRenderer>>>,
    relay_forward: Mutex<Option<Subscription>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    status: Arc<Mutex<SessionStatus>>,
    ready: AtomicBool,
}

impl SyncController {
    /// Build the session: local replay, transport construction, remote load.
    ///
    /// Offline sessions are fully ready on return. Online sessions become
    /// ready after [`connect`](Self::connect) and
    /// [`wait_for_sync`](Self::wait_for_sync).
    pub async fn initialize(
        config: SyncConfig,
        remote: Arc<dyn RemoteStore>,
        options: InitOptions,
    ) -> Result<Self, SessionError> {
        if config.project_id.trim().is_empty() {
            return Err(SessionError::InvalidConfig("project id is empty".into()));
        }
        let session_id = Uuid::new_v4();
        log::info!("Initializing session {session_id} for {}", config.project_id);

        // 1. Empty document
        let store = DocumentStore::new(config.project_id.clone());

        // 2-3. Local durable tier; recovery happens inside open
        let persistence = LocalPersistence::open(
            config.project_id.clone(),
            config.storage_path.as_deref(),
            config.compact_threshold,
        );
        if !persistence.is_persistent() {
            log::warn!("Session {session_id} runs memory-only; edits survive only through save()");
        }
        let local_replay = persistence.replay(&store, config.local_replay_timeout()).await;
        let persistence_handle = persistence.attach(&store);

        // 4. Transport is built but left disconnected
        let transport = config.relay_url.as_ref().map(|url| {
            Arc::new(RelayTransport::new(
                PeerInfo::with_id(session_id, config.display_name.clone()),
                config.room(),
                url.clone(),
                config.offline_queue_capacity,
            ))
        });

        // 5. One load from the authoritative store for an empty document
        let remote_load = if options.is_new_project || !store.is_empty() {
            RemoteLoad::Skipped
        } else {
            load_remote(&store, remote.as_ref(), config.remote_timeout()).await
        };

        let (lock_events, _) = broadcast::channel(LOCK_EVENT_CAPACITY);
        let presence = PresenceRoom::new(
            PresenceState::new(session_id, config.display_name.clone()),
            config.presence_timeout(),
        );
        let offline = transport.is_none();
        let shared = Arc::new(Shared {
            session_id,
            store: store.clone(),
            transport,
            presence: RwLock::new(presence),
            synced: AtomicBool::new(false),
            sync_notify: Notify::new(),
            remote_applied: Notify::new(),
            lock_events,
            config,
        });

        let controller = Self {
            save: Arc::new(SaveController::new(store, remote)),
            status: Arc::new(Mutex::new(SessionStatus {
                memory_only: !persistence.is_persistent(),
                local_replay,
                remote_load,
                sync_skipped: false,
                peers_seen: false,
                bootstrapped: None,
            })),
            shared,
            persistence,
            persistence_handle: tokio::sync::Mutex::new(persistence_handle),
            undo: OnceLock::new(),
            reconciler: tokio::sync::Mutex::new(None),
            pending_renderer: Mutex::new(None),
            relay_forward: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            ready: AtomicBool::new(false),
        };
        controller.start_forwarding();

        if offline {
            controller.bootstrap_after_replay();
            controller.finish().await;
        }
        Ok(controller)
    }

    /// Forward Local and System commits to the relay; queued while offline.
    fn start_forwarding(&self) {
        let Some(transport) = self.shared.transport.clone() else { return };
        let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let subscription = self.shared.store.doc().observe_update_v1(move |txn, event| {
            if TxnOrigin::of(txn).forwards_to_relay() {
                let _ = tx.send(event.update.clone());
            }
        });
        match subscription {
            Ok(subscription) => *lock(&self.relay_forward) = Some(subscription),
            Err(e) => {
                log::error!("Cannot observe document for relay forwarding: {e}");
                return;
            }
        }
        let outbound = tokio::spawn(async move {
            while let Some(update) = rx.recv().await {
                if let Err(e) = transport.send_delta(update).await {
                    log::warn!("Delta dropped: {e}");
                }
            }
        });
        lock(&self.tasks).push(outbound);
    }

    /// Open the relay connection and start the inbound and heartbeat tasks.
    ///
    /// A failure leaves the session usable locally; deltas keep queueing.
    pub async fn connect(&self) -> Result<(), SessionError> {
        let transport = self.shared.transport.clone().ok_or(SessionError::Offline)?;

        if let Some(mut events) = transport.take_event_rx() {
            let shared = self.shared.clone();
            let inbound = tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    shared.handle_event(event).await;
                }
            });
            let shared = self.shared.clone();
            let heartbeat = tokio::spawn(async move {
                let period = shared.config.presence_heartbeat();
                let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
                loop {
                    ticker.tick().await;
                    let (message, pruned) = {
                        let mut room = shared.presence.write().await;
                        (room.heartbeat(), room.prune_expired())
                    };
                    if !pruned.is_empty() {
                        log::debug!("Pruned {} silent sessions", pruned.len());
                    }
                    shared.send_presence(&message).await;
                }
            });
            lock(&self.tasks).extend([inbound, heartbeat]);
        }

        transport.connect(self.shared.store.state_vector()).await?;
        Ok(())
    }

    /// Decide whether to wait for peers, then bootstrap and go ready.
    pub async fn wait_for_sync(&self) {
        if self.is_ready() {
            return;
        }
        let shared = &self.shared;
        let online = match &shared.transport {
            Some(transport) => transport.is_connected().await,
            None => false,
        };

        if shared.config.skip_sync_wait || !online {
            lock(&self.status).sync_skipped = true;
        } else if !shared.synced.load(Ordering::SeqCst) {
            let query = shared.presence.read().await.query_message();
            shared.send_presence(&query).await;
            tokio::time::sleep(shared.config.presence_window()).await;

            let peers_seen = shared.presence.read().await.has_peers();
            lock(&self.status).peers_seen = peers_seen;
            if peers_seen {
                self.wait_for_full_sync().await;
                if shared.store.is_empty() && !self.elected().await {
                    self.wait_for_bootstrap().await;
                }
            } else {
                log::info!("No other sessions seen; continuing single-user");
            }
        }

        self.bootstrap_after_replay();
        self.finish().await;
    }

    async fn wait_for_full_sync(&self) {
        let shared = &self.shared;
        let deadline = Instant::now() + shared.config.sync_timeout();
        // Our first state vector may have gone out before the peers joined.
        if let Some(transport) = &shared.transport {
            if let Err(e) = transport.send_sync_step1(shared.store.state_vector()).await {
                log::debug!("Sync request not sent: {e}");
            }
        }
        loop {
            let notified = shared.sync_notify.notified();
            if shared.synced.load(Ordering::SeqCst) {
                return;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                log::warn!("No full sync within {:?}; continuing", shared.config.sync_timeout());
                return;
            }
        }
    }

    /// Lowest session id among the ones observed bootstraps first.
    async fn elected(&self) -> bool {
        let room = self.shared.presence.read().await;
        let lowest = room.peers().all(|peer| peer.session_id > self.shared.session_id);
        lowest
    }

    async fn wait_for_bootstrap(&self) {
        let shared = &self.shared;
        let deadline = Instant::now() + shared.config.bootstrap_wait();
        loop {
            let notified = shared.remote_applied.notified();
            if !shared.store.is_empty() {
                return;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                log::info!("Elected session did not bootstrap in time; bootstrapping here");
                return;
            }
        }
    }

    /// Create the root page when the document is still empty.
    pub fn bootstrap_if_empty(&self) -> Option<String> {
        let page = self.shared.store.bootstrap_if_empty(TxnOrigin::System)?;
        lock(&self.status).bootstrapped = Some(page.clone());
        Some(page)
    }

    /// Bootstrap now, or once a local replay that timed out has been merged.
    fn bootstrap_after_replay(&self) {
        let Some(late) = self.persistence.take_late_replay() else {
            self.bootstrap_if_empty();
            return;
        };
        log::info!("Deferring bootstrap until the local replay completes");
        let shared = self.shared.clone();
        let status = self.status.clone();
        let task = tokio::spawn(async move {
            let outcome = late.await.unwrap_or_else(|e| ReplayOutcome::Failed(e.to_string()));
            let page = shared.store.bootstrap_if_empty(TxnOrigin::System);
            {
                let mut status = lock(&status);
                status.local_replay = outcome;
                if page.is_some() {
                    status.bootstrapped = page;
                }
            }
            shared.resync().await;
        });
        lock(&self.tasks).push(task);
    }

    /// Attach undo, dirty tracking and the change listener.
    async fn finish(&self) {
        if self.ready.swap(true, Ordering::SeqCst) {
            return;
        }
        let store = &self.shared.store;
        let undo = self
            .undo
            .get_or_init(|| UndoScope::attach(store, self.shared.config.undo_capture()));
        undo.clear();
        self.save.attach();

        let reconciler = ChangeReconciler::attach(store, self.shared.config.reconcile_debounce());
        if let Some(renderer) = lock(&self.pending_renderer).take() {
            reconciler.set_renderer(renderer);
        }
        *self.reconciler.lock().await = Some(reconciler);
        log::info!("Session {} ready", self.shared.session_id);
    }

    // ─── Accessors ────────────────────────────────────────────────────

    pub fn store(&self) -> &DocumentStore {
        &self.shared.store
    }

    pub fn session_id(&self) -> Uuid {
        self.shared.session_id
    }

    pub fn config(&self) -> &SyncConfig {
        &self.shared.config
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn is_persistent(&self) -> bool {
        self.persistence.is_persistent()
    }

    pub fn status(&self) -> SessionStatus {
        lock(&self.status).clone()
    }

    pub async fn is_connected(&self) -> bool {
        match &self.shared.transport {
            Some(transport) => transport.is_connected().await,
            None => false,
        }
    }

    pub fn transport(&self) -> Option<&Arc<RelayTransport>> {
        self.shared.transport.as_ref()
    }

    // ─── Presence and locks ───────────────────────────────────────────

    /// Every live session except this one.
    pub async fn presence(&self) -> Vec<PresenceState> {
        self.shared.presence.read().await.peers().cloned().collect()
    }

    pub async fn local_presence(&self) -> PresenceState {
        self.shared.presence.read().await.local().clone()
    }

    pub async fn set_active_page(&self, page_id: Option<String>) {
        let message = self.shared.presence.write().await.set_page(page_id);
        self.shared.send_presence(&message).await;
    }

    pub async fn locks(&self) -> LockTable {
        self.shared.presence.read().await.lock_table()
    }

    pub async fn lock_state(&self, component_id: &str) -> LockState {
        self.shared.presence.read().await.lock_state(component_id)
    }

    pub async fn request_lock(&self, component_id: &str) -> Result<(), LockError> {
        let message = self.shared.presence.write().await.request_lock(component_id)?;
        self.shared.send_presence(&message).await;
        let _ = self.shared.lock_events.send(LockEvent::Acquired(component_id.to_string()));
        Ok(())
    }

    pub async fn release_lock(&self) {
        let released = self.shared.presence.write().await.release_lock();
        if let Some((component_id, message)) = released {
            self.shared.send_presence(&message).await;
            let _ = self.shared.lock_events.send(LockEvent::Released(component_id));
        }
    }

    pub fn subscribe_locks(&self) -> broadcast::Receiver<LockEvent> {
        self.shared.lock_events.subscribe()
    }

    // ─── Undo ─────────────────────────────────────────────────────────

    pub fn undo(&self) -> bool {
        self.undo.get().is_some_and(UndoScope::undo)
    }

    pub fn redo(&self) -> bool {
        self.undo.get().is_some_and(UndoScope::redo)
    }

    pub fn can_undo(&self) -> bool {
        self.undo.get().is_some_and(UndoScope::can_undo)
    }

    pub fn can_redo(&self) -> bool {
        self.undo.get().is_some_and(UndoScope::can_redo)
    }

    // ─── Saving ───────────────────────────────────────────────────────

    pub async fn save(&self) -> Result<(), SaveError> {
        self.save.save().await
    }

    pub fn save_status(&self) -> SaveStatus {
        self.save.status()
    }

    pub fn saves(&self) -> &Arc<SaveController> {
        &self.save
    }

    pub async fn indicator(&self) -> SaveIndicator {
        self.save.indicator(self.is_connected().await)
    }

    // ─── Rendering ────────────────────────────────────────────────────

    /// Route change notifications to `renderer`. Before the session is
    /// ready the renderer is held and installed with the listener.
    pub async fn attach_renderer(&self, renderer: Box<dyn ViewRenderer>) {
        match self.reconciler.lock().await.as_ref() {
            Some(reconciler) => reconciler.set_renderer(renderer),
            None => *lock(&self.pending_renderer) = Some(renderer),
        }
    }

    // ─── Teardown ─────────────────────────────────────────────────────

    /// Page exit: tell peers we left and push a snapshot without waiting.
    pub fn flush_on_exit(&self) -> JoinHandle<Result<(), SaveError>> {
        let shared = self.shared.clone();
        let save = self.save.clone();
        tokio::spawn(async move {
            let leave = shared.presence.read().await.leave_message();
            shared.send_presence(&leave).await;
            save.save().await
        })
    }

    /// Leave the room, stop every task and flush the local log.
    pub async fn shutdown(&self) {
        if let Some(transport) = &self.shared.transport {
            let leave = self.shared.presence.read().await.leave_message();
            self.shared.send_presence(&leave).await;
            transport.disconnect().await;
        }
        lock(&self.relay_forward).take();
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        if let Some(reconciler) = self.reconciler.lock().await.take() {
            reconciler.close().await;
        }
        if let Some(handle) = self.persistence_handle.lock().await.take() {
            handle.close().await;
        }
        log::info!("Session {} shut down", self.shared.session_id);
    }
}

async fn load_remote(store: &DocumentStore, remote: &dyn RemoteStore, timeout: Duration) -> RemoteLoad {
    let project_id = store.project_id().to_string();
    let loaded = match tokio::time::timeout(timeout, remote.load(&project_id)).await {
        Ok(result) => result,
        Err(_) => Err(RemoteError::Timeout),
    };
    match loaded {
        Ok(Some(snapshot)) => match store.apply_update(TxnOrigin::System, &snapshot) {
            Ok(()) => {
                log::info!("Loaded {project_id} from the remote store");
                RemoteLoad::Loaded { bytes: snapshot.len() }
            }
            Err(e) => {
                log::warn!("Remote snapshot of {project_id} is unreadable: {e}");
                RemoteLoad::Failed(e.to_string())
            }
        },
        Ok(None) => RemoteLoad::NotFound,
        Err(e) => {
            log::warn!("Remote load of {project_id} failed, continuing offline: {e}");
            RemoteLoad::Failed(e.to_string())
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
