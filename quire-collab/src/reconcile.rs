//! Turns committed document changes into view refreshes.
//!
//! ```text
//!  deep observers (navigation, metadata, assets)
//!        │  classify by path shape, tag with origin
//!        ▼
//!  unbounded channel ──► reconcile task ──► ViewRenderer
//!                           │   render_component / patch_* (now)
//!                           └── reload_page / refresh_navigation (debounced)
//! ```
//!
//! Observers only classify and enqueue. The renderer is driven from the
//! task, outside the committing transaction, so it may read the store.
//! Every notification reaches [`ViewRenderer::on_change`]; view actions are
//! taken for remote changes only, since local edits were already applied by
//! the editor that made them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use quire_core::{entity_id, resolve_path, DocumentStore, TxnOrigin};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use yrs::types::{Change as ArrayDelta, Event, Events};
use yrs::{ArrayRef, DeepObservable, Subscription, TransactionMut};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    ComponentAdded,
    ComponentUpdated,
    ComponentRemoved,
    BlockAdded,
    BlockRemoved,
    BlockUpdated,
    PageAdded,
    PageRemoved,
    PageUpdated,
    MetadataChanged,
    AssetsChanged,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub kind: ChangeKind,
    pub page_id: Option<String>,
    pub block_id: Option<String>,
    pub component_id: Option<String>,
    /// Keys touched by an update; empty for additions and removals.
    pub fields: Vec<String>,
}

impl Change {
    fn new(kind: ChangeKind) -> Self {
        Self {
            kind,
            page_id: None,
            block_id: None,
            component_id: None,
            fields: Vec::new(),
        }
    }
}

/// All changes one root saw in one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeNotification {
    pub changes: Vec<Change>,
    pub is_remote: bool,
    pub origin: TxnOrigin,
}

/// Implemented by whatever draws the document.
pub trait ViewRenderer: Send {
    fn on_change(&mut self, _notification: &ChangeNotification) {}

    /// Page currently shown, if any.
    fn active_page(&self) -> Option<String>;

    fn render_component(&mut self, page_id: &str, block_id: &str, component_id: &str);

    /// Update one component in place. Returns `false` when it is not on screen.
    fn patch_component(&mut self, component_id: &str, fields: &[String]) -> bool;

    /// Same for a block's own fields.
    fn patch_block(&mut self, block_id: &str, fields: &[String]) -> bool;

    fn reload_page(&mut self, page_id: &str);

    fn refresh_navigation(&mut self);
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub notifications: u64,
    pub remote_notifications: u64,
    pub renders: u64,
    pub patches: u64,
    pub reloads: u64,
    pub navigation_refreshes: u64,
}

#[derive(Default)]
struct AtomicReconcileStats {
    notifications: AtomicU64,
    remote_notifications: AtomicU64,
    renders: AtomicU64,
    patches: AtomicU64,
    reloads: AtomicU64,
    navigation_refreshes: AtomicU64,
}

impl AtomicReconcileStats {
    fn snapshot(&self) -> ReconcileStats {
        ReconcileStats {
            notifications: self.notifications.load(Ordering::Relaxed),
            remote_notifications: self.remote_notifications.load(Ordering::Relaxed),
            renders: self.renders.load(Ordering::Relaxed),
            patches: self.patches.load(Ordering::Relaxed),
            reloads: self.reloads.load(Ordering::Relaxed),
            navigation_refreshes: self.navigation_refreshes.load(Ordering::Relaxed),
        }
    }
}

enum Command {
    Notify(ChangeNotification),
    Renderer(Box<dyn ViewRenderer>),
}

pub struct ChangeReconciler {
    commands: mpsc::UnboundedSender<Command>,
    subscriptions: Vec<Subscription>,
    task: JoinHandle<()>,
    stats: Arc<AtomicReconcileStats>,
}

impl ChangeReconciler {
    /// Observe `store` and start the reconcile task.
    pub fn attach(store: &DocumentStore, debounce: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let stats = Arc::new(AtomicReconcileStats::default());

        let navigation = store.navigation_ref().clone();
        let nav_tx = tx.clone();
        let nav_sub = store.navigation_ref().observe_deep(move |txn, events| {
            let changes = classify_navigation(txn, &navigation, events);
            notify(&nav_tx, txn, changes);
        });

        let meta_tx = tx.clone();
        let meta_sub = store.metadata_ref().observe_deep(move |txn, events| {
            notify(&meta_tx, txn, classify_root(txn, events, ChangeKind::MetadataChanged));
        });

        let asset_tx = tx.clone();
        let asset_sub = store.assets_ref().observe_deep(move |txn, events| {
            notify(&asset_tx, txn, classify_root(txn, events, ChangeKind::AssetsChanged));
        });

        let task = tokio::spawn(run(rx, debounce, stats.clone()));
        Self {
            commands: tx,
            subscriptions: vec![nav_sub, meta_sub, asset_sub],
            task,
            stats,
        }
    }

    /// Install or replace the renderer.
    pub fn set_renderer(&self, renderer: Box<dyn ViewRenderer>) {
        if self.commands.send(Command::Renderer(renderer)).is_err() {
            log::warn!("Reconciler stopped; renderer dropped");
        }
    }

    pub fn stats(&self) -> ReconcileStats {
        self.stats.snapshot()
    }

    /// Stop observing and run any pending refresh.
    pub async fn close(self) {
        let Self {
            commands,
            subscriptions,
            task,
            ..
        } = self;
        drop(subscriptions);
        drop(commands);
        if let Err(e) = task.await {
            log::error!("Reconcile task failed: {e}");
        }
    }
}

fn notify(tx: &mpsc::UnboundedSender<Command>, txn: &TransactionMut, changes: Vec<Change>) {
    if changes.is_empty() {
        return;
    }
    let origin = TxnOrigin::of(txn);
    let _ = tx.send(Command::Notify(ChangeNotification {
        changes,
        is_remote: origin.is_remote(),
        origin,
    }));
}

// ───────────────────────────────────────────────────────────────────
// Classification
// ───────────────────────────────────────────────────────────────────

fn classify_navigation(txn: &TransactionMut, navigation: &ArrayRef, events: &Events) -> Vec<Change> {
    let mut changes = Vec::new();
    for event in events.iter() {
        let at = resolve_path(navigation, txn, &event.path());
        let located = |kind| Change {
            page_id: at.page_id.clone(),
            block_id: at.block_id.clone(),
            component_id: at.component_id.clone(),
            ..Change::new(kind)
        };

        match event {
            Event::Array(array) => {
                let (added, removed) = match (at.depth(), at.field.as_deref()) {
                    (0, _) => (ChangeKind::PageAdded, ChangeKind::PageRemoved),
                    (1, Some("blocks")) => (ChangeKind::BlockAdded, ChangeKind::BlockRemoved),
                    (2, Some("components")) => {
                        (ChangeKind::ComponentAdded, ChangeKind::ComponentRemoved)
                    }
                    _ => continue,
                };
                for delta in array.delta(txn) {
                    match delta {
                        ArrayDelta::Added(items) => {
                            for item in items {
                                let mut change = located(added);
                                let id = entity_id(txn, item);
                                match added {
                                    ChangeKind::PageAdded => change.page_id = id,
                                    ChangeKind::BlockAdded => change.block_id = id,
                                    _ => change.component_id = id,
                                }
                                changes.push(change);
                            }
                        }
                        ArrayDelta::Removed(_) => changes.push(located(removed)),
                        ArrayDelta::Retain(_) => {}
                    }
                }
            }
            Event::Map(map) => {
                let kind = match at.depth() {
                    1 => ChangeKind::PageUpdated,
                    2 => ChangeKind::BlockUpdated,
                    3 => ChangeKind::ComponentUpdated,
                    _ => continue,
                };
                let mut change = located(kind);
                change.fields = map.keys(txn).keys().map(|key| key.to_string()).collect();
                change.fields.sort();
                changes.push(change);
            }
            Event::Text(_) if at.depth() == 3 => {
                let mut change = located(ChangeKind::ComponentUpdated);
                change.fields = at.field.iter().cloned().collect();
                changes.push(change);
            }
            _ => {}
        }
    }
    changes
}

fn classify_root(txn: &TransactionMut, events: &Events, kind: ChangeKind) -> Vec<Change> {
    let mut fields: Vec<String> = events
        .iter()
        .filter_map(|event| match event {
            Event::Map(map) => Some(map.keys(txn).keys().map(|key| key.to_string()).collect::<Vec<_>>()),
            _ => None,
        })
        .flatten()
        .collect();
    if fields.is_empty() {
        return Vec::new();
    }
    fields.sort();
    fields.dedup();
    vec![Change {
        fields,
        ..Change::new(kind)
    }]
}

// ───────────────────────────────────────────────────────────────────
// Reconcile task
// ───────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Pending {
    reload: bool,
    navigation: bool,
}

impl Pending {
    fn any(&self) -> bool {
        self.reload || self.navigation
    }
}

async fn run(
    mut rx: mpsc::UnboundedReceiver<Command>,
    debounce: Duration,
    stats: Arc<AtomicReconcileStats>,
) {
    let mut renderer: Option<Box<dyn ViewRenderer>> = None;
    let mut pending = Pending::default();
    let mut deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(Command::Renderer(next)) => renderer = Some(next),
                Some(Command::Notify(notification)) => {
                    stats.notifications.fetch_add(1, Ordering::Relaxed);
                    if notification.is_remote {
                        stats.remote_notifications.fetch_add(1, Ordering::Relaxed);
                    }
                    let Some(view) = renderer.as_mut() else { continue };
                    view.on_change(&notification);
                    if notification.is_remote {
                        dispatch(view.as_mut(), &notification, &mut pending, &stats);
                        if pending.any() {
                            // Trailing edge: every burst pushes the deadline out.
                            deadline = Some(Instant::now() + debounce);
                        }
                    }
                }
                None => break,
            },
            _ = wait_until(deadline) => {
                deadline = None;
                if let Some(view) = renderer.as_mut() {
                    flush(view.as_mut(), &mut pending, &stats);
                }
            }
        }
    }

    if let Some(view) = renderer.as_mut() {
        flush(view.as_mut(), &mut pending, &stats);
    }
    log::debug!("Reconcile task stopped");
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn dispatch(
    view: &mut dyn ViewRenderer,
    notification: &ChangeNotification,
    pending: &mut Pending,
    stats: &AtomicReconcileStats,
) {
    let active = view.active_page();
    for change in &notification.changes {
        let on_active = active.is_some() && change.page_id == active;
        match change.kind {
            ChangeKind::ComponentAdded if on_active => {
                match (&change.page_id, &change.block_id, &change.component_id) {
                    (Some(page), Some(block), Some(component)) => {
                        view.render_component(page, block, component);
                        stats.renders.fetch_add(1, Ordering::Relaxed);
                    }
                    _ => pending.reload = true,
                }
            }
            ChangeKind::ComponentUpdated if on_active => {
                let patched = change
                    .component_id
                    .as_deref()
                    .is_some_and(|id| view.patch_component(id, &change.fields));
                if patched {
                    stats.patches.fetch_add(1, Ordering::Relaxed);
                } else {
                    pending.reload = true;
                }
            }
            ChangeKind::BlockUpdated if on_active => {
                let patched = change
                    .block_id
                    .as_deref()
                    .is_some_and(|id| view.patch_block(id, &change.fields));
                if patched {
                    stats.patches.fetch_add(1, Ordering::Relaxed);
                } else {
                    pending.reload = true;
                }
            }
            ChangeKind::ComponentRemoved | ChangeKind::BlockAdded | ChangeKind::BlockRemoved
                if on_active =>
            {
                pending.reload = true;
            }
            ChangeKind::PageAdded | ChangeKind::PageUpdated => pending.navigation = true,
            ChangeKind::PageRemoved => {
                pending.navigation = true;
                // Removed entries carry no id; the active page may be gone.
                pending.reload |= active.is_some();
            }
            _ => {}
        }
    }
}

fn flush(view: &mut dyn ViewRenderer, pending: &mut Pending, stats: &AtomicReconcileStats) {
    if std::mem::take(&mut pending.reload) {
        if let Some(page) = view.active_page() {
            view.reload_page(&page);
            stats.reloads.fetch_add(1, Ordering::Relaxed);
        }
    }
    if std::mem::take(&mut pending.navigation) {
        view.refresh_navigation();
        stats.navigation_refreshes.fetch_add(1, Ordering::Relaxed);
    }
}
