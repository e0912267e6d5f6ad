// src/core/session.rs
//
// One edit session per edited entity. All state lives in a single task so
// the buffer is only ever touched from one place; timers and in-flight
// requests are multiplexed with `select!`.

use chrono::{DateTime, Utc};
use futures::future::{self, BoxFuture, FutureExt};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use crate::core::buffer::LocalBuffer;
use crate::core::debounce::Debouncer;
use crate::core::entity::{apply_patch, coalesce, Entity, EntityKind, FieldPatch};
use crate::core::watcher::{TickOutcome, Watcher};
use crate::services::interface::{fetch_entity, update_entity, EntityStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    /// Quiet period before coalesced edits are sent.
    pub debounce: Duration,
    pub poll_interval: Duration,
    /// Maximum time to wait for provisioning. `None` polls forever.
    pub poll_timeout: Option<Duration>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(1000),
            poll_interval: Duration::from_millis(2000),
            poll_timeout: Some(Duration::from_secs(300)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SaveStatus {
    Idle,
    /// Edits buffered, waiting for the debounce window or a running save.
    Pending,
    Saving,
    Saved { at: DateTime<Utc> },
    Error { message: String },
}

impl SaveStatus {
    pub fn is_settled(&self) -> bool {
        matches!(self, SaveStatus::Saved { .. } | SaveStatus::Error { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Provisioning {
    Idle,
    Watching { token: String, ticks: u32 },
    Ready { token: String },
    Stalled { token: String },
}

impl Provisioning {
    pub fn is_finished(&self) -> bool {
        matches!(self, Provisioning::Ready { .. } | Provisioning::Stalled { .. })
    }
}

/// Snapshot published after every event the session handles.
#[derive(Debug, Clone)]
pub struct SessionState<E> {
    pub entity: E,
    pub save: SaveStatus,
    pub provisioning: Provisioning,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to load {kind} '{id}': {source}")]
    Load {
        kind: EntityKind,
        id: String,
        #[source]
        source: StoreError,
    },

    #[error("invalid edit: {0}")]
    InvalidEdit(#[from] serde_json::Error),

    #[error("session closed")]
    Closed,
}

enum Command<E> {
    Edit(FieldPatch),
    Commit(FieldPatch),
    Watch(String),
    ClearWatch,
    Switch(E),
}

/// Handle to a running edit session. Dropping it stops the session,
/// cancelling the debounce timer, the poll interval and any request in
/// flight.
pub struct EditSession<E: Entity> {
    commands: mpsc::UnboundedSender<Command<E>>,
    state: watch::Receiver<SessionState<E>>,
    task: JoinHandle<()>,
}

impl<E: Entity> EditSession<E> {
    /// Load `id` from the store and start a session seeded with it.
    pub async fn open(
        store: Arc<dyn EntityStore>,
        id: &str,
        options: SessionOptions,
    ) -> Result<Self, SessionError> {
        let seed = fetch_entity::<E>(store.as_ref(), id)
            .await
            .map_err(|source| SessionError::Load {
                kind: E::KIND,
                id: id.to_string(),
                source,
            })?;
        Ok(Self::start(store, seed, options))
    }

    /// Start a session from an entity the caller already holds.
    pub fn start(store: Arc<dyn EntityStore>, seed: E, options: SessionOptions) -> Self {
        let buffer = LocalBuffer::new(seed);
        let (state_tx, state_rx) = watch::channel(SessionState {
            entity: buffer.local().clone(),
            save: SaveStatus::Idle,
            provisioning: Provisioning::Idle,
        });
        let (commands, command_rx) = mpsc::unbounded_channel();

        let task = SessionTask {
            store,
            buffer,
            debouncer: Debouncer::new(options.debounce),
            watcher: Watcher::new(options.poll_interval, options.poll_timeout),
            save: SaveStatus::Idle,
            provisioning: Provisioning::Idle,
            queued: None,
            unsent: None,
            update_flight: None,
            poll_flight: None,
            state_tx,
        };

        Self {
            commands,
            state: state_rx,
            task: tokio::spawn(task.run(command_rx)),
        }
    }

    /// Debounced edit. Applied to the buffer immediately, sent once the
    /// debounce window passes without further edits.
    pub fn edit(&self, patch: FieldPatch) -> Result<(), SessionError> {
        self.validate(&patch)?;
        self.send(Command::Edit(patch))
    }

    /// Immediate edit. Folds in anything still waiting on the debounce
    /// window and sends without delay.
    pub fn commit(&self, patch: FieldPatch) -> Result<(), SessionError> {
        self.validate(&patch)?;
        self.send(Command::Commit(patch))
    }

    /// Poll `token` until it reports provisioning complete, replacing any
    /// current watch.
    pub fn watch(&self, token: impl Into<String>) -> Result<(), SessionError> {
        self.send(Command::Watch(token.into()))
    }

    pub fn clear_watch(&self) -> Result<(), SessionError> {
        self.send(Command::ClearWatch)
    }

    /// Point the session at a different entity. Pending edits and the
    /// current watch are dropped.
    pub fn switch(&self, entity: E) -> Result<(), SessionError> {
        self.send(Command::Switch(entity))
    }

    pub fn snapshot(&self) -> SessionState<E> {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState<E>> {
        self.state.clone()
    }

    /// Wait until a published snapshot satisfies `predicate`.
    pub async fn wait_until<F>(&self, mut predicate: F) -> Result<SessionState<E>, SessionError>
    where
        F: FnMut(&SessionState<E>) -> bool,
    {
        let mut rx = self.state.clone();
        let state = rx
            .wait_for(|s| predicate(s))
            .await
            .map_err(|_| SessionError::Closed)?;
        Ok(state.clone())
    }

    pub fn close(self) {}

    fn validate(&self, patch: &FieldPatch) -> Result<(), SessionError> {
        let editable = LocalBuffer::<E>::editable(patch);
        apply_patch(&self.state.borrow().entity, &editable)?;
        Ok(())
    }

    fn send(&self, command: Command<E>) -> Result<(), SessionError> {
        self.commands.send(command).map_err(|_| SessionError::Closed)
    }
}

impl<E: Entity> Drop for EditSession<E> {
    fn drop(&mut self) {
        self.task.abort();
    }
}

type InFlight<T> = Option<BoxFuture<'static, T>>;

struct SessionTask<E: Entity> {
    store: Arc<dyn EntityStore>,
    buffer: LocalBuffer<E>,
    debouncer: Debouncer,
    watcher: Watcher,
    save: SaveStatus,
    provisioning: Provisioning,
    /// Debounced changes waiting for the running update to finish.
    queued: Option<FieldPatch>,
    /// Patch of a failed update, resent with the next change.
    unsent: Option<FieldPatch>,
    update_flight: InFlight<(FieldPatch, Result<E, StoreError>)>,
    poll_flight: InFlight<(String, Result<E, StoreError>)>,
    state_tx: watch::Sender<SessionState<E>>,
}

async fn drive<T>(slot: &mut InFlight<T>) -> T {
    match slot.as_mut() {
        Some(fut) => fut.await,
        None => future::pending().await,
    }
}

impl<E: Entity> SessionTask<E> {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command<E>>) {
        debug!("Session for {} '{}' started", E::KIND, self.buffer.id());

        loop {
            let debounce_at = self.debouncer.deadline();
            let poll_at = self.watcher.due();
            let updating = self.update_flight.is_some();
            let polling = self.poll_flight.is_some();
            let now = Instant::now();

            // Commands first, so a switch or close is never preceded by a
            // tick for the old entity.
            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                (patch, result) = drive(&mut self.update_flight), if updating => {
                    self.update_flight = None;
                    self.finish_update(patch, result);
                }
                (token, result) = drive(&mut self.poll_flight), if polling => {
                    self.poll_flight = None;
                    self.finish_poll(token, result);
                }
                _ = time::sleep_until(debounce_at.unwrap_or(now)), if debounce_at.is_some() => {
                    if let Some(patch) = self.debouncer.take_due(Instant::now()) {
                        self.enqueue(patch);
                    }
                }
                _ = time::sleep_until(poll_at.unwrap_or(now)), if poll_at.is_some() => {
                    self.begin_poll();
                }
            }

            self.dispatch_queued();
            self.publish();
        }

        debug!("Session for {} '{}' closed", E::KIND, self.buffer.id());
    }

    fn handle(&mut self, command: Command<E>) {
        match command {
            Command::Edit(patch) => {
                if let Some(clean) = self.apply_local(&patch) {
                    self.debouncer.schedule(clean, Instant::now());
                    if self.save != SaveStatus::Saving {
                        self.save = SaveStatus::Pending;
                    }
                }
            }
            Command::Commit(patch) => {
                if let Some(clean) = self.apply_local(&patch) {
                    let mut merged = self.debouncer.take().unwrap_or_default();
                    coalesce(&mut merged, clean);
                    self.enqueue(merged);
                }
            }
            Command::Watch(token) => self.start_watch(token),
            Command::ClearWatch => {
                self.watcher.clear();
                self.poll_flight = None;
                self.provisioning = Provisioning::Idle;
            }
            Command::Switch(entity) => {
                info!(
                    "Session switching {} '{}' -> '{}'",
                    E::KIND,
                    self.buffer.id(),
                    entity.id()
                );
                self.debouncer.take();
                self.queued = None;
                self.unsent = None;
                self.update_flight = None;
                self.watcher.clear();
                self.poll_flight = None;
                self.buffer.reseed(entity);
                self.save = SaveStatus::Idle;
                self.provisioning = Provisioning::Idle;
            }
        }
    }

    fn apply_local(&mut self, patch: &FieldPatch) -> Option<FieldPatch> {
        match self.buffer.apply(patch) {
            Ok(clean) if clean.is_empty() => None,
            Ok(clean) => Some(clean),
            Err(e) => {
                warn!("Ignoring edit to {} '{}': {}", E::KIND, self.buffer.id(), e);
                None
            }
        }
    }

    fn enqueue(&mut self, patch: FieldPatch) {
        let mut next = self.unsent.take().unwrap_or_default();
        if let Some(queued) = self.queued.take() {
            coalesce(&mut next, queued);
        }
        coalesce(&mut next, patch);
        self.queued = Some(next);
        if self.update_flight.is_some() {
            debug!("Update for {} '{}' in flight, queueing", E::KIND, self.buffer.id());
        }
    }

    fn dispatch_queued(&mut self) {
        if self.update_flight.is_some() {
            return;
        }
        if let Some(patch) = self.queued.take() {
            let store = Arc::clone(&self.store);
            let id = self.buffer.id().to_string();
            debug!("Committing {} field(s) to {} '{}'", patch.len(), E::KIND, id);

            self.save = SaveStatus::Saving;
            self.update_flight = Some(
                async move {
                    let result = update_entity::<E>(store.as_ref(), &id, &patch).await;
                    (patch, result)
                }
                .boxed(),
            );
        }
    }

    fn finish_update(&mut self, patch: FieldPatch, result: Result<E, StoreError>) {
        match result {
            Ok(entity) => {
                self.save = SaveStatus::Saved { at: Utc::now() };
                let token = self.buffer.local().provisioning_token(&patch);
                self.reconcile(entity);
                if let Some(token) = token {
                    self.start_watch(token);
                }
            }
            Err(e) => {
                // The optimistic value stays and the patch rides along with
                // the next change.
                warn!("Saving {} '{}' failed: {}", E::KIND, self.buffer.id(), e);
                self.save = SaveStatus::Error {
                    message: e.to_string(),
                };
                self.unsent = Some(patch);
                if let Some(queued) = self.queued.take() {
                    self.enqueue(queued);
                }
            }
        }

        let more = self.queued.is_some() || self.debouncer.is_armed();
        if more && matches!(self.save, SaveStatus::Saved { .. }) {
            self.save = SaveStatus::Pending;
        }
    }

    fn start_watch(&mut self, token: String) {
        self.poll_flight = None;
        self.watcher.start(token.clone(), Instant::now());
        self.provisioning = Provisioning::Watching { token, ticks: 0 };
    }

    fn begin_poll(&mut self) {
        if let Some(token) = self.watcher.begin_tick() {
            let store = Arc::clone(&self.store);
            self.poll_flight = Some(
                async move {
                    let result = fetch_entity::<E>(store.as_ref(), &token).await;
                    (token, result)
                }
                .boxed(),
            );
        }
    }

    fn finish_poll(&mut self, token: String, result: Result<E, StoreError>) {
        match self.watcher.observe(&token, result, Instant::now()) {
            TickOutcome::Ready(entity) => {
                self.reconcile(entity);
                self.provisioning = Provisioning::Ready { token };
            }
            TickOutcome::Pending(entity) => {
                self.reconcile(entity);
                self.provisioning = Provisioning::Watching {
                    token,
                    ticks: self.watcher.ticks(),
                };
            }
            TickOutcome::Inconclusive => {
                self.provisioning = Provisioning::Watching {
                    token,
                    ticks: self.watcher.ticks(),
                };
            }
            TickOutcome::Stale => {}
            TickOutcome::Stalled { token } => {
                self.provisioning = Provisioning::Stalled { token };
            }
        }
    }

    /// Merge a server read, ignoring reads of other entities so a watch on
    /// a foreign token never leaks into this buffer.
    fn reconcile(&mut self, entity: E) {
        if entity.id() == self.buffer.id() {
            self.buffer.reconcile(entity);
        } else {
            debug!(
                "Not merging {} '{}' into session for '{}'",
                E::KIND,
                entity.id(),
                self.buffer.id()
            );
        }
    }

    fn publish(&self) {
        self.state_tx.send_replace(SessionState {
            entity: self.buffer.local().clone(),
            save: self.save.clone(),
            provisioning: self.provisioning.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::entity::{Agent, ModelProvider};
    use crate::services::memory::{MemoryStore, StoreCall};
    use serde_json::{json, Value};
    use tokio::time::sleep;

    fn patch(v: Value) -> FieldPatch {
        v.as_object().cloned().unwrap()
    }

    fn agent(id: &str) -> Agent {
        Agent {
            id: id.into(),
            name: "Support".into(),
            ..Default::default()
        }
    }

    fn options() -> SessionOptions {
        SessionOptions {
            debounce: Duration::from_millis(1000),
            poll_interval: Duration::from_millis(2000),
            poll_timeout: None,
        }
    }

    fn store_with(agents: &[&str]) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        for id in agents {
            store.insert(&agent(id)).unwrap();
        }
        store
    }

    #[tokio::test(start_paused = true)]
    async fn test_edits_coalesce_into_one_update() {
        let store = store_with(&["agent-42"]);
        let session = EditSession::start(store.clone(), agent("agent-42"), options());

        session.edit(patch(json!({"name": "one"}))).unwrap();
        sleep(Duration::from_millis(300)).await;
        session
            .edit(patch(json!({"name": "two", "description": "three"})))
            .unwrap();

        sleep(Duration::from_millis(900)).await;
        assert!(store.updates().is_empty());
        let state = session.snapshot();
        assert_eq!(state.entity.name, "two");
        assert_eq!(state.save, SaveStatus::Pending);

        sleep(Duration::from_millis(200)).await;
        let updates = store.updates();
        assert_eq!(updates.len(), 1);
        assert_eq!(
            Value::Object(updates[0].1.clone()),
            json!({"name": "two", "description": "three"})
        );

        let state = session.wait_until(|s| s.save.is_settled()).await.unwrap();
        assert!(matches!(state.save, SaveStatus::Saved { .. }));
        assert_eq!(state.provisioning, Provisioning::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_alias_publication_scenario() {
        let store = store_with(&["agent-42"]);
        let session = EditSession::<Agent>::open(store.clone(), "agent-42", options())
            .await
            .unwrap();
        store.provision_after(
            EntityKind::Agent,
            "agent-42",
            3,
            patch(json!({"aliasAssigned": true})),
        );

        session.edit(patch(json!({"alias": "acme-bot"}))).unwrap();
        sleep(Duration::from_millis(1100)).await;
        assert_eq!(
            store.updates(),
            vec![("agent-42".to_string(), patch(json!({"alias": "acme-bot"})))]
        );

        sleep(Duration::from_millis(2500)).await;
        let state = session.snapshot();
        assert!(!state.entity.alias_assigned);
        assert_eq!(
            state.provisioning,
            Provisioning::Watching {
                token: "agent-42".into(),
                ticks: 2
            }
        );

        let state = session
            .wait_until(|s| s.provisioning.is_finished())
            .await
            .unwrap();
        assert_eq!(
            state.provisioning,
            Provisioning::Ready {
                token: "agent-42".into()
            }
        );
        assert!(state.entity.alias_assigned);
        assert_eq!(state.entity.alias, "acme-bot");

        // open() read once, then three poll ticks.
        assert_eq!(store.fetches("agent-42"), 4);
        sleep(Duration::from_secs(20)).await;
        assert_eq!(store.fetches("agent-42"), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_new_watch_stops_polling_old_token() {
        let store = store_with(&["agent-42", "agent-a", "agent-b"]);
        let session = EditSession::start(store.clone(), agent("agent-42"), options());

        session.watch("agent-a").unwrap();
        sleep(Duration::from_millis(3000)).await;
        let polled_a = store.fetches("agent-a");
        assert_eq!(polled_a, 2);

        session.watch("agent-b").unwrap();
        sleep(Duration::from_secs(10)).await;
        assert_eq!(store.fetches("agent-a"), polled_a);
        assert!(store.fetches("agent-b") >= 5);
        assert_eq!(session.snapshot().entity.id, "agent-42");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_update_keeps_optimistic_value() {
        let store = store_with(&["agent-42"]);
        store.fail_next_updates(1);
        let session = EditSession::start(store.clone(), agent("agent-42"), options());

        session.edit(patch(json!({"name": "Helpdesk"}))).unwrap();
        let state = session.wait_until(|s| s.save.is_settled()).await.unwrap();
        assert!(matches!(state.save, SaveStatus::Error { .. }));
        assert_eq!(state.entity.name, "Helpdesk");
        assert_eq!(store.get::<Agent>("agent-42").unwrap().name, "Support");

        // No retry until the user edits again.
        sleep(Duration::from_secs(10)).await;
        assert_eq!(store.updates().len(), 1);

        session.edit(patch(json!({"name": "Helpdesk"}))).unwrap();
        sleep(Duration::from_millis(1100)).await;
        let state = session.wait_until(|s| s.save.is_settled()).await.unwrap();
        assert!(matches!(state.save, SaveStatus::Saved { .. }));
        assert_eq!(store.get::<Agent>("agent-42").unwrap().name, "Helpdesk");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_patch_is_resent_with_next_edit() {
        let store = store_with(&["agent-42"]);
        store.fail_next_updates(1);
        let session = EditSession::start(store.clone(), agent("agent-42"), options());

        session.edit(patch(json!({"name": "Helpdesk"}))).unwrap();
        let state = session.wait_until(|s| s.save.is_settled()).await.unwrap();
        assert!(matches!(state.save, SaveStatus::Error { .. }));

        session
            .edit(patch(json!({"description": "Answers tickets"})))
            .unwrap();
        let state = session
            .wait_until(|s| matches!(s.save, SaveStatus::Saved { .. }))
            .await
            .unwrap();

        let updates = store.updates();
        assert_eq!(updates.len(), 2);
        assert_eq!(
            Value::Object(updates[1].1.clone()),
            json!({"name": "Helpdesk", "description": "Answers tickets"})
        );
        let server = store.get::<Agent>("agent-42").unwrap();
        assert_eq!(server.name, "Helpdesk");
        assert_eq!(server.description.as_deref(), Some("Answers tickets"));
        assert_eq!(state.entity.name, server.name);
    }

    #[tokio::test(start_paused = true)]
    async fn test_edit_cannot_change_identifier() {
        let store = store_with(&["agent-42", "agent-7"]);
        let session = EditSession::start(store.clone(), agent("agent-42"), options());

        session
            .edit(patch(json!({"id": "agent-7", "name": "Helpdesk"})))
            .unwrap();
        let state = session.wait_until(|s| s.save.is_settled()).await.unwrap();
        assert_eq!(state.entity.id, "agent-42");
        assert_eq!(
            store.updates(),
            vec![("agent-42".to_string(), patch(json!({"name": "Helpdesk"})))]
        );

        session.edit(patch(json!({"id": "agent-7"}))).unwrap();
        sleep(Duration::from_secs(5)).await;
        assert_eq!(store.updates().len(), 1);
        assert_eq!(session.snapshot().entity.id, "agent-42");
        assert_eq!(store.get::<Agent>("agent-7").unwrap().name, "Support");
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_poll_is_retried() {
        let store = store_with(&["agent-42"]);
        store.provision_after(
            EntityKind::Agent,
            "agent-42",
            1,
            patch(json!({"aliasAssigned": true})),
        );
        let session = EditSession::start(store.clone(), agent("agent-42"), options());

        session.commit(patch(json!({"alias": "acme-bot"}))).unwrap();
        // update succeeds, then the first tick fails.
        store.fail_next_fetches(1);

        let state = session
            .wait_until(|s| s.provisioning.is_finished())
            .await
            .unwrap();
        assert!(state.entity.alias_assigned);
        assert_eq!(store.fetches("agent-42"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_provisioning_times_out() {
        let store = store_with(&["agent-42"]);
        let opts = SessionOptions {
            poll_timeout: Some(Duration::from_secs(10)),
            ..options()
        };
        let session = EditSession::start(store.clone(), agent("agent-42"), opts);

        session.commit(patch(json!({"alias": "acme-bot"}))).unwrap();
        let state = session
            .wait_until(|s| s.provisioning.is_finished())
            .await
            .unwrap();
        assert_eq!(
            state.provisioning,
            Provisioning::Stalled {
                token: "agent-42".into()
            }
        );
        assert!(!state.entity.alias_assigned);

        let polled = store.fetches("agent-42");
        sleep(Duration::from_secs(30)).await;
        assert_eq!(store.fetches("agent-42"), polled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_commit_folds_pending_edits_and_skips_debounce() {
        let store = store_with(&["agent-42"]);
        let session = EditSession::start(store.clone(), agent("agent-42"), options());

        session.edit(patch(json!({"name": "Helpdesk"}))).unwrap();
        session.commit(patch(json!({"alias": ""}))).unwrap();
        sleep(Duration::from_millis(10)).await;

        assert_eq!(
            store.updates(),
            vec![(
                "agent-42".to_string(),
                patch(json!({"name": "Helpdesk", "alias": ""}))
            )]
        );
        // Empty alias does not start provisioning.
        sleep(Duration::from_secs(5)).await;
        assert_eq!(session.snapshot().provisioning, Provisioning::Idle);
        assert_eq!(store.fetches("agent-42"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_session_cancels_timers() {
        let store = store_with(&["agent-42"]);
        let session = EditSession::start(store.clone(), agent("agent-42"), options());
        session.watch("agent-42").unwrap();
        session.edit(patch(json!({"name": "Helpdesk"}))).unwrap();
        sleep(Duration::from_millis(100)).await;
        let calls = store.calls().len();

        drop(session);
        sleep(Duration::from_secs(30)).await;
        assert_eq!(store.calls().len(), calls);
        assert!(store.updates().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_switch_discards_pending_state() {
        let store = store_with(&["agent-42", "agent-7"]);
        let session = EditSession::start(store.clone(), agent("agent-42"), options());

        session.edit(patch(json!({"name": "Helpdesk"}))).unwrap();
        session.watch("agent-42").unwrap();
        session.switch(agent("agent-7")).unwrap();
        sleep(Duration::from_secs(5)).await;

        let state = session.snapshot();
        assert_eq!(state.entity.id, "agent-7");
        assert_eq!(state.entity.name, "Support");
        assert_eq!(state.save, SaveStatus::Idle);
        assert!(store.updates().is_empty());
        assert!(store
            .calls()
            .iter()
            .all(|c| !matches!(c, StoreCall::Fetch { id, .. } if id == "agent-42")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_model_provider_configuration_waits_for_models() {
        let store = Arc::new(MemoryStore::new());
        let provider = ModelProvider {
            id: "openai".into(),
            name: "OpenAI".into(),
            required_configuration_parameters: vec!["apiKey".into()],
            ..Default::default()
        };
        store.insert(&provider).unwrap();
        store.provision_after(
            EntityKind::ModelProvider,
            "openai",
            2,
            patch(json!({"configured": true, "modelsBackPopulated": true})),
        );

        let session = EditSession::start(store.clone(), provider, options());
        session
            .commit(patch(json!({"config": {"apiKey": "sk-test"}})))
            .unwrap();
        let state = session
            .wait_until(|s| s.provisioning.is_finished())
            .await
            .unwrap();

        assert!(state.entity.configured);
        assert!(state.entity.models_back_populated);
        assert_eq!(state.entity.config["apiKey"], "sk-test");
    }

    #[tokio::test]
    async fn test_invalid_edit_is_rejected_up_front() {
        let store = store_with(&["agent-42"]);
        let session = EditSession::start(store.clone(), agent("agent-42"), options());

        let err = session.edit(patch(json!({"tools": "web"}))).unwrap_err();
        assert!(matches!(err, SessionError::InvalidEdit(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_derived_fields_do_not_fail_validation() {
        let store = store_with(&["agent-42"]);
        let session = EditSession::start(store.clone(), agent("agent-42"), options());

        session
            .edit(patch(json!({"name": "Helpdesk", "aliasAssigned": "yes"})))
            .unwrap();
        let state = session.wait_until(|s| s.save.is_settled()).await.unwrap();
        assert_eq!(state.entity.name, "Helpdesk");
        assert!(!state.entity.alias_assigned);
        assert_eq!(
            store.updates(),
            vec![("agent-42".to_string(), patch(json!({"name": "Helpdesk"})))]
        );
    }

    #[tokio::test]
    async fn test_open_missing_entity_fails() {
        let store = store_with(&[]);
        let err = EditSession::<Agent>::open(store, "ghost", options())
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            SessionError::Load {
                source: StoreError::NotFound { .. },
                ..
            }
        ));
    }
}
