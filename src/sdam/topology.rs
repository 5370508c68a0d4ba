//! The live topology: monitored servers, their pools, and server selection.
//!
//! `Topology` is a cheaply cloneable handle. It owns one [`Server`] and one [`Monitor`]
//! per monitored address and keeps an immutable [`TopologyDescription`] snapshot that
//! monitors replace as heartbeats come in. Snapshots are published through a watch
//! channel so that blocked server selection wakes up exactly when the view changes.

use std::{
    collections::HashMap,
    sync::{Arc, Weak},
    time::Duration,
};

use futures_core::future::BoxFuture;
use futures_util::FutureExt;
use tokio::{
    sync::{watch, RwLock},
    time::Instant,
};

use super::{
    description::server::ServerDescription,
    description::topology::TopologyDescription,
    monitor::Monitor,
    server::Server,
};
use crate::{
    bson::Document,
    client::session::{pool::ServerSessionPool, ClientSession},
    cmap::{conn::command::Command, options::ConnectionPoolOptions},
    error::{Error, ErrorKind, Result},
    event::{
        sdam::{
            ServerClosedEvent,
            ServerDescriptionChangedEvent,
            ServerOpeningEvent,
            TopologyClosedEvent,
            TopologyDescriptionChangedEvent,
            TopologyOpeningEvent,
        },
        SdamEventHandlerRef,
    },
    options::{ClientOptions, Namespace, ServerAddress},
    results::{DeleteResult, InsertManyResult, UpdateResult},
    selection_criteria::{ReadPreference, SelectionCriteria},
};

pub(crate) const DEFAULT_SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(30);

/// A handle to the set of monitored servers. Clones share state.
#[derive(Clone, Debug)]
pub struct Topology {
    inner: Arc<TopologyInner>,
}

/// A reference that does not keep the topology's monitors alive.
#[derive(Clone, Debug)]
pub(crate) struct WeakTopology {
    inner: Weak<TopologyInner>,
}

impl WeakTopology {
    pub(crate) fn upgrade(&self) -> Option<Topology> {
        self.inner.upgrade().map(|inner| Topology { inner })
    }

    /// A reference that never upgrades.
    #[cfg(test)]
    pub(crate) fn empty() -> Self {
        Self { inner: Weak::new() }
    }
}

#[derive(Debug)]
struct TopologyInner {
    options: ClientOptions,
    pool_options: ConnectionPoolOptions,
    state: RwLock<TopologyState>,
    /// Publishes a snapshot after every applied update.
    watcher: watch::Sender<Arc<TopologyDescription>>,
    receiver: watch::Receiver<Arc<TopologyDescription>>,
    /// Flipped to true once, on shutdown.
    shutdown: watch::Sender<bool>,
    /// Touched to ask every monitor for an immediate check.
    check_requester: watch::Sender<()>,
    session_pool: Arc<ServerSessionPool>,
    event_handler: Option<SdamEventHandlerRef>,
}

#[derive(Debug)]
struct TopologyState {
    description: TopologyDescription,
    servers: HashMap<ServerAddress, Arc<Server>>,
    closed: bool,
}

impl Topology {
    /// Creates the topology from seed addresses and starts a monitor per server.
    pub fn new(options: ClientOptions) -> Result<Self> {
        let topology = Self::new_unmonitored(options)?;
        topology.spawn_monitors_for_known_servers();
        Ok(topology)
    }

    /// Builds the topology without starting any monitors. Descriptions only change
    /// through explicit `update` calls; tests drive it this way.
    pub(crate) fn new_unmonitored(options: ClientOptions) -> Result<Self> {
        let description = TopologyDescription::new(&options)?;
        let pool_options = ConnectionPoolOptions::from_client_options(&options)?;
        let event_handler = options.sdam_event_handler.clone();

        let servers = description
            .server_addresses()
            .map(|address| {
                (
                    address.clone(),
                    Server::new(address.clone(), pool_options.clone()),
                )
            })
            .collect::<HashMap<_, _>>();

        let (watcher, receiver) = watch::channel(Arc::new(description.clone()));
        let (shutdown, _) = watch::channel(false);
        let (check_requester, _) = watch::channel(());

        let topology = Self {
            inner: Arc::new(TopologyInner {
                options,
                pool_options,
                state: RwLock::new(TopologyState {
                    description,
                    servers,
                    closed: false,
                }),
                watcher,
                receiver,
                shutdown,
                check_requester,
                session_pool: Arc::new(ServerSessionPool::new()),
                event_handler,
            }),
        };

        topology.emit(|handler| handler.handle_topology_opening_event(TopologyOpeningEvent {}));
        for address in topology
            .inner
            .receiver
            .borrow()
            .server_addresses()
            .cloned()
            .collect::<Vec<_>>()
        {
            topology.emit(|handler| {
                handler.handle_server_opening_event(ServerOpeningEvent { address: address.clone() })
            });
        }
        Ok(topology)
    }

    fn spawn_monitors_for_known_servers(&self) {
        let addresses: Vec<ServerAddress> = self
            .inner
            .receiver
            .borrow()
            .server_addresses()
            .cloned()
            .collect();
        for address in addresses {
            self.spawn_monitor(address);
        }
    }

    fn spawn_monitor(&self, address: ServerAddress) {
        Monitor::start(
            address,
            self.downgrade(),
            &self.inner.options,
            self.inner.shutdown.subscribe(),
            self.inner.check_requester.subscribe(),
        );
    }

    pub(crate) fn downgrade(&self) -> WeakTopology {
        WeakTopology {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// The current immutable description snapshot.
    pub fn description(&self) -> Arc<TopologyDescription> {
        self.inner.receiver.borrow().clone()
    }

    /// Whether the given address is still monitored. Monitors exit when their server is
    /// removed from the topology.
    pub(crate) fn is_monitoring(&self, address: &ServerAddress) -> bool {
        self.inner.receiver.borrow().get_server(address).is_some()
    }

    /// Selects a server matching the criteria, waiting for topology updates until one
    /// becomes available or the selection timeout elapses.
    pub async fn select_server(&self, criteria: &SelectionCriteria) -> Result<Arc<Server>> {
        let timeout = self
            .inner
            .options
            .server_selection_timeout
            .unwrap_or(DEFAULT_SERVER_SELECTION_TIMEOUT);
        let deadline = Instant::now() + timeout;
        let mut receiver = self.inner.receiver.clone();

        loop {
            let selected = {
                let state = self.inner.state.read().await;
                if state.closed {
                    return Err(Error::invalid_state("the topology has been shut down"));
                }
                state
                    .description
                    .select_server(criteria)?
                    .and_then(|description| state.servers.get(&description.address))
                    .cloned()
            };
            if let Some(server) = selected {
                return Ok(server);
            }

            // Nothing suitable yet. Nudge the monitors and wait for the view to change.
            let _ = self.inner.check_requester.send(());

            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(remaining) if !remaining.is_zero() => remaining,
                _ => return Err(self.selection_timeout_error(criteria, timeout).await),
            };
            match tokio::time::timeout(remaining, receiver.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => {
                    return Err(Error::invalid_state("the topology has been shut down"))
                }
                Err(_) => return Err(self.selection_timeout_error(criteria, timeout).await),
            }
        }
    }

    async fn selection_timeout_error(
        &self,
        criteria: &SelectionCriteria,
        timeout: Duration,
    ) -> Error {
        let state = self.inner.state.read().await;
        ErrorKind::ServerSelection {
            message: format!(
                "no server satisfying {:?} found in {:?} after {:?}, topology: {}",
                criteria,
                state.description.topology_type,
                timeout,
                state
                    .description
                    .server_addresses()
                    .map(|address| address.to_string())
                    .collect::<Vec<_>>()
                    .join(", "),
            ),
        }
        .into()
    }

    /// Applies a freshly observed server description, reconciling the `Server` map with
    /// the resulting topology and publishing the new snapshot. Returns whether anything
    /// changed.
    pub(crate) async fn update(&self, new_description: ServerDescription) -> bool {
        let mut state = self.inner.state.write().await;
        if state.closed {
            return false;
        }
        // Stale update from a server that has since been removed.
        if state.description.get_server(&new_description.address).is_none() {
            return false;
        }
        if !state.description.is_changed(&new_description) {
            return false;
        }

        let previous_topology = state.description.clone();
        let previous_server = previous_topology
            .get_server(&new_description.address)
            .cloned();
        let address = new_description.address.clone();

        if state.description.update(new_description.clone()).is_err() {
            return false;
        }

        self.sync_servers(&mut state).await;

        if let Some(server) = state.servers.get(&address) {
            server.update_description(new_description.clone());
        }

        if let Some(previous_server) = previous_server {
            self.emit(|handler| {
                handler.handle_server_description_changed_event(ServerDescriptionChangedEvent {
                    address: address.clone(),
                    previous_description: previous_server.clone(),
                    new_description: new_description.clone(),
                })
            });
        }
        self.emit(|handler| {
            handler.handle_topology_description_changed_event(TopologyDescriptionChangedEvent {
                previous_description: previous_topology.clone(),
                new_description: state.description.clone(),
            })
        });

        let _ = self.inner.watcher.send(Arc::new(state.description.clone()));
        true
    }

    /// Adds `Server` instances for addresses the description gained and retires the ones
    /// it lost.
    async fn sync_servers(&self, state: &mut TopologyState) {
        let mut added = Vec::new();
        for address in state.description.server_addresses() {
            if !state.servers.contains_key(address) {
                added.push(address.clone());
            }
        }
        for address in added {
            state.servers.insert(
                address.clone(),
                Server::new(address.clone(), self.inner.pool_options.clone()),
            );
            self.emit(|handler| {
                handler.handle_server_opening_event(ServerOpeningEvent { address: address.clone() })
            });
            self.spawn_monitor(address);
        }

        let removed: Vec<ServerAddress> = state
            .servers
            .keys()
            .filter(|address| state.description.get_server(address).is_none())
            .cloned()
            .collect();
        for address in removed {
            if let Some(server) = state.servers.remove(&address) {
                server.close().await;
            }
            self.emit(|handler| {
                handler.handle_server_closed_event(ServerClosedEvent { address: address.clone() })
            });
        }
    }

    /// Reacts to an error that an operation observed on a server: network errors and
    /// state-change errors mark the server unknown so the monitors re-check it, and
    /// network or shutdown errors additionally invalidate its pooled connections.
    pub(crate) async fn handle_application_error(&self, error: &Error, server: &Server) {
        if error.is_network_error() {
            let marked = self
                .update(ServerDescription::new_from_error(
                    server.address().clone(),
                    error.clone(),
                ))
                .await;
            if marked {
                server.clear_pool().await;
            }
        } else if error.is_not_primary() || error.is_recovering() {
            self.update(ServerDescription::new_from_error(
                server.address().clone(),
                error.clone(),
            ))
            .await;
            if error.is_shutting_down() {
                server.clear_pool().await;
            }
            let _ = self.inner.check_requester.send(());
        }
    }

    /// Runs a generic database command against a server matching the criteria (falling
    /// back to the criteria configured on the client, then to the primary) and returns
    /// its response document. Command-level failures surface as errors.
    pub async fn run_command(
        &self,
        db: &str,
        body: Document,
        criteria: Option<&SelectionCriteria>,
        session: Option<&mut ClientSession>,
    ) -> Result<Document> {
        let name = match body.keys().next() {
            Some(name) => name.clone(),
            None => return Err(Error::invalid_argument("an empty document is not a command")),
        };

        let default = SelectionCriteria::ReadPreference(ReadPreference::Primary);
        let criteria = criteria
            .or(self.inner.options.selection_criteria.as_ref())
            .unwrap_or(&default);
        let server = self.select_server(criteria).await?;

        let mut command = Command::new(name, db, body);
        if let Some(read_pref) = criteria.as_read_pref() {
            if read_pref.allows_secondary() {
                command.set_read_preference(read_pref);
            }
        }
        let response = match session {
            Some(session) => server.run_command_with_session(command, session).await,
            None => server.run_command(command).await,
        };
        match response {
            Ok(response) => response.document(),
            Err(error) => {
                self.handle_application_error(&error, &server).await;
                Err(error)
            }
        }
    }

    /// Starts a session against this topology, drawing the server-side session from the
    /// shared pool.
    pub fn start_session(&self) -> ClientSession {
        let logical_session_timeout = self.description().logical_session_timeout();
        ClientSession::new(
            self.clone(),
            Arc::clone(&self.inner.session_pool),
            logical_session_timeout,
        )
    }

    /// Inserts documents on the primary as a retryable write.
    pub async fn insert_documents(
        &self,
        ns: &Namespace,
        documents: Vec<Document>,
        ordered: bool,
        session: &mut ClientSession,
    ) -> Result<InsertManyResult> {
        self.execute_retryable_write(
            session,
            &InsertOperation {
                ns: ns.clone(),
                documents,
                ordered,
            },
        )
        .await
    }

    /// Updates documents on the primary as a retryable write. Multi-document updates are
    /// not retryable and run as a single attempt.
    pub async fn update_documents(
        &self,
        ns: &Namespace,
        filter: Document,
        update: Document,
        upsert: bool,
        multi: bool,
        session: &mut ClientSession,
    ) -> Result<UpdateResult> {
        let operation = UpdateOperation {
            ns: ns.clone(),
            filter,
            update,
            upsert,
            multi,
        };
        if multi {
            let server = self.select_primary().await?;
            return operation.execute(server, session, None).await;
        }
        self.execute_retryable_write(session, &operation).await
    }

    /// Deletes documents on the primary. Single deletes are retryable, multi deletes are
    /// not.
    pub async fn delete_documents(
        &self,
        ns: &Namespace,
        filter: Document,
        multi: bool,
        session: &mut ClientSession,
    ) -> Result<DeleteResult> {
        let operation = DeleteOperation {
            ns: ns.clone(),
            filter,
            multi,
        };
        if multi {
            let server = self.select_primary().await?;
            return operation.execute(server, session, None).await;
        }
        self.execute_retryable_write(session, &operation).await
    }

    async fn select_primary(&self) -> Result<Arc<Server>> {
        self.select_server(&SelectionCriteria::ReadPreference(ReadPreference::Primary))
            .await
    }

    /// Runs a write with retryable-write semantics: the transaction number is drawn once,
    /// and on a retryable failure the write is re-sent exactly once, with the same
    /// number, to a freshly selected server.
    pub(crate) async fn execute_retryable_write<O: RetryableWriteOperation>(
        &self,
        session: &mut ClientSession,
        operation: &O,
    ) -> Result<O::Output> {
        let server = self.select_primary().await?;

        if session.is_in_transaction() || self.inner.options.retry_writes == Some(false) {
            return operation.execute(server, session, None).await;
        }

        let txn_number = session.next_txn_number();
        match operation.execute(server.clone(), session, Some(txn_number)).await {
            Ok(result) => Ok(result),
            Err(error) if error.is_write_retryable() => {
                self.handle_application_error(&error, &server).await;
                let server = self.select_primary().await?;
                operation.execute(server, session, Some(txn_number)).await
            }
            Err(error) => Err(error),
        }
    }

    /// Shuts the topology down: monitors stop, pools close, and the session pool is
    /// dropped. Idempotent.
    pub async fn shutdown(&self) {
        let mut state = self.inner.state.write().await;
        if state.closed {
            return;
        }
        state.closed = true;

        let _ = self.inner.shutdown.send(true);
        for server in state.servers.values() {
            server.close().await;
        }
        state.servers.clear();

        // Wake any selection blocked on the watch channel so it observes the closed flag.
        let _ = self.inner.watcher.send(Arc::new(state.description.clone()));

        self.emit(|handler| handler.handle_topology_closed_event(TopologyClosedEvent {}));
    }

    fn emit<F>(&self, emit: F)
    where
        F: FnOnce(&dyn crate::event::sdam::SdamEventHandler),
    {
        if let Some(handler) = &self.inner.event_handler {
            emit(handler.0.as_ref());
        }
    }
}

/// A write that can be re-sent with the same transaction number.
pub(crate) trait RetryableWriteOperation {
    type Output;

    fn execute<'a>(
        &'a self,
        server: Arc<Server>,
        session: &'a mut ClientSession,
        txn_number: Option<i64>,
    ) -> BoxFuture<'a, Result<Self::Output>>;
}

struct InsertOperation {
    ns: Namespace,
    documents: Vec<Document>,
    ordered: bool,
}

impl RetryableWriteOperation for InsertOperation {
    type Output = InsertManyResult;

    fn execute<'a>(
        &'a self,
        server: Arc<Server>,
        session: &'a mut ClientSession,
        txn_number: Option<i64>,
    ) -> BoxFuture<'a, Result<InsertManyResult>> {
        async move {
            server
                .insert(
                    &self.ns,
                    self.documents.clone(),
                    self.ordered,
                    Some(session),
                    txn_number,
                )
                .await
        }
        .boxed()
    }
}

struct UpdateOperation {
    ns: Namespace,
    filter: Document,
    update: Document,
    upsert: bool,
    multi: bool,
}

impl RetryableWriteOperation for UpdateOperation {
    type Output = UpdateResult;

    fn execute<'a>(
        &'a self,
        server: Arc<Server>,
        session: &'a mut ClientSession,
        txn_number: Option<i64>,
    ) -> BoxFuture<'a, Result<UpdateResult>> {
        async move {
            server
                .update(
                    &self.ns,
                    self.filter.clone(),
                    self.update.clone(),
                    self.upsert,
                    self.multi,
                    Some(session),
                    txn_number,
                )
                .await
        }
        .boxed()
    }
}

struct DeleteOperation {
    ns: Namespace,
    filter: Document,
    multi: bool,
}

impl RetryableWriteOperation for DeleteOperation {
    type Output = DeleteResult;

    fn execute<'a>(
        &'a self,
        server: Arc<Server>,
        session: &'a mut ClientSession,
        txn_number: Option<i64>,
    ) -> BoxFuture<'a, Result<DeleteResult>> {
        async move {
            server
                .delete(
                    &self.ns,
                    self.filter.clone(),
                    self.multi,
                    Some(session),
                    txn_number,
                )
                .await
        }
        .boxed()
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::{
        hello::{HelloCommandResponse, HelloReply},
        sdam::{ServerType, TopologyType},
    };

    fn address(s: &str) -> ServerAddress {
        ServerAddress::parse(s).unwrap()
    }

    fn options(hosts: &[&str]) -> ClientOptions {
        ClientOptions::builder()
            .hosts(hosts.iter().map(|host| address(host)).collect::<Vec<_>>())
            .server_selection_timeout(Some(Duration::from_millis(50)))
            .build()
    }

    fn primary_description(me: &str, hosts: &[&str]) -> ServerDescription {
        let response = HelloCommandResponse {
            is_writable_primary: Some(true),
            set_name: Some("rs".to_string()),
            me: Some(me.to_string()),
            hosts: Some(hosts.iter().map(|host| host.to_string()).collect()),
            min_wire_version: Some(6),
            max_wire_version: Some(17),
            ..Default::default()
        };
        let reply = HelloReply {
            server_address: address(me),
            command_response: response,
            round_trip_time: Duration::from_millis(5),
        };
        ServerDescription::new_from_hello_reply(address(me), &reply, Duration::from_millis(5))
    }

    fn network_error() -> Error {
        Error::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        ))
    }

    #[tokio::test]
    async fn selection_times_out_while_all_servers_are_unknown() {
        let topology = Topology::new_unmonitored(options(&["a:27017"])).unwrap();
        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Primary);

        let error = topology.select_server(&criteria).await.unwrap_err();
        match *error.kind {
            ErrorKind::ServerSelection { .. } => {}
            ref other => panic!("expected selection timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn applied_update_grows_the_server_map_and_unblocks_selection() {
        let topology = Topology::new_unmonitored(options(&["a:27017"])).unwrap();
        assert!(
            topology
                .update(primary_description("a:27017", &["a:27017", "b:27017"]))
                .await
        );

        let description = topology.description();
        assert_eq!(
            description.topology_type,
            TopologyType::ReplicaSetWithPrimary
        );
        assert!(description.get_server(&address("b:27017")).is_some());

        let state = topology.inner.state.read().await;
        assert!(state.servers.contains_key(&address("b:27017")));
        drop(state);

        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Primary);
        let server = topology.select_server(&criteria).await.unwrap();
        assert_eq!(server.address(), &address("a:27017"));
    }

    #[tokio::test]
    async fn selection_wakes_up_on_a_published_update() {
        let mut options = options(&["a:27017"]);
        options.server_selection_timeout = Some(Duration::from_secs(5));
        let topology = Topology::new_unmonitored(options).unwrap();

        let background = topology.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            background
                .update(primary_description("a:27017", &["a:27017"]))
                .await;
        });

        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Primary);
        let server = topology.select_server(&criteria).await.unwrap();
        assert_eq!(server.address(), &address("a:27017"));
    }

    #[tokio::test]
    async fn one_update_wakes_every_blocked_selection() {
        let mut options = options(&["a:27017"]);
        options.server_selection_timeout = Some(Duration::from_secs(5));
        let topology = Topology::new_unmonitored(options).unwrap();

        let background = topology.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            background
                .update(primary_description("a:27017", &["a:27017"]))
                .await;
        });

        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Primary);
        let (first, second) = futures::join!(
            topology.select_server(&criteria),
            topology.select_server(&criteria)
        );
        assert_eq!(first.unwrap().address(), &address("a:27017"));
        assert_eq!(second.unwrap().address(), &address("a:27017"));
    }

    #[tokio::test]
    async fn network_error_marks_the_server_unknown_and_clears_its_pool() {
        let topology = Topology::new_unmonitored(options(&["a:27017"])).unwrap();
        topology
            .update(primary_description("a:27017", &["a:27017"]))
            .await;

        let server = {
            let state = topology.inner.state.read().await;
            state.servers.get(&address("a:27017")).cloned().unwrap()
        };
        let generation = server.pool_generation().await;

        topology
            .handle_application_error(&network_error(), &server)
            .await;

        let description = topology.description();
        let marked = description.get_server(&address("a:27017")).unwrap();
        assert_eq!(marked.server_type, ServerType::Unknown);
        assert_eq!(server.pool_generation().await, generation + 1);
    }

    #[tokio::test]
    async fn updates_for_removed_servers_are_ignored() {
        let topology = Topology::new_unmonitored(options(&["a:27017"])).unwrap();
        assert!(
            !topology
                .update(primary_description("c:27017", &["c:27017"]))
                .await
        );
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_and_fails_selection() {
        let topology = Topology::new_unmonitored(options(&["a:27017"])).unwrap();
        topology.shutdown().await;
        topology.shutdown().await;

        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Primary);
        assert!(topology.select_server(&criteria).await.is_err());
    }
}
