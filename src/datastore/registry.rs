use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, instrument};

use super::{
    Capabilities, Connection, DatastoreDescriptor, Driver, MemoryDatastore, SourceConnection,
    TargetConnection,
};
use crate::retry::{connection_error, Backoff};
use crate::{kafka, postgres, Error, Result};

/// Notification that the set of datastores changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    Registered(String),
    Replaced(String),
}

/// A registered datastore. Cloning shares the connection.
///
/// The connection is established on first use. Concurrent first uses
/// wait on the same connect; established connections are shared and
/// queried in parallel.
#[derive(Clone)]
pub struct DatastoreHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    descriptor: DatastoreDescriptor,
    preset: Option<Connection>,
    connection: Mutex<Option<Connection>>,
}

impl DatastoreHandle {
    fn new(descriptor: DatastoreDescriptor, preset: Option<Connection>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                descriptor,
                preset,
                connection: Mutex::new(None),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.descriptor.name
    }

    pub fn descriptor(&self) -> &DatastoreDescriptor {
        &self.inner.descriptor
    }

    pub fn capabilities(&self) -> Capabilities {
        self.inner.descriptor.capabilities()
    }

    /// Returns the shared connection, connecting with backoff if needed.
    #[instrument(skip(self), fields(datastore = %self.name()))]
    pub async fn connection(&self) -> Result<Connection> {
        let mut guard = self.inner.connection.lock().await;
        if let Some(connection) = guard.as_ref() {
            return Ok(connection.clone());
        }

        let descriptor = &self.inner.descriptor;
        let connection = match &self.inner.preset {
            Some(preset) => preset.clone(),
            None => Backoff::connect(descriptor.connect_max_attempts)
                .retry(&format!("connect to {}", descriptor.name), |_| {
                    connect(descriptor)
                })
                .await
                .map_err(|e| connection_error(&descriptor.name, e))?,
        };

        info!(driver = %descriptor.driver, "Connected to datastore");
        *guard = Some(connection.clone());
        Ok(connection)
    }

    pub async fn source(&self) -> Result<Arc<dyn SourceConnection>> {
        self.connection().await?.source.ok_or_else(|| {
            Error::Unsupported(format!(
                "datastore '{}' ({}) cannot be a capture source",
                self.name(),
                self.descriptor().driver
            ))
        })
    }

    pub async fn target(&self) -> Result<Arc<dyn TargetConnection>> {
        self.connection().await?.target.ok_or_else(|| {
            Error::Unsupported(format!(
                "datastore '{}' ({}) cannot be an apply target",
                self.name(),
                self.descriptor().driver
            ))
        })
    }

    /// Drops the shared connection. The next use reconnects.
    pub async fn disconnect(&self) {
        if self.inner.connection.lock().await.take().is_some() {
            debug!(datastore = %self.name(), "Disconnected datastore");
        }
    }

    pub fn same_as(&self, other: &DatastoreHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

async fn connect(descriptor: &DatastoreDescriptor) -> Result<Connection> {
    match descriptor.driver {
        Driver::Postgres => postgres::connect(descriptor).await,
        Driver::Kafka => kafka::connect(descriptor).await,
        Driver::Memory => Ok(Connection::both(Arc::new(MemoryDatastore::new()))),
    }
}

/// Resolves datastore names to handles.
pub struct DatastoreRegistry {
    handles: RwLock<HashMap<String, DatastoreHandle>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl Default for DatastoreRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl DatastoreRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            handles: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Registers a datastore; names must be unique.
    pub fn register(&self, descriptor: DatastoreDescriptor) -> Result<DatastoreHandle> {
        let preset = match descriptor.driver {
            Driver::Memory => Some(Connection::both(Arc::new(MemoryDatastore::new()))),
            _ => None,
        };
        self.insert(descriptor, preset, false)
    }

    /// Registers a datastore backed by an already established connection.
    pub fn register_with(
        &self,
        descriptor: DatastoreDescriptor,
        connection: Connection,
    ) -> Result<DatastoreHandle> {
        self.insert(descriptor, Some(connection), false)
    }

    /// Swaps the descriptor of a registered datastore and notifies
    /// subscribers so running pipelines can reconnect.
    pub fn replace(&self, descriptor: DatastoreDescriptor) -> Result<DatastoreHandle> {
        let preset = match descriptor.driver {
            Driver::Memory => Some(Connection::both(Arc::new(MemoryDatastore::new()))),
            _ => None,
        };
        self.insert(descriptor, preset, true)
    }

    /// Like [`replace`](Self::replace) with an established connection.
    pub fn replace_with(
        &self,
        descriptor: DatastoreDescriptor,
        connection: Connection,
    ) -> Result<DatastoreHandle> {
        self.insert(descriptor, Some(connection), true)
    }

    fn insert(
        &self,
        descriptor: DatastoreDescriptor,
        preset: Option<Connection>,
        replace: bool,
    ) -> Result<DatastoreHandle> {
        descriptor.check()?;
        let name = descriptor.name.clone();
        let handle = DatastoreHandle::new(descriptor, preset);

        let previous = {
            let mut handles = self.handles.write().unwrap_or_else(|e| e.into_inner());
            match (handles.contains_key(&name), replace) {
                (true, false) => {
                    return Err(Error::AlreadyExists {
                        what: "datastore",
                        name,
                    })
                }
                (false, true) => return Err(Error::not_found("datastore", name)),
                _ => handles.insert(name.clone(), handle.clone()),
            }
        };

        if let Some(previous) = previous {
            tokio::spawn(async move { previous.disconnect().await });
            info!(datastore = %name, "Replaced datastore");
            let _ = self.events.send(RegistryEvent::Replaced(name));
        } else {
            info!(datastore = %name, "Registered datastore");
            let _ = self.events.send(RegistryEvent::Registered(name));
        }
        Ok(handle)
    }

    /// Looks a datastore up by name. Never touches the network.
    pub fn resolve(&self, name: &str) -> Result<DatastoreHandle> {
        self.handles
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found("datastore", name))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .handles
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    pub async fn disconnect_all(&self) {
        let handles: Vec<DatastoreHandle> = self
            .handles
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        for handle in handles {
            handle.disconnect().await;
        }
    }
}
