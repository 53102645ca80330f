//! The connection seam: lifecycle events, listeners and the two
//! implementations behind [`Connection`].

pub mod memory;
pub mod mongo;

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use mongodb::Database;
use serde::Serialize;

use crate::config::{ConnectionTarget, DriverOptions};
use crate::error::{ConfigError, ConnectionError, ListenerError};

pub use memory::MemoryConnection;
pub use mongo::MongoConnection;

/// Named connection lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionEvent {
    Connecting,
    Connected,
    Open,
    Disconnecting,
    Disconnected,
    Reconnected,
    Close,
    Error,
}

impl ConnectionEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionEvent::Connecting => "connecting",
            ConnectionEvent::Connected => "connected",
            ConnectionEvent::Open => "open",
            ConnectionEvent::Disconnecting => "disconnecting",
            ConnectionEvent::Disconnected => "disconnected",
            ConnectionEvent::Reconnected => "reconnected",
            ConnectionEvent::Close => "close",
            ConnectionEvent::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionEvent {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "connecting" => Ok(ConnectionEvent::Connecting),
            "connected" => Ok(ConnectionEvent::Connected),
            "open" => Ok(ConnectionEvent::Open),
            "disconnecting" => Ok(ConnectionEvent::Disconnecting),
            "disconnected" => Ok(ConnectionEvent::Disconnected),
            "reconnected" => Ok(ConnectionEvent::Reconnected),
            "close" => Ok(ConnectionEvent::Close),
            "error" => Ok(ConnectionEvent::Error),
            other => Err(ConfigError::UnknownEvent(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadyState {
    Disconnected,
    Connected,
    Connecting,
    Disconnecting,
}

/// What a listener receives when its event fires.
#[derive(Debug, Clone)]
pub struct EventArgs {
    pub event: ConnectionEvent,
    /// Set for [`ConnectionEvent::Error`].
    pub error: Option<Arc<ConnectionError>>,
}

impl EventArgs {
    pub fn new(event: ConnectionEvent) -> Self {
        Self { event, error: None }
    }

    pub fn error(err: ConnectionError) -> Self {
        Self {
            event: ConnectionEvent::Error,
            error: Some(Arc::new(err)),
        }
    }
}

pub type Listener = Arc<dyn Fn(&EventArgs) -> Result<(), ListenerError> + Send + Sync>;

/// Wrap a closure as a [`Listener`].
pub fn listener<F>(f: F) -> Listener
where
    F: Fn(&EventArgs) -> Result<(), ListenerError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// A single long-lived database connection shared by every model.
pub trait Connection: Send + Sync + 'static {
    /// Subscribe a listener. Several listeners may share one event; they
    /// run in subscription order.
    fn on(&self, event: ConnectionEvent, listener: Listener);

    /// Start connecting. Completion and failure are reported as events.
    fn open(&self, target: &ConnectionTarget, options: &DriverOptions) -> Result<(), ConnectionError>;

    fn close(&self);

    /// Database handle for model collections, `None` until opened.
    fn database(&self) -> Option<Database>;

    fn ready_state(&self) -> ReadyState;
}

/// Ordered listener list shared by the connection implementations.
#[derive(Default)]
pub(crate) struct Listeners {
    entries: RwLock<Vec<(ConnectionEvent, Listener)>>,
}

impl Listeners {
    pub(crate) fn add(&self, event: ConnectionEvent, listener: Listener) {
        write(&self.entries).push((event, listener));
    }

    pub(crate) fn count(&self, event: ConnectionEvent) -> usize {
        read(&self.entries).iter().filter(|(e, _)| *e == event).count()
    }

    pub(crate) fn events(&self) -> Vec<ConnectionEvent> {
        read(&self.entries).iter().map(|(e, _)| *e).collect()
    }

    /// Run every listener for the event. Stops at the first failure.
    pub(crate) fn emit(&self, args: &EventArgs) -> Result<(), ListenerError> {
        // snapshot so listeners may subscribe or close without deadlocking
        let matching: Vec<Listener> = read(&self.entries)
            .iter()
            .filter(|(e, _)| *e == args.event)
            .map(|(_, l)| Arc::clone(l))
            .collect();

        for handler in matching {
            handler(args)?;
        }
        Ok(())
    }
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
