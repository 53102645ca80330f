//! In-process connection without a server.
//!
//! Records what the registry does to it (subscriptions, open, close) and
//! lets the caller fire events by hand.

use std::sync::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use mongodb::Database;

use super::{Connection, ConnectionEvent, EventArgs, Listener, Listeners, ReadyState, read, write};
use crate::config::{ConnectionTarget, DriverOptions};
use crate::error::{ConnectionError, ListenerError};

pub struct MemoryConnection {
    listeners: Listeners,
    state: RwLock<ReadyState>,
    opened: RwLock<Option<(ConnectionTarget, DriverOptions)>>,
    closes: AtomicUsize,
}

impl MemoryConnection {
    pub fn new() -> Self {
        Self {
            listeners: Listeners::default(),
            state: RwLock::new(ReadyState::Disconnected),
            opened: RwLock::new(None),
            closes: AtomicUsize::new(0),
        }
    }

    /// Fire an event at the subscribed listeners and hand back the first
    /// listener failure.
    pub fn emit(&self, event: ConnectionEvent, error: Option<ConnectionError>) -> Result<(), ListenerError> {
        let args = match error {
            Some(err) => EventArgs {
                event,
                ..EventArgs::error(err)
            },
            None => EventArgs::new(event),
        };
        self.listeners.emit(&args)
    }

    pub fn listener_count(&self, event: ConnectionEvent) -> usize {
        self.listeners.count(event)
    }

    /// Subscribed event names in subscription order.
    pub fn subscriptions(&self) -> Vec<ConnectionEvent> {
        self.listeners.events()
    }

    /// Target and options passed to the last `open`.
    pub fn opened_with(&self) -> Option<(ConnectionTarget, DriverOptions)> {
        read(&self.opened).clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl Default for MemoryConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl Connection for MemoryConnection {
    fn on(&self, event: ConnectionEvent, listener: Listener) {
        self.listeners.add(event, listener);
    }

    fn open(&self, target: &ConnectionTarget, options: &DriverOptions) -> Result<(), ConnectionError> {
        *write(&self.opened) = Some((target.clone(), options.clone()));
        *write(&self.state) = ReadyState::Connected;
        Ok(())
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        *write(&self.state) = ReadyState::Disconnected;
    }

    fn database(&self) -> Option<Database> {
        None
    }

    fn ready_state(&self) -> ReadyState {
        *read(&self.state)
    }
}
