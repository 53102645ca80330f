use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};

use mongodb::{
    Client, Database,
    bson::doc,
    event::{EventHandler, sdam::SdamEvent},
    options::ClientOptions,
};

use super::{Connection, ConnectionEvent, EventArgs, Listener, Listeners, ReadyState, read, write};
use crate::config::{ConnectionTarget, DriverOptions};
use crate::error::{ConnectionError, ListenerError};

/// Connection backed by the MongoDB driver.
///
/// `open` returns immediately; the client is built and pinged on the tokio
/// runtime and the outcome is reported through `connected`/`open` or
/// `error` listeners. Reconnection is left to the driver's monitoring.
#[derive(Clone, Default)]
pub struct MongoConnection {
    shared: Arc<Shared>,
}

struct Shared {
    listeners: Listeners,
    client: RwLock<Option<Client>>,
    database: RwLock<Option<String>>,
    state: RwLock<ReadyState>,
    closed: AtomicBool,
}

impl Default for Shared {
    fn default() -> Self {
        Self {
            listeners: Listeners::default(),
            client: RwLock::new(None),
            database: RwLock::new(None),
            state: RwLock::new(ReadyState::Disconnected),
            closed: AtomicBool::new(false),
        }
    }
}

impl MongoConnection {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Shared {
    fn state(&self) -> ReadyState {
        *read(&self.state)
    }

    fn set_state(&self, state: ReadyState) {
        *write(&self.state) = state;
    }

    /// Run listeners. A fatal listener result terminates the process.
    fn dispatch(&self, args: EventArgs) {
        match self.listeners.emit(&args) {
            Ok(()) => {}
            Err(ListenerError::Fatal(cause)) => {
                tracing::error!(event = %args.event, error = %cause, "fatal MongoDB connection error, exiting");
                std::process::exit(1);
            }
            Err(err) => {
                tracing::warn!(event = %args.event, error = %err, "connection listener failed");
            }
        }
    }

    async fn connect(self: &Arc<Self>, uri: &str, options: &DriverOptions) -> Result<(), ConnectionError> {
        let mut client_options = ClientOptions::parse(uri).await?;
        options.apply(&mut client_options);

        // weak so the driver's handler does not keep the connection alive
        let weak: Weak<Shared> = Arc::downgrade(self);
        client_options.sdam_event_handler = Some(EventHandler::callback(move |event: SdamEvent| {
            if let Some(shared) = weak.upgrade() {
                shared.on_sdam_event(event);
            }
        }));

        let client = Client::with_options(client_options)?;
        *write(&self.client) = Some(client.clone());

        client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await?;

        Ok(())
    }

    fn on_sdam_event(&self, event: SdamEvent) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        match event {
            SdamEvent::ServerHeartbeatFailed(ev) => {
                if self.state() == ReadyState::Connected {
                    self.set_state(ReadyState::Disconnected);
                    tracing::warn!(server = %ev.server_address, error = %ev.failure, "Lost connection to MongoDB");
                    self.dispatch(EventArgs::new(ConnectionEvent::Disconnected));
                }
            }
            SdamEvent::ServerHeartbeatSucceeded(ev) => {
                if self.state() == ReadyState::Disconnected {
                    self.set_state(ReadyState::Connected);
                    tracing::info!(server = %ev.server_address, "Reconnected to MongoDB");
                    self.dispatch(EventArgs::new(ConnectionEvent::Reconnected));
                    self.dispatch(EventArgs::new(ConnectionEvent::Connected));
                }
            }
            SdamEvent::TopologyClosed(_) => {
                if self.closed.swap(true, Ordering::SeqCst) {
                    return;
                }
                let was_disconnected = self.state() == ReadyState::Disconnected;
                self.set_state(ReadyState::Disconnected);
                tracing::debug!("MongoDB topology closed");
                if !was_disconnected {
                    self.dispatch(EventArgs::new(ConnectionEvent::Disconnected));
                }
                self.dispatch(EventArgs::new(ConnectionEvent::Close));
            }
            _ => {}
        }
    }
}

impl Connection for MongoConnection {
    fn on(&self, event: ConnectionEvent, listener: Listener) {
        self.shared.listeners.add(event, listener);
    }

    fn open(&self, target: &ConnectionTarget, options: &DriverOptions) -> Result<(), ConnectionError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(ConnectionError::Closed);
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| ConnectionError::NoRuntime)?;

        *write(&self.shared.database) = Some(target.database.clone());
        self.shared.set_state(ReadyState::Connecting);
        self.shared.dispatch(EventArgs::new(ConnectionEvent::Connecting));

        let shared = Arc::clone(&self.shared);
        let uri = target.uri.clone();
        let redacted = target.redacted();
        let options = options.clone();

        runtime.spawn(async move {
            match shared.connect(&uri, &options).await {
                Ok(()) if shared.closed.load(Ordering::SeqCst) => {}
                Ok(()) => {
                    tracing::info!(uri = %redacted, "Successfully connected to MongoDB");
                    shared.set_state(ReadyState::Connected);
                    shared.dispatch(EventArgs::new(ConnectionEvent::Connected));
                    shared.dispatch(EventArgs::new(ConnectionEvent::Open));
                }
                Err(err) => {
                    tracing::error!(uri = %redacted, error = %err, "Failed to connect to MongoDB");
                    shared.set_state(ReadyState::Disconnected);
                    shared.dispatch(EventArgs::error(err));
                }
            }
        });

        Ok(())
    }

    fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.shared.set_state(ReadyState::Disconnecting);
        self.shared.dispatch(EventArgs::new(ConnectionEvent::Disconnecting));

        let client = write(&self.shared.client).take();
        if let Some(client) = client {
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(async move { client.shutdown().await });
                }
                Err(_) => drop(client),
            }
        }

        self.shared.set_state(ReadyState::Disconnected);
        tracing::debug!("MongoDB connection closed");
        self.shared.dispatch(EventArgs::new(ConnectionEvent::Disconnected));
        self.shared.dispatch(EventArgs::new(ConnectionEvent::Close));
    }

    fn database(&self) -> Option<Database> {
        let name = read(&self.shared.database).clone()?;
        read(&self.shared.client).as_ref().map(|client| client.database(&name))
    }

    fn ready_state(&self) -> ReadyState {
        self.shared.state()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MongoConfig;

    #[test]
    fn test_open_requires_runtime() {
        let conn = MongoConnection::new();
        let resolved = MongoConfig::default().resolve().unwrap();
        assert!(matches!(
            conn.open(&resolved.target, &resolved.options),
            Err(ConnectionError::NoRuntime)
        ));
    }

    #[test]
    fn test_close_is_idempotent() {
        let conn = MongoConnection::new();
        let closes = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&closes);
        conn.on(
            ConnectionEvent::Close,
            crate::connection::listener(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        conn.close();
        conn.close();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(conn.ready_state(), ReadyState::Disconnected);
        assert!(conn.database().is_none());
    }

    fn topology_closed() -> SdamEvent {
        SdamEvent::TopologyClosed(serde_json::from_value(serde_json::json!({})).unwrap())
    }

    fn record(conn: &MongoConnection, seen: &Arc<std::sync::Mutex<Vec<ConnectionEvent>>>) {
        for event in [ConnectionEvent::Disconnected, ConnectionEvent::Close] {
            let seen = Arc::clone(seen);
            conn.on(
                event,
                crate::connection::listener(move |args| {
                    seen.lock().unwrap().push(args.event);
                    Ok(())
                }),
            );
        }
    }

    #[test]
    fn test_topology_closed_emits_close() {
        let conn = MongoConnection::new();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        record(&conn, &seen);
        conn.shared.set_state(ReadyState::Connected);

        conn.shared.on_sdam_event(topology_closed());
        conn.shared.on_sdam_event(topology_closed());

        assert_eq!(
            *seen.lock().unwrap(),
            [ConnectionEvent::Disconnected, ConnectionEvent::Close]
        );
        assert_eq!(conn.ready_state(), ReadyState::Disconnected);

        // the driver closing first leaves nothing for close() to report
        conn.close();
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_topology_closed_after_close_is_ignored() {
        let conn = MongoConnection::new();
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        record(&conn, &seen);

        conn.close();
        conn.shared.on_sdam_event(topology_closed());

        assert_eq!(
            *seen.lock().unwrap(),
            [ConnectionEvent::Disconnected, ConnectionEvent::Close]
        );
    }

    #[tokio::test]
    async fn test_open_after_close_fails() {
        let conn = MongoConnection::new();
        conn.close();
        let resolved = MongoConfig::default().resolve().unwrap();
        assert!(matches!(
            conn.open(&resolved.target, &resolved.options),
            Err(ConnectionError::Closed)
        ));
    }
}
