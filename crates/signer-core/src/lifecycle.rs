//! Connection lifecycle for the signing client.
//!
//! Owns the single client reference, waits for the "connect" event, issues
//! signing requests while connected and, when asked to, reacts to a
//! "disconnect" by replacing the client and waiting for it to connect.
//!
//! ```text
//! Idle ─ start() ─► AwaitingConnection ─ connect ─► Connected
//!                          ▲                            │ disconnect
//!                          │                            ▼
//!                          └──── new client ◄── AwaitingReconnection
//!
//! any failed wait ─► Failed (terminal, no further attempts)
//! ```

use alloy_primitives::Address;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::provider::{
    wait_for_connect, wait_for_disconnect, ClientFactory, ConnectInfo, ConnectionState,
    RpcRequest, SigningClient, SIGN_TYPED_DATA_V4,
};
use crate::typed_data::TypedDataEnvelope;
use crate::{Error, Result};

/// Handler-side view of the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    AwaitingConnection,
    Connected { chain_id: u64 },
    AwaitingReconnection,
    Failed { reason: String },
}

impl LifecycleState {
    pub fn is_connected(&self) -> bool {
        matches!(self, LifecycleState::Connected { .. })
    }
}

#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    /// How long to wait for a "connect" event; `None` waits indefinitely.
    pub connect_timeout: Option<Duration>,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Some(Duration::from_secs(30)),
        }
    }
}

impl From<&crate::config::LifecycleSettings> for LifecycleConfig {
    fn from(settings: &crate::config::LifecycleSettings) -> Self {
        Self {
            connect_timeout: settings.connect_timeout,
        }
    }
}

/// Drives one signing client through connect, sign and reconnect.
///
/// Cloning shares the same underlying state.
#[derive(Clone)]
pub struct ConnectionLifecycle {
    inner: Arc<Inner>,
}

struct Inner {
    factory: Arc<dyn ClientFactory>,
    config: LifecycleConfig,
    client: Mutex<Option<Arc<dyn SigningClient>>>,
    state: watch::Sender<LifecycleState>,
    generation: AtomicUsize,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionLifecycle {
    pub fn new(factory: Arc<dyn ClientFactory>, config: LifecycleConfig) -> Self {
        let (state, _) = watch::channel(LifecycleState::Idle);
        Self {
            inner: Arc::new(Inner {
                factory,
                config,
                client: Mutex::new(None),
                state,
                generation: AtomicUsize::new(0),
                watcher: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<LifecycleState> {
        self.inner.state.subscribe()
    }

    /// Number of client instances constructed so far.
    pub fn client_generation(&self) -> usize {
        self.inner.generation.load(Ordering::SeqCst)
    }

    /// The currently held client, if any.
    pub fn client(&self) -> Option<Arc<dyn SigningClient>> {
        self.inner.slot().clone()
    }

    /// Create a client and wait for its "connect" event.
    pub async fn start(&self) -> Result<ConnectInfo> {
        let client = self.inner.install_client()?;
        self.inner.await_connect(client.as_ref()).await
    }

    /// Request one `eth_signTypedData_v4` signature. Provider errors are
    /// returned unchanged and never retried.
    pub async fn sign_once(&self, envelope: &TypedDataEnvelope, signer: Address) -> Result<String> {
        if !self.state().is_connected() {
            return Err(Error::NotConnected);
        }
        let client = self.client().ok_or(Error::NotConnected)?;

        let request = RpcRequest::sign_typed_data_v4(signer, envelope)?;
        debug!(
            signer = %signer,
            primary_type = %envelope.primary_type,
            "Requesting typed data signature"
        );

        match client.request(request).await? {
            Value::String(signature) => Ok(signature),
            other => Err(Error::UnexpectedResponse {
                method: SIGN_TYPED_DATA_V4.to_string(),
                message: format!("expected signature string, got {}", other),
            }),
        }
    }

    /// Register the reconnect reaction for the connected client.
    ///
    /// Only valid while connected; a failed start stays failed. Each client
    /// instance gets at most one reconnection attempt. A failed attempt is
    /// logged and leaves the handler in [`LifecycleState::Failed`].
    pub fn on_disconnect(&self) -> Result<()> {
        if !self.state().is_connected() {
            return Err(Error::NotConnected);
        }
        let client = self.client().ok_or(Error::NotConnected)?;
        let rx = client.subscribe();
        drop(client);

        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(Inner::watch_disconnects(weak, rx));

        if let Some(previous) = lock(&self.inner.watcher).replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    /// Stop reacting to disconnects.
    pub fn shutdown(&self) {
        if let Some(handle) = lock(&self.inner.watcher).take() {
            handle.abort();
        }
    }
}

impl Inner {
    fn slot(&self) -> MutexGuard<'_, Option<Arc<dyn SigningClient>>> {
        lock(&self.client)
    }

    fn set_state(&self, state: LifecycleState) {
        debug!(state = ?state, "Lifecycle transition");
        self.state.send_replace(state);
    }

    fn fail(&self, reason: String) {
        self.set_state(LifecycleState::Failed { reason });
    }

    /// Build a new client and make it the only one held.
    fn install_client(&self) -> Result<Arc<dyn SigningClient>> {
        let client = match self.factory.create() {
            Ok(client) => client,
            Err(e) => {
                self.fail(e.to_string());
                return Err(e);
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.slot() = Some(Arc::clone(&client));
        self.set_state(LifecycleState::AwaitingConnection);
        debug!(generation = generation, "Signing client created");

        Ok(client)
    }

    async fn await_connect(&self, client: &dyn SigningClient) -> Result<ConnectInfo> {
        let mut rx = client.subscribe();
        let wait = wait_for_connect(&mut rx);
        let outcome = match self.config.connect_timeout {
            Some(limit) => match tokio::time::timeout(limit, wait).await {
                Ok(outcome) => outcome,
                Err(_) => Err(Error::Connection {
                    message: format!("no connect event within {:?}", limit),
                }),
            },
            None => wait.await,
        };

        match outcome {
            Ok(info) => {
                self.set_state(LifecycleState::Connected {
                    chain_id: info.chain_id,
                });
                info!(chain_id = info.chain_id, "Connected to chain {}", info.chain_id);
                Ok(info)
            }
            Err(e) => {
                self.fail(e.to_string());
                Err(e)
            }
        }
    }

    /// Drop the old client, build exactly one replacement and wait for it.
    async fn reconnect(&self) -> Result<(ConnectInfo, watch::Receiver<ConnectionState>)> {
        self.set_state(LifecycleState::AwaitingReconnection);
        self.slot().take();

        let client = self.install_client().map_err(|e| Error::Reconnection {
            message: e.to_string(),
        })?;
        let rx = client.subscribe();

        let info = self
            .await_connect(client.as_ref())
            .await
            .map_err(|e| Error::Reconnection {
                message: e.to_string(),
            })?;

        Ok((info, rx))
    }

    async fn watch_disconnects(inner: Weak<Inner>, mut rx: watch::Receiver<ConnectionState>) {
        loop {
            let info = match wait_for_disconnect(&mut rx).await {
                Ok(info) => info,
                Err(e) => {
                    debug!(error = %e, "Disconnect subscription closed");
                    return;
                }
            };

            let Some(inner) = inner.upgrade() else {
                return;
            };

            warn!(
                code = info.code,
                reason = %info.reason,
                "Signing client disconnected, reconnecting"
            );

            match inner.reconnect().await {
                Ok((connected, next)) => {
                    info!(chain_id = connected.chain_id, "Signing client reconnected");
                    rx = next;
                }
                Err(e) => {
                    error!(error = %e, "Reconnection failed, staying disconnected");
                    return;
                }
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
