//! Signing client seam.
//!
//! The signing client owns the vault key, the transport and the chain
//! connection. This module only describes how the rest of the crate talks to
//! it: an EIP-1193 style `request`, a "connect" event that resolves once, and
//! a standing "disconnect" subscription.
//!
//! ```text
//! ClientFactory ── create ──► SigningClient
//!                                 │
//!            subscribe() ─────────┤  watch<ConnectionState>
//!                                 │    Connecting → Connected → Disconnected
//!            request() ───────────┘  eth_signTypedData_v4, eth_chainId, ...
//! ```

pub mod auth;
pub mod local;
pub mod rpc;

use alloy_primitives::Address;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

use crate::typed_data::TypedDataEnvelope;
use crate::{Error, Result};

pub use local::{LocalClientFactory, LocalSigningClient};
pub use rpc::{RpcClientFactory, RpcSigningClient};

/// Typed data signing method.
pub const SIGN_TYPED_DATA_V4: &str = "eth_signTypedData_v4";

/// Chain ID query method.
pub const ETH_CHAIN_ID: &str = "eth_chainId";

/// Account listing method.
pub const ETH_ACCOUNTS: &str = "eth_accounts";

/// EIP-1193 and JSON-RPC error codes.
pub mod codes {
    pub const USER_REJECTED: i64 = 4001;
    pub const UNAUTHORIZED: i64 = 4100;
    pub const UNSUPPORTED_METHOD: i64 = 4200;
    pub const DISCONNECTED: i64 = 4900;
    pub const CHAIN_DISCONNECTED: i64 = 4901;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;
}

/// Error reported by the signing client for a request.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("Provider RPC error {code}: {message}")]
pub struct ProviderRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ProviderRpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn is_user_rejection(&self) -> bool {
        self.code == codes::USER_REJECTED
    }

    pub fn is_disconnect(&self) -> bool {
        matches!(self.code, codes::DISCONNECTED | codes::CHAIN_DISCONNECTED)
    }
}

/// An EIP-1193 request: `{method, params}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

impl RpcRequest {
    pub fn new(method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            params,
        }
    }

    pub fn chain_id() -> Self {
        Self::new(ETH_CHAIN_ID, Vec::new())
    }

    /// `eth_signTypedData_v4` with params `[address, JSON envelope]`.
    pub fn sign_typed_data_v4(signer: Address, envelope: &TypedDataEnvelope) -> Result<Self> {
        Ok(Self::new(
            SIGN_TYPED_DATA_V4,
            vec![
                Value::String(signer.to_checksum(None)),
                Value::String(envelope.to_json()?),
            ],
        ))
    }
}

/// Payload of the "connect" event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectInfo {
    pub chain_id: u64,
}

/// Payload of the "disconnect" event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectInfo {
    pub code: i64,
    pub reason: String,
}

impl DisconnectInfo {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            code: codes::DISCONNECTED,
            reason: reason.into(),
        }
    }

    pub fn chain_mismatch(reason: impl Into<String>) -> Self {
        Self {
            code: codes::CHAIN_DISCONNECTED,
            reason: reason.into(),
        }
    }
}

/// Connection state of one client instance.
///
/// A client that fails to connect goes straight from `Connecting` to
/// `Disconnected`. `Disconnected` is terminal for that instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected(ConnectInfo),
    Disconnected(DisconnectInfo),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connect,
    Disconnect,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Connect => write!(f, "connect"),
            EventKind::Disconnect => write!(f, "disconnect"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    Connect(ConnectInfo),
    Disconnect(DisconnectInfo),
}

/// The external signing client.
#[async_trait]
pub trait SigningClient: Send + Sync {
    /// Standing subscription to this instance's connection state.
    fn subscribe(&self) -> watch::Receiver<ConnectionState>;

    /// Issue a request. Provider errors come back as [`Error::Rpc`].
    async fn request(&self, request: RpcRequest) -> Result<Value>;

    /// Resolve once the named event has been emitted.
    async fn wait_for_event(&self, kind: EventKind) -> Result<ProviderEvent> {
        let mut rx = self.subscribe();
        wait_for_event(&mut rx, kind).await
    }
}

/// Builds client instances from a fixed static configuration.
#[cfg_attr(test, mockall::automock)]
pub trait ClientFactory: Send + Sync {
    fn create(&self) -> Result<Arc<dyn SigningClient>>;
}

/// Wait on a state subscription until `kind` is observed.
pub async fn wait_for_event(
    rx: &mut watch::Receiver<ConnectionState>,
    kind: EventKind,
) -> Result<ProviderEvent> {
    match kind {
        EventKind::Connect => wait_for_connect(rx).await.map(ProviderEvent::Connect),
        EventKind::Disconnect => wait_for_disconnect(rx).await.map(ProviderEvent::Disconnect),
    }
}

/// Resolve on "connect". Fails if the client disconnects first or is dropped.
pub async fn wait_for_connect(rx: &mut watch::Receiver<ConnectionState>) -> Result<ConnectInfo> {
    loop {
        let state = rx.borrow_and_update().clone();
        match state {
            ConnectionState::Connected(info) => return Ok(info),
            ConnectionState::Disconnected(info) => {
                return Err(Error::Connection {
                    message: info.reason,
                })
            }
            ConnectionState::Connecting => {}
        }
        next_change(rx, EventKind::Connect).await?;
    }
}

/// Resolve on "disconnect". Fails only if the client is dropped first.
pub async fn wait_for_disconnect(
    rx: &mut watch::Receiver<ConnectionState>,
) -> Result<DisconnectInfo> {
    loop {
        let disconnected = match &*rx.borrow_and_update() {
            ConnectionState::Disconnected(info) => Some(info.clone()),
            _ => None,
        };
        if let Some(info) = disconnected {
            return Ok(info);
        }
        next_change(rx, EventKind::Disconnect).await?;
    }
}

async fn next_change(rx: &mut watch::Receiver<ConnectionState>, kind: EventKind) -> Result<()> {
    rx.changed().await.map_err(|_| Error::Connection {
        message: format!("signing client dropped before '{}' event", kind),
    })
}

/// Mark a state sender as disconnected unless it already is.
///
/// Returns `true` if this call performed the transition.
pub(crate) fn publish_disconnect(
    state: &watch::Sender<ConnectionState>,
    info: DisconnectInfo,
) -> bool {
    state.send_if_modified(|current| {
        if matches!(current, ConnectionState::Disconnected(_)) {
            false
        } else {
            *current = ConnectionState::Disconnected(info);
            true
        }
    })
}
