//! Signer Core Library
//!
//! EIP-712 typed data assembly, the signing-client seam, and the
//! connect/disconnect lifecycle used to request `eth_signTypedData_v4`
//! signatures from a vault-backed signing client.

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod provider;
pub mod typed_data;

pub use error::{Error, Result};
pub use lifecycle::{ConnectionLifecycle, LifecycleConfig, LifecycleState};
pub use provider::{
    ClientFactory, ConnectInfo, ConnectionState, DisconnectInfo, EventKind, ProviderEvent,
    ProviderRpcError, RpcRequest, SigningClient,
};
pub use typed_data::{DomainDescriptor, TypeField, TypeSchema, TypedDataBuilder, TypedDataEnvelope};
