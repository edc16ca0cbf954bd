//! In-process signing client backed by a local private key.
//!
//! Answers the same requests as the remote vault so the signing flow can run
//! offline. Connects immediately on construction.

use alloy_dyn_abi::TypedData;
use alloy_primitives::Address;
use alloy_signer::Signer;
use alloy_signer_local::PrivateKeySigner;
use async_trait::async_trait;
use serde_json::Value;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

use super::{
    codes, publish_disconnect, ClientFactory, ConnectInfo, ConnectionState, DisconnectInfo,
    ProviderRpcError, RpcRequest, SigningClient, ETH_ACCOUNTS, ETH_CHAIN_ID, SIGN_TYPED_DATA_V4,
};
use crate::{Error, Result};

/// Signing client that signs with an in-memory key.
pub struct LocalSigningClient {
    signer: PrivateKeySigner,
    chain_id: u64,
    state: watch::Sender<ConnectionState>,
}

impl LocalSigningClient {
    pub fn new(signer: PrivateKeySigner, chain_id: u64) -> Self {
        let (state, _) = watch::channel(ConnectionState::Connected(ConnectInfo { chain_id }));
        Self {
            signer,
            chain_id,
            state,
        }
    }

    /// Create a client from a hex-encoded private key, optionally "0x"-prefixed.
    pub fn from_private_key(key: &str, chain_id: u64) -> Result<Self> {
        let signer = PrivateKeySigner::from_str(key.trim().trim_start_matches("0x")).map_err(
            |e| Error::Config {
                message: format!("Invalid local signer key: {}", e),
            },
        )?;
        Ok(Self::new(signer, chain_id))
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    /// Emit the "disconnect" event for this instance.
    pub fn disconnect(&self, reason: impl Into<String>) {
        publish_disconnect(&self.state, DisconnectInfo::new(reason));
    }

    async fn sign_typed_data(&self, params: &[Value]) -> std::result::Result<Value, ProviderRpcError> {
        let (address, payload) = match params {
            [Value::String(address), Value::String(payload)] => (address, payload),
            _ => {
                return Err(ProviderRpcError::new(
                    codes::INVALID_PARAMS,
                    "expected [address, typedDataJson]",
                ))
            }
        };

        let address: Address = address.parse().map_err(|e| {
            ProviderRpcError::new(codes::INVALID_PARAMS, format!("invalid address: {}", e))
        })?;
        if address != self.address() {
            return Err(ProviderRpcError::new(
                codes::UNAUTHORIZED,
                format!("address {} is not managed by this signer", address),
            ));
        }

        let typed_data: TypedData = serde_json::from_str(payload).map_err(|e| {
            ProviderRpcError::new(codes::INVALID_PARAMS, format!("invalid typed data: {}", e))
        })?;

        let signature = self
            .signer
            .sign_dynamic_typed_data(&typed_data)
            .await
            .map_err(|e| ProviderRpcError::new(codes::INTERNAL_ERROR, e.to_string()))?;

        Ok(Value::String(format!(
            "0x{}",
            hex::encode(signature.as_bytes())
        )))
    }
}

#[async_trait]
impl SigningClient for LocalSigningClient {
    fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    async fn request(&self, request: RpcRequest) -> Result<Value> {
        let disconnected = matches!(*self.state.borrow(), ConnectionState::Disconnected(_));
        if disconnected {
            return Err(ProviderRpcError::new(codes::DISCONNECTED, "signer disconnected").into());
        }

        debug!(method = %request.method, "Local signer request");

        let result = match request.method.as_str() {
            ETH_CHAIN_ID => Ok(Value::String(format!("0x{:x}", self.chain_id))),
            ETH_ACCOUNTS => Ok(Value::Array(vec![Value::String(
                self.address().to_checksum(None),
            )])),
            SIGN_TYPED_DATA_V4 => self.sign_typed_data(&request.params).await,
            other => Err(ProviderRpcError::new(
                codes::UNSUPPORTED_METHOD,
                format!("method {} is not supported", other),
            )),
        };

        result.map_err(Error::from)
    }
}

impl std::fmt::Debug for LocalSigningClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalSigningClient")
            .field("address", &format!("{:?}", self.address()))
            .field("chain_id", &self.chain_id)
            .finish()
    }
}

/// Creates a fresh [`LocalSigningClient`] for the same key on every call.
#[derive(Clone)]
pub struct LocalClientFactory {
    signer: PrivateKeySigner,
    chain_id: u64,
}

impl LocalClientFactory {
    pub fn new(signer: PrivateKeySigner, chain_id: u64) -> Self {
        Self { signer, chain_id }
    }
}

impl ClientFactory for LocalClientFactory {
    fn create(&self) -> Result<Arc<dyn SigningClient>> {
        Ok(Arc::new(LocalSigningClient::new(
            self.signer.clone(),
            self.chain_id,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{EventKind, ProviderEvent};
    use crate::typed_data::{example_message, TypedDataBuilder, EXAMPLE_PRIMARY_TYPE};
    use alloy_primitives::Signature;
    use serde_json::json;

    // Test private key (DO NOT USE IN PRODUCTION)
    const TEST_PRIVATE_KEY: &str =
        "ac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const TEST_ADDRESS: &str = "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266";

    fn test_client() -> LocalSigningClient {
        LocalSigningClient::from_private_key(TEST_PRIVATE_KEY, 8453).unwrap()
    }

    #[tokio::test]
    async fn test_connects_immediately() {
        let client = test_client();
        let event = client.wait_for_event(EventKind::Connect).await.unwrap();
        assert_eq!(event, ProviderEvent::Connect(ConnectInfo { chain_id: 8453 }));
    }

    #[tokio::test]
    async fn test_chain_id_and_accounts() {
        let client = test_client();

        let chain = client.request(RpcRequest::chain_id()).await.unwrap();
        assert_eq!(chain, json!("0x2105"));

        let accounts = client
            .request(RpcRequest::new(ETH_ACCOUNTS, vec![]))
            .await
            .unwrap();
        assert_eq!(
            accounts[0].as_str().unwrap().to_lowercase(),
            TEST_ADDRESS.to_lowercase()
        );
    }

    #[tokio::test]
    async fn test_signature_recovers_signer() {
        let client = test_client();
        let envelope = TypedDataBuilder::example(8453)
            .envelope(EXAMPLE_PRIMARY_TYPE, example_message("12345", "Hello EIP-712!"));

        let request = RpcRequest::sign_typed_data_v4(client.address(), &envelope).unwrap();
        let result = client.request(request).await.unwrap();
        let signature_hex = result.as_str().unwrap();

        // 0x + 65 bytes
        assert_eq!(signature_hex.len(), 132);

        let bytes = hex::decode(signature_hex.trim_start_matches("0x")).unwrap();
        let signature = Signature::try_from(bytes.as_slice()).unwrap();
        let hash = envelope.to_alloy().unwrap().eip712_signing_hash().unwrap();
        let recovered = signature.recover_address_from_prehash(&hash).unwrap();
        assert_eq!(recovered, client.address());
    }

    #[tokio::test]
    async fn test_foreign_address_unauthorized() {
        let client = test_client();
        let envelope = TypedDataBuilder::example(8453)
            .envelope(EXAMPLE_PRIMARY_TYPE, example_message("1", "a"));

        let err = client
            .request(RpcRequest::sign_typed_data_v4(Address::ZERO, &envelope).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Rpc(ref rpc) if rpc.code == codes::UNAUTHORIZED));
    }

    #[tokio::test]
    async fn test_unsupported_method() {
        let err = test_client()
            .request(RpcRequest::new("eth_sendTransaction", vec![]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Rpc(ref rpc) if rpc.code == codes::UNSUPPORTED_METHOD));
    }

    #[tokio::test]
    async fn test_disconnect_rejects_requests() {
        let client = test_client();
        client.disconnect("vault offline");

        let event = client.wait_for_event(EventKind::Disconnect).await.unwrap();
        assert_eq!(
            event,
            ProviderEvent::Disconnect(DisconnectInfo::new("vault offline"))
        );

        let err = client.request(RpcRequest::chain_id()).await.unwrap_err();
        assert!(matches!(err, Error::Rpc(ref rpc) if rpc.is_disconnect()));
    }

    #[test]
    fn test_debug_does_not_expose_key() {
        let debug_str = format!("{:?}", test_client());
        assert!(debug_str.contains("LocalSigningClient"));
        assert!(!debug_str.contains(TEST_PRIVATE_KEY));
    }
}
