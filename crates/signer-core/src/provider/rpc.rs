//! JSON-RPC signing client for a remote vault.
//!
//! Requests are JSON-RPC 2.0 POSTs. Signing and account requests go to the
//! vault API, authenticated with the API user token and a payload signature.
//! Chain reads go to the public RPC node and never carry credentials. The
//! "connect" event is emitted once an `eth_chainId` probe confirms the
//! configured chain; the "disconnect" event on the first transport failure or
//! failed heartbeat.

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use url::Url;

use super::auth::{PayloadAuthenticator, SIGNATURE_HEADER, TIMESTAMP_HEADER};
use super::{
    codes, publish_disconnect, ClientFactory, ConnectInfo, ConnectionState, DisconnectInfo,
    ProviderRpcError, RpcRequest, SigningClient, ETH_ACCOUNTS, ETH_CHAIN_ID, SIGN_TYPED_DATA_V4,
};
use crate::config::ProviderConfig;
use crate::{Error, Result};

/// Header forwarding the prediction-skip flag.
pub const SKIP_PREDICTION_HEADER: &str = "x-skip-prediction";

/// Methods that need the vault key or account list.
const VAULT_METHODS: &[&str] = &[
    SIGN_TYPED_DATA_V4,
    ETH_ACCOUNTS,
    "eth_requestAccounts",
    "eth_sign",
    "personal_sign",
    "eth_signTypedData",
    "eth_signTypedData_v3",
    "eth_signTransaction",
    "eth_sendTransaction",
];

fn is_vault_method(method: &str) -> bool {
    VAULT_METHODS.contains(&method)
}

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: &'a [Value],
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<ProviderRpcError>,
}

/// Signing client backed by the vault API and a chain RPC node.
pub struct RpcSigningClient {
    inner: Arc<Inner>,
}

struct Inner {
    http_client: reqwest::Client,
    api_url: Url,
    rpc_url: Url,
    api_user_token: String,
    authenticator: PayloadAuthenticator,
    skip_prediction: bool,
    expected_chain_id: u64,
    next_id: AtomicU64,
    state: watch::Sender<ConnectionState>,
}

impl RpcSigningClient {
    /// Build a client and start the connection probe.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn connect(config: &ProviderConfig) -> Result<Self> {
        let authenticator =
            PayloadAuthenticator::from_pem(config.credentials.api_payload_sign_key())?;

        let http_client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        let (state, _) = watch::channel(ConnectionState::Connecting);

        let inner = Arc::new(Inner {
            http_client,
            api_url: config.api_url.clone(),
            rpc_url: config.rpc_url.clone(),
            api_user_token: config.credentials.api_user_token().to_string(),
            authenticator,
            skip_prediction: config.skip_prediction,
            expected_chain_id: config.chain_id,
            next_id: AtomicU64::new(1),
            state,
        });

        debug!(
            api_url = %inner.api_url,
            rpc_url = %inner.rpc_url,
            chain_id = inner.expected_chain_id,
            skip_prediction = inner.skip_prediction,
            "Connecting signing client"
        );

        let heartbeat = config.heartbeat_interval;
        let probe = Arc::clone(&inner);
        tokio::spawn(async move {
            if Inner::probe_connect(&probe).await {
                if let Some(interval) = heartbeat {
                    let weak = Arc::downgrade(&probe);
                    drop(probe);
                    Inner::heartbeat_loop(weak, interval).await;
                }
            }
        });

        Ok(Self { inner })
    }
}

#[async_trait]
impl SigningClient for RpcSigningClient {
    fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    async fn request(&self, request: RpcRequest) -> Result<Value> {
        self.inner.call(&request.method, &request.params).await
    }
}

impl Inner {
    async fn call(&self, method: &str, params: &[Value]) -> Result<Value> {
        let disconnected = match &*self.state.borrow() {
            ConnectionState::Disconnected(info) => Some(info.reason.clone()),
            _ => None,
        };
        if let Some(reason) = disconnected {
            return Err(ProviderRpcError::new(codes::DISCONNECTED, reason).into());
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = serde_json::to_string(&JsonRpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        })?;

        let request = if is_vault_method(method) {
            self.vault_request(&body)
        } else {
            self.http_client.post(self.rpc_url.clone())
        };

        let response = match request
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(method = method, error = %e, "Signing client transport failure");
                self.disconnect(DisconnectInfo::new(format!("transport failure: {}", e)));
                return Err(Error::Http(e));
            }
        };

        let status = response.status();
        let text = response.text().await?;

        match serde_json::from_str::<JsonRpcResponse>(&text) {
            Ok(JsonRpcResponse {
                error: Some(error), ..
            }) => {
                debug!(method = method, code = error.code, "Signing client returned an error");
                Err(error.into())
            }
            Ok(JsonRpcResponse { result, .. }) if status.is_success() => {
                Ok(result.unwrap_or(Value::Null))
            }
            _ => {
                let code = match status.as_u16() {
                    401 | 403 => codes::UNAUTHORIZED,
                    _ => codes::INTERNAL_ERROR,
                };
                Err(ProviderRpcError::new(code, format!("HTTP {}: {}", status, text)).into())
            }
        }
    }

    /// POST to the vault API with the bearer token and payload signature.
    fn vault_request(&self, body: &str) -> reqwest::RequestBuilder {
        let timestamp = chrono::Utc::now().timestamp_millis();
        let signature = self
            .authenticator
            .sign(self.api_url.path(), timestamp, body);

        self.http_client
            .post(self.api_url.clone())
            .bearer_auth(&self.api_user_token)
            .header(TIMESTAMP_HEADER, timestamp.to_string())
            .header(SIGNATURE_HEADER, signature)
            .header(SKIP_PREDICTION_HEADER, self.skip_prediction.to_string())
    }

    async fn chain_id(&self) -> Result<u64> {
        let result = self.call(ETH_CHAIN_ID, &[]).await?;
        parse_quantity(&result).ok_or_else(|| Error::UnexpectedResponse {
            method: ETH_CHAIN_ID.to_string(),
            message: format!("expected hex quantity, got {}", result),
        })
    }

    /// Probe the endpoint and publish the outcome. Returns `true` on connect.
    async fn probe_connect(&self) -> bool {
        match self.chain_id().await {
            Ok(chain_id) if chain_id == self.expected_chain_id => {
                let connected = self.state.send_if_modified(|current| {
                    if *current == ConnectionState::Connecting {
                        *current = ConnectionState::Connected(ConnectInfo { chain_id });
                        true
                    } else {
                        false
                    }
                });
                if connected {
                    info!(chain_id = chain_id, rpc_url = %self.rpc_url, "Signing client connected");
                }
                connected
            }
            Ok(chain_id) => {
                self.disconnect(DisconnectInfo::chain_mismatch(format!(
                    "endpoint reports chain {}, expected {}",
                    chain_id, self.expected_chain_id
                )));
                false
            }
            Err(e) => {
                self.disconnect(DisconnectInfo::new(format!("connection probe failed: {}", e)));
                false
            }
        }
    }

    async fn heartbeat_loop(inner: Weak<Inner>, interval: Duration) {
        let mut tick = tokio::time::interval(interval);
        tick.tick().await;

        loop {
            tick.tick().await;

            let Some(inner) = inner.upgrade() else {
                return;
            };
            let disconnected = matches!(*inner.state.borrow(), ConnectionState::Disconnected(_));
            if disconnected {
                return;
            }

            match inner.chain_id().await {
                Ok(chain_id) if chain_id == inner.expected_chain_id => {
                    debug!(chain_id = chain_id, "Heartbeat ok");
                }
                Ok(chain_id) => {
                    inner.disconnect(DisconnectInfo::chain_mismatch(format!(
                        "endpoint switched to chain {}",
                        chain_id
                    )));
                    return;
                }
                Err(e) => {
                    inner.disconnect(DisconnectInfo::new(format!("heartbeat failed: {}", e)));
                    return;
                }
            }
        }
    }

    fn disconnect(&self, info: DisconnectInfo) {
        let code = info.code;
        let reason = info.reason.clone();
        if publish_disconnect(&self.state, info) {
            warn!(code = code, reason = %reason, "Signing client disconnected");
        }
    }
}

/// Parse a JSON-RPC hex quantity such as `"0x2105"`.
fn parse_quantity(value: &Value) -> Option<u64> {
    match value {
        Value::String(s) => {
            let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X"))?;
            u64::from_str_radix(digits, 16).ok()
        }
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

/// Creates [`RpcSigningClient`] instances from one static configuration.
#[derive(Debug, Clone)]
pub struct RpcClientFactory {
    config: ProviderConfig,
}

impl RpcClientFactory {
    pub fn new(config: ProviderConfig) -> Self {
        Self { config }
    }
}

impl ClientFactory for RpcClientFactory {
    fn create(&self) -> Result<Arc<dyn SigningClient>> {
        Ok(Arc::new(RpcSigningClient::connect(&self.config)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, Credentials, StaticSettings};
    use crate::provider::auth::tests::{verify, TEST_SEC1_PEM};
    use crate::provider::auth::signing_payload;
    use crate::provider::{wait_for_event, EventKind, ProviderEvent};
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode, Uri};
    use axum::routing::post;
    use axum::{Json, Router};
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    struct SeenRequest {
        path: String,
        headers: HeaderMap,
        raw: String,
    }

    #[derive(Clone)]
    struct FakeBackend {
        chain_id: &'static str,
        seen: Arc<Mutex<Vec<SeenRequest>>>,
    }

    impl FakeBackend {
        fn requests_to(&self, path: &str) -> Vec<SeenRequest> {
            self.seen
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.path == path)
                .cloned()
                .collect()
        }
    }

    async fn handle(
        State(backend): State<FakeBackend>,
        uri: Uri,
        headers: HeaderMap,
        raw: String,
    ) -> (StatusCode, Json<Value>) {
        let body: Value = serde_json::from_str(&raw).unwrap();
        backend.seen.lock().unwrap().push(SeenRequest {
            path: uri.path().to_string(),
            headers,
            raw,
        });

        let id = body["id"].clone();
        let reply = match body["method"].as_str() {
            Some("eth_chainId") => json!({"jsonrpc": "2.0", "id": id, "result": backend.chain_id}),
            Some("eth_signTypedData_v4") => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": {"code": 4001, "message": "User rejected the request"}
            }),
            _ => json!({"jsonrpc": "2.0", "id": id, "result": "0xdeadbeef"}),
        };
        (StatusCode::OK, Json(reply))
    }

    /// Serves `/vault` and `/rpc` from one listener; returns the base URL.
    async fn spawn_backend(chain_id: &'static str) -> (Url, FakeBackend) {
        let backend = FakeBackend {
            chain_id,
            seen: Arc::new(Mutex::new(Vec::new())),
        };
        let app = Router::new()
            .route("/rpc", post(handle))
            .route("/vault", post(handle))
            .with_state(backend.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (Url::parse(&format!("http://{}/", addr)).unwrap(), backend)
    }

    fn provider_config(base: &Url) -> ProviderConfig {
        let mut settings = StaticSettings::test_settings();
        settings.api_url = base.join("vault").unwrap().to_string();
        settings.rpc_url = base.join("rpc").unwrap().to_string();
        let creds = Credentials::new("test-token".to_string(), TEST_SEC1_PEM.to_string()).unwrap();
        Config::from_parts(settings, creds).unwrap().provider
    }

    async fn connected_client(base: &Url) -> RpcSigningClient {
        let client = RpcSigningClient::connect(&provider_config(base)).unwrap();
        tokio::time::timeout(
            Duration::from_secs(5),
            client.wait_for_event(EventKind::Connect),
        )
        .await
        .unwrap()
        .unwrap();
        client
    }

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity(&json!("0x2105")), Some(8453));
        assert_eq!(parse_quantity(&json!(137)), Some(137));
        assert_eq!(parse_quantity(&json!("8453")), None);
        assert_eq!(parse_quantity(&json!(null)), None);
    }

    #[test]
    fn test_method_routing() {
        assert!(is_vault_method(SIGN_TYPED_DATA_V4));
        assert!(is_vault_method(ETH_ACCOUNTS));
        assert!(!is_vault_method(ETH_CHAIN_ID));
        assert!(!is_vault_method("eth_blockNumber"));
    }

    #[tokio::test]
    async fn test_connect_probe_uses_rpc_without_credentials() {
        let (base, backend) = spawn_backend("0x2105").await;
        let client = RpcSigningClient::connect(&provider_config(&base)).unwrap();

        let event = tokio::time::timeout(
            Duration::from_secs(5),
            client.wait_for_event(EventKind::Connect),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(event, ProviderEvent::Connect(ConnectInfo { chain_id: 8453 }));

        let probes = backend.requests_to("/rpc");
        assert_eq!(probes.len(), 1);
        let body: Value = serde_json::from_str(&probes[0].raw).unwrap();
        assert_eq!(body["method"], "eth_chainId");
        assert_eq!(body["jsonrpc"], "2.0");
        assert!(probes[0].headers.get("authorization").is_none());
        assert!(probes[0].headers.get(SIGNATURE_HEADER).is_none());
        assert!(probes[0].headers.get(TIMESTAMP_HEADER).is_none());
        assert!(backend.requests_to("/vault").is_empty());
    }

    #[tokio::test]
    async fn test_signing_goes_to_vault_with_credentials() {
        let (base, backend) = spawn_backend("0x2105").await;
        let client = connected_client(&base).await;

        let _ = client
            .request(RpcRequest::new(
                SIGN_TYPED_DATA_V4,
                vec![json!("0x00"), json!("{}")],
            ))
            .await;
        client
            .request(RpcRequest::new("eth_blockNumber", vec![]))
            .await
            .unwrap();

        let vault = backend.requests_to("/vault");
        assert_eq!(vault.len(), 1);
        let SeenRequest { headers, raw, .. } = &vault[0];
        let body: Value = serde_json::from_str(raw).unwrap();
        assert_eq!(body["method"], SIGN_TYPED_DATA_V4);
        assert_eq!(headers["authorization"], "Bearer test-token");
        assert_eq!(headers[SKIP_PREDICTION_HEADER], "false");

        let timestamp: i64 = headers[TIMESTAMP_HEADER].to_str().unwrap().parse().unwrap();
        let payload = signing_payload("/vault", timestamp, raw);
        let auth = PayloadAuthenticator::from_pem(TEST_SEC1_PEM).unwrap();
        assert!(verify(
            &auth.verifying_key(),
            &payload,
            headers[SIGNATURE_HEADER].to_str().unwrap()
        ));

        // The public node never sees the token, whatever was sent to it.
        let reads = backend.requests_to("/rpc");
        assert_eq!(reads.len(), 2);
        assert!(reads
            .iter()
            .all(|r| r.headers.get("authorization").is_none()));
        assert!(reads.iter().all(|r| !r.raw.contains(SIGN_TYPED_DATA_V4)));
    }

    #[tokio::test]
    async fn test_chain_mismatch_disconnects() {
        let (base, _backend) = spawn_backend("0x1").await;
        let client = RpcSigningClient::connect(&provider_config(&base)).unwrap();

        let err = tokio::time::timeout(
            Duration::from_secs(5),
            client.wait_for_event(EventKind::Connect),
        )
        .await
        .unwrap()
        .unwrap_err();
        assert!(err.to_string().contains("expected 8453"));

        let mut rx = client.subscribe();
        let event = wait_for_event(&mut rx, EventKind::Disconnect).await.unwrap();
        assert!(matches!(
            event,
            ProviderEvent::Disconnect(DisconnectInfo { code: codes::CHAIN_DISCONNECTED, .. })
        ));
    }

    #[tokio::test]
    async fn test_rpc_error_surfaced() {
        let (base, _backend) = spawn_backend("0x2105").await;
        let client = connected_client(&base).await;

        let err = client
            .request(RpcRequest::new(
                SIGN_TYPED_DATA_V4,
                vec![json!("0x00"), json!("{}")],
            ))
            .await
            .unwrap_err();

        match err {
            Error::Rpc(rpc) => {
                assert!(rpc.is_user_rejection());
                assert_eq!(rpc.message, "User rejected the request");
            }
            other => panic!("expected RPC error, got {other:?}"),
        }

        // An RPC-level error is not a disconnect.
        assert!(matches!(
            *client.subscribe().borrow(),
            ConnectionState::Connected(_)
        ));
    }

    #[tokio::test]
    async fn test_transport_failure_disconnects() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = Url::parse(&format!("http://{}/", listener.local_addr().unwrap())).unwrap();
        drop(listener);

        let client = RpcSigningClient::connect(&provider_config(&base)).unwrap();
        let mut rx = client.subscribe();

        let event = tokio::time::timeout(
            Duration::from_secs(5),
            wait_for_event(&mut rx, EventKind::Disconnect),
        )
        .await
        .unwrap()
        .unwrap();
        assert!(matches!(event, ProviderEvent::Disconnect(_)));

        let err = client.request(RpcRequest::chain_id()).await.unwrap_err();
        assert!(matches!(err, Error::Rpc(ref rpc) if rpc.is_disconnect()));
    }

    #[tokio::test]
    async fn test_invalid_pem_fails_construction() {
        let (base, _backend) = spawn_backend("0x2105").await;
        let mut config = provider_config(&base);
        config.credentials = Credentials::new("t".to_string(), "garbage".to_string()).unwrap();

        assert!(matches!(
            RpcSigningClient::connect(&config),
            Err(Error::PayloadAuth { .. })
        ));
    }
}
