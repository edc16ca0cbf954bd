//! Configuration management for the signing flow.
//!
//! Static settings (chain, signer address, endpoints, lifecycle timeouts)
//! come from an optional `signer.toml` overridden by `SIGNER_*` environment
//! variables. The two secrets come from the environment and a PEM file only.

use crate::{Error, Result};
use alloy_primitives::Address;
use serde::Deserialize;
use std::env;
use std::fmt;
use std::path::Path;
use std::time::Duration;
use url::Url;

/// Environment variable holding the API user bearer token.
pub const API_USER_TOKEN_VAR: &str = "FORDEFI_API_USER_TOKEN";

/// Environment variable pointing at an alternative settings file.
pub const CONFIG_FILE_VAR: &str = "SIGNER_CONFIG";

/// Base mainnet chain ID.
pub const BASE_CHAIN_ID: u64 = 8453;

const DEFAULT_SIGNER_ADDRESS: &str = "0x8BFCF9e2764BC84DE4BBd0a0f5AAF19F47027A73";
const DEFAULT_RPC_URL: &str = "https://base.llamarpc.com";
const DEFAULT_API_URL: &str = "https://api.fordefi.com/";
const DEFAULT_PRIVATE_KEY_PATH: &str = "./fordefi_secret/private.pem";

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub provider: ProviderConfig,
    pub lifecycle: LifecycleSettings,
}

/// Static configuration used to construct every signing client instance.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub chain_id: u64,
    /// Vault address that signs the message.
    pub signer_address: Address,
    /// Vault API endpoint. The only endpoint that receives credentials.
    pub api_url: Url,
    /// Public node for unauthenticated chain reads.
    pub rpc_url: Url,
    pub skip_prediction: bool,
    pub request_timeout: Duration,
    /// Interval between liveness probes; `None` disables them.
    pub heartbeat_interval: Option<Duration>,
    pub credentials: Credentials,
}

#[derive(Debug, Clone)]
pub struct LifecycleSettings {
    pub reconnect_on_disconnect: bool,
    /// `None` waits for the connect event indefinitely.
    pub connect_timeout: Option<Duration>,
}

/// The two out-of-band secrets. `Debug` never prints them.
#[derive(Clone)]
pub struct Credentials {
    api_user_token: String,
    api_payload_sign_key: String,
}

impl Credentials {
    pub fn new(api_user_token: String, api_payload_sign_key: String) -> Result<Self> {
        if api_user_token.trim().is_empty() {
            return Err(Error::Config {
                message: format!("{} is not set", API_USER_TOKEN_VAR),
            });
        }
        if api_payload_sign_key.trim().is_empty() {
            return Err(Error::Config {
                message: "PEM private key is empty".to_string(),
            });
        }
        Ok(Self {
            api_user_token,
            api_payload_sign_key,
        })
    }

    pub fn api_user_token(&self) -> &str {
        &self.api_user_token
    }

    /// PEM-encoded P-256 key used to sign API payloads.
    pub fn api_payload_sign_key(&self) -> &str {
        &self.api_payload_sign_key
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("api_user_token", &"<redacted>")
            .field("api_payload_sign_key", &"<redacted>")
            .finish()
    }
}

/// Non-secret settings as read from file and environment.
#[derive(Debug, Clone, Deserialize)]
pub struct StaticSettings {
    #[serde(default = "default_chain_id")]
    pub chain_id: u64,
    #[serde(default = "default_signer_address")]
    pub signer_address: String,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,
    #[serde(default)]
    pub skip_prediction: bool,
    #[serde(default = "default_true")]
    pub reconnect_on_disconnect: bool,
    /// Zero disables the timeout.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Zero disables heartbeats.
    #[serde(default)]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_private_key_path")]
    pub private_key_path: String,
}

fn default_chain_id() -> u64 {
    BASE_CHAIN_ID
}

fn default_signer_address() -> String {
    DEFAULT_SIGNER_ADDRESS.to_string()
}

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

fn default_rpc_url() -> String {
    DEFAULT_RPC_URL.to_string()
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_private_key_path() -> String {
    DEFAULT_PRIVATE_KEY_PATH.to_string()
}

impl StaticSettings {
    /// Read settings from the optional settings file and `SIGNER_*` variables.
    pub fn load() -> Result<Self> {
        let file = env::var(CONFIG_FILE_VAR).unwrap_or_else(|_| "signer".to_string());

        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(&file).required(false))
            .add_source(::config::Environment::with_prefix("SIGNER").try_parsing(true))
            .build()?;

        Ok(settings.try_deserialize()?)
    }
}

impl Config {
    /// Load configuration from `.env`, the settings file and the environment.
    ///
    /// A missing API token or PEM key is a fatal startup error.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let settings = StaticSettings::load()?;
        let token = env::var(API_USER_TOKEN_VAR).ok();
        let credentials = load_credentials(token, Path::new(&settings.private_key_path))?;

        Self::from_parts(settings, credentials)
    }

    /// Assemble a configuration from already-loaded pieces.
    pub fn from_parts(settings: StaticSettings, credentials: Credentials) -> Result<Self> {
        let signer_address: Address =
            settings
                .signer_address
                .trim()
                .parse()
                .map_err(|e| Error::Config {
                    message: format!("Invalid signer address '{}': {}", settings.signer_address, e),
                })?;

        let api_url = parse_url("API", &settings.api_url)?;
        let rpc_url = parse_url("RPC", &settings.rpc_url)?;
        if api_url == rpc_url {
            return Err(Error::Config {
                message: "API URL and RPC URL must be different endpoints".to_string(),
            });
        }

        Ok(Self {
            provider: ProviderConfig {
                chain_id: settings.chain_id,
                signer_address,
                api_url,
                rpc_url,
                skip_prediction: settings.skip_prediction,
                request_timeout: Duration::from_secs(settings.request_timeout_secs),
                heartbeat_interval: non_zero_secs(settings.heartbeat_interval_secs),
                credentials,
            },
            lifecycle: LifecycleSettings {
                reconnect_on_disconnect: settings.reconnect_on_disconnect,
                connect_timeout: non_zero_secs(settings.connect_timeout_secs),
            },
        })
    }
}

/// Read the API token and the PEM key file.
pub fn load_credentials(api_user_token: Option<String>, pem_path: &Path) -> Result<Credentials> {
    let token = api_user_token.ok_or_else(|| Error::Config {
        message: format!("{} is not set", API_USER_TOKEN_VAR),
    })?;

    let pem = std::fs::read_to_string(pem_path).map_err(|e| Error::Config {
        message: format!(
            "PEM private key could not be read from {}: {}",
            pem_path.display(),
            e
        ),
    })?;

    Credentials::new(token, pem)
}

fn parse_url(label: &str, raw: &str) -> Result<Url> {
    Url::parse(raw.trim()).map_err(|e| Error::Config {
        message: format!("Invalid {} URL '{}': {}", label, raw, e),
    })
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

#[cfg(test)]
impl StaticSettings {
    pub fn test_settings() -> Self {
        Self {
            chain_id: BASE_CHAIN_ID,
            signer_address: default_signer_address(),
            api_url: "http://127.0.0.1:8545/vault".to_string(),
            rpc_url: "http://127.0.0.1:8545/rpc".to_string(),
            skip_prediction: false,
            reconnect_on_disconnect: true,
            connect_timeout_secs: 5,
            request_timeout_secs: 10,
            heartbeat_interval_secs: 0,
            private_key_path: default_private_key_path(),
        }
    }
}
