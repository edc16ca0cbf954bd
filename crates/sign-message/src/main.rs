//! Sign Message
//!
//! Connects to the vault signing client, signs the example EIP-712 message
//! with `eth_signTypedData_v4` and prints the signature.

use anyhow::{Context, Result};
use clap::Parser;
use signer_core::config::Config;
use signer_core::lifecycle::{ConnectionLifecycle, LifecycleConfig, LifecycleState};
use signer_core::provider::RpcClientFactory;
use signer_core::typed_data::{example_message, TypedDataBuilder, EXAMPLE_PRIMARY_TYPE};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "sign-message", about = "Sign an EIP-712 message with a vault signer")]
struct Args {
    /// Value of `MyStruct.someValue` (uint256, decimal string).
    #[arg(long, default_value = "12345")]
    some_value: String,

    /// Value of `MyStruct.someString`.
    #[arg(long, default_value = "Hello EIP-712!")]
    some_string: String,

    /// Keep running after signing and report connection changes until Ctrl-C.
    #[arg(long)]
    watch: bool,

    /// Do not replace the client when it disconnects.
    #[arg(long)]
    no_reconnect: bool,

    /// Emit logs as JSON.
    #[arg(long, env = "LOG_JSON")]
    json_logs: bool,
}

fn init_logging(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "sign_message=info,signer_core=info,hyper=warn,reqwest=warn".into());
    let registry = tracing_subscriber::registry().with(filter);

    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.json_logs);

    // Missing secrets stop the process before any connection attempt
    let config = Config::from_env().context("Failed to load signer configuration")?;
    info!(
        chain_id = config.provider.chain_id,
        signer = %config.provider.signer_address,
        api_url = %config.provider.api_url,
        rpc_url = %config.provider.rpc_url,
        "Starting signer"
    );

    let factory = RpcClientFactory::new(config.provider.clone());
    let lifecycle = ConnectionLifecycle::new(
        Arc::new(factory),
        LifecycleConfig::from(&config.lifecycle),
    );

    let connected = lifecycle
        .start()
        .await
        .context("Signing client failed to connect")?;

    if config.lifecycle.reconnect_on_disconnect && !args.no_reconnect {
        lifecycle.on_disconnect()?;
    }

    let builder = TypedDataBuilder::example(connected.chain_id);
    let envelope = builder.envelope(
        EXAMPLE_PRIMARY_TYPE,
        example_message(&args.some_value, &args.some_string),
    );
    envelope.validate()?;

    let signature = match lifecycle
        .sign_once(&envelope, config.provider.signer_address)
        .await
    {
        Ok(signature) => signature,
        Err(e) => {
            error!(error = %e, "Signing request failed");
            lifecycle.shutdown();
            return Err(e.into());
        }
    };
    println!("Signature: {}", signature);

    if args.watch {
        watch_connection(&lifecycle).await;
    }

    lifecycle.shutdown();
    Ok(())
}

async fn watch_connection(lifecycle: &ConnectionLifecycle) {
    let mut states = lifecycle.subscribe_state();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                return;
            }
            changed = states.changed() => {
                if changed.is_err() {
                    return;
                }
                let state = states.borrow_and_update().clone();
                info!(state = ?state, "Connection state changed");
                if let LifecycleState::Failed { reason } = state {
                    error!(reason = %reason, "Signing client is permanently disconnected");
                    return;
                }
            }
        }
    }
}
