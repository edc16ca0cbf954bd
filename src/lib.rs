//! Vault Signer: EIP-712 signing through a vault-backed signing client.
//!
//! This root crate hosts the workspace integration tests. For actual
//! functionality, use the individual crates directly:
//!
//! - `signer-core`: typed data envelopes, the signing-client seam, the
//!   connection lifecycle, configuration
//! - `sign-message`: command-line signing flow

pub use signer_core as core;
pub use signer_core::{ConnectionLifecycle, TypedDataBuilder, TypedDataEnvelope};
