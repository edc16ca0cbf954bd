//! EIP-712 typed data envelopes.
//!
//! Builds the `{domain, types, primaryType, message}` payload submitted with an
//! `eth_signTypedData_v4` request. The canonical `EIP712Domain` type is always
//! supplied by this module; callers only declare their own struct types.

use alloy_primitives::{address, Address};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

use crate::{Error, Result};

/// Name of the standard domain type.
pub const EIP712_DOMAIN_TYPE: &str = "EIP712Domain";

/// Domain name used by the example dapp.
pub const EXAMPLE_DOMAIN_NAME: &str = "HelloDapp";

/// Domain version used by the example dapp.
pub const EXAMPLE_DOMAIN_VERSION: &str = "1";

/// Contract that verifies signatures for the example dapp.
pub const EXAMPLE_VERIFYING_CONTRACT: Address =
    address!("0x1fF1Da912b679b6fddF8900ddB8E7A10111762f2");

/// Primary type of the example schema.
pub const EXAMPLE_PRIMARY_TYPE: &str = "MyStruct";

/// A single `{name, type}` field declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeField {
    /// Field name as it appears in the message.
    pub name: String,
    /// Solidity type of the field (e.g. "uint256", "address", "MyStruct[]").
    #[serde(rename = "type")]
    pub type_name: String,
}

impl TypeField {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
        }
    }
}

/// Caller-declared struct types, keyed by type name.
pub type TypeSchema = BTreeMap<String, Vec<TypeField>>;

/// The domain separator fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DomainDescriptor {
    /// Human-readable name of the signing domain.
    pub name: String,
    /// Current major version of the signing domain.
    pub version: String,
    /// EIP-155 chain ID.
    pub chain_id: u64,
    /// Contract that will verify the signature.
    pub verifying_contract: Address,
}

impl DomainDescriptor {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        chain_id: u64,
        verifying_contract: Address,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            chain_id,
            verifying_contract,
        }
    }

    /// Domain of the example dapp on the given chain.
    pub fn example(chain_id: u64) -> Self {
        Self::new(
            EXAMPLE_DOMAIN_NAME,
            EXAMPLE_DOMAIN_VERSION,
            chain_id,
            EXAMPLE_VERIFYING_CONTRACT,
        )
    }
}

/// The canonical four-field `EIP712Domain` definition.
///
/// Field order is part of the domain type hash, so it must not change.
pub fn canonical_domain_fields() -> Vec<TypeField> {
    vec![
        TypeField::new("name", "string"),
        TypeField::new("version", "string"),
        TypeField::new("chainId", "uint256"),
        TypeField::new("verifyingContract", "address"),
    ]
}

/// Example schema: `MyStruct(uint256 someValue,string someString)`.
pub fn example_schema() -> TypeSchema {
    let mut types = TypeSchema::new();
    types.insert(
        EXAMPLE_PRIMARY_TYPE.to_string(),
        vec![
            TypeField::new("someValue", "uint256"),
            TypeField::new("someString", "string"),
        ],
    );
    types
}

/// Example message matching [`example_schema`].
pub fn example_message(some_value: &str, some_string: &str) -> Map<String, Value> {
    let mut message = Map::new();
    message.insert("someValue".to_string(), Value::String(some_value.to_string()));
    message.insert("someString".to_string(), Value::String(some_string.to_string()));
    message
}

/// The `types` section of an envelope.
///
/// `EIP712Domain` is held separately so it always serializes first and can
/// never be replaced by a caller type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeTypes {
    #[serde(rename = "EIP712Domain")]
    pub eip712_domain: Vec<TypeField>,
    #[serde(flatten)]
    pub custom: TypeSchema,
}

impl EnvelopeTypes {
    /// Look up a type by name, including `EIP712Domain`.
    pub fn get(&self, name: &str) -> Option<&[TypeField]> {
        if name == EIP712_DOMAIN_TYPE {
            Some(&self.eip712_domain)
        } else {
            self.custom.get(name).map(Vec::as_slice)
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// All type names, `EIP712Domain` first.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        std::iter::once(EIP712_DOMAIN_TYPE).chain(self.custom.keys().map(String::as_str))
    }
}

/// The full payload for `eth_signTypedData_v4`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypedDataEnvelope {
    pub domain: DomainDescriptor,
    pub types: EnvelopeTypes,
    pub primary_type: String,
    pub message: Map<String, Value>,
}

impl TypedDataEnvelope {
    /// Serialize to the JSON string sent as the second request parameter.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Convert into alloy's dynamic typed data for local signing or hashing.
    pub fn to_alloy(&self) -> Result<alloy_dyn_abi::TypedData> {
        let value = serde_json::to_value(self)?;
        Ok(serde_json::from_value(value)?)
    }

    /// Check the envelope for the malformed states a signing client would reject.
    ///
    /// Catches a dangling `primaryType`, message keys that disagree with the
    /// primary type's fields, and struct fields referencing undeclared types.
    pub fn validate(&self) -> Result<()> {
        // The domain type is never a valid primary type.
        let fields = self
            .types
            .custom
            .get(&self.primary_type)
            .ok_or_else(|| Error::TypedData {
                message: format!("primaryType '{}' is not declared in types", self.primary_type),
            })?;

        let declared: BTreeSet<&str> = fields.iter().map(|f| f.name.as_str()).collect();
        let provided: BTreeSet<&str> = self.message.keys().map(String::as_str).collect();

        if let Some(extra) = provided.difference(&declared).next() {
            return Err(Error::TypedData {
                message: format!(
                    "message field '{}' is not declared on '{}'",
                    extra, self.primary_type
                ),
            });
        }
        if let Some(missing) = declared.difference(&provided).next() {
            return Err(Error::TypedData {
                message: format!(
                    "message is missing field '{}' of '{}'",
                    missing, self.primary_type
                ),
            });
        }

        for (type_name, fields) in &self.types.custom {
            for field in fields {
                let base = strip_array_suffix(&field.type_name);
                if !is_elementary_type(base) && !self.types.contains(base) {
                    return Err(Error::TypedData {
                        message: format!(
                            "field '{}.{}' references undeclared type '{}'",
                            type_name, field.name, base
                        ),
                    });
                }
            }
        }

        Ok(())
    }
}

/// Builds envelopes for a fixed domain and schema.
#[derive(Debug, Clone)]
pub struct TypedDataBuilder {
    domain: DomainDescriptor,
    custom_types: TypeSchema,
}

impl TypedDataBuilder {
    pub fn new(domain: DomainDescriptor, custom_types: TypeSchema) -> Self {
        Self {
            domain,
            custom_types,
        }
    }

    /// Builder for the example dapp on the given chain.
    pub fn example(chain_id: u64) -> Self {
        Self::new(DomainDescriptor::example(chain_id), example_schema())
    }

    /// Wrap a message in an envelope with the given primary type.
    pub fn envelope(
        &self,
        primary_type: impl Into<String>,
        message: Map<String, Value>,
    ) -> TypedDataEnvelope {
        build(
            self.domain.clone(),
            self.custom_types.clone(),
            primary_type,
            message,
        )
    }
}

/// Merge the canonical domain type, caller types and a message into an envelope.
///
/// A caller-supplied `EIP712Domain` entry is discarded in favour of the
/// canonical definition.
pub fn build(
    domain: DomainDescriptor,
    mut custom_types: TypeSchema,
    primary_type: impl Into<String>,
    message: Map<String, Value>,
) -> TypedDataEnvelope {
    if custom_types.remove(EIP712_DOMAIN_TYPE).is_some() {
        warn!("Ignoring caller-supplied EIP712Domain type; using canonical definition");
    }

    TypedDataEnvelope {
        domain,
        types: EnvelopeTypes {
            eip712_domain: canonical_domain_fields(),
            custom: custom_types,
        },
        primary_type: primary_type.into(),
        message,
    }
}

fn strip_array_suffix(type_name: &str) -> &str {
    let mut base = type_name;
    while let Some(idx) = base.rfind('[') {
        if !base.ends_with(']') {
            break;
        }
        base = &base[..idx];
    }
    base
}

fn is_elementary_type(type_name: &str) -> bool {
    match type_name {
        "address" | "bool" | "string" | "bytes" | "uint" | "int" => return true,
        _ => {}
    }

    let sized = |prefix: &str, valid: fn(u32) -> bool| {
        type_name
            .strip_prefix(prefix)
            .and_then(|bits| bits.parse::<u32>().ok())
            .is_some_and(valid)
    };

    sized("bytes", |n| (1..=32).contains(&n))
        || sized("uint", |n| n % 8 == 0 && (8..=256).contains(&n))
        || sized("int", |n| n % 8 == 0 && (8..=256).contains(&n))
}
