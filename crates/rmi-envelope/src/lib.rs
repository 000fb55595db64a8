// SPDX-License-Identifier: MIT OR Apache-2.0
//! Canonical envelope codec for the RMI execution core.
//!
//! The [`Envelope`] is the uniform document used for requests, status
//! updates, and replies. Encoding always sorts keys at every nesting level
//! (via [`serde_json::Map`]'s default `BTreeMap` backing) so that signed
//! bytes reproduce exactly across processes.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use chrono::{DateTime, Utc};
use rmi_error::{ErrorCode, RmiError};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Contract version embedded in every envelope. Requests carrying any other
/// value are rejected with [`ErrorCode::DocumentVersionMismatch`].
///
/// # Examples
///
/// ```
/// assert_eq!(rmi_envelope::CONTRACT_VERSION, "rmi/0.5");
/// ```
pub const CONTRACT_VERSION: &str = "rmi/0.5";

/// Reserved top-level key under which a computed signature is attached.
pub const SIGNATURE_KEY: &str = "signature";

/// The uniform wire document for requests, status updates, and replies.
///
/// Unknown top-level fields are preserved verbatim in `extra` and re-emitted
/// on encode, satisfying the round-trip property `decode(encode(e)) == e`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Envelope {
    /// Unique identifier for the originating request (caller-generated UUID).
    pub sn: String,
    /// Contract version; must equal [`CONTRACT_VERSION`].
    pub version: String,
    /// `[origin, destination]` addresses; `routing[0]` identifies the signer.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routing: Vec<String>,
    /// Reply destination address. Absent disables all status/reply emission.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replyto: Option<String>,
    /// Request payload; present only on request envelopes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<RequestBody>,
    /// Reply payload; present only on reply envelopes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ResultBody>,
    /// Lifecycle status; absent on final replies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    /// Optional validity window.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<Window>,
    /// Origin timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<DateTime<Utc>>,
    /// Opaque caller-supplied round-trip payload, echoed on every status/reply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Detached signature over the canonical bytes of the envelope with this
    /// key absent. Stripped before verification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// Any additional fields, preserved verbatim across decode/encode.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The `request` sub-document of a request envelope.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct RequestBody {
    /// Name of the class/object the method is resolved against.
    pub classname: String,
    /// Name of the method to invoke.
    pub method: String,
    /// Positional arguments.
    #[serde(default)]
    pub args: Vec<Value>,
    /// Keyword arguments.
    #[serde(default)]
    pub kws: Map<String, Value>,
    /// Additional fields injected by ingress (e.g. `inbound`), preserved.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The `result` sub-document of a reply envelope: either a return value or
/// a stringified exception, never both.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub enum ResultBody {
    /// Successful return value.
    #[serde(rename = "retval")]
    Retval(Value),
    /// Failure, formatted as a string traceback.
    #[serde(rename = "exval")]
    Exval(String),
}

/// Lifecycle status carried on non-final envelopes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// The request was accepted into the pending store.
    Accepted,
    /// The request was rejected before being persisted.
    Rejected,
    /// Dispatch has begun.
    Started,
    /// A progress update from inside the dispatched method.
    Progress,
}

/// A validity interval during which a request may execute.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Window {
    /// Earliest time at which the request may start executing.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub begin: Option<DateTime<Utc>>,
    /// Latest time at which the request is still valid to execute.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<DateTime<Utc>>,
}

impl Envelope {
    /// Build a minimal request envelope with a freshly generated `sn`.
    #[must_use]
    pub fn new_request(classname: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            sn: Uuid::new_v4().to_string(),
            version: CONTRACT_VERSION.to_string(),
            routing: Vec::new(),
            replyto: None,
            request: Some(RequestBody {
                classname: classname.into(),
                method: method.into(),
                args: Vec::new(),
                kws: Map::new(),
                extra: Map::new(),
            }),
            result: None,
            status: None,
            window: None,
            ts: Some(Utc::now()),
            data: None,
            signature: None,
            extra: Map::new(),
        }
    }

    /// Decode an envelope from JSON bytes.
    ///
    /// Fails with [`ErrorCode::DocumentInvalid`] on malformed JSON or a
    /// missing `sn`, and [`ErrorCode::DocumentVersionMismatch`] when
    /// `version` does not equal [`CONTRACT_VERSION`].
    pub fn decode(bytes: &[u8]) -> Result<Self, RmiError> {
        let env: Envelope = serde_json::from_slice(bytes).map_err(|e| {
            RmiError::new(ErrorCode::DocumentInvalid, "failed to decode envelope").with_source(e)
        })?;
        if env.sn.is_empty() {
            return Err(RmiError::new(ErrorCode::DocumentInvalid, "missing sn"));
        }
        if env.version != CONTRACT_VERSION {
            return Err(RmiError::new(
                ErrorCode::DocumentVersionMismatch,
                format!(
                    "unsupported version {:?}, expected {CONTRACT_VERSION:?}",
                    env.version
                ),
            )
            .with_context("sn", &env.sn));
        }
        Ok(env)
    }

    /// Encode to canonical JSON bytes: keys sorted at every nesting level.
    pub fn encode(&self) -> Result<Vec<u8>, RmiError> {
        canonical_json(self)
            .map(String::into_bytes)
            .map_err(|e| RmiError::new(ErrorCode::Internal, "failed to encode envelope").with_source(e))
    }

    /// Return a copy of this envelope with the `signature` field removed,
    /// suitable for both signing and verification input.
    #[must_use]
    pub fn without_signature(&self) -> Self {
        let mut e = self.clone();
        e.signature = None;
        e
    }

    /// Attach a signature, replacing any previous one.
    pub fn with_signature(mut self, signature: impl Into<String>) -> Self {
        self.signature = Some(signature.into());
        self
    }
}

/// Errors from envelope-level canonicalization (serialization only; decode
/// errors are represented as [`RmiError`]).
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON serialization failed.
    #[error("failed to serialize JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Produce deterministic JSON for hashing and signing.
///
/// Keys are sorted because [`serde_json::Map`] is backed by a `BTreeMap`
/// when the `preserve_order` feature is not enabled (this crate does not
/// enable it), so re-encoding a [`Value`] always emits keys in sorted
/// order regardless of the original field insertion order.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, CodecError> {
    let v = serde_json::to_value(value)?;
    Ok(serde_json::to_string(&v)?)
}

/// Compute the hex-encoded SHA-256 digest of `bytes`.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}
