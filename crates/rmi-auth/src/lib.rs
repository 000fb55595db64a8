// SPDX-License-Identifier: MIT OR Apache-2.0
//! Pluggable envelope signing and verification.
//!
//! An [`Authenticator`] is an optional hook: with none configured every
//! envelope is accepted and outbound envelopes are left unsigned. When one
//! is configured, [`sign`] attaches a `signature` field on the way out and
//! [`is_valid`] checks it on the way in, using `routing[0]` as the claimed
//! signer identity.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use hmac::{Hmac, Mac};
use rmi_envelope::Envelope;
use rmi_error::{ErrorCode, RmiError};
use sha2::Sha256;

/// Signs outbound envelopes and validates inbound ones.
///
/// Implementations are expected to be cheap to invoke per-message; callers
/// hold them behind an `Arc` and share across worker tasks.
pub trait Authenticator: Send + Sync {
    /// Sign `message` (the canonical bytes of an envelope with no
    /// `signature` field) and return the signature to attach.
    fn sign(&self, message: &[u8]) -> Result<String, RmiError>;

    /// Validate `signature` over `message`, claimed to originate from `origin`.
    fn is_valid(&self, origin: &str, message: &[u8], signature: &str) -> bool;
}

/// Sign `envelope` with `authenticator`, if any.
///
/// On signing failure the envelope is returned unmodified and the failure
/// is logged at debug level — a bad authenticator must never block traffic
/// outright, matching the pass-through behavior of an unconfigured one.
pub fn sign(authenticator: Option<&dyn Authenticator>, envelope: &Envelope) -> Envelope {
    let Some(auth) = authenticator else {
        return envelope.clone();
    };
    let unsigned = envelope.without_signature();
    match unsigned
        .encode()
        .map_err(|e| e)
        .and_then(|bytes| auth.sign(&bytes).map(|sig| (unsigned.clone(), sig)))
    {
        Ok((mut e, sig)) => {
            e.signature = Some(sig);
            e
        }
        Err(err) => {
            tracing::debug!(sn = %envelope.sn, error = %err, "envelope signing failed, sending unsigned");
            envelope.clone()
        }
    }
}

/// Validate `envelope`'s signature using `authenticator`, if any.
///
/// Returns `true` with no authenticator configured. An envelope with no
/// `routing[0]` or no `signature` is rejected once an authenticator is
/// configured, since there is nothing to validate against.
pub fn is_valid(authenticator: Option<&dyn Authenticator>, envelope: &Envelope) -> bool {
    let Some(auth) = authenticator else {
        return true;
    };
    let origin = match envelope.routing.first() {
        Some(o) => o,
        None => return false,
    };
    let signature = match &envelope.signature {
        Some(s) => s,
        None => return false,
    };
    let unsigned = envelope.without_signature();
    let bytes = match unsigned.encode() {
        Ok(b) => b,
        Err(_) => return false,
    };
    let valid = auth.is_valid(origin, &bytes, signature);
    if !valid {
        tracing::info!(sn = %envelope.sn, signature = %signature, "message rejected: invalid signature");
    }
    valid
}

type HmacSha256 = Hmac<Sha256>;

/// An [`Authenticator`] backed by a single shared HMAC-SHA256 key.
///
/// Every party trusts the same key; `origin` is accepted but not used to
/// select a per-sender key, matching a single-tenant deployment.
pub struct HmacAuthenticator {
    key: Vec<u8>,
}

impl HmacAuthenticator {
    /// Build an authenticator from a raw shared secret.
    #[must_use]
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }

    fn mac(&self) -> Result<HmacSha256, RmiError> {
        HmacSha256::new_from_slice(&self.key)
            .map_err(|e| RmiError::new(ErrorCode::Internal, "invalid HMAC key length").with_source(e))
    }
}

impl Authenticator for HmacAuthenticator {
    fn sign(&self, message: &[u8]) -> Result<String, RmiError> {
        let mut mac = self.mac()?;
        mac.update(message);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn is_valid(&self, _origin: &str, message: &[u8], signature: &str) -> bool {
        let Ok(expected) = hex::decode(signature) else {
            return false;
        };
        let Ok(mut mac) = self.mac() else {
            return false;
        };
        mac.update(message);
        mac.verify_slice(&expected).is_ok()
    }
}
