// SPDX-License-Identifier: MIT OR Apache-2.0
//! HTTP control-plane response types.

use serde::{Deserialize, Serialize};

/// Response body for `GET /healthz`.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Always `"ok"` — liveness only, no dependency checks.
    pub status: &'static str,
    /// The envelope contract version this process speaks.
    pub contract_version: &'static str,
}

/// Response body for `GET /readyz`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ReadyResponse {
    /// `false` once shutdown has begun; `true` once bootstrap completed.
    pub ready: bool,
}

/// One entry in the `GET /plugins` response: a plugin's queue name and
/// its worker pool's current per-worker backlog depth.
#[derive(Debug, Serialize, Deserialize)]
pub struct PluginSnapshot {
    /// The plugin's inbound queue name.
    pub queue: String,
    /// Backlog depth per worker, in worker order. Empty for a direct pool.
    pub backlog: Vec<usize>,
}

/// Response body for `POST /cancel/{sn}`.
#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    /// The serial number the cancel request targeted.
    pub sn: String,
    /// `true` if `sn` was tracked and its token was flipped; `false` if
    /// nothing was tracked under that serial number (already finished,
    /// or never existed).
    pub cancelled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plugin_snapshot_serializes_with_expected_keys() {
        let snapshot = PluginSnapshot { queue: "Q-dog".into(), backlog: vec![0, 2] };
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["queue"], "Q-dog");
        assert_eq!(json["backlog"], serde_json::json!([0, 2]));
    }

    #[test]
    fn cancel_response_round_trips() {
        let response = CancelResponse { sn: "sn-1".into(), cancelled: true };
        let json = serde_json::to_string(&response).unwrap();
        let back: CancelResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(back.sn, "sn-1");
        assert!(back.cancelled);
    }
}
