// SPDX-License-Identifier: MIT OR Apache-2.0

use rmi_envelope::Envelope;
use schemars::schema_for;
use serde_json::json;

fn envelope_schema() -> serde_json::Value {
    let schema = schema_for!(Envelope);
    serde_json::to_value(schema).expect("schema to value")
}

fn config_schema() -> serde_json::Value {
    let schema = schema_for!(rmi_config::Config);
    serde_json::to_value(schema).expect("schema to value")
}

#[test]
fn envelope_schema_is_generated() {
    let schema = envelope_schema();
    assert_eq!(
        schema.get("$schema").and_then(|v| v.as_str()),
        Some("https://json-schema.org/draft/2020-12/schema"),
    );
    assert!(schema.get("properties").is_some());
}

#[test]
fn example_envelope_validates_against_schema() {
    let schema = envelope_schema();
    let instance = json!({
        "sn": "sn-1",
        "version": "rmi/0.5",
        "request": {"classname": "Dog", "method": "bark"}
    });
    let validator = jsonschema::validator_for(&schema).expect("compile schema");
    assert!(validator.is_valid(&instance));
}

#[test]
fn envelope_missing_sn_fails_schema_validation() {
    let schema = envelope_schema();
    let instance = json!({ "version": "rmi/0.5" });
    let validator = jsonschema::validator_for(&schema).expect("compile schema");
    assert!(!validator.is_valid(&instance));
}

#[test]
fn config_schema_has_expected_properties() {
    let schema = config_schema();
    let props = schema.get("properties").expect("schema should have properties");
    assert!(props.get("plugins").is_some(), "schema should include 'plugins' property");
    assert!(props.get("control").is_some(), "schema should include 'control' property");
}

#[test]
fn example_config_validates_against_schema() {
    let schema = config_schema();
    let instance = json!({
        "messaging": {"url": "amqp://localhost", "authenticator": "hmac"},
        "plugins": {
            "dog": {"queue": "Q-dog", "pool": {"capacity": 4, "backlog": 16}}
        },
        "pending": {"dir": "/var/run/rmi-agent/pending"},
        "instance_lock": {"path": "/var/run/rmi-agent/rmi-agent.lock"},
        "control": {"bind_addr": "127.0.0.1:8089"}
    });
    let validator = jsonschema::validator_for(&schema).expect("compile schema");
    assert!(validator.is_valid(&instance));
}
