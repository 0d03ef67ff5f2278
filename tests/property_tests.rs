//! Property tests for the codec and the pure transfer math.

use hyperdesk_proto::{MessageType, PROTOCOL_VERSION, decode_message, encode_message};
use hyperdesk_transfer::limiter::{RetryPolicy, pacing_delay, retry_delay};
use proptest::prelude::*;
use serde_json::{Map, Value, json};
use std::time::Duration;

/// A payload satisfying `message_type`'s schema, with deterministic filler
/// values plus arbitrary extra fields.
fn schema_payload(message_type: MessageType, extras: &[(String, String)]) -> Map<String, Value> {
    let mut payload = Map::new();
    for field in message_type.required_fields() {
        // Booleans for flag-like fields, strings otherwise; the codec only
        // checks presence.
        let value = if field.starts_with("allow") || *field == "approval_required" {
            json!(true)
        } else {
            json!(format!("{field}-value"))
        };
        payload.insert((*field).to_string(), value);
    }
    for (key, value) in extras {
        payload.entry(format!("x_{key}")).or_insert(json!(value));
    }
    payload
}

fn any_message_type() -> impl Strategy<Value = MessageType> {
    (0..MessageType::ALL.len()).prop_map(|i| MessageType::ALL[i])
}

proptest! {
    #[test]
    fn prop_encode_decode_round_trips(
        message_type in any_message_type(),
        request_id in proptest::option::of("[a-z0-9]{1,12}"),
        extras in proptest::collection::vec(("[a-z]{1,8}", "[a-z0-9 ]{0,16}"), 0..4),
    ) {
        let payload = schema_payload(message_type, &extras);
        let frame = encode_message(message_type, payload.clone(), request_id.as_deref()).unwrap();
        let envelope = decode_message(&frame).unwrap();

        prop_assert_eq!(envelope.version, PROTOCOL_VERSION);
        prop_assert_eq!(envelope.message_type, message_type);
        prop_assert_eq!(envelope.request_id, request_id);
        // Every payload field survives, extras included.
        for (key, value) in &payload {
            prop_assert_eq!(envelope.payload.get(key), Some(value));
        }
        // Re-encoding the decoded payload yields a decodable, equal message.
        let reencoded = encode_message(message_type, envelope.payload.clone(), None).unwrap();
        let again = decode_message(&reencoded).unwrap();
        prop_assert_eq!(again.payload, envelope.payload);
    }

    #[test]
    fn prop_dropping_any_required_field_fails_decode(
        message_type in any_message_type(),
        pick in any::<prop::sample::Index>(),
    ) {
        let required = message_type.required_fields();
        let field = required[pick.index(required.len())];
        let mut payload = schema_payload(message_type, &[]);
        payload.remove(field);

        prop_assert!(encode_message(message_type, payload.clone(), None).is_err());

        let frame = json!({
            "version": PROTOCOL_VERSION,
            "type": message_type.as_str(),
            "timestamp": "2026-01-01T00:00:00+00:00",
            "payload": Value::Object(payload),
        });
        prop_assert!(decode_message(&frame.to_string()).is_err());
    }

    #[test]
    fn prop_retry_delay_bounded(attempt in 1u32..64) {
        for policy in [RetryPolicy::Exponential, RetryPolicy::Linear, RetryPolicy::None] {
            let delay = retry_delay(attempt, policy).as_secs_f64();
            prop_assert!((0.0..=10.0).contains(&delay));
        }
        let expected = (0.5 * f64::from(attempt).exp2()).min(10.0);
        prop_assert!((retry_delay(attempt, RetryPolicy::Exponential).as_secs_f64() - expected).abs() < 1e-9);
    }

    #[test]
    fn prop_pacing_never_undershoots_the_budget(
        bytes in 1u64..100_000_000,
        elapsed_ms in 0u64..10_000,
        limit in 1u64..100_000_000,
    ) {
        let elapsed = Duration::from_millis(elapsed_ms);
        let budget = bytes as f64 / limit as f64;
        match pacing_delay(bytes, elapsed, Some(limit)) {
            Some(delay) => {
                // Sleeping the suggested delay lands exactly on the budget.
                let landed = elapsed.as_secs_f64() + delay.as_secs_f64();
                prop_assert!((landed - budget).abs() < 1e-6);
            }
            None => {
                // No sleep needed means the elapsed time already covers it.
                prop_assert!(elapsed.as_secs_f64() >= budget - 1e-6);
            }
        }
    }
}
