//! CBOR wire round-trips and canonical-signing behavior for the envelope
//! and direct-messaging codec (C5).

use marketcore_net::protocol::{
    codec::{cbor_decode, cbor_encode, Ack},
    envelope::Envelope,
};

#[test]
fn envelope_roundtrips_through_cbor() {
    let env = Envelope::new("quote-request", "0xALICE", serde_json::json!({"model": "llama"}))
        .with_signature("deadbeef");
    let bytes = cbor_encode(&env).unwrap();
    let decoded: Envelope = cbor_decode(&bytes).unwrap();
    assert_eq!(decoded, env);
}

#[test]
fn envelope_with_target_roundtrips() {
    let env = Envelope::new("quote-accepted", "0xBOB", serde_json::json!({"sessionId": "s1"}))
        .addressed_to("12D3KooWTest");
    let decoded: Envelope = cbor_decode(&cbor_encode(&env).unwrap()).unwrap();
    assert_eq!(decoded.to.as_deref(), Some("12D3KooWTest"));
}

#[test]
fn fresh_envelope_has_a_unique_id_and_no_signature() {
    let a = Envelope::new("quote-request", "0xALICE", serde_json::json!({}));
    let b = Envelope::new("quote-request", "0xALICE", serde_json::json!({}));
    assert_ne!(a.id, b.id);
    assert!(!a.is_signed());
}

#[test]
fn ack_roundtrips_as_an_empty_frame() {
    let bytes = cbor_encode(&Ack).unwrap();
    let _: Ack = cbor_decode(&bytes).unwrap();
}

#[test]
fn canonical_bytes_are_stable_across_clones() {
    let env = Envelope::new("quote-request", "0xALICE", serde_json::json!({"a": 1, "b": 2}));
    let cloned = env.clone();
    assert_eq!(env.canonical_bytes(), cloned.canonical_bytes());
}

#[test]
fn envelope_id_survives_a_cbor_roundtrip() {
    let env = Envelope::new("list-models", "0xALICE", serde_json::json!([]));
    let id_before = env.id;
    let decoded: Envelope = cbor_decode(&cbor_encode(&env).unwrap()).unwrap();
    assert_eq!(decoded.id, id_before);
}
