//! Tests for the SASL adapter: mechanism exchanges driven through the
//! session façade, and the protection layer over hostile inputs.

use std::sync::Arc;

use arcx::protocol::{ProtocolVersion, Role};
use arcx::sasl::{
    MemoryStore, SaslSession, SecretStore, SessionStep, select_mechanism,
};

fn store() -> Arc<dyn SecretStore> {
    Arc::new(MemoryStore::from_pairs(&[
        ("alice", "pencil"),
        ("bob", "crayon"),
    ]))
}

/// Drives a client/server pair to completion, panicking on any
/// mid-exchange surprise. Returns both completed sessions.
fn complete_exchange(mech: &str, user: &str, secret: &str) -> (SaslSession, SaslSession) {
    let mut client = SaslSession::client(mech, user, secret).unwrap();
    let mut server = SaslSession::server(mech, store()).unwrap();

    let mut outbound = match client.step(None).unwrap() {
        SessionStep::Continue(out) => out,
        SessionStep::Done { .. } => panic!("client cannot complete before the server"),
    };
    loop {
        match server.step(Some(&outbound)).unwrap() {
            SessionStep::Continue(reply) => {
                outbound = match client.step(Some(&reply)).unwrap() {
                    SessionStep::Continue(out) => out,
                    SessionStep::Done { .. } => panic!("client completed mid-exchange"),
                };
            }
            SessionStep::Done { output } => {
                let SessionStep::Done { .. } =
                    client.step(output.as_deref()).unwrap()
                else {
                    panic!("client did not accept completion");
                };
                return (client, server);
            }
        }
    }
}

// =============================================================================
// Exchanges
// =============================================================================

#[test]
fn test_scram_exchange_completes() {
    let (client, server) = complete_exchange("SCRAM-SHA-256", "alice", "pencil");
    assert_eq!(client.authenticated_user(), Some("alice"));
    assert_eq!(server.authenticated_user(), Some("alice"));
    assert!(client.has_keys());
    assert!(server.has_keys());
}

#[test]
fn test_plain_exchange_completes_without_keys() {
    let (client, server) = complete_exchange("PLAIN", "bob", "crayon");
    assert_eq!(server.authenticated_user(), Some("bob"));
    assert!(!client.has_keys());
    assert!(!server.has_keys());
}

#[test]
fn test_scram_bad_password_fails_server_side() {
    let mut client = SaslSession::client("SCRAM-SHA-256", "alice", "wrong").unwrap();
    let mut server = SaslSession::server("SCRAM-SHA-256", store()).unwrap();

    let SessionStep::Continue(c1) = client.step(None).unwrap() else {
        panic!()
    };
    let SessionStep::Continue(s1) = server.step(Some(&c1)).unwrap() else {
        panic!()
    };
    let SessionStep::Continue(c2) = client.step(Some(&s1)).unwrap() else {
        panic!()
    };
    assert!(server.step(Some(&c2)).is_err());
    assert_eq!(server.authenticated_user(), None);
}

#[test]
fn test_mechanism_mismatch_between_sides_fails() {
    // A PLAIN token fed to a SCRAM server is rejected, not
    // misinterpreted.
    let mut client = SaslSession::client("PLAIN", "alice", "pencil").unwrap();
    let mut server = SaslSession::server("SCRAM-SHA-256", store()).unwrap();

    let SessionStep::Continue(token) = client.step(None).unwrap() else {
        panic!()
    };
    assert!(server.step(Some(&token)).is_err());
}

// =============================================================================
// Negotiation
// =============================================================================

#[test]
fn test_negotiation_is_server_preference_order() {
    let scram_first = vec!["SCRAM-SHA-256".to_string(), "PLAIN".to_string()];
    let offer = ["PLAIN", "SCRAM-SHA-256"];
    assert_eq!(select_mechanism(&scram_first, &offer), Some("SCRAM-SHA-256"));
}

#[test]
fn test_negotiation_case_insensitive() {
    let prefs = vec!["scram-sha-256".to_string()];
    assert_eq!(
        select_mechanism(&prefs, &["Scram-Sha-256"]),
        Some("SCRAM-SHA-256")
    );
}

// =============================================================================
// Protection Layer
// =============================================================================

/// Wrap/open round trip across both channels: `open(seal(x)) = x`.
#[test]
fn test_layer_round_trip_all_channels() {
    let (client, server) = complete_exchange("SCRAM-SHA-256", "alice", "pencil");
    let mut csec = client.channel_security(Role::Client, ProtocolVersion::V2_1);
    let mut ssec = server.channel_security(Role::Server, ProtocolVersion::V2_1);

    for message in [&b"x"[..], b"", b"a longer control line with spaces"] {
        let sealed = csec.control_tx.seal(message);
        assert_eq!(ssec.control_rx.open(&sealed).unwrap(), message);
        let sealed = ssec.control_tx.seal(message);
        assert_eq!(csec.control_rx.open(&sealed).unwrap(), message);
    }

    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let sealed = csec.data_tx.seal(&payload);
    assert_eq!(ssec.data_rx.open(&sealed).unwrap(), payload);
}

/// The opener reassembles regardless of how the transport fragments
/// the stream.
#[test]
fn test_layer_survives_arbitrary_fragmentation() {
    let (client, server) = complete_exchange("SCRAM-SHA-256", "alice", "pencil");
    let mut csec = client.channel_security(Role::Client, ProtocolVersion::V2_1);
    let mut ssec = server.channel_security(Role::Server, ProtocolVersion::V2_1);

    let payload: Vec<u8> = (0..70_000u32).map(|i| (i % 13) as u8).collect();
    let sealed = csec.data_tx.seal(&payload);

    let mut received = Vec::new();
    for (i, chunk) in sealed.chunks(997).enumerate() {
        ssec.data_rx.push(chunk);
        let plain = ssec.data_rx.drain().unwrap();
        if i == 0 {
            // One short push cannot complete a frame.
            assert!(plain.is_empty());
        }
        received.extend_from_slice(&plain);
    }
    assert_eq!(received, payload);
}

#[test]
fn test_cross_channel_frames_rejected() {
    let (client, server) = complete_exchange("SCRAM-SHA-256", "alice", "pencil");
    let mut csec = client.channel_security(Role::Client, ProtocolVersion::V2_1);
    let mut ssec = server.channel_security(Role::Server, ProtocolVersion::V2_1);

    // A control frame replayed onto the data channel has the wrong
    // key and must not open.
    let sealed = csec.control_tx.seal(b"CMD echo hi");
    assert!(ssec.data_rx.open(&sealed).is_err());
}

#[test]
fn test_sessions_do_not_share_keys() {
    let (client_a, _) = complete_exchange("SCRAM-SHA-256", "alice", "pencil");
    let (_, server_b) = complete_exchange("SCRAM-SHA-256", "alice", "pencil");

    // Same user, same password, two sessions: the nonces differ, so a
    // frame from one session cannot open in another.
    let mut sec_a = client_a.channel_security(Role::Client, ProtocolVersion::V2_1);
    let mut sec_b = server_b.channel_security(Role::Server, ProtocolVersion::V2_1);
    let sealed = sec_a.control_tx.seal(b"CMD echo hi");
    assert!(sec_b.control_rx.open(&sealed).is_err());
}
