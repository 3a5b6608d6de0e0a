//! Tests for the protocol engine at the connection level: expected-
//! next gating, vocabulary pinning, and sealed control lines.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};

use arcx::conn::Connection;
use arcx::error::Error;
use arcx::log::LogMask;
use arcx::protocol::{ProtocolVersion, Role, Verb, VerbSet};
use arcx::sasl::{MemoryStore, SaslSession, SessionStep};

async fn socket_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (connected, accepted) = tokio::join!(TcpStream::connect(addr), async {
        listener.accept().await.unwrap().0
    });
    (connected.unwrap(), accepted)
}

const TIMEOUT: Duration = Duration::from_secs(2);

fn conn_pair(a: TcpStream, b: TcpStream) -> (Connection, Connection) {
    (
        Connection::new(a, Role::Client, TIMEOUT, LogMask::DEFAULT),
        Connection::new(b, Role::Server, TIMEOUT, LogMask::DEFAULT),
    )
}

// =============================================================================
// Expected-Next Gating
// =============================================================================

#[tokio::test]
async fn test_expected_verb_passes_gate() {
    let (a, b) = socket_pair().await;
    let (mut client, mut server) = conn_pair(a, b);

    server.expect(VerbSet::of(&[Verb::Auth]));
    client
        .send_verb(Verb::Auth, Some("ARC/2.1 PLAIN"))
        .await
        .unwrap();

    let (verb, param) = server.recv_verb().await.unwrap().unwrap();
    assert_eq!(verb, Verb::Auth);
    assert_eq!(param.as_deref(), Some("ARC/2.1 PLAIN"));
}

#[tokio::test]
async fn test_unexpected_verb_is_protocol_error() {
    let (a, b) = socket_pair().await;
    let (mut client, mut server) = conn_pair(a, b);

    server.expect(VerbSet::of(&[Verb::Auth]));
    client.send_verb(Verb::Cmd, Some("echo hi")).await.unwrap();

    let err = server.recv_verb().await.unwrap_err();
    assert!(matches!(err, Error::Protocol(_)), "got: {err:?}");
}

#[tokio::test]
async fn test_empty_expected_set_rejects_everything() {
    let (a, b) = socket_pair().await;
    let (mut client, mut server) = conn_pair(a, b);

    server.expect(VerbSet::EMPTY);
    client.send_verb(Verb::Quit, None).await.unwrap();

    assert!(server.recv_verb().await.is_err());
}

// =============================================================================
// Vocabulary Pinning
// =============================================================================

#[tokio::test]
async fn test_v2_0_refuses_to_send_cmdport() {
    let (a, _b) = socket_pair().await;
    let mut client = Connection::new(a, Role::Client, TIMEOUT, LogMask::DEFAULT);
    client.set_version(ProtocolVersion::V2_0);

    let err = client
        .send_verb(Verb::Cmdport, Some("127.0.0.1:9"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Internal(_)));
}

#[tokio::test]
async fn test_v2_0_refuses_to_receive_cmdport() {
    let (a, b) = socket_pair().await;
    let (mut client, mut server) = conn_pair(a, b);
    server.set_version(ProtocolVersion::V2_0);
    server.expect(VerbSet::of(&[Verb::Cmd, Verb::Cmdport, Verb::Quit]));

    // The client (still at 2.1) sends a verb the server's vocabulary
    // does not contain.
    client
        .send_verb(Verb::Cmdport, Some("127.0.0.1:9"))
        .await
        .unwrap();
    let err = server.recv_verb().await.unwrap_err();
    assert!(matches!(err, Error::Protocol(_)));
}

// =============================================================================
// Sealed Control Lines
// =============================================================================

/// Runs a real SCRAM exchange and installs matching protection state
/// on both connections.
fn authenticate_pair(client: &mut Connection, server: &mut Connection) {
    let store = Arc::new(MemoryStore::from_pairs(&[("alice", "pencil")]));
    let mut csasl = SaslSession::client("SCRAM-SHA-256", "alice", "pencil").unwrap();
    let mut ssasl = SaslSession::server("SCRAM-SHA-256", store).unwrap();

    let SessionStep::Continue(c1) = csasl.step(None).unwrap() else {
        panic!()
    };
    let SessionStep::Continue(s1) = ssasl.step(Some(&c1)).unwrap() else {
        panic!()
    };
    let SessionStep::Continue(c2) = csasl.step(Some(&s1)).unwrap() else {
        panic!()
    };
    let SessionStep::Done { output: Some(s2) } = ssasl.step(Some(&c2)).unwrap() else {
        panic!()
    };
    let SessionStep::Done { .. } = csasl.step(Some(&s2)).unwrap() else {
        panic!()
    };

    let version = client.version();
    client.finish_authentication(
        "alice",
        csasl.channel_security(Role::Client, version),
    );
    server.finish_authentication(
        "alice",
        ssasl.channel_security(Role::Server, version),
    );
}

#[tokio::test]
async fn test_sealed_lines_round_trip() {
    let (a, b) = socket_pair().await;
    let (mut client, mut server) = conn_pair(a, b);
    authenticate_pair(&mut client, &mut server);

    server.expect(VerbSet::of(&[Verb::Cmd, Verb::Quit]));
    client
        .send_verb(Verb::Cmd, Some("echo sealed payload"))
        .await
        .unwrap();

    let (verb, param) = server.recv_verb().await.unwrap().unwrap();
    assert_eq!(verb, Verb::Cmd);
    assert_eq!(param.as_deref(), Some("echo sealed payload"));

    // And the reverse direction.
    client.expect(VerbSet::of(&[Verb::Exit]));
    server.send_verb(Verb::Exit, Some("0")).await.unwrap();
    let (verb, param) = client.recv_verb().await.unwrap().unwrap();
    assert_eq!(verb, Verb::Exit);
    assert_eq!(param.as_deref(), Some("0"));
}

#[tokio::test]
async fn test_sealed_session_rejects_plaintext_injection() {
    let (a, b) = socket_pair().await;
    let (mut client, mut server) = conn_pair(a, b);

    // Seal only the server side: the peer now speaks plaintext into
    // an authenticated session, as an attacker splicing raw verbs
    // would.
    let store = Arc::new(MemoryStore::from_pairs(&[("alice", "pencil")]));
    let mut csasl = SaslSession::client("SCRAM-SHA-256", "alice", "pencil").unwrap();
    let mut ssasl = SaslSession::server("SCRAM-SHA-256", store).unwrap();
    let SessionStep::Continue(c1) = csasl.step(None).unwrap() else {
        panic!()
    };
    let SessionStep::Continue(s1) = ssasl.step(Some(&c1)).unwrap() else {
        panic!()
    };
    let SessionStep::Continue(c2) = csasl.step(Some(&s1)).unwrap() else {
        panic!()
    };
    let SessionStep::Done { .. } = ssasl.step(Some(&c2)).unwrap() else {
        panic!()
    };
    server.finish_authentication(
        "alice",
        ssasl.channel_security(Role::Server, server.version()),
    );

    server.expect(VerbSet::of(&[Verb::Cmd, Verb::Quit]));
    client.send_verb(Verb::Cmd, Some("echo hi")).await.unwrap();

    let err = server.recv_verb().await.unwrap_err();
    assert!(matches!(err, Error::Protocol(_)), "got: {err:?}");
}

#[tokio::test]
async fn test_identity_from_peer_tracked() {
    let (a, b) = socket_pair().await;
    let (mut client, mut server) = conn_pair(a, b);

    assert_eq!(server.peer_identity(), "anonymous");
    assert!(!server.is_authenticated());

    authenticate_pair(&mut client, &mut server);
    assert_eq!(server.peer_identity(), "alice");
    assert!(server.is_authenticated());
}
