//! SCRAM-SHA-256 mechanism (RFC 5802, RFC 7677).
//!
//! Four messages: client-first, server-first, client-final,
//! server-final (the last rides in the handshake-closing `OK`). The
//! password never crosses the wire; both sides prove knowledge of the
//! salted password through HMAC signatures over the exchange
//! transcript.
//!
//! On completion both sides hold the salted password and the full
//! authentication message, from which the ARC integrity-layer keys are
//! derived (ARC/2.1 sessions engage them; see `sasl::layer`).
//!
//! Channel binding is not offered (`gs2 = "n,,"`).

use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::constants::{SCRAM_ITERATIONS, SCRAM_NONCE_LEN, SCRAM_SALT_LEN};
use crate::error::{Error, Result};
use crate::sasl::layer::SessionKeys;
use crate::sasl::plain::ct_eq;
use crate::sasl::{Mechanism, SecretStore, Step};

pub const MECH_NAME: &str = "SCRAM-SHA-256";

type HmacSha256 = Hmac<Sha256>;

const GS2_HEADER: &str = "n,,";
/// base64("n,,"), the channel-binding attribute of client-final.
const GS2_HEADER_B64: &str = "biws";

/// Iteration ceiling accepted from a server (client side); guards
/// against a hostile server turning key stretching into denial of
/// service.
const MAX_ITERATIONS: u32 = 1_000_000;

// =============================================================================
// Crypto Helpers
// =============================================================================

fn hmac(key: &[u8], parts: &[&[u8]]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// `Hi(str, salt, i)`: PBKDF2-HMAC-SHA256, single block.
fn hi(password: &[u8], salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut block = salt.to_vec();
    block.extend_from_slice(&1u32.to_be_bytes());
    let mut u = hmac(password, &[&block]);
    let mut out = u;
    for _ in 1..iterations {
        u = hmac(password, &[&u]);
        for (o, b) in out.iter_mut().zip(u.iter()) {
            *o ^= b;
        }
    }
    out
}

fn fresh_nonce() -> String {
    let mut raw = [0u8; SCRAM_NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut raw);
    BASE64.encode(raw)
}

/// Derives the four integrity-layer keys from the shared exchange
/// secrets. Both sides compute identical keys; direction labels keep
/// them distinct.
fn derive_session_keys(salted_password: &[u8; 32], auth_message: &[u8]) -> SessionKeys {
    let master = hmac(salted_password, &[b"ARC Layer", auth_message]);
    SessionKeys {
        c2s_control: hmac(&master, &[b"c2s control"]),
        s2c_control: hmac(&master, &[b"s2c control"]),
        c2s_data: hmac(&master, &[b"c2s data"]),
        s2c_data: hmac(&master, &[b"s2c data"]),
    }
}

// =============================================================================
// Message Helpers
// =============================================================================

/// Escapes `,` and `=` in a saslname (RFC 5802 §5.1).
fn escape_username(name: &str) -> String {
    name.replace('=', "=3D").replace(',', "=2C")
}

fn unescape_username(name: &str) -> Result<String> {
    let mut out = String::with_capacity(name.len());
    let mut chars = name.chars();
    while let Some(c) = chars.next() {
        if c != '=' {
            out.push(c);
            continue;
        }
        match (chars.next(), chars.next()) {
            (Some('2'), Some('C')) => out.push(','),
            (Some('3'), Some('D')) => out.push('='),
            _ => return Err(Error::Auth("invalid saslname escape".to_string())),
        }
    }
    Ok(out)
}

/// Finds the value of a one-letter attribute in a SCRAM message.
fn attr<'a>(message: &'a str, key: char) -> Result<&'a str> {
    message
        .split(',')
        .find_map(|part| part.strip_prefix(key).and_then(|r| r.strip_prefix('=')))
        .ok_or_else(|| Error::Auth(format!("missing '{key}=' attribute")))
}

fn utf8(bytes: &[u8]) -> Result<&str> {
    std::str::from_utf8(bytes).map_err(|_| Error::Auth("SCRAM message is not UTF-8".to_string()))
}

// =============================================================================
// Client
// =============================================================================

#[derive(Debug)]
enum ClientState {
    Initial,
    SentClientFirst { bare: String, nonce: String },
    SentClientFinal {
        server_signature: [u8; 32],
        salted_password: [u8; 32],
        auth_message: Vec<u8>,
    },
    Finished,
}

/// Client side of SCRAM-SHA-256.
#[derive(Debug)]
pub struct ScramClient {
    user: String,
    secret: String,
    state: ClientState,
}

impl ScramClient {
    #[must_use]
    pub fn new(user: &str, secret: &str) -> Self {
        Self {
            user: user.to_string(),
            secret: secret.to_string(),
            state: ClientState::Initial,
        }
    }
}

impl Mechanism for ScramClient {
    fn name(&self) -> &'static str {
        MECH_NAME
    }

    fn step(&mut self, input: Option<&[u8]>) -> Result<Step> {
        match std::mem::replace(&mut self.state, ClientState::Finished) {
            ClientState::Initial => {
                let nonce = fresh_nonce();
                let bare = format!("n={},r={}", escape_username(&self.user), nonce);
                let first = format!("{GS2_HEADER}{bare}");
                self.state = ClientState::SentClientFirst { bare, nonce };
                Ok(Step::Continue(first.into_bytes()))
            }

            ClientState::SentClientFirst { bare, nonce } => {
                let server_first = utf8(
                    input.ok_or_else(|| Error::Auth("expected server-first".to_string()))?,
                )?
                .to_string();

                let combined_nonce = attr(&server_first, 'r')?.to_string();
                if !combined_nonce.starts_with(&nonce) || combined_nonce.len() <= nonce.len() {
                    return Err(Error::Auth("server nonce does not extend ours".to_string()));
                }
                let salt = BASE64
                    .decode(attr(&server_first, 's')?)
                    .map_err(|_| Error::Auth("bad salt encoding".to_string()))?;
                let iterations: u32 = attr(&server_first, 'i')?
                    .parse()
                    .map_err(|_| Error::Auth("bad iteration count".to_string()))?;
                if iterations == 0 || iterations > MAX_ITERATIONS {
                    return Err(Error::Auth(format!(
                        "iteration count {iterations} out of range"
                    )));
                }

                let salted_password = hi(self.secret.as_bytes(), &salt, iterations);
                let client_key = hmac(&salted_password, &[b"Client Key"]);
                let stored_key = sha256(&client_key);

                let final_no_proof = format!("c={GS2_HEADER_B64},r={combined_nonce}");
                let auth_message =
                    format!("{bare},{server_first},{final_no_proof}").into_bytes();

                let client_signature = hmac(&stored_key, &[&auth_message]);
                let mut proof = client_key;
                for (p, s) in proof.iter_mut().zip(client_signature.iter()) {
                    *p ^= s;
                }

                let server_key = hmac(&salted_password, &[b"Server Key"]);
                let server_signature = hmac(&server_key, &[&auth_message]);

                let client_final = format!("{final_no_proof},p={}", BASE64.encode(proof));
                self.state = ClientState::SentClientFinal {
                    server_signature,
                    salted_password,
                    auth_message,
                };
                Ok(Step::Continue(client_final.into_bytes()))
            }

            ClientState::SentClientFinal {
                server_signature,
                salted_password,
                auth_message,
            } => {
                let server_final = utf8(
                    input.ok_or_else(|| Error::Auth("expected server-final".to_string()))?,
                )?;
                let verifier = BASE64
                    .decode(attr(server_final, 'v')?)
                    .map_err(|_| Error::Auth("bad server signature encoding".to_string()))?;
                if !ct_eq(&verifier, &server_signature) {
                    return Err(Error::Auth(
                        "server signature verification failed".to_string(),
                    ));
                }
                Ok(Step::Done {
                    identity: self.user.clone(),
                    keys: Some(derive_session_keys(&salted_password, &auth_message)),
                    output: None,
                })
            }

            ClientState::Finished => {
                Err(Error::Auth("SCRAM exchange already complete".to_string()))
            }
        }
    }
}

// =============================================================================
// Server
// =============================================================================

enum ServerState {
    Initial,
    SentServerFirst {
        user: String,
        server_first: String,
        client_first_bare: String,
        combined_nonce: String,
        salted_password: [u8; 32],
    },
    Finished,
}

/// Server side of SCRAM-SHA-256, verifying against a [`SecretStore`].
pub struct ScramServer {
    store: Arc<dyn SecretStore>,
    state: ServerState,
}

impl ScramServer {
    #[must_use]
    pub fn new(store: Arc<dyn SecretStore>) -> Self {
        Self {
            store,
            state: ServerState::Initial,
        }
    }
}

impl Mechanism for ScramServer {
    fn name(&self) -> &'static str {
        MECH_NAME
    }

    fn step(&mut self, input: Option<&[u8]>) -> Result<Step> {
        match std::mem::replace(&mut self.state, ServerState::Finished) {
            ServerState::Initial => {
                let client_first = utf8(
                    input.ok_or_else(|| Error::Auth("expected client-first".to_string()))?,
                )?;
                let bare = client_first
                    .strip_prefix(GS2_HEADER)
                    .ok_or_else(|| Error::Auth("unsupported gs2 header".to_string()))?
                    .to_string();

                let user = unescape_username(attr(&bare, 'n')?)?;
                if user.is_empty() {
                    return Err(Error::Auth("empty authentication identity".to_string()));
                }
                let client_nonce = attr(&bare, 'r')?;

                let secret = self
                    .store
                    .lookup(&user)
                    .ok_or_else(|| Error::Auth(format!("unknown user '{user}'")))?;

                let mut salt = [0u8; SCRAM_SALT_LEN];
                rand::thread_rng().fill_bytes(&mut salt);
                let salted_password = hi(secret.as_bytes(), &salt, SCRAM_ITERATIONS);

                let combined_nonce = format!("{client_nonce}{}", fresh_nonce());
                let server_first = format!(
                    "r={combined_nonce},s={},i={SCRAM_ITERATIONS}",
                    BASE64.encode(salt)
                );

                self.state = ServerState::SentServerFirst {
                    user,
                    server_first: server_first.clone(),
                    client_first_bare: bare,
                    combined_nonce,
                    salted_password,
                };
                Ok(Step::Continue(server_first.into_bytes()))
            }

            ServerState::SentServerFirst {
                user,
                server_first,
                client_first_bare,
                combined_nonce,
                salted_password,
            } => {
                let client_final = utf8(
                    input.ok_or_else(|| Error::Auth("expected client-final".to_string()))?,
                )?;

                if attr(client_final, 'c')? != GS2_HEADER_B64 {
                    return Err(Error::Auth("channel binding mismatch".to_string()));
                }
                if attr(client_final, 'r')? != combined_nonce {
                    return Err(Error::Auth("nonce mismatch in client-final".to_string()));
                }
                let proof = BASE64
                    .decode(attr(client_final, 'p')?)
                    .map_err(|_| Error::Auth("bad proof encoding".to_string()))?;
                if proof.len() != 32 {
                    return Err(Error::Auth("bad proof length".to_string()));
                }

                let final_no_proof = client_final
                    .rsplit_once(",p=")
                    .map(|(head, _)| head)
                    .ok_or_else(|| Error::Auth("missing proof attribute".to_string()))?;
                let auth_message =
                    format!("{client_first_bare},{server_first},{final_no_proof}").into_bytes();

                let client_key = hmac(&salted_password, &[b"Client Key"]);
                let stored_key = sha256(&client_key);
                let client_signature = hmac(&stored_key, &[&auth_message]);

                let mut recovered_key = [0u8; 32];
                for (r, (p, s)) in recovered_key
                    .iter_mut()
                    .zip(proof.iter().zip(client_signature.iter()))
                {
                    *r = p ^ s;
                }
                if !ct_eq(&sha256(&recovered_key), &stored_key) {
                    return Err(Error::Auth(format!("bad proof for '{user}'")));
                }

                let server_key = hmac(&salted_password, &[b"Server Key"]);
                let server_signature = hmac(&server_key, &[&auth_message]);
                let server_final = format!("v={}", BASE64.encode(server_signature));

                Ok(Step::Done {
                    identity: user,
                    keys: Some(derive_session_keys(&salted_password, &auth_message)),
                    output: Some(server_final.into_bytes()),
                })
            }

            ServerState::Finished => {
                Err(Error::Auth("SCRAM exchange already complete".to_string()))
            }
        }
    }
}
