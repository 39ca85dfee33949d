//! Method-chain authentication scenarios: partial success across a
//! `publickey,password` chain, identity pinning, attempt limits and
//! keyboard-interactive round trips.

mod common;

use std::sync::Arc;

use async_trait::async_trait;

use common::TestTransport;
use sshmux::auth::{
    AuthOutcome, ClientAuthService, InteractiveAuthenticator, InteractiveChallenge,
    KbdInteractiveFactory, NoneFactory, PasswordAuthenticator, PasswordFactory,
    PublickeyAuthenticator, PublickeyFactory, ServerAuthConfig, ServerAuthService,
    SignatureVerifier,
};
use sshmux::{msg, Buffer, Transport};

const KEY_BLOB: &[u8] = b"\x00\x00\x00\x0bssh-ed25519 test key material";
const GOOD_SIGNATURE: &[u8] = b"trust me, signed";

struct FixedPassword;

#[async_trait]
impl PasswordAuthenticator for FixedPassword {
    async fn authenticate(&self, username: &str, password: &str) -> bool {
        username == "alice" && password == "sesame"
    }
}

struct OneKey;

#[async_trait]
impl PublickeyAuthenticator for OneKey {
    async fn is_authorized(&self, username: &str, _algorithm: &str, key_blob: &[u8]) -> bool {
        username == "alice" && key_blob == KEY_BLOB
    }
}

struct FixedVerifier;

impl SignatureVerifier for FixedVerifier {
    fn verify(&self, _username: &str, _algorithm: &str, _key_blob: &[u8], signature: &[u8]) -> bool {
        signature == GOOD_SIGNATURE
    }
}

struct SingleQuestion;

#[async_trait]
impl InteractiveAuthenticator for SingleQuestion {
    async fn challenge(&self, _username: &str) -> InteractiveChallenge {
        InteractiveChallenge {
            name: "quiz".into(),
            instruction: "answer me".into(),
            prompts: vec![("color?".into(), true)],
        }
    }

    async fn verify(&self, _username: &str, responses: &[String]) -> bool {
        responses == ["blue"]
    }
}

fn chain_config(methods: &str) -> ServerAuthConfig {
    ServerAuthConfig::new(
        methods,
        vec![
            Arc::new(NoneFactory::default()),
            Arc::new(PasswordFactory::new(Arc::new(FixedPassword))),
            Arc::new(PublickeyFactory::new(
                Arc::new(OneKey),
                Arc::new(FixedVerifier),
            )),
            Arc::new(KbdInteractiveFactory::new(Arc::new(SingleQuestion))),
        ],
    )
    .unwrap()
}

/// Hand one of the client's queued messages to the server.
async fn relay_to_server(
    client_transport: &TestTransport,
    server: &mut ServerAuthService,
) -> sshmux::Result<()> {
    let (cmd, payload) = client_transport.pop().expect("client sent nothing");
    let mut buf = Buffer::from_vec(payload);
    buf.set_rpos(1);
    server.process(cmd, &mut buf).await
}

/// Hand one of the server's queued messages to the client.
fn relay_to_client(server_transport: &TestTransport, client: &ClientAuthService) {
    let (cmd, payload) = server_transport.pop().expect("server sent nothing");
    let mut buf = Buffer::from_vec(payload);
    buf.set_rpos(1);
    client.process(cmd, &mut buf).unwrap();
}

#[tokio::test]
async fn publickey_then_password_chain() {
    let client_transport = TestTransport::new();
    let server_transport = TestTransport::new();
    let client = ClientAuthService::new(client_transport.clone(), "alice", "ssh-connection");
    let mut config = chain_config("publickey,password");
    config.banner = Some("welcome aboard".into());
    let mut server = ServerAuthService::new(server_transport.clone(), config);

    // A password-only attempt is refused outright: password is not at
    // the head of any chain yet.
    client.request_password("sesame").unwrap();
    relay_to_server(&client_transport, &mut server).await.unwrap();
    relay_to_client(&server_transport, &client);
    let (methods, partial) = client.last_failure().unwrap();
    assert_eq!(methods, vec!["publickey"]);
    assert!(!partial);

    // Publickey probe: the server offers to accept this key.
    client.request_publickey("ssh-ed25519", KEY_BLOB, None).unwrap();
    relay_to_server(&client_transport, &mut server).await.unwrap();
    let mut pk_ok = server_transport.expect(msg::USERAUTH_PK_OK);
    assert_eq!(pk_ok.get_str().unwrap(), "ssh-ed25519");
    assert_eq!(pk_ok.get_string().unwrap(), KEY_BLOB);

    // The signed retry completes publickey: partial success, password
    // remains.
    client
        .request_publickey("ssh-ed25519", KEY_BLOB, Some(GOOD_SIGNATURE))
        .unwrap();
    relay_to_server(&client_transport, &mut server).await.unwrap();
    relay_to_client(&server_transport, &client);
    let (methods, partial) = client.last_failure().unwrap();
    assert_eq!(methods, vec!["password"]);
    assert!(partial);
    assert!(!server.is_authenticated());

    // The password finishes the chain: banner, then success.
    client.request_password("sesame").unwrap();
    relay_to_server(&client_transport, &mut server).await.unwrap();
    relay_to_client(&server_transport, &client); // banner
    relay_to_client(&server_transport, &client); // success

    assert!(server.is_authenticated());
    assert_eq!(server.auth_result().value().as_deref(), Some("alice"));
    assert_eq!(client.outcome().value(), Some(AuthOutcome::Success));
    assert_eq!(client.banners(), vec!["welcome aboard".to_string()]);
}

#[tokio::test]
async fn wrong_signature_is_rejected() {
    let client_transport = TestTransport::new();
    let server_transport = TestTransport::new();
    let client = ClientAuthService::new(client_transport.clone(), "alice", "ssh-connection");
    let mut server = ServerAuthService::new(server_transport.clone(), chain_config("publickey"));

    client
        .request_publickey("ssh-ed25519", KEY_BLOB, Some(b"forged"))
        .unwrap();
    relay_to_server(&client_transport, &mut server).await.unwrap();
    let mut failure = server_transport.expect(msg::USERAUTH_FAILURE);
    assert_eq!(failure.get_name_list().unwrap(), vec!["publickey"]);
    assert!(!failure.get_bool().unwrap());
    assert!(!server.is_authenticated());
}

#[tokio::test]
async fn identity_must_not_change_across_requests() {
    let server_transport = TestTransport::new();
    let mut server = ServerAuthService::new(server_transport.clone(), chain_config("password"));

    let alice_transport = TestTransport::new();
    let alice = ClientAuthService::new(alice_transport.clone(), "alice", "ssh-connection");
    let mallory_transport = TestTransport::new();
    let mallory = ClientAuthService::new(mallory_transport.clone(), "mallory", "ssh-connection");

    alice.request_password("wrong").unwrap();
    relay_to_server(&alice_transport, &mut server).await.unwrap();
    let _ = server_transport.pop();

    mallory.request_password("sesame").unwrap();
    let err = relay_to_server(&mallory_transport, &mut server).await;
    assert!(err.is_err(), "changed username must disconnect");
}

#[tokio::test]
async fn attempts_are_limited() {
    let server_transport = TestTransport::new();
    let client_transport = TestTransport::new();
    let client = ClientAuthService::new(client_transport.clone(), "alice", "ssh-connection");
    let mut config = chain_config("password");
    config.max_attempts = 3;
    let mut server = ServerAuthService::new(server_transport.clone(), config);

    for _ in 0..3 {
        client.request_password("wrong").unwrap();
        relay_to_server(&client_transport, &mut server).await.unwrap();
        let _ = server_transport.pop();
    }
    client.request_password("wrong").unwrap();
    assert!(relay_to_server(&client_transport, &mut server).await.is_err());
}

#[tokio::test]
async fn keyboard_interactive_round_trip() {
    let server_transport = TestTransport::new();
    let client_transport = TestTransport::new();
    let mut server =
        ServerAuthService::new(server_transport.clone(), chain_config("keyboard-interactive"));

    // The client opens with the method request.
    let mut request = Buffer::for_packet(msg::USERAUTH_REQUEST);
    request.put_str("alice");
    request.put_str("ssh-connection");
    request.put_str("keyboard-interactive");
    request.put_str(""); // language
    request.put_str(""); // submethods
    client_transport.write_packet(request).unwrap();
    relay_to_server(&client_transport, &mut server).await.unwrap();

    let mut info = server_transport.expect(msg::USERAUTH_INFO_REQUEST);
    assert_eq!(info.get_str().unwrap(), "quiz");
    assert_eq!(info.get_str().unwrap(), "answer me");
    assert_eq!(info.get_str().unwrap(), "en");
    assert_eq!(info.get_u32().unwrap(), 1);
    assert_eq!(info.get_str().unwrap(), "color?");

    // Answer the prompt.
    let mut response = Buffer::for_packet(msg::USERAUTH_INFO_RESPONSE);
    response.put_u32(1);
    response.put_str("blue");
    client_transport.write_packet(response).unwrap();
    relay_to_server(&client_transport, &mut server).await.unwrap();

    assert_eq!(server_transport.expect(msg::USERAUTH_SUCCESS).available(), 0);
    assert!(server.is_authenticated());
}

#[tokio::test]
async fn requests_after_success_disconnect() {
    let server_transport = TestTransport::new();
    let client_transport = TestTransport::new();
    let client = ClientAuthService::new(client_transport.clone(), "alice", "ssh-connection");
    let mut server = ServerAuthService::new(server_transport.clone(), chain_config("password"));

    client.request_password("sesame").unwrap();
    relay_to_server(&client_transport, &mut server).await.unwrap();
    assert!(server.is_authenticated());

    client.request_password("sesame").unwrap();
    assert!(relay_to_server(&client_transport, &mut server).await.is_err());
}
