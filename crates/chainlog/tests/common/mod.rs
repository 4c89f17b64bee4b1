//! Shared helpers for the client integration tests.

use chainlog::{
    AuditClient, AuditConfig, Crud, CryptoConfig, EventInput, SignatureAlgorithm, StreamKey,
};

/// A connected client over an in-memory store, with Ed25519 keys (fast to
/// generate) and the `acme/prod` context bound.
pub async fn client_with(customize: impl FnOnce(&mut AuditConfig)) -> AuditClient {
    let (private_key_pem, public_key_pem) =
        chainlog::generate_keypair(SignatureAlgorithm::Ed25519).unwrap();
    let mut config = AuditConfig {
        crypto: CryptoConfig {
            algorithm: SignatureAlgorithm::Ed25519,
            private_key_pem,
            public_key_pem,
            ..CryptoConfig::default()
        },
        project_id: Some("acme".into()),
        environment_id: Some("prod".into()),
        ..AuditConfig::default()
    };
    customize(&mut config);
    AuditClient::connect(config).await.unwrap()
}

pub async fn client() -> AuditClient {
    client_with(|_| {}).await
}

pub fn bound_stream() -> StreamKey {
    StreamKey::new("acme", "prod")
}

pub fn submission(action: &str, actor: &str) -> EventInput {
    let mut input = EventInput::new(action, Crud::Create);
    input.actor_id = Some(actor.into());
    input
}
