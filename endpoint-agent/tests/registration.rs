use endpoint_agent::config::ConfigStore;
use endpoint_agent::nonce::NonceValidator;
use endpoint_agent::registration::{self, RegistrationKey};
use endpoint_devkit::test_utils::init_logging;
use endpoint_devkit::{MockCollector, RegisterMode};
use std::path::Path;

const SECRET: &str = "0123456789abcdef0123456789abcdef";
const ENDPOINT_ID: &str = "65f0a1b2c3d4e5f601234567";

async fn store_for(collector: &MockCollector, path: &Path) -> ConfigStore {
    let store = ConfigStore::load(path).await.unwrap();
    store.set(|c| {
        c.id = ENDPOINT_ID.to_string();
        c.remote_hosts = vec![collector.host()];
        c.secret = SECRET.to_string();
        c.transport.plaintext = true;
    });
    store
}

#[tokio::test]
async fn test_register_persists_key_material() {
    init_logging();
    let collector = MockCollector::start(SECRET).await.unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    let store = store_for(&collector, &path).await;

    let nonces = NonceValidator::new();
    registration::init(&store, &nonces).await.unwrap();

    let data = store.get();
    assert!(data.identity().is_ok());
    assert_eq!(data.server_public_key, collector.public_key());
    assert_eq!(collector.agent_public_key().as_deref(), Some(data.public_key.as_str()));
    assert_eq!(nonces.len(), 1);

    let reloaded = ConfigStore::load(&path).await.unwrap().get();
    assert_eq!(reloaded.private_key, data.private_key);
    assert_eq!(reloaded.server_public_key, data.server_public_key);

    // Complete key material means no second handshake
    registration::init(&store, &nonces).await.unwrap();
    assert_eq!(store.get().public_key, data.public_key);
    assert_eq!(nonces.len(), 1);
}

#[tokio::test]
async fn test_register_rejects_bad_responses() {
    init_logging();
    let collector = MockCollector::start(SECRET).await.unwrap();
    let dir = tempfile::tempdir().unwrap();
    let store = store_for(&collector, &dir.path().join("config.toml")).await;
    let nonces = NonceValidator::new();

    for (mode, kind) in [
        (RegisterMode::BadSignature, "authentication"),
        (RegisterMode::StaleTimestamp, "authentication"),
        (RegisterMode::NotFound, "request"),
        (RegisterMode::Reject, "request"),
    ] {
        collector.set_register_mode(mode);
        let err = registration::register(&store, &nonces).await.unwrap_err();
        assert_eq!(err.kind(), kind, "{:?}", mode);
        assert!(store.get().needs_registration());
    }
}

#[tokio::test]
async fn test_register_with_wrong_secret_fails() {
    init_logging();
    let collector = MockCollector::start(SECRET).await.unwrap();
    let dir = tempfile::tempdir().unwrap();
    let store = store_for(&collector, &dir.path().join("config.toml")).await;
    store.set(|c| c.secret = "wrong-secret".to_string());

    let err = registration::init(&store, &NonceValidator::new()).await.unwrap_err();
    assert_eq!(err.kind(), "request");
    assert!(collector.agent_public_key().is_none());
}

#[tokio::test]
async fn test_register_requires_identity() {
    let dir = tempfile::tempdir().unwrap();
    let store = ConfigStore::load(dir.path().join("config.toml")).await.unwrap();

    let err = registration::init(&store, &NonceValidator::new()).await.unwrap_err();
    assert_eq!(err.kind(), "parse");
}

#[tokio::test]
async fn test_registration_key_then_handshake() {
    init_logging();
    let collector = MockCollector::start(SECRET).await.unwrap();
    let dir = tempfile::tempdir().unwrap();
    let store = ConfigStore::load(dir.path().join("config.toml")).await.unwrap();
    store.set(|c| {
        c.transport.plaintext = true;
        c.public_key = "stale".to_string();
    });

    let key = RegistrationKey::from_parts(&collector.host(), &format!("{}_{}", ENDPOINT_ID, SECRET)).unwrap();
    registration::save_registration_key(&store, &key).await.unwrap();
    assert!(store.get().needs_registration());
    assert!(store.get().public_key.is_empty());

    registration::init(&store, &NonceValidator::new()).await.unwrap();
    assert!(store.get().identity().is_ok());
}
