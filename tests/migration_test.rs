//! End-to-end migration scenarios over the in-memory record store

use fieldencryption::migrate::{MigrationObserver, MigrationReport, SUPPRESSED_CHANNELS};
use fieldencryption::{
    EligibleEntity, EncryptedFieldCodec, Encryptor, EntityMetadata, Error, FieldValues,
    FileKeyProvider, InMemoryRecordStore, InMemorySchemaRegistry, KeyProvider, MigrationEngine,
    MigrationMode, MigrationOptions, StaticKeyProvider, ENCRYPTED_TEXT_TYPE, ENCRYPTION_MARKER,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

fn customer_registry() -> Arc<InMemorySchemaRegistry> {
    Arc::new(
        InMemorySchemaRegistry::new().with_entity(
            EntityMetadata::new("customer")
                .with_field("email", ENCRYPTED_TEXT_TYPE)
                .with_field("name", "text"),
        ),
    )
}

fn store_for(
    mode: MigrationMode,
    dry_run: bool,
    registry: &InMemorySchemaRegistry,
    provider: Arc<dyn KeyProvider>,
) -> Arc<InMemoryRecordStore> {
    let encryptor = Arc::new(Encryptor::new(provider));
    let codec = Arc::new(EncryptedFieldCodec::with_mode(
        encryptor,
        mode.codec_mode(dry_run),
    ));
    let store = Arc::new(InMemoryRecordStore::new(codec, registry).unwrap());

    for name in SUPPRESSED_CHANNELS {
        store.register_channel(*name);
    }

    store
}

fn static_provider() -> Arc<dyn KeyProvider> {
    Arc::new(StaticKeyProvider::new(vec![7_u8; 32]).unwrap())
}

fn customer(email: Option<&str>, name: &str) -> FieldValues {
    HashMap::from([
        ("email".to_string(), email.map(String::from)),
        ("name".to_string(), Some(name.to_string())),
    ])
}

fn seed_plaintext(store: &InMemoryRecordStore, count: u64) {
    for id in 1..=count {
        store
            .insert_raw(
                "customer",
                id,
                customer(Some(&format!("user{}@example.com", id)), "User"),
            )
            .unwrap();
    }
}

fn run_migration(
    store: &Arc<InMemoryRecordStore>,
    registry: &Arc<InMemorySchemaRegistry>,
    mode: MigrationMode,
    dry_run: bool,
) -> fieldencryption::Result<MigrationReport> {
    let options = MigrationOptions::new(mode).with_dry_run(dry_run);

    MigrationEngine::new(store.clone(), registry.clone(), options).run()
}

/// Observer recording every progress notification
#[derive(Default)]
struct RecordingObserver {
    progress: Mutex<Vec<(u64, u64)>>,
}

impl MigrationObserver for RecordingObserver {
    fn run_started(&self, _mode: MigrationMode, _dry_run: bool, _entities: &[EligibleEntity]) {}

    fn entity_started(&self, _entity_type: &str, _total: u64) {}

    fn progress(&self, _entity_type: &str, processed: u64, total: u64) {
        self.progress.lock().unwrap().push((processed, total));
    }

    fn entity_finished(&self, _report: &fieldencryption::migrate::EntityReport) {}

    fn run_finished(&self, _report: &MigrationReport) {}
}

#[test]
fn test_encrypt_run_converts_plaintext_dataset() {
    let registry = customer_registry();
    let store = store_for(MigrationMode::Encrypt, false, &registry, static_provider());

    for id in 1..=3 {
        store
            .insert_raw(
                "customer",
                id,
                customer(Some(&format!("user{}@example.com", id)), "User"),
            )
            .unwrap();
    }
    store.insert_raw("customer", 4, customer(None, "No Email")).unwrap();
    store.insert_raw("customer", 5, customer(Some(""), "Empty")).unwrap();

    let report = run_migration(&store, &registry, MigrationMode::Encrypt, false).unwrap();

    assert_eq!(report.records_processed(), 5);
    assert_eq!(report.fields_queued(), 4);
    assert_eq!(report.commits(), 1);

    // Non-empty plaintext is now marked ciphertext
    for id in 1..=3 {
        let raw = store.raw_value("customer", id, "email").unwrap();
        assert!(raw.ends_with(ENCRYPTION_MARKER));
        assert_ne!(raw, format!("user{}@example.com", id));
    }

    // Null and empty values pass through untouched
    assert_eq!(store.raw_value("customer", 4, "email"), None);
    assert_eq!(store.raw_value("customer", 5, "email").unwrap(), "");

    // Non-eligible fields stay plaintext
    assert_eq!(store.raw_value("customer", 1, "name").unwrap(), "User");

    // Logical reads still see the original values
    let record = store.get("customer", 2).unwrap().unwrap();
    assert_eq!(record.value("email"), Some("user2@example.com"));
}

#[test]
fn test_second_encrypt_run_leaves_stored_bytes_unchanged() {
    let registry = customer_registry();
    let store = store_for(MigrationMode::Encrypt, false, &registry, static_provider());
    seed_plaintext(&store, 3);

    run_migration(&store, &registry, MigrationMode::Encrypt, false).unwrap();

    let before: Vec<_> = (1..=3)
        .map(|id| store.raw_value("customer", id, "email").unwrap())
        .collect();

    let report = run_migration(&store, &registry, MigrationMode::Encrypt, false).unwrap();
    assert_eq!(report.records_processed(), 3);

    let after: Vec<_> = (1..=3)
        .map(|id| store.raw_value("customer", id, "email").unwrap())
        .collect();

    // No fresh nonce, no new ciphertext: the rewrite recognized the marker
    assert_eq!(before, after);
}

#[test]
fn test_decrypt_run_restores_mixed_dataset_to_plaintext() {
    let registry = customer_registry();

    // Encrypt two records with one store
    let encrypted = store_for(MigrationMode::Encrypt, false, &registry, static_provider());
    seed_plaintext(&encrypted, 2);
    run_migration(&encrypted, &registry, MigrationMode::Encrypt, false).unwrap();

    // Seed a second store with the encrypted rows plus one plaintext straggler
    let store = store_for(MigrationMode::Decrypt, false, &registry, static_provider());
    for (id, values) in encrypted.export_raw("customer") {
        store.insert_raw("customer", id, values).unwrap();
    }
    store
        .insert_raw("customer", 3, customer(Some("user3@example.com"), "User"))
        .unwrap();

    let report = run_migration(&store, &registry, MigrationMode::Decrypt, false).unwrap();
    assert_eq!(report.records_processed(), 3);

    for id in 1..=3 {
        let raw = store.raw_value("customer", id, "email").unwrap();
        assert_eq!(raw, format!("user{}@example.com", id));
        assert!(!raw.ends_with(ENCRYPTION_MARKER));
    }
}

#[test]
fn test_batches_commit_every_fifty_records() {
    let registry = customer_registry();
    let store = store_for(MigrationMode::Encrypt, false, &registry, static_provider());
    seed_plaintext(&store, 120);

    let report = run_migration(&store, &registry, MigrationMode::Encrypt, false).unwrap();

    // Full batches after records 50 and 100, then the remainder of 20
    assert_eq!(report.commits(), 3);
    assert_eq!(store.commit_count(), 3);
    assert_eq!(report.records_processed(), 120);
    assert_eq!(report.fields_queued(), 120);
}

#[test]
fn test_dry_run_commits_nothing_but_reports_progress() {
    let registry = customer_registry();
    let store = store_for(MigrationMode::Encrypt, true, &registry, static_provider());
    seed_plaintext(&store, 120);

    let observer = Arc::new(RecordingObserver::default());
    let options = MigrationOptions::new(MigrationMode::Encrypt).with_dry_run(true);
    let report = MigrationEngine::new(store.clone(), registry.clone(), options)
        .with_observer(observer.clone())
        .run()
        .unwrap();

    assert!(report.dry_run);
    assert_eq!(report.records_processed(), 120);
    assert_eq!(report.fields_queued(), 120);
    assert_eq!(report.commits(), 0);
    assert_eq!(store.commit_count(), 0);

    // Every record was still classified and counted
    let progress = observer.progress.lock().unwrap();
    assert_eq!(progress.len(), 120);
    assert_eq!(*progress.last().unwrap(), (120, 120));

    // And nothing was written
    assert_eq!(
        store.raw_value("customer", 1, "email").unwrap(),
        "user1@example.com"
    );
}

#[test]
fn test_tampered_ciphertext_aborts_the_run() {
    let registry = customer_registry();
    let store = store_for(MigrationMode::Encrypt, false, &registry, static_provider());

    // A legitimate encrypted value with one corrupted character
    let codec = EncryptedFieldCodec::new(Arc::new(Encryptor::new(static_provider())));
    let stored = codec.to_storage(Some("user1@example.com")).unwrap().unwrap();
    let flipped = if stored.starts_with('A') { "B" } else { "A" };
    let tampered = format!("{}{}", flipped, &stored[1..]);

    store
        .insert_raw(
            "customer",
            1,
            HashMap::from([
                ("email".to_string(), Some(tampered)),
                ("name".to_string(), Some("User".to_string())),
            ]),
        )
        .unwrap();
    store
        .insert_raw("customer", 2, customer(Some("user2@example.com"), "User"))
        .unwrap();

    let result = run_migration(&store, &registry, MigrationMode::Encrypt, false);
    assert!(matches!(result, Err(Error::Decryption(_))));

    // The suspension guard was dropped on the error path, so side-effect
    // channels observe changes again
    store
        .insert("customer", customer(Some("new@example.com"), "New"))
        .unwrap();
    assert_eq!(store.delivered("search_index"), 1);
    assert_eq!(store.delivered("audit_history"), 1);
}

#[test]
fn test_run_without_eligible_entities_succeeds() {
    let registry = Arc::new(
        InMemorySchemaRegistry::new()
            .with_entity(EntityMetadata::new("invoice").with_field("total", "decimal"))
            .with_entity(
                EntityMetadata::new("person")
                    .abstract_base()
                    .with_field("secret", ENCRYPTED_TEXT_TYPE),
            ),
    );
    let store = store_for(MigrationMode::Encrypt, false, &registry, static_provider());

    let report = run_migration(&store, &registry, MigrationMode::Encrypt, false).unwrap();

    assert!(report.nothing_to_do());
    assert!(report.suspended_channels.is_empty());
    assert_eq!(store.commit_count(), 0);
}

#[test]
fn test_key_file_is_created_and_reused_across_runs() {
    let dir = tempfile::tempdir().unwrap();
    let key_path = dir.path().join("migration.key");
    let registry = customer_registry();

    let encrypted = store_for(
        MigrationMode::Encrypt,
        false,
        &registry,
        Arc::new(FileKeyProvider::new(&key_path)),
    );
    seed_plaintext(&encrypted, 2);
    run_migration(&encrypted, &registry, MigrationMode::Encrypt, false).unwrap();

    // The key was generated and persisted during the first encryption
    assert!(key_path.exists());

    // A fresh provider for the same path decrypts what the first one wrote
    let store = store_for(
        MigrationMode::Decrypt,
        false,
        &registry,
        Arc::new(FileKeyProvider::new(&key_path)),
    );
    for (id, values) in encrypted.export_raw("customer") {
        store.insert_raw("customer", id, values).unwrap();
    }
    run_migration(&store, &registry, MigrationMode::Decrypt, false).unwrap();

    for id in 1..=2 {
        assert_eq!(
            store.raw_value("customer", id, "email").unwrap(),
            format!("user{}@example.com", id)
        );
    }
}

#[test]
fn test_suppressed_channels_stay_silent_during_the_run() {
    let registry = customer_registry();
    let store = store_for(MigrationMode::Encrypt, false, &registry, static_provider());
    seed_plaintext(&store, 60);

    let report = run_migration(&store, &registry, MigrationMode::Encrypt, false).unwrap();

    assert_eq!(
        report.suspended_channels,
        vec!["search_index".to_string(), "audit_history".to_string()]
    );

    // Two commits happened, neither reached a suppressed channel
    assert_eq!(store.commit_count(), 2);
    assert_eq!(store.delivered("search_index"), 0);
    assert_eq!(store.delivered("audit_history"), 0);

    // Once the run is over, ordinary writes notify again
    store
        .insert("customer", customer(Some("new@example.com"), "New"))
        .unwrap();
    assert_eq!(store.delivered("search_index"), 1);
    assert_eq!(store.delivered("audit_history"), 1);
}
