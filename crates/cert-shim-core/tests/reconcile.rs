//! Scheduler driving a syncer over an in-memory repository.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use cert_shim_backends::fakes::{FakeAuthority, FakeSecretSource, FakeSecretStore};
use cert_shim_backends::{IssuerRef, TLS_CERT_KEY, TLS_KEY_KEY};
use cert_shim_core::{Collaborators, ControllerOptions, ReconcileMetrics, Scheduler};
use cert_shim_git::fakes::FakeRepository;
use cert_shim_git::{RepositorySyncer, RetryPolicy, SyncMetrics, SyncOutcome, SyncSettings};
use chrono::{TimeZone, Utc};

const NAMESPACE: &str = "kube-system";

struct Harness {
    _dir: tempfile::TempDir,
    root: PathBuf,
    repo: FakeRepository,
    syncer: RepositorySyncer<FakeRepository>,
    authority: Arc<FakeAuthority>,
    secrets: Arc<FakeSecretSource>,
    store: Arc<FakeSecretStore>,
    scheduler: Scheduler,
}

fn options() -> ControllerOptions {
    ControllerOptions {
        default_issuer: IssuerRef {
            name: "letsencrypt".to_string(),
            kind: "ClusterIssuer".to_string(),
            group: "cert-manager.io".to_string(),
        },
        ..ControllerOptions::default()
    }
}

async fn harness(declaration: &str, authority: FakeAuthority) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("repo");
    std::fs::create_dir_all(root.join("team")).unwrap();
    std::fs::write(root.join("team/certificates.yaml"), declaration).unwrap();

    let repo = FakeRepository::new(&root);
    let settings = SyncSettings {
        period: Duration::from_secs(60),
        dry_run: false,
        retry: RetryPolicy::default(),
    };
    let syncer = RepositorySyncer::init(repo.clone(), settings, Arc::new(SyncMetrics::new()))
        .await
        .unwrap();

    let authority = Arc::new(authority);
    let secrets = Arc::new(FakeSecretSource::new());
    let store = Arc::new(FakeSecretStore::new("https://vault.example.com"));
    let scheduler = Scheduler::new(
        options(),
        Collaborators {
            authority: authority.clone(),
            secrets: secrets.clone(),
            store: Some(store.clone()),
            repository: Arc::new(syncer.clone()),
        },
        Arc::new(ReconcileMetrics::new()),
    );

    Harness {
        _dir: dir,
        root,
        repo,
        syncer,
        authority,
        secrets,
        store,
        scheduler,
    }
}

fn issue(secrets: &FakeSecretSource, secret_name: &str) {
    secrets.insert(
        NAMESPACE,
        secret_name,
        &[
            (TLS_CERT_KEY, b"CERT".as_slice()),
            (TLS_KEY_KEY, b"KEY".as_slice()),
        ],
    );
}

fn read(path: &Path) -> String {
    std::fs::read_to_string(path).unwrap()
}

#[tokio::test]
async fn ready_certificate_is_written_committed_and_stored() {
    let h = harness("certificates:\n  - cn: a.example.com\n", FakeAuthority::issuing()).await;
    issue(&h.secrets, "tls-a-example-com");

    assert_eq!(h.scheduler.requeue_all().await.unwrap(), 1);
    assert!(h.scheduler.process_next().await.unwrap());

    let cert = h.root.join("team/a-example-com.pem");
    let key = h.root.join("team/a-example-com-key.pem");
    assert_eq!(read(&cert), "CERT");
    assert_eq!(read(&key), "KEY");

    let log = h.repo.commit_log();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].message, "added certificate for a.example.com");
    assert_eq!(log[0].files, vec![cert, key]);

    let resource = h.authority.resource(NAMESPACE, "a-example-com").unwrap();
    assert_eq!(resource.spec.dns_names, vec!["a.example.com"]);
    assert_eq!(resource.spec.secret_name, "tls-a-example-com");

    let payload = h.store.payload("a.example.com").unwrap();
    assert_eq!(payload["certificate"], "CERT");
    assert_eq!(payload["private-key"], "KEY");
    assert_eq!(h.store.metadata("a.example.com")["username"], "UNLINKED");

    assert_eq!(h.syncer.sync().await.unwrap(), SyncOutcome::Pushed);
    assert_eq!(h.repo.remote_commits().last(), Some(&log[0].id));
    assert_eq!(h.scheduler.metrics().reconciled(), 1);
    assert_eq!(h.scheduler.metrics().commits(), 1);
}

#[tokio::test]
async fn second_pass_changes_nothing() {
    let h = harness("certificates:\n  - cn: a.example.com\n", FakeAuthority::issuing()).await;
    issue(&h.secrets, "tls-a-example-com");

    for _ in 0..2 {
        h.scheduler.requeue_all().await.unwrap();
        assert!(h.scheduler.process_next().await.unwrap());
    }

    assert_eq!(h.repo.commit_log().len(), 1);
    assert_eq!(h.authority.creates(), 1);
    assert_eq!(h.authority.patches(), 0);
    assert_eq!(h.store.writes(), 1);
    assert_eq!(h.store.metadata_patches(), 1);
    assert_eq!(h.scheduler.metrics().reconciled(), 2);
    assert_eq!(h.scheduler.metrics().commits(), 1);
}

#[tokio::test]
async fn wildcard_names() {
    let decl = "vault:\n  path: \"certs/{{ .PathSafeCommonName }}\"\ncertificates:\n  - cn: \"*.example.com\"\n";
    let h = harness(decl, FakeAuthority::issuing()).await;
    issue(&h.secrets, "tls-wildcard-example-com");

    h.scheduler.requeue_all().await.unwrap();
    assert!(h.scheduler.process_next().await.unwrap());

    assert!(h.authority.resource(NAMESPACE, "wildcard-example-com").is_some());
    assert_eq!(read(&h.root.join("team/wildcard-example-com.pem")), "CERT");
    assert_eq!(read(&h.root.join("team/wildcard-example-com-key.pem")), "KEY");
    assert!(h.store.payload("certs/wildcard.example.com").is_some());
    assert_eq!(
        h.repo.commit_log()[0].message,
        "added certificate for *.example.com"
    );
}

#[tokio::test(start_paused = true)]
async fn pending_issuance_converges_after_backoff() {
    let h = harness(
        "certificates:\n  - cn: a.example.com\n    sans: [b.example.com]\n",
        FakeAuthority::new(),
    )
    .await;

    h.scheduler.requeue_all().await.unwrap();
    assert!(h.scheduler.process_next().await.unwrap());
    assert!(h.repo.commit_log().is_empty());
    assert_eq!(h.scheduler.metrics().not_ready(), 1);

    let not_after = Utc.with_ymd_and_hms(2027, 1, 31, 0, 0, 0).unwrap();
    h.authority.mark_ready(NAMESPACE, "a-example-com", Some(not_after));
    issue(&h.secrets, "tls-a-example-com");

    assert!(h.scheduler.process_next().await.unwrap());
    assert_eq!(h.repo.commit_log().len(), 1);
    assert_eq!(h.scheduler.metrics().reconciled(), 1);

    let metadata = h.store.metadata("a.example.com");
    assert_eq!(metadata["expiry_date"], "2027-01-31");
    assert_eq!(metadata["review_date"], "2027-01-01");

    let resource = h.authority.resource(NAMESPACE, "a-example-com").unwrap();
    assert_eq!(resource.spec.dns_names, vec!["a.example.com", "b.example.com"]);
}

#[tokio::test]
async fn missing_secret_is_retried_without_writing() {
    let h = harness("certificates:\n  - cn: a.example.com\n", FakeAuthority::issuing()).await;

    h.scheduler.requeue_all().await.unwrap();
    assert!(h.scheduler.process_next().await.unwrap());

    assert!(!h.root.join("team/a-example-com.pem").exists());
    assert!(h.repo.commit_log().is_empty());
    assert_eq!(h.store.writes(), 0);
    assert_eq!(h.scheduler.metrics().failures(), 1);
    assert_eq!(h.scheduler.queue().waiting(), 1);
}
