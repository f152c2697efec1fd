//! Reconciliation scheduler.
//!
//! Declarations found in the clone are turned into [`CertificateRequest`]s and
//! pushed through a [`RateLimitedQueue`]. Workers pop one request at a time
//! and converge it:
//!
//! 1. ensure the authority resource matches the desired spec
//! 2. stop with [`ShimError::NotReady`] until the authority reports ready
//! 3. read the issued material
//! 4. copy it into the secret store, if one is configured
//! 5. write the artifact files and commit them, if enabled
//!
//! Success forgets the request's backoff; any failure requeues it with a
//! longer delay. Failures retrying cannot fix, such as committing without an
//! author, stop the scheduler instead. A full rescan runs at startup and once
//! per resync period.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use cert_shim_backends::{
    ensure_certificate, go_duration, update_certificate, CertificateData, CertificateResource,
    CertificateSpec, CertificateStatus, IssuanceAuthority, SecretSource, SecretStore, TlsMaterial,
    Validity,
};
use cert_shim_git::{CommitOutcome, Repository, RepositorySyncer};
use chrono::Utc;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::certificate::CertificateRequest;
use crate::config::ControllerOptions;
use crate::declaration::read_declaration;
use crate::discovery::find_declarations;
use crate::error::ShimError;
use crate::metrics::ReconcileMetrics;
use crate::queue::RateLimitedQueue;
use crate::Result;

/// Where artifact files are committed.
#[async_trait]
pub trait CommitSink: Send + Sync {
    /// Root of the working copy declarations are searched in.
    fn root(&self) -> &Path;

    /// Stage and commit `files`.
    async fn commit_files(&self, message: &str, files: &[PathBuf]) -> Result<CommitOutcome>;
}

#[async_trait]
impl<R: Repository> CommitSink for RepositorySyncer<R> {
    fn root(&self) -> &Path {
        self.local_path()
    }

    async fn commit_files(&self, message: &str, files: &[PathBuf]) -> Result<CommitOutcome> {
        Ok(self.add_files_and_commit(message, files).await?)
    }
}

/// External systems the scheduler reconciles against.
pub struct Collaborators {
    pub authority: Arc<dyn IssuanceAuthority>,
    pub secrets: Arc<dyn SecretSource>,
    /// Copy issued material here when set.
    pub store: Option<Arc<dyn SecretStore>>,
    pub repository: Arc<dyn CommitSink>,
}

struct Inner {
    options: ControllerOptions,
    queue: RateLimitedQueue<CertificateRequest>,
    collaborators: Collaborators,
    metrics: Arc<ReconcileMetrics>,
}

/// Rate-limited reconciliation of declared certificates.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(
        options: ControllerOptions,
        collaborators: Collaborators,
        metrics: Arc<ReconcileMetrics>,
    ) -> Self {
        Self::with_queue(options, collaborators, metrics, RateLimitedQueue::default())
    }

    /// Like [`Scheduler::new`] with a custom queue.
    pub fn with_queue(
        options: ControllerOptions,
        collaborators: Collaborators,
        metrics: Arc<ReconcileMetrics>,
        queue: RateLimitedQueue<CertificateRequest>,
    ) -> Self {
        Scheduler {
            inner: Arc::new(Inner {
                options,
                queue,
                collaborators,
                metrics,
            }),
        }
    }

    pub fn options(&self) -> &ControllerOptions {
        &self.inner.options
    }

    pub fn queue(&self) -> &RateLimitedQueue<CertificateRequest> {
        &self.inner.queue
    }

    pub fn metrics(&self) -> &Arc<ReconcileMetrics> {
        &self.inner.metrics
    }

    /// Parse every declaration under the clone and enqueue all requests.
    ///
    /// A declaration that fails to parse is logged and skipped. Returns the
    /// number of requests enqueued.
    pub async fn requeue_all(&self) -> Result<usize> {
        let root = self.inner.collaborators.repository.root();
        let files = find_declarations(root, &self.inner.options.config_file_name)?;

        let mut enqueued = 0;
        for file in files {
            self.inner.metrics.inc_declarations_scanned();
            let requests = match read_declaration(&file).await {
                Ok(requests) => requests,
                Err(e) => {
                    self.inner.metrics.inc_declaration_errors();
                    warn!(file = %file.display(), error = %e, "failed to read declaration");
                    continue;
                }
            };
            for request in requests {
                self.inner.queue.add(request);
                enqueued += 1;
            }
        }
        debug!(path = %root.display(), enqueued, "requeued all certificates");
        Ok(enqueued)
    }

    /// Desired authority resource for `request`.
    pub fn desired_resource(&self, request: &CertificateRequest) -> CertificateResource {
        let options = &self.inner.options;
        CertificateResource {
            namespace: options.namespace.clone(),
            name: request.safe_name(),
            spec: CertificateSpec {
                common_name: request.common_name.clone(),
                dns_names: request.sans.clone(),
                secret_name: request.secret_name(),
                issuer_ref: options.default_issuer.clone(),
                renew_before: Some(go_duration(options.renew_before)),
            },
            status: CertificateStatus::default(),
        }
    }

    /// Converge one request.
    pub async fn check_certificate(&self, request: &CertificateRequest) -> Result<()> {
        let options = &self.inner.options;
        let c = &self.inner.collaborators;

        debug!(
            host = %request.common_name,
            namespace = %options.namespace,
            name = %request.safe_name(),
            "ensuring certificate exists"
        );
        let (resource, _) = ensure_certificate(c.authority.as_ref(), self.desired_resource(request)).await?;
        if !resource.is_ready() {
            return Err(ShimError::NotReady(resource.key()));
        }

        let material = c
            .secrets
            .tls_material(&options.namespace, &request.secret_name())
            .await?;

        if let Some(store) = &c.store {
            self.copy_to_store(store.as_ref(), request, &resource, &material)
                .await?;
        }

        if options.push_to_git {
            let files = write_artifacts(request, &material).await?;
            let outcome = match c
                .repository
                .commit_files(&request.commit_message(), &files)
                .await
            {
                Ok(outcome) => outcome,
                Err(e) if e.is_fatal() => {
                    remove_artifacts(&files).await;
                    return Err(e);
                }
                Err(e) => return Err(e),
            };
            if outcome == CommitOutcome::Committed {
                self.inner.metrics.inc_commits();
            }
        }
        Ok(())
    }

    async fn copy_to_store(
        &self,
        store: &dyn SecretStore,
        request: &CertificateRequest,
        resource: &CertificateResource,
        material: &TlsMaterial,
    ) -> Result<()> {
        let renew_before = chrono::Duration::from_std(self.inner.options.renew_before)
            .map_err(|e| ShimError::Config(format!("renew before out of range: {e}")))?;
        let data = CertificateData {
            path: request.store_path.clone(),
            certificate: material.certificate.clone(),
            key: material.key.clone(),
            validity: Validity {
                not_after: resource.status.not_after,
                renewal_time: resource.status.renewal_time,
                renew_before,
            },
        };
        let update = update_certificate(store, &data, Utc::now()).await?;
        if update.written {
            self.inner.metrics.inc_store_writes();
        }
        Ok(())
    }

    /// Pop and converge one request. Returns `Ok(false)` once the queue is
    /// shut down and drained.
    ///
    /// A fatal error is returned instead of requeuing the request.
    pub async fn process_next(&self) -> Result<bool> {
        let Some(request) = self.inner.queue.get().await else {
            return Ok(false);
        };

        let queue = &self.inner.queue;
        let metrics = &self.inner.metrics;
        let result = match self.check_certificate(&request).await {
            Ok(()) => {
                queue.forget(&request);
                metrics.inc_reconciled();
                info!(host = %request.common_name, "successfully synced certificate");
                Ok(true)
            }
            Err(e) if e.is_fatal() => {
                queue.forget(&request);
                metrics.inc_failures();
                error!(host = %request.common_name, error = %e, "error syncing certificate, not retrying");
                Err(e)
            }
            Err(e) => {
                queue.add_rate_limited(request.clone());
                metrics.inc_requeues();
                let requeues = queue.num_requeues(&request);
                if e.is_not_ready() {
                    metrics.inc_not_ready();
                    info!(host = %request.common_name, requeues, "{e}, requeuing");
                } else {
                    metrics.inc_failures();
                    warn!(host = %request.common_name, requeues, error = %e, "error syncing certificate, requeuing");
                }
                Ok(true)
            }
        };
        queue.done(&request);
        result
    }

    async fn run_worker(self, id: usize) -> Result<()> {
        debug!(worker = id, "worker started");
        while self.process_next().await? {}
        debug!(worker = id, "worker stopped");
        Ok(())
    }

    /// Run workers, seed the queue and rescan once per resync period until
    /// `shutdown` flips to `true` or a worker hits a fatal error.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let options = &self.inner.options;
        info!(workers = options.workers, namespace = %options.namespace, "starting controller");

        let mut workers = JoinSet::new();
        for id in 0..options.workers.max(1) {
            workers.spawn(self.clone().run_worker(id));
        }

        if let Err(e) = self.requeue_all().await {
            warn!(error = %e, "failed to requeue certificates");
        }

        let period = options.resync_period;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut failure = None;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.requeue_all().await {
                        Ok(n) => info!(sync_period = ?period, enqueued = n, "requeued all certificates"),
                        Err(e) => warn!(error = %e, "failed to requeue certificates"),
                    }
                    self.inner.metrics.flush();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                Some(joined) = workers.join_next() => {
                    failure = worker_failure(joined);
                    if failure.is_some() {
                        break;
                    }
                }
            }
        }

        info!("stopping controller");
        self.inner.queue.shut_down();
        while let Some(joined) = workers.join_next().await {
            if failure.is_none() {
                failure = worker_failure(joined);
            }
        }
        self.inner.metrics.flush();
        failure.map_or(Ok(()), Err)
    }

    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<Result<()>> {
        let scheduler = self.clone();
        tokio::spawn(async move { scheduler.run(shutdown).await })
    }
}

fn worker_failure(joined: std::result::Result<Result<()>, JoinError>) -> Option<ShimError> {
    match joined {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e),
        Err(e) => {
            warn!(error = %e, "worker task failed");
            None
        }
    }
}

/// Remove artifacts that could not be committed.
async fn remove_artifacts(files: &[PathBuf]) {
    for path in files {
        if let Err(e) = tokio::fs::remove_file(path).await {
            warn!(path = %path.display(), error = %e, "failed to remove uncommitted artifact");
        }
    }
}

/// Write the certificate and key next to the declaration. Empty content is
/// rejected before anything is written.
pub async fn write_artifacts(
    request: &CertificateRequest,
    material: &TlsMaterial,
) -> Result<Vec<PathBuf>> {
    let files = [
        (request.cert_path(), &material.certificate),
        (request.key_path(), &material.key),
    ];
    if let Some((path, _)) = files.iter().find(|(_, content)| content.is_empty()) {
        return Err(ShimError::EmptyArtifact(path.clone()));
    }
    for (path, content) in &files {
        tokio::fs::write(path, content).await?;
    }
    Ok(files.into_iter().map(|(path, _)| path).collect())
}
