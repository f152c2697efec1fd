//! cert-shimd - Certificate Reconciliation Daemon
//!
//! Clones the certificate repository, keeps it in sync with its remote and
//! reconciles every certificate declared in it against cert-manager.
//!
//! ## Startup
//!
//! 1. Resolve git options and clone the repository
//! 2. Log in to Vault when certificates are pushed there
//! 3. Connect to the Kubernetes API with in-cluster credentials
//! 4. Run the syncer and the scheduler until SIGINT or SIGTERM

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use cert_shim_backends::{IssuerRef, KubeClient, SecretStore, VaultClient, VaultConfig};
use cert_shim_core::telemetry::{default_level, init_tracing};
use cert_shim_core::{
    Collaborators, ControllerOptions, ReconcileMetrics, Scheduler, DEFAULT_DECLARATION_FILE,
    DEFAULT_NAMESPACE,
};
use cert_shim_git::{GitConfig, GitOptions, RepositorySyncer, SyncMetrics, DEFAULT_BRANCH};
use clap::{ArgAction, Parser};
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(name = "cert-shimd")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Issues certificates declared in a git repository", long_about = None)]
struct Cli {
    /// Remote URL of the certificate repository
    #[arg(long, env = "GIT_REMOTE_URL")]
    git_remote_url: Option<String>,

    /// Branch to synchronize with
    #[arg(long, env = "GIT_BRANCH_NAME", default_value = DEFAULT_BRANCH)]
    git_branch_name: String,

    /// Name of the commit author
    #[arg(long, env = "GIT_AUTHOR_NAME", default_value = "certificate-bot")]
    git_author_name: String,

    /// Email of the commit author
    #[arg(long, env = "GIT_AUTHOR_EMAIL", default_value = "certificate-bot@example.com")]
    git_author_email: String,

    /// HTTPS token for the remote
    #[arg(long, env = "GIT_API_TOKEN", hide_env_values = true)]
    git_api_token: Option<String>,

    /// SSH private key file for the remote
    #[arg(long, env = "GIT_SSH_PRIVKEY_FILE")]
    git_ssh_privkey_file: Option<PathBuf>,

    /// Period in which synchronization with the remote is guaranteed
    #[arg(long, env = "GIT_SYNC_PERIOD_SECS", default_value_t = 900)]
    git_sync_period_secs: u64,

    /// Commit locally but never push
    #[arg(long, env = "DRY_RUN")]
    dry_run: bool,

    /// Write certificates into the repository and commit them
    #[arg(long, env = "PUSH_CERTIFICATES_TO_GIT", default_value_t = true, action = ArgAction::Set)]
    push_certificates_to_git: bool,

    /// Copy certificates into Vault
    #[arg(long, env = "VAULT_PUSH_CERTIFICATES")]
    vault_push_certificates: bool,

    /// Vault KV v2 engine certificates are written to
    #[arg(long, env = "VAULT_KV_ENGINE", default_value = "secrets")]
    vault_kv_engine: String,

    /// Directory to clone into (default: derived from the remote URL)
    #[arg(long, env = "LOCAL_PATH")]
    local_path: Option<PathBuf>,

    /// Remove and re-create the clone directory before cloning
    #[arg(long, env = "ENSURE_EMPTY_GIT_DIRECTORY", default_value_t = true, action = ArgAction::Set)]
    ensure_empty_git_directory: bool,

    /// Namespace certificates are created in. `NAMESPACE` takes precedence
    #[arg(long, default_value = DEFAULT_NAMESPACE)]
    namespace: String,

    /// Name of declaration files
    #[arg(long, env = "CONFIG_FILE_NAME", default_value = DEFAULT_DECLARATION_FILE)]
    config_file_name: String,

    /// Name of the issuer signing certificates
    #[arg(long, env = "DEFAULT_ISSUER_NAME", default_value = "")]
    default_issuer_name: String,

    /// Kind of the issuer signing certificates
    #[arg(long, env = "DEFAULT_ISSUER_KIND", default_value = "")]
    default_issuer_kind: String,

    /// Group of the issuer signing certificates
    #[arg(long, env = "DEFAULT_ISSUER_GROUP", default_value = "")]
    default_issuer_group: String,

    /// Renew certificates this long before they expire
    #[arg(long, env = "RENEW_CERTIFICATES_BEFORE_SECS", default_value_t = 720 * 3600)]
    renew_certificates_before_secs: u64,

    /// Number of concurrent reconciliation workers
    #[arg(long, env = "WORKERS", default_value_t = 1)]
    workers: usize,

    /// Enable debug logging
    #[arg(long, env = "DEBUG")]
    debug: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

impl Cli {
    fn git_options(&self) -> GitOptions {
        GitOptions {
            local_path: self.local_path.clone(),
            remote_url: self.git_remote_url.clone(),
            branch: self.git_branch_name.clone(),
            author_name: Some(self.git_author_name.clone()),
            author_email: Some(self.git_author_email.clone()),
            token: self.git_api_token.clone(),
            ssh_key_file: self.git_ssh_privkey_file.clone(),
            ensure_empty_directory: self.ensure_empty_git_directory,
            sync_period: Duration::from_secs(self.git_sync_period_secs),
            dry_run: self.dry_run,
        }
    }

    fn controller_options(&self) -> ControllerOptions {
        ControllerOptions {
            namespace: self.namespace.clone(),
            config_file_name: self.config_file_name.clone(),
            default_issuer: IssuerRef {
                name: self.default_issuer_name.clone(),
                kind: self.default_issuer_kind.clone(),
                group: self.default_issuer_group.clone(),
            },
            renew_before: Duration::from_secs(self.renew_certificates_before_secs),
            push_to_git: self.push_certificates_to_git,
            workers: self.workers,
            resync_period: Duration::from_secs(self.git_sync_period_secs),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json, default_level(cli.debug));

    if let Err(e) = run(cli).await {
        tracing::error!(error = ?e, "cert-shimd failed");
        return Err(e);
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let options = cli.controller_options().with_namespace_from_env();
    options.validate().context("invalid controller options")?;

    let git = cli
        .git_options()
        .resolve()
        .context("invalid git options")?;
    check_write_access(&options, &git)?;

    let sync_metrics = Arc::new(SyncMetrics::new());
    let syncer = RepositorySyncer::from_config(git, Arc::clone(&sync_metrics))
        .await
        .context("failed to initialize repository")?;

    let store: Option<Arc<dyn SecretStore>> = if cli.vault_push_certificates {
        let config = VaultConfig::from_env(&cli.vault_kv_engine).context("invalid vault options")?;
        let client = VaultClient::connect(config)
            .await
            .context("failed to log in to vault")?;
        Some(Arc::new(client))
    } else {
        None
    };

    let kube = Arc::new(KubeClient::in_cluster().context("failed to load in-cluster kubernetes config")?);

    let scheduler = Scheduler::new(
        options,
        Collaborators {
            authority: kube.clone(),
            secrets: kube,
            store,
            repository: Arc::new(syncer.clone()),
        },
        Arc::new(ReconcileMetrics::new()),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let syncer_task = syncer.spawn(shutdown_rx.clone());
    let mut scheduler_task = scheduler.spawn(shutdown_rx);

    info!(path = %syncer.local_path().display(), "cert-shimd started");
    let mut scheduler_result = None;
    tokio::select! {
        res = wait_for_signal() => {
            res?;
            info!("shutting down");
        }
        joined = &mut scheduler_task => {
            error!("controller stopped, shutting down");
            scheduler_result = Some(joined);
        }
    }

    let _ = shutdown_tx.send(true);
    let scheduler_result = match scheduler_result {
        Some(joined) => joined,
        None => scheduler_task.await,
    };
    if let Err(e) = syncer_task.await {
        warn!(error = %e, "syncer task failed");
    }
    sync_metrics.flush();
    scheduler_result
        .context("scheduler task failed")?
        .context("controller failed")
}

/// Committing certificates needs an author; refuse to start without one.
fn check_write_access(options: &ControllerOptions, git: &GitConfig) -> Result<()> {
    if options.push_to_git && git.author.is_none() {
        bail!("pushing certificates to git requires GIT_AUTHOR_NAME and GIT_AUTHOR_EMAIL");
    }
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res.context("failed to listen for ctrl-c")?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn parse(args: &[&str]) -> Cli {
        let mut argv = vec!["cert-shimd"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn flags_map_to_options() {
        let cli = parse(&[
            "--git-remote-url",
            "https://github.com/org/certs.git",
            "--default-issuer-name",
            "letsencrypt",
            "--default-issuer-kind",
            "ClusterIssuer",
            "--default-issuer-group",
            "cert-manager.io",
            "--git-sync-period-secs",
            "60",
            "--push-certificates-to-git",
            "false",
            "--workers",
            "2",
        ]);

        let git = cli.git_options();
        assert_eq!(git.remote_url.as_deref(), Some("https://github.com/org/certs.git"));
        assert_eq!(git.author_name.as_deref(), Some("certificate-bot"));
        assert_eq!(git.sync_period, Duration::from_secs(60));
        assert!(git.ensure_empty_directory);

        let options = cli.controller_options();
        assert_eq!(options.default_issuer.kind, "ClusterIssuer");
        assert_eq!(options.renew_before, Duration::from_secs(720 * 3600));
        assert_eq!(options.resync_period, Duration::from_secs(60));
        assert!(!options.push_to_git);
        assert_eq!(options.workers, 2);
        assert!(options.validate().is_ok());
    }

    fn resolve(cli: &Cli) -> GitConfig {
        cli.git_options().resolve_with(|_| None).unwrap()
    }

    #[test]
    fn push_without_author_is_rejected() {
        let cli = parse(&[
            "--git-remote-url",
            "https://github.com/org/certs.git",
            "--git-api-token",
            "t0ken",
            "--git-author-email",
            "",
        ]);
        let git = resolve(&cli);
        assert!(git.author.is_none());
        let err = check_write_access(&cli.controller_options(), &git).unwrap_err();
        assert!(err.to_string().contains("GIT_AUTHOR_EMAIL"));
    }

    #[test]
    fn read_only_clone_is_fine_without_push() {
        let cli = parse(&[
            "--git-remote-url",
            "https://github.com/org/certs.git",
            "--git-api-token",
            "t0ken",
            "--git-author-name",
            "",
            "--push-certificates-to-git",
            "false",
        ]);
        assert!(check_write_access(&cli.controller_options(), &resolve(&cli)).is_ok());

        let cli = parse(&[
            "--git-remote-url",
            "https://github.com/org/certs.git",
            "--git-api-token",
            "t0ken",
        ]);
        assert!(check_write_access(&cli.controller_options(), &resolve(&cli)).is_ok());
    }

    #[test]
    fn missing_issuer_fails_validation() {
        let cli = parse(&["--default-issuer-name", "letsencrypt"]);
        assert!(cli.controller_options().validate().is_err());
    }
}
