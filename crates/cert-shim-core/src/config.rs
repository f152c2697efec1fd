//! Reconciliation options.

use std::time::Duration;

use cert_shim_backends::IssuerRef;

use crate::discovery::DEFAULT_DECLARATION_FILE;
use crate::error::ShimError;
use crate::Result;

/// Environment variable overriding the namespace certificates are created in.
pub const NAMESPACE_ENV: &str = "NAMESPACE";

pub const DEFAULT_NAMESPACE: &str = "kube-system";

/// Default lead time for renewals: 30 days.
pub const DEFAULT_RENEW_BEFORE: Duration = Duration::from_secs(720 * 3600);

/// Options of the reconciliation scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerOptions {
    pub namespace: String,
    /// File name searched for under the clone.
    pub config_file_name: String,
    pub default_issuer: IssuerRef,
    pub renew_before: Duration,
    /// Write artifact files and commit them.
    pub push_to_git: bool,
    /// Number of concurrent workers.
    pub workers: usize,
    /// Period of the full resync.
    pub resync_period: Duration,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        ControllerOptions {
            namespace: DEFAULT_NAMESPACE.to_string(),
            config_file_name: DEFAULT_DECLARATION_FILE.to_string(),
            default_issuer: IssuerRef {
                name: String::new(),
                kind: String::new(),
                group: String::new(),
            },
            renew_before: DEFAULT_RENEW_BEFORE,
            push_to_git: true,
            workers: 1,
            resync_period: cert_shim_git::DEFAULT_SYNC_PERIOD,
        }
    }
}

impl ControllerOptions {
    /// Apply the `NAMESPACE` override from `lookup`.
    pub fn with_namespace_from<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(ns) = lookup(NAMESPACE_ENV).filter(|ns| !ns.is_empty()) {
            self.namespace = ns;
        }
        self
    }

    /// Apply the `NAMESPACE` override from the process environment.
    pub fn with_namespace_from_env(self) -> Self {
        self.with_namespace_from(|k| std::env::var(k).ok())
    }

    pub fn validate(&self) -> Result<()> {
        let required = [
            ("config file name", &self.config_file_name),
            ("default issuer name", &self.default_issuer.name),
            ("default issuer kind", &self.default_issuer.kind),
            ("default issuer group", &self.default_issuer.group),
            ("namespace", &self.namespace),
        ];
        if let Some((what, _)) = required.iter().find(|(_, v)| v.trim().is_empty()) {
            return Err(ShimError::Config(format!("{what} is required")));
        }
        if self.workers == 0 {
            return Err(ShimError::Config("at least one worker is required".to_string()));
        }
        if self.resync_period.is_zero() {
            return Err(ShimError::Config("resync period must be positive".to_string()));
        }
        Ok(())
    }
}
