//! Certificate issuance manager
//!
//! The manager owns the pipeline from demand to stored certificate:
//!
//! 1. [`CertificateObtainer::obtain_certificate`] records the newest request per
//!    secret key and enqueues the key. Repeated calls for one key collapse into a
//!    single queue entry; the worker always reads the latest request.
//! 2. Workers dequeue keys, reserve quota sized to the domain count, ask the
//!    authority for a certificate and persist it as a managed secret, then
//!    commit or roll back the reservation.
//! 3. A renewal timer re-enqueues managed secrets that are close to expiry.
//!
//! A release that arrives while a worker is issuing for the same key is
//! recorded against the in-flight entry; the worker then discards the
//! certificate instead of storing it, so a reclaimed secret never comes back.

mod queue;

pub use queue::WorkQueue;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::authority::Authority;
use crate::certificate::{
    build_managed_secret, is_managed, secret_key, CertificateRequest, ManagedSecret, SecretClient,
};
use crate::quota::{Quota, QuotaError};
use crate::retry::RetryConfig;
use crate::Error;

/// Receiver of certificate demand from the controller
#[cfg_attr(test, automock)]
pub trait CertificateObtainer: Send + Sync {
    /// Request (re)issuance; a newer request for the same secret replaces an older one
    fn obtain_certificate(&self, request: CertificateRequest);

    /// Give back the quota held by a secret that was reclaimed
    fn release_certificate(&self, namespace: &str, name: &str);
}

/// Tunables of the manager
#[derive(Clone, Debug)]
pub struct ManagerConfig {
    /// Ownership label value written on managed secrets
    pub controller_name: String,
    /// Renew certificates whose remaining validity drops below this
    pub renew_before: Duration,
    /// How often managed secrets are scanned for renewal
    pub renewal_interval: Duration,
    /// Number of concurrent workers
    pub workers: usize,
    /// Retries of a failing request before it is dropped
    pub max_retries: u32,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            controller_name: crate::DEFAULT_CONTROLLER_NAME.to_string(),
            renew_before: Duration::from_secs(30 * 24 * 3600),
            renewal_interval: Duration::from_secs(3600),
            workers: 4,
            max_retries: 10,
        }
    }
}

/// Deduplicating, quota-admitted certificate issuer
pub struct Manager {
    config: ManagerConfig,
    requests: Mutex<HashMap<String, CertificateRequest>>,
    /// Keys a worker is issuing for, flagged once released meanwhile
    in_flight: Mutex<HashMap<String, bool>>,
    queue: Arc<WorkQueue<String>>,
    restored: watch::Sender<bool>,
    quota: Arc<Quota>,
    authority: Arc<dyn Authority>,
    secrets: Arc<dyn SecretClient>,
}

impl Manager {
    /// Create a manager
    pub fn new(
        config: ManagerConfig,
        quota: Arc<Quota>,
        authority: Arc<dyn Authority>,
        secrets: Arc<dyn SecretClient>,
    ) -> Self {
        let queue = Arc::new(WorkQueue::new(RetryConfig::requeue(config.max_retries)));
        Self {
            config,
            requests: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
            queue,
            restored: watch::channel(false).0,
            quota,
            authority,
            secrets,
        }
    }

    /// Number of secret keys waiting for a worker
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Resolve once the startup quota restore has finished
    pub async fn quota_restored(&self) {
        let mut restored = self.restored.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = restored.wait_for(|done| *done).await;
    }

    /// Run workers and the renewal timer until `token` is cancelled.
    ///
    /// On cancellation the queue stops dispatching; workers finish the item
    /// they hold, relying on the authority's own timeout, and exit.
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        self.restore_quota().await;

        let mut workers = JoinSet::new();
        for id in 0..self.config.workers.max(1) {
            let manager = Arc::clone(&self);
            workers.spawn(async move {
                debug!(worker = id, "Certificate worker started");
                while manager.process_next_item().await {}
                debug!(worker = id, "Certificate worker stopped");
            });
        }

        let renewal = {
            let manager = Arc::clone(&self);
            let token = token.clone();
            tokio::spawn(async move { manager.run_renewal(token).await })
        };

        info!(workers = self.config.workers, "Certificate manager started");
        token.cancelled().await;

        self.queue.shutdown();
        while workers.join_next().await.is_some() {}
        if let Err(e) = renewal.await {
            warn!(error = %e, "Renewal task ended abnormally");
        }
        info!("Certificate manager stopped");
    }

    async fn run_renewal(&self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.renewal_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => {}
            }

            match self.renew_expiring_certificates().await {
                Ok(0) => debug!("No certificates due for renewal"),
                Ok(count) => info!(count, "Enqueued certificates for renewal"),
                Err(e) => error!(error = %e, "Renewal scan failed"),
            }
        }
    }

    /// Dequeue and handle one key; false once the queue is shut down
    async fn process_next_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };

        // Registered before the request is taken so a concurrent release sees it.
        self.in_flight.lock().insert(key.clone(), false);

        // Taking the request keeps the map bounded by queued + in-flight keys.
        let request = self.requests.lock().remove(&key);
        match request {
            Some(request) => match self.resolve_and_store_certificate(&request).await {
                Ok(()) => self.queue.forget(&key),
                Err(e) => self.handle_failure(&key, request, e),
            },
            None => debug!(secret = %key, "Request withdrawn before processing"),
        }

        // A release recorded meanwhile also drops what an earlier issuance acquired.
        let released = self.in_flight.lock().remove(&key) == Some(true);
        if released {
            self.release_quota(&key);
        }
        self.queue.done(&key);
        true
    }

    fn handle_failure(&self, key: &str, request: CertificateRequest, err: Error) {
        if self.released_in_flight(key) {
            debug!(secret = %key, error = %err, "Request released while in flight, not retrying");
            self.queue.forget(key);
            return;
        }

        if err.is_pending() {
            debug!(secret = %key, "Certificate not ready yet, will retry");
            self.requeue(key, request);
            return;
        }

        if let Error::Quota(ref e) = err {
            warn!(secret = %key, error = %e, "Certificate request not admitted, dropping");
            self.queue.forget(key);
            return;
        }

        let attempts = self.queue.num_requeues(key);
        if err.is_retryable() && attempts < self.config.max_retries {
            error!(
                secret = %key,
                attempt = attempts + 1,
                error = %err,
                "Failed to obtain certificate, retrying"
            );
            self.requeue(key, request);
        } else {
            error!(
                secret = %key,
                attempts = attempts + 1,
                error = %err,
                "Failed to obtain certificate, dropping"
            );
            self.queue.forget(key);
        }
    }

    fn released_in_flight(&self, key: &str) -> bool {
        self.in_flight.lock().get(key) == Some(&true)
    }

    fn release_quota(&self, key: &str) {
        match self.quota.tx(key, 0) {
            Ok(tx) => {
                tx.commit();
                debug!(secret = %key, "Released quota");
            }
            Err(QuotaError::Disabled) => {}
            Err(e) => warn!(secret = %key, error = %e, "Failed to release quota"),
        }
    }

    fn requeue(&self, key: &str, request: CertificateRequest) {
        // A newer request submitted while this one was in flight wins.
        self.requests
            .lock()
            .entry(key.to_string())
            .or_insert(request);
        self.queue.add_rate_limited(key.to_string());
    }

    /// Reserve quota, obtain a certificate and persist it as a managed secret
    #[instrument(skip(self, request), fields(secret = %request.key()))]
    pub async fn resolve_and_store_certificate(
        &self,
        request: &CertificateRequest,
    ) -> Result<(), Error> {
        let key = request.key();
        let namespace = request.namespace();
        let name = request.secret_name();

        if let Some(existing) = self.secrets.get(namespace, name).await? {
            if !is_managed(&existing.metadata, &self.config.controller_name) {
                return Err(Error::foreign_secret(namespace, name));
            }
        }

        let tx = self.quota.tx(&key, request.domains().len() as i64)?;

        let certificate = match self.authority.obtain(request.domains()).await {
            Ok(certificate) => certificate,
            Err(e) => {
                tx.rollback();
                return Err(e.into());
            }
        };

        if self.released_in_flight(&key) {
            tx.rollback();
            info!("Secret released while issuing, discarding certificate");
            return Ok(());
        }

        let secret = build_managed_secret(request, &certificate, &self.config.controller_name);
        if let Err(e) = self.secrets.apply(&secret).await {
            tx.rollback();
            return Err(e);
        }

        // Commit under the in-flight lock: a release either lands before and
        // is seen here, or after and finds the reservation committed.
        let released = {
            let mut in_flight = self.in_flight.lock();
            if in_flight.get(&key) == Some(&true) {
                true
            } else {
                in_flight.remove(&key);
                tx.commit();
                false
            }
        };
        if released {
            tx.rollback();
            info!("Secret released while storing, deleting it again");
            if let Err(e) = self.secrets.delete(namespace, name).await {
                error!(error = %e, "Failed to delete released secret");
            }
            return Ok(());
        }

        info!(
            domains = ?request.domains(),
            not_after = %certificate.not_after,
            "Certificate stored"
        );
        Ok(())
    }

    /// Enqueue every managed secret whose remaining validity is below the threshold.
    ///
    /// Returns how many secrets were enqueued.
    pub async fn renew_expiring_certificates(&self) -> Result<usize, Error> {
        let threshold = chrono::Duration::from_std(self.config.renew_before)
            .map_err(|e| Error::validation(format!("renewal threshold out of range: {e}")))?;
        let now = Utc::now();
        let mut renewed = 0;

        for secret in self.secrets.list_managed().await? {
            if !is_managed(&secret.metadata, &self.config.controller_name) {
                continue;
            }

            let managed = match ManagedSecret::from_secret(&secret) {
                Ok(managed) => managed,
                Err(e) => {
                    error!(error = %e, "Skipping managed secret with malformed bookkeeping");
                    continue;
                }
            };

            let remaining = managed.not_after - now;
            if remaining >= threshold {
                continue;
            }

            info!(
                namespace = %managed.namespace,
                secret = %managed.name,
                remaining_days = remaining.num_days(),
                "Certificate due for renewal"
            );
            self.obtain_certificate(managed.to_request());
            renewed += 1;
        }

        Ok(renewed)
    }

    /// Admit every existing managed secret into the quota.
    ///
    /// Run once at startup so usage survives restarts; [`Manager::quota_restored`]
    /// resolves once it returns.
    pub async fn restore_quota(&self) {
        self.admit_managed_secrets().await;
        self.restored.send_replace(true);
    }

    async fn admit_managed_secrets(&self) {
        if !self.quota.is_enabled() {
            debug!("Quota disabled, nothing to restore");
            return;
        }

        let secrets = match self.secrets.list_managed().await {
            Ok(secrets) => secrets,
            Err(e) => {
                warn!(error = %e, "Failed to list managed secrets for quota restore");
                return;
            }
        };

        for secret in &secrets {
            let managed = match ManagedSecret::from_secret(secret) {
                Ok(managed) => managed,
                Err(e) => {
                    warn!(error = %e, "Skipping managed secret during quota restore");
                    continue;
                }
            };
            let key = secret_key(&managed.namespace, &managed.name);
            match self.quota.tx(&key, managed.domains.len() as i64) {
                Ok(tx) => tx.commit(),
                Err(e) => warn!(secret = %key, error = %e, "Existing certificate exceeds quota"),
            }
        }

        info!(in_use = self.quota.used(), "Quota restored from managed secrets");
    }
}

impl CertificateObtainer for Manager {
    fn obtain_certificate(&self, request: CertificateRequest) {
        let key = request.key();
        debug!(secret = %key, domains = ?request.domains(), "Certificate requested");
        self.requests.lock().insert(key.clone(), request);
        self.queue.add(key);
    }

    fn release_certificate(&self, namespace: &str, name: &str) {
        let key = secret_key(namespace, name);
        self.requests.lock().remove(&key);

        let mut in_flight = self.in_flight.lock();
        if let Some(released) = in_flight.get_mut(&key) {
            *released = true;
            debug!(secret = %key, "Release recorded against in-flight request");
            return;
        }

        self.release_quota(&key);
    }
}
