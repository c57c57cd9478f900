//! Certificate controller
//!
//! Watches Ingresses, IngressRoutes, IngressClasses and Secrets and turns
//! their changes into certificate demand for the manager:
//!
//! - An opted-in resource with TLS entries gets a certificate per entry unless
//!   the target secret already holds one for the same domains, or belongs to
//!   somebody else.
//! - Secrets no opted-in resource references any more are reclaimed.
//! - A managed secret deleted behind our back is issued again.
//!
//! No handler runs before every cache has finished its initial listing; see
//! [`ReadyGate`].

mod cache;
mod discovery;
mod gate;
mod ingress;
mod ingress_class;
mod ingress_route;
mod secret;
mod view;
mod watch;

pub use cache::{ClusterCache, ReflectorCache};
pub use discovery::ApiSurface;
pub use gate::{GateState, ReadyGate};
pub use ingress_class::{
    is_supported_controller, known_default_controller, KNOWN_DEFAULT_CLASSES,
    SUPPORTED_CONTROLLERS,
};
pub use ingress_route::parse_host_rule;
pub use view::{
    ClassSource, IngressClassView, IngressRouteView, IngressView, ResourceMeta, SecretView,
    SecuredResource, TlsBlock, ANNOTATION_DEFAULT_INGRESS_CLASS, ANNOTATION_LEGACY_INGRESS_CLASS,
};
pub use watch::{dispatch, spawn_watch, Change, ChangeHandler, KindDispatch, StoreOnly};

#[cfg(test)]
pub use cache::MockClusterCache;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::api::networking::v1::{Ingress, IngressClass};
use kube::runtime::reflector;
use kube::{Api, Client};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::certificate::{CertificateRequest, SecretClient};
use crate::crd::{IngressClassV1Beta1, IngressRoute, IngressV1Beta1, PlatformIngressClass};
use crate::manager::CertificateObtainer;
use crate::Error;

/// Reconciliation logic shared by every watched kind
pub struct Controller {
    controller_name: String,
    cache: Arc<dyn ClusterCache>,
    obtainer: Arc<dyn CertificateObtainer>,
    secrets: Arc<dyn SecretClient>,
}

impl Controller {
    /// Create a controller reading through `cache`, issuing through `obtainer`
    /// and deleting through `secrets`
    pub fn new(
        controller_name: impl Into<String>,
        cache: Arc<dyn ClusterCache>,
        obtainer: Arc<dyn CertificateObtainer>,
        secrets: Arc<dyn SecretClient>,
    ) -> Self {
        Self {
            controller_name: controller_name.into(),
            cache,
            obtainer,
            secrets,
        }
    }

    /// Request a certificate for `block` unless its secret already satisfies it
    fn sync_tls_block(&self, namespace: &str, block: &TlsBlock) {
        if !block.is_actionable() {
            return;
        }

        if let Some(secret) = self.cache.secret(namespace, &block.secret_name) {
            if !secret.is_managed_by(&self.controller_name) {
                debug!(
                    namespace,
                    secret = %block.secret_name,
                    "Secret is not managed by this controller, skipping"
                );
                return;
            }
            if secret.domains.as_deref() == Some(block.domains.as_slice()) {
                return;
            }
        }

        self.obtainer.obtain_certificate(CertificateRequest::new(
            &block.domains,
            namespace,
            &block.secret_name,
        ));
    }

    /// Sync the new state of a resource and reclaim the secrets it dropped
    async fn reconcile_change<R, F>(&self, change: Change<R>, sync: F)
    where
        R: SecuredResource + Send + Sync,
        F: Fn(&Self, &R) + Send + Sync,
    {
        match change {
            Change::Added(resource) => sync(self, &resource),
            Change::Updated { old, new } => {
                let (before, after) = (old.meta(), new.meta());
                if before.resource_version.is_some()
                    && before.resource_version == after.resource_version
                {
                    return;
                }

                sync(self, &new);

                let kept = if after.is_opted_in() {
                    new.secret_names()
                } else {
                    BTreeSet::new()
                };
                let dropped: Vec<String> =
                    old.secret_names().difference(&kept).cloned().collect();
                if !dropped.is_empty() {
                    self.delete_unused_secrets(&after.namespace, &dropped).await;
                }
            }
            Change::Deleted(resource) => {
                let names: Vec<String> = resource.secret_names().into_iter().collect();
                if !names.is_empty() {
                    self.delete_unused_secrets(&resource.meta().namespace, &names)
                        .await;
                }
            }
        }
    }
}

/// Runtime settings of the controller
#[derive(Clone, Debug)]
pub struct ControllerSettings {
    /// Ownership label value
    pub controller_name: String,
    /// How long initial cache population may take before startup fails
    pub cache_sync_timeout: Duration,
}

/// Watch every served kind and reconcile until `token` is cancelled.
///
/// Fails with [`Error::CacheSync`] if the caches are not populated within
/// `cache_sync_timeout`; no handler has run at that point.
pub async fn run(
    client: Client,
    surface: &ApiSurface,
    settings: ControllerSettings,
    obtainer: Arc<dyn CertificateObtainer>,
    secrets: Arc<dyn SecretClient>,
    token: CancellationToken,
) -> Result<(), Error> {
    let ingresses = surface.ingress_v1.then(reflector::store::<Ingress>);
    let legacy_ingresses = surface.ingress_v1beta1.then(reflector::store::<IngressV1Beta1>);
    let ingress_routes = surface.ingress_route.then(reflector::store::<IngressRoute>);
    let platform_classes = surface
        .platform_ingress_class
        .then(reflector::store::<PlatformIngressClass>);
    let classes = surface.ingress_class_v1.then(reflector::store::<IngressClass>);
    let legacy_classes = surface
        .ingress_class_v1beta1
        .then(reflector::store::<IngressClassV1Beta1>);
    let secret_store = reflector::store::<Secret>();

    let cache = ReflectorCache {
        ingresses: ingresses.as_ref().map(|(s, _)| s.clone()),
        legacy_ingresses: legacy_ingresses.as_ref().map(|(s, _)| s.clone()),
        ingress_routes: ingress_routes.as_ref().map(|(s, _)| s.clone()),
        platform_classes: platform_classes.as_ref().map(|(s, _)| s.clone()),
        classes: classes.as_ref().map(|(s, _)| s.clone()),
        legacy_classes: legacy_classes.as_ref().map(|(s, _)| s.clone()),
        secrets: Some(secret_store.0.clone()),
    };

    let controller = Arc::new(Controller::new(
        settings.controller_name,
        Arc::new(cache),
        obtainer,
        secrets,
    ));
    let gate = Arc::new(ReadyGate::new());
    let watch_token = token.child_token();
    let mut tasks = Vec::new();

    if let Some(pair) = ingresses {
        tasks.push(spawn_watch(
            "Ingress/v1",
            Api::all(client.clone()),
            pair,
            &gate,
            controller.clone(),
            watch_token.clone(),
        ));
    }
    if let Some(pair) = legacy_ingresses {
        tasks.push(spawn_watch(
            "Ingress/v1beta1",
            Api::all(client.clone()),
            pair,
            &gate,
            controller.clone(),
            watch_token.clone(),
        ));
    }
    if let Some(pair) = ingress_routes {
        tasks.push(spawn_watch(
            "IngressRoute",
            Api::all(client.clone()),
            pair,
            &gate,
            controller.clone(),
            watch_token.clone(),
        ));
    }
    if let Some(pair) = platform_classes {
        tasks.push(spawn_watch(
            "IngressClass/platform",
            Api::all(client.clone()),
            pair,
            &gate,
            Arc::new(StoreOnly),
            watch_token.clone(),
        ));
    }
    if let Some(pair) = classes {
        tasks.push(spawn_watch(
            "IngressClass/v1",
            Api::all(client.clone()),
            pair,
            &gate,
            Arc::new(StoreOnly),
            watch_token.clone(),
        ));
    }
    if let Some(pair) = legacy_classes {
        tasks.push(spawn_watch(
            "IngressClass/v1beta1",
            Api::all(client.clone()),
            pair,
            &gate,
            Arc::new(StoreOnly),
            watch_token.clone(),
        ));
    }
    tasks.push(spawn_watch(
        "Secret",
        Api::all(client),
        secret_store,
        &gate,
        controller,
        watch_token.clone(),
    ));

    gate.start();
    info!(kinds = ?gate.pending(), "Waiting for caches to sync");

    let synced = tokio::select! {
        _ = token.cancelled() => true,
        result = tokio::time::timeout(settings.cache_sync_timeout, gate.wait_ready()) => {
            result.is_ok()
        }
    };

    if !synced {
        let pending = gate.pending();
        watch_token.cancel();
        join_all(tasks).await;
        return Err(Error::cache_sync(format!(
            "caches not synced within {}s: {}",
            settings.cache_sync_timeout.as_secs(),
            pending.join(", ")
        )));
    }

    if gate.is_ready() {
        info!("Controller ready");
    }
    token.cancelled().await;
    join_all(tasks).await;
    info!("Controller stopped");
    Ok(())
}
