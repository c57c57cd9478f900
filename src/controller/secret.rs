//! Secret reclamation and re-issuance

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use tracing::{debug, error, info, instrument};

use super::view::{SecretView, SecuredResource, TlsBlock};
use super::watch::{Change, ChangeHandler};
use super::Controller;

fn names_secret<'a>(
    resource: &'a impl SecuredResource,
    secret_name: &'a str,
) -> impl Iterator<Item = &'a TlsBlock> + 'a {
    resource
        .tls_blocks()
        .into_iter()
        .filter(move |block| block.secret_name == secret_name)
}

impl Controller {
    /// Whether a live opted-in resource in `namespace` points at `name`
    pub fn is_secret_referenced(&self, namespace: &str, name: &str) -> bool {
        let ingresses = self.cache.ingresses(namespace);
        let routes = self.cache.ingress_routes(namespace);

        ingresses
            .iter()
            .filter(|i| i.meta.is_opted_in())
            .any(|i| names_secret(i, name).next().is_some())
            || routes
                .iter()
                .filter(|r| r.meta.is_opted_in())
                .any(|r| names_secret(r, name).next().is_some())
    }

    /// Issue again for every live TLS entry that still wants the deleted secret
    #[instrument(skip_all, fields(namespace = %secret.namespace, secret = %secret.name))]
    pub fn secret_deleted(&self, secret: &SecretView) {
        let namespace = secret.namespace.as_str();
        let mut blocks = 0;

        for ingress in self.cache.ingresses(namespace) {
            if !ingress.meta.is_opted_in() || !self.is_supported_ingress_controller(&ingress) {
                continue;
            }
            for block in names_secret(&ingress, &secret.name) {
                blocks += 1;
                self.sync_tls_block(namespace, block);
            }
        }

        for route in self.cache.ingress_routes(namespace) {
            if !route.meta.is_opted_in() {
                continue;
            }
            for block in names_secret(&route, &secret.name) {
                blocks += 1;
                self.sync_tls_block(namespace, block);
            }
        }

        if blocks > 0 {
            info!(blocks, "Secret still in use, requesting it again");
        }
    }

    /// Delete the managed secrets among `names` nothing references any more
    pub async fn delete_unused_secrets(&self, namespace: &str, names: &[String]) {
        for name in names {
            let Some(secret) = self.cache.secret(namespace, name) else {
                debug!(namespace, secret = %name, "Secret not found, nothing to reclaim");
                continue;
            };
            if !secret.is_managed_by(&self.controller_name) {
                continue;
            }
            if self.is_secret_referenced(namespace, name) {
                debug!(namespace, secret = %name, "Secret still referenced, keeping it");
                continue;
            }

            match self.secrets.delete(namespace, name).await {
                Ok(()) => {
                    info!(namespace, secret = %name, "Deleted unused secret");
                    self.obtainer.release_certificate(namespace, name);
                }
                Err(e) => {
                    error!(namespace, secret = %name, error = %e, "Failed to delete unused secret");
                }
            }
        }
    }
}

#[async_trait]
impl ChangeHandler<Secret> for Controller {
    async fn handle(&self, change: Change<Arc<Secret>>) {
        if let Change::Deleted(secret) = change {
            self.secret_deleted(&SecretView::from(secret.as_ref()));
        }
    }
}
