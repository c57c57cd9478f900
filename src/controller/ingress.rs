//! Ingress reconciliation

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::networking::v1::Ingress;
use tracing::{debug, instrument};

use super::view::IngressView;
use super::watch::{Change, ChangeHandler};
use super::Controller;
use crate::crd::IngressV1Beta1;

impl Controller {
    /// Request certificates for every TLS entry of an opted-in ingress
    #[instrument(
        skip_all,
        fields(namespace = %ingress.meta.namespace, ingress = %ingress.meta.name)
    )]
    pub fn sync_ingress(&self, ingress: &IngressView) {
        if !ingress.meta.is_opted_in() {
            return;
        }
        if !self.is_supported_ingress_controller(ingress) {
            return;
        }

        debug!(entries = ingress.tls.len(), "Syncing ingress TLS");
        for block in &ingress.tls {
            self.sync_tls_block(&ingress.meta.namespace, block);
        }
    }

    /// Handle an ingress change of any API version
    pub async fn on_ingress_change(&self, change: Change<IngressView>) {
        self.reconcile_change(change, Self::sync_ingress).await;
    }
}

#[async_trait]
impl ChangeHandler<Ingress> for Controller {
    async fn handle(&self, change: Change<Arc<Ingress>>) {
        self.on_ingress_change(change.map(|i| IngressView::from(i.as_ref())))
            .await;
    }
}

#[async_trait]
impl ChangeHandler<IngressV1Beta1> for Controller {
    async fn handle(&self, change: Change<Arc<IngressV1Beta1>>) {
        self.on_ingress_change(change.map(|i| IngressView::from(i.as_ref())))
            .await;
    }
}
