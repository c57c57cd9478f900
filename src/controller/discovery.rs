//! Which of the watched APIs the cluster serves

use kube::discovery::Discovery;
use kube::Client;
use tracing::info;

use crate::Error;

const NETWORKING_GROUP: &str = "networking.k8s.io";
const TRAEFIK_GROUP: &str = "traefik.containo.us";
const PLATFORM_GROUP: &str = "certpilot.dev";

/// APIs to watch, resolved once at startup
///
/// `v1` and `v1beta1` of one kind share storage on the API server, so the
/// legacy version is only watched when `v1` is not served.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ApiSurface {
    /// `networking.k8s.io/v1` Ingress
    pub ingress_v1: bool,
    /// `networking.k8s.io/v1beta1` Ingress
    pub ingress_v1beta1: bool,
    /// `networking.k8s.io/v1` IngressClass
    pub ingress_class_v1: bool,
    /// `networking.k8s.io/v1beta1` IngressClass
    pub ingress_class_v1beta1: bool,
    /// Traefik IngressRoute
    pub ingress_route: bool,
    /// Platform IngressClass
    pub platform_ingress_class: bool,
}

impl ApiSurface {
    /// Run API discovery against the cluster
    pub async fn discover(client: &Client) -> Result<Self, Error> {
        let discovery = Discovery::new(client.clone()).run().await?;
        let surface = Self::from_served(|group, version, kind| {
            discovery
                .get(group)
                .map(|g| {
                    g.versioned_resources(version)
                        .iter()
                        .any(|(ar, _)| ar.kind == kind)
                })
                .unwrap_or(false)
        });
        info!(?surface, "Discovered served APIs");
        Ok(surface)
    }

    /// Build the surface from a `(group, version, kind) -> served` predicate
    pub fn from_served(served: impl Fn(&str, &str, &str) -> bool) -> Self {
        let ingress_v1 = served(NETWORKING_GROUP, "v1", "Ingress");
        let ingress_class_v1 = served(NETWORKING_GROUP, "v1", "IngressClass");

        Self {
            ingress_v1,
            ingress_v1beta1: !ingress_v1 && served(NETWORKING_GROUP, "v1beta1", "Ingress"),
            ingress_class_v1,
            ingress_class_v1beta1: !ingress_class_v1
                && served(NETWORKING_GROUP, "v1beta1", "IngressClass"),
            ingress_route: served(TRAEFIK_GROUP, "v1alpha1", "IngressRoute"),
            platform_ingress_class: served(PLATFORM_GROUP, "v1alpha1", "IngressClass"),
        }
    }
}
