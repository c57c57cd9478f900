//! Traefik IngressRoute
//!
//! Only the fields that carry TLS intent are modelled: the route match rules
//! (for `Host(...)` extraction) and the `tls` block.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification of a Traefik IngressRoute
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "traefik.containo.us",
    version = "v1alpha1",
    kind = "IngressRoute",
    plural = "ingressroutes",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct IngressRouteSpec {
    /// Entry points the routes are attached to
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entry_points: Vec<String>,

    /// Routing rules
    #[serde(default)]
    pub routes: Vec<Route>,

    /// TLS configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<RouteTls>,
}

/// A single routing rule
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    /// Match expression, e.g. ``Host(`a.example.com`) && PathPrefix(`/api`)``
    #[serde(rename = "match")]
    pub match_rule: String,

    /// Rule kind, usually `Rule`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

/// TLS section of an IngressRoute
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RouteTls {
    /// Secret holding the certificate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,

    /// Explicit certificate domains; when empty, hosts come from the match rules
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub domains: Vec<RouteDomain>,
}

/// Main domain plus subject alternative names
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct RouteDomain {
    /// Main domain
    #[serde(default)]
    pub main: String,

    /// Subject alternative names
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sans: Vec<String>,
}
