//! Platform-defined IngressClass
//!
//! Platform classes take precedence over the native `networking.k8s.io`
//! classes of the same name. The default-class annotation works the same way
//! as on native classes.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification of a platform IngressClass
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "certpilot.dev",
    version = "v1alpha1",
    kind = "IngressClass",
    root = "PlatformIngressClass",
    plural = "ingressclasses",
    shortname = "pic",
    namespaced = false,
    printcolumn = r#"{"name":"Controller","type":"string","jsonPath":".spec.controller"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PlatformIngressClassSpec {
    /// Controller implementing this class, e.g. `traefik.io/ingress-controller`
    pub controller: String,
}
