//! `networking.k8s.io/v1beta1` Ingress and IngressClass
//!
//! Served by clusters older than 1.22 and no longer shipped by k8s-openapi.
//! Only the fields the controller reads are modelled; everything else is
//! ignored on deserialization.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Specification of a v1beta1 Ingress
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "networking.k8s.io",
    version = "v1beta1",
    kind = "Ingress",
    root = "IngressV1Beta1",
    plural = "ingresses",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct IngressV1Beta1Spec {
    /// Name of the IngressClass
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress_class_name: Option<String>,

    /// TLS configuration
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tls: Vec<IngressTlsV1Beta1>,
}

/// TLS entry of a v1beta1 Ingress
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngressTlsV1Beta1 {
    /// Hosts covered by the certificate
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hosts: Vec<String>,

    /// Secret holding the certificate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,
}

/// Specification of a v1beta1 IngressClass
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "networking.k8s.io",
    version = "v1beta1",
    kind = "IngressClass",
    root = "IngressClassV1Beta1",
    plural = "ingressclasses",
    namespaced = false
)]
#[serde(rename_all = "camelCase")]
pub struct IngressClassV1Beta1Spec {
    /// Controller implementing this class
    #[serde(default)]
    pub controller: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_fields_are_ignored() {
        let ingress: IngressV1Beta1 = serde_json::from_value(serde_json::json!({
            "apiVersion": "networking.k8s.io/v1beta1",
            "kind": "Ingress",
            "metadata": {"name": "web", "namespace": "default"},
            "spec": {
                "backend": {"serviceName": "web", "servicePort": 80},
                "tls": [{"hosts": ["foo.com"], "secretName": "mysecret"}]
            }
        }))
        .unwrap();

        assert_eq!(ingress.spec.tls[0].hosts, vec!["foo.com"]);
        assert_eq!(ingress.spec.tls[0].secret_name.as_deref(), Some("mysecret"));
        assert!(ingress.spec.ingress_class_name.is_none());
    }
}
