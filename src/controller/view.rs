//! Canonical views of watched resources
//!
//! Every watched type is normalized here, once per fetch, into the shape the
//! reconciliation logic works on. Ingresses from `networking.k8s.io/v1` and
//! `v1beta1` become the same [`IngressView`]; the three IngressClass sources
//! become [`IngressClassView`]. Nothing outside this module looks at an API
//! version.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::api::networking::v1::{Ingress, IngressClass};
use kube::ResourceExt;

use super::ingress_route::parse_host_rule;
use crate::certificate::{parse_domains, sanitize_domains};
use crate::crd::{IngressClassV1Beta1, IngressRoute, IngressV1Beta1, PlatformIngressClass};
use crate::{is_opted_in, ANNOTATION_CERTIFICATE_DOMAINS, LABEL_MANAGED_BY};

/// Annotation naming the class on ingresses that predate `ingressClassName`
pub const ANNOTATION_LEGACY_INGRESS_CLASS: &str = "kubernetes.io/ingress.class";

/// Annotation marking an IngressClass as the cluster default
pub const ANNOTATION_DEFAULT_INGRESS_CLASS: &str = "ingressclass.kubernetes.io/is-default-class";

/// A TLS entry: the certificate for `domains` lives in secret `secret_name`
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TlsBlock {
    /// Sanitized domain list
    pub domains: Vec<String>,
    /// Target secret name, empty when unset
    pub secret_name: String,
}

impl TlsBlock {
    /// Build a block, sanitizing the domain list
    pub fn new<I, S>(domains: I, secret_name: Option<&str>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            domains: sanitize_domains(domains),
            secret_name: secret_name.unwrap_or_default().to_string(),
        }
    }

    /// Whether the block names both hosts and a secret
    pub fn is_actionable(&self) -> bool {
        !self.domains.is_empty() && !self.secret_name.is_empty()
    }
}

/// Identity and opt-in state shared by every secured resource
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResourceMeta {
    /// Namespace
    pub namespace: String,
    /// Name
    pub name: String,
    /// Resource version, `None` for objects never stored by the API server
    pub resource_version: Option<String>,
    /// Annotations
    pub annotations: BTreeMap<String, String>,
}

impl ResourceMeta {
    fn of<K: ResourceExt>(obj: &K) -> Self {
        Self {
            namespace: obj.namespace().unwrap_or_default(),
            name: obj.name_any(),
            resource_version: obj.resource_version(),
            annotations: obj.annotations().clone(),
        }
    }

    /// Whether the resource carries the opt-in annotation
    pub fn is_opted_in(&self) -> bool {
        is_opted_in(&self.annotations)
    }
}

/// A resource that declares TLS entries
pub trait SecuredResource {
    /// Identity and annotations
    fn meta(&self) -> &ResourceMeta;

    /// TLS entries in declaration order
    fn tls_blocks(&self) -> Vec<&TlsBlock>;

    /// Names of every secret the TLS entries point at
    fn secret_names(&self) -> BTreeSet<String> {
        self.tls_blocks()
            .into_iter()
            .filter(|block| !block.secret_name.is_empty())
            .map(|block| block.secret_name.clone())
            .collect()
    }
}

/// Version-independent Ingress
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IngressView {
    /// Identity and annotations
    pub meta: ResourceMeta,
    /// `spec.ingressClassName`
    pub class_name: Option<String>,
    /// TLS entries in declaration order
    pub tls: Vec<TlsBlock>,
}

impl IngressView {
    /// Class name from the spec, falling back to the legacy annotation
    pub fn effective_class_name(&self) -> Option<&str> {
        self.class_name
            .as_deref()
            .or_else(|| {
                self.meta
                    .annotations
                    .get(ANNOTATION_LEGACY_INGRESS_CLASS)
                    .map(String::as_str)
            })
            .filter(|name| !name.is_empty())
    }

    /// Value of the legacy class annotation
    pub fn legacy_class(&self) -> Option<&str> {
        self.meta
            .annotations
            .get(ANNOTATION_LEGACY_INGRESS_CLASS)
            .map(String::as_str)
    }
}

impl From<&Ingress> for IngressView {
    fn from(ingress: &Ingress) -> Self {
        let spec = ingress.spec.as_ref();
        let tls = spec
            .and_then(|s| s.tls.as_ref())
            .map(|entries| {
                entries
                    .iter()
                    .map(|t| TlsBlock::new(t.hosts.iter().flatten(), t.secret_name.as_deref()))
                    .collect()
            })
            .unwrap_or_default();

        Self {
            meta: ResourceMeta::of(ingress),
            class_name: spec.and_then(|s| s.ingress_class_name.clone()),
            tls,
        }
    }
}

impl From<&IngressV1Beta1> for IngressView {
    fn from(ingress: &IngressV1Beta1) -> Self {
        Self {
            meta: ResourceMeta::of(ingress),
            class_name: ingress.spec.ingress_class_name.clone(),
            tls: ingress
                .spec
                .tls
                .iter()
                .map(|t| TlsBlock::new(&t.hosts, t.secret_name.as_deref()))
                .collect(),
        }
    }
}

impl SecuredResource for IngressView {
    fn meta(&self) -> &ResourceMeta {
        &self.meta
    }

    fn tls_blocks(&self) -> Vec<&TlsBlock> {
        self.tls.iter().collect()
    }
}

/// Version-independent IngressRoute
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IngressRouteView {
    /// Identity and annotations
    pub meta: ResourceMeta,
    /// The route's TLS entry, if any
    pub tls: Option<TlsBlock>,
}

impl From<&IngressRoute> for IngressRouteView {
    fn from(route: &IngressRoute) -> Self {
        let tls = route.spec.tls.as_ref().map(|tls| {
            let mut domains: Vec<String> = tls
                .domains
                .iter()
                .flat_map(|d| std::iter::once(d.main.clone()).chain(d.sans.iter().cloned()))
                .collect();

            if domains.iter().all(|d| d.trim().is_empty()) {
                domains = route
                    .spec
                    .routes
                    .iter()
                    .flat_map(|r| parse_host_rule(&r.match_rule))
                    .collect();
            }

            TlsBlock::new(domains, tls.secret_name.as_deref())
        });

        Self {
            meta: ResourceMeta::of(route),
            tls,
        }
    }
}

impl SecuredResource for IngressRouteView {
    fn meta(&self) -> &ResourceMeta {
        &self.meta
    }

    fn tls_blocks(&self) -> Vec<&TlsBlock> {
        self.tls.iter().collect()
    }
}

/// Where an IngressClass was defined; lookups prefer earlier sources
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ClassSource {
    /// `certpilot.dev/v1alpha1`
    Platform,
    /// `networking.k8s.io/v1`
    V1,
    /// `networking.k8s.io/v1beta1`
    V1Beta1,
}

/// Version-independent IngressClass
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IngressClassView {
    /// Class name
    pub name: String,
    /// Controller identifier
    pub controller: String,
    /// Carries the default-class annotation
    pub is_default: bool,
    /// Defining API
    pub source: ClassSource,
}

fn is_default_class<K: ResourceExt>(obj: &K) -> bool {
    obj.annotations()
        .get(ANNOTATION_DEFAULT_INGRESS_CLASS)
        .map(|v| v == "true")
        .unwrap_or(false)
}

impl From<&PlatformIngressClass> for IngressClassView {
    fn from(class: &PlatformIngressClass) -> Self {
        Self {
            name: class.name_any(),
            controller: class.spec.controller.clone(),
            is_default: is_default_class(class),
            source: ClassSource::Platform,
        }
    }
}

impl From<&IngressClass> for IngressClassView {
    fn from(class: &IngressClass) -> Self {
        Self {
            name: class.name_any(),
            controller: class
                .spec
                .as_ref()
                .and_then(|s| s.controller.clone())
                .unwrap_or_default(),
            is_default: is_default_class(class),
            source: ClassSource::V1,
        }
    }
}

impl From<&IngressClassV1Beta1> for IngressClassView {
    fn from(class: &IngressClassV1Beta1) -> Self {
        Self {
            name: class.name_any(),
            controller: class.spec.controller.clone(),
            is_default: is_default_class(class),
            source: ClassSource::V1Beta1,
        }
    }
}

/// Ownership and bookkeeping of a Secret, without its payload
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SecretView {
    /// Namespace
    pub namespace: String,
    /// Name
    pub name: String,
    /// Value of the ownership label
    pub managed_by: Option<String>,
    /// Parsed domains annotation
    pub domains: Option<Vec<String>>,
}

impl SecretView {
    /// Whether `controller_name` owns this secret
    pub fn is_managed_by(&self, controller_name: &str) -> bool {
        self.managed_by.as_deref() == Some(controller_name)
    }
}

impl From<&Secret> for SecretView {
    fn from(secret: &Secret) -> Self {
        Self {
            namespace: secret.namespace().unwrap_or_default(),
            name: secret.name_any(),
            managed_by: secret.labels().get(LABEL_MANAGED_BY).cloned(),
            domains: secret
                .annotations()
                .get(ANNOTATION_CERTIFICATE_DOMAINS)
                .map(|v| parse_domains(v)),
        }
    }
}
