//! Read path over the watched resources
//!
//! [`ClusterCache`] answers point-in-time lookups with canonical views. The
//! production implementation reads kube-rs reflector stores, which are
//! lock-protected snapshots safe to read from every handler concurrently.

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::api::networking::v1::{Ingress, IngressClass};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::ResourceExt;

#[cfg(test)]
use mockall::automock;

use super::view::{IngressClassView, IngressRouteView, IngressView, SecretView};
use crate::crd::{IngressClassV1Beta1, IngressRoute, IngressV1Beta1, PlatformIngressClass};

/// Point-in-time reads of the cluster state
#[cfg_attr(test, automock)]
pub trait ClusterCache: Send + Sync {
    /// Ingresses in `namespace`, whichever API version serves them
    fn ingresses(&self, namespace: &str) -> Vec<IngressView>;

    /// IngressRoutes in `namespace`
    fn ingress_routes(&self, namespace: &str) -> Vec<IngressRouteView>;

    /// IngressClass by name: platform classes first, then v1, then v1beta1
    fn ingress_class(&self, name: &str) -> Option<IngressClassView>;

    /// The cluster default class, searched in the same source order
    fn default_ingress_class(&self) -> Option<IngressClassView>;

    /// Secret by namespace and name
    fn secret(&self, namespace: &str, name: &str) -> Option<SecretView>;
}

/// [`ClusterCache`] backed by reflector stores
///
/// A store is absent when its API is not served by the cluster.
#[derive(Clone, Default)]
pub struct ReflectorCache {
    pub(crate) ingresses: Option<Store<Ingress>>,
    pub(crate) legacy_ingresses: Option<Store<IngressV1Beta1>>,
    pub(crate) ingress_routes: Option<Store<IngressRoute>>,
    pub(crate) platform_classes: Option<Store<PlatformIngressClass>>,
    pub(crate) classes: Option<Store<IngressClass>>,
    pub(crate) legacy_classes: Option<Store<IngressClassV1Beta1>>,
    pub(crate) secrets: Option<Store<Secret>>,
}

fn in_namespace<'a, K, V>(
    store: &'a Option<Store<K>>,
    namespace: &'a str,
) -> impl Iterator<Item = V> + 'a
where
    K: kube::Resource<DynamicType = ()> + Clone + 'static,
    V: for<'k> From<&'k K> + 'a,
{
    store
        .iter()
        .flat_map(|s| s.state())
        .filter(move |obj| obj.namespace().as_deref() == Some(namespace))
        .map(|obj| V::from(obj.as_ref()))
}

fn by_name<K, V>(store: &Option<Store<K>>, name: &str) -> Option<V>
where
    K: kube::Resource<DynamicType = ()> + Clone + 'static,
    V: for<'k> From<&'k K>,
{
    store
        .as_ref()
        .and_then(|s| s.get(&ObjectRef::new(name)))
        .map(|obj| V::from(obj.as_ref()))
}

fn default_class<K>(store: &Option<Store<K>>) -> Option<IngressClassView>
where
    K: kube::Resource<DynamicType = ()> + Clone + 'static,
    IngressClassView: for<'k> From<&'k K>,
{
    let mut defaults: Vec<IngressClassView> = store
        .iter()
        .flat_map(|s| s.state())
        .map(|obj| IngressClassView::from(obj.as_ref()))
        .filter(|class| class.is_default)
        .collect();
    defaults.sort_by(|a, b| a.name.cmp(&b.name));
    defaults.into_iter().next()
}

impl ClusterCache for ReflectorCache {
    fn ingresses(&self, namespace: &str) -> Vec<IngressView> {
        in_namespace(&self.ingresses, namespace)
            .chain(in_namespace(&self.legacy_ingresses, namespace))
            .collect()
    }

    fn ingress_routes(&self, namespace: &str) -> Vec<IngressRouteView> {
        in_namespace(&self.ingress_routes, namespace).collect()
    }

    fn ingress_class(&self, name: &str) -> Option<IngressClassView> {
        by_name(&self.platform_classes, name)
            .or_else(|| by_name(&self.classes, name))
            .or_else(|| by_name(&self.legacy_classes, name))
    }

    fn default_ingress_class(&self) -> Option<IngressClassView> {
        default_class(&self.platform_classes)
            .or_else(|| default_class(&self.classes))
            .or_else(|| default_class(&self.legacy_classes))
    }

    fn secret(&self, namespace: &str, name: &str) -> Option<SecretView> {
        self.secrets
            .as_ref()
            .and_then(|s| s.get(&ObjectRef::new(name).within(namespace)))
            .map(|secret| SecretView::from(secret.as_ref()))
    }
}
