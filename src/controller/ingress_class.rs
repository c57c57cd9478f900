//! Ingress controller resolution
//!
//! Certificates are only provisioned for ingresses served by a controller
//! that can terminate TLS with the stored secret.

use tracing::debug;

use super::view::IngressView;
use super::Controller;

/// Class names that imply a controller without an IngressClass object
pub const KNOWN_DEFAULT_CLASSES: &[(&str, &str)] = &[
    ("traefik", "traefik.io/ingress-controller"),
    ("nginx", "k8s.io/ingress-nginx"),
    ("haproxy", "haproxy-ingress.github.io/controller"),
];

/// Controllers whose ingresses get certificates
pub const SUPPORTED_CONTROLLERS: &[&str] = &[
    "traefik.io/ingress-controller",
    "k8s.io/ingress-nginx",
    "nginx.org/ingress-controller",
    "haproxy-ingress.github.io/controller",
    "haproxy.org/ingress-controller",
];

/// Controller implied by a well-known legacy class name
pub fn known_default_controller(class: &str) -> Option<&'static str> {
    KNOWN_DEFAULT_CLASSES
        .iter()
        .find(|(name, _)| *name == class)
        .map(|(_, controller)| *controller)
}

/// Whether `controller` is on the allow-list
pub fn is_supported_controller(controller: &str) -> bool {
    SUPPORTED_CONTROLLERS.contains(&controller)
}

impl Controller {
    /// Controller identifier serving `ingress`, if it can be determined.
    ///
    /// Resolution order: a well-known legacy class annotation, then the named
    /// class, then the cluster default class when no class is named.
    pub fn resolve_ingress_controller(&self, ingress: &IngressView) -> Option<String> {
        if let Some(controller) = ingress.legacy_class().and_then(known_default_controller) {
            return Some(controller.to_string());
        }

        match ingress.effective_class_name() {
            Some(name) => self.cache.ingress_class(name).map(|class| class.controller),
            None => self
                .cache
                .default_ingress_class()
                .map(|class| class.controller),
        }
    }

    /// Whether `ingress` is served by an allow-listed controller
    pub fn is_supported_ingress_controller(&self, ingress: &IngressView) -> bool {
        let controller = self.resolve_ingress_controller(ingress);
        let supported = controller
            .as_deref()
            .map(is_supported_controller)
            .unwrap_or(false);

        if !supported {
            debug!(
                namespace = %ingress.meta.namespace,
                ingress = %ingress.meta.name,
                controller = ?controller,
                "Ingress controller not supported"
            );
        }
        supported
    }
}
