//! Resource types not shipped by k8s-openapi
//!
//! - [`IngressRoute`] - Traefik's route CRD
//! - [`PlatformIngressClass`] - ingress classes defined by the platform
//! - [`IngressV1Beta1`] / [`IngressClassV1Beta1`] - legacy networking API shapes

mod ingress_class;
mod ingress_route;
mod legacy;

pub use ingress_class::{PlatformIngressClass, PlatformIngressClassSpec};
pub use ingress_route::{IngressRoute, IngressRouteSpec, Route, RouteDomain, RouteTls};
pub use legacy::{
    IngressClassV1Beta1, IngressClassV1Beta1Spec, IngressTlsV1Beta1, IngressV1Beta1,
    IngressV1Beta1Spec,
};
