#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod v1;
pub mod v1alpha1;

pub use k8s_openapi::{
    api::{
        core::v1::{Secret, Service, ServicePort, ServiceSpec},
        networking::v1::{
            HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
            IngressServiceBackend, IngressSpec, IngressTLS, ServiceBackendPort,
        },
    },
    apimachinery::pkg::apis::meta::v1::Time,
    ByteString,
};
pub use kube::api::{ObjectMeta, ResourceExt};

/// The secret type that carries a serving certificate and key.
pub const SECRET_TYPE_TLS: &str = "kubernetes.io/tls";

/// Data keys expected on TLS and CA secrets.
pub const SECRET_KEY_CERT: &str = "tls.crt";
pub const SECRET_KEY_PRIVATE_KEY: &str = "tls.key";
pub const SECRET_KEY_CA: &str = "ca.crt";
