//! The `trellis.dev/v1alpha1` ExtensionService API.

use crate::v1::{LoadBalancerPolicy, TimeoutPolicy, UpstreamValidation};

#[derive(
    Clone, Debug, PartialEq, kube::CustomResource, serde::Deserialize, serde::Serialize,
    schemars::JsonSchema,
)]
#[kube(
    group = "trellis.dev",
    version = "v1alpha1",
    kind = "ExtensionService",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionServiceSpec {
    #[serde(default)]
    pub services: Vec<ExtensionServiceTarget>,
    /// Upstream protocol; only `h2` and `h2c` are meaningful for gRPC
    /// extensions. Defaults to `h2`.
    pub protocol: Option<String>,
    pub validation: Option<UpstreamValidation>,
    /// Only the response timeout applies to extension requests.
    pub timeout_policy: Option<TimeoutPolicy>,
    pub load_balancer_policy: Option<LoadBalancerPolicy>,
}

#[derive(Clone, Debug, PartialEq, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionServiceTarget {
    pub name: String,
    pub port: i32,
    pub weight: Option<i64>,
}
