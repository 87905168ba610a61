//! The `trellis.dev/v1` HTTPProxy API.

#[derive(
    Clone, Debug, PartialEq, kube::CustomResource, serde::Deserialize, serde::Serialize,
    schemars::JsonSchema,
)]
#[kube(
    group = "trellis.dev",
    version = "v1",
    kind = "HTTPProxy",
    status = "HTTPProxyStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct HTTPProxySpec {
    /// The virtual host to bind routes to. Only root proxies carry one.
    pub virtualhost: Option<VirtualHost>,
    #[serde(default)]
    pub routes: Vec<Route>,
    /// Raw TCP (or TLS pass-through) forwarding instead of HTTP routing.
    pub tcpproxy: Option<TCPProxy>,
}

#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HTTPProxyStatus {
    pub current_status: Option<String>,
    pub description: Option<String>,
}

#[derive(Clone, Debug, PartialEq, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct VirtualHost {
    pub fqdn: String,
    pub tls: Option<TLS>,
    pub authorization: Option<AuthorizationServer>,
    pub rate_limit_policy: Option<RateLimitPolicy>,
}

#[derive(Clone, Debug, PartialEq, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TLS {
    /// Reference to a TLS secret, `name` or `namespace/name`.
    pub secret_name: Option<String>,
    pub minimum_protocol_version: Option<String>,
    pub cipher_suites: Option<Vec<String>>,
    #[serde(default)]
    pub enable_fallback_certificate: bool,
    pub client_validation: Option<DownstreamValidation>,
    /// Terminate TLS at the backend instead of the proxy; requires tcpproxy.
    #[serde(default)]
    pub passthrough: bool,
}

#[derive(Clone, Debug, PartialEq, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DownstreamValidation {
    pub ca_secret: String,
    #[serde(default)]
    pub skip_client_cert_validation: bool,
}

#[derive(Clone, Debug, PartialEq, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationServer {
    pub extension_ref: ExtensionServiceReference,
    #[serde(default)]
    pub fail_open: bool,
    pub response_timeout: Option<String>,
}

#[derive(Clone, Debug, PartialEq, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionServiceReference {
    pub name: String,
    pub namespace: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    #[serde(default)]
    pub conditions: Vec<MatchCondition>,
    #[serde(default)]
    pub services: Vec<Service>,
    pub retry_policy: Option<RetryPolicy>,
    pub timeout_policy: Option<TimeoutPolicy>,
    pub load_balancer_policy: Option<LoadBalancerPolicy>,
    pub request_headers_policy: Option<HeadersPolicy>,
    pub response_headers_policy: Option<HeadersPolicy>,
    pub rate_limit_policy: Option<RateLimitPolicy>,
    pub path_rewrite_policy: Option<PathRewritePolicy>,
    #[serde(default)]
    pub enable_websockets: bool,
    pub request_redirect_policy: Option<HTTPRequestRedirectPolicy>,
    pub direct_response_policy: Option<HTTPDirectResponsePolicy>,
}

#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MatchCondition {
    pub prefix: Option<String>,
    pub exact: Option<String>,
    pub regex: Option<String>,
    pub header: Option<HeaderMatchCondition>,
    pub query_parameter: Option<QueryParameterMatchCondition>,
}

#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HeaderMatchCondition {
    pub name: String,
    pub present: Option<bool>,
    pub contains: Option<String>,
    #[serde(rename = "notcontains")]
    pub not_contains: Option<String>,
    pub exact: Option<String>,
    #[serde(rename = "notexact")]
    pub not_exact: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct QueryParameterMatchCondition {
    pub name: String,
    pub exact: Option<String>,
    pub present: Option<bool>,
}

#[derive(Clone, Debug, PartialEq, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub name: String,
    pub port: i32,
    pub weight: Option<i64>,
    /// Upstream protocol: `h2`, `h2c`, or `tls`.
    pub protocol: Option<String>,
    pub validation: Option<UpstreamValidation>,
    pub request_headers_policy: Option<HeadersPolicy>,
    pub response_headers_policy: Option<HeadersPolicy>,
}

#[derive(Clone, Debug, PartialEq, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamValidation {
    pub ca_secret: String,
    pub subject_name: String,
}

#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Maximum number of retries. A negative value disables retries.
    pub count: Option<i64>,
    pub per_try_timeout: Option<String>,
    pub retry_on: Option<Vec<String>>,
    pub retriable_status_codes: Option<Vec<u32>>,
}

#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutPolicy {
    pub response: Option<String>,
    pub idle: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerPolicy {
    pub strategy: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HeadersPolicy {
    #[serde(default)]
    pub set: Vec<HeaderValue>,
    #[serde(default)]
    pub remove: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HeaderValue {
    pub name: String,
    pub value: String,
}

#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitPolicy {
    pub local: Option<LocalRateLimitPolicy>,
    pub global: Option<GlobalRateLimitPolicy>,
}

#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LocalRateLimitPolicy {
    pub requests: u32,
    pub unit: String,
    #[serde(default)]
    pub burst: u32,
    pub response_status_code: Option<u32>,
    #[serde(default)]
    pub response_headers_to_add: Vec<HeaderValue>,
}

#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GlobalRateLimitPolicy {
    #[serde(default)]
    pub descriptors: Vec<RateLimitDescriptor>,
}

#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDescriptor {
    #[serde(default)]
    pub entries: Vec<RateLimitDescriptorEntry>,
}

/// One descriptor entry. Exactly one field must be set.
#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDescriptorEntry {
    pub generic_key: Option<GenericKeyDescriptor>,
    pub remote_address: Option<RemoteAddressDescriptor>,
    pub request_header: Option<RequestHeaderDescriptor>,
    pub request_header_value_match: Option<RequestHeaderValueMatchDescriptor>,
}

#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct GenericKeyDescriptor {
    pub key: Option<String>,
    pub value: String,
}

#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RemoteAddressDescriptor {}

#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RequestHeaderDescriptor {
    pub header_name: String,
    pub descriptor_key: String,
}

#[derive(Clone, Debug, PartialEq, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RequestHeaderValueMatchDescriptor {
    #[serde(default)]
    pub headers: Vec<HeaderMatchCondition>,
    #[serde(default = "default_true")]
    pub expect_match: bool,
    pub value: String,
}

#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PathRewritePolicy {
    #[serde(default)]
    pub replace_prefix: Vec<ReplacePrefix>,
}

#[derive(Clone, Debug, PartialEq, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReplacePrefix {
    /// The prefix to replace; defaults to the route's own prefix match.
    pub prefix: Option<String>,
    pub replacement: String,
}

#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HTTPRequestRedirectPolicy {
    pub hostname: Option<String>,
    pub scheme: Option<String>,
    pub port: Option<u32>,
    pub status_code: Option<u32>,
}

#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HTTPDirectResponsePolicy {
    pub status_code: u32,
    pub body: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, serde::Deserialize, serde::Serialize, schemars::JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TCPProxy {
    #[serde(default)]
    pub services: Vec<Service>,
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_a_root_proxy() {
        let proxy: HTTPProxySpec = serde_yaml::from_str(
            r#"
            virtualhost:
              fqdn: projects.example.com
              tls:
                secretName: tls-cert
                minimumProtocolVersion: "1.3"
            routes:
              - conditions:
                  - prefix: /api
                  - header:
                      name: X-Canary
                      present: true
                services:
                  - name: api
                    port: 8080
                    weight: 90
                  - name: api-canary
                    port: 8080
                    weight: 10
                timeoutPolicy:
                  response: 1m30s
            "#,
        )
        .expect("yaml must parse");

        let vhost = proxy.virtualhost.expect("virtualhost");
        assert_eq!(vhost.fqdn, "projects.example.com");
        assert_eq!(
            vhost.tls.expect("tls").minimum_protocol_version.as_deref(),
            Some("1.3")
        );
        assert_eq!(proxy.routes.len(), 1);
        let route = &proxy.routes[0];
        assert_eq!(route.conditions.len(), 2);
        assert_eq!(route.conditions[0].prefix.as_deref(), Some("/api"));
        assert_eq!(route.services[0].weight, Some(90));
        assert_eq!(
            route
                .timeout_policy
                .as_ref()
                .and_then(|t| t.response.as_deref()),
            Some("1m30s")
        );
    }

    #[test]
    fn header_match_uses_lowercase_wire_names() {
        let condition: HeaderMatchCondition = serde_yaml::from_str(
            r#"
            name: X-Header
            notcontains: forbidden
            "#,
        )
        .expect("yaml must parse");
        assert_eq!(condition.not_contains.as_deref(), Some("forbidden"));

        let condition: HeaderMatchCondition = serde_yaml::from_str(
            r#"
            name: X-Header
            notexact: forbidden
            "#,
        )
        .expect("yaml must parse");
        assert_eq!(condition.not_exact.as_deref(), Some("forbidden"));
    }

    #[test]
    fn descriptor_entries_default_expect_match() {
        let entry: RateLimitDescriptorEntry = serde_yaml::from_str(
            r#"
            requestHeaderValueMatch:
              headers:
                - name: X-Header
                  contains: abc
              value: maybe
            "#,
        )
        .expect("yaml must parse");
        assert!(entry.request_header_value_match.expect("entry").expect_match);
    }
}
