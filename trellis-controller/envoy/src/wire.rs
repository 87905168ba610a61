//! Serde model of the Envoy v3 configuration resources this controller
//! emits. Field names and structure follow the protobuf JSON mapping, so
//! a serialized resource can be fed to Envoy (or compared in tests)
//! without a translation step. Only the fields the renderers set are
//! modeled; absent optional fields are skipped entirely.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::ser::Serializer;
use serde::Serialize;

pub const HCM_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.network.http_connection_manager.v3.HttpConnectionManager";
pub const TCP_PROXY_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.network.tcp_proxy.v3.TcpProxy";
pub const ROUTER_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.http.router.v3.Router";
pub const COMPRESSOR_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.http.compressor.v3.Compressor";
pub const GZIP_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.compression.gzip.compressor.v3.Gzip";
pub const GRPC_WEB_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.http.grpc_web.v3.GrpcWeb";
pub const CORS_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.http.cors.v3.Cors";
pub const LOCAL_RATE_LIMIT_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.http.local_ratelimit.v3.LocalRateLimit";
pub const LUA_TYPE_URL: &str = "type.googleapis.com/envoy.extensions.filters.http.lua.v3.Lua";
pub const EXT_AUTHZ_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.http.ext_authz.v3.ExtAuthz";
pub const TLS_INSPECTOR_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.listener.tls_inspector.v3.TlsInspector";
pub const PROXY_PROTOCOL_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.listener.proxy_protocol.v3.ProxyProtocol";
pub const DOWNSTREAM_TLS_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.DownstreamTlsContext";
pub const UPSTREAM_TLS_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.UpstreamTlsContext";
pub const FILE_ACCESS_LOG_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.access_loggers.file.v3.FileAccessLog";

/// A `google.protobuf.Duration`, rendered in the protobuf JSON form
/// (`"90s"`, `"0.250s"`).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ProtoDuration(pub Duration);

impl From<Duration> for ProtoDuration {
    fn from(d: Duration) -> Self {
        Self(d)
    }
}

impl Serialize for ProtoDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let secs = self.0.as_secs();
        let nanos = self.0.subsec_nanos();
        let repr = if nanos == 0 {
            format!("{secs}s")
        } else if nanos % 1_000_000 == 0 {
            format!("{secs}.{:03}s", nanos / 1_000_000)
        } else if nanos % 1_000 == 0 {
            format!("{secs}.{:06}s", nanos / 1_000)
        } else {
            format!("{secs}.{nanos:09}s")
        };
        serializer.serialize_str(&repr)
    }
}

/// An empty message body, serialized as `{}`.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Empty {}

/// A typed `Any` whose payload has no fields, carrying only its type URL.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TypedStub {
    #[serde(rename = "@type")]
    pub type_url: &'static str,
}

// === Shared configuration plumbing ===

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ConfigSource {
    pub resource_api_version: &'static str,
    pub api_config_source: ApiConfigSource,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ApiConfigSource {
    pub api_type: &'static str,
    pub transport_api_version: &'static str,
    pub grpc_services: Vec<GrpcService>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GrpcService {
    pub envoy_grpc: EnvoyGrpc,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EnvoyGrpc {
    pub cluster_name: String,
}

impl ConfigSource {
    /// A gRPC config source pointing at the given management cluster.
    pub fn management(cluster_name: &str) -> Self {
        Self {
            resource_api_version: "V3",
            api_config_source: ApiConfigSource {
                api_type: "GRPC",
                transport_api_version: "V3",
                grpc_services: vec![GrpcService {
                    envoy_grpc: EnvoyGrpc {
                        cluster_name: cluster_name.to_string(),
                    },
                }],
            },
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DataSource {
    pub inline_string: String,
}

impl DataSource {
    pub fn inline(bytes: &[u8]) -> Self {
        Self {
            inline_string: String::from_utf8_lossy(bytes).into_owned(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HeaderValue {
    pub key: String,
    pub value: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HeaderValueOption {
    pub header: HeaderValue,
    pub append_action: &'static str,
}

impl HeaderValueOption {
    pub fn overwrite(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            header: HeaderValue {
                key: key.into(),
                value: value.into(),
            },
            append_action: "OVERWRITE_IF_EXISTS_OR_ADD",
        }
    }
}

// === Listener resources ===

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Listener {
    pub name: String,
    pub address: Address,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub listener_filters: Vec<ListenerFilter>,
    pub filter_chains: Vec<FilterChain>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub socket_options: Vec<SocketOption>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Address {
    pub socket_address: SocketAddress,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SocketAddress {
    pub protocol: &'static str,
    pub address: String,
    pub port_value: u32,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub ipv4_compat: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SocketOption {
    pub description: &'static str,
    pub level: i64,
    pub name: i64,
    pub int_value: i64,
    pub state: &'static str,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ListenerFilter {
    pub name: &'static str,
    pub typed_config: TypedStub,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FilterChain {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter_chain_match: Option<FilterChainMatch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport_socket: Option<TransportSocket>,
    pub filters: Vec<Filter>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct FilterChainMatch {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub server_names: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport_protocol: Option<&'static str>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Filter {
    pub name: &'static str,
    pub typed_config: FilterConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FilterConfig {
    HttpConnectionManager(Box<HttpConnectionManager>),
    TcpProxy(Box<TcpProxy>),
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TransportSocket {
    pub name: &'static str,
    pub typed_config: TransportSocketConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TransportSocketConfig {
    Downstream(Box<DownstreamTlsContext>),
    Upstream(Box<UpstreamTlsContext>),
}

// === HTTP connection manager ===

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HttpConnectionManager {
    #[serde(rename = "@type")]
    pub type_url: &'static str,
    pub stat_prefix: String,
    pub rds: Rds,
    pub http_filters: Vec<HttpFilter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http_protocol_options: Option<Http1ProtocolOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub common_http_protocol_options: Option<CommonHttpProtocolOptions>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub use_remote_address: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub normalize_path: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub strip_any_host_port: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub merge_slashes: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub preserve_external_request_id: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_timeout: Option<ProtoDuration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_idle_timeout: Option<ProtoDuration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drain_timeout: Option<ProtoDuration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delayed_close_timeout: Option<ProtoDuration>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub access_log: Vec<AccessLog>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Rds {
    pub route_config_name: String,
    pub config_source: ConfigSource,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Http1ProtocolOptions {
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub accept_http_10: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CommonHttpProtocolOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_timeout: Option<ProtoDuration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_connection_duration: Option<ProtoDuration>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AccessLog {
    pub name: &'static str,
    pub typed_config: FileAccessLog,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FileAccessLog {
    #[serde(rename = "@type")]
    pub type_url: &'static str,
    pub path: String,
}

impl AccessLog {
    pub fn file(path: &str) -> Self {
        Self {
            name: "envoy.access_loggers.file",
            typed_config: FileAccessLog {
                type_url: FILE_ACCESS_LOG_TYPE_URL,
                path: path.to_string(),
            },
        }
    }
}

// === HTTP filters ===

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HttpFilter {
    pub name: &'static str,
    pub typed_config: HttpFilterConfig,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum HttpFilterConfig {
    Stub(TypedStub),
    Compressor(Box<Compressor>),
    LocalRateLimit(Box<LocalRateLimit>),
    Lua(Lua),
    ExtAuthz(Box<ExtAuthz>),
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Compressor {
    #[serde(rename = "@type")]
    pub type_url: &'static str,
    pub compressor_library: CompressorLibrary,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CompressorLibrary {
    pub name: &'static str,
    pub typed_config: TypedStub,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Lua {
    #[serde(rename = "@type")]
    pub type_url: &'static str,
    pub inline_code: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LocalRateLimit {
    #[serde(rename = "@type")]
    pub type_url: &'static str,
    pub stat_prefix: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_bucket: Option<TokenBucket>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<HttpStatus>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub response_headers_to_add: Vec<HeaderValueOption>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter_enabled: Option<RuntimeFractionalPercent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter_enforced: Option<RuntimeFractionalPercent>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TokenBucket {
    pub max_tokens: u32,
    pub tokens_per_fill: u32,
    pub fill_interval: ProtoDuration,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HttpStatus {
    pub code: u32,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RuntimeFractionalPercent {
    pub default_value: FractionalPercent,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FractionalPercent {
    pub numerator: u32,
    pub denominator: &'static str,
}

impl RuntimeFractionalPercent {
    pub fn always() -> Self {
        Self {
            default_value: FractionalPercent {
                numerator: 100,
                denominator: "HUNDRED",
            },
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ExtAuthz {
    #[serde(rename = "@type")]
    pub type_url: &'static str,
    pub grpc_service: ExtAuthzGrpcService,
    pub transport_api_version: &'static str,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub failure_mode_allow: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ExtAuthzGrpcService {
    pub envoy_grpc: EnvoyGrpc,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<ProtoDuration>,
}

// === TCP proxy ===

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TcpProxy {
    #[serde(rename = "@type")]
    pub type_url: &'static str,
    pub stat_prefix: String,
    #[serde(flatten)]
    pub cluster_specifier: TcpProxyClusterSpecifier,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_timeout: Option<ProtoDuration>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub access_log: Vec<AccessLog>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum TcpProxyClusterSpecifier {
    Cluster { cluster: String },
    WeightedClusters { weighted_clusters: TcpWeightedClusters },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TcpWeightedClusters {
    pub clusters: Vec<TcpClusterWeight>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TcpClusterWeight {
    pub name: String,
    pub weight: u32,
}

// === TLS contexts ===

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DownstreamTlsContext {
    #[serde(rename = "@type")]
    pub type_url: &'static str,
    pub common_tls_context: CommonTlsContext,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub require_client_certificate: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct UpstreamTlsContext {
    #[serde(rename = "@type")]
    pub type_url: &'static str,
    pub common_tls_context: CommonTlsContext,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sni: Option<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CommonTlsContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls_params: Option<TlsParameters>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tls_certificate_sds_secret_configs: Vec<SdsSecretConfig>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub alpn_protocols: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validation_context: Option<CertificateValidationContext>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TlsParameters {
    pub tls_minimum_protocol_version: &'static str,
    pub tls_maximum_protocol_version: &'static str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cipher_suites: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SdsSecretConfig {
    pub name: String,
    pub sds_config: ConfigSource,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CertificateValidationContext {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trusted_ca: Option<DataSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub match_typed_subject_alt_names: Option<Vec<SubjectAltNameMatcher>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trust_chain_verification: Option<&'static str>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SubjectAltNameMatcher {
    pub san_type: &'static str,
    pub matcher: StringMatcher,
}

// === Route configuration ===

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RouteConfiguration {
    pub name: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub virtual_hosts: Vec<VirtualHost>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct VirtualHost {
    pub name: String,
    pub domains: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rate_limits: Vec<RateLimit>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub typed_per_filter_config: BTreeMap<&'static str, HttpFilterConfig>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Route {
    #[serde(rename = "match")]
    pub route_match: RouteMatch,
    #[serde(flatten)]
    pub action: RouteActionVariant,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub request_headers_to_add: Vec<HeaderValueOption>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub request_headers_to_remove: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub response_headers_to_add: Vec<HeaderValueOption>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub response_headers_to_remove: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub typed_per_filter_config: BTreeMap<&'static str, HttpFilterConfig>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RouteActionVariant {
    Route { route: Box<RouteAction> },
    Redirect { redirect: RedirectAction },
    DirectResponse { direct_response: DirectResponseAction },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RouteMatch {
    #[serde(flatten)]
    pub path: PathSpecifier,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<HeaderMatcher>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub query_parameters: Vec<QueryParameterMatcher>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum PathSpecifier {
    Prefix { prefix: String },
    Path { path: String },
    SafeRegex { safe_regex: RegexMatcher },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RegexMatcher {
    pub regex: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HeaderMatcher {
    pub name: String,
    #[serde(flatten)]
    pub specifier: HeaderMatchSpecifier,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub invert_match: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum HeaderMatchSpecifier {
    Present { present_match: bool },
    Contains { contains_match: String },
    Exact { exact_match: String },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct QueryParameterMatcher {
    pub name: String,
    #[serde(flatten)]
    pub specifier: QueryParameterMatchSpecifier,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum QueryParameterMatchSpecifier {
    Present { present_match: bool },
    StringMatch { string_match: StringMatcher },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StringMatcher {
    pub exact: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RouteAction {
    #[serde(flatten)]
    pub cluster_specifier: ClusterSpecifier,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout: Option<ProtoDuration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_timeout: Option<ProtoDuration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prefix_rewrite: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub upgrade_configs: Vec<UpgradeConfig>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub hash_policy: Vec<HashPolicy>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rate_limits: Vec<RateLimit>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ClusterSpecifier {
    Cluster { cluster: String },
    WeightedClusters { weighted_clusters: WeightedCluster },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WeightedCluster {
    pub clusters: Vec<ClusterWeight>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ClusterWeight {
    pub name: String,
    pub weight: u32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub request_headers_to_add: Vec<HeaderValueOption>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub request_headers_to_remove: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub response_headers_to_add: Vec<HeaderValueOption>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub response_headers_to_remove: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RetryPolicy {
    pub retry_on: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_retries: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub per_try_timeout: Option<ProtoDuration>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub retriable_status_codes: Vec<u32>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct UpgradeConfig {
    pub upgrade_type: &'static str,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HashPolicy {
    pub cookie: CookieHashPolicy,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CookieHashPolicy {
    pub name: &'static str,
    pub ttl: ProtoDuration,
    pub path: &'static str,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RedirectAction {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_redirect: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheme_redirect: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port_redirect: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_code: Option<&'static str>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DirectResponseAction {
    pub status: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<DataSource>,
}

// === Rate limit actions ===

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RateLimit {
    pub actions: Vec<RateLimitAction>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RateLimitAction {
    GenericKey { generic_key: GenericKeyAction },
    RemoteAddress { remote_address: Empty },
    RequestHeaders { request_headers: RequestHeadersAction },
    HeaderValueMatch { header_value_match: HeaderValueMatchAction },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GenericKeyAction {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub descriptor_key: Option<String>,
    pub descriptor_value: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct RequestHeadersAction {
    pub header_name: String,
    pub descriptor_key: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct HeaderValueMatchAction {
    pub descriptor_value: String,
    pub expect_match: bool,
    pub headers: Vec<HeaderMatcher>,
}

// === Clusters ===

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Cluster {
    pub name: String,
    #[serde(rename = "type")]
    pub discovery_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eds_cluster_config: Option<EdsClusterConfig>,
    pub connect_timeout: ProtoDuration,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lb_policy: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http2_protocol_options: Option<Empty>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport_socket: Option<TransportSocket>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EdsClusterConfig {
    pub eds_config: ConfigSource,
    pub service_name: String,
}

// === Secrets ===

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Secret {
    pub name: String,
    pub tls_certificate: TlsCertificate,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TlsCertificate {
    pub certificate_chain: DataSource,
    pub private_key: DataSource,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn durations_use_protobuf_json_form() {
        let render = |d: Duration| serde_json::to_string(&ProtoDuration(d)).unwrap();
        assert_eq!(render(Duration::from_secs(90)), r#""90s""#);
        assert_eq!(render(Duration::from_millis(250)), r#""0.250s""#);
        assert_eq!(render(Duration::from_micros(1_500)), r#""0.001500s""#);
        assert_eq!(render(Duration::ZERO), r#""0s""#);
    }

    #[test]
    fn absent_fields_are_skipped() {
        let m = RouteMatch {
            path: PathSpecifier::Prefix {
                prefix: "/".to_string(),
            },
            headers: vec![],
            query_parameters: vec![],
        };
        assert_eq!(serde_json::to_string(&m).unwrap(), r#"{"prefix":"/"}"#);
    }

    #[test]
    fn actions_flatten_into_the_route() {
        let route = Route {
            route_match: RouteMatch {
                path: PathSpecifier::Path {
                    path: "/healthz".to_string(),
                },
                headers: vec![],
                query_parameters: vec![],
            },
            action: RouteActionVariant::DirectResponse {
                direct_response: DirectResponseAction {
                    status: 200,
                    body: None,
                },
            },
            request_headers_to_add: vec![],
            request_headers_to_remove: vec![],
            response_headers_to_add: vec![],
            response_headers_to_remove: vec![],
            typed_per_filter_config: BTreeMap::new(),
        };
        assert_eq!(
            serde_json::to_string(&route).unwrap(),
            r#"{"match":{"path":"/healthz"},"direct_response":{"status":200}}"#,
        );
    }
}
