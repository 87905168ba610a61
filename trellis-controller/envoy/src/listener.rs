//! Builds listener resources: socket addresses, filter chains, the HTTP
//! connection manager pipeline, and raw TCP proxying.

use crate::wire::{
    AccessLog, Address, CommonHttpProtocolOptions, Compressor, CompressorLibrary, EnvoyGrpc,
    ExtAuthz, ExtAuthzGrpcService, Filter, FilterChain, FilterChainMatch, FilterConfig,
    Http1ProtocolOptions, HttpConnectionManager, HttpFilter, HttpFilterConfig, Listener,
    ListenerFilter, LocalRateLimit, Lua, ProtoDuration, Rds, SocketAddress, SocketOption,
    TcpClusterWeight, TcpProxy, TcpProxyClusterSpecifier, TcpWeightedClusters, TypedStub,
    COMPRESSOR_TYPE_URL, CORS_TYPE_URL, EXT_AUTHZ_TYPE_URL, GRPC_WEB_TYPE_URL, GZIP_TYPE_URL,
    HCM_TYPE_URL, LOCAL_RATE_LIMIT_TYPE_URL, LUA_TYPE_URL, PROXY_PROTOCOL_TYPE_URL,
    TCP_PROXY_TYPE_URL, TLS_INSPECTOR_TYPE_URL,
};
use crate::wire::ConfigSource;
use crate::{
    ListenerConfig, FALLBACK_ROUTE_CONFIG_NAME, HTTPS_LISTENER_NAME, HTTPS_ROUTE_CONFIG_PREFIX,
    HTTP_LISTENER_NAME, HTTP_ROUTE_CONFIG_NAME, MANAGEMENT_CLUSTER_NAME,
};
use std::time::Duration;
use trellis_controller_core::{dag, AuthorizationServer, Timeout, TlsVersion};

pub const HCM_FILTER_NAME: &str = "envoy.filters.network.http_connection_manager";
pub const TCP_PROXY_FILTER_NAME: &str = "envoy.filters.network.tcp_proxy";
pub const ROUTER_FILTER_NAME: &str = "router";

/// Idle timeout applied to raw TCP proxy sessions.
const TCP_PROXY_IDLE_TIMEOUT: Duration = Duration::from_secs(9001);

/// ALPN protocols offered on HTTP filter chains.
const HTTP_ALPN_PROTOCOLS: &[&str] = &["h2", "http/1.1"];

/// Lua source installed as a placeholder so per-route overrides can be
/// delivered without changing the filter chain shape.
const LUA_PLACEHOLDER: &str = "-- Placeholder for per-Route or per-Cluster overrides.";

/// Misuse of the connection manager builder. These are programmer errors,
/// not user configuration errors, but they surface as results so a bad
/// build can be dropped instead of taking the process down.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    #[error("http filter {0:?} added after the terminal router filter")]
    FilterAfterRouter(&'static str),
    #[error("http connection manager has no filters")]
    NoFilters,
    #[error("the last http filter must be the router")]
    RouterNotLast,
}

pub fn socket_address(address: &str, port: u32) -> Address {
    Address {
        socket_address: SocketAddress {
            protocol: "TCP",
            address: address.to_string(),
            port_value: port,
            // Set only for the ipv6 any-address so a single listener
            // accepts both address families.
            ipv4_compat: address == "::",
        },
    }
}

pub fn tcp_keepalive_socket_options() -> Vec<SocketOption> {
    // SOL_SOCKET/SO_KEEPALIVE, then IPPROTO_TCP keepalive tuning.
    vec![
        SocketOption {
            description: "Enable TCP keep-alive",
            level: 1,
            name: 9,
            int_value: 1,
            state: "STATE_LISTENING",
        },
        SocketOption {
            description: "TCP keep-alive initial idle time",
            level: 6,
            name: 4,
            int_value: 45,
            state: "STATE_LISTENING",
        },
        SocketOption {
            description: "TCP keep-alive time between probes",
            level: 6,
            name: 5,
            int_value: 5,
            state: "STATE_LISTENING",
        },
        SocketOption {
            description: "TCP keep-alive probe count",
            level: 6,
            name: 6,
            int_value: 9,
            state: "STATE_LISTENING",
        },
    ]
}

pub fn tls_inspector() -> ListenerFilter {
    ListenerFilter {
        name: "envoy.filters.listener.tls_inspector",
        typed_config: TypedStub {
            type_url: TLS_INSPECTOR_TYPE_URL,
        },
    }
}

pub fn proxy_protocol() -> ListenerFilter {
    ListenerFilter {
        name: "envoy.filters.listener.proxy_protocol",
        typed_config: TypedStub {
            type_url: PROXY_PROTOCOL_TYPE_URL,
        },
    }
}

pub fn listener(
    name: &str,
    address: &str,
    port: u32,
    listener_filters: Vec<ListenerFilter>,
    filter_chains: Vec<FilterChain>,
) -> Listener {
    Listener {
        name: name.to_string(),
        address: socket_address(address, port),
        listener_filters,
        filter_chains,
        socket_options: tcp_keepalive_socket_options(),
    }
}

/// A filter chain with no match criteria, for the cleartext listener.
pub fn filter_chain(filters: Vec<Filter>) -> FilterChain {
    FilterChain {
        filter_chain_match: None,
        transport_socket: None,
        filters,
    }
}

/// A filter chain selected by SNI. The `"*"` domain instead matches any
/// TLS session whose SNI matched no other chain.
pub fn filter_chain_tls(
    domain: &str,
    transport_socket: Option<crate::wire::TransportSocket>,
    filters: Vec<Filter>,
) -> FilterChain {
    let filter_chain_match = if domain == "*" {
        FilterChainMatch {
            server_names: vec![],
            transport_protocol: Some("tls"),
        }
    } else {
        FilterChainMatch {
            server_names: vec![domain.to_string()],
            transport_protocol: None,
        }
    };
    FilterChain {
        filter_chain_match: Some(filter_chain_match),
        transport_socket,
        filters,
    }
}

// === impl HttpConnectionManagerBuilder ===

/// Assembles the ordered HTTP filter pipeline for one connection manager.
///
/// The router filter terminates the pipeline. Filters added once a router
/// is in place slot in ahead of it, keeping the router last; attempting to
/// add a second router is rejected.
#[derive(Clone, Debug, Default)]
pub struct HttpConnectionManagerBuilder {
    route_config_name: String,
    metrics_prefix: String,
    access_logs: Vec<AccessLog>,
    filters: Vec<HttpFilter>,
    request_timeout: Timeout,
    connection_idle_timeout: Timeout,
    stream_idle_timeout: Timeout,
    max_connection_duration: Timeout,
    delayed_close_timeout: Timeout,
    connection_shutdown_grace_period: Timeout,
}

impl HttpConnectionManagerBuilder {
    pub fn new(route_config_name: impl ToString) -> Self {
        let route_config_name = route_config_name.to_string();
        Self {
            metrics_prefix: route_config_name.clone(),
            route_config_name,
            ..Self::default()
        }
    }

    pub fn metrics_prefix(mut self, prefix: impl ToString) -> Self {
        self.metrics_prefix = prefix.to_string();
        self
    }

    pub fn access_log(mut self, log: AccessLog) -> Self {
        self.access_logs.push(log);
        self
    }

    pub fn request_timeout(mut self, t: Timeout) -> Self {
        self.request_timeout = t;
        self
    }

    pub fn connection_idle_timeout(mut self, t: Timeout) -> Self {
        self.connection_idle_timeout = t;
        self
    }

    pub fn stream_idle_timeout(mut self, t: Timeout) -> Self {
        self.stream_idle_timeout = t;
        self
    }

    pub fn max_connection_duration(mut self, t: Timeout) -> Self {
        self.max_connection_duration = t;
        self
    }

    pub fn delayed_close_timeout(mut self, t: Timeout) -> Self {
        self.delayed_close_timeout = t;
        self
    }

    pub fn connection_shutdown_grace_period(mut self, t: Timeout) -> Self {
        self.connection_shutdown_grace_period = t;
        self
    }

    /// Appends the baseline filter sequence ending in the router.
    pub fn default_filters(mut self) -> Self {
        self.filters.extend([
            HttpFilter {
                name: "compressor",
                typed_config: HttpFilterConfig::Compressor(Box::new(Compressor {
                    type_url: COMPRESSOR_TYPE_URL,
                    compressor_library: CompressorLibrary {
                        name: "gzip",
                        typed_config: TypedStub {
                            type_url: GZIP_TYPE_URL,
                        },
                    },
                })),
            },
            HttpFilter {
                name: "grpcweb",
                typed_config: HttpFilterConfig::Stub(TypedStub {
                    type_url: GRPC_WEB_TYPE_URL,
                }),
            },
            HttpFilter {
                name: "cors",
                typed_config: HttpFilterConfig::Stub(TypedStub {
                    type_url: CORS_TYPE_URL,
                }),
            },
            HttpFilter {
                name: "local_ratelimit",
                typed_config: HttpFilterConfig::LocalRateLimit(Box::new(LocalRateLimit {
                    type_url: LOCAL_RATE_LIMIT_TYPE_URL,
                    stat_prefix: "http".to_string(),
                    token_bucket: None,
                    status: None,
                    response_headers_to_add: vec![],
                    filter_enabled: None,
                    filter_enforced: None,
                })),
            },
            HttpFilter {
                name: "envoy.filters.http.lua",
                typed_config: HttpFilterConfig::Lua(Lua {
                    type_url: LUA_TYPE_URL,
                    inline_code: LUA_PLACEHOLDER.to_string(),
                }),
            },
            router_filter(),
        ]);
        self
    }

    /// Adds a filter, slotting it ahead of the router when the router is
    /// already in place. Adding a second router is a precondition
    /// violation.
    pub fn add_filter(mut self, filter: HttpFilter) -> Result<Self, BuildError> {
        if let Some(last) = self.filters.last() {
            if last.name == ROUTER_FILTER_NAME {
                if filter.name == ROUTER_FILTER_NAME {
                    return Err(BuildError::FilterAfterRouter(ROUTER_FILTER_NAME));
                }
                let router = self.filters.len() - 1;
                self.filters.insert(router, filter);
                return Ok(self);
            }
        }
        self.filters.push(filter);
        Ok(self)
    }

    /// Checks the invariants a connection manager must satisfy before it
    /// may be emitted.
    pub fn validate(&self) -> Result<(), BuildError> {
        match self.filters.last() {
            None => Err(BuildError::NoFilters),
            Some(last) if last.name != ROUTER_FILTER_NAME => Err(BuildError::RouterNotLast),
            Some(_) => Ok(()),
        }
    }

    pub fn build(self) -> Result<Filter, BuildError> {
        self.validate()?;

        let hcm = HttpConnectionManager {
            type_url: HCM_TYPE_URL,
            stat_prefix: self.metrics_prefix,
            rds: Rds {
                route_config_name: self.route_config_name,
                config_source: ConfigSource::management(MANAGEMENT_CLUSTER_NAME),
            },
            http_filters: self.filters,
            http_protocol_options: Some(Http1ProtocolOptions {
                // Accept HTTP/1.0 requests that carry a Host header.
                accept_http_10: true,
            }),
            common_http_protocol_options: Some(CommonHttpProtocolOptions {
                idle_timeout: emit_timeout(self.connection_idle_timeout),
                max_connection_duration: emit_timeout(self.max_connection_duration),
            }),
            use_remote_address: true,
            normalize_path: true,
            strip_any_host_port: true,
            merge_slashes: true,
            preserve_external_request_id: true,
            request_timeout: emit_timeout(self.request_timeout),
            stream_idle_timeout: emit_timeout(self.stream_idle_timeout),
            drain_timeout: emit_timeout(self.connection_shutdown_grace_period),
            delayed_close_timeout: emit_timeout(self.delayed_close_timeout),
            access_log: self.access_logs,
        };

        Ok(Filter {
            name: HCM_FILTER_NAME,
            typed_config: FilterConfig::HttpConnectionManager(Box::new(hcm)),
        })
    }
}

pub fn router_filter() -> HttpFilter {
    HttpFilter {
        name: ROUTER_FILTER_NAME,
        typed_config: HttpFilterConfig::Stub(TypedStub {
            type_url: crate::wire::ROUTER_TYPE_URL,
        }),
    }
}

/// The external authorization filter for a virtual host delegating
/// request authorization to an extension cluster.
pub fn external_authorization_filter(authz: &AuthorizationServer) -> HttpFilter {
    HttpFilter {
        name: "envoy.filters.http.ext_authz",
        typed_config: HttpFilterConfig::ExtAuthz(Box::new(ExtAuthz {
            type_url: EXT_AUTHZ_TYPE_URL,
            grpc_service: ExtAuthzGrpcService {
                envoy_grpc: EnvoyGrpc {
                    cluster_name: authz.cluster_name.clone(),
                },
                timeout: emit_timeout(authz.response_timeout),
            },
            transport_api_version: "V3",
            failure_mode_allow: authz.fail_open,
        })),
    }
}

/// A disabled timeout is omitted from connection manager wire objects:
/// the proxy reads an explicit zero as "fire immediately", not "never".
fn emit_timeout(t: Timeout) -> Option<ProtoDuration> {
    t.duration().map(ProtoDuration)
}

/// Renders a raw TCP forwarding filter.
///
/// Explicit weights win: when any cluster carries a positive weight only
/// the weighted clusters participate. A single participant collapses to
/// the scalar cluster form; otherwise every participant is listed, at
/// weight 1 each when nothing was weighted.
pub fn tcp_proxy(stat_prefix: &str, proxy: &dag::TcpProxy, access_log: AccessLog) -> Filter {
    let weighted: Vec<&dag::Cluster> = proxy
        .clusters
        .iter()
        .filter(|c| c.upstream.weight.unwrap_or(0) > 0)
        .collect();

    let cluster_specifier = if weighted.len() == 1 {
        TcpProxyClusterSpecifier::Cluster {
            cluster: weighted[0].name(),
        }
    } else if !weighted.is_empty() {
        TcpProxyClusterSpecifier::WeightedClusters {
            weighted_clusters: TcpWeightedClusters {
                clusters: weighted
                    .iter()
                    .map(|c| TcpClusterWeight {
                        name: c.name(),
                        weight: c.upstream.weight.unwrap_or(0),
                    })
                    .collect(),
            },
        }
    } else if proxy.clusters.len() == 1 {
        TcpProxyClusterSpecifier::Cluster {
            cluster: proxy.clusters[0].name(),
        }
    } else {
        TcpProxyClusterSpecifier::WeightedClusters {
            weighted_clusters: TcpWeightedClusters {
                clusters: proxy
                    .clusters
                    .iter()
                    .map(|c| TcpClusterWeight {
                        name: c.name(),
                        weight: 1,
                    })
                    .collect(),
            },
        }
    };

    Filter {
        name: TCP_PROXY_FILTER_NAME,
        typed_config: FilterConfig::TcpProxy(Box::new(TcpProxy {
            type_url: TCP_PROXY_TYPE_URL,
            stat_prefix: stat_prefix.to_string(),
            cluster_specifier,
            idle_timeout: Some(ProtoDuration(TCP_PROXY_IDLE_TIMEOUT)),
            access_log: vec![access_log],
        })),
    }
}

/// The cleartext listener, carrying a single unmatched filter chain.
pub fn http_listener(config: &ListenerConfig) -> Result<Listener, BuildError> {
    let hcm = HttpConnectionManagerBuilder::new(HTTP_ROUTE_CONFIG_NAME)
        .access_log(AccessLog::file(&config.access_log_path))
        .default_filters()
        .build()?;

    let mut listener_filters = vec![];
    if config.use_proxy_protocol {
        listener_filters.push(proxy_protocol());
    }

    Ok(listener(
        HTTP_LISTENER_NAME,
        &config.http_address,
        config.http_port,
        listener_filters,
        vec![filter_chain(vec![hcm])],
    ))
}

/// The TLS listener: one filter chain per secure virtual host, selected
/// by SNI, plus a trailing fallback chain when any host opted into the
/// fallback certificate. Returns `None` when nothing terminates TLS.
pub fn https_listener(
    dag: &dag::Dag,
    config: &ListenerConfig,
) -> Result<Option<Listener>, BuildError> {
    if dag.secure_virtual_hosts.is_empty() {
        return Ok(None);
    }

    let mut chains = Vec::with_capacity(dag.secure_virtual_hosts.len());
    for svh in &dag.secure_virtual_hosts {
        let fqdn = &svh.virtual_host.name;

        let filters = match &svh.tcp_proxy {
            Some(proxy) => vec![tcp_proxy(
                HTTPS_LISTENER_NAME,
                proxy,
                AccessLog::file(&config.access_log_path),
            )],
            None => {
                let mut builder = HttpConnectionManagerBuilder::new(format!(
                    "{HTTPS_ROUTE_CONFIG_PREFIX}{fqdn}"
                ))
                .access_log(AccessLog::file(&config.access_log_path))
                .default_filters();
                if let Some(authz) = &svh.authorization {
                    builder = builder.add_filter(external_authorization_filter(authz))?;
                }
                vec![builder.build()?]
            }
        };

        let alpn = if svh.tcp_proxy.is_some() {
            &[][..]
        } else {
            HTTP_ALPN_PROTOCOLS
        };
        let transport_socket = svh.secret.as_ref().map(|secret| {
            crate::tls::downstream_transport_socket(
                secret,
                svh.min_tls_version,
                &svh.cipher_suites,
                svh.peer_validation.as_ref(),
                alpn,
            )
        });

        chains.push(filter_chain_tls(fqdn, transport_socket, filters));
    }

    if let Some(fallback) = &dag.fallback_certificate {
        if dag.secure_virtual_hosts.iter().any(|s| s.fallback_certificate) {
            let hcm = HttpConnectionManagerBuilder::new(FALLBACK_ROUTE_CONFIG_NAME)
                .access_log(AccessLog::file(&config.access_log_path))
                .default_filters()
                .build()?;
            let transport_socket = crate::tls::downstream_transport_socket(
                fallback,
                TlsVersion::parse(Some(config.minimum_tls_version.as_str())).unwrap_or_default(),
                &config.cipher_suites,
                None,
                HTTP_ALPN_PROTOCOLS,
            );
            // "*" yields the match-by-absence-of-SNI chain.
            chains.push(filter_chain_tls("*", Some(transport_socket), vec![hcm]));
        }
    }

    let mut listener_filters = vec![];
    if config.use_proxy_protocol {
        listener_filters.push(proxy_protocol());
    }
    listener_filters.push(tls_inspector());

    Ok(Some(listener(
        HTTPS_LISTENER_NAME,
        &config.https_address,
        config.https_port,
        listener_filters,
        chains,
    )))
}
