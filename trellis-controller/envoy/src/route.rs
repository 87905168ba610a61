//! Renders route configuration resources served over dynamic route
//! discovery: one shared configuration for the cleartext listener, one
//! per secure virtual host, and one for the fallback-certificate chain.

use crate::ratelimit::{global_rate_limits, local_rate_limit_config, LOCAL_RATE_LIMIT_FILTER_NAME};
use crate::wire::{
    ClusterSpecifier, ClusterWeight, CookieHashPolicy, DataSource, DirectResponseAction,
    HashPolicy, HeaderMatchSpecifier, HeaderMatcher, HeaderValueOption, PathSpecifier,
    ProtoDuration, QueryParameterMatchSpecifier, QueryParameterMatcher, RedirectAction,
    RegexMatcher, RetryPolicy, Route, RouteAction, RouteActionVariant, RouteConfiguration,
    RouteMatch, StringMatcher, UpgradeConfig, VirtualHost, WeightedCluster,
};
use crate::{FALLBACK_ROUTE_CONFIG_NAME, HTTPS_ROUTE_CONFIG_PREFIX, HTTP_ROUTE_CONFIG_NAME};
use std::collections::BTreeMap;
use std::time::Duration;
use trellis_controller_core::{
    dag, HeadersPolicy, LoadBalancerStrategy, PathMatch, QueryParamMatchKind, Timeout,
};

/// Cookie installed when a route's backends use cookie session affinity.
pub const SESSION_AFFINITY_COOKIE: &str = "X-Trellis-Session-Affinity";

pub fn route_configurations(dag: &dag::Dag) -> Vec<RouteConfiguration> {
    // The cleartext listener subscribes to this configuration by name, so
    // it must exist even when no virtual host is present.
    let mut configs = vec![RouteConfiguration {
        name: HTTP_ROUTE_CONFIG_NAME.to_string(),
        virtual_hosts: dag.virtual_hosts.iter().map(virtual_host).collect(),
    }];

    for svh in &dag.secure_virtual_hosts {
        // TCP forwarding chains consult no route configuration.
        if svh.tcp_proxy.is_some() {
            continue;
        }
        configs.push(RouteConfiguration {
            name: format!("{HTTPS_ROUTE_CONFIG_PREFIX}{}", svh.virtual_host.name),
            virtual_hosts: vec![virtual_host(&svh.virtual_host)],
        });
    }

    if dag.fallback_certificate.is_some() {
        let fallback: Vec<VirtualHost> = dag
            .secure_virtual_hosts
            .iter()
            .filter(|s| s.fallback_certificate && s.tcp_proxy.is_none())
            .map(|s| virtual_host(&s.virtual_host))
            .collect();
        if !fallback.is_empty() {
            configs.push(RouteConfiguration {
                name: FALLBACK_ROUTE_CONFIG_NAME.to_string(),
                virtual_hosts: fallback,
            });
        }
    }

    configs
}

fn virtual_host(vh: &dag::VirtualHost) -> VirtualHost {
    let stat_prefix = format!("vhost.{}", vh.name);

    let mut rate_limits = vec![];
    let mut typed_per_filter_config = BTreeMap::new();
    if let Some(policy) = &vh.rate_limit_policy {
        if let Some(global) = &policy.global {
            rate_limits = global_rate_limits(global);
        }
        if let Some(local) = &policy.local {
            typed_per_filter_config.insert(
                LOCAL_RATE_LIMIT_FILTER_NAME,
                local_rate_limit_config(local, &stat_prefix),
            );
        }
    }

    VirtualHost {
        name: vh.name.clone(),
        domains: vec![vh.name.clone()],
        routes: vh.routes.iter().map(|r| route(r, &stat_prefix)).collect(),
        rate_limits,
        typed_per_filter_config,
    }
}

fn route(r: &dag::Route, stat_prefix: &str) -> Route {
    let action = if let Some(redirect) = &r.redirect {
        RouteActionVariant::Redirect {
            redirect: redirect_action(redirect),
        }
    } else if let Some(direct) = &r.direct_response {
        RouteActionVariant::DirectResponse {
            direct_response: DirectResponseAction {
                status: direct.status_code,
                body: direct
                    .body
                    .as_ref()
                    .map(|body| DataSource::inline(body.as_bytes())),
            },
        }
    } else {
        RouteActionVariant::Route {
            route: Box::new(route_action(r)),
        }
    };

    let (request_headers_to_add, request_headers_to_remove) =
        header_mutations(r.request_headers_policy.as_ref());
    let (response_headers_to_add, response_headers_to_remove) =
        header_mutations(r.response_headers_policy.as_ref());

    let mut typed_per_filter_config = BTreeMap::new();
    if let Some(local) = r.rate_limit_policy.as_ref().and_then(|p| p.local.as_ref()) {
        typed_per_filter_config.insert(
            LOCAL_RATE_LIMIT_FILTER_NAME,
            local_rate_limit_config(local, stat_prefix),
        );
    }

    Route {
        route_match: route_match(r),
        action,
        request_headers_to_add,
        request_headers_to_remove,
        response_headers_to_add,
        response_headers_to_remove,
        typed_per_filter_config,
    }
}

fn route_match(r: &dag::Route) -> RouteMatch {
    let path = match &r.path {
        PathMatch::Prefix(prefix) => PathSpecifier::Prefix {
            prefix: prefix.clone(),
        },
        PathMatch::Exact(path) => PathSpecifier::Path { path: path.clone() },
        PathMatch::Regex(regex) => PathSpecifier::SafeRegex {
            safe_regex: RegexMatcher {
                regex: regex.clone(),
            },
        },
    };

    RouteMatch {
        path,
        headers: header_matchers(&r.header_matches),
        query_parameters: r
            .query_matches
            .iter()
            .map(|q| QueryParameterMatcher {
                name: q.name.clone(),
                specifier: match &q.kind {
                    QueryParamMatchKind::Exact(value) => {
                        QueryParameterMatchSpecifier::StringMatch {
                            string_match: StringMatcher {
                                exact: value.clone(),
                            },
                        }
                    }
                    QueryParamMatchKind::Present => QueryParameterMatchSpecifier::Present {
                        present_match: true,
                    },
                },
            })
            .collect(),
    }
}

pub(crate) fn header_matchers(matches: &[dag::HeaderMatch]) -> Vec<HeaderMatcher> {
    matches
        .iter()
        .map(|m| HeaderMatcher {
            name: m.name.clone(),
            specifier: match &m.kind {
                dag::HeaderMatchKind::Present => HeaderMatchSpecifier::Present {
                    present_match: true,
                },
                dag::HeaderMatchKind::Contains(value) => HeaderMatchSpecifier::Contains {
                    contains_match: value.clone(),
                },
                dag::HeaderMatchKind::Exact(value) => HeaderMatchSpecifier::Exact {
                    exact_match: value.clone(),
                },
            },
            invert_match: m.invert,
        })
        .collect()
}

fn route_action(r: &dag::Route) -> RouteAction {
    let hash_policy = if r
        .clusters
        .first()
        .is_some_and(|c| c.load_balancer_strategy == LoadBalancerStrategy::Cookie)
    {
        vec![HashPolicy {
            cookie: CookieHashPolicy {
                name: SESSION_AFFINITY_COOKIE,
                ttl: ProtoDuration(Duration::ZERO),
                path: "/",
            },
        }]
    } else {
        vec![]
    };

    let rate_limits = r
        .rate_limit_policy
        .as_ref()
        .and_then(|p| p.global.as_ref())
        .map(global_rate_limits)
        .unwrap_or_default();

    RouteAction {
        cluster_specifier: cluster_specifier(&r.clusters),
        timeout: route_timeout(r.timeout_policy.response),
        idle_timeout: route_timeout(r.timeout_policy.idle),
        retry_policy: r.retry_policy.as_ref().map(retry_policy),
        prefix_rewrite: r.prefix_rewrite.clone(),
        upgrade_configs: if r.websocket {
            vec![UpgradeConfig {
                upgrade_type: "websocket",
            }]
        } else {
            vec![]
        },
        hash_policy,
        rate_limits,
    }
}

/// Route-level timeouts treat "disabled" as an explicit zero: the proxy
/// reads zero here as "never time out", the opposite of its connection
/// manager semantics.
fn route_timeout(t: Timeout) -> Option<ProtoDuration> {
    match t {
        Timeout::Default => None,
        Timeout::Duration(d) => Some(ProtoDuration(d)),
        Timeout::Disabled => Some(ProtoDuration(Duration::ZERO)),
    }
}

fn retry_policy(p: &trellis_controller_core::RetryPolicy) -> RetryPolicy {
    RetryPolicy {
        retry_on: p.retry_on.clone(),
        num_retries: (p.num_retries > 0).then_some(p.num_retries),
        per_try_timeout: p.per_try_timeout.duration().map(ProtoDuration),
        retriable_status_codes: p.retriable_status_codes.clone(),
    }
}

fn cluster_specifier(clusters: &[dag::Cluster]) -> ClusterSpecifier {
    if let [cluster] = clusters {
        if cluster.request_headers_policy.is_none() && cluster.response_headers_policy.is_none() {
            return ClusterSpecifier::Cluster {
                cluster: cluster.name(),
            };
        }
    }

    // Weights are relative; when nothing carries an explicit weight every
    // backend shares evenly at weight 1.
    let explicit_total: u32 = clusters
        .iter()
        .map(|c| c.upstream.weight.unwrap_or(0))
        .sum();

    ClusterSpecifier::WeightedClusters {
        weighted_clusters: WeightedCluster {
            clusters: clusters
                .iter()
                .map(|c| {
                    let (request_headers_to_add, request_headers_to_remove) =
                        header_mutations(c.request_headers_policy.as_ref());
                    let (response_headers_to_add, response_headers_to_remove) =
                        header_mutations(c.response_headers_policy.as_ref());
                    ClusterWeight {
                        name: c.name(),
                        weight: if explicit_total == 0 {
                            1
                        } else {
                            c.upstream.weight.unwrap_or(0)
                        },
                        request_headers_to_add,
                        request_headers_to_remove,
                        response_headers_to_add,
                        response_headers_to_remove,
                    }
                })
                .collect(),
        },
    }
}

fn redirect_action(redirect: &dag::Redirect) -> RedirectAction {
    RedirectAction {
        host_redirect: redirect.hostname.clone(),
        scheme_redirect: redirect.scheme.clone(),
        port_redirect: redirect.port,
        response_code: match redirect.status_code {
            // 301 is the wire default and is left implicit.
            302 => Some("FOUND"),
            307 => Some("TEMPORARY_REDIRECT"),
            308 => Some("PERMANENT_REDIRECT"),
            _ => None,
        },
    }
}

fn header_mutations(policy: Option<&HeadersPolicy>) -> (Vec<HeaderValueOption>, Vec<String>) {
    match policy {
        None => (vec![], vec![]),
        Some(policy) => (
            policy
                .set
                .iter()
                .map(|(k, v)| HeaderValueOption::overwrite(k.clone(), v.clone()))
                .collect(),
            policy.remove.iter().cloned().collect(),
        ),
    }
}
