//! Compiles a resource snapshot into one consistent traffic graph.
//!
//! Each build runs a fixed processor sequence: extension services, then
//! legacy ingresses, then HTTPProxies, every kind in namespace/name order.
//! A malformed object never aborts the build; it contributes nothing and
//! carries an invalid condition while every other object builds normally.
//! Hostname conflicts are settled up front by creation timestamp, with ties
//! broken by namespace, then name, then kind, so the winner never depends
//! on processing order.

use crate::{
    index::{IngressEntry, ProxyEntry, ResourceSnapshot},
    policy, secrets, ClusterInfo,
};
use ahash::AHashMap as HashMap;
use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use std::collections::{btree_map, BTreeMap, BTreeSet};
use trellis_controller_core::{
    conditions::{reason, ObjectRef, StatusUpdate},
    AuthorizationServer, Cluster, Dag, DirectResponse, ExtensionCluster, LoadBalancerStrategy,
    NamespacedName, PathMatch, PeerValidationContext, Protocol, RateLimitPolicy, Redirect, Route,
    Secret, SecureVirtualHost, Service, TcpProxy, Timeout, TlsVersion, VirtualHost,
    WeightedService,
};
use trellis_controller_k8s_api::{self as k8s, v1 as api, v1alpha1};

const KIND_HTTP_PROXY: &str = "HTTPProxy";
const KIND_INGRESS: &str = "Ingress";
const KIND_EXTENSION_SERVICE: &str = "ExtensionService";

/// Builds a traffic graph from the snapshot, returning the graph together
/// with one status condition per processed object.
///
/// The result is a pure function of the inputs: identical snapshots produce
/// identical graphs, including the derived cluster and secret names.
pub fn build(snapshot: &ResourceSnapshot, info: &ClusterInfo) -> (Dag, Vec<StatusUpdate>) {
    #[cfg(not(test))]
    let timestamp = Utc::now();
    #[cfg(test)]
    let timestamp = DateTime::<Utc>::MIN_UTC;

    let mut builder = Builder::new(snapshot, info, timestamp);
    builder.claim_hostnames();

    // Extension clusters build first so that proxy authorization references
    // resolve against the finished set.
    for (name, spec) in sorted(&snapshot.extension_services) {
        builder.process_extension_service(name, spec);
    }
    for (name, entry) in sorted(&snapshot.ingresses) {
        builder.process_ingress(name, entry);
    }
    for (name, entry) in sorted(&snapshot.proxies) {
        builder.process_proxy(name, entry);
    }

    builder.finish()
}

/// Identifies the object holding a hostname claim. The derived ordering is
/// the conflict tie-break: oldest creation first, then namespace, name and
/// kind.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Claimant {
    created: DateTime<Utc>,
    namespace: String,
    name: String,
    kind: &'static str,
}

/// A per-object build failure. The object contributes nothing to the graph
/// and the message becomes its condition text.
struct Rejection {
    reason: &'static str,
    message: String,
}

/// TLS posture of a proxy virtual host.
enum ProxyTls {
    /// Encrypted bytes are handed to the TCP proxy unterminated.
    Passthrough,
    Terminate {
        secret: Secret,
        min_tls_version: TlsVersion,
        cipher_suites: Vec<String>,
        peer_validation: Option<PeerValidationContext>,
        /// The resolved fallback certificate when the host opted in.
        fallback: Option<Secret>,
    },
}

struct Builder<'a> {
    snapshot: &'a ResourceSnapshot,
    info: &'a ClusterInfo,
    timestamp: DateTime<Utc>,
    /// Winner of every claimed hostname, fixed before processing starts.
    claims: BTreeMap<String, Claimant>,
    virtual_hosts: BTreeMap<String, VirtualHost>,
    secure_virtual_hosts: BTreeMap<String, SecureVirtualHost>,
    extension_clusters: BTreeMap<NamespacedName, ExtensionCluster>,
    fallback_certificate: Option<Secret>,
    statuses: Vec<StatusUpdate>,
}

// === impl Claimant ===

impl Claimant {
    fn new(created: DateTime<Utc>, name: &NamespacedName, kind: &'static str) -> Self {
        Self {
            created,
            namespace: name.namespace.clone(),
            name: name.name.clone(),
            kind,
        }
    }
}

// === impl Rejection ===

impl Rejection {
    fn new(reason: &'static str, message: impl ToString) -> Self {
        Self {
            reason,
            message: message.to_string(),
        }
    }
}

// === impl Builder ===

impl<'a> Builder<'a> {
    fn new(snapshot: &'a ResourceSnapshot, info: &'a ClusterInfo, timestamp: DateTime<Utc>) -> Self {
        Self {
            snapshot,
            info,
            timestamp,
            claims: BTreeMap::new(),
            virtual_hosts: BTreeMap::new(),
            secure_virtual_hosts: BTreeMap::new(),
            extension_clusters: BTreeMap::new(),
            fallback_certificate: None,
            statuses: Vec::new(),
        }
    }

    /// Registers every hostname any object wants, keeping the best claimant
    /// per host. Claims stand even if the winner later fails validation, so
    /// a broken winner does not silently hand its hostname to a rival.
    fn claim_hostnames(&mut self) {
        let snapshot = self.snapshot;
        for (name, entry) in &snapshot.proxies {
            let Some(virtual_host) = &entry.spec.virtualhost else {
                continue;
            };
            if virtual_host.fqdn.is_empty() {
                continue;
            }
            self.claim(
                virtual_host.fqdn.clone(),
                Claimant::new(entry.created, name, KIND_HTTP_PROXY),
            );
        }
        for (name, entry) in &snapshot.ingresses {
            if !self.matches_ingress_class(&entry.spec) {
                continue;
            }
            for host in ingress_hosts(&entry.spec) {
                self.claim(host, Claimant::new(entry.created, name, KIND_INGRESS));
            }
        }
    }

    fn claim(&mut self, host: String, claimant: Claimant) {
        match self.claims.entry(host) {
            btree_map::Entry::Vacant(slot) => {
                slot.insert(claimant);
            }
            btree_map::Entry::Occupied(mut slot) => {
                if claimant < *slot.get() {
                    slot.insert(claimant);
                }
            }
        }
    }

    fn matches_ingress_class(&self, spec: &k8s::IngressSpec) -> bool {
        match spec.ingress_class_name.as_deref() {
            Some(class) => class == self.info.ingress_class_name,
            None => true,
        }
    }

    fn record(&mut self, object: ObjectRef, outcome: Result<String, Rejection>) {
        let status = match outcome {
            Ok(message) => StatusUpdate::valid(object, message, self.timestamp),
            Err(Rejection { reason, message }) => {
                StatusUpdate::invalid(object, reason, message, self.timestamp)
            }
        };
        self.statuses.push(status);
    }

    // --- extension services

    fn process_extension_service(
        &mut self,
        name: &NamespacedName,
        spec: &v1alpha1::ExtensionServiceSpec,
    ) {
        let object = ObjectRef::new(KIND_EXTENSION_SERVICE, &name.namespace, &name.name);
        let outcome = self
            .try_extension_service(name, spec)
            .map(|()| "valid ExtensionService".to_string());
        self.record(object, outcome);
    }

    fn try_extension_service(
        &mut self,
        name: &NamespacedName,
        spec: &v1alpha1::ExtensionServiceSpec,
    ) -> Result<(), Rejection> {
        if spec.services.is_empty() {
            return Err(Rejection::new(
                reason::SPEC_ERROR,
                "at least one service must be specified",
            ));
        }
        let protocol = match spec.protocol.as_deref() {
            None | Some("h2") => Protocol::H2,
            Some("h2c") => Protocol::H2C,
            Some(other) => {
                return Err(Rejection::new(
                    reason::SPEC_ERROR,
                    format!("unsupported protocol {other:?}"),
                ))
            }
        };

        let mut services = Vec::with_capacity(spec.services.len());
        for target in &spec.services {
            let service = self
                .resolve_service(&name.namespace, &target.name, target.port)
                .map_err(|error| Rejection::new(reason::SERVICE_ERROR, error))?;
            services.push(WeightedService {
                service,
                weight: service_weight(target.weight),
            });
        }

        let upstream_validation = spec
            .validation
            .as_ref()
            .map(|validation| self.upstream_validation(&name.namespace, validation))
            .transpose()
            .map_err(|error| Rejection::new(reason::SERVICE_ERROR, error))?;

        let response_timeout = policy::timeout_policy(spec.timeout_policy.as_ref())
            .map_err(|error| Rejection::new(reason::SPEC_ERROR, error))?
            .response;

        self.extension_clusters.insert(
            name.clone(),
            ExtensionCluster {
                name: ExtensionCluster::name_for(&name.namespace, &name.name),
                services,
                protocol,
                upstream_validation,
                load_balancer_strategy: policy::load_balancer_strategy(
                    spec.load_balancer_policy.as_ref(),
                ),
                response_timeout,
            },
        );
        Ok(())
    }

    // --- ingresses

    fn process_ingress(&mut self, name: &NamespacedName, entry: &IngressEntry) {
        if !self.matches_ingress_class(&entry.spec) {
            // Another controller's object; not ours to judge.
            return;
        }
        let object = ObjectRef::new(KIND_INGRESS, &name.namespace, &name.name);
        let claimant = Claimant::new(entry.created, name, KIND_INGRESS);
        let outcome = self
            .try_ingress(name, entry, &claimant)
            .map(|()| "valid Ingress".to_string());
        self.record(object, outcome);
    }

    fn try_ingress(
        &mut self,
        name: &NamespacedName,
        entry: &IngressEntry,
        claimant: &Claimant,
    ) -> Result<(), Rejection> {
        let spec = &entry.spec;
        for host in ingress_hosts(spec) {
            if self.claims.get(&host) != Some(claimant) {
                return Err(Rejection::new(
                    reason::HOSTNAME_CONFLICT,
                    "host name is already in use",
                ));
            }
        }

        let mut routes_by_host: BTreeMap<String, Vec<Route>> = BTreeMap::new();
        if let Some(backend) = &spec.default_backend {
            let route = self
                .ingress_route(&name.namespace, PathMatch::Prefix("/".to_string()), backend)
                .map_err(|error| Rejection::new(reason::SERVICE_ERROR, error))?;
            routes_by_host
                .entry("*".to_string())
                .or_default()
                .push(route);
        }
        for rule in spec.rules.iter().flatten() {
            let host = rule_host(rule);
            let Some(http) = &rule.http else {
                continue;
            };
            for path in &http.paths {
                let path_match = ingress_path_match(path)
                    .map_err(|error| Rejection::new(reason::ROUTE_ERROR, error))?;
                let route = self
                    .ingress_route(&name.namespace, path_match, &path.backend)
                    .map_err(|error| Rejection::new(reason::SERVICE_ERROR, error))?;
                routes_by_host.entry(host.clone()).or_default().push(route);
            }
        }

        // TLS entries secure their listed hosts with the same routes. The
        // plaintext virtual host remains; legacy objects get no automatic
        // redirect.
        let mut secured: BTreeMap<String, Secret> = BTreeMap::new();
        for tls in spec.tls.iter().flatten() {
            let Some(secret_name) = tls.secret_name.as_deref().filter(|s| !s.is_empty()) else {
                continue;
            };
            let secret_name = NamespacedName::from_reference(secret_name, &name.namespace);
            let secret = self
                .tls_secret(&secret_name)
                .map_err(|error| Rejection::new(reason::TLS_ERROR, error))?;
            for host in tls.hosts.iter().flatten() {
                if routes_by_host.contains_key(host) {
                    secured.insert(host.clone(), secret.clone());
                }
            }
        }

        for (host, routes) in routes_by_host {
            if let Some(secret) = secured.get(&host) {
                let mut inner = VirtualHost::new(&host);
                inner.routes = routes.clone();
                self.secure_virtual_hosts.insert(
                    host.clone(),
                    SecureVirtualHost {
                        virtual_host: inner,
                        secret: Some(secret.clone()),
                        min_tls_version: TlsVersion::default(),
                        cipher_suites: Vec::new(),
                        peer_validation: None,
                        fallback_certificate: false,
                        authorization: None,
                        tcp_proxy: None,
                    },
                );
            }
            let mut vhost = VirtualHost::new(&host);
            vhost.routes = routes;
            self.virtual_hosts.insert(host, vhost);
        }
        Ok(())
    }

    fn ingress_route(
        &self,
        namespace: &str,
        path: PathMatch,
        backend: &k8s::IngressBackend,
    ) -> Result<Route> {
        let service = backend
            .service
            .as_ref()
            .ok_or_else(|| anyhow!("backend does not reference a service"))?;
        let port = match &service.port {
            Some(k8s::ServiceBackendPort {
                number: Some(number),
                ..
            }) => *number,
            Some(k8s::ServiceBackendPort {
                name: Some(port_name),
                ..
            }) => self.service_port_by_name(namespace, &service.name, port_name)?,
            _ => bail!("backend service {:?} does not specify a port", service.name),
        };
        let upstream = self.resolve_service(namespace, &service.name, port)?;
        let mut route = Route::new(path);
        route.clusters = vec![Cluster::new(WeightedService {
            service: upstream,
            weight: None,
        })];
        Ok(route)
    }

    // --- proxies

    fn process_proxy(&mut self, name: &NamespacedName, entry: &ProxyEntry) {
        let object = ObjectRef::new(KIND_HTTP_PROXY, &name.namespace, &name.name);
        let claimant = Claimant::new(entry.created, name, KIND_HTTP_PROXY);
        let outcome = self
            .try_proxy(name, entry, &claimant)
            .map(|()| "valid HTTPProxy".to_string());
        self.record(object, outcome);
    }

    fn try_proxy(
        &mut self,
        name: &NamespacedName,
        entry: &ProxyEntry,
        claimant: &Claimant,
    ) -> Result<(), Rejection> {
        let spec = &entry.spec;
        let Some(virtual_host) = &spec.virtualhost else {
            return Err(Rejection::new(
                reason::SPEC_ERROR,
                "spec.virtualhost is required",
            ));
        };
        let fqdn = virtual_host.fqdn.as_str();
        if fqdn.is_empty() {
            return Err(Rejection::new(
                reason::SPEC_ERROR,
                "spec.virtualhost.fqdn must be specified",
            ));
        }
        if self.claims.get(fqdn) != Some(claimant) {
            return Err(Rejection::new(
                reason::HOSTNAME_CONFLICT,
                "host name is already in use",
            ));
        }
        if spec.routes.is_empty() && spec.tcpproxy.is_none() {
            return Err(Rejection::new(
                reason::SPEC_ERROR,
                "at least one route or tcpproxy must be specified",
            ));
        }

        let tls = self.proxy_tls(name, virtual_host)?;

        if spec.tcpproxy.is_some() && tls.is_none() {
            return Err(Rejection::new(
                reason::SPEC_ERROR,
                "spec.tcpproxy requires spec.virtualhost.tls",
            ));
        }
        if matches!(tls, Some(ProxyTls::Passthrough)) && spec.tcpproxy.is_none() {
            return Err(Rejection::new(
                reason::TLS_ERROR,
                "spec.virtualhost.tls.passthrough requires spec.tcpproxy",
            ));
        }
        if matches!(
            tls,
            Some(ProxyTls::Terminate {
                fallback: Some(_),
                ..
            })
        ) && spec.tcpproxy.is_some()
        {
            return Err(Rejection::new(
                reason::TLS_ERROR,
                "spec.virtualhost.tls.enableFallbackCertificate is not supported with spec.tcpproxy",
            ));
        }

        let tcp_proxy = spec
            .tcpproxy
            .as_ref()
            .map(|tcpproxy| self.tcp_proxy(name, tcpproxy))
            .transpose()?;

        if virtual_host.authorization.is_some() {
            if !matches!(tls, Some(ProxyTls::Terminate { .. })) {
                return Err(Rejection::new(
                    reason::AUTH_ERROR,
                    "spec.virtualhost.authorization requires TLS termination",
                ));
            }
            if tcp_proxy.is_some() {
                return Err(Rejection::new(
                    reason::AUTH_ERROR,
                    "spec.virtualhost.authorization is not supported with spec.tcpproxy",
                ));
            }
        }
        let authorization = virtual_host
            .authorization
            .as_ref()
            .map(|auth| self.authorization(name, auth))
            .transpose()?;

        let rate_limit_policy = policy::rate_limit_policy(virtual_host.rate_limit_policy.as_ref())
            .map_err(|error| Rejection::new(reason::SPEC_ERROR, error))?;

        let mut routes = Vec::with_capacity(spec.routes.len());
        for route in &spec.routes {
            routes.push(self.proxy_route(name, route)?);
        }

        // Everything validated; commit the whole contribution.
        match tls {
            Some(ProxyTls::Terminate {
                secret,
                min_tls_version,
                cipher_suites,
                peer_validation,
                fallback,
            }) if tcp_proxy.is_none() => {
                // The secure host serves the routes; its insecure twin
                // answers every match with a redirect to HTTPS.
                let mut twin = VirtualHost::new(fqdn);
                twin.routes = routes.iter().map(https_redirect).collect();
                self.virtual_hosts.insert(fqdn.to_string(), twin);

                let fallback_certificate = fallback.is_some();
                if let Some(fallback) = fallback {
                    self.fallback_certificate = Some(fallback);
                }

                let mut inner = VirtualHost::new(fqdn);
                inner.routes = routes;
                inner.rate_limit_policy = rate_limit_policy;
                self.secure_virtual_hosts.insert(
                    fqdn.to_string(),
                    SecureVirtualHost {
                        virtual_host: inner,
                        secret: Some(secret),
                        min_tls_version,
                        cipher_suites,
                        peer_validation,
                        fallback_certificate,
                        authorization,
                        tcp_proxy: None,
                    },
                );
            }
            Some(ProxyTls::Terminate {
                secret,
                min_tls_version,
                cipher_suites,
                peer_validation,
                ..
            }) => {
                // TLS terminates straight into the TCP proxy; any routes
                // serve plain HTTP.
                self.secure_virtual_hosts.insert(
                    fqdn.to_string(),
                    SecureVirtualHost {
                        virtual_host: VirtualHost::new(fqdn),
                        secret: Some(secret),
                        min_tls_version,
                        cipher_suites,
                        peer_validation,
                        fallback_certificate: false,
                        authorization: None,
                        tcp_proxy,
                    },
                );
                self.commit_insecure(fqdn, routes, rate_limit_policy);
            }
            Some(ProxyTls::Passthrough) => {
                self.secure_virtual_hosts.insert(
                    fqdn.to_string(),
                    SecureVirtualHost {
                        virtual_host: VirtualHost::new(fqdn),
                        secret: None,
                        min_tls_version: TlsVersion::default(),
                        cipher_suites: Vec::new(),
                        peer_validation: None,
                        fallback_certificate: false,
                        authorization: None,
                        tcp_proxy,
                    },
                );
                self.commit_insecure(fqdn, routes, rate_limit_policy);
            }
            None => {
                let mut vhost = VirtualHost::new(fqdn);
                vhost.routes = routes;
                vhost.rate_limit_policy = rate_limit_policy;
                self.virtual_hosts.insert(fqdn.to_string(), vhost);
            }
        }
        Ok(())
    }

    fn commit_insecure(
        &mut self,
        fqdn: &str,
        routes: Vec<Route>,
        rate_limit_policy: Option<RateLimitPolicy>,
    ) {
        if routes.is_empty() {
            return;
        }
        let mut vhost = VirtualHost::new(fqdn);
        vhost.routes = routes;
        vhost.rate_limit_policy = rate_limit_policy;
        self.virtual_hosts.insert(fqdn.to_string(), vhost);
    }

    fn proxy_tls(
        &self,
        name: &NamespacedName,
        virtual_host: &api::VirtualHost,
    ) -> Result<Option<ProxyTls>, Rejection> {
        let Some(tls) = &virtual_host.tls else {
            return Ok(None);
        };
        let tls_error = |error: anyhow::Error| Rejection::new(reason::TLS_ERROR, error);
        let secret_name = tls.secret_name.as_deref().filter(|s| !s.is_empty());
        match (tls.passthrough, secret_name) {
            (true, Some(_)) => Err(Rejection::new(
                reason::TLS_ERROR,
                "spec.virtualhost.tls: secretName and passthrough are mutually exclusive",
            )),
            (true, None) => Ok(Some(ProxyTls::Passthrough)),
            (false, None) => Err(Rejection::new(
                reason::TLS_ERROR,
                "spec.virtualhost.tls: exactly one of secretName or passthrough must be specified",
            )),
            (false, Some(secret_name)) => {
                let min_tls_version = TlsVersion::parse(tls.minimum_protocol_version.as_deref())
                    .map_err(tls_error)?;
                let secret_name = NamespacedName::from_reference(secret_name, &name.namespace);
                let secret = self.tls_secret(&secret_name).map_err(tls_error)?;

                if tls.enable_fallback_certificate && tls.client_validation.is_some() {
                    return Err(Rejection::new(
                        reason::TLS_ERROR,
                        "spec.virtualhost.tls: enableFallbackCertificate and clientValidation \
                         are mutually exclusive",
                    ));
                }
                let fallback = if tls.enable_fallback_certificate {
                    let Some(fallback_name) = &self.info.fallback_certificate else {
                        return Err(Rejection::new(
                            reason::TLS_ERROR,
                            "fallback certificate is not configured",
                        ));
                    };
                    Some(self.tls_secret(fallback_name).map_err(tls_error)?)
                } else {
                    None
                };
                let peer_validation = tls
                    .client_validation
                    .as_ref()
                    .map(|validation| self.client_validation(&name.namespace, validation))
                    .transpose()
                    .map_err(tls_error)?;

                Ok(Some(ProxyTls::Terminate {
                    secret,
                    min_tls_version,
                    cipher_suites: tls.cipher_suites.clone().unwrap_or_default(),
                    peer_validation,
                    fallback,
                }))
            }
        }
    }

    fn tcp_proxy(&self, name: &NamespacedName, tcpproxy: &api::TCPProxy) -> Result<TcpProxy, Rejection> {
        if tcpproxy.services.is_empty() {
            return Err(Rejection::new(
                reason::SPEC_ERROR,
                "spec.tcpproxy: at least one service must be specified",
            ));
        }
        let dynamic = namespace_tokens(&name.namespace);
        let mut clusters = Vec::with_capacity(tcpproxy.services.len());
        for service in &tcpproxy.services {
            let cluster = self
                .service_cluster(
                    &name.namespace,
                    service,
                    LoadBalancerStrategy::Default,
                    &dynamic,
                )
                .map_err(|error| Rejection::new(reason::SERVICE_ERROR, error))?;
            clusters.push(cluster);
        }
        Ok(TcpProxy { clusters })
    }

    fn authorization(
        &self,
        name: &NamespacedName,
        auth: &api::AuthorizationServer,
    ) -> Result<AuthorizationServer, Rejection> {
        let namespace = auth
            .extension_ref
            .namespace
            .as_deref()
            .unwrap_or(&name.namespace);
        let extension = NamespacedName::new(namespace, &auth.extension_ref.name);
        if !self.extension_clusters.contains_key(&extension) {
            return Err(Rejection::new(
                reason::AUTH_ERROR,
                format!("extension service {:?} not found", extension.to_string()),
            ));
        }
        let response_timeout = match auth.response_timeout.as_deref() {
            None => Timeout::default(),
            Some(timeout) => Timeout::parse(timeout).map_err(|error| {
                Rejection::new(
                    reason::AUTH_ERROR,
                    format!("error parsing response timeout: {error}"),
                )
            })?,
        };
        Ok(AuthorizationServer {
            cluster_name: ExtensionCluster::name_for(&extension.namespace, &extension.name),
            fail_open: auth.fail_open,
            response_timeout,
        })
    }

    fn proxy_route(&self, name: &NamespacedName, route: &api::Route) -> Result<Route, Rejection> {
        let route_error = |error: anyhow::Error| Rejection::new(reason::ROUTE_ERROR, error);

        let path = path_match_condition(&route.conditions).map_err(route_error)?;
        let headers: Vec<api::HeaderMatchCondition> = route
            .conditions
            .iter()
            .filter_map(|condition| condition.header.clone())
            .collect();
        let header_matches = policy::header_match_conditions(&headers).map_err(route_error)?;
        let queries: Vec<api::QueryParameterMatchCondition> = route
            .conditions
            .iter()
            .filter_map(|condition| condition.query_parameter.clone())
            .collect();
        let query_matches = policy::query_param_match_conditions(&queries).map_err(route_error)?;

        let actions = usize::from(!route.services.is_empty())
            + usize::from(route.request_redirect_policy.is_some())
            + usize::from(route.direct_response_policy.is_some());
        if actions == 0 {
            return Err(Rejection::new(
                reason::ROUTE_ERROR,
                "route must define one of services, requestRedirectPolicy or directResponsePolicy",
            ));
        }
        if actions > 1 {
            return Err(Rejection::new(
                reason::ROUTE_ERROR,
                "services, requestRedirectPolicy and directResponsePolicy are mutually exclusive",
            ));
        }

        let timeout_policy =
            policy::timeout_policy(route.timeout_policy.as_ref()).map_err(route_error)?;
        let rate_limit_policy =
            policy::rate_limit_policy(route.rate_limit_policy.as_ref()).map_err(route_error)?;
        let dynamic = namespace_tokens(&name.namespace);
        let request_headers_policy =
            policy::headers_policy(None, route.request_headers_policy.as_ref(), &dynamic)
                .map_err(route_error)?;
        let response_headers_policy =
            policy::headers_policy(None, route.response_headers_policy.as_ref(), &dynamic)
                .map_err(route_error)?;
        let prefix_rewrite =
            replace_prefix(route.path_rewrite_policy.as_ref(), &path).map_err(route_error)?;

        let redirect = route.request_redirect_policy.as_ref().map(redirect_policy);
        let direct_response = route
            .direct_response_policy
            .as_ref()
            .map(|policy| DirectResponse {
                status_code: policy.status_code,
                body: policy.body.clone(),
            });

        let strategy = policy::load_balancer_strategy(route.load_balancer_policy.as_ref());
        let mut clusters = Vec::with_capacity(route.services.len());
        for service in &route.services {
            let cluster = self
                .service_cluster(&name.namespace, service, strategy, &dynamic)
                .map_err(|error| Rejection::new(reason::SERVICE_ERROR, error))?;
            clusters.push(cluster);
        }

        Ok(Route {
            header_matches,
            query_matches,
            clusters,
            retry_policy: policy::retry_policy(route.retry_policy.as_ref()),
            timeout_policy,
            request_headers_policy,
            response_headers_policy,
            rate_limit_policy,
            prefix_rewrite,
            websocket: route.enable_websockets,
            redirect,
            direct_response,
            ..Route::new(path)
        })
    }

    fn service_cluster(
        &self,
        namespace: &str,
        service: &api::Service,
        load_balancer_strategy: LoadBalancerStrategy,
        dynamic: &BTreeMap<String, String>,
    ) -> Result<Cluster> {
        let upstream = self.resolve_service(namespace, &service.name, service.port)?;
        let protocol = service
            .protocol
            .as_deref()
            .map(Protocol::parse)
            .transpose()?;
        let upstream_validation = service
            .validation
            .as_ref()
            .map(|validation| self.upstream_validation(namespace, validation))
            .transpose()?;

        // Service-scoped dynamic tokens resolve against the upstream itself.
        let mut dynamic = dynamic.clone();
        dynamic.insert(policy::TOKEN_SERVICE_NAME.to_string(), upstream.name.clone());
        dynamic.insert(
            policy::TOKEN_SERVICE_PORT.to_string(),
            upstream.port.to_string(),
        );
        dynamic.insert(
            policy::TOKEN_SERVICE_FQDN.to_string(),
            self.info
                .service_fqdn(&upstream.namespace, &upstream.name, upstream.port),
        );
        let request_headers_policy =
            policy::headers_policy(None, service.request_headers_policy.as_ref(), &dynamic)?;
        let response_headers_policy =
            policy::headers_policy(None, service.response_headers_policy.as_ref(), &dynamic)?;

        Ok(Cluster {
            upstream: WeightedService {
                service: upstream,
                weight: service_weight(service.weight),
            },
            protocol,
            load_balancer_strategy,
            upstream_validation,
            request_headers_policy,
            response_headers_policy,
        })
    }

    // --- reference resolution

    fn resolve_service(&self, namespace: &str, name: &str, port: i32) -> Result<Service> {
        let target = NamespacedName::new(namespace, name);
        let ports = self
            .snapshot
            .services
            .get(&target)
            .ok_or_else(|| anyhow!("service {:?} not found", target.to_string()))?;
        if !ports.iter().any(|entry| entry.port == port) {
            bail!("port {port} on service {:?} not matched", target.to_string());
        }
        let port = u16::try_from(port)
            .map_err(|_| anyhow!("port {port} on service {:?} not matched", target.to_string()))?;
        Ok(Service {
            namespace: target.namespace,
            name: target.name,
            port,
        })
    }

    fn service_port_by_name(&self, namespace: &str, name: &str, port_name: &str) -> Result<i32> {
        let target = NamespacedName::new(namespace, name);
        let ports = self
            .snapshot
            .services
            .get(&target)
            .ok_or_else(|| anyhow!("service {:?} not found", target.to_string()))?;
        ports
            .iter()
            .find(|entry| entry.name.as_deref() == Some(port_name))
            .map(|entry| entry.port)
            .ok_or_else(|| {
                anyhow!(
                    "port {port_name:?} on service {:?} not matched",
                    target.to_string()
                )
            })
    }

    fn tls_secret(&self, name: &NamespacedName) -> Result<Secret> {
        let entry = self
            .snapshot
            .secrets
            .get(name)
            .ok_or_else(|| anyhow!("secret {:?} not found", name.to_string()))?;
        secrets::tls_secret(name, entry)
            .map_err(|error| anyhow!("secret {:?}: {error}", name.to_string()))
    }

    fn ca_secret(&self, name: &NamespacedName) -> Result<Vec<u8>> {
        let entry = self
            .snapshot
            .secrets
            .get(name)
            .ok_or_else(|| anyhow!("secret {:?} not found", name.to_string()))?;
        secrets::ca_bundle(entry).map_err(|error| anyhow!("secret {:?}: {error}", name.to_string()))
    }

    fn upstream_validation(
        &self,
        namespace: &str,
        validation: &api::UpstreamValidation,
    ) -> Result<PeerValidationContext> {
        let name = NamespacedName::from_reference(&validation.ca_secret, namespace);
        let ca = self.ca_secret(&name)?;
        Ok(PeerValidationContext {
            ca,
            subject_name: Some(validation.subject_name.clone()),
            skip_client_cert_validation: false,
        })
    }

    fn client_validation(
        &self,
        namespace: &str,
        validation: &api::DownstreamValidation,
    ) -> Result<PeerValidationContext> {
        if validation.ca_secret.is_empty() {
            if validation.skip_client_cert_validation {
                return Ok(PeerValidationContext {
                    ca: Vec::new(),
                    subject_name: None,
                    skip_client_cert_validation: true,
                });
            }
            bail!("clientValidation.caSecret must be specified");
        }
        let name = NamespacedName::from_reference(&validation.ca_secret, namespace);
        let ca = self.ca_secret(&name)?;
        // Subject pinning is an upstream-only concern.
        Ok(PeerValidationContext {
            ca,
            subject_name: None,
            skip_client_cert_validation: validation.skip_client_cert_validation,
        })
    }

    // --- assembly

    fn finish(self) -> (Dag, Vec<StatusUpdate>) {
        let mut virtual_hosts: Vec<VirtualHost> = self.virtual_hosts.into_values().collect();
        for vhost in &mut virtual_hosts {
            vhost.sort_routes();
        }
        let mut secure_virtual_hosts: Vec<SecureVirtualHost> =
            self.secure_virtual_hosts.into_values().collect();
        for svh in &mut secure_virtual_hosts {
            svh.virtual_host.sort_routes();
        }

        // Wire-level clusters and secrets deduplicate on their derived names
        // and come out sorted, so identical inputs render identically.
        let mut clusters: BTreeMap<String, Cluster> = BTreeMap::new();
        let mut secrets: BTreeMap<NamespacedName, Secret> = BTreeMap::new();
        for vhost in &virtual_hosts {
            collect_route_clusters(&mut clusters, &vhost.routes);
        }
        for svh in &secure_virtual_hosts {
            collect_route_clusters(&mut clusters, &svh.virtual_host.routes);
            if let Some(tcp) = &svh.tcp_proxy {
                for cluster in &tcp.clusters {
                    clusters
                        .entry(cluster.name())
                        .or_insert_with(|| cluster.clone());
                }
            }
            if let Some(secret) = &svh.secret {
                secrets.insert(
                    NamespacedName::new(&secret.namespace, &secret.name),
                    secret.clone(),
                );
            }
        }
        if let Some(fallback) = &self.fallback_certificate {
            // Delivered over SDS like any other certificate.
            secrets.insert(
                NamespacedName::new(&fallback.namespace, &fallback.name),
                fallback.clone(),
            );
        }

        let dag = Dag {
            virtual_hosts,
            secure_virtual_hosts,
            clusters: clusters.into_values().collect(),
            extension_clusters: self.extension_clusters.into_values().collect(),
            secrets: secrets.into_values().collect(),
            fallback_certificate: self.fallback_certificate,
        };
        (dag, self.statuses)
    }
}

// === helpers ===

fn sorted<T>(resources: &HashMap<NamespacedName, T>) -> Vec<(&NamespacedName, &T)> {
    let mut entries: Vec<_> = resources.iter().collect();
    entries.sort_by_key(|(name, _)| *name);
    entries
}

fn collect_route_clusters(clusters: &mut BTreeMap<String, Cluster>, routes: &[Route]) {
    for route in routes {
        for cluster in &route.clusters {
            clusters
                .entry(cluster.name())
                .or_insert_with(|| cluster.clone());
        }
    }
}

fn namespace_tokens(namespace: &str) -> BTreeMap<String, String> {
    let mut tokens = BTreeMap::new();
    tokens.insert(policy::TOKEN_NAMESPACE.to_string(), namespace.to_string());
    tokens
}

fn service_weight(weight: Option<i64>) -> Option<u32> {
    let weight = weight?;
    if weight <= 0 {
        return Some(0);
    }
    Some(u32::try_from(weight).unwrap_or(u32::MAX))
}

/// Flattens the path parts of a condition list into at most one match;
/// no path condition at all matches the root prefix.
fn path_match_condition(conditions: &[api::MatchCondition]) -> Result<PathMatch> {
    let mut path = None;
    for condition in conditions {
        let next = match (&condition.prefix, &condition.exact, &condition.regex) {
            (None, None, None) => continue,
            (Some(prefix), None, None) => {
                if !prefix.starts_with('/') {
                    bail!("prefix conditions must start with /, {prefix} was supplied");
                }
                PathMatch::Prefix(prefix.clone())
            }
            (None, Some(exact), None) => {
                if !exact.starts_with('/') {
                    bail!("exact conditions must start with /, {exact} was supplied");
                }
                PathMatch::Exact(exact.clone())
            }
            (None, None, Some(regex)) => {
                if Regex::new(regex).is_err() {
                    bail!("invalid regex condition {regex:?}");
                }
                PathMatch::Regex(regex.clone())
            }
            _ => bail!("more than one prefix, exact or regex is not allowed in a condition block"),
        };
        if path.is_some() {
            bail!("more than one prefix, exact or regex is not allowed in a condition block");
        }
        path = Some(next);
    }
    Ok(path.unwrap_or_else(|| PathMatch::Prefix("/".to_string())))
}

/// Picks the replacement for a prefix route: an entry naming the route's
/// own prefix wins over the catch-all entry that names none.
fn replace_prefix(
    policy: Option<&api::PathRewritePolicy>,
    path: &PathMatch,
) -> Result<Option<String>> {
    let Some(policy) = policy else {
        return Ok(None);
    };
    if policy.replace_prefix.is_empty() {
        return Ok(None);
    }

    let mut seen = BTreeSet::new();
    for entry in &policy.replace_prefix {
        let key = entry.prefix.clone().unwrap_or_default();
        if !seen.insert(key.clone()) {
            if key.is_empty() {
                bail!("ambiguous prefix replacement");
            }
            bail!("duplicate replacement prefix {key:?}");
        }
    }

    let PathMatch::Prefix(prefix) = path else {
        bail!("pathRewritePolicy.replacePrefix requires a prefix condition on the route");
    };
    let mut fallback = None;
    for entry in &policy.replace_prefix {
        match entry.prefix.as_deref() {
            Some(p) if p == prefix => return Ok(Some(entry.replacement.clone())),
            Some(_) => {}
            None => fallback = Some(entry.replacement.clone()),
        }
    }
    Ok(fallback)
}

fn redirect_policy(policy: &api::HTTPRequestRedirectPolicy) -> Redirect {
    Redirect {
        hostname: policy.hostname.clone(),
        scheme: policy.scheme.clone(),
        port: policy.port,
        status_code: policy.status_code.unwrap_or(302),
    }
}

/// The insecure twin of a secure route: same match, HTTPS redirect action.
fn https_redirect(route: &Route) -> Route {
    let mut redirect = Route::new(route.path.clone());
    redirect.header_matches = route.header_matches.clone();
    redirect.query_matches = route.query_matches.clone();
    redirect.redirect = Some(Redirect {
        hostname: None,
        scheme: Some("https".to_string()),
        port: None,
        status_code: 301,
    });
    redirect
}

fn ingress_hosts(spec: &k8s::IngressSpec) -> BTreeSet<String> {
    let mut hosts = BTreeSet::new();
    if spec.default_backend.is_some() {
        hosts.insert("*".to_string());
    }
    for rule in spec.rules.iter().flatten() {
        hosts.insert(rule_host(rule));
    }
    hosts
}

fn rule_host(rule: &k8s::IngressRule) -> String {
    match rule.host.as_deref() {
        Some(host) if !host.is_empty() => host.to_string(),
        _ => "*".to_string(),
    }
}

fn ingress_path_match(path: &k8s::HTTPIngressPath) -> Result<PathMatch> {
    let raw = match path.path.as_deref() {
        Some(path) if !path.is_empty() => path,
        _ => "/",
    };
    match path.path_type.as_str() {
        "Exact" => {
            if !raw.starts_with('/') {
                bail!("path must start with /, {raw} was supplied");
            }
            Ok(PathMatch::Exact(raw.to_string()))
        }
        "Prefix" => {
            if !raw.starts_with('/') {
                bail!("path must start with /, {raw} was supplied");
            }
            Ok(PathMatch::Prefix(raw.to_string()))
        }
        // ImplementationSpecific: regex-looking paths match as regexes.
        _ => {
            if raw.contains(&['^', '+', '*', '[', ']', '%'][..]) {
                Ok(PathMatch::Regex(raw.to_string()))
            } else {
                Ok(PathMatch::Prefix(raw.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn condition(
        prefix: Option<&str>,
        exact: Option<&str>,
        regex: Option<&str>,
    ) -> api::MatchCondition {
        api::MatchCondition {
            prefix: prefix.map(str::to_string),
            exact: exact.map(str::to_string),
            regex: regex.map(str::to_string),
            header: None,
            query_parameter: None,
        }
    }

    fn rewrite(entries: &[(Option<&str>, &str)]) -> api::PathRewritePolicy {
        api::PathRewritePolicy {
            replace_prefix: entries
                .iter()
                .map(|(prefix, replacement)| api::ReplacePrefix {
                    prefix: prefix.map(str::to_string),
                    replacement: replacement.to_string(),
                })
                .collect(),
        }
    }

    #[test]
    fn routes_default_to_the_root_prefix() {
        assert_eq!(
            path_match_condition(&[]).unwrap(),
            PathMatch::Prefix("/".to_string())
        );
        assert_eq!(
            path_match_condition(&[condition(None, None, None)]).unwrap(),
            PathMatch::Prefix("/".to_string())
        );
    }

    #[test]
    fn at_most_one_path_condition_is_allowed() {
        let error = path_match_condition(&[
            condition(Some("/a"), None, None),
            condition(Some("/b"), None, None),
        ])
        .unwrap_err();
        assert_eq!(
            error.to_string(),
            "more than one prefix, exact or regex is not allowed in a condition block"
        );

        let error = path_match_condition(&[condition(Some("/a"), Some("/a"), None)]).unwrap_err();
        assert_eq!(
            error.to_string(),
            "more than one prefix, exact or regex is not allowed in a condition block"
        );
    }

    #[test]
    fn path_conditions_must_be_rooted() {
        let error = path_match_condition(&[condition(Some("app"), None, None)]).unwrap_err();
        assert_eq!(
            error.to_string(),
            "prefix conditions must start with /, app was supplied"
        );
        let error = path_match_condition(&[condition(None, Some("app"), None)]).unwrap_err();
        assert_eq!(
            error.to_string(),
            "exact conditions must start with /, app was supplied"
        );
    }

    #[test]
    fn regex_conditions_must_compile() {
        assert_eq!(
            path_match_condition(&[condition(None, None, Some("/api/v[12]"))]).unwrap(),
            PathMatch::Regex("/api/v[12]".to_string())
        );
        let error = path_match_condition(&[condition(None, None, Some("/api/("))]).unwrap_err();
        assert_eq!(error.to_string(), "invalid regex condition \"/api/(\"");
    }

    #[test]
    fn older_claimants_win_hostnames() {
        let base = Claimant {
            created: DateTime::<Utc>::MIN_UTC,
            namespace: "default".to_string(),
            name: "a".to_string(),
            kind: KIND_HTTP_PROXY,
        };
        let newer = Claimant {
            created: DateTime::<Utc>::MIN_UTC + chrono::Duration::seconds(1),
            ..base.clone()
        };
        assert!(base < newer, "an older claim beats a newer one");

        let later_name = Claimant {
            name: "b".to_string(),
            ..base.clone()
        };
        assert!(base < later_name, "ties break on name");

        let later_namespace = Claimant {
            namespace: "zz".to_string(),
            name: "0".to_string(),
            ..base.clone()
        };
        assert!(base < later_namespace, "namespace outranks name");
    }

    #[test]
    fn replace_prefix_prefers_the_matching_entry() {
        let policy = rewrite(&[(None, "/fallback"), (Some("/api"), "/v2")]);
        let api = PathMatch::Prefix("/api".to_string());
        let web = PathMatch::Prefix("/web".to_string());

        assert_eq!(
            replace_prefix(Some(&policy), &api).unwrap(),
            Some("/v2".to_string())
        );
        assert_eq!(
            replace_prefix(Some(&policy), &web).unwrap(),
            Some("/fallback".to_string())
        );

        let specific_only = rewrite(&[(Some("/api"), "/v2")]);
        assert_eq!(replace_prefix(Some(&specific_only), &web).unwrap(), None);
        assert_eq!(replace_prefix(None, &api).unwrap(), None);
    }

    #[test]
    fn replace_prefix_rejects_duplicates() {
        let policy = rewrite(&[(Some("/api"), "/a"), (Some("/api"), "/b")]);
        let error = replace_prefix(Some(&policy), &PathMatch::Prefix("/api".to_string()))
            .unwrap_err();
        assert_eq!(error.to_string(), "duplicate replacement prefix \"/api\"");

        let policy = rewrite(&[(None, "/a"), (None, "/b")]);
        let error = replace_prefix(Some(&policy), &PathMatch::Prefix("/api".to_string()))
            .unwrap_err();
        assert_eq!(error.to_string(), "ambiguous prefix replacement");
    }

    #[test]
    fn replace_prefix_requires_a_prefix_route() {
        let policy = rewrite(&[(None, "/a")]);
        let error =
            replace_prefix(Some(&policy), &PathMatch::Exact("/api".to_string())).unwrap_err();
        assert_eq!(
            error.to_string(),
            "pathRewritePolicy.replacePrefix requires a prefix condition on the route"
        );
    }

    #[test]
    fn ingress_paths_map_to_match_kinds() {
        let path = |path_type: &str, path: Option<&str>| k8s::HTTPIngressPath {
            backend: Default::default(),
            path: path.map(str::to_string),
            path_type: path_type.to_string(),
        };

        assert_eq!(
            ingress_path_match(&path("Exact", Some("/app"))).unwrap(),
            PathMatch::Exact("/app".to_string())
        );
        assert_eq!(
            ingress_path_match(&path("Prefix", None)).unwrap(),
            PathMatch::Prefix("/".to_string())
        );
        assert_eq!(
            ingress_path_match(&path("ImplementationSpecific", Some("/static/.*\\.png"))).unwrap(),
            PathMatch::Regex("/static/.*\\.png".to_string())
        );
        assert_eq!(
            ingress_path_match(&path("ImplementationSpecific", Some("/static"))).unwrap(),
            PathMatch::Prefix("/static".to_string())
        );

        let error = ingress_path_match(&path("Prefix", Some("app"))).unwrap_err();
        assert_eq!(error.to_string(), "path must start with /, app was supplied");
    }

    #[test]
    fn ingress_hosts_cover_default_backends_and_bare_rules() {
        let spec = k8s::IngressSpec {
            default_backend: Some(Default::default()),
            rules: Some(vec![
                k8s::IngressRule {
                    host: Some("app.example.com".to_string()),
                    http: None,
                },
                k8s::IngressRule {
                    host: None,
                    http: None,
                },
            ]),
            ..Default::default()
        };
        let hosts: Vec<String> = ingress_hosts(&spec).into_iter().collect();
        assert_eq!(
            hosts,
            vec!["*".to_string(), "app.example.com".to_string()]
        );
    }

    #[test]
    fn redirect_status_defaults_to_302() {
        let redirect = redirect_policy(&api::HTTPRequestRedirectPolicy {
            hostname: None,
            scheme: Some("https".to_string()),
            port: None,
            status_code: None,
        });
        assert_eq!(redirect.status_code, 302);
        assert_eq!(redirect.scheme.as_deref(), Some("https"));
    }

    #[test]
    fn service_weights_clamp_to_u32() {
        assert_eq!(service_weight(None), None);
        assert_eq!(service_weight(Some(-3)), Some(0));
        assert_eq!(service_weight(Some(0)), Some(0));
        assert_eq!(service_weight(Some(7)), Some(7));
        assert_eq!(service_weight(Some(i64::MAX)), Some(u32::MAX));
    }
}
