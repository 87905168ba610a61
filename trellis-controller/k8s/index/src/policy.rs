//! Translates user-facing policy fragments into their graph form.
//!
//! These functions validate as they translate: any error they return becomes
//! the condition message on the object that carried the policy, so the
//! wording stays user-facing.

use anyhow::{anyhow, bail, Result};
use regex::Regex;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::OnceLock,
    time,
};
use trellis_controller_core::{
    GlobalRateLimitPolicy, HeaderMatch, HeaderMatchKind, HeadersPolicy, LoadBalancerStrategy,
    LocalRateLimitPolicy, QueryParamMatch, QueryParamMatchKind, RateLimitDescriptor,
    RateLimitDescriptorEntry, RateLimitPolicy, RetryPolicy, Timeout, TimeoutPolicy,
};
use trellis_controller_k8s_api::v1 as api;

/// Dynamic tokens substituted into header values at translation time.
///
/// Users reference them as `%TRELLIS_NAMESPACE%` and so on; tokens that do
/// not apply in the policy's context are escaped to literal text.
pub const TOKEN_NAMESPACE: &str = "TRELLIS_NAMESPACE";
pub const TOKEN_SERVICE_NAME: &str = "TRELLIS_SERVICE_NAME";
pub const TOKEN_SERVICE_PORT: &str = "TRELLIS_SERVICE_PORT";
pub const TOKEN_SERVICE_FQDN: &str = "TRELLIS_SERVICE_FQDN";

/// Request-time dynamic fields the proxy resolves itself. Header values
/// naming one of these keep it dynamic; any other `%...%` construct is
/// escaped to literal text.
const DYNAMIC_FIELDS: &[&str] = &[
    "DOWNSTREAM_REMOTE_ADDRESS",
    "DOWNSTREAM_REMOTE_ADDRESS_WITHOUT_PORT",
    "DOWNSTREAM_LOCAL_ADDRESS",
    "DOWNSTREAM_LOCAL_ADDRESS_WITHOUT_PORT",
    "DOWNSTREAM_LOCAL_PORT",
    "DOWNSTREAM_LOCAL_URI_SAN",
    "DOWNSTREAM_PEER_URI_SAN",
    "DOWNSTREAM_LOCAL_SUBJECT",
    "DOWNSTREAM_PEER_SUBJECT",
    "DOWNSTREAM_PEER_ISSUER",
    "DOWNSTREAM_TLS_SESSION_ID",
    "DOWNSTREAM_TLS_CIPHER",
    "DOWNSTREAM_TLS_VERSION",
    "DOWNSTREAM_PEER_FINGERPRINT_256",
    "DOWNSTREAM_PEER_FINGERPRINT_1",
    "DOWNSTREAM_PEER_SERIAL",
    "DOWNSTREAM_PEER_CERT",
    "DOWNSTREAM_PEER_CERT_V_START",
    "DOWNSTREAM_PEER_CERT_V_END",
    "HOSTNAME",
    "PROTOCOL",
    "UPSTREAM_REMOTE_ADDRESS",
    "RESPONSE_FLAGS",
    "RESPONSE_CODE_DETAILS",
];

const HEADER_NAME_MSG: &str = "a valid HTTP header must consist of alphanumeric characters or \
     '-' (e.g. 'X-Header-Name', regex used for validation is '[-A-Za-z0-9]+')";

/// Translates a retry policy, applying the retry-on and count defaults.
///
/// A negative count disables retries; zero and absent both mean one retry.
/// An unparseable per-try timeout falls back to the proxy default rather
/// than failing the route.
pub fn retry_policy(policy: Option<&api::RetryPolicy>) -> Option<RetryPolicy> {
    let policy = policy?;
    let retry_on = match policy.retry_on.as_deref() {
        Some(conditions) if !conditions.is_empty() => conditions.join(","),
        _ => "5xx".to_string(),
    };
    let num_retries = match policy.count {
        Some(count) if count < 0 => 0,
        Some(count) if count > 0 => u32::try_from(count).unwrap_or(u32::MAX),
        _ => 1,
    };
    let per_try_timeout = policy
        .per_try_timeout
        .as_deref()
        .map(|timeout| Timeout::parse(timeout).unwrap_or_default())
        .unwrap_or_default();
    Some(RetryPolicy {
        retry_on,
        num_retries,
        per_try_timeout,
        retriable_status_codes: policy.retriable_status_codes.clone().unwrap_or_default(),
    })
}

/// Translates response and idle timeouts. Unlike the per-try retry timeout,
/// an unparseable value here is a hard error.
pub fn timeout_policy(policy: Option<&api::TimeoutPolicy>) -> Result<TimeoutPolicy> {
    let Some(policy) = policy else {
        return Ok(TimeoutPolicy::default());
    };
    let response = Timeout::parse(policy.response.as_deref().unwrap_or(""))
        .map_err(|error| anyhow!("error parsing response timeout: {error}"))?;
    let idle = Timeout::parse(policy.idle.as_deref().unwrap_or(""))
        .map_err(|error| anyhow!("error parsing idle timeout: {error}"))?;
    Ok(TimeoutPolicy { response, idle })
}

/// Maps a load-balancer strategy name. Unrecognized or absent strategies
/// fall back to the proxy default; names are case-sensitive.
pub fn load_balancer_strategy(policy: Option<&api::LoadBalancerPolicy>) -> LoadBalancerStrategy {
    match policy.and_then(|policy| policy.strategy.as_deref()) {
        Some("WeightedLeastRequest") => LoadBalancerStrategy::WeightedLeastRequest,
        Some("Random") => LoadBalancerStrategy::Random,
        Some("Cookie") => LoadBalancerStrategy::Cookie,
        Some("RequestHash") => LoadBalancerStrategy::RequestHash,
        _ => LoadBalancerStrategy::Default,
    }
}

/// Translates a header mutation policy, layering `policy` over `default`.
///
/// Set entries from the object policy win over same-named defaults; defaults
/// not overridden are retained; remove lists are unioned. Names are
/// canonicalized before comparison. Setting or removing `Host`, duplicate
/// names within one source, and names failing validation are hard errors.
pub fn headers_policy(
    default: Option<&HeadersPolicy>,
    policy: Option<&api::HeadersPolicy>,
    dynamic: &BTreeMap<String, String>,
) -> Result<Option<HeadersPolicy>> {
    let mut set = BTreeMap::new();
    let mut remove = BTreeSet::new();

    if let Some(policy) = policy {
        for entry in &policy.set {
            let key = canonicalize_header_name(&entry.name);
            if set.contains_key(&key) {
                bail!("duplicate header addition: {key:?}");
            }
            if key == "Host" {
                bail!("rewriting {key:?} header is not supported");
            }
            if !is_header_name(&key) {
                bail!("invalid set header {key:?}: [{HEADER_NAME_MSG}]");
            }
            set.insert(key, escape_header_value(&entry.value, dynamic));
        }
        for name in &policy.remove {
            let key = canonicalize_header_name(name);
            if remove.contains(&key) {
                bail!("duplicate header removal: {key:?}");
            }
            if key == "Host" {
                bail!("rewriting {key:?} header is not supported");
            }
            if !is_header_name(&key) {
                bail!("invalid remove header {key:?}: [{HEADER_NAME_MSG}]");
            }
            remove.insert(key);
        }
    }

    if let Some(default) = default {
        for (name, value) in &default.set {
            let key = canonicalize_header_name(name);
            if key == "Host" {
                bail!("rewriting {key:?} header is not supported");
            }
            if !is_header_name(&key) {
                bail!("invalid set header {key:?}: [{HEADER_NAME_MSG}]");
            }
            set.entry(key)
                .or_insert_with(|| escape_header_value(value, dynamic));
        }
        for name in &default.remove {
            let key = canonicalize_header_name(name);
            if key == "Host" {
                bail!("rewriting {key:?} header is not supported");
            }
            if !is_header_name(&key) {
                bail!("invalid remove header {key:?}: [{HEADER_NAME_MSG}]");
            }
            remove.insert(key);
        }
    }

    if set.is_empty() && remove.is_empty() {
        return Ok(None);
    }
    Ok(Some(HeadersPolicy { set, remove }))
}

/// Translates a rate limit policy. Local and global limits may coexist.
pub fn rate_limit_policy(policy: Option<&api::RateLimitPolicy>) -> Result<Option<RateLimitPolicy>> {
    let Some(policy) = policy else {
        return Ok(None);
    };
    let local = policy
        .local
        .as_ref()
        .map(local_rate_limit_policy)
        .transpose()?;
    let global = policy
        .global
        .as_ref()
        .map(global_rate_limit_policy)
        .transpose()?;
    if local.is_none() && global.is_none() {
        return Ok(None);
    }
    Ok(Some(RateLimitPolicy { local, global }))
}

fn local_rate_limit_policy(policy: &api::LocalRateLimitPolicy) -> Result<LocalRateLimitPolicy> {
    if policy.requests == 0 {
        bail!(
            "invalid requests value {} in local rate limit policy",
            policy.requests
        );
    }
    let fill_interval = match policy.unit.as_str() {
        "second" => time::Duration::from_secs(1),
        "minute" => time::Duration::from_secs(60),
        "hour" => time::Duration::from_secs(3600),
        unit => bail!("invalid unit {unit:?} in local rate limit policy"),
    };

    let mut response_headers_to_add = BTreeMap::new();
    for header in &policy.response_headers_to_add {
        let key = canonicalize_header_name(&header.name);
        if response_headers_to_add.contains_key(&key) {
            bail!("duplicate header addition: {key:?}");
        }
        if !is_header_name(&key) {
            bail!("invalid header name {key:?}: [{HEADER_NAME_MSG}]");
        }
        response_headers_to_add.insert(key, escape_header_value(&header.value, &BTreeMap::new()));
    }

    Ok(LocalRateLimitPolicy {
        max_tokens: policy.requests + policy.burst,
        tokens_per_fill: policy.requests,
        fill_interval,
        response_status_code: policy.response_status_code.filter(|code| *code > 0),
        response_headers_to_add,
    })
}

fn global_rate_limit_policy(policy: &api::GlobalRateLimitPolicy) -> Result<GlobalRateLimitPolicy> {
    let mut descriptors = Vec::with_capacity(policy.descriptors.len());
    for descriptor in &policy.descriptors {
        let entries = descriptor
            .entries
            .iter()
            .map(descriptor_entry)
            .collect::<Result<Vec<_>>>()?;
        descriptors.push(RateLimitDescriptor { entries });
    }
    Ok(GlobalRateLimitPolicy { descriptors })
}

fn descriptor_entry(entry: &api::RateLimitDescriptorEntry) -> Result<RateLimitDescriptorEntry> {
    match (
        &entry.generic_key,
        &entry.remote_address,
        &entry.request_header,
        &entry.request_header_value_match,
    ) {
        (Some(generic), None, None, None) => Ok(RateLimitDescriptorEntry::GenericKey {
            key: generic.key.clone(),
            value: generic.value.clone(),
        }),
        (None, Some(_), None, None) => Ok(RateLimitDescriptorEntry::RemoteAddress),
        (None, None, Some(header), None) => Ok(RateLimitDescriptorEntry::RequestHeader {
            header_name: header.header_name.clone(),
            descriptor_key: header.descriptor_key.clone(),
        }),
        (None, None, None, Some(matcher)) => Ok(RateLimitDescriptorEntry::HeaderValueMatch {
            headers: header_match_conditions(&matcher.headers)?,
            expect_match: matcher.expect_match,
            value: matcher.value.clone(),
        }),
        _ => bail!("rate limit descriptor entry must have exactly one field set"),
    }
}

/// Translates header match conditions. Each condition must set exactly one
/// matcher; `present: false` matches the header's absence.
pub fn header_match_conditions(
    conditions: &[api::HeaderMatchCondition],
) -> Result<Vec<HeaderMatch>> {
    conditions.iter().map(header_match_condition).collect()
}

fn header_match_condition(condition: &api::HeaderMatchCondition) -> Result<HeaderMatch> {
    let name = condition.name.clone();
    let (kind, invert) = match (
        condition.present,
        &condition.contains,
        &condition.not_contains,
        &condition.exact,
        &condition.not_exact,
    ) {
        (Some(true), None, None, None, None) => (HeaderMatchKind::Present, false),
        (Some(false), None, None, None, None) => (HeaderMatchKind::Present, true),
        (None, Some(value), None, None, None) => (HeaderMatchKind::Contains(value.clone()), false),
        (None, None, Some(value), None, None) => (HeaderMatchKind::Contains(value.clone()), true),
        (None, None, None, Some(value), None) => (HeaderMatchKind::Exact(value.clone()), false),
        (None, None, None, None, Some(value)) => (HeaderMatchKind::Exact(value.clone()), true),
        _ => bail!(
            "header match condition on {name:?} must set exactly one of \
             present, contains, notcontains, exact, notexact"
        ),
    };
    Ok(HeaderMatch { name, kind, invert })
}

/// Translates query parameter match conditions.
pub fn query_param_match_conditions(
    conditions: &[api::QueryParameterMatchCondition],
) -> Result<Vec<QueryParamMatch>> {
    conditions
        .iter()
        .map(|condition| {
            let name = condition.name.clone();
            let kind = match (&condition.exact, condition.present) {
                (Some(value), None) => QueryParamMatchKind::Exact(value.clone()),
                (None, Some(true)) => QueryParamMatchKind::Present,
                _ => bail!(
                    "query parameter match condition on {name:?} must set \
                     exactly one of exact, present"
                ),
            };
            Ok(QueryParamMatch { name, kind })
        })
        .collect()
}

/// Escapes a header value so the proxy treats it as literal text, while
/// keeping recognized dynamic constructs dynamic.
///
/// Every `%` is doubled first; then `%TOKEN%` constructs naming a supplied
/// dynamic token are substituted, proxy-native dynamic fields and
/// well-formed `%REQ(...)%` references are un-escaped, and everything else
/// stays doubled.
pub fn escape_header_value(value: &str, dynamic: &BTreeMap<String, String>) -> String {
    if !value.contains('%') {
        return value.to_string();
    }
    let mut escaped = value.replace('%', "%%");
    for (token, replacement) in dynamic {
        escaped = escaped.replace(&format!("%%{token}%%"), replacement);
    }
    for field in DYNAMIC_FIELDS {
        escaped = escaped.replace(&format!("%%{field}%%"), &format!("%{field}%"));
    }
    req_field().replace_all(&escaped, "$1").into_owned()
}

fn req_field() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"%(%REQ\([\w-]+\)%)%").expect("static pattern is valid"))
}

/// Canonicalizes a header name the way HTTP/1 header casing is usually
/// written: the first letter and any letter following a `-` are upper-cased,
/// the rest lower-cased. A name carrying bytes outside the HTTP token
/// alphabet is returned unchanged so error messages quote exactly what the
/// user wrote.
pub fn canonicalize_header_name(name: &str) -> String {
    const TOKEN_EXTRAS: &[u8] = b"!#$%&'*+-.^_`|~";
    if name
        .bytes()
        .any(|b| !b.is_ascii_alphanumeric() && !TOKEN_EXTRAS.contains(&b))
    {
        return name.to_string();
    }
    let mut canonical = String::with_capacity(name.len());
    let mut upper = true;
    for b in name.bytes() {
        let b = if upper {
            b.to_ascii_uppercase()
        } else {
            b.to_ascii_lowercase()
        };
        canonical.push(b as char);
        upper = b == b'-';
    }
    canonical
}

fn is_header_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b == b'-' || b.is_ascii_alphanumeric())
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::btreemap;
    use pretty_assertions::assert_eq;

    fn headers(set: &[(&str, &str)], remove: &[&str]) -> api::HeadersPolicy {
        api::HeadersPolicy {
            set: set
                .iter()
                .map(|(name, value)| api::HeaderValue {
                    name: name.to_string(),
                    value: value.to_string(),
                })
                .collect(),
            remove: remove.iter().map(|name| name.to_string()).collect(),
        }
    }

    fn no_tokens() -> BTreeMap<String, String> {
        BTreeMap::new()
    }

    fn service_tokens() -> BTreeMap<String, String> {
        btreemap! {
            TOKEN_NAMESPACE.to_string() => "myns".to_string(),
            TOKEN_SERVICE_NAME.to_string() => "myservice".to_string(),
            TOKEN_SERVICE_PORT.to_string() => "80".to_string(),
            TOKEN_SERVICE_FQDN.to_string() => "myservice.myns.svc.cluster.local:80".to_string(),
        }
    }

    #[test]
    fn retry_policy_defaults() {
        assert_eq!(retry_policy(None), None);

        let defaulted = retry_policy(Some(&api::RetryPolicy::default())).unwrap();
        assert_eq!(defaulted.retry_on, "5xx");
        assert_eq!(defaulted.num_retries, 1);
        assert_eq!(defaulted.per_try_timeout, Timeout::Default);
        assert!(defaulted.retriable_status_codes.is_empty());
    }

    #[test]
    fn retry_policy_count_clamping() {
        let zero = retry_policy(Some(&api::RetryPolicy {
            count: Some(0),
            ..Default::default()
        }))
        .unwrap();
        assert_eq!(zero.num_retries, 1);

        let negative = retry_policy(Some(&api::RetryPolicy {
            count: Some(-1),
            ..Default::default()
        }))
        .unwrap();
        assert_eq!(negative.num_retries, 0);

        let explicit = retry_policy(Some(&api::RetryPolicy {
            count: Some(7),
            ..Default::default()
        }))
        .unwrap();
        assert_eq!(explicit.num_retries, 7);
    }

    #[test]
    fn retry_policy_conditions_join() {
        let policy = retry_policy(Some(&api::RetryPolicy {
            retry_on: Some(vec![
                "gateway-error".to_string(),
                "connect-failure".to_string(),
            ]),
            retriable_status_codes: Some(vec![502, 503]),
            ..Default::default()
        }))
        .unwrap();
        assert_eq!(policy.retry_on, "gateway-error,connect-failure");
        assert_eq!(policy.retriable_status_codes, vec![502, 503]);
    }

    #[test]
    fn retry_policy_per_try_timeout() {
        let timed = retry_policy(Some(&api::RetryPolicy {
            per_try_timeout: Some("10s".to_string()),
            ..Default::default()
        }))
        .unwrap();
        assert_eq!(
            timed.per_try_timeout,
            Timeout::Duration(time::Duration::from_secs(10))
        );

        // Zero and unparseable per-try timeouts fall back to the default.
        let zero = retry_policy(Some(&api::RetryPolicy {
            per_try_timeout: Some("0s".to_string()),
            ..Default::default()
        }))
        .unwrap();
        assert_eq!(zero.per_try_timeout, Timeout::Default);

        let junk = retry_policy(Some(&api::RetryPolicy {
            per_try_timeout: Some("please".to_string()),
            ..Default::default()
        }))
        .unwrap();
        assert_eq!(junk.per_try_timeout, Timeout::Default);
    }

    #[test]
    fn timeout_policy_parses_both_fields() {
        assert_eq!(timeout_policy(None).unwrap(), TimeoutPolicy::default());

        let policy = timeout_policy(Some(&api::TimeoutPolicy {
            response: Some("1m30s".to_string()),
            idle: Some("900s".to_string()),
        }))
        .unwrap();
        assert_eq!(
            policy.response,
            Timeout::Duration(time::Duration::from_secs(90))
        );
        assert_eq!(policy.idle, Timeout::Duration(time::Duration::from_secs(900)));

        let infinite = timeout_policy(Some(&api::TimeoutPolicy {
            response: Some("infinite".to_string()),
            idle: None,
        }))
        .unwrap();
        assert_eq!(infinite.response, Timeout::Disabled);
        assert_eq!(infinite.idle, Timeout::Default);
    }

    #[test]
    fn timeout_policy_rejects_unitless_values() {
        let error = timeout_policy(Some(&api::TimeoutPolicy {
            response: Some("90".to_string()),
            idle: None,
        }))
        .unwrap_err();
        assert!(
            error.to_string().starts_with("error parsing response timeout"),
            "{error}"
        );

        let error = timeout_policy(Some(&api::TimeoutPolicy {
            response: None,
            idle: Some("bogus".to_string()),
        }))
        .unwrap_err();
        assert!(
            error.to_string().starts_with("error parsing idle timeout"),
            "{error}"
        );
    }

    #[test]
    fn load_balancer_strategy_names_are_case_sensitive() {
        assert_eq!(load_balancer_strategy(None), LoadBalancerStrategy::Default);
        for (name, want) in [
            ("WeightedLeastRequest", LoadBalancerStrategy::WeightedLeastRequest),
            ("Random", LoadBalancerStrategy::Random),
            ("Cookie", LoadBalancerStrategy::Cookie),
            ("RequestHash", LoadBalancerStrategy::RequestHash),
            ("random", LoadBalancerStrategy::Default),
            ("", LoadBalancerStrategy::Default),
        ] {
            let policy = api::LoadBalancerPolicy {
                strategy: Some(name.to_string()),
            };
            assert_eq!(load_balancer_strategy(Some(&policy)), want, "{name}");
        }
    }

    #[test]
    fn headers_policy_empty_is_none() {
        assert_eq!(headers_policy(None, None, &no_tokens()).unwrap(), None);
        assert_eq!(
            headers_policy(None, Some(&headers(&[], &[])), &no_tokens()).unwrap(),
            None
        );
    }

    #[test]
    fn headers_policy_canonicalizes_names() {
        let policy = headers_policy(
            None,
            Some(&headers(&[("k-baz", "blah")], &["k-nada"])),
            &no_tokens(),
        )
        .unwrap()
        .unwrap();
        assert_eq!(
            policy.set,
            btreemap! { "K-Baz".to_string() => "blah".to_string() }
        );
        assert!(policy.remove.contains("K-Nada"));
    }

    #[test]
    fn headers_policy_rejects_duplicates() {
        let error = headers_policy(
            None,
            Some(&headers(&[("k-foo", "bar"), ("K-Foo", "baz")], &[])),
            &no_tokens(),
        )
        .unwrap_err();
        assert_eq!(error.to_string(), r#"duplicate header addition: "K-Foo""#);

        let error = headers_policy(
            None,
            Some(&headers(&[], &["k-foo", "K-Foo"])),
            &no_tokens(),
        )
        .unwrap_err();
        assert_eq!(error.to_string(), r#"duplicate header removal: "K-Foo""#);
    }

    #[test]
    fn headers_policy_rejects_invalid_names() {
        let error = headers_policy(
            None,
            Some(&headers(&[("  K-Foo", "bar")], &[])),
            &no_tokens(),
        )
        .unwrap_err();
        assert_eq!(
            error.to_string(),
            format!(r#"invalid set header "  K-Foo": [{HEADER_NAME_MSG}]"#)
        );

        let error = headers_policy(
            None,
            Some(&headers(&[], &["  K-Foo"])),
            &no_tokens(),
        )
        .unwrap_err();
        assert_eq!(
            error.to_string(),
            format!(r#"invalid remove header "  K-Foo": [{HEADER_NAME_MSG}]"#)
        );
    }

    #[test]
    fn headers_policy_rejects_host_rewrites() {
        for policy in [
            headers(&[("Host", "elsewhere.com")], &[]),
            headers(&[("hOSt", "elsewhere.com")], &[]),
            headers(&[], &["Host"]),
        ] {
            let error = headers_policy(None, Some(&policy), &no_tokens()).unwrap_err();
            assert_eq!(
                error.to_string(),
                r#"rewriting "Host" header is not supported"#
            );
        }
    }

    #[test]
    fn headers_policy_escapes_percents() {
        let policy = headers_policy(
            None,
            Some(&headers(
                &[("K-Foo", "100%"), ("Lot-Of-Percents", "%%%%%")],
                &[],
            )),
            &no_tokens(),
        )
        .unwrap()
        .unwrap();
        assert_eq!(
            policy.set,
            btreemap! {
                "K-Foo".to_string() => "100%%".to_string(),
                "Lot-Of-Percents".to_string() => "%%%%%%%%%%".to_string(),
            }
        );
    }

    #[test]
    fn headers_policy_substitutes_dynamic_tokens() {
        let policy = headers_policy(
            None,
            Some(&headers(
                &[
                    (
                        "l5d-dst-override",
                        "%TRELLIS_SERVICE_NAME%.%TRELLIS_NAMESPACE%.svc.cluster.local:%TRELLIS_SERVICE_PORT%",
                    ),
                    ("x-upstream", "%TRELLIS_SERVICE_FQDN%"),
                ],
                &[],
            )),
            &service_tokens(),
        )
        .unwrap()
        .unwrap();
        assert_eq!(
            policy.set,
            btreemap! {
                "L5d-Dst-Override".to_string() =>
                    "myservice.myns.svc.cluster.local:80".to_string(),
                "X-Upstream".to_string() =>
                    "myservice.myns.svc.cluster.local:80".to_string(),
            }
        );
    }

    #[test]
    fn headers_policy_escapes_unavailable_tokens() {
        // Route-level policies carry only the namespace token; the service
        // tokens stay escaped.
        let tokens = btreemap! { TOKEN_NAMESPACE.to_string() => "myns".to_string() };
        let policy = headers_policy(
            None,
            Some(&headers(
                &[(
                    "l5d-dst-override",
                    "%TRELLIS_SERVICE_NAME%.%TRELLIS_NAMESPACE%.svc.cluster.local:%TRELLIS_SERVICE_PORT%",
                )],
                &[],
            )),
            &tokens,
        )
        .unwrap()
        .unwrap();
        assert_eq!(
            policy.set["L5d-Dst-Override"],
            "%%TRELLIS_SERVICE_NAME%%.myns.svc.cluster.local:%%TRELLIS_SERVICE_PORT%%"
        );
    }

    #[test]
    fn headers_policy_keeps_proxy_dynamic_fields() {
        let policy = headers_policy(
            None,
            Some(&headers(
                &[
                    ("Client-Ip", "%DOWNSTREAM_REMOTE_ADDRESS%"),
                    ("Req-Host", "%REQ(Host)%"),
                    ("Bad-Req", "%REQ(inv@lid-header)%"),
                    ("Unknown", "%FIGMENT%"),
                ],
                &[],
            )),
            &no_tokens(),
        )
        .unwrap()
        .unwrap();
        assert_eq!(policy.set["Client-Ip"], "%DOWNSTREAM_REMOTE_ADDRESS%");
        assert_eq!(policy.set["Req-Host"], "%REQ(Host)%");
        assert_eq!(policy.set["Bad-Req"], "%%REQ(inv@lid-header)%%");
        assert_eq!(policy.set["Unknown"], "%%FIGMENT%%");
    }

    #[test]
    fn headers_policy_merges_defaults_under_object_policy() {
        let default = HeadersPolicy {
            set: btreemap! {
                "K-Foo".to_string() => "50%".to_string(),
                "K-Default".to_string() => "default".to_string(),
            },
            remove: ["K-Gone".to_string()].into_iter().collect(),
        };
        let policy = headers_policy(
            Some(&default),
            Some(&headers(&[("K-Foo", "100%")], &["K-Nada"])),
            &no_tokens(),
        )
        .unwrap()
        .unwrap();
        // The object's value wins; the default-only key is retained and its
        // value escaped; removals are unioned.
        assert_eq!(
            policy.set,
            btreemap! {
                "K-Foo".to_string() => "100%%".to_string(),
                "K-Default".to_string() => "default".to_string(),
            }
        );
        assert_eq!(
            policy.remove.iter().cloned().collect::<Vec<_>>(),
            vec!["K-Gone".to_string(), "K-Nada".to_string()]
        );
    }

    #[test]
    fn headers_policy_validates_default_entries() {
        let default = HeadersPolicy {
            set: btreemap! { "  K-Foo".to_string() => "bar".to_string() },
            remove: BTreeSet::new(),
        };
        let error =
            headers_policy(Some(&default), Some(&headers(&[], &[])), &no_tokens()).unwrap_err();
        assert_eq!(
            error.to_string(),
            format!(r#"invalid set header "  K-Foo": [{HEADER_NAME_MSG}]"#)
        );

        let default = HeadersPolicy {
            set: btreemap! { "Host".to_string() => "elsewhere.com".to_string() },
            remove: BTreeSet::new(),
        };
        let error = headers_policy(Some(&default), None, &no_tokens()).unwrap_err();
        assert_eq!(
            error.to_string(),
            r#"rewriting "Host" header is not supported"#
        );
    }

    #[test]
    fn rate_limit_policy_empty_is_none() {
        assert_eq!(rate_limit_policy(None).unwrap(), None);
        assert_eq!(
            rate_limit_policy(Some(&api::RateLimitPolicy::default())).unwrap(),
            None
        );
    }

    #[test]
    fn local_rate_limit_token_bucket() {
        for (unit, interval) in [
            ("second", time::Duration::from_secs(1)),
            ("minute", time::Duration::from_secs(60)),
            ("hour", time::Duration::from_secs(3600)),
        ] {
            let policy = rate_limit_policy(Some(&api::RateLimitPolicy {
                local: Some(api::LocalRateLimitPolicy {
                    requests: 100,
                    unit: unit.to_string(),
                    burst: 20,
                    ..Default::default()
                }),
                global: None,
            }))
            .unwrap()
            .unwrap();
            let local = policy.local.unwrap();
            assert_eq!(local.max_tokens, 120, "{unit}");
            assert_eq!(local.tokens_per_fill, 100, "{unit}");
            assert_eq!(local.fill_interval, interval, "{unit}");
            assert_eq!(local.response_status_code, None);
        }
    }

    #[test]
    fn local_rate_limit_rejects_bad_inputs() {
        let error = rate_limit_policy(Some(&api::RateLimitPolicy {
            local: Some(api::LocalRateLimitPolicy {
                requests: 0,
                unit: "second".to_string(),
                ..Default::default()
            }),
            global: None,
        }))
        .unwrap_err();
        assert_eq!(
            error.to_string(),
            "invalid requests value 0 in local rate limit policy"
        );

        let error = rate_limit_policy(Some(&api::RateLimitPolicy {
            local: Some(api::LocalRateLimitPolicy {
                requests: 100,
                unit: "invalid-unit".to_string(),
                ..Default::default()
            }),
            global: None,
        }))
        .unwrap_err();
        assert_eq!(
            error.to_string(),
            r#"invalid unit "invalid-unit" in local rate limit policy"#
        );
    }

    #[test]
    fn local_rate_limit_response_overrides() {
        let policy = rate_limit_policy(Some(&api::RateLimitPolicy {
            local: Some(api::LocalRateLimitPolicy {
                requests: 10,
                unit: "second".to_string(),
                response_status_code: Some(431),
                response_headers_to_add: vec![api::HeaderValue {
                    name: "header-1".to_string(),
                    value: "header-value-1".to_string(),
                }],
                ..Default::default()
            }),
            global: None,
        }))
        .unwrap()
        .unwrap();
        let local = policy.local.unwrap();
        assert_eq!(local.response_status_code, Some(431));
        assert_eq!(
            local.response_headers_to_add,
            btreemap! { "Header-1".to_string() => "header-value-1".to_string() }
        );
    }

    #[test]
    fn local_rate_limit_response_header_errors() {
        let duplicated = api::LocalRateLimitPolicy {
            requests: 10,
            unit: "second".to_string(),
            response_headers_to_add: vec![
                api::HeaderValue {
                    name: "duplicate-header".to_string(),
                    value: "one".to_string(),
                },
                api::HeaderValue {
                    name: "Duplicate-Header".to_string(),
                    value: "two".to_string(),
                },
            ],
            ..Default::default()
        };
        let error = rate_limit_policy(Some(&api::RateLimitPolicy {
            local: Some(duplicated),
            global: None,
        }))
        .unwrap_err();
        assert_eq!(
            error.to_string(),
            r#"duplicate header addition: "Duplicate-Header""#
        );

        let invalid = api::LocalRateLimitPolicy {
            requests: 10,
            unit: "second".to_string(),
            response_headers_to_add: vec![api::HeaderValue {
                name: "invalid-header!".to_string(),
                value: "value".to_string(),
            }],
            ..Default::default()
        };
        let error = rate_limit_policy(Some(&api::RateLimitPolicy {
            local: Some(invalid),
            global: None,
        }))
        .unwrap_err();
        assert_eq!(
            error.to_string(),
            format!(r#"invalid header name "Invalid-Header!": [{HEADER_NAME_MSG}]"#)
        );
    }

    #[test]
    fn global_rate_limit_descriptors_preserve_order() {
        let policy = rate_limit_policy(Some(&api::RateLimitPolicy {
            local: None,
            global: Some(api::GlobalRateLimitPolicy {
                descriptors: vec![api::RateLimitDescriptor {
                    entries: vec![
                        api::RateLimitDescriptorEntry {
                            generic_key: Some(api::GenericKeyDescriptor {
                                key: None,
                                value: "my-value".to_string(),
                            }),
                            ..Default::default()
                        },
                        api::RateLimitDescriptorEntry {
                            remote_address: Some(api::RemoteAddressDescriptor {}),
                            ..Default::default()
                        },
                        api::RateLimitDescriptorEntry {
                            request_header: Some(api::RequestHeaderDescriptor {
                                header_name: "X-Header".to_string(),
                                descriptor_key: "my-key".to_string(),
                            }),
                            ..Default::default()
                        },
                        api::RateLimitDescriptorEntry {
                            request_header_value_match: Some(
                                api::RequestHeaderValueMatchDescriptor {
                                    headers: vec![api::HeaderMatchCondition {
                                        name: "X-Match".to_string(),
                                        present: Some(false),
                                        ..Default::default()
                                    }],
                                    expect_match: true,
                                    value: "matched".to_string(),
                                },
                            ),
                            ..Default::default()
                        },
                    ],
                }],
            }),
        }))
        .unwrap()
        .unwrap();

        let descriptors = policy.global.unwrap().descriptors;
        assert_eq!(descriptors.len(), 1);
        assert_eq!(
            descriptors[0].entries,
            vec![
                RateLimitDescriptorEntry::GenericKey {
                    key: None,
                    value: "my-value".to_string(),
                },
                RateLimitDescriptorEntry::RemoteAddress,
                RateLimitDescriptorEntry::RequestHeader {
                    header_name: "X-Header".to_string(),
                    descriptor_key: "my-key".to_string(),
                },
                RateLimitDescriptorEntry::HeaderValueMatch {
                    headers: vec![HeaderMatch {
                        name: "X-Match".to_string(),
                        kind: HeaderMatchKind::Present,
                        invert: true,
                    }],
                    expect_match: true,
                    value: "matched".to_string(),
                },
            ]
        );
    }

    #[test]
    fn global_rate_limit_rejects_ambiguous_entries() {
        for entry in [
            api::RateLimitDescriptorEntry::default(),
            api::RateLimitDescriptorEntry {
                generic_key: Some(api::GenericKeyDescriptor {
                    key: None,
                    value: "v".to_string(),
                }),
                remote_address: Some(api::RemoteAddressDescriptor {}),
                ..Default::default()
            },
        ] {
            let error = rate_limit_policy(Some(&api::RateLimitPolicy {
                local: None,
                global: Some(api::GlobalRateLimitPolicy {
                    descriptors: vec![api::RateLimitDescriptor {
                        entries: vec![entry],
                    }],
                }),
            }))
            .unwrap_err();
            assert_eq!(
                error.to_string(),
                "rate limit descriptor entry must have exactly one field set"
            );
        }
    }

    #[test]
    fn header_match_conditions_cover_all_matchers() {
        let conditions = vec![
            api::HeaderMatchCondition {
                name: "A".to_string(),
                present: Some(true),
                ..Default::default()
            },
            api::HeaderMatchCondition {
                name: "B".to_string(),
                contains: Some("abc".to_string()),
                ..Default::default()
            },
            api::HeaderMatchCondition {
                name: "C".to_string(),
                not_contains: Some("abc".to_string()),
                ..Default::default()
            },
            api::HeaderMatchCondition {
                name: "D".to_string(),
                exact: Some("abc".to_string()),
                ..Default::default()
            },
            api::HeaderMatchCondition {
                name: "E".to_string(),
                not_exact: Some("abc".to_string()),
                ..Default::default()
            },
        ];
        let matches = header_match_conditions(&conditions).unwrap();
        assert_eq!(
            matches,
            vec![
                HeaderMatch {
                    name: "A".to_string(),
                    kind: HeaderMatchKind::Present,
                    invert: false,
                },
                HeaderMatch {
                    name: "B".to_string(),
                    kind: HeaderMatchKind::Contains("abc".to_string()),
                    invert: false,
                },
                HeaderMatch {
                    name: "C".to_string(),
                    kind: HeaderMatchKind::Contains("abc".to_string()),
                    invert: true,
                },
                HeaderMatch {
                    name: "D".to_string(),
                    kind: HeaderMatchKind::Exact("abc".to_string()),
                    invert: false,
                },
                HeaderMatch {
                    name: "E".to_string(),
                    kind: HeaderMatchKind::Exact("abc".to_string()),
                    invert: true,
                },
            ]
        );
    }

    #[test]
    fn header_match_conditions_require_exactly_one_matcher() {
        let none = api::HeaderMatchCondition {
            name: "X-Foo".to_string(),
            ..Default::default()
        };
        assert!(header_match_conditions(&[none]).is_err());

        let both = api::HeaderMatchCondition {
            name: "X-Foo".to_string(),
            exact: Some("a".to_string()),
            contains: Some("b".to_string()),
            ..Default::default()
        };
        assert!(header_match_conditions(&[both]).is_err());
    }

    #[test]
    fn query_param_match_conditions_translate() {
        let conditions = vec![
            api::QueryParameterMatchCondition {
                name: "q".to_string(),
                exact: Some("abc".to_string()),
                present: None,
            },
            api::QueryParameterMatchCondition {
                name: "flag".to_string(),
                exact: None,
                present: Some(true),
            },
        ];
        let matches = query_param_match_conditions(&conditions).unwrap();
        assert_eq!(matches[0].kind, QueryParamMatchKind::Exact("abc".to_string()));
        assert_eq!(matches[1].kind, QueryParamMatchKind::Present);

        let invalid = api::QueryParameterMatchCondition {
            name: "q".to_string(),
            exact: None,
            present: Some(false),
        };
        assert!(query_param_match_conditions(&[invalid]).is_err());
    }

    #[test]
    fn canonicalization_matches_wire_casing() {
        assert_eq!(canonicalize_header_name("k-baz"), "K-Baz");
        assert_eq!(canonicalize_header_name("l5d-dst-override"), "L5d-Dst-Override");
        assert_eq!(canonicalize_header_name("invalid-header!"), "Invalid-Header!");
        // Bytes outside the token alphabet leave the name untouched.
        assert_eq!(canonicalize_header_name("  K-Foo"), "  K-Foo");
    }
}
