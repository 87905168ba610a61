//! Rate limit rendering: local token-bucket overrides delivered through
//! per-filter config, and descriptor actions for the global service.

use crate::wire::{
    Empty, GenericKeyAction, HeaderValueMatchAction, HeaderValueOption, HttpFilterConfig,
    HttpStatus, LocalRateLimit, ProtoDuration, RateLimit, RateLimitAction, RequestHeadersAction,
    RuntimeFractionalPercent, TokenBucket, LOCAL_RATE_LIMIT_TYPE_URL,
};
use trellis_controller_core::{
    GlobalRateLimitPolicy, LocalRateLimitPolicy, RateLimitDescriptorEntry,
};

/// Per-filter config key for local rate limit overrides. Must match the
/// name the filter was installed under in the connection manager.
pub const LOCAL_RATE_LIMIT_FILTER_NAME: &str = "local_ratelimit";

/// Renders the local rate limit override installed on a virtual host or
/// route through `typed_per_filter_config`.
pub fn local_rate_limit_config(
    policy: &LocalRateLimitPolicy,
    stat_prefix: &str,
) -> HttpFilterConfig {
    HttpFilterConfig::LocalRateLimit(Box::new(LocalRateLimit {
        type_url: LOCAL_RATE_LIMIT_TYPE_URL,
        stat_prefix: stat_prefix.to_string(),
        token_bucket: Some(TokenBucket {
            max_tokens: policy.max_tokens,
            tokens_per_fill: policy.tokens_per_fill,
            fill_interval: ProtoDuration(policy.fill_interval),
        }),
        status: policy
            .response_status_code
            .map(|code| HttpStatus { code }),
        response_headers_to_add: policy
            .response_headers_to_add
            .iter()
            .map(|(k, v)| HeaderValueOption::overwrite(k.clone(), v.clone()))
            .collect(),
        filter_enabled: Some(RuntimeFractionalPercent::always()),
        filter_enforced: Some(RuntimeFractionalPercent::always()),
    }))
}

/// Renders descriptor actions consulted by the global rate limit service.
/// Each descriptor becomes one rate limit with one action per entry.
pub fn global_rate_limits(policy: &GlobalRateLimitPolicy) -> Vec<RateLimit> {
    policy
        .descriptors
        .iter()
        .map(|descriptor| RateLimit {
            actions: descriptor.entries.iter().map(action).collect(),
        })
        .collect()
}

fn action(entry: &RateLimitDescriptorEntry) -> RateLimitAction {
    match entry {
        RateLimitDescriptorEntry::GenericKey { key, value } => RateLimitAction::GenericKey {
            generic_key: GenericKeyAction {
                descriptor_key: key.clone(),
                descriptor_value: value.clone(),
            },
        },
        RateLimitDescriptorEntry::RemoteAddress => RateLimitAction::RemoteAddress {
            remote_address: Empty {},
        },
        RateLimitDescriptorEntry::RequestHeader {
            header_name,
            descriptor_key,
        } => RateLimitAction::RequestHeaders {
            request_headers: RequestHeadersAction {
                header_name: header_name.clone(),
                descriptor_key: descriptor_key.clone(),
            },
        },
        RateLimitDescriptorEntry::HeaderValueMatch {
            headers,
            expect_match,
            value,
        } => RateLimitAction::HeaderValueMatch {
            header_value_match: HeaderValueMatchAction {
                descriptor_value: value.clone(),
                expect_match: *expect_match,
                headers: crate::route::header_matchers(headers),
            },
        },
    }
}
