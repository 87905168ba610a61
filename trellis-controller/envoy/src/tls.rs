//! Downstream and upstream TLS context rendering.
//!
//! Certificates are delivered over SDS by name; only CA bundles are
//! inlined, since they come straight from indexed secrets.

use crate::wire::{
    CertificateValidationContext, CommonTlsContext, ConfigSource, DataSource,
    DownstreamTlsContext, SdsSecretConfig, StringMatcher, SubjectAltNameMatcher, TlsParameters,
    TransportSocket, TransportSocketConfig, UpstreamTlsContext, DOWNSTREAM_TLS_TYPE_URL,
    UPSTREAM_TLS_TYPE_URL,
};
use crate::MANAGEMENT_CLUSTER_NAME;
use trellis_controller_core::{PeerValidationContext, Secret, TlsVersion};

const TRANSPORT_SOCKET_TLS: &str = "envoy.transport_sockets.tls";

fn version_str(v: TlsVersion) -> &'static str {
    match v {
        TlsVersion::V1_2 => "TLSv1_2",
        TlsVersion::V1_3 => "TLSv1_3",
    }
}

pub fn downstream_transport_socket(
    secret: &Secret,
    min_version: TlsVersion,
    cipher_suites: &[String],
    peer_validation: Option<&PeerValidationContext>,
    alpn_protocols: &[&str],
) -> TransportSocket {
    TransportSocket {
        name: TRANSPORT_SOCKET_TLS,
        typed_config: TransportSocketConfig::Downstream(Box::new(downstream_tls_context(
            secret,
            min_version,
            cipher_suites,
            peer_validation,
            alpn_protocols,
        ))),
    }
}

/// TLS termination settings for a filter chain.
///
/// Client certificate verification never pins subject names: subject
/// matching is an upstream-only concern, so any configured subject name
/// is dropped here.
pub fn downstream_tls_context(
    secret: &Secret,
    min_version: TlsVersion,
    cipher_suites: &[String],
    peer_validation: Option<&PeerValidationContext>,
    alpn_protocols: &[&str],
) -> DownstreamTlsContext {
    let validation_context = peer_validation.map(|peer| {
        let trusted_ca = (!peer.ca.is_empty()).then(|| DataSource::inline(&peer.ca));
        if peer.skip_client_cert_validation {
            CertificateValidationContext {
                trusted_ca,
                match_typed_subject_alt_names: None,
                trust_chain_verification: Some("ACCEPT_UNTRUSTED"),
            }
        } else {
            CertificateValidationContext {
                trusted_ca,
                match_typed_subject_alt_names: None,
                trust_chain_verification: None,
            }
        }
    });

    DownstreamTlsContext {
        type_url: DOWNSTREAM_TLS_TYPE_URL,
        common_tls_context: CommonTlsContext {
            tls_params: Some(TlsParameters {
                tls_minimum_protocol_version: version_str(min_version),
                tls_maximum_protocol_version: version_str(TlsVersion::V1_3),
                cipher_suites: cipher_suites.to_vec(),
            }),
            tls_certificate_sds_secret_configs: vec![SdsSecretConfig {
                name: secret.name(),
                sds_config: ConfigSource::management(MANAGEMENT_CLUSTER_NAME),
            }],
            alpn_protocols: alpn_protocols.iter().map(|p| p.to_string()).collect(),
            validation_context,
        },
        // The client must present a certificate whenever any validation
        // is configured, even the skip-verification kind.
        require_client_certificate: peer_validation.is_some(),
    }
}

pub fn upstream_transport_socket(
    validation: Option<&PeerValidationContext>,
    sni: Option<&str>,
    alpn_protocols: &[&str],
) -> TransportSocket {
    TransportSocket {
        name: TRANSPORT_SOCKET_TLS,
        typed_config: TransportSocketConfig::Upstream(Box::new(upstream_tls_context(
            validation,
            sni,
            alpn_protocols,
        ))),
    }
}

/// TLS origination settings for an upstream cluster, pinning the peer
/// subject name when one is configured.
pub fn upstream_tls_context(
    validation: Option<&PeerValidationContext>,
    sni: Option<&str>,
    alpn_protocols: &[&str],
) -> UpstreamTlsContext {
    let validation_context = validation.map(|v| CertificateValidationContext {
        trusted_ca: (!v.ca.is_empty()).then(|| DataSource::inline(&v.ca)),
        match_typed_subject_alt_names: v.subject_name.as_ref().map(|subject| {
            vec![SubjectAltNameMatcher {
                san_type: "DNS",
                matcher: StringMatcher {
                    exact: subject.clone(),
                },
            }]
        }),
        trust_chain_verification: None,
    });

    UpstreamTlsContext {
        type_url: UPSTREAM_TLS_TYPE_URL,
        common_tls_context: CommonTlsContext {
            tls_params: None,
            tls_certificate_sds_secret_configs: vec![],
            alpn_protocols: alpn_protocols.iter().map(|p| p.to_string()).collect(),
            validation_context,
        },
        sni: sni.map(|s| s.to_string()),
    }
}
