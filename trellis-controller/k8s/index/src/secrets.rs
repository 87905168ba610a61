//! Validates TLS and CA secrets before they enter the graph.
//!
//! Validation is structural: the PEM must parse into at least one
//! certificate (or a supported private key), but chain and expiry checks are
//! left to the proxy and its clients.

use crate::index::SecretEntry;
use anyhow::{anyhow, bail, Result};
use trellis_controller_core::{dag, NamespacedName};
use trellis_controller_k8s_api as k8s;

/// Validates a serving-certificate secret and extracts its PEM data.
///
/// The secret must be of type `kubernetes.io/tls` and carry parseable
/// `tls.crt` and `tls.key` data. The error text becomes the condition
/// message on the object that referenced the secret.
pub(crate) fn tls_secret(name: &NamespacedName, entry: &SecretEntry) -> Result<dag::Secret> {
    if entry.secret_type.as_deref() != Some(k8s::SECRET_TYPE_TLS) {
        bail!("Secret type is not {:?}", k8s::SECRET_TYPE_TLS);
    }
    let cert = entry
        .data
        .get(k8s::SECRET_KEY_CERT)
        .filter(|data| !data.is_empty())
        .ok_or_else(|| anyhow!("secret is missing the {} key", k8s::SECRET_KEY_CERT))?;
    let key = entry
        .data
        .get(k8s::SECRET_KEY_PRIVATE_KEY)
        .filter(|data| !data.is_empty())
        .ok_or_else(|| anyhow!("secret is missing the {} key", k8s::SECRET_KEY_PRIVATE_KEY))?;

    validate_certificates(cert).map_err(|error| anyhow!("invalid TLS certificate: {error}"))?;
    validate_private_key(key).map_err(|error| anyhow!("invalid TLS private key: {error}"))?;

    Ok(dag::Secret {
        namespace: name.namespace.clone(),
        name: name.name.clone(),
        cert: cert.clone(),
        key: key.clone(),
    })
}

/// Validates a CA-bundle secret and returns the PEM bundle.
///
/// CA secrets may be of any type; only the `ca.crt` key matters.
pub(crate) fn ca_bundle(entry: &SecretEntry) -> Result<Vec<u8>> {
    let ca = entry
        .data
        .get(k8s::SECRET_KEY_CA)
        .filter(|data| !data.is_empty())
        .ok_or_else(|| anyhow!("secret is missing the {} key", k8s::SECRET_KEY_CA))?;
    validate_certificates(ca).map_err(|error| anyhow!("invalid CA certificate bundle: {error}"))?;
    Ok(ca.clone())
}

/// Requires at least one parseable certificate. Non-certificate PEM blocks
/// and surrounding free text are tolerated.
fn validate_certificates(pem: &[u8]) -> Result<()> {
    let mut reader: &[u8] = pem;
    let mut found = 0;
    for cert in rustls_pemfile::certs(&mut reader) {
        cert?;
        found += 1;
    }
    if found == 0 {
        bail!("no certificates found");
    }
    Ok(())
}

/// Requires a PKCS#1, PKCS#8, or SEC1 private key. Parameter blocks that
/// sometimes precede EC keys are skipped.
fn validate_private_key(pem: &[u8]) -> Result<()> {
    let mut reader: &[u8] = pem;
    match rustls_pemfile::private_key(&mut reader)? {
        Some(_) => Ok(()),
        None => bail!("no private key found"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::{CERTIFICATE, EC_CERTIFICATE, EC_PRIVATE_KEY, RSA_PRIVATE_KEY};

    fn entry(secret_type: Option<&str>, data: &[(&str, &[u8])]) -> SecretEntry {
        SecretEntry {
            secret_type: secret_type.map(|s| s.to_string()),
            data: data
                .iter()
                .map(|(key, value)| (key.to_string(), value.to_vec()))
                .collect(),
        }
    }

    fn tls_entry(cert: &[u8], key: &[u8]) -> SecretEntry {
        entry(
            Some(k8s::SECRET_TYPE_TLS),
            &[("tls.crt", cert), ("tls.key", key)],
        )
    }

    fn name() -> NamespacedName {
        NamespacedName::new("default", "serving-cert")
    }

    #[test]
    fn accepts_rsa_keypair() {
        let secret = tls_secret(
            &name(),
            &tls_entry(CERTIFICATE.as_bytes(), RSA_PRIVATE_KEY.as_bytes()),
        )
        .unwrap();
        assert_eq!(secret.namespace, "default");
        assert_eq!(secret.name, "serving-cert");
        assert_eq!(secret.cert, CERTIFICATE.as_bytes());
        assert_eq!(secret.key, RSA_PRIVATE_KEY.as_bytes());
    }

    #[test]
    fn accepts_ec_keypair_with_parameter_block() {
        tls_secret(
            &name(),
            &tls_entry(EC_CERTIFICATE.as_bytes(), EC_PRIVATE_KEY.as_bytes()),
        )
        .unwrap();
    }

    #[test]
    fn tolerates_text_around_pem_blocks() {
        let trailing = format!("{CERTIFICATE}\t\r\n");
        tls_secret(
            &name(),
            &tls_entry(trailing.as_bytes(), RSA_PRIVATE_KEY.as_bytes()),
        )
        .unwrap();

        let leading = format!("# serving certificate\n{CERTIFICATE}");
        tls_secret(
            &name(),
            &tls_entry(leading.as_bytes(), RSA_PRIVATE_KEY.as_bytes()),
        )
        .unwrap();
    }

    #[test]
    fn rejects_wrong_secret_type() {
        let wrong = entry(
            Some("Opaque"),
            &[
                ("tls.crt", CERTIFICATE.as_bytes()),
                ("tls.key", RSA_PRIVATE_KEY.as_bytes()),
            ],
        );
        let error = tls_secret(&name(), &wrong).unwrap_err();
        assert_eq!(error.to_string(), r#"Secret type is not "kubernetes.io/tls""#);

        let untyped = entry(
            None,
            &[
                ("tls.crt", CERTIFICATE.as_bytes()),
                ("tls.key", RSA_PRIVATE_KEY.as_bytes()),
            ],
        );
        let error = tls_secret(&name(), &untyped).unwrap_err();
        assert_eq!(error.to_string(), r#"Secret type is not "kubernetes.io/tls""#);
    }

    #[test]
    fn rejects_missing_or_empty_data_keys() {
        let missing_cert = entry(
            Some(k8s::SECRET_TYPE_TLS),
            &[("tls.key", RSA_PRIVATE_KEY.as_bytes())],
        );
        let error = tls_secret(&name(), &missing_cert).unwrap_err();
        assert_eq!(error.to_string(), "secret is missing the tls.crt key");

        let empty_cert = entry(
            Some(k8s::SECRET_TYPE_TLS),
            &[("tls.crt", b""), ("tls.key", RSA_PRIVATE_KEY.as_bytes())],
        );
        let error = tls_secret(&name(), &empty_cert).unwrap_err();
        assert_eq!(error.to_string(), "secret is missing the tls.crt key");

        let missing_key = entry(
            Some(k8s::SECRET_TYPE_TLS),
            &[("tls.crt", CERTIFICATE.as_bytes())],
        );
        let error = tls_secret(&name(), &missing_key).unwrap_err();
        assert_eq!(error.to_string(), "secret is missing the tls.key key");
    }

    #[test]
    fn rejects_unparseable_data() {
        let garbage_cert = tls_entry(b"not a certificate", RSA_PRIVATE_KEY.as_bytes());
        let error = tls_secret(&name(), &garbage_cert).unwrap_err();
        assert_eq!(
            error.to_string(),
            "invalid TLS certificate: no certificates found"
        );

        let garbage_key = tls_entry(CERTIFICATE.as_bytes(), b"not a key");
        let error = tls_secret(&name(), &garbage_key).unwrap_err();
        assert_eq!(
            error.to_string(),
            "invalid TLS private key: no private key found"
        );
    }

    #[test]
    fn ca_bundles_ignore_secret_type() {
        let bundle = ca_bundle(&entry(None, &[("ca.crt", CERTIFICATE.as_bytes())])).unwrap();
        assert_eq!(bundle, CERTIFICATE.as_bytes());

        let error = ca_bundle(&entry(None, &[])).unwrap_err();
        assert_eq!(error.to_string(), "secret is missing the ca.crt key");

        let error = ca_bundle(&entry(None, &[("ca.crt", b"")])).unwrap_err();
        assert_eq!(error.to_string(), "secret is missing the ca.crt key");

        let error = ca_bundle(&entry(None, &[("ca.crt", b"junk")])).unwrap_err();
        assert_eq!(
            error.to_string(),
            "invalid CA certificate bundle: no certificates found"
        );
    }
}
