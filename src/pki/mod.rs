//! Certificate lifecycle validation for TLS clusters
//!
//! The chart's self-signer stores each certificate in a Secret together with
//! two annotations recording its validity window. A rotation is only complete
//! when the PEM in `tls.crt`, the annotations and the CA bundle all agree.
//!
//! # Checks
//!
//! For the node secret and then the client secret:
//! - `tls.crt` must hold a PEM block with a well-formed X.509 certificate
//! - `certificate-valid-from`/`certificate-valid-upto` must match the
//!   certificate's NotBefore/NotAfter as RFC3339 UTC seconds
//! - the certificate must chain to a CA in the trusted bundle and be inside
//!   its validity window
//!
//! The CA certificate's own annotations are checked unless the CA is external.

mod issuer;

pub use issuer::{CertificateIssuer, ScriptCertificateIssuer};
#[cfg(test)]
pub use issuer::MockCertificateIssuer;

use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::core::v1::Secret;
use tracing::{debug, info};
use x509_parser::prelude::*;

use crate::context::RunContext;
use crate::{Error, Result};

/// Annotation carrying the certificate's NotBefore
pub const ANNOTATION_VALID_FROM: &str = "certificate-valid-from";
/// Annotation carrying the certificate's NotAfter
pub const ANNOTATION_VALID_UPTO: &str = "certificate-valid-upto";

/// Secret key of the leaf certificate
pub const TLS_CERT_KEY: &str = "tls.crt";
/// Secret key of the leaf private key
pub const TLS_KEY_KEY: &str = "tls.key";
/// Secret key of the CA bundle
pub const CA_CERT_KEY: &str = "ca.crt";

/// Certificate material read from a Kubernetes Secret.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CertificateSecret {
    /// Secret name
    pub name: String,
    /// Decoded data entries
    pub data: BTreeMap<String, Vec<u8>>,
    /// Secret annotations
    pub annotations: BTreeMap<String, String>,
}

impl CertificateSecret {
    /// Build from a Secret, merging `stringData` over `data`
    pub fn from_secret(secret: &Secret) -> Self {
        let mut data: BTreeMap<String, Vec<u8>> = secret
            .data
            .iter()
            .flatten()
            .map(|(k, v)| (k.clone(), v.0.clone()))
            .collect();
        for (k, v) in secret.string_data.iter().flatten() {
            data.insert(k.clone(), v.as_bytes().to_vec());
        }
        Self {
            name: secret.metadata.name.clone().unwrap_or_default(),
            data,
            annotations: secret.metadata.annotations.clone().unwrap_or_default(),
        }
    }

    /// Raw bytes of `field`, or a decode error naming the secret
    pub fn field(&self, field: &str) -> Result<&[u8]> {
        self.data
            .get(field)
            .map(Vec::as_slice)
            .ok_or_else(|| Error::CertificateDecode {
                secret: self.name.clone(),
                field: field.to_string(),
            })
    }

    fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }
}

/// What was checked for a single certificate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertificateSummary {
    /// Secret the certificate came from
    pub secret: String,
    /// Subject DN
    pub subject: String,
    /// Issuer DN
    pub issuer: String,
    /// Start of validity
    pub not_before: DateTime<Utc>,
    /// End of validity
    pub not_after: DateTime<Utc>,
}

/// Outcome of a successful validation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidatedCertificates {
    /// Node certificate
    pub node: CertificateSummary,
    /// Client certificate
    pub client: CertificateSummary,
    /// CA certificate, None when its annotations were not checked
    pub ca: Option<CertificateSummary>,
}

/// Decode the first PEM block of `bytes` to DER.
pub fn decode_first_pem(secret: &str, field: &str, bytes: &[u8]) -> Result<Vec<u8>> {
    ::pem::parse_many(bytes)
        .ok()
        .and_then(|blocks| blocks.into_iter().next())
        .map(|block| block.contents().to_vec())
        .ok_or_else(|| Error::CertificateDecode {
            secret: secret.to_string(),
            field: field.to_string(),
        })
}

/// Decode every CERTIFICATE block of a bundle to DER.
pub fn decode_bundle(secret: &str, field: &str, bytes: &[u8]) -> Result<Vec<Vec<u8>>> {
    let blocks: Vec<Vec<u8>> = ::pem::parse_many(bytes)
        .map_err(|_| Error::CertificateDecode {
            secret: secret.to_string(),
            field: field.to_string(),
        })?
        .into_iter()
        .filter(|block| block.tag() == "CERTIFICATE")
        .map(|block| block.contents().to_vec())
        .collect();
    if blocks.is_empty() {
        return Err(Error::CertificateDecode {
            secret: secret.to_string(),
            field: field.to_string(),
        });
    }
    Ok(blocks)
}

/// Format a certificate timestamp the way the self-signer annotates it
pub fn format_rfc3339(timestamp: i64) -> Option<String> {
    DateTime::<Utc>::from_timestamp(timestamp, 0)
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Secs, true))
}

fn parse_der<'a>(secret: &str, field: &str, der: &'a [u8]) -> Result<X509Certificate<'a>> {
    X509Certificate::from_der(der)
        .map(|(_, cert)| cert)
        .map_err(|e| Error::CertificateParse {
            secret: secret.to_string(),
            field: field.to_string(),
            message: e.to_string(),
        })
}

fn timestamp(secret: &str, field: &str, ts: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(ts, 0).ok_or_else(|| Error::CertificateParse {
        secret: secret.to_string(),
        field: field.to_string(),
        message: format!("validity timestamp {} out of range", ts),
    })
}

fn summarize(secret: &str, field: &str, cert: &X509Certificate<'_>) -> Result<CertificateSummary> {
    let validity = cert.validity();
    Ok(CertificateSummary {
        secret: secret.to_string(),
        subject: cert.subject().to_string(),
        issuer: cert.issuer().to_string(),
        not_before: timestamp(secret, field, validity.not_before.timestamp())?,
        not_after: timestamp(secret, field, validity.not_after.timestamp())?,
    })
}

/// Check both validity annotations of `secret` against `summary`.
fn check_annotations(secret: &CertificateSecret, summary: &CertificateSummary) -> Result<()> {
    let expected = [
        (ANNOTATION_VALID_FROM, summary.not_before),
        (ANNOTATION_VALID_UPTO, summary.not_after),
    ];
    for (annotation, at) in expected {
        let expected = at.to_rfc3339_opts(SecondsFormat::Secs, true);
        let actual = secret.annotation(annotation);
        if actual != Some(expected.as_str()) {
            return Err(Error::AnnotationMismatch {
                secret: secret.name.clone(),
                annotation: annotation.to_string(),
                expected,
                actual: actual.map(str::to_string),
            });
        }
    }
    Ok(())
}

/// Verify `cert` against every CA in `bundle` until one accepts it.
pub fn verify_chain(
    secret: &str,
    cert: &X509Certificate<'_>,
    bundle: &[Vec<u8>],
    now: DateTime<Utc>,
) -> Result<()> {
    let mut reason = "CA bundle is empty".to_string();
    let mut trusted = false;

    for der in bundle {
        let ca = match X509Certificate::from_der(der) {
            Ok((_, ca)) => ca,
            Err(e) => {
                reason = format!("unparseable CA certificate: {}", e);
                continue;
            }
        };
        if !ca.is_ca() {
            reason = format!("{} is not a CA certificate", ca.subject());
            continue;
        }
        if ca.subject().as_raw() != cert.issuer().as_raw() {
            reason = format!(
                "issuer {} does not match CA subject {}",
                cert.issuer(),
                ca.subject()
            );
            continue;
        }
        if cert.verify_signature(Some(ca.public_key())).is_err() {
            reason = format!("signature does not verify against {}", ca.subject());
            continue;
        }
        trusted = true;
        break;
    }

    if !trusted {
        return Err(Error::ChainVerification {
            secret: secret.to_string(),
            message: reason,
        });
    }

    let now = now.timestamp();
    let validity = cert.validity();
    if now < validity.not_before.timestamp() {
        return Err(Error::ChainVerification {
            secret: secret.to_string(),
            message: "certificate not yet valid".to_string(),
        });
    }
    if now > validity.not_after.timestamp() {
        return Err(Error::ChainVerification {
            secret: secret.to_string(),
            message: "certificate expired".to_string(),
        });
    }
    Ok(())
}

/// Validate the leaf certificate of `secret` against `bundle`.
pub fn validate_leaf(
    secret: &CertificateSecret,
    bundle: &[Vec<u8>],
    now: DateTime<Utc>,
) -> Result<CertificateSummary> {
    let der = decode_first_pem(&secret.name, TLS_CERT_KEY, secret.field(TLS_CERT_KEY)?)?;
    let cert = parse_der(&secret.name, TLS_CERT_KEY, &der)?;
    let summary = summarize(&secret.name, TLS_CERT_KEY, &cert)?;
    check_annotations(secret, &summary)?;
    verify_chain(&secret.name, &cert, bundle, now)?;
    debug!(secret = %secret.name, subject = %summary.subject, "Certificate valid");
    Ok(summary)
}

/// Checks that certificate secrets are consistent after issuance or rotation.
pub struct CertificateLifecycleValidator<'a> {
    ctx: &'a RunContext,
}

impl<'a> CertificateLifecycleValidator<'a> {
    /// Create a validator for the context's cluster
    pub fn new(ctx: &'a RunContext) -> Self {
        Self { ctx }
    }

    /// Validate at the current time
    pub async fn validate(&self) -> Result<ValidatedCertificates> {
        self.validate_at(Utc::now()).await
    }

    /// Validate as if the current time were `now`
    pub async fn validate_at(&self, now: DateTime<Utc>) -> Result<ValidatedCertificates> {
        let descriptor = &self.ctx.descriptor;
        if !descriptor.is_secure() {
            return Err(Error::validation_for(
                &descriptor.statefulset_name,
                "cluster has no CA secret configured",
            ));
        }

        let node = self.load(&descriptor.node_secret).await?;
        let client = self.load(&descriptor.client_secret).await?;
        let ca = self.load(&descriptor.ca_secret).await?;

        let (bundle_secret, bundle_bytes) = match ca.data.get(CA_CERT_KEY) {
            Some(bytes) => (&ca, bytes.as_slice()),
            None => (&node, node.field(CA_CERT_KEY)?),
        };
        // Both leaves chain to the same trust anchor. The node's own ca.crt is
        // only consulted when the CA secret carries none.
        let ca_bundle = decode_bundle(&bundle_secret.name, CA_CERT_KEY, bundle_bytes)?;

        let node_summary = validate_leaf(&node, &ca_bundle, now)?;
        let client_summary = validate_leaf(&client, &ca_bundle, now)?;

        let ca_summary = if descriptor.ca_is_external {
            debug!(secret = %ca.name, "CA is external, skipping CA annotation check");
            None
        } else {
            let der = decode_first_pem(&bundle_secret.name, CA_CERT_KEY, bundle_bytes)?;
            let cert = parse_der(&bundle_secret.name, CA_CERT_KEY, &der)?;
            let summary = summarize(&ca.name, CA_CERT_KEY, &cert)?;
            check_annotations(&ca, &summary)?;
            Some(summary)
        };

        info!(
            node = %node.name,
            client = %client.name,
            node_valid_until = %node_summary.not_after,
            client_valid_until = %client_summary.not_after,
            "Certificates validated"
        );
        Ok(ValidatedCertificates {
            node: node_summary,
            client: client_summary,
            ca: ca_summary,
        })
    }

    async fn load(&self, name: &str) -> Result<CertificateSecret> {
        let secret = self
            .ctx
            .cluster
            .get_secret(self.ctx.namespace(), name)
            .await?
            .ok_or_else(|| Error::validation_for(name, "secret not found"))?;
        Ok(CertificateSecret::from_secret(&secret))
    }
}

/// Validate the node, client and CA certificates of the run's cluster.
pub async fn validate_certificates(ctx: &RunContext) -> Result<ValidatedCertificates> {
    CertificateLifecycleValidator::new(ctx).validate().await
}

#[cfg(test)]
pub(crate) mod testing {
    //! rcgen-backed certificate fixtures

    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::Secret;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use k8s_openapi::ByteString;
    use rcgen::{
        BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue, IsCa, Issuer,
        KeyPair, KeyUsagePurpose,
    };

    use super::*;

    pub(crate) const NOT_BEFORE: &str = "2024-01-01T00:00:00Z";
    pub(crate) const CA_NOT_AFTER: &str = "2034-01-01T00:00:00Z";
    pub(crate) const LEAF_NOT_AFTER: &str = "2030-01-01T00:00:00Z";

    pub(crate) struct TestCa {
        pub(crate) cert_pem: String,
        key: KeyPair,
    }

    impl TestCa {
        pub(crate) fn new(common_name: &str) -> Self {
            let mut params = CertificateParams::default();
            let mut dn = DistinguishedName::new();
            dn.push(
                DnType::CommonName,
                DnValue::Utf8String(common_name.to_string()),
            );
            dn.push(
                DnType::OrganizationName,
                DnValue::Utf8String("Cockroach".to_string()),
            );
            params.distinguished_name = dn;
            params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
            params.key_usages = vec![
                KeyUsagePurpose::KeyCertSign,
                KeyUsagePurpose::CrlSign,
                KeyUsagePurpose::DigitalSignature,
            ];
            params.not_before = rcgen::date_time_ymd(2024, 1, 1);
            params.not_after = rcgen::date_time_ymd(2034, 1, 1);

            let key = KeyPair::generate().unwrap();
            let cert = params.self_signed(&key).unwrap();
            Self {
                cert_pem: cert.pem(),
                key,
            }
        }

        /// Leaf certificate PEM and its private key PEM
        pub(crate) fn issue(&self, common_name: &str) -> (String, String) {
            let mut params = CertificateParams::new(vec![common_name.to_string()]).unwrap();
            let mut dn = DistinguishedName::new();
            dn.push(
                DnType::CommonName,
                DnValue::Utf8String(common_name.to_string()),
            );
            params.distinguished_name = dn;
            params.is_ca = IsCa::NoCa;
            params.not_before = rcgen::date_time_ymd(2024, 1, 1);
            params.not_after = rcgen::date_time_ymd(2030, 1, 1);

            let key = KeyPair::generate().unwrap();
            let issuer = Issuer::from_ca_cert_pem(&self.cert_pem, &self.key).unwrap();
            let cert = params.signed_by(&key, &issuer).unwrap();
            (cert.pem(), key.serialize_pem())
        }
    }

    pub(crate) fn validity_annotations(from: &str, upto: &str) -> BTreeMap<String, String> {
        BTreeMap::from([
            (ANNOTATION_VALID_FROM.to_string(), from.to_string()),
            (ANNOTATION_VALID_UPTO.to_string(), upto.to_string()),
        ])
    }

    pub(crate) fn secret(
        name: &str,
        entries: &[(&str, &str)],
        annotations: BTreeMap<String, String>,
    ) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                annotations: Some(annotations),
                ..Default::default()
            },
            data: Some(
                entries
                    .iter()
                    .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
                    .collect(),
            ),
            ..Default::default()
        }
    }
}
