// SPDX-License-Identifier: MPL-2.0

//! rustls client configuration driven by a [`TlsTrustPolicy`]
//!
//! Certificates are verified against the platform roots. Each policy flag
//! tolerates one class of verification failure. The server name is still
//! checked against the end-entity certificate whenever a failure is tolerated.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme,
};
use tracing::{debug, warn};

use super::TransportError;
use crate::mqtt_listener::opts::TlsTrustPolicy;

/// Returns true if `policy` accepts a certificate failing with `error`.
pub fn tolerates(policy: &TlsTrustPolicy, error: &CertificateError) -> bool {
    match error {
        CertificateError::UnknownIssuer => policy.allow_untrusted || policy.ignore_chain_errors,
        CertificateError::Expired
        | CertificateError::NotValidYet
        | CertificateError::BadSignature
        | CertificateError::UnhandledCriticalExtension => policy.ignore_chain_errors,
        CertificateError::Revoked | CertificateError::UnknownRevocationStatus => {
            policy.ignore_revocation_errors
        }
        _ => false,
    }
}

/// Build the client configuration for a TLS or `wss://` connection.
pub fn client_config(policy: &TlsTrustPolicy) -> Result<Arc<ClientConfig>, TransportError> {
    let roots = native_roots(policy)?;

    if !policy.is_relaxed() {
        let config = ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        return Ok(Arc::new(config));
    }

    warn!(?policy, "Certificate verification relaxed");
    let inner = if roots.is_empty() {
        None
    } else {
        Some(
            WebPkiServerVerifier::builder(Arc::new(roots))
                .build()
                .map_err(|e| TransportError::Tls(format!("failed to build verifier: {}", e)))?,
        )
    };
    let verifier = PolicyVerifier {
        inner,
        policy: *policy,
        algorithms: rustls::crypto::ring::default_provider().signature_verification_algorithms,
    };

    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth();
    Ok(Arc::new(config))
}

fn native_roots(policy: &TlsTrustPolicy) -> Result<RootCertStore, TransportError> {
    let mut roots = RootCertStore::empty();
    match rustls_native_certs::load_native_certs() {
        Ok(certs) => {
            let (added, ignored) = roots.add_parsable_certificates(certs);
            debug!(added, ignored, "Loaded platform root certificates");
        }
        Err(e) if policy.allow_untrusted => {
            warn!(error = %e, "Failed to load platform root certificates");
        }
        Err(e) => {
            return Err(TransportError::Tls(format!(
                "failed to load platform root certs: {}",
                e
            )))
        }
    }

    if roots.is_empty() && !policy.allow_untrusted {
        return Err(TransportError::Tls(
            "no platform root certificates available".to_string(),
        ));
    }
    Ok(roots)
}

/// Verifies with webpki, then forgives the failures the policy allows.
#[derive(Debug)]
struct PolicyVerifier {
    /// Absent when no roots could be loaded; every issuer is then unknown.
    inner: Option<Arc<WebPkiServerVerifier>>,
    policy: TlsTrustPolicy,
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for PolicyVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let error = match &self.inner {
            Some(inner) => {
                match inner.verify_server_cert(
                    end_entity,
                    intermediates,
                    server_name,
                    ocsp_response,
                    now,
                ) {
                    Ok(verified) => return Ok(verified),
                    Err(e) => e,
                }
            }
            None => rustls::Error::InvalidCertificate(CertificateError::UnknownIssuer),
        };

        match &error {
            rustls::Error::InvalidCertificate(cert_error)
                if tolerates(&self.policy, cert_error) =>
            {
                let cert = rustls::server::ParsedCertificate::try_from(end_entity)?;
                rustls::client::verify_server_name(&cert, server_name)?;
                warn!(
                    error = ?cert_error,
                    "Accepting broker certificate despite verification failure"
                );
                Ok(ServerCertVerified::assertion())
            }
            _ => Err(error),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}
