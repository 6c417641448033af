use std::sync::Arc;

use rustls::{
	ClientConfig, DigitallySignedStruct, SignatureScheme,
	client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
	crypto::CryptoProvider,
	pki_types::{CertificateDer, ServerName, UnixTime},
};
use rustls_platform_verifier::BuilderVerifierExt;
use snafu::Snafu;

/// Outer stream wrapper selection for dialed connections. Decided at
/// construction; nothing above the stream layer branches on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsMode {
	#[default]
	Off,
	Verified,
	/// TLS without certificate verification; opt-in only.
	Insecure,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum TlsError {
	#[snafu(display("failed to build tls configuration"))]
	Config {
		source: rustls::Error,
	},
}

pub fn tls_config(mode: TlsMode) -> Result<ClientConfig, TlsError> {
	let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
	let builder = ClientConfig::builder_with_provider(provider.clone())
		.with_protocol_versions(&[&rustls::version::TLS13])
		.map_err(|source| TlsError::Config { source })?;
	let config = match mode {
		TlsMode::Insecure => builder
			.dangerous()
			.with_custom_certificate_verifier(Arc::new(SkipVerification { provider }))
			.with_no_client_auth(),
		_ => builder
			.with_platform_verifier()
			.map_err(|source| TlsError::Config { source })?
			.with_no_client_auth(),
	};
	Ok(config)
}

/// Accepts any certificate; signatures are still checked against the
/// provider's algorithms so the handshake stays well-formed.
#[derive(Debug)]
struct SkipVerification {
	provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for SkipVerification {
	fn verify_server_cert(
		&self,
		_end_entity: &CertificateDer<'_>,
		_intermediates: &[CertificateDer<'_>],
		_server_name: &ServerName<'_>,
		_ocsp_response: &[u8],
		_now: UnixTime,
	) -> Result<ServerCertVerified, rustls::Error> {
		Ok(ServerCertVerified::assertion())
	}

	fn verify_tls12_signature(
		&self,
		message: &[u8],
		cert: &CertificateDer<'_>,
		dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		rustls::crypto::verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
	}

	fn verify_tls13_signature(
		&self,
		message: &[u8],
		cert: &CertificateDer<'_>,
		dss: &DigitallySignedStruct,
	) -> Result<HandshakeSignatureValid, rustls::Error> {
		rustls::crypto::verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
	}

	fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
		self.provider.signature_verification_algorithms.supported_schemes()
	}
}
