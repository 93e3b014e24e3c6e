use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::DigitallySignedStruct;
use serde::{Deserialize, Serialize};

/// Client configuration, explicitly constructed by `main` and passed down.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub api: ApiConfig,
    pub cluster: ClusterConfig,
    pub defaults: DefaultsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub url: String,
    pub token: Option<String>,
}

/// TLS parameters for talking to runtime endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub tls: bool,
    pub ca_certificate: Option<PathBuf>,
    pub insecure_skip_verify: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    pub instance: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            api: ApiConfig {
                url: "https://api.remux.dev".to_string(),
                token: None,
            },
            cluster: ClusterConfig {
                tls: false,
                ca_certificate: None,
                insecure_skip_verify: false,
            },
            defaults: DefaultsConfig { instance: None },
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        if let Some(config_dir) = directories::ProjectDirs::from("dev", "remux", "remux") {
            let config_file = config_dir.config_dir().join("config.toml");
            if config_file.exists() {
                return Self::load_from(&config_file);
            }
        }
        Ok(Config::default())
    }

    fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn save(&self) -> Result<()> {
        if let Some(config_dir) = directories::ProjectDirs::from("dev", "remux", "remux") {
            self.save_to(&config_dir.config_dir().join("config.toml"))?;
        }
        Ok(())
    }

    fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Ready-made transport parameters for a session; the session itself
    /// never constructs TLS state.
    pub fn transport(&self) -> Result<TransportConfig> {
        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(30));
        if let Some(path) = &self.cluster.ca_certificate {
            let pem = std::fs::read(path)
                .with_context(|| format!("reading CA certificate {}", path.display()))?;
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
        }
        if self.cluster.insecure_skip_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }
        let tls_config = if self.cluster.tls {
            Some(self.cluster.websocket_tls()?)
        } else {
            None
        };
        Ok(TransportConfig {
            http: builder.build()?,
            tls: self.cluster.tls,
            tls_config,
        })
    }
}

impl ClusterConfig {
    /// rustls client config for the websocket dial, honoring the same CA
    /// bundle and skip-verify knobs as the HTTP client.
    fn websocket_tls(&self) -> Result<Arc<rustls::ClientConfig>> {
        let builder = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()?;

        let config = if self.insecure_skip_verify {
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
                .with_no_client_auth()
        } else {
            let mut roots = rustls::RootCertStore::empty();
            for cert in rustls_native_certs::load_native_certs()
                .context("loading system root certificates")?
            {
                // Platform roots rustls cannot parse are skipped.
                let _ = roots.add(cert);
            }
            if let Some(path) = &self.ca_certificate {
                let pem = std::fs::read(path)
                    .with_context(|| format!("reading CA certificate {}", path.display()))?;
                for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
                    roots.add(cert?)?;
                }
            }
            builder.with_root_certificates(roots).with_no_client_auth()
        };
        Ok(Arc::new(config))
    }
}

/// Connection parameters handed to an attach session.
#[derive(Clone)]
pub struct TransportConfig {
    pub http: reqwest::Client,
    /// Whether runtime endpoints speak TLS (wss/https vs ws/http).
    pub tls: bool,
    /// TLS parameters for the websocket dial; `None` dials by URL scheme
    /// with default roots.
    pub tls_config: Option<Arc<rustls::ClientConfig>>,
}

impl TransportConfig {
    /// Plain transport with default HTTP client settings.
    pub fn insecure() -> Self {
        TransportConfig {
            http: reqwest::Client::new(),
            tls: false,
            tls_config: None,
        }
    }
}

/// Accepts every server certificate. Only reachable through
/// `insecure_skip_verify`.
#[derive(Debug)]
struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
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
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_roundtrips_through_toml() {
        let config = Config::default();
        let serialized = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&serialized).unwrap();
        assert_eq!(parsed.api.url, config.api.url);
        assert!(!parsed.cluster.tls);
        assert!(parsed.defaults.instance.is_none());
    }

    #[test]
    fn config_persists_to_disk() {
        let dir = std::env::temp_dir().join(format!("remux-config-{}", std::process::id()));
        let path = dir.join("config.toml");
        let mut config = Config::default();
        config.defaults.instance = Some("staging".to_string());
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.defaults.instance.as_deref(), Some("staging"));
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn plain_transport_carries_no_websocket_tls() {
        let transport = Config::default().transport().unwrap();
        assert!(!transport.tls);
        assert!(transport.tls_config.is_none());
    }

    #[test]
    fn tls_transport_builds_a_websocket_tls_config() {
        let mut config = Config::default();
        config.cluster.tls = true;
        config.cluster.insecure_skip_verify = true;
        let transport = config.transport().unwrap();
        assert!(transport.tls);
        assert!(transport.tls_config.is_some());
    }

    #[test]
    fn missing_ca_certificate_is_an_error() {
        let mut config = Config::default();
        config.cluster.tls = true;
        config.cluster.ca_certificate = Some(PathBuf::from("/nonexistent/ca.pem"));
        assert!(config.transport().is_err());
    }

    #[test]
    fn skip_verify_accepts_any_certificate() {
        let verifier = AcceptAnyCert;
        let cert = CertificateDer::from(vec![0u8; 8]);
        let name = ServerName::try_from("endpoint.invalid").unwrap();
        let result = verifier.verify_server_cert(&cert, &[], &name, &[], UnixTime::now());
        assert!(result.is_ok());
    }
}
