//! Configuration sections and loading.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::info;
use warden_audit::Ledger;
use warden_broker::ServerSpec;
use warden_cert::{CertificateSigner, CertificateVerifier};
use warden_crypto::{KeyPair, PublicKey};
use warden_policy::GatewayPolicy;

use crate::error::{ConfigError, ConfigResult};

/// Runtime-proxy settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxySection {
    /// Address the proxy listens on.
    pub listen_addr: String,
    /// WebSocket URL of the upstream agent runtime.
    pub upstream_url: String,
    /// Credential substituted into forwarded `connect` requests.
    pub upstream_token: Option<String>,
    /// Whether every session must present a capability certificate.
    pub require_cc: bool,
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8800".to_string(),
            upstream_url: "ws://localhost:18789".to_string(),
            upstream_token: None,
            require_cc: false,
        }
    }
}

/// Capability-certificate settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CertSection {
    /// Whether certificate verification is wired in at all.
    pub enabled: bool,
    /// Expected issuer; tokens from anyone else are rejected.
    pub issuer: Option<String>,
    /// Path to the authority public key (32 raw bytes).
    pub public_key_path: Option<PathBuf>,
    /// The authority public key as hex (alternative to the path).
    pub public_key_hex: Option<String>,
    /// Path to the authority signing seed. Set only on the gateway
    /// that mints tokens; the seed is created on first start.
    pub signing_key_path: Option<PathBuf>,
    /// Structure-only validation for development. Refused whenever a
    /// persistent ledger is configured.
    pub dev_mode: bool,
}

/// Audit-ledger settings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LedgerSection {
    /// SQLite path; `None` keeps the ledger in memory.
    pub path: Option<PathBuf>,
}

/// Agent-registry settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegistrySection {
    /// SQLite path; `None` keeps the registry in memory.
    pub path: Option<PathBuf>,
    /// Full URL of the runtime's spawn endpoint.
    pub spawn_url: String,
    /// Bearer credential for the runtime.
    pub runtime_token: Option<String>,
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            path: None,
            spawn_url: "http://localhost:18789/api/v1/sessions/spawn".to_string(),
            runtime_token: None,
        }
    }
}

/// One upstream tool server and its policy.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySection {
    /// Gateway id.
    pub id: String,
    /// Executable of the tool server.
    pub command: String,
    /// Arguments.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment overrides; `${VAR}` expands from the process
    /// environment at load time.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Whether to connect at startup.
    #[serde(default = "default_true")]
    pub auto_connect: bool,
    /// The governance policy for this upstream.
    #[serde(default)]
    pub policy: GatewayPolicy,
}

fn default_true() -> bool {
    true
}

impl GatewaySection {
    /// The spawn spec for this gateway's tool server.
    #[must_use]
    pub fn server_spec(&self) -> ServerSpec {
        ServerSpec::new(&self.command)
            .args(self.args.clone())
            .env(self.env.clone())
    }
}

/// Root configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WardenConfig {
    /// Runtime proxy.
    pub proxy: ProxySection,
    /// Capability certificates.
    pub cert: CertSection,
    /// Audit ledger.
    pub ledger: LedgerSection,
    /// Agent registry.
    pub registry: RegistrySection,
    /// Upstream tool servers.
    #[serde(default)]
    pub gateways: Vec<GatewaySection>,
}

impl WardenConfig {
    /// Parse from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed TOML.
    pub fn from_toml_str(text: &str) -> ConfigResult<Self> {
        toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load from a TOML file, then apply environment overrides and
    /// expand `${VAR}` references.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let text =
            std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io(e.to_string()))?;
        let mut config = Self::from_toml_str(&text)?;
        config.apply_env();
        info!(path = %path.as_ref().display(), "configuration loaded");
        Ok(config)
    }

    /// Default configuration with environment overrides applied.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Apply `WARDEN_*` environment overrides and expand `${VAR}`
    /// references in gateway environment maps.
    pub fn apply_env(&mut self) {
        self.apply_env_with(|key| std::env::var(key).ok());
    }

    /// Like [`apply_env`](Self::apply_env) with an explicit lookup
    /// (tests inject their own environment here).
    pub fn apply_env_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("WARDEN_UPSTREAM_URL") {
            self.proxy.upstream_url = url;
        }
        if let Some(token) = lookup("WARDEN_UPSTREAM_TOKEN") {
            self.proxy.upstream_token = Some(token);
        }
        if let Some(flag) = lookup("WARDEN_REQUIRE_CC") {
            self.proxy.require_cc = matches!(flag.as_str(), "1" | "true" | "yes");
        }
        if let Some(path) = lookup("WARDEN_CC_PUBLIC_KEY") {
            self.cert.enabled = true;
            self.cert.public_key_path = Some(PathBuf::from(path));
        }
        if let Some(path) = lookup("WARDEN_CC_SIGNING_KEY") {
            self.cert.signing_key_path = Some(PathBuf::from(path));
        }
        if let Some(issuer) = lookup("WARDEN_CC_ISSUER") {
            self.cert.issuer = Some(issuer);
        }
        if let Some(path) = lookup("WARDEN_LEDGER_PATH") {
            self.ledger.path = Some(PathBuf::from(path));
        }
        if let Some(path) = lookup("WARDEN_REGISTRY_PATH") {
            self.registry.path = Some(PathBuf::from(path));
        }

        for gateway in &mut self.gateways {
            for value in gateway.env.values_mut() {
                *value = expand_vars(value, &lookup);
            }
        }
    }

    /// Check the startup invariants.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] when:
    /// - dev-mode verification is combined with a persistent ledger
    /// - `require_cc` is set but the certificate section is disabled
    /// - the certificate section is enabled (non-dev) without any key
    ///   material
    pub fn validate(&self) -> ConfigResult<()> {
        if self.cert.dev_mode && self.ledger.path.is_some() {
            return Err(ConfigError::Invalid(
                "dev-mode certificate validation cannot feed a persistent ledger".to_string(),
            ));
        }
        if self.proxy.require_cc && !self.cert.enabled {
            return Err(ConfigError::Invalid(
                "require_cc is set but the certificate section is disabled".to_string(),
            ));
        }
        if self.cert.enabled
            && !self.cert.dev_mode
            && self.cert.public_key_path.is_none()
            && self.cert.public_key_hex.is_none()
            && self.cert.signing_key_path.is_none()
        {
            return Err(ConfigError::Invalid(
                "certificate verification enabled without a public key".to_string(),
            ));
        }
        if self.cert.signing_key_path.is_some() && self.cert.issuer.is_none() {
            return Err(ConfigError::Invalid(
                "signing_key_path is set but no issuer is configured".to_string(),
            ));
        }
        Ok(())
    }

    /// Build the certificate verifier described by the config.
    ///
    /// Returns `None` when verification is disabled.
    ///
    /// # Errors
    ///
    /// Propagates validation failures and key-loading errors.
    pub fn build_verifier(&self) -> ConfigResult<Option<CertificateVerifier>> {
        self.validate()?;

        if !self.cert.enabled {
            return Ok(None);
        }
        if self.cert.dev_mode {
            return Ok(Some(CertificateVerifier::dev_mode()));
        }

        let key = self.load_public_key()?;
        let mut builder = CertificateVerifier::builder().default_key(key);
        if let Some(issuer) = &self.cert.issuer {
            builder = builder.expected_issuer(issuer);
        }
        Ok(Some(builder.build()?))
    }

    /// Build the certificate signer, when this gateway is the minting
    /// authority (`signing_key_path` is set).
    ///
    /// The seed file is created on first start and reloaded on every
    /// later one, so the authority key id stays stable across
    /// restarts.
    ///
    /// # Errors
    ///
    /// Propagates validation failures and key-file errors; an
    /// unreadable or malformed seed refuses startup.
    pub fn build_signer(&self) -> ConfigResult<Option<CertificateSigner>> {
        self.validate()?;

        let Some(path) = &self.cert.signing_key_path else {
            return Ok(None);
        };
        let Some(issuer) = &self.cert.issuer else {
            // validate() already refused this; keep the refusal local too.
            return Err(ConfigError::Invalid(
                "signing_key_path is set but no issuer is configured".to_string(),
            ));
        };

        let keypair = KeyPair::load_or_generate(path)?;
        Ok(Some(CertificateSigner::new(keypair, issuer)))
    }

    /// Open the ledger described by the config.
    ///
    /// # Errors
    ///
    /// Propagates ledger-opening errors.
    pub fn build_ledger(&self) -> ConfigResult<Ledger> {
        match &self.ledger.path {
            Some(path) => Ok(Ledger::open_sqlite(path)?),
            None => Ok(Ledger::in_memory()),
        }
    }

    fn load_public_key(&self) -> ConfigResult<PublicKey> {
        if let Some(hex) = &self.cert.public_key_hex {
            return Ok(PublicKey::from_hex(hex)?);
        }
        if let Some(path) = &self.cert.public_key_path {
            let bytes = std::fs::read(path).map_err(|e| ConfigError::Io(e.to_string()))?;
            return Ok(PublicKey::try_from_slice(&bytes)?);
        }
        if let Some(path) = &self.cert.signing_key_path {
            // A minting gateway trusts its own authority key.
            return Ok(KeyPair::load_or_generate(path)?.export_public_key());
        }
        Err(ConfigError::Invalid(
            "no certificate public key configured".to_string(),
        ))
    }
}

/// Expand `${VAR}` references; unknown variables are left verbatim.
fn expand_vars<F>(value: &str, lookup: &F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start.saturating_add(2)..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match lookup(name) {
                    Some(replacement) => out.push_str(&replacement),
                    None => {
                        out.push_str("${");
                        out.push_str(name);
                        out.push('}');
                    },
                }
                rest = &after[end.saturating_add(1)..];
            },
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            },
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[proxy]
listen_addr = "127.0.0.1:8800"
upstream_url = "ws://localhost:18789"
require_cc = true

[cert]
enabled = true
issuer = "https://certs.example.com"
public_key_hex = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"

[ledger]
path = "/tmp/warden/audit.db"

[registry]
spawn_url = "http://localhost:18789/api/v1/sessions/spawn"

[[gateways]]
id = "github"
command = "npx"
args = ["-y", "@modelcontextprotocol/server-github"]

[gateways.env]
GITHUB_TOKEN = "${GITHUB_TOKEN}"

[gateways.policy]
mode = "allowlist"

[[gateways.policy.tools]]
name = "get_file_contents"
category = "read"

[[gateways.policy.tools]]
name = "create_issue"
category = "write"
requires_approval = true
approvers = ["alice"]
"#;

    #[test]
    fn test_parse_sample() {
        let config = WardenConfig::from_toml_str(SAMPLE).unwrap();
        assert!(config.proxy.require_cc);
        assert_eq!(config.gateways.len(), 1);

        let gateway = &config.gateways[0];
        assert_eq!(gateway.id, "github");
        assert!(gateway.auto_connect);
        assert!(gateway.policy.decide("get_file_contents", None, None).is_allow());
        assert!(gateway.policy.decide("create_issue", None, None).needs_approval());
        assert!(gateway.policy.decide("unlisted", None, None).is_deny());

        let spec = gateway.server_spec();
        assert_eq!(spec.command, "npx");
        assert_eq!(spec.args.len(), 2);
    }

    #[test]
    fn test_env_overrides_and_expansion() {
        let mut config = WardenConfig::from_toml_str(SAMPLE).unwrap();
        config.apply_env_with(|key| match key {
            "WARDEN_UPSTREAM_URL" => Some("ws://runtime:9000".to_string()),
            "WARDEN_UPSTREAM_TOKEN" => Some("secret".to_string()),
            "WARDEN_REQUIRE_CC" => Some("false".to_string()),
            "GITHUB_TOKEN" => Some("ghp_abc".to_string()),
            _ => None,
        });

        assert_eq!(config.proxy.upstream_url, "ws://runtime:9000");
        assert_eq!(config.proxy.upstream_token.as_deref(), Some("secret"));
        assert!(!config.proxy.require_cc);
        assert_eq!(config.gateways[0].env["GITHUB_TOKEN"], "ghp_abc");
    }

    #[test]
    fn test_unknown_vars_left_verbatim() {
        let lookup = |_: &str| None;
        assert_eq!(expand_vars("${MISSING}/x", &lookup), "${MISSING}/x");
        assert_eq!(expand_vars("no refs", &lookup), "no refs");
    }

    #[test]
    fn test_dev_mode_with_ledger_refused() {
        let mut config = WardenConfig::from_toml_str(SAMPLE).unwrap();
        config.cert.dev_mode = true;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        // Without a persistent ledger, dev mode is tolerated.
        config.ledger.path = None;
        assert!(config.validate().is_ok());
        let verifier = config.build_verifier().unwrap().unwrap();
        assert!(verifier.is_dev_mode());
    }

    #[test]
    fn test_require_cc_without_cert_refused() {
        let mut config = WardenConfig::default();
        config.proxy.require_cc = true;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_enabled_cert_without_key_refused() {
        let mut config = WardenConfig::default();
        config.cert.enabled = true;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_build_verifier_from_hex_key() {
        let config = WardenConfig::from_toml_str(SAMPLE).unwrap();
        let verifier = config.build_verifier().unwrap().unwrap();
        assert!(!verifier.is_dev_mode());
    }

    #[test]
    fn test_build_verifier_from_key_file() {
        let dir = tempfile::tempdir().unwrap();
        let key_path = dir.path().join("authority.pub");
        let keypair = warden_crypto::KeyPair::generate();
        std::fs::write(&key_path, keypair.public_key_bytes()).unwrap();

        let mut config = WardenConfig::default();
        config.cert.enabled = true;
        config.cert.public_key_path = Some(key_path);
        assert!(config.build_verifier().unwrap().is_some());
    }

    #[test]
    fn test_signing_key_requires_issuer() {
        let mut config = WardenConfig::default();
        config.cert.enabled = true;
        config.cert.signing_key_path = Some(PathBuf::from("/tmp/warden/authority.key"));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid(_))
        ));

        config.cert.issuer = Some("https://certs.example.com".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_build_signer_persists_authority_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = WardenConfig::default();
        config.cert.enabled = true;
        config.cert.issuer = Some("https://certs.example.com".to_string());
        config.cert.signing_key_path = Some(dir.path().join("authority.key"));

        // First start creates the seed; the next loads the same key.
        let first = config.build_signer().unwrap().unwrap();
        let second = config.build_signer().unwrap().unwrap();
        assert_eq!(first.key_id(), second.key_id());

        // The minting gateway verifies its own tokens: a token issued
        // by the first signer passes the verifier built from the same
        // config.
        let token = first
            .issue("agent:ada", vec!["operator.read".to_string()], Some(3600), None)
            .unwrap();
        let verifier = config.build_verifier().unwrap().unwrap();
        assert!(verifier.verify(&token).is_ok());
    }

    #[test]
    fn test_build_signer_absent_without_path() {
        let config = WardenConfig::default();
        assert!(config.build_signer().unwrap().is_none());
    }

    #[test]
    fn test_build_ledger_in_memory_by_default() {
        let config = WardenConfig::default();
        let ledger = config.build_ledger().unwrap();
        assert_eq!(ledger.stats().unwrap().backend, "memory");
    }
}
