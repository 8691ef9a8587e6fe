//! Configuration model and validation
//!
//! The relay and the agent both consume one structured configuration:
//! server settings plus an inventory of forwarder definitions. Loading
//! is a thin YAML helper; the contract is the model itself, the
//! `FORWARDER_<NAME>_*` environment overrides, and the validation rules
//! applied before anything binds a port.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Placeholder that must be resolved from the environment before the
/// token is usable.
const TOKEN_PLACEHOLDER: &str = "${TUNNEL_TOKEN}";

/// Errors raised by configuration validation. All are fatal to startup.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("authentication token is missing or unresolved (set TUNNEL_TOKEN)")]
    MissingToken,

    #[error("forwarder '{name}': port {port} is out of range")]
    PortOutOfRange { name: String, port: u16 },

    #[error("forwarder '{name}': port {port} is already used by an enabled forwarder")]
    DuplicatePort { name: String, port: u16 },

    #[error("forwarder '{name}': target is empty")]
    MissingTarget { name: String },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
}

/// Top-level configuration shared by relay and agent.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub forwarders: Vec<ForwarderConfig>,
}

/// Relay endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address for the control channel and health endpoint.
    pub listen: String,
    /// Shared authentication secret. `${TUNNEL_TOKEN}` resolves from the
    /// environment.
    pub token: String,
    pub tls: TlsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: ":8443".to_string(),
            token: TOKEN_PLACEHOLDER.to_string(),
            tls: TlsConfig::default(),
        }
    }
}

/// TLS material for the relay. Transport is TLS when both paths are set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TlsConfig {
    pub cert: String,
    pub key: String,
}

impl TlsConfig {
    pub fn enabled(&self) -> bool {
        !self.cert.is_empty() && !self.key.is_empty()
    }
}

/// One forwarder definition.
///
/// The relay consumes `{port, client_id}` to run its listeners; the
/// agent consumes `{port, target}` to announce and dial targets. Only
/// `target` and `enabled` affect session behavior directly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ForwarderConfig {
    pub name: String,
    pub port: u16,
    pub target: String,
    pub client_id: String,
    pub enabled: bool,
    pub warn_on_fail: bool,
    pub description: String,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            port: 0,
            target: String::new(),
            client_id: String::new(),
            enabled: true,
            warn_on_fail: false,
            description: String::new(),
        }
    }
}

impl Config {
    /// Parse a YAML document into the configuration model.
    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Resolve `${VAR}` references and apply `FORWARDER_<NAME>_*`
    /// overrides from the process environment, then validate.
    pub fn resolve(mut self) -> Result<Self, ConfigError> {
        self.expand_with(|name| std::env::var(name).ok());
        self.apply_overrides_with(|name| std::env::var(name).ok());
        self.validate()?;
        Ok(self)
    }

    /// Expand `${VAR}` references in string fields. Unset variables
    /// expand to the empty string, which validation then rejects where
    /// the field is required.
    pub fn expand_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        self.server.listen = expand(&self.server.listen, &lookup);
        self.server.token = expand(&self.server.token, &lookup);
        self.server.tls.cert = expand(&self.server.tls.cert, &lookup);
        self.server.tls.key = expand(&self.server.tls.key, &lookup);

        for forwarder in &mut self.forwarders {
            forwarder.target = expand(&forwarder.target, &lookup);
            forwarder.client_id = expand(&forwarder.client_id, &lookup);
        }
    }

    /// Apply `FORWARDER_<UPPERCASE_NAME>_{PORT,TARGET,ENABLED}`
    /// overrides. Invalid values are logged and keep the configured
    /// value.
    pub fn apply_overrides_with<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        for forwarder in &mut self.forwarders {
            let prefix = format!("FORWARDER_{}_", forwarder.name.to_uppercase());

            if let Some(value) = lookup(&format!("{prefix}PORT")) {
                match value.parse::<u16>() {
                    Ok(port) => forwarder.port = port,
                    Err(_) => tracing::warn!(
                        forwarder = %forwarder.name,
                        value = %value,
                        "Ignoring invalid port override"
                    ),
                }
            }

            if let Some(value) = lookup(&format!("{prefix}TARGET")) {
                forwarder.target = value;
            }

            if let Some(value) = lookup(&format!("{prefix}ENABLED")) {
                match value.parse::<bool>() {
                    Ok(enabled) => forwarder.enabled = enabled,
                    Err(_) => tracing::warn!(
                        forwarder = %forwarder.name,
                        value = %value,
                        "Ignoring invalid enabled override"
                    ),
                }
            }
        }
    }

    /// Validate the configuration. Disabled forwarders are skipped
    /// silently; any rule violation on an enabled entry is fatal.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.token.is_empty() || self.server.token == TOKEN_PLACEHOLDER {
            return Err(ConfigError::MissingToken);
        }

        let mut used_ports = std::collections::HashSet::new();
        for forwarder in self.enabled_forwarders() {
            if forwarder.port == 0 {
                return Err(ConfigError::PortOutOfRange {
                    name: forwarder.name.clone(),
                    port: forwarder.port,
                });
            }

            if !used_ports.insert(forwarder.port) {
                return Err(ConfigError::DuplicatePort {
                    name: forwarder.name.clone(),
                    port: forwarder.port,
                });
            }

            if forwarder.target.is_empty() {
                return Err(ConfigError::MissingTarget {
                    name: forwarder.name.clone(),
                });
            }
        }

        Ok(())
    }

    /// Enabled forwarder definitions, in configuration order.
    pub fn enabled_forwarders(&self) -> impl Iterator<Item = &ForwarderConfig> {
        self.forwarders.iter().filter(|f| f.enabled)
    }
}

/// Expand `${VAR}` references in a string.
fn expand<F>(input: &str, lookup: &F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        match rest[start + 2..].find('}') {
            Some(end) => {
                let name = &rest[start + 2..start + 2 + end];
                out.push_str(&lookup(name).unwrap_or_default());
                rest = &rest[start + 2 + end + 1..];
            }
            None => {
                // Unterminated reference, keep it literally.
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }

    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn forwarder(name: &str, port: u16, target: &str) -> ForwarderConfig {
        ForwarderConfig {
            name: name.to_string(),
            port,
            target: target.to_string(),
            client_id: format!("a-{name}"),
            ..Default::default()
        }
    }

    fn valid_config() -> Config {
        Config {
            server: ServerConfig {
                token: "secret".to_string(),
                ..Default::default()
            },
            forwarders: vec![
                forwarder("web", 8080, "webapp:80"),
                forwarder("db", 5432, "database:5432"),
            ],
        }
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.server.listen, ":8443");
        assert_eq!(config.server.token, "${TUNNEL_TOKEN}");
        assert!(!config.server.tls.enabled());
    }

    #[test]
    fn test_yaml_round_trip() {
        let yaml = r#"
server:
  listen: ":9443"
  token: "t"
  tls:
    cert: /etc/tunnel/cert.pem
    key: /etc/tunnel/key.pem
forwarders:
  - name: web
    port: 8080
    target: webapp:80
    client_id: a-web
    description: internal web app
  - name: legacy
    port: 8081
    target: legacy:80
    client_id: a-web
    enabled: false
"#;

        let config = Config::from_yaml_str(yaml).unwrap();
        assert_eq!(config.server.listen, ":9443");
        assert!(config.server.tls.enabled());
        assert_eq!(config.forwarders.len(), 2);
        assert!(config.forwarders[0].enabled, "enabled defaults to true");
        assert!(!config.forwarders[1].enabled);
        assert_eq!(config.enabled_forwarders().count(), 1);
    }

    #[test]
    fn test_token_placeholder_resolution() {
        let mut config = Config::default();
        config.expand_with(|name| (name == "TUNNEL_TOKEN").then(|| "resolved".to_string()));
        assert_eq!(config.server.token, "resolved");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unresolved_token_is_rejected() {
        let mut config = Config::default();
        config.expand_with(|_| None);
        assert!(matches!(config.validate(), Err(ConfigError::MissingToken)));

        let untouched = Config::default();
        assert!(matches!(
            untouched.validate(),
            Err(ConfigError::MissingToken)
        ));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = valid_config();
        config.apply_overrides_with(|name| match name {
            "FORWARDER_WEB_PORT" => Some("9090".to_string()),
            "FORWARDER_WEB_TARGET" => Some("staging:80".to_string()),
            "FORWARDER_DB_ENABLED" => Some("false".to_string()),
            _ => None,
        });

        assert_eq!(config.forwarders[0].port, 9090);
        assert_eq!(config.forwarders[0].target, "staging:80");
        assert!(!config.forwarders[1].enabled);
    }

    #[test]
    fn test_invalid_override_keeps_configured_value() {
        let mut config = valid_config();
        config.apply_overrides_with(|name| match name {
            "FORWARDER_WEB_PORT" => Some("not-a-port".to_string()),
            "FORWARDER_WEB_ENABLED" => Some("yes".to_string()),
            _ => None,
        });

        assert_eq!(config.forwarders[0].port, 8080);
        assert!(config.forwarders[0].enabled);
    }

    #[test]
    fn test_duplicate_enabled_ports_rejected() {
        let mut config = valid_config();
        config.forwarders[1].port = 8080;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicatePort { port: 8080, .. })
        ));

        // Duplicates are fine once one side is disabled.
        config.forwarders[1].enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_port_rejected() {
        let mut config = valid_config();
        config.forwarders[0].port = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::PortOutOfRange { port: 0, .. })
        ));
    }

    #[test]
    fn test_empty_target_rejected() {
        let mut config = valid_config();
        config.forwarders[1].target.clear();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingTarget { .. })
        ));
    }

    #[test]
    fn test_expand_handles_multiple_and_unterminated_refs() {
        let lookup = |name: &str| match name {
            "HOST" => Some("db".to_string()),
            "PORT" => Some("5432".to_string()),
            _ => None,
        };

        assert_eq!(expand("${HOST}:${PORT}", &lookup), "db:5432");
        assert_eq!(expand("${MISSING}:x", &lookup), ":x");
        assert_eq!(expand("plain", &lookup), "plain");
        assert_eq!(expand("${HOST", &lookup), "${HOST");
    }
}
