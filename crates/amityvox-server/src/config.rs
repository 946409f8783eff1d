use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;

fn harden_secret_file_permissions(path: &str) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub instance: InstanceConfig,
    #[serde(default)]
    pub voice: VoiceConfig,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct ServerConfig {
    pub bind_address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".into(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    16
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://./data/amityvox.db?mode=rwc".into(),
            max_connections: default_max_connections(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
pub struct InstanceConfig {
    /// Public DNS name other instances reach us at.
    pub domain: String,
    /// open | closed | allowlist
    #[serde(default = "default_federation_mode")]
    pub federation_mode: String,
    /// Optional <=5 char shorthand advertised in discovery.
    pub shorthand: Option<String>,
    /// Treat source-IP mismatches on signed requests as fatal.
    #[serde(default)]
    pub enforce_source_ip: bool,
    /// Path to the 64-char hex Ed25519 secret. Created by `generate-keys`.
    #[serde(default = "default_signing_key_path")]
    pub signing_key_path: String,
}

fn default_federation_mode() -> String {
    "open".into()
}

fn default_signing_key_path() -> String {
    "./data/signing.key".into()
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            domain: "chat.example.com".into(),
            federation_mode: default_federation_mode(),
            shorthand: None,
            enforce_source_ip: false,
            signing_key_path: default_signing_key_path(),
        }
    }
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct VoiceConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Public media URL handed to clients (overridable via AMITYVOX_VOICE_URL).
    pub public_url: Option<String>,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
    pub mode: Option<String>,
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let raw = fs::read_to_string(path).with_context(|| format!("reading config '{path}'"))?;
        let mut config: Config =
            toml::from_str(&raw).with_context(|| format!("parsing config '{path}'"))?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Secrets and deployment-specific URLs come from the environment when
    /// present.
    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("AMITYVOX_DATABASE_URL") {
            if !url.trim().is_empty() {
                self.database.url = url;
            }
        }
        if let Ok(url) = std::env::var("AMITYVOX_VOICE_URL") {
            if !url.trim().is_empty() {
                self.voice.public_url = Some(url);
            }
        }
        if let Ok(value) = std::env::var("AMITYVOX_ENFORCE_SOURCE_IP") {
            if let Ok(parsed) = value.trim().parse::<bool>() {
                self.instance.enforce_source_ip = parsed;
            }
        }
    }

    pub fn write_template(path: &str) -> Result<()> {
        if fs::metadata(path).is_ok() {
            anyhow::bail!("config file '{path}' already exists");
        }
        let template = toml::to_string_pretty(&Config::default())?;
        fs::write(path, template)?;
        Ok(())
    }

    pub fn load_signing_key(&self) -> Result<ed25519_dalek::SigningKey> {
        let raw = fs::read_to_string(&self.instance.signing_key_path).with_context(|| {
            format!(
                "reading signing key '{}' (run `amityvox generate-keys` first)",
                self.instance.signing_key_path
            )
        })?;
        amityvox_federation::signing::signing_key_from_hex(&raw)
            .context("signing key file is not 64 hex chars")
    }

    pub fn write_signing_key(&self, key: &ed25519_dalek::SigningKey) -> Result<()> {
        if let Some(parent) = std::path::Path::new(&self.instance.signing_key_path).parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(
            &self.instance.signing_key_path,
            amityvox_federation::signing::signing_key_to_hex(key),
        )?;
        harden_secret_file_permissions(&self.instance.signing_key_path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        let path = path.to_str().expect("path");

        Config::write_template(path).expect("template");
        let config = Config::load(path).expect("load");
        assert_eq!(config.server.bind_address, "0.0.0.0:8080");
        assert_eq!(config.instance.federation_mode, "open");

        // A second init must not clobber an existing file.
        assert!(Config::write_template(path).is_err());
    }

    #[test]
    fn signing_key_round_trips_with_tight_permissions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = Config::default();
        config.instance.signing_key_path = dir
            .path()
            .join("signing.key")
            .to_str()
            .expect("path")
            .to_string();

        let (key, _) = amityvox_federation::signing::generate_keypair().expect("keypair");
        config.write_signing_key(&key).expect("write");
        let loaded = config.load_signing_key().expect("load");
        assert_eq!(loaded.to_bytes(), key.to_bytes());

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&config.instance.signing_key_path)
                .expect("metadata")
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
