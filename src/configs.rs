use anyhow::{Context, Result};
use secrecy::SecretString;
use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub ca: CaConfig,
    pub gnupg: GnupgConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CaConfig {
    /// PEM private key of the CA
    pub key: PathBuf,
    /// PEM certificate of the CA
    pub cert: PathBuf,
    #[serde(default)]
    pub key_passphrase: Option<SecretString>,
    /// Organization placed in every issued subject
    pub issuer: String,
    /// Comma separated DNS names or patterns, e.g. `*.example.com`
    pub alternate_name: String,
    #[serde(default = "default_extended_key_usage")]
    pub extended_key_usage: Vec<ExtendedUsage>,
    #[serde(default = "default_crl_next_update_days")]
    pub crl_next_update_days: u32,
}

impl CaConfig {
    pub fn alternate_names(&self) -> Vec<String> {
        self.alternate_name
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ExtendedUsage {
    ClientAuth,
    ServerAuth,
}

fn default_extended_key_usage() -> Vec<ExtendedUsage> {
    vec![ExtendedUsage::ClientAuth]
}

fn default_crl_next_update_days() -> u32 {
    7
}

#[derive(Debug, Deserialize, Clone)]
pub struct GnupgConfig {
    /// GnuPG home holding the user keyring
    pub user: PathBuf,
    /// GnuPG home holding the admin keyring
    pub admin: PathBuf,
    #[serde(default = "default_gpg_binary")]
    pub binary: PathBuf,
}

fn default_gpg_binary() -> PathBuf {
    PathBuf::from("gpg")
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub engine: StorageEngine,
    #[serde(default = "default_storage_timeout")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub sqlite: Option<SqliteConfig>,
    #[serde(default)]
    pub postgres: Option<PostgresConfig>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageEngine {
    #[serde(alias = "sqlite3")]
    Sqlite,
    #[serde(alias = "postgresql")]
    Postgres,
}

fn default_storage_timeout() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct SqliteConfig {
    /// Database file, or `:memory:`
    pub db_path: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PostgresConfig {
    pub host: String,
    #[serde(default = "default_postgres_port")]
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: SecretString,
    #[serde(default = "default_postgres_max_connections")]
    pub max_connections: u32,
}

fn default_postgres_port() -> u16 {
    5432
}

fn default_postgres_max_connections() -> u32 {
    8
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> Result<Self> {
        let config_str =
            fs::read_to_string(path).context(format!("Failed to read config file: {}", path))?;

        Self::from_toml(&config_str)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(config_str: &str) -> Result<Self> {
        let config: AppConfig =
            toml::from_str(config_str).context("Failed to parse config file")?;

        Ok(config)
    }

    /// Load configuration with default path (config.toml)
    pub fn load() -> Result<Self> {
        Self::from_file("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    const SQLITE_CONFIG: &str = r#"
        [ca]
        key = "secrets/certs/authority/RootCA.key"
        cert = "secrets/certs/authority/RootCA.pem"
        issuer = "My Company Name"
        alternate_name = "*.myname.com, api.myname.com"

        [gnupg]
        user = "/tmp/user_gnupghome"
        admin = "/tmp/admin_gnupghome"

        [storage]
        engine = "sqlite3"

        [storage.sqlite]
        db_path = ":memory:"
    "#;

    #[test]
    fn test_defaults_applied() {
        let config = AppConfig::from_toml(SQLITE_CONFIG).unwrap();
        assert_eq!(config.storage.engine, StorageEngine::Sqlite);
        assert_eq!(config.storage.timeout_secs, 10);
        assert_eq!(config.ca.extended_key_usage, vec![ExtendedUsage::ClientAuth]);
        assert_eq!(config.ca.crl_next_update_days, 7);
        assert_eq!(config.gnupg.binary, PathBuf::from("gpg"));
        assert!(config.ca.key_passphrase.is_none());
        assert!(config.storage.postgres.is_none());
    }

    #[test]
    fn test_alternate_names_split() {
        let config = AppConfig::from_toml(SQLITE_CONFIG).unwrap();
        assert_eq!(
            config.ca.alternate_names(),
            vec!["*.myname.com".to_string(), "api.myname.com".to_string()]
        );
    }

    #[test]
    fn test_postgres_section_and_redacted_password() {
        let config = AppConfig::from_toml(
            r#"
            [ca]
            key = "ca.key"
            cert = "ca.pem"
            issuer = "Org"
            alternate_name = "*.example.com"
            extended_key_usage = ["client_auth", "server_auth"]

            [gnupg]
            user = "u"
            admin = "a"

            [storage]
            engine = "postgres"
            timeout_secs = 3

            [storage.postgres]
            database = "mtls"
            user = "postgres"
            password = "hunter2"
            host = "localhost"
            "#,
        )
        .unwrap();
        let pg = config.storage.postgres.clone().unwrap();
        assert_eq!(pg.port, 5432);
        assert_eq!(pg.password.expose_secret(), "hunter2");
        assert!(!format!("{:?}", config).contains("hunter2"));
        assert_eq!(config.ca.extended_key_usage.len(), 2);
    }

    #[test]
    fn test_unknown_engine_rejected() {
        let bad = SQLITE_CONFIG.replace("sqlite3", "mongodb");
        assert!(AppConfig::from_toml(&bad).is_err());
    }
}
