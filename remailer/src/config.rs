//! Remailer Configuration
//!
//! Configuration options for the remailer client and its packet sink.

use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::{Serialize, Deserialize};
use crate::{MixError, MixResult, MAX_HOPS, MIN_HOPS, DEFAULT_HOPS};

/// Remailer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemailerConfig {
    /// Data directory for the keyring and reply blocks
    pub data_dir: PathBuf,

    /// Total hops of a forward message (split over two legs)
    pub hops: usize,

    /// Reply blocks to attach when the user asks for replies
    pub reply_blocks: usize,

    /// Address reply blocks deliver to
    pub return_address: Option<String>,

    /// Directory text file with relay descriptors
    pub directory_file: PathBuf,

    /// Armored keyring file
    pub keyring_file: PathBuf,

    /// Relay connection settings
    pub transport: TransportConfig,

    /// TLS trust settings
    pub tls: TlsSettings,

    /// Pre-generated secrets kept in the key pool
    pub key_pool_capacity: usize,

    /// Logging level
    pub log_level: String,
}

impl Default for RemailerConfig {
    fn default() -> Self {
        let data_dir = default_data_dir();
        Self {
            directory_file: data_dir.join("directory.txt"),
            keyring_file: data_dir.join("keyring"),
            data_dir,
            hops: DEFAULT_HOPS,
            reply_blocks: 0,
            return_address: None,
            transport: TransportConfig::default(),
            tls: TlsSettings::default(),
            key_pool_capacity: 64,
            log_level: "info".into(),
        }
    }
}

impl RemailerConfig {
    /// Configuration rooted at a data directory
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            directory_file: data_dir.join("directory.txt"),
            keyring_file: data_dir.join("keyring"),
            data_dir,
            ..Self::default()
        }
    }

    /// Load configuration from file
    pub fn load(path: &Path) -> MixResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| MixError::InvalidConfiguration(e.to_string()))?;

        serde_json::from_str(&content)
            .map_err(|e| MixError::InvalidConfiguration(e.to_string()))
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> MixResult<()> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| MixError::InvalidConfiguration(e.to_string()))?;

        std::fs::write(path, content)
            .map_err(|e| MixError::InvalidConfiguration(e.to_string()))
    }

    /// Validate configuration
    pub fn validate(&self) -> MixResult<()> {
        if !self.data_dir.exists() {
            std::fs::create_dir_all(&self.data_dir)
                .map_err(|e| MixError::InvalidConfiguration(
                    format!("Cannot create data dir: {}", e)
                ))?;
        }

        if self.hops < MIN_HOPS {
            return Err(MixError::InvalidConfiguration(
                format!("hops must be at least {}", MIN_HOPS)
            ));
        }
        if self.hops > 2 * MAX_HOPS {
            return Err(MixError::InvalidConfiguration(
                format!("hops must be at most {}", 2 * MAX_HOPS)
            ));
        }

        if self.reply_blocks > 0 && self.return_address.is_none() {
            return Err(MixError::MissingConfiguration(
                "return address required for reply blocks".into()
            ));
        }

        if self.tls.check_root && self.tls.trusted_root.is_none() {
            return Err(MixError::MissingConfiguration(
                "trusted root required when root checking is enabled".into()
            ));
        }

        if self.key_pool_capacity == 0 {
            return Err(MixError::InvalidConfiguration(
                "key pool capacity must be positive".into()
            ));
        }

        Ok(())
    }
}

/// Relay connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Deadline for connect, TLS handshake and MMTP greeting
    #[serde(with = "humantime_serde")]
    pub setup_timeout: Duration,

    /// Deadline for any later read
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,

    /// Cipher suites offered, most preferred first
    pub cipher_suites: Vec<u16>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            setup_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(200),
            cipher_suites: vec![0x0039, 0x0033, 0x0016],
        }
    }
}

/// TLS trust settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsSettings {
    /// Require the certificate chain to end at the trusted root
    pub check_root: bool,

    /// PEM file with the trusted root key
    pub trusted_root: Option<PathBuf>,

    /// PEM file with the client identity key (for client certificates)
    pub client_key: Option<PathBuf>,

    /// Subject of the client certificate
    pub client_subject: Option<String>,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            check_root: false,
            trusted_root: None,
            client_key: None,
            client_subject: None,
        }
    }
}

/// Get default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|d| d.join("remailer"))
        .unwrap_or_else(|| PathBuf::from(".remailer"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = RemailerConfig::default();
        assert_eq!(config.hops, DEFAULT_HOPS);
        assert_eq!(config.transport.setup_timeout, Duration::from_secs(30));
        assert_eq!(config.transport.idle_timeout, Duration::from_secs(200));
        assert!(!config.tls.check_root);
    }

    #[test]
    fn test_config_save_load() {
        let tmp = tempdir().unwrap();
        let config_path = tmp.path().join("config.json");

        let mut config = RemailerConfig::with_data_dir(tmp.path().join("data"));
        config.hops = 6;
        config.return_address = Some("me@example.org".into());
        config.save(&config_path).unwrap();

        let loaded = RemailerConfig::load(&config_path).unwrap();
        assert_eq!(loaded.hops, 6);
        assert_eq!(loaded.return_address.as_deref(), Some("me@example.org"));
        assert_eq!(loaded.directory_file, tmp.path().join("data").join("directory.txt"));

        let text = std::fs::read_to_string(&config_path).unwrap();
        assert!(text.contains("\"30s\""));
    }

    #[test]
    fn test_validate_creates_data_dir() {
        let tmp = tempdir().unwrap();
        let config = RemailerConfig::with_data_dir(tmp.path().join("nested").join("data"));
        config.validate().unwrap();
        assert!(config.data_dir.exists());
    }

    #[test]
    fn test_validate_rejects_bad_settings() {
        let tmp = tempdir().unwrap();
        let base = RemailerConfig::with_data_dir(tmp.path());

        let mut config = base.clone();
        config.hops = 1;
        assert!(matches!(config.validate(), Err(MixError::InvalidConfiguration(_))));

        let mut config = base.clone();
        config.reply_blocks = 2;
        assert!(matches!(config.validate(), Err(MixError::MissingConfiguration(_))));

        let mut config = base;
        config.tls.check_root = true;
        assert!(matches!(config.validate(), Err(MixError::MissingConfiguration(_))));
    }

    #[test]
    fn test_load_missing_file() {
        let tmp = tempdir().unwrap();
        let result = RemailerConfig::load(&tmp.path().join("absent.json"));
        assert!(matches!(result, Err(MixError::InvalidConfiguration(_))));
    }
}
