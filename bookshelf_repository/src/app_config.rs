use std::path::PathBuf;

use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, Environment, File};
use serde::Deserialize;

use crate::api::{Principal, UserId};
use crate::books_repository::PostgresBooksRepositoryConfig;

#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Local,
    Remote,
}

#[derive(Debug, Clone, Deserialize, Eq, PartialEq)]
pub struct LocalConfig {
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Eq, PartialEq)]
pub struct RemoteConfig {
    pub hostname: String,
    pub username: String,
    pub password: String,
    /// Principal handed over by the auth provider, nothing is visible without it
    pub user_id: Option<UserId>,
}

impl RemoteConfig {
    pub fn repository_config(&self) -> PostgresBooksRepositoryConfig {
        PostgresBooksRepositoryConfig {
            hostname: self.hostname.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
        }
    }

    pub fn principal(&self) -> Option<Principal> {
        self.user_id.map(|user_id| Principal { user_id })
    }
}

#[derive(Debug, Clone, Deserialize, Eq, PartialEq)]
pub struct AppConfig {
    pub backend: BackendKind,
    pub local: LocalConfig,
    pub remote: RemoteConfig,
    /// Keep printing remote changes after the summary
    pub follow_changes: bool,
}

impl AppConfig {
    /// Defaults, then `bookshelf.toml` if present, then `BOOKSHELF__*` variables,
    /// e.g. `BOOKSHELF__REMOTE__HOSTNAME`
    pub fn load() -> Result<Self, ConfigError> {
        defaults()?
            .add_source(File::with_name("bookshelf").required(false))
            .add_source(Environment::with_prefix("BOOKSHELF").separator("__"))
            .build()?
            .try_deserialize()
    }
}

fn defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    Config::builder()
        .set_default("backend", "local")?
        .set_default("local.data_dir", ".bookshelf")?
        .set_default("remote.hostname", "127.0.0.1")?
        .set_default("remote.username", "postgres")?
        .set_default("remote.password", "postgres")?
        .set_default("follow_changes", false)
}

#[cfg(test)]
mod app_config_tests {
    use config::FileFormat;
    use uuid::Uuid;

    use super::*;

    fn from_toml(text: &str) -> AppConfig {
        defaults()
            .unwrap()
            .add_source(File::from_str(text, FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn defaults_select_local_backend() {
        let config = from_toml("");
        assert_eq!(config.backend, BackendKind::Local);
        assert_eq!(config.local.data_dir, PathBuf::from(".bookshelf"));
        assert_eq!(config.remote.hostname, "127.0.0.1");
        assert_eq!(config.remote.principal(), None);
        assert!(!config.follow_changes);
    }

    #[test]
    fn file_overrides_defaults() {
        let user_id = Uuid::new_v4();
        let config = from_toml(&format!(
            r#"
            backend = "remote"
            follow_changes = true

            [remote]
            hostname = "db.internal"
            password = "secret"
            user_id = "{user_id}"
            "#
        ));

        assert_eq!(config.backend, BackendKind::Remote);
        assert!(config.follow_changes);
        assert_eq!(config.remote.principal(), Some(Principal { user_id }));

        let repository_config = config.remote.repository_config();
        assert_eq!(repository_config.hostname, "db.internal");
        assert_eq!(repository_config.username, "postgres");
        assert_eq!(repository_config.password, "secret");
    }
}
