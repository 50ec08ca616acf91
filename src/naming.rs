use std::path::PathBuf;

use base64::Engine;
use sha2::{Digest, Sha256};

use crate::constants::NAME_DIGEST_SEED;

/// Идентичность приложения, из которой выводится имя точки встречи.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppIdentity {
    pub application_name: String,
    pub organization_name: String,
    pub organization_domain: String,
    pub version: String,
    pub executable_path: String,
    /// Дополнительные дискриминаторы (склеиваются без разделителя).
    pub extra: Vec<String>,
}

impl AppIdentity {
    pub fn new(application_name: impl Into<String>) -> Self {
        Self {
            application_name: application_name.into(),
            ..Self::default()
        }
    }

    /// Имя и путь берутся из текущего исполняемого файла, версия от вызывающего.
    pub fn from_env(version: impl Into<String>) -> Self {
        let exe = std::env::current_exe().ok();
        let application_name = exe
            .as_ref()
            .and_then(|p| p.file_stem())
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let executable_path = exe
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            application_name,
            version: version.into(),
            executable_path,
            ..Self::default()
        }
    }

    pub fn with_extra(mut self, data: impl Into<String>) -> Self {
        self.extra.push(data.into());
        self
    }
}

/// Какие части идентичности входят в дайджест.
#[derive(Debug, Clone, Default)]
pub struct NameOptions {
    pub exclude_version: bool,
    pub exclude_path: bool,
    /// Имя пользователя; `Some` делает имя уникальным для пользователя.
    pub user: Option<String>,
}

/// SHA-256 идентичности в Base64 с заменой `/` на `_`.
pub fn block_server_name(identity: &AppIdentity, options: &NameOptions) -> String {
    let mut hasher = Sha256::new();
    hasher.update(NAME_DIGEST_SEED);
    hasher.update(identity.application_name.as_bytes());
    hasher.update(identity.organization_name.as_bytes());
    hasher.update(identity.organization_domain.as_bytes());

    if !identity.extra.is_empty() {
        hasher.update(identity.extra.concat().as_bytes());
    }
    if !options.exclude_version {
        hasher.update(identity.version.as_bytes());
    }
    if !options.exclude_path {
        hasher.update(identity.executable_path.as_bytes());
    }
    if let Some(user) = &options.user {
        hasher.update(user.as_bytes());
    }

    base64::engine::general_purpose::STANDARD
        .encode(hasher.finalize())
        .replace('/', "_")
}

pub fn shm_name(base: &str) -> String {
    format!("/{base}")
}

pub fn socket_path(base: &str) -> PathBuf {
    std::env::temp_dir().join(base)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> AppIdentity {
        AppIdentity {
            application_name: "editor".into(),
            organization_name: "Acme".into(),
            organization_domain: "acme.example".into(),
            version: "1.2.3".into(),
            executable_path: "/usr/bin/editor".into(),
            extra: Vec::new(),
        }
    }

    #[test]
    fn same_inputs_same_name() {
        let opts = NameOptions::default();
        assert_eq!(
            block_server_name(&identity(), &opts),
            block_server_name(&identity(), &opts)
        );
    }

    #[test]
    fn every_input_discriminates() {
        let opts = NameOptions::default();
        let base = block_server_name(&identity(), &opts);

        let mut other = identity();
        other.version = "1.2.4".into();
        assert_ne!(base, block_server_name(&other, &opts));

        let mut other = identity();
        other.executable_path = "/opt/editor".into();
        assert_ne!(base, block_server_name(&other, &opts));

        let other = identity().with_extra("profile-a");
        assert_ne!(base, block_server_name(&other, &opts));

        let user_opts = NameOptions {
            user: Some("alice".into()),
            ..NameOptions::default()
        };
        assert_ne!(base, block_server_name(&identity(), &user_opts));
    }

    #[test]
    fn excluded_parts_are_ignored() {
        let opts = NameOptions {
            exclude_version: true,
            exclude_path: true,
            user: None,
        };
        let mut other = identity();
        other.version = "9.9".into();
        other.executable_path = "/elsewhere".into();
        assert_eq!(
            block_server_name(&identity(), &opts),
            block_server_name(&other, &opts)
        );
    }

    #[test]
    fn name_is_path_safe() {
        for app in ["a", "b", "c", "d", "e", "f", "g", "h"] {
            let name = block_server_name(&AppIdentity::new(app), &NameOptions::default());
            assert!(!name.contains('/'));
            assert_eq!(name.len(), 44);
        }
    }
}
