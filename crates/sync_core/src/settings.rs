use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;
use tracing::warn;

/// Client-side sync settings. File values (`chat.toml`) override the
/// defaults; environment variables override the file.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server_url: String,
    pub database_url: String,
    pub auth_token: Option<String>,
    pub history_limit: u32,
    pub max_send_attempts: u32,
    pub request_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:8443".into(),
            database_url: "sqlite://./data/messages.db".into(),
            auth_token: None,
            history_limit: 50,
            max_send_attempts: 20,
            request_timeout_secs: 10,
        }
    }
}

impl Settings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// The `chat.toml` shape: every key optional, numeric keys as plain toml
/// integers.
#[derive(Debug, Default, Deserialize)]
struct SettingsFile {
    server_url: Option<String>,
    database_url: Option<String>,
    auth_token: Option<String>,
    history_limit: Option<u32>,
    max_send_attempts: Option<u32>,
    request_timeout_secs: Option<u64>,
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("chat.toml") {
        apply_file_settings(&mut settings, &raw);
    }

    if let Ok(v) = std::env::var("CHAT__SERVER_URL") {
        settings.server_url = v;
    }
    if let Ok(v) = std::env::var("CHAT__DATABASE_URL") {
        settings.database_url = v;
    }
    if let Ok(v) = std::env::var("CHAT__AUTH_TOKEN") {
        settings.auth_token = Some(v);
    }
    if let Ok(v) = std::env::var("CHAT__HISTORY_LIMIT") {
        if let Ok(parsed) = v.parse::<u32>() {
            settings.history_limit = parsed;
        }
    }
    if let Ok(v) = std::env::var("CHAT__MAX_SEND_ATTEMPTS") {
        if let Ok(parsed) = v.parse::<u32>() {
            settings.max_send_attempts = parsed;
        }
    }
    if let Ok(v) = std::env::var("CHAT__REQUEST_TIMEOUT_SECS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.request_timeout_secs = parsed;
        }
    }

    settings
}

fn apply_file_settings(settings: &mut Settings, raw: &str) {
    let file: SettingsFile = match toml::from_str(raw) {
        Ok(file) => file,
        Err(err) => {
            warn!("ignoring malformed chat.toml: {err}");
            return;
        }
    };

    if let Some(v) = file.server_url {
        settings.server_url = v;
    }
    if let Some(v) = file.database_url {
        settings.database_url = v;
    }
    if let Some(v) = file.auth_token {
        settings.auth_token = Some(v);
    }
    if let Some(v) = file.history_limit {
        settings.history_limit = v;
    }
    if let Some(v) = file.max_send_attempts {
        settings.max_send_attempts = v;
    }
    if let Some(v) = file.request_timeout_secs {
        settings.request_timeout_secs = v;
    }
}

pub fn prepare_database_url(raw_database_url: &str) -> anyhow::Result<String> {
    let database_url = normalize_database_url(raw_database_url);
    ensure_parent_dir_exists(&database_url)?;
    Ok(database_url)
}

fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        return format!("sqlite://{path}");
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

fn ensure_parent_dir_exists(database_url: &str) -> anyhow::Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_plain_file_path_to_sqlite_url() {
        assert_eq!(
            normalize_database_url("./data/test.db"),
            "sqlite://./data/test.db"
        );
    }

    #[test]
    fn keeps_memory_url_untouched() {
        assert_eq!(normalize_database_url("sqlite::memory:"), "sqlite::memory:");
    }

    #[test]
    fn empty_url_falls_back_to_default() {
        assert_eq!(
            normalize_database_url("  "),
            Settings::default().database_url
        );
    }

    #[test]
    fn file_settings_accept_plain_toml_integers() {
        let mut settings = Settings::default();
        apply_file_settings(
            &mut settings,
            "server_url = \"http://chat.example.com\"\n\
             history_limit = 25\n\
             max_send_attempts = 3\n\
             request_timeout_secs = 4\n",
        );

        assert_eq!(settings.server_url, "http://chat.example.com");
        assert_eq!(settings.history_limit, 25);
        assert_eq!(settings.max_send_attempts, 3);
        assert_eq!(settings.request_timeout_secs, 4);
    }

    #[test]
    fn partial_file_keeps_defaults_for_omitted_keys() {
        let mut settings = Settings::default();
        apply_file_settings(&mut settings, "auth_token = \"tok\"\n");

        assert_eq!(settings.auth_token.as_deref(), Some("tok"));
        assert_eq!(settings.history_limit, Settings::default().history_limit);
        assert_eq!(
            settings.database_url,
            Settings::default().database_url
        );
    }

    #[test]
    fn malformed_file_is_ignored_entirely() {
        let mut settings = Settings::default();
        apply_file_settings(&mut settings, "history_limit = \"not a number");
        assert_eq!(settings.history_limit, Settings::default().history_limit);
    }
}
