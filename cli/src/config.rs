use anyhow::anyhow;
use campus_portal_client::ClientConfig;
use std::env;
use std::path::PathBuf;

pub const DEFAULT_TOKEN_FILE: &str = ".portal-session.json";

#[derive(Debug, Clone)]
pub struct Config {
    pub client: ClientConfig,
    /// JSON file holding the session tokens and the device id between runs.
    pub token_file: PathBuf,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_parts(ClientConfig::from_env(), env::var("PORTAL_TOKEN_FILE").ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        Self::from_parts(
            ClientConfig::from_lookup(&lookup),
            lookup("PORTAL_TOKEN_FILE"),
        )
    }

    fn from_parts(client: ClientConfig, token_file: Option<String>) -> anyhow::Result<Self> {
        let token_file = token_file
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_TOKEN_FILE.to_string());

        let config = Config {
            client,
            token_file: PathBuf::from(token_file),
        };
        config.validate()?;
        Ok(config)
    }

    /// Applies `--registration-url` / `--personal-account-url` overrides.
    pub fn with_service_urls(
        mut self,
        registration_url: Option<String>,
        personal_account_url: Option<String>,
    ) -> anyhow::Result<Self> {
        if let Some(url) = registration_url {
            self.client = self.client.with_registration_url(url);
        }
        if let Some(url) = personal_account_url {
            self.client = self.client.with_personal_account_url(url);
        }
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> anyhow::Result<()> {
        for (name, value) in [
            ("PORTAL_REGISTRATION_URL", &self.client.registration_url),
            ("PORTAL_PERSONAL_ACCOUNT_URL", &self.client.personal_account_url),
        ] {
            if !(value.starts_with("http://") || value.starts_with("https://")) {
                return Err(anyhow!("Invalid {} value: {}", name, value));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_apply_without_environment() {
        let config = Config::from_lookup(lookup(&[])).unwrap();

        assert_eq!(config.token_file, PathBuf::from(DEFAULT_TOKEN_FILE));
        assert_eq!(config.client.login_route, "/login");
    }

    #[test]
    fn reads_token_file_and_service_urls() {
        let config = Config::from_lookup(lookup(&[
            ("PORTAL_TOKEN_FILE", "/tmp/session.json"),
            ("PORTAL_REGISTRATION_URL", "http://localhost:8000/"),
        ]))
        .unwrap();

        assert_eq!(config.token_file, PathBuf::from("/tmp/session.json"));
        assert_eq!(config.client.registration_url, "http://localhost:8000");
    }

    #[test]
    fn rejects_non_http_service_url() {
        let err = Config::from_lookup(lookup(&[("PORTAL_PERSONAL_ACCOUNT_URL", "localhost:9000")]))
            .unwrap_err();

        assert!(err.to_string().contains("PORTAL_PERSONAL_ACCOUNT_URL"));
    }

    #[test]
    fn command_line_urls_override_environment() {
        let config = Config::from_lookup(lookup(&[("PORTAL_REGISTRATION_URL", "http://env:1")]))
            .unwrap()
            .with_service_urls(Some("http://flag:2/".into()), None)
            .unwrap();

        assert_eq!(config.client.registration_url, "http://flag:2");
        assert_eq!(
            config.client.personal_account_url,
            campus_portal_client::config::DEFAULT_PERSONAL_ACCOUNT_URL
        );

        let err = config
            .with_service_urls(None, Some("ftp://files".into()))
            .unwrap_err();
        assert!(err.to_string().contains("PORTAL_PERSONAL_ACCOUNT_URL"));
    }
}
