use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use axum::http::HeaderName;
use url::Url;

/// Placeholder JWT secrets that MUST NOT be used.
const PLACEHOLDER_SECRETS: &[&str] = &[
    "change-me-to-a-random-string",
    "dev-secret-change-me",
];

#[derive(Debug, Clone)]
pub struct Config {
    pub jwt_secret: String,
    pub db_path: PathBuf,
    pub host: String,
    pub port: u16,
    /// Absolute origin clients reach us on, e.g. `https://sarhni.example`.
    pub public_url: String,
    pub upload_dir: PathBuf,
    pub upload_base_url: String,
    pub trusted_ip_header: HeaderName,
    pub cache_ttl: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        let jwt_secret = get("SARHNI_JWT_SECRET").unwrap_or_default();
        if jwt_secret.is_empty() || PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            bail!("SARHNI_JWT_SECRET is unset or still a placeholder");
        }

        let port: u16 = var("SARHNI_PORT", "3000")
            .parse()
            .context("SARHNI_PORT must be a port number")?;
        let public_url = var("SARHNI_PUBLIC_URL", &format!("http://localhost:{port}"));
        let public_url = absolute_http_url("SARHNI_PUBLIC_URL", &public_url)?;
        let upload_base_url = match get("SARHNI_UPLOAD_BASE_URL") {
            Some(base) => absolute_http_url("SARHNI_UPLOAD_BASE_URL", &base)?,
            None => format!("{public_url}/uploads"),
        };

        let trusted_ip_header = HeaderName::try_from(var("SARHNI_TRUSTED_IP_HEADER", "x-real-ip"))
            .context("SARHNI_TRUSTED_IP_HEADER is not a valid header name")?;
        let cache_ttl_secs: u64 = var("SARHNI_CACHE_TTL_SECS", "60")
            .parse()
            .context("SARHNI_CACHE_TTL_SECS must be a number of seconds")?;

        Ok(Self {
            jwt_secret,
            db_path: var("SARHNI_DB_PATH", "sarhni.db").into(),
            host: var("SARHNI_HOST", "0.0.0.0"),
            port,
            public_url,
            upload_dir: var("SARHNI_UPLOAD_DIR", "./uploads").into(),
            upload_base_url,
            trusted_ip_header,
            cache_ttl: Duration::from_secs(cache_ttl_secs),
        })
    }
}

/// Uploaded image URLs end up in profiles, which only hold absolute http(s)
/// URLs, so every public base must be one. Returned without a trailing slash.
fn absolute_http_url(key: &str, raw: &str) -> Result<String> {
    let url = Url::parse(raw).with_context(|| format!("{key} must be an absolute URL"))?;
    if !matches!(url.scheme(), "http" | "https") {
        bail!("{key} must be an http(s) URL");
    }
    Ok(raw.trim_end_matches('/').to_string())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_apply() {
        let config = Config::from_lookup(lookup(&[("SARHNI_JWT_SECRET", "s3cr3t-value")])).unwrap();
        assert_eq!(config.port, 3000);
        assert_eq!(config.db_path, PathBuf::from("sarhni.db"));
        assert_eq!(config.public_url, "http://localhost:3000");
        assert_eq!(config.upload_base_url, "http://localhost:3000/uploads");
        assert_eq!(config.trusted_ip_header, "x-real-ip");
        assert_eq!(config.cache_ttl, Duration::from_secs(60));
    }

    #[test]
    fn placeholder_secret_is_refused() {
        assert!(Config::from_lookup(lookup(&[])).is_err());
        assert!(
            Config::from_lookup(lookup(&[("SARHNI_JWT_SECRET", "dev-secret-change-me")])).is_err()
        );
    }

    #[test]
    fn bad_values_are_reported() {
        let err = Config::from_lookup(lookup(&[
            ("SARHNI_JWT_SECRET", "s3cr3t-value"),
            ("SARHNI_PORT", "eighty"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("SARHNI_PORT"));

        let config = Config::from_lookup(lookup(&[
            ("SARHNI_JWT_SECRET", "s3cr3t-value"),
            ("SARHNI_TRUSTED_IP_HEADER", "CF-Connecting-IP"),
        ]))
        .unwrap();
        assert_eq!(config.trusted_ip_header, "cf-connecting-ip");
    }

    #[test]
    fn upload_urls_are_always_absolute() {
        let config = Config::from_lookup(lookup(&[
            ("SARHNI_JWT_SECRET", "s3cr3t-value"),
            ("SARHNI_PUBLIC_URL", "https://sarhni.example/"),
        ]))
        .unwrap();
        assert_eq!(config.upload_base_url, "https://sarhni.example/uploads");

        let config = Config::from_lookup(lookup(&[
            ("SARHNI_JWT_SECRET", "s3cr3t-value"),
            ("SARHNI_UPLOAD_BASE_URL", "https://cdn.sarhni.example/img"),
        ]))
        .unwrap();
        assert_eq!(config.upload_base_url, "https://cdn.sarhni.example/img");

        for (key, value) in [
            ("SARHNI_UPLOAD_BASE_URL", "/uploads"),
            ("SARHNI_PUBLIC_URL", "ftp://sarhni.example"),
        ] {
            let err =
                Config::from_lookup(lookup(&[("SARHNI_JWT_SECRET", "s3cr3t-value"), (key, value)]))
                    .unwrap_err();
            assert!(err.to_string().contains(key), "{err}");
        }
    }
}
