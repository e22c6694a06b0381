//! Cache manager configuration.
//!
//! One [`SwConfig`] describes one cache version. Bumping `cache_version` and
//! installing again is the only way entries are ever replaced.

use std::path::Path;

use serde::{Deserialize, Serialize};
use url::Url;

use journeygo_net::Destination;

use crate::SwError;

/// Configuration for a [`ServiceWorker`](crate::ServiceWorker).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SwConfig {
    /// Origin the application is served from. Relative paths below resolve
    /// against it.
    pub origin: Url,

    /// Name of the current store.
    pub cache_version: String,

    /// Resources required to boot offline, fetched at install.
    pub app_shell: Vec<String>,

    /// Served for failed navigations, matched ignoring the query string.
    pub fallback_document: String,

    /// Served for failed image loads.
    pub fallback_image: String,

    /// Destinations handled cache-first.
    pub cacheable_destinations: Vec<Destination>,
}

impl Default for SwConfig {
    fn default() -> Self {
        Self {
            origin: Url::parse("http://localhost:5173/").expect("static origin is valid"),
            cache_version: "journeygo-cache-v2".to_string(),
            app_shell: vec![
                "/".to_string(),
                "/index.html".to_string(),
                "/manifest.json".to_string(),
                "/icons/icon-192.png".to_string(),
                "/icons/icon-512.png".to_string(),
            ],
            fallback_document: "/index.html".to_string(),
            fallback_image: "/icons/icon-192.png".to_string(),
            cacheable_destinations: vec![
                Destination::Style,
                Destination::Script,
                Destination::Font,
                Destination::Image,
            ],
        }
    }
}

impl SwConfig {
    /// Defaults, served from `origin`.
    pub fn for_origin(origin: Url) -> Self {
        Self {
            origin,
            ..Default::default()
        }
    }

    /// Parse and validate a JSON document. Missing fields take defaults.
    pub fn from_json_str(json: &str) -> Result<Self, SwError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| SwError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, SwError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Check that every configured path resolves and the version is usable.
    pub fn validate(&self) -> Result<(), SwError> {
        if self.cache_version.trim().is_empty() {
            return Err(SwError::Config("cache_version must not be empty".into()));
        }
        if self.origin.cannot_be_a_base() {
            return Err(SwError::Config(format!(
                "origin '{}' cannot resolve relative paths",
                self.origin
            )));
        }
        self.app_shell_urls()?;
        self.fallback_document_url()?;
        self.fallback_image_url()?;
        Ok(())
    }

    /// Resolve a configured path against the origin.
    pub fn resolve(&self, path: &str) -> Result<Url, SwError> {
        self.origin
            .join(path)
            .map_err(|e| SwError::Config(format!("cannot resolve '{}': {}", path, e)))
    }

    pub fn app_shell_urls(&self) -> Result<Vec<Url>, SwError> {
        self.app_shell.iter().map(|p| self.resolve(p)).collect()
    }

    pub fn fallback_document_url(&self) -> Result<Url, SwError> {
        self.resolve(&self.fallback_document)
    }

    pub fn fallback_image_url(&self) -> Result<Url, SwError> {
        self.resolve(&self.fallback_image)
    }

    pub fn is_cacheable_destination(&self, destination: Destination) -> bool {
        self.cacheable_destinations.contains(&destination)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SwConfig::default();
        assert_eq!(config.cache_version, "journeygo-cache-v2");
        assert_eq!(config.app_shell.len(), 5);
        assert!(config.is_cacheable_destination(Destination::Font));
        assert!(!config.is_cacheable_destination(Destination::Document));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_resolve_against_origin() {
        let config = SwConfig::for_origin(Url::parse("https://journeygo.test/").unwrap());
        let urls = config.app_shell_urls().unwrap();
        assert_eq!(urls[0].as_str(), "https://journeygo.test/");
        assert_eq!(urls[3].as_str(), "https://journeygo.test/icons/icon-192.png");
        assert_eq!(
            config.fallback_document_url().unwrap().as_str(),
            "https://journeygo.test/index.html"
        );
    }

    #[test]
    fn test_partial_json_takes_defaults() {
        let config = SwConfig::from_json_str(
            r#"{
                "origin": "https://journeygo.test/",
                "cache_version": "journeygo-cache-v3",
                "cacheable_destinations": ["style", "image"]
            }"#,
        )
        .unwrap();

        assert_eq!(config.cache_version, "journeygo-cache-v3");
        assert_eq!(config.fallback_image, "/icons/icon-192.png");
        assert!(!config.is_cacheable_destination(Destination::Script));
    }

    #[test]
    fn test_empty_version_rejected() {
        let result = SwConfig::from_json_str(r#"{ "cache_version": "  " }"#);
        assert!(matches!(result, Err(SwError::Config(_))));
    }

    #[test]
    fn test_unknown_destination_rejected() {
        let result = SwConfig::from_json_str(r#"{ "cacheable_destinations": ["video"] }"#);
        assert!(matches!(result, Err(SwError::Config(_))));
    }
}
