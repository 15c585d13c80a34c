//! Destination table for request routing
//! Declarative rules mapping URL prefixes to backend base URLs

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use url::Url;

use crate::error::ConfigError;

/// A single routing rule: requests whose path falls under `url_prefix`
/// are forwarded to `target_base_url`.
///
/// The JSON field names follow the platform convention this router
/// descends from, so an existing `destinations` array parses unchanged
/// (`url` and `route` are accepted as legacy spellings).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Destination {
    /// Unique identifier, used in logs and error messages.
    pub name: String,

    /// Incoming path prefix this destination claims (default `/`).
    #[serde(default = "default_url_prefix", alias = "route")]
    pub url_prefix: String,

    /// Base URL of the backend; the path remainder is appended to it.
    #[serde(rename = "targetBaseURL", alias = "url")]
    pub target_base_url: String,

    /// Copy the caller's `Authorization` header verbatim when true.
    #[serde(default)]
    pub forward_auth_token: bool,
}

fn default_url_prefix() -> String {
    "/".to_string()
}

impl Destination {
    /// True when `path` falls under this destination's prefix.
    /// Matching is segment-aware: `/api` claims `/api` and `/api/users`
    /// but not `/apifoo`; `/` claims every path.
    pub fn matches_path(&self, path: &str) -> bool {
        if self.url_prefix == "/" {
            return true;
        }
        match path.strip_prefix(self.url_prefix.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with('/'),
            None => false,
        }
    }

    /// Remainder of `path` after this destination's prefix, either empty
    /// or starting with `/`. The caller appends it to the target base URL.
    pub fn strip_matched_prefix<'a>(&self, path: &'a str) -> &'a str {
        if self.url_prefix == "/" {
            return path;
        }
        path.strip_prefix(self.url_prefix.as_str()).unwrap_or(path)
    }

    /// Normalize for matching: collapse trailing slashes on the prefix
    /// (keeping the bare `/`) and on the target base URL.
    fn normalize(&mut self) {
        let trimmed = self.url_prefix.trim_end_matches('/');
        self.url_prefix = if trimmed.is_empty() {
            "/".to_string()
        } else {
            trimmed.to_string()
        };
        self.target_base_url = self.target_base_url.trim_end_matches('/').to_string();
    }
}

/// Ordered, validated collection of destinations.
///
/// Built once at startup and shared read-only by all request handlers;
/// routing changes require a restart.
#[derive(Debug, Clone)]
pub struct DestinationTable {
    destinations: Vec<Destination>,
}

impl DestinationTable {
    /// Validate and normalize a list of destinations, preserving
    /// declaration order.
    pub fn new(mut destinations: Vec<Destination>) -> Result<Self, ConfigError> {
        if destinations.is_empty() {
            return Err(ConfigError::EmptyTable);
        }

        let mut seen = HashSet::new();
        for (index, dest) in destinations.iter_mut().enumerate() {
            if dest.name.trim().is_empty() {
                return Err(ConfigError::EmptyName(index));
            }
            if !seen.insert(dest.name.clone()) {
                return Err(ConfigError::DuplicateName(dest.name.clone()));
            }
            if !dest.url_prefix.starts_with('/') {
                return Err(ConfigError::BadPrefix {
                    name: dest.name.clone(),
                    prefix: dest.url_prefix.clone(),
                });
            }
            dest.normalize();
            validate_target(dest)?;
        }

        Ok(Self { destinations })
    }

    /// Parse a JSON array of destinations and validate it.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let destinations: Vec<Destination> = serde_json::from_str(json)?;
        Self::new(destinations)
    }

    /// Load the table from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::UnreadableFile {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&contents)
    }

    /// Find the destination responsible for `path`.
    ///
    /// Longest matching prefix wins; on equal lengths the first-declared
    /// destination is kept. Returns `None` when nothing matches.
    pub fn resolve(&self, path: &str) -> Option<&Destination> {
        let mut best: Option<&Destination> = None;

        for dest in &self.destinations {
            if !dest.matches_path(path) {
                continue;
            }

            let is_better = match best {
                None => true,
                Some(current) => dest.url_prefix.len() > current.url_prefix.len(),
            };

            if is_better {
                best = Some(dest);
            }
        }

        best
    }

    pub fn len(&self) -> usize {
        self.destinations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.destinations.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Destination> {
        self.destinations.iter()
    }
}

/// Check that a destination's target is an absolute http URL the
/// forwarder can actually reach.
fn validate_target(dest: &Destination) -> Result<(), ConfigError> {
    let url = Url::parse(&dest.target_base_url).map_err(|e| ConfigError::BadTarget {
        name: dest.name.clone(),
        reason: e.to_string(),
    })?;

    if url.scheme() != "http" {
        return Err(ConfigError::BadTarget {
            name: dest.name.clone(),
            reason: format!("unsupported scheme {:?}, only http targets are reachable", url.scheme()),
        });
    }

    if url.host_str().is_none() {
        return Err(ConfigError::BadTarget {
            name: dest.name.clone(),
            reason: "missing host".to_string(),
        });
    }

    if url.query().is_some() || url.fragment().is_some() {
        return Err(ConfigError::BadTarget {
            name: dest.name.clone(),
            reason: "must not carry a query or fragment".to_string(),
        });
    }

    Ok(())
}
