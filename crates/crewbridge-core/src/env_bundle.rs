//! Named environment-variable bundles.
//!
//! Agents may reference a bundle by slug (e.g. `"prod-credentials"`). The
//! bundle's variables are merged into the spawn environment below the
//! agent's explicit overrides. Durable storage of bundles lives outside this
//! crate behind [`EnvBundleStore`].

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use thiserror::Error;

/// Variable name to value.
pub type EnvBundle = BTreeMap<String, String>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EnvBundleError {
    #[error("Environment bundle not found: {0}")]
    NotFound(String),

    #[error("Environment bundle store unavailable: {0}")]
    Unavailable(String),
}

/// Lookup of environment bundles by slug.
pub trait EnvBundleStore: Send + Sync {
    fn lookup(&self, slug: &str) -> Result<EnvBundle, EnvBundleError>;
}

/// Bundles held in memory.
#[derive(Debug, Default)]
pub struct InMemoryEnvBundles {
    bundles: RwLock<HashMap<String, EnvBundle>>,
}

impl InMemoryEnvBundles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load bundles from a JSON object of `{ "slug": { "VAR": "value" } }`.
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        let bundles: HashMap<String, EnvBundle> = serde_json::from_str(json)?;
        Ok(Self {
            bundles: RwLock::new(bundles),
        })
    }

    /// Add or replace a bundle.
    pub fn insert(&self, slug: impl Into<String>, bundle: EnvBundle) {
        self.bundles
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(slug.into(), bundle);
    }

    pub fn len(&self) -> usize {
        self.bundles.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EnvBundleStore for InMemoryEnvBundles {
    fn lookup(&self, slug: &str) -> Result<EnvBundle, EnvBundleError> {
        self.bundles
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(slug)
            .cloned()
            .ok_or_else(|| EnvBundleError::NotFound(slug.to_string()))
    }
}

/// Store used when no bundle source is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoEnvBundles;

impl EnvBundleStore for NoEnvBundles {
    fn lookup(&self, slug: &str) -> Result<EnvBundle, EnvBundleError> {
        Err(EnvBundleError::Unavailable(format!(
            "no bundle store configured (requested '{}')",
            slug
        )))
    }
}

/// Bundle first, explicit overrides second.
pub fn merge_env(bundle: EnvBundle, overrides: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut env = bundle;
    env.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
    env
}
