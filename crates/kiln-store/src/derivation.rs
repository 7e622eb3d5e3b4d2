//! Derivations: content-addressed build recipes.

use crate::path::StorePath;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A build recipe. Inputs and build command determine the outputs, so a
/// derivation can be realized on any machine of the right platform.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Derivation {
    pub name: String,
    /// Platform the builder must run on, e.g. `x86_64-linux`. The sentinel
    /// `builtin` marks derivations realized by the runner's own system.
    pub platform: String,
    pub builder: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Output name (`out`, `dev`, ...) to the store path it will produce.
    pub outputs: BTreeMap<String, StorePath>,
    /// Input derivations and which of their outputs are needed.
    pub input_drvs: BTreeMap<StorePath, BTreeSet<String>>,
    /// Input sources copied verbatim into the build.
    pub input_srcs: BTreeSet<StorePath>,
}

impl Derivation {
    pub fn is_builtin(&self) -> bool {
        self.platform == "builtin" || self.builder.starts_with("builtin:")
    }

    /// The store paths of all outputs.
    pub fn output_paths(&self) -> BTreeSet<StorePath> {
        self.outputs.values().cloned().collect()
    }
}

/// Scheduling-relevant options carried in a derivation's environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DerivationOptions {
    pub required_system_features: BTreeSet<String>,
    pub prefer_local_build: bool,
    /// Whether a cached failure of this derivation may be reused instead of
    /// rebuilding.
    pub allow_cached_failure: bool,
    pub allow_substitutes: bool,
}

impl DerivationOptions {
    pub fn parse(drv: &Derivation) -> Self {
        Self {
            required_system_features: drv
                .env
                .get("requiredSystemFeatures")
                .map(|v| v.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            prefer_local_build: env_flag(drv, "preferLocalBuild"),
            allow_cached_failure: !env_flag(drv, "ignoreCachedFailure"),
            allow_substitutes: drv
                .env
                .get("allowSubstitutes")
                .map_or(true, |v| v == "1" || v == "true"),
        }
    }
}

fn env_flag(drv: &Derivation, key: &str) -> bool {
    drv.env.get(key).is_some_and(|v| v == "1" || v == "true")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drv_with_env(pairs: &[(&str, &str)]) -> Derivation {
        Derivation {
            name: "test".into(),
            platform: "x86_64-linux".into(),
            builder: "/bin/sh".into(),
            env: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn parses_required_features() {
        let drv = drv_with_env(&[("requiredSystemFeatures", "kvm big-parallel")]);
        let opts = DerivationOptions::parse(&drv);
        assert!(opts.required_system_features.contains("kvm"));
        assert!(opts.required_system_features.contains("big-parallel"));
        assert!(!opts.prefer_local_build);
    }

    #[test]
    fn parses_prefer_local_build() {
        let drv = drv_with_env(&[("preferLocalBuild", "1")]);
        assert!(DerivationOptions::parse(&drv).prefer_local_build);
        let drv = drv_with_env(&[("preferLocalBuild", "0")]);
        assert!(!DerivationOptions::parse(&drv).prefer_local_build);
    }

    #[test]
    fn substitutes_default_on() {
        let drv = drv_with_env(&[]);
        assert!(DerivationOptions::parse(&drv).allow_substitutes);
        let drv = drv_with_env(&[("allowSubstitutes", "0")]);
        assert!(!DerivationOptions::parse(&drv).allow_substitutes);
    }

    #[test]
    fn builtin_detection() {
        let mut drv = drv_with_env(&[]);
        assert!(!drv.is_builtin());
        drv.builder = "builtin:fetchurl".into();
        assert!(drv.is_builtin());
    }
}
