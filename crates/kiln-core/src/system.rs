//! System-type strings.
//!
//! A system type identifies the platform a step must run on plus the system
//! features it requires, e.g. `x86_64-linux` or `x86_64-linux:big-parallel`.
//! Machines advertise the platforms they run; the feature suffix lets
//! autoscalers size distinct pools per feature set.

use std::collections::BTreeSet;

/// Compose the system-type string for a platform and its required features.
pub fn system_type(platform: &str, required_features: &BTreeSet<String>) -> String {
    if required_features.is_empty() {
        platform.to_string()
    } else {
        let features: Vec<&str> = required_features.iter().map(String::as_str).collect();
        format!("{}:{}", platform, features.join(","))
    }
}
