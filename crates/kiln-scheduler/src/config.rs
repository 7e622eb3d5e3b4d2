//! Runner configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// All tunables of the queue runner. Loaded from `KILN_*` environment
/// variables with the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    pub database_url: String,
    /// Store derivations are read from.
    pub local_store_uri: String,
    /// Store realized outputs are registered in.
    pub dest_store_uri: String,
    /// Machine list file; reloaded while running. No file means no machines.
    pub machines_file: Option<PathBuf>,
    pub machines_reload_interval: u64,
    /// Maximum attempts for a step failing with a retriable status.
    pub max_tries: u32,
    /// Base retry delay in seconds.
    pub retry_interval: u64,
    /// Geometric factor applied per additional attempt.
    pub retry_backoff: f64,
    /// Global bound on concurrent closure uploads.
    pub max_parallel_copy_closure: usize,
    /// Seconds a runnable step may go without any capable machine before it
    /// fails as unsupported. Zero disables the rule.
    pub max_unsupported_time: u64,
    /// Permits for CPU-bound local work (NAR extraction, hashing).
    pub max_local_workers: usize,
    /// Bound on waiting for a machine's send lock, in seconds.
    pub send_lock_timeout: u64,
    /// Base cooldown after a machine transport failure, in seconds.
    pub machine_base_cooldown: u64,
    /// Cap on the cooldown doubling exponent.
    pub machine_max_backoff_exp: u32,
    /// Dispatcher wait when nothing is deferred, in seconds.
    pub dispatch_idle_interval: u64,
    /// Monitor fallback poll when notifications are quiet, in seconds.
    pub queue_poll_interval: u64,
    /// Ceiling for the monitor's database-error backoff, in seconds.
    pub max_db_backoff: u64,
    /// Fair-share accounting window, in seconds.
    pub scheduling_window: i64,
    /// Reject outputs whose NARs exceed this many bytes.
    pub max_output_size: u64,
    pub max_log_size: u64,
    /// Where GC root markers for realized outputs are written.
    pub roots_dir: Option<PathBuf>,
    pub lock_file: PathBuf,
    /// Platform of the runner itself; builtin derivations match it.
    pub this_system: String,
    /// `project:jobset` to build repetition count, for determinism checks.
    pub jobset_repeats: HashMap<String, u32>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://kiln@127.0.0.1:5432/kiln".into(),
            local_store_uri: "memory://local".into(),
            dest_store_uri: "memory://dest".into(),
            machines_file: None,
            machines_reload_interval: 30,
            max_tries: 5,
            retry_interval: 60,
            retry_backoff: 3.0,
            max_parallel_copy_closure: 4,
            max_unsupported_time: 0,
            max_local_workers: num_cpus(),
            send_lock_timeout: 60,
            machine_base_cooldown: 30,
            machine_max_backoff_exp: 7,
            dispatch_idle_interval: 60,
            queue_poll_interval: 300,
            max_db_backoff: 60,
            scheduling_window: 24 * 60 * 60,
            max_output_size: 2 << 30,
            max_log_size: 64 << 20,
            roots_dir: None,
            lock_file: PathBuf::from("kiln-queue-runner.lock"),
            this_system: "x86_64-linux".into(),
            jobset_repeats: HashMap::new(),
        }
    }
}

impl RunnerConfig {
    /// Build a config from `KILN_*` environment variables, falling back to
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("KILN_DATABASE_URL") {
            config.database_url = url;
        }
        if let Ok(uri) = std::env::var("KILN_LOCAL_STORE") {
            config.local_store_uri = uri;
        }
        if let Ok(uri) = std::env::var("KILN_DEST_STORE") {
            config.dest_store_uri = uri;
        }
        if let Ok(path) = std::env::var("KILN_MACHINES_FILE") {
            config.machines_file = Some(PathBuf::from(path));
        }
        set_from_env("KILN_MACHINES_RELOAD_INTERVAL", &mut config.machines_reload_interval);
        set_from_env("KILN_MAX_TRIES", &mut config.max_tries);
        set_from_env("KILN_RETRY_INTERVAL", &mut config.retry_interval);
        set_from_env("KILN_RETRY_BACKOFF", &mut config.retry_backoff);
        set_from_env("KILN_MAX_PARALLEL_COPY_CLOSURE", &mut config.max_parallel_copy_closure);
        set_from_env("KILN_MAX_UNSUPPORTED_TIME", &mut config.max_unsupported_time);
        set_from_env("KILN_MAX_LOCAL_WORKERS", &mut config.max_local_workers);
        set_from_env("KILN_SEND_LOCK_TIMEOUT", &mut config.send_lock_timeout);
        set_from_env("KILN_MACHINE_BASE_COOLDOWN", &mut config.machine_base_cooldown);
        set_from_env("KILN_DISPATCH_IDLE_INTERVAL", &mut config.dispatch_idle_interval);
        set_from_env("KILN_QUEUE_POLL_INTERVAL", &mut config.queue_poll_interval);
        set_from_env("KILN_MAX_DB_BACKOFF", &mut config.max_db_backoff);
        set_from_env("KILN_SCHEDULING_WINDOW", &mut config.scheduling_window);
        set_from_env("KILN_MAX_OUTPUT_SIZE", &mut config.max_output_size);
        set_from_env("KILN_MAX_LOG_SIZE", &mut config.max_log_size);
        if let Ok(path) = std::env::var("KILN_ROOTS_DIR") {
            config.roots_dir = Some(PathBuf::from(path));
        }
        if let Ok(path) = std::env::var("KILN_LOCK_FILE") {
            config.lock_file = PathBuf::from(path);
        }
        if let Ok(system) = std::env::var("KILN_THIS_SYSTEM") {
            config.this_system = system;
        }
        if let Ok(spec) = std::env::var("KILN_JOBSET_REPEATS") {
            config.jobset_repeats = parse_jobset_repeats(&spec);
        }
        config
    }

    /// Delay before attempt `tries + 1` of a step that has failed `tries`
    /// times: `retry_interval * retry_backoff^(tries - 1)`.
    pub fn retry_delay(&self, tries: u32) -> Duration {
        let factor = self.retry_backoff.powi(tries.saturating_sub(1) as i32);
        Duration::from_secs_f64(self.retry_interval as f64 * factor)
    }

    pub fn repeats_for(&self, project: &str, jobset: &str) -> u32 {
        self.jobset_repeats
            .get(&format!("{project}:{jobset}"))
            .copied()
            .unwrap_or(1)
            .max(1)
    }

    pub fn send_lock_timeout(&self) -> Duration {
        Duration::from_secs(self.send_lock_timeout)
    }
}

fn set_from_env<T: std::str::FromStr>(var: &str, target: &mut T) {
    if let Some(value) = std::env::var(var).ok().and_then(|v| v.parse().ok()) {
        *target = value;
    }
}

/// Parse `project:jobset=count` pairs separated by commas.
fn parse_jobset_repeats(spec: &str) -> HashMap<String, u32> {
    spec.split(',')
        .filter_map(|entry| {
            let (key, count) = entry.trim().split_once('=')?;
            let count: u32 = count.parse().ok()?;
            key.contains(':').then(|| (key.to_string(), count))
        })
        .collect()
}

fn num_cpus() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_grows_geometrically() {
        let config = RunnerConfig::default();
        assert_eq!(config.retry_delay(1), Duration::from_secs(60));
        assert_eq!(config.retry_delay(2), Duration::from_secs(180));
        assert_eq!(config.retry_delay(3), Duration::from_secs(540));
    }

    #[test]
    fn jobset_repeats_parsing() {
        let repeats = parse_jobset_repeats("nixpkgs:trunk=2, infra:staging=3,bogus,x=1");
        assert_eq!(repeats.get("nixpkgs:trunk"), Some(&2));
        assert_eq!(repeats.get("infra:staging"), Some(&3));
        assert_eq!(repeats.len(), 2);

        let mut config = RunnerConfig::default();
        config.jobset_repeats = repeats;
        assert_eq!(config.repeats_for("nixpkgs", "trunk"), 2);
        assert_eq!(config.repeats_for("other", "jobset"), 1);
    }
}
