//! Build machines and the machine list file.

use crate::step::Step;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Transport health of a machine. Repeated failures push `disabled_until`
/// out exponentially; one success clears it.
#[derive(Debug, Default, Clone)]
pub struct ConnectInfo {
    pub last_failure: Option<DateTime<Utc>>,
    pub disabled_until: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

/// Mutable per-machine state, shared across machine-list reloads so
/// counters and health survive a reload.
pub struct MachineState {
    pub current_jobs: AtomicU32,
    pub nr_steps_done: AtomicU64,
    /// Total seconds spent on steps, including closure copying.
    pub total_step_time: AtomicI64,
    pub total_step_build_time: AtomicI64,
    pub idle_since: AtomicI64,
    /// Cleared when the machine disappears from the machine list; the
    /// machine is dropped once its last job finishes.
    pub enabled: AtomicBool,
    connect_info: Mutex<ConnectInfo>,
    /// Serializes closure uploads to this machine.
    pub send_lock: Arc<tokio::sync::Mutex<()>>,
}

impl Default for MachineState {
    fn default() -> Self {
        Self {
            current_jobs: AtomicU32::new(0),
            nr_steps_done: AtomicU64::new(0),
            total_step_time: AtomicI64::new(0),
            total_step_build_time: AtomicI64::new(0),
            idle_since: AtomicI64::new(Utc::now().timestamp()),
            enabled: AtomicBool::new(true),
            connect_info: Mutex::new(ConnectInfo::default()),
            send_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }
}

impl MachineState {
    pub fn connect_info(&self) -> ConnectInfo {
        self.connect_info.lock().clone()
    }

    /// Record a transport-level failure and extend the cooldown:
    /// `base * 2^consecutive_failures`, exponent capped.
    pub fn note_failure(&self, now: DateTime<Utc>, base_cooldown: u64, max_exp: u32) {
        let mut info = self.connect_info.lock();
        let exp = info.consecutive_failures.min(max_exp);
        let cooldown = base_cooldown.saturating_mul(1 << exp);
        info.last_failure = Some(now);
        info.disabled_until = Some(now + ChronoDuration::seconds(cooldown as i64));
        info.consecutive_failures = info.consecutive_failures.saturating_add(1);
    }

    pub fn note_success(&self) {
        let mut info = self.connect_info.lock();
        info.disabled_until = None;
        info.consecutive_failures = 0;
    }

    pub fn in_backoff(&self, now: DateTime<Utc>) -> bool {
        self.connect_info
            .lock()
            .disabled_until
            .is_some_and(|until| now < until)
    }
}

/// A build machine: immutable identity from the machine list plus shared
/// mutable state.
pub struct Machine {
    pub store_uri: String,
    pub system_types: BTreeSet<String>,
    pub ssh_key: Option<String>,
    pub max_jobs: u32,
    pub speed_factor: f32,
    pub supported_features: BTreeSet<String>,
    pub mandatory_features: BTreeSet<String>,
    pub public_host_key: Option<String>,
    pub state: Arc<MachineState>,
}

impl Machine {
    /// Capability check: can this machine in principle run `step`?
    /// Transport health is checked separately so that unsupported-step
    /// aging is not confused by temporary backoff.
    pub fn supports_step(&self, this_system: &str, step: &Step) -> bool {
        if !self.system_types.contains(step.platform(this_system)) {
            return false;
        }

        // A machine with a mandatory feature runs *only* steps requiring
        // that feature. The sentinel `local` is satisfied by steps that
        // prefer a local build.
        for feature in &self.mandatory_features {
            if !step.options.required_system_features.contains(feature)
                && !(feature == "local" && step.options.prefer_local_build)
            {
                return false;
            }
        }

        step.options
            .required_system_features
            .iter()
            .all(|f| self.supported_features.contains(f))
    }

    /// Whether the dispatcher may hand work to this machine right now.
    pub fn available(&self, now: DateTime<Utc>) -> bool {
        self.state.enabled.load(Ordering::SeqCst) && !self.state.in_backoff(now)
    }

    pub fn current_jobs(&self) -> u32 {
        self.state.current_jobs.load(Ordering::SeqCst)
    }

    pub fn load_ratio(&self) -> f64 {
        self.current_jobs() as f64 / self.max_jobs.max(1) as f64
    }
}

/// Parse the machine list. Line format, whitespace separated:
///
/// ```text
/// storeURI systemTypes sshKey maxJobs speedFactor supportedFeatures mandatoryFeatures publicHostKey
/// ```
///
/// List fields are comma separated; `-` or a missing field means empty (or
/// 1 for the numeric fields). `#` starts a comment. Malformed lines are
/// skipped with a warning rather than poisoning the whole file.
pub fn parse_machines(contents: &str) -> Vec<Machine> {
    let mut machines = Vec::new();
    for (lineno, line) in contents.lines().enumerate() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        let store_uri = fields[0].to_string();
        let system_types = list_field(&fields, 1);
        if system_types.is_empty() {
            warn!(line = lineno + 1, uri = %store_uri, "machine line lacks system types, skipping");
            continue;
        }
        let max_jobs = match opt_field(&fields, 3).map(str::parse).transpose() {
            Ok(n) => n.unwrap_or(1),
            Err(_) => {
                warn!(line = lineno + 1, uri = %store_uri, "bad maxJobs field, skipping");
                continue;
            }
        };
        let speed_factor = match opt_field(&fields, 4).map(str::parse).transpose() {
            Ok(f) => f.unwrap_or(1.0),
            Err(_) => {
                warn!(line = lineno + 1, uri = %store_uri, "bad speedFactor field, skipping");
                continue;
            }
        };
        machines.push(Machine {
            store_uri,
            system_types,
            ssh_key: opt_field(&fields, 2).map(str::to_string),
            max_jobs: max_jobs.max(1),
            speed_factor,
            supported_features: list_field(&fields, 5),
            mandatory_features: list_field(&fields, 6),
            public_host_key: opt_field(&fields, 7).map(str::to_string),
            state: Arc::new(MachineState::default()),
        });
    }
    // Mandatory features are implicitly supported.
    for machine in &mut machines {
        let mandatory = machine.mandatory_features.clone();
        machine.supported_features.extend(mandatory);
    }
    machines
}

/// Periodic task: re-read the machine list file and reconcile the machine
/// registry against it.
pub async fn machine_reloader(scheduler: std::sync::Arc<crate::state::Scheduler>) {
    let interval = std::time::Duration::from_secs(scheduler.config.machines_reload_interval.max(1));
    loop {
        if let Err(e) = reload_machines_file(&scheduler).await {
            warn!(error = %e, "could not reload machines file");
        }
        tokio::time::sleep(interval).await;
    }
}

async fn reload_machines_file(scheduler: &crate::state::Scheduler) -> std::io::Result<()> {
    let Some(path) = &scheduler.config.machines_file else {
        return Ok(());
    };
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "machines file missing; treating as empty");
            String::new()
        }
        Err(e) => return Err(e),
    };
    apply_machine_list(scheduler, &contents);
    Ok(())
}

/// Install added machines and retire removed ones. A retired machine with
/// jobs in flight stays (disabled) until its last job finishes; per-machine
/// state survives a reload so health and counters are not reset.
pub fn apply_machine_list(scheduler: &crate::state::Scheduler, contents: &str) {
    use std::collections::HashMap;
    use std::sync::Arc;

    let parsed = parse_machines(contents);
    let mut registry = scheduler.machines.lock();
    let mut next: HashMap<String, Arc<Machine>> = HashMap::new();
    for mut machine in parsed {
        if let Some(old) = registry.get(&machine.store_uri) {
            machine.state = old.state.clone();
            machine.state.enabled.store(true, Ordering::SeqCst);
        } else {
            tracing::info!(uri = %machine.store_uri, max_jobs = machine.max_jobs, "adding machine");
        }
        next.insert(machine.store_uri.clone(), Arc::new(machine));
    }
    for (uri, old) in registry.iter() {
        if !next.contains_key(uri) {
            old.state.enabled.store(false, Ordering::SeqCst);
            if old.current_jobs() > 0 {
                next.insert(uri.clone(), old.clone());
            } else {
                tracing::info!(uri = %uri, "removing machine");
            }
        }
    }
    *registry = next;
    drop(registry);
    scheduler.dispatcher_wake.wake();
}

fn opt_field<'a>(fields: &[&'a str], idx: usize) -> Option<&'a str> {
    fields.get(idx).copied().filter(|f| *f != "-")
}

fn list_field(fields: &[&str], idx: usize) -> BTreeSet<String> {
    opt_field(fields, idx)
        .map(|f| f.split(',').filter(|s| !s.is_empty()).map(str::to_string).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_store::{Derivation, StorePath};

    fn step_with(platform: &str, features: &[&str], prefer_local: bool) -> Step {
        let mut env = std::collections::BTreeMap::new();
        if !features.is_empty() {
            env.insert("requiredSystemFeatures".to_string(), features.join(" "));
        }
        if prefer_local {
            env.insert("preferLocalBuild".to_string(), "1".to_string());
        }
        let drv = Derivation {
            name: "t".into(),
            platform: platform.into(),
            builder: "/bin/sh".into(),
            env,
            ..Default::default()
        };
        Step::new(StorePath::derive("t.drv", "t"), drv, "x86_64-linux")
    }

    #[test]
    fn parses_full_and_defaulted_lines() {
        let machines = parse_machines(
            "# fleet\n\
             ssh://build1 x86_64-linux,i686-linux /key 4 2 kvm,benchmark benchmark hostkey\n\
             ssh://build2 aarch64-linux\n\
             \n\
             ssh://build3 x86_64-linux - - - - - -  # trailing comment\n",
        );
        assert_eq!(machines.len(), 3);

        let m1 = &machines[0];
        assert_eq!(m1.store_uri, "ssh://build1");
        assert_eq!(m1.max_jobs, 4);
        assert_eq!(m1.speed_factor, 2.0);
        assert!(m1.system_types.contains("i686-linux"));
        assert!(m1.supported_features.contains("kvm"));
        assert!(m1.supported_features.contains("benchmark"));
        assert!(m1.mandatory_features.contains("benchmark"));
        assert_eq!(m1.ssh_key.as_deref(), Some("/key"));

        let m2 = &machines[1];
        assert_eq!(m2.max_jobs, 1);
        assert_eq!(m2.speed_factor, 1.0);
        assert!(m2.supported_features.is_empty());
        assert!(m2.ssh_key.is_none());

        assert!(machines[2].ssh_key.is_none());
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let machines = parse_machines(
            "ssh://bad x86_64-linux - notanumber\n\
             ssh://good x86_64-linux\n",
        );
        assert_eq!(machines.len(), 1);
        assert_eq!(machines[0].store_uri, "ssh://good");
    }

    #[test]
    fn supports_step_checks_platform_and_features() {
        let machines = parse_machines("ssh://m x86_64-linux - 1 1 kvm");
        let m = &machines[0];

        assert!(m.supports_step("x86_64-linux", &step_with("x86_64-linux", &[], false)));
        assert!(m.supports_step("x86_64-linux", &step_with("x86_64-linux", &["kvm"], false)));
        assert!(!m.supports_step("x86_64-linux", &step_with("x86_64-linux", &["cuda"], false)));
        assert!(!m.supports_step("x86_64-linux", &step_with("aarch64-linux", &[], false)));
        // builtin platform resolves to the runner's own system
        assert!(m.supports_step("x86_64-linux", &step_with("builtin", &[], false)));
    }

    #[test]
    fn mandatory_features_restrict_the_machine() {
        let machines = parse_machines("ssh://bench x86_64-linux - 1 1 - benchmark");
        let m = &machines[0];
        assert!(!m.supports_step("x86_64-linux", &step_with("x86_64-linux", &[], false)));
        assert!(m.supports_step("x86_64-linux", &step_with("x86_64-linux", &["benchmark"], false)));

        let machines = parse_machines("ssh://local x86_64-linux - 1 1 - local");
        let m = &machines[0];
        assert!(!m.supports_step("x86_64-linux", &step_with("x86_64-linux", &[], false)));
        assert!(m.supports_step("x86_64-linux", &step_with("x86_64-linux", &[], true)));
    }

    #[test]
    fn reload_keeps_state_and_retires_busy_machines_lazily() {
        use crate::config::RunnerConfig;
        use crate::state::test_support::make_scheduler;

        let (scheduler, _, _, _) = make_scheduler(RunnerConfig::default());
        apply_machine_list(&scheduler, "mem://a x86_64-linux\nmem://b x86_64-linux\n");
        assert_eq!(scheduler.machines.lock().len(), 2);

        let a = scheduler.machines.lock().get("mem://a").unwrap().clone();
        a.state.nr_steps_done.store(5, Ordering::Relaxed);
        let b = scheduler.machines.lock().get("mem://b").unwrap().clone();
        b.state.current_jobs.store(1, Ordering::SeqCst);

        // a stays (with its counters), b is gone from the list but busy
        apply_machine_list(&scheduler, "mem://a x86_64-linux,aarch64-linux\n");
        {
            let registry = scheduler.machines.lock();
            let a2 = registry.get("mem://a").unwrap();
            assert_eq!(a2.state.nr_steps_done.load(Ordering::Relaxed), 5);
            assert!(a2.system_types.contains("aarch64-linux"));
            let b2 = registry.get("mem://b").unwrap();
            assert!(!b2.state.enabled.load(Ordering::SeqCst));
        }

        // once idle, the retired machine is dropped on the next reload
        b.state.current_jobs.store(0, Ordering::SeqCst);
        apply_machine_list(&scheduler, "mem://a x86_64-linux\n");
        assert!(scheduler.machines.lock().get("mem://b").is_none());
    }

    #[test]
    fn backoff_doubles_and_resets() {
        let state = MachineState::default();
        let now = Utc::now();

        state.note_failure(now, 30, 7);
        let until1 = state.connect_info().disabled_until.unwrap();
        assert_eq!((until1 - now).num_seconds(), 30);
        assert!(state.in_backoff(now));

        state.note_failure(now, 30, 7);
        let until2 = state.connect_info().disabled_until.unwrap();
        assert_eq!((until2 - now).num_seconds(), 60);

        // exponent cap
        for _ in 0..20 {
            state.note_failure(now, 30, 7);
        }
        let capped = state.connect_info().disabled_until.unwrap();
        assert_eq!((capped - now).num_seconds(), 30 * 128);

        state.note_success();
        assert!(!state.in_backoff(now));
        assert_eq!(state.connect_info().consecutive_failures, 0);
    }
}
