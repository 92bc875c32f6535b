//! Execution environment detection and submission parameter resolution.
//!
//! Environments are plain descriptors: a hostname pattern plus scheduler
//! defaults. Resolution merges an operation's directives with those defaults
//! and any command-line overrides; it never looks at job state.

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{FlowError, Result};
use crate::flow::Directives;

pub const LOCAL: &str = "local";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheduler {
    /// Runs in the current process; nothing to submit to.
    #[default]
    None,
    Slurm,
}

/// Declarative environment entry, as written in `morphflow.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentSpec {
    pub name: String,
    #[serde(default)]
    pub hostname_pattern: Option<String>,
    #[serde(default)]
    pub scheduler: Scheduler,
    #[serde(default)]
    pub partition: Option<String>,
    #[serde(default)]
    pub nodes: Option<u32>,
    /// GPU model prefix for `--gpus`, e.g. `v100-32`.
    #[serde(default)]
    pub gpu_type: Option<String>,
    #[serde(default)]
    pub extra_flags: Vec<String>,
}

/// A compiled environment descriptor.
#[derive(Debug, Clone)]
pub struct Environment {
    spec: EnvironmentSpec,
    pattern: Option<Regex>,
}

impl Environment {
    pub fn compile(spec: EnvironmentSpec) -> Result<Self> {
        let pattern = spec
            .hostname_pattern
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| {
                FlowError::Configuration(format!("environment '{}': bad hostname pattern: {e}", spec.name))
            })?;
        Ok(Self { spec, pattern })
    }

    pub fn local() -> Self {
        Self {
            spec: EnvironmentSpec {
                name: LOCAL.to_string(),
                ..Default::default()
            },
            pattern: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn scheduler(&self) -> Scheduler {
        self.spec.scheduler
    }

    pub fn matches_host(&self, hostname: &str) -> bool {
        self.pattern.as_ref().is_some_and(|re| re.is_match(hostname))
    }

    /// Merges directives, environment defaults and overrides, in increasing precedence.
    pub fn resolve_submission(
        &self,
        operation: &str,
        directives: &Directives,
        overrides: &SubmissionOverrides,
    ) -> SubmissionSpec {
        let mut extra_flags = self.spec.extra_flags.clone();
        extra_flags.extend(overrides.extra_flags.iter().cloned());

        SubmissionSpec {
            environment: self.spec.name.clone(),
            operation: operation.to_string(),
            scheduler: self.spec.scheduler,
            partition: overrides
                .partition
                .clone()
                .or_else(|| self.spec.partition.clone()),
            nodes: overrides.nodes.or(self.spec.nodes).unwrap_or(1),
            ntasks: directives.np.max(1),
            gpus: directives.ngpu,
            gpu_type: self.spec.gpu_type.clone(),
            nodelist: overrides.nodelist.clone(),
            walltime_hours: overrides.walltime_hours.or(directives.walltime_hours),
            extra_flags,
        }
    }
}

/// User-supplied values that take precedence over environment defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubmissionOverrides {
    pub partition: Option<String>,
    pub nodelist: Option<String>,
    pub nodes: Option<u32>,
    pub walltime_hours: Option<f64>,
    pub extra_flags: Vec<String>,
}

/// Everything a batch scheduler needs to run one operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmissionSpec {
    pub environment: String,
    pub operation: String,
    pub scheduler: Scheduler,
    pub partition: Option<String>,
    pub nodes: u32,
    pub ntasks: u32,
    pub gpus: u32,
    pub gpu_type: Option<String>,
    pub nodelist: Option<String>,
    pub walltime_hours: Option<f64>,
    pub extra_flags: Vec<String>,
}

impl SubmissionSpec {
    /// Renders the spec as `sbatch` arguments.
    pub fn sbatch_args(&self, job_name: &str) -> Vec<String> {
        let mut args = vec![
            format!("--job-name={job_name}"),
            format!("--nodes={}", self.nodes),
            format!("--ntasks={}", self.ntasks),
        ];
        if let Some(p) = &self.partition {
            args.push(format!("--partition={p}"));
        }
        if self.gpus > 0 {
            match &self.gpu_type {
                Some(kind) => args.push(format!("--gpus={kind}:{}", self.gpus)),
                None => args.push(format!("--gpus={}", self.gpus)),
            }
        }
        if let Some(nodes) = &self.nodelist {
            args.push(format!("--nodelist={nodes}"));
        }
        if let Some(hours) = self.walltime_hours {
            let minutes = (hours * 60.0).ceil() as u64;
            args.push(format!("--time={:02}:{:02}:00", minutes / 60, minutes % 60));
        }
        args.extend(self.extra_flags.iter().cloned());
        args
    }
}

/// Known environments plus the local fallback.
#[derive(Debug, Clone)]
pub struct EnvironmentRegistry {
    environments: Vec<Environment>,
}

impl EnvironmentRegistry {
    /// Built-in cluster table followed by `extra`. Later entries with the same
    /// name replace earlier ones.
    pub fn new(extra: &[EnvironmentSpec]) -> Result<Self> {
        let mut registry = Self {
            environments: Vec::new(),
        };
        for spec in builtin_specs().into_iter().chain(extra.iter().cloned()) {
            if spec.name == LOCAL {
                return Err(FlowError::Configuration(format!(
                    "environment name '{LOCAL}' is reserved"
                )));
            }
            let env = Environment::compile(spec)?;
            registry.environments.retain(|e| e.name() != env.name());
            registry.environments.push(env);
        }
        Ok(registry)
    }

    #[allow(dead_code)]
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.environments.iter().map(Environment::name)
    }

    pub fn get(&self, name: &str) -> Result<Environment> {
        if name == LOCAL {
            return Ok(Environment::local());
        }
        self.environments
            .iter()
            .find(|e| e.name() == name)
            .cloned()
            .ok_or_else(|| FlowError::Configuration(format!("unknown environment '{name}'")))
    }

    /// First environment whose pattern matches `hostname`, else local.
    pub fn detect_for(&self, hostname: &str) -> Environment {
        let env = self
            .environments
            .iter()
            .find(|e| e.matches_host(hostname))
            .cloned()
            .unwrap_or_else(Environment::local);
        debug!("host '{hostname}' resolved to environment '{}'", env.name());
        env
    }

    pub fn detect(&self) -> Environment {
        match current_hostname() {
            Some(host) => self.detect_for(&host),
            None => {
                info!("hostname unavailable, using local environment");
                Environment::local()
            }
        }
    }
}

fn current_hostname() -> Option<String> {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
}

fn builtin_specs() -> Vec<EnvironmentSpec> {
    vec![
        EnvironmentSpec {
            name: "bridges2".into(),
            hostname_pattern: Some(r".*\.bridges2\.psc\.edu$".into()),
            scheduler: Scheduler::Slurm,
            partition: Some("GPU-shared".into()),
            gpu_type: Some("v100-32".into()),
            ..Default::default()
        },
        EnvironmentSpec {
            name: "fry".into(),
            hostname_pattern: Some(r"fry\.boisestate\.edu".into()),
            scheduler: Scheduler::Slurm,
            partition: Some("batch".into()),
            ..Default::default()
        },
        EnvironmentSpec {
            name: "kestrel".into(),
            hostname_pattern: Some("kestrel".into()),
            scheduler: Scheduler::Slurm,
            partition: Some("batch".into()),
            ..Default::default()
        },
    ]
}
