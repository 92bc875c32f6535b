use std::path::{Path, PathBuf};
use std::process::Command;
use std::rc::Rc;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::{INDEX_FILE, ProjectConfig};
use crate::engine::SimulationEngine;
use crate::environment::{
    Environment, EnvironmentRegistry, Scheduler, SubmissionOverrides, SubmissionSpec,
};
use crate::error::{FlowError, Result};
use crate::flow::{OperationGraph, PairState, RunObserver, RunReport};
use crate::store::{Job, JobFilter, JobStore, StatePointIndex, StatusCache};
use crate::transport::{self, TransportContext};

/// Which jobs a command applies to.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub filter: JobFilter,
    /// Job id prefixes; empty means every job.
    pub job_ids: Vec<String>,
}

impl Selection {
    fn matches_id(&self, id: &str) -> bool {
        self.job_ids.is_empty() || self.job_ids.iter().any(|p| id.starts_with(p.as_str()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InitSummary {
    pub total: usize,
    pub created: usize,
    pub failed: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobStatus {
    pub job_id: String,
    pub labels: Vec<String>,
    pub operations: Vec<(String, PairState)>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum SubmissionStatus {
    Pretend,
    Submitted(String),
    Failed(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct Submission {
    pub job_id: String,
    pub spec: SubmissionSpec,
    pub command: Vec<String>,
    pub status: SubmissionStatus,
}

/// Aggregate root: the job store, the operation graph and the active environment.
pub struct Project {
    dir: PathBuf,
    config: ProjectConfig,
    store: JobStore,
    graph: OperationGraph,
    environments: EnvironmentRegistry,
}

impl Project {
    pub fn open(dir: &Path, config: ProjectConfig, engine: Rc<dyn SimulationEngine>) -> Result<Self> {
        let store = JobStore::new(dir.join(&config.workspace));
        let environments = EnvironmentRegistry::new(&config.environments)?;
        let mut graph = OperationGraph::new();
        transport::register(
            &mut graph,
            TransportContext {
                engine,
                project_dir: dir.to_path_buf(),
                kmc_verbosity: config.kmc_verbosity,
            },
        )?;
        debug!("opened project '{}' at {}", config.name, dir.display());
        Ok(Self {
            dir: dir.to_path_buf(),
            config,
            store,
            graph,
            environments,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    #[allow(dead_code)]
    pub fn store(&self) -> &JobStore {
        &self.store
    }

    pub fn index_path(&self) -> PathBuf {
        self.dir.join(INDEX_FILE)
    }

    /// Expands the parameter space, creates or attaches every job and writes the index.
    ///
    /// Every state point is validated first, so a configuration error leaves the
    /// workspace untouched. A job whose workspace cannot be created is reported
    /// and the others continue.
    pub fn init(&self) -> Result<InitSummary> {
        let points = self.config.parameter_space()?.expand();
        transport::validate_statepoints(&points)?;

        let mut created = 0;
        let mut failed = Vec::new();
        for sp in &points {
            let existed = self.store.root().join(sp.fingerprint()).exists();
            match self.store.open_or_create(sp) {
                Ok(_) if !existed => created += 1,
                Ok(_) => {}
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    error!("job {}: {e}", sp.fingerprint());
                    failed.push(sp.fingerprint());
                }
            }
        }

        self.write_statepoint_index()?;
        info!("initialized {} job(s), {created} new", points.len());
        Ok(InitSummary {
            total: points.len(),
            created,
            failed,
        })
    }

    /// Persists every known state point to the project-level index.
    pub fn write_statepoint_index(&self) -> Result<()> {
        let jobs = self.store.list_jobs(&JobFilter::all())?;
        StatePointIndex::from_jobs(&jobs).write(&self.index_path())
    }

    pub fn select_jobs(&self, selection: &Selection) -> Result<Vec<Job>> {
        let jobs: Vec<Job> = self
            .store
            .list_jobs(&selection.filter)?
            .into_iter()
            .filter(|j| selection.matches_id(j.id()))
            .collect();
        if jobs.is_empty() {
            warn!("no jobs match the selection");
        }
        Ok(jobs)
    }

    pub fn run(
        &self,
        operations: &[String],
        selection: &Selection,
        observer: &mut dyn RunObserver,
    ) -> Result<RunReport> {
        let ops = self.graph.select(operations)?;
        let mut jobs = self.select_jobs(selection)?;
        transport::validate_statepoints(jobs.iter().map(Job::statepoint))?;

        let report = self.graph.run(&mut jobs, &ops, observer)?;
        self.flush_status(&jobs)?;
        Ok(report)
    }

    pub fn status(&self, selection: &Selection) -> Result<Vec<JobStatus>> {
        let jobs = self.select_jobs(selection)?;
        let statuses = jobs
            .iter()
            .map(|job| JobStatus {
                job_id: job.id().to_string(),
                labels: self.graph.labels_for(job).into_iter().map(String::from).collect(),
                operations: self
                    .graph
                    .operations()
                    .map(|op| (op.name().to_string(), self.graph.classify(op, job)))
                    .collect(),
            })
            .collect();
        self.flush_status(&jobs)?;
        Ok(statuses)
    }

    pub fn cached_status(&self) -> Result<Option<StatusCache>> {
        StatusCache::load(&StatusCache::path_in(&self.dir))
    }

    fn flush_status(&self, jobs: &[Job]) -> Result<()> {
        let mut cache = StatusCache::new();
        for job in jobs {
            for op in self.graph.operations() {
                cache.record(job.id(), op.name(), self.graph.classify(op, job));
            }
        }
        cache.merge_into(&StatusCache::path_in(&self.dir))
    }

    /// The named environment, or the one detected from the host.
    pub fn environment(&self, name: Option<&str>) -> Result<Environment> {
        match name {
            Some(name) => self.environments.get(name),
            None => Ok(self.environments.detect()),
        }
    }

    /// Hands every eligible (job, operation) pair to the environment's scheduler.
    pub fn submit(
        &self,
        environment: &Environment,
        operations: &[String],
        selection: &Selection,
        overrides: &SubmissionOverrides,
        pretend: bool,
    ) -> Result<Vec<Submission>> {
        if environment.scheduler() == Scheduler::None && !pretend {
            return Err(FlowError::Configuration(format!(
                "environment '{}' has no batch scheduler; use `run` or pick one with --environment",
                environment.name()
            )));
        }
        let ops = self.graph.select(operations)?;
        let jobs = self.select_jobs(selection)?;
        transport::validate_statepoints(jobs.iter().map(Job::statepoint))?;

        let exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("morphflow"));
        let mut submissions = Vec::new();
        for job in &jobs {
            // Only the first eligible operation; later ones depend on it.
            let Some(op) = ops
                .iter()
                .find(|op| self.graph.classify(op, job) == PairState::Eligible)
            else {
                continue;
            };

            let spec = environment.resolve_submission(op.name(), op.directives(), overrides);
            let job_name = format!("{}-{}-{}", self.config.name, op.name(), &job.id()[..8]);
            let wrap = format!(
                "{} --project-dir {} run --operation {} --job-id {}",
                shell_quote(&exe.to_string_lossy()),
                shell_quote(&self.dir.to_string_lossy()),
                op.name(),
                job.id()
            );
            let mut command = vec!["sbatch".to_string()];
            command.extend(spec.sbatch_args(&job_name));
            command.push(format!("--wrap={wrap}"));

            let status = if pretend {
                SubmissionStatus::Pretend
            } else {
                hand_off(&command)
            };
            submissions.push(Submission {
                job_id: job.id().to_string(),
                spec,
                command,
                status,
            });
        }
        Ok(submissions)
    }
}

/// Quotes `word` for a POSIX shell unless it is made only of safe characters.
fn shell_quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "/._-+:=@%,".contains(c));
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

fn hand_off(command: &[String]) -> SubmissionStatus {
    let Some((program, args)) = command.split_first() else {
        return SubmissionStatus::Failed("empty command".into());
    };
    match Command::new(program).args(args).output() {
        Ok(out) if out.status.success() => {
            SubmissionStatus::Submitted(String::from_utf8_lossy(&out.stdout).trim().to_string())
        }
        Ok(out) => SubmissionStatus::Failed(String::from_utf8_lossy(&out.stderr).trim().to_string()),
        Err(e) => SubmissionStatus::Failed(format!("cannot run {program}: {e}")),
    }
}
