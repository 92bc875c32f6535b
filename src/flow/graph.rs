use std::collections::HashSet;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::condition::{Condition, ConditionScope, Reference};
use super::state::{PairEvent, PairOutcome, PairState, SkipReason, StateMachine};
use crate::error::{FlowError, Result};
use crate::store::Job;

pub type OperationBody = Box<dyn Fn(&mut Job) -> Result<()>>;

/// Resource hints consumed by the environment resolver; never affect eligibility.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Directives {
    /// Processes per job.
    pub np: u32,
    pub ngpu: u32,
    pub walltime_hours: Option<f64>,
}

impl Default for Directives {
    fn default() -> Self {
        Self {
            np: 1,
            ngpu: 0,
            walltime_hours: None,
        }
    }
}

/// Named unit of work bound to a job at execution time.
pub struct Operation {
    name: String,
    body: OperationBody,
    pre: Vec<Condition>,
    post: Vec<Condition>,
    directives: Directives,
}

impl Operation {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn directives(&self) -> &Directives {
        &self.directives
    }
}

impl std::fmt::Debug for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Operation")
            .field("name", &self.name)
            .field("pre", &self.pre)
            .field("post", &self.post)
            .field("directives", &self.directives)
            .finish()
    }
}

/// Outcome of one (job, operation) pair within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairRecord {
    pub job_id: String,
    pub operation: String,
    pub outcome: PairOutcome,
    pub duration_ms: u64,
}

/// Summary of a scheduling pass, produced at the end of `run`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub records: Vec<PairRecord>,
}

impl RunReport {
    fn begin() -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4().to_string(),
            started_at: now,
            completed_at: now,
            records: Vec::new(),
        }
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &PairRecord> {
        self.records
            .iter()
            .filter(|r| r.outcome == PairOutcome::Succeeded)
    }

    pub fn skipped(&self) -> impl Iterator<Item = &PairRecord> {
        self.records
            .iter()
            .filter(|r| matches!(r.outcome, PairOutcome::Skipped(_)))
    }

    pub fn failed(&self) -> impl Iterator<Item = &PairRecord> {
        self.records.iter().filter(|r| r.outcome.is_failure())
    }

    pub fn has_failures(&self) -> bool {
        self.failed().next().is_some()
    }

    pub fn duration_ms(&self) -> i64 {
        (self.completed_at - self.started_at).num_milliseconds()
    }
}

/// Hooks for progress reporting during a run.
pub trait RunObserver {
    fn pair_started(&mut self, _job: &Job, _operation: &str) {}
    fn pair_finished(&mut self, _record: &PairRecord) {}
}

impl RunObserver for () {}

/// Registry of operations and labels, and the engine that executes them.
#[derive(Default)]
pub struct OperationGraph {
    labels: Vec<(String, Condition)>,
    operations: Vec<Operation>,
}

impl OperationGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a named label. Referenced labels and operations must already exist.
    pub fn add_label(&mut self, name: impl Into<String>, condition: Condition) -> Result<&mut Self> {
        let name = name.into();
        if self.label(&name).is_some() {
            return Err(FlowError::Configuration(format!("label '{name}' registered twice")));
        }
        self.check_references(&name, std::slice::from_ref(&condition))?;
        self.labels.push((name, condition));
        Ok(self)
    }

    /// Registers an operation.
    ///
    /// Conditions may only refer to labels and operations registered earlier,
    /// which keeps the dependency graph acyclic.
    pub fn add_operation(
        &mut self,
        name: impl Into<String>,
        body: impl Fn(&mut Job) -> Result<()> + 'static,
        preconditions: Vec<Condition>,
        postconditions: Vec<Condition>,
        directives: Directives,
    ) -> Result<&mut Self> {
        let name = name.into();
        if self.operation(&name).is_some() {
            return Err(FlowError::Configuration(format!(
                "operation '{name}' registered twice"
            )));
        }
        self.check_references(&name, &preconditions)?;
        self.check_references(&name, &postconditions)?;
        debug!("registered operation '{name}' with {directives:?}");
        self.operations.push(Operation {
            name,
            body: Box::new(body),
            pre: preconditions,
            post: postconditions,
            directives,
        });
        Ok(self)
    }

    fn check_references(&self, owner: &str, conditions: &[Condition]) -> Result<()> {
        for cond in conditions {
            for reference in cond.references() {
                let known = match reference {
                    Reference::Label(l) => self.label(l).is_some(),
                    Reference::Operation(op) => self.operation(op).is_some(),
                };
                if !known {
                    return Err(FlowError::Configuration(format!(
                        "'{owner}' refers to unknown {reference:?}"
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn operation(&self, name: &str) -> Option<&Operation> {
        self.operations.iter().find(|op| op.name == name)
    }

    pub fn operations(&self) -> impl Iterator<Item = &Operation> {
        self.operations.iter()
    }

    /// Names of the labels that currently hold for `job`.
    pub fn labels_for(&self, job: &Job) -> Vec<&str> {
        self.labels
            .iter()
            .filter(|(_, cond)| cond.eval(job, self))
            .map(|(n, _)| n.as_str())
            .collect()
    }

    /// Resolves operation names, defaulting to every registered operation.
    pub fn select(&self, names: &[String]) -> Result<Vec<&Operation>> {
        if names.is_empty() {
            return Ok(self.operations.iter().collect());
        }
        names
            .iter()
            .map(|n| {
                self.operation(n)
                    .ok_or_else(|| FlowError::Configuration(format!("unknown operation '{n}'")))
            })
            .collect()
    }

    fn postconditions_hold(&self, op: &Operation, job: &Job) -> bool {
        !op.post.is_empty() && op.post.iter().all(|c| c.eval(job, self))
    }

    fn preconditions_hold(&self, op: &Operation, job: &Job) -> bool {
        op.pre.iter().all(|c| c.eval(job, self))
    }

    /// Current state of the pair, from a fresh evaluation of its conditions.
    pub fn classify(&self, op: &Operation, job: &Job) -> PairState {
        StateMachine::classify(self.preconditions_hold(op, job), self.postconditions_hold(op, job))
    }

    /// Executes every eligible (job, operation) pair at most once.
    ///
    /// Jobs are processed in order; for each job the first eligible operation in
    /// registration order runs, then conditions are re-evaluated, so chained
    /// operations complete within one pass. A failed pair is reported and not
    /// retried until the next invocation. Configuration and integrity errors abort
    /// the pass and are returned.
    pub fn run(
        &self,
        jobs: &mut [Job],
        operations: &[&Operation],
        observer: &mut dyn RunObserver,
    ) -> Result<RunReport> {
        let mut report = RunReport::begin();
        info!(
            "run {}: {} job(s), {} operation(s)",
            report.run_id,
            jobs.len(),
            operations.len()
        );

        for job in jobs.iter_mut() {
            let mut attempted: HashSet<&str> = HashSet::new();

            while let Some(op) = operations
                .iter()
                .find(|op| !attempted.contains(op.name()) && self.classify(op, job) == PairState::Eligible)
            {
                attempted.insert(op.name());
                observer.pair_started(job, op.name());
                let record = self.execute(op, job)?;
                observer.pair_finished(&record);
                report.records.push(record);
            }

            for op in operations.iter().filter(|op| !attempted.contains(op.name())) {
                let reason = match self.classify(op, job) {
                    PairState::Done => SkipReason::AlreadyDone,
                    _ => SkipReason::Blocked,
                };
                debug!("{}/{}: skipped ({reason})", job.id(), op.name());
                let record = PairRecord {
                    job_id: job.id().to_string(),
                    operation: op.name().to_string(),
                    outcome: PairOutcome::Skipped(reason),
                    duration_ms: 0,
                };
                observer.pair_finished(&record);
                report.records.push(record);
            }
        }

        report.completed_at = Utc::now();
        Ok(report)
    }

    /// Runs one pair. Only fatal errors are returned; everything else is folded
    /// into the record.
    fn execute(&self, op: &Operation, job: &mut Job) -> Result<PairRecord> {
        let started = Instant::now();
        let finish = |job: &Job, outcome: PairOutcome| PairRecord {
            job_id: job.id().to_string(),
            operation: op.name().to_string(),
            outcome,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        // Last-moment recheck against disk; another process may have finished this pair.
        if let Err(e) = job.reload() {
            return fold_error(e, job, op).map(|o| finish(job, o));
        }
        let mut state = StateMachine::next(
            PairState::Eligible,
            PairEvent::Evaluated {
                pre: self.preconditions_hold(op, job),
                post: self.postconditions_hold(op, job),
            },
        );
        match state {
            PairState::Done => {
                info!("{}/{}: completed elsewhere, skipping", job.id(), op.name());
                return Ok(finish(job, PairOutcome::Skipped(SkipReason::CompletedElsewhere)));
            }
            PairState::Blocked => {
                return Ok(finish(job, PairOutcome::Skipped(SkipReason::Blocked)));
            }
            _ => {}
        }

        state = StateMachine::next(state, PairEvent::Start);
        info!("{}/{}: {state}", job.id(), op.name());
        let result = (op.body)(job);

        let outcome = match result {
            Ok(()) => match job.reload() {
                Ok(()) => {
                    let post = self.postconditions_hold(op, job);
                    state = StateMachine::next(state, PairEvent::Finished { post });
                    if state == PairState::Done {
                        PairOutcome::Succeeded
                    } else {
                        let e = FlowError::Incomplete {
                            operation: op.name().to_string(),
                        };
                        warn!("{}/{}: {e}", job.id(), op.name());
                        failed(&e)
                    }
                }
                Err(e) => fold_error(e, job, op)?,
            },
            Err(e) => {
                state = StateMachine::next(state, PairEvent::Aborted);
                debug!("{}/{}: back to {state}", job.id(), op.name());
                // Drop in-memory document edits the body made before failing.
                if let Err(reload) = job.reload() {
                    warn!("{}/{}: could not reload document: {reload}", job.id(), op.name());
                }
                fold_error(e, job, op)?
            }
        };

        Ok(finish(job, outcome))
    }
}

fn failed(e: &FlowError) -> PairOutcome {
    PairOutcome::Failed {
        kind: e.kind(),
        message: e.to_string(),
    }
}

fn fold_error(e: FlowError, job: &Job, op: &Operation) -> Result<PairOutcome> {
    if e.is_fatal() {
        error!("{}/{}: fatal: {e}", job.id(), op.name());
        return Err(e);
    }
    error!("{}/{}: failed: {e}", job.id(), op.name());
    Ok(failed(&e))
}

impl ConditionScope for OperationGraph {
    fn label(&self, name: &str) -> Option<&Condition> {
        self.labels.iter().find(|(n, _)| n == name).map(|(_, c)| c)
    }

    fn is_complete(&self, operation: &str, job: &Job) -> bool {
        self.operation(operation)
            .is_some_and(|op| self.postconditions_hold(op, job))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::store::{JobStore, StatePoint};
    use serde_json::json;
    use std::cell::Cell;
    use std::rc::Rc;
    use tempfile::TempDir;

    fn jobs(tmp: &TempDir, xs: &[i64]) -> Vec<Job> {
        let store = JobStore::new(tmp.path());
        xs.iter()
            .map(|x| {
                let sp: StatePoint = [("x".to_string(), json!(x))].into_iter().collect();
                store.open_or_create(&sp).unwrap()
            })
            .collect()
    }

    fn write_energies(job: &mut Job) -> Result<()> {
        std::fs::write(job.output_dir().join("energies.json"), "[]")
            .map_err(|e| FlowError::fs(job.output_dir(), e))
    }

    fn mark_done(job: &mut Job) -> Result<()> {
        job.doc_mut().set("done", true);
        job.doc().save()
    }

    fn counting(
        counter: &Rc<Cell<u32>>,
        body: fn(&mut Job) -> Result<()>,
    ) -> impl Fn(&mut Job) -> Result<()> + 'static {
        let counter = Rc::clone(counter);
        move |job: &mut Job| {
            counter.set(counter.get() + 1);
            body(job)
        }
    }

    fn two_stage(energy_calls: &Rc<Cell<u32>>, kmc_calls: &Rc<Cell<u32>>) -> OperationGraph {
        let mut graph = OperationGraph::new();
        graph
            .add_label("energies_computed", Condition::file_exists("output/energies.json"))
            .unwrap()
            .add_operation(
                "compute_energies",
                counting(energy_calls, write_energies),
                vec![],
                vec![Condition::label("energies_computed")],
                Directives::default(),
            )
            .unwrap()
            .add_operation(
                "run_charge_transport",
                counting(kmc_calls, mark_done),
                vec![Condition::completed("compute_energies")],
                vec![Condition::doc_flag("done")],
                Directives {
                    ngpu: 1,
                    ..Default::default()
                },
            )
            .unwrap();
        graph
    }

    #[test]
    fn transport_is_blocked_then_eligible_then_done() {
        let tmp = TempDir::new().unwrap();
        let mut js = jobs(&tmp, &[1]);
        let (e, k) = (Rc::new(Cell::new(0)), Rc::new(Cell::new(0)));
        let graph = two_stage(&e, &k);
        let transport = graph.operation("run_charge_transport").unwrap();

        assert_eq!(graph.classify(transport, &js[0]), PairState::Blocked);
        write_energies(&mut js[0]).unwrap();
        assert_eq!(graph.classify(transport, &js[0]), PairState::Eligible);

        let ops = graph.select(&["run_charge_transport".to_string()]).unwrap();
        let report = graph.run(&mut js, &ops, &mut ()).unwrap();
        assert_eq!(report.succeeded().count(), 1);
        assert_eq!(graph.classify(transport, &js[0]), PairState::Done);

        let again = graph.run(&mut js, &ops, &mut ()).unwrap();
        assert_eq!(k.get(), 1);
        assert_eq!(
            again.records[0].outcome,
            PairOutcome::Skipped(SkipReason::AlreadyDone)
        );
    }

    #[test]
    fn chained_operations_complete_in_one_pass() {
        let tmp = TempDir::new().unwrap();
        let mut js = jobs(&tmp, &[1, 2]);
        let (e, k) = (Rc::new(Cell::new(0)), Rc::new(Cell::new(0)));
        let graph = two_stage(&e, &k);

        let ops = graph.select(&[]).unwrap();
        let report = graph.run(&mut js, &ops, &mut ()).unwrap();
        assert_eq!(report.succeeded().count(), 4);
        assert!(!report.has_failures());
        assert_eq!((e.get(), k.get()), (2, 2));
        assert_eq!(graph.labels_for(&js[0]), vec!["energies_computed"]);
    }

    #[derive(Default)]
    struct Recorder {
        started: Vec<String>,
        finished: Vec<(String, PairOutcome)>,
    }

    impl RunObserver for Recorder {
        fn pair_started(&mut self, _job: &Job, operation: &str) {
            self.started.push(operation.to_string());
        }
        fn pair_finished(&mut self, record: &PairRecord) {
            self.finished
                .push((record.operation.clone(), record.outcome.clone()));
        }
    }

    #[test]
    fn observer_sees_every_pair_including_skips() {
        let tmp = TempDir::new().unwrap();
        let mut js = jobs(&tmp, &[1]);
        let (e, k) = (Rc::new(Cell::new(0)), Rc::new(Cell::new(0)));
        let graph = two_stage(&e, &k);
        let ops = graph.select(&[]).unwrap();

        let mut first = Recorder::default();
        let report = graph.run(&mut js, &ops, &mut first).unwrap();
        assert_eq!(first.started, vec!["compute_energies", "run_charge_transport"]);
        assert_eq!(first.finished.len(), report.records.len());

        let mut second = Recorder::default();
        let report = graph.run(&mut js, &ops, &mut second).unwrap();
        assert!(second.started.is_empty());
        assert_eq!(
            second.finished,
            vec![
                (
                    "compute_energies".to_string(),
                    PairOutcome::Skipped(SkipReason::AlreadyDone)
                ),
                (
                    "run_charge_transport".to_string(),
                    PairOutcome::Skipped(SkipReason::AlreadyDone)
                ),
            ]
        );
        assert_eq!(report.skipped().count(), 2);
    }

    #[test]
    fn completed_pairs_are_never_rerun() {
        let tmp = TempDir::new().unwrap();
        let mut js = jobs(&tmp, &[1]);
        let (e, k) = (Rc::new(Cell::new(0)), Rc::new(Cell::new(0)));
        let graph = two_stage(&e, &k);
        let ops = graph.select(&[]).unwrap();

        for _ in 0..3 {
            graph.run(&mut js, &ops, &mut ()).unwrap();
        }
        assert_eq!((e.get(), k.get()), (1, 1));
    }

    #[test]
    fn engine_failure_is_isolated_to_its_pair() {
        let tmp = TempDir::new().unwrap();
        let mut js = jobs(&tmp, &[1, 2]);
        let bad_id = js[0].id().to_string();

        let mut graph = OperationGraph::new();
        let target = bad_id.clone();
        graph
            .add_operation(
                "simulate",
                move |job: &mut Job| {
                    job.doc_mut().set("done", true);
                    if job.id() == target {
                        return Err(FlowError::Engine("transport diverged".into()));
                    }
                    job.doc().save()
                },
                vec![],
                vec![Condition::doc_flag("done")],
                Directives::default(),
            )
            .unwrap();

        let ops = graph.select(&[]).unwrap();
        let report = graph.run(&mut js, &ops, &mut ()).unwrap();

        let failed: Vec<_> = report.failed().collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].job_id, bad_id);
        assert!(matches!(
            failed[0].outcome,
            PairOutcome::Failed { kind: ErrorKind::Engine, .. }
        ));
        assert_eq!(report.succeeded().count(), 1);

        // The failing job keeps its postcondition false, in memory and on disk.
        assert!(!js[0].doc().flag("done"));
        let store = JobStore::new(tmp.path());
        assert!(!store.open(&bad_id).unwrap().doc().flag("done"));
        assert!(store.open(js[1].id()).unwrap().doc().flag("done"));
    }

    #[test]
    fn failed_pair_is_not_retried_within_a_run() {
        let tmp = TempDir::new().unwrap();
        let mut js = jobs(&tmp, &[1]);
        let calls = Rc::new(Cell::new(0));
        let mut graph = OperationGraph::new();
        graph
            .add_operation(
                "flaky",
                counting(&calls, |_| Err(FlowError::Engine("boom".into()))),
                vec![],
                vec![Condition::doc_flag("done")],
                Directives::default(),
            )
            .unwrap();

        let ops = graph.select(&[]).unwrap();
        let report = graph.run(&mut js, &ops, &mut ()).unwrap();
        assert_eq!(calls.get(), 1);
        assert!(report.has_failures());

        graph.run(&mut js, &ops, &mut ()).unwrap();
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn body_without_postcondition_effect_is_incomplete() {
        let tmp = TempDir::new().unwrap();
        let mut js = jobs(&tmp, &[1]);
        let mut graph = OperationGraph::new();
        graph
            .add_operation(
                "noop",
                |_: &mut Job| Ok(()),
                vec![],
                vec![Condition::doc_flag("done")],
                Directives::default(),
            )
            .unwrap();

        let ops = graph.select(&[]).unwrap();
        let report = graph.run(&mut js, &ops, &mut ()).unwrap();
        assert!(matches!(
            report.records[0].outcome,
            PairOutcome::Failed { kind: ErrorKind::Incomplete, .. }
        ));
    }

    #[test]
    fn fatal_error_aborts_the_run() {
        let tmp = TempDir::new().unwrap();
        let mut js = jobs(&tmp, &[1, 2]);
        let mut graph = OperationGraph::new();
        graph
            .add_operation(
                "corrupt",
                |_: &mut Job| Err(FlowError::Integrity("document checksum mismatch".into())),
                vec![],
                vec![Condition::doc_flag("done")],
                Directives::default(),
            )
            .unwrap();

        let ops = graph.select(&[]).unwrap();
        let err = graph.run(&mut js, &ops, &mut ()).unwrap_err();
        assert!(matches!(err, FlowError::Integrity(_)));
    }

    #[test]
    fn recheck_skips_pair_completed_by_another_process() {
        let tmp = TempDir::new().unwrap();
        let mut js = jobs(&tmp, &[1]);
        let calls = Rc::new(Cell::new(0));
        let mut graph = OperationGraph::new();
        graph
            .add_operation(
                "simulate",
                counting(&calls, mark_done),
                vec![],
                vec![Condition::doc_flag("done")],
                Directives::default(),
            )
            .unwrap();

        // Another process finishes the job after this one loaded it.
        let store = JobStore::new(tmp.path());
        let mut other = store.open(js[0].id()).unwrap();
        mark_done(&mut other).unwrap();
        assert!(!js[0].doc().flag("done"));

        let op = graph.operation("simulate").unwrap();
        let record = graph.execute(op, &mut js[0]).unwrap();
        assert_eq!(
            record.outcome,
            PairOutcome::Skipped(SkipReason::CompletedElsewhere)
        );
        assert_eq!(calls.get(), 0);
    }

    #[test]
    fn registration_validates_names_and_references() {
        let mut graph = OperationGraph::new();
        let err = graph
            .add_operation(
                "b",
                |_: &mut Job| Ok(()),
                vec![Condition::completed("a")],
                vec![],
                Directives::default(),
            )
            .err()
            .unwrap();
        assert!(matches!(err, FlowError::Configuration(_)));

        graph
            .add_operation("a", |_: &mut Job| Ok(()), vec![], vec![], Directives::default())
            .unwrap();
        assert!(graph
            .add_operation("a", |_: &mut Job| Ok(()), vec![], vec![], Directives::default())
            .is_err());
        assert!(graph.add_label("l", Condition::label("missing")).is_err());
        assert!(graph.select(&["nope".to_string()]).is_err());
    }
}
