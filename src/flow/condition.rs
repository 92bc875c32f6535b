use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::store::Job;

type PredicateFn = Arc<dyn Fn(&Job) -> bool + Send + Sync>;

/// Resolves named references inside a [`Condition`].
///
/// Implemented by the operation graph so conditions can refer to labels and to
/// other operations' completion without holding on to them.
pub trait ConditionScope {
    fn label(&self, name: &str) -> Option<&Condition>;
    fn is_complete(&self, operation: &str, job: &Job) -> bool;
}

/// Cheap boolean check over a job's persisted state.
///
/// Conditions never mutate the job and never touch the simulation engine;
/// they are evaluated on every scheduling pass.
#[derive(Clone)]
pub enum Condition {
    /// Always holds.
    #[allow(dead_code)]
    Always,
    /// A file exists, relative to the job workspace.
    FileExists(PathBuf),
    /// A document key holds the boolean `true`.
    DocFlag(String),
    /// A document key is present, whatever its value.
    DocKey(String),
    /// A label registered on the graph.
    Label(String),
    /// The named operation's postconditions all hold.
    Completed(String),
    /// Arbitrary named predicate.
    Predicate { name: String, check: PredicateFn },
    All(Vec<Condition>),
    Any(Vec<Condition>),
    Not(Box<Condition>),
}

impl Condition {
    pub fn file_exists(rel: impl Into<PathBuf>) -> Self {
        Condition::FileExists(rel.into())
    }

    pub fn doc_flag(key: impl Into<String>) -> Self {
        Condition::DocFlag(key.into())
    }

    #[allow(dead_code)]
    pub fn doc_key(key: impl Into<String>) -> Self {
        Condition::DocKey(key.into())
    }

    pub fn label(name: impl Into<String>) -> Self {
        Condition::Label(name.into())
    }

    pub fn completed(operation: impl Into<String>) -> Self {
        Condition::Completed(operation.into())
    }

    #[allow(dead_code)]
    pub fn predicate(
        name: impl Into<String>,
        check: impl Fn(&Job) -> bool + Send + Sync + 'static,
    ) -> Self {
        Condition::Predicate {
            name: name.into(),
            check: Arc::new(check),
        }
    }

    #[allow(dead_code)]
    pub fn and(self, other: Condition) -> Self {
        match self {
            Condition::All(mut items) => {
                items.push(other);
                Condition::All(items)
            }
            first => Condition::All(vec![first, other]),
        }
    }

    #[allow(dead_code)]
    pub fn or(self, other: Condition) -> Self {
        match self {
            Condition::Any(mut items) => {
                items.push(other);
                Condition::Any(items)
            }
            first => Condition::Any(vec![first, other]),
        }
    }

    #[allow(dead_code)]
    pub fn negate(self) -> Self {
        Condition::Not(Box::new(self))
    }

    pub fn eval(&self, job: &Job, scope: &dyn ConditionScope) -> bool {
        match self {
            Condition::Always => true,
            Condition::FileExists(rel) => job.path(rel).exists(),
            Condition::DocFlag(key) => job.doc().flag(key),
            Condition::DocKey(key) => job.doc().contains(key),
            Condition::Label(name) => scope
                .label(name)
                .is_some_and(|cond| cond.eval(job, scope)),
            Condition::Completed(op) => scope.is_complete(op, job),
            Condition::Predicate { check, .. } => check(job),
            Condition::All(items) => items.iter().all(|c| c.eval(job, scope)),
            Condition::Any(items) => items.iter().any(|c| c.eval(job, scope)),
            Condition::Not(inner) => !inner.eval(job, scope),
        }
    }

    /// Labels and operations this condition refers to by name.
    pub(crate) fn references(&self) -> Vec<Reference<'_>> {
        let mut refs = Vec::new();
        self.collect_references(&mut refs);
        refs
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<Reference<'a>>) {
        match self {
            Condition::Label(name) => out.push(Reference::Label(name)),
            Condition::Completed(op) => out.push(Reference::Operation(op)),
            Condition::All(items) | Condition::Any(items) => {
                items.iter().for_each(|c| c.collect_references(out))
            }
            Condition::Not(inner) => inner.collect_references(out),
            _ => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Reference<'a> {
    Label(&'a str),
    Operation(&'a str),
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |f: &mut fmt::Formatter<'_>, items: &[Condition], sep: &str| {
            write!(f, "(")?;
            for (i, c) in items.iter().enumerate() {
                if i > 0 {
                    write!(f, " {sep} ")?;
                }
                write!(f, "{c}")?;
            }
            write!(f, ")")
        };
        match self {
            Condition::Always => write!(f, "always"),
            Condition::FileExists(rel) => write!(f, "exists({})", rel.display()),
            Condition::DocFlag(key) => write!(f, "doc.{key}"),
            Condition::DocKey(key) => write!(f, "has(doc.{key})"),
            Condition::Label(name) => write!(f, "{name}"),
            Condition::Completed(op) => write!(f, "completed({op})"),
            Condition::Predicate { name, .. } => write!(f, "{name}"),
            Condition::All(items) => join(f, items, "and"),
            Condition::Any(items) => join(f, items, "or"),
            Condition::Not(inner) => write!(f, "not {inner}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{JobStore, StatePoint};
    use serde_json::json;
    use std::collections::HashMap;
    use tempfile::TempDir;

    struct Scope {
        labels: HashMap<String, Condition>,
        complete: Vec<String>,
    }

    impl ConditionScope for Scope {
        fn label(&self, name: &str) -> Option<&Condition> {
            self.labels.get(name)
        }
        fn is_complete(&self, operation: &str, _job: &Job) -> bool {
            self.complete.iter().any(|c| c == operation)
        }
    }

    fn empty_scope() -> Scope {
        Scope {
            labels: HashMap::new(),
            complete: Vec::new(),
        }
    }

    fn job(tmp: &TempDir) -> Job {
        let sp: StatePoint = [("temperature".to_string(), json!(300))].into_iter().collect();
        JobStore::new(tmp.path()).open_or_create(&sp).unwrap()
    }

    #[test]
    fn file_and_document_conditions() {
        let tmp = TempDir::new().unwrap();
        let mut job = job(&tmp);
        let scope = empty_scope();

        let energies = Condition::file_exists("output/energies.json");
        assert!(!energies.eval(&job, &scope));
        std::fs::write(job.output_dir().join("energies.json"), "{}").unwrap();
        assert!(energies.eval(&job, &scope));

        assert!(!Condition::doc_flag("done").eval(&job, &scope));
        job.doc_mut().set("done", false);
        assert!(!Condition::doc_flag("done").eval(&job, &scope));
        assert!(Condition::doc_key("done").eval(&job, &scope));
        job.doc_mut().set("done", true);
        assert!(Condition::doc_flag("done").eval(&job, &scope));
    }

    #[test]
    fn boolean_composition() {
        let tmp = TempDir::new().unwrap();
        let job = job(&tmp);
        let scope = empty_scope();
        let yes = Condition::Always;
        let no = Condition::doc_flag("done");

        assert!(!yes.clone().and(no.clone()).eval(&job, &scope));
        assert!(yes.clone().or(no.clone()).eval(&job, &scope));
        assert!(no.clone().negate().eval(&job, &scope));
        assert!(Condition::All(vec![]).eval(&job, &scope));
        assert!(!Condition::Any(vec![]).eval(&job, &scope));
    }

    #[test]
    fn predicate_sees_statepoint() {
        let tmp = TempDir::new().unwrap();
        let job = job(&tmp);
        let hot = Condition::predicate("hot", |j: &Job| {
            j.statepoint().get("temperature").and_then(|v| v.as_f64()) > Some(250.0)
        });
        assert!(hot.eval(&job, &empty_scope()));
        assert_eq!(hot.to_string(), "hot");
    }

    #[test]
    fn labels_and_completion_resolve_through_scope() {
        let tmp = TempDir::new().unwrap();
        let job = job(&tmp);
        let mut scope = empty_scope();
        scope.labels.insert("ready".into(), Condition::Always);
        scope.complete.push("compute_energies".into());

        assert!(Condition::label("ready").eval(&job, &scope));
        assert!(!Condition::label("unknown").eval(&job, &scope));
        assert!(Condition::completed("compute_energies").eval(&job, &scope));
        assert!(!Condition::completed("run_charge_transport").eval(&job, &scope));
    }

    #[test]
    fn references_are_collected_recursively() {
        let cond = Condition::label("a")
            .and(Condition::completed("op").negate())
            .or(Condition::Always);
        assert_eq!(
            cond.references(),
            vec![Reference::Label("a"), Reference::Operation("op")]
        );
        assert_eq!(cond.to_string(), "((a and not completed(op)) or always)");
    }
}
