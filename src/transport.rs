//! Charge-transport campaign operations.
//!
//! Two operations are registered on the graph: `compute_energies` writes the
//! pairwise couplings to `output/energies.json`, and `run_charge_transport`
//! feeds them back into the engine, runs KMC and records the results in the
//! job document together with the `done` flag.

use std::path::{Path, PathBuf};
use std::rc::Rc;

use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::engine::{
    CarrierRole, Chromophore, ConversionTable, Coupling, KmcRequest, SimulationEngine,
    SimulationSystem, SystemSpec,
};
use crate::error::{FlowError, Result};
use crate::flow::{Condition, Directives, OperationGraph};
use crate::store::{Job, StatePoint, atomic_write};

pub const COMPUTE_ENERGIES: &str = "compute_energies";
pub const RUN_CHARGE_TRANSPORT: &str = "run_charge_transport";
pub const ENERGIES_COMPUTED: &str = "energies_computed";
pub const TRANSPORT_SIMULATED: &str = "transport_simulated";
pub const ENERGIES_FILE: &str = "output/energies.json";

/// Typed view of a campaign state point.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransportParams {
    /// Trajectory file, relative to the project directory.
    pub input: PathBuf,
    pub frame: i64,
    /// Atoms per molecule.
    pub mol_length: usize,
    /// eV
    pub reorganization_energy: f64,
    #[serde(default)]
    pub acceptors: Option<PathBuf>,
    #[serde(default)]
    pub donors: Option<PathBuf>,
    #[serde(default)]
    pub acceptor_charge: i64,
    #[serde(default)]
    pub donor_charge: i64,
    /// Length scale to Angstrom.
    pub scale: f64,
    pub forcefield: String,
    /// Kelvin
    pub temperature: f64,
    /// Carrier lifetimes in seconds.
    pub lifetimes: Vec<f64>,
    #[serde(default)]
    pub n_holes: u32,
    #[serde(default)]
    pub n_elec: u32,
}

impl TransportParams {
    pub fn from_statepoint(sp: &StatePoint) -> Result<Self> {
        sp.to_typed()
    }

    /// Checks everything that can be checked without touching the filesystem.
    pub fn validate(&self) -> Result<ConversionTable> {
        let table = ConversionTable::for_forcefield(&self.forcefield)?;
        if self.mol_length == 0 {
            return Err(FlowError::Configuration("mol_length must be positive".into()));
        }
        if self.lifetimes.is_empty() {
            return Err(FlowError::Configuration("at least one carrier lifetime is required".into()));
        }
        Ok(table)
    }
}

/// Validates every state point before any workspace is created or touched.
pub fn validate_statepoints<'a>(points: impl IntoIterator<Item = &'a StatePoint>) -> Result<()> {
    for sp in points {
        TransportParams::from_statepoint(sp)?.validate()?;
    }
    Ok(())
}

/// Shared inputs for the operation bodies.
#[derive(Clone)]
pub struct TransportContext {
    pub engine: Rc<dyn SimulationEngine>,
    pub project_dir: PathBuf,
    pub kmc_verbosity: u8,
}

impl TransportContext {
    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project_dir.join(path)
        }
    }
}

/// Registers labels and both operations on `graph`.
pub fn register(graph: &mut OperationGraph, ctx: TransportContext) -> Result<()> {
    let energies_ctx = ctx.clone();
    graph
        .add_label(ENERGIES_COMPUTED, Condition::file_exists(ENERGIES_FILE))?
        .add_label(TRANSPORT_SIMULATED, Condition::doc_flag("done"))?
        .add_operation(
            COMPUTE_ENERGIES,
            move |job: &mut Job| compute_energies(job, &energies_ctx),
            vec![],
            vec![Condition::label(ENERGIES_COMPUTED)],
            Directives {
                ngpu: 1,
                ..Default::default()
            },
        )?
        .add_operation(
            RUN_CHARGE_TRANSPORT,
            move |job: &mut Job| run_charge_transport(job, &ctx),
            vec![Condition::completed(COMPUTE_ENERGIES)],
            vec![Condition::label(TRANSPORT_SIMULATED)],
            Directives {
                ngpu: 1,
                ..Default::default()
            },
        )?;
    Ok(())
}

fn compute_energies(job: &mut Job, ctx: &TransportContext) -> Result<()> {
    let mut system = build_system(job, ctx)?;
    let couplings = system.compute_energies()?;
    info!("{}: {} coupling(s) computed", job.id(), couplings.len());
    let path = job.path(ENERGIES_FILE);
    atomic_write(&path, serde_json::to_string_pretty(&couplings)?.as_bytes())
}

fn run_charge_transport(job: &mut Job, ctx: &TransportContext) -> Result<()> {
    let params = TransportParams::from_statepoint(job.statepoint())?;
    let mut system = build_system(job, ctx)?;

    let energies_path = job.path(ENERGIES_FILE);
    let contents = std::fs::read_to_string(&energies_path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => {
            FlowError::MissingInput(format!("{} has not been written", energies_path.display()))
        }
        _ => FlowError::fs(&energies_path, e),
    })?;
    let couplings: Vec<Coupling> = serde_json::from_str(&contents).map_err(|e| FlowError::InvalidInput {
        path: energies_path.clone(),
        message: e.to_string(),
    })?;
    system.set_energies(couplings);

    system.run_kmc(&KmcRequest {
        lifetimes: params.lifetimes.clone(),
        temperature: params.temperature,
        n_holes: params.n_holes,
        n_elec: params.n_elec,
        verbosity: ctx.kmc_verbosity,
    })?;
    let results = system
        .results()
        .ok_or_else(|| FlowError::Engine("transport finished without results".into()))?;

    let displacements: Vec<f64> = results.carriers.iter().map(|c| c.displacement).collect();
    let images: Vec<[i64; 3]> = results.carriers.iter().map(|c| c.image).collect();
    let roles: Vec<CarrierRole> = results.carriers.iter().map(|c| c.role).collect();
    let mean = if displacements.is_empty() {
        0.0
    } else {
        displacements.iter().sum::<f64>() / displacements.len() as f64
    };

    // Results and the done flag land in a single atomic document write.
    let doc = job.doc_mut();
    doc.set("displacements", json!(displacements));
    doc.set("images", json!(images));
    doc.set("carrier_roles", json!(roles));
    doc.set("mean_displacement", mean);
    doc.set("completed_at", Utc::now().to_rfc3339());
    doc.set("done", true);
    doc.save()?;

    info!(
        "{}: {} carrier(s), mean displacement {mean:.3}",
        job.id(),
        displacements.len()
    );
    Ok(())
}

/// Opens the job's frame in the engine and registers its chromophores.
fn build_system(job: &Job, ctx: &TransportContext) -> Result<Box<dyn SimulationSystem>> {
    let params = TransportParams::from_statepoint(job.statepoint())?;
    let conversion = params.validate()?;

    let spec = SystemSpec {
        input: ctx.resolve(&params.input),
        output_dir: job.output_dir(),
        frame: params.frame,
        scale: params.scale,
        conversion,
    };
    let mut system = ctx.engine.open(&spec)?;

    let atom_count = system.atom_count();
    let n_mols = atom_count / params.mol_length;
    if atom_count % params.mol_length != 0 {
        warn!(
            "{}: {atom_count} atoms is not a multiple of mol_length {}",
            job.id(),
            params.mol_length
        );
    }

    let roles = [
        (CarrierRole::Acceptor, &params.acceptors, params.acceptor_charge),
        (CarrierRole::Donor, &params.donors, params.donor_charge),
    ];
    for (role, path, charge) in roles {
        let Some(rows) = load_site_template(path.as_deref().map(|p| ctx.resolve(p)), role)? else {
            continue;
        };
        let sites = replicate(&rows, n_mols, params.mol_length);
        if let Some(bad) = sites.iter().flatten().find(|&&i| i >= atom_count) {
            return Err(FlowError::InvalidInput {
                path: path.clone().unwrap_or_default(),
                message: format!("atom index {bad} out of range for {atom_count} atoms"),
            });
        }
        info!("{}: registering {} {role} chromophore(s)", job.id(), sites.len());
        system.add_chromophores(
            sites
                .into_iter()
                .map(|atoms| Chromophore {
                    atoms,
                    role,
                    charge,
                    reorganization_energy: params.reorganization_energy,
                })
                .collect(),
        );
    }

    if system.chromophores().is_empty() {
        return Err(FlowError::MissingInput(
            "no acceptor or donor chromophores could be registered".into(),
        ));
    }
    Ok(system)
}

/// Reads the chromophore index rows of the first molecule.
///
/// Returns `None` when the path is unset or the file is absent; that role is
/// then skipped. A present but malformed file is an error.
fn load_site_template(path: Option<PathBuf>, role: CarrierRole) -> Result<Option<Vec<Vec<usize>>>> {
    let Some(path) = path else {
        info!("no {role} file set, skipping {role} chromophores");
        return Ok(None);
    };
    let contents = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!("{role} file {} not found, skipping", path.display());
            return Ok(None);
        }
        Err(e) => return Err(FlowError::fs(&path, e)),
    };

    let rows = parse_index_rows(&contents).map_err(|message| FlowError::InvalidInput {
        path: path.clone(),
        message,
    })?;
    if rows.is_empty() {
        warn!("{role} file {} is empty, skipping", path.display());
        return Ok(None);
    }
    Ok(Some(rows))
}

/// Parses a chromophore index file.
///
/// A single-column file (one index per line) describes one chromophore per
/// molecule; otherwise each row is its own chromophore.
fn parse_index_rows(contents: &str) -> std::result::Result<Vec<Vec<usize>>, String> {
    let rows: Vec<Vec<usize>> = contents
        .lines()
        .enumerate()
        .map(|(n, line)| (n + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
        .map(|(n, line)| {
            line.split(|c: char| c == ',' || c.is_whitespace())
                .filter(|tok| !tok.is_empty())
                .map(|tok| {
                    tok.parse::<usize>()
                        .map_err(|_| format!("line {n}: '{tok}' is not an atom index"))
                })
                .collect::<std::result::Result<Vec<_>, _>>()
        })
        .collect::<std::result::Result<_, _>>()?;

    if rows.len() > 1 && rows.iter().all(|row| row.len() == 1) {
        return Ok(vec![rows.into_iter().flatten().collect()]);
    }
    Ok(rows)
}

/// Offsets the first-molecule template onto every molecule.
fn replicate(rows: &[Vec<usize>], n_mols: usize, mol_length: usize) -> Vec<Vec<usize>> {
    (0..n_mols)
        .flat_map(|m| {
            rows.iter()
                .map(move |row| row.iter().map(|&i| i + m * mol_length).collect::<Vec<_>>())
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::engine::{CarrierRecord, TransportResults};
    use crate::flow::{PairOutcome, PairState};
    use crate::store::JobStore;
    use std::cell::RefCell;
    use tempfile::TempDir;

    #[derive(Default)]
    pub(crate) struct Log {
        pub opened: u32,
        pub energy_calls: u32,
        pub kmc_calls: u32,
        pub chromophores: Vec<Chromophore>,
    }

    /// Scripted engine that records what it was asked to do.
    pub(crate) struct MockEngine {
        pub atom_count: usize,
        pub fail_kmc: bool,
        pub log: Rc<RefCell<Log>>,
    }

    impl MockEngine {
        pub fn new(atom_count: usize) -> Self {
            Self {
                atom_count,
                fail_kmc: false,
                log: Rc::new(RefCell::new(Log::default())),
            }
        }
    }

    struct MockSystem {
        atom_count: usize,
        fail_kmc: bool,
        log: Rc<RefCell<Log>>,
        chromophores: Vec<Chromophore>,
        couplings: Option<Vec<Coupling>>,
        results: Option<TransportResults>,
    }

    impl SimulationEngine for MockEngine {
        fn open(&self, _spec: &SystemSpec) -> Result<Box<dyn SimulationSystem>> {
            self.log.borrow_mut().opened += 1;
            Ok(Box::new(MockSystem {
                atom_count: self.atom_count,
                fail_kmc: self.fail_kmc,
                log: Rc::clone(&self.log),
                chromophores: Vec::new(),
                couplings: None,
                results: None,
            }))
        }
    }

    impl SimulationSystem for MockSystem {
        fn atom_count(&self) -> usize {
            self.atom_count
        }
        fn add_chromophores(&mut self, sites: Vec<Chromophore>) {
            self.log.borrow_mut().chromophores.extend(sites.iter().cloned());
            self.chromophores.extend(sites);
        }
        fn chromophores(&self) -> &[Chromophore] {
            &self.chromophores
        }
        fn compute_energies(&mut self) -> Result<Vec<Coupling>> {
            self.log.borrow_mut().energy_calls += 1;
            Ok(vec![Coupling {
                sites: (0, 1),
                delta_energy: 0.02,
                transfer_integral: 0.1,
            }])
        }
        fn set_energies(&mut self, couplings: Vec<Coupling>) {
            self.couplings = Some(couplings);
        }
        fn run_kmc(&mut self, request: &KmcRequest) -> Result<()> {
            self.log.borrow_mut().kmc_calls += 1;
            if self.couplings.is_none() {
                return Err(FlowError::Engine("energies not set".into()));
            }
            if self.fail_kmc {
                return Err(FlowError::Engine("hop rate overflow".into()));
            }
            let carriers = request
                .lifetimes
                .iter()
                .map(|&lifetime| CarrierRecord {
                    role: CarrierRole::Acceptor,
                    lifetime,
                    displacement: 2.0,
                    image: [0, 0, 1],
                })
                .collect();
            self.results = Some(TransportResults { carriers });
            Ok(())
        }
        fn results(&self) -> Option<&TransportResults> {
            self.results.as_ref()
        }
    }

    pub(crate) fn campaign_point(forcefield: &str, donors: Option<&str>) -> StatePoint {
        [
            ("input", json!("traj.gsd")),
            ("frame", json!(-1)),
            ("mol_length", json!(4)),
            ("reorganization_energy", json!(0.15)),
            ("acceptors", json!("acc.csv")),
            ("donors", json!(donors)),
            ("acceptor_charge", json!(0)),
            ("donor_charge", json!(0)),
            ("scale", json!(3.5636)),
            ("forcefield", json!(forcefield)),
            ("temperature", json!(300)),
            ("lifetimes", json!([1e-13, 1e-12])),
            ("n_holes", json!(0)),
            ("n_elec", json!(10)),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
    }

    fn setup(engine: MockEngine) -> (TempDir, OperationGraph, Rc<RefCell<Log>>) {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("acc.csv"), "0 1\n2,3\n").unwrap();
        let log = Rc::clone(&engine.log);
        let mut graph = OperationGraph::new();
        register(
            &mut graph,
            TransportContext {
                engine: Rc::new(engine),
                project_dir: tmp.path().to_path_buf(),
                kmc_verbosity: 0,
            },
        )
        .unwrap();
        (tmp, graph, log)
    }

    #[test]
    fn params_parse_with_null_donors() {
        let params = TransportParams::from_statepoint(&campaign_point("gaff", None)).unwrap();
        assert!(params.donors.is_none());
        assert_eq!(params.acceptors.as_deref(), Some(Path::new("acc.csv")));
        assert_eq!(params.validate().unwrap(), ConversionTable::Amber);
    }

    #[test]
    fn unknown_forcefield_fails_validation() {
        let points = [campaign_point("gaff", None), campaign_point("martini", None)];
        let err = validate_statepoints(&points).unwrap_err();
        assert!(matches!(err, FlowError::Configuration(_)));
    }

    #[test]
    fn index_rows_accept_commas_whitespace_and_comments() {
        let rows = parse_index_rows("# acceptor atoms\n0 1 2\n\n3,4, 5\n").unwrap();
        assert_eq!(rows, vec![vec![0, 1, 2], vec![3, 4, 5]]);
        assert!(parse_index_rows("0 1 x").unwrap_err().contains("line 1"));
    }

    #[test]
    fn single_column_file_is_one_chromophore() {
        let rows = parse_index_rows("0\n1\n2\n3\n").unwrap();
        assert_eq!(rows, vec![vec![0, 1, 2, 3]]);

        let sites = replicate(&rows, 2, 4);
        assert_eq!(sites, vec![vec![0, 1, 2, 3], vec![4, 5, 6, 7]]);
    }

    #[test]
    fn template_is_offset_onto_every_molecule() {
        let sites = replicate(&[vec![0, 1], vec![2]], 3, 10);
        assert_eq!(
            sites,
            vec![vec![0, 1], vec![2], vec![10, 11], vec![12], vec![20, 21], vec![22]]
        );
    }

    #[test]
    fn full_pipeline_records_results_and_done() {
        let (tmp, graph, log) = setup(MockEngine::new(12));
        let store = JobStore::new(tmp.path().join("workspace"));
        let mut jobs = vec![store.open_or_create(&campaign_point("gaff", None)).unwrap()];
        let transport = graph.operation(RUN_CHARGE_TRANSPORT).unwrap();
        assert_eq!(graph.classify(transport, &jobs[0]), PairState::Blocked);

        let ops = graph.select(&[]).unwrap();
        let report = graph.run(&mut jobs, &ops, &mut ()).unwrap();
        assert_eq!(report.succeeded().count(), 2);
        assert!(jobs[0].path(ENERGIES_FILE).exists());

        let doc = store.open(jobs[0].id()).unwrap().doc().clone();
        assert!(doc.flag("done"));
        assert_eq!(doc.get("displacements"), Some(&json!([2.0, 2.0])));
        assert_eq!(doc.get("images"), Some(&json!([[0, 0, 1], [0, 0, 1]])));
        assert_eq!(doc.get("mean_displacement"), Some(&json!(2.0)));

        // 12 atoms / mol_length 4 = 3 molecules, two acceptor rows each, per operation.
        let log = log.borrow();
        assert_eq!(log.chromophores.len(), 12);
        assert_eq!(log.chromophores[2].atoms, vec![4, 5]);
        assert!(log.chromophores.iter().all(|c| c.role == CarrierRole::Acceptor));
        assert_eq!((log.energy_calls, log.kmc_calls), (1, 1));
    }

    #[test]
    fn kmc_failure_leaves_job_retryable() {
        let mut engine = MockEngine::new(8);
        engine.fail_kmc = true;
        let (tmp, graph, _log) = setup(engine);
        let store = JobStore::new(tmp.path().join("workspace"));
        let mut jobs = vec![store.open_or_create(&campaign_point("gaff", None)).unwrap()];

        let ops = graph.select(&[]).unwrap();
        let report = graph.run(&mut jobs, &ops, &mut ()).unwrap();
        assert_eq!(report.succeeded().count(), 1);
        let failed: Vec<_> = report.failed().collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].operation, RUN_CHARGE_TRANSPORT);

        let reopened = store.open(jobs[0].id()).unwrap();
        assert!(!reopened.doc().flag("done"));
        assert!(reopened.doc().get("displacements").is_none());
        let transport = graph.operation(RUN_CHARGE_TRANSPORT).unwrap();
        assert_eq!(graph.classify(transport, &reopened), PairState::Eligible);
    }

    #[test]
    fn missing_donor_file_is_skipped_not_fatal() {
        let (tmp, graph, log) = setup(MockEngine::new(8));
        let store = JobStore::new(tmp.path().join("workspace"));
        let mut jobs = vec![
            store
                .open_or_create(&campaign_point("gaff", Some("absent_donors.csv")))
                .unwrap(),
        ];

        let ops = graph.select(&[COMPUTE_ENERGIES.to_string()]).unwrap();
        let report = graph.run(&mut jobs, &ops, &mut ()).unwrap();
        assert_eq!(report.records[0].outcome, PairOutcome::Succeeded);
        assert!(log.borrow().chromophores.iter().all(|c| c.role == CarrierRole::Acceptor));
    }

    #[test]
    fn out_of_range_index_is_invalid_input() {
        let (tmp, graph, _log) = setup(MockEngine::new(8));
        std::fs::write(tmp.path().join("acc.csv"), "0 9\n").unwrap();
        let store = JobStore::new(tmp.path().join("workspace"));
        let mut jobs = vec![store.open_or_create(&campaign_point("gaff", None)).unwrap()];

        let ops = graph.select(&[COMPUTE_ENERGIES.to_string()]).unwrap();
        let report = graph.run(&mut jobs, &ops, &mut ()).unwrap();
        assert!(matches!(
            report.records[0].outcome,
            PairOutcome::Failed { kind: crate::error::ErrorKind::InvalidInput, .. }
        ));
        assert!(!jobs[0].path(ENERGIES_FILE).exists());
    }
}
