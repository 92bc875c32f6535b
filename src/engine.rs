//! Contract with the external simulation engine.
//!
//! The orchestrator never models physics. It builds a system from a trajectory
//! frame, registers chromophores, asks for pairwise couplings and then for a
//! kinetic Monte Carlo transport run. [`ProcessEngine`] speaks this contract to
//! an external program over stdin/stdout JSON, one invocation per verb.

use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{FlowError, Result};

/// Chemistry-to-parameter conversion table handed to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversionTable {
    Amber,
}

impl ConversionTable {
    pub const SUPPORTED_FORCEFIELDS: &'static [&'static str] = &["gaff"];

    pub fn for_forcefield(forcefield: &str) -> Result<Self> {
        match forcefield {
            "gaff" => Ok(ConversionTable::Amber),
            other => Err(FlowError::Configuration(format!(
                "unsupported forcefield '{other}': no conversion table (supported: {})",
                Self::SUPPORTED_FORCEFIELDS.join(", ")
            ))),
        }
    }
}

/// Carrier role of a chromophore: donors carry holes, acceptors electrons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CarrierRole {
    Donor,
    Acceptor,
}

impl std::fmt::Display for CarrierRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CarrierRole::Donor => write!(f, "donor"),
            CarrierRole::Acceptor => write!(f, "acceptor"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemSpec {
    pub input: PathBuf,
    pub output_dir: PathBuf,
    pub frame: i64,
    pub scale: f64,
    pub conversion: ConversionTable,
}

/// A charge-transport site: a group of atom indices with a role.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chromophore {
    pub atoms: Vec<usize>,
    pub role: CarrierRole,
    pub charge: i64,
    pub reorganization_energy: f64,
}

/// Electronic coupling between two registered chromophores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coupling {
    pub sites: (usize, usize),
    pub delta_energy: f64,
    pub transfer_integral: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KmcRequest {
    pub lifetimes: Vec<f64>,
    pub temperature: f64,
    pub n_holes: u32,
    pub n_elec: u32,
    pub verbosity: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CarrierRecord {
    pub role: CarrierRole,
    pub lifetime: f64,
    pub displacement: f64,
    /// Periodic images crossed along each axis.
    pub image: [i64; 3],
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransportResults {
    pub carriers: Vec<CarrierRecord>,
}

pub trait SimulationEngine {
    fn open(&self, spec: &SystemSpec) -> Result<Box<dyn SimulationSystem>>;
}

/// One loaded frame plus its registered chromophores.
pub trait SimulationSystem {
    fn atom_count(&self) -> usize;
    fn add_chromophores(&mut self, sites: Vec<Chromophore>);
    fn chromophores(&self) -> &[Chromophore];
    /// Pairwise couplings among the registered chromophores.
    fn compute_energies(&mut self) -> Result<Vec<Coupling>>;
    fn set_energies(&mut self, couplings: Vec<Coupling>);
    /// Runs transport; requires energies to be set first.
    fn run_kmc(&mut self, request: &KmcRequest) -> Result<()>;
    fn results(&self) -> Option<&TransportResults>;
}

/// Drives an external engine command: `<program> [args..] <verb>` with a JSON
/// request on stdin and a JSON response on stdout.
#[derive(Debug, Clone)]
pub struct ProcessEngine {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessEngine {
    /// Builds an engine from a command line such as `["python", "engine.py"]`.
    pub fn from_command(command: &[String]) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| FlowError::Configuration("engine command is empty".into()))?;
        Ok(Self {
            program: program.into(),
            args: args.to_vec(),
        })
    }

    fn invoke<Req: Serialize, Resp: DeserializeOwned>(&self, verb: &str, request: &Req) -> Result<Resp> {
        debug!("engine {} {verb}", self.program.display());
        let payload = serde_json::to_vec(request)?;
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .arg(verb)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| FlowError::Engine(format!("cannot start {}: {e}", self.program.display())))?;

        // stdin is fed from its own thread while stdout and stderr drain.
        let writer = child.stdin.take().map(|mut stdin| {
            std::thread::spawn(move || stdin.write_all(&payload))
        });
        let output = child
            .wait_with_output()
            .map_err(|e| FlowError::Engine(format!("{verb}: {e}")))?;
        let written = match writer.map(|w| w.join()) {
            None | Some(Ok(Ok(()))) => Ok(()),
            Some(Ok(Err(e))) => Err(e.to_string()),
            Some(Err(_)) => Err("request writer panicked".to_string()),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FlowError::Engine(format!(
                "{verb} exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        written.map_err(|e| FlowError::Engine(format!("{verb}: writing request: {e}")))?;
        serde_json::from_slice(&output.stdout)
            .map_err(|e| FlowError::Engine(format!("{verb}: malformed response: {e}")))
    }
}

#[derive(Deserialize)]
struct InspectResponse {
    atom_count: usize,
}

#[derive(Serialize)]
struct EnergiesRequest<'a> {
    system: &'a SystemSpec,
    chromophores: &'a [Chromophore],
}

#[derive(Deserialize)]
struct EnergiesResponse {
    couplings: Vec<Coupling>,
}

#[derive(Serialize)]
struct KmcCall<'a> {
    system: &'a SystemSpec,
    chromophores: &'a [Chromophore],
    couplings: &'a [Coupling],
    kmc: &'a KmcRequest,
}

impl SimulationEngine for ProcessEngine {
    fn open(&self, spec: &SystemSpec) -> Result<Box<dyn SimulationSystem>> {
        let info: InspectResponse = self.invoke("inspect", spec)?;
        Ok(Box::new(ProcessSystem {
            engine: self.clone(),
            spec: spec.clone(),
            atom_count: info.atom_count,
            chromophores: Vec::new(),
            couplings: None,
            results: None,
        }))
    }
}

struct ProcessSystem {
    engine: ProcessEngine,
    spec: SystemSpec,
    atom_count: usize,
    chromophores: Vec<Chromophore>,
    couplings: Option<Vec<Coupling>>,
    results: Option<TransportResults>,
}

impl SimulationSystem for ProcessSystem {
    fn atom_count(&self) -> usize {
        self.atom_count
    }

    fn add_chromophores(&mut self, sites: Vec<Chromophore>) {
        self.chromophores.extend(sites);
    }

    fn chromophores(&self) -> &[Chromophore] {
        &self.chromophores
    }

    fn compute_energies(&mut self) -> Result<Vec<Coupling>> {
        let response: EnergiesResponse = self.engine.invoke(
            "energies",
            &EnergiesRequest {
                system: &self.spec,
                chromophores: &self.chromophores,
            },
        )?;
        Ok(response.couplings)
    }

    fn set_energies(&mut self, couplings: Vec<Coupling>) {
        self.couplings = Some(couplings);
    }

    fn run_kmc(&mut self, request: &KmcRequest) -> Result<()> {
        let couplings = self
            .couplings
            .as_deref()
            .ok_or_else(|| FlowError::Engine("energies must be set before transport".into()))?;
        let results: TransportResults = self.engine.invoke(
            "kmc",
            &KmcCall {
                system: &self.spec,
                chromophores: &self.chromophores,
                couplings,
                kmc: request,
            },
        )?;
        self.results = Some(results);
        Ok(())
    }

    fn results(&self) -> Option<&TransportResults> {
        self.results.as_ref()
    }
}
