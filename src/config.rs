//! Configuração do projeto carregada a partir de `morphflow.toml`.
//!
//! A struct [`ProjectConfig`] contém todos os parâmetros configuráveis.
//! Valores não presentes no arquivo usam defaults sensíveis, incluindo a
//! tabela de parâmetros da campanha de transporte de carga.
//! A variável de ambiente `MORPHFLOW_ENGINE` tem precedência sobre o arquivo.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::environment::EnvironmentSpec;
use crate::space::ParameterSpace;

pub const CONFIG_FILE: &str = "morphflow.toml";
pub const INDEX_FILE: &str = "statepoints.json";

/// Configuração de nível superior carregada de `morphflow.toml`.
#[derive(Debug, Clone, Deserialize)]
pub struct ProjectConfig {
    /// Nome do projeto.
    #[serde(default = "default_name")]
    pub name: String,

    /// Diretório dos workspaces, relativo ao diretório do projeto.
    #[serde(default = "default_workspace")]
    pub workspace: PathBuf,

    /// Linha de comando do motor de simulação externo.
    #[serde(default = "default_engine")]
    pub engine: Vec<String>,

    /// Verbosidade repassada ao KMC.
    #[serde(default)]
    pub kmc_verbosity: u8,

    /// Espaço de parâmetros: nome → lista de valores candidatos, em ordem.
    #[serde(default = "default_parameters")]
    pub parameters: toml::Table,

    /// Ambientes de cluster adicionais.
    #[serde(default)]
    pub environments: Vec<EnvironmentSpec>,
}

// Valor padrão para o nome do projeto: "morphct".
fn default_name() -> String {
    "morphct".to_string()
}

fn default_workspace() -> PathBuf {
    PathBuf::from("workspace")
}

fn default_engine() -> Vec<String> {
    vec!["morphct-engine".to_string()]
}

// Tabela padrão da campanha: um único ponto com ITIC como aceitador.
const DEFAULT_PARAMETERS: &str = r#"
input = ["itic-trajectory.gsd"]
frame = [-1]
mol_length = [186]
reorganization_energy = [0.15]
acceptors = ["itic_all_ids.csv"]
acceptor_charge = [0]
donor_charge = [0]
scale = [3.5636]
forcefield = ["gaff"]
temperature = [300]
lifetimes = [[1e-13, 1e-12]]
n_holes = [0]
n_elec = [10]
"#;

fn default_parameters() -> toml::Table {
    // Literal constante; o teste `default_parameters_parse` garante que é válido.
    toml::from_str(DEFAULT_PARAMETERS).unwrap_or_default()
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            workspace: default_workspace(),
            engine: default_engine(),
            kmc_verbosity: 0,
            parameters: default_parameters(),
            environments: Vec::new(),
        }
    }
}

impl ProjectConfig {
    /// Carrega a configuração de `morphflow.toml` em `project_dir`.
    /// Usa valores padrão se o arquivo não existir.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let path = project_dir.join(CONFIG_FILE);
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            toml::from_str::<ProjectConfig>(&contents)
                .with_context(|| format!("parsing {}", path.display()))?
        } else {
            Self::default()
        };

        // Variável de ambiente tem precedência sobre o arquivo para o motor.
        if let Ok(engine) = std::env::var("MORPHFLOW_ENGINE") {
            let parts: Vec<String> = engine.split_whitespace().map(str::to_string).collect();
            if !parts.is_empty() {
                config.engine = parts;
            }
        }

        Ok(config)
    }

    pub fn parameter_space(&self) -> crate::error::Result<ParameterSpace> {
        ParameterSpace::from_toml(&self.parameters)
    }
}
