//! Interface de linha de comando do morphflow baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (init, run, status,
//! submit) e flags globais (--project-dir, --verbose, --quiet, --log-file).

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// morphflow: orquestrador de campanhas de transporte de carga.
#[derive(Debug, Parser)]
#[command(name = "morphflow", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Diretório do projeto (contém `morphflow.toml` e o workspace).
    #[arg(long, global = true, default_value = ".")]
    pub project_dir: PathBuf,

    /// Aumenta a verbosidade dos logs (-v, -vv, -vvv).
    #[arg(long, short, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suprime todos os logs.
    #[arg(long, short, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Grava os logs também neste arquivo.
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,
}

/// Seleção de jobs compartilhada por run, status e submit.
#[derive(Debug, Clone, Default, Args)]
pub struct JobArgs {
    /// Filtro `chave=valor` sobre o state point (repetível, todos devem casar).
    #[arg(long, short, visible_alias = "job-filter")]
    pub filter: Vec<String>,

    /// Prefixo de id de job (repetível).
    #[arg(long, short)]
    pub job_id: Vec<String>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Expande o espaço de parâmetros e cria um job por state point.
    Init,

    /// Executa localmente todos os pares (job, operação) elegíveis.
    Run {
        /// Restringe às operações nomeadas (repetível).
        #[arg(long, short)]
        operation: Vec<String>,

        #[command(flatten)]
        jobs: JobArgs,
    },

    /// Mostra os rótulos e o estado de cada operação por job.
    Status {
        /// Lê o último status salvo em vez de reavaliar as condições.
        #[arg(long)]
        cached: bool,

        #[command(flatten)]
        jobs: JobArgs,
    },

    /// Envia os pares elegíveis ao escalonador do cluster.
    Submit {
        /// Nome do ambiente; detectado pelo hostname se omitido.
        #[arg(long, short)]
        environment: Option<String>,

        /// Partição do escalonador.
        #[arg(long)]
        partition: Option<String>,

        /// Lista de nós do escalonador.
        #[arg(long)]
        nodelist: Option<String>,

        /// Número de nós.
        #[arg(long)]
        nodes: Option<u32>,

        /// Tempo máximo em horas.
        #[arg(long)]
        walltime: Option<f64>,

        /// Flag extra repassada ao sbatch (repetível).
        #[arg(long = "flag")]
        extra_flags: Vec<String>,

        /// Restringe às operações nomeadas (repetível).
        #[arg(long, short)]
        operation: Vec<String>,

        /// Imprime os comandos sem enviá-los.
        #[arg(long)]
        pretend: bool,

        #[command(flatten)]
        jobs: JobArgs,
    },
}
