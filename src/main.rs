mod cli;
mod config;
mod engine;
mod environment;
mod error;
mod flow;
mod logging;
mod project;
mod space;
mod store;
mod transport;
mod ui;

use std::process::ExitCode;
use std::rc::Rc;

use anyhow::Result;
use clap::Parser;

use cli::{Cli, Command, JobArgs};
use config::ProjectConfig;
use engine::ProcessEngine;
use environment::SubmissionOverrides;
use project::{Project, Selection};
use store::JobFilter;

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = logging::setup_logging(cli.verbose, cli.quiet, cli.log_file.as_deref()) {
        eprintln!("morphflow: {e:#}");
        return ExitCode::FAILURE;
    }

    match dispatch(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("morphflow: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn selection(jobs: &JobArgs) -> Result<Selection> {
    Ok(Selection {
        filter: JobFilter::parse(&jobs.filter)?,
        job_ids: jobs.job_id.clone(),
    })
}

fn dispatch(cli: Cli) -> Result<ExitCode> {
    let config = ProjectConfig::load(&cli.project_dir)?;
    let engine = ProcessEngine::from_command(&config.engine)?;
    let project = Project::open(&cli.project_dir, config, Rc::new(engine))?;

    match cli.command {
        Command::Init => {
            let summary = project.init()?;
            println!("Initialized. ({} total jobs)", summary.total);
            if !summary.failed.is_empty() {
                eprintln!("{} job(s) could not be created", summary.failed.len());
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Run { operation, jobs } => {
            let selection = selection(&jobs)?;
            let mut progress = ui::RunProgress::start();
            let report = project.run(&operation, &selection, &mut progress)?;
            progress.finish(&report);
            if report.has_failures() {
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Status { cached, jobs } => {
            if cached {
                match project.cached_status()? {
                    Some(cache) => ui::print_cached_status(&cache),
                    None => println!("No cached status for '{}'; run `status` first.", project.name()),
                }
            } else {
                let statuses = project.status(&selection(&jobs)?)?;
                ui::print_status(&statuses);
            }
        }
        Command::Submit {
            environment,
            partition,
            nodelist,
            nodes,
            walltime,
            extra_flags,
            operation,
            pretend,
            jobs,
        } => {
            let env = project.environment(environment.as_deref())?;
            let overrides = SubmissionOverrides {
                partition,
                nodelist,
                nodes,
                walltime_hours: walltime,
                extra_flags,
            };
            let submissions =
                project.submit(&env, &operation, &selection(&jobs)?, &overrides, pretend)?;
            ui::print_submissions(&submissions);
            if submissions
                .iter()
                .any(|s| matches!(s.status, project::SubmissionStatus::Failed(_)))
            {
                return Ok(ExitCode::FAILURE);
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}
