//! Interface de terminal do morphflow: spinners e saída colorida.
//!
//! Usa as crates `indicatif` para spinners de progresso e `console` para
//! estilização com cores. O [`RunProgress`] acompanha visualmente a execução
//! dos pares (job, operação) e imprime o resumo final.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::flow::{PairOutcome, PairRecord, PairState, RunObserver, RunReport};
use crate::project::{JobStatus, Submission, SubmissionStatus};
use crate::store::{Job, StatusCache};

/// Indicador visual de progresso para uma execução no terminal.
///
/// Exibe um spinner animado durante cada operação e mensagens
/// coloridas para sucesso (verde), falha (vermelho) e pulo (amarelo).
pub struct RunProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
}

impl RunProgress {
    pub fn start() -> Self {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
            pb.set_style(style);
        }
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    /// Finaliza o spinner e imprime o resumo da execução.
    pub fn finish(&self, report: &RunReport) {
        self.pb.finish_and_clear();
        let succeeded = report.succeeded().count();
        let skipped = report.skipped().count();
        let failed: Vec<&PairRecord> = report.failed().collect();

        println!();
        println!(
            "{} succeeded, {} skipped, {} failed ({} ms)",
            self.green.apply_to(succeeded),
            self.yellow.apply_to(skipped),
            self.red.apply_to(failed.len()),
            report.duration_ms()
        );
        for record in failed {
            if let PairOutcome::Failed { kind, message } = &record.outcome {
                println!(
                    "  {} {} {}: [{kind}] {message}",
                    self.red.apply_to("✗"),
                    short(&record.job_id),
                    record.operation
                );
            }
        }
    }
}

impl RunObserver for RunProgress {
    fn pair_started(&mut self, job: &Job, operation: &str) {
        self.pb.set_message(format!("{} {operation}", short(job.id())));
    }

    fn pair_finished(&mut self, record: &PairRecord) {
        let mark = match &record.outcome {
            PairOutcome::Succeeded => self.green.apply_to("✓"),
            PairOutcome::Skipped(_) => self.yellow.apply_to("↷"),
            PairOutcome::Failed { .. } => self.red.apply_to("✗"),
        };
        let detail = match &record.outcome {
            PairOutcome::Skipped(reason) => format!(" ({reason})"),
            _ => String::new(),
        };
        self.pb.println(format!(
            "  {mark} {} {}{detail} [{} ms]",
            short(&record.job_id),
            record.operation,
            record.duration_ms
        ));
    }
}

fn short(id: &str) -> &str {
    &id[..id.len().min(8)]
}

fn state_style(state: PairState) -> Style {
    match state {
        PairState::Done => Style::new().green(),
        PairState::Eligible => Style::new().cyan(),
        PairState::Running => Style::new().yellow(),
        PairState::Blocked => Style::new().dim(),
    }
}

/// Imprime a tabela de status por job e operação.
pub fn print_status(statuses: &[JobStatus]) {
    let bold = Style::new().bold();
    for status in statuses {
        let labels = if status.labels.is_empty() {
            String::from("-")
        } else {
            status.labels.join(", ")
        };
        println!("{}  [{labels}]", bold.apply_to(short(&status.job_id)));
        for (op, state) in &status.operations {
            println!("    {op:<24} {}", state_style(*state).apply_to(state));
        }
    }
}

/// Imprime o último status salvo, sem reavaliar condições.
pub fn print_cached_status(cache: &StatusCache) {
    println!("cached at {}", cache.updated_at.to_rfc3339());
    for (job, ops) in &cache.jobs {
        println!("{}", Style::new().bold().apply_to(short(job)));
        for (op, state) in ops {
            println!("    {op:<24} {}", state_style(*state).apply_to(state));
        }
    }
}

pub fn print_submissions(submissions: &[Submission]) {
    if submissions.is_empty() {
        println!("Nothing eligible to submit.");
        return;
    }
    for sub in submissions {
        match &sub.status {
            SubmissionStatus::Pretend => println!("{}", sub.command.join(" ")),
            SubmissionStatus::Submitted(out) => println!(
                "  {} {} {}: {out}",
                Style::new().green().apply_to("✓"),
                short(&sub.job_id),
                sub.spec.operation
            ),
            SubmissionStatus::Failed(err) => println!(
                "  {} {} {}: {err}",
                Style::new().red().apply_to("✗"),
                short(&sub.job_id),
                sub.spec.operation
            ),
        }
    }
}
