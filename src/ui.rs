//! Interface de terminal do jobstate: spinners e saída colorida.
//!
//! Usa `indicatif` para o spinner enquanto os arquivos de resultado não
//! aparecem e `console` para colorir os veredictos. Depois de cada veredicto
//! vem o JSON consumido pelos scripts.

use std::time::Duration;

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;

use jobstate::{CacheStats, JobState, RecoveryStats, Resolution};

/// Indicador visual enquanto a espera pelos arquivos de resultado faz backoff.
pub struct AwaitProgress {
    pb: ProgressBar,
    green: Style,
    yellow: Style,
}

impl AwaitProgress {
    /// Inicia o spinner com o id do job e o pior caso de espera.
    pub fn start(job_id: &str, worst_case: Duration) -> Self {
        let pb = ProgressBar::new_spinner();
        let style = ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg} [{elapsed}]")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        pb.set_style(style);
        pb.set_message(format!(
            "Waiting for results of {job_id} (up to {}s)",
            worst_case.as_secs_f32()
        ));
        pb.enable_steady_tick(Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            yellow: Style::new().yellow(),
        }
    }

    /// Finaliza o spinner e mostra se os arquivos ficaram disponíveis.
    pub fn finish(&self, available: bool) {
        self.pb.finish_and_clear();
        if available {
            println!("  {} Result files are available", self.green.apply_to("✓"));
        } else {
            println!("  {} Result files not visible yet, job still finishing", self.yellow.apply_to("…"));
        }
    }
}

/// Resumos coloridos de uma linha seguidos do JSON formatado.
///
/// Sucesso em verde, falha em vermelho e estados intermediários em amarelo.
pub struct Reporter {
    green: Style,
    red: Style,
    yellow: Style,
    dim: Style,
}

impl Reporter {
    pub fn new() -> Self {
        Self {
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
            dim: Style::new().dim(),
        }
    }

    fn style_for(&self, state: JobState) -> &Style {
        match state {
            JobState::Success => &self.green,
            JobState::Failure | JobState::Interrupted => &self.red,
            JobState::Pending | JobState::Running | JobState::Expired | JobState::Revoked => &self.yellow,
        }
    }

    /// Imprime o estado reconciliado, a fonte da evidência e as mensagens.
    pub fn resolution(&self, job_id: &str, resolution: &Resolution) {
        let mut headline = format!("{job_id}: {}", resolution.state);
        if let Some(stage) = resolution.stage {
            headline.push_str(&format!(" ({stage})"));
        }
        let reliability = if resolution.evidence.reliable { "" } else { ", unreliable" };
        println!(
            "{} {}",
            self.style_for(resolution.state).apply_to(headline),
            self.dim
                .apply_to(format!("[{:?}{reliability}]", resolution.evidence.source))
        );
        if let Some(info) = &resolution.stage_info {
            println!("  {info}");
        }
        if let Some(error) = &resolution.error_message {
            println!("  {} {error}", self.red.apply_to("✗"));
        }
        if let Some(message) = &resolution.message {
            println!("  {}", self.yellow.apply_to(message));
        }
        self.json(resolution);
    }

    pub fn written(&self, job_id: &str, what: &str) {
        println!("  {} {job_id}: {what}", self.green.apply_to("✓"));
    }

    pub fn recovery(&self, stats: &RecoveryStats) {
        let style = if stats.errors > 0 || stats.cancelled {
            &self.yellow
        } else {
            &self.green
        };
        println!("{}", style.apply_to(format!("─── Recovery: {stats} ───")));
        self.json(stats);
    }

    pub fn recovered_one(&self, job_id: &str, state: Option<JobState>) {
        match state {
            Some(state) => println!(
                "  {} {job_id}: recovered as {}",
                self.green.apply_to("✓"),
                self.style_for(state).apply_to(state)
            ),
            None => println!("  {} {job_id}: no usable evidence on disk", self.yellow.apply_to("?")),
        }
    }

    pub fn statistics(&self, stats: &CacheStats) {
        println!(
            "{}",
            self.green.apply_to(format!(
                "─── Cache: {} records, {} active, {} completed, {} failed ───",
                stats.total, stats.active_tasks, stats.completed_tasks, stats.failed_tasks
            ))
        );
        self.json(stats);
    }

    pub fn unavailable(&self, what: &str) {
        println!("  {} {what}: cache unavailable", self.red.apply_to("✗"));
    }

    fn json<T: Serialize>(&self, value: &T) {
        println!("{}", serde_json::to_string_pretty(value).unwrap_or_default());
    }
}
