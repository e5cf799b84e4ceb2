//! Interface de linha de comando do jobstate baseada em clap.
//!
//! Define a struct [`Cli`] com flags globais (--config, --verbose) e um
//! subcomando [`Command`] para cada operação do engine.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use jobstate::{RecoveryMode, Stage};

/// jobstate: estado autoritativo de jobs de análise de longa duração.
#[derive(Debug, Parser)]
#[command(name = "jobstate", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Arquivo de configuração (padrão: ./jobstate.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Habilita logs de debug, a menos que RUST_LOG diga outra coisa.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,
}

/// Argumento de estágio aceito pela CLI, mapeado para [`Stage`] internamente.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StageArg {
    Processing,
    Verifying,
    Enhancing,
    Packaging,
}

impl From<StageArg> for Stage {
    fn from(arg: StageArg) -> Self {
        match arg {
            StageArg::Processing => Stage::Processing,
            StageArg::Verifying => Stage::Verifying,
            StageArg::Enhancing => Stage::Enhancing,
            StageArg::Packaging => Stage::Packaging,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Mostra o estado reconciliado de um job.
    Resolve {
        job_id: String,

        /// Estado da fila a usar na reconciliação, em vez de consultar a fila.
        #[arg(long)]
        queue_state: Option<String>,
    },

    /// Aguarda o bundle e o resultado estruturado do job ficarem visíveis.
    Await {
        job_id: String,

        /// Desiste antes do fim do backoff.
        #[arg(long)]
        timeout_secs: Option<u64>,
    },

    /// Registra que o job entrou em um estágio.
    Stage {
        job_id: String,

        #[arg(value_enum)]
        stage: StageArg,

        /// Substitui a descrição padrão do estágio.
        #[arg(long)]
        info: Option<String>,
    },

    /// Marca o job como concluído. Os arquivos de resultado já devem existir.
    Succeed {
        job_id: String,

        /// Resumo do resultado como documento JSON.
        #[arg(long)]
        summary: Option<String>,
    },

    /// Marca o job como falho.
    Fail {
        job_id: String,

        #[arg(long)]
        message: String,

        #[arg(long)]
        code: Option<String>,

        /// Falha de infraestrutura, não de entrada inválida.
        #[arg(long, default_value_t = false)]
        system: bool,
    },

    /// Reconstrói os registros do cache a partir dos artefatos em disco.
    Recover {
        /// Mostra o que seria recuperado sem gravar nada.
        #[arg(long, conflicts_with = "force")]
        dry_run: bool,

        /// Recalcula também jobs que o cache já conhece.
        #[arg(long)]
        force: bool,

        /// Recupera um único job.
        #[arg(long)]
        job: Option<String>,
    },

    /// Mostra estatísticas do cache.
    Stats,

    /// Remove registros do cache mais antigos que a idade informada.
    Cleanup {
        #[arg(long)]
        older_than_days: u64,
    },
}

/// Converte as flags `--dry-run`/`--force` no modo de recuperação.
pub fn recovery_mode(dry_run: bool, force: bool) -> RecoveryMode {
    match (dry_run, force) {
        (true, _) => RecoveryMode::DryRun,
        (false, true) => RecoveryMode::Force,
        (false, false) => RecoveryMode::Normal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_parses_resolve_subcommand() {
        let cli = Cli::parse_from(["jobstate", "resolve", "5f0c", "--queue-state", "PENDING"]);
        match cli.command {
            Command::Resolve { job_id, queue_state } => {
                assert_eq!(job_id, "5f0c");
                assert_eq!(queue_state.as_deref(), Some("PENDING"));
            }
            _ => panic!("expected Resolve command"),
        }
    }

    #[test]
    fn cli_parses_global_flags() {
        let cli = Cli::parse_from(["jobstate", "--config", "/etc/jobstate.toml", "--verbose", "stats"]);
        assert!(cli.verbose);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/jobstate.toml")));
        assert!(matches!(cli.command, Command::Stats));
    }

    #[test]
    fn cli_parses_stage_subcommand() {
        let cli = Cli::parse_from(["jobstate", "stage", "j1", "packaging", "--info", "Zipping"]);
        match cli.command {
            Command::Stage { job_id, stage, info } => {
                assert_eq!(job_id, "j1");
                assert_eq!(Stage::from(stage), Stage::Packaging);
                assert_eq!(info.as_deref(), Some("Zipping"));
            }
            _ => panic!("expected Stage command"),
        }
    }

    #[test]
    fn cli_parses_fail_subcommand() {
        let cli = Cli::parse_from(["jobstate", "fail", "j1", "--message", "boom", "--code", "E42", "--system"]);
        match cli.command {
            Command::Fail {
                job_id,
                message,
                code,
                system,
            } => {
                assert_eq!(job_id, "j1");
                assert_eq!(message, "boom");
                assert_eq!(code.as_deref(), Some("E42"));
                assert!(system);
            }
            _ => panic!("expected Fail command"),
        }
    }

    #[test]
    fn cli_rejects_dry_run_with_force() {
        assert!(Cli::try_parse_from(["jobstate", "recover", "--dry-run", "--force"]).is_err());
    }

    #[test]
    fn recovery_mode_from_flags() {
        assert_eq!(recovery_mode(false, false), RecoveryMode::Normal);
        assert_eq!(recovery_mode(true, false), RecoveryMode::DryRun);
        assert_eq!(recovery_mode(false, true), RecoveryMode::Force);
    }

    #[test]
    fn cli_verify() {
        Cli::command().debug_assert();
    }
}
