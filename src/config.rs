//! Configuração do jobstate carregada a partir de `jobstate.toml`.
//!
//! A struct [`Config`] contém todos os parâmetros ajustáveis do engine.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! Algumas variáveis de ambiente, as mesmas que os workers da fila já
//! exportam, têm precedência sobre o arquivo.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{JobStateError, Result};

pub const DEFAULT_CONFIG_FILE: &str = "jobstate.toml";

/// Configuração de nível superior carregada de `jobstate.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Raiz com um diretório por job (`<root>/<job>/output/...`).
    pub results_root: PathBuf,
    /// Raiz com as cópias públicas dos resultados (`<root>/<job>/results.json`).
    pub public_root: PathBuf,
    pub log_format: LogFormat,
    pub cache: CacheConfig,
    pub queue: QueueConfig,
    pub reconcile: ReconcileConfig,
    pub probe: ProbeConfig,
    pub artifacts: ArtifactLayout,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            results_root: PathBuf::from("/results"),
            public_root: PathBuf::from("/public"),
            log_format: LogFormat::default(),
            cache: CacheConfig::default(),
            queue: QueueConfig::default(),
            reconcile: ReconcileConfig::default(),
            probe: ProbeConfig::default(),
            artifacts: ArtifactLayout::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Quando falso, toda chamada ao cache responde "indisponível".
    pub enabled: bool,
    /// Diretório do cache compartilhado entre os processos do host.
    pub dir: PathBuf,
    /// Tempo de vida dos registros, independente do ciclo de vida do job.
    pub ttl_days: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: PathBuf::from("/var/cache/jobstate"),
            ttl_days: 7,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_days * 86_400)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// URL base da API de monitoramento da fila. Sem valor, quem chama informa o estado.
    pub url: Option<String>,
    pub timeout_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_secs: 10,
        }
    }
}

/// O que a reconstrução heurística reporta quando existem o resultado tabular
/// e um arquivo auxiliar, mas nada foi empacotado.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModerateEvidencePolicy {
    /// Reporta sucesso, anotado como conjunto parcial de artefatos.
    #[default]
    Success,
    /// Reporta execução no estágio de empacotamento, que ainda não terminou.
    Running,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconcileConfig {
    /// Janela de recência quando o timestamp vem do arquivo de estágio.
    pub rich_recency_window_secs: u64,
    /// Janela de recência quando o timestamp vem só do cache, do marcador ou da fila.
    pub simple_recency_window_secs: u64,
    pub moderate_evidence: ModerateEvidencePolicy,
    /// Grava no cache vazio os veredictos vindos dos artefatos duráveis.
    pub backfill_cache: bool,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            rich_recency_window_secs: 180,
            simple_recency_window_secs: 60,
            moderate_evidence: ModerateEvidencePolicy::default(),
            backfill_cache: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            max_retries: 6,
            base_delay_ms: 500,
        }
    }
}

impl ProbeConfig {
    /// Atraso antes da tentativa `attempt` (a partir de zero): `base * 2^attempt`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }
}

/// Nomes dos arquivos de resultado produzidos pelas etapas do worker.
///
/// O engine só verifica se eles existem.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ArtifactLayout {
    /// Extensão do bundle empacotado no diretório do job.
    pub bundle_extension: String,
    /// Resultado estruturado, sob a raiz pública.
    pub structured_result: String,
    /// Resultado tabular final, no diretório de saída do job.
    pub tabular_result: String,
    /// Saída intermediária gravada antes da verificação.
    pub intermediate_result: String,
    /// Arquivos derivados gravados pela etapa de enriquecimento.
    pub auxiliary: Vec<String>,
}

impl Default for ArtifactLayout {
    fn default() -> Self {
        Self {
            bundle_extension: "zip".to_string(),
            structured_result: "results.json".to_string(),
            tabular_result: "results.csv".to_string(),
            intermediate_result: "raw_results.csv".to_string(),
            auxiliary: vec![
                "sentences.csv".to_string(),
                "analysis_summary.json".to_string(),
            ],
        }
    }
}

impl Config {
    /// Carrega `jobstate.toml` do diretório atual, ou os defaults se não existir.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(DEFAULT_CONFIG_FILE))
    }

    /// Carrega o arquivo informado, ou os defaults se ele não existir, e depois
    /// aplica as variáveis de ambiente.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)?;
            toml::from_str::<Config>(&contents)?
        } else {
            Self::default()
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Variáveis de ambiente têm precedência sobre o arquivo de configuração.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(root) = var("RESULTS_FOLDER").filter(|v| !v.is_empty()) {
            self.results_root = PathBuf::from(root);
        }
        if let Some(root) = var("PUBLIC_FOLDER").filter(|v| !v.is_empty()) {
            self.public_root = PathBuf::from(root);
        }
        if let Some(flag) = var("REDIS_STATE_TRACKING_ENABLED") {
            self.cache.enabled = parse_flag(&flag);
        }
        if let Some(days) = var("TASK_STATE_TTL_DAYS") {
            self.cache.ttl_days = days.trim().parse().map_err(|_| {
                JobStateError::Config(format!("TASK_STATE_TTL_DAYS is not a number: {days}"))
            })?;
        }
        if let Some(url) = var("JOBSTATE_QUEUE_URL").filter(|v| !v.is_empty()) {
            self.queue.url = Some(url);
        }
        Ok(())
    }
}

// Aceita as grafias que os containers dos workers usam para flags booleanas.
fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes" | "on"
    )
}
