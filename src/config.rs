use std::fs;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::domain::{AnalysisUnit, DuplicatePolicy, FastaSource};
use crate::error::PipelineError;

pub const DEFAULT_CONFIG_FILE: &str = "biopipeline.json";

const DEFAULT_MAX_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub bind: Option<String>,
    #[serde(default)]
    pub data_dir: Option<String>,
    #[serde(default)]
    pub max_upload_bytes: Option<usize>,
    #[serde(default)]
    pub duplicate_policy: Option<DuplicatePolicy>,
    #[serde(default)]
    pub analysis_unit: Option<AnalysisUnit>,
    #[serde(default)]
    pub fetch: Option<FetchSection>,
    #[serde(default)]
    pub sources: Option<Vec<FastaSource>>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct FetchSection {
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub timeout: Duration,
    pub max_retries: usize,
    /// Downloads larger than this are abandoned; tracks `max_upload_bytes`.
    pub max_body_bytes: usize,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            max_retries: 3,
            max_body_bytes: DEFAULT_MAX_BYTES,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub schema_version: u32,
    pub bind: SocketAddr,
    pub data_dir: Utf8PathBuf,
    pub max_upload_bytes: usize,
    pub duplicate_policy: DuplicatePolicy,
    pub analysis_unit: AnalysisUnit,
    pub fetch: FetchSettings,
    pub sources: Vec<FastaSource>,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self {
            schema_version: 1,
            bind: SocketAddr::from(([127, 0, 0, 1], 8000)),
            data_dir: Utf8PathBuf::from(".biopipeline"),
            max_upload_bytes: DEFAULT_MAX_BYTES,
            duplicate_policy: DuplicatePolicy::default(),
            analysis_unit: AnalysisUnit::default(),
            fetch: FetchSettings::default(),
            sources: default_sources(),
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Reads `path`, or `biopipeline.json` in the working directory when it
    /// exists. Without either, every setting takes its default.
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, PipelineError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            tracing::debug!("no config file found, using defaults");
            return Ok(ResolvedConfig::default());
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| PipelineError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| PipelineError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, PipelineError> {
        let defaults = ResolvedConfig::default();

        let bind = match config.bind {
            Some(value) => value
                .parse()
                .map_err(|_| PipelineError::ConfigParse(format!("invalid bind address: {value}")))?,
            None => defaults.bind,
        };

        let fetch = config.fetch.unwrap_or_default();
        let timeout = match fetch.timeout_secs {
            Some(0) => {
                return Err(PipelineError::ConfigParse(
                    "fetch.timeout_secs must be positive".to_string(),
                ));
            }
            Some(secs) => Duration::from_secs(secs),
            None => defaults.fetch.timeout,
        };

        let sources = config.sources.unwrap_or(defaults.sources);
        let mut seen = std::collections::HashSet::new();
        for source in &sources {
            if !seen.insert(source.id.as_str()) {
                return Err(PipelineError::ConfigParse(format!(
                    "duplicate source id: {}",
                    source.id
                )));
            }
        }

        let max_upload_bytes = config.max_upload_bytes.unwrap_or(defaults.max_upload_bytes);

        Ok(ResolvedConfig {
            schema_version: config.schema_version.unwrap_or(defaults.schema_version),
            bind,
            data_dir: config
                .data_dir
                .map(Utf8PathBuf::from)
                .unwrap_or(defaults.data_dir),
            max_upload_bytes,
            duplicate_policy: config.duplicate_policy.unwrap_or(defaults.duplicate_policy),
            analysis_unit: config.analysis_unit.unwrap_or(defaults.analysis_unit),
            fetch: FetchSettings {
                timeout,
                max_retries: fetch.max_retries.unwrap_or(defaults.fetch.max_retries),
                max_body_bytes: max_upload_bytes,
            },
            sources,
        })
    }
}

pub fn default_sources() -> Vec<FastaSource> {
    vec![
        FastaSource {
            id: "covid_spike".to_string(),
            name: "SARS-CoV-2 Spike Protein".to_string(),
            url: "https://raw.githubusercontent.com/biopython/biopython/master/Doc/examples/ls_orchid.fasta".to_string(),
            description: "Reference spike sequence (demo dataset).".to_string(),
        },
        FastaSource {
            id: "human_mtDNA".to_string(),
            name: "Human Mitochondrial DNA".to_string(),
            url: "https://raw.githubusercontent.com/plotly/datasets/master/fasta/sample.fasta".to_string(),
            description: "Mitochondrial genome reference sample.".to_string(),
        },
        FastaSource {
            id: "arabidopsis".to_string(),
            name: "Arabidopsis Chloroplast".to_string(),
            url: "https://raw.githubusercontent.com/NCBI-Codeathons/Using-BLAST/master/example_data/arabidopsis.fasta".to_string(),
            description: "Plant chloroplast FASTA sample.".to_string(),
        },
    ]
}
