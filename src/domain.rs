use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;

/// Number of leading sequence characters surfaced as `sequence_preview`.
pub const PREVIEW_LEN: usize = 120;

const FASTA_EXTENSIONS: [&str; 2] = [".fa", ".fasta"];

/// One parsed FASTA record. The sequence is uppercase with all whitespace
/// removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequenceRecord {
    pub header: String,
    pub sequence: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub length: u64,
    pub gc_percent: f64,
    pub sequence_preview: String,
}

/// Which part of a multi-record file the statistics describe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum AnalysisUnit {
    #[default]
    FirstRecord,
    WholeFile,
}

impl fmt::Display for AnalysisUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnalysisUnit::FirstRecord => write!(f, "first-record"),
            AnalysisUnit::WholeFile => write!(f, "whole-file"),
        }
    }
}

/// What an ingestion does when the filename's latest block already carries
/// the same content hash.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum DuplicatePolicy {
    #[default]
    Append,
    SkipIdentical,
}

impl fmt::Display for DuplicatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DuplicatePolicy::Append => write!(f, "append"),
            DuplicatePolicy::SkipIdentical => write!(f, "skip-identical"),
        }
    }
}

/// A filename that is safe to store and carries a FASTA extension.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoredFilename(String);

impl StoredFilename {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Strips path traversal and separators. Lookups by filename go through
    /// this too, so a name resolves the same way it was stored.
    pub fn sanitize(raw: &str) -> String {
        raw.trim()
            .replace("..", "")
            .replace(['/', '\\'], "_")
    }

    pub fn has_fasta_extension(name: &str) -> bool {
        let lower = name.to_ascii_lowercase();
        FASTA_EXTENSIONS
            .iter()
            .any(|ext| lower.ends_with(ext) && lower.len() > ext.len())
    }
}

impl fmt::Display for StoredFilename {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for StoredFilename {
    type Err = PipelineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let sanitized = Self::sanitize(value);
        if sanitized.is_empty() {
            return Err(PipelineError::Validation("filename is required".to_string()));
        }
        if !Self::has_fasta_extension(&sanitized) {
            return Err(PipelineError::Validation(
                "Only .fa/.fasta files are supported".to_string(),
            ));
        }
        Ok(Self(sanitized))
    }
}

/// A curated remote dataset that `fetch-fasta` can pull by id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FastaSource {
    pub id: String,
    pub name: String,
    pub url: String,
    pub description: String,
}
