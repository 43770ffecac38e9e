use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::analysis;
use crate::config::ResolvedConfig;
use crate::domain::{AnalysisResult, AnalysisUnit, DuplicatePolicy, FastaSource, StoredFilename};
use crate::error::PipelineError;
use crate::fasta;
use crate::fetch::FastaFetcher;
use crate::hasher;
use crate::history::{HistoryEntry, HistoryQuery, HistoryStore};
use crate::ledger::{ChainVerification, Ledger, LedgerBlock, SealedBlock};
use crate::store::{BlobStore, JsonLinesLog, Store};

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub duplicate_policy: DuplicatePolicy,
    pub analysis_unit: AnalysisUnit,
    pub sources: Vec<FastaSource>,
}

impl From<&ResolvedConfig> for PipelineSettings {
    fn from(config: &ResolvedConfig) -> Self {
        Self {
            duplicate_policy: config.duplicate_policy,
            analysis_unit: config.analysis_unit,
            sources: config.sources.clone(),
        }
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            duplicate_policy: DuplicatePolicy::default(),
            analysis_unit: AnalysisUnit::default(),
            sources: crate::config::default_sources(),
        }
    }
}

/// Progress of one ingestion. Anything short of `Done` when the call
/// returns means nothing was committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestStage {
    Received,
    Hashed,
    Parsed,
    Analyzed,
    LedgerAppended,
    HistoryRecorded,
    Done,
}

impl fmt::Display for IngestStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IngestStage::Received => "received",
            IngestStage::Hashed => "hashed",
            IngestStage::Parsed => "parsed",
            IngestStage::Analyzed => "analyzed",
            IngestStage::LedgerAppended => "ledger-appended",
            IngestStage::HistoryRecorded => "history-recorded",
            IngestStage::Done => "done",
        };
        write!(f, "{name}")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    pub filename: String,
    pub hash: String,
    pub ledger_block: LedgerBlock,
    pub analysis: AnalysisResult,
    pub history_entry: Option<HistoryEntry>,
    pub deduplicated: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadResponse {
    pub filename: String,
    pub hash: String,
    pub ledger_block: LedgerBlock,
    pub message: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FetchRequest {
    #[serde(default)]
    pub source_id: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub filename: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchResponse {
    pub filename: String,
    pub hash: String,
    pub ledger_block: LedgerBlock,
    pub source: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisResponse {
    pub filename: String,
    #[serde(flatten)]
    pub analysis: AnalysisResult,
}

#[derive(Debug, Clone, Serialize)]
pub struct HashResponse {
    pub filename: String,
    pub hash: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LedgerResponse {
    pub ledger: Vec<LedgerBlock>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryResponse {
    pub history: Vec<HistoryEntry>,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SourcesResponse {
    pub sources: Vec<FastaSource>,
}

/// Ties hashing, analysis, the ledger and the history log together.
pub struct App<F: FastaFetcher> {
    ledger: Ledger,
    history: HistoryStore,
    blobs: BlobStore,
    fetcher: F,
    settings: PipelineSettings,
}

impl<F: FastaFetcher> App<F> {
    pub fn new(
        ledger: Ledger,
        history: HistoryStore,
        blobs: BlobStore,
        fetcher: F,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            ledger,
            history,
            blobs,
            fetcher,
            settings,
        }
    }

    /// Opens the data directory for writing. Fails if another process holds
    /// it.
    pub fn open(config: &ResolvedConfig, fetcher: F) -> Result<Self, PipelineError> {
        let store = Store::new(config.data_dir.clone());
        store.ensure_root()?;
        let ledger = Ledger::open(Box::new(JsonLinesLog::<SealedBlock>::open(
            store.ledger_path(),
        )?))?;
        let history = HistoryStore::open(Box::new(JsonLinesLog::<HistoryEntry>::open(
            store.history_path(),
        )?))?;
        drop_orphaned_tail(&ledger, &history)?;
        tracing::info!(
            data_dir = %store.root(),
            blocks = ledger.len(),
            history = history.len(),
            "stores opened"
        );
        Ok(Self::new(
            ledger,
            history,
            store.blobs(),
            fetcher,
            PipelineSettings::from(config),
        ))
    }

    /// Opens the data directory for inspection alongside a running writer.
    pub fn open_read_only(config: &ResolvedConfig, fetcher: F) -> Result<Self, PipelineError> {
        let store = Store::new(config.data_dir.clone());
        let ledger = Ledger::open(Box::new(JsonLinesLog::<SealedBlock>::open_read_only(
            store.ledger_path(),
        )))?;
        let history = HistoryStore::open(Box::new(
            JsonLinesLog::<HistoryEntry>::open_read_only(store.history_path()),
        ))?;
        Ok(Self::new(
            ledger,
            history,
            store.blobs(),
            fetcher,
            PipelineSettings::from(config),
        ))
    }

    pub fn close(self) -> Result<(), PipelineError> {
        self.ledger.close()?;
        self.history.close()?;
        tracing::info!("stores closed");
        Ok(())
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Runs the full pipeline for one payload. Either a ledger block and a
    /// history entry are both committed, or neither is.
    ///
    /// The block is staged first, then the history entry is written and
    /// published, then the block is committed. Readers can therefore see the
    /// entry shortly before its block, never the reverse. Both share one
    /// timestamp, which is how [`App::open`] recognises a block whose entry
    /// was lost to a crash.
    pub fn ingest(
        &self,
        filename: &StoredFilename,
        content: &[u8],
    ) -> Result<IngestOutcome, PipelineError> {
        let mut stage = IngestStage::Received;
        let result = self.run_ingest(filename, content, &mut stage);
        match &result {
            Ok(outcome) => tracing::info!(
                filename = %filename,
                hash = %outcome.hash,
                index = outcome.ledger_block.index,
                deduplicated = outcome.deduplicated,
                "ingestion committed"
            ),
            Err(err) => tracing::warn!(
                filename = %filename,
                reached = %stage,
                error = %err,
                "ingestion failed"
            ),
        }
        result
    }

    fn run_ingest(
        &self,
        filename: &StoredFilename,
        content: &[u8],
        stage: &mut IngestStage,
    ) -> Result<IngestOutcome, PipelineError> {
        let name = filename.as_str();

        let hash = hasher::digest(content);
        advance(stage, IngestStage::Hashed);

        let records = fasta::parse(content)?;
        advance(stage, IngestStage::Parsed);

        let analysis = analysis::analyze(&records, self.settings.analysis_unit)?;
        advance(stage, IngestStage::Analyzed);

        // Content-addressed and idempotent, so a later rollback can leave it.
        self.blobs.put(&hash, content)?;

        let mut txn = self.ledger.begin()?;
        if self.settings.duplicate_policy == DuplicatePolicy::SkipIdentical
            && let Some(existing) = txn.latest_for(name).filter(|block| block.hash == hash)
        {
            advance(stage, IngestStage::Done);
            return Ok(IngestOutcome {
                filename: name.to_string(),
                hash,
                ledger_block: existing,
                analysis,
                history_entry: None,
                deduplicated: true,
            });
        }

        let timestamp = Utc::now();
        let block = txn.append(name, &hash, timestamp)?;
        advance(stage, IngestStage::LedgerAppended);

        let entry = match self.history.record(name, &hash, analysis.clone(), timestamp) {
            Ok(entry) => entry,
            Err(err) => {
                if let Err(rollback) = txn.rollback() {
                    tracing::error!(error = %rollback, "ledger rollback failed");
                }
                return Err(err);
            }
        };
        advance(stage, IngestStage::HistoryRecorded);

        txn.commit();
        advance(stage, IngestStage::Done);

        Ok(IngestOutcome {
            filename: name.to_string(),
            hash,
            ledger_block: block,
            analysis,
            history_entry: Some(entry),
            deduplicated: false,
        })
    }

    pub fn upload(
        &self,
        original_filename: &str,
        content: &[u8],
    ) -> Result<UploadResponse, PipelineError> {
        let filename: StoredFilename = original_filename.parse()?;
        let outcome = self.ingest(&filename, content)?;
        let message = if outcome.deduplicated {
            "Identical content already ledgered"
        } else {
            "Upload ingested and ledgered"
        };
        Ok(UploadResponse {
            filename: outcome.filename,
            hash: outcome.hash,
            ledger_block: outcome.ledger_block,
            message: message.to_string(),
        })
    }

    /// Downloads a curated source or an arbitrary URL and ingests it. The
    /// request is validated before any network traffic; dropping the future
    /// before the download completes leaves no state behind.
    pub async fn fetch_remote(
        self: &Arc<Self>,
        request: FetchRequest,
    ) -> Result<FetchResponse, PipelineError> {
        let (url, source_label) = self.resolve_fetch_target(&request)?;
        let filename = derive_filename(request.filename.as_deref(), &url)?;

        let content = self.fetcher.fetch(&url).await?;

        let app = Arc::clone(self);
        let outcome = tokio::task::spawn_blocking(move || app.ingest(&filename, &content))
            .await
            .map_err(|err| PipelineError::Server(format!("ingestion task failed: {err}")))??;

        Ok(FetchResponse {
            filename: outcome.filename,
            hash: outcome.hash,
            ledger_block: outcome.ledger_block,
            source: source_label,
        })
    }

    pub fn resolve_fetch_target(
        &self,
        request: &FetchRequest,
    ) -> Result<(Url, String), PipelineError> {
        let source_id = non_blank(request.source_id.as_deref());
        let url = non_blank(request.url.as_deref());

        match (source_id, url) {
            (Some(_), Some(_)) => Err(PipelineError::Validation(
                "Provide either source_id or url, not both".to_string(),
            )),
            (None, None) => Err(PipelineError::Validation(
                "Either source_id or url must be provided".to_string(),
            )),
            (Some(id), None) => {
                let source = self
                    .settings
                    .sources
                    .iter()
                    .find(|source| source.id == id)
                    .ok_or_else(|| PipelineError::NotFound(format!("source {id}")))?;
                Ok((parse_remote_url(&source.url)?, source.name.clone()))
            }
            (None, Some(raw)) => {
                let url = parse_remote_url(raw)?;
                let label = url.to_string();
                Ok((url, label))
            }
        }
    }

    pub fn sources(&self) -> SourcesResponse {
        SourcesResponse {
            sources: self.settings.sources.clone(),
        }
    }

    /// Re-analyzes the latest content stored under `filename` and logs the
    /// result to the history.
    pub fn analyze(&self, filename: &str) -> Result<AnalysisResponse, PipelineError> {
        let name = StoredFilename::sanitize(filename);
        let block = self.resolve(&name)?;
        let content = self.blobs.get(&block.hash)?;
        let records = fasta::parse(&content)?;
        let analysis = analysis::analyze(&records, self.settings.analysis_unit)?;

        if let Err(err) = self
            .history
            .record(&name, &block.hash, analysis.clone(), Utc::now())
        {
            tracing::warn!(filename = %name, error = %err, "analysis not saved to history");
        }

        Ok(AnalysisResponse {
            filename: name,
            analysis,
        })
    }

    pub fn hash(&self, filename: &str) -> Result<HashResponse, PipelineError> {
        let name = StoredFilename::sanitize(filename);
        let block = self.resolve(&name)?;
        let content = self.blobs.get(&block.hash)?;
        Ok(HashResponse {
            filename: name,
            hash: hasher::digest(&content),
        })
    }

    pub fn ledger(&self) -> LedgerResponse {
        LedgerResponse {
            ledger: self.ledger.snapshot(),
        }
    }

    pub fn verify_ledger(&self) -> ChainVerification {
        self.ledger.verify()
    }

    pub fn history(&self, query: &HistoryQuery) -> HistoryResponse {
        let query = HistoryQuery {
            filename: query.filename.as_deref().map(StoredFilename::sanitize),
            limit: query.limit,
        };
        let history = self.history.query(&query);
        HistoryResponse {
            total: history.len(),
            history,
        }
    }

    fn resolve(&self, name: &str) -> Result<LedgerBlock, PipelineError> {
        self.ledger
            .latest_for(name)
            .ok_or_else(|| PipelineError::NotFound(name.to_string()))
    }
}

/// A crash between the staged ledger append and the history append leaves
/// the last block without its entry. That block never committed, so it is
/// cut off.
fn drop_orphaned_tail(ledger: &Ledger, history: &HistoryStore) -> Result<(), PipelineError> {
    let Some(tail) = ledger.last() else {
        return Ok(());
    };
    if history.contains(&tail.filename, &tail.hash, tail.timestamp) {
        return Ok(());
    }
    tracing::warn!(
        index = tail.index,
        filename = %tail.filename,
        "dropping ledger block with no history entry"
    );
    ledger.truncate(tail.index as usize)
}

fn advance(stage: &mut IngestStage, next: IngestStage) {
    tracing::debug!(from = %stage, to = %next, "ingest stage");
    *stage = next;
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|value| !value.is_empty())
}

fn parse_remote_url(raw: &str) -> Result<Url, PipelineError> {
    let url =
        Url::parse(raw).map_err(|err| PipelineError::Validation(format!("invalid url {raw}: {err}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(PipelineError::Validation(format!(
            "unsupported url scheme: {}",
            url.scheme()
        )));
    }
    Ok(url)
}

/// Explicit name, else the URL's last path segment, else a timestamped name;
/// a FASTA extension is appended when missing.
pub fn derive_filename(explicit: Option<&str>, url: &Url) -> Result<StoredFilename, PipelineError> {
    let base = non_blank(explicit)
        .map(str::to_string)
        .or_else(|| {
            url.path_segments()
                .and_then(|mut segments| segments.next_back())
                .filter(|segment| !segment.is_empty())
                .map(str::to_string)
        })
        .unwrap_or_else(|| format!("remote_{}.fasta", Utc::now().timestamp()));

    let name = if StoredFilename::has_fasta_extension(&base) {
        base
    } else {
        format!("{base}.fasta")
    };
    name.parse()
}
