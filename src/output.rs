use std::io::{self, Write};

use serde::Serialize;

use crate::app::{AnalysisResponse, HistoryResponse, IngestOutcome, LedgerResponse};
use crate::ledger::ChainVerification;

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_ingest(outcome: &IngestOutcome) -> io::Result<()> {
        Self::print_json(outcome)
    }

    pub fn print_analysis(result: &AnalysisResponse) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_ledger(result: &LedgerResponse) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_verification(result: &ChainVerification) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_history(result: &HistoryResponse) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout().lock();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}
