use crate::domain::{AnalysisResult, AnalysisUnit, PREVIEW_LEN, SequenceRecord};
use crate::error::PipelineError;

/// Summarizes parsed records.
///
/// With [`AnalysisUnit::FirstRecord`] the first record stands for the whole
/// file; with [`AnalysisUnit::WholeFile`] length and GC content cover every
/// record. The preview always comes from the first record.
pub fn analyze(
    records: &[SequenceRecord],
    unit: AnalysisUnit,
) -> Result<AnalysisResult, PipelineError> {
    let first = records
        .first()
        .ok_or_else(|| PipelineError::Parse("no sequence records found".to_string()))?;

    let (length, gc) = match unit {
        AnalysisUnit::FirstRecord => base_counts(&first.sequence),
        AnalysisUnit::WholeFile => records
            .iter()
            .map(|record| base_counts(&record.sequence))
            .fold((0, 0), |(len, gc), (l, g)| (len + l, gc + g)),
    };

    Ok(AnalysisResult {
        length,
        gc_percent: gc_percent(gc, length),
        sequence_preview: first.sequence.chars().take(PREVIEW_LEN).collect(),
    })
}

fn base_counts(sequence: &str) -> (u64, u64) {
    sequence.chars().fold((0, 0), |(len, gc), ch| {
        let is_gc = matches!(ch, 'G' | 'C');
        (len + 1, gc + u64::from(is_gc))
    })
}

fn gc_percent(gc: u64, length: u64) -> f64 {
    if length == 0 {
        return 0.0;
    }
    let raw = gc as f64 * 100.0 / length as f64;
    ((raw * 100.0).round() / 100.0).clamp(0.0, 100.0)
}
