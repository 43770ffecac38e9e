use crate::domain::SequenceRecord;
use crate::error::PipelineError;

/// Parses FASTA bytes into records in file order.
///
/// Headers are the trimmed text after `>`. Sequence lines are trimmed,
/// concatenated and uppercased; blank lines are skipped, so LF and CRLF input
/// parse identically. Lines before the first header carry no record and are
/// dropped.
pub fn parse(bytes: &[u8]) -> Result<Vec<SequenceRecord>, PipelineError> {
    let text = String::from_utf8_lossy(bytes);
    let mut records = Vec::new();
    let mut current: Option<SequenceRecord> = None;

    for line in text.lines() {
        if let Some(header) = line.strip_prefix('>') {
            if let Some(done) = current.take() {
                records.push(done);
            }
            current = Some(SequenceRecord {
                header: header.trim().to_string(),
                sequence: String::new(),
            });
            continue;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if let Some(record) = current.as_mut() {
            record.sequence.extend(
                trimmed
                    .chars()
                    .filter(|ch| !ch.is_whitespace())
                    .map(|ch| ch.to_ascii_uppercase()),
            );
        }
    }

    if let Some(done) = current.take() {
        records.push(done);
    }

    if records.is_empty() {
        return Err(PipelineError::Parse("no sequence records found".to_string()));
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parses_single_record() {
        let records = parse(b">seq1\nACGTACGT\n").unwrap();
        assert_eq!(
            records,
            vec![SequenceRecord {
                header: "seq1".to_string(),
                sequence: "ACGTACGT".to_string(),
            }]
        );
    }

    #[test]
    fn empty_input_is_rejected() {
        assert_matches!(parse(b""), Err(PipelineError::Parse(_)));
        assert_matches!(parse(b"\n  \n"), Err(PipelineError::Parse(_)));
    }

    #[test]
    fn headerless_input_is_rejected() {
        assert_matches!(parse(b"ACGT\nACGT\n"), Err(PipelineError::Parse(_)));
    }

    #[test]
    fn crlf_matches_lf() {
        let lf = parse(b">a  desc\nacgt\n\nTTGG\n>b\nNN\n").unwrap();
        let crlf = parse(b">a  desc\r\nacgt\r\n\r\nTTGG\r\n>b\r\nNN\r\n").unwrap();
        assert_eq!(lf, crlf);
        assert_eq!(lf[0].header, "a  desc");
        assert_eq!(lf[0].sequence, "ACGTTTGG");
        assert_eq!(lf[1].sequence, "NN");
    }

    #[test]
    fn header_without_body_yields_empty_sequence() {
        let records = parse(b">empty\n   \n").unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].sequence.is_empty());
    }
}
