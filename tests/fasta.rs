use assert_matches::assert_matches;

use biopipeline::error::PipelineError;
use biopipeline::fasta;

#[test]
fn multi_record_file_keeps_order() {
    let input = b">chr1 first\nacgt\nACGT\n>chr2\nGGCC\n>chr3\n";
    let records = fasta::parse(input).unwrap();
    let headers: Vec<_> = records.iter().map(|r| r.header.as_str()).collect();
    assert_eq!(headers, vec!["chr1 first", "chr2", "chr3"]);
    assert_eq!(records[0].sequence, "ACGTACGT");
    assert_eq!(records[1].sequence, "GGCC");
    assert_eq!(records[2].sequence, "");
}

#[test]
fn text_before_first_header_is_ignored() {
    let records = fasta::parse(b"; comment line\nNNNN\n>real\nAT\n").unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].header, "real");
    assert_eq!(records[0].sequence, "AT");
}

#[test]
fn missing_trailing_newline_is_fine() {
    let records = fasta::parse(b">x\nAC GT").unwrap();
    assert_eq!(records[0].sequence, "ACGT");
}

#[test]
fn invalid_utf8_is_replaced_not_rejected() {
    let records = fasta::parse(b">bad\xff\nACGT\n").unwrap();
    assert!(records[0].header.starts_with("bad"));
    assert_eq!(records[0].sequence, "ACGT");
}

#[test]
fn whitespace_only_input_has_no_records() {
    let err = fasta::parse(b"   \r\n\t\n").unwrap_err();
    assert_matches!(err, PipelineError::Parse(message) if message.contains("no sequence"));
}
