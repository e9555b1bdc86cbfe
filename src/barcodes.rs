//! Barcode tables: loading, validation and tag lookup.
//!
//! A barcode table maps an inline **barcode** to a **sample name**. At load time
//! every barcode is concatenated with the restriction-site **overhang** to form
//! the *tag* that a retained read must begin with (`CGAT` + `TGCA` → `CGATTGCA`).
//!
//! ### File format
//! Plain text, one entry per line. `#` comment lines and blank lines are ignored.
//! A line is either a single barcode column, in which case the sample name is the
//! barcode itself, or two tab-separated columns `sample<TAB>barcode`.
//!
//! ### Lookup
//! Exact lookups run through an anchored Aho–Corasick automaton built with
//! leftmost-longest semantics, so when tags of different lengths share a prefix
//! the **longest** tag wins. Mismatch-tolerant lookups are opt-in through
//! [`MatchPolicy::Mismatches`].
//!
//! # Examples
//! ```
//! use radplex::barcodes::{BarcodeEntry, BarcodeTable};
//! let table = BarcodeTable::from_entries(
//!     vec![BarcodeEntry::new("CGAT", "sample1"), BarcodeEntry::new("TGCA", "sample2")],
//!     "TGCA",
//! ).unwrap();
//! let id = table.lookup(b"CGATTGCAAAAA").unwrap();
//! assert_eq!(table.entry(id).sample_name, "sample1");
//! assert_eq!(table.tag(id), b"CGATTGCA");
//! ```
use std::cmp::Reverse;
use std::collections::HashSet;
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use aho_corasick::{AhoCorasick, Anchored, Input, MatchKind, StartKind};
use bio::alignment::distance::hamming;
use serde::{Deserialize, Serialize};

use crate::error::{DemuxError, Result};

/// Index of an entry within its [`BarcodeTable`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct SampleId(pub usize);

impl fmt::Display for SampleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "#{}", self.0) }
}

/// One barcode and the sample it identifies.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BarcodeEntry {
    /// Upper-case barcode bases.
    pub barcode: String,
    /// Sample name used for output file naming and reporting.
    pub sample_name: String,
}

impl BarcodeEntry {
    pub fn new(barcode: impl Into<String>, sample_name: impl Into<String>) -> Self {
        BarcodeEntry { barcode: barcode.into(), sample_name: sample_name.into() }
    }
}

/// How a read's leading window is compared against the table's tags.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPolicy {
    /// The read must begin with a tag, base for base.
    #[default]
    Exact,
    /// Accept up to `n` substitutions across the whole tag (Hamming distance).
    Mismatches(u8),
}

impl FromStr for MatchPolicy {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        if lower == "exact" {
            return Ok(MatchPolicy::Exact);
        }
        match lower.strip_prefix("mismatches:") {
            Some(n) => n
                .parse::<u8>()
                .map(MatchPolicy::Mismatches)
                .map_err(|_| format!("invalid mismatch count in '{s}'")),
            None => Err(format!("unknown match policy '{s}' (expected 'exact' or 'mismatches:N')")),
        }
    }
}

impl fmt::Display for MatchPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchPolicy::Exact => write!(f, "exact"),
            MatchPolicy::Mismatches(n) => write!(f, "mismatches:{n}"),
        }
    }
}

/// Outcome of comparing one read window against the table.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TagMatch {
    /// A single best tag was found.
    Matched(SampleId),
    /// Two or more tags of the same length tie for best; treated as unmatched.
    Ambiguous,
    /// No tag is close enough.
    Unmatched,
}

/// An immutable, validated set of barcodes with their expected tags.
///
/// Built once per run and shared read-only across worker threads.
#[derive(Clone, Debug)]
pub struct BarcodeTable {
    source: PathBuf,
    overhang: String,
    entries: Vec<BarcodeEntry>,
    tags: Vec<Vec<u8>>,
    max_tag_len: usize,
    matcher: AhoCorasick,
}

const IN_MEMORY: &str = "<in-memory barcode table>";

impl BarcodeTable {
    /// Load and validate a barcode table from disk.
    ///
    /// Fails with [`DemuxError::Config`] if the file is missing, unreadable,
    /// malformed or yields no entries.
    pub fn from_path<P: AsRef<Path>>(path: P, overhang: &str) -> Result<Self> {
        let p = path.as_ref();
        let file = File::open(p).map_err(|e| DemuxError::config(p, format!("cannot open barcode table: {e}")))?;
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(false)
            .delimiter(b'\t')
            .comment(Some(b'#'))
            .quoting(false)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(file);

        let mut rows: Vec<(u64, BarcodeEntry)> = Vec::new();
        for rec in rdr.records() {
            let r = rec.map_err(|e| DemuxError::config(p, format!("cannot read barcode table: {e}")))?;
            let line = r.position().map(|pos| pos.line()).unwrap_or(0);
            if r.iter().all(str::is_empty) {
                continue;
            }
            let fields: Vec<&str> = r.iter().collect();
            let entry = match fields.as_slice() {
                [barcode] => BarcodeEntry::new(*barcode, barcode.to_ascii_uppercase()),
                [sample, barcode] => BarcodeEntry::new(*barcode, *sample),
                _ => {
                    return Err(DemuxError::config(
                        p,
                        format!("line {line}: expected 1 or 2 tab-separated columns, found {}", fields.len()),
                    ))
                }
            };
            rows.push((line, entry));
        }
        Self::build(p, rows, overhang)
    }

    /// Build a table from entries already in memory.
    pub fn from_entries(entries: Vec<BarcodeEntry>, overhang: &str) -> Result<Self> {
        let rows = entries.into_iter().enumerate().map(|(i, e)| (i as u64 + 1, e)).collect();
        Self::build(Path::new(IN_MEMORY), rows, overhang)
    }

    fn build(source: &Path, rows: Vec<(u64, BarcodeEntry)>, overhang: &str) -> Result<Self> {
        let overhang = normalize_bases(overhang)
            .ok_or_else(|| DemuxError::config(source, format!("overhang '{overhang}' contains non-ACGTN characters")))?;
        if rows.is_empty() {
            return Err(DemuxError::config(source, "barcode table has no usable entries"));
        }

        let mut seen_barcodes = HashSet::new();
        let mut seen_samples = HashSet::new();
        let mut entries = Vec::with_capacity(rows.len());
        for (line, entry) in rows {
            let barcode = normalize_bases(&entry.barcode).ok_or_else(|| {
                DemuxError::config(source, format!("line {line}: barcode '{}' contains non-ACGTN characters", entry.barcode))
            })?;
            if barcode.is_empty() {
                return Err(DemuxError::config(source, format!("line {line}: empty barcode")));
            }
            if entry.sample_name.is_empty() {
                return Err(DemuxError::config(source, format!("line {line}: empty sample name")));
            }
            if !is_file_name_safe(&entry.sample_name) {
                return Err(DemuxError::config(
                    source,
                    format!("line {line}: sample name '{}' cannot be used in a file name", entry.sample_name),
                ));
            }
            if !seen_barcodes.insert(barcode.clone()) {
                return Err(DemuxError::config(source, format!("line {line}: barcode '{barcode}' is listed more than once")));
            }
            if !seen_samples.insert(entry.sample_name.clone()) {
                return Err(DemuxError::config(
                    source,
                    format!("line {line}: sample '{}' is listed more than once", entry.sample_name),
                ));
            }
            entries.push(BarcodeEntry { barcode, sample_name: entry.sample_name });
        }

        let tags: Vec<Vec<u8>> = entries.iter().map(|e| format!("{}{}", e.barcode, overhang).into_bytes()).collect();
        let max_tag_len = tags.iter().map(Vec::len).max().unwrap_or(0);
        let matcher = AhoCorasick::builder()
            .match_kind(MatchKind::LeftmostLongest)
            .start_kind(StartKind::Anchored)
            .ascii_case_insensitive(true)
            .build(&tags)
            .map_err(|e| DemuxError::config(source, format!("cannot index barcode tags: {e}")))?;

        Ok(BarcodeTable { source: source.to_path_buf(), overhang, entries, tags, max_tag_len, matcher })
    }

    /// Exact, longest-match-first lookup of the tag that `window` begins with.
    pub fn lookup(&self, window: &[u8]) -> Option<SampleId> {
        self.matcher
            .find(Input::new(window).anchored(Anchored::Yes))
            .map(|m| SampleId(m.pattern().as_usize()))
    }

    /// Compare `window` against every tag under `policy`.
    pub fn find(&self, window: &[u8], policy: MatchPolicy) -> TagMatch {
        match policy {
            MatchPolicy::Exact | MatchPolicy::Mismatches(0) => {
                self.lookup(window).map_or(TagMatch::Unmatched, TagMatch::Matched)
            }
            MatchPolicy::Mismatches(max) => self.find_tolerant(window, max as u64),
        }
    }

    fn find_tolerant(&self, window: &[u8], max: u64) -> TagMatch {
        let upper = window.to_ascii_uppercase();
        let mut best: Option<((u64, Reverse<usize>), SampleId)> = None;
        let mut tied = false;
        for (i, tag) in self.tags.iter().enumerate() {
            if upper.len() < tag.len() {
                continue;
            }
            let d = hamming(&upper[..tag.len()], tag);
            if d > max {
                continue;
            }
            let key = (d, Reverse(tag.len()));
            match best {
                Some((bk, _)) if key == bk => tied = true,
                Some((bk, _)) if key > bk => {}
                _ => {
                    best = Some((key, SampleId(i)));
                    tied = false;
                }
            }
        }
        match best {
            None => TagMatch::Unmatched,
            Some(_) if tied => TagMatch::Ambiguous,
            Some((_, id)) => TagMatch::Matched(id),
        }
    }

    pub fn entry(&self, id: SampleId) -> &BarcodeEntry { &self.entries[id.0] }

    /// Barcode followed by overhang, as matched against reads.
    pub fn tag(&self, id: SampleId) -> &[u8] { &self.tags[id.0] }

    pub fn entries(&self) -> &[BarcodeEntry] { &self.entries }

    pub fn sample_ids(&self) -> impl Iterator<Item = SampleId> { (0..self.entries.len()).map(SampleId) }

    pub fn len(&self) -> usize { self.entries.len() }

    pub fn is_empty(&self) -> bool { self.entries.is_empty() }

    /// Length of the longest tag; the width of the window inspected on each read.
    pub fn max_tag_len(&self) -> usize { self.max_tag_len }

    pub fn overhang(&self) -> &str { &self.overhang }

    pub fn source(&self) -> &Path { &self.source }
}

fn normalize_bases(s: &str) -> Option<String> {
    let up = s.trim().to_ascii_uppercase();
    up.bytes().all(|b| matches!(b, b'A' | b'C' | b'G' | b'T' | b'N')).then_some(up)
}

/// Sample names become part of output file names and must stay inside the output directory.
fn is_file_name_safe(name: &str) -> bool {
    name != "." && name != ".." && !name.contains(['/', '\\', '\0'])
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::io::Write;

    fn table(rows: &[(&str, &str)], overhang: &str) -> BarcodeTable {
        let entries = rows.iter().map(|(s, b)| BarcodeEntry::new(*b, *s)).collect();
        BarcodeTable::from_entries(entries, overhang).unwrap()
    }

    fn write_table(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    #[test]
    fn tags_are_barcode_plus_overhang() {
        let t = table(&[("sample1", "CGAT"), ("sample2", "TGCA")], "TGCA");
        assert_eq!(t.tag(SampleId(0)), b"CGATTGCA");
        assert_eq!(t.tag(SampleId(1)), b"TGCATGCA");
        assert_eq!(t.max_tag_len(), 8);
    }

    #[test]
    fn longest_tag_wins() {
        let t = table(&[("short", "AC"), ("long", "ACGT")], "");
        let id = t.lookup(b"ACGTTTTTT").unwrap();
        assert_eq!(t.entry(id).sample_name, "long");
        let id = t.lookup(b"ACTTTTTTT").unwrap();
        assert_eq!(t.entry(id).sample_name, "short");
    }

    #[test]
    fn lookup_is_anchored_at_read_start() {
        let t = table(&[("s", "CGAT")], "TGCA");
        assert_eq!(t.lookup(b"ACGATTGCA"), None);
        assert_eq!(t.lookup(b"CGATTGC"), None);
    }

    #[test]
    fn lowercase_reads_still_match() {
        let t = table(&[("s", "CGAT")], "TGCA");
        assert_eq!(t.lookup(b"cgattgcaaa"), Some(SampleId(0)));
    }

    #[test]
    fn loads_two_column_file_with_comments_and_blanks() {
        let f = write_table("# barcodes for plate 1\n\nsample1\tCGAT\n  \nsample2\ttgca\n");
        let t = BarcodeTable::from_path(f.path(), "tgca").unwrap();
        assert_eq!(t.len(), 2);
        assert_eq!(t.entries()[1], BarcodeEntry::new("TGCA", "sample2"));
        assert_eq!(t.overhang(), "TGCA");
    }

    #[test]
    fn single_column_uses_barcode_as_sample_name() {
        let f = write_table("CGAT\nttaa\n");
        let t = BarcodeTable::from_path(f.path(), "TGCA").unwrap();
        assert_eq!(t.entries()[0].sample_name, "CGAT");
        assert_eq!(t.entries()[1].sample_name, "TTAA");
    }

    #[rstest]
    #[case::only_comments("# nothing here\n\n")]
    #[case::duplicate_barcode("a\tCGAT\nb\tCGAT\n")]
    #[case::duplicate_sample("a\tCGAT\na\tTTAA\n")]
    #[case::bad_bases("a\tCGXT\n")]
    #[case::too_many_columns("a\tCGAT\textra\n")]
    #[case::empty_sample_name("\tCGAT\n")]
    #[case::sample_with_path_separator("../escape\tCGAT\n")]
    #[case::sample_with_backslash("a\\b\tCGAT\n")]
    #[case::sample_is_parent_dir("..\tCGAT\n")]
    fn rejects_unusable_tables(#[case] contents: &str) {
        let f = write_table(contents);
        let err = BarcodeTable::from_path(f.path(), "TGCA").unwrap_err();
        assert!(matches!(err, DemuxError::Config { .. }), "unexpected error: {err}");
    }

    #[test]
    fn missing_file_is_config_error() {
        let err = BarcodeTable::from_path("/definitely/not/here.txt", "TGCA").unwrap_err();
        assert!(matches!(err, DemuxError::Config { .. }));
    }

    #[test]
    fn duplicate_error_names_the_barcode() {
        let f = write_table("a\tCGAT\n# spacer\nb\tCGAT\n");
        let msg = BarcodeTable::from_path(f.path(), "").unwrap_err().to_string();
        assert!(msg.contains("'CGAT' is listed more than once"), "{msg}");
    }

    #[rstest]
    #[case("exact", MatchPolicy::Exact)]
    #[case("Mismatches:1", MatchPolicy::Mismatches(1))]
    #[case("mismatches:0", MatchPolicy::Mismatches(0))]
    fn parses_match_policy(#[case] s: &str, #[case] expected: MatchPolicy) {
        assert_eq!(s.parse::<MatchPolicy>().unwrap(), expected);
    }

    #[test]
    fn rejects_fuzzy_policy_without_count() {
        assert!("fuzzy".parse::<MatchPolicy>().is_err());
        assert!("mismatches:x".parse::<MatchPolicy>().is_err());
    }

    #[test]
    fn tolerant_match_accepts_one_substitution() {
        let t = table(&[("sample1", "CGAT"), ("sample2", "TTAA")], "TGCA");
        assert_eq!(t.find(b"CGTTTGCAGG", MatchPolicy::Exact), TagMatch::Unmatched);
        assert_eq!(t.find(b"CGTTTGCAGG", MatchPolicy::Mismatches(1)), TagMatch::Matched(SampleId(0)));
        assert_eq!(t.find(b"GGTTTGCAGG", MatchPolicy::Mismatches(1)), TagMatch::Unmatched);
    }

    #[test]
    fn tolerant_match_prefers_fewer_mismatches_then_longer_tag() {
        let t = table(&[("a", "AAAA"), ("b", "AAAT")], "");
        assert_eq!(t.find(b"AAATG", MatchPolicy::Mismatches(1)), TagMatch::Matched(SampleId(1)));
        let t = table(&[("short", "AC"), ("long", "ACGT")], "");
        assert_eq!(t.find(b"ACGTT", MatchPolicy::Mismatches(1)), TagMatch::Matched(SampleId(1)));
    }

    #[test]
    fn tolerant_tie_is_ambiguous() {
        let t = table(&[("a", "AAAA"), ("b", "AATT")], "");
        assert_eq!(t.find(b"AAAT", MatchPolicy::Mismatches(1)), TagMatch::Ambiguous);
    }

    #[test]
    fn zero_mismatches_behaves_as_exact() {
        let t = table(&[("a", "CGAT")], "TGCA");
        assert_eq!(t.find(b"CGTTTGCA", MatchPolicy::Mismatches(0)), TagMatch::Unmatched);
        assert_eq!(t.find(b"CGATTGCA", MatchPolicy::Mismatches(0)), TagMatch::Matched(SampleId(0)));
    }
}
