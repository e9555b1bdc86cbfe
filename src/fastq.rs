//! Strict streaming IO for paired **FASTQ / FASTQ.GZ** inputs.
//!
//! ### Design
//! - Records are parsed with `needletail`, which also detects and decodes
//!   gzip-compressed input from its magic bytes.
//! - Parsing is strict: a structural problem is reported as
//!   [`DemuxError::MalformedRecord`] with the 1-based line number and the run stops.
//!   FASTA input is rejected.
//! - [`PairedReader`] drives an R1 and an R2 reader in lock-step and reports
//!   [`DemuxError::DesynchronizedPair`] on a count or identifier mismatch.
//!
//! ### Example
//! ```no_run
//! use radplex::fastq::PairedReader;
//! let mut pairs = PairedReader::open("lib_R1.fastq.gz", "lib_R2.fastq.gz").unwrap();
//! while let Some(pair) = pairs.next_pair().unwrap() {
//!     println!("{}", pair.id());
//! }
//! ```
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use needletail::errors::{ParseError, ParseErrorKind};
use needletail::{parse_fastx_reader, FastxReader};

use crate::error::{DemuxError, Result};

/// One FASTQ record with its header kept verbatim (minus the leading `@`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FastqRecord {
    pub header: String,
    pub seq: Vec<u8>,
    pub qual: Vec<u8>,
}

impl FastqRecord {
    pub fn new(header: impl Into<String>, seq: impl Into<Vec<u8>>, qual: impl Into<Vec<u8>>) -> Self {
        FastqRecord { header: header.into(), seq: seq.into(), qual: qual.into() }
    }

    /// Read name used for pairing: the first whitespace-delimited token of the
    /// header, without a trailing `/1` or `/2` mate suffix.
    pub fn id(&self) -> &str {
        let name = self.header.split_ascii_whitespace().next().unwrap_or("");
        name.strip_suffix("/1").or_else(|| name.strip_suffix("/2")).unwrap_or(name)
    }

    /// Drop the first `n` bases and qualities. Trimming past the end leaves an empty record.
    pub fn trim_front(&mut self, n: usize) {
        let n = n.min(self.seq.len());
        self.seq.drain(..n);
        self.qual.drain(..n.min(self.qual.len()));
    }

    /// Serialize as a 4-line FASTQ record.
    pub fn write_to<W: std::io::Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_all(b"@")?;
        w.write_all(self.header.as_bytes())?;
        w.write_all(b"\n")?;
        w.write_all(&self.seq)?;
        w.write_all(b"\n+\n")?;
        w.write_all(&self.qual)?;
        w.write_all(b"\n")?;
        Ok(())
    }
}

/// Lazy iterator over the records of a single FASTQ stream.
pub struct FastqReader {
    /// `None` for an empty stream.
    inner: Option<Box<dyn FastxReader>>,
    path: PathBuf,
    records: u64,
    done: bool,
}

/// Open a FASTQ file, plain or gzip-compressed.
///
/// Every call opens the file afresh, so iteration always starts at the first record.
pub fn open_fastq<P: AsRef<Path>>(path: P) -> Result<FastqReader> {
    let p = path.as_ref();
    let file = File::open(p).map_err(|e| DemuxError::input_io(p, e))?;
    FastqReader::new(file, p)
}

impl FastqReader {
    /// Wrap a byte stream; `path` is only used in error messages.
    ///
    /// Fails if the stream cannot be read or does not start like a FASTQ file.
    pub fn new<R: Read + Send + 'static>(inner: R, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let inner = match parse_fastx_reader(inner) {
            Ok(reader) => Some(reader),
            Err(e) if matches!(e.kind, ParseErrorKind::EmptyFile) => None,
            Err(e) => return Err(parse_error(&path, e)),
        };
        Ok(FastqReader { inner, path, records: 0, done: false })
    }

    pub fn path(&self) -> &Path { &self.path }

    /// Number of records returned so far.
    pub fn records(&self) -> u64 { self.records }

    /// Parse the next record. `Ok(None)` marks a clean end of stream.
    pub fn next_record(&mut self) -> Result<Option<FastqRecord>> {
        if self.done {
            return Ok(None);
        }
        let Some(reader) = self.inner.as_mut() else {
            self.done = true;
            return Ok(None);
        };
        let record = match reader.next() {
            None => {
                self.done = true;
                return Ok(None);
            }
            Some(Err(e)) => {
                self.done = true;
                return Err(parse_error(&self.path, e));
            }
            Some(Ok(rec)) => {
                let Some(qual) = rec.qual() else {
                    self.done = true;
                    return Err(DemuxError::malformed(&self.path, 1, "expected FASTQ records, found FASTA"));
                };
                FastqRecord {
                    header: String::from_utf8_lossy(rec.id()).to_string(),
                    seq: rec.seq().to_vec(),
                    qual: qual.to_vec(),
                }
            }
        };
        self.records += 1;
        Ok(Some(record))
    }
}

fn parse_error(path: &Path, e: ParseError) -> DemuxError {
    match e.kind {
        ParseErrorKind::Io => DemuxError::input_io(path, io::Error::other(e.msg)),
        _ => DemuxError::malformed(path, e.position.line.max(1), e.msg),
    }
}

impl Iterator for FastqReader {
    type Item = Result<FastqRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

/// Mates of one paired-end fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadPair {
    pub r1: FastqRecord,
    pub r2: FastqRecord,
}

impl ReadPair {
    pub fn id(&self) -> &str { self.r1.id() }
}

/// Drives an R1 and an R2 reader in lock-step.
pub struct PairedReader {
    r1: FastqReader,
    r2: FastqReader,
    pairs: u64,
}

impl PairedReader {
    /// Open both mates; an unreadable file is an [`DemuxError::InputIo`].
    pub fn open<P: AsRef<Path>, Q: AsRef<Path>>(r1: P, r2: Q) -> Result<Self> {
        Ok(PairedReader::new(open_fastq(r1)?, open_fastq(r2)?))
    }

    pub fn new(r1: FastqReader, r2: FastqReader) -> Self {
        PairedReader { r1, r2, pairs: 0 }
    }

    /// Number of complete pairs read so far.
    pub fn pairs_read(&self) -> u64 { self.pairs }

    fn desync(&self, reason: impl Into<String>) -> DemuxError {
        DemuxError::DesynchronizedPair {
            r1: self.r1.path().to_path_buf(),
            r2: self.r2.path().to_path_buf(),
            record: self.pairs + 1,
            reason: reason.into(),
        }
    }

    /// Next pair, `Ok(None)` once both streams end together.
    pub fn next_pair(&mut self) -> Result<Option<ReadPair>> {
        let a = self.r1.next_record()?;
        let b = self.r2.next_record()?;
        match (a, b) {
            (None, None) => Ok(None),
            (Some(_), None) => Err(self.desync("R2 ended before R1")),
            (None, Some(_)) => Err(self.desync("R1 ended before R2")),
            (Some(r1), Some(r2)) => {
                if r1.id() != r2.id() {
                    return Err(self.desync(format!("read names differ: '{}' vs '{}'", r1.id(), r2.id())));
                }
                self.pairs += 1;
                Ok(Some(ReadPair { r1, r2 }))
            }
        }
    }

    /// Fill `out` with up to `n` pairs; returns how many were added.
    pub fn next_chunk(&mut self, n: usize, out: &mut Vec<ReadPair>) -> Result<usize> {
        let start = out.len();
        while out.len() - start < n {
            match self.next_pair()? {
                Some(p) => out.push(p),
                None => break,
            }
        }
        Ok(out.len() - start)
    }
}
