//! Per-sample output streams.
//!
//! Each sample owns one R1/R2 file pair named
//! `<sample>_<population>_R1.fastq` / `<sample>_<population>_R2.fastq` inside the
//! output directory, so downstream steps can locate them without a lookup table
//! (see [`sample_fastq_paths`]).
//!
//! Buckets open lazily on the first read routed to a sample. While a pass runs,
//! each bucket writes to `<name>.partial`; [`SampleWriterPool::close_all`] flushes
//! and renames every bucket to its final name. [`SampleWriterPool::abandon`] and
//! dropping the pool only flush, so an aborted run never leaves a file under a
//! final name.
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::barcodes::{BarcodeTable, SampleId};
use crate::error::{DemuxError, Result};
use crate::fastq::ReadPair;

const WRITE_BUFFER: usize = 1 << 16;
const PARTIAL_SUFFIX: &str = ".partial";

/// Deterministic R1/R2 output paths for a sample.
pub fn sample_fastq_paths(dir: &Path, sample: &str, population: &str) -> (PathBuf, PathBuf) {
    (
        dir.join(format!("{sample}_{population}_R1.fastq")),
        dir.join(format!("{sample}_{population}_R2.fastq")),
    )
}

/// Where a bucket writes until the pass completes: `path` with `.partial` appended.
pub fn partial_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

fn publish(from: &Path, to: &Path) -> Result<()> {
    fs::rename(from, to).map_err(|e| DemuxError::output_io(to, e))
}

/// Open output stream pair for one sample plus the number of pairs written to it.
pub struct SampleBucket {
    r1: BufWriter<File>,
    r2: BufWriter<File>,
    r1_path: PathBuf,
    r2_path: PathBuf,
    pairs: u64,
}

impl SampleBucket {
    fn create(r1_path: PathBuf, r2_path: PathBuf) -> Result<Self> {
        let (p1, p2) = (partial_path(&r1_path), partial_path(&r2_path));
        let r1 = File::create(&p1).map_err(|e| DemuxError::output_io(&p1, e))?;
        let r2 = File::create(&p2).map_err(|e| DemuxError::output_io(&p2, e))?;
        Ok(SampleBucket {
            r1: BufWriter::with_capacity(WRITE_BUFFER, r1),
            r2: BufWriter::with_capacity(WRITE_BUFFER, r2),
            r1_path,
            r2_path,
            pairs: 0,
        })
    }

    /// Append one pair, R1 to the R1 file and R2 to the R2 file.
    pub fn write_pair(&mut self, pair: &ReadPair) -> Result<()> {
        pair.r1.write_to(&mut self.r1).map_err(|e| DemuxError::output_io(&self.r1_path, e))?;
        pair.r2.write_to(&mut self.r2).map_err(|e| DemuxError::output_io(&self.r2_path, e))?;
        self.pairs += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.r1.flush().map_err(|e| DemuxError::output_io(&self.r1_path, e))?;
        self.r2.flush().map_err(|e| DemuxError::output_io(&self.r2_path, e))?;
        Ok(())
    }

    /// Flush, then move both files from their `.partial` names to the final ones.
    fn finish(&mut self) -> Result<()> {
        self.flush()?;
        publish(&partial_path(&self.r1_path), &self.r1_path)?;
        publish(&partial_path(&self.r2_path), &self.r2_path)
    }

    pub fn pairs(&self) -> u64 { self.pairs }

    /// Final R1/R2 paths, which only exist once the pool is closed.
    pub fn paths(&self) -> (&Path, &Path) { (&self.r1_path, &self.r2_path) }
}

/// A closed sample output as reported by [`SampleWriterPool::close_all`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleOutput {
    pub sample_name: String,
    pub r1_path: PathBuf,
    pub r2_path: PathBuf,
    pub pairs: u64,
}

/// Owns every sample's output streams for the duration of one run.
pub struct SampleWriterPool {
    dir: PathBuf,
    population: String,
    names: Vec<String>,
    buckets: Vec<Option<SampleBucket>>,
}

impl SampleWriterPool {
    /// Prepare a pool for `table`, creating `dir` if absent. No file is created yet.
    pub fn new(dir: impl AsRef<Path>, population: &str, table: &BarcodeTable) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| DemuxError::output_io(&dir, e))?;
        let names: Vec<String> = table.entries().iter().map(|e| e.sample_name.clone()).collect();
        let buckets = names.iter().map(|_| None).collect();
        Ok(SampleWriterPool { dir, population: population.to_string(), names, buckets })
    }

    /// Open (once) and return the bucket for `id`. Later calls reuse the same streams.
    pub fn open(&mut self, id: SampleId) -> Result<&mut SampleBucket> {
        let bucket = match self.buckets[id.0].take() {
            Some(bucket) => bucket,
            None => {
                let (r1, r2) = sample_fastq_paths(&self.dir, &self.names[id.0], &self.population);
                debug!("opening outputs for sample '{}': {}", self.names[id.0], r1.display());
                SampleBucket::create(r1, r2)?
            }
        };
        Ok(self.buckets[id.0].insert(bucket))
    }

    pub fn write_pair(&mut self, id: SampleId, pair: &ReadPair) -> Result<()> {
        self.open(id)?.write_pair(pair)
    }

    /// Make sure every sample has an output pair on disk, even if nothing was routed to it.
    pub fn open_all(&mut self) -> Result<()> {
        for i in 0..self.buckets.len() {
            self.open(SampleId(i))?;
        }
        Ok(())
    }

    pub fn is_open(&self, id: SampleId) -> bool { self.buckets[id.0].is_some() }

    /// Flush, close and publish every open bucket under its final name.
    ///
    /// All buckets are handled even if one fails; the first failure is returned.
    pub fn close_all(&mut self) -> Result<Vec<SampleOutput>> {
        let mut first_err = None;
        let mut outputs = Vec::new();
        for (name, slot) in self.names.iter().zip(self.buckets.iter_mut()) {
            if let Some(mut bucket) = slot.take() {
                if let Err(e) = bucket.finish() {
                    first_err.get_or_insert(e);
                    continue;
                }
                outputs.push(SampleOutput {
                    sample_name: name.clone(),
                    r1_path: bucket.r1_path,
                    r2_path: bucket.r2_path,
                    pairs: bucket.pairs,
                });
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(outputs),
        }
    }

    /// Flush and close every open bucket, leaving the data under the `.partial` names.
    pub fn abandon(&mut self) {
        for mut bucket in self.buckets.iter_mut().filter_map(Option::take) {
            match bucket.flush() {
                Ok(()) => warn!("left incomplete output {}", partial_path(&bucket.r1_path).display()),
                Err(e) => warn!("{e}"),
            }
        }
    }
}

impl Drop for SampleWriterPool {
    fn drop(&mut self) {
        for bucket in self.buckets.iter_mut().flatten() {
            if let Err(e) = bucket.flush() {
                warn!("{e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::barcodes::BarcodeEntry;
    use crate::fastq::FastqRecord;

    fn table() -> BarcodeTable {
        BarcodeTable::from_entries(
            vec![BarcodeEntry::new("CGAT", "sample1"), BarcodeEntry::new("TGCA", "sample2")],
            "TGCA",
        )
        .unwrap()
    }

    fn pair(name: &str) -> ReadPair {
        ReadPair { r1: FastqRecord::new(name, "ACGT", "IIII"), r2: FastqRecord::new(name, "TTGG", "JJJJ") }
    }

    #[test]
    fn paths_follow_naming_convention() {
        let (r1, r2) = sample_fastq_paths(Path::new("/out"), "sample1", "popA");
        assert_eq!(r1, PathBuf::from("/out/sample1_popA_R1.fastq"));
        assert_eq!(r2, PathBuf::from("/out/sample1_popA_R2.fastq"));
    }

    #[test]
    fn buckets_open_lazily_and_idempotently() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("nested/demux");
        let mut pool = SampleWriterPool::new(&out, "popA", &table()).unwrap();
        assert!(out.is_dir());
        assert!(!pool.is_open(SampleId(0)));

        pool.write_pair(SampleId(0), &pair("a")).unwrap();
        pool.write_pair(SampleId(0), &pair("b")).unwrap();
        assert_eq!(pool.open(SampleId(0)).unwrap().pairs(), 2);
        assert!(!out.join("sample2_popA_R1.fastq").exists());

        let outputs = pool.close_all().unwrap();
        assert_eq!(outputs.len(), 1);
        assert_eq!(outputs[0].pairs, 2);
        let r1 = fs::read_to_string(&outputs[0].r1_path).unwrap();
        assert_eq!(r1, "@a\nACGT\n+\nIIII\n@b\nACGT\n+\nIIII\n");
        let r2 = fs::read_to_string(&outputs[0].r2_path).unwrap();
        assert!(r2.starts_with("@a\nTTGG\n+\nJJJJ\n"));
    }

    #[test]
    fn open_all_creates_empty_files_for_idle_samples() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = SampleWriterPool::new(dir.path(), "popA", &table()).unwrap();
        pool.write_pair(SampleId(1), &pair("a")).unwrap();
        pool.open_all().unwrap();
        let outputs = pool.close_all().unwrap();
        assert_eq!(outputs.len(), 2);
        assert_eq!(fs::read_to_string(dir.path().join("sample1_popA_R2.fastq")).unwrap(), "");
    }

    #[test]
    fn outputs_keep_partial_names_until_closed() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = SampleWriterPool::new(dir.path(), "popA", &table()).unwrap();
        pool.write_pair(SampleId(0), &pair("a")).unwrap();
        assert!(dir.path().join("sample1_popA_R1.fastq.partial").is_file());
        assert!(!dir.path().join("sample1_popA_R1.fastq").exists());

        pool.close_all().unwrap();
        assert!(dir.path().join("sample1_popA_R1.fastq").is_file());
        assert!(!dir.path().join("sample1_popA_R1.fastq.partial").exists());
    }

    #[test]
    fn abandon_flushes_without_publishing() {
        let dir = tempfile::tempdir().unwrap();
        let mut pool = SampleWriterPool::new(dir.path(), "popA", &table()).unwrap();
        pool.write_pair(SampleId(0), &pair("a")).unwrap();
        pool.abandon();
        assert!(!pool.is_open(SampleId(0)));
        assert!(!dir.path().join("sample1_popA_R1.fastq").exists());
        let r1 = fs::read_to_string(dir.path().join("sample1_popA_R1.fastq.partial")).unwrap();
        assert_eq!(r1, "@a\nACGT\n+\nIIII\n");
    }

    #[test]
    fn dropping_the_pool_flushes_open_buckets() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut pool = SampleWriterPool::new(dir.path(), "popA", &table()).unwrap();
            pool.write_pair(SampleId(0), &pair("a")).unwrap();
        }
        let r1 = fs::read_to_string(dir.path().join("sample1_popA_R1.fastq.partial")).unwrap();
        assert_eq!(r1, "@a\nACGT\n+\nIIII\n");
        assert!(!dir.path().join("sample1_popA_R1.fastq").exists());
    }
}
