//! Pipeline orchestration around the demultiplexer.
//!
//! A run is a fixed sequence of [`PipelineStep`]s. Only demultiplexing is done
//! in-process; trimming, alignment and variant calling are delegated to external
//! programs ([`ExternalTool`]) invoked with fixed argument templates. Each
//! invocation's output goes to its own log under `logs/`, and the logs are
//! parsed for the per-step summary tables written to `summary_files/`.
//!
//! Every step aborts the whole run on its first error.
use std::collections::BTreeSet;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::str::FromStr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::barcodes::BarcodeTable;
use crate::config::RunConfig;
use crate::demux;
use crate::error::{DemuxError, Result};
use crate::summary::{percent_of, write_atomically};
use crate::writers::sample_fastq_paths;

/// The closed set of pipeline steps, in execution order.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStep {
    Demultiplex,
    Trim,
    Align,
    Call,
}

impl PipelineStep {
    pub const ALL: [PipelineStep; 4] = [PipelineStep::Demultiplex, PipelineStep::Trim, PipelineStep::Align, PipelineStep::Call];

    pub fn name(self) -> &'static str {
        match self {
            PipelineStep::Demultiplex => "demultiplex",
            PipelineStep::Trim => "trim",
            PipelineStep::Align => "align",
            PipelineStep::Call => "call",
        }
    }
}

impl fmt::Display for PipelineStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.name()) }
}

impl FromStr for PipelineStep {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        PipelineStep::ALL
            .into_iter()
            .find(|step| step.name() == lower)
            .ok_or_else(|| format!("unknown pipeline step '{s}' (expected one of demultiplex, trim, align, call)"))
    }
}

/// Parse a comma-separated step list into execution order, without duplicates.
pub fn parse_steps(list: &str) -> Result<Vec<PipelineStep>> {
    let mut steps = BTreeSet::new();
    for part in list.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let step = part.parse::<PipelineStep>().map_err(|e| DemuxError::config("<steps>", e))?;
        steps.insert(step);
    }
    if steps.is_empty() {
        return Err(DemuxError::config("<steps>", "no pipeline steps requested"));
    }
    Ok(steps.into_iter().collect())
}

/// An external program the pipeline delegates to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalTool {
    /// Program name as configured; a bare name is searched on `PATH`.
    pub program: String,
}

impl ExternalTool {
    pub fn new(program: impl Into<String>) -> Self { ExternalTool { program: program.into() } }

    /// Resolve the program to an executable path, failing fast if it is absent.
    pub fn locate(&self) -> Result<PathBuf> {
        let candidate = Path::new(&self.program);
        if candidate.components().count() > 1 {
            return if candidate.is_file() {
                Ok(candidate.to_path_buf())
            } else {
                Err(DemuxError::tool(&self.program, "not found at the configured path"))
            };
        }
        std::env::var_os("PATH")
            .iter()
            .flat_map(std::env::split_paths)
            .map(|dir| dir.join(&self.program))
            .find(|p| p.is_file())
            .ok_or_else(|| {
                DemuxError::tool(&self.program, "not found on PATH; install it or set its path in run_config.json")
            })
    }

    /// Run with `args`, sending stdout and stderr to `log`. A non-zero exit is an error.
    pub fn run<S: AsRef<OsStr>>(&self, args: &[S], log: &Path) -> Result<()> {
        let exe = self.locate()?;
        if let Some(dir) = log.parent() {
            fs::create_dir_all(dir).map_err(|e| DemuxError::output_io(dir, e))?;
        }
        let out = File::create(log).map_err(|e| DemuxError::output_io(log, e))?;
        let err = out.try_clone().map_err(|e| DemuxError::output_io(log, e))?;
        info!("running {} (log: {})", self.program, log.display());
        let status = Command::new(&exe)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(out))
            .stderr(Stdio::from(err))
            .status()
            .map_err(|e| DemuxError::tool(&self.program, format!("could not start: {e}")))?;
        if !status.success() {
            return Err(DemuxError::tool(&self.program, format!("exited with {status}; see {}", log.display())));
        }
        Ok(())
    }
}

/// Output files of one trimmer invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrimOutputs {
    pub r1_paired: PathBuf,
    pub r1_unpaired: PathBuf,
    pub r2_paired: PathBuf,
    pub r2_unpaired: PathBuf,
}

impl TrimOutputs {
    pub fn for_sample(dir: &Path, sample: &str, label: &str) -> Self {
        let f = |mate: &str, kind: &str| dir.join(format!("{sample}_{label}_{mate}.{kind}.fastq"));
        TrimOutputs {
            r1_paired: f("R1", "paired"),
            r1_unpaired: f("R1", "unpaired"),
            r2_paired: f("R2", "paired"),
            r2_unpaired: f("R2", "unpaired"),
        }
    }
}

fn os(s: impl AsRef<OsStr>) -> OsString { s.as_ref().to_os_string() }

/// `trimmomatic PE -threads T -phred33 R1 R2 R1p R1u R2p R2u SLIDINGWINDOW:4:20 MINLEN:36`
pub fn trim_args(threads: usize, r1: &Path, r2: &Path, out: &TrimOutputs) -> Vec<OsString> {
    vec![
        os("PE"),
        os("-threads"),
        os(threads.to_string()),
        os("-phred33"),
        os(r1),
        os(r2),
        os(&out.r1_paired),
        os(&out.r1_unpaired),
        os(&out.r2_paired),
        os(&out.r2_unpaired),
        os("SLIDINGWINDOW:4:20"),
        os("MINLEN:36"),
    ]
}

/// `bwa mem -t T -o SAM REFERENCE R1 R2`
pub fn align_args(threads: usize, reference: &Path, r1: &Path, r2: &Path, sam: &Path) -> Vec<OsString> {
    vec![os("mem"), os("-t"), os(threads.to_string()), os("-o"), os(sam), os(reference), os(r1), os(r2)]
}

/// `samtools sort -@ T -o BAM SAM`
pub fn sort_args(threads: usize, sam: &Path, bam: &Path) -> Vec<OsString> {
    vec![os("sort"), os("-@"), os(threads.to_string()), os("-o"), os(bam), os(sam)]
}

/// `bcftools mpileup -f REFERENCE -O b -o BCF BAMS...`
pub fn mpileup_args(reference: &Path, bcf: &Path, bams: &[PathBuf]) -> Vec<OsString> {
    let mut args = vec![os("mpileup"), os("-f"), os(reference), os("-O"), os("b"), os("-o"), os(bcf)];
    args.extend(bams.iter().map(os));
    args
}

/// `bcftools call -m -v -O v -o VCF BCF`
pub fn call_args(bcf: &Path, vcf: &Path) -> Vec<OsString> {
    vec![os("call"), os("-m"), os("-v"), os("-O"), os("v"), os("-o"), os(vcf), os(bcf)]
}

/// Pair counts reported by the trimmer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrimLogStats {
    pub input_pairs: u64,
    pub surviving_pairs: u64,
}

fn number_after<'a>(tokens: &[&'a str], label: &[&str]) -> Option<u64> {
    tokens
        .windows(label.len() + 1)
        .find(|w| w[..label.len()] == *label)
        .and_then(|w| w[label.len()].parse().ok())
}

/// Parse the `Input Read Pairs: N Both Surviving: M (P%) ...` line of a trimmer log.
pub fn parse_trim_log(text: &str) -> Option<TrimLogStats> {
    let line = text.lines().find(|l| l.trim_start().starts_with("Input Read Pairs:"))?;
    let tokens: Vec<&str> = line.split_whitespace().collect();
    Some(TrimLogStats {
        input_pairs: number_after(&tokens, &["Pairs:"])?,
        surviving_pairs: number_after(&tokens, &["Both", "Surviving:"])?,
    })
}

/// Sum of the `[M::process] read N sequences` lines of an aligner log.
pub fn parse_align_log(text: &str) -> u64 {
    text.lines()
        .filter(|l| l.starts_with("[M::process] read "))
        .filter_map(|l| l.split_whitespace().nth(2)?.parse::<u64>().ok())
        .sum()
}

/// Number of data (non-`#`) lines in a VCF.
pub fn count_vcf_records(path: &Path) -> Result<u64> {
    let f = File::open(path).map_err(|e| DemuxError::input_io(path, e))?;
    let mut n = 0;
    for line in BufReader::new(f).lines() {
        let line = line.map_err(|e| DemuxError::input_io(path, e))?;
        if !line.is_empty() && !line.starts_with('#') {
            n += 1;
        }
    }
    Ok(n)
}

fn write_tsv(path: &Path, header: &[&str], rows: &[Vec<String>]) -> Result<()> {
    let mut w = csv::WriterBuilder::new().delimiter(b'\t').from_writer(Vec::new());
    let to_err = |e: csv::Error| DemuxError::output_io(path, std::io::Error::other(e));
    w.write_record(header).map_err(to_err)?;
    for row in rows {
        w.write_record(row).map_err(to_err)?;
    }
    let bytes = w.into_inner().map_err(|e| DemuxError::output_io(path, std::io::Error::other(e.to_string())))?;
    write_atomically(path, &bytes)
}

fn read_log(path: &Path) -> Result<String> { fs::read_to_string(path).map_err(|e| DemuxError::input_io(path, e)) }

fn step_summary_path(cfg: &RunConfig, step: PipelineStep) -> PathBuf {
    cfg.summary_dir().join(format!("{}_{}_summary.tsv", cfg.label, step.name()))
}

fn tools_for(cfg: &RunConfig, step: PipelineStep) -> Vec<ExternalTool> {
    match step {
        PipelineStep::Demultiplex => vec![],
        PipelineStep::Trim => vec![ExternalTool::new(&cfg.tools.trimmomatic)],
        PipelineStep::Align => vec![ExternalTool::new(&cfg.tools.bwa), ExternalTool::new(&cfg.tools.samtools)],
        PipelineStep::Call => vec![ExternalTool::new(&cfg.tools.bcftools)],
    }
}

/// Run `steps` (in pipeline order) for `cfg`.
///
/// Tool presence and required configuration are checked for every requested
/// step before any step starts.
pub fn run_pipeline(cfg: &RunConfig, steps: &[PipelineStep]) -> Result<()> {
    run_pipeline_with_cancel(cfg, steps, Arc::new(AtomicBool::new(false)))
}

/// As [`run_pipeline`], with a flag that stops the demultiplex step early when set.
pub fn run_pipeline_with_cancel(cfg: &RunConfig, steps: &[PipelineStep], cancel: Arc<AtomicBool>) -> Result<()> {
    cfg.validate()?;
    let steps: BTreeSet<PipelineStep> = steps.iter().copied().collect();
    for &step in &steps {
        if matches!(step, PipelineStep::Align | PipelineStep::Call) {
            cfg.require_reference(step.name())?;
        }
        for tool in tools_for(cfg, step) {
            tool.locate()?;
        }
    }
    cfg.save()?;

    for step in steps {
        info!("=== step: {step} ===");
        match step {
            PipelineStep::Demultiplex => run_demultiplex(cfg, &cancel)?,
            PipelineStep::Trim => run_trim(cfg)?,
            PipelineStep::Align => run_align(cfg)?,
            PipelineStep::Call => run_call(cfg)?,
        }
    }
    Ok(())
}

fn sample_names(cfg: &RunConfig) -> Result<Vec<String>> {
    let table = BarcodeTable::from_path(&cfg.barcodes, &cfg.overhang)?;
    Ok(table.entries().iter().map(|e| e.sample_name.clone()).collect())
}

fn require_input(path: &Path) -> Result<()> {
    if path.is_file() {
        Ok(())
    } else {
        Err(DemuxError::input_io(path, std::io::Error::new(std::io::ErrorKind::NotFound, "expected output of an earlier step")))
    }
}

fn run_demultiplex(cfg: &RunConfig, cancel: &Arc<AtomicBool>) -> Result<()> {
    let mut opts = cfg.demux_options();
    opts.cancel = Arc::clone(cancel);
    demux::demultiplex_files(&cfg.barcodes, &cfg.overhang, &cfg.r1, &cfg.r2, &opts)?;
    Ok(())
}

fn run_trim(cfg: &RunConfig) -> Result<()> {
    let tool = ExternalTool::new(&cfg.tools.trimmomatic);
    let mut rows = Vec::new();
    for sample in sample_names(cfg)? {
        let (r1, r2) = sample_fastq_paths(&cfg.demux_dir(), &sample, &cfg.label);
        require_input(&r1)?;
        require_input(&r2)?;
        let out = TrimOutputs::for_sample(&cfg.trimmed_dir(), &sample, &cfg.label);
        fs::create_dir_all(cfg.trimmed_dir()).map_err(|e| DemuxError::output_io(cfg.trimmed_dir(), e))?;
        let log = cfg.logs_dir().join(format!("trim_{sample}.log"));
        tool.run(&trim_args(cfg.threads, &r1, &r2, &out), &log)?;
        let stats = parse_trim_log(&read_log(&log)?)
            .ok_or_else(|| DemuxError::tool(&tool.program, format!("no read-pair totals in {}", log.display())))?;
        rows.push(vec![
            sample,
            stats.input_pairs.to_string(),
            stats.surviving_pairs.to_string(),
            format!("{:.2}", percent_of(stats.surviving_pairs, stats.input_pairs)),
        ]);
    }
    write_tsv(
        &step_summary_path(cfg, PipelineStep::Trim),
        &["sample", "input_pairs", "surviving_pairs", "pct_surviving"],
        &rows,
    )
}

fn run_align(cfg: &RunConfig) -> Result<()> {
    let reference = cfg.require_reference("align")?;
    let bwa = ExternalTool::new(&cfg.tools.bwa);
    let samtools = ExternalTool::new(&cfg.tools.samtools);
    let dir = cfg.aligned_dir();
    fs::create_dir_all(&dir).map_err(|e| DemuxError::output_io(&dir, e))?;
    let mut rows = Vec::new();
    for sample in sample_names(cfg)? {
        let trimmed = TrimOutputs::for_sample(&cfg.trimmed_dir(), &sample, &cfg.label);
        require_input(&trimmed.r1_paired)?;
        require_input(&trimmed.r2_paired)?;
        let sam = dir.join(format!("{sample}_{}.sam", cfg.label));
        let bam = sam.with_extension("bam");
        let log = cfg.logs_dir().join(format!("align_{sample}.log"));
        bwa.run(&align_args(cfg.threads, reference, &trimmed.r1_paired, &trimmed.r2_paired, &sam), &log)?;
        let reads = parse_align_log(&read_log(&log)?);
        if reads == 0 {
            warn!("aligner reported no reads for sample '{sample}'");
        }
        samtools.run(&sort_args(cfg.threads, &sam, &bam), &cfg.logs_dir().join(format!("sort_{sample}.log")))?;
        rows.push(vec![sample, reads.to_string()]);
    }
    write_tsv(&step_summary_path(cfg, PipelineStep::Align), &["sample", "reads_processed"], &rows)
}

fn run_call(cfg: &RunConfig) -> Result<()> {
    let reference = cfg.require_reference("call")?;
    let bcftools = ExternalTool::new(&cfg.tools.bcftools);
    let mut bams = Vec::new();
    for sample in sample_names(cfg)? {
        let bam = cfg.aligned_dir().join(format!("{sample}_{}.bam", cfg.label));
        require_input(&bam)?;
        bams.push(bam);
    }
    let dir = cfg.variants_dir();
    fs::create_dir_all(&dir).map_err(|e| DemuxError::output_io(&dir, e))?;
    let bcf = dir.join(format!("{}.bcf", cfg.label));
    let vcf = dir.join(format!("{}.vcf", cfg.label));
    bcftools.run(&mpileup_args(reference, &bcf, &bams), &cfg.logs_dir().join("call_mpileup.log"))?;
    bcftools.run(&call_args(&bcf, &vcf), &cfg.logs_dir().join("call_call.log"))?;
    let n = count_vcf_records(&vcf)?;
    info!("{n} variant records in {}", vcf.display());
    write_tsv(
        &step_summary_path(cfg, PipelineStep::Call),
        &["label", "samples", "variant_records"],
        &[vec![cfg.label.clone(), bams.len().to_string(), n.to_string()]],
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::barcodes::MatchPolicy;
    use crate::config::ToolPaths;
    use crate::demux::TrimPolicy;
    use rstest::rstest;

    #[rstest]
    #[case("demultiplex", PipelineStep::Demultiplex)]
    #[case("Trim", PipelineStep::Trim)]
    #[case(" align ", PipelineStep::Align)]
    #[case("CALL", PipelineStep::Call)]
    fn steps_parse_by_exact_name(#[case] s: &str, #[case] step: PipelineStep) {
        assert_eq!(s.parse::<PipelineStep>().unwrap(), step);
    }

    #[rstest]
    #[case("demux")]
    #[case("trimming")]
    #[case("al")]
    fn partial_or_unknown_names_are_rejected(#[case] s: &str) {
        assert!(s.parse::<PipelineStep>().is_err());
    }

    #[test]
    fn step_lists_run_in_pipeline_order() {
        let steps = parse_steps("call,demultiplex, trim,call").unwrap();
        assert_eq!(steps, vec![PipelineStep::Demultiplex, PipelineStep::Trim, PipelineStep::Call]);
        assert!(matches!(parse_steps(" , "), Err(DemuxError::Config { .. })));
        assert!(matches!(parse_steps("trim,bogus"), Err(DemuxError::Config { .. })));
    }

    #[test]
    fn argument_templates_are_fixed() {
        let out = TrimOutputs::for_sample(Path::new("t"), "s1", "pop");
        let args = trim_args(4, Path::new("d/s1_pop_R1.fastq"), Path::new("d/s1_pop_R2.fastq"), &out);
        let args: Vec<String> = args.iter().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(
            args,
            vec![
                "PE", "-threads", "4", "-phred33", "d/s1_pop_R1.fastq", "d/s1_pop_R2.fastq",
                "t/s1_pop_R1.paired.fastq", "t/s1_pop_R1.unpaired.fastq",
                "t/s1_pop_R2.paired.fastq", "t/s1_pop_R2.unpaired.fastq",
                "SLIDINGWINDOW:4:20", "MINLEN:36",
            ]
        );

        let args = align_args(2, Path::new("ref.fa"), Path::new("a.fq"), Path::new("b.fq"), Path::new("o.sam"));
        assert_eq!(args, ["mem", "-t", "2", "-o", "o.sam", "ref.fa", "a.fq", "b.fq"].map(OsString::from).to_vec());

        let args = mpileup_args(Path::new("ref.fa"), Path::new("p.bcf"), &[PathBuf::from("a.bam"), PathBuf::from("b.bam")]);
        assert_eq!(args.last().unwrap(), "b.bam");
        assert_eq!(call_args(Path::new("p.bcf"), Path::new("v.vcf"))[0], "call");
    }

    #[test]
    fn parses_trimmer_totals() {
        let log = "TrimmomaticPE: Started with arguments:\n PE -threads 4 ...\n\
                   Input Read Pairs: 1000 Both Surviving: 912 (91.20%) Forward Only Surviving: 50 (5.00%) \
                   Reverse Only Surviving: 20 (2.00%) Dropped: 18 (1.80%)\nTrimmomaticPE: Completed successfully\n";
        assert_eq!(parse_trim_log(log), Some(TrimLogStats { input_pairs: 1000, surviving_pairs: 912 }));
        assert_eq!(parse_trim_log("TrimmomaticPE: Completed successfully\n"), None);
    }

    #[test]
    fn sums_aligner_batches() {
        let log = "[M::bwa_idx_load_from_disk] read 0 ALT contigs\n\
                   [M::process] read 200000 sequences (20000000 bp)...\n\
                   [M::mem_process_seqs] Processed 200000 reads in 10.0 CPU sec\n\
                   [M::process] read 1234 sequences (123400 bp)...\n";
        assert_eq!(parse_align_log(log), 201_234);
        assert_eq!(parse_align_log(""), 0);
    }

    #[test]
    fn counts_vcf_data_lines() {
        let dir = tempfile::tempdir().unwrap();
        let vcf = dir.path().join("v.vcf");
        fs::write(&vcf, "##fileformat=VCFv4.2\n#CHROM\tPOS\nchr1\t10\nchr1\t20\n\n").unwrap();
        assert_eq!(count_vcf_records(&vcf).unwrap(), 2);
    }

    #[test]
    fn missing_tool_fails_fast() {
        let err = ExternalTool::new("radplex-no-such-tool-xyz").locate().unwrap_err();
        assert!(matches!(err, DemuxError::ExternalTool { .. }));
        let err = ExternalTool::new("/no/such/dir/trimmomatic").locate().unwrap_err();
        assert!(err.to_string().contains("configured path"));
    }

    #[cfg(unix)]
    #[test]
    fn failing_tool_reports_its_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("logs/fail.log");
        let err = ExternalTool::new("sh").run(&["-c", "echo boom >&2; exit 3"], &log).unwrap_err();
        assert!(err.to_string().contains("fail.log"));
        assert!(fs::read_to_string(&log).unwrap().contains("boom"));
    }

    fn config(run_dir: &Path) -> RunConfig {
        RunConfig {
            label: "popA".into(),
            run_dir: run_dir.to_path_buf(),
            barcodes: run_dir.join("barcodes.txt"),
            overhang: "TGCA".into(),
            r1: run_dir.join("r1.fq"),
            r2: run_dir.join("r2.fq"),
            reference: None,
            match_policy: MatchPolicy::Exact,
            trim_policy: TrimPolicy::R1Only,
            threads: 1,
            tools: ToolPaths { trimmomatic: "radplex-no-such-trimmer".into(), ..ToolPaths::default() },
        }
    }

    #[test]
    fn preflight_rejects_missing_reference_before_any_work() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let err = run_pipeline(&cfg, &[PipelineStep::Demultiplex, PipelineStep::Align]).unwrap_err();
        assert!(matches!(err, DemuxError::Config { .. }));
        assert!(!cfg.demux_dir().exists());
    }

    #[test]
    fn preflight_rejects_missing_trimmer() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = config(dir.path());
        let err = run_pipeline(&cfg, &[PipelineStep::Trim]).unwrap_err();
        assert!(matches!(err, DemuxError::ExternalTool { ref tool, .. } if tool == "radplex-no-such-trimmer"));
    }
}
