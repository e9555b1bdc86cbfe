//! Full pipeline run with stand-in scripts for the external tools.
#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use radplex::config::{RunConfig, ToolPaths};
use radplex::pipeline::{parse_steps, run_pipeline, PipelineStep};
use radplex::{DemuxError, MatchPolicy, TrimPolicy};

const TRIMMOMATIC: &str = r#"#!/bin/sh
cp "$5" "$7"; : > "$8"; cp "$6" "$9"; : > "${10}"
echo "Input Read Pairs: 2 Both Surviving: 1 (50.00%) Forward Only Surviving: 1 (50.00%) Reverse Only Surviving: 0 (0.00%) Dropped: 0 (0.00%)" >&2
"#;

const BWA: &str = r#"#!/bin/sh
echo "@HD	VN:1.6" > "$5"
echo "[M::process] read 3 sequences (30 bp)..." >&2
echo "[M::process] read 1 sequences (10 bp)..." >&2
"#;

const SAMTOOLS: &str = r#"#!/bin/sh
cp "$6" "$5"
"#;

const BCFTOOLS: &str = r#"#!/bin/sh
case "$1" in
  mpileup) : > "$7" ;;
  call) printf '##fileformat=VCFv4.2\n#CHROM\tPOS\nchr1\t5\nchr1\t9\nchr2\t1\n' > "$7" ;;
  *) exit 2 ;;
esac
"#;

fn script(dir: &Path, name: &str, body: &str) -> String {
    let path = dir.join(name);
    fs::write(&path, body).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path.to_string_lossy().into_owned()
}

fn fastq(names: &[&str], seqs: &[&str], mate: u8) -> String {
    names
        .iter()
        .zip(seqs)
        .map(|(n, s)| format!("@{n}/{mate}\n{s}\n+\n{}\n", "I".repeat(s.len())))
        .collect()
}

fn setup(root: &Path) -> RunConfig {
    let inputs = root.join("inputs");
    fs::create_dir_all(&inputs).unwrap();
    let barcodes = inputs.join("barcodes.txt");
    fs::write(&barcodes, "sample1\tCGAT\nsample2\tTGCA\n").unwrap();
    let names = ["a", "b", "c", "d"];
    let r1 = inputs.join("lib_R1.fastq");
    fs::write(&r1, fastq(&names, &["CGATTGCAAAAA", "CGATTGCACCCC", "TGCATGCAGGGG", "TGCATGCATTTT"], 1)).unwrap();
    let r2 = inputs.join("lib_R2.fastq");
    fs::write(&r2, fastq(&names, &["ACGT", "ACGT", "ACGT", "ACGT"], 2)).unwrap();
    let reference = inputs.join("ref.fa");
    fs::write(&reference, ">chr1\nACGTACGT\n").unwrap();

    let bin = root.join("bin");
    fs::create_dir_all(&bin).unwrap();
    RunConfig {
        label: "popA".into(),
        run_dir: root.join("run"),
        barcodes,
        overhang: "TGCA".into(),
        r1,
        r2,
        reference: Some(reference),
        match_policy: MatchPolicy::Exact,
        trim_policy: TrimPolicy::R1Only,
        threads: 2,
        tools: ToolPaths {
            trimmomatic: script(&bin, "trimmomatic", TRIMMOMATIC),
            bwa: script(&bin, "bwa", BWA),
            samtools: script(&bin, "samtools", SAMTOOLS),
            bcftools: script(&bin, "bcftools", BCFTOOLS),
        },
    }
}

fn summary(cfg: &RunConfig, step: &str) -> String {
    fs::read_to_string(cfg.summary_dir().join(format!("popA_{step}_summary.tsv"))).unwrap()
}

#[test]
fn all_steps_run_in_order_and_summarize() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = setup(dir.path());

    // Requested out of order; the pipeline still runs demultiplex first.
    let steps = parse_steps("call,align,trim,demultiplex").unwrap();
    assert_eq!(steps, PipelineStep::ALL.to_vec());
    run_pipeline(&cfg, &steps).unwrap();

    assert_eq!(RunConfig::load(cfg.config_path()).unwrap(), cfg);

    let demux = fs::read_to_string(cfg.demux_dir().join("sample2_popA_R1.fastq")).unwrap();
    assert_eq!(demux, "@c/1\nGGGG\n+\nIIII\n@d/1\nTTTT\n+\nIIII\n");
    assert!(summary(&cfg, "demultiplex").contains("sample1\t2\t50.00\t2\t50.00"));

    assert_eq!(
        summary(&cfg, "trim"),
        "sample\tinput_pairs\tsurviving_pairs\tpct_surviving\n\
         sample1\t2\t1\t50.00\n\
         sample2\t2\t1\t50.00\n"
    );
    let trimmed = cfg.trimmed_dir().join("sample1_popA_R1.paired.fastq");
    assert_eq!(fs::read(&trimmed).unwrap(), fs::read(cfg.demux_dir().join("sample1_popA_R1.fastq")).unwrap());

    assert_eq!(summary(&cfg, "align"), "sample\treads_processed\nsample1\t4\nsample2\t4\n");
    assert!(cfg.aligned_dir().join("sample2_popA.bam").is_file());
    assert!(cfg.logs_dir().join("align_sample1.log").is_file());

    assert_eq!(summary(&cfg, "call"), "label\tsamples\tvariant_records\npopA\t2\t3\n");
    assert!(cfg.variants_dir().join("popA.vcf").is_file());
}

#[test]
fn later_step_without_earlier_outputs_fails() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = setup(dir.path());
    let err = run_pipeline(&cfg, &[PipelineStep::Align]).unwrap_err();
    assert!(matches!(err, DemuxError::InputIo { ref path, .. } if path.ends_with("sample1_popA_R1.paired.fastq")));
    assert!(!cfg.summary_dir().join("popA_align_summary.tsv").exists());
}
