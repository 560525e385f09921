use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use color_eyre::{
    eyre::{ensure, eyre, WrapErr},
    Result,
};
use serde::{Deserialize, Serialize};

use crate::args::{ToolPaths, TsdateMethod};
use crate::error::TsageError::{TimeOutputParseError, ToolError};
use crate::io::{
    append_ext, load_ts, read_geva_markers, read_geva_sites, read_relate_anc, read_relate_mut,
    relate_to_tree_sequence, write_geva_positions, RelateMutRow,
};
use crate::structs::TreeSequence;

const STDERR_TAIL: usize = 20;

/// CPU seconds (user + system) and peak resident memory in bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub cpu_time: f64,
    pub max_memory: f64,
}

pub fn absolute(path: &Path) -> Result<PathBuf> {
    match path.is_absolute() {
        true => Ok(path.to_path_buf()),
        false => Ok(std::env::current_dir()?.join(path)),
    }
}

fn command_line(program: &OsStr, args: &[OsString]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(|a| a.as_os_str()))
        .map(|a| a.to_string_lossy())
        .collect::<Vec<_>>()
        .join(" ")
}

fn stderr_tail(stderr: &[u8]) -> String {
    let stderr = String::from_utf8_lossy(stderr);
    let lines = stderr.lines().collect::<Vec<&str>>();
    lines[lines.len().saturating_sub(STDERR_TAIL)..].join("\n")
}

fn execute(program: &OsStr, args: &[OsString], cwd: Option<&Path>) -> Result<Output> {
    let mut cmd = Command::new(program);
    cmd.args(args);
    if let Some(cwd) = cwd {
        cmd.current_dir(cwd);
    }
    tracing::debug!("Running {}", command_line(program, args));

    let output = cmd
        .output()
        .wrap_err(eyre!("Failed to start {}", command_line(program, args)))?;

    if !output.status.success() {
        return Err(eyre!(ToolError((
            command_line(program, args),
            output.status.code(),
            stderr_tail(&output.stderr),
        ))));
    }
    Ok(output)
}

/// Run a command to completion and return its standard output
pub fn check_output<S: AsRef<OsStr>>(
    program: impl AsRef<OsStr>,
    args: &[S],
    cwd: Option<&Path>,
) -> Result<String> {
    let args = args.iter().map(|a| a.as_ref().to_os_string()).collect::<Vec<_>>();
    let output = execute(program.as_ref(), &args, cwd)?;
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parse the last line of `time -f "%M %S %U"` output
pub fn parse_time_output(stderr: &str) -> Result<ResourceUsage> {
    let line = stderr
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or_default();

    let fields = line.split_whitespace().collect::<Vec<&str>>();
    let parse = |s: &str| s.parse::<f64>().ok();
    match fields.as_slice() {
        [memory, sys, user] => match (parse(memory), parse(sys), parse(user)) {
            (Some(memory), Some(sys), Some(user)) => Ok(ResourceUsage {
                cpu_time: user + sys,
                max_memory: memory * 1024.0,
            }),
            _ => Err(eyre!(TimeOutputParseError(line.to_string()))),
        },
        _ => Err(eyre!(TimeOutputParseError(line.to_string()))),
    }
}

/// Run a command under GNU time and report its CPU time and peak memory
pub fn time_cmd<S: AsRef<OsStr>>(
    time_binary: &Path,
    program: impl AsRef<OsStr>,
    args: &[S],
    cwd: Option<&Path>,
) -> Result<ResourceUsage> {
    let mut full = vec![OsString::from("-f%M %S %U"), program.as_ref().to_os_string()];
    full.extend(args.iter().map(|a| a.as_ref().to_os_string()));

    let output = execute(time_binary.as_os_str(), &full, cwd)?;
    let usage = parse_time_output(&String::from_utf8_lossy(&output.stderr))?;
    tracing::debug!(
        "{} used {:.2} s CPU and {} bytes",
        program.as_ref().to_string_lossy(),
        usage.cpu_time,
        usage.max_memory
    );
    Ok(usage)
}

/// Date a genealogy with the tsdate wrapper script
#[allow(clippy::too_many_arguments)]
pub fn run_tsdate(
    tools: &ToolPaths,
    input: &Path,
    output: &Path,
    ne: f64,
    mutation_rate: f64,
    timepoints: usize,
    method: TsdateMethod,
) -> Result<(TreeSequence, ResourceUsage)> {
    let args: Vec<OsString> = vec![
        absolute(&tools.tsdate_script)?.into(),
        input.into(),
        output.into(),
        ne.to_string().into(),
        "--mutation-rate".into(),
        mutation_rate.to_string().into(),
        "--timepoints".into(),
        timepoints.to_string().into(),
        "--method".into(),
        method.to_string().into(),
    ];
    let usage = time_cmd(&tools.time_binary, &tools.python, &args, None)?;
    Ok((load_ts(output)?, usage))
}

/// Infer a genealogy from sample data with the tsinfer wrapper script
pub fn run_tsinfer(
    tools: &ToolPaths,
    samples: &Path,
    output: &Path,
    length: f64,
    threads: usize,
) -> Result<(TreeSequence, ResourceUsage)> {
    let args: Vec<OsString> = vec![
        absolute(&tools.tsinfer_script)?.into(),
        samples.into(),
        "--length".into(),
        (length as u64).to_string().into(),
        "--threads".into(),
        threads.to_string().into(),
        output.into(),
    ];
    let usage = time_cmd(&tools.time_binary, &tools.python, &args, None)?;
    Ok((load_ts(output)?, usage))
}

pub struct RelateRun<'a> {
    /// VCF path without its `.vcf` extension
    pub vcf_prefix: &'a Path,
    pub mutation_rate: f64,
    /// Haploid effective population size
    pub ne: f64,
    pub genetic_map: &'a Path,
    pub working_dir: &'a Path,
    pub output: &'a str,
    pub num_samples: usize,
    pub sequence_length: f64,
}

/// Run Relate in its own working directory and read back its trees and mutation ages
pub fn run_relate(
    tools: &ToolPaths,
    run: &RelateRun,
) -> Result<(TreeSequence, Vec<RelateMutRow>, ResourceUsage)> {
    std::fs::create_dir_all(run.working_dir)?;
    let cwd = Some(run.working_dir);
    let haps = format!("{}.haps", run.output);
    let sample = format!("{}.sample", run.output);

    check_output(
        absolute(&tools.relate_file_formats)?,
        &[
            OsString::from("--mode"),
            "ConvertFromVcf".into(),
            "--haps".into(),
            haps.clone().into(),
            "--sample".into(),
            sample.clone().into(),
            "-i".into(),
            absolute(run.vcf_prefix)?.into(),
        ],
        cwd,
    )?;

    let usage = time_cmd(
        &tools.time_binary,
        absolute(&tools.relate)?,
        &[
            OsString::from("--mode"),
            "All".into(),
            "-m".into(),
            run.mutation_rate.to_string().into(),
            "-N".into(),
            run.ne.to_string().into(),
            "--haps".into(),
            haps.into(),
            "--sample".into(),
            sample.into(),
            "--seed".into(),
            "1".into(),
            "-o".into(),
            run.output.into(),
            "--map".into(),
            absolute(run.genetic_map)?.into(),
        ],
        cwd,
    )?;

    let base = run.working_dir.join(run.output);
    let mutations = read_relate_mut(&append_ext("mut", &base))?;
    let (n, trees) = read_relate_anc(&append_ext("anc", &base))?;
    ensure!(
        n == run.num_samples,
        "Relate reports {n} haplotypes but the simulation has {} samples",
        run.num_samples
    );
    let ts = relate_to_tree_sequence(n, &trees, &mutations, run.sequence_length)?;

    Ok((ts, mutations, usage))
}

/// Age estimate for a position from GEVA's joint clock
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GevaAge {
    pub position: f64,
    pub age: f64,
}

/// Estimate allele ages with GEVA from `<prefix>.vcf`
pub fn run_geva(
    tools: &ToolPaths,
    prefix: &Path,
    ne: f64,
    mutation_rate: f64,
    rec_rate: f64,
) -> Result<(Vec<GevaAge>, ResourceUsage)> {
    let prefix = absolute(prefix)?;
    let cwd = prefix.parent();
    let geva = absolute(&tools.geva)?;

    check_output(
        &geva,
        &[
            OsString::from("--out"),
            prefix.clone().into(),
            "--rec".into(),
            rec_rate.to_string().into(),
            "--vcf".into(),
            append_ext("vcf", &prefix).into(),
        ],
        cwd,
    )?;

    let markers = read_geva_markers(&append_ext("marker.txt", &prefix))?;
    let positions = append_ext("positions.txt", &prefix);
    write_geva_positions(&markers, &positions)?;

    let mut estimation = prefix.clone().into_os_string();
    estimation.push("_estimation");
    let estimation = PathBuf::from(estimation);

    let usage = time_cmd(
        &tools.time_binary,
        &geva,
        &[
            OsString::from("-i"),
            append_ext("bin", &prefix).into(),
            "--positions".into(),
            positions.into(),
            "--hmm".into(),
            absolute(&tools.geva_hmm_initial)?.into(),
            absolute(&tools.geva_hmm_emission)?.into(),
            "--Ne".into(),
            ne.to_string().into(),
            "--mut".into(),
            mutation_rate.to_string().into(),
            "--maxConcordant".into(),
            "200".into(),
            "--maxDiscordant".into(),
            "200".into(),
            "-o".into(),
            estimation.clone().into(),
        ],
        cwd,
    )?;

    let sites = read_geva_sites(&append_ext("sites.txt", &estimation))?;
    let ages = sites
        .into_iter()
        .filter_map(|site| {
            markers
                .iter()
                .find(|m| m.marker_id == site.marker_id)
                .map(|m| GevaAge {
                    position: m.position,
                    age: site.post_mean,
                })
        })
        .collect();

    Ok((ages, usage))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_time_output() {
        let usage = parse_time_output("some tool output\n2048 0.50 1.25\n").unwrap();
        assert_eq!(usage.max_memory, 2048.0 * 1024.0);
        assert_eq!(usage.cpu_time, 1.75);

        assert!(parse_time_output("").is_err());
        assert!(parse_time_output("2048 0.50\n").is_err());
        assert!(parse_time_output("a b c\n").is_err());
    }

    #[test]
    fn test_check_output() {
        let out = check_output("echo", &["hello"], None).unwrap();
        assert_eq!(out.trim(), "hello");

        let dir = std::env::temp_dir();
        let out = check_output("pwd", &[] as &[&str], Some(&dir)).unwrap();
        assert!(!out.trim().is_empty());
    }

    #[test]
    fn test_failing_command_is_a_tool_error() {
        let err = check_output("sh", &["-c", "echo broken >&2; exit 3"], None).unwrap_err();
        let msg = format!("{err}");
        assert!(msg.contains("exit status 3"));
        assert!(msg.contains("broken"));
    }
}
