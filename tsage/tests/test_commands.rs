mod common;
use common::{outdir, small_sample_data};

use color_eyre::Result;

use tsage::args::{AgeAggregate, SimulationArgs};
use tsage::io::{load_ts, read_csv_rows};
use tsage::sample_data::SampleData;
use tsage::subcommands::{add_errors, compare, convert, kc, simulate};

#[test]
fn test_sample_data_vcf() -> Result<()> {
    let path = outdir().join("snapshot_converted.vcf");
    convert::sample_data_to_vcf(&small_sample_data(), &path)?;

    let vcf = std::fs::read_to_string(&path)?;
    insta::assert_snapshot!("sample_data_vcf", vcf.trim_end());
    Ok(())
}

#[test]
fn test_simulate_and_compare() -> Result<()> {
    let output = outdir();
    let prefix = Some("pipeline".to_string());

    let args = SimulationArgs {
        sample_size: 10,
        seed: 42,
        ..Default::default()
    };
    simulate::run(args, output.clone(), prefix.clone())?;
    let trees = output.join("pipeline_simulated.trees");
    let ts = load_ts(&trees)?;
    assert_eq!(ts.num_samples(), 10);
    assert!(ts.num_sites() > 0);

    add_errors::run(trees.clone(), output.clone(), prefix.clone(), 0.1, 0.0, None, 1)?;
    let data = SampleData::load(output.join("pipeline_error.samples"))?;
    assert_eq!(data.num_sites(), ts.num_sites());
    assert!(data.is_finalised());

    convert::run(trees.clone(), output.clone(), prefix.clone(), false)?;
    let vcf = std::fs::read_to_string(output.join("pipeline_converted.vcf"))?;
    assert!(vcf.starts_with("##fileformat=VCFv4.2"));
    assert!(vcf.contains("\tmsp_4\n"));

    compare::run(
        vec![trees.clone(), trees.clone()],
        Some(vec!["simulated_ts".to_string(), "copy".to_string()]),
        None,
        output.clone(),
        prefix.clone(),
        false,
        AgeAggregate::Arithmetic,
    )?;
    let summary: Vec<compare::AccuracyRow> =
        read_csv_rows(&output.join("pipeline_compare_ages_summary.csv"))?;
    assert_eq!(summary.len(), 1);
    assert_eq!(summary[0].method, "copy");
    assert_eq!(summary[0].mse, 0.0);

    kc::run(
        vec![trees.clone(), trees],
        None,
        vec![0.0, 1.0],
        false,
        true,
        1,
        output.clone(),
        prefix,
    )?;
    let rows: Vec<kc::KcRow> = read_csv_rows(&output.join("pipeline_kc_distances.csv"))?;
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|r| r.distance == 0.0));
    assert!(output.join("pipeline_tmrcas.csv").exists());

    Ok(())
}

#[test]
fn test_simulate_ancient_samples_and_size_changes() -> Result<()> {
    let output = outdir();
    let prefix = Some("ancient".to_string());

    let args = SimulationArgs {
        sample_size: 6,
        seed: 7,
        ancient_samples: vec![40.0, 400.0],
        size_changes: vec![(100.0, 500.0), (1000.0, 20000.0)],
        ..Default::default()
    };
    simulate::run(args, output.clone(), prefix.clone())?;
    let ts = load_ts(&output.join("ancient_simulated.trees"))?;
    assert_eq!(ts.num_samples(), 8);
    assert_eq!(ts.nodes()[6].time, 40.0);
    assert_eq!(ts.nodes()[7].time, 400.0);

    let data = SampleData::from_tree_sequence(&ts, false)?;
    assert_eq!(data.individuals_time()[6..], [40.0, 400.0]);

    let args = SimulationArgs {
        size_changes: vec![(100.0, -5.0)],
        ..Default::default()
    };
    assert!(simulate::run(args, output, prefix).is_err());
    Ok(())
}

#[test]
fn test_genetic_map() -> Result<()> {
    let output = outdir().join("genetic_map");
    std::fs::create_dir_all(&output)?;
    convert::run_genetic_map(output.clone(), 1e5, 1e-8)?;

    let map = std::fs::read_to_string(output.join("genetic_map.txt"))?;
    let lines = map.lines().collect::<Vec<&str>>();
    assert_eq!(lines[0], "position COMBINED_rate.cM.Mb. Genetic_Map.cM.");
    assert_eq!(lines.len(), 3);
    Ok(())
}
