use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use log::info;
use plotters::prelude::*;

use epimetapop::artifacts::{ArtifactWriter, Block, Stage};
use epimetapop::config::{patch_config, RunConfig};
use epimetapop::inference::{run_all_chains, InferenceConfig, ProposalKind, ScoredProposal, SubpopAssignment};
use epimetapop::integrator::IntegrationMethod;
use epimetapop::likelihood::per_subpop_log_likelihood;
use epimetapop::rng::rng_for;
use epimetapop::RunContext;

#[derive(Parser, Debug)]
#[command(name = "epimetapop", version, about = "Metapopulation compartmental disease simulator, outcomes pipeline and MCMC calibration engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one or more forward simulation replicates from a config.
    Simulate {
        config: PathBuf,
        #[arg(long, default_value = "rk4")]
        method: String,
        #[arg(long, default_value = "./output")]
        output: PathBuf,
        #[arg(long, default_value_t = 1)]
        slots: usize,
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
    /// Calibrate the declared free parameters against ground truth.
    Calibrate {
        config: PathBuf,
        #[arg(long, default_value = "./output")]
        output: PathBuf,
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
    /// Merge one or more override configs onto a base config.
    Patch {
        configs: Vec<PathBuf>,
        #[arg(long)]
        output: PathBuf,
    },
    /// Compartment-space inspection commands.
    Compartments {
        #[command(subcommand)]
        action: CompartmentsAction,
    },
    /// Modifier-stack inspection commands.
    Modifiers {
        #[command(subcommand)]
        action: ModifiersAction,
    },
}

#[derive(Subcommand, Debug)]
enum CompartmentsAction {
    /// Render the compartment space's initial population per
    /// compartment, summed across subpops, as a bar chart.
    Plot {
        config: PathBuf,
        #[arg(long, default_value = "compartments.png")]
        output: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum ModifiersAction {
    /// Render a seir modifier's net multiplier over the run's date
    /// range for a given subpop.
    ConfigPlot {
        config: PathBuf,
        parameter: String,
        #[arg(long)]
        subpop: String,
        #[arg(long, default_value = "modifiers.png")]
        output: PathBuf,
    },
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate { config, method, output, slots, seed } => run_simulate(&config, &method, &output, slots, seed),
        Commands::Calibrate { config, output, seed } => run_calibrate(&config, &output, seed),
        Commands::Patch { configs, output } => run_patch(&configs, &output),
        Commands::Compartments { action: CompartmentsAction::Plot { config, output } } => run_compartments_plot(&config, &output),
        Commands::Modifiers { action: ModifiersAction::ConfigPlot { config, parameter, subpop, output } } => {
            run_modifiers_plot(&config, &parameter, &subpop, &output)
        }
    }
}

fn parse_method(method: &str) -> Result<IntegrationMethod> {
    match method {
        "euler" => Ok(IntegrationMethod::Euler),
        "rk4" => Ok(IntegrationMethod::RungeKutta4),
        other => Err(anyhow!("unknown integration method '{other}', expected 'euler' or 'rk4'")),
    }
}

fn run_simulate(config_path: &PathBuf, method: &str, output: &PathBuf, slots: usize, seed: u64) -> Result<()> {
    info!("loading configuration from {:?}", config_path);
    let config = RunConfig::from_path(config_path).context("failed to load run configuration")?;
    let method = parse_method(method)?;
    let name = config.name.clone();
    let context = RunContext::build(config)?;

    let writer = ArtifactWriter::new(output, &name, "seir", "outcomes", "run1");
    let compartment_names: Vec<String> = context.space.compartments().iter().map(|c| c.name()).collect();
    let subpop_names = context.subpop_names();

    for slot in 0..slots {
        let mut rng = rng_for(seed, slot as u64);
        let trajectory = context.run_simulation(method, &mut rng)?;
        writer.write_trajectory("seir", Block::Global, Stage::Final, 0, slot, &compartment_names, &subpop_names, &trajectory)?;

        let outcome_rng = if context.config.seir.integration.stochastic { Some(&mut rng) } else { None };
        let per_subpop_outcomes = context.evaluate_outcomes(&trajectory, outcome_rng)?;
        for (s, subpop) in subpop_names.iter().enumerate() {
            writer.write_json("hosp", Block::Global, Stage::Final, 0, slot, &per_subpop_outcomes[s])?;
            info!("slot {slot}: subpop '{subpop}' produced {} outcome series", per_subpop_outcomes[s].len());
        }
    }

    info!("simulation complete, artifacts written under {:?}", writer.root);
    Ok(())
}

/// One row of a long-format ground-truth CSV: `subpop,statistic,day,value`.
#[derive(serde::Deserialize)]
struct GroundTruthRow {
    subpop: String,
    statistic: String,
    day: usize,
    value: f64,
}

fn load_ground_truth(path: &str, n_days: usize) -> Result<HashMap<(String, String), Vec<f64>>> {
    let mut reader = csv::Reader::from_path(path).with_context(|| format!("failed to open ground-truth file '{path}'"))?;
    let mut series: HashMap<(String, String), Vec<f64>> = HashMap::new();
    for record in reader.deserialize::<GroundTruthRow>() {
        let row = record?;
        if row.day >= n_days {
            continue;
        }
        series.entry((row.statistic.clone(), row.subpop.clone())).or_insert_with(|| vec![f64::NAN; n_days])[row.day] = row.value;
    }
    Ok(series)
}

#[derive(serde::Serialize)]
struct LoglikRecord<'a> {
    subpop: &'a str,
    log_likelihood: f64,
}

fn run_calibrate(config_path: &PathBuf, output: &PathBuf, seed: u64) -> Result<()> {
    let config = RunConfig::from_path(config_path).context("failed to load run configuration")?;
    if !config.inference.do_inference {
        return Err(anyhow!("configuration does not have inference.do_inference enabled"));
    }
    let gt_path = config.inference.gt_data_path.clone().ok_or_else(|| anyhow!("inference enabled but no gt_data_path configured"))?;
    let name = config.name.clone();
    let inference_config = InferenceConfig {
        iterations_per_slot: config.inference.iterations_per_slot,
        n_chains: config.inference.n_chains,
        ..Default::default()
    };
    let context = RunContext::build(config)?;
    let free_parameters = context.free_parameter_names().to_vec();
    if free_parameters.is_empty() {
        return Err(anyhow!("inference.free_parameters is empty; nothing to calibrate"));
    }
    let free_param_distributions = context.free_parameter_distributions()?;
    let is_modifier: Vec<bool> = free_parameters.iter().map(|name| context.is_modifier_name(name)).collect();

    let subpop_names = context.subpop_names();
    let compartment_names: Vec<String> = context.space.compartments().iter().map(|c| c.name()).collect();
    let n_days = context.n_days();
    let ground_truth = load_ground_truth(&gt_path, n_days)?;
    let statistics = context.config.inference.statistics.clone();

    let writer = ArtifactWriter::new(output, &name, "inferred", "med", "run1");

    // init and hpar don't vary with the proposal or the rng draw, so
    // they're written once per run rather than redundantly every
    // iteration.
    let initial = context.initial_state()?;
    let initial_rows: Vec<Vec<f64>> = (0..initial.nrows()).map(|c| initial.row(c).to_vec()).collect();
    writer.write_json("init", Block::Global, Stage::Final, 0, 0, &initial_rows)?;
    writer.write_json("hpar", Block::Global, Stage::Final, 0, 0, &context.config.outcomes.outcomes)?;

    let simulate_and_score = |chain_id: usize, iteration: usize, kind: ProposalKind, assignment: &SubpopAssignment| -> Result<ScoredProposal, String> {
        let mut parameter_overrides: HashMap<String, HashMap<String, f64>> = HashMap::new();
        let mut modifier_overrides: HashMap<String, f64> = HashMap::new();
        // A modifier's realized value is one draw per simulation, not
        // per subpop; for a chimeric call the subpop whose proposal
        // actually changed this round supplies that draw, for a global
        // call every subpop's entry already agrees so any one will do.
        let modifier_source_subpop = match kind {
            ProposalKind::Global => subpop_names.first().map(String::as_str).unwrap_or(""),
            ProposalKind::Chimeric { ref subpop } => subpop.as_str(),
        };
        for (idx, name) in free_parameters.iter().enumerate() {
            if is_modifier[idx] {
                if let Some(vector) = assignment.get(modifier_source_subpop) {
                    modifier_overrides.insert(name.clone(), vector.values[idx]);
                }
            } else {
                let per_subpop: HashMap<String, f64> = assignment.iter().map(|(s, v)| (s.clone(), v.values[idx])).collect();
                parameter_overrides.insert(name.clone(), per_subpop);
            }
        }

        let mut rng = rng_for(seed, chain_id as u64);
        let trajectory = context
            .run_simulation_with_overrides(IntegrationMethod::RungeKutta4, &mut rng, &parameter_overrides, &modifier_overrides)
            .map_err(|e| e.to_string())?;
        let per_subpop_outcomes = context
            .evaluate_outcomes(&trajectory, None::<&mut rand_chacha::ChaCha8Rng>)
            .map_err(|e| e.to_string())?;

        let per_subpop_loglik = per_subpop_log_likelihood(
            &statistics,
            |statistic_name, subpop_idx| per_subpop_outcomes[subpop_idx].get(statistic_name).cloned().unwrap_or_default(),
            |statistic_name, subpop_idx| {
                ground_truth
                    .get(&(statistic_name.to_string(), subpop_names[subpop_idx].clone()))
                    .cloned()
                    .unwrap_or_else(|| vec![f64::NAN; n_days])
            },
            subpop_names.len(),
        )
        .map_err(|e| e.to_string())?;

        let block = match kind {
            ProposalKind::Global => Block::Global,
            ProposalKind::Chimeric { .. } => Block::Chimeric,
        };
        let seeding_rng_seed = seed ^ (chain_id as u64).wrapping_mul(0x2545F4914F6CDD1D) ^ (iteration as u64);
        let mut seeding_rng = rng_for(seeding_rng_seed, 0);
        if let Ok(events) = context.seeding_events(&mut seeding_rng) {
            let _ = writer.write_json("seed", block, Stage::Intermediate, chain_id, iteration, &events);
        }
        let _ = writer.write_trajectory("seir", block, Stage::Intermediate, chain_id, iteration, &compartment_names, &subpop_names, &trajectory);
        let _ = writer.write_json("hosp", block, Stage::Intermediate, chain_id, iteration, &per_subpop_outcomes);
        let llik_records: Vec<LoglikRecord> = subpop_names
            .iter()
            .zip(per_subpop_loglik.iter())
            .map(|(subpop, &log_likelihood)| LoglikRecord { subpop, log_likelihood })
            .collect();
        let _ = writer.write_json("llik", block, Stage::Intermediate, chain_id, iteration, &llik_records);

        // The trajectory's own realized seir-modifier draws, named back
        // by modifier rather than kept as opaque ids.
        let mut snpi_rng = rng_for(seeding_rng_seed, 1);
        let realized_seir = context.seir_modifiers.realize(&mut snpi_rng, &modifier_overrides);
        let named_seir: HashMap<&str, f64> =
            context.seir_modifiers.names().iter().enumerate().filter_map(|(id, name)| realized_seir.get(&id).map(|v| (name.as_str(), *v))).collect();
        let _ = writer.write_json("snpi", block, Stage::Intermediate, chain_id, iteration, &named_seir);

        let mut hnpi_rng = rng_for(seeding_rng_seed, 2);
        let realized_hnpi = context.outcome_modifiers.realize(&mut hnpi_rng, &HashMap::new());
        let named_hnpi: HashMap<&str, f64> =
            context.outcome_modifiers.names().iter().enumerate().filter_map(|(id, name)| realized_hnpi.get(&id).map(|v| (name.as_str(), *v))).collect();
        let _ = writer.write_json("hnpi", block, Stage::Intermediate, chain_id, iteration, &named_hnpi);

        Ok(ScoredProposal { per_subpop_log_likelihood: per_subpop_loglik })
    };

    let results = run_all_chains(
        std::sync::Arc::new(inference_config),
        std::sync::Arc::new(free_param_distributions),
        std::sync::Arc::new(subpop_names.clone()),
        seed,
        simulate_and_score,
    );

    for (chain_id, result) in results.into_iter().enumerate() {
        match result {
            Ok(state) => {
                writer.write_parameters("spar", Block::Global, Stage::Final, chain_id, state.iterations_completed, &state.global)?;
                writer.write_json("spar", Block::Chimeric, Stage::Final, chain_id, state.iterations_completed, &state.chimeric)?;
                info!("chain {chain_id} finished with global log-likelihood {:.3}", state.global_log_likelihood);
            }
            Err(e) => return Err(anyhow!("chain {chain_id} aborted: {e}")),
        }
    }

    info!("calibration complete, artifacts written under {:?}", writer.root);
    Ok(())
}

fn run_patch(config_paths: &[PathBuf], output: &PathBuf) -> Result<()> {
    if config_paths.is_empty() {
        return Err(anyhow!("patch requires at least one configuration file"));
    }
    let mut merged = RunConfig::from_path(&config_paths[0])?;
    for path in &config_paths[1..] {
        let overlay = RunConfig::from_path(path)?;
        merged = patch_config(merged, overlay);
    }
    let yaml = serde_yaml::to_string(&merged)?;
    std::fs::write(output, yaml)?;
    info!("patched configuration written to {:?}", output);
    Ok(())
}

fn run_compartments_plot(config_path: &PathBuf, output: &PathBuf) -> Result<()> {
    let config = RunConfig::from_path(config_path)?;
    let context = RunContext::build(config)?;
    let initial = context.initial_state()?;
    let compartment_names: Vec<String> = context.space.compartments().iter().map(|c| c.name()).collect();
    let n_subpop = context.n_subpop();

    let root = BitMapBackend::new(output, (1024, 640)).into_drawing_area();
    root.fill(&WHITE)?;
    let totals: Vec<f64> = (0..compartment_names.len()).map(|c| (0..n_subpop).map(|s| initial[[c, s]]).sum()).collect();
    let max_population = totals.iter().cloned().fold(1.0_f64, f64::max);

    let mut chart = ChartBuilder::on(&root)
        .caption("initial population by compartment", ("sans-serif", 24))
        .margin(20)
        .x_label_area_size(60)
        .y_label_area_size(60)
        .build_cartesian_2d((0..compartment_names.len()).into_segmented(), 0.0..max_population * 1.1)?;
    chart.configure_mesh().x_desc("compartment").y_desc("population").draw()?;

    chart.draw_series(totals.iter().enumerate().map(|(c, &total)| {
        let x0 = SegmentValue::Exact(c);
        let x1 = SegmentValue::Exact(c + 1);
        Rectangle::new([(x0, 0.0), (x1, total)], BLUE.filled())
    }))?;
    root.present()?;
    info!("compartment plot written to {:?}", output);
    Ok(())
}

fn run_modifiers_plot(config_path: &PathBuf, parameter: &str, subpop: &str, output: &PathBuf) -> Result<()> {
    let config = RunConfig::from_path(config_path)?;
    let context = RunContext::build(config)?;
    let n_days = context.n_days();
    let start_date = context.config.start_date;

    let mut rng = rng_for(42, 0);
    let realized = context.seir_modifiers.realize(&mut rng, &HashMap::new());
    let series: Vec<(i32, f64)> = (0..n_days)
        .map(|day| {
            let date = start_date + chrono::Duration::days(day as i64);
            (day as i32, context.seir_modifiers.net_multiplier(parameter, date, subpop, &realized))
        })
        .collect();
    let max_value = series.iter().map(|(_, v)| *v).fold(1.0_f64, f64::max);

    let root = BitMapBackend::new(output, (1024, 480)).into_drawing_area();
    root.fill(&WHITE)?;
    let mut chart = ChartBuilder::on(&root)
        .caption(format!("'{parameter}' net multiplier ({subpop})"), ("sans-serif", 24))
        .margin(20)
        .x_label_area_size(40)
        .y_label_area_size(50)
        .build_cartesian_2d(0..n_days.max(1) as i32, 0.0..max_value * 1.1)?;
    chart.configure_mesh().x_desc("day").y_desc("multiplier").draw()?;
    chart.draw_series(LineSeries::new(series, &RED))?;
    root.present()?;
    info!("modifier plot written to {:?}", output);
    Ok(())
}
