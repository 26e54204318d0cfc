use std::io::Write;

use epimetapop::config::RunConfig;
use epimetapop::integrator::IntegrationMethod;
use epimetapop::rng::rng_for;
use epimetapop::RunContext;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

fn scratch_dir(tag: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("epimetapop_integration_{tag}_{:?}", std::thread::current().id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

fn write_geodata(dir: &std::path::Path) -> std::path::PathBuf {
    let path = dir.join("geodata.csv");
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(file, "subpop_id,population").unwrap();
    writeln!(file, "north,10000").unwrap();
    writeln!(file, "south,5000").unwrap();
    path
}

fn two_subpop_seir_yaml(geodata_path: &std::path::Path, stochastic: bool) -> String {
    format!(
        r#"
name: two_subpop_seir
start_date: 2020-01-01
end_date: 2020-03-01
nslots: 1
subpop_setup:
  geodata: {geodata}
compartments:
  - name: infection_stage
    labels: [S, E, I, R]
seir:
  integration:
    method: rk4
    dt: 0.25
    stochastic: {stochastic}
  parameters:
    beta:
      distribution: fixed
      value: 0.4
    sigma:
      distribution: fixed
      value: 0.2
    gamma:
      distribution: fixed
      value: 0.1
  transitions:
    - name: exposure
      source:
        infection_stage: [S]
      destination:
        infection_stage: [E]
      rate: beta
      proportional_to:
        - infection_stage: [I]
    - name: progression
      source:
        infection_stage: [E]
      destination:
        infection_stage: [I]
      rate: sigma
    - name: recovery
      source:
        infection_stage: [I]
      destination:
        infection_stage: [R]
      rate: gamma
seir_modifiers:
  modifiers:
    lockdown:
      method: single_period
      parameter: beta
      value: 0.5
      period:
        start_date: 2020-02-01
        end_date: 2020-02-15
initial_conditions:
  method: default
  compartment: S
seeding:
  method: poisson_draw
  source: S
  dest: E
  subpops: [north, south]
  time: 0.0
  lambda: 5.0
outcomes:
  method: delay_convolve
  outcomes:
    incidence:
      kind: source
      compartment_inflow: I
    hospitalizations:
      kind: probability
      parent: incidence
      probability: 0.1
inference:
  iterations_per_slot: 10
  do_inference: false
"#,
        geodata = geodata_path.display(),
        stochastic = stochastic,
    )
}

#[test]
fn two_subpop_seir_forward_run_conserves_population() {
    let dir = scratch_dir("seir_forward");
    let geodata = write_geodata(&dir);
    let config = RunConfig::from_yaml_str(&two_subpop_seir_yaml(&geodata, false)).unwrap();
    let context = RunContext::build(config).unwrap();

    let mut rng = rng_for(1, 0);
    let trajectory = context.run_simulation(IntegrationMethod::RungeKutta4, &mut rng).unwrap();

    let (n_days_plus_one, n_compartments, n_subpop) = trajectory.dim();
    assert_eq!(n_subpop, 2);
    assert_eq!(n_compartments, 4);

    for s in 0..n_subpop {
        let expected_total = context.subpops[s].population;
        for day in 0..n_days_plus_one {
            let total: f64 = (0..n_compartments).map(|c| trajectory[[day, c, s]]).sum();
            assert!(
                (total - expected_total).abs() < expected_total * 0.02,
                "day {day} subpop {s}: total {total} drifted from {expected_total}"
            );
        }
    }

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn lockdown_modifier_reduces_transmission_rate() {
    let dir = scratch_dir("modifier");
    let geodata = write_geodata(&dir);
    let config = RunConfig::from_yaml_str(&two_subpop_seir_yaml(&geodata, false)).unwrap();
    let context = RunContext::build(config).unwrap();

    let before = chrono::NaiveDate::from_ymd_opt(2020, 1, 15).unwrap();
    let during = chrono::NaiveDate::from_ymd_opt(2020, 2, 5).unwrap();
    let after = chrono::NaiveDate::from_ymd_opt(2020, 2, 20).unwrap();

    let mut rng = ChaCha8Rng::seed_from_u64(0);
    let realized = context.seir_modifiers.realize(&mut rng, &std::collections::HashMap::new());
    assert_eq!(context.seir_modifiers.net_multiplier("beta", before, "north", &realized), 1.0);
    assert_eq!(context.seir_modifiers.net_multiplier("beta", during, "north", &realized), 0.5);
    assert_eq!(context.seir_modifiers.net_multiplier("beta", after, "north", &realized), 1.0);

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn outcomes_chain_derives_hospitalizations_from_incidence() {
    let dir = scratch_dir("outcomes");
    let geodata = write_geodata(&dir);
    let config = RunConfig::from_yaml_str(&two_subpop_seir_yaml(&geodata, false)).unwrap();
    let context = RunContext::build(config).unwrap();

    let mut rng = rng_for(2, 0);
    let trajectory = context.run_simulation(IntegrationMethod::RungeKutta4, &mut rng).unwrap();
    let per_subpop = context.evaluate_outcomes(&trajectory, None::<&mut ChaCha8Rng>).unwrap();

    for series in &per_subpop {
        let incidence = &series["incidence"];
        let hospitalizations = &series["hospitalizations"];
        assert_eq!(incidence.len(), hospitalizations.len());
        for (&inc, &hosp) in incidence.iter().zip(hospitalizations.iter()) {
            assert!(hosp <= inc + 1e-6);
        }
    }

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn stochastic_run_keeps_populations_nonnegative_and_conserved() {
    let dir = scratch_dir("stochastic");
    let geodata = write_geodata(&dir);
    let config = RunConfig::from_yaml_str(&two_subpop_seir_yaml(&geodata, true)).unwrap();
    let context = RunContext::build(config).unwrap();

    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let trajectory = context.run_simulation(IntegrationMethod::Euler, &mut rng).unwrap();

    let (n_days_plus_one, n_compartments, n_subpop) = trajectory.dim();
    for s in 0..n_subpop {
        let expected_total = context.subpops[s].population;
        for day in 0..n_days_plus_one {
            let mut total = 0.0;
            for c in 0..n_compartments {
                let value = trajectory[[day, c, s]];
                assert!(value >= 0.0, "day {day} subpop {s} compartment {c} went negative: {value}");
                total += value;
            }
            assert!((total - expected_total).abs() < expected_total * 0.05);
        }
    }

    let _ = std::fs::remove_dir_all(&dir);
}
