use std::process::Command;

use ilc_engine::config::ScenarioConfig;
use ilc_engine::control::Phase;
use ilc_engine::sim::engine::Simulation;
use ilc_engine::sim::types::TickRecord;

fn replay(cfg: &ScenarioConfig) -> (Simulation, Vec<TickRecord>) {
    let mut sim = Simulation::from_config(cfg).expect("scenario builds");
    let results = sim.run();
    (sim, results)
}

fn preset(name: &str) -> ScenarioConfig {
    ScenarioConfig::from_preset(name).expect("preset parses")
}

#[test]
fn every_preset_validates_and_curtails() {
    for name in ScenarioConfig::PRESETS {
        let cfg = preset(name);
        assert!(cfg.validate().is_empty(), "{name}: {:?}", cfg.validate());

        let (sim, results) = replay(&cfg);
        assert_eq!(results.len(), cfg.simulation.steps);
        let kpi = sim.report(&results);
        assert!(kpi.curtailments > 0, "{name} never curtailed");
        assert!(kpi.releases > 0, "{name} never released");
        assert!(kpi.energy_shed_kwh > 0.0, "{name} shed nothing");
        assert!(results.iter().any(|r| r.phase == Phase::Break), "{name} never took a break");
    }
}

#[test]
fn replay_is_deterministic_for_a_seed() {
    let cfg = preset("office");
    let (_, first) = replay(&cfg);
    let (_, second) = replay(&cfg);
    assert_eq!(first, second);
}

#[test]
fn seed_changes_the_load_profile() {
    let cfg = preset("office");
    let mut reseeded = cfg.clone();
    reseeded.simulation.seed += 1;
    let (_, a) = replay(&cfg);
    let (_, b) = replay(&reseeded);
    assert!(a.iter().zip(&b).any(|(x, y)| x.power_kw != y.power_kw));
}

#[test]
fn kill_mid_replay_halts_with_nothing_curtailed() {
    let mut cfg = preset("stagger");
    cfg.simulation.kill_at_step = Some(250);
    let (sim, results) = replay(&cfg);

    assert!(results[..250].iter().all(|r| r.phase != Phase::Halted));
    for r in &results[250..] {
        assert_eq!(r.phase, Phase::Halted, "step {}", r.step);
        assert_eq!(r.curtailed, 0, "step {}", r.step);
    }
    assert!(sim.engine().reserved_devices().next().is_none());
}

#[test]
fn cli_runs_preset_and_exports_telemetry() {
    let out = std::env::temp_dir().join(format!("ilc-engine-cli-{}.csv", std::process::id()));
    let output = Command::new(env!("CARGO_BIN_EXE_ilc-engine"))
        .args(["--preset", "office", "--telemetry-out"])
        .arg(&out)
        .output()
        .expect("ilc-engine process should run");

    assert!(
        output.status.success(),
        "preset run failed: stderr={}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8(output.stdout).expect("stdout should be valid UTF-8");
    assert!(stdout.contains("--- KPI Report ---"));
    assert!(stdout.lines().any(|l| l.trim_start().starts_with("Episodes:")));

    let csv = std::fs::read_to_string(&out).expect("telemetry written");
    let _ = std::fs::remove_file(&out);
    assert_eq!(csv.lines().count(), 481, "header plus one row per tick");
}

#[test]
fn cli_rejects_unknown_preset() {
    let output = Command::new(env!("CARGO_BIN_EXE_ilc-engine"))
        .args(["--preset", "nope"])
        .output()
        .expect("ilc-engine process should run");
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("unknown preset"));
}
