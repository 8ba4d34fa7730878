use clap::Parser;
use std::env;

use dfa_glitcher::config::{Args, Config};
use dfa_glitcher::prelude::*;

use git_version::git_version;
const GIT_VERSION: &str = git_version!(fallback = "unknown");

/// Runs a DFA glitch campaign against the simulated victim bench
///
fn main() -> Result<(), String> {
    // Get parameter from command line
    let args = Args::parse();
    // Load config file if given, command line values take precedence
    let mut config = match &args.config {
        Some(path) => Config::from_file(path).map_err(|e| e.to_string())?,
        None => Config::default(),
    };
    config.override_with_args(&args);

    // RUST_LOG wins over the configured level
    let filter = env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    env_logger::Builder::new().parse_filters(&filter).init();

    println!("--- DFA glitcher: {GIT_VERSION} ---\n");

    let clock = config.clock().map_err(|e| e.to_string())?;
    let bench = SimulatedBench::new(&config.bench, clock).map_err(|e| e.to_string())?;
    let controller = GlitchController::new(bench.execution_unit(), clock);
    let mut orchestrator = Orchestrator::new(
        controller,
        bench.victim_link(),
        Box::new(bench.oracle()),
        Box::new(Aes128KeySchedule),
    );
    *orchestrator.params_mut() = config.glitch_parameters();

    let settings = config.campaign_settings();
    println!(
        "Campaign: delay {} .. {} ns, length {} .. {} ns, {} attempts",
        settings.min_delay_ns,
        settings.max_delay_ns,
        settings.min_length_ns,
        settings.max_length_ns,
        settings.repeats
    );
    let report = orchestrator
        .run_campaign(settings)
        .map_err(|e| e.to_string())?;
    report.print(config.details);

    Ok(())
}
