use dfa_glitcher::prelude::*;

const FIPS_KEY: Block = [
    0x2b, 0x7e, 0x15, 0x16, 0x28, 0xae, 0xd2, 0xa6, 0xab, 0xf7, 0x15, 0x88, 0x09, 0xcf, 0x4f, 0x3c,
];
const FIPS_CIPHERTEXT: Block = [
    0x39, 0x25, 0x84, 0x1d, 0x02, 0xdc, 0x09, 0xfb, 0xdc, 0x11, 0x85, 0x97, 0x19, 0x6a, 0x0b, 0x32,
];

fn bench_orchestrator(
    config: &BenchConfig,
) -> (SimulatedBench, Orchestrator<BenchUnit, BenchLink>) {
    let clock = ClockParameters::default();
    let bench = SimulatedBench::new(config, clock).unwrap();
    let controller = GlitchController::new(bench.execution_unit(), clock);
    let orchestrator = Orchestrator::new(
        controller,
        bench.victim_link(),
        Box::new(bench.oracle()),
        Box::new(Aes128KeySchedule),
    );
    (bench, orchestrator)
}

fn settings(repeats: u64, seed: u64) -> CampaignSettings {
    CampaignSettings {
        repeats,
        seed: Some(seed),
        progress: false,
        ..CampaignSettings::default()
    }
}

#[test]
/// Full campaign against the simulated victim
///
/// This test runs the default search ranges against the bench victim with the FIPS-197
/// key and checks that the base key is recovered and the victim is left switched off
fn recover_key_on_bench() {
    let (bench, mut orchestrator) = bench_orchestrator(&BenchConfig::default());
    assert_eq!(FIPS_CIPHERTEXT, bench.golden());

    let report = orchestrator.run_campaign(&settings(2000, 1)).unwrap();
    assert_eq!(Outcome::KeyRecovered { base_key: FIPS_KEY }, report.outcome);
    assert_eq!(FIPS_CIPHERTEXT, report.golden);
    assert!(report.group_counts.iter().all(|count| *count >= 2));
    assert_eq!(report.group_counts.iter().sum::<u32>() as usize, report.corpus.len());
    let stats = &report.statistics;
    assert!(stats.count(CategoryKind::LocalizedFault) >= 8);
    assert!(stats.attempts < 1999);
    let classified: u64 = CategoryKind::ALL.iter().map(|kind| stats.count(*kind)).sum();
    assert_eq!(stats.attempts, classified);
    // Every armed attempt fired a pulse
    assert_eq!(stats.attempts, stats.glitches_fired);
    // Corpus is reported by group
    assert!(report
        .corpus
        .windows(2)
        .all(|pair| pair[0].group <= pair[1].group));
    for record in &report.corpus {
        assert_eq!(Category::LocalizedFault(record.group), classify(&report.golden, &record.ciphertext));
    }

    assert_eq!(Level::Low, bench.power_line());
    assert_eq!(Level::Low, bench.reset_line());
    assert!(!orchestrator.controller().is_armed());
    assert_eq!(report.statistics.attempts as usize, bench.pulse_log().len());
}

#[test]
/// Same campaign with a falling trigger and an active low glitch
fn recover_key_on_inverted_bench() {
    let config = BenchConfig {
        trigger_active: Level::Low,
        ..BenchConfig::default()
    };
    let (_bench, mut orchestrator) = bench_orchestrator(&config);
    orchestrator.params_mut().input_trigger_edge = Edge::Falling;
    orchestrator.params_mut().output_polarity = Polarity::ActiveLow;

    let report = orchestrator.run_campaign(&settings(2000, 2)).unwrap();
    assert_eq!(Some(FIPS_KEY), report.base_key());
    assert_eq!(Edge::Falling, orchestrator.params().input_trigger_edge);
}

#[test]
/// Pulses outside the vulnerable window never produce localized faults
fn early_window_only_diffuse() {
    let (_bench, mut orchestrator) = bench_orchestrator(&BenchConfig::default());
    let settings = CampaignSettings {
        min_delay_ns: 20_000.0,
        max_delay_ns: 40_000.0,
        min_length_ns: 600.0,
        max_length_ns: 700.0,
        ..settings(30, 3)
    };
    let report = orchestrator.run_campaign(&settings).unwrap();
    assert_eq!(Outcome::Exhausted, report.outcome);
    assert_eq!(29, report.statistics.count(CategoryKind::DiffuseFault));
    assert!(report.corpus.is_empty());
    assert_eq!(0, report.statistics.oracle_calls);
}

#[test]
/// Glitches too wide for the victim silence it
fn wide_glitch_crashes() {
    let (_bench, mut orchestrator) = bench_orchestrator(&BenchConfig::default());
    let settings = CampaignSettings {
        min_length_ns: 900.0,
        max_length_ns: 1000.0,
        ..settings(5, 4)
    };
    let report = orchestrator.run_campaign(&settings).unwrap();
    assert_eq!(4, report.statistics.count(CategoryKind::NoResponse));
    assert_eq!(Some(250), report.statistics.read_attempts.min());
}

#[test]
/// A victim that never answers fails the golden capture and stays powered in reset
fn silent_victim() {
    let config = BenchConfig {
        boot_us: 1_000_000,
        ..BenchConfig::default()
    };
    let (bench, mut orchestrator) = bench_orchestrator(&config);
    let error = orchestrator.run_campaign(&settings(5, 5)).unwrap_err();
    assert_eq!(GlitchError::GoldenCaptureFailed { received: 0 }, error);
    assert_eq!(Level::Low, bench.reset_line());
    assert_eq!(Level::High, bench.power_line());
}
