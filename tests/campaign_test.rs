use crossbeam_channel::Sender;
use dfa_glitcher::campaign::CampaignPhase;
use dfa_glitcher::error::GlitchError;
use dfa_glitcher::prelude::*;
use std::cell::Cell;
use std::collections::VecDeque;
use std::rc::Rc;

const GOLDEN: Block = [0xAA; 16];
const FIPS_KEY: Block = [
    0x2b, 0x7e, 0x15, 0x16, 0x28, 0xae, 0xd2, 0xa6, 0xab, 0xf7, 0x15, 0x88, 0x09, 0xcf, 0x4f, 0x3c,
];
const FIPS_ROUND_10: Block = [
    0xd0, 0x14, 0xf9, 0xa8, 0xc9, 0xee, 0x25, 0x89, 0xe1, 0x3f, 0x0c, 0xc8, 0xb6, 0x63, 0x0c, 0xa6,
];

/// Victim that answers each reset release with the next scripted response
struct ScriptedLink {
    responses: VecDeque<Vec<u8>>,
    rx: VecDeque<u8>,
    read_chunk: usize,
    reset: Option<Level>,
    power: Option<Level>,
    line_changes: usize,
    releases: usize,
    /// Reads fail once this many reset releases happened
    fail_after_releases: Option<usize>,
}

impl ScriptedLink {
    fn new(responses: Vec<Vec<u8>>) -> Self {
        Self {
            responses: responses.into(),
            rx: VecDeque::new(),
            read_chunk: usize::MAX,
            reset: None,
            power: None,
            line_changes: 0,
            releases: 0,
            fail_after_releases: None,
        }
    }
}

impl VictimLink for ScriptedLink {
    fn set_reset(&mut self, level: Level) -> Result<(), GlitchError> {
        self.reset = Some(level);
        self.line_changes += 1;
        if level == Level::High {
            self.releases += 1;
            if let Some(response) = self.responses.pop_front() {
                self.rx.extend(response);
            }
        }
        Ok(())
    }

    fn set_power(&mut self, level: Level) -> Result<(), GlitchError> {
        self.power = Some(level);
        self.line_changes += 1;
        Ok(())
    }

    fn bytes_available(&mut self) -> Result<usize, GlitchError> {
        if self.fail_after_releases.is_some_and(|limit| self.releases >= limit) {
            return Err(GlitchError::Hardware("uart".to_string()));
        }
        Ok(self.rx.len())
    }

    fn read(&mut self, max: usize) -> Result<Vec<u8>, GlitchError> {
        let count = max.min(self.read_chunk).min(self.rx.len());
        Ok(self.rx.drain(..count).collect())
    }

    fn wait_us(&mut self, _micros: u64) {}
}

/// Execution unit that records every (length, delay) pair it is started with
#[derive(Default)]
struct RecordingUnit {
    installed: bool,
    enabled: bool,
    queue: Vec<u32>,
    armed: Vec<(u32, u32)>,
    notifier: Option<Sender<FiredEvent>>,
    fire_on_enable: bool,
}

impl ExecutionUnit for RecordingUnit {
    fn install(&mut self, _program: &EngineProgram) -> Result<(), GlitchError> {
        self.installed = true;
        self.queue.clear();
        Ok(())
    }

    fn remove(&mut self) {
        self.installed = false;
        self.enabled = false;
    }

    fn push(&mut self, word: u32) -> Result<(), GlitchError> {
        self.queue.push(word);
        Ok(())
    }

    fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled && self.installed;
        if self.enabled {
            self.armed.push((self.queue[0], self.queue[1]));
            if self.fire_on_enable {
                if let Some(notifier) = &self.notifier {
                    let _ = notifier.try_send(FiredEvent { cycle: 0 });
                }
            }
        }
    }

    fn control_register(&self) -> u32 {
        u32::from(self.enabled)
    }

    fn connect_notifier(&mut self, notifier: Sender<FiredEvent>) {
        self.notifier = Some(notifier);
    }

    fn configure_trigger_input(&mut self, _pull: Pull) {}

    fn configure_outputs(&mut self, _idle: Level) {}
}

/// Oracle replaying scripted answers, `None` once they run out
struct ScriptedOracle {
    calls: Rc<Cell<u32>>,
    answers: VecDeque<Option<RoundKeyGuess>>,
}

impl RoundKeyOracle for ScriptedOracle {
    fn recover_round_key(&mut self, corpus: &[Block], _golden: &Block) -> Option<RoundKeyGuess> {
        assert!(!corpus.is_empty());
        self.calls.set(self.calls.get() + 1);
        self.answers.pop_front().flatten()
    }
}

fn fault(group: usize, mask: u8) -> Vec<u8> {
    let mut ciphertext = GOLDEN;
    for &index in &DIAGONAL_GROUPS[group] {
        ciphertext[index] ^= mask;
    }
    ciphertext.to_vec()
}

fn settings(repeats: u64) -> CampaignSettings {
    CampaignSettings {
        repeats,
        seed: Some(7),
        progress: false,
        ..CampaignSettings::default()
    }
}

fn orchestrator(
    link: ScriptedLink,
    unit: RecordingUnit,
    answers: Vec<Option<RoundKeyGuess>>,
) -> (Orchestrator<RecordingUnit, ScriptedLink>, Rc<Cell<u32>>) {
    let calls = Rc::new(Cell::new(0));
    let oracle = ScriptedOracle {
        calls: Rc::clone(&calls),
        answers: answers.into(),
    };
    let controller = GlitchController::new(unit, ClockParameters::default());
    let orchestrator =
        Orchestrator::new(controller, link, Box::new(oracle), Box::new(Aes128KeySchedule));
    (orchestrator, calls)
}

#[test]
/// Golden, one match and one group 1 fault
fn three_attempt_campaign() {
    let link = ScriptedLink::new(vec![GOLDEN.to_vec(), GOLDEN.to_vec(), fault(1, 0x5A)]);
    let (mut orchestrator, calls) = orchestrator(link, RecordingUnit::default(), vec![]);
    let report = orchestrator.run_campaign(&settings(3)).unwrap();

    let stats = &report.statistics;
    assert_eq!(2, stats.attempts);
    assert_eq!(1, stats.count(CategoryKind::Match));
    assert_eq!(1, stats.count(CategoryKind::LocalizedFault));
    assert_eq!(0, stats.count(CategoryKind::DiffuseFault));
    assert_eq!(0, stats.count(CategoryKind::NoResponse));
    assert_eq!(1, report.corpus.len());
    assert_eq!(1, report.corpus[0].group);
    assert_eq!([0, 1, 0, 0], report.group_counts);
    assert_eq!(1, calls.get());
    assert_eq!(1, stats.oracle_calls);
    assert_eq!(GOLDEN, report.golden);
    assert_eq!(Outcome::Exhausted, report.outcome);
    assert_eq!(0, report.key.percent_found);

    // Golden capture runs disarmed
    assert_eq!(2, orchestrator.controller().unit().armed.len());
    // Victim left unpowered in reset, glitcher disarmed
    assert_eq!(Some(Level::Low), orchestrator.link().reset);
    assert_eq!(Some(Level::Low), orchestrator.link().power);
    assert!(!orchestrator.controller().is_armed());
    assert_eq!(CampaignPhase::Idle, orchestrator.phase());
}

#[test]
/// The first fault of group 2 pins the parameters for the next 25 attempts
fn group_budget_holds_parameters() {
    let mut responses = vec![GOLDEN.to_vec(), fault(2, 0x11)];
    responses.extend((0..30).map(|_| GOLDEN.to_vec()));
    let link = ScriptedLink::new(responses);
    let (mut orchestrator, _) = orchestrator(link, RecordingUnit::default(), vec![]);
    orchestrator.run_campaign(&settings(32)).unwrap();

    let armed = &orchestrator.controller().unit().armed;
    assert_eq!(31, armed.len());
    let pinned = armed[0];
    for (attempt, params) in armed.iter().enumerate().take(26).skip(1) {
        assert_eq!(pinned, *params, "attempt {}", attempt + 1);
    }
    assert_ne!(pinned, armed[26]);
}

#[test]
/// A second group 2 fault ends the budget right away
fn second_fault_resumes_search() {
    let responses = vec![
        GOLDEN.to_vec(),
        fault(2, 0x11),
        GOLDEN.to_vec(),
        GOLDEN.to_vec(),
        GOLDEN.to_vec(),
        fault(2, 0x22),
        GOLDEN.to_vec(),
        GOLDEN.to_vec(),
    ];
    let link = ScriptedLink::new(responses);
    let (mut orchestrator, calls) = orchestrator(link, RecordingUnit::default(), vec![]);
    let report = orchestrator.run_campaign(&settings(8)).unwrap();

    let armed = &orchestrator.controller().unit().armed;
    assert!(armed[1..5].iter().all(|params| *params == armed[0]));
    assert_ne!(armed[0], armed[5]);
    assert_ne!(armed[5], armed[6]);
    assert_eq!([0, 0, 2, 0], report.group_counts);
    assert_eq!(2, calls.get());
}

#[test]
/// Repeated ciphertexts neither grow the corpus nor call the oracle
fn duplicate_faults_ignored() {
    let responses = vec![GOLDEN.to_vec(), fault(0, 0x01), fault(0, 0x01), fault(0, 0x01)];
    let link = ScriptedLink::new(responses);
    let (mut orchestrator, calls) = orchestrator(link, RecordingUnit::default(), vec![]);
    let report = orchestrator.run_campaign(&settings(4)).unwrap();
    assert_eq!(3, report.statistics.count(CategoryKind::LocalizedFault));
    assert_eq!(1, report.corpus.len());
    assert_eq!([1, 0, 0, 0], report.group_counts);
    assert_eq!(1, calls.get());
}

#[test]
/// Past 75 % the oracle waits until every group has two records
fn suppression_threshold() {
    let three_quarters: RoundKeyGuess = "d014f9a8c9ee2589e13f0cc8........".parse().unwrap();
    let responses = vec![
        GOLDEN.to_vec(),
        fault(0, 0x01),
        fault(0, 0x02),
        fault(1, 0x01),
        fault(1, 0x02),
        fault(2, 0x01),
        fault(2, 0x02),
        fault(3, 0x01),
        fault(3, 0x02),
    ];
    let link = ScriptedLink::new(responses);
    let (mut orchestrator, calls) =
        orchestrator(link, RecordingUnit::default(), vec![Some(three_quarters)]);
    let report = orchestrator.run_campaign(&settings(9)).unwrap();
    // First fault and the one completing the last group
    assert_eq!(2, calls.get());
    assert_eq!([2, 2, 2, 2], report.group_counts);
    // The second answer was no guess
    assert_eq!(0, report.key.percent_found);
}

#[test]
/// A complete round key ends the campaign with the base key
fn key_recovered() {
    let responses = vec![GOLDEN.to_vec(), fault(3, 0x42), GOLDEN.to_vec(), GOLDEN.to_vec()];
    let link = ScriptedLink::new(responses);
    let answer = Some(RoundKeyGuess::from_bytes(&FIPS_ROUND_10));
    let (mut orchestrator, calls) = orchestrator(link, RecordingUnit::default(), vec![answer]);
    let report = orchestrator.run_campaign(&settings(100)).unwrap();

    assert_eq!(Outcome::KeyRecovered { base_key: FIPS_KEY }, report.outcome);
    assert_eq!(Some(FIPS_KEY), report.base_key());
    assert_eq!(Some(FIPS_KEY), report.key.recovered_base_key);
    assert_eq!(100, report.key.percent_found);
    assert_eq!(1, report.statistics.attempts);
    assert_eq!(1, calls.get());
    assert_eq!(Some(Level::Low), orchestrator.link().power);
}

#[test]
/// Without a full golden block the campaign aborts into the safe state
fn golden_capture_failure() {
    let link = ScriptedLink::new(vec![vec![0xAA; 10]]);
    let (mut orchestrator, calls) = orchestrator(link, RecordingUnit::default(), vec![]);
    let error = orchestrator.run_campaign(&settings(10)).unwrap_err();
    assert_eq!(GlitchError::GoldenCaptureFailed { received: 10 }, error);
    assert_eq!(Some(Level::Low), orchestrator.link().reset);
    // Power is left as it was
    assert_eq!(Some(Level::High), orchestrator.link().power);
    assert!(!orchestrator.controller().is_armed());
    assert_eq!(0, calls.get());
}

#[test]
/// A silent victim cannot provide a golden ciphertext either
fn golden_capture_silent_victim() {
    let link = ScriptedLink::new(vec![]);
    let (mut silent, _) = orchestrator(link, RecordingUnit::default(), vec![]);
    assert_eq!(
        Err(GlitchError::GoldenCaptureFailed { received: 0 }),
        silent.run_campaign(&settings(10)).map(|_| ())
    );
}

#[test]
/// A link failure after the golden capture aborts with reset held and the glitcher disarmed
fn link_failure_mid_campaign() {
    let mut link = ScriptedLink::new(vec![GOLDEN.to_vec(), GOLDEN.to_vec()]);
    link.fail_after_releases = Some(2);
    let (mut broken, calls) = orchestrator(link, RecordingUnit::default(), vec![]);
    let error = broken.run_campaign(&settings(10)).unwrap_err();

    assert!(matches!(error, GlitchError::Hardware(_)));
    assert!(!error.is_absorbed());
    assert_eq!(Some(Level::Low), broken.link().reset);
    // Power is left as it was
    assert_eq!(Some(Level::High), broken.link().power);
    assert!(!broken.controller().is_armed());
    assert_eq!(CampaignPhase::Idle, broken.phase());
    assert_eq!(0, calls.get());
}

#[test]
/// Invalid settings are refused before any line moves
fn invalid_settings() {
    let link = ScriptedLink::new(vec![GOLDEN.to_vec()]);
    let (mut orchestrator, _) = orchestrator(link, RecordingUnit::default(), vec![]);
    let inverted = CampaignSettings {
        min_delay_ns: 63_000.0,
        max_delay_ns: 62_000.0,
        ..settings(5)
    };
    let too_long = CampaignSettings {
        max_length_ns: 1_000_000.0,
        ..settings(5)
    };
    let no_attempts = settings(0);
    for bad in [inverted, too_long, no_attempts] {
        assert!(matches!(
            orchestrator.run_campaign(&bad),
            Err(GlitchError::InvalidParameter { .. })
        ));
    }
    assert_eq!(0, orchestrator.link().line_changes);
}

#[test]
/// A full corpus drops samples and the campaign carries on
fn corpus_capacity_tolerated() {
    let responses = vec![GOLDEN.to_vec(), fault(0, 0x01), fault(1, 0x01), fault(2, 0x01)];
    let link = ScriptedLink::new(responses);
    let (mut orchestrator, _) = orchestrator(link, RecordingUnit::default(), vec![]);
    let settings = CampaignSettings {
        corpus_capacity: 1,
        ..settings(4)
    };
    let report = orchestrator.run_campaign(&settings).unwrap();
    assert_eq!(3, report.statistics.attempts);
    assert_eq!(1, report.corpus.len());
    assert_eq!(2, report.statistics.dropped_samples);
    assert!(report.statistics.corpus_truncated);
    assert_eq!([1, 0, 0, 0], report.group_counts);
}

#[test]
/// Silent, short and diffuse answers are counted, not failures
fn absorbed_categories() {
    let mut diffuse = GOLDEN.to_vec();
    diffuse[0] ^= 1;
    diffuse[1] ^= 1;
    let responses = vec![GOLDEN.to_vec(), vec![], vec![0xAA; 9], diffuse];
    let link = ScriptedLink::new(responses);
    let (mut orchestrator, calls) = orchestrator(link, RecordingUnit::default(), vec![]);
    let report = orchestrator.run_campaign(&settings(4)).unwrap();
    let stats = &report.statistics;
    assert_eq!(1, stats.count(CategoryKind::NoResponse));
    assert_eq!(1, stats.count(CategoryKind::ShortResponse));
    assert_eq!(1, stats.count(CategoryKind::DiffuseFault));
    assert_eq!(Some(250), stats.read_attempts.max());
    assert_eq!(Some(0), stats.read_attempts.min());
    assert_eq!(0, calls.get());
}

#[test]
/// Slow reads need a second drain, which is counted
fn reread_counted() {
    let mut long = GOLDEN.to_vec();
    long.extend_from_slice(&[0x0D; 84]);
    let mut link = ScriptedLink::new(vec![long.clone(), long]);
    link.read_chunk = 8;
    let (mut orchestrator, _) = orchestrator(link, RecordingUnit::default(), vec![]);
    let report = orchestrator.run_campaign(&settings(2)).unwrap();
    assert_eq!(1, report.statistics.rereads);
    assert_eq!(1, report.statistics.count(CategoryKind::Match));
    assert_eq!(GOLDEN, report.golden);
}

#[test]
/// Completion notifications are serviced once per glitch
fn glitches_counted() {
    let link = ScriptedLink::new(vec![GOLDEN.to_vec(), GOLDEN.to_vec(), GOLDEN.to_vec()]);
    let unit = RecordingUnit {
        fire_on_enable: true,
        ..RecordingUnit::default()
    };
    let (mut orchestrator, _) = orchestrator(link, unit, vec![]);
    let report = orchestrator.run_campaign(&settings(3)).unwrap();
    assert_eq!(2, report.statistics.glitches_fired);
}

#[test]
/// The last drawn parameters stay on the orchestrator
fn parameters_persist() {
    let link = ScriptedLink::new(vec![GOLDEN.to_vec(), GOLDEN.to_vec(), GOLDEN.to_vec()]);
    let (mut orchestrator, _) = orchestrator(link, RecordingUnit::default(), vec![]);
    let settings = settings(3);
    orchestrator.run_campaign(&settings).unwrap();

    let clock = ClockParameters::default();
    let params = *orchestrator.params();
    let (length, delay) = *orchestrator.controller().unit().armed.last().unwrap();
    assert_eq!(length, u32::from(params.length_clocks()));
    assert_eq!(delay, u32::from(params.delay_clocks()));
    let delay_ns = params.delay_ns(&clock);
    assert!(delay_ns >= settings.min_delay_ns - clock.period_ns());
    assert!(delay_ns <= settings.max_delay_ns + clock.period_ns());
}
