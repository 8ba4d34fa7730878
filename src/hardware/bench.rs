//! Virtual-clock test bench: an execution unit running the timing engine and a victim
//! encrypting one AES block per reset release, both driven by one cycle counter.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use aes::Aes128;
use crossbeam_channel::Sender;
use log::{debug, trace};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;

use super::{ExecutionUnit, FiredEvent, Pull, VictimLink};
use crate::classifier::{classify, Block, Category, BLOCK_SIZE, DIAGONAL_GROUPS};
use crate::config::deserialize_block;
use crate::engine::{EngineEvent, EngineProgram, Level, TimingEngine};
use crate::error::GlitchError;
use crate::oracle::key_schedule::Aes128KeySchedule;
use crate::oracle::{RoundKeyGuess, RoundKeyOracle};
use crate::units::ClockParameters;

const PULSE_LOG_LIMIT: usize = 1024;

/// Victim model parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    #[serde(deserialize_with = "deserialize_block")]
    pub key: Block,
    #[serde(deserialize_with = "deserialize_block")]
    pub plaintext: Block,
    /// Time from reset release to the trigger edge.
    pub boot_us: u64,
    /// Time from the trigger edge to the ciphertext being sent.
    pub encrypt_us: u64,
    /// Pulse onsets in this window (relative to the trigger edge) hit the last rounds.
    pub window_start_ns: f64,
    pub window_end_ns: f64,
    /// Narrower pulses have no effect.
    pub fault_min_length_ns: f64,
    /// Wider pulses crash the victim.
    pub crash_length_ns: f64,
    /// Bytes the victim sends after the ciphertext.
    pub trailing_bytes: usize,
    /// Trigger level while the victim encrypts.
    pub trigger_active: Level,
    pub seed: u64,
}

impl Default for BenchConfig {
    fn default() -> Self {
        // FIPS-197 appendix B
        Self {
            key: [
                0x2b, 0x7e, 0x15, 0x16, 0x28, 0xae, 0xd2, 0xa6, 0xab, 0xf7, 0x15, 0x88, 0x09,
                0xcf, 0x4f, 0x3c,
            ],
            plaintext: [
                0x32, 0x43, 0xf6, 0xa8, 0x88, 0x5a, 0x30, 0x8d, 0x31, 0x31, 0x98, 0xa2, 0xe0,
                0x37, 0x07, 0x34,
            ],
            boot_us: 2000,
            encrypt_us: 150,
            window_start_ns: 59_000.0,
            window_end_ns: 62_600.0,
            fault_min_length_ns: 550.0,
            crash_length_ns: 760.0,
            trailing_bytes: 2,
            trigger_active: Level::High,
            seed: 0x5eed,
        }
    }
}

/// One glitch pulse as seen on the output pin, in bench cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pulse {
    pub onset: u64,
    pub end: u64,
}

impl Pulse {
    pub fn width(&self) -> u64 {
        self.end - self.onset
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Effect {
    None,
    Diffuse,
    Localized(usize),
    Crash,
}

impl Effect {
    fn rank(&self) -> u8 {
        match self {
            Effect::None => 0,
            Effect::Diffuse => 1,
            Effect::Localized(_) => 2,
            Effect::Crash => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VictimPhase {
    Off,
    Reset,
    Booting { ready_at: u64 },
    Encrypting { started: u64, done_at: u64 },
    Idle,
}

struct VictimModel {
    config: BenchConfig,
    golden: Block,
    reset: Level,
    power: Level,
    phase: VictimPhase,
    trigger: Option<Level>,
    rx: VecDeque<u8>,
    rng: StdRng,
}

impl VictimModel {
    fn new(config: &BenchConfig) -> Self {
        let cipher = Aes128::new(GenericArray::from_slice(&config.key));
        let mut block = GenericArray::clone_from_slice(&config.plaintext);
        cipher.encrypt_block(&mut block);
        let mut golden = [0u8; BLOCK_SIZE];
        golden.copy_from_slice(block.as_slice());

        Self {
            config: config.clone(),
            golden,
            reset: Level::Low,
            power: Level::Low,
            phase: VictimPhase::Off,
            trigger: None,
            rx: VecDeque::new(),
            rng: StdRng::seed_from_u64(config.seed),
        }
    }

    fn lines_changed(&mut self, cycle: u64, clock: &ClockParameters) {
        self.trigger = None;
        self.phase = match (self.power, self.reset) {
            (Level::Low, _) => VictimPhase::Off,
            (Level::High, Level::Low) => VictimPhase::Reset,
            (Level::High, Level::High) => {
                self.trigger = Some(!self.config.trigger_active);
                VictimPhase::Booting {
                    ready_at: cycle + clock.cycles_per_micros(self.config.boot_us),
                }
            }
        };
    }

    fn next_event(&self) -> Option<u64> {
        match self.phase {
            VictimPhase::Booting { ready_at } => Some(ready_at),
            VictimPhase::Encrypting { done_at, .. } => Some(done_at),
            _ => None,
        }
    }

    fn update(&mut self, cycle: u64, clock: &ClockParameters, pulses: &mut Vec<Pulse>) {
        match self.phase {
            VictimPhase::Booting { ready_at } if cycle >= ready_at => {
                pulses.clear();
                self.trigger = Some(self.config.trigger_active);
                self.phase = VictimPhase::Encrypting {
                    started: cycle,
                    done_at: cycle + clock.cycles_per_micros(self.config.encrypt_us),
                };
            }
            VictimPhase::Encrypting { started, done_at } if cycle >= done_at => {
                let effect = self.evaluate(started, done_at, clock, pulses);
                pulses.clear();
                self.respond(effect);
                self.trigger = Some(!self.config.trigger_active);
                self.phase = VictimPhase::Idle;
            }
            _ => {}
        }
    }

    fn evaluate(&self, started: u64, done_at: u64, clock: &ClockParameters, pulses: &[Pulse]) -> Effect {
        let window = self.config.window_end_ns - self.config.window_start_ns;
        pulses
            .iter()
            .filter(|pulse| pulse.onset >= started && pulse.onset < done_at)
            .map(|pulse| {
                let offset_ns = (pulse.onset - started) as f64 * clock.period_ns();
                let width_ns = pulse.width() as f64 * clock.period_ns();
                if width_ns >= self.config.crash_length_ns {
                    Effect::Crash
                } else if width_ns < self.config.fault_min_length_ns {
                    Effect::None
                } else if offset_ns >= self.config.window_start_ns
                    && offset_ns < self.config.window_end_ns
                    && window > 0.0
                {
                    let quarter = ((offset_ns - self.config.window_start_ns) * 4.0 / window) as usize;
                    Effect::Localized(quarter.min(3))
                } else {
                    Effect::Diffuse
                }
            })
            .fold(Effect::None, |worst, effect| {
                if effect.rank() > worst.rank() {
                    effect
                } else {
                    worst
                }
            })
    }

    fn respond(&mut self, effect: Effect) {
        let mut output = self.golden;
        match effect {
            Effect::Crash => {
                debug!("Victim crashed");
                return;
            }
            Effect::None => {}
            Effect::Localized(group) => {
                for &index in &DIAGONAL_GROUPS[group] {
                    output[index] ^= self.rng.gen_range(1..=255u8);
                }
            }
            Effect::Diffuse => {
                for byte in output.iter_mut() {
                    *byte ^= self.rng.gen_range(1..=255u8);
                }
            }
        }
        trace!("Victim response {:?}", effect);
        self.rx.extend(output.iter());
        self.rx.extend(std::iter::repeat(b'\n').take(self.config.trailing_bytes));
    }
}

struct UnitModel {
    engine: Option<TimingEngine>,
    enabled: bool,
    pull: Pull,
    idle: Level,
    notifier: Option<Sender<FiredEvent>>,
    pulse_onset: Option<u64>,
    pending: Vec<Pulse>,
    log: VecDeque<Pulse>,
}

impl UnitModel {
    fn output(&self) -> Level {
        match (&self.engine, self.enabled) {
            (Some(engine), true) => engine.output(),
            _ => self.idle,
        }
    }

    fn close_pulse(&mut self, cycle: u64) {
        if let Some(onset) = self.pulse_onset.take() {
            let pulse = Pulse { onset, end: cycle };
            self.pending.push(pulse);
            if self.log.len() >= PULSE_LOG_LIMIT {
                self.log.pop_front();
            }
            self.log.push_back(pulse);
        }
    }
}

struct BenchState {
    clock: ClockParameters,
    cycle: u64,
    external_trigger: Option<Level>,
    unit: UnitModel,
    victim: VictimModel,
}

impl BenchState {
    fn trigger_level(&self) -> Level {
        self.external_trigger
            .or(self.victim.trigger)
            .unwrap_or_else(|| self.unit.pull.level())
    }

    fn unit_quiescent(&self, input: Level) -> bool {
        match (&self.unit.engine, self.unit.enabled) {
            (Some(engine), true) => engine.is_stalled(input),
            _ => true,
        }
    }

    fn step_unit(&mut self, input: Level) {
        let cycle = self.cycle;
        let Some(engine) = self.unit.engine.as_mut() else {
            return;
        };
        match engine.step(input) {
            Some(EngineEvent::PulseStarted) => self.unit.pulse_onset = Some(cycle),
            Some(EngineEvent::PulseEnded) => self.unit.close_pulse(cycle),
            Some(EngineEvent::Fired) => {
                if let Some(notifier) = &self.unit.notifier {
                    // Single slot: an unserviced notification already says the same
                    let _ = notifier.try_send(FiredEvent { cycle });
                }
            }
            None => {}
        }
    }

    fn advance_to(&mut self, target: u64) {
        while self.cycle < target {
            self.victim
                .update(self.cycle, &self.clock, &mut self.unit.pending);
            let input = self.trigger_level();
            if self.unit_quiescent(input) {
                let next = self
                    .victim
                    .next_event()
                    .map_or(target, |event| event.min(target))
                    .max(self.cycle + 1);
                self.cycle = next;
                continue;
            }
            self.step_unit(input);
            self.cycle += 1;
        }
    }
}

fn lock(state: &Mutex<BenchState>) -> MutexGuard<'_, BenchState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared virtual bench. Hand out [`BenchUnit`] and [`BenchLink`] to the controller and
/// the orchestrator; both act on the same simulated time.
#[derive(Clone)]
pub struct SimulatedBench {
    state: Arc<Mutex<BenchState>>,
    round_key: Block,
}

impl SimulatedBench {
    pub fn new(config: &BenchConfig, clock: ClockParameters) -> Result<Self, GlitchError> {
        if config.window_end_ns < config.window_start_ns {
            return Err(GlitchError::Config(
                "bench window ends before it starts".to_string(),
            ));
        }
        if config.crash_length_ns < config.fault_min_length_ns {
            return Err(GlitchError::Config(
                "bench crash length below fault length".to_string(),
            ));
        }
        let round_key = Aes128KeySchedule::expand(&config.key)[10];
        let state = BenchState {
            clock,
            cycle: 0,
            external_trigger: None,
            unit: UnitModel {
                engine: None,
                enabled: false,
                pull: Pull::Down,
                idle: Level::Low,
                notifier: None,
                pulse_onset: None,
                pending: Vec::new(),
                log: VecDeque::new(),
            },
            victim: VictimModel::new(config),
        };
        debug!("Bench victim golden ciphertext {:02x?}", state.victim.golden);
        Ok(Self {
            state: Arc::new(Mutex::new(state)),
            round_key,
        })
    }

    pub fn execution_unit(&self) -> BenchUnit {
        BenchUnit {
            state: Arc::clone(&self.state),
        }
    }

    pub fn victim_link(&self) -> BenchLink {
        BenchLink {
            state: Arc::clone(&self.state),
        }
    }

    pub fn oracle(&self) -> BenchOracle {
        BenchOracle {
            round_key: self.round_key,
        }
    }

    /// Ciphertext the victim produces without a glitch.
    pub fn golden(&self) -> Block {
        lock(&self.state).victim.golden
    }

    pub fn cycle(&self) -> u64 {
        lock(&self.state).cycle
    }

    pub fn advance_cycles(&self, cycles: u64) {
        let mut state = lock(&self.state);
        let target = state.cycle + cycles;
        state.advance_to(target);
    }

    /// Overrides the trigger input. `None` hands it back to the victim and the pull.
    pub fn drive_trigger(&self, level: Option<Level>) {
        lock(&self.state).external_trigger = level;
    }

    pub fn trigger_level(&self) -> Level {
        lock(&self.state).trigger_level()
    }

    pub fn trigger_pull(&self) -> Pull {
        lock(&self.state).unit.pull
    }

    pub fn glitch_output(&self) -> Level {
        lock(&self.state).unit.output()
    }

    /// Completed pulses, oldest first.
    pub fn pulse_log(&self) -> Vec<Pulse> {
        lock(&self.state).unit.log.iter().copied().collect()
    }

    pub fn reset_line(&self) -> Level {
        lock(&self.state).victim.reset
    }

    pub fn power_line(&self) -> Level {
        lock(&self.state).victim.power
    }
}

/// Execution unit handle of a [`SimulatedBench`].
pub struct BenchUnit {
    state: Arc<Mutex<BenchState>>,
}

impl ExecutionUnit for BenchUnit {
    fn install(&mut self, program: &EngineProgram) -> Result<(), GlitchError> {
        let mut state = lock(&self.state);
        let cycle = state.cycle;
        state.unit.close_pulse(cycle);
        state.unit.enabled = false;
        state.unit.engine = Some(TimingEngine::new(program.clone()));
        debug!("Installed engine program {}", program.variant());
        Ok(())
    }

    fn remove(&mut self) {
        let mut state = lock(&self.state);
        let cycle = state.cycle;
        state.unit.close_pulse(cycle);
        state.unit.enabled = false;
        state.unit.engine = None;
    }

    fn push(&mut self, word: u32) -> Result<(), GlitchError> {
        match lock(&self.state).unit.engine.as_mut() {
            Some(engine) => engine.push(word),
            None => Err(GlitchError::Hardware(
                "no engine program installed".to_string(),
            )),
        }
    }

    fn set_enabled(&mut self, enabled: bool) {
        let mut state = lock(&self.state);
        if !enabled {
            let cycle = state.cycle;
            state.unit.close_pulse(cycle);
        }
        state.unit.enabled = enabled && state.unit.engine.is_some();
    }

    fn control_register(&self) -> u32 {
        let state = lock(&self.state);
        u32::from(state.unit.enabled && state.unit.engine.is_some())
    }

    fn connect_notifier(&mut self, notifier: Sender<FiredEvent>) {
        lock(&self.state).unit.notifier = Some(notifier);
    }

    fn configure_trigger_input(&mut self, pull: Pull) {
        lock(&self.state).unit.pull = pull;
    }

    fn configure_outputs(&mut self, idle: Level) {
        lock(&self.state).unit.idle = idle;
    }
}

/// Victim link handle of a [`SimulatedBench`].
pub struct BenchLink {
    state: Arc<Mutex<BenchState>>,
}

impl VictimLink for BenchLink {
    fn set_reset(&mut self, level: Level) -> Result<(), GlitchError> {
        let mut state = lock(&self.state);
        let (cycle, clock) = (state.cycle, state.clock);
        state.victim.reset = level;
        state.victim.lines_changed(cycle, &clock);
        Ok(())
    }

    fn set_power(&mut self, level: Level) -> Result<(), GlitchError> {
        let mut state = lock(&self.state);
        let (cycle, clock) = (state.cycle, state.clock);
        state.victim.power = level;
        state.victim.lines_changed(cycle, &clock);
        Ok(())
    }

    fn bytes_available(&mut self) -> Result<usize, GlitchError> {
        Ok(lock(&self.state).victim.rx.len())
    }

    fn read(&mut self, max: usize) -> Result<Vec<u8>, GlitchError> {
        let mut state = lock(&self.state);
        let count = max.min(state.victim.rx.len());
        Ok(state.victim.rx.drain(..count).collect())
    }

    fn wait_us(&mut self, micros: u64) {
        let mut state = lock(&self.state);
        let target = state.cycle + state.clock.cycles_per_micros(micros);
        state.advance_to(target);
    }
}

/// Stand-in for the differential fault analysis on the bench.
///
/// Knows the victim's last round key and reveals a diagonal group's key bytes once
/// the corpus holds two distinct localized faults for that group.
pub struct BenchOracle {
    round_key: Block,
}

impl RoundKeyOracle for BenchOracle {
    fn recover_round_key(&mut self, corpus: &[Block], golden: &Block) -> Option<RoundKeyGuess> {
        let mut counts = [0usize; 4];
        for ciphertext in corpus {
            if let Category::LocalizedFault(group) = classify(golden, ciphertext) {
                counts[group] += 1;
            }
        }
        let mut guess = RoundKeyGuess::unknown();
        let mut resolved = false;
        for (group, count) in counts.iter().enumerate() {
            if *count >= 2 {
                for &index in &DIAGONAL_GROUPS[group] {
                    guess.set_byte(index, self.round_key[index]);
                }
                resolved = true;
            }
        }
        resolved.then_some(guess)
    }
}
