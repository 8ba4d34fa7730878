//! Cycle accurate model of the glitch timing engine.
//!
//! The engine runs on its own execution unit: wait for a trigger edge, count a delay,
//! drive a pulse, notify, then either halt or re-arm. [`EngineProgram`] holds the
//! instruction sequence, [`TimingEngine`] executes it one engine cycle per
//! [`TimingEngine::step`].

pub mod program;

use serde::Deserialize;
use std::collections::VecDeque;
use std::fmt;
use std::ops::Not;
use std::str::FromStr;

use crate::error::GlitchError;
pub use program::{EngineProgram, Op};

/// Depth of the engine's parameter queue.
pub const PARAMETER_QUEUE_DEPTH: usize = 4;

/// Cycles between the cycle that observes the trigger edge and the cycle that drives
/// the pulse, on top of the loaded delay.
pub const TRIGGER_TO_PULSE_OVERHEAD_CYCLES: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Low,
    High,
}

impl Not for Level {
    type Output = Level;

    fn not(self) -> Level {
        match self {
            Level::Low => Level::High,
            Level::High => Level::Low,
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Low => write!(f, "0"),
            Level::High => write!(f, "1"),
        }
    }
}

/// Trigger edge the engine waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Edge {
    Rising,
    Falling,
}

impl Edge {
    /// Input level that must be seen before the edge.
    pub fn pre_level(&self) -> Level {
        match self {
            Edge::Rising => Level::Low,
            Edge::Falling => Level::High,
        }
    }

    pub fn post_level(&self) -> Level {
        !self.pre_level()
    }
}

impl FromStr for Edge {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.to_lowercase().as_str() {
            "rising" | "r" | "1" => Ok(Edge::Rising),
            "falling" | "f" | "0" => Ok(Edge::Falling),
            _ => Err(format!("Unknown trigger edge: {:?}", input)),
        }
    }
}

/// Level of the glitch pulse itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Polarity {
    #[serde(alias = "low")]
    ActiveLow,
    #[serde(alias = "high")]
    ActiveHigh,
}

impl Polarity {
    pub fn active_level(&self) -> Level {
        match self {
            Polarity::ActiveLow => Level::Low,
            Polarity::ActiveHigh => Level::High,
        }
    }

    pub fn inactive_level(&self) -> Level {
        !self.active_level()
    }
}

impl FromStr for Polarity {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.to_lowercase().as_str() {
            "high" | "active_high" | "h" | "1" => Ok(Polarity::ActiveHigh),
            "low" | "active_low" | "l" | "0" => Ok(Polarity::ActiveLow),
            _ => Err(format!("Unknown output polarity: {:?}", input)),
        }
    }
}

/// One of the eight engine behaviours: 2 edges x 2 polarities x 2 re-arm modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EngineVariant {
    pub edge: Edge,
    pub polarity: Polarity,
    pub auto_rearm: bool,
}

impl EngineVariant {
    pub fn new(edge: Edge, polarity: Polarity, auto_rearm: bool) -> Self {
        Self {
            edge,
            polarity,
            auto_rearm,
        }
    }

    /// All variants, in table order.
    pub fn all() -> [EngineVariant; 8] {
        let mut table = [EngineVariant::new(Edge::Rising, Polarity::ActiveHigh, false); 8];
        let mut index = 0;
        for auto_rearm in [false, true] {
            for polarity in [Polarity::ActiveLow, Polarity::ActiveHigh] {
                for edge in [Edge::Rising, Edge::Falling] {
                    table[index] = EngineVariant::new(edge, polarity, auto_rearm);
                    index += 1;
                }
            }
        }
        table
    }
}

impl fmt::Display for EngineVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pulse = match self.polarity {
            Polarity::ActiveLow => "low",
            Polarity::ActiveHigh => "high",
        };
        let edge = match self.edge {
            Edge::Rising => "low_to_high",
            Edge::Falling => "high_to_low",
        };
        write!(f, "{pulse}_glitch_on_{edge}_trigger")?;
        if self.auto_rearm {
            write!(f, "_auto_rearm")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Disarmed,
    ArmedWaitingForTrigger,
    Delaying,
    Pulsing,
    Fired,
}

/// Notable things that happened during one engine cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineEvent {
    PulseStarted,
    PulseEnded,
    Fired,
}

/// Interpreter for an [`EngineProgram`].
#[derive(Debug, Clone)]
pub struct TimingEngine {
    program: EngineProgram,
    pc: usize,
    queue: VecDeque<u32>,
    length: u32,
    delay: u32,
    counter: Option<u32>,
    output: Level,
    cycles: u64,
}

impl TimingEngine {
    pub fn new(program: EngineProgram) -> Self {
        let output = program.variant().polarity.inactive_level();
        Self {
            program,
            pc: 0,
            queue: VecDeque::with_capacity(PARAMETER_QUEUE_DEPTH),
            length: 0,
            delay: 0,
            counter: None,
            output,
            cycles: 0,
        }
    }

    pub fn variant(&self) -> EngineVariant {
        self.program.variant()
    }

    /// Appends a word to the parameter queue.
    pub fn push(&mut self, word: u32) -> Result<(), GlitchError> {
        if self.queue.len() >= PARAMETER_QUEUE_DEPTH {
            return Err(GlitchError::Hardware(
                "engine parameter queue full".to_string(),
            ));
        }
        self.queue.push_back(word);
        Ok(())
    }

    pub fn output(&self) -> Level {
        self.output
    }

    pub fn state(&self) -> EngineState {
        self.program.state_at(self.pc)
    }

    /// Cycles executed since the program was started.
    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Back to the first instruction with the parameter registers cleared.
    pub fn restart(&mut self) {
        *self = Self::new(self.program.clone());
    }

    /// True when the next cycle cannot change anything unless the input changes.
    pub fn is_stalled(&self, input: Level) -> bool {
        match self.program.op(self.pc) {
            Op::WaitInput(level) => input != level,
            Op::PullLength | Op::PullDelay => self.queue.is_empty(),
            Op::Halt => true,
            _ => false,
        }
    }

    /// Executes one engine cycle with the trigger input at `input`.
    pub fn step(&mut self, input: Level) -> Option<EngineEvent> {
        self.cycles += 1;
        // Free fall-throughs are bounded by the program length
        for _ in 0..=self.program.len() {
            match self.program.op(self.pc) {
                Op::SetOutput(level) => {
                    let previous = self.output;
                    self.output = level;
                    self.pc += 1;
                    let active = self.variant().polarity.active_level();
                    return match (previous == active, level == active) {
                        (false, true) => Some(EngineEvent::PulseStarted),
                        (true, false) => Some(EngineEvent::PulseEnded),
                        _ => None,
                    };
                }
                Op::PullLength => {
                    if let Some(word) = self.queue.pop_front() {
                        self.length = word;
                        self.pc += 1;
                    }
                    return None;
                }
                Op::PullDelay => {
                    if let Some(word) = self.queue.pop_front() {
                        self.delay = word;
                        self.pc += 1;
                    }
                    return None;
                }
                Op::WaitInput(level) => {
                    if input == level {
                        self.pc += 1;
                    }
                    return None;
                }
                Op::CountDelay => {
                    if self.count_down(self.delay) {
                        continue;
                    }
                    return None;
                }
                Op::CountLength => {
                    if self.count_down(self.length) {
                        continue;
                    }
                    return None;
                }
                Op::Notify => {
                    self.pc += 1;
                    return Some(EngineEvent::Fired);
                }
                Op::Jump(target) => {
                    self.pc = target;
                    continue;
                }
                Op::Halt => return None,
            }
        }
        None
    }

    /// One cycle of a count loop. Returns true when the loop was entered with
    /// nothing to count and the cycle is still free.
    fn count_down(&mut self, load: u32) -> bool {
        let remaining = match self.counter {
            Some(remaining) => remaining,
            None if load == 0 => {
                self.pc += 1;
                return true;
            }
            None => load,
        };
        if remaining <= 1 {
            self.counter = None;
            self.pc += 1;
        } else {
            self.counter = Some(remaining - 1);
        }
        false
    }
}
