pub mod bench;

use crate::engine::{EngineProgram, Level};
use crate::error::GlitchError;
use crossbeam_channel::Sender;

/// Low bits of the execution unit control register: one enable bit per unit.
pub const STATUS_MASK: u32 = 0x0000_000F;

/// Pull resistor on the trigger input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pull {
    Up,
    Down,
}

impl Pull {
    /// Pull that biases a floating input towards `level`.
    pub fn towards(level: Level) -> Self {
        match level {
            Level::Low => Pull::Down,
            Level::High => Pull::Up,
        }
    }

    pub fn level(&self) -> Level {
        match self {
            Pull::Up => Level::High,
            Pull::Down => Level::Low,
        }
    }
}

/// Completion notification raised by the engine after a pulse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FiredEvent {
    /// Execution unit cycle in which the notification was raised.
    pub cycle: u64,
}

/// The independent execution unit that hosts the timing engine.
///
/// Implementations must raise notifications from their interrupt context with a
/// non-blocking send only; everything else happens on the main loop.
pub trait ExecutionUnit {
    /// Loads a program, replacing any previous one. The unit stays disabled.
    fn install(&mut self, program: &EngineProgram) -> Result<(), GlitchError>;
    /// Removes the installed program and disables the unit.
    fn remove(&mut self);
    /// Pushes a word into the engine's parameter queue.
    fn push(&mut self, word: u32) -> Result<(), GlitchError>;
    fn set_enabled(&mut self, enabled: bool);
    /// Raw control register. Bits in [`STATUS_MASK`] are set while a unit runs.
    fn control_register(&self) -> u32;
    fn connect_notifier(&mut self, notifier: Sender<FiredEvent>);
    fn configure_trigger_input(&mut self, pull: Pull);
    /// Level the glitch and mirror outputs rest at while no program drives them.
    fn configure_outputs(&mut self, idle: Level);
}

/// Serial link and control lines towards the victim.
pub trait VictimLink {
    /// Reset line, `Level::Low` holds the victim in reset.
    fn set_reset(&mut self, level: Level) -> Result<(), GlitchError>;
    /// Power enable line, `Level::Low` switches the victim off.
    fn set_power(&mut self, level: Level) -> Result<(), GlitchError>;
    fn bytes_available(&mut self) -> Result<usize, GlitchError>;
    /// Reads at most `max` buffered bytes without blocking.
    fn read(&mut self, max: usize) -> Result<Vec<u8>, GlitchError>;
    /// Blocks the main program for `micros` microseconds.
    fn wait_us(&mut self, micros: u64);

    /// Discards everything currently buffered.
    fn flush_input(&mut self) -> Result<(), GlitchError> {
        loop {
            let available = self.bytes_available()?;
            if available == 0 {
                return Ok(());
            }
            self.read(available)?;
        }
    }
}
