use super::{EngineState, EngineVariant, Level};

/// One engine instruction. Every instruction takes one engine cycle except `Jump`
/// and a count instruction entered with a zero count, which fall through for free.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// Drive glitch output and mirror output to `Level`.
    SetOutput(Level),
    /// Block until the parameter queue holds a word, then load the pulse length.
    PullLength,
    /// Block until the parameter queue holds a word, then load the trigger delay.
    PullDelay,
    /// Stall until the trigger input reads `Level`.
    WaitInput(Level),
    /// Count down the loaded delay, one cycle per count.
    CountDelay,
    /// Count down the loaded length, one cycle per count.
    CountLength,
    /// Raise the completion interrupt.
    Notify,
    Jump(usize),
    Halt,
}

// Fixed layout of the assembled program
const REARM_TARGET: usize = 3;
const DELAY_INDEX: usize = 5;
const PULSE_INDEX: usize = 6;
const NOTIFY_INDEX: usize = 9;

/// Engine program for one variant.
///
/// All eight variants share one instruction sequence. Three independent transforms
/// pick the edge-wait levels, the output sense and the wrap/halt tail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineProgram {
    variant: EngineVariant,
    ops: Vec<Op>,
}

impl EngineProgram {
    pub fn assemble(variant: EngineVariant) -> Self {
        let pre = variant.edge.pre_level();
        let post = variant.edge.post_level();
        let active = variant.polarity.active_level();
        let inactive = variant.polarity.inactive_level();
        let tail = if variant.auto_rearm {
            Op::Jump(REARM_TARGET)
        } else {
            Op::Halt
        };

        let ops = vec![
            Op::SetOutput(inactive),
            Op::PullLength,
            Op::PullDelay,
            Op::WaitInput(pre),
            Op::WaitInput(post),
            Op::CountDelay,
            Op::SetOutput(active),
            Op::CountLength,
            Op::SetOutput(inactive),
            Op::Notify,
            // Re-arm guard: the trigger must fall back before the next edge counts
            Op::WaitInput(pre),
            tail,
        ];
        debug_assert_eq!(ops[DELAY_INDEX], Op::CountDelay);
        debug_assert_eq!(ops[PULSE_INDEX], Op::SetOutput(active));
        debug_assert_eq!(ops[NOTIFY_INDEX], Op::Notify);

        Self { variant, ops }
    }

    pub fn variant(&self) -> EngineVariant {
        self.variant
    }

    pub fn ops(&self) -> &[Op] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub(crate) fn op(&self, pc: usize) -> Op {
        self.ops.get(pc).copied().unwrap_or(Op::Halt)
    }

    /// Observable state while the program counter sits at `pc`.
    pub(crate) fn state_at(&self, pc: usize) -> EngineState {
        match pc {
            pc if pc < DELAY_INDEX => EngineState::ArmedWaitingForTrigger,
            DELAY_INDEX => EngineState::Delaying,
            pc if pc < NOTIFY_INDEX => EngineState::Pulsing,
            _ => EngineState::Fired,
        }
    }
}
