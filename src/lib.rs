pub mod campaign;
pub mod classifier;
pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod hardware;
pub mod oracle;
pub mod units;

pub mod prelude {
    pub use crate::campaign::{
        CampaignPhase, CampaignReport, CampaignSettings, CampaignStatistics, FaultCorpus,
        FaultRecord, GroupCounters, Orchestrator, OrchestratorContext, Outcome, RetryBudget,
    };
    pub use crate::classifier::{classify, Block, Category, CategoryKind, BLOCK_SIZE, DIAGONAL_GROUPS};
    pub use crate::controller::{ArmAck, FiredHandler, GlitchController};
    pub use crate::engine::{
        Edge, EngineEvent, EngineProgram, EngineState, EngineVariant, Level, Polarity,
        TimingEngine,
    };
    pub use crate::error::GlitchError;
    pub use crate::hardware::bench::{BenchConfig, BenchLink, BenchOracle, BenchUnit, SimulatedBench};
    pub use crate::hardware::{ExecutionUnit, FiredEvent, Pull, VictimLink};
    pub use crate::oracle::key_schedule::Aes128KeySchedule;
    pub use crate::oracle::{KeyRecoveryState, KeyScheduleOracle, RoundKeyGuess, RoundKeyOracle};
    pub use crate::units::{ClockParameters, GlitchParameters};
}
