//! Seams towards the cryptanalysis: round-key recovery and key-schedule reversal.

pub mod key_schedule;

use regex::Regex;
use std::fmt;
use std::str::FromStr;

use crate::classifier::{Block, BLOCK_SIZE};
use crate::error::GlitchError;

const NIBBLES: usize = BLOCK_SIZE * 2;
const WILDCARD: char = '.';

/// Produces a partial last-round key from the fault corpus.
pub trait RoundKeyOracle {
    /// `None` when nothing could be resolved.
    fn recover_round_key(&mut self, corpus: &[Block], golden: &Block) -> Option<RoundKeyGuess>;
}

/// Derives the base key from a complete round key.
pub trait KeyScheduleOracle {
    fn reverse_key_schedule(&self, round_key: &Block, round: usize) -> Result<Block, GlitchError>;
}

/// Round key with unknown nibbles, written as 32 hex digits with `.` for unknowns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RoundKeyGuess {
    nibbles: [Option<u8>; NIBBLES],
}

impl Default for RoundKeyGuess {
    fn default() -> Self {
        Self::unknown()
    }
}

impl RoundKeyGuess {
    /// Nothing known.
    pub fn unknown() -> Self {
        Self {
            nibbles: [None; NIBBLES],
        }
    }

    pub fn from_bytes(bytes: &Block) -> Self {
        let mut guess = Self::unknown();
        for (index, byte) in bytes.iter().enumerate() {
            guess.set_byte(index, *byte);
        }
        guess
    }

    pub fn set_byte(&mut self, index: usize, byte: u8) {
        self.nibbles[2 * index] = Some(byte >> 4);
        self.nibbles[2 * index + 1] = Some(byte & 0x0F);
    }

    pub fn byte(&self, index: usize) -> Option<u8> {
        match (self.nibbles[2 * index], self.nibbles[2 * index + 1]) {
            (Some(high), Some(low)) => Some(high << 4 | low),
            _ => None,
        }
    }

    pub fn resolved_nibbles(&self) -> usize {
        self.nibbles.iter().flatten().count()
    }

    /// Share of resolved nibbles, rounded to a whole percent.
    pub fn percent_found(&self) -> u8 {
        (self.resolved_nibbles() as f64 / NIBBLES as f64 * 100.0).round() as u8
    }

    pub fn is_complete(&self) -> bool {
        self.resolved_nibbles() == NIBBLES
    }

    /// The key bytes, once every nibble is known.
    pub fn to_bytes(&self) -> Option<Block> {
        let mut bytes = [0u8; BLOCK_SIZE];
        for (index, byte) in bytes.iter_mut().enumerate() {
            *byte = self.byte(index)?;
        }
        Some(bytes)
    }
}

impl FromStr for RoundKeyGuess {
    type Err = GlitchError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let shape = Regex::new(r"^[0-9a-fA-F.]{32}$")
            .map_err(|error| GlitchError::invalid(error.to_string()))?;
        if !shape.is_match(input) {
            return Err(GlitchError::invalid(format!(
                "round key guess must be 32 hex digits or '{WILDCARD}', got {input:?}"
            )));
        }
        let mut guess = Self::unknown();
        for (slot, digit) in guess.nibbles.iter_mut().zip(input.chars()) {
            *slot = digit.to_digit(16).map(|value| value as u8);
        }
        Ok(guess)
    }
}

impl fmt::Display for RoundKeyGuess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for nibble in &self.nibbles {
            match nibble {
                Some(value) => write!(f, "{value:x}")?,
                None => write!(f, "{WILDCARD}")?,
            }
        }
        Ok(())
    }
}

/// Key recovery progress of one campaign.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyRecoveryState {
    pub partial_round_key: RoundKeyGuess,
    pub percent_found: u8,
    pub recovered_base_key: Option<Block>,
}

impl KeyRecoveryState {
    /// Records an oracle answer. No answer counts as no progress.
    /// No guess resets the round key to all unknown.
    pub fn update(&mut self, guess: Option<RoundKeyGuess>) {
        self.partial_round_key = guess.unwrap_or_else(RoundKeyGuess::unknown);
        self.percent_found = self.partial_round_key.percent_found();
    }

    pub fn is_complete(&self) -> bool {
        self.percent_found == 100
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}
