use itertools::Itertools;
use std::collections::HashSet;

use crate::classifier::Block;
use crate::error::GlitchError;

/// A unique localized fault and the parameters that produced it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FaultRecord {
    pub ciphertext: Block,
    pub group: usize,
    pub delay_ns: f64,
    pub length_ns: f64,
}

/// Unique faulty ciphertexts of one campaign.
#[derive(Debug, Clone)]
pub struct FaultCorpus {
    records: Vec<FaultRecord>,
    seen: HashSet<Block>,
    capacity: usize,
}

impl FaultCorpus {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Vec::new(),
            seen: HashSet::new(),
            capacity,
        }
    }

    /// Appends `record` unless its ciphertext is already present.
    ///
    /// # Returns
    ///
    /// * `Ok(true)` - Appended.
    /// * `Ok(false)` - Duplicate ciphertext, corpus unchanged.
    /// * `Err(GlitchError::CorpusCapacityExceeded)` - Corpus full, corpus unchanged.
    pub fn push(&mut self, record: FaultRecord) -> Result<bool, GlitchError> {
        if self.contains(&record.ciphertext) {
            return Ok(false);
        }
        if self.records.len() >= self.capacity() {
            return Err(GlitchError::CorpusCapacityExceeded {
                capacity: self.capacity(),
            });
        }
        self.seen.insert(record.ciphertext);
        self.records.push(record);
        Ok(true)
    }

    pub fn contains(&self, ciphertext: &Block) -> bool {
        self.seen.contains(ciphertext)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn records(&self) -> &[FaultRecord] {
        &self.records
    }

    /// Ciphertexts in insertion order, the form the round-key oracle takes.
    pub fn ciphertexts(&self) -> Vec<Block> {
        self.records.iter().map(|record| record.ciphertext).collect()
    }

    /// Records ordered by group, insertion order within a group.
    pub fn by_group(&self) -> Vec<FaultRecord> {
        self.records
            .iter()
            .copied()
            .sorted_by_key(|record| record.group)
            .collect()
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.seen.clear();
    }
}

/// Unique fault records per diagonal group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupCounters([u32; 4]);

impl GroupCounters {
    /// Counts one more record for `group` and returns the new count.
    pub fn increment(&mut self, group: usize) -> u32 {
        self.0[group] += 1;
        self.0[group]
    }

    pub fn get(&self, group: usize) -> u32 {
        self.0[group]
    }

    pub fn as_array(&self) -> [u32; 4] {
        self.0
    }

    /// True when some group has fewer than `count` records.
    pub fn any_below(&self, count: u32) -> bool {
        self.0.iter().any(|&records| records < count)
    }

    pub fn clear(&mut self) {
        self.0 = [0; 4];
    }
}

/// Attempts left that must reuse the current glitch parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryBudget {
    remaining: u32,
}

impl RetryBudget {
    pub fn is_active(&self) -> bool {
        self.remaining > 0
    }

    pub fn remaining(&self) -> u32 {
        self.remaining
    }

    pub fn start(&mut self, attempts: u32) {
        self.remaining = attempts;
    }

    /// Uses up one attempt. False when no budget was left.
    pub fn consume(&mut self) -> bool {
        if self.remaining == 0 {
            return false;
        }
        self.remaining -= 1;
        true
    }

    pub fn clear(&mut self) {
        self.remaining = 0;
    }
}
