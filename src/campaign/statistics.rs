use colored::{ColoredString, Colorize};
use std::fmt::Display;

use super::corpus::FaultRecord;
use crate::classifier::{mismatch_bitmap, Block, CategoryKind};
use crate::oracle::KeyRecoveryState;

/// Running minimum and maximum.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds<T> {
    range: Option<(T, T)>,
}

impl<T> Default for Bounds<T> {
    fn default() -> Self {
        Self { range: None }
    }
}

impl<T: Copy + PartialOrd> Bounds<T> {
    pub fn record(&mut self, value: T) {
        self.range = Some(match self.range {
            None => (value, value),
            Some((min, max)) => (
                if value < min { value } else { min },
                if value > max { value } else { max },
            ),
        });
    }

    pub fn min(&self) -> Option<T> {
        self.range.map(|(min, _)| min)
    }

    pub fn max(&self) -> Option<T> {
        self.range.map(|(_, max)| max)
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_none()
    }
}

impl<T: Display> Bounds<T> {
    fn describe(&self, unit: &str) -> String {
        match &self.range {
            Some((min, max)) => format!("{min:.0}{unit} .. {max:.0}{unit}"),
            None => "-".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CategoryStats {
    pub count: u64,
    pub delay_ns: Bounds<f64>,
    pub length_ns: Bounds<f64>,
}

/// Counters of one campaign. Attempt 0 (the golden capture) is not counted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CampaignStatistics {
    pub attempts: u64,
    categories: [CategoryStats; 5],
    pub group_delay_ns: [Bounds<f64>; 4],
    /// Polls needed until the capture completed or gave up.
    pub read_attempts: Bounds<u32>,
    pub rereads: u64,
    pub glitches_fired: u64,
    pub oracle_calls: u64,
    /// Unique faults that did not fit into the corpus.
    pub dropped_samples: u64,
    pub corpus_truncated: bool,
}

impl CampaignStatistics {
    pub fn category(&self, kind: CategoryKind) -> &CategoryStats {
        &self.categories[kind.index()]
    }

    pub fn count(&self, kind: CategoryKind) -> u64 {
        self.category(kind).count
    }

    pub fn record(&mut self, kind: CategoryKind, delay_ns: f64, length_ns: f64) {
        let stats = &mut self.categories[kind.index()];
        stats.count += 1;
        stats.delay_ns.record(delay_ns);
        stats.length_ns.record(length_ns);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    KeyRecovered { base_key: Block },
    Exhausted,
}

/// Everything a finished campaign leaves behind.
#[derive(Debug, Clone)]
pub struct CampaignReport {
    pub outcome: Outcome,
    pub golden: Block,
    pub statistics: CampaignStatistics,
    pub key: KeyRecoveryState,
    pub group_counts: [u32; 4],
    /// Ordered by group.
    pub corpus: Vec<FaultRecord>,
}

pub(crate) fn paint(kind: CategoryKind, text: &str) -> ColoredString {
    match kind {
        CategoryKind::Match => text.green(),
        CategoryKind::NoResponse => text.bright_black(),
        CategoryKind::LocalizedFault => text.red(),
        CategoryKind::DiffuseFault => text.truecolor(255, 165, 0),
        CategoryKind::ShortResponse => text.cyan(),
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|byte| format!("{byte:02x}")).collect()
}

impl CampaignReport {
    pub fn base_key(&self) -> Option<Block> {
        match self.outcome {
            Outcome::KeyRecovered { base_key } => Some(base_key),
            Outcome::Exhausted => None,
        }
    }

    /// Prints the report to stdout.
    ///
    /// # Arguments
    ///
    /// * `details` - Also list every fault record.
    pub fn print(&self, details: bool) {
        let stats = &self.statistics;
        println!("\nGolden ciphertext: {}", hex(&self.golden));
        println!("Attempts: {}", stats.attempts);
        for kind in CategoryKind::ALL {
            let category = stats.category(kind);
            println!(
                "  {:<16} {:>7}  delay {}  length {}",
                paint(kind, &kind.to_string()),
                category.count,
                category.delay_ns.describe(" ns"),
                category.length_ns.describe(" ns")
            );
        }
        for (group, bounds) in stats.group_delay_ns.iter().enumerate() {
            println!(
                "  group {group}: {} unique, delay {}",
                self.group_counts[group],
                bounds.describe(" ns")
            );
        }
        println!(
            "Read attempts {}, re-reads {}, glitches fired {}, oracle calls {}",
            stats.read_attempts.describe(""),
            stats.rereads,
            stats.glitches_fired,
            stats.oracle_calls
        );
        if stats.corpus_truncated {
            println!(
                "{}",
                format!("Too many ciphertexts: {} dropped", stats.dropped_samples).yellow()
            );
        }

        if details {
            println!("\nFault corpus ({} records):", self.corpus.len());
            for record in &self.corpus {
                let bitmap = mismatch_bitmap(&self.golden, &record.ciphertext);
                let ciphertext: String = record
                    .ciphertext
                    .iter()
                    .enumerate()
                    .map(|(index, byte)| {
                        let text = format!("{byte:02x}");
                        if bitmap & 1 << index != 0 {
                            text.red().to_string()
                        } else {
                            text
                        }
                    })
                    .collect();
                println!(
                    "  [{}] {} delay {:.0} ns length {:.0} ns",
                    record.group, ciphertext, record.delay_ns, record.length_ns
                );
            }
        }

        println!(
            "\nRound 10 key: {} ({}%)",
            self.key.partial_round_key, self.key.percent_found
        );
        match self.outcome {
            Outcome::KeyRecovered { base_key } => {
                println!("{} {}", "Base key:".green().bold(), hex(&base_key))
            }
            Outcome::Exhausted => println!("{}", "Key not recovered".yellow()),
        }
    }
}
