//! Fault propagation classification of captured ciphertexts.

use itertools::Itertools;
use std::fmt;

pub const BLOCK_SIZE: usize = 16;

/// One AES block.
pub type Block = [u8; BLOCK_SIZE];

/// Byte indices of the four state diagonals, column-major byte order. A single byte
/// fault one round before the end corrupts exactly one of these.
pub const DIAGONAL_GROUPS: [[usize; 4]; 4] = [
    [0, 7, 10, 13],
    [1, 4, 11, 14],
    [2, 5, 8, 15],
    [3, 6, 9, 12],
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    NoResponse,
    ShortResponse,
    Match,
    LocalizedFault(usize),
    DiffuseFault,
}

/// [`Category`] without the group, for counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CategoryKind {
    Match,
    NoResponse,
    LocalizedFault,
    DiffuseFault,
    ShortResponse,
}

impl CategoryKind {
    pub const ALL: [CategoryKind; 5] = [
        CategoryKind::Match,
        CategoryKind::NoResponse,
        CategoryKind::LocalizedFault,
        CategoryKind::DiffuseFault,
        CategoryKind::ShortResponse,
    ];

    pub fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for CategoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CategoryKind::Match => "match",
            CategoryKind::NoResponse => "no response",
            CategoryKind::LocalizedFault => "localized fault",
            CategoryKind::DiffuseFault => "diffuse fault",
            CategoryKind::ShortResponse => "short response",
        };
        write!(f, "{label}")
    }
}

impl Category {
    pub fn kind(&self) -> CategoryKind {
        match self {
            Category::NoResponse => CategoryKind::NoResponse,
            Category::ShortResponse => CategoryKind::ShortResponse,
            Category::Match => CategoryKind::Match,
            Category::LocalizedFault(_) => CategoryKind::LocalizedFault,
            Category::DiffuseFault => CategoryKind::DiffuseFault,
        }
    }

    pub fn group(&self) -> Option<usize> {
        match self {
            Category::LocalizedFault(group) => Some(*group),
            _ => None,
        }
    }
}

/// Diagonal group a byte index belongs to.
pub fn group_of(index: usize) -> usize {
    // row + column, mod 4
    (index % 4 + index / 4) % 4
}

/// Bit `i` set when byte `i` of `observed` differs from `golden`. Only the first
/// block of `observed` is compared.
pub fn mismatch_bitmap(golden: &Block, observed: &[u8]) -> u16 {
    golden
        .iter()
        .zip(observed.iter().take(BLOCK_SIZE))
        .positions(|(expected, actual)| expected != actual)
        .fold(0u16, |bitmap, index| bitmap | 1 << index)
}

/// Classifies `observed` against the golden ciphertext.
///
/// # Arguments
///
/// * `golden` - Reference ciphertext.
/// * `observed` - Captured bytes, any length. Bytes past the first block are ignored.
///
/// # Returns
///
/// * `Category` - `LocalizedFault(g)` only when all four bytes of diagonal `g` and no
///   other byte differ.
pub fn classify(golden: &Block, observed: &[u8]) -> Category {
    if observed.is_empty() {
        return Category::NoResponse;
    }
    if observed.len() < BLOCK_SIZE {
        return Category::ShortResponse;
    }
    let bitmap = mismatch_bitmap(golden, observed);
    if bitmap == 0 {
        return Category::Match;
    }
    let group = group_of(bitmap.trailing_zeros() as usize);
    if group_mask(&DIAGONAL_GROUPS[group]) == bitmap {
        Category::LocalizedFault(group)
    } else {
        Category::DiffuseFault
    }
}

fn group_mask(group: &[usize; 4]) -> u16 {
    group.iter().fold(0u16, |mask, index| mask | 1 << index)
}
