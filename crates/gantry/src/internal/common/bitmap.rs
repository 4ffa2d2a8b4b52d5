use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

const WORD_BITS: usize = u64::BITS as usize;

/// Fixed-size set of bit indices.
///
/// Node bitmaps are indexed by inventory slot, midplane bitmaps by primitive
/// block index and ionode bitmaps by ionode position inside a midplane.
/// Binary operations require both operands to have the same size.
#[derive(Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Bitmap {
    words: Vec<u64>,
    size: usize,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BitmapError {
    #[error("invalid range expression `{0}`")]
    InvalidExpression(String),
    #[error("bit {bit} is out of range (bitmap size {size})")]
    OutOfRange { bit: usize, size: usize },
}

impl Bitmap {
    pub fn new(size: usize) -> Self {
        Bitmap {
            words: vec![0; size.div_ceil(WORD_BITS)],
            size,
        }
    }

    pub fn full(size: usize) -> Self {
        let mut bitmap = Self::new(size);
        bitmap.set_range(0, size);
        bitmap
    }

    pub fn from_indices<I: IntoIterator<Item = usize>>(size: usize, indices: I) -> Self {
        let mut bitmap = Self::new(size);
        for index in indices {
            bitmap.set(index);
        }
        bitmap
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn set(&mut self, bit: usize) {
        assert!(bit < self.size, "bit {bit} out of range {}", self.size);
        self.words[bit / WORD_BITS] |= 1 << (bit % WORD_BITS);
    }

    #[inline]
    pub fn clear(&mut self, bit: usize) {
        assert!(bit < self.size, "bit {bit} out of range {}", self.size);
        self.words[bit / WORD_BITS] &= !(1 << (bit % WORD_BITS));
    }

    #[inline]
    pub fn test(&self, bit: usize) -> bool {
        bit < self.size && self.words[bit / WORD_BITS] & (1 << (bit % WORD_BITS)) != 0
    }

    /// Sets every bit in `start..end`.
    pub fn set_range(&mut self, start: usize, end: usize) {
        for bit in start..end {
            self.set(bit);
        }
    }

    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_clear(&self) -> bool {
        self.words.iter().all(|w| *w == 0)
    }

    pub fn first_set(&self) -> Option<usize> {
        self.iter().next()
    }

    pub fn last_set(&self) -> Option<usize> {
        self.words
            .iter()
            .enumerate()
            .rev()
            .find(|(_, w)| **w != 0)
            .map(|(i, w)| i * WORD_BITS + (WORD_BITS - 1 - w.leading_zeros() as usize))
    }

    pub fn first_clear(&self) -> Option<usize> {
        self.words
            .iter()
            .enumerate()
            .find(|(_, w)| **w != u64::MAX)
            .map(|(i, w)| i * WORD_BITS + (!w).trailing_zeros() as usize)
            .filter(|bit| *bit < self.size)
    }

    pub fn and(&self, other: &Bitmap) -> Bitmap {
        let mut result = self.clone();
        result.and_assign(other);
        result
    }

    pub fn or(&self, other: &Bitmap) -> Bitmap {
        let mut result = self.clone();
        result.or_assign(other);
        result
    }

    pub fn and_not(&self, other: &Bitmap) -> Bitmap {
        let mut result = self.clone();
        result.and_not_assign(other);
        result
    }

    pub fn not(&self) -> Bitmap {
        let mut result = Bitmap {
            words: self.words.iter().map(|w| !w).collect(),
            size: self.size,
        };
        result.mask_tail();
        result
    }

    pub fn and_assign(&mut self, other: &Bitmap) {
        self.check_size(other);
        for (a, b) in self.words.iter_mut().zip(&other.words) {
            *a &= b;
        }
    }

    pub fn or_assign(&mut self, other: &Bitmap) {
        self.check_size(other);
        for (a, b) in self.words.iter_mut().zip(&other.words) {
            *a |= b;
        }
    }

    pub fn and_not_assign(&mut self, other: &Bitmap) {
        self.check_size(other);
        for (a, b) in self.words.iter_mut().zip(&other.words) {
            *a &= !b;
        }
    }

    pub fn is_subset_of(&self, other: &Bitmap) -> bool {
        self.check_size(other);
        self.words
            .iter()
            .zip(&other.words)
            .all(|(a, b)| a & !b == 0)
    }

    pub fn intersects(&self, other: &Bitmap) -> bool {
        self.check_size(other);
        self.words.iter().zip(&other.words).any(|(a, b)| a & b != 0)
    }

    /// Returns the first `n` set bits as a new bitmap, or `None` when fewer
    /// than `n` bits are set. `self` is left untouched.
    pub fn pick_n(&self, n: usize) -> Option<Bitmap> {
        let mut picked = Bitmap::new(self.size);
        let mut remaining = n;
        for bit in self.iter() {
            if remaining == 0 {
                break;
            }
            picked.set(bit);
            remaining -= 1;
        }
        (remaining == 0).then_some(picked)
    }

    /// Like [`Bitmap::pick_n`], but the picked bits are removed from `self`.
    pub fn take_n(&mut self, n: usize) -> Option<Bitmap> {
        let picked = self.pick_n(n)?;
        self.and_not_assign(&picked);
        Some(picked)
    }

    pub fn iter(&self) -> Ones<'_> {
        Ones {
            words: &self.words,
            index: 0,
            current: self.words.first().copied().unwrap_or(0),
        }
    }

    /// Parses expressions such as `0-3,7`. An empty expression gives an empty bitmap.
    pub fn from_range_expr(size: usize, expr: &str) -> Result<Bitmap, BitmapError> {
        let mut bitmap = Bitmap::new(size);
        let expr = expr.trim();
        if expr.is_empty() {
            return Ok(bitmap);
        }
        let invalid = || BitmapError::InvalidExpression(expr.to_string());
        for token in expr.split(',') {
            let (start, end) = match token.split_once('-') {
                Some((start, end)) => (start, end),
                None => (token, token),
            };
            let start: usize = start.trim().parse().map_err(|_| invalid())?;
            let end: usize = end.trim().parse().map_err(|_| invalid())?;
            if start > end {
                return Err(invalid());
            }
            if end >= size {
                return Err(BitmapError::OutOfRange { bit: end, size });
            }
            bitmap.set_range(start, end + 1);
        }
        Ok(bitmap)
    }

    pub fn to_range_expr(&self) -> String {
        let mut ranges: Vec<(usize, usize)> = Vec::new();
        for bit in self.iter() {
            match ranges.last_mut() {
                Some((_, end)) if *end + 1 == bit => *end = bit,
                _ => ranges.push((bit, bit)),
            }
        }
        ranges
            .iter()
            .map(|&(start, end)| {
                if start == end {
                    start.to_string()
                } else {
                    format!("{start}-{end}")
                }
            })
            .collect::<Vec<_>>()
            .join(",")
    }

    #[inline]
    fn check_size(&self, other: &Bitmap) {
        assert_eq!(self.size, other.size, "bitmap size mismatch");
    }

    fn mask_tail(&mut self) {
        let rem = self.size % WORD_BITS;
        if rem != 0 {
            if let Some(last) = self.words.last_mut() {
                *last &= (1u64 << rem) - 1;
            }
        }
    }
}

impl fmt::Debug for Bitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bitmap[{}]/{}", self.to_range_expr(), self.size)
    }
}

/// Iterator over set bits in ascending order.
pub struct Ones<'a> {
    words: &'a [u64],
    index: usize,
    current: u64,
}

impl Iterator for Ones<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        loop {
            if self.current != 0 {
                let bit = self.current.trailing_zeros() as usize;
                self.current &= self.current - 1;
                return Some(self.index * WORD_BITS + bit);
            }
            self.index += 1;
            if self.index >= self.words.len() {
                return None;
            }
            self.current = self.words[self.index];
        }
    }
}
