use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;

use crate::internal::inventory::Coords;

/// Extent of the midplane grid in every dimension.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dims(SmallVec<[u16; 4]>);

impl Dims {
    pub fn new(dims: &[u16]) -> Self {
        Dims(dims.iter().copied().collect())
    }

    #[inline]
    pub fn ndims(&self) -> usize {
        self.0.len()
    }

    #[inline]
    pub fn size(&self, dim: usize) -> u16 {
        self.0[dim]
    }

    pub fn volume(&self) -> usize {
        self.0.iter().map(|d| *d as usize).product()
    }

    pub fn contains(&self, coords: &[u16]) -> bool {
        coords.len() == self.ndims() && coords.iter().zip(&self.0).all(|(c, d)| c < d)
    }

    /// Linear position of `coords`, the first dimension varies fastest.
    pub fn position(&self, coords: &[u16]) -> usize {
        let mut position = 0;
        for (c, d) in coords.iter().zip(&self.0).rev() {
            position = position * (*d as usize) + *c as usize;
        }
        position
    }
}

impl fmt::Display for Dims {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", format_coords(&self.0))
    }
}

pub fn format_coords(coords: &[u16]) -> String {
    coords
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join("x")
}

/// Axis-aligned box of midplanes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoxShape {
    pub start: Coords,
    pub size: Coords,
}

impl BoxShape {
    /// Smallest box containing every coordinate of `coords`.
    pub fn bounding<'a, I: IntoIterator<Item = &'a [u16]>>(coords: I) -> Option<BoxShape> {
        let mut iter = coords.into_iter();
        let first = iter.next()?;
        let mut low: Coords = first.iter().copied().collect();
        let mut high = low.clone();
        for c in iter {
            for (dim, value) in c.iter().enumerate() {
                low[dim] = low[dim].min(*value);
                high[dim] = high[dim].max(*value);
            }
        }
        let size = low.iter().zip(&high).map(|(l, h)| h - l + 1).collect();
        Some(BoxShape { start: low, size })
    }

    pub fn volume(&self) -> usize {
        self.size.iter().map(|s| *s as usize).product()
    }

    pub fn contains(&self, coords: &[u16]) -> bool {
        coords
            .iter()
            .zip(self.start.iter().zip(&self.size))
            .all(|(c, (start, size))| *c >= *start && *c < start + size)
    }

    /// Returns true if a request of shape `geometry` fits into this box.
    /// With `rotate`, the request dimensions may be permuted.
    pub fn can_host(&self, geometry: &[u16], rotate: bool) -> bool {
        if geometry.len() != self.size.len() {
            return false;
        }
        if !rotate {
            return self.size.iter().zip(geometry).all(|(s, g)| s >= g);
        }
        let mut size = self.size.clone();
        let mut wanted: Coords = geometry.iter().copied().collect();
        size.sort_unstable_by(|a, b| b.cmp(a));
        wanted.sort_unstable_by(|a, b| b.cmp(a));
        size.iter().zip(&wanted).all(|(s, g)| s >= g)
    }

    /// Starting coordinates of every line of the box along `dim`.
    pub fn line_starts(&self, dim: usize) -> Vec<Coords> {
        let mut starts = vec![self.start.clone()];
        for other in 0..self.size.len() {
            if other == dim {
                continue;
            }
            let mut extended = Vec::with_capacity(starts.len() * self.size[other] as usize);
            for start in &starts {
                for offset in 0..self.size[other] {
                    let mut c = start.clone();
                    c[other] += offset;
                    extended.push(c);
                }
            }
            starts = extended;
        }
        starts
    }
}

impl fmt::Display for BoxShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}",
            format_coords(&self.size),
            format_coords(&self.start)
        )
    }
}
