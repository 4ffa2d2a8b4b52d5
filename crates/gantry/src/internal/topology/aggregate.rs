use crate::internal::common::bitmap::Bitmap;
use crate::internal::topology::TopologyConfigError;
use crate::internal::topology::block::{Block, BlockState};
use crate::internal::topology::config::Midplane;
use crate::internal::topology::geometry::BoxShape;

/// Builds the blocks of every allowed level.
///
/// A block of level `L` joins `2^L` consecutive midplanes starting at a
/// multiple of `2^L`. Midplanes left over at the end of a level are not
/// aggregated again; they stay covered by the blocks of lower levels.
/// The result is ordered by level, then by first midplane.
pub(crate) fn build_blocks(
    midplanes: &[Midplane],
    levels: &[u32],
    node_count: usize,
) -> Result<Vec<Block>, TopologyConfigError> {
    let count = midplanes.len();
    let mut blocks = Vec::new();
    for &level in levels {
        let chunk = 1usize << level;
        for first in (0..count / chunk).map(|c| c * chunk) {
            let members = &midplanes[first..first + chunk];
            let name = if level == 0 {
                members[0].name.clone()
            } else {
                format!("{}-{}", members[0].name, members[chunk - 1].name)
            };
            let shape = BoxShape::bounding(members.iter().map(|m| m.coords.as_slice()))
                .ok_or_else(|| TopologyConfigError::NotRectangular(name.clone()))?;
            if shape.volume() != chunk {
                return Err(TopologyConfigError::NotRectangular(name));
            }
            let mut midplane_bitmap = Bitmap::new(count);
            midplane_bitmap.set_range(first, first + chunk);
            let nodes = Bitmap::from_indices(
                node_count,
                members.iter().flat_map(|m| m.nodes.iter().copied()),
            );
            blocks.push(Block {
                name,
                level,
                midplanes: midplane_bitmap,
                first_midplane: first,
                shape,
                nodes,
                ionodes: None,
                state: BlockState::Free,
            });
        }
        if count % chunk != 0 && level > 0 {
            log::debug!(
                "Level {level}: {} trailing midplanes stay covered by smaller blocks",
                count % chunk
            );
        }
    }
    blocks.sort_by_key(|b| (b.level, b.first_midplane));
    Ok(blocks)
}

/// Indices of the blocks that cover every midplane exactly once at `level`.
///
/// Full blocks of the level are used where they exist; the remainder is
/// covered greedily by the largest lower-level blocks.
pub(crate) fn covering_blocks(
    blocks: &[Block],
    levels: &[u32],
    midplane_count: usize,
    level: u32,
) -> Vec<usize> {
    let mut covering = Vec::new();
    let mut next = 0;
    for &candidate in levels.iter().rev().filter(|l| **l <= level) {
        let chunk = 1usize << candidate;
        while next + chunk <= midplane_count {
            let Some(index) = blocks.iter().position(|b| {
                !b.is_small() && b.level == candidate && b.first_midplane == next
            }) else {
                break;
            };
            covering.push(index);
            next += chunk;
        }
    }
    covering
}
