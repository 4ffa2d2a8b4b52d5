use smallvec::smallvec;

use crate::internal::common::Map;
use crate::internal::common::ids::NodeIndex;
use crate::internal::inventory::{Coords, NodeInventory};
use crate::internal::server::config::TopologyConfig;
use crate::internal::topology::geometry::{Dims, format_coords};
use crate::internal::topology::{MAX_BLOCK_LEVEL, TopologyConfigError};

/// Primitive topology unit.
#[derive(Debug, Clone)]
pub struct Midplane {
    pub(crate) name: String,
    pub(crate) coords: Coords,
    /// Member nodes in node index order.
    pub(crate) nodes: Vec<NodeIndex>,
}

impl Midplane {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn coords(&self) -> &[u16] {
        &self.coords
    }

    pub fn nodes(&self) -> &[NodeIndex] {
        &self.nodes
    }
}

pub(crate) struct MidplaneLayout {
    pub dims: Dims,
    pub base_size: usize,
    pub midplanes: Vec<Midplane>,
}

/// Resolves configured blocks into primitive midplanes of the base size.
///
/// The base size is the node count of the first block. A block of `k` times
/// the base size yields `k` consecutive midplanes.
pub(crate) fn load_midplanes(
    config: &TopologyConfig,
    inventory: &NodeInventory,
) -> Result<MidplaneLayout, TopologyConfigError> {
    let mut members: Vec<(String, Vec<NodeIndex>, Option<&[u16]>)> =
        Vec::with_capacity(config.blocks.len());
    let mut owners: Map<NodeIndex, usize> = Map::default();
    for (position, block) in config.blocks.iter().enumerate() {
        let bitmap = inventory.name2bitmap(&block.nodes).map_err(|e| {
            TopologyConfigError::InvalidNodes {
                block: block.name.clone(),
                reason: e.to_string(),
            }
        })?;
        if bitmap.is_clear() {
            return Err(TopologyConfigError::InvalidNodes {
                block: block.name.clone(),
                reason: "block has no nodes".to_string(),
            });
        }
        for index in bitmap.iter() {
            if let Some(first) = owners.insert(index, position) {
                return Err(TopologyConfigError::NodeInTwoBlocks {
                    node: inventory.node(index).name().to_string(),
                    first: config.blocks[first].name.clone(),
                    second: block.name.clone(),
                });
            }
        }
        members.push((
            block.name.clone(),
            bitmap.iter().collect(),
            block.coords.as_deref(),
        ));
    }

    let base_size = members
        .first()
        .map(|(_, nodes, _)| nodes.len())
        .ok_or(TopologyConfigError::NoBlocks)?;

    let mut midplanes = Vec::new();
    for (name, nodes, coords) in members {
        if nodes.len() % base_size != 0 {
            return Err(TopologyConfigError::BlockSizeNotMultiple {
                block: name,
                nodes: nodes.len(),
                base: base_size,
            });
        }
        let parts = nodes.len() / base_size;
        for (part, chunk) in nodes.chunks(base_size).enumerate() {
            let name = if parts == 1 {
                name.clone()
            } else {
                format!("{name}.{part}")
            };
            let coords: Coords = match coords {
                Some(coords) => {
                    let mut c: Coords = coords.iter().copied().collect();
                    if let Some(first) = c.first_mut() {
                        *first += part as u16;
                    }
                    c
                }
                None => Coords::new(),
            };
            midplanes.push(Midplane {
                name,
                coords,
                nodes: chunk.to_vec(),
            });
        }
    }

    let dims = if config.dims.is_empty() {
        for (index, midplane) in midplanes.iter_mut().enumerate() {
            midplane.coords = smallvec![index as u16];
        }
        Dims::new(&[midplanes.len() as u16])
    } else {
        let dims = Dims::new(&config.dims);
        let mut seen: Map<Coords, usize> = Map::default();
        for (index, midplane) in midplanes.iter().enumerate() {
            if midplane.coords.is_empty() {
                return Err(TopologyConfigError::MissingCoords(midplane.name.clone()));
            }
            if !dims.contains(&midplane.coords) {
                return Err(TopologyConfigError::BadCoords {
                    block: midplane.name.clone(),
                    coords: format_coords(&midplane.coords),
                });
            }
            if let Some(other) = seen.insert(midplane.coords.clone(), index) {
                return Err(TopologyConfigError::DuplicateCoords(
                    midplanes[other].name.clone(),
                    midplane.name.clone(),
                ));
            }
        }
        dims
    };

    if config.ionodes_per_midplane != 0 && !config.ionodes_per_midplane.is_power_of_two() {
        return Err(TopologyConfigError::InvalidIonodeCount(
            config.ionodes_per_midplane,
        ));
    }

    Ok(MidplaneLayout {
        dims,
        base_size,
        midplanes,
    })
}

/// Parses the allowed block sizes (node counts) into aggregation levels.
///
/// Level 0 is always allowed. Without a series every level up to
/// `midplane_count` is allowed.
pub(crate) fn parse_block_sizes(
    series: Option<&str>,
    base_size: usize,
    midplane_count: usize,
) -> Result<Vec<u32>, TopologyConfigError> {
    let mut levels = vec![0];
    let Some(series) = series else {
        let mut level = 1;
        while level <= MAX_BLOCK_LEVEL && (1usize << level) <= midplane_count {
            levels.push(level);
            level += 1;
        }
        return Ok(levels);
    };
    let max = base_size << MAX_BLOCK_LEVEL;
    for token in series.split(',') {
        let size: usize = token
            .trim()
            .parse()
            .map_err(|_| TopologyConfigError::InvalidBlockSizes(series.to_string()))?;
        if size > max {
            return Err(TopologyConfigError::SizeTooLarge { size, max });
        }
        if size == 0 || size % base_size != 0 || !(size / base_size).is_power_of_two() {
            return Err(TopologyConfigError::SizeNotPowerOfTwo {
                size,
                base: base_size,
            });
        }
        let level = (size / base_size).trailing_zeros();
        if !levels.contains(&level) {
            levels.push(level);
        }
    }
    levels.sort_unstable();
    Ok(levels)
}
