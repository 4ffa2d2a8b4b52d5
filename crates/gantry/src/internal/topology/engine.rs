use std::sync::Mutex;

use smallvec::SmallVec;

use crate::internal::common::Map;
use crate::internal::common::bitmap::Bitmap;
use crate::internal::common::hostlist::compress_hostlist;
use crate::internal::common::ids::{NodeIndex, StepKey};
use crate::internal::common::sync::lock;
use crate::internal::interconnect::BlockContext;
use crate::internal::inventory::{Coords, NodeInventory};
use crate::internal::server::config::TopologyConfig;
use crate::internal::topology::aggregate::{build_blocks, covering_blocks};
use crate::internal::topology::block::{Block, BlockRequest, BlockState, Lease};
use crate::internal::topology::config::{load_midplanes, parse_block_sizes};
use crate::internal::topology::geometry::{BoxShape, Dims};
use crate::internal::topology::hardware::{BlockHardware, HardwareReservation};
use crate::internal::topology::wiring::{Wiring, compute_wiring, resolve_connection};
use crate::internal::topology::{BlockError, ConnectionType, TopologyConfigError};

pub use crate::internal::topology::config::Midplane;

/// Allocatable blocks of a torus-connected cluster and their reservations.
///
/// Free blocks are considered in ascending level, then ascending first
/// midplane, and the first one that fits is chosen.
pub struct BlockEngine {
    dims: Dims,
    base_size: usize,
    ionodes_per_midplane: u32,
    levels: Vec<u32>,
    midplanes: Vec<Midplane>,
    blocks: Vec<Block>,
    // Midplane and position inside it, per inventory node
    node_slots: Vec<Option<(usize, u16)>>,
    // Reservation id -> block name
    reservations: Map<String, String>,
}

impl BlockEngine {
    /// Builds the engine and tags the block members in the inventory.
    ///
    /// Also returns the topology-managed nodes that are not part of any block.
    pub fn from_config(
        config: &TopologyConfig,
        inventory: &mut NodeInventory,
    ) -> crate::Result<(Self, Vec<String>)> {
        let layout = load_midplanes(config, inventory)?;
        let levels = parse_block_sizes(
            config.block_sizes.as_deref(),
            layout.base_size,
            layout.midplanes.len(),
        )?;
        let blocks = build_blocks(&layout.midplanes, &levels, inventory.node_count())?;

        let mut node_slots = vec![None; inventory.node_count()];
        for (mp_index, midplane) in layout.midplanes.iter().enumerate() {
            for (position, node) in midplane.nodes.iter().enumerate() {
                node_slots[*node] = Some((mp_index, position as u16));
                let mut coords: Coords = midplane.coords.clone();
                coords.push(position as u16);
                inventory.set_topology(*node, coords);
            }
        }

        let unblocked: Vec<String> = match &config.managed_nodes {
            Some(expr) => {
                let managed = inventory
                    .name2bitmap(expr)
                    .map_err(|e| TopologyConfigError::InvalidManagedNodes(e.to_string()))?;
                managed
                    .iter()
                    .filter(|index| node_slots[*index].is_none())
                    .map(|index| inventory.node(index).name().to_string())
                    .collect()
            }
            None => Vec::new(),
        };
        if !unblocked.is_empty() {
            log::warn!(
                "Topology-managed nodes are not part of any block: {}",
                compress_hostlist(&unblocked)
            );
        }

        log::info!(
            "Topology: {} midplanes of {} nodes, grid {}, {} blocks",
            layout.midplanes.len(),
            layout.base_size,
            layout.dims,
            blocks.len()
        );
        let engine = BlockEngine {
            dims: layout.dims,
            base_size: layout.base_size,
            ionodes_per_midplane: config.ionodes_per_midplane,
            levels,
            midplanes: layout.midplanes,
            blocks,
            node_slots,
            reservations: Default::default(),
        };
        Ok((engine, unblocked))
    }

    pub fn dims(&self) -> &Dims {
        &self.dims
    }

    pub fn base_size(&self) -> usize {
        self.base_size
    }

    pub fn ionodes_per_midplane(&self) -> u32 {
        self.ionodes_per_midplane
    }

    pub fn levels(&self) -> &[u32] {
        &self.levels
    }

    pub fn midplanes(&self) -> &[Midplane] {
        &self.midplanes
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn find_block(&self, name: &str) -> Option<&Block> {
        self.blocks.iter().find(|b| b.name == name)
    }

    /// Configured (non-small) blocks of the given level.
    pub fn blocks_at_level(&self, level: u32) -> impl Iterator<Item = &Block> {
        self.blocks
            .iter()
            .filter(move |b| !b.is_small() && b.level == level)
    }

    /// Number of configured blocks above level 0.
    pub fn aggregated_count(&self) -> usize {
        self.blocks
            .iter()
            .filter(|b| !b.is_small() && b.level > 0)
            .count()
    }

    /// Blocks that partition all midplanes using blocks of at most `level`.
    pub fn covering_blocks(&self, level: u32) -> Vec<&Block> {
        covering_blocks(&self.blocks, &self.levels, self.midplanes.len(), level)
            .into_iter()
            .map(|index| &self.blocks[index])
            .collect()
    }

    /// Sum of `2^level` over [`BlockEngine::covering_blocks`]; always the
    /// number of midplanes.
    pub fn level_coverage(&self, level: u32) -> usize {
        self.covering_blocks(level)
            .iter()
            .map(|b| 1usize << b.level)
            .sum()
    }

    pub fn midplane_of(&self, node: NodeIndex) -> Option<usize> {
        self.node_slots.get(node).copied().flatten().map(|(mp, _)| mp)
    }

    /// Union of the ionodes held by small blocks on `midplane`.
    pub fn ionodes_in_use(&self, midplane: usize) -> Bitmap {
        let mut used = Bitmap::new(self.ionodes_per_midplane as usize);
        for block in &self.blocks {
            if let Some(ionodes) = &block.ionodes {
                if block.first_midplane == midplane {
                    used.or_assign(ionodes);
                }
            }
        }
        used
    }

    /// Active reservations as (reservation id, block name, owner).
    pub fn reservations(&self) -> Vec<(String, String, StepKey)> {
        let mut result: Vec<_> = self
            .blocks
            .iter()
            .filter_map(|b| match &b.state {
                BlockState::Active {
                    lease,
                    reservation_id,
                } => Some((reservation_id.clone(), b.name.clone(), lease.owner)),
                _ => None,
            })
            .collect();
        result.sort();
        result
    }

    fn ionode_of(&self, position: u16) -> usize {
        position as usize * self.ionodes_per_midplane as usize / self.base_size
    }

    /// Translates the nodes of a step into a block request.
    ///
    /// Returns `None` when no node of the step belongs to the topology.
    /// Nodes covering only part of a single midplane make a small request
    /// when ionodes are configured.
    pub fn request_for_nodes(
        &self,
        nodes: &Bitmap,
        connection: ConnectionType,
    ) -> Result<Option<BlockRequest>, BlockError> {
        let mut required = Bitmap::new(self.midplanes.len());
        let mut positions = Vec::new();
        for index in nodes.iter() {
            if let Some((midplane, position)) = self.node_slots.get(index).copied().flatten() {
                required.set(midplane);
                positions.push(position);
            }
        }
        let Some(midplane) = required.first_set() else {
            return Ok(None);
        };
        let single = required.count() == 1;
        let partial = single && positions.len() < self.base_size;
        if connection == ConnectionType::Small || (partial && self.ionodes_per_midplane > 0) {
            if !single {
                return Err(BlockError::InvalidRequest(
                    "a small block must fit into one midplane".to_string(),
                ));
            }
            if self.ionodes_per_midplane == 0 {
                return Err(BlockError::InvalidRequest(
                    "small blocks are not configured".to_string(),
                ));
            }
            let mut ionodes = Bitmap::new(self.ionodes_per_midplane as usize);
            for position in positions {
                ionodes.set(self.ionode_of(position));
            }
            return Ok(Some(BlockRequest::Small { midplane, ionodes }));
        }
        Ok(Some(BlockRequest::Midplanes {
            required,
            geometry: None,
            connection,
            rotate: true,
        }))
    }

    fn midplanes_busy(&self, midplanes: &Bitmap) -> bool {
        self.blocks
            .iter()
            .any(|b| !b.is_free() && b.midplanes.intersects(midplanes))
    }

    fn wiring_conflicts(&self, wiring: &Wiring) -> bool {
        self.blocks
            .iter()
            .filter_map(|b| b.state.lease())
            .any(|lease| lease.wiring.conflicts_with(wiring))
    }

    fn find_candidate(
        &self,
        required: &Bitmap,
        geometry: Option<&Coords>,
        connection: ConnectionType,
        rotate: bool,
    ) -> Option<(usize, SmallVec<[ConnectionType; 5]>, Wiring)> {
        for (index, block) in self.blocks.iter().enumerate() {
            if block.is_small() || !block.is_free() || !required.is_subset_of(&block.midplanes) {
                continue;
            }
            if let Some(geometry) = geometry {
                if !block.shape.can_host(geometry, rotate) {
                    continue;
                }
            }
            if self.midplanes_busy(&block.midplanes) {
                continue;
            }
            let conn = resolve_connection(connection, &block.shape);
            let wiring = compute_wiring(&self.dims, &block.shape, &conn);
            if self.wiring_conflicts(&wiring) {
                continue;
            }
            return Some((index, conn, wiring));
        }
        None
    }

    /// Smallest aligned power-of-two ionode range containing `ionodes`.
    fn align_fragment(&self, ionodes: &Bitmap) -> Option<Bitmap> {
        let low = ionodes.first_set()?;
        let high = ionodes.last_set()?;
        let total = self.ionodes_per_midplane as usize;
        let mut size = (high - low + 1).next_power_of_two();
        loop {
            let start = low / size * size;
            if start + size > high {
                let mut fragment = Bitmap::new(total);
                fragment.set_range(start, (start + size).min(total));
                return Some(fragment);
            }
            size *= 2;
        }
    }

    /// Chooses a block for `request` and marks it as being reserved.
    ///
    /// The returned reservation has to be passed to the hardware and then
    /// either committed or aborted.
    pub fn select(
        &mut self,
        request: &BlockRequest,
        owner: StepKey,
    ) -> Result<HardwareReservation, BlockError> {
        match request {
            BlockRequest::Midplanes {
                required,
                geometry,
                connection,
                rotate,
            } => {
                if required.size() != self.midplanes.len() {
                    return Err(BlockError::InvalidRequest(format!(
                        "midplane bitmap of size {}, expected {}",
                        required.size(),
                        self.midplanes.len()
                    )));
                }
                if *connection == ConnectionType::Small {
                    return Err(BlockError::InvalidRequest(
                        "small connection requires an ionode request".to_string(),
                    ));
                }
                let (index, connection, wiring) = self
                    .find_candidate(required, geometry.as_ref(), *connection, *rotate)
                    .ok_or(BlockError::NoBlockAvailable)?;
                Ok(self.lease_block(
                    index,
                    Lease {
                        owner,
                        connection,
                        wiring,
                    },
                ))
            }
            BlockRequest::Small { midplane, ionodes } => {
                let midplane = *midplane;
                if midplane >= self.midplanes.len()
                    || ionodes.size() != self.ionodes_per_midplane as usize
                {
                    return Err(BlockError::InvalidRequest(format!(
                        "invalid small block on midplane {midplane}"
                    )));
                }
                let fragment = self.align_fragment(ionodes).ok_or_else(|| {
                    BlockError::InvalidRequest("empty ionode request".to_string())
                })?;
                if fragment.count() == fragment.size() {
                    let mut required = Bitmap::new(self.midplanes.len());
                    required.set(midplane);
                    return self.select(
                        &BlockRequest::Midplanes {
                            required,
                            geometry: None,
                            connection: ConnectionType::Mesh,
                            rotate: false,
                        },
                        owner,
                    );
                }
                let busy = self.blocks.iter().any(|b| {
                    !b.is_free()
                        && b.midplanes.test(midplane)
                        && b.ionodes.as_ref().is_none_or(|used| used.intersects(&fragment))
                });
                if busy {
                    return Err(BlockError::NoBlockAvailable);
                }
                let block = self.small_block(midplane, fragment);
                let ndims = self.dims.ndims();
                self.blocks.push(block);
                Ok(self.lease_block(
                    self.blocks.len() - 1,
                    Lease {
                        owner,
                        connection: std::iter::repeat_n(ConnectionType::Small, ndims).collect(),
                        wiring: Wiring::default(),
                    },
                ))
            }
        }
    }

    fn small_block(&self, midplane: usize, fragment: Bitmap) -> Block {
        let mp = &self.midplanes[midplane];
        let mut midplanes = Bitmap::new(self.midplanes.len());
        midplanes.set(midplane);
        let nodes = Bitmap::from_indices(
            self.node_slots.len(),
            mp.nodes
                .iter()
                .enumerate()
                .filter(|(position, _)| fragment.test(self.ionode_of(*position as u16)))
                .map(|(_, node)| *node),
        );
        Block {
            name: format!("{}-io{}", mp.name, fragment.to_range_expr()),
            level: 0,
            midplanes,
            first_midplane: midplane,
            shape: BoxShape {
                start: mp.coords.clone(),
                size: std::iter::repeat_n(1, mp.coords.len()).collect(),
            },
            nodes,
            ionodes: Some(fragment),
            state: BlockState::Free,
        }
    }

    fn lease_block(&mut self, index: usize, lease: Lease) -> HardwareReservation {
        let block = &mut self.blocks[index];
        let reservation = HardwareReservation {
            block_name: block.name.clone(),
            owner: lease.owner,
            midplanes: block
                .midplanes
                .iter()
                .map(|m| self.midplanes[m].name.clone())
                .collect(),
            ionodes: block.ionodes.as_ref().map(|b| b.to_range_expr()),
            connection: lease.connection.clone(),
            wiring: lease.wiring.clone(),
        };
        log::debug!("Block {} selected for step {}", block.name, lease.owner);
        block.state = BlockState::Reserving(lease);
        reservation
    }

    fn block_mut(&mut self, name: &str) -> Result<&mut Block, BlockError> {
        self.blocks
            .iter_mut()
            .find(|b| b.name == name)
            .ok_or_else(|| BlockError::UnknownBlock(name.to_string()))
    }

    /// Activates a block selected by [`BlockEngine::select`].
    pub fn commit(&mut self, block_name: &str, reservation_id: &str) -> Result<(), BlockError> {
        let block = self.block_mut(block_name)?;
        let BlockState::Reserving(lease) = std::mem::replace(&mut block.state, BlockState::Free)
        else {
            return Err(BlockError::BlockBusy(block_name.to_string()));
        };
        block.state = BlockState::Active {
            lease,
            reservation_id: reservation_id.to_string(),
        };
        self.reservations
            .insert(reservation_id.to_string(), block_name.to_string());
        Ok(())
    }

    /// Returns a selected block to the free pool after a failed reservation.
    pub fn abort(&mut self, block_name: &str) {
        if let Ok(block) = self.block_mut(block_name) {
            if matches!(block.state, BlockState::Reserving(_)) {
                block.state = BlockState::Free;
            }
        }
        self.blocks.retain(|b| !b.is_small() || !b.is_free());
    }

    /// Starts the release of a reservation. Returns `true` if the hardware
    /// has to be told; unknown or already released ids return `false`.
    pub fn begin_release(&mut self, reservation_id: &str) -> bool {
        let Some(name) = self.reservations.get(reservation_id).cloned() else {
            return false;
        };
        let Ok(block) = self.block_mut(&name) else {
            return false;
        };
        match std::mem::replace(&mut block.state, BlockState::Free) {
            BlockState::Active {
                lease,
                reservation_id,
            } => {
                log::debug!("Block {name} ({reservation_id}) is being torn down");
                block.state = BlockState::TeardownPending {
                    lease,
                    reservation_id,
                };
                true
            }
            state => {
                block.state = state;
                false
            }
        }
    }

    pub fn pending_teardowns(&self) -> Vec<String> {
        self.blocks
            .iter()
            .filter_map(|b| match &b.state {
                BlockState::TeardownPending { reservation_id, .. } => Some(reservation_id.clone()),
                _ => None,
            })
            .collect()
    }

    /// Frees a block whose teardown the hardware confirmed.
    pub fn confirm_teardown(&mut self, reservation_id: &str) -> bool {
        let Some(block) = self.blocks.iter_mut().find(|b| {
            matches!(&b.state, BlockState::TeardownPending { reservation_id: id, .. } if id == reservation_id)
        }) else {
            return false;
        };
        block.state = BlockState::Free;
        log::debug!("Block {} is free again", block.name);
        self.reservations.remove(reservation_id);
        self.blocks.retain(|b| !b.is_small() || !b.is_free());
        true
    }

    /// Marks a configured block as owned by a step that survived a restart.
    pub fn recover(
        &mut self,
        block_name: &str,
        reservation_id: &str,
        owner: StepKey,
        connection: ConnectionType,
    ) -> Result<(), BlockError> {
        let index = self
            .blocks
            .iter()
            .position(|b| b.name == block_name && !b.is_small())
            .ok_or_else(|| BlockError::UnknownBlock(block_name.to_string()))?;
        let block = &self.blocks[index];
        if !block.is_free() || self.midplanes_busy(&block.midplanes) {
            return Err(BlockError::BlockBusy(block_name.to_string()));
        }
        let conn = resolve_connection(connection, &block.shape);
        let wiring = compute_wiring(&self.dims, &block.shape, &conn);
        if self.wiring_conflicts(&wiring) {
            return Err(BlockError::BlockBusy(block_name.to_string()));
        }
        self.blocks[index].state = BlockState::Active {
            lease: Lease {
                owner,
                connection: conn,
                wiring,
            },
            reservation_id: reservation_id.to_string(),
        };
        self.reservations
            .insert(reservation_id.to_string(), block_name.to_string());
        log::info!("Recovered reservation {reservation_id} of block {block_name} for step {owner}");
        Ok(())
    }
}

/// Reserves a block for `owner`. The engine lock is not held while the
/// hardware is called.
pub fn reserve_block(
    engine: &Mutex<BlockEngine>,
    hardware: &dyn BlockHardware,
    request: &BlockRequest,
    owner: StepKey,
) -> Result<BlockContext, BlockError> {
    let reservation = lock(engine).select(request, owner)?;
    let reservation_id = match hardware.reserve(&reservation) {
        Ok(id) => id,
        Err(error) => {
            log::error!(
                "Reserving block {} for step {owner} failed: {error}",
                reservation.block_name
            );
            lock(engine).abort(&reservation.block_name);
            return Err(BlockError::Hardware(error.to_string()));
        }
    };
    if let Err(error) = lock(engine).commit(&reservation.block_name, &reservation_id) {
        if let Err(e) = hardware.release(&reservation_id) {
            log::warn!("Releasing orphaned reservation {reservation_id} failed: {e}");
        }
        return Err(error);
    }
    log::info!(
        "Block {} reserved as {reservation_id} for step {owner}",
        reservation.block_name
    );
    Ok(BlockContext {
        reservation_id,
        block_name: reservation.block_name,
    })
}

/// Releases a reservation; releasing an unknown or released id succeeds.
pub fn release_block(
    engine: &Mutex<BlockEngine>,
    hardware: &dyn BlockHardware,
    reservation_id: &str,
) -> Result<(), BlockError> {
    if !lock(engine).begin_release(reservation_id) {
        log::debug!("Reservation {reservation_id} is not active, nothing to release");
        return Ok(());
    }
    hardware
        .release(reservation_id)
        .map_err(|e| BlockError::Hardware(e.to_string()))
}

/// Frees the blocks whose teardown the hardware confirmed; returns their number.
pub fn poll_teardowns(engine: &Mutex<BlockEngine>, hardware: &dyn BlockHardware) -> usize {
    let pending = lock(engine).pending_teardowns();
    let mut freed = 0;
    for reservation_id in pending {
        match hardware.confirm_free(&reservation_id) {
            Ok(true) => {
                if lock(engine).confirm_teardown(&reservation_id) {
                    freed += 1;
                }
            }
            Ok(false) => {}
            Err(error) => log::warn!("Polling teardown of {reservation_id} failed: {error}"),
        }
    }
    freed
}
