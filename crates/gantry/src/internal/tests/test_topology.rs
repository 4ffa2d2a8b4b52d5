use std::sync::Mutex;

use crate::internal::common::bitmap::Bitmap;
use crate::internal::common::error::GantryError;
use crate::internal::common::ids::{JobId, StepId, StepKey};
use crate::internal::inventory::NodeInventory;
use crate::internal::server::config::{BlockConfig, NodeConfig, TopologyConfig};
use crate::internal::tests::utils::config::{linear_topology, node_config};
use crate::internal::topology::{
    Block, BlockEngine, BlockError, BlockHardware, BlockRequest, BlockState, ConnectionType,
    InMemoryHardware, TopologyConfigError, poll_teardowns, release_block, reserve_block,
};

fn owner(step: u32) -> StepKey {
    StepKey::new(JobId::new(1), StepId::new(step))
}

fn engine(
    midplanes: usize,
    base: usize,
    block_sizes: Option<&str>,
) -> (BlockEngine, NodeInventory) {
    let (nodes, topology) = linear_topology(midplanes, base, block_sizes);
    build(&[nodes], &topology).unwrap()
}

fn build(
    nodes: &[NodeConfig],
    topology: &TopologyConfig,
) -> crate::Result<(BlockEngine, NodeInventory)> {
    let mut inventory = NodeInventory::from_config(nodes)?;
    let (engine, _) = BlockEngine::from_config(topology, &mut inventory)?;
    Ok((engine, inventory))
}

fn request(
    engine: &BlockEngine,
    inventory: &NodeInventory,
    nodes: &str,
    connection: ConnectionType,
) -> BlockRequest {
    let bitmap = inventory.name2bitmap(nodes).unwrap();
    engine
        .request_for_nodes(&bitmap, connection)
        .unwrap()
        .unwrap()
}

fn names<'a, I: IntoIterator<Item = &'a Block>>(blocks: I) -> Vec<String> {
    blocks.into_iter().map(|b| b.name().to_string()).collect()
}

#[test]
fn test_aggregation_levels() {
    let (engine, _) = engine(40, 4, Some("4,8,16,32"));
    assert_eq!(engine.levels(), &[0, 1, 2, 3]);
    assert_eq!(engine.base_size(), 4);
    assert_eq!(engine.blocks_at_level(0).count(), 40);
    assert_eq!(engine.blocks_at_level(1).count(), 20);
    assert_eq!(engine.blocks_at_level(2).count(), 10);
    assert_eq!(engine.blocks_at_level(3).count(), 5);
    assert_eq!(engine.aggregated_count(), 35);
    assert_eq!(
        names(engine.blocks_at_level(3).take(2)),
        vec!["mp0-mp7", "mp8-mp15"]
    );
    for level in 0..=3 {
        assert_eq!(engine.level_coverage(level), 40);
    }
    assert_eq!(engine.covering_blocks(3).len(), 5);
}

#[test]
fn test_trailing_midplanes() {
    let (engine, _) = engine(5, 2, None);
    assert_eq!(engine.levels(), &[0, 1, 2]);
    assert_eq!(
        names(engine.blocks_at_level(1)),
        vec!["mp0-mp1", "mp2-mp3"]
    );
    assert_eq!(names(engine.blocks_at_level(2)), vec!["mp0-mp3"]);
    assert_eq!(names(engine.covering_blocks(2)), vec!["mp0-mp3", "mp4"]);
    assert_eq!(engine.level_coverage(2), 5);
    assert_eq!(
        names(engine.covering_blocks(1)),
        vec!["mp0-mp1", "mp2-mp3", "mp4"]
    );
}

#[test]
fn test_smallest_block_is_chosen() {
    let (engine, inventory) = engine(4, 4, None);
    let hardware = InMemoryHardware::new();
    let engine = Mutex::new(engine);

    let single = request(&engine.lock().unwrap(), &inventory, "n[4-7]", ConnectionType::Mesh);
    let context = reserve_block(&engine, &hardware, &single, owner(0)).unwrap();
    assert_eq!(context.block_name, "mp1");
    assert_eq!(context.reservation_id, "resv_0");

    let pair = request(&engine.lock().unwrap(), &inventory, "n[0-7]", ConnectionType::Mesh);
    assert_eq!(
        reserve_block(&engine, &hardware, &pair, owner(1)).map(|c| c.block_name),
        Err(BlockError::NoBlockAvailable)
    );

    let other = request(&engine.lock().unwrap(), &inventory, "n[8-15]", ConnectionType::Mesh);
    let context = reserve_block(&engine, &hardware, &other, owner(2)).unwrap();
    assert_eq!(context.block_name, "mp2-mp3");

    let engine = engine.lock().unwrap();
    assert_eq!(
        engine.reservations(),
        vec![
            ("resv_0".to_string(), "mp1".to_string(), owner(0)),
            ("resv_1".to_string(), "mp2-mp3".to_string(), owner(2)),
        ]
    );
    assert_eq!(engine.find_block("mp2-mp3").unwrap().owner(), Some(owner(2)));
}

#[test]
fn test_release_waits_for_teardown() {
    let (engine, inventory) = engine(2, 4, None);
    let hardware = InMemoryHardware::with_confirm_delay(2);
    let engine = Mutex::new(engine);
    let whole = request(&engine.lock().unwrap(), &inventory, "n[0-7]", ConnectionType::Mesh);
    let context = reserve_block(&engine, &hardware, &whole, owner(0)).unwrap();

    release_block(&engine, &hardware, &context.reservation_id).unwrap();
    assert!(matches!(
        engine.lock().unwrap().find_block("mp0-mp1").unwrap().state(),
        BlockState::TeardownPending { .. }
    ));
    // The block stays unusable until the teardown is confirmed
    assert_eq!(
        reserve_block(&engine, &hardware, &whole, owner(1)).map(|c| c.block_name),
        Err(BlockError::NoBlockAvailable)
    );

    assert_eq!(poll_teardowns(&engine, &hardware), 0);
    assert_eq!(poll_teardowns(&engine, &hardware), 0);
    assert_eq!(poll_teardowns(&engine, &hardware), 1);
    assert!(engine.lock().unwrap().find_block("mp0-mp1").unwrap().is_free());
    assert!(engine.lock().unwrap().reservations().is_empty());

    // Releasing twice is harmless
    release_block(&engine, &hardware, &context.reservation_id).unwrap();
    release_block(&engine, &hardware, "resv_99").unwrap();

    let context = reserve_block(&engine, &hardware, &whole, owner(1)).unwrap();
    assert_eq!(context.reservation_id, "resv_1");
}

#[test]
fn test_failed_reservation_frees_block() {
    let (engine, inventory) = engine(2, 4, None);
    let hardware = InMemoryHardware::new();
    hardware.set_failing(true);
    let engine = Mutex::new(engine);
    let single = request(&engine.lock().unwrap(), &inventory, "n[0-3]", ConnectionType::Mesh);
    assert!(matches!(
        reserve_block(&engine, &hardware, &single, owner(0)),
        Err(BlockError::Hardware(_))
    ));
    assert!(engine.lock().unwrap().blocks().iter().all(|b| b.is_free()));
}

#[test]
fn test_torus_passthrough_conflicts() {
    let (engine, inventory) = engine(4, 4, None);
    let hardware = InMemoryHardware::new();
    let engine = Mutex::new(engine);

    let torus = request(&engine.lock().unwrap(), &inventory, "n[0-7]", ConnectionType::Torus);
    let context = reserve_block(&engine, &hardware, &torus, owner(0)).unwrap();
    assert_eq!(context.block_name, "mp0-mp1");

    // The ring of mp0-mp1 passes through the switches of mp2 and mp3
    let mesh_pair = request(&engine.lock().unwrap(), &inventory, "n[8-15]", ConnectionType::Mesh);
    assert_eq!(
        reserve_block(&engine, &hardware, &mesh_pair, owner(1)).map(|c| c.block_name),
        Err(BlockError::NoBlockAvailable)
    );

    let single = request(&engine.lock().unwrap(), &inventory, "n[8-11]", ConnectionType::Mesh);
    let context = reserve_block(&engine, &hardware, &single, owner(2)).unwrap();
    assert_eq!(context.block_name, "mp2");
}

#[test]
fn test_small_blocks() {
    let (nodes, mut topology) = linear_topology(2, 4, None);
    topology.ionodes_per_midplane = 4;
    let (engine, inventory) = build(&[nodes], &topology).unwrap();
    let configured = engine.blocks().len();
    let hardware = InMemoryHardware::new();
    let engine = Mutex::new(engine);

    let first = request(&engine.lock().unwrap(), &inventory, "n1", ConnectionType::Mesh);
    assert!(matches!(first, BlockRequest::Small { midplane: 0, .. }));
    let first = reserve_block(&engine, &hardware, &first, owner(0)).unwrap();
    {
        let engine = engine.lock().unwrap();
        let block = engine.find_block(&first.block_name).unwrap();
        assert!(block.is_small());
        assert_eq!(
            block.nodes().iter().collect::<Vec<_>>(),
            vec![inventory.node_index("n1").unwrap()]
        );
    }

    // Spanning ionodes 1 and 2 aligns to the whole midplane, which is taken
    let spanning = request(&engine.lock().unwrap(), &inventory, "n[1-2]", ConnectionType::Mesh);
    assert_eq!(
        reserve_block(&engine, &hardware, &spanning, owner(1)).map(|c| c.block_name),
        Err(BlockError::NoBlockAvailable)
    );

    let second = request(&engine.lock().unwrap(), &inventory, "n3", ConnectionType::Mesh);
    let second = reserve_block(&engine, &hardware, &second, owner(2)).unwrap();
    assert_eq!(
        engine.lock().unwrap().ionodes_in_use(0).iter().collect::<Vec<_>>(),
        vec![1, 3]
    );

    let whole = request(&engine.lock().unwrap(), &inventory, "n[4-7]", ConnectionType::Mesh);
    assert_eq!(
        reserve_block(&engine, &hardware, &whole, owner(3))
            .unwrap()
            .block_name,
        "mp1"
    );

    release_block(&engine, &hardware, &first.reservation_id).unwrap();
    release_block(&engine, &hardware, &second.reservation_id).unwrap();
    assert_eq!(poll_teardowns(&engine, &hardware), 2);
    let engine = engine.lock().unwrap();
    assert_eq!(engine.blocks().len(), configured);
    assert!(engine.ionodes_in_use(0).is_clear());
}

#[test]
fn test_small_request_needs_ionodes() {
    let (engine, inventory) = engine(2, 4, None);
    let nodes = inventory.name2bitmap("n1").unwrap();
    assert!(matches!(
        engine.request_for_nodes(&nodes, ConnectionType::Small),
        Err(BlockError::InvalidRequest(_))
    ));
    // Without ionodes a partial midplane takes the whole midplane
    assert!(matches!(
        engine.request_for_nodes(&nodes, ConnectionType::Mesh),
        Ok(Some(BlockRequest::Midplanes { .. }))
    ));
}

#[test]
fn test_recover_reservation() {
    let (mut engine, _) = engine(4, 4, None);
    engine
        .recover("mp0-mp1", "resv_7", owner(3), ConnectionType::Mesh)
        .unwrap();
    assert_eq!(
        engine.recover("mp1", "resv_8", owner(4), ConnectionType::Mesh),
        Err(BlockError::BlockBusy("mp1".to_string()))
    );
    assert_eq!(
        engine.recover("mp9", "resv_8", owner(4), ConnectionType::Mesh),
        Err(BlockError::UnknownBlock("mp9".to_string()))
    );

    let hardware = InMemoryHardware::new();
    hardware.recover(&["resv_7"]);
    let engine = Mutex::new(engine);
    release_block(&engine, &hardware, "resv_7").unwrap();
    assert!(hardware.confirm_free("resv_7").unwrap());
    assert_eq!(poll_teardowns(&engine, &hardware), 1);

    let hardware = InMemoryHardware::new();
    hardware.recover(&["resv_7"]);
    let required = Bitmap::from_indices(4, [0]);
    let reservation = engine
        .lock()
        .unwrap()
        .select(
            &BlockRequest::Midplanes {
                required,
                geometry: None,
                connection: ConnectionType::Mesh,
                rotate: true,
            },
            owner(5),
        )
        .unwrap();
    assert_eq!(reservation.block_name, "mp0");
    assert_eq!(hardware.reserve(&reservation).unwrap(), "resv_8");
}

fn block(name: &str, nodes: &str) -> BlockConfig {
    BlockConfig {
        name: name.to_string(),
        nodes: nodes.to_string(),
        coords: None,
    }
}

#[test]
fn test_invalid_topology() {
    let nodes = [node_config("n[0-15]", 4)];
    let topology = |blocks| TopologyConfig {
        blocks,
        ..Default::default()
    };

    let overlap = build(
        &nodes,
        &topology(vec![block("mp0", "n[0-3]"), block("mp1", "n[3-6]")]),
    );
    assert!(matches!(
        overlap,
        Err(GantryError::TopologyConfigError(
            TopologyConfigError::NodeInTwoBlocks { .. }
        ))
    ));

    let uneven = build(
        &nodes,
        &topology(vec![block("mp0", "n[0-3]"), block("mp1", "n[4-9]")]),
    );
    assert!(matches!(
        uneven,
        Err(GantryError::TopologyConfigError(
            TopologyConfigError::BlockSizeNotMultiple { nodes: 6, base: 4, .. }
        ))
    ));

    assert!(matches!(
        build(&nodes, &topology(Vec::new())),
        Err(GantryError::TopologyConfigError(TopologyConfigError::NoBlocks))
    ));

    let mut bad_ionodes = topology(vec![block("mp0", "n[0-3]")]);
    bad_ionodes.ionodes_per_midplane = 3;
    assert!(matches!(
        build(&nodes, &bad_ionodes),
        Err(GantryError::TopologyConfigError(
            TopologyConfigError::InvalidIonodeCount(3)
        ))
    ));
}

#[test]
fn test_large_blocks_split_into_midplanes() {
    let nodes = [node_config("n[0-15]", 4)];
    let topology = TopologyConfig {
        blocks: vec![block("mp0", "n[0-3]"), block("big", "n[4-11]")],
        managed_nodes: Some("n[0-13]".to_string()),
        ..Default::default()
    };
    let mut inventory = NodeInventory::from_config(&nodes).unwrap();
    let (engine, unblocked) = BlockEngine::from_config(&topology, &mut inventory).unwrap();
    assert_eq!(
        engine
            .midplanes()
            .iter()
            .map(|m| m.name().to_string())
            .collect::<Vec<_>>(),
        vec!["mp0", "big.0", "big.1"]
    );
    assert_eq!(unblocked, vec!["n12".to_string(), "n13".to_string()]);
    assert_eq!(engine.midplane_of(5), Some(1));
    assert_eq!(engine.midplane_of(9), Some(2));
    assert_eq!(engine.midplane_of(12), None);
    assert_eq!(inventory.node(9).coords(), &[2, 1]);
}
