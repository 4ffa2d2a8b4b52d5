use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::internal::inventory::Coords;
use crate::internal::topology::ConnectionType;
use crate::internal::topology::geometry::{BoxShape, Dims};

/// Port of a dimension switch.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Port {
    /// Traffic from the switch into its midplane.
    In = 0,
    /// Traffic from the midplane into its switch.
    Out = 1,
    /// Cable towards the next midplane of the dimension.
    Plus = 2,
    /// Cable from the previous midplane of the dimension.
    Minus = 3,
}

/// The switch of the midplane at grid `position` serving dimension `dim`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SwitchId {
    pub position: usize,
    pub dim: u8,
}

pub type Connection = (Port, Port);

/// Per-switch connection lists used to configure the interconnect.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wiring {
    switches: BTreeMap<SwitchId, SmallVec<[Connection; 2]>>,
}

impl Wiring {
    /// Records a connection; repeated connections are stored once.
    pub fn add(&mut self, switch: SwitchId, from: Port, to: Port) {
        let connections = self.switches.entry(switch).or_default();
        if !connections.contains(&(from, to)) {
            connections.push((from, to));
        }
    }

    pub fn connections(&self, switch: SwitchId) -> &[Connection] {
        self.switches
            .get(&switch)
            .map(|c| c.as_slice())
            .unwrap_or_default()
    }

    pub fn switches(&self) -> impl Iterator<Item = (&SwitchId, &[Connection])> {
        self.switches.iter().map(|(id, c)| (id, c.as_slice()))
    }

    pub fn switch_count(&self) -> usize {
        self.switches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.switches.is_empty()
    }

    fn uses_port(&self, switch: SwitchId, port: Port) -> bool {
        self.connections(switch)
            .iter()
            .any(|(from, to)| *from == port || *to == port)
    }

    /// Two wirings conflict when they share a port of the same switch.
    pub fn conflicts_with(&self, other: &Wiring) -> bool {
        self.switches.iter().any(|(switch, connections)| {
            connections
                .iter()
                .any(|(from, to)| other.uses_port(*switch, *from) || other.uses_port(*switch, *to))
        })
    }
}

/// Connection type of each dimension of `shape` for a requested connection.
///
/// Dimensions of size one are always wrapped on themselves.
pub fn resolve_connection(
    requested: ConnectionType,
    shape: &BoxShape,
) -> SmallVec<[ConnectionType; 5]> {
    shape
        .size
        .iter()
        .map(|size| match requested {
            ConnectionType::Torus => ConnectionType::Torus,
            ConnectionType::Mesh if *size == 1 => ConnectionType::Torus,
            ConnectionType::Mesh => ConnectionType::Mesh,
            ConnectionType::Small => ConnectionType::Small,
        })
        .collect()
}

/// Lays the switch connections that link the midplanes of `shape`.
///
/// Along each dimension, every midplane but the last sends to the next one.
/// A torus dimension closes the ring from the last midplane through the
/// switches of the midplanes outside the box back to the first one.
pub fn compute_wiring(dims: &Dims, shape: &BoxShape, connection: &[ConnectionType]) -> Wiring {
    let mut wiring = Wiring::default();
    for (dim, conn) in connection.iter().enumerate() {
        if *conn == ConnectionType::Small {
            continue;
        }
        let extent = shape.size[dim];
        let full = dims.size(dim);
        let switch = |coords: &Coords, value: u16| {
            let mut c = coords.clone();
            c[dim] = value;
            SwitchId {
                position: dims.position(&c),
                dim: dim as u8,
            }
        };
        for line in shape.line_starts(dim) {
            let first = line[dim];
            if extent == 1 {
                wiring.add(switch(&line, first), Port::Out, Port::In);
                continue;
            }
            let last = first + extent - 1;
            for value in first..last {
                wiring.add(switch(&line, value), Port::Out, Port::Plus);
                wiring.add(switch(&line, value + 1), Port::Minus, Port::In);
            }
            if *conn == ConnectionType::Torus {
                wiring.add(switch(&line, last), Port::Out, Port::Plus);
                let mut value = (last + 1) % full;
                while value != first {
                    wiring.add(switch(&line, value), Port::Minus, Port::Plus);
                    value = (value + 1) % full;
                }
                wiring.add(switch(&line, first), Port::Minus, Port::In);
            }
        }
    }
    wiring
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    fn line(start: u16, size: u16) -> BoxShape {
        BoxShape {
            start: smallvec![start],
            size: smallvec![size],
        }
    }

    fn sw(position: usize) -> SwitchId {
        SwitchId { position, dim: 0 }
    }

    #[test]
    fn test_mesh_wiring() {
        let dims = Dims::new(&[4]);
        let shape = line(0, 2);
        let wiring = compute_wiring(&dims, &shape, &resolve_connection(ConnectionType::Mesh, &shape));
        assert_eq!(wiring.connections(sw(0)), &[(Port::Out, Port::Plus)]);
        assert_eq!(wiring.connections(sw(1)), &[(Port::Minus, Port::In)]);
        assert_eq!(wiring.switch_count(), 2);
    }

    #[test]
    fn test_single_midplane_loops_back() {
        let dims = Dims::new(&[4]);
        let shape = line(2, 1);
        let conn = resolve_connection(ConnectionType::Mesh, &shape);
        assert_eq!(conn.as_slice(), &[ConnectionType::Torus]);
        let wiring = compute_wiring(&dims, &shape, &conn);
        assert_eq!(wiring.connections(sw(2)), &[(Port::Out, Port::In)]);
    }

    #[test]
    fn test_torus_passthrough() {
        let dims = Dims::new(&[4]);
        let shape = line(0, 2);
        let wiring = compute_wiring(&dims, &shape, &[ConnectionType::Torus]);
        assert_eq!(
            wiring.connections(sw(0)),
            &[(Port::Out, Port::Plus), (Port::Minus, Port::In)]
        );
        assert_eq!(
            wiring.connections(sw(1)),
            &[(Port::Minus, Port::In), (Port::Out, Port::Plus)]
        );
        assert_eq!(wiring.connections(sw(2)), &[(Port::Minus, Port::Plus)]);
        assert_eq!(wiring.connections(sw(3)), &[(Port::Minus, Port::Plus)]);

        // A single midplane inside the passthrough uses different ports
        let single = line(2, 1);
        let other = compute_wiring(&dims, &single, &[ConnectionType::Torus]);
        assert!(!wiring.conflicts_with(&other));

        let pair = line(2, 2);
        let mesh = compute_wiring(&dims, &pair, &[ConnectionType::Mesh]);
        assert!(wiring.conflicts_with(&mesh));
        assert!(mesh.conflicts_with(&wiring));
    }

    #[test]
    fn test_full_ring_torus() {
        let dims = Dims::new(&[3]);
        let shape = line(0, 3);
        let wiring = compute_wiring(&dims, &shape, &[ConnectionType::Torus]);
        assert_eq!(wiring.switch_count(), 3);
        assert_eq!(
            wiring.connections(sw(2)),
            &[(Port::Minus, Port::In), (Port::Out, Port::Plus)]
        );
        assert_eq!(
            wiring.connections(sw(0)),
            &[(Port::Out, Port::Plus), (Port::Minus, Port::In)]
        );
    }

    #[test]
    fn test_add_is_idempotent() {
        let mut wiring = Wiring::default();
        wiring.add(sw(1), Port::Out, Port::Plus);
        wiring.add(sw(1), Port::Out, Port::Plus);
        assert_eq!(wiring.connections(sw(1)).len(), 1);
        assert!(wiring.connections(sw(5)).is_empty());
    }

    #[test]
    fn test_two_dimensional_box() {
        let dims = Dims::new(&[2, 2]);
        let shape = BoxShape {
            start: smallvec![0, 0],
            size: smallvec![2, 2],
        };
        let wiring = compute_wiring(&dims, &shape, &[ConnectionType::Mesh, ConnectionType::Mesh]);
        // Two lines per dimension, two switches per line
        assert_eq!(wiring.switch_count(), 8);
        let x = SwitchId { position: 2, dim: 0 };
        assert_eq!(wiring.connections(x), &[(Port::Out, Port::Plus)]);
        let y = SwitchId { position: 2, dim: 1 };
        assert_eq!(wiring.connections(y), &[(Port::Minus, Port::In)]);
    }
}
