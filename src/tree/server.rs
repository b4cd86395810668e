use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::block::Block;
use crate::config::Config;
use crate::deps::Dependencies;
use crate::error::{Error, Result};
use crate::face::{Axis, Face};
use crate::octant::Octant;
use crate::science::{minmod_slice, Coords, Science};
use crate::tree::{NodeClient, NodeId, NodeInit};

/// Engine-wide immutable context shared by every node: the configuration,
/// the science callbacks, and the root cell size.
///
pub struct Context {
    pub config: Config,
    pub science: Arc<dyn Science>,
    pub dx0: f64,
}

impl Context {
    pub fn new(config: Config, science: Arc<dyn Science>) -> Result<Self> {
        config.validate()?;

        let gnx = config.grid_node_length;
        let bw = science.ghost_zone_width();
        if gnx <= 2 * (bw + 1) {
            return Err(Error::BadConfig(format!(
                "grid_node_length ({}) leaves no room for a ghost width of {} \
                 plus the reconstruction margin",
                gnx, bw
            )));
        }
        if (gnx - 2 * bw) % 2 != 0 {
            return Err(Error::BadConfig(format!(
                "interior extent ({}) must be even to subdivide",
                gnx - 2 * bw
            )));
        }
        let dx0 = science.initial_spacestep(&config);
        Ok(Self {
            config,
            science,
            dx0,
        })
    }

    pub fn gnx(&self) -> usize {
        self.config.grid_node_length
    }

    pub fn bw(&self) -> usize {
        self.science.ghost_zone_width()
    }

    pub fn ns(&self) -> usize {
        self.science.state_size()
    }

    pub fn order(&self) -> usize {
        self.config.runge_kutta_order
    }

    /// Cells per axis in a node's interior.
    pub fn interior(&self) -> usize {
        self.gnx() - 2 * self.bw()
    }
}

/// A finer neighbor subscribed for interpolated ghost data. `face` is the
/// face of the *fine* node that the served slab fills, and `offset` resolves
/// fine destination indexes to this node's source cells.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Nephew {
    pub client: NodeClient,
    pub face: Face,
    pub offset: [i64; 3],
}

pub(crate) struct Topology {
    pub siblings: [NodeClient; 6],
    pub children: [Option<NodeClient>; 8],
    pub nephews: Vec<Nephew>,
    pub marked: u8,
}

pub(crate) struct Grid {
    pub u: Block,
    pub u0: Block,
    pub fx: Block,
    pub fy: Block,
    pub fz: Block,
    pub d: Block,
    pub fo: Vec<f64>,
    pub fo0: Vec<f64>,
    pub dfo: Vec<f64>,
    pub time: f64,
    pub step: u64,
}

/// One grid node of the octree. Identity and geometry are immutable after
/// construction; the topology maps and the bulk state live behind separate
/// locks, and neither lock is ever held across a cross-node operation.
///
pub struct NodeServer {
    id: NodeId,
    level: u64,
    location: [i64; 3],
    dx: f64,
    offset: [i64; 3],
    origin: [f64; 3],
    parent: Option<NodeClient>,
    ctx: Arc<Context>,
    topology: Mutex<Topology>,
    grid: Mutex<Grid>,
    deps: Dependencies,
}

impl NodeServer {
    fn new(id: NodeId, init: NodeInit, u: Block, fo: Vec<f64>, ctx: Arc<Context>) -> Self {
        let gnx = ctx.gnx();
        let ns = ctx.ns();
        assert_eq!(u.dim(), [gnx; 3]);
        assert_eq!(u.num_fields(), ns);
        let grid = Grid {
            u0: u.clone(),
            fx: Block::zeros([gnx; 3], ns),
            fy: Block::zeros([gnx; 3], ns),
            fz: Block::zeros([gnx; 3], ns),
            d: Block::zeros([gnx; 3], ns),
            fo0: fo.clone(),
            dfo: vec![0.0; ns],
            time: init.time,
            step: init.step,
            u,
            fo,
        };
        let order = ctx.order();
        Self {
            id,
            level: init.level,
            location: init.location,
            dx: init.dx,
            offset: init.offset,
            origin: init.origin,
            parent: init.parent,
            ctx,
            topology: Mutex::new(Topology {
                siblings: [NodeClient::Invalid; 6],
                children: [None; 8],
                nephews: Vec::new(),
                marked: 0,
            }),
            grid: Mutex::new(grid),
            deps: Dependencies::new(order),
        }
    }

    /// Construct a root node: no parent, physical clients routing back to
    /// this node installed on all six faces.
    ///
    pub fn root(id: NodeId, init: NodeInit, ctx: Arc<Context>) -> Self {
        assert!(init.parent.is_none(), "root node constructed with a parent");
        let u = Block::zeros([ctx.gnx(); 3], ctx.ns());
        let fo = vec![0.0; ctx.ns()];
        let node = Self::new(id, init, u, fo, ctx);
        {
            let mut topology = node.topology.lock().unwrap();
            for face in Face::ALL {
                topology.siblings[face.index()] = NodeClient::Physical { face, id };
            }
        }
        node
    }

    /// Construct a child node from interior state seeded by the parent. The
    /// parent handle must be a plain real address.
    ///
    pub fn new_child(id: NodeId, init: NodeInit, u: Block, ctx: Arc<Context>) -> Result<Self> {
        match init.parent {
            Some(NodeClient::Real { .. }) => {}
            _ => return Err(Error::ParentReferenceCycle(id)),
        }
        let fo = vec![0.0; ctx.ns()];
        Ok(Self::new(id, init, u, fo, ctx))
    }

    /// Reconstitute a node from checkpointed state. Topology is installed
    /// separately by the loader.
    ///
    pub(crate) fn restore(
        id: NodeId,
        init: NodeInit,
        u: Block,
        fo: Vec<f64>,
        ctx: Arc<Context>,
    ) -> Self {
        Self::new(id, init, u, fo, ctx)
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn level(&self) -> u64 {
        self.level
    }

    pub fn location(&self) -> [i64; 3] {
        self.location
    }

    pub fn dx(&self) -> f64 {
        self.dx
    }

    pub fn offset(&self) -> [i64; 3] {
        self.offset
    }

    pub fn origin(&self) -> [f64; 3] {
        self.origin
    }

    pub fn parent(&self) -> Option<NodeClient> {
        self.parent
    }

    pub fn time(&self) -> f64 {
        self.grid.lock().unwrap().time
    }

    pub fn step(&self) -> u64 {
        self.grid.lock().unwrap().step
    }

    /// Half-extent of the spatial domain.
    pub fn domain(&self) -> f64 {
        self.ctx.config.spatial_domain
    }

    /// This node's child index within its parent, from the parity of its
    /// location.
    pub fn octant_in_parent(&self) -> Octant {
        Octant::from_location(self.location)
    }

    pub(crate) fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    pub(crate) fn grid(&self) -> MutexGuard<Grid> {
        self.grid.lock().unwrap()
    }

    pub fn deps(&self) -> &Dependencies {
        &self.deps
    }

    ///////////////////////////////////////////////////////////////////////
    // Coordinates

    fn domain_shift(&self, axis: Axis) -> f64 {
        if axis == Axis::Z && self.ctx.config.reflect_on_z {
            0.0
        } else {
            self.ctx.config.spatial_domain
        }
    }

    /// The coordinate of the lower face of cell `index` on the given axis.
    ///
    pub fn face_coord(&self, axis: Axis, index: usize) -> f64 {
        let a = axis.index();
        let bw = self.ctx.bw() as f64;
        (self.offset[a] + index as i64) as f64 * self.dx - bw * self.dx
            - self.domain_shift(axis)
            - self.origin[a]
    }

    /// The coordinate of the center of cell `index` on the given axis.
    ///
    pub fn center_coord(&self, axis: Axis, index: usize) -> f64 {
        self.face_coord(axis, index) + 0.5 * self.dx
    }

    pub fn cell_center(&self, i: usize, j: usize, k: usize) -> Coords {
        [
            self.center_coord(Axis::X, i),
            self.center_coord(Axis::Y, j),
            self.center_coord(Axis::Z, k),
        ]
    }

    /// Coordinates of the face of cell `(i, j, k)` normal to `axis`: the
    /// face coordinate on that axis and cell centers on the others.
    ///
    pub fn face_center(&self, axis: Axis, i: usize, j: usize, k: usize) -> Coords {
        let mut coords = self.cell_center(i, j, k);
        coords[axis.index()] = self.face_coord(axis, [i, j, k][axis.index()]);
        coords
    }

    ///////////////////////////////////////////////////////////////////////
    // State access for the science and for drivers

    /// Overwrite every interior cell from a closure of the cell-center
    /// coordinates.
    ///
    pub fn fill_interior<F>(&self, f: F)
    where
        F: Fn(Coords, &mut [f64]),
    {
        let gnx = self.ctx.gnx();
        let bw = self.ctx.bw();
        let mut grid = self.grid.lock().unwrap();
        for i in bw..gnx - bw {
            for j in bw..gnx - bw {
                for k in bw..gnx - bw {
                    f(self.cell_center(i, j, k), grid.u.get_mut(i, j, k))
                }
            }
        }
    }

    /// Visit every interior cell.
    ///
    pub fn for_each_interior<F>(&self, mut f: F)
    where
        F: FnMut(Coords, &[f64]),
    {
        let gnx = self.ctx.gnx();
        let bw = self.ctx.bw();
        let grid = self.grid.lock().unwrap();
        for i in bw..gnx - bw {
            for j in bw..gnx - bw {
                for k in bw..gnx - bw {
                    f(self.cell_center(i, j, k), grid.u.get(i, j, k))
                }
            }
        }
    }

    /// Visit every interior cell within the sub-region a child at the given
    /// octant would cover.
    ///
    pub fn for_each_octant_cell<F>(&self, octant: Octant, mut f: F)
    where
        F: FnMut(Coords, &[f64]),
    {
        let bw = self.ctx.bw();
        let half = self.ctx.interior() / 2;
        let start = |axis| bw + octant.bit(axis) as usize * half;
        let (i0, j0, k0) = (start(Axis::X), start(Axis::Y), start(Axis::Z));
        let grid = self.grid.lock().unwrap();
        for i in i0..i0 + half {
            for j in j0..j0 + half {
                for k in k0..k0 + half {
                    f(self.cell_center(i, j, k), grid.u.get(i, j, k))
                }
            }
        }
    }

    /// A copy of one cell's state vector.
    ///
    pub fn cell(&self, i: usize, j: usize, k: usize) -> Vec<f64> {
        self.grid.lock().unwrap().u.get(i, j, k).to_vec()
    }

    ///////////////////////////////////////////////////////////////////////
    // Topology

    pub fn siblings(&self) -> [NodeClient; 6] {
        self.topology.lock().unwrap().siblings
    }

    pub fn sibling(&self, face: Face) -> NodeClient {
        self.topology.lock().unwrap().siblings[face.index()]
    }

    pub fn children(&self) -> [Option<NodeClient>; 8] {
        self.topology.lock().unwrap().children
    }

    pub fn child(&self, octant: Octant) -> Option<NodeClient> {
        self.topology.lock().unwrap().children[octant.index()]
    }

    pub fn num_children(&self) -> usize {
        self.children().iter().flatten().count()
    }

    pub fn nephews(&self) -> Vec<Nephew> {
        self.topology.lock().unwrap().nephews.clone()
    }

    pub fn marked(&self) -> u8 {
        self.topology.lock().unwrap().marked
    }

    pub fn is_marked(&self, octant: Octant) -> bool {
        self.marked() & (1 << octant.index()) != 0
    }

    /// Install a sibling client. An invalid slot accepts any client; an amr
    /// client may be displaced by a real one when the neighbor has been
    /// refined. Anything else is a wiring bug. Returns the displaced
    /// client so the caller can retract the inverse nephew subscription.
    ///
    pub(crate) fn install_sibling(&self, face: Face, client: NodeClient) -> NodeClient {
        assert!(!client.is_invalid(), "installing an invalid sibling");
        let mut topology = self.topology.lock().unwrap();
        let slot = &mut topology.siblings[face.index()];
        let old = *slot;
        match (&old, &client) {
            (NodeClient::Invalid, _) => {}
            (NodeClient::Amr { .. }, NodeClient::Real { .. }) => {}
            _ => panic!(
                "sibling already exists, node({:?}), face({:?}), old({:?}), new({:?})",
                self.id, face, old, client
            ),
        }
        *slot = client;
        old
    }

    pub(crate) fn register_child(&self, octant: Octant, client: NodeClient) -> Result<()> {
        let mut topology = self.topology.lock().unwrap();
        if topology.children[octant.index()].is_some() {
            return Err(Error::ChildAlreadyExists {
                node: self.id,
                octant,
            });
        }
        topology.children[octant.index()] = Some(client);
        Ok(())
    }

    pub(crate) fn add_nephew(&self, nephew: Nephew) {
        let mut topology = self.topology.lock().unwrap();
        assert!(
            !topology
                .nephews
                .iter()
                .any(|n| n.client == nephew.client && n.face == nephew.face),
            "nephew registered twice, node({:?}), nephew({:?})",
            self.id,
            nephew
        );
        topology.nephews.push(nephew);
    }

    pub(crate) fn remove_nephew(&self, fine: NodeId, face: Face) {
        let mut topology = self.topology.lock().unwrap();
        topology
            .nephews
            .retain(|n| !(n.client.id() == Some(fine) && n.face == face));
    }

    pub(crate) fn mark_child(&self, octant: Octant) -> bool {
        let mut topology = self.topology.lock().unwrap();
        let bit = 1 << octant.index();
        let fresh = topology.marked & bit == 0;
        topology.marked |= bit;
        fresh
    }

    pub(crate) fn clear_marks(&self) {
        self.topology.lock().unwrap().marked = 0;
    }
}

/// Seed a child's cells from the parent's state by minmod-slope subdivision:
/// each coarse cell in the overlapping region populates its eight fine cells
/// with `u ± (±s1 ±s2 ±s3) / 4`, signs matching the corner octants, so the
/// eight seeded values average back to the coarse value exactly.
///
pub fn seeded_block(parent_u: &Block, octant: Octant, ctx: &Context) -> Block {
    let gnx = ctx.gnx();
    let bw = ctx.bw();
    let ns = ctx.ns();
    let half = gnx / 2 - bw;

    let mut u = Block::zeros([gnx; 3], ns);
    let mut fwd = vec![0.0; ns];
    let mut bck = vec![0.0; ns];
    let mut s = [vec![0.0; ns], vec![0.0; ns], vec![0.0; ns]];

    let parent_index = |axis: Axis, i: usize| (bw + i) / 2 + octant.bit(axis) as usize * half;

    for i in (bw..gnx - bw).step_by(2) {
        for j in (bw..gnx - bw).step_by(2) {
            for k in (bw..gnx - bw).step_by(2) {
                let ip = parent_index(Axis::X, i);
                let jp = parent_index(Axis::Y, j);
                let kp = parent_index(Axis::Z, k);

                let u0 = parent_u.get(ip, jp, kp).to_vec();
                let mut slope = |axis: usize, up: &[f64], um: &[f64]| {
                    for n in 0..ns {
                        fwd[n] = up[n] - u0[n];
                        bck[n] = u0[n] - um[n];
                    }
                    minmod_slice(&fwd, &bck, &mut s[axis]);
                };
                slope(0, parent_u.get(ip + 1, jp, kp), parent_u.get(ip - 1, jp, kp));
                slope(1, parent_u.get(ip, jp + 1, kp), parent_u.get(ip, jp - 1, kp));
                slope(2, parent_u.get(ip, jp, kp + 1), parent_u.get(ip, jp, kp - 1));

                for di in 0..2 {
                    for dj in 0..2 {
                        for dk in 0..2 {
                            let signs = [
                                if di == 0 { -1.0 } else { 1.0 },
                                if dj == 0 { -1.0 } else { 1.0 },
                                if dk == 0 { -1.0 } else { 1.0 },
                            ];
                            let cell = u.get_mut(i + di, j + dj, k + dk);
                            for n in 0..ns {
                                cell[n] = u0[n]
                                    + 0.25
                                        * (signs[0] * s[0][n]
                                            + signs[1] * s[1][n]
                                            + signs[2] * s[2][n]);
                            }
                        }
                    }
                }
            }
        }
    }
    u
}
