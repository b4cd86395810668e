use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;

use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use log::{debug, error};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::comm::Communicator;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::exec;
use crate::face::{Axis, Face};
use crate::octant::Octant;
use crate::pool::ThreadPool;
use crate::science::Science;
use crate::tree::server::{seeded_block, Context, Nephew};
use crate::tree::step::StepStage;
use crate::tree::{NodeClient, NodeId, NodeInit, NodeServer};

/// Top-level wire frame between engine processes: step-pipeline traffic,
/// value-returning calls with their replies, and the shutdown marker.
///
#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum Envelope {
    Stage(Vec<u8>),
    Call {
        token: u64,
        reply_to: u32,
        op: CallOp,
    },
    Reply {
        token: u64,
        payload: CallReply,
    },
    Shutdown,
}

/// The value-returning operations of the node protocol. Fire-and-forget
/// pushes ride the step pipeline instead; everything here is awaited.
///
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) enum CallOp {
    RequireChild { node: NodeId, octant: Octant },
    GetChild { node: NodeId, octant: Octant },
    GetOffset { node: NodeId },
    GetLocation { node: NodeId },
    GetSiblings { node: NodeId },
    SetSibling { node: NodeId, face: Face, client: NodeClient },
    TieChildSibling { node: NodeId, octant: Octant, face: Face, client: NodeClient },
    AddNephew { node: NodeId, nephew: Nephew },
    RemoveNephew { node: NodeId, fine: NodeId, face: Face },
    RefineSignal { node: NodeId, pass: usize, face: Face },
}

impl CallOp {
    fn target(&self) -> NodeId {
        match self {
            CallOp::RequireChild { node, .. }
            | CallOp::GetChild { node, .. }
            | CallOp::GetOffset { node }
            | CallOp::GetLocation { node }
            | CallOp::GetSiblings { node }
            | CallOp::SetSibling { node, .. }
            | CallOp::TieChildSibling { node, .. }
            | CallOp::AddNephew { node, .. }
            | CallOp::RemoveNephew { node, .. }
            | CallOp::RefineSignal { node, .. } => *node,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) enum CallReply {
    Unit,
    Child(Option<NodeClient>),
    Offset([i64; 3]),
    Location([i64; 3]),
    Siblings([NodeClient; 6]),
}

/// The per-process engine: the node registry, the transport endpoints, and
/// the drivers that push the whole tree through steps and refinement passes.
///
pub struct Engine {
    ctx: Arc<Context>,
    comm: Arc<dyn Communicator>,
    pool: ThreadPool,
    nodes: Mutex<HashMap<NodeId, Arc<NodeServer>>>,
    root: Mutex<Option<NodeId>>,
    next_index: AtomicU64,
    next_token: AtomicU64,
    pending: Mutex<HashMap<u64, Sender<CallReply>>>,
    stage_sink: Sender<Vec<u8>>,
    stage_inbound: Receiver<Vec<u8>>,
    listener: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Engine {
    pub fn new(
        config: Config,
        science: Arc<dyn Science>,
        comm: Arc<dyn Communicator>,
        num_threads: usize,
    ) -> Result<Arc<Self>> {
        let ctx = Arc::new(Context::new(config, science)?);
        let (stage_sink, stage_inbound) = unbounded();

        let engine = Arc::new(Self {
            ctx,
            comm: comm.clone(),
            pool: ThreadPool::new(num_threads),
            nodes: Mutex::new(HashMap::new()),
            root: Mutex::new(None),
            next_index: AtomicU64::new(0),
            next_token: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            stage_sink,
            stage_inbound,
            listener: Mutex::new(None),
        });

        let weak = Arc::downgrade(&engine);
        let handle = thread::spawn(move || listener_loop(weak, comm));
        *engine.listener.lock().unwrap() = Some(handle);
        Ok(engine)
    }

    pub(crate) fn context(&self) -> &Arc<Context> {
        &self.ctx
    }

    pub fn config(&self) -> &Config {
        &self.ctx.config
    }

    pub fn science(&self) -> &Arc<dyn Science> {
        &self.ctx.science
    }

    fn rank(&self) -> u32 {
        self.comm.rank() as u32
    }

    pub(crate) fn alloc_id(&self) -> NodeId {
        NodeId {
            rank: self.rank(),
            index: self.next_index.fetch_add(1, Ordering::SeqCst),
        }
    }

    pub(crate) fn register_node(&self, node: Arc<NodeServer>) {
        let prior = self.nodes.lock().unwrap().insert(node.id(), node);
        assert!(prior.is_none(), "node id registered twice");
    }

    pub(crate) fn set_root(&self, id: NodeId) {
        let mut root = self.root.lock().unwrap();
        assert!(root.is_none(), "root already exists");
        *root = Some(id);
    }

    /// Resolve a node address to its local server. Addresses of nodes on
    /// other ranks never resolve here; cross-rank work goes through the
    /// call protocol.
    ///
    pub fn resolve(&self, id: NodeId) -> Result<Arc<NodeServer>> {
        self.nodes
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::TransportFailure(format!("no local node {:?}", id)))
    }

    pub fn local_nodes(&self) -> Vec<Arc<NodeServer>> {
        self.nodes.lock().unwrap().values().cloned().collect()
    }

    pub fn root(&self) -> Result<Arc<NodeServer>> {
        let id = self
            .root
            .lock()
            .unwrap()
            .ok_or_else(|| Error::TransportFailure("no root node".into()))?;
        self.resolve(id)
    }

    ///////////////////////////////////////////////////////////////////////
    // Node creation

    pub fn create_root(&self) -> Result<NodeClient> {
        let id = self.alloc_id();
        let init = NodeInit {
            parent: None,
            level: 0,
            location: [0; 3],
            dx: self.ctx.dx0,
            time: 0.0,
            offset: [0; 3],
            origin: [0.0; 3],
            step: 0,
        };
        let node = Arc::new(NodeServer::root(id, init, self.ctx.clone()));
        self.register_node(node);
        self.set_root(id);
        Ok(NodeClient::real(id))
    }

    /// Create one child of a local parent, seeded from the parent's state.
    ///
    pub fn create_child(&self, parent: NodeId, octant: Octant) -> Result<NodeClient> {
        let parent_node = self.resolve(parent)?;
        if parent_node.child(octant).is_some() {
            return Err(Error::ChildAlreadyExists {
                node: parent,
                octant,
            });
        }

        let interior = self.ctx.interior() as i64;
        let mut location = parent_node.location();
        let mut offset = parent_node.offset();
        for axis in 0..3 {
            location[axis] = 2 * location[axis] + octant.vector()[axis];
            offset[axis] = 2 * offset[axis] + octant.vector()[axis] * interior;
        }

        let init = NodeInit {
            parent: Some(NodeClient::real(parent)),
            level: parent_node.level() + 1,
            location,
            dx: parent_node.dx() * 0.5,
            time: parent_node.time(),
            offset,
            origin: parent_node.origin(),
            step: parent_node.step(),
        };
        let seed = seeded_block(&parent_node.grid().u, octant, &self.ctx);

        let id = self.alloc_id();
        debug!("creating child {:?} of {:?} at {:?}", octant, parent, id);
        let node = Arc::new(NodeServer::new_child(id, init, seed, self.ctx.clone())?);
        self.register_node(node);
        parent_node.register_child(octant, NodeClient::real(id))?;
        Ok(NodeClient::real(id))
    }

    ///////////////////////////////////////////////////////////////////////
    // The call protocol

    /// Route a value-returning operation to its owner: straight into the
    /// local registry, or over the wire with a single-slot reply channel.
    ///
    pub(crate) fn dispatch(&self, op: CallOp) -> Result<CallReply> {
        let target = op.target();
        if target.rank == self.rank() {
            return self.execute(op);
        }

        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        let (sink, source) = bounded(1);
        self.pending.lock().unwrap().insert(token, sink);

        let envelope = Envelope::Call {
            token,
            reply_to: self.rank(),
            op,
        };
        self.comm
            .send(target.rank as usize, encode(&envelope));
        source
            .recv()
            .map_err(|_| Error::TransportFailure("reply channel dropped".into()))
    }

    /// Execute one operation against a local node.
    ///
    pub(crate) fn execute(&self, op: CallOp) -> Result<CallReply> {
        match op {
            CallOp::RequireChild { node, octant } => {
                self.require_child(node, octant)?;
                Ok(CallReply::Unit)
            }
            CallOp::GetChild { node, octant } => {
                Ok(CallReply::Child(self.resolve(node)?.child(octant)))
            }
            CallOp::GetOffset { node } => Ok(CallReply::Offset(self.resolve(node)?.offset())),
            CallOp::GetLocation { node } => {
                Ok(CallReply::Location(self.resolve(node)?.location()))
            }
            CallOp::GetSiblings { node } => {
                Ok(CallReply::Siblings(self.resolve(node)?.siblings()))
            }
            CallOp::SetSibling { node, face, client } => {
                self.set_sibling(node, face, client)?;
                Ok(CallReply::Unit)
            }
            CallOp::TieChildSibling {
                node,
                octant,
                face,
                client,
            } => Ok(CallReply::Child(
                self.tie_child_sibling(node, octant, face, client)?,
            )),
            CallOp::AddNephew { node, nephew } => {
                self.resolve(node)?.add_nephew(nephew);
                Ok(CallReply::Unit)
            }
            CallOp::RemoveNephew { node, fine, face } => {
                self.resolve(node)?.remove_nephew(fine, face);
                Ok(CallReply::Unit)
            }
            CallOp::RefineSignal { node, pass, face } => {
                self.resolve(node)?.deps().post_refine_signal(pass, face);
                Ok(CallReply::Unit)
            }
        }
    }

    ///////////////////////////////////////////////////////////////////////
    // Topology operations

    /// Install a sibling client on a node. Replacing an amr client with a
    /// real one retracts the inverse nephew subscription on the old coarse
    /// server.
    ///
    pub(crate) fn set_sibling(&self, node: NodeId, face: Face, client: NodeClient) -> Result<()> {
        let old = self.resolve(node)?.install_sibling(face, client);
        if let (NodeClient::Amr { id: coarse, .. }, NodeClient::Real { .. }) = (old, client) {
            self.dispatch(CallOp::RemoveNephew {
                node: coarse,
                fine: node,
                face,
            })?;
        }
        Ok(())
    }

    /// Symmetric sibling tie: `a.siblings[face] = b` and
    /// `b.siblings[invert(face)] = a`.
    ///
    pub(crate) fn tie_sibling(&self, a: NodeId, face: Face, b: NodeId) -> Result<()> {
        self.set_sibling(a, face, NodeClient::real(b))?;
        self.dispatch(CallOp::SetSibling {
            node: b,
            face: face.invert(),
            client: NodeClient::real(a),
        })?;
        Ok(())
    }

    /// Install a sibling client on this node's child at `octant`.
    ///
    pub(crate) fn set_child_sibling(
        &self,
        node: NodeId,
        octant: Octant,
        face: Face,
        client: NodeClient,
    ) -> Result<()> {
        let child = self.resolve(node)?.child(octant).ok_or_else(|| {
            Error::TransportFailure(format!("no child {:?} on {:?}", octant, node))
        })?;
        self.set_sibling(child.expect_real(), face, client)
    }

    /// Executed on the parent of a prospective tie target: if its child at
    /// `octant` exists and was created in the current refinement pass,
    /// install `client` on that child's `face` and hand the child back so
    /// the caller can install the inverse. Pre-existing children decline;
    /// they repair their own boundaries.
    ///
    pub(crate) fn tie_child_sibling(
        &self,
        node: NodeId,
        octant: Octant,
        face: Face,
        client: NodeClient,
    ) -> Result<Option<NodeClient>> {
        let parent = self.resolve(node)?;
        match parent.child(octant) {
            Some(child) if parent.is_marked(octant) => {
                self.set_child_sibling(node, octant, face, client)?;
                Ok(Some(child))
            }
            _ => Ok(None),
        }
    }

    /// Mandatory refinement: mark the given child for creation and
    /// propagate up the neighbor path wherever this node itself borders a
    /// coarser neighbor, so coarse/fine level jumps never exceed one.
    ///
    pub fn require_child(&self, node: NodeId, octant: Octant) -> Result<()> {
        let server = self.resolve(node)?;
        if server.child(octant).is_some() {
            return Ok(());
        }
        if !server.mark_child(octant) {
            return Ok(());
        }

        for axis in Axis::ALL {
            let exterior = octant.exterior_face(axis);
            match server.sibling(exterior) {
                NodeClient::Amr { id: uncle, .. } => {
                    let mut neighbor = server.location();
                    neighbor[axis.index()] += exterior.unit()[axis.index()];
                    self.dispatch(CallOp::RequireChild {
                        node: uncle,
                        octant: Octant::from_location(neighbor),
                    })?;
                }
                NodeClient::Invalid => {
                    return Err(Error::InvalidBoundary {
                        node,
                        face: exterior,
                    })
                }
                NodeClient::Real { .. } | NodeClient::Physical { .. } => {}
            }
        }
        Ok(())
    }

    ///////////////////////////////////////////////////////////////////////
    // Step drivers

    /// Advance every node by one time step of size `dt`.
    ///
    pub fn step(&self, dt: f64) -> Result<()> {
        assert!(dt > 0.0, "invalid timestep size");
        let stages: Vec<StepStage> = self
            .local_nodes()
            .into_iter()
            .map(|node| StepStage::initial(node, dt))
            .collect();

        let comm = self.comm.clone();
        let send_remote = move |rank: usize, bytes: Vec<u8>| {
            comm.send(rank, encode(&Envelope::Stage(bytes)));
        };
        exec::run(
            stages,
            &self.pool,
            self.comm.rank(),
            &send_remote,
            &self.stage_inbound,
        )
    }

    /// Step repeatedly until the given stop time, with per-step sizes from
    /// the science's prediction, capped so the last step lands on `until`.
    ///
    pub fn step_to_time(&self, until: f64) -> Result<()> {
        let mut dt = self.initial_dt()?;
        while self.time() < until {
            let capped = dt.min(until - self.time());
            if self.time() + capped <= self.time() {
                break;
            }
            self.step(capped)?;
            dt = self.next_dt(capped, until)?;
        }
        Ok(())
    }

    pub fn time(&self) -> f64 {
        self.root().map(|root| root.time()).unwrap_or(0.0)
    }

    /// The first admissible timestep: the smallest over all leaves.
    ///
    pub fn initial_dt(&self) -> Result<f64> {
        let science = self.ctx.science.clone();
        self.reduce_leaves(
            &|leaf| science.initial_dt(leaf),
            &|a: f64, b: f64| a.min(b),
        )
        .ok_or_else(|| Error::TransportFailure("no leaves to size a timestep from".into()))
    }

    pub fn next_dt(&self, dt: f64, until: f64) -> Result<f64> {
        let science = self.ctx.science.clone();
        self.reduce_leaves(
            &|leaf| science.predict_dt(leaf, dt, until).0,
            &|a: f64, b: f64| a.min(b),
        )
        .ok_or_else(|| Error::TransportFailure("no leaves to size a timestep from".into()))
    }

    ///////////////////////////////////////////////////////////////////////
    // Traversal

    /// Visit every node recursively, invoking `f` locally and in parallel
    /// across subtrees. This and `reduce` are the only means by which
    /// external collaborators observe or mutate node state.
    ///
    pub fn apply(&self, f: &(dyn Fn(&NodeServer) + Sync)) -> Result<()> {
        self.apply_from(&self.root()?, f);
        Ok(())
    }

    fn apply_from(&self, node: &Arc<NodeServer>, f: &(dyn Fn(&NodeServer) + Sync)) {
        let children: Vec<Arc<NodeServer>> = node
            .children()
            .iter()
            .flatten()
            .map(|child| {
                self.resolve(child.expect_real())
                    .expect("children resolve locally")
            })
            .collect();

        rayon::scope(|scope| {
            for child in &children {
                scope.spawn(move |_| self.apply_from(child, f));
            }
            f(node);
        });
    }

    /// Invoke `f` on a single node, without descending.
    ///
    pub fn apply_leaf(&self, id: NodeId, f: &dyn Fn(&NodeServer)) -> Result<()> {
        f(&*self.resolve(id)?);
        Ok(())
    }

    /// Fold per-node values over the whole tree.
    ///
    pub fn reduce<T: Send>(
        &self,
        map: &(dyn Fn(&NodeServer) -> T + Sync),
        fold: &(dyn Fn(T, T) -> T + Sync),
    ) -> Result<T> {
        Ok(self.reduce_from(&self.root()?, map, fold))
    }

    fn reduce_from<T: Send>(
        &self,
        node: &Arc<NodeServer>,
        map: &(dyn Fn(&NodeServer) -> T + Sync),
        fold: &(dyn Fn(T, T) -> T + Sync),
    ) -> T {
        let children: Vec<Arc<NodeServer>> = node
            .children()
            .iter()
            .flatten()
            .map(|child| {
                self.resolve(child.expect_real())
                    .expect("children resolve locally")
            })
            .collect();

        let mut value = map(node);
        let folded: Vec<T> = children
            .par_iter()
            .map(|child| self.reduce_from(child, map, fold))
            .collect();
        for v in folded {
            value = fold(value, v)
        }
        value
    }

    /// Fold per-leaf values over the whole tree; `None` with no root.
    ///
    pub fn reduce_leaves<T: Send>(
        &self,
        map: &(dyn Fn(&NodeServer) -> T + Sync),
        fold: &(dyn Fn(T, T) -> T + Sync),
    ) -> Option<T> {
        self.reduce(
            &|node| (node.num_children() == 0).then(|| map(node)),
            &|a, b| match (a, b) {
                (Some(a), Some(b)) => Some(fold(a, b)),
                (a, None) => a,
                (None, b) => b,
            },
        )
        .ok()
        .flatten()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.comm
            .send(self.comm.rank(), encode(&Envelope::Shutdown));
        if let Some(handle) = self.listener.lock().unwrap().take() {
            // The last handle can be dropped from the listener itself.
            if handle.thread().id() != thread::current().id() {
                handle.join().ok();
            }
        }
    }
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Vec<u8> {
    rmp_serde::to_vec(value).expect("wire types serialize")
}

/// The per-process receive loop: stage traffic feeds the executor, calls
/// execute against the local registry and reply, replies fulfill their
/// pending slot. A failed remote operation is fatal; no partial-failure
/// recovery is attempted.
///
fn listener_loop(weak: Weak<Engine>, comm: Arc<dyn Communicator>) {
    loop {
        let bytes = comm.recv();
        let envelope: Envelope = match rmp_serde::from_slice(&bytes) {
            Ok(envelope) => envelope,
            Err(err) => {
                error!("dropping undecodable envelope: {}", err);
                continue;
            }
        };
        if let Envelope::Shutdown = envelope {
            break;
        }
        let engine = match weak.upgrade() {
            Some(engine) => engine,
            None => break,
        };
        match envelope {
            Envelope::Stage(bytes) => {
                engine.stage_sink.send(bytes).ok();
            }
            Envelope::Call {
                token,
                reply_to,
                op,
            } => {
                let payload = engine
                    .execute(op)
                    .unwrap_or_else(|err| panic!("remote operation failed: {}", err));
                comm.send(reply_to as usize, encode(&Envelope::Reply { token, payload }));
            }
            Envelope::Reply { token, payload } => {
                if let Some(sink) = engine.pending.lock().unwrap().remove(&token) {
                    sink.send(payload).ok();
                }
            }
            Envelope::Shutdown => unreachable!(),
        }
    }
}
