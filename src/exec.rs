use std::collections::hash_map::{Entry, HashMap};
use std::hash::Hash;

use crossbeam_channel::{select, unbounded, Receiver, Sender};
use log::error;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::{Error, Result};
use crate::pool::ThreadPool;

/// Returned by [`Stage::receive`] to indicate whether a task is eligible to
/// be evaluated.
pub enum Status {
    Eligible,
    Ineligible,
}

impl Status {
    pub fn eligible_if(condition: bool) -> Self {
        if condition {
            Self::Eligible
        } else {
            Self::Ineligible
        }
    }
    pub fn is_eligible(&self) -> bool {
        match self {
            Self::Eligible => true,
            Self::Ineligible => false,
        }
    }
}

/// An agent in a group of compute tasks that can communicate with its peers
/// and yields a successor task, enabling chains of pipeline stages. The
/// model uses message passing rather than memory sharing: a stage owns the
/// message content it receives and keeps it until the executor runs the
/// stage body on a worker thread.
///
pub trait Stage: Sized + Send + 'static {
    /// The type of the key to uniquely identify this stage within a group.
    type Key: Serialize + DeserializeOwned + Hash + Eq + Clone + Send + std::fmt::Debug;

    /// The type of a message to be passed between the stages.
    type Message: Serialize + DeserializeOwned + Send;

    /// Return the key to uniquely identify this stage within the group.
    fn key(&self) -> Self::Key;

    /// Return the rank of the process hosting the stage with the given key.
    fn rank_of(key: &Self::Key) -> usize;

    /// Return a list of messages to be sent to peers. Invoked once, when the
    /// stage enters the executor.
    fn messages(&self) -> Vec<(Self::Key, Self::Message)>;

    /// Receive and store a message from another stage, returning `Eligible`
    /// once every expected message has arrived. Invoked once per incoming
    /// message.
    fn receive(&mut self, message: Self::Message) -> Status;

    /// Eligibility of a stage expecting no messages at all.
    fn ready(&self) -> Status;

    /// Hint the executor which worker thread this stage wants to run on.
    fn worker_hint(&self) -> Option<usize> {
        None
    }

    /// Run the stage body. CPU-intensive work should be done in this method
    /// only; it is called on a worker thread. Returns the successor stage,
    /// or `None` when the chain is complete.
    fn advance(self) -> Option<Self>;
}

struct Coordinator<'a, S: Stage> {
    seen: HashMap<S::Key, S>,
    undelivered: HashMap<S::Key, Vec<S::Message>>,
    live: usize,
    sink: Sender<Option<S>>,
    pool: &'a ThreadPool,
    rank: usize,
    send_remote: &'a dyn Fn(usize, Vec<u8>),
}

impl<'a, S: Stage> Coordinator<'a, S> {
    fn spawn(&mut self, stage: S) {
        let sink = self.sink.clone();
        self.live += 1;
        self.pool.spawn_on(stage.worker_hint(), move || {
            sink.send(stage.advance()).unwrap();
        })
    }

    /// Deliver one message, either to a pending local stage or over the
    /// wire. Stages that become eligible upon receiving it are spawned.
    ///
    fn deliver(&mut self, dest: S::Key, data: S::Message) {
        if S::rank_of(&dest) != self.rank {
            match rmp_serde::to_vec(&(&dest, &data)) {
                Ok(bytes) => (self.send_remote)(S::rank_of(&dest), bytes),
                Err(err) => panic!("failed to serialize message: {}", err),
            }
            return;
        }
        match self.seen.entry(dest) {
            Entry::Occupied(mut entry) => {
                if entry.get_mut().receive(data).is_eligible() {
                    let stage = entry.remove();
                    self.spawn(stage)
                }
            }
            Entry::Vacant(none) => self
                .undelivered
                .entry(none.into_key())
                .or_insert_with(Vec::new)
                .push(data),
        }
    }

    /// Take in a stage entering the executor: gather its messages, deliver
    /// them, then hand it any messages that arrived ahead of it. The stage
    /// is spawned right away if it is already eligible.
    ///
    fn insert(&mut self, mut stage: S) {
        for (dest, data) in stage.messages() {
            self.deliver(dest, data)
        }

        let mut eligible = stage.ready().is_eligible();

        if let Some((_, messages)) = self.undelivered.remove_entry(&stage.key()) {
            for message in messages {
                if stage.receive(message).is_eligible() {
                    eligible = true
                }
            }
        }

        if eligible {
            self.spawn(stage)
        } else {
            self.seen.insert(stage.key(), stage);
        }
    }
}

/// Execute a group of stage chains to completion on the given pool. Remote
/// messages go out through `send_remote`; inbound remote messages arrive on
/// the `inbound` channel as `(key, message)` pairs serialized by the sending
/// executor.
///
/// Returns an error if the executor drains while stages are still pending
/// messages; every pending message's producer is then gone for good.
///
pub fn run<S: Stage>(
    stages: Vec<S>,
    pool: &ThreadPool,
    rank: usize,
    send_remote: &dyn Fn(usize, Vec<u8>),
    inbound: &Receiver<Vec<u8>>,
) -> Result<()> {
    let (sink, source) = unbounded();

    let mut coordinator = Coordinator {
        seen: HashMap::new(),
        undelivered: HashMap::new(),
        live: 0,
        sink,
        pool,
        rank,
        send_remote,
    };

    for stage in stages {
        coordinator.insert(stage)
    }

    while coordinator.live > 0 {
        select! {
            recv(source) -> next => {
                coordinator.live -= 1;
                if let Some(next) = next.unwrap() {
                    coordinator.insert(next)
                }
            }
            recv(inbound) -> bytes => {
                let bytes = bytes.map_err(|_| Error::BrokenChannel("remote inbound"))?;
                let (dest, data): (S::Key, S::Message) = rmp_serde::from_slice(&bytes)
                    .expect("failed to deserialize incoming message");
                coordinator.deliver(dest, data)
            }
        }
    }

    if !coordinator.seen.is_empty() {
        for key in coordinator.seen.keys() {
            error!("stage {:?} still pending messages at drain", key);
        }
        return Err(Error::BrokenChannel("executor drained with pending stages"));
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::{run, Stage, Status};
    use crate::pool::ThreadPool;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// A ring of counters: each task sends its value to the next key and
    /// becomes eligible on receipt, for a fixed number of rounds.
    struct RingStage {
        key: u64,
        size: u64,
        round: usize,
        rounds: usize,
        value: u64,
        inbox: Option<u64>,
        total: Arc<AtomicUsize>,
    }

    impl Stage for RingStage {
        type Key = (u64, usize);
        type Message = u64;

        fn key(&self) -> Self::Key {
            (self.key, self.round)
        }

        fn rank_of(_: &Self::Key) -> usize {
            0
        }

        fn messages(&self) -> Vec<(Self::Key, Self::Message)> {
            vec![(((self.key + 1) % self.size, self.round), self.value)]
        }

        fn receive(&mut self, message: u64) -> Status {
            self.inbox = Some(message);
            Status::Eligible
        }

        fn ready(&self) -> Status {
            Status::Ineligible
        }

        fn advance(mut self) -> Option<Self> {
            self.value += self.inbox.take().unwrap();
            self.round += 1;
            self.total.fetch_add(1, Ordering::SeqCst);
            (self.round < self.rounds).then(|| self)
        }
    }

    #[test]
    fn ring_of_stages_runs_all_rounds() {
        let pool = ThreadPool::new(2);
        let total = Arc::new(AtomicUsize::new(0));
        let (_sink, inbound) = crossbeam_channel::unbounded();

        let stages = (0..4)
            .map(|key| RingStage {
                key,
                size: 4,
                round: 0,
                rounds: 3,
                value: 1,
                inbox: None,
                total: total.clone(),
            })
            .collect();

        run(stages, &pool, 0, &|_, _| panic!("no remote peers"), &inbound).unwrap();
        assert_eq!(total.load(Ordering::SeqCst), 12);
    }
}
