use crossbeam_channel::{unbounded, Receiver, Sender};

use super::Communicator;

/// A single-process communicator: rank 0 of 1, with sends to self looping
/// straight back to the receive queue. This is the transport of
/// single-machine runs and of the test suite.
///
pub struct LoopbackCommunicator {
    sink: Sender<Vec<u8>>,
    source: Receiver<Vec<u8>>,
}

impl LoopbackCommunicator {
    pub fn new() -> Self {
        let (sink, source) = unbounded();
        Self { sink, source }
    }
}

impl Default for LoopbackCommunicator {
    fn default() -> Self {
        Self::new()
    }
}

impl Communicator for LoopbackCommunicator {
    fn rank(&self) -> usize {
        0
    }

    fn size(&self) -> usize {
        1
    }

    fn send(&self, rank: usize, message: Vec<u8>) {
        assert_eq!(rank, 0, "loopback communicator has a single rank");
        self.sink.send(message).unwrap()
    }

    fn recv(&self) -> Vec<u8> {
        self.source.recv().unwrap()
    }
}

#[cfg(test)]
mod test {
    use super::{Communicator, LoopbackCommunicator};

    #[test]
    fn loopback_delivers_to_self() {
        let comm = LoopbackCommunicator::new();
        comm.send(0, vec![1, 2, 3]);
        comm.send(0, vec![4]);
        assert_eq!(comm.recv(), vec![1, 2, 3]);
        assert_eq!(comm.recv(), vec![4]);
    }
}
