use std::collections::HashMap;
use std::io::prelude::*;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Mutex;
use std::thread;

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, warn};

use super::Communicator;

/// A length-prefixed TCP transport. Each rank owns one listening socket and
/// one outbound connection per peer, opened on first send and reused for the
/// rest of the run. Every accepted connection gets a reader thread pumping
/// its frames into the shared receive queue, so `recv` never touches a
/// socket. The accept thread runs for the life of the process.
///
pub struct TcpCommunicator {
    rank: usize,
    peers: Vec<SocketAddr>,
    streams: Mutex<HashMap<usize, TcpStream>>,
    source: Receiver<Vec<u8>>,
}

impl TcpCommunicator {
    /// Bind the listener at `peers[rank]` and start accepting.
    ///
    pub fn bind(rank: usize, peers: Vec<SocketAddr>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(peers[rank])?;
        Ok(Self::from_listener(listener, rank, peers))
    }

    /// Adopt a pre-bound listener. Useful when the peer table is built from
    /// ephemeral ports: bind every listener first, collect the addresses,
    /// then hand each listener over.
    ///
    pub fn from_listener(listener: TcpListener, rank: usize, peers: Vec<SocketAddr>) -> Self {
        let (sink, source) = unbounded();
        thread::spawn(move || accept_loop(listener, sink));
        Self {
            rank,
            peers,
            streams: Mutex::new(HashMap::new()),
            source,
        }
    }
}

impl Communicator for TcpCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.peers.len()
    }

    fn send(&self, rank: usize, message: Vec<u8>) {
        let mut streams = self.streams.lock().unwrap();

        // One retry through a fresh connection covers a peer that dropped
        // an idle stream; anything else is a dead peer and fatal.
        for attempt in 0..2 {
            if !streams.contains_key(&rank) {
                match TcpStream::connect(self.peers[rank]) {
                    Ok(stream) => {
                        streams.insert(rank, stream);
                    }
                    Err(err) => panic!("cannot reach rank {}: {}", rank, err),
                }
            }
            let stream = streams.get_mut(&rank).unwrap();
            let result = stream
                .write_all(&message.len().to_le_bytes())
                .and_then(|()| stream.write_all(&message));
            match result {
                Ok(()) => return,
                Err(err) if attempt == 0 => {
                    debug!("reconnecting to rank {}: {}", rank, err);
                    streams.remove(&rank);
                }
                Err(err) => panic!("send to rank {} failed: {}", rank, err),
            }
        }
    }

    fn recv(&self) -> Vec<u8> {
        self.source
            .recv()
            .expect("the accept loop outlives the communicator")
    }
}

fn accept_loop(listener: TcpListener, sink: Sender<Vec<u8>>) {
    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                let sink = sink.clone();
                thread::spawn(move || read_frames(stream, sink));
            }
            Err(err) => warn!("accept failed: {}", err),
        }
    }
}

/// Pump length-prefixed frames from one inbound connection until the peer
/// closes it or the communicator is gone.
///
fn read_frames(mut stream: TcpStream, sink: Sender<Vec<u8>>) {
    loop {
        let mut header = [0; 8];
        if stream.read_exact(&mut header).is_err() {
            return;
        }
        let mut frame = vec![0; usize::from_le_bytes(header)];
        if let Err(err) = stream.read_exact(&mut frame) {
            warn!("dropping truncated frame: {}", err);
            return;
        }
        if sink.send(frame).is_err() {
            return;
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::{Communicator, TcpCommunicator};
    use std::net::TcpListener;

    /// Two communicators on ephemeral localhost ports, already aware of
    /// each other.
    pub(crate) fn tcp_pair() -> (TcpCommunicator, TcpCommunicator) {
        let listeners = [
            TcpListener::bind("127.0.0.1:0").unwrap(),
            TcpListener::bind("127.0.0.1:0").unwrap(),
        ];
        let peers: Vec<_> = listeners
            .iter()
            .map(|l| l.local_addr().unwrap())
            .collect();
        let [l0, l1] = listeners;
        (
            TcpCommunicator::from_listener(l0, 0, peers.clone()),
            TcpCommunicator::from_listener(l1, 1, peers),
        )
    }

    #[test]
    fn frames_cross_the_wire_in_order() {
        let (a, b) = tcp_pair();

        a.send(1, vec![1, 2, 3]);
        a.send(1, vec![4]);
        b.send(0, vec![5, 6]);

        // Frames on one connection keep their order.
        assert_eq!(b.recv(), vec![1, 2, 3]);
        assert_eq!(b.recv(), vec![4]);
        assert_eq!(a.recv(), vec![5, 6]);
    }

    #[test]
    fn sends_to_self_loop_back() {
        let (a, _b) = tcp_pair();
        a.send(0, vec![9; 100]);
        assert_eq!(a.recv(), vec![9; 100]);
    }

    #[test]
    fn large_frames_survive_framing() {
        let (a, b) = tcp_pair();
        let frame: Vec<u8> = (0..100_000u32).map(|n| n as u8).collect();
        a.send(1, frame.clone());
        assert_eq!(b.recv(), frame);
    }
}
