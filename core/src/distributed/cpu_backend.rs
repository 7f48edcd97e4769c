use super::backend::CollectiveBackend;
use super::message::{Envelope, Payload};
use crate::error::{KnnError, Result};
use crossbeam::atomic::AtomicCell;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::trace;

/// An in-process collective backend, one instance per rank.
///
/// Ranks are connected as a full mesh of `crossbeam` channels: one channel per ordered pair
/// of ranks. Because each pair has its own FIFO channel, a peer that has already moved on to
/// the next round can never overtake a slower peer's message for the current round.
///
/// A peer whose backend is dropped (for example because its thread returned early) shows up
/// as a disconnected channel, and an optional per-round timeout bounds how long a rank waits
/// on a peer that is alive but stuck. Both are reported as `CollectiveFailure`. The timeout
/// given to [`mesh`](Self::mesh) can be replaced later through
/// [`CollectiveBackend::set_round_timeout`].
pub struct CpuBackend {
    rank: usize,
    world_size: usize,
    /// `to_peer[r]` sends to rank `r`; `None` at our own rank.
    to_peer: Vec<Option<Sender<Envelope>>>,
    /// `from_peer[r]` receives from rank `r`; `None` at our own rank.
    from_peer: Vec<Option<Receiver<Envelope>>>,
    round: AtomicU64,
    timeout: AtomicCell<Option<Duration>>,
}

impl CpuBackend {
    /// Builds a fully connected group of `world_size` backends, indexed by rank.
    ///
    /// Move each backend to the thread that plays its rank.
    pub fn mesh(world_size: usize, timeout: Option<Duration>) -> Vec<Self> {
        let mut to_peer: Vec<Vec<Option<Sender<Envelope>>>> =
            (0..world_size).map(|_| vec![None; world_size]).collect();
        let mut from_peer: Vec<Vec<Option<Receiver<Envelope>>>> =
            (0..world_size).map(|_| vec![None; world_size]).collect();

        for src in 0..world_size {
            for dst in 0..world_size {
                if src == dst {
                    continue;
                }
                let (tx, rx) = channel::unbounded();
                to_peer[src][dst] = Some(tx);
                from_peer[dst][src] = Some(rx);
            }
        }

        to_peer
            .into_iter()
            .zip(from_peer)
            .enumerate()
            .map(|(rank, (to_peer, from_peer))| Self {
                rank,
                world_size,
                to_peer,
                from_peer,
                round: AtomicU64::new(0),
                timeout: AtomicCell::new(timeout),
            })
            .collect()
    }

    /// Number of rounds this rank has entered so far.
    pub fn rounds(&self) -> u64 {
        self.round.load(Ordering::SeqCst)
    }

    fn recv_from(&self, peer: usize, rx: &Receiver<Envelope>, round: u64) -> Result<Payload> {
        let envelope = match self.timeout.load() {
            Some(timeout) => rx.recv_timeout(timeout).map_err(|e| match e {
                RecvTimeoutError::Timeout => KnnError::CollectiveFailure(format!(
                    "rank {} timed out after {:?} waiting for rank {} in round {}",
                    self.rank, timeout, peer, round
                )),
                RecvTimeoutError::Disconnected => disconnected(self.rank, peer, round),
            })?,
            None => rx.recv().map_err(|_| disconnected(self.rank, peer, round))?,
        };

        if envelope.from != peer || envelope.round != round {
            return Err(KnnError::CollectiveFailure(format!(
                "rank {} expected round {} from rank {}, got round {} from rank {}",
                self.rank, round, peer, envelope.round, envelope.from
            )));
        }
        Ok(envelope.payload)
    }
}

fn disconnected(rank: usize, peer: usize, round: u64) -> KnnError {
    KnnError::CollectiveFailure(format!(
        "rank {rank} lost connection to rank {peer} in round {round}"
    ))
}

impl CollectiveBackend for CpuBackend {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn round_timeout(&self) -> Option<Duration> {
        self.timeout.load()
    }

    fn set_round_timeout(&self, timeout: Option<Duration>) {
        self.timeout.store(timeout);
    }

    fn exchange_round(&self, contribution: Payload) -> Result<Vec<Payload>> {
        let round = self.round.fetch_add(1, Ordering::SeqCst);
        trace!(rank = self.rank, round, kind = contribution.kind(), "exchange round");

        // Send first: channels are unbounded, so sends never wait on slow peers.
        // A dropped peer fails the round only after every live peer has our contribution.
        let mut send_error = None;
        for (peer, tx) in self.to_peer.iter().enumerate() {
            let Some(tx) = tx else { continue };
            let envelope = Envelope {
                from: self.rank,
                round,
                payload: contribution.clone(),
            };
            if tx.send(envelope).is_err() && send_error.is_none() {
                send_error = Some(disconnected(self.rank, peer, round));
            }
        }
        if let Some(err) = send_error {
            return Err(err);
        }

        let mut own = Some(contribution);
        self.from_peer
            .iter()
            .enumerate()
            .map(|(peer, rx)| match rx {
                Some(rx) => self.recv_from(peer, rx, round),
                None => own.take().ok_or_else(|| {
                    KnnError::CollectiveFailure(format!("rank {} listed twice", self.rank))
                }),
            })
            .collect()
    }
}
