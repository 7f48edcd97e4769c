use super::message::{Payload, ensure_no_abort};
use crate::error::Result;
use std::time::Duration;

/// Abstraction for the process group the engine runs in.
///
/// All methods are collective: every rank must call them in the same order, or the call
/// blocks until the backend gives up. Implementations report lost or misbehaving peers as
/// `KnnError::CollectiveFailure`.
pub trait CollectiveBackend: Send + Sync {
    /// Returns the rank of the current process/thread.
    fn rank(&self) -> usize;

    /// Returns the total number of processes/threads.
    fn world_size(&self) -> usize;

    /// Contributes `contribution` to the current round and blocks until every rank has
    /// contributed. The result holds one payload per rank, indexed by rank, including this
    /// rank's own.
    fn exchange_round(&self, contribution: Payload) -> Result<Vec<Payload>>;

    /// How long a round waits on a peer before failing; `None` waits forever.
    fn round_timeout(&self) -> Option<Duration> {
        None
    }

    /// Sets the wait limit of the following rounds.
    ///
    /// Backends that cannot bound a wait ignore it.
    fn set_round_timeout(&self, _timeout: Option<Duration>) {}

    /// Gathers every rank's contribution at `root`.
    ///
    /// Returns `Some` on `root` and `None` elsewhere. If any rank contributed an abort, every
    /// rank fails, not only `root`. The default goes through
    /// [`exchange_round`](Self::exchange_round); backends with a cheaper point-to-point path
    /// may override it but must keep that guarantee.
    fn gather(&self, root: usize, contribution: Payload) -> Result<Option<Vec<Payload>>> {
        let all = self.exchange_round(contribution)?;
        ensure_no_abort(&all)?;
        Ok((self.rank() == root).then_some(all))
    }

    /// Blocks until every rank has reached the barrier.
    ///
    /// Fails if a peer reached it with an abort instead.
    fn barrier(&self) -> Result<()> {
        ensure_no_abort(&self.exchange_round(Payload::Empty)?)
    }
}
