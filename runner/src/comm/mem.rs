use super::{CommError, Envelope, Links, Mailbox, Rank, World};
use std::sync::Arc;

/// in-process backend: every rank is a thread and a send is a direct push
/// into the destination mailbox
pub(crate) struct MemLinks {
    peers: Vec<Arc<Mailbox>>,
}

impl MemLinks {
    pub fn deliver(&self, dst: Rank, envelope: Envelope) -> Result<(), CommError> {
        match self.peers.get(dst) {
            Some(mailbox) => {
                mailbox.push(envelope);
                Ok(())
            }
            None => Err(CommError::PeerLost(dst)),
        }
    }

    /// poison every mailbox so all peers unblock with the abort error; the
    /// failing rank keeps its own error and returns normally
    pub fn fail_all(&self) {
        for mailbox in &self.peers {
            mailbox.poison(CommError::Aborted);
        }
    }

    /// hard variant: fail everyone, then take this thread down
    pub fn abort(&self, rank: Rank) -> ! {
        self.fail_all();
        panic!("rank {rank} aborted the run");
    }
}

/// build `size` fully-connected in-process worlds, one per rank
pub fn worlds(size: usize) -> Vec<World> {
    let mailboxes: Vec<Arc<Mailbox>> = (0..size).map(|_| Arc::new(Mailbox::new(size))).collect();

    (0..size)
        .map(|rank| {
            World::from_parts(
                rank,
                size,
                mailboxes[rank].clone(),
                Links::Mem(MemLinks {
                    peers: mailboxes.clone(),
                }),
            )
        })
        .collect()
}
