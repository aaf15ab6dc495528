pub mod mem;
pub mod tcp;

#[cfg(test)]
mod mem_test;
#[cfg(test)]
mod tcp_test;

use parking_lot::{Condvar, Mutex};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use std::{collections::VecDeque, sync::Arc};
use thiserror::Error;

/*
 * Rank-to-rank plumbing shared by both backends:
 * -> every rank owns one Mailbox holding a FIFO per source rank
 * -> send never blocks; receive blocks with a (source, tag set) filter so
 *    early barrier traffic cannot disturb the dispatch protocol
 * -> collectives (split, bcast, barrier) are built from the same
 *    point-to-point envelopes, rooted at the first-listed member
 * -> a fatal condition poisons the mailbox: every blocked and future
 *    receive returns the recorded error
 */

/// process identifier inside one run; rank 0 coordinates
pub type Rank = usize;

/// rank 0 owns dispatch and roots the global barrier
pub const COORDINATOR: Rank = 0;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommError {
    #[error("Failed to encode message body: {0}")]
    Encode(String),
    #[error("Failed to decode message body: {0}")]
    Decode(String),
    #[error("Lost the link to rank {0}")]
    PeerLost(Rank),
    #[error("Socket error talking to rank {rank}: {message}")]
    Socket { rank: Rank, message: String },
    #[error("Rendezvous failed: {0}")]
    Rendezvous(String),
    #[error("Broadcast root gave no value")]
    EmptyBroadcast,
    #[error("Run aborted")]
    Aborted,
}

impl From<rmp_serde::encode::Error> for CommError {
    fn from(error: rmp_serde::encode::Error) -> Self {
        Self::Encode(error.to_string())
    }
}

impl From<rmp_serde::decode::Error> for CommError {
    fn from(error: rmp_serde::decode::Error) -> Self {
        Self::Decode(error.to_string())
    }
}

/// wire-level message kinds
#[derive(Serialize_repr, Deserialize_repr, Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Tag {
    /// root -> coordinator: give me work
    Ready = 0,
    /// coordinator -> root: run this task index
    Start = 1,
    /// root -> coordinator: task finished
    Done = 2,
    /// no more work / this group has left
    Exit = 3,
    /// root -> members: group broadcast payload
    Cast = 4,
    /// member -> barrier root
    Arrive = 5,
    /// barrier root -> member
    Release = 6,
    /// rank -> coordinator: color report during the split
    Color = 7,
    /// coordinator -> rank: full color table during the split
    Roster = 8,
}

/// one addressed message; the payload is the MessagePack-encoded body
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Envelope {
    pub src: Rank,
    pub tag: Tag,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn pack<T: Serialize>(src: Rank, tag: Tag, body: &T) -> Result<Self, CommError> {
        Ok(Self {
            src,
            tag,
            payload: rmp_serde::to_vec(body)?,
        })
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, CommError> {
        Ok(rmp_serde::from_slice(&self.payload)?)
    }
}

/// a rank's incoming queues, one FIFO per source; takes are blocking and
/// filtered, non-matching traffic stays queued in arrival order
pub(crate) struct Mailbox {
    state: Mutex<MailboxState>,
    ready: Condvar,
}

struct MailboxState {
    queues: Vec<VecDeque<Envelope>>,
    dead: Option<CommError>,
}

impl Mailbox {
    pub fn new(world_size: usize) -> Self {
        Self {
            state: Mutex::new(MailboxState {
                queues: vec![VecDeque::new(); world_size],
                dead: None,
            }),
            ready: Condvar::new(),
        }
    }

    pub fn push(&self, envelope: Envelope) {
        let mut state = self.state.lock();
        if state.dead.is_some() {
            return;
        }
        if let Some(queue) = state.queues.get_mut(envelope.src) {
            queue.push_back(envelope);
            self.ready.notify_all();
        }
    }

    /// block until a message from `src` (or anyone) carrying one of `tags`
    /// is available
    pub fn take(&self, src: Option<Rank>, tags: &[Tag]) -> Result<Envelope, CommError> {
        let mut state = self.state.lock();
        loop {
            if let Some(error) = &state.dead {
                return Err(error.clone());
            }
            let matched = match src {
                Some(rank) => state
                    .queues
                    .get_mut(rank)
                    .and_then(|queue| take_matching(queue, tags)),
                None => state
                    .queues
                    .iter_mut()
                    .find_map(|queue| take_matching(queue, tags)),
            };
            if let Some(envelope) = matched {
                return Ok(envelope);
            }
            self.ready.wait(&mut state);
        }
    }

    /// fail every current and future take with `error`
    pub fn poison(&self, error: CommError) {
        let mut state = self.state.lock();
        if state.dead.is_none() {
            state.dead = Some(error);
        }
        self.ready.notify_all();
    }
}

fn take_matching(queue: &mut VecDeque<Envelope>, tags: &[Tag]) -> Option<Envelope> {
    let position = queue
        .iter()
        .position(|envelope| tags.contains(&envelope.tag))?;

    queue.remove(position)
}

pub(crate) enum Links {
    Mem(mem::MemLinks),
    Tcp(tcp::TcpLinks),
}

struct WorldInner {
    rank: Rank,
    size: usize,
    mailbox: Arc<Mailbox>,
    links: Links,
}

/// handle to the global communication context; cheap to clone and safe to
/// share with reader threads
#[derive(Clone)]
pub struct World {
    inner: Arc<WorldInner>,
}

impl World {
    pub(crate) fn from_parts(rank: Rank, size: usize, mailbox: Arc<Mailbox>, links: Links) -> Self {
        Self {
            inner: Arc::new(WorldInner {
                rank,
                size,
                mailbox,
                links,
            }),
        }
    }

    pub fn rank(&self) -> Rank {
        self.inner.rank
    }

    pub fn size(&self) -> usize {
        self.inner.size
    }

    pub fn is_coordinator(&self) -> bool {
        self.inner.rank == COORDINATOR
    }

    /// send one tagged body to `dst`; sending to ourselves queues locally
    pub fn send<T: Serialize>(&self, dst: Rank, tag: Tag, body: &T) -> Result<(), CommError> {
        let envelope = Envelope::pack(self.inner.rank, tag, body)?;
        match &self.inner.links {
            Links::Mem(links) => links.deliver(dst, envelope),
            Links::Tcp(links) => links.deliver(dst, envelope),
        }
    }

    pub fn recv_from(&self, src: Rank, tags: &[Tag]) -> Result<Envelope, CommError> {
        self.inner.mailbox.take(Some(src), tags)
    }

    pub fn recv_any(&self, tags: &[Tag]) -> Result<Envelope, CommError> {
        self.inner.mailbox.take(None, tags)
    }

    /// split the global channel by color; collective over every rank. Rank 0
    /// gathers one color report per rank and hands the full table back, so
    /// every rank derives the same rosters locally.
    pub fn split(&self, color: usize) -> Result<GroupChannel, CommError> {
        self.send(COORDINATOR, Tag::Color, &color)?;

        let table: Vec<usize> = if self.inner.rank == COORDINATOR {
            let mut table = vec![0usize; self.inner.size];
            for _ in 0..self.inner.size {
                let report = self.recv_any(&[Tag::Color])?;
                table[report.src] = report.decode()?;
            }
            for dst in 1..self.inner.size {
                self.send(dst, Tag::Roster, &table)?;
            }
            table
        } else {
            self.recv_from(COORDINATOR, &[Tag::Roster])?.decode()?
        };

        GroupChannel::from_table(self.clone(), color, &table)
    }

    /// global barrier over every rank, rooted at the coordinator
    pub fn barrier(&self) -> Result<(), CommError> {
        let members: Vec<Rank> = (0..self.inner.size).collect();
        barrier_among(self, &members)
    }

    /// kill the whole run; never returns. Peers are not shut down
    /// cooperatively, they are torn out of whatever they are blocked on.
    pub fn abort(&self, code: i32) -> ! {
        match &self.inner.links {
            Links::Mem(links) => links.abort(self.inner.rank),
            Links::Tcp(links) => links.abort(code),
        }
    }

    /// in-process runs only: unblock every rank with an abort error while
    /// this rank keeps its own
    pub(crate) fn fail_all(&self) {
        if let Links::Mem(links) = &self.inner.links {
            links.fail_all();
        }
    }

    /// best-effort transport teardown; failures are logged, not returned
    pub fn shutdown(&self) {
        if let Links::Tcp(links) = &self.inner.links {
            links.shutdown();
        }
    }
}

/// communication scoped to the ranks sharing one color; the first-listed
/// (lowest) rank is the root
pub struct GroupChannel {
    world: World,
    color: usize,
    members: Vec<Rank>,
    me: usize,
}

impl GroupChannel {
    fn from_table(world: World, color: usize, table: &[usize]) -> Result<Self, CommError> {
        let members: Vec<Rank> = table
            .iter()
            .enumerate()
            .filter(|(_, entry)| **entry == color)
            .map(|(rank, _)| rank)
            .collect();
        let me = members
            .iter()
            .position(|&rank| rank == world.rank())
            .ok_or_else(|| {
                CommError::Rendezvous(String::from("own rank missing from the split table"))
            })?;

        Ok(Self {
            world,
            color,
            members,
            me,
        })
    }

    pub fn color(&self) -> usize {
        self.color
    }

    pub fn size(&self) -> usize {
        self.members.len()
    }

    /// this process's position within the group
    pub fn group_rank(&self) -> usize {
        self.me
    }

    pub fn is_root(&self) -> bool {
        self.me == 0
    }

    pub fn members(&self) -> &[Rank] {
        &self.members
    }

    /// the root passes `Some`, everyone else `None`; all members return the
    /// root's value once it has reached the whole group
    pub fn bcast<T>(&self, value: Option<T>) -> Result<T, CommError>
    where
        T: Serialize + DeserializeOwned,
    {
        let root = self.members[0];
        if self.world.rank() == root {
            let value = value.ok_or(CommError::EmptyBroadcast)?;
            for &member in &self.members[1..] {
                self.world.send(member, Tag::Cast, &value)?;
            }
            Ok(value)
        } else {
            self.world.recv_from(root, &[Tag::Cast])?.decode()
        }
    }

    /// suspend until every member has arrived
    pub fn barrier(&self) -> Result<(), CommError> {
        barrier_among(&self.world, &self.members)
    }
}

/// everyone reports to the first-listed member, which releases the group
/// once the last report lands; single-member groups degenerate to a no-op
fn barrier_among(world: &World, members: &[Rank]) -> Result<(), CommError> {
    if members.len() <= 1 {
        return Ok(());
    }

    let root = members[0];
    if world.rank() == root {
        for &member in &members[1..] {
            world.recv_from(member, &[Tag::Arrive])?;
        }
        for &member in &members[1..] {
            world.send(member, Tag::Release, &())?;
        }
    } else {
        world.send(root, Tag::Arrive, &())?;
        world.recv_from(root, &[Tag::Release])?;
    }

    Ok(())
}
