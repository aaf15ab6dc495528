use super::{CommError, Envelope, Links, Mailbox, Rank, World};
use nix::{
    sys::signal::{self, Signal},
    unistd,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr, TcpListener, TcpStream},
    process,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};
use tracing::{debug, error, warn};

/// window for each stage of the rendezvous and mesh build
const MESH_TIMEOUT: Duration = Duration::from_secs(30);

/// upper bound on a single frame; anything larger is a corrupt length prefix
const MAX_FRAME: u32 = 16 * 1024 * 1024;

/// everything that crosses a socket: two handshake frames and the envelope
/// stream that follows
#[derive(Serialize, Deserialize, Debug)]
enum Frame {
    Hello { rank: Rank, listen: String },
    Roster { peers: Vec<String> },
    Env(Envelope),
}

/// socket backend: one write-locked stream per peer plus a detached reader
/// thread per link draining frames into the mailbox
pub(crate) struct TcpLinks {
    rank: Rank,
    mailbox: Arc<Mailbox>,
    writers: Vec<Option<Mutex<TcpStream>>>,
}

impl TcpLinks {
    pub fn deliver(&self, dst: Rank, envelope: Envelope) -> Result<(), CommError> {
        if dst == self.rank {
            self.mailbox.push(envelope);
            return Ok(());
        }

        match self.writers.get(dst).and_then(Option::as_ref) {
            Some(stream) => {
                let mut stream = stream.lock();
                write_frame(&mut stream, &Frame::Env(envelope)).map_err(|error| {
                    CommError::Socket {
                        rank: dst,
                        message: error.to_string(),
                    }
                })
            }
            None => Err(CommError::PeerLost(dst)),
        }
    }

    /// SIGKILL the whole process group so no peer stays blocked in a
    /// collective wait, then fall back to a plain exit
    pub fn abort(&self, code: i32) -> ! {
        warn!("rank {} is taking the whole pool down", self.rank);
        if let Err(errno) = signal::killpg(unistd::getpgrp(), Signal::SIGKILL) {
            error!("failed to kill the process group: {errno}");
        }
        process::exit(code);
    }

    pub fn shutdown(&self) {
        for stream in self.writers.iter().flatten() {
            if let Err(error) = stream.lock().shutdown(Shutdown::Both) {
                debug!("socket shutdown failed: {error}");
            }
        }
    }
}

/// rank 0 side of the rendezvous: collect a hello from every other rank,
/// answer each with the listener roster, and keep the hello links as this
/// rank's mesh edges
pub fn host(listener: TcpListener, size: usize) -> Result<World, CommError> {
    let mailbox = Arc::new(Mailbox::new(size));
    let mut writers: Vec<Option<Mutex<TcpStream>>> = (0..size).map(|_| None).collect();
    let mut listens: Vec<String> = vec![String::new(); size];

    let deadline = Instant::now() + MESH_TIMEOUT;
    for _ in 0..size.saturating_sub(1) {
        let (mut stream, addr) = accept_deadline(&listener, deadline)?;
        prepare(&stream)?;
        match read_frame(&mut stream).map_err(rendezvous)? {
            Frame::Hello { rank, listen } => {
                if rank == 0 || rank >= size || writers[rank].is_some() {
                    return Err(CommError::Rendezvous(format!(
                        "rank {rank} from {addr} does not fit a world of {size}"
                    )));
                }
                debug!("rank {rank} checked in from {addr}");
                listens[rank] = listen;
                writers[rank] = Some(Mutex::new(stream));
            }
            other => {
                return Err(CommError::Rendezvous(format!(
                    "unexpected frame during check-in: {other:?}"
                )))
            }
        }
    }

    let roster = Frame::Roster {
        peers: listens.clone(),
    };
    for stream in writers.iter().flatten() {
        write_frame(&mut stream.lock(), &roster).map_err(rendezvous)?;
    }

    finish_mesh(0, size, mailbox, writers)
}

/// worker-rank side: check in with rank 0, learn the roster, then dial every
/// lower rank and accept every higher one so the full mesh exists before the
/// protocol starts
pub fn attach(rank: Rank, size: usize, master: &str) -> Result<World, CommError> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).map_err(rendezvous)?;
    let listen = listener.local_addr().map_err(rendezvous)?.to_string();

    let mut master_stream = connect_retry(master)?;
    write_frame(&mut master_stream, &Frame::Hello { rank, listen }).map_err(rendezvous)?;
    let peers = match read_frame(&mut master_stream).map_err(rendezvous)? {
        Frame::Roster { peers } => peers,
        other => {
            return Err(CommError::Rendezvous(format!(
                "unexpected frame instead of the roster: {other:?}"
            )))
        }
    };
    if peers.len() != size {
        return Err(CommError::Rendezvous(format!(
            "roster covers {} rank(s), expected {size}",
            peers.len()
        )));
    }

    let mailbox = Arc::new(Mailbox::new(size));
    let mut writers: Vec<Option<Mutex<TcpStream>>> = (0..size).map(|_| None).collect();
    writers[0] = Some(Mutex::new(master_stream));

    // dial downwards; the rank 0 link already exists from the check-in
    for peer in 1..rank {
        let mut stream = connect_retry(&peers[peer])?;
        let hello = Frame::Hello {
            rank,
            listen: String::new(),
        };
        write_frame(&mut stream, &hello).map_err(rendezvous)?;
        writers[peer] = Some(Mutex::new(stream));
    }

    // accept upwards
    let deadline = Instant::now() + MESH_TIMEOUT;
    for _ in rank + 1..size {
        let (mut stream, addr) = accept_deadline(&listener, deadline)?;
        prepare(&stream)?;
        match read_frame(&mut stream).map_err(rendezvous)? {
            Frame::Hello { rank: peer, .. }
                if peer > rank && peer < size && writers[peer].is_none() =>
            {
                debug!("rank {peer} dialed in from {addr}");
                writers[peer] = Some(Mutex::new(stream));
            }
            other => {
                return Err(CommError::Rendezvous(format!(
                    "unexpected frame while meshing: {other:?}"
                )))
            }
        }
    }

    finish_mesh(rank, size, mailbox, writers)
}

/// clear the handshake timeouts, start one reader per link and assemble the
/// world handle
fn finish_mesh(
    rank: Rank,
    size: usize,
    mailbox: Arc<Mailbox>,
    writers: Vec<Option<Mutex<TcpStream>>>,
) -> Result<World, CommError> {
    for stream in writers.iter().flatten() {
        stream.lock().set_read_timeout(None).map_err(rendezvous)?;
    }

    for (peer, slot) in writers.iter().enumerate() {
        if let Some(stream) = slot {
            let reader = stream.lock().try_clone().map_err(rendezvous)?;
            let inbox = mailbox.clone();
            thread::Builder::new()
                .name(format!("comm-{rank}-{peer}"))
                .spawn(move || pump(peer, reader, inbox))
                .map_err(rendezvous)?;
        }
    }

    Ok(World::from_parts(
        rank,
        size,
        mailbox.clone(),
        Links::Tcp(TcpLinks {
            rank,
            mailbox,
            writers,
        }),
    ))
}

/// reader loop for one link; any read failure poisons the mailbox, which is
/// also how a peer death surfaces here
fn pump(peer: Rank, mut stream: TcpStream, mailbox: Arc<Mailbox>) {
    loop {
        match read_frame(&mut stream) {
            Ok(Frame::Env(envelope)) => mailbox.push(envelope),
            Ok(other) => {
                error!("unexpected frame from rank {peer}: {other:?}");
                mailbox.poison(CommError::PeerLost(peer));
                return;
            }
            Err(error) => {
                debug!("link to rank {peer} closed: {error}");
                mailbox.poison(CommError::PeerLost(peer));
                return;
            }
        }
    }
}

/// accept with a deadline; a peer that never dials in fails the rendezvous
/// instead of leaving the pool stuck in `accept`
pub(super) fn accept_deadline(
    listener: &TcpListener,
    deadline: Instant,
) -> Result<(TcpStream, SocketAddr), CommError> {
    listener.set_nonblocking(true).map_err(rendezvous)?;
    loop {
        match listener.accept() {
            Ok((stream, addr)) => {
                stream.set_nonblocking(false).map_err(rendezvous)?;
                return Ok((stream, addr));
            }
            Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(CommError::Rendezvous(String::from(
                        "timed out waiting for a peer to dial in",
                    )));
                }
                thread::sleep(Duration::from_millis(50));
            }
            Err(error) => return Err(rendezvous(error)),
        }
    }
}

fn connect_retry(addr: &str) -> Result<TcpStream, CommError> {
    let deadline = Instant::now() + MESH_TIMEOUT;
    loop {
        match TcpStream::connect(addr) {
            Ok(stream) => {
                prepare(&stream)?;
                return Ok(stream);
            }
            Err(error) => {
                if Instant::now() >= deadline {
                    return Err(CommError::Rendezvous(format!(
                        "failed to reach {addr}: {error}"
                    )));
                }
                thread::sleep(Duration::from_millis(50));
            }
        }
    }
}

/// small control messages dominate, so no delayed sends; the read timeout
/// only guards the handshake and is cleared before the protocol starts
fn prepare(stream: &TcpStream) -> Result<(), CommError> {
    stream.set_nodelay(true).map_err(rendezvous)?;
    stream
        .set_read_timeout(Some(MESH_TIMEOUT))
        .map_err(rendezvous)?;

    Ok(())
}

fn write_frame(stream: &mut TcpStream, frame: &Frame) -> io::Result<()> {
    let bytes = rmp_serde::to_vec(frame)
        .map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error))?;
    stream.write_all(&(bytes.len() as u32).to_le_bytes())?;
    stream.write_all(&bytes)
}

fn read_frame(stream: &mut TcpStream) -> io::Result<Frame> {
    let mut prefix = [0u8; 4];
    stream.read_exact(&mut prefix)?;
    let length = u32::from_le_bytes(prefix);
    if length > MAX_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("oversized frame: {length} bytes"),
        ));
    }

    let mut bytes = vec![0u8; length as usize];
    stream.read_exact(&mut bytes)?;
    rmp_serde::from_slice(&bytes).map_err(|error| io::Error::new(io::ErrorKind::InvalidData, error))
}

fn rendezvous(error: io::Error) -> CommError {
    CommError::Rendezvous(error.to_string())
}
