use crate::{
    comm::{mem, tcp, CommError, World},
    protocol::RunError,
};
use nix::unistd::{self, Pid};
use std::{
    env,
    net::TcpListener,
    process::{Child, Command},
    sync::Arc,
    thread,
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, error, warn};
use tracing_unwrap::ResultExt;
use wait_timeout::ChildExt;

/// rank of this process within the run
pub const ENV_RANK: &str = "FITFARM_RANK";
/// total number of ranks in the run
pub const ENV_WORLD: &str = "FITFARM_WORLD_SIZE";
/// host:port of rank 0's rendezvous listener
pub const ENV_MASTER: &str = "FITFARM_MASTER";

/// how long rank 0 waits for its children after a clean run
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("Failed to bind the rendezvous listener: {0}")]
    Bind(std::io::Error),
    #[error("Cannot determine the running executable: {0}")]
    NoExecutable(std::io::Error),
    #[error("Failed to spawn rank {rank}")]
    Spawn {
        rank: usize,
        #[source]
        source: std::io::Error,
    },
    #[error("Incomplete rank environment: {0}")]
    BadEnvironment(String),
}

/// how this process joined the run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// no rank environment: this process spawns the others and becomes rank 0
    Parent,
    /// started with a rank environment; attaches to the master listener
    Attached {
        rank: usize,
        size: usize,
        master: String,
    },
}

/// read the rank environment; partial settings are a configuration mistake,
/// not a parent launch
pub fn mode_from_env() -> Result<Mode, LaunchError> {
    let rank = env::var(ENV_RANK).ok();
    let size = env::var(ENV_WORLD).ok();
    let master = env::var(ENV_MASTER).ok();

    match (rank, size, master) {
        (None, None, None) => Ok(Mode::Parent),
        (Some(rank), Some(size), Some(master)) => {
            let rank = rank.parse().map_err(|_| bad_env(ENV_RANK, &rank))?;
            let size = size.parse().map_err(|_| bad_env(ENV_WORLD, &size))?;

            Ok(Mode::Attached { rank, size, master })
        }
        _ => Err(LaunchError::BadEnvironment(format!(
            "{ENV_RANK}, {ENV_WORLD} and {ENV_MASTER} must be set together"
        ))),
    }
}

fn bad_env(name: &str, value: &str) -> LaunchError {
    LaunchError::BadEnvironment(format!("{name} has unusable value `{value}`"))
}

/// bring up the socket world for this process. In parent mode that spawns
/// the other ranks as children; the returned handles are empty otherwise.
pub fn establish(mode: Mode, ranks: usize) -> Result<(World, Vec<Child>), RunError> {
    match mode {
        Mode::Parent => {
            // own process group, so a fault can kill the whole farm without
            // touching the invoking shell
            if let Err(errno) = unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0)) {
                warn!("failed to take a process group: {errno}");
            }

            let listener = TcpListener::bind(("127.0.0.1", 0)).map_err(LaunchError::Bind)?;
            let master = listener.local_addr().map_err(LaunchError::Bind)?.to_string();
            debug!("rendezvous listener on {master}");

            let children = spawn_ranks(&master, ranks)?;
            let world = tcp::host(listener, ranks)?;

            Ok((world, children))
        }
        Mode::Attached { rank, size, master } => {
            let world = if rank == 0 {
                let listener = TcpListener::bind(master.as_str()).map_err(LaunchError::Bind)?;
                tcp::host(listener, size)?
            } else {
                tcp::attach(rank, size, &master)?
            };

            Ok((world, Vec::new()))
        }
    }
}

/// re-exec ourselves once per worker rank, with the same arguments and the
/// rank environment set
fn spawn_ranks(master: &str, ranks: usize) -> Result<Vec<Child>, LaunchError> {
    let exe = env::current_exe().map_err(LaunchError::NoExecutable)?;
    let args: Vec<String> = env::args().skip(1).collect();

    let mut children = Vec::with_capacity(ranks.saturating_sub(1));
    for rank in 1..ranks {
        let child = Command::new(&exe)
            .args(&args)
            .env(ENV_RANK, rank.to_string())
            .env(ENV_WORLD, ranks.to_string())
            .env(ENV_MASTER, master)
            .spawn()
            .map_err(|source| LaunchError::Spawn { rank, source })?;
        debug!("rank {rank} spawned as pid {}", child.id());
        children.push(child);
    }

    Ok(children)
}

/// collect the children after a clean run, killing stragglers; returns
/// whether every child exited cleanly
pub fn wait_children(children: Vec<Child>) -> bool {
    let mut all_ok = true;
    for mut child in children {
        let pid = child.id();
        match child.wait_timeout(SHUTDOWN_GRACE).unwrap_or_log() {
            Some(status) if status.success() => debug!("pid {pid} exited cleanly"),
            Some(status) => {
                error!("pid {pid} exited with {status}");
                all_ok = false;
            }
            None => {
                warn!("pid {pid} is still running, killing it");
                if let Err(error) = child.kill() {
                    error!(error = ?error, "Failed to kill pid {pid}: {error}");
                }
                child.wait().unwrap_or_log();
                all_ok = false;
            }
        }
    }

    all_ok
}

/// run every rank as a named thread of this process over the in-memory
/// transport; a failing rank unblocks all others before reporting its own
/// error
pub fn run_inproc<F>(size: usize, body: F) -> Vec<Result<(), RunError>>
where
    F: Fn(World) -> Result<(), RunError> + Send + Sync + 'static,
{
    let body = Arc::new(body);
    let mut handles = Vec::with_capacity(size);
    for world in mem::worlds(size) {
        let body = body.clone();
        let rank = world.rank();
        let mesh = world.clone();
        let spawned = thread::Builder::new()
            .name(format!("rank-{rank}"))
            .spawn(move || {
                let result = body(world.clone());
                if let Err(ref error) = result {
                    error!("rank {rank} failed: {error}");
                    world.fail_all();
                }

                result
            })
            .map_err(|source| {
                error!("failed to start the thread for rank {rank}: {source}");
                mesh.fail_all();
                LaunchError::Spawn { rank, source }
            });
        handles.push(spawned);
    }

    handles
        .into_iter()
        .map(|spawned| match spawned {
            Ok(handle) => match handle.join() {
                Ok(result) => result,
                Err(_) => Err(RunError::Comm(CommError::Aborted)),
            },
            Err(error) => Err(RunError::Launch(error)),
        })
        .collect()
}

/// best-effort hostname for log context
pub fn hostname() -> String {
    match unistd::gethostname() {
        Ok(name) => name.to_string_lossy().into_owned(),
        Err(_) => String::from("unknown"),
    }
}
