use crate::{
    comm::{CommError, GroupChannel, Rank, Tag, World, COORDINATOR},
    config::{BatchConfig, ConfigErrors},
    jobs::{model_path, Invocation, Job, JobCache, JobError, TaskOutcome},
    launch::{hostname, LaunchError},
    materialize::{Materializer, TempPath},
    pool,
};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info};

/*
 * The pull protocol, seen from both sides:
 * -> a group root sends READY and blocks for START(index) or EXIT
 * -> the root stages the task, then broadcasts the order to its group
 * -> every member runs the job, the group barriers, the root reports DONE
 * -> on EXIT the group barriers one last time and the root reports EXIT
 * -> the coordinator answers READYs until the list is drained, then EXITs
 *    each group as it asks again, and finishes when every group has left
 */

#[derive(Error, Debug)]
pub enum RunError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigErrors),
    #[error("Communication failed: {0}")]
    Comm(#[from] CommError),
    #[error("Task {task} failed: {source}")]
    Job {
        task: usize,
        #[source]
        source: JobError,
    },
    #[error("Launcher failed: {0}")]
    Launch(#[from] LaunchError),
    #[error("Protocol violation: unexpected {tag:?} from rank {src}")]
    Protocol { tag: Tag, src: Rank },
}

/// what the coordinator hands a requesting group root
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assignment {
    Start(usize),
    Exit,
}

/// what a group root broadcasts to its members for one round
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub enum Order {
    Run(Invocation),
    Quit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    /// task indices remain to hand out
    Dispatching,
    /// every index is out; requesting groups are told to leave
    Draining,
    /// every group has left
    Done,
}

/// the coordinator's bookkeeping, kept apart from the wire so the
/// exactly-once guarantee stands on its own
pub struct Dispatcher {
    total: usize,
    groups: usize,
    next: usize,
    closed: usize,
    completed: usize,
}

impl Dispatcher {
    pub fn new(total: usize, groups: usize) -> Self {
        Self {
            total,
            groups,
            next: 0,
            closed: 0,
            completed: 0,
        }
    }

    pub fn state(&self) -> DispatchState {
        if self.closed == self.groups {
            DispatchState::Done
        } else if self.next == self.total {
            DispatchState::Draining
        } else {
            DispatchState::Dispatching
        }
    }

    /// answer one READY: the next index while any remain, EXIT afterwards
    pub fn on_ready(&mut self) -> Assignment {
        if self.next < self.total {
            let task = self.next;
            self.next += 1;
            Assignment::Start(task)
        } else {
            Assignment::Exit
        }
    }

    pub fn on_done(&mut self) {
        self.completed += 1;
    }

    pub fn on_exit(&mut self) {
        self.closed += 1;
    }

    pub fn finished(&self) -> bool {
        self.closed == self.groups
    }

    pub fn closed_groups(&self) -> usize {
        self.closed
    }

    pub fn completed(&self) -> usize {
        self.completed
    }
}

/// drive one rank through the whole run: plan the pool, split the channel,
/// then dispatch or work until every group has left
pub fn run<J: Job>(world: &World, config: &BatchConfig, job: &J) -> Result<(), RunError> {
    let plan = pool::plan(world.size(), config.cpus_per_worker, world.rank())?;
    let group = world.split(plan.color)?;

    if world.is_coordinator() {
        coordinate(world, config, plan.groups)?;
    } else if plan.is_worker() {
        work(world, &group, config, job)?;
    }

    // errors never reach this point; the caller aborts the whole pool, so
    // ranks that get here are guaranteed a full barrier
    world.barrier()?;
    debug!("rank {} process finished", world.rank());
    if world.is_coordinator() {
        info!("coordinator is finished; terminating");
    }

    Ok(())
}

fn coordinate(world: &World, config: &BatchConfig, groups: usize) -> Result<(), RunError> {
    let total = config.tasks.len();
    let mut dispatcher = Dispatcher::new(total, groups);
    info!("coordinator starting with {groups} worker group(s) and {total} total task(s)");

    while !dispatcher.finished() {
        let message = world.recv_any(&[Tag::Ready, Tag::Done, Tag::Exit])?;
        match message.tag {
            Tag::Ready => match dispatcher.on_ready() {
                Assignment::Start(task) => {
                    info!(
                        "sending task `{}` to rank {}",
                        config.tasks.display(task),
                        message.src
                    );
                    world.send(message.src, Tag::Start, &task)?;
                }
                Assignment::Exit => world.send(message.src, Tag::Exit, &())?,
            },
            Tag::Done => {
                let outcome: TaskOutcome = message.decode()?;
                dispatcher.on_done();
                debug!(
                    "task {} finished on rank {} after {} ms",
                    outcome.task, message.src, outcome.elapsed_ms
                );
            }
            Tag::Exit => {
                dispatcher.on_exit();
                debug!(
                    "rank {} has exited, closed groups = {}",
                    message.src,
                    dispatcher.closed_groups()
                );
            }
            tag => {
                return Err(RunError::Protocol {
                    tag,
                    src: message.src,
                })
            }
        }
    }
    info!(
        "{} task(s) finished across {groups} group(s)",
        dispatcher.completed()
    );

    Ok(())
}

fn work<J: Job>(
    world: &World,
    group: &GroupChannel,
    config: &BatchConfig,
    job: &J,
) -> Result<(), RunError> {
    let materializer = Materializer::new(config);
    let cache = JobCache::new();

    if group.is_root() {
        info!(
            "group {} root is rank {} on {} with {} process(es) available",
            group.color(),
            world.rank(),
            hostname(),
            group.size()
        );
    }

    loop {
        let mut artifact = None;
        let order = if group.is_root() {
            world.send(COORDINATOR, Tag::Ready, &())?;
            let reply = world.recv_from(COORDINATOR, &[Tag::Start, Tag::Exit])?;
            match reply.tag {
                Tag::Start => {
                    let task: usize = reply.decode()?;
                    let staged = materializer.stage(task)?;
                    let path = TempPath::write(&staged.params)?;
                    let mut args = staged.args;
                    args.push(String::from("-p"));
                    args.push(path.display().to_string());
                    artifact = Some(path);
                    group.bcast(Some(Order::Run(Invocation { task, args })))?
                }
                Tag::Exit => group.bcast(Some(Order::Quit))?,
                tag => {
                    return Err(RunError::Protocol {
                        tag,
                        src: reply.src,
                    })
                }
            }
        } else {
            group.bcast(None)?
        };

        match order {
            Order::Run(invocation) => {
                let outcome = execute(group, job, &invocation, &cache)?;
                group.barrier()?;
                // every member is past its run, the parameter file can go
                drop(artifact);
                if group.is_root() {
                    world.send(COORDINATOR, Tag::Done, &outcome)?;
                }
            }
            Order::Quit => break,
        }
    }

    group.barrier()?;
    if group.is_root() {
        world.send(COORDINATOR, Tag::Exit, &())?;
    }

    Ok(())
}

/// run one invocation on this member, loading the model on first need
fn execute<J: Job>(
    group: &GroupChannel,
    job: &J,
    invocation: &Invocation,
    cache: &JobCache<J::Model>,
) -> Result<TaskOutcome, RunError> {
    let start = Instant::now();
    let fail = |source| RunError::Job {
        task: invocation.task,
        source,
    };

    let model = match model_path(&invocation.args) {
        Some(path) => {
            if group.is_root() && !cache.is_loaded() {
                info!("loading model from '{}' before the first run", path.display());
            }
            Some(cache.fetch(|| job.load_model(path)).map_err(fail)?)
        }
        None => None,
    };
    job.run(invocation, group, model).map_err(fail)?;

    Ok(TaskOutcome {
        task: invocation.task,
        elapsed_ms: start.elapsed().as_millis() as u64,
    })
}
