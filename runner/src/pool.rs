use crate::{comm::Rank, config::ConfigErrors};
use tracing::warn;

/// cut the worker ranks `1..=workers` into groups of `group_size`, in rank
/// order
///
/// a remainder shorter than half a group is dropped entirely; otherwise it
/// forms one trailing smaller group, which loses its highest rank when that
/// keeps the group even
pub fn split_ranks(workers: usize, group_size: usize) -> Vec<(usize, Vec<Rank>)> {
    let available: Vec<Rank> = (1..=workers).collect();
    let full = workers / group_size;
    let extra = workers % group_size;

    let mut groups: Vec<(usize, Vec<Rank>)> = (0..full)
        .map(|index| {
            (
                index,
                available[index * group_size..(index + 1) * group_size].to_vec(),
            )
        })
        .collect();

    if extra > 0 && extra >= group_size / 2 {
        let keep = extra - extra % 2;
        if keep > 0 {
            let start = workers - extra;
            groups.push((groups.len(), available[start..start + keep].to_vec()));
        }
    }

    groups
}

/// one rank's place in the farm once the groups are cut
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolPlan {
    /// communicator color; 0 collects the coordinator and any idle ranks
    pub color: usize,
    /// number of worker groups
    pub groups: usize,
    /// ranks assigned to some group, coordinator excluded
    pub assigned: usize,
}

impl PoolPlan {
    pub fn is_worker(&self) -> bool {
        self.color > 0
    }
}

/// place `rank` in the farm for the given world size, failing before the
/// protocol starts when the request cannot be served
pub fn plan(world_size: usize, group_size: usize, rank: Rank) -> Result<PoolPlan, ConfigErrors> {
    if group_size == 0 {
        return Err(ConfigErrors::ZeroGroupSize);
    }

    let workers = world_size.saturating_sub(1);
    let groups = split_ranks(workers, group_size);
    if groups.is_empty() {
        return Err(ConfigErrors::NoWorkerGroups {
            workers,
            group_size,
        });
    }
    if world_size <= groups.len() {
        return Err(ConfigErrors::NotEnoughRanks {
            have: world_size,
            need: groups.len() + 1,
            groups: groups.len(),
        });
    }

    let mut color = 0;
    let mut assigned = 0;
    for (index, ranks) in &groups {
        if ranks.contains(&rank) {
            color = index + 1;
        }
        assigned += ranks.len();
    }

    let idle = workers - assigned;
    if idle > 0 && rank == 0 {
        warn!(
            "with cpus_per_worker = {group_size} and {workers} available rank(s), {idle} rank(s) will do no work"
        );
    }

    Ok(PoolPlan {
        color,
        groups: groups.len(),
        assigned,
    })
}
