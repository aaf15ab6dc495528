use crate::comm::{mem, CommError, Tag};
use std::thread;

#[test]
pub fn receive_filters_by_tag_and_keeps_the_rest_queued() {
    let worlds = mem::worlds(2);

    worlds[1].send(0, Tag::Arrive, &()).unwrap();
    worlds[1].send(0, Tag::Ready, &()).unwrap();

    // the ready is taken first even though the arrive is older
    let ready = worlds[0]
        .recv_any(&[Tag::Ready, Tag::Done, Tag::Exit])
        .unwrap();
    assert_eq!(ready.tag, Tag::Ready);
    assert_eq!(ready.src, 1);

    let arrive = worlds[0].recv_from(1, &[Tag::Arrive]).unwrap();
    assert_eq!(arrive.tag, Tag::Arrive);
}

#[test]
pub fn messages_from_one_source_stay_ordered() {
    let worlds = mem::worlds(2);
    for task in 0..5usize {
        worlds[1].send(0, Tag::Start, &task).unwrap();
    }

    for expected in 0..5usize {
        let message = worlds[0].recv_from(1, &[Tag::Start]).unwrap();
        assert_eq!(message.decode::<usize>().unwrap(), expected);
    }
}

#[test]
pub fn split_builds_rosters_and_broadcasts_from_the_root() {
    let worlds = mem::worlds(4);
    let handles: Vec<_> = worlds
        .into_iter()
        .map(|world| {
            thread::spawn(move || {
                let color = match world.rank() {
                    0 => 0,
                    1 | 2 => 1,
                    _ => 2,
                };
                let group = world.split(color).unwrap();
                if color == 1 {
                    let value = if group.is_root() {
                        Some(world.rank())
                    } else {
                        None
                    };
                    // everyone in the group sees the root's rank
                    assert_eq!(group.bcast(value).unwrap(), 1);
                    group.barrier().unwrap();
                }

                (world.rank(), group.members().to_vec(), group.is_root())
            })
        })
        .collect();

    let mut results: Vec<_> = handles
        .into_iter()
        .map(|handle| handle.join().unwrap())
        .collect();
    results.sort();

    assert_eq!(results[0], (0, vec![0], true));
    assert_eq!(results[1], (1, vec![1, 2], true));
    assert_eq!(results[2], (2, vec![1, 2], false));
    assert_eq!(results[3], (3, vec![3], true));
}

#[test]
pub fn global_barrier_releases_every_rank() {
    let worlds = mem::worlds(3);
    let handles: Vec<_> = worlds
        .into_iter()
        .map(|world| thread::spawn(move || world.barrier()))
        .collect();

    for handle in handles {
        handle.join().unwrap().unwrap();
    }
}

#[test]
pub fn poison_unblocks_a_waiting_receiver() {
    let worlds = mem::worlds(2);
    let receiver = worlds[0].clone();

    let waiter = thread::spawn(move || receiver.recv_any(&[Tag::Ready]));
    worlds[1].fail_all();

    assert!(matches!(waiter.join().unwrap(), Err(CommError::Aborted)));
}

#[test]
pub fn broadcast_without_a_value_is_refused() {
    let worlds = mem::worlds(1);
    let group = worlds[0].split(1).unwrap();

    assert!(matches!(
        group.bcast::<usize>(None),
        Err(CommError::EmptyBroadcast)
    ));
}
