use crate::comm::{tcp, CommError, Tag};
use std::{
    net::{TcpListener, TcpStream},
    thread,
    time::{Duration, Instant},
};

#[test]
pub fn two_ranks_mesh_and_exchange_envelopes() {
    let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
    let master = listener.local_addr().unwrap().to_string();

    let hosting = thread::spawn(move || tcp::host(listener, 2));
    let worker = tcp::attach(1, 2, &master).unwrap();
    let coordinator = hosting.join().unwrap().unwrap();

    coordinator.send(1, Tag::Start, &7usize).unwrap();
    let start = worker.recv_from(0, &[Tag::Start]).unwrap();
    assert_eq!(start.decode::<usize>().unwrap(), 7);

    worker.send(0, Tag::Done, &String::from("ok")).unwrap();
    let done = coordinator.recv_any(&[Tag::Done]).unwrap();
    assert_eq!(done.src, 1);
    assert_eq!(done.decode::<String>().unwrap(), "ok");

    worker.shutdown();
    coordinator.shutdown();
}

#[test]
pub fn rendezvous_gives_up_when_a_peer_never_dials() {
    let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();

    let deadline = Instant::now() + Duration::from_millis(200);
    let error = tcp::accept_deadline(&listener, deadline).unwrap_err();

    assert!(matches!(error, CommError::Rendezvous(_)));
}

#[test]
pub fn rendezvous_accepts_a_peer_inside_the_window() {
    let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
    let addr = listener.local_addr().unwrap();

    let dialer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        TcpStream::connect(addr).unwrap()
    });

    let deadline = Instant::now() + Duration::from_secs(10);
    let (stream, peer) = tcp::accept_deadline(&listener, deadline).unwrap();
    let dialed = dialer.join().unwrap();

    assert_eq!(peer, dialed.local_addr().unwrap());
    assert_eq!(stream.peer_addr().unwrap(), peer);
}
