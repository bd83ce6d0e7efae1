//! Opening and closing many connections must not leak OS handles.
//! Runs as its own test binary so no other test opens files meanwhile.
#![cfg(target_os = "linux")]

use std::{fs, net::TcpListener, thread};

use conduit_client::{TransportClient, LOCALHOST_V4};
use conduit_common::{Transport, TransportConfig};

const CONNECTIONS: usize = 10_000;

fn open_fds() -> usize {
    fs::read_dir("/proc/self/fd").unwrap().count()
}

#[test]
fn open_close_cycles_leave_handle_count_unchanged() {
    let before = open_fds();

    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let acceptor = thread::spawn(move || {
        for _ in 0..CONNECTIONS {
            let (socket, _) = listener.accept().unwrap();
            drop(socket);
        }
    });

    let client = TransportClient::new(Transport::new(TransportConfig::default()), None);
    for _ in 0..CONNECTIONS {
        let conn = client.open(LOCALHOST_V4, port, false).unwrap();
        conn.close().unwrap();
    }
    acceptor.join().unwrap();

    assert_eq!(client.transport().live_count(), 0);
    assert_eq!(open_fds(), before);
}
