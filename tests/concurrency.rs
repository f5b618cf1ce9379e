//! Cross-thread stress for the lock and bus primitives: these run on
//! real host threads, the same atomics the modeled CPUs share.

use courier_os::bus::{Bus, Message, MsgBody};
use courier_os::sync::{Party, Spinlock};
use courier_os::Tid;
use std::sync::Arc;
use std::thread;

#[test]
fn spinlock_ping_pong_never_loses_an_update() {
    let lock = Arc::new(Spinlock::new((0u64, 0u64)));
    let mut handles = Vec::new();
    for party in [Party::A, Party::B] {
        let lock = Arc::clone(&lock);
        handles.push(thread::spawn(move || {
            for _ in 0..20_000 {
                let mut g = lock.lock(party);
                // Both fields must always agree; a torn critical
                // section would desynchronize them.
                assert_eq!(g.0, g.1);
                g.0 += 1;
                g.1 += 1;
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    let g = lock.lock(Party::A);
    assert_eq!(*g, (40_000, 40_000));
}

#[test]
fn bus_request_reply_cycle_under_threads() {
    // One "worker" thread sends requests; the test thread plays the
    // manager, echoing each request's tid back as a response code.
    let bus = Arc::new(Bus::new(2));
    let n = 500;

    let worker = {
        let bus = Arc::clone(&bus);
        thread::spawn(move || {
            let mut got = Vec::new();
            let mut sent = 0;
            while got.len() < n {
                // Cap the outstanding window well under the mailbox
                // capacity.
                if sent < n && sent - got.len() < 64 {
                    bus.worker_send(Message {
                        req_tid: Tid(sent as i32),
                        req_cpu: 1,
                        body: MsgBody::Getchar,
                    });
                    sent += 1;
                }
                while let Some(m) = bus.worker_recv(1) {
                    match m.body {
                        MsgBody::Response { code } => got.push(code),
                        _ => panic!("unexpected reply"),
                    }
                }
            }
            got
        })
    };

    let mut answered = 0;
    while answered < n {
        if let Some(m) = bus.manager_recv() {
            let code = m.req_tid.0;
            bus.manager_send(1, Message {
                req_tid: m.req_tid,
                req_cpu: 1,
                body: MsgBody::Response { code },
            });
            answered += 1;
        } else {
            std::hint::spin_loop();
        }
    }

    let got = worker.join().unwrap();
    // Replies arrive in request order, none dropped or duplicated.
    assert_eq!(got, (0..n as i32).collect::<Vec<_>>());
}

#[test]
fn boot_barrier_releases_all_cpus_together() {
    use std::sync::atomic::{AtomicUsize, Ordering};

    let bus = Arc::new(Bus::new(8));
    let past = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for _ in 0..8 {
        let bus = Arc::clone(&bus);
        let past = Arc::clone(&past);
        handles.push(thread::spawn(move || {
            bus.synchronize_arrive();
            bus.wait_synchronized(8);
            past.fetch_add(1, Ordering::SeqCst);
        }));
    }
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(past.load(Ordering::SeqCst), 8);
}
