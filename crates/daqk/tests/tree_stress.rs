//! Concurrent mutation and enumeration of one child list.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use daqk::Node;

const ROUNDS: usize = 10_000;

#[test]
fn concurrent_add_remove_and_snapshot() {
    let root = Node::create("Root");
    let done = Arc::new(AtomicBool::new(false));

    let writers: Vec<_> = (0..2)
        .map(|w| {
            let root = root.clone();
            thread::spawn(move || {
                for n in 0..ROUNDS {
                    let child = Node::create(format!("w{w}-{n}"));
                    assert!(root.core().unwrap().add_child(child.clone().erase()));
                    assert!(root.core().unwrap().remove_child(child.get().unwrap(), false));
                }
            })
        })
        .collect();

    let reader = {
        let root = root.clone();
        let done = done.clone();
        thread::spawn(move || {
            let mut scans = 0usize;
            while !done.load(Ordering::Acquire) {
                let snapshot = root.core().unwrap().child_refs();
                let mut seen = HashSet::new();
                for child in snapshot.iter() {
                    assert!(!child.is_null());
                    assert!(seen.insert(child.name()), "duplicate child {}", child.name());
                }
                assert!(snapshot.len() <= 2);
                scans += 1;
            }
            scans
        })
    };

    for writer in writers {
        writer.join().unwrap();
    }
    done.store(true, Ordering::Release);
    assert!(reader.join().unwrap() > 0);
    assert_eq!(root.core().unwrap().num_children(), 0);
    assert_eq!(root.num_references(), 1);
}
