//! Detaching a group reader releases every slot it still pins, on every
//! queue in its group.

use std::sync::Arc;
use std::time::Duration;

use routemon::queue::{
    ManualClock, PacingConfig, PacingPolicy, Queue, QueueReader, WaitGroup,
};

fn queue(name: &str, clock: &Arc<ManualClock>, group: &Arc<WaitGroup>) -> Arc<Queue<Vec<u8>>> {
    Queue::with_capacity(
        name,
        64,
        PacingPolicy::FfJump,
        PacingConfig {
            on_thresh: 2.0,
            off_thresh: 1.0,
            ..PacingConfig::default()
        },
        Arc::clone(clock) as Arc<dyn routemon::queue::Clock>,
        Arc::clone(group),
    )
}

#[test]
fn detach_releases_pinned_items_on_both_queues() {
    let clock = Arc::new(ManualClock::new(1000));
    let group = WaitGroup::new();
    let q1 = queue("q1", &clock, &group);
    let q2 = queue("q2", &clock, &group);

    let w1 = q1.add_writer().unwrap();
    let w2 = q2.add_writer().unwrap();
    let reader = QueueReader::subscribe(&[q1.clone(), q2.clone()]).unwrap();

    for i in 0..10u8 {
        w1.write(vec![i]).unwrap();
    }
    for i in 0..5u8 {
        w2.write(vec![i]).unwrap();
    }
    assert_eq!(q1.stats().unwrap().items, 10);
    assert_eq!(q2.stats().unwrap().items, 5);

    // The reader was the only subscriber, so dropping it frees all ten
    // pending items on q1 and all five on q2.
    drop(reader);
    assert_eq!(q1.stats().unwrap().items, 0);
    assert_eq!(q2.stats().unwrap().items, 0);
    assert_eq!(q1.stats().unwrap().readers, 0);
    assert_eq!(q2.stats().unwrap().readers, 0);
}

#[test]
fn detach_leaves_other_readers_intact() {
    let clock = Arc::new(ManualClock::new(1000));
    let group = WaitGroup::new();
    let q = queue("q", &clock, &group);
    let w = q.add_writer().unwrap();

    let keeper = q.add_reader().unwrap();
    let leaver = q.add_reader().unwrap();

    for i in 0..8u8 {
        w.write(vec![i]).unwrap();
    }
    drop(leaver);

    // All eight items are still pending for the surviving reader.
    assert_eq!(q.stats().unwrap().items, 8);
    let mut keeper = keeper;
    keeper.set_tick(Duration::from_millis(10));
    let mut seen = 0;
    while seen < 8 {
        let batch = keeper.read().unwrap().unwrap();
        seen += batch.into_iter().flatten().count();
    }
    assert_eq!(q.stats().unwrap().items, 0);
}
