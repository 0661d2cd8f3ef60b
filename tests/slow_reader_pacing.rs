//! A writer far outpacing a slow reader must never see a rejected write
//! and never push the queue past capacity; the pacing policy absorbs the
//! overload by dropping for the laggard.

use std::sync::Arc;
use std::time::Duration;

use routemon::queue::{
    Clock, ManualClock, PacingConfig, PacingPolicy, Queue, WaitGroup,
};

#[test]
fn overloaded_ff_jump_queue_never_rejects_and_stays_bounded() {
    let clock = Arc::new(ManualClock::new(1000));
    let capacity = 50;
    let q: Arc<Queue<Vec<u8>>> = Queue::with_capacity(
        "overload",
        capacity,
        PacingPolicy::FfJump,
        // Tight interval; the manual clock rolls it between bursts so
        // the writer's budget pause stays at zero wall time.
        PacingConfig::default(),
        Arc::clone(&clock) as Arc<dyn Clock>,
        WaitGroup::new(),
    );
    let w = q.add_writer().unwrap();
    let mut r = q.add_reader().unwrap();
    r.set_tick(Duration::from_millis(10));

    let mut read_total = 0u64;
    let mut rejected = 0u64;
    for burst in 0..100u32 {
        // 10 writes against 1 read: a 10x overload. The clock advances
        // past the interval with every write, so the writer's budget
        // pause always computes to zero wall time.
        for i in 0..10u8 {
            clock.advance(2);
            match w.write(vec![burst as u8, i]) {
                Ok(_) => {}
                Err(_) => rejected += 1,
            }
            let stats = q.stats().unwrap();
            assert!(
                stats.items <= capacity as u64,
                "occupancy {} exceeded capacity",
                stats.items
            );
        }
        if q.stats().unwrap().items > 0 {
            let batch = r.read().unwrap().unwrap();
            read_total += batch.into_iter().flatten().count() as u64;
        }
    }

    assert_eq!(rejected, 0, "pacing must absorb overload, not reject writes");
    assert!(read_total >= 90, "slow reader starved: read {read_total}");
    let stats = q.stats().unwrap();
    assert!(stats.pacing_on_count >= 1, "pacing never engaged");
    assert!(stats.items <= capacity as u64);
}
