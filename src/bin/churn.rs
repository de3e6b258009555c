use genset::{FastConcurrent, ThreadData};

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

fn main() {
    const NUM_THREADS: usize = 16;

    let keep_running = Arc::new(AtomicBool::new(true));
    let mut set = FastConcurrent::<u64>::new();
    set.set_size(1024 * 1024);
    let set = Arc::new(set);

    let threads: Vec<_> = (0..NUM_THREADS as u64)
        .map(|thread_index| {
            let keep_running = keep_running.clone();
            let set = set.clone();

            thread::spawn(move || {
                let mut td = ThreadData::default();
                let mut view = set.with_td(&mut td);
                let mut next = thread_index;

                while keep_running.load(Ordering::Relaxed) {
                    view.insert(next);
                    next = next.wrapping_add(NUM_THREADS as u64) & ((1 << 22) - 1);
                }
            })
        })
        .collect();

    thread::sleep(Duration::from_secs(5));
    keep_running.store(false, Ordering::Relaxed);

    for result in threads.into_iter().map(|t| t.join()) {
        assert!(result.is_ok());
    }

    println!("final table size: {}", set.size());
}
