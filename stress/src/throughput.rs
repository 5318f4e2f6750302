use num_format::{Locale, ToFormattedString};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

const SLIDING_WINDOW_SIZE: u64 = 2; // In seconds
const BATCH_SIZE: u64 = 1000;

static STOP: AtomicBool = AtomicBool::new(false);

// One cache line per worker, so counters of neighbouring workers do not
// share a line.
#[repr(C)]
#[derive(Default)]
struct WorkerStats {
    count: AtomicU64,
    padding: [u64; 15],
}

/// Runs `func` in a loop on every physical core but one until Ctrl-C, and
/// prints the combined rate every few seconds. `func` receives the index of
/// the worker calling it.
pub fn test_throughput<F>(func: F)
where
    F: Fn(usize) + Sync + Send + 'static,
{
    if let Err(err) = ctrlc::set_handler(move || {
        STOP.store(true, Ordering::SeqCst);
    }) {
        eprintln!("Error setting Ctrl-C handler: {err}");
        return;
    }

    let num_threads = num_cpus::get_physical().max(2);
    println!("Number threads: {}", num_threads);
    let func = Arc::new(func);
    let worker_stats: Arc<Vec<WorkerStats>> =
        Arc::new((0..num_threads).map(|_| WorkerStats::default()).collect());

    let mut handles = Vec::with_capacity(num_threads);
    let monitor_stats = Arc::clone(&worker_stats);
    handles.push(thread::spawn(move || {
        let mut start_time = Instant::now();
        let mut total_count_old: u64 = 0;
        while !STOP.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(500));
            let elapsed = start_time.elapsed();
            if elapsed.as_secs() >= SLIDING_WINDOW_SIZE {
                let total_count: u64 = monitor_stats
                    .iter()
                    .map(|stats| stats.count.load(Ordering::Relaxed))
                    .sum();
                let throughput = (total_count - total_count_old) as f64 / elapsed.as_secs_f64();
                total_count_old = total_count;
                println!(
                    "Throughput: {} iterations/sec",
                    (throughput as u64).to_formatted_string(&Locale::en)
                );
                start_time = Instant::now();
            }
        }
    }));

    for thread_index in 0..num_threads - 1 {
        let worker_stats = Arc::clone(&worker_stats);
        let func = Arc::clone(&func);
        handles.push(thread::spawn(move || {
            while !STOP.load(Ordering::SeqCst) {
                for _ in 0..BATCH_SIZE {
                    func(thread_index);
                }
                worker_stats[thread_index]
                    .count
                    .fetch_add(BATCH_SIZE, Ordering::Relaxed);
            }
        }));
    }

    for handle in handles {
        let _ = handle.join();
    }
}
