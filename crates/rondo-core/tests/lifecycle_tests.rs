//! Lives in its own binary: it counts the process's `rondo-worker` threads,
//! so no other server may run alongside it.
#![cfg(target_os = "linux")]

use std::time::Duration;

use rondo_core::Server;

fn named_worker_threads() -> usize {
    std::fs::read_dir("/proc/self/task")
        .unwrap()
        .filter_map(|task| std::fs::read_to_string(task.ok()?.path().join("comm")).ok())
        .filter(|comm| comm.trim_end() == "rondo-worker")
        .count()
}

#[test]
fn test_wait_until_stopped_outlives_every_worker() {
    for _ in 0..50 {
        let server = Server::bind("lifecycle", "", "127.0.0.1:0".parse().unwrap()).unwrap();
        server.run(8).unwrap();
        server.stop();
        server.wait_until_stopped();

        // An exited thread stays listed only until the kernel reaps it.
        let mut lingering = named_worker_threads();
        for _ in 0..10 {
            if lingering == 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
            lingering = named_worker_threads();
        }
        assert_eq!(lingering, 0);
    }
}
