mod backup;
mod db;
mod docx;
mod ipc;
mod period;
mod reports;
mod stats;
mod tags;

use std::io::{self, BufRead, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn main() {
    let shutdown = Arc::new(AtomicBool::new(false));

    let worker = {
        let shutdown = shutdown.clone();
        std::thread::spawn(move || {
            let mut state = ipc::AppState::new(shutdown.clone());
            let stdin = io::stdin();
            let mut stdout = io::stdout();

            for line in stdin.lock().lines() {
                let line = match line {
                    Ok(v) => v,
                    Err(_) => break,
                };
                if line.trim().is_empty() {
                    continue;
                }

                let req: ipc::Request = match serde_json::from_str(&line) {
                    Ok(v) => v,
                    Err(e) => {
                        // Can't reply with an id we never parsed.
                        let _ = writeln!(
                            stdout,
                            "{{\"ok\":false,\"error\":{{\"code\":\"bad_json\",\"message\":\"{}\"}}}}",
                            e
                        );
                        let _ = stdout.flush();
                        continue;
                    }
                };

                let resp = ipc::handle_request(&mut state, req);
                let _ = writeln!(
                    stdout,
                    "{}",
                    serde_json::to_string(&resp).unwrap_or_else(|_| "{\"ok\":false}".to_string())
                );
                let _ = stdout.flush();

                // The shutdown reply above has already gone out; stop reading.
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
            }
            shutdown.store(true, Ordering::SeqCst);
        })
    };

    while !shutdown.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(500));
    }
    // Give the worker a moment to flush; stdin may still be blocking it.
    for _ in 0..10 {
        if worker.is_finished() {
            let _ = worker.join();
            return;
        }
        std::thread::sleep(Duration::from_millis(500));
    }
}
