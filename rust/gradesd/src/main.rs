mod autosave;
mod calc;
mod config;
mod context;
mod db;
mod grade;
mod ipc;
mod pending;
mod session;
mod store;
mod telemetry;
mod validate;

use std::io::{self, BufRead, Write};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;

use tracing::{error, info};

fn write_line(stdout: &mut io::Stdout, value: &serde_json::Value) {
    let _ = writeln!(
        stdout,
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{\"ok\":false}".to_string())
    );
    let _ = stdout.flush();
}

fn handle_line(state: &mut ipc::AppState, stdout: &mut io::Stdout, line: &str) {
    if line.trim().is_empty() {
        return;
    }
    let req: ipc::Request = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(e) => {
            // Can't reply without id.
            write_line(
                stdout,
                &serde_json::json!({
                    "ok": false,
                    "error": { "code": "bad_json", "message": e.to_string() }
                }),
            );
            return;
        }
    };
    let resp = ipc::handle_request(state, req);
    write_line(stdout, &resp);
}

fn main() {
    telemetry::init_tracing();

    let config = config::Config::load();
    info!(
        autosave_delay_ms = config.autosave_delay_ms,
        saved_display_ms = config.saved_display_ms,
        "gradesd starting"
    );
    let mut state = ipc::AppState::new(config);
    if let Some(ws) = state.config.workspace.clone() {
        if let Err(e) = ipc::open_workspace(&mut state, &ws) {
            error!(workspace = %ws.display(), error = ?e, "could not open start-up workspace");
        }
    }

    // stdin is read on its own thread so the loop can also wake for timers.
    let (tx, rx) = mpsc::channel::<String>();
    thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else {
                break;
            };
            if tx.send(line).is_err() {
                break;
            }
        }
    });

    let mut stdout = io::stdout();
    loop {
        let line = match ipc::next_wake(&state) {
            Some(wait) => match rx.recv_timeout(wait) {
                Ok(line) => Some(line),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => break,
            },
            None => match rx.recv() {
                Ok(line) => Some(line),
                Err(_) => break,
            },
        };

        if let Some(line) = line {
            handle_line(&mut state, &mut stdout, &line);
        }
        for ev in ipc::tick(&mut state) {
            write_line(&mut stdout, &ev);
        }
    }

    if let Some(mut session) = state.session.take() {
        session.close();
    }
    info!("stdin closed, exiting");
}
