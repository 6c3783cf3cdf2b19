//! Hands files to a running Tracker over the loopback bridge.
//!
//! With no instance listening, this process becomes the serving instance and
//! prints each request it receives.

use anyhow::Result;
use clap::Parser;
use crossbeam_channel::{unbounded, RecvTimeoutError};
use env_logger::Env;
use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use tracker_starter::osp_socket::{self, Handoff, SocketMessage, SocketSession, POLL_INTERVAL};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Loopback port of the serving instance
    #[arg(long, default_value_t = osp_socket::DEFAULT_PORT)]
    port: u16,
    /// After handing off, keep forwarding each path read from stdin
    #[arg(long, default_value_t = false)]
    forward: bool,
    /// Serve immediately instead of looking for a running instance
    #[arg(long, default_value_t = false)]
    serve: bool,
    /// Files to open
    files: Vec<PathBuf>,
}

fn print_message(message: &SocketMessage) {
    match message {
        SocketMessage::Open(paths) => {
            for path in paths {
                println!("open {}", path.display());
            }
        }
        SocketMessage::Text(text) => println!("{}", text),
    }
}

fn run_server(session: &SocketSession, running: &AtomicBool) {
    let inbox = session.subscribe();
    println!("Serving on 127.0.0.1:{} (Ctrl-C to stop)", session.port());
    while running.load(Ordering::SeqCst) && !session.is_terminated() {
        match inbox.recv_timeout(POLL_INTERVAL) {
            Ok(message) => print_message(&message),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

fn forward_stdin(session: &SocketSession, running: &AtomicBool) -> Result<()> {
    let pushed = session.subscribe();
    let (tx, lines) = unbounded::<String>();
    thread::spawn(move || {
        for line in io::stdin().lock().lines().map_while(Result::ok) {
            if tx.send(line).is_err() {
                break;
            }
        }
    });

    while running.load(Ordering::SeqCst) && !session.is_terminated() {
        while let Ok(message) = pushed.try_recv() {
            print_message(&message);
        }
        match lines.recv_timeout(POLL_INTERVAL) {
            Ok(line) => {
                let path = line.trim();
                if !path.is_empty() {
                    session.open_files(&[PathBuf::from(path)])?;
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    Ok(())
}

/// Flag cleared by Ctrl-C. Without a handler the flag stays set and the
/// default signal behaviour applies.
fn install_interrupt_flag() -> Arc<AtomicBool> {
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    if let Err(e) = ctrlc::set_handler(move || r.store(false, Ordering::SeqCst)) {
        log::warn!(target: "tracker_open", "cannot install Ctrl-C handler: {}", e);
    }
    running
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let running = install_interrupt_flag();

    if args.serve {
        let session = SocketSession::serve(args.port)?;
        run_server(&session, &running);
        return Ok(());
    }

    match osp_socket::hand_off_or_serve(args.port, &args.files)? {
        Handoff::Delivered(session) => {
            println!("Handed {} file(s) to the instance on port {}", args.files.len(), session.port());
            if args.forward {
                forward_stdin(&session, &running)?;
            }
        }
        Handoff::Serving(session) => {
            for file in &args.files {
                println!("open {}", file.display());
            }
            run_server(&session, &running);
        }
    }
    Ok(())
}
