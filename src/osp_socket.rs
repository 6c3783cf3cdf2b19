//! Loopback bridge between a running Tracker and later invocations.
//!
//! The primary instance serves on `127.0.0.1:<port>` and accepts a single
//! client. A client announces itself with `ready` and then sends
//! `open: <path><sep><path>...` requests. Each message goes out as its raw
//! bytes with no terminator; the receiver reads up to `FRAME_SIZE` bytes at a
//! time and treats each read as one message, trimming NUL and whitespace.
//!
//! The listener stays bound for the life of the session so no other instance
//! can take over the port. Further clients are accepted and closed at once.

use anyhow::{anyhow, bail, Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::io::{ErrorKind, Read, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 12321;
pub const FRAME_SIZE: usize = 1024;
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const READY_TOKEN: &str = "ready";
pub const OPEN_PREFIX: &str = "open:";
pub const PATH_SEPARATOR: char = if cfg!(windows) { ';' } else { ':' };
const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketMessage {
    /// Files the peer wants opened.
    Open(Vec<PathBuf>),
    Text(String),
}

/// Wire bytes of `message`. Messages longer than one read buffer are rejected.
pub fn encode_frame(message: &str) -> Result<&[u8]> {
    let bytes = message.as_bytes();
    if bytes.len() > FRAME_SIZE {
        bail!("message of {} bytes exceeds the {}-byte frame", bytes.len(), FRAME_SIZE);
    }
    Ok(bytes)
}

pub fn decode_frame(frame: &[u8]) -> String {
    let end = frame.iter().position(|&b| b == 0).unwrap_or(frame.len());
    String::from_utf8_lossy(&frame[..end]).trim_end().to_string()
}

pub fn open_command(paths: &[PathBuf]) -> String {
    let joined: Vec<String> = paths.iter().map(|p| p.to_string_lossy().into_owned()).collect();
    format!("{} {}", OPEN_PREFIX, joined.join(&PATH_SEPARATOR.to_string()))
}

pub fn parse_message(text: &str) -> SocketMessage {
    match text.strip_prefix(OPEN_PREFIX) {
        Some(rest) => SocketMessage::Open(
            rest.split(PATH_SEPARATOR)
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(PathBuf::from)
                .collect(),
        ),
        None => SocketMessage::Text(text.to_string()),
    }
}

struct SessionState {
    role: Role,
    port: u16,
    connected: AtomicBool,
    ready: AtomicBool,
    terminated: AtomicBool,
    subscribers: Mutex<Vec<Sender<SocketMessage>>>,
    writer: Mutex<Option<TcpStream>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SessionState {
    fn new(role: Role, port: u16) -> Self {
        Self {
            role,
            port,
            connected: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            subscribers: Mutex::new(Vec::new()),
            writer: Mutex::new(None),
        }
    }

    fn terminate(&self) {
        if !self.terminated.swap(true, Ordering::SeqCst) {
            log::debug!(target: "osp_socket", "{:?} session on port {} terminated", self.role, self.port);
        }
        if let Some(stream) = lock(&self.writer).take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    fn write_frame(&self, message: &str) -> Result<()> {
        let frame = encode_frame(message)?;
        let mut writer = lock(&self.writer);
        let stream = writer.as_mut().ok_or_else(|| anyhow!("no peer connected"))?;
        if let Err(e) = stream.write_all(frame).and_then(|_| stream.flush()) {
            drop(writer);
            self.terminate();
            return Err(e).context("socket write failed");
        }
        Ok(())
    }

    fn publish(&self, message: SocketMessage) {
        lock(&self.subscribers).retain(|tx| tx.send(message.clone()).is_ok());
    }

    fn handle_frame(&self, frame: &[u8]) {
        let text = decode_frame(frame);
        if text.is_empty() {
            return;
        }
        let mut text = text.as_str();
        if self.role == Role::Server {
            if let Some(rest) = text.strip_prefix(READY_TOKEN) {
                if self
                    .ready
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    log::info!(target: "osp_socket", "client ready on port {}", self.port);
                }
                // a request written right after `ready` can arrive in the same read
                text = rest.trim_start();
                if text.is_empty() {
                    return;
                }
            }
            if !self.ready.load(Ordering::SeqCst) {
                log::debug!(target: "osp_socket", "dropping message before ready: {}", text);
                return;
            }
        }
        log::debug!(target: "osp_socket", "received: {}", text);
        self.publish(parse_message(text));
    }
}

/// Closes any client beyond the first.
fn refuse_extra_clients(listener: &TcpListener) {
    while let Ok((extra, peer)) = listener.accept() {
        log::warn!(target: "osp_socket", "refusing second client from {}", peer);
        let _ = extra.shutdown(Shutdown::Both);
    }
}

/// Handles one message per read until EOF, an I/O error or termination.
fn poll_frames(state: Arc<SessionState>, mut stream: TcpStream, listener: Option<TcpListener>) {
    if let Err(e) = stream.set_read_timeout(Some(POLL_INTERVAL)) {
        log::warn!(target: "osp_socket", "cannot set read timeout: {}", e);
        state.terminate();
        return;
    }
    let mut buffer = [0u8; FRAME_SIZE];
    while !state.terminated.load(Ordering::SeqCst) {
        match stream.read(&mut buffer) {
            Ok(0) => {
                log::debug!(target: "osp_socket", "peer closed the connection");
                break;
            }
            Ok(n) => state.handle_frame(&buffer[..n]),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted) => {}
            Err(e) => {
                log::debug!(target: "osp_socket", "read failed: {}", e);
                break;
            }
        }
        if let Some(listener) = &listener {
            refuse_extra_clients(listener);
        }
    }
    state.terminate();
}

fn accept_one(state: Arc<SessionState>, listener: TcpListener) {
    let stream = loop {
        if state.terminated.load(Ordering::SeqCst) {
            return;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                log::info!(target: "osp_socket", "client connected from {}", peer);
                break stream;
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(POLL_INTERVAL),
            Err(e) => {
                log::warn!(target: "osp_socket", "accept failed: {}", e);
                state.terminate();
                return;
            }
        }
    };
    let writer = stream.set_nonblocking(false).and_then(|_| stream.try_clone());
    match writer {
        Ok(writer) => {
            *lock(&state.writer) = Some(writer);
            state.connected.store(true, Ordering::SeqCst);
            poll_frames(state, stream, Some(listener));
        }
        Err(e) => {
            log::warn!(target: "osp_socket", "cannot prepare client stream: {}", e);
            state.terminate();
        }
    }
}

pub struct SocketSession {
    state: Arc<SessionState>,
    poller: Option<JoinHandle<()>>,
}

impl SocketSession {
    /// Listens on the loopback port and serves the first client that connects.
    /// Port 0 picks a free port; see `port()`.
    pub fn serve(port: u16) -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port))
            .with_context(|| format!("cannot listen on port {}", port))?;
        let port = listener.local_addr()?.port();
        listener.set_nonblocking(true)?;
        log::info!(target: "osp_socket", "serving on 127.0.0.1:{}", port);

        let state = Arc::new(SessionState::new(Role::Server, port));
        let thread_state = state.clone();
        let poller = thread::Builder::new()
            .name("osp-socket-server".into())
            .spawn(move || accept_one(thread_state, listener))?;
        Ok(Self {
            state,
            poller: Some(poller),
        })
    }

    /// Connects to a serving instance and announces readiness.
    pub fn connect(port: u16) -> Result<Self> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
            .with_context(|| format!("no server on port {}", port))?;
        let reader = stream.try_clone()?;

        let state = Arc::new(SessionState::new(Role::Client, port));
        *lock(&state.writer) = Some(stream);
        state.connected.store(true, Ordering::SeqCst);
        state.write_frame(READY_TOKEN)?;
        state.ready.store(true, Ordering::SeqCst);
        log::info!(target: "osp_socket", "connected to 127.0.0.1:{}", port);

        let thread_state = state.clone();
        let poller = thread::Builder::new()
            .name("osp-socket-client".into())
            .spawn(move || poll_frames(thread_state, reader, None))?;
        Ok(Self {
            state,
            poller: Some(poller),
        })
    }

    /// Receives every message that arrives after this call.
    pub fn subscribe(&self) -> Receiver<SocketMessage> {
        let (tx, rx) = unbounded();
        lock(&self.state.subscribers).push(tx);
        rx
    }

    pub fn send(&self, message: &str) -> Result<()> {
        if self.is_terminated() {
            bail!("session on port {} is terminated", self.state.port);
        }
        if !self.is_ready() {
            bail!("client on port {} is not ready", self.state.port);
        }
        self.state.write_frame(message)
    }

    pub fn open_files(&self, paths: &[PathBuf]) -> Result<()> {
        self.send(&open_command(paths))
    }

    pub fn terminate(&self) {
        self.state.terminate();
    }

    pub fn role(&self) -> Role {
        self.state.role
    }

    pub fn port(&self) -> u16 {
        self.state.port
    }

    pub fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    pub fn is_ready(&self) -> bool {
        self.state.ready.load(Ordering::SeqCst)
    }

    pub fn is_terminated(&self) -> bool {
        self.state.terminated.load(Ordering::SeqCst)
    }
}

impl Drop for SocketSession {
    fn drop(&mut self) {
        self.state.terminate();
        if let Some(poller) = self.poller.take() {
            let _ = poller.join();
        }
    }
}

pub enum Handoff {
    /// Another instance is serving and received the files.
    Delivered(SocketSession),
    /// No instance was serving; this one now is.
    Serving(SocketSession),
}

/// Hands `paths` to a running instance, or becomes the serving instance.
pub fn hand_off_or_serve(port: u16, paths: &[PathBuf]) -> Result<Handoff> {
    match SocketSession::connect(port) {
        Ok(session) => {
            if !paths.is_empty() {
                session.open_files(paths)?;
            }
            Ok(Handoff::Delivered(session))
        }
        Err(e) => {
            log::debug!(target: "osp_socket", "{:#}", e);
            Ok(Handoff::Serving(SocketSession::serve(port)?))
        }
    }
}
