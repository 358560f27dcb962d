// nalixd is a nalix runtime server accepting and serving peer connections.
// Copyright (C) 2024  Himbeer <himbeerserverde@gmail.com>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

mod error;
use error::*;

use nalix_core::buffer::BufferPool;
use nalix_core::cipher::Suite;
use nalix_core::config::{RuntimeConfig, UserStore};
use nalix_core::hub::{Connection, ConnectionHub};
use nalix_core::wheel::TimingWheel;
use nalix_core::wire::{NalixServ, READ_TIMEOUT};
use nalix_core::NetworkError;

use std::io;
use std::net::TcpListener;
use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use clap::Parser;
use daemonizr::{Daemonizr, DaemonizrError, Stderr, Stdout};

const PWD: &str = "/";
const PIDFILE: &str = "/run/nalixd.pid";
const LOGFILE_STDOUT: &str = "/var/log/nalixd.out";
const LOGFILE_STDERR: &str = "/var/log/nalixd.err";

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
/// Background process accepting and serving nalix peer connections.
struct Args {
    /// Stay attached to the terminal instead of daemonizing.
    #[arg(short, long)]
    debug: bool,
}

fn main() {
    let args = Args::parse();

    if !args.debug {
        match Daemonizr::new()
            .work_dir(PathBuf::from(PWD))
            .expect("invalid workdir")
            .pidfile(PathBuf::from(PIDFILE))
            .stdout(Stdout::Redirect(PathBuf::from(LOGFILE_STDOUT)))
            .stderr(Stderr::Redirect(PathBuf::from(LOGFILE_STDERR)))
            .umask(0o027)
            .expect("invalid umask")
            .spawn()
        {
            Ok(_) => {}
            Err(DaemonizrError::AlreadyRunning) => {
                match Daemonizr::new()
                    .work_dir(PathBuf::from(PWD))
                    .unwrap()
                    .pidfile(PathBuf::from(PIDFILE))
                    .search()
                {
                    Ok(pid) => {
                        eprintln!("Another daemon with PID {} is already running", pid);
                        process::exit(1);
                    }
                    Err(e) => eprintln!("Daemonization PID search error: {}", e),
                }
            }
            Err(e) => {
                eprintln!("Daemonization error: {}", e);
                process::exit(1);
            }
        }
    }

    match serve() {
        Ok(_) => {}
        Err(e) => {
            eprintln!("Error: {}", e);
            process::exit(1);
        }
    }
}

fn serve() -> Result<()> {
    let should_exit = Arc::new(AtomicBool::new(false));
    let should_exit2 = Arc::clone(&should_exit);

    ctrlc::set_handler(move || {
        eprintln!("[info] Caught SIGINT, SIGTERM or SIGHUP, exiting");
        should_exit2.store(true, Ordering::SeqCst);
    })?;

    let config = RuntimeConfig::load().unwrap_or_else(|e| {
        eprintln!("[warn] no valid config at {}: {} (using defaults)", RuntimeConfig::PATH, e);
        RuntimeConfig::default()
    });
    let users = Arc::new(UserStore::load().unwrap_or_else(|e| {
        eprintln!("[warn] no valid user store at {}: {} (no accounts available)", UserStore::PATH, e);
        UserStore::default()
    }));

    let pool = BufferPool::with_capacity(config.max_connections as u64 * 4);
    let hub = ConnectionHub::new(&config);
    let wheel = TimingWheel::new(config.tick_duration_ms, config.wheel_size, config.tcp_idle_timeout_ms);
    wheel.activate()?;

    let next_id = Arc::new(AtomicU64::new(1));
    let client_threads = Arc::new(std::sync::Mutex::new(0u64));

    let listener = TcpListener::bind(config.bind_addr)?;
    listener.set_nonblocking(true)?;

    eprintln!("[info] <{}> Listening", config.bind_addr);

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let peer_addr = stream.peer_addr()?;

                *client_threads.lock().unwrap() += 1;

                let hub = Arc::clone(&hub);
                let wheel = Arc::clone(&wheel);
                let users = Arc::clone(&users);
                let pool = Arc::clone(&pool);
                let config = config.clone();
                let next_id = Arc::clone(&next_id);
                let client_threads = Arc::clone(&client_threads);

                thread::spawn(move || {
                    match handle_client(&hub, &wheel, &users, &pool, &config, &next_id, stream) {
                        Ok(_) => eprintln!("[info] <{}> Disconnected", peer_addr),
                        Err(e) => eprintln!("[warn] <{}> Cannot handle client: {}", peer_addr, e),
                    }

                    *client_threads.lock().unwrap() -= 1;
                });
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if should_exit.load(Ordering::SeqCst) {
                    break;
                } else {
                    thread::sleep(READ_TIMEOUT);
                }
            }
            Err(e) => return Err(e.into()),
        }
    }

    while *client_threads.lock().unwrap() > 0 {
        thread::sleep(READ_TIMEOUT);
    }

    hub.close_all();
    wheel.deactivate()?;

    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn handle_client(
    hub: &Arc<ConnectionHub>,
    wheel: &Arc<TimingWheel>,
    users: &Arc<UserStore>,
    pool: &Arc<nalix_core::buffer::BufferPool>,
    config: &RuntimeConfig,
    next_id: &Arc<AtomicU64>,
    stream: std::net::TcpStream,
) -> Result<()> {
    let peer_addr = stream.peer_addr()?;

    let auth_serv = NalixServ::from(stream);
    let (session, node_name) = auth_serv.authenticate(|name| users.find(name), Suite::ChaCha20Poly1305)?;
    let session = Arc::new(session);

    eprintln!("[info] <{}@{}> Authentication successful", node_name, peer_addr);

    let mut secret = [0u8; 32];
    let key = session.key();
    secret.copy_from_slice(&key[..32.min(key.len())]);

    let id = next_id.fetch_add(1, Ordering::AcqRel);
    let connection = Arc::new(Connection::new(id, peer_addr, secret, session.suite(), 0));

    {
        let session = Arc::clone(&session);
        let node_name = node_name.clone();
        connection.subscribe_close(move |_c, reason| {
            if let Err(e) = session.send_close(reason) {
                eprintln!("[warn] <{}@{}> Failed to send close frame: {}", node_name, peer_addr, e);
            }
        });
    }

    if !hub.register(Arc::clone(&connection)) {
        eprintln!("[warn] <{}@{}> Hub rejected connection (at capacity)", node_name, peer_addr);
        return Err(NetworkError::Remote(nalix_core::RemoteError::HubCapacityExceeded).into());
    }
    wheel.register(Arc::clone(&connection));

    if config.enable_trace_logs {
        eprintln!("[trace] <{}@{}> Registered as connection {}", node_name, peer_addr, id);
    }

    while !connection.is_closed() {
        match session.recv_packet(pool, config.stack_alloc_limit, config.heap_alloc_limit, config.packet_size_limit) {
            Ok(Some(packet)) => {
                connection.touch();
                // Demo echo: acknowledge receipt by sending the packet straight back.
                if let Err(e) = session.send_packet(&packet) {
                    eprintln!("[warn] <{}@{}> Send failed: {}", node_name, peer_addr, e);
                    break;
                }
            }
            Ok(None) => connection.touch(),
            Err(NetworkError::Bincode(ref bincode_err)) => match bincode_err.as_ref() {
                bincode::ErrorKind::Io(io_err)
                    if io_err.kind() == io::ErrorKind::WouldBlock || io_err.kind() == io::ErrorKind::TimedOut =>
                {
                    continue
                }
                bincode::ErrorKind::Io(io_err) if io_err.kind() == io::ErrorKind::UnexpectedEof => break,
                _ => {
                    eprintln!("[warn] <{}@{}> Framing error: {}", node_name, peer_addr, bincode_err);
                    break;
                }
            },
            Err(e) => {
                eprintln!("[warn] <{}@{}> Connection error: {}", node_name, peer_addr, e);
                break;
            }
        }
    }

    connection.close();

    Ok(())
}
