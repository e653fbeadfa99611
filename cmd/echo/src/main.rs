//! shardnet echo server
//!
//! Echoes every `\n`-terminated line back to the client. `quit` closes the
//! connection from the server side.
//!
//! Usage:
//!     cargo build --release -p shardnet-echo
//!     SHARDNET_ADDR=0.0.0.0:9999 SHARDNET_SHARDS=4 ./target/release/shardnet-echo
//!
//! All `SHARDNET_*` variables are read (see `ServerConfig::from_env`);
//! `SHARDNET_LOG_LEVEL=info` shows startup and shutdown.
//!
//! Test with:
//!     echo "hello" | nc -q1 localhost 9999
//!     for i in $(seq 1 100); do echo "ping $i" | nc -q1 localhost 9999 & done

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use shardnet::{kerror, kinfo, Codec, CodecHandler, Conn, DecodeError, LineDelimited, Server, ServerConfig};

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_sigint(_: libc::c_int) {
    RUNNING.store(false, Ordering::SeqCst);
}

fn echo(codec: &LineDelimited, conn: &Arc<Conn>, line: Option<Vec<u8>>, err: Option<DecodeError>) {
    if let Some(err) = err {
        kinfo!("conn {}: {}", conn.id(), err);
        let _ = conn.close();
        return;
    }
    let Some(line) = line else { return };
    if line == b"quit" {
        let _ = conn.close();
        return;
    }
    let mut out = Vec::with_capacity(line.len() + 1);
    codec.encode(&line, &mut out);
    let _ = conn.write(&out);
}

fn main() {
    // SIGINT/SIGTERM stop the server
    unsafe {
        libc::signal(libc::SIGINT, handle_sigint as usize);
        libc::signal(libc::SIGTERM, handle_sigint as usize);
    }

    let config = ServerConfig::from_env();
    let handler = CodecHandler::new(LineDelimited::default(), echo);
    let server = match Server::new(config, handler) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            kerror!("shardnet-echo: {}", e);
            std::process::exit(1);
        }
    };

    server.set_pre_serving(|s| {
        eprintln!(
            "shardnet-echo: listening on {} ({} shards, balance {})",
            s.listener_addr(),
            s.shard_count(),
            s.config().balance
        );
        Ok(())
    });

    let watcher = {
        let server = Arc::clone(&server);
        thread::spawn(move || {
            while RUNNING.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(100));
            }
            server.stop();
        })
    };

    if let Err(e) = server.serve() {
        kerror!("shardnet-echo: {}", e);
        RUNNING.store(false, Ordering::SeqCst);
    }
    RUNNING.store(false, Ordering::SeqCst);
    let _ = watcher.join();
    eprintln!("shardnet-echo: stopped");
}
