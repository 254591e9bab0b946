//! The dispatcher: one long-lived thread that owns every socket.
//!
//! Each work cycle waits on the socket set for at most one period, accepts
//! pending connections, then services the client list head to tail. All
//! parsing and every handler run on this thread; the only cross-task
//! entry point is [`Ember::select_clients`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::blob::{BlobSource, DiskBlobs};
use crate::config::{
    ProtocolConfig, DEFAULT_FILE_CHUNK_SIZE, DEFAULT_PERIOD, DEFAULT_RCV_BUFFER_SIZE,
    DEFAULT_SND_BUFFER_SIZE, DEFAULT_STARTUP_DELAY,
};
use crate::error::Error;
use crate::proto::h1::Routes;
use crate::proto::WorkContext;
use crate::transport::{Listener, Transport};

pub(crate) mod clients;

use self::clients::{Client, ClientHandle, ClientList};

/// Configures and starts an [`Ember`] server.
pub struct Builder {
    protocols: Vec<ProtocolConfig>,
    routes: Option<Routes>,
    blobs: Option<Arc<dyn BlobSource>>,
    startup_delay: Duration,
    period: Duration,
    rcv_buffer_size: usize,
    snd_buffer_size: usize,
    file_chunk_size: usize,
}

impl std::fmt::Debug for Builder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Builder")
            .field("protocols", &self.protocols)
            .field("period", &self.period)
            .finish()
    }
}

impl Builder {
    fn new() -> Builder {
        Builder {
            protocols: Vec::new(),
            routes: None,
            blobs: None,
            startup_delay: DEFAULT_STARTUP_DELAY,
            period: DEFAULT_PERIOD,
            rcv_buffer_size: DEFAULT_RCV_BUFFER_SIZE,
            snd_buffer_size: DEFAULT_SND_BUFFER_SIZE,
            file_chunk_size: DEFAULT_FILE_CHUNK_SIZE,
        }
    }

    /// Add an entry to the protocol table. At least one is required.
    pub fn protocol(mut self, protocol: ProtocolConfig) -> Self {
        self.protocols.push(protocol);
        self
    }

    /// Set the route table used by HTTP protocols.
    pub fn routes(mut self, routes: Routes) -> Self {
        self.routes = Some(routes);
        self
    }

    /// Set the blob source used by static-file responses. Defaults to the
    /// host filesystem rooted at the current directory.
    pub fn blobs(mut self, blobs: impl BlobSource + 'static) -> Self {
        self.blobs = Some(Arc::new(blobs));
        self
    }

    /// Delay between spawning the dispatcher and its first work cycle
    /// (time for the network stack to come up; default 3 s).
    pub fn startup_delay(mut self, delay: Duration) -> Self {
        self.startup_delay = delay;
        self
    }

    /// The work-cycle period: the bound on the socket-set wait and the
    /// pacing of client service (default 10 ms).
    pub fn period(mut self, period: Duration) -> Self {
        self.period = period;
        self
    }

    /// Size of the shared receive buffer (default 2048). Bounds the
    /// largest request head and WebSocket frame.
    pub fn rcv_buffer_size(mut self, size: usize) -> Self {
        self.rcv_buffer_size = size;
        self
    }

    /// Size of the shared send buffer (default 2048). Bounds one response
    /// header block and the file-streaming block size.
    pub fn snd_buffer_size(mut self, size: usize) -> Self {
        self.snd_buffer_size = size;
        self
    }

    /// Fairness cap on bytes streamed per client per work cycle while
    /// sending a file (default 20480).
    pub fn file_chunk_size(mut self, size: usize) -> Self {
        self.file_chunk_size = size;
        self
    }

    /// Bind the protocol table's listeners on `transport` and start the
    /// dispatcher thread.
    pub fn serve(self, mut transport: impl Transport + 'static) -> crate::Result<Ember> {
        if self.protocols.is_empty() {
            return Err(Error::new_listen(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "protocol table is empty",
            )));
        }
        let routes = Arc::new(self.routes.unwrap_or_else(|| Routes::builder().build()));
        let blobs: Arc<dyn BlobSource> = self
            .blobs
            .unwrap_or_else(|| Arc::new(DiskBlobs::new(".")));

        let mut listeners = Vec::with_capacity(self.protocols.len());
        let mut ports = Vec::with_capacity(self.protocols.len());
        for proto in &self.protocols {
            let listener = transport.listen(proto.port, proto.backlog)?;
            ports.push(listener.local_port()?);
            debug!(port = ports.last().copied().unwrap_or(0), "listening");
            listeners.push(ProtoListener {
                listener,
                proto: proto.clone(),
            });
        }

        let shared = Arc::new(Shared {
            clients: Mutex::new(ClientList::new()),
            running: AtomicBool::new(true),
            period: self.period,
        });

        let run = Run {
            shared: Arc::clone(&shared),
            startup_delay: self.startup_delay,
            period: self.period,
            rcv_buffer_size: self.rcv_buffer_size,
            snd_buffer_size: self.snd_buffer_size,
            file_chunk_size: self.file_chunk_size,
            routes,
            blobs,
        };
        let thread = thread::Builder::new()
            .name("ember".to_owned())
            .spawn(move || run.dispatch(transport, listeners))
            .map_err(Error::new_listen)?;

        Ok(Ember {
            shared,
            thread: Some(thread),
            ports,
        })
    }
}

struct Shared {
    clients: Mutex<ClientList>,
    running: AtomicBool,
    period: Duration,
}

/// Handle to a running server.
///
/// Starting is idempotent through the builder; stopping is idempotent
/// through [`stop`](Ember::stop) and also happens on drop.
pub struct Ember {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
    ports: Vec<u16>,
}

impl std::fmt::Debug for Ember {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ember")
            .field("ports", &self.ports)
            .field("running", &self.shared.running.load(Ordering::Acquire))
            .finish()
    }
}

impl Ember {
    /// Start configuring a server.
    pub fn builder() -> Builder {
        Builder::new()
    }

    /// The bound port of the protocol table entry at `index`. Useful with
    /// port 0 (ephemeral) configurations.
    pub fn local_port(&self, index: usize) -> Option<u16> {
        self.ports.get(index).copied()
    }

    /// Ask the dispatcher to stop and wait for it. Safe to call more than
    /// once.
    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    /// Run `f` against every connected client, head to tail, under the
    /// client-list mutex. A client whose callback returns `Err` is dropped
    /// on the spot. May be called from any task; the mutex take is bounded
    /// by two dispatch periods and a timeout returns
    /// an error without touching the list. Clients accepted while the walk
    /// is in progress are not observed.
    pub fn select_clients<F>(&self, mut f: F) -> crate::Result<()>
    where
        F: FnMut(&mut Client) -> crate::Result<usize>,
    {
        let timeout = self.shared.period * 2;
        let Some(mut list) = self.shared.clients.try_lock_for(timeout) else {
            return Err(Error::new_select_timeout());
        };
        let mut at = 0;
        while at < list.len() {
            let handle = Arc::clone(list.get(at).expect("list shrank underneath the walk"));
            let mut client = handle.lock();
            if client.dead {
                drop(client);
                list.remove_at(at);
                continue;
            }
            match f(&mut client) {
                Ok(_) => {
                    at += 1;
                }
                Err(e) => {
                    debug!("select dropped client: {}", e);
                    client.shutdown();
                    drop(client);
                    list.remove_at(at);
                }
            }
        }
        Ok(())
    }
}

impl Drop for Ember {
    fn drop(&mut self) {
        self.stop();
    }
}

struct ProtoListener {
    listener: Box<dyn Listener>,
    proto: ProtocolConfig,
}

struct Run {
    shared: Arc<Shared>,
    startup_delay: Duration,
    period: Duration,
    rcv_buffer_size: usize,
    snd_buffer_size: usize,
    file_chunk_size: usize,
    routes: Arc<Routes>,
    blobs: Arc<dyn BlobSource>,
}

impl Run {
    fn dispatch(self, mut transport: impl Transport, mut listeners: Vec<ProtoListener>) {
        // Sleep out the startup delay in period-sized slices so stop()
        // during the delay is honored promptly.
        let mut waited = Duration::ZERO;
        while waited < self.startup_delay && self.shared.running.load(Ordering::Acquire) {
            let slice = self.period.min(self.startup_delay - waited).max(Duration::from_millis(1));
            thread::sleep(slice);
            waited += slice;
        }

        let mut rcv = vec![0u8; self.rcv_buffer_size].into_boxed_slice();
        let mut snd = vec![0u8; self.snd_buffer_size].into_boxed_slice();
        let mut scratch: Vec<ClientHandle> = Vec::new();

        while self.shared.running.load(Ordering::Acquire) {
            let ready = match transport.poll(self.period) {
                Ok(ready) => ready,
                Err(e) => {
                    // Socket-set errors are skipped for this cycle.
                    warn!("socket set poll failed: {}", e);
                    false
                }
            };

            // New clients first, then service the existing ones.
            if ready {
                for entry in &mut listeners {
                    self.accept_pending(entry);
                }
            }

            scratch.clear();
            scratch.extend(self.shared.clients.lock().iter().cloned());
            for handle in &scratch {
                let mut client = handle.lock();
                if client.dead {
                    drop(client);
                    self.shared.clients.lock().remove(handle);
                    continue;
                }
                if !client.conn.is_open() {
                    trace!("client socket dead; reaping");
                    drop(client);
                    self.remove_client(handle);
                    continue;
                }
                let mut cx = WorkContext {
                    rcv: &mut rcv,
                    snd: &mut snd,
                    routes: &self.routes,
                    blobs: &*self.blobs,
                    file_chunk_size: self.file_chunk_size,
                };
                match client.work(&mut cx) {
                    Ok(sent) => {
                        if sent > 0 {
                            trace!(sent, "client work");
                        }
                    }
                    Err(e) => {
                        debug!("dropping client: {}", e);
                        drop(client);
                        self.remove_client(handle);
                    }
                }
            }
        }
        debug!("dispatcher stopped");
    }

    /// Drain pending accepts on one listener. Accept failures are skipped
    /// silently; the listener stays registered.
    fn accept_pending(&self, entry: &mut ProtoListener) {
        loop {
            match entry.listener.accept() {
                Ok(Some(conn)) => self.accept_new_client(conn, &entry.proto),
                Ok(None) => return,
                Err(e) => {
                    trace!("accept failed: {}", e);
                    return;
                }
            }
        }
    }

    fn accept_new_client(
        &self,
        conn: Box<dyn crate::transport::Connection>,
        proto: &ProtocolConfig,
    ) {
        let mut list = self.shared.clients.lock();
        match Client::create(conn, proto) {
            Ok(client) => {
                debug!(port = proto.port, "accepted new client");
                list.push_head(Arc::new(Mutex::new(client)));
            }
            Err(e) => {
                // Create failure: the socket closes on drop, nothing is
                // inserted.
                debug!("client create failed: {}", e);
            }
        }
    }

    /// Take the client out of the list, then run its delete hook and close
    /// its socket.
    fn remove_client(&self, handle: &ClientHandle) {
        {
            let mut list = self.shared.clients.lock();
            list.remove(handle);
        }
        let mut client = handle.lock();
        client.shutdown();
    }
}
