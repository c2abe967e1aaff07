use super::{
    wire::{read_frame, write_frame, Request, Response, PROTOCOL_VERSION},
    LocalQueues, QueueError,
};
use std::{
    hint,
    io::{BufReader, ErrorKind},
    mem,
    net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};
use tracing::{debug, error, info, warn};

const ACCEPT_POLL: Duration = Duration::from_millis(50);

/// Serves the job and result queues to authenticated clients
#[derive(Debug)]
pub struct Broker {
    queues: LocalQueues,
    secret: Arc<str>,
}

/// Connection threads of the accept loop, each with a handle on its socket
#[derive(Debug, Default)]
struct Clients {
    connections: Vec<(TcpStream, JoinHandle<()>)>,
}

impl Clients {
    fn add(&mut self, stream: TcpStream, thread: JoinHandle<()>) {
        self.connections.push((stream, thread));
    }

    /// forget clients that already hung up
    fn prune(&mut self) {
        let (finished, live) = mem::take(&mut self.connections)
            .into_iter()
            .partition::<Vec<_>, _>(|(_, thread)| thread.is_finished());
        self.connections = live;

        for (_, thread) in finished {
            join_client(thread);
        }
    }

    /// Closing the sockets ends the blocking reads of every client thread
    fn disconnect_all(self) {
        let count = self.connections.len();

        for (stream, thread) in self.connections {
            if let Err(error) = stream.shutdown(Shutdown::Both) {
                debug!(error = ?error, "Client socket was already closed");
            }
            join_client(thread);
        }

        debug!(clients = count, "Disconnected broker clients");
    }
}

fn join_client(thread: JoinHandle<()>) {
    if thread.join().is_err() {
        error!("Broker client thread panicked");
    }
}

/// Running broker, stops serving on shutdown and stops accepting on drop
#[derive(Debug)]
pub struct BrokerHandle {
    address: SocketAddr,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Broker {
    pub fn new(secret: &str, capacity: usize) -> Self {
        Self {
            queues: LocalQueues::new(capacity),
            secret: Arc::from(secret),
        }
    }

    /// in-process access to the served queues
    pub fn queues(&self) -> LocalQueues {
        self.queues.clone()
    }

    pub fn bind<A: ToSocketAddrs>(self, address: A) -> Result<BrokerHandle, QueueError> {
        let listener = TcpListener::bind(address)?;
        // non-blocking accept so the loop can observe the shutdown flag
        listener.set_nonblocking(true)?;
        let address = listener.local_addr()?;
        let shutdown = Arc::new(AtomicBool::new(false));

        info!(address = %address, "Running queue broker");

        let flag = shutdown.clone();
        let thread = thread::Builder::new()
            .name("broker-accept".to_owned())
            .spawn(move || self.accept_loop(listener, flag))?;

        Ok(BrokerHandle {
            address,
            shutdown,
            thread: Some(thread),
        })
    }

    fn accept_loop(self, listener: TcpListener, shutdown: Arc<AtomicBool>) {
        let mut clients = Clients::default();

        while !shutdown.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "Accepted broker client");
                    clients.prune();

                    let control = match stream.try_clone() {
                        Ok(control) => control,
                        Err(error) => {
                            error!(peer = %peer, error = ?error, "Failed to keep a handle on client socket");
                            continue;
                        }
                    };

                    let queues = self.queues.clone();
                    let secret = self.secret.clone();
                    let spawned = thread::Builder::new()
                        .name(format!("broker-{peer}"))
                        .spawn(move || {
                            if let Err(error) = serve_client(stream, queues, &secret) {
                                warn!(peer = %peer, error = ?error, "Broker client failed: {error}");
                            }
                        });

                    match spawned {
                        Ok(thread) => clients.add(control, thread),
                        Err(error) => error!(peer = %peer, error = ?error, "Failed to spawn client thread"),
                    }
                }
                Err(error) if error.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
                Err(error) => {
                    warn!(error = ?error, "Failed to accept broker client: {error}");
                    thread::sleep(ACCEPT_POLL);
                }
            }
        }

        info!("Queue broker stopped accepting clients");
        clients.disconnect_all();
    }
}

/// Compare secrets without stopping at the first differing byte
fn secrets_match(offered: &str, secret: &str) -> bool {
    let (offered, secret) = (offered.as_bytes(), secret.as_bytes());
    if offered.len() != secret.len() {
        return false;
    }

    let difference = offered
        .iter()
        .zip(secret)
        .fold(0u8, |difference, (a, b)| difference | (a ^ b));

    hint::black_box(difference) == 0
}

fn serve_client(stream: TcpStream, queues: LocalQueues, secret: &str) -> Result<(), QueueError> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;

    let mut reader = BufReader::new(stream.try_clone()?);
    let mut writer = stream;

    match read_frame::<_, Request>(&mut reader)? {
        Some(Request::Hello {
            secret: offered,
            version,
        }) => {
            if version != PROTOCOL_VERSION {
                let reason = format!("protocol version {version} unsupported");
                warn!(version = version, "Rejected broker client: {reason}");

                return write_frame(&mut writer, &Response::Denied { reason });
            }

            if !secrets_match(&offered, secret) {
                warn!("Rejected broker client with a wrong secret");

                return write_frame(
                    &mut writer,
                    &Response::Denied {
                        reason: "authentication failed".to_owned(),
                    },
                );
            }

            write_frame(&mut writer, &Response::Welcome)?;
        }
        Some(_) => {
            return write_frame(
                &mut writer,
                &Response::Denied {
                    reason: "handshake required".to_owned(),
                },
            );
        }
        None => return Ok(()),
    }

    while let Some(request) = read_frame::<_, Request>(&mut reader)? {
        let response = match request {
            Request::Put { queue, item } => match queues.put(queue, item) {
                Ok(()) => Response::Ok,
                Err(QueueError::Full(_)) => Response::Full,
                Err(error) => Response::Error {
                    message: error.to_string(),
                },
            },
            Request::GetNowait { queue } => Response::Item {
                item: queues.get_nowait(queue),
            },
            Request::Len { queue } => Response::Length {
                length: queues.len(queue),
            },
            Request::Hello { .. } => Response::Error {
                message: "already authenticated".to_owned(),
            },
        };

        write_frame(&mut writer, &response)?;
    }

    debug!("Broker client disconnected");

    Ok(())
}

impl BrokerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    /// Block until the accept loop ends and its clients are disconnected
    pub fn join(mut self) {
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Broker accept thread panicked");
            }
        }
    }

    pub fn shutdown(self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.join();
    }
}

impl Drop for BrokerHandle {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}
