use std::{
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use log::{debug, info, warn};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    runtime::{self, Runtime},
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
    time,
};

use crate::{
    Mailbox, OnoReceiver, OnoSender, RecvRequest, SendCompletion, SendRequest, Tag, Transport,
    msg::{Command, Msg, Payload},
};

const CONNECT_ATTEMPTS: usize = 100;
const CONNECT_BACKOFF: Duration = Duration::from_millis(100);
const SHUTDOWN_GRACE: Duration = Duration::from_millis(200);

type Link = (
    usize,
    OnoReceiver<OwnedReadHalf>,
    OnoSender<OwnedWriteHalf>,
);

/// A delta waiting to be written to one peer.
struct Outgoing {
    tag: Tag,
    data: Box<[f32]>,
    done: SendCompletion,
}

/// A fully connected TCP mesh.
///
/// Every peer link gets a writer task draining a queue of outgoing deltas and
/// a reader task routing incoming deltas into this rank's mailbox. The tasks
/// run on a runtime owned by the transport so callers stay synchronous.
///
/// A peer that says goodbye, closes its link or can't be written to anymore
/// has left the mesh: it's no longer listed in `peers` and sends to it
/// complete right away without going anywhere.
pub struct TcpTransport {
    rank: usize,
    world_size: usize,
    departed: Arc<[AtomicBool]>,
    writers: Vec<Option<UnboundedSender<Outgoing>>>,
    write_tasks: Vec<JoinHandle<()>>,
    mailbox: Arc<Mailbox>,
    runtime: Option<Runtime>,
}

impl TcpTransport {
    /// Joins the mesh described by `addrs` as `rank`.
    ///
    /// Binds `addrs[rank]`, dials every lower rank and accepts every higher one,
    /// blocking until all the links are up.
    ///
    /// # Arguments
    /// * `rank` - This node's rank.
    /// * `addrs` - The listening address of every rank, indexed by rank.
    ///
    /// # Returns
    /// The connected transport or an io error.
    pub fn connect(rank: usize, addrs: &[SocketAddr]) -> io::Result<Self> {
        let world_size = addrs.len();
        if rank >= world_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("rank {rank} is out of range for a mesh of {world_size}"),
            ));
        }

        let runtime = runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("comms")
            .enable_all()
            .build()?;

        let links = runtime.block_on(establish(rank, addrs))?;
        let mailbox = Arc::new(Mailbox::new());
        let departed: Arc<[AtomicBool]> =
            (0..world_size).map(|_| AtomicBool::new(false)).collect();
        let mut writers: Vec<_> = (0..world_size).map(|_| None).collect();
        let mut write_tasks = Vec::with_capacity(links.len());

        for (peer, rx, tx) in links {
            let (queue_tx, queue_rx) = mpsc::unbounded_channel();
            let gone = Arc::clone(&departed);
            write_tasks.push(runtime.spawn(write_loop(peer, tx, queue_rx, gone)));

            let gone = Arc::clone(&departed);
            runtime.spawn(read_loop(peer, rx, Arc::clone(&mailbox), gone));
            writers[peer] = Some(queue_tx);
        }

        info!(rank = rank, world_size = world_size; "mesh established");

        Ok(Self {
            rank,
            world_size,
            departed,
            writers,
            write_tasks,
            mailbox,
            runtime: Some(runtime),
        })
    }

    /// Closes every link, telling the peers this node is leaving.
    ///
    /// Deltas already queued get a short grace period to be flushed.
    /// Must not be called from within an async context.
    pub fn shutdown(&mut self) {
        let Some(runtime) = self.runtime.take() else {
            return;
        };

        // Dropping the queues ends the writer tasks, which send the disconnect.
        self.writers.clear();
        let write_tasks = std::mem::take(&mut self.write_tasks);

        runtime.block_on(async {
            let flush = async {
                for task in write_tasks {
                    let _ = task.await;
                }
            };

            if time::timeout(SHUTDOWN_GRACE, flush).await.is_err() {
                warn!(rank = self.rank; "timed out flushing outgoing deltas");
            }
        });

        runtime.shutdown_timeout(SHUTDOWN_GRACE);
        info!(rank = self.rank; "left the mesh");
    }

    fn has_departed(&self, peer: usize) -> bool {
        self.departed
            .get(peer)
            .is_some_and(|gone| gone.load(Ordering::Acquire))
    }
}

impl Transport for TcpTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn isend(&self, peer: usize, tag: Tag, data: &[f32]) -> io::Result<SendRequest> {
        if self.has_departed(peer) {
            return Ok(SendRequest::completed());
        }

        let Some(Some(queue)) = self.writers.get(peer) else {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("no link to peer {peer}"),
            ));
        };

        let (request, done) = SendRequest::pending();
        let outgoing = Outgoing {
            tag,
            data: data.into(),
            done,
        };

        queue.send(outgoing).map_err(|_| {
            io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("the link to peer {peer} is closed"),
            )
        })?;

        Ok(request)
    }

    fn irecv_any(&self, tag: Tag) -> io::Result<RecvRequest> {
        self.mailbox.post(tag)
    }

    /// The peers still in the mesh.
    fn peers(&self) -> Vec<usize> {
        (0..self.world_size)
            .filter(|&peer| peer != self.rank && !self.has_departed(peer))
            .collect()
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Opens every link of the mesh for `rank`.
async fn establish(rank: usize, addrs: &[SocketAddr]) -> io::Result<Vec<Link>> {
    let listener = TcpListener::bind(addrs[rank]).await?;
    let mut links = Vec::with_capacity(addrs.len() - 1);
    let mut buf: Vec<u32> = Vec::new();

    for (peer, addr) in addrs.iter().enumerate().take(rank) {
        let stream = dial(*addr).await?;
        stream.set_nodelay(true)?;

        let (rx, tx) = stream.into_split();
        let (rx, mut tx) = crate::channel(rx, tx);
        tx.send(&Msg::Control(Command::Hello { rank })).await?;

        debug!(rank = rank, peer = peer; "dialed peer");
        links.push((peer, rx, tx));
    }

    for _ in rank + 1..addrs.len() {
        let (stream, addr) = listener.accept().await?;
        stream.set_nodelay(true)?;

        let (rx, tx) = stream.into_split();
        let (mut rx, tx) = crate::channel(rx, tx);

        let msg: Msg = rx.recv_into(&mut buf).await?;
        let peer = match msg {
            Msg::Control(Command::Hello { rank: peer }) if peer > rank && peer < addrs.len() => peer,
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("expected a hello from {addr}, got {other:?}"),
                ));
            }
        };

        debug!(rank = rank, peer = peer; "accepted peer");
        links.push((peer, rx, tx));
    }

    Ok(links)
}

/// Connects to `addr`, retrying while the peer isn't listening yet.
async fn dial(addr: SocketAddr) -> io::Result<TcpStream> {
    let mut attempt = 0;

    loop {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) if attempt + 1 < CONNECT_ATTEMPTS => {
                debug!("connecting to {addr} failed ({e}), retrying");
                attempt += 1;
                time::sleep(CONNECT_BACKOFF).await;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Writes the queued deltas to `peer`.
///
/// Once the peer departed its deltas are dropped and their sends complete
/// successfully, a failed write marks it as departed.
async fn write_loop<W>(
    peer: usize,
    mut tx: OnoSender<W>,
    mut queue: UnboundedReceiver<Outgoing>,
    departed: Arc<[AtomicBool]>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(Outgoing { tag, data, done }) = queue.recv().await {
        if departed[peer].load(Ordering::Acquire) {
            done.complete(Ok(()));
            continue;
        }

        let msg = Msg::Data(Payload::Delta { tag, data: &data });
        if let Err(e) = tx.send(&msg).await {
            warn!(peer = peer, tag = tag; "dropping peer after a failed send: {e}");
            departed[peer].store(true, Ordering::Release);
        }

        done.complete(Ok(()));
    }

    if departed[peer].load(Ordering::Acquire) {
        return;
    }

    if let Err(e) = tx.send(&Msg::Control(Command::Disconnect)).await {
        debug!(peer = peer; "failed to say goodbye: {e}");
    }
}

/// Routes the deltas `peer` sends into the mailbox until the link ends,
/// then marks the peer as departed.
async fn read_loop<R>(
    peer: usize,
    mut rx: OnoReceiver<R>,
    mailbox: Arc<Mailbox>,
    departed: Arc<[AtomicBool]>,
) where
    R: AsyncRead + Unpin,
{
    let mut buf: Vec<f32> = Vec::new();

    loop {
        let res: io::Result<Msg> = rx.recv_into(&mut buf).await;

        match res {
            Ok(Msg::Data(Payload::Delta { tag, data })) => mailbox.deliver(tag, data.into()),
            Ok(Msg::Control(Command::Disconnect)) => {
                info!(peer = peer; "peer disconnected");
                break;
            }
            Ok(Msg::Err(detail)) => warn!(peer = peer; "peer reported an error: {detail}"),
            Ok(other) => warn!(peer = peer; "unexpected message: {other:?}"),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                info!(peer = peer; "link closed");
                break;
            }
            Err(e) => {
                warn!(peer = peer; "link failed: {e}");
                break;
            }
        }
    }

    departed[peer].store(true, Ordering::Release);
}
