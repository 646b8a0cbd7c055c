//! Packet queue workers
//!
//! Each kernel packet queue is serviced by one dedicated thread that
//! feeds delivered packets to a [`PacketHandler`] and returns the
//! verdict. Handlers never touch queue I/O, which keeps them testable
//! and keeps per-queue ordering trivial.

use std::io;
use std::thread::JoinHandle;
use std::time::Duration;

use nfq::{Queue, Verdict};
use tracing::{debug, error, info};

use crate::conntrack::ConnState;
use crate::error::{Error, Result};
use crate::sync::ShutdownToken;

/// Kernel-side limits for copied packet bytes and queued packets.
const QUEUE_LIMIT: u16 = 0xffff;

/// How long a worker sleeps when the queue has nothing to deliver.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A packet delivered by the kernel, detached from queue I/O.
#[derive(Debug, Clone)]
pub struct QueuedPacket {
    /// Conntrack classification, when the kernel attached one.
    pub ct_state: Option<ConnState>,
    /// Raw L3 payload.
    pub payload: Vec<u8>,
}

/// Decision logic bound to one queue.
pub trait PacketHandler: Send + Sync + 'static {
    /// Decide the fate of a packet. `None` means no verdict: the kernel
    /// re-delivers or times the packet out (used for undecodable
    /// packets).
    fn decide(&self, pkt: &QueuedPacket) -> Option<Verdict>;

    /// Called when the verdict for `pkt` could not be delivered to the
    /// kernel, so side effects of `decide` can be rolled back.
    fn verdict_failed(&self, _pkt: &QueuedPacket) {}
}

/// Owns one bound queue and the thread servicing it.
pub struct QueueWorker {
    queue_num: u16,
    shutdown: ShutdownToken,
    thread: Option<JoinHandle<()>>,
}

impl QueueWorker {
    /// Open and bind queue `queue_num`, then start the service thread.
    ///
    /// The queue copies full packets, delivers conntrack attributes and
    /// runs non-blocking so shutdown is observed promptly.
    pub fn spawn<H: PacketHandler>(label: &str, queue_num: u16, handler: H) -> Result<Self> {
        let mut queue = open_queue(queue_num)?;

        let shutdown = ShutdownToken::new();
        let worker_shutdown = shutdown.clone();
        let thread_label = label.to_string();

        info!(queue.num = queue_num, filter.kind = label, "started packet queue");

        let thread = std::thread::Builder::new()
            .name(format!("queue-{queue_num}"))
            .spawn(move || run_loop(&mut queue, &thread_label, &handler, &worker_shutdown))
            .map_err(Error::Io)?;

        Ok(Self {
            queue_num,
            shutdown,
            thread: Some(thread),
        })
    }

    /// Stop the service thread and release the queue. Idempotent.
    pub fn close(&mut self) {
        self.shutdown.trigger();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        debug!(queue.num = self.queue_num, "packet queue closed");
    }
}

impl Drop for QueueWorker {
    fn drop(&mut self) {
        self.close();
    }
}

fn open_queue(queue_num: u16) -> Result<Queue> {
    let setup = |queue_num: u16| -> io::Result<Queue> {
        let mut queue = Queue::open()?;
        queue.bind(queue_num)?;
        queue.set_copy_range(queue_num, QUEUE_LIMIT)?;
        queue.set_queue_max_len(queue_num, QUEUE_LIMIT as u32)?;
        queue.set_recv_conntrack(queue_num, true)?;
        queue.set_nonblocking(true);
        Ok(queue)
    };

    setup(queue_num).map_err(|source| Error::QueueSetup { queue_num, source })
}

fn run_loop(
    queue: &mut Queue,
    label: &str,
    handler: &dyn PacketHandler,
    shutdown: &ShutdownToken,
) {
    while !shutdown.is_set() {
        let mut msg = match queue.recv() {
            Ok(msg) => msg,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                shutdown.wait_timeout(POLL_INTERVAL);
                continue;
            }
            Err(e) => {
                // recv failures while tearing down are expected noise
                if shutdown.is_set() {
                    break;
                }
                error!(filter.kind = label, error = %e, "netlink error");
                continue;
            }
        };

        let pkt = QueuedPacket {
            ct_state: conn_state(&msg),
            payload: msg.get_payload().to_vec(),
        };

        let Some(verdict) = handler.decide(&pkt) else {
            // withhold the verdict; the kernel re-delivers or times out
            continue;
        };

        msg.set_verdict(verdict);
        if let Err(e) = queue.verdict(msg) {
            error!(filter.kind = label, error = %e, "error setting verdict");
            handler.verdict_failed(&pkt);
        }
    }
}

/// The kernel's conntrack classification (NFQA_CT_INFO), present once
/// conntrack delivery is enabled on the queue.
fn conn_state(msg: &nfq::Message) -> Option<ConnState> {
    use nfq::conntrack::State;
    msg.get_conntrack().map(|ct| {
        let code = match ct.get_state() {
            State::Established => crate::conntrack::ESTABLISHED,
            State::Related => crate::conntrack::RELATED,
            State::New => crate::conntrack::NEW,
            State::EstablishedReply => crate::conntrack::ESTABLISHED_REPLY,
            State::RelatedReply => crate::conntrack::RELATED_REPLY,
            State::NewReply => crate::conntrack::NEW + crate::conntrack::IS_REPLY,
            State::Invalid => u32::MAX,
        };
        ConnState(code)
    })
}
