//! Control-plane interface: the kernel-visible twin of a Gatekeeper
//! interface.
//!
//! The kernel-side companion driver is opaque to the fast path; it shows
//! up here as a pair of bounded packet queues (one per direction) plus a
//! queue of administrative requests. The CPS worker pushes frames the
//! kernel stack should see with `tx_burst`, drains frames the kernel
//! emitted with `rx_burst`, and services MTU/link requests synchronously
//! from its own loop.
//!
//! A CPI must be created in stage 1, before devices start: creating the
//! kernel device reinitializes the underlying port, which would discard
//! RETA and multicast-MAC configuration done earlier.

use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

use crate::dataplane::buffer::PktBuf;
use crate::error::Result;

/// Default depth of each CPI packet queue.
pub const CPI_QUEUE_DEPTH: usize = 1024;

/// Administrative request raised by the kernel side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpiRequest {
    /// Change the device MTU.
    ChangeMtu(u32),
    /// Bring the link up or down.
    ConfigLink(bool),
}

/// Callbacks servicing kernel administrative requests.
pub struct CpiOps {
    pub change_mtu: Box<dyn Fn(u32) -> Result<()> + Send + Sync>,
    pub config_link: Box<dyn Fn(bool) -> Result<()> + Send + Sync>,
}

struct Shared {
    name: String,
    /// Fast path -> kernel stack.
    to_kernel: ArrayQueue<PktBuf>,
    /// Kernel stack -> fast path.
    from_kernel: ArrayQueue<PktBuf>,
    requests: ArrayQueue<CpiRequest>,
}

/// Fast-path handle of one CPI.
pub struct Cpi {
    shared: Arc<Shared>,
    ops: CpiOps,
}

/// Kernel-side handle, held by the companion driver (or a test harness).
#[derive(Clone)]
pub struct CpiKernelHandle {
    shared: Arc<Shared>,
}

impl Cpi {
    pub fn new(name: impl Into<String>, ops: CpiOps) -> (Self, CpiKernelHandle) {
        Self::with_depth(name, CPI_QUEUE_DEPTH, ops)
    }

    pub fn with_depth(
        name: impl Into<String>,
        depth: usize,
        ops: CpiOps,
    ) -> (Self, CpiKernelHandle) {
        let shared = Arc::new(Shared {
            name: name.into(),
            to_kernel: ArrayQueue::new(depth),
            from_kernel: ArrayQueue::new(depth),
            requests: ArrayQueue::new(16),
        });
        let kernel = CpiKernelHandle {
            shared: Arc::clone(&shared),
        };
        (Self { shared, ops }, kernel)
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Push packets toward the kernel stack.
    ///
    /// Accepts from the front of `pkts` and returns how many it took;
    /// whatever remains is the caller's to free.
    pub fn tx_burst(&self, pkts: &mut Vec<PktBuf>) -> usize {
        let mut sent = 0;
        while sent < pkts.len() {
            // Peek-free push: remove, and put back on refusal.
            let pkt = pkts.remove(0);
            match self.shared.to_kernel.push(pkt) {
                Ok(()) => sent += 1,
                Err(pkt) => {
                    pkts.insert(0, pkt);
                    break;
                }
            }
        }
        sent
    }

    /// Read packets the kernel stack produced, up to `max`.
    pub fn rx_burst(&self, out: &mut Vec<PktBuf>, max: usize) -> usize {
        let mut n = 0;
        while n < max {
            match self.shared.from_kernel.pop() {
                Some(pkt) => {
                    out.push(pkt);
                    n += 1;
                }
                None => break,
            }
        }
        n
    }

    /// Service pending kernel administrative requests.
    ///
    /// A failing callback surfaces as an error for the caller to log; it
    /// never aborts the worker.
    pub fn handle_request(&self) -> Result<()> {
        let mut res = Ok(());
        while let Some(req) = self.shared.requests.pop() {
            let r = match req {
                CpiRequest::ChangeMtu(mtu) => (self.ops.change_mtu)(mtu),
                CpiRequest::ConfigLink(up) => (self.ops.config_link)(up),
            };
            if r.is_err() {
                res = r;
            }
        }
        res
    }
}

impl CpiKernelHandle {
    /// Packet the fast path pushed for the kernel, if any.
    pub fn recv(&self) -> Option<PktBuf> {
        self.shared.to_kernel.pop()
    }

    /// Emit a packet from the kernel stack toward the fast path.
    pub fn inject(&self, pkt: PktBuf) -> std::result::Result<(), PktBuf> {
        self.shared.from_kernel.push(pkt)
    }

    /// Raise an MTU-change request.
    pub fn request_mtu(&self, mtu: u32) {
        let _ = self.shared.requests.push(CpiRequest::ChangeMtu(mtu));
    }

    /// Raise a link up/down request.
    pub fn request_link(&self, up: bool) {
        let _ = self.shared.requests.push(CpiRequest::ConfigLink(up));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataplane::buffer::BufferPool;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn noop_ops() -> CpiOps {
        CpiOps {
            change_mtu: Box::new(|_| Ok(())),
            config_link: Box::new(|_| Ok(())),
        }
    }

    #[test]
    fn test_tx_burst_reaches_kernel_side() {
        let pool = Arc::new(BufferPool::new(8).unwrap());
        let (cpi, kernel) = Cpi::new("cpi_front", noop_ops());

        let mut pkts = Vec::new();
        for i in 0..3u8 {
            let mut pkt = pool.alloc().unwrap();
            pkt.fill_from(&[i; 20]).unwrap();
            pkts.push(pkt);
        }
        assert_eq!(cpi.tx_burst(&mut pkts), 3);
        assert!(pkts.is_empty());

        for i in 0..3u8 {
            let pkt = kernel.recv().unwrap();
            assert_eq!(pkt.data()[0], i);
        }
        assert!(kernel.recv().is_none());
    }

    #[test]
    fn test_tx_burst_leaves_overflow_with_caller() {
        let pool = Arc::new(BufferPool::new(8).unwrap());
        let (cpi, _kernel) = Cpi::with_depth("cpi_front", 2, noop_ops());

        let mut pkts: Vec<PktBuf> = (0..4).map(|_| pool.alloc().unwrap()).collect();
        assert_eq!(cpi.tx_burst(&mut pkts), 2);
        assert_eq!(pkts.len(), 2);
    }

    #[test]
    fn test_kernel_requests_invoke_callbacks() {
        let mtu_seen = Arc::new(AtomicU32::new(0));
        let mtu_clone = Arc::clone(&mtu_seen);
        let ops = CpiOps {
            change_mtu: Box::new(move |mtu| {
                mtu_clone.store(mtu, Ordering::SeqCst);
                Ok(())
            }),
            config_link: Box::new(|_| Ok(())),
        };
        let (cpi, kernel) = Cpi::new("cpi_front", ops);

        kernel.request_mtu(9000);
        kernel.request_link(true);
        cpi.handle_request().unwrap();
        assert_eq!(mtu_seen.load(Ordering::SeqCst), 9000);
    }

    #[test]
    fn test_failing_callback_surfaces_error() {
        let ops = CpiOps {
            change_mtu: Box::new(|_| Err(crate::error::Error::Unsupported("MTU change"))),
            config_link: Box::new(|_| Ok(())),
        };
        let (cpi, kernel) = Cpi::new("cpi_front", ops);
        kernel.request_mtu(1500);
        assert!(cpi.handle_request().is_err());
    }
}
