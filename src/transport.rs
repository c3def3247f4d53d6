// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::VecDeque;
use std::fmt;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use hyper::{Body, Request, Response};
use log::{debug, error, info, trace};
use rusb::Context;
use tokio::sync::{Notify, Semaphore};

use crate::config::TransportConfig;
use crate::device::{BulkIo, Device, UsbInterface};
use crate::device_info::{DeviceDescriptor, DeviceInfo};
use crate::error::Error;
use crate::error::Result;
use crate::http;

// Capacity of each connection's buffered reader.  Must be a multiple of the
// USB read alignment and large enough to hold any response header block.
const READER_CAPACITY: usize = 8192;

/// Per-connection allocation/read/write counters, for diagnostics only.
///
/// The rendered form shows three flags per connection index, so a transport
/// with one idle and one writing connection prints "1 in use: --- a-w".
pub(crate) struct ConnState {
    alloc: Vec<AtomicI32>,
    read: Vec<AtomicI32>,
    write: Vec<AtomicI32>,
}

impl ConnState {
    fn new(count: usize) -> ConnState {
        ConnState {
            alloc: (0..count).map(|_| AtomicI32::new(0)).collect(),
            read: (0..count).map(|_| AtomicI32::new(0)).collect(),
            write: (0..count).map(|_| AtomicI32::new(0)).collect(),
        }
    }

    fn got_conn(&self, index: usize) {
        self.alloc[index].fetch_add(1, Ordering::Relaxed);
    }

    fn put_conn(&self, index: usize) {
        self.alloc[index].fetch_sub(1, Ordering::Relaxed);
    }

    fn begin_read(&self, index: usize) {
        self.read[index].fetch_add(1, Ordering::Relaxed);
    }

    fn done_read(&self, index: usize) {
        self.read[index].fetch_sub(1, Ordering::Relaxed);
    }

    fn begin_write(&self, index: usize) {
        self.write[index].fetch_add(1, Ordering::Relaxed);
    }

    fn done_write(&self, index: usize) {
        self.write[index].fetch_sub(1, Ordering::Relaxed);
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut flags = String::with_capacity(self.alloc.len() * 4);
        let mut used = 0;
        for i in 0..self.alloc.len() {
            let a = self.alloc[i].load(Ordering::Relaxed);
            let r = self.read[i].load(Ordering::Relaxed);
            let w = self.write[i].load(Ordering::Relaxed);

            if !flags.is_empty() {
                flags.push(' ');
            }

            if a | r | w == 0 {
                flags.push_str("---");
            } else {
                used += 1;
                flags.push(if a != 0 { 'a' } else { '-' });
                flags.push(if r != 0 { 'r' } else { '-' });
                flags.push(if w != 0 { 'w' } else { '-' });
            }
        }
        write!(f, "{} in use: {}", used, flags)
    }
}

/// One bulk-in transfer, with buffer alignment and zero-read recovery.
///
/// Bulk reads never observe EOF; a successful zero-length transfer means a
/// stalled or confused endpoint.  Recovery clears the input halt and retries
/// after a doubling backoff.  The loop is unbounded; it ends with data, an
/// error, or the device reset issued at transport close.
fn recv_aligned<I: BulkIo>(
    iface: &I,
    index: usize,
    config: &TransportConfig,
    buf: &mut [u8],
    total: &mut u64,
) -> io::Result<usize> {
    // Buffers of at least one alignment unit are truncated to a multiple of
    // it, or libusb can fault short packets with a transfer overflow.
    // Callers handing us less than one unit are assumed to know what they
    // are doing.
    let align = config.usb_read_alignment;
    let buf = if align > 0 && buf.len() >= align {
        let len = buf.len() - buf.len() % align;
        &mut buf[..len]
    } else {
        buf
    };

    let mut backoff = config.zero_read_backoff_initial;
    loop {
        let n = match iface.recv(buf) {
            Ok(n) => n,
            Err(e) => {
                error!("USB[{}]: recv: {}", index, e);
                return Err(e);
            }
        };
        *total += n as u64;
        if config.log.trace_usb() {
            trace!(
                "USB[{}]: read: wanted {} got {} total {}",
                index,
                buf.len(),
                n,
                total
            );
        }
        if n != 0 {
            return Ok(n);
        }

        error!("USB[{}]: zero-size read", index);
        if let Err(e) = iface.clear_halt_in() {
            error!("USB[{}]: clear halt: {}", index, e);
        }
        thread::sleep(backoff);
        backoff = (backoff * 2).min(config.zero_read_backoff_max);
    }
}

/// Read half of a bulk connection, fed to the connection's buffered reader.
struct ConnReader {
    iface: Arc<UsbInterface>,
    index: usize,
    config: TransportConfig,
    state: Arc<ConnState>,
    received: u64,
}

impl Read for ConnReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.state.begin_read(self.index);
        let result = recv_aligned(
            self.iface.as_ref(),
            self.index,
            &self.config,
            buf,
            &mut self.received,
        );
        self.state.done_read(self.index);
        result
    }
}

/// One IPP-USB interface pair viewed as an HTTP byte stream.
///
/// Exactly one transaction is in flight on a connection at a time, so reads
/// and writes never overlap.
struct ConnCore {
    index: usize,
    iface: Arc<UsbInterface>,
    reader: BufReader<ConnReader>,
    sent: u64,
    state: Arc<ConnState>,
    config: TransportConfig,
}

impl ConnCore {
    fn new(
        index: usize,
        iface: UsbInterface,
        state: Arc<ConnState>,
        config: TransportConfig,
    ) -> ConnCore {
        let iface = Arc::new(iface);
        let reader = ConnReader {
            iface: iface.clone(),
            index,
            config: config.clone(),
            state: state.clone(),
            received: 0,
        };
        ConnCore {
            index,
            iface,
            reader: BufReader::with_capacity(READER_CAPACITY, reader),
            sent: 0,
            state,
            config,
        }
    }

    /// Recycle for the next transaction: zero the byte counters and discard
    /// anything a misbehaving device pipelined after the previous response.
    fn recycle(self) -> ConnCore {
        let ConnCore {
            index,
            iface,
            reader,
            state,
            config,
            ..
        } = self;
        let mut inner = reader.into_inner();
        inner.received = 0;
        ConnCore {
            index,
            iface,
            reader: BufReader::with_capacity(READER_CAPACITY, inner),
            sent: 0,
            state,
            config,
        }
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.state.begin_write(self.index);
        let result = self.iface.send(buf);
        self.state.done_write(self.index);
        match &result {
            Ok(n) => {
                self.sent += *n as u64;
                if self.config.log.trace_usb() {
                    trace!(
                        "USB[{}]: write: wanted {} sent {} total {}",
                        self.index,
                        buf.len(),
                        n,
                        self.sent
                    );
                }
            }
            Err(e) => error!("USB[{}]: send: {}", self.index, e),
        }
        result
    }
}

/// What the pool needs from a pooled connection.  Split from `ConnCore` so
/// the pool's bookkeeping is testable without USB hardware.
trait PoolItem: Send + 'static {
    fn index(&self) -> usize;
    fn recycle(self) -> Self;
}

impl PoolItem for ConnCore {
    fn index(&self) -> usize {
        self.index
    }

    fn recycle(self) -> Self {
        ConnCore::recycle(self)
    }
}

/// Fixed-capacity handoff of idle connections.
///
/// At any time the idle queue plus the in-flight connections equal the set
/// created at startup.  The semaphore counts the queue and hands out slots
/// in FIFO order; shutdown preempts a pending acquire.
struct Pool<T: PoolItem> {
    queue: Mutex<VecDeque<T>>,
    permits: Semaphore,
    capacity: usize,
    shutdown: AtomicBool,
    shutdown_notify: Notify,
    released: Notify,
    closed: AtomicBool,
    state: Arc<ConnState>,
}

impl<T: PoolItem> Pool<T> {
    fn new(items: Vec<T>, state: Arc<ConnState>) -> Pool<T> {
        let capacity = items.len();
        Pool {
            queue: Mutex::new(items.into()),
            permits: Semaphore::new(capacity),
            capacity,
            shutdown: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
            released: Notify::new(),
            closed: AtomicBool::new(false),
            state,
        }
    }

    /// Take an idle connection, waiting for one if necessary.
    ///
    /// Shutdown beats an available connection when both are ready; caller
    /// cancellation is dropping this future, which consumes nothing.
    async fn acquire(&self) -> Result<T> {
        let shutdown = self.shutdown_notify.notified();
        tokio::pin!(shutdown);
        shutdown.as_mut().enable();
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(Error::Shutdown);
        }

        tokio::select! {
            biased;
            _ = &mut shutdown => Err(Error::Shutdown),
            permit = self.permits.acquire() => {
                // The semaphore is never closed.
                permit.unwrap().forget();
                // A permit implies an idle connection in the queue.
                let item = self.queue.lock().unwrap().pop_front().unwrap();
                self.state.got_conn(item.index());
                Ok(item)
            }
        }
    }

    /// Return a connection to the pool.
    ///
    /// Still done after shutdown so close() can walk the full set; after
    /// close() the connection is destroyed instead.
    fn put(&self, item: T) {
        let item = item.recycle();
        self.state.put_conn(item.index());
        if self.closed.load(Ordering::SeqCst) {
            drop(item);
        } else {
            self.queue.lock().unwrap().push_back(item);
            self.permits.add_permits(1);
        }
        // Wake the shutdown coordinator if it is listening; otherwise the
        // signal is dropped.
        self.released.notify_waiters();
    }

    fn in_use(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }

    fn start_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.shutdown_notify.notify_waiters();
    }

    /// Wait until every connection is back in the pool.
    async fn drained(&self) {
        loop {
            let released = self.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();
            let n = self.in_use();
            if n == 0 {
                return;
            }
            info!("shutdown: {} connections still in use", n);
            released.await;
        }
    }

    /// Stop pooling and hand back whatever is idle for destruction.
    fn close(&self) -> Vec<T> {
        self.closed.store(true, Ordering::SeqCst);
        self.queue.lock().unwrap().drain(..).collect()
    }
}

struct TransportShared {
    descriptor: DeviceDescriptor,
    info: DeviceInfo,
    device: Device,
    config: TransportConfig,
    state: Arc<ConnState>,
    pool: Pool<ConnCore>,
}

/// HTTP transport backed by an IPP-over-USB connection to one device.
///
/// Cheap to clone; all clones share the device handle and connection pool.
#[derive(Clone)]
pub struct UsbTransport {
    shared: Arc<TransportShared>,
}

impl UsbTransport {
    /// Open the device described by `descriptor` and claim all of its
    /// IPP-USB interface pairs.
    ///
    /// On any claim failure the already-claimed interfaces are released and
    /// the device handle is closed before the error is returned.
    pub fn new(
        config: TransportConfig,
        context: &Context,
        descriptor: DeviceDescriptor,
    ) -> Result<UsbTransport> {
        let device = Device::open(context, &descriptor)?;
        let info = device.read_info()?;

        info!("{}: added {}", descriptor, info.product);
        debug!("Device info:");
        debug!("  Ident:        {}", info.ident());
        debug!("  Manufacturer: {}", info.manufacturer);
        debug!("  Product:      {}", info.product);
        debug!("USB interfaces:");
        debug!("  Config Interface Alt In   Out");
        for address in &descriptor.interfaces {
            debug!(
                "     {:<3}    {:<3}   {:<3} {:#04x} {:#04x}",
                address.config,
                address.interface_number,
                address.alternate_setting,
                address.in_endpoint,
                address.out_endpoint
            );
        }

        let state = Arc::new(ConnState::new(descriptor.interfaces.len()));
        let mut cores = Vec::new();
        for (index, address) in descriptor.interfaces.iter().enumerate() {
            debug!(
                "USB[{}]: open: config {} interface {} alt {}",
                index, address.config, address.interface_number, address.alternate_setting
            );
            let iface = device.open_interface(*address)?;
            cores.push(ConnCore::new(index, iface, state.clone(), config.clone()));
        }

        let pool = Pool::new(cores, state.clone());
        Ok(UsbTransport {
            shared: Arc::new(TransportShared {
                descriptor,
                info,
                device,
                config,
                state,
                pool,
            }),
        })
    }

    /// Execute one HTTP transaction against the device.
    ///
    /// The request must be a well-formed HTTP/1.1 request with a body that
    /// is readable once.  Dropping the returned future cancels connection
    /// acquisition only; once a connection carries the request, the USB
    /// transaction runs to completion regardless.
    pub async fn round_trip(&self, request: Request<Body>) -> Result<Response<Body>> {
        self.round_trip_with_session(http::next_session_id(), request)
            .await
    }

    /// As `round_trip`, with a caller-provided session number for log
    /// correlation.
    pub async fn round_trip_with_session(
        &self,
        session: usize,
        request: Request<Body>,
    ) -> Result<Response<Body>> {
        http::round_trip(self.clone(), session, request).await
    }

    /// Refuse new connections, then wait until all in-flight transactions
    /// have released their connections.  Apply a deadline by wrapping this
    /// future in a timeout; on expiry, proceed straight to `close()`.
    pub async fn shutdown(&self) {
        self.shared.pool.start_shutdown();
        self.shared.pool.drained().await;
    }

    /// Forced teardown.  Connections still in flight are aborted with a
    /// device reset before the pool is destroyed.
    pub fn close(&self) {
        if self.shared.pool.in_use() > 0 {
            info!(
                "{}: resetting {}",
                self.shared.descriptor, self.shared.info.product
            );
            if let Err(e) = self.shared.device.reset() {
                error!("{}: {}", self.shared.descriptor, e);
            }
        }

        for core in self.shared.pool.close() {
            debug!("USB[{}]: closed", core.index);
        }

        info!(
            "{}: removed {}",
            self.shared.descriptor, self.shared.info.product
        );
    }

    /// Identification strings for the device behind the transport.
    pub fn device_info(&self) -> &DeviceInfo {
        &self.shared.info
    }

    /// The rusb device behind the transport, for unplug monitoring.
    pub fn device(&self) -> rusb::Device<Context> {
        self.shared.device.rusb_device()
    }

    pub(crate) fn config(&self) -> &TransportConfig {
        &self.shared.config
    }

    pub(crate) fn descriptor(&self) -> &DeviceDescriptor {
        &self.shared.descriptor
    }

    pub(crate) async fn acquire(&self) -> Result<UsbConn> {
        let core = self.shared.pool.acquire().await?;
        debug!(
            "USB[{}]: connection allocated, {}",
            core.index, self.shared.state
        );
        Ok(UsbConn {
            shared: self.shared.clone(),
            core: Some(core),
        })
    }
}

/// A borrowed bulk connection, carrying one HTTP transaction.
///
/// Released back to the pool on drop, which makes exactly-once release
/// structural: whichever task ends up owning the guard returns it.
pub(crate) struct UsbConn {
    shared: Arc<TransportShared>,
    // `core` is never None until the UsbConn is dropped.
    core: Option<ConnCore>,
}

impl UsbConn {
    pub(crate) fn index(&self) -> usize {
        self.core.as_ref().unwrap().index
    }
}

impl Read for UsbConn {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.core.as_mut().unwrap().reader.read(buf)
    }
}

impl BufRead for UsbConn {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.core.as_mut().unwrap().reader.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        self.core.as_mut().unwrap().reader.consume(amt)
    }
}

impl Write for UsbConn {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.core.as_mut().unwrap().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for UsbConn {
    fn drop(&mut self) {
        // Unwrap because core only becomes None at drop.
        let core = self.core.take().unwrap();
        let index = core.index;
        self.shared.pool.put(core);
        debug!(
            "USB[{}]: connection released, {}",
            index, self.shared.state
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogMask;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};
    use tokio::time::timeout;

    #[test]
    fn conn_state_idle() {
        let state = ConnState::new(2);
        assert_eq!(state.to_string(), "0 in use: --- ---");
    }

    #[test]
    fn conn_state_flags() {
        let state = ConnState::new(3);
        state.got_conn(0);
        state.got_conn(2);
        state.begin_write(2);
        assert_eq!(state.to_string(), "2 in use: a-- --- a-w");
        state.begin_read(1);
        assert_eq!(state.to_string(), "3 in use: a-- -r- a-w");
        state.done_read(1);
        state.put_conn(0);
        state.done_write(2);
        state.put_conn(2);
        assert_eq!(state.to_string(), "0 in use: --- --- ---");
    }

    /// Scripted bulk endpoint for exercising the read path.
    struct FakeEndpoint {
        results: Mutex<VecDeque<io::Result<usize>>>,
        clear_halts: AtomicUsize,
        last_recv_len: AtomicUsize,
    }

    impl FakeEndpoint {
        fn new(results: Vec<io::Result<usize>>) -> FakeEndpoint {
            FakeEndpoint {
                results: Mutex::new(results.into()),
                clear_halts: AtomicUsize::new(0),
                last_recv_len: AtomicUsize::new(0),
            }
        }
    }

    impl BulkIo for FakeEndpoint {
        fn send(&self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
            self.last_recv_len.store(buf.len(), Ordering::SeqCst);
            match self.results.lock().unwrap().pop_front() {
                Some(Ok(n)) => {
                    buf[..n].fill(0xab);
                    Ok(n)
                }
                Some(Err(e)) => Err(e),
                None => Ok(0),
            }
        }

        fn clear_halt_in(&self) -> io::Result<()> {
            self.clear_halts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn quiet_config() -> TransportConfig {
        TransportConfig {
            log: LogMask::empty(),
            ..TransportConfig::default()
        }
    }

    #[test]
    fn recv_truncates_large_buffers_to_alignment() {
        let endpoint = FakeEndpoint::new(vec![Ok(10)]);
        let mut buf = [0u8; 1000];
        let mut total = 0;
        let n = recv_aligned(&endpoint, 0, &quiet_config(), &mut buf, &mut total).unwrap();
        assert_eq!(n, 10);
        assert_eq!(total, 10);
        assert_eq!(endpoint.last_recv_len.load(Ordering::SeqCst), 512);
    }

    #[test]
    fn recv_passes_small_buffers_through() {
        let endpoint = FakeEndpoint::new(vec![Ok(3)]);
        let mut buf = [0u8; 100];
        let mut total = 0;
        recv_aligned(&endpoint, 0, &quiet_config(), &mut buf, &mut total).unwrap();
        assert_eq!(endpoint.last_recv_len.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn recv_propagates_errors() {
        let endpoint = FakeEndpoint::new(vec![Err(io::Error::new(
            io::ErrorKind::BrokenPipe,
            "stalled",
        ))]);
        let mut buf = [0u8; 512];
        let mut total = 0;
        let err = recv_aligned(&endpoint, 0, &quiet_config(), &mut buf, &mut total).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(endpoint.clear_halts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn recv_recovers_from_zero_reads() {
        let endpoint = FakeEndpoint::new(vec![Ok(0), Ok(0), Ok(0), Ok(4)]);
        let mut buf = [0u8; 512];
        let mut total = 0;
        let start = Instant::now();
        let n = recv_aligned(&endpoint, 0, &quiet_config(), &mut buf, &mut total).unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf[..4], &[0xab; 4]);
        assert_eq!(endpoint.clear_halts.load(Ordering::SeqCst), 3);
        // Backoffs of 100, 200, and 400 ms separate the retries.
        assert!(start.elapsed() >= Duration::from_millis(700));
    }

    #[test]
    fn recv_backoff_caps_at_max() {
        let endpoint = FakeEndpoint::new(vec![Ok(0), Ok(0), Ok(1)]);
        let config = TransportConfig {
            zero_read_backoff_initial: Duration::from_millis(5),
            zero_read_backoff_max: Duration::from_millis(8),
            ..quiet_config()
        };
        let mut buf = [0u8; 512];
        let mut total = 0;
        let n = recv_aligned(&endpoint, 0, &config, &mut buf, &mut total).unwrap();
        assert_eq!(n, 1);
        assert_eq!(endpoint.clear_halts.load(Ordering::SeqCst), 2);
    }

    struct TestItem {
        index: usize,
        recycles: usize,
    }

    impl PoolItem for TestItem {
        fn index(&self) -> usize {
            self.index
        }

        fn recycle(mut self) -> Self {
            self.recycles += 1;
            self
        }
    }

    fn test_pool(capacity: usize) -> Pool<TestItem> {
        let items = (0..capacity)
            .map(|index| TestItem { index, recycles: 0 })
            .collect();
        Pool::new(items, Arc::new(ConnState::new(capacity)))
    }

    #[tokio::test]
    async fn pool_hands_out_in_fifo_order() {
        let pool = test_pool(2);
        let first = pool.acquire().await.unwrap();
        let second = pool.acquire().await.unwrap();
        assert_eq!(first.index, 0);
        assert_eq!(second.index, 1);
        assert_eq!(pool.in_use(), 2);
        pool.put(second);
        pool.put(first);
        assert_eq!(pool.in_use(), 0);
        // Released order, not creation order.
        assert_eq!(pool.acquire().await.unwrap().index, 1);
    }

    #[tokio::test]
    async fn pool_blocks_when_empty() {
        let pool = test_pool(1);
        let held = pool.acquire().await.unwrap();
        assert!(timeout(Duration::from_millis(50), pool.acquire())
            .await
            .is_err());
        pool.put(held);
        let again = timeout(Duration::from_millis(50), pool.acquire())
            .await
            .expect("acquire should complete after put")
            .unwrap();
        assert_eq!(again.recycles, 1);
    }

    #[tokio::test]
    async fn pool_shutdown_fails_new_acquires() {
        let pool = test_pool(2);
        pool.start_shutdown();
        assert!(matches!(pool.acquire().await, Err(Error::Shutdown)));
        // Shutdown is monotonic even with idle connections available.
        assert!(matches!(pool.acquire().await, Err(Error::Shutdown)));
    }

    #[tokio::test]
    async fn pool_shutdown_wakes_pending_acquire() {
        let pool = Arc::new(test_pool(1));
        let held = pool.acquire().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        pool.start_shutdown();
        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(Error::Shutdown)));
        pool.put(held);
    }

    #[tokio::test]
    async fn pool_drained_waits_for_releases() {
        let pool = Arc::new(test_pool(2));
        let held = pool.acquire().await.unwrap();
        pool.start_shutdown();
        assert!(timeout(Duration::from_millis(50), pool.drained())
            .await
            .is_err());
        pool.put(held);
        timeout(Duration::from_millis(50), pool.drained())
            .await
            .expect("drained should complete once everything is released");
        assert_eq!(pool.in_use(), 0);
    }

    #[tokio::test]
    async fn pool_put_after_shutdown_repools() {
        let pool = test_pool(2);
        let held = pool.acquire().await.unwrap();
        pool.start_shutdown();
        pool.put(held);
        // Close can still walk the full set.
        assert_eq!(pool.close().len(), 2);
    }

    #[tokio::test]
    async fn pool_put_after_close_destroys() {
        let pool = test_pool(1);
        let held = pool.acquire().await.unwrap();
        assert_eq!(pool.close().len(), 0);
        pool.put(held);
        assert!(pool.queue.lock().unwrap().is_empty());
    }
}
