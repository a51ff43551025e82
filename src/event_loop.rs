use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use bytes::Bytes;
use crossbeam_channel::{Receiver, unbounded};

use crate::completion::{OpTag, UserData};
use crate::config::{Config, UdpReceiverConfig, UdpSenderConfig};
use crate::error::Error;
use crate::metrics;
use crate::packet::{Datagram, DatagramSender, DatagramWriter, Outbound};
use crate::port::{self, Lifecycle, PortHandle, PortIo, PortKind, PortTable};
use crate::resolver::{EndpointUri, ResolveOutcome, Resolver};
use crate::ring::Ring;

/// Cross-thread wakeup handle backed by eventfd(2).
///
/// Shared via `Arc` between the threads that signal it and the loop thread
/// that reads it through the ring; the fd stays open until the last
/// reference drops, so a late signal can never hit a recycled descriptor.
#[derive(Debug)]
pub(crate) struct EventFd {
    fd: OwnedFd,
}

impl EventFd {
    fn new() -> io::Result<EventFd> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(EventFd {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Signal the wakeup. Signals coalesce until the loop thread reads.
    pub(crate) fn signal(&self) {
        let val: u64 = 1;
        unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                &val as *const u64 as *const libc::c_void,
                8,
            );
        }
    }

    fn raw(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// State of a submitted task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskState {
    Pending,
    Succeeded,
    Failed,
}

/// Work submitted to the loop thread.
enum TaskKind {
    AddReceiver {
        config: UdpReceiverConfig,
        writer: Arc<dyn DatagramWriter>,
    },
    AddSender {
        config: UdpSenderConfig,
    },
    RemovePort {
        handle: PortHandle,
    },
    Resolve {
        uri: EndpointUri,
    },
}

/// One task's inputs and outputs. Lives in the slot map, guarded by the loop
/// mutex, from submission until the submitter collects it.
struct TaskSlot {
    state: TaskState,
    kind: Option<TaskKind>,
    /// Port affected by the task, set by the handler. On failure this is the
    /// partially-created port whose async close the submitter must await.
    port: Option<PortHandle>,
    /// Actually bound address, copied back into the caller's config.
    bound_address: Option<SocketAddr>,
    /// Outbound writer published by add_udp_sender.
    sender: Option<DatagramSender>,
    /// Resolution result.
    resolved: Option<SocketAddr>,
}

impl TaskSlot {
    fn new(kind: TaskKind) -> TaskSlot {
        TaskSlot {
            state: TaskState::Pending,
            kind: Some(kind),
            port: None,
            bound_address: None,
            sender: None,
            resolved: None,
        }
    }
}

/// State shared between application threads and the loop thread.
///
/// One mutex guards everything; `task_cond` signals task-state transitions
/// away from Pending, `close_cond` signals removal from `closing_ports`.
struct Shared {
    state: Mutex<LoopState>,
    task_cond: Condvar,
    close_cond: Condvar,
}

struct LoopState {
    /// FIFO of task ids not yet picked up by the loop thread.
    queue: VecDeque<u64>,
    /// Live task slots keyed by task id. Pending resolves stay here until
    /// the resolver hands the result back.
    slots: HashMap<u64, TaskSlot>,
    next_task_id: u64,
    /// Handles of currently open ports, in insertion order.
    open_ports: Vec<PortHandle>,
    /// Handles of ports whose async close is in progress.
    closing_ports: Vec<PortHandle>,
    /// Set when shutdown begins or the loop thread dies; gates `valid()`.
    stopping: bool,
}

impl LoopState {
    fn new() -> LoopState {
        LoopState {
            queue: VecDeque::new(),
            slots: HashMap::new(),
            next_task_id: 0,
            open_ports: Vec::new(),
            closing_ports: Vec::new(),
            stopping: false,
        }
    }
}

/// Event loop owning a set of UDP ports behind a dedicated thread.
///
/// The loop thread is the sole mutator of OS-level handles (the ring, the
/// wakeup eventfds, the port sockets). Application threads submit work
/// through the public methods, which park the caller until the loop thread
/// completes the task. All methods are safe to call concurrently from any
/// thread except the loop thread itself (a writer callback calling back into
/// the loop would deadlock).
///
/// Dropping the loop signals the stop wakeup, closes every remaining port,
/// and joins the thread. Outstanding calls should be allowed to finish
/// before dropping.
pub struct EventLoop {
    shared: Arc<Shared>,
    task_wakeup: Arc<EventFd>,
    stop_wakeup: Arc<EventFd>,
    thread: Option<thread::JoinHandle<()>>,
}

impl EventLoop {
    /// Start the event loop: create the wakeup handles, spawn the loop
    /// thread, and build the io_uring driver on it. Blocks until the driver
    /// is ready or failed to construct.
    pub fn start(config: Config) -> Result<EventLoop, Error> {
        config.validate()?;

        let shared = Arc::new(Shared {
            state: Mutex::new(LoopState::new()),
            task_cond: Condvar::new(),
            close_cond: Condvar::new(),
        });
        let task_wakeup = Arc::new(EventFd::new()?);
        let stop_wakeup = Arc::new(EventFd::new()?);
        let data_wakeup = Arc::new(EventFd::new()?);

        let (outbound_tx, outbound_rx) = unbounded();
        let (resolve_tx, resolve_rx) = unbounded();
        let resolver = Resolver::spawn(resolve_tx, data_wakeup.clone())?;

        let wakeups = WakeupSet {
            task: task_wakeup.clone(),
            stop: stop_wakeup.clone(),
            data: data_wakeup,
        };

        // The ring requires single-issuer submission, so the driver is
        // constructed on the loop thread and the outcome reported back.
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let thread_shared = shared.clone();
        let thread = thread::Builder::new()
            .name("packetline-loop".to_string())
            .spawn(move || {
                let mut driver = match Driver::new(
                    &config,
                    thread_shared,
                    wakeups,
                    outbound_tx,
                    outbound_rx,
                    resolve_rx,
                    resolver,
                ) {
                    Ok(driver) => {
                        let _ = ready_tx.send(Ok(()));
                        driver
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                driver.run();
            })
            .map_err(Error::Io)?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(EventLoop {
                shared,
                task_wakeup,
                stop_wakeup,
                thread: Some(thread),
            }),
            Ok(Err(err)) => {
                let _ = thread.join();
                Err(err)
            }
            Err(_) => {
                let _ = thread.join();
                Err(Error::RingSetup("loop thread died during setup".into()))
            }
        }
    }

    /// True while the loop thread is running. Once false (drop has begun or
    /// the loop died on a fatal ring error), every operation except this and
    /// `num_ports` panics.
    pub fn valid(&self) -> bool {
        !self.shared.state.lock().unwrap().stopping
    }

    /// Number of currently open ports.
    pub fn num_ports(&self) -> usize {
        self.shared.state.lock().unwrap().open_ports.len()
    }

    /// Bind a UDP receiver port at `config.bind_address` (port 0 selects a
    /// kernel-chosen port). On success `config.bind_address` is rewritten to
    /// the actually bound address and inbound datagrams are delivered to
    /// `writer` on the loop thread. On failure the partially-created port is
    /// fully closed before `None` is returned.
    pub fn add_udp_receiver(
        &self,
        config: &mut UdpReceiverConfig,
        writer: Arc<dyn DatagramWriter>,
    ) -> Option<PortHandle> {
        let task = self.run_task(TaskKind::AddReceiver {
            config: config.clone(),
            writer,
        });
        if task.state == TaskState::Failed {
            if let Some(handle) = task.port {
                self.wait_port_closed(handle);
            }
            return None;
        }
        config.bind_address = task
            .bound_address
            .expect("receiver task succeeded without a bound address");
        task.port
    }

    /// Bind a UDP sender port and return its handle together with the
    /// writer accepting outbound datagrams. `config.bind_address` is
    /// rewritten to the actually bound address. Same failure contract as
    /// [`add_udp_receiver`](Self::add_udp_receiver).
    pub fn add_udp_sender(
        &self,
        config: &mut UdpSenderConfig,
    ) -> Option<(PortHandle, DatagramSender)> {
        let task = self.run_task(TaskKind::AddSender {
            config: config.clone(),
        });
        if task.state == TaskState::Failed {
            if let Some(handle) = task.port {
                self.wait_port_closed(handle);
            }
            return None;
        }
        config.bind_address = task
            .bound_address
            .expect("sender task succeeded without a bound address");
        let handle = task.port.expect("sender task succeeded without a port");
        let sender = task.sender.expect("sender task succeeded without a writer");
        Some((handle, sender))
    }

    /// Remove a previously added port, blocking until its asynchronous close
    /// has finished. Panics if the handle is unknown (stale, already
    /// removed, or from another loop).
    pub fn remove_port(&self, handle: PortHandle) {
        let task = self.run_task(TaskKind::RemovePort { handle });
        if task.state == TaskState::Failed {
            panic!("event loop: can't remove port: unknown handle {handle:?}");
        }
        self.wait_port_closed(handle);
    }

    /// Resolve the host of `uri` to a socket address, blocking the caller
    /// until the asynchronous resolution completes. Returns `None` when the
    /// host does not resolve.
    pub fn resolve_endpoint_address(&self, uri: &EndpointUri) -> Option<SocketAddr> {
        let task = self.run_task(TaskKind::Resolve { uri: uri.clone() });
        if task.state == TaskState::Succeeded {
            task.resolved
        } else {
            None
        }
    }

    /// Enqueue a task, signal the task wakeup, and park until the loop
    /// thread moves the task out of Pending.
    fn run_task(&self, kind: TaskKind) -> TaskSlot {
        let mut st = self.shared.state.lock().unwrap();
        if st.stopping {
            panic!("event loop: can't use invalid loop");
        }

        let id = st.next_task_id;
        st.next_task_id += 1;
        st.slots.insert(id, TaskSlot::new(kind));
        st.queue.push_back(id);

        // Signal before waiting: the loop may already be draining.
        self.task_wakeup.signal();

        while st.slots.get(&id).expect("task slot vanished").state == TaskState::Pending {
            st = self.shared.task_cond.wait(st).unwrap();
        }
        st.slots.remove(&id).expect("task slot vanished")
    }

    /// Park until `handle` is no longer in the closing set.
    fn wait_port_closed(&self, handle: PortHandle) {
        let mut st = self.shared.state.lock().unwrap();
        while st.closing_ports.contains(&handle) {
            st = self.shared.close_cond.wait(st).unwrap();
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        // Invalidate first, under the mutex, so no run_task can signal the
        // task wakeup after this point.
        self.shared.state.lock().unwrap().stopping = true;
        self.stop_wakeup.signal();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

struct WakeupSet {
    task: Arc<EventFd>,
    stop: Arc<EventFd>,
    data: Arc<EventFd>,
}

/// Failure of a port-open attempt. `closing` carries the handle when the
/// port got far enough that it must drain through the async close pipeline.
struct OpenFailure {
    closing: Option<PortHandle>,
    err: io::Error,
}

/// I/O driver owned by the loop thread: the ring, the port table, and the
/// cross-thread queues. The only mutator of OS-level handles.
struct Driver {
    ring: Ring,
    ports: PortTable,
    shared: Arc<Shared>,
    wakeups: WakeupSet,
    task_buf: [u8; 8],
    stop_buf: [u8; 8],
    data_buf: [u8; 8],
    /// Armed eventfd reads not yet completed. Drained to zero during stop.
    armed_wakeups: u32,
    outbound_tx: crossbeam_channel::Sender<Outbound>,
    outbound_rx: Receiver<Outbound>,
    resolve_rx: Receiver<ResolveOutcome>,
    resolver: Resolver,
    recv_buffer_size: usize,
    send_queue_depth: usize,
    stopping: bool,
    /// Reusable CQE batch: (user_data, result).
    cqe_batch: Vec<(u64, i32)>,
}

impl Driver {
    fn new(
        config: &Config,
        shared: Arc<Shared>,
        wakeups: WakeupSet,
        outbound_tx: crossbeam_channel::Sender<Outbound>,
        outbound_rx: Receiver<Outbound>,
        resolve_rx: Receiver<ResolveOutcome>,
        resolver: Resolver,
    ) -> Result<Driver, Error> {
        let ring = Ring::setup(config)?;
        ring.register_files_sparse(config.max_ports)?;

        Ok(Driver {
            ring,
            ports: PortTable::new(config.max_ports),
            shared,
            wakeups,
            task_buf: [0u8; 8],
            stop_buf: [0u8; 8],
            data_buf: [0u8; 8],
            armed_wakeups: 0,
            outbound_tx,
            outbound_rx,
            resolve_rx,
            resolver,
            recv_buffer_size: config.recv_buffer_size,
            send_queue_depth: config.send_queue_depth,
            stopping: false,
            cqe_batch: Vec::with_capacity(config.sq_entries as usize * 4),
        })
    }

    fn run(&mut self) {
        log::debug!("event loop: starting");
        if let Err(err) = self.run_inner() {
            log::error!("event loop: fatal ring error: {err}");
        }
        self.finish();
        log::debug!("event loop: finished");
    }

    fn run_inner(&mut self) -> io::Result<()> {
        self.arm_task_wakeup()?;
        self.arm_stop_wakeup()?;
        self.arm_data_wakeup()?;

        while !self.stopping {
            self.ring.submit_and_wait(1)?;
            self.drain_completions();
        }

        self.run_shutdown();
        Ok(())
    }

    /// Drain until every port slot and wakeup read has completed. Each
    /// iteration arms a timeout so submit_and_wait can't block indefinitely.
    fn run_shutdown(&mut self) {
        let drain_ts = io_uring::types::Timespec::new().nsec(100_000_000); // 100ms
        for _ in 0..100 {
            if self.armed_wakeups == 0 && self.ports.active_count() == 0 {
                return;
            }
            let ud = UserData::encode(OpTag::DrainTimeout, 0, 0);
            let _ = self.ring.submit_drain_timeout(&drain_ts, ud.raw());
            if self.ring.submit_and_wait(1).is_err() {
                return;
            }
            self.drain_completions();
        }
        log::warn!(
            "event loop: shutdown drain timed out with {} port slots still active",
            self.ports.active_count()
        );
    }

    /// Fail every parked task and close waiter so no application thread is
    /// left blocked once the loop thread is gone.
    fn finish(&mut self) {
        let mut st = self.shared.state.lock().unwrap();
        st.stopping = true;
        st.queue.clear();
        for slot in st.slots.values_mut() {
            if slot.state == TaskState::Pending {
                slot.state = TaskState::Failed;
            }
        }
        st.open_ports.clear();
        st.closing_ports.clear();
        self.shared.task_cond.notify_all();
        self.shared.close_cond.notify_all();
    }

    // ── Wakeup arming ────────────────────────────────────────────────

    fn arm_task_wakeup(&mut self) -> io::Result<()> {
        let ud = UserData::encode(OpTag::TaskWakeup, 0, 0);
        self.ring
            .submit_eventfd_read(self.wakeups.task.raw(), self.task_buf.as_mut_ptr(), ud)?;
        self.armed_wakeups += 1;
        Ok(())
    }

    fn arm_stop_wakeup(&mut self) -> io::Result<()> {
        let ud = UserData::encode(OpTag::StopWakeup, 0, 0);
        self.ring
            .submit_eventfd_read(self.wakeups.stop.raw(), self.stop_buf.as_mut_ptr(), ud)?;
        self.armed_wakeups += 1;
        Ok(())
    }

    fn arm_data_wakeup(&mut self) -> io::Result<()> {
        let ud = UserData::encode(OpTag::DataWakeup, 0, 0);
        self.ring
            .submit_eventfd_read(self.wakeups.data.raw(), self.data_buf.as_mut_ptr(), ud)?;
        self.armed_wakeups += 1;
        Ok(())
    }

    /// Cancel the outstanding task/data eventfd reads. Nothing is re-armed
    /// after this, so the wakeups are effectively closed; the ECANCELED
    /// completions retire the armed reads.
    fn cancel_wakeup_reads(&mut self) {
        let cancel_ud = UserData::encode(OpTag::Cancel, 0, 0);
        let task_ud = UserData::encode(OpTag::TaskWakeup, 0, 0);
        let data_ud = UserData::encode(OpTag::DataWakeup, 0, 0);
        let _ = self.ring.submit_async_cancel(task_ud.raw(), cancel_ud);
        let _ = self.ring.submit_async_cancel(data_ud.raw(), cancel_ud);
    }

    // ── CQE dispatch ─────────────────────────────────────────────────

    fn drain_completions(&mut self) {
        self.cqe_batch.clear();
        {
            let cq = self.ring.ring.completion();
            for cqe in cq {
                self.cqe_batch.push((cqe.user_data(), cqe.result()));
            }
        }
        for i in 0..self.cqe_batch.len() {
            let (user_data, result) = self.cqe_batch[i];
            self.dispatch_cqe(user_data, result);
        }
    }

    fn dispatch_cqe(&mut self, user_data: u64, result: i32) {
        let ud = UserData(user_data);
        let Some(tag) = ud.tag() else { return };
        match tag {
            OpTag::RecvMsg => self.handle_recv(ud, result),
            OpTag::SendMsg => self.handle_send(ud, result),
            OpTag::Close => self.handle_close_cqe(ud),
            OpTag::Cancel => {}
            OpTag::TaskWakeup => self.handle_task_wakeup(),
            OpTag::StopWakeup => self.handle_stop_wakeup(),
            OpTag::DataWakeup => self.handle_data_wakeup(),
            OpTag::DrainTimeout => {}
        }
    }

    fn handle_task_wakeup(&mut self) {
        self.armed_wakeups -= 1;
        self.process_tasks();
        if !self.stopping {
            let _ = self.arm_task_wakeup();
        }
    }

    fn handle_data_wakeup(&mut self) {
        self.armed_wakeups -= 1;
        self.drain_outbound();
        self.drain_resolved();
        if !self.stopping {
            let _ = self.arm_data_wakeup();
        }
    }

    /// Stop: move every open port into the close pipeline, close the
    /// wakeups, then drain any still-queued tasks so waiters are notified.
    fn handle_stop_wakeup(&mut self) {
        self.armed_wakeups -= 1;
        self.stopping = true;
        self.async_close_open_ports();
        self.cancel_wakeup_reads();
        self.process_tasks();
    }

    fn handle_recv(&mut self, ud: UserData, result: i32) {
        let index = ud.port_index();
        if self.ports.generation(index) != ud.generation() {
            return;
        }

        let closing;
        let mut delivery = None;
        {
            let Some(io) = self.ports.get_io_mut(index) else {
                return;
            };
            io.recv_armed = false;
            io.inflight_ops -= 1;
            closing = io.lifecycle == Lifecycle::Closing;

            if !closing && result >= 0 {
                let len = result as usize;
                let peer =
                    port::sockaddr_to_socket_addr(&io.recv_addr, io.recv_msghdr.msg_namelen);
                if let (Some(peer), Some(writer)) = (peer, io.writer.clone()) {
                    let payload = Bytes::copy_from_slice(&io.recv_buf[..len]);
                    delivery = Some((writer, Datagram { peer, payload }));
                }
            } else if !closing && result != -libc::ECANCELED {
                // UDP soft errors (e.g. ICMP-induced) must not wedge the port.
                log::debug!(
                    "event loop: recv error on port {}: {}",
                    io.local_addr,
                    io::Error::from_raw_os_error(-result)
                );
            }
        }

        if closing {
            self.maybe_finish_close(index);
            return;
        }

        if let Some((writer, datagram)) = delivery {
            metrics::DATAGRAMS_RECEIVED.increment();
            metrics::BYTES_RECEIVED.add(datagram.payload.len() as u64);
            writer.write(datagram);
        }

        let generation = self.ports.generation(index);
        let _ = self.arm_recv(index, generation);
    }

    fn handle_send(&mut self, ud: UserData, result: i32) {
        let index = ud.port_index();
        if self.ports.generation(index) != ud.generation() {
            return;
        }
        let next;
        {
            let Some(io) = self.ports.get_io_mut(index) else {
                return;
            };
            io.send_in_flight = false;
            io.inflight_ops -= 1;
            io.current_send = None;

            if io.lifecycle == Lifecycle::Closing {
                next = None;
            } else {
                if result >= 0 {
                    metrics::DATAGRAMS_SENT.increment();
                    metrics::BYTES_SENT.add(result as u64);
                } else {
                    log::debug!(
                        "event loop: send error on port {}: {}",
                        io.local_addr,
                        io::Error::from_raw_os_error(-result)
                    );
                }
                next = io.send_queue.pop_front();
            }
        }

        match next {
            Some((peer, payload)) => self.start_send(index, ud.generation(), peer, payload),
            None => self.maybe_finish_close(index),
        }
    }

    fn handle_close_cqe(&mut self, ud: UserData) {
        let index = ud.port_index();
        if self.ports.generation(index) != ud.generation() {
            return;
        }
        if let Some(io) = self.ports.get_io_mut(index) {
            io.inflight_ops -= 1;
        }
        self.maybe_finish_close(index);
    }

    /// Finish an async close once every in-flight SQE for the slot has
    /// completed: recycle the slot and notify close waiters.
    fn maybe_finish_close(&mut self, index: u32) {
        let done = match self.ports.get_io(index) {
            Some(io) => io.lifecycle == Lifecycle::Closing && io.inflight_ops == 0,
            None => false,
        };
        if !done {
            return;
        }

        let generation = self.ports.generation(index);
        let handle = PortHandle { index, generation };
        let local_addr = self.ports.get_io(index).map(|io| io.local_addr);
        self.ports.release(index);
        metrics::PORTS_CLOSED.increment();
        if let Some(addr) = local_addr {
            log::debug!("event loop: asynchronous close finished: port {addr}");
        }

        let mut st = self.shared.state.lock().unwrap();
        if let Some(pos) = st.closing_ports.iter().position(|h| *h == handle) {
            st.closing_ports.remove(pos);
            self.shared.close_cond.notify_all();
        }
    }

    // ── Task processing ──────────────────────────────────────────────

    /// Drain the task FIFO under the mutex and run each handler on the loop
    /// thread. Waiters are notified once per drain.
    fn process_tasks(&mut self) {
        let shared = self.shared.clone();
        let mut st = shared.state.lock().unwrap();

        let mut notify = false;
        while let Some(id) = st.queue.pop_front() {
            let Some(mut slot) = st.slots.remove(&id) else {
                continue;
            };
            let kind = slot.kind.take().expect("task kind already taken");
            slot.state = self.run_handler(&mut st, id, &mut slot, kind);

            if slot.state != TaskState::Pending {
                notify = true;
                metrics::TASKS_PROCESSED.increment();
                if slot.state == TaskState::Failed {
                    metrics::TASKS_FAILED.increment();
                }
            }
            st.slots.insert(id, slot);
        }

        if notify {
            self.shared.task_cond.notify_all();
        }
    }

    fn run_handler(
        &mut self,
        st: &mut LoopState,
        id: u64,
        slot: &mut TaskSlot,
        kind: TaskKind,
    ) -> TaskState {
        match kind {
            TaskKind::AddReceiver { config, writer } => {
                self.task_add_receiver(st, slot, config, writer)
            }
            TaskKind::AddSender { config } => self.task_add_sender(st, slot, config),
            TaskKind::RemovePort { handle } => self.task_remove_port(st, handle),
            TaskKind::Resolve { uri } => self.task_resolve(slot, id, &uri),
        }
    }

    fn task_add_receiver(
        &mut self,
        st: &mut LoopState,
        slot: &mut TaskSlot,
        config: UdpReceiverConfig,
        writer: Arc<dyn DatagramWriter>,
    ) -> TaskState {
        match self.open_port(
            st,
            PortKind::Receiver,
            config.bind_address,
            false,
            Some(writer),
        ) {
            Ok((handle, local_addr)) => {
                st.open_ports.push(handle);
                slot.port = Some(handle);
                slot.bound_address = Some(local_addr);
                metrics::PORTS_OPENED.increment();
                metrics::PORTS_ACTIVE.increment();
                log::debug!("event loop: opened receiver port {local_addr}");
                TaskState::Succeeded
            }
            Err(failure) => {
                log::error!(
                    "event loop: can't add receiver port {}: {}",
                    config.bind_address,
                    failure.err
                );
                slot.port = failure.closing;
                TaskState::Failed
            }
        }
    }

    fn task_add_sender(
        &mut self,
        st: &mut LoopState,
        slot: &mut TaskSlot,
        config: UdpSenderConfig,
    ) -> TaskState {
        match self.open_port(
            st,
            PortKind::Sender,
            config.bind_address,
            config.broadcast,
            None,
        ) {
            Ok((handle, local_addr)) => {
                st.open_ports.push(handle);
                slot.port = Some(handle);
                slot.bound_address = Some(local_addr);
                slot.sender = Some(DatagramSender {
                    tx: self.outbound_tx.clone(),
                    wakeup: self.wakeups.data.clone(),
                    port_index: handle.index,
                    generation: handle.generation,
                });
                metrics::PORTS_OPENED.increment();
                metrics::PORTS_ACTIVE.increment();
                log::debug!("event loop: opened sender port {local_addr}");
                TaskState::Succeeded
            }
            Err(failure) => {
                log::error!(
                    "event loop: can't add sender port {}: {}",
                    config.bind_address,
                    failure.err
                );
                slot.port = failure.closing;
                TaskState::Failed
            }
        }
    }

    fn task_remove_port(&mut self, st: &mut LoopState, handle: PortHandle) -> TaskState {
        let Some(pos) = st.open_ports.iter().position(|h| *h == handle) else {
            return TaskState::Failed;
        };
        st.open_ports.remove(pos);
        metrics::PORTS_ACTIVE.decrement();

        if let Some(io) = self.ports.get_io(handle.index) {
            log::debug!("event loop: removing port {}", io.local_addr);
        }
        self.async_close_port(st, handle);
        TaskState::Succeeded
    }

    fn task_resolve(&mut self, slot: &mut TaskSlot, id: u64, uri: &EndpointUri) -> TaskState {
        if self.stopping {
            return TaskState::Failed;
        }
        let mut resolved = None;
        if self.resolver.async_resolve(id, uri, &mut resolved) {
            return TaskState::Pending;
        }
        match resolved {
            Some(address) => {
                slot.resolved = Some(address);
                metrics::RESOLVES_COMPLETED.increment();
                TaskState::Succeeded
            }
            None => {
                metrics::RESOLVES_FAILED.increment();
                TaskState::Failed
            }
        }
    }

    // ── Port lifecycle ───────────────────────────────────────────────

    /// Create, bind, and register a port socket, then arm its I/O.
    fn open_port(
        &mut self,
        st: &mut LoopState,
        kind: PortKind,
        bind_address: SocketAddr,
        broadcast: bool,
        writer: Option<Arc<dyn DatagramWriter>>,
    ) -> Result<(PortHandle, SocketAddr), OpenFailure> {
        if self.stopping {
            return Err(OpenFailure {
                closing: None,
                err: io::Error::other("event loop is stopping"),
            });
        }
        let Some(index) = self.ports.allocate() else {
            return Err(OpenFailure {
                closing: None,
                err: io::Error::other("port limit reached"),
            });
        };
        let generation = self.ports.generation(index);
        let handle = PortHandle { index, generation };

        let (fd, local_addr) = match port::open_udp_socket(bind_address, broadcast) {
            Ok(opened) => opened,
            Err(err) => {
                self.ports.release(index);
                return Err(OpenFailure { closing: None, err });
            }
        };

        // Register in the fixed file table; the original fd is closed either way.
        let registered = self.ring.register_files_update(index, &[fd]);
        unsafe {
            libc::close(fd);
        }
        if let Err(err) = registered {
            self.ports.release(index);
            return Err(OpenFailure { closing: None, err });
        }

        self.ports
            .install(index, PortIo::new(kind, local_addr, writer, self.recv_buffer_size));

        if kind == PortKind::Receiver {
            if let Err(err) = self.arm_recv(index, generation) {
                // The descriptor is registered, so tear down through the
                // async close pipeline.
                let closing = self.async_close_port(st, handle).then_some(handle);
                return Err(OpenFailure { closing, err });
            }
        }

        Ok((handle, local_addr))
    }

    /// Arm a single-shot recvmsg for a receiver port.
    fn arm_recv(&mut self, index: u32, generation: u32) -> io::Result<()> {
        let Some(io) = self.ports.get_io_mut(index) else {
            return Ok(());
        };
        io.reset_recv_namelen();
        let msghdr = &mut *io.recv_msghdr as *mut libc::msghdr;
        let ud = UserData::encode(OpTag::RecvMsg, index, generation);
        self.ring.submit_recvmsg(index, msghdr, ud)?;
        io.recv_armed = true;
        io.inflight_ops += 1;
        Ok(())
    }

    /// Move every open port into the async close pipeline (stop path).
    fn async_close_open_ports(&mut self) {
        let shared = self.shared.clone();
        let mut st = shared.state.lock().unwrap();
        while let Some(handle) = st.open_ports.pop() {
            metrics::PORTS_ACTIVE.decrement();
            self.async_close_port(&mut st, handle);
        }
    }

    /// Begin asynchronous close of a port. Returns `true` when completion
    /// will be signaled later through the close pipeline; `false` when the
    /// port had nothing in flight and was released synchronously.
    fn async_close_port(&mut self, st: &mut LoopState, handle: PortHandle) -> bool {
        let Some(io) = self.ports.get_io_mut(handle.index) else {
            return false;
        };
        if io.lifecycle == Lifecycle::Closing {
            return true;
        }
        io.lifecycle = Lifecycle::Closing;
        io.send_queue.clear();

        if io.recv_armed {
            let recv_ud = UserData::encode(OpTag::RecvMsg, handle.index, handle.generation);
            let cancel_ud = UserData::encode(OpTag::Cancel, handle.index, handle.generation);
            let _ = self.ring.submit_async_cancel(recv_ud.raw(), cancel_ud);
        }

        let close_ud = UserData::encode(OpTag::Close, handle.index, handle.generation);
        match self.ring.submit_close(handle.index, close_ud) {
            Ok(()) => {
                io.inflight_ops += 1;
            }
            Err(err) => {
                // Can't get a close CQE; release the slot now. The direct
                // descriptor is reclaimed when the ring shuts down.
                log::error!(
                    "event loop: can't submit close for port {}: {err}",
                    io.local_addr
                );
                if io.inflight_ops == 0 {
                    self.ports.release(handle.index);
                    return false;
                }
            }
        }

        st.closing_ports.push(handle);
        true
    }

    // ── Datagram paths ───────────────────────────────────────────────

    /// Drain outbound datagrams published by sender writers.
    fn drain_outbound(&mut self) {
        while let Ok(out) = self.outbound_rx.try_recv() {
            let index = out.port_index;
            if self.ports.generation(index) != out.generation {
                continue;
            }
            let Some(io) = self.ports.get_io_mut(index) else {
                continue;
            };
            if io.lifecycle != Lifecycle::Open || io.kind != PortKind::Sender {
                continue;
            }
            if io.send_in_flight {
                if io.send_queue.len() >= self.send_queue_depth {
                    metrics::SEND_QUEUE_OVERFLOW.increment();
                    log::warn!(
                        "event loop: send queue full on port {}, dropping datagram",
                        io.local_addr
                    );
                    continue;
                }
                io.send_queue
                    .push_back((out.datagram.peer, out.datagram.payload));
            } else {
                self.start_send(index, out.generation, out.datagram.peer, out.datagram.payload);
            }
        }
    }

    /// Submit a sendmsg for a sender port. The payload is parked in the port
    /// slot so the bytes stay alive until the CQE arrives.
    fn start_send(&mut self, index: u32, generation: u32, peer: SocketAddr, payload: Bytes) {
        let Some(io) = self.ports.get_io_mut(index) else {
            return;
        };
        let addr_len = port::socket_addr_to_sockaddr(peer, &mut io.send_addr);
        io.send_iov.iov_base = payload.as_ptr() as *mut libc::c_void;
        io.send_iov.iov_len = payload.len();
        io.send_msghdr.msg_namelen = addr_len;
        io.current_send = Some(payload);

        let msghdr = &*io.send_msghdr as *const libc::msghdr;
        let ud = UserData::encode(OpTag::SendMsg, index, generation);
        match self.ring.submit_sendmsg(index, msghdr, ud) {
            Ok(()) => {
                io.send_in_flight = true;
                io.inflight_ops += 1;
            }
            Err(err) => {
                io.current_send = None;
                log::warn!(
                    "event loop: can't submit send on port {}: {err}",
                    io.local_addr
                );
            }
        }
    }

    /// Drain resolver completions and hand results back to parked tasks.
    fn drain_resolved(&mut self) {
        while let Ok(outcome) = self.resolve_rx.try_recv() {
            self.handle_resolved(outcome);
        }
    }

    fn handle_resolved(&mut self, outcome: ResolveOutcome) {
        let mut st = self.shared.state.lock().unwrap();
        let Some(slot) = st.slots.get_mut(&outcome.task_id) else {
            return;
        };
        match outcome.address {
            Some(address) => {
                slot.resolved = Some(address);
                slot.state = TaskState::Succeeded;
                metrics::RESOLVES_COMPLETED.increment();
            }
            None => {
                slot.state = TaskState::Failed;
                metrics::RESOLVES_FAILED.increment();
            }
        }
        metrics::TASKS_PROCESSED.increment();
        if slot.state == TaskState::Failed {
            metrics::TASKS_FAILED.increment();
        }
        self.shared.task_cond.notify_all();
    }
}
