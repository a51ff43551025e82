use std::io;
use std::os::fd::RawFd;

use io_uring::types::{Fd, Fixed};
use io_uring::{IoUring, opcode, squeue};

use crate::completion::UserData;
use crate::config::Config;

/// Wrapper around IoUring providing high-level SQE submission helpers.
///
/// The ring must be created on the thread that submits to it
/// (`IORING_SETUP_SINGLE_ISSUER`), which is why driver construction happens
/// on the loop thread.
pub(crate) struct Ring {
    pub(crate) ring: IoUring,
}

impl Ring {
    /// Create and configure the io_uring instance.
    pub fn setup(config: &Config) -> io::Result<Self> {
        let cq_entries = config
            .sq_entries
            .checked_mul(4)
            .unwrap_or(config.sq_entries);

        let mut builder = IoUring::builder();
        builder.setup_cqsize(cq_entries);
        builder.setup_coop_taskrun();
        builder.setup_single_issuer();
        builder.setup_defer_taskrun();

        let ring = builder.build(config.sq_entries)?;

        Ok(Ring { ring })
    }

    /// Register a sparse file table for direct descriptors.
    pub fn register_files_sparse(&self, count: u32) -> io::Result<()> {
        self.ring.submitter().register_files_sparse(count)?;
        Ok(())
    }

    /// Update registered file table at given offset.
    pub fn register_files_update(&self, offset: u32, fds: &[RawFd]) -> io::Result<()> {
        self.ring.submitter().register_files_update(offset, fds)?;
        Ok(())
    }

    /// Submit a recvmsg for a port (single-shot with pre-allocated buffer).
    pub fn submit_recvmsg(
        &mut self,
        fd_index: u32,
        msghdr: *mut libc::msghdr,
        user_data: UserData,
    ) -> io::Result<()> {
        let entry = opcode::RecvMsg::new(Fixed(fd_index), msghdr)
            .build()
            .user_data(user_data.raw());
        unsafe {
            self.push_sqe(entry)?;
        }
        Ok(())
    }

    /// Submit a sendmsg for a port with destination address.
    pub fn submit_sendmsg(
        &mut self,
        fd_index: u32,
        msghdr: *const libc::msghdr,
        user_data: UserData,
    ) -> io::Result<()> {
        let entry = opcode::SendMsg::new(Fixed(fd_index), msghdr)
            .build()
            .user_data(user_data.raw());
        unsafe {
            self.push_sqe(entry)?;
        }
        Ok(())
    }

    /// Submit an eventfd read (8 bytes).
    pub fn submit_eventfd_read(
        &mut self,
        eventfd: RawFd,
        buf: *mut u8,
        user_data: UserData,
    ) -> io::Result<()> {
        let entry = opcode::Read::new(Fd(eventfd), buf, 8)
            .build()
            .user_data(user_data.raw());
        unsafe {
            self.push_sqe(entry)?;
        }
        Ok(())
    }

    /// Submit a close for a direct descriptor.
    pub fn submit_close(&mut self, fd_index: u32, user_data: UserData) -> io::Result<()> {
        let entry = opcode::Close::new(Fixed(fd_index))
            .build()
            .user_data(user_data.raw());
        unsafe {
            self.push_sqe(entry)?;
        }
        Ok(())
    }

    /// Submit an async cancel targeting a specific user_data value.
    pub fn submit_async_cancel(
        &mut self,
        target_user_data: u64,
        user_data: UserData,
    ) -> io::Result<()> {
        let entry = opcode::AsyncCancel::new(target_user_data)
            .build()
            .user_data(user_data.raw());
        unsafe {
            self.push_sqe(entry)?;
        }
        Ok(())
    }

    /// Submit a timeout SQE bounding one shutdown drain iteration.
    /// Produces a CQE with the given user_data when it fires (-ETIME).
    /// The timespec only needs to stay valid until `submit_and_wait` returns.
    pub fn submit_drain_timeout(
        &mut self,
        ts: *const io_uring::types::Timespec,
        user_data: u64,
    ) -> io::Result<()> {
        let entry = opcode::Timeout::new(ts).build().user_data(user_data);
        unsafe {
            self.push_sqe(entry)?;
        }
        Ok(())
    }

    /// Submit all pending SQEs and wait for at least `min_complete` CQEs.
    pub fn submit_and_wait(&self, min_complete: u32) -> io::Result<()> {
        self.ring
            .submitter()
            .submit_and_wait(min_complete as usize)?;
        Ok(())
    }

    /// Push an SQE to the submission queue.
    ///
    /// # Safety
    /// The SQE must reference valid memory for the lifetime of the operation.
    pub(crate) unsafe fn push_sqe(&mut self, entry: squeue::Entry) -> io::Result<()> {
        // Try to push; if SQ is full, submit first to make room.
        unsafe {
            if self.ring.submission().push(&entry).is_err() {
                self.ring.submit()?;
                if self.ring.submission().push(&entry).is_err() {
                    crate::metrics::SQE_SUBMIT_FAILURES.increment();
                    return Err(io::Error::other("SQ still full after submit"));
                }
            }
        }
        Ok(())
    }
}
