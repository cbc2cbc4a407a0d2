// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The transport contract to the kernel driver (`spec.md` §6), and the two
//! implementations of it: `linux` (a real `/dev/binder`-shaped character
//! device, grounded in `other_examples`' raw binder client) and `loopback`
//! (an in-process simulated kernel used only by tests, see `SPEC_FULL.md`
//! §9).

use crate::error::StatusCode;

/// Outbound command tags (`spec.md` §3 "Command"). The discriminants here
/// are this runtime's own wire encoding of the tag field in a `(tag,
/// payload)` record; the real Linux binder ABI's numeric `BC_*` values are
/// kernel UAPI constants consumed only inside `driver::linux`'s ioctl
/// plumbing (see the constants there), not by this cross-implementation
/// tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum BcCommand {
    Transaction = 0,
    Reply = 1,
    AcquireResult = 2,
    FreeBuffer = 3,
    Increfs = 4,
    Acquire = 5,
    Release = 6,
    Decrefs = 7,
    IncrefsDone = 8,
    AcquireDone = 9,
    AttemptAcquire = 10,
    RequestDeathNotification = 11,
    ClearDeathNotification = 12,
    DeadBinderDone = 13,
    RegisterLooper = 14,
    EnterLooper = 15,
    ExitLooper = 16,
}

/// Inbound command tags (`spec.md` §3 "Command").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum BrCommand {
    Error = 0,
    Ok = 1,
    Transaction = 2,
    Reply = 3,
    AcquireResult = 4,
    DeadReply = 5,
    TransactionComplete = 6,
    Increfs = 7,
    Acquire = 8,
    Release = 9,
    Decrefs = 10,
    AttemptAcquire = 11,
    Noop = 12,
    SpawnLooper = 13,
    Finished = 14,
    DeadBinder = 15,
    ClearDeathNotificationDone = 16,
    FailedReply = 17,
    FrozenReply = 18,
    OnewaySpamSuspect = 19,
}

impl BrCommand {
    pub fn from_i32(v: i32) -> Option<BrCommand> {
        use BrCommand::*;
        const ALL: &[BrCommand] = &[
            Error,
            Ok,
            Transaction,
            Reply,
            AcquireResult,
            DeadReply,
            TransactionComplete,
            Increfs,
            Acquire,
            Release,
            Decrefs,
            AttemptAcquire,
            Noop,
            SpawnLooper,
            Finished,
            DeadBinder,
            ClearDeathNotificationDone,
            FailedReply,
            FrozenReply,
            OnewaySpamSuspect,
        ];
        ALL.iter().copied().find(|c| *c as i32 == v)
    }
}

impl BcCommand {
    pub(crate) fn from_i32(v: i32) -> Option<BcCommand> {
        use BcCommand::*;
        const ALL: &[BcCommand] = &[
            Transaction,
            Reply,
            AcquireResult,
            FreeBuffer,
            Increfs,
            Acquire,
            Release,
            Decrefs,
            IncrefsDone,
            AcquireDone,
            AttemptAcquire,
            RequestDeathNotification,
            ClearDeathNotification,
            DeadBinderDone,
            RegisterLooper,
            EnterLooper,
            ExitLooper,
        ];
        ALL.iter().copied().find(|c| *c as i32 == v)
    }
}

/// Hand-rolled wire encoding for the abstract `(tag, payload)` command
/// stream (`spec.md` §3 "Command", §6). `thread_state` produces/consumes
/// it; `driver::loopback` parses just enough of it to route transactions
/// between simulated peers. `driver::linux` never parses this format -- it
/// hands `write_buf`/`read_buf` to the real kernel driver as opaque bytes.
pub(crate) mod wire {
    use super::{BcCommand, BrCommand};

    #[derive(Debug, Clone)]
    pub(crate) enum OutRecord {
        Transaction {
            handle: u32,
            code: u32,
            flags: u32,
            data: Vec<u8>,
            offsets: Vec<u32>,
        },
        Reply {
            /// Peer to deliver the reply to. Real binder tracks this via the
            /// per-thread transaction stack rather than an explicit field;
            /// the loopback kernel has no such stack, so `thread_state`
            /// passes the sender peer it read off the original
            /// `InRecord::Transaction` back through here.
            to_peer: u32,
            flags: u32,
            data: Vec<u8>,
            offsets: Vec<u32>,
        },
        AcquireResult {
            success: bool,
        },
        FreeBuffer,
        Acquire {
            handle: u32,
        },
        Release {
            handle: u32,
        },
        Increfs {
            handle: u32,
        },
        Decrefs {
            handle: u32,
        },
        AcquireDone {
            token: u64,
        },
        IncrefsDone {
            token: u64,
        },
        RequestDeathNotification {
            handle: u32,
            cookie: u64,
        },
        ClearDeathNotification {
            handle: u32,
            cookie: u64,
        },
        DeadBinderDone {
            cookie: u64,
        },
        RegisterLooper,
        EnterLooper,
        ExitLooper,
    }

    #[derive(Debug, Clone)]
    pub(crate) enum InRecord {
        Error(i32),
        Ok,
        /// `token` is `None` when the transaction targets no specific
        /// local object (dispatch to the process-wide context object).
        Transaction {
            sender_peer: u32,
            code: u32,
            flags: u32,
            token: Option<u64>,
            data: Vec<u8>,
            offsets: Vec<u32>,
        },
        Reply {
            flags: u32,
            status: i32,
            data: Vec<u8>,
            offsets: Vec<u32>,
        },
        AcquireResult {
            success: bool,
        },
        DeadReply,
        TransactionComplete,
        Increfs {
            token: u64,
        },
        Acquire {
            token: u64,
        },
        Release {
            token: u64,
        },
        Decrefs {
            token: u64,
        },
        Noop,
        SpawnLooper,
        Finished,
        DeadBinder {
            handle: u32,
            cookie: u64,
        },
        ClearDeathNotificationDone {
            cookie: u64,
        },
        FailedReply,
        FrozenReply,
        OnewaySpamSuspect,
    }

    struct Writer {
        buf: Vec<u8>,
    }

    impl Writer {
        fn new() -> Self {
            Writer { buf: Vec::new() }
        }
        fn tag(&mut self, t: i32) {
            self.buf.extend_from_slice(&t.to_ne_bytes());
        }
        fn u32(&mut self, v: u32) {
            self.buf.extend_from_slice(&v.to_ne_bytes());
        }
        fn i32(&mut self, v: i32) {
            self.buf.extend_from_slice(&v.to_ne_bytes());
        }
        fn u64(&mut self, v: u64) {
            self.buf.extend_from_slice(&v.to_ne_bytes());
        }
        fn bool(&mut self, v: bool) {
            self.u32(v as u32);
        }
        fn bytes(&mut self, v: &[u8]) {
            self.u32(v.len() as u32);
            self.buf.extend_from_slice(v);
        }
        fn offsets(&mut self, v: &[u32]) {
            self.u32(v.len() as u32);
            for o in v {
                self.u32(*o);
            }
        }
    }

    struct Reader<'a> {
        buf: &'a [u8],
        pos: usize,
    }

    impl<'a> Reader<'a> {
        fn new(buf: &'a [u8]) -> Self {
            Reader { buf, pos: 0 }
        }
        fn remaining(&self) -> bool {
            self.pos < self.buf.len()
        }
        fn tag(&mut self) -> Option<i32> {
            self.i32()
        }
        fn u32(&mut self) -> Option<u32> {
            let b: [u8; 4] = self.buf.get(self.pos..self.pos + 4)?.try_into().ok()?;
            self.pos += 4;
            Some(u32::from_ne_bytes(b))
        }
        fn i32(&mut self) -> Option<i32> {
            self.u32().map(|v| v as i32)
        }
        fn u64(&mut self) -> Option<u64> {
            let b: [u8; 8] = self.buf.get(self.pos..self.pos + 8)?.try_into().ok()?;
            self.pos += 8;
            Some(u64::from_ne_bytes(b))
        }
        fn bool(&mut self) -> Option<bool> {
            self.u32().map(|v| v != 0)
        }
        fn bytes(&mut self) -> Option<Vec<u8>> {
            let len = self.u32()? as usize;
            let slice = self.buf.get(self.pos..self.pos + len)?;
            self.pos += len;
            Some(slice.to_vec())
        }
        fn offsets(&mut self) -> Option<Vec<u32>> {
            let len = self.u32()? as usize;
            let mut out = Vec::with_capacity(len);
            for _ in 0..len {
                out.push(self.u32()?);
            }
            Some(out)
        }
    }

    pub(crate) fn encode_out(records: &[OutRecord]) -> Vec<u8> {
        let mut w = Writer::new();
        for r in records {
            match r {
                OutRecord::Transaction { handle, code, flags, data, offsets } => {
                    w.tag(BcCommand::Transaction as i32);
                    w.u32(*handle);
                    w.u32(*code);
                    w.u32(*flags);
                    w.bytes(data);
                    w.offsets(offsets);
                }
                OutRecord::Reply { to_peer, flags, data, offsets } => {
                    w.tag(BcCommand::Reply as i32);
                    w.u32(*to_peer);
                    w.u32(*flags);
                    w.bytes(data);
                    w.offsets(offsets);
                }
                OutRecord::AcquireResult { success } => {
                    w.tag(BcCommand::AcquireResult as i32);
                    w.bool(*success);
                }
                OutRecord::FreeBuffer => w.tag(BcCommand::FreeBuffer as i32),
                OutRecord::Acquire { handle } => {
                    w.tag(BcCommand::Acquire as i32);
                    w.u32(*handle);
                }
                OutRecord::Release { handle } => {
                    w.tag(BcCommand::Release as i32);
                    w.u32(*handle);
                }
                OutRecord::Increfs { handle } => {
                    w.tag(BcCommand::Increfs as i32);
                    w.u32(*handle);
                }
                OutRecord::Decrefs { handle } => {
                    w.tag(BcCommand::Decrefs as i32);
                    w.u32(*handle);
                }
                OutRecord::AcquireDone { token } => {
                    w.tag(BcCommand::AcquireDone as i32);
                    w.u64(*token);
                }
                OutRecord::IncrefsDone { token } => {
                    w.tag(BcCommand::IncrefsDone as i32);
                    w.u64(*token);
                }
                OutRecord::RequestDeathNotification { handle, cookie } => {
                    w.tag(BcCommand::RequestDeathNotification as i32);
                    w.u32(*handle);
                    w.u64(*cookie);
                }
                OutRecord::ClearDeathNotification { handle, cookie } => {
                    w.tag(BcCommand::ClearDeathNotification as i32);
                    w.u32(*handle);
                    w.u64(*cookie);
                }
                OutRecord::DeadBinderDone { cookie } => {
                    w.tag(BcCommand::DeadBinderDone as i32);
                    w.u64(*cookie);
                }
                OutRecord::RegisterLooper => w.tag(BcCommand::RegisterLooper as i32),
                OutRecord::EnterLooper => w.tag(BcCommand::EnterLooper as i32),
                OutRecord::ExitLooper => w.tag(BcCommand::ExitLooper as i32),
            }
        }
        w.buf
    }

    pub(crate) fn decode_out(buf: &[u8]) -> Vec<OutRecord> {
        let mut r = Reader::new(buf);
        let mut out = Vec::new();
        while r.remaining() {
            let Some(tag) = r.tag() else { break };
            let Some(cmd) = BcCommand::from_i32(tag) else { break };
            let rec = match cmd {
                BcCommand::Transaction => {
                    let (Some(handle), Some(code), Some(flags), Some(data), Some(offsets)) =
                        (r.u32(), r.u32(), r.u32(), r.bytes(), r.offsets())
                    else {
                        break;
                    };
                    OutRecord::Transaction { handle, code, flags, data, offsets }
                }
                BcCommand::Reply => {
                    let (Some(to_peer), Some(flags), Some(data), Some(offsets)) =
                        (r.u32(), r.u32(), r.bytes(), r.offsets())
                    else {
                        break;
                    };
                    OutRecord::Reply { to_peer, flags, data, offsets }
                }
                BcCommand::AcquireResult => {
                    let Some(success) = r.bool() else { break };
                    OutRecord::AcquireResult { success }
                }
                BcCommand::FreeBuffer => OutRecord::FreeBuffer,
                BcCommand::Acquire => {
                    let Some(handle) = r.u32() else { break };
                    OutRecord::Acquire { handle }
                }
                BcCommand::Release => {
                    let Some(handle) = r.u32() else { break };
                    OutRecord::Release { handle }
                }
                BcCommand::Increfs => {
                    let Some(handle) = r.u32() else { break };
                    OutRecord::Increfs { handle }
                }
                BcCommand::Decrefs => {
                    let Some(handle) = r.u32() else { break };
                    OutRecord::Decrefs { handle }
                }
                BcCommand::AcquireDone => {
                    let Some(token) = r.u64() else { break };
                    OutRecord::AcquireDone { token }
                }
                BcCommand::IncrefsDone => {
                    let Some(token) = r.u64() else { break };
                    OutRecord::IncrefsDone { token }
                }
                BcCommand::RequestDeathNotification => {
                    let (Some(handle), Some(cookie)) = (r.u32(), r.u64()) else {
                        break;
                    };
                    OutRecord::RequestDeathNotification { handle, cookie }
                }
                BcCommand::ClearDeathNotification => {
                    let (Some(handle), Some(cookie)) = (r.u32(), r.u64()) else {
                        break;
                    };
                    OutRecord::ClearDeathNotification { handle, cookie }
                }
                BcCommand::DeadBinderDone => {
                    let Some(cookie) = r.u64() else { break };
                    OutRecord::DeadBinderDone { cookie }
                }
                BcCommand::RegisterLooper => OutRecord::RegisterLooper,
                BcCommand::EnterLooper => OutRecord::EnterLooper,
                BcCommand::ExitLooper => OutRecord::ExitLooper,
                BcCommand::AttemptAcquire => break, // unused; see spec.md §4.6
            };
            out.push(rec);
        }
        out
    }

    pub(crate) fn encode_in(records: &[InRecord]) -> Vec<u8> {
        let mut w = Writer::new();
        for r in records {
            match r {
                InRecord::Error(code) => {
                    w.tag(BrCommand::Error as i32);
                    w.i32(*code);
                }
                InRecord::Ok => w.tag(BrCommand::Ok as i32),
                InRecord::Transaction { sender_peer, code, flags, token, data, offsets } => {
                    w.tag(BrCommand::Transaction as i32);
                    w.u32(*sender_peer);
                    w.u32(*code);
                    w.u32(*flags);
                    w.bool(token.is_some());
                    w.u64(token.unwrap_or(0));
                    w.bytes(data);
                    w.offsets(offsets);
                }
                InRecord::Reply { flags, status, data, offsets } => {
                    w.tag(BrCommand::Reply as i32);
                    w.u32(*flags);
                    w.i32(*status);
                    w.bytes(data);
                    w.offsets(offsets);
                }
                InRecord::AcquireResult { success } => {
                    w.tag(BrCommand::AcquireResult as i32);
                    w.bool(*success);
                }
                InRecord::DeadReply => w.tag(BrCommand::DeadReply as i32),
                InRecord::TransactionComplete => w.tag(BrCommand::TransactionComplete as i32),
                InRecord::Increfs { token } => {
                    w.tag(BrCommand::Increfs as i32);
                    w.u64(*token);
                }
                InRecord::Acquire { token } => {
                    w.tag(BrCommand::Acquire as i32);
                    w.u64(*token);
                }
                InRecord::Release { token } => {
                    w.tag(BrCommand::Release as i32);
                    w.u64(*token);
                }
                InRecord::Decrefs { token } => {
                    w.tag(BrCommand::Decrefs as i32);
                    w.u64(*token);
                }
                InRecord::Noop => w.tag(BrCommand::Noop as i32),
                InRecord::SpawnLooper => w.tag(BrCommand::SpawnLooper as i32),
                InRecord::Finished => w.tag(BrCommand::Finished as i32),
                InRecord::DeadBinder { handle, cookie } => {
                    w.tag(BrCommand::DeadBinder as i32);
                    w.u32(*handle);
                    w.u64(*cookie);
                }
                InRecord::ClearDeathNotificationDone { cookie } => {
                    w.tag(BrCommand::ClearDeathNotificationDone as i32);
                    w.u64(*cookie);
                }
                InRecord::FailedReply => w.tag(BrCommand::FailedReply as i32),
                InRecord::FrozenReply => w.tag(BrCommand::FrozenReply as i32),
                InRecord::OnewaySpamSuspect => w.tag(BrCommand::OnewaySpamSuspect as i32),
            }
        }
        w.buf
    }

    pub(crate) fn decode_in(buf: &[u8]) -> Vec<InRecord> {
        let mut r = Reader::new(buf);
        let mut out = Vec::new();
        while r.remaining() {
            let Some(tag) = r.tag() else { break };
            let Some(cmd) = BrCommand::from_i32(tag) else { break };
            let rec = match cmd {
                BrCommand::Error => {
                    let Some(code) = r.i32() else { break };
                    InRecord::Error(code)
                }
                BrCommand::Ok => InRecord::Ok,
                BrCommand::Transaction => {
                    let (Some(sender_peer), Some(code), Some(flags), Some(has_token)) =
                        (r.u32(), r.u32(), r.u32(), r.bool())
                    else {
                        break;
                    };
                    let Some(token_raw) = r.u64() else { break };
                    let (Some(data), Some(offsets)) = (r.bytes(), r.offsets()) else { break };
                    InRecord::Transaction {
                        sender_peer,
                        code,
                        flags,
                        token: has_token.then_some(token_raw),
                        data,
                        offsets,
                    }
                }
                BrCommand::Reply => {
                    let (Some(flags), Some(status), Some(data), Some(offsets)) =
                        (r.u32(), r.i32(), r.bytes(), r.offsets())
                    else {
                        break;
                    };
                    InRecord::Reply { flags, status, data, offsets }
                }
                BrCommand::AcquireResult => {
                    let Some(success) = r.bool() else { break };
                    InRecord::AcquireResult { success }
                }
                BrCommand::DeadReply => InRecord::DeadReply,
                BrCommand::TransactionComplete => InRecord::TransactionComplete,
                BrCommand::Increfs => {
                    let Some(token) = r.u64() else { break };
                    InRecord::Increfs { token }
                }
                BrCommand::Acquire => {
                    let Some(token) = r.u64() else { break };
                    InRecord::Acquire { token }
                }
                BrCommand::Release => {
                    let Some(token) = r.u64() else { break };
                    InRecord::Release { token }
                }
                BrCommand::Decrefs => {
                    let Some(token) = r.u64() else { break };
                    InRecord::Decrefs { token }
                }
                BrCommand::AttemptAcquire => break, // unused; see spec.md §4.6
                BrCommand::Noop => InRecord::Noop,
                BrCommand::SpawnLooper => InRecord::SpawnLooper,
                BrCommand::Finished => InRecord::Finished,
                BrCommand::DeadBinder => {
                    let (Some(handle), Some(cookie)) = (r.u32(), r.u64()) else {
                        break;
                    };
                    InRecord::DeadBinder { handle, cookie }
                }
                BrCommand::ClearDeathNotificationDone => {
                    let Some(cookie) = r.u64() else { break };
                    InRecord::ClearDeathNotificationDone { cookie }
                }
                BrCommand::FailedReply => InRecord::FailedReply,
                BrCommand::FrozenReply => InRecord::FrozenReply,
                BrCommand::OnewaySpamSuspect => InRecord::OnewaySpamSuspect,
            };
            out.push(rec);
        }
        out
    }
}

/// Outcome of one `WRITE_READ` ioctl round trip.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteReadResult {
    pub write_consumed: usize,
    pub read_consumed: usize,
}

/// Abstracts the transport so the runtime can run against a real kernel
/// driver or an in-process simulation of one.
pub trait Driver: Send + Sync {
    /// `ioctl(WRITE_READ, &bwr)`. Blocks for new inbound commands when
    /// `block` is set and nothing is immediately available.
    fn write_read(
        &self,
        write_buf: &[u8],
        read_buf: &mut [u8],
        block: bool,
    ) -> Result<WriteReadResult, StatusCode>;

    /// `ioctl(SET_MAX_THREADS, &n)`.
    fn set_max_threads(&self, n: u32) -> Result<(), StatusCode>;

    /// `ioctl(SET_CONTEXT_MGR, &unused)`.
    fn become_context_manager(&self) -> Result<(), StatusCode>;

    /// `ioctl(THREAD_EXIT, 0)`, announced from a thread's exit hook.
    fn thread_exit(&self);

    fn driver_path(&self) -> &str;
}

pub mod linux {
    //! Real ioctl/mmap contract against a Linux/Vela binder character
    //! device, grounded in `other_examples/b2fa8855_s1341-binder-rust`.
    use super::*;
    use std::fs::{File, OpenOptions};
    use std::os::unix::fs::OpenOptionsExt;
    use std::os::unix::io::AsRawFd;
    use std::ptr::NonNull;

    #[repr(C)]
    struct BinderWriteRead {
        write_size: u64,
        write_consumed: u64,
        write_buffer: u64,
        read_size: u64,
        read_consumed: u64,
        read_buffer: u64,
    }

    nix::ioctl_readwrite!(binder_write_read, b'b', 1, BinderWriteRead);
    nix::ioctl_write_ptr!(binder_set_max_threads, b'b', 5, u32);
    nix::ioctl_write_ptr!(binder_set_context_mgr, b'b', 7, u32);

    /// A real character-device driver connection.
    pub struct LinuxDriver {
        file: File,
        path: String,
        mmap_ptr: std::ptr::NonNull<libc::c_void>,
        mmap_len: usize,
    }

    // SAFETY: the mmap'd region is read-only from this process's
    // perspective and `File` is already `Send`/`Sync`.
    unsafe impl Send for LinuxDriver {}
    unsafe impl Sync for LinuxDriver {}

    impl LinuxDriver {
        pub fn open(path: &str, mmap_size: usize, max_threads: u32) -> Result<Self, StatusCode> {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .custom_flags(libc::O_CLOEXEC)
                .open(path)
                .map_err(|_| StatusCode::NoInit)?;
            let fd = file.as_raw_fd();
            let mut threads = max_threads;
            unsafe { binder_set_max_threads(fd, &mut threads as *mut u32) }
                .map_err(|_| StatusCode::NoInit)?;
            let len = std::num::NonZeroUsize::new(mmap_size).ok_or(StatusCode::BadValue)?;
            let mmap_ptr = unsafe {
                nix::sys::mman::mmap(
                    None,
                    len,
                    nix::sys::mman::ProtFlags::PROT_READ,
                    nix::sys::mman::MapFlags::MAP_PRIVATE,
                    &file,
                    0,
                )
            }
            .map_err(|_| StatusCode::NoInit)?;
            Ok(LinuxDriver {
                file,
                path: path.to_string(),
                mmap_ptr: NonNull::new(mmap_ptr.as_ptr()).ok_or(StatusCode::NoInit)?,
                mmap_len: mmap_size,
            })
        }
    }

    impl Driver for LinuxDriver {
        fn write_read(
            &self,
            write_buf: &[u8],
            read_buf: &mut [u8],
            _block: bool,
        ) -> Result<WriteReadResult, StatusCode> {
            let mut bwr = BinderWriteRead {
                write_size: write_buf.len() as u64,
                write_consumed: 0,
                write_buffer: write_buf.as_ptr() as u64,
                read_size: read_buf.len() as u64,
                read_consumed: 0,
                read_buffer: read_buf.as_mut_ptr() as u64,
            };
            loop {
                match unsafe { binder_write_read(self.file.as_raw_fd(), &mut bwr) } {
                    Ok(_) => break,
                    Err(nix::errno::Errno::EINTR) => continue,
                    Err(_) => return Err(StatusCode::DeadObject),
                }
            }
            Ok(WriteReadResult {
                write_consumed: bwr.write_consumed as usize,
                read_consumed: bwr.read_consumed as usize,
            })
        }

        fn set_max_threads(&self, n: u32) -> Result<(), StatusCode> {
            let mut n = n;
            unsafe { binder_set_max_threads(self.file.as_raw_fd(), &mut n as *mut u32) }
                .map_err(|_| StatusCode::InvalidOperation)?;
            Ok(())
        }

        fn become_context_manager(&self) -> Result<(), StatusCode> {
            let mut unused: u32 = 0;
            unsafe { binder_set_context_mgr(self.file.as_raw_fd(), &mut unused as *mut u32) }
                .map_err(|_| StatusCode::InvalidOperation)?;
            Ok(())
        }

        fn thread_exit(&self) {
            log::debug!("thread exiting, driver fd {}", self.file.as_raw_fd());
        }

        fn driver_path(&self) -> &str {
            &self.path
        }
    }

    impl Drop for LinuxDriver {
        fn drop(&mut self) {
            unsafe {
                let _ = nix::sys::mman::munmap(self.mmap_ptr, self.mmap_len);
            }
        }
    }
}

#[cfg(feature = "test-util")]
pub mod loopback {
    //! An in-process model of the kernel half of the protocol, used only by
    //! tests (`SPEC_FULL.md` §9). It keeps per-handle object bookkeeping and
    //! routes `TRANSACTION`/refcount commands to the target's inbound queue
    //! the way the real driver would, without any real IPC.
    //!
    //! Handles here are a deliberate simplification: the real driver keeps a
    //! handle table per process, so the same object can be handle 3 in one
    //! process and handle 9 in another. This kernel hands out one global
    //! handle per object, valid in every simulated peer. It is the one
    //! simplification of the object-reference model worth calling out; see
    //! `DESIGN.md`.
    use super::wire::{self, InRecord, OutRecord};
    use super::*;
    use crate::parcel::{object_kind_and_payload_at, rewrite_object_kind_and_payload, HANDLE_KIND, LOCAL_BINDER_KIND};
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Condvar, Mutex};

    #[derive(Default)]
    struct Inbox {
        queue: VecDeque<Vec<u8>>,
    }

    /// Shared kernel-side state for a single simulated `/dev/binder`
    /// instance; `LoopbackDriver` handles are clones of an `Arc` around
    /// this.
    struct Kernel {
        context_manager_peer: Mutex<Option<u32>>,
        inboxes: Mutex<HashMap<u32, Arc<(Mutex<Inbox>, Condvar)>>>,
        next_peer: AtomicU32,
        object_to_handle: Mutex<HashMap<(u32, u64), u32>>,
        handle_to_object: Mutex<HashMap<u32, (u32, u64)>>,
        next_handle: AtomicU32,
        death_watchers: Mutex<HashMap<u32, Vec<(u32, u64)>>>,
    }

    impl Kernel {
        fn new() -> Self {
            Kernel {
                context_manager_peer: Mutex::new(None),
                inboxes: Mutex::new(HashMap::new()),
                next_peer: AtomicU32::new(1),
                object_to_handle: Mutex::new(HashMap::new()),
                handle_to_object: Mutex::new(HashMap::new()),
                next_handle: AtomicU32::new(1),
                death_watchers: Mutex::new(HashMap::new()),
            }
        }

        /// Finds or assigns the global handle standing in for the local
        /// object `token` owned by `owner_peer`.
        fn register_object(&self, owner_peer: u32, token: u64) -> u32 {
            let mut o2h = self.object_to_handle.lock().unwrap();
            if let Some(h) = o2h.get(&(owner_peer, token)) {
                return *h;
            }
            let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
            o2h.insert((owner_peer, token), handle);
            self.handle_to_object.lock().unwrap().insert(handle, (owner_peer, token));
            handle
        }

        /// Resolves a handle to the `(owner_peer, token)` of the local
        /// object it stands for. Handle 0 is special-cased to whichever
        /// peer claimed the context-manager role; it dispatches to that
        /// process's context object rather than a specific token.
        fn resolve_handle(&self, handle: u32) -> Option<(u32, Option<u64>)> {
            if handle == 0 {
                return self.context_manager_peer.lock().unwrap().map(|p| (p, None));
            }
            self.handle_to_object
                .lock()
                .unwrap()
                .get(&handle)
                .map(|(peer, token)| (*peer, Some(*token)))
        }

        /// Rewrites every embedded `LocalBinder` descriptor owned by
        /// `owner_peer` into a global `Handle` descriptor, in place.
        /// `Handle` descriptors are already global and pass through
        /// unchanged (`spec.md` §9, raw-pointer redesign note).
        fn translate_outbound_objects(&self, owner_peer: u32, data: &mut [u8], offsets: &[u32]) {
            for &off in offsets {
                let off = off as usize;
                let Some((kind, payload)) = object_kind_and_payload_at(data, off) else {
                    continue;
                };
                if kind == LOCAL_BINDER_KIND {
                    let handle = self.register_object(owner_peer, payload);
                    rewrite_object_kind_and_payload(data, off, HANDLE_KIND, handle as u64);
                }
            }
        }

        fn push_to(&self, peer_id: u32, record: Vec<u8>) {
            let inboxes = self.inboxes.lock().unwrap();
            if let Some(target) = inboxes.get(&peer_id) {
                let (lock, cvar) = &**target;
                lock.lock().unwrap().queue.push_back(record);
                cvar.notify_all();
            }
        }

        /// Notifies every peer that registered a death recipient on one of
        /// `dead_peer`'s objects. Exposed so tests can simulate a process
        /// exiting without tearing down its `LoopbackDriver`.
        fn notify_peer_dead(&self, dead_peer: u32) {
            let dead_handles: Vec<u32> = self
                .handle_to_object
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, (owner, _))| *owner == dead_peer)
                .map(|(handle, _)| *handle)
                .collect();
            let mut watchers = self.death_watchers.lock().unwrap();
            for handle in dead_handles {
                if let Some(entries) = watchers.remove(&handle) {
                    for (requester, cookie) in entries {
                        self.push_to(requester, wire::encode_in(&[InRecord::DeadBinder { handle, cookie }]));
                    }
                }
            }
        }
    }

    /// A handle onto a shared in-memory "kernel", standing in for a real
    /// `/dev/binder` open file description. Two `LoopbackDriver`s created
    /// from the same `LoopbackKernel` model two processes sharing one
    /// kernel driver.
    #[derive(Clone)]
    pub struct LoopbackKernel(Arc<Kernel>);

    impl LoopbackKernel {
        pub fn new() -> Self {
            LoopbackKernel(Arc::new(Kernel::new()))
        }

        /// Simulates `dead_peer` exiting: delivers `BR_DEAD_BINDER` to every
        /// peer that registered a death notification on one of its objects.
        pub fn notify_peer_dead(&self, dead_peer: u32) {
            self.0.notify_peer_dead(dead_peer);
        }
    }

    impl Default for LoopbackKernel {
        fn default() -> Self {
            Self::new()
        }
    }

    pub struct LoopbackDriver {
        kernel: LoopbackKernel,
        peer_id: u32,
        inbox: Arc<(Mutex<Inbox>, Condvar)>,
        path: String,
    }

    impl LoopbackDriver {
        pub fn new(kernel: LoopbackKernel) -> Self {
            let peer_id = kernel.0.next_peer.fetch_add(1, Ordering::Relaxed);
            let inbox = Arc::new((Mutex::new(Inbox::default()), Condvar::new()));
            kernel.0.inboxes.lock().unwrap().insert(peer_id, inbox.clone());
            LoopbackDriver {
                kernel,
                peer_id,
                inbox,
                path: "loopback".to_string(),
            }
        }

        /// Test hook: deliver a raw command record directly into this
        /// peer's inbox, bypassing routing.
        pub fn deliver(&self, record: Vec<u8>) {
            self.kernel.0.push_to(self.peer_id, record);
        }

        /// Test hook: deliver a record to a specific peer by id.
        pub fn deliver_to(&self, peer_id: u32, record: Vec<u8>) {
            self.kernel.0.push_to(peer_id, record);
        }

        pub fn peer_id(&self) -> u32 {
            self.peer_id
        }

        fn route_out_record(&self, rec: OutRecord) {
            let kernel = &self.kernel.0;
            match rec {
                OutRecord::Transaction { handle, code, flags, mut data, offsets } => {
                    kernel.translate_outbound_objects(self.peer_id, &mut data, &offsets);
                    match kernel.resolve_handle(handle) {
                        Some((target_peer, token)) => {
                            let in_rec = InRecord::Transaction {
                                sender_peer: self.peer_id,
                                code,
                                flags,
                                token,
                                data,
                                offsets,
                            };
                            kernel.push_to(target_peer, wire::encode_in(&[in_rec]));
                            // Acks that the kernel accepted the transaction, separate
                            // from (and always ahead of) the eventual BR_REPLY; the
                            // only thing a `ONEWAY` caller waits for.
                            kernel.push_to(self.peer_id, wire::encode_in(&[InRecord::TransactionComplete]));
                        }
                        None => kernel.push_to(self.peer_id, wire::encode_in(&[InRecord::DeadReply])),
                    }
                }
                OutRecord::Reply { to_peer, flags, mut data, offsets } => {
                    kernel.translate_outbound_objects(self.peer_id, &mut data, &offsets);
                    let in_rec = InRecord::Reply { flags, status: 0, data, offsets };
                    kernel.push_to(to_peer, wire::encode_in(&[in_rec]));
                }
                OutRecord::AcquireResult { .. } => {
                    // unreachable in practice: attemptIncStrong is unsupported (spec.md §4.6).
                }
                OutRecord::FreeBuffer => {}
                OutRecord::Acquire { handle } => {
                    if let Some((owner, Some(token))) = kernel.resolve_handle(handle) {
                        kernel.push_to(owner, wire::encode_in(&[InRecord::Acquire { token }]));
                    }
                }
                OutRecord::Release { handle } => {
                    if let Some((owner, Some(token))) = kernel.resolve_handle(handle) {
                        kernel.push_to(owner, wire::encode_in(&[InRecord::Release { token }]));
                    }
                }
                OutRecord::Increfs { handle } => {
                    if let Some((owner, Some(token))) = kernel.resolve_handle(handle) {
                        kernel.push_to(owner, wire::encode_in(&[InRecord::Increfs { token }]));
                    }
                }
                OutRecord::Decrefs { handle } => {
                    if let Some((owner, Some(token))) = kernel.resolve_handle(handle) {
                        kernel.push_to(owner, wire::encode_in(&[InRecord::Decrefs { token }]));
                    }
                }
                OutRecord::AcquireDone { .. } | OutRecord::IncrefsDone { .. } => {
                    // Acks the BR_ACQUIRE/BR_INCREFS this driver already
                    // sent using a handle it owns; no further routing.
                }
                OutRecord::RequestDeathNotification { handle, cookie } => {
                    kernel
                        .death_watchers
                        .lock()
                        .unwrap()
                        .entry(handle)
                        .or_default()
                        .push((self.peer_id, cookie));
                }
                OutRecord::ClearDeathNotification { handle, cookie } => {
                    let mut watchers = kernel.death_watchers.lock().unwrap();
                    if let Some(entries) = watchers.get_mut(&handle) {
                        entries.retain(|(peer, c)| !(*peer == self.peer_id && *c == cookie));
                    }
                    drop(watchers);
                    kernel.push_to(self.peer_id, wire::encode_in(&[InRecord::ClearDeathNotificationDone { cookie }]));
                }
                OutRecord::DeadBinderDone { .. } => {}
                OutRecord::RegisterLooper | OutRecord::EnterLooper | OutRecord::ExitLooper => {}
            }
        }
    }

    impl Driver for LoopbackDriver {
        fn write_read(
            &self,
            write_buf: &[u8],
            read_buf: &mut [u8],
            block: bool,
        ) -> Result<WriteReadResult, StatusCode> {
            let out_records = wire::decode_out(write_buf);
            for rec in out_records {
                self.route_out_record(rec);
            }

            let (lock, cvar) = &*self.inbox;
            let mut inbox = lock.lock().unwrap();
            if inbox.queue.is_empty() && block {
                inbox = cvar.wait(inbox).unwrap();
            }
            let read_consumed = if let Some(record) = inbox.queue.pop_front() {
                let n = record.len().min(read_buf.len());
                read_buf[..n].copy_from_slice(&record[..n]);
                n
            } else {
                0
            };
            Ok(WriteReadResult {
                write_consumed: write_buf.len(),
                read_consumed,
            })
        }

        fn set_max_threads(&self, _n: u32) -> Result<(), StatusCode> {
            Ok(())
        }

        fn become_context_manager(&self) -> Result<(), StatusCode> {
            let mut cm = self.kernel.0.context_manager_peer.lock().unwrap();
            if cm.is_some() {
                return Err(StatusCode::AlreadyExists);
            }
            *cm = Some(self.peer_id);
            Ok(())
        }

        fn thread_exit(&self) {}

        fn driver_path(&self) -> &str {
            &self.path
        }
    }
}
