// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-thread command loop that talks to the driver (`spec.md` §4.4),
//! grounded in `original_source/binderlib/base/IPCThreadState.c`.
//!
//! Every OS thread that ever calls into this runtime gets its own command
//! loop state, never shared with any other thread; `ThreadState::current()`
//! is a zero-sized handle onto a `thread_local!` slot rather than a value
//! callers construct themselves, mirroring the original's
//! `IPCThreadState::self()`.

use std::cell::RefCell;
use std::collections::VecDeque;

use crate::driver::wire::{self, InRecord, OutRecord};
use crate::error::StatusCode;
use crate::object::{
    context_object_for, Binder, BinderFlags, Handle, TransactionCode,
};
use crate::parcel::Parcel;
use crate::process_state::{CallRestriction, ProcessState};
use crate::stability::Stability;

type Status = crate::error::Status;

const READ_BUFFER_SIZE: usize = 16 * 1024;

struct Inner {
    out: Vec<OutRecord>,
    inbox: VecDeque<InRecord>,
    last_driver_error: StatusCode,
    calling_pid: i32,
    calling_uid: i32,
    strict_mode_policy: i32,
    work_source_uid: i32,
    propagate_work_source: bool,
    is_looper: bool,
}

impl Inner {
    fn new() -> Self {
        Inner {
            out: Vec::new(),
            inbox: VecDeque::new(),
            last_driver_error: StatusCode::Ok,
            calling_pid: std::process::id() as i32,
            calling_uid: -1,
            strict_mode_policy: 0,
            work_source_uid: -1,
            propagate_work_source: false,
            is_looper: false,
        }
    }
}

thread_local! {
    static STATE: RefCell<Inner> = RefCell::new(Inner::new());
}

/// A handle onto the calling thread's command-loop state. Carries no data
/// of its own; every method reaches into the thread-local `STATE` slot.
pub struct ThreadState(());

impl ThreadState {
    pub fn current() -> ThreadState {
        ThreadState(())
    }

    fn with<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> R {
        STATE.with(|cell| f(&mut cell.borrow_mut()))
    }

    /// `transact(handle, code, data, reply, flags)`: queues the outbound
    /// transaction and blocks (unless `ONEWAY`) until a reply or a
    /// terminal driver error arrives.
    pub fn transact(
        &self,
        handle: Handle,
        code: TransactionCode,
        data: &Parcel,
        reply: &mut Parcel,
        flags: BinderFlags,
    ) -> Status {
        if !flags.contains(BinderFlags::ONEWAY) {
            match ProcessState::current().call_restriction() {
                CallRestriction::None => {}
                CallRestriction::ErrorIfNotOneway => {
                    log::error!("synchronous transaction to handle {handle} under ErrorIfNotOneway restriction");
                }
                CallRestriction::FatalIfNotOneway => {
                    panic!("synchronous transaction to handle {handle} under FatalIfNotOneway restriction");
                }
            }
        }
        self.with(|inner| {
            inner.out.push(OutRecord::Transaction {
                handle,
                code,
                flags: flags.0,
                data: data.data().to_vec(),
                offsets: data.object_offsets().iter().map(|&o| o as u32).collect(),
            });
        });
        if flags.contains(BinderFlags::ONEWAY) {
            self.wait_for_response(None)
        } else {
            self.wait_for_response(Some(reply))
        }
    }

    /// `waitForResponse`: the read half of the command loop used both by
    /// `transact` (waiting for a specific reply) and `sendReply` (waiting
    /// only for the completion ack). Commands that aren't terminal for the
    /// caller are handed to `execute_command` and the loop continues.
    fn wait_for_response(&self, mut reply: Option<&mut Parcel>) -> Status {
        loop {
            self.talk_with_driver(true)?;
            let Some(cmd) = self.with(|inner| inner.inbox.pop_front()) else {
                continue;
            };
            match cmd {
                InRecord::Error(code) => return Err(StatusCode::from_i32(code)),
                InRecord::Ok => return Ok(()),
                InRecord::TransactionComplete => {
                    if reply.is_none() {
                        return Ok(());
                    }
                    continue;
                }
                InRecord::DeadReply => return Err(StatusCode::DeadObject),
                InRecord::FailedReply => return Err(StatusCode::FailedTransaction),
                InRecord::FrozenReply => return Err(StatusCode::WouldBlock),
                InRecord::Reply { flags, data, offsets, .. } => {
                    let body = Parcel::from_driver_buffer(
                        data,
                        offsets.into_iter().map(|o| o as usize).collect(),
                        Box::new(|_| ThreadState::current().release_driver_buffer()),
                    );
                    let status_flagged = BinderFlags(flags).contains(BinderFlags::STATUS_CODE);
                    if let Some(out) = reply.take() {
                        *out = body;
                        if status_flagged {
                            let code = out.read_i32().unwrap_or(StatusCode::UnknownError as i32);
                            return Err(StatusCode::from_i32(code));
                        }
                        return Ok(());
                    }
                    if status_flagged {
                        let code = body.read_i32().unwrap_or(StatusCode::UnknownError as i32);
                        return Err(StatusCode::from_i32(code));
                    }
                    return Ok(());
                }
                other => {
                    let _ = self.execute_command(other);
                }
            }
        }
    }

    /// `talkWithDriver(doReceive)`: flushes the pending outbound records and,
    /// if `should_read` and the inbox is empty, blocks in the driver until
    /// at least one inbound record is available.
    fn talk_with_driver(&self, should_read: bool) -> Result<(), StatusCode> {
        let write_bytes = self.with(|inner| {
            let bytes = wire::encode_out(&inner.out);
            inner.out.clear();
            bytes
        });
        let block = should_read && self.with(|inner| inner.inbox.is_empty());
        let mut read_buf = vec![0u8; READ_BUFFER_SIZE];
        let process = ProcessState::current();
        match process.driver_handle().write_read(&write_bytes, &mut read_buf, block) {
            Ok(outcome) => {
                self.with(|inner| inner.last_driver_error = StatusCode::Ok);
                if outcome.read_consumed > 0 {
                    let records = wire::decode_in(&read_buf[..outcome.read_consumed]);
                    self.with(|inner| inner.inbox.extend(records));
                }
                Ok(())
            }
            Err(code) => {
                self.with(|inner| inner.last_driver_error = code);
                Err(code)
            }
        }
    }

    /// `flushCommands()`: writes whatever is pending without waiting for a
    /// reply. Best-effort; failures are logged, not propagated, matching
    /// every call site (none of which can usefully react to a flush error).
    pub fn flush_commands(&self) {
        if let Err(err) = self.talk_with_driver(false) {
            log::warn!("flushCommands: talkWithDriver failed: {err}");
        }
    }

    pub fn last_driver_error(&self) -> StatusCode {
        self.with(|inner| inner.last_driver_error)
    }

    /// Run as the release callback of every `Parcel` built from an inbound
    /// driver buffer (`spec.md` §8 invariant 10: exactly one `FREE_BUFFER`
    /// per inbound buffer). Queued rather than sent synchronously since the
    /// parcel may be dropped deep inside dispatch; flushed immediately so it
    /// does not linger behind the next blocking read.
    fn release_driver_buffer(&self) {
        self.with(|inner| inner.out.push(OutRecord::FreeBuffer));
        self.flush_commands();
    }

    /// `incStrongHandle`/`decStrongHandle`: queue the refcount command and
    /// flush immediately. Real `IPCThreadState` defers these past the
    /// current command-buffer processing pass to avoid reentering the
    /// driver from inside a destructor; this runtime instead relies on
    /// `local_objects` holding every exported object for its full lifetime
    /// (`spec.md` §9 "raw pointers across address spaces"), so there is no
    /// reentrant teardown to protect against and an immediate flush is
    /// sound. See `DESIGN.md`.
    pub fn inc_strong_handle(&self, handle: Handle) {
        self.with(|inner| inner.out.push(OutRecord::Acquire { handle }));
        self.flush_commands();
    }

    pub fn dec_strong_handle(&self, handle: Handle) {
        self.with(|inner| inner.out.push(OutRecord::Release { handle }));
        self.flush_commands();
    }

    /// `incWeakHandle`/`decWeakHandle`: taken unconditionally once when a
    /// proxy is constructed and released in its destructor, independent of
    /// the on-demand strong `ACQUIRE`/`RELEASE` pair above (`spec.md` §2
    /// "its destructor issues a weak decrement to the driver").
    pub fn inc_weak_handle(&self, handle: Handle) {
        self.with(|inner| inner.out.push(OutRecord::Increfs { handle }));
        self.flush_commands();
    }

    pub fn dec_weak_handle(&self, handle: Handle) {
        self.with(|inner| inner.out.push(OutRecord::Decrefs { handle }));
        self.flush_commands();
    }

    /// `requestDeathNotification`/`clearDeathNotification`. `RemoteObject`
    /// only ever issues one of each per handle (guarded by `watchers.len()
    /// == 0` before/after the mutation), so a single handle-derived cookie
    /// is enough to route `BR_DEAD_BINDER`/`BR_CLEAR_DEATH_NOTIFICATION_DONE`
    /// back without a separate cookie allocator.
    pub fn request_death_notification(&self, handle: Handle) {
        self.with(|inner| {
            inner.out.push(OutRecord::RequestDeathNotification {
                handle,
                cookie: handle as u64,
            })
        });
    }

    pub fn clear_death_notification(&self, handle: Handle) {
        self.with(|inner| {
            inner.out.push(OutRecord::ClearDeathNotification {
                handle,
                cookie: handle as u64,
            })
        });
    }

    /// `executeCommand`: the full case analysis over an inbound record
    /// (`spec.md` §4.4).
    fn execute_command(&self, cmd: InRecord) -> Status {
        match cmd {
            InRecord::Transaction { sender_peer, code, flags, token, data, offsets } => {
                self.dispatch_transaction(sender_peer, code, flags, token, data, offsets)
            }
            InRecord::SpawnLooper => {
                ProcessState::current().spawn_pool_worker();
                Ok(())
            }
            InRecord::DeadBinder { handle, cookie } => {
                if let Some(proxy) = ProcessState::current().concrete_proxy_for_handle(handle) {
                    proxy.send_obituary();
                }
                self.with(|inner| inner.out.push(OutRecord::DeadBinderDone { cookie }));
                Ok(())
            }
            InRecord::Acquire { token } => {
                self.with(|inner| inner.out.push(OutRecord::AcquireDone { token }));
                Ok(())
            }
            InRecord::Increfs { token } => {
                self.with(|inner| inner.out.push(OutRecord::IncrefsDone { token }));
                Ok(())
            }
            // `local_objects` holds a permanent strong reference to every
            // exported object (`spec.md` §9), so there is no driver-side
            // refcount left to release here.
            InRecord::Release { .. } | InRecord::Decrefs { .. } => Ok(()),
            // `cookie` is the handle the registration was issued against
            // (see `request_death_notification`/`clear_death_notification`
            // above); a table miss just means the proxy already fully tore
            // down, nothing left to balance.
            InRecord::ClearDeathNotificationDone { cookie } => {
                let handle = cookie as Handle;
                if let Some(proxy) = ProcessState::current().concrete_proxy_for_handle(handle) {
                    proxy.release_self_weak();
                }
                Ok(())
            }
            InRecord::Noop | InRecord::Finished | InRecord::Ok => Ok(()),
            InRecord::Error(code) => Err(StatusCode::from_i32(code)),
            // Reachable only if one of these arrives outside
            // `wait_for_response` (e.g. an unsolicited duplicate); nothing
            // useful to do but ignore it.
            InRecord::TransactionComplete
            | InRecord::DeadReply
            | InRecord::FailedReply
            | InRecord::FrozenReply
            | InRecord::Reply { .. }
            | InRecord::AcquireResult { .. }
            | InRecord::OnewaySpamSuspect => Ok(()),
        }
    }

    fn dispatch_transaction(
        &self,
        sender_peer: u32,
        code: TransactionCode,
        flags: u32,
        token: Option<u64>,
        data: Vec<u8>,
        offsets: Vec<u32>,
    ) -> Status {
        let process = ProcessState::current();
        let flags = BinderFlags(flags);
        let target = match token {
            Some(token) => process.lookup_local_object(token),
            None => context_object_for(&process, Stability::default_for_context()),
        };
        let Some(target) = target else {
            if !flags.contains(BinderFlags::ONEWAY) {
                self.send_reply(sender_peer, Err(StatusCode::UnknownTransaction), &Parcel::new());
            }
            return Err(StatusCode::UnknownTransaction);
        };

        let request = Parcel::from_driver_buffer(
            data,
            offsets.into_iter().map(|o| o as usize).collect(),
            Box::new(|_| ThreadState::current().release_driver_buffer()),
        );
        let mut reply = Parcel::new();
        let (prev_pid, prev_uid) = self.with(|inner| (inner.calling_pid, inner.calling_uid));
        self.with(|inner| {
            inner.calling_pid = sender_peer as i32;
            inner.calling_uid = -1;
        });
        let result = target.transact(code, &request, &mut reply, flags);
        self.with(|inner| {
            inner.calling_pid = prev_pid;
            inner.calling_uid = prev_uid;
        });

        if flags.contains(BinderFlags::ONEWAY) {
            return result;
        }
        self.send_reply(sender_peer, result.clone(), &reply);
        result
    }

    /// `sendReply(reply, status)`: queues `BC_REPLY` addressed to whichever
    /// peer sent the transaction being answered, then flushes.
    fn send_reply(&self, to_peer: u32, result: Status, reply: &Parcel) {
        let (flags, data, offsets) = match result {
            Ok(()) => (
                0u32,
                reply.data().to_vec(),
                reply.object_offsets().iter().map(|&o| o as u32).collect(),
            ),
            Err(status) => (BinderFlags::STATUS_CODE.0, (status as i32).to_ne_bytes().to_vec(), Vec::new()),
        };
        self.with(|inner| {
            inner.out.push(OutRecord::Reply { to_peer, flags, data, offsets });
        });
        self.flush_commands();
    }

    /// `joinThreadPool(isMain)`: the main per-thread loop. Registers as a
    /// looper, repeatedly reads and executes commands, and unregisters on
    /// `BR_FINISHED` or a terminal driver error.
    pub fn join_thread_pool(&self, is_main: bool) {
        self.with(|inner| {
            inner.is_looper = true;
            inner.out.push(if is_main { OutRecord::EnterLooper } else { OutRecord::RegisterLooper });
        });
        loop {
            if self.talk_with_driver(true).is_err() {
                break;
            }
            let Some(cmd) = self.with(|inner| inner.inbox.pop_front()) else {
                continue;
            };
            if matches!(cmd, InRecord::Finished) {
                break;
            }
            let _ = self.execute_command(cmd);
        }
        self.with(|inner| {
            inner.is_looper = false;
            inner.out.push(OutRecord::ExitLooper);
        });
        self.flush_commands();
        ProcessState::current().driver_handle().thread_exit();
    }

    pub fn is_looper(&self) -> bool {
        self.with(|inner| inner.is_looper)
    }

    /// `setupPolling()` immediately followed by a blocking
    /// `handlePolledCommands`-style drain loop, run forever. Used by the
    /// service-manager binary's own small event loop (`spec.md` §4.7, §6:
    /// "its main loop uses setupPolling + a small event loop rather than a
    /// thread pool") rather than `join_thread_pool`'s worker-pool model:
    /// it never spawns additional pool workers and never exits on
    /// `FINISHED` (there is no second looper to hand off to). Returns only
    /// on a fatal driver error.
    pub fn run_polling_loop(&self) -> Result<(), StatusCode> {
        self.setup_polling()?;
        loop {
            self.talk_with_driver(true)?;
            loop {
                let Some(cmd) = self.with(|inner| inner.inbox.pop_front()) else {
                    break;
                };
                let _ = self.execute_command(cmd);
            }
        }
    }

    /// `setupPolling()`: registers this thread as a looper without blocking,
    /// for callers that multiplex the driver into their own event loop
    /// instead of calling `join_thread_pool`.
    pub fn setup_polling(&self) -> Result<(), StatusCode> {
        self.with(|inner| {
            inner.is_looper = true;
            inner.out.push(OutRecord::EnterLooper);
        });
        self.talk_with_driver(false)
    }

    /// `handlePolledCommands()`: drains and executes whatever the driver
    /// already has ready, without blocking. Meant to run after the caller's
    /// own event loop observes the driver is readable.
    pub fn handle_polled_commands(&self) -> Result<(), StatusCode> {
        self.talk_with_driver(false)?;
        loop {
            let Some(cmd) = self.with(|inner| inner.inbox.pop_front()) else {
                break;
            };
            let _ = self.execute_command(cmd);
        }
        Ok(())
    }

    pub fn calling_pid(&self) -> i32 {
        self.with(|inner| inner.calling_pid)
    }

    pub fn calling_uid(&self) -> i32 {
        self.with(|inner| inner.calling_uid)
    }

    /// `clearCallingIdentity()`: resets the calling pid/uid to this
    /// process's own, returning an opaque token `restoreCallingIdentity`
    /// can hand back later. Used by a local object that needs to perform a
    /// nested call under its own identity rather than its caller's.
    pub fn clear_calling_identity(&self) -> (i32, i32) {
        self.with(|inner| {
            let prev = (inner.calling_pid, inner.calling_uid);
            inner.calling_pid = std::process::id() as i32;
            inner.calling_uid = -1;
            prev
        })
    }

    pub fn restore_calling_identity(&self, token: (i32, i32)) {
        self.with(|inner| {
            inner.calling_pid = token.0;
            inner.calling_uid = token.1;
        });
    }

    pub fn strict_mode_policy(&self) -> i32 {
        self.with(|inner| inner.strict_mode_policy)
    }

    pub fn set_strict_mode_policy(&self, policy: i32) {
        self.with(|inner| inner.strict_mode_policy = policy);
    }

    pub fn work_source(&self) -> i32 {
        self.with(|inner| inner.work_source_uid)
    }

    /// Returns the previous work source, mirroring `setCallingWorkSourceUid`
    /// returning the value it replaced.
    pub fn set_work_source(&self, uid: i32) -> i32 {
        self.with(|inner| std::mem::replace(&mut inner.work_source_uid, uid))
    }

    pub fn should_propagate_work_source(&self) -> bool {
        self.with(|inner| inner.propagate_work_source)
    }

    pub fn set_propagate_work_source(&self, propagate: bool) {
        self.with(|inner| inner.propagate_work_source = propagate);
    }
}

#[cfg(all(test, feature = "test-util"))]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::driver::loopback::{LoopbackDriver, LoopbackKernel};
    use crate::object::{LocalObject, OnTransact};
    use crate::refbase::Shared;

    struct Echo;

    impl OnTransact for Echo {
        fn on_transact(
            &self,
            _code: TransactionCode,
            data: &Parcel,
            reply: &mut Parcel,
            _flags: BinderFlags,
        ) -> Status {
            let s = data.read_string()?;
            reply.write_string(s.as_deref())?;
            Ok(())
        }

        fn get_descriptor(&self) -> crate::object::Descriptor {
            crate::object::Descriptor::from("test.IEcho")
        }
    }

    fn two_peers() -> (std::sync::Arc<ProcessState>, std::sync::Arc<ProcessState>) {
        let kernel = LoopbackKernel::new();
        let server = ProcessState::for_test(LoopbackDriver::new(kernel.clone()), RuntimeConfig::default());
        let client = ProcessState::for_test(LoopbackDriver::new(kernel), RuntimeConfig::default());
        (server, client)
    }

    #[test]
    fn transact_round_trips_through_loopback_kernel() {
        let (server, client) = two_peers();

        ProcessState::adopt_for_this_thread(&server);
        let local = Shared::new(LocalObject::new(Box::new(Echo), 1));
        let local_dyn: Shared<dyn Binder> = Shared(local.0);
        let token = server.register_local_object(&local_dyn);
        server.set_context_object(server.lookup_local_object(token).unwrap());
        server.become_context_manager().unwrap();

        std::thread::Builder::new()
            .name("server-looper".to_string())
            .spawn({
                let server = server.clone();
                move || {
                    ProcessState::adopt_for_this_thread(&server);
                    ThreadState::current().join_thread_pool(true);
                }
            })
            .unwrap();

        ProcessState::adopt_for_this_thread(&client);
        let proxy = client.get_strong_proxy_for_handle(0).expect("context object reachable");

        let mut data = Parcel::new();
        data.write_string(Some("hello")).unwrap();
        let mut reply = Parcel::new();
        proxy
            .transact(crate::object::FIRST_CALL_TRANSACTION, &data, &mut reply, BinderFlags::NONE)
            .unwrap();
        assert_eq!(reply.read_string().unwrap().as_deref(), Some("hello"));

        ProcessState::shutdown_unique_for_tests();
    }
}
