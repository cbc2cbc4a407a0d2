// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Local ("stub") and remote ("proxy") object variants, and the capability
//! surface generated dispatch code targets (`spec.md` §4.5, §4.6, §9).
//!
//! The original encodes polymorphism through function-pointer tables inside
//! each object (`original_source/binderlib/base/IBinder.h`). Per the
//! redesign notes this port instead exposes a `Binder` trait implemented by
//! exactly two concrete variants, `LocalObject` and `RemoteObject`, and
//! lets generated stub code depend only on the `OnTransact` half of that
//! surface.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Mutex;

use crate::error::{Status, StatusCode};
use crate::parcel::Parcel;
use crate::process_state::ProcessState;
use crate::refbase::{RefCounted, Shared, WeakHandle};
use crate::stability::Stability;
use crate::thread_state::ThreadState;

/// A 32-bit transaction tag, conventionally built from four ASCII
/// characters (`spec.md` §6).
pub type TransactionCode = u32;

pub const FIRST_CALL_TRANSACTION: TransactionCode = 0x0000_0001;
pub const LAST_CALL_TRANSACTION: TransactionCode = 0x00ff_ffff;

const fn tag(a: u8, b: u8, c: u8, d: u8) -> TransactionCode {
    ((a as u32) << 24) | ((b as u32) << 16) | ((c as u32) << 8) | (d as u32)
}

pub const PING_TRANSACTION: TransactionCode = tag(b'_', b'P', b'N', b'G');
pub const DUMP_TRANSACTION: TransactionCode = tag(b'_', b'D', b'M', b'P');
pub const SHELL_COMMAND_TRANSACTION: TransactionCode = tag(b'_', b'C', b'M', b'D');
pub const INTERFACE_TRANSACTION: TransactionCode = tag(b'_', b'N', b'T', b'F');
pub const SYSPROPS_TRANSACTION: TransactionCode = tag(b'_', b'S', b'P', b'R');
pub const EXTENSION_TRANSACTION: TransactionCode = tag(b'_', b'E', b'X', b'T');
pub const DEBUG_PID_TRANSACTION: TransactionCode = tag(b'_', b'P', b'I', b'D');
pub const SET_RPC_CLIENT_TRANSACTION: TransactionCode = tag(b'_', b'R', b'P', b'C');

/// The handle assigned by the driver to a remote object.
pub type Handle = u32;

/// Transaction-level flags (`spec.md` §3, §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BinderFlags(pub u32);

impl BinderFlags {
    pub const ONEWAY: BinderFlags = BinderFlags(0x0001);
    pub const CLEAR_BUF: BinderFlags = BinderFlags(0x0002);
    pub const PRIVATE_VENDOR: BinderFlags = BinderFlags(0x0004);
    pub const ACCEPTS_FDS: BinderFlags = BinderFlags(0x0008);
    pub const STATUS_CODE: BinderFlags = BinderFlags(0x0010);
    pub const TXN_SECURITY_CTX: BinderFlags = BinderFlags(0x0020);
    pub const INHERIT_RT: BinderFlags = BinderFlags(0x0040);

    pub const NONE: BinderFlags = BinderFlags(0);

    pub fn contains(self, other: BinderFlags) -> bool {
        (self.0 & other.0) == other.0
    }

    pub fn without(self, other: BinderFlags) -> BinderFlags {
        BinderFlags(self.0 & !other.0)
    }
}

impl std::ops::BitOr for BinderFlags {
    type Output = BinderFlags;
    fn bitor(self, rhs: BinderFlags) -> BinderFlags {
        BinderFlags(self.0 | rhs.0)
    }
}

/// An interface descriptor string, e.g. `"Vela.os.IServiceManager"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Descriptor(pub String);

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Descriptor {
    fn from(s: &str) -> Self {
        Descriptor(s.to_string())
    }
}

/// Scheduling policy a local object may request for threads dispatching to
/// it (`spec.md` §4.5: "policies limited to round-robin or FIFO").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedPolicy {
    RoundRobin,
    Fifo,
}

#[derive(Debug, Clone, Copy)]
struct SchedulerHint {
    policy: SchedPolicy,
    priority: i32,
}

/// Recipient of a death notification (`spec.md` §4.6, §8 E4). Extends
/// `RefCounted` so that `Shared<dyn DeathRecipient>` (the type
/// `link_to_death` stores watchers under) is well-formed -- `Shared<T>`
/// requires `T: RefCounted`, and that bound is satisfied for a trait object
/// only when the object's own trait declares it as a supertrait.
pub trait DeathRecipient: RefCounted + Send + Sync {
    fn binder_died(&self, who: &Shared<dyn Binder>);
}

/// The capability surface generated stub/proxy code depends on. Exactly two
/// concrete implementors exist: `LocalObject` and `RemoteObject`.
pub trait Binder: RefCounted + Send + Sync {
    fn transact(
        &self,
        code: TransactionCode,
        data: &Parcel,
        reply: &mut Parcel,
        flags: BinderFlags,
    ) -> Status;

    fn link_to_death(
        &self,
        recipient: Shared<dyn DeathRecipient>,
        cookie: usize,
        flags: u32,
    ) -> Result<(), StatusCode>;

    fn unlink_to_death(&self, cookie: usize, flags: u32) -> Result<(), StatusCode>;

    fn is_binder_alive(&self) -> bool {
        true
    }

    fn ping_binder(&self) -> Status {
        Ok(())
    }

    fn get_interface_descriptor(&self) -> Descriptor;

    fn local(&self) -> Option<&LocalObject> {
        None
    }

    /// The handle this object was constructed around, for a remote object;
    /// `None` for a local one. Mirrors the original's `BpBinder::handle()`
    /// being consulted directly when flattening a binder into a parcel,
    /// rather than this crate reverse-searching the handle table.
    fn remote_handle(&self) -> Option<Handle> {
        None
    }
}

/// The opaque key/value attached-object map used by higher layers to tag an
/// object with auxiliary state (`spec.md` §3, §4.5).
type CleanupFn = Box<dyn Fn(usize, usize, usize) + Send + Sync>;

#[derive(Default)]
struct AttachedObjects {
    entries: HashMap<usize, (usize, usize, Option<CleanupFn>)>,
}

/// A local object ("stub"): dispatches transactions to generated code.
pub struct LocalObject {
    dispatch: Box<dyn OnTransact>,
    attached: Mutex<AttachedObjects>,
    extension: Mutex<Option<Shared<dyn Binder>>>,
    scheduler: Mutex<SchedulerHint>,
    requesting_sid: AtomicBool,
    inherit_rt: AtomicBool,
    parceled: AtomicBool,
    owning_pid: i32,
}

/// Generated dispatch code implements this; `LocalObject::transact`
/// intercepts the reserved transaction codes before falling through to
/// `on_transact` (`spec.md` §4.5).
pub trait OnTransact: Send + Sync {
    fn on_transact(
        &self,
        code: TransactionCode,
        data: &Parcel,
        reply: &mut Parcel,
        flags: BinderFlags,
    ) -> Status;

    fn get_descriptor(&self) -> Descriptor;

    /// `DUMP_TRANSACTION` handler; the default refuses (callers get
    /// `INVALID_OPERATION`, matching objects that never override `dump`).
    fn dump(&self, _fd: i32, _args: &[String]) -> Status {
        Err(StatusCode::InvalidOperation)
    }
}

impl LocalObject {
    pub fn new(dispatch: Box<dyn OnTransact>, owning_pid: i32) -> Self {
        LocalObject {
            dispatch,
            attached: Mutex::new(AttachedObjects::default()),
            extension: Mutex::new(None),
            scheduler: Mutex::new(SchedulerHint {
                policy: SchedPolicy::RoundRobin,
                priority: 0,
            }),
            requesting_sid: AtomicBool::new(false),
            inherit_rt: AtomicBool::new(false),
            parceled: AtomicBool::new(false),
            owning_pid,
        }
    }

    pub fn is_parceled(&self) -> bool {
        self.parceled.load(Ordering::Acquire)
    }

    /// Called the first time this object is flattened into a parcel;
    /// monotonic (false -> true, `spec.md` invariant 3).
    pub fn mark_parceled(&self) {
        self.parceled.store(true, Ordering::Release);
    }

    pub fn set_min_scheduler_policy(&self, policy: SchedPolicy, priority: i32) {
        assert!(
            !self.is_parceled(),
            "setMinSchedulerPolicy() called after the object was parceled"
        );
        *self.scheduler.lock().unwrap() = SchedulerHint { policy, priority };
    }

    pub fn set_requesting_sid(&self, flag: bool) {
        assert!(
            !self.is_parceled(),
            "setRequestingSid() called after the object was parceled"
        );
        self.requesting_sid.store(flag, Ordering::Relaxed);
    }

    pub fn requesting_sid(&self) -> bool {
        self.requesting_sid.load(Ordering::Relaxed)
    }

    pub fn set_inherit_rt(&self, flag: bool) {
        assert!(
            !self.is_parceled(),
            "setInheritRt() called after the object was parceled"
        );
        self.inherit_rt.store(flag, Ordering::Relaxed);
    }

    pub fn inherit_rt(&self) -> bool {
        self.inherit_rt.load(Ordering::Relaxed)
    }

    pub fn set_extension(&self, extension: Option<Shared<dyn Binder>>) {
        assert!(
            !self.is_parceled(),
            "setExtension() called after the object was parceled"
        );
        *self.extension.lock().unwrap() = extension;
    }

    /// `attachObject`: returns any value previously attached under `id`,
    /// without replacing it.
    pub fn attach_object(
        &self,
        id: usize,
        object: usize,
        cleanup_cookie: usize,
        cleanup: Option<CleanupFn>,
    ) -> Option<usize> {
        let mut guard = self.attached.lock().unwrap();
        if let Some((existing, _, _)) = guard.entries.get(&id) {
            return Some(*existing);
        }
        guard.entries.insert(id, (object, cleanup_cookie, cleanup));
        None
    }

    pub fn find_object(&self, id: usize) -> Option<usize> {
        self.attached
            .lock()
            .unwrap()
            .entries
            .get(&id)
            .map(|(object, _, _)| *object)
    }

    pub fn detach_object(&self, id: usize) -> Option<usize> {
        self.attached
            .lock()
            .unwrap()
            .entries
            .remove(&id)
            .map(|(object, _, _)| object)
    }

    fn run_attached_cleanups(&self) {
        let mut guard = self.attached.lock().unwrap();
        for (id, (object, cookie, cleanup)) in guard.entries.drain() {
            if let Some(cleanup) = cleanup {
                cleanup(id, object, cookie);
            }
        }
    }
}

impl Drop for LocalObject {
    fn drop(&mut self) {
        self.run_attached_cleanups();
    }
}

impl RefCounted for LocalObject {}

const MAX_LOGGED_REPLY_BYTES: usize = 2 * 1024;

impl Binder for LocalObject {
    fn transact(
        &self,
        code: TransactionCode,
        data: &Parcel,
        reply: &mut Parcel,
        flags: BinderFlags,
    ) -> Status {
        let mut working = data.duplicate();
        working.set_data_position(0);
        if flags.contains(BinderFlags::CLEAR_BUF) {
            reply.mark_sensitive();
        }
        let status = match code {
            PING_TRANSACTION => self.ping_binder(),
            EXTENSION_TRANSACTION => {
                let ext = self.extension.lock().unwrap().clone();
                reply.write_strong_binder(ext.as_ref())
            }
            DEBUG_PID_TRANSACTION => reply.write_i32(self.owning_pid),
            INTERFACE_TRANSACTION => reply.write_string(Some(&self.dispatch.get_descriptor().0)),
            DUMP_TRANSACTION => {
                let fd = data.read_file_descriptor_raw();
                let argc = data.read_i32().unwrap_or(0).max(0) as usize;
                let mut args = Vec::with_capacity(argc);
                for _ in 0..argc {
                    args.push(data.read_string().unwrap_or_default().unwrap_or_default());
                }
                self.dispatch.dump(fd, &args)
            }
            SHELL_COMMAND_TRANSACTION | SYSPROPS_TRANSACTION => Ok(()),
            _ => self.dispatch.on_transact(code, &working, reply, flags),
        };
        if reply.len() > MAX_LOGGED_REPLY_BYTES {
            log::warn!(
                "large reply ({} bytes) from {} for code {:#010x}",
                reply.len(),
                self.dispatch.get_descriptor(),
                code
            );
        }
        status
    }

    fn link_to_death(
        &self,
        _recipient: Shared<dyn DeathRecipient>,
        _cookie: usize,
        _flags: u32,
    ) -> Result<(), StatusCode> {
        Err(StatusCode::InvalidOperation)
    }

    fn unlink_to_death(&self, _cookie: usize, _flags: u32) -> Result<(), StatusCode> {
        Err(StatusCode::InvalidOperation)
    }

    fn get_interface_descriptor(&self) -> Descriptor {
        self.dispatch.get_descriptor()
    }

    fn local(&self) -> Option<&LocalObject> {
        Some(self)
    }
}

impl fmt::Debug for LocalObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalObject")
            .field("descriptor", &self.dispatch.get_descriptor())
            .field("parceled", &self.is_parceled())
            .finish()
    }
}

struct Watcher {
    recipient: Shared<dyn DeathRecipient>,
    cookie: usize,
    flags: u32,
}

struct ProxyState {
    alive: bool,
    obituary_sent: bool,
    watchers: Vec<Watcher>,
    descriptor: Option<Descriptor>,
    self_weak: Option<WeakHandle<RemoteObject>>,
}

/// A remote object ("proxy"): forwards transactions to the driver through
/// thread state (`spec.md` §4.6).
pub struct RemoteObject {
    handle: Handle,
    state: Mutex<ProxyState>,
    tracked_uid: AtomicI32,
}

impl RemoteObject {
    pub fn new(handle: Handle) -> Self {
        RemoteObject {
            handle,
            state: Mutex::new(ProxyState {
                alive: true,
                obituary_sent: false,
                watchers: Vec::new(),
                descriptor: None,
                self_weak: None,
            }),
            tracked_uid: AtomicI32::new(-1),
        }
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn is_alive(&self) -> bool {
        self.state.lock().unwrap().alive
    }

    pub fn tracked_uid(&self) -> Option<i32> {
        let v = self.tracked_uid.load(Ordering::Relaxed);
        if v < 0 {
            None
        } else {
            Some(v)
        }
    }

    pub fn set_tracked_uid(&self, uid: i32) {
        self.tracked_uid.store(uid, Ordering::Relaxed);
    }

    /// The uid this proxy's construction was charged against, regardless of
    /// whether it's the sentinel `-1` ("unknown caller"). Unlike
    /// `tracked_uid()`, this never collapses `-1` to `None`: the quota
    /// bookkeeping keys on whatever uid `note_new_proxy` actually counted
    /// against, sentinel included, so release must use the same key.
    fn quota_uid(&self) -> i32 {
        self.tracked_uid.load(Ordering::Relaxed)
    }

    pub fn cached_descriptor(&self) -> Option<Descriptor> {
        self.state.lock().unwrap().descriptor.clone()
    }

    pub fn set_cached_descriptor(&self, descriptor: Descriptor) {
        self.state.lock().unwrap().descriptor = Some(descriptor);
    }

    /// Delivered by `ThreadState::execute_command` on `DEAD_BINDER`.
    /// Idempotent; upgrades each watcher's recipient outside the lock.
    pub fn send_obituary(self: &Shared<RemoteObject>) {
        let watchers = {
            let mut guard = self.state.lock().unwrap();
            if guard.obituary_sent {
                return;
            }
            guard.obituary_sent = true;
            guard.alive = false;
            ThreadState::current().clear_death_notification(self.handle);
            std::mem::take(&mut guard.watchers)
        };
        let as_binder = as_dyn_binder(self.clone());
        for watcher in watchers {
            watcher.recipient.binder_died(&as_binder);
        }
    }

    /// `BR_CLEAR_DEATH_NOTIFICATION_DONE`: balances the self-weak taken in
    /// `link_to_death`'s first-watcher branch, letting the counter block be
    /// collected once nothing else references it (`spec.md` §4.4
    /// "weak-decrement the proxy (balancing the weak-inc taken when death
    /// registration was requested)").
    pub(crate) fn release_self_weak(&self) {
        self.state.lock().unwrap().self_weak = None;
    }
}

/// Upcasts a concrete `Shared<RemoteObject>` to `Shared<dyn Binder>`,
/// relying on `Shared<T>`'s inner `Arc` being `pub(crate)` to get the usual
/// `Arc` unsizing coercion.
fn as_dyn_binder(proxy: Shared<RemoteObject>) -> Shared<dyn Binder> {
    Shared(proxy.0)
}

/// Public counterpart of `as_dyn_binder`: generated stub/proxy code, the
/// `servicemanager` binary, and test code alike need to hand a freshly
/// constructed `Shared<Concrete>` to APIs that take `Shared<dyn Binder>`,
/// and (unlike code inside this crate) cannot rely on `Shared`'s inner
/// `Arc` field being visible to perform the coercion themselves. Generic
/// over the concrete type rather than hardcoded to one, since the
/// unsizing coercion to the fixed target `dyn Binder` is sound for any `T:
/// Binder` regardless of which concrete type the caller monomorphizes it
/// with.
pub fn to_dyn_binder<T: Binder + 'static>(value: Shared<T>) -> Shared<dyn Binder> {
    Shared(value.0)
}

/// Same idea as [`to_dyn_binder`], for death-recipient watchers: callers
/// outside this crate implement [`DeathRecipient`] on their own struct and
/// need to hand `link_to_death` a `Shared<dyn DeathRecipient>`.
pub fn to_dyn_death_recipient<T: DeathRecipient + 'static>(value: Shared<T>) -> Shared<dyn DeathRecipient> {
    Shared(value.0)
}

impl RefCounted for RemoteObject {
    fn on_first_ref(&self) {
        ThreadState::current().inc_strong_handle(self.handle);
    }

    /// Strong count dropped to zero: release the driver-side strong ref and
    /// remove this instance from the handle table immediately, so the next
    /// `get_strong_proxy_for_handle` call for the same handle constructs a
    /// fresh proxy instead of finding a dead one (`spec.md` §4.3 invariant
    /// 8). Identity is a raw address, not a clone of `self`, since this hook
    /// only ever gets `&self`.
    fn on_last_strong_ref(&self) {
        ThreadState::current().dec_strong_handle(self.handle);
        let identity = self as *const RemoteObject as usize;
        ProcessState::current().expunge_handle(self.handle, identity);
    }

    fn on_inc_strong_attempted(&self) -> bool {
        false
    }
}

impl Drop for RemoteObject {
    /// Issues the weak decrement to the driver balancing the weak increment
    /// taken when this proxy was constructed, and releases its slot in the
    /// per-uid proxy quota (`spec.md` §2 "its destructor issues a weak
    /// decrement to the driver and removes itself from the handle table").
    /// `expunge_handle` is idempotent, so calling it again here is harmless
    /// even though `on_last_strong_ref` already ran it in the common case.
    fn drop(&mut self) {
        let identity = self as *const RemoteObject as usize;
        let process = ProcessState::current();
        process.expunge_handle(self.handle, identity);
        process.release_proxy_quota(self.quota_uid());
        ThreadState::current().dec_weak_handle(self.handle);
    }
}

impl Binder for RemoteObject {
    fn transact(
        &self,
        code: TransactionCode,
        data: &Parcel,
        reply: &mut Parcel,
        flags: BinderFlags,
    ) -> Status {
        if !self.is_alive() {
            return Err(StatusCode::DeadObject);
        }
        let flags = flags.without(BinderFlags::PRIVATE_VENDOR);
        if data.len() > MAX_LOGGED_REPLY_BYTES {
            log::warn!(
                "large outbound transaction ({} bytes) on handle {}",
                data.len(),
                self.handle
            );
        }
        let result = ThreadState::current().transact(self.handle, code, data, reply, flags);
        if result == Err(StatusCode::DeadObject) {
            self.state.lock().unwrap().alive = false;
        }
        result
    }

    fn link_to_death(
        &self,
        recipient: Shared<dyn DeathRecipient>,
        cookie: usize,
        flags: u32,
    ) -> Result<(), StatusCode> {
        let first = {
            let mut guard = self.state.lock().unwrap();
            if guard.obituary_sent {
                return Err(StatusCode::DeadObject);
            }
            let first = guard.watchers.is_empty();
            guard.watchers.push(Watcher {
                recipient,
                cookie,
                flags,
            });
            first
        };
        if first {
            // Take a weak ref on ourselves so the counter block survives
            // until `BR_DEAD_BINDER` or `BR_CLEAR_DEATH_NOTIFICATION_DONE`
            // arrives, even if every other strong ref is dropped first
            // (`spec.md` §4.6). Done outside `guard`'s scope:
            // `remember_self_weak` takes the same lock.
            if let Some(strong_self) = ProcessState::current().concrete_proxy_for_handle(self.handle) {
                remember_self_weak(&strong_self);
            }
            ThreadState::current().request_death_notification(self.handle);
            ThreadState::current().flush_commands();
        }
        Ok(())
    }

    fn unlink_to_death(&self, cookie: usize, _flags: u32) -> Result<(), StatusCode> {
        let mut guard = self.state.lock().unwrap();
        let before = guard.watchers.len();
        guard.watchers.retain(|w| w.cookie != cookie);
        if guard.watchers.len() == before {
            return Err(StatusCode::NameNotFound);
        }
        if guard.watchers.is_empty() {
            ThreadState::current().clear_death_notification(self.handle);
            ThreadState::current().flush_commands();
        }
        Ok(())
    }

    fn is_binder_alive(&self) -> bool {
        self.is_alive()
    }

    fn ping_binder(&self) -> Status {
        let data = Parcel::new();
        let mut reply = Parcel::new();
        self.transact(PING_TRANSACTION, &data, &mut reply, BinderFlags::NONE)
    }

    fn get_interface_descriptor(&self) -> Descriptor {
        if let Some(d) = self.cached_descriptor() {
            return d;
        }
        let data = Parcel::new();
        let mut reply = Parcel::new();
        if self
            .transact(INTERFACE_TRANSACTION, &data, &mut reply, BinderFlags::NONE)
            .is_ok()
        {
            if let Ok(Some(s)) = reply.read_string() {
                let descriptor = Descriptor(s);
                self.set_cached_descriptor(descriptor.clone());
                return descriptor;
            }
        }
        Descriptor(String::new())
    }

    fn remote_handle(&self) -> Option<Handle> {
        Some(self.handle)
    }
}

impl fmt::Debug for RemoteObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteObject")
            .field("handle", &self.handle)
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Installed on the first watcher for a proxy so the counter block survives
/// until the death notification is delivered or cancelled (`spec.md`
/// §4.6, §9 "Cyclic ownership between proxies and watchers").
pub fn remember_self_weak(proxy: &Shared<RemoteObject>) {
    let weak = Shared::downgrade(proxy);
    proxy.state.lock().unwrap().self_weak = Some(weak);
}

/// Context accessor used when a transaction targets no specific local
/// object (`spec.md` §4.4 "otherwise dispatch to the process-wide context
/// object").
pub fn context_object_for(process: &ProcessState, stability: Stability) -> Option<Shared<dyn Binder>> {
    let _ = stability;
    process.context_object()
}
