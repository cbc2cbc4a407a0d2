// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-process singleton holding driver-global resources and the handle
//! table (`spec.md` §4.3), grounded in
//! `original_source/binderlib/base/ProcessState.c`.
//!
//! Production code treats this as a process-wide singleton reached through
//! `ProcessState::current()`. Tests need two logically distinct "processes"
//! sharing one in-memory `LoopbackDriver` inside a single test binary
//! (`SPEC_FULL.md` §8), so this is modelled as an `Arc<ProcessState>`
//! associated with the calling thread via `adopt_for_this_thread`, rather
//! than a single globally-reachable value with no way to vary it per
//! thread. `ProcessState::current()` is the Rust-idiomatic name for what
//! `spec.md` calls `self()`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use crate::config::RuntimeConfig;
use crate::driver::Driver;
use crate::error::StatusCode;
use crate::object::{Binder, Handle, RemoteObject};
use crate::refbase::{Shared, WeakHandle};

/// Controls whether non-oneway calls are warned about or treated as fatal
/// (`spec.md` §4.3 `setCallRestriction`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRestriction {
    None,
    ErrorIfNotOneway,
    FatalIfNotOneway,
}

struct HandleEntry {
    weak: Option<WeakHandle<RemoteObject>>,
    /// Raw address of the `RemoteObject` `weak` last pointed at, used by
    /// `expunge_handle` to tell "this is still the proxy I constructed" from
    /// "the handle was reused by a different proxy in the meantime" without
    /// needing an owning reference to compare against. Never dereferenced.
    identity: usize,
}

/// High/low watermarks for the per-origin outstanding-proxy quota (`spec.md`
/// §4.6, §7 "count by uid").
#[derive(Debug, Clone, Copy)]
pub struct ProxyCountWatermarks {
    pub high: i32,
    pub low: i32,
}

impl Default for ProxyCountWatermarks {
    fn default() -> Self {
        ProxyCountWatermarks { high: 2500, low: 2000 }
    }
}

type ProxyCountCallback = Box<dyn Fn(i32, i32) + Send + Sync>;

/// Per-uid outstanding proxy count plus whether that uid is currently
/// throttled (latched above `high`, cleared once back below `low`).
#[derive(Default)]
struct ProxyQuota {
    count_by_uid: bool,
    throttle: bool,
    watermarks: ProxyCountWatermarks,
    callback: Option<ProxyCountCallback>,
    counts: HashMap<i32, (i32, bool)>,
}

pub struct ProcessState {
    driver: Box<dyn Driver>,
    config: RuntimeConfig,
    handles: Mutex<Vec<HandleEntry>>,
    local_objects: Mutex<HashMap<u64, Shared<dyn Binder>>>,
    next_local_token: AtomicU64,
    thread_pool_started: AtomicBool,
    max_threads: AtomicU32,
    call_restriction: Mutex<CallRestriction>,
    is_context_manager: AtomicBool,
    /// The object dispatched to when an inbound `TRANSACTION` names no
    /// specific local object (`spec.md` §4.4 "otherwise dispatch to the
    /// process-wide context object"). Set by whichever local object the
    /// context-manager process registers after `become_context_manager`.
    context_object: Mutex<Option<Shared<dyn Binder>>>,
    proxy_quota: Mutex<ProxyQuota>,
}

static GLOBAL: OnceLock<Arc<ProcessState>> = OnceLock::new();

thread_local! {
    static CURRENT_PROCESS: RefCell<Option<Arc<ProcessState>>> = const { RefCell::new(None) };
}

impl ProcessState {
    fn new_with_driver(driver: Box<dyn Driver>, config: RuntimeConfig) -> Arc<ProcessState> {
        Arc::new(ProcessState {
            driver,
            max_threads: AtomicU32::new(config.max_threads),
            config,
            handles: Mutex::new(Vec::new()),
            local_objects: Mutex::new(HashMap::new()),
            next_local_token: AtomicU64::new(1),
            thread_pool_started: AtomicBool::new(false),
            call_restriction: Mutex::new(CallRestriction::None),
            is_context_manager: AtomicBool::new(false),
            context_object: Mutex::new(None),
            proxy_quota: Mutex::new(ProxyQuota::default()),
        })
    }

    /// `initWithDriver(path)`: constructs the process-wide singleton
    /// against a real character-device driver. Fails if the singleton
    /// already exists with a different configuration.
    pub fn init_with_driver(path: &str) -> Result<Arc<ProcessState>, StatusCode> {
        let mut config = RuntimeConfig::default();
        config.driver_path = path.to_string();
        Self::init_with_config(config)
    }

    pub fn init_with_config(config: RuntimeConfig) -> Result<Arc<ProcessState>, StatusCode> {
        if let Some(existing) = GLOBAL.get() {
            if existing.config.driver_path != config.driver_path {
                return Err(StatusCode::AlreadyExists);
            }
            return Ok(existing.clone());
        }
        let driver = crate::driver::linux::LinuxDriver::open(
            &config.driver_path,
            config.mmap_size,
            config.max_threads,
        )?;
        let process = Self::new_with_driver(Box::new(driver), config);
        Ok(GLOBAL.get_or_init(|| process).clone())
    }

    /// Test-only: builds a standalone `ProcessState` around an arbitrary
    /// `Driver`, not wired into the process-wide singleton. Associate it
    /// with a thread via `adopt_for_this_thread` to model a second logical
    /// process sharing an in-memory driver.
    #[cfg(feature = "test-util")]
    pub fn for_test(driver: impl Driver + 'static, config: RuntimeConfig) -> Arc<ProcessState> {
        Self::new_with_driver(Box::new(driver), config)
    }

    /// `self()`: the calling thread's current process context, lazily
    /// defaulting to the process-wide singleton (`/dev/binder`, default
    /// config) if neither `init_with_driver` nor `adopt_for_this_thread`
    /// ran first.
    pub fn current() -> Arc<ProcessState> {
        CURRENT_PROCESS.with(|cell| {
            if let Some(existing) = cell.borrow().as_ref() {
                return existing.clone();
            }
            let process = GLOBAL
                .get_or_init(|| {
                    Self::init_with_driver(&RuntimeConfig::default().driver_path)
                        .expect("default driver initialization failed")
                })
                .clone();
            *cell.borrow_mut() = Some(process.clone());
            process
        })
    }

    /// Binds `process` as the calling thread's process context. Used by
    /// tests to run two logical processes in one test binary, and by
    /// `start_thread_pool`'s spawned workers to inherit the owning
    /// process's context.
    pub fn adopt_for_this_thread(process: &Arc<ProcessState>) {
        CURRENT_PROCESS.with(|cell| *cell.borrow_mut() = Some(process.clone()));
    }

    pub fn driver_handle(&self) -> &dyn Driver {
        self.driver.as_ref()
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// `getContextObject(caller)`: the proxy for handle 0.
    pub fn get_context_object(&self) -> Option<Shared<dyn Binder>> {
        self.get_strong_proxy_for_handle(0)
    }

    /// `getStrongProxyForHandle(handle)`. Handle 0 additionally pings the
    /// driver during construction to force context-manager registration;
    /// a dead ping yields `None`.
    pub fn get_strong_proxy_for_handle(&self, handle: Handle) -> Option<Shared<dyn Binder>> {
        {
            let mut guard = self.handles.lock().unwrap();
            if (handle as usize) >= guard.len() {
                guard.resize_with(handle as usize + 1, || HandleEntry {
                    weak: None,
                    identity: 0,
                });
            }
            if let Some(weak) = &guard[handle as usize].weak {
                if let Some(strong) = weak.upgrade() {
                    return Some(coerce_remote(strong));
                }
            }
        }
        let uid = crate::thread_state::ThreadState::current().calling_uid();
        if !self.note_new_proxy(uid) {
            return None;
        }
        let proxy = Shared::new(RemoteObject::new(handle));
        proxy.set_tracked_uid(uid);
        crate::thread_state::ThreadState::current().inc_weak_handle(handle);
        if handle == 0 {
            let ping = proxy.ping_binder();
            if ping == Err(StatusCode::DeadObject) {
                self.release_proxy_quota(uid);
                return None;
            }
        }
        let identity = &*proxy as *const RemoteObject as usize;
        let weak = Shared::downgrade(&proxy);
        let mut guard = self.handles.lock().unwrap();
        guard[handle as usize] = HandleEntry {
            weak: Some(weak),
            identity,
        };
        Some(coerce_remote(proxy))
    }

    /// Returns the concrete proxy already registered at `handle`, without
    /// constructing one. Used by `thread_state::execute_command` to deliver
    /// `BR_DEAD_BINDER`, which needs `RemoteObject::send_obituary` and not
    /// just the `Binder` trait surface, and to route
    /// `BR_CLEAR_DEATH_NOTIFICATION_DONE` back to the proxy that requested
    /// it. A table miss (the proxy already fully torn down) is a normal
    /// race, not an error.
    pub(crate) fn concrete_proxy_for_handle(&self, handle: Handle) -> Option<Shared<RemoteObject>> {
        self.handles
            .lock()
            .unwrap()
            .get(handle as usize)?
            .weak
            .as_ref()?
            .upgrade()
    }

    /// `expungeHandle(handle, proxy)`: clears the table slot iff it still
    /// points at the proxy identified by `identity`. The `WeakHandle` is
    /// dropped only after the table lock is released, since dropping it can
    /// itself be the event that drops the last reference to the
    /// `RemoteObject` and reenters this same function from `Drop`.
    pub(crate) fn expunge_handle(&self, handle: Handle, identity: usize) {
        let removed = {
            let mut guard = self.handles.lock().unwrap();
            match guard.get_mut(handle as usize) {
                Some(entry) if entry.identity == identity => {
                    entry.identity = 0;
                    entry.weak.take()
                }
                _ => None,
            }
        };
        drop(removed);
    }

    /// `setCountByUidEnabled`: toggles the per-origin outstanding-proxy
    /// quota (`spec.md` §4.6, §5 "per-origin proxy quota maps: single
    /// mutex").
    pub fn set_proxy_count_by_uid_enabled(&self, enabled: bool) {
        self.proxy_quota.lock().unwrap().count_by_uid = enabled;
    }

    pub fn set_proxy_count_watermarks(&self, watermarks: ProxyCountWatermarks) {
        self.proxy_quota.lock().unwrap().watermarks = watermarks;
    }

    pub fn set_proxy_count_throttle_enabled(&self, enabled: bool) {
        self.proxy_quota.lock().unwrap().throttle = enabled;
    }

    /// Registers the callback invoked with `(uid, count)` the first time a
    /// uid's outstanding proxy count crosses the high watermark, until it
    /// later falls back below the low watermark.
    pub fn set_proxy_count_callback(&self, callback: impl Fn(i32, i32) + Send + Sync + 'static) {
        self.proxy_quota.lock().unwrap().callback = Some(Box::new(callback));
    }

    /// Accounts a proxy about to be constructed for `uid`. Returns `false`
    /// when throttling is enabled and `uid` is still latched above the high
    /// watermark, in which case no proxy should be constructed.
    fn note_new_proxy(&self, uid: i32) -> bool {
        let mut guard = self.proxy_quota.lock().unwrap();
        if !guard.count_by_uid {
            return true;
        }
        let throttle = guard.throttle;
        let high = guard.watermarks.high;
        let (count, already_over) = {
            let entry = guard.counts.entry(uid).or_insert((0, false));
            if throttle && entry.1 {
                return false;
            }
            entry.0 += 1;
            *entry
        };
        if count > high && !already_over {
            guard.counts.get_mut(&uid).unwrap().1 = true;
            if let Some(callback) = guard.callback.as_ref() {
                callback(uid, count);
            }
        }
        true
    }

    /// Releases one proxy's accounting for `uid`, clearing the throttle
    /// latch once the count drops back below the low watermark. Called from
    /// `RemoteObject`'s destructor as well as from the failed-ping path
    /// above.
    pub(crate) fn release_proxy_quota(&self, uid: i32) {
        let mut guard = self.proxy_quota.lock().unwrap();
        if !guard.count_by_uid {
            return;
        }
        let low = guard.watermarks.low;
        if let Some(entry) = guard.counts.get_mut(&uid) {
            entry.0 -= 1;
            if entry.1 && entry.0 < low {
                entry.1 = false;
            }
        }
    }

    /// `registerLocalObject`/table of opaque tokens standing in for the
    /// original's raw local-object pointers (`spec.md` §9 "Raw pointers
    /// across address spaces").
    pub fn register_local_object(&self, obj: &Shared<dyn Binder>) -> u64 {
        let token = self.next_local_token.fetch_add(1, Ordering::Relaxed);
        self.local_objects.lock().unwrap().insert(token, obj.clone());
        token
    }

    pub fn lookup_local_object(&self, token: u64) -> Option<Shared<dyn Binder>> {
        self.local_objects.lock().unwrap().get(&token).cloned()
    }

    /// `startThreadPool()`: idempotent; spawns one main-looper worker
    /// thread that inherits this process's context.
    pub fn start_thread_pool(self: &Arc<Self>) {
        if self
            .thread_pool_started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let process = self.clone();
        std::thread::Builder::new()
            .name("binder-main-looper".to_string())
            .spawn(move || {
                ProcessState::adopt_for_this_thread(&process);
                crate::thread_state::ThreadState::current().join_thread_pool(true);
            })
            .expect("failed to spawn main looper thread");
    }

    /// Spawns one additional (non-main) pool worker in response to an
    /// inbound `SPAWN_LOOPER` (`spec.md` §4.3, §4.4).
    pub fn spawn_pool_worker(self: &Arc<Self>) {
        let process = self.clone();
        std::thread::Builder::new()
            .name("binder-pool-worker".to_string())
            .spawn(move || {
                ProcessState::adopt_for_this_thread(&process);
                crate::thread_state::ThreadState::current().join_thread_pool(false);
            })
            .expect("failed to spawn pool worker thread");
    }

    /// `becomeContextManager()`.
    pub fn become_context_manager(&self) -> Result<(), StatusCode> {
        self.driver.become_context_manager()?;
        self.is_context_manager.store(true, Ordering::Release);
        Ok(())
    }

    pub fn is_context_manager(&self) -> bool {
        self.is_context_manager.load(Ordering::Acquire)
    }

    /// Installs the local object inbound transactions with no named target
    /// dispatch to. Only meaningful in the process that holds the context
    /// manager role.
    pub fn set_context_object(&self, object: Shared<dyn Binder>) {
        *self.context_object.lock().unwrap() = Some(object);
    }

    pub fn context_object(&self) -> Option<Shared<dyn Binder>> {
        self.context_object.lock().unwrap().clone()
    }

    /// `setThreadPoolMaxThreadCount(n)`: may only grow after the pool has
    /// started.
    pub fn set_thread_pool_max_thread_count(&self, n: u32) -> Result<(), StatusCode> {
        if self.thread_pool_started.load(Ordering::Acquire) && n < self.max_threads.load(Ordering::Acquire) {
            return Err(StatusCode::InvalidOperation);
        }
        self.driver.set_max_threads(n)?;
        self.max_threads.store(n, Ordering::Release);
        Ok(())
    }

    /// `setCallRestriction(mode)`: must be called before the pool starts.
    pub fn set_call_restriction(&self, mode: CallRestriction) -> Result<(), StatusCode> {
        if self.thread_pool_started.load(Ordering::Acquire) {
            return Err(StatusCode::InvalidOperation);
        }
        *self.call_restriction.lock().unwrap() = mode;
        Ok(())
    }

    pub fn call_restriction(&self) -> CallRestriction {
        *self.call_restriction.lock().unwrap()
    }

    /// Test-only: detaches this thread's adopted process context so the
    /// next `current()` call rebuilds a fresh one. Rust has no per-process
    /// fork isolation between unit tests the way the original's C test
    /// suite gets from separate `execve`d binaries; this is the idiomatic
    /// substitute (`SPEC_FULL.md` §4.3).
    #[cfg(any(test, feature = "test-util"))]
    pub fn shutdown_unique_for_tests() {
        CURRENT_PROCESS.with(|cell| *cell.borrow_mut() = None);
    }
}

/// Upcasts a concrete `Shared<RemoteObject>` to the polymorphic `Shared<dyn
/// Binder>` object-manager callers expect. `Shared<T>`'s inner `Arc` is
/// `pub(crate)` exactly so this ordinary `Arc` unsizing coercion is
/// available here.
fn coerce_remote(proxy: Shared<RemoteObject>) -> Shared<dyn Binder> {
    Shared(proxy.0)
}
