// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The service-manager broker: a well-known remote object at handle 0 that
//! bootstraps every other service (`spec.md` §4.7), grounded in
//! `original_source/binderlib/base/BnServiceManager.c` and
//! `IServiceManager.c`.
//!
//! This module provides both halves of the broker: [`ServiceManagerService`]
//! is the in-process directory implementation the `servicemanager` binary
//! runs behind a [`LocalObject`], and [`BpServiceManager`] is the typed
//! client shim every other process talks to through a [`RemoteObject`]
//! proxy for handle 0.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::error::{Exception, ExceptionCode, Status, StatusCode};
use crate::object::{
    Binder, BinderFlags, DeathRecipient, Descriptor, LocalObject, OnTransact, TransactionCode,
    FIRST_CALL_TRANSACTION,
};
use crate::parcel::Parcel;
use crate::process_state::ProcessState;
use crate::refbase::{RefCounted, Shared};
use crate::thread_state::ThreadState;

/// Fixed descriptor string for interoperability with the matching
/// stub/proxy pair (`spec.md` §6).
pub const SERVICE_MANAGER_DESCRIPTOR: &str = "Vela.os.IServiceManager";
const SERVICE_CALLBACK_DESCRIPTOR: &str = "Vela.os.IServiceCallback";

/// Well-known name the `servicemanager` binary registers itself under
/// (`spec.md` §6 CLI surface).
pub const SELF_SERVICE_NAME: &str = "manager";

const GET_SERVICE: TransactionCode = FIRST_CALL_TRANSACTION;
const CHECK_SERVICE: TransactionCode = FIRST_CALL_TRANSACTION + 1;
const ADD_SERVICE: TransactionCode = FIRST_CALL_TRANSACTION + 2;
const LIST_SERVICES: TransactionCode = FIRST_CALL_TRANSACTION + 3;
const REGISTER_FOR_NOTIFICATIONS: TransactionCode = FIRST_CALL_TRANSACTION + 4;
const UNREGISTER_FOR_NOTIFICATIONS: TransactionCode = FIRST_CALL_TRANSACTION + 5;
const IS_DECLARED: TransactionCode = FIRST_CALL_TRANSACTION + 6;
const GET_DECLARED_INSTANCES: TransactionCode = FIRST_CALL_TRANSACTION + 7;
const REGISTER_CLIENT_CALLBACK: TransactionCode = FIRST_CALL_TRANSACTION + 8;
const TRY_UNREGISTER_SERVICE: TransactionCode = FIRST_CALL_TRANSACTION + 9;
const GET_SERVICE_DEBUG_INFO: TransactionCode = FIRST_CALL_TRANSACTION + 10;

const ON_SERVICE_REGISTRATION: TransactionCode = FIRST_CALL_TRANSACTION;

/// Writes the reply-body status record described in `spec.md` §4.7: an
/// exception code, and (if nonzero) an interface-qualified message plus a
/// reserved field, plus a service-specific error for that one exception
/// kind.
fn write_status(reply: &mut Parcel, exception: &Exception) -> Status {
    reply.write_i32(exception.code as i32)?;
    if exception.code != ExceptionCode::None {
        reply.write_string(Some(&exception.message))?;
        reply.write_i32(0)?;
        if exception.code == ExceptionCode::ServiceSpecific {
            reply.write_i32(exception.service_specific_error)?;
        }
    }
    Ok(())
}

/// Reads the status record back; a nonzero exception collapses to
/// `FAILED_TRANSACTION` for the caller (the original message/service-specific
/// detail is logged, not surfaced through the plain `StatusCode` return).
fn read_status(reply: &Parcel) -> Result<(), StatusCode> {
    let code = reply.read_i32()?;
    if code == ExceptionCode::None as i32 {
        return Ok(());
    }
    let message = reply.read_string()?;
    let _reserved = reply.read_i32()?;
    if code == ExceptionCode::ServiceSpecific as i32 {
        let _service_specific = reply.read_i32()?;
    }
    log::warn!("servicemanager call failed: {}", message.unwrap_or_default());
    Err(StatusCode::FailedTransaction)
}

fn is_valid_service_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 127
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/' | '-'))
}

/// One entry of `listServices`/`getServiceDebugInfo` (`spec.md` §4.7,
/// `SPEC_FULL.md` §4.7: "additionally returns `(name, debug_pid)` pairs").
#[derive(Debug, Clone)]
pub struct ServiceDebugInfo {
    pub name: String,
    pub debug_pid: i32,
}

/// Recipient of `registerForNotifications` callbacks. The generated client
/// stub for `waitForService` below is the one first-party implementor; other
/// callers may implement it directly.
pub trait ServiceCallback: Send + Sync {
    fn on_registration(&self, name: &str, binder: Option<Shared<dyn Binder>>);
}

struct ServiceCallbackStub(Box<dyn ServiceCallback>);

impl OnTransact for ServiceCallbackStub {
    fn on_transact(
        &self,
        code: TransactionCode,
        data: &Parcel,
        _reply: &mut Parcel,
        _flags: BinderFlags,
    ) -> Status {
        match code {
            ON_SERVICE_REGISTRATION => {
                data.check_interface(&Descriptor::from(SERVICE_CALLBACK_DESCRIPTOR))?;
                let name = data.read_string()?.unwrap_or_default();
                let binder = data.read_nullable_strong_binder()?;
                self.0.on_registration(&name, binder);
                Ok(())
            }
            _ => Err(StatusCode::UnknownTransaction),
        }
    }

    fn get_descriptor(&self) -> Descriptor {
        Descriptor::from(SERVICE_CALLBACK_DESCRIPTOR)
    }
}

fn service_callback_binder(owning_pid: i32, callback: Box<dyn ServiceCallback>) -> Shared<dyn Binder> {
    let local = Shared::new(LocalObject::new(Box::new(ServiceCallbackStub(callback)), owning_pid));
    Shared(local.0)
}

struct ServiceEntry {
    binder: Shared<dyn Binder>,
    allow_isolated: bool,
    dump_priority: i32,
    debug_pid: i32,
}

/// Recipient installed on every submitted service binder so a dead service
/// is auto-removed from the directory (`spec.md` §4.7 "registers for death
/// notifications on the submitted binder").
struct AutoRemoveOnDeath {
    registry: Arc<ServiceManagerService>,
    name: String,
}

impl RefCounted for AutoRemoveOnDeath {}

impl DeathRecipient for AutoRemoveOnDeath {
    fn binder_died(&self, _who: &Shared<dyn Binder>) {
        let removed = self.registry.services.lock().unwrap().remove(&self.name);
        if removed.is_some() {
            log::info!("servicemanager: removed dead service '{}'", self.name);
        }
    }
}

fn notify_registration(callback: &Shared<dyn Binder>, name: &str, binder: Option<Shared<dyn Binder>>) {
    let mut data = Parcel::new();
    if data.write_interface_token(SERVICE_CALLBACK_DESCRIPTOR).is_err() {
        return;
    }
    if data.write_string(Some(name)).is_err() {
        return;
    }
    if data.write_strong_binder(binder.as_ref()).is_err() {
        return;
    }
    let mut reply = Parcel::new();
    if let Err(status) = callback.transact(ON_SERVICE_REGISTRATION, &data, &mut reply, BinderFlags::ONEWAY) {
        log::warn!("servicemanager: notifying callback for '{name}' failed: {status}");
    }
}

/// The in-process "service manager" directory: `name -> {binder,
/// allowIsolated, dumpPriority, debugPid}` plus the pending
/// `registerForNotifications` callback lists (`spec.md` §4.7).
pub struct ServiceManagerService {
    services: Mutex<HashMap<String, ServiceEntry>>,
    callbacks: Mutex<HashMap<String, Vec<Shared<dyn Binder>>>>,
    client_callbacks: Mutex<HashMap<String, Vec<Shared<dyn Binder>>>>,
}

impl ServiceManagerService {
    pub fn new() -> Arc<ServiceManagerService> {
        Arc::new(ServiceManagerService {
            services: Mutex::new(HashMap::new()),
            callbacks: Mutex::new(HashMap::new()),
            client_callbacks: Mutex::new(HashMap::new()),
        })
    }

    /// Wraps this registry as the `LocalObject` the process installs as its
    /// context object (`spec.md` §4.3 `getContextObject`, §4.7 "runs as the
    /// process that calls becomeContextManager()").
    pub fn into_local_object(self: Arc<Self>, owning_pid: i32) -> LocalObject {
        LocalObject::new(Box::new(ServiceManagerStub(self)), owning_pid)
    }

    fn get_service(&self, name: &str) -> Option<Shared<dyn Binder>> {
        self.services.lock().unwrap().get(name).map(|e| e.binder.clone())
    }

    /// `addService(name, object, allowIsolated, dumpPriority)`: validates
    /// the name, registers for death notifications, overwrites any previous
    /// entry, fires pending callbacks (testable properties 7, 9).
    pub fn add_service(
        self: &Arc<Self>,
        name: &str,
        binder: Shared<dyn Binder>,
        allow_isolated: bool,
        dump_priority: i32,
        debug_pid: i32,
    ) -> Result<(), StatusCode> {
        if !is_valid_service_name(name) {
            return Err(StatusCode::BadValue);
        }
        let watcher = Shared::new(AutoRemoveOnDeath {
            registry: self.clone(),
            name: name.to_string(),
        });
        let watcher: Shared<dyn DeathRecipient> = Shared(watcher.0);
        // Best-effort: a local-only binder in the same process never dies
        // independently of the process itself, so `link_to_death` returning
        // `INVALID_OPERATION` there is expected, not a failure to propagate.
        let _ = binder.link_to_death(watcher, 0, 0);
        self.services.lock().unwrap().insert(
            name.to_string(),
            ServiceEntry {
                binder: binder.clone(),
                allow_isolated,
                dump_priority,
                debug_pid,
            },
        );
        let pending = self
            .callbacks
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .unwrap_or_default();
        for callback in pending {
            notify_registration(&callback, name, Some(binder.clone()));
        }
        Ok(())
    }

    fn list_services(&self, dump_priority: i32) -> Vec<ServiceDebugInfo> {
        self.services
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, entry)| dump_priority == 0 || (entry.dump_priority & dump_priority) != 0)
            .map(|(name, entry)| ServiceDebugInfo {
                name: name.clone(),
                debug_pid: entry.debug_pid,
            })
            .collect()
    }

    fn register_for_notifications(&self, name: &str, callback: Shared<dyn Binder>) -> Result<(), StatusCode> {
        if !is_valid_service_name(name) {
            return Err(StatusCode::BadValue);
        }
        let existing = self.get_service(name);
        self.callbacks
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .push(callback.clone());
        if let Some(binder) = existing {
            notify_registration(&callback, name, Some(binder));
        }
        Ok(())
    }

    fn unregister_for_notifications(&self, name: &str, callback: &Shared<dyn Binder>) -> Result<(), StatusCode> {
        let mut guard = self.callbacks.lock().unwrap();
        if let Some(list) = guard.get_mut(name) {
            let before = list.len();
            list.retain(|c| !Shared::ptr_eq(c, callback));
            if list.len() != before {
                return Ok(());
            }
        }
        Err(StatusCode::NameNotFound)
    }

    fn is_declared(&self, name: &str) -> bool {
        self.services.lock().unwrap().contains_key(name)
    }

    fn get_declared_instances(&self, iface: &str) -> Vec<String> {
        self.services
            .lock()
            .unwrap()
            .keys()
            .filter(|name| name.starts_with(iface))
            .cloned()
            .collect()
    }

    /// `registerClientCallback(name, object, callback)`: `spec.md` names
    /// this operation but leaves its semantics unspecified beyond the
    /// signature. This port treats it as "notify `callback` if `name` is
    /// ever removed from the directory" (a client-count callback needs a
    /// proxy reference-count channel this runtime does not expose), which
    /// is a resolved Open Question -- see `DESIGN.md`.
    fn register_client_callback(&self, name: &str, service: &Shared<dyn Binder>, callback: Shared<dyn Binder>) -> Result<(), StatusCode> {
        let guard = self.services.lock().unwrap();
        match guard.get(name) {
            Some(entry) if Shared::ptr_eq(&entry.binder, service) => {}
            Some(_) => return Err(StatusCode::AlreadyExists),
            None => return Err(StatusCode::NameNotFound),
        }
        drop(guard);
        self.client_callbacks
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default()
            .push(callback);
        Ok(())
    }

    fn try_unregister_service(&self, name: &str, binder: &Shared<dyn Binder>) -> bool {
        let mut guard = self.services.lock().unwrap();
        let matches = guard.get(name).is_some_and(|entry| Shared::ptr_eq(&entry.binder, binder));
        if matches {
            guard.remove(name);
            drop(guard);
            if let Some(watchers) = self.client_callbacks.lock().unwrap().remove(name) {
                for callback in watchers {
                    let mut data = Parcel::new();
                    let _ = data.write_interface_token(SERVICE_CALLBACK_DESCRIPTOR);
                    let _ = data.write_string(Some(name));
                    let mut reply = Parcel::new();
                    let _ = callback.transact(ON_SERVICE_REGISTRATION, &data, &mut reply, BinderFlags::ONEWAY);
                }
            }
        }
        matches
    }
}

struct ServiceManagerStub(Arc<ServiceManagerService>);

impl OnTransact for ServiceManagerStub {
    fn on_transact(
        &self,
        code: TransactionCode,
        data: &Parcel,
        reply: &mut Parcel,
        _flags: BinderFlags,
    ) -> Status {
        data.check_interface(&Descriptor::from(SERVICE_MANAGER_DESCRIPTOR))?;
        match code {
            GET_SERVICE | CHECK_SERVICE => {
                let name = data.read_string()?.ok_or(StatusCode::BadValue)?;
                let service = self.0.get_service(&name);
                write_status(reply, &Exception::ok())?;
                reply.write_strong_binder(service.as_ref())
            }
            ADD_SERVICE => {
                let name = data.read_string()?.ok_or(StatusCode::BadValue)?;
                let binder = data.read_nullable_strong_binder()?.ok_or(StatusCode::UnexpectedNull)?;
                let allow_isolated = data.read_bool()?;
                let dump_priority = data.read_i32()?;
                let debug_pid = ThreadState::current().calling_pid();
                match self.0.add_service(&name, binder, allow_isolated, dump_priority, debug_pid) {
                    Ok(()) => write_status(reply, &Exception::ok()),
                    Err(status) => write_status(reply, &Exception::from_status(status)),
                }
            }
            LIST_SERVICES => {
                let dump_priority = data.read_i32()?;
                let services = self.0.list_services(dump_priority);
                write_status(reply, &Exception::ok())?;
                reply.write_i32(services.len() as i32)?;
                for info in services {
                    reply.write_string(Some(&info.name))?;
                    reply.write_i32(info.debug_pid)?;
                }
                Ok(())
            }
            REGISTER_FOR_NOTIFICATIONS => {
                let name = data.read_string()?.ok_or(StatusCode::BadValue)?;
                let callback = data.read_nullable_strong_binder()?.ok_or(StatusCode::UnexpectedNull)?;
                match self.0.register_for_notifications(&name, callback) {
                    Ok(()) => write_status(reply, &Exception::ok()),
                    Err(status) => write_status(reply, &Exception::from_status(status)),
                }
            }
            UNREGISTER_FOR_NOTIFICATIONS => {
                let name = data.read_string()?.ok_or(StatusCode::BadValue)?;
                let callback = data.read_nullable_strong_binder()?.ok_or(StatusCode::UnexpectedNull)?;
                match self.0.unregister_for_notifications(&name, &callback) {
                    Ok(()) => write_status(reply, &Exception::ok()),
                    Err(status) => write_status(reply, &Exception::from_status(status)),
                }
            }
            IS_DECLARED => {
                let name = data.read_string()?.ok_or(StatusCode::BadValue)?;
                write_status(reply, &Exception::ok())?;
                reply.write_bool(self.0.is_declared(&name))
            }
            GET_DECLARED_INSTANCES => {
                let iface = data.read_string()?.ok_or(StatusCode::BadValue)?;
                let instances = self.0.get_declared_instances(&iface);
                write_status(reply, &Exception::ok())?;
                reply.write_i32(instances.len() as i32)?;
                for name in instances {
                    reply.write_string(Some(&name))?;
                }
                Ok(())
            }
            REGISTER_CLIENT_CALLBACK => {
                let name = data.read_string()?.ok_or(StatusCode::BadValue)?;
                let service = data.read_nullable_strong_binder()?.ok_or(StatusCode::UnexpectedNull)?;
                let callback = data.read_nullable_strong_binder()?.ok_or(StatusCode::UnexpectedNull)?;
                match self.0.register_client_callback(&name, &service, callback) {
                    Ok(()) => write_status(reply, &Exception::ok()),
                    Err(status) => write_status(reply, &Exception::from_status(status)),
                }
            }
            TRY_UNREGISTER_SERVICE => {
                let name = data.read_string()?.ok_or(StatusCode::BadValue)?;
                let service = data.read_nullable_strong_binder()?.ok_or(StatusCode::UnexpectedNull)?;
                write_status(reply, &Exception::ok())?;
                reply.write_bool(self.0.try_unregister_service(&name, &service))
            }
            GET_SERVICE_DEBUG_INFO => {
                let services = self.0.list_services(0);
                write_status(reply, &Exception::ok())?;
                reply.write_i32(services.len() as i32)?;
                for info in services {
                    reply.write_string(Some(&info.name))?;
                    reply.write_i32(info.debug_pid)?;
                }
                Ok(())
            }
            _ => Err(StatusCode::UnknownTransaction),
        }
    }

    fn get_descriptor(&self) -> Descriptor {
        Descriptor::from(SERVICE_MANAGER_DESCRIPTOR)
    }
}

/// Typed client shim over the generic transact protocol (`spec.md` §4.7).
/// Every method is a thin wrapper: write the interface token, write
/// arguments in declaration order, transact, read the status record, read
/// the return value.
pub struct BpServiceManager {
    remote: Shared<dyn Binder>,
}

impl BpServiceManager {
    pub fn new(remote: Shared<dyn Binder>) -> BpServiceManager {
        BpServiceManager { remote }
    }

    fn call(&self, code: TransactionCode, write_args: impl FnOnce(&mut Parcel) -> Status) -> Result<Parcel, StatusCode> {
        let mut data = Parcel::new();
        data.write_interface_token(SERVICE_MANAGER_DESCRIPTOR)?;
        write_args(&mut data)?;
        let mut reply = Parcel::new();
        self.remote.transact(code, &data, &mut reply, BinderFlags::NONE)?;
        read_status(&reply)?;
        Ok(reply)
    }

    /// `checkService(name)`: a single lookup, no retry.
    pub fn check_service(&self, name: &str) -> Result<Option<Shared<dyn Binder>>, StatusCode> {
        let reply = self.call(CHECK_SERVICE, |data| data.write_string(Some(name)))?;
        reply.read_nullable_strong_binder()
    }

    /// `getService(name)`: retries `checkService` with a 100 ms backoff up
    /// to 5 s before giving up (`spec.md` §4.7 client shim).
    pub fn get_service(&self, name: &str) -> Result<Option<Shared<dyn Binder>>, StatusCode> {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(service) = self.check_service(name)? {
                return Ok(Some(service));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(Duration::from_millis(100));
        }
    }

    pub fn add_service(
        &self,
        name: &str,
        service: Shared<dyn Binder>,
        allow_isolated: bool,
        dump_priority: i32,
    ) -> Result<(), StatusCode> {
        self.call(ADD_SERVICE, |data| {
            data.write_string(Some(name))?;
            data.write_strong_binder(Some(&service))?;
            data.write_bool(allow_isolated)?;
            data.write_i32(dump_priority)
        })?;
        Ok(())
    }

    pub fn list_services(&self, dump_priority: i32) -> Result<Vec<ServiceDebugInfo>, StatusCode> {
        let reply = self.call(LIST_SERVICES, |data| data.write_i32(dump_priority))?;
        read_debug_info_list(&reply)
    }

    pub fn register_for_notifications(&self, name: &str, callback: Shared<dyn Binder>) -> Result<(), StatusCode> {
        self.call(REGISTER_FOR_NOTIFICATIONS, |data| {
            data.write_string(Some(name))?;
            data.write_strong_binder(Some(&callback))
        })?;
        Ok(())
    }

    pub fn unregister_for_notifications(&self, name: &str, callback: Shared<dyn Binder>) -> Result<(), StatusCode> {
        self.call(UNREGISTER_FOR_NOTIFICATIONS, |data| {
            data.write_string(Some(name))?;
            data.write_strong_binder(Some(&callback))
        })?;
        Ok(())
    }

    pub fn is_declared(&self, name: &str) -> Result<bool, StatusCode> {
        let reply = self.call(IS_DECLARED, |data| data.write_string(Some(name)))?;
        reply.read_bool()
    }

    pub fn get_declared_instances(&self, iface: &str) -> Result<Vec<String>, StatusCode> {
        let reply = self.call(GET_DECLARED_INSTANCES, |data| data.write_string(Some(iface)))?;
        let count = reply.read_i32()?.max(0) as usize;
        let mut out = Vec::with_capacity(count);
        for _ in 0..count {
            out.push(reply.read_string()?.unwrap_or_default());
        }
        Ok(out)
    }

    pub fn register_client_callback(
        &self,
        name: &str,
        service: Shared<dyn Binder>,
        callback: Shared<dyn Binder>,
    ) -> Result<(), StatusCode> {
        self.call(REGISTER_CLIENT_CALLBACK, |data| {
            data.write_string(Some(name))?;
            data.write_strong_binder(Some(&service))?;
            data.write_strong_binder(Some(&callback))
        })?;
        Ok(())
    }

    pub fn try_unregister_service(&self, name: &str, service: Shared<dyn Binder>) -> Result<bool, StatusCode> {
        let reply = self.call(TRY_UNREGISTER_SERVICE, |data| {
            data.write_string(Some(name))?;
            data.write_strong_binder(Some(&service))
        })?;
        reply.read_bool()
    }

    pub fn get_service_debug_info(&self) -> Result<Vec<ServiceDebugInfo>, StatusCode> {
        let reply = self.call(GET_SERVICE_DEBUG_INFO, |_| Ok(()))?;
        read_debug_info_list(&reply)
    }

    /// `waitForService(name)`: subscribes via `registerForNotifications`,
    /// blocks on a condition variable, unregisters, and returns the
    /// resolved object.
    pub fn wait_for_service(&self, name: &str, owning_pid: i32) -> Result<Option<Shared<dyn Binder>>, StatusCode> {
        if let Some(existing) = self.check_service(name)? {
            return Ok(Some(existing));
        }
        let state = Arc::new(WaitState {
            resolved: Mutex::new(None),
            done: Mutex::new(false),
            cvar: Condvar::new(),
        });
        let callback = service_callback_binder(owning_pid, Box::new(WaitForServiceCallback(state.clone())));
        self.register_for_notifications(name, callback.clone())?;
        let guard = state.resolved.lock().unwrap();
        let guard = state
            .cvar
            .wait_while(guard, |resolved| resolved.is_none() && !*state.done.lock().unwrap())
            .unwrap();
        let resolved = guard.clone();
        drop(guard);
        let _ = self.unregister_for_notifications(name, callback);
        Ok(resolved)
    }
}

fn read_debug_info_list(reply: &Parcel) -> Result<Vec<ServiceDebugInfo>, StatusCode> {
    let count = reply.read_i32()?.max(0) as usize;
    let mut out = Vec::with_capacity(count);
    for _ in 0..count {
        let name = reply.read_string()?.unwrap_or_default();
        let debug_pid = reply.read_i32()?;
        out.push(ServiceDebugInfo { name, debug_pid });
    }
    Ok(out)
}

struct WaitState {
    resolved: Mutex<Option<Shared<dyn Binder>>>,
    done: Mutex<bool>,
    cvar: Condvar,
}

struct WaitForServiceCallback(Arc<WaitState>);

impl ServiceCallback for WaitForServiceCallback {
    fn on_registration(&self, _name: &str, binder: Option<Shared<dyn Binder>>) {
        *self.0.resolved.lock().unwrap() = binder;
        *self.0.done.lock().unwrap() = true;
        self.0.cvar.notify_all();
    }
}

/// `defaultServiceManager()`: the process-wide client shim over handle 0.
pub fn default_service_manager() -> Option<BpServiceManager> {
    let remote = ProcessState::current().get_context_object()?;
    Some(BpServiceManager::new(remote))
}

#[cfg(all(test, feature = "test-util"))]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::driver::loopback::{LoopbackDriver, LoopbackKernel};
    use crate::object::{LocalObject, OnTransact, PING_TRANSACTION};

    struct Echo;
    impl OnTransact for Echo {
        fn on_transact(&self, _code: TransactionCode, _data: &Parcel, _reply: &mut Parcel, _flags: BinderFlags) -> Status {
            Ok(())
        }
        fn get_descriptor(&self) -> Descriptor {
            Descriptor::from("test.IEcho")
        }
    }

    fn spawn_registry() -> (Arc<ProcessState>, Arc<ServiceManagerService>) {
        let kernel = LoopbackKernel::new();
        let server = ProcessState::for_test(LoopbackDriver::new(kernel.clone()), RuntimeConfig::default());
        ProcessState::adopt_for_this_thread(&server);
        let registry = ServiceManagerService::new();
        let local = Shared::new(registry.clone().into_local_object(1));
        let binder: Shared<dyn Binder> = Shared(local.0);
        server.set_context_object(binder);
        server.become_context_manager().unwrap();
        std::thread::Builder::new()
            .name("sm-looper".to_string())
            .spawn({
                let server = server.clone();
                move || {
                    ProcessState::adopt_for_this_thread(&server);
                    ThreadState::current().join_thread_pool(true);
                }
            })
            .unwrap();
        (server, registry)
    }

    fn client_of(kernel: &LoopbackKernel) -> Arc<ProcessState> {
        ProcessState::for_test(LoopbackDriver::new(kernel.clone()), RuntimeConfig::default())
    }

    #[test]
    fn add_and_check_service_round_trips() {
        let kernel = LoopbackKernel::new();
        let server = ProcessState::for_test(LoopbackDriver::new(kernel.clone()), RuntimeConfig::default());
        ProcessState::adopt_for_this_thread(&server);
        let registry = ServiceManagerService::new();
        let local = Shared::new(registry.clone().into_local_object(1));
        let binder: Shared<dyn Binder> = Shared(local.0);
        server.set_context_object(binder);
        server.become_context_manager().unwrap();
        std::thread::Builder::new()
            .spawn({
                let server = server.clone();
                move || {
                    ProcessState::adopt_for_this_thread(&server);
                    ThreadState::current().join_thread_pool(true);
                }
            })
            .unwrap();

        let client = client_of(&kernel);
        ProcessState::adopt_for_this_thread(&client);
        let sm = BpServiceManager::new(client.get_strong_proxy_for_handle(0).unwrap());

        let echo = Shared::new(LocalObject::new(Box::new(Echo), 2));
        let echo_dyn: Shared<dyn Binder> = Shared(echo.0);
        sm.add_service("echo", echo_dyn, false, 0).unwrap();

        let found = sm.check_service("echo").unwrap().expect("service registered");
        assert!(found.ping_binder().is_ok());
        assert_eq!(found.get_interface_descriptor().0, "test.IEcho");
        ProcessState::shutdown_unique_for_tests();
    }

    #[test]
    fn invalid_names_rejected_valid_names_accepted() {
        assert!(!is_valid_service_name(""));
        assert!(!is_valid_service_name("bad name"));
        assert!(is_valid_service_name("ok.name-1/sub"));
        assert!(is_valid_service_name(&"a".repeat(127)));
        assert!(!is_valid_service_name(&"a".repeat(128)));
    }

    #[test]
    fn registration_notification_fires_for_pending_watcher() {
        let (server, registry) = spawn_registry();
        let _ = &server;
        let received = Arc::new(Mutex::new(None));
        struct Capture(Arc<Mutex<Option<String>>>);
        impl ServiceCallback for Capture {
            fn on_registration(&self, name: &str, _binder: Option<Shared<dyn Binder>>) {
                *self.0.lock().unwrap() = Some(name.to_string());
            }
        }
        let callback = service_callback_binder(1, Box::new(Capture(received.clone())));
        registry.register_for_notifications("late", callback).unwrap();
        let echo = Shared::new(LocalObject::new(Box::new(Echo), 1));
        let echo_dyn: Shared<dyn Binder> = Shared(echo.0);
        registry.add_service("late", echo_dyn, false, 0, 1).unwrap();
        assert_eq!(received.lock().unwrap().as_deref(), Some("late"));
        ProcessState::shutdown_unique_for_tests();
    }
}
