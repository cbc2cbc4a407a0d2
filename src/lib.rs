// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! User-space runtime for the Vela binder IPC framework.
//!
//! This crate implements the per-process client/server runtime that sits on
//! top of a single character-device driver (`/dev/binder`-shaped): the
//! thread-state that dials the driver, the proxy/stub pair that presents
//! remote objects as local ones, the reference-counting machine that keeps
//! objects alive across address spaces, the parcel used to marshal
//! arguments, and the service-manager broker that bootstraps everything
//! else.
//!
//! The kernel driver itself, the interface-definition-language code
//! generator, and the cross-machine transport are out of scope: this crate
//! specifies the runtime contract that generated stub/proxy code targets.

pub mod config;
pub mod driver;
pub mod error;
pub mod object;
pub mod parcel;
pub mod process_state;
pub mod refbase;
pub mod servicemanager;
pub mod stability;
pub mod thread_state;

pub use error::{Exception, ExceptionCode, Status, StatusCode};
pub use object::{
    to_dyn_binder, to_dyn_death_recipient, Binder, BinderFlags, DeathRecipient, Descriptor,
    LocalObject, RemoteObject, SchedPolicy, TransactionCode,
};
pub use parcel::Parcel;
pub use process_state::ProcessState;
pub use refbase::{RefCounted, Shared, WeakHandle};
pub use stability::Stability;
pub use thread_state::ThreadState;

/// Installs a simple `env_logger` subscriber.
///
/// Library code in this crate never calls this on its own behalf -- only
/// `src/bin/servicemanager.rs`'s `main` does, since a library must not
/// install a global logger for whatever embeds it.
pub fn init_default_service_manager_logging() {
    let _ = env_logger::try_init();
}
