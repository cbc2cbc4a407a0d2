// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The service-manager process: claims the context-manager role over
//! handle 0, registers itself under the well-known name `"manager"`, and
//! runs `ThreadState`'s polling loop forever (`spec.md` §4.7, §6 "CLI
//! surface").
//!
//! Invoked with an optional argument naming a driver path; no flags; exits
//! nonzero on failure to claim the context-manager role or to register
//! itself.

use anyhow::{anyhow, Context};

use vela_binder::config::RuntimeConfig;
use vela_binder::object::Binder;
use vela_binder::process_state::ProcessState;
use vela_binder::refbase::Shared;
use vela_binder::servicemanager::{BpServiceManager, ServiceManagerService, SELF_SERVICE_NAME};
use vela_binder::thread_state::ThreadState;

fn main() -> anyhow::Result<()> {
    vela_binder::init_default_service_manager_logging();

    let mut config = RuntimeConfig::from_env();
    if let Some(path) = std::env::args().nth(1) {
        config.driver_path = path;
    }
    log::info!(
        "vela servicemanager starting, driver path {}",
        config.driver_path
    );

    let process = ProcessState::init_with_config(config)
        .map_err(|status| anyhow!("failed to initialize process state: {status}"))?;

    process
        .become_context_manager()
        .context("failed to claim the context-manager role")?;

    let registry = ServiceManagerService::new();
    let local = Shared::new(registry.into_local_object(std::process::id() as i32));
    let binder: Shared<dyn Binder> = vela_binder::to_dyn_binder(local);
    process.set_context_object(binder.clone());

    // Registers itself under its own well-known name, the way other
    // processes look it up -- matches
    // `original_source/binderlib/servicemanager/main.c`'s self-registration.
    // `transact` on a `LocalObject` dispatches in-process, with no driver
    // round trip, so this calls straight into the registry just installed.
    let self_proxy = BpServiceManager::new(binder.clone());
    self_proxy
        .add_service(SELF_SERVICE_NAME, binder, false, 0)
        .context("failed to register self under the well-known name")?;

    log::info!("vela servicemanager ready, registered as '{SELF_SERVICE_NAME}'");
    ThreadState::current()
        .run_polling_loop()
        .map_err(|status| anyhow!("driver command loop exited: {status}"))?;
    Ok(())
}
