/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! The process-wide instance: backend selection and lifecycle.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::backend::Backend;
use crate::backend::net::NetBackend;
use crate::backend::single::SingleBackend;
use crate::config::BackendKind;
use crate::config::Config;
use crate::data::Container;
use crate::error::Error;
use crate::error::Result;
use crate::group::Group;
use crate::partitioning::Partitioning;

/// Guards against two live instances created through [`init`]; its
/// lifetime is `init` to `finalize`.
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// A process's handle on the container runtime: the selected backend
/// and the world group the bootstrap produced.
pub struct Instance {
    backend: Box<dyn Backend>,
    world: Arc<Group>,
    location: String,
    guarded: bool,
}

/// Initialize an instance from the process environment.
///
/// Picks the backend per [`Config`], performs bootstrap (for the
/// point-to-point backend this blocks until the home process has seen
/// the configured world size), and returns the instance. At most one
/// instance created through this function may be live per process.
pub fn init() -> Result<Instance> {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return Err(Error::config(
            "an instance is already initialized in this process".to_string(),
        ));
    }
    let cfg = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(err) => {
            INITIALIZED.store(false, Ordering::SeqCst);
            return Err(err);
        }
    };
    match init_with(&cfg) {
        Ok(mut inst) => {
            inst.guarded = true;
            pause_for_debugger(&cfg, inst.myid());
            Ok(inst)
        }
        Err(err) => {
            INITIALIZED.store(false, Ordering::SeqCst);
            Err(err)
        }
    }
}

/// Initialize an instance from an explicit configuration, without the
/// process-wide guard. Thread-per-process test harnesses use this.
pub fn init_with(cfg: &Config) -> Result<Instance> {
    let location = default_location();
    let (backend, world, location): (Box<dyn Backend>, Arc<Group>, String) = match cfg.backend {
        BackendKind::Single => (
            Box::new(SingleBackend::new()),
            Group::world(vec![0], 0),
            location,
        ),
        BackendKind::Tcp => {
            let (backend, world) = NetBackend::bootstrap(cfg, &location)?;
            (Box::new(backend), world, location)
        }
    };
    tracing::info!(
        backend = backend.name(),
        location = %location,
        myid = world.myid(),
        size = world.size(),
        "instance initialized"
    );
    Ok(Instance {
        backend,
        world,
        location,
        guarded: false,
    })
}

/// This process's location string, `host:pid`.
pub fn default_location() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string());
    format!("{}:{}", host, std::process::id())
}

/// When `TESSERA_DEBUG_RANK` matches, spin until a debugger clears
/// the wait flag.
fn pause_for_debugger(cfg: &Config, myid: i32) {
    static WAIT: AtomicBool = AtomicBool::new(true);
    let Some(rank) = cfg.debug_rank else {
        return;
    };
    if rank >= 0 && rank != myid {
        return;
    }
    tracing::info!(
        pid = std::process::id(),
        myid,
        "pausing for debugger; clear tessera::instance::WAIT to continue"
    );
    while WAIT.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(10));
    }
}

impl Instance {
    /// This process's rank in the world group.
    pub fn myid(&self) -> i32 {
        self.world.myid()
    }

    /// World size.
    pub fn size(&self) -> usize {
        self.world.size()
    }

    /// This process's location string.
    pub fn location(&self) -> &str {
        &self.location
    }

    /// The world group (group 0).
    pub fn world(&self) -> &Arc<Group> {
        &self.world
    }

    /// The backend, for direct driving.
    pub fn backend_mut(&mut self) -> &mut dyn Backend {
        self.backend.as_mut()
    }

    /// Switch a container to a new partitioning through this
    /// instance's backend.
    pub fn switch(&mut self, container: &mut Container, p: Partitioning) -> Result<()> {
        container.set_partitioning(self.backend.as_mut(), p)
    }

    /// Negotiate a membership change at a phase boundary; returns the
    /// new world group. `leave` announces this process's departure.
    pub fn resize(&mut self, phase: i32, leave: bool) -> Result<Arc<Group>> {
        let world = self.backend.resize(phase, leave)?;
        self.world = Arc::clone(&world);
        Ok(world)
    }

    /// Release the backend and the process-wide guard.
    pub fn finalize(mut self) {
        self.backend.finalize();
        if self.guarded {
            self.guarded = false;
            INITIALIZED.store(false, Ordering::SeqCst);
        }
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        self.backend.finalize();
        if self.guarded {
            INITIALIZED.store(false, Ordering::SeqCst);
        }
    }
}
