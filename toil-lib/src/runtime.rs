// SPDX-FileCopyrightText: Copyright © 2016-2025 toil-lib Developers
//
// SPDX-License-Identifier: Apache-2.0

use std::{
    future::Future,
    io,
    sync::{OnceLock, RwLock},
};

use tokio::runtime;

static RUNTIME: OnceLock<RwLock<State>> = OnceLock::new();

#[derive(Default)]
struct State {
    guards: usize,
    runtime: Option<Runtime>,
}

/// Guarded initialisation of the tokio runtime
///
/// Workflows may overlap, so the runtime is built with the first
/// live [`Guard`] and dropped with the last.
pub fn init() -> Guard {
    let mut state = RUNTIME.get_or_init(Default::default).write().unwrap();

    state.guards += 1;
    if state.runtime.is_none() {
        state.runtime = Some(Runtime::new().expect("build runtime"));
    }

    Guard
}

fn release() {
    let mut state = RUNTIME.get().unwrap().write().unwrap();

    state.guards -= 1;
    if state.guards == 0 {
        drop(state.runtime.take());
    }
}

/// The Guard provides a scoped token to utilise the Runtime
#[must_use = "runtime is dropped with the last guard"]
pub struct Guard;

impl Drop for Guard {
    fn drop(&mut self) {
        release()
    }
}

/// Lifetime management handle for the runtime
struct Runtime(runtime::Runtime);

impl Runtime {
    /// Construct a new Runtime on the current thread
    fn new() -> io::Result<Self> {
        Ok(Self(runtime::Builder::new_current_thread().enable_all().build()?))
    }
}

/// Run the provided future on the current runtime.
pub fn block_on<T, F>(task: F) -> T
where
    F: Future<Output = T>,
{
    let state = RUNTIME.get().expect("runtime initialized").read().unwrap();
    let rt = state.runtime.as_ref().expect("runtime initialized");
    rt.0.block_on(task)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn runtime_survives_overlapping_guards() {
        let first = init();
        let second = init();

        drop(first);
        assert_eq!(block_on(async { 7 }), 7);
        drop(second);
    }
}
