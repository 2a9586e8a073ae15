//! Process-wide Binder callback thread pool.
//!
//! The platform codec only delivers results while a Binder thread is
//! dispatching in this process. One background thread is parked in
//! `IPCThreadState::joinThreadPool` for the process lifetime; it is never
//! torn down between encodes.

use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::{Mutex, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use libloading::os::unix::{Library as UnixLibrary, RTLD_GLOBAL, RTLD_NOW};
use tracing::{debug, info, warn};

use crate::contract::RunnerError;
use crate::loader::{resolve, resolve_optional};

const LIBBINDER: &str = "libbinder.so";
const SELF_SYMBOL: &str = "_ZN7android14IPCThreadState4selfEv";
const JOIN_SYMBOL: &str = "_ZN7android14IPCThreadState14joinThreadPoolEb";
const FLUSH_SYMBOL: &str = "_ZN7android14IPCThreadState13flushCommandsEv";
const STOP_SYMBOL: &str = "_ZN7android14IPCThreadState11stopProcessEb";

/// Opaque `IPCThreadState*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpcState(NonNull<c_void>);

// SAFETY: the pointer is only handed back to libbinder, which owns the
// object and synchronizes access to it.
unsafe impl Send for IpcState {}
unsafe impl Sync for IpcState {}

impl IpcState {
    #[must_use]
    pub fn new(raw: *mut c_void) -> Option<Self> {
        NonNull::new(raw).map(Self)
    }

    #[must_use]
    pub fn as_ptr(self) -> *mut c_void {
        self.0.as_ptr()
    }
}

/// Entry points of the platform IPC library.
pub trait IpcBackend: Send + Sync + 'static {
    fn ipc_state(&self) -> Option<IpcState>;
    /// Blocks, dispatching callbacks, until the process is stopped.
    fn join_thread_pool(&self, state: IpcState);
    /// Returns false when the entry point is unavailable.
    fn flush_commands(&self, state: IpcState) -> bool;
    /// Returns false when the entry point is unavailable.
    fn stop_process(&self, state: IpcState) -> bool;
}

/// Grace periods around pool transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolTiming {
    pub startup: Duration,
    pub drain: Duration,
    pub shutdown: Duration,
}

impl Default for PoolTiming {
    fn default() -> Self {
        Self {
            startup: Duration::from_millis(1),
            drain: Duration::from_millis(150),
            shutdown: Duration::from_millis(10),
        }
    }
}

#[derive(Debug, Default)]
struct PoolState {
    ipc: Option<IpcState>,
    thread: Option<JoinHandle<()>>,
    debug_level: u32,
}

#[derive(Debug)]
pub struct CallbackPool<B: IpcBackend> {
    backend: std::sync::Arc<B>,
    timing: PoolTiming,
    state: Mutex<PoolState>,
}

impl<B: IpcBackend> CallbackPool<B> {
    pub fn new(backend: B, timing: PoolTiming) -> Self {
        Self {
            backend: std::sync::Arc::new(backend),
            timing,
            state: Mutex::new(PoolState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn set_debug_level(&self, debug_level: u32) {
        self.lock().debug_level = debug_level;
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.lock().thread.is_some()
    }

    /// Starts the dispatch thread once; later calls return true without
    /// doing anything.
    pub fn init(&self) -> bool {
        let mut state = self.lock();
        if state.thread.is_some() {
            return true;
        }
        let Some(ipc) = self.backend.ipc_state() else {
            warn!("IPCThreadState::self() returned null; callback pool not started");
            return false;
        };
        let backend = std::sync::Arc::clone(&self.backend);
        let debug_level = state.debug_level;
        let spawned = thread::Builder::new()
            .name("binder-pool".to_string())
            .spawn(move || {
                debug!(debug_level, "joining binder thread pool");
                backend.join_thread_pool(ipc);
                debug!(debug_level, "binder thread pool returned");
            });
        match spawned {
            Ok(handle) => {
                state.ipc = Some(ipc);
                state.thread = Some(handle);
                drop(state);
                thread::sleep(self.timing.startup);
                info!("binder callback pool started");
                true
            }
            Err(err) => {
                warn!(%err, "cannot spawn binder thread");
                false
            }
        }
    }

    /// Pushes queued commands to the driver and waits for the media
    /// server to drain its replies.
    pub fn flush(&self) {
        let Some(ipc) = self.lock().ipc else {
            return;
        };
        if !self.backend.flush_commands(ipc) {
            debug!("flushCommands unavailable");
        }
        thread::sleep(self.timing.drain);
    }

    /// Stops the dispatch thread and joins it. Only meant for process exit.
    pub fn teardown(&self) {
        let (ipc, thread) = {
            let mut state = self.lock();
            (state.ipc.take(), state.thread.take())
        };
        let Some(thread) = thread else {
            return;
        };
        if let Some(ipc) = ipc {
            if !self.backend.stop_process(ipc) {
                warn!("stopProcess unavailable; not joining binder thread");
                return;
            }
        }
        if thread.join().is_err() {
            warn!("binder thread panicked");
        }
        thread::sleep(self.timing.shutdown);
        debug!("binder callback pool stopped");
    }
}

/// `libbinder.so`, opened globally as the platform expects.
pub struct LibBinder {
    _library: libloading::Library,
    ipc_self: unsafe extern "C" fn() -> *mut c_void,
    join_thread_pool: unsafe extern "C" fn(*mut c_void, bool),
    flush_commands: Option<unsafe extern "C" fn(*mut c_void)>,
    stop_process: Option<unsafe extern "C" fn(*mut c_void, bool)>,
}

impl LibBinder {
    pub fn load() -> Result<Self, RunnerError> {
        // SAFETY: libbinder has no unsafe initializers of its own.
        let library: libloading::Library = unsafe { UnixLibrary::open(Some(LIBBINDER), RTLD_NOW | RTLD_GLOBAL) }
            .map_err(|source| RunnerError::LoadLibrary {
                module: LIBBINDER.to_string(),
                source,
            })?
            .into();
        Ok(Self {
            ipc_self: resolve(&library, LIBBINDER, SELF_SYMBOL)?,
            join_thread_pool: resolve(&library, LIBBINDER, JOIN_SYMBOL)?,
            flush_commands: resolve_optional(&library, FLUSH_SYMBOL),
            stop_process: resolve_optional(&library, STOP_SYMBOL),
            _library: library,
        })
    }
}

impl IpcBackend for LibBinder {
    fn ipc_state(&self) -> Option<IpcState> {
        IpcState::new(unsafe { (self.ipc_self)() })
    }

    fn join_thread_pool(&self, state: IpcState) {
        unsafe { (self.join_thread_pool)(state.as_ptr(), false) };
    }

    fn flush_commands(&self, state: IpcState) -> bool {
        self.flush_commands
            .map(|flush| unsafe { flush(state.as_ptr()) })
            .is_some()
    }

    fn stop_process(&self, state: IpcState) -> bool {
        self.stop_process
            .map(|stop| unsafe { stop(state.as_ptr(), true) })
            .is_some()
    }
}

static POOL: OnceLock<Option<CallbackPool<LibBinder>>> = OnceLock::new();

fn global() -> Option<&'static CallbackPool<LibBinder>> {
    POOL.get_or_init(|| match LibBinder::load() {
        Ok(library) => Some(CallbackPool::new(library, PoolTiming::default())),
        Err(err) => {
            info!(%err, "binder callback pool unavailable");
            None
        }
    })
    .as_ref()
}

/// Starts the process-wide pool; true when it is running.
pub fn init(debug_level: u32) -> bool {
    global().is_some_and(|pool| {
        pool.set_debug_level(debug_level);
        pool.init()
    })
}

pub fn flush() {
    if let Some(pool) = POOL.get().and_then(Option::as_ref) {
        pool.flush();
    }
}

pub fn teardown() {
    if let Some(pool) = POOL.get().and_then(Option::as_ref) {
        pool.teardown();
    }
}

pub fn set_debug_level(debug_level: u32) {
    if let Some(pool) = POOL.get().and_then(Option::as_ref) {
        pool.set_debug_level(debug_level);
    }
}
