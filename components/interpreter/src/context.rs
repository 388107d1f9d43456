//! Execution context
//!
//! Everything the dispatch engine reaches besides the fiber it runs: the
//! frame pool, the method scope, globals, the current schedule and the
//! optional debugger. A context is threaded explicitly through every call.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_runtime::{Budget, Schedule};
use core_types::{NameTable, Value};
use memory_manager::FramePool;
use parking_lot::RwLock;

use crate::config::RuntimeConfig;
use crate::debugger::Debugger;
use crate::dispatch::Fiber;
use crate::methods::MethodScope;

/// Snapshot of execution counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextStats {
    /// Instructions dispatched
    pub instructions: u64,
    /// Calls made, including tail calls and method calls
    pub calls: u64,
    /// Fiber runs cut short by the budget
    pub preemptions: u64,
    /// Frames suspended as generators
    pub suspensions: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    instructions: AtomicU64,
    calls: AtomicU64,
    preemptions: AtomicU64,
    suspensions: AtomicU64,
}

impl Counters {
    pub(crate) fn instructions(&self, n: u64) {
        self.instructions.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn call(&self) {
        self.calls.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn preemption(&self) {
        self.preemptions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn suspension(&self) {
        self.suspensions.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ContextStats {
        ContextStats {
            instructions: self.instructions.load(Ordering::Relaxed),
            calls: self.calls.load(Ordering::Relaxed),
            preemptions: self.preemptions.load(Ordering::Relaxed),
            suspensions: self.suspensions.load(Ordering::Relaxed),
        }
    }
}

/// State shared by every fiber running in one context
pub struct ExecutionContext {
    pool: Arc<FramePool>,
    methods: Arc<MethodScope>,
    globals: Arc<RwLock<NameTable<Value>>>,
    schedule: Option<Arc<dyn Schedule<Fiber>>>,
    debugger: Option<Arc<dyn Debugger>>,
    config: RuntimeConfig,
    next_frame: Arc<AtomicU64>,
    pub(crate) counters: Arc<Counters>,
}

impl ExecutionContext {
    /// Create a context with its own pool and root method scope
    pub fn new(config: RuntimeConfig) -> Self {
        let pool = Arc::new(FramePool::new(
            config.frame_pool_slots,
            config.frame_size_class,
        ));
        Self {
            pool,
            methods: MethodScope::new(),
            globals: Arc::new(RwLock::new(NameTable::new())),
            schedule: None,
            debugger: None,
            config,
            next_frame: Arc::new(AtomicU64::new(1)),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Draw frames from a pool shared with other contexts
    pub fn with_pool(mut self, pool: Arc<FramePool>) -> Self {
        self.pool = pool;
        self
    }

    /// Hand preempted fibers to `schedule`
    pub fn with_schedule(mut self, schedule: Arc<dyn Schedule<Fiber>>) -> Self {
        self.schedule = Some(schedule);
        self
    }

    /// Attach a debugger to frames entered from now on
    pub fn with_debugger(mut self, debugger: Arc<dyn Debugger>) -> Self {
        self.debugger = Some(debugger);
        self
    }

    /// A context whose method definitions layer over this one's.
    ///
    /// The sandbox shares the pool, globals, schedule and debugger.
    pub fn sandbox(&self) -> Self {
        Self {
            pool: Arc::clone(&self.pool),
            methods: MethodScope::child(&self.methods),
            globals: Arc::clone(&self.globals),
            schedule: self.schedule.clone(),
            debugger: self.debugger.clone(),
            config: self.config.clone(),
            next_frame: Arc::clone(&self.next_frame),
            counters: Arc::clone(&self.counters),
        }
    }

    /// The frame pool
    pub fn pool(&self) -> &Arc<FramePool> {
        &self.pool
    }

    /// The method scope
    pub fn methods(&self) -> &Arc<MethodScope> {
        &self.methods
    }

    /// Configuration this context was built from
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// The attached debugger
    pub fn debugger(&self) -> Option<&dyn Debugger> {
        self.debugger.as_deref()
    }

    /// The current schedule
    pub fn schedule(&self) -> Option<&Arc<dyn Schedule<Fiber>>> {
        self.schedule.as_ref()
    }

    /// Budget for the next fiber run; unlimited without a schedule
    pub fn budget(&self) -> Budget {
        self.schedule
            .as_ref()
            .map_or(Budget::Unlimited, |schedule| schedule.budget())
    }

    pub(crate) fn next_frame_id(&self) -> u64 {
        self.next_frame.fetch_add(1, Ordering::Relaxed)
    }

    /// Value of global `name`
    pub fn global(&self, name: &str) -> Option<Value> {
        self.globals.read().get(name).cloned()
    }

    /// Define or overwrite global `name`
    pub fn define_global(&self, name: &str, value: Value) {
        self.globals.write().insert(name, value);
    }

    /// Execution counters
    pub fn stats(&self) -> ContextStats {
        self.counters.snapshot()
    }
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("pool", &self.pool.stats())
            .field("methods", &self.methods.id())
            .field("scheduled", &self.schedule.is_some())
            .field("debugger", &self.debugger.is_some())
            .field("stats", &self.stats())
            .finish()
    }
}
