//! Program cache: avoids recompiling the same kernel signature twice.
//!
//! Keyed by signature: the structural hash of the kernel body, its parameter
//! types, its output dimensions, and the (name, generation) pair of every
//! helper function it reaches. Concurrent requests for one signature are
//! single-flight: the first caller compiles, later callers block until the
//! outcome is published. Failures are handed to the waiters but never stored,
//! so the next request tries again.

use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::backend::NativeProgram;
use crate::codegen::BufferManifest;
use crate::config::Dimensions;
use crate::error::{KernelError, Result};
use crate::functions::FunctionSnapshot;
use crate::kernel_ir::ValueType;

/// Cache key.
pub type Signature = u64;

/// Signature of a kernel as it would be compiled right now.
pub fn signature(
    body_hash: u64,
    types: &[ValueType],
    dims: &Dimensions,
    functions: &FunctionSnapshot,
) -> Signature {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    body_hash.hash(&mut hasher);
    types.hash(&mut hasher);
    dims.hash(&mut hasher);
    functions.fingerprint(&mut hasher);
    hasher.finish()
}

/// A program built for one signature. Shared with in-flight runs through
/// `Arc`, so eviction never pulls a program out from under an execution.
pub struct CompiledProgram {
    signature: Signature,
    native: NativeProgram,
    manifest: BufferManifest,
    source: String,
    functions: Vec<String>,
}

impl CompiledProgram {
    pub fn new(
        signature: Signature,
        native: NativeProgram,
        manifest: BufferManifest,
        source: String,
        functions: Vec<String>,
    ) -> Self {
        CompiledProgram {
            signature,
            native,
            manifest,
            source,
            functions,
        }
    }

    pub fn signature(&self) -> Signature {
        self.signature
    }

    pub fn native(&self) -> &NativeProgram {
        &self.native
    }

    pub fn manifest(&self) -> &BufferManifest {
        &self.manifest
    }

    /// Shader text the program was built from.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Helper functions baked into the program.
    pub fn functions(&self) -> &[String] {
        &self.functions
    }

    fn uses_function(&self, name: &str) -> bool {
        self.functions.iter().any(|f| f == name)
    }
}

impl std::fmt::Debug for CompiledProgram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledProgram")
            .field("signature", &format_args!("{:016x}", self.signature))
            .field("backend", &self.native.backend_name())
            .field("functions", &self.functions)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Requests that waited on another caller's compilation.
    pub waits: u64,
    pub compiles: u64,
    pub failures: u64,
    pub evictions: u64,
    pub invalidations: u64,
}

type Outcome = Result<Arc<CompiledProgram>>;

#[derive(Default)]
struct Flight {
    outcome: Mutex<Option<Outcome>>,
    done: Condvar,
}

impl Flight {
    fn publish(&self, outcome: Outcome) {
        *self.outcome.lock() = Some(outcome);
        self.done.notify_all();
    }

    fn wait(&self) -> Outcome {
        let mut outcome = self.outcome.lock();
        loop {
            if let Some(result) = outcome.as_ref() {
                return result.clone();
            }
            self.done.wait(&mut outcome);
        }
    }
}

enum Slot {
    Ready(Arc<CompiledProgram>),
    Pending(Arc<Flight>),
}

#[derive(Default)]
struct CacheState {
    slots: HashMap<Signature, Slot>,
    order: VecDeque<Signature>,
    stats: CacheStats,
}

impl CacheState {
    fn ready_len(&self) -> usize {
        self.slots
            .values()
            .filter(|s| matches!(s, Slot::Ready(_)))
            .count()
    }
}

/// Signature-keyed store of compiled programs.
pub struct ProgramCache {
    state: Mutex<CacheState>,
    capacity: Option<usize>,
}

impl Default for ProgramCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgramCache {
    /// Unbounded cache.
    pub fn new() -> Self {
        ProgramCache {
            state: Mutex::new(CacheState::default()),
            capacity: None,
        }
    }

    /// Cache holding at most `capacity` programs, evicting the oldest first.
    pub fn with_capacity(capacity: usize) -> Self {
        ProgramCache {
            state: Mutex::new(CacheState::default()),
            capacity: Some(capacity.max(1)),
        }
    }

    /// Return the cached program for `signature`, compiling it with `compile`
    /// if no caller has done so yet.
    pub fn get_or_compile<F>(&self, signature: Signature, compile: F) -> Outcome
    where
        F: FnOnce() -> Result<CompiledProgram>,
    {
        let flight = {
            let mut state = self.state.lock();
            match state.slots.get(&signature) {
                Some(Slot::Ready(program)) => {
                    let program = Arc::clone(program);
                    state.stats.hits += 1;
                    log::trace!("program cache hit for {signature:016x}");
                    return Ok(program);
                }
                Some(Slot::Pending(flight)) => {
                    let flight = Arc::clone(flight);
                    state.stats.waits += 1;
                    drop(state);
                    log::debug!("waiting on in-flight compile of {signature:016x}");
                    return flight.wait();
                }
                None => {
                    let flight = Arc::new(Flight::default());
                    state
                        .slots
                        .insert(signature, Slot::Pending(Arc::clone(&flight)));
                    state.stats.misses += 1;
                    flight
                }
            }
        };

        let mut guard = FlightGuard {
            cache: self,
            signature,
            flight,
            finished: false,
        };
        let outcome = compile().map(Arc::new);
        guard.finish(outcome)
    }

    /// Drop every program that baked in `name`. Returns how many were dropped.
    pub fn invalidate_function(&self, name: &str) -> usize {
        let mut state = self.state.lock();
        let before = state.slots.len();
        state.slots.retain(|_, slot| match slot {
            Slot::Ready(program) => !program.uses_function(name),
            Slot::Pending(_) => true,
        });
        let removed = before - state.slots.len();
        if removed > 0 {
            let CacheState { slots, order, .. } = &mut *state;
            order.retain(|sig| slots.contains_key(sig));
            state.stats.invalidations += removed as u64;
            log::debug!("invalidated {removed} program(s) using '{name}'");
        }
        removed
    }

    pub fn get(&self, signature: Signature) -> Option<Arc<CompiledProgram>> {
        match self.state.lock().slots.get(&signature) {
            Some(Slot::Ready(program)) => Some(Arc::clone(program)),
            _ => None,
        }
    }

    /// Number of compiled programs held.
    pub fn len(&self) -> usize {
        self.state.lock().ready_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state
            .slots
            .retain(|_, slot| matches!(slot, Slot::Pending(_)));
        state.order.clear();
    }

    pub fn stats(&self) -> CacheStats {
        self.state.lock().stats
    }

    fn settle(&self, signature: Signature, outcome: &Outcome) {
        let mut state = self.state.lock();
        match outcome {
            Ok(program) => {
                state
                    .slots
                    .insert(signature, Slot::Ready(Arc::clone(program)));
                state.stats.compiles += 1;
                if let Some(capacity) = self.capacity {
                    state.order.push_back(signature);
                    while state.ready_len() > capacity {
                        let Some(oldest) = state.order.pop_front() else {
                            break;
                        };
                        if let Some(Slot::Ready(_)) = state.slots.get(&oldest) {
                            state.slots.remove(&oldest);
                            state.stats.evictions += 1;
                            log::debug!("evicted program {oldest:016x}");
                        }
                    }
                }
            }
            Err(err) => {
                state.slots.remove(&signature);
                state.stats.failures += 1;
                log::debug!("compile of {signature:016x} failed: {err}");
            }
        }
    }
}

/// Publishes an outcome exactly once, even if the compile closure panics.
struct FlightGuard<'c> {
    cache: &'c ProgramCache,
    signature: Signature,
    flight: Arc<Flight>,
    finished: bool,
}

impl FlightGuard<'_> {
    fn finish(&mut self, outcome: Outcome) -> Outcome {
        self.cache.settle(self.signature, &outcome);
        self.flight.publish(outcome.clone());
        self.finished = true;
        outcome
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            let outcome = Err(KernelError::compilation("compilation aborted"));
            self.cache.settle(self.signature, &outcome);
            self.flight.publish(outcome);
        }
    }
}
