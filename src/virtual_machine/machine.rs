//! The Machine: a tree-walking interpreter driven by explicit stacks.
//!
//! Work is scheduled as [`Op`]s on an operation stack. Expression results go
//! to the value stack, lexical scopes to the block stack, calls and loops to
//! the frame stack and assignment destinations to the target stack. A single
//! [`Machine::step`] pops one op and runs its handler; [`Machine::run`] steps
//! until the operation stack drains.
//!
//! # Panics and faults
//!
//! Handlers that can fail at the language level return [`Fault`]. A
//! [`Fault::Panic`] is parked by [`Machine::trap`] and turned into an unwind
//! once the current op returns, so deferred calls get a chance to recover it.
//! A [`Fault::Fatal`] is a [`MachineError`]: it aborts the execution, discards
//! the realms' working sets and leaves the Machine empty.
//!
//! # Entry points
//!
//! - [`Machine::run_declarations`]: declare a package from its node
//! - [`Machine::load_package`]: bring a stored package back into memory
//! - [`Machine::run_func`] / [`Machine::run_main`]: call into the active package
//! - [`Machine::eval`] / [`Machine::run_statement`]: one-off evaluation

use crate::virtual_machine::alloc::{Allocator, DEFAULT_ALLOC_CEILING};
use crate::virtual_machine::errors::{ConvertError, MachineError};
use crate::virtual_machine::heap::Heap;
use crate::virtual_machine::native::NativeRegistry;
use crate::virtual_machine::realm::Realm;
use crate::virtual_machine::store::Store;
use crate::virtual_machine::type_system::{Name, Type, TypeId};
use crate::virtual_machine::uverse::universe;
use crate::virtual_machine::values::{
    Block, BlockSource, ObjRef, Object, PackageValue, TypedValue,
};
use crate::{debug, error, warn};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

/// Unwraps a `Result<T, Fault>` inside an op handler. A panic is parked for
/// the run loop and the handler returns early.
macro_rules! try_panic {
    ($m:ident, $e:expr) => {{
        let res = $e;
        match $m.trap(res)? {
            Some(v) => v,
            None => return Ok(()),
        }
    }};
}

mod assign;
mod binary;
mod call;
mod eval;
mod exec;
mod frame;
mod loader;
mod ops;
#[cfg(test)]
mod tests;

pub use assign::Target;
pub use frame::{CallFrame, Defer, Frame, FrameKind};
pub use ops::Op;

/// Outcome of a failed language-level operation.
#[derive(Debug)]
pub enum Fault {
    /// Recoverable by a deferred `recover()`.
    Panic(String),
    Fatal(MachineError),
}

impl Fault {
    pub fn arity(name: &str) -> Self {
        Fault::Fatal(MachineError::malformed(format!(
            "wrong number of arguments to {}",
            name
        )))
    }
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::Panic(msg) => write!(f, "panic: {}", msg),
            Fault::Fatal(err) => write!(f, "{}", err),
        }
    }
}

impl From<MachineError> for Fault {
    fn from(err: MachineError) -> Self {
        Fault::Fatal(err)
    }
}

impl From<ConvertError> for Fault {
    fn from(err: ConvertError) -> Self {
        match err {
            ConvertError::Invalid { .. } | ConvertError::Overflow { .. } => {
                Fault::Panic(err.to_string())
            }
            ConvertError::Unsupported(kind) => Fault::Fatal(MachineError::UnsupportedKind(kind)),
            ConvertError::AllocationLimit { used, ceiling } => {
                Fault::Fatal(MachineError::AllocationLimit { used, ceiling })
            }
        }
    }
}

/// Where `print`/`println` output goes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Output {
    /// Buffered, retrieved with [`Machine::take_output`].
    Capture,
    Stdout,
}

/// Construction options.
#[derive(Clone, Debug)]
pub struct MachineOptions {
    /// Path of the package active before any declaration runs.
    pub pkg_path: String,
    pub alloc_ceiling: u64,
    pub output: Output,
    /// Verify that entry points leave no state behind.
    pub check_empty: bool,
    /// Per-op trace logging. Lines still pass through the process log level.
    pub debug: bool,
    /// Record realm ops for inspection with [`Realm::sprint_ops`].
    pub log_realm_ops: bool,
}

impl Default for MachineOptions {
    fn default() -> Self {
        MachineOptions {
            pkg_path: "main".to_string(),
            alloc_ceiling: DEFAULT_ALLOC_CEILING,
            output: Output::Capture,
            check_empty: true,
            debug: false,
            log_realm_ops: false,
        }
    }
}

impl MachineOptions {
    /// Defaults overridden by `GNOVM_ALLOC_CEILING` and `GNOVM_DEBUG`. A set
    /// `GNOVM_DEBUG` also lowers the process log level to debug.
    pub fn from_env() -> Self {
        let mut options = MachineOptions::default();
        if let Ok(raw) = std::env::var("GNOVM_ALLOC_CEILING") {
            match raw.trim().parse::<u64>() {
                Ok(ceiling) => options.alloc_ceiling = ceiling,
                Err(_) => warn!("ignoring invalid GNOVM_ALLOC_CEILING={}", raw),
            }
        }
        if let Ok(raw) = std::env::var("GNOVM_DEBUG") {
            options.debug = matches!(raw.trim(), "1" | "true" | "yes");
            if options.debug {
                crate::utils::log::set_max_level(crate::utils::log::Level::Debug);
            }
        }
        options
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PanicState {
    Normal,
    Panicking,
    Recovered,
}

/// The value in flight during a panic and the calls it unwound through.
#[derive(Clone, Debug)]
pub struct Exception {
    pub value: TypedValue,
    /// Function names, outermost first.
    pub trace: Vec<String>,
}

pub struct Machine<'a> {
    ops: Vec<Op>,
    values: Vec<TypedValue>,
    blocks: Vec<ObjRef>,
    frames: Vec<Frame>,
    targets: Vec<Target>,
    pub heap: Heap,
    pub alloc: Allocator,
    store: &'a mut dyn Store,
    natives: Rc<NativeRegistry>,
    /// Active package; calls switch it to the callee's package.
    package: Rc<PackageValue>,
    /// Realm writes are attributed to. `None` outside realm packages.
    realm: Option<Rc<RefCell<Realm>>>,
    exception: Option<Exception>,
    panic_state: PanicState,
    /// Panic raised by the op being executed.
    pending_panic: Option<TypedValue>,
    universe: ObjRef,
    packages: HashMap<Name, Rc<PackageValue>>,
    types: HashMap<TypeId, Type>,
    output: String,
    options: MachineOptions,
}

impl<'a> Machine<'a> {
    pub fn new(store: &'a mut dyn Store, options: MachineOptions) -> Self {
        let mut heap = Heap::new();
        let u = universe();
        let mut ublock = Block::new(BlockSource::Universe, 0, None);
        ublock.values = u.values().to_vec();
        let universe = heap.alloc(Object::Block(ublock));

        let mut types = HashMap::new();
        for t in u.types() {
            if let Ok(id) = t.type_id() {
                types.insert(id, t.clone());
            }
        }

        let path: Name = Rc::from(options.pkg_path.as_str());
        let name: Name = Rc::from(path.rsplit('/').next().unwrap_or(&path));
        let block = heap.alloc(Object::Block(Block::new(
            BlockSource::Package(path.clone()),
            0,
            Some(universe),
        )));
        let package = Rc::new(PackageValue {
            name,
            path,
            block,
            realm: None,
        });

        Machine {
            ops: Vec::new(),
            values: Vec::new(),
            blocks: vec![block],
            frames: Vec::new(),
            targets: Vec::new(),
            heap,
            alloc: Allocator::new(options.alloc_ceiling),
            store,
            natives: Rc::new(NativeRegistry::new()),
            package,
            realm: None,
            exception: None,
            panic_state: PanicState::Normal,
            pending_panic: None,
            universe,
            packages: HashMap::new(),
            types,
            output: String::new(),
            options,
        }
    }

    /// Host functions available to native declarations.
    pub fn with_natives(mut self, natives: Rc<NativeRegistry>) -> Self {
        self.natives = natives;
        self
    }

    pub fn package(&self) -> &Rc<PackageValue> {
        &self.package
    }

    pub fn realm(&self) -> Option<&Rc<RefCell<Realm>>> {
        self.realm.as_ref()
    }

    pub fn panic_state(&self) -> PanicState {
        self.panic_state
    }

    pub fn store(&mut self) -> &mut dyn Store {
        &mut *self.store
    }

    /// Steps until the operation stack is empty. A fatal error leaves the
    /// Machine reset and its realms' working sets discarded.
    pub fn run(&mut self) -> Result<(), MachineError> {
        match self.drain() {
            Ok(()) => Ok(()),
            Err(err) => Err(self.abort(err)),
        }
    }

    /// Steps until the operation stack is empty, leaving cleanup to the
    /// entry point.
    fn drain(&mut self) -> Result<(), MachineError> {
        while !self.ops.is_empty() {
            self.step()?;
        }
        Ok(())
    }

    /// Executes one op. A panic it raises starts unwinding before this
    /// returns.
    pub fn step(&mut self) -> Result<(), MachineError> {
        let op = self.pop_op()?;
        // Sticky ops stay scheduled until their handler pops them.
        if op.is_sticky() {
            self.ops.push(op.clone());
        }
        if self.options.debug {
            debug!(
                "op {} (ops={} values={} blocks={} frames={})",
                op.name(),
                self.ops.len(),
                self.values.len(),
                self.blocks.len(),
                self.frames.len()
            );
        }
        self.exec_op(op)?;
        if let Some(value) = self.pending_panic.take() {
            self.start_panic(value)?;
        }
        Ok(())
    }

    /// Splits a handler result: panics are parked and yield `None`, fatal
    /// errors propagate.
    pub fn trap<T>(&mut self, res: Result<T, Fault>) -> Result<Option<T>, MachineError> {
        match res {
            Ok(v) => Ok(Some(v)),
            Err(Fault::Panic(msg)) => {
                self.pending_panic = Some(TypedValue::string(&msg));
                Ok(None)
            }
            Err(Fault::Fatal(err)) => Err(err),
        }
    }

    /// Raises a language-level panic carrying `x`.
    pub fn panic_value(&mut self, x: TypedValue) -> Result<(), Fault> {
        let value = self.default_value(x)?;
        self.pending_panic = Some(value);
        Ok(())
    }

    pub fn write_output(&mut self, s: &str) {
        match self.options.output {
            Output::Capture => self.output.push_str(s),
            Output::Stdout => print!("{}", s),
        }
    }

    /// Drains the captured output.
    pub fn take_output(&mut self) -> String {
        std::mem::take(&mut self.output)
    }

    /// Fails if anything but package blocks is left on the stacks.
    pub fn check_empty(&self) -> Result<(), MachineError> {
        let mut leftovers = Vec::new();
        if !self.ops.is_empty() {
            leftovers.push(format!("{} ops", self.ops.len()));
        }
        if !self.values.is_empty() {
            leftovers.push(format!("{} values", self.values.len()));
        }
        let blocks = self
            .blocks
            .iter()
            .filter(|b| !self.heap.is_package_block(**b))
            .count();
        if blocks > 0 {
            leftovers.push(format!("{} blocks", blocks));
        }
        if !self.frames.is_empty() {
            leftovers.push(format!("{} frames", self.frames.len()));
        }
        if !self.targets.is_empty() {
            leftovers.push(format!("{} targets", self.targets.len()));
        }
        if leftovers.is_empty() {
            Ok(())
        } else {
            Err(MachineError::LeftoverState(leftovers.join(", ")))
        }
    }

    /// Logs a fatal error, discards every realm touched by the execution and
    /// resets the stacks.
    fn abort(&mut self, err: MachineError) -> MachineError {
        match &err {
            MachineError::UnrecoveredPanic { value, .. } => warn!("unrecovered panic: {}", value),
            other => error!("machine aborted: {}", other),
        }
        let outermost = self.frames.iter().find_map(|frame| match &frame.kind {
            FrameKind::Call(cf) => Some((cf.last_package.clone(), cf.last_realm.clone())),
            _ => None,
        });
        // Any loaded realm may have been written by a call that already
        // returned, so all of them are rewound to their stored state.
        let mut realms: Vec<Rc<RefCell<Realm>>> = self
            .packages
            .values()
            .filter_map(|pv| pv.realm.clone())
            .collect();
        realms.sort_by(|a, b| a.borrow().path.cmp(&b.borrow().path));
        for realm in realms {
            let pkg = {
                let mut realm = realm.borrow_mut();
                realm.discard(&mut self.heap);
                realm.id
            };
            if let Err(e) = self.reload_realm(pkg) {
                error!("cannot rewind realm {}: {}", realm.borrow().path, e);
            }
        }
        if let Some((package, realm)) = outermost {
            self.package = package;
            self.realm = realm;
        }
        self.reset();
        err
    }

    fn reset(&mut self) {
        self.ops.clear();
        self.values.clear();
        self.frames.clear();
        self.targets.clear();
        self.blocks = vec![self.package.block];
        self.exception = None;
        self.pending_panic = None;
        self.panic_state = PanicState::Normal;
    }

    fn push_op(&mut self, op: Op) {
        self.ops.push(op);
    }

    fn pop_op(&mut self) -> Result<Op, MachineError> {
        self.ops.pop().ok_or(MachineError::StackUnderflow("op"))
    }

    pub fn push_value(&mut self, tv: TypedValue) {
        self.values.push(tv);
    }

    fn pop_value(&mut self) -> Result<TypedValue, MachineError> {
        self.values.pop().ok_or(MachineError::StackUnderflow("value"))
    }

    fn peek_value(&self) -> Result<&TypedValue, MachineError> {
        self.values.last().ok_or(MachineError::StackUnderflow("value"))
    }

    /// Pops `n` values, returned in push order.
    fn pop_values(&mut self, n: usize) -> Result<Vec<TypedValue>, MachineError> {
        let at = self
            .values
            .len()
            .checked_sub(n)
            .ok_or(MachineError::StackUnderflow("value"))?;
        Ok(self.values.split_off(at))
    }

    fn last_block(&self) -> Result<ObjRef, MachineError> {
        self.blocks
            .last()
            .copied()
            .ok_or(MachineError::StackUnderflow("block"))
    }

    /// Block `depth` parents above the innermost one.
    fn block_at(&self, depth: u16) -> Result<ObjRef, MachineError> {
        let mut b = self.last_block()?;
        for _ in 0..depth {
            b = self
                .heap
                .block(b)
                .and_then(|blk| blk.parent)
                .ok_or_else(|| MachineError::malformed(format!("no block at depth {}", depth)))?;
        }
        Ok(b)
    }

    /// Allocates a block under the innermost one and makes it current.
    fn push_block(&mut self, source: BlockSource, num_names: usize) -> Result<ObjRef, MachineError> {
        self.alloc.allocate_block(num_names)?;
        let parent = self.last_block()?;
        let r = self
            .heap
            .alloc(Object::Block(Block::new(source, num_names, Some(parent))));
        self.blocks.push(r);
        Ok(r)
    }

    /// Gives untyped constants their default type.
    fn default_value(&mut self, tv: TypedValue) -> Result<TypedValue, Fault> {
        if !tv.is_untyped() {
            return Ok(tv);
        }
        Ok(crate::virtual_machine::convert::convert_untyped(
            &mut self.heap,
            &mut self.alloc,
            tv,
            None,
        )?)
    }
}
