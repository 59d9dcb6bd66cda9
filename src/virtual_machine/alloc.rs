//! Monotonic allocation quota for one execution.
//!
//! Every interpreted allocation of a composite value is charged here with a
//! size proportional to what it creates. There is no refund path; once the
//! running total passes the ceiling the execution is aborted.

use crate::virtual_machine::errors::MachineError;

/// Default per-execution ceiling in abstract allocation units.
pub const DEFAULT_ALLOC_CEILING: u64 = 1_000_000_000;

/// Abstract sizes charged per allocation.
pub mod sizes {
    /// Inline scalar slot: type pointer, value tag and 8 byte buffer.
    pub const TYPED_VALUE: u64 = 40;
    pub const OBJECT_INFO: u64 = 72;
    pub const STRING_BASE: u64 = 16;
    pub const BIGINT_BASE: u64 = 32;
    pub const ARRAY_BASE: u64 = OBJECT_INFO + 24;
    pub const SLICE: u64 = 40;
    pub const STRUCT_BASE: u64 = OBJECT_INFO + 24;
    pub const MAP_BASE: u64 = OBJECT_INFO + 48;
    /// Key, value and list links.
    pub const MAP_ITEM: u64 = 2 * TYPED_VALUE + 32;
    pub const BLOCK_BASE: u64 = OBJECT_INFO + 64;
    pub const FUNC: u64 = 64;
    pub const BOUND_METHOD: u64 = 24 + TYPED_VALUE;
    pub const HEAP_ITEM: u64 = OBJECT_INFO + TYPED_VALUE;
    pub const NATIVE: u64 = 32;
}

const ALLOC_KIND_COUNT: usize = 12;

/// `base + per * count`, pinned at `u64::MAX` so oversized requests trip the
/// ceiling instead of wrapping.
#[inline]
fn scaled(base: u64, per: u64, count: usize) -> u64 {
    let count = u64::try_from(count).unwrap_or(u64::MAX);
    base.saturating_add(per.saturating_mul(count))
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum AllocKind {
    String = 0,
    Bigint = 1,
    Array = 2,
    Slice = 3,
    Struct = 4,
    Map = 5,
    MapItem = 6,
    Block = 7,
    Func = 8,
    BoundMethod = 9,
    HeapItem = 10,
    Native = 11,
}

impl AllocKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            AllocKind::String => "String",
            AllocKind::Bigint => "Bigint",
            AllocKind::Array => "Array",
            AllocKind::Slice => "Slice",
            AllocKind::Struct => "Struct",
            AllocKind::Map => "Map",
            AllocKind::MapItem => "Map Item",
            AllocKind::Block => "Block",
            AllocKind::Func => "Func",
            AllocKind::BoundMethod => "Bound Method",
            AllocKind::HeapItem => "Heap Item",
            AllocKind::Native => "Native",
        }
    }

    const ALL: [AllocKind; ALLOC_KIND_COUNT] = [
        AllocKind::String,
        AllocKind::Bigint,
        AllocKind::Array,
        AllocKind::Slice,
        AllocKind::Struct,
        AllocKind::Map,
        AllocKind::MapItem,
        AllocKind::Block,
        AllocKind::Func,
        AllocKind::BoundMethod,
        AllocKind::HeapItem,
        AllocKind::Native,
    ];
}

/// Running byte counter with a hard ceiling and a per-kind breakdown.
#[derive(Clone, Debug)]
pub struct Allocator {
    ceiling: u64,
    used: u64,
    profile: [u64; ALLOC_KIND_COUNT],
}

impl Default for Allocator {
    fn default() -> Self {
        Self::new(DEFAULT_ALLOC_CEILING)
    }
}

impl Allocator {
    pub fn new(ceiling: u64) -> Self {
        Self {
            ceiling,
            used: 0,
            profile: [0; ALLOC_KIND_COUNT],
        }
    }

    /// Adds `n` units. Fails once the total exceeds the ceiling; the failed
    /// charge is still counted so later calls keep failing.
    #[inline]
    pub fn charge(&mut self, kind: AllocKind, n: u64) -> Result<(), MachineError> {
        self.used = self.used.saturating_add(n);
        let slot = &mut self.profile[kind as usize];
        *slot = slot.saturating_add(n);
        if self.used > self.ceiling {
            return Err(MachineError::AllocationLimit {
                used: self.used,
                ceiling: self.ceiling,
            });
        }
        Ok(())
    }

    pub fn allocate_string(&mut self, len: usize) -> Result<(), MachineError> {
        self.charge(AllocKind::String, scaled(sizes::STRING_BASE, 1, len))
    }

    pub fn allocate_bigint(&mut self, bits: u64) -> Result<(), MachineError> {
        self.charge(
            AllocKind::Bigint,
            sizes::BIGINT_BASE.saturating_add(bits.div_ceil(8)),
        )
    }

    pub fn allocate_array(&mut self, len: usize) -> Result<(), MachineError> {
        self.charge(
            AllocKind::Array,
            scaled(sizes::ARRAY_BASE, sizes::TYPED_VALUE, len),
        )
    }

    pub fn allocate_slice(&mut self) -> Result<(), MachineError> {
        self.charge(AllocKind::Slice, sizes::SLICE)
    }

    pub fn allocate_struct(&mut self, fields: usize) -> Result<(), MachineError> {
        self.charge(
            AllocKind::Struct,
            scaled(sizes::STRUCT_BASE, sizes::TYPED_VALUE, fields),
        )
    }

    pub fn allocate_map(&mut self, items: usize) -> Result<(), MachineError> {
        self.charge(AllocKind::Map, sizes::MAP_BASE)?;
        self.allocate_map_items(items)
    }

    pub fn allocate_map_items(&mut self, items: usize) -> Result<(), MachineError> {
        self.charge(AllocKind::MapItem, scaled(0, sizes::MAP_ITEM, items))
    }

    pub fn allocate_block(&mut self, names: usize) -> Result<(), MachineError> {
        self.charge(
            AllocKind::Block,
            scaled(sizes::BLOCK_BASE, sizes::TYPED_VALUE, names),
        )
    }

    pub fn allocate_func(&mut self) -> Result<(), MachineError> {
        self.charge(AllocKind::Func, sizes::FUNC)
    }

    pub fn allocate_bound_method(&mut self) -> Result<(), MachineError> {
        self.charge(AllocKind::BoundMethod, sizes::BOUND_METHOD)
    }

    pub fn allocate_heap_item(&mut self) -> Result<(), MachineError> {
        self.charge(AllocKind::HeapItem, sizes::HEAP_ITEM)
    }

    pub fn allocate_native(&mut self, len: usize) -> Result<(), MachineError> {
        self.charge(AllocKind::Native, scaled(sizes::NATIVE, 1, len))
    }

    pub fn used(&self) -> u64 {
        self.used
    }

    pub fn ceiling(&self) -> u64 {
        self.ceiling
    }

    pub fn remaining(&self) -> u64 {
        self.ceiling.saturating_sub(self.used)
    }

    /// Per-kind totals in declaration order.
    pub fn profile(&self) -> impl Iterator<Item = (AllocKind, u64)> + '_ {
        AllocKind::ALL.into_iter().zip(self.profile)
    }
}
