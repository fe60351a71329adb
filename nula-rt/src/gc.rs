//! Heap bookkeeping for collectable objects.
//!
//! Every string, table, closure and prototype is registered here with a
//! header carrying its tri-color mark, memory category and size. The
//! collector itself is a plain mark/sweep run in bounded steps; what the
//! debugger needs from it is accurate accounting (object counts, colors,
//! byte totals, cycle statistics), a replaceable allocation callback and a
//! JSON heap dump.

use std::collections::HashMap;
use std::rc::Rc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::proto::ProtoRef;
use crate::value::{GcRef, Value};
use crate::vm::NativeFn;

/// Type tags, indexable by the names users pass to `gc list type=...`.
pub const TYPE_NAMES: &[&str] = &[
    "nil", "boolean", "number", "string", "table", "function", "proto",
];

pub const TAG_STRING: u8 = 3;
pub const TAG_TABLE: u8 = 4;
pub const TAG_FUNCTION: u8 = 5;
pub const TAG_PROTO: u8 = 6;

/// Tags below this are inline values and never hit the heap.
pub const FIRST_GC_TAG: u8 = TAG_STRING;

// ---------------------------------------------------------------------------
// Objects
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct Table {
    pub arr: Vec<Value>,
    pub hash: Vec<(Value, Value)>,
}

impl Table {
    pub fn get(&self, key: Value) -> Value {
        if let Value::Number(n) = key {
            let idx = n as usize;
            if n == idx as f64 && idx >= 1 && idx <= self.arr.len() {
                return self.arr[idx - 1];
            }
        }
        self.hash
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| *v)
            .unwrap_or(Value::Nil)
    }

    pub fn set(&mut self, key: Value, value: Value) {
        if let Value::Number(n) = key {
            let idx = n as usize;
            if n == idx as f64 && idx >= 1 && idx <= self.arr.len() + 1 {
                if idx == self.arr.len() + 1 {
                    self.arr.push(value);
                } else {
                    self.arr[idx - 1] = value;
                }
                return;
            }
        }
        if let Some(slot) = self.hash.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else {
            self.hash.push((key, value));
        }
    }

    pub fn length(&self) -> usize {
        self.arr.len()
    }
}

pub enum Closure {
    Lua { proto: ProtoRef, upvals: Vec<Value> },
    Native { name: &'static str, func: NativeFn },
}

impl Closure {
    pub fn debug_name(&self) -> Option<&str> {
        match self {
            Closure::Lua { proto, .. } => proto.debugname.as_deref(),
            Closure::Native { name, .. } => Some(name),
        }
    }

    pub fn proto(&self) -> Option<&ProtoRef> {
        match self {
            Closure::Lua { proto, .. } => Some(proto),
            Closure::Native { .. } => None,
        }
    }
}

pub enum GcObject {
    Str(Box<str>),
    Table(Table),
    Function(Closure),
    Proto(ProtoRef),
}

impl GcObject {
    pub fn tag(&self) -> u8 {
        match self {
            GcObject::Str(_) => TAG_STRING,
            GcObject::Table(_) => TAG_TABLE,
            GcObject::Function(_) => TAG_FUNCTION,
            GcObject::Proto(_) => TAG_PROTO,
        }
    }

    fn size_bytes(&self) -> usize {
        match self {
            GcObject::Str(s) => 17 + s.len(),
            GcObject::Table(t) => 48 + t.arr.len() * 16 + t.hash.len() * 32,
            GcObject::Function(Closure::Lua { upvals, .. }) => 32 + upvals.len() * 16,
            GcObject::Function(Closure::Native { .. }) => 32,
            GcObject::Proto(p) => {
                64 + p.sizecode() * 4 + p.k.len() * 16 + p.locvars.len() * 24
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Headers and collector state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Color {
    White,
    Gray,
    Black,
}

impl Color {
    pub fn name(self) -> &'static str {
        match self {
            Color::White => "white",
            Color::Gray => "gray",
            Color::Black => "black",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct GcHeader {
    pub tag: u8,
    pub color: Color,
    pub fixed: bool,
    pub memcat: u8,
    pub bytes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcState {
    Pause,
    Mark,
    Atomic,
    Sweep,
}

impl GcState {
    pub fn name(self) -> &'static str {
        match self {
            GcState::Pause => "pause",
            GcState::Mark => "mark",
            GcState::Atomic => "atomic",
            GcState::Sweep => "sweep",
        }
    }
}

/// Statistics from the most recent collection cycle.
#[derive(Debug, Clone, Copy, Default)]
pub struct GcStats {
    pub heap_goal_bytes: usize,
    pub atomic_start_bytes: usize,
    pub end_bytes: usize,
    pub trigger_integral: i32,
    pub trigger_term_pos: u32,
    pub start_timestamp: f64,
    pub atomic_start_timestamp: f64,
    pub end_timestamp: f64,
}

// ---------------------------------------------------------------------------
// Allocation callback
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub enum AllocEvent {
    Alloc { bytes: usize },
    Free { addr: u64, bytes: usize },
    Realloc { addr: u64, old: usize, new: usize },
}

/// Replaceable allocation callback. Every allocation, free and table
/// reallocation flows through the installed callback; a tracer wraps the
/// previous one and delegates, and toggling it off must restore that exact
/// previous callback.
pub type AllocCb = Rc<dyn Fn(&AllocEvent)>;

// ---------------------------------------------------------------------------
// Heap
// ---------------------------------------------------------------------------

struct Slot {
    header: GcHeader,
    obj: Option<GcObject>,
}

pub struct Heap {
    slots: Vec<Slot>,
    interned: HashMap<Box<str>, GcRef>,
    pub total_bytes: usize,
    pub threshold: usize,
    pub state: GcState,
    pub stats: GcStats,
    alloc_cb: AllocCb,
    gray: Vec<GcRef>,
    sweep_cursor: usize,
}

/// How many objects a single mark or sweep step processes.
const STEP_BUDGET: usize = 64;

const DEFAULT_THRESHOLD: usize = 1024 * 1024;

fn now_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

impl Default for Heap {
    fn default() -> Self {
        Heap::new()
    }
}

impl Heap {
    pub fn new() -> Heap {
        Heap {
            slots: Vec::new(),
            interned: HashMap::new(),
            total_bytes: 0,
            threshold: DEFAULT_THRESHOLD,
            state: GcState::Pause,
            stats: GcStats::default(),
            alloc_cb: Rc::new(|_| {}),
            gray: Vec::new(),
            sweep_cursor: 0,
        }
    }

    // -- Allocation --

    fn push(&mut self, obj: GcObject, memcat: u8, fixed: bool) -> GcRef {
        let bytes = obj.size_bytes();
        self.total_bytes += bytes;
        (self.alloc_cb)(&AllocEvent::Alloc { bytes });
        let header = GcHeader {
            tag: obj.tag(),
            color: Color::White,
            fixed,
            memcat,
            bytes,
        };
        self.slots.push(Slot {
            header,
            obj: Some(obj),
        });
        (self.slots.len() - 1) as GcRef
    }

    /// Allocate (or reuse) an interned string.
    pub fn alloc_str(&mut self, s: &str, memcat: u8) -> GcRef {
        if let Some(&r) = self.interned.get(s) {
            return r;
        }
        let r = self.push(GcObject::Str(s.into()), memcat, false);
        self.interned.insert(s.into(), r);
        r
    }

    /// Interned string that the collector will never free (constant pools,
    /// global names).
    pub fn alloc_str_fixed(&mut self, s: &str, memcat: u8) -> GcRef {
        let r = self.alloc_str(s, memcat);
        self.slots[r as usize].header.fixed = true;
        r
    }

    pub fn alloc_table(&mut self, memcat: u8) -> GcRef {
        self.push(GcObject::Table(Table::default()), memcat, false)
    }

    pub fn alloc_closure(&mut self, cl: Closure, memcat: u8) -> GcRef {
        self.push(GcObject::Function(cl), memcat, false)
    }

    /// Prototypes are owned by the VM for its whole lifetime; they are
    /// registered fixed so the accounting sees them without ever sweeping.
    pub fn register_proto(&mut self, p: ProtoRef, memcat: u8) -> GcRef {
        self.push(GcObject::Proto(p), memcat, true)
    }

    // -- Access --

    pub fn get(&self, r: GcRef) -> Option<&GcObject> {
        self.slots.get(r as usize).and_then(|s| s.obj.as_ref())
    }

    pub fn get_mut(&mut self, r: GcRef) -> Option<&mut GcObject> {
        self.slots.get_mut(r as usize).and_then(|s| s.obj.as_mut())
    }

    pub fn header(&self, r: GcRef) -> Option<&GcHeader> {
        self.slots.get(r as usize).map(|s| &s.header)
    }

    pub fn get_str(&self, r: GcRef) -> Option<&str> {
        match self.get(r)? {
            GcObject::Str(s) => Some(s),
            _ => None,
        }
    }

    /// A stable display address for an object.
    pub fn address(&self, r: GcRef) -> u64 {
        0x5a00_0000_0000 + (r as u64) * 0x40
    }

    /// Write into a table, reporting backing growth through the allocation
    /// callback as a reallocation.
    pub fn table_set(&mut self, r: GcRef, key: Value, value: Value) {
        let addr = self.address(r);
        let Some(slot) = self.slots.get_mut(r as usize) else {
            return;
        };
        let Some(GcObject::Table(t)) = slot.obj.as_mut() else {
            return;
        };
        let old = slot.header.bytes;
        t.set(key, value);
        let new = 48 + t.arr.len() * 16 + t.hash.len() * 32;
        if new != old {
            slot.header.bytes = new;
            self.total_bytes = self.total_bytes + new - old;
            (self.alloc_cb)(&AllocEvent::Realloc { addr, old, new });
        }
    }

    /// Visit every live collectable object.
    pub fn visit(&self, mut f: impl FnMut(GcRef, &GcHeader, &GcObject)) {
        for (i, slot) in self.slots.iter().enumerate() {
            if let Some(obj) = &slot.obj {
                f(i as GcRef, &slot.header, obj);
            }
        }
    }

    pub fn live_objects(&self) -> usize {
        self.slots.iter().filter(|s| s.obj.is_some()).count()
    }

    /// Objects already condemned by the current cycle (white after the
    /// atomic step, waiting for the sweep to reach them).
    pub fn dead_objects(&self) -> usize {
        if self.state != GcState::Sweep {
            return 0;
        }
        self.slots
            .iter()
            .filter(|s| {
                s.obj.is_some() && !s.header.fixed && s.header.color == Color::White
            })
            .count()
    }

    // -- Allocation callback --

    pub fn allocator(&self) -> AllocCb {
        self.alloc_cb.clone()
    }

    pub fn set_allocator(&mut self, cb: AllocCb) {
        self.alloc_cb = cb;
    }

    // -- Collection --

    pub fn needs_gc(&self) -> bool {
        self.total_bytes >= self.threshold
    }

    fn mark_value(&mut self, v: Value) {
        if let Some(r) = v.gc_ref() {
            self.mark_ref(r);
        }
    }

    fn mark_ref(&mut self, r: GcRef) {
        if let Some(slot) = self.slots.get_mut(r as usize) {
            if slot.obj.is_some() && slot.header.color == Color::White {
                slot.header.color = Color::Gray;
                self.gray.push(r);
            }
        }
    }

    fn blacken(&mut self, r: GcRef) {
        let children: Vec<Value> = match self.slots[r as usize].obj.as_ref() {
            Some(GcObject::Table(t)) => t
                .arr
                .iter()
                .copied()
                .chain(t.hash.iter().flat_map(|(k, v)| [*k, *v]))
                .collect(),
            Some(GcObject::Function(Closure::Lua { upvals, proto })) => upvals
                .iter()
                .copied()
                .chain(proto.k.iter().copied())
                .collect(),
            Some(GcObject::Proto(p)) => p.k.clone(),
            _ => Vec::new(),
        };
        self.slots[r as usize].header.color = Color::Black;
        for child in children {
            self.mark_value(child);
        }
    }

    /// Run one bounded collection step against the given root set.
    pub fn step(&mut self, roots: &[Value]) {
        match self.state {
            GcState::Pause => {
                self.stats.start_timestamp = now_seconds();
                for slot in &mut self.slots {
                    if slot.obj.is_some() && !slot.header.fixed {
                        slot.header.color = Color::White;
                    }
                }
                // Fixed objects are marked up front so a sweep never sees
                // them white.
                let fixed: Vec<GcRef> = self
                    .slots
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| s.obj.is_some() && s.header.fixed)
                    .map(|(i, _)| i as GcRef)
                    .collect();
                for r in fixed {
                    self.slots[r as usize].header.color = Color::Gray;
                    self.gray.push(r);
                }
                for &root in roots {
                    self.mark_value(root);
                }
                self.state = GcState::Mark;
            }
            GcState::Mark => {
                for _ in 0..STEP_BUDGET {
                    match self.gray.pop() {
                        Some(r) => self.blacken(r),
                        None => {
                            self.state = GcState::Atomic;
                            break;
                        }
                    }
                }
            }
            GcState::Atomic => {
                // Re-mark the roots: the mutator may have created objects
                // since the cycle started.
                for &root in roots {
                    self.mark_value(root);
                }
                while let Some(r) = self.gray.pop() {
                    self.blacken(r);
                }
                self.stats.atomic_start_timestamp = now_seconds();
                self.stats.atomic_start_bytes = self.total_bytes;
                self.sweep_cursor = 0;
                self.state = GcState::Sweep;
            }
            GcState::Sweep => {
                let mut processed = 0;
                while self.sweep_cursor < self.slots.len() && processed < STEP_BUDGET {
                    let i = self.sweep_cursor;
                    self.sweep_cursor += 1;
                    processed += 1;
                    let slot = &mut self.slots[i];
                    if slot.obj.is_none() || slot.header.fixed {
                        continue;
                    }
                    if slot.header.color == Color::White {
                        let bytes = slot.header.bytes;
                        let freed = slot.obj.take();
                        self.total_bytes -= bytes;
                        if let Some(GcObject::Str(s)) = &freed {
                            self.interned.remove(s.as_ref());
                        }
                        let addr = self.address(i as GcRef);
                        (self.alloc_cb)(&AllocEvent::Free { addr, bytes });
                    }
                }
                if self.sweep_cursor >= self.slots.len() {
                    self.stats.end_timestamp = now_seconds();
                    self.stats.end_bytes = self.total_bytes;
                    self.stats.heap_goal_bytes = self.total_bytes * 2;
                    self.state = GcState::Pause;
                }
            }
        }
    }

    /// Run a full cycle to completion.
    pub fn full(&mut self, roots: &[Value]) {
        if self.state != GcState::Pause {
            // Finish the in-flight cycle first.
            while self.state != GcState::Pause {
                self.step(roots);
            }
        }
        self.step(roots);
        while self.state != GcState::Pause {
            self.step(roots);
        }
    }

    // -- Dump --

    pub fn dump(&self) -> HeapDump {
        let mut objects = Vec::new();
        self.visit(|r, header, _| {
            objects.push(DumpObject {
                address: format!("0x{:012x}", self.address(r)),
                type_name: TYPE_NAMES[header.tag as usize],
                color: header.color.name(),
                fixed: header.fixed,
                memcat: header.memcat,
                bytes: header.bytes,
            });
        });
        HeapDump {
            total_bytes: self.total_bytes,
            threshold: self.threshold,
            state: self.state.name(),
            object_count: objects.len(),
            objects,
        }
    }
}

#[derive(Serialize)]
pub struct DumpObject {
    pub address: String,
    #[serde(rename = "type")]
    pub type_name: &'static str,
    pub color: &'static str,
    pub fixed: bool,
    pub memcat: u8,
    pub bytes: usize,
}

#[derive(Serialize)]
pub struct HeapDump {
    pub total_bytes: usize,
    pub threshold: usize,
    pub state: &'static str,
    pub object_count: usize,
    pub objects: Vec<DumpObject>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn intern_reuses_strings() {
        let mut heap = Heap::new();
        let a = heap.alloc_str("hello", 0);
        let b = heap.alloc_str("hello", 0);
        let c = heap.alloc_str("world", 0);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(heap.live_objects(), 2);
    }

    #[test]
    fn full_gc_frees_unreachable() {
        let mut heap = Heap::new();
        let kept = heap.alloc_str("kept", 0);
        let _dropped = heap.alloc_str("dropped", 0);
        let before = heap.total_bytes;

        heap.full(&[Value::Str(kept)]);

        assert_eq!(heap.live_objects(), 1);
        assert!(heap.total_bytes < before);
        assert!(heap.get_str(kept).is_some());
    }

    #[test]
    fn fixed_objects_survive_without_roots() {
        let mut heap = Heap::new();
        let s = heap.alloc_str_fixed("constant", 0);
        heap.full(&[]);
        assert_eq!(heap.get_str(s), Some("constant"));
    }

    #[test]
    fn tables_keep_their_entries_alive() {
        let mut heap = Heap::new();
        let t = heap.alloc_table(0);
        let k = heap.alloc_str("key", 0);
        let v = heap.alloc_str("value", 0);
        heap.table_set(t, Value::Str(k), Value::Str(v));

        heap.full(&[Value::Table(t)]);

        assert_eq!(heap.get_str(k), Some("key"));
        assert_eq!(heap.get_str(v), Some("value"));
    }

    #[test]
    fn alloc_callback_sees_alloc_and_free() {
        let events: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));
        let log = events.clone();
        let mut heap = Heap::new();
        heap.set_allocator(Rc::new(move |ev| {
            log.borrow_mut().push(match ev {
                AllocEvent::Alloc { .. } => "alloc",
                AllocEvent::Free { .. } => "free",
                AllocEvent::Realloc { .. } => "realloc",
            });
        }));

        let _garbage = heap.alloc_str("garbage", 0);
        heap.full(&[]);

        let seen = events.borrow();
        assert!(seen.contains(&"alloc"));
        assert!(seen.contains(&"free"));
    }

    #[test]
    fn table_growth_reports_realloc() {
        let events: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));
        let log = events.clone();
        let mut heap = Heap::new();
        let t = heap.alloc_table(0);
        heap.set_allocator(Rc::new(move |ev| {
            if matches!(ev, AllocEvent::Realloc { .. }) {
                log.borrow_mut().push("realloc");
            }
        }));
        heap.table_set(t, Value::Number(1.0), Value::Boolean(true));
        assert_eq!(events.borrow().len(), 1);
    }

    #[test]
    fn step_walks_the_cycle_states() {
        let mut heap = Heap::new();
        for i in 0..200 {
            heap.alloc_str(&format!("s{}", i), 0);
        }
        assert_eq!(heap.state, GcState::Pause);
        heap.step(&[]);
        assert_eq!(heap.state, GcState::Mark);
        while heap.state != GcState::Pause {
            heap.step(&[]);
        }
        // Nothing was rooted, everything non-fixed is gone.
        assert_eq!(heap.live_objects(), 0);
    }

    #[test]
    fn dead_count_is_nonzero_mid_sweep() {
        let mut heap = Heap::new();
        for i in 0..200 {
            heap.alloc_str(&format!("s{}", i), 0);
        }
        // Drive to the sweep phase, then stop before it finishes.
        heap.step(&[]);
        while heap.state != GcState::Sweep {
            heap.step(&[]);
        }
        assert!(heap.dead_objects() > 0);
    }
}
