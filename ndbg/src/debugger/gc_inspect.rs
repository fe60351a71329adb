//! Heap and collector inspection: the `gc` command family.

use std::fs::File;
use std::rc::Rc;

use super::{say, Debugger};
use nula_rt::gc::{AllocEvent, Color, GcHeader, FIRST_GC_TAG, TYPE_NAMES};
use nula_rt::value::strprimitive;
use nula_rt::{Value, Vm};

const MARK_WHITE: u8 = 0;
const MARK_GRAY: u8 = 1;
const MARK_BLACK: u8 = 2;
const MARK_FIXED: u8 = 3;

#[derive(Default)]
struct ListFilter {
    type_tag: Option<u8>,
    mark: Option<u8>,
    memcat: Option<u8>,
}

impl ListFilter {
    fn matches(&self, header: &GcHeader) -> bool {
        if let Some(tag) = self.type_tag {
            if header.tag != tag {
                return false;
            }
        }
        if let Some(memcat) = self.memcat {
            if header.memcat != memcat {
                return false;
            }
        }
        match self.mark {
            Some(MARK_WHITE) => header.color == Color::White,
            Some(MARK_GRAY) => header.color == Color::Gray,
            Some(MARK_BLACK) => header.color == Color::Black,
            Some(MARK_FIXED) => header.fixed,
            _ => true,
        }
    }
}

impl Debugger {
    pub(crate) fn cmd_gc(&mut self, vm: &mut Vm, args: &[&str]) {
        match args.first().copied() {
            None => self.gc_summary(vm),
            Some("step") => self.gc_step(vm, args.get(1).copied()),
            Some("full") => {
                if vm.heap.threshold != usize::MAX {
                    vm.gc_full();
                }
            }
            Some("threshold") => self.gc_threshold(vm, args.get(1).copied()),
            Some("pause") => {
                if self.saved_threshold.is_some() {
                    say!(self, "GC is already paused");
                } else {
                    self.saved_threshold = Some(vm.heap.threshold);
                    vm.heap.threshold = usize::MAX;
                }
            }
            Some("resume") => match self.saved_threshold.take() {
                Some(threshold) => vm.heap.threshold = threshold,
                None => say!(self, "GC is not paused"),
            },
            Some("stats") => self.gc_stats(vm),
            Some("list") => self.gc_list(vm, &args[1..]),
            Some("trace") => self.gc_trace(vm),
            Some("dump") => self.gc_dump(vm),
            Some(_) => say!(self, "unknown subcommand"),
        }
    }

    fn gc_summary(&self, vm: &Vm) {
        let heap = &vm.heap;
        if heap.threshold == usize::MAX {
            say!(
                self,
                "GC is unavailable\ntotal bytes allocated: {}",
                heap.total_bytes
            );
        } else {
            say!(
                self,
                "GC state: {} (threshold: {} bytes)\ntotal bytes allocated: {}",
                heap.state.name(),
                heap.threshold,
                heap.total_bytes
            );
        }
        say!(
            self,
            "total GC objects allocated: {}\n  {} of them are dead",
            heap.live_objects(),
            heap.dead_objects()
        );
    }

    fn gc_step(&mut self, vm: &mut Vm, count: Option<&str>) {
        if !vm.heap.needs_gc() {
            say!(
                self,
                "can't step GC if totalbytes < GCthreshold; either change the threshold or run a full GC cycle"
            );
            return;
        }
        let count: u8 = match count {
            None => 1,
            Some(text) => match text.parse() {
                Ok(n) => n,
                Err(_) => {
                    say!(self, "count must be an integer");
                    return;
                }
            },
        };
        for _ in 0..count {
            vm.gc_step();
            if !vm.heap.needs_gc() {
                break;
            }
        }
    }

    fn gc_threshold(&mut self, vm: &mut Vm, value: Option<&str>) {
        let threshold: usize = match value.and_then(|v| v.parse().ok()) {
            Some(t) => t,
            None => {
                say!(self, "threshold must be an integer");
                return;
            }
        };
        vm.heap.threshold = threshold;
        self.saved_threshold = None;
    }

    fn gc_stats(&self, vm: &Vm) {
        let heap = &vm.heap;
        let (mut white, mut gray, mut black, mut fixed) = (0u32, 0u32, 0u32, 0u32);
        let mut total = 0u32;
        heap.visit(|_, header, _| {
            total += 1;
            match header.color {
                Color::White => white += 1,
                Color::Gray => gray += 1,
                Color::Black => black += 1,
            }
            if header.fixed {
                fixed += 1;
            }
        });
        say!(self, "total GC objects: {}", total);
        say!(self, "  {} of them are dead", heap.dead_objects());
        say!(self, "  {} of them are white", white);
        say!(self, "  {} of them are gray", gray);
        say!(self, "  {} of them are black", black);
        say!(self, "  {} of them are fixed", fixed);

        let stats = &heap.stats;
        say!(self, "heap goal size: {} bytes", stats.heap_goal_bytes);
        say!(
            self,
            "atomic start total size: {} bytes",
            stats.atomic_start_bytes
        );
        say!(self, "end total size: {} bytes", stats.end_bytes);
        say!(self, "trigger integral: {}", stats.trigger_integral);
        say!(self, "trigger term position: {}", stats.trigger_term_pos);

        if stats.start_timestamp > 0.0 {
            say!(self, "start timestamp: {:.6}", stats.start_timestamp);
            say!(self, "end timestamp: {:.6}", stats.end_timestamp);
            say!(
                self,
                "atomic start timestamp: {:.6}",
                stats.atomic_start_timestamp
            );
            if stats.end_timestamp > stats.start_timestamp {
                say!(
                    self,
                    "total GC cycle time: {:.6} seconds",
                    stats.end_timestamp - stats.start_timestamp
                );
            }
            if stats.atomic_start_timestamp > stats.start_timestamp {
                say!(
                    self,
                    "mark phase time: {:.6} seconds",
                    stats.atomic_start_timestamp - stats.start_timestamp
                );
            }
        }
    }

    fn gc_list(&mut self, vm: &Vm, args: &[&str]) {
        let mut filter = ListFilter::default();
        for arg in args {
            let Some((key, value)) = arg.split_once('=') else {
                continue;
            };
            match key {
                "type" => {
                    let Some(tag) = TYPE_NAMES.iter().position(|&n| n == value) else {
                        say!(self, "unknown type");
                        return;
                    };
                    if (tag as u8) < FIRST_GC_TAG {
                        say!(self, "type is not garbage collectable");
                        return;
                    }
                    filter.type_tag = Some(tag as u8);
                }
                "mark" => {
                    filter.mark = Some(match value {
                        "white" => MARK_WHITE,
                        "gray" => MARK_GRAY,
                        "black" => MARK_BLACK,
                        "fixed" => MARK_FIXED,
                        _ => {
                            say!(self, "invalid marked");
                            return;
                        }
                    });
                }
                "memcat" => match value.parse() {
                    Ok(m) => filter.memcat = Some(m),
                    Err(_) => {
                        say!(self, "memcat must be an integer");
                        return;
                    }
                },
                _ => {
                    say!(self, "unknown option");
                    return;
                }
            }
        }

        let mut count = 0u32;
        let heap = &vm.heap;
        heap.visit(|r, header, obj| {
            if !filter.matches(header) {
                return;
            }
            let display = match obj.tag() {
                t if t == nula_rt::gc::TAG_STRING => strprimitive(heap, Value::Str(r)),
                t if t == nula_rt::gc::TAG_FUNCTION => {
                    strprimitive(heap, Value::Function(r))
                }
                _ => String::new(),
            };
            say!(
                self,
                "  {} (address = 0x{:012x}, type={}, marked={}{}, memcat={})",
                display,
                heap.address(r),
                TYPE_NAMES[header.tag as usize],
                if header.fixed { "fixed " } else { "" },
                header.color.name(),
                header.memcat
            );
            count += 1;
        });
        say!(self, "\ntotal objects: {}", count);
    }

    /// Toggle the allocation-tracing trampoline: log every allocation,
    /// free and reallocation, then delegate to the callback that was
    /// installed before. Toggling off restores that exact callback.
    fn gc_trace(&mut self, vm: &mut Vm) {
        match self.saved_alloc.take() {
            Some(previous) => {
                vm.heap.set_allocator(previous);
                say!(self, "allocation tracing disabled");
            }
            None => {
                let previous = vm.heap.allocator();
                self.saved_alloc = Some(previous.clone());
                let out = self.out.clone();
                vm.heap.set_allocator(Rc::new(move |ev| {
                    {
                        use std::io::Write as _;
                        let mut out = out.borrow_mut();
                        let _ = match ev {
                            AllocEvent::Alloc { bytes } => {
                                writeln!(out, "[gc trace] allocation with size {}", bytes)
                            }
                            AllocEvent::Free { addr, .. } => {
                                writeln!(out, "[gc trace] deallocation of ptr 0x{:x}", addr)
                            }
                            AllocEvent::Realloc { addr, old, new } => writeln!(
                                out,
                                "[gc trace] reallocation of ptr 0x{:x}: {} -> {}",
                                addr, old, new
                            ),
                        };
                    }
                    previous(ev);
                }));
                say!(self, "allocation tracing enabled");
            }
        }
    }

    fn gc_dump(&self, vm: &Vm) {
        let file = match File::create("gcdump.json") {
            Ok(f) => f,
            Err(_) => {
                say!(self, "unable to open gcdump.json");
                return;
            }
        };
        match serde_json::to_writer_pretty(file, &vm.heap.dump()) {
            Ok(()) => say!(self, "heap dump written to gcdump.json"),
            Err(_) => say!(self, "unable to open gcdump.json"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
