//! The nula dynamic-library loader: a 4-byte signature followed by a
//! bytecode blob. Named child prototypes become globals; a child named
//! `DllMain` is an entry point called with `(nil, DLL_PROCESS_ATTACH,
//! false)` and must return a truthy value.

use std::fs;

use super::{say, Debugger};
use nula_rt::gc::Closure;
use nula_rt::{Value, Vm};

/// `"nula"` as a little-endian 32-bit word.
pub const NULA_SIGNATURE: u32 = 0x616c_756e;

pub const DLL_PROCESS_ATTACH: f64 = 1.0;

impl Debugger {
    pub(crate) fn cmd_load(&mut self, vm: &mut Vm, path: Option<&str>) {
        let Some(path) = path else {
            say!(self, "usage: load <filename>");
            return;
        };
        let bytes = match fs::read(path) {
            Ok(b) => b,
            Err(_) => {
                say!(self, "unable to open file");
                return;
            }
        };
        self.load_nula(vm, path, &bytes);
    }

    /// Validate and load a nula image, bind its exports, run DllMain.
    pub fn load_nula(&mut self, vm: &mut Vm, path: &str, bytes: &[u8]) {
        if bytes.len() < 4
            || u32::from_le_bytes(bytes[..4].try_into().expect("4 bytes")) != NULA_SIGNATURE
        {
            say!(self, "not a nula library");
            return;
        }
        if bytes.len() - 4 <= 8 {
            say!(self, "file too small");
            return;
        }

        let chunkname = format!("@{}", path);
        let main = match vm.load_blob(&bytes[4..], &chunkname) {
            Ok(cl) => cl,
            Err(_) => {
                say!(self, "invalid or corrupted bytecode");
                return;
            }
        };
        let Some(proto) = vm.function_proto(main) else {
            say!(self, "invalid or corrupted bytecode");
            return;
        };

        let mut dll_main = None;
        for child in &proto.protos {
            let Some(name) = child.debugname.clone() else {
                continue;
            };
            let r = vm.heap.alloc_closure(
                Closure::Lua {
                    proto: child.clone(),
                    upvals: Vec::new(),
                },
                0,
            );
            if name == "DllMain" {
                dll_main = Some(Value::Function(r));
            } else {
                vm.globals.insert(name, Value::Function(r));
                self.registry.push_unique(child.clone());
            }
        }

        if let Some(entry) = dll_main {
            let args = [
                Value::Nil,
                Value::Number(DLL_PROCESS_ATTACH),
                Value::Boolean(false),
            ];
            let attached = match vm.pcall(entry, &args, 1) {
                Ok(results) => results.first().copied().unwrap_or(Value::Nil).is_truthy(),
                Err(_) => false,
            };
            if !attached {
                say!(self, "DLL_PROCESS_ATTACH routine has failed");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debugger::ReplInput;
    use nula_rt::compile::{compile, CompileOptions};
    use nula_rt::vm::OutSink;
    use std::cell::RefCell;
    use std::io::Cursor;
    use std::rc::Rc;

    fn debugger_with_capture() -> (Debugger, Rc<RefCell<Vec<u8>>>) {
        struct Capture(Rc<RefCell<Vec<u8>>>);
        impl std::io::Write for Capture {
            fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
                self.0.borrow_mut().extend_from_slice(data);
                Ok(data.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }
        let buf = Rc::new(RefCell::new(Vec::new()));
        let out: OutSink = Rc::new(RefCell::new(
            Box::new(Capture(buf.clone())) as Box<dyn std::io::Write>
        ));
        (
            Debugger::new(ReplInput::script(Cursor::new(Vec::new())), out),
            buf,
        )
    }

    fn text(buf: &Rc<RefCell<Vec<u8>>>) -> String {
        String::from_utf8(buf.borrow().clone()).unwrap()
    }

    fn nula_image(source: &str) -> Vec<u8> {
        let blob = compile(source, &CompileOptions::default()).expect("compile");
        let mut image = NULA_SIGNATURE.to_le_bytes().to_vec();
        image.extend_from_slice(&blob);
        image
    }

    #[test]
    fn rejects_bad_signature() {
        let (mut dbg, buf) = debugger_with_capture();
        let mut vm = Vm::new();
        dbg.load_nula(&mut vm, "lib.nula", b"\x00\x00\x00\x00longenoughpayload");
        assert!(text(&buf).contains("not a nula library"));
    }

    #[test]
    fn rejects_short_file() {
        let (mut dbg, buf) = debugger_with_capture();
        let mut vm = Vm::new();
        let mut image = NULA_SIGNATURE.to_le_bytes().to_vec();
        image.extend_from_slice(&[0u8; 8]);
        dbg.load_nula(&mut vm, "lib.nula", &image);
        assert!(text(&buf).contains("file too small"));
    }

    #[test]
    fn rejects_corrupt_bytecode() {
        let (mut dbg, buf) = debugger_with_capture();
        let mut vm = Vm::new();
        let mut image = NULA_SIGNATURE.to_le_bytes().to_vec();
        image.extend_from_slice(&[0xfe; 32]);
        dbg.load_nula(&mut vm, "lib.nula", &image);
        assert!(text(&buf).contains("invalid or corrupted bytecode"));
    }

    #[test]
    fn binds_exports_as_globals() {
        let (mut dbg, _) = debugger_with_capture();
        let mut vm = Vm::new();
        let image = nula_image(
            "function helper() return 5 end function extra() return 6 end",
        );
        dbg.load_nula(&mut vm, "lib.nula", &image);

        assert!(matches!(vm.globals.get("helper"), Some(Value::Function(_))));
        assert!(matches!(vm.globals.get("extra"), Some(Value::Function(_))));
        assert!(dbg.registry.lookup_by_name("helper").is_some());

        let f = *vm.globals.get("helper").unwrap();
        let results = vm.call(f, &[], -1).unwrap();
        assert_eq!(results, vec![Value::Number(5.0)]);
    }

    #[test]
    fn dll_main_is_invoked_not_exported() {
        let (mut dbg, buf) = debugger_with_capture();
        let mut vm = Vm::new();
        let image = nula_image(
            "function DllMain(inst, reason, reserved) attached = reason return true end",
        );
        dbg.load_nula(&mut vm, "lib.nula", &image);

        assert!(vm.globals.get("DllMain").is_none());
        assert_eq!(vm.globals.get("attached"), Some(&Value::Number(1.0)));
        assert!(!text(&buf).contains("failed"));
    }

    #[test]
    fn failing_dll_main_is_reported() {
        let (mut dbg, buf) = debugger_with_capture();
        let mut vm = Vm::new();
        let image = nula_image("function DllMain(inst, reason, reserved) return false end");
        dbg.load_nula(&mut vm, "lib.nula", &image);
        assert!(text(&buf).contains("DLL_PROCESS_ATTACH routine has failed"));
    }
}
