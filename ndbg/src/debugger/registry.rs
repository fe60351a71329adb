use std::rc::Rc;

use nula_rt::ProtoRef;

/// Every prototype known to the debugger, in insertion order and with no
/// duplicates. Identity is pointer identity.
#[derive(Default)]
pub struct ProtoRegistry {
    protos: Vec<ProtoRef>,
}

impl ProtoRegistry {
    pub fn new() -> ProtoRegistry {
        ProtoRegistry { protos: Vec::new() }
    }

    pub fn contains(&self, p: &ProtoRef) -> bool {
        self.protos.iter().any(|q| Rc::ptr_eq(q, p))
    }

    /// Add one prototype if it is not already registered.
    pub fn push_unique(&mut self, p: ProtoRef) {
        if !self.contains(&p) {
            self.protos.push(p);
        }
    }

    /// Depth-first walk of a prototype tree, registering every prototype
    /// not yet present.
    pub fn collect(&mut self, root: &ProtoRef) {
        if self.contains(root) {
            return;
        }
        self.protos.push(root.clone());
        for child in &root.protos {
            self.collect(child);
        }
    }

    /// First registered prototype with the given debug name.
    pub fn lookup_by_name(&self, name: &str) -> Option<ProtoRef> {
        self.protos
            .iter()
            .find(|p| p.debugname.as_deref() == Some(name))
            .cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProtoRef> {
        self.protos.iter()
    }

    pub fn len(&self) -> usize {
        self.protos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.protos.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use nula_rt::Proto;
    use std::cell::RefCell;

    fn named_proto(name: Option<&str>, children: Vec<ProtoRef>) -> ProtoRef {
        Rc::new(Proto {
            code: RefCell::new(Vec::new()),
            k: Vec::new(),
            upvalues: Vec::new(),
            protos: children,
            source: "@registry.nula".to_string(),
            debugname: name.map(str::to_string),
            linedefined: 0,
            lineinfo: None,
            locvars: Vec::new(),
            maxstacksize: 0,
            numparams: 0,
            nups: 0,
            is_vararg: false,
            memcat: 0,
            debuginsn: RefCell::new(None),
        })
    }

    #[test]
    fn collect_walks_children_depth_first() {
        let leaf_a = named_proto(Some("a"), vec![]);
        let leaf_b = named_proto(Some("b"), vec![]);
        let mid = named_proto(Some("mid"), vec![leaf_a.clone(), leaf_b.clone()]);
        let root = named_proto(None, vec![mid.clone()]);

        let mut reg = ProtoRegistry::new();
        reg.collect(&root);

        let names: Vec<Option<&str>> =
            reg.iter().map(|p| p.debugname.as_deref()).collect();
        assert_eq!(names, vec![None, Some("mid"), Some("a"), Some("b")]);
    }

    #[test]
    fn collect_is_duplicate_free() {
        let shared = named_proto(Some("shared"), vec![]);
        let root = named_proto(None, vec![shared.clone(), shared.clone()]);

        let mut reg = ProtoRegistry::new();
        reg.collect(&root);
        reg.collect(&root);

        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn lookup_by_name_returns_first_match() {
        let first = named_proto(Some("dup"), vec![]);
        let second = named_proto(Some("dup"), vec![]);
        let mut reg = ProtoRegistry::new();
        reg.push_unique(first.clone());
        reg.push_unique(second);

        let found = reg.lookup_by_name("dup").expect("found");
        assert!(Rc::ptr_eq(&found, &first));
        assert!(reg.lookup_by_name("missing").is_none());
    }
}
