//! Directory-entry tree. Stored as an arena rather than a pointer tree so
//! the root's self-parent (spec §9, "Self-referential root") is just
//! `parent == None`, and so the metadata writer's two-pass offset
//! assignment (spec §4.8) can walk it without fighting the borrow checker.

use crate::inode::InodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DentryId(pub usize);

#[derive(Debug, Clone, Copy, Default)]
pub struct DentryFlags {
    pub is_win32_name: bool,
}

#[derive(Debug, Clone)]
pub struct Dentry {
    pub short_name: String,
    pub long_name: String,
    pub inode: InodeId,
    pub parent: Option<DentryId>,
    pub children: Vec<DentryId>,
    pub flags: DentryFlags,
}

impl Dentry {
    pub fn new(long_name: String, inode: InodeId) -> Self {
        Dentry {
            short_name: String::new(),
            long_name,
            inode,
            parent: None,
            children: Vec::new(),
            flags: DentryFlags::default(),
        }
    }
}

/// Owns every dentry in the tree. A directory's `children` is an ordered
/// set in NTFS readdir order; nothing here reorders it.
#[derive(Default)]
pub struct DentryArena {
    nodes: Vec<Dentry>,
    root: Option<DentryId>,
}

impl DentryArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, dentry: Dentry) -> DentryId {
        let id = DentryId(self.nodes.len());
        self.nodes.push(dentry);
        id
    }

    pub fn get(&self, id: DentryId) -> &Dentry {
        &self.nodes[id.0]
    }

    pub fn get_mut(&mut self, id: DentryId) -> &mut Dentry {
        &mut self.nodes[id.0]
    }

    pub fn attach_child(&mut self, parent: DentryId, child: DentryId) {
        self.nodes[child.0].parent = Some(parent);
        self.nodes[parent.0].children.push(child);
    }

    pub fn set_root(&mut self, id: DentryId) {
        self.nodes[id.0].parent = None;
        self.root = Some(id);
    }

    pub fn root(&self) -> Option<DentryId> {
        self.root
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inode::InodeId;

    #[test]
    fn alloc_attach_and_root() {
        let mut arena = DentryArena::new();
        assert!(arena.is_empty());

        let root = arena.alloc(Dentry::new("".into(), InodeId(0)));
        arena.set_root(root);
        let child = arena.alloc(Dentry::new("child".into(), InodeId(1)));
        arena.attach_child(root, child);

        assert_eq!(arena.len(), 2);
        assert!(!arena.is_empty());
        assert_eq!(arena.root(), Some(root));
        assert_eq!(arena.get(root).children, vec![child]);
        assert_eq!(arena.get(child).parent, Some(root));
    }

    #[test]
    fn set_root_clears_parent() {
        let mut arena = DentryArena::new();
        let parent = arena.alloc(Dentry::new("p".into(), InodeId(0)));
        let root = arena.alloc(Dentry::new("".into(), InodeId(1)));
        arena.attach_child(parent, root);
        assert_eq!(arena.get(root).parent, Some(parent));

        arena.set_root(root);
        assert_eq!(arena.get(root).parent, None);
    }
}
