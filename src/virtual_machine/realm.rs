//! Per-transaction ownership bookkeeping for one persistence domain.
//!
//! Writes into real objects report `(parent, old child, new child)` through
//! [`Realm::did_update`], which only marks objects. Reference counts of
//! objects reachable from newly created or deleted ones are settled in
//! [`Realm::finalize`], which then assigns ids, hashes the dirty part of the
//! tree bottom-up and writes it to the store.

use crate::info;
use crate::types::encoding::Encode;
use crate::virtual_machine::errors::MachineError;
use crate::virtual_machine::heap::Heap;
use crate::virtual_machine::image::{ImageWriter, object_hash};
use crate::virtual_machine::ownership::{InfoImage, ObjectId, PkgId};
use crate::virtual_machine::store::{ObjectRecord, RealmRecord, Store, TypeRecord};
use crate::virtual_machine::type_system::{Name, Type, TypeId};
use crate::virtual_machine::values::ObjRef;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

const REALM_PATH_PREFIX: &str = "gno.land/r/";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RealmOpKind {
    Created,
    Updated,
    Deleted,
}

/// One store write performed by a finalization.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RealmOp {
    pub kind: RealmOpKind,
    pub id: ObjectId,
}

impl fmt::Display for RealmOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.kind {
            RealmOpKind::Created => 'c',
            RealmOpKind::Updated => 'u',
            RealmOpKind::Deleted => 'd',
        };
        write!(f, "{}[{}]", tag, self.id)
    }
}

/// Counts reported by one finalization.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FinalizeSummary {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub escaped: usize,
}

#[derive(Debug)]
pub struct Realm {
    pub id: PkgId,
    pub path: Name,
    /// Last ordinal handed out.
    pub time: u64,
    committed_time: u64,

    new_created: Vec<ObjRef>,
    new_deleted: Vec<ObjRef>,
    new_escaped: Vec<ObjRef>,
    created: Vec<ObjRef>,
    updated: Vec<ObjRef>,
    deleted: Vec<ObjRef>,
    escaped: Vec<ObjRef>,

    ops: Option<Vec<RealmOp>>,
}

impl Realm {
    pub fn new(path: &str) -> Self {
        Realm {
            id: PkgId::from_path(path),
            path: Rc::from(path),
            time: 0,
            committed_time: 0,
            new_created: Vec::new(),
            new_deleted: Vec::new(),
            new_escaped: Vec::new(),
            created: Vec::new(),
            updated: Vec::new(),
            deleted: Vec::new(),
            escaped: Vec::new(),
            ops: None,
        }
    }

    pub fn from_record(record: &RealmRecord) -> Self {
        let mut realm = Realm::new(&record.path);
        realm.time = record.time;
        realm.committed_time = record.time;
        realm
    }

    pub fn record(&self) -> RealmRecord {
        RealmRecord {
            path: self.path.clone(),
            id: self.id,
            time: self.time,
        }
    }

    /// Packages under the realm prefix keep persistent state.
    pub fn is_realm_path(path: &str) -> bool {
        path.starts_with(REALM_PATH_PREFIX)
    }

    pub fn set_log_ops(&mut self, enabled: bool) {
        self.ops = enabled.then(Vec::new);
    }

    pub fn ops(&self) -> &[RealmOp] {
        self.ops.as_deref().unwrap_or(&[])
    }

    /// Logged ops, one per line.
    pub fn sprint_ops(&self) -> String {
        self.ops()
            .iter()
            .map(|op| op.to_string())
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn log_op(&mut self, kind: RealmOpKind, id: ObjectId) {
        if let Some(ops) = &mut self.ops {
            ops.push(RealmOp { kind, id });
        }
    }

    fn next_id(&mut self) -> ObjectId {
        self.time += 1;
        ObjectId {
            pkg: self.id,
            time: self.time,
        }
    }

    /// Makes a freshly declared package block the root of this realm. It is
    /// created with the first id so the package record can point at it
    /// before any finalization.
    pub fn assign_root(&mut self, heap: &mut Heap, block: ObjRef) -> ObjectId {
        let id = self.next_id();
        let info = heap.info_mut(block);
        info.id = Some(id);
        info.ref_count = 1;
        info.is_new_real = true;
        heap.register(id, block);
        self.created.push(block);
        id
    }

    /// Records that `po`'s slot changed from `xo` to `co`. Any of them may be
    /// absent; nothing happens unless `po` is already real.
    pub fn did_update(
        &mut self,
        heap: &mut Heap,
        po: Option<ObjRef>,
        xo: Option<ObjRef>,
        co: Option<ObjRef>,
    ) -> Result<(), MachineError> {
        let Some(po) = po else {
            return Ok(());
        };
        let Some(pid) = heap.info(po).id else {
            return Ok(());
        };
        if pid.pkg != self.id {
            return Err(MachineError::CrossRealmWrite(pid));
        }
        self.mark_dirty(heap, po);

        if let Some(co) = co.filter(|c| *c != po) {
            let info = heap.info_mut(co);
            info.ref_count += 1;
            info.is_deleted = false;
            let rc = info.ref_count;
            if rc > 1 && !info.is_escaped {
                self.mark_new_escaped(heap, co);
            }
            if heap.info(co).is_real() {
                // re-attached after being dropped elsewhere
                let old = heap.info(co).owner;
                if rc == 1 && old != Some(po) {
                    heap.info_mut(co).owner = Some(po);
                    if let Some(old) = old.filter(|o| heap.info(*o).is_real()) {
                        self.mark_dirty(heap, old);
                    }
                }
                self.mark_dirty(heap, co);
            } else {
                heap.info_mut(co).owner = Some(po);
                self.mark_new_real(heap, co);
            }
        }

        if let Some(xo) = xo.filter(|x| *x != po) {
            let info = heap.info_mut(xo);
            info.ref_count = info.ref_count.saturating_sub(1);
            if info.ref_count == 0 {
                if info.is_real() {
                    self.mark_new_deleted(heap, xo);
                }
            } else if info.is_real() {
                self.mark_dirty(heap, xo);
            }
        }
        Ok(())
    }

    pub fn mark_new_real(&mut self, heap: &mut Heap, r: ObjRef) {
        let info = heap.info_mut(r);
        if info.is_new_real {
            return;
        }
        info.is_new_real = true;
        self.new_created.push(r);
    }

    /// Idempotent. New-real objects are saved anyway and are left alone.
    pub fn mark_dirty(&mut self, heap: &mut Heap, r: ObjRef) {
        let time = self.time;
        let info = heap.info_mut(r);
        if info.is_dirty || info.is_new_real {
            return;
        }
        info.is_dirty = true;
        info.mod_time = time;
        self.updated.push(r);
    }

    pub fn mark_new_deleted(&mut self, heap: &mut Heap, r: ObjRef) {
        let info = heap.info_mut(r);
        if info.is_new_deleted {
            return;
        }
        info.is_new_deleted = true;
        self.new_deleted.push(r);
    }

    pub fn mark_new_escaped(&mut self, heap: &mut Heap, r: ObjRef) {
        let info = heap.info_mut(r);
        if info.is_new_escaped {
            return;
        }
        info.is_new_escaped = true;
        self.new_escaped.push(r);
    }

    pub fn has_marks(&self) -> bool {
        !(self.new_created.is_empty()
            && self.new_deleted.is_empty()
            && self.new_escaped.is_empty()
            && self.created.is_empty()
            && self.updated.is_empty())
    }

    /// Settles the transaction and persists its effects.
    pub fn finalize(
        &mut self,
        heap: &mut Heap,
        store: &mut dyn Store,
    ) -> Result<FinalizeSummary, MachineError> {
        self.process_new_created(heap);
        self.process_new_deleted(heap);
        self.process_new_escaped(heap);
        self.mark_dirty_ancestors(heap);

        let summary = self.save_unsaved(heap, store)?;
        for r in std::mem::take(&mut self.deleted) {
            if let Some(id) = heap.info(r).id {
                store.del_object(&id);
                self.log_op(RealmOpKind::Deleted, id);
            }
        }
        store.set_realm(self.record());
        self.committed_time = self.time;
        self.clear_marks(heap);

        info!(
            "finalized realm {}: {} created, {} updated, {} deleted, {} escaped",
            self.path, summary.created, summary.updated, summary.deleted, summary.escaped
        );
        Ok(summary)
    }

    /// Drops the transaction's marks without persisting anything.
    pub fn discard(&mut self, heap: &mut Heap) {
        self.time = self.committed_time;
        self.clear_marks(heap);
    }

    fn clear_marks(&mut self, heap: &mut Heap) {
        let lists = [
            std::mem::take(&mut self.new_created),
            std::mem::take(&mut self.new_deleted),
            std::mem::take(&mut self.new_escaped),
            std::mem::take(&mut self.created),
            std::mem::take(&mut self.updated),
            std::mem::take(&mut self.deleted),
            std::mem::take(&mut self.escaped),
        ];
        for r in lists.into_iter().flatten() {
            heap.info_mut(r).clear_marks();
        }
    }

    fn process_new_created(&mut self, heap: &mut Heap) {
        let mut i = 0;
        while i < self.new_created.len() {
            let r = self.new_created[i];
            i += 1;
            if heap.info(r).ref_count > 0 {
                self.inc_ref_created_descendants(heap, r);
            }
        }
    }

    /// `r` is new-real with its own count already taken. Assigns it an id
    /// and counts the references it holds.
    fn inc_ref_created_descendants(&mut self, heap: &mut Heap, r: ObjRef) {
        if heap.info(r).is_real() {
            return;
        }
        let id = self.next_id();
        heap.info_mut(r).id = Some(id);
        heap.register(id, r);
        self.created.push(r);

        for child in heap.children(r) {
            let info = heap.info_mut(child);
            info.ref_count += 1;
            let rc = info.ref_count;
            if rc == 1 {
                info.owner = Some(r);
                if info.is_real() {
                    info.is_deleted = false;
                    self.mark_dirty(heap, child);
                } else {
                    info.is_new_real = true;
                    self.inc_ref_created_descendants(heap, child);
                }
            } else {
                self.mark_dirty(heap, child);
                if !heap.info(child).is_escaped {
                    self.mark_new_escaped(heap, child);
                }
            }
        }
    }

    fn process_new_deleted(&mut self, heap: &mut Heap) {
        for r in std::mem::take(&mut self.new_deleted) {
            if heap.info(r).ref_count > 0 {
                heap.info_mut(r).is_new_deleted = false;
            } else {
                self.dec_ref_deleted_descendants(heap, r);
            }
        }
    }

    fn dec_ref_deleted_descendants(&mut self, heap: &mut Heap, r: ObjRef) {
        let info = heap.info_mut(r);
        if info.is_deleted || !info.is_real() {
            return;
        }
        info.is_new_deleted = false;
        info.is_new_real = false;
        info.is_new_escaped = false;
        info.is_deleted = true;
        self.deleted.push(r);

        for child in heap.children(r) {
            let info = heap.info_mut(child);
            info.ref_count = info.ref_count.saturating_sub(1);
            if info.ref_count == 0 {
                self.dec_ref_deleted_descendants(heap, child);
            } else if info.is_real() {
                self.mark_dirty(heap, child);
            }
        }
    }

    /// Objects still referenced more than once become escaped and lose
    /// their owner; the rest are demoted.
    fn process_new_escaped(&mut self, heap: &mut Heap) {
        let mut i = 0;
        while i < self.new_escaped.len() {
            let r = self.new_escaped[i];
            i += 1;
            if heap.info(r).ref_count <= 1 {
                heap.info_mut(r).is_new_escaped = false;
                continue;
            }
            self.escaped.push(r);
            let Some(po) = heap.info(r).owner else {
                continue;
            };
            let pinfo = heap.info(po);
            if pinfo.ref_count > 0 && !pinfo.is_new_real && pinfo.is_real() {
                self.mark_dirty(heap, po);
            }
            if !heap.info(r).is_real() {
                heap.info_mut(r).is_new_real = true;
                self.inc_ref_created_descendants(heap, r);
            }
            heap.info_mut(r).owner = None;
        }
    }

    fn mark_dirty_ancestors(&mut self, heap: &mut Heap) {
        let roots: Vec<ObjRef> = self.updated.iter().chain(self.created.iter()).copied().collect();
        for mut cur in roots {
            if heap.info(cur).is_deleted {
                continue;
            }
            loop {
                let info = heap.info(cur);
                if info.ref_count > 1 || heap.is_package_block(cur) {
                    break;
                }
                let Some(po) = info.owner else {
                    break;
                };
                let pinfo = heap.info(po);
                if pinfo.is_new_real || pinfo.is_dirty || pinfo.is_deleted || !pinfo.is_real() {
                    break;
                }
                self.mark_dirty(heap, po);
                cur = po;
            }
        }
    }

    fn save_unsaved(
        &mut self,
        heap: &mut Heap,
        store: &mut dyn Store,
    ) -> Result<FinalizeSummary, MachineError> {
        let mut summary = FinalizeSummary {
            deleted: self.deleted.len(),
            escaped: self.escaped.len(),
            ..FinalizeSummary::default()
        };
        let mut types = BTreeMap::new();
        let pending: Vec<ObjRef> = self.created.iter().chain(self.updated.iter()).copied().collect();
        for r in pending {
            self.save_recursive(heap, store, r, &mut types, &mut summary)?;
        }
        for t in types.into_values() {
            store
                .set_type(TypeRecord::new(&t)?)
                .map_err(|e| e.into_machine())?;
        }
        Ok(summary)
    }

    /// Saves unsaved children first so the parent's image commits to their
    /// fresh hashes.
    fn save_recursive(
        &mut self,
        heap: &mut Heap,
        store: &mut dyn Store,
        r: ObjRef,
        types: &mut BTreeMap<TypeId, Type>,
        summary: &mut FinalizeSummary,
    ) -> Result<(), MachineError> {
        let info = heap.info_mut(r);
        if !(info.is_new_real || info.is_dirty) || info.is_deleted || !info.is_real() {
            return Ok(());
        }
        let created = info.is_new_real;
        info.is_new_real = false;
        info.is_dirty = false;

        for child in heap.children(r) {
            let ci = heap.info(child);
            if !(ci.is_escaped || ci.is_new_escaped) {
                self.save_recursive(heap, store, child, types, summary)?;
            }
        }
        self.save_object(heap, store, r, created, types)?;
        if created {
            summary.created += 1;
        } else {
            summary.updated += 1;
        }
        Ok(())
    }

    fn save_object(
        &mut self,
        heap: &mut Heap,
        store: &mut dyn Store,
        r: ObjRef,
        created: bool,
        types: &mut BTreeMap<TypeId, Type>,
    ) -> Result<(), MachineError> {
        {
            let info = heap.info_mut(r);
            if info.is_new_escaped {
                info.is_new_escaped = false;
                info.is_escaped = true;
            }
        }
        let image = {
            let mut writer = ImageWriter::new(heap);
            let image = writer.object(r)?;
            for t in writer.into_types() {
                types.insert(t.type_id()?, t);
            }
            image
        };
        let info = heap.info(r);
        let id = info
            .id
            .ok_or_else(|| MachineError::malformed("saving object without id"))?;
        let owner = info.owner.and_then(|o| heap.info(o).id);
        let info_image = InfoImage {
            id,
            owner,
            ref_count: info.ref_count,
            mod_time: info.mod_time,
            is_escaped: info.is_escaped,
        };
        let hash = object_hash(&info_image, &image);
        heap.info_mut(r).hash = hash;

        let record = ObjectRecord {
            id,
            hash,
            owner,
            ref_count: info_image.ref_count,
            mod_time: info_image.mod_time,
            escaped: info_image.is_escaped,
            image: image.to_bytes(),
        };
        if created {
            store.create_object(record).map_err(|e| e.into_machine())?;
            self.log_op(RealmOpKind::Created, id);
        } else {
            store.set_object(record);
            self.log_op(RealmOpKind::Updated, id);
        }
        Ok(())
    }
}
