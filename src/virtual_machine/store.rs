//! Persistence interface for packages, realms, objects and types.
//!
//! The Machine and realm finalization only read and write through [`Store`].
//! [`MemStore`] keeps encoded records in memory; [`CacheStore`] layers a
//! read-through cache and a buffered write set over any other store so a
//! transaction can be committed atomically or thrown away.

use crate::info;
use crate::types::encoding::{Decode, Encode};
use crate::types::hash::Hash;
use crate::virtual_machine::ast::{FuncSource, Location, PackageNode};
use crate::virtual_machine::errors::{MachineError, StoreError};
use crate::virtual_machine::ownership::{InfoImage, ObjectId, PkgId};
use crate::virtual_machine::type_system::{Name, Type, TypeId};
use gnovm_derive::BinaryCodec;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

/// A deployed package. The node stays in memory; it is the preprocessed
/// source the package block was declared from.
#[derive(Clone, Debug)]
pub struct PackageRecord {
    pub path: Name,
    pub name: Name,
    pub node: Rc<PackageNode>,
    /// Package block, for realm packages.
    pub block_id: Option<ObjectId>,
}

#[derive(Clone, Debug, PartialEq, Eq, BinaryCodec)]
pub struct RealmRecord {
    pub path: Name,
    pub id: PkgId,
    pub time: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, BinaryCodec)]
pub struct ObjectRecord {
    pub id: ObjectId,
    pub hash: Hash,
    pub owner: Option<ObjectId>,
    pub ref_count: u32,
    pub mod_time: u64,
    pub escaped: bool,
    /// Encoded object image.
    pub image: Vec<u8>,
}

impl ObjectRecord {
    pub fn info_image(&self) -> InfoImage {
        InfoImage {
            id: self.id,
            owner: self.owner,
            ref_count: self.ref_count,
            mod_time: self.mod_time,
            is_escaped: self.escaped,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, BinaryCodec)]
pub struct TypeRecord {
    pub id: TypeId,
    /// Canonical description, used to detect id collisions.
    pub canonical: String,
    pub image: Vec<u8>,
}

impl TypeRecord {
    pub fn new(t: &Type) -> Result<Self, MachineError> {
        Ok(TypeRecord {
            id: t.type_id()?,
            canonical: canonical(t),
            image: t.image(),
        })
    }
}

/// Declared types are identified by name, everything else by shape.
fn canonical(t: &Type) -> String {
    match t.as_declared() {
        Some(dt) => match dt.base() {
            Some(base) => format!("{} {}", dt.qualified_name(), base),
            None => dt.qualified_name(),
        },
        None => t.to_string(),
    }
}

pub trait Store {
    fn get_package(&self, path: &str) -> Option<PackageRecord>;
    /// Fails if a package is already stored under the same path.
    fn set_package(&mut self, record: PackageRecord) -> Result<(), StoreError>;

    fn get_realm(&self, path: &str) -> Result<Option<RealmRecord>, StoreError>;
    fn set_realm(&mut self, record: RealmRecord);

    fn get_object(&self, id: &ObjectId) -> Result<Option<ObjectRecord>, StoreError>;
    fn set_object(&mut self, record: ObjectRecord);
    fn del_object(&mut self, id: &ObjectId);

    /// Stores a newly created object, refusing to overwrite an existing one.
    fn create_object(&mut self, record: ObjectRecord) -> Result<(), StoreError> {
        if self.get_object(&record.id)?.is_some() {
            return Err(StoreError::DuplicateObject(record.id));
        }
        self.set_object(record);
        Ok(())
    }

    fn get_type(&self, id: &TypeId) -> Result<Option<TypeRecord>, StoreError>;
    /// Idempotent for identical types; a different type under the same id is
    /// rejected.
    fn set_type(&mut self, record: TypeRecord) -> Result<(), StoreError>;

    fn get_block_node(&self, loc: &Location) -> Option<Rc<FuncSource>>;
    fn set_block_node(&mut self, source: Rc<FuncSource>);
}

fn check_type_collision(
    existing: Option<&TypeRecord>,
    incoming: &TypeRecord,
) -> Result<bool, StoreError> {
    match existing {
        Some(prev) if prev.canonical == incoming.canonical => Ok(false),
        Some(prev) => Err(StoreError::DuplicateType {
            id: incoming.id,
            existing: prev.canonical.clone(),
            incoming: incoming.canonical.clone(),
        }),
        None => Ok(true),
    }
}

/// In-memory base store. Objects, realms and types are kept encoded.
#[derive(Default)]
pub struct MemStore {
    packages: HashMap<Name, PackageRecord>,
    realms: HashMap<Name, Vec<u8>>,
    objects: BTreeMap<ObjectId, Vec<u8>>,
    types: BTreeMap<TypeId, Vec<u8>>,
    block_nodes: HashMap<Location, Rc<FuncSource>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_objects(&self) -> usize {
        self.objects.len()
    }

    pub fn object_ids(&self) -> impl Iterator<Item = &ObjectId> {
        self.objects.keys()
    }

    pub fn num_types(&self) -> usize {
        self.types.len()
    }
}

impl Store for MemStore {
    fn get_package(&self, path: &str) -> Option<PackageRecord> {
        self.packages.get(path).cloned()
    }

    fn set_package(&mut self, record: PackageRecord) -> Result<(), StoreError> {
        if self.packages.contains_key(&record.path) {
            return Err(StoreError::DuplicatePackage(record.path.to_string()));
        }
        self.packages.insert(record.path.clone(), record);
        Ok(())
    }

    fn get_realm(&self, path: &str) -> Result<Option<RealmRecord>, StoreError> {
        self.realms
            .get(path)
            .map(|bytes| RealmRecord::from_bytes(bytes).map_err(StoreError::from))
            .transpose()
    }

    fn set_realm(&mut self, record: RealmRecord) {
        self.realms.insert(record.path.clone(), record.to_bytes());
    }

    fn get_object(&self, id: &ObjectId) -> Result<Option<ObjectRecord>, StoreError> {
        self.objects
            .get(id)
            .map(|bytes| ObjectRecord::from_bytes(bytes).map_err(StoreError::from))
            .transpose()
    }

    fn set_object(&mut self, record: ObjectRecord) {
        self.objects.insert(record.id, record.to_bytes());
    }

    fn del_object(&mut self, id: &ObjectId) {
        self.objects.remove(id);
    }

    fn get_type(&self, id: &TypeId) -> Result<Option<TypeRecord>, StoreError> {
        self.types
            .get(id)
            .map(|bytes| TypeRecord::from_bytes(bytes).map_err(StoreError::from))
            .transpose()
    }

    fn set_type(&mut self, record: TypeRecord) -> Result<(), StoreError> {
        let existing = self.get_type(&record.id)?;
        if check_type_collision(existing.as_ref(), &record)? {
            self.types.insert(record.id, record.to_bytes());
        }
        Ok(())
    }

    fn get_block_node(&self, loc: &Location) -> Option<Rc<FuncSource>> {
        self.block_nodes.get(loc).cloned()
    }

    fn set_block_node(&mut self, source: Rc<FuncSource>) {
        self.block_nodes.insert(source.loc.clone(), source);
    }
}

/// Read-through cache with a buffered write set over `S`.
///
/// Writes stay pending until [`CacheStore::commit`]; [`CacheStore::discard`]
/// drops them. Deletions are pending `None` entries that shadow the base.
pub struct CacheStore<S: Store> {
    base: S,
    packages: HashMap<Name, PackageRecord>,
    realms: HashMap<Name, RealmRecord>,
    objects: BTreeMap<ObjectId, Option<ObjectRecord>>,
    types: BTreeMap<TypeId, TypeRecord>,
    block_nodes: HashMap<Location, Rc<FuncSource>>,
    reads: RefCell<HashMap<ObjectId, ObjectRecord>>,
}

impl<S: Store> CacheStore<S> {
    pub fn new(base: S) -> Self {
        CacheStore {
            base,
            packages: HashMap::new(),
            realms: HashMap::new(),
            objects: BTreeMap::new(),
            types: BTreeMap::new(),
            block_nodes: HashMap::new(),
            reads: RefCell::new(HashMap::new()),
        }
    }

    pub fn base(&self) -> &S {
        &self.base
    }

    pub fn into_inner(self) -> S {
        self.base
    }

    pub fn num_pending(&self) -> usize {
        self.packages.len()
            + self.realms.len()
            + self.objects.len()
            + self.types.len()
            + self.block_nodes.len()
    }

    /// Flushes pending writes into the base store in key order.
    pub fn commit(&mut self) -> Result<(), StoreError> {
        let (mut objects, mut deleted) = (0usize, 0usize);
        for (_, record) in self.packages.drain() {
            self.base.set_package(record)?;
        }
        for (_, record) in self.realms.drain() {
            self.base.set_realm(record);
        }
        for (_, record) in std::mem::take(&mut self.types) {
            self.base.set_type(record)?;
        }
        for (_, source) in self.block_nodes.drain() {
            self.base.set_block_node(source);
        }
        for (id, record) in std::mem::take(&mut self.objects) {
            match record {
                Some(record) => {
                    objects += 1;
                    self.base.set_object(record);
                }
                None => {
                    deleted += 1;
                    self.base.del_object(&id);
                }
            }
        }
        self.reads.borrow_mut().clear();
        info!("store commit: {} objects written, {} deleted", objects, deleted);
        Ok(())
    }

    /// Drops every pending write.
    pub fn discard(&mut self) {
        self.packages.clear();
        self.realms.clear();
        self.objects.clear();
        self.types.clear();
        self.block_nodes.clear();
        self.reads.borrow_mut().clear();
    }
}

impl<S: Store> Store for CacheStore<S> {
    fn get_package(&self, path: &str) -> Option<PackageRecord> {
        self.packages
            .get(path)
            .cloned()
            .or_else(|| self.base.get_package(path))
    }

    fn set_package(&mut self, record: PackageRecord) -> Result<(), StoreError> {
        if self.get_package(&record.path).is_some() {
            return Err(StoreError::DuplicatePackage(record.path.to_string()));
        }
        self.packages.insert(record.path.clone(), record);
        Ok(())
    }

    fn get_realm(&self, path: &str) -> Result<Option<RealmRecord>, StoreError> {
        match self.realms.get(path) {
            Some(record) => Ok(Some(record.clone())),
            None => self.base.get_realm(path),
        }
    }

    fn set_realm(&mut self, record: RealmRecord) {
        self.realms.insert(record.path.clone(), record);
    }

    fn get_object(&self, id: &ObjectId) -> Result<Option<ObjectRecord>, StoreError> {
        if let Some(pending) = self.objects.get(id) {
            return Ok(pending.clone());
        }
        if let Some(cached) = self.reads.borrow().get(id) {
            return Ok(Some(cached.clone()));
        }
        let record = self.base.get_object(id)?;
        if let Some(record) = &record {
            self.reads.borrow_mut().insert(*id, record.clone());
        }
        Ok(record)
    }

    fn set_object(&mut self, record: ObjectRecord) {
        self.reads.borrow_mut().remove(&record.id);
        self.objects.insert(record.id, Some(record));
    }

    fn del_object(&mut self, id: &ObjectId) {
        self.reads.borrow_mut().remove(id);
        self.objects.insert(*id, None);
    }

    fn get_type(&self, id: &TypeId) -> Result<Option<TypeRecord>, StoreError> {
        match self.types.get(id) {
            Some(record) => Ok(Some(record.clone())),
            None => self.base.get_type(id),
        }
    }

    fn set_type(&mut self, record: TypeRecord) -> Result<(), StoreError> {
        let existing = self.get_type(&record.id)?;
        if check_type_collision(existing.as_ref(), &record)? {
            self.types.insert(record.id, record);
        }
        Ok(())
    }

    fn get_block_node(&self, loc: &Location) -> Option<Rc<FuncSource>> {
        self.block_nodes
            .get(loc)
            .cloned()
            .or_else(|| self.base.get_block_node(loc))
    }

    fn set_block_node(&mut self, source: Rc<FuncSource>) {
        self.block_nodes.insert(source.loc.clone(), source);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtual_machine::ast::build;

    fn record(time: u64) -> ObjectRecord {
        ObjectRecord {
            id: ObjectId {
                pkg: PkgId::from_path("gno.land/r/test"),
                time,
            },
            hash: Hash::digest(&time.to_le_bytes()),
            owner: None,
            ref_count: 1,
            mod_time: time,
            escaped: false,
            image: vec![1, 2, 3],
        }
    }

    fn package(path: &str) -> PackageRecord {
        PackageRecord {
            path: Rc::from(path),
            name: Rc::from("test"),
            node: Rc::new(build::package(path, "test", 0, vec![])),
            block_id: None,
        }
    }

    #[test]
    fn mem_store_round_trips_objects() {
        let mut store = MemStore::new();
        store.create_object(record(1)).unwrap();
        assert_eq!(store.get_object(&record(1).id).unwrap(), Some(record(1)));
        assert!(matches!(
            store.create_object(record(1)),
            Err(StoreError::DuplicateObject(_))
        ));
        store.del_object(&record(1).id);
        assert_eq!(store.get_object(&record(1).id).unwrap(), None);
    }

    #[test]
    fn duplicate_packages_are_rejected() {
        let mut store = MemStore::new();
        store.set_package(package("gno.land/r/test")).unwrap();
        assert!(matches!(
            store.set_package(package("gno.land/r/test")),
            Err(StoreError::DuplicatePackage(_))
        ));

        let mut cache = CacheStore::new(store);
        assert!(cache.get_package("gno.land/r/test").is_some());
        assert!(cache.set_package(package("gno.land/r/test")).is_err());
        cache.set_package(package("gno.land/r/other")).unwrap();
        assert!(cache.set_package(package("gno.land/r/other")).is_err());
    }

    #[test]
    fn type_ids_must_not_collide() {
        let mut store = MemStore::new();
        let t = Type::slice(Type::INT);
        let rec = TypeRecord::new(&t).unwrap();
        store.set_type(rec.clone()).unwrap();
        store.set_type(rec.clone()).unwrap();
        assert_eq!(store.num_types(), 1);

        let forged = TypeRecord {
            canonical: "[]string".to_string(),
            ..rec
        };
        assert!(matches!(
            store.set_type(forged),
            Err(StoreError::DuplicateType { .. })
        ));
    }

    #[test]
    fn cache_buffers_until_commit() {
        let mut cache = CacheStore::new(MemStore::new());
        cache.set_object(record(1));
        cache.set_realm(RealmRecord {
            path: Rc::from("gno.land/r/test"),
            id: PkgId::from_path("gno.land/r/test"),
            time: 4,
        });
        assert!(cache.get_object(&record(1).id).unwrap().is_some());
        assert_eq!(cache.base().num_objects(), 0);
        assert_eq!(cache.num_pending(), 2);

        cache.commit().unwrap();
        assert_eq!(cache.base().num_objects(), 1);
        assert_eq!(
            cache.base().get_realm("gno.land/r/test").unwrap().unwrap().time,
            4
        );
        assert_eq!(cache.num_pending(), 0);
    }

    #[test]
    fn cache_deletes_shadow_base_and_discard_restores() {
        let mut base = MemStore::new();
        base.set_object(record(1));
        let mut cache = CacheStore::new(base);
        assert!(cache.get_object(&record(1).id).unwrap().is_some());

        cache.del_object(&record(1).id);
        assert!(cache.get_object(&record(1).id).unwrap().is_none());

        cache.discard();
        assert!(cache.get_object(&record(1).id).unwrap().is_some());

        cache.del_object(&record(1).id);
        cache.commit().unwrap();
        assert_eq!(cache.into_inner().num_objects(), 0);
    }

    #[test]
    fn block_nodes_read_through() {
        let mut base = MemStore::new();
        let source = build::func_source("p", 1, "f", build::func_type(vec![], vec![]), 0, vec![]);
        base.set_block_node(source.clone());
        let cache = CacheStore::new(base);
        let found = cache.get_block_node(&source.loc).unwrap();
        assert!(Rc::ptr_eq(&found, &source));
    }
}
