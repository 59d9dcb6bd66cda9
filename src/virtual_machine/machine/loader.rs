//! Package declaration, reloading from the store and the call-in entry
//! points.

use super::{Exception, Fault, Frame, Machine, Op, Target};
use crate::info;
use crate::types::encoding::{Decode, DecodeError};
use crate::virtual_machine::ast::{
    collect_func_sources, Decl, ExprRef, FuncDecl, FuncSource, Location, PackageNode, StmtRef,
    VarDecl,
};
use crate::virtual_machine::errors::{MachineError, StoreError};
use crate::virtual_machine::heap::Heap;
use crate::virtual_machine::image::{decode_object, ImageResolver, ObjectImage};
use crate::virtual_machine::ownership::{ObjectId, ObjectInfo, PkgId};
use crate::virtual_machine::realm::Realm;
use crate::virtual_machine::store::{ObjectRecord, PackageRecord, TypeRecord};
use crate::virtual_machine::type_system::{Method, ResolveType, Type, TypeId};
use crate::virtual_machine::uverse::{universe, UVERSE_PATH};
use crate::virtual_machine::values::{
    Block, BlockSource, FuncValue, ObjRef, Object, PackageValue, TypedValue, Value,
};
use std::cell::RefCell;
use std::rc::Rc;

/// Stacks and active package set aside while another package is declared.
struct Context {
    ops: Vec<Op>,
    values: Vec<TypedValue>,
    blocks: Vec<ObjRef>,
    frames: Vec<Frame>,
    targets: Vec<Target>,
    package: Rc<PackageValue>,
    realm: Option<Rc<RefCell<Realm>>>,
}

impl Machine<'_> {
    /// Declares a new package: imports, types, functions and methods, then
    /// package variables in order. The package becomes the active one and
    /// its record, block and types are written to the store. A realm
    /// package's block is the root of its realm.
    pub fn run_declarations(
        &mut self,
        node: Rc<PackageNode>,
    ) -> Result<Rc<PackageValue>, MachineError> {
        if self.packages.contains_key(&*node.path) || self.store.get_package(&node.path).is_some() {
            return Err(MachineError::DuplicatePackage(node.path.to_string()));
        }
        info!("declaring package {}", node.path);
        let prev = (self.package.clone(), self.realm.clone());
        let res = self
            .declare_package(node.clone(), true)
            .and_then(|pv| self.finish().map(|()| pv));
        match res {
            Ok(pv) => Ok(pv),
            Err(err) => {
                let err = self.abort(err);
                self.packages.remove(&*node.path);
                (self.package, self.realm) = prev;
                self.blocks = vec![self.package.block];
                Err(err)
            }
        }
    }

    /// Brings a stored package into memory. Realm packages are rebuilt
    /// from their persisted block; other packages are declared again from
    /// their node.
    pub fn load_package(&mut self, path: &str) -> Result<Rc<PackageValue>, MachineError> {
        if let Some(pv) = self.packages.get(path) {
            return Ok(pv.clone());
        }
        let record = self
            .store
            .get_package(path)
            .ok_or_else(|| MachineError::MissingPackage(path.to_string()))?;
        let node = record.node.clone();
        for import in &node.imports {
            self.load_package(&import.path)?;
        }

        let Some(block_id) = record.block_id else {
            info!("redeclaring package {}", path);
            let saved = self.save_context();
            let res = self.declare_package(node, false);
            self.restore_context(saved);
            return res;
        };

        info!("loading realm package {}", path);
        // Types and methods are code, not state: they come from the node.
        self.declare_types(&node, None, false)?;
        for decl in &node.decls {
            if let Decl::Func(fd) = decl {
                if fd.recv.is_some() {
                    self.declare_func(None, fd)?;
                }
            }
        }
        let mut realm = match self.store.get_realm(path)? {
            Some(rec) => Realm::from_record(&rec),
            None => Realm::new(path),
        };
        realm.set_log_ops(self.options.log_realm_ops);
        let block = self.resolve_object(block_id)?;
        let pv = Rc::new(PackageValue {
            name: record.name.clone(),
            path: record.path.clone(),
            block,
            realm: Some(Rc::new(RefCell::new(realm))),
        });
        self.packages.insert(pv.path.clone(), pv.clone());
        Ok(pv)
    }

    /// Makes a loaded (or stored) package the one entry points run in.
    pub fn set_active_package(&mut self, path: &str) -> Result<Rc<PackageValue>, MachineError> {
        let pv = self.load_package(path)?;
        self.package = pv.clone();
        self.realm = pv.realm.clone();
        self.blocks = vec![pv.block];
        Ok(pv)
    }

    /// Calls the active package's function `name` and returns its results.
    /// Realms touched by the call are finalized afterwards.
    pub fn run_func(
        &mut self,
        name: &str,
        args: Vec<TypedValue>,
    ) -> Result<Vec<TypedValue>, MachineError> {
        match self.call_entry(name, args) {
            Ok(results) => Ok(results),
            Err(err) => Err(self.abort(err)),
        }
    }

    pub fn run_main(&mut self) -> Result<(), MachineError> {
        self.run_func("main", Vec::new()).map(|_| ())
    }

    /// Evaluates one expression in the active package block. Untyped
    /// results take their default type.
    pub fn eval(&mut self, expr: ExprRef) -> Result<TypedValue, MachineError> {
        match self.eval_entry(expr) {
            Ok(v) => Ok(v),
            Err(err) => Err(self.abort(err)),
        }
    }

    /// Executes one statement in the active package block.
    pub fn run_statement(&mut self, stmt: StmtRef) -> Result<(), MachineError> {
        self.push_op(Op::Exec(stmt));
        match self.drain().and_then(|()| self.finish()) {
            Ok(()) => Ok(()),
            Err(err) => Err(self.abort(err)),
        }
    }

    fn call_entry(
        &mut self,
        name: &str,
        args: Vec<TypedValue>,
    ) -> Result<Vec<TypedValue>, MachineError> {
        let callee = self.package_func(name)?;
        let num_results = callee
            .typ()?
            .as_func()
            .map_or(0, |ft| ft.results.len());
        let base = self.values.len();
        self.push_value(callee);
        self.values.extend(args);
        self.push_op(Op::Precall(base, false));
        self.drain()?;
        let results = self.pop_values(num_results)?;
        self.finish()?;
        Ok(results)
    }

    fn eval_entry(&mut self, expr: ExprRef) -> Result<TypedValue, MachineError> {
        let mut values = self.eval_exprs(std::slice::from_ref(&expr))?;
        let v = match values.len() {
            0 => TypedValue::undefined(),
            1 => values.remove(0),
            n => return Err(MachineError::malformed(format!("expression yields {} values", n))),
        };
        let res = self.default_value(v);
        let v = self.settle(res)?;
        self.finish()?;
        Ok(v)
    }

    /// Function declared in the active package under `name`.
    fn package_func(&self, name: &str) -> Result<TypedValue, MachineError> {
        let record = self
            .store
            .get_package(&self.package.path)
            .ok_or_else(|| MachineError::MissingPackage(self.package.path.to_string()))?;
        let index = record
            .node
            .decls
            .iter()
            .find_map(|decl| match decl {
                Decl::Func(fd) if fd.recv.is_none() && &*fd.source.name == name => fd.index,
                _ => None,
            })
            .ok_or_else(|| {
                MachineError::malformed(format!("no function {} in {}", name, self.package.path))
            })?;
        self.heap
            .get(self.package.block)
            .slot(index as usize)
            .cloned()
            .ok_or_else(|| MachineError::malformed(format!("no slot for {}", name)))
    }

    /// Ends an entry point: settles every realm with pending changes and
    /// checks that nothing was left behind.
    fn finish(&mut self) -> Result<(), MachineError> {
        let mut realms: Vec<_> = self
            .packages
            .values()
            .filter_map(|pv| pv.realm.clone().map(|r| (pv.path.clone(), r)))
            .collect();
        realms.sort_by(|a, b| a.0.cmp(&b.0));
        for (_, realm) in realms {
            let mut realm = realm.borrow_mut();
            if realm.has_marks() {
                realm.finalize(&mut self.heap, &mut *self.store)?;
            }
        }
        if self.options.check_empty {
            self.check_empty()?;
        }
        Ok(())
    }

    fn declare_package(
        &mut self,
        node: Rc<PackageNode>,
        persist: bool,
    ) -> Result<Rc<PackageValue>, MachineError> {
        for import in &node.imports {
            self.load_package(&import.path)?;
        }
        if persist {
            for source in collect_func_sources(&node) {
                self.store.set_block_node(source);
            }
        }
        let pv = self.new_package(&node)?;
        self.packages.insert(pv.path.clone(), pv.clone());
        self.package = pv.clone();
        self.realm = pv.realm.clone();
        self.blocks = vec![pv.block];

        for import in &node.imports {
            let imported = self.load_package(&import.path)?;
            let v = TypedValue::with_value(Type::Package, Value::Package(imported));
            self.set_slot(pv.block, import.index as usize, v)?;
        }
        self.declare_types(&node, Some(pv.block), persist)?;
        for decl in &node.decls {
            if let Decl::Func(fd) = decl {
                self.declare_func(Some(pv.block), fd)?;
            }
        }
        for decl in &node.decls {
            if let Decl::Var(vd) = decl {
                self.declare_var(vd)?;
            }
        }

        if persist {
            let record = PackageRecord {
                path: node.path.clone(),
                name: node.name.clone(),
                node: node.clone(),
                block_id: self.heap.info(pv.block).id,
            };
            self.store.set_package(record).map_err(StoreError::into_machine)?;
        }
        Ok(pv)
    }

    fn new_package(&mut self, node: &PackageNode) -> Result<Rc<PackageValue>, MachineError> {
        let num_names = node.num_names as usize;
        self.alloc.allocate_block(num_names)?;
        let block = self.heap.alloc(Object::Block(Block::new(
            BlockSource::Package(node.path.clone()),
            num_names,
            Some(self.universe),
        )));
        let realm = if Realm::is_realm_path(&node.path) {
            let mut realm = match self.store.get_realm(&node.path)? {
                Some(rec) => Realm::from_record(&rec),
                None => Realm::new(&node.path),
            };
            realm.set_log_ops(self.options.log_realm_ops);
            realm.assign_root(&mut self.heap, block);
            Some(Rc::new(RefCell::new(realm)))
        } else {
            None
        };
        Ok(Rc::new(PackageValue {
            name: node.name.clone(),
            path: node.path.clone(),
            block,
            realm,
        }))
    }

    /// Gives every declared type its base before any id is taken, so
    /// mutually recursive declarations resolve.
    fn declare_types(
        &mut self,
        node: &PackageNode,
        block: Option<ObjRef>,
        persist: bool,
    ) -> Result<(), MachineError> {
        let decls = node.decls.iter().filter_map(|decl| match decl {
            Decl::Type(td) => Some(td),
            _ => None,
        });
        for td in decls.clone() {
            match block {
                Some(b) => self.declare_type(b, td)?,
                None => {
                    if let Some(dt) = td.typ.as_declared() {
                        if dt.base().is_none() {
                            dt.set_base(td.base.clone())?;
                        }
                    }
                }
            }
        }
        for td in decls {
            let id = td.typ.type_id()?;
            self.types.insert(id, td.typ.clone());
            if persist {
                self.store
                    .set_type(TypeRecord::new(&td.typ)?)
                    .map_err(StoreError::into_machine)?;
            }
        }
        Ok(())
    }

    /// Binds a function into its package slot, or a method onto its
    /// receiver type. Without a block only methods are bound.
    fn declare_func(&mut self, block: Option<ObjRef>, fd: &FuncDecl) -> Result<(), MachineError> {
        let func = if fd.native {
            let (pkg_path, name) = (&fd.source.loc.pkg_path, &fd.source.name);
            self.natives
                .func_value(pkg_path, name)
                .ok_or_else(|| MachineError::MissingNative {
                    pkg_path: pkg_path.to_string(),
                    name: name.to_string(),
                })?
        } else {
            self.alloc.allocate_func()?;
            Rc::new(FuncValue::from_source(fd.source.clone(), None))
        };
        match (&fd.recv, fd.index, block) {
            (Some((recv, ptr_recv)), _, _) => {
                let dt = recv
                    .as_declared()
                    .ok_or_else(|| MachineError::unexpected("declared receiver type", recv))?;
                dt.add_method(Method {
                    name: fd.source.name.clone(),
                    ptr_recv: *ptr_recv,
                    typ: fd.source.typ.clone(),
                    func,
                });
                Ok(())
            }
            (None, Some(index), Some(b)) => {
                let v = TypedValue::with_value(fd.source.typ.clone(), Value::Func(func));
                self.set_slot(b, index as usize, v)
            }
            (None, Some(_), None) => Ok(()),
            (None, None, _) => Err(MachineError::malformed(format!(
                "function {} has no package slot",
                fd.source.name
            ))),
        }
    }

    fn declare_var(&mut self, vd: &VarDecl) -> Result<(), MachineError> {
        let values = self.eval_exprs(&vd.values)?;
        let res = self.assign_var_decl(vd, values);
        self.settle(res)
    }

    /// Runs `exprs` to completion and returns every value they produced.
    fn eval_exprs(&mut self, exprs: &[ExprRef]) -> Result<Vec<TypedValue>, MachineError> {
        let base = self.values.len();
        for x in exprs.iter().rev() {
            self.push_op(Op::Eval(x.clone()));
        }
        self.drain()?;
        if self.values.len() < base {
            return Err(MachineError::StackUnderflow("value"));
        }
        Ok(self.values.split_off(base))
    }

    /// Outside the run loop no frame can recover a panic, so it surfaces
    /// as unrecovered right away.
    fn settle<T>(&mut self, res: Result<T, Fault>) -> Result<T, MachineError> {
        match self.trap(res)? {
            Some(v) => Ok(v),
            None => {
                let value = self
                    .pending_panic
                    .take()
                    .unwrap_or_else(TypedValue::undefined);
                let trace = self.trace();
                self.exception = Some(Exception { value, trace });
                Err(self.unrecovered())
            }
        }
    }

    fn save_context(&mut self) -> Context {
        Context {
            ops: std::mem::take(&mut self.ops),
            values: std::mem::take(&mut self.values),
            blocks: std::mem::take(&mut self.blocks),
            frames: std::mem::take(&mut self.frames),
            targets: std::mem::take(&mut self.targets),
            package: self.package.clone(),
            realm: self.realm.clone(),
        }
    }

    fn restore_context(&mut self, saved: Context) {
        self.ops = saved.ops;
        self.values = saved.values;
        self.blocks = saved.blocks;
        self.frames = saved.frames;
        self.targets = saved.targets;
        self.package = saved.package;
        self.realm = saved.realm;
    }
}

impl Machine<'_> {
    /// Decodes a stored object into slot `r`, replacing its content and
    /// metadata.
    fn load_record(&mut self, r: ObjRef, record: ObjectRecord) -> Result<(), MachineError> {
        let image = ObjectImage::from_bytes(&record.image)?;
        let mut object = decode_object(image, self)?;
        if let Object::Block(b) = &mut object {
            // package blocks hang off the universe, which is never stored
            if b.parent.is_none() && b.is_package() {
                b.parent = Some(self.universe);
            }
        }
        self.heap.replace(r, object);
        let owner = record.owner.map(|o| self.resolve_object(o)).transpose()?;

        let info = self.heap.info_mut(r);
        *info = ObjectInfo::default();
        info.id = Some(record.id);
        info.hash = record.hash;
        info.owner = owner;
        info.ref_count = record.ref_count;
        info.mod_time = record.mod_time;
        info.is_escaped = record.escaped;
        Ok(())
    }

    /// Rewinds every materialized object of realm `pkg` to its stored
    /// image. Objects the store no longer holds are forgotten.
    pub(super) fn reload_realm(&mut self, pkg: PkgId) -> Result<usize, MachineError> {
        let mut reloaded = 0;
        for (id, r) in self.heap.loaded_in(pkg) {
            match self.store.get_object(&id)? {
                Some(record) => {
                    self.load_record(r, record)?;
                    reloaded += 1;
                }
                None => {
                    self.heap.forget(&id);
                }
            }
        }
        Ok(reloaded)
    }
}

impl ImageResolver for Machine<'_> {
    fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Loads an object and, recursively, everything it references. The
    /// slot is registered before decoding so cycles land on it.
    fn resolve_object(&mut self, id: ObjectId) -> Result<ObjRef, MachineError> {
        if let Some(r) = self.heap.lookup(&id) {
            return Ok(r);
        }
        let record = self
            .store
            .get_object(&id)?
            .ok_or(MachineError::MissingObject(id))?;
        let r = self.heap.alloc(Object::HeapItem(TypedValue::undefined()));
        self.heap.register(id, r);
        self.load_record(r, record)?;
        Ok(r)
    }

    fn resolve_type(&mut self, id: TypeId) -> Result<Type, MachineError> {
        if let Some(t) = self.types.get(&id) {
            return Ok(t.clone());
        }
        let record = self.store.get_type(&id)?.ok_or(MachineError::MissingType(id))?;
        let mut input = record.image.as_slice();
        let t = Type::decode_image(&mut input, self)?;
        self.types.insert(id, t.clone());
        Ok(t)
    }

    fn resolve_source(&mut self, loc: &Location) -> Result<Rc<FuncSource>, MachineError> {
        self.store
            .get_block_node(loc)
            .ok_or_else(|| MachineError::malformed(format!("no function source at {:?}", loc)))
    }

    fn resolve_native(&mut self, pkg_path: &str, name: &str) -> Result<Rc<FuncValue>, MachineError> {
        let found = if pkg_path == UVERSE_PATH {
            universe().builtin(name)
        } else {
            self.natives.func_value(pkg_path, name)
        };
        found.ok_or_else(|| MachineError::MissingNative {
            pkg_path: pkg_path.to_string(),
            name: name.to_string(),
        })
    }

    fn resolve_package(&mut self, path: &str) -> Result<Rc<PackageValue>, MachineError> {
        self.load_package(path)
    }
}

impl ResolveType for Machine<'_> {
    fn resolve(&mut self, id: TypeId) -> Result<Type, DecodeError> {
        ImageResolver::resolve_type(self, id).map_err(|_| DecodeError::InvalidValue)
    }
}
