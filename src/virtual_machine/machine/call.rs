use super::{CallFrame, Defer, Exception, Fault, FrameKind, Machine, Op, PanicState};
use crate::debug;
use crate::virtual_machine::ast::{Expr, ExprRef, Stmt};
use crate::virtual_machine::errors::MachineError;
use crate::virtual_machine::type_system::{FuncType, Type};
use crate::virtual_machine::uverse::UVERSE_PATH;
use crate::virtual_machine::values::{
    ArrayValue, Block, BlockSource, FuncBody, FuncValue, ObjRef, Object, SliceValue, TypedValue,
    Value,
};
use std::rc::Rc;

impl Machine<'_> {
    /// The callee is on top of the value stack. Schedules the argument
    /// evaluations followed by the call or defer.
    pub(super) fn op_call_args(&mut self, call: ExprRef, is_defer: bool) -> Result<(), MachineError> {
        let Expr::Call { args, varg, .. } = &*call else {
            return Err(MachineError::unexpected("call expression", &*call));
        };
        let base = self
            .values
            .len()
            .checked_sub(1)
            .ok_or(MachineError::StackUnderflow("value"))?;
        if is_defer {
            self.push_op(Op::Defer(base, *varg));
        } else {
            self.push_op(Op::Precall(base, *varg));
        }
        for x in args.iter().rev() {
            self.push_op(Op::Eval(x.clone()));
        }
        Ok(())
    }

    /// Callee at value stack index `base`, arguments above it.
    pub(super) fn op_precall(&mut self, base: usize, varg: bool) -> Result<(), MachineError> {
        let (callee, args) = self.take_call(base)?;
        self.call_value(callee, args, varg, false)
    }

    pub(super) fn op_defer(&mut self, base: usize, varg: bool) -> Result<(), MachineError> {
        let (callee, args) = self.take_call(base)?;
        let mut copied = Vec::with_capacity(args.len());
        for a in args {
            copied.push(self.heap.copy_value(&mut self.alloc, a)?);
        }
        self.call_frame_mut()?.defers.push(Defer {
            callee,
            args: copied,
            varg,
        });
        Ok(())
    }

    fn take_call(&mut self, base: usize) -> Result<(TypedValue, Vec<TypedValue>), MachineError> {
        if base >= self.values.len() {
            return Err(MachineError::StackUnderflow("value"));
        }
        let mut args = self.values.split_off(base);
        let callee = args.remove(0);
        Ok((callee, args))
    }

    pub(super) fn call_value(
        &mut self,
        callee: TypedValue,
        args: Vec<TypedValue>,
        varg: bool,
        is_defer: bool,
    ) -> Result<(), MachineError> {
        match &callee.v {
            Value::Func(f) => self.call_func(f.clone(), None, args, varg, is_defer),
            Value::BoundMethod(bm) => {
                self.call_func(bm.func.clone(), Some(bm.receiver.clone()), args, varg, is_defer)
            }
            Value::Type(t) => {
                let [x] = <[TypedValue; 1]>::try_from(args)
                    .map_err(|_| MachineError::malformed(format!("conversion to {} needs one value", t)))?;
                let res = self.convert_value(x, t);
                let v = try_panic!(self, res);
                if !is_defer {
                    self.push_value(v);
                }
                Ok(())
            }
            Value::None => {
                self.trap::<()>(Err(Fault::Panic(
                    "invalid memory address or nil pointer dereference".into(),
                )))?;
                Ok(())
            }
            _ => Err(MachineError::unexpected("function", callee.kind())),
        }
    }

    /// Pushes a call frame and the function block, then schedules the body.
    pub(super) fn call_func(
        &mut self,
        func: Rc<FuncValue>,
        recv: Option<TypedValue>,
        args: Vec<TypedValue>,
        varg: bool,
        is_defer: bool,
    ) -> Result<(), MachineError> {
        let ft = func
            .typ
            .as_func()
            .ok_or_else(|| MachineError::unexpected("function type", &func.typ))?;
        let keep_untyped = &*func.pkg_path == UVERSE_PATH;
        let res = self.bind_args(&ft, args, varg, keep_untyped);
        let params = try_panic!(self, res);

        let (source, num_names) = match &func.body {
            FuncBody::Source(s) => (BlockSource::Func(s.loc.clone()), s.num_names as usize),
            FuncBody::Native(_) => (BlockSource::Local, params.len() + ft.results.len()),
        };
        let mut slots = Vec::with_capacity(num_names);
        let has_recv = func.source().is_some_and(|s| s.has_recv);
        if has_recv {
            let recv = recv.ok_or_else(|| {
                MachineError::malformed(format!("method {} called without a receiver", func.name))
            })?;
            slots.push(self.heap.copy_value(&mut self.alloc, recv)?);
        }
        for p in params {
            slots.push(self.heap.copy_value(&mut self.alloc, p)?);
        }
        for r in &ft.results {
            slots.push(self.heap.zero_value(&mut self.alloc, &r.typ)?);
        }
        if slots.len() > num_names {
            return Err(MachineError::malformed(format!(
                "function {} has {} slots, needs {}",
                func.name,
                num_names,
                slots.len()
            )));
        }
        slots.resize(num_names, TypedValue::undefined());

        debug!("call {}.{}", func.pkg_path, func.name);
        let frame = CallFrame {
            func: func.clone(),
            is_defer,
            defers: Vec::new(),
            last_package: self.package.clone(),
            last_realm: self.realm.clone(),
        };
        self.push_frame(FrameKind::Call(frame), None);
        self.enter_package(&func.pkg_path);
        let parent = self.closure_block(&func);
        self.alloc.allocate_block(num_names)?;
        let mut block = Block::new(source, 0, Some(parent));
        block.values = slots;
        let first = usize::from(has_recv);
        for (i, p) in ft.params.iter().chain(ft.results.iter()).enumerate() {
            block.declare_static(first + i, &p.typ);
        }
        let b = self.heap.alloc(Object::Block(block));
        self.blocks.push(b);

        match &func.body {
            FuncBody::Native(_) => {
                self.push_op(Op::Return);
                self.push_op(Op::CallNative);
            }
            FuncBody::Source(s) => {
                self.push_op(Op::Exec(Rc::new(Stmt::Return { results: Vec::new() })));
                self.start_body(b, s.body.clone())?;
            }
        }
        Ok(())
    }

    /// Converts arguments to parameter types, packing variadic ones.
    /// Builtins see untyped constants as passed.
    fn bind_args(
        &mut self,
        ft: &FuncType,
        args: Vec<TypedValue>,
        varg: bool,
        keep_untyped: bool,
    ) -> Result<Vec<TypedValue>, Fault> {
        let nparams = ft.params.len();
        let fixed = if ft.variadic && !varg {
            nparams.saturating_sub(1)
        } else {
            nparams
        };
        let arity_ok = if fixed < nparams {
            args.len() >= fixed
        } else {
            args.len() == nparams
        };
        if !arity_ok {
            return Err(MachineError::malformed(format!(
                "{} arguments for {} parameters",
                args.len(),
                nparams
            ))
            .into());
        }

        let mut out = Vec::with_capacity(nparams);
        let mut args = args.into_iter();
        for p in &ft.params[..fixed] {
            let a = args
                .next()
                .ok_or_else(|| MachineError::malformed("missing argument"))?;
            out.push(self.bind_arg(a, &p.typ, keep_untyped)?);
        }
        if fixed < nparams {
            let vt = &ft.params[fixed].typ;
            let elem = vt
                .elem()
                .ok_or_else(|| MachineError::unexpected("variadic slice", vt))?;
            let rest: Vec<TypedValue> = args.collect();
            if rest.is_empty() {
                out.push(TypedValue::nil(Type::slice(elem)));
            } else {
                let mut list = Vec::with_capacity(rest.len());
                for a in rest {
                    let a = self.bind_arg(a, &elem, keep_untyped)?;
                    list.push(self.heap.copy_value(&mut self.alloc, a)?);
                }
                out.push(self.make_slice(Type::slice(elem), list)?);
            }
        }
        Ok(out)
    }

    fn bind_arg(&mut self, a: TypedValue, t: &Type, keep_untyped: bool) -> Result<TypedValue, Fault> {
        if keep_untyped && t.is_interface() {
            return Ok(a);
        }
        self.assignable(a, t)
    }

    /// Allocates a fresh backing array holding `list`.
    pub(super) fn make_slice(
        &mut self,
        t: Type,
        list: Vec<TypedValue>,
    ) -> Result<TypedValue, MachineError> {
        let n = list.len();
        self.alloc.allocate_array(n)?;
        self.alloc.allocate_slice()?;
        let base = self.heap.alloc(Object::Array(ArrayValue { list }));
        Ok(TypedValue::with_value(
            t,
            Value::Slice(SliceValue {
                base,
                offset: 0,
                length: n,
                maxcap: n,
            }),
        ))
    }

    /// Makes the callee's package active. Its realm takes over only when it
    /// has one, so plain packages run under their caller's realm.
    fn enter_package(&mut self, pkg_path: &str) {
        if *self.package.path == *pkg_path {
            return;
        }
        if let Some(pv) = self.packages.get(pkg_path).cloned() {
            if pv.realm.is_some() {
                self.realm = pv.realm.clone();
            }
            self.package = pv;
        }
    }

    /// Parent of a function's block. Declared functions persist without a
    /// closure and resolve to their package block at call time.
    fn closure_block(&self, func: &FuncValue) -> ObjRef {
        if let Some(c) = func.closure {
            return c;
        }
        if *self.package.path == *func.pkg_path {
            return self.package.block;
        }
        self.packages
            .get(&*func.pkg_path)
            .map_or(self.universe, |p| p.block)
    }

    pub(super) fn op_call_native(&mut self) -> Result<(), MachineError> {
        let func = self.call_frame()?.func.clone();
        let FuncBody::Native(f) = &func.body else {
            return Err(MachineError::unexpected("native function", &func.name));
        };
        let f = f.clone();
        f(self)
    }

    /// Parameters of the running native function, in order.
    pub fn native_args(&self) -> Result<Vec<TypedValue>, MachineError> {
        let cf = self.call_frame()?;
        let ft = cf
            .func
            .typ
            .as_func()
            .ok_or_else(|| MachineError::unexpected("function type", &cf.func.typ))?;
        let b = self.last_block()?;
        let block = self
            .heap
            .block(b)
            .ok_or_else(|| MachineError::unexpected("block", b))?;
        block
            .values
            .get(..ft.params.len())
            .map(<[TypedValue]>::to_vec)
            .ok_or_else(|| MachineError::malformed("native function block too small"))
    }

    pub(super) fn exec_return(&mut self, results: &[ExprRef]) -> Result<(), MachineError> {
        let has_defers = !self.call_frame()?.defers.is_empty();
        if results.is_empty() {
            self.push_op(Op::ReturnFromBlock);
            if has_defers {
                self.push_op(Op::ReturnCallDefers);
            }
            return Ok(());
        }
        if has_defers {
            // Results land in the result slots first so defers can see and
            // change them.
            self.push_op(Op::ReturnFromBlock);
            self.push_op(Op::ReturnCallDefers);
            self.push_op(Op::ReturnToBlock);
        } else {
            self.push_op(Op::Return);
        }
        for x in results.iter().rev() {
            self.push_op(Op::Eval(x.clone()));
        }
        Ok(())
    }

    fn result_layout(&self) -> Result<(Rc<FuncType>, usize, ObjRef), MachineError> {
        let i = self.last_call_frame()?;
        let frame = &self.frames[i];
        let cf = frame.call().ok_or(MachineError::MissingFrame)?;
        let ft = cf
            .func
            .typ
            .as_func()
            .ok_or_else(|| MachineError::unexpected("function type", &cf.func.typ))?;
        let offset = cf.func.source().is_some_and(|s| s.has_recv) as usize + ft.params.len();
        let block = self
            .blocks
            .get(frame.num_blocks)
            .copied()
            .ok_or(MachineError::StackUnderflow("block"))?;
        Ok((ft, offset, block))
    }

    fn convert_results(
        &mut self,
        ft: &FuncType,
        results: Vec<TypedValue>,
    ) -> Result<Vec<TypedValue>, Fault> {
        let mut out = Vec::with_capacity(results.len());
        for (v, r) in results.into_iter().zip(ft.results.iter()) {
            out.push(self.assignable(v, &r.typ)?);
        }
        Ok(out)
    }

    /// Results are on the value stack.
    pub(super) fn op_return(&mut self) -> Result<(), MachineError> {
        let (ft, _, _) = self.result_layout()?;
        let results = self.pop_values(ft.results.len())?;
        let res = self.convert_results(&ft, results);
        let results = try_panic!(self, res);
        self.pop_frame_and_return(results)
    }

    /// Stores the evaluated results into the result slots.
    pub(super) fn op_return_to_block(&mut self) -> Result<(), MachineError> {
        let (ft, offset, block) = self.result_layout()?;
        let results = self.pop_values(ft.results.len())?;
        let res = self.convert_results(&ft, results);
        let results = try_panic!(self, res);
        for (i, v) in results.into_iter().enumerate() {
            self.set_slot(block, offset + i, v)?;
        }
        Ok(())
    }

    /// Returns whatever the result slots hold.
    pub(super) fn op_return_from_block(&mut self) -> Result<(), MachineError> {
        let (ft, offset, block) = self.result_layout()?;
        let results = self
            .heap
            .block(block)
            .and_then(|b| b.values.get(offset..offset + ft.results.len()))
            .map(<[TypedValue]>::to_vec)
            .ok_or_else(|| MachineError::malformed("result slots out of range"))?;
        self.pop_frame_and_return(results)
    }

    /// Runs the innermost call's deferred calls, last registered first.
    pub(super) fn op_return_call_defers(&mut self) -> Result<(), MachineError> {
        match self.call_frame_mut()?.defers.pop() {
            Some(d) => self.call_value(d.callee, d.args, d.varg, true),
            None => {
                self.pop_op()?;
                Ok(())
            }
        }
    }

    /// Pops the innermost call frame, restoring the caller's stacks, package
    /// and realm. Leaving a realm finalizes it.
    pub(super) fn pop_frame_and_return(&mut self, results: Vec<TypedValue>) -> Result<(), MachineError> {
        let is_defer = self.pop_call_frame()?;
        if !is_defer {
            self.values.extend(results);
        }
        Ok(())
    }

    /// Returns whether the popped frame ran a deferred call.
    fn pop_call_frame(&mut self) -> Result<bool, MachineError> {
        let i = self.last_call_frame()?;
        self.frames.truncate(i + 1);
        let frame = self.frames.pop().ok_or(MachineError::MissingFrame)?;
        self.truncate_to(&frame);
        let FrameKind::Call(cf) = frame.kind else {
            return Err(MachineError::MissingFrame);
        };
        let leaving_realm = match (&self.realm, &cf.last_realm) {
            (Some(cur), Some(prev)) => !Rc::ptr_eq(cur, prev),
            (Some(_), None) => true,
            (None, _) => false,
        };
        // While unwinding, the entry point finalizes once the panic is
        // settled.
        if leaving_realm && self.panic_state != PanicState::Panicking {
            self.finalize_realm()?;
        }
        self.package = cf.last_package;
        self.realm = cf.last_realm;
        Ok(cf.is_defer)
    }

    /// Persists the active realm's pending changes.
    pub(super) fn finalize_realm(&mut self) -> Result<(), MachineError> {
        if let Some(realm) = self.realm.clone() {
            let mut realm = realm.borrow_mut();
            if realm.has_marks() {
                realm.finalize(&mut self.heap, &mut *self.store)?;
            }
        }
        Ok(())
    }

    /// Begins unwinding with `value` in flight.
    pub(super) fn start_panic(&mut self, value: TypedValue) -> Result<(), MachineError> {
        debug!("panic: {}", value.sprint(&self.heap));
        let trace = self.trace();
        match &mut self.exception {
            Some(e) => e.value = value,
            None => self.exception = Some(Exception { value, trace }),
        }
        self.panic_state = PanicState::Panicking;
        self.unwind_to_call_frame()?;
        self.push_unwind_ops();
        Ok(())
    }

    /// Runs after a frame's defers during a panic: returns normally if one
    /// of them recovered, otherwise moves on to the caller.
    pub(super) fn op_panic2(&mut self) -> Result<(), MachineError> {
        if self.exception.is_none() {
            self.panic_state = PanicState::Normal;
            self.push_op(Op::ReturnFromBlock);
            return Ok(());
        }
        self.pop_call_frame()?;
        self.unwind_to_call_frame()?;
        self.push_unwind_ops();
        Ok(())
    }

    /// Stops a panic. Only effective in a function called directly as a
    /// deferred call while panicking; otherwise yields nil.
    pub fn recover(&mut self) -> TypedValue {
        if self.panic_state != PanicState::Panicking {
            return TypedValue::undefined();
        }
        let mut calls = self.frames.iter().rev().filter_map(|f| f.call());
        let _recover = calls.next();
        if !calls.next().is_some_and(|cf| cf.is_defer) {
            return TypedValue::undefined();
        }
        match self.exception.take() {
            Some(e) => {
                self.panic_state = PanicState::Recovered;
                e.value
            }
            None => TypedValue::undefined(),
        }
    }
}
