use super::{Fault, FrameKind, Machine, Op};
use crate::virtual_machine::ast::{
    AssignOp, BinaryOp, Body, BranchOp, BranchStmt, Decl, Expr, Stmt, StmtRef, SwitchStmt,
    TypeDecl, VarDecl,
};
use crate::virtual_machine::errors::MachineError;
use crate::virtual_machine::type_system::{Kind, Name, Type};
use crate::virtual_machine::values::{Block, BlockSource, ObjRef, TypedValue, Value};

impl Machine<'_> {
    pub(super) fn op_exec(&mut self, stmt: StmtRef) -> Result<(), MachineError> {
        match &*stmt {
            Stmt::Expr(x) => {
                self.push_op(Op::PopValues(self.values.len()));
                self.push_op(Op::Eval(x.clone()));
            }
            Stmt::Assign { lhs, op, rhs } => match op {
                AssignOp::Assign | AssignOp::Define => {
                    self.push_op(Op::Assign(lhs.len()));
                    for x in lhs.iter().rev() {
                        self.push_target(x)?;
                    }
                    for x in rhs.iter().rev() {
                        self.push_op(Op::Eval(x.clone()));
                    }
                }
                AssignOp::Op(bop) => {
                    let (Some(x), Some(y)) = (lhs.first(), rhs.first()) else {
                        return Err(MachineError::malformed("empty assignment"));
                    };
                    self.push_op(Op::OpAssign(*bop));
                    self.push_target(x)?;
                    self.push_op(Op::Eval(y.clone()));
                }
            },
            Stmt::IncDec { x, inc } => {
                self.push_op(Op::IncDec(*inc));
                self.push_target(x)?;
            }
            Stmt::Block(b) => {
                self.push_body_block(BlockSource::Local, b.num_names, &b.body)?;
            }
            Stmt::If(s) => {
                if s.init.is_some() || s.num_names > 0 {
                    self.push_block(BlockSource::Local, s.num_names as usize)?;
                    self.push_op(Op::PopBlock);
                }
                self.push_op(Op::IfCond(stmt.clone()));
                self.push_op(Op::Eval(s.cond.clone()));
                if let Some(init) = &s.init {
                    self.push_op(Op::Exec(init.clone()));
                }
            }
            Stmt::For(s) => {
                self.push_frame(FrameKind::For, s.label.clone());
                let b = self.push_block(BlockSource::Local, s.num_names as usize)?;
                self.push_op(Op::PopFrameAndReset);
                self.push_op(Op::ForLoop);
                let (num_ops, num_values) = (self.ops.len(), self.values.len());
                let state = &mut self.block_mut(b)?.body;
                state.body = Some(s.body.clone());
                state.cond = s.cond.clone();
                state.post = s.post.clone();
                state.num_ops = num_ops;
                state.num_values = num_values;
                if let Some(init) = &s.init {
                    self.push_op(Op::Exec(init.clone()));
                }
            }
            Stmt::Range(s) => {
                self.push_frame(FrameKind::Range, s.label.clone());
                let b = self.push_block(BlockSource::Local, s.num_names as usize)?;
                self.push_op(Op::PopFrameAndReset);
                self.push_op(Op::RangeIter);
                let (num_ops, num_values) = (self.ops.len(), self.values.len() + 1);
                let state = &mut self.block_mut(b)?.body;
                state.body = Some(s.body.clone());
                state.key = s.key.clone();
                state.value = s.value.clone();
                state.define = s.define;
                state.num_ops = num_ops;
                state.num_values = num_values;
                self.push_op(Op::Eval(s.x.clone()));
            }
            Stmt::Switch(s) => {
                self.push_frame(FrameKind::Switch, s.label.clone());
                self.push_block(BlockSource::Local, s.num_names as usize)?;
                self.push_op(Op::PopFrameAndReset);
                self.push_op(Op::SwitchTag(stmt.clone()));
                match &s.x {
                    Some(x) => self.push_op(Op::Eval(x.clone())),
                    None => self.push_value(TypedValue::boolean(true)),
                }
                if let Some(init) = &s.init {
                    self.push_op(Op::Exec(init.clone()));
                }
            }
            Stmt::Branch(b) => self.exec_branch(b)?,
            Stmt::Return { results } => self.exec_return(results)?,
            Stmt::Defer(call) => {
                let Expr::Call { func, .. } = &**call else {
                    return Err(MachineError::malformed("defer of a non-call"));
                };
                self.push_op(Op::CallArgs(call.clone(), true));
                self.push_op(Op::Eval(func.clone()));
            }
            Stmt::Decl(Decl::Var(vd)) => {
                if vd.values.is_empty() {
                    let res = self.assign_var_decl(vd, Vec::new());
                    try_panic!(self, res);
                } else {
                    self.push_op(Op::VarDecl(stmt.clone()));
                    for x in vd.values.iter().rev() {
                        self.push_op(Op::Eval(x.clone()));
                    }
                }
            }
            Stmt::Decl(Decl::Type(td)) => {
                let block = self.last_block()?;
                self.declare_type(block, td)?;
            }
            Stmt::Decl(Decl::Func(fd)) => {
                return Err(MachineError::malformed(format!(
                    "function {} declared inside a body",
                    fd.source.name
                )));
            }
            Stmt::Empty => {}
        }
        Ok(())
    }

    /// Opens a block for `body` and schedules its statements.
    pub(super) fn push_body_block(
        &mut self,
        source: BlockSource,
        num_names: u16,
        body: &Body,
    ) -> Result<ObjRef, MachineError> {
        let b = self.push_block(source, num_names as usize)?;
        self.push_op(Op::PopBlock);
        self.start_body(b, body.clone())?;
        Ok(b)
    }

    /// Schedules `body` to run inside block `b`, which must be current.
    pub(super) fn start_body(&mut self, b: ObjRef, body: Body) -> Result<(), MachineError> {
        self.push_op(Op::Body);
        let (num_ops, num_values) = (self.ops.len(), self.values.len());
        let state = &mut self.block_mut(b)?.body;
        state.body = Some(body);
        state.next_index = 0;
        state.num_ops = num_ops;
        state.num_values = num_values;
        Ok(())
    }

    pub(super) fn block_mut(
        &mut self,
        b: ObjRef,
    ) -> Result<&mut Block, MachineError> {
        self.heap
            .block_mut(b)
            .ok_or_else(|| MachineError::unexpected("block", b))
    }

    /// Runs the next statement of the innermost block's body.
    pub(super) fn op_body(&mut self) -> Result<(), MachineError> {
        let b = self.last_block()?;
        let state = &mut self.block_mut(b)?.body;
        let next = usize::try_from(state.next_index)
            .ok()
            .and_then(|i| state.body.as_ref().and_then(|body| body.get(i).cloned()));
        match next {
            Some(stmt) => {
                state.next_index += 1;
                self.push_op(Op::Exec(stmt));
            }
            None => {
                self.pop_op()?;
            }
        }
        Ok(())
    }

    /// Drives a `for` loop: condition, body statements, post statement.
    pub(super) fn op_for_loop(&mut self) -> Result<(), MachineError> {
        let b = self.last_block()?;
        let state = &mut self.block_mut(b)?.body;
        let len = state.body_len() as isize;
        match state.next_index {
            -2 => match state.cond.clone() {
                Some(cond) => {
                    state.next_index = -1;
                    self.push_op(Op::Eval(cond));
                }
                None => state.next_index = 0,
            },
            -1 => {
                state.next_index = 0;
                let cond = self.pop_value()?;
                if !cond.get_bool() {
                    self.pop_op()?;
                }
            }
            i if i < len => {
                state.next_index += 1;
                let stmt = state
                    .body
                    .as_ref()
                    .and_then(|body| body.get(i as usize).cloned())
                    .ok_or_else(|| MachineError::malformed("loop body index"))?;
                self.push_op(Op::Exec(stmt));
            }
            _ => {
                state.next_index = -2;
                if let Some(post) = state.post.clone() {
                    self.push_op(Op::Exec(post));
                }
            }
        }
        Ok(())
    }

    /// Drives a `range` loop. The ranged value sits on the value stack just
    /// below the loop's working values.
    pub(super) fn op_range_iter(&mut self) -> Result<(), MachineError> {
        let b = self.last_block()?;
        let len = self.block_mut(b)?.body.body_len() as isize;
        let next_index = self.block_mut(b)?.body.next_index;
        if next_index == -2 {
            let x = self.peek_value()?.clone();
            let list_len = match &x.v {
                Value::Array(r) => self.heap.array_list(*r).len(),
                Value::Slice(s) => s.length,
                Value::String(s) => s.len(),
                Value::Pointer(p) if x.kind() == Kind::Pointer => {
                    match self.heap.get(p.base).slot(p.index).map(|tv| &tv.v) {
                        Some(Value::Array(r)) => self.heap.array_list(*r).len(),
                        _ => return Err(MachineError::unexpected("pointer to array", x.kind())),
                    }
                }
                Value::Map(_) | Value::None => 0,
                _ => return Err(MachineError::unexpected("rangeable value", x.kind())),
            };
            let first = match &x.v {
                Value::Map(r) => self.heap.map(*r).and_then(|m| m.first()),
                _ => None,
            };
            let state = &mut self.block_mut(b)?.body;
            state.list_len = list_len;
            state.list_index = 0;
            state.str_index = 0;
            state.next_item = first;
            state.next_index = len;
            return Ok(());
        }
        if next_index >= 0 && next_index < len {
            let state = &mut self.block_mut(b)?.body;
            state.next_index += 1;
            let stmt = state
                .body
                .as_ref()
                .and_then(|body| body.get(next_index as usize).cloned())
                .ok_or_else(|| MachineError::malformed("range body index"))?;
            self.push_op(Op::Exec(stmt));
            return Ok(());
        }

        let x = self.peek_value()?.clone();
        let Some((key, value)) = self.range_next(b, &x)? else {
            self.pop_op()?;
            return Ok(());
        };
        let state = &mut self.block_mut(b)?.body;
        state.next_index = 0;
        let (kx, vx) = (state.key.clone(), state.value.clone());

        let mut n = 0;
        if let Some(kx) = &kx {
            self.push_value(key);
            n += 1;
            if let Some(vx) = &vx {
                self.push_value(value);
                n += 1;
                self.push_op(Op::Assign(n));
                self.push_target(vx)?;
            } else {
                self.push_op(Op::Assign(n));
            }
            self.push_target(kx)?;
        } else if let Some(vx) = &vx {
            self.push_value(value);
            self.push_op(Op::Assign(1));
            self.push_target(vx)?;
        }
        Ok(())
    }

    /// Advances the range cursor kept in block `b`.
    fn range_next(
        &mut self,
        b: ObjRef,
        x: &TypedValue,
    ) -> Result<Option<(TypedValue, TypedValue)>, MachineError> {
        let (list_len, list_index, str_index, next_item) = {
            let s = &self.block_mut(b)?.body;
            (s.list_len, s.list_index, s.str_index, s.next_item)
        };
        match &x.v {
            Value::String(s) => {
                let Some(c) = s.get(str_index..).and_then(|rest| rest.chars().next()) else {
                    return Ok(None);
                };
                self.block_mut(b)?.body.str_index = str_index + c.len_utf8();
                Ok(Some((
                    TypedValue::int(str_index as i64),
                    TypedValue::from_int(Type::INT32, c as i64),
                )))
            }
            Value::Map(r) => {
                let Some(map) = self.heap.map(*r) else {
                    return Ok(None);
                };
                let mut cursor = next_item;
                while let Some(i) = cursor {
                    if map.is_live(i) {
                        break;
                    }
                    cursor = map.next_of(i);
                }
                let Some(i) = cursor else {
                    return Ok(None);
                };
                let item = map.item(i);
                let pair = (item.key.clone(), item.value.clone());
                let next = map.next_of(i);
                self.block_mut(b)?.body.next_item = next;
                Ok(Some(pair))
            }
            Value::None => Ok(None),
            _ => {
                if list_index >= list_len {
                    return Ok(None);
                }
                let elem = self.list_elem(x, list_index)?;
                self.block_mut(b)?.body.list_index = list_index + 1;
                Ok(Some((TypedValue::int(list_index as i64), elem)))
            }
        }
    }

    /// Element `i` of an array, slice or pointer to array.
    fn list_elem(&self, x: &TypedValue, i: usize) -> Result<TypedValue, MachineError> {
        let (base, offset) = match &x.v {
            Value::Array(r) => (*r, 0),
            Value::Slice(s) => (s.base, s.offset),
            Value::Pointer(p) => match self.heap.get(p.base).slot(p.index).map(|tv| &tv.v) {
                Some(Value::Array(r)) => (*r, 0),
                _ => return Err(MachineError::unexpected("pointer to array", x.kind())),
            },
            _ => return Err(MachineError::unexpected("list", x.kind())),
        };
        self.heap
            .array_list(base)
            .get(offset + i)
            .cloned()
            .ok_or_else(|| MachineError::malformed("range past backing array"))
    }

    pub(super) fn op_if_cond(&mut self, stmt: StmtRef) -> Result<(), MachineError> {
        let Stmt::If(s) = &*stmt else {
            return Err(MachineError::unexpected("if statement", &*stmt));
        };
        let cond = self.pop_value()?;
        let branch = if cond.get_bool() {
            Some(&s.then)
        } else {
            s.els.as_ref()
        };
        if let Some(b) = branch {
            self.push_body_block(BlockSource::Local, b.num_names, &b.body)?;
        }
        Ok(())
    }

    pub(super) fn op_switch_tag(&mut self, stmt: StmtRef) -> Result<(), MachineError> {
        let s = switch_of(&stmt)?;
        if s.is_type_switch {
            let tag = self.pop_value()?;
            let mut default = None;
            let mut chosen = None;
            'clauses: for (ci, clause) in s.clauses.iter().enumerate() {
                if clause.is_default {
                    default = Some(ci);
                    continue;
                }
                for case in &clause.cases {
                    if type_case_matches(case, &tag) {
                        chosen = Some(ci);
                        break 'clauses;
                    }
                }
            }
            if let Some(ci) = chosen.or(default) {
                let bind = s.has_var.then_some(tag);
                self.enter_clause(s, ci, bind)?;
            }
            return Ok(());
        }
        self.next_switch_case(&stmt, s, 0, 0)
    }

    /// The tag is on the value stack, the case value above it.
    pub(super) fn op_switch_case(
        &mut self,
        stmt: StmtRef,
        clause: usize,
        case: usize,
    ) -> Result<(), MachineError> {
        let s = switch_of(&stmt)?;
        let v = self.pop_value()?;
        let tag = self.peek_value()?.clone();
        let res = self.binary_op(BinaryOp::Eql, tag, v);
        let equal = try_panic!(self, res).get_bool();
        if equal {
            self.pop_value()?;
            return self.enter_clause(s, clause, None);
        }
        self.next_switch_case(&stmt, s, clause, case + 1)
    }

    /// Schedules the comparison against the first case at or after
    /// (`clause`, `case`), or takes the default when none is left.
    fn next_switch_case(
        &mut self,
        stmt: &StmtRef,
        s: &SwitchStmt,
        clause: usize,
        case: usize,
    ) -> Result<(), MachineError> {
        let (mut ci, mut k) = (clause, case);
        while let Some(c) = s.clauses.get(ci) {
            if let Some(x) = c.cases.get(k).filter(|_| !c.is_default) {
                self.push_op(Op::SwitchCase(stmt.clone(), ci, k));
                self.push_op(Op::Eval(x.clone()));
                return Ok(());
            }
            ci += 1;
            k = 0;
        }
        self.pop_value()?;
        if let Some(ci) = s.clauses.iter().position(|c| c.is_default) {
            self.enter_clause(s, ci, None)?;
        }
        Ok(())
    }

    fn enter_clause(
        &mut self,
        s: &SwitchStmt,
        ci: usize,
        bind: Option<TypedValue>,
    ) -> Result<(), MachineError> {
        let clause = s
            .clauses
            .get(ci)
            .ok_or_else(|| MachineError::malformed("switch clause index"))?;
        let b = self.push_body_block(BlockSource::Local, clause.num_names, &clause.body)?;
        if let Some(tag) = bind {
            let tag = self.heap.copy_value(&mut self.alloc, tag)?;
            let slot = self
                .block_mut(b)?
                .values
                .get_mut(0)
                .ok_or_else(|| MachineError::malformed("type switch clause without a slot"))?;
            *slot = tag;
        }
        Ok(())
    }

    fn exec_branch(&mut self, b: &BranchStmt) -> Result<(), MachineError> {
        match b.op {
            BranchOp::Break => {
                let fi = self.find_branch_frame(b.label.as_ref(), true)?;
                self.frames.truncate(fi + 1);
                self.op_pop_frame_and_reset()
            }
            BranchOp::Continue => {
                let fi = self.find_branch_frame(b.label.as_ref(), false)?;
                self.frames.truncate(fi + 1);
                let frame = self.frames[fi].clone();
                let extra = matches!(frame.kind, FrameKind::Range) as usize;
                self.ops.truncate(frame.num_ops + 2);
                self.values.truncate(frame.num_values + extra);
                self.blocks.truncate(frame.num_blocks + 1);
                self.targets.truncate(frame.num_targets);
                let lb = self.last_block()?;
                let state = &mut self.block_mut(lb)?.body;
                state.next_index = state.body_len() as isize;
                Ok(())
            }
            BranchOp::Goto => {
                for _ in 0..b.frame_depth {
                    self.frames.pop().ok_or(MachineError::MissingFrame)?;
                }
                for _ in 0..b.block_depth {
                    self.blocks.pop().ok_or(MachineError::StackUnderflow("block"))?;
                }
                let lb = self.last_block()?;
                let (num_ops, num_values) = {
                    let state = &self.block_mut(lb)?.body;
                    (state.num_ops, state.num_values)
                };
                self.ops.truncate(num_ops);
                self.values.truncate(num_values);
                self.block_mut(lb)?.body.next_index = b.body_index as isize;
                Ok(())
            }
        }
    }

    /// Innermost loop (or switch, for `break`) frame matching `label`,
    /// searched within the current call.
    fn find_branch_frame(
        &self,
        label: Option<&Name>,
        allow_switch: bool,
    ) -> Result<usize, MachineError> {
        for (i, frame) in self.frames.iter().enumerate().rev() {
            let kind_ok = match frame.kind {
                FrameKind::Call(_) => break,
                FrameKind::For | FrameKind::Range => true,
                FrameKind::Switch => allow_switch,
            };
            match label {
                Some(l) if frame.label.as_ref() == Some(l) => {
                    if kind_ok {
                        return Ok(i);
                    }
                    return Err(MachineError::malformed(format!("cannot continue {}", l)));
                }
                Some(_) => {}
                None if kind_ok => return Ok(i),
                None => {}
            }
        }
        Err(MachineError::malformed(match label {
            Some(l) => format!("no enclosing statement labeled {}", l),
            None => "branch outside a loop".to_string(),
        }))
    }

    pub(super) fn op_var_decl(&mut self, stmt: StmtRef) -> Result<(), MachineError> {
        let Stmt::Decl(Decl::Var(vd)) = &*stmt else {
            return Err(MachineError::unexpected("var declaration", &*stmt));
        };
        let values = self.pop_values(vd.paths.len())?;
        let res = self.assign_var_decl(vd, values);
        try_panic!(self, res);
        Ok(())
    }

    /// Binds declared variables relative to the innermost block. Without
    /// values every variable gets its type's zero value.
    pub(super) fn assign_var_decl(
        &mut self,
        vd: &VarDecl,
        values: Vec<TypedValue>,
    ) -> Result<(), Fault> {
        let values = if values.is_empty() {
            let t = vd
                .typ
                .as_ref()
                .ok_or_else(|| MachineError::malformed("var without type or value"))?;
            let mut zeros = Vec::with_capacity(vd.paths.len());
            for _ in &vd.paths {
                zeros.push(self.heap.zero_value(&mut self.alloc, t)?);
            }
            zeros
        } else {
            if values.len() != vd.paths.len() {
                return Err(MachineError::malformed(format!(
                    "{} values for {} variables",
                    values.len(),
                    vd.paths.len()
                ))
                .into());
            }
            let mut converted = Vec::with_capacity(values.len());
            for v in values {
                converted.push(match &vd.typ {
                    Some(t) => self.assignable(v, t)?,
                    None => self.default_value(v)?,
                });
            }
            converted
        };
        for (path, v) in vd.paths.iter().zip(values) {
            let base = self.block_at(path.depth)?;
            if let (Some(t), Some(block)) = (&vd.typ, self.heap.block_mut(base)) {
                block.declare_static(path.index as usize, t);
            }
            self.set_slot(base, path.index as usize, v)?;
        }
        Ok(())
    }

    /// Completes a declared type and binds it in `block`.
    pub(super) fn declare_type(&mut self, block: ObjRef, td: &TypeDecl) -> Result<(), MachineError> {
        let dt = td
            .typ
            .as_declared()
            .ok_or_else(|| MachineError::unexpected("declared type", &td.typ))?;
        if dt.base().is_none() {
            dt.set_base(td.base.clone())?;
        }
        self.set_slot(block, td.index as usize, TypedValue::type_value(td.typ.clone()))
    }
}

fn switch_of(stmt: &StmtRef) -> Result<&SwitchStmt, MachineError> {
    match &**stmt {
        Stmt::Switch(s) => Ok(s),
        other => Err(MachineError::unexpected("switch statement", other)),
    }
}

/// Reports whether a type switch case (a type, or the nil constant) matches
/// the subject's dynamic type.
fn type_case_matches(case: &Expr, tag: &TypedValue) -> bool {
    let nil_subject = tag.is_undefined() || (tag.kind() == Kind::Interface && tag.is_nil());
    match case {
        Expr::Const(tv) => match tv.as_type() {
            Some(t) if t.is_interface() => {
                !nil_subject && tag.t.as_ref().is_some_and(|tt| t.is_implemented_by(tt))
            }
            Some(t) => !nil_subject && tag.t.as_ref() == Some(t),
            None => tv.is_undefined() && nil_subject,
        },
        _ => false,
    }
}
