//! Preprocessed syntax tree consumed by the Machine.
//!
//! Every name already carries its [`ValuePath`], constants are folded into
//! [`Expr::Const`], composite literal elements are typed, and branch
//! statements know how many frames and blocks they unwind. The Machine treats
//! a node missing any of this as malformed.

use crate::virtual_machine::type_system::{Name, Type};
use crate::virtual_machine::values::TypedValue;
use gnovm_derive::BinaryCodec;
use std::fmt;
use std::rc::Rc;

pub type ExprRef = Rc<Expr>;
pub type StmtRef = Rc<Stmt>;
pub type Body = Rc<[StmtRef]>;

/// Block-relative address of a name: `depth` parent hops, then slot `index`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, BinaryCodec)]
pub struct ValuePath {
    pub depth: u16,
    pub index: u16,
}

impl ValuePath {
    pub const fn new(depth: u16, index: u16) -> Self {
        ValuePath { depth, index }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Quo,
    Rem,
    Band,
    Bor,
    Xor,
    Shl,
    Shr,
    BandNot,
    Land,
    Lor,
    Eql,
    Neq,
    Lss,
    Leq,
    Gtr,
    Geq,
}

impl BinaryOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eql
                | BinaryOp::Neq
                | BinaryOp::Lss
                | BinaryOp::Leq
                | BinaryOp::Gtr
                | BinaryOp::Geq
        )
    }

    pub fn is_shift(self) -> bool {
        matches!(self, BinaryOp::Shl | BinaryOp::Shr)
    }

    pub fn token(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Quo => "/",
            BinaryOp::Rem => "%",
            BinaryOp::Band => "&",
            BinaryOp::Bor => "|",
            BinaryOp::Xor => "^",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
            BinaryOp::BandNot => "&^",
            BinaryOp::Land => "&&",
            BinaryOp::Lor => "||",
            BinaryOp::Eql => "==",
            BinaryOp::Neq => "!=",
            BinaryOp::Lss => "<",
            BinaryOp::Leq => "<=",
            BinaryOp::Gtr => ">",
            BinaryOp::Geq => ">=",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    Pos,
    Neg,
    Not,
    Xor,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AssignOp {
    Assign,
    Define,
    /// `x op= y`
    Op(BinaryOp),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BranchOp {
    Break,
    Continue,
    Goto,
}

#[derive(Clone, Debug)]
pub enum Selector {
    /// Direct struct field, auto-dereferencing pointers.
    Field(u16),
    /// Field promoted through embedded structs.
    Promoted(Vec<u16>),
    /// Method on a declared type or pointer to one.
    Method(Name),
    /// Dynamic dispatch on an interface value.
    Interface(Name),
    /// Slot in an imported package's block.
    Package(u16),
}

#[derive(Clone, Debug)]
pub struct KeyValue {
    pub key: Option<ExprRef>,
    pub value: ExprRef,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, BinaryCodec)]
pub struct Location {
    pub pkg_path: Name,
    pub nonce: u32,
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.pkg_path, self.nonce)
    }
}

/// Static source of a function or closure body.
#[derive(Debug)]
pub struct FuncSource {
    pub loc: Location,
    pub name: Name,
    /// Signature without the receiver.
    pub typ: Type,
    /// Slot 0 of the function block holds the receiver.
    pub has_recv: bool,
    pub body: Body,
    /// Receiver, params, results and locals.
    pub num_names: u16,
}

#[derive(Debug)]
pub enum Expr {
    Name {
        name: Name,
        path: ValuePath,
    },
    Const(TypedValue),
    Binary {
        op: BinaryOp,
        left: ExprRef,
        right: ExprRef,
    },
    Unary {
        op: UnaryOp,
        x: ExprRef,
    },
    Call {
        func: ExprRef,
        args: Vec<ExprRef>,
        /// `f(xs...)`
        varg: bool,
    },
    Index {
        x: ExprRef,
        index: ExprRef,
        has_ok: bool,
    },
    Selector {
        x: ExprRef,
        sel: Selector,
    },
    Slice {
        x: ExprRef,
        low: Option<ExprRef>,
        high: Option<ExprRef>,
        max: Option<ExprRef>,
    },
    Star {
        x: ExprRef,
    },
    Ref {
        x: ExprRef,
    },
    TypeAssert {
        x: ExprRef,
        typ: Type,
        has_ok: bool,
    },
    CompositeLit {
        typ: Type,
        elts: Vec<KeyValue>,
    },
    FuncLit {
        source: Rc<FuncSource>,
    },
}

impl Expr {
    /// Type value carried by a type expression.
    pub fn as_type(&self) -> Option<&Type> {
        match self {
            Expr::Const(tv) => tv.as_type(),
            _ => None,
        }
    }

    pub fn is_call(&self) -> bool {
        matches!(self, Expr::Call { .. })
    }
}

#[derive(Debug, Clone)]
pub struct BlockStmt {
    pub body: Body,
    pub num_names: u16,
}

#[derive(Debug)]
pub struct ForStmt {
    pub init: Option<StmtRef>,
    pub cond: Option<ExprRef>,
    pub post: Option<StmtRef>,
    pub body: Body,
    pub num_names: u16,
    pub label: Option<Name>,
}

#[derive(Debug)]
pub struct RangeStmt {
    pub x: ExprRef,
    pub key: Option<ExprRef>,
    pub value: Option<ExprRef>,
    /// `for k, v := range x` defines into slots 0 and 1.
    pub define: bool,
    pub body: Body,
    pub num_names: u16,
    pub label: Option<Name>,
}

#[derive(Debug)]
pub struct SwitchClause {
    /// Empty for the default clause. Type switches list type expressions
    /// or the untyped nil constant.
    pub cases: Vec<ExprRef>,
    pub is_default: bool,
    pub body: Body,
    pub num_names: u16,
}

#[derive(Debug)]
pub struct SwitchStmt {
    pub init: Option<StmtRef>,
    /// Tag expression, or the subject of a type switch. A missing tag
    /// switches on `true`.
    pub x: Option<ExprRef>,
    pub is_type_switch: bool,
    /// Type switch binds the subject into slot 0 of each clause block.
    pub has_var: bool,
    pub clauses: Vec<SwitchClause>,
    pub num_names: u16,
    pub label: Option<Name>,
}

#[derive(Debug)]
pub struct IfStmt {
    pub init: Option<StmtRef>,
    pub cond: ExprRef,
    pub then: BlockStmt,
    pub els: Option<BlockStmt>,
    pub num_names: u16,
}

#[derive(Debug)]
pub struct BranchStmt {
    pub op: BranchOp,
    pub label: Option<Name>,
    /// Frames and blocks to pop before jumping (goto only).
    pub frame_depth: u8,
    pub block_depth: u8,
    pub body_index: usize,
}

#[derive(Debug)]
pub struct VarDecl {
    pub paths: Vec<ValuePath>,
    pub typ: Option<Type>,
    pub values: Vec<ExprRef>,
}

#[derive(Debug)]
pub struct TypeDecl {
    /// Declared type, possibly forward-declared.
    pub typ: Type,
    pub base: Type,
    pub index: u16,
}

#[derive(Debug)]
pub struct FuncDecl {
    pub source: Rc<FuncSource>,
    /// Declared receiver type and whether it is a pointer receiver.
    pub recv: Option<(Type, bool)>,
    /// Package slot; methods have none.
    pub index: Option<u16>,
    /// Body is provided by the host through the native registry.
    pub native: bool,
}

#[derive(Debug)]
pub enum Decl {
    Func(FuncDecl),
    Var(VarDecl),
    Type(TypeDecl),
}

#[derive(Debug)]
pub enum Stmt {
    Expr(ExprRef),
    Assign {
        lhs: Vec<ExprRef>,
        op: AssignOp,
        rhs: Vec<ExprRef>,
    },
    IncDec {
        x: ExprRef,
        inc: bool,
    },
    Block(BlockStmt),
    If(IfStmt),
    For(ForStmt),
    Range(RangeStmt),
    Switch(SwitchStmt),
    Branch(BranchStmt),
    Return {
        results: Vec<ExprRef>,
    },
    Defer(ExprRef),
    Decl(Decl),
    Empty,
}

#[derive(Debug)]
pub struct Import {
    pub path: Name,
    pub index: u16,
}

/// A package's top-level declarations, in execution order.
#[derive(Debug)]
pub struct PackageNode {
    pub name: Name,
    pub path: Name,
    pub num_names: u16,
    pub imports: Vec<Import>,
    pub decls: Vec<Decl>,
}

/// Every function body reachable from `node`, closures included.
pub fn collect_func_sources(node: &PackageNode) -> Vec<Rc<FuncSource>> {
    let mut out = Vec::new();
    for decl in &node.decls {
        walk_decl(decl, &mut out);
    }
    out
}

fn walk_decl(decl: &Decl, out: &mut Vec<Rc<FuncSource>>) {
    match decl {
        Decl::Func(fd) => walk_source(&fd.source, out),
        Decl::Var(vd) => vd.values.iter().for_each(|e| walk_expr(e, out)),
        Decl::Type(_) => {}
    }
}

fn walk_source(source: &Rc<FuncSource>, out: &mut Vec<Rc<FuncSource>>) {
    out.push(source.clone());
    walk_body(&source.body, out);
}

fn walk_body(body: &[StmtRef], out: &mut Vec<Rc<FuncSource>>) {
    for stmt in body {
        walk_stmt(stmt, out);
    }
}

fn walk_stmt(stmt: &Stmt, out: &mut Vec<Rc<FuncSource>>) {
    match stmt {
        Stmt::Expr(x) | Stmt::Defer(x) | Stmt::IncDec { x, .. } => walk_expr(x, out),
        Stmt::Assign { lhs, rhs, .. } => {
            lhs.iter().chain(rhs.iter()).for_each(|e| walk_expr(e, out))
        }
        Stmt::Block(b) => walk_body(&b.body, out),
        Stmt::If(s) => {
            if let Some(init) = &s.init {
                walk_stmt(init, out);
            }
            walk_expr(&s.cond, out);
            walk_body(&s.then.body, out);
            if let Some(els) = &s.els {
                walk_body(&els.body, out);
            }
        }
        Stmt::For(s) => {
            for st in s.init.iter().chain(s.post.iter()) {
                walk_stmt(st, out);
            }
            if let Some(cond) = &s.cond {
                walk_expr(cond, out);
            }
            walk_body(&s.body, out);
        }
        Stmt::Range(s) => {
            walk_expr(&s.x, out);
            walk_body(&s.body, out);
        }
        Stmt::Switch(s) => {
            if let Some(init) = &s.init {
                walk_stmt(init, out);
            }
            if let Some(x) = &s.x {
                walk_expr(x, out);
            }
            for clause in &s.clauses {
                clause.cases.iter().for_each(|c| walk_expr(c, out));
                walk_body(&clause.body, out);
            }
        }
        Stmt::Return { results } => results.iter().for_each(|e| walk_expr(e, out)),
        Stmt::Decl(d) => walk_decl(d, out),
        Stmt::Branch(_) | Stmt::Empty => {}
    }
}

fn walk_expr(expr: &Expr, out: &mut Vec<Rc<FuncSource>>) {
    match expr {
        Expr::FuncLit { source } => walk_source(source, out),
        Expr::Binary { left, right, .. } => {
            walk_expr(left, out);
            walk_expr(right, out);
        }
        Expr::Unary { x, .. }
        | Expr::Star { x }
        | Expr::Ref { x }
        | Expr::Selector { x, .. }
        | Expr::TypeAssert { x, .. } => walk_expr(x, out),
        Expr::Call { func, args, .. } => {
            walk_expr(func, out);
            args.iter().for_each(|a| walk_expr(a, out));
        }
        Expr::Index { x, index, .. } => {
            walk_expr(x, out);
            walk_expr(index, out);
        }
        Expr::Slice { x, low, high, max } => {
            walk_expr(x, out);
            for e in [low, high, max].into_iter().flatten() {
                walk_expr(e, out);
            }
        }
        Expr::CompositeLit { elts, .. } => {
            for kv in elts {
                if let Some(k) = &kv.key {
                    walk_expr(k, out);
                }
                walk_expr(&kv.value, out);
            }
        }
        Expr::Name { .. } | Expr::Const(_) => {}
    }
}

/// Constructors for preprocessed nodes. The front-end and tests build trees
/// through these.
pub mod build {
    use super::*;
    use crate::virtual_machine::type_system::FieldType;
    use num_bigint::BigInt;

    pub fn name(n: &str, depth: u16, index: u16) -> ExprRef {
        Rc::new(Expr::Name {
            name: Rc::from(n),
            path: ValuePath::new(depth, index),
        })
    }

    pub fn constant(tv: TypedValue) -> ExprRef {
        Rc::new(Expr::Const(tv))
    }

    /// Untyped integer literal.
    pub fn int(v: i64) -> ExprRef {
        constant(TypedValue::untyped_bigint(BigInt::from(v)))
    }

    pub fn typed_int(t: Type, v: i64) -> ExprRef {
        constant(TypedValue::from_int(t, v))
    }

    pub fn string(s: &str) -> ExprRef {
        constant(TypedValue::untyped_string(s))
    }

    pub fn boolean(b: bool) -> ExprRef {
        constant(TypedValue::from_bool(Type::UNTYPED_BOOL, b))
    }

    /// Untyped nil.
    pub fn nil() -> ExprRef {
        constant(TypedValue::undefined())
    }

    /// Typed nil, e.g. a nil error or nil slice.
    pub fn nil_of(t: Type) -> ExprRef {
        constant(TypedValue::nil(t))
    }

    pub fn ty(t: Type) -> ExprRef {
        constant(TypedValue::type_value(t))
    }

    pub fn binary(op: BinaryOp, left: ExprRef, right: ExprRef) -> ExprRef {
        Rc::new(Expr::Binary { op, left, right })
    }

    pub fn unary(op: UnaryOp, x: ExprRef) -> ExprRef {
        Rc::new(Expr::Unary { op, x })
    }

    pub fn call(func: ExprRef, args: Vec<ExprRef>) -> ExprRef {
        Rc::new(Expr::Call {
            func,
            args,
            varg: false,
        })
    }

    pub fn call_varg(func: ExprRef, args: Vec<ExprRef>) -> ExprRef {
        Rc::new(Expr::Call {
            func,
            args,
            varg: true,
        })
    }

    pub fn index(x: ExprRef, index: ExprRef) -> ExprRef {
        Rc::new(Expr::Index {
            x,
            index,
            has_ok: false,
        })
    }

    pub fn index_ok(x: ExprRef, index: ExprRef) -> ExprRef {
        Rc::new(Expr::Index {
            x,
            index,
            has_ok: true,
        })
    }

    pub fn field(x: ExprRef, index: u16) -> ExprRef {
        Rc::new(Expr::Selector {
            x,
            sel: Selector::Field(index),
        })
    }

    pub fn promoted(x: ExprRef, path: Vec<u16>) -> ExprRef {
        Rc::new(Expr::Selector {
            x,
            sel: Selector::Promoted(path),
        })
    }

    pub fn method(x: ExprRef, name: &str) -> ExprRef {
        Rc::new(Expr::Selector {
            x,
            sel: Selector::Method(Rc::from(name)),
        })
    }

    pub fn iface_method(x: ExprRef, name: &str) -> ExprRef {
        Rc::new(Expr::Selector {
            x,
            sel: Selector::Interface(Rc::from(name)),
        })
    }

    pub fn pkg_member(x: ExprRef, index: u16) -> ExprRef {
        Rc::new(Expr::Selector {
            x,
            sel: Selector::Package(index),
        })
    }

    pub fn slice(
        x: ExprRef,
        low: Option<ExprRef>,
        high: Option<ExprRef>,
        max: Option<ExprRef>,
    ) -> ExprRef {
        Rc::new(Expr::Slice { x, low, high, max })
    }

    pub fn star(x: ExprRef) -> ExprRef {
        Rc::new(Expr::Star { x })
    }

    pub fn addr(x: ExprRef) -> ExprRef {
        Rc::new(Expr::Ref { x })
    }

    pub fn assert(x: ExprRef, typ: Type, has_ok: bool) -> ExprRef {
        Rc::new(Expr::TypeAssert { x, typ, has_ok })
    }

    pub fn composite(typ: Type, values: Vec<ExprRef>) -> ExprRef {
        let elts = values
            .into_iter()
            .map(|value| KeyValue { key: None, value })
            .collect();
        Rc::new(Expr::CompositeLit { typ, elts })
    }

    pub fn composite_kv(typ: Type, pairs: Vec<(ExprRef, ExprRef)>) -> ExprRef {
        let elts = pairs
            .into_iter()
            .map(|(k, value)| KeyValue {
                key: Some(k),
                value,
            })
            .collect();
        Rc::new(Expr::CompositeLit { typ, elts })
    }

    pub fn func_lit(source: Rc<FuncSource>) -> ExprRef {
        Rc::new(Expr::FuncLit { source })
    }

    pub fn func_type(params: Vec<Type>, results: Vec<Type>) -> Type {
        Type::func(
            params.into_iter().map(|t| FieldType::new("", t)).collect(),
            results.into_iter().map(|t| FieldType::new("", t)).collect(),
            false,
        )
    }

    pub fn func_source(
        pkg_path: &str,
        nonce: u32,
        name: &str,
        typ: Type,
        num_names: u16,
        body: Vec<StmtRef>,
    ) -> Rc<FuncSource> {
        Rc::new(FuncSource {
            loc: Location {
                pkg_path: Rc::from(pkg_path),
                nonce,
            },
            name: Rc::from(name),
            typ,
            has_recv: false,
            body: body.into(),
            num_names,
        })
    }

    pub fn method_source(
        pkg_path: &str,
        nonce: u32,
        name: &str,
        typ: Type,
        num_names: u16,
        body: Vec<StmtRef>,
    ) -> Rc<FuncSource> {
        Rc::new(FuncSource {
            loc: Location {
                pkg_path: Rc::from(pkg_path),
                nonce,
            },
            name: Rc::from(name),
            typ,
            has_recv: true,
            body: body.into(),
            num_names,
        })
    }

    pub fn expr_stmt(x: ExprRef) -> StmtRef {
        Rc::new(Stmt::Expr(x))
    }

    pub fn assign(lhs: Vec<ExprRef>, rhs: Vec<ExprRef>) -> StmtRef {
        Rc::new(Stmt::Assign {
            lhs,
            op: AssignOp::Assign,
            rhs,
        })
    }

    pub fn define(lhs: Vec<ExprRef>, rhs: Vec<ExprRef>) -> StmtRef {
        Rc::new(Stmt::Assign {
            lhs,
            op: AssignOp::Define,
            rhs,
        })
    }

    pub fn op_assign(op: BinaryOp, lhs: ExprRef, rhs: ExprRef) -> StmtRef {
        Rc::new(Stmt::Assign {
            lhs: vec![lhs],
            op: AssignOp::Op(op),
            rhs: vec![rhs],
        })
    }

    pub fn inc(x: ExprRef) -> StmtRef {
        Rc::new(Stmt::IncDec { x, inc: true })
    }

    pub fn dec(x: ExprRef) -> StmtRef {
        Rc::new(Stmt::IncDec { x, inc: false })
    }

    /// `if init; cond {}` with the init scope holding `num_names` slots.
    pub fn if_init(
        init: StmtRef,
        cond: ExprRef,
        num_names: u16,
        then: Vec<StmtRef>,
        els: Option<Vec<StmtRef>>,
    ) -> StmtRef {
        Rc::new(Stmt::If(IfStmt {
            init: Some(init),
            cond,
            then: BlockStmt {
                body: then.into(),
                num_names: 0,
            },
            els: els.map(|body| BlockStmt {
                body: body.into(),
                num_names: 0,
            }),
            num_names,
        }))
    }

    pub fn block(num_names: u16, body: Vec<StmtRef>) -> StmtRef {
        Rc::new(Stmt::Block(BlockStmt {
            body: body.into(),
            num_names,
        }))
    }

    pub fn if_else(
        cond: ExprRef,
        then: Vec<StmtRef>,
        els: Option<Vec<StmtRef>>,
    ) -> StmtRef {
        Rc::new(Stmt::If(IfStmt {
            init: None,
            cond,
            then: BlockStmt {
                body: then.into(),
                num_names: 0,
            },
            els: els.map(|body| BlockStmt {
                body: body.into(),
                num_names: 0,
            }),
            num_names: 0,
        }))
    }

    pub fn for_loop(
        init: Option<StmtRef>,
        cond: Option<ExprRef>,
        post: Option<StmtRef>,
        num_names: u16,
        body: Vec<StmtRef>,
    ) -> StmtRef {
        Rc::new(Stmt::For(ForStmt {
            init,
            cond,
            post,
            body: body.into(),
            num_names,
            label: None,
        }))
    }

    pub fn labeled_for(
        label: &str,
        cond: Option<ExprRef>,
        post: Option<StmtRef>,
        num_names: u16,
        body: Vec<StmtRef>,
    ) -> StmtRef {
        Rc::new(Stmt::For(ForStmt {
            init: None,
            cond,
            post,
            body: body.into(),
            num_names,
            label: Some(Rc::from(label)),
        }))
    }

    /// `for k, v = range x` assigning into existing locations.
    pub fn range_assign(
        x: ExprRef,
        key: Option<ExprRef>,
        value: Option<ExprRef>,
        body: Vec<StmtRef>,
    ) -> StmtRef {
        Rc::new(Stmt::Range(RangeStmt {
            x,
            key,
            value,
            define: false,
            body: body.into(),
            num_names: 0,
            label: None,
        }))
    }

    /// `for k, v := range x` with key and value in slots 0 and 1.
    pub fn range_define(
        x: ExprRef,
        key: bool,
        value: bool,
        num_names: u16,
        body: Vec<StmtRef>,
    ) -> StmtRef {
        Rc::new(Stmt::Range(RangeStmt {
            x,
            key: key.then(|| name("k", 0, 0)),
            value: value.then(|| name("v", 0, 1)),
            define: true,
            body: body.into(),
            num_names,
            label: None,
        }))
    }

    pub fn switch(
        x: Option<ExprRef>,
        clauses: Vec<SwitchClause>,
        num_names: u16,
    ) -> StmtRef {
        Rc::new(Stmt::Switch(SwitchStmt {
            init: None,
            x,
            is_type_switch: false,
            has_var: false,
            clauses,
            num_names,
            label: None,
        }))
    }

    pub fn type_switch(x: ExprRef, has_var: bool, clauses: Vec<SwitchClause>) -> StmtRef {
        Rc::new(Stmt::Switch(SwitchStmt {
            init: None,
            x: Some(x),
            is_type_switch: true,
            has_var,
            clauses,
            num_names: 0,
            label: None,
        }))
    }

    pub fn case(cases: Vec<ExprRef>, num_names: u16, body: Vec<StmtRef>) -> SwitchClause {
        SwitchClause {
            cases,
            is_default: false,
            body: body.into(),
            num_names,
        }
    }

    pub fn default_case(num_names: u16, body: Vec<StmtRef>) -> SwitchClause {
        SwitchClause {
            cases: Vec::new(),
            is_default: true,
            body: body.into(),
            num_names,
        }
    }

    pub fn brk(label: Option<&str>) -> StmtRef {
        branch(BranchOp::Break, label)
    }

    pub fn cont(label: Option<&str>) -> StmtRef {
        branch(BranchOp::Continue, label)
    }

    fn branch(op: BranchOp, label: Option<&str>) -> StmtRef {
        Rc::new(Stmt::Branch(BranchStmt {
            op,
            label: label.map(Rc::from),
            frame_depth: 0,
            block_depth: 0,
            body_index: 0,
        }))
    }

    pub fn goto(frame_depth: u8, block_depth: u8, body_index: usize) -> StmtRef {
        Rc::new(Stmt::Branch(BranchStmt {
            op: BranchOp::Goto,
            label: None,
            frame_depth,
            block_depth,
            body_index,
        }))
    }

    pub fn ret(results: Vec<ExprRef>) -> StmtRef {
        Rc::new(Stmt::Return { results })
    }

    pub fn defer(call: ExprRef) -> StmtRef {
        Rc::new(Stmt::Defer(call))
    }

    pub fn var(paths: Vec<ValuePath>, typ: Option<Type>, values: Vec<ExprRef>) -> Decl {
        Decl::Var(VarDecl {
            paths,
            typ,
            values,
        })
    }

    pub fn var_stmt(paths: Vec<ValuePath>, typ: Option<Type>, values: Vec<ExprRef>) -> StmtRef {
        Rc::new(Stmt::Decl(var(paths, typ, values)))
    }

    pub fn func_decl(source: Rc<FuncSource>, index: u16) -> Decl {
        Decl::Func(FuncDecl {
            source,
            recv: None,
            index: Some(index),
            native: false,
        })
    }

    /// Declaration whose body is looked up in the native registry.
    pub fn native_func_decl(pkg_path: &str, name: &str, typ: Type, index: u16) -> Decl {
        let num_names = typ
            .as_func()
            .map_or(0, |ft| (ft.params.len() + ft.results.len()) as u16);
        Decl::Func(FuncDecl {
            source: func_source(pkg_path, 0, name, typ, num_names, vec![]),
            recv: None,
            index: Some(index),
            native: true,
        })
    }

    pub fn method_decl(source: Rc<FuncSource>, recv: Type, ptr: bool) -> Decl {
        Decl::Func(FuncDecl {
            source,
            recv: Some((recv, ptr)),
            index: None,
            native: false,
        })
    }

    pub fn type_decl(typ: Type, base: Type, index: u16) -> Decl {
        Decl::Type(TypeDecl { typ, base, index })
    }

    pub fn package(path: &str, name: &str, num_names: u16, decls: Vec<Decl>) -> PackageNode {
        PackageNode {
            name: Rc::from(name),
            path: Rc::from(path),
            num_names,
            imports: Vec::new(),
            decls,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::build::*;
    use super::*;

    #[test]
    fn collects_nested_closures() {
        let inner = func_source("pkg", 2, "lit", func_type(vec![], vec![]), 0, vec![]);
        let outer = func_source(
            "pkg",
            1,
            "f",
            func_type(vec![], vec![]),
            1,
            vec![define(vec![name("g", 0, 0)], vec![func_lit(inner.clone())])],
        );
        let node = package("pkg", "pkg", 1, vec![func_decl(outer.clone(), 0)]);
        let sources = collect_func_sources(&node);
        assert_eq!(sources.len(), 2);
        assert!(Rc::ptr_eq(&sources[0], &outer));
        assert!(Rc::ptr_eq(&sources[1], &inner));
    }

    #[test]
    fn location_display() {
        let loc = Location {
            pkg_path: Rc::from("gno.land/r/demo"),
            nonce: 7,
        };
        assert_eq!(loc.to_string(), "gno.land/r/demo#7");
    }

    #[test]
    fn type_expressions() {
        assert_eq!(ty(Type::INT).as_type(), Some(&Type::INT));
        assert!(int(1).as_type().is_none());
        assert!(call(name("f", 0, 0), vec![]).is_call());
        assert!(BinaryOp::Leq.is_comparison());
        assert_eq!(BinaryOp::BandNot.token(), "&^");
    }
}
