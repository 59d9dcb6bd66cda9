use super::Machine;
use crate::virtual_machine::ast::{BinaryOp, ExprRef, StmtRef, UnaryOp, ValuePath};
use crate::virtual_machine::errors::MachineError;
use crate::virtual_machine::type_system::Type;

/// A unit of scheduled work.
///
/// Sticky ops ([`Op::Body`], [`Op::ForLoop`], [`Op::RangeIter`],
/// [`Op::ReturnCallDefers`]) stay on the operation stack across steps and
/// pop themselves once their block, loop or defer list is exhausted.
#[derive(Clone, Debug)]
pub enum Op {
    // Sticky
    Body,
    ForLoop,
    RangeIter,
    ReturnCallDefers,

    // Statements
    Exec(StmtRef),
    PopBlock,
    PopFrameAndReset,
    /// Truncates the value stack, discarding an expression statement's results.
    PopValues(usize),
    IfCond(StmtRef),
    SwitchTag(StmtRef),
    /// Compares the tag with case `.2` of clause `.1`.
    SwitchCase(StmtRef, usize, usize),
    Assign(usize),
    OpAssign(BinaryOp),
    IncDec(bool),
    VarDecl(StmtRef),
    /// Captures the callee and arguments above value stack index `.0`.
    Defer(usize, bool),

    // Calls and unwinding
    CallArgs(ExprRef, bool),
    Precall(usize, bool),
    CallNative,
    Return,
    ReturnFromBlock,
    ReturnToBlock,
    Panic2,

    // Expressions
    Eval(ExprRef),
    Binary(BinaryOp),
    Unary(UnaryOp),
    Land(ExprRef),
    Lor(ExprRef),
    Convert(Type),
    Index(bool),
    Selector(ExprRef),
    Slice(ExprRef),
    Star,
    Ref,
    RefValue,
    TypeAssert(ExprRef),
    CompositeLit(ExprRef),

    // Assignment targets
    TargetName(ValuePath),
    TargetBlank,
    TargetIndex,
    TargetSelector(ExprRef),
    TargetStar,
}

impl Op {
    pub fn is_sticky(&self) -> bool {
        matches!(
            self,
            Op::Body | Op::ForLoop | Op::RangeIter | Op::ReturnCallDefers
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Op::Body => "Body",
            Op::ForLoop => "ForLoop",
            Op::RangeIter => "RangeIter",
            Op::ReturnCallDefers => "ReturnCallDefers",
            Op::Exec(_) => "Exec",
            Op::PopBlock => "PopBlock",
            Op::PopFrameAndReset => "PopFrameAndReset",
            Op::PopValues(_) => "PopValues",
            Op::IfCond(_) => "IfCond",
            Op::SwitchTag(_) => "SwitchTag",
            Op::SwitchCase(..) => "SwitchCase",
            Op::Assign(_) => "Assign",
            Op::OpAssign(_) => "OpAssign",
            Op::IncDec(_) => "IncDec",
            Op::VarDecl(_) => "VarDecl",
            Op::Defer(..) => "Defer",
            Op::CallArgs(..) => "CallArgs",
            Op::Precall(..) => "Precall",
            Op::CallNative => "CallNative",
            Op::Return => "Return",
            Op::ReturnFromBlock => "ReturnFromBlock",
            Op::ReturnToBlock => "ReturnToBlock",
            Op::Panic2 => "Panic2",
            Op::Eval(_) => "Eval",
            Op::Binary(_) => "Binary",
            Op::Unary(_) => "Unary",
            Op::Land(_) => "Land",
            Op::Lor(_) => "Lor",
            Op::Convert(_) => "Convert",
            Op::Index(_) => "Index",
            Op::Selector(_) => "Selector",
            Op::Slice(_) => "Slice",
            Op::Star => "Star",
            Op::Ref => "Ref",
            Op::RefValue => "RefValue",
            Op::TypeAssert(_) => "TypeAssert",
            Op::CompositeLit(_) => "CompositeLit",
            Op::TargetName(_) => "TargetName",
            Op::TargetBlank => "TargetBlank",
            Op::TargetIndex => "TargetIndex",
            Op::TargetSelector(_) => "TargetSelector",
            Op::TargetStar => "TargetStar",
        }
    }
}

/// Dispatches an [`Op`] to its `op_*` handler, binding the variant's fields
/// as the handler's arguments.
macro_rules! exec_op {
    (
        m = $m:ident,
        op = $op:ident,
        { $( $variant:ident => $handler:ident ( $( $field:ident ),* ) ),* $(,)? }
    ) => {{
        match $op {
            $( exec_op!(@pat $variant ( $( $field ),* )) => $m.$handler( $( $field ),* ), )*
        }
    }};

    (@pat $variant:ident ()) => { Op::$variant };
    (@pat $variant:ident ( $( $field:ident ),+ )) => { Op::$variant( $( $field ),+ ) };
}

impl Machine<'_> {
    pub(super) fn exec_op(&mut self, op: Op) -> Result<(), MachineError> {
        exec_op! {
            m = self,
            op = op,
            {
                // Sticky
                Body => op_body(),
                ForLoop => op_for_loop(),
                RangeIter => op_range_iter(),
                ReturnCallDefers => op_return_call_defers(),

                // Statements
                Exec => op_exec(stmt),
                PopBlock => op_pop_block(),
                PopFrameAndReset => op_pop_frame_and_reset(),
                PopValues => op_pop_values(depth),
                IfCond => op_if_cond(stmt),
                SwitchTag => op_switch_tag(stmt),
                SwitchCase => op_switch_case(stmt, clause, case),
                Assign => op_assign(n),
                OpAssign => op_op_assign(bop),
                IncDec => op_inc_dec(inc),
                VarDecl => op_var_decl(stmt),
                Defer => op_defer(base, varg),

                // Calls and unwinding
                CallArgs => op_call_args(call, is_defer),
                Precall => op_precall(base, varg),
                CallNative => op_call_native(),
                Return => op_return(),
                ReturnFromBlock => op_return_from_block(),
                ReturnToBlock => op_return_to_block(),
                Panic2 => op_panic2(),

                // Expressions
                Eval => op_eval(expr),
                Binary => op_binary(bop),
                Unary => op_unary(uop),
                Land => op_land(right),
                Lor => op_lor(right),
                Convert => op_convert(t),
                Index => op_index(has_ok),
                Selector => op_selector(expr),
                Slice => op_slice(expr),
                Star => op_star(),
                Ref => op_ref(),
                RefValue => op_ref_value(),
                TypeAssert => op_type_assert(expr),
                CompositeLit => op_composite_lit(expr),

                // Assignment targets
                TargetName => op_target_name(path),
                TargetBlank => op_target_blank(),
                TargetIndex => op_target_index(),
                TargetSelector => op_target_selector(expr),
                TargetStar => op_target_star(),
            }
        }
    }
}
