use super::{Machine, Op};
use crate::virtual_machine::errors::MachineError;
use crate::virtual_machine::realm::Realm;
use crate::virtual_machine::type_system::Name;
use crate::virtual_machine::uverse::UVERSE_PATH;
use crate::virtual_machine::values::{FuncValue, PackageValue, TypedValue};
use std::cell::RefCell;
use std::rc::Rc;

/// A deferred call captured by a `defer` statement.
#[derive(Clone, Debug)]
pub struct Defer {
    pub callee: TypedValue,
    pub args: Vec<TypedValue>,
    pub varg: bool,
}

#[derive(Clone, Debug)]
pub struct CallFrame {
    pub func: Rc<FuncValue>,
    pub is_defer: bool,
    /// Pending deferred calls, run last-in first-out.
    pub defers: Vec<Defer>,
    /// Package and realm to restore on return.
    pub last_package: Rc<PackageValue>,
    pub last_realm: Option<Rc<RefCell<Realm>>>,
}

#[derive(Clone, Debug)]
pub enum FrameKind {
    Call(CallFrame),
    For,
    Range,
    Switch,
}

/// Stack heights saved when a call, loop or switch starts, restored when it
/// ends.
#[derive(Clone, Debug)]
pub struct Frame {
    pub kind: FrameKind,
    pub label: Option<Name>,
    pub num_ops: usize,
    pub num_values: usize,
    pub num_blocks: usize,
    pub num_targets: usize,
}

impl Frame {
    pub fn is_call(&self) -> bool {
        matches!(self.kind, FrameKind::Call(_))
    }

    pub fn call(&self) -> Option<&CallFrame> {
        match &self.kind {
            FrameKind::Call(cf) => Some(cf),
            _ => None,
        }
    }

    pub fn call_mut(&mut self) -> Option<&mut CallFrame> {
        match &mut self.kind {
            FrameKind::Call(cf) => Some(cf),
            _ => None,
        }
    }
}

impl Machine<'_> {
    pub(super) fn push_frame(&mut self, kind: FrameKind, label: Option<Name>) {
        self.frames.push(Frame {
            kind,
            label,
            num_ops: self.ops.len(),
            num_values: self.values.len(),
            num_blocks: self.blocks.len(),
            num_targets: self.targets.len(),
        });
    }

    /// Restores every stack to the heights saved in `frame`.
    pub(super) fn truncate_to(&mut self, frame: &Frame) {
        self.ops.truncate(frame.num_ops);
        self.values.truncate(frame.num_values);
        self.blocks.truncate(frame.num_blocks);
        self.targets.truncate(frame.num_targets);
    }

    pub(super) fn last_call_frame(&self) -> Result<usize, MachineError> {
        self.frames
            .iter()
            .rposition(Frame::is_call)
            .ok_or(MachineError::MissingFrame)
    }

    pub(super) fn call_frame(&self) -> Result<&CallFrame, MachineError> {
        let i = self.last_call_frame()?;
        self.frames[i].call().ok_or(MachineError::MissingFrame)
    }

    pub(super) fn call_frame_mut(&mut self) -> Result<&mut CallFrame, MachineError> {
        let i = self.last_call_frame()?;
        self.frames[i].call_mut().ok_or(MachineError::MissingFrame)
    }

    /// Ends the innermost loop or switch frame.
    pub(super) fn op_pop_frame_and_reset(&mut self) -> Result<(), MachineError> {
        let frame = self.frames.pop().ok_or(MachineError::MissingFrame)?;
        if frame.is_call() {
            return Err(MachineError::malformed("loop end reached a call frame"));
        }
        self.truncate_to(&frame);
        Ok(())
    }

    pub(super) fn op_pop_block(&mut self) -> Result<(), MachineError> {
        self.blocks
            .pop()
            .map(|_| ())
            .ok_or(MachineError::StackUnderflow("block"))
    }

    pub(super) fn op_pop_values(&mut self, depth: usize) -> Result<(), MachineError> {
        self.values.truncate(depth);
        Ok(())
    }

    /// Drops every frame above the innermost call frame and cuts the stacks
    /// back to it, keeping its function block.
    pub(super) fn unwind_to_call_frame(&mut self) -> Result<(), MachineError> {
        let Some(i) = self.frames.iter().rposition(Frame::is_call) else {
            return Err(self.unrecovered());
        };
        self.frames.truncate(i + 1);
        let frame = self.frames[i].clone();
        self.ops.truncate(frame.num_ops);
        self.values.truncate(frame.num_values);
        self.blocks.truncate(frame.num_blocks + 1);
        self.targets.truncate(frame.num_targets);
        Ok(())
    }

    /// Names of the functions on the frame stack, outermost first. Builtins
    /// are left out.
    pub(super) fn trace(&self) -> Vec<String> {
        self.frames
            .iter()
            .filter_map(Frame::call)
            .filter(|cf| &*cf.func.pkg_path != UVERSE_PATH)
            .map(|cf| {
                let name = if cf.is_defer {
                    format!("{} (deferred)", cf.func.name)
                } else {
                    cf.func.name.to_string()
                };
                format!("{}.{}", cf.func.pkg_path, name)
            })
            .collect()
    }

    pub(super) fn unrecovered(&mut self) -> MachineError {
        self.panic_state = super::PanicState::Normal;
        match self.exception.take() {
            Some(e) => MachineError::UnrecoveredPanic {
                value: e.value.sprint(&self.heap),
                trace: e
                    .trace
                    .iter()
                    .map(|name| format!("\tat {}", name))
                    .collect::<Vec<_>>()
                    .join("\n"),
            },
            None => MachineError::UnrecoveredPanic {
                value: "unknown".to_string(),
                trace: String::new(),
            },
        }
    }

    pub(super) fn push_unwind_ops(&mut self) {
        self.push_op(Op::Panic2);
        self.push_op(Op::ReturnCallDefers);
    }
}
