//! Execution contexts.
//!
//! A context is everything one thread of script execution needs:
//! program counter, register file, data stack and call stack. The root
//! context is created at VM init; every cofunction task owns a private
//! one, and resuming a task swaps the whole context on the machine.

use beryl_bytecode::NUM_REGISTERS;

use crate::handle::HandleId;

/// `ret_pc` value marking a frame pushed by the native call bridge;
/// returning through it hands control back to the host.
pub const RETURN_TO_NATIVE: u32 = u32::MAX;

/// One call-stack frame.
#[derive(Debug, Clone, Copy)]
pub struct Frame {
    /// Code address to resume at, or [`RETURN_TO_NATIVE`].
    pub ret_pc: u32,
    /// The caller's `this` handle, restored on return. Owns one
    /// reference.
    pub this: HandleId,
}

/// One execution context.
#[derive(Debug, Default)]
pub struct Context {
    /// Program counter: absolute word address in the code segment.
    pub pc: u32,
    /// Register file; every slot owns one reference.
    pub registers: [HandleId; NUM_REGISTERS],
    /// Data stack; every slot owns one reference.
    pub data_stack: Vec<HandleId>,
    /// Call stack.
    pub call_stack: Vec<Frame>,
}

impl Context {
    /// A fresh context with null registers and empty stacks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every handle the context references, for GC marking and
    /// teardown.
    pub fn referenced(&self) -> impl Iterator<Item = HandleId> + '_ {
        self.registers
            .iter()
            .copied()
            .chain(self.data_stack.iter().copied())
            .chain(self.call_stack.iter().map(|f| f.this))
            .filter(|&id| id != 0)
    }
}

/// A suspended resume: who to give control back to when the running
/// task yields or finishes.
pub struct ResumeFrame {
    /// Handle of the task being executed.
    pub task_id: HandleId,
    /// Function index of the task, to restore into its payload.
    pub func_idx: u32,
    /// Caller register receiving the yielded value.
    pub dst_reg: u32,
    /// The caller's context, swapped back in on yield or completion.
    pub caller: Context,
    /// The resume came from the native bridge; a yield hands control
    /// back to the host instead of continuing script code.
    pub host: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_context_is_null() {
        let ctx = Context::new();
        assert!(ctx.registers.iter().all(|&r| r == 0));
        assert!(ctx.data_stack.is_empty());
        assert_eq!(ctx.referenced().count(), 0);
    }

    #[test]
    fn test_referenced_skips_null() {
        let mut ctx = Context::new();
        ctx.registers[3] = 7;
        ctx.data_stack.push(0);
        ctx.data_stack.push(9);
        ctx.call_stack.push(Frame {
            ret_pc: RETURN_TO_NATIVE,
            this: 4,
        });
        let refs: Vec<HandleId> = ctx.referenced().collect();
        assert_eq!(refs, vec![7, 9, 4]);
    }
}
