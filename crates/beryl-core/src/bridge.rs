//! The native call bridge.
//!
//! Native to script: hosts build an explicit typed argument list
//! ([`beryl_sdk::CallArg`]); the bridge validates every tag against the
//! callee signature and fails with `IllegalArgument` instead of
//! converting silently, then pushes a native stack frame and runs the
//! dispatch loop. Script to native: the VM packages the pushed
//! arguments into a [`beryl_sdk::CallFrame`] view and dispatches
//! `CallStatic`/`CallMember` to the registered type procedure.

use beryl_bytecode::segment::func_flags;
use beryl_bytecode::{type_ids, REG_RESULT};
use beryl_compiler::Signature;
use beryl_sdk::{CallArg, CallFrame, HandleRef, NativeError, NativeMessage};

use crate::context::ResumeFrame;
use crate::error::{LibError, VmError};
use crate::handle::{HandleId, HandleTable, NativeData, Payload, TaskData};
use crate::interpreter::ExecOutcome;
use crate::machine::{CallOutcome, Machine};

/// Resolved reference to a callable script function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionRef(pub(crate) u32);

/// Argument/return view handed to native type procedures.
struct NativeFrame<'a> {
    args: Vec<HandleId>,
    handles: &'a HandleTable,
    ret: Option<RetSlot>,
}

enum RetSlot {
    Int(i64),
    Float(f64),
    Str(String),
    Handle(HandleId),
}

impl<'a> NativeFrame<'a> {
    fn new(args: Vec<HandleId>, handles: &'a HandleTable) -> Self {
        Self {
            args,
            handles,
            ret: None,
        }
    }

    fn arg(&self, slot: usize) -> Result<HandleId, NativeError> {
        self.args.get(slot).copied().ok_or(NativeError::BadSlot(slot))
    }
}

impl CallFrame for NativeFrame<'_> {
    fn arg_count(&self) -> usize {
        self.args.len()
    }

    fn arg_int(&self, slot: usize) -> Result<i64, NativeError> {
        match self.handles.get(self.arg(slot)?).map(|h| &h.payload) {
            Some(Payload::Int(v)) => Ok(*v),
            _ => Err(NativeError::TypeMismatch {
                slot,
                expected: "int",
            }),
        }
    }

    fn arg_float(&self, slot: usize) -> Result<f64, NativeError> {
        match self.handles.get(self.arg(slot)?).map(|h| &h.payload) {
            Some(Payload::Float(v)) => Ok(*v),
            _ => Err(NativeError::TypeMismatch {
                slot,
                expected: "float",
            }),
        }
    }

    fn arg_string(&self, slot: usize) -> Result<String, NativeError> {
        match self.handles.get(self.arg(slot)?).map(|h| &h.payload) {
            Some(Payload::Str(s)) => Ok(s.clone()),
            _ => Err(NativeError::TypeMismatch {
                slot,
                expected: "string",
            }),
        }
    }

    fn arg_handle(&self, slot: usize) -> Result<HandleRef, NativeError> {
        Ok(HandleRef(self.arg(slot)?))
    }

    fn ret_int(&mut self, value: i64) {
        self.ret = Some(RetSlot::Int(value));
    }

    fn ret_float(&mut self, value: f64) {
        self.ret = Some(RetSlot::Float(value));
    }

    fn ret_string(&mut self, value: &str) {
        self.ret = Some(RetSlot::Str(value.to_string()));
    }

    fn ret_handle(&mut self, value: HandleRef) {
        self.ret = Some(RetSlot::Handle(value.0));
    }
}

impl Machine {
    // ===== Script -> native =====

    /// Dispatch a native call: `obj` is the receiver for member calls.
    /// The arguments are the topmost `arg_count` data-stack slots; the
    /// caller still owns and pops them.
    pub(crate) fn native_call(
        &mut self,
        type_id: u32,
        ordinal: u32,
        obj: Option<HandleId>,
    ) -> Result<(), VmError> {
        let argc = self
            .find_native_func(type_id, ordinal)
            .map(|f| f.arg_count as usize)
            .unwrap_or(0);
        if self.cur.data_stack.len() < argc {
            return Err(self.machine_error(VmError::InvalidOperand));
        }
        let at = self.cur.data_stack.len() - argc;
        let args: Vec<HandleId> = self.cur.data_stack[at..].to_vec();

        let mut proc_ = match self.natives.take(type_id) {
            Some(p) => p,
            None => return Err(self.machine_error(VmError::CallToNonFunction)),
        };

        // Member calls temporarily take the object payload out so the
        // procedure can downcast it without aliasing the table.
        let mut obj_box = None;
        if let Some(oid) = obj {
            obj_box = match self.handles.get_mut(oid).map(|h| &mut h.payload) {
                Some(Payload::Native(n)) => n.object.take(),
                _ => None,
            };
            if obj_box.is_none() {
                self.natives.put_back(type_id, proc_);
                return Err(self.machine_error(VmError::UnsupportedType));
            }
        }

        let (result, ret) = {
            let mut frame = NativeFrame::new(args, &self.handles);
            let result = match (&mut obj_box, obj) {
                (Some(object), Some(_)) => proc_.dispatch(NativeMessage::CallMember {
                    func_idx: ordinal,
                    object,
                    frame: &mut frame,
                }),
                _ => proc_.dispatch(NativeMessage::CallStatic {
                    func_idx: ordinal,
                    frame: &mut frame,
                }),
            };
            (result, frame.ret)
        };

        // Restore the payload and the procedure before error handling.
        if let (Some(oid), Some(object)) = (obj, obj_box) {
            if let Some(Payload::Native(n)) =
                self.handles.get_mut(oid).map(|h| &mut h.payload)
            {
                n.object = Some(object);
            }
        }
        self.natives.put_back(type_id, proc_);

        if let Err(err) = result {
            log::debug!("native call failed: {err}");
            return Err(self.machine_error(VmError::NativeException));
        }

        // Materialize the return value into the result register.
        let id = match ret {
            None => 0,
            Some(RetSlot::Int(v)) => self.handles.alloc(type_ids::INT, Payload::Int(v)),
            Some(RetSlot::Float(v)) => self.handles.alloc(type_ids::FLOAT, Payload::Float(v)),
            Some(RetSlot::Str(s)) => self.handles.alloc(type_ids::STRING, Payload::Str(s)),
            Some(RetSlot::Handle(h)) => {
                self.handles.add_ref(h);
                h
            }
        };
        let old = std::mem::replace(&mut self.cur.registers[REG_RESULT as usize], id);
        self.release_id(old);
        Ok(())
    }

    /// Create a native object through its type procedure.
    pub(crate) fn native_new_object(&mut self, type_id: u32) -> Result<HandleId, VmError> {
        let mut proc_ = match self.natives.take(type_id) {
            Some(p) => p,
            None => return Err(self.machine_error(VmError::CallToNonFunction)),
        };
        let mut out = None;
        let result = proc_.dispatch(NativeMessage::NewObject { out: &mut out });
        self.natives.put_back(type_id, proc_);
        if result.is_err() {
            return Err(self.machine_error(VmError::NativeException));
        }
        match out {
            Some(object) => Ok(self.handles.alloc(
                type_id,
                Payload::Native(NativeData {
                    object: Some(object),
                }),
            )),
            None => Err(self.machine_error(VmError::AllocationFailed)),
        }
    }

    // ===== Native -> script =====

    /// Look up a callable. With an object the name must resolve to a
    /// method of the object's class; a name that only matches a static
    /// (non-method) function yields `None`.
    pub fn get_function(&self, name: &str, obj: Option<HandleRef>) -> Option<FunctionRef> {
        match obj {
            None => self.find_global_func(name).map(FunctionRef),
            Some(handle) => {
                let type_id = self.type_of(handle)?;
                self.find_method_func(type_id, name).map(FunctionRef)
            }
        }
    }

    /// Call a global script function by name with typed arguments.
    pub fn call_function(
        &mut self,
        name: &str,
        args: &[CallArg],
    ) -> Result<CallOutcome, LibError> {
        self.check_callable()?;
        let func_idx = self
            .find_global_func(name)
            .ok_or(LibError::CallToNonFunction)?;
        self.call_function_ref(FunctionRef(func_idx), args)
    }

    /// Call a previously resolved function.
    pub fn call_function_ref(
        &mut self,
        func: FunctionRef,
        args: &[CallArg],
    ) -> Result<CallOutcome, LibError> {
        self.check_callable()?;
        let info = self
            .segments
            .functions
            .get(func.0 as usize)
            .ok_or(LibError::InvalidFunction)?;
        if info.flags & func_flags::COFUNC != 0 {
            return Err(LibError::CallToNonFunction);
        }
        if !info.has_body() {
            return Err(LibError::CallToNonFunction);
        }
        let addr = info.code_addr;
        if args.len() != info.arg_count as usize {
            return Err(LibError::IllegalArgument);
        }
        if let Some(sig) = self.compiler.signature_of(func.0).cloned() {
            validate_args(self, &sig, args)?;
        }
        let arg_ids = self.make_arg_handles(args);
        let result = self.invoke_at(addr, arg_ids, 0);
        self.finish_call(result)
    }

    /// Call a method on a script or native object by name.
    pub fn call_method(
        &mut self,
        obj: HandleRef,
        name: &str,
        args: &[CallArg],
    ) -> Result<CallOutcome, LibError> {
        self.check_callable()?;
        let type_id = self.type_of(obj).ok_or(LibError::InvalidHandleIndex)?;
        let func_idx = self
            .find_method_func(type_id, name)
            .ok_or(LibError::CallToNonFunction)?;
        let info = &self.segments.functions[func_idx as usize];
        if args.len() != info.arg_count as usize {
            return Err(LibError::IllegalArgument);
        }
        let is_native = info.flags & func_flags::NATIVE != 0;
        let ordinal_or_slot = info.member_idx;

        if is_native {
            // Push the arguments, dispatch, pop them again.
            let arg_ids = self.make_arg_handles(args);
            let argc = arg_ids.len();
            for id in arg_ids {
                if self.cur.data_stack.len() >= self.data_stack_max {
                    self.release_id(id);
                    return Err(LibError::Generic);
                }
                self.cur.data_stack.push(id);
            }
            let result = self.native_call(type_id, ordinal_or_slot, Some(obj.0));
            for _ in 0..argc {
                if let Some(id) = self.cur.data_stack.pop() {
                    self.release_id(id);
                }
            }
            return match result {
                Ok(()) => {
                    let ret = self.cur.registers[REG_RESULT as usize];
                    self.handles.add_ref(ret);
                    Ok(CallOutcome::Return(HandleRef(ret)))
                }
                Err(err) => {
                    let exc = self.make_runtime_exception(err);
                    Ok(CallOutcome::Exception(HandleRef(exc)))
                }
            };
        }

        // Script method: dispatch through the object's v-table.
        let tinfo = &self.segments.types[type_id as usize];
        let resolved = tinfo
            .vtable
            .get(ordinal_or_slot as usize)
            .copied()
            .filter(|&f| f != beryl_bytecode::segment::UNRESOLVED)
            .unwrap_or(func_idx);
        let placed = self
            .segments
            .functions
            .get(resolved as usize)
            .filter(|f| f.has_body())
            .map(|f| f.code_addr);
        let addr = placed.ok_or(LibError::CallToNonFunction)?;
        let arg_ids = self.make_arg_handles(args);
        let result = self.invoke_at(addr, arg_ids, obj.0);
        self.finish_call(result)
    }

    /// Invoke a delegate value from the host: a global-function
    /// reference, a bound method, or a closure.
    pub fn call_delegate(
        &mut self,
        delegate: HandleRef,
        args: &[CallArg],
    ) -> Result<CallOutcome, LibError> {
        self.check_callable()?;
        let snapshot = match self.handles.get(delegate.0).map(|h| &h.payload) {
            Some(Payload::Delegate(d)) => Some((d.target, d.is_method, d.bound, d.env.clone())),
            _ => None,
        };
        let (target, is_method, bound, env) =
            snapshot.ok_or(LibError::CallToNonFunction)?;
        let func_idx = if is_method {
            let bound_type = self
                .type_of(HandleRef(bound))
                .ok_or(LibError::InvalidHandleIndex)?;
            self.segments.types[bound_type as usize]
                .vtable
                .get(target as usize)
                .copied()
                .filter(|&f| f != beryl_bytecode::segment::UNRESOLVED)
                .ok_or(LibError::CallToNonFunction)?
        } else {
            target
        };
        let placed = self
            .segments
            .functions
            .get(func_idx as usize)
            .filter(|f| f.has_body())
            .map(|f| (f.code_addr, f.arg_count as usize));
        let (addr, argc) = placed.ok_or(LibError::CallToNonFunction)?;
        if args.len() != argc {
            return Err(LibError::IllegalArgument);
        }

        // Arguments first, then the closure environment on top, the
        // order the callee's frame expects.
        let mut ids = self.make_arg_handles(args);
        for &cap in &env {
            self.handles.add_ref(cap);
            ids.push(cap);
        }
        let this = if bound != 0 { bound } else { 0 };
        let result = self.invoke_at(addr, ids, this);
        self.finish_call(result)
    }

    /// Instantiate a cofunction task from the host.
    pub fn new_task(&mut self, name: &str, args: &[CallArg]) -> Result<HandleRef, LibError> {
        self.check_callable()?;
        let func_idx = self
            .segments
            .functions
            .iter()
            .position(|f| {
                f.flags & func_flags::COFUNC != 0 && self.segments.cstr.get(f.name_offs) == name
            })
            .ok_or(LibError::CallToNonFunction)? as u32;
        let info = &self.segments.functions[func_idx as usize];
        if !info.has_body() {
            return Err(LibError::CallToNonFunction);
        }
        if args.len() != info.arg_count as usize {
            return Err(LibError::IllegalArgument);
        }
        let addr = info.code_addr;
        let mut ctx = crate::context::Context::new();
        ctx.data_stack = self.make_arg_handles(args);
        ctx.pc = addr;
        // Tasks see the same global object in register 2.
        ctx.registers[beryl_bytecode::REG_GLOBALS as usize] = self.globals;
        self.handles.add_ref(self.globals);
        let id = self.handles.alloc(
            type_ids::TASK,
            Payload::Task(Box::new(TaskData {
                func_idx,
                ctx,
                done: false,
            })),
        );
        Ok(HandleRef(id))
    }

    /// Resume a cofunction task from the host. Returns the yielded
    /// value, or an exception outcome once the task is exhausted.
    pub fn resume_task(&mut self, task: HandleRef) -> Result<CallOutcome, LibError> {
        self.check_callable()?;
        let task_id = task.0;
        if self.handles.get(task_id).is_none() {
            return Err(LibError::InvalidHandleIndex);
        }
        let is_task = matches!(
            self.handles.get(task_id).map(|h| &h.payload),
            Some(Payload::Task(_))
        );
        if !is_task {
            return Err(LibError::InvalidHandleType);
        }
        let taken = match std::mem::replace(
            &mut self.handles.get_mut(task_id).unwrap().payload,
            Payload::Null,
        ) {
            Payload::Task(t) => *t,
            _ => unreachable!("checked above"),
        };
        if taken.done {
            let func_idx = taken.func_idx;
            let ctx = taken.ctx;
            if let Some(h) = self.handles.get_mut(task_id) {
                h.payload = Payload::Task(Box::new(TaskData {
                    func_idx,
                    ctx,
                    done: true,
                }));
            }
            let exc = self.make_runtime_exception(VmError::SoftwareException);
            return Ok(CallOutcome::Exception(HandleRef(exc)));
        }

        // Swap the task in; a yield through the host frame hands
        // control straight back.
        let caller = std::mem::replace(&mut self.cur, taken.ctx);
        self.resume_stack.push(ResumeFrame {
            task_id,
            func_idx: taken.func_idx,
            dst_reg: REG_RESULT,
            caller,
            host: true,
        });
        let floor = self.resume_stack.len() - 1;
        match self.exec_with_floor(floor) {
            Ok(ExecOutcome::Returned) => {
                let ret = self.cur.registers[REG_RESULT as usize];
                self.handles.add_ref(ret);
                Ok(CallOutcome::Return(HandleRef(ret)))
            }
            Ok(ExecOutcome::Thrown(h)) => Ok(CallOutcome::Exception(HandleRef(h))),
            Err(err) => {
                let exc = self.make_runtime_exception(err);
                Ok(CallOutcome::Exception(HandleRef(exc)))
            }
        }
    }

    // ===== Shared plumbing =====

    fn check_callable(&self) -> Result<(), LibError> {
        if self.is_blocked() {
            return Err(LibError::RuntimeBlocked);
        }
        if !self.initialized {
            return Err(LibError::CodeNotInitialized);
        }
        Ok(())
    }

    /// Internal errors at the call boundary become a runtime-exception
    /// object rather than surfacing as API errors.
    fn finish_call(
        &mut self,
        result: Result<CallOutcome, VmError>,
    ) -> Result<CallOutcome, LibError> {
        match result {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                let exc = self.make_runtime_exception(err);
                Ok(CallOutcome::Exception(HandleRef(exc)))
            }
        }
    }

    fn make_arg_handles(&mut self, args: &[CallArg]) -> Vec<HandleId> {
        args.iter()
            .map(|arg| match arg {
                CallArg::Int(v) => self.handles.alloc(type_ids::INT, Payload::Int(*v)),
                CallArg::Float(v) => self.handles.alloc(type_ids::FLOAT, Payload::Float(*v)),
                CallArg::Str(s) => self
                    .handles
                    .alloc(type_ids::STRING, Payload::Str(s.clone())),
                CallArg::Handle(h) => {
                    self.handles.add_ref(h.0);
                    h.0
                }
            })
            .collect()
    }

    /// Global (non-method, non-cofunction) function lookup by name,
    /// straight from the function segment so a loaded chunk resolves
    /// without a compiler model.
    fn find_global_func(&self, name: &str) -> Option<u32> {
        self.segments
            .functions
            .iter()
            .position(|f| {
                f.type_id == type_ids::GLOBAL
                    && f.flags & (func_flags::METHOD | func_flags::COFUNC | func_flags::INIT) == 0
                    && self.segments.cstr.get(f.name_offs) == name
            })
            .map(|i| i as u32)
    }

    /// Method lookup walking the type's inheritance chain.
    fn find_method_func(&self, type_id: u32, name: &str) -> Option<u32> {
        let mut probe = type_id;
        while probe != 0 {
            let found = self.segments.functions.iter().position(|f| {
                f.type_id == probe
                    && f.flags & func_flags::METHOD != 0
                    && self.segments.cstr.get(f.name_offs) == name
            });
            if let Some(i) = found {
                return Some(i as u32);
            }
            let t = &self.segments.types[probe as usize];
            probe = if t.base_id != 0 { t.base_id } else { t.hybrid_id };
            if probe as usize >= self.segments.types.len() {
                return None;
            }
        }
        None
    }
}

fn validate_args(
    machine: &Machine,
    sig: &Signature,
    args: &[CallArg],
) -> Result<(), LibError> {
    if sig.params.len() != args.len() {
        return Err(LibError::IllegalArgument);
    }
    for (param, arg) in sig.params.iter().zip(args) {
        let ok = match arg {
            CallArg::Int(_) => {
                param.type_id == type_ids::INT || param.type_id == type_ids::VAR
            }
            CallArg::Float(_) => {
                param.type_id == type_ids::FLOAT || param.type_id == type_ids::VAR
            }
            CallArg::Str(_) => {
                param.type_id == type_ids::STRING || param.type_id == type_ids::VAR
            }
            CallArg::Handle(h) => {
                param.type_id == type_ids::VAR
                    || machine
                        .type_of(*h)
                        .map(|t| t == param.type_id)
                        .unwrap_or(false)
            }
        };
        if !ok {
            return Err(LibError::IllegalArgument);
        }
    }
    Ok(())
}
