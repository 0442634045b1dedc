//! The VM state.
//!
//! A [`Machine`] exclusively owns its segments, handle table, fixed
//! memory pools, native type registry, root execution context and
//! compiler instance. States share nothing; a host may run several on
//! separate threads.

use beryl_bytecode::chunk::Chunk;
use beryl_bytecode::segment::{func_flags, Segments, TypeFamily};
use beryl_bytecode::symtab::SymbolTable;
use beryl_bytecode::{type_ids, REG_GLOBALS};
use beryl_compiler::{Compiler, RuntimeOption};
use beryl_sdk::{HandleRef, NativeMessage, NativeType, NTL_INTERFACE_VERSION};

use crate::context::{Context, ResumeFrame};
use crate::error::{LibError, VmError, Vector};
use crate::fixmem::{FixMemStats, FixedAlloc};
use crate::handle::{
    hflags, HandleId, HandleTable, NativeData, ObjectData, Payload,
};
use crate::native::NativeRegistry;

/// Exception vector callback: receives the error and the exception
/// object handle (null for machine errors without one).
pub type VectorHandler = Box<dyn FnMut(VmError, HandleRef)>;

/// Default stack limits, overridable through the runtime options while
/// the machine is uninitialized.
const DEFAULT_CALL_STACK: usize = 4096;
const DEFAULT_DATA_STACK: usize = 4096;

/// Result of calling into script code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    /// Normal return; the handle is owned by the caller.
    Return(HandleRef),
    /// An exception unwound to the call boundary; the handle is the
    /// exception object, owned by the caller.
    Exception(HandleRef),
}

/// One Beryl VM state.
pub struct Machine {
    /// The five program segments.
    pub(crate) segments: Segments,
    /// The state's own compiler.
    pub(crate) compiler: Compiler,
    pub(crate) handles: HandleTable,
    pub(crate) fixmem: FixedAlloc,
    pub(crate) natives: NativeRegistry,
    /// The currently executing context; cofunction resume swaps it.
    pub(crate) cur: Context,
    pub(crate) resume_stack: Vec<ResumeFrame>,
    /// Materialized runtime handle per data-segment entry.
    pub(crate) data_handles: Vec<HandleId>,
    /// The global object.
    pub(crate) globals: HandleId,
    pub(crate) initialized: bool,
    blocked: bool,
    pub(crate) call_stack_max: usize,
    pub(crate) data_stack_max: usize,
    pub(crate) vectors: [Option<VectorHandler>; 4],
    pub(crate) trace_enabled: bool,
    pub(crate) gc_interval: u64,
    pub(crate) instr_count: u64,
    pinned: Vec<HandleId>,
}

impl Default for Machine {
    fn default() -> Self {
        Self::new()
    }
}

impl Machine {
    /// A fresh state with the built-in types registered.
    pub fn new() -> Self {
        let mut machine = Self {
            segments: Segments::new(),
            compiler: Compiler::new(),
            handles: HandleTable::new(),
            fixmem: FixedAlloc::new(),
            natives: NativeRegistry::new(),
            cur: Context::new(),
            resume_stack: Vec::new(),
            data_handles: Vec::new(),
            globals: 0,
            initialized: false,
            blocked: false,
            call_stack_max: DEFAULT_CALL_STACK,
            data_stack_max: DEFAULT_DATA_STACK,
            vectors: [None, None, None, None],
            trace_enabled: false,
            gc_interval: 0,
            instr_count: 0,
            pinned: Vec::new(),
        };
        machine.compiler.bootstrap(&mut machine.segments);
        machine
            .register_native_type(Box::new(RuntimeExceptionType))
            .expect("built-in exception type registers");
        machine
    }

    // ===== Options =====

    /// Apply an option string. Compile options apply to the owned
    /// compiler; runtime options require the machine to be
    /// uninitialized.
    pub fn set_options(&mut self, input: &str) -> Result<(), LibError> {
        let runtime = self
            .compiler
            .set_options(input)
            .map_err(|_| LibError::CompileFailed)?;
        if runtime.is_empty() {
            return Ok(());
        }
        if self.initialized {
            return Err(LibError::RuntimeLocked);
        }
        for opt in runtime {
            match opt {
                RuntimeOption::CallStackSize(n) => self.call_stack_max = n,
                RuntimeOption::DataStackSize(n) => self.data_stack_max = n,
                RuntimeOption::StackSize(n) => {
                    self.call_stack_max = n;
                    self.data_stack_max = n;
                }
            }
        }
        Ok(())
    }

    // ===== Compilation =====

    /// Compile a source unit. Refused once the runtime is initialized;
    /// segments are immutable while code can run.
    pub fn compile(&mut self, name: &str, source: &str) -> Result<(), LibError> {
        if self.initialized {
            return Err(LibError::RuntimeLocked);
        }
        self.compiler
            .compile(&mut self.segments, name, source)
            .map_err(|_| LibError::CompileFailed)
    }

    /// Register an import name with source text on the owned compiler.
    pub fn register_import(&mut self, name: &str, source: &str) {
        self.compiler.register_import(name, source);
    }

    /// Run the link pass.
    pub fn link(&mut self) -> Result<(), LibError> {
        if self.initialized {
            return Err(LibError::RuntimeLocked);
        }
        self.compiler
            .link(&mut self.segments)
            .map(|_| ())
            .map_err(|_| LibError::CompileFailed)
    }

    /// Error iteration API: next rendered compiler diagnostic.
    pub fn next_error(&mut self) -> Option<String> {
        self.compiler.next_error()
    }

    // ===== Native types =====

    /// Register a native type. The declaration string compiles exactly
    /// like a source file; a failing declaration aborts registration.
    /// After a chunk load the type is re-bound to its existing
    /// type-info entry instead of being re-declared.
    pub fn register_native_type(
        &mut self,
        mut proc_: Box<dyn NativeType>,
    ) -> Result<u32, LibError> {
        if self.initialized {
            return Err(LibError::RuntimeLocked);
        }
        if proc_.interface_version() != NTL_INTERFACE_VERSION {
            return Err(LibError::IncompatibleNativeType);
        }
        let name = proc_.class_name().to_string();
        if name.is_empty() {
            return Err(LibError::IllegalTypeName);
        }

        let type_id = match self.segments.find_type(&name) {
            // Already declared (typically after a chunk load): bind the
            // procedure to the existing entry.
            Some(id) if self.segments.types[id as usize].is_native() => id,
            Some(_) => return Err(LibError::RegisterTypeFailed),
            None => {
                let declaration = proc_.declaration().to_string();
                let packages = proc_.package_list().to_string();
                self.compiler
                    .compile_native_decl(&mut self.segments, &name, &declaration, &packages)
                    .map_err(|_| LibError::RegisterTypeFailed)?
            }
        };

        proc_
            .dispatch(NativeMessage::Register)
            .map_err(|_| LibError::RegisterTypeFailed)?;
        self.natives.insert(type_id, proc_);
        log::debug!("registered native type '{name}' as type {type_id}");
        Ok(type_id)
    }

    // ===== Lifecycle =====

    /// Initialize and run the bootstrap code. On the first call (or the
    /// first after a chunk load) this materializes the data segment,
    /// creates the global object and runs every global initializer.
    pub fn run(&mut self) -> Result<(), LibError> {
        if self.blocked {
            return Err(LibError::RuntimeBlocked);
        }
        if self.initialized {
            return Ok(());
        }

        self.materialize_data();
        self.create_global_object();

        // Tell every native type the table is final.
        for type_id in self.natives.type_ids() {
            if let Some(mut proc_) = self.natives.take(type_id) {
                let result = proc_.dispatch(NativeMessage::Initialize);
                self.natives.put_back(type_id, proc_);
                result.map_err(|_| LibError::InitializeFailed)?;
            }
        }

        // Bootstrap: run the synthesized global initializers.
        let inits: Vec<(u32, u32)> = self
            .segments
            .functions
            .iter()
            .filter(|f| f.flags & func_flags::INIT != 0 && f.code_size > 0)
            .map(|f| (f.code_addr, f.code_size))
            .collect();
        self.initialized = true;
        for (addr, _) in inits {
            match self.invoke_at(addr, Vec::new(), 0) {
                Ok(CallOutcome::Return(h)) => self.release(h),
                Ok(CallOutcome::Exception(h)) => {
                    log::warn!("global initializer threw during bootstrap");
                    self.release(h);
                }
                Err(err) => {
                    self.initialized = false;
                    log::warn!("bootstrap failed: {err}");
                    return Err(LibError::InitializeFailed);
                }
            }
        }
        Ok(())
    }

    /// True once `run` has initialized the state.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Refuse or accept new native call-bridge entries.
    pub fn set_blocked(&mut self, blocked: bool) {
        self.blocked = blocked;
    }

    /// True when the bridge refuses new entries.
    pub fn is_blocked(&self) -> bool {
        self.blocked
    }

    fn materialize_data(&mut self) {
        self.data_handles.clear();
        for i in 0..self.segments.data.len() {
            let entry = self.segments.data[i];
            let id = match entry.type_id {
                type_ids::UNDEFINED => 0,
                type_ids::INT => self
                    .handles
                    .alloc(type_ids::INT, Payload::Int(entry.payload as i64)),
                type_ids::FLOAT => self
                    .handles
                    .alloc(type_ids::FLOAT, Payload::Float(f64::from_bits(entry.payload))),
                type_ids::STRING => {
                    let s = self.segments.cstr.get(entry.payload as u32).to_string();
                    self.handles.alloc(type_ids::STRING, Payload::Str(s))
                }
                other => {
                    log::warn!("data handle of unexpected type {other}, treated as null");
                    0
                }
            };
            if id != 0 {
                if let Some(h) = self.handles.get_mut(id) {
                    h.flags |= hflags::PERSIST;
                }
            }
            self.data_handles.push(id);
        }
    }

    fn create_global_object(&mut self) {
        let size = self.segments.types[type_ids::GLOBAL as usize].instance_size;
        if self.globals != 0 {
            // Re-link grew the global: resize the live object in
            // place, new slots null.
            let (old_block, old_count) = match &self.handles.get(self.globals).unwrap().payload {
                Payload::Object(o) => (o.block, o.count),
                _ => unreachable!("global object payload"),
            };
            if size > old_count {
                let new_block = self.fixmem.alloc_words(size as usize);
                for i in 0..old_count as usize {
                    let v = self.fixmem.words(old_block)[i];
                    self.fixmem.words_mut(new_block)[i] = v;
                }
                self.fixmem.free(old_block);
                if let Some(h) = self.handles.get_mut(self.globals) {
                    h.payload = Payload::Object(ObjectData {
                        block: new_block,
                        count: size,
                    });
                }
            }
            return;
        }
        let block = self.fixmem.alloc_words(size.max(1) as usize);
        let id = self.handles.alloc(
            type_ids::GLOBAL,
            Payload::Object(ObjectData { block, count: size }),
        );
        if let Some(h) = self.handles.get_mut(id) {
            h.flags |= hflags::PERSIST;
        }
        self.globals = id;
        // The root context holds the global object in register 2.
        self.cur.registers[REG_GLOBALS as usize] = id;
        self.handles.add_ref(id);
    }

    /// Tear the runtime down: notify native types, drop every handle
    /// and reset to the uninitialized state. The debug build reports
    /// leaked fixed-memory blocks.
    pub fn terminate(&mut self) {
        for type_id in self.natives.type_ids() {
            if let Some(mut proc_) = self.natives.take(type_id) {
                let _ = proc_.dispatch(NativeMessage::Terminate);
                let _ = proc_.dispatch(NativeMessage::Unregister);
                self.natives.put_back(type_id, proc_);
            }
        }

        // Drop contexts first so their references do not dangle, then
        // free every live handle wholesale.
        self.cur = Context::new();
        self.resume_stack.clear();
        self.data_handles.clear();
        self.globals = 0;
        self.pinned.clear();
        let live = self.handles.live_ids();
        for id in live {
            if id == 0 {
                continue;
            }
            if let Some(h) = self.handles.take(id) {
                self.drop_payload(h.type_id, h.payload);
            }
        }
        self.handles = HandleTable::new();
        self.natives.clear();

        #[cfg(debug_assertions)]
        {
            let leaks = self.fixmem.leak_report();
            if !leaks.is_empty() {
                log::warn!("fixed-memory leaks at teardown: {leaks:?}");
            }
        }
        self.fixmem = FixedAlloc::new();
        self.initialized = false;
    }

    // ===== Handle plumbing =====

    /// Increment a handle's reference count on behalf of the host.
    pub fn add_ref(&mut self, handle: HandleRef) {
        self.handles.add_ref(handle.0);
    }

    /// Release one reference. Reaching zero destroys the value,
    /// running destructors and freeing owned storage.
    pub fn release(&mut self, handle: HandleRef) {
        self.release_id(handle.0);
    }

    pub(crate) fn release_id(&mut self, id: HandleId) {
        let mut work = vec![id];
        while let Some(id) = work.pop() {
            if !self.handles.dec_ref(id) {
                continue;
            }
            self.run_destructor(id);
            if let Some(h) = self.handles.take(id) {
                self.collect_owned(h.type_id, h.payload, &mut work);
            }
        }
    }

    /// Queue everything a payload owns for release and free its
    /// storage. Shared by release and terminate (terminate passes a
    /// sink that drops the ids).
    fn collect_owned(&mut self, type_id: u32, payload: Payload, work: &mut Vec<HandleId>) {
        match payload {
            Payload::Object(o) => {
                let members: Vec<u32> =
                    self.fixmem.words(o.block)[..o.count as usize].to_vec();
                self.fixmem.free(o.block);
                work.extend(members.into_iter().filter(|&m| m != 0));
            }
            Payload::Delegate(d) => {
                if d.bound != 0 {
                    work.push(d.bound);
                }
                work.extend(d.env.into_iter().filter(|&e| e != 0));
            }
            Payload::Task(t) => {
                work.extend(t.ctx.referenced());
            }
            Payload::Native(n) => {
                if let Some(object) = n.object {
                    self.dispatch_destroy(type_id, object);
                }
            }
            _ => {}
        }
    }

    /// Free a payload without releasing its referents. Used by
    /// terminate and the GC sweep, where the referents are handled
    /// separately.
    pub(crate) fn drop_payload(&mut self, type_id: u32, payload: Payload) {
        match payload {
            Payload::Object(o) => self.fixmem.free(o.block),
            Payload::Native(n) => {
                if let Some(object) = n.object {
                    self.dispatch_destroy(type_id, object);
                }
            }
            _ => {}
        }
    }

    pub(crate) fn dispatch_destroy(&mut self, type_id: u32, object: Box<dyn std::any::Any>) {
        if let Some(mut proc_) = self.natives.take(type_id) {
            let _ = proc_.dispatch(NativeMessage::DestroyObject { object });
            self.natives.put_back(type_id, proc_);
        }
    }

    /// Run the script destructor of a dying object, if its class has
    /// one. The count is parked above zero for the duration so nested
    /// releases cannot re-enter destruction.
    fn run_destructor(&mut self, id: HandleId) {
        let Some(h) = self.handles.get(id) else { return };
        if !matches!(h.payload, Payload::Object(_)) {
            return;
        }
        let tinfo = &self.segments.types[h.type_id as usize];
        if tinfo.family != TypeFamily::Class || tinfo.is_native() {
            return;
        }
        let dtor = tinfo.methods.dtor;
        if dtor == beryl_bytecode::segment::NO_METHOD {
            return;
        }
        let addr = self.segments.functions[dtor as usize].code_addr;
        if !self.initialized || self.segments.functions[dtor as usize].code_size == 0 {
            return;
        }
        if let Some(h) = self.handles.get_mut(id) {
            h.ref_count = 2;
        }
        match self.invoke_at(addr, Vec::new(), id) {
            Ok(CallOutcome::Return(h)) | Ok(CallOutcome::Exception(h)) => self.release(h),
            Err(err) => log::warn!("destructor of handle {id} failed: {err}"),
        }
        if let Some(h) = self.handles.get_mut(id) {
            h.ref_count = 0;
        }
    }

    // ===== Host value helpers =====

    /// Wrap an integer in a fresh handle owned by the caller.
    pub fn new_int(&mut self, value: i64) -> HandleRef {
        HandleRef(self.handles.alloc(type_ids::INT, Payload::Int(value)))
    }

    /// Wrap a float in a fresh handle owned by the caller.
    pub fn new_float(&mut self, value: f64) -> HandleRef {
        HandleRef(self.handles.alloc(type_ids::FLOAT, Payload::Float(value)))
    }

    /// Wrap a string in a fresh handle owned by the caller.
    pub fn new_string(&mut self, value: &str) -> HandleRef {
        HandleRef(
            self.handles
                .alloc(type_ids::STRING, Payload::Str(value.to_string())),
        )
    }

    /// Integer payload of a handle.
    pub fn int_value(&self, handle: HandleRef) -> Option<i64> {
        match self.handles.get(handle.0)?.payload {
            Payload::Int(v) => Some(v),
            _ => None,
        }
    }

    /// Float payload of a handle.
    pub fn float_value(&self, handle: HandleRef) -> Option<f64> {
        match self.handles.get(handle.0)?.payload {
            Payload::Float(v) => Some(v),
            _ => None,
        }
    }

    /// String payload of a handle.
    pub fn str_value(&self, handle: HandleRef) -> Option<&str> {
        match &self.handles.get(handle.0)?.payload {
            Payload::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Type id of a handle.
    pub fn type_of(&self, handle: HandleRef) -> Option<u32> {
        self.handles.get(handle.0).map(|h| h.type_id)
    }

    /// Reference count of a handle, for tests and diagnostics.
    pub fn ref_count(&self, handle: HandleRef) -> Option<u32> {
        self.handles.get(handle.0).map(|h| h.ref_count)
    }

    /// True when the handle id refers to a live entry.
    pub fn is_live(&self, handle: HandleRef) -> bool {
        self.handles.get(handle.0).is_some()
    }

    /// Number of live handles, the null handle included.
    pub fn handle_count(&self) -> usize {
        self.handles.live_count()
    }

    /// Fixed-memory pool statistics.
    pub fn fixmem_stats(&self) -> FixMemStats {
        self.fixmem.stats()
    }

    // ===== Exception vectors, GC configuration, roots =====

    /// Install an exception vector handler.
    pub fn set_vector(&mut self, vector: Vector, handler: VectorHandler) {
        self.vectors[vector_index(vector)] = Some(handler);
    }

    /// Remove an exception vector handler.
    pub fn clear_vector(&mut self, vector: Vector) {
        self.vectors[vector_index(vector)] = None;
    }

    /// Enable the per-instruction trace vector.
    pub fn set_trace(&mut self, enable: bool) {
        self.trace_enabled = enable;
    }

    pub(crate) fn raise(&mut self, vector: Vector, err: VmError, exception: HandleId) {
        if let Some(mut handler) = self.vectors[vector_index(vector)].take() {
            handler(err, HandleRef(exception));
            self.vectors[vector_index(vector)] = Some(handler);
        }
    }

    /// Run a mark-sweep collection every `interval` instructions;
    /// 0 disables the schedule.
    pub fn set_gc_interval(&mut self, interval: u64) {
        self.gc_interval = interval;
    }

    /// Pin a handle as a GC root on behalf of the host.
    pub fn pin_root(&mut self, handle: HandleRef) {
        self.handles.add_ref(handle.0);
        self.pinned.push(handle.0);
    }

    /// Unpin a previously pinned root.
    pub fn unpin_root(&mut self, handle: HandleRef) {
        if let Some(pos) = self.pinned.iter().position(|&id| id == handle.0) {
            self.pinned.remove(pos);
            self.release_id(handle.0);
        }
    }

    pub(crate) fn pinned_roots(&self) -> &[HandleId] {
        &self.pinned
    }

    // ===== Chunk I/O =====

    /// Serialize the five segments (plus an optional symbol table) into
    /// a binary chunk.
    pub fn save_chunk(&self, symtab: Option<&SymbolTable>) -> Vec<u8> {
        Chunk::save(&self.segments, symtab)
    }

    /// Load a chunk: validate, terminate the current runtime,
    /// reinitialize, and adopt the segments byte for byte. Registered
    /// native types are unbound; re-register them before `run`.
    pub fn load_chunk(&mut self, data: &[u8]) -> Result<Option<SymbolTable>, LibError> {
        let (segments, symtab) =
            Chunk::load(data).map_err(|e| LibError::LoadChunkFailed(e.to_string()))?;
        self.terminate();
        self.segments = segments;
        self.compiler = Compiler::new();
        // The bootstrap flag is cleared so the init code reruns on the
        // next `run`.
        self.initialized = false;
        self.register_native_type(Box::new(RuntimeExceptionType))
            .map_err(|_| LibError::LoadChunkFailed("built-in type rebind".into()))?;
        Ok(symtab)
    }

    // ===== Runtime exception objects =====

    /// Build the `{errorCode, messageString}` exception object
    /// delivered when an internal error unwinds out of a call.
    pub(crate) fn make_runtime_exception(&mut self, err: VmError) -> HandleId {
        let type_id = self
            .natives
            .id_of("rtexception")
            .unwrap_or(type_ids::FIRST_USER);
        self.handles.alloc(
            type_id,
            Payload::Native(NativeData {
                object: Some(Box::new(RtExcObj {
                    code: err.code() as i64,
                    message: err.to_string(),
                })),
            }),
        )
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn vector_index(vector: Vector) -> usize {
    match vector {
        Vector::Machine => 0,
        Vector::Software => 1,
        Vector::Trace => 2,
        Vector::Break => 3,
    }
}

// ===== Built-in runtime exception type =====

/// Payload of a runtime exception object.
pub(crate) struct RtExcObj {
    pub code: i64,
    pub message: String,
}

/// Built-in native type carrying internal errors across the call
/// bridge.
struct RuntimeExceptionType;

impl NativeType for RuntimeExceptionType {
    fn class_name(&self) -> &str {
        "rtexception"
    }

    fn declaration(&self) -> &str {
        "class rtexception implements exception {\n\
         \tmethod int getError();\n\
         \tmethod string getMessage();\n\
         }\n"
    }

    fn author_name(&self) -> &str {
        "beryl runtime"
    }

    fn base_name(&self) -> &str {
        "exception"
    }

    fn dispatch(&mut self, msg: NativeMessage<'_>) -> Result<(), beryl_sdk::NativeError> {
        match msg {
            NativeMessage::NewObject { out } => {
                *out = Some(Box::new(RtExcObj {
                    code: 0,
                    message: String::new(),
                }));
                Ok(())
            }
            NativeMessage::CallMember {
                func_idx,
                object,
                frame,
            } => {
                let obj = object
                    .downcast_ref::<RtExcObj>()
                    .ok_or(beryl_sdk::NativeError::Unsupported)?;
                match func_idx {
                    0 => frame.ret_int(obj.code),
                    1 => frame.ret_string(&obj.message),
                    other => return Err(beryl_sdk::NativeError::UnknownFunction(other)),
                }
                Ok(())
            }
            NativeMessage::Register
            | NativeMessage::Initialize
            | NativeMessage::DestroyObject { .. }
            | NativeMessage::MarkHandles { .. }
            | NativeMessage::Terminate
            | NativeMessage::Unregister => Ok(()),
            NativeMessage::CallStatic { .. } => Err(beryl_sdk::NativeError::Unsupported),
        }
    }
}
