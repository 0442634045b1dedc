//! The five program segments.
//!
//! A compiled program is nothing but these growable tables: code words,
//! function descriptors, type-info entries, data handles for constants,
//! and the interned C-string pool. The compiler appends, the linker
//! patches, the VM reads, and chunk I/O copies them byte for byte.

use rustc_hash::FxHashMap;

/// Function descriptor flag bits.
pub mod func_flags {
    /// Member function of a class.
    pub const METHOD: u32 = 1 << 0;
    /// Constructor.
    pub const CTOR: u32 = 1 << 1;
    /// Copy constructor.
    pub const CCTOR: u32 = 1 << 2;
    /// Destructor.
    pub const DTOR: u32 = 1 << 3;
    /// Conversion method.
    pub const CONVERTOR: u32 = 1 << 4;
    /// Property accessor.
    pub const ACCESSOR: u32 = 1 << 5;
    /// Cofunction.
    pub const COFUNC: u32 = 1 << 6;
    /// Anonymous (lambda) function.
    pub const ANONYMOUS: u32 = 1 << 7;
    /// Declared `explicit`.
    pub const EXPLICIT: u32 = 1 << 8;
    /// Declared inside a `strict` class.
    pub const STRICT: u32 = 1 << 9;
    /// Declared `virtual`.
    pub const VIRTUAL: u32 = 1 << 10;
    /// Implemented by a native type, no script body.
    pub const NATIVE: u32 = 1 << 11;
    /// Synthesized global initializer, run at bootstrap.
    pub const INIT: u32 = 1 << 12;
}

/// Type-info flag bits.
pub mod type_flags {
    /// Implemented by a registered native type.
    pub const NATIVE: u32 = 1 << 0;
    /// Declared `strict`.
    pub const STRICT: u32 = 1 << 1;
    /// Pure native interface, cannot be implemented in script code.
    pub const NATIVE_INTERFACE: u32 = 1 << 2;
}

/// Sentinel for an absent special method slot.
pub const NO_METHOD: u32 = u32::MAX;

/// Sentinel for a v-table slot the linker has not resolved.
pub const UNRESOLVED: u32 = u32::MAX;

/// The class family of a type-info entry.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, num_enum::TryFromPrimitive)]
pub enum TypeFamily {
    /// Not a real type; the null handle's family.
    Undefined = 0,
    /// Built-in value types: int, float, string.
    Integral = 1,
    /// Script or native class.
    Class = 2,
    /// Interface.
    Interface = 3,
    /// Cofunction task.
    Thread = 4,
    /// First-class function type.
    Delegate = 5,
}

/// Indices of the special methods of a class, `NO_METHOD` when absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MethodInfo {
    /// Default constructor (function segment index).
    pub ctor: u32,
    /// Copy constructor.
    pub cctor: u32,
    /// Destructor.
    pub dtor: u32,
    /// `toString` convertor.
    pub tostr: u32,
}

impl Default for MethodInfo {
    fn default() -> Self {
        Self {
            ctor: NO_METHOD,
            cctor: NO_METHOD,
            dtor: NO_METHOD,
            tostr: NO_METHOD,
        }
    }
}

/// Runtime descriptor of one type.
///
/// Entries are append-only within a restore-point window and the
/// name-to-id mapping is stable for the lifetime of a compile.
#[derive(Debug, Clone)]
pub struct TypeInfo {
    /// Self index in the type segment.
    pub type_id: u32,
    /// Inherited interface id, 0 if none.
    pub base_id: u32,
    /// Implementation base for hybrid classes, 0 if none.
    pub hybrid_id: u32,
    /// Class family tag.
    pub family: TypeFamily,
    /// `type_flags` bits.
    pub flags: u32,
    /// Offset of the type name in the C-string pool.
    pub name_offs: u32,
    /// Instance size in handles (script classes only).
    pub instance_size: u32,
    /// V-table: function segment index per method slot.
    pub vtable: Vec<u32>,
    /// Special method slots.
    pub methods: MethodInfo,
}

impl TypeInfo {
    /// A fresh entry with no base, no v-table and no flags.
    pub fn new(type_id: u32, family: TypeFamily, name_offs: u32) -> Self {
        Self {
            type_id,
            base_id: 0,
            hybrid_id: 0,
            family,
            flags: 0,
            name_offs,
            instance_size: 0,
            vtable: Vec::new(),
            methods: MethodInfo::default(),
        }
    }

    /// True if the type is backed by a native type procedure.
    #[inline]
    pub fn is_native(&self) -> bool {
        self.flags & type_flags::NATIVE != 0
    }
}

/// Descriptor of one function in the function segment.
///
/// `code_addr` and `code_size` stay zero until the link pass assigns the
/// final layout of the code segment.
#[derive(Debug, Clone, Default)]
pub struct FuncInfo {
    /// Type id of the owning class; the global type for free functions.
    pub type_id: u32,
    /// `func_flags` bits.
    pub flags: u32,
    /// Absolute code address, written at link.
    pub code_addr: u32,
    /// Code size in words, written at link.
    pub code_size: u32,
    /// Number of declared arguments.
    pub arg_count: u32,
    /// Slot in the owner's v-table; `NO_METHOD` for free functions.
    pub member_idx: u32,
    /// Offset of the function name in the C-string pool.
    pub name_offs: u32,
}

impl FuncInfo {
    /// True once the linker has placed this function's body.
    #[inline]
    pub fn has_body(&self) -> bool {
        self.code_size != 0
    }
}

/// Immutable constant template in the data segment.
///
/// Same shape as a runtime handle; the VM materializes a live handle from
/// each entry at initialization. Strings store their C-string pool offset
/// in the payload.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataHandle {
    /// Type id of the constant.
    pub type_id: u32,
    /// Raw payload bits: i64, f64 bits, or cstr offset.
    pub payload: u64,
}

impl DataHandle {
    /// An integer constant.
    pub fn int(value: i64) -> Self {
        Self {
            type_id: crate::type_ids::INT,
            payload: value as u64,
        }
    }

    /// A float constant.
    pub fn float(value: f64) -> Self {
        Self {
            type_id: crate::type_ids::FLOAT,
            payload: value.to_bits(),
        }
    }

    /// A string constant referencing the C-string pool.
    pub fn string(offs: u32) -> Self {
        Self {
            type_id: crate::type_ids::STRING,
            payload: offs as u64,
        }
    }
}

/// Interned, NUL-terminated string pool.
///
/// Offsets are stable once handed out. The intern map is a compile-time
/// convenience and is rebuilt lazily after a chunk load.
#[derive(Debug, Default, Clone)]
pub struct CStrPool {
    bytes: Vec<u8>,
    intern: FxHashMap<String, u32>,
}

impl CStrPool {
    /// Empty pool whose offset 0 is the empty string.
    pub fn new() -> Self {
        let mut pool = Self {
            bytes: Vec::new(),
            intern: FxHashMap::default(),
        };
        pool.add("");
        pool
    }

    /// Intern a string, returning its pool offset.
    pub fn add(&mut self, s: &str) -> u32 {
        if let Some(&offs) = self.intern.get(s) {
            return offs;
        }
        let offs = self.bytes.len() as u32;
        self.bytes.extend_from_slice(s.as_bytes());
        self.bytes.push(0);
        self.intern.insert(s.to_string(), offs);
        offs
    }

    /// Read the string at a pool offset.
    ///
    /// Returns the empty string for an out-of-range offset; a chunk that
    /// passes validation never produces one.
    pub fn get(&self, offs: u32) -> &str {
        let start = offs as usize;
        if start >= self.bytes.len() {
            return "";
        }
        let end = self.bytes[start..]
            .iter()
            .position(|&b| b == 0)
            .map(|p| start + p)
            .unwrap_or(self.bytes.len());
        std::str::from_utf8(&self.bytes[start..end]).unwrap_or("")
    }

    /// Pool size in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// True when the pool holds nothing at all (pre-init state).
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Raw pool bytes for chunk serialization.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Rebuild a pool from chunk bytes, re-interning every entry.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        let mut intern = FxHashMap::default();
        let mut start = 0;
        while start < bytes.len() {
            let end = bytes[start..]
                .iter()
                .position(|&b| b == 0)
                .map(|p| start + p)
                .unwrap_or(bytes.len());
            if let Ok(s) = std::str::from_utf8(&bytes[start..end]) {
                intern.entry(s.to_string()).or_insert(start as u32);
            }
            start = end + 1;
        }
        Self { bytes, intern }
    }

    /// Truncate the pool to a byte length, dropping newer interns.
    pub fn truncate(&mut self, len: usize) {
        self.bytes.truncate(len);
        self.intern.retain(|_, &mut offs| (offs as usize) < len);
    }
}

/// The five segments of one program.
#[derive(Debug, Default, Clone)]
pub struct Segments {
    /// Executable code words.
    pub code: Vec<u32>,
    /// Function descriptors.
    pub functions: Vec<FuncInfo>,
    /// Type-info entries, indexed by type id.
    pub types: Vec<TypeInfo>,
    /// Constant templates.
    pub data: Vec<DataHandle>,
    /// Interned string pool.
    pub cstr: CStrPool,
}

impl Segments {
    /// Empty segments with an initialized string pool.
    pub fn new() -> Self {
        Self {
            code: Vec::new(),
            functions: Vec::new(),
            types: Vec::new(),
            data: Vec::new(),
            cstr: CStrPool::new(),
        }
    }

    /// Append a type-info entry, returning its id.
    pub fn add_type(&mut self, family: TypeFamily, name: &str) -> u32 {
        let type_id = self.types.len() as u32;
        let name_offs = self.cstr.add(name);
        self.types.push(TypeInfo::new(type_id, family, name_offs));
        type_id
    }

    /// Append a function descriptor, returning its segment index.
    pub fn add_function(&mut self, func: FuncInfo) -> u32 {
        let idx = self.functions.len() as u32;
        self.functions.push(func);
        idx
    }

    /// Look up a type id by name. Linear scan; the compiler keeps its own
    /// interned map for the hot path.
    pub fn find_type(&self, name: &str) -> Option<u32> {
        self.types
            .iter()
            .find(|t| self.cstr.get(t.name_offs) == name)
            .map(|t| t.type_id)
    }

    /// Name of a type id, for diagnostics.
    pub fn type_name(&self, type_id: u32) -> &str {
        self.types
            .get(type_id as usize)
            .map(|t| self.cstr.get(t.name_offs))
            .unwrap_or("")
    }

    /// Name of a function, for diagnostics.
    pub fn function_name(&self, func_idx: u32) -> &str {
        self.functions
            .get(func_idx as usize)
            .map(|f| self.cstr.get(f.name_offs))
            .unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cstr_interning() {
        let mut pool = CStrPool::new();
        let a = pool.add("hello");
        let b = pool.add("world");
        let c = pool.add("hello");
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(pool.get(a), "hello");
        assert_eq!(pool.get(b), "world");
        assert_eq!(pool.get(0), "");
    }

    #[test]
    fn test_cstr_rebuild_from_bytes() {
        let mut pool = CStrPool::new();
        let a = pool.add("alpha");
        let b = pool.add("beta");
        let rebuilt = CStrPool::from_bytes(pool.as_bytes().to_vec());
        assert_eq!(rebuilt.get(a), "alpha");
        assert_eq!(rebuilt.get(b), "beta");
        // Re-interning must reuse existing offsets.
        let mut rebuilt = rebuilt;
        assert_eq!(rebuilt.add("alpha"), a);
    }

    #[test]
    fn test_cstr_truncate_drops_interns() {
        let mut pool = CStrPool::new();
        let a = pool.add("keep");
        let mark = pool.len();
        let b = pool.add("drop");
        pool.truncate(mark);
        assert_eq!(pool.add("keep"), a);
        let b2 = pool.add("drop");
        assert_eq!(b2, b); // same offset, freshly re-interned
    }

    #[test]
    fn test_data_handle_payloads() {
        let i = DataHandle::int(-7);
        assert_eq!(i.payload as i64, -7);
        let f = DataHandle::float(2.5);
        assert_eq!(f64::from_bits(f.payload), 2.5);
    }

    #[test]
    fn test_type_registration() {
        let mut seg = Segments::new();
        let id = seg.add_type(TypeFamily::Class, "Point");
        assert_eq!(seg.find_type("Point"), Some(id));
        assert_eq!(seg.type_name(id), "Point");
        assert_eq!(seg.find_type("Missing"), None);
    }
}
