//! Binary chunk save and load.
//!
//! A chunk is the serialized form of the five segments plus an optional
//! symbol table, preceded by a header carrying a versioned magic and the
//! per-segment sizes. Sizes are entry counts except the C-string pool and
//! the symbol table, which are byte counts. Multi-byte fields use the
//! saving host's endianness; there is no portable swap, a foreign-endian
//! chunk simply fails size validation.

use crate::segment::{
    CStrPool, DataHandle, FuncInfo, MethodInfo, Segments, TypeFamily, TypeInfo,
};
use crate::symtab::SymbolTable;
use thiserror::Error;

/// Magic prefix; the runtime version string is appended and the field is
/// NUL-padded to [`CHUNK_MAGIC_LEN`].
pub const MAGIC_PREFIX: &str = "BRLVM_";

/// Runtime version stamped into the magic. Bumping it invalidates every
/// previously saved chunk.
pub const RUNTIME_VERSION: &str = "0300";

/// Total magic field length in bytes.
pub const CHUNK_MAGIC_LEN: usize = 16;

/// Header size in bytes: magic + 8 size fields.
const HEADER_LEN: usize = CHUNK_MAGIC_LEN + 8 * 4;

/// Serialized size of one function descriptor.
const FUNC_ENTRY_LEN: usize = 7 * 4;
/// Serialized size of the fixed part of one type-info entry.
const TYPE_ENTRY_LEN: usize = 13 * 4;
/// Serialized size of one data handle.
const DATA_ENTRY_LEN: usize = 4 + 8;

/// Chunk save/load errors.
#[derive(Debug, Error)]
pub enum ChunkError {
    /// Magic does not match this runtime version.
    #[error("chunk magic does not match runtime version {RUNTIME_VERSION}")]
    BadMagic,

    /// Header size fields disagree with the actual chunk length.
    #[error("chunk size mismatch: header claims {expected} bytes, chunk has {actual}")]
    SizeMismatch {
        /// Size computed from the header fields.
        expected: usize,
        /// Actual byte length of the chunk.
        actual: usize,
    },

    /// Chunk ends before a segment is complete.
    #[error("chunk truncated at offset {0}")]
    Truncated(usize),

    /// A type-info entry carries an unknown family tag.
    #[error("invalid type family {0} in type-info segment")]
    BadFamily(u32),
}

/// Reader over a chunk byte buffer.
struct ChunkReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ChunkReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], ChunkError> {
        if self.pos + len > self.data.len() {
            return Err(ChunkError::Truncated(self.pos));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn read_u32(&mut self) -> Result<u32, ChunkError> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_ne_bytes(bytes.try_into().unwrap()))
    }

    fn read_u64(&mut self) -> Result<u64, ChunkError> {
        let bytes = self.read_bytes(8)?;
        Ok(u64::from_ne_bytes(bytes.try_into().unwrap()))
    }
}

/// Writer producing a chunk byte buffer.
struct ChunkWriter {
    buffer: Vec<u8>,
}

impl ChunkWriter {
    fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    fn emit_u32(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_ne_bytes());
    }

    fn emit_u64(&mut self, value: u64) {
        self.buffer.extend_from_slice(&value.to_ne_bytes());
    }

    fn patch_u32(&mut self, offset: usize, value: u32) {
        self.buffer[offset..offset + 4].copy_from_slice(&value.to_ne_bytes());
    }
}

/// A serialized program.
pub struct Chunk;

impl Chunk {
    /// The versioned magic field.
    pub fn magic() -> [u8; CHUNK_MAGIC_LEN] {
        let mut magic = [0u8; CHUNK_MAGIC_LEN];
        let id = format!("{MAGIC_PREFIX}{RUNTIME_VERSION}");
        magic[..id.len()].copy_from_slice(id.as_bytes());
        magic
    }

    /// Serialize segments and an optional symbol table into a chunk.
    pub fn save(segments: &Segments, symtab: Option<&SymbolTable>) -> Vec<u8> {
        let mut w = ChunkWriter::new();

        // Header: magic, then total size (patched last) and segment sizes.
        w.buffer.extend_from_slice(&Self::magic());
        let size_offs = w.buffer.len();
        w.emit_u32(0); // total size, patched below
        w.emit_u32(segments.code.len() as u32);
        w.emit_u32(segments.functions.len() as u32);
        w.emit_u32(segments.types.len() as u32);
        let vtab_words: usize = segments.types.iter().map(|t| t.vtable.len()).sum();
        w.emit_u32(vtab_words as u32);
        w.emit_u32(segments.data.len() as u32);
        w.emit_u32(segments.cstr.len() as u32);
        let symtab_bytes = symtab.map(|t| t.encoded_len()).unwrap_or(0);
        w.emit_u32(symtab_bytes as u32);

        // Code segment.
        for &word in &segments.code {
            w.emit_u32(word);
        }

        // Function segment.
        for f in &segments.functions {
            w.emit_u32(f.type_id);
            w.emit_u32(f.flags);
            w.emit_u32(f.code_addr);
            w.emit_u32(f.code_size);
            w.emit_u32(f.arg_count);
            w.emit_u32(f.member_idx);
            w.emit_u32(f.name_offs);
        }

        // Type-info segment: fixed entries referencing the parallel
        // v-table run that follows, so load rebuilds indices without
        // pointer fix-ups.
        let mut vtab_offs = 0u32;
        for t in &segments.types {
            w.emit_u32(t.type_id);
            w.emit_u32(t.base_id);
            w.emit_u32(t.hybrid_id);
            w.emit_u32(t.family as u32);
            w.emit_u32(t.flags);
            w.emit_u32(t.name_offs);
            w.emit_u32(t.instance_size);
            w.emit_u32(vtab_offs);
            w.emit_u32(t.vtable.len() as u32);
            w.emit_u32(t.methods.ctor);
            w.emit_u32(t.methods.cctor);
            w.emit_u32(t.methods.dtor);
            w.emit_u32(t.methods.tostr);
            vtab_offs += t.vtable.len() as u32;
        }
        for t in &segments.types {
            for &slot in &t.vtable {
                w.emit_u32(slot);
            }
        }

        // Data segment.
        for d in &segments.data {
            w.emit_u32(d.type_id);
            w.emit_u64(d.payload);
        }

        // C-string pool.
        w.buffer.extend_from_slice(segments.cstr.as_bytes());

        // Symbol table.
        if let Some(table) = symtab {
            table.encode_into(&mut w.buffer);
        }

        let total = w.buffer.len() as u32;
        w.patch_u32(size_offs, total);
        w.buffer
    }

    /// Deserialize a chunk, validating magic and total size first.
    pub fn load(data: &[u8]) -> Result<(Segments, Option<SymbolTable>), ChunkError> {
        if data.len() < HEADER_LEN {
            return Err(ChunkError::Truncated(data.len()));
        }
        if data[..CHUNK_MAGIC_LEN] != Self::magic() {
            return Err(ChunkError::BadMagic);
        }

        let mut r = ChunkReader::new(&data[CHUNK_MAGIC_LEN..]);
        let total = r.read_u32()? as usize;
        let code_entries = r.read_u32()? as usize;
        let func_entries = r.read_u32()? as usize;
        let type_entries = r.read_u32()? as usize;
        let vtab_words = r.read_u32()? as usize;
        let data_entries = r.read_u32()? as usize;
        let cstr_bytes = r.read_u32()? as usize;
        let symtab_bytes = r.read_u32()? as usize;

        let expected = HEADER_LEN
            + code_entries * 4
            + func_entries * FUNC_ENTRY_LEN
            + type_entries * TYPE_ENTRY_LEN
            + vtab_words * 4
            + data_entries * DATA_ENTRY_LEN
            + cstr_bytes
            + symtab_bytes;
        if expected != data.len() || total != data.len() {
            return Err(ChunkError::SizeMismatch {
                expected,
                actual: data.len(),
            });
        }

        let mut segments = Segments::default();

        segments.code.reserve(code_entries);
        for _ in 0..code_entries {
            segments.code.push(r.read_u32()?);
        }

        segments.functions.reserve(func_entries);
        for _ in 0..func_entries {
            segments.functions.push(FuncInfo {
                type_id: r.read_u32()?,
                flags: r.read_u32()?,
                code_addr: r.read_u32()?,
                code_size: r.read_u32()?,
                arg_count: r.read_u32()?,
                member_idx: r.read_u32()?,
                name_offs: r.read_u32()?,
            });
        }

        // Fixed type entries first, then resolve v-tables from the
        // parallel run.
        let mut pending = Vec::with_capacity(type_entries);
        for _ in 0..type_entries {
            let type_id = r.read_u32()?;
            let base_id = r.read_u32()?;
            let hybrid_id = r.read_u32()?;
            let family_raw = r.read_u32()?;
            let family = TypeFamily::try_from(family_raw)
                .map_err(|_| ChunkError::BadFamily(family_raw))?;
            let flags = r.read_u32()?;
            let name_offs = r.read_u32()?;
            let instance_size = r.read_u32()?;
            let vtab_offs = r.read_u32()? as usize;
            let vtab_size = r.read_u32()? as usize;
            let methods = MethodInfo {
                ctor: r.read_u32()?,
                cctor: r.read_u32()?,
                dtor: r.read_u32()?,
                tostr: r.read_u32()?,
            };
            pending.push((
                TypeInfo {
                    type_id,
                    base_id,
                    hybrid_id,
                    family,
                    flags,
                    name_offs,
                    instance_size,
                    vtable: Vec::new(),
                    methods,
                },
                vtab_offs,
                vtab_size,
            ));
        }
        let mut vtab_run = Vec::with_capacity(vtab_words);
        for _ in 0..vtab_words {
            vtab_run.push(r.read_u32()?);
        }
        for (mut t, offs, size) in pending {
            if offs + size > vtab_run.len() {
                return Err(ChunkError::Truncated(r.pos));
            }
            t.vtable = vtab_run[offs..offs + size].to_vec();
            segments.types.push(t);
        }

        segments.data.reserve(data_entries);
        for _ in 0..data_entries {
            segments.data.push(DataHandle {
                type_id: r.read_u32()?,
                payload: r.read_u64()?,
            });
        }

        segments.cstr = CStrPool::from_bytes(r.read_bytes(cstr_bytes)?.to_vec());

        let symtab = if symtab_bytes > 0 {
            Some(SymbolTable::decode(r.read_bytes(symtab_bytes)?)?)
        } else {
            None
        };

        Ok((segments, symtab))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::{func_flags, TypeFamily};

    fn sample_segments() -> Segments {
        let mut seg = Segments::new();
        let name = seg.cstr.add("main");
        seg.code.extend_from_slice(&[1, 0, 0, 44]);
        seg.functions.push(FuncInfo {
            type_id: 5,
            flags: func_flags::STRICT,
            code_addr: 0,
            code_size: 4,
            arg_count: 0,
            member_idx: crate::segment::NO_METHOD,
            name_offs: name,
        });
        let tid = seg.add_type(TypeFamily::Class, "Point");
        seg.types[tid as usize].instance_size = 2;
        seg.types[tid as usize].vtable = vec![0, 7];
        seg.data.push(DataHandle::int(42));
        seg.data.push(DataHandle::float(1.5));
        seg
    }

    #[test]
    fn test_save_load_roundtrip() {
        let seg = sample_segments();
        let bytes = Chunk::save(&seg, None);
        let (loaded, symtab) = Chunk::load(&bytes).unwrap();
        assert!(symtab.is_none());
        assert_eq!(loaded.code, seg.code);
        assert_eq!(loaded.functions.len(), 1);
        assert_eq!(loaded.functions[0].code_size, 4);
        assert_eq!(loaded.types.len(), 1);
        assert_eq!(loaded.types[0].vtable, vec![0, 7]);
        assert_eq!(loaded.data, seg.data);
        assert_eq!(loaded.cstr.get(loaded.functions[0].name_offs), "main");
    }

    #[test]
    fn test_save_is_deterministic() {
        // save -> load -> save must be byte-identical.
        let seg = sample_segments();
        let first = Chunk::save(&seg, None);
        let (loaded, _) = Chunk::load(&first).unwrap();
        let second = Chunk::save(&loaded, None);
        assert_eq!(first, second);
    }

    #[test]
    fn test_bad_magic() {
        let seg = sample_segments();
        let mut bytes = Chunk::save(&seg, None);
        bytes[0] = b'X';
        assert!(matches!(Chunk::load(&bytes), Err(ChunkError::BadMagic)));
    }

    #[test]
    fn test_size_mismatch() {
        let seg = sample_segments();
        let mut bytes = Chunk::save(&seg, None);
        bytes.push(0);
        assert!(matches!(
            Chunk::load(&bytes),
            Err(ChunkError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn test_truncated_header() {
        assert!(matches!(
            Chunk::load(&[0u8; 10]),
            Err(ChunkError::Truncated(_))
        ));
    }

    #[test]
    fn test_symbol_table_roundtrip() {
        let seg = sample_segments();
        let mut table = SymbolTable::new();
        table.add("entry", b"main".to_vec());
        table.add("opts", vec![1, 2, 3]);
        let bytes = Chunk::save(&seg, Some(&table));
        let (_, loaded) = Chunk::load(&bytes).unwrap();
        let loaded = loaded.unwrap();
        assert_eq!(loaded.find("entry").unwrap(), b"main");
        assert_eq!(loaded.find("opts").unwrap(), &[1, 2, 3]);
    }
}
