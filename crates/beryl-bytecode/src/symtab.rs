//! Optional symbol table carried at the end of a chunk.
//!
//! Entries are `{name, data}` pairs. Both payloads are length-prefixed and
//! padded to 4-byte alignment so the table can be memory-scanned on any
//! host. The table may be truncated before save to strip debug data.

use crate::chunk::ChunkError;

/// One `{name, data}` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolEntry {
    /// Symbol name.
    pub name: String,
    /// Opaque payload owned by whoever wrote the entry.
    pub data: Vec<u8>,
}

/// Ordered symbol table.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    entries: Vec<SymbolEntry>,
}

fn padded(len: usize) -> usize {
    (len + 3) & !3
}

impl SymbolTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry. Duplicate names are legal; `find` returns the
    /// first match.
    pub fn add(&mut self, name: &str, data: Vec<u8>) {
        self.entries.push(SymbolEntry {
            name: name.to_string(),
            data,
        });
    }

    /// First entry payload with the given name.
    pub fn find(&self, name: &str) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.data.as_slice())
    }

    /// Remove every entry with the given name. Returns how many went.
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.name != name);
        before - self.entries.len()
    }

    /// Drop all entries from `keep` onward.
    pub fn truncate(&mut self, keep: usize) {
        self.entries.truncate(keep);
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the table has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All entries in insertion order.
    pub fn entries(&self) -> &[SymbolEntry] {
        &self.entries
    }

    /// Encoded byte length: entry count word plus aligned payloads.
    pub fn encoded_len(&self) -> usize {
        4 + self
            .entries
            .iter()
            .map(|e| 4 + padded(e.name.len()) + 4 + padded(e.data.len()))
            .sum::<usize>()
    }

    /// Append the encoded table to a buffer.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.entries.len() as u32).to_ne_bytes());
        for e in &self.entries {
            out.extend_from_slice(&(e.name.len() as u32).to_ne_bytes());
            out.extend_from_slice(e.name.as_bytes());
            out.resize(out.len() + padded(e.name.len()) - e.name.len(), 0);
            out.extend_from_slice(&(e.data.len() as u32).to_ne_bytes());
            out.extend_from_slice(&e.data);
            out.resize(out.len() + padded(e.data.len()) - e.data.len(), 0);
        }
    }

    /// Decode a table from its chunk section.
    pub fn decode(bytes: &[u8]) -> Result<Self, ChunkError> {
        let mut pos = 0usize;
        let read_u32 = |bytes: &[u8], pos: &mut usize| -> Result<u32, ChunkError> {
            if *pos + 4 > bytes.len() {
                return Err(ChunkError::Truncated(*pos));
            }
            let v = u32::from_ne_bytes(bytes[*pos..*pos + 4].try_into().unwrap());
            *pos += 4;
            Ok(v)
        };

        let count = read_u32(bytes, &mut pos)? as usize;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let name_len = read_u32(bytes, &mut pos)? as usize;
            if pos + padded(name_len) > bytes.len() {
                return Err(ChunkError::Truncated(pos));
            }
            let name = String::from_utf8_lossy(&bytes[pos..pos + name_len]).into_owned();
            pos += padded(name_len);

            let data_len = read_u32(bytes, &mut pos)? as usize;
            if pos + padded(data_len) > bytes.len() {
                return Err(ChunkError::Truncated(pos));
            }
            let data = bytes[pos..pos + data_len].to_vec();
            pos += padded(data_len);

            entries.push(SymbolEntry { name, data });
        }
        Ok(Self { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_with_alignment() {
        let mut table = SymbolTable::new();
        table.add("a", vec![1]); // 1-byte name and payload force padding
        table.add("entry", b"main.bc".to_vec());
        let mut bytes = Vec::new();
        table.encode_into(&mut bytes);
        assert_eq!(bytes.len(), table.encoded_len());
        assert_eq!(bytes.len() % 4, 0);

        let decoded = SymbolTable::decode(&bytes).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded.find("a").unwrap(), &[1]);
        assert_eq!(decoded.find("entry").unwrap(), b"main.bc");
    }

    #[test]
    fn test_remove_and_truncate() {
        let mut table = SymbolTable::new();
        table.add("x", vec![]);
        table.add("y", vec![2]);
        table.add("x", vec![3]);
        assert_eq!(table.remove("x"), 2);
        assert_eq!(table.len(), 1);
        table.add("z", vec![4]);
        table.truncate(1);
        assert_eq!(table.len(), 1);
        assert!(table.find("z").is_none());
        assert_eq!(table.find("y").unwrap(), &[2]);
    }

    #[test]
    fn test_decode_truncated() {
        let mut table = SymbolTable::new();
        table.add("name", vec![9; 10]);
        let mut bytes = Vec::new();
        table.encode_into(&mut bytes);
        bytes.truncate(bytes.len() - 4);
        assert!(SymbolTable::decode(&bytes).is_err());
    }
}
