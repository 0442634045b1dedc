//! Mark-sweep garbage collection.
//!
//! Reference counting is the primary lifecycle; the mark pass is the
//! final resort for cycles of strong references. It runs on request
//! (and on the configured instruction interval), observes a quiescent
//! state, marks everything reachable from the root set, asks native
//! types to mark their owned handles, then frees whatever stayed
//! unmarked.

use beryl_sdk::{HandleMarker, HandleRef, NativeMessage};

use crate::handle::{hflags, HandleId, HandleTable, Payload};
use crate::machine::Machine;

/// Statistics of one collection cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    /// Handles alive before the sweep.
    pub live_before: usize,
    /// Handles freed by the sweep.
    pub collected: usize,
}

/// Marker adapter handed to native `MarkHandles` dispatches; collects
/// the reported edges.
struct EdgeCollector {
    edges: Vec<HandleId>,
}

impl HandleMarker for EdgeCollector {
    fn mark(&mut self, handle: HandleRef) {
        if !handle.is_null() {
            self.edges.push(handle.0);
        }
    }
}

impl Machine {
    /// Run one mark-sweep cycle. Returns what was freed.
    pub fn gc_collect(&mut self) -> GcStats {
        let live_before = self.handles.live_count();

        // ===== Mark =====
        let mut work: Vec<HandleId> = Vec::new();
        work.extend(self.cur.referenced());
        for frame in &self.resume_stack {
            work.extend(frame.caller.referenced());
        }
        if self.globals != 0 {
            work.push(self.globals);
        }
        work.extend(self.data_handles.iter().copied().filter(|&id| id != 0));
        work.extend(self.pinned_roots().iter().copied());

        while let Some(id) = work.pop() {
            let marked = match self.handles.get(id) {
                Some(h) => h.flags & hflags::MARKED != 0,
                None => continue,
            };
            if marked {
                continue;
            }
            if let Some(h) = self.handles.get_mut(id) {
                h.flags |= hflags::MARKED;
            }

            // Follow the payload's edges.
            let native_type = {
                let h = self.handles.get(id).unwrap();
                match &h.payload {
                    Payload::Object(o) => {
                        let members = self.fixmem.words(o.block)[..o.count as usize].to_vec();
                        work.extend(members.into_iter().filter(|&m| m != 0));
                        None
                    }
                    Payload::Native(_) => Some(h.type_id),
                    other => {
                        HandleTable::payload_refs(other, &mut work);
                        None
                    }
                }
            };
            if let Some(type_id) = native_type {
                work.extend(self.mark_native(type_id, id));
            }
        }

        // ===== Sweep =====
        // Pass 1: find the garbage. Pass 2: balance the counts of
        // surviving handles referenced by dying ones. Pass 3: free.
        let doomed: Vec<HandleId> = self
            .handles
            .live_ids()
            .into_iter()
            .filter(|&id| id != 0)
            .filter(|&id| {
                self.handles
                    .get(id)
                    .map(|h| h.flags & (hflags::MARKED | hflags::PERSIST) == 0)
                    .unwrap_or(false)
            })
            .collect();

        for &id in &doomed {
            let mut edges: Vec<HandleId> = Vec::new();
            if let Some(h) = self.handles.get(id) {
                match &h.payload {
                    Payload::Object(o) => {
                        edges.extend(
                            self.fixmem.words(o.block)[..o.count as usize]
                                .iter()
                                .copied()
                                .filter(|&m| m != 0),
                        );
                    }
                    other => HandleTable::payload_refs(other, &mut edges),
                }
            }
            for edge in edges {
                let survives = self
                    .handles
                    .get(edge)
                    .map(|h| h.flags & (hflags::MARKED | hflags::PERSIST) != 0)
                    .unwrap_or(false);
                if survives {
                    self.release_id(edge);
                }
            }
        }
        for &id in &doomed {
            if let Some(h) = self.handles.take(id) {
                self.drop_payload(h.type_id, h.payload);
            }
        }

        // Clear the mark bits; they are only valid during a cycle.
        for id in self.handles.live_ids() {
            if let Some(h) = self.handles.get_mut(id) {
                h.flags &= !hflags::MARKED;
            }
        }

        let stats = GcStats {
            live_before,
            collected: doomed.len(),
        };
        match self.compiler.options.log_garbage {
            beryl_compiler::GcLog::None => {}
            beryl_compiler::GcLog::Brief => {
                log::debug!(
                    "gc: {} live, {} collected",
                    stats.live_before,
                    stats.collected
                );
            }
            beryl_compiler::GcLog::All => {
                log::debug!(
                    "gc: {} live, {} collected: {:?}",
                    stats.live_before,
                    stats.collected,
                    doomed
                );
            }
        }
        stats
    }

    /// Dispatch `MarkHandles` to a native type for one of its objects,
    /// collecting the edges it reports.
    fn mark_native(&mut self, type_id: u32, id: HandleId) -> Vec<HandleId> {
        let mut proc_ = match self.natives.take(type_id) {
            Some(p) => p,
            None => return Vec::new(),
        };
        let mut object = match self.handles.get_mut(id).map(|h| &mut h.payload) {
            Some(Payload::Native(n)) => n.object.take(),
            _ => None,
        };
        let mut collector = EdgeCollector { edges: Vec::new() };
        if let Some(obj) = object.as_mut() {
            let result = proc_.dispatch(NativeMessage::MarkHandles {
                object: obj,
                marker: &mut collector,
            });
            if let Err(err) = result {
                log::warn!("native mark failed on handle {id}: {err}");
            }
        }
        if let Some(obj) = object {
            if let Some(Payload::Native(n)) = self.handles.get_mut(id).map(|h| &mut h.payload) {
                n.object = Some(obj);
            }
        }
        self.natives.put_back(type_id, proc_);
        collector.edges
    }
}
