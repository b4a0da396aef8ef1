//! Export and import tables of one connection
//!
//! Exports map a handle to the local object behind it; imports map a handle
//! to the proxy standing in for the peer's object.

use super::proxy::MarshaledProxy;
use hubrpc::{LocalTarget, RequestId};
use std::collections::HashMap;
use std::sync::Arc;

/// A local object exported under a handle
#[derive(Clone, Debug)]
pub struct ExportEntry {
    pub handle: i64,
    pub target: Arc<LocalTarget>,
    /// Connection methods registered for this object
    pub method_names: Vec<String>,
    pub optional_interfaces: Vec<i32>,
    /// Set once a call carrying the object completed successfully
    pub delivered: bool,
}

/// Identity key of an exported object
fn object_key(target: &Arc<LocalTarget>) -> usize {
    Arc::as_ptr(target) as *const () as usize
}

/// Exported objects of a connection
#[derive(Default)]
pub struct ExportTable {
    by_handle: HashMap<i64, ExportEntry>,
    by_object: HashMap<usize, i64>,
    /// Handles carried by each outbound call still in flight
    by_call: HashMap<RequestId, Vec<i64>>,
}

impl ExportTable {
    /// Handle already assigned to `target`, if any
    pub fn handle_of(&self, target: &Arc<LocalTarget>) -> Option<i64> {
        self.by_object.get(&object_key(target)).copied()
    }

    pub fn insert(&mut self, entry: ExportEntry) {
        self.by_object.insert(object_key(&entry.target), entry.handle);
        self.by_handle.insert(entry.handle, entry);
    }

    pub fn lookup(&self, handle: i64) -> Option<&ExportEntry> {
        self.by_handle.get(&handle)
    }

    pub fn remove(&mut self, handle: i64) -> Option<ExportEntry> {
        let entry = self.by_handle.remove(&handle)?;
        self.by_object.remove(&object_key(&entry.target));
        for handles in self.by_call.values_mut() {
            handles.retain(|h| *h != handle);
        }
        Some(entry)
    }

    /// Remember that `call` carries `handle`
    pub fn track_call(&mut self, call: RequestId, handle: i64) {
        let handles = self.by_call.entry(call).or_default();
        if !handles.contains(&handle) {
            handles.push(handle);
        }
    }

    /// `call` was answered; its objects reached the peer
    pub fn call_delivered(&mut self, call: RequestId) {
        for handle in self.by_call.remove(&call).unwrap_or_default() {
            if let Some(entry) = self.by_handle.get_mut(&handle) {
                entry.delivered = true;
            }
        }
    }

    /// `call` failed; removes and returns the objects no other call delivered
    pub fn call_failed(&mut self, call: RequestId) -> Vec<ExportEntry> {
        let orphans: Vec<i64> = self
            .by_call
            .remove(&call)
            .unwrap_or_default()
            .into_iter()
            .filter(|h| self.by_handle.get(h).map(|e| !e.delivered).unwrap_or(false))
            .collect();
        orphans.into_iter().filter_map(|h| self.remove(h)).collect()
    }

    pub fn drain(&mut self) -> Vec<ExportEntry> {
        self.by_object.clear();
        self.by_call.clear();
        self.by_handle.drain().map(|(_, e)| e).collect()
    }

    pub fn len(&self) -> usize {
        self.by_handle.len()
    }
}

/// Imported proxies of a connection
#[derive(Default)]
pub struct ImportTable {
    by_handle: HashMap<i64, Arc<MarshaledProxy>>,
}

impl ImportTable {
    pub fn lookup(&self, handle: i64) -> Option<Arc<MarshaledProxy>> {
        self.by_handle.get(&handle).cloned()
    }

    pub fn insert(&mut self, proxy: Arc<MarshaledProxy>) {
        self.by_handle.insert(proxy.handle(), proxy);
    }

    pub fn remove(&mut self, handle: i64) -> Option<Arc<MarshaledProxy>> {
        self.by_handle.remove(&handle)
    }

    pub fn drain(&mut self) -> Vec<Arc<MarshaledProxy>> {
        self.by_handle.drain().map(|(_, p)| p).collect()
    }

    pub fn len(&self) -> usize {
        self.by_handle.len()
    }
}
