//! Alias buckets and LIFO recording scopes.
//!
//! This is thread-local rather than a process-wide `static`: a bucket keeps
//! its own clone of the root's `Box<dyn BackendBuffer>` so the allocation
//! survives even after the original root handle is dropped while children
//! still reference it, and `dyn BackendBuffer` is deliberately not `Send`
//! (the `cpu_f32` backend aliases buffers with `Rc`, not `Arc`). A `static`
//! item must be `Sync`, so the registry lives in a `thread_local!` instead,
//! matching the single-threaded-per-registry contract this crate is
//! specified against.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use crate::backend::{Backend, BackendBuffer};
use crate::error::{Error, Result};

struct Bucket {
    root_backend: Arc<dyn Backend>,
    root_buffer: Box<dyn BackendBuffer>,
    members: std::collections::HashSet<Uuid>,
}

struct Scope {
    id: u64,
    // Insertion-ordered: freeing a scope must free its members in the order
    // they were registered.
    uuids: Vec<Uuid>,
}

#[derive(Default)]
struct RegistryState {
    buckets: HashMap<Uuid, Bucket>,
    entries: HashMap<Uuid, Uuid>,
    scopes: Vec<Scope>,
    next_record_id: u64,
}

thread_local! {
    static REGISTRY: RefCell<RegistryState> = RefCell::new(RegistryState::default());
}

/// A bucket's root backend and a handle aliasing its buffer, returned by
/// [`deregister`] when the freed storage was the last member of its bucket
/// so the caller can actually release the allocation.
pub(crate) struct FreedRoot {
    pub backend: Arc<dyn Backend>,
    pub buffer: Box<dyn BackendBuffer>,
}

fn track_in_active_scopes(state: &mut RegistryState, uuid: Uuid) {
    for scope in state.scopes.iter_mut() {
        if !scope.uuids.contains(&uuid) {
            scope.uuids.push(uuid);
        }
    }
}

fn untrack_from_all_scopes(state: &mut RegistryState, uuid: Uuid) {
    for scope in state.scopes.iter_mut() {
        scope.uuids.retain(|&u| u != uuid);
    }
}

/// Registers a new root, creating its bucket. Idempotent if `uuid` is
/// already registered.
pub(crate) fn register_root(uuid: Uuid, backend: Arc<dyn Backend>, buffer: Box<dyn BackendBuffer>) {
    REGISTRY.with(|r| {
        let mut state = r.borrow_mut();
        if state.entries.contains_key(&uuid) {
            return;
        }
        state.buckets.insert(
            uuid,
            Bucket {
                root_backend: backend,
                root_buffer: buffer,
                members: std::collections::HashSet::from([uuid]),
            },
        );
        state.entries.insert(uuid, uuid);
        track_in_active_scopes(&mut state, uuid);
        log::trace!("storage_registry: bucket {uuid} created");
    });
}

/// Registers `uuid` as a child of `parent`'s bucket. Fails with
/// [`Error::StorageRegistryParentNotRegistered`] if `parent` has no bucket.
/// Idempotent if `uuid` is already registered.
pub(crate) fn register_child(uuid: Uuid, parent: Uuid) -> Result<()> {
    REGISTRY.with(|r| {
        let mut state = r.borrow_mut();
        if state.entries.contains_key(&uuid) {
            return Ok(());
        }
        let bucket_id = *state
            .entries
            .get(&parent)
            .ok_or_else(|| Error::StorageRegistryParentNotRegistered { parent }.bt())?;
        match state.buckets.get_mut(&bucket_id) {
            Some(bucket) => bucket.members.insert(uuid),
            None => crate::bail!("bucket {bucket_id} missing for registered uuid {parent}"),
        };
        state.entries.insert(uuid, bucket_id);
        track_in_active_scopes(&mut state, uuid);
        Ok(())
    })
}

/// Removes `uuid`'s membership, from its bucket and from every active
/// scope. Returns `Some(FreedRoot)` if this was the bucket's last member.
/// A `uuid` with no current registration is treated as a no-op, matching
/// the idempotent-registration contract.
pub(crate) fn deregister(uuid: Uuid) -> Result<Option<FreedRoot>> {
    REGISTRY.with(|r| {
        let mut state = r.borrow_mut();
        let bucket_id = match state.entries.remove(&uuid) {
            Some(id) => id,
            None => return Ok(None),
        };
        untrack_from_all_scopes(&mut state, uuid);
        let bucket_empty = {
            let bucket = match state.buckets.get_mut(&bucket_id) {
                Some(bucket) => bucket,
                None => crate::bail!("bucket {bucket_id} missing for registered uuid {uuid}"),
            };
            bucket.members.remove(&uuid);
            bucket.members.is_empty()
        };
        if bucket_empty {
            let bucket = match state.buckets.remove(&bucket_id) {
                Some(bucket) => bucket,
                None => crate::bail!("bucket {bucket_id} vanished before its last member could remove it"),
            };
            log::trace!("storage_registry: bucket {bucket_id} destroyed");
            Ok(Some(FreedRoot {
                backend: bucket.root_backend,
                buffer: bucket.root_buffer,
            }))
        } else {
            Ok(None)
        }
    })
}

/// Returns a fresh handle aliasing the bucket's root buffer, plus the
/// bucket's root uuid and backend.
pub(crate) fn root_handle(uuid: Uuid) -> Result<(Uuid, Arc<dyn Backend>, Box<dyn BackendBuffer>)> {
    REGISTRY.with(|r| {
        let state = r.borrow();
        let bucket_id = *state
            .entries
            .get(&uuid)
            .ok_or_else(|| Error::StorageHandleUninitialized { uuid }.bt())?;
        let bucket = match state.buckets.get(&bucket_id) {
            Some(bucket) => bucket,
            None => crate::bail!("bucket {bucket_id} missing for registered uuid {uuid}"),
        };
        Ok((bucket_id, Arc::clone(&bucket.root_backend), bucket.root_buffer.clone_handle()))
    })
}

pub(crate) fn is_root(uuid: Uuid) -> Result<bool> {
    REGISTRY.with(|r| {
        let state = r.borrow();
        let bucket_id = state
            .entries
            .get(&uuid)
            .ok_or_else(|| Error::StorageHandleUninitialized { uuid }.bt())?;
        Ok(*bucket_id == uuid)
    })
}

pub(crate) fn bucket_size(uuid: Uuid) -> Result<usize> {
    REGISTRY.with(|r| {
        let state = r.borrow();
        let bucket_id = state
            .entries
            .get(&uuid)
            .ok_or_else(|| Error::StorageHandleUninitialized { uuid }.bt())?;
        Ok(state.buckets.get(bucket_id).map_or(0, |b| b.members.len()))
    })
}

pub(crate) fn count() -> usize {
    REGISTRY.with(|r| r.borrow().entries.len())
}

/// Pushes a new recording scope, returning the id used to stop it later.
pub(crate) fn start_recording() -> u64 {
    REGISTRY.with(|r| {
        let mut state = r.borrow_mut();
        let id = state.next_record_id;
        state.next_record_id += 1;
        state.scopes.push(Scope { id, uuids: Vec::new() });
        id
    })
}

/// Pops the scope `record_id`, which must be the scope on top of the stack
/// (recording scopes are strictly LIFO). Returns the uuids still tracked by
/// the scope, in registration order, for the caller to free. Does not free
/// anything itself.
pub(crate) fn stop_recording(record_id: u64) -> Result<Vec<Uuid>> {
    REGISTRY.with(|r| {
        let mut state = r.borrow_mut();
        match state.scopes.last() {
            Some(scope) if scope.id == record_id => Ok(state.scopes.pop().unwrap().uuids),
            _ => {
                let stack: Vec<u64> = state.scopes.iter().map(|s| s.id).collect();
                log::warn!(
                    "storage_registry: stop_recording({record_id}) is not the top of the scope stack {stack:?}"
                );
                Err(Error::StorageRegistryRecordNotFound { record_id }.bt())
            }
        }
    })
}

/// Exempts `uuid` from the scope `record_id`'s cleanup set. The scope need
/// not be on top of the stack: exempting an output is legal as soon as the
/// output exists, regardless of how many nested scopes have since opened.
pub(crate) fn record_remove(record_id: u64, uuid: Uuid) -> Result<()> {
    REGISTRY.with(|r| {
        let mut state = r.borrow_mut();
        let scope = state
            .scopes
            .iter_mut()
            .find(|s| s.id == record_id)
            .ok_or_else(|| Error::StorageRegistryRecordNotFound { record_id }.bt())?;
        scope.uuids.retain(|&u| u != uuid);
        Ok(())
    })
}

pub(crate) fn cleanup() {
    REGISTRY.with(|r| {
        *r.borrow_mut() = RegistryState::default();
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu_backend::CpuF32Backend;
    use crate::layout::Layout;
    use crate::shape::Shape;

    fn fresh_buffer() -> (Arc<dyn Backend>, Box<dyn BackendBuffer>) {
        let backend: Arc<dyn Backend> = Arc::new(CpuF32Backend::with_num_threads(1));
        let layout = Layout::new(&Shape::from((2, 3))).unwrap();
        let buffer = backend.init(&layout).unwrap();
        (backend, buffer)
    }

    #[test]
    fn root_then_child_share_a_bucket() {
        cleanup();
        let root_uuid = Uuid::new_v4();
        let (backend, buffer) = fresh_buffer();
        register_root(root_uuid, backend, buffer);
        let child_uuid = Uuid::new_v4();
        register_child(child_uuid, root_uuid).unwrap();
        assert_eq!(bucket_size(root_uuid).unwrap(), 2);
        assert_eq!(bucket_size(child_uuid).unwrap(), 2);
        assert!(is_root(root_uuid).unwrap());
        assert!(!is_root(child_uuid).unwrap());
    }

    #[test]
    fn freeing_children_does_not_free_root_until_last() {
        cleanup();
        let root_uuid = Uuid::new_v4();
        let (backend, buffer) = fresh_buffer();
        register_root(root_uuid, backend, buffer);
        let v1 = Uuid::new_v4();
        let v2 = Uuid::new_v4();
        register_child(v1, root_uuid).unwrap();
        register_child(v2, root_uuid).unwrap();

        assert!(deregister(v1).unwrap().is_none());
        assert_eq!(bucket_size(root_uuid).unwrap(), 2);
        assert!(deregister(v2).unwrap().is_none());
        assert_eq!(bucket_size(root_uuid).unwrap(), 1);
        let freed = deregister(root_uuid).unwrap();
        assert!(freed.is_some());
        assert!(bucket_size(root_uuid).is_err());
    }

    #[test]
    fn child_of_unregistered_parent_fails() {
        cleanup();
        let err = register_child(Uuid::new_v4(), Uuid::new_v4()).unwrap_err();
        assert_eq!(
            err.code(),
            Some(crate::error::ErrorCode::StorageRegistryParentNotRegistered)
        );
    }

    #[test]
    fn recording_scopes_are_strictly_lifo() {
        cleanup();
        let outer = start_recording();
        let inner = start_recording();
        assert!(stop_recording(outer).is_err());
        assert!(stop_recording(inner).is_ok());
        assert!(stop_recording(outer).is_ok());
    }

    #[test]
    fn recording_scope_tracks_registrations_and_exemptions() {
        cleanup();
        let record = start_recording();
        let root_uuid = Uuid::new_v4();
        let (backend, buffer) = fresh_buffer();
        register_root(root_uuid, backend, buffer);
        let child_uuid = Uuid::new_v4();
        register_child(child_uuid, root_uuid).unwrap();

        record_remove(record, child_uuid).unwrap();
        let remaining = stop_recording(record).unwrap();
        assert_eq!(remaining, vec![root_uuid]);
    }
}
