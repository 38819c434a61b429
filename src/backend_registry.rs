//! Process-wide, name-addressable backend lookup.
//!
//! Backends self-register once, at [`crate::init_library`] time, before any
//! storage is created. Lookup afterwards never blocks on a write: the table
//! is built once under a lock and then read through an `RwLock` that is
//! essentially always taken for read.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use crate::backend::Backend;
use crate::error::{Error, Result};

struct Registry {
    backends: RwLock<HashMap<&'static str, Arc<dyn Backend>>>,
}

static REGISTRY: OnceLock<Registry> = OnceLock::new();

fn registry() -> &'static Registry {
    REGISTRY.get_or_init(|| Registry {
        backends: RwLock::new(HashMap::new()),
    })
}

/// Registers `backend` under [`Backend::name`]. Fails with
/// [`Error::BackendRegistryDuplicate`] if that name is already taken.
pub fn register(backend: Arc<dyn Backend>) -> Result<()> {
    let name = backend.name();
    let mut backends = registry().backends.write().expect("backend registry poisoned");
    if backends.contains_key(name) {
        return Err(Error::BackendRegistryDuplicate { name: name.into() }.bt());
    }
    backends.insert(name, backend);
    log::debug!("registered backend '{name}'");
    Ok(())
}

/// Looks up a backend by name. Returns [`Error::BackendRegistryBackendNotFound`]
/// rather than an `Option` since every caller of this function is, in
/// practice, about to fail the whole operation if the name is unknown.
pub fn get(name: &str) -> Result<Arc<dyn Backend>> {
    let backends = registry().backends.read().expect("backend registry poisoned");
    backends
        .get(name)
        .cloned()
        .ok_or_else(|| Error::BackendRegistryBackendNotFound { name: name.into() }.bt())
}

pub fn is_registered(name: &str) -> bool {
    registry()
        .backends
        .read()
        .expect("backend registry poisoned")
        .contains_key(name)
}

/// Registers every built-in backend. Idempotent: a backend already present
/// under its name is left untouched rather than treated as a duplicate,
/// since this is what makes library re-initialization a no-op.
pub(crate) fn init_builtin_backends() -> Result<()> {
    if !is_registered(crate::cpu_backend::CPU_F32_BACKEND_NAME) {
        register(Arc::new(crate::cpu_backend::CpuF32Backend::new()))?;
    }
    Ok(())
}

/// Drops every registered backend. Only meaningful once no storage still
/// references one of them; the caller ([`crate::cleanup_library`]) is
/// responsible for tearing down the storage registry first.
pub(crate) fn cleanup() {
    registry()
        .backends
        .write()
        .expect("backend registry poisoned")
        .clear();
}

pub(crate) fn count() -> usize {
    registry().backends.read().expect("backend registry poisoned").len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu_backend::{CpuF32Backend, CPU_F32_BACKEND_NAME};

    // Backend registration tests share the single global registry, so they
    // all go through the idempotent `init_builtin_backends` path rather
    // than asserting on a pristine, empty table.

    #[test]
    fn register_then_lookup_round_trips() {
        init_builtin_backends().unwrap();
        let backend = get(CPU_F32_BACKEND_NAME).unwrap();
        assert_eq!(backend.name(), CPU_F32_BACKEND_NAME);
    }

    #[test]
    fn duplicate_registration_fails() {
        init_builtin_backends().unwrap();
        let err = register(Arc::new(CpuF32Backend::new())).unwrap_err();
        assert_eq!(
            err.code(),
            Some(crate::error::ErrorCode::BackendRegistryDuplicate)
        );
    }

    #[test]
    fn unknown_name_fails() {
        init_builtin_backends().unwrap();
        let err = get("cpu_f64_does_not_exist").unwrap_err();
        assert_eq!(
            err.code(),
            Some(crate::error::ErrorCode::BackendRegistryBackendNotFound)
        );
    }
}
