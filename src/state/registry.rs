use super::{DeviceElement, HostObject, ObjectHandle, ObjectKind};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Device-residency facts about one host object, shared by every context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GlobalObjectState {
    /// Device holding the most recent copy, if any. Never owns the host data.
    pub owner: Option<usize>,
    /// Whether the host copy is consistent with the owner's copy.
    pub shared: bool,
}

impl GlobalObjectState {
    pub fn is_exclusive(&self) -> bool {
        self.owner.is_some() && !self.shared
    }
}

struct Entry {
    object: HostObject,
    state: GlobalObjectState,
}

/// Registry of host objects keyed by opaque handles.
///
/// Objects live until [`ObjectRegistry::release`] is called; outstanding
/// [`HostObject`] clones keep the host bytes alive, not the registry entry.
pub struct ObjectRegistry {
    next_id: AtomicU64,
    entries: RwLock<HashMap<ObjectHandle, Entry>>,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Register raw bytes of the given kind.
    pub fn register(&self, kind: ObjectKind, bytes: Vec<u8>) -> HostObject {
        let handle = ObjectHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        let object = HostObject::new(handle, kind, Arc::new(Mutex::new(bytes)));
        trace!(%handle, ?kind, "register host object");
        self.entries.write().insert(
            handle,
            Entry {
                object: object.clone(),
                state: GlobalObjectState::default(),
            },
        );
        object
    }

    pub fn array<T: DeviceElement>(&self, values: &[T]) -> HostObject {
        self.register(
            ObjectKind::Array(T::TYPE),
            bytemuck::cast_slice(values).to_vec(),
        )
    }

    /// Zero-filled array of `len` elements.
    pub fn zeroed<T: DeviceElement>(&self, len: usize) -> HostObject {
        self.register(
            ObjectKind::Array(T::TYPE),
            vec![0u8; len * std::mem::size_of::<T>()],
        )
    }

    pub fn scalar<T: DeviceElement>(&self, value: T) -> HostObject {
        self.register(ObjectKind::Scalar, bytemuck::bytes_of(&value).to_vec())
    }

    pub fn resolve(&self, handle: ObjectHandle) -> Option<HostObject> {
        self.entries.read().get(&handle).map(|e| e.object.clone())
    }

    pub fn state(&self, handle: ObjectHandle) -> Option<GlobalObjectState> {
        self.entries.read().get(&handle).map(|e| e.state)
    }

    /// Record the device that now holds the latest copy of `handle`.
    pub fn set_owner(&self, handle: ObjectHandle, device: usize, shared: bool) {
        if let Some(entry) = self.entries.write().get_mut(&handle) {
            entry.state = GlobalObjectState {
                owner: Some(device),
                shared,
            };
        }
    }

    pub fn clear_owner(&self, handle: ObjectHandle) {
        if let Some(entry) = self.entries.write().get_mut(&handle) {
            entry.state = GlobalObjectState::default();
        }
    }

    /// Forget `handle`; returns false if it was not registered.
    pub fn release(&self, handle: ObjectHandle) -> bool {
        let removed = self.entries.write().remove(&handle).is_some();
        if removed {
            trace!(%handle, "release host object");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ObjectRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ObjectRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectRegistry")
            .field("objects", &self.len())
            .finish()
    }
}
