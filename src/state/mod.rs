//! Host objects and their device-side state.
//!
//! Host data is registered in an [`ObjectRegistry`], which hands out
//! [`HostObject`] handles and tracks one [`GlobalObjectState`] per object.
//! Each execution context keeps a [`LocalObjectState`] per bound object.

pub mod local;
pub mod registry;

pub use local::LocalObjectState;
pub use registry::{GlobalObjectState, ObjectRegistry};

use crate::device::HostMemory;
use crate::error::{Error, Result};
use bytemuck::Pod;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque key of a registered host object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectHandle(pub(crate) u64);

impl ObjectHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj{}", self.0)
    }
}

/// Element types an array object can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ElementType {
    Byte,
    Char,
    Short,
    Int,
    Float,
    Long,
    Double,
}

impl ElementType {
    /// Size of one element in bytes.
    pub fn size(&self) -> usize {
        match self {
            ElementType::Byte => 1,
            ElementType::Char | ElementType::Short => 2,
            ElementType::Int | ElementType::Float => 4,
            ElementType::Long | ElementType::Double => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectKind {
    Array(ElementType),
    Scalar,
}

/// Rust element types with a device representation.
pub trait DeviceElement: Pod {
    const TYPE: ElementType;
}

macro_rules! device_element {
    ($($ty:ty => $elem:ident),* $(,)?) => {
        $(
            impl DeviceElement for $ty {
                const TYPE: ElementType = ElementType::$elem;
            }
        )*
    };
}

device_element! {
    u8 => Byte,
    i8 => Byte,
    u16 => Char,
    i16 => Short,
    i32 => Int,
    u32 => Int,
    f32 => Float,
    i64 => Long,
    u64 => Long,
    f64 => Double,
}

/// Cloneable handle to registered host memory.
#[derive(Clone)]
pub struct HostObject {
    handle: ObjectHandle,
    kind: ObjectKind,
    data: HostMemory,
}

impl HostObject {
    pub(crate) fn new(handle: ObjectHandle, kind: ObjectKind, data: HostMemory) -> Self {
        Self { handle, kind, data }
    }

    pub fn handle(&self) -> ObjectHandle {
        self.handle
    }

    pub fn kind(&self) -> ObjectKind {
        self.kind
    }

    pub fn is_scalar(&self) -> bool {
        self.kind == ObjectKind::Scalar
    }

    pub fn element_type(&self) -> Option<ElementType> {
        match self.kind {
            ObjectKind::Array(elem) => Some(elem),
            ObjectKind::Scalar => None,
        }
    }

    pub fn byte_len(&self) -> usize {
        self.data.lock().len()
    }

    /// Shared storage handed to device reads.
    pub fn memory(&self) -> HostMemory {
        self.data.clone()
    }

    /// Copy of the bytes in `range`.
    pub fn bytes(&self, offset: usize, length: usize) -> Result<Vec<u8>> {
        let data = self.data.lock();
        let end = offset
            .checked_add(length)
            .filter(|end| *end <= data.len())
            .ok_or_else(|| {
                Error::config(format!(
                    "range {}..{} is outside {} ({} bytes)",
                    offset,
                    offset.saturating_add(length),
                    self.handle,
                    data.len()
                ))
            })?;
        Ok(data[offset..end].to_vec())
    }

    /// Typed copy of the object's contents.
    pub fn to_vec<T: DeviceElement>(&self) -> Result<Vec<T>> {
        self.check_type::<T>()?;
        Ok(bytemuck::pod_collect_to_vec(&self.data.lock()))
    }

    /// Overwrite the object's contents; the length must not change.
    pub fn copy_from<T: DeviceElement>(&self, values: &[T]) -> Result<()> {
        self.check_type::<T>()?;
        let src: &[u8] = bytemuck::cast_slice(values);
        let mut data = self.data.lock();
        if src.len() != data.len() {
            return Err(Error::config(format!(
                "{} holds {} bytes, got {}",
                self.handle,
                data.len(),
                src.len()
            )));
        }
        data.copy_from_slice(src);
        Ok(())
    }

    fn check_type<T: DeviceElement>(&self) -> Result<()> {
        match self.kind {
            ObjectKind::Array(elem) if elem != T::TYPE => Err(Error::config(format!(
                "{} holds {:?} elements, not {:?}",
                self.handle,
                elem,
                T::TYPE
            ))),
            _ => Ok(()),
        }
    }
}

impl fmt::Debug for HostObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostObject")
            .field("handle", &self.handle)
            .field("kind", &self.kind)
            .field("bytes", &self.byte_len())
            .finish()
    }
}
