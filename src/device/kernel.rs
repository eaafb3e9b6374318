//! Kernels executed by the host device.

use crate::scheduler::WorkGeometry;
use bytemuck::Pod;
use std::marker::PhantomData;

/// Trait for kernels the host device can run.
///
/// A kernel sees the launch geometry and the argument buffers in the order the
/// task declared them. Returning an error marks the launch event as failed.
pub trait HostKernel: Send + Sync {
    fn run(&self, ctx: &mut KernelContext<'_>) -> Result<(), String>;
}

impl<F> HostKernel for F
where
    F: Fn(&mut KernelContext<'_>) -> Result<(), String> + Send + Sync,
{
    fn run(&self, ctx: &mut KernelContext<'_>) -> Result<(), String> {
        self(ctx)
    }
}

/// View of one launch handed to a [`HostKernel`].
pub struct KernelContext<'a> {
    geometry: &'a WorkGeometry,
    buffers: &'a mut [Vec<u8>],
}

impl std::fmt::Debug for KernelContext<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelContext")
            .field("geometry", self.geometry)
            .field("args", &self.buffers.len())
            .finish()
    }
}

impl<'a> KernelContext<'a> {
    pub(crate) fn new(geometry: &'a WorkGeometry, buffers: &'a mut [Vec<u8>]) -> Self {
        Self { geometry, buffers }
    }

    pub fn dims(&self) -> usize {
        self.geometry.dims()
    }

    pub fn global_size(&self, dim: usize) -> u64 {
        self.geometry.global.get(dim).copied().unwrap_or(1)
    }

    pub fn local_size(&self, dim: usize) -> u64 {
        self.geometry.local.get(dim).copied().unwrap_or(1)
    }

    /// Total number of work items.
    pub fn work_items(&self) -> u64 {
        self.geometry.global.iter().product()
    }

    pub fn num_args(&self) -> usize {
        self.buffers.len()
    }

    pub fn bytes(&self, arg: usize) -> Result<&[u8], String> {
        self.buffers
            .get(arg)
            .map(Vec::as_slice)
            .ok_or_else(|| format!("argument {} out of range", arg))
    }

    /// Copy argument `arg` out as a typed vector.
    pub fn read<T: Pod>(&self, arg: usize) -> Result<Vec<T>, String> {
        let bytes = self.bytes(arg)?;
        Ok(bytemuck::pod_collect_to_vec(bytes))
    }

    /// Overwrite the start of argument `arg` with `values`.
    pub fn write<T: Pod>(&mut self, arg: usize, values: &[T]) -> Result<(), String> {
        let src: &[u8] = bytemuck::cast_slice(values);
        let dst = self
            .buffers
            .get_mut(arg)
            .ok_or_else(|| format!("argument {} out of range", arg))?;
        if src.len() > dst.len() {
            return Err(format!(
                "write of {} bytes overflows argument {} ({} bytes)",
                src.len(),
                arg,
                dst.len()
            ));
        }
        dst[..src.len()].copy_from_slice(src);
        Ok(())
    }
}

/// `out[i] = a[i] + b[i]` over the first dimension; arguments are `(a, b, out)`.
#[derive(Debug)]
pub struct VectorAddKernel<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> VectorAddKernel<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for VectorAddKernel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HostKernel for VectorAddKernel<T>
where
    T: Pod + std::ops::Add<Output = T>,
{
    fn run(&self, ctx: &mut KernelContext<'_>) -> Result<(), String> {
        if ctx.num_args() != 3 {
            return Err(format!("vector add expects 3 arguments, got {}", ctx.num_args()));
        }
        let a: Vec<T> = ctx.read(0)?;
        let b: Vec<T> = ctx.read(1)?;
        let n = (ctx.global_size(0) as usize).min(a.len()).min(b.len());
        let out: Vec<T> = a[..n].iter().zip(&b[..n]).map(|(x, y)| *x + *y).collect();
        ctx.write(2, &out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry(global: u64) -> WorkGeometry {
        WorkGeometry {
            global: vec![global],
            local: vec![1],
        }
    }

    #[test]
    fn test_vector_add_kernel() {
        let a: Vec<u8> = bytemuck::cast_slice(&[1.0f32, 2.0, 3.0, 4.0]).to_vec();
        let b: Vec<u8> = bytemuck::cast_slice(&[10.0f32, 20.0, 30.0, 40.0]).to_vec();
        let mut buffers = vec![a, b, vec![0u8; 16]];
        let geometry = geometry(4);

        let mut ctx = KernelContext::new(&geometry, &mut buffers);
        VectorAddKernel::<f32>::new().run(&mut ctx).unwrap();

        let out: Vec<f32> = ctx.read(2).unwrap();
        assert_eq!(out, vec![11.0, 22.0, 33.0, 44.0]);
    }

    #[test]
    fn test_write_overflow_is_reported() {
        let mut buffers = vec![vec![0u8; 4]];
        let geometry = geometry(1);
        let mut ctx = KernelContext::new(&geometry, &mut buffers);

        let err = ctx.write(0, &[1u32, 2u32]).unwrap_err();
        assert!(err.contains("overflows"));
        assert!(ctx.read::<u32>(5).is_err());
    }

    #[test]
    fn test_closure_kernel() {
        let kernel = |ctx: &mut KernelContext<'_>| -> Result<(), String> {
            let n = ctx.global_size(0) as usize;
            ctx.write(0, &vec![7i32; n])
        };
        let mut buffers = vec![vec![0u8; 12]];
        let geometry = geometry(3);
        let mut ctx = KernelContext::new(&geometry, &mut buffers);
        kernel.run(&mut ctx).unwrap();
        assert_eq!(ctx.read::<i32>(0).unwrap(), vec![7, 7, 7]);
    }
}
