use burn::{backend::Autodiff, prelude::Backend as BackendTrait};
use log::warn;

#[cfg(feature = "cuda")]
mod selected {
    use burn::backend::{Cuda, cuda::CudaDevice};
    use log::warn;

    pub type Backend = Cuda<f32, i32>;

    pub const NAME: &str = "cuda";

    pub fn device(id: usize, use_gpu: bool) -> CudaDevice {
        if !use_gpu {
            warn!("The cuda backend has no CPU device, ignoring use_gpu: false");
        }
        CudaDevice::new(id)
    }
}

#[cfg(all(feature = "wgpu", not(feature = "cuda")))]
mod selected {
    use burn::backend::{Wgpu, wgpu::WgpuDevice};

    pub type Backend = Wgpu<f32, i32>;

    pub const NAME: &str = "wgpu";

    pub fn device(id: usize, use_gpu: bool) -> WgpuDevice {
        if use_gpu {
            WgpuDevice::DiscreteGpu(id)
        } else {
            WgpuDevice::Cpu
        }
    }
}

#[cfg(all(feature = "ndarray", not(any(feature = "cuda", feature = "wgpu"))))]
mod selected {
    use burn::backend::{NdArray, ndarray::NdArrayDevice};

    pub type Backend = NdArray<f32>;

    pub const NAME: &str = "ndarray";

    pub fn device(_id: usize, _use_gpu: bool) -> NdArrayDevice {
        NdArrayDevice::Cpu
    }
}

#[cfg(not(any(feature = "cuda", feature = "wgpu", feature = "ndarray")))]
compile_error!("Enable one of the `wgpu`, `cuda` or `ndarray` features");

pub use selected::{Backend, NAME};

pub type TrainBackend = Autodiff<Backend>;

pub type Device = <TrainBackend as BackendTrait>::Device;

/// Maps configured device indices onto backend devices. Without GPUs there is
/// only one device to train on.
pub fn devices(ids: &[usize], use_gpu: bool) -> Vec<Device> {
    let single_device = !use_gpu || NAME == "ndarray";

    if single_device {
        if ids.len() > 1 {
            warn!(
                "{} device ids configured but training on a single {NAME} device",
                ids.len()
            );
        }
        return vec![selected::device(ids.first().copied().unwrap_or(0), use_gpu)];
    }

    ids.iter().map(|&id| selected::device(id, use_gpu)).collect()
}
