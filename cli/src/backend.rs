//! Compute backend chosen by cargo feature.
//!
//! `cuda` wins over `wgpu`, which wins over the default `ndarray`. Training
//! always runs on the autodiff wrapper of the selected backend.

use burn::backend::Autodiff;
use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(feature = "cuda")] {
        use burn::backend::cuda::{Cuda, CudaDevice};

        pub type SelectedBackend = Cuda;
        pub type SelectedDevice = CudaDevice;

        pub fn create_device() -> SelectedDevice {
            CudaDevice::default()
        }

        /// Backend name for the start-up banner.
        pub const fn backend_name() -> &'static str {
            "CUDA"
        }
    } else if #[cfg(feature = "wgpu")] {
        use burn::backend::wgpu::{Wgpu, WgpuDevice};

        pub type SelectedBackend = Wgpu;
        pub type SelectedDevice = WgpuDevice;

        pub fn create_device() -> SelectedDevice {
            WgpuDevice::default()
        }

        /// Backend name for the start-up banner.
        pub const fn backend_name() -> &'static str {
            "GPU (wgpu)"
        }
    } else {
        use burn::backend::ndarray::{NdArray, NdArrayDevice};

        pub type SelectedBackend = NdArray;
        pub type SelectedDevice = NdArrayDevice;

        pub fn create_device() -> SelectedDevice {
            NdArrayDevice::default()
        }

        /// Backend name for the start-up banner.
        pub const fn backend_name() -> &'static str {
            "CPU"
        }
    }
}

/// The backend the training loop differentiates through.
pub type TrainingBackend = Autodiff<SelectedBackend>;
