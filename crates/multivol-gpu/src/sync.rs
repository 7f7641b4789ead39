//! Synchronization primitives.

use crate::error::Result;
use ash::vk;
use multivol_core::{FrameIndex, FrameRing};

/// Create a fence.
///
/// # Safety
/// The device must be valid.
pub unsafe fn create_fence(device: &ash::Device, signaled: bool) -> Result<vk::Fence> {
    let flags = if signaled {
        vk::FenceCreateFlags::SIGNALED
    } else {
        vk::FenceCreateFlags::empty()
    };

    let create_info = vk::FenceCreateInfo::default().flags(flags);
    let fence = device.create_fence(&create_info, None)?;
    Ok(fence)
}

/// Wait for a fence to be signaled.
///
/// # Safety
/// The device and fence must be valid.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub unsafe fn wait_for_fence(
    device: &ash::Device,
    fence: vk::Fence,
    timeout_ns: u64,
) -> Result<()> {
    device.wait_for_fences(&[fence], true, timeout_ns)?;
    Ok(())
}

/// Reset a fence to unsignaled state.
///
/// # Safety
/// The device and fence must be valid.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub unsafe fn reset_fence(device: &ash::Device, fence: vk::Fence) -> Result<()> {
    device.reset_fences(&[fence])?;
    Ok(())
}

/// One fence per frame slot.
///
/// Waiting on the fence of frame `f` before rewriting that slot's per-frame
/// data is what makes the [`FrameRing`] rotation safe.
pub struct FrameFences {
    fences: FrameRing<vk::Fence>,
}

impl FrameFences {
    /// Create signaled fences for every frame slot.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(device: &ash::Device) -> Result<Self> {
        let fences = FrameRing::try_from_fn(
            |_| create_fence(device, true),
            |fence| device.destroy_fence(fence, None),
        )?;
        Ok(Self { fences })
    }

    /// Fence guarding a frame slot.
    pub fn fence(&self, frame: FrameIndex) -> vk::Fence {
        self.fences[frame]
    }

    /// Block until the GPU has retired the previous use of `frame`'s slot,
    /// then reset its fence for the next submission.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn acquire(&self, device: &ash::Device, frame: FrameIndex) -> Result<()> {
        wait_for_fence(device, self.fences[frame], u64::MAX)?;
        reset_fence(device, self.fences[frame])
    }

    /// Wait for every slot.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn wait_all(&self, device: &ash::Device) -> Result<()> {
        let fences: Vec<vk::Fence> = self.fences.iter().copied().collect();
        device.wait_for_fences(&fences, true, u64::MAX)?;
        Ok(())
    }

    /// Destroy the fences.
    ///
    /// # Safety
    /// The device must be valid and the fences must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        for &fence in self.fences.iter() {
            device.destroy_fence(fence, None);
        }
    }
}
