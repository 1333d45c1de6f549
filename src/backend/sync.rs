// Synchronization primitives
//
// One slot per frame in flight: a reusable command buffer plus the
// semaphore/semaphore/fence triple that orders acquire -> render -> present.
// Slots destroy their own objects when dropped.

use ash::vk;

use super::DeviceContext;
use crate::error::{Result, VkResultExt};

/// Move a live handle out, leaving null behind. Yields each handle at most once.
pub(crate) fn take_handle<H>(handle: &mut H) -> Option<H>
where
    H: vk::Handle + Default + Copy,
{
    let taken = std::mem::take(handle);
    (taken.as_raw() != 0).then_some(taken)
}

/// Frame synchronization - one per frame in flight
pub struct FrameSync {
    device: ash::Device,
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
}

impl FrameSync {
    pub fn new(device: &ash::Device) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        // Signaled so the first wait on a fresh slot returns immediately
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);

        let mut sync = Self {
            device: device.clone(),
            image_available: vk::Semaphore::null(),
            render_finished: vk::Semaphore::null(),
            in_flight_fence: vk::Fence::null(),
        };

        // On failure `sync` drops and releases whatever was created
        unsafe {
            sync.image_available = device
                .create_semaphore(&semaphore_info, None)
                .during("Create image-available semaphore")?;
            sync.render_finished = device
                .create_semaphore(&semaphore_info, None)
                .during("Create render-finished semaphore")?;
            sync.in_flight_fence = device
                .create_fence(&fence_info, None)
                .during("Create in-flight fence")?;
        }

        Ok(sync)
    }
}

impl Drop for FrameSync {
    fn drop(&mut self) {
        unsafe {
            if let Some(semaphore) = take_handle(&mut self.image_available) {
                self.device.destroy_semaphore(semaphore, None);
            }
            if let Some(semaphore) = take_handle(&mut self.render_finished) {
                self.device.destroy_semaphore(semaphore, None);
            }
            if let Some(fence) = take_handle(&mut self.in_flight_fence) {
                self.device.destroy_fence(fence, None);
            }
        }
    }
}

/// Command buffer + sync triple for one frame-in-flight index.
pub struct FrameSlot {
    pool: vk::CommandPool,
    pub command_buffer: vk::CommandBuffer,
    pub sync: FrameSync,
}

impl FrameSlot {
    /// Allocate `count` slots from the context's command pool.
    pub fn create_all(context: &DeviceContext, count: usize) -> Result<Vec<Self>> {
        let device = context.device();
        let pool = context.command_pool();

        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count as u32);

        let command_buffers = unsafe { device.allocate_command_buffers(&alloc_info) }
            .during("Allocate command buffers")?;

        let mut slots: Vec<Self> = Vec::with_capacity(count);
        for (i, &command_buffer) in command_buffers.iter().enumerate() {
            match FrameSync::new(device) {
                Ok(sync) => slots.push(Self {
                    pool,
                    command_buffer,
                    sync,
                }),
                Err(e) => {
                    // Slots built so far free their own buffers when dropped
                    unsafe { device.free_command_buffers(pool, &command_buffers[i..]) };
                    return Err(e);
                }
            }
        }

        log::debug!("Created {} frame slots", slots.len());
        Ok(slots)
    }

    /// Host wait on the slot's fence.
    pub fn wait(&self, device: &ash::Device) -> Result<()> {
        unsafe { device.wait_for_fences(&[self.sync.in_flight_fence], true, u64::MAX) }
            .during("Wait for in-flight fence")
    }

    /// Reset fence and command buffer. Only valid once `wait` returned.
    pub fn reset(&self, device: &ash::Device) -> Result<()> {
        unsafe {
            device
                .reset_fences(&[self.sync.in_flight_fence])
                .during("Reset in-flight fence")?;
            device
                .reset_command_buffer(self.command_buffer, vk::CommandBufferResetFlags::empty())
                .during("Reset command buffer")
        }
    }
}

impl Drop for FrameSlot {
    fn drop(&mut self) {
        if let Some(command_buffer) = take_handle(&mut self.command_buffer) {
            unsafe { self.sync.device.free_command_buffers(self.pool, &[command_buffer]) };
        }
    }
}
