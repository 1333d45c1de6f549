// Image Chain - Window presentation
//
// Owns the swapchain, one view per image, the depth attachment and, once a
// render pass exists, one framebuffer per image. Images themselves belong to
// the driver and are never destroyed here.

use ash::extensions::khr;
use ash::vk;
use glam::UVec2;
use std::sync::Arc;

use super::frame::{Acquire, Present};
use super::DeviceContext;
use crate::error::{RenderError, Result, VkResultExt};

/// Surface sentinel meaning "the caller picks the size".
pub const USE_REQUESTED_EXTENT: u32 = u32::MAX;

/// Depth formats in order of preference.
pub const DEPTH_FORMAT_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
];

// ─────────────────────────────────────────────────────────────────────────────
// Negotiation (pure)
// ─────────────────────────────────────────────────────────────────────────────

/// A zero width or height means the window is minimized.
pub fn has_area(width: u32, height: u32) -> bool {
    width > 0 && height > 0
}

/// Prefer BGRA8 sRGB with non-linear sRGB color space, else the first offered.
pub fn choose_swap_surface_format(available: &[vk::SurfaceFormatKHR]) -> Result<vk::SurfaceFormatKHR> {
    available
        .iter()
        .copied()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| available.first().copied())
        .ok_or(RenderError::NoSurfaceFormats)
}

/// `preferred` if offered, otherwise FIFO (always supported).
pub fn choose_swap_present_mode(
    available: &[vk::PresentModeKHR],
    preferred: vk::PresentModeKHR,
) -> Result<vk::PresentModeKHR> {
    if available.is_empty() {
        return Err(RenderError::NoPresentModes);
    }

    Ok(if available.contains(&preferred) {
        preferred
    } else {
        vk::PresentModeKHR::FIFO
    })
}

/// The surface's fixed extent, or the request clamped into its min/max box.
pub fn choose_swap_extent(caps: &vk::SurfaceCapabilitiesKHR, width: u32, height: u32) -> vk::Extent2D {
    if caps.current_extent.width != USE_REQUESTED_EXTENT {
        return caps.current_extent;
    }

    let min = UVec2::new(caps.min_image_extent.width, caps.min_image_extent.height);
    let max = UVec2::new(caps.max_image_extent.width, caps.max_image_extent.height);
    let clamped = UVec2::new(width, height).max(min).min(max);

    vk::Extent2D {
        width: clamped.x,
        height: clamped.y,
    }
}

/// One more than the minimum, capped when the surface sets a maximum.
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = caps.min_image_count + 1;
    if caps.max_image_count > 0 && count > caps.max_image_count {
        caps.max_image_count
    } else {
        count
    }
}

/// First candidate whose `tiling` features include `features`.
pub fn find_supported_format<F>(
    candidates: &[vk::Format],
    tiling: vk::ImageTiling,
    features: vk::FormatFeatureFlags,
    mut properties: F,
) -> Option<vk::Format>
where
    F: FnMut(vk::Format) -> vk::FormatProperties,
{
    candidates.iter().copied().find(|&format| {
        let props = properties(format);
        match tiling {
            vk::ImageTiling::LINEAR => props.linear_tiling_features.contains(features),
            vk::ImageTiling::OPTIMAL => props.optimal_tiling_features.contains(features),
            _ => false,
        }
    })
}

/// Depth format for the chain, or `None` when no depth attachment is wanted.
/// Format properties are only queried when it is.
pub fn choose_depth_format<F>(enabled: bool, properties: F) -> Result<Option<vk::Format>>
where
    F: FnMut(vk::Format) -> vk::FormatProperties,
{
    if !enabled {
        return Ok(None);
    }

    find_supported_format(
        &DEPTH_FORMAT_CANDIDATES,
        vk::ImageTiling::OPTIMAL,
        vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
        properties,
    )
    .map(Some)
    .ok_or(RenderError::NoDepthFormat)
}

/// First memory type allowed by `type_bits` whose flags include `required`.
pub fn find_memory_type(
    memory: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..memory.memory_type_count).find(|&i| {
        type_bits & (1 << i) != 0
            && memory.memory_types[i as usize].property_flags.contains(required)
    })
}

/// Everything negotiated with the surface before the swapchain is created.
#[derive(Clone, Copy, Debug)]
pub struct ChainPlan {
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub image_count: u32,
    pub transform: vk::SurfaceTransformFlagsKHR,
}

impl ChainPlan {
    pub fn negotiate(
        support: &super::SurfaceSupport,
        preferred_mode: vk::PresentModeKHR,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        Ok(Self {
            surface_format: choose_swap_surface_format(&support.formats)?,
            present_mode: choose_swap_present_mode(&support.present_modes, preferred_mode)?,
            extent: choose_swap_extent(&support.capabilities, width, height),
            image_count: choose_image_count(&support.capabilities),
            transform: support.capabilities.current_transform,
        })
    }

    /// Plan for a window of `width` x `height`, or `None` when there is
    /// nothing to render into: either the request or the extent the surface
    /// reports has zero area. A zero request is decided before looking at
    /// `support` at all.
    pub fn for_request(
        support: &super::SurfaceSupport,
        preferred_mode: vk::PresentModeKHR,
        width: u32,
        height: u32,
    ) -> Result<Option<Self>> {
        if !has_area(width, height) {
            return Ok(None);
        }

        let plan = Self::negotiate(support, preferred_mode, width, height)?;
        Ok(has_area(plan.extent.width, plan.extent.height).then_some(plan))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Per-generation bookkeeping (pure)
// ─────────────────────────────────────────────────────────────────────────────

/// Images of one chain generation, a view per image, and either no
/// framebuffers or exactly one per view.
///
/// Fills are all-or-nothing: a failure part way hands what was already
/// created to the destroy callback and leaves that list empty.
#[derive(Debug, Default)]
pub struct ImageSet {
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
    framebuffers: Vec<vk::Framebuffer>,
}

impl ImageSet {
    /// Take ownership of `images` (driver owned) and create one view for each.
    pub fn fill_views<C, D>(&mut self, images: Vec<vk::Image>, mut create: C, mut destroy: D) -> Result<()>
    where
        C: FnMut(vk::Image) -> Result<vk::ImageView>,
        D: FnMut(vk::ImageView),
    {
        debug_assert!(self.views.is_empty() && self.framebuffers.is_empty());

        for &image in &images {
            match create(image) {
                Ok(view) => self.views.push(view),
                Err(e) => {
                    self.views.drain(..).for_each(&mut destroy);
                    return Err(e);
                }
            }
        }

        self.images = images;
        Ok(())
    }

    /// One framebuffer per view, replacing any existing ones.
    pub fn fill_framebuffers<C, D>(&mut self, mut create: C, mut destroy: D) -> Result<()>
    where
        C: FnMut(usize, vk::ImageView) -> Result<vk::Framebuffer>,
        D: FnMut(vk::Framebuffer),
    {
        self.release_framebuffers(&mut destroy);

        for (i, &view) in self.views.iter().enumerate() {
            match create(i, view) {
                Ok(framebuffer) => self.framebuffers.push(framebuffer),
                Err(e) => {
                    self.framebuffers.drain(..).for_each(&mut destroy);
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    pub fn release_framebuffers<D: FnMut(vk::Framebuffer)>(&mut self, destroy: D) {
        self.framebuffers.drain(..).for_each(destroy);
    }

    /// Framebuffers first, then views. Images are only forgotten.
    pub fn release<F, V>(&mut self, destroy_framebuffer: F, destroy_view: V)
    where
        F: FnMut(vk::Framebuffer),
        V: FnMut(vk::ImageView),
    {
        self.release_framebuffers(destroy_framebuffer);
        self.views.drain(..).for_each(destroy_view);
        self.images.clear();
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn view_count(&self) -> usize {
        self.views.len()
    }

    pub fn framebuffer_count(&self) -> usize {
        self.framebuffers.len()
    }

    pub fn framebuffer(&self, image_index: u32) -> Option<vk::Framebuffer> {
        self.framebuffers.get(image_index as usize).copied()
    }

    /// `views == images`, and framebuffers are absent or match them.
    pub fn is_consistent(&self) -> bool {
        self.views.len() == self.images.len()
            && (self.framebuffers.is_empty() || self.framebuffers.len() == self.views.len())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Resources
// ─────────────────────────────────────────────────────────────────────────────

struct DepthResources {
    image: vk::Image,
    memory: vk::DeviceMemory,
    view: vk::ImageView,
    format: vk::Format,
}

/// One generation of the chain. Null handles mark what was never created,
/// so a half-built generation tears down through the same path.
struct ChainResources {
    swapchain: vk::SwapchainKHR,
    targets: ImageSet,
    depth: Option<DepthResources>,
    plan: ChainPlan,
}

impl ChainResources {
    fn destroy(&mut self, device: &ash::Device, loader: &khr::Swapchain) {
        self.targets.release_framebuffers(|framebuffer| unsafe {
            device.destroy_framebuffer(framebuffer, None)
        });

        if let Some(depth) = self.depth.take() {
            unsafe {
                if depth.view != vk::ImageView::null() {
                    device.destroy_image_view(depth.view, None);
                }
                if depth.image != vk::Image::null() {
                    device.destroy_image(depth.image, None);
                }
                if depth.memory != vk::DeviceMemory::null() {
                    device.free_memory(depth.memory, None);
                }
            }
        }

        self.targets
            .release(|_| {}, |view| unsafe { device.destroy_image_view(view, None) });

        if self.swapchain != vk::SwapchainKHR::null() {
            unsafe { loader.destroy_swapchain(self.swapchain, None) };
            self.swapchain = vk::SwapchainKHR::null();
        }
    }
}

pub struct ImageChain {
    context: Arc<DeviceContext>,
    loader: khr::Swapchain,
    preferred_mode: vk::PresentModeKHR,
    with_depth: bool,
    resources: Option<ChainResources>,
}

impl ImageChain {
    /// Build the first generation. `with_depth` decides whether a depth
    /// image is created alongside the color images.
    pub fn new(
        context: Arc<DeviceContext>,
        width: u32,
        height: u32,
        preferred_mode: vk::PresentModeKHR,
        with_depth: bool,
    ) -> Result<Self> {
        let loader = khr::Swapchain::new(context.instance(), context.device());
        let mut chain = Self {
            context,
            loader,
            preferred_mode,
            with_depth,
            resources: None,
        };

        let plan = chain
            .plan(width, height)?
            .ok_or(RenderError::InvalidState("surface has no area to present to"))?;

        chain.build(plan).map_err(|e| {
            log::error!("Failed to initialize swapchain: {}", e);
            e
        })?;

        log::info!("Swapchain initialized successfully");
        Ok(chain)
    }

    /// Negotiate a plan for `width` x `height` against the surface as it is
    /// now. `None` means zero area: nothing should be rebuilt.
    pub fn plan(&self, width: u32, height: u32) -> Result<Option<ChainPlan>> {
        if !has_area(width, height) {
            log::debug!("Skipping swapchain plan for {}x{}", width, height);
            return Ok(None);
        }

        let support = self.context.surface_support()?;
        let plan = ChainPlan::for_request(&support, self.preferred_mode, width, height)?;
        if plan.is_none() {
            log::debug!("Surface reports a zero extent, deferring swapchain rebuild");
        }
        Ok(plan)
    }

    /// Replace the current generation with one built from `plan`.
    /// Framebuffers must be re-requested afterwards.
    pub fn rebuild(&mut self, plan: ChainPlan) -> Result<()> {
        self.context.wait_idle()?;
        self.cleanup();

        self.build(plan).map_err(|e| {
            log::error!("Failed to recreate swapchain: {}", e);
            e
        })?;

        log::info!("Swapchain recreated successfully");
        Ok(())
    }

    /// Rebuild everything for a new window size.
    ///
    /// Returns `false` without touching the current generation when there is
    /// nothing to present to (minimized window, or a surface reporting a zero
    /// extent).
    pub fn recreate(&mut self, width: u32, height: u32) -> Result<bool> {
        match self.plan(width, height)? {
            Some(plan) => {
                self.rebuild(plan)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Release every resource of the current generation.
    pub fn cleanup(&mut self) {
        if let Some(mut resources) = self.resources.take() {
            if let Err(e) = self.context.wait_idle() {
                log::warn!("{}", e);
            }
            resources.destroy(self.context.device(), &self.loader);
        }
    }

    fn build(&mut self, plan: ChainPlan) -> Result<()> {
        log::info!(
            "Creating swapchain: {}x{} {:?} {:?}, {} images",
            plan.extent.width,
            plan.extent.height,
            plan.surface_format.format,
            plan.present_mode,
            plan.image_count
        );

        let swapchain = self.create_swapchain(&plan)?;
        let mut resources = ChainResources {
            swapchain,
            targets: ImageSet::default(),
            depth: None,
            plan,
        };

        if let Err(e) = self.populate(&mut resources) {
            resources.destroy(self.context.device(), &self.loader);
            return Err(e);
        }

        self.resources = Some(resources);
        Ok(())
    }

    fn create_swapchain(&self, plan: &ChainPlan) -> Result<vk::SwapchainKHR> {
        let (sharing_mode, family_indices) = self.context.queue_families().sharing();

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(self.context.surface())
            .min_image_count(plan.image_count)
            .image_format(plan.surface_format.format)
            .image_color_space(plan.surface_format.color_space)
            .image_extent(plan.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(sharing_mode)
            .queue_family_indices(&family_indices)
            .pre_transform(plan.transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(plan.present_mode)
            .clipped(true);

        unsafe { self.loader.create_swapchain(&create_info, None) }.during("Create swapchain")
    }

    fn populate(&self, resources: &mut ChainResources) -> Result<()> {
        let device = self.context.device();

        let images = unsafe { self.loader.get_swapchain_images(resources.swapchain) }
            .during("Get swapchain images")?;

        let color_format = resources.plan.surface_format.format;
        resources.targets.fill_views(
            images,
            |image| {
                create_view(device, image, color_format, vk::ImageAspectFlags::COLOR)
                    .during("Create swapchain image view")
            },
            |view| unsafe { device.destroy_image_view(view, None) },
        )?;

        let depth_format = choose_depth_format(self.with_depth, |format| {
            self.context.format_properties(format)
        })?;

        if let Some(format) = depth_format {
            let extent = resources.plan.extent;
            let depth = resources.depth.insert(DepthResources {
                image: vk::Image::null(),
                memory: vk::DeviceMemory::null(),
                view: vk::ImageView::null(),
                format,
            });
            self.create_depth_resources(depth, extent)?;
        }

        log::debug!(
            "Created {} image views and {:?} depth buffer",
            resources.targets.view_count(),
            depth_format
        );
        Ok(())
    }

    fn create_depth_resources(&self, depth: &mut DepthResources, extent: vk::Extent2D) -> Result<()> {
        let device = self.context.device();

        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(depth.format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        depth.image = unsafe { device.create_image(&image_info, None) }.during("Create depth image")?;

        let requirements = unsafe { device.get_image_memory_requirements(depth.image) };
        let memory_type = find_memory_type(
            self.context.memory_properties(),
            requirements.memory_type_bits,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )
        .ok_or(RenderError::NoMemoryType(vk::MemoryPropertyFlags::DEVICE_LOCAL))?;

        let alloc_info = vk::MemoryAllocateInfo::builder()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type);

        depth.memory = unsafe { device.allocate_memory(&alloc_info, None) }
            .during("Allocate depth image memory")?;

        unsafe { device.bind_image_memory(depth.image, depth.memory, 0) }
            .during("Bind depth image memory")?;

        depth.view = create_view(device, depth.image, depth.format, vk::ImageAspectFlags::DEPTH)
            .during("Create depth image view")?;

        Ok(())
    }

    /// One framebuffer per image view against `render_pass`. The depth view is
    /// attached only when the render pass declares a depth attachment.
    pub fn create_framebuffers(&mut self, render_pass: vk::RenderPass, attach_depth: bool) -> Result<()> {
        if render_pass == vk::RenderPass::null() {
            log::error!("Invalid render pass provided to create_framebuffers");
            return Err(RenderError::InvalidState("null render pass"));
        }

        let device = self.context.device();
        let resources = self
            .resources
            .as_mut()
            .ok_or(RenderError::InvalidState("swapchain not created"))?;

        let depth_view = match (&resources.depth, attach_depth) {
            (Some(depth), true) => Some(depth.view),
            (None, true) => return Err(RenderError::InvalidState("no depth buffer to attach")),
            (_, false) => None,
        };
        let extent = resources.plan.extent;

        resources.targets.fill_framebuffers(
            |i, view| {
                let attachments: Vec<vk::ImageView> = std::iter::once(view).chain(depth_view).collect();
                let framebuffer_info = vk::FramebufferCreateInfo::builder()
                    .render_pass(render_pass)
                    .attachments(&attachments)
                    .width(extent.width)
                    .height(extent.height)
                    .layers(1);

                unsafe { device.create_framebuffer(&framebuffer_info, None) }.map_err(|result| {
                    log::error!("Failed to create framebuffer {}: {}", i, result);
                    RenderError::Call {
                        what: "Create framebuffer",
                        result,
                    }
                })
            },
            |framebuffer| unsafe { device.destroy_framebuffer(framebuffer, None) },
        )
    }

    /// Destroy framebuffers only; views, depth and swapchain stay.
    pub fn destroy_framebuffers(&mut self) {
        if let Some(resources) = self.resources.as_mut() {
            let device = self.context.device();
            resources
                .targets
                .release_framebuffers(|framebuffer| unsafe { device.destroy_framebuffer(framebuffer, None) });
        }
    }

    /// Acquire next image, signalling `semaphore` when it is ready.
    pub fn acquire_next_image(&self, semaphore: vk::Semaphore) -> Result<Acquire> {
        let resources = self
            .resources
            .as_ref()
            .ok_or(RenderError::InvalidState("swapchain not created"))?;

        let result = unsafe {
            self.loader.acquire_next_image(
                resources.swapchain,
                u64::MAX,
                semaphore,
                vk::Fence::null(),
            )
        };

        match result {
            Ok((index, suboptimal)) => Ok(Acquire::Image { index, suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Acquire::OutOfDate),
            Err(result) => Err(RenderError::Call {
                what: "Acquire swapchain image",
                result,
            }),
        }
    }

    /// Present rendered image to screen
    pub fn present(&self, queue: vk::Queue, image_index: u32, wait_semaphore: vk::Semaphore) -> Result<Present> {
        let resources = self
            .resources
            .as_ref()
            .ok_or(RenderError::InvalidState("swapchain not created"))?;

        let wait_semaphores = [wait_semaphore];
        let swapchains = [resources.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match unsafe { self.loader.queue_present(queue, &present_info) } {
            Ok(false) => Ok(Present::Done),
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Present::Stale),
            Err(result) => Err(RenderError::Call {
                what: "Present swapchain image",
                result,
            }),
        }
    }

    pub fn is_created(&self) -> bool {
        self.resources.is_some()
    }

    pub fn handle(&self) -> vk::SwapchainKHR {
        self.resources
            .as_ref()
            .map_or(vk::SwapchainKHR::null(), |r| r.swapchain)
    }

    pub fn format(&self) -> vk::Format {
        self.resources
            .as_ref()
            .map_or(vk::Format::UNDEFINED, |r| r.plan.surface_format.format)
    }

    pub fn color_space(&self) -> vk::ColorSpaceKHR {
        self.resources
            .as_ref()
            .map_or(vk::ColorSpaceKHR::SRGB_NONLINEAR, |r| r.plan.surface_format.color_space)
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.resources
            .as_ref()
            .map_or(vk::PresentModeKHR::FIFO, |r| r.plan.present_mode)
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.resources
            .as_ref()
            .map_or(vk::Extent2D::default(), |r| r.plan.extent)
    }

    pub fn depth_format(&self) -> Option<vk::Format> {
        self.resources
            .as_ref()
            .and_then(|r| r.depth.as_ref())
            .map(|d| d.format)
    }

    pub fn image_count(&self) -> usize {
        self.resources.as_ref().map_or(0, |r| r.targets.image_count())
    }

    pub fn view_count(&self) -> usize {
        self.resources.as_ref().map_or(0, |r| r.targets.view_count())
    }

    pub fn framebuffer_count(&self) -> usize {
        self.resources.as_ref().map_or(0, |r| r.targets.framebuffer_count())
    }

    pub fn framebuffer(&self, image_index: u32) -> Option<vk::Framebuffer> {
        self.resources
            .as_ref()
            .and_then(|r| r.targets.framebuffer(image_index))
    }
}

impl Drop for ImageChain {
    fn drop(&mut self) {
        self.cleanup();
    }
}

fn create_view(
    device: &ash::Device,
    image: vk::Image,
    format: vk::Format,
    aspect_mask: vk::ImageAspectFlags,
) -> std::result::Result<vk::ImageView, vk::Result> {
    let create_info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .components(vk::ComponentMapping {
            r: vk::ComponentSwizzle::IDENTITY,
            g: vk::ComponentSwizzle::IDENTITY,
            b: vk::ComponentSwizzle::IDENTITY,
            a: vk::ComponentSwizzle::IDENTITY,
        })
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        });

    unsafe { device.create_image_view(&create_info, None) }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SurfaceSupport;
    use ash::vk::Handle;

    fn format(format: vk::Format, color_space: vk::ColorSpaceKHR) -> vk::SurfaceFormatKHR {
        vk::SurfaceFormatKHR { format, color_space }
    }

    fn caps(current: (u32, u32), min: (u32, u32), max: (u32, u32)) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 0,
            current_extent: vk::Extent2D { width: current.0, height: current.1 },
            min_image_extent: vk::Extent2D { width: min.0, height: min.1 },
            max_image_extent: vk::Extent2D { width: max.0, height: max.1 },
            ..Default::default()
        }
    }

    const SENTINEL: (u32, u32) = (USE_REQUESTED_EXTENT, USE_REQUESTED_EXTENT);

    #[test]
    fn preferred_format_found_in_any_position() {
        let preferred = format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR);
        let others = [
            format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::EXTENDED_SRGB_LINEAR_EXT),
            format(vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];

        for position in 0..=others.len() {
            let mut list = others.to_vec();
            list.insert(position, preferred);
            let chosen = choose_swap_surface_format(&list).unwrap();
            assert_eq!(chosen.format, vk::Format::B8G8R8A8_SRGB);
            assert_eq!(chosen.color_space, vk::ColorSpaceKHR::SRGB_NONLINEAR);
        }
    }

    #[test]
    fn first_format_when_preferred_missing() {
        let list = [
            format(vk::Format::R8G8B8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
            format(vk::Format::B8G8R8A8_UNORM, vk::ColorSpaceKHR::SRGB_NONLINEAR),
        ];
        let chosen = choose_swap_surface_format(&list).unwrap();
        assert_eq!(chosen.format, vk::Format::R8G8B8A8_UNORM);
    }

    #[test]
    fn no_formats_is_an_error() {
        assert!(matches!(
            choose_swap_surface_format(&[]),
            Err(RenderError::NoSurfaceFormats)
        ));
    }

    #[test]
    fn mailbox_preferred_when_offered() {
        let modes = [vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX];
        let mode = choose_swap_present_mode(&modes, vk::PresentModeKHR::MAILBOX).unwrap();
        assert_eq!(mode, vk::PresentModeKHR::MAILBOX);
    }

    #[test]
    fn fifo_only_device_gets_fifo() {
        let mode =
            choose_swap_present_mode(&[vk::PresentModeKHR::FIFO], vk::PresentModeKHR::MAILBOX).unwrap();
        assert_eq!(mode, vk::PresentModeKHR::FIFO);
    }

    #[test]
    fn no_present_modes_is_an_error() {
        assert!(matches!(
            choose_swap_present_mode(&[], vk::PresentModeKHR::MAILBOX),
            Err(RenderError::NoPresentModes)
        ));
    }

    #[test]
    fn sentinel_extent_uses_request() {
        let caps = caps(SENTINEL, (1, 1), (4096, 4096));
        let extent = choose_swap_extent(&caps, 1280, 720);
        assert_eq!((extent.width, extent.height), (1280, 720));
    }

    #[test]
    fn sentinel_extent_is_clamped() {
        let caps = caps(SENTINEL, (200, 100), (1920, 1080));

        let small = choose_swap_extent(&caps, 50, 20);
        assert_eq!((small.width, small.height), (200, 100));

        let large = choose_swap_extent(&caps, 8000, 600);
        assert_eq!((large.width, large.height), (1920, 600));
    }

    #[test]
    fn fixed_extent_is_honoured() {
        let caps = caps((1024, 768), (1, 1), (4096, 4096));
        let extent = choose_swap_extent(&caps, 1280, 720);
        assert_eq!((extent.width, extent.height), (1024, 768));
    }

    #[test]
    fn image_count_respects_cap() {
        let mut caps = caps(SENTINEL, (1, 1), (4096, 4096));
        assert_eq!(choose_image_count(&caps), 3);

        caps.max_image_count = 2;
        assert_eq!(choose_image_count(&caps), 2);

        caps.max_image_count = 8;
        assert_eq!(choose_image_count(&caps), 3);
    }

    #[test]
    fn negotiate_fifo_only_800x600() {
        let support = SurfaceSupport {
            capabilities: caps(SENTINEL, (1, 1), (4096, 4096)),
            formats: vec![format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR)],
            present_modes: vec![vk::PresentModeKHR::FIFO],
        };

        let plan = ChainPlan::negotiate(&support, vk::PresentModeKHR::MAILBOX, 800, 600).unwrap();
        assert_eq!(plan.present_mode, vk::PresentModeKHR::FIFO);
        assert_eq!((plan.extent.width, plan.extent.height), (800, 600));
        assert_eq!(plan.image_count, 3);
    }

    #[test]
    fn depth_format_preference_order() {
        let supported = |wanted: vk::Format| {
            move |format: vk::Format| {
                let mut props = vk::FormatProperties::default();
                if format == wanted {
                    props.optimal_tiling_features = vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT;
                }
                props
            }
        };

        let pick = |wanted| {
            find_supported_format(
                &DEPTH_FORMAT_CANDIDATES,
                vk::ImageTiling::OPTIMAL,
                vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
                supported(wanted),
            )
        };

        assert_eq!(pick(vk::Format::D24_UNORM_S8_UINT), Some(vk::Format::D24_UNORM_S8_UINT));
        assert_eq!(pick(vk::Format::D32_SFLOAT), Some(vk::Format::D32_SFLOAT));
        assert_eq!(pick(vk::Format::D16_UNORM), None);
    }

    #[test]
    fn depth_format_ignores_linear_features() {
        let found = find_supported_format(
            &DEPTH_FORMAT_CANDIDATES,
            vk::ImageTiling::OPTIMAL,
            vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
            |_| vk::FormatProperties {
                linear_tiling_features: vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
                ..Default::default()
            },
        );
        assert_eq!(found, None);
    }

    #[test]
    fn memory_type_scans_mask_in_order() {
        let mut memory = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: 3,
            ..Default::default()
        };
        memory.memory_types[0].property_flags = vk::MemoryPropertyFlags::HOST_VISIBLE;
        memory.memory_types[1].property_flags =
            vk::MemoryPropertyFlags::DEVICE_LOCAL | vk::MemoryPropertyFlags::HOST_VISIBLE;
        memory.memory_types[2].property_flags = vk::MemoryPropertyFlags::DEVICE_LOCAL;

        let local = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        assert_eq!(find_memory_type(&memory, 0b111, local), Some(1));
        assert_eq!(find_memory_type(&memory, 0b101, local), Some(2));
        assert_eq!(find_memory_type(&memory, 0b001, local), None);
    }

    fn support(capabilities: vk::SurfaceCapabilitiesKHR) -> SurfaceSupport {
        SurfaceSupport {
            capabilities,
            formats: vec![format(vk::Format::B8G8R8A8_SRGB, vk::ColorSpaceKHR::SRGB_NONLINEAR)],
            present_modes: vec![vk::PresentModeKHR::FIFO],
        }
    }

    #[test]
    fn zero_request_plans_nothing_without_negotiating() {
        // No formats or modes: negotiating would fail
        let empty = SurfaceSupport {
            capabilities: caps(SENTINEL, (1, 1), (4096, 4096)),
            formats: Vec::new(),
            present_modes: Vec::new(),
        };

        for (w, h) in [(0, 0), (0, 600), (800, 0)] {
            let plan = ChainPlan::for_request(&empty, vk::PresentModeKHR::MAILBOX, w, h).unwrap();
            assert!(plan.is_none(), "{}x{} produced a plan", w, h);
        }
    }

    #[test]
    fn zero_surface_extent_defers_rebuild() {
        let minimized = support(caps((0, 0), (0, 0), (0, 0)));
        let plan = ChainPlan::for_request(&minimized, vk::PresentModeKHR::MAILBOX, 800, 600).unwrap();
        assert!(plan.is_none());

        let restored = support(caps((800, 600), (1, 1), (4096, 4096)));
        let plan = ChainPlan::for_request(&restored, vk::PresentModeKHR::MAILBOX, 800, 600)
            .unwrap()
            .unwrap();
        assert_eq!((plan.extent.width, plan.extent.height), (800, 600));
    }

    #[test]
    fn depth_format_skipped_when_disabled() {
        let mut queried = 0;
        let format = choose_depth_format(false, |_| {
            queried += 1;
            vk::FormatProperties::default()
        })
        .unwrap();
        assert_eq!(format, None);
        assert_eq!(queried, 0);
    }

    #[test]
    fn depth_format_required_when_enabled() {
        assert!(matches!(
            choose_depth_format(true, |_| vk::FormatProperties::default()),
            Err(RenderError::NoDepthFormat)
        ));

        let format = choose_depth_format(true, |_| vk::FormatProperties {
            optimal_tiling_features: vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(format, Some(vk::Format::D32_SFLOAT));
    }

    fn images(count: u64) -> Vec<vk::Image> {
        (1..=count).map(vk::Image::from_raw).collect()
    }

    fn view_for(image: vk::Image) -> Result<vk::ImageView> {
        Ok(vk::ImageView::from_raw(100 + image.as_raw()))
    }

    fn filled_set(count: u64) -> ImageSet {
        let mut set = ImageSet::default();
        set.fill_views(images(count), view_for, |_| panic!("nothing to destroy"))
            .unwrap();
        set
    }

    #[test]
    fn counts_match_once_framebuffers_exist() {
        let mut set = filled_set(3);
        assert_eq!((set.image_count(), set.view_count(), set.framebuffer_count()), (3, 3, 0));
        assert!(set.is_consistent());

        set.fill_framebuffers(
            |i, _| Ok(vk::Framebuffer::from_raw(200 + i as u64)),
            |_| panic!("nothing to destroy"),
        )
        .unwrap();
        assert_eq!((set.image_count(), set.view_count(), set.framebuffer_count()), (3, 3, 3));
        assert!(set.is_consistent());
        assert_eq!(set.framebuffer(2), Some(vk::Framebuffer::from_raw(202)));
        assert_eq!(set.framebuffer(3), None);
    }

    #[test]
    fn refilling_framebuffers_replaces_old_ones() {
        let mut set = filled_set(2);
        set.fill_framebuffers(|i, _| Ok(vk::Framebuffer::from_raw(10 + i as u64)), |_| {})
            .unwrap();

        let mut destroyed = Vec::new();
        set.fill_framebuffers(
            |i, _| Ok(vk::Framebuffer::from_raw(20 + i as u64)),
            |fb| destroyed.push(fb.as_raw()),
        )
        .unwrap();

        assert_eq!(destroyed, vec![10, 11]);
        assert_eq!(set.framebuffer_count(), 2);
        assert_eq!(set.framebuffer(0), Some(vk::Framebuffer::from_raw(20)));
    }

    #[test]
    fn framebuffer_failure_rolls_back_partial_set() {
        let mut set = filled_set(3);

        let mut destroyed = Vec::new();
        let result = set.fill_framebuffers(
            |i, _| {
                if i == 2 {
                    Err(RenderError::Call {
                        what: "Create framebuffer",
                        result: vk::Result::ERROR_OUT_OF_DEVICE_MEMORY,
                    })
                } else {
                    Ok(vk::Framebuffer::from_raw(200 + i as u64))
                }
            },
            |fb| destroyed.push(fb.as_raw()),
        );

        assert!(result.is_err());
        assert_eq!(destroyed, vec![200, 201]);
        assert_eq!(set.framebuffer_count(), 0);
        assert_eq!(set.view_count(), 3);
        assert!(set.is_consistent());
    }

    #[test]
    fn view_failure_rolls_back_partial_set() {
        let mut set = ImageSet::default();

        let mut destroyed = Vec::new();
        let result = set.fill_views(
            images(3),
            |image| {
                if image.as_raw() == 3 {
                    Err(RenderError::Call {
                        what: "Create swapchain image view",
                        result: vk::Result::ERROR_OUT_OF_HOST_MEMORY,
                    })
                } else {
                    view_for(image)
                }
            },
            |view| destroyed.push(view.as_raw()),
        );

        assert!(result.is_err());
        assert_eq!(destroyed, vec![101, 102]);
        assert_eq!((set.image_count(), set.view_count()), (0, 0));
        assert!(set.is_consistent());
    }

    #[test]
    fn release_destroys_framebuffers_before_views() {
        let mut set = filled_set(2);
        set.fill_framebuffers(|i, _| Ok(vk::Framebuffer::from_raw(200 + i as u64)), |_| {})
            .unwrap();

        let order = std::cell::RefCell::new(Vec::new());
        set.release(
            |fb| order.borrow_mut().push(fb.as_raw()),
            |view| order.borrow_mut().push(view.as_raw()),
        );

        assert_eq!(order.into_inner(), vec![200, 201, 101, 102]);
        assert_eq!((set.image_count(), set.view_count(), set.framebuffer_count()), (0, 0, 0));
    }
}
