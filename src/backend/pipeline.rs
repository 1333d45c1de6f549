// Render pass and graphics pipeline
//
// The pipeline bakes in viewport and scissor for the current extent, so the
// whole set is rebuilt whenever the chain changes format or size.

use ash::vk;

use super::shader::{ShaderPaths, ShaderStages};
use super::sync::take_handle;
use crate::error::{Result, VkResultExt};

/// One color attachment (cleared, stored, left presentable) and optionally a
/// depth attachment (cleared, discarded).
pub fn create_render_pass(
    device: &ash::Device,
    color_format: vk::Format,
    depth_format: Option<vk::Format>,
) -> Result<vk::RenderPass> {
    let color_attachment = vk::AttachmentDescription::builder()
        .format(color_format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
        .build();

    let color_attachment_ref = vk::AttachmentReference::builder()
        .attachment(0)
        .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
        .build();

    let depth_attachment_ref = vk::AttachmentReference::builder()
        .attachment(1)
        .layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
        .build();

    let mut attachments = vec![color_attachment];
    if let Some(format) = depth_format {
        attachments.push(
            vk::AttachmentDescription::builder()
                .format(format)
                .samples(vk::SampleCountFlags::TYPE_1)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::DONT_CARE)
                .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(vk::ImageLayout::UNDEFINED)
                .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
                .build(),
        );
    }

    let color_attachments = [color_attachment_ref];
    let mut subpass = vk::SubpassDescription::builder()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_attachments);
    if depth_format.is_some() {
        subpass = subpass.depth_stencil_attachment(&depth_attachment_ref);
    }

    let dependency = external_dependency(depth_format.is_some());

    let subpasses = [subpass.build()];
    let dependencies = [dependency];

    let render_pass_info = vk::RenderPassCreateInfo::builder()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);

    unsafe { device.create_render_pass(&render_pass_info, None) }.during("Create render pass")
}

/// Incoming dependency for the single subpass.
///
/// Color: wait for the presentation engine to release the image. Depth: one
/// depth image is shared by every frame in flight, so this frame's clear must
/// also wait for the previous frame's depth writes, which can land as late as
/// the late fragment tests.
pub fn external_dependency(depth: bool) -> vk::SubpassDependency {
    let mut src_stage_mask = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
    let mut src_access_mask = vk::AccessFlags::empty();
    let mut dst_stage_mask = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
    let mut dst_access_mask = vk::AccessFlags::COLOR_ATTACHMENT_WRITE;

    if depth {
        src_stage_mask |= vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
            | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS;
        src_access_mask |= vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE;
        dst_stage_mask |= vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS;
        dst_access_mask |= vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE;
    }

    vk::SubpassDependency::builder()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(src_stage_mask)
        .src_access_mask(src_access_mask)
        .dst_stage_mask(dst_stage_mask)
        .dst_access_mask(dst_access_mask)
        .build()
}

/// Empty layout: no descriptor sets or push constants yet.
pub fn create_pipeline_layout(device: &ash::Device) -> Result<vk::PipelineLayout> {
    let layout_info = vk::PipelineLayoutCreateInfo::builder();
    unsafe { device.create_pipeline_layout(&layout_info, None) }.during("Create pipeline layout")
}

/// Fixed-function pipeline for the built-in triangle: no vertex input,
/// viewport and scissor fixed to `extent`.
pub fn create_graphics_pipeline(
    device: &ash::Device,
    render_pass: vk::RenderPass,
    layout: vk::PipelineLayout,
    extent: vk::Extent2D,
    stages: &ShaderStages<'_>,
    depth_test: bool,
) -> Result<vk::Pipeline> {
    let entry_point = c"main";

    let shader_stages = [
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(stages.vertex)
            .name(entry_point)
            .build(),
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(stages.fragment)
            .name(entry_point)
            .build(),
    ];

    // Vertices come from gl_VertexIndex
    let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::builder();

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
        .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
        .primitive_restart_enable(false);

    let viewports = [vk::Viewport {
        x: 0.0,
        y: 0.0,
        width: extent.width as f32,
        height: extent.height as f32,
        min_depth: 0.0,
        max_depth: 1.0,
    }];
    let scissors = [vk::Rect2D {
        offset: vk::Offset2D { x: 0, y: 0 },
        extent,
    }];
    let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
        .viewports(&viewports)
        .scissors(&scissors);

    let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(vk::PolygonMode::FILL)
        .line_width(1.0)
        .cull_mode(vk::CullModeFlags::BACK)
        .front_face(vk::FrontFace::CLOCKWISE)
        .depth_bias_enable(false);

    let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
        .sample_shading_enable(false)
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
        .depth_test_enable(true)
        .depth_write_enable(true)
        .depth_compare_op(vk::CompareOp::LESS)
        .depth_bounds_test_enable(false)
        .stencil_test_enable(false);

    let color_blend_attachments = [vk::PipelineColorBlendAttachmentState::builder()
        .color_write_mask(vk::ColorComponentFlags::RGBA)
        .blend_enable(false)
        .build()];
    let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
        .logic_op_enable(false)
        .attachments(&color_blend_attachments);

    let mut pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(&shader_stages)
        .vertex_input_state(&vertex_input_info)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterizer)
        .multisample_state(&multisampling)
        .color_blend_state(&color_blending)
        .layout(layout)
        .render_pass(render_pass)
        .subpass(0);
    if depth_test {
        pipeline_info = pipeline_info.depth_stencil_state(&depth_stencil);
    }

    let pipelines = unsafe {
        device.create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info.build()], None)
    }
    .map_err(|(_, e)| e)
    .during("Create graphics pipeline")?;

    Ok(pipelines[0])
}

/// Render pass, layout and pipeline: built together, destroyed together on drop.
pub struct RenderPassSet {
    device: ash::Device,
    pub render_pass: vk::RenderPass,
    pub pipeline_layout: vk::PipelineLayout,
    pub pipeline: vk::Pipeline,
    pub has_depth: bool,
}

impl RenderPassSet {
    pub fn create(
        device: &ash::Device,
        color_format: vk::Format,
        depth_format: Option<vk::Format>,
        extent: vk::Extent2D,
        shaders: &ShaderPaths,
    ) -> Result<Self> {
        let mut set = Self {
            device: device.clone(),
            render_pass: vk::RenderPass::null(),
            pipeline_layout: vk::PipelineLayout::null(),
            pipeline: vk::Pipeline::null(),
            has_depth: depth_format.is_some(),
        };

        // A partial set is released by its Drop
        set.render_pass = create_render_pass(device, color_format, depth_format)?;
        set.pipeline_layout = create_pipeline_layout(device)?;

        // Modules are only needed while the pipeline is created
        let stages = ShaderStages::load(device, shaders)?;
        set.pipeline = create_graphics_pipeline(
            device,
            set.render_pass,
            set.pipeline_layout,
            extent,
            &stages,
            set.has_depth,
        )?;

        log::debug!(
            "Created render pass and pipeline for {}x{} (depth: {})",
            extent.width,
            extent.height,
            set.has_depth
        );
        Ok(set)
    }

    /// Build a new pipeline from `shaders` against the existing render pass and
    /// swap it in. The old pipeline is kept if anything fails.
    pub fn reload_pipeline(&mut self, extent: vk::Extent2D, shaders: &ShaderPaths) -> Result<()> {
        let stages = ShaderStages::load(&self.device, shaders)?;
        let pipeline = create_graphics_pipeline(
            &self.device,
            self.render_pass,
            self.pipeline_layout,
            extent,
            &stages,
            self.has_depth,
        )?;

        let mut old = std::mem::replace(&mut self.pipeline, pipeline);
        if let Some(old) = take_handle(&mut old) {
            unsafe { self.device.destroy_pipeline(old, None) };
        }
        Ok(())
    }
}

impl Drop for RenderPassSet {
    fn drop(&mut self) {
        unsafe {
            if let Some(pipeline) = take_handle(&mut self.pipeline) {
                self.device.destroy_pipeline(pipeline, None);
            }
            if let Some(layout) = take_handle(&mut self.pipeline_layout) {
                self.device.destroy_pipeline_layout(layout, None);
            }
            if let Some(render_pass) = take_handle(&mut self.render_pass) {
                self.device.destroy_render_pass(render_pass, None);
            }
        }
    }
}
