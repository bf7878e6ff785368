// Render pass for the swap ring
//
// Attachment order is fixed: 0 = colour, 1 = depth, 2 = resolve (only when
// multisampled). Every framebuffer of a ring follows the same order.

use ash::vk;

use crate::error::FrameResult;

/// Attachment formats and sample count a ring's render pass was built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderPassLayout {
    pub color_format: vk::Format,
    pub depth_format: vk::Format,
    pub samples: vk::SampleCountFlags,
}

impl RenderPassLayout {
    /// Render passes are compatible when colour and depth formats match.
    /// Sample count is ignored.
    pub fn compatible_with(&self, other: &RenderPassLayout) -> bool {
        self.color_format == other.color_format && self.depth_format == other.depth_format
    }

    pub fn is_multisampled(&self) -> bool {
        self.samples != vk::SampleCountFlags::TYPE_1
    }
}

/// Attachment descriptions in framebuffer order.
pub fn attachment_descriptions(layout: &RenderPassLayout) -> Vec<vk::AttachmentDescription> {
    // Single-sampled: the swap image itself is the colour target, so it has to
    // end up ready for presentation.
    let color_final_layout = if layout.is_multisampled() {
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
    } else {
        vk::ImageLayout::PRESENT_SRC_KHR
    };

    let color = vk::AttachmentDescription::default()
        .format(layout.color_format)
        .samples(layout.samples)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(color_final_layout);

    let depth = vk::AttachmentDescription::default()
        .format(layout.depth_format)
        .samples(layout.samples)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::DONT_CARE) // Don't need to store depth
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);

    let mut attachments = vec![color, depth];

    if layout.is_multisampled() {
        let resolve = vk::AttachmentDescription::default()
            .format(layout.color_format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::DONT_CARE)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::PRESENT_SRC_KHR);
        attachments.push(resolve);
    }

    attachments
}

/// Colour and depth writes wait for the previous frame's writes to the same
/// attachments. The MSAA and depth targets are shared by every frame in
/// flight, and depth is last written at late fragment tests.
pub fn frame_dependency() -> vk::SubpassDependency {
    vk::SubpassDependency::default()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
        )
        .src_access_mask(
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        )
        .dst_stage_mask(
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
        )
        .dst_access_mask(
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        )
}

/// Create the ring's render pass
pub fn create_render_pass(
    device: &ash::Device,
    layout: &RenderPassLayout,
) -> FrameResult<vk::RenderPass> {
    let attachments = attachment_descriptions(layout);

    let color_refs = [vk::AttachmentReference::default()
        .attachment(0)
        .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)];
    let depth_ref = vk::AttachmentReference::default()
        .attachment(1)
        .layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL);
    let resolve_refs = [vk::AttachmentReference::default()
        .attachment(2)
        .layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)];

    let mut subpass = vk::SubpassDescription::default()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_refs)
        .depth_stencil_attachment(&depth_ref);
    if layout.is_multisampled() {
        subpass = subpass.resolve_attachments(&resolve_refs);
    }

    let subpasses = [subpass];
    let dependencies = [frame_dependency()];

    let render_pass_info = vk::RenderPassCreateInfo::default()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);

    let render_pass = unsafe { device.create_render_pass(&render_pass_info, None) }?;
    Ok(render_pass)
}
