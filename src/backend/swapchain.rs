// Swap ring - Window presentation
//
// Manages the chain of images we render to and present to the screen,
// together with everything sized to it: views, MSAA colour + depth targets,
// framebuffers and the render pass. A ring is immutable: any change of
// extent or format means building a new ring from the old one.

use ash::vk;

use super::attachment::AttachmentImage;
use super::context::{Acquire, PresentRing, SurfaceStatus, SwapRingRequest};
use super::render_pass::{self, RenderPassLayout};
use super::VulkanDevice;
use crate::error::{FrameError, FrameResult};

/// What the surface supports, queried once per ring.
#[derive(Debug, Clone, Default)]
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

/// Concrete parameters for a swapchain, derived from `SurfaceSupport`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapConfig {
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub image_count: u32,
}

impl SurfaceSupport {
    pub fn query(device: &VulkanDevice) -> FrameResult<Self> {
        let loader = &device.surface_loader;
        unsafe {
            Ok(Self {
                capabilities: loader
                    .get_physical_device_surface_capabilities(device.physical_device, device.surface)?,
                formats: loader
                    .get_physical_device_surface_formats(device.physical_device, device.surface)?,
                present_modes: loader
                    .get_physical_device_surface_present_modes(device.physical_device, device.surface)?,
            })
        }
    }

    /// Resolve format, present mode, extent and image count for a request.
    pub fn configure(&self, request: &SwapRingRequest) -> FrameResult<SwapConfig> {
        let surface_format = choose_surface_format(&self.formats).ok_or_else(|| {
            FrameError::Configuration("surface reports no supported formats".to_string())
        })?;

        Ok(SwapConfig {
            surface_format,
            present_mode: choose_present_mode(&self.present_modes, request.present_mode),
            extent: choose_extent(&self.capabilities, request.extent),
            image_count: choose_image_count(&self.capabilities),
        })
    }
}

/// Prefer a 4-component SRGB format with the standard non-linear colour
/// space, otherwise whatever the surface lists first.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| {
            matches!(f.format, vk::Format::B8G8R8A8_SRGB | vk::Format::R8G8B8A8_SRGB)
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first())
        .copied()
}

/// The preferred mode when offered, FIFO otherwise (always supported).
pub fn choose_present_mode(
    modes: &[vk::PresentModeKHR],
    preferred: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if modes.contains(&preferred) {
        preferred
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// A surface that reports a current extent dictates it; otherwise the
/// request is clamped into the supported range.
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, requested: vk::Extent2D) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        caps.current_extent
    } else {
        vk::Extent2D {
            width: requested
                .width
                .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
            height: requested
                .height
                .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
        }
    }
}

/// Combined depth-stencil formats need both aspects on attachment views.
pub fn depth_aspect(format: vk::Format) -> vk::ImageAspectFlags {
    match format {
        vk::Format::D32_SFLOAT_S8_UINT | vk::Format::D24_UNORM_S8_UINT | vk::Format::D16_UNORM_S8_UINT => {
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        }
        _ => vk::ImageAspectFlags::DEPTH,
    }
}

/// One more than the minimum, capped at the maximum (0 = no maximum).
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = caps.min_image_count + 1;
    if caps.max_image_count > 0 {
        count.min(caps.max_image_count)
    } else {
        count
    }
}

pub struct SwapRing {
    loader: ash::khr::swapchain::Device,
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    framebuffers: Vec<vk::Framebuffer>,
    /// Only present when multisampling
    color_target: Option<AttachmentImage>,
    depth_target: Option<AttachmentImage>,
    render_pass: vk::RenderPass,
    config: SwapConfig,
    layout: RenderPassLayout,
}

impl SwapRing {
    /// Build a ring. `previous` is consumed: its swapchain is handed to the
    /// driver for recycling, then everything it owned is released.
    pub fn new(
        device: &VulkanDevice,
        request: &SwapRingRequest,
        previous: Option<SwapRing>,
    ) -> FrameResult<Self> {
        let old_swapchain = previous
            .as_ref()
            .map_or(vk::SwapchainKHR::null(), |ring| ring.swapchain);

        let result = Self::create(device, request, old_swapchain);

        // The old chain is retired either way once the new one was requested
        if let Some(previous) = previous {
            previous.destroy(device);
        }

        result
    }

    fn create(
        device: &VulkanDevice,
        request: &SwapRingRequest,
        old_swapchain: vk::SwapchainKHR,
    ) -> FrameResult<Self> {
        let support = SurfaceSupport::query(device)?;
        let config = support.configure(request)?;

        log::info!(
            "Creating swap ring: {}x{} ({} images, {:?}, {:?}, {:?})",
            config.extent.width,
            config.extent.height,
            config.image_count,
            config.surface_format.format,
            config.present_mode,
            request.samples,
        );

        let queue_families = [
            device.queue_families.graphics,
            device.queue_families.present,
        ];
        let mut create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(device.surface)
            .min_image_count(config.image_count)
            .image_format(config.surface_format.format)
            .image_color_space(config.surface_format.color_space)
            .image_extent(config.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .pre_transform(support.capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(config.present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        create_info = if queue_families[0] != queue_families[1] {
            create_info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&queue_families)
        } else {
            create_info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        };

        let loader = device.swapchain_loader.clone();
        let swapchain = unsafe { loader.create_swapchain(&create_info, None) }?;

        let layout = RenderPassLayout {
            color_format: config.surface_format.format,
            depth_format: device.depth_format,
            samples: request.samples,
        };

        let mut ring = Self {
            loader,
            swapchain,
            images: Vec::new(),
            image_views: Vec::new(),
            framebuffers: Vec::new(),
            color_target: None,
            depth_target: None,
            render_pass: vk::RenderPass::null(),
            config,
            layout,
        };

        // No half-built rings: release whatever exists and fail
        if let Err(e) = ring.build_targets(device) {
            ring.destroy(device);
            return Err(e);
        }

        log::info!("Created swap ring with {} images", ring.images.len());
        Ok(ring)
    }

    fn build_targets(&mut self, device: &VulkanDevice) -> FrameResult<()> {
        self.images = unsafe { self.loader.get_swapchain_images(self.swapchain) }?;

        for &image in &self.images {
            let create_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(self.layout.color_format)
                .components(vk::ComponentMapping {
                    r: vk::ComponentSwizzle::IDENTITY,
                    g: vk::ComponentSwizzle::IDENTITY,
                    b: vk::ComponentSwizzle::IDENTITY,
                    a: vk::ComponentSwizzle::IDENTITY,
                })
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: 0,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });
            let view = unsafe { device.device.create_image_view(&create_info, None) }?;
            self.image_views.push(view);
        }

        let extent = self.config.extent;

        if self.layout.is_multisampled() {
            self.color_target = Some(AttachmentImage::new(
                device,
                "swap ring msaa color",
                extent,
                self.layout.color_format,
                self.layout.samples,
                vk::ImageUsageFlags::TRANSIENT_ATTACHMENT | vk::ImageUsageFlags::COLOR_ATTACHMENT,
                vk::ImageAspectFlags::COLOR,
            )?);
        }

        self.depth_target = Some(AttachmentImage::new(
            device,
            "swap ring depth",
            extent,
            self.layout.depth_format,
            self.layout.samples,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            depth_aspect(self.layout.depth_format),
        )?);

        self.render_pass = render_pass::create_render_pass(&device.device, &self.layout)?;

        let depth_view = self.depth_target.as_ref().map(|t| t.view).unwrap_or_default();
        let color_view = self.color_target.as_ref().map(|t| t.view);

        for &swap_view in &self.image_views {
            // Same attachment order for every framebuffer: colour, depth, resolve
            let attachments: Vec<vk::ImageView> = match color_view {
                Some(color_view) => vec![color_view, depth_view, swap_view],
                None => vec![swap_view, depth_view],
            };

            let framebuffer_info = vk::FramebufferCreateInfo::default()
                .render_pass(self.render_pass)
                .attachments(&attachments)
                .width(extent.width)
                .height(extent.height)
                .layers(1);

            let framebuffer = unsafe { device.device.create_framebuffer(&framebuffer_info, None) }?;
            self.framebuffers.push(framebuffer);
        }

        Ok(())
    }

    pub fn framebuffer(&self, image_index: u32) -> vk::Framebuffer {
        self.framebuffers[image_index as usize]
    }

    /// Acquire next image for rendering. Blocks without timeout.
    pub fn acquire_next_image(&self, semaphore: vk::Semaphore) -> FrameResult<Acquire> {
        let result = unsafe {
            self.loader
                .acquire_next_image(self.swapchain, u64::MAX, semaphore, vk::Fence::null())
        };

        match result {
            Ok((image_index, suboptimal)) => Ok(Acquire::Ready {
                image_index,
                status: if suboptimal {
                    SurfaceStatus::Suboptimal
                } else {
                    SurfaceStatus::Optimal
                },
            }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(Acquire::OutOfDate),
            Err(e) => Err(e.into()),
        }
    }

    /// Present rendered image to screen
    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphore: vk::Semaphore,
    ) -> FrameResult<SurfaceStatus> {
        let wait_semaphores = [wait_semaphore];
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match unsafe { self.loader.queue_present(queue, &present_info) } {
            Ok(false) => Ok(SurfaceStatus::Optimal),
            Ok(true) => Ok(SurfaceStatus::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(SurfaceStatus::OutOfDate),
            Err(e) => Err(e.into()),
        }
    }

    /// Release everything the ring owns. The GPU must no longer use it.
    pub fn destroy(mut self, device: &VulkanDevice) {
        unsafe {
            for &framebuffer in &self.framebuffers {
                device.device.destroy_framebuffer(framebuffer, None);
            }
            for &view in &self.image_views {
                device.device.destroy_image_view(view, None);
            }
        }

        if let Some(color_target) = self.color_target.take() {
            color_target.destroy(device);
        }
        if let Some(depth_target) = self.depth_target.take() {
            depth_target.destroy(device);
        }

        unsafe {
            if self.render_pass != vk::RenderPass::null() {
                device.device.destroy_render_pass(self.render_pass, None);
            }
            // Images belong to the swapchain and go with it
            self.loader.destroy_swapchain(self.swapchain, None);
        }
    }
}

impl PresentRing for SwapRing {
    fn extent(&self) -> vk::Extent2D {
        self.config.extent
    }

    fn image_count(&self) -> usize {
        self.images.len()
    }

    fn layout(&self) -> RenderPassLayout {
        self.layout
    }

    fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }
}
