// Render-target attachments owned by the swap ring
//
// Multisampled colour target and depth target, both sized to the ring
// extent. Memory comes from the device's gpu-allocator.

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;

use super::VulkanDevice;
use crate::error::FrameResult;

/// Depth formats in order of preference
pub const DEPTH_FORMAT_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
];

/// Pick the first candidate whose optimal tiling supports depth attachments.
pub fn choose_depth_format(
    candidates: &[vk::Format],
    properties: impl Fn(vk::Format) -> vk::FormatProperties,
) -> Option<vk::Format> {
    candidates.iter().copied().find(|&format| {
        properties(format)
            .optimal_tiling_features
            .contains(vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT)
    })
}

/// Highest single sample count present in `supported`.
pub fn max_sample_count(supported: vk::SampleCountFlags) -> vk::SampleCountFlags {
    [
        vk::SampleCountFlags::TYPE_64,
        vk::SampleCountFlags::TYPE_32,
        vk::SampleCountFlags::TYPE_16,
        vk::SampleCountFlags::TYPE_8,
        vk::SampleCountFlags::TYPE_4,
        vk::SampleCountFlags::TYPE_2,
    ]
    .into_iter()
    .find(|&count| supported.contains(count))
    .unwrap_or(vk::SampleCountFlags::TYPE_1)
}

/// Convert a requested sample count (1, 2, 4, ...) into a supported flag,
/// never exceeding `max`.
pub fn sample_count_from_request(requested: u32, max: vk::SampleCountFlags) -> vk::SampleCountFlags {
    let max_raw = max.as_raw().max(1);
    let mut count = 1u32;
    while count * 2 <= requested.min(max_raw) {
        count *= 2;
    }
    vk::SampleCountFlags::from_raw(count)
}

/// An image + view + memory used as a framebuffer attachment.
pub struct AttachmentImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub format: vk::Format,
    allocation: Option<Allocation>,
}

impl AttachmentImage {
    pub fn new(
        device: &VulkanDevice,
        name: &str,
        extent: vk::Extent2D,
        format: vk::Format,
        samples: vk::SampleCountFlags,
        usage: vk::ImageUsageFlags,
        aspect: vk::ImageAspectFlags,
    ) -> FrameResult<Self> {
        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(usage)
            .samples(samples)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image = unsafe { device.device.create_image(&image_info, None) }?;

        let mut attachment = Self {
            image,
            view: vk::ImageView::null(),
            format,
            allocation: None,
        };

        if let Err(e) = attachment.bind_and_view(device, name, aspect) {
            attachment.destroy(device);
            return Err(e);
        }

        Ok(attachment)
    }

    fn bind_and_view(
        &mut self,
        device: &VulkanDevice,
        name: &str,
        aspect: vk::ImageAspectFlags,
    ) -> FrameResult<()> {
        let requirements = unsafe { device.device.get_image_memory_requirements(self.image) };

        let allocation = device.allocator.lock().allocate(&AllocationCreateDesc {
            name,
            requirements,
            location: MemoryLocation::GpuOnly,
            linear: false,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?;

        unsafe {
            device
                .device
                .bind_image_memory(self.image, allocation.memory(), allocation.offset())
        }?;
        self.allocation = Some(allocation);

        let view_info = vk::ImageViewCreateInfo::default()
            .image(self.image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(self.format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });

        self.view = unsafe { device.device.create_image_view(&view_info, None) }?;
        Ok(())
    }

    /// Release view, image and memory.
    pub fn destroy(mut self, device: &VulkanDevice) {
        unsafe {
            if self.view != vk::ImageView::null() {
                device.device.destroy_image_view(self.view, None);
            }
            device.device.destroy_image(self.image, None);
        }
        if let Some(allocation) = self.allocation.take() {
            if let Err(e) = device.allocator.lock().free(allocation) {
                log::warn!("Failed to free attachment memory: {}", e);
            }
        }
    }
}
