// Shader-visible texture heap
//
// A single descriptor set with one large, partially bound sampled-image
// array. Slots in the array are handed out by `DescriptorHeapAllocator`;
// this type only owns the Vulkan objects.

use ash::vk;
use std::sync::Arc;

use super::VulkanDevice;
use crate::error::FrameResult;
use crate::frame::{CpuDescriptorHandle, DescriptorHeapDesc, GpuDescriptorHandle};

pub const TEXTURE_BINDING: u32 = 0;

pub struct BindlessHeap {
    pool: vk::DescriptorPool,
    layout: vk::DescriptorSetLayout,
    set: vk::DescriptorSet,
    capacity: u32,
    device: Arc<VulkanDevice>,
}

impl BindlessHeap {
    pub fn new(device: Arc<VulkanDevice>, capacity: u32) -> FrameResult<Self> {
        let binding = vk::DescriptorSetLayoutBinding::builder()
            .binding(TEXTURE_BINDING)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(capacity)
            .stage_flags(vk::ShaderStageFlags::FRAGMENT)
            .build();
        let binding_flags = [vk::DescriptorBindingFlags::PARTIALLY_BOUND
            | vk::DescriptorBindingFlags::UPDATE_AFTER_BIND];
        let mut flags_info =
            vk::DescriptorSetLayoutBindingFlagsCreateInfo::builder().binding_flags(&binding_flags);

        let bindings = [binding];
        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder()
            .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
            .bindings(&bindings)
            .push_next(&mut flags_info);
        let layout = unsafe { device.device.create_descriptor_set_layout(&layout_info, None) }?;

        let pool_sizes = [vk::DescriptorPoolSize {
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: capacity,
        }];
        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .flags(vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND)
            .max_sets(1)
            .pool_sizes(&pool_sizes);
        let pool = match unsafe { device.device.create_descriptor_pool(&pool_info, None) } {
            Ok(pool) => pool,
            Err(e) => {
                unsafe { device.device.destroy_descriptor_set_layout(layout, None) };
                return Err(e.into());
            }
        };

        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        let set = match unsafe { device.device.allocate_descriptor_sets(&alloc_info) } {
            Ok(sets) => sets[0],
            Err(e) => {
                unsafe {
                    device.device.destroy_descriptor_pool(pool, None);
                    device.device.destroy_descriptor_set_layout(layout, None);
                }
                return Err(e.into());
            }
        };

        log::info!("Created bindless texture heap with {} slots", capacity);

        Ok(Self {
            pool,
            layout,
            set,
            capacity,
            device,
        })
    }

    /// Both handle spaces start at element 0 of the texture array.
    pub fn desc(&self) -> DescriptorHeapDesc {
        DescriptorHeapDesc {
            cpu_start: CpuDescriptorHandle(0),
            gpu_start: GpuDescriptorHandle(0),
            capacity: self.capacity,
        }
    }

    pub fn set(&self) -> vk::DescriptorSet {
        self.set
    }

    pub fn layout(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    /// Point slot `cpu` at a texture. The slot must be live in the allocator.
    pub fn write_texture(
        &self,
        cpu: CpuDescriptorHandle,
        view: vk::ImageView,
        sampler: vk::Sampler,
    ) {
        let image_info = [vk::DescriptorImageInfo {
            sampler,
            image_view: view,
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }];
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(self.set)
            .dst_binding(TEXTURE_BINDING)
            .dst_array_element(cpu.0 as u32)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .image_info(&image_info)
            .build();

        unsafe { self.device.device.update_descriptor_sets(&[write], &[]) };
    }
}

impl Drop for BindlessHeap {
    fn drop(&mut self) {
        unsafe {
            // Frees the set as well
            self.device.device.destroy_descriptor_pool(self.pool, None);
            self.device.device.destroy_descriptor_set_layout(self.layout, None);
        }
    }
}
