mod memory;
mod tlsf;

pub use memory::{find_memory_type, MemoryUse, ResourceType};

use std::cell::{Cell, RefCell};
use std::ptr::NonNull;

use memory::MemoryRegion;

use vulkanalia::{
    prelude::v1_3::*,
    vk::Handle,
};
use anyhow::{anyhow, Result};
use log::*;

/// A memory allocation object, that holds the information
/// necessary to bind a resource to Vulkan memory.
#[derive(Clone, Copy, Debug, Default)]
pub struct Allocation {
    /// The Vulkan device memory object the allocation is tied to.
    pub memory: vk::DeviceMemory,
    /// The offset of the allocation within the memory object.
    pub offset: u64,
    /// Size of the allocation in bytes.
    pub size: u64,
    /// Host pointer to the start of the allocation, for
    /// host-visible memory. Stays valid until the allocation is
    /// freed.
    pub mapped: Option<NonNull<u8>>,
    memory_type: u32,
    block: usize,
    resource_type: ResourceType,
}

/// Memory allocator that manages Vulkan memory and provides
/// functions to allocate and free resources from it.
///
/// Memory is taken from the device in large blocks, one list of
/// blocks per memory type and resource type, and resources are
/// sub-allocated from those: creating a buffer every frame costs
/// a lookup in the free index, not a `vkAllocateMemory` call.
/// Blocks are kept once created, even when empty, and are only
/// given back to the device by [`Allocator::destroy`].
pub struct Allocator {
    properties: vk::PhysicalDeviceMemoryProperties,
    /// Memory regions that are supported by the device. Each
    /// memory region corresponds to a single Vulkan memory
    /// type.
    regions: RefCell<Vec<MemoryRegion>>,
    /// Number of allocations not yet freed.
    live: Cell<usize>,
}

impl Allocator {
    pub fn new(
        instance: &Instance,
        physical_device: vk::PhysicalDevice,
    ) -> Self {
        let properties = unsafe {
            instance.get_physical_device_memory_properties(physical_device)
        };

        // Create a memory region for each memory type supported
        // by the device. The region registers the property flags
        // and the index of the memory type.
        let regions = (0..properties.memory_type_count)
            .map(|index| {
                MemoryRegion::new(index, properties.memory_types[index as usize].property_flags)
            })
            .collect();

        debug!(
            "Allocator sees {} memory types in {} heaps.",
            properties.memory_type_count,
            properties.memory_heap_count,
        );

        Self {
            properties,
            regions: RefCell::new(regions),
            live: Cell::new(0),
        }
    }

    pub fn live_allocations(&self) -> usize {
        self.live.get()
    }

    /// Number of `vk::DeviceMemory` objects currently held.
    pub fn block_count(&self) -> usize {
        self.regions.borrow().iter().map(MemoryRegion::block_count).sum()
    }

    pub fn allocate(
        &self,
        device: &Device,
        requirements: vk::MemoryRequirements,
        usage: MemoryUse,
        resource_type: ResourceType,
    ) -> Result<Allocation> {
        // Find the memory type that satisfies the requirements
        // and the desired use, and select the region
        // corresponding to this memory type.
        let memory_type = find_memory_type(&self.properties, requirements.memory_type_bits, usage)
            .ok_or_else(|| anyhow!("Failed to find suitable memory type for {:?}.", usage))?;

        let mut regions = self.regions.borrow_mut();
        let region = regions
            .get_mut(memory_type as usize)
            .ok_or_else(|| anyhow!("No memory region for type {memory_type}."))?;

        let allocation = region.allocate(device, requirements, resource_type)?;

        self.live.set(self.live.get() + 1);
        trace!(
            "Allocated {} bytes at offset {} from memory type {}.",
            allocation.size,
            allocation.offset,
            memory_type,
        );

        Ok(allocation)
    }

    /// Gives the allocation's chunk back to its block. Freeing a
    /// default (null) allocation does nothing.
    pub fn free(&self, allocation: Allocation) {
        if allocation.memory.is_null() {
            return;
        }

        let mut regions = self.regions.borrow_mut();
        let freed = regions
            .get_mut(allocation.memory_type as usize)
            .is_some_and(|region| region.free(&allocation));

        if freed {
            self.live.set(self.live.get().saturating_sub(1));
        } else {
            warn!(
                "Ignoring free of unknown allocation at offset {} of {:?}.",
                allocation.offset,
                allocation.memory,
            );
        }
    }

    /// Reports allocations that were never freed and gives every
    /// block back to the device.
    pub fn destroy(&self, device: &Device) {
        match self.live_allocations() {
            0 => info!("Allocator destroyed with no live allocations."),
            n => warn!("Allocator destroyed with {n} live allocations."),
        }

        for region in self.regions.borrow_mut().iter_mut() {
            region.destroy(device);
        }
    }
}
