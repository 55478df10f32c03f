use std::collections::BTreeMap;
use std::ptr::NonNull;

use vulkanalia::prelude::v1_3::*;
use anyhow::{anyhow, Result};
use log::*;

use super::Allocation;
use super::tlsf::{FreeChunk, Tlsf};

/// How a memory resource will be used.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryUse {
    /// Resource that is only used by the GPU. Corresponds to
    /// the `DEVICE_LOCAL` flag.
    GpuOnly,
    /// Resource that is written by the CPU and read by the GPU
    /// (staging buffers, per-frame uniforms). Must be
    /// `HOST_VISIBLE | HOST_COHERENT`, ideally also
    /// `DEVICE_LOCAL`.
    CpuToGpu,
    /// Resource that is written by the GPU and read back by the
    /// CPU. Must be `HOST_VISIBLE | HOST_COHERENT`, ideally also
    /// `HOST_CACHED`.
    GpuToCpu,
}

impl MemoryUse {
    pub fn required_flags(self) -> vk::MemoryPropertyFlags {
        match self {
            MemoryUse::GpuOnly => vk::MemoryPropertyFlags::DEVICE_LOCAL,
            MemoryUse::CpuToGpu | MemoryUse::GpuToCpu => {
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
            }
        }
    }

    pub fn preferred_flags(self) -> vk::MemoryPropertyFlags {
        match self {
            MemoryUse::GpuOnly => vk::MemoryPropertyFlags::DEVICE_LOCAL,
            MemoryUse::CpuToGpu => self.required_flags() | vk::MemoryPropertyFlags::DEVICE_LOCAL,
            MemoryUse::GpuToCpu => self.required_flags() | vk::MemoryPropertyFlags::HOST_CACHED,
        }
    }

    /// Whether allocations of this kind are persistently mapped.
    pub fn is_host_visible(self) -> bool {
        !matches!(self, MemoryUse::GpuOnly)
    }
}

/// Finds a memory type allowed by `type_bits` for the given use:
/// the first type carrying all preferred flags, or failing that
/// the first one carrying the required flags.
pub fn find_memory_type(
    properties: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    usage: MemoryUse,
) -> Option<u32> {
    let find = |flags: vk::MemoryPropertyFlags| {
        (0..properties.memory_type_count).find(|&i| {
            // The "memory type bits" field of the requirements
            // has a bit set at the index of every compatible
            // memory type.
            type_bits & (1 << i) != 0
                && properties.memory_types[i as usize].property_flags.contains(flags)
        })
    };

    find(usage.preferred_flags()).or_else(|| find(usage.required_flags()))
}

/// Type of the resource to be allocated.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ResourceType {
    /// The resource is bound to a linear memory block (a
    /// buffer, for example).
    #[default]
    Linear,
    /// The resource is bound to a non-linear memory block (an
    /// image with `VK_IMAGE_TILING_OPTIMAL`, for example).
    NonLinear,
}

/// Blocks of device-local memory are allocated with a size of
/// 64 MiB, host-visible ones with 16 MiB since some of those
/// heaps (the device-local, host-visible one in particular) are
/// only a couple hundred MiB large. Anything bigger than a block
/// gets a block of its own size.
const DEVICE_BLOCK_SIZE: u64 = 64 * 1024 * 1024;
const HOST_BLOCK_SIZE: u64 = 16 * 1024 * 1024;

/// Portion of a block, either handed out or free.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Chunk {
    size: u64,
    free: bool,
}

/// Memory block that is allocated from a memory region. It
/// holds one contiguous slice of `vk::DeviceMemory` and
/// sub-allocates it into chunks.
pub struct MemoryBlock {
    /// Actual device memory allocated from Vulkan, which is
    /// then sub-allocated into chunks.
    memory: vk::DeviceMemory,
    /// Host pointer to the start of the block, if the memory is
    /// host visible. The block is mapped once for its whole
    /// lifetime.
    mapped: Option<NonNull<u8>>,
    /// Size of the memory block.
    size: u64,
    /// Chunks the block is comprised of, keyed by their offset.
    /// They tile the block without gaps, so the neighbours of a
    /// chunk are the entries right before and after it.
    chunks: BTreeMap<u64, Chunk>,
    /// Number of bytes currently allocated from the block.
    allocated: u64,
}

impl MemoryBlock {
    pub fn new(memory: vk::DeviceMemory, mapped: Option<NonNull<u8>>, size: u64) -> Self {
        // At first the block is empty, so it contains a single
        // free chunk at offset 0 that spans the entire size of
        // the block.
        let chunks = BTreeMap::from([(0, Chunk { size, free: true })]);

        Self {
            memory,
            mapped,
            size,
            chunks,
            allocated: 0,
        }
    }
}

/// Blocks of one memory type holding one kind of resource, along
/// with the index of their free chunks.
#[derive(Default)]
pub struct BlockList {
    blocks: Vec<MemoryBlock>,
    free: Tlsf,
}

impl BlockList {
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn block(&self, index: usize) -> Option<&MemoryBlock> {
        self.blocks.get(index)
    }

    /// Adds a fresh block and returns its index.
    pub fn push(&mut self, block: MemoryBlock) -> usize {
        let index = self.blocks.len();
        self.free.insert(FreeChunk {
            block: index,
            offset: 0,
            size: block.size,
        });
        self.blocks.push(block);
        index
    }

    /// Carves `size` bytes at the given alignment out of a free
    /// chunk, returning the block index and offset. None means
    /// no block has room left.
    pub fn sub_allocate(&mut self, size: u64, alignment: u64) -> Option<(usize, u64)> {
        if self.free.is_empty() {
            return None;
        }

        let size = size.max(1);
        let alignment = alignment.max(1);

        let chunk = self.free.find(size, alignment)?;
        let block = &mut self.blocks[chunk.block];

        // The chunk is split in up to three parts: the padding
        // in front of the aligned offset and the tail after the
        // allocation both go back to the free index, so nothing
        // is lost to alignment for longer than the allocation
        // lives.
        let offset = align_up(chunk.offset, alignment);
        let front = offset - chunk.offset;
        let back = chunk.offset + chunk.size - (offset + size);

        block.chunks.remove(&chunk.offset);

        if front > 0 {
            block.chunks.insert(chunk.offset, Chunk { size: front, free: true });
            self.free.insert(FreeChunk {
                block: chunk.block,
                offset: chunk.offset,
                size: front,
            });
        }

        block.chunks.insert(offset, Chunk { size, free: false });

        if back > 0 {
            block.chunks.insert(offset + size, Chunk { size: back, free: true });
            self.free.insert(FreeChunk {
                block: chunk.block,
                offset: offset + size,
                size: back,
            });
        }

        block.allocated += size;
        Some((chunk.block, offset))
    }

    /// Returns the chunk at `offset` to the free index, merging
    /// it with free neighbours. Returns false if no allocation
    /// starts there.
    pub fn release(&mut self, index: usize, offset: u64) -> bool {
        let Some(block) = self.blocks.get_mut(index) else {
            return false;
        };
        let Some(&chunk) = block.chunks.get(&offset) else {
            return false;
        };
        if chunk.free {
            return false;
        }

        block.allocated -= chunk.size;

        let mut start = offset;
        let mut size = chunk.size;

        // Chunks tile the block, so the next one starts right
        // where this one ends. If it is free, it is absorbed.
        if let Some(&next) = block.chunks.get(&(offset + size)) {
            if next.free {
                self.free.remove(FreeChunk { block: index, offset: offset + size, size: next.size });
                block.chunks.remove(&(offset + size));
                size += next.size;
            }
        }

        // The previous one is the last entry before the offset.
        // If it is free, it absorbs this chunk instead.
        let previous = block.chunks.range(..offset).next_back().map(|(&o, &c)| (o, c));
        if let Some((previous_offset, previous)) = previous {
            if previous.free {
                self.free.remove(FreeChunk { block: index, offset: previous_offset, size: previous.size });
                block.chunks.remove(&offset);
                start = previous_offset;
                size += previous.size;
            }
        }

        block.chunks.insert(start, Chunk { size, free: true });
        self.free.insert(FreeChunk { block: index, offset: start, size });
        true
    }

    pub fn drain(&mut self) -> impl Iterator<Item = MemoryBlock> + '_ {
        self.free = Tlsf::new();
        self.blocks.drain(..)
    }
}

/// Memory pool blocks are allocated from. Each region
/// corresponds to a single Vulkan memory type.
pub struct MemoryRegion {
    /// Blocks for linear resources.
    linear: BlockList,
    /// Blocks for non-linear resources.
    non_linear: BlockList,
    /// Index of the memory type of the region.
    pub memory_type: u32,
    /// Properties of the memory type of the region.
    pub properties: vk::MemoryPropertyFlags,
}

impl MemoryRegion {
    pub fn new(memory_type: u32, properties: vk::MemoryPropertyFlags) -> Self {
        Self {
            linear: BlockList::default(),
            non_linear: BlockList::default(),
            memory_type,
            properties,
        }
    }

    pub fn block_count(&self) -> usize {
        self.linear.len() + self.non_linear.len()
    }

    fn blocks_mut(&mut self, resource_type: ResourceType) -> &mut BlockList {
        // Linear and non-linear resources are managed
        // independently, in order to avoid having to deal with
        // the buffer-image granularity: a buffer and an optimal
        // image can never share a block, so they can never
        // share a page either.
        match resource_type {
            ResourceType::Linear => &mut self.linear,
            ResourceType::NonLinear => &mut self.non_linear,
        }
    }

    fn block_size(&self) -> u64 {
        if self.properties.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            HOST_BLOCK_SIZE
        } else {
            DEVICE_BLOCK_SIZE
        }
    }

    pub fn allocate(
        &mut self,
        device: &Device,
        requirements: vk::MemoryRequirements,
        resource_type: ResourceType,
    ) -> Result<Allocation> {
        let memory_type = self.memory_type;
        let host_visible = self.properties.contains(vk::MemoryPropertyFlags::HOST_VISIBLE);
        let block_size = self.block_size().max(requirements.size);
        let blocks = self.blocks_mut(resource_type);

        // Request a free chunk to allocate from. If there is
        // none, there is no free space available, so a new
        // block is created first; being empty it always has
        // room, since offset 0 satisfies any alignment.
        let (block, offset) = match blocks.sub_allocate(requirements.size, requirements.alignment) {
            Some(found) => found,
            None => {
                let block = allocate_block(device, memory_type, block_size, host_visible)?;
                blocks.push(block);
                blocks.sub_allocate(requirements.size, requirements.alignment)
                    .ok_or_else(|| anyhow!("Fresh memory block cannot hold {} bytes.", requirements.size))?
            }
        };

        let owner = blocks.block(block)
            .ok_or_else(|| anyhow!("Memory block {block} vanished."))?;

        // Mapped pointers are shared by every chunk of the
        // block, each one just starts further in.
        let mapped = owner.mapped
            .and_then(|base| NonNull::new(unsafe { base.as_ptr().add(offset as usize) }));

        Ok(Allocation {
            memory: owner.memory,
            offset,
            size: requirements.size,
            mapped,
            memory_type,
            block,
            resource_type,
        })
    }

    pub fn free(&mut self, allocation: &Allocation) -> bool {
        self.blocks_mut(allocation.resource_type).release(allocation.block, allocation.offset)
    }

    /// Frees every block of the region. Blocks that still have
    /// allocations in them are reported.
    pub fn destroy(&mut self, device: &Device) {
        let memory_type = self.memory_type;
        let blocks = self.linear.drain().chain(self.non_linear.drain());

        for block in blocks {
            if block.allocated > 0 {
                warn!(
                    "Freeing memory block of type {memory_type} with {} bytes still allocated.",
                    block.allocated,
                );
            }

            unsafe {
                if block.mapped.is_some() {
                    device.unmap_memory(block.memory);
                }
                device.free_memory(block.memory, None);
            }
        }
    }
}

fn allocate_block(
    device: &Device,
    memory_type: u32,
    size: u64,
    host_visible: bool,
) -> Result<MemoryBlock> {
    // Buffers whose address is queried from shaders need their
    // memory allocated with the DEVICE_ADDRESS flag. Any buffer
    // may end up in any block, so every block gets it.
    let mut flags_info = vk::MemoryAllocateFlagsInfo::builder()
        .flags(vk::MemoryAllocateFlags::DEVICE_ADDRESS);

    // Memory info: the block is allocated from the device with
    // a specific size and memory type.
    let info = vk::MemoryAllocateInfo::builder()
        .allocation_size(size)
        .memory_type_index(memory_type)
        .push_next(&mut flags_info);

    let memory = unsafe { device.allocate_memory(&info, None)? };

    let mapped = if host_visible {
        let pointer = unsafe {
            device.map_memory(memory, 0, vk::WHOLE_SIZE as u64, vk::MemoryMapFlags::empty())
        };
        match pointer {
            Ok(pointer) => NonNull::new(pointer.cast::<u8>()),
            Err(e) => {
                unsafe { device.free_memory(memory, None) };
                return Err(e.into());
            }
        }
    } else {
        None
    };

    debug!("Allocated {} MiB memory block of type {memory_type}.", size / (1024 * 1024));
    Ok(MemoryBlock::new(memory, mapped, size))
}

pub fn align_down(value: u64, alignment: u64) -> u64 {
    // Align a value down to another value (the alignment): let
    // us take for example V = 0x3F and an alignment A = 0x20.
    // We have:
    //
    //  A = 0010 0000
    //  A - 1 = 0001 1111 (set all lower bits)
    //  M = !(A-1) = 1110 0000 (invert to get a mask of the
    //                          higher bits)
    //
    //    V = 0011 1111
    //  & M = 1110 0000
    //  ---------------
    //        0010 0000
    //
    // All bits of V lower than A have been set to 0, so in the
    // end align_down(V) = 0x20 = A. Vulkan alignments are
    // always powers of two, which this relies on.
    value & !(alignment - 1)
}

pub fn align_up(value: u64, alignment: u64) -> u64 {
    // Aligning up is aligning down the value shifted by one
    // alignment step minus one.
    align_down(value + alignment - 1, alignment)
}

#[cfg(test)]
mod tests {
    use super::*;

    use vulkanalia::vk::Handle;

    fn properties(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut properties = vk::PhysicalDeviceMemoryProperties::default();
        properties.memory_type_count = types.len() as u32;
        for (i, &flags) in types.iter().enumerate() {
            properties.memory_types[i].property_flags = flags;
        }
        properties
    }

    const DEVICE: vk::MemoryPropertyFlags = vk::MemoryPropertyFlags::DEVICE_LOCAL;

    fn host() -> vk::MemoryPropertyFlags {
        vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
    }

    #[test]
    fn gpu_only_picks_device_local() {
        let properties = properties(&[host(), DEVICE]);
        assert_eq!(find_memory_type(&properties, 0b11, MemoryUse::GpuOnly), Some(1));
    }

    #[test]
    fn cpu_to_gpu_prefers_device_local_host_memory() {
        let properties = properties(&[host(), DEVICE, host() | DEVICE]);
        assert_eq!(find_memory_type(&properties, 0b111, MemoryUse::CpuToGpu), Some(2));
    }

    #[test]
    fn cpu_to_gpu_falls_back_to_plain_host_memory() {
        let properties = properties(&[DEVICE, host()]);
        assert_eq!(find_memory_type(&properties, 0b11, MemoryUse::CpuToGpu), Some(1));
    }

    #[test]
    fn type_bits_exclude_incompatible_types() {
        let properties = properties(&[host(), host()]);
        assert_eq!(find_memory_type(&properties, 0b10, MemoryUse::GpuToCpu), Some(1));
        assert_eq!(find_memory_type(&properties, 0b00, MemoryUse::GpuToCpu), None);
    }

    fn list_with_block(size: u64) -> BlockList {
        let mut list = BlockList::default();
        list.push(MemoryBlock::new(vk::DeviceMemory::null(), None, size));
        list
    }

    #[test]
    fn align_up_rounds_to_the_next_multiple() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_down(0x3F, 0x20), 0x20);
    }

    #[test]
    fn sub_allocations_share_one_block() {
        let mut list = list_with_block(1024);

        assert_eq!(list.sub_allocate(100, 16), Some((0, 0)));
        assert_eq!(list.sub_allocate(100, 16), Some((0, 112)));
        assert_eq!(list.len(), 1);
        assert_eq!(list.block(0).map(|b| b.allocated), Some(200));
    }

    #[test]
    fn a_full_block_refuses_further_allocations() {
        let mut list = list_with_block(256);

        assert_eq!(list.sub_allocate(256, 1), Some((0, 0)));
        assert_eq!(list.sub_allocate(1, 1), None);
    }

    #[test]
    fn alignment_padding_is_returned_to_the_free_list() {
        let mut list = list_with_block(1024);

        assert_eq!(list.sub_allocate(8, 1), Some((0, 0)));
        assert_eq!(list.sub_allocate(64, 256), Some((0, 256)));
        // The gap between 8 and 256 is still usable.
        assert_eq!(list.sub_allocate(200, 8), Some((0, 8)));
    }

    #[test]
    fn freed_chunks_merge_with_both_neighbours() {
        let mut list = list_with_block(300);

        let (_, a) = list.sub_allocate(100, 1).unwrap();
        let (_, b) = list.sub_allocate(100, 1).unwrap();
        let (_, c) = list.sub_allocate(100, 1).unwrap();

        assert!(list.release(0, a));
        assert!(list.release(0, c));
        assert!(list.release(0, b));
        assert_eq!(list.block(0).map(|b| b.allocated), Some(0));

        // Only a single merged chunk can hold the whole block.
        assert_eq!(list.sub_allocate(300, 1), Some((0, 0)));
    }

    #[test]
    fn releasing_twice_or_at_a_bad_offset_fails() {
        let mut list = list_with_block(512);
        let (block, offset) = list.sub_allocate(64, 1).unwrap();

        assert!(!list.release(block, offset + 1));
        assert!(!list.release(block + 1, offset));
        assert!(list.release(block, offset));
        assert!(!list.release(block, offset));
    }

    #[test]
    fn allocations_spill_into_later_blocks() {
        let mut list = list_with_block(128);
        list.push(MemoryBlock::new(vk::DeviceMemory::null(), None, 128));

        assert_eq!(list.sub_allocate(128, 1), Some((0, 0)));
        assert_eq!(list.sub_allocate(128, 1), Some((1, 0)));
        assert_eq!(list.sub_allocate(1, 1), None);
    }
}
