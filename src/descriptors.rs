use crate::deletion::DeletionQueue;

use vulkanalia::prelude::v1_3::*;
use anyhow::{anyhow, Result};
use log::*;

/// Hard ceiling on the number of sets a single growable pool may
/// be created with.
pub const MAX_SETS_PER_POOL: u32 = 4096;

/// Number of descriptors of one type to reserve per set.
#[derive(Clone, Copy, Debug)]
pub struct PoolSizeRatio {
    pub descriptor_type: vk::DescriptorType,
    pub ratio: f32,
}

impl PoolSizeRatio {
    pub const fn new(descriptor_type: vk::DescriptorType, ratio: f32) -> Self {
        Self { descriptor_type, ratio }
    }
}

/// Pool sizes for a pool holding `set_count` sets.
pub fn pool_sizes(ratios: &[PoolSizeRatio], set_count: u32) -> Vec<vk::DescriptorPoolSize> {
    ratios
        .iter()
        .map(|r| {
            vk::DescriptorPoolSize::builder()
                .type_(r.descriptor_type)
                .descriptor_count(((r.ratio * set_count as f32) as u32).max(1))
                .build()
        })
        .collect()
}

fn create_pool(
    device: &Device,
    set_count: u32,
    ratios: &[PoolSizeRatio],
) -> Result<vk::DescriptorPool> {
    let sizes = pool_sizes(ratios, set_count);
    let info = vk::DescriptorPoolCreateInfo::builder()
        .max_sets(set_count)
        .pool_sizes(&sizes);

    Ok(unsafe { device.create_descriptor_pool(&info, None)? })
}

fn allocate_set(
    device: &Device,
    pool: vk::DescriptorPool,
    layout: vk::DescriptorSetLayout,
) -> Result<vk::DescriptorSet, vk::ErrorCode> {
    let layouts = &[layout];
    let info = vk::DescriptorSetAllocateInfo::builder()
        .descriptor_pool(pool)
        .set_layouts(layouts);

    let sets = unsafe { device.allocate_descriptor_sets(&info)? };
    Ok(sets[0])
}

/// Accumulates bindings for one descriptor set layout.
#[derive(Default)]
pub struct DescriptorLayoutBuilder {
    bindings: Vec<vk::DescriptorSetLayoutBinding>,
}

impl DescriptorLayoutBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_binding(&mut self, binding: u32, descriptor_type: vk::DescriptorType) -> &mut Self {
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::builder()
                .binding(binding)
                .descriptor_type(descriptor_type)
                .descriptor_count(1)
                .build(),
        );
        self
    }

    pub fn clear(&mut self) {
        self.bindings.clear();
    }

    /// Creates the layout, making every accumulated binding
    /// visible to `stages`. The builder keeps its bindings.
    pub fn build(
        &mut self,
        device: &Device,
        stages: vk::ShaderStageFlags,
        flags: vk::DescriptorSetLayoutCreateFlags,
    ) -> Result<vk::DescriptorSetLayout> {
        let info = self.create_info(stages, flags);
        Ok(unsafe { device.create_descriptor_set_layout(&info, None)? })
    }

    /// Same as [`build`](Self::build), with `next` chained to the
    /// create info: per-binding flags for descriptor indexing,
    /// for example.
    pub fn build_with_next<T>(
        &mut self,
        device: &Device,
        stages: vk::ShaderStageFlags,
        next: &mut impl vk::Cast<Target = T>,
        flags: vk::DescriptorSetLayoutCreateFlags,
    ) -> Result<vk::DescriptorSetLayout>
    where
        T: vk::ExtendsDescriptorSetLayoutCreateInfo,
    {
        let info = self.create_info(stages, flags).push_next(next);
        Ok(unsafe { device.create_descriptor_set_layout(&info, None)? })
    }

    fn create_info(
        &mut self,
        stages: vk::ShaderStageFlags,
        flags: vk::DescriptorSetLayoutCreateFlags,
    ) -> vk::DescriptorSetLayoutCreateInfoBuilder<'_> {
        for binding in &mut self.bindings {
            binding.stage_flags |= stages;
        }

        vk::DescriptorSetLayoutCreateInfo::builder()
            .bindings(&self.bindings)
            .flags(flags)
    }
}

/// Single fixed-size pool, for sets whose count is known up
/// front. Running out of space is an error.
#[derive(Default)]
pub struct DescriptorAllocator {
    pool: vk::DescriptorPool,
}

impl DescriptorAllocator {
    pub fn new(device: &Device, max_sets: u32, ratios: &[PoolSizeRatio]) -> Result<Self> {
        let pool = create_pool(device, max_sets, ratios)?;
        debug!("Fixed descriptor pool created ({max_sets} sets).");
        Ok(Self { pool })
    }

    pub fn allocate(&self, device: &Device, layout: vk::DescriptorSetLayout) -> Result<vk::DescriptorSet> {
        allocate_set(device, self.pool, layout)
            .map_err(|e| anyhow!("Fixed descriptor pool allocation failed: {e}"))
    }

    /// Frees every set at once; the pool itself is kept.
    pub fn clear_pool(&self, device: &Device) -> Result<()> {
        unsafe { device.reset_descriptor_pool(self.pool, vk::DescriptorPoolResetFlags::empty())? };
        Ok(())
    }

    /// Queues the pool for destruction, taking every set
    /// allocated from it along.
    pub fn defer_destroy(&self, queue: &mut DeletionQueue) {
        queue.push(self.pool);
    }
}

/// Set count schedule for the pools of a growable allocator:
/// starts at twice the initial count and doubles with every pool
/// created, never exceeding [`MAX_SETS_PER_POOL`].
#[derive(Clone, Copy, Debug, Default)]
pub struct PoolGrowth {
    next: u32,
}

impl PoolGrowth {
    pub fn new(initial_sets: u32) -> Self {
        Self { next: Self::grow(initial_sets) }
    }

    fn grow(sets: u32) -> u32 {
        sets.saturating_mul(2).min(MAX_SETS_PER_POOL)
    }

    /// Set count the next pool will be created with.
    pub fn next_set_count(&self) -> u32 {
        self.next
    }

    /// Takes the set count for a new pool and advances the
    /// schedule.
    pub fn take(&mut self) -> u32 {
        let sets = self.next;
        self.next = Self::grow(sets);
        sets
    }
}

/// Pools with room left and pools known to be exhausted.
#[derive(Debug)]
pub struct PoolLists<P> {
    ready: Vec<P>,
    full: Vec<P>,
}

impl<P> Default for PoolLists<P> {
    fn default() -> Self {
        Self { ready: Vec::new(), full: Vec::new() }
    }
}

impl<P> PoolLists<P> {
    /// Most recently returned ready pool, if any.
    pub fn take_ready(&mut self) -> Option<P> {
        self.ready.pop()
    }

    pub fn return_ready(&mut self, pool: P) {
        self.ready.push(pool);
    }

    pub fn mark_full(&mut self, pool: P) {
        self.full.push(pool);
    }

    pub fn ready_count(&self) -> usize {
        self.ready.len()
    }

    pub fn full_count(&self) -> usize {
        self.full.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &P> {
        self.ready.iter().chain(self.full.iter())
    }

    /// Moves every full pool back to the ready list. The pools
    /// must have been reset beforehand.
    pub fn recycle(&mut self) {
        self.ready.append(&mut self.full);
    }

    pub fn drain(&mut self) -> impl Iterator<Item = P> + '_ {
        self.ready.drain(..).chain(self.full.drain(..))
    }
}

/// Descriptor allocator that creates new, larger pools when the
/// current ones run out.
#[derive(Default)]
pub struct DescriptorAllocatorGrowable {
    ratios: Vec<PoolSizeRatio>,
    pools: PoolLists<vk::DescriptorPool>,
    growth: PoolGrowth,
}

impl DescriptorAllocatorGrowable {
    pub fn new(device: &Device, initial_sets: u32, ratios: &[PoolSizeRatio]) -> Result<Self> {
        let mut pools = PoolLists::default();
        pools.return_ready(create_pool(device, initial_sets, ratios)?);

        debug!("Growable descriptor allocator created ({initial_sets} initial sets).");
        Ok(Self {
            ratios: ratios.to_vec(),
            pools,
            growth: PoolGrowth::new(initial_sets),
        })
    }

    pub fn growth(&self) -> PoolGrowth {
        self.growth
    }

    pub fn ready_pool_count(&self) -> usize {
        self.pools.ready_count()
    }

    pub fn full_pool_count(&self) -> usize {
        self.pools.full_count()
    }

    fn get_pool(&mut self, device: &Device) -> Result<vk::DescriptorPool> {
        if let Some(pool) = self.pools.take_ready() {
            return Ok(pool);
        }

        let sets = self.growth.take();
        debug!("Creating descriptor pool with {sets} sets.");
        create_pool(device, sets, &self.ratios)
    }

    /// Allocates one set, rotating to a fresh pool when the
    /// current one is exhausted or fragmented.
    pub fn allocate(&mut self, device: &Device, layout: vk::DescriptorSetLayout) -> Result<vk::DescriptorSet> {
        let pool = self.get_pool(device)?;

        let set = match allocate_set(device, pool, layout) {
            Ok(set) => {
                self.pools.return_ready(pool);
                return Ok(set);
            }
            Err(vk::ErrorCode::OUT_OF_POOL_MEMORY) | Err(vk::ErrorCode::FRAGMENTED_POOL) => {
                // Both errors mean the pool cannot hold this set
                // any more, either because it ran out of sets or
                // descriptors, or because its free space is too
                // scattered. It is parked in the full list until
                // the next reset rather than tried again, which
                // would fail the same way.
                self.pools.mark_full(pool);

                // The next pool is either one that was reset
                // since, or a new one twice as large as the last.
                // Both are empty, so a failure there means the
                // layout needs more descriptors than the ratios
                // ever provide and retrying further would loop
                // forever; it is reported instead.
                let pool = self.get_pool(device)?;
                let set = allocate_set(device, pool, layout)
                    .map_err(|e| anyhow!("Descriptor allocation failed on a fresh pool: {e}"));
                self.pools.return_ready(pool);
                set?
            }
            Err(e) => {
                self.pools.return_ready(pool);
                return Err(e.into());
            }
        };

        Ok(set)
    }

    /// Resets every pool and makes them all ready again. Sets
    /// allocated before are invalid afterwards.
    pub fn clear_pools(&mut self, device: &Device) -> Result<()> {
        for &pool in self.pools.iter() {
            unsafe { device.reset_descriptor_pool(pool, vk::DescriptorPoolResetFlags::empty())? };
        }
        self.pools.recycle();
        Ok(())
    }

    /// Hands every pool over to `queue`. Pools are created on
    /// demand, so this can only be done once the allocator is no
    /// longer used; it is left empty afterwards.
    pub fn defer_destroy(&mut self, queue: &mut DeletionQueue) {
        for pool in self.pools.drain() {
            queue.push(pool);
        }
    }
}

enum PendingInfo {
    Image(vk::DescriptorImageInfo),
    Buffer(vk::DescriptorBufferInfo),
}

struct PendingWrite {
    binding: u32,
    descriptor_type: vk::DescriptorType,
    info: PendingInfo,
}

/// Batches descriptor writes independently of the set they end
/// up in, so one writer can fill many sets.
#[derive(Default)]
pub struct DescriptorWriter {
    writes: Vec<PendingWrite>,
}

impl DescriptorWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_image(
        &mut self,
        binding: u32,
        image_view: vk::ImageView,
        sampler: vk::Sampler,
        layout: vk::ImageLayout,
        descriptor_type: vk::DescriptorType,
    ) -> &mut Self {
        let info = vk::DescriptorImageInfo::builder()
            .image_view(image_view)
            .sampler(sampler)
            .image_layout(layout)
            .build();

        self.writes.push(PendingWrite {
            binding,
            descriptor_type,
            info: PendingInfo::Image(info),
        });
        self
    }

    pub fn write_buffer(
        &mut self,
        binding: u32,
        buffer: vk::Buffer,
        size: u64,
        offset: u64,
        descriptor_type: vk::DescriptorType,
    ) -> &mut Self {
        let info = vk::DescriptorBufferInfo::builder()
            .buffer(buffer)
            .offset(offset)
            .range(size)
            .build();

        self.writes.push(PendingWrite {
            binding,
            descriptor_type,
            info: PendingInfo::Buffer(info),
        });
        self
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn clear(&mut self) {
        self.writes.clear();
    }

    /// Applies every pending write to `set` in a single update.
    pub fn update_set(&self, device: &Device, set: vk::DescriptorSet) {
        let writes = self
            .writes
            .iter()
            .map(|w| {
                let write = vk::WriteDescriptorSet::builder()
                    .dst_set(set)
                    .dst_binding(w.binding)
                    .dst_array_element(0)
                    .descriptor_type(w.descriptor_type);

                match &w.info {
                    PendingInfo::Image(info) => write.image_info(std::slice::from_ref(info)).build(),
                    PendingInfo::Buffer(info) => write.buffer_info(std::slice::from_ref(info)).build(),
                }
            })
            .collect::<Vec<_>>();

        unsafe { device.update_descriptor_sets(&writes, &[] as &[vk::CopyDescriptorSet]) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn growth_follows_the_doubling_law() {
        let initial = 10;
        let mut growth = PoolGrowth::new(initial);

        for k in 0..12u32 {
            let expected = (initial as u64 * 2u64.pow(k + 1)).min(MAX_SETS_PER_POOL as u64) as u32;
            assert_eq!(growth.next_set_count(), expected, "after {k} exhaustions");
            growth.take();
        }
    }

    #[test]
    fn growth_never_exceeds_the_ceiling() {
        let mut growth = PoolGrowth::new(3000);
        for _ in 0..8 {
            assert!(growth.take() <= MAX_SETS_PER_POOL);
        }
        assert_eq!(growth.next_set_count(), MAX_SETS_PER_POOL);

        let huge = PoolGrowth::new(u32::MAX);
        assert_eq!(huge.next_set_count(), MAX_SETS_PER_POOL);
    }

    #[test]
    fn ready_pools_are_reused_most_recent_first() {
        let mut pools = PoolLists::default();
        pools.return_ready(1);
        pools.return_ready(2);

        assert_eq!(pools.take_ready(), Some(2));
        assert_eq!(pools.take_ready(), Some(1));
        assert_eq!(pools.take_ready(), None);
    }

    #[test]
    fn recycling_merges_full_pools_into_ready() {
        let mut pools = PoolLists::default();
        pools.return_ready(1);
        pools.mark_full(2);
        pools.mark_full(3);

        assert_eq!(pools.iter().count(), 3);
        pools.recycle();

        assert_eq!(pools.ready_count(), 3);
        assert_eq!(pools.full_count(), 0);
        assert_eq!(pools.drain().collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(pools.iter().count(), 0);
    }

    #[test]
    fn pool_sizes_scale_with_the_set_count() {
        let ratios = [
            PoolSizeRatio::new(vk::DescriptorType::UNIFORM_BUFFER, 3.0),
            PoolSizeRatio::new(vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 0.5),
        ];

        let sizes = pool_sizes(&ratios, 10);
        assert_eq!(sizes[0].type_, vk::DescriptorType::UNIFORM_BUFFER);
        assert_eq!(sizes[0].descriptor_count, 30);
        assert_eq!(sizes[1].descriptor_count, 5);
    }

    #[test]
    fn writer_batches_until_cleared() {
        let mut writer = DescriptorWriter::new();
        writer
            .write_buffer(0, vk::Buffer::null(), 64, 0, vk::DescriptorType::UNIFORM_BUFFER)
            .write_image(
                1,
                vk::ImageView::null(),
                vk::Sampler::null(),
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            );

        assert_eq!(writer.len(), 2);
        writer.clear();
        assert!(writer.is_empty());
    }
}
