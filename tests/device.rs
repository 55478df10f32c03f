//! Scenarios that need a Vulkan 1.3 device. Run with
//! `cargo test -- --ignored` on a machine with one.

use lumina::{
    core::{
        allocator::MemoryUse,
        commands::begin_one_time,
        context::Context,
        frame::{FrameData, FrameRing},
        sync::command_buffer_submit,
    },
    deletion::DeletionQueue,
    descriptors::*,
    resources::*,
};

use glam::{vec3, Vec3, Vec4};
use vulkanalia::{
    prelude::v1_3::*,
    vk::Handle,
};

#[test]
#[ignore = "needs a Vulkan device"]
fn buffers_are_destroyed_immediately() {
    let mut context = Context::create_headless().unwrap();

    let buffer = create_buffer(
        &context,
        1024,
        vk::BufferUsageFlags::TRANSFER_SRC,
        MemoryUse::CpuToGpu,
    )
    .unwrap();
    assert_eq!(context.allocator.live_allocations(), 1);

    destroy_buffer(&context, &buffer);
    assert_eq!(context.allocator.live_allocations(), 0);

    context.destroy();
}

#[test]
#[ignore = "needs a Vulkan device"]
fn uploaded_indices_read_back_unchanged() {
    let mut context = Context::create_headless().unwrap();

    let indices = [0u32, 1, 2, 2, 1, 3];
    let vertices = [
        vec3(-0.5, -0.5, 0.0),
        vec3(0.5, -0.5, 0.0),
        vec3(-0.5, 0.5, 0.0),
        vec3(0.5, 0.5, 0.0),
    ]
    .map(|p| Vertex::new(p, Vec3::Z, [0.0, 0.0], Vec4::ONE));

    let mesh = upload_mesh(&context, &indices, &vertices).unwrap();
    assert_ne!(mesh.vertex_buffer_address, 0);

    let bytes = read_buffer(&context, &mesh.index_buffer, 24).unwrap();
    let read = bytes
        .chunks_exact(4)
        .map(|c| u32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
        .collect::<Vec<_>>();
    assert_eq!(read, indices);

    mesh.destroy(&context.device, &context.allocator);
    context.destroy();
}

#[test]
#[ignore = "needs a Vulkan device"]
fn frames_alternate_between_two_slots() {
    let mut context = Context::create_headless().unwrap();
    let mut frames = FrameRing::try_new(|_| {
        FrameData::create(&context.device, context.graphics_queue_family)
    })
    .unwrap();

    let mut used = Vec::new();
    for _ in 0..3 {
        let frame = frames.current();
        let fence = frame.in_flight_fence;
        let command_buffer = frame.main_buffer;
        unsafe {
            context.device.wait_for_fences(&[fence], true, 1_000_000_000).unwrap();
        }
        frames.current_mut().reclaim(&mut context).unwrap();

        unsafe {
            context.device.reset_fences(&[fence]).unwrap();
            context.device
                .reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())
                .unwrap();
        }
        begin_one_time(&context.device, command_buffer).unwrap();
        unsafe { context.device.end_command_buffer(command_buffer).unwrap() };

        let command_buffer_info = &[command_buffer_submit(command_buffer)];
        let submit = vk::SubmitInfo2::builder().command_buffer_infos(command_buffer_info);
        unsafe {
            context.device
                .queue_submit2(context.graphics_queue, &[submit], fence)
                .unwrap();
        }

        used.push(frames.index());
        frames.advance();
    }

    assert_eq!(used, vec![0, 1, 0]);

    context.wait_idle().unwrap();
    for frame in frames.iter_mut() {
        frame.destroy(&mut context);
    }
    context.destroy();
}

#[test]
#[ignore = "needs a Vulkan device"]
fn small_buffers_share_a_memory_block() {
    let mut context = Context::create_headless().unwrap();
    let uniform = |context: &Context| {
        create_buffer(context, 256, vk::BufferUsageFlags::UNIFORM_BUFFER, MemoryUse::CpuToGpu).unwrap()
    };

    let first = uniform(&context);
    let blocks = context.allocator.block_count();
    let second = uniform(&context);

    assert_eq!(first.allocation.memory, second.allocation.memory);
    assert_ne!(first.allocation.offset, second.allocation.offset);
    assert_eq!(context.allocator.block_count(), blocks);

    // Per-frame uniforms are created and dropped all the time;
    // that must not cost a device allocation each.
    for _ in 0..100 {
        let buffer = uniform(&context);
        buffer.write(0, &[7; 256]).unwrap();
        destroy_buffer(&context, &buffer);
    }
    assert_eq!(context.allocator.block_count(), blocks);

    destroy_buffer(&context, &first);
    destroy_buffer(&context, &second);
    assert_eq!(context.allocator.live_allocations(), 0);

    context.destroy();
}

fn uniform_layout(device: &Device) -> vk::DescriptorSetLayout {
    DescriptorLayoutBuilder::new()
        .add_binding(0, vk::DescriptorType::UNIFORM_BUFFER)
        .build(device, vk::ShaderStageFlags::VERTEX, vk::DescriptorSetLayoutCreateFlags::empty())
        .unwrap()
}

#[test]
#[ignore = "needs a Vulkan device"]
fn growable_allocator_doubles_its_pools() {
    let mut context = Context::create_headless().unwrap();
    let device = &context.device;
    let layout = uniform_layout(device);

    let ratios = [PoolSizeRatio::new(vk::DescriptorType::UNIFORM_BUFFER, 1.0)];
    let mut allocator = DescriptorAllocatorGrowable::new(device, 1, &ratios).unwrap();
    assert_eq!(allocator.growth().next_set_count(), 2);

    // 1 set in the first pool, 2 in the second, then a third
    // pool of 4 is needed.
    for _ in 0..4 {
        allocator.allocate(device, layout).unwrap();
    }
    assert_eq!(allocator.full_pool_count(), 2);
    assert_eq!(allocator.ready_pool_count(), 1);
    assert_eq!(allocator.growth().next_set_count(), 8);

    allocator.clear_pools(device).unwrap();
    assert_eq!(allocator.full_pool_count(), 0);
    assert_eq!(allocator.ready_pool_count(), 3);

    // Cleared pools hold 1 + 2 + 4 sets before a new one is made.
    for _ in 0..7 {
        allocator.allocate(device, layout).unwrap();
    }
    assert_eq!(allocator.full_pool_count() + allocator.ready_pool_count(), 3);

    allocator.allocate(device, layout).unwrap();
    assert_eq!(allocator.full_pool_count() + allocator.ready_pool_count(), 4);
    assert_eq!(allocator.growth().next_set_count(), 16);

    let mut queue: DeletionQueue = DeletionQueue::new();
    allocator.defer_destroy(&mut queue);
    queue.push(layout);
    queue.flush(&mut context);
    context.destroy();
}

#[test]
#[ignore = "needs a Vulkan device"]
fn frame_descriptor_pools_are_independent() {
    let mut context = Context::create_headless().unwrap();
    let layout = uniform_layout(&context.device);
    let mut frames = FrameRing::try_new(|_| {
        FrameData::create(&context.device, context.graphics_queue_family)
    })
    .unwrap();

    // Overflow the first slot's pool so it grows.
    let first = frames.current_mut();
    for _ in 0..1001 {
        first.descriptors.allocate(&context.device, layout).unwrap();
    }
    assert_eq!(first.descriptors.full_pool_count(), 1);

    frames.advance();
    frames.current_mut().reclaim(&mut context).unwrap();
    assert_eq!(frames.current().descriptors.full_pool_count(), 0);
    assert_eq!(frames.current().descriptors.ready_pool_count(), 1);

    // Reclaiming the second slot left the first one alone.
    frames.advance();
    assert_eq!(frames.current().descriptors.full_pool_count(), 1);
    assert_eq!(frames.current().descriptors.ready_pool_count(), 1);

    frames.current_mut().reclaim(&mut context).unwrap();
    assert_eq!(frames.current().descriptors.full_pool_count(), 0);
    assert_eq!(frames.current().descriptors.ready_pool_count(), 2);

    for frame in frames.iter_mut() {
        frame.destroy(&mut context);
    }
    let mut queue: DeletionQueue = DeletionQueue::new();
    queue.push(layout);
    queue.flush(&mut context);
    context.destroy();
}

#[test]
#[ignore = "needs a Vulkan device"]
fn layouts_accept_chained_binding_flags() {
    let mut context = Context::create_headless().unwrap();

    let flags = [vk::DescriptorBindingFlags::empty(); 2];
    let mut binding_flags = vk::DescriptorSetLayoutBindingFlagsCreateInfo::builder()
        .binding_flags(&flags);

    let layout = DescriptorLayoutBuilder::new()
        .add_binding(0, vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
        .add_binding(1, vk::DescriptorType::UNIFORM_BUFFER)
        .build_with_next(
            &context.device,
            vk::ShaderStageFlags::FRAGMENT,
            &mut binding_flags,
            vk::DescriptorSetLayoutCreateFlags::empty(),
        )
        .unwrap();
    assert!(!layout.is_null());

    let mut queue: DeletionQueue = DeletionQueue::new();
    queue.push(layout);
    queue.flush(&mut context);
    context.destroy();
}
