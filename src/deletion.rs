use crate::resources::{AllocatedBuffer, AllocatedImage};

use vulkanalia::prelude::v1_3::*;

/// A GPU object whose destruction has been deferred.
#[derive(Debug)]
pub enum Disposable {
    Buffer(AllocatedBuffer),
    Image(AllocatedImage),
    ImageView(vk::ImageView),
    Sampler(vk::Sampler),
    DescriptorPool(vk::DescriptorPool),
    DescriptorSetLayout(vk::DescriptorSetLayout),
    Pipeline(vk::Pipeline),
    PipelineLayout(vk::PipelineLayout),
}

/// Something able to destroy deferred objects of type `T`.
pub trait Release<T> {
    fn release(&mut self, resource: T);
}

impl<T, R: Release<T> + ?Sized> Release<T> for &mut R {
    fn release(&mut self, resource: T) {
        (**self).release(resource);
    }
}

/// Deferred destruction list.
///
/// Objects are released in the reverse of the order they were
/// pushed, so anything created from an earlier object goes away
/// before it. Release calls that fail must log and carry on; a
/// flush always runs to the end.
#[derive(Debug)]
pub struct DeletionQueue<T = Disposable> {
    resources: Vec<T>,
}

impl<T> Default for DeletionQueue<T> {
    fn default() -> Self {
        Self { resources: Vec::new() }
    }
}

impl<T> DeletionQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, resource: impl Into<T>) {
        self.resources.push(resource.into());
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Releases everything, last pushed first, and leaves the
    /// queue empty.
    pub fn flush<R: Release<T> + ?Sized>(&mut self, releaser: &mut R) {
        while let Some(resource) = self.resources.pop() {
            releaser.release(resource);
        }
    }
}

/// Runs `build` with a scratch queue for the objects it creates.
/// If it fails, everything it pushed so far is released before
/// the error is returned; if it succeeds, the queue is dropped
/// and the objects are left to the caller.
pub fn release_on_error<T, O, E, R>(
    mut releaser: R,
    build: impl FnOnce(&mut DeletionQueue<T>) -> Result<O, E>,
) -> Result<O, E>
where
    R: Release<T>,
{
    let mut created = DeletionQueue::new();
    let result = build(&mut created);
    if result.is_err() {
        created.flush(&mut releaser);
    }
    result
}

impl From<AllocatedBuffer> for Disposable {
    fn from(buffer: AllocatedBuffer) -> Self {
        Disposable::Buffer(buffer)
    }
}

impl From<AllocatedImage> for Disposable {
    fn from(image: AllocatedImage) -> Self {
        Disposable::Image(image)
    }
}

impl From<vk::ImageView> for Disposable {
    fn from(view: vk::ImageView) -> Self {
        Disposable::ImageView(view)
    }
}

impl From<vk::Sampler> for Disposable {
    fn from(sampler: vk::Sampler) -> Self {
        Disposable::Sampler(sampler)
    }
}

impl From<vk::DescriptorPool> for Disposable {
    fn from(pool: vk::DescriptorPool) -> Self {
        Disposable::DescriptorPool(pool)
    }
}

impl From<vk::DescriptorSetLayout> for Disposable {
    fn from(layout: vk::DescriptorSetLayout) -> Self {
        Disposable::DescriptorSetLayout(layout)
    }
}

impl From<vk::Pipeline> for Disposable {
    fn from(pipeline: vk::Pipeline) -> Self {
        Disposable::Pipeline(pipeline)
    }
}

impl From<vk::PipelineLayout> for Disposable {
    fn from(layout: vk::PipelineLayout) -> Self {
        Disposable::PipelineLayout(layout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder(Vec<u32>);

    impl Release<u32> for Recorder {
        fn release(&mut self, resource: u32) {
            self.0.push(resource);
        }
    }

    #[test]
    fn flush_releases_in_reverse_order() {
        let mut queue = DeletionQueue::<u32>::new();
        for i in 0u32..5 {
            queue.push(i);
        }

        let mut recorder = Recorder::default();
        queue.flush(&mut recorder);

        assert_eq!(recorder.0, vec![4, 3, 2, 1, 0]);
        assert!(queue.is_empty());
    }

    #[test]
    fn second_flush_is_a_no_op() {
        let mut queue = DeletionQueue::<u32>::new();
        queue.push(7u32);

        let mut recorder = Recorder::default();
        queue.flush(&mut recorder);
        queue.flush(&mut recorder);

        assert_eq!(recorder.0, vec![7]);
    }

    #[test]
    fn flushing_an_empty_queue_does_nothing() {
        let mut queue = DeletionQueue::<u32>::new();
        let mut recorder = Recorder::default();
        queue.flush(&mut recorder);

        assert!(recorder.0.is_empty());
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn failed_builds_release_what_they_created() {
        let mut recorder = Recorder::default();
        let result = release_on_error(&mut recorder, |created: &mut DeletionQueue<u32>| {
            created.push(1u32);
            created.push(2u32);
            Err::<(), _>("third step failed")
        });

        assert_eq!(result, Err("third step failed"));
        assert_eq!(recorder.0, vec![2, 1]);
    }

    #[test]
    fn successful_builds_keep_what_they_created() {
        let mut recorder = Recorder::default();
        let result = release_on_error(&mut recorder, |created: &mut DeletionQueue<u32>| {
            created.push(1u32);
            Ok::<_, ()>(5)
        });

        assert_eq!(result, Ok(5));
        assert!(recorder.0.is_empty());
    }

    #[test]
    fn pushes_after_a_flush_start_a_new_sequence() {
        let mut queue = DeletionQueue::<u32>::new();
        let mut recorder = Recorder::default();

        queue.push(1u32);
        queue.push(2u32);
        queue.flush(&mut recorder);
        queue.push(3u32);
        queue.flush(&mut recorder);

        assert_eq!(recorder.0, vec![2, 1, 3]);
    }
}
