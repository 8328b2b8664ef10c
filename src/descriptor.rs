// Descriptor heaps
//
// A heap is a fixed number of same-kind descriptor slots. Slots are handed
// out by bump allocation and never freed individually. Shader-visible
// CBV/SRV/UAV heaps are split into:
//
//   [ persistent | frame 0 | frame 1 | ... | frame N-1 ]
//
// The persistent arena lives as long as the heap. Each frame arena is reset
// at the start of the frame that owns it, once the fence says the GPU is done
// with that slot's previous use.

use crate::error::{RenderError, Result};
use crate::gpu::{DescriptorDevice, DescriptorHandle, DescriptorKind};

/// Bump allocator over a contiguous range of slots.
#[derive(Debug, Clone)]
pub struct DescriptorArena {
    base: u32,
    capacity: u32,
    next: u32,
}

impl DescriptorArena {
    pub fn new(base: u32, capacity: u32) -> Self {
        Self {
            base,
            capacity,
            next: 0,
        }
    }

    /// Reserve `count` consecutive slots and return the first one.
    pub fn allocate(&mut self, count: u32) -> Option<DescriptorHandle> {
        if count > self.remaining() {
            return None;
        }
        let handle = DescriptorHandle(self.base + self.next);
        self.next += count;
        Some(handle)
    }

    pub fn reset(&mut self) {
        self.next = 0;
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn used(&self) -> u32 {
        self.next
    }

    pub fn remaining(&self) -> u32 {
        self.capacity - self.next
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DescriptorHeapDesc<'a> {
    pub name: &'a str,
    pub kind: DescriptorKind,
    pub persistent_capacity: u32,
    /// Slots per frame arena; zero for heaps without transient arenas
    pub transient_capacity: u32,
    pub frame_count: usize,
    pub shader_visible: bool,
}

pub struct DescriptorHeap<H> {
    raw: H,
    name: String,
    kind: DescriptorKind,
    shader_visible: bool,
    persistent: DescriptorArena,
    frames: Vec<DescriptorArena>,
}

impl<H> DescriptorHeap<H> {
    pub fn new<D>(device: &D, desc: &DescriptorHeapDesc<'_>) -> Result<Self>
    where
        D: DescriptorDevice<DescriptorHeap = H> + ?Sized,
    {
        if desc.shader_visible && desc.kind != DescriptorKind::CbvSrvUav {
            return Err(RenderError::InvalidDescriptorHeap {
                heap: desc.name.to_string(),
                reason: "only CBV/SRV/UAV heaps can be shader visible",
            });
        }
        let transient_total = desc.transient_capacity * desc.frame_count as u32;
        let capacity = desc.persistent_capacity + transient_total;
        if capacity == 0 {
            return Err(RenderError::InvalidDescriptorHeap {
                heap: desc.name.to_string(),
                reason: "capacity must be non-zero",
            });
        }

        let raw = device.create_descriptor_heap(desc.name, desc.kind, capacity, desc.shader_visible)?;
        let frames = (0..desc.frame_count)
            .map(|i| {
                let base = desc.persistent_capacity + i as u32 * desc.transient_capacity;
                DescriptorArena::new(base, desc.transient_capacity)
            })
            .collect();

        log::debug!(
            "Created {:?} descriptor heap `{}`: {} persistent + {}x{} transient slots",
            desc.kind,
            desc.name,
            desc.persistent_capacity,
            desc.frame_count,
            desc.transient_capacity
        );

        Ok(Self {
            raw,
            name: desc.name.to_string(),
            kind: desc.kind,
            shader_visible: desc.shader_visible,
            persistent: DescriptorArena::new(0, desc.persistent_capacity),
            frames,
        })
    }

    pub fn allocate(&mut self) -> Result<DescriptorHandle> {
        self.allocate_range(1)
    }

    /// Reserve `count` consecutive slots that live as long as the heap.
    pub fn allocate_range(&mut self, count: u32) -> Result<DescriptorHandle> {
        let remaining = self.persistent.remaining();
        self.persistent
            .allocate(count)
            .ok_or_else(|| self.exhausted(self.persistent.capacity(), remaining, count))
    }

    /// Reserve a slot that is only valid until `frame_slot` is reset.
    pub fn allocate_transient(&mut self, frame_slot: usize) -> Result<DescriptorHandle> {
        let arena = &mut self.frames[frame_slot];
        let (capacity, remaining) = (arena.capacity(), arena.remaining());
        match arena.allocate(1) {
            Some(handle) => Ok(handle),
            None => Err(self.exhausted(capacity, remaining, 1)),
        }
    }

    pub fn reset_transient(&mut self, frame_slot: usize) {
        self.frames[frame_slot].reset();
    }

    fn exhausted(&self, capacity: u32, remaining: u32, requested: u32) -> RenderError {
        RenderError::DescriptorHeapExhausted {
            heap: self.name.clone(),
            capacity,
            remaining,
            requested,
        }
    }

    pub fn raw(&self) -> &H {
        &self.raw
    }

    pub fn kind(&self) -> DescriptorKind {
        self.kind
    }

    pub fn is_shader_visible(&self) -> bool {
        self.shader_visible
    }

    pub fn persistent_used(&self) -> u32 {
        self.persistent.used()
    }

    pub fn transient_used(&self, frame_slot: usize) -> u32 {
        self.frames[frame_slot].used()
    }
}
