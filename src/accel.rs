// Ray-tracing acceleration structures
//
// Two levels:
// - one bottom-level structure (BLAS) per unique model, built from its
//   vertex/index buffers
// - one top-level structure (TLAS) per frame slot, whose instance
//   descriptors place a BLAS in the world with a 3x4 transform
//
// BLAS are shared by every slot. Each slot owns its TLAS, instance buffer
// and update scratch, so refitting the TLAS of the frame being recorded
// never touches memory an in-flight frame still reads.
//
// Build order inside one command list:
//
//   BLAS(model 0) .. BLAS(model N)   no barriers between them
//   UAV barrier over all new BLAS
//   TLAS build
//   UAV barrier over the TLAS
//
// Superseded structures and scratch memory are kept in a retire queue until
// the fence says the GPU no longer reads them.

use crate::error::{RenderError, Result};
use crate::gpu::{
    AccelerationBuild, AccelerationBuildInputs, AccelerationDevice, AccelerationGeometry, AccelerationLevel,
    AccelerationObject, BufferDesc, BufferUsage, BuildFlags, BuildMode, BuildPreference, CommandRecorder,
    GpuAddress, HeapType, ResourceState,
};
use crate::resource::{create_buffer, write_buffer, Resource, RetireQueue};
use crate::scene::{Model, ModelId, SceneChanges};
use crate::sync::{FenceTimeline, FenceValue, FrameFence};
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec4};

// =============================================================================
// INSTANCE DESCRIPTORS
// =============================================================================

/// One TLAS instance, 64 bytes, bit-compatible with
/// `VkAccelerationStructureInstanceKHR`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct InstanceDesc {
    /// Row-major 3x4 object-to-world matrix
    pub transform: [f32; 12],
    /// Instance id in the low 24 bits, visibility mask in the high 8
    pub instance_id_and_mask: u32,
    /// Hit-group contribution in the low 24 bits, flags in the high 8
    pub contribution_and_flags: u32,
    pub acceleration_structure: GpuAddress,
}

/// Largest id the 24-bit instance id field holds.
pub const MAX_INSTANCE_ID: u32 = 0x00FF_FFFF;

/// Instance id for the object at `index` in draw order.
pub fn instance_id(index: usize) -> Result<u32> {
    u32::try_from(index)
        .ok()
        .filter(|&id| id <= MAX_INSTANCE_ID)
        .ok_or(RenderError::CountOverflow {
            what: "instance id",
            count: index,
            bits: 24,
        })
}

fn instance_count(instances: &[TopLevelInstance]) -> Result<u32> {
    u32::try_from(instances.len()).map_err(|_| RenderError::CountOverflow {
        what: "instance",
        count: instances.len(),
        bits: 32,
    })
}

impl InstanceDesc {
    pub fn new(transform: &Mat4, instance_id: u32, mask: u8, contribution: u32, flags: u8, blas: GpuAddress) -> Self {
        Self {
            transform: transform_3x4(transform),
            instance_id_and_mask: (instance_id & 0x00FF_FFFF) | (u32::from(mask) << 24),
            contribution_and_flags: (contribution & 0x00FF_FFFF) | (u32::from(flags) << 24),
            acceleration_structure: blas,
        }
    }

    pub fn instance_id(&self) -> u32 {
        self.instance_id_and_mask & 0x00FF_FFFF
    }

    pub fn mask(&self) -> u8 {
        (self.instance_id_and_mask >> 24) as u8
    }

    pub fn contribution(&self) -> u32 {
        self.contribution_and_flags & 0x00FF_FFFF
    }

    pub fn flags(&self) -> u8 {
        (self.contribution_and_flags >> 24) as u8
    }

    /// The stored rows with `(0, 0, 0, 1)` appended as the bottom row.
    pub fn transform(&self) -> Mat4 {
        let t = &self.transform;
        Mat4::from_cols(
            Vec4::new(t[0], t[4], t[8], 0.0),
            Vec4::new(t[1], t[5], t[9], 0.0),
            Vec4::new(t[2], t[6], t[10], 0.0),
            Vec4::new(t[3], t[7], t[11], 1.0),
        )
    }
}

/// Top three rows of `m`, row-major. The dropped row is `(0, 0, 0, 1)` for
/// any affine transform.
pub fn transform_3x4(m: &Mat4) -> [f32; 12] {
    let mut out = [0.0; 12];
    for row in 0..3 {
        let r = m.row(row);
        out[row * 4..row * 4 + 4].copy_from_slice(&r.to_array());
    }
    out
}

/// A scene object as seen by the top-level build.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TopLevelInstance {
    pub model: ModelId,
    pub transform: Mat4,
}

// =============================================================================
// BUILD STATE & POLICY
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    Empty,
    BottomBuilding,
    BottomBuilt,
    TopBuilding,
    TopBuilt,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccelerationOptions {
    pub preference: BuildPreference,
    /// Build the TLAS so transform-only changes can be refit in place
    pub allow_update: bool,
    pub instance_mask: u8,
}

impl Default for AccelerationOptions {
    fn default() -> Self {
        Self {
            preference: BuildPreference::FastTrace,
            allow_update: true,
            instance_mask: 0xFF,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccelerationUpdate {
    None,
    /// Rewrite instance transforms and update the TLAS in place
    Refit,
    /// Build stale BLAS and a new TLAS
    Rebuild,
}

/// Decide how much work a set of scene changes requires.
pub fn plan_update(changes: SceneChanges, has_top_level: bool, allow_update: bool) -> AccelerationUpdate {
    if !has_top_level || changes.geometry || changes.instances {
        return AccelerationUpdate::Rebuild;
    }
    if changes.transforms {
        return if allow_update {
            AccelerationUpdate::Refit
        } else {
            AccelerationUpdate::Rebuild
        };
    }
    AccelerationUpdate::None
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildStats {
    pub bottom_builds: usize,
    pub top_builds: usize,
    pub refits: usize,
}

// =============================================================================
// BUILDER
// =============================================================================

struct BottomLevel<C: AccelerationDevice> {
    generation: u32,
    structure: C::AccelerationStructure,
}

struct TopLevel<C: AccelerationDevice> {
    structure: C::AccelerationStructure,
    instances: Resource<C::Buffer>,
    /// Kept for in-place updates when the TLAS allows them
    scratch: Option<Resource<C::Buffer>>,
    instance_count: u32,
    updatable: bool,
    /// Fence value of the last submission that reads this TLAS
    last_use: FenceValue,
}

#[allow(dead_code)]
enum Retired<C: AccelerationDevice> {
    Structure(C::AccelerationStructure),
    Buffer(Resource<C::Buffer>),
}

pub struct AccelerationStructureBuilder<C: AccelerationDevice> {
    options: AccelerationOptions,
    state: BuildState,
    bottom: Vec<Option<BottomLevel<C>>>,
    /// One TLAS per frame slot, grown on first use
    top: Vec<Option<TopLevel<C>>>,
    current: usize,
    retired: RetireQueue<Retired<C>>,
    stats: BuildStats,
}

impl<C: AccelerationDevice> AccelerationStructureBuilder<C> {
    pub fn new(options: AccelerationOptions) -> Self {
        Self {
            options,
            state: BuildState::Empty,
            bottom: Vec::new(),
            top: Vec::new(),
            current: 0,
            retired: RetireQueue::new(),
            stats: BuildStats::default(),
        }
    }

    pub fn options(&self) -> &AccelerationOptions {
        &self.options
    }

    pub fn state(&self) -> BuildState {
        self.state
    }

    pub fn stats(&self) -> BuildStats {
        self.stats
    }

    /// Frame slot whose TLAS is bound for tracing.
    pub fn current_slot(&self) -> usize {
        self.current
    }

    fn top_for(&self, slot: usize) -> Option<&TopLevel<C>> {
        self.top.get(slot).and_then(Option::as_ref)
    }

    pub fn has_top_level(&self) -> bool {
        self.has_top_level_for(self.current)
    }

    pub fn has_top_level_for(&self, slot: usize) -> bool {
        self.top_for(slot).is_some()
    }

    pub fn top_level_address(&self) -> Option<GpuAddress> {
        self.top_level_address_for(self.current)
    }

    pub fn top_level_address_for(&self, slot: usize) -> Option<GpuAddress> {
        self.top_for(slot).map(|top| top.structure.gpu_address())
    }

    pub fn top_level_instance_count(&self) -> u32 {
        self.top_for(self.current).map_or(0, |top| top.instance_count)
    }

    /// Upload buffer holding the current instance descriptors.
    pub fn instance_buffer(&self) -> Option<&C::Buffer> {
        self.top_for(self.current).map(|top| top.instances.raw())
    }

    /// Make `slot`'s TLAS the one traced by the submission being recorded.
    pub fn use_slot<T: FenceTimeline>(&mut self, slot: usize, fence: &FrameFence<T>) {
        self.current = slot;
        if let Some(top) = self.top.get_mut(slot).and_then(Option::as_mut) {
            top.last_use = fence.next_value();
        }
    }

    pub fn bottom_level_address(&self, model: ModelId) -> Option<GpuAddress> {
        self.bottom
            .get(model.index())
            .and_then(Option::as_ref)
            .map(|blas| blas.structure.gpu_address())
    }

    pub fn bottom_level_count(&self) -> usize {
        self.bottom.iter().flatten().count()
    }

    pub fn pending_releases(&self) -> usize {
        self.retired.len()
    }

    pub fn collect_garbage(&mut self, completed: FenceValue) -> usize {
        self.retired.collect(completed)
    }

    fn flags(&self, level: AccelerationLevel) -> BuildFlags {
        BuildFlags {
            preference: self.options.preference,
            allow_update: level == AccelerationLevel::Top && self.options.allow_update,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // BOTTOM LEVEL
    // ─────────────────────────────────────────────────────────────────────────

    /// Record one BLAS build per model that has none, or whose geometry
    /// changed since its BLAS was built, followed by a single UAV barrier.
    /// Returns the number of structures built.
    pub fn build_bottom_acceleration<T: FenceTimeline>(
        &mut self,
        recorder: &C,
        fence: &FrameFence<T>,
        models: &[&Model<C::Buffer>],
    ) -> Result<usize>
    where
        C: CommandRecorder,
    {
        self.state = BuildState::BottomBuilding;

        let mut ordered: Vec<_> = models.to_vec();
        ordered.sort_by_key(|model| model.id());

        let mut built = Vec::new();
        for model in ordered {
            let index = model.id().index();
            let current = self.bottom.get(index).and_then(Option::as_ref);
            if current.is_some_and(|blas| blas.generation == model.generation()) {
                continue;
            }

            model.vertex_buffer().require(ResourceState::ShaderResource)?;
            model.index_buffer().require(ResourceState::ShaderResource)?;

            let inputs = AccelerationBuildInputs {
                geometry: AccelerationGeometry::Triangles(model.triangle_geometry()),
                flags: self.flags(AccelerationLevel::Bottom),
            };
            let name = format!("{} BLAS", model.name());
            let (structure, scratch) = self.create_structure(recorder, &name, &inputs, false)?;

            recorder.cmd_build_acceleration_structure(&AccelerationBuild {
                inputs,
                mode: BuildMode::Build,
                destination: &structure,
                source: None,
                scratch: scratch.raw(),
            })?;
            self.retired.retire(fence.next_value(), Retired::Buffer(scratch));

            if self.bottom.len() <= index {
                self.bottom.resize_with(index + 1, || None);
            }
            let previous = self.bottom[index].replace(BottomLevel {
                generation: model.generation(),
                structure,
            });
            // Other slots' TLAS may still point here until they rebuild.
            if let Some(old) = previous {
                self.retired.retire(fence.last_signaled(), Retired::Structure(old.structure));
            }
            built.push(index);
        }

        if !built.is_empty() {
            let structures: Vec<_> = built
                .iter()
                .filter_map(|&i| self.bottom[i].as_ref().map(|blas| &blas.structure))
                .collect();
            recorder.cmd_uav_barrier(&structures)?;
        }

        self.stats.bottom_builds += built.len();
        self.state = BuildState::BottomBuilt;
        log::debug!("Built {} bottom-level acceleration structures", built.len());
        Ok(built.len())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // TOP LEVEL
    // ─────────────────────────────────────────────────────────────────────────

    fn instance_descs(&self, instances: &[TopLevelInstance]) -> Result<Vec<InstanceDesc>> {
        instances
            .iter()
            .enumerate()
            .map(|(i, instance)| {
                let blas = self
                    .bottom_level_address(instance.model)
                    .ok_or(RenderError::MissingBottomLevel { model: instance.model.0 })?;
                Ok(InstanceDesc::new(
                    &instance.transform,
                    instance_id(i)?,
                    self.options.instance_mask,
                    0,
                    0,
                    blas,
                ))
            })
            .collect()
    }

    /// Record a fresh TLAS build over `instances` into `slot`.
    /// `total_instance_count` must match the number of instances given.
    pub fn build_top_acceleration<T: FenceTimeline>(
        &mut self,
        recorder: &C,
        fence: &FrameFence<T>,
        slot: usize,
        instances: &[TopLevelInstance],
        total_instance_count: u32,
    ) -> Result<()>
    where
        C: CommandRecorder,
    {
        let provided = instance_count(instances)?;
        if provided != total_instance_count {
            return Err(RenderError::InstanceCountMismatch {
                level: AccelerationLevel::Top,
                declared: total_instance_count,
                provided,
            });
        }
        self.state = BuildState::TopBuilding;

        let descs = self.instance_descs(instances)?;
        let desc_size = std::mem::size_of::<InstanceDesc>() as u64;
        let buffer_name = format!("TLAS instances (frame {slot})");
        let mut instance_buffer = create_buffer(
            recorder,
            &BufferDesc {
                name: &buffer_name,
                // An empty TLAS still needs a valid instance address.
                size: desc_size * u64::from(total_instance_count.max(1)),
                heap: HeapType::Upload,
                initial_state: ResourceState::GenericRead,
                usage: BufferUsage::BUILD_INPUT,
            },
        )?;
        write_buffer(recorder, &mut instance_buffer, 0, bytemuck::cast_slice(&descs))?;

        let inputs = AccelerationBuildInputs {
            geometry: AccelerationGeometry::Instances {
                instance_address: instance_buffer.gpu_address(),
                count: total_instance_count,
            },
            flags: self.flags(AccelerationLevel::Top),
        };
        let updatable = inputs.flags.allow_update;
        let name = format!("TLAS (frame {slot})");
        let (structure, scratch) = self.create_structure(recorder, &name, &inputs, updatable)?;

        recorder.cmd_build_acceleration_structure(&AccelerationBuild {
            inputs,
            mode: BuildMode::Build,
            destination: &structure,
            source: None,
            scratch: scratch.raw(),
        })?;
        recorder.cmd_uav_barrier(&[&structure])?;

        let scratch = if updatable {
            Some(scratch)
        } else {
            self.retired.retire(fence.next_value(), Retired::Buffer(scratch));
            None
        };

        if self.top.len() <= slot {
            self.top.resize_with(slot + 1, || None);
        }
        let previous = self.top[slot].replace(TopLevel {
            structure,
            instances: instance_buffer,
            scratch,
            instance_count: total_instance_count,
            updatable,
            last_use: fence.next_value(),
        });
        if let Some(old) = previous {
            let after = old.last_use;
            self.retired.retire(after, Retired::Structure(old.structure));
            self.retired.retire(after, Retired::Buffer(old.instances));
            if let Some(scratch) = old.scratch {
                self.retired.retire(after, Retired::Buffer(scratch));
            }
        }

        self.stats.top_builds += 1;
        self.state = BuildState::TopBuilt;
        log::debug!(
            "Built top-level acceleration structure for frame {} with {} instances",
            slot,
            total_instance_count
        );
        Ok(())
    }

    /// Update `slot`'s TLAS in place for new transforms. The instance set
    /// must be the one that TLAS was built with.
    pub fn refit<T: FenceTimeline>(
        &mut self,
        recorder: &C,
        fence: &FrameFence<T>,
        slot: usize,
        instances: &[TopLevelInstance],
    ) -> Result<()>
    where
        C: CommandRecorder,
    {
        let actual = instance_count(instances)?;
        let (expected, last_use) = match self.top_for(slot) {
            Some(top) if top.updatable && top.instance_count == actual => (actual, top.last_use),
            Some(top) => {
                return Err(RenderError::RefitTopologyMismatch {
                    expected: top.instance_count,
                    actual,
                })
            }
            None => return Err(RenderError::RefitTopologyMismatch { expected: 0, actual }),
        };
        let descs = self.instance_descs(instances)?;

        // Only this slot's last submission reads the buffers rewritten below.
        // A reader still in the open command list runs after the rewrite.
        if last_use <= fence.last_signaled() {
            fence.wait_for_fence_value(last_use)?;
        }
        self.state = BuildState::TopBuilding;

        let flags = self.flags(AccelerationLevel::Top);
        let Some(top) = self.top.get_mut(slot).and_then(Option::as_mut) else {
            return Err(RenderError::RefitTopologyMismatch { expected: 0, actual });
        };
        write_buffer(recorder, &mut top.instances, 0, bytemuck::cast_slice(&descs))?;
        let Some(scratch) = top.scratch.as_ref() else {
            return Err(RenderError::RefitTopologyMismatch { expected, actual });
        };

        recorder.cmd_build_acceleration_structure(&AccelerationBuild {
            inputs: AccelerationBuildInputs {
                geometry: AccelerationGeometry::Instances {
                    instance_address: top.instances.gpu_address(),
                    count: expected,
                },
                flags,
            },
            mode: BuildMode::Update,
            destination: &top.structure,
            source: Some(&top.structure),
            scratch: scratch.raw(),
        })?;
        recorder.cmd_uav_barrier(&[&top.structure])?;
        top.last_use = fence.next_value();

        self.stats.refits += 1;
        self.state = BuildState::Ready;
        Ok(())
    }

    /// Build whatever BLAS are missing or stale, then a new TLAS for `slot`.
    pub fn rebuild<T: FenceTimeline>(
        &mut self,
        recorder: &C,
        fence: &FrameFence<T>,
        slot: usize,
        models: &[&Model<C::Buffer>],
        instances: &[TopLevelInstance],
    ) -> Result<()>
    where
        C: CommandRecorder,
    {
        self.build_bottom_acceleration(recorder, fence, models)?;
        self.build_top_acceleration(recorder, fence, slot, instances, instance_count(instances)?)?;
        self.state = BuildState::Ready;
        Ok(())
    }

    /// Query sizes, then allocate the result buffer (wrapped as a structure)
    /// and a scratch buffer large enough for a build, or for an update too.
    fn create_structure(
        &self,
        device: &C,
        name: &str,
        inputs: &AccelerationBuildInputs,
        updatable: bool,
    ) -> Result<(C::AccelerationStructure, Resource<C::Buffer>)> {
        let sizes = device.acceleration_build_sizes(inputs)?;
        let level = inputs.geometry.level();

        let result = create_buffer(
            device,
            &BufferDesc {
                name,
                size: sizes.result_size,
                heap: HeapType::Default,
                initial_state: ResourceState::AccelerationStructure,
                usage: BufferUsage::UNORDERED_ACCESS | BufferUsage::ACCELERATION_STRUCTURE,
            },
        )?;

        let scratch_size = if updatable {
            sizes.scratch_size.max(sizes.update_scratch_size)
        } else {
            sizes.scratch_size
        };
        let scratch_name = format!("{name} scratch");
        let scratch = create_buffer(
            device,
            &BufferDesc {
                name: &scratch_name,
                size: scratch_size,
                heap: HeapType::Default,
                initial_state: ResourceState::UnorderedAccess,
                usage: BufferUsage::UNORDERED_ACCESS,
            },
        )?;

        let structure = device.create_acceleration_structure(level, result.into_raw())?;
        Ok((structure, scratch))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{Command, GpuProgress, MockContext, MockTimeline};
    use crate::scene::{MeshData, Motion, Placement, Scene};
    use glam::{Quat, Vec3};

    type TestScene = Scene<MockContext>;

    fn setup(options: AccelerationOptions) -> (MockContext, FrameFence<MockTimeline>, TestScene) {
        let ctx = MockContext::recording(3);
        let fence = FrameFence::new(MockTimeline::new(GpuProgress::CatchUpOnWait));
        (ctx, fence, Scene::new(options))
    }

    fn read_instances(scene: &TestScene) -> Vec<InstanceDesc> {
        let buffer = scene.acceleration().instance_buffer().unwrap();
        let count = scene.acceleration().top_level_instance_count() as usize;
        let desc_size = std::mem::size_of::<InstanceDesc>();
        buffer.contents()[..count * desc_size]
            .chunks_exact(desc_size)
            .map(bytemuck::pod_read_unaligned)
            .collect()
    }

    fn builds(ctx: &MockContext) -> Vec<Command> {
        ctx.commands()
            .into_iter()
            .filter(|c| matches!(c, Command::BuildAccelerationStructure { .. } | Command::UavBarrier { .. }))
            .collect()
    }

    #[test]
    fn instance_desc_layout_matches_vulkan() {
        assert_eq!(std::mem::size_of::<InstanceDesc>(), 64);
        assert_eq!(
            std::mem::size_of::<InstanceDesc>(),
            std::mem::size_of::<ash::vk::AccelerationStructureInstanceKHR>()
        );
        assert_eq!(std::mem::offset_of!(InstanceDesc, acceleration_structure), 56);
    }

    #[test]
    fn instance_desc_packs_id_mask_and_flags() {
        let desc = InstanceDesc::new(&Mat4::IDENTITY, 0x0012_3456, 0xFF, 3, 0x04, 0xDEAD_0000);
        assert_eq!(desc.instance_id(), 0x0012_3456);
        assert_eq!(desc.mask(), 0xFF);
        assert_eq!(desc.contribution(), 3);
        assert_eq!(desc.flags(), 0x04);
        assert_eq!(desc.acceleration_structure, 0xDEAD_0000);
    }

    #[test]
    fn transform_truncation_keeps_top_three_rows() {
        let m = Mat4::from_scale_rotation_translation(
            Vec3::new(2.0, 3.0, 4.0),
            Quat::from_rotation_y(0.7),
            Vec3::new(5.0, -6.0, 7.0),
        );
        let rows = transform_3x4(&m);

        for row in 0..3 {
            assert_eq!(&rows[row * 4..row * 4 + 4], &m.row(row).to_array());
        }
        let desc = InstanceDesc::new(&m, 0, 0xFF, 0, 0, 0);
        assert_eq!(desc.transform(), m);
    }

    #[test]
    fn one_blas_per_model_regardless_of_instance_count() {
        let (ctx, fence, mut scene) = setup(AccelerationOptions::default());
        let tri = scene.add_model(&ctx, &fence, "tri", &MeshData::triangle([1.0; 4])).unwrap();
        let cube = scene.add_model(&ctx, &fence, "cube", &MeshData::cube([1.0; 4])).unwrap();
        for i in 0..5 {
            scene.add_object(tri, Placement::at(Vec3::X * i as f32), Motion::Static).unwrap();
            scene.add_object(cube, Placement::at(Vec3::Y * i as f32), Motion::Static).unwrap();
        }

        scene.build_acceleration_structures(&ctx, &fence).unwrap();

        let accel = scene.acceleration();
        assert_eq!(accel.bottom_level_count(), 2);
        assert_eq!(accel.stats().bottom_builds, 2);
        assert_eq!(accel.top_level_instance_count(), 10);
        assert_eq!(accel.state(), BuildState::Ready);
    }

    #[test]
    fn build_order_is_blas_barrier_tlas_barrier() {
        let (ctx, fence, mut scene) = setup(AccelerationOptions::default());
        let tri = scene.add_model(&ctx, &fence, "tri", &MeshData::triangle([1.0; 4])).unwrap();
        let quad = scene.add_model(&ctx, &fence, "quad", &MeshData::quad([1.0; 4])).unwrap();
        scene.add_object(tri, Placement::default(), Motion::Static).unwrap();
        scene.add_object(quad, Placement::default(), Motion::Static).unwrap();
        ctx.clear_commands();

        scene.build_acceleration_structures(&ctx, &fence).unwrap();

        let tri_blas = scene.acceleration().bottom_level_address(tri).unwrap();
        let quad_blas = scene.acceleration().bottom_level_address(quad).unwrap();
        let tlas = scene.acceleration_structure_address().unwrap();
        let commands = builds(&ctx);
        assert_eq!(commands.len(), 5);
        assert!(matches!(
            commands[0],
            Command::BuildAccelerationStructure { level: AccelerationLevel::Bottom, destination, .. } if destination == tri_blas
        ));
        assert!(matches!(
            commands[1],
            Command::BuildAccelerationStructure { level: AccelerationLevel::Bottom, destination, .. } if destination == quad_blas
        ));
        match &commands[2] {
            Command::UavBarrier { structures } => assert_eq!(structures, &vec![tri_blas, quad_blas]),
            other => panic!("expected BLAS barrier, got {other:?}"),
        }
        assert!(matches!(
            commands[3],
            Command::BuildAccelerationStructure { level: AccelerationLevel::Top, destination, primitive_count: 2, .. }
                if destination == tlas
        ));
        match &commands[4] {
            Command::UavBarrier { structures } => assert_eq!(structures, &vec![tlas]),
            other => panic!("expected TLAS barrier, got {other:?}"),
        }
    }

    #[test]
    fn instance_descriptors_point_at_their_models_blas() {
        let (ctx, fence, mut scene) = setup(AccelerationOptions::default());
        let tri = scene.add_model(&ctx, &fence, "tri", &MeshData::triangle([1.0; 4])).unwrap();
        let quad = scene.add_model(&ctx, &fence, "quad", &MeshData::quad([1.0; 4])).unwrap();
        scene.add_object(quad, Placement::at(Vec3::new(1.0, 0.0, 0.0)), Motion::Static).unwrap();
        scene.add_object(tri, Placement::at(Vec3::new(0.0, 2.0, 0.0)), Motion::Static).unwrap();
        scene.add_object(tri, Placement::at(Vec3::new(0.0, 0.0, 3.0)), Motion::Static).unwrap();

        scene.build_acceleration_structures(&ctx, &fence).unwrap();

        let descs = read_instances(&scene);
        let expected = scene.top_level_instances();
        assert_eq!(descs.len(), expected.len());
        for (i, (desc, instance)) in descs.iter().zip(&expected).enumerate() {
            assert_eq!(desc.instance_id(), i as u32);
            assert_eq!(desc.mask(), 0xFF);
            assert_eq!(desc.contribution(), 0);
            assert_eq!(desc.flags(), 0);
            assert_eq!(
                desc.acceleration_structure,
                scene.acceleration().bottom_level_address(instance.model).unwrap()
            );
            assert_eq!(desc.transform(), instance.transform);
        }
    }

    #[test]
    fn declared_instance_count_must_match() {
        let (ctx, fence, mut scene) = setup(AccelerationOptions::default());
        let tri = scene.add_model(&ctx, &fence, "tri", &MeshData::triangle([1.0; 4])).unwrap();
        scene.add_object(tri, Placement::default(), Motion::Static).unwrap();
        let models: Vec<_> = scene.models().collect();
        let instances = scene.top_level_instances();

        let mut builder = AccelerationStructureBuilder::<MockContext>::new(AccelerationOptions::default());
        builder.build_bottom_acceleration(&ctx, &fence, &models).unwrap();
        let err = builder.build_top_acceleration(&ctx, &fence, 0, &instances, 2).unwrap_err();

        assert!(matches!(
            err,
            RenderError::InstanceCountMismatch { declared: 2, provided: 1, .. }
        ));
        assert!(!builder.has_top_level());
    }

    #[test]
    fn instance_without_blas_is_rejected() {
        let ctx = MockContext::recording(3);
        let fence = FrameFence::new(MockTimeline::new(GpuProgress::CatchUpOnWait));
        let mut builder = AccelerationStructureBuilder::<MockContext>::new(AccelerationOptions::default());
        let instances = [TopLevelInstance {
            model: ModelId(0),
            transform: Mat4::IDENTITY,
        }];

        let err = builder.build_top_acceleration(&ctx, &fence, 0, &instances, 1).unwrap_err();
        assert!(matches!(err, RenderError::MissingBottomLevel { model: 0 }));
    }

    #[test]
    fn empty_scene_builds_empty_tlas_without_blas_barrier() {
        let (ctx, fence, mut scene) = setup(AccelerationOptions::default());

        scene.build_acceleration_structures(&ctx, &fence).unwrap();

        let commands = builds(&ctx);
        assert_eq!(commands.len(), 2);
        assert!(matches!(
            commands[0],
            Command::BuildAccelerationStructure { level: AccelerationLevel::Top, primitive_count: 0, .. }
        ));
        assert!(scene.acceleration_structure_address().is_some());
        assert_eq!(scene.acceleration().top_level_instance_count(), 0);
    }

    #[test]
    fn unchanged_models_keep_their_blas_on_rebuild() {
        let (ctx, fence, mut scene) = setup(AccelerationOptions::default());
        let tri = scene.add_model(&ctx, &fence, "tri", &MeshData::triangle([1.0; 4])).unwrap();
        scene.add_object(tri, Placement::default(), Motion::Static).unwrap();
        scene.build_acceleration_structures(&ctx, &fence).unwrap();
        let blas = scene.acceleration().bottom_level_address(tri).unwrap();

        scene.add_object(tri, Placement::at(Vec3::X), Motion::Static).unwrap();
        let plan = scene.update_acceleration_structures(&ctx, &fence, 0).unwrap();

        assert_eq!(plan, AccelerationUpdate::Rebuild);
        assert_eq!(scene.acceleration().bottom_level_address(tri), Some(blas));
        assert_eq!(scene.acceleration().stats().bottom_builds, 1);
        assert_eq!(scene.acceleration().stats().top_builds, 2);
    }

    #[test]
    fn replaced_geometry_rebuilds_only_that_blas() {
        let (ctx, fence, mut scene) = setup(AccelerationOptions::default());
        let tri = scene.add_model(&ctx, &fence, "tri", &MeshData::triangle([1.0; 4])).unwrap();
        let quad = scene.add_model(&ctx, &fence, "quad", &MeshData::quad([1.0; 4])).unwrap();
        scene.add_object(tri, Placement::default(), Motion::Static).unwrap();
        scene.add_object(quad, Placement::default(), Motion::Static).unwrap();
        scene.build_acceleration_structures(&ctx, &fence).unwrap();
        let quad_blas = scene.acceleration().bottom_level_address(quad);

        scene.replace_model_geometry(&ctx, &fence, tri, &MeshData::cube([1.0; 4])).unwrap();
        scene.update_acceleration_structures(&ctx, &fence, 0).unwrap();

        assert_eq!(scene.acceleration().stats().bottom_builds, 3);
        assert_eq!(scene.acceleration().bottom_level_address(quad), quad_blas);
        assert!(scene.acceleration().pending_releases() > 0);
    }

    #[test]
    fn transform_only_change_refits_in_place() {
        let (ctx, mut fence, mut scene) = setup(AccelerationOptions::default());
        let tri = scene.add_model(&ctx, &fence, "tri", &MeshData::triangle([1.0; 4])).unwrap();
        let id = scene.add_object(tri, Placement::default(), Motion::Static).unwrap();
        scene.build_acceleration_structures(&ctx, &fence).unwrap();
        fence.signal_fence_from_gpu().unwrap();
        // Another slot's frame is still in flight.
        fence.signal_fence_from_gpu().unwrap();
        let tlas = scene.acceleration_structure_address();
        ctx.clear_commands();

        scene.set_placement(id, Placement::at(Vec3::new(0.0, 4.0, 0.0)));
        let plan = scene.update_acceleration_structures(&ctx, &fence, 0).unwrap();

        assert_eq!(plan, AccelerationUpdate::Refit);
        assert_eq!(scene.acceleration_structure_address(), tlas);
        assert_eq!(scene.acceleration().stats().refits, 1);
        // Waited for this slot's last use only.
        assert_eq!(fence.completed_value().unwrap(), 1);
        assert_eq!(fence.last_signaled(), 2);
        let commands = builds(&ctx);
        assert!(matches!(
            commands[0],
            Command::BuildAccelerationStructure { mode: BuildMode::Update, source: Some(src), destination, .. }
                if Some(src) == tlas && Some(destination) == tlas
        ));
        assert_eq!(read_instances(&scene)[0].transform(), Mat4::from_translation(Vec3::new(0.0, 4.0, 0.0)));
    }

    #[test]
    fn frame_slots_own_separate_top_levels() {
        let (ctx, fence, mut scene) = setup(AccelerationOptions::default());
        let tri = scene.add_model(&ctx, &fence, "tri", &MeshData::triangle([1.0; 4])).unwrap();
        let id = scene.add_object(tri, Placement::default(), Motion::Static).unwrap();
        scene.update_acceleration_structures(&ctx, &fence, 0).unwrap();
        scene.update_acceleration_structures(&ctx, &fence, 1).unwrap();

        let accel = scene.acceleration();
        let (first, second) = (accel.top_level_address_for(0), accel.top_level_address_for(1));
        assert!(first.is_some() && second.is_some());
        assert_ne!(first, second);
        assert!(!accel.has_top_level_for(2));
        assert_eq!(accel.stats().bottom_builds, 1);
        assert_eq!(accel.current_slot(), 1);
        assert_eq!(scene.acceleration_structure_address(), second);

        scene.set_placement(id, Placement::at(Vec3::Z));
        ctx.clear_commands();
        scene.update_acceleration_structures(&ctx, &fence, 0).unwrap();

        let commands = builds(&ctx);
        assert!(matches!(
            commands[0],
            Command::BuildAccelerationStructure { mode: BuildMode::Update, destination, .. }
                if Some(destination) == first
        ));
        assert_eq!(scene.acceleration().top_level_address_for(1), second);
        assert_eq!(scene.acceleration_structure_address(), first);
    }

    #[test]
    fn instance_ids_must_fit_in_24_bits() {
        assert_eq!(instance_id(0).unwrap(), 0);
        assert_eq!(instance_id(MAX_INSTANCE_ID as usize).unwrap(), MAX_INSTANCE_ID);
        assert!(matches!(
            instance_id(1 << 24),
            Err(RenderError::CountOverflow { bits: 24, count, .. }) if count == 1 << 24
        ));
    }

    #[test]
    fn transform_change_without_update_support_rebuilds() {
        let options = AccelerationOptions {
            allow_update: false,
            ..Default::default()
        };
        let (ctx, fence, mut scene) = setup(options);
        let tri = scene.add_model(&ctx, &fence, "tri", &MeshData::triangle([1.0; 4])).unwrap();
        let id = scene.add_object(tri, Placement::default(), Motion::Static).unwrap();
        scene.build_acceleration_structures(&ctx, &fence).unwrap();
        let tlas = scene.acceleration_structure_address();

        scene.set_placement(id, Placement::at(Vec3::Z));
        let plan = scene.update_acceleration_structures(&ctx, &fence, 0).unwrap();

        assert_eq!(plan, AccelerationUpdate::Rebuild);
        assert_ne!(scene.acceleration_structure_address(), tlas);
    }

    #[test]
    fn refit_with_different_instance_count_fails() {
        let (ctx, fence, mut scene) = setup(AccelerationOptions::default());
        let tri = scene.add_model(&ctx, &fence, "tri", &MeshData::triangle([1.0; 4])).unwrap();
        scene.add_object(tri, Placement::default(), Motion::Static).unwrap();
        let models: Vec<_> = scene.models().collect();
        let one = scene.top_level_instances();
        let two = vec![one[0], one[0]];
        let mut builder = AccelerationStructureBuilder::<MockContext>::new(AccelerationOptions::default());
        builder.rebuild(&ctx, &fence, 0, &models, &one).unwrap();

        let err = builder.refit(&ctx, &fence, 0, &two).unwrap_err();
        assert!(matches!(err, RenderError::RefitTopologyMismatch { expected: 1, actual: 2 }));
    }

    #[test]
    fn superseded_tlas_is_released_once_frames_complete() {
        let (ctx, mut fence, mut scene) = setup(AccelerationOptions::default());
        let tri = scene.add_model(&ctx, &fence, "tri", &MeshData::triangle([1.0; 4])).unwrap();
        scene.add_object(tri, Placement::default(), Motion::Static).unwrap();
        scene.build_acceleration_structures(&ctx, &fence).unwrap();
        fence.flush().unwrap();
        scene.collect_garbage(fence.completed_value().unwrap());

        scene.add_object(tri, Placement::default(), Motion::Static).unwrap();
        scene.update_acceleration_structures(&ctx, &fence, 0).unwrap();
        assert!(scene.acceleration().pending_releases() > 0);

        fence.flush().unwrap();
        scene.collect_garbage(fence.completed_value().unwrap());
        assert_eq!(scene.acceleration().pending_releases(), 0);
    }

    #[test]
    fn update_policy_table() {
        let none = SceneChanges::default();
        let transforms = SceneChanges {
            transforms: true,
            ..none
        };
        let instances = SceneChanges {
            instances: true,
            ..none
        };
        let geometry = SceneChanges {
            geometry: true,
            ..none
        };

        assert_eq!(plan_update(none, false, true), AccelerationUpdate::Rebuild);
        assert_eq!(plan_update(none, true, true), AccelerationUpdate::None);
        assert_eq!(plan_update(transforms, true, true), AccelerationUpdate::Refit);
        assert_eq!(plan_update(transforms, true, false), AccelerationUpdate::Rebuild);
        assert_eq!(plan_update(instances, true, true), AccelerationUpdate::Rebuild);
        assert_eq!(plan_update(geometry, true, true), AccelerationUpdate::Rebuild);
    }
}
