// Scene - models and their instances
//
// Models are registered once under a name and receive a small integer id.
// The id indexes a slot holding both the GPU mesh and the list of objects
// drawn with it, so per-frame iteration never touches the name map.
//
// The scene also owns the acceleration-structure builder for its contents.
// Every kind of change (geometry, instance set, transforms) bumps its own
// counter; each frame slot remembers the counters its TLAS was built or
// refit at, so a slot catches up on exactly what it missed.

use crate::accel::{plan_update, AccelerationOptions, AccelerationStructureBuilder, AccelerationUpdate, TopLevelInstance};
use crate::error::{RenderError, Result};
use crate::gpu::{AccelerationDevice, BufferDesc, BufferUsage, CommandRecorder, GpuAddress, HeapType, ResourceState, TriangleGeometry};
use crate::resource::{create_placed_pair, upload_to_default, Resource, RetireQueue};
use crate::sync::{FenceTimeline, FenceValue, FrameFence};
use bytemuck::{Pod, Zeroable};
use glam::{EulerRot, Mat4, Quat, Vec3};
use std::collections::HashMap;

// =============================================================================
// MESH DATA
// =============================================================================

/// Interleaved vertex. Position must stay first: acceleration-structure
/// builds read it as three floats at offset 0.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub color: [f32; 4],
    pub normal: [f32; 3],
}

impl Vertex {
    pub const STRIDE: u64 = std::mem::size_of::<Vertex>() as u64;

    pub fn new(position: [f32; 3], color: [f32; 4], normal: [f32; 3]) -> Self {
        Self { position, color, normal }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MeshData {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

fn count_u32(what: &'static str, count: usize) -> Result<u32> {
    u32::try_from(count).map_err(|_| RenderError::CountOverflow { what, count, bits: 32 })
}

impl MeshData {
    /// Single triangle facing +Z.
    pub fn triangle(color: [f32; 4]) -> Self {
        let n = [0.0, 0.0, 1.0];
        Self {
            vertices: vec![
                Vertex::new([0.0, 0.5, 0.0], color, n),
                Vertex::new([-0.5, -0.5, 0.0], color, n),
                Vertex::new([0.5, -0.5, 0.0], color, n),
            ],
            indices: vec![0, 1, 2],
        }
    }

    /// Unit quad facing +Z.
    pub fn quad(color: [f32; 4]) -> Self {
        let n = [0.0, 0.0, 1.0];
        Self {
            vertices: vec![
                Vertex::new([-0.5, 0.5, 0.0], color, n),
                Vertex::new([-0.5, -0.5, 0.0], color, n),
                Vertex::new([0.5, -0.5, 0.0], color, n),
                Vertex::new([0.5, 0.5, 0.0], color, n),
            ],
            indices: vec![0, 1, 2, 0, 2, 3],
        }
    }

    /// Unit cube with per-face normals.
    pub fn cube(color: [f32; 4]) -> Self {
        const FACES: [([f32; 3], [f32; 3], [f32; 3]); 6] = [
            // normal, u axis, v axis
            ([0.0, 0.0, 1.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
            ([0.0, 0.0, -1.0], [-1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
            ([1.0, 0.0, 0.0], [0.0, 0.0, -1.0], [0.0, 1.0, 0.0]),
            ([-1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0, 0.0]),
            ([0.0, 1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, -1.0]),
            ([0.0, -1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0]),
        ];

        let mut mesh = Self::default();
        for (normal, u, v) in FACES {
            let (n, u, v) = (Vec3::from(normal), Vec3::from(u), Vec3::from(v));
            let base = mesh.vertices.len() as u32;
            for (su, sv) in [(-0.5, 0.5), (-0.5, -0.5), (0.5, -0.5), (0.5, 0.5)] {
                let p = n * 0.5 + u * su + v * sv;
                mesh.vertices.push(Vertex::new(p.into(), color, normal));
            }
            mesh.indices.extend([base, base + 1, base + 2, base, base + 2, base + 3]);
        }
        mesh
    }

    pub fn validate(&self, name: &str) -> Result<()> {
        let invalid = |reason| RenderError::InvalidMesh {
            name: name.to_string(),
            reason,
        };
        if self.vertices.is_empty() {
            return Err(invalid("no vertices"));
        }
        if self.indices.is_empty() || self.indices.len() % 3 != 0 {
            return Err(invalid("index count must be a non-zero multiple of 3"));
        }
        if self.indices.iter().any(|&i| i as usize >= self.vertices.len()) {
            return Err(invalid("index out of range"));
        }
        Ok(())
    }
}

// =============================================================================
// MODELS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelId(pub u32);

impl ModelId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Mesh uploaded to the GPU. Vertex and index buffers share one allocation.
pub struct Model<B> {
    id: ModelId,
    name: String,
    vertex_buffer: Resource<B>,
    index_buffer: Resource<B>,
    vertex_count: u32,
    index_count: u32,
    generation: u32,
}

impl<B: crate::gpu::GpuBuffer> Model<B> {
    /// Record the upload of `mesh`. The returned staging buffers must outlive
    /// the recorded copies.
    pub fn upload<C>(recorder: &C, id: ModelId, name: &str, mesh: &MeshData) -> Result<(Self, [Resource<B>; 2])>
    where
        C: CommandRecorder<Buffer = B>,
    {
        mesh.validate(name)?;
        let vertex_bytes: &[u8] = bytemuck::cast_slice(&mesh.vertices);
        let index_bytes: &[u8] = bytemuck::cast_slice(&mesh.indices);

        let vb_name = format!("{name} vertices");
        let ib_name = format!("{name} indices");
        let (mut vertex_buffer, mut index_buffer) = create_placed_pair(
            recorder,
            &BufferDesc {
                name: &vb_name,
                size: vertex_bytes.len() as u64,
                heap: HeapType::Default,
                initial_state: ResourceState::CopyDest,
                usage: BufferUsage::VERTEX,
            },
            &BufferDesc {
                name: &ib_name,
                size: index_bytes.len() as u64,
                heap: HeapType::Default,
                initial_state: ResourceState::CopyDest,
                usage: BufferUsage::INDEX,
            },
        )?;

        let vb_staging = upload_to_default(recorder, &mut vertex_buffer, vertex_bytes, ResourceState::ShaderResource)?;
        let ib_staging = upload_to_default(recorder, &mut index_buffer, index_bytes, ResourceState::ShaderResource)?;

        log::info!(
            "Uploaded model `{}` ({} vertices, {} indices)",
            name,
            mesh.vertices.len(),
            mesh.indices.len()
        );

        Ok((
            Self {
                id,
                name: name.to_string(),
                vertex_buffer,
                index_buffer,
                vertex_count: count_u32("vertex", mesh.vertices.len())?,
                index_count: count_u32("index", mesh.indices.len())?,
                generation: 0,
            },
            [vb_staging, ib_staging],
        ))
    }

    pub fn id(&self) -> ModelId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn vertex_buffer(&self) -> &Resource<B> {
        &self.vertex_buffer
    }

    pub fn index_buffer(&self) -> &Resource<B> {
        &self.index_buffer
    }

    pub fn vertex_count(&self) -> u32 {
        self.vertex_count
    }

    pub fn index_count(&self) -> u32 {
        self.index_count
    }

    pub fn vertex_stride(&self) -> u64 {
        Vertex::STRIDE
    }

    /// Bumped whenever the GPU buffers are replaced.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn triangle_geometry(&self) -> TriangleGeometry {
        TriangleGeometry {
            vertex_address: self.vertex_buffer.gpu_address(),
            vertex_count: self.vertex_count,
            vertex_stride: Vertex::STRIDE,
            index_address: self.index_buffer.gpu_address(),
            index_count: self.index_count,
        }
    }
}

// =============================================================================
// OBJECTS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectId(pub u64);

/// Position, rotation (pitch/yaw/roll in radians) and per-axis scale.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Placement {
    pub position: Vec3,
    pub rotation: Vec3,
    pub scale: Vec3,
}

impl Default for Placement {
    fn default() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Vec3::ZERO,
            scale: Vec3::ONE,
        }
    }
}

impl Placement {
    pub fn at(position: Vec3) -> Self {
        Self {
            position,
            ..Default::default()
        }
    }

    /// Scale, then rotate, then translate.
    pub fn to_matrix(&self) -> Mat4 {
        let rotation = Quat::from_euler(EulerRot::YXZ, self.rotation.y, self.rotation.x, self.rotation.z);
        Mat4::from_scale_rotation_translation(self.scale, rotation, self.position)
    }
}

/// Per-frame animation applied on top of an object's base placement.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Motion {
    #[default]
    Static,
    /// Rotate around Y
    Spin { radians_per_second: f32 },
    /// Oscillate along X
    MoveBackAndForth { distance: f32, speed: f32 },
    /// Oscillate uniform scale
    Resize { amount: f32, speed: f32 },
}

/// Neutral tint: vertex colors pass through unchanged.
pub const WHITE: [f32; 4] = [1.0; 4];

#[derive(Debug, Clone)]
pub struct VertexObject {
    id: ObjectId,
    model: ModelId,
    base: Placement,
    motion: Motion,
    elapsed: f32,
    transform: Mat4,
    tint: [f32; 4],
}

impl VertexObject {
    fn new(id: ObjectId, model: ModelId, base: Placement, motion: Motion) -> Self {
        Self {
            id,
            model,
            base,
            motion,
            elapsed: 0.0,
            transform: base.to_matrix(),
            tint: WHITE,
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn model(&self) -> ModelId {
        self.model
    }

    pub fn motion(&self) -> Motion {
        self.motion
    }

    pub fn placement(&self) -> Placement {
        self.base
    }

    pub fn transform(&self) -> Mat4 {
        self.transform
    }

    /// Color multiplied into every vertex color of this object.
    pub fn tint(&self) -> [f32; 4] {
        self.tint
    }

    /// Advance the animation. Returns false for static objects.
    pub fn update(&mut self, dt: f32) -> bool {
        if self.motion == Motion::Static {
            return false;
        }
        self.elapsed += dt;
        let t = self.elapsed;
        let mut placement = self.base;
        match self.motion {
            Motion::Static => {}
            Motion::Spin { radians_per_second } => {
                placement.rotation.y += radians_per_second * t;
            }
            Motion::MoveBackAndForth { distance, speed } => {
                placement.position.x += distance * (t * speed).sin();
            }
            Motion::Resize { amount, speed } => {
                placement.scale *= 1.0 + amount * (t * speed).sin();
            }
        }
        self.transform = placement.to_matrix();
        true
    }
}

// =============================================================================
// SCENE
// =============================================================================

/// Change counters, one per kind of change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SceneVersion {
    pub geometry: u64,
    pub instances: u64,
    pub transforms: u64,
}

/// What changed since acceleration structures were last updated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SceneChanges {
    pub geometry: bool,
    pub instances: bool,
    pub transforms: bool,
}

impl SceneChanges {
    pub fn between(built: SceneVersion, current: SceneVersion) -> Self {
        Self {
            geometry: built.geometry != current.geometry,
            instances: built.instances != current.instances,
            transforms: built.transforms != current.transforms,
        }
    }

    pub fn any(&self) -> bool {
        self.geometry || self.instances || self.transforms
    }
}

struct ModelSlot<B> {
    model: Model<B>,
    objects: Vec<VertexObject>,
}

pub struct Scene<C: AccelerationDevice> {
    slots: Vec<ModelSlot<C::Buffer>>,
    names: HashMap<String, ModelId>,
    next_object: u64,
    version: SceneVersion,
    /// Version each frame slot's TLAS reflects
    built: Vec<Option<SceneVersion>>,
    acceleration: AccelerationStructureBuilder<C>,
    staging: RetireQueue<Resource<C::Buffer>>,
}

impl<C: AccelerationDevice> Scene<C> {
    pub fn new(options: AccelerationOptions) -> Self {
        Self {
            slots: Vec::new(),
            names: HashMap::new(),
            next_object: 0,
            version: SceneVersion::default(),
            built: Vec::new(),
            acceleration: AccelerationStructureBuilder::new(options),
            staging: RetireQueue::new(),
        }
    }

    /// Upload `mesh` under `name`, or return the id already registered for
    /// that name. Records copies into the open command list.
    pub fn add_model<T: FenceTimeline>(
        &mut self,
        recorder: &C,
        fence: &FrameFence<T>,
        name: &str,
        mesh: &MeshData,
    ) -> Result<ModelId>
    where
        C: CommandRecorder,
    {
        if let Some(&id) = self.names.get(name) {
            return Ok(id);
        }
        let id = ModelId(count_u32("model", self.slots.len())?);
        let (model, staging) = Model::upload(recorder, id, name, mesh)?;
        for buffer in staging {
            self.staging.retire(fence.next_value(), buffer);
        }
        self.slots.push(ModelSlot {
            model,
            objects: Vec::new(),
        });
        self.names.insert(name.to_string(), id);
        self.version.geometry += 1;
        Ok(id)
    }

    /// Replace a model's geometry. Its bottom-level structure is rebuilt on
    /// the next acceleration update.
    pub fn replace_model_geometry<T: FenceTimeline>(
        &mut self,
        recorder: &C,
        fence: &FrameFence<T>,
        id: ModelId,
        mesh: &MeshData,
    ) -> Result<()>
    where
        C: CommandRecorder,
    {
        let slot = self.slots.get_mut(id.index()).ok_or(RenderError::UnknownModel(id.0))?;
        let (mut model, staging) = Model::upload(recorder, id, &slot.model.name, mesh)?;
        model.generation = slot.model.generation + 1;
        let old = std::mem::replace(&mut slot.model, model);

        // Frames already in flight may still draw or trace the old buffers.
        self.staging.retire(fence.last_signaled(), old.vertex_buffer);
        self.staging.retire(fence.last_signaled(), old.index_buffer);
        for buffer in staging {
            self.staging.retire(fence.next_value(), buffer);
        }
        self.version.geometry += 1;
        Ok(())
    }

    pub fn model_id(&self, name: &str) -> Option<ModelId> {
        self.names.get(name).copied()
    }

    pub fn model(&self, id: ModelId) -> Option<&Model<C::Buffer>> {
        self.slots.get(id.index()).map(|slot| &slot.model)
    }

    pub fn models(&self) -> impl Iterator<Item = &Model<C::Buffer>> {
        self.slots.iter().map(|slot| &slot.model)
    }

    pub fn model_count(&self) -> usize {
        self.slots.len()
    }

    pub fn add_object(&mut self, model: ModelId, placement: Placement, motion: Motion) -> Result<ObjectId> {
        let slot = self.slots.get_mut(model.index()).ok_or(RenderError::UnknownModel(model.0))?;
        let id = ObjectId(self.next_object);
        self.next_object += 1;
        slot.objects.push(VertexObject::new(id, model, placement, motion));
        self.version.instances += 1;
        Ok(id)
    }

    pub fn remove_object(&mut self, id: ObjectId) -> bool {
        for slot in &mut self.slots {
            if let Some(pos) = slot.objects.iter().position(|o| o.id == id) {
                slot.objects.remove(pos);
                self.version.instances += 1;
                return true;
            }
        }
        false
    }

    pub fn object(&self, id: ObjectId) -> Option<&VertexObject> {
        self.slots.iter().flat_map(|slot| &slot.objects).find(|o| o.id == id)
    }

    fn object_mut(&mut self, id: ObjectId) -> Option<&mut VertexObject> {
        self.slots.iter_mut().flat_map(|slot| &mut slot.objects).find(|o| o.id == id)
    }

    pub fn set_placement(&mut self, id: ObjectId, placement: Placement) -> bool {
        match self.object_mut(id) {
            Some(object) => {
                object.base = placement;
                object.elapsed = 0.0;
                object.transform = placement.to_matrix();
                self.version.transforms += 1;
                true
            }
            None => false,
        }
    }

    /// Set the color multiplied into the object's vertex colors. Shading
    /// only, acceleration structures are unaffected.
    pub fn set_tint(&mut self, id: ObjectId, tint: [f32; 4]) -> bool {
        match self.object_mut(id) {
            Some(object) => {
                object.tint = tint;
                true
            }
            None => false,
        }
    }

    /// Objects in draw order: ascending model id, then insertion order.
    pub fn objects(&self) -> impl Iterator<Item = (&Model<C::Buffer>, &VertexObject)> {
        self.slots
            .iter()
            .flat_map(|slot| slot.objects.iter().map(move |object| (&slot.model, object)))
    }

    pub fn objects_of(&self, model: ModelId) -> &[VertexObject] {
        self.slots.get(model.index()).map(|slot| slot.objects.as_slice()).unwrap_or(&[])
    }

    pub fn object_count(&self) -> usize {
        self.slots.iter().map(|slot| slot.objects.len()).sum()
    }

    /// Advance every animated object by `dt` seconds.
    pub fn update(&mut self, dt: f32) {
        let mut moved = false;
        for object in self.slots.iter_mut().flat_map(|slot| &mut slot.objects) {
            moved |= object.update(dt);
        }
        if moved {
            self.version.transforms += 1;
        }
    }

    pub fn version(&self) -> SceneVersion {
        self.version
    }

    /// Changes the acceleration structures of the bound frame slot miss.
    pub fn changes(&self) -> SceneChanges {
        self.changes_for(self.acceleration.current_slot())
    }

    /// Changes the TLAS of `slot` misses.
    pub fn changes_for(&self, slot: usize) -> SceneChanges {
        let built = self.built.get(slot).copied().flatten().unwrap_or_default();
        SceneChanges::between(built, self.version)
    }

    /// One top-level instance per object, in draw order.
    pub fn top_level_instances(&self) -> Vec<TopLevelInstance> {
        self.objects()
            .map(|(_, object)| TopLevelInstance {
                model: object.model,
                transform: object.transform,
            })
            .collect()
    }

    // =========================================================================
    // ACCELERATION STRUCTURES
    // =========================================================================

    /// Build bottom-level structures for every model and the top-level
    /// structure over every object, for the bound frame slot.
    pub fn build_acceleration_structures<T: FenceTimeline>(&mut self, recorder: &C, fence: &FrameFence<T>) -> Result<()>
    where
        C: CommandRecorder,
    {
        let slot = self.acceleration.current_slot();
        let instances = self.top_level_instances();
        let models: Vec<_> = self.slots.iter().map(|entry| &entry.model).collect();
        self.acceleration.rebuild(recorder, fence, slot, &models, &instances)?;
        self.mark_built(slot, fence);
        Ok(())
    }

    /// Bring `slot`'s acceleration structures up to date with whatever
    /// changed since that slot last traced the scene, then bind them.
    pub fn update_acceleration_structures<T: FenceTimeline>(
        &mut self,
        recorder: &C,
        fence: &FrameFence<T>,
        slot: usize,
    ) -> Result<AccelerationUpdate>
    where
        C: CommandRecorder,
    {
        let plan = plan_update(
            self.changes_for(slot),
            self.acceleration.has_top_level_for(slot),
            self.acceleration.options().allow_update,
        );
        match plan {
            AccelerationUpdate::None => {}
            AccelerationUpdate::Refit => {
                let instances = self.top_level_instances();
                self.acceleration.refit(recorder, fence, slot, &instances)?;
            }
            AccelerationUpdate::Rebuild => {
                let instances = self.top_level_instances();
                let models: Vec<_> = self.slots.iter().map(|entry| &entry.model).collect();
                self.acceleration.rebuild(recorder, fence, slot, &models, &instances)?;
            }
        }
        if plan != AccelerationUpdate::None {
            log::debug!(
                "Acceleration update for frame {}: {:?} ({} instances)",
                slot,
                plan,
                self.object_count()
            );
        }
        self.mark_built(slot, fence);
        Ok(plan)
    }

    fn mark_built<T: FenceTimeline>(&mut self, slot: usize, fence: &FrameFence<T>) {
        self.acceleration.use_slot(slot, fence);
        if self.built.len() <= slot {
            self.built.resize(slot + 1, None);
        }
        self.built[slot] = Some(self.version);
    }

    /// GPU address of the top-level structure, once built.
    pub fn acceleration_structure_address(&self) -> Option<GpuAddress> {
        self.acceleration.top_level_address()
    }

    pub fn acceleration(&self) -> &AccelerationStructureBuilder<C> {
        &self.acceleration
    }

    /// Release staging and superseded GPU objects the GPU is done with.
    pub fn collect_garbage(&mut self, completed: FenceValue) -> usize {
        self.staging.collect(completed) + self.acceleration.collect_garbage(completed)
    }
}
