//! Descriptor-set-layout & pipeline-layout cache.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::RwLock;

use ash::vk;
use fxhash::FxHasher64;
use log::warn;

use crate::error::{GraphError, Result};
use crate::shader::StageBinding;

/// {set, binding, type, count, dynamic-offset-index, stage-bits, range}
/// packed for fast sorted comparison and hashing. Bit widths: set:8, binding:16, type:8, count:16,
/// dynamic_offset_index:8, stage_bits:8 (the low 8 bits of
/// `vk::ShaderStageFlags`, which covers every stage this crate emits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PackedBindingKey(u64);

impl PackedBindingKey {
    pub fn pack(set: u32, binding: u32, descriptor_type: vk::DescriptorType, count: u32, dynamic_offset_index: u8, stage_bits: u8) -> PackedBindingKey {
        let set = (set & 0xff) as u64;
        let binding = (binding & 0xffff) as u64;
        let ty = (descriptor_type.as_raw() as u64) & 0xff;
        let count = (count & 0xffff) as u64;
        let dyn_idx = dynamic_offset_index as u64;
        let stage = stage_bits as u64;
        PackedBindingKey(set | (binding << 8) | (ty << 24) | (count << 32) | (dyn_idx << 48) | (stage << 56))
    }
}

/// Merged descriptor binding, the unit both the descriptor-set-layout and
/// the per-draw argument-state array are built from.
#[derive(Debug, Clone)]
pub struct MergedBinding {
    pub set: u32,
    pub binding: u32,
    pub array_count: u32,
    pub descriptor_type: vk::DescriptorType,
    pub stage_flags: vk::ShaderStageFlags,
    pub name_hash: u64,
    pub buffer_range: u64,
    pub dynamic_offset_index: u32,
    pub key: PackedBindingKey,
}

pub type DescriptorSetLayoutHash = u64;
pub type PipelineLayoutHash = u64;

/// Every materialized pipeline layout reserves this many push-constant bytes
/// across all stages; 128 is the minimum `maxPushConstantsSize` Vulkan
/// guarantees on every implementation,
/// so a pass never needs to query device limits before pushing constants.
pub const MAX_PUSH_CONSTANT_BYTES: u32 = 128;

/// Flat argument-state slot. One slot per array element of every binding in a bound pipeline's
/// layout; a descriptor-update-template reads a contiguous run of these
/// directly as its source data, so field order must not change without
/// updating the template's per-entry byte offsets in
/// [`DescriptorLayoutCache::produce_update_template_entries`].
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct DescriptorData {
    pub image: vk::DescriptorImageInfo,
    pub buffer: vk::DescriptorBufferInfo,
    pub descriptor_type: vk::DescriptorType,
    pub binding: u32,
    pub array_index: u32,
    pub filled: bool,
}

impl Default for DescriptorData {
    fn default() -> DescriptorData {
        DescriptorData {
            image: vk::DescriptorImageInfo::default(),
            buffer: vk::DescriptorBufferInfo::default(),
            descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
            binding: 0,
            array_index: 0,
            filled: false,
        }
    }
}

pub struct DescriptorSetLayoutEntry {
    pub hash: DescriptorSetLayoutHash,
    pub bindings: Vec<MergedBinding>,
    /// Lazily materialized: `produce_descriptor_set_layout` only computes
    /// the hash and stores the binding list, so the cache stays
    /// constructible in unit tests without a live `ash::Device`.
    /// [`DescriptorLayoutCache::materialize_set_layout`] fills this in.
    pub layout: Option<vk::DescriptorSetLayout>,
    pub update_template: Option<vk::DescriptorUpdateTemplate>,
}

pub struct PipelineLayoutEntry {
    pub hash: PipelineLayoutHash,
    pub set_layout_hashes: Vec<DescriptorSetLayoutHash>,
    pub layout: Option<vk::PipelineLayout>,
}

struct Inner {
    set_layouts: HashMap<DescriptorSetLayoutHash, DescriptorSetLayoutEntry>,
    pipeline_layouts: HashMap<PipelineLayoutHash, PipelineLayoutEntry>,
}

/// Process-wide cache, retained until renderer teardown. Guarded by a
/// single lock since layout production only
/// happens off the hot decode path.
pub struct DescriptorLayoutCache {
    inner: RwLock<Inner>,
}

impl DescriptorLayoutCache {
    pub fn new() -> DescriptorLayoutCache {
        DescriptorLayoutCache {
            inner: RwLock::new(Inner {
                set_layouts: HashMap::new(),
                pipeline_layouts: HashMap::new(),
            }),
        }
    }

    /// Merges per-stage binding lists sharing (set,binding): count/range/type
    /// must agree, stage bits OR, and the earliest stage's name wins with a
    /// warning on mismatch.
    pub fn merge_stage_bindings(all_stage_bindings: &[&[StageBinding]]) -> Result<Vec<MergedBinding>> {
        let mut merged: HashMap<(u32, u32), MergedBinding> = HashMap::new();
        let mut dynamic_offset_counter = 0u32;

        for stage_bindings in all_stage_bindings {
            for b in stage_bindings.iter() {
                let key = (b.set, b.binding);
                if let Some(existing) = merged.get_mut(&key) {
                    if existing.descriptor_type != b.descriptor_type || existing.array_count != b.array_count {
                        return Err(GraphError::BindingConflict {
                            set: b.set,
                            binding: b.binding,
                            message: format!(
                                "mismatched type/count across stages: {:?}/{} vs {:?}/{}",
                                existing.descriptor_type, existing.array_count, b.descriptor_type, b.array_count
                            ),
                        });
                    }
                    existing.stage_flags |= b.stage;
                    if existing.name_hash != b.name_hash {
                        warn!(
                            "binding (set={}, binding={}) has different argument names across stages; keeping the earlier stage's name",
                            b.set, b.binding
                        );
                    }
                } else {
                    let is_dynamic = matches!(
                        b.descriptor_type,
                        vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC | vk::DescriptorType::STORAGE_BUFFER_DYNAMIC
                    );
                    let dynamic_offset_index = if is_dynamic {
                        let idx = dynamic_offset_counter;
                        dynamic_offset_counter += 1;
                        idx
                    } else {
                        0
                    };
                    let key_packed = PackedBindingKey::pack(
                        b.set,
                        b.binding,
                        b.descriptor_type,
                        b.array_count,
                        dynamic_offset_index as u8,
                        (b.stage.as_raw() & 0xff) as u8,
                    );
                    merged.insert(
                        key,
                        MergedBinding {
                            set: b.set,
                            binding: b.binding,
                            array_count: b.array_count,
                            descriptor_type: b.descriptor_type,
                            stage_flags: b.stage,
                            name_hash: b.name_hash,
                            buffer_range: 0,
                            dynamic_offset_index,
                            key: key_packed,
                        },
                    );
                }
            }
        }

        let mut bindings: Vec<MergedBinding> = merged.into_iter().map(|(_, v)| v).collect();
        bindings.sort_by_key(|b| (b.set, b.binding));
        Ok(bindings)
    }

    /// Hashes one set's bindings and interns the binding list by hash.
    /// Building the actual `vk::DescriptorSetLayout`/update-template pair
    /// is a separate, device-requiring step ([`materialize_set_layout`]) so
    /// this method stays usable without a live device.
    pub fn produce_descriptor_set_layout(&self, bindings: Vec<MergedBinding>) -> DescriptorSetLayoutHash {
        let mut hasher = FxHasher64::default();
        for b in &bindings {
            b.key.0.hash(&mut hasher);
        }
        let hash = hasher.finish();

        let mut inner = self.inner.write().expect("descriptor cache lock poisoned");
        inner
            .set_layouts
            .entry(hash)
            .or_insert_with(|| DescriptorSetLayoutEntry { hash, bindings, layout: None, update_template: None });
        hash
    }

    /// Builds the API `vk::DescriptorSetLayout` and its matching update
    /// template for an already-interned set, if not already built. Template
    /// entries are laid out so that a flat `&[DescriptorData]` slice — one
    /// slot per array element across every binding, in sorted (set,binding)
    /// order — can be the template's source data directly: image-like
    /// descriptors read `DescriptorData::image`, buffer-like descriptors
    /// read `DescriptorData::buffer`.
    pub fn materialize_set_layout(&self, device: &ash::Device, hash: DescriptorSetLayoutHash) -> Result<()> {
        {
            let inner = self.inner.read().expect("descriptor cache lock poisoned");
            match inner.set_layouts.get(&hash) {
                Some(entry) if entry.layout.is_some() => return Ok(()),
                Some(_) => {}
                None => return Err(GraphError::Unsupported { message: format!("unknown descriptor-set-layout hash {:#x}", hash) }),
            }
        }

        let bindings = self.set_layout_bindings(hash).expect("checked above");
        let vk_bindings: Vec<vk::DescriptorSetLayoutBinding> = bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(b.binding)
                    .descriptor_type(b.descriptor_type)
                    .descriptor_count(b.array_count.max(1))
                    .stage_flags(b.stage_flags)
                    .build()
            })
            .collect();
        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&vk_bindings).build();
        let layout = unsafe { device.create_descriptor_set_layout(&layout_info, None) }
            .map_err(|e| layout_error("create_descriptor_set_layout", e))?;

        let template_entries = Self::update_template_entries(&bindings);
        let update_template = if template_entries.is_empty() {
            None
        } else {
            let template_info = vk::DescriptorUpdateTemplateCreateInfo::builder()
                .descriptor_update_entries(&template_entries)
                .template_type(vk::DescriptorUpdateTemplateType::DESCRIPTOR_SET)
                .descriptor_set_layout(layout)
                .build();
            Some(unsafe { device.create_descriptor_update_template(&template_info, None) }.map_err(|e| {
                unsafe { device.destroy_descriptor_set_layout(layout, None) };
                layout_error("create_descriptor_update_template", e)
            })?)
        };

        let mut inner = self.inner.write().expect("descriptor cache lock poisoned");
        if let Some(entry) = inner.set_layouts.get_mut(&hash) {
            entry.layout = Some(layout);
            entry.update_template = update_template;
        }
        Ok(())
    }

    /// One `vk::DescriptorUpdateTemplateEntry` per binding, reading from the
    /// binding's slot range in a flat, sorted `&[DescriptorData]` array.
    fn update_template_entries(bindings: &[MergedBinding]) -> Vec<vk::DescriptorUpdateTemplateEntry> {
        let stride = std::mem::size_of::<DescriptorData>();
        let mut slot_index = 0u32;
        let mut entries = Vec::with_capacity(bindings.len());
        for b in bindings {
            let is_image_like = matches!(
                b.descriptor_type,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER
                    | vk::DescriptorType::SAMPLED_IMAGE
                    | vk::DescriptorType::STORAGE_IMAGE
                    | vk::DescriptorType::SAMPLER
                    | vk::DescriptorType::INPUT_ATTACHMENT
            );
            let field_offset = if is_image_like { descriptor_data_image_offset() } else { descriptor_data_buffer_offset() };
            entries.push(
                vk::DescriptorUpdateTemplateEntry::builder()
                    .dst_binding(b.binding)
                    .dst_array_element(0)
                    .descriptor_count(b.array_count.max(1))
                    .descriptor_type(b.descriptor_type)
                    .offset((slot_index as usize) * stride + field_offset)
                    .stride(stride)
                    .build(),
            );
            slot_index += b.array_count.max(1);
        }
        entries
    }

    /// Splits the merged bindings at set boundaries (sets must be dense,
    /// i.e. 0..n with no gaps), interns one descriptor-set-layout hash per
    /// set, then hashes the ordered set-layout-hash array into a
    /// pipeline-layout hash.
    pub fn produce_pipeline_layout(&self, merged: Vec<MergedBinding>) -> Result<PipelineLayoutEntry> {
        let max_set = merged.iter().map(|b| b.set).max().map(|m| m + 1).unwrap_or(0);
        let mut per_set: Vec<Vec<MergedBinding>> = (0..max_set).map(|_| Vec::new()).collect();
        for b in merged {
            per_set[b.set as usize].push(b);
        }
        for (set_index, bindings) in per_set.iter().enumerate() {
            if bindings.is_empty() && (set_index as u32) < max_set - 1 {
                return Err(GraphError::BindingConflict {
                    set: set_index as u32,
                    binding: 0,
                    message: "descriptor sets must be densely numbered with no gaps".to_string(),
                });
            }
        }

        let mut set_layout_hashes = Vec::with_capacity(per_set.len());
        for bindings in per_set {
            set_layout_hashes.push(self.produce_descriptor_set_layout(bindings));
        }

        let mut hasher = FxHasher64::default();
        for h in &set_layout_hashes {
            h.hash(&mut hasher);
        }
        let hash = hasher.finish();

        let entry = PipelineLayoutEntry {
            hash,
            set_layout_hashes: set_layout_hashes.clone(),
            layout: None,
        };
        let mut inner = self.inner.write().expect("descriptor cache lock poisoned");
        inner
            .pipeline_layouts
            .entry(hash)
            .or_insert_with(|| PipelineLayoutEntry { hash, set_layout_hashes, layout: None });
        Ok(entry)
    }

    /// Builds the API `vk::PipelineLayout` for an already-interned pipeline
    /// layout, materializing each of its set layouts first.
    pub fn materialize_pipeline_layout(&self, device: &ash::Device, hash: PipelineLayoutHash) -> Result<vk::PipelineLayout> {
        if let Some(layout) = self.pipeline_layout_vk(hash) {
            return Ok(layout);
        }
        let set_layout_hashes = self
            .set_layout_hashes_of(hash)
            .ok_or_else(|| GraphError::Unsupported { message: format!("unknown pipeline-layout hash {:#x}", hash) })?;
        for set_hash in &set_layout_hashes {
            self.materialize_set_layout(device, *set_hash)?;
        }
        let vk_set_layouts: Vec<vk::DescriptorSetLayout> =
            set_layout_hashes.iter().map(|h| self.set_layout_vk(*h).expect("materialized above")).collect();
        let push_constant_range = vk::PushConstantRange::builder().stage_flags(vk::ShaderStageFlags::ALL).offset(0).size(MAX_PUSH_CONSTANT_BYTES).build();
        let layout_info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(&vk_set_layouts)
            .push_constant_ranges(std::slice::from_ref(&push_constant_range))
            .build();
        let layout = unsafe { device.create_pipeline_layout(&layout_info, None) }.map_err(|e| layout_error("create_pipeline_layout", e))?;

        let mut inner = self.inner.write().expect("descriptor cache lock poisoned");
        if let Some(entry) = inner.pipeline_layouts.get_mut(&hash) {
            entry.layout = Some(layout);
        }
        Ok(layout)
    }

    pub fn set_layout_bindings(&self, hash: DescriptorSetLayoutHash) -> Option<Vec<MergedBinding>> {
        let inner = self.inner.read().expect("descriptor cache lock poisoned");
        inner.set_layouts.get(&hash).map(|e| e.bindings.clone())
    }

    pub fn set_layout_vk(&self, hash: DescriptorSetLayoutHash) -> Option<vk::DescriptorSetLayout> {
        let inner = self.inner.read().expect("descriptor cache lock poisoned");
        inner.set_layouts.get(&hash).and_then(|e| e.layout)
    }

    pub fn update_template_vk(&self, hash: DescriptorSetLayoutHash) -> Option<vk::DescriptorUpdateTemplate> {
        let inner = self.inner.read().expect("descriptor cache lock poisoned");
        inner.set_layouts.get(&hash).and_then(|e| e.update_template)
    }

    pub fn pipeline_layout_vk(&self, hash: PipelineLayoutHash) -> Option<vk::PipelineLayout> {
        let inner = self.inner.read().expect("descriptor cache lock poisoned");
        inner.pipeline_layouts.get(&hash).and_then(|e| e.layout)
    }

    pub fn set_layout_hashes_of(&self, pipeline_layout_hash: PipelineLayoutHash) -> Option<Vec<DescriptorSetLayoutHash>> {
        let inner = self.inner.read().expect("descriptor cache lock poisoned");
        inner.pipeline_layouts.get(&pipeline_layout_hash).map(|e| e.set_layout_hashes.clone())
    }

    /// Destroys every retained API object. Called once at renderer
    /// teardown, after the device is idle.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        let inner = self.inner.write().expect("descriptor cache lock poisoned");
        for entry in inner.set_layouts.values() {
            if let Some(template) = entry.update_template {
                device.destroy_descriptor_update_template(template, None);
            }
            if let Some(layout) = entry.layout {
                device.destroy_descriptor_set_layout(layout, None);
            }
        }
        for entry in inner.pipeline_layouts.values() {
            if let Some(layout) = entry.layout {
                device.destroy_pipeline_layout(layout, None);
            }
        }
    }
}

fn layout_error(call: &str, result: vk::Result) -> GraphError {
    GraphError::Unsupported {
        message: format!("{} failed: {:?}", call, result),
    }
}

fn descriptor_data_image_offset() -> usize {
    let probe = DescriptorData::default();
    let base = &probe as *const DescriptorData as usize;
    let field = &probe.image as *const vk::DescriptorImageInfo as usize;
    field - base
}

fn descriptor_data_buffer_offset() -> usize {
    let probe = DescriptorData::default();
    let base = &probe as *const DescriptorData as usize;
    let field = &probe.buffer as *const vk::DescriptorBufferInfo as usize;
    field - base
}

impl Clone for MergedBinding {
    fn clone(&self) -> MergedBinding {
        MergedBinding {
            set: self.set,
            binding: self.binding,
            array_count: self.array_count,
            descriptor_type: self.descriptor_type,
            stage_flags: self.stage_flags,
            name_hash: self.name_hash,
            buffer_range: self.buffer_range,
            dynamic_offset_index: self.dynamic_offset_index,
            key: self.key,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn binding(set: u32, binding: u32, descriptor_type: vk::DescriptorType, stage: vk::ShaderStageFlags, name: &str) -> StageBinding {
        StageBinding {
            set,
            binding,
            array_count: 1,
            descriptor_type,
            stage,
            name_hash: { use std::hash::Hash; let mut h = FxHasher64::default(); name.hash(&mut h); h.finish() },
        }
    }

    #[test]
    fn stage_flags_or_combine_on_shared_binding() {
        let vertex = vec![binding(0, 0, vk::DescriptorType::UNIFORM_BUFFER, vk::ShaderStageFlags::VERTEX, "globals")];
        let fragment = vec![binding(0, 0, vk::DescriptorType::UNIFORM_BUFFER, vk::ShaderStageFlags::FRAGMENT, "globals")];
        let merged = DescriptorLayoutCache::merge_stage_bindings(&[&vertex, &fragment]).unwrap();
        assert_eq!(merged.len(), 1);
        assert!(merged[0].stage_flags.contains(vk::ShaderStageFlags::VERTEX));
        assert!(merged[0].stage_flags.contains(vk::ShaderStageFlags::FRAGMENT));
    }

    #[test]
    fn mismatched_type_across_stages_is_an_error() {
        let vertex = vec![binding(0, 0, vk::DescriptorType::UNIFORM_BUFFER, vk::ShaderStageFlags::VERTEX, "globals")];
        let fragment = vec![binding(0, 0, vk::DescriptorType::STORAGE_BUFFER, vk::ShaderStageFlags::FRAGMENT, "globals")];
        assert!(DescriptorLayoutCache::merge_stage_bindings(&[&vertex, &fragment]).is_err());
    }

    #[test]
    fn pipeline_layout_lookup_is_stable_for_identical_bindings() {
        let cache = DescriptorLayoutCache::new();
        let bindings = vec![binding(0, 0, vk::DescriptorType::UNIFORM_BUFFER, vk::ShaderStageFlags::VERTEX, "globals")];
        let merged_a = DescriptorLayoutCache::merge_stage_bindings(&[&bindings]).unwrap();
        let merged_b = DescriptorLayoutCache::merge_stage_bindings(&[&bindings]).unwrap();
        let layout_a = cache.produce_pipeline_layout(merged_a).unwrap();
        let layout_b = cache.produce_pipeline_layout(merged_b).unwrap();
        assert_eq!(layout_a.hash, layout_b.hash);
    }
}
