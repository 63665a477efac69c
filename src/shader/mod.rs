//! Shader module store.
//!
//! Canonicalizes (path, SPIR-V bytes, defines) to a stable hash, reflects
//! bindings and vertex inputs, and caches the materialized `vk::ShaderModule`
//! process-wide, keyed by source hash rather than by path alone so that two
//! defines variants of the same file never collide.

pub mod reflect;

use std::collections::{HashMap, HashSet};
use std::fs;
use std::hash::{Hash, Hasher};
use std::sync::RwLock;

use ash::vk;
use fxhash::FxHasher64;
use log::{info, warn};

use crate::error::{GraphError, Result};
use crate::shader::reflect::{looks_like_spirv, reflect, ReflectedBinding, VertexAttribute};

pub type ShaderModuleHash = u64;

/// A sorted, deduplicated binding record as derived by reflection, prior to
/// cross-stage merging done elsewhere; this module only validates "no two
/// entries with equal (set,binding)" within one stage.
#[derive(Debug, Clone)]
pub struct StageBinding {
    pub set: u32,
    pub binding: u32,
    pub array_count: u32,
    pub descriptor_type: vk::DescriptorType,
    pub stage: vk::ShaderStageFlags,
    pub name_hash: u64,
}

pub struct ShaderModule {
    pub hash: ShaderModuleHash,
    pub path: String,
    pub stage: vk::ShaderStageFlags,
    pub defines: String,
    pub spirv: Vec<u8>,
    pub bindings: Vec<StageBinding>,
    pub vertex_inputs: Vec<VertexAttribute>,
    /// Hash over the sorted binding records excluding the name field.
    pub pipeline_layout_hash: u64,
}

struct Inner {
    modules: HashMap<ShaderModuleHash, ShaderModule>,
    /// Source path -> set of module hashes depending on it, for hot-reload
    /// invalidation.
    dependents: HashMap<String, HashSet<ShaderModuleHash>>,
    tainted: HashSet<ShaderModuleHash>,
}

/// Process-wide cache, retained until renderer teardown.
pub struct ShaderModuleStore {
    inner: RwLock<Inner>,
}

fn name_hash(name: &str) -> u64 {
    let mut hasher = FxHasher64::default();
    name.hash(&mut hasher);
    hasher.finish()
}

fn canonical_hash(path: &str, spirv: &[u8], defines: &str) -> u64 {
    let mut hasher = FxHasher64::default();
    path.hash(&mut hasher);
    spirv.hash(&mut hasher);
    defines.hash(&mut hasher);
    hasher.finish()
}

fn binding_hash_payload(bindings: &[StageBinding]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(bindings.len() * 20);
    for b in bindings {
        bytes.extend_from_slice(&b.set.to_le_bytes());
        bytes.extend_from_slice(&b.binding.to_le_bytes());
        bytes.extend_from_slice(&b.array_count.to_le_bytes());
        bytes.extend_from_slice(&(b.descriptor_type.as_raw() as u32).to_le_bytes());
        bytes.extend_from_slice(&b.stage.as_raw().to_le_bytes());
    }
    bytes
}

impl ShaderModuleStore {
    pub fn new() -> ShaderModuleStore {
        ShaderModuleStore {
            inner: RwLock::new(Inner {
                modules: HashMap::new(),
                dependents: HashMap::new(),
                tainted: HashSet::new(),
            }),
        }
    }

    /// Loads, reflects, validates, hashes, and interns a shader module.
    /// Returns the module hash used as an opaque handle everywhere else in
    /// the crate.
    pub fn create_shader_module(
        &self,
        path: &str,
        stage: vk::ShaderStageFlags,
        defines: &str,
        compile: impl FnOnce(&str, &str) -> Result<Vec<u8>>,
    ) -> Result<ShaderModuleHash> {
        let raw = fs::read(path).map_err(|e| GraphError::ShaderCompile {
            path: path.to_string(),
            message: format!("failed to read source: {}", e),
        })?;

        let spirv = if looks_like_spirv(&raw) {
            raw
        } else {
            compile(path, defines)?
        };

        let hash = canonical_hash(path, &spirv, defines);

        {
            let inner = self.inner.read().expect("shader store lock poisoned");
            if inner.modules.contains_key(&hash) {
                return Ok(hash);
            }
        }

        let reflected = reflect(path, &spirv, stage)?;
        let bindings = Self::stage_bindings(&reflected.bindings, stage)?;
        let pipeline_layout_hash = {
            let mut hasher = FxHasher64::default();
            binding_hash_payload(&bindings).hash(&mut hasher);
            hasher.finish()
        };

        let module = ShaderModule {
            hash,
            path: path.to_string(),
            stage,
            defines: defines.to_string(),
            spirv,
            bindings,
            vertex_inputs: reflected.vertex_inputs,
            pipeline_layout_hash,
        };

        let mut inner = self.inner.write().expect("shader store lock poisoned");
        inner.dependents.entry(path.to_string()).or_insert_with(HashSet::new).insert(hash);
        inner.modules.insert(hash, module);
        info!("shader module cached: {} ({:?}) -> {:#x}", path, stage, hash);
        Ok(hash)
    }

    /// Validates "no two entries with equal (set,binding)" for one stage
    /// and attaches name hashes + sorts.
    fn stage_bindings(reflected: &[ReflectedBinding], stage: vk::ShaderStageFlags) -> Result<Vec<StageBinding>> {
        let mut bindings: Vec<StageBinding> = reflected
            .iter()
            .map(|b| StageBinding {
                set: b.set,
                binding: b.binding,
                array_count: b.array_count,
                descriptor_type: b.descriptor_type,
                stage,
                name_hash: name_hash(&b.name),
            })
            .collect();
        bindings.sort_by_key(|b| (b.set, b.binding));
        for pair in bindings.windows(2) {
            if pair[0].set == pair[1].set && pair[0].binding == pair[1].binding {
                return Err(GraphError::BindingConflict {
                    set: pair[0].set,
                    binding: pair[0].binding,
                    message: "duplicate (set, binding) within a single shader stage".to_string(),
                });
            }
        }
        Ok(bindings)
    }

    pub fn with_module<R>(&self, hash: ShaderModuleHash, f: impl FnOnce(&ShaderModule) -> R) -> Option<R> {
        let inner = self.inner.read().expect("shader store lock poisoned");
        inner.modules.get(&hash).map(f)
    }

    /// Marks every module depending on `path` as tainted, for the next
    /// frame-start reload pass to pick up.
    pub fn mark_tainted(&self, path: &str) {
        let mut inner = self.inner.write().expect("shader store lock poisoned");
        if let Some(dependents) = inner.dependents.get(path).cloned() {
            inner.tainted.extend(dependents);
        }
    }

    pub fn tainted_modules(&self) -> Vec<ShaderModuleHash> {
        self.inner.read().expect("shader store lock poisoned").tainted.iter().copied().collect()
    }

    /// Frame-start reload pass: re-runs reflection in place for every
    /// tainted module. On validation failure,
    /// the previous module entry is left untouched (rollback); on success
    /// the old entry is replaced and the caller is responsible for retiring
    /// the stale API object.
    pub fn reload_tainted(&self, compile: impl Fn(&str, &str) -> Result<Vec<u8>>) {
        let tainted: Vec<ShaderModuleHash> = self.tainted_modules();
        for hash in tainted {
            let (path, stage, defines) = {
                let inner = self.inner.read().expect("shader store lock poisoned");
                match inner.modules.get(&hash) {
                    Some(m) => (m.path.clone(), m.stage, m.defines.clone()),
                    None => continue,
                }
            };
            match self.create_shader_module(&path, stage, &defines, &compile) {
                Ok(new_hash) => {
                    let mut inner = self.inner.write().expect("shader store lock poisoned");
                    inner.tainted.remove(&hash);
                    if new_hash != hash {
                        inner.modules.remove(&hash);
                    }
                }
                Err(e) => {
                    warn!("shader reload failed, keeping previous module live: {}", e);
                    let mut inner = self.inner.write().expect("shader store lock poisoned");
                    inner.tainted.remove(&hash);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_set_binding_within_a_stage_is_rejected() {
        let reflected = vec![
            ReflectedBinding { set: 0, binding: 1, array_count: 1, descriptor_type: vk::DescriptorType::UNIFORM_BUFFER, name: "a".into() },
            ReflectedBinding { set: 0, binding: 1, array_count: 1, descriptor_type: vk::DescriptorType::STORAGE_BUFFER, name: "b".into() },
        ];
        assert!(ShaderModuleStore::stage_bindings(&reflected, vk::ShaderStageFlags::FRAGMENT).is_err());
    }

    #[test]
    fn bindings_are_sorted_by_set_then_binding() {
        let reflected = vec![
            ReflectedBinding { set: 1, binding: 0, array_count: 1, descriptor_type: vk::DescriptorType::UNIFORM_BUFFER, name: "a".into() },
            ReflectedBinding { set: 0, binding: 2, array_count: 1, descriptor_type: vk::DescriptorType::UNIFORM_BUFFER, name: "b".into() },
            ReflectedBinding { set: 0, binding: 1, array_count: 1, descriptor_type: vk::DescriptorType::UNIFORM_BUFFER, name: "c".into() },
        ];
        let bindings = ShaderModuleStore::stage_bindings(&reflected, vk::ShaderStageFlags::VERTEX).unwrap();
        let keys: Vec<(u32, u32)> = bindings.iter().map(|b| (b.set, b.binding)).collect();
        assert_eq!(keys, vec![(0, 1), (0, 2), (1, 0)]);
    }
}
