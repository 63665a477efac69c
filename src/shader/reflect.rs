//! Minimal SPIR-V reflection.
//!
//! Walks the raw instruction stream looking only for what descriptor-set
//! and vertex-input derivation needs: types, decorations, and global
//! variables. A flat single pass over word-count-prefixed opcodes using
//! `spirv_headers` for constant decoding, rather than a general-purpose
//! arena-backed AST, since this only needs to emit binding/attribute
//! records, not a general SPIR-V editing surface.

use std::collections::HashMap;

use ash::vk;
use spirv_headers::{Decoration, Op, StorageClass};

use crate::error::{GraphError, Result};

const SPIRV_MAGIC: u32 = 0x0723_0203;

pub fn looks_like_spirv(bytes: &[u8]) -> bool {
    bytes.len() >= 4 && u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) == SPIRV_MAGIC
}

fn words_from_bytes(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScalarType {
    Float,
    Int,
    UnsignedInt,
}

#[derive(Debug, Clone, Copy)]
enum TypeDesc {
    Scalar(ScalarType),
    Vector(ScalarType, u32),
    Struct,
    Image { sampled: Option<bool> },
    SampledImage,
    Array { element_type: u32, length: u32 },
    RuntimeArray { element_type: u32 },
    Pointer { storage_class: StorageClass, pointee: u32 },
    Other,
}

/// One descriptor binding derived from reflection, before argument-name
/// hashing and sorting by the caller.
#[derive(Debug, Clone)]
pub struct ReflectedBinding {
    pub set: u32,
    pub binding: u32,
    pub array_count: u32,
    pub descriptor_type: vk::DescriptorType,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct VertexAttribute {
    pub location: u32,
    pub format: vk::Format,
}

#[derive(Debug, Clone, Default)]
pub struct ReflectedModule {
    pub bindings: Vec<ReflectedBinding>,
    pub vertex_inputs: Vec<VertexAttribute>,
}

struct Parser {
    words: Vec<u32>,
    types: HashMap<u32, TypeDesc>,
    names: HashMap<u32, String>,
    decorations: HashMap<u32, Vec<(Decoration, Vec<u32>)>>,
}

/// Reflects a compiled SPIR-V module: enumerates uniform/storage buffers,
/// sampled/storage images, and (for vertex shaders) vertex input
/// attributes.
pub fn reflect(path: &str, spirv_bytes: &[u8], stage: vk::ShaderStageFlags) -> Result<ReflectedModule> {
    let words = words_from_bytes(spirv_bytes);
    if words.len() < 5 || words[0] != SPIRV_MAGIC {
        return Err(GraphError::ShaderCompile {
            path: path.to_string(),
            message: "not a well-formed SPIR-V module".to_string(),
        });
    }

    let mut parser = Parser {
        words,
        types: HashMap::new(),
        names: HashMap::new(),
        decorations: HashMap::new(),
    };
    parser.collect_types_names_decorations();

    let mut bindings = Vec::new();
    let mut vertex_inputs = Vec::new();

    for (result_id, result_type_id, storage_class) in parser.variables() {
        match storage_class {
            StorageClass::Uniform | StorageClass::UniformConstant | StorageClass::StorageBuffer => {
                if let Some(binding) = parser.reflect_resource_binding(result_id, result_type_id) {
                    bindings.push(binding);
                }
            }
            StorageClass::Input if stage == vk::ShaderStageFlags::VERTEX => {
                if let Some(location) = parser.decoration_value(result_id, Decoration::Location) {
                    let format = parser.vertex_format(result_type_id);
                    vertex_inputs.push(VertexAttribute { location, format });
                }
            }
            _ => {}
        }
    }

    vertex_inputs.sort_by_key(|a| a.location);
    Ok(ReflectedModule { bindings, vertex_inputs })
}

impl Parser {
    fn collect_types_names_decorations(&mut self) {
        let mut i = 5; // skip header: magic, version, generator, bound, schema
        while i < self.words.len() {
            let word_count = (self.words[i] >> 16) as usize;
            let opcode = (self.words[i] & 0xffff) as u16;
            if word_count == 0 || i + word_count > self.words.len() {
                break;
            }
            let operands = &self.words[i + 1..i + word_count];
            self.handle_instruction(opcode, operands);
            i += word_count;
        }
    }

    fn handle_instruction(&mut self, opcode: u16, operands: &[u32]) {
        let op = match op_from_u16(opcode) {
            Some(op) => op,
            None => return,
        };
        match op {
            Op::Name => {
                if operands.len() >= 2 {
                    self.names.insert(operands[0], parse_string(&operands[1..]));
                }
            }
            Op::Decorate => {
                if operands.len() >= 2 {
                    if let Some(deco) = decoration_from_u32(operands[1]) {
                        self.decorations
                            .entry(operands[0])
                            .or_insert_with(Vec::new)
                            .push((deco, operands[2..].to_vec()));
                    }
                }
            }
            Op::TypeFloat => {
                self.types.insert(operands[0], TypeDesc::Scalar(ScalarType::Float));
            }
            Op::TypeInt => {
                let signed = operands.get(2).copied().unwrap_or(1) != 0;
                self.types.insert(
                    operands[0],
                    TypeDesc::Scalar(if signed { ScalarType::Int } else { ScalarType::UnsignedInt }),
                );
            }
            Op::TypeVector => {
                if let Some(&TypeDesc::Scalar(scalar)) = self.types.get(&operands[1]) {
                    self.types.insert(operands[0], TypeDesc::Vector(scalar, operands[2]));
                }
            }
            Op::TypeStruct => {
                self.types.insert(operands[0], TypeDesc::Struct);
            }
            Op::TypeImage => {
                let sampled = match operands.get(6).copied() {
                    Some(1) => Some(true),
                    Some(2) => Some(false),
                    _ => None,
                };
                self.types.insert(operands[0], TypeDesc::Image { sampled });
            }
            Op::TypeSampledImage => {
                self.types.insert(operands[0], TypeDesc::SampledImage);
            }
            Op::TypeArray => {
                self.types.insert(
                    operands[0],
                    TypeDesc::Array {
                        element_type: operands[1],
                        length: 1,
                    },
                );
            }
            Op::TypeRuntimeArray => {
                self.types.insert(operands[0], TypeDesc::RuntimeArray { element_type: operands[1] });
            }
            Op::TypePointer => {
                if let Some(storage_class) = storage_class_from_u32(operands[1]) {
                    self.types.insert(
                        operands[0],
                        TypeDesc::Pointer {
                            storage_class,
                            pointee: operands[2],
                        },
                    );
                }
            }
            _ => {
                self.types.entry(0).or_insert(TypeDesc::Other);
            }
        }
    }

    fn variables(&self) -> Vec<(u32, u32, StorageClass)> {
        let mut out = Vec::new();
        let mut i = 5;
        while i < self.words.len() {
            let word_count = (self.words[i] >> 16) as usize;
            let opcode = (self.words[i] & 0xffff) as u16;
            if word_count == 0 || i + word_count > self.words.len() {
                break;
            }
            if opcode == Op::Variable as u16 {
                let operands = &self.words[i + 1..i + word_count];
                if operands.len() >= 3 {
                    if let Some(storage_class) = storage_class_from_u32(operands[2]) {
                        out.push((operands[1], operands[0], storage_class));
                    }
                }
            }
            i += word_count;
        }
        out
    }

    fn decoration_value(&self, id: u32, target: Decoration) -> Option<u32> {
        self.decorations.get(&id)?.iter().find(|(d, _)| *d == target).and_then(|(_, params)| params.get(0).copied())
    }

    fn has_decoration(&self, id: u32, target: Decoration) -> bool {
        self.decorations.get(&id).map_or(false, |decos| decos.iter().any(|(d, _)| *d == target))
    }

    /// Strips pointer/array indirection around a variable's type to find
    /// the descriptor-shaped type underneath, then classifies it as a UBO,
    /// SSBO, combined-image-sampler, or storage-image.
    fn reflect_resource_binding(&self, result_id: u32, result_type_id: u32) -> Option<ReflectedBinding> {
        let set = self.decoration_value(result_id, Decoration::DescriptorSet)?;
        let binding = self.decoration_value(result_id, Decoration::Binding)?;
        let name = self.names.get(&result_id).cloned().unwrap_or_default();

        let pointee = match self.types.get(&result_type_id) {
            Some(TypeDesc::Pointer { pointee, .. }) => *pointee,
            _ => return None,
        };

        let (array_count, inner) = match self.types.get(&pointee) {
            Some(TypeDesc::Array { element_type, length }) => (*length, *element_type),
            Some(TypeDesc::RuntimeArray { element_type }) => (0, *element_type),
            _ => (1, pointee),
        };

        let descriptor_type = match self.types.get(&inner) {
            Some(TypeDesc::Struct) => {
                if self.has_decoration(pointee, Decoration::BufferBlock) {
                    vk::DescriptorType::STORAGE_BUFFER
                } else {
                    vk::DescriptorType::UNIFORM_BUFFER
                }
            }
            Some(TypeDesc::SampledImage) => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            Some(TypeDesc::Image { sampled: Some(false) }) => vk::DescriptorType::STORAGE_IMAGE,
            Some(TypeDesc::Image { sampled: Some(true) }) => vk::DescriptorType::SAMPLED_IMAGE,
            Some(TypeDesc::Image { sampled: None }) => vk::DescriptorType::STORAGE_IMAGE,
            _ => vk::DescriptorType::UNIFORM_BUFFER,
        };

        Some(ReflectedBinding {
            set,
            binding,
            array_count: array_count.max(1),
            descriptor_type,
            name,
        })
    }

    /// Vertex-input format derived from base type × vector width.
    fn vertex_format(&self, result_type_id: u32) -> vk::Format {
        let pointee = match self.types.get(&result_type_id) {
            Some(TypeDesc::Pointer { pointee, .. }) => *pointee,
            _ => return vk::Format::UNDEFINED,
        };
        match self.types.get(&pointee) {
            Some(TypeDesc::Scalar(ScalarType::Float)) => vk::Format::R32_SFLOAT,
            Some(TypeDesc::Scalar(ScalarType::Int)) => vk::Format::R32_SINT,
            Some(TypeDesc::Scalar(ScalarType::UnsignedInt)) => vk::Format::R32_UINT,
            Some(TypeDesc::Vector(ScalarType::Float, 2)) => vk::Format::R32G32_SFLOAT,
            Some(TypeDesc::Vector(ScalarType::Float, 3)) => vk::Format::R32G32B32_SFLOAT,
            Some(TypeDesc::Vector(ScalarType::Float, 4)) => vk::Format::R32G32B32A32_SFLOAT,
            Some(TypeDesc::Vector(ScalarType::Int, 2)) => vk::Format::R32G32_SINT,
            Some(TypeDesc::Vector(ScalarType::Int, 3)) => vk::Format::R32G32B32_SINT,
            Some(TypeDesc::Vector(ScalarType::Int, 4)) => vk::Format::R32G32B32A32_SINT,
            Some(TypeDesc::Vector(ScalarType::UnsignedInt, 2)) => vk::Format::R32G32_UINT,
            Some(TypeDesc::Vector(ScalarType::UnsignedInt, 3)) => vk::Format::R32G32B32_UINT,
            Some(TypeDesc::Vector(ScalarType::UnsignedInt, 4)) => vk::Format::R32G32B32A32_UINT,
            _ => vk::Format::UNDEFINED,
        }
    }
}

fn parse_string(data: &[u32]) -> String {
    let bytes: Vec<u8> = data
        .iter()
        .flat_map(|&w| w.to_le_bytes())
        .take_while(|&b| b != 0)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

fn op_from_u16(value: u16) -> Option<Op> {
    match value {
        5 => Some(Op::Name),
        71 => Some(Op::Decorate),
        22 => Some(Op::TypeFloat),
        21 => Some(Op::TypeInt),
        23 => Some(Op::TypeVector),
        30 => Some(Op::TypeStruct),
        25 => Some(Op::TypeImage),
        27 => Some(Op::TypeSampledImage),
        28 => Some(Op::TypeArray),
        29 => Some(Op::TypeRuntimeArray),
        32 => Some(Op::TypePointer),
        59 => Some(Op::Variable),
        _ => None,
    }
}

fn decoration_from_u32(value: u32) -> Option<Decoration> {
    match value {
        2 => Some(Decoration::Block),
        3 => Some(Decoration::BufferBlock),
        30 => Some(Decoration::Location),
        33 => Some(Decoration::Binding),
        34 => Some(Decoration::DescriptorSet),
        _ => None,
    }
}

fn storage_class_from_u32(value: u32) -> Option<StorageClass> {
    match value {
        0 => Some(StorageClass::UniformConstant),
        2 => Some(StorageClass::Uniform),
        1 => Some(StorageClass::Input),
        12 => Some(StorageClass::StorageBuffer),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(opcode: u16, word_count: u16) -> u32 {
        ((word_count as u32) << 16) | opcode as u32
    }

    /// Hand-assembles a tiny module: `layout(set=0, binding=3) uniform Block { float x; };`
    /// to exercise UBO reflection without invoking a real compiler.
    fn synthetic_ubo_module() -> Vec<u8> {
        let struct_ty = 1u32;
        let float_ty = 2u32;
        let ptr_ty = 3u32;
        let var_id = 4u32;

        let mut words = vec![SPIRV_MAGIC, 0x0001_0300, 0, 10, 0];
        // OpName %4 "ubo" (2 operand words: target + 1 packed char word)
        words.push(word(5, 3));
        words.push(var_id);
        words.push(u32::from_le_bytes([b'u', b'b', b'o', 0]));
        // OpDecorate %4 DescriptorSet 0
        words.push(word(71, 3));
        words.push(var_id);
        words.push(34);
        words.push(0);
        // OpDecorate %4 Binding 3
        words.push(word(71, 3));
        words.push(var_id);
        words.push(33);
        words.push(3);
        // OpTypeFloat %2 32
        words.push(word(22, 2));
        words.push(float_ty);
        words.push(32);
        // OpTypeStruct %1 %2
        words.push(word(30, 2));
        words.push(struct_ty);
        words.push(float_ty);
        // OpTypePointer %3 Uniform %1
        words.push(word(32, 3));
        words.push(ptr_ty);
        words.push(2); // Uniform
        words.push(struct_ty);
        // OpVariable %3 %4 Uniform
        words.push(word(59, 3));
        words.push(ptr_ty);
        words.push(var_id);
        words.push(2);

        words.iter().flat_map(|w| w.to_le_bytes()).collect()
    }

    #[test]
    fn reflects_a_uniform_buffer_binding() {
        let bytes = synthetic_ubo_module();
        let reflected = reflect("test.frag", &bytes, vk::ShaderStageFlags::FRAGMENT).unwrap();
        assert_eq!(reflected.bindings.len(), 1);
        assert_eq!(reflected.bindings[0].set, 0);
        assert_eq!(reflected.bindings[0].binding, 3);
        assert_eq!(reflected.bindings[0].descriptor_type, vk::DescriptorType::UNIFORM_BUFFER);
    }

    #[test]
    fn rejects_bytes_without_the_spirv_magic() {
        assert!(reflect("test.frag", &[0, 1, 2, 3, 4, 5, 6, 7], vk::ShaderStageFlags::FRAGMENT).is_err());
    }
}
