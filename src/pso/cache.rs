//! Pipeline state deduplication and lazy compilation.
//!
//! Each shader program owns one [`PsoCache`]. The cache maps a finalized
//! [`PipelineDescriptor`] to a compiled [`PipelineStateInstance`] and
//! guarantees that a descriptor seen before never recompiles: the second
//! bake of an equal descriptor returns the *same* instance.
//!
//! The table lock is held only for lookup and insert, never across the
//! backend compile call, so different descriptors compile concurrently on
//! compiler worker threads. Two threads baking the *identical* descriptor
//! at the same time are not deduplicated against each other; both compile
//! and the last insert wins. This race is deliberate (see DESIGN.md).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backend::{
    BlockBinding, CompiledPipeline, ComputePipelineRequest, GpuPipeline, PipelineReflection,
    RenderPipelineRequest, StageLibrary,
};
use crate::context::GpuContext;
use crate::pso::{
    resolve_buffer_binding_bases, BufferBindingBases, PipelineDescriptor, PrimitiveClass,
    ResolvedAttribute, SpecValue, SpecializationValues, VertexFormat, ATTR_FLAG_BASE,
};
use crate::shader::ShaderInterface;

/// Record of one shader attribute redirected to the shared null buffer
/// because the bound vertex data does not provide it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NullAttributeBinding {
    /// Shader input location.
    pub location: u32,
    /// Element format the shader expects; the null buffer is read with it.
    pub format: VertexFormat,
    /// Buffer binding index of the shared null buffer.
    pub buffer_index: u32,
    /// Always zero; the null buffer never advances.
    pub stride: u32,
}

/// The compiled artifact for one pipeline variant.
///
/// Created exactly once per unique descriptor per shader, owned by the
/// shader's cache, never mutated after creation.
#[derive(Debug)]
pub struct PipelineStateInstance {
    /// Monotonic cache-insertion index, for ordering and debugging.
    pub index: u64,
    /// Opaque backend pipeline handle.
    pub pipeline: GpuPipeline,
    /// Resolved buffer-binding base indices.
    pub bases: BufferBindingBases,
    /// Attribute table after null redirection and dead-slot flagging.
    pub attributes: Vec<ResolvedAttribute>,
    /// Shader attributes that were redirected to the shared null buffer.
    pub null_attribute_bindings: Vec<NullAttributeBinding>,
    /// Driver-decided binding sizes/alignments, read back after compile.
    pub reflection: PipelineReflection,
}

impl PipelineStateInstance {
    /// Check a buffer against the reflected requirements of a binding.
    ///
    /// Returns `false` (after logging a warning) when the compiled pipeline
    /// needs more bytes at this binding than the buffer provides; callers
    /// turn the bind into a no-op rather than corrupting GPU memory.
    pub fn validate_buffer_binding(&self, index: u32, buffer_size: u64) -> bool {
        match self.reflection.binding(index) {
            Some(binding) if binding.active && buffer_size < binding.size => {
                log::warn!(
                    "Buffer bound at index {} is {} bytes but the pipeline expects {}; skipping bind",
                    index,
                    buffer_size,
                    binding.size
                );
                false
            }
            _ => true,
        }
    }
}

/// Cache key for render pipelines.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RenderKey {
    primitive: PrimitiveClass,
    descriptor: PipelineDescriptor,
}

/// Per-shader pipeline state cache.
#[derive(Debug, Default)]
pub struct PsoCache {
    render_table: Mutex<HashMap<RenderKey, Arc<PipelineStateInstance>>>,
    compute_table: Mutex<HashMap<SpecializationValues, Arc<PipelineStateInstance>>>,
    next_index: AtomicU64,
}

impl PsoCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached render pipeline variants.
    pub fn render_len(&self) -> usize {
        self.render_table.lock().len()
    }

    /// Number of cached compute pipeline variants.
    pub fn compute_len(&self) -> usize {
        self.compute_table.lock().len()
    }

    /// Snapshot of every render descriptor baked so far, used to warm a
    /// child shader's cache from its parent.
    pub fn render_keys(&self) -> Vec<(PrimitiveClass, PipelineDescriptor)> {
        self.render_table
            .lock()
            .keys()
            .map(|k| (k.primitive, k.descriptor.clone()))
            .collect()
    }

    /// Deduplicate-or-compile one render pipeline variant.
    ///
    /// Returns `None` when the backend reports a genuine compile failure;
    /// the full diagnostic text is logged and the cache is left unchanged.
    #[allow(clippy::too_many_arguments)]
    pub fn bake_render_pipeline(
        &self,
        ctx: &GpuContext,
        label: &str,
        interface: &ShaderInterface,
        vertex: &StageLibrary,
        fragment: Option<&StageLibrary>,
        primitive: PrimitiveClass,
        descriptor: &PipelineDescriptor,
    ) -> Option<Arc<PipelineStateInstance>> {
        debug_assert!(
            descriptor.is_finalized(),
            "descriptor must be finalized before baking"
        );

        let key = RenderKey {
            primitive,
            descriptor: descriptor.clone(),
        };

        // Lookup under lock; drop the lock before compiling so other
        // descriptors can bake concurrently.
        if let Some(existing) = self.render_table.lock().get(&key) {
            return Some(existing.clone());
        }

        let bases = resolve_buffer_binding_bases(
            descriptor.vertex_buffer_count(),
            interface.uniform_block_count(),
        );

        // Build the attribute table. Shader attributes without matching
        // vertex data are redirected to the shared null buffer; descriptor
        // slots the shader never reads are disabled via specialization
        // flags so dead format conversions can be skipped.
        let mut attributes = Vec::new();
        let mut null_bindings = Vec::new();
        let mut attr_flags = SpecializationValues::new();
        let mut null_buffer_needed = false;

        for shader_attr in &interface.attributes {
            match descriptor.attribute_at(shader_attr.location) {
                Some(bound) => {
                    attributes.push(ResolvedAttribute {
                        location: bound.location,
                        format: bound.format,
                        offset: bound.offset,
                        buffer_index: bound.buffer_index,
                        enabled: true,
                    });
                    attr_flags.set(
                        ATTR_FLAG_BASE + bound.location,
                        SpecValue::Bool(true),
                    );
                }
                None => {
                    null_buffer_needed = true;
                    attributes.push(ResolvedAttribute {
                        location: shader_attr.location,
                        format: shader_attr.format,
                        offset: 0,
                        buffer_index: bases.null_buffer_index,
                        enabled: true,
                    });
                    null_bindings.push(NullAttributeBinding {
                        location: shader_attr.location,
                        format: shader_attr.format,
                        buffer_index: bases.null_buffer_index,
                        stride: 0,
                    });
                }
            }
        }

        for bound in descriptor.attributes() {
            if interface.attribute_at(bound.location).is_none() {
                attributes.push(ResolvedAttribute {
                    location: bound.location,
                    format: bound.format,
                    offset: bound.offset,
                    buffer_index: bound.buffer_index,
                    enabled: false,
                });
                attr_flags.set(ATTR_FLAG_BASE + bound.location, SpecValue::Bool(false));
            }
        }

        // One shared null buffer serves every redirected attribute; it is
        // allocated lazily on first use and reused across bakes.
        if null_buffer_needed && ctx.null_vertex_buffer().is_err() {
            log::error!("Failed to allocate the shared null vertex buffer for '{label}'");
            return None;
        }

        let specialization = descriptor.specialization().merged_with(&attr_flags);
        let uniform_blocks = block_bindings(interface, bases, true);
        let storage_blocks = block_bindings(interface, bases, false);

        let request = RenderPipelineRequest {
            label,
            vertex,
            fragment,
            primitive,
            descriptor,
            attributes: &attributes,
            specialization: &specialization,
            bases,
            uniform_blocks: &uniform_blocks,
            storage_blocks: &storage_blocks,
        };

        let compiled = match ctx.backend().create_render_pipeline(&request) {
            Ok(compiled) => compiled,
            Err(diag) => {
                log::error!("Pipeline compilation failed for shader '{label}':\n{diag}");
                return None;
            }
        };
        log_benign_diagnostics(label, &compiled);

        let instance = Arc::new(PipelineStateInstance {
            index: self.next_index.fetch_add(1, Ordering::Relaxed),
            pipeline: compiled.pipeline,
            bases,
            attributes,
            null_attribute_bindings: null_bindings,
            reflection: compiled.reflection,
        });

        // Insert under lock. A concurrent bake of the identical descriptor
        // may have inserted first; last insert wins.
        self.render_table.lock().insert(key, instance.clone());
        log::trace!(
            "Baked render pipeline #{} for '{}' ({} attributes, {} null-bound)",
            instance.index,
            label,
            instance.attributes.len(),
            instance.null_attribute_bindings.len()
        );
        Some(instance)
    }

    /// Deduplicate-or-compile one compute pipeline variant.
    ///
    /// Keyed by specialization values only. When the first attempt fails
    /// and the adapter's threadgroup limit is below `required_threads`, the
    /// bake is retried once with an explicitly widened limit.
    pub fn bake_compute_pipeline(
        &self,
        ctx: &GpuContext,
        label: &str,
        interface: &ShaderInterface,
        compute: &StageLibrary,
        specialization: &SpecializationValues,
        required_threads: u32,
    ) -> Option<Arc<PipelineStateInstance>> {
        if let Some(existing) = self.compute_table.lock().get(specialization) {
            return Some(existing.clone());
        }

        let bases = resolve_buffer_binding_bases(0, interface.uniform_block_count());
        let uniform_blocks = block_bindings(interface, bases, true);
        let storage_blocks = block_bindings(interface, bases, false);

        let mut request = ComputePipelineRequest {
            label,
            compute,
            specialization,
            max_total_threads: None,
            uniform_blocks: &uniform_blocks,
            storage_blocks: &storage_blocks,
        };

        let compiled = match ctx.backend().create_compute_pipeline(&request) {
            Ok(compiled) => compiled,
            Err(diag) => {
                let reported_max = ctx.capabilities().max_threads_per_workgroup;
                if reported_max < required_threads {
                    log::warn!(
                        "Compute pipeline '{}' needs {} threads per group but the adapter reports {}; retrying with a widened limit",
                        label,
                        required_threads,
                        reported_max
                    );
                    request.max_total_threads = Some(required_threads);
                    match ctx.backend().create_compute_pipeline(&request) {
                        Ok(compiled) => compiled,
                        Err(diag) => {
                            log::error!(
                                "Compute pipeline compilation failed for shader '{label}':\n{diag}"
                            );
                            return None;
                        }
                    }
                } else {
                    log::error!(
                        "Compute pipeline compilation failed for shader '{label}':\n{diag}"
                    );
                    return None;
                }
            }
        };
        log_benign_diagnostics(label, &compiled);

        let instance = Arc::new(PipelineStateInstance {
            index: self.next_index.fetch_add(1, Ordering::Relaxed),
            pipeline: compiled.pipeline,
            bases,
            attributes: Vec::new(),
            null_attribute_bindings: Vec::new(),
            reflection: compiled.reflection,
        });

        self.compute_table
            .lock()
            .insert(specialization.clone(), instance.clone());
        log::trace!("Baked compute pipeline #{} for '{}'", instance.index, label);
        Some(instance)
    }
}

/// Map reflection blocks to their resolved binding indices.
fn block_bindings(
    interface: &ShaderInterface,
    bases: BufferBindingBases,
    uniform: bool,
) -> Vec<BlockBinding> {
    if uniform {
        interface
            .uniform_blocks
            .iter()
            .map(|b| BlockBinding {
                index: bases.uniform_base + b.slot,
                declared_size: b.size,
                stages: b.stages,
            })
            .collect()
    } else {
        interface
            .storage_blocks
            .iter()
            .map(|b| BlockBinding {
                index: bases.storage_base + b.slot,
                declared_size: b.size,
                stages: b.stages,
            })
            .collect()
    }
}

fn log_benign_diagnostics(label: &str, compiled: &CompiledPipeline) {
    if let Some(diag) = &compiled.diagnostics {
        debug_assert!(diag.is_benign(), "non-benign diagnostics on a successful compile");
        log::warn!("Shader '{label}' compiled with warnings:\n{diag}");
    }
}

#[cfg(test)]
#[cfg(feature = "headless")]
mod tests {
    use super::*;
    use crate::backend::BufferBindingReflection;
    use crate::shader::ShaderStageFlags;

    fn instance_with_binding(size: u64, active: bool) -> PipelineStateInstance {
        PipelineStateInstance {
            index: 0,
            pipeline: GpuPipeline::Headless { id: 0 },
            bases: resolve_buffer_binding_bases(0, 0),
            attributes: Vec::new(),
            null_attribute_bindings: Vec::new(),
            reflection: PipelineReflection {
                buffer_bindings: vec![BufferBindingReflection {
                    index: 1,
                    size,
                    alignment: 256,
                    active,
                    stages: ShaderStageFlags::VERTEX,
                }],
            },
        }
    }

    #[test]
    fn test_undersized_binding_is_rejected() {
        let instance = instance_with_binding(256, true);
        assert!(!instance.validate_buffer_binding(1, 128));
        assert!(instance.validate_buffer_binding(1, 256));
        assert!(instance.validate_buffer_binding(1, 512));
    }

    #[test]
    fn test_inactive_binding_is_not_checked() {
        let instance = instance_with_binding(256, false);
        assert!(instance.validate_buffer_binding(1, 0));
    }

    #[test]
    fn test_unknown_binding_is_not_checked() {
        let instance = instance_with_binding(256, true);
        assert!(instance.validate_buffer_binding(9, 0));
    }
}
