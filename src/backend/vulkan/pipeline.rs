//! Vulkan shader translation and pipeline creation.
//!
//! Stage sources are WGSL; the translator (naga) is invoked opaquely and
//! its SPIR-V output goes straight into a shader module. Pipeline creation
//! uses dynamic rendering, so attachment formats come from the descriptor
//! rather than a render pass object.

use std::ffi::CString;

use ash::vk;

use crate::backend::{
    BlockBinding, BufferBindingReflection, CompiledPipeline, ComputePipelineRequest, GpuPipeline,
    PipelineReflection, RenderPipelineRequest, StageLibrary,
};
use crate::error::CompileDiagnostic;
use crate::pso::{
    BlendFactor, BlendOp, ColorWriteMask, PrimitiveClass, SpecializationValues, StepFunction,
    TextureFormat, VertexFormat,
};
use crate::shader::ShaderStage;

/// Compile WGSL to SPIR-V and create a shader module.
pub fn compile_stage(
    device: &ash::Device,
    stage: ShaderStage,
    source: &str,
    entry_point: &str,
) -> Result<vk::ShaderModule, CompileDiagnostic> {
    let module = naga::front::wgsl::parse_str(source)
        .map_err(|e| CompileDiagnostic::new(format!("WGSL parse error: {e}")))?;

    let mut validator = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    );
    let info = validator
        .validate(&module)
        .map_err(|e| CompileDiagnostic::new(format!("Validation error: {e}")))?;

    let naga_stage = match stage {
        ShaderStage::Vertex => naga::ShaderStage::Vertex,
        ShaderStage::Fragment => naga::ShaderStage::Fragment,
        ShaderStage::Compute => naga::ShaderStage::Compute,
    };

    if !module
        .entry_points
        .iter()
        .any(|ep| ep.name == entry_point && ep.stage == naga_stage)
    {
        return Err(CompileDiagnostic::new(format!(
            "Entry point '{entry_point}' not found for stage {stage:?}"
        )));
    }

    let options = naga::back::spv::Options {
        lang_version: (1, 3),
        flags: naga::back::spv::WriterFlags::empty(),
        capabilities: None,
        bounds_check_policies: naga::proc::BoundsCheckPolicies::default(),
        binding_map: Default::default(),
        debug_info: None,
        zero_initialize_workgroup_memory: naga::back::spv::ZeroInitializeWorkgroupMemoryMode::None,
    };

    let pipeline_options = naga::back::spv::PipelineOptions {
        shader_stage: naga_stage,
        entry_point: entry_point.to_string(),
    };

    let spv = naga::back::spv::write_vec(&module, &info, &options, Some(&pipeline_options))
        .map_err(|e| CompileDiagnostic::new(format!("SPIR-V generation error: {e}")))?;

    let create_info = vk::ShaderModuleCreateInfo::default().code(&spv);

    unsafe { device.create_shader_module(&create_info, None) }
        .map_err(|e| CompileDiagnostic::new(format!("Failed to create shader module: {e:?}")))
}

/// Flattened specialization data referenced by `vk::SpecializationInfo`.
struct SpecializationData {
    entries: Vec<vk::SpecializationMapEntry>,
    data: Vec<u8>,
}

fn build_specialization(values: &SpecializationValues) -> SpecializationData {
    let mut entries = Vec::with_capacity(values.len());
    let mut data = Vec::with_capacity(values.len() * 4);
    for (id, value) in values.iter() {
        entries.push(
            vk::SpecializationMapEntry::default()
                .constant_id(id)
                .offset(data.len() as u32)
                .size(4),
        );
        data.extend_from_slice(&value.to_bits().to_le_bytes());
    }
    SpecializationData { entries, data }
}

fn vk_module(library: &StageLibrary) -> vk::ShaderModule {
    match library {
        StageLibrary::Vulkan { module, .. } => *module,
        #[cfg(feature = "headless")]
        _ => panic!("stage library does not belong to the Vulkan backend"),
    }
}

fn reflect_blocks(
    uniform_blocks: &[BlockBinding],
    storage_blocks: &[BlockBinding],
    min_uniform_alignment: u32,
) -> PipelineReflection {
    let mut buffer_bindings = Vec::with_capacity(uniform_blocks.len() + storage_blocks.len());
    for block in uniform_blocks {
        let alignment = min_uniform_alignment.max(16);
        buffer_bindings.push(BufferBindingReflection {
            index: block.index,
            size: u64::from(block.declared_size.div_ceil(alignment) * alignment),
            alignment,
            active: block.declared_size > 0,
            stages: block.stages,
        });
    }
    for block in storage_blocks {
        buffer_bindings.push(BufferBindingReflection {
            index: block.index,
            size: u64::from(block.declared_size),
            alignment: 16,
            active: block.declared_size > 0,
            stages: block.stages,
        });
    }
    PipelineReflection { buffer_bindings }
}

/// Create a graphics pipeline from a resolved request.
pub fn create_render_pipeline(
    device: &ash::Device,
    request: &RenderPipelineRequest<'_>,
    min_uniform_alignment: u32,
) -> Result<CompiledPipeline, CompileDiagnostic> {
    let vertex_entry_c = CString::new(request.vertex.entry_point())
        .map_err(|e| CompileDiagnostic::new(format!("invalid entry point name: {e}")))?;
    let fragment_entry_c = match request.fragment {
        Some(fragment) => Some(
            CString::new(fragment.entry_point())
                .map_err(|e| CompileDiagnostic::new(format!("invalid entry point name: {e}")))?,
        ),
        None => None,
    };

    let spec = build_specialization(request.specialization);
    let spec_info = vk::SpecializationInfo::default()
        .map_entries(&spec.entries)
        .data(&spec.data);

    let mut shader_stages = vec![
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(vk_module(request.vertex))
            .name(&vertex_entry_c)
            .specialization_info(&spec_info),
    ];
    if let (Some(fragment), Some(entry)) = (request.fragment, fragment_entry_c.as_ref()) {
        shader_stages.push(
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(vk_module(fragment))
                .name(entry)
                .specialization_info(&spec_info),
        );
    }

    // Vertex buffers occupy their descriptor bindings; the shared null
    // buffer gets one zero-stride binding when any attribute points at it.
    let mut binding_descriptions: Vec<vk::VertexInputBindingDescription> = request
        .descriptor
        .vertex_buffers()
        .iter()
        .enumerate()
        .map(|(i, buffer)| {
            vk::VertexInputBindingDescription::default()
                .binding(i as u32)
                .stride(buffer.stride)
                .input_rate(match buffer.step {
                    StepFunction::PerInstance => vk::VertexInputRate::INSTANCE,
                    StepFunction::PerVertex | StepFunction::Constant => {
                        vk::VertexInputRate::VERTEX
                    }
                })
        })
        .collect();

    if request
        .attributes
        .iter()
        .any(|a| a.buffer_index == request.bases.null_buffer_index)
    {
        binding_descriptions.push(
            vk::VertexInputBindingDescription::default()
                .binding(request.bases.null_buffer_index)
                .stride(0)
                .input_rate(vk::VertexInputRate::VERTEX),
        );
    }

    let attribute_descriptions: Vec<vk::VertexInputAttributeDescription> = request
        .attributes
        .iter()
        .map(|attr| {
            vk::VertexInputAttributeDescription::default()
                .location(attr.location)
                .binding(attr.buffer_index)
                .format(convert_vertex_format(attr.format))
                .offset(attr.offset)
        })
        .collect();

    let vertex_input_state = vk::PipelineVertexInputStateCreateInfo::default()
        .vertex_binding_descriptions(&binding_descriptions)
        .vertex_attribute_descriptions(&attribute_descriptions);

    let input_assembly_state = vk::PipelineInputAssemblyStateCreateInfo::default()
        .topology(convert_primitive_class(request.primitive))
        .primitive_restart_enable(false);

    let viewport_state = vk::PipelineViewportStateCreateInfo::default()
        .viewport_count(1)
        .scissor_count(1);

    let rasterization_state = vk::PipelineRasterizationStateCreateInfo::default()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(request.fragment.is_none())
        .polygon_mode(vk::PolygonMode::FILL)
        .line_width(1.0)
        .cull_mode(vk::CullModeFlags::NONE)
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .depth_bias_enable(false);

    let multisample_state = vk::PipelineMultisampleStateCreateInfo::default()
        .sample_shading_enable(false)
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    let depth_format = request.descriptor.depth_format();
    let depth_stencil_state = vk::PipelineDepthStencilStateCreateInfo::default()
        .depth_test_enable(depth_format.has_depth())
        .depth_write_enable(depth_format.has_depth())
        .depth_compare_op(vk::CompareOp::LESS_OR_EQUAL)
        .depth_bounds_test_enable(false)
        .stencil_test_enable(false);

    let color_attachment_count = request.descriptor.color_attachment_count() as usize;
    let blend = request.descriptor.blend();
    let color_blend_attachments: Vec<vk::PipelineColorBlendAttachmentState> = (0
        ..color_attachment_count)
        .map(|_| {
            vk::PipelineColorBlendAttachmentState::default()
                .color_write_mask(convert_write_mask(blend.write_mask))
                .blend_enable(blend.enabled)
                .src_color_blend_factor(convert_blend_factor(blend.color_src))
                .dst_color_blend_factor(convert_blend_factor(blend.color_dst))
                .color_blend_op(convert_blend_op(blend.color_op))
                .src_alpha_blend_factor(convert_blend_factor(blend.alpha_src))
                .dst_alpha_blend_factor(convert_blend_factor(blend.alpha_dst))
                .alpha_blend_op(convert_blend_op(blend.alpha_op))
        })
        .collect();

    let color_blend_state = vk::PipelineColorBlendStateCreateInfo::default()
        .logic_op_enable(false)
        .attachments(&color_blend_attachments);

    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state =
        vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

    let color_attachment_formats: Vec<vk::Format> = request.descriptor.color_formats()
        [..color_attachment_count]
        .iter()
        .map(|f| convert_texture_format(*f))
        .collect();

    let mut rendering_info = vk::PipelineRenderingCreateInfo::default()
        .color_attachment_formats(&color_attachment_formats)
        .depth_attachment_format(convert_texture_format(depth_format));

    let layout_info = vk::PipelineLayoutCreateInfo::default();
    let layout = unsafe { device.create_pipeline_layout(&layout_info, None) }
        .map_err(|e| CompileDiagnostic::new(format!("Failed to create pipeline layout: {e:?}")))?;

    let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
        .stages(&shader_stages)
        .vertex_input_state(&vertex_input_state)
        .input_assembly_state(&input_assembly_state)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterization_state)
        .multisample_state(&multisample_state)
        .depth_stencil_state(&depth_stencil_state)
        .color_blend_state(&color_blend_state)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .push_next(&mut rendering_info);

    let pipelines = unsafe {
        device.create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
    }
    .map_err(|(_, e)| {
        unsafe { device.destroy_pipeline_layout(layout, None) };
        CompileDiagnostic::new(format!(
            "vkCreateGraphicsPipelines failed for '{}': {e:?}",
            request.label
        ))
    })?;

    Ok(CompiledPipeline {
        pipeline: GpuPipeline::Vulkan {
            device: device.clone(),
            pipeline: pipelines[0],
            layout,
        },
        reflection: reflect_blocks(
            request.uniform_blocks,
            request.storage_blocks,
            min_uniform_alignment,
        ),
        diagnostics: None,
    })
}

/// Create a compute pipeline from a resolved request.
///
/// The widened-threadgroup retry limit is advisory here: this driver
/// enforces workgroup limits at shader module granularity, so the request
/// value is only logged for parity with backends that honor it.
pub fn create_compute_pipeline(
    device: &ash::Device,
    request: &ComputePipelineRequest<'_>,
    min_uniform_alignment: u32,
) -> Result<CompiledPipeline, CompileDiagnostic> {
    let entry_c = CString::new(request.compute.entry_point())
        .map_err(|e| CompileDiagnostic::new(format!("invalid entry point name: {e}")))?;

    if let Some(limit) = request.max_total_threads {
        log::debug!(
            "Compute pipeline '{}' requested widened threadgroup limit {}",
            request.label,
            limit
        );
    }

    let spec = build_specialization(request.specialization);
    let spec_info = vk::SpecializationInfo::default()
        .map_entries(&spec.entries)
        .data(&spec.data);

    let stage = vk::PipelineShaderStageCreateInfo::default()
        .stage(vk::ShaderStageFlags::COMPUTE)
        .module(vk_module(request.compute))
        .name(&entry_c)
        .specialization_info(&spec_info);

    let layout_info = vk::PipelineLayoutCreateInfo::default();
    let layout = unsafe { device.create_pipeline_layout(&layout_info, None) }
        .map_err(|e| CompileDiagnostic::new(format!("Failed to create pipeline layout: {e:?}")))?;

    let pipeline_info = vk::ComputePipelineCreateInfo::default()
        .stage(stage)
        .layout(layout);

    let pipelines = unsafe {
        device.create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
    }
    .map_err(|(_, e)| {
        unsafe { device.destroy_pipeline_layout(layout, None) };
        CompileDiagnostic::new(format!(
            "vkCreateComputePipelines failed for '{}': {e:?}",
            request.label
        ))
    })?;

    Ok(CompiledPipeline {
        pipeline: GpuPipeline::Vulkan {
            device: device.clone(),
            pipeline: pipelines[0],
            layout,
        },
        reflection: reflect_blocks(
            request.uniform_blocks,
            request.storage_blocks,
            min_uniform_alignment,
        ),
        diagnostics: None,
    })
}

/// Convert a vertex attribute format to the native format.
pub fn convert_vertex_format(format: VertexFormat) -> vk::Format {
    match format {
        VertexFormat::F32 => vk::Format::R32_SFLOAT,
        VertexFormat::F32x2 => vk::Format::R32G32_SFLOAT,
        VertexFormat::F32x3 => vk::Format::R32G32B32_SFLOAT,
        VertexFormat::F32x4 => vk::Format::R32G32B32A32_SFLOAT,
        VertexFormat::I32 => vk::Format::R32_SINT,
        VertexFormat::I32x2 => vk::Format::R32G32_SINT,
        VertexFormat::I32x3 => vk::Format::R32G32B32_SINT,
        VertexFormat::I32x4 => vk::Format::R32G32B32A32_SINT,
        VertexFormat::U32 => vk::Format::R32_UINT,
        VertexFormat::U32x2 => vk::Format::R32G32_UINT,
        VertexFormat::U32x3 => vk::Format::R32G32B32_UINT,
        VertexFormat::U32x4 => vk::Format::R32G32B32A32_UINT,
        VertexFormat::Unorm8x4 => vk::Format::R8G8B8A8_UNORM,
        VertexFormat::Snorm8x4 => vk::Format::R8G8B8A8_SNORM,
        VertexFormat::Unorm8x3 => vk::Format::R8G8B8_UNORM,
    }
}

fn convert_texture_format(format: TextureFormat) -> vk::Format {
    match format {
        TextureFormat::Unknown => vk::Format::UNDEFINED,
        TextureFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        TextureFormat::Bgra8Unorm => vk::Format::B8G8R8A8_UNORM,
        TextureFormat::Rgba16Float => vk::Format::R16G16B16A16_SFLOAT,
        TextureFormat::Rgba32Float => vk::Format::R32G32B32A32_SFLOAT,
        TextureFormat::Rg11B10Float => vk::Format::B10G11R11_UFLOAT_PACK32,
        TextureFormat::Rgb10A2Unorm => vk::Format::A2B10G10R10_UNORM_PACK32,
        TextureFormat::Depth32Float => vk::Format::D32_SFLOAT,
        TextureFormat::Depth24PlusStencil8 => vk::Format::D24_UNORM_S8_UINT,
        TextureFormat::Stencil8 => vk::Format::S8_UINT,
    }
}

fn convert_primitive_class(primitive: PrimitiveClass) -> vk::PrimitiveTopology {
    match primitive {
        PrimitiveClass::Point => vk::PrimitiveTopology::POINT_LIST,
        PrimitiveClass::Line => vk::PrimitiveTopology::LINE_LIST,
        PrimitiveClass::Triangle => vk::PrimitiveTopology::TRIANGLE_LIST,
    }
}

fn convert_write_mask(mask: ColorWriteMask) -> vk::ColorComponentFlags {
    let mut flags = vk::ColorComponentFlags::empty();
    if mask.contains(ColorWriteMask::RED) {
        flags |= vk::ColorComponentFlags::R;
    }
    if mask.contains(ColorWriteMask::GREEN) {
        flags |= vk::ColorComponentFlags::G;
    }
    if mask.contains(ColorWriteMask::BLUE) {
        flags |= vk::ColorComponentFlags::B;
    }
    if mask.contains(ColorWriteMask::ALPHA) {
        flags |= vk::ColorComponentFlags::A;
    }
    flags
}

fn convert_blend_factor(factor: BlendFactor) -> vk::BlendFactor {
    match factor {
        BlendFactor::Zero => vk::BlendFactor::ZERO,
        BlendFactor::One => vk::BlendFactor::ONE,
        BlendFactor::SrcColor => vk::BlendFactor::SRC_COLOR,
        BlendFactor::OneMinusSrcColor => vk::BlendFactor::ONE_MINUS_SRC_COLOR,
        BlendFactor::SrcAlpha => vk::BlendFactor::SRC_ALPHA,
        BlendFactor::OneMinusSrcAlpha => vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
        BlendFactor::DstColor => vk::BlendFactor::DST_COLOR,
        BlendFactor::OneMinusDstColor => vk::BlendFactor::ONE_MINUS_DST_COLOR,
        BlendFactor::DstAlpha => vk::BlendFactor::DST_ALPHA,
        BlendFactor::OneMinusDstAlpha => vk::BlendFactor::ONE_MINUS_DST_ALPHA,
    }
}

fn convert_blend_op(op: BlendOp) -> vk::BlendOp {
    match op {
        BlendOp::Add => vk::BlendOp::ADD,
        BlendOp::Subtract => vk::BlendOp::SUBTRACT,
        BlendOp::ReverseSubtract => vk::BlendOp::REVERSE_SUBTRACT,
        BlendOp::Min => vk::BlendOp::MIN,
        BlendOp::Max => vk::BlendOp::MAX,
    }
}
