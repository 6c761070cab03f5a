use criterion::{black_box, criterion_group, criterion_main, Criterion};

use amaranth_gpu::shader::{ShaderAttribute, ShaderStageFlags, UniformBlockInfo};
use amaranth_gpu::{
    ContextDescriptor, GpuContext, PipelineDescriptor, PrimitiveClass, RenderGraph,
    ResourceAccessSet, ShaderCreateInfo, ShaderInterface, StepFunction, TextureFormat,
    VertexAttribute, VertexFormat,
};

fn bench_interface() -> ShaderInterface {
    let mut interface = ShaderInterface::new();
    interface.attributes.push(ShaderAttribute {
        name: "position".into(),
        location: 0,
        format: VertexFormat::F32x3,
    });
    interface.uniform_blocks.push(UniformBlockInfo {
        name: "SceneData".into(),
        slot: 0,
        size: 128,
        stages: ShaderStageFlags::VERTEX,
    });
    interface
}

fn bench_descriptor(seed: u32) -> PipelineDescriptor {
    let mut descriptor = PipelineDescriptor::new();
    let buffer = descriptor.add_vertex_buffer(12 + seed % 4, StepFunction::PerVertex);
    descriptor.add_attribute(VertexAttribute {
        location: 0,
        format: VertexFormat::F32x3,
        offset: 0,
        buffer_index: buffer,
    });
    descriptor.set_color_format(0, TextureFormat::Rgba8Unorm);
    descriptor.finalized()
}

// ---------------------------------------------------------------------------
// Pipeline state cache
// ---------------------------------------------------------------------------

fn bench_pso_cache_hit(c: &mut Criterion) {
    let ctx = GpuContext::new(&ContextDescriptor::headless()).unwrap();
    let mut info = ShaderCreateInfo::new("bench")
        .with_vertex("fn main() {}")
        .with_interface(bench_interface());
    info.finalize();
    let shader = ctx.shader_alloc(info).unwrap();
    let descriptor = bench_descriptor(0);
    shader
        .bake_pipeline_state(&ctx, PrimitiveClass::Triangle, &descriptor)
        .unwrap();

    c.bench_function("pso_cache_hit", |b| {
        b.iter(|| {
            let instance = shader
                .bake_pipeline_state(&ctx, PrimitiveClass::Triangle, &descriptor)
                .unwrap();
            black_box(instance);
        });
    });
}

fn bench_pso_cache_miss(c: &mut Criterion) {
    let ctx = GpuContext::new(&ContextDescriptor::headless()).unwrap();

    c.bench_function("pso_cache_bake_16_variants", |b| {
        b.iter(|| {
            let mut info = ShaderCreateInfo::new("bench_miss")
                .with_vertex("fn main() {}")
                .with_interface(bench_interface());
            info.finalize();
            let shader = ctx.shader_alloc(info).unwrap();
            for seed in 0..16 {
                let descriptor = bench_descriptor(seed);
                black_box(
                    shader
                        .bake_pipeline_state(&ctx, PrimitiveClass::Triangle, &descriptor)
                        .unwrap(),
                );
            }
        });
    });
}

// ---------------------------------------------------------------------------
// Render graph hazard tracking
// ---------------------------------------------------------------------------

fn bench_graph_hazard_chain(c: &mut Criterion) {
    let ctx = GpuContext::new(&ContextDescriptor::headless()).unwrap();
    let mut info = ShaderCreateInfo::new("bench_cs").with_compute("fn main() {}");
    info.finalize();
    let shader = ctx.shader_alloc(info).unwrap();
    let pipeline = shader
        .bake_compute_pipeline_state(&ctx, &amaranth_gpu::SpecializationValues::new(), 64)
        .unwrap();

    let buffer = ctx.buffer_alloc("ping_pong", 4096).handle();

    c.bench_function("render_graph_32_node_chain", |b| {
        b.iter(|| {
            let mut graph = RenderGraph::new();
            for i in 0..32 {
                graph.add_dispatch(
                    format!("node_{i}"),
                    pipeline.clone(),
                    [8, 1, 1],
                    ResourceAccessSet::new().reads_writes(buffer),
                );
            }
            black_box(graph.compile().unwrap());
        });
    });
}

criterion_group!(
    benches,
    bench_pso_cache_hit,
    bench_pso_cache_miss,
    bench_graph_hazard_chain
);
criterion_main!(benches);
