//! Headless walkthrough of the S1 "triangle" scenario: a single graphics
//! root pass clearing the swapchain image and drawing three vertices.
//! No live `ash::Device` is involved -- this exercises the frame-graph
//! resolver, the sync-chain planner, and the command stream encoder/decoder
//! the way `Backend::update` would, against a fixed 1024x1024 swapchain
//! extent, and prints what the resolver and planner decided.

use vkforge::command::decoder::CommandDecoder;
use vkforge::command::RecordedCommand;
use vkforge::graph;
use vkforge::handle::ResourceHandle;
use vkforge::module::RenderModule;
use vkforge::pass::{QueueKind, RenderPass};
use vkforge::sync;

fn main() {
    pretty_env_logger::try_init().ok();

    let swapchain_image = ResourceHandle::swapchain_image("present");

    let root = RenderPass::new("triangle", QueueKind::Graphics)
        .set_width(1024)
        .set_height(1024)
        .add_color_attachment(
            swapchain_image,
            ash::vk::AttachmentLoadOp::CLEAR,
            ash::vk::AttachmentStoreOp::STORE,
            ash::vk::ClearValue { color: ash::vk::ClearColorValue { float32: [0.0, 0.0, 0.0, 0.0] } },
        )
        .set_execute_callback(|encoder| {
            encoder.bind_graphics_pipeline(0xC0FFEE);
            let positions: [[f32; 3]; 3] = [[-50.0, -50.0, 0.0], [50.0, -50.0, 0.0], [0.0, 50.0, 0.0]];
            let colors: [[f32; 3]; 3] = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];
            encoder.set_vertex_data(as_bytes(&positions), 0);
            encoder.set_vertex_data(as_bytes(&colors), 1);
            encoder.draw(3, 1, 0, 0);
        });

    let mut module = RenderModule::new();
    module.add_pass(root);

    let (passes, _declared) = module.clone_for_frame();
    let resolved = graph::resolve_and_patch(passes, (1024, 1024)).expect("resolver should accept a single root pass");
    assert_eq!(resolved.passes.len(), 1, "S1 has exactly one surviving pass");
    assert_eq!(resolved.subgraphs.len(), 1, "S1 is one submission");

    let plan = sync::plan_sync(&resolved.passes, &std::collections::HashMap::new());
    let chain = plan.chain_for(swapchain_image).expect("swapchain image must appear in the sync chain");
    println!("swapchain sync chain has {} entries, final layout = {:?}", chain.len(), chain.last().unwrap().image_layout);
    assert_eq!(chain.last().unwrap().image_layout, ash::vk::ImageLayout::PRESENT_SRC_KHR);

    let mut scratch = vkforge::alloc::LinearAllocator::new(64 * 1024, None);
    let staging = vkforge::alloc::StagingAllocator::new();
    let mut encoder = vkforge::command::CommandEncoder::new(&mut scratch, &staging, (1024, 1024));
    for callback in &resolved.passes[0].data().execute_callbacks {
        callback(&mut encoder);
    }
    let stream = encoder.finish();

    let commands: Vec<RecordedCommand> = CommandDecoder::new(&stream).collect();
    println!("recorded {} commands for the triangle pass:", commands.len());
    for command in &commands {
        println!("  {:?}", command);
    }
    assert!(matches!(commands.last(), Some(RecordedCommand::Draw { vertex_count: 3, instance_count: 1, .. })));
}

fn as_bytes<T>(slice: &[T]) -> &[u8] {
    unsafe { std::slice::from_raw_parts(slice.as_ptr() as *const u8, std::mem::size_of_val(slice)) }
}
