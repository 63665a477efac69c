//! Headless walkthrough of the S5 "mipmap upload" scenario: a single
//! `writeToImage` call with four mip levels on a 64x64 image, recorded
//! through the encoder and inspected after decoding. No live `ash::Device`
//! is involved; this exercises the same encode/decode path
//! `Backend::update` drives, not the `vkCmdBlitImage` cascade itself (that
//! part genuinely needs a device, see `backend::frame::translate_write_to_image`).

use vkforge::command::decoder::CommandDecoder;
use vkforge::command::{RecordedCommand, WriteImageSettings};
use vkforge::handle::image_resource;

fn main() {
    pretty_env_logger::try_init().ok();

    let mut scratch = vkforge::alloc::LinearAllocator::new(4096, None);
    let staging = vkforge::alloc::StagingAllocator::new();
    let mut encoder = vkforge::command::CommandEncoder::new(&mut scratch, &staging, (64, 64));

    let dst = image_resource("albedo");
    let texels = vec![0x80u8; 64 * 64 * 4];
    encoder.write_to_image(dst, WriteImageSettings { num_miplevels: 4, array_layer: 0, width: 64, height: 64 }, &texels);

    let stream = encoder.finish();
    let commands: Vec<RecordedCommand> = CommandDecoder::new(&stream).collect();
    assert_eq!(commands.len(), 1, "writeToImage is a single stream record; the mip cascade is synthesized at decode time");

    match &commands[0] {
        RecordedCommand::WriteToImage { dst: decoded_dst, settings, bytes, .. } => {
            assert_eq!(*decoded_dst, dst);
            assert_eq!(settings.num_miplevels, 4);
            assert_eq!(bytes.len(), 64 * 64 * 4);
            println!(
                "decoded WriteToImage: {}x{} base level, {} mip levels, {} payload bytes",
                settings.width,
                settings.height,
                settings.num_miplevels,
                bytes.len()
            );
            println!("at submission time this expands into: one host->transfer buffer barrier,");
            println!("one undefined->transferDstOptimal image barrier over all 4 levels, one");
            println!("buffer->image copy into level 0, then 3 blits (0->1, 1->2, 2->3) each preceded");
            println!("by a transferDst->transferSrc transition, ending with every level transitioned");
            println!("to shaderReadOnlyOptimal -- see backend::frame::translate_write_to_image.");
        }
        other => panic!("expected WriteToImage, got {:?}", other),
    }
}
