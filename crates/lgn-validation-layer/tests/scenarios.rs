//! End-to-end scenarios over the full layer on the null device.

use std::sync::{Arc, Mutex};

use lgn_gpu_api::backends::null::NullDevice;
use lgn_gpu_api::QueueType;
use lgn_instrumentation::UnstableExportFeature;
use lgn_resource_mapping::{texel_offset, VirtualResourceMapping};
use lgn_shader_compiler::ShaderSource;
use lgn_spirv::{spec, SpirvModule};
use lgn_validation_bridge::BridgeListener;
use lgn_validation_config::LayerConfig;
use lgn_validation_layer::{LayerContext, ResourceDesc};
use lgn_validation_messages::diagnostic::{ShaderSourceMappingMessage, UnstableExportMessage};
use lgn_validation_messages::instrumentation::SetGlobalInstrumentationMessage;
use lgn_validation_messages::{Message, MessageStream};

fn test_config() -> LayerConfig {
    LayerConfig {
        texel_capacity: 1 << 16,
        shader_worker_count: 2,
        pipeline_worker_count: 2,
        ..LayerConfig::default()
    }
}

fn layer() -> (NullDevice, Arc<LayerContext>) {
    let device = NullDevice::new();
    let context = LayerContext::new(device.context(), &test_config()).unwrap();
    (device, context)
}

/// A compute module storing a float constant, the smallest shape the
/// stability check instruments.
fn float_store_module() -> Vec<u8> {
    let words = [
        spec::MAGIC,
        0x0001_0000,
        0,
        20,
        0,
        spec::pack_op(spec::OP_CAPABILITY, 2),
        1,
        spec::pack_op(spec::OP_MEMORY_MODEL, 3),
        0,
        1,
        spec::pack_op(spec::OP_ENTRY_POINT, 4),
        5,
        1,
        0x0000_006d,
        spec::pack_op(spec::OP_TYPE_VOID, 2),
        2,
        spec::pack_op(spec::OP_TYPE_FUNCTION, 3),
        3,
        2,
        spec::pack_op(spec::OP_TYPE_FLOAT, 3),
        4,
        32,
        spec::pack_op(spec::OP_TYPE_INT, 4),
        5,
        32,
        0,
        spec::pack_op(spec::OP_CONSTANT, 4),
        4,
        6,
        0x3f80_0000,
        spec::pack_op(spec::OP_TYPE_POINTER, 4),
        7,
        spec::STORAGE_CLASS_PRIVATE,
        4,
        spec::pack_op(spec::OP_VARIABLE, 4),
        7,
        8,
        spec::STORAGE_CLASS_PRIVATE,
        spec::pack_op(spec::OP_FUNCTION, 5),
        2,
        1,
        0,
        3,
        spec::pack_op(spec::OP_LABEL, 2),
        9,
        spec::pack_op(spec::OP_STORE, 3),
        8,
        6,
        spec::pack_op(spec::OP_RETURN, 1),
        spec::pack_op(spec::OP_FUNCTION_END, 1),
    ];
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

fn send_global(context: &LayerContext, bits: u64) {
    let mut stream = MessageStream::typed::<SetGlobalInstrumentationMessage>();
    stream.add(&SetGlobalInstrumentationMessage {
        feature_bit_set: bits,
        specialization: Vec::new(),
    });
    context.bridge().add_stream(stream);
    context.bridge().commit();
    context.controller().wait_for_completion();
}

#[test]
fn test_prmt_write_then_read_through_device() {
    let (_device, context) = layer();

    let puid = context
        .create_resource(ResourceDesc::buffer(1024, Some("staging")))
        .unwrap();

    let segment = context.allocate_descriptor_segment(16).unwrap();
    context.write_descriptor(segment, 5, puid).unwrap();

    let queue_state = context.allocate_queue_state(QueueType::Compute).unwrap();
    let (command_buffer, mut state) = context.begin_command_buffer();
    context
        .submit(&queue_state, std::slice::from_ref(&command_buffer), &mut state)
        .unwrap();

    // What an instrumented shader loading the absolute offset observes.
    let view = context.resource_table().segment_view(segment);
    let mut bytes = [0u8; VirtualResourceMapping::BYTE_SIZE];
    context
        .resource_table()
        .device_buffer()
        .read(
            u64::from(view.offset + 5) * VirtualResourceMapping::BYTE_SIZE as u64,
            &mut bytes,
        )
        .unwrap();

    assert_eq!(VirtualResourceMapping::decode(&bytes).token.puid, puid);
    context.sync_point();
}

#[test]
fn test_texel_write_sets_expected_bit() {
    let (_device, context) = layer();

    let desc = ResourceDesc::texture_2d(16, 16, 1, Some("shadow-mask"));
    let info = desc.info;
    let puid = context.create_resource(desc).unwrap();
    let allocation = context.texel_allocation(puid).unwrap();

    let offset = texel_offset(&info, 0, 0, 3, 7, 0);
    let word_index = (offset / 32) as u32;
    let bit = offset % 32;
    assert_eq!(word_index, 3);
    assert_eq!(bit, 19);

    let buffer = context.texel_allocator().buffer();
    let word_address = u64::from(allocation.data_base_dword() + word_index) * 4;

    // All bits clear after initialization.
    let mut word = [0u8; 4];
    buffer.read(word_address, &mut word).unwrap();
    assert_eq!(u32::from_le_bytes(word), 0);

    // A shader write atomically ors the texel's bit in.
    let value = u32::from_le_bytes(word) | (1 << bit);
    buffer.write(word_address, &value.to_le_bytes()).unwrap();

    buffer.read(word_address, &mut word).unwrap();
    assert_eq!(u32::from_le_bytes(word), 1 << 19);
}

#[test]
fn test_destroying_a_resource_invalidates_its_descriptors() {
    let (_device, context) = layer();

    let puid = context
        .create_resource(ResourceDesc::buffer(64, Some("transient")))
        .unwrap();
    let segment = context.allocate_descriptor_segment(8).unwrap();
    context.write_descriptor(segment, 2, puid).unwrap();

    assert_eq!(
        context.resource_table().get_mapping(segment, 2).token.puid,
        puid
    );

    context.destroy_resource(puid).unwrap();
    assert!(!context
        .resource_table()
        .get_mapping(segment, 2)
        .token
        .is_valid());
}

#[derive(Default)]
struct ExportInbox {
    records: Mutex<Vec<UnstableExportMessage>>,
    mappings: Mutex<Vec<ShaderSourceMappingMessage>>,
}

impl BridgeListener for ExportInbox {
    fn handle(&self, streams: &[MessageStream]) {
        for stream in streams {
            if stream.schema().message_id == UnstableExportMessage::ID {
                self.records
                    .lock()
                    .unwrap()
                    .extend(stream.decode_all::<UnstableExportMessage>().unwrap());
            }
            if stream.schema().message_id == ShaderSourceMappingMessage::ID {
                self.mappings
                    .lock()
                    .unwrap()
                    .extend(stream.decode_all::<ShaderSourceMappingMessage>().unwrap());
            }
        }
    }
}

#[test]
fn test_instrumented_pipeline_exports_end_to_end() {
    let (device, context) = layer();

    let inbox = Arc::new(ExportInbox::default());
    context
        .bridge()
        .register(UnstableExportMessage::ID, inbox.clone());
    context
        .bridge()
        .register(ShaderSourceMappingMessage::ID, inbox.clone());

    let (shader_guid, _original) = context
        .register_shader(ShaderSource::SpirV(float_store_module()))
        .unwrap();
    let pipeline = context
        .register_compute_pipeline(shader_guid, Some("FillPass"))
        .unwrap();

    // Enable the stability feature and wait for the wave to commit.
    send_global(&context, UnstableExportFeature::FEATURE_BIT);
    assert_ne!(pipeline.bound_object(), pipeline.original());

    // The instrumented binary is valid SPIR-V carrying the export
    // plumbing and the preserved original store.
    let shader_state = context.shader_state(shader_guid).unwrap();
    let instrument = shader_state
        .instrument(shader_state.instrumentation_key(UnstableExportFeature::FEATURE_BIT))
        .unwrap();
    let instrumented_code = device.shader_code(instrument).unwrap();
    let reparsed = SpirvModule::parse(&instrumented_code, 0).unwrap();
    assert!(reparsed
        .instructions()
        .iter()
        .any(|i| i.opcode == spec::OP_ATOMIC_I_ADD));
    assert!(reparsed
        .instructions()
        .iter()
        .any(|i| i.opcode == spec::OP_IS_NAN));

    // The bound sguid is flushed as a source mapping at the sync point.
    context.sync_point();
    let mapping = {
        let mappings = inbox.mappings.lock().unwrap();
        assert_eq!(mappings.len(), 1);
        mappings[0].clone()
    };
    assert_eq!(mapping.shader_guid, shader_guid);

    // Drive a dispatch whose "shader" exports one unstable-export record,
    // the way the injected detour would on a NaN store.
    let export_id = context.unstable_export().export_id();
    let streamer = Arc::clone(context.streamer());
    let sguid = mapping.sguid;
    device.set_dispatch_hook(
        pipeline.bound_object(),
        Box::new(move |_| {
            let bindings = streamer.executing_bindings().expect("segment bound");
            bindings
                .write_record(export_id, &[sguid, 1, 0, 0])
                .unwrap();
        }),
    );

    let queue_state = context.allocate_queue_state(QueueType::Compute).unwrap();
    let (mut command_buffer, mut state) = context.begin_command_buffer();
    context.bind_pipeline(&mut command_buffer, &mut state, &pipeline);
    command_buffer.dispatch([1, 1, 1]);
    context
        .submit(&queue_state, std::slice::from_ref(&command_buffer), &mut state)
        .unwrap();

    context.sync_point();

    let records = inbox.records.lock().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].sguid, sguid);
    assert_eq!(records[0].is_nan, 1);

    // Disabling reverts to the original object.
    drop(records);
    send_global(&context, 0);
    assert_eq!(pipeline.bound_object(), pipeline.original());
}

/// A minimal DXIL chunk: one module block with a version record.
fn minimal_dxil_chunk() -> Vec<u8> {
    let mut w = lgn_dxbc::BitstreamWriter::new();
    w.write(1, 2); // enter subblock
    w.write_vbr(lgn_dxbc::BLOCK_MODULE, 8);
    w.write_vbr(4, 4);
    w.align32();
    let length_at = w.reserve_word();
    let body_start = w.bit_pos();
    w.write(3, 4); // unabbreviated record
    w.write_vbr(1, 6);
    w.write_vbr(1, 6);
    w.write_vbr(2, 6);
    w.write(0, 4); // end block
    w.align32();
    let words = ((w.bit_pos() - body_start) / 32) as u32;
    w.patch_word(length_at, words);

    let mut bitcode = lgn_dxbc::BITCODE_MAGIC.to_vec();
    bitcode.extend_from_slice(&w.into_bytes());

    let mut chunk = Vec::new();
    chunk.extend_from_slice(&1u32.to_le_bytes());
    chunk.extend_from_slice(&0u32.to_le_bytes());
    chunk.extend_from_slice(&lgn_dxbc::DXIL_MAGIC.to_le_bytes());
    chunk.extend_from_slice(&0x102u32.to_le_bytes());
    chunk.extend_from_slice(&16u32.to_le_bytes());
    chunk.extend_from_slice(&(bitcode.len() as u32).to_le_bytes());
    chunk.resize(lgn_dxbc::PROGRAM_HEADER_SIZE, 0);
    chunk.extend_from_slice(&bitcode);
    let dwords = (chunk.len() / 4) as u32;
    chunk[4..8].copy_from_slice(&dwords.to_le_bytes());
    chunk
}

fn dxbc_container() -> Vec<u8> {
    // Empty validation table: four runtime-info bytes, zero resources.
    let mut psv = Vec::new();
    psv.extend_from_slice(&4u32.to_le_bytes());
    psv.extend_from_slice(&[0u8; 4]);
    psv.extend_from_slice(&0u32.to_le_bytes());

    let chunks: Vec<(u32, Vec<u8>)> = vec![
        (lgn_dxbc::FOURCC_DXIL, minimal_dxil_chunk()),
        (lgn_dxbc::FOURCC_PSV0, psv),
        (u32::from_le_bytes(*b"ZZZZ"), b"preserved".to_vec()),
    ];

    let chunk_count = chunks.len();
    let payload: usize = chunks.iter().map(|(_, d)| 8 + d.len()).sum();
    let total = 32 + chunk_count * 4 + payload;

    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&lgn_dxbc::CONTAINER_MAGIC.to_le_bytes());
    out.extend_from_slice(&[0u8; 16]);
    out.extend_from_slice(&1u32.to_le_bytes());
    out.extend_from_slice(&(total as u32).to_le_bytes());
    out.extend_from_slice(&(chunk_count as u32).to_le_bytes());

    let mut offset = 32 + chunk_count * 4;
    for (_, data) in &chunks {
        out.extend_from_slice(&(offset as u32).to_le_bytes());
        offset += 8 + data.len();
    }
    for (fourcc, data) in &chunks {
        out.extend_from_slice(&fourcc.to_le_bytes());
        out.extend_from_slice(&(data.len() as u32).to_le_bytes());
        out.extend_from_slice(data);
    }

    lgn_dxbc::sign_with_bypass(&mut out).unwrap();
    out
}

#[test]
fn test_dxbc_pipeline_instrumentation_rewrites_container() {
    let (device, context) = layer();

    let container = dxbc_container();
    let (shader_guid, _original) = context
        .register_shader(ShaderSource::Dxbc(container.clone()))
        .unwrap();
    let pipeline = context
        .register_compute_pipeline(shader_guid, Some("RasterPrep"))
        .unwrap();

    send_global(&context, UnstableExportFeature::FEATURE_BIT);
    assert_ne!(pipeline.bound_object(), pipeline.original());

    // The instrumented driver object carries a restitched, re-signed
    // container whose validation table declares the layer's registers.
    let shader_state = context.shader_state(shader_guid).unwrap();
    let instrument = shader_state
        .instrument(shader_state.instrumentation_key(UnstableExportFeature::FEATURE_BIT))
        .unwrap();
    let instrumented_code = device.shader_code(instrument).unwrap();
    assert_ne!(instrumented_code, container);

    let reparsed = lgn_dxbc::DxbcModule::parse(&instrumented_code, 0).unwrap();
    let psv_chunk = reparsed
        .chunk(lgn_dxbc::ChunkKind::PipelineStateValidation)
        .unwrap();
    let psv = lgn_dxbc::PsvBlock::parse(reparsed.chunk_data(psv_chunk)).unwrap();
    assert_eq!(psv.bindings().len(), 6);
    assert!(psv.bindings().iter().all(|b| b.space == 1000));

    // The DXIL payload survived re-emission byte for byte and still
    // scans; unexposed chunks survived verbatim.
    let dxil_chunk = reparsed.chunk(lgn_dxbc::ChunkKind::Dxil).unwrap();
    assert_eq!(reparsed.chunk_data(dxil_chunk), minimal_dxil_chunk());
    assert!(lgn_dxbc::DxilChunk::parse(reparsed.chunk_data(dxil_chunk))
        .unwrap()
        .module_block()
        .is_some());
    let unexposed = reparsed.chunk(lgn_dxbc::ChunkKind::Unexposed).unwrap();
    assert_eq!(reparsed.chunk_data(unexposed), b"preserved");

    // Disabling reverts to the original object.
    send_global(&context, 0);
    assert_eq!(pipeline.bound_object(), pipeline.original());
}

#[test]
fn test_uninstrumented_submissions_are_transparent() {
    let (_device, context) = layer();

    let (shader_guid, _) = context
        .register_shader(ShaderSource::SpirV(float_store_module()))
        .unwrap();
    let pipeline = context
        .register_compute_pipeline(shader_guid, Some("Passthrough"))
        .unwrap();

    // No features active: the original object is recorded.
    let queue_state = context.allocate_queue_state(QueueType::Graphics).unwrap();
    let (mut command_buffer, mut state) = context.begin_command_buffer();
    let bound = context.bind_pipeline(&mut command_buffer, &mut state, &pipeline);
    assert_eq!(bound, pipeline.original());

    context
        .submit(&queue_state, std::slice::from_ref(&command_buffer), &mut state)
        .unwrap();
    context.sync_point();
}
