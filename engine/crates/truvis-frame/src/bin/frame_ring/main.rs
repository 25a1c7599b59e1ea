//! 在 headless 后端上跑几帧帧环，输出每帧的资源使用情况
//!
//! 可以在 `config/frame_settings.toml` 中修改帧数、page 大小与描述符预算。
//! `RUST_LOG=truvis_frame=trace` 可以看到每帧的轮转与等待。

use std::sync::Arc;

use truvis_crate_tools::init_log::init_log;
use truvis_crate_tools::resource::TruvisPath;
use truvis_frame::prelude::*;
use truvis_gfx::headless::HeadlessBackend;
use truvis_gfx::prelude::*;

const FRAME_COUNT: usize = 8;

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct PerFrameData {
    frame_id: u64,
    slot: u32,
    _padding: u32,
}

fn load_settings() -> anyhow::Result<FrameSettings> {
    let path = TruvisPath::config_path("frame_settings.toml");
    if path.exists() {
        Ok(FrameSettings::from_toml_file(&path)?)
    } else {
        log::info!("{} not found, use default frame settings", path.display());
        Ok(FrameSettings::default())
    }
}

fn main() -> anyhow::Result<()> {
    init_log();
    #[cfg(feature = "tracy")]
    tracy_client::Client::start();

    let settings = load_settings()?;
    let backend = Arc::new(HeadlessBackend::deferred());
    let mut ctx = FrameContext::new(backend.clone(), settings)?;
    ctx.queues().set_device_lost_callback(|| log::error!("device lost, stop rendering"));

    let fif = ctx.settings().frames_in_flight;
    let mut graphics = CommandList::new(backend.clone(), QueueKind::Graphics, fif, "frame-ring-graphics")?;
    let mut copy = CommandList::new(backend.clone(), QueueKind::Copy, fif, "frame-ring-copy")?;

    let material = ctx.descriptors_mut().allocate_persistent(DescriptorKind::RawOrStructuredView);
    log::info!("persistent material descriptor: {}", material);

    // 每帧更新的 buffer，由延迟释放回收
    let mut history = backend.create_buffer(&GfxBufferDesc::scratch(1024, 256, "history"))?;

    for _ in 0..FRAME_COUNT {
        ctx.begin_frame();
        let frame_name = ctx.frame_counter().frame_name();
        let slot = ctx.current_slot();

        let data = PerFrameData {
            frame_id: ctx.frame_counter().frame_id(),
            slot: slot as u32,
            _padding: 0,
        };
        let Some(constants) = ctx.temp_buffers_mut().allocate(size_of::<PerFrameData>() as u64, 256) else {
            anyhow::bail!("{} temp buffer exhausted", frame_name);
        };
        if !ctx.temp_buffers_mut().write_pod(&constants, 0, &data) {
            anyhow::bail!("{} failed to write per-frame constants", frame_name);
        }
        let constants_view = ctx.descriptors_mut().allocate_temporary(DescriptorKind::ConstantView);

        // 上传：temp buffer -> history
        let next_history = backend.create_buffer(&GfxBufferDesc::scratch(1024, 256, "history"))?;
        if copy.begin(ctx.queues()) {
            copy.add_buffer_barrier(
                GfxBufferBarrier::new(backend.buffer_handle(&next_history))
                    .transition(ResourceState::empty(), ResourceState::COPY_DEST),
            );
            copy.flush_barriers();
            copy.copy_buffer(&GfxBufferCopy {
                src: constants.buffer,
                src_offset: constants.offset,
                dst: backend.buffer_handle(&next_history),
                dst_offset: 0,
                size: constants.size,
            });
            copy.end();
        }
        let upload = ctx.submit(&mut [&mut copy], QueueKind::Copy);
        ctx.defer_destroy_buffer(std::mem::replace(&mut history, next_history));

        // 绘制：只记录状态转换
        if graphics.begin(ctx.queues()) {
            graphics.add_texture_barrier(
                GfxTextureBarrier::new(RawHandle(1))
                    .transition(ResourceState::PRESENT, ResourceState::RENDER_TARGET)
                    .aspect(TextureAspect::COLOR),
            );
            graphics.add_buffer_barrier(
                GfxBufferBarrier::new(backend.buffer_handle(&history))
                    .transition(ResourceState::COPY_DEST, ResourceState::SHADER_RESOURCE),
            );
            graphics.flush_barriers();
            graphics.add_texture_barrier(
                GfxTextureBarrier::new(RawHandle(1)).transition(ResourceState::RENDER_TARGET, ResourceState::PRESENT),
            );
            graphics.flush_barriers();
            graphics.end();
        }
        let draw = ctx.submit(&mut [&mut graphics], QueueKind::Graphics);

        log::info!(
            "{} slot {}: constants @{} ({} bytes), view {}, upload {}, draw {}",
            frame_name,
            slot,
            constants.offset,
            constants.size,
            constants_view,
            upload,
            draw
        );

        // 模拟 GPU 落后 CPU 一帧
        for kind in QueueKind::ALL {
            let submitted = backend.submitted(kind);
            backend.complete_up_to(kind, submitted.saturating_sub(1));
        }
    }

    ctx.defer_free_descriptor(material);
    ctx.defer_destroy_buffer(history);
    ctx.wait_for_idle();
    log::info!(
        "done: {} page(s), {} live buffer(s), {} submission(s)",
        ctx.temp_buffers().page_count(),
        backend.live_buffer_count(),
        backend.submissions().len()
    );

    drop(graphics);
    drop(copy);
    ctx.destroy();
    Ok(())
}
