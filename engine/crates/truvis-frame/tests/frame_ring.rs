//! 在 headless 后端上完整地跑帧环

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use truvis_frame::frame_settings::DescriptorCounts;
use truvis_frame::prelude::*;
use truvis_gfx::headless::{HeadlessBackend, HeadlessCommand};
use truvis_gfx::prelude::*;

const PAGE: u64 = 4096;

fn settings(frames_in_flight: usize) -> FrameSettings {
    FrameSettings {
        frames_in_flight,
        swapchain_image_count: frames_in_flight,
        page_size: PAGE,
        persistent_pages_per_frame: 1,
        descriptors: DescriptorBudget {
            max_persistent: DescriptorCounts::uniform(16),
            max_temp_per_frame: DescriptorCounts::uniform(4),
        },
    }
}

/// 记录一个只读取 `sources` 的 copy list
fn record_reads(
    ctx: &FrameContext<HeadlessBackend>,
    list: &mut CommandList<HeadlessBackend>,
    sources: &[TempBuffer],
) {
    assert!(list.begin(ctx.queues()));
    for temp in sources {
        list.copy_buffer(&GfxBufferCopy {
            src: temp.buffer,
            src_offset: temp.offset,
            dst: RawHandle(0xDEAD),
            dst_offset: 0,
            size: temp.size,
        });
    }
    assert!(list.end());
}

#[test]
fn test_frame_rotation_never_releases_in_flight_pages() {
    const FIF: usize = 3;

    let backend = Arc::new(HeadlessBackend::deferred());
    let last_use = Arc::new(Mutex::new(HashMap::<RawHandle, Receipt>::new()));
    let violations = Arc::new(Mutex::new(Vec::<String>::new()));
    let released = Arc::new(AtomicUsize::new(0));
    {
        let last_use = last_use.clone();
        let violations = violations.clone();
        let released = released.clone();
        backend.set_release_hook(move |release| {
            let Some(receipt) = last_use.lock().unwrap().get(&release.buffer).copied() else {
                return;
            };
            released.fetch_add(1, Ordering::SeqCst);
            let completed = release.completed[receipt.queue().index()];
            if completed < receipt.value() {
                violations
                    .lock()
                    .unwrap()
                    .push(format!("{:?} released at {} while used by {}", release.buffer, completed, receipt));
            }
        });
    }

    let mut ctx = FrameContext::new(backend.clone(), settings(FIF)).unwrap();
    let mut list = CommandList::new(backend.clone(), QueueKind::Copy, FIF, "upload").unwrap();
    // 临时描述符索引 -> 上一次使用它的提交
    let mut descriptor_use = HashMap::<u32, Receipt>::new();
    let mut reissued = 0;

    for frame in 1..=(3 * FIF as u64 + 1) {
        ctx.begin_frame();
        let slot = ctx.current_slot();
        for receipt in ctx.slot_receipts(slot) {
            assert!(ctx.queues().is_complete(*receipt), "frame {}: {} not complete", frame, receipt);
        }
        // GPU 最多落后 FIF - 1 帧
        let in_flight = backend.submitted(QueueKind::Copy) - backend.completed(QueueKind::Copy);
        assert_eq!(in_flight, (frame - 1).min(FIF as u64 - 1), "frame {}", frame);

        let temps = ctx.temp_buffers_mut();
        let sources = [
            temps.allocate(PAGE, 16).unwrap(),
            // 溢出 page
            temps.allocate(PAGE / 2, 16).unwrap(),
            // 大 page
            temps.allocate(PAGE * 2, 16).unwrap(),
        ];

        // 重新分配到的临时描述符，上一次使用它的工作必须已经完成
        let views = (0..2)
            .map(|_| ctx.descriptors_mut().allocate_temporary(DescriptorKind::ConstantView))
            .collect::<Vec<_>>();
        for view in &views {
            assert!(!view.is_null());
            if let Some(previous) = descriptor_use.get(&view.index()) {
                reissued += 1;
                assert!(
                    ctx.queues().is_complete(*previous),
                    "frame {}: descriptor {} reissued while {} is in flight",
                    frame,
                    view.index(),
                    previous
                );
            }
        }

        record_reads(&ctx, &mut list, &sources);
        let receipt = ctx.submit(&mut [&mut list], QueueKind::Copy);
        assert!(!receipt.is_null());
        for view in &views {
            descriptor_use.insert(view.index(), receipt);
        }

        let mut last_use = last_use.lock().unwrap();
        for temp in &sources {
            last_use.insert(temp.buffer, receipt);
        }
    }

    assert!(violations.lock().unwrap().is_empty(), "{:?}", violations.lock().unwrap());
    assert!(released.load(Ordering::SeqCst) >= 2 * 2 * FIF);
    assert!(reissued >= 2 * 2 * FIF);

    drop(list);
    ctx.destroy();
    assert!(violations.lock().unwrap().is_empty(), "{:?}", violations.lock().unwrap());
    assert_eq!(backend.live_buffer_count(), 0);
}

#[test]
fn test_deferred_release_covers_direct_submissions() {
    let backend = Arc::new(HeadlessBackend::deferred());
    let mut ctx = FrameContext::new(backend.clone(), settings(2)).unwrap();
    let mut list = CommandList::new(backend.clone(), QueueKind::Graphics, 2, "main").unwrap();

    let buffer = backend.create_buffer(&GfxBufferDesc::scratch(256, 256, "shared")).unwrap();
    let handle = backend.buffer_handle(&buffer);
    let destroyed_at = Arc::new(Mutex::new(None));
    {
        let destroyed_at = destroyed_at.clone();
        backend.set_release_hook(move |release| {
            if release.buffer == handle {
                *destroyed_at.lock().unwrap() = Some(release.completed[QueueKind::Graphics.index()]);
            }
        });
    }

    // 绕过 FrameContext::submit 直接提交到队列
    ctx.begin_frame();
    record_reads(&ctx, &mut list, &[]);
    let used_by = ctx.queues().submit_commands(&mut [&mut list], QueueKind::Graphics);
    ctx.defer_destroy_buffer(buffer);

    ctx.begin_frame();
    assert!(destroyed_at.lock().unwrap().is_none());
    ctx.begin_frame();
    let completed = destroyed_at.lock().unwrap().expect("buffer released");
    assert!(completed >= used_by.value());
}

#[test]
fn test_descriptors_across_frames() {
    let backend = Arc::new(HeadlessBackend::immediate());
    let mut ctx = FrameContext::new(backend, settings(2)).unwrap();
    let kind = DescriptorKind::TextureReadView;

    let persistent = (0..4).map(|_| ctx.descriptors_mut().allocate_persistent(kind)).collect::<Vec<_>>();

    ctx.begin_frame();
    let frame_a = (0..4).map(|_| ctx.descriptors_mut().allocate_temporary(kind)).collect::<Vec<_>>();
    assert!(ctx.descriptors_mut().allocate_temporary(kind).is_null());

    ctx.begin_frame();
    let frame_b = (0..4).map(|_| ctx.descriptors_mut().allocate_temporary(kind)).collect::<Vec<_>>();

    let mut all = persistent.iter().chain(&frame_a).chain(&frame_b).map(|d| d.index()).collect::<Vec<_>>();
    assert!(all.iter().all(|index| *index < ctx.descriptors().capacity(kind)));
    all.sort_unstable();
    all.dedup();
    assert_eq!(all.len(), 12);

    // 延迟释放两个持久描述符，轮转一圈之后按 LIFO 复用
    ctx.defer_free_descriptor(persistent[1]);
    ctx.defer_free_descriptor(persistent[2]);
    ctx.begin_frame();
    ctx.begin_frame();
    assert_eq!(ctx.descriptors_mut().allocate_persistent(kind), persistent[2]);
    assert_eq!(ctx.descriptors_mut().allocate_persistent(kind), persistent[1]);
}

#[test]
fn test_linear_allocation_and_large_page() {
    let backend = Arc::new(HeadlessBackend::immediate());
    let mut ctx = FrameContext::new(backend, settings(2)).unwrap();
    ctx.begin_frame();

    let temps = ctx.temp_buffers_mut();
    let first = temps.allocate(100, 4).unwrap();
    let cursor = temps.cursor();
    let large = temps.allocate(PAGE * 4, 256).unwrap();
    assert_eq!(temps.cursor(), cursor);
    assert_eq!(large.size, PAGE * 4);
    assert_ne!(large.buffer, first.buffer);

    let second = temps.allocate(100, 256).unwrap();
    assert_eq!(second.buffer, first.buffer);
    assert!(second.offset >= first.offset + first.size);
    assert_eq!(second.offset % 256, 0);
}

#[test]
fn test_barrier_batch_overflow_through_queue() {
    let backend = Arc::new(HeadlessBackend::immediate());
    let mut ctx = FrameContext::new(backend.clone(), settings(2)).unwrap();
    let mut list = CommandList::new(backend.clone(), QueueKind::Graphics, 2, "barriers").unwrap();

    ctx.begin_frame();
    assert!(list.begin(ctx.queues()));
    for i in 0..=MAX_BATCHED_BARRIERS as u64 {
        let barrier = GfxTextureBarrier::new(RawHandle(i + 1))
            .transition(ResourceState::RENDER_TARGET, ResourceState::SHADER_RESOURCE);
        list.add_texture_barrier(barrier);
    }
    assert_eq!(list.flush_count(), 1);
    assert_eq!(list.pending_barrier_count(), 1);
    list.flush_barriers();
    assert!(list.end());
    let receipt = ctx.submit(&mut [&mut list], QueueKind::Graphics);
    assert!(ctx.queues().is_complete(receipt));

    let submission = backend.submissions().pop().unwrap();
    assert_eq!(
        submission.commands,
        vec![
            HeadlessCommand::Barriers {
                class: BarrierClass::Texture,
                count: MAX_BATCHED_BARRIERS
            },
            HeadlessCommand::Barriers {
                class: BarrierClass::Texture,
                count: 1
            },
        ]
    );
    assert_eq!(list.issued_barrier_count(), MAX_BATCHED_BARRIERS + 1);
}

#[test]
fn test_receipts_complete_monotonically() {
    let backend = Arc::new(HeadlessBackend::deferred());
    let ctx = FrameContext::new(backend.clone(), settings(2)).unwrap();
    let queues = ctx.queues();

    let receipts = (0..6).map(|_| queues.signal(QueueKind::Compute)).collect::<Vec<_>>();
    let mut complete = vec![false; receipts.len()];
    for step in 1..=6 {
        backend.complete_up_to(QueueKind::Compute, step);
        for (i, receipt) in receipts.iter().enumerate() {
            let now = queues.is_complete(*receipt);
            // 完成之后不会再变回未完成
            assert!(now || !complete[i]);
            assert_eq!(now, receipt.value() <= step);
            complete[i] = now;
        }
    }
    assert!(queues.is_idle());
}

#[test]
fn test_device_lost_tears_down_cleanly() {
    let backend = Arc::new(HeadlessBackend::deferred());
    let mut ctx = FrameContext::new(backend.clone(), settings(2)).unwrap();
    let mut list = CommandList::new(backend.clone(), QueueKind::Graphics, 2, "main").unwrap();
    let reported = Arc::new(AtomicUsize::new(0));
    {
        let reported = reported.clone();
        ctx.queues().set_device_lost_callback(move || {
            reported.fetch_add(1, Ordering::SeqCst);
        });
    }

    ctx.begin_frame();
    record_reads(&ctx, &mut list, &[]);
    let pending = ctx.submit(&mut [&mut list], QueueKind::Graphics);

    backend.lose_device();
    assert!(ctx.queues().is_complete(pending));
    assert!(ctx.queues().is_device_lost());

    record_reads(&ctx, &mut list, &[]);
    assert!(ctx.submit(&mut [&mut list], QueueKind::Graphics).is_null());

    // 轮转与销毁都不会阻塞
    ctx.begin_frame();
    ctx.begin_frame();
    drop(list);
    ctx.destroy();
    assert_eq!(reported.load(Ordering::SeqCst), 1);
}
