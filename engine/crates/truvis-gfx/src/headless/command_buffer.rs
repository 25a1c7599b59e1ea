use crate::backend::{GfxBufferCopy, QueueKind};
use crate::commands::barrier::BarrierClass;
use crate::error::{GfxError, GfxResult};

/// 录制进 command buffer 的命令
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeadlessCommand {
    /// 一次 barrier 调用，以及其中包含的 barrier 数量
    Barriers { class: BarrierClass, count: usize },
    CopyBuffer(GfxBufferCopy),
}

#[derive(Debug)]
pub struct HeadlessCommandBuffer {
    id: u64,
    queue: QueueKind,
    name: String,
    recording: bool,
    commands: Vec<HeadlessCommand>,
}
// new & init
impl HeadlessCommandBuffer {
    pub(super) fn new(id: u64, queue: QueueKind, name: &str) -> Self {
        Self {
            id,
            queue,
            name: name.to_string(),
            recording: false,
            commands: Vec::new(),
        }
    }
}
// getters
impl HeadlessCommandBuffer {
    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn queue(&self) -> QueueKind {
        self.queue
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn is_recording(&self) -> bool {
        self.recording
    }

    /// 最近一次录制的命令
    #[inline]
    pub fn commands(&self) -> &[HeadlessCommand] {
        &self.commands
    }

    /// 最近一次录制中 barrier 调用的次数
    pub fn barrier_call_count(&self) -> usize {
        self.commands.iter().filter(|cmd| matches!(cmd, HeadlessCommand::Barriers { .. })).count()
    }
}
// tools
impl HeadlessCommandBuffer {
    pub(super) fn begin(&mut self) -> GfxResult<()> {
        if self.recording {
            return Err(GfxError::InvalidUsage(format!("command buffer `{}` is already recording", self.name)));
        }
        // 相当于 reset
        self.commands.clear();
        self.recording = true;
        Ok(())
    }

    pub(super) fn end(&mut self) -> GfxResult<()> {
        if !self.recording {
            return Err(GfxError::InvalidUsage(format!("command buffer `{}` is not recording", self.name)));
        }
        self.recording = false;
        Ok(())
    }

    pub(super) fn record(&mut self, command: HeadlessCommand) {
        if !self.recording {
            log::error!("command buffer `{}`: record {:?} outside begin/end", self.name, command);
            return;
        }
        self.commands.push(command);
    }
}
