use std::fmt::Display;

use truvis_gfx::backend::QueueKind;

/// 一次提交（或一次显式 signal）的完成凭证
///
/// `value` 是提交后该队列计数器被 signal 到的值。计数器 `>= value` 时 receipt 完成。
/// 空 receipt 的 value 是任何真实 signal 都无法到达的 `u64::MAX`，并且被视为已完成。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Receipt {
    queue: QueueKind,
    value: u64,
}
impl Receipt {
    const NULL_VALUE: u64 = u64::MAX;

    #[inline]
    pub(crate) fn new(queue: QueueKind, value: u64) -> Self {
        debug_assert!(value != Self::NULL_VALUE);
        Self { queue, value }
    }

    #[inline]
    pub const fn null(queue: QueueKind) -> Self {
        Self {
            queue,
            value: Self::NULL_VALUE,
        }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.value == Self::NULL_VALUE
    }

    #[inline]
    pub fn queue(&self) -> QueueKind {
        self.queue
    }

    #[inline]
    pub fn value(&self) -> u64 {
        self.value
    }

    /// 同一队列上，`self` 完成时 `other` 一定也已经完成
    #[inline]
    pub fn covers(&self, other: &Receipt) -> bool {
        other.is_null() || (!self.is_null() && self.queue == other.queue && self.value >= other.value)
    }
}
impl Default for Receipt {
    fn default() -> Self {
        Self::null(QueueKind::Graphics)
    }
}
impl Display for Receipt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            write!(f, "{}#null", self.queue)
        } else {
            write!(f, "{}#{}", self.queue, self.value)
        }
    }
}
