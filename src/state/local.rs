use crate::device::BufferId;

/// Per-context state of one bound object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalObjectState {
    pub stream_in: bool,
    pub stream_out: bool,
    buffer: Option<BufferId>,
    buffer_size: usize,
    /// Byte offset into the host object that the buffer starts at.
    host_offset: usize,
    valid: bool,
    contents_written: bool,
}

impl LocalObjectState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn buffer(&self) -> Option<BufferId> {
        self.buffer
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Where the buffer's first byte belongs in host memory. Non-zero only
    /// after a batched pass.
    pub fn host_offset(&self) -> usize {
        self.host_offset
    }

    /// True once the buffer holds data the host may read back.
    pub fn is_valid(&self) -> bool {
        self.buffer.is_some() && self.valid
    }

    pub fn contents_written(&self) -> bool {
        self.contents_written
    }

    /// Install a freshly allocated buffer, returning the one it replaces.
    pub(crate) fn attach(&mut self, buffer: BufferId, size: usize) -> Option<BufferId> {
        let old = self.buffer.replace(buffer);
        self.buffer_size = size;
        self.host_offset = 0;
        self.valid = false;
        self.contents_written = false;
        old
    }

    /// Drop the buffer, returning it so the caller can release it.
    pub(crate) fn detach(&mut self) -> Option<BufferId> {
        self.buffer_size = 0;
        self.host_offset = 0;
        self.valid = false;
        self.contents_written = false;
        self.buffer.take()
    }

    /// Record that the buffer now holds host bytes starting at `host_offset`.
    pub(crate) fn mark_written(&mut self, host_offset: usize) {
        self.contents_written = true;
        self.valid = true;
        self.host_offset = host_offset;
    }
}
