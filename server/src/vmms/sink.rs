/// Bounded capture buffer for a run's combined stdout+stderr. The limit is
/// enforced here, at write time, because the process on the other side may
/// produce unbounded data.
#[derive(Debug)]
pub struct OutputSink {
    buf: Vec<u8>,
    limit: usize,
    total: u64,
    truncated: bool,
}

impl OutputSink {
    pub fn new(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
            total: 0,
            truncated: false,
        }
    }

    pub fn write(&mut self, chunk: &[u8]) {
        self.total += chunk.len() as u64;
        let room = self.limit.saturating_sub(self.buf.len());
        if chunk.len() <= room {
            self.buf.extend_from_slice(chunk);
        } else {
            self.buf.extend_from_slice(&chunk[..room]);
            self.truncated = true;
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Bytes the run actually produced, including any that were dropped.
    pub fn total_bytes(&self) -> u64 {
        self.total
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }
}
