/// Raw MMIO access to the GPU register window.
///
/// Implementations must perform each access exactly once and in program order
/// (volatile semantics). Offsets are byte offsets into the window. Reads may
/// have side effects: `INTR_ACKNOWLEDGE` is read-to-clear.
pub trait RegisterBus: Send + Sync {
    fn read32(&self, offset: u32) -> u32;
    fn write32(&self, offset: u32, value: u32);

    /// Read-modify-write helper. Not atomic with respect to other writers.
    fn modify32(&self, offset: u32, clear: u32, set: u32) {
        let value = self.read32(offset);
        self.write32(offset, (value & !clear) | set);
    }
}

impl<T: RegisterBus + ?Sized> RegisterBus for std::sync::Arc<T> {
    fn read32(&self, offset: u32) -> u32 {
        (**self).read32(offset)
    }

    fn write32(&self, offset: u32, value: u32) {
        (**self).write32(offset, value)
    }
}
