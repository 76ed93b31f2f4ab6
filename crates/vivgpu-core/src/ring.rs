//! Front-end command ring.
//!
//! The front end (FE) spins in a WAIT/LINK idle loop at the tail of the ring.
//! New work is appended after the loop and then made visible by rewriting the
//! loop's WAIT into a LINK to the new segment; every segment ends in a fresh
//! WAIT/LINK loop. All commands are 64-bit aligned and prefetch counts are in
//! 64-bit units.

use tracing::trace;

use crate::error::{GpuError, Result};
use crate::events::MAX_EVENTS;
use crate::regs::gl;

pub mod cmd {
    //! FE opcode encoders.

    pub const OP_LOAD_STATE: u32 = 0x0800_0000;
    pub const OP_END: u32 = 0x1000_0000;
    pub const OP_NOP: u32 = 0x1800_0000;
    pub const OP_WAIT: u32 = 0x3800_0000;
    pub const OP_LINK: u32 = 0x4000_0000;
    pub const OP_STALL: u32 = 0x4800_0000;
    pub const OP_MASK: u32 = 0xf800_0000;

    pub const fn load_state(reg: u32, count: u32) -> u32 {
        OP_LOAD_STATE | ((count & 0x3ff) << 16) | ((reg >> 2) & 0xffff)
    }

    pub const fn wait(cycles: u32) -> u32 {
        OP_WAIT | (cycles & 0xffff)
    }

    pub const fn link(prefetch: u32) -> u32 {
        OP_LINK | (prefetch & 0xffff)
    }

    pub const fn opcode(word: u32) -> u32 {
        word & OP_MASK
    }

    /// Semaphore / stall token: FE waits for the PE.
    pub const fn fe_to_pe_token() -> u32 {
        super::gl::SEMAPHORE_FROM_FE | (super::gl::SEMAPHORE_TO_PE << 8)
    }
}

/// Which pipe the following command buffer targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecState {
    Pipe3d,
    Pipe2d,
}

impl ExecState {
    fn pipe_select(self) -> u32 {
        match self {
            Self::Pipe3d => 0,
            Self::Pipe2d => 1,
        }
    }
}

/// A caller-owned command buffer in GPU-visible memory.
///
/// The last two words are reserved for the LINK back into the ring, which is
/// rewritten on every submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandBuffer {
    gpu_addr: u32,
    words: Vec<u32>,
    user_len: usize,
}

impl CommandBuffer {
    pub fn new(gpu_addr: u32, words: Vec<u32>) -> Result<Self> {
        if gpu_addr % 8 != 0 {
            return Err(GpuError::InvalidCommandBuffer("address not 64-bit aligned"));
        }
        if words.is_empty() || words.len() % 2 != 0 {
            return Err(GpuError::InvalidCommandBuffer("length not a multiple of 64 bits"));
        }
        // Room for the return LINK within the 16-bit prefetch field.
        if words.len() / 2 + 1 > 0xffff {
            return Err(GpuError::InvalidCommandBuffer("too large"));
        }
        let user_len = words.len();
        Ok(Self {
            gpu_addr,
            words,
            user_len,
        })
    }

    pub fn gpu_addr(&self) -> u32 {
        self.gpu_addr
    }

    /// Current contents including the return LINK once submitted.
    pub fn words(&self) -> &[u32] {
        &self.words
    }

    fn set_return_link(&mut self, target: u32, prefetch: u32) {
        self.words.truncate(self.user_len);
        self.words.push(cmd::link(prefetch));
        self.words.push(target);
    }

    fn prefetch(&self) -> u32 {
        (self.words.len() / 2) as u32
    }
}

/// Sizes in 32-bit words.
const SEM_STALL_WORDS: usize = 4;
const MMU_FLUSH_WORDS: usize = 2 + SEM_STALL_WORDS;
const PIPE_SWITCH_WORDS: usize = 2 + SEM_STALL_WORDS + 2;
const LINK_WORDS: usize = 2;
const WAIT_LINK_WORDS: usize = 4;
const SYNC_POINT_WORDS: usize = 2 + 2 + WAIT_LINK_WORDS;
const RETURN_WORDS: usize = 2 + SEM_STALL_WORDS + 2 + WAIT_LINK_WORDS;
/// Largest segment a single event slot can own.
const MAX_SEGMENT_WORDS: usize = PIPE_SWITCH_WORDS + MMU_FLUSH_WORDS + LINK_WORDS + RETURN_WORDS;

/// Smallest ring that holds one worst-case segment per event slot without
/// wrapping onto one the FE has not passed yet. One extra segment covers the
/// tail left unused when the ring wraps.
pub const fn min_ring_words(event_slots: usize) -> usize {
    (event_slots + 1) * MAX_SEGMENT_WORDS + WAIT_LINK_WORDS
}

pub struct CommandRing {
    gpu_addr: u32,
    words: Vec<u32>,
    pos: usize,
    /// Offset of the WAIT the FE is currently looping on.
    wait_link: Option<usize>,
    exec_state: Option<ExecState>,
    /// Address following each sync point's END, indexed by event id.
    sync_resume: [Option<u32>; MAX_EVENTS],
}

impl CommandRing {
    pub fn new(gpu_addr: u32, size_words: usize) -> Self {
        Self {
            gpu_addr,
            words: vec![0; size_words & !1],
            pos: 0,
            wait_link: None,
            exec_state: None,
            sync_resume: [None; MAX_EVENTS],
        }
    }

    pub fn gpu_addr(&self) -> u32 {
        self.gpu_addr
    }

    pub fn words(&self) -> &[u32] {
        &self.words
    }

    pub fn wait_link_offset(&self) -> Option<usize> {
        self.wait_link
    }

    pub fn exec_state(&self) -> Option<ExecState> {
        self.exec_state
    }

    /// Whether the ring holds a live idle loop the FE can be pointed at.
    pub fn is_running(&self) -> bool {
        self.wait_link.is_some()
    }

    pub fn resume_addr(&self, event: usize) -> Option<u32> {
        self.sync_resume.get(event).copied().flatten()
    }

    fn addr_of(&self, offset: usize) -> u32 {
        self.gpu_addr + (offset * 4) as u32
    }

    fn reserve(&mut self, n: usize) -> usize {
        if self.pos + n > self.words.len() {
            trace!(pos = self.pos, "command ring wrapped");
            self.pos = 0;
        }
        self.pos
    }

    fn emit(&mut self, word: u32) {
        self.words[self.pos] = word;
        self.pos += 1;
    }

    fn load_state(&mut self, reg: u32, value: u32) {
        self.emit(cmd::load_state(reg, 1));
        self.emit(value);
    }

    fn sem_stall(&mut self) {
        let token = cmd::fe_to_pe_token();
        self.load_state(gl::SEMAPHORE_TOKEN, token);
        self.emit(cmd::OP_STALL);
        self.emit(token);
    }

    fn end(&mut self) {
        self.emit(cmd::OP_END);
        self.emit(0);
    }

    /// WAIT followed by a LINK back to that WAIT. Returns the WAIT's offset.
    fn wait_link_loop(&mut self, waitcycles: u32) -> usize {
        let wait = self.pos;
        let wait_addr = self.addr_of(wait);
        self.emit(cmd::wait(waitcycles));
        self.emit(0);
        self.emit(cmd::link(2));
        self.emit(wait_addr);
        wait
    }

    /// Makes a segment visible: the current WAIT becomes a LINK to `target`.
    /// The address is stored before the opcode changes.
    fn replace_wait(&mut self, target: usize, prefetch: usize, new_wait: usize) {
        let target_addr = self.addr_of(target);
        if let Some(wait) = self.wait_link {
            self.words[wait + 1] = target_addr;
            std::sync::atomic::fence(std::sync::atomic::Ordering::Release);
            self.words[wait] = cmd::link(prefetch as u32);
        }
        self.wait_link = Some(new_wait);
    }

    /// Rewrites the ring as a bare idle loop at its base. Returns the prefetch
    /// for starting the FE there.
    pub fn reset(&mut self, waitcycles: u32) -> u16 {
        self.pos = 0;
        self.exec_state = None;
        self.sync_resume = [None; MAX_EVENTS];
        let wait = self.wait_link_loop(waitcycles);
        self.wait_link = Some(wait);
        (WAIT_LINK_WORDS / 2) as u16
    }

    /// Forgets the running loop; the next submission must `reset` and restart the FE.
    pub fn invalidate(&mut self) {
        self.wait_link = None;
        self.exec_state = None;
        self.sync_resume = [None; MAX_EVENTS];
    }

    /// Replaces the idle loop's WAIT with END so the FE stops.
    pub fn end_loop(&mut self) {
        if let Some(wait) = self.wait_link.take() {
            self.words[wait + 1] = 0;
            self.words[wait] = cmd::OP_END;
        }
    }

    /// Queues an event that stops the FE until the sync-point worker restarts it.
    pub fn queue_sync_point(&mut self, event: usize, waitcycles: u32) -> u32 {
        let target = self.reserve(SYNC_POINT_WORDS);
        self.load_state(gl::EVENT, (event as u32 & gl::EVENT_EVT_ID_MASK) | gl::EVENT_FROM_PE);
        self.end();
        let resume = self.addr_of(self.pos);
        let wait = self.wait_link_loop(waitcycles);
        self.sync_resume[event] = Some(resume);
        self.replace_wait(target, SYNC_POINT_WORDS / 2, wait);
        trace!(event, resume = format_args!("{resume:#x}"), "sync point queued");
        resume
    }

    /// Queues `cmdbuf` followed by a completion event for `event`.
    pub fn queue_command_buffer(
        &mut self,
        exec_state: ExecState,
        flush_mmu: bool,
        event: usize,
        cmdbuf: &mut CommandBuffer,
        waitcycles: u32,
    ) {
        let switch_pipe = self.exec_state != Some(exec_state);
        let mut head_words = LINK_WORDS;
        if flush_mmu {
            head_words += MMU_FLUSH_WORDS;
        }
        if switch_pipe {
            head_words += PIPE_SWITCH_WORDS;
        }

        let target = self.reserve(head_words + RETURN_WORDS);
        let return_target = self.addr_of(target + head_words);
        cmdbuf.set_return_link(return_target, (RETURN_WORDS / 2) as u32);

        if flush_mmu {
            self.load_state(gl::FLUSH_MMU, gl::FLUSH_MMU_ALL);
            self.sem_stall();
        }
        if switch_pipe {
            self.load_state(gl::FLUSH_CACHE, gl::FLUSH_CACHE_ALL);
            self.sem_stall();
            self.load_state(gl::PIPE_SELECT, exec_state.pipe_select());
            self.exec_state = Some(exec_state);
        }
        self.emit(cmd::link(cmdbuf.prefetch()));
        self.emit(cmdbuf.gpu_addr());

        self.load_state(gl::FLUSH_CACHE, gl::FLUSH_CACHE_ALL);
        self.sem_stall();
        self.load_state(gl::EVENT, (event as u32 & gl::EVENT_EVT_ID_MASK) | gl::EVENT_FROM_PE);
        let wait = self.wait_link_loop(waitcycles);

        self.replace_wait(target, head_words / 2, wait);
        trace!(
            event,
            target = format_args!("{:#x}", self.addr_of(target)),
            flush_mmu,
            switch_pipe,
            "command buffer queued"
        );
    }
}

impl std::fmt::Debug for CommandRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandRing")
            .field("gpu_addr", &format_args!("{:#x}", self.gpu_addr))
            .field("size", &self.words.len())
            .field("pos", &self.pos)
            .field("wait_link", &self.wait_link)
            .field("exec_state", &self.exec_state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const BASE: u32 = 0x1000_0000;

    fn ring() -> CommandRing {
        CommandRing::new(BASE, 256)
    }

    #[test]
    fn reset_emits_self_linked_idle_loop() {
        let mut ring = ring();
        assert_eq!(ring.reset(200), 2);
        assert_eq!(&ring.words()[..4], &[cmd::wait(200), 0, cmd::link(2), BASE]);
        assert_eq!(ring.wait_link_offset(), Some(0));
    }

    #[test]
    fn command_buffer_validation() {
        assert!(CommandBuffer::new(0x1004, vec![0, 0]).is_err());
        assert!(CommandBuffer::new(0x1000, vec![0]).is_err());
        assert!(CommandBuffer::new(0x1000, vec![]).is_err());
        assert!(CommandBuffer::new(0x1000, vec![0, 0]).is_ok());
    }

    #[test]
    fn queued_buffer_patches_previous_wait() {
        let mut ring = ring();
        ring.reset(200);
        let mut buf = CommandBuffer::new(0x2000_0000, vec![cmd::OP_NOP, 0]).unwrap();
        ring.queue_command_buffer(ExecState::Pipe3d, true, 5, &mut buf, 300);

        let words = ring.words();
        // Old WAIT is now a LINK into the new segment at offset 4.
        assert_eq!(cmd::opcode(words[0]), cmd::OP_LINK);
        assert_eq!(words[1], BASE + 16);
        let head_words = LINK_WORDS + MMU_FLUSH_WORDS + PIPE_SWITCH_WORDS;
        assert_eq!(words[0] & 0xffff, (head_words / 2) as u32);

        // MMU flush first, then the pipe switch.
        assert_eq!(words[4], cmd::load_state(gl::FLUSH_MMU, 1));
        let pipe_select = 4 + MMU_FLUSH_WORDS + 6;
        assert_eq!(words[pipe_select], cmd::load_state(gl::PIPE_SELECT, 1));
        assert_eq!(words[pipe_select + 1], 0);

        // LINK into the command buffer (2 user words + return link = 2 units).
        let link = 4 + head_words - 2;
        assert_eq!(words[link], cmd::link(2));
        assert_eq!(words[link + 1], 0x2000_0000);

        // The buffer returns to the flush/event/wait tail.
        let return_target = BASE + ((4 + head_words) * 4) as u32;
        assert_eq!(
            buf.words(),
            &[
                cmd::OP_NOP,
                0,
                cmd::link((RETURN_WORDS / 2) as u32),
                return_target
            ]
        );

        let event = 4 + head_words + 2 + SEM_STALL_WORDS;
        assert_eq!(words[event], cmd::load_state(gl::EVENT, 1));
        assert_eq!(words[event + 1], 5 | gl::EVENT_FROM_PE);
        let wait = event + 2;
        assert_eq!(words[wait], cmd::wait(300));
        assert_eq!(ring.wait_link_offset(), Some(wait));
        assert_eq!(ring.exec_state(), Some(ExecState::Pipe3d));
    }

    #[test]
    fn same_pipe_skips_switch() {
        let mut ring = ring();
        ring.reset(200);
        let mut buf = CommandBuffer::new(0x2000_0000, vec![0, 0]).unwrap();
        ring.queue_command_buffer(ExecState::Pipe2d, false, 0, &mut buf, 200);
        let first_wait = ring.wait_link_offset().unwrap();
        ring.queue_command_buffer(ExecState::Pipe2d, false, 1, &mut buf, 200);

        let words = ring.words();
        // Previous wait links to a head that is only the LINK into the buffer.
        assert_eq!(words[first_wait], cmd::link(1));
        let target = ((words[first_wait + 1] - BASE) / 4) as usize;
        assert_eq!(words[target], cmd::link(2));
        // Resubmitting rewrites rather than appends the return link.
        assert_eq!(buf.words().len(), 4);
    }

    #[test]
    fn sync_point_stops_fe_and_records_resume() {
        let mut ring = ring();
        ring.reset(200);
        let resume = ring.queue_sync_point(3, 200);
        let words = ring.words();
        assert_eq!(words[4], cmd::load_state(gl::EVENT, 1));
        assert_eq!(words[5], 3 | gl::EVENT_FROM_PE);
        assert_eq!(words[6], cmd::OP_END);
        assert_eq!(resume, BASE + 8 * 4);
        assert_eq!(words[8], cmd::wait(200));
        assert_eq!(words[11], resume);
        assert_eq!(ring.resume_addr(3), Some(resume));
        assert_eq!(ring.resume_addr(4), None);
        assert_eq!(words[0], cmd::link((SYNC_POINT_WORDS / 2) as u32));
    }

    #[test]
    fn ring_wraps_to_base() {
        let mut ring = ring();
        ring.reset(200);
        let mut last = 0;
        for i in 0..40 {
            ring.queue_sync_point(i % MAX_EVENTS, 200);
            let wait = ring.wait_link_offset().unwrap();
            assert!(wait + WAIT_LINK_WORDS <= ring.words().len());
            if wait < last {
                assert_eq!(wait, SYNC_POINT_WORDS - WAIT_LINK_WORDS);
            }
            last = wait;
        }
    }

    #[test]
    fn minimum_ring_keeps_every_in_flight_event() {
        let mut ring = CommandRing::new(BASE, min_ring_words(MAX_EVENTS));
        ring.reset(200);
        let mut buf = CommandBuffer::new(0x2000_0000, vec![0, 0]).unwrap();
        for event in 0..MAX_EVENTS {
            let pipe = if event % 2 == 0 {
                ExecState::Pipe3d
            } else {
                ExecState::Pipe2d
            };
            ring.queue_command_buffer(pipe, true, event, &mut buf, 200);
        }

        // The first segment follows the idle loop and carries the largest head.
        let event = WAIT_LINK_WORDS + MAX_SEGMENT_WORDS - RETURN_WORDS + 2 + SEM_STALL_WORDS;
        assert_eq!(ring.words()[event], cmd::load_state(gl::EVENT, 1));
        assert_eq!(ring.words()[event + 1], gl::EVENT_FROM_PE);
    }

    #[test]
    fn end_loop_and_invalidate() {
        let mut ring = ring();
        ring.reset(200);
        ring.end_loop();
        assert_eq!(ring.words()[0], cmd::OP_END);
        assert!(!ring.is_running());

        ring.reset(200);
        ring.queue_sync_point(1, 200);
        ring.invalidate();
        assert!(!ring.is_running());
        assert_eq!(ring.resume_addr(1), None);
    }
}
