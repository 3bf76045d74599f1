//! Interrupt dispatch.
//!
//! One entry per core, callable from any thread at any time (the software
//! platform calls it from its responder thread). The handler samples the
//! status registers, then lets the scheduler match the status against the
//! active job's expected mask.
//!
//! Completion events come in bit pairs and a task may raise either bit of a
//! pair, so the status is widened pair by pair before it is compared. An
//! interrupt whose widened status does not equal the expected mask is
//! cleared and otherwise ignored.

use crate::diag;
use crate::scheduler::Scheduler;
use rknpu_chip::regs::{self, int};

/// What the interrupt path did with one interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqOutcome {
    /// Interrupt handling is bypassed by configuration.
    Bypassed,
    /// No job was active; the interrupt was cleared.
    NoJob,
    /// Status did not match the active job; cleared, state untouched.
    Spurious,
    /// The core committed its next chunk.
    ChunkCommitted,
    /// The core finished its part; other cores are still running.
    CoreDone,
    /// The job is done.
    JobDone,
    /// Committing the next chunk failed; the job was aborted.
    CommitFailed,
}

/// Widen every set bit to its whole event pair.
pub fn fuzz_status(status: u32) -> u32 {
    int::PAIRS
        .iter()
        .filter(|&&pair| status & pair != 0)
        .fold(0, |acc, &pair| acc | pair)
}

/// Service an interrupt on `core`.
pub(crate) fn handle(scheduler: &Scheduler, core: usize) -> IrqOutcome {
    let bank = scheduler.bank(core);
    let raw_status = bank.read32(regs::INT_RAW_STATUS);
    let status = bank.read32(regs::INT_STATUS);
    let task_cnt = diag::task_counter(bank, scheduler.chip());
    tracing::debug!("irq: core={core} raw={raw_status:#x} status={status:#x} task_cnt={task_cnt}");

    let outcome = scheduler.on_interrupt(core, status, raw_status, task_cnt);
    tracing::trace!("irq: core={core} -> {outcome:?}");
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fuzz_widens_pairs() {
        assert_eq!(fuzz_status(0), 0);
        assert_eq!(fuzz_status(0x1), 0x3);
        assert_eq!(fuzz_status(0x2), 0x3);
        assert_eq!(fuzz_status(0x100), 0x300);
        assert_eq!(fuzz_status(0x104), 0x30c);
        assert_eq!(fuzz_status(0x800), 0xc00);
        // bits above the pairs are dropped
        assert_eq!(fuzz_status(0x1000), 0);
    }

    #[test]
    fn full_pairs_are_fixed_points() {
        for pair in int::PAIRS {
            assert_eq!(fuzz_status(pair), pair);
        }
        assert_eq!(fuzz_status(0xfff), 0xfff);
    }
}
