//! Interrupt, preemption and soft-irq emulation.
//!
//! There is no interrupt delivery. Disabling interrupts means entering the
//! soft acquire bracket on the calling thread's CPU and raising its irq-off
//! flag; enabling leaves it. Soft-irqs and reschedule requests are per-CPU
//! flags the harness can inspect. Nothing here blocks or yields.

use crate::cpu::CpuSlot;
use crate::fence::{read_once, write_once};
use crate::machine::Smp;

/// Saved interrupt state from [`Smp::local_irq_save`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IrqFlags {
    disabled: bool,
}

impl IrqFlags {
    /// `irqs_disabled_flags(flags)`.
    #[must_use]
    pub fn irqs_disabled(self) -> bool {
        self.disabled
    }
}

impl Smp {
    /// `local_irq_disable()`.
    #[track_caller]
    pub fn local_irq_disable(&self) {
        let cpu = self.current_cpu();
        self.soft_acquire(cpu);
        write_once(self.irqs_off.get(cpu), true);
    }

    /// `local_irq_enable()`.
    #[track_caller]
    pub fn local_irq_enable(&self) {
        let cpu = self.current_cpu();
        write_once(self.irqs_off.get(cpu), false);
        self.soft_release(cpu);
    }

    /// `local_irq_save(flags)`: disable, remembering the previous state.
    /// Nested saves do not re-enter the bracket.
    #[track_caller]
    pub fn local_irq_save(&self) -> IrqFlags {
        let flags = IrqFlags {
            disabled: self.irqs_disabled(),
        };
        if !flags.disabled {
            self.local_irq_disable();
        }
        flags
    }

    /// `local_irq_restore(flags)`.
    #[track_caller]
    pub fn local_irq_restore(&self, flags: IrqFlags) {
        if !flags.disabled && self.irqs_disabled() {
            self.local_irq_enable();
        }
    }

    /// `irqs_disabled()` on the calling thread's CPU.
    #[track_caller]
    #[must_use]
    pub fn irqs_disabled(&self) -> bool {
        read_once(self.irqs_off.get(self.current_cpu()))
    }

    /// `in_interrupt()` / `in_irq()`: no handler ever runs.
    #[must_use]
    pub fn in_interrupt(&self) -> bool {
        false
    }

    /// `in_softirq()`.
    #[must_use]
    pub fn in_softirq(&self) -> bool {
        false
    }

    /// `local_bh_disable()`: no bottom halves to hold off.
    pub fn local_bh_disable(&self) {}

    /// `local_bh_enable()`.
    pub fn local_bh_enable(&self) {}

    /// `might_sleep()`.
    pub fn might_sleep(&self) {}

    /// `cond_resched()`: give the checker a preemption point by leaving and
    /// re-entering the bracket when the caller holds its CPU. Always 0.
    #[track_caller]
    pub fn cond_resched(&self) -> i32 {
        let cpu = self.current_cpu();
        if self.registry().held_by_current(cpu) {
            self.soft_release(cpu);
            self.soft_acquire(cpu);
        }
        0
    }

    /// `need_resched()`: a reschedule is always wanted.
    #[must_use]
    pub fn need_resched(&self) -> bool {
        true
    }

    /// `set_need_resched()` on the calling thread's CPU.
    #[track_caller]
    pub fn set_need_resched(&self) {
        let cpu = self.current_cpu();
        write_once(self.resched.get(cpu), true);
    }

    /// `smp_send_reschedule(cpu)`: flag `cpu` for rescheduling.
    #[track_caller]
    pub fn smp_send_reschedule(&self, cpu: CpuSlot) {
        let cpu = self.checked_cpu(cpu);
        tracing::trace!(%cpu, "reschedule IPI");
        write_once(self.resched.get(cpu), true);
    }

    /// True when `cpu` was asked to reschedule.
    #[track_caller]
    #[must_use]
    pub fn resched_requested(&self, cpu: CpuSlot) -> bool {
        let cpu = self.checked_cpu(cpu);
        read_once(self.resched.get(cpu))
    }

    /// `raise_softirq(nr)`: mark the calling thread's CPU pending.
    #[track_caller]
    pub fn raise_softirq(&self) {
        let cpu = self.current_cpu();
        write_once(self.softirq_pending.get(cpu), true);
    }

    /// True when `cpu` has a raised soft-irq.
    #[track_caller]
    #[must_use]
    pub fn softirq_pending(&self, cpu: CpuSlot) -> bool {
        let cpu = self.checked_cpu(cpu);
        read_once(self.softirq_pending.get(cpu))
    }

    /// Consume `cpu`'s pending soft-irq, returning whether one was raised.
    #[track_caller]
    pub fn take_softirq(&self, cpu: CpuSlot) -> bool {
        let cpu = self.checked_cpu(cpu);
        self.softirq_pending.get(cpu).take()
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use crate::config::{NestingPolicy, SmpConfig};
    use crate::cpu::CpuSlot;
    use crate::machine::Smp;

    #[test]
    fn disable_enable_brackets_the_cpu() {
        let smp = Smp::new(SmpConfig::default().nesting(NestingPolicy::Report)).unwrap();
        let cpu = smp.current_cpu();
        assert!(!smp.irqs_disabled());
        smp.local_irq_disable();
        assert!(smp.irqs_disabled());
        assert!(smp.registry().held_by_current(cpu));
        smp.local_irq_enable();
        assert!(!smp.irqs_disabled());
        assert!(!smp.registry().is_held(cpu));
    }

    #[test]
    fn save_restore_nests() {
        let smp = Smp::new(SmpConfig::default().nesting(NestingPolicy::Report)).unwrap();
        let outer = smp.local_irq_save();
        assert!(!outer.irqs_disabled());
        let inner = smp.local_irq_save();
        assert!(inner.irqs_disabled());
        smp.local_irq_restore(inner);
        assert!(smp.irqs_disabled());
        smp.local_irq_restore(outer);
        assert!(!smp.irqs_disabled());
    }

    #[test]
    fn cond_resched_keeps_the_bracket() {
        let smp = Smp::new(SmpConfig::default().nesting(NestingPolicy::Report)).unwrap();
        assert_eq!(smp.cond_resched(), 0);
        smp.local_irq_disable();
        assert_eq!(smp.cond_resched(), 0);
        assert!(smp.registry().held_by_current(smp.current_cpu()));
        smp.local_irq_enable();
        assert!(smp.need_resched());
        assert!(!smp.in_interrupt());
    }

    #[test]
    fn softirq_and_resched_flags_are_per_cpu() {
        let smp = Smp::new(SmpConfig::with_cpus(3)).unwrap();
        let me = smp.assign_cpu(2).unwrap();
        smp.raise_softirq();
        assert!(smp.softirq_pending(me));
        assert!(!smp.softirq_pending(smp.cpu(0)));
        assert!(smp.take_softirq(me));
        assert!(!smp.take_softirq(me));

        smp.smp_send_reschedule(smp.cpu(1));
        assert!(smp.resched_requested(smp.cpu(1)));
        assert!(!smp.resched_requested(me));
        smp.set_need_resched();
        assert!(smp.resched_requested(me));
    }

    fn fatal_message(f: impl FnOnce()) -> String {
        let payload = catch_unwind(AssertUnwindSafe(f)).unwrap_err();
        payload.downcast_ref::<String>().unwrap().clone()
    }

    #[test]
    fn foreign_slot_is_a_fatal_violation() {
        let smp = Smp::new(SmpConfig::with_cpus(2)).unwrap();
        let foreign: CpuSlot = serde_json::from_str("7").unwrap();
        let messages = [
            fatal_message(|| smp.smp_send_reschedule(foreign)),
            fatal_message(|| {
                let _ = smp.resched_requested(foreign);
            }),
            fatal_message(|| {
                let _ = smp.softirq_pending(foreign);
            }),
            fatal_message(|| {
                let _ = smp.take_softirq(foreign);
            }),
        ];
        for message in messages {
            assert!(message.starts_with("fatal invariant violated"), "{message}");
            assert!(message.contains("CPU slot 7 out of range"), "{message}");
        }
        assert!(!smp.resched_requested(smp.cpu(1)));
    }
}
