//! Canned client programs run against an emulated machine.
//!
//! Each scenario spawns one worker per virtual CPU, lets them race through
//! the layer, then checks the final state on the main thread with
//! [`Smp::check_fatal`]. A failing worker panics with its violation; the
//! panic is forwarded out of [`ScenarioKind::execute`] so the runner can
//! classify it.

use std::collections::HashSet;
use std::panic;
use std::sync::{Arc, Barrier};
use std::thread;

use clap::ValueEnum;
use fakesmp_core::kernel::{smp_load_acquire, smp_mb, smp_store_release};
use fakesmp_core::list::ListHead;
use fakesmp_core::{
    AtomicCell, CpuSlot, Severity, Smp, SmpConfig, SuppressionFencing, container_of, pr_info,
    pr_warn,
};
use serde::{Deserialize, Serialize};

/// Rounds each worker runs in the counter scenarios.
pub const COUNTER_ROUNDS: usize = 100;

/// Bits available for the grace-period mask.
const QSMASK_BITS: usize = isize::BITS as usize - 1;

/// Built-in scenarios.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ScenarioKind {
    /// Half the CPUs increment, half decrement, under irq-off brackets.
    IncDec,
    /// Every CPU tries to claim one cell with compare-and-swap.
    CasRace,
    /// Every worker obtains a distinct, stable CPU identity.
    CpuIdentity,
    /// One CPU suppresses checks then breaks state another CPU checks.
    SuppressedCheck,
    /// A fatal check fails after suppression.
    FatalAfterSuppress,
    /// Every CPU reports a quiescent state and the last one ends the grace period.
    GracePeriod,
    /// Compare-and-swap race checked only where CPU 0 won.
    AssumedWinner,
}

/// What a clean run of a scenario looks like.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "expect", rename_all = "snake_case")]
pub enum Expectation {
    /// No violation in any iteration.
    Clean,
    /// Every iteration reports a violation of this severity.
    Violation { severity: Severity },
    /// Violations depend on the interleaving.
    MayViolate,
}

impl ScenarioKind {
    /// Every scenario, in listing order.
    pub const ALL: [Self; 7] = [
        Self::IncDec,
        Self::CasRace,
        Self::CpuIdentity,
        Self::SuppressedCheck,
        Self::FatalAfterSuppress,
        Self::GracePeriod,
        Self::AssumedWinner,
    ];

    /// Kebab-case name used on the command line and in logs.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::IncDec => "inc-dec",
            Self::CasRace => "cas-race",
            Self::CpuIdentity => "cpu-identity",
            Self::SuppressedCheck => "suppressed-check",
            Self::FatalAfterSuppress => "fatal-after-suppress",
            Self::GracePeriod => "grace-period",
            Self::AssumedWinner => "assumed-winner",
        }
    }

    #[must_use]
    pub fn description(self) -> &'static str {
        match self {
            Self::IncDec => "increment/decrement race ends at zero",
            Self::CasRace => "compare-and-swap race has exactly one winner",
            Self::CpuIdentity => "each worker holds a distinct, stable CPU",
            Self::SuppressedCheck => "a check racing with suppression never fires when fenced",
            Self::FatalAfterSuppress => "fatal checks ignore suppression",
            Self::GracePeriod => "every CPU passes a quiescent state before the grace period ends",
            Self::AssumedWinner => "runs where CPU 0 loses the race are pruned, not failed",
        }
    }

    /// Expected result under `config`.
    #[must_use]
    pub fn expectation(self, config: &SmpConfig) -> Expectation {
        match self {
            Self::FatalAfterSuppress => Expectation::Violation {
                severity: Severity::Fatal,
            },
            Self::SuppressedCheck
                if config.suppression_fencing == SuppressionFencing::Unfenced =>
            {
                Expectation::MayViolate
            }
            _ => Expectation::Clean,
        }
    }

    /// Whether the scenario can run on a machine of this shape.
    #[must_use]
    pub fn supports(self, config: &SmpConfig) -> bool {
        match self {
            Self::GracePeriod => config.nr_cpus <= QSMASK_BITS,
            Self::SuppressedCheck => config.nr_cpus >= 2,
            _ => true,
        }
    }

    /// Run one iteration on a fresh machine. Violations surface as panics.
    pub fn execute(self, smp: &Arc<Smp>) {
        match self {
            Self::IncDec => inc_dec(smp),
            Self::CasRace => cas_race(smp),
            Self::CpuIdentity => cpu_identity(smp),
            Self::SuppressedCheck => suppressed_check(smp),
            Self::FatalAfterSuppress => fatal_after_suppress(smp),
            Self::GracePeriod => grace_period(smp),
            Self::AssumedWinner => assumed_winner(smp),
        }
    }
}

impl std::fmt::Display for ScenarioKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Spawn one worker per CPU, pinned to that CPU, and join them all.
///
/// The first worker panic is re-raised on the calling thread once every
/// worker has finished.
fn on_each_cpu<R, F>(smp: &Arc<Smp>, body: F) -> Vec<R>
where
    R: Send + 'static,
    F: Fn(&Smp, CpuSlot) -> R + Send + Sync + 'static,
{
    let body = Arc::new(body);
    let handles: Vec<_> = (0..smp.nr_cpu_ids())
        .map(|index| {
            let smp = Arc::clone(smp);
            let body = Arc::clone(&body);
            thread::spawn(move || {
                let slot = match smp.assign_cpu(index) {
                    Ok(slot) => slot,
                    Err(err) => smp.bridge().kernel_panic(&err.to_string()),
                };
                body(&smp, slot)
            })
        })
        .collect();

    let mut results = Vec::with_capacity(handles.len());
    let mut first_panic = None;
    for handle in handles {
        match handle.join() {
            Ok(value) => results.push(value),
            Err(payload) => {
                first_panic.get_or_insert(payload);
            }
        }
    }
    if let Some(payload) = first_panic {
        panic::resume_unwind(payload);
    }
    results
}

fn inc_dec(smp: &Arc<Smp>) {
    let counter = Arc::new(AtomicCell::new(0));
    let barrier = Arc::new(Barrier::new(smp.nr_cpu_ids()));
    let balanced = smp.nr_cpu_ids() % 2 == 0;
    {
        let counter = Arc::clone(&counter);
        on_each_cpu(smp, move |smp, cpu| {
            barrier.wait();
            // With an odd CPU count the last CPU sits out.
            if !balanced && cpu.index() + 1 == smp.nr_cpu_ids() {
                return;
            }
            for _ in 0..COUNTER_ROUNDS {
                smp.local_irq_disable();
                if cpu.index() % 2 == 0 {
                    counter.increment();
                } else {
                    counter.decrement();
                }
                smp.local_irq_enable();
            }
        });
    }
    smp.check_fatal(counter.read() == 0, "counter did not return to zero");
}

fn cas_race(smp: &Arc<Smp>) {
    let cell = Arc::new(AtomicCell::new(0));
    let barrier = Arc::new(Barrier::new(smp.nr_cpu_ids()));
    let wins = {
        let cell = Arc::clone(&cell);
        on_each_cpu(smp, move |_, cpu| {
            barrier.wait();
            cell.compare_and_swap(0, cpu.index() as isize + 1)
        })
    };
    let winners = wins.iter().filter(|won| **won).count();
    smp.check_fatal(winners == 1, "compare-and-swap race did not have one winner");
    smp.check_fatal(cell.read() != 0, "winning value was lost");
}

fn assumed_winner(smp: &Arc<Smp>) {
    let cell = Arc::new(AtomicCell::new(0));
    let barrier = Arc::new(Barrier::new(smp.nr_cpu_ids()));
    let wins = {
        let cell = Arc::clone(&cell);
        on_each_cpu(smp, move |_, cpu| {
            barrier.wait();
            cell.compare_and_swap(0, cpu.index() as isize + 1)
        })
    };
    smp.assume(cell.read() == 1);
    smp.check_fatal(wins.first() == Some(&true), "CPU 0 won but saw a failed swap");
    smp.check_fatal(
        wins.iter().filter(|won| **won).count() == 1,
        "compare-and-swap race did not have one winner",
    );
}

fn cpu_identity(smp: &Arc<Smp>) {
    let slots = on_each_cpu(smp, |smp, cpu| {
        for _ in 0..10 {
            smp.check(smp.current_cpu() == cpu, "CPU identity changed");
            thread::yield_now();
        }
        cpu
    });
    let distinct: HashSet<_> = slots.iter().copied().collect();
    smp.check_fatal(
        distinct.len() == smp.nr_cpu_ids(),
        "two workers shared a CPU",
    );
}

fn suppressed_check(smp: &Arc<Smp>) {
    let broken = Arc::new(AtomicCell::new(0));
    let barrier = Arc::new(Barrier::new(smp.nr_cpu_ids()));
    let state = Arc::clone(&broken);
    on_each_cpu(smp, move |smp, cpu| {
        barrier.wait();
        if cpu.index() == 0 {
            // Force the failure: silence checks, then break the state.
            smp.set_suppressed();
            state.write(1);
        } else {
            for _ in 0..COUNTER_ROUNDS {
                smp.bridge()
                    .check_with(|| state.read() == 0, "state broken without suppression");
            }
        }
    });
    smp.check_fatal(smp.is_suppressed(), "suppression was lost");
}

fn fatal_after_suppress(smp: &Arc<Smp>) {
    smp.set_suppressed();
    smp.check(false, "silenced after suppression");
    smp.check_fatal(false, "fatal check after suppression");
}

/// Work deferred until the end of a grace period.
struct Callback {
    cpu: usize,
    link: ListHead,
}

fn grace_period(smp: &Arc<Smp>) {
    let nr = smp.nr_cpu_ids();

    // One callback per CPU, queued before the grace period starts.
    let done = ListHead::new();
    done.init_empty();
    let callbacks: Vec<Callback> = (0..nr)
        .map(|cpu| Callback {
            cpu,
            link: ListHead::new(),
        })
        .collect();
    for cb in &callbacks {
        // SAFETY: `callbacks` and `done` outlive the list and never move.
        unsafe { done.insert_before(&cb.link) };
    }

    let all: isize = if nr == QSMASK_BITS {
        isize::MAX
    } else {
        (1 << nr) - 1
    };
    let qsmask = Arc::new(AtomicCell::new(0));
    let gp_seq = Arc::new(AtomicCell::new(0));
    let qs_seq = match smp.define_per_cpu::<AtomicCell>("rcu_qs_seq") {
        Ok(id) => id,
        Err(err) => smp.bridge().kernel_panic(&err.to_string()),
    };

    let workers = {
        let smp = Arc::clone(smp);
        let (qsmask, gp_seq) = (Arc::clone(&qsmask), Arc::clone(&gp_seq));
        thread::spawn(move || {
            on_each_cpu(&smp, move |smp, cpu| {
                // Wait for the grace period to start.
                let gp = loop {
                    let gp = smp_load_acquire(&*gp_seq);
                    if gp != 0 {
                        break gp;
                    }
                    thread::yield_now();
                };
                let bit: isize = 1 << cpu.index();
                let flags = smp.local_irq_save();
                match smp.per_cpu(qs_seq) {
                    Ok(seqs) => seqs.get(cpu).write(gp),
                    Err(err) => smp.bridge().kernel_panic(&err.to_string()),
                }
                let mut mask = qsmask.read();
                let remaining = loop {
                    smp.check(mask & bit != 0, "quiescent state reported twice");
                    match qsmask.compare_exchange(mask, mask & !bit) {
                        Ok(_) => break mask & !bit,
                        Err(actual) => mask = actual,
                    }
                };
                if remaining == 0 {
                    // Last reporter ends the grace period.
                    smp.raise_softirq();
                }
                smp.local_irq_restore(flags);
            });
        })
    };

    qsmask.write(all);
    smp_mb();
    smp_store_release(&*gp_seq, 1);

    // Drive the clock until the grace period ends or stalls.
    let timeout = smp.stall_timeout_jiffies();
    let start = smp.jiffies();
    while qsmask.read() != 0 {
        let now = smp.tick();
        if now.wrapping_sub(start) as u64 > timeout {
            pr_warn!(
                "INFO: rcu detected stall on CPUs with qsmask {:#x} ({} ticks)",
                qsmask.read(),
                timeout
            );
            break;
        }
        thread::yield_now();
    }

    if let Err(payload) = workers.join() {
        panic::resume_unwind(payload);
    }

    smp.check_fatal(qsmask.read() == 0, "grace period ended with CPUs pending");
    let seqs = match smp.per_cpu(qs_seq) {
        Ok(seqs) => seqs,
        Err(err) => smp.bridge().kernel_panic(&err.to_string()),
    };
    for cpu in smp.for_each_possible_cpu() {
        smp.check_fatal(
            seqs.get(cpu).read() == gp_seq.read(),
            "CPU missed the grace period",
        );
    }
    let enders = smp
        .for_each_online_cpu()
        .filter(|cpu| smp.take_softirq(*cpu))
        .count();
    smp.check_fatal(enders == 1, "grace period was not ended exactly once");

    // SAFETY: every node is still alive.
    smp.check_fatal(unsafe { done.check_integrity() }, "callback list corrupted");
    // SAFETY: as above; each node is the `link` field of a `Callback`.
    let invoked: Vec<usize> = unsafe {
        done.iter()
            .map(|node| (*container_of!(node.as_ptr(), Callback, link)).cpu)
            .collect()
    };
    smp.check_fatal(
        invoked == (0..nr).collect::<Vec<_>>(),
        "callbacks invoked out of order",
    );
    pr_info!("grace period {} completed on {} CPUs", gp_seq.read(), nr);
}
