//! `printk` family on top of `tracing`.
//!
//! Output goes to whatever subscriber the embedding process installed, under
//! the `printk` target. `pr_cont!` continues the previous line in the kernel;
//! here it becomes its own event at the same level as `pr_info!`.

/// `printk(fmt, ...)`.
#[macro_export]
macro_rules! printk {
    ($($arg:tt)+) => {
        $crate::__private::tracing::info!(target: "printk", $($arg)+)
    };
}

/// `pr_info(fmt, ...)`.
#[macro_export]
macro_rules! pr_info {
    ($($arg:tt)+) => {
        $crate::__private::tracing::info!(target: "printk", $($arg)+)
    };
}

/// `pr_warn(fmt, ...)`.
#[macro_export]
macro_rules! pr_warn {
    ($($arg:tt)+) => {
        $crate::__private::tracing::warn!(target: "printk", $($arg)+)
    };
}

/// `pr_err(fmt, ...)`.
#[macro_export]
macro_rules! pr_err {
    ($($arg:tt)+) => {
        $crate::__private::tracing::error!(target: "printk", $($arg)+)
    };
}

/// `pr_cont(fmt, ...)`.
#[macro_export]
macro_rules! pr_cont {
    ($($arg:tt)+) => {
        $crate::__private::tracing::info!(target: "printk", cont = true, $($arg)+)
    };
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    #[test]
    fn macros_expand_without_a_subscriber() {
        let cpu = 1;
        crate::printk!("rcu: cpu{cpu} online");
        crate::pr_info!("rcu: {} levels", 2);
        crate::pr_warn!("rcu: stall on cpu{}", cpu);
        crate::pr_err!("rcu: bad gp");
        crate::pr_cont!(" ({} jiffies)", 21);
    }
}
