//! CPU placement and scheduling priority for partition workers.
//!
//! Each service partition is meant to be served from its own CPU, so workers of partition `n`
//! are pinned to core `n % cores` when pinning is enabled. Both helpers are best effort: on
//! platforms without the underlying calls, or without the privileges they need, they report
//! failure and the worker keeps running unpinned at its default priority.

/// Number of CPUs the process may run on.
pub fn core_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Core that serves the workers of `partition`.
pub fn partition_core(partition: usize, cores: usize) -> usize {
    partition % cores.max(1)
}

/// Pin the calling thread to `core_id`.
///
/// Returns whether the affinity was applied.
///
/// # Platform Support
/// - **Linux**: `pthread_setaffinity_np`
/// - **Other platforms**: no-op, returns `false`
pub fn pin_current_thread(core_id: usize) -> bool {
    #[cfg(target_os = "linux")]
    unsafe {
        use libc::{cpu_set_t, pthread_self, pthread_setaffinity_np, CPU_SET, CPU_ZERO};
        let mut set: cpu_set_t = std::mem::zeroed();
        CPU_ZERO(&mut set);
        CPU_SET(core_id, &mut set);
        pthread_setaffinity_np(pthread_self(), std::mem::size_of::<cpu_set_t>(), &set) == 0
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = core_id;
        false
    }
}

/// Give the calling worker a scheduling priority.
///
/// # Platform-Specific Behavior
///
/// ## Linux
/// - `priority >= 2`: `SCHED_FIFO` at 70
/// - `priority == 1`: `SCHED_RR` at 30
/// - otherwise: `SCHED_OTHER`
///
/// Real-time classes need `CAP_SYS_NICE`; without it the call fails and `false` is returned.
///
/// ## macOS
/// Mapped onto QoS classes (user-initiated, utility, background).
pub fn set_thread_priority(priority: i32) -> bool {
    #[cfg(target_os = "linux")]
    {
        use libc::{
            pthread_self, pthread_setschedparam, sched_param, SCHED_FIFO, SCHED_OTHER, SCHED_RR,
        };

        let (policy, sched_priority) = match priority {
            p if p >= 2 => (SCHED_FIFO, 70),
            1 => (SCHED_RR, 30),
            _ => (SCHED_OTHER, 0),
        };
        unsafe {
            let mut param: sched_param = std::mem::zeroed();
            param.sched_priority = sched_priority;
            pthread_setschedparam(pthread_self(), policy, &param) == 0
        }
    }
    #[cfg(target_os = "macos")]
    {
        // pthread/qos.h
        const QOS_CLASS_USER_INITIATED: u32 = 0x19;
        const QOS_CLASS_UTILITY: u32 = 0x15;
        const QOS_CLASS_BACKGROUND: u32 = 0x09;

        extern "C" {
            fn pthread_set_qos_class_self_np(qos_class: u32, relative_priority: i32) -> i32;
        }

        let qos_class = match priority {
            p if p >= 2 => QOS_CLASS_USER_INITIATED,
            1 => QOS_CLASS_UTILITY,
            _ => QOS_CLASS_BACKGROUND,
        };
        unsafe { pthread_set_qos_class_self_np(qos_class, 0) == 0 }
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos")))]
    {
        let _ = priority;
        false
    }
}
