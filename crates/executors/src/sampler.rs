use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

#[derive(Debug, Clone, Copy)]
pub struct ResourceSample {
    pub cpu_percent: f32,
    pub memory_bytes: u64,
}

/// CPU/RSS sampler for supervised children. One instance per supervisor;
/// `sample` refreshes only the requested pid, so the cost stays proportional
/// to the number of live executions.
pub struct ProcessSampler {
    system: System,
}

impl ProcessSampler {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }

    /// Returns `None` once the process is gone.
    pub fn sample(&mut self, pid: u32) -> Option<ResourceSample> {
        let pid = Pid::from_u32(pid);
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing().with_cpu().with_memory(),
        );
        let process = self.system.process(pid)?;
        Some(ResourceSample {
            cpu_percent: process.cpu_usage(),
            memory_bytes: process.memory(),
        })
    }
}

impl Default for ProcessSampler {
    fn default() -> Self {
        Self::new()
    }
}
