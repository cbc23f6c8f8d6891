use uuid::Uuid;

/// CPU/memory limits applied to a single sandbox.
#[derive(Debug, Clone, Copy)]
pub struct ResourceLimits {
    pub cpu_count: u32,
    pub memory_mb: u32,
}

/// Per-sandbox configuration handed to a [`crate::SandboxFactory`].
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub id: Uuid,
    pub resources: ResourceLimits,
}
