// Clients for the external services the coordinator collaborates with.

pub mod blobs;
pub mod records;

/// Request timeout applied to every outbound service call.
pub(crate) const SERVICE_TIMEOUT_SECS: u64 = 10;
