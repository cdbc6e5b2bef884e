/// A VM checked out of the pool by [`crate::VmPool::acquire`].
///
/// Must be returned via [`crate::VmPool::release`] on every exit path
/// (§5 "Liveness", §8 invariant P6) — success, adapter error, retry
/// exhaustion, or cancellation.
#[derive(Debug, Clone)]
pub struct VmLease {
    pub vm_name: String,
    pub edr_label: String,
    pub public_ip: String,
    pub private_ip: String,
}
