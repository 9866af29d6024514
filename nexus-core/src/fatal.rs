//! Escalation for faults the cache cannot recover from.

use crate::config::FatalPolicy;
use crate::error::NexusError;

/// Log `err` and stop according to `policy`.
///
/// Used when the local cache could be left inconsistent with the store,
/// for example after the bounded retries of a store call run out.
pub fn fatal(policy: FatalPolicy, err: &NexusError) -> ! {
    tracing::error!(error = %err, ?policy, "unrecoverable consistency fault");
    match policy {
        FatalPolicy::Abort => std::process::abort(),
        FatalPolicy::Panic => panic!("unrecoverable consistency fault: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;

    #[test]
    #[should_panic(expected = "unrecoverable consistency fault")]
    fn test_panic_policy_panics() {
        fatal(FatalPolicy::Panic, &StoreError::Closed.into());
    }
}
