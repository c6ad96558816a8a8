use anyhow::{Context, Result};

use crate::channels::MembershipPolicy;

/// Engine options. Built in code or read from the environment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOptions {
    pub membership_policy: MembershipPolicy,
}

impl SyncOptions {
    /// Reads `PARLEY_MEMBERSHIP_POLICY` (`explicit` or `backfill`).
    pub fn from_env() -> Result<Self> {
        let membership_policy = match std::env::var("PARLEY_MEMBERSHIP_POLICY") {
            Ok(value) => value
                .parse::<MembershipPolicy>()
                .with_context(|| format!("invalid PARLEY_MEMBERSHIP_POLICY '{}'", value))?,
            Err(_) => MembershipPolicy::default(),
        };

        Ok(Self { membership_policy })
    }
}
