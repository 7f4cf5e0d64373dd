//! Parameter synchronisation side-table.
//!
//! Gate and expert parameters of intra-device routers must not be averaged over
//! the data-parallel group. Layers record that here at construction; the
//! optimizer-side `synchronize_gradients` consults the table instead of
//! flags attached to tensors.

use std::collections::HashMap;

/// How a parameter's gradient is synchronised.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SyncPolicy {
    /// Averaged over the data-parallel group
    #[default]
    DataParallel,
    /// Averaged only within the named expert group (or kept local)
    ExpertGroup { group_name: String },
}

/// Parameter path -> synchronisation policy.
#[derive(Debug, Clone, Default)]
pub struct ParamSyncRegistry {
    policies: HashMap<String, SyncPolicy>,
}

impl ParamSyncRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, param: impl Into<String>, policy: SyncPolicy) {
        self.policies.insert(param.into(), policy);
    }

    /// Register several parameters with the same policy.
    pub fn register_all<I, S>(&mut self, params: I, policy: SyncPolicy)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for param in params {
            self.register(param, policy.clone());
        }
    }

    /// Policy for a parameter; unregistered parameters are data-parallel.
    pub fn policy(&self, param: &str) -> SyncPolicy {
        self.policies.get(param).cloned().unwrap_or_default()
    }

    pub fn extend(&mut self, other: ParamSyncRegistry) {
        self.policies.extend(other.policies);
    }

    /// Sorted names of parameters excluded from data-parallel averaging.
    pub fn expert_params(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .policies
            .iter()
            .filter(|(_, policy)| matches!(policy, SyncPolicy::ExpertGroup { .. }))
            .map(|(name, _)| name.as_str())
            .collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}
