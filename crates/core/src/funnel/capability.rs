use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::domain::actor::{Actor, Role};
use crate::errors::FunnelError;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    ExecuteTransition,
    /// Satisfies transitions flagged `requires_supervisor`.
    ApproveGatedTransition,
    /// Act on opportunities owned by someone else or sitting in the pool.
    ActOnAnyOpportunity,
    ReassignOpportunity,
    ClaimFromPool,
    AdministerCatalog,
    Escalate,
}

impl Capability {
    pub fn describe(&self) -> &'static str {
        match self {
            Self::ExecuteTransition => "execute funnel transitions",
            Self::ApproveGatedTransition => "approve supervisor-gated transitions",
            Self::ActOnAnyOpportunity => "act on opportunities owned by others",
            Self::ReassignOpportunity => "reassign opportunities",
            Self::ClaimFromPool => "claim opportunities from the pool",
            Self::AdministerCatalog => "administer the funnel catalog",
            Self::Escalate => "escalate idle opportunities",
        }
    }
}

/// Role → capability grants, consulted in one place instead of inline role checks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CapabilityTable {
    grants: HashMap<Role, HashSet<Capability>>,
}

impl Default for CapabilityTable {
    fn default() -> Self {
        use Capability::*;

        let managers = [ExecuteTransition, ActOnAnyOpportunity, ReassignOpportunity, ClaimFromPool];
        Self::empty()
            .grant_all(Role::Promoter, [ExecuteTransition, ClaimFromPool])
            .grant_all(Role::Supervisor, managers)
            .grant(Role::Supervisor, ApproveGatedTransition)
            .grant_all(Role::BranchManager, managers)
            .grant_all(Role::RegionalManager, managers)
            .grant_all(Role::Admin, managers)
            .grant_all(Role::Admin, [ApproveGatedTransition, AdministerCatalog])
            .grant(Role::System, Escalate)
    }
}

impl CapabilityTable {
    pub fn empty() -> Self {
        Self { grants: HashMap::new() }
    }

    pub fn grant(mut self, role: Role, capability: Capability) -> Self {
        self.grants.entry(role).or_default().insert(capability);
        self
    }

    pub fn grant_all(self, role: Role, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        capabilities.into_iter().fold(self, |table, capability| table.grant(role, capability))
    }

    pub fn revoke(mut self, role: Role, capability: Capability) -> Self {
        if let Some(granted) = self.grants.get_mut(&role) {
            granted.remove(&capability);
        }
        self
    }

    pub fn allows(&self, role: Role, capability: Capability) -> bool {
        self.grants.get(&role).map(|granted| granted.contains(&capability)).unwrap_or(false)
    }

    pub fn require(&self, actor: &Actor, capability: Capability) -> Result<(), FunnelError> {
        if self.allows(actor.role, capability) {
            Ok(())
        } else {
            Err(FunnelError::forbidden(actor.role, capability.describe()))
        }
    }
}
