use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub i64);

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Promoter,
    Supervisor,
    BranchManager,
    RegionalManager,
    Admin,
    /// Internal identity of the escalation scheduler; never issued to a person.
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Promoter => "promoter",
            Self::Supervisor => "supervisor",
            Self::BranchManager => "branch_manager",
            Self::RegionalManager => "regional_manager",
            Self::Admin => "admin",
            Self::System => "system",
        }
    }

    /// Parses roles supplied by the auth provider. `system` is not accepted here.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "promoter" | "promotor" => Some(Self::Promoter),
            "supervisor" => Some(Self::Supervisor),
            "branch_manager" | "gerente_sucursal" => Some(Self::BranchManager),
            "regional_manager" | "gerente_regional" => Some(Self::RegionalManager),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }
}

/// The identity on whose behalf an operation runs, as supplied by the auth provider.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: Option<UserId>,
    pub role: Role,
}

impl Actor {
    pub fn user(id: UserId, role: Role) -> Self {
        Self { id: Some(id), role }
    }

    pub fn system() -> Self {
        Self { id: None, role: Role::System }
    }

    pub fn label(&self) -> String {
        match self.id {
            Some(id) => format!("{}:{id}", self.role.as_str()),
            None => self.role.as_str().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Actor, Role, UserId};

    #[test]
    fn role_parse_accepts_legacy_spanish_names() {
        assert_eq!(Role::parse("promotor"), Some(Role::Promoter));
        assert_eq!(Role::parse("gerente_regional"), Some(Role::RegionalManager));
        assert_eq!(Role::parse("Supervisor"), Some(Role::Supervisor));
    }

    #[test]
    fn role_parse_never_yields_system() {
        assert_eq!(Role::parse("system"), None);
    }

    #[test]
    fn actor_label_includes_role_and_id() {
        assert_eq!(Actor::user(UserId(7), Role::Promoter).label(), "promoter:7");
        assert_eq!(Actor::system().label(), "system");
    }
}
