use embudo_core::domain::agreement::NewFieldRule;
use embudo_core::domain::stage::{NewStage, Stage, StageType};
use embudo_core::domain::transition::NewTransition;

use crate::repositories::{
    FieldRuleRepository, FunnelStore, RepositoryError, StageRepository, TransitionRepository,
};

/// Default sales funnel. Timed ADVANCE stages each carry one default edge that sends
/// idle opportunities back to the pool through an exit stage.
const SEED_STAGES: &[SeedStage] = &[
    SeedStage { name: "Asignado", order: 1, exit: false, idle_hours: Some(72), color: "#1565c0" },
    SeedStage { name: "Contactado", order: 2, exit: false, idle_hours: Some(48), color: "#2196f3" },
    SeedStage { name: "Interesado", order: 3, exit: false, idle_hours: Some(72), color: "#4caf50" },
    SeedStage { name: "Negociacion", order: 4, exit: false, idle_hours: Some(48), color: "#ff9800" },
    SeedStage { name: "Venta", order: 5, exit: true, idle_hours: None, color: "#66bb6a" },
    SeedStage { name: "No contactado", order: 6, exit: true, idle_hours: None, color: "#ef9a9a" },
    SeedStage { name: "No interesado", order: 7, exit: true, idle_hours: None, color: "#ef5350" },
    SeedStage {
        name: "Negociacion caida",
        order: 8,
        exit: true,
        idle_hours: None,
        color: "#b71c1c",
    },
    SeedStage { name: "Descartado", order: 9, exit: true, idle_hours: None, color: "#9e9e9e" },
];

const SEED_TRANSITIONS: &[SeedTransition] = &[
    SeedTransition::manual("Asignado", "Contactado", "Marcar contactado"),
    SeedTransition::manual("Asignado", "No contactado", "No se logro contactar"),
    SeedTransition::timer("Asignado", "No contactado"),
    SeedTransition::manual("Contactado", "Interesado", "Cliente interesado"),
    SeedTransition::manual("Contactado", "No interesado", "Cliente no interesado"),
    SeedTransition::timer("Contactado", "No contactado"),
    SeedTransition::manual("Interesado", "Negociacion", "Iniciar negociacion"),
    SeedTransition::manual("Interesado", "No interesado", "Perdio interes"),
    SeedTransition::supervised("Interesado", "Descartado", "Descartar cliente", true, false),
    SeedTransition::timer("Interesado", "No interesado"),
    SeedTransition::manual("Negociacion", "Venta", "Registrar venta"),
    SeedTransition::manual("Negociacion", "Negociacion caida", "Negociacion fallida"),
    SeedTransition::timer("Negociacion", "Negociacion caida"),
    SeedTransition::supervised("No contactado", "Asignado", "Devolver al pool", false, true),
    SeedTransition::supervised("No interesado", "Interesado", "Retomar cliente", true, false),
    SeedTransition::supervised("No interesado", "Asignado", "Devolver al pool", false, true),
    SeedTransition::supervised("Negociacion caida", "Interesado", "Retomar cliente", true, false),
    SeedTransition::supervised("Negociacion caida", "Asignado", "Devolver al pool", false, true),
];

const SEED_FIELD_RULES: &[(&str, &str)] = &[
    ("IMSS", "nss"),
    ("IMSS", "phone"),
    ("ISSSTE", "phone"),
    ("ISSSTE", "rfc"),
];

struct SeedStage {
    name: &'static str,
    order: i32,
    exit: bool,
    idle_hours: Option<i64>,
    color: &'static str,
}

struct SeedTransition {
    origin: &'static str,
    destination: &'static str,
    action: &'static str,
    requires_note: bool,
    requires_supervisor: bool,
    returns_to_pool: bool,
    is_default: bool,
}

impl SeedTransition {
    const fn manual(origin: &'static str, destination: &'static str, action: &'static str) -> Self {
        Self {
            origin,
            destination,
            action,
            requires_note: true,
            requires_supervisor: false,
            returns_to_pool: false,
            is_default: false,
        }
    }

    const fn supervised(
        origin: &'static str,
        destination: &'static str,
        action: &'static str,
        requires_note: bool,
        returns_to_pool: bool,
    ) -> Self {
        Self {
            origin,
            destination,
            action,
            requires_note,
            requires_supervisor: true,
            returns_to_pool,
            is_default: false,
        }
    }

    const fn timer(origin: &'static str, destination: &'static str) -> Self {
        Self {
            origin,
            destination,
            action: "Timer vencido",
            requires_note: false,
            requires_supervisor: false,
            returns_to_pool: true,
            is_default: true,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SeedResult {
    pub stages_created: usize,
    pub transitions_created: usize,
    pub field_rules_upserted: usize,
    /// True when a catalog already existed and nothing was written.
    pub skipped: bool,
}

pub struct DefaultFunnel;

impl DefaultFunnel {
    /// Writes the default catalog into an empty store. A store that already has stages
    /// is left untouched.
    pub async fn load(store: &dyn FunnelStore) -> Result<SeedResult, RepositoryError> {
        if !store.list_stages(true).await?.is_empty() {
            return Ok(SeedResult { skipped: true, ..SeedResult::default() });
        }

        let mut result = SeedResult::default();
        let mut stages: Vec<Stage> = Vec::with_capacity(SEED_STAGES.len());
        for seed in SEED_STAGES {
            let stage = store
                .insert_stage(NewStage {
                    name: seed.name.to_string(),
                    order: seed.order,
                    stage_type: if seed.exit { StageType::Exit } else { StageType::Advance },
                    idle_timeout_hours: seed.idle_hours,
                    color: seed.color.to_string(),
                })
                .await?;
            stages.push(stage);
            result.stages_created += 1;
        }

        let stage_id = |name: &str| {
            stages.iter().find(|stage| stage.name == name).map(|stage| stage.id).ok_or_else(|| {
                RepositoryError::Constraint(format!("seed references unknown stage `{name}`"))
            })
        };
        for seed in SEED_TRANSITIONS {
            store
                .insert_transition(NewTransition {
                    origin_stage: stage_id(seed.origin)?,
                    destination_stage: stage_id(seed.destination)?,
                    action_name: seed.action.to_string(),
                    requires_note: seed.requires_note,
                    requires_supervisor: seed.requires_supervisor,
                    returns_to_pool: seed.returns_to_pool,
                    is_default: seed.is_default,
                })
                .await?;
            result.transitions_created += 1;
        }

        for (agreement_type, field_name) in SEED_FIELD_RULES {
            store
                .upsert_field_rule(NewFieldRule {
                    agreement_type: (*agreement_type).to_string(),
                    field_name: (*field_name).to_string(),
                    required: true,
                })
                .await?;
            result.field_rules_upserted += 1;
        }

        Ok(result)
    }

    pub fn stage_names() -> impl Iterator<Item = &'static str> {
        SEED_STAGES.iter().map(|stage| stage.name)
    }
}

#[cfg(test)]
mod tests {
    use super::DefaultFunnel;
    use crate::repositories::{InMemoryFunnelStore, StageRepository, TransitionRepository};

    #[tokio::test]
    async fn default_funnel_gives_every_timed_stage_one_default() {
        let store = InMemoryFunnelStore::new();
        let result = DefaultFunnel::load(&store).await.expect("seed");
        assert_eq!(result.stages_created, DefaultFunnel::stage_names().count());
        assert!(!result.skipped);

        let stages = store.list_stages(false).await.expect("stages");
        let transitions = store.list_transitions(None, false).await.expect("transitions");
        for stage in stages.iter().filter(|stage| stage.idle_timeout_hours.is_some()) {
            let defaults = transitions
                .iter()
                .filter(|t| t.origin_stage == stage.id && t.is_default)
                .count();
            assert_eq!(defaults, 1, "stage {} should have one default", stage.name);
        }
    }

    #[tokio::test]
    async fn seeding_twice_is_a_no_op() {
        let store = InMemoryFunnelStore::new();
        DefaultFunnel::load(&store).await.expect("first seed");
        let second = DefaultFunnel::load(&store).await.expect("second seed");
        assert!(second.skipped);
        assert_eq!(second.stages_created, 0);
    }
}
