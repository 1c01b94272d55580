//! Stage/transition catalog: administrative validation and read-side lookups.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::agreement::{AgreementFieldRule, NewFieldRule};
use crate::domain::stage::{
    NewStage, Stage, StageId, StagePatch, StageType, MAX_IDLE_TIMEOUT_HOURS,
};
use crate::domain::transition::{NewTransition, Transition, TransitionId, TransitionPatch};
use crate::errors::FunnelError;

/// Immutable view of the catalog used for one decision or one sweep.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogSnapshot {
    pub stages: Vec<Stage>,
    pub transitions: Vec<Transition>,
    pub field_rules: Vec<AgreementFieldRule>,
}

impl CatalogSnapshot {
    pub fn new(
        mut stages: Vec<Stage>,
        mut transitions: Vec<Transition>,
        mut field_rules: Vec<AgreementFieldRule>,
    ) -> Self {
        stages.sort_by_key(|stage| (stage.order, stage.id));
        transitions.sort_by_key(|transition| transition.id);
        field_rules.sort_by(|left, right| {
            (&left.agreement_type, &left.field_name).cmp(&(&right.agreement_type, &right.field_name))
        });
        Self { stages, transitions, field_rules }
    }

    pub fn stage(&self, id: StageId) -> Option<&Stage> {
        self.stages.iter().find(|stage| stage.id == id)
    }

    pub fn transition(&self, id: TransitionId) -> Option<&Transition> {
        self.transitions.iter().find(|transition| transition.id == id)
    }

    /// Active stages ordered by `order`.
    pub fn active_stages(&self) -> impl Iterator<Item = &Stage> {
        self.stages.iter().filter(|stage| stage.active)
    }

    pub fn first_active_stage(&self) -> Option<&Stage> {
        self.active_stages().next()
    }

    /// Active transitions leaving `stage`, ordered by id.
    pub fn outgoing(&self, stage: StageId) -> impl Iterator<Item = &Transition> {
        self.transitions
            .iter()
            .filter(move |transition| transition.origin_stage == stage && transition.active)
    }

    /// The transition flagged `is_default` on `stage`, active or not. An active flagged
    /// edge wins over an inactive one.
    pub fn default_transition(&self, stage: StageId) -> Option<&Transition> {
        let mut flagged = self
            .transitions
            .iter()
            .filter(|transition| transition.origin_stage == stage && transition.is_default);
        let first = flagged.next()?;
        if first.active {
            return Some(first);
        }
        flagged.find(|transition| transition.active).or(Some(first))
    }

    pub fn field_rules_for(&self, agreement_type: &str) -> Vec<AgreementFieldRule> {
        self.field_rules
            .iter()
            .filter(|rule| rule.agreement_type == agreement_type)
            .cloned()
            .collect()
    }

    /// An exit with no way out. Committing into it closes the opportunity unless the
    /// edge returns it to the pool.
    pub fn is_terminal_exit(&self, transition: &Transition, destination: &Stage) -> bool {
        destination.stage_type == StageType::Exit
            && !transition.returns_to_pool
            && self.outgoing(destination.id).next().is_none()
    }
}

pub fn validate_new_stage(new: &NewStage, existing: &[Stage]) -> Result<(), FunnelError> {
    require_text("stage name", &new.name)?;
    require_text("stage color", &new.color)?;
    validate_idle_timeout(new.idle_timeout_hours)?;
    ensure_order_free(new.order, None, existing)
}

/// Applies `patch` to `current`, returning the updated stage or a ConfigError; nothing
/// about `current` changes on failure.
pub fn apply_stage_patch(
    current: &Stage,
    patch: StagePatch,
    existing: &[Stage],
) -> Result<Stage, FunnelError> {
    let mut next = current.clone();
    next.name = patch.name.apply_required(next.name, "name")?;
    next.order = patch.order.apply_required(next.order, "order")?;
    next.stage_type = patch.stage_type.apply_required(next.stage_type, "stage_type")?;
    next.idle_timeout_hours = patch.idle_timeout_hours.apply_nullable(next.idle_timeout_hours);
    next.color = patch.color.apply_required(next.color, "color")?;
    next.active = patch.active.apply_required(next.active, "active")?;

    require_text("stage name", &next.name)?;
    require_text("stage color", &next.color)?;
    validate_idle_timeout(next.idle_timeout_hours)?;
    if next.active {
        ensure_order_free(next.order, Some(next.id), existing)?;
    }
    Ok(next)
}

pub fn validate_new_transition(
    new: &NewTransition,
    stages: &[Stage],
    transitions: &[Transition],
) -> Result<(), FunnelError> {
    require_text("action name", &new.action_name)?;
    find_stage(stages, new.origin_stage)?;
    let destination = find_stage(stages, new.destination_stage)?;
    if !destination.active {
        return Err(FunnelError::Config(format!(
            "destination stage `{}` is inactive",
            destination.name
        )));
    }
    if new.is_default {
        ensure_single_default(new.origin_stage, None, transitions)?;
    }
    Ok(())
}

pub fn apply_transition_patch(
    current: &Transition,
    patch: TransitionPatch,
    stages: &[Stage],
    transitions: &[Transition],
) -> Result<Transition, FunnelError> {
    let mut next = current.clone();
    let retargeted = !patch.destination_stage.is_absent();
    next.destination_stage =
        patch.destination_stage.apply_required(next.destination_stage, "destination_stage")?;
    next.action_name = patch.action_name.apply_required(next.action_name, "action_name")?;
    next.requires_note = patch.requires_note.apply_required(next.requires_note, "requires_note")?;
    next.requires_supervisor =
        patch.requires_supervisor.apply_required(next.requires_supervisor, "requires_supervisor")?;
    next.returns_to_pool =
        patch.returns_to_pool.apply_required(next.returns_to_pool, "returns_to_pool")?;
    next.is_default = patch.is_default.apply_required(next.is_default, "is_default")?;
    next.active = patch.active.apply_required(next.active, "active")?;

    require_text("action name", &next.action_name)?;
    let destination = find_stage(stages, next.destination_stage)?;
    if retargeted && !destination.active {
        return Err(FunnelError::Config(format!(
            "destination stage `{}` is inactive",
            destination.name
        )));
    }
    if next.is_default && next.active {
        ensure_single_default(next.origin_stage, Some(next.id), transitions)?;
    }
    Ok(next)
}

pub fn validate_field_rule(rule: &NewFieldRule) -> Result<(), FunnelError> {
    require_text("agreement type", &rule.agreement_type)?;
    require_text("field name", &rule.field_name)
}

/// Pairs of active stages sharing an `order`. Empty for a consistent catalog.
pub fn order_collisions(stages: &[Stage]) -> Vec<(StageId, StageId)> {
    let mut seen: BTreeMap<i32, StageId> = BTreeMap::new();
    let mut collisions = Vec::new();
    for stage in stages.iter().filter(|stage| stage.active) {
        if let Some(previous) = seen.insert(stage.order, stage.id) {
            collisions.push((previous, stage.id));
        }
    }
    collisions
}

fn find_stage(stages: &[Stage], id: StageId) -> Result<&Stage, FunnelError> {
    stages.iter().find(|stage| stage.id == id).ok_or_else(|| FunnelError::not_found("stage", id))
}

fn require_text(label: &str, value: &str) -> Result<(), FunnelError> {
    if value.trim().is_empty() {
        Err(FunnelError::Config(format!("{label} must not be empty")))
    } else {
        Ok(())
    }
}

fn validate_idle_timeout(hours: Option<i64>) -> Result<(), FunnelError> {
    match hours {
        Some(hours) if hours <= 0 => Err(FunnelError::Config(format!(
            "idle_timeout_hours must be greater than zero, got {hours}"
        ))),
        Some(hours) if hours > MAX_IDLE_TIMEOUT_HOURS => Err(FunnelError::Config(format!(
            "idle_timeout_hours must be at most {MAX_IDLE_TIMEOUT_HOURS}, got {hours}"
        ))),
        _ => Ok(()),
    }
}

fn ensure_order_free(
    order: i32,
    ignore: Option<StageId>,
    existing: &[Stage],
) -> Result<(), FunnelError> {
    let taken = existing
        .iter()
        .find(|stage| stage.active && stage.order == order && Some(stage.id) != ignore);
    match taken {
        Some(stage) => Err(FunnelError::Config(format!(
            "order {order} is already used by active stage `{}`",
            stage.name
        ))),
        None => Ok(()),
    }
}

fn ensure_single_default(
    origin: StageId,
    ignore: Option<TransitionId>,
    transitions: &[Transition],
) -> Result<(), FunnelError> {
    let taken = transitions.iter().find(|transition| {
        transition.origin_stage == origin
            && transition.is_default
            && transition.active
            && Some(transition.id) != ignore
    });
    match taken {
        Some(transition) => Err(FunnelError::Config(format!(
            "stage `{origin}` already has default transition `{}`",
            transition.action_name
        ))),
        None => Ok(()),
    }
}
