use crate::domain::agreement::AgreementFieldRule;
use crate::domain::opportunity::Opportunity;
use crate::errors::{FunnelError, ValidationFailure};

fn required_rules<'a>(
    opportunity: &'a Opportunity,
    rules: &'a [AgreementFieldRule],
) -> impl Iterator<Item = &'a AgreementFieldRule> {
    let mut matching: Vec<&AgreementFieldRule> = rules
        .iter()
        .filter(|rule| rule.required && rule.agreement_type == opportunity.agreement_type)
        .collect();
    matching.sort_by(|left, right| left.field_name.cmp(&right.field_name));
    matching.into_iter()
}

/// Fails on the first required field (by name) the opportunity has left blank.
pub fn validate_fields(
    opportunity: &Opportunity,
    rules: &[AgreementFieldRule],
) -> Result<(), FunnelError> {
    match required_rules(opportunity, rules).find(|rule| opportunity.field(&rule.field_name).is_none())
    {
        Some(rule) => Err(ValidationFailure::MissingRequiredField {
            agreement_type: opportunity.agreement_type.clone(),
            field: rule.field_name.clone(),
        }
        .into()),
        None => Ok(()),
    }
}

pub fn missing_fields(opportunity: &Opportunity, rules: &[AgreementFieldRule]) -> Vec<String> {
    required_rules(opportunity, rules)
        .filter(|rule| opportunity.field(&rule.field_name).is_none())
        .map(|rule| rule.field_name.clone())
        .collect()
}
