use chrono::{NaiveDate, NaiveTime};

use crate::limits::*;
use crate::model::{SubmitRequest, SurveyRequest};

use super::EngineError;

/// Bookable slots run hourly from 09:00 to 17:00 (last start 16:00).
const SLOT_FIRST_HOUR: u32 = 9;
const SLOT_LAST_HOUR: u32 = 17;

/// The fixed daily slot grid.
pub(crate) fn day_slot_grid() -> Vec<NaiveTime> {
    (SLOT_FIRST_HOUR..SLOT_LAST_HOUR)
        .filter_map(|h| NaiveTime::from_hms_opt(h, 0, 0))
        .collect()
}

/// Shape-check a submit request. Past booking dates are accepted — the
/// decision rule treats them as "no future booking" and creates a new record.
pub(crate) fn validate_submission(
    req: &SubmitRequest,
    today: NaiveDate,
) -> Result<(), EngineError> {
    validate_email(&req.email)?;
    if req.name.trim().is_empty() {
        return Err(EngineError::Validation("name must not be empty"));
    }
    if req.name.len() > MAX_NAME_LEN {
        return Err(EngineError::Validation("name too long"));
    }
    if let Some(ref d) = req.description
        && d.len() > MAX_DESCRIPTION_LEN {
            return Err(EngineError::Validation("description too long"));
        }
    if req.booking_date > today + chrono::Days::new(MAX_DAYS_AHEAD as u64) {
        return Err(EngineError::Validation("booking date too far ahead"));
    }
    Ok(())
}

/// Shape-check a survey submission. Empty answer lists are fine.
pub(crate) fn validate_survey(req: &SurveyRequest) -> Result<(), EngineError> {
    let lists = [
        &req.role,
        &req.cloud_usage,
        &req.development_approach,
        &req.team_size,
        &req.primary_goals,
    ];
    for list in lists {
        if list.len() > MAX_SURVEY_CHOICES {
            return Err(EngineError::Validation("too many survey answers"));
        }
        if list.iter().any(|a| a.trim().is_empty()) {
            return Err(EngineError::Validation("survey answer must not be empty"));
        }
        if list.iter().any(|a| a.len() > MAX_SURVEY_ANSWER_LEN) {
            return Err(EngineError::Validation("survey answer too long"));
        }
    }
    if let Some(ref goal) = req.other_goal
        && goal.len() > MAX_SURVEY_ANSWER_LEN {
            return Err(EngineError::Validation("survey answer too long"));
        }
    Ok(())
}

pub(crate) fn validate_email(email: &str) -> Result<(), EngineError> {
    let trimmed = email.trim();
    if trimmed.is_empty() {
        return Err(EngineError::Validation("email must not be empty"));
    }
    if trimmed.len() > MAX_EMAIL_LEN {
        return Err(EngineError::Validation("email too long"));
    }
    let Some((local, domain)) = trimmed.split_once('@') else {
        return Err(EngineError::Validation("email missing '@'"));
    };
    if local.is_empty() || domain.is_empty() || domain.contains('@') {
        return Err(EngineError::Validation("malformed email"));
    }
    Ok(())
}
