use crate::calc;
use crate::db::{PendingValidationFilter, ReviewDecision};
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{opt_str_param, str_param, string_list_param, with_store};
use crate::ipc::types::{AppState, Request};
use crate::store::GradeStore;
use serde_json::json;
use std::collections::HashMap;
use tracing::{info, warn};

fn handle_grades_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_store(state, req, |store, params| {
        let class_id = str_param(params, "classId")?;
        let subject_id = str_param(params, "subjectId")?;
        let term_id = str_param(params, "termId")?;
        let grades = store
            .list_grades(class_id, subject_id, term_id)
            .map_err(HandlerErr::query)?;
        Ok(json!({ "grades": grades }))
    })
}

fn handle_grades_history(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_store(state, req, |store, params| {
        let grade_id = str_param(params, "gradeId")?;
        // 404 for unknown grades rather than an empty trail.
        store.get_grade(grade_id).map_err(HandlerErr::query)?;
        let history = store.grade_history(grade_id).map_err(HandlerErr::query)?;
        Ok(json!({ "history": history }))
    })
}

fn handle_pending_validations(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_store(state, req, |store, params| {
        let filter = PendingValidationFilter {
            term_id: opt_str_param(params, "termId").map(str::to_string),
            class_id: opt_str_param(params, "classId").map(str::to_string),
            subject_id: opt_str_param(params, "subjectId").map(str::to_string),
        };
        let batches = store
            .pending_validations(&filter)
            .map_err(HandlerErr::query)?;
        Ok(json!({ "pendingValidations": batches }))
    })
}

fn parse_decision(params: &serde_json::Value) -> Result<ReviewDecision, HandlerErr> {
    match str_param(params, "decision")? {
        "validate" => Ok(ReviewDecision::Validate),
        "reopen" => Ok(ReviewDecision::Reopen),
        "reject" => {
            let reason = opt_str_param(params, "reason")
                .ok_or_else(|| HandlerErr::bad_params("reject requires a reason"))?;
            Ok(ReviewDecision::Reject {
                reason: reason.to_string(),
            })
        }
        other => Err(
            HandlerErr::bad_params("decision must be one of: validate, reject, reopen")
                .with_details(json!({ "decision": other })),
        ),
    }
}

fn handle_grades_review(state: &mut AppState, req: &Request) -> serde_json::Value {
    let resp = with_store(state, req, |store, params| {
        let grade_ids = string_list_param(params, "gradeIds")?;
        if grade_ids.is_empty() {
            return Err(HandlerErr::bad_params("gradeIds must not be empty"));
        }
        let decision = parse_decision(params)?;
        let actor_id = opt_str_param(params, "actorId");
        let report = store
            .review_grades(&grade_ids, &decision, actor_id)
            .map_err(|e| HandlerErr::new("persistence_failed", e.to_string()))?;
        info!(
            updated = report.updated.len(),
            skipped = report.skipped.len(),
            ?decision,
            "grades reviewed"
        );
        Ok(json!(report))
    });

    // Keep an open entry view in step with the new statuses.
    if let (Some(store), Some(session)) = (state.store.as_ref(), state.session.as_mut()) {
        if let Err(e) = session.reload_grades(store) {
            warn!(error = %e, "could not refresh open grade entry after review");
        }
    }
    resp
}

fn handle_class_statistics(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_store(state, req, |store, params| {
        let class_id = str_param(params, "classId")?;
        let term_id = str_param(params, "termId")?;
        let subject_id = opt_str_param(params, "subjectId");

        let records = store
            .validated_grades(class_id, term_id, subject_id)
            .map_err(HandlerErr::query)?;
        let names: HashMap<String, String> = store
            .list_class_subjects(class_id)
            .map_err(HandlerErr::query)?
            .into_iter()
            .map(|cs| (cs.subject_id, cs.subject_name))
            .collect();

        let mut rows = calc::class_statistics(&records);
        for row in rows.iter_mut() {
            row.subject_name = names.get(&row.subject_id).cloned();
        }
        Ok(json!({ "statistics": rows }))
    })
}

fn handle_student_averages(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_store(state, req, |store, params| {
        let class_id = str_param(params, "classId")?;
        let subject_id = str_param(params, "subjectId")?;
        let term_id = str_param(params, "termId")?;

        let records = store
            .validated_grades(class_id, term_id, Some(subject_id))
            .map_err(HandlerErr::query)?;
        Ok(json!({ "averages": calc::student_averages(&records) }))
    })
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.list" => Some(handle_grades_list(state, req)),
        "grades.history" => Some(handle_grades_history(state, req)),
        "grades.pendingValidations" => Some(handle_pending_validations(state, req)),
        "grades.review" => Some(handle_grades_review(state, req)),
        "grades.classStatistics" => Some(handle_class_statistics(state, req)),
        "grades.studentAverages" => Some(handle_student_averages(state, req)),
        _ => None,
    }
}
