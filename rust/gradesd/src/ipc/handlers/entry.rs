use std::rc::Rc;
use std::time::Duration;

use crate::autosave::Clock;
use crate::context::ContextKey;
use crate::db::SqliteStore;
use crate::ipc::error::{err, event, respond, HandlerErr};
use crate::ipc::helpers::{
    date_param, grade_type_param, opt_str_param, positive_u32_param, raw_grade_param, str_param,
};
use crate::ipc::types::{AppState, Request};
use crate::session::{GradeEntrySession, NewEvaluationOutcome, SubmissionMode};
use serde_json::json;
use tracing::{info, warn};

/// Runs `f` against the open grade entry and its store.
fn with_session<F>(state: &mut AppState, req: &Request, f: F) -> serde_json::Value
where
    F: FnOnce(
        &SqliteStore,
        &mut GradeEntrySession,
        &serde_json::Value,
    ) -> Result<serde_json::Value, HandlerErr>,
{
    let Some(store) = state.store.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(session) = state.session.as_mut() else {
        return err(&req.id, "no_session", "open a grade entry first", None);
    };
    respond(&req.id, f(store, session, &req.params))
}

fn handle_open(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(store) = state.store.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let opened = (|| -> Result<GradeEntrySession, HandlerErr> {
        let p = &req.params;
        let key = ContextKey::new(
            str_param(p, "classId")?,
            str_param(p, "subjectId")?,
            str_param(p, "termId")?,
            grade_type_param(p, "type")?,
            opt_str_param(p, "description"),
            date_param(p, "gradeDate")?,
        );
        let weight = positive_u32_param(p, "weight", 1)?;
        let clock: Rc<dyn Clock> = state.clock.clone();
        Ok(GradeEntrySession::open(
            store,
            key,
            weight,
            state.config.scheduler(),
            clock,
        )?)
    })();

    match opened {
        Ok(session) => {
            // A new evaluation always gets a fresh session and buffer.
            let dropped = state
                .session
                .take()
                .map(|mut previous| previous.close())
                .unwrap_or(0);
            let mut body = json!(session.snapshot());
            body["droppedPending"] = json!(dropped);
            state.session = Some(session);
            respond(&req.id, Ok(body))
        }
        Err(e) => e.response(&req.id),
    }
}

fn handle_state(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_session(state, req, |_, session, _| Ok(json!(session.snapshot())))
}

fn handle_close(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(mut session) = state.session.take() else {
        return err(&req.id, "no_session", "no grade entry is open", None);
    };
    let dropped = session.close();
    respond(&req.id, Ok(json!({ "closed": true, "droppedPending": dropped })))
}

fn handle_change(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_session(state, req, |store, session, params| {
        let student_id = str_param(params, "studentId")?;
        let raw = raw_grade_param(params, "value")?;
        match session.handle_grade_change(store, student_id, &raw) {
            Ok(outcome) => Ok(json!({ "outcome": outcome, "state": session.snapshot() })),
            Err(e) if e.code() == "invalid_grade" => Err(HandlerErr::from(e)
                .with_details(json!({ "studentId": student_id, "input": raw }))),
            Err(e) => Err(e.into()),
        }
    })
}

fn handle_save(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_session(state, req, |store, session, _| {
        let outcome = session.handle_save_pending(store)?;
        Ok(json!({ "save": outcome, "state": session.snapshot() }))
    })
}

fn handle_submit(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_session(state, req, |store, session, params| {
        let mode = match params.get("mode") {
            None | Some(serde_json::Value::Null) => SubmissionMode::default(),
            Some(v) => serde_json::from_value::<SubmissionMode>(v.clone()).map_err(|_| {
                HandlerErr::bad_params("mode must be one of: allDrafts, selected")
            })?,
        };
        let count = session.handle_submit_for_validation(store, mode)?;
        Ok(json!({
            "count": count,
            "confirmation": session.confirmation(),
            "state": session.snapshot(),
        }))
    })
}

fn handle_select(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_session(state, req, |_, session, params| {
        let grade_id = str_param(params, "gradeId")?;
        let selected = params
            .get("selected")
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
        session.toggle_selection(grade_id, selected)?;
        Ok(json!({ "selection": session.snapshot().selection }))
    })
}

fn handle_confirm_submit(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_session(state, req, |store, session, _| {
        let submitted = session.confirm_submit(store)?;
        Ok(json!({ "submitted": submitted, "state": session.snapshot() }))
    })
}

fn handle_new_evaluation(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(session) = state.session.as_mut() else {
        return err(&req.id, "no_session", "no grade entry is open", None);
    };
    match session.handle_new_evaluation() {
        NewEvaluationOutcome::Proceed => {
            if let Some(mut s) = state.session.take() {
                s.close();
            }
            respond(
                &req.id,
                Ok(json!({ "outcome": NewEvaluationOutcome::Proceed, "closed": true })),
            )
        }
        NewEvaluationOutcome::ConfirmationRequired => respond(
            &req.id,
            Ok(json!({
                "outcome": NewEvaluationOutcome::ConfirmationRequired,
                "confirmation": session.confirmation(),
            })),
        ),
    }
}

fn handle_confirm_reset(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(store) = state.store.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(session) = state.session.as_mut() else {
        return err(&req.id, "no_session", "open a grade entry first", None);
    };
    match session.confirm_reset(store) {
        Ok(report) => {
            if let Some(mut s) = state.session.take() {
                s.close();
            }
            respond(
                &req.id,
                Ok(json!({
                    "deleted": report.deleted,
                    "retained": report.retained,
                    "closed": true,
                })),
            )
        }
        Err(e) => HandlerErr::from(e).response(&req.id),
    }
}

fn handle_teachers(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_session(state, req, |store, session, params| {
        let search = opt_str_param(params, "search").map(str::to_string);
        let teachers = session.qualified_teachers(store, search)?;
        Ok(json!({
            "teachers": teachers,
            "currentTeacherId": session.context().teacher_id(),
        }))
    })
}

fn handle_assign(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_session(state, req, |store, session, params| {
        let teacher_id = str_param(params, "teacherId")?;
        let outcome = session.request_assignment(store, teacher_id)?;
        Ok(json!({ "outcome": outcome, "state": session.snapshot() }))
    })
}

fn handle_confirm_assignment(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_session(state, req, |store, session, _| {
        session.confirm_assignment(store)?;
        Ok(json!({ "state": session.snapshot() }))
    })
}

fn handle_cancel(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_session(state, req, |_, session, _| {
        let cancelled = session.cancel_confirmation();
        Ok(json!({ "cancelled": cancelled }))
    })
}

/// Time until the open entry next needs `tick`, if it needs it at all.
pub fn next_wake(state: &AppState) -> Option<Duration> {
    let deadline = state.session.as_ref()?.next_wake()?;
    Some(Duration::from_millis(
        deadline.saturating_sub(state.clock.now_ms()),
    ))
}

/// Drives the auto-save timer. Returns the event lines to emit.
pub fn tick(state: &mut AppState) -> Vec<serde_json::Value> {
    let (Some(store), Some(session)) = (state.store.as_ref(), state.session.as_mut()) else {
        return Vec::new();
    };
    let Some(result) = session.tick(store) else {
        return Vec::new();
    };

    let body = match result {
        Ok(outcome) => {
            info!(?outcome, "auto-save fired");
            json!({ "save": outcome, "state": session.snapshot() })
        }
        Err(e) => {
            warn!(error = %e, "auto-save failed");
            let e = HandlerErr::from(e);
            json!({ "error": e.to_json(), "state": session.snapshot() })
        }
    };
    vec![event("entry.autosave", body)]
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "entry.open" => Some(handle_open(state, req)),
        "entry.state" => Some(handle_state(state, req)),
        "entry.close" => Some(handle_close(state, req)),
        "entry.change" => Some(handle_change(state, req)),
        "entry.save" => Some(handle_save(state, req)),
        "entry.submit" => Some(handle_submit(state, req)),
        "entry.select" => Some(handle_select(state, req)),
        "entry.confirmSubmit" => Some(handle_confirm_submit(state, req)),
        "entry.newEvaluation" => Some(handle_new_evaluation(state, req)),
        "entry.confirmReset" => Some(handle_confirm_reset(state, req)),
        "entry.teachers" => Some(handle_teachers(state, req)),
        "entry.assign" => Some(handle_assign(state, req)),
        "entry.confirmAssignment" => Some(handle_confirm_assignment(state, req)),
        "entry.cancel" => Some(handle_cancel(state, req)),
        _ => None,
    }
}
