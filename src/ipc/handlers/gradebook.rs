use chrono::Utc;
use serde_json::{json, Value};

use crate::authz;
use crate::error::GradebookError;
use crate::finalize;
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::params;
use crate::ipc::types::{AppState, Request};
use crate::recompute;
use crate::repo;
use crate::signal;

fn handle_course_grade_get(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let actor = params::actor(&req.params)?;
    let course_id = params::req_str(&req.params, "courseId")?;
    let learner_id = params::opt_str(&req.params, "learnerId").unwrap_or_else(|| actor.id.clone());
    let s = state.session().ok_or_else(HandlerErr::no_workspace)?;
    let cg = finalize::get_course_grade(s.conn, &actor, &course_id, &learner_id)?;
    Ok(json!({ "courseGrade": serde_json::to_value(cg)? }))
}

fn handle_course_grade_breakdown(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let actor = params::actor(&req.params)?;
    let course_id = params::req_str(&req.params, "courseId")?;
    let learner_id = params::opt_str(&req.params, "learnerId").unwrap_or_else(|| actor.id.clone());
    let s = state.session().ok_or_else(HandlerErr::no_workspace)?;
    let score = finalize::preview_course_score(s.conn, &actor, &course_id, &learner_id)?;
    Ok(serde_json::to_value(score)?)
}

fn handle_course_grade_list(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let actor = params::actor(&req.params)?;
    let course_id = params::req_str(&req.params, "courseId")?;
    let s = state.session().ok_or_else(HandlerErr::no_workspace)?;
    let grades = finalize::list_course_grades(s.conn, &actor, &course_id)?;
    Ok(json!({ "courseGrades": serde_json::to_value(grades)? }))
}

fn handle_statistics(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let actor = params::actor(&req.params)?;
    let course_id = params::req_str(&req.params, "courseId")?;
    let s = state.session().ok_or_else(HandlerErr::no_workspace)?;
    let stats = finalize::course_statistics(s.conn, &actor, &course_id)?;
    Ok(serde_json::to_value(stats)?)
}

fn handle_attention(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let actor = params::actor(&req.params)?;
    let course_id = params::req_str(&req.params, "courseId")?;
    let threshold = params::req_decimal(&req.params, "threshold")?;
    let s = state.session().ok_or_else(HandlerErr::no_workspace)?;
    let grades = finalize::students_needing_attention(s.conn, &actor, &course_id, threshold)?;
    Ok(json!({ "courseGrades": serde_json::to_value(grades)? }))
}

fn handle_recalculate(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let actor = params::actor(&req.params)?;
    let course_id = params::req_str(&req.params, "courseId")?;
    let s = state.session().ok_or_else(HandlerErr::no_workspace)?;
    let report =
        recompute::recalculate_course_as(s.conn, &s.recalc, s.sink, &actor, &course_id, Utc::now())?;
    Ok(serde_json::to_value(report)?)
}

fn handle_completions_list(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let actor = params::actor(&req.params)?;
    let course_id = params::opt_str(&req.params, "courseId");
    let s = state.session().ok_or_else(HandlerErr::no_workspace)?;
    match course_id.as_deref() {
        Some(id) => {
            let course = repo::get_course(s.conn, id)?;
            authz::require_course_staff(&actor, &course, "list completions")?;
        }
        None if !actor.is_admin() => {
            return Err(
                GradebookError::forbidden("only admins may list completions across courses").into(),
            );
        }
        None => {}
    }
    let entries = signal::list_outbox(s.conn, course_id.as_deref())?;
    Ok(json!({ "completions": serde_json::to_value(entries)? }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "courseGrade.get" => handle_course_grade_get(state, req),
        "courseGrade.breakdown" => handle_course_grade_breakdown(state, req),
        "courseGrade.list" => handle_course_grade_list(state, req),
        "courseGrade.statistics" => handle_statistics(state, req),
        "courseGrade.needingAttention" => handle_attention(state, req),
        "courseGrade.recalculate" => handle_recalculate(state, req),
        "completions.list" => handle_completions_list(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
