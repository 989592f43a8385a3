use chrono::Utc;
use serde_json::{json, Value};

use crate::grading::{self, GradeInput};
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::params;
use crate::ipc::types::{AppState, Request};

fn grade_input(p: &Value) -> Result<GradeInput, HandlerErr> {
    let excused = params::opt_bool(p, "excused")?.unwrap_or(false);
    // Excusing does not need a score.
    let points_earned = match params::opt_decimal(p, "pointsEarned")? {
        Some(v) => v,
        None if excused => Default::default(),
        None => return Err(HandlerErr::bad_params("missing pointsEarned")),
    };
    Ok(GradeInput {
        points_earned,
        feedback: p
            .get("feedback")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        excused,
    })
}

fn handle_grade(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let actor = params::actor(&req.params)?;
    let submission_id = params::req_str(&req.params, "submissionId")?;
    let input = grade_input(&req.params)?;
    let s = state.session().ok_or_else(HandlerErr::no_workspace)?;
    let outcome = grading::grade_submission(s.conn, s.sink, &actor, &submission_id, input, Utc::now())?;
    Ok(serde_json::to_value(outcome)?)
}

fn handle_update(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let actor = params::actor(&req.params)?;
    let grade_id = params::req_str(&req.params, "gradeId")?;
    let input = grade_input(&req.params)?;
    let s = state.session().ok_or_else(HandlerErr::no_workspace)?;
    let outcome = grading::update_grade(s.conn, s.sink, &actor, &grade_id, input, Utc::now())?;
    Ok(serde_json::to_value(outcome)?)
}

fn handle_release(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let actor = params::actor(&req.params)?;
    let grade_id = params::req_str(&req.params, "gradeId")?;
    let s = state.session().ok_or_else(HandlerErr::no_workspace)?;
    let grade = grading::release_grade(s.conn, &actor, &grade_id, Utc::now())?;
    Ok(json!({ "grade": serde_json::to_value(grade)? }))
}

fn handle_release_all(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let actor = params::actor(&req.params)?;
    let assignment_id = params::req_str(&req.params, "assignmentId")?;
    let s = state.session().ok_or_else(HandlerErr::no_workspace)?;
    let released = grading::release_all_grades(s.conn, &actor, &assignment_id, Utc::now())?;
    Ok(json!({ "released": released }))
}

fn handle_get(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let actor = params::actor(&req.params)?;
    let grade_id = params::req_str(&req.params, "gradeId")?;
    let s = state.session().ok_or_else(HandlerErr::no_workspace)?;
    let grade = grading::get_grade(s.conn, &actor, &grade_id)?;
    Ok(json!({ "grade": serde_json::to_value(grade)? }))
}

fn handle_by_submission(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let actor = params::actor(&req.params)?;
    let submission_id = params::req_str(&req.params, "submissionId")?;
    let s = state.session().ok_or_else(HandlerErr::no_workspace)?;
    let grade = grading::grade_for_submission(s.conn, &actor, &submission_id)?;
    Ok(json!({ "grade": serde_json::to_value(grade)? }))
}

fn handle_list_by_assignment(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let actor = params::actor(&req.params)?;
    let assignment_id = params::req_str(&req.params, "assignmentId")?;
    let s = state.session().ok_or_else(HandlerErr::no_workspace)?;
    let grades = grading::grades_for_assignment(s.conn, &actor, &assignment_id)?;
    Ok(json!({ "grades": serde_json::to_value(grades)? }))
}

fn handle_released(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let actor = params::actor(&req.params)?;
    let learner_id = params::opt_str(&req.params, "learnerId").unwrap_or_else(|| actor.id.clone());
    let s = state.session().ok_or_else(HandlerErr::no_workspace)?;
    let grades = grading::released_grades(s.conn, &actor, &learner_id)?;
    Ok(json!({ "grades": serde_json::to_value(grades)? }))
}

fn handle_grade_stats(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let actor = params::actor(&req.params)?;
    let assignment_id = params::req_str(&req.params, "assignmentId")?;
    let s = state.session().ok_or_else(HandlerErr::no_workspace)?;
    let stats = grading::assignment_grade_stats(s.conn, &actor, &assignment_id)?;
    Ok(serde_json::to_value(stats)?)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "grades.grade" => handle_grade(state, req),
        "grades.update" => handle_update(state, req),
        "grades.release" => handle_release(state, req),
        "grades.releaseAll" => handle_release_all(state, req),
        "grades.get" => handle_get(state, req),
        "grades.bySubmission" => handle_by_submission(state, req),
        "grades.listByAssignment" => handle_list_by_assignment(state, req),
        "grades.released" => handle_released(state, req),
        "assignments.gradeStats" => handle_grade_stats(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
