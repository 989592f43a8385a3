use chrono::Utc;
use serde_json::{json, Value};

use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::params;
use crate::ipc::types::{AppState, Request};
use crate::repo::SubmissionFilter;
use crate::submission;

fn handle_submit(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let actor = params::actor(&req.params)?;
    let assignment_id = params::req_str(&req.params, "assignmentId")?;
    // Learners submit for themselves unless an explicit learner is named.
    let learner_id = params::opt_str(&req.params, "learnerId").unwrap_or_else(|| actor.id.clone());
    let content = params::content(&req.params)?;
    let s = state.session().ok_or_else(HandlerErr::no_workspace)?;
    let sub = submission::submit(s.conn, &actor, &assignment_id, &learner_id, content, Utc::now())?;
    Ok(json!({ "submission": serde_json::to_value(sub)? }))
}

fn handle_resubmit(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let actor = params::actor(&req.params)?;
    let submission_id = params::req_str(&req.params, "submissionId")?;
    let content = params::content(&req.params)?;
    let s = state.session().ok_or_else(HandlerErr::no_workspace)?;
    let sub = submission::resubmit(s.conn, &actor, &submission_id, content)?;
    Ok(json!({ "submission": serde_json::to_value(sub)? }))
}

fn handle_delete(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let actor = params::actor(&req.params)?;
    let submission_id = params::req_str(&req.params, "submissionId")?;
    let s = state.session().ok_or_else(HandlerErr::no_workspace)?;
    submission::delete(s.conn, &actor, &submission_id)?;
    Ok(json!({ "deleted": true }))
}

fn handle_get(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let actor = params::actor(&req.params)?;
    let submission_id = params::req_str(&req.params, "submissionId")?;
    let s = state.session().ok_or_else(HandlerErr::no_workspace)?;
    let sub = submission::get(s.conn, &actor, &submission_id)?;
    Ok(json!({ "submission": serde_json::to_value(sub)? }))
}

fn handle_list(state: &mut AppState, req: &Request, filter: SubmissionFilter) -> Result<Value, HandlerErr> {
    let actor = params::actor(&req.params)?;
    let assignment_id = params::req_str(&req.params, "assignmentId")?;
    let s = state.session().ok_or_else(HandlerErr::no_workspace)?;
    let subs = submission::list_for_assignment(s.conn, &actor, &assignment_id, filter)?;
    Ok(json!({ "submissions": serde_json::to_value(subs)? }))
}

fn handle_count(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let actor = params::actor(&req.params)?;
    let assignment_id = params::req_str(&req.params, "assignmentId")?;
    let s = state.session().ok_or_else(HandlerErr::no_workspace)?;
    let all = submission::list_for_assignment(s.conn, &actor, &assignment_id, SubmissionFilter::All)?;
    let pending = all
        .iter()
        .filter(|x| x.status != crate::model::SubmissionStatus::Graded)
        .count();
    let late = all.iter().filter(|x| x.late).count();
    Ok(json!({
        "total": all.len(),
        "pendingGrading": pending,
        "late": late,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "submissions.submit" => handle_submit(state, req),
        "submissions.resubmit" => handle_resubmit(state, req),
        "submissions.delete" => handle_delete(state, req),
        "submissions.get" => handle_get(state, req),
        "submissions.listByAssignment" => handle_list(state, req, SubmissionFilter::All),
        "submissions.pendingGrading" => handle_list(state, req, SubmissionFilter::PendingGrading),
        "submissions.late" => handle_list(state, req, SubmissionFilter::Late),
        "submissions.count" => handle_count(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
