use chrono::Utc;
use serde_json::{json, Value};

use crate::catalog::{self, CategoryPatch, EnrollmentInput, NewCategory};
use crate::ipc::error::{respond, HandlerErr};
use crate::ipc::params;
use crate::ipc::types::{AppState, Request};
use crate::model::{Assignment, Course, SubmissionFormat};
use crate::repo;

fn handle_courses_upsert(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let actor = params::actor(&req.params)?;
    let course = Course {
        id: params::req_str(&req.params, "courseId")?,
        title: params::req_str(&req.params, "title")?,
        instructor_id: params::req_str(&req.params, "instructorId")?,
    };
    let s = state.session().ok_or_else(HandlerErr::no_workspace)?;
    catalog::upsert_course(s.conn, &actor, &course)?;
    Ok(json!({ "courseId": course.id }))
}

fn assignment_from_params(p: &Value) -> Result<Assignment, HandlerErr> {
    let submission_format = match params::opt_str(p, "submissionFormat") {
        None => SubmissionFormat::Text,
        Some(raw) => SubmissionFormat::parse(&raw).ok_or_else(|| {
            HandlerErr::bad_params("submissionFormat must be one of: text, file, url")
        })?,
    };
    Ok(Assignment {
        id: params::req_str(p, "assignmentId")?,
        course_id: params::req_str(p, "courseId")?,
        category_id: params::opt_str(p, "categoryId"),
        title: params::req_str(p, "title")?,
        max_points: params::req_decimal(p, "maxPoints")?,
        due_date: params::opt_datetime(p, "dueDate")?,
        available_from: params::opt_datetime(p, "availableFrom")?,
        available_until: params::opt_datetime(p, "availableUntil")?,
        allow_late: params::opt_bool(p, "allowLate")?.unwrap_or(false),
        late_penalty_percentage: params::opt_decimal(p, "latePenaltyPercentage")?,
        max_attempts: params::opt_i64(p, "maxAttempts")?,
        submission_format,
    })
}

fn handle_assignments_upsert(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let actor = params::actor(&req.params)?;
    let assignment = assignment_from_params(&req.params)?;
    let s = state.session().ok_or_else(HandlerErr::no_workspace)?;
    catalog::upsert_assignment(s.conn, &actor, &assignment)?;
    Ok(json!({ "assignmentId": assignment.id }))
}

fn handle_assignments_get(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    params::actor(&req.params)?;
    let assignment_id = params::req_str(&req.params, "assignmentId")?;
    let s = state.session().ok_or_else(HandlerErr::no_workspace)?;
    let assignment = repo::get_assignment(s.conn, &assignment_id)?;
    Ok(json!({ "assignment": serde_json::to_value(assignment)? }))
}

fn handle_enrollments_upsert(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let actor = params::actor(&req.params)?;
    let input = EnrollmentInput {
        enrollment_id: params::opt_str(&req.params, "enrollmentId"),
        course_id: params::req_str(&req.params, "courseId")?,
        learner_id: params::req_str(&req.params, "learnerId")?,
        progress: params::opt_decimal(&req.params, "progressPercentage")?.unwrap_or_default(),
    };
    let s = state.session().ok_or_else(HandlerErr::no_workspace)?;
    let update = catalog::upsert_enrollment(s.conn, s.sink, &actor, input, Utc::now())?;
    Ok(serde_json::to_value(update)?)
}

fn handle_categories_create(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let actor = params::actor(&req.params)?;
    let new = NewCategory {
        course_id: params::req_str(&req.params, "courseId")?,
        name: params::req_str(&req.params, "name")?,
        weight: params::req_decimal(&req.params, "weight")?,
        drop_lowest: params::opt_i64(&req.params, "dropLowest")?.unwrap_or(0),
    };
    let s = state.session().ok_or_else(HandlerErr::no_workspace)?;
    let category = catalog::create_category(s.conn, &actor, new)?;
    Ok(json!({ "category": serde_json::to_value(category)? }))
}

fn handle_categories_update(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let actor = params::actor(&req.params)?;
    let category_id = params::req_str(&req.params, "categoryId")?;
    let patch = CategoryPatch {
        name: params::opt_str(&req.params, "name"),
        weight: params::opt_decimal(&req.params, "weight")?,
        drop_lowest: params::opt_i64(&req.params, "dropLowest")?,
        active: params::opt_bool(&req.params, "active")?,
        position: params::opt_i64(&req.params, "position")?,
    };
    let s = state.session().ok_or_else(HandlerErr::no_workspace)?;
    let update = catalog::update_category(
        s.conn,
        &s.recalc,
        s.sink,
        &actor,
        &category_id,
        patch,
        Utc::now(),
    )?;
    Ok(serde_json::to_value(update)?)
}

fn handle_categories_list(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let actor = params::actor(&req.params)?;
    let course_id = params::req_str(&req.params, "courseId")?;
    let include_inactive = params::opt_bool(&req.params, "includeInactive")?.unwrap_or(false);
    let s = state.session().ok_or_else(HandlerErr::no_workspace)?;
    let categories = catalog::list_categories(s.conn, &actor, &course_id, include_inactive)?;
    Ok(json!({ "categories": serde_json::to_value(categories)? }))
}

fn handle_categories_score(state: &mut AppState, req: &Request) -> Result<Value, HandlerErr> {
    let actor = params::actor(&req.params)?;
    let category_id = params::req_str(&req.params, "categoryId")?;
    let learner_id = params::opt_str(&req.params, "learnerId").unwrap_or_else(|| actor.id.clone());
    let s = state.session().ok_or_else(HandlerErr::no_workspace)?;
    let score = catalog::score_category(s.conn, &actor, &category_id, &learner_id)?;
    Ok(serde_json::to_value(score)?)
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    let result = match req.method.as_str() {
        "courses.upsert" => handle_courses_upsert(state, req),
        "assignments.upsert" => handle_assignments_upsert(state, req),
        "assignments.get" => handle_assignments_get(state, req),
        "enrollments.upsert" => handle_enrollments_upsert(state, req),
        "categories.create" => handle_categories_create(state, req),
        "categories.update" => handle_categories_update(state, req),
        "categories.list" => handle_categories_list(state, req),
        "categories.score" => handle_categories_score(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
