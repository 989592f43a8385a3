use crate::authz;
use crate::calc;
use crate::error::{GradebookError, Result};
use crate::model::{Actor, Assignment, Course, Enrollment, GradebookCategory, Role};
use crate::recompute::{self, RecalcReport, RecalcSettings};
use crate::repo;
use crate::signal::CompletionSink;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, TransactionBehavior};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{error, info};
use uuid::Uuid;

pub fn upsert_course(conn: &Connection, actor: &Actor, course: &Course) -> Result<()> {
    let own_course = actor.role == Role::Instructor && actor.id == course.instructor_id;
    if !actor.is_admin() && !own_course {
        return Err(GradebookError::forbidden(
            "only admins or the course instructor may write courses",
        ));
    }
    if let Ok(existing) = repo::get_course(conn, &course.id) {
        authz::require_course_staff(actor, &existing, "change this course")?;
    }
    if course.title.trim().is_empty() {
        return Err(GradebookError::invalid("title must not be empty"));
    }
    repo::upsert_course(conn, course)?;
    info!(course_id = %course.id, "course stored");
    Ok(())
}

fn in_range(v: Decimal, lo: i64, hi: i64) -> bool {
    v >= Decimal::from(lo) && v <= Decimal::from(hi)
}

/// Field rules an assignment must satisfy before it is stored.
pub fn validate_assignment(a: &Assignment) -> Result<()> {
    if a.title.trim().is_empty() {
        return Err(GradebookError::invalid("title must not be empty"));
    }
    if a.max_points.is_sign_negative() && !a.max_points.is_zero() {
        return Err(GradebookError::invalid("maxPoints must not be negative"));
    }
    if !a.max_points.is_zero() && a.max_points < calc::min_points_possible() {
        return Err(GradebookError::invalid("maxPoints must be 0 or at least 0.01"));
    }
    if a.max_points > calc::points_ceiling() {
        return Err(GradebookError::invalid(format!(
            "maxPoints must not exceed {}",
            calc::POINTS_CEILING
        )));
    }
    if let (Some(from), Some(due)) = (a.available_from, a.due_date) {
        if from > due {
            return Err(GradebookError::invalid("availableFrom must not be after dueDate"));
        }
    }
    if let (Some(due), Some(until)) = (a.due_date, a.available_until) {
        if due > until {
            return Err(GradebookError::invalid("dueDate must not be after availableUntil"));
        }
    }
    if let (Some(from), Some(until)) = (a.available_from, a.available_until) {
        if from > until {
            return Err(GradebookError::invalid(
                "availableFrom must not be after availableUntil",
            ));
        }
    }
    if let Some(p) = a.late_penalty_percentage {
        if !in_range(p, 0, 100) {
            return Err(GradebookError::invalid(
                "latePenaltyPercentage must be between 0 and 100",
            ));
        }
    }
    if a.max_attempts.is_some_and(|m| m < 1) {
        return Err(GradebookError::invalid("maxAttempts must be at least 1"));
    }
    Ok(())
}

pub fn upsert_assignment(conn: &Connection, actor: &Actor, assignment: &Assignment) -> Result<()> {
    validate_assignment(assignment)?;
    let course = repo::get_course(conn, &assignment.course_id)?;
    authz::require_course_staff(actor, &course, "write assignments")?;
    if let Some(category_id) = assignment.category_id.as_deref() {
        let category = repo::get_category(conn, category_id)?;
        if category.course_id != assignment.course_id {
            return Err(GradebookError::invalid(
                "category belongs to a different course",
            ));
        }
    }
    if let Ok(existing) = repo::get_assignment(conn, &assignment.id) {
        if existing.course_id != assignment.course_id {
            return Err(GradebookError::invalid(
                "an assignment cannot move between courses",
            ));
        }
    }
    repo::upsert_assignment(conn, assignment)?;
    info!(assignment_id = %assignment.id, course_id = %assignment.course_id, "assignment stored");
    Ok(())
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollmentUpdate {
    pub enrollment: Enrollment,
    pub course_grade: Option<crate::model::CourseGrade>,
}

#[derive(Debug, Clone)]
pub struct EnrollmentInput {
    pub enrollment_id: Option<String>,
    pub course_id: String,
    pub learner_id: String,
    pub progress: Decimal,
}

/// Stores enrollment progress and re-finalizes that learner so a course that
/// just reached full progress is detected as complete right away.
pub fn upsert_enrollment(
    conn: &mut Connection,
    sink: &dyn CompletionSink,
    actor: &Actor,
    input: EnrollmentInput,
    now: DateTime<Utc>,
) -> Result<EnrollmentUpdate> {
    let EnrollmentInput {
        enrollment_id,
        course_id,
        learner_id,
        progress,
    } = input;
    let (course_id, learner_id) = (course_id.as_str(), learner_id.as_str());
    if !in_range(progress, 0, 100) {
        return Err(GradebookError::invalid(
            "progressPercentage must be between 0 and 100",
        ));
    }
    let course = repo::get_course(conn, course_id)?;
    authz::require_course_staff(actor, &course, "write enrollments")?;

    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let enrollment = repo::upsert_enrollment(
        &tx,
        &Enrollment {
            id: enrollment_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            course_id: course_id.to_string(),
            learner_id: learner_id.to_string(),
            progress_percentage: progress,
        },
    )?;
    tx.commit()?;
    info!(course_id, learner_id, progress = %progress, "enrollment progress stored");

    let course_grade = match recompute::recompute_learner(conn, sink, course_id, learner_id, now) {
        Ok(cg) => Some(cg),
        Err(e) => {
            error!(course_id, learner_id, error = %e, "recompute after progress change failed");
            None
        }
    };
    Ok(EnrollmentUpdate {
        enrollment,
        course_grade,
    })
}

fn validate_category_fields(name: &str, weight: Decimal, drop_lowest: i64) -> Result<()> {
    if name.trim().is_empty() {
        return Err(GradebookError::invalid("name must not be empty"));
    }
    if !in_range(weight, 0, 100) {
        return Err(GradebookError::invalid("weight must be between 0 and 100"));
    }
    if drop_lowest < 0 {
        return Err(GradebookError::invalid("dropLowest must not be negative"));
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct NewCategory {
    pub course_id: String,
    pub name: String,
    pub weight: Decimal,
    pub drop_lowest: i64,
}

/// New categories go to the end of the course's ordering. Nothing is graded
/// against them yet, so no recompute is needed.
pub fn create_category(conn: &mut Connection, actor: &Actor, new: NewCategory) -> Result<GradebookCategory> {
    validate_category_fields(&new.name, new.weight, new.drop_lowest)?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let course = repo::get_course(&tx, &new.course_id)?;
    authz::require_course_staff(actor, &course, "create categories")?;
    let name = new.name.trim().to_string();
    if repo::category_name_taken(&tx, &course.id, &name, None)? {
        return Err(GradebookError::invalid(format!(
            "category '{name}' already exists in this course"
        )));
    }
    let category = GradebookCategory {
        id: Uuid::new_v4().to_string(),
        position: repo::next_category_position(&tx, &course.id)?,
        course_id: course.id,
        name,
        weight: new.weight,
        drop_lowest: new.drop_lowest,
        active: true,
    };
    repo::insert_category(&tx, &category)?;
    tx.commit()?;
    info!(category_id = %category.id, course_id = %category.course_id, "category created");
    Ok(category)
}

#[derive(Debug, Clone, Default)]
pub struct CategoryPatch {
    pub name: Option<String>,
    pub weight: Option<Decimal>,
    pub drop_lowest: Option<i64>,
    pub active: Option<bool>,
    pub position: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryUpdate {
    pub category: GradebookCategory,
    pub recalc: RecalcReport,
}

/// Applies a category change and then recomputes every enrolled learner of
/// the course. The change commits before any recompute reads it.
pub fn update_category(
    conn: &mut Connection,
    settings: &RecalcSettings,
    sink: &dyn CompletionSink,
    actor: &Actor,
    category_id: &str,
    patch: CategoryPatch,
    now: DateTime<Utc>,
) -> Result<CategoryUpdate> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let mut category = repo::get_category(&tx, category_id)?;
    let course = repo::get_course(&tx, &category.course_id)?;
    authz::require_course_staff(actor, &course, "update categories")?;

    if let Some(name) = patch.name {
        category.name = name.trim().to_string();
    }
    if let Some(w) = patch.weight {
        category.weight = w;
    }
    if let Some(n) = patch.drop_lowest {
        category.drop_lowest = n;
    }
    if let Some(a) = patch.active {
        category.active = a;
    }
    if let Some(p) = patch.position {
        category.position = p;
    }
    validate_category_fields(&category.name, category.weight, category.drop_lowest)?;
    if repo::category_name_taken(&tx, &course.id, &category.name, Some(&category.id))? {
        return Err(GradebookError::invalid(format!(
            "category '{}' already exists in this course",
            category.name
        )));
    }
    repo::update_category(&tx, &category)?;
    tx.commit()?;
    info!(category_id, course_id = %course.id, "category updated");

    let recalc = recompute::recalculate_course(conn, settings, sink, &course.id, now)?;
    Ok(CategoryUpdate { category, recalc })
}

pub fn list_categories(
    conn: &Connection,
    actor: &Actor,
    course_id: &str,
    include_inactive: bool,
) -> Result<Vec<GradebookCategory>> {
    let course = repo::get_course(conn, course_id)?;
    if include_inactive {
        authz::require_course_staff(actor, &course, "list inactive categories")?;
    }
    repo::list_categories(conn, course_id, !include_inactive)
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CategoryScore {
    pub category_id: String,
    pub learner_id: String,
    pub drop_lowest: i64,
    pub score: Option<Decimal>,
}

/// One learner's score in one category. Inactive categories are still scored
/// here even though they do not count toward the course grade.
pub fn score_category(
    conn: &Connection,
    actor: &Actor,
    category_id: &str,
    learner_id: &str,
) -> Result<CategoryScore> {
    let category = repo::get_category(conn, category_id)?;
    let course = repo::get_course(conn, &category.course_id)?;
    authz::require_learner_view(actor, &course, learner_id)?;
    let score = calc::compute_category_score(conn, &category, learner_id)?;
    Ok(CategoryScore {
        category_id: category.id,
        learner_id: learner_id.to_string(),
        drop_lowest: category.drop_lowest,
        score,
    })
}
