use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_gradebookd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .env_remove("GRADEBOOKD_WORKSPACE")
        .spawn()
        .expect("spawn gradebookd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn num(v: &serde_json::Value) -> f64 {
    v.as_f64().unwrap_or_else(|| panic!("not a number: {v}"))
}

fn prof() -> serde_json::Value {
    json!({ "id": "prof", "role": "instructor" })
}

struct Sidecar {
    _child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    seq: usize,
}

impl Sidecar {
    fn open(prefix: &str) -> Self {
        let workspace = temp_dir(prefix);
        let (child, stdin, reader) = spawn_sidecar();
        let mut s = Sidecar {
            _child: child,
            stdin,
            reader,
            seq: 0,
        };
        s.ok("workspace.select", json!({ "path": workspace.to_string_lossy() }));
        s
    }

    fn call(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        self.seq += 1;
        let id = self.seq.to_string();
        request(&mut self.stdin, &mut self.reader, &id, method, params)
    }

    fn ok(&mut self, method: &str, params: serde_json::Value) -> serde_json::Value {
        self.seq += 1;
        let id = self.seq.to_string();
        request_ok(&mut self.stdin, &mut self.reader, &id, method, params)
    }

    fn course(&mut self, course_id: &str, learners: &[&str]) {
        self.ok(
            "courses.upsert",
            json!({ "actor": prof(), "courseId": course_id, "title": course_id, "instructorId": "prof" }),
        );
        for l in learners {
            self.ok(
                "enrollments.upsert",
                json!({ "actor": prof(), "courseId": course_id, "learnerId": l, "progressPercentage": 20 }),
            );
        }
    }

    fn category(&mut self, course_id: &str, name: &str, weight: i64, drop_lowest: i64) -> String {
        let res = self.ok(
            "categories.create",
            json!({ "actor": prof(), "courseId": course_id, "name": name, "weight": weight, "dropLowest": drop_lowest }),
        );
        res["category"]["id"].as_str().expect("category id").to_string()
    }

    /// Creates an assignment, has `learner` submit, and grades it out of 100.
    fn graded(
        &mut self,
        course_id: &str,
        assignment_id: &str,
        category_id: Option<&str>,
        learner: &str,
        points: f64,
    ) -> serde_json::Value {
        self.ok(
            "assignments.upsert",
            json!({
                "actor": prof(),
                "courseId": course_id,
                "assignmentId": assignment_id,
                "categoryId": category_id,
                "title": assignment_id,
                "maxPoints": 100
            }),
        );
        let sub = self.ok(
            "submissions.submit",
            json!({ "actor": { "id": learner, "role": "learner" }, "assignmentId": assignment_id, "content": { "text": "work" } }),
        );
        let sub_id = sub["submission"]["id"].as_str().expect("submission id").to_string();
        self.ok(
            "grades.grade",
            json!({ "actor": prof(), "submissionId": sub_id, "pointsEarned": points }),
        )
    }

    fn course_grade(&mut self, course_id: &str, learner: &str) -> serde_json::Value {
        let res = self.ok(
            "courseGrade.get",
            json!({ "actor": prof(), "courseId": course_id, "learnerId": learner }),
        );
        res["courseGrade"].clone()
    }
}

#[test]
fn drop_lowest_applies_before_the_mean() {
    let mut s = Sidecar::open("gradebook-course-drop");
    s.course("c1", &["ann"]);
    let quizzes = s.category("c1", "Quizzes", 30, 1);
    s.graded("c1", "q1", Some(&quizzes), "ann", 70.0);
    s.graded("c1", "q2", Some(&quizzes), "ann", 80.0);
    s.graded("c1", "q3", Some(&quizzes), "ann", 95.0);

    let cg = s.course_grade("c1", "ann");
    assert_eq!(num(&cg["percentage"]), 87.5);
    assert_eq!(cg["letterGrade"], json!("B+"));

    let breakdown = s.ok(
        "courseGrade.breakdown",
        json!({ "actor": { "id": "ann", "role": "learner" }, "courseId": "c1" }),
    );
    assert_eq!(breakdown["method"], json!("weighted"));
    assert_eq!(breakdown["categories"][0]["qualifyingCount"], json!(3));
    assert_eq!(num(&breakdown["categories"][0]["score"]), 87.5);

    // Dropping as many grades as exist leaves the category without a score,
    // so the course falls back to the flat average.
    let update = s.ok(
        "categories.update",
        json!({ "actor": prof(), "categoryId": quizzes, "dropLowest": 3 }),
    );
    assert_eq!(update["recalc"]["recalculated"], json!(1));
    let cg = s.course_grade("c1", "ann");
    assert_eq!(num(&cg["percentage"]), 81.67);
}

#[test]
fn weights_normalize_over_scored_categories() {
    let mut s = Sidecar::open("gradebook-course-weighted");
    s.course("c1", &["ann"]);
    let a = s.category("c1", "Homework", 40, 0);
    let b = s.category("c1", "Exams", 60, 0);
    s.category("c1", "Participation", 25, 0);
    s.graded("c1", "hw1", Some(&a), "ann", 90.0);
    let last = s.graded("c1", "ex1", Some(&b), "ann", 70.0);
    assert_eq!(num(&last["courseGrade"]["percentage"]), 78.0);
    assert_eq!(last["courseGrade"]["letterGrade"], json!("C+"));
    assert_eq!(num(&last["courseGrade"]["gradePoints"]), 2.3);

    // Deactivating a category recomputes every enrolled learner.
    let update = s.ok(
        "categories.update",
        json!({ "actor": prof(), "categoryId": b, "active": false }),
    );
    assert_eq!(update["category"]["active"], json!(false));
    assert_eq!(num(&s.course_grade("c1", "ann")["percentage"]), 90.0);

    let listed = s.ok("categories.list", json!({ "actor": prof(), "courseId": "c1" }));
    let names: Vec<&str> = listed["categories"]
        .as_array()
        .expect("categories")
        .iter()
        .filter_map(|c| c["name"].as_str())
        .collect();
    assert_eq!(names, vec!["Homework", "Participation"]);

    let dup = s.call(
        "categories.create",
        json!({ "actor": prof(), "courseId": "c1", "name": "homework", "weight": 10 }),
    );
    assert_eq!(dup["error"]["code"], json!("bad_params"));
}

#[test]
fn course_without_categories_uses_flat_average() {
    let mut s = Sidecar::open("gradebook-course-flat");
    s.course("c1", &["ann"]);
    s.graded("c1", "a1", None, "ann", 100.0);
    s.graded("c1", "a2", None, "ann", 80.0);
    let last = s.graded("c1", "a3", None, "ann", 60.0);
    assert_eq!(num(&last["courseGrade"]["percentage"]), 80.0);
    assert_eq!(last["courseGrade"]["letterGrade"], json!("B-"));

    let breakdown = s.ok(
        "courseGrade.breakdown",
        json!({ "actor": prof(), "courseId": "c1", "learnerId": "ann" }),
    );
    assert_eq!(breakdown["method"], json!("flat_average"));
}

#[test]
fn statistics_and_attention_list() {
    let mut s = Sidecar::open("gradebook-course-stats");
    s.course("c1", &["ann", "bob", "cat", "dan"]);
    s.graded("c1", "final-ann", None, "ann", 95.0);
    s.graded("c1", "final-bob", None, "bob", 82.0);
    s.graded("c1", "final-cat", None, "cat", 58.0);
    s.graded("c1", "final-dan", None, "dan", 65.0);

    // Each learner only has their own assignment graded.
    let stats = s.ok("courseGrade.statistics", json!({ "actor": prof(), "courseId": "c1" }));
    assert_eq!(stats["totalStudents"], json!(4));
    assert_eq!(stats["passingStudents"], json!(3));
    assert_eq!(stats["completedStudents"], json!(0));
    assert_eq!(num(&stats["average"]), 75.0);
    assert_eq!(num(&stats["highest"]), 95.0);
    assert_eq!(num(&stats["lowest"]), 58.0);
    assert_eq!(stats["letterHistogram"]["A"], json!(1));
    assert_eq!(stats["letterHistogram"]["B-"], json!(1));
    assert_eq!(stats["letterHistogram"]["F"], json!(1));
    assert_eq!(stats["bands"]["d"], json!(1));

    let attention = s.ok(
        "courseGrade.needingAttention",
        json!({ "actor": prof(), "courseId": "c1", "threshold": 70 }),
    );
    let who: Vec<&str> = attention["courseGrades"]
        .as_array()
        .expect("course grades")
        .iter()
        .filter_map(|g| g["learnerId"].as_str())
        .collect();
    assert_eq!(who, vec!["cat", "dan"]);

    let listed = s.ok("courseGrade.list", json!({ "actor": prof(), "courseId": "c1" }));
    let order: Vec<&str> = listed["courseGrades"]
        .as_array()
        .expect("course grades")
        .iter()
        .filter_map(|g| g["learnerId"].as_str())
        .collect();
    assert_eq!(order, vec!["ann", "bob", "dan", "cat"]);

    let learner_view = s.call(
        "courseGrade.statistics",
        json!({ "actor": { "id": "ann", "role": "learner" }, "courseId": "c1" }),
    );
    assert_eq!(learner_view["error"]["code"], json!("forbidden"));

    let report = s.ok("courseGrade.recalculate", json!({ "actor": prof(), "courseId": "c1" }));
    assert_eq!(report["recalculated"], json!(4));
    assert_eq!(report["failed"].as_array().map(|f| f.len()), Some(0));
}

#[test]
fn category_score_skips_excused_and_honours_drop_lowest() {
    let mut s = Sidecar::open("gradebook-category-score");
    s.course("c1", &["ann", "bob"]);
    let labs = s.category("c1", "Labs", 50, 1);
    s.graded("c1", "lab1", Some(&labs), "ann", 70.0);
    s.graded("c1", "lab2", Some(&labs), "ann", 80.0);
    s.graded("c1", "lab4", Some(&labs), "ann", 95.0);

    s.ok(
        "assignments.upsert",
        json!({ "actor": prof(), "courseId": "c1", "assignmentId": "lab3", "categoryId": labs, "title": "lab3", "maxPoints": 100 }),
    );
    let sub = s.ok(
        "submissions.submit",
        json!({ "actor": { "id": "ann", "role": "learner" }, "assignmentId": "lab3", "content": { "text": "sick note" } }),
    );
    let excused = s.ok(
        "grades.grade",
        json!({ "actor": prof(), "submissionId": sub["submission"]["id"], "excused": true }),
    );
    assert_eq!(excused["grade"]["letterGrade"], json!("EX"));

    // The excused zero is not the lowest grade: 70 is dropped instead.
    let own = s.ok(
        "categories.score",
        json!({ "actor": { "id": "ann", "role": "learner" }, "categoryId": labs }),
    );
    assert_eq!(own["learnerId"], json!("ann"));
    assert_eq!(own["dropLowest"], json!(1));
    assert_eq!(num(&own["score"]), 87.5);

    let empty = s.ok(
        "categories.score",
        json!({ "actor": prof(), "categoryId": labs, "learnerId": "bob" }),
    );
    assert!(empty["score"].is_null());

    let peek = s.call(
        "categories.score",
        json!({ "actor": { "id": "bob", "role": "learner" }, "categoryId": labs, "learnerId": "ann" }),
    );
    assert_eq!(peek["error"]["code"], json!("forbidden"));

    s.ok(
        "categories.update",
        json!({ "actor": prof(), "categoryId": labs, "dropLowest": 3 }),
    );
    let all_dropped = s.ok(
        "categories.score",
        json!({ "actor": prof(), "categoryId": labs, "learnerId": "ann" }),
    );
    assert!(all_dropped["score"].is_null());

    let missing = s.call(
        "categories.score",
        json!({ "actor": prof(), "categoryId": "nope", "learnerId": "ann" }),
    );
    assert_eq!(missing["error"]["code"], json!("not_found"));
}
