use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .ok_or_else(|| HandlerErr {
            code: "bad_params",
            message: format!("missing {}", key),
            details: None,
        })
}

fn get_optional_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn students_list(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let mut clauses: Vec<&'static str> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();

    if let Some(class_id) = get_optional_str(params, "classId") {
        clauses.push("s.class_id = ?");
        binds.push(Value::Text(class_id));
    }
    if let Some(year) = get_optional_str(params, "academicYear") {
        clauses.push("s.academic_year = ?");
        binds.push(Value::Text(year));
    }
    if let Some(search) = get_optional_str(params, "search") {
        clauses.push(
            "(s.last_name LIKE ? OR s.first_name LIKE ? OR s.post_name LIKE ?
              OR s.matricule LIKE ?)",
        );
        let like = Value::Text(format!("%{}%", search));
        binds.push(like.clone());
        binds.push(like.clone());
        binds.push(like.clone());
        binds.push(like);
    }

    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    };
    let sql = format!(
        "SELECT s.id, s.matricule, s.last_name, s.post_name, s.first_name, s.sex,
                s.birth_date, s.class_id, c.name, s.academic_year, s.status,
                s.enrolled_at, f.total
         FROM students s
         LEFT JOIN classes c ON c.id = s.class_id
         LEFT JOIN student_fees f
           ON f.student_id = s.id AND f.academic_year = s.academic_year{}
         ORDER BY s.matricule",
        where_sql
    );

    let mut stmt = conn.prepare(&sql).map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })?;
    let students = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "matricule": r.get::<_, String>(1)?,
                "lastName": r.get::<_, String>(2)?,
                "postName": r.get::<_, String>(3)?,
                "firstName": r.get::<_, String>(4)?,
                "sex": r.get::<_, String>(5)?,
                "birthDate": r.get::<_, String>(6)?,
                "classId": r.get::<_, String>(7)?,
                "className": r.get::<_, Option<String>>(8)?,
                "academicYear": r.get::<_, String>(9)?,
                "status": r.get::<_, String>(10)?,
                "enrolledAt": r.get::<_, String>(11)?,
                "feeTotal": r.get::<_, Option<f64>>(12)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    Ok(json!({ "students": students }))
}

fn students_open(
    conn: &Connection,
    params: &serde_json::Value,
) -> Result<serde_json::Value, HandlerErr> {
    let student_id = get_required_str(params, "studentId")?;

    let student = conn
        .query_row(
            "SELECT s.matricule, s.last_name, s.post_name, s.first_name, s.sex,
                    s.birth_place, s.birth_date, s.guardian_name, s.guardian_phone,
                    s.address, s.class_id, c.name, s.academic_year, s.status,
                    s.enrolled_at
             FROM students s
             LEFT JOIN classes c ON c.id = s.class_id
             WHERE s.id = ?",
            [&student_id],
            |r| {
                Ok(json!({
                    "id": student_id.clone(),
                    "matricule": r.get::<_, String>(0)?,
                    "lastName": r.get::<_, String>(1)?,
                    "postName": r.get::<_, String>(2)?,
                    "firstName": r.get::<_, String>(3)?,
                    "sex": r.get::<_, String>(4)?,
                    "birthPlace": r.get::<_, Option<String>>(5)?,
                    "birthDate": r.get::<_, String>(6)?,
                    "guardianName": r.get::<_, Option<String>>(7)?,
                    "guardianPhone": r.get::<_, Option<String>>(8)?,
                    "address": r.get::<_, Option<String>>(9)?,
                    "classId": r.get::<_, String>(10)?,
                    "className": r.get::<_, Option<String>>(11)?,
                    "academicYear": r.get::<_, String>(12)?,
                    "status": r.get::<_, String>(13)?,
                    "enrolledAt": r.get::<_, String>(14)?
                }))
            },
        )
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let Some(student) = student else {
        return Err(HandlerErr {
            code: "not_found",
            message: "student not found".to_string(),
            details: None,
        });
    };

    let mut fee_stmt = conn
        .prepare(
            "SELECT academic_year, registration_fee, tuition_fee, discount_pct,
                    total, created_at
             FROM student_fees WHERE student_id = ?
             ORDER BY academic_year",
        )
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    let fees = fee_stmt
        .query_map([&student_id], |r| {
            Ok(json!({
                "academicYear": r.get::<_, String>(0)?,
                "registrationFee": r.get::<_, f64>(1)?,
                "tuitionFee": r.get::<_, f64>(2)?,
                "discountPct": r.get::<_, f64>(3)?,
                "total": r.get::<_, f64>(4)?,
                "createdAt": r.get::<_, String>(5)?
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    let candidature = conn
        .query_row(
            "SELECT id, request_no FROM candidatures WHERE enrolled_student_id = ?",
            [&student_id],
            |r| {
                Ok(json!({
                    "id": r.get::<_, String>(0)?,
                    "requestNo": r.get::<_, String>(1)?
                }))
            },
        )
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;

    Ok(json!({
        "student": student,
        "fees": fees,
        "candidature": candidature
    }))
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match students_list(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

fn handle_students_open(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match students_open(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(handle_students_list(state, req)),
        "students.open" => Some(handle_students_open(state, req)),
        _ => None,
    }
}
