use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{opt_str_param, str_param, string_list_param, with_store};
use crate::ipc::types::{AppState, Request};
use crate::store::{GradeStore, TeacherFilter};
use serde_json::json;

fn handle_classes_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_store(state, req, |store, _| {
        let classes: Vec<_> = store
            .list_classes()
            .map_err(HandlerErr::query)?
            .into_iter()
            .map(|(id, name, student_count)| {
                json!({ "id": id, "name": name, "studentCount": student_count })
            })
            .collect();
        Ok(json!({ "classes": classes }))
    })
}

fn handle_classes_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_store(state, req, |store, params| {
        let name = str_param(params, "name")?;
        let class_id = store
            .create_class(name)
            .map_err(|e| HandlerErr::insert(e, "classes"))?;
        Ok(json!({ "classId": class_id, "name": name }))
    })
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_store(state, req, |store, params| {
        let class_id = str_param(params, "classId")?;
        let students = store.list_students(class_id).map_err(HandlerErr::query)?;
        Ok(json!({ "students": students }))
    })
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_store(state, req, |store, params| {
        let class_id = str_param(params, "classId")?;
        let first_name = str_param(params, "firstName")?;
        let last_name = str_param(params, "lastName")?;
        let matricule = opt_str_param(params, "matricule");
        let student = store
            .create_student(class_id, first_name, last_name, matricule)
            .map_err(|e| HandlerErr::insert(e, "students"))?;
        Ok(json!({ "student": student }))
    })
}

fn handle_subjects_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_store(state, req, |store, params| {
        let name = str_param(params, "name")?;
        let subject_id = store
            .create_subject(name)
            .map_err(|e| HandlerErr::insert(e, "subjects"))?;
        Ok(json!({ "subjectId": subject_id, "name": name }))
    })
}

fn handle_teachers_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_store(state, req, |store, params| {
        let name = str_param(params, "name")?;
        let subject_ids: Vec<String> = match params.get("subjectIds") {
            None | Some(serde_json::Value::Null) => Vec::new(),
            Some(_) => string_list_param(params, "subjectIds")?,
        };
        let teacher = store
            .create_teacher(name, &subject_ids)
            .map_err(|e| HandlerErr::insert(e, "teachers"))?;
        Ok(json!({ "teacher": teacher }))
    })
}

fn handle_teachers_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_store(state, req, |store, params| {
        let filter = TeacherFilter {
            subject_id: opt_str_param(params, "subjectId").map(str::to_string),
            search: opt_str_param(params, "search").map(str::to_string),
        };
        let teachers = store.list_teachers(&filter).map_err(HandlerErr::query)?;
        Ok(json!({ "teachers": teachers }))
    })
}

fn handle_class_subjects_upsert(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_store(state, req, |store, params| {
        let class_id = str_param(params, "classId")?;
        let subject_id = str_param(params, "subjectId")?;
        let teacher_id = opt_str_param(params, "teacherId");
        let coefficient = match params.get("coefficient") {
            None | Some(serde_json::Value::Null) => 1,
            Some(v) => v
                .as_i64()
                .filter(|c| *c > 0)
                .ok_or_else(|| HandlerErr::bad_params("coefficient must be a positive integer"))?,
        };
        store
            .upsert_class_subject(class_id, subject_id, teacher_id, coefficient)
            .map_err(|e| HandlerErr::insert(e, "class_subjects"))?;
        Ok(json!({ "ok": true }))
    })
}

fn handle_class_subjects_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    with_store(state, req, |store, params| {
        let class_id = str_param(params, "classId")?;
        let subjects = store
            .list_class_subjects(class_id)
            .map_err(HandlerErr::query)?;
        Ok(json!({ "classSubjects": subjects }))
    })
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "classes.list" => Some(handle_classes_list(state, req)),
        "classes.create" => Some(handle_classes_create(state, req)),
        "students.list" => Some(handle_students_list(state, req)),
        "students.create" => Some(handle_students_create(state, req)),
        "subjects.create" => Some(handle_subjects_create(state, req)),
        "teachers.create" => Some(handle_teachers_create(state, req)),
        "teachers.list" => Some(handle_teachers_list(state, req)),
        "classSubjects.upsert" => Some(handle_class_subjects_upsert(state, req)),
        "classSubjects.list" => Some(handle_class_subjects_list(state, req)),
        _ => None,
    }
}
