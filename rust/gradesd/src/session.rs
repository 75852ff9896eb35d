use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;
use tracing::{debug, info, warn};

use crate::autosave::{AutoSaveScheduler, AutoSaveStatus, Clock};
use crate::calc::{compute_statistics, round_2, GradeStatistics};
use crate::context::{ContextKey, EvaluationContext};
use crate::grade::{GradeRecord, GradeStatus, GradeValue};
use crate::pending::PendingChanges;
use crate::store::{GradeStore, NewGrade, StoreError, Student, Teacher, TeacherFilter};
use crate::validate::{GradeInput, ValidationError};

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Invalid(#[from] ValidationError),
    #[error("invalid evaluation: {0}")]
    InvalidContext(String),
    #[error("no teacher is assigned to this class and subject")]
    MissingTeacher,
    #[error("every student needs a grade before submission")]
    IncompleteGrades,
    #[error("there are no draft grades to submit")]
    NothingToSubmit,
    #[error("grade {id} is {} and cannot be edited", status.as_str())]
    ImmutableGrade { id: String, status: GradeStatus },
    #[error("teacher {0} is not qualified for this subject")]
    TeacherNotQualified(String),
    #[error("no {0} confirmation is pending")]
    NoConfirmation(&'static str),
    #[error("a save is already in progress")]
    SaveInProgress,
    #[error("{0} not found")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl WorkflowError {
    pub fn code(&self) -> &'static str {
        match self {
            WorkflowError::Invalid(e) => e.code(),
            WorkflowError::InvalidContext(_) => "bad_params",
            WorkflowError::MissingTeacher => "missing_teacher",
            WorkflowError::IncompleteGrades => "incomplete_grades",
            WorkflowError::NothingToSubmit => "nothing_to_submit",
            WorkflowError::ImmutableGrade { .. } => "immutable_grade",
            WorkflowError::TeacherNotQualified(_) => "teacher_not_qualified",
            WorkflowError::NoConfirmation(_) => "no_confirmation",
            WorkflowError::SaveInProgress => "save_in_progress",
            WorkflowError::NotFound(_) => "not_found",
            WorkflowError::Store(e) => e.code(),
        }
    }
}

/// The one dialog the session is waiting on, if any.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum PendingConfirmation {
    #[default]
    None,
    AssignTeacher {
        teacher_id: String,
        teacher_name: String,
        previous_teacher_id: String,
    },
    Submit {
        grade_ids: Vec<String>,
        count: usize,
    },
    Reset {
        pending_count: usize,
        persisted_count: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SubmissionMode {
    /// Every draft of the evaluation.
    #[default]
    AllDrafts,
    /// Only the draft rows checked through `toggle_selection`.
    Selected,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum SaveOutcome {
    Nothing,
    /// No teacher assigned; the buffer is kept as is.
    Blocked,
    InFlight,
    Saved { created: usize, updated: usize },
    /// Completion of a write issued before a reset; ignored.
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeOutcome {
    Buffered,
    Updated,
    Cleared,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum AssignOutcome {
    Assigned,
    Unchanged,
    ConfirmationRequired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum NewEvaluationOutcome {
    Proceed,
    ConfirmationRequired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetReport {
    pub deleted: usize,
    pub retained: usize,
}

/// A bulk create handed out by `begin_save`, tagged with the generation it
/// was issued in.
#[derive(Debug, Clone)]
pub struct SaveRequest {
    generation: u64,
    context: EvaluationContext,
    grades: Vec<NewGrade>,
}

impl SaveRequest {
    pub fn context(&self) -> &EvaluationContext {
        &self.context
    }

    pub fn grades(&self) -> &[NewGrade] {
        &self.grades
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatisticsView {
    pub count: usize,
    pub average: f64,
    pub min: f64,
    pub max: f64,
    pub below10: usize,
    pub above15: usize,
}

impl From<GradeStatistics> for StatisticsView {
    fn from(s: GradeStatistics) -> Self {
        StatisticsView {
            count: s.count,
            average: round_2(s.average),
            min: s.min,
            max: s.max,
            below10: s.below10,
            above15: s.above15,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub context: EvaluationContext,
    pub subject_name: Option<String>,
    pub generation: u64,
    pub students: Vec<Student>,
    pub grades: Vec<GradeRecord>,
    pub pending: BTreeMap<String, f64>,
    pub input_errors: BTreeMap<String, String>,
    pub statistics: StatisticsView,
    pub pass_rate: u32,
    pub auto_save_status: AutoSaveStatus,
    pub is_complete: bool,
    pub is_missing_teacher: bool,
    pub confirmation: PendingConfirmation,
    pub selection: Vec<String>,
}

/// True when every rostered student has a persisted grade or a buffered value.
/// An empty roster is never complete.
pub fn is_complete(
    students: &[Student],
    grades_by_student: &BTreeMap<String, GradeRecord>,
    pending: &PendingChanges,
) -> bool {
    !students.is_empty()
        && students.iter().all(|s| {
            let value = pending
                .get(&s.id)
                .map(GradeValue::get)
                .or_else(|| grades_by_student.get(&s.id).map(|g| g.value));
            matches!(value, Some(v) if v.is_finite() && v >= 0.0)
        })
}

/// Editing state of one evaluation: roster, persisted grades, the pending
/// buffer and the auto-save timer.
///
/// Every operation that talks to storage takes the store as an argument so the
/// session can live next to the store in the daemon state.
pub struct GradeEntrySession {
    context: EvaluationContext,
    subject_name: Option<String>,
    roster: Vec<Student>,
    grades_by_student: BTreeMap<String, GradeRecord>,
    pending: PendingChanges,
    inputs: BTreeMap<String, GradeInput>,
    scheduler: AutoSaveScheduler,
    clock: Rc<dyn Clock>,
    confirmation: PendingConfirmation,
    selection: BTreeSet<String>,
    generation: u64,
    in_flight: Option<u64>,
}

impl GradeEntrySession {
    /// Loads roster, teaching assignment and existing grades for `key`.
    pub fn open(
        store: &dyn GradeStore,
        key: ContextKey,
        weight: u32,
        scheduler: AutoSaveScheduler,
        clock: Rc<dyn Clock>,
    ) -> Result<Self, WorkflowError> {
        let assignment = store
            .list_class_subjects(&key.class_id)?
            .into_iter()
            .find(|cs| cs.subject_id == key.subject_id)
            .ok_or_else(|| WorkflowError::NotFound("class subject".to_string()))?;
        let context = EvaluationContext::new(key, assignment.teacher_id, weight)
            .map_err(WorkflowError::InvalidContext)?;

        let roster = store.list_students(&context.key().class_id)?;
        let grades_by_student = store
            .grades_for_context(context.key())?
            .into_iter()
            .map(|g| (g.student_id.clone(), g))
            .collect::<BTreeMap<_, _>>();

        info!(
            class_id = %context.key().class_id,
            subject_id = %context.key().subject_id,
            students = roster.len(),
            persisted = grades_by_student.len(),
            "grade entry opened"
        );

        Ok(GradeEntrySession {
            pending: PendingChanges::new(context.key().clone()),
            context,
            subject_name: Some(assignment.subject_name),
            roster,
            grades_by_student,
            inputs: BTreeMap::new(),
            scheduler,
            clock,
            confirmation: PendingConfirmation::None,
            selection: BTreeSet::new(),
            generation: 0,
            in_flight: None,
        })
    }

    pub fn context(&self) -> &EvaluationContext {
        &self.context
    }

    #[cfg(test)]
    pub fn pending(&self) -> &PendingChanges {
        &self.pending
    }

    #[cfg(test)]
    pub fn grade_for(&self, student_id: &str) -> Option<&GradeRecord> {
        self.grades_by_student.get(student_id)
    }

    #[cfg(test)]
    pub fn auto_save_status(&self) -> AutoSaveStatus {
        self.scheduler.status()
    }

    pub fn confirmation(&self) -> &PendingConfirmation {
        &self.confirmation
    }

    pub fn is_missing_teacher(&self) -> bool {
        self.context.teacher_id().is_none()
    }

    pub fn is_complete(&self) -> bool {
        is_complete(&self.roster, &self.grades_by_student, &self.pending)
    }

    /// Draft-entry view: one value per student, the buffered one when there
    /// is one, otherwise the persisted grade.
    pub fn statistics(&self) -> GradeStatistics {
        let persisted = self
            .grades_by_student
            .iter()
            .filter(|(student, _)| self.pending.get(student).is_none())
            .map(|(_, g)| g.value);
        let buffered = self.pending.iter().map(|(_, v)| v.get());
        compute_statistics(persisted.chain(buffered))
    }

    pub fn next_wake(&self) -> Option<u64> {
        self.scheduler.next_wake()
    }

    /// Raw cell input for one student. Invalid text is kept with its error and
    /// nothing else changes.
    pub fn handle_grade_change(
        &mut self,
        store: &dyn GradeStore,
        student_id: &str,
        raw: &str,
    ) -> Result<ChangeOutcome, WorkflowError> {
        if !self.roster.iter().any(|s| s.id == student_id) {
            return Err(WorkflowError::NotFound(format!("student {student_id}")));
        }

        let input = self.inputs.entry(student_id.to_string()).or_default();
        let mut accepted = None;
        input.commit(raw, |v| accepted = Some(v))?;

        match accepted {
            Some(value) => self.enter_grade(store, student_id, value),
            None => {
                if self.pending.remove(student_id).is_some() && self.pending.is_empty() {
                    self.scheduler.cancel();
                }
                Ok(ChangeOutcome::Cleared)
            }
        }
    }

    /// Routes an accepted value: existing record goes to the single-record
    /// update, otherwise the value is buffered and the timer restarted.
    pub fn enter_grade(
        &mut self,
        store: &dyn GradeStore,
        student_id: &str,
        value: GradeValue,
    ) -> Result<ChangeOutcome, WorkflowError> {
        if let Some(existing) = self.grades_by_student.get(student_id) {
            if !existing.status.is_editable() {
                return Err(WorkflowError::ImmutableGrade {
                    id: existing.id.clone(),
                    status: existing.status,
                });
            }
            let id = existing.id.clone();
            match store.update_grade(&id, value) {
                Ok(updated) => {
                    debug!(grade_id = %id, value = value.get(), "grade updated");
                    self.pending.remove(student_id);
                    self.grades_by_student
                        .insert(student_id.to_string(), updated);
                    if self.pending.is_empty() {
                        self.scheduler.cancel();
                    }
                    return Ok(ChangeOutcome::Updated);
                }
                Err(e) => {
                    warn!(grade_id = %id, error = %e, "grade update failed");
                    self.scheduler.mark_failed();
                    return Err(e.into());
                }
            }
        }

        self.pending.upsert(student_id, value);
        self.scheduler.arm(self.clock.now_ms());
        debug!(
            student_id,
            value = value.get(),
            pending = self.pending.len(),
            "grade buffered"
        );
        Ok(ChangeOutcome::Buffered)
    }

    /// Manual save: cancels the timer and flushes right away.
    pub fn handle_save_pending(
        &mut self,
        store: &dyn GradeStore,
    ) -> Result<SaveOutcome, WorkflowError> {
        self.scheduler.cancel();
        self.flush(store)
    }

    /// Advances the indicator and fires the auto-save when its deadline has
    /// passed. Returns the flush result only when a flush was attempted.
    pub fn tick(&mut self, store: &dyn GradeStore) -> Option<Result<SaveOutcome, WorkflowError>> {
        let now = self.clock.now_ms();
        self.scheduler.poll(now);
        if !self.scheduler.take_due(now) {
            return None;
        }
        debug!(pending = self.pending.len(), "auto-save due");
        Some(self.flush(store))
    }

    fn flush(&mut self, store: &dyn GradeStore) -> Result<SaveOutcome, WorkflowError> {
        if self.in_flight.is_some() {
            return Ok(SaveOutcome::InFlight);
        }
        if self.pending.is_empty() {
            return Ok(SaveOutcome::Nothing);
        }
        if self.is_missing_teacher() {
            info!(pending = self.pending.len(), "save blocked: no teacher assigned");
            return Ok(SaveOutcome::Blocked);
        }

        self.scheduler.mark_saving();

        // Buffered values of students whose record landed in the meantime.
        let updates: Vec<(String, GradeValue)> = self
            .pending
            .iter()
            .filter(|(student, _)| self.grades_by_student.contains_key(*student))
            .map(|(s, v)| (s.to_string(), v))
            .collect();
        let mut updated = 0;
        let mut conflict = None;
        for (student_id, value) in updates {
            let Some(existing) = self.grades_by_student.get(&student_id) else {
                continue;
            };
            if !existing.status.is_editable() {
                // Stays buffered until the user clears the cell.
                conflict.get_or_insert(WorkflowError::ImmutableGrade {
                    id: existing.id.clone(),
                    status: existing.status,
                });
                continue;
            }
            let id = existing.id.clone();
            match store.update_grade(&id, value) {
                Ok(record) => {
                    self.pending.remove(&student_id);
                    self.grades_by_student.insert(student_id, record);
                    updated += 1;
                }
                Err(e) => {
                    warn!(grade_id = %id, error = %e, "deferred grade update failed");
                    self.scheduler.mark_failed();
                    return Err(e.into());
                }
            }
        }

        let created = match self.begin_save() {
            Some(req) => {
                let result = store.create_bulk_grades(req.context(), req.grades());
                match self.finish_save(req, result)? {
                    SaveOutcome::Saved { created, .. } => created,
                    other => return Ok(other),
                }
            }
            None => {
                if conflict.is_none() {
                    self.scheduler.mark_saved(self.clock.now_ms());
                }
                0
            }
        };

        if let Some(e) = conflict {
            warn!(error = %e, pending = self.pending.len(), "buffered value targets a locked grade");
            self.scheduler.mark_failed();
            return Err(e);
        }
        Ok(SaveOutcome::Saved { created, updated })
    }

    /// Hands out the bulk create for every buffered student without a record.
    /// Returns `None` when nothing is sendable or a write is already out.
    pub fn begin_save(&mut self) -> Option<SaveRequest> {
        if self.in_flight.is_some() || self.is_missing_teacher() {
            return None;
        }
        debug_assert_eq!(self.pending.key(), self.context.key());
        let grades: Vec<NewGrade> = self
            .pending
            .iter()
            .filter(|(student, _)| !self.grades_by_student.contains_key(*student))
            .map(|(student_id, value)| NewGrade {
                student_id: student_id.to_string(),
                value,
            })
            .collect();
        if grades.is_empty() {
            return None;
        }
        self.scheduler.mark_saving();
        self.in_flight = Some(self.generation);
        Some(SaveRequest {
            generation: self.generation,
            context: self.context.clone(),
            grades,
        })
    }

    /// Applies the store's answer to a `begin_save` request.
    ///
    /// Sent entries are dropped from the buffer unless they were edited again
    /// in the meantime; those stay buffered and go through the update path on
    /// the next flush. A row the store refused to overwrite (another session
    /// moved it past `draft`) keeps its entry buffered and fails the save with
    /// `ImmutableGrade`.
    pub fn finish_save(
        &mut self,
        req: SaveRequest,
        result: Result<Vec<GradeRecord>, StoreError>,
    ) -> Result<SaveOutcome, WorkflowError> {
        if req.generation != self.generation {
            warn!(
                issued = req.generation,
                current = self.generation,
                "discarding stale save completion"
            );
            return Ok(SaveOutcome::Stale);
        }
        self.in_flight = None;

        match result {
            Ok(records) => {
                let mut created = 0;
                let mut conflict = None;
                for sent in &req.grades {
                    let Some(record) = records.iter().find(|r| r.student_id == sent.student_id)
                    else {
                        continue;
                    };
                    if record.status.is_editable() && record.value == sent.value.get() {
                        created += 1;
                        if self.pending.get(&sent.student_id) == Some(sent.value) {
                            self.pending.remove(&sent.student_id);
                        }
                    } else if conflict.is_none() {
                        conflict = Some(WorkflowError::ImmutableGrade {
                            id: record.id.clone(),
                            status: record.status,
                        });
                    }
                }
                for record in records {
                    if record.belongs_to(self.context.key()) {
                        self.grades_by_student
                            .insert(record.student_id.clone(), record);
                    }
                }
                if let Some(e) = conflict {
                    warn!(error = %e, created, "bulk save hit a locked grade");
                    self.scheduler.mark_failed();
                    return Err(e);
                }
                if self.pending.is_empty() {
                    self.scheduler.cancel();
                }
                self.scheduler.mark_saved(self.clock.now_ms());
                info!(created, pending = self.pending.len(), "grades saved");
                Ok(SaveOutcome::Saved {
                    created,
                    updated: 0,
                })
            }
            Err(e) => {
                warn!(error = %e, pending = self.pending.len(), "bulk save failed");
                self.scheduler.mark_failed();
                Err(e.into())
            }
        }
    }

    /// Checks or unchecks one draft row for `SubmissionMode::Selected`.
    pub fn toggle_selection(&mut self, grade_id: &str, selected: bool) -> Result<(), WorkflowError> {
        let grade = self
            .grades_by_student
            .values()
            .find(|g| g.id == grade_id)
            .ok_or_else(|| WorkflowError::NotFound(format!("grade {grade_id}")))?;
        if grade.status != GradeStatus::Draft {
            return Err(WorkflowError::ImmutableGrade {
                id: grade.id.clone(),
                status: grade.status,
            });
        }
        if selected {
            self.selection.insert(grade_id.to_string());
        } else {
            self.selection.remove(grade_id);
        }
        Ok(())
    }

    /// Opens the submit confirmation once the roster is complete and every
    /// buffered value has become a draft.
    pub fn handle_submit_for_validation(
        &mut self,
        store: &dyn GradeStore,
        mode: SubmissionMode,
    ) -> Result<usize, WorkflowError> {
        if !self.is_complete() {
            return Err(WorkflowError::IncompleteGrades);
        }

        if !self.pending.is_empty() {
            if self.is_missing_teacher() {
                return Err(WorkflowError::MissingTeacher);
            }
            self.scheduler.cancel();
            match self.flush(store)? {
                SaveOutcome::InFlight => return Err(WorkflowError::SaveInProgress),
                SaveOutcome::Blocked => return Err(WorkflowError::MissingTeacher),
                _ => {}
            }
        }

        let grade_ids: Vec<String> = self
            .grades_by_student
            .values()
            .filter(|g| g.status == GradeStatus::Draft)
            .filter(|g| match mode {
                SubmissionMode::AllDrafts => true,
                SubmissionMode::Selected => self.selection.contains(&g.id),
            })
            .map(|g| g.id.clone())
            .collect();
        if grade_ids.is_empty() {
            return Err(WorkflowError::NothingToSubmit);
        }

        let count = grade_ids.len();
        self.confirmation = PendingConfirmation::Submit { grade_ids, count };
        Ok(count)
    }

    pub fn confirm_submit(&mut self, store: &dyn GradeStore) -> Result<usize, WorkflowError> {
        let PendingConfirmation::Submit { grade_ids, .. } = &self.confirmation else {
            return Err(WorkflowError::NoConfirmation("submit"));
        };
        let grade_ids = grade_ids.clone();

        let moved = store.submit_grades_for_validation(&grade_ids)?;
        info!(requested = grade_ids.len(), moved, "grades submitted for validation");

        match self.reload_grades(store) {
            Ok(()) => {}
            Err(e) => {
                warn!(error = %e, "reload after submit failed; marking locally");
                for g in self.grades_by_student.values_mut() {
                    if g.status == GradeStatus::Draft && grade_ids.contains(&g.id) {
                        g.status = GradeStatus::Submitted;
                    }
                }
            }
        }

        self.selection.clear();
        self.confirmation = PendingConfirmation::None;
        Ok(moved)
    }

    /// Re-reads the persisted grades of the evaluation, e.g. after an
    /// approval step changed their status.
    pub fn reload_grades(&mut self, store: &dyn GradeStore) -> Result<(), WorkflowError> {
        self.grades_by_student = store
            .grades_for_context(self.context.key())?
            .into_iter()
            .map(|g| (g.student_id.clone(), g))
            .collect();
        self.selection
            .retain(|id| self.grades_by_student.values().any(|g| &g.id == id));
        Ok(())
    }

    /// Starting over needs a confirmation whenever something would be lost.
    pub fn handle_new_evaluation(&mut self) -> NewEvaluationOutcome {
        if self.pending.is_empty() && self.grades_by_student.is_empty() {
            return NewEvaluationOutcome::Proceed;
        }
        self.confirmation = PendingConfirmation::Reset {
            pending_count: self.pending.len(),
            persisted_count: self.grades_by_student.len(),
        };
        NewEvaluationOutcome::ConfirmationRequired
    }

    /// Deletes the drafts of this evaluation and drops the buffer. Grades
    /// already past `draft` are kept and counted as retained.
    pub fn confirm_reset(&mut self, store: &dyn GradeStore) -> Result<ResetReport, WorkflowError> {
        if !matches!(self.confirmation, PendingConfirmation::Reset { .. }) {
            return Err(WorkflowError::NoConfirmation("reset"));
        }

        // An outstanding bulk create may have landed rows the session has not seen.
        let deleted = if self.grades_by_student.is_empty() && self.in_flight.is_none() {
            0
        } else {
            store.delete_draft_grades(self.context.key())?
        };
        self.grades_by_student
            .retain(|_, g| g.status != GradeStatus::Draft);
        let retained = self.grades_by_student.len();

        self.pending = PendingChanges::new(self.context.key().clone());
        self.inputs.clear();
        self.selection.clear();
        self.scheduler.cancel();
        self.generation += 1;
        self.in_flight = None;
        self.confirmation = PendingConfirmation::None;

        info!(deleted, retained, generation = self.generation, "evaluation reset");
        Ok(ResetReport { deleted, retained })
    }

    /// Teachers qualified for the subject, optionally narrowed by name.
    pub fn qualified_teachers(
        &self,
        store: &dyn GradeStore,
        search: Option<String>,
    ) -> Result<Vec<Teacher>, WorkflowError> {
        Ok(store.list_teachers(&TeacherFilter {
            subject_id: Some(self.context.key().subject_id.clone()),
            search,
        })?)
    }

    pub fn request_assignment(
        &mut self,
        store: &dyn GradeStore,
        teacher_id: &str,
    ) -> Result<AssignOutcome, WorkflowError> {
        let teacher = self
            .qualified_teachers(store, None)?
            .into_iter()
            .find(|t| t.id == teacher_id)
            .ok_or_else(|| WorkflowError::TeacherNotQualified(teacher_id.to_string()))?;

        match self.context.teacher_id() {
            None => {
                self.apply_assignment(store, &teacher.id)?;
                Ok(AssignOutcome::Assigned)
            }
            Some(current) if current == teacher.id => Ok(AssignOutcome::Unchanged),
            Some(current) => {
                self.confirmation = PendingConfirmation::AssignTeacher {
                    previous_teacher_id: current.to_string(),
                    teacher_id: teacher.id,
                    teacher_name: teacher.name,
                };
                Ok(AssignOutcome::ConfirmationRequired)
            }
        }
    }

    pub fn confirm_assignment(&mut self, store: &dyn GradeStore) -> Result<(), WorkflowError> {
        let PendingConfirmation::AssignTeacher { teacher_id, .. } = &self.confirmation else {
            return Err(WorkflowError::NoConfirmation("teacher assignment"));
        };
        let teacher_id = teacher_id.clone();
        self.apply_assignment(store, &teacher_id)?;
        self.confirmation = PendingConfirmation::None;
        Ok(())
    }

    fn apply_assignment(&mut self, store: &dyn GradeStore, teacher_id: &str) -> Result<(), WorkflowError> {
        let key = self.context.key();
        store.assign_teacher(&key.class_id, &key.subject_id, teacher_id)?;
        self.context = self.context.with_teacher(teacher_id);
        if !self.pending.is_empty() {
            self.scheduler.arm(self.clock.now_ms());
        }
        info!(teacher_id, pending = self.pending.len(), "teacher assigned");
        Ok(())
    }

    /// Dismisses the active dialog. Returns false when none was open.
    pub fn cancel_confirmation(&mut self) -> bool {
        let was_open = self.confirmation != PendingConfirmation::None;
        self.confirmation = PendingConfirmation::None;
        was_open
    }

    /// Teardown without flushing. Returns how many buffered values are dropped.
    pub fn close(&mut self) -> usize {
        self.scheduler.cancel();
        self.generation += 1;
        self.in_flight = None;
        let dropped = self.pending.len();
        if dropped > 0 {
            warn!(dropped, "grade entry closed with unsaved values");
        }
        dropped
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let stats = self.statistics();
        let mut grades: Vec<GradeRecord> = self.grades_by_student.values().cloned().collect();
        grades.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        SessionSnapshot {
            context: self.context.clone(),
            subject_name: self.subject_name.clone(),
            generation: self.generation,
            students: self.roster.clone(),
            grades,
            pending: self
                .pending
                .iter()
                .map(|(s, v)| (s.to_string(), v.get()))
                .collect(),
            input_errors: self
                .inputs
                .iter()
                .filter_map(|(s, i)| i.error().map(|e| (s.clone(), e.to_string())))
                .collect(),
            statistics: stats.into(),
            pass_rate: stats.pass_rate(),
            auto_save_status: self.scheduler.status(),
            is_complete: self.is_complete(),
            is_missing_teacher: self.is_missing_teacher(),
            confirmation: self.confirmation.clone(),
            selection: self.selection.iter().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autosave::ManualClock;
    use crate::db::{open_in_memory, ReviewDecision, SqliteStore};
    use crate::grade::GradeType;
    use crate::store::ClassSubject;
    use chrono::NaiveDate;
    use std::cell::Cell;

    const DELAY: u64 = 30_000;
    const DISPLAY: u64 = 3_000;

    /// Wraps the real store and fails chosen calls on demand.
    struct FlakyStore {
        inner: SqliteStore,
        fail_bulk: Cell<bool>,
        fail_update: Cell<bool>,
        fail_delete: Cell<bool>,
        bulk_calls: Cell<usize>,
        update_calls: Cell<usize>,
    }

    impl FlakyStore {
        fn down() -> StoreError {
            StoreError::Db(rusqlite::Error::SqliteFailure(
                rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_IOERR),
                Some("disk I/O error".to_string()),
            ))
        }
    }

    impl GradeStore for FlakyStore {
        fn update_grade(&self, id: &str, value: GradeValue) -> Result<GradeRecord, StoreError> {
            self.update_calls.set(self.update_calls.get() + 1);
            if self.fail_update.get() {
                return Err(Self::down());
            }
            self.inner.update_grade(id, value)
        }
        fn create_bulk_grades(
            &self,
            ctx: &EvaluationContext,
            grades: &[NewGrade],
        ) -> Result<Vec<GradeRecord>, StoreError> {
            self.bulk_calls.set(self.bulk_calls.get() + 1);
            if self.fail_bulk.get() {
                return Err(Self::down());
            }
            self.inner.create_bulk_grades(ctx, grades)
        }
        fn submit_grades_for_validation(&self, ids: &[String]) -> Result<usize, StoreError> {
            self.inner.submit_grades_for_validation(ids)
        }
        fn delete_draft_grades(&self, key: &ContextKey) -> Result<usize, StoreError> {
            if self.fail_delete.get() {
                return Err(Self::down());
            }
            self.inner.delete_draft_grades(key)
        }
        fn assign_teacher(&self, c: &str, s: &str, t: &str) -> Result<(), StoreError> {
            self.inner.assign_teacher(c, s, t)
        }
        fn list_teachers(&self, f: &TeacherFilter) -> Result<Vec<Teacher>, StoreError> {
            self.inner.list_teachers(f)
        }
        fn list_class_subjects(&self, class_id: &str) -> Result<Vec<ClassSubject>, StoreError> {
            self.inner.list_class_subjects(class_id)
        }
        fn list_students(&self, class_id: &str) -> Result<Vec<Student>, StoreError> {
            self.inner.list_students(class_id)
        }
        fn grades_for_context(&self, key: &ContextKey) -> Result<Vec<GradeRecord>, StoreError> {
            self.inner.grades_for_context(key)
        }
    }

    struct Harness {
        store: FlakyStore,
        clock: ManualClock,
        key: ContextKey,
        students: Vec<String>,
        teacher_id: String,
        other_teacher_id: String,
    }

    fn harness(with_teacher: bool) -> Harness {
        let store = SqliteStore::new(open_in_memory().expect("db"));
        let class_id = store.create_class("5e B").expect("class");
        let subject_id = store.create_subject("Physique").expect("subject");
        let teacher = store
            .create_teacher("A. Traore", std::slice::from_ref(&subject_id))
            .expect("teacher");
        let other = store
            .create_teacher("B. Kone", std::slice::from_ref(&subject_id))
            .expect("teacher");
        store
            .upsert_class_subject(
                &class_id,
                &subject_id,
                with_teacher.then_some(teacher.id.as_str()),
                2,
            )
            .expect("class subject");
        let students = ["Awa", "Ibrahim", "Salif"]
            .iter()
            .map(|n| store.create_student(&class_id, n, "Diop", None).expect("student").id)
            .collect();
        let key = ContextKey::new(
            class_id,
            subject_id,
            "term-1",
            GradeType::Test,
            Some("Chapter 3"),
            NaiveDate::from_ymd_opt(2025, 3, 10).expect("date"),
        );
        Harness {
            store: FlakyStore {
                inner: store,
                fail_bulk: Cell::new(false),
                fail_update: Cell::new(false),
                fail_delete: Cell::new(false),
                bulk_calls: Cell::new(0),
                update_calls: Cell::new(0),
            },
            clock: ManualClock::default(),
            key,
            students,
            teacher_id: teacher.id,
            other_teacher_id: other.id,
        }
    }

    fn open(h: &Harness) -> GradeEntrySession {
        GradeEntrySession::open(
            &h.store,
            h.key.clone(),
            1,
            AutoSaveScheduler::new(DELAY, DISPLAY),
            Rc::new(h.clock.clone()),
        )
        .expect("open session")
    }

    fn enter_all(h: &Harness, s: &mut GradeEntrySession, values: [&str; 3]) {
        for (student, raw) in h.students.iter().zip(values) {
            s.handle_grade_change(&h.store, student, raw).expect("change");
        }
    }

    #[test]
    fn happy_path_enter_save_submit() {
        let h = harness(true);
        let mut s = open(&h);
        enter_all(&h, &mut s, ["18", "9", "14"]);

        let stats = s.statistics();
        assert_eq!(stats.count, 3);
        assert_eq!(round_2(stats.average), 13.67);
        assert_eq!((stats.min, stats.max), (9.0, 18.0));
        assert_eq!((stats.below10, stats.above15), (1, 1));
        assert!(s.is_complete());

        let outcome = s.handle_save_pending(&h.store).expect("save");
        assert_eq!(outcome, SaveOutcome::Saved { created: 3, updated: 0 });
        assert!(s.pending().is_empty());
        assert_eq!(s.auto_save_status(), AutoSaveStatus::Saved);
        assert!(h.students.iter().all(|id| s.grade_for(id).map(|g| g.status) == Some(GradeStatus::Draft)));

        assert_eq!(s.handle_submit_for_validation(&h.store, SubmissionMode::AllDrafts).expect("submit"), 3);
        assert!(matches!(s.confirmation(), PendingConfirmation::Submit { count: 3, .. }));
        assert_eq!(s.confirm_submit(&h.store).expect("confirm"), 3);
        assert_eq!(s.confirmation(), &PendingConfirmation::None);
        assert!(h.students.iter().all(|id| s.grade_for(id).map(|g| g.status) == Some(GradeStatus::Submitted)));

        // Statistics stay stable across the save.
        assert_eq!(s.statistics().count, 3);
    }

    #[test]
    fn saved_indicator_reverts_to_idle() {
        let h = harness(true);
        let mut s = open(&h);
        s.handle_grade_change(&h.store, &h.students[0], "12").expect("change");
        s.handle_save_pending(&h.store).expect("save");
        assert_eq!(s.auto_save_status(), AutoSaveStatus::Saved);

        h.clock.advance(DISPLAY - 1);
        assert!(s.tick(&h.store).is_none());
        assert_eq!(s.auto_save_status(), AutoSaveStatus::Saved);
        h.clock.advance(1);
        s.tick(&h.store);
        assert_eq!(s.auto_save_status(), AutoSaveStatus::Idle);
    }

    #[test]
    fn rapid_edits_produce_one_flush_with_latest_value() {
        let h = harness(true);
        let mut s = open(&h);
        let student = &h.students[0];
        for raw in ["10", "11", "12.5", "13.75"] {
            s.handle_grade_change(&h.store, student, raw).expect("change");
            h.clock.advance(1_000);
        }

        h.clock.advance(DELAY - 1_001);
        assert!(s.tick(&h.store).is_none());
        assert_eq!(h.store.bulk_calls.get(), 0);

        h.clock.advance(1);
        let fired = s.tick(&h.store).expect("flush due").expect("flush ok");
        assert_eq!(fired, SaveOutcome::Saved { created: 1, updated: 0 });
        assert_eq!(h.store.bulk_calls.get(), 1);
        assert_eq!(s.grade_for(student).map(|g| g.value), Some(13.75));

        h.clock.advance(DELAY * 2);
        s.tick(&h.store);
        assert_eq!(h.store.bulk_calls.get(), 1);
    }

    #[test]
    fn clearing_the_last_value_cancels_the_timer() {
        let h = harness(true);
        let mut s = open(&h);
        s.handle_grade_change(&h.store, &h.students[0], "7").expect("change");
        assert!(s.next_wake().is_some());
        assert_eq!(
            s.handle_grade_change(&h.store, &h.students[0], " ").expect("clear"),
            ChangeOutcome::Cleared
        );
        assert!(s.pending().is_empty());
        assert_eq!(s.next_wake(), None);
    }

    #[test]
    fn invalid_input_is_kept_with_its_error_and_never_buffered() {
        let h = harness(true);
        let mut s = open(&h);
        let err = s
            .handle_grade_change(&h.store, &h.students[0], "12.333")
            .unwrap_err();
        assert_eq!(err.code(), "invalid_grade");
        assert!(s.pending().is_empty());
        let snap = s.snapshot();
        assert!(snap.input_errors.contains_key(&h.students[0]));

        s.handle_grade_change(&h.store, &h.students[0], "12.25").expect("valid");
        assert!(s.snapshot().input_errors.is_empty());
    }

    #[test]
    fn failed_save_keeps_buffer_and_error_sticks() {
        let h = harness(true);
        let mut s = open(&h);
        enter_all(&h, &mut s, ["18", "9", "14"]);

        h.store.fail_bulk.set(true);
        let err = s.handle_save_pending(&h.store).unwrap_err();
        assert_eq!(err.code(), "persistence_failed");
        assert_eq!(s.pending().len(), 3);
        assert_eq!(s.auto_save_status(), AutoSaveStatus::Error);

        h.clock.advance(DISPLAY * 10);
        s.tick(&h.store);
        assert_eq!(s.auto_save_status(), AutoSaveStatus::Error);

        h.store.fail_bulk.set(false);
        s.handle_save_pending(&h.store).expect("retry");
        assert!(s.pending().is_empty());
        assert_eq!(s.auto_save_status(), AutoSaveStatus::Saved);
    }

    #[test]
    fn blocked_save_resumes_after_quick_assign() {
        let h = harness(false);
        let mut s = open(&h);
        assert!(s.is_missing_teacher());

        s.handle_grade_change(&h.store, &h.students[0], "15").expect("change");
        assert_eq!(s.statistics().count, 1);
        assert_eq!(s.handle_save_pending(&h.store).expect("save"), SaveOutcome::Blocked);
        assert_eq!(s.auto_save_status(), AutoSaveStatus::Idle);
        assert_eq!(h.store.bulk_calls.get(), 0);

        // Auto-save is blocked the same way.
        s.handle_grade_change(&h.store, &h.students[1], "11").expect("change");
        h.clock.advance(DELAY);
        assert_eq!(s.tick(&h.store).expect("due").expect("ok"), SaveOutcome::Blocked);
        assert_eq!(s.pending().len(), 2);

        let qualified = s.qualified_teachers(&h.store, None).expect("teachers");
        assert_eq!(qualified.len(), 2);
        assert_eq!(
            s.request_assignment(&h.store, &h.teacher_id).expect("assign"),
            AssignOutcome::Assigned
        );
        assert!(!s.is_missing_teacher());

        // Re-armed without re-entry.
        h.clock.advance(DELAY);
        let saved = s.tick(&h.store).expect("due").expect("ok");
        assert_eq!(saved, SaveOutcome::Saved { created: 2, updated: 0 });
        assert!(s.pending().is_empty());
    }

    #[test]
    fn changing_an_assignment_needs_confirmation() {
        let h = harness(true);
        let mut s = open(&h);
        assert_eq!(
            s.request_assignment(&h.store, &h.teacher_id).expect("same"),
            AssignOutcome::Unchanged
        );
        assert_eq!(
            s.request_assignment(&h.store, &h.other_teacher_id).expect("other"),
            AssignOutcome::ConfirmationRequired
        );
        assert_eq!(s.context().teacher_id(), Some(h.teacher_id.as_str()));

        assert!(s.cancel_confirmation());
        assert_eq!(s.confirm_assignment(&h.store).unwrap_err().code(), "no_confirmation");

        s.request_assignment(&h.store, &h.other_teacher_id).expect("other");
        s.confirm_assignment(&h.store).expect("confirm");
        assert_eq!(s.context().teacher_id(), Some(h.other_teacher_id.as_str()));

        let unqualified = h.store.inner.create_teacher("C. Sow", &[]).expect("teacher");
        assert_eq!(
            s.request_assignment(&h.store, &unqualified.id).unwrap_err().code(),
            "teacher_not_qualified"
        );
    }

    #[test]
    fn rejected_grade_goes_through_single_update() {
        let h = harness(true);
        let mut s = open(&h);
        enter_all(&h, &mut s, ["18", "9", "14"]);
        s.handle_save_pending(&h.store).expect("save");
        s.handle_submit_for_validation(&h.store, SubmissionMode::AllDrafts).expect("submit");
        s.confirm_submit(&h.store).expect("confirm");

        let target = s.grade_for(&h.students[1]).expect("grade").id.clone();
        h.store
            .inner
            .review_grades(
                std::slice::from_ref(&target),
                &ReviewDecision::Reject {
                    reason: "Note incorrecte".to_string(),
                },
                None,
            )
            .expect("reject");

        let mut s = open(&h);
        let rejected = s.grade_for(&h.students[1]).expect("grade");
        assert_eq!(rejected.status, GradeStatus::Rejected);
        assert_eq!(rejected.rejection_reason.as_deref(), Some("Note incorrecte"));

        let bulk_before = h.store.bulk_calls.get();
        assert_eq!(
            s.handle_grade_change(&h.store, &h.students[1], "10.5").expect("edit"),
            ChangeOutcome::Updated
        );
        assert_eq!(h.store.bulk_calls.get(), bulk_before);
        assert_eq!(h.store.update_calls.get(), 1);
        let edited = s.grade_for(&h.students[1]).expect("grade");
        assert_eq!(edited.value, 10.5);
        assert_eq!(edited.status, GradeStatus::Rejected);

        // Submitted grades are refused before reaching the store.
        let err = s
            .handle_grade_change(&h.store, &h.students[0], "1")
            .unwrap_err();
        assert_eq!(err.code(), "immutable_grade");
        assert_eq!(h.store.update_calls.get(), 1);
    }

    #[test]
    fn failed_update_sets_error_status() {
        let h = harness(true);
        let mut s = open(&h);
        s.handle_grade_change(&h.store, &h.students[0], "12").expect("change");
        s.handle_save_pending(&h.store).expect("save");

        h.store.fail_update.set(true);
        let err = s
            .handle_grade_change(&h.store, &h.students[0], "13")
            .unwrap_err();
        assert_eq!(err.code(), "persistence_failed");
        assert_eq!(s.auto_save_status(), AutoSaveStatus::Error);
        assert_eq!(s.grade_for(&h.students[0]).map(|g| g.value), Some(12.0));
    }

    #[test]
    fn submission_requires_a_complete_roster() {
        let h = harness(true);
        let mut s = open(&h);
        s.handle_grade_change(&h.store, &h.students[0], "12").expect("change");
        s.handle_grade_change(&h.store, &h.students[1], "8").expect("change");
        let err = s
            .handle_submit_for_validation(&h.store, SubmissionMode::AllDrafts)
            .unwrap_err();
        assert_eq!(err.code(), "incomplete_grades");
        assert_eq!(h.store.bulk_calls.get(), 0);
        assert_eq!(s.confirmation(), &PendingConfirmation::None);
    }

    #[test]
    fn submission_flushes_buffer_first() {
        let h = harness(true);
        let mut s = open(&h);
        enter_all(&h, &mut s, ["20", "0", "10"]);
        let count = s
            .handle_submit_for_validation(&h.store, SubmissionMode::AllDrafts)
            .expect("submit");
        assert_eq!(count, 3);
        assert!(s.pending().is_empty());
        assert_eq!(h.store.bulk_calls.get(), 1);
    }

    #[test]
    fn selected_mode_submits_only_checked_drafts() {
        let h = harness(true);
        let mut s = open(&h);
        enter_all(&h, &mut s, ["11", "12", "13"]);
        s.handle_save_pending(&h.store).expect("save");

        assert_eq!(
            s.handle_submit_for_validation(&h.store, SubmissionMode::Selected)
                .unwrap_err()
                .code(),
            "nothing_to_submit"
        );

        let picked = s.grade_for(&h.students[2]).expect("grade").id.clone();
        s.toggle_selection(&picked, true).expect("select");
        assert_eq!(
            s.handle_submit_for_validation(&h.store, SubmissionMode::Selected).expect("submit"),
            1
        );
        s.confirm_submit(&h.store).expect("confirm");
        assert!(s.snapshot().selection.is_empty());
        assert_eq!(s.grade_for(&h.students[2]).map(|g| g.status), Some(GradeStatus::Submitted));
        assert_eq!(s.grade_for(&h.students[0]).map(|g| g.status), Some(GradeStatus::Draft));

        assert_eq!(s.toggle_selection(&picked, true).unwrap_err().code(), "immutable_grade");
    }

    #[test]
    fn reset_deletes_drafts_and_keeps_submitted() {
        let h = harness(true);
        let mut s = open(&h);
        enter_all(&h, &mut s, ["11", "12", "13"]);
        s.handle_save_pending(&h.store).expect("save");
        let keep = s.grade_for(&h.students[0]).expect("grade").id.clone();
        s.toggle_selection(&keep, true).expect("select");
        s.handle_submit_for_validation(&h.store, SubmissionMode::Selected).expect("submit");
        s.confirm_submit(&h.store).expect("confirm");

        s.handle_grade_change(&h.store, &h.students[1], "5").expect("update draft");
        assert_eq!(s.confirm_reset(&h.store).unwrap_err().code(), "no_confirmation");
        assert_eq!(s.handle_new_evaluation(), NewEvaluationOutcome::ConfirmationRequired);
        assert!(matches!(
            s.confirmation(),
            PendingConfirmation::Reset { persisted_count: 3, pending_count: 0 }
        ));

        let report = s.confirm_reset(&h.store).expect("reset");
        assert_eq!(report, ResetReport { deleted: 2, retained: 1 });
        assert!(s.pending().is_empty());
        assert_eq!(h.store.grades_for_context(&h.key).expect("list").len(), 1);
    }

    #[test]
    fn failed_reset_keeps_the_buffer() {
        let h = harness(true);
        let mut s = open(&h);
        s.handle_grade_change(&h.store, &h.students[0], "12").expect("change");
        s.handle_save_pending(&h.store).expect("save");
        s.handle_grade_change(&h.store, &h.students[1], "13").expect("change");

        s.handle_new_evaluation();
        h.store.fail_delete.set(true);
        assert!(s.confirm_reset(&h.store).is_err());
        assert_eq!(s.pending().len(), 1);
        assert!(matches!(s.confirmation(), PendingConfirmation::Reset { .. }));
    }

    #[test]
    fn empty_evaluation_proceeds_without_confirmation() {
        let h = harness(true);
        let mut s = open(&h);
        assert_eq!(s.handle_new_evaluation(), NewEvaluationOutcome::Proceed);
        assert_eq!(s.confirmation(), &PendingConfirmation::None);
    }

    #[test]
    fn stale_completion_is_ignored_after_reset() {
        let h = harness(true);
        let mut s = open(&h);
        s.handle_grade_change(&h.store, &h.students[0], "12").expect("change");

        let req = s.begin_save().expect("request");
        assert!(s.begin_save().is_none());
        let result = h.store.create_bulk_grades(req.context(), req.grades());

        s.handle_new_evaluation();
        let report = s.confirm_reset(&h.store).expect("reset");
        assert_eq!(report.deleted, 1);
        assert_eq!(s.finish_save(req, result).expect("finish"), SaveOutcome::Stale);
        assert!(s.grade_for(&h.students[0]).is_none());
        assert!(s.pending().is_empty());
        assert!(h.store.grades_for_context(&h.key).expect("list").is_empty());
    }

    #[test]
    fn edit_during_flight_stays_buffered_and_updates_later() {
        let h = harness(true);
        let mut s = open(&h);
        s.handle_grade_change(&h.store, &h.students[0], "12").expect("change");

        let req = s.begin_save().expect("request");
        assert_eq!(s.handle_save_pending(&h.store).expect("busy"), SaveOutcome::InFlight);
        s.handle_grade_change(&h.store, &h.students[0], "14").expect("edit in flight");
        let result = h.store.create_bulk_grades(req.context(), req.grades());
        s.finish_save(req, result).expect("finish");

        assert_eq!(s.pending().get(&h.students[0]).map(GradeValue::get), Some(14.0));
        assert_eq!(s.grade_for(&h.students[0]).map(|g| g.value), Some(12.0));
        let stats = s.statistics();
        assert_eq!(stats.count, 1);
        assert_eq!(stats.average, 14.0);
        assert_eq!(stats.above15, 0);

        let outcome = s.handle_save_pending(&h.store).expect("save");
        assert_eq!(outcome, SaveOutcome::Saved { created: 0, updated: 1 });
        assert_eq!(s.grade_for(&h.students[0]).map(|g| g.value), Some(14.0));
        assert!(s.pending().is_empty());
    }

    #[test]
    fn buffered_value_wins_over_persisted_in_statistics() {
        let h = harness(true);
        let mut s = open(&h);
        s.handle_grade_change(&h.store, &h.students[0], "12").expect("change");
        let req = s.begin_save().expect("request");
        s.handle_grade_change(&h.store, &h.students[0], "4").expect("edit in flight");
        let result = h.store.create_bulk_grades(req.context(), req.grades());
        s.finish_save(req, result).expect("finish");

        let stats = s.statistics();
        assert_eq!((stats.count, stats.average), (1, 4.0));
        assert_eq!(stats.below10, 1);
        assert_eq!(stats.pass_rate(), 0);
    }

    #[test]
    fn row_locked_by_another_session_keeps_the_edit_buffered() {
        let h = harness(true);
        let mut s = open(&h);

        // Another session saves and submits the same evaluation first.
        let ctx = EvaluationContext::new(h.key.clone(), Some(h.teacher_id.clone()), 1)
            .expect("ctx");
        let foreign = h
            .store
            .inner
            .create_bulk_grades(
                &ctx,
                &[NewGrade {
                    student_id: h.students[0].clone(),
                    value: GradeValue::new(12.0).expect("grade"),
                }],
            )
            .expect("foreign bulk");
        h.store
            .inner
            .submit_grades_for_validation(&[foreign[0].id.clone()])
            .expect("foreign submit");

        s.handle_grade_change(&h.store, &h.students[0], "3").expect("change");
        s.handle_grade_change(&h.store, &h.students[1], "15").expect("change");
        let err = s.handle_save_pending(&h.store).expect_err("locked row");
        assert_eq!(err.code(), "immutable_grade");
        assert_eq!(s.auto_save_status(), AutoSaveStatus::Error);
        assert_eq!(s.pending().get(&h.students[0]).map(GradeValue::get), Some(3.0));
        assert_eq!(s.pending().get(&h.students[1]), None);
        assert_eq!(
            s.grade_for(&h.students[0]).map(|g| (g.value, g.status)),
            Some((12.0, GradeStatus::Submitted))
        );
        assert_eq!(
            s.grade_for(&h.students[1]).map(|g| (g.value, g.status)),
            Some((15.0, GradeStatus::Draft))
        );
        let stored = h.store.inner.get_grade(&foreign[0].id).expect("stored");
        assert_eq!((stored.value, stored.status), (12.0, GradeStatus::Submitted));

        // Retrying does not reach the store and keeps failing.
        let updates = h.store.update_calls.get();
        let err = s.handle_save_pending(&h.store).expect_err("still locked");
        assert_eq!(err.code(), "immutable_grade");
        assert_eq!(h.store.update_calls.get(), updates);

        assert_eq!(
            s.handle_grade_change(&h.store, &h.students[0], "").expect("clear"),
            ChangeOutcome::Cleared
        );
        assert_eq!(s.handle_save_pending(&h.store).expect("save"), SaveOutcome::Nothing);
    }

    #[test]
    fn close_drops_the_buffer_without_saving() {
        let h = harness(true);
        let mut s = open(&h);
        s.handle_grade_change(&h.store, &h.students[0], "11").expect("change");
        s.handle_grade_change(&h.store, &h.students[1], "13").expect("change");
        assert!(s.next_wake().is_some());

        assert_eq!(s.close(), 2);
        assert_eq!(s.next_wake(), None);
        h.clock.advance(DELAY + 1);
        assert!(s.tick(&h.store).is_none());
        assert_eq!(h.store.bulk_calls.get(), 0);
        assert!(h.store.grades_for_context(&h.key).expect("list").is_empty());
    }

    #[test]
    fn completeness_boundary() {
        let h = harness(true);
        let mut s = open(&h);
        let empty = PendingChanges::new(h.key.clone());
        assert!(!is_complete(&[], &BTreeMap::new(), &empty));

        s.handle_grade_change(&h.store, &h.students[0], "12").expect("change");
        s.handle_save_pending(&h.store).expect("save");
        s.handle_grade_change(&h.store, &h.students[1], "15").expect("change");
        assert!(!s.is_complete());
        s.handle_grade_change(&h.store, &h.students[2], "0").expect("change");
        assert!(s.is_complete());
    }

    #[test]
    fn snapshot_reports_rounded_statistics() {
        let h = harness(true);
        let mut s = open(&h);
        enter_all(&h, &mut s, ["18", "9", "14"]);
        let snap = s.snapshot();
        assert_eq!(snap.statistics.average, 13.67);
        assert_eq!(snap.pass_rate, 67);
        assert_eq!(snap.pending.len(), 3);
        assert!(snap.is_complete);
        assert_eq!(snap.subject_name.as_deref(), Some("Physique"));

        let json = serde_json::to_value(&snap).expect("json");
        assert_eq!(json["autoSaveStatus"], "idle");
        assert_eq!(json["confirmation"]["kind"], "none");
        assert_eq!(json["context"]["type"], "test");
    }
}
