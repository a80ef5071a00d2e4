//! Student roster helpers
//!
//! The dashboard owns the student records; these helpers only read them to
//! decide who to enroll, who gets which SMS, and which student a fingerprint
//! scan belongs to.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::protocol::{SmsRecipient, SmsStatus};

/// Fingerprint field value of students without an enrolled finger
pub const NOT_ENROLLED: &str = "NOT_ENROLLED";

/// Highest sensor slot of the fingerprint module
pub const MAX_FINGERPRINT_ID: u32 = 127;

/// Attendance mark stored per date
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttendanceMark {
    Present,
    Absent,
}

impl From<AttendanceMark> for SmsStatus {
    fn from(mark: AttendanceMark) -> Self {
        match mark {
            AttendanceMark::Present => SmsStatus::Present,
            AttendanceMark::Absent => SmsStatus::Absent,
        }
    }
}

/// Student record as stored by the dashboard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentRecord {
    /// Dashboard document id
    pub id: String,
    /// Display name
    pub name: String,
    /// Parent phone number
    pub phone: String,
    /// Decimal sensor slot, or [`NOT_ENROLLED`]
    #[serde(rename = "fingerprintID", default = "not_enrolled")]
    pub fingerprint_id: String,
    /// Class or section label
    #[serde(default)]
    pub class_name: String,
    /// Marks keyed by `YYYY-MM-DD`
    #[serde(default)]
    pub attendance: BTreeMap<String, AttendanceMark>,
    /// Roll number within the class
    #[serde(default)]
    pub roll_no: u32,
}

fn not_enrolled() -> String {
    NOT_ENROLLED.to_string()
}

/// Attendance key for a date (`YYYY-MM-DD`)
pub fn date_key(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

impl StudentRecord {
    /// Sensor slot, if the student has an enrolled finger
    pub fn fingerprint_slot(&self) -> Option<u32> {
        self.fingerprint_id.trim().parse().ok()
    }

    pub fn needs_enrollment(&self) -> bool {
        self.fingerprint_slot().is_none()
    }

    pub fn mark_on(&self, date: NaiveDate) -> Option<AttendanceMark> {
        self.attendance.get(&date_key(date)).copied()
    }

    pub fn set_mark(&mut self, date: NaiveDate, mark: AttendanceMark) {
        self.attendance.insert(date_key(date), mark);
    }
}

/// Students without an enrolled fingerprint, in roster order
pub fn students_needing_enrollment(students: &[StudentRecord]) -> Vec<&StudentRecord> {
    students.iter().filter(|s| s.needs_enrollment()).collect()
}

/// Lowest free sensor slot in `1..=127`
pub fn next_fingerprint_id(students: &[StudentRecord]) -> Option<u32> {
    let used: HashSet<u32> = students.iter().filter_map(|s| s.fingerprint_slot()).collect();
    (1..=MAX_FINGERPRINT_ID).find(|id| !used.contains(id))
}

/// SMS batch for `date`: present if marked present, otherwise absent.
/// Students without a phone number are skipped.
pub fn build_sms_batch(students: &[StudentRecord], date: NaiveDate) -> Vec<SmsRecipient> {
    students
        .iter()
        .filter(|s| {
            let has_phone = !s.phone.trim().is_empty();
            if !has_phone {
                tracing::warn!("Skipping SMS for {}: no phone number", s.name);
            }
            has_phone
        })
        .map(|s| {
            let mark = s.mark_on(date).unwrap_or(AttendanceMark::Absent);
            SmsRecipient::new(mark.into(), s.name.clone(), s.phone.clone())
        })
        .collect()
}

/// Result of attributing one fingerprint scan
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ScanOutcome {
    /// First scan of the day for this student
    Marked { student_id: String, name: String },
    /// Student was already present
    AlreadyPresent { student_id: String, name: String },
    /// No student holds this sensor slot
    Unknown { fingerprint_id: u32 },
}

/// Scan attribution for one attendance date
#[derive(Debug, Clone)]
pub struct AttendanceSheet {
    date: NaiveDate,
    by_slot: HashMap<u32, (String, String)>,
    present: HashSet<String>,
    newly_marked: Vec<String>,
}

impl AttendanceSheet {
    pub fn new(students: &[StudentRecord], date: NaiveDate) -> Self {
        let mut by_slot = HashMap::new();
        for s in students {
            if let Some(slot) = s.fingerprint_slot() {
                if let Some((prev, _)) = by_slot.insert(slot, (s.id.clone(), s.name.clone())) {
                    tracing::warn!("Fingerprint #{} assigned to both {} and {}", slot, prev, s.id);
                }
            }
        }
        let present = students
            .iter()
            .filter(|s| s.mark_on(date) == Some(AttendanceMark::Present))
            .map(|s| s.id.clone())
            .collect();

        Self {
            date,
            by_slot,
            present,
            newly_marked: Vec::new(),
        }
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn present_count(&self) -> usize {
        self.present.len()
    }

    /// Attribute a scan to a student
    pub fn record_scan(&mut self, fingerprint_id: u32) -> ScanOutcome {
        let Some((student_id, name)) = self.by_slot.get(&fingerprint_id).cloned() else {
            return ScanOutcome::Unknown { fingerprint_id };
        };
        if self.present.insert(student_id.clone()) {
            self.newly_marked.push(student_id.clone());
            ScanOutcome::Marked { student_id, name }
        } else {
            ScanOutcome::AlreadyPresent { student_id, name }
        }
    }

    /// Write the marks recorded by this sheet back to the roster.
    /// Returns the number of students updated.
    pub fn apply_to(&self, students: &mut [StudentRecord]) -> usize {
        let mut updated = 0;
        for s in students.iter_mut() {
            if self.newly_marked.contains(&s.id) && s.mark_on(self.date) != Some(AttendanceMark::Present) {
                s.set_mark(self.date, AttendanceMark::Present);
                updated += 1;
            }
        }
        updated
    }
}
