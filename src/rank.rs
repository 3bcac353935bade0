use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Default pass mark per subject, out of the subject's full marks.
pub const DEFAULT_PASS_THRESHOLD: f64 = 33.0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectMark {
    pub name: String,
    pub marks: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoScholasticGrade {
    pub name: String,
    pub grade: String,
}

/// One exam-term result for one student. Derived fields (`total`, `percent`,
/// `pass_fail`, `failed_subjects`, `rank`) are never authoritative input;
/// they are rewritten by `recompute_derived` / `rerank_group`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRecord {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub father_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mother_name: Option<String>,
    pub roll_number: String,
    pub dob: String,
    pub class: String,
    pub section: String,
    pub exam_term: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub academic_session: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attendance: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discipline: Option<String>,
    pub full_marks: f64,
    pub subjects: Vec<SubjectMark>,
    #[serde(default)]
    pub co_scholastic: Vec<CoScholasticGrade>,
    #[serde(default)]
    pub total: f64,
    #[serde(default)]
    pub percent: f64,
    #[serde(default)]
    pub pass_fail: String,
    #[serde(default)]
    pub failed_subjects: i64,
    #[serde(default)]
    pub rank: i64,
}

/// Records sharing this triple are ranked against one another.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupKey {
    pub class: String,
    pub section: String,
    pub exam_term: String,
}

impl ResultRecord {
    pub fn group_key(&self) -> GroupKey {
        GroupKey {
            class: self.class.clone(),
            section: self.section.clone(),
            exam_term: self.exam_term.clone(),
        }
    }

    /// Natural identity within a group: one record per roll number per term.
    pub fn same_identity(&self, other: &ResultRecord) -> bool {
        self.id == other.id
            || (self.class == other.class
                && self.section == other.section
                && self.exam_term == other.exam_term
                && self.roll_number == other.roll_number)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RankPolicy {
    /// When set, failing members (any subject below `pass_threshold`) are
    /// assigned rank 0 and the passing members are ranked among themselves.
    pub exclude_failing: bool,
    pub pass_threshold: f64,
}

impl Default for RankPolicy {
    fn default() -> Self {
        Self {
            exclude_failing: false,
            pass_threshold: DEFAULT_PASS_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubjectIssue {
    pub subject: String,
    pub reason: String,
}

fn usable_marks(marks: f64) -> Option<f64> {
    if marks.is_finite() && marks >= 0.0 {
        Some(marks)
    } else {
        None
    }
}

fn is_failing(record: &ResultRecord, pass_threshold: f64) -> bool {
    record
        .subjects
        .iter()
        .any(|s| usable_marks(s.marks).unwrap_or(0.0) < pass_threshold)
}

/// Recomputes `total`, `percent`, `pass_fail`, and `failed_subjects` from the
/// record's own subjects and full-marks value. Pure; no peer access.
///
/// Malformed subject entries (non-finite or negative marks) are reset to 0
/// and reported back rather than aborting the computation. A non-positive
/// maximum (zero full marks or no subjects) yields percent 0.
pub fn recompute_derived(record: &mut ResultRecord, policy: &RankPolicy) -> Vec<SubjectIssue> {
    let mut issues = Vec::new();
    let mut total = 0.0_f64;
    let mut failed: i64 = 0;

    for subject in &mut record.subjects {
        let marks = match usable_marks(subject.marks) {
            Some(v) => v,
            None => {
                issues.push(SubjectIssue {
                    subject: subject.name.clone(),
                    reason: format!("marks value {} treated as 0", subject.marks),
                });
                subject.marks = 0.0;
                0.0
            }
        };
        total += marks;
        if marks < policy.pass_threshold {
            failed += 1;
        }
    }

    let max_possible = record.full_marks * record.subjects.len() as f64;
    record.total = total;
    record.percent = if max_possible > 0.0 {
        (total / max_possible) * 100.0
    } else {
        0.0
    };
    record.failed_subjects = failed;
    record.pass_fail = if failed == 0 && !record.subjects.is_empty() {
        "Pass".to_string()
    } else {
        "Fail".to_string()
    };

    issues
}

/// Ranks the full member set of one peer group.
///
/// Members are sorted by (percent descending, total descending) with a stable
/// sort, so members with identical (percent, total) retain their relative
/// input order; that ordering is the documented tie-break. Ranks are 1-based.
/// With `exclude_failing` set, failing members get rank 0 and the sort covers
/// passing members only.
///
/// Returns a new sequence (ranked members first, excluded members after);
/// the output order is not a storage attribute.
pub fn rerank_group(policy: &RankPolicy, members: Vec<ResultRecord>) -> Vec<ResultRecord> {
    let mut ranked: Vec<ResultRecord> = Vec::with_capacity(members.len());
    let mut excluded: Vec<ResultRecord> = Vec::new();

    for member in members {
        if policy.exclude_failing && is_failing(&member, policy.pass_threshold) {
            excluded.push(member);
        } else {
            ranked.push(member);
        }
    }

    ranked.sort_by(|a, b| {
        b.percent
            .partial_cmp(&a.percent)
            .unwrap_or(Ordering::Equal)
            .then(b.total.partial_cmp(&a.total).unwrap_or(Ordering::Equal))
    });

    for (i, member) in ranked.iter_mut().enumerate() {
        member.rank = (i + 1) as i64;
    }
    for member in excluded.iter_mut() {
        member.rank = 0;
    }

    ranked.extend(excluded);
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(roll: &str, marks: &[f64], full_marks: f64) -> ResultRecord {
        ResultRecord {
            id: format!("id-{}", roll),
            name: format!("Student {}", roll),
            father_name: None,
            mother_name: None,
            roll_number: roll.to_string(),
            dob: "2012-04-01".to_string(),
            class: "V".to_string(),
            section: "A".to_string(),
            exam_term: "First Term".to_string(),
            academic_session: None,
            attendance: None,
            discipline: None,
            full_marks,
            subjects: marks
                .iter()
                .enumerate()
                .map(|(i, m)| SubjectMark {
                    name: format!("Subject {}", i + 1),
                    marks: *m,
                })
                .collect(),
            co_scholastic: Vec::new(),
            total: 0.0,
            percent: 0.0,
            pass_fail: String::new(),
            failed_subjects: 0,
            rank: 0,
        }
    }

    fn derived(roll: &str, marks: &[f64], full_marks: f64) -> ResultRecord {
        let mut r = record(roll, marks, full_marks);
        recompute_derived(&mut r, &RankPolicy::default());
        r
    }

    #[test]
    fn derived_total_and_percent() {
        let r = derived("1", &[40.0, 30.0], 50.0);
        assert_eq!(r.total, 70.0);
        assert_eq!(r.percent, 70.0);
        assert_eq!(r.pass_fail, "Pass");
    }

    #[test]
    fn zero_full_marks_gives_percent_zero() {
        let r = derived("1", &[40.0, 30.0], 0.0);
        assert_eq!(r.total, 70.0);
        assert_eq!(r.percent, 0.0);
    }

    #[test]
    fn empty_subjects_gives_percent_zero_and_fail() {
        let r = derived("1", &[], 100.0);
        assert_eq!(r.total, 0.0);
        assert_eq!(r.percent, 0.0);
        assert_eq!(r.pass_fail, "Fail");
    }

    #[test]
    fn malformed_marks_count_as_zero_and_are_reported() {
        let mut r = record("1", &[80.0, f64::NAN, -5.0], 100.0);
        let issues = recompute_derived(&mut r, &RankPolicy::default());
        assert_eq!(r.total, 80.0);
        assert_eq!(issues.len(), 2);
        assert_eq!(issues[0].subject, "Subject 2");
        assert_eq!(issues[1].subject, "Subject 3");
        // Zeroed marks fall below the pass threshold.
        assert_eq!(r.failed_subjects, 2);
        assert_eq!(r.pass_fail, "Fail");
    }

    #[test]
    fn failed_subject_count_uses_threshold() {
        let r = derived("1", &[33.0, 32.9, 90.0], 100.0);
        assert_eq!(r.failed_subjects, 1);
        assert_eq!(r.pass_fail, "Fail");
    }

    #[test]
    fn rerank_orders_by_percent_then_total() {
        let members = vec![
            derived("1", &[50.0, 40.0], 100.0),
            derived("2", &[90.0, 80.0], 100.0),
            derived("3", &[70.0, 60.0], 100.0),
        ];
        let ranked = rerank_group(&RankPolicy::default(), members);
        let by_roll = |roll: &str| {
            ranked
                .iter()
                .find(|r| r.roll_number == roll)
                .map(|r| r.rank)
                .unwrap()
        };
        assert_eq!(by_roll("2"), 1);
        assert_eq!(by_roll("3"), 2);
        assert_eq!(by_roll("1"), 3);
    }

    #[test]
    fn stable_tie_break_preserves_input_order() {
        // Percents [90, 75, 90] in submission order: the first 90 stays
        // ahead of the second, so ranks come out [1, 3, 2].
        let members = vec![
            derived("1", &[90.0], 100.0),
            derived("2", &[75.0], 100.0),
            derived("3", &[90.0], 100.0),
        ];
        let ranked = rerank_group(&RankPolicy::default(), members);
        let by_roll = |roll: &str| {
            ranked
                .iter()
                .find(|r| r.roll_number == roll)
                .map(|r| r.rank)
                .unwrap()
        };
        assert_eq!(by_roll("1"), 1);
        assert_eq!(by_roll("2"), 3);
        assert_eq!(by_roll("3"), 2);
    }

    #[test]
    fn tie_break_is_deterministic_across_recomputation() {
        let members = vec![
            derived("1", &[90.0], 100.0),
            derived("2", &[90.0], 100.0),
        ];
        let once = rerank_group(&RankPolicy::default(), members.clone());
        let twice = rerank_group(&RankPolicy::default(), once.clone());
        assert_eq!(once, twice);
        assert_eq!(once[0].roll_number, "1");
        assert_eq!(once[0].rank, 1);
        assert_eq!(once[1].rank, 2);
    }

    #[test]
    fn fail_exclusion_assigns_rank_zero_and_ranks_the_rest() {
        let policy = RankPolicy {
            exclude_failing: true,
            pass_threshold: 33.0,
        };
        let members = vec![
            derived("1", &[80.0, 20.0], 100.0),
            derived("2", &[60.0, 70.0], 100.0),
            derived("3", &[90.0, 95.0], 100.0),
        ];
        let ranked = rerank_group(&policy, members);
        let by_roll = |roll: &str| {
            ranked
                .iter()
                .find(|r| r.roll_number == roll)
                .map(|r| r.rank)
                .unwrap()
        };
        assert_eq!(by_roll("1"), 0);
        assert_eq!(by_roll("3"), 1);
        assert_eq!(by_roll("2"), 2);
    }

    #[test]
    fn default_policy_ranks_failing_members_normally() {
        let members = vec![
            derived("1", &[80.0, 20.0], 100.0),
            derived("2", &[10.0, 15.0], 100.0),
        ];
        let ranked = rerank_group(&RankPolicy::default(), members);
        assert!(ranked.iter().all(|r| r.rank > 0));
    }
}
